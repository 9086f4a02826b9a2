use async_trait::async_trait;
use bytes::BytesMut;
use flowdock_config::ApiConfig;
use futures_util::StreamExt;
use reqwest::Client;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    Credentials, StreamConnection, StreamFrame, StreamTransport, TransportError,
};
use crate::ids::FlowId;

const FRAME_BUFFER: usize = 256;

/// Splits a chunked body into newline-delimited lines. Blank keep-alive
/// lines are dropped and a trailing `\r` is trimmed.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: BytesMut,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete, non-blank line.
    pub fn next_line(&mut self) -> Option<String> {
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line = self.buffer.split_to(newline + 1);
            line.truncate(line.len() - 1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }

            let text = String::from_utf8_lossy(&line);
            let text = text.trim();
            if !text.is_empty() {
                return Some(text.to_string());
            }
        }
        None
    }

    /// Whatever is left once the body has ended.
    pub fn remainder(&mut self) -> Option<String> {
        let rest = self.buffer.split();
        let text = String::from_utf8_lossy(&rest);
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }
}

/// Streaming channel over a long-lived chunked HTTP response.
#[derive(Debug, Clone)]
pub struct HttpStreamTransport {
    client: Client,
    stream_url: String,
    credentials: Credentials,
}

impl HttpStreamTransport {
    pub fn new(api: &ApiConfig, credentials: Credentials) -> Result<Self, TransportError> {
        // No overall timeout: the response body never finishes on its own.
        let client = Client::builder()
            .connect_timeout(api.request_timeout())
            .build()?;
        Ok(Self {
            client,
            stream_url: api.stream_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }
}

#[async_trait]
impl StreamTransport for HttpStreamTransport {
    async fn open(&self, flows: &[FlowId]) -> Result<StreamConnection, TransportError> {
        let filter = flows
            .iter()
            .map(FlowId::as_str)
            .collect::<Vec<_>>()
            .join(",");
        let request = self
            .client
            .get(format!("{}/flows", self.stream_url))
            .query(&[("filter", filter.as_str()), ("active", "true")]);

        let response = self.credentials.apply(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        debug!(flows = flows.len(), "stream connection opened");
        let (tx, rx) = mpsc::channel(FRAME_BUFFER);
        let reader = tokio::spawn(read_frames(response, tx));
        Ok(StreamConnection::with_reader(rx, reader.abort_handle()))
    }
}

async fn read_frames(response: reqwest::Response, frames: mpsc::Sender<StreamFrame>) {
    let mut body = response.bytes_stream();
    let mut lines = LineBuffer::new();

    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(chunk) => {
                lines.push(&chunk);
                while let Some(line) = lines.next_line() {
                    if frames.send(decode(&line)).await.is_err() {
                        return;
                    }
                }
            }
            Err(error) => {
                warn!(%error, "stream read failed");
                let _ = frames.send(Err(error.into())).await;
                return;
            }
        }
    }

    if let Some(line) = lines.remainder() {
        if frames.send(decode(&line)).await.is_err() {
            return;
        }
    }
    let _ = frames.send(Err(TransportError::StreamClosed)).await;
}

fn decode(line: &str) -> StreamFrame {
    serde_json::from_str(line).map_err(TransportError::from)
}
