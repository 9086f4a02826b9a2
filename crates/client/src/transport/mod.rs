//! Wire adapters: the REST session and the streaming channel.
//!
//! Both sit behind traits so the client can be driven by fakes in tests.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use flowdock_config::SessionConfig;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::error::{ClientError, ClientResult};
use crate::ids::{FlowId, UserId};

mod http;
mod stream;

pub use http::HttpSession;
pub use stream::{HttpStreamTransport, LineBuffer};

/// Response header carrying the authenticated user's id.
pub const USER_HEADER: &str = "flowdock-user";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("request failed with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid JSON on the wire: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("stream closed by server")]
    StreamClosed,
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = ClientError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "get" => Ok(Self::Get),
            "post" => Ok(Self::Post),
            "put" => Ok(Self::Put),
            "delete" => Ok(Self::Delete),
            _ => Err(ClientError::InvalidMethod(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportResponse {
    pub body: Value,
    /// Header names are lower-cased
    pub headers: HashMap<String, String>,
}

impl TransportResponse {
    pub fn new(body: Value) -> Self {
        Self {
            body,
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Id from the `flowdock-user` header, if present and numeric.
    pub fn authenticated_user(&self) -> Option<UserId> {
        self.header(USER_HEADER)?.parse().ok()
    }
}

/// REST session.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(
        &self,
        method: HttpMethod,
        path: &str,
        data: Option<&Value>,
    ) -> Result<TransportResponse, TransportError>;
}

pub type StreamFrame = Result<Value, TransportError>;

/// An open stream: decoded frames plus a handle on whatever feeds them.
#[derive(Debug)]
pub struct StreamConnection {
    frames: mpsc::Receiver<StreamFrame>,
    reader: Option<AbortHandle>,
}

impl StreamConnection {
    pub fn new(frames: mpsc::Receiver<StreamFrame>) -> Self {
        Self {
            frames,
            reader: None,
        }
    }

    pub fn with_reader(frames: mpsc::Receiver<StreamFrame>, reader: AbortHandle) -> Self {
        Self {
            frames,
            reader: Some(reader),
        }
    }

    pub fn into_parts(self) -> (mpsc::Receiver<StreamFrame>, ConnectionHandle) {
        (
            self.frames,
            ConnectionHandle {
                reader: self.reader,
            },
        )
    }
}

#[derive(Debug)]
pub struct ConnectionHandle {
    reader: Option<AbortHandle>,
}

impl ConnectionHandle {
    /// Close the underlying connection.
    pub fn end(self) {
        if let Some(reader) = self.reader {
            reader.abort();
        }
    }
}

/// Streaming channel: opens a connection bound to a list of flows.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn open(&self, flows: &[FlowId]) -> Result<StreamConnection, TransportError>;
}

#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// API token, sent as the basic-auth user name
    Token(String),
    Basic { username: String, password: String },
}

impl Credentials {
    /// Pick credentials from the session config. A token wins over a
    /// username and password pair; having neither is an error.
    pub fn from_config(session: &SessionConfig) -> ClientResult<Self> {
        if let Some(token) = session.token.as_deref().filter(|t| !t.is_empty()) {
            return Ok(Self::Token(token.to_string()));
        }

        match (session.username.as_deref(), session.password.as_deref()) {
            (Some(username), Some(password)) if !username.is_empty() => Ok(Self::Basic {
                username: username.to_string(),
                password: password.to_string(),
            }),
            (Some(_), None) => Err(ClientError::invalid_credentials(
                "a username was given without a password",
            )),
            _ => Err(ClientError::invalid_credentials(
                "either a token or a username and password are required",
            )),
        }
    }

    pub(crate) fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Self::Token(token) => request.basic_auth(token, None::<&str>),
            Self::Basic { username, password } => request.basic_auth(username, Some(password)),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token(_) => f.write_str("Credentials::Token(<redacted>)"),
            Self::Basic { username, .. } => f
                .debug_struct("Credentials::Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}
