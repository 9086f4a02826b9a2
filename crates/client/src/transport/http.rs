use std::collections::HashMap;

use async_trait::async_trait;
use flowdock_config::ApiConfig;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use super::{Credentials, HttpMethod, Transport, TransportError, TransportResponse};

/// REST session over reqwest, authenticated with HTTP basic auth.
#[derive(Debug, Clone)]
pub struct HttpSession {
    client: Client,
    base_url: String,
    credentials: Credentials,
}

impl HttpSession {
    pub fn new(api: &ApiConfig, credentials: Credentials) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(api.request_timeout()).build()?;
        Ok(Self {
            client,
            base_url: api.base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

/// Flatten a JSON object into query pairs. Non-object data yields nothing.
fn query_pairs(data: &Value) -> Vec<(String, String)> {
    let Some(object) = data.as_object() else {
        return Vec::new();
    };
    object
        .iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(key, value)| {
            let value = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect()
}

#[async_trait]
impl Transport for HttpSession {
    async fn request(
        &self,
        method: HttpMethod,
        path: &str,
        data: Option<&Value>,
    ) -> Result<TransportResponse, TransportError> {
        let url = self.url(path);
        let mut request = match method {
            HttpMethod::Get => self.client.get(&url),
            HttpMethod::Post => self.client.post(&url),
            HttpMethod::Put => self.client.put(&url),
            HttpMethod::Delete => self.client.delete(&url),
        };
        request = self.credentials.apply(request);

        if let Some(data) = data {
            request = match method {
                HttpMethod::Get | HttpMethod::Delete => request.query(&query_pairs(data)),
                HttpMethod::Post | HttpMethod::Put => request.json(data),
            };
        }

        debug!(%method, path, "sending request");
        let response = request.send().await?;
        let status = response.status();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
            })
            .collect();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)?
        };

        Ok(TransportResponse { body, headers })
    }
}
