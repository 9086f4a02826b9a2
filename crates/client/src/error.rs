//! Error types for the client.

use thiserror::Error;

use crate::ids::{FlowId, OrganizationId};
use crate::transport::TransportError;

/// Result type alias for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Main error type for the client
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("invalid client configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid session credentials: {0}")]
    InvalidCredentials(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("invalid response payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("flow {flow} belongs to organization {organization:?} which is not cached")]
    UnknownOrganization {
        flow: FlowId,
        organization: Option<OrganizationId>,
    },

    #[error("flow {0} is not cached")]
    UnknownFlow(FlowId),

    #[error("message has no target flow")]
    MissingFlow,

    #[error("message has no id")]
    MissingMessageId,
}

impl ClientError {
    /// Create an invalid credentials error
    pub fn invalid_credentials(reason: impl Into<String>) -> Self {
        Self::InvalidCredentials(reason.into())
    }

    /// Whether the failure happened on the wire rather than in the caller's input
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
