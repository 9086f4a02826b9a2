//! Client for the Flowdock team chat API.
//!
//! [`FlowdockClient`] keeps organizations, flows and users cached in an
//! [`EntityCache`], reconciles flow membership against periodic `/flows`
//! snapshots and relays a self-healing live [`StreamSession`] as typed
//! [`ClientEvent`]s.

pub mod cache;
pub mod client;
pub mod error;
pub mod events;
pub mod ids;
pub mod model;
pub mod periodic;
pub mod reconciler;
pub mod stream;
pub mod test_support;
pub mod transport;

pub use cache::EntityCache;
pub use client::{ClientOptions, ClientSummary, FlowdockClient};
pub use error::{ClientError, ClientResult};
pub use events::{ClientEvent, EventEmitter, TaskSource};
pub use ids::{FlowId, MessageId, OrganizationId, UserId};
pub use model::{Flow, Message, MessageKind, Organization, User};
pub use reconciler::{reconcile, ReconcileOptions, Reconciliation, Transition};
pub use stream::{KindSubscription, StreamEvent, StreamMessage, StreamSession};
pub use transport::{HttpMethod, StreamTransport, Transport, TransportError};
