//! In-memory transports and JSON fixtures for driving the client in tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::ids::{FlowId, UserId};
use crate::transport::{
    HttpMethod, StreamConnection, StreamFrame, StreamTransport, Transport, TransportError,
    TransportResponse, USER_HEADER,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub method: HttpMethod,
    pub path: String,
    pub data: Option<Value>,
}

#[derive(Debug, Clone)]
enum Reply {
    Body(Value),
    Status(u16),
}

type Route = (HttpMethod, String);

#[derive(Debug, Default)]
struct Routes {
    persistent: HashMap<Route, Reply>,
    queued: HashMap<Route, VecDeque<Reply>>,
    requests: Vec<RecordedRequest>,
    user: Option<UserId>,
}

/// Scripted REST transport. Queued replies are used first, then the
/// persistent reply for the route; anything else answers 404.
#[derive(Debug, Default)]
pub struct FakeTransport {
    routes: Mutex<Routes>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `flowdock-user: <id>` to every successful response.
    pub fn with_user(self, id: u64) -> Self {
        lock(&self.routes).user = Some(UserId(id));
        self
    }

    pub fn respond(&self, method: HttpMethod, path: &str, body: Value) {
        lock(&self.routes)
            .persistent
            .insert((method, path.to_string()), Reply::Body(body));
    }

    pub fn respond_once(&self, method: HttpMethod, path: &str, body: Value) {
        lock(&self.routes)
            .queued
            .entry((method, path.to_string()))
            .or_default()
            .push_back(Reply::Body(body));
    }

    pub fn fail(&self, method: HttpMethod, path: &str, status: u16) {
        lock(&self.routes)
            .persistent
            .insert((method, path.to_string()), Reply::Status(status));
    }

    pub fn fail_once(&self, method: HttpMethod, path: &str, status: u16) {
        lock(&self.routes)
            .queued
            .entry((method, path.to_string()))
            .or_default()
            .push_back(Reply::Status(status));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.routes).requests.clone()
    }

    pub fn request_count(&self, method: HttpMethod, path: &str) -> usize {
        lock(&self.routes)
            .requests
            .iter()
            .filter(|request| request.method == method && request.path == path)
            .count()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn request(
        &self,
        method: HttpMethod,
        path: &str,
        data: Option<&Value>,
    ) -> Result<TransportResponse, TransportError> {
        let mut routes = lock(&self.routes);
        routes.requests.push(RecordedRequest {
            method,
            path: path.to_string(),
            data: data.cloned(),
        });

        let route = (method, path.to_string());
        let queued = routes.queued.get_mut(&route).and_then(VecDeque::pop_front);
        let reply = queued
            .or_else(|| routes.persistent.get(&route).cloned())
            .unwrap_or(Reply::Status(404));

        match reply {
            Reply::Body(body) => {
                let mut response = TransportResponse::new(body);
                if let Some(user) = routes.user {
                    response = response.with_header(USER_HEADER, user.to_string());
                }
                Ok(response)
            }
            Reply::Status(status) => Err(TransportError::Status {
                status,
                body: format!("{} {}", method, path),
            }),
        }
    }
}

/// Server side of one fake stream connection.
#[derive(Debug, Clone)]
pub struct FakeStreamHandle {
    pub flows: Vec<FlowId>,
    sender: mpsc::Sender<StreamFrame>,
}

impl FakeStreamHandle {
    /// Deliver a frame. Returns false once the client side is gone.
    pub fn push(&self, frame: Value) -> bool {
        self.sender.try_send(Ok(frame)).is_ok()
    }

    pub fn fail(&self, error: TransportError) -> bool {
        self.sender.try_send(Err(error)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[derive(Debug, Default)]
struct StreamState {
    connections: Vec<FakeStreamHandle>,
    pending_failures: usize,
    attempts: usize,
}

#[derive(Debug, Default)]
pub struct FakeStreamTransport {
    state: Mutex<StreamState>,
}

impl FakeStreamTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `count` calls to `open` fail.
    pub fn fail_next_opens(&self, count: usize) {
        lock(&self.state).pending_failures = count;
    }

    /// Successful opens so far.
    pub fn open_count(&self) -> usize {
        lock(&self.state).connections.len()
    }

    /// All calls to `open`, failed ones included.
    pub fn attempt_count(&self) -> usize {
        lock(&self.state).attempts
    }

    pub fn connection(&self, index: usize) -> Option<FakeStreamHandle> {
        lock(&self.state).connections.get(index).cloned()
    }

    pub fn latest(&self) -> Option<FakeStreamHandle> {
        lock(&self.state).connections.last().cloned()
    }
}

#[async_trait]
impl StreamTransport for FakeStreamTransport {
    async fn open(&self, flows: &[FlowId]) -> Result<StreamConnection, TransportError> {
        let mut state = lock(&self.state);
        state.attempts += 1;
        if state.pending_failures > 0 {
            state.pending_failures -= 1;
            return Err(TransportError::Other("stream refused".into()));
        }

        let (sender, frames) = mpsc::channel(64);
        state.connections.push(FakeStreamHandle {
            flows: flows.to_vec(),
            sender,
        });
        Ok(StreamConnection::new(frames))
    }
}

pub fn user_json(id: u64, name: &str) -> Value {
    json!({
        "id": id,
        "name": name,
        "nick": name.to_lowercase(),
        "email": format!("{}@example.test", name.to_lowercase()),
        "avatar": format!("https://avatars.example.test/{id}"),
        "website": null,
    })
}

pub fn organization_json(id: u64, parameterized_name: &str, users: Vec<Value>) -> Value {
    json!({
        "id": id,
        "name": parameterized_name.to_uppercase(),
        "parameterized_name": parameterized_name,
        "url": format!("https://api.example.test/organizations/{parameterized_name}"),
        "active": true,
        "user_limit": 100,
        "user_count": users.len(),
        "subscription": { "trial": false },
        "users": users,
    })
}

/// Flow summary with an embedded organization named `org-<organization>`.
pub fn flow_json(id: &str, organization: u64, open: bool, joined: bool) -> Value {
    json!({
        "id": id,
        "name": format!("Flow {id}"),
        "parameterized_name": format!("flow-{id}"),
        "open": open,
        "joined": joined,
        "unread_mentions": 0,
        "access_mode": if open { "organization" } else { "invitation" },
        "organization": {
            "id": organization,
            "name": format!("Org {organization}"),
            "parameterized_name": format!("org-{organization}"),
            "active": true,
        },
    })
}

pub fn message_frame(flow: &str, user: u64, event: &str, content: Value) -> Value {
    json!({
        "id": 1000 + user,
        "event": event,
        "flow": flow,
        "user": user.to_string(),
        "content": content,
        "tags": [],
        "attachments": [],
        "sent": 1_700_000_000_000i64,
        "created_at": "2023-11-14T22:13:20.000Z",
        "uuid": "0b1a6c64-0d7f-4cf4-9b52-0c3c2f6f7a10",
    })
}
