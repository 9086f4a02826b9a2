//! The client facade: lifecycle, request dispatch and background sync.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use flowdock_config::{ClientConfig, SyncConfig};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::EntityCache;
use crate::error::{ClientError, ClientResult};
use crate::events::{ClientEvent, EventEmitter, TaskSource};
use crate::ids::{FlowId, UserId};
use crate::model::{Flow, FlowRecord, Message, Organization, OrganizationRecord, User, UserRecord};
use crate::periodic::PeriodicTask;
use crate::reconciler::{reconcile, ReconcileOptions, Reconciliation};
use crate::stream::{StreamEvent, StreamSession};
use crate::transport::{
    Credentials, HttpMethod, HttpSession, HttpStreamTransport, StreamTransport, Transport,
};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub sync: SyncConfig,
    /// Wait between attempts when a stream fails to re-open
    pub stream_reconnect_delay: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            stream_reconnect_delay: Duration::from_secs(5),
        }
    }
}

impl From<&ClientConfig> for ClientOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            sync: config.sync.clone(),
            stream_reconnect_delay: config.api.stream_reconnect_delay(),
        }
    }
}

/// Cache sizes and identity, as reported by [`FlowdockClient::summary`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ClientSummary {
    pub organizations: usize,
    pub flows: usize,
    pub joined_flows: usize,
    pub users: usize,
    #[serde(rename = "self")]
    pub self_id: Option<UserId>,
    pub options: SyncConfig,
}

impl fmt::Display for ClientSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FlowdockClient[flows=({}),users=({})]", self.flows, self.users)
    }
}

struct Shared {
    transport: Arc<dyn Transport>,
    stream_transport: Arc<dyn StreamTransport>,
    cache: Arc<RwLock<EntityCache>>,
    /// Unset until some response carried the `flowdock-user` header
    self_id: Mutex<Option<UserId>>,
    message_stream: Mutex<Option<StreamSession>>,
    events: EventEmitter<ClientEvent>,
    options: ClientOptions,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    async fn send_request(
        &self,
        method: HttpMethod,
        path: &str,
        data: Option<&Value>,
    ) -> ClientResult<Value> {
        let response = self.transport.request(method, path, data).await?;
        if let Some(id) = response.authenticated_user() {
            let mut self_id = lock(&self.self_id);
            if *self_id != Some(id) {
                debug!(user = %id, "learned authenticated user id");
                *self_id = Some(id);
            }
        }
        Ok(response.body)
    }

    async fn retrieve_organizations(&self) -> ClientResult<Vec<Organization>> {
        let body = self
            .send_request(HttpMethod::Get, "/organizations", None)
            .await?;
        let records: Vec<OrganizationRecord> = serde_json::from_value(body)?;

        let mut cache = self.cache.write().await;
        for record in &records {
            cache.upsert_organization(record);
        }
        debug!(organizations = records.len(), "retrieved organizations");
        Ok(records
            .iter()
            .filter_map(|record| cache.organization(record.id).cloned())
            .collect())
    }

    async fn retrieve_flows(&self, all: bool) -> ClientResult<Vec<Flow>> {
        let path = if all { "/flows/all" } else { "/flows" };
        let body = self
            .send_request(HttpMethod::Get, path, Some(&json!({ "users": 1 })))
            .await?;
        let records: Vec<FlowRecord> = serde_json::from_value(body)?;

        let mut cache = self.cache.write().await;
        if let Some(orphan) = records
            .iter()
            .find(|record| cache.resolve_organization(record).is_none())
        {
            return Err(ClientError::UnknownOrganization {
                flow: orphan.id.clone(),
                organization: None,
            });
        }
        for record in &records {
            cache.upsert_flow(record)?;
        }
        debug!(flows = records.len(), all, "retrieved flows");
        Ok(records
            .iter()
            .filter_map(|record| cache.flow(&record.id).cloned())
            .collect())
    }

    async fn retrieve_users(&self) -> ClientResult<bool> {
        let organizations: Vec<_> = {
            let cache = self.cache.read().await;
            cache
                .organizations()
                .map(|org| (org.id, org.parameterized_name.clone()))
                .collect()
        };

        let mut new_users = Vec::new();
        for (organization_id, parameterized_name) in organizations {
            let path = format!("/organizations/{parameterized_name}/users");
            let body = self.send_request(HttpMethod::Get, &path, None).await?;
            let records: Vec<UserRecord> = serde_json::from_value(body)?;

            let mut cache = self.cache.write().await;
            for record in &records {
                if cache.upsert_user(record) {
                    new_users.push(record.id);
                }
                cache.link_user_to_organization(record.id, organization_id);
            }
        }

        if new_users.is_empty() {
            return Ok(false);
        }

        let snapshots: Vec<User> = {
            let cache = self.cache.read().await;
            new_users
                .iter()
                .filter_map(|id| cache.user(*id).cloned())
                .collect()
        };
        info!(users = snapshots.len(), "new users cached");
        self.events.emit(ClientEvent::NewUsers(snapshots));
        Ok(true)
    }

    async fn update_flows(&self) -> ClientResult<Reconciliation> {
        let body = self.send_request(HttpMethod::Get, "/flows", None).await?;
        let snapshot: Vec<FlowRecord> = serde_json::from_value(body)?;

        let outcome = {
            let mut cache = self.cache.write().await;
            reconcile(
                &mut cache,
                &snapshot,
                ReconcileOptions::from(&self.options.sync),
            )?
        };

        for event in outcome.events() {
            self.events.emit(event);
        }
        if outcome.has_joins() {
            if let Some(stream) = self.message_stream() {
                debug!(joined = outcome.joined.len(), "rebinding message stream");
                stream.reconnect();
            }
        }
        Ok(outcome)
    }

    fn message_stream(&self) -> Option<StreamSession> {
        lock(&self.message_stream).clone()
    }

    fn stream(&self) -> StreamSession {
        StreamSession::new(
            Arc::clone(&self.stream_transport),
            Arc::clone(&self.cache),
            self.options.stream_reconnect_delay,
        )
    }
}

#[derive(Default)]
struct BackgroundTasks {
    flow_updater: Option<PeriodicTask>,
    user_updater: Option<PeriodicTask>,
    stream_refresher: Option<PeriodicTask>,
    stream_relay: Option<JoinHandle<()>>,
}

impl BackgroundTasks {
    fn shutdown(&mut self) {
        for task in [
            &mut self.flow_updater,
            &mut self.user_updater,
            &mut self.stream_refresher,
        ] {
            if let Some(mut task) = task.take() {
                task.stop();
            }
        }
        if let Some(relay) = self.stream_relay.take() {
            relay.abort();
        }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Client for the Flowdock REST and streaming API.
///
/// Keeps organizations, flows and users cached, reconciles flow membership
/// on a timer and relays the live message stream as [`ClientEvent`]s.
pub struct FlowdockClient {
    shared: Arc<Shared>,
    tasks: Mutex<BackgroundTasks>,
}

impl FlowdockClient {
    /// Build a client talking HTTP to the configured endpoints. Fails before
    /// any I/O when the session credentials or periods are unusable.
    pub fn new(config: &ClientConfig) -> ClientResult<Self> {
        config
            .validate()
            .map_err(|error| ClientError::InvalidConfig(format!("{error:#}")))?;
        let credentials = Credentials::from_config(&config.session)?;
        let transport = HttpSession::new(&config.api, credentials.clone())?;
        let stream_transport = HttpStreamTransport::new(&config.api, credentials)?;
        Ok(Self::with_transports(
            Arc::new(transport),
            Arc::new(stream_transport),
            ClientOptions::from(config),
        ))
    }

    pub fn with_transports(
        transport: Arc<dyn Transport>,
        stream_transport: Arc<dyn StreamTransport>,
        options: ClientOptions,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                stream_transport,
                cache: Arc::new(RwLock::new(EntityCache::new())),
                self_id: Mutex::new(None),
                message_stream: Mutex::new(None),
                events: EventEmitter::new(),
                options,
            }),
            tasks: Mutex::new(BackgroundTasks::default()),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.shared.options
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// Shared handle on the entity cache.
    pub fn cache(&self) -> Arc<RwLock<EntityCache>> {
        Arc::clone(&self.shared.cache)
    }

    /// Reset, populate the caches and start the configured background work.
    pub async fn init(&self) -> ClientResult<()> {
        self.destroy().await;

        self.retrieve_organizations().await?;
        self.retrieve_flows(self.shared.options.sync.retrieve_all_flows)
            .await?;

        let sync = &self.shared.options.sync;
        if sync.update_joined_flows {
            if sync.auto_listen_for_messages {
                self.setup_message_stream();
            }
            self.start_flow_updater();
        }
        if sync.update_users {
            self.start_user_updater();
        }

        match self.self_user().await {
            Some(user) => info!(user = %user.id, name = %user.display_name(), "client initialised"),
            None => info!(self_id = ?self.self_id(), "client initialised without a cached self user"),
        }
        Ok(())
    }

    /// Stop background work and clear the caches. Safe to call repeatedly
    /// and before [`init`](Self::init). The learned self id is kept.
    pub async fn destroy(&self) {
        lock(&self.tasks).shutdown();
        if let Some(stream) = lock(&self.shared.message_stream).take() {
            stream.disconnect();
        }
        self.shared.cache.write().await.clear();
        debug!("client state cleared");
    }

    /// Issue a request. `method` is one of get/post/put/delete and is
    /// checked before anything goes on the wire.
    pub async fn request(&self, method: &str, path: &str, data: Option<Value>) -> ClientResult<Value> {
        let method: HttpMethod = method.parse()?;
        self.send_request(method, path, data.as_ref()).await
    }

    pub async fn send_request(
        &self,
        method: HttpMethod,
        path: &str,
        data: Option<&Value>,
    ) -> ClientResult<Value> {
        self.shared.send_request(method, path, data).await
    }

    pub async fn retrieve_organizations(&self) -> ClientResult<Vec<Organization>> {
        self.shared.retrieve_organizations().await
    }

    /// Fetch `/flows/all` (every visible flow) or `/flows` (joined only),
    /// with embedded members.
    pub async fn retrieve_flows(&self, all: bool) -> ClientResult<Vec<Flow>> {
        self.shared.retrieve_flows(all).await
    }

    /// Refresh the member list of every cached organization. Returns true
    /// when a user was seen for the first time.
    pub async fn retrieve_users(&self) -> ClientResult<bool> {
        self.shared.retrieve_users().await
    }

    /// Run one reconciliation tick now.
    pub async fn update_flows(&self) -> ClientResult<Reconciliation> {
        self.shared.update_flows().await
    }

    pub async fn send_message(&self, message: &Message) -> ClientResult<Value> {
        let body = serde_json::to_value(message.outbound()?)?;
        self.send_request(HttpMethod::Post, "/messages", Some(&body))
            .await
    }

    pub async fn edit_message(
        &self,
        message: &Message,
        content: impl Into<String>,
        tags: Vec<String>,
    ) -> ClientResult<Value> {
        let path = message.api_path(&*self.shared.cache.read().await)?;
        let body = json!({ "content": content.into(), "tags": tags });
        self.send_request(HttpMethod::Put, &path, Some(&body)).await
    }

    pub async fn delete_message(&self, message: &Message) -> ClientResult<Value> {
        let path = message.api_path(&*self.shared.cache.read().await)?;
        self.send_request(HttpMethod::Delete, &path, None).await
    }

    /// Post a chat reply into the thread of `parent`.
    pub async fn reply_in_thread(
        &self,
        parent: &Message,
        content: impl Into<String>,
    ) -> ClientResult<Value> {
        let flow = parent.flow_id.clone().ok_or(ClientError::MissingFlow)?;
        let mut reply = Message::chat(flow, content);
        reply.thread_id = parent.thread_id.clone();
        self.send_message(&reply).await
    }

    /// May be `None` until a response has carried the identity header.
    pub fn self_id(&self) -> Option<UserId> {
        *lock(&self.shared.self_id)
    }

    pub async fn self_user(&self) -> Option<User> {
        let id = self.self_id()?;
        self.shared.cache.read().await.user(id).cloned()
    }

    /// False while the self id is still unknown.
    pub fn is_self(&self, user: UserId) -> bool {
        self.self_id() == Some(user)
    }

    /// Open an independent stream session sharing this client's cache,
    /// bound to `flows` or to every cached flow when `None`.
    pub async fn stream(&self, flows: Option<Vec<FlowId>>) -> ClientResult<StreamSession> {
        let stream = self.shared.stream();
        stream.connect(flows).await?;
        Ok(stream)
    }

    /// The managed message stream, if one is set up.
    pub fn message_stream(&self) -> Option<StreamSession> {
        self.shared.message_stream()
    }

    /// Reconnect the managed message stream, setting it up if needed.
    pub fn reset_message_stream(&self) {
        match self.shared.message_stream() {
            Some(stream) => stream.reconnect(),
            None => self.setup_message_stream(),
        }
    }

    pub async fn organizations(&self) -> Vec<Organization> {
        self.shared.cache.read().await.organizations().cloned().collect()
    }

    pub async fn flows(&self) -> Vec<Flow> {
        let mut flows: Vec<Flow> = self.shared.cache.read().await.flows().cloned().collect();
        flows.sort_by(|a, b| a.id.cmp(&b.id));
        flows
    }

    pub async fn flow(&self, id: &FlowId) -> Option<Flow> {
        self.shared.cache.read().await.flow(id).cloned()
    }

    pub async fn joined_flows(&self) -> Vec<Flow> {
        self.shared
            .cache
            .read()
            .await
            .joined_flows()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn users(&self) -> Vec<User> {
        self.shared.cache.read().await.users().cloned().collect()
    }

    pub async fn user(&self, id: UserId) -> Option<User> {
        self.shared.cache.read().await.user(id).cloned()
    }

    pub async fn summary(&self) -> ClientSummary {
        let cache = self.shared.cache.read().await;
        ClientSummary {
            organizations: cache.organization_count(),
            flows: cache.flow_count(),
            joined_flows: cache.joined_len(),
            users: cache.user_count(),
            self_id: self.self_id(),
            options: self.shared.options.sync.clone(),
        }
    }

    fn setup_message_stream(&self) {
        let stream = self.shared.stream();
        let mut events = stream.subscribe();
        let shared = Arc::clone(&self.shared);
        let relay = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(StreamEvent::Message(message)) => {
                        shared.events.emit(ClientEvent::Message(message));
                    }
                    Ok(StreamEvent::Error(message)) => {
                        shared.events.emit(ClientEvent::Error {
                            source: TaskSource::Stream,
                            message,
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "message relay lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        stream.reconnect();

        let refresher = self
            .shared
            .options
            .sync
            .restart_stream_interval()
            .map(|period| {
                let stream = stream.clone();
                PeriodicTask::spawn("stream-refresher", period, false, move || {
                    debug!("refreshing message stream");
                    stream.reconnect();
                    std::future::ready(())
                })
            });

        if let Some(previous) = lock(&self.shared.message_stream).replace(stream) {
            previous.disconnect();
        }

        let mut tasks = lock(&self.tasks);
        if let Some(previous) = tasks.stream_relay.replace(relay) {
            previous.abort();
        }
        if let Some(mut previous) = tasks.stream_refresher.take() {
            previous.stop();
        }
        tasks.stream_refresher = refresher;
        info!("message stream set up");
    }

    fn start_flow_updater(&self) {
        let shared = Arc::clone(&self.shared);
        let sync = &self.shared.options.sync;
        let task = PeriodicTask::spawn(
            "flow-updater",
            sync.flow_update_interval(),
            sync.flow_update_fires_immediately,
            move || {
                let shared = Arc::clone(&shared);
                async move {
                    if let Err(error) = shared.update_flows().await {
                        warn!(%error, "flow update failed");
                        shared
                            .events
                            .emit(ClientEvent::error(TaskSource::FlowUpdater, &error));
                    }
                }
            },
        );
        if let Some(mut previous) = lock(&self.tasks).flow_updater.replace(task) {
            previous.stop();
        }
    }

    fn start_user_updater(&self) {
        let shared = Arc::clone(&self.shared);
        let task = PeriodicTask::spawn(
            "user-updater",
            self.shared.options.sync.user_update_interval(),
            false,
            move || {
                let shared = Arc::clone(&shared);
                async move {
                    match shared.retrieve_users().await {
                        Ok(_) => {
                            shared.events.emit(ClientEvent::UsersRefreshed);
                        }
                        Err(error) => {
                            warn!(%error, "user update failed");
                            shared
                                .events
                                .emit(ClientEvent::error(TaskSource::UserUpdater, &error));
                        }
                    }
                }
            },
        );
        if let Some(mut previous) = lock(&self.tasks).user_updater.replace(task) {
            previous.stop();
        }
    }
}

impl Drop for FlowdockClient {
    fn drop(&mut self) {
        if let Some(stream) = lock(&self.shared.message_stream).take() {
            stream.disconnect();
        }
    }
}

impl fmt::Debug for FlowdockClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowdockClient")
            .field("self_id", &self.self_id())
            .field("options", &self.shared.options)
            .finish_non_exhaustive()
    }
}
