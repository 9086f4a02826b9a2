use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

const DEFAULT_CONFIG_FILES: &[&str] = &[
    "flowdock.toml",
    "config/flowdock.toml",
    "crates/config/flowdock.toml",
    "../flowdock.toml",
    "../config/flowdock.toml",
];

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Endpoints and transport timeouts.
///
/// ```
/// use flowdock_config::ApiConfig;
///
/// let api = ApiConfig::default();
/// assert_eq!(api.base_url, "https://api.flowdock.com");
/// assert_eq!(api.stream_url, "https://stream.flowdock.com");
/// assert_eq!(api.request_timeout_seconds, 30);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "ApiConfig::default_base_url")]
    pub base_url: String,
    #[serde(default = "ApiConfig::default_stream_url")]
    pub stream_url: String,
    #[serde(default = "ApiConfig::default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "ApiConfig::default_stream_reconnect_delay")]
    pub stream_reconnect_delay_seconds: u64,
}

impl ApiConfig {
    fn default_base_url() -> String {
        "https://api.flowdock.com".to_string()
    }

    fn default_stream_url() -> String {
        "https://stream.flowdock.com".to_string()
    }

    const fn default_request_timeout() -> u64 {
        30
    }

    const fn default_stream_reconnect_delay() -> u64 {
        5
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn stream_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.stream_reconnect_delay_seconds)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            stream_url: Self::default_stream_url(),
            request_timeout_seconds: Self::default_request_timeout(),
            stream_reconnect_delay_seconds: Self::default_stream_reconnect_delay(),
        }
    }
}

/// Credentials for the REST and streaming endpoints.
///
/// Either `token` or both `username` and `password` must be present; the
/// client rejects anything else when it is constructed.
#[derive(Clone, Serialize, Deserialize, Default)]
pub struct SessionConfig {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Background synchronisation switches and periods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "enabled")]
    pub update_joined_flows: bool,
    #[serde(default = "enabled")]
    pub update_users: bool,
    #[serde(default = "enabled")]
    pub retrieve_all_flows: bool,
    #[serde(default = "enabled")]
    pub auto_listen_for_messages: bool,
    #[serde(default = "SyncConfig::default_flow_update_interval")]
    pub flow_update_interval_seconds: u64,
    #[serde(default = "SyncConfig::default_user_update_interval")]
    pub user_update_interval_seconds: u64,
    /// `0` disables the periodic stream restart.
    #[serde(default = "SyncConfig::default_restart_stream_interval")]
    pub restart_stream_interval_seconds: u64,
    #[serde(default = "enabled")]
    pub flow_update_fires_immediately: bool,
    /// Treat an unchanged flow count as "no membership change".
    ///
    /// A join and a leave inside the same period keep the count equal, so
    /// deployments that must never miss a transition should turn this off.
    #[serde(default = "enabled")]
    pub size_shortcut: bool,
}

const fn enabled() -> bool {
    true
}

impl SyncConfig {
    const fn default_flow_update_interval() -> u64 {
        30
    }

    const fn default_user_update_interval() -> u64 {
        30
    }

    const fn default_restart_stream_interval() -> u64 {
        60 * 60
    }

    pub fn flow_update_interval(&self) -> Duration {
        Duration::from_secs(self.flow_update_interval_seconds)
    }

    pub fn user_update_interval(&self) -> Duration {
        Duration::from_secs(self.user_update_interval_seconds)
    }

    pub fn restart_stream_interval(&self) -> Option<Duration> {
        (self.restart_stream_interval_seconds > 0)
            .then(|| Duration::from_secs(self.restart_stream_interval_seconds))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            update_joined_flows: true,
            update_users: true,
            retrieve_all_flows: true,
            auto_listen_for_messages: true,
            flow_update_interval_seconds: Self::default_flow_update_interval(),
            user_update_interval_seconds: Self::default_user_update_interval(),
            restart_stream_interval_seconds: Self::default_restart_stream_interval(),
            flow_update_fires_immediately: true,
            size_shortcut: true,
        }
    }
}

impl ClientConfig {
    /// Reject periods the background tasks cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let periods = [
            ("api.request_timeout_seconds", self.api.request_timeout_seconds),
            (
                "api.stream_reconnect_delay_seconds",
                self.api.stream_reconnect_delay_seconds,
            ),
            (
                "sync.flow_update_interval_seconds",
                self.sync.flow_update_interval_seconds,
            ),
            (
                "sync.user_update_interval_seconds",
                self.sync.user_update_interval_seconds,
            ),
        ];
        for (key, seconds) in periods {
            anyhow::ensure!(seconds > 0, "{key} must be greater than zero");
        }
        Ok(())
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Load the client configuration by combining defaults, files, and environment overrides.
///
/// ```
/// use flowdock_config::load;
///
/// std::env::remove_var("FLOWDOCK_CONFIG");
///
/// let config = load().expect("configuration should load with defaults");
/// assert!(!config.api.base_url.is_empty());
/// ```
pub fn load() -> anyhow::Result<ClientConfig> {
    let defaults = ClientConfig::default();

    let mut builder = config::Config::builder()
        .set_default("api.base_url", defaults.api.base_url.clone())?
        .set_default("api.stream_url", defaults.api.stream_url.clone())?
        .set_default(
            "api.request_timeout_seconds",
            to_i64(defaults.api.request_timeout_seconds),
        )?
        .set_default(
            "api.stream_reconnect_delay_seconds",
            to_i64(defaults.api.stream_reconnect_delay_seconds),
        )?
        .set_default("sync.update_joined_flows", defaults.sync.update_joined_flows)?
        .set_default("sync.update_users", defaults.sync.update_users)?
        .set_default("sync.retrieve_all_flows", defaults.sync.retrieve_all_flows)?
        .set_default(
            "sync.auto_listen_for_messages",
            defaults.sync.auto_listen_for_messages,
        )?
        .set_default(
            "sync.flow_update_interval_seconds",
            to_i64(defaults.sync.flow_update_interval_seconds),
        )?
        .set_default(
            "sync.user_update_interval_seconds",
            to_i64(defaults.sync.user_update_interval_seconds),
        )?
        .set_default(
            "sync.restart_stream_interval_seconds",
            to_i64(defaults.sync.restart_stream_interval_seconds),
        )?
        .set_default(
            "sync.flow_update_fires_immediately",
            defaults.sync.flow_update_fires_immediately,
        )?
        .set_default("sync.size_shortcut", defaults.sync.size_shortcut)?;

    let environment_overrides = config::Environment::with_prefix("FLOWDOCK").separator("__");

    let mut config_file_attached = false;

    if let Ok(path) = std::env::var("FLOWDOCK_CONFIG") {
        builder = builder.add_source(config::File::from(PathBuf::from(&path)));
        config_file_attached = true;
        debug!(path, "loading configuration via FLOWDOCK_CONFIG");
    } else if let Ok(cwd) = std::env::current_dir() {
        let fallback = DEFAULT_CONFIG_FILES
            .iter()
            .map(|candidate| cwd.join(candidate))
            .find(|path| path.exists());

        if let Some(path) = fallback {
            debug!(path = %path.display(), "loading configuration file");
            builder = builder.add_source(config::File::from(path));
            config_file_attached = true;
        }
    }

    if !config_file_attached {
        debug!("no configuration file found, relying on defaults and environment overrides");
    }

    builder = builder.add_source(environment_overrides);

    let cfg = builder.build().context("unable to build configuration")?;

    let config = cfg
        .try_deserialize::<ClientConfig>()
        .context("invalid configuration")?;
    config.validate().context("invalid configuration")?;

    debug!(?config, "loaded client configuration");
    Ok(config)
}
