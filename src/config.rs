use std::{fmt::Debug, net::IpAddr, net::SocketAddr, time::Duration};

use anyhow::{anyhow, Context, Result};
use data_model::{BackendId, NetworkAddress, QueryOptions};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const LOCAL_ENV: &str = "local";
const ENV_PREFIX: &str = "SCAN_SCHEDULER_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub env: String,
    pub listen_addr: String,
    pub local_backend: LocalBackendConfig,
    pub membership: MembershipConfig,
    pub scheduler: SchedulerConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            env: LOCAL_ENV.to_string(),
            listen_addr: "0.0.0.0:8900".to_string(),
            local_backend: Default::default(),
            membership: Default::default(),
            scheduler: Default::default(),
            telemetry: Default::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path))?;
        Self::from_yaml_str(&config_str)
    }

    /// Layers the YAML document over the defaults, then applies
    /// `SCAN_SCHEDULER_*` environment overrides. Nested keys are separated by
    /// a double underscore, e.g. `SCAN_SCHEDULER_SCHEDULER__RANDOM_SEED`.
    pub fn from_yaml_str(config_str: &str) -> Result<ServerConfig> {
        let mut config: ServerConfig = Figment::new()
            .merge(Serialized::defaults(ServerConfig::default()))
            .merge(Yaml::string(config_str))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        if config.telemetry.instance_id.is_none() {
            config.telemetry.instance_id = Some(format!("{}-{}", config.env, Uuid::new_v4()));
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow!("invalid listen address: {}", self.listen_addr));
        }
        if self.local_backend.hostname.is_empty() {
            return Err(anyhow!("local backend hostname must not be empty"));
        }
        if self.local_backend.port == 0 {
            return Err(anyhow!("local backend port must not be 0"));
        }
        if let Some(ip) = self.local_backend.ip {
            if ip.is_unspecified() {
                return Err(anyhow!("local backend ip {} is not a usable address", ip));
            }
        }
        self.scheduler
            .default_query_options
            .validate()
            .context("invalid default query options")?;

        if self.membership.channel_capacity == 0 {
            return Err(anyhow!("membership channel capacity must be positive"));
        }
        if self.membership.mode == MembershipMode::Static
            && self.membership.static_backends.is_empty()
        {
            return Err(anyhow!("static membership requires at least one backend"));
        }
        for backend in &self.membership.static_backends {
            if backend.address.port == 0 {
                return Err(anyhow!(
                    "static backend {} must have a non-zero port",
                    backend.address
                ));
            }
            if backend.ip.is_some_and(|ip| ip.is_unspecified()) {
                return Err(anyhow!(
                    "static backend {} has an unusable ip address",
                    backend.address
                ));
            }
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    /// Identifies this process in traces. Loaded configs always carry one;
    /// configs built in code without it fall back to the environment name.
    pub fn instance_id(&self) -> &str {
        self.telemetry.instance_id.as_deref().unwrap_or(&self.env)
    }
}

/// The backend this server runs as. Without an explicit `ip` the hostname is
/// resolved at start-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalBackendConfig {
    pub id: Option<String>,
    pub hostname: String,
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub is_coordinator: bool,
    pub is_executor: bool,
}

impl Default for LocalBackendConfig {
    fn default() -> Self {
        Self {
            id: None,
            hostname: "localhost".to_string(),
            ip: None,
            port: 22000,
            is_coordinator: true,
            is_executor: true,
        }
    }
}

impl LocalBackendConfig {
    pub fn address(&self) -> NetworkAddress {
        NetworkAddress::new(self.hostname.clone(), self.port)
    }

    pub fn backend_id(&self) -> BackendId {
        match &self.id {
            Some(id) => BackendId::new(id.clone()),
            None => BackendId::new(self.address().to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MembershipMode {
    /// A fixed list of backends taken from `static_backends`.
    Static,
    /// Deltas pushed to `POST /internal/membership`.
    #[default]
    Subscription,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    pub mode: MembershipMode,
    pub static_backends: Vec<StaticBackendConfig>,
    pub channel_capacity: usize,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            mode: MembershipMode::default(),
            static_backends: Vec::new(),
            channel_capacity: 128,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticBackendConfig {
    #[serde(default)]
    pub id: Option<String>,
    pub address: NetworkAddress,
    #[serde(default)]
    pub ip: Option<IpAddr>,
    #[serde(default = "default_true")]
    pub is_coordinator: bool,
    #[serde(default = "default_true")]
    pub is_executor: bool,
}

impl StaticBackendConfig {
    pub fn backend_id(&self) -> BackendId {
        match &self.id {
            Some(id) => BackendId::new(id.clone()),
            None => BackendId::new(self.address.to_string()),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SchedulerConfig {
    // Seeds the tie-breaking permutations. Unset means a fresh seed per
    // query for random replica selection.
    pub random_seed: Option<u64>,
    // Used for requests that do not carry their own query options.
    pub default_query_options: QueryOptions,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TracingExporter {
    Stdout,
    Otlp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    // Enable metrics.
    pub enable_metrics: bool,
    // OpenTelemetry collector grpc endpoint for both traces and metrics.
    // Defaults to OTEL_EXPORTER_OTLP_ENDPOINT or localhost:4317 if empty.
    pub endpoint: Option<String>,
    // Defines the exporter to use for tracing.
    // If not specified, we won't export traces anywhere.
    pub tracing_exporter: Option<TracingExporter>,
    // Metrics export interval in seconds.
    #[serde(with = "duration_serde")]
    pub metrics_interval: Duration,
    // Used as the metric attribute "scheduler.instance.id".
    pub instance_id: Option<String>,
}

impl TelemetryConfig {
    pub fn tracing_enabled(&self) -> bool {
        self.tracing_exporter.is_some()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            endpoint: None,
            tracing_exporter: None,
            metrics_interval: Duration::from_secs(10),
            instance_id: None,
        }
    }
}

mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(seconds))
    }
}
