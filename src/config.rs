//! Configuration types for sentinel-failover.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::error::FailoverError;
use crate::leader::check_timings;

/// Namespace file mounted into every pod with a service account.
pub const SERVICE_ACCOUNT_NAMESPACE_PATH: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Controller configuration.
    #[serde(default)]
    pub failover: FailoverConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Service whose Endpoints follow the master.
    #[serde(default)]
    pub service: ServiceConfig,

    /// Sentinel connection.
    #[serde(default)]
    pub sentinel: SentinelConfig,

    /// Leader election lease.
    #[serde(default)]
    pub lease: LeaseConfig,

    /// Seconds between reconcile ticks while leading.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Deadline in seconds for a single Sentinel query or Endpoints write.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

/// The headless Service clients connect to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service (and Endpoints) name.
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Namespace. Read from the service account when unset.
    #[serde(default)]
    pub namespace: Option<String>,

    /// Name of the single service port.
    #[serde(default = "default_port_name")]
    pub port_name: String,

    /// Port number of the master.
    #[serde(default = "default_port_number")]
    pub port_number: u16,

    /// Create the Service at startup if it does not exist.
    #[serde(default = "default_true")]
    pub create_service: bool,
}

/// Redis Sentinel connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelConfig {
    /// Sentinel address as `host:port`.
    #[serde(default = "default_sentinel_addr")]
    pub addr: String,

    /// Name of the monitored master.
    #[serde(default = "default_master_name")]
    pub master_name: String,

    /// Sentinel password, if any.
    #[serde(default)]
    pub password: Option<String>,

    /// Deadline in milliseconds for connecting to Sentinel and for each
    /// reply. A connection that misses it is closed and reopened next time.
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
}

/// Leader election lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Lease object name.
    #[serde(default = "default_lease_name")]
    pub name: String,

    /// Identity written into the lease. Falls back to `$HOSTNAME`.
    #[serde(default)]
    pub holder_identity: Option<String>,

    /// How long a lease stays valid without renewal.
    #[serde(default = "default_lease_duration")]
    pub lease_duration_secs: u64,

    /// How long the holder keeps retrying renewal before giving up.
    #[serde(default = "default_renew_deadline")]
    pub renew_deadline_secs: u64,

    /// Interval between acquire and renew attempts.
    #[serde(default = "default_retry_period")]
    pub retry_period_secs: u64,
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "sentinel_failover=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log line format.
    #[serde(default)]
    pub log_format: LogFormat,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,

    /// OpenTelemetry configuration.
    #[serde(default)]
    pub opentelemetry: Option<OpenTelemetryConfig>,
}

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// OpenTelemetry exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenTelemetryConfig {
    /// OTLP endpoint (e.g., "http://localhost:4317").
    pub endpoint: String,

    /// Service name for traces.
    #[serde(default = "default_otel_service_name")]
    pub service_name: String,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            sentinel: SentinelConfig::default(),
            lease: LeaseConfig::default(),
            tick_interval_secs: default_tick_interval(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            namespace: None,
            port_name: default_port_name(),
            port_number: default_port_number(),
            create_service: true,
        }
    }
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            addr: default_sentinel_addr(),
            master_name: default_master_name(),
            password: None,
            response_timeout_ms: default_response_timeout(),
        }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            name: default_lease_name(),
            holder_identity: None,
            lease_duration_secs: default_lease_duration(),
            renew_deadline_secs: default_renew_deadline(),
            retry_period_secs: default_retry_period(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Text,
            prometheus_addr: None,
            opentelemetry: None,
        }
    }
}

impl FailoverConfig {
    /// Interval between reconcile ticks.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    /// Per-call deadline for Sentinel and Kubernetes calls.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Check the configuration for values the controller cannot run with.
    pub fn validate(&self) -> Result<(), FailoverError> {
        if self.tick_interval_secs == 0 {
            return Err(FailoverError::Config(
                "tick_interval_secs must be positive".into(),
            ));
        }
        if self.call_timeout_secs == 0 {
            return Err(FailoverError::Config(
                "call_timeout_secs must be positive".into(),
            ));
        }
        if self.service.name.is_empty() || self.service.port_name.is_empty() {
            return Err(FailoverError::Config(
                "service name and port name must not be empty".into(),
            ));
        }
        if self.service.port_number == 0 {
            return Err(FailoverError::Config("port_number must be positive".into()));
        }
        if self.sentinel.response_timeout_ms == 0 {
            return Err(FailoverError::Config(
                "response_timeout_ms must be positive".into(),
            ));
        }
        if self.sentinel.master_name.is_empty() {
            return Err(FailoverError::Config("master_name must not be empty".into()));
        }
        if self.lease.name.is_empty() {
            return Err(FailoverError::Config("lease name must not be empty".into()));
        }
        self.lease.validate()
    }
}

impl SentinelConfig {
    /// Connect and reply deadline.
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

impl LeaseConfig {
    /// Lease validity without renewal.
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    /// Renewal give-up deadline.
    pub fn renew_deadline(&self) -> Duration {
        Duration::from_secs(self.renew_deadline_secs)
    }

    /// Acquire/renew retry interval.
    pub fn retry_period(&self) -> Duration {
        Duration::from_secs(self.retry_period_secs)
    }

    /// Reject timings under which a renewing holder could be preempted.
    pub fn validate(&self) -> Result<(), FailoverError> {
        check_timings(
            self.lease_duration(),
            self.renew_deadline(),
            self.retry_period(),
        )
    }

    /// Identity to hold the lease under: configured value, then `$HOSTNAME`
    /// (the pod name), then a process-derived fallback.
    pub fn resolve_holder_identity(&self) -> String {
        if let Some(id) = self.holder_identity.as_ref().filter(|id| !id.is_empty()) {
            return id.clone();
        }
        match std::env::var("HOSTNAME") {
            Ok(host) if !host.is_empty() => host,
            _ => {
                let id = format!("sentinel-failover-{}", std::process::id());
                warn!(identity = %id, "HOSTNAME not set, using generated lease identity");
                id
            }
        }
    }
}

impl ServiceConfig {
    /// Namespace to operate in: configured value, else the pod's own
    /// namespace from the service account mount, else `default`.
    pub fn resolve_namespace(&self) -> Result<String, FailoverError> {
        if let Some(ns) = self.namespace.as_ref().filter(|ns| !ns.is_empty()) {
            return Ok(ns.clone());
        }
        namespace_from_file(Path::new(SERVICE_ACCOUNT_NAMESPACE_PATH))
    }
}

/// Read the namespace from a service account namespace file. A missing file
/// means we are not running in a pod; any other read error is fatal.
pub fn namespace_from_file(path: &Path) -> Result<String, FailoverError> {
    match std::fs::read_to_string(path) {
        Ok(ns) => {
            let ns = ns.trim();
            if ns.is_empty() {
                Ok("default".to_string())
            } else {
                Ok(ns.to_string())
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "Namespace file does not exist, using default namespace");
            Ok("default".to_string())
        }
        Err(e) => Err(FailoverError::Io(e)),
    }
}

fn default_tick_interval() -> u64 {
    5
}

fn default_call_timeout() -> u64 {
    5
}

fn default_service_name() -> String {
    "redis-failover".to_string()
}

fn default_port_name() -> String {
    "redis".to_string()
}

fn default_port_number() -> u16 {
    6379
}

fn default_true() -> bool {
    true
}

fn default_sentinel_addr() -> String {
    "rfs-redis-node:26379".to_string()
}

fn default_master_name() -> String {
    "mymaster".to_string()
}

fn default_response_timeout() -> u64 {
    3000
}

fn default_lease_name() -> String {
    "redis-failover-lease".to_string()
}

fn default_lease_duration() -> u64 {
    15
}

fn default_renew_deadline() -> u64 {
    10
}

fn default_retry_period() -> u64 {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_otel_service_name() -> String {
    "sentinel-failover".to_string()
}
