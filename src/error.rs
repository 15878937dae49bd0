//! Error types for sentinel-failover.

use std::time::Duration;
use thiserror::Error;

/// Errors that can stop the controller from starting or running.
#[derive(Debug, Error)]
pub enum FailoverError {
    /// IO error (signals, files, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Kubernetes client error
    #[error("Kubernetes client error: {0}")]
    Kube(#[from] kube::Error),

    /// Redis client construction error
    #[error("Redis client error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Creating the headless Service failed
    #[error("Service setup error: {0}")]
    Service(#[from] PublishError),
}

/// Failure to learn the current master address from Sentinel.
///
/// Always transient: the reconcile loop skips the tick and tries again.
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// Sentinel unreachable or replied with an error
    #[error("Sentinel error: {0}")]
    Sentinel(#[from] redis::RedisError),

    /// Sentinel does not monitor a master with this name
    #[error("Sentinel does not know master {0:?}")]
    UnknownMaster(String),

    /// Sentinel reply had an unexpected shape
    #[error("Malformed Sentinel reply: {0}")]
    MalformedReply(String),

    /// Host name returned by Sentinel could not be resolved
    #[error("Failed to resolve host {host}: {source}")]
    Lookup {
        /// Host name that failed to resolve.
        host: String,
        /// Underlying resolver error.
        #[source]
        source: std::io::Error,
    },

    /// Host name resolved to no addresses
    #[error("Host {0} resolved to no addresses")]
    NoAddresses(String),

    /// Call exceeded its deadline
    #[error("Resolution timed out after {0:?}")]
    Timeout(Duration),
}

/// Failure to write the routing target.
///
/// Always transient: the same address is retried on the next tick.
#[derive(Debug, Error)]
pub enum PublishError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Call exceeded its deadline
    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),
}

/// Failure while talking to the lease backing leader election.
///
/// Handled inside the coordinator; surfaces only as loss of leadership.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Lease was modified concurrently (stale resource version)
    #[error("Lease was modified concurrently")]
    Conflict,

    /// Lease was created concurrently
    #[error("Lease already exists")]
    AlreadyExists,

    /// Lease object is missing fields required for leader election
    #[error("Malformed lease: {0}")]
    MalformedRecord(String),
}

/// Returns true if the Kubernetes API answered with the given HTTP status.
pub(crate) fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == code)
}
