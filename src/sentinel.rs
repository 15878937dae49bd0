//! Master address resolution through Redis Sentinel.
//!
//! Sentinel answers `SENTINEL get-master-addr-by-name` with the host it
//! knows the master under. That host may be a DNS name (pod hostname with
//! `announce-hostnames`), so the answer goes through a second lookup step
//! and the first address returned wins.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use parking_lot::Mutex;
use redis::IntoConnectionInfo;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::SentinelConfig;
use crate::error::{FailoverError, ResolutionError};

/// Answers "where is the master of this replica set right now".
#[async_trait]
pub trait PrimaryResolver: Send + Sync {
    /// Resolve the current master of `master_name` to a concrete address.
    async fn resolve(&self, master_name: &str) -> Result<IpAddr, ResolutionError>;
}

/// Host name to address resolution.
#[async_trait]
pub trait HostLookup: Send + Sync {
    /// Resolve `host` to its addresses, in resolver order.
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, ResolutionError>;
}

/// Resolves host names with the system resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLookup;

#[async_trait]
impl HostLookup for SystemLookup {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, ResolutionError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|source| ResolutionError::Lookup {
                host: host.to_string(),
                source,
            })?;

        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

/// Resolves the master through a Sentinel instance.
pub struct SentinelResolver<L = SystemLookup> {
    client: redis::Client,
    conn: Mutex<Option<MultiplexedConnection>>,
    response_timeout: Duration,
    lookup: L,
}

impl SentinelResolver<SystemLookup> {
    /// Create a resolver for the configured Sentinel. Does not connect yet.
    pub fn new(config: &SentinelConfig) -> Result<Self, FailoverError> {
        Self::with_lookup(config, SystemLookup)
    }
}

impl<L: HostLookup> SentinelResolver<L> {
    /// Create a resolver with a custom host lookup.
    pub fn with_lookup(config: &SentinelConfig, lookup: L) -> Result<Self, FailoverError> {
        let mut info = format!("redis://{}", config.addr).into_connection_info()?;
        info.redis.password = config.password.clone();

        Ok(Self {
            client: redis::Client::open(info)?,
            conn: Mutex::new(None),
            response_timeout: config.response_timeout(),
            lookup,
        })
    }

    /// Reuse the cached connection or open a new one.
    async fn connection(&self) -> Result<MultiplexedConnection, ResolutionError> {
        let cached = self.conn.lock().clone();
        if let Some(conn) = cached {
            return Ok(conn);
        }

        debug!("Connecting to Sentinel");
        let conn = tokio::time::timeout(
            self.response_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| ResolutionError::Timeout(self.response_timeout))??;

        *self.conn.lock() = Some(conn.clone());
        Ok(conn)
    }

    async fn master_host(&self, master_name: &str) -> Result<String, ResolutionError> {
        let mut conn = self.connection().await?;

        // The multiplexer neither repairs a broken socket nor notices a silent
        // one, so the cached connection goes unless the query settles cleanly.
        // This also covers the caller dropping us mid-query.
        let mut stale = StaleOnDrop::new(&self.conn);

        let reply: Result<Result<Option<Vec<String>>, redis::RedisError>, _> =
            tokio::time::timeout(
                self.response_timeout,
                redis::cmd("SENTINEL")
                    .arg("get-master-addr-by-name")
                    .arg(master_name)
                    .query_async(&mut conn),
            )
            .await;

        match reply {
            Ok(Ok(reply)) => {
                stale.disarm();
                parse_master_reply(master_name, reply)
            }
            Ok(Err(e)) if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() => {
                warn!(error = %e, "Dropping Sentinel connection");
                Err(e.into())
            }
            Ok(Err(e)) => {
                stale.disarm();
                Err(e.into())
            }
            Err(_) => {
                warn!(
                    timeout = ?self.response_timeout,
                    "Sentinel did not answer, dropping connection"
                );
                Err(ResolutionError::Timeout(self.response_timeout))
            }
        }
    }
}

/// Clears the cached connection when dropped, unless disarmed.
struct StaleOnDrop<'a> {
    slot: &'a Mutex<Option<MultiplexedConnection>>,
    armed: bool,
}

impl<'a> StaleOnDrop<'a> {
    fn new(slot: &'a Mutex<Option<MultiplexedConnection>>) -> Self {
        Self { slot, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StaleOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            *self.slot.lock() = None;
        }
    }
}

#[async_trait]
impl<L: HostLookup> PrimaryResolver for SentinelResolver<L> {
    async fn resolve(&self, master_name: &str) -> Result<IpAddr, ResolutionError> {
        let host = self.master_host(master_name).await?;
        let addrs = self.lookup.lookup(&host).await?;
        let ip = first_address(&host, addrs)?;
        debug!(master = master_name, %host, %ip, "Resolved master");
        Ok(ip)
    }
}

/// Extract the host from a `[host, port]` reply. A nil reply means Sentinel
/// does not monitor this master.
fn parse_master_reply(
    master_name: &str,
    reply: Option<Vec<String>>,
) -> Result<String, ResolutionError> {
    let fields = reply.ok_or_else(|| ResolutionError::UnknownMaster(master_name.to_string()))?;
    match fields.first() {
        Some(host) if !host.is_empty() => Ok(host.clone()),
        _ => Err(ResolutionError::MalformedReply(format!(
            "expected [host, port], got {fields:?}"
        ))),
    }
}

/// First candidate wins; no health-aware selection.
fn first_address(host: &str, addrs: Vec<IpAddr>) -> Result<IpAddr, ResolutionError> {
    addrs
        .into_iter()
        .next()
        .ok_or_else(|| ResolutionError::NoAddresses(host.to_string()))
}
