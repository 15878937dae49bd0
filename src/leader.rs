//! Leader election on top of a Kubernetes `Lease`.
//!
//! Only one controller replica may write Endpoints at a time. Replicas race
//! to hold a shared lease; the holder renews it every retry period and
//! treats itself as deposed once renewals keep failing for the renew
//! deadline. Standbys take over once the lease has gone unrenewed for its
//! full duration, measured on their own clock from the moment they last saw
//! the lease change, so skew between node clocks does not matter.
//!
//! Transitions are reported as [`LeadershipEvent`]s on a channel; what runs
//! while leading is the receiver's business.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::PostParams;
use kube::{Api, Client};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LeaseConfig;
use crate::error::{is_status, FailoverError, LeaseError};
use crate::metrics;
use crate::service::MANAGER;

/// Lease duration written on voluntary release so standbys move quickly.
const RELEASED_LEASE_DURATION: Duration = Duration::from_secs(1);

/// Leadership transition of this replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipEvent {
    /// This replica now holds the lease.
    Acquired,
    /// This replica no longer holds the lease.
    Lost,
}

/// Leader election state as stored in the lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderElectionRecord {
    /// Current holder, `None` when released.
    pub holder_identity: Option<String>,
    /// Validity of the lease after `renew_time`.
    pub lease_duration: Duration,
    /// When the current holder acquired the lease.
    pub acquire_time: Option<DateTime<Utc>>,
    /// When the current holder last renewed the lease.
    pub renew_time: Option<DateTime<Utc>>,
    /// Number of holder changes.
    pub lease_transitions: i32,
}

impl LeaderElectionRecord {
    /// Is `identity` the holder of this record.
    pub fn is_held_by(&self, identity: &str) -> bool {
        self.holder_identity.as_deref() == Some(identity)
    }

    fn is_held(&self) -> bool {
        self.holder_identity.as_deref().is_some_and(|h| !h.is_empty())
    }
}

/// Storage for the election record with optimistic concurrency.
///
/// Versions are opaque; `update` with a stale version must fail with
/// [`LeaseError::Conflict`], and `create` of an existing lock with
/// [`LeaseError::AlreadyExists`].
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Read the current record and its version, if the lock exists.
    async fn get(&self) -> Result<Option<(LeaderElectionRecord, String)>, LeaseError>;

    /// Create the lock. Returns the new version.
    async fn create(&self, record: &LeaderElectionRecord) -> Result<String, LeaseError>;

    /// Overwrite the lock if it is still at `version`. Returns the new version.
    async fn update(
        &self,
        record: &LeaderElectionRecord,
        version: &str,
    ) -> Result<String, LeaseError>;

    /// Human-readable lock name for logs.
    fn describe(&self) -> String;
}

/// Timing and identity for a [`LeaderElector`].
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Identity written into the lease.
    pub identity: String,
    /// How long a lease stays valid without renewal.
    pub lease_duration: Duration,
    /// How long the holder keeps retrying renewal before giving up.
    pub renew_deadline: Duration,
    /// Interval between acquire and renew attempts.
    pub retry_period: Duration,
}

impl ElectionConfig {
    /// Build from lease configuration and a resolved identity.
    pub fn from_lease_config(config: &LeaseConfig, identity: String) -> Self {
        Self {
            identity,
            lease_duration: config.lease_duration(),
            renew_deadline: config.renew_deadline(),
            retry_period: config.retry_period(),
        }
    }

    /// Reject an empty identity or inconsistent timings.
    pub fn validate(&self) -> Result<(), FailoverError> {
        if self.identity.is_empty() {
            return Err(FailoverError::Config("lease identity must not be empty".into()));
        }
        check_timings(self.lease_duration, self.renew_deadline, self.retry_period)
    }
}

/// A renewing holder must never be preempted, so the renew deadline has to
/// fit inside the lease and a retry has to fit inside the deadline.
pub(crate) fn check_timings(
    lease_duration: Duration,
    renew_deadline: Duration,
    retry_period: Duration,
) -> Result<(), FailoverError> {
    if retry_period.is_zero() {
        return Err(FailoverError::Config("retry period must be positive".into()));
    }
    if renew_deadline >= lease_duration {
        return Err(FailoverError::Config(format!(
            "renew deadline {renew_deadline:?} must be less than lease duration {lease_duration:?}"
        )));
    }
    if retry_period >= renew_deadline {
        return Err(FailoverError::Config(format!(
            "retry period {retry_period:?} must be less than renew deadline {renew_deadline:?}"
        )));
    }
    Ok(())
}

/// Last record we read or wrote, and when it last changed locally.
#[derive(Debug)]
struct Observed {
    record: LeaderElectionRecord,
    version: String,
    at: Instant,
}

/// Why the renew phase ended.
enum RenewExit {
    Lost,
    Cancelled,
}

/// Runs leader election against a [`LeaseLock`].
pub struct LeaderElector<L> {
    lock: L,
    config: ElectionConfig,
    observed: Option<Observed>,
}

impl<L: LeaseLock> LeaderElector<L> {
    /// Create an elector. Fails if the timings are inconsistent.
    pub fn new(lock: L, config: ElectionConfig) -> Result<Self, FailoverError> {
        config.validate()?;
        Ok(Self {
            lock,
            config,
            observed: None,
        })
    }

    /// Whether the last record we saw names us as holder.
    pub fn is_leader(&self) -> bool {
        self.observed
            .as_ref()
            .is_some_and(|o| o.record.is_held_by(&self.config.identity))
    }

    /// Compete for the lease until `cancel` fires.
    ///
    /// Every `Acquired` is followed by exactly one `Lost`, including on
    /// shutdown. Lease calls are raced against `cancel`, so shutdown is
    /// noticed even while the API server is unresponsive. The lease is not
    /// released here: once the work done while leading has stopped, call
    /// [`LeaderElector::release`] on the returned elector. Returns early if
    /// the event receiver is dropped.
    pub async fn run(
        mut self,
        events: mpsc::Sender<LeadershipEvent>,
        cancel: CancellationToken,
    ) -> Self {
        info!(
            lock = %self.lock.describe(),
            identity = %self.config.identity,
            "Starting leader election"
        );

        loop {
            if !self.acquire(&cancel).await {
                break;
            }

            info!(identity = %self.config.identity, "Acquired leadership");
            metrics::record_leadership(true);
            if events.send(LeadershipEvent::Acquired).await.is_err() {
                break;
            }

            let exit = self.renew(&cancel).await;
            if let RenewExit::Lost = exit {
                warn!(identity = %self.config.identity, "Failed to renew lease, leadership lost");
            }

            metrics::record_leadership(false);
            if events.send(LeadershipEvent::Lost).await.is_err() {
                break;
            }
            if let RenewExit::Cancelled = exit {
                break;
            }
        }

        info!(identity = %self.config.identity, "Leader election stopped");
        self
    }

    /// Retry until we hold the lease. Returns false if cancelled first.
    async fn acquire(&mut self, cancel: &CancellationToken) -> bool {
        let mut ticker = tokio::time::interval(self.config.retry_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                _ = ticker.tick() => {}
            }

            let acquired = tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                acquired = self.try_acquire_or_renew() => acquired,
            };
            if acquired {
                return true;
            }
        }
    }

    /// Keep renewing every retry period. A round of renewal that does not
    /// succeed within the renew deadline ends leadership.
    async fn renew(&mut self, cancel: &CancellationToken) -> RenewExit {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return RenewExit::Cancelled,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }

            let deadline = Instant::now() + self.config.renew_deadline;
            loop {
                let attempt = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return RenewExit::Cancelled,
                    attempt = tokio::time::timeout_at(deadline, self.try_acquire_or_renew()) => {
                        attempt
                    }
                };
                match attempt {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(_) => return RenewExit::Lost,
                }

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return RenewExit::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => return RenewExit::Lost,
                    _ = tokio::time::sleep(self.config.retry_period) => {}
                }
            }
        }
    }

    /// One attempt to take or extend the lease.
    async fn try_acquire_or_renew(&mut self) -> bool {
        let now = Utc::now();
        let mut desired = LeaderElectionRecord {
            holder_identity: Some(self.config.identity.clone()),
            lease_duration: self.config.lease_duration,
            acquire_time: Some(now),
            renew_time: Some(now),
            lease_transitions: 0,
        };

        let (current, version) = match self.lock.get().await {
            Ok(Some(found)) => found,
            Ok(None) => {
                return match self.lock.create(&desired).await {
                    Ok(version) => {
                        self.observe(desired, version);
                        true
                    }
                    Err(LeaseError::AlreadyExists) => {
                        debug!("Lease created concurrently");
                        false
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to create lease");
                        metrics::record_lease_error("create");
                        false
                    }
                };
            }
            Err(e) => {
                warn!(error = %e, "Failed to read lease");
                metrics::record_lease_error("get");
                return false;
            }
        };

        self.observe(current.clone(), version.clone());
        let observed_at = self.observed.as_ref().map_or_else(Instant::now, |o| o.at);

        let ours = current.is_held_by(&self.config.identity);
        if !ours && current.is_held() && observed_at + current.lease_duration > Instant::now() {
            debug!(holder = ?current.holder_identity, "Lease held by another replica");
            return false;
        }

        if ours {
            desired.acquire_time = current.acquire_time;
            desired.lease_transitions = current.lease_transitions;
        } else {
            desired.lease_transitions = current.lease_transitions + 1;
        }

        match self.lock.update(&desired, &version).await {
            Ok(version) => {
                self.observe(desired, version);
                true
            }
            Err(LeaseError::Conflict) => {
                debug!("Lease modified concurrently");
                false
            }
            Err(e) => {
                warn!(error = %e, "Failed to update lease");
                metrics::record_lease_error("update");
                false
            }
        }
    }

    /// Remember a record; the local clock restarts only when it was rewritten.
    fn observe(&mut self, record: LeaderElectionRecord, version: String) {
        match self.observed.as_mut() {
            Some(o) if o.version == version => o.record = record,
            _ => {
                self.observed = Some(Observed {
                    record,
                    version,
                    at: Instant::now(),
                })
            }
        }
    }

    /// Give the lease up if we hold it, so a standby can take over within
    /// one retry period. Bounded by the retry period.
    pub async fn release(&mut self) {
        if !self.is_leader() {
            return;
        }
        let Some(observed) = self.observed.as_ref() else {
            return;
        };

        let now = Utc::now();
        let record = LeaderElectionRecord {
            holder_identity: None,
            lease_duration: RELEASED_LEASE_DURATION,
            acquire_time: Some(now),
            renew_time: Some(now),
            lease_transitions: observed.record.lease_transitions,
        };
        let version = observed.version.clone();

        let result =
            tokio::time::timeout(self.config.retry_period, self.lock.update(&record, &version))
                .await;
        match result {
            Ok(Ok(version)) => {
                info!(identity = %self.config.identity, "Released lease");
                self.observe(record, version);
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to release lease");
                metrics::record_lease_error("release");
            }
            Err(_) => {
                warn!("Timed out releasing lease");
                metrics::record_lease_error("release");
            }
        }
    }
}

/// [`LeaseLock`] backed by a `coordination.k8s.io/v1` Lease.
pub struct KubeLeaseLock {
    api: Api<Lease>,
    name: String,
    namespace: String,
}

impl KubeLeaseLock {
    /// Lock on the Lease `name` in `namespace`.
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(MANAGER.to_string()),
            ..Default::default()
        }
    }

    fn to_lease(&self, record: &LeaderElectionRecord, version: Option<&str>) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: version.map(str::to_string),
                ..Default::default()
            },
            spec: Some(record_to_spec(record)),
        }
    }
}

#[async_trait]
impl LeaseLock for KubeLeaseLock {
    async fn get(&self) -> Result<Option<(LeaderElectionRecord, String)>, LeaseError> {
        let Some(lease) = self.api.get_opt(&self.name).await? else {
            return Ok(None);
        };

        let version = lease
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| LeaseError::MalformedRecord("missing resourceVersion".into()))?;
        let record = spec_to_record(lease.spec.unwrap_or_default());
        Ok(Some((record, version)))
    }

    async fn create(&self, record: &LeaderElectionRecord) -> Result<String, LeaseError> {
        let lease = self
            .api
            .create(&Self::post_params(), &self.to_lease(record, None))
            .await
            .map_err(|e| {
                if is_status(&e, 409) {
                    LeaseError::AlreadyExists
                } else {
                    LeaseError::Kube(e)
                }
            })?;
        resource_version(lease)
    }

    async fn update(
        &self,
        record: &LeaderElectionRecord,
        version: &str,
    ) -> Result<String, LeaseError> {
        let lease = self
            .api
            .replace(
                &self.name,
                &Self::post_params(),
                &self.to_lease(record, Some(version)),
            )
            .await
            .map_err(|e| {
                if is_status(&e, 409) {
                    LeaseError::Conflict
                } else {
                    LeaseError::Kube(e)
                }
            })?;
        resource_version(lease)
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

fn resource_version(lease: Lease) -> Result<String, LeaseError> {
    lease
        .metadata
        .resource_version
        .ok_or_else(|| LeaseError::MalformedRecord("missing resourceVersion".into()))
}

fn record_to_spec(record: &LeaderElectionRecord) -> LeaseSpec {
    LeaseSpec {
        holder_identity: record.holder_identity.clone(),
        lease_duration_seconds: Some(
            i32::try_from(record.lease_duration.as_secs()).unwrap_or(i32::MAX),
        ),
        acquire_time: record.acquire_time.map(MicroTime),
        renew_time: record.renew_time.map(MicroTime),
        lease_transitions: Some(record.lease_transitions),
        ..Default::default()
    }
}

fn spec_to_record(spec: LeaseSpec) -> LeaderElectionRecord {
    LeaderElectionRecord {
        holder_identity: spec.holder_identity.filter(|h| !h.is_empty()),
        lease_duration: Duration::from_secs(
            spec.lease_duration_seconds
                .and_then(|s| u64::try_from(s).ok())
                .unwrap_or(0),
        ),
        acquire_time: spec.acquire_time.map(|t| t.0),
        renew_time: spec.renew_time.map(|t| t.0),
        lease_transitions: spec.lease_transitions.unwrap_or(0),
    }
}
