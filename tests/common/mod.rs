//! Shared fakes for reconcile and leader election tests.

#![allow(dead_code)]

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use sentinel_failover::endpoints::TargetPublisher;
use sentinel_failover::leader::{ElectionConfig, LeaderElectionRecord, LeaseLock};
use sentinel_failover::sentinel::PrimaryResolver;
use sentinel_failover::service::LogicalService;
use sentinel_failover::{LeaseError, PublishError, Reconciler, ResolutionError};

// --- Constants ---

pub const TICK: Duration = Duration::from_secs(5);
pub const CALL_TIMEOUT: Duration = Duration::from_secs(2);
pub const MASTER_NAME: &str = "mymaster";

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

pub fn test_service() -> LogicalService {
    LogicalService {
        name: "redis-failover".to_string(),
        namespace: "default".to_string(),
        port_name: "redis".to_string(),
        port_number: 6379,
    }
}

// --- Resolver ---

type Script = dyn Fn(usize) -> Option<&'static str> + Send + Sync;

/// Answers the n-th call (1-based) from a script; `None` is a failure.
#[derive(Clone)]
pub struct ScriptedResolver {
    script: Arc<Script>,
    calls: Arc<Mutex<usize>>,
}

impl ScriptedResolver {
    pub fn new(script: impl Fn(usize) -> Option<&'static str> + Send + Sync + 'static) -> Self {
        Self {
            script: Arc::new(script),
            calls: Arc::new(Mutex::new(0)),
        }
    }

    /// Always answers with the same address.
    pub fn fixed(addr: &'static str) -> Self {
        Self::new(move |_| Some(addr))
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl PrimaryResolver for ScriptedResolver {
    async fn resolve(&self, master_name: &str) -> Result<IpAddr, ResolutionError> {
        let n = {
            let mut calls = self.calls.lock();
            *calls += 1;
            *calls
        };
        match (self.script)(n) {
            Some(addr) => Ok(ip(addr)),
            None => Err(ResolutionError::UnknownMaster(master_name.to_string())),
        }
    }
}

/// Never answers.
pub struct HangingResolver;

#[async_trait]
impl PrimaryResolver for HangingResolver {
    async fn resolve(&self, _master_name: &str) -> Result<IpAddr, ResolutionError> {
        std::future::pending().await
    }
}

// --- Publisher ---

/// Records every successful publish together with the resolver call count
/// at that moment, which is the tick number.
#[derive(Clone)]
pub struct RecordingPublisher {
    resolver: ScriptedResolver,
    published: Arc<Mutex<Vec<(usize, IpAddr)>>>,
    attempts: Arc<Mutex<usize>>,
    fail_attempts: Arc<Mutex<Vec<usize>>>,
}

impl RecordingPublisher {
    pub fn new(resolver: &ScriptedResolver) -> Self {
        Self {
            resolver: resolver.clone(),
            published: Arc::new(Mutex::new(Vec::new())),
            attempts: Arc::new(Mutex::new(0)),
            fail_attempts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fail the given publish attempts (1-based).
    pub fn failing_on(self, attempts: &[usize]) -> Self {
        *self.fail_attempts.lock() = attempts.to_vec();
        self
    }

    pub fn published(&self) -> Vec<(usize, IpAddr)> {
        self.published.lock().clone()
    }

    pub fn attempts(&self) -> usize {
        *self.attempts.lock()
    }
}

#[async_trait]
impl TargetPublisher for RecordingPublisher {
    async fn publish(&self, _service: &LogicalService, addr: IpAddr) -> Result<(), PublishError> {
        let attempt = {
            let mut attempts = self.attempts.lock();
            *attempts += 1;
            *attempts
        };
        if self.fail_attempts.lock().contains(&attempt) {
            return Err(PublishError::Timeout(CALL_TIMEOUT));
        }
        self.published.lock().push((self.resolver.calls(), addr));
        Ok(())
    }
}

pub fn test_reconciler(
    resolver: Arc<dyn PrimaryResolver>,
    publisher: Arc<dyn TargetPublisher>,
) -> Reconciler {
    Reconciler::new(
        resolver,
        publisher,
        test_service(),
        MASTER_NAME,
        TICK,
        CALL_TIMEOUT,
    )
}

// --- Lease lock ---

#[derive(Default)]
struct LockInner {
    record: Option<(LeaderElectionRecord, u64)>,
    failing: bool,
    hanging: bool,
}

/// In-process lease with the same optimistic concurrency rules as a
/// Kubernetes Lease. Clones share state, so several electors can compete.
#[derive(Clone, Default)]
pub struct InMemoryLeaseLock {
    inner: Arc<Mutex<LockInner>>,
}

impl InMemoryLeaseLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock pre-populated with a record held by someone else.
    pub fn held_by(holder: &str, lease_duration: Duration) -> Self {
        let lock = Self::new();
        lock.inner.lock().record = Some((
            LeaderElectionRecord {
                holder_identity: Some(holder.to_string()),
                lease_duration,
                acquire_time: None,
                renew_time: None,
                lease_transitions: 0,
            },
            1,
        ));
        lock
    }

    /// Make every operation fail, as if the API server were unreachable.
    pub fn set_failing(&self, failing: bool) {
        self.inner.lock().failing = failing;
    }

    /// Make every operation block forever, as if the API server stalled.
    pub fn set_hanging(&self, hanging: bool) {
        self.inner.lock().hanging = hanging;
    }

    async fn stall_if_hanging(&self) {
        let hanging = self.inner.lock().hanging;
        if hanging {
            std::future::pending::<()>().await;
        }
    }

    pub fn record(&self) -> Option<LeaderElectionRecord> {
        self.inner.lock().record.as_ref().map(|(r, _)| r.clone())
    }

    pub fn holder(&self) -> Option<String> {
        self.record().and_then(|r| r.holder_identity)
    }
}

fn injected() -> LeaseError {
    LeaseError::MalformedRecord("injected failure".to_string())
}

#[async_trait]
impl LeaseLock for InMemoryLeaseLock {
    async fn get(&self) -> Result<Option<(LeaderElectionRecord, String)>, LeaseError> {
        self.stall_if_hanging().await;
        let inner = self.inner.lock();
        if inner.failing {
            return Err(injected());
        }
        Ok(inner
            .record
            .as_ref()
            .map(|(r, v)| (r.clone(), v.to_string())))
    }

    async fn create(&self, record: &LeaderElectionRecord) -> Result<String, LeaseError> {
        self.stall_if_hanging().await;
        let mut inner = self.inner.lock();
        if inner.failing {
            return Err(injected());
        }
        if inner.record.is_some() {
            return Err(LeaseError::AlreadyExists);
        }
        inner.record = Some((record.clone(), 1));
        Ok("1".to_string())
    }

    async fn update(
        &self,
        record: &LeaderElectionRecord,
        version: &str,
    ) -> Result<String, LeaseError> {
        self.stall_if_hanging().await;
        let mut inner = self.inner.lock();
        if inner.failing {
            return Err(injected());
        }
        let current = match inner.record.as_ref() {
            Some((_, v)) if v.to_string() == version => *v,
            _ => return Err(LeaseError::Conflict),
        };
        let next = current + 1;
        inner.record = Some((record.clone(), next));
        Ok(next.to_string())
    }

    fn describe(&self) -> String {
        "memory/redis-failover-lease".to_string()
    }
}

pub fn election_config(identity: &str) -> ElectionConfig {
    ElectionConfig {
        identity: identity.to_string(),
        lease_duration: Duration::from_secs(15),
        renew_deadline: Duration::from_secs(10),
        retry_period: Duration::from_secs(2),
    }
}
