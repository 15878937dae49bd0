//! The reconcile loop run while this replica leads.
//!
//! Each tick asks Sentinel for the master and rewrites the Endpoints only if
//! the answer differs from what this term last published successfully. The
//! last published address lives on the loop's stack: a new term always
//! starts without one, so its first successful lookup is always published,
//! whatever the previous leader left behind.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::endpoints::TargetPublisher;
use crate::error::{PublishError, ResolutionError};
use crate::metrics::{self, TickOutcome, Timer};
use crate::sentinel::PrimaryResolver;
use crate::service::LogicalService;

/// Keeps one Service's Endpoints on the current master.
#[derive(Clone)]
pub struct Reconciler {
    resolver: Arc<dyn PrimaryResolver>,
    publisher: Arc<dyn TargetPublisher>,
    service: LogicalService,
    master_name: String,
    tick_interval: Duration,
    call_timeout: Duration,
}

impl Reconciler {
    /// Create a reconciler. Nothing runs until [`Reconciler::run`].
    pub fn new(
        resolver: Arc<dyn PrimaryResolver>,
        publisher: Arc<dyn TargetPublisher>,
        service: LogicalService,
        master_name: impl Into<String>,
        tick_interval: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            resolver,
            publisher,
            service,
            master_name: master_name.into(),
            tick_interval,
            call_timeout,
        }
    }

    /// Run one leadership term until `cancel` fires.
    ///
    /// The first tick fires immediately. Ticks never overlap; a slow tick
    /// delays the next one. Cancellation is honoured both between ticks and
    /// during an in-flight tick.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            service = %self.service.name,
            namespace = %self.service.namespace,
            master = %self.master_name,
            interval = ?self.tick_interval,
            "Starting endpoints reconciliation"
        );

        let mut last_published: Option<IpAddr> = None;
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                outcome = self.tick(&mut last_published) => metrics::record_tick(outcome),
            }
        }

        info!(service = %self.service.name, "Stopping endpoints reconciliation");
    }

    /// One pass: resolve, compare, publish on change.
    ///
    /// `last_published` is only updated after a successful publish, so a
    /// failed write is retried on the next tick.
    pub async fn tick(&self, last_published: &mut Option<IpAddr>) -> TickOutcome {
        let addr = match self.resolve().await {
            Ok(addr) => addr,
            Err(e) => {
                warn!(
                    master = %self.master_name,
                    error = %e,
                    "Failed to resolve master, skipping tick"
                );
                return TickOutcome::ResolveFailed;
            }
        };

        if *last_published == Some(addr) {
            debug!(%addr, "Master unchanged");
            return TickOutcome::Unchanged;
        }

        match self.publish(addr).await {
            Ok(()) => {
                info!(
                    service = %self.service.name,
                    %addr,
                    previous = ?last_published,
                    "Updated endpoints with new master"
                );
                *last_published = Some(addr);
                TickOutcome::Published
            }
            Err(e) => {
                warn!(
                    service = %self.service.name,
                    %addr,
                    error = %e,
                    "Failed to update endpoints"
                );
                TickOutcome::PublishFailed
            }
        }
    }

    async fn resolve(&self) -> Result<IpAddr, ResolutionError> {
        let timer = Timer::start();
        let lookup = self.resolver.resolve(&self.master_name);
        let result = tokio::time::timeout(self.call_timeout, lookup)
            .await
            .unwrap_or(Err(ResolutionError::Timeout(self.call_timeout)));
        metrics::record_resolution(result.is_ok(), timer.elapsed());
        result
    }

    async fn publish(&self, addr: IpAddr) -> Result<(), PublishError> {
        let timer = Timer::start();
        let write = self.publisher.publish(&self.service, addr);
        let result = tokio::time::timeout(self.call_timeout, write)
            .await
            .unwrap_or(Err(PublishError::Timeout(self.call_timeout)));
        metrics::record_publish(result.is_ok(), timer.elapsed());
        result
    }
}
