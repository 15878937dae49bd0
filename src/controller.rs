//! Controller setup and lifecycle management.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::FailoverConfig;
use crate::endpoints::EndpointsPublisher;
use crate::error::FailoverError;
use crate::leader::{ElectionConfig, KubeLeaseLock, LeaderElector, LeaseLock, LeadershipEvent};
use crate::reconcile::Reconciler;
use crate::sentinel::SentinelResolver;
use crate::service::{ensure_service, LogicalService};

/// Buffer for leadership events; the elector never has more than two in flight.
const EVENT_BUFFER: usize = 4;

/// Keeps a Service's Endpoints on the Redis master while this replica leads.
pub struct FailoverController {
    config: FailoverConfig,
}

impl FailoverController {
    /// Create a controller with the given configuration.
    pub fn new(config: FailoverConfig) -> Self {
        Self { config }
    }

    /// Run until `shutdown` is cancelled. Releases the lease before returning.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), FailoverError> {
        self.config.validate()?;

        let service = LogicalService::from_config(&self.config.service)?;
        let identity = self.config.lease.resolve_holder_identity();

        info!(
            service = %service.name,
            namespace = %service.namespace,
            sentinel = %self.config.sentinel.addr,
            master = %self.config.sentinel.master_name,
            lease = %self.config.lease.name,
            identity = %identity,
            "Starting sentinel-failover controller"
        );

        let client = kube::Client::try_default().await?;

        // The Service only has to exist once; an earlier replica may have made it.
        if self.config.service.create_service
            && ensure_service(client.clone(), &service).await.is_err()
        {
            warn!(service = %service.name, "Continuing without creating the service");
        }

        let resolver = Arc::new(SentinelResolver::new(&self.config.sentinel)?);
        let publisher = Arc::new(EndpointsPublisher::new(client.clone()));
        let reconciler = Reconciler::new(
            resolver,
            publisher,
            service.clone(),
            self.config.sentinel.master_name.clone(),
            self.config.tick_interval(),
            self.config.call_timeout(),
        );

        let lock = KubeLeaseLock::new(client, &service.namespace, &self.config.lease.name);
        let elector = LeaderElector::new(
            lock,
            ElectionConfig::from_lease_config(&self.config.lease, identity),
        )?;

        run_elected(elector, reconciler, shutdown).await;

        info!("Controller stopped");
        Ok(())
    }
}

/// Run leader election and reconcile while leading, until `shutdown` fires.
///
/// The lease is released only after the last term has stopped, so no write
/// from this replica can land once a standby has taken over.
pub async fn run_elected<L>(
    elector: LeaderElector<L>,
    reconciler: Reconciler,
    shutdown: CancellationToken,
) where
    L: LeaseLock + 'static,
{
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let election = tokio::spawn(elector.run(tx, shutdown.clone()));

    // Returns once the elector has dropped its sender and the term is stopped.
    supervise(rx, reconciler, shutdown).await;

    match election.await {
        Ok(mut elector) => elector.release().await,
        Err(e) => error!("Leader election task panicked: {}", e),
    }
}

/// A running reconcile term.
struct Term {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Term {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            error!("Reconcile task panicked: {}", e);
        }
    }
}

/// Start a reconcile term on every `Acquired` and stop it on `Lost`.
///
/// Each term runs on its own task under a child of `shutdown`, so it ends on
/// either event. Returns once the event channel closes and any running term
/// has stopped.
pub async fn supervise(
    mut events: mpsc::Receiver<LeadershipEvent>,
    reconciler: Reconciler,
    shutdown: CancellationToken,
) {
    let mut term: Option<Term> = None;

    while let Some(event) = events.recv().await {
        match event {
            LeadershipEvent::Acquired => {
                if let Some(stale) = term.take() {
                    warn!("Leadership acquired while a term was still running");
                    stale.stop().await;
                }

                info!("Became the leader, starting to manage endpoints");
                let cancel = shutdown.child_token();
                let handle = tokio::spawn({
                    let reconciler = reconciler.clone();
                    let cancel = cancel.clone();
                    async move { reconciler.run(cancel).await }
                });
                term = Some(Term { cancel, handle });
            }
            LeadershipEvent::Lost => {
                info!("Lost leadership, stopping endpoints management");
                if let Some(term) = term.take() {
                    term.stop().await;
                }
            }
        }
    }

    if let Some(term) = term.take() {
        term.stop().await;
    }
}
