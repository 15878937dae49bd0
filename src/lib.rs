//! Sentinel Failover - keeps a Kubernetes Service pointed at the Redis master.
//!
//! Redis Sentinel decides which replica is master; clients inside the
//! cluster should not have to speak the Sentinel protocol to find it. This
//! crate runs as a small, replicated controller that publishes the current
//! master address as the Endpoints of a selector-less headless Service, so
//! `redis-failover.<namespace>.svc` always reaches the master, including
//! after a failover.
//!
//! ## Features
//!
//! - Leader election on a Kubernetes `Lease`; only one replica writes
//! - Endpoints rewritten only when Sentinel reports a different master
//! - Fresh state on every leadership term, so a new leader always republishes
//! - Resolution and publish failures are logged and retried on the next tick
//! - Graceful shutdown releases the lease for fast hand-over
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       sentinel-failover                         │
//! │                                                                 │
//! │  ┌──────────────────┐  Acquired/Lost  ┌──────────────────┐      │
//! │  │  LeaderElector   │────────────────▶│   supervise      │      │
//! │  │  (Lease)         │                 │   (one term)     │      │
//! │  └──────────────────┘                 └────────┬─────────┘      │
//! │                                                │ spawn          │
//! │                                                ▼                │
//! │  ┌──────────────────┐   resolve       ┌──────────────────┐      │
//! │  │ SentinelResolver │◀────────────────│   Reconciler     │      │
//! │  │ + host lookup    │                 │   (tick loop)    │      │
//! │  └──────────────────┘                 └────────┬─────────┘      │
//! │                                                │ publish        │
//! │                                                ▼                │
//! │                                       ┌──────────────────┐      │
//! │                                       │   Endpoints      │      │
//! │                                       │   Publisher      │      │
//! │                                       └──────────────────┘      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use sentinel_failover::{FailoverConfig, FailoverController};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let shutdown = CancellationToken::new();
//!     let controller = FailoverController::new(FailoverConfig::default());
//!     controller.run(shutdown).await.unwrap();
//! }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod controller;
pub mod endpoints;
pub mod error;
#[cfg(test)]
mod kube_mock;
pub mod leader;
pub mod metrics;
pub mod reconcile;
pub mod sentinel;
pub mod service;
pub mod telemetry;

// Re-export main types
pub use config::{
    Config, FailoverConfig, LeaseConfig, LogFormat, SentinelConfig, ServiceConfig, TelemetryConfig,
};
pub use controller::FailoverController;
pub use error::{FailoverError, LeaseError, PublishError, ResolutionError};
pub use leader::{LeaderElector, LeadershipEvent};
pub use metrics::TickOutcome;
pub use reconcile::Reconciler;
