//! Connection lifecycle core for portlet.
//!
//! Tracks which remote services a user wants reachable through local
//! tunnel endpoints, probes them, and publishes every change:
//!
//! - **[`LifecycleManager`]**: accepts enable / disable intents, runs one
//!   probe task per enabled service, and reconciles probe results with
//!   the latest intent. Late results from superseded probes are dropped.
//!
//! - **[`ServiceStore`]**: reactive record storage built on
//!   `RecordCollection<K, V>` (`DashMap` + `tokio::sync::watch`). Reads
//!   never block writers, and every write is published on the change bus.
//!
//! - **[`ChangeBus`]**: bounded fan-out of [`ServiceChangeEvent`]s. Slow
//!   subscribers lose the oldest events and are told how many.
//!
//! - **[`Prober`]**: the reachability seam. [`TcpProber`] connects to the
//!   configured tunnel target; tests plug in scripted probers.
//!
//! - **[`Command`]**: intents routed through an `mpsc` channel to the
//!   manager's command processor, for consumers that only hold a
//!   [`CommandHandle`].

pub mod backoff;
pub mod bus;
pub mod command;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod prober;
pub mod store;
pub mod stream;

// ── Primary re-exports ──────────────────────────────────────────────
pub use backoff::{Backoff, BackoffConfig};
pub use bus::{
    ChangeBus, ChangeKind, ChangeReason, ChangeSubscription, DEFAULT_EVENT_BUFFER,
    ServiceChangeEvent,
};
pub use command::{Command, CommandHandle, ServiceControl};
pub use config::LifecycleConfig;
pub use error::{CoreError, ProbeError};
pub use lifecycle::LifecycleManager;
pub use prober::{ProbeTarget, Prober, TcpProber};
pub use store::ServiceStore;
pub use stream::{RecordStream, RecordWatchStream};
pub use tokio_util::sync::CancellationToken;

pub use model::{
    ConnectionStatus, Endpoint, Group, GroupId, Service, ServiceId, ServiceSnapshot, ServiceState,
};
