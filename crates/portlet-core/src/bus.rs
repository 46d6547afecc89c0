// ── Change notification bus ──
//
// Typed change events fanned out to any number of subscribers over a
// bounded `broadcast` ring. A subscriber that falls more than
// `capacity` events behind loses the oldest ones and is told how many
// it missed; it must re-read current state from the store afterwards.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use futures_core::Stream;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

use crate::model::{Group, GroupId, Service, ServiceId};

/// Default per-subscriber buffer size.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

// ── Event types ──────────────────────────────────────────────────────

/// What changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeKind {
    ServiceUpdated { service: Arc<Service> },
    ServiceRemoved { id: ServiceId, group_id: GroupId },
    GroupCreated { group: Arc<Group> },
    GroupRemoved { id: GroupId },
}

/// Why it changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ChangeReason {
    Registered,
    Updated,
    UserEnabled,
    UserDisabled,
    ProbeSucceeded,
    /// A connected service stopped answering probes.
    ProbeLost,
    /// The prober reported the service as permanently gone.
    ProbeFatal { message: String },
    /// The owning group was torn down.
    GroupRemoved,
    Removed,
}

/// A single published change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceChangeEvent {
    /// Bus-wide publish counter. Strictly increasing for any one service.
    pub sequence: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ChangeKind,
    #[serde(flatten)]
    pub reason: ChangeReason,
}

impl ServiceChangeEvent {
    /// Service this event concerns, if any.
    pub fn service_id(&self) -> Option<&ServiceId> {
        match &self.kind {
            ChangeKind::ServiceUpdated { service } => Some(&service.id),
            ChangeKind::ServiceRemoved { id, .. } => Some(id),
            ChangeKind::GroupCreated { .. } | ChangeKind::GroupRemoved { .. } => None,
        }
    }

    /// New service record carried by this event, if any.
    pub fn service(&self) -> Option<&Arc<Service>> {
        match &self.kind {
            ChangeKind::ServiceUpdated { service } => Some(service),
            _ => None,
        }
    }
}

// ── ChangeBus ────────────────────────────────────────────────────────

/// Publisher side. Owned by the record store.
pub struct ChangeBus {
    tx: broadcast::Sender<Arc<ServiceChangeEvent>>,
    sequence: AtomicU64,
}

impl ChangeBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            sequence: AtomicU64::new(0),
        }
    }

    /// Publish an event. Never blocks; returns the assigned sequence.
    pub fn publish(&self, kind: ChangeKind, reason: ChangeReason) -> u64 {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let event = ServiceChangeEvent {
            sequence,
            at: Utc::now(),
            kind,
            reason,
        };
        // No receivers is not an error: nobody is watching yet.
        let _ = self.tx.send(Arc::new(event));
        sequence
    }

    /// Subscribe from the next published event onward.
    pub fn subscribe(&self) -> ChangeSubscription {
        ChangeSubscription {
            rx: self.tx.subscribe(),
            missed: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Sequence number of the most recently published event.
    pub fn last_sequence(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

// ── ChangeSubscription ───────────────────────────────────────────────

/// Subscriber side. One per observer.
pub struct ChangeSubscription {
    rx: broadcast::Receiver<Arc<ServiceChangeEvent>>,
    missed: u64,
}

impl ChangeSubscription {
    /// Wait for the next event. Returns `None` once the bus is dropped.
    pub async fn recv(&mut self) -> Option<Arc<ServiceChangeEvent>> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Arc<ServiceChangeEvent>> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Total events dropped because this subscriber fell behind.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    /// Convert into a `Stream`, silently skipping over lag gaps.
    pub fn into_stream(self) -> impl Stream<Item = Arc<ServiceChangeEvent>> + Send + Unpin {
        BroadcastStream::new(self.rx).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(lagged) => {
                warn!(error = %lagged, "change subscriber lagged, events dropped");
                None
            }
        })
    }

    fn record_lag(&mut self, skipped: u64) {
        self.missed += skipped;
        warn!(skipped, total = self.missed, "change subscriber lagged, events dropped");
    }
}
