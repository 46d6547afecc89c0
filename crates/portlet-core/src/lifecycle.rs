// ── Connection lifecycle manager ──
//
// Owns the per-service state machine
//
//     Disconnected ──enable──▶ Connecting ──probe ok──▶ Connected
//          ▲                      │  ▲                     │
//          └──disable / fatal─────┘  └──probe lost─────────┘
//
// and reconciles asynchronous probe results with user intent. Every
// transition for one service happens under that service's slot mutex;
// different services never share a lock. Probes run in their own tasks
// and never hold the slot lock while waiting on the network.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::bus::{ChangeReason, ChangeSubscription};
use crate::command::{COMMAND_CHANNEL_SIZE, Command, CommandEnvelope, CommandHandle, ServiceControl};
use crate::config::LifecycleConfig;
use crate::error::{CoreError, ProbeError};
use crate::model::{Endpoint, Group, GroupId, Service, ServiceId, ServiceState};
use crate::prober::Prober;
use crate::store::ServiceStore;

// ── Per-service slot ─────────────────────────────────────────────

/// Serialization point and retry state for one service.
struct ServiceSlot {
    /// Replaced on every enable and disable with a manager-wide unique
    /// value. A probe task only applies results while its generation is
    /// current.
    generation: u64,
    /// Cancellation token of the in-flight probe task, if any.
    probe: Option<CancellationToken>,
    backoff: Backoff,
}

impl ServiceSlot {
    fn new(backoff: Backoff) -> Self {
        Self {
            generation: 0,
            probe: None,
            backoff,
        }
    }

    /// Retire the current probe under a fresh `generation`. Its late
    /// results become stale.
    fn retire_probe(&mut self, generation: u64) {
        self.generation = generation;
        if let Some(token) = self.probe.take() {
            token.cancel();
        }
        self.backoff.reset();
    }
}

/// What a probe task does after a result has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextStep {
    /// Probe again after the delay.
    ProbeAfter(Duration),
    /// The task is finished.
    Stop,
}

// ── LifecycleManager ─────────────────────────────────────────────

/// The main entry point for consumers.
///
/// Cheaply cloneable via `Arc<ManagerInner>`. Accepts enable / disable
/// intents, drives probes, and writes every resulting state into the
/// [`ServiceStore`], which publishes the changes.
pub struct LifecycleManager<P: Prober> {
    inner: Arc<ManagerInner<P>>,
}

impl<P: Prober> Clone for LifecycleManager<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ManagerInner<P: Prober> {
    config: LifecycleConfig,
    store: Arc<ServiceStore>,
    prober: P,
    slots: DashMap<ServiceId, Arc<Mutex<ServiceSlot>>>,
    /// Source of slot generations. Never reused, even across re-registration.
    generations: AtomicU64,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl<P: Prober> LifecycleManager<P> {
    pub fn new(config: LifecycleConfig, prober: P) -> Self {
        let store = Arc::new(ServiceStore::new(config.event_buffer));
        Self::with_store(config, prober, store)
    }

    /// Build a manager over an existing store.
    ///
    /// The manager assumes it is the store's only writer.
    pub fn with_store(config: LifecycleConfig, prober: P, store: Arc<ServiceStore>) -> Self {
        let slots = DashMap::new();
        for service in store.services_snapshot().iter() {
            let backoff = Backoff::seeded(config.backoff.clone(), &service.id);
            slots.insert(service.id.clone(), Arc::new(Mutex::new(ServiceSlot::new(backoff))));
        }

        Self {
            inner: Arc::new(ManagerInner {
                config,
                store,
                prober,
                slots,
                generations: AtomicU64::new(0),
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<ServiceStore> {
        &self.inner.store
    }

    pub fn prober(&self) -> &P {
        &self.inner.prober
    }

    // ── Registration ─────────────────────────────────────────────

    /// Create a group (a new tunnel / connection context).
    pub fn add_group(&self, id: GroupId, name: impl Into<String>) -> Result<Arc<Group>, CoreError> {
        let group = self.inner.store.insert_group(Group::new(id, name))?;
        debug!(group = %group.id, "group registered");
        Ok(group)
    }

    /// Register a service in `Disconnected` state.
    pub fn add_service(
        &self,
        group_id: GroupId,
        id: ServiceId,
        source_name: impl Into<String>,
    ) -> Result<Arc<Service>, CoreError> {
        if self.inner.slots.contains_key(&id) {
            return Err(CoreError::DuplicateService { id });
        }
        let service = Service::new(id.clone(), group_id, source_name);
        let stored = self
            .inner
            .store
            .upsert_with_reason(service, ChangeReason::Registered)?;
        let backoff = Backoff::seeded(self.inner.config.backoff.clone(), &id);
        self.inner
            .slots
            .insert(id, Arc::new(Mutex::new(ServiceSlot::new(backoff))));
        debug!(service = %stored.id, group = %stored.group_id, "service registered");
        Ok(stored)
    }

    /// Disable and forget a single service.
    pub async fn remove_service(&self, id: &ServiceId) -> Result<(), CoreError> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock().await;
        slot.retire_probe(self.next_generation());
        self.inner.store.remove(id);
        self.inner.slots.remove(id);
        debug!(service = %id, "service removed");
        Ok(())
    }

    /// Tear down a group: disable every member, then drop the members
    /// and the group itself.
    pub async fn remove_group(&self, id: &GroupId) -> Result<(), CoreError> {
        let group = self
            .inner
            .store
            .group(id)
            .ok_or_else(|| CoreError::GroupNotFound { id: id.clone() })?;

        for member in &group.service_ids {
            match self.disable_with_reason(member, ChangeReason::GroupRemoved).await {
                Ok(()) | Err(CoreError::ServiceNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
            if let Err(e) = self.remove_service(member).await {
                debug!(service = %member, error = %e, "member already gone");
            }
        }
        self.inner.store.remove_group(id);
        info!(group = %id, "group torn down");
        Ok(())
    }

    // ── Intents ──────────────────────────────────────────────────

    /// Request a connection.
    ///
    /// No-op if the service is already connecting or connected, or a
    /// probe is already in flight.
    pub async fn enable(&self, id: &ServiceId) -> Result<(), CoreError> {
        if self.inner.cancel.is_cancelled() {
            return Err(CoreError::ManagerShutDown);
        }
        let slot = self.slot(id)?;
        let mut slot = slot.lock().await;
        let current = self.current(id)?;

        if current.enabled() || slot.probe.is_some() {
            debug!(service = %id, status = %current.status(), "enable ignored");
            return Ok(());
        }

        self.inner
            .store
            .upsert_with_reason(current.with_state(ServiceState::Connecting), ChangeReason::UserEnabled)?;

        let generation = self.next_generation();
        slot.retire_probe(generation);
        let token = self.inner.cancel.child_token();
        slot.probe = Some(token.clone());
        self.inner
            .tasks
            .spawn(probe_task(self.clone(), id.clone(), generation, token));

        info!(service = %id, "connecting");
        Ok(())
    }

    /// Drop a connection immediately, whatever its state.
    pub async fn disable(&self, id: &ServiceId) -> Result<(), CoreError> {
        self.disable_with_reason(id, ChangeReason::UserDisabled).await
    }

    async fn disable_with_reason(&self, id: &ServiceId, reason: ChangeReason) -> Result<(), CoreError> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock().await;
        let current = self.current(id)?;

        slot.retire_probe(self.next_generation());
        if current.enabled() {
            self.inner
                .store
                .upsert_with_reason(current.with_state(ServiceState::Disconnected), reason)?;
            info!(service = %id, "disconnected");
        }
        Ok(())
    }

    // ── Probe reconciliation ─────────────────────────────────────

    /// Run one probe bounded by the configured timeout.
    async fn run_probe(&self, id: &ServiceId, cancel: CancellationToken) -> Result<Endpoint, ProbeError> {
        let timeout = self.inner.config.probe_timeout;
        match tokio::time::timeout(timeout, self.inner.prober.probe(id, cancel)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::transient(format!("probe timed out after {timeout:?}"))),
        }
    }

    /// Apply a probe outcome if it still belongs to the current
    /// generation and the service is still wanted.
    async fn apply_probe_outcome(
        &self,
        id: &ServiceId,
        generation: u64,
        outcome: Result<Endpoint, ProbeError>,
    ) -> NextStep {
        let Ok(slot) = self.slot(id) else {
            return NextStep::Stop;
        };
        let mut slot = slot.lock().await;

        if slot.generation != generation {
            debug!(service = %id, generation, current = slot.generation, "discarding stale probe result");
            return NextStep::Stop;
        }
        let Some(current) = self.inner.store.get(id).filter(|s| s.enabled()) else {
            slot.probe = None;
            return NextStep::Stop;
        };

        let step = match outcome {
            Ok(endpoint) => {
                slot.backoff.reset();
                if current.endpoint() != Some(&endpoint) {
                    let next = current.with_state(ServiceState::Connected { endpoint });
                    if let Err(e) = self.inner.store.upsert_with_reason(next, ChangeReason::ProbeSucceeded) {
                        warn!(service = %id, error = %e, "cannot record connected state");
                    } else {
                        info!(service = %id, "connected");
                    }
                }
                self.inner
                    .config
                    .health_interval
                    .map_or(NextStep::Stop, NextStep::ProbeAfter)
            }
            Err(ProbeError::Transient { reason }) => {
                if current.available() {
                    let next = current.with_state(ServiceState::Connecting);
                    if let Err(e) = self.inner.store.upsert_with_reason(next, ChangeReason::ProbeLost) {
                        warn!(service = %id, error = %e, "cannot record lost connection");
                    }
                }
                let delay = slot.backoff.next_delay();
                debug!(service = %id, %reason, ?delay, attempt = slot.backoff.attempt(), "probe failed, retrying");
                NextStep::ProbeAfter(delay)
            }
            Err(ProbeError::Fatal { reason }) => {
                warn!(service = %id, %reason, "service unavailable upstream, disconnecting");
                let next = current.with_state(ServiceState::Disconnected);
                let cause = ChangeReason::ProbeFatal { message: reason };
                if let Err(e) = self.inner.store.upsert_with_reason(next, cause) {
                    warn!(service = %id, error = %e, "cannot record forced disconnect");
                }
                slot.backoff.reset();
                NextStep::Stop
            }
            Err(ProbeError::Cancelled) => NextStep::Stop,
        };

        if step == NextStep::Stop {
            slot.probe = None;
        }
        step
    }

    // ── Command processing ───────────────────────────────────────

    /// Spawn the command processor and return a handle to it.
    ///
    /// Each call starts an independent processor; all of them stop when
    /// the manager shuts down.
    pub fn start_command_processor(&self) -> CommandHandle {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        self.inner
            .tasks
            .spawn(command_processor_task(self.clone(), rx));
        CommandHandle::new(tx)
    }

    /// Apply a single command directly.
    pub async fn execute(&self, command: Command) -> Result<(), CoreError> {
        match command {
            Command::Enable { id } => self.enable(&id).await,
            Command::Disable { id } => self.disable(&id).await,
            Command::RemoveGroup { id } => self.remove_group(&id).await,
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────

    /// Cancel every probe and the command processors, then wait for
    /// their tasks to finish. Recorded states are left as they are.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        debug!("lifecycle manager shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    // ── Observation ──────────────────────────────────────────────

    pub fn subscribe(&self) -> ChangeSubscription {
        self.inner.store.subscribe()
    }

    pub fn service(&self, id: &ServiceId) -> Option<Arc<Service>> {
        self.inner.store.get(id)
    }

    pub fn services(&self, group_id: &GroupId) -> Vec<Arc<Service>> {
        self.inner.store.list(group_id)
    }

    /// Number of services with a probe task currently in flight.
    pub async fn probes_in_flight(&self) -> usize {
        let slots: Vec<_> = self.inner.slots.iter().map(|r| Arc::clone(r.value())).collect();
        let mut count = 0;
        for slot in slots {
            if slot.lock().await.probe.is_some() {
                count += 1;
            }
        }
        count
    }

    /// Forget the probe token of a task that exits without a result,
    /// unless a later enable or disable already replaced it.
    async fn release_probe(&self, id: &ServiceId, generation: u64) {
        let Ok(slot) = self.slot(id) else {
            return;
        };
        let mut slot = slot.lock().await;
        if slot.generation == generation {
            slot.probe = None;
        }
    }

    // ── Private helpers ──────────────────────────────────────────

    fn next_generation(&self) -> u64 {
        self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn slot(&self, id: &ServiceId) -> Result<Arc<Mutex<ServiceSlot>>, CoreError> {
        self.inner
            .slots
            .get(id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| CoreError::ServiceNotFound { id: id.clone() })
    }

    fn current(&self, id: &ServiceId) -> Result<Arc<Service>, CoreError> {
        self.inner
            .store
            .get(id)
            .ok_or_else(|| CoreError::ServiceNotFound { id: id.clone() })
    }
}

impl<P: Prober> ServiceControl for LifecycleManager<P> {
    async fn enable(&self, id: &ServiceId) -> Result<(), CoreError> {
        LifecycleManager::enable(self, id).await
    }

    async fn disable(&self, id: &ServiceId) -> Result<(), CoreError> {
        LifecycleManager::disable(self, id).await
    }
}

// ── Background tasks ─────────────────────────────────────────────

/// Probe one service until it connects (or, with a health interval,
/// until it is disabled), retrying transient failures with backoff.
async fn probe_task<P: Prober>(
    manager: LifecycleManager<P>,
    id: ServiceId,
    generation: u64,
    cancel: CancellationToken,
) {
    loop {
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            outcome = manager.run_probe(&id, cancel.clone()) => outcome,
        };

        match manager.apply_probe_outcome(&id, generation, outcome).await {
            NextStep::Stop => break,
            NextStep::ProbeAfter(delay) => {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    manager.release_probe(&id, generation).await;
    debug!(service = %id, generation, "probe task finished");
}

/// Process commands from the mpsc channel.
async fn command_processor_task<P: Prober>(
    manager: LifecycleManager<P>,
    mut rx: mpsc::Receiver<CommandEnvelope>,
) {
    let cancel = manager.inner.cancel.clone();

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            envelope = rx.recv() => {
                let Some(envelope) = envelope else { break };
                let command = envelope.command.clone();
                let result = manager.execute(envelope.command).await;
                match envelope.response_tx {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            warn!(?command, error = %e, "command failed");
                        }
                    }
                }
            }
        }
    }
}
