// Lifecycle manager scenarios driven by a scripted prober.

#![allow(clippy::unwrap_used)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use portlet_core::{
    BackoffConfig, ChangeKind, ChangeReason, ChangeSubscription, Command, ConnectionStatus,
    CoreError, Endpoint, LifecycleConfig, LifecycleManager, ProbeError, Prober, ServiceChangeEvent,
    ServiceControl, ServiceId,
};

// ── Scripted prober ─────────────────────────────────────────────────

type ProbeResult = Result<Endpoint, ProbeError>;

enum Reply {
    Now(ProbeResult),
    /// Resolves when the test sends on the paired channel. Ignores
    /// cancellation, so a late result can race a disable.
    Gated(oneshot::Receiver<ProbeResult>),
}

#[derive(Default)]
struct Script {
    replies: HashMap<ServiceId, VecDeque<Reply>>,
    calls: HashMap<ServiceId, usize>,
}

/// Answers probes from a per-service queue. Unscripted probes never
/// resolve.
#[derive(Clone, Default)]
struct ScriptedProber {
    script: Arc<Mutex<Script>>,
}

impl ScriptedProber {
    fn reply(&self, id: &str, result: ProbeResult) {
        self.push(id, Reply::Now(result));
    }

    fn gate(&self, id: &str) -> oneshot::Sender<ProbeResult> {
        let (tx, rx) = oneshot::channel();
        self.push(id, Reply::Gated(rx));
        tx
    }

    fn push(&self, id: &str, reply: Reply) {
        self.script
            .lock()
            .unwrap()
            .replies
            .entry(id.into())
            .or_default()
            .push_back(reply);
    }

    fn calls(&self, id: &str) -> usize {
        self.script
            .lock()
            .unwrap()
            .calls
            .get(&ServiceId::from(id))
            .copied()
            .unwrap_or(0)
    }
}

impl Prober for ScriptedProber {
    fn probe(
        &self,
        id: &ServiceId,
        _cancel: CancellationToken,
    ) -> impl Future<Output = ProbeResult> + Send {
        let reply = {
            let mut script = self.script.lock().unwrap();
            *script.calls.entry(id.clone()).or_default() += 1;
            script.replies.get_mut(id).and_then(VecDeque::pop_front)
        };
        async move {
            match reply {
                Some(Reply::Now(result)) => result,
                Some(Reply::Gated(rx)) => rx.await.unwrap_or(Err(ProbeError::Cancelled)),
                None => std::future::pending().await,
            }
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn test_config() -> LifecycleConfig {
    LifecycleConfig {
        probe_timeout: Duration::from_secs(30),
        health_interval: None,
        backoff: BackoffConfig {
            initial: Duration::from_millis(5),
            max: Duration::from_millis(40),
            multiplier: 2.0,
            jitter: 0.25,
        },
        ..LifecycleConfig::default()
    }
}

fn setup_with(config: LifecycleConfig) -> (LifecycleManager<ScriptedProber>, ScriptedProber) {
    let prober = ScriptedProber::default();
    let manager = LifecycleManager::new(config, prober.clone());
    manager.add_group("tunnel-a".into(), "Office tunnel").unwrap();
    manager
        .add_service("tunnel-a".into(), "svc2".into(), "Postgres")
        .unwrap();
    manager
        .add_service("tunnel-a".into(), "svc3".into(), "Grafana")
        .unwrap();
    (manager, prober)
}

fn setup() -> (LifecycleManager<ScriptedProber>, ScriptedProber) {
    setup_with(test_config())
}

fn local(port: u16) -> Endpoint {
    Endpoint::new("127.0.0.1", port)
}

async fn wait_for_status(
    manager: &LifecycleManager<ScriptedProber>,
    id: &str,
    status: ConnectionStatus,
) {
    let id = ServiceId::from(id);
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if manager.service(&id).is_some_and(|s| s.status() == status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{id} never reached {status}"));
}

async fn wait_for_calls(prober: &ScriptedProber, id: &str, calls: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while prober.calls(id) < calls {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{id} was probed fewer than {calls} times"));
}

/// Drain everything currently buffered on a subscription.
fn drain(events: &mut ChangeSubscription) -> Vec<Arc<ServiceChangeEvent>> {
    std::iter::from_fn(|| events.try_recv()).collect()
}

/// available ⇒ enabled, and an endpoint exists exactly when available.
fn assert_consistent(event: &ServiceChangeEvent) {
    if let Some(service) = event.service() {
        assert!(!service.available() || service.enabled(), "{service:?}");
        assert_eq!(service.endpoint().is_some(), service.available(), "{service:?}");
        assert_eq!(service.address().is_some(), service.available(), "{service:?}");
    }
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn enable_unknown_service_is_not_found() {
    let (manager, prober) = setup();

    let err = manager.enable(&"svc1".into()).await.unwrap_err();
    assert!(matches!(err, CoreError::ServiceNotFound { ref id } if id.as_str() == "svc1"));
    assert!(err.is_not_found());
    assert_eq!(prober.calls("svc1"), 0);

    let err = manager.disable(&"svc1".into()).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn enable_connects_and_publishes_endpoint() {
    let (manager, prober) = setup();
    let mut events = manager.subscribe();
    prober.reply("svc2", Ok(local(4000)));

    manager.enable(&"svc2".into()).await.unwrap();
    wait_for_status(&manager, "svc2", ConnectionStatus::Connected).await;

    let service = manager.service(&"svc2".into()).unwrap();
    assert!(service.enabled());
    assert!(service.available());
    assert_eq!(service.address(), Some("127.0.0.1"));
    assert_eq!(service.port(), Some(4000));

    let events = drain(&mut events);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].reason, ChangeReason::UserEnabled);
    assert_eq!(
        events[0].service().unwrap().status(),
        ConnectionStatus::Connecting
    );
    assert_eq!(events[1].reason, ChangeReason::ProbeSucceeded);
    let connected = events[1].service().unwrap();
    assert_eq!(connected.endpoint(), Some(&local(4000)));
    assert!(events[0].sequence < events[1].sequence);
    events.iter().for_each(|e| assert_consistent(e));
}

#[tokio::test]
async fn disable_during_probe_discards_late_result() {
    let (manager, prober) = setup();
    let gate = prober.gate("svc2");

    manager.enable(&"svc2".into()).await.unwrap();
    wait_for_calls(&prober, "svc2", 1).await;
    assert_eq!(
        manager.service(&"svc2".into()).unwrap().status(),
        ConnectionStatus::Connecting
    );

    manager.disable(&"svc2".into()).await.unwrap();
    let _ = gate.send(Ok(local(4000)));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let service = manager.service(&"svc2".into()).unwrap();
    assert_eq!(service.status(), ConnectionStatus::Disconnected);
    assert!(!service.enabled());
    assert!(!service.available());
    assert_eq!(service.address(), None);
    assert_eq!(service.port(), None);
    assert_eq!(manager.probes_in_flight().await, 0);
}

#[tokio::test]
async fn repeated_enable_spawns_one_probe() {
    let (manager, prober) = setup();

    manager.enable(&"svc2".into()).await.unwrap();
    manager.enable(&"svc2".into()).await.unwrap();
    wait_for_calls(&prober, "svc2", 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(prober.calls("svc2"), 1);
    assert_eq!(manager.probes_in_flight().await, 1);

    manager.disable(&"svc2".into()).await.unwrap();
    assert_eq!(manager.probes_in_flight().await, 0);
}

#[tokio::test]
async fn disable_is_idempotent() {
    let (manager, _prober) = setup();
    let mut events = manager.subscribe();

    manager.disable(&"svc2".into()).await.unwrap();
    manager.disable(&"svc2".into()).await.unwrap();

    assert!(drain(&mut events).is_empty());
    assert_eq!(
        manager.service(&"svc2".into()).unwrap().status(),
        ConnectionStatus::Disconnected
    );
}

#[tokio::test]
async fn fatal_probe_forces_disconnect_with_reason() {
    let (manager, prober) = setup();
    let mut events = manager.subscribe();
    prober.reply("svc2", Err(ProbeError::fatal("service withdrawn upstream")));

    manager.enable(&"svc2".into()).await.unwrap();
    wait_for_calls(&prober, "svc2", 1).await;
    wait_for_status(&manager, "svc2", ConnectionStatus::Disconnected).await;

    let events = drain(&mut events);
    let last = events.last().unwrap();
    assert_eq!(
        last.reason,
        ChangeReason::ProbeFatal {
            message: "service withdrawn upstream".into()
        }
    );
    assert!(!last.service().unwrap().enabled());
    assert_eq!(manager.probes_in_flight().await, 0);

    // A later enable starts over.
    prober.reply("svc2", Ok(local(4001)));
    manager.enable(&"svc2".into()).await.unwrap();
    wait_for_status(&manager, "svc2", ConnectionStatus::Connected).await;
}

#[tokio::test]
async fn transient_failures_retry_until_success() {
    let (manager, prober) = setup();
    let mut events = manager.subscribe();
    prober.reply("svc2", Err(ProbeError::transient("connection refused")));
    prober.reply("svc2", Err(ProbeError::transient("connection refused")));
    prober.reply("svc2", Ok(local(4000)));

    manager.enable(&"svc2".into()).await.unwrap();
    wait_for_status(&manager, "svc2", ConnectionStatus::Connected).await;
    assert_eq!(prober.calls("svc2"), 3);

    // Transient failures while connecting publish nothing.
    let events = drain(&mut events);
    let reasons: Vec<_> = events.iter().map(|e| e.reason.clone()).collect();
    assert_eq!(
        reasons,
        [ChangeReason::UserEnabled, ChangeReason::ProbeSucceeded]
    );
    events.iter().for_each(|e| assert_consistent(e));
}

#[tokio::test]
async fn lost_connection_falls_back_to_connecting() {
    let (manager, prober) = setup_with(LifecycleConfig {
        health_interval: Some(Duration::from_millis(10)),
        ..test_config()
    });
    let mut events = manager.subscribe();
    prober.reply("svc2", Ok(local(4000)));
    prober.reply("svc2", Ok(local(4000)));
    prober.reply("svc2", Err(ProbeError::transient("tunnel dropped")));

    manager.enable(&"svc2".into()).await.unwrap();
    wait_for_calls(&prober, "svc2", 3).await;
    wait_for_status(&manager, "svc2", ConnectionStatus::Connecting).await;

    let service = manager.service(&"svc2".into()).unwrap();
    assert!(service.enabled());
    assert_eq!(service.endpoint(), None);

    // The repeated identical success does not publish a second update.
    let events = drain(&mut events);
    let reasons: Vec<_> = events.iter().map(|e| e.reason.clone()).collect();
    assert_eq!(
        reasons,
        [
            ChangeReason::UserEnabled,
            ChangeReason::ProbeSucceeded,
            ChangeReason::ProbeLost
        ]
    );
    events.iter().for_each(|e| assert_consistent(e));
    assert_eq!(manager.probes_in_flight().await, 1);
}

#[tokio::test]
async fn remove_group_cascades_disable() {
    let (manager, prober) = setup();
    prober.reply("svc2", Ok(local(4000)));
    prober.reply("svc3", Ok(local(3000)));
    manager.enable(&"svc2".into()).await.unwrap();
    manager.enable(&"svc3".into()).await.unwrap();
    wait_for_status(&manager, "svc2", ConnectionStatus::Connected).await;
    wait_for_status(&manager, "svc3", ConnectionStatus::Connected).await;

    let mut events = manager.subscribe();
    manager.remove_group(&"tunnel-a".into()).await.unwrap();

    assert!(manager.service(&"svc2".into()).is_none());
    assert!(manager.service(&"svc3".into()).is_none());
    assert!(manager.store().group(&"tunnel-a".into()).is_none());
    assert!(manager.enable(&"svc2".into()).await.unwrap_err().is_not_found());

    let events = drain(&mut events);
    let disconnects = events
        .iter()
        .filter(|e| e.reason == ChangeReason::GroupRemoved)
        .count();
    assert_eq!(disconnects, 2);
    assert!(matches!(
        events.last().unwrap().kind,
        ChangeKind::GroupRemoved { .. }
    ));
    events.iter().for_each(|e| assert_consistent(e));

    let err = manager.remove_group(&"tunnel-a".into()).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn command_handle_routes_intents() {
    let (manager, prober) = setup();
    let handle = manager.start_command_processor();
    prober.reply("svc2", Ok(local(4000)));

    handle
        .execute(Command::Enable { id: "svc2".into() })
        .await
        .unwrap();
    wait_for_status(&manager, "svc2", ConnectionStatus::Connected).await;

    let err = handle
        .execute(Command::Enable { id: "svc1".into() })
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    handle
        .send(Command::Disable { id: "svc2".into() })
        .await
        .unwrap();
    wait_for_status(&manager, "svc2", ConnectionStatus::Disconnected).await;

    // The handle also serves as the view-facing control surface.
    prober.reply("svc3", Ok(local(3000)));
    ServiceControl::enable(&handle, &"svc3".into()).await.unwrap();
    wait_for_status(&manager, "svc3", ConnectionStatus::Connected).await;
}

#[tokio::test]
async fn shutdown_stops_probes_and_commands() {
    let (manager, prober) = setup();
    let handle = manager.start_command_processor();
    manager.enable(&"svc2".into()).await.unwrap();
    wait_for_calls(&prober, "svc2", 1).await;

    manager.shutdown().await;
    assert!(manager.is_shut_down());
    assert_eq!(manager.probes_in_flight().await, 0);

    let err = manager.enable(&"svc3".into()).await.unwrap_err();
    assert!(matches!(err, CoreError::ManagerShutDown));

    // Still recorded as connecting, yet a repeat enable is refused too.
    assert_eq!(
        manager.service(&"svc2".into()).unwrap().status(),
        ConnectionStatus::Connecting
    );
    let err = manager.enable(&"svc2".into()).await.unwrap_err();
    assert!(matches!(err, CoreError::ManagerShutDown));
    assert_eq!(prober.calls("svc2"), 1);

    let err = handle
        .execute(Command::Enable { id: "svc3".into() })
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ManagerShutDown));
}
