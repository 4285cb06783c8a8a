use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};

use tailtray_core::gateway::{CommandGateway, FrameStream, LoginFlags, UpFlags};
use tailtray_core::{
    ConnectionState, EngineConfig, ListChange, PollOutcome, Preference, ReconciliationEngine,
    Result, StateChange, StateField, TrayError,
};

const STATUS: &str = include_str!("fixtures/status-5-peers.json");
const PREFS: &str = include_str!("fixtures/prefs-0.json");

const SHIELDS_FRAME: &str = r#"{"Prefs": {"ShieldsUp": true, "WantRunning": true, "ExitNodeID": "nQHfhyY3PC21CNTRL", "ExitNodeAllowLANAccess": true, "ControlURL": "https://controlplane.tailscale.com"}}"#;

const AMSTERDAM_ID: &str = "nQHfhyY3PC21CNTRL";
const FRANKFURT_ID: &str = "nKx4Yt6Q9921CNTRL";

// ═══════════════════════════════════════════════════════════════════════════════
// Scripted gateway
// ═══════════════════════════════════════════════════════════════════════════════

struct FakeGateway {
    status: Mutex<std::result::Result<String, String>>,
    prefs: Mutex<std::result::Result<String, String>>,
    status_calls: AtomicUsize,
    prefs_calls: AtomicUsize,
    watch_calls: AtomicUsize,
    /// When set, `fetch_status` signals `started` and waits for `release`.
    gated: Mutex<bool>,
    started: Notify,
    release: Notify,
    frames: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl FakeGateway {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(Ok(STATUS.to_string())),
            prefs: Mutex::new(Ok(PREFS.to_string())),
            status_calls: AtomicUsize::new(0),
            prefs_calls: AtomicUsize::new(0),
            watch_calls: AtomicUsize::new(0),
            gated: Mutex::new(false),
            started: Notify::new(),
            release: Notify::new(),
            frames: Mutex::new(None),
        })
    }

    fn set_status(&self, raw: &str) {
        *self.status.lock().expect("status lock") = Ok(raw.to_string());
    }

    fn set_prefs(&self, raw: &str) {
        *self.prefs.lock().expect("prefs lock") = Ok(raw.to_string());
    }

    fn fail_status(&self, details: &str) {
        *self.status.lock().expect("status lock") = Err(details.to_string());
    }

    fn gate(&self) {
        *self.gated.lock().expect("gate lock") = true;
    }

    fn open_channel(&self) -> mpsc::UnboundedSender<String> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.frames.lock().expect("frames lock") = Some(receiver);
        sender
    }

    fn reply(slot: &Mutex<std::result::Result<String, String>>, command: &str) -> Result<String> {
        slot.lock()
            .expect("reply lock")
            .clone()
            .map_err(|details| TrayError::CommandFailed {
                command: command.to_string(),
                details,
            })
    }
}

struct ChannelStream {
    receiver: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl FrameStream for ChannelStream {
    async fn next_frame(&mut self) -> Result<Option<String>> {
        Ok(self.receiver.recv().await)
    }
}

#[async_trait]
impl CommandGateway for FakeGateway {
    async fn fetch_status(&self) -> Result<String> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let gated = *self.gated.lock().expect("gate lock");
        if gated {
            self.started.notify_one();
            self.release.notified().await;
        }
        Self::reply(&self.status, "status")
    }

    async fn fetch_prefs(&self) -> Result<String> {
        self.prefs_calls.fetch_add(1, Ordering::SeqCst);
        Self::reply(&self.prefs, "prefs")
    }

    async fn watch(&self) -> Result<Option<Box<dyn FrameStream>>> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        let receiver = self.frames.lock().expect("frames lock").take();
        Ok(receiver.map(|receiver| Box::new(ChannelStream { receiver }) as Box<dyn FrameStream>))
    }

    async fn up(&self, _flags: &UpFlags) -> Result<String> {
        Ok(String::new())
    }

    async fn down(&self) -> Result<String> {
        Ok(String::new())
    }

    async fn login(&self, _flags: &LoginFlags) -> Result<String> {
        Ok("https://login.example.com/a/1".to_string())
    }

    async fn logout(&self) -> Result<String> {
        Ok(String::new())
    }

    async fn set_exit_node(&self, _node: Option<&str>) -> Result<String> {
        Ok(String::new())
    }

    async fn set_preference(&self, _preference: Preference, _enabled: bool) -> Result<String> {
        Ok(String::new())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════════════

fn shields_prefs() -> String {
    PREFS.replace("\"ShieldsUp\": false", "\"ShieldsUp\": true")
}

fn engine_with(gateway: &Arc<FakeGateway>) -> ReconciliationEngine {
    let config = EngineConfig {
        refresh_interval: Duration::from_secs(10),
        poll_timeout: Duration::from_secs(5),
        ..EngineConfig::default()
    };
    ReconciliationEngine::new(gateway.clone(), config).expect("engine")
}

fn record(engine: &ReconciliationEngine) -> Arc<Mutex<Vec<StateChange>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    engine.subscribe_all(move |change| sink.lock().expect("seen lock").push(change.clone()));
    seen
}

fn fields(seen: &Arc<Mutex<Vec<StateChange>>>) -> Vec<StateField> {
    seen.lock()
        .expect("seen lock")
        .iter()
        .map(StateChange::field)
        .collect()
}

async fn next_cycle(cycles: &mut watch::Receiver<u64>) {
    tokio::time::timeout(Duration::from_secs(60), cycles.changed())
        .await
        .expect("cycle finished in time")
        .expect("engine alive");
}

// ═══════════════════════════════════════════════════════════════════════════════
// Polling cycles
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn first_cycle_notifies_scalars_then_peers() {
    let gateway = FakeGateway::new();
    let engine = engine_with(&gateway);
    let seen = record(&engine);

    let outcome = engine.poll_once(false).await;

    assert_eq!(outcome, PollOutcome::Applied { changes: 9 });
    assert_eq!(
        fields(&seen),
        vec![
            StateField::NetworkName,
            StateField::Domain,
            StateField::SelfNodeId,
            StateField::Health,
            StateField::State,
            StateField::AllowLanAccess,
            StateField::LoginPageUrl,
            StateField::ExitNode,
            StateField::Peers,
        ]
    );
    assert_eq!(
        seen.lock().expect("seen").last(),
        Some(&StateChange::Peers(ListChange {
            position: 0,
            removed: 0,
            added: 5
        }))
    );

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Connected);
    assert_eq!(snapshot.identity.network_name, "email@gmail.com");
    assert!(snapshot.last_poll.is_some());
    assert_eq!(engine.find_peer(AMSTERDAM_ID).expect("amsterdam").name, "amsterdam");
}

#[tokio::test]
async fn identical_cycle_is_silent_and_keeps_instances() {
    let gateway = FakeGateway::new();
    let engine = engine_with(&gateway);
    engine.poll_once(true).await;
    let before = engine.peers();
    let seen = record(&engine);

    let outcome = engine.poll_once(true).await;

    assert_eq!(outcome, PollOutcome::Applied { changes: 0 });
    assert!(seen.lock().expect("seen").is_empty());
    for (old, new) in before.iter().zip(engine.peers().iter()) {
        assert!(Arc::ptr_eq(old, new));
    }
}

#[tokio::test]
async fn light_cycle_leaves_peers_until_full_sync() {
    let gateway = FakeGateway::new();
    let engine = engine_with(&gateway);
    engine.poll_once(true).await;

    let edited = STATUS.replace(
        "\"Tags\": [\"tag:server\"]",
        "\"Tags\": [\"tag:server\", \"tag:backup\"]",
    );
    gateway.set_status(&edited);
    let seen = record(&engine);

    engine.poll_once(false).await;
    assert!(!fields(&seen).contains(&StateField::Peers));
    assert_eq!(
        engine.find_peer("nBq8Zr3W5521CNTRL").expect("nas").tags_label(),
        "tag:server"
    );

    engine.poll_once(true).await;
    assert_eq!(fields(&seen), vec![StateField::Peers]);
    assert_eq!(
        engine.find_peer("nBq8Zr3W5521CNTRL").expect("nas").tags_label(),
        "tag:server,tag:backup"
    );
}

#[tokio::test]
async fn exit_node_change_resyncs_peers_after_scalars() {
    let gateway = FakeGateway::new();
    let engine = engine_with(&gateway);
    engine.poll_once(true).await;

    gateway.set_prefs(&PREFS.replace(AMSTERDAM_ID, FRANKFURT_ID));
    let status = STATUS
        .replace(
            "\"Tags\": [\"tag:exit\", \"tag:home\"],\n      \"Created\": \"2024-01-15T12:00:00Z\",\n      \"ExitNode\": true",
            "\"Tags\": [\"tag:exit\", \"tag:home\"],\n      \"Created\": \"2024-01-15T12:00:00Z\",\n      \"ExitNode\": false",
        )
        .replace(
            "\"Tags\": [\"tag:exit\"],\n      \"Created\": \"2024-01-15T12:00:00Z\",\n      \"ExitNode\": false",
            "\"Tags\": [\"tag:exit\"],\n      \"Created\": \"2024-01-15T12:00:00Z\",\n      \"ExitNode\": true",
        );
    gateway.set_status(&status);
    let seen = record(&engine);

    engine.poll_once(false).await;

    assert_eq!(fields(&seen), vec![StateField::ExitNode, StateField::Peers]);
    assert!(engine.find_peer(FRANKFURT_ID).expect("frankfurt").exit_active);
    assert!(!engine.find_peer(AMSTERDAM_ID).expect("amsterdam").exit_active);
}

#[tokio::test]
async fn failed_fetch_keeps_previous_snapshot() {
    let gateway = FakeGateway::new();
    let engine = engine_with(&gateway);
    engine.poll_once(true).await;
    let before = engine.snapshot();
    let seen = record(&engine);

    gateway.fail_status("connection refused");
    assert_eq!(engine.poll_once(true).await, PollOutcome::Failed);

    gateway.set_status("tailscale: command not found");
    assert_eq!(engine.poll_once(true).await, PollOutcome::Failed);

    assert_eq!(engine.snapshot(), before);
    assert_eq!(engine.peers().len(), 5);
    assert!(seen.lock().expect("seen").is_empty());
}

#[tokio::test]
async fn health_notification_carries_filtered_messages() {
    let gateway = FakeGateway::new();
    let engine = engine_with(&gateway);
    let health = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&health);
    engine.subscribe(StateField::Health, move |change| {
        if let StateChange::Health(report) = change {
            sink.lock().expect("health").push(report.messages().to_vec());
        }
    });

    engine.poll_once(false).await;

    assert_eq!(
        *health.lock().expect("health"),
        vec![vec![
            "Some peers are advertising routes but --accept-routes is false".to_string()
        ]]
    );
}

// ═══════════════════════════════════════════════════════════════════════════════
// Concurrency
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn back_to_back_refreshes_fetch_once() {
    let gateway = FakeGateway::new();
    gateway.gate();
    let engine = engine_with(&gateway);
    let mut cycles = engine.subscribe_cycles();

    assert!(engine.refresh(false));
    assert!(!engine.refresh(false));

    gateway.started.notified().await;
    assert_eq!(gateway.status_calls.load(Ordering::SeqCst), 1);
    assert!(engine.is_polling());
    assert_eq!(engine.poll_once(true).await, PollOutcome::Skipped);

    gateway.release.notify_one();
    next_cycle(&mut cycles).await;

    assert_eq!(gateway.status_calls.load(Ordering::SeqCst), 1);
    assert_eq!(gateway.prefs_calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn shutdown_discards_in_flight_results() {
    let gateway = FakeGateway::new();
    gateway.gate();
    let engine = engine_with(&gateway);

    assert!(engine.refresh(true));
    gateway.started.notified().await;
    engine.shutdown();
    gateway.release.notify_one();

    for _ in 0..100 {
        if !engine.is_polling() {
            break;
        }
        tokio::task::yield_now().await;
    }

    assert!(!engine.is_polling());
    assert_eq!(engine.state(), ConnectionState::NeedLogin);
    assert!(engine.peers().is_empty());
    assert!(!engine.refresh(true));
}

#[test]
fn engine_requires_a_runtime() {
    let gateway = FakeGateway::new();
    let result = ReconciliationEngine::new(gateway, EngineConfig::default());
    assert!(matches!(result, Err(TrayError::NoRuntime(_))));
}

// ═══════════════════════════════════════════════════════════════════════════════
// Listening
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn timer_polls_until_interrupted() {
    let gateway = FakeGateway::new();
    let engine = engine_with(&gateway);
    let mut cycles = engine.subscribe_cycles();

    engine.listen();
    assert!(engine.is_listening());
    next_cycle(&mut cycles).await;
    assert_eq!(gateway.status_calls.load(Ordering::SeqCst), 1);
    next_cycle(&mut cycles).await;
    assert_eq!(gateway.status_calls.load(Ordering::SeqCst), 2);

    engine.interrupt();
    engine.interrupt();
    assert!(!engine.is_listening());
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(gateway.status_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn second_listen_resets_timer_without_second_stream() {
    let gateway = FakeGateway::new();
    let _frames = gateway.open_channel();
    let engine = engine_with(&gateway);

    engine.listen();
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(gateway.status_calls.load(Ordering::SeqCst), 1);

    engine.listen();
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(gateway.watch_calls.load(Ordering::SeqCst), 1);
    assert!(engine.is_watching());
    assert_eq!(gateway.status_calls.load(Ordering::SeqCst), 2);

    tokio::time::sleep(Duration::from_secs(5)).await;
    tokio::task::yield_now().await;
    assert_eq!(gateway.status_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn prefs_frame_updates_flags_then_repolls() {
    let gateway = FakeGateway::new();
    let frames = gateway.open_channel();
    let engine = engine_with(&gateway);
    engine.poll_once(true).await;
    let mut cycles = engine.subscribe_cycles();

    let shields = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&shields);
    engine.subscribe(StateField::ShieldsUp, move |change| {
        if let StateChange::ShieldsUp(enabled) = change {
            sink.lock().expect("shields").push(*enabled);
        }
    });

    engine.listen();
    next_cycle(&mut cycles).await;
    assert_eq!(gateway.status_calls.load(Ordering::SeqCst), 2);

    gateway.set_prefs(&shields_prefs());
    frames.send(SHIELDS_FRAME.to_string()).expect("send frame");
    next_cycle(&mut cycles).await;

    assert_eq!(*shields.lock().expect("shields"), vec![true]);
    assert_eq!(engine.state(), ConnectionState::Connected);
    assert!(engine.prefs().shields_up);
    assert_eq!(gateway.status_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn pushed_prefs_survive_an_older_in_flight_poll() {
    let gateway = FakeGateway::new();
    let frames = gateway.open_channel();
    let engine = engine_with(&gateway);
    engine.poll_once(true).await;
    let mut cycles = engine.subscribe_cycles();

    let shields = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&shields);
    engine.subscribe(StateField::ShieldsUp, move |change| {
        if let StateChange::ShieldsUp(enabled) = change {
            sink.lock().expect("shields").push(*enabled);
        }
    });

    // The poll started by listen reads prefs with shields down, then stalls on status.
    gateway.gate();
    engine.listen();
    gateway.started.notified().await;

    gateway.set_prefs(&shields_prefs());
    frames.send(SHIELDS_FRAME.to_string()).expect("send frame");
    for _ in 0..100 {
        if engine.prefs().shields_up {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(engine.prefs().shields_up);

    *gateway.gated.lock().expect("gate lock") = false;
    gateway.release.notify_one();
    next_cycle(&mut cycles).await;

    assert_eq!(*shields.lock().expect("shields"), vec![true]);
    assert!(engine.prefs().shields_up);
    assert_eq!(engine.state(), ConnectionState::Connected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cycle_and_frame_notifications_never_interleave() {
    let gateway = FakeGateway::new();
    let frames = gateway.open_channel();
    let engine = engine_with(&gateway);

    let active = Arc::new(AtomicUsize::new(0));
    let overlap = Arc::new(AtomicUsize::new(0));
    let shields = Arc::new(Mutex::new(Vec::new()));
    {
        let active = Arc::clone(&active);
        let overlap = Arc::clone(&overlap);
        let shields = Arc::clone(&shields);
        engine.subscribe_all(move |change| {
            if active.fetch_add(1, Ordering::SeqCst) > 0 {
                overlap.fetch_add(1, Ordering::SeqCst);
            }
            if let StateChange::ShieldsUp(enabled) = change {
                shields.lock().expect("shields").push(*enabled);
            }
            std::thread::sleep(Duration::from_millis(5));
            active.fetch_sub(1, Ordering::SeqCst);
        });
    }

    engine.listen();
    frames.send(SHIELDS_FRAME.to_string()).expect("send frame");

    let mut quiet = 0;
    for _ in 0..400 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let settled = !engine.is_polling()
            && engine.peers().len() == 5
            && !shields.lock().expect("shields").is_empty();
        quiet = if settled { quiet + 1 } else { 0 };
        if quiet == 10 {
            break;
        }
    }
    engine.interrupt();

    assert_eq!(overlap.load(Ordering::SeqCst), 0);
    let last = shields.lock().expect("shields").last().copied();
    assert_eq!(last, Some(engine.prefs().shields_up));
}

#[tokio::test]
async fn closed_stream_is_reopened_by_next_listen() {
    let gateway = FakeGateway::new();
    let frames = gateway.open_channel();
    let engine = engine_with(&gateway);

    engine.listen();
    drop(frames);
    for _ in 0..100 {
        if !engine.is_watching() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(!engine.is_watching());
    assert!(engine.is_listening());

    let _frames = gateway.open_channel();
    engine.listen();
    for _ in 0..100 {
        if gateway.watch_calls.load(Ordering::SeqCst) == 2 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(gateway.watch_calls.load(Ordering::SeqCst), 2);
    assert!(engine.is_watching());
}
