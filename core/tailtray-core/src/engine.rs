//! Polling and reconciliation.
//!
//! One cycle fetches prefs and status concurrently, extracts the normalized
//! view, diffs it field by field against the held snapshot, and reconciles the
//! peer registry when peers may have changed. Cycles come from three places:
//! explicit [`ReconciliationEngine::refresh`] calls, the interval timer started
//! by [`ReconciliationEngine::listen`], and frames pushed by the daemon's watch
//! stream.
//!
//! At most one cycle is in flight. A refresh requested while polling is
//! dropped, not queued. A prefs frame that lands while a cycle is fetching
//! wins over that cycle's prefs. Notifications from cycles and frames are
//! delivered one batch at a time.

use chrono::Utc;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use tailtray_localapi::IpnBusFrame;

use crate::error::{Result, TrayError};
use crate::extract::{
    decode_peers, extract_health_with, extract_json_object, extract_network_identity,
    extract_peers, extract_preference_flags, PeerContext,
};
use crate::gateway::{CommandGateway, FrameStream};
use crate::observe::{Listener, Observers, StateChange, StateField, SubscriptionId};
use crate::peers::PeerRegistry;
use crate::types::{
    ConnectionState, ExitFlagMapping, HealthReport, NetworkIdentity, PeerRecord,
    PreferenceFlags, Snapshot,
};

const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub refresh_interval: Duration,
    /// Upper bound for each of the two fetches in a cycle.
    pub poll_timeout: Duration,
    pub exit_flags: ExitFlagMapping,
    /// Health messages to drop on top of the built-in denylist.
    pub health_ignore: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            exit_flags: ExitFlagMapping::default(),
            health_ignore: Vec::new(),
        }
    }
}

/// How a polling cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Results were applied; `changes` notifications went out.
    Applied { changes: usize },
    /// Another cycle was already in flight.
    Skipped,
    /// A fetch or extraction failed; the previous snapshot was kept.
    Failed,
    /// The engine was shut down while the cycle was in flight.
    Discarded,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════════

/// Owns the held state and the polling lifecycle.
///
/// Construct it once in the composition root and hand out references.
/// Dropping it stops listening and discards any in-flight cycle.
pub struct ReconciliationEngine {
    inner: Arc<EngineInner>,
}

impl ReconciliationEngine {
    /// Creates an engine bound to the current tokio runtime.
    pub fn new(gateway: Arc<dyn CommandGateway>, config: EngineConfig) -> Result<Self> {
        let runtime =
            Handle::try_current().map_err(|err| TrayError::NoRuntime(err.to_string()))?;
        let (cycles, _) = watch::channel(0);

        Ok(Self {
            inner: Arc::new(EngineInner {
                gateway,
                config,
                runtime,
                held: Mutex::new(HeldState::default()),
                observers: Observers::new(),
                polling: AtomicBool::new(false),
                prefs_generation: AtomicU64::new(0),
                emitting: Mutex::new(()),
                destroyed: AtomicBool::new(false),
                listening: Mutex::new(None),
                cycles,
            }),
        })
    }

    /// Starts one polling cycle in the background.
    ///
    /// Returns false when a cycle is already in flight (or the engine is shut
    /// down); the request is dropped in that case.
    pub fn refresh(&self, full_peer_sync: bool) -> bool {
        self.inner.refresh(full_peer_sync)
    }

    /// Runs one polling cycle to completion on the calling task.
    pub async fn poll_once(&self, full_peer_sync: bool) -> PollOutcome {
        match self.inner.begin_poll() {
            Some(guard) => self.inner.run_cycle(full_peer_sync, guard).await,
            None => PollOutcome::Skipped,
        }
    }

    /// Polls once with a full peer sync, then starts the interval timer and
    /// the watch stream.
    ///
    /// Calling it again while listening polls again and restarts the timer.
    /// The watch stream is only reopened if the previous one has ended.
    pub fn listen(&self) {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return;
        }

        self.inner.refresh(true);

        let mut listening = self.inner.lock_listening();
        match listening.as_mut() {
            Some(handles) => {
                handles.timer.abort();
                handles.timer = self.inner.spawn_timer(handles.shutdown.subscribe());
                if handles.watch.is_finished() {
                    info!("Reopening watch stream");
                    handles.watch = self.inner.spawn_watch(handles.shutdown.subscribe());
                }
                debug!("Polling timer reset");
            }
            None => {
                let (shutdown, receiver) = watch::channel(false);
                let timer = self.inner.spawn_timer(receiver.clone());
                let watch = self.inner.spawn_watch(receiver);
                *listening = Some(ListenHandles {
                    shutdown,
                    timer,
                    watch,
                });
                info!(
                    interval_ms = self.inner.config.refresh_interval.as_millis() as u64,
                    "Listening for daemon changes"
                );
            }
        }
    }

    /// Stops the timer and the watch stream. In-flight refreshes still finish.
    pub fn interrupt(&self) {
        self.inner.interrupt();
    }

    pub fn is_listening(&self) -> bool {
        self.inner.lock_listening().is_some()
    }

    /// True while the watch stream task is running.
    pub fn is_watching(&self) -> bool {
        self.inner
            .lock_listening()
            .as_ref()
            .is_some_and(|handles| !handles.watch.is_finished())
    }

    pub fn is_polling(&self) -> bool {
        self.inner.polling.load(Ordering::SeqCst)
    }

    /// Stops listening and discards results of any cycle still in flight.
    pub fn shutdown(&self) {
        if !self.inner.destroyed.swap(true, Ordering::SeqCst) {
            debug!("Reconciliation engine shut down");
        }
        self.inner.interrupt();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Read access
    // ─────────────────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> Snapshot {
        self.inner.lock_held().snapshot.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock_held().snapshot.state
    }

    pub fn identity(&self) -> NetworkIdentity {
        self.inner.lock_held().snapshot.identity.clone()
    }

    pub fn health(&self) -> HealthReport {
        self.inner.lock_held().snapshot.health.clone()
    }

    pub fn prefs(&self) -> PreferenceFlags {
        self.inner.lock_held().snapshot.prefs.clone()
    }

    pub fn peers(&self) -> Vec<Arc<PeerRecord>> {
        self.inner.lock_held().peers.to_vec()
    }

    pub fn find_peer(&self, id: &str) -> Option<Arc<PeerRecord>> {
        self.inner.lock_held().peers.find(id)
    }

    /// Runs `f` against the registry under the state lock.
    pub fn with_peers<T>(&self, f: impl FnOnce(&PeerRegistry) -> T) -> T {
        f(&self.inner.lock_held().peers)
    }

    /// Count of applied cycles; changes after every successful poll.
    pub fn subscribe_cycles(&self) -> watch::Receiver<u64> {
        self.inner.cycles.subscribe()
    }

    pub fn gateway(&self) -> Arc<dyn CommandGateway> {
        Arc::clone(&self.inner.gateway)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // ─────────────────────────────────────────────────────────────────────
    // Subscriptions
    // ─────────────────────────────────────────────────────────────────────

    pub fn subscribe<F>(&self, field: StateField, listener: F) -> SubscriptionId
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.inner.observers.subscribe(field, Arc::new(listener))
    }

    pub fn subscribe_all<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        self.inner.observers.subscribe_all(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.observers.unsubscribe(id)
    }
}

impl Drop for ReconciliationEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ReconciliationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("config", &self.inner.config)
            .field("polling", &self.is_polling())
            .field("listening", &self.is_listening())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Shared State
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct HeldState {
    snapshot: Snapshot,
    peers: PeerRegistry,
    /// Exit node changed outside a full cycle; resync peers on the next one.
    peers_stale: bool,
}

struct ListenHandles {
    shutdown: watch::Sender<bool>,
    timer: JoinHandle<()>,
    watch: JoinHandle<()>,
}

struct EngineInner {
    gateway: Arc<dyn CommandGateway>,
    config: EngineConfig,
    runtime: Handle,
    held: Mutex<HeldState>,
    observers: Observers,
    polling: AtomicBool,
    /// Bumped by every applied prefs frame.
    prefs_generation: AtomicU64,
    /// Held from diff to the end of delivery.
    emitting: Mutex<()>,
    destroyed: AtomicBool,
    listening: Mutex<Option<ListenHandles>>,
    cycles: watch::Sender<u64>,
}

/// Clears the in-flight flag when the cycle ends, however it ends.
struct PollGuard {
    inner: Arc<EngineInner>,
}

impl Drop for PollGuard {
    fn drop(&mut self) {
        self.inner.polling.store(false, Ordering::SeqCst);
    }
}

impl EngineInner {
    fn lock_held(&self) -> MutexGuard<'_, HeldState> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_emit(&self) -> MutexGuard<'_, ()> {
        self.emitting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_listening(&self) -> MutexGuard<'_, Option<ListenHandles>> {
        self.listening.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn begin_poll(self: &Arc<Self>) -> Option<PollGuard> {
        if self.is_destroyed() {
            return None;
        }
        self.polling
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| PollGuard {
                inner: Arc::clone(self),
            })
    }

    fn refresh(self: &Arc<Self>, full_peer_sync: bool) -> bool {
        if self.is_destroyed() {
            return false;
        }
        let Some(guard) = self.begin_poll() else {
            debug!("Refresh already in progress; skipping");
            return false;
        };

        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            inner.run_cycle(full_peer_sync, guard).await;
        });
        true
    }

    fn interrupt(&self) {
        let Some(handles) = self.lock_listening().take() else {
            return;
        };
        let _ = handles.shutdown.send(true);
        handles.timer.abort();
        handles.watch.abort();
        info!("Stopped listening for daemon changes");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Polling cycle
    // ─────────────────────────────────────────────────────────────────────

    async fn run_cycle(&self, full_peer_sync: bool, _guard: PollGuard) -> PollOutcome {
        let generation = self.prefs_generation.load(Ordering::SeqCst);
        let (prefs, status) = tokio::join!(
            self.fetch("prefs", self.gateway.fetch_prefs()),
            self.fetch("status", self.gateway.fetch_status()),
        );

        let (prefs, status) = match (prefs, status) {
            (Ok(prefs), Ok(status)) => (prefs, status),
            (Err(err), _) | (_, Err(err)) => {
                warn!(error = %err, "Polling cycle failed; keeping previous state");
                return PollOutcome::Failed;
            }
        };

        let parsed = (extract_json_object(&prefs), extract_json_object(&status));
        let (prefs, status) = match parsed {
            (Some(prefs), Some(status)) => (prefs, status),
            (prefs, _) => {
                let which = if prefs.is_none() { "prefs" } else { "status" };
                let err = TrayError::MalformedPayload(format!("no JSON object in {}", which));
                warn!(error = %err, "Daemon returned an unreadable payload; keeping previous state");
                return PollOutcome::Failed;
            }
        };

        if self.is_destroyed() {
            debug!("Engine shut down during poll; discarding results");
            return PollOutcome::Discarded;
        }

        let applied = {
            let _emitting = self.lock_emit();
            let changes = self.apply_cycle(&prefs, &status, full_peer_sync, generation);
            self.observers.emit(&changes);
            changes.len()
        };
        self.cycles.send_modify(|count| *count += 1);
        PollOutcome::Applied { changes: applied }
    }

    async fn fetch<F>(&self, what: &'static str, request: F) -> Result<String>
    where
        F: Future<Output = Result<String>>,
    {
        match tokio::time::timeout(self.config.poll_timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(TrayError::timeout(
                format!("fetch {}", what),
                self.config.poll_timeout,
            )),
        }
    }

    /// Writes one cycle's results and returns the notifications, in order.
    ///
    /// `generation` is the prefs generation seen before fetching. If a prefs
    /// frame was applied since, the fetched prefs are older than the held
    /// ones and are dropped.
    fn apply_cycle(
        &self,
        prefs: &Value,
        status: &Value,
        full_peer_sync: bool,
        generation: u64,
    ) -> Vec<StateChange> {
        let fetched = extract_preference_flags(prefs);
        let identity = extract_network_identity(status);
        let health = extract_health_with(status, &self.config.health_ignore);

        let mut guard = self.lock_held();
        let held = &mut *guard;
        let mut changes = Vec::new();

        let (flags, state) = if self.prefs_generation.load(Ordering::SeqCst) == generation {
            let state = ConnectionState::classify(&fetched);
            (fetched, state)
        } else {
            debug!("Prefs changed during poll; keeping pushed values");
            (held.snapshot.prefs.clone(), held.snapshot.state)
        };

        let exit_changed = held.snapshot.prefs.exit_node_id != flags.exit_node_id;
        diff_identity(&held.snapshot.identity, &identity, &mut changes);
        if held.snapshot.health != health {
            changes.push(StateChange::Health(health.clone()));
        }
        diff_prefs(&held.snapshot, state, &flags, &mut changes);

        held.snapshot = Snapshot {
            state,
            identity,
            health,
            prefs: flags,
            last_poll: Some(Utc::now()),
        };

        if full_peer_sync || held.peers.is_empty() || exit_changed || held.peers_stale {
            let ctx = PeerContext {
                domain_suffix: &held.snapshot.identity.domain_suffix,
                exit_node_id: &held.snapshot.prefs.exit_node_id,
                exit_flags: &self.config.exit_flags,
            };
            let records = decode_peers(&extract_peers(status), &ctx);
            if let Some(change) = held.peers.replace_all(records) {
                changes.push(StateChange::Peers(change));
            }
            held.peers_stale = false;
        }

        changes
    }

    /// Re-derives preferences and state from a pushed prefs document.
    fn apply_prefs_frame(&self, prefs: &Value) -> Vec<StateChange> {
        let mut guard = self.lock_held();
        let held = &mut *guard;

        let mut flags = extract_preference_flags(prefs);
        if prefs.get("Config").is_none() {
            // Bus frames may omit the stored identity; keep what the last poll saw.
            flags.logged_in = held.snapshot.prefs.logged_in && !flags_logged_out(prefs);
        }
        let state = ConnectionState::classify(&flags);

        let mut changes = Vec::new();
        diff_prefs(&held.snapshot, state, &flags, &mut changes);
        if held.snapshot.prefs.exit_node_id != flags.exit_node_id {
            held.peers_stale = true;
        }
        held.snapshot.state = state;
        held.snapshot.prefs = flags;
        self.prefs_generation.fetch_add(1, Ordering::SeqCst);
        changes
    }

    // ─────────────────────────────────────────────────────────────────────
    // Background tasks
    // ─────────────────────────────────────────────────────────────────────

    fn spawn_timer(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.config.refresh_interval;
        self.runtime.spawn(timer_loop(weak, period, shutdown))
    }

    fn spawn_watch(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let gateway = Arc::clone(&self.gateway);
        self.runtime.spawn(watch_loop(weak, gateway, shutdown))
    }

    fn handle_frame(self: &Arc<Self>, text: &str) {
        let frame: IpnBusFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "Ignoring malformed watch frame");
                return;
            }
        };

        if let Some(message) = frame.err_message.as_deref().filter(|m| !m.is_empty()) {
            warn!(message = %message, "Daemon reported an error");
        }
        if let Some(state) = frame.backend_state() {
            debug!(state = state.as_str(), "Daemon backend state");
        }
        if let Some(url) = frame.browse_to_url.as_deref().filter(|u| !u.is_empty()) {
            info!(url = %url, "Daemon requested a browser login");
        }

        if let Some(prefs) = frame.prefs_object() {
            if !self.is_destroyed() {
                let _emitting = self.lock_emit();
                let changes = self.apply_prefs_frame(prefs);
                self.observers.emit(&changes);
            }
        }

        self.refresh(false);
    }
}

async fn timer_loop(
    weak: Weak<EngineInner>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let Some(inner) = weak.upgrade() else { break };
                inner.refresh(false);
            }
        }
    }
}

async fn watch_loop(
    weak: Weak<EngineInner>,
    gateway: Arc<dyn CommandGateway>,
    mut shutdown: watch::Receiver<bool>,
) {
    let opened = tokio::select! {
        _ = shutdown.changed() => return,
        opened = gateway.watch() => opened,
    };
    let mut stream: Box<dyn FrameStream> = match opened {
        Ok(Some(stream)) => stream,
        Ok(None) => {
            debug!("Transport has no watch stream; relying on the timer");
            return;
        }
        Err(err) => {
            warn!(error = %err, "Failed to open watch stream");
            return;
        }
    };
    info!("Watch stream started");

    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = stream.next_frame() => frame,
        };
        let Some(inner) = weak.upgrade() else { break };
        match frame {
            Ok(Some(text)) => inner.handle_frame(&text),
            Ok(None) => {
                info!("Watch stream closed by daemon");
                break;
            }
            Err(err) => {
                warn!(error = %err, "Watch stream failed");
                break;
            }
        }
    }
    info!("Watch stream stopped");
}

// ═══════════════════════════════════════════════════════════════════════════════
// Field Diffing
// ═══════════════════════════════════════════════════════════════════════════════

fn diff_identity(old: &NetworkIdentity, new: &NetworkIdentity, changes: &mut Vec<StateChange>) {
    if old.network_name != new.network_name {
        changes.push(StateChange::NetworkName(new.network_name.clone()));
    }
    if old.domain_suffix != new.domain_suffix {
        changes.push(StateChange::Domain(new.domain_suffix.clone()));
    }
    if old.self_node_id != new.self_node_id {
        changes.push(StateChange::SelfNodeId(new.self_node_id.clone()));
    }
}

/// State first, then each preference, exit node last.
fn diff_prefs(
    old: &Snapshot,
    state: ConnectionState,
    new: &PreferenceFlags,
    changes: &mut Vec<StateChange>,
) {
    let prefs = &old.prefs;
    if old.state != state {
        changes.push(StateChange::State(state));
    }
    if prefs.accept_routes != new.accept_routes {
        changes.push(StateChange::AcceptRoutes(new.accept_routes));
    }
    if prefs.shields_up != new.shields_up {
        changes.push(StateChange::ShieldsUp(new.shields_up));
    }
    if prefs.allow_lan_access != new.allow_lan_access {
        changes.push(StateChange::AllowLanAccess(new.allow_lan_access));
    }
    if prefs.web_client != new.web_client {
        changes.push(StateChange::WebClient(new.web_client));
    }
    if prefs.login_page_url != new.login_page_url {
        changes.push(StateChange::LoginPageUrl(new.login_page_url.clone()));
    }
    if prefs.exit_node_id != new.exit_node_id {
        changes.push(StateChange::ExitNode(new.exit_node_id.clone()));
    }
}

fn flags_logged_out(prefs: &Value) -> bool {
    prefs
        .get("LoggedOut")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}
