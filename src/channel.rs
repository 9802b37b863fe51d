//! Notification Channel.
//!
//! One logical push connection per admin session, owned by an explicitly
//! constructed [`ChannelManager`] rather than a process global. The manager:
//!
//! - connects single-flight: a `connect()` while a connection is being
//!   established or is up is a no-op
//! - reconnects automatically a bounded number of times with fixed backoff,
//!   then stays silently disconnected until [`ChannelManager::reconnect`]
//! - reference-counts room membership and rejoins every held room after a
//!   reconnect, so one consumer's `leave_room` never drops another's
//! - dispatches decoded push events to local listeners; transport and
//!   decode failures are logged, never delivered to listeners
//! - owns the audible alert and its bounded duration
//!
//! The wire itself (socket.io, WebSocket, ...) sits behind [`PushTransport`].

use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ChannelConfig;
use crate::error::Result;
use crate::lock;
use crate::models::{EventKind, NotificationEnvelope};
use crate::wire;

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// Connection state of the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
}

/// What the transport hands up to the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message { event: String, payload: Value },
    Closed { reason: String },
}

/// What the manager sends down to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomCommand {
    Join(String),
    Leave(String),
}

/// A live connection: inbound events plus the outbound command sink.
/// Dropping the command sender tells the transport to close.
pub struct PushConnection {
    pub events: mpsc::Receiver<TransportEvent>,
    pub commands: mpsc::UnboundedSender<RoomCommand>,
}

pub trait PushTransport: Send + Sync + 'static {
    /// Open a new connection.
    fn open(&self) -> impl Future<Output = Result<PushConnection>> + Send;

    /// Human-readable description of the connection target.
    fn description(&self) -> String;
}

// ---------------------------------------------------------------------------
// Alert
// ---------------------------------------------------------------------------

/// Whatever actually makes the noise.
pub trait AlertPlayer: Send + Sync + 'static {
    fn start(&self);
    fn stop(&self);
}

/// Default player for headless hosts: records the alert in the log.
#[derive(Debug, Default)]
pub struct LogAlertPlayer;

impl AlertPlayer for LogAlertPlayer {
    fn start(&self) {
        info!("New order alert");
    }

    fn stop(&self) {
        debug!("Order alert stopped");
    }
}

struct AlertController {
    player: Arc<dyn AlertPlayer>,
    default_duration: Duration,
    max_duration: Duration,
    next_id: AtomicU64,
    active: Mutex<Option<(u64, CancellationToken)>>,
}

impl AlertController {
    fn play(self: &Arc<Self>, requested: Option<Duration>) -> Duration {
        let duration = requested
            .unwrap_or(self.default_duration)
            .min(self.max_duration);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        {
            let mut active = lock(&self.active);
            if let Some((_, previous)) = active.replace((id, token.clone())) {
                previous.cancel();
            }
        }
        self.player.start();

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(duration) => {
                    let expired = {
                        let mut active = lock(&this.active);
                        if matches!(active.as_ref(), Some((current, _)) if *current == id) {
                            active.take();
                            true
                        } else {
                            false
                        }
                    };
                    if expired {
                        this.player.stop();
                    }
                }
            }
        });
        duration
    }

    fn stop(&self) -> bool {
        let Some((_, token)) = lock(&self.active).take() else {
            return false;
        };
        token.cancel();
        self.player.stop();
        true
    }

    fn is_playing(&self) -> bool {
        lock(&self.active).is_some()
    }
}

/// Cloneable handle to the channel's alert, for listeners that should ring
/// without holding the whole manager.
#[derive(Clone)]
pub struct AlertHandle(Arc<AlertController>);

impl AlertHandle {
    pub fn play(&self, duration: Option<Duration>) -> Duration {
        self.0.play(duration)
    }

    pub fn stop(&self) -> bool {
        self.0.stop()
    }

    pub fn is_playing(&self) -> bool {
        self.0.is_playing()
    }
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

type Handler = Arc<dyn Fn(&NotificationEnvelope) + Send + Sync>;

/// Handle returned by [`ChannelManager::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

struct Listener {
    id: SubscriptionId,
    kind: EventKind,
    handler: Handler,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct Inner<T> {
    transport: T,
    config: ChannelConfig,
    state: watch::Sender<TransportState>,
    commands: Mutex<Option<mpsc::UnboundedSender<RoomCommand>>>,
    rooms: Mutex<HashMap<String, usize>>,
    listeners: Mutex<Vec<Listener>>,
    session: Mutex<Option<CancellationToken>>,
    alert: Arc<AlertController>,
}

/// Shared push channel. Cloning yields another handle to the same channel.
pub struct ChannelManager<T: PushTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: PushTransport> Clone for ChannelManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: PushTransport> ChannelManager<T> {
    pub fn new(transport: T, config: ChannelConfig) -> Self {
        Self::with_alert_player(transport, config, Arc::new(LogAlertPlayer))
    }

    pub fn with_alert_player(
        transport: T,
        config: ChannelConfig,
        player: Arc<dyn AlertPlayer>,
    ) -> Self {
        let alert = Arc::new(AlertController {
            player,
            default_duration: Duration::from_millis(config.default_alert_duration_ms),
            max_duration: Duration::from_millis(config.max_alert_duration_ms),
            next_id: AtomicU64::new(0),
            active: Mutex::new(None),
        });
        let (state, _) = watch::channel(TransportState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                state,
                commands: Mutex::new(None),
                rooms: Mutex::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
                session: Mutex::new(None),
                alert,
            }),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    pub fn state(&self) -> TransportState {
        *self.inner.state.borrow()
    }

    /// Observe state changes (for a connection indicator).
    pub fn watch_state(&self) -> watch::Receiver<TransportState> {
        self.inner.state.subscribe()
    }

    // -- connection ---------------------------------------------------------

    /// Connect if disconnected. Returns once the first attempt cycle settles.
    ///
    /// When a connection is already up or being established this returns
    /// the current state immediately without opening anything.
    pub async fn connect(&self) -> TransportState {
        let started = self.inner.state.send_if_modified(|state| {
            if *state == TransportState::Disconnected {
                *state = TransportState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            let state = self.state();
            debug!(state = ?state, "Push channel connect skipped");
            return state;
        }

        let token = CancellationToken::new();
        if let Some(stale) = lock(&self.inner.session).replace(token.clone()) {
            stale.cancel();
        }
        info!(transport = %self.inner.transport.description(), "Connecting push channel");

        let mut state_rx = self.inner.state.subscribe();
        tokio::spawn(Arc::clone(&self.inner).supervise(token));
        let settled = state_rx
            .wait_for(|state| *state != TransportState::Connecting)
            .await
            .map(|state| *state);
        settled.unwrap_or(TransportState::Disconnected)
    }

    /// Tear the connection down. Room counts and listeners are kept.
    pub fn disconnect(&self) {
        // Held throughout so a supervisor cannot attach in between.
        let mut session = lock(&self.inner.session);
        if let Some(token) = session.take() {
            token.cancel();
        }
        lock(&self.inner.commands).take();
        let previous = self.inner.state.send_replace(TransportState::Disconnected);
        drop(session);
        if previous != TransportState::Disconnected {
            info!("Push channel disconnected");
        }
    }

    /// Explicit reconnect with a fresh attempt budget.
    pub async fn reconnect(&self) -> TransportState {
        self.disconnect();
        self.connect().await
    }

    // -- rooms --------------------------------------------------------------

    pub fn join_room(&self, room: &str) {
        let room = room.trim();
        if room.is_empty() {
            warn!("Ignoring join of unnamed room");
            return;
        }
        let mut rooms = lock(&self.inner.rooms);
        let refs = rooms.entry(room.to_string()).or_insert(0);
        *refs += 1;
        if *refs == 1 {
            self.inner.send_command(RoomCommand::Join(room.to_string()));
        }
        debug!(room, refs = *refs, "Room joined");
    }

    pub fn leave_room(&self, room: &str) {
        let room = room.trim();
        let mut rooms = lock(&self.inner.rooms);
        let Some(refs) = rooms.get_mut(room) else {
            debug!(room, "Leave for a room that was never joined");
            return;
        };
        *refs -= 1;
        let remaining = *refs;
        if remaining == 0 {
            rooms.remove(room);
            self.inner.send_command(RoomCommand::Leave(room.to_string()));
        }
        debug!(room, refs = remaining, "Room left");
    }

    /// Current reference count for `room`.
    pub fn room_refs(&self, room: &str) -> usize {
        lock(&self.inner.rooms).get(room.trim()).copied().unwrap_or(0)
    }

    // -- listeners ----------------------------------------------------------

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&NotificationEnvelope) + Send + Sync + 'static,
    {
        let id = SubscriptionId(Uuid::new_v4());
        lock(&self.inner.listeners).push(Listener {
            id,
            kind,
            handler: Arc::new(handler),
        });
        debug!(event = %kind, "Listener subscribed");
        id
    }

    /// Returns false when the subscription was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = lock(&self.inner.listeners);
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        before != listeners.len()
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        lock(&self.inner.listeners)
            .iter()
            .filter(|l| l.kind == kind)
            .count()
    }

    // -- alert --------------------------------------------------------------

    /// Start (or restart) the alert. `None` uses the default duration; any
    /// duration is clamped to the configured maximum. Returns the duration
    /// actually scheduled.
    pub fn play_alert(&self, duration: Option<Duration>) -> Duration {
        self.inner.alert.play(duration)
    }

    /// Returns false when nothing was playing.
    pub fn stop_alert(&self) -> bool {
        self.inner.alert.stop()
    }

    pub fn is_alert_playing(&self) -> bool {
        self.inner.alert.is_playing()
    }

    pub fn alert(&self) -> AlertHandle {
        AlertHandle(Arc::clone(&self.inner.alert))
    }
}

impl<T: PushTransport> Inner<T> {
    fn send_command(&self, command: RoomCommand) {
        if let Some(tx) = lock(&self.commands).as_ref() {
            if tx.send(command).is_err() {
                warn!("Push transport is gone; room command dropped");
            }
        }
    }

    /// Connect, pump, and reconnect until cancelled or out of attempts.
    async fn supervise(self: Arc<Self>, token: CancellationToken) {
        loop {
            let Some(connection) = self.open_with_retry(&token).await else {
                self.give_up(&token);
                return;
            };

            let PushConnection {
                mut events,
                commands,
            } = connection;
            if !self.attach(commands, &token) {
                return;
            }

            let reason = tokio::select! {
                _ = token.cancelled() => return,
                reason = self.pump(&mut events) => reason,
            };
            if !self.detach(&token, &reason) {
                return;
            }
        }
    }

    // `session` is taken first and held across the cancellation check and
    // the state change in `attach`, `detach` and `give_up`, the same as in
    // `ChannelManager::disconnect`.

    fn give_up(&self, token: &CancellationToken) {
        let mut session = lock(&self.session);
        if token.is_cancelled() {
            return;
        }
        warn!(
            attempts = self.config.max_reconnect_attempts + 1,
            "Push channel unavailable; staying disconnected until reconnect"
        );
        session.take();
        self.state.send_replace(TransportState::Disconnected);
    }

    fn detach(&self, token: &CancellationToken, reason: &str) -> bool {
        let _session = lock(&self.session);
        if token.is_cancelled() {
            return false;
        }
        warn!(reason, "Push channel dropped, reconnecting");
        lock(&self.commands).take();
        self.state.send_replace(TransportState::Connecting);
        true
    }

    async fn open_with_retry(&self, token: &CancellationToken) -> Option<PushConnection> {
        let max_attempts = self.config.max_reconnect_attempts;
        let mut retries: u32 = 0;
        loop {
            if token.is_cancelled() {
                return None;
            }
            match self.transport.open().await {
                Ok(connection) => return Some(connection),
                Err(e) => warn!(
                    retry = retries,
                    transport = %self.transport.description(),
                    error = %e,
                    "Push channel connect failed"
                ),
            }
            if retries >= max_attempts {
                return None;
            }
            retries += 1;
            tokio::select! {
                _ = token.cancelled() => return None,
                _ = tokio::time::sleep(self.config.reconnect_backoff()) => {}
            }
        }
    }

    /// Install the command sink and rejoin every held room.
    fn attach(&self, commands: mpsc::UnboundedSender<RoomCommand>, token: &CancellationToken) -> bool {
        let _session = lock(&self.session);
        if token.is_cancelled() {
            return false;
        }
        let rooms = lock(&self.rooms);
        for room in rooms.keys() {
            if commands.send(RoomCommand::Join(room.clone())).is_err() {
                warn!(room = %room, "Push transport closed during rejoin");
            }
        }
        *lock(&self.commands) = Some(commands);
        self.state.send_replace(TransportState::Connected);
        info!(rooms = rooms.len(), "Push channel connected");
        true
    }

    /// Deliver inbound events until the transport closes; returns the reason.
    async fn pump(&self, events: &mut mpsc::Receiver<TransportEvent>) -> String {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Message { event, payload } => {
                    match wire::decode_push_event(&event, payload) {
                        Ok(envelope) => self.dispatch(&envelope),
                        Err(e) => debug!(event = %event, error = %e, "Ignoring push event"),
                    }
                }
                TransportEvent::Closed { reason } => return reason,
            }
        }
        "transport closed".to_string()
    }

    fn dispatch(&self, envelope: &NotificationEnvelope) {
        let handlers: Vec<Handler> = lock(&self.listeners)
            .iter()
            .filter(|l| l.kind == envelope.kind)
            .map(|l| Arc::clone(&l.handler))
            .collect();
        debug!(event = %envelope.kind, listeners = handlers.len(), "Dispatching push event");
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(envelope))).is_err() {
                warn!(event = %envelope.kind, "Push listener panicked");
            }
        }
    }
}
