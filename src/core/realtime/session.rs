//! Peer session state machine.
//!
//! ```text
//!            start()            channel open
//!   Idle ─────────────► Connecting ─────────────► Active
//!                          │    │                   │  │
//!                 failure  │    │ stop()     stop() │  │ failure / channel closed
//!                          ▼    ▼                   ▼  ▼
//!                        Error  Closed ◄──────── Closed Error
//! ```
//!
//! Every `start()` runs under a fresh generation number. Results of async
//! steps (credential fetch, negotiation, channel open) are applied only if
//! the generation is still current and the session is still `Connecting`;
//! anything that resolves after `stop()` is discarded and the attempt ends
//! with [`RealtimeError::Cancelled`]. `Closed`/`Error` never revert to `Active`.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::base::{RealtimeError, RealtimeResult, SessionStatus};
use super::bus::EventBus;
use super::functions::FunctionCallDispatcher;
use super::messages::{ServerEvent, ServerEventKind, SessionUpdate};
use super::signaling::{RelayClient, Signaling};
use super::transport::{DataChannel, PeerConnection, PeerConnector};
use crate::core::upstream::{DEFAULT_REALTIME_MODEL, DEFAULT_REALTIME_VOICE};

// =============================================================================
// Configuration
// =============================================================================

/// Client-side session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base URL of the relay (used by [`PeerSession::with_relay`])
    pub relay_url: String,
    pub model: String,
    pub voice: String,
    /// Sent with `session.update` once the channel is open
    pub instructions: Option<String>,
    pub credential_timeout: Duration,
    pub negotiate_timeout: Duration,
    pub channel_open_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_url: "http://localhost:3001".to_string(),
            model: DEFAULT_REALTIME_MODEL.to_string(),
            voice: DEFAULT_REALTIME_VOICE.to_string(),
            instructions: None,
            credential_timeout: Duration::from_secs(10),
            negotiate_timeout: Duration::from_secs(10),
            channel_open_timeout: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Shared State
// =============================================================================

#[derive(Default)]
struct SessionState {
    status: SessionStatus,
    generation: u64,
    last_error: Option<String>,
    ai_speaking: bool,
    speech_detected: bool,
    session_id: Option<Uuid>,
    peer: Option<Arc<dyn PeerConnection>>,
    bus: Option<EventBus>,
    reader: Option<JoinHandle<()>>,
}

impl SessionState {
    fn is_current(&self, generation: u64, status: SessionStatus) -> bool {
        self.generation == generation && self.status == status
    }
}

struct SessionShared {
    state: Mutex<SessionState>,
    status_tx: watch::Sender<SessionStatus>,
    // Locked after `state` when both are held
    dispatcher: Mutex<Option<FunctionCallDispatcher>>,
}

impl SessionShared {
    fn new() -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::Idle);
        Self {
            state: Mutex::new(SessionState::default()),
            status_tx,
            dispatcher: Mutex::new(None),
        }
    }

    /// Swap the dispatcher, moving the live bus subscription to the new one.
    fn install_dispatcher(&self, dispatcher: FunctionCallDispatcher) {
        let state = self.state.lock();
        let mut slot = self.dispatcher.lock();
        if let Some(previous) = slot.take() {
            previous.detach();
        }
        if let Some(bus) = &state.bus
            && let Err(e) = dispatcher.attach(bus)
        {
            warn!(error = %e, "Failed to attach dispatcher to the live session");
        }
        *slot = Some(dispatcher);
    }

    fn set_status(&self, state: &mut SessionState, status: SessionStatus) {
        state.status = status;
        if status != SessionStatus::Active {
            state.ai_speaking = false;
            state.speech_detected = false;
        }
        self.status_tx.send_replace(status);
    }

    /// Enter `Connecting` under a new generation.
    fn begin(&self) -> RealtimeResult<(u64, Uuid)> {
        let mut state = self.state.lock();
        if matches!(
            state.status,
            SessionStatus::Connecting | SessionStatus::Active
        ) {
            return Err(RealtimeError::InvalidState(format!(
                "Cannot start a session that is {}",
                state.status
            )));
        }

        state.generation += 1;
        state.last_error = None;
        let session_id = Uuid::new_v4();
        state.session_id = Some(session_id);
        self.set_status(&mut state, SessionStatus::Connecting);
        Ok((state.generation, session_id))
    }

    fn ensure_connecting(&self, generation: u64) -> RealtimeResult<()> {
        if self
            .state
            .lock()
            .is_current(generation, SessionStatus::Connecting)
        {
            Ok(())
        } else {
            Err(RealtimeError::Cancelled)
        }
    }

    /// Keep `peer` for teardown. Returns `false` if the attempt is stale.
    fn store_peer(&self, generation: u64, peer: Arc<dyn PeerConnection>) -> bool {
        let mut state = self.state.lock();
        if !state.is_current(generation, SessionStatus::Connecting) {
            return false;
        }
        state.peer = Some(peer);
        true
    }

    /// Release everything that can be released synchronously and hand back
    /// the peer for async shutdown.
    ///
    /// Order: close the bus, detach the dispatcher, stop the reader.
    fn teardown(
        &self,
        state: &mut SessionState,
        abort_reader: bool,
    ) -> Option<Arc<dyn PeerConnection>> {
        if let Some(bus) = state.bus.take() {
            bus.close();
        }
        if let Some(dispatcher) = self.dispatcher.lock().as_ref() {
            dispatcher.detach();
        }
        if let Some(reader) = state.reader.take()
            && abort_reader
        {
            reader.abort();
        }
        state.peer.take()
    }

    /// Move a failed attempt to `Error`, or report it as cancelled if it was
    /// superseded.
    async fn fail_connecting(&self, generation: u64, err: RealtimeError) -> RealtimeError {
        let peer = {
            let mut state = self.state.lock();
            if !state.is_current(generation, SessionStatus::Connecting) {
                return RealtimeError::Cancelled;
            }
            state.last_error = Some(err.to_string());
            self.set_status(&mut state, SessionStatus::Error);
            self.teardown(&mut state, true)
        };

        warn!(error = %err, "Session failed while connecting");
        release_peer(peer).await;
        err
    }

    /// Channel opened: wire the bus and go `Active`.
    fn activate(
        self: &Arc<Self>,
        generation: u64,
        channel: DataChannel,
        config: &SessionConfig,
    ) -> RealtimeResult<()> {
        let mut state = self.state.lock();
        if !state.is_current(generation, SessionStatus::Connecting) {
            return Err(RealtimeError::Cancelled);
        }

        let DataChannel { outbound, inbound } = channel;
        let bus = EventBus::new(outbound);
        state.bus = Some(bus.clone());

        self.register_flag_handlers(&bus, generation);
        if let Some(dispatcher) = self.dispatcher.lock().as_ref() {
            dispatcher.attach(&bus)?;
        }
        if let Some(instructions) = &config.instructions {
            bus.update_session(SessionUpdate {
                instructions: Some(instructions.clone()),
                ..Default::default()
            })?;
        }

        state.reader = Some(tokio::spawn(read_loop(
            Arc::downgrade(self),
            generation,
            bus,
            inbound,
        )));
        self.set_status(&mut state, SessionStatus::Active);
        Ok(())
    }

    fn register_flag_handlers(self: &Arc<Self>, bus: &EventBus, generation: u64) {
        let flag = |kind: ServerEventKind, apply: fn(&mut SessionState)| {
            let weak = Arc::downgrade(self);
            bus.on(kind, move |_| {
                if let Some(shared) = weak.upgrade() {
                    shared.apply_flag(generation, apply);
                }
            });
        };

        flag(ServerEventKind::SpeechStarted, |s| s.speech_detected = true);
        flag(ServerEventKind::SpeechStopped, |s| s.speech_detected = false);
        flag(ServerEventKind::AudioDelta, |s| s.ai_speaking = true);
        flag(ServerEventKind::AudioDone, |s| s.ai_speaking = false);
        flag(ServerEventKind::ResponseDone, |s| s.ai_speaking = false);

        bus.on(ServerEventKind::Error, |event| {
            if let ServerEvent::Error { error } = event {
                warn!(
                    error_type = %error.error_type,
                    message = %error.message,
                    "Realtime provider reported an error"
                );
            }
        });
    }

    /// Flags change only while `Active` in the current generation.
    fn apply_flag(&self, generation: u64, apply: fn(&mut SessionState)) {
        let mut state = self.state.lock();
        if state.is_current(generation, SessionStatus::Active) {
            apply(&mut state);
        }
    }

    /// The remote side closed the channel.
    async fn channel_closed(&self, generation: u64) {
        let peer = {
            let mut state = self.state.lock();
            if !state.is_current(generation, SessionStatus::Active) {
                return;
            }
            state.last_error = Some("Data channel closed".to_string());
            self.set_status(&mut state, SessionStatus::Error);
            // Called from the reader itself, so it is detached rather than aborted
            self.teardown(&mut state, false)
        };

        warn!("Data channel closed by remote, session moved to error");
        release_peer(peer).await;
    }
}

async fn release_peer(peer: Option<Arc<dyn PeerConnection>>) {
    if let Some(peer) = peer {
        peer.release_audio().await;
        peer.close().await;
    }
}

async fn read_loop(
    shared: Weak<SessionShared>,
    generation: u64,
    bus: EventBus,
    mut inbound: mpsc::UnboundedReceiver<String>,
) {
    while let Some(frame) = inbound.recv().await {
        if bus.is_closed() {
            return;
        }
        if let Err(e) = bus.dispatch_raw(&frame) {
            debug!(error = %e, "Dropping undecodable frame");
        }
    }

    if bus.is_closed() {
        return;
    }
    if let Some(shared) = shared.upgrade() {
        shared.channel_closed(generation).await;
    }
}

// =============================================================================
// Peer Session
// =============================================================================

/// Owns one peer connection lifecycle and the event bus on top of it.
pub struct PeerSession {
    config: SessionConfig,
    signaling: Arc<dyn Signaling>,
    connector: Arc<dyn PeerConnector>,
    shared: Arc<SessionShared>,
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("status", &self.status())
            .field("model", &self.config.model)
            .field("voice", &self.config.voice)
            .finish()
    }
}

impl PeerSession {
    pub fn new(
        config: SessionConfig,
        signaling: Arc<dyn Signaling>,
        connector: Arc<dyn PeerConnector>,
    ) -> Self {
        Self {
            config,
            signaling,
            connector,
            shared: Arc::new(SessionShared::new()),
        }
    }

    /// Session talking to the relay at `config.relay_url`.
    pub fn with_relay(
        config: SessionConfig,
        connector: Arc<dyn PeerConnector>,
    ) -> RealtimeResult<Self> {
        let signaling = Arc::new(RelayClient::new(config.relay_url.clone())?);
        Ok(Self::new(config, signaling, connector))
    }

    /// Attach a function-call dispatcher to every connection of this session.
    ///
    /// Status receivers and any live connection are kept; a connection that
    /// is already active switches to the new dispatcher immediately.
    pub fn with_dispatcher(self, dispatcher: FunctionCallDispatcher) -> Self {
        self.shared.install_dispatcher(dispatcher);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.state.lock().status
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.state.lock().last_error.clone()
    }

    pub fn is_ai_speaking(&self) -> bool {
        self.shared.state.lock().ai_speaking
    }

    pub fn is_speech_detected(&self) -> bool {
        self.shared.state.lock().speech_detected
    }

    /// Identifier of the current connection attempt, for log correlation.
    pub fn session_id(&self) -> Option<Uuid> {
        self.shared.state.lock().session_id
    }

    /// Watch status transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status_tx.subscribe()
    }

    /// The event bus of the active connection.
    pub fn bus(&self) -> Option<EventBus> {
        self.shared.state.lock().bus.clone()
    }

    pub fn dispatcher(&self) -> Option<FunctionCallDispatcher> {
        self.shared.dispatcher.lock().clone()
    }

    /// Connect: credential, offer, negotiate, answer, channel open.
    ///
    /// Allowed from `Idle`, `Closed` and `Error`; the latter two start a
    /// fresh attempt with cleared flags and error. Any failure moves the
    /// session to `Error` without retrying.
    pub async fn start(&self) -> RealtimeResult<()> {
        let (generation, session_id) = self.shared.begin()?;
        info!(%session_id, model = %self.config.model, "Starting realtime session");

        match self.establish(generation).await {
            Ok(()) => {
                info!(%session_id, "Realtime session active");
                Ok(())
            }
            Err(err) => Err(self.shared.fail_connecting(generation, err).await),
        }
    }

    async fn establish(&self, generation: u64) -> RealtimeResult<()> {
        let config = &self.config;

        let credential = timeout(
            config.credential_timeout,
            self.signaling.fetch_credential(&config.model, &config.voice),
        )
        .await
        .map_err(|_| RealtimeError::Timeout("credential request".to_string()))??;
        self.shared.ensure_connecting(generation)?;
        if credential.is_expired() {
            return Err(RealtimeError::Credential(
                "Credential expired before use".to_string(),
            ));
        }

        let peer = self.connector.connect().await?;
        if !self.shared.store_peer(generation, peer.clone()) {
            release_peer(Some(peer)).await;
            return Err(RealtimeError::Cancelled);
        }

        let offer = peer.create_offer().await?;
        self.shared.ensure_connecting(generation)?;

        let answer = timeout(
            config.negotiate_timeout,
            self.signaling
                .negotiate(&credential, &config.model, &offer),
        )
        .await
        .map_err(|_| RealtimeError::Timeout("SDP negotiation".to_string()))??;
        drop(credential);

        // A late answer after stop() must not revive the session
        self.shared.ensure_connecting(generation)?;
        peer.apply_answer(&answer).await?;
        self.shared.ensure_connecting(generation)?;

        let channel = timeout(config.channel_open_timeout, peer.open_channel())
            .await
            .map_err(|_| RealtimeError::Timeout("data channel open".to_string()))??;

        self.shared.activate(generation, channel, config)
    }

    /// Close the session. No-op when already `Closed` or `Error`.
    ///
    /// Local state changes immediately; in-flight network calls are not
    /// aborted, their results are discarded when they resolve.
    pub async fn stop(&self) {
        let peer = {
            let mut state = self.shared.state.lock();
            if state.status.is_terminal() {
                return;
            }
            self.shared.set_status(&mut state, SessionStatus::Closed);
            self.shared.teardown(&mut state, true)
        };

        info!(session_id = ?self.session_id(), "Realtime session closed");
        release_peer(peer).await;
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        let peer = {
            let mut state = self.shared.state.lock();
            if state.status.is_terminal() || state.status == SessionStatus::Idle {
                return;
            }
            self.shared.set_status(&mut state, SessionStatus::Closed);
            self.shared.teardown(&mut state, true)
        };

        if let Some(peer) = peer
            && let Ok(handle) = tokio::runtime::Handle::try_current()
        {
            handle.spawn(release_peer(Some(peer)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::realtime::signaling::SessionCredential;
    use async_trait::async_trait;

    struct StaticSignaling;

    #[async_trait]
    impl Signaling for StaticSignaling {
        async fn fetch_credential(&self, _: &str, _: &str) -> RealtimeResult<SessionCredential> {
            Ok(SessionCredential::new("ek", None))
        }

        async fn negotiate(
            &self,
            _: &SessionCredential,
            _: &str,
            _: &str,
        ) -> RealtimeResult<String> {
            Err(RealtimeError::Upstream {
                status: 401,
                message: "bad key".to_string(),
            })
        }
    }

    struct NullPeer;

    #[async_trait]
    impl PeerConnection for NullPeer {
        async fn create_offer(&self) -> RealtimeResult<String> {
            Ok("v=0 offer".to_string())
        }
        async fn apply_answer(&self, _: &str) -> RealtimeResult<()> {
            Ok(())
        }
        async fn open_channel(&self) -> RealtimeResult<DataChannel> {
            Err(RealtimeError::Channel("unused".to_string()))
        }
        async fn release_audio(&self) {}
        async fn close(&self) {}
    }

    struct NullConnector;

    #[async_trait]
    impl PeerConnector for NullConnector {
        async fn connect(&self) -> RealtimeResult<Arc<dyn PeerConnection>> {
            Ok(Arc::new(NullPeer))
        }
    }

    fn session() -> PeerSession {
        PeerSession::new(
            SessionConfig::default(),
            Arc::new(StaticSignaling),
            Arc::new(NullConnector),
        )
    }

    #[test]
    fn test_new_session_is_idle() {
        let session = session();
        assert_eq!(session.status(), SessionStatus::Idle);
        assert!(session.last_error().is_none());
        assert!(!session.is_ai_speaking());
        assert!(!session.is_speech_detected());
        assert!(session.bus().is_none());
    }

    #[tokio::test]
    async fn test_upstream_rejection_moves_to_error() {
        let session = session();
        let mut status = session.subscribe();

        let err = session.start().await.unwrap_err();

        assert_eq!(
            err,
            RealtimeError::Upstream {
                status: 401,
                message: "bad key".to_string()
            }
        );
        assert_eq!(session.status(), SessionStatus::Error);
        assert_eq!(*status.borrow_and_update(), SessionStatus::Error);
        assert!(session.last_error().unwrap().contains("bad key"));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_on_terminal_states() {
        let session = session();
        let _ = session.start().await;
        assert_eq!(session.status(), SessionStatus::Error);

        session.stop().await;
        assert_eq!(session.status(), SessionStatus::Error);
    }

    #[tokio::test]
    async fn test_stop_from_idle_closes() {
        let session = session();
        session.stop().await;
        assert_eq!(session.status(), SessionStatus::Closed);
        session.stop().await;
        assert_eq!(session.status(), SessionStatus::Closed);
    }
}
