//! Gateway connection state machine.
//!
//! Owns one socket at a time. The read pump processes inbound frames in
//! arrival order; a Hello starts the heartbeat loop and answers with
//! Resume or Identify (decided fresh each time); any disconnect — unless
//! a manual shutdown is in progress — schedules a reconnect loop with
//! exponential backoff. A single mutex-guarded critical section ensures
//! at most one socket-open attempt is in flight.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use lyrebird_protocol::frame::Frame;
use lyrebird_protocol::opcode::Opcode;
use lyrebird_protocol::payloads::{Hello, Identify, Resume};
use lyrebird_protocol::presence::Presence;
use lyrebird_protocol::GatewayEvent;

use crate::error::GatewayError;
use crate::session::SessionContext;
use crate::socket::{Connector, MAX_FRAME_BYTES, WsMessage, write_pump};
use crate::types::ConnectionState;
use crate::GatewayConfig;

/// Close code the server uses for authentication failures; reconnecting
/// with the same token would only loop, so it suppresses the retry path.
pub(crate) const CLOSE_AUTH_FAILED: u16 = 4004;

/// Shared connection state handed to the spawned pumps and loops.
pub(crate) struct ConnShared<C: Connector> {
    pub(crate) connector: Arc<C>,
    pub(crate) config: Arc<GatewayConfig>,
    /// Bearer token; never logged.
    pub(crate) token: Arc<String>,
    pub(crate) session: Arc<std::sync::Mutex<SessionContext>>,
    pub(crate) state_tx: Arc<watch::Sender<ConnectionState>>,
    pub(crate) error_tx: Arc<watch::Sender<Option<String>>>,
    pub(crate) writer: Arc<Mutex<Option<mpsc::Sender<WsMessage>>>>,
    /// Guards the "open a new socket" critical section.
    pub(crate) connect_lock: Arc<Mutex<()>>,
    /// Cancel token for the active reconnect loop, if any.
    pub(crate) reconnect_cancel: Arc<std::sync::Mutex<Option<CancellationToken>>>,
    /// Cancel token for the current socket's pumps, if any.
    pub(crate) socket_cancel: Arc<std::sync::Mutex<Option<CancellationToken>>>,
    /// Set when a manual shutdown is requested; suppresses reconnection.
    pub(crate) closing: Arc<AtomicBool>,
    /// Connection-lifetime token; parent of every per-socket token.
    pub(crate) cancel: CancellationToken,
}

impl<C: Connector> Clone for ConnShared<C> {
    fn clone(&self) -> Self {
        Self {
            connector: self.connector.clone(),
            config: self.config.clone(),
            token: self.token.clone(),
            session: self.session.clone(),
            state_tx: self.state_tx.clone(),
            error_tx: self.error_tx.clone(),
            writer: self.writer.clone(),
            connect_lock: self.connect_lock.clone(),
            reconnect_cancel: self.reconnect_cancel.clone(),
            socket_cancel: self.socket_cancel.clone(),
            closing: self.closing.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<C: Connector> ConnShared<C> {
    pub(crate) fn set_state(&self, state: ConnectionState) {
        trace!(?state, "connection state change");
        self.state_tx.send_replace(state);
    }

    /// Records a failure on the error stream and as an Error state.
    pub(crate) fn record_error(&self, cause: &str) {
        self.error_tx.send_replace(Some(cause.to_string()));
        self.set_state(ConnectionState::Error {
            cause: cause.to_string(),
        });
    }
}

/// Persistent, self-healing gateway connection.
pub struct GatewayConnection<C: Connector> {
    pub(crate) shared: ConnShared<C>,
    state_rx: watch::Receiver<ConnectionState>,
    error_rx: watch::Receiver<Option<String>>,
}

impl<C: Connector> Clone for GatewayConnection<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            state_rx: self.state_rx.clone(),
            error_rx: self.error_rx.clone(),
        }
    }
}

impl<C: Connector> GatewayConnection<C> {
    /// Creates an idle connection. `cancel` cascades to every task the
    /// connection spawns.
    pub fn new(connector: C, token: String, config: GatewayConfig, cancel: CancellationToken) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (error_tx, error_rx) = watch::channel(None);
        Self {
            shared: ConnShared {
                connector: Arc::new(connector),
                config: Arc::new(config),
                token: Arc::new(token),
                session: Arc::new(std::sync::Mutex::new(SessionContext::default())),
                state_tx: Arc::new(state_tx),
                error_tx: Arc::new(error_tx),
                writer: Arc::new(Mutex::new(None)),
                connect_lock: Arc::new(Mutex::new(())),
                reconnect_cancel: Arc::new(std::sync::Mutex::new(None)),
                socket_cancel: Arc::new(std::sync::Mutex::new(None)),
                closing: Arc::new(AtomicBool::new(false)),
                cancel,
            },
            state_rx,
            error_rx,
        }
    }

    /// Observable connection-state stream.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Observable stream of the most recent error, if any.
    pub fn subscribe_error(&self) -> watch::Receiver<Option<String>> {
        self.error_rx.clone()
    }

    pub(crate) fn config(&self) -> &GatewayConfig {
        &self.shared.config
    }

    /// Opens a socket if none is open. Concurrent callers await the same
    /// attempt instead of racing a second one.
    pub(crate) async fn ensure_connected(&self) -> Result<(), GatewayError> {
        if self.shared.closing.load(Ordering::Relaxed) {
            return Err(GatewayError::Closed);
        }
        let _guard = self.shared.connect_lock.lock().await;
        if self.shared.writer.lock().await.is_some() {
            return Ok(());
        }
        open_socket(&self.shared, ConnectionState::Connecting).await
    }

    /// Starts the connection, falling into the reconnect loop on failure.
    pub(crate) async fn start(&self) {
        if let Err(e) = self.ensure_connected().await {
            warn!(error = %e, "initial connect failed");
            self.shared.record_error(&e.to_string());
            spawn_reconnect(self.shared.clone());
        }
    }

    /// Drops the current socket and dials again immediately.
    pub(crate) async fn restart(&self) {
        if self.shared.closing.load(Ordering::Relaxed) {
            return;
        }
        if let Some(token) = self.shared.socket_cancel.lock().unwrap().take() {
            token.cancel();
        }
        *self.shared.writer.lock().await = None;
        self.start().await;
    }

    /// Waits until the connection reaches `Connected`, up to `timeout`.
    pub(crate) async fn wait_ready(&self, timeout: Duration) -> Result<(), GatewayError> {
        let mut rx = self.state_rx.clone();
        tokio::time::timeout(
            timeout,
            rx.wait_for(|s| matches!(s, ConnectionState::Connected)),
        )
        .await
        .map_err(|_| GatewayError::ReadyTimeout)?
        .map_err(|_| GatewayError::Closed)?;
        Ok(())
    }

    /// Sends a presence update as an op-3 frame.
    pub(crate) async fn send_presence(&self, presence: &Presence) -> Result<(), GatewayError> {
        let frame = Frame::new(Opcode::PresenceUpdate, Some(&presence.to_update()))?;
        send_frame(&self.shared, &frame).await
    }

    /// Shuts the connection down for good. Idempotent; no reconnects
    /// happen afterwards.
    pub(crate) async fn shutdown(&self) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.set_state(ConnectionState::Closing);

        if let Some(token) = self.shared.reconnect_cancel.lock().unwrap().take() {
            token.cancel();
        }

        // Ask for a normal closure before tearing the pumps down.
        if let Some(tx) = self.shared.writer.lock().await.take() {
            use tokio_tungstenite::tungstenite::protocol::CloseFrame;
            use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
            let close = WsMessage::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            }));
            let _ = tx.send(close).await;
        }

        self.shared.cancel.cancel();
        self.shared.set_state(ConnectionState::Disconnected {
            reason: "closed".into(),
        });
        debug!("gateway connection shut down");
    }
}

/// Opens a socket and spawns its pumps. Callers must hold the connect
/// lock.
async fn open_socket<C: Connector>(
    ctx: &ConnShared<C>,
    dial_state: ConnectionState,
) -> Result<(), GatewayError> {
    ctx.set_state(dial_state);

    let url = {
        let session = ctx.session.lock().unwrap();
        session
            .resume_url
            .clone()
            .unwrap_or_else(|| ctx.config.url.clone())
    };

    debug!(url = %url, "dialing gateway");
    let (write, read) = ctx.connector.connect(&url).await?;

    let socket_cancel = ctx.cancel.child_token();
    if let Some(prev) = ctx
        .socket_cancel
        .lock()
        .unwrap()
        .replace(socket_cancel.clone())
    {
        prev.cancel();
    }

    let (write_tx, write_rx) = mpsc::channel::<WsMessage>(64);
    tokio::spawn(write_pump(write, write_rx, socket_cancel.clone()));
    *ctx.writer.lock().await = Some(write_tx.clone());

    tokio::spawn(read_pump(ctx.clone(), read, write_tx, socket_cancel));
    Ok(())
}

/// What the read pump should do after a frame is handled.
enum FrameOutcome {
    Continue,
    /// Tear the socket down and reconnect (server request or invalid
    /// session).
    Reconnect(&'static str),
}

/// Reads frames off the socket until it dies, then schedules reconnection
/// unless a manual shutdown is in progress.
async fn read_pump<C: Connector, S>(
    ctx: ConnShared<C>,
    mut read: S,
    write_tx: mpsc::Sender<WsMessage>,
    socket_cancel: CancellationToken,
) where
    S: futures_util::Stream<Item = crate::socket::WsStreamItem> + Unpin,
{
    // Set whenever anything arrives; the heartbeat loop clears it per
    // beat and treats a silent interval as a dead connection.
    let ack = Arc::new(AtomicBool::new(true));
    let mut heartbeat: Option<CancellationToken> = None;
    let mut close_reason: Option<String> = None;
    let mut auth_failed = false;

    loop {
        tokio::select! {
            _ = socket_cancel.cancelled() => break,

            msg = read.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        ack.store(true, Ordering::Relaxed);
                        match handle_frame(&ctx, &text, &socket_cancel, &ack, &mut heartbeat).await {
                            FrameOutcome::Continue => {}
                            FrameOutcome::Reconnect(reason) => {
                                close_reason = Some(reason.to_string());
                                break;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        ack.store(true, Ordering::Relaxed);
                        let _ = write_tx.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        if let Some(ref f) = frame {
                            if u16::from(f.code) == CLOSE_AUTH_FAILED {
                                warn!("gateway closed the session: authentication failed");
                                auth_failed = true;
                            }
                            close_reason = Some(f.reason.to_string());
                        }
                        debug!("received close frame");
                        break;
                    }
                    Some(Ok(_)) => {
                        ack.store(true, Ordering::Relaxed);
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        close_reason = Some(e.to_string());
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Teardown: stop this socket's pumps and clear the writer if it is
    // still ours (a restart may already have installed a fresh one).
    socket_cancel.cancel();
    {
        let mut writer = ctx.writer.lock().await;
        if writer.as_ref().is_some_and(|tx| tx.same_channel(&write_tx)) {
            *writer = None;
        }
    }

    if ctx.closing.load(Ordering::Relaxed) || ctx.cancel.is_cancelled() {
        return;
    }

    let reason = close_reason.unwrap_or_else(|| "socket closed".into());
    ctx.set_state(ConnectionState::Disconnected {
        reason: reason.clone(),
    });

    if auth_failed {
        ctx.record_error("authentication failed");
        return;
    }

    spawn_reconnect(ctx);
}

/// Handles one inbound text frame.
async fn handle_frame<C: Connector>(
    ctx: &ConnShared<C>,
    text: &str,
    socket_cancel: &CancellationToken,
    ack: &Arc<AtomicBool>,
    heartbeat: &mut Option<CancellationToken>,
) -> FrameOutcome {
    if text.len() > MAX_FRAME_BYTES {
        warn!("frame too large ({} bytes), dropping", text.len());
        return FrameOutcome::Continue;
    }

    let frame: Frame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            warn!("failed to parse frame: {e}");
            return FrameOutcome::Continue;
        }
    };

    match frame.op {
        Opcode::Hello => {
            let hello: Hello = match frame.parse_payload() {
                Ok(Some(h)) => h,
                Ok(None) | Err(_) => {
                    warn!("malformed hello payload");
                    return FrameOutcome::Reconnect("malformed hello");
                }
            };

            // Resume vs. Identify, decided fresh on every Hello: an
            // Invalid Session in between clears the resumable fields.
            let handshake = {
                let session = ctx.session.lock().unwrap();
                if session.can_resume() {
                    debug!(seq = session.seq, "resuming session");
                    Frame::new(
                        Opcode::Resume,
                        Some(&Resume {
                            token: ctx.token.as_ref().clone(),
                            session_id: session.session_id.clone().unwrap_or_default(),
                            seq: session.seq,
                        }),
                    )
                } else {
                    debug!("identifying with a fresh session");
                    Frame::new(
                        Opcode::Identify,
                        Some(&Identify::new(ctx.token.as_ref().clone())),
                    )
                }
            };

            let handshake = match handshake {
                Ok(f) => f,
                Err(e) => {
                    warn!("failed to encode handshake: {e}");
                    return FrameOutcome::Reconnect("handshake encode failed");
                }
            };
            if send_frame(ctx, &handshake).await.is_err() {
                return FrameOutcome::Reconnect("handshake send failed");
            }

            // (Re)start the heartbeat loop at the server's interval.
            if let Some(prev) = heartbeat.take() {
                prev.cancel();
            }
            let hb_cancel = socket_cancel.child_token();
            *heartbeat = Some(hb_cancel.clone());
            tokio::spawn(heartbeat_loop(
                ctx.clone(),
                Duration::from_millis(hello.heartbeat_interval),
                socket_cancel.clone(),
                hb_cancel,
                ack.clone(),
            ));
            FrameOutcome::Continue
        }

        Opcode::Heartbeat => {
            // Server-requested beat, answered out of band from the timer.
            let seq = ctx.session.lock().unwrap().seq;
            match Frame::heartbeat(seq) {
                Ok(beat) => {
                    let _ = send_frame(ctx, &beat).await;
                }
                Err(e) => warn!("failed to encode heartbeat: {e}"),
            }
            FrameOutcome::Continue
        }

        Opcode::HeartbeatAck => {
            trace!("heartbeat acknowledged");
            FrameOutcome::Continue
        }

        Opcode::Dispatch => {
            if let Some(s) = frame.s {
                ctx.session.lock().unwrap().seq = s;
            }
            match frame.event() {
                Ok(Some(GatewayEvent::Ready(ready))) => {
                    {
                        let mut session = ctx.session.lock().unwrap();
                        session.session_id = Some(ready.session_id.clone());
                        if ready.resume_gateway_url.is_some() {
                            session.resume_url = ready.resume_gateway_url.clone();
                        }
                    }
                    info!("gateway session ready");
                    ctx.set_state(ConnectionState::Connected);
                }
                Ok(Some(GatewayEvent::Resumed)) => {
                    info!("gateway session resumed");
                    ctx.set_state(ConnectionState::Connected);
                }
                Ok(Some(GatewayEvent::Unknown(name))) => {
                    trace!(event = %name, "ignoring dispatch event");
                }
                Ok(None) => {}
                Err(e) => warn!("failed to decode dispatch payload: {e}"),
            }
            FrameOutcome::Continue
        }

        Opcode::InvalidSession => {
            warn!("session invalidated by the server");
            ctx.session.lock().unwrap().invalidate();
            FrameOutcome::Reconnect("invalid session")
        }

        Opcode::Reconnect => {
            debug!("server requested reconnect");
            FrameOutcome::Reconnect("server requested reconnect")
        }

        other => {
            trace!(op = other.code(), "ignoring frame");
            FrameOutcome::Continue
        }
    }
}

/// Periodic heartbeat at the server-provided interval.
///
/// If a whole interval passes with no inbound traffic after a beat, the
/// connection is considered dead and the socket is torn down, which
/// triggers the normal reconnect path.
async fn heartbeat_loop<C: Connector>(
    ctx: ConnShared<C>,
    period: Duration,
    socket_cancel: CancellationToken,
    hb_cancel: CancellationToken,
    ack: Arc<AtomicBool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await; // Skip immediate first tick.

    loop {
        tokio::select! {
            _ = hb_cancel.cancelled() => break,
            _ = interval.tick() => {
                if !ack.swap(false, Ordering::Relaxed) {
                    warn!("heartbeat ack timeout — connection dead, closing");
                    socket_cancel.cancel();
                    break;
                }
                let seq = ctx.session.lock().unwrap().seq;
                let beat = match Frame::heartbeat(seq) {
                    Ok(b) => b,
                    Err(e) => {
                        warn!("failed to encode heartbeat: {e}");
                        continue;
                    }
                };
                if send_frame(&ctx, &beat).await.is_err() {
                    debug!("heartbeat send failed, stopping");
                    socket_cancel.cancel();
                    break;
                }
            }
        }
    }
}

/// Serializes and queues a frame on the current socket.
pub(crate) async fn send_frame<C: Connector>(
    ctx: &ConnShared<C>,
    frame: &Frame,
) -> Result<(), GatewayError> {
    let json = serde_json::to_string(frame)?;
    let tx = ctx
        .writer
        .lock()
        .await
        .clone()
        .ok_or(GatewayError::NotConnected)?;
    tx.send(WsMessage::Text(json.into()))
        .await
        .map_err(|_| GatewayError::NotConnected)
}

/// Spawns the reconnect loop, replacing any already-running one.
pub(crate) fn spawn_reconnect<C: Connector>(ctx: ConnShared<C>) {
    if ctx.closing.load(Ordering::Relaxed) || ctx.cancel.is_cancelled() {
        return;
    }
    let cancel = ctx.cancel.child_token();
    if let Some(prev) = ctx.reconnect_cancel.lock().unwrap().replace(cancel.clone()) {
        prev.cancel();
    }
    tokio::spawn(reconnect_loop(ctx, cancel));
}

/// Reconnection loop with exponential backoff.
async fn reconnect_loop<C: Connector>(ctx: ConnShared<C>, cancel: CancellationToken) {
    let mut attempt: u32 = 0;

    loop {
        if ctx.closing.load(Ordering::Relaxed) {
            return;
        }
        attempt = attempt.saturating_add(1);
        let delay = ctx.config.reconnect.delay_for_attempt(attempt);

        ctx.set_state(ConnectionState::Reconnecting { attempt });
        info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("reconnect cancelled");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        let _guard = ctx.connect_lock.lock().await;
        if cancel.is_cancelled() || ctx.closing.load(Ordering::Relaxed) {
            return;
        }
        // A concurrent caller may have already opened a socket.
        if ctx.writer.lock().await.is_some() {
            break;
        }

        match open_socket(&ctx, ConnectionState::Reconnecting { attempt }).await {
            Ok(()) => {
                debug!(attempt, "socket reopened");
                break;
            }
            Err(e) => {
                warn!(attempt, error = %e, "reconnect attempt failed");
                ctx.record_error(&e.to_string());
            }
        }
    }

    // Clean up the token slot. If ours was replaced by a newer loop it
    // was cancelled in the process, so a live token is still ours.
    if !cancel.is_cancelled() {
        *ctx.reconnect_cancel.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;

    use futures_util::{Sink, Stream};
    use tokio_tungstenite::tungstenite;

    /// Connector whose dial always fails; unit tests drive the frame
    /// handler directly.
    struct NeverConnector;

    impl Connector for NeverConnector {
        type Read = Pin<Box<dyn Stream<Item = crate::socket::WsStreamItem> + Send>>;
        type Write = Pin<Box<dyn Sink<WsMessage, Error = tungstenite::Error> + Send>>;

        fn connect(
            &self,
            _url: &str,
        ) -> impl Future<Output = Result<(Self::Write, Self::Read), GatewayError>> + Send {
            async { Err(GatewayError::NotConnected) }
        }
    }

    fn test_conn() -> GatewayConnection<NeverConnector> {
        GatewayConnection::new(
            NeverConnector,
            "tok-test".into(),
            GatewayConfig::default(),
            CancellationToken::new(),
        )
    }

    /// Installs a writer channel and returns its receiving end.
    async fn install_writer(
        conn: &GatewayConnection<NeverConnector>,
    ) -> mpsc::Receiver<WsMessage> {
        let (tx, rx) = mpsc::channel(16);
        *conn.shared.writer.lock().await = Some(tx);
        rx
    }

    async fn recv_frame(rx: &mut mpsc::Receiver<WsMessage>) -> Frame {
        match rx.recv().await.unwrap() {
            WsMessage::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    async fn feed(
        conn: &GatewayConnection<NeverConnector>,
        json: &str,
    ) -> FrameOutcome {
        let cancel = CancellationToken::new();
        let ack = Arc::new(AtomicBool::new(true));
        let mut hb = None;
        let outcome = handle_frame(&conn.shared, json, &cancel, &ack, &mut hb).await;
        // Stop any heartbeat loop the frame started.
        if let Some(t) = hb {
            t.cancel();
        }
        outcome
    }

    #[tokio::test]
    async fn hello_with_fresh_session_identifies() {
        let conn = test_conn();
        let mut rx = install_writer(&conn).await;

        feed(&conn, r#"{"op":10,"d":{"heartbeat_interval":45000}}"#).await;

        let frame = recv_frame(&mut rx).await;
        assert_eq!(frame.op, Opcode::Identify);
        let identify: Identify = frame.parse_payload().unwrap().unwrap();
        assert_eq!(identify.token, "tok-test");
    }

    #[tokio::test]
    async fn hello_with_resumable_session_resumes() {
        let conn = test_conn();
        let mut rx = install_writer(&conn).await;
        {
            let mut session = conn.shared.session.lock().unwrap();
            session.seq = 12;
            session.session_id = Some("sess-9".into());
        }

        feed(&conn, r#"{"op":10,"d":{"heartbeat_interval":45000}}"#).await;

        let frame = recv_frame(&mut rx).await;
        assert_eq!(frame.op, Opcode::Resume);
        let resume: Resume = frame.parse_payload().unwrap().unwrap();
        assert_eq!(resume.session_id, "sess-9");
        assert_eq!(resume.seq, 12);
        assert_eq!(resume.token, "tok-test");
    }

    #[tokio::test]
    async fn invalid_session_clears_fields_then_hello_identifies() {
        let conn = test_conn();
        let mut rx = install_writer(&conn).await;
        {
            let mut session = conn.shared.session.lock().unwrap();
            session.seq = 7;
            session.session_id = Some("sess".into());
        }

        let outcome = feed(&conn, r#"{"op":9,"d":false}"#).await;
        assert!(matches!(outcome, FrameOutcome::Reconnect(_)));
        {
            let session = conn.shared.session.lock().unwrap();
            assert_eq!(session.seq, 0);
            assert!(session.session_id.is_none());
        }

        // The next Hello must identify, never resume.
        feed(&conn, r#"{"op":10,"d":{"heartbeat_interval":45000}}"#).await;
        let frame = recv_frame(&mut rx).await;
        assert_eq!(frame.op, Opcode::Identify);
    }

    #[tokio::test]
    async fn ready_dispatch_sets_connected_and_session() {
        let conn = test_conn();
        let _rx = install_writer(&conn).await;

        feed(
            &conn,
            r#"{"op":0,"d":{"session_id":"abc","resume_gateway_url":"wss://r.example"},"s":1,"t":"READY"}"#,
        )
        .await;

        assert_eq!(
            *conn.subscribe_state().borrow(),
            ConnectionState::Connected
        );
        let session = conn.shared.session.lock().unwrap();
        assert_eq!(session.seq, 1);
        assert_eq!(session.session_id.as_deref(), Some("abc"));
        assert_eq!(session.resume_url.as_deref(), Some("wss://r.example"));
    }

    #[tokio::test]
    async fn dispatch_updates_sequence_for_unknown_events() {
        let conn = test_conn();
        let _rx = install_writer(&conn).await;

        feed(&conn, r#"{"op":0,"d":{},"s":41,"t":"SOME_FUTURE_EVENT"}"#).await;
        assert_eq!(conn.shared.session.lock().unwrap().seq, 41);
        // Unknown events never flip the state.
        assert_ne!(
            *conn.subscribe_state().borrow(),
            ConnectionState::Connected
        );
    }

    #[tokio::test]
    async fn server_heartbeat_answered_immediately() {
        let conn = test_conn();
        let mut rx = install_writer(&conn).await;
        conn.shared.session.lock().unwrap().seq = 33;

        feed(&conn, r#"{"op":1,"d":null}"#).await;

        let frame = recv_frame(&mut rx).await;
        assert_eq!(frame.op, Opcode::Heartbeat);
        let seq: Option<u64> = frame.parse_payload().unwrap().unwrap();
        assert_eq!(seq, Some(33));
    }

    #[tokio::test]
    async fn malformed_frame_is_dropped() {
        let conn = test_conn();
        let _rx = install_writer(&conn).await;
        let outcome = feed(&conn, "not json {{{").await;
        assert!(matches!(outcome, FrameOutcome::Continue));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_ack_timeout_tears_down_socket() {
        let conn = test_conn();
        let _rx = install_writer(&conn).await;

        let socket_cancel = CancellationToken::new();
        let ack = Arc::new(AtomicBool::new(true));
        let handle = tokio::spawn(heartbeat_loop(
            conn.shared.clone(),
            Duration::from_millis(100),
            socket_cancel.clone(),
            socket_cancel.child_token(),
            ack.clone(),
        ));

        // First tick sends a beat (ack was true); second tick sees no
        // inbound traffic and declares the connection dead.
        handle.await.unwrap();
        assert!(socket_cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_survives_while_acked() {
        let conn = test_conn();
        let mut rx = install_writer(&conn).await;

        let socket_cancel = CancellationToken::new();
        let ack = Arc::new(AtomicBool::new(true));
        tokio::spawn(heartbeat_loop(
            conn.shared.clone(),
            Duration::from_millis(100),
            socket_cancel.clone(),
            socket_cancel.child_token(),
            ack.clone(),
        ));

        // Acknowledge a few beats; the socket must stay up.
        for _ in 0..3 {
            let frame = recv_frame(&mut rx).await;
            assert_eq!(frame.op, Opcode::Heartbeat);
            ack.store(true, Ordering::Relaxed);
        }
        assert!(!socket_cancel.is_cancelled());
        socket_cancel.cancel();
    }

    #[tokio::test]
    async fn ensure_connected_after_shutdown_errors() {
        let conn = test_conn();
        conn.shutdown().await;
        let result = conn.ensure_connected().await;
        assert!(matches!(result, Err(GatewayError::Closed)));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let conn = test_conn();
        conn.shutdown().await;
        let state = conn.subscribe_state().borrow().clone();
        conn.shutdown().await;
        assert_eq!(state, conn.subscribe_state().borrow().clone());
        assert!(matches!(
            *conn.subscribe_state().borrow(),
            ConnectionState::Disconnected { .. }
        ));
    }

    #[tokio::test]
    async fn send_presence_without_socket_fails() {
        let conn = test_conn();
        let presence = Presence {
            name: "x".into(),
            state: None,
            details: None,
            start: None,
            end: None,
            large_image: None,
            small_image: None,
            large_text: None,
            small_text: None,
            buttons: vec![],
            application_id: None,
            activity_type: 0,
            status: "online".into(),
        };
        let result = conn.send_presence(&presence).await;
        assert!(matches!(result, Err(GatewayError::NotConnected)));
    }
}
