use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use webchat_core::{
    CloseOutcome, ConnectionStateMachine, ConnectionStatus, InboundFrame, OutboundFrame,
    RetryPolicy, SessionType, WebchatConfig, WebchatError,
    frame::parse_frame,
};

use crate::transport::{Connection, Transport};

/// Upper bound on the reconnect backoff, regardless of attempt count.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Data replayed in the `register` frame on every (re)connect.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationData {
    pub from: String,
    pub callback: String,
    pub session_type: SessionType,
    pub token: Option<String>,
}

impl RegistrationData {
    fn frame(&self) -> OutboundFrame {
        OutboundFrame::Register {
            from: self.from.clone(),
            callback: self.callback.clone(),
            session_type: self.session_type,
            token: self.token.clone(),
        }
    }
}

/// Events emitted by the connection engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    StatusChanged {
        previous: ConnectionStatus,
        current: ConnectionStatus,
    },
    /// A reconnect was scheduled; `attempt` is 1-based.
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    /// An inbound frame for downstream processing. `pong` and
    /// `ready_for_message` never appear here; the engine consumes them.
    Frame(InboundFrame),
    Error(WebchatError),
}

struct SendCommand {
    text: String,
    ack: oneshot::Sender<Result<(), WebchatError>>,
}

enum SessionExit {
    Closed,
    Cancelled,
}

struct EngineInner<T: Transport> {
    transport: T,
    socket_url: String,
    ping_interval: Duration,
    reconnect_interval: Duration,
    fsm: Mutex<ConnectionStateMachine>,
    events: broadcast::Sender<EngineEvent>,
    status_tx: watch::Sender<ConnectionStatus>,
    command_tx: Mutex<Option<mpsc::UnboundedSender<SendCommand>>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl<T: Transport> EngineInner<T> {
    fn publish_status(&self, current: ConnectionStatus) {
        let previous = *self.status_tx.borrow();
        if previous == current {
            return;
        }
        let _ = self.status_tx.send(current);
        let _ = self
            .events
            .send(EngineEvent::StatusChanged { previous, current });
    }

    fn emit_error(&self, error: WebchatError) {
        let _ = self.events.send(EngineEvent::Error(error));
    }
}

/// Owns the transport and its lifecycle: registration handshake,
/// keep-alive, exponential-backoff reconnection, and frame dispatch.
///
/// No other component touches the socket; everything flows through the
/// engine's event stream and `send`.
pub struct ConnectionEngine<T: Transport> {
    inner: Arc<EngineInner<T>>,
}

impl<T: Transport> Clone for ConnectionEngine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> ConnectionEngine<T> {
    pub fn new(config: &WebchatConfig, transport: T) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let (events, _) = broadcast::channel(256);

        Self {
            inner: Arc::new(EngineInner {
                transport,
                socket_url: config.socket_url.clone(),
                ping_interval: config.ping_interval,
                reconnect_interval: config.reconnect_interval,
                fsm: Mutex::new(ConnectionStateMachine::new(
                    config.auto_reconnect,
                    config.max_reconnect_attempts,
                )),
                events,
                status_tx,
                command_tx: Mutex::new(None),
                cancel: Mutex::new(None),
            }),
        }
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status_tx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Open the transport and resolve once the server confirms the
    /// handshake with `ready_for_message`.
    ///
    /// A registration-level server error rejects this call; reconnection
    /// still applies afterwards unless the disconnect was permanent.
    pub async fn connect(&self, registration: RegistrationData) -> Result<(), WebchatError> {
        {
            let mut fsm = self.inner.fsm.lock().expect("fsm lock poisoned");
            fsm.on_connect_requested()?;
        }
        self.inner.publish_status(ConnectionStatus::Connecting);

        let cancel = CancellationToken::new();
        {
            let mut slot = self.inner.cancel.lock().expect("cancel lock poisoned");
            if let Some(previous) = slot.replace(cancel.clone()) {
                previous.cancel();
            }
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(run_supervisor(inner, registration, cancel));

        let mut events = self.subscribe();
        let mut status_rx = self.watch_status();
        loop {
            tokio::select! {
                changed = status_rx.wait_for(|status| {
                    matches!(
                        status,
                        ConnectionStatus::Connected
                            | ConnectionStatus::Disconnected
                            | ConnectionStatus::Error
                    )
                }) => {
                    return match changed {
                        Ok(status) if *status == ConnectionStatus::Connected => Ok(()),
                        _ => Err(WebchatError::new(
                            webchat_core::ErrorCategory::Transport,
                            "connect_failed",
                            "transport closed before the handshake completed",
                        )),
                    };
                }
                event = events.recv() => {
                    if let Ok(EngineEvent::Error(error)) = event
                        && error.code == "server_error"
                        && ConnectionStateMachine::error_resets_registration(&error.message)
                    {
                        return Err(error);
                    }
                }
            }
        }
    }

    /// Send one frame.
    ///
    /// While a connect is in flight the send waits for the handshake; on a
    /// closed or absent socket it fails with `transport_closed`.
    pub async fn send(&self, frame: &OutboundFrame) -> Result<(), WebchatError> {
        let text = frame.encode()?;

        match self.status() {
            ConnectionStatus::Connected => {}
            ConnectionStatus::Connecting | ConnectionStatus::Reconnecting => {
                let mut status_rx = self.watch_status();
                let status = status_rx
                    .wait_for(|status| {
                        matches!(
                            status,
                            ConnectionStatus::Connected
                                | ConnectionStatus::Disconnected
                                | ConnectionStatus::Error
                        )
                    })
                    .await
                    .map_err(|_| WebchatError::transport_closed())?;
                if *status != ConnectionStatus::Connected {
                    return Err(WebchatError::transport_closed());
                }
            }
            ConnectionStatus::Disconnected | ConnectionStatus::Error => {
                return Err(WebchatError::transport_closed());
            }
        }

        let tx = self
            .inner
            .command_tx
            .lock()
            .expect("command lock poisoned")
            .clone()
            .ok_or_else(WebchatError::transport_closed)?;

        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(SendCommand { text, ack: ack_tx })
            .map_err(|_| WebchatError::transport_closed())?;
        ack_rx.await.map_err(|_| WebchatError::transport_closed())?
    }

    /// Tear the connection down. When `permanent`, auto-reconnect is forced
    /// off for this instance.
    pub fn disconnect(&self, permanent: bool) {
        {
            let mut fsm = self.inner.fsm.lock().expect("fsm lock poisoned");
            fsm.on_disconnect(permanent);
        }
        if let Some(cancel) = self
            .inner
            .cancel
            .lock()
            .expect("cancel lock poisoned")
            .take()
        {
            cancel.cancel();
        }
        self.inner
            .command_tx
            .lock()
            .expect("command lock poisoned")
            .take();
        self.inner.publish_status(ConnectionStatus::Disconnected);
    }
}

async fn run_supervisor<T: Transport>(
    inner: Arc<EngineInner<T>>,
    registration: RegistrationData,
    cancel: CancellationToken,
) {
    let mut retry = RetryPolicy::new(inner.reconnect_interval, MAX_RECONNECT_DELAY);

    loop {
        if cancel.is_cancelled() {
            return;
        }

        match inner.transport.connect(&inner.socket_url).await {
            Ok(mut conn) => {
                debug!(url = %inner.socket_url, "transport open");

                let register = {
                    let mut fsm = inner.fsm.lock().expect("fsm lock poisoned");
                    fsm.claim_registration()
                };
                if register {
                    match registration.frame().encode() {
                        Ok(text) => {
                            if let Err(err) = conn.send(text).await {
                                inner.emit_error(WebchatError::new(
                                    webchat_core::ErrorCategory::Transport,
                                    "registration_send_failed",
                                    err.to_string(),
                                ));
                            }
                        }
                        Err(err) => inner.emit_error(err),
                    }
                }

                let (command_tx, command_rx) = mpsc::unbounded_channel();
                {
                    let mut slot = inner.command_tx.lock().expect("command lock poisoned");
                    *slot = Some(command_tx);
                }

                let exit = session_loop(&inner, &mut conn, command_rx, &cancel, &mut retry).await;
                inner
                    .command_tx
                    .lock()
                    .expect("command lock poisoned")
                    .take();
                conn.close().await;

                if matches!(exit, SessionExit::Cancelled) {
                    return;
                }
            }
            Err(err) => {
                warn!(error = %err, "transport connect failed");
                inner.emit_error(WebchatError::new(
                    webchat_core::ErrorCategory::Transport,
                    "connect_failed",
                    err.to_string(),
                ));
            }
        }

        let outcome = {
            let mut fsm = inner.fsm.lock().expect("fsm lock poisoned");
            fsm.on_transport_closed()
        };
        match outcome {
            CloseOutcome::Reconnect { attempt } => {
                let delay = retry.next();
                inner.publish_status(ConnectionStatus::Reconnecting);
                let _ = inner.events.send(EngineEvent::Reconnecting {
                    attempt: attempt + 1,
                    delay,
                });
                debug!(attempt = attempt + 1, ?delay, "reconnect scheduled");

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return,
                }

                {
                    let mut fsm = inner.fsm.lock().expect("fsm lock poisoned");
                    fsm.on_reconnect_delay_elapsed();
                }
                inner.publish_status(ConnectionStatus::Connecting);
            }
            CloseOutcome::Disconnected => {
                inner.publish_status(ConnectionStatus::Disconnected);
                return;
            }
        }
    }
}

async fn session_loop<T: Transport>(
    inner: &Arc<EngineInner<T>>,
    conn: &mut T::Conn,
    mut command_rx: mpsc::UnboundedReceiver<SendCommand>,
    cancel: &CancellationToken,
    retry: &mut RetryPolicy,
) -> SessionExit {
    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + inner.ping_interval,
        inner.ping_interval,
    );
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return SessionExit::Cancelled,

            _ = ping.tick() => {
                if *inner.status_tx.borrow() != ConnectionStatus::Connected {
                    continue;
                }
                let text = match OutboundFrame::Ping.encode() {
                    Ok(text) => text,
                    Err(err) => {
                        inner.emit_error(err);
                        continue;
                    }
                };
                if let Err(err) = conn.send(text).await {
                    warn!(error = %err, "keep-alive send failed");
                    return SessionExit::Closed;
                }
                trace!("keep-alive ping sent");
            }

            command = command_rx.recv() => {
                let Some(SendCommand { text, ack }) = command else {
                    return SessionExit::Closed;
                };
                let result = conn.send(text).await;
                let failed = result.is_err();
                let _ = ack.send(result.map_err(|err| {
                    WebchatError::new(
                        webchat_core::ErrorCategory::Transport,
                        "send_failed",
                        err.to_string(),
                    )
                }));
                if failed {
                    return SessionExit::Closed;
                }
            }

            frame = conn.recv() => {
                match frame {
                    None => {
                        debug!("transport closed by peer");
                        return SessionExit::Closed;
                    }
                    Some(Err(err)) => {
                        inner.emit_error(WebchatError::new(
                            webchat_core::ErrorCategory::Transport,
                            "recv_failed",
                            err.to_string(),
                        ));
                        return SessionExit::Closed;
                    }
                    Some(Ok(text)) => handle_inbound(inner, &text, retry),
                }
            }
        }
    }
}

fn handle_inbound<T: Transport>(inner: &Arc<EngineInner<T>>, text: &str, retry: &mut RetryPolicy) {
    match parse_frame(text) {
        // Parse failures are reported, never fatal.
        Err(err) => inner.emit_error(err),

        Ok(InboundFrame::Pong) => trace!("pong swallowed"),

        Ok(InboundFrame::ReadyForMessage) => {
            let transitioned = {
                let mut fsm = inner.fsm.lock().expect("fsm lock poisoned");
                fsm.on_handshake_complete()
            };
            if transitioned {
                retry.reset();
                inner.publish_status(ConnectionStatus::Connected);
                debug!("handshake complete");
            }
        }

        Ok(InboundFrame::ServerError { text }) => {
            let message = text.unwrap_or_else(|| "unspecified server error".to_owned());
            if ConnectionStateMachine::error_resets_registration(&message) {
                let mut fsm = inner.fsm.lock().expect("fsm lock poisoned");
                fsm.reset_registration();
                debug!("registration invalidated by server error");
            }
            inner.emit_error(WebchatError::server_error(message));
        }

        Ok(frame) => {
            let _ = inner.events.send(EngineEvent::Frame(frame));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, sync::Mutex as StdMutex};

    use serde_json::{Value, json};
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

    use super::*;

    struct ServerEnd {
        inbound_tx: UnboundedSender<String>,
        sent_rx: UnboundedReceiver<String>,
    }

    enum ConnectScript {
        Accept,
        Refuse,
    }

    #[derive(Default)]
    struct MockState {
        scripts: VecDeque<ConnectScript>,
        server_ends: VecDeque<ServerEnd>,
    }

    #[derive(Clone, Default)]
    struct MockTransport {
        state: Arc<StdMutex<MockState>>,
    }

    impl MockTransport {
        fn script(&self, script: ConnectScript) {
            self.state.lock().expect("mock lock").scripts.push_back(script);
        }

        fn take_server_end(&self) -> ServerEnd {
            self.state
                .lock()
                .expect("mock lock")
                .server_ends
                .pop_front()
                .expect("a connection should have been accepted")
        }
    }

    struct MockConnection {
        inbound_rx: UnboundedReceiver<String>,
        sent_tx: UnboundedSender<String>,
    }

    impl Connection for MockConnection {
        async fn send(&mut self, text: String) -> Result<(), crate::transport::TransportError> {
            self.sent_tx
                .send(text)
                .map_err(|_| crate::transport::TransportError::Closed)
        }

        async fn recv(&mut self) -> Option<Result<String, crate::transport::TransportError>> {
            self.inbound_rx.recv().await.map(Ok)
        }

        async fn close(&mut self) {}
    }

    impl Transport for MockTransport {
        type Conn = MockConnection;

        async fn connect(
            &self,
            _url: &str,
        ) -> Result<MockConnection, crate::transport::TransportError> {
            let mut state = self.state.lock().expect("mock lock");
            match state.scripts.pop_front() {
                Some(ConnectScript::Accept) => {
                    let (inbound_tx, inbound_rx) = unbounded_channel();
                    let (sent_tx, sent_rx) = unbounded_channel();
                    state.server_ends.push_back(ServerEnd {
                        inbound_tx,
                        sent_rx,
                    });
                    Ok(MockConnection {
                        inbound_rx,
                        sent_tx,
                    })
                }
                Some(ConnectScript::Refuse) | None => Err(
                    crate::transport::TransportError::Connect("refused".to_owned()),
                ),
            }
        }
    }

    fn test_config() -> WebchatConfig {
        let mut config = WebchatConfig::new("wss://socket.example.org/ws", "chan-uuid");
        config.host = "https://example.org".to_owned();
        config.reconnect_interval = Duration::from_millis(1_000);
        config.max_reconnect_attempts = 3;
        config
    }

    fn registration() -> RegistrationData {
        RegistrationData {
            from: "123@example.org".to_owned(),
            callback: "https://example.org/c/wwc/chan-uuid/receive".to_owned(),
            session_type: SessionType::Local,
            token: None,
        }
    }

    async fn connected_engine(
        transport: &MockTransport,
    ) -> (ConnectionEngine<MockTransport>, ServerEnd) {
        transport.script(ConnectScript::Accept);
        let engine = ConnectionEngine::new(&test_config(), transport.clone());

        let connect = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.connect(registration()).await })
        };

        // Let the supervisor reach the session loop, then complete the
        // handshake.
        tokio::task::yield_now().await;
        let server = transport.take_server_end();
        server
            .inbound_tx
            .send(json!({"type": "ready_for_message"}).to_string())
            .expect("inject handshake");

        connect
            .await
            .expect("connect task should finish")
            .expect("connect should resolve");
        assert_eq!(engine.status(), ConnectionStatus::Connected);
        (engine, server)
    }

    #[tokio::test(start_paused = true)]
    async fn connect_registers_and_resolves_on_ready_for_message() {
        let transport = MockTransport::default();
        let (_engine, mut server) = connected_engine(&transport).await;

        let register_raw = server.sent_rx.recv().await.expect("register frame sent");
        let register: Value = serde_json::from_str(&register_raw).expect("register is json");
        assert_eq!(register["type"], "register");
        assert_eq!(register["from"], "123@example.org");
        assert_eq!(
            register["callback"],
            "https://example.org/c/wwc/chan-uuid/receive"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sends_keep_alive_pings_while_connected() {
        let transport = MockTransport::default();
        let (_engine, mut server) = connected_engine(&transport).await;
        let _register = server.sent_rx.recv().await.expect("register frame sent");

        tokio::time::advance(Duration::from_secs(51)).await;
        tokio::task::yield_now().await;

        let ping_raw = server.sent_rx.recv().await.expect("ping frame sent");
        let ping: Value = serde_json::from_str(&ping_raw).expect("ping is json");
        assert_eq!(ping["type"], "ping");
    }

    #[tokio::test(start_paused = true)]
    async fn send_delivers_message_frames_while_connected() {
        let transport = MockTransport::default();
        let (engine, mut server) = connected_engine(&transport).await;
        let _register = server.sent_rx.recv().await.expect("register frame sent");

        engine
            .send(&OutboundFrame::SetCustomField {
                data: webchat_core::CustomField {
                    key: "plan".to_owned(),
                    value: "pro".to_owned(),
                },
            })
            .await
            .expect("send should work");

        let raw = server.sent_rx.recv().await.expect("frame sent");
        let frame: Value = serde_json::from_str(&raw).expect("frame is json");
        assert_eq!(frame["type"], "set_custom_field");
        assert_eq!(frame["data"]["key"], "plan");
    }

    #[tokio::test(start_paused = true)]
    async fn send_fails_with_transport_closed_when_disconnected() {
        let transport = MockTransport::default();
        let engine = ConnectionEngine::new(&test_config(), transport);

        let err = engine
            .send(&OutboundFrame::Ping)
            .await
            .expect_err("send while disconnected must fail");
        assert_eq!(err.code, "transport_closed");
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_message_frames_and_swallows_pong() {
        let transport = MockTransport::default();
        let (engine, server) = connected_engine(&transport).await;
        let mut events = engine.subscribe();

        server
            .inbound_tx
            .send(json!({"type": "pong"}).to_string())
            .expect("inject pong");
        server
            .inbound_tx
            .send(json!({"type": "message", "message": {"type": "text", "text": "hi"}}).to_string())
            .expect("inject message");

        let event = loop {
            match events.recv().await.expect("event stream open") {
                EngineEvent::Frame(frame) => break frame,
                _ => continue,
            }
        };
        match event {
            InboundFrame::Message { message, .. } => {
                assert_eq!(message.text.as_deref(), Some("hi"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn parse_failures_are_reported_not_fatal() {
        let transport = MockTransport::default();
        let (engine, server) = connected_engine(&transport).await;
        let mut events = engine.subscribe();

        server
            .inbound_tx
            .send("{ not json".to_owned())
            .expect("inject garbage");

        let error = loop {
            match events.recv().await.expect("event stream open") {
                EngineEvent::Error(error) => break error,
                _ => continue,
            }
        };
        assert_eq!(error.code, "parse_failure");
        assert_eq!(engine.status(), ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_with_exponential_backoff_schedule() {
        let transport = MockTransport::default();
        let (engine, server) = connected_engine(&transport).await;
        let mut events = engine.subscribe();

        // Every reconnect attempt is refused, exhausting the 3-attempt cap.
        transport.script(ConnectScript::Refuse);
        transport.script(ConnectScript::Refuse);
        transport.script(ConnectScript::Refuse);

        // Server drops the connection.
        drop(server.inbound_tx);

        let mut schedule = Vec::new();
        loop {
            match events.recv().await.expect("event stream open") {
                EngineEvent::Reconnecting { attempt, delay } => {
                    schedule.push((attempt, delay.as_millis() as u64));
                }
                EngineEvent::StatusChanged {
                    current: ConnectionStatus::Disconnected,
                    ..
                } => break,
                _ => {}
            }
        }

        assert_eq!(schedule, vec![(1, 1_000), (2, 2_000), (3, 4_000)]);
        assert_eq!(engine.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_resets_the_backoff_schedule() {
        let transport = MockTransport::default();
        let (engine, server) = connected_engine(&transport).await;
        let mut events = engine.subscribe();

        // One failed attempt, then a successful reconnect with handshake.
        transport.script(ConnectScript::Refuse);
        transport.script(ConnectScript::Accept);
        drop(server.inbound_tx);

        // First reconnect (delay 1000) fails; second (delay 2000) connects.
        let mut delays = Vec::new();
        loop {
            match events.recv().await.expect("event stream open") {
                EngineEvent::Reconnecting { delay, .. } => {
                    delays.push(delay.as_millis() as u64);
                    if delays.len() == 2 {
                        break;
                    }
                }
                _ => {}
            }
        }
        assert_eq!(delays, vec![1_000, 2_000]);

        // The supervisor is still sleeping out the second delay.
        tokio::time::advance(Duration::from_millis(2_100)).await;
        tokio::task::yield_now().await;
        let second_server = transport.take_server_end();
        second_server
            .inbound_tx
            .send(json!({"type": "ready_for_message"}).to_string())
            .expect("inject handshake");

        let mut status_rx = engine.watch_status();
        status_rx
            .wait_for(|status| *status == ConnectionStatus::Connected)
            .await
            .expect("engine should reconnect");

        // After the reset, the next failure cycle starts back at 1000 ms.
        transport.script(ConnectScript::Refuse);
        drop(second_server.inbound_tx);
        let delay = loop {
            match events.recv().await.expect("event stream open") {
                EngineEvent::Reconnecting { delay, attempt } => break (attempt, delay),
                _ => {}
            }
        };
        assert_eq!(delay.0, 1);
        assert_eq!(delay.1, Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_disconnect_stops_reconnection() {
        let transport = MockTransport::default();
        let (engine, _server) = connected_engine(&transport).await;

        engine.disconnect(true);
        assert_eq!(engine.status(), ConnectionStatus::Disconnected);

        let err = engine
            .send(&OutboundFrame::Ping)
            .await
            .expect_err("send after permanent disconnect must fail");
        assert_eq!(err.code, "transport_closed");
    }

    #[tokio::test(start_paused = true)]
    async fn server_error_resets_registration_for_the_next_socket() {
        let transport = MockTransport::default();
        let (engine, server) = connected_engine(&transport).await;
        let mut events = engine.subscribe();

        server
            .inbound_tx
            .send(json!({"type": "error", "error": "session already exists"}).to_string())
            .expect("inject server error");

        let error = loop {
            match events.recv().await.expect("event stream open") {
                EngineEvent::Error(error) => break error,
                _ => {}
            }
        };
        assert_eq!(error.code, "server_error");

        // The next accepted socket re-sends the register frame.
        transport.script(ConnectScript::Accept);
        drop(server.inbound_tx);

        loop {
            if let EngineEvent::Reconnecting { .. } =
                events.recv().await.expect("event stream open")
            {
                break;
            }
        }
        tokio::time::advance(Duration::from_millis(1_100)).await;
        tokio::task::yield_now().await;

        let mut second_server = transport.take_server_end();
        let register_raw = second_server
            .sent_rx
            .recv()
            .await
            .expect("register frame resent");
        let register: Value = serde_json::from_str(&register_raw).expect("register is json");
        assert_eq!(register["type"], "register");
    }
}
