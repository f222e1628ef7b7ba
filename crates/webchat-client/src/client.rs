use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use webchat_core::{
    AggregateState, ConnectOn, ConnectionStatus, CustomField, Direction, EventBus, HistoryParams,
    InboundFrame, Message, MessageContent, MessagePatch, MessageStatus, OutboundFrame,
    OutgoingPayload, StateSnapshot, StorageKind, WebchatConfig, WebchatError, WebchatEvent, now_ms,
};
use webchat_platform::{FileBackend, MemoryBackend, VersionedStore};
use webchat_socket::{ConnectionEngine, EngineEvent, RegistrationData, Transport, WsTransport};

use crate::{
    processor::{IndicatorKind, Processor, ProcessorOutput},
    session::SessionEngine,
};

/// Implicit timeout on pending history requests.
const HISTORY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default on-disk location for `StorageKind::Local` sessions.
const DEFAULT_LOCAL_STORE_PATH: &str = "./.webchat-store/store.json";

struct ClientInner<T: Transport> {
    config: WebchatConfig,
    bus: EventBus,
    state: Mutex<AggregateState>,
    session: SessionEngine,
    engine: ConnectionEngine<T>,
    processor: Mutex<Processor>,
    history_pending: Mutex<Option<oneshot::Sender<Value>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// The webchat client: wires the connection engine, session engine, and
/// message processor into one observable state view.
///
/// All consumer interaction happens through this type's methods and the
/// event bus exposed by [`WebchatClient::subscribe`].
pub struct WebchatClient<T: Transport = WsTransport> {
    inner: Arc<ClientInner<T>>,
}

impl<T: Transport> Clone for WebchatClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl WebchatClient<WsTransport> {
    /// Build a client over the production WebSocket transport.
    pub fn new(config: WebchatConfig) -> Result<Self, WebchatError> {
        let store = store_for(&config);
        Self::with_parts(config, WsTransport, store)
    }
}

impl<T: Transport> WebchatClient<T> {
    pub fn with_transport(config: WebchatConfig, transport: T) -> Result<Self, WebchatError> {
        let store = store_for(&config);
        Self::with_parts(config, transport, store)
    }

    /// Build a client over a caller-provided transport and store. Must be
    /// called from within a tokio runtime.
    pub fn with_parts(
        config: WebchatConfig,
        transport: T,
        store: VersionedStore,
    ) -> Result<Self, WebchatError> {
        config.validate()?;

        let bus = EventBus::default();
        let session = SessionEngine::new(store, bus.clone(), &config);
        if let Some(id) = config.session_id.clone() {
            session.set_session_id(&id)?;
        } else {
            session.get_or_create();
        }

        // Seed the view from the restored conversation before anything can
        // subscribe; these initial mutations are not eventful.
        let mut aggregate = AggregateState::new();
        for message in session.conversation() {
            let _ = aggregate.add_message(message);
        }
        let _ = aggregate.set_session(session.session_info());

        let engine = ConnectionEngine::new(&config, transport);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let processor = Processor::new(&config, out_tx);

        let inner = Arc::new(ClientInner {
            config,
            bus,
            state: Mutex::new(aggregate),
            session,
            engine,
            processor: Mutex::new(processor),
            history_pending: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });

        let engine_events = inner.engine.subscribe();
        let bus_events = inner.bus.subscribe();
        let handles = vec![
            tokio::spawn(engine_loop(Arc::clone(&inner), engine_events)),
            tokio::spawn(output_loop(Arc::clone(&inner), out_rx)),
            tokio::spawn(bus_loop(Arc::clone(&inner), bus_events)),
        ];
        inner.tasks.lock().expect("task lock poisoned").extend(handles);

        inner.bus.emit(WebchatEvent::Initialized);

        let client = Self { inner };
        if client.inner.config.connect_on == ConnectOn::Mount {
            let auto = client.clone();
            tokio::spawn(async move {
                if let Err(error) = auto.connect().await {
                    warn!(error = %error, "auto-connect failed");
                }
            });
        }
        Ok(client)
    }

    /// Subscribe to the consumer event surface.
    pub fn subscribe(&self) -> broadcast::Receiver<WebchatEvent> {
        self.inner.bus.subscribe()
    }

    /// Current snapshot of the aggregated view.
    pub fn state(&self) -> StateSnapshot {
        self.inner.state.lock().expect("state lock poisoned").snapshot()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.inner.engine.status()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.session.session_id()
    }

    pub fn context(&self) -> String {
        self.inner
            .state
            .lock()
            .expect("state lock poisoned")
            .context()
            .to_owned()
    }

    pub fn set_context(&self, context: impl Into<String>) {
        let context = context.into();
        apply_state(&self.inner, move |state| state.set_context(context));
    }

    /// Open the transport and complete the registration handshake.
    pub async fn connect(&self) -> Result<(), WebchatError> {
        let from = self.inner.session.get_or_create();
        let registration = RegistrationData {
            from,
            callback: self.inner.config.callback_url(),
            session_type: self.inner.config.storage.session_type(),
            token: self.inner.config.session_token.clone(),
        };

        let result = self.inner.engine.connect(registration).await;
        if let Err(error) = &result {
            let error = error.clone();
            apply_state(&self.inner, move |state| state.set_error(error));
        }
        result
    }

    /// Tear the connection down. `permanent` forces auto-reconnect off.
    pub fn disconnect(&self, permanent: bool) {
        self.inner.engine.disconnect(permanent);
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<Message, WebchatError> {
        self.send_message(MessageContent::text(text)).await
    }

    /// Send one message; resolves with the message at status `sent`.
    pub async fn send_message(&self, content: MessageContent) -> Result<Message, WebchatError> {
        self.send_with(content, None).await
    }

    /// Send a message together with a custom-fields map.
    pub async fn send_message_with_fields(
        &self,
        content: MessageContent,
        fields: BTreeMap<String, String>,
    ) -> Result<Message, WebchatError> {
        self.send_with(content, Some(fields)).await
    }

    pub async fn set_custom_field(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), WebchatError> {
        self.inner
            .engine
            .send(&OutboundFrame::SetCustomField {
                data: CustomField {
                    key: key.into(),
                    value: value.into(),
                },
            })
            .await
    }

    /// Request conversation history from the server.
    ///
    /// Carries an implicit 30 s timeout; a second request while one is
    /// pending fails with `history_in_progress`.
    pub async fn load_history(&self, params: HistoryParams) -> Result<Value, WebchatError> {
        let rx = {
            let mut pending = self
                .inner
                .history_pending
                .lock()
                .expect("history lock poisoned");
            if pending.is_some() {
                return Err(WebchatError::history_in_progress());
            }
            let (tx, rx) = oneshot::channel();
            *pending = Some(tx);
            rx
        };

        if let Err(error) = self
            .inner
            .engine
            .send(&OutboundFrame::GetHistory { params })
            .await
        {
            self.inner
                .history_pending
                .lock()
                .expect("history lock poisoned")
                .take();
            return Err(error);
        }

        match tokio::time::timeout(HISTORY_TIMEOUT, rx).await {
            Ok(Ok(history)) => Ok(history),
            Ok(Err(_)) => Err(WebchatError::transport_closed()),
            Err(_) => {
                self.inner
                    .history_pending
                    .lock()
                    .expect("history lock poisoned")
                    .take();
                Err(WebchatError::history_timeout())
            }
        }
    }

    /// Remove one message from the view and the persisted conversation.
    pub fn remove_message(&self, id: &str) {
        let mut conversation = self.inner.session.conversation();
        conversation.retain(|message| message.id != id);
        self.inner.session.set_conversation(conversation);

        let id = id.to_owned();
        apply_state(&self.inner, move |state| state.remove_message(&id));
    }

    /// Drop the conversation view (the session itself is preserved).
    pub fn clear_messages(&self) {
        self.inner.session.set_conversation(Vec::new());
        apply_state(&self.inner, |state| state.clear_messages());
    }

    /// Drop the session, its persisted entry, and the conversation view.
    pub fn clear_session(&self) {
        self.inner.session.clear();
        apply_state(&self.inner, |state| {
            let mut events = state.clear_messages();
            events.extend(state.set_session(None));
            events
        });
    }

    /// Adopt a caller-provided session id, resetting the conversation.
    pub fn set_session_id(&self, id: &str) -> Result<(), WebchatError> {
        self.inner.session.set_session_id(id)?;
        let info = self.inner.session.session_info();
        apply_state(&self.inner, move |state| {
            let mut events = state.clear_messages();
            events.extend(state.set_session(info));
            events
        });
        Ok(())
    }

    /// Cancel every timer, drop all workers, and make the instance inert.
    pub fn destroy(&self) {
        self.inner.engine.disconnect(true);
        self.inner.session.destroy();
        self.inner
            .processor
            .lock()
            .expect("processor lock poisoned")
            .stop_indicators();
        self.inner
            .history_pending
            .lock()
            .expect("history lock poisoned")
            .take();
        for task in self
            .inner
            .tasks
            .lock()
            .expect("task lock poisoned")
            .drain(..)
        {
            task.abort();
        }
        self.inner.bus.emit(WebchatEvent::Destroyed);
    }

    async fn send_with(
        &self,
        content: MessageContent,
        fields: Option<BTreeMap<String, String>>,
    ) -> Result<Message, WebchatError> {
        if self.inner.config.connect_on == ConnectOn::Demand
            && self.inner.engine.status() == ConnectionStatus::Disconnected
        {
            self.connect().await?;
        }

        let payload = outgoing_payload(&content)?;
        let from = self.inner.session.get_or_create();
        let context = self.context();

        let mut message = Message::new(
            uuid::Uuid::new_v4().to_string(),
            content,
            Direction::Outgoing,
            MessageStatus::Pending,
        );
        {
            let pending = message.clone();
            apply_state(&self.inner, move |state| state.add_message(pending));
        }
        self.inner
            .session
            .append_to_conversation(message.clone(), None);

        let frame = match fields {
            None => OutboundFrame::Message {
                message: payload,
                from,
                context,
            },
            Some(data) => OutboundFrame::MessageWithFields {
                message: payload,
                from,
                context,
                data,
            },
        };

        match self.inner.engine.send(&frame).await {
            Ok(()) => {
                self.patch_message(&message.id, MessagePatch::status(MessageStatus::Sent));
                message.status = MessageStatus::Sent;
                self.inner.session.set_last_message_sent_at(now_ms());
                self.inner
                    .processor
                    .lock()
                    .expect("processor lock poisoned")
                    .notify_message_sent();
                self.inner.bus.emit(WebchatEvent::MessageSent {
                    message: message.clone(),
                });
                debug!(id = %message.id, "message sent");
                Ok(message)
            }
            Err(error) => {
                self.patch_message(&message.id, MessagePatch::status(MessageStatus::Error));
                let last_error = error.clone();
                apply_state(&self.inner, move |state| state.set_error(last_error));
                Err(error)
            }
        }
    }

    fn patch_message(&self, id: &str, patch: MessagePatch) {
        self.inner.session.update_conversation(id, &patch);
        let id = id.to_owned();
        apply_state(&self.inner, move |state| state.update_message(&id, &patch));
    }
}

fn store_for(config: &WebchatConfig) -> VersionedStore {
    match config.storage {
        StorageKind::Local => {
            VersionedStore::new(Box::new(FileBackend::open(DEFAULT_LOCAL_STORE_PATH)))
        }
        StorageKind::Session => VersionedStore::new(Box::new(MemoryBackend::new())),
    }
}

fn outgoing_payload(content: &MessageContent) -> Result<OutgoingPayload, WebchatError> {
    match content {
        MessageContent::Text { text, .. } => Ok(OutgoingPayload::Text { text: text.clone() }),
        MessageContent::Image { media, .. } => Ok(OutgoingPayload::Image {
            media: media.clone(),
        }),
        MessageContent::Video { media, .. } => Ok(OutgoingPayload::Video {
            media: media.clone(),
        }),
        MessageContent::Audio { media } => Ok(OutgoingPayload::Audio {
            media: media.clone(),
        }),
        MessageContent::File { media, .. } => Ok(OutgoingPayload::File {
            media: media.clone(),
        }),
        MessageContent::Location {
            latitude,
            longitude,
        } => Ok(OutgoingPayload::Location {
            latitude: *latitude,
            longitude: *longitude,
        }),
        MessageContent::Order { order } => Ok(OutgoingPayload::Order {
            timestamp: now_ms(),
            order: order.clone(),
        }),
        MessageContent::Interactive { .. } => Err(WebchatError::unsupported_outbound("interactive")),
        MessageContent::SetCustomField { .. } => {
            Err(WebchatError::unsupported_outbound("set_custom_field"))
        }
    }
}

fn apply_state<T: Transport>(
    inner: &Arc<ClientInner<T>>,
    mutate: impl FnOnce(&mut AggregateState) -> Vec<WebchatEvent>,
) {
    let events = {
        let mut state = inner.state.lock().expect("state lock poisoned");
        mutate(&mut state)
    };
    inner.bus.emit_all(events);
}

async fn engine_loop<T: Transport>(
    inner: Arc<ClientInner<T>>,
    mut events: broadcast::Receiver<EngineEvent>,
) {
    loop {
        match events.recv().await {
            Ok(event) => handle_engine_event(&inner, event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "engine event stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn handle_engine_event<T: Transport>(inner: &Arc<ClientInner<T>>, event: EngineEvent) {
    match event {
        EngineEvent::StatusChanged { current, .. } => {
            apply_state(inner, move |state| state.set_connection_status(current));
            match current {
                ConnectionStatus::Connected => {
                    inner.bus.emit(WebchatEvent::Connected);
                }
                ConnectionStatus::Disconnected => {
                    inner.bus.emit(WebchatEvent::Disconnected);
                }
                _ => {}
            }
        }
        EngineEvent::Reconnecting { attempt, delay } => {
            inner.bus.emit(WebchatEvent::Reconnecting {
                attempt,
                delay_ms: delay.as_millis() as u64,
            });
        }
        EngineEvent::Frame(frame) => match frame {
            InboundFrame::History { history } => {
                if let Some(tx) = inner
                    .history_pending
                    .lock()
                    .expect("history lock poisoned")
                    .take()
                {
                    let _ = tx.send(history.clone());
                }
                inner.bus.emit(WebchatEvent::HistoryLoaded { history });
            }
            other => inner
                .processor
                .lock()
                .expect("processor lock poisoned")
                .handle_frame(other),
        },
        EngineEvent::Error(error) => {
            apply_state(inner, move |state| state.set_error(error));
        }
    }
}

async fn output_loop<T: Transport>(
    inner: Arc<ClientInner<T>>,
    mut out_rx: mpsc::UnboundedReceiver<ProcessorOutput>,
) {
    while let Some(output) = out_rx.recv().await {
        match output {
            ProcessorOutput::NewMessage(message) => {
                {
                    let added = message.clone();
                    apply_state(&inner, move |state| state.add_message(added));
                }
                inner.session.append_to_conversation(message.clone(), None);
                inner.bus.emit(WebchatEvent::MessageReceived {
                    message: message.clone(),
                });
                inner.bus.emit(WebchatEvent::MessageProcessed { message });
            }
            ProcessorOutput::UpdateMessage { id, patch } => {
                inner.session.update_conversation(&id, &patch);
                apply_state(&inner, move |state| state.update_message(&id, &patch));
            }
            ProcessorOutput::IndicatorStart(kind) => {
                apply_state(&inner, move |state| match kind {
                    IndicatorKind::Typing => state.set_typing(true),
                    IndicatorKind::Thinking => state.set_thinking(true),
                });
            }
            ProcessorOutput::IndicatorStop(kind) => {
                apply_state(&inner, move |state| match kind {
                    IndicatorKind::Typing => state.set_typing(false),
                    IndicatorKind::Thinking => state.set_thinking(false),
                });
            }
            ProcessorOutput::UnknownFrame(raw) => {
                inner.bus.emit(WebchatEvent::MessageUnknown { raw });
            }
            ProcessorOutput::Error(error) => {
                apply_state(&inner, move |state| state.set_error(error));
            }
        }
    }
}

/// Mirror session lifecycle signals emitted by the session engine's timers
/// into the aggregated view.
async fn bus_loop<T: Transport>(
    inner: Arc<ClientInner<T>>,
    mut events: broadcast::Receiver<WebchatEvent>,
) {
    loop {
        match events.recv().await {
            Ok(WebchatEvent::SessionCleared) => {
                apply_state(&inner, |state| {
                    let mut events = state.clear_messages();
                    events.extend(state.set_session(None));
                    events
                });
            }
            Ok(WebchatEvent::SessionRestored { session })
            | Ok(WebchatEvent::SessionChanged { session }) => {
                apply_state(&inner, move |state| state.set_session(Some(session)));
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "bus stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::Mutex as StdMutex,
    };

    use serde_json::json;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
    use webchat_platform::MemoryBackend;
    use webchat_socket::{Connection, TransportError};

    use super::*;

    struct ServerEnd {
        inbound_tx: UnboundedSender<String>,
        sent_rx: UnboundedReceiver<String>,
    }

    #[derive(Default)]
    struct MockState {
        accepts: usize,
        server_ends: VecDeque<ServerEnd>,
    }

    #[derive(Clone, Default)]
    struct MockTransport {
        state: Arc<StdMutex<MockState>>,
    }

    impl MockTransport {
        fn allow_connects(&self, count: usize) {
            self.state.lock().expect("mock lock").accepts += count;
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
        async fn send(&mut self, text: String) -> Result<(), TransportError> {
            self.sent_tx.send(text).map_err(|_| TransportError::Closed)
        }

        async fn recv(&mut self) -> Option<Result<String, TransportError>> {
            self.inbound_rx.recv().await.map(Ok)
        }

        async fn close(&mut self) {}
    }

    impl Transport for MockTransport {
        type Conn = MockConnection;

        async fn connect(&self, _url: &str) -> Result<MockConnection, TransportError> {
            let mut state = self.state.lock().expect("mock lock");
            if state.accepts == 0 {
                return Err(TransportError::Connect("refused".to_owned()));
            }
            state.accepts -= 1;
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
    }

    fn test_config() -> WebchatConfig {
        let mut config = WebchatConfig::new("wss://socket.example.org/ws", "chan-uuid");
        config.host = "https://example.org".to_owned();
        config.connect_on = ConnectOn::Manual;
        config
    }

    async fn connected_client(config: WebchatConfig) -> (WebchatClient<MockTransport>, ServerEnd) {
        let transport = MockTransport::default();
        transport.allow_connects(1);
        let store = VersionedStore::new(Box::new(MemoryBackend::new()));
        let client = WebchatClient::with_parts(config, transport.clone(), store)
            .expect("client should build");

        let connect = {
            let client = client.clone();
            tokio::spawn(async move { client.connect().await })
        };
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
        (client, server)
    }

    async fn next_named(
        events: &mut broadcast::Receiver<WebchatEvent>,
        name: &str,
    ) -> WebchatEvent {
        loop {
            let event = events.recv().await.expect("bus open");
            if event.name() == name {
                return event;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn send_text_transitions_pending_to_sent() {
        let (client, mut server) = connected_client(test_config()).await;
        let mut events = client.subscribe();
        let _register = server.sent_rx.recv().await.expect("register frame");

        client.set_context("support");
        let message = client
            .send_text("hello there")
            .await
            .expect("send should work");
        assert_eq!(message.status, MessageStatus::Sent);

        let raw = server.sent_rx.recv().await.expect("message frame");
        let frame: Value = serde_json::from_str(&raw).expect("frame is json");
        assert_eq!(frame["type"], "message");
        assert_eq!(frame["message"]["type"], "text");
        assert_eq!(frame["message"]["text"], "hello there");
        assert_eq!(frame["context"], "support");
        assert_eq!(
            frame["from"].as_str(),
            client.session_id().as_deref(),
            "outbound frames carry the session id"
        );

        let sent = next_named(&mut events, "message:sent").await;
        match sent {
            WebchatEvent::MessageSent { message: m } => assert_eq!(m.id, message.id),
            other => panic!("unexpected event: {other:?}"),
        }

        let view = client.state();
        assert_eq!(view.messages.len(), 1);
        assert_eq!(view.messages[0].status, MessageStatus::Sent);
        assert_eq!(view.messages[0].direction, Direction::Outgoing);

        // The send stamped the contact-timeout anchor.
        assert!(
            client
                .inner
                .session
                .session_info()
                .expect("session exists")
                .last_message_sent_at
                .is_some()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn send_fails_cleanly_when_transport_is_down() {
        let transport = MockTransport::default();
        let store = VersionedStore::new(Box::new(MemoryBackend::new()));
        let client = WebchatClient::with_parts(test_config(), transport, store)
            .expect("client should build");

        let err = client
            .send_text("lost")
            .await
            .expect_err("send without a connection must fail");
        assert_eq!(err.code, "transport_closed");

        let view = client.state();
        assert_eq!(view.messages.len(), 1);
        assert_eq!(view.messages[0].status, MessageStatus::Error);
        assert_eq!(view.last_error, Some(err));
    }

    #[tokio::test(start_paused = true)]
    async fn streamed_reply_flows_into_the_view() {
        let (client, server) = connected_client(test_config()).await;
        let mut events = client.subscribe();

        for frame in [
            json!({"type": "stream_start", "id": "A"}),
            json!({"v": "Hi", "seq": 1}),
            json!({"v": " ", "seq": 2}),
            json!({"v": "there", "seq": 3}),
            json!({"type": "stream_end", "id": "A"}),
        ] {
            server
                .inbound_tx
                .send(frame.to_string())
                .expect("inject frame");
        }

        let added = next_named(&mut events, "message:added").await;
        match added {
            WebchatEvent::MessageAdded { message } => {
                assert_eq!(message.id, "msg_A");
                assert_eq!(message.text(), Some(""));
                assert_eq!(message.status, MessageStatus::Streaming);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // Updates arrive in strictly ascending prefix order.
        let mut texts = Vec::new();
        loop {
            match next_named(&mut events, "message:updated").await {
                WebchatEvent::MessageUpdated { message } => {
                    texts.push(message.text().unwrap_or_default().to_owned());
                    if message.status == MessageStatus::Delivered {
                        break;
                    }
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(texts, ["Hi", "Hi ", "Hi there", "Hi there"]);

        let view = client.state();
        assert_eq!(view.messages.len(), 1);
        assert_eq!(view.messages[0].status, MessageStatus::Delivered);
        assert_eq!(view.messages[0].text(), Some("Hi there"));

        // The conversation snapshot was persisted along the way.
        let conversation = client.inner.session.conversation();
        assert_eq!(conversation.len(), 1);
        assert_eq!(conversation[0].text(), Some("Hi there"));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_history_requests_are_rejected() {
        let (client, mut server) = connected_client(test_config()).await;
        let _register = server.sent_rx.recv().await.expect("register frame");

        let first = {
            let client = client.clone();
            tokio::spawn(async move { client.load_history(HistoryParams::page(20, 1)).await })
        };
        tokio::task::yield_now().await;

        let err = client
            .load_history(HistoryParams::page(20, 2))
            .await
            .expect_err("second request must fail");
        assert_eq!(err.code, "history_in_progress");

        let raw = server.sent_rx.recv().await.expect("history frame");
        let frame: Value = serde_json::from_str(&raw).expect("frame is json");
        assert_eq!(frame["type"], "get_history");
        assert_eq!(frame["params"]["limit"], 20);

        server
            .inbound_tx
            .send(json!({"type": "history", "history": [{"text": "old"}]}).to_string())
            .expect("inject history");

        let history = first
            .await
            .expect("history task should finish")
            .expect("history should load");
        assert_eq!(history, json!([{"text": "old"}]));

        // The flag cleared; a new request is accepted again.
        let second = {
            let client = client.clone();
            tokio::spawn(async move { client.load_history(HistoryParams::page(20, 2)).await })
        };
        tokio::task::yield_now().await;
        server
            .inbound_tx
            .send(json!({"type": "history", "history": []}).to_string())
            .expect("inject history");
        second
            .await
            .expect("history task should finish")
            .expect("second request should load");
    }

    #[tokio::test(start_paused = true)]
    async fn typing_start_raises_the_view_flag() {
        let (client, server) = connected_client(test_config()).await;
        let mut events = client.subscribe();

        server
            .inbound_tx
            .send(json!({"type": "typing_start"}).to_string())
            .expect("inject typing");

        next_named(&mut events, "typing:start").await;
        assert!(client.state().is_typing);

        server
            .inbound_tx
            .send(json!({"type": "typing_start", "from": "ai-assistant"}).to_string())
            .expect("inject thinking");
        next_named(&mut events, "thinking:start").await;
        assert!(client.state().is_thinking);
    }

    #[tokio::test(start_paused = true)]
    async fn set_session_id_resets_the_conversation_view() {
        let (client, _server) = connected_client(test_config()).await;
        let mut events = client.subscribe();

        client
            .send_text("before reset")
            .await
            .expect("send should work");
        assert_eq!(client.state().messages.len(), 1);

        let err = client
            .set_session_id("not-valid")
            .expect_err("malformed id must fail");
        assert_eq!(err.code, "invalid_session_id");

        client
            .set_session_id("99@fixed.example.org")
            .expect("valid id should be adopted");
        next_named(&mut events, "session:changed").await;

        assert_eq!(client.session_id().as_deref(), Some("99@fixed.example.org"));
        assert!(client.state().messages.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_frames_emit_message_unknown() {
        let (client, server) = connected_client(test_config()).await;
        let mut events = client.subscribe();

        server
            .inbound_tx
            .send(json!({"type": "mystery"}).to_string())
            .expect("inject unknown");

        let event = next_named(&mut events, "message:unknown").await;
        match event {
            WebchatEvent::MessageUnknown { raw } => assert_eq!(raw["type"], "mystery"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_makes_the_client_inert() {
        let (client, _server) = connected_client(test_config()).await;
        let mut events = client.subscribe();

        client.destroy();
        next_named(&mut events, "destroyed").await;
        assert_eq!(client.connection_status(), ConnectionStatus::Disconnected);

        let err = client
            .send_text("after destroy")
            .await
            .expect_err("send after destroy must fail");
        assert_eq!(err.code, "transport_closed");
    }
}
