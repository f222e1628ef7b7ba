use std::{
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use rand::Rng;
use tracing::{debug, warn};

use webchat_core::{
    EventBus, Message, MessagePatch, Session, SessionInfo, WebchatConfig, WebchatError,
    WebchatEvent, now_ms,
};
use webchat_platform::VersionedStore;

use crate::timer::Timer;

/// Store key holding the persisted session entry.
const SESSION_STORE_KEY: &str = "session";

/// Whether an id matches the `<positive integer>@<host>` session format.
pub fn is_valid_session_id(id: &str) -> bool {
    match id.split_once('@') {
        Some((digits, host)) => {
            !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) && !host.is_empty()
        }
        None => false,
    }
}

/// Generate a fresh session id bound to the given host suffix.
pub fn generate_session_id(suffix: &str) -> String {
    let numeric = (rand::rng().random::<f64>() * now_ms() as f64).floor() as u64;
    format!("{numeric}@{suffix}")
}

struct SessionInner {
    store: VersionedStore,
    bus: EventBus,
    session: Option<Session>,
    identity_suffix: String,
    cache_timeout: Duration,
    contact_timeout: Duration,
    auto_clear_cache: bool,
    cache_timer: Timer,
    contact_timer: Timer,
}

/// Owns the session identity, its freshness rules, and the persisted
/// conversation snapshot.
///
/// Storage failures are logged and swallowed; queries simply return
/// `None`/`false` in that case. Corrupt or malformed persisted sessions
/// are discarded on load.
#[derive(Clone)]
pub struct SessionEngine {
    inner: Arc<Mutex<SessionInner>>,
}

impl SessionEngine {
    pub fn new(store: VersionedStore, bus: EventBus, config: &WebchatConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionInner {
                store,
                bus,
                session: None,
                identity_suffix: config.identity_suffix(),
                cache_timeout: config.cache_timeout,
                contact_timeout: config.contact_timeout,
                auto_clear_cache: config.auto_clear_cache,
                cache_timer: Timer::new(),
                contact_timer: Timer::new(),
            })),
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.lock().session.as_ref().map(|s| s.info.id.clone())
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.lock().session.as_ref().map(|s| s.info.clone())
    }

    /// Current conversation log. Reading a live session refreshes its
    /// activity.
    pub fn conversation(&self) -> Vec<Message> {
        let mut inner = self.lock();
        if inner.session.is_some() {
            touch(&mut inner, &self.inner);
        }
        inner
            .session
            .as_ref()
            .map(|s| s.conversation.clone())
            .unwrap_or_default()
    }

    /// Return the live session id, restoring a fresh persisted one or
    /// creating a new session as needed.
    pub fn get_or_create(&self) -> String {
        let mut inner = self.lock();

        if inner.session.is_some() {
            touch(&mut inner, &self.inner);
            return inner.session.as_ref().expect("checked above").info.id.clone();
        }

        if let Some(session) = load_fresh(&mut inner) {
            let info = session.info.clone();
            inner.session = Some(session);
            touch(&mut inner, &self.inner);
            schedule_contact_timer(&mut inner, &self.inner);
            inner.bus.emit(WebchatEvent::SessionRestored { session: info.clone() });
            return info.id;
        }

        create_new(&mut inner, &self.inner, None)
    }

    /// Drop any current session and start a fresh one.
    pub fn create_new_session(&self) -> String {
        let mut inner = self.lock();
        create_new(&mut inner, &self.inner, None)
    }

    /// Restore the persisted session, scheduling the contact-timeout check
    /// when a prior send timestamp exists.
    pub fn restore(&self) -> Option<SessionInfo> {
        let mut inner = self.lock();

        let session = load_fresh(&mut inner)?;
        let info = session.info.clone();
        inner.session = Some(session);
        touch(&mut inner, &self.inner);
        schedule_contact_timer(&mut inner, &self.inner);
        inner.bus.emit(WebchatEvent::SessionRestored {
            session: info.clone(),
        });
        Some(info)
    }

    /// Record the outbound send timestamp and (re)arm the single-shot
    /// contact timeout.
    pub fn set_last_message_sent_at(&self, timestamp: u64) {
        let mut inner = self.lock();
        let Some(session) = inner.session.as_mut() else {
            return;
        };
        session.info.last_message_sent_at = Some(timestamp);
        touch(&mut inner, &self.inner);
        schedule_contact_timer(&mut inner, &self.inner);
    }

    /// Adopt a caller-provided session id, resetting the conversation.
    pub fn set_session_id(&self, id: &str) -> Result<(), WebchatError> {
        if !is_valid_session_id(id) {
            return Err(WebchatError::new(
                webchat_core::ErrorCategory::Validation,
                "invalid_session_id",
                format!("'{id}' does not match <number>@<host>"),
            ));
        }

        let mut inner = self.lock();
        if inner
            .session
            .as_ref()
            .is_some_and(|session| session.info.id == id)
        {
            return Ok(());
        }

        drop_session(&mut inner);
        create_new(&mut inner, &self.inner, Some(id.to_owned()));
        let info = inner
            .session
            .as_ref()
            .expect("session was just created")
            .info
            .clone();
        inner.bus.emit(WebchatEvent::SessionChanged { session: info });
        Ok(())
    }

    /// Append to the conversation log, optionally capping its length.
    pub fn append_to_conversation(&self, message: Message, limit: Option<usize>) {
        let mut inner = self.lock();
        let Some(session) = inner.session.as_mut() else {
            warn!("append_to_conversation without a session; dropping");
            return;
        };

        session.conversation.push(message);
        if let Some(limit) = limit
            && session.conversation.len() > limit
        {
            let excess = session.conversation.len() - limit;
            session.conversation.drain(0..excess);
        }
        touch(&mut inner, &self.inner);
    }

    pub fn set_conversation(&self, conversation: Vec<Message>) {
        let mut inner = self.lock();
        let Some(session) = inner.session.as_mut() else {
            return;
        };
        session.conversation = conversation;
        touch(&mut inner, &self.inner);
    }

    /// Patch one conversation entry by id. Returns whether a change was
    /// persisted.
    pub fn update_conversation(&self, id: &str, patch: &MessagePatch) -> bool {
        let mut inner = self.lock();
        let Some(session) = inner.session.as_mut() else {
            return false;
        };
        let Some(message) = session.conversation.iter_mut().find(|m| m.id == id) else {
            return false;
        };
        if !message.apply_patch(patch) {
            return false;
        }
        touch(&mut inner, &self.inner);
        true
    }

    /// Drop the in-memory session, remove the persisted entry, and cancel
    /// all timers.
    pub fn clear(&self) {
        let mut inner = self.lock();
        clear_and_emit(&mut inner);
    }

    /// Cancel timers without touching persisted state.
    pub fn destroy(&self) {
        let mut inner = self.lock();
        inner.cache_timer.cancel();
        inner.contact_timer.cancel();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner.lock().expect("session lock poisoned")
    }
}

fn create_new(
    inner: &mut SessionInner,
    handle: &Arc<Mutex<SessionInner>>,
    fixed_id: Option<String>,
) -> String {
    let id = fixed_id.unwrap_or_else(|| generate_session_id(&inner.identity_suffix));
    debug!(%id, "creating session");
    inner.session = Some(Session::new(id.clone(), now_ms()));
    inner.contact_timer.cancel();
    persist(inner);
    arm_cache_timer(inner, handle);
    id
}

/// Load the persisted session when it is format-valid and still fresh.
/// Malformed or stale entries are discarded (and removed) silently.
fn load_fresh(inner: &mut SessionInner) -> Option<Session> {
    let session = inner.store.get::<Session>(SESSION_STORE_KEY)?;

    if !is_valid_session_id(&session.info.id) {
        debug!(id = %session.info.id, "discarding persisted session with malformed id");
        let _ = inner.store.remove(SESSION_STORE_KEY);
        return None;
    }

    let idle = now_ms().saturating_sub(session.info.last_activity);
    if idle > inner.cache_timeout.as_millis() as u64 {
        debug!(id = %session.info.id, idle_ms = idle, "discarding expired persisted session");
        let _ = inner.store.remove(SESSION_STORE_KEY);
        return None;
    }

    Some(session)
}

/// Refresh activity, persist, and rearm the inactivity auto-clear.
fn touch(inner: &mut SessionInner, handle: &Arc<Mutex<SessionInner>>) {
    if let Some(session) = inner.session.as_mut() {
        session.info.last_activity = now_ms();
    }
    persist(inner);
    arm_cache_timer(inner, handle);
}

fn persist(inner: &SessionInner) {
    let Some(session) = &inner.session else {
        return;
    };
    if let Err(err) = inner.store.set(SESSION_STORE_KEY, session) {
        warn!(error = %err, "session persist failed");
    }
}

fn arm_cache_timer(inner: &mut SessionInner, handle: &Arc<Mutex<SessionInner>>) {
    if !inner.auto_clear_cache {
        return;
    }

    let weak: Weak<Mutex<SessionInner>> = Arc::downgrade(handle);
    inner.cache_timer.arm(inner.cache_timeout, move || {
        if let Some(handle) = weak.upgrade() {
            let mut inner = handle.lock().expect("session lock poisoned");
            debug!("cache timeout reached; clearing session");
            clear_and_emit(&mut inner);
        }
    });
}

/// Arm the contact timeout at `last_message_sent_at + contact_timeout`;
/// fires immediately when that moment is already in the past. Rescheduling
/// replaces any previously armed timer.
fn schedule_contact_timer(inner: &mut SessionInner, handle: &Arc<Mutex<SessionInner>>) {
    let Some(sent_at) = inner
        .session
        .as_ref()
        .and_then(|session| session.info.last_message_sent_at)
    else {
        return;
    };

    let deadline = sent_at.saturating_add(inner.contact_timeout.as_millis() as u64);
    let delay = Duration::from_millis(deadline.saturating_sub(now_ms()));

    let weak: Weak<Mutex<SessionInner>> = Arc::downgrade(handle);
    inner.contact_timer.arm(delay, move || {
        if let Some(handle) = weak.upgrade() {
            let inner = handle.lock().expect("session lock poisoned");
            debug!(sent_at, "contact timeout reached");
            inner.bus.emit(WebchatEvent::ContactTimeoutReached {
                last_message_sent_at: sent_at,
            });
        }
    });
}

fn drop_session(inner: &mut SessionInner) {
    inner.session = None;
    if let Err(err) = inner.store.remove(SESSION_STORE_KEY) {
        warn!(error = %err, "session removal failed");
    }
    inner.cache_timer.cancel();
    inner.contact_timer.cancel();
}

fn clear_and_emit(inner: &mut SessionInner) {
    drop_session(inner);
    inner.bus.emit(WebchatEvent::SessionCleared);
}

#[cfg(test)]
mod tests {
    use super::*;
    use webchat_core::{Direction, MessageContent, MessageStatus};
    use webchat_platform::MemoryBackend;

    fn config() -> WebchatConfig {
        let mut config = WebchatConfig::new("wss://socket.example.org/ws", "chan");
        config.host = "https://chat.example.org".to_owned();
        config
    }

    fn engine_over(backend: MemoryBackend, config: &WebchatConfig) -> (SessionEngine, EventBus) {
        let bus = EventBus::default();
        let engine = SessionEngine::new(
            VersionedStore::new(Box::new(backend)),
            bus.clone(),
            config,
        );
        (engine, bus)
    }

    fn message(id: &str, text: &str) -> Message {
        Message::new(
            id,
            MessageContent::text(text),
            Direction::Incoming,
            MessageStatus::Delivered,
        )
    }

    #[test]
    fn validates_session_id_format() {
        assert!(is_valid_session_id("123@example.org"));
        assert!(is_valid_session_id("7@h"));
        assert!(is_valid_session_id("12@host@tail"));

        assert!(!is_valid_session_id("abc@example.org"));
        assert!(!is_valid_session_id("123@"));
        assert!(!is_valid_session_id("@example.org"));
        assert!(!is_valid_session_id("123"));
        assert!(!is_valid_session_id("12a3@example.org"));
    }

    #[test]
    fn generated_ids_match_the_format() {
        for _ in 0..20 {
            let id = generate_session_id("chat.example.org");
            assert!(is_valid_session_id(&id), "generated id '{id}' is malformed");
        }
    }

    #[tokio::test]
    async fn get_or_create_is_stable_for_a_live_session() {
        let (engine, _bus) = engine_over(MemoryBackend::new(), &config());
        let first = engine.get_or_create();
        let second = engine.get_or_create();
        assert_eq!(first, second);
        assert!(is_valid_session_id(&first));
    }

    #[tokio::test]
    async fn conversation_round_trips_through_the_store() {
        let backend = MemoryBackend::new();
        let (engine, _bus) = engine_over(backend.clone(), &config());

        let id = engine.get_or_create();
        engine.append_to_conversation(message("m1", "hello"), None);
        engine.append_to_conversation(message("m2", "world"), None);

        // A second engine over the same backend restores the session.
        let (restored, _bus) = engine_over(backend, &config());
        let info = restored.restore().expect("session should restore");
        assert_eq!(info.id, id);

        let conversation = restored.conversation();
        assert_eq!(conversation.len(), 2);
        assert_eq!(conversation.last().expect("non-empty").id, "m2");
        assert_eq!(conversation.last().expect("non-empty").text(), Some("world"));
    }

    #[tokio::test]
    async fn restore_discards_malformed_persisted_sessions() {
        let backend = MemoryBackend::new();
        {
            let (engine, _bus) = engine_over(backend.clone(), &config());
            engine.get_or_create();
        }

        // Corrupt the persisted id out from under the engine.
        let store = VersionedStore::new(Box::new(backend.clone()));
        let mut session: Session = store.get(SESSION_STORE_KEY).expect("session persisted");
        session.info.id = "not-a-session-id".to_owned();
        store.set(SESSION_STORE_KEY, &session).expect("overwrite");

        let (engine, _bus) = engine_over(backend, &config());
        assert!(engine.restore().is_none());

        // A fresh id is generated and matches the format.
        let id = engine.get_or_create();
        assert!(is_valid_session_id(&id));
        assert_ne!(id, "not-a-session-id");
    }

    #[tokio::test]
    async fn append_with_limit_keeps_the_tail() {
        let (engine, _bus) = engine_over(MemoryBackend::new(), &config());
        engine.get_or_create();

        for i in 0..5 {
            engine.append_to_conversation(message(&format!("m{i}"), "x"), Some(3));
        }

        let conversation = engine.conversation();
        assert_eq!(conversation.len(), 3);
        assert_eq!(conversation[0].id, "m2");
        assert_eq!(conversation[2].id, "m4");
    }

    #[tokio::test]
    async fn update_conversation_patches_by_id() {
        let (engine, _bus) = engine_over(MemoryBackend::new(), &config());
        engine.get_or_create();
        let mut m = message("m1", "");
        m.status = MessageStatus::Streaming;
        engine.append_to_conversation(m, None);

        assert!(engine.update_conversation("m1", &MessagePatch::streaming_text("partial", 5)));
        assert!(!engine.update_conversation("ghost", &MessagePatch::status(MessageStatus::Delivered)));

        let conversation = engine.conversation();
        assert_eq!(conversation[0].text(), Some("partial"));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_last_message_sent_at_fires_contact_timeout_on_restore() {
        let mut config = config();
        config.contact_timeout = Duration::from_secs(60);
        let backend = MemoryBackend::new();

        {
            let (engine, _bus) = engine_over(backend.clone(), &config);
            engine.get_or_create();
            // Persisted send timestamp is already past the timeout.
            engine.set_last_message_sent_at(now_ms().saturating_sub(60_001));
            engine.destroy();
        }

        let (engine, bus) = engine_over(backend, &config);
        let mut events = bus.subscribe();
        let info = engine.restore().expect("session should restore");

        let event = loop {
            match events.recv().await.expect("bus open") {
                WebchatEvent::ContactTimeoutReached {
                    last_message_sent_at,
                } => break last_message_sent_at,
                _ => continue,
            }
        };
        assert_eq!(Some(event), engine.session_info().expect("live").last_message_sent_at);

        // The timeout signal does not clear the session.
        assert_eq!(engine.session_id(), Some(info.id));
    }

    #[tokio::test(start_paused = true)]
    async fn cache_timeout_auto_clears_an_idle_session() {
        let mut config = config();
        config.auto_clear_cache = true;
        config.cache_timeout = Duration::from_millis(500);

        let (engine, bus) = engine_over(MemoryBackend::new(), &config);
        let mut events = bus.subscribe();
        engine.get_or_create();

        tokio::time::advance(Duration::from_millis(600)).await;
        loop {
            if let WebchatEvent::SessionCleared = events.recv().await.expect("bus open") {
                break;
            }
        }
        assert_eq!(engine.session_id(), None);
    }

    #[tokio::test]
    async fn set_session_id_validates_and_resets() {
        let (engine, bus) = engine_over(MemoryBackend::new(), &config());
        let mut events = bus.subscribe();

        engine.get_or_create();
        engine.append_to_conversation(message("m1", "old"), None);

        let err = engine
            .set_session_id("garbage")
            .expect_err("malformed id must fail");
        assert_eq!(err.code, "invalid_session_id");

        engine
            .set_session_id("42@custom.example.org")
            .expect("valid id should be adopted");
        assert_eq!(engine.session_id().as_deref(), Some("42@custom.example.org"));
        assert!(engine.conversation().is_empty());

        let changed = loop {
            match events.recv().await.expect("bus open") {
                WebchatEvent::SessionChanged { session } => break session,
                _ => continue,
            }
        };
        assert_eq!(changed.id, "42@custom.example.org");
    }

    #[tokio::test]
    async fn clear_removes_the_persisted_entry() {
        let backend = MemoryBackend::new();
        let (engine, bus) = engine_over(backend.clone(), &config());
        let mut events = bus.subscribe();
        engine.get_or_create();

        engine.clear();
        assert_eq!(engine.session_id(), None);
        loop {
            if let WebchatEvent::SessionCleared = events.recv().await.expect("bus open") {
                break;
            }
        }

        let store = VersionedStore::new(Box::new(backend));
        assert!(!store.has(SESSION_STORE_KEY));
    }
}
