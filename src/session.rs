//! Server-side sessions keyed by an opaque cookie.
//!
//! Handlers never see a free-form map: the only values a session can hold
//! are the ones named by [`SessionKey`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header, request::Parts},
    middleware::Next,
    response::Response,
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use cookie::{Cookie, SameSite};
use tracing::{debug, warn};

use crate::config::{ServerProfile, ServerRegistry};

pub const SESSION_COOKIE_NAME: &str = "lk_dashboard_session";
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(14 * 24 * 60 * 60);
pub const DEFAULT_MAX_SESSIONS: usize = 10_000;
const SESSION_ID_BYTES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionKey {
    IsAuthenticated,
    AuthenticatedUser,
    SelectedServerId,
    CsrfToken,
}

impl SessionKey {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IsAuthenticated => "is_authenticated",
            Self::AuthenticatedUser => "authenticated_user",
            Self::SelectedServerId => "selected_server_id",
            Self::CsrfToken => "csrf_token",
        }
    }
}

pub trait SessionStore: Send + Sync {
    /// Allocates a fresh, empty session and returns its id.
    fn create(&self) -> String;
    /// Returns true and refreshes the idle timer when `id` names a live session.
    fn touch(&self, id: &str) -> bool;
    fn get(&self, id: &str, key: SessionKey) -> Option<String>;
    /// Returns false when `id` is unknown or expired; nothing is written then.
    fn set(&self, id: &str, key: SessionKey, value: String) -> bool;
    fn remove(&self, id: &str, key: SessionKey);
    fn clear(&self, id: &str);
    /// Moves a live session's values under a new id and forgets the old one.
    fn rotate(&self, id: &str) -> Option<String>;
}

#[derive(Debug)]
struct SessionEntry {
    values: BTreeMap<SessionKey, String>,
    last_seen: Instant,
}

impl SessionEntry {
    fn new() -> Self {
        Self {
            values: BTreeMap::new(),
            last_seen: Instant::now(),
        }
    }

    fn is_expired(&self, idle_ttl: Duration) -> bool {
        self.last_seen.elapsed() >= idle_ttl
    }
}

/// In-process session table. Sessions do not survive a restart.
///
/// The table never holds more than `max_sessions` entries: once full,
/// expired entries go first, then the least recently seen tenth.
#[derive(Debug)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    idle_ttl: Duration,
    max_sessions: usize,
}

impl MemorySessionStore {
    pub fn new(idle_ttl: Duration) -> Self {
        Self::with_capacity(idle_ttl, DEFAULT_MAX_SESSIONS)
    }

    pub fn with_capacity(idle_ttl: Duration, max_sessions: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            idle_ttl,
            max_sessions: max_sessions.max(1),
        }
    }

    fn with_sessions<T>(&self, f: impl FnOnce(&mut HashMap<String, SessionEntry>) -> T) -> T {
        let mut guard = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    fn with_live_entry<T>(&self, id: &str, f: impl FnOnce(&mut SessionEntry) -> T) -> Option<T> {
        let idle_ttl = self.idle_ttl;
        self.with_sessions(|sessions| {
            let expired = sessions.get(id)?.is_expired(idle_ttl);
            if expired {
                sessions.remove(id);
                return None;
            }
            sessions.get_mut(id).map(f)
        })
    }

    fn insert(&self, sessions: &mut HashMap<String, SessionEntry>, entry: SessionEntry) -> String {
        if sessions.len() >= self.max_sessions {
            self.make_room(sessions);
        }
        let id = random_session_id();
        sessions.insert(id.clone(), entry);
        id
    }

    fn make_room(&self, sessions: &mut HashMap<String, SessionEntry>) {
        let before = sessions.len();
        let idle_ttl = self.idle_ttl;
        sessions.retain(|_, entry| !entry.is_expired(idle_ttl));

        // Evict down to nine tenths of capacity, oldest first.
        let target = self.max_sessions - self.max_sessions.div_ceil(10);
        if sessions.len() > target {
            let mut by_age: Vec<(Instant, String)> = sessions
                .iter()
                .map(|(id, entry)| (entry.last_seen, id.clone()))
                .collect();
            by_age.sort_unstable();
            let excess = sessions.len() - target;
            for (_, id) in by_age.into_iter().take(excess) {
                sessions.remove(&id);
            }
        }

        let evicted = before - sessions.len();
        if evicted > 0 {
            warn!(evicted, capacity = self.max_sessions, "session table full, evicted oldest sessions");
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.with_sessions(|sessions| sessions.len())
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TTL)
    }
}

impl SessionStore for MemorySessionStore {
    fn create(&self) -> String {
        self.with_sessions(|sessions| self.insert(sessions, SessionEntry::new()))
    }

    fn touch(&self, id: &str) -> bool {
        self.with_live_entry(id, |entry| entry.last_seen = Instant::now())
            .is_some()
    }

    fn get(&self, id: &str, key: SessionKey) -> Option<String> {
        self.with_live_entry(id, |entry| entry.values.get(&key).cloned())
            .flatten()
    }

    fn set(&self, id: &str, key: SessionKey, value: String) -> bool {
        self.with_live_entry(id, |entry| {
            entry.values.insert(key, value);
        })
        .is_some()
    }

    fn remove(&self, id: &str, key: SessionKey) {
        let _ = self.with_live_entry(id, |entry| entry.values.remove(&key));
    }

    fn clear(&self, id: &str) {
        let _ = self.with_live_entry(id, |entry| entry.values.clear());
    }

    fn rotate(&self, id: &str) -> Option<String> {
        let idle_ttl = self.idle_ttl;
        self.with_sessions(|sessions| {
            let mut entry = sessions.remove(id)?;
            if entry.is_expired(idle_ttl) {
                return None;
            }
            entry.last_seen = Instant::now();
            Some(self.insert(sessions, entry))
        })
    }
}

fn random_session_id() -> String {
    URL_SAFE_NO_PAD.encode(rand::random::<[u8; SESSION_ID_BYTES]>())
}

#[derive(Debug, Default)]
struct SessionState {
    id: Option<String>,
    /// Set when the id changed during this request and the cookie must be
    /// (re)issued.
    issued: bool,
}

/// Handle to the caller's session for the duration of one request.
///
/// Nothing is stored until the first write: requests that only read never
/// allocate a server-side entry or receive a cookie.
#[derive(Clone)]
pub struct Session {
    store: Arc<dyn SessionStore>,
    state: Arc<Mutex<SessionState>>,
}

impl Session {
    pub fn new(id: Option<String>, store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            state: Arc::new(Mutex::new(SessionState {
                id,
                issued: false,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> Option<String> {
        self.state().id.clone()
    }

    pub fn get(&self, key: SessionKey) -> Option<String> {
        let id = self.id()?;
        self.store.get(&id, key)
    }

    pub fn set(&self, key: SessionKey, value: impl Into<String>) {
        let value = value.into();
        let mut state = self.state();
        if let Some(id) = &state.id
            && self.store.set(id, key, value.clone())
        {
            return;
        }
        // No session yet, or it expired mid-request.
        let id = self.store.create();
        if !self.store.set(&id, key, value) {
            warn!(key = key.as_str(), "dropping write to a session evicted on creation");
        }
        state.id = Some(id);
        state.issued = true;
    }

    pub fn remove(&self, key: SessionKey) {
        if let Some(id) = self.id() {
            self.store.remove(&id, key);
        }
    }

    pub fn clear(&self) {
        if let Some(id) = self.id() {
            self.store.clear(&id);
        }
    }

    /// Reissues the session under a new id, keeping its values.
    pub fn rotate(&self) {
        let mut state = self.state();
        let Some(old) = state.id.take() else {
            return;
        };
        state.id = self.store.rotate(&old);
        if state.id.is_some() {
            state.issued = true;
            debug!("rotated session id");
        }
    }

    /// The id to send back as a cookie, once per change.
    fn take_issued_id(&self) -> Option<String> {
        let mut state = self.state();
        if !std::mem::take(&mut state.issued) {
            return None;
        }
        state.id.clone()
    }

    pub fn flag(&self, key: SessionKey) -> bool {
        self.get(key).as_deref() == Some("true")
    }

    pub fn set_flag(&self, key: SessionKey, value: bool) {
        self.set(key, if value { "true" } else { "false" });
    }
}

impl<S> FromRequestParts<S> for Session
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Session>()
            .cloned()
            .ok_or((StatusCode::INTERNAL_SERVER_ERROR, "session layer not installed"))
    }
}

/// Server selection scoped to one session, re-validated against the
/// registry on every read.
pub struct SessionContext<'a> {
    session: &'a Session,
    registry: &'a ServerRegistry,
}

impl<'a> SessionContext<'a> {
    pub fn new(session: &'a Session, registry: &'a ServerRegistry) -> Self {
        Self { session, registry }
    }

    /// Raw stored value, which may reference a server that no longer exists.
    pub fn selected_server_id(&self) -> Option<String> {
        self.session.get(SessionKey::SelectedServerId)
    }

    pub fn set_selected_server_id(&self, id: &str) -> bool {
        if !self.registry.contains(id) {
            return false;
        }
        self.session.set(SessionKey::SelectedServerId, id);
        true
    }

    pub fn current_server_id(&self) -> Option<String> {
        self.selected_server_id()
            .filter(|id| self.registry.contains(id))
    }

    pub fn current_server(&self) -> Option<&'a ServerProfile> {
        let id = self.selected_server_id()?;
        self.registry.get(&id)
    }

    pub fn clear_selection(&self) {
        self.session.remove(SessionKey::SelectedServerId);
    }

    pub fn has_selection(&self) -> bool {
        self.current_server_id().is_some()
    }
}

/// Cookie transport for [`Session`] handles.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    secure_cookies: bool,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, secure_cookies: bool) -> Self {
        Self {
            store,
            secure_cookies,
        }
    }

    pub fn store(&self) -> Arc<dyn SessionStore> {
        Arc::clone(&self.store)
    }

    fn resume(&self, headers: &HeaderMap) -> Option<String> {
        session_id_from_headers(headers).filter(|id| self.store.touch(id))
    }

    fn cookie_header(&self, id: &str) -> Option<HeaderValue> {
        let cookie = Cookie::build((SESSION_COOKIE_NAME, id))
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax)
            .secure(self.secure_cookies)
            .build();
        HeaderValue::from_str(&cookie.to_string()).ok()
    }
}

fn session_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(Cookie::split_parse)
        .filter_map(Result::ok)
        .find(|cookie| cookie.name() == SESSION_COOKIE_NAME)
        .map(|cookie| cookie.value().to_string())
}

/// Attaches a [`Session`] to every request and sets the cookie whenever the
/// handler created or rotated the session.
pub async fn session_middleware(
    State(sessions): State<SessionManager>,
    mut request: Request,
    next: Next,
) -> Response {
    let session = Session::new(sessions.resume(request.headers()), sessions.store());
    request.extensions_mut().insert(session.clone());

    let mut response = next.run(request).await;
    if let Some(value) = session
        .take_issued_id()
        .and_then(|id| sessions.cookie_header(&id))
    {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
    response
}

#[cfg(test)]
pub(crate) fn test_session() -> Session {
    Session::new(None, Arc::new(MemorySessionStore::default()))
}
