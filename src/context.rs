use axum::http::HeaderMap;

use crate::auth::AuthGateway;
use crate::config::{ServerProfile, ServerRegistry};
use crate::csrf::CsrfGuard;
use crate::session::{Session, SessionContext};

/// Values every dashboard page renders: who is signed in, which server the
/// session is scoped to, and the form token.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub current_user: Option<String>,
    pub current_server: Option<ServerProfile>,
    pub servers: Vec<ServerProfile>,
    pub csrf_token: String,
    pub sip_enabled: bool,
}

impl RequestContext {
    /// Never fails: a missing or stale selection leaves the server-derived
    /// fields empty and `sip_enabled` false.
    pub fn build(registry: &ServerRegistry, session: &Session, headers: &HeaderMap) -> Self {
        let current_server = SessionContext::new(session, registry)
            .current_server()
            .cloned();
        let sip_enabled = current_server
            .as_ref()
            .is_some_and(ServerProfile::sip_enabled);

        Self {
            current_user: AuthGateway::current_user_hybrid(session, headers),
            current_server,
            servers: registry.list().to_vec(),
            csrf_token: CsrfGuard::token(session),
            sip_enabled,
        }
    }

    pub fn current_server_id(&self) -> Option<&str> {
        self.current_server.as_ref().map(ServerProfile::id)
    }
}
