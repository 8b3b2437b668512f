use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header, request::Parts},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use subtle::ConstantTimeEq;
use tracing::{debug, info};

use crate::config::AdminCredentials;
use crate::session::{Session, SessionKey};

pub const LOGIN_PATH: &str = "/login";
pub const AUTH_CHALLENGE: &str = "Basic, Session";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthChannel {
    Session,
    Basic,
}

/// Outcome of checking a request against both authentication channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Authenticated { user: String, channel: AuthChannel },
    RedirectToLogin,
    Challenge,
}

/// Response sent when a request fails both authentication channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRejection {
    RedirectToLogin,
    Challenge,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        match self {
            Self::RedirectToLogin => Redirect::to(LOGIN_PATH).into_response(),
            Self::Challenge => (
                StatusCode::UNAUTHORIZED,
                [(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static(AUTH_CHALLENGE),
                )],
                "Authentication required",
            )
                .into_response(),
        }
    }
}

/// Session-first authentication with an HTTP Basic fallback that logs the
/// session in on success.
#[derive(Clone)]
pub struct AuthGateway {
    credentials: Arc<AdminCredentials>,
}

impl AuthGateway {
    pub fn new(credentials: AdminCredentials) -> Self {
        Self {
            credentials: Arc::new(credentials),
        }
    }

    /// Both fields are always compared so the result does not reveal which
    /// one mismatched.
    pub fn verify_credentials(&self, username: &str, password: &str) -> bool {
        let username_ok = username
            .as_bytes()
            .ct_eq(self.credentials.username().as_bytes());
        let password_ok = password
            .as_bytes()
            .ct_eq(self.credentials.password().as_bytes());
        bool::from(username_ok & password_ok)
    }

    pub fn authenticate(&self, session: &Session, headers: &HeaderMap) -> AuthDecision {
        if let Some(user) = Self::current_user(session) {
            return AuthDecision::Authenticated {
                user,
                channel: AuthChannel::Session,
            };
        }

        if let Some((username, password)) = basic_credentials(headers)
            && self.verify_credentials(&username, &password)
        {
            Self::login(session, &username);
            info!(user = %username, "promoted basic-auth request to session login");
            return AuthDecision::Authenticated {
                user: username,
                channel: AuthChannel::Basic,
            };
        }

        if prefers_html(headers) {
            AuthDecision::RedirectToLogin
        } else {
            AuthDecision::Challenge
        }
    }

    /// Moves the session to a fresh id before marking it authenticated, so
    /// an id handed out before login cannot be reused afterwards.
    pub fn login(session: &Session, username: &str) {
        session.rotate();
        session.set_flag(SessionKey::IsAuthenticated, true);
        session.set(SessionKey::AuthenticatedUser, username);
    }

    /// Drops every session key, including the server selection.
    pub fn logout(session: &Session) {
        session.clear();
    }

    pub fn is_authenticated(session: &Session) -> bool {
        session.flag(SessionKey::IsAuthenticated)
    }

    pub fn current_user(session: &Session) -> Option<String> {
        if !Self::is_authenticated(session) {
            return None;
        }
        session.get(SessionKey::AuthenticatedUser)
    }

    /// Display-only identity: the session user, else the unverified Basic
    /// username.
    pub fn current_user_hybrid(session: &Session, headers: &HeaderMap) -> Option<String> {
        Self::current_user(session).or_else(|| basic_credentials(headers).map(|(user, _)| user))
    }
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

fn prefers_html(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("text/html"))
}

/// Identity of the caller on routes behind [`require_admin`].
#[derive(Debug, Clone)]
pub struct CurrentUser(pub String);

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or(AuthRejection::Challenge)
    }
}

pub async fn require_admin(
    State(gateway): State<AuthGateway>,
    session: Session,
    mut request: Request,
    next: Next,
) -> Response {
    match gateway.authenticate(&session, request.headers()) {
        AuthDecision::Authenticated { user, channel } => {
            debug!(user = %user, channel = ?channel, path = %request.uri().path(), "authenticated request");
            request.extensions_mut().insert(CurrentUser(user));
            next.run(request).await
        }
        AuthDecision::RedirectToLogin => AuthRejection::RedirectToLogin.into_response(),
        AuthDecision::Challenge => AuthRejection::Challenge.into_response(),
    }
}
