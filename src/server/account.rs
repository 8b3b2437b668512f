use axum::{
    Form,
    extract::State,
    http::{HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Redirect, Response},
};
use serde::Deserialize;
use tracing::{info, warn};

use super::{AppState, pages};
use crate::auth::AuthGateway;
use crate::csrf::CsrfGuard;
use crate::session::Session;

const CLEAR_AUTH_CHALLENGE: &str = "Basic realm=\"LiveKit Dashboard\"";

#[derive(Debug, Deserialize)]
pub(crate) struct LoginForm {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    csrf_token: Option<String>,
}

pub(crate) async fn login_page(session: Session) -> Response {
    if AuthGateway::is_authenticated(&session) {
        return Redirect::to("/").into_response();
    }
    render_login(&session, None, "").into_response()
}

pub(crate) async fn login_submit(
    State(state): State<AppState>,
    session: Session,
    Form(form): Form<LoginForm>,
) -> Response {
    if let Err(err) = CsrfGuard::validate(&session, form.csrf_token.as_deref()) {
        warn!(error = %err, "login form rejected");
        return (
            StatusCode::FORBIDDEN,
            render_login(
                &session,
                Some("Invalid security token. Please try again."),
                &form.username,
            ),
        )
            .into_response();
    }

    if !state.auth.verify_credentials(&form.username, &form.password) {
        warn!(user = %form.username, "failed login attempt");
        return (
            StatusCode::UNAUTHORIZED,
            render_login(
                &session,
                Some("Invalid username or password."),
                &form.username,
            ),
        )
            .into_response();
    }

    AuthGateway::login(&session, &form.username);
    info!(user = %form.username, "user logged in");
    Redirect::to("/").into_response()
}

pub(crate) async fn logout(session: Session) -> Html<String> {
    if let Some(user) = AuthGateway::current_user(&session) {
        info!(user = %user, "user logged out");
    }
    AuthGateway::logout(&session);
    pages::bare(
        "Logged out",
        r#"<section class="panel"><h2>Logged out</h2>
<p>Your dashboard session has ended.</p>
<p class="muted">Browsers keep HTTP Basic credentials until they are replaced. <a href="/logout-clear-auth">Clear saved credentials</a> if you signed in that way.</p>
<p><a href="/login">Sign in again</a></p></section>"#,
    )
}

/// Answers with a fresh Basic challenge so browsers drop cached credentials.
pub(crate) async fn logout_clear_auth() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static(CLEAR_AUTH_CHALLENGE),
        )],
        pages::bare(
            "Credentials cleared",
            r#"<section class="panel"><h2>Credentials cleared</h2><p><a href="/login">Sign in</a></p></section>"#,
        ),
    )
        .into_response()
}

fn render_login(session: &Session, error: Option<&str>, username: &str) -> Html<String> {
    let token = CsrfGuard::token(session);
    let notice = error.map(pages::error_notice).unwrap_or_default();
    pages::bare(
        "Sign in",
        &format!(
            r#"{notice}<section class="panel"><h2>Sign in</h2>
<form method="post" action="/login" class="stack">{csrf}
<label>Username<input name="username" value="{username}" autocomplete="username" required autofocus></label>
<label>Password<input name="password" type="password" autocomplete="current-password" required></label>
<button type="submit">Sign in</button>
</form></section>"#,
            csrf = pages::csrf_field(&token),
            username = pages::escape_html(username),
        ),
    )
}
