use axum::{
    Form,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
};
use serde::Deserialize;
use tracing::{info, warn};

use super::{AppState, PageError, pages};
use crate::auth::CurrentUser;
use crate::csrf::CsrfGuard;
use crate::session::Session;

#[derive(Debug, Deserialize)]
pub(crate) struct SelectForm {
    #[serde(default)]
    server_id: String,
    csrf_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenOnly {
    csrf_token: Option<String>,
}

pub(crate) async fn index(State(state): State<AppState>, session: Session) -> Redirect {
    if state.selection(&session).has_selection() {
        Redirect::to("/rooms")
    } else {
        Redirect::to("/select-server")
    }
}

pub(crate) async fn select_page(
    State(state): State<AppState>,
    session: Session,
    headers: HeaderMap,
) -> Response {
    if !state.registry.has_multiple()
        && let Some(only) = state.registry.list().first()
    {
        state.selection(&session).set_selected_server_id(only.id());
        return Redirect::to("/").into_response();
    }
    render(&state, &session, &headers, None).into_response()
}

pub(crate) async fn select_submit(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    session: Session,
    headers: HeaderMap,
    Form(form): Form<SelectForm>,
) -> Response {
    if let Err(err) = CsrfGuard::validate(&session, form.csrf_token.as_deref()) {
        return err.into_response();
    }

    let server_id = form.server_id.trim();
    if !state.selection(&session).set_selected_server_id(server_id) {
        warn!(user = %user, server_id, "rejected unknown server selection");
        return (
            StatusCode::BAD_REQUEST,
            render(
                &state,
                &session,
                &headers,
                Some("Invalid server selection. Please choose a configured server."),
            ),
        )
            .into_response();
    }

    info!(user = %user, server_id, "server selected");
    Redirect::to("/").into_response()
}

pub(crate) async fn clear(
    State(state): State<AppState>,
    session: Session,
    Form(form): Form<TokenOnly>,
) -> Result<Redirect, PageError> {
    CsrfGuard::validate(&session, form.csrf_token.as_deref())?;
    state.selection(&session).clear_selection();
    Ok(Redirect::to("/select-server"))
}

fn render(
    state: &AppState,
    session: &Session,
    headers: &HeaderMap,
    error: Option<&str>,
) -> axum::response::Html<String> {
    let ctx = state.context(session, headers);
    let default_id = state.registry.default_profile().map(|profile| profile.id());

    let mut rows = String::new();
    for profile in &ctx.servers {
        let selected = ctx.current_server_id() == Some(profile.id());
        let mut tags = String::new();
        if selected {
            tags.push_str(" <span class=\"badge\">current</span>");
        }
        if default_id == Some(profile.id()) {
            tags.push_str(" <span class=\"badge\">default</span>");
        }
        if profile.sip_enabled() {
            tags.push_str(" <span class=\"badge\">SIP</span>");
        }
        rows.push_str(&format!(
            "<tr><td><label class=\"check\"><input type=\"radio\" name=\"server_id\" value=\"{id}\"{checked}> {name}</label>{tags}</td><td>{url}</td><td class=\"muted\">{description}</td></tr>",
            id = pages::escape_html(profile.id()),
            checked = pages::checked(selected),
            name = pages::escape_html(profile.name()),
            url = pages::escape_html(profile.url()),
            description = pages::escape_html(profile.description().unwrap_or("")),
        ));
    }

    let notice = error.map(pages::error_notice).unwrap_or_default();
    let clear = if ctx.current_server.is_some() {
        format!(
            "<form method=\"post\" action=\"/select-server/clear\" class=\"inline\">{}<button type=\"submit\">Clear selection</button></form>",
            pages::csrf_field(&ctx.csrf_token)
        )
    } else {
        String::new()
    };

    let body = format!(
        r#"{notice}<section class="panel"><h2>Select a LiveKit server</h2>
<form method="post" action="/select-server">{csrf}
<table><thead><tr><th>Server</th><th>URL</th><th>Description</th></tr></thead><tbody>{rows}</tbody></table>
<p><button type="submit">Use this server</button></p></form>{clear}</section>"#,
        csrf = pages::csrf_field(&ctx.csrf_token),
    );
    pages::layout(&ctx, "/select-server", "Select server", &body)
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use crate::config::test_registry;
    use crate::server::testing::{Browser, app, body_text, location};

    #[tokio::test]
    async fn single_server_is_selected_automatically() {
        let mut browser = Browser::new(app(test_registry(&["only"])));
        browser.login().await;

        let response = browser.get("/select-server").await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), Some("/"));
        assert_eq!(location(&browser.get("/").await), Some("/rooms"));
    }

    #[tokio::test]
    async fn lists_every_server_and_rejects_unknown_ids() {
        let mut browser = Browser::new(app(test_registry(&["eu", "us"])));
        browser.login().await;

        let body = body_text(browser.get("/select-server").await).await;
        assert!(body.contains("value=\"eu\""));
        assert!(body.contains("value=\"us\""));

        let token = browser.csrf_token("/select-server").await;
        let response = browser
            .post_form("/select-server", &format!("server_id=mars&csrf_token={token}"))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(response).await.contains("Invalid server selection"));
        assert_eq!(location(&browser.get("/").await), Some("/select-server"));
    }

    #[tokio::test]
    async fn selection_requires_csrf_token() {
        let mut browser = Browser::new(app(test_registry(&["eu", "us"])));
        browser.login().await;

        let response = browser.post_form("/select-server", "server_id=eu").await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let response = browser
            .post_form("/select-server", "server_id=eu&csrf_token=forged")
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(location(&browser.get("/").await), Some("/select-server"));
    }

    #[tokio::test]
    async fn clearing_returns_to_selection() {
        let mut browser = Browser::new(app(test_registry(&["eu", "us"])));
        let token = browser.login().await;
        browser
            .post_form("/select-server", &format!("server_id=eu&csrf_token={token}"))
            .await;
        assert_eq!(location(&browser.get("/").await), Some("/rooms"));

        let response = browser
            .post_form("/select-server/clear", &format!("csrf_token={token}"))
            .await;
        assert_eq!(location(&response), Some("/select-server"));
        assert_eq!(location(&browser.get("/").await), Some("/select-server"));
    }
}
