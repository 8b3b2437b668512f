//! Token generator for trying a room from a browser without writing a client.

use std::time::Duration;

use axum::{Form, extract::State, http::HeaderMap, response::Html};
use serde::Deserialize;
use tracing::{error, info};
use url::form_urlencoded;

use super::{AppState, PageError, checkbox, non_empty, number_or, pages};
use crate::auth::CurrentUser;
use crate::context::RequestContext;
use crate::csrf::CsrfGuard;
use crate::livekit::TokenRequest;
use crate::session::Session;

const MEET_URL: &str = "https://meet.livekit.io/custom";
const DEFAULT_TTL_SECS: u64 = 3600;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct GenerateForm {
    csrf_token: Option<String>,
    #[serde(default)]
    room: String,
    #[serde(default)]
    identity: String,
    name: Option<String>,
    ttl: Option<String>,
    metadata: Option<String>,
    can_publish: Option<String>,
    can_subscribe: Option<String>,
    can_publish_data: Option<String>,
}

/// Values echoed back into the form after a submission.
struct Prefill {
    room: String,
    identity: String,
    name: String,
    ttl: u64,
    metadata: String,
    can_publish: bool,
    can_subscribe: bool,
    can_publish_data: bool,
}

impl Default for Prefill {
    fn default() -> Self {
        Self {
            room: String::new(),
            identity: String::new(),
            name: String::new(),
            ttl: DEFAULT_TTL_SECS,
            metadata: String::new(),
            can_publish: true,
            can_subscribe: true,
            can_publish_data: true,
        }
    }
}

pub(crate) async fn page(
    State(state): State<AppState>,
    session: Session,
    headers: HeaderMap,
) -> Result<Html<String>, PageError> {
    state.client(&session)?;
    let ctx = state.context(&session, &headers);
    Ok(render(&ctx, &Prefill::default(), ""))
}

pub(crate) async fn generate(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    session: Session,
    headers: HeaderMap,
    Form(form): Form<GenerateForm>,
) -> Result<Html<String>, PageError> {
    CsrfGuard::validate(&session, form.csrf_token.as_deref())?;
    let client = state.client(&session)?;
    let ctx = state.context(&session, &headers);

    let prefill = Prefill {
        room: form.room.trim().to_string(),
        identity: form.identity.trim().to_string(),
        name: non_empty(form.name.as_deref()).unwrap_or_default(),
        ttl: number_or(form.ttl.as_deref(), DEFAULT_TTL_SECS),
        metadata: form.metadata.unwrap_or_default(),
        can_publish: checkbox(form.can_publish.as_deref()),
        can_subscribe: checkbox(form.can_subscribe.as_deref()),
        can_publish_data: checkbox(form.can_publish_data.as_deref()),
    };
    if prefill.room.is_empty() || prefill.identity.is_empty() {
        return Ok(render(
            &ctx,
            &prefill,
            &pages::error_notice("Room and identity are required."),
        ));
    }

    let request = TokenRequest {
        room: prefill.room.clone(),
        identity: prefill.identity.clone(),
        name: non_empty(Some(&prefill.name)),
        ttl: Duration::from_secs(prefill.ttl),
        metadata: non_empty(Some(&prefill.metadata)),
        can_publish: prefill.can_publish,
        can_subscribe: prefill.can_subscribe,
        can_publish_data: prefill.can_publish_data,
    };
    let result = match client.generate_token(&request) {
        Ok(token) => {
            info!(user = %user, room = %request.room, identity = %request.identity, "sandbox token issued");
            let test_url = meet_url(client.url(), &token);
            format!(
                r#"<section class="panel"><h2>Token</h2><pre>{token}</pre>
<p><a href="{test_url}" target="_blank" rel="noopener">Open in LiveKit Meet</a></p></section>"#,
                token = pages::escape_html(&token),
                test_url = pages::escape_html(&test_url),
            )
        }
        Err(err) => {
            error!(room = %request.room, error = %err, "failed to generate sandbox token");
            pages::error_notice(&format!("Could not generate token: {err}"))
        }
    };
    Ok(render(&ctx, &prefill, &result))
}

fn meet_url(server_url: &str, token: &str) -> String {
    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair("url", server_url)
        .append_pair("token", token)
        .finish();
    format!("{MEET_URL}?{query}")
}

fn render(ctx: &RequestContext, prefill: &Prefill, result: &str) -> Html<String> {
    let body = format!(
        r#"<section class="panel"><h2>Token sandbox</h2>
<form method="post" action="/sandbox/generate" class="stack">{csrf}
<label>Room<input name="room" value="{room}" required></label>
<label>Identity<input name="identity" value="{identity}" required></label>
<label>Display name<input name="name" value="{name}"></label>
<label>TTL (seconds)<input name="ttl" type="number" min="60" value="{ttl}"></label>
<label>Metadata<textarea name="metadata" rows="2">{metadata}</textarea></label>
<label class="check"><input type="checkbox" name="can_publish"{publish}> Can publish</label>
<label class="check"><input type="checkbox" name="can_subscribe"{subscribe}> Can subscribe</label>
<label class="check"><input type="checkbox" name="can_publish_data"{data}> Can publish data</label>
<button type="submit">Generate</button></form></section>
{result}"#,
        csrf = pages::csrf_field(&ctx.csrf_token),
        room = pages::escape_html(&prefill.room),
        identity = pages::escape_html(&prefill.identity),
        name = pages::escape_html(&prefill.name),
        ttl = prefill.ttl,
        metadata = pages::escape_html(&prefill.metadata),
        publish = pages::checked(prefill.can_publish),
        subscribe = pages::checked(prefill.can_subscribe),
        data = pages::checked(prefill.can_publish_data),
    );
    pages::layout(ctx, "/sandbox", "Sandbox", &body)
}
