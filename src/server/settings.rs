use axum::{extract::State, http::HeaderMap, response::Html};
use tracing::warn;

use super::{AppState, PageError, pages};
use crate::logging;
use crate::session::Session;

const LOG_LINES: usize = 200;

pub(crate) async fn page(
    State(state): State<AppState>,
    session: Session,
    headers: HeaderMap,
) -> Result<Html<String>, PageError> {
    let client = state.client(&session)?;
    let ctx = state.context(&session, &headers);

    let status = match client.list_rooms(&[]).await {
        Ok((rooms, latency)) => pages::ok_notice(&format!(
            "reachable · {} room(s) · {:.2} ms",
            rooms.len(),
            latency.as_secs_f64() * 1000.0
        )),
        Err(err) => {
            warn!(server = client.profile().id(), error = %err, "server health probe failed");
            pages::error_notice(&format!("unreachable: {err}"))
        }
    };

    let logs = logging::recent_logs()
        .map(|logs| logs.tail(LOG_LINES))
        .unwrap_or_default();
    let logs = if logs.is_empty() {
        "<p class=\"muted\">No log lines captured.</p>".to_string()
    } else {
        format!("<pre>{}</pre>", pages::escape_html(&logs.join("\n")))
    };

    let profile = client.profile();
    let body = format!(
        r#"<section class="panel"><h2>Server</h2>{status}
<table><tbody>
<tr><th>Name</th><td>{name}</td></tr>
<tr><th>ID</th><td>{id}</td></tr>
<tr><th>URL</th><td>{url}</td></tr>
<tr><th>API key</th><td>{api_key}</td></tr>
<tr><th>SIP</th><td>{sip}</td></tr>
</tbody></table></section>
<section class="panel"><h2>Dashboard</h2>
<table><tbody>
<tr><th>Configured servers</th><td>{servers}</td></tr>
<tr><th>Configuration source</th><td>{source}</td></tr>
<tr><th>Debug</th><td>{debug}</td></tr>
</tbody></table></section>
<section class="panel"><h2>Recent logs</h2>{logs}</section>"#,
        name = pages::escape_html(profile.name()),
        id = pages::escape_html(profile.id()),
        url = pages::escape_html(client.url()),
        api_key = pages::escape_html(profile.api_key()),
        sip = if client.sip_enabled() { "enabled" } else { "disabled" },
        servers = state.registry.list().len(),
        source = pages::escape_html(state.registry.source().as_str()),
        debug = state.debug,
    );
    Ok(pages::layout(&ctx, "/settings", "Settings", &body))
}
