use axum::{
    Form,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{Html, Redirect},
};
use chrono::{DateTime, Local, TimeZone};
use serde::Deserialize;
use tracing::{error, info};

use super::{AppState, PageError, checkbox, is_htmx, pages};
use crate::auth::CurrentUser;
use crate::csrf::CsrfGuard;
use crate::livekit::{EgressInfo, RoomCompositeEgressRequest, enum_label};
use crate::session::Session;

const DEFAULT_LAYOUT: &str = "grid";
const DEFAULT_FILENAME: &str = "{room}-{time}.mp4";
const LAYOUTS: [&str; 3] = ["grid", "speaker", "single-speaker"];

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ListQuery {
    partial: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StartForm {
    csrf_token: Option<String>,
    #[serde(default)]
    room_name: String,
    #[serde(default)]
    output_filename: String,
    layout: Option<String>,
    audio_only: Option<String>,
    video_only: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenOnly {
    csrf_token: Option<String>,
}

pub(crate) async fn list(
    State(state): State<AppState>,
    session: Session,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Html<String>, PageError> {
    let client = state.client(&session)?;
    let ctx = state.context(&session, &headers);

    let table = match client.list_egress(true).await {
        Ok(jobs) => egress_table(&jobs, &ctx.csrf_token),
        Err(err) => {
            error!(error = %err, "failed to list egress jobs");
            pages::error_notice(&format!("Could not list egress jobs: {err}"))
        }
    };
    if query.partial.is_some() || is_htmx(&headers) {
        return Ok(Html(table));
    }

    let mut layouts = String::new();
    for layout in LAYOUTS {
        layouts.push_str(&format!("<option value=\"{layout}\">{layout}</option>"));
    }
    let body = format!(
        r#"<section class="panel"><h2>Active egress</h2><div id="egress-table">{table}</div></section>
<section class="panel"><h2>Start room recording</h2>
<form method="post" action="/egress/start" class="stack">{csrf}
<label>Room<input name="room_name" required></label>
<label>Output file<input name="output_filename" value="{DEFAULT_FILENAME}"></label>
<p class="muted">{{room}} and {{time}} are replaced with the room name and the start time.</p>
<label>Layout<select name="layout">{layouts}</select></label>
<label class="check"><input type="checkbox" name="audio_only"> Audio only</label>
<label class="check"><input type="checkbox" name="video_only"> Video only</label>
<button type="submit">Start recording</button></form></section>"#,
        csrf = pages::csrf_field(&ctx.csrf_token),
    );
    Ok(pages::layout(&ctx, "/egress", "Egress", &body))
}

pub(crate) async fn start(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    session: Session,
    Form(form): Form<StartForm>,
) -> Result<Redirect, PageError> {
    CsrfGuard::validate(&session, form.csrf_token.as_deref())?;
    let client = state.client(&session)?;

    let room_name = form.room_name.trim();
    if room_name.is_empty() {
        return Ok(Redirect::to("/egress"));
    }
    let template = match form.output_filename.trim() {
        "" => DEFAULT_FILENAME,
        custom => custom,
    };
    let request = RoomCompositeEgressRequest {
        room_name: room_name.to_string(),
        filepath: expand_filename(template, room_name, &Local::now()),
        layout: form
            .layout
            .as_deref()
            .map(str::trim)
            .filter(|layout| !layout.is_empty())
            .unwrap_or(DEFAULT_LAYOUT)
            .to_string(),
        audio_only: checkbox(form.audio_only.as_deref()),
        video_only: checkbox(form.video_only.as_deref()),
    };

    match client.start_room_composite_egress(&request).await {
        Ok(egress) => info!(
            user = %user,
            room = room_name,
            egress_id = %egress.egress_id,
            filepath = %request.filepath,
            "egress started"
        ),
        Err(err) => error!(room = room_name, error = %err, "failed to start egress"),
    }
    Ok(Redirect::to("/egress"))
}

pub(crate) async fn stop(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    session: Session,
    Path(egress_id): Path<String>,
    Form(form): Form<TokenOnly>,
) -> Result<Redirect, PageError> {
    CsrfGuard::validate(&session, form.csrf_token.as_deref())?;
    let client = state.client(&session)?;

    match client.stop_egress(&egress_id).await {
        Ok(egress) => info!(
            user = %user,
            egress_id = %egress_id,
            status = %enum_label(&egress.status),
            "egress stop requested"
        ),
        Err(err) => error!(egress_id = %egress_id, error = %err, "failed to stop egress"),
    }
    Ok(Redirect::to("/egress"))
}

/// Substitutes `{room}` and `{time}` (local `YYYYmmdd_HHMMSS`) in an output
/// file template.
fn expand_filename<Tz>(template: &str, room: &str, now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    template
        .replace("{room}", room)
        .replace("{time}", &now.format("%Y%m%d_%H%M%S").to_string())
}

fn egress_table(jobs: &[EgressInfo], csrf_token: &str) -> String {
    if jobs.is_empty() {
        return r#"<p class="muted">No active egress jobs.</p>"#.to_string();
    }
    let csrf = pages::csrf_field(csrf_token);
    let mut rows = String::new();
    for job in jobs {
        rows.push_str(&format!(
            r#"<tr><td>{id}</td><td>{room}</td><td>{status}</td><td>{started}</td><td class="muted">{error}</td><td><form method="post" action="{stop}" class="inline">{csrf}<button type="submit" class="danger">Stop</button></form></td></tr>"#,
            id = pages::escape_html(&job.egress_id),
            room = pages::escape_html(&job.room_name),
            status = pages::escape_html(&enum_label(&job.status)),
            started = pages::format_epoch_seconds(job.started_at / 1_000_000_000),
            error = pages::escape_html(&job.error),
            stop = pages::path(&["egress", &job.egress_id, "stop"]),
        ));
    }
    format!(
        "<table><thead><tr><th>ID</th><th>Room</th><th>Status</th><th>Started</th><th>Error</th><th></th></tr></thead><tbody>{rows}</tbody></table>"
    )
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use chrono::{TimeZone, Utc};

    use super::expand_filename;
    use crate::server::testing::{body_text, last_body, location, methods, signed_in, spawn_livekit};

    #[test]
    fn filename_placeholders_expand() {
        let at = Utc
            .with_ymd_and_hms(2026, 3, 4, 5, 6, 7)
            .single()
            .expect("timestamp");
        assert_eq!(
            expand_filename("rec/{room}-{time}.mp4", "standup", &at),
            "rec/standup-20260304_050607.mp4"
        );
        assert_eq!(expand_filename("plain.ogg", "standup", &at), "plain.ogg");
    }

    #[tokio::test]
    async fn lists_active_jobs_with_stop_buttons() {
        let (url, calls) = spawn_livekit().await;
        let (mut browser, _) = signed_in(&url).await;

        let body = body_text(browser.get("/egress").await).await;
        assert!(body.contains("EG_1"));
        assert!(body.contains("EGRESS_ACTIVE"));
        assert!(body.contains("action=\"/egress/EG_1/stop\""));
        assert_eq!(last_body(&calls, "ListEgress").expect("list call")["active"], true);
    }

    #[tokio::test]
    async fn start_expands_filename_and_defaults_layout() {
        let (url, calls) = spawn_livekit().await;
        let (mut browser, token) = signed_in(&url).await;

        let response = browser
            .post_form(
                "/egress/start",
                &format!("csrf_token={token}&room_name=standup&output_filename=%7Broom%7D.mp4&audio_only=on"),
            )
            .await;
        assert_eq!(location(&response), Some("/egress"));
        let body = last_body(&calls, "StartRoomCompositeEgress").expect("start call");
        assert_eq!(body["room_name"], "standup");
        assert_eq!(body["layout"], "grid");
        assert_eq!(body["audio_only"], true);
        assert_eq!(body["video_only"], false);
        assert_eq!(body["file_outputs"][0]["filepath"], "standup.mp4");
    }

    #[tokio::test]
    async fn stop_requires_csrf() {
        let (url, calls) = spawn_livekit().await;
        let (mut browser, token) = signed_in(&url).await;

        let response = browser.post_form("/egress/EG_1/stop", "csrf_token=nope").await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(!methods(&calls).contains(&"StopEgress".to_string()));

        browser
            .post_form("/egress/EG_1/stop", &format!("csrf_token={token}"))
            .await;
        assert_eq!(last_body(&calls, "StopEgress").expect("stop call")["egress_id"], "EG_1");
    }
}
