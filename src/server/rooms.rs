use std::time::Duration;

use axum::{
    Form,
    extract::{Path, Query, State},
    http::{HeaderMap, header},
    response::{Html, IntoResponse, Redirect, Response},
};
use serde::Deserialize;
use tracing::{error, info};

use super::{AppState, PageError, checkbox, is_htmx, non_empty, number_or, pages};
use crate::auth::CurrentUser;
use crate::context::RequestContext;
use crate::csrf::CsrfGuard;
use crate::livekit::{
    CreateRoomRequest, LiveKitClient, ParticipantInfo, Room, TokenRequest, enum_label,
};
use crate::session::Session;

const DEFAULT_MAX_PARTICIPANTS: u32 = 100;
const DEFAULT_EMPTY_TIMEOUT_SECS: u32 = 300;
const DEFAULT_TOKEN_TTL_SECS: u64 = 3600;

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ListQuery {
    search: Option<String>,
    partial: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateForm {
    csrf_token: Option<String>,
    #[serde(default)]
    name: String,
    max_participants: Option<String>,
    empty_timeout: Option<String>,
    metadata: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenOnly {
    csrf_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenForm {
    csrf_token: Option<String>,
    #[serde(default)]
    identity: String,
    participant_name: Option<String>,
    ttl: Option<String>,
    can_publish: Option<String>,
    can_subscribe: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MuteForm {
    csrf_token: Option<String>,
    #[serde(default)]
    track_sid: String,
    muted: Option<String>,
}

pub(crate) async fn list(
    State(state): State<AppState>,
    session: Session,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Html<String>, PageError> {
    let client = state.client(&session)?;
    let ctx = state.context(&session, &headers);
    let search = query.search.as_deref().map(str::trim).unwrap_or("");
    let table = rooms_table(&client, &ctx, search).await;

    if query.partial.is_some() || is_htmx(&headers) {
        return Ok(Html(table));
    }

    let body = format!(
        r#"<section class="panel"><h2>Rooms</h2>
<form method="get" action="/rooms"><input name="search" value="{search}" placeholder="Filter by name"> <button type="submit">Search</button></form>
<div id="rooms-table">{table}</div></section>
<section class="panel"><h2>Create room</h2>
<form method="post" action="/rooms" class="stack">{csrf}
<label>Name<input name="name" required></label>
<label>Max participants<input name="max_participants" type="number" min="0" value="{DEFAULT_MAX_PARTICIPANTS}"></label>
<label>Empty timeout (seconds)<input name="empty_timeout" type="number" min="0" value="{DEFAULT_EMPTY_TIMEOUT_SECS}"></label>
<label>Metadata<textarea name="metadata" rows="2"></textarea></label>
<button type="submit">Create</button></form></section>"#,
        search = pages::escape_html(search),
        csrf = pages::csrf_field(&ctx.csrf_token),
    );
    Ok(pages::layout(&ctx, "/rooms", "Rooms", &body))
}

pub(crate) async fn create(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    session: Session,
    headers: HeaderMap,
    Form(form): Form<CreateForm>,
) -> Result<Response, PageError> {
    CsrfGuard::validate(&session, form.csrf_token.as_deref())?;
    let client = state.client(&session)?;

    let name = form.name.trim();
    if name.is_empty() {
        return Ok(Redirect::to("/rooms").into_response());
    }
    let request = CreateRoomRequest {
        name: name.to_string(),
        max_participants: number_or(form.max_participants.as_deref(), DEFAULT_MAX_PARTICIPANTS),
        empty_timeout: number_or(form.empty_timeout.as_deref(), DEFAULT_EMPTY_TIMEOUT_SECS),
        metadata: form.metadata.unwrap_or_default(),
    };
    match client.create_room(&request).await {
        Ok(room) => info!(user = %user, room = %room.name, sid = %room.sid, "room created"),
        Err(err) => error!(user = %user, room = name, error = %err, "failed to create room"),
    }

    if is_htmx(&headers) {
        let ctx = state.context(&session, &headers);
        return Ok(Html(rooms_table(&client, &ctx, "").await).into_response());
    }
    Ok(Redirect::to("/rooms").into_response())
}

pub(crate) async fn detail(
    State(state): State<AppState>,
    session: Session,
    headers: HeaderMap,
    Path(room_name): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Response, PageError> {
    let client = state.client(&session)?;
    let (rooms, _) = client.list_rooms(&[room_name.clone()]).await?;
    let Some(room) = rooms.into_iter().find(|room| room.name == room_name) else {
        return Ok(Redirect::to("/rooms").into_response());
    };
    let participants = client.list_participants(&room_name).await?;
    let ctx = state.context(&session, &headers);
    let table = participants_table(&ctx, &room.name, &participants);

    if query.partial.is_some() || is_htmx(&headers) {
        return Ok(Html(table).into_response());
    }

    let token_action = pages::path(&["rooms", &room.name, "token"]);
    let delete_action = pages::path(&["rooms", &room.name, "delete"]);
    let csrf = pages::csrf_field(&ctx.csrf_token);
    let body = format!(
        r#"<section class="panel"><h2>Room {name}</h2>
<table><tbody>
<tr><th>SID</th><td>{sid}</td></tr>
<tr><th>Created</th><td>{created}</td></tr>
<tr><th>Participants</th><td>{participants} / {max}</td></tr>
<tr><th>Publishers</th><td>{publishers}</td></tr>
<tr><th>Empty timeout</th><td>{timeout}s</td></tr>
<tr><th>Recording</th><td>{recording}</td></tr>
<tr><th>Metadata</th><td>{metadata}</td></tr>
</tbody></table>
<p><form method="post" action="{delete_action}" class="inline">{csrf}<button type="submit" class="danger">Close room</button></form> <a href="/rooms">Back to rooms</a></p></section>
<section class="panel"><h2>Participants</h2><div id="participants">{table}</div></section>
<section class="panel"><h2>Join token</h2>
<form method="post" action="{token_action}" class="stack">{csrf}
<label>Identity<input name="identity" required></label>
<label>Display name<input name="participant_name"></label>
<label>TTL (seconds)<input name="ttl" type="number" min="60" value="{DEFAULT_TOKEN_TTL_SECS}"></label>
<label class="check"><input type="checkbox" name="can_publish" checked> Can publish</label>
<label class="check"><input type="checkbox" name="can_subscribe" checked> Can subscribe</label>
<button type="submit">Generate token</button></form></section>"#,
        name = pages::escape_html(&room.name),
        sid = pages::escape_html(&room.sid),
        created = pages::format_epoch_seconds(room.creation_time),
        participants = room.num_participants,
        max = if room.max_participants == 0 {
            "unlimited".to_string()
        } else {
            room.max_participants.to_string()
        },
        publishers = room.num_publishers,
        timeout = room.empty_timeout,
        recording = if room.active_recording { "active" } else { "off" },
        metadata = pages::escape_html(&room.metadata),
    );
    Ok(pages::layout(&ctx, "/rooms", &room.name, &body).into_response())
}

pub(crate) async fn delete(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    session: Session,
    headers: HeaderMap,
    Path(room_name): Path<String>,
    Form(form): Form<TokenOnly>,
) -> Result<Response, PageError> {
    CsrfGuard::validate(&session, form.csrf_token.as_deref())?;
    let client = state.client(&session)?;

    match client.delete_room(&room_name).await {
        Ok(()) => info!(user = %user, room = %room_name, "room deleted"),
        Err(err) => error!(user = %user, room = %room_name, error = %err, "failed to delete room"),
    }

    if is_htmx(&headers) {
        let ctx = state.context(&session, &headers);
        return Ok(Html(rooms_table(&client, &ctx, "").await).into_response());
    }
    Ok(Redirect::to("/rooms").into_response())
}

/// Responds with the token as plain text so it can be copied directly.
pub(crate) async fn token(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    session: Session,
    Path(room_name): Path<String>,
    Form(form): Form<TokenForm>,
) -> Result<Response, PageError> {
    CsrfGuard::validate(&session, form.csrf_token.as_deref())?;
    let client = state.client(&session)?;
    let room_path = pages::path(&["rooms", &room_name]);

    let identity = form.identity.trim();
    if identity.is_empty() {
        return Ok(Redirect::to(&room_path).into_response());
    }
    let request = TokenRequest {
        room: room_name.clone(),
        identity: identity.to_string(),
        name: non_empty(form.participant_name.as_deref()),
        ttl: Duration::from_secs(number_or(form.ttl.as_deref(), DEFAULT_TOKEN_TTL_SECS)),
        metadata: None,
        can_publish: checkbox(form.can_publish.as_deref()),
        can_subscribe: checkbox(form.can_subscribe.as_deref()),
        can_publish_data: true,
    };
    match client.generate_token(&request) {
        Ok(token) => {
            info!(user = %user, room = %room_name, identity, "issued join token");
            Ok((
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                format!("Token: {token}"),
            )
                .into_response())
        }
        Err(err) => {
            error!(room = %room_name, error = %err, "failed to generate token");
            Ok(Redirect::to(&room_path).into_response())
        }
    }
}

pub(crate) async fn kick(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    session: Session,
    Path((room_name, identity)): Path<(String, String)>,
    Form(form): Form<TokenOnly>,
) -> Result<Redirect, PageError> {
    CsrfGuard::validate(&session, form.csrf_token.as_deref())?;
    let client = state.client(&session)?;

    match client.remove_participant(&room_name, &identity).await {
        Ok(()) => info!(user = %user, room = %room_name, identity = %identity, "participant removed"),
        Err(err) => error!(room = %room_name, identity = %identity, error = %err, "failed to remove participant"),
    }
    Ok(Redirect::to(&pages::path(&["rooms", &room_name])))
}

pub(crate) async fn mute(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    session: Session,
    Path((room_name, identity)): Path<(String, String)>,
    Form(form): Form<MuteForm>,
) -> Result<Redirect, PageError> {
    CsrfGuard::validate(&session, form.csrf_token.as_deref())?;
    let client = state.client(&session)?;
    let muted = checkbox(form.muted.as_deref());

    match client
        .mute_published_track(&room_name, &identity, form.track_sid.trim(), muted)
        .await
    {
        Ok(()) => info!(
            user = %user,
            room = %room_name,
            identity = %identity,
            track = %form.track_sid,
            muted,
            "track mute updated"
        ),
        Err(err) => error!(room = %room_name, identity = %identity, error = %err, "failed to update track mute"),
    }
    Ok(Redirect::to(&pages::path(&["rooms", &room_name])))
}

/// Rooms whose name contains `search`, ignoring case.
fn filter_rooms(rooms: Vec<Room>, search: &str) -> Vec<Room> {
    if search.is_empty() {
        return rooms;
    }
    let needle = search.to_lowercase();
    rooms
        .into_iter()
        .filter(|room| room.name.to_lowercase().contains(&needle))
        .collect()
}

async fn rooms_table(client: &LiveKitClient, ctx: &RequestContext, search: &str) -> String {
    let (rooms, latency) = match client.list_rooms(&[]).await {
        Ok(listing) => listing,
        Err(err) => {
            error!(server = client.profile().id(), error = %err, "failed to list rooms");
            return pages::error_notice(&format!("Could not list rooms: {err}"));
        }
    };
    let rooms = filter_rooms(rooms, search);
    let csrf = pages::csrf_field(&ctx.csrf_token);

    let mut rows = String::new();
    for room in &rooms {
        rows.push_str(&format!(
            r#"<tr><td><a href="{href}">{name}</a></td><td>{participants}</td><td>{publishers}</td><td>{created}</td><td><form method="post" action="{delete}" class="inline">{csrf}<button type="submit" class="danger">Close</button></form></td></tr>"#,
            href = pages::path(&["rooms", &room.name]),
            name = pages::escape_html(&room.name),
            participants = room.num_participants,
            publishers = room.num_publishers,
            created = pages::format_epoch_seconds(room.creation_time),
            delete = pages::path(&["rooms", &room.name, "delete"]),
        ));
    }
    if rooms.is_empty() {
        rows.push_str(r#"<tr><td colspan="5" class="muted">No rooms</td></tr>"#);
    }

    format!(
        r#"<p class="muted">{count} room(s) · {latency:.2} ms</p>
<table><thead><tr><th>Name</th><th>Participants</th><th>Publishers</th><th>Created</th><th></th></tr></thead><tbody>{rows}</tbody></table>"#,
        count = rooms.len(),
        latency = latency.as_secs_f64() * 1000.0,
    )
}

fn participants_table(ctx: &RequestContext, room: &str, participants: &[ParticipantInfo]) -> String {
    if participants.is_empty() {
        return r#"<p class="muted">Nobody is connected.</p>"#.to_string();
    }
    let csrf = pages::csrf_field(&ctx.csrf_token);

    let mut rows = String::new();
    for participant in participants {
        let mut tracks = String::new();
        for track in &participant.tracks {
            tracks.push_str(&format!(
                r#"<div>{kind} {name} <span class="muted">{sid}</span> <form method="post" action="{action}" class="inline">{csrf}<input type="hidden" name="track_sid" value="{sid}"><input type="hidden" name="muted" value="{next}"><button type="submit">{label}</button></form></div>"#,
                kind = pages::escape_html(&enum_label(&track.kind)),
                name = pages::escape_html(&track.name),
                sid = pages::escape_html(&track.sid),
                action = pages::path(&["rooms", room, "participants", &participant.identity, "mute"]),
                next = !track.muted,
                label = if track.muted { "Unmute" } else { "Mute" },
            ));
        }
        rows.push_str(&format!(
            r#"<tr><td>{identity}</td><td>{name}</td><td>{state}</td><td>{joined}</td><td>{tracks}</td><td><form method="post" action="{kick}" class="inline">{csrf}<button type="submit" class="danger">Kick</button></form></td></tr>"#,
            identity = pages::escape_html(&participant.identity),
            name = pages::escape_html(&participant.name),
            state = pages::escape_html(&enum_label(&participant.state)),
            joined = pages::format_epoch_seconds(participant.joined_at),
            kick = pages::path(&["rooms", room, "participants", &participant.identity, "kick"]),
        ));
    }
    format!(
        "<table><thead><tr><th>Identity</th><th>Name</th><th>State</th><th>Joined</th><th>Tracks</th><th></th></tr></thead><tbody>{rows}</tbody></table>"
    )
}
