//! Client for the LiveKit server management API (Twirp over JSON) and
//! access-token signing.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::config::ServerProfile;

const ADMIN_TOKEN_TTL: Duration = Duration::from_secs(10 * 60);
const ROOM_SERVICE: &str = "livekit.RoomService";
const EGRESS_SERVICE: &str = "livekit.Egress";
const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("invalid server url '{0}'")]
    InvalidUrl(String),
    #[error("{method} request failed: {source}")]
    Request {
        method: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{method} returned {status}: {body}")]
    Status {
        method: &'static str,
        status: StatusCode,
        body: String,
    },
    #[error("failed to decode {method} response: {source}")]
    Decode {
        method: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to sign access token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
}

/// Permissions carried in the `video` claim of a LiveKit access token.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VideoGrant {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub room_create: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub room_list: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub room_admin: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub room_join: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub room_record: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_publish: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_subscribe: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_publish_data: Option<bool>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sub: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    jti: Option<&'a str>,
    nbf: u64,
    exp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a str>,
    video: &'a VideoGrant,
}

/// Join token parameters for a participant.
#[derive(Debug, Clone)]
pub struct TokenRequest {
    pub room: String,
    pub identity: String,
    pub name: Option<String>,
    pub ttl: Duration,
    pub metadata: Option<String>,
    pub can_publish: bool,
    pub can_subscribe: bool,
    pub can_publish_data: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateRoomRequest {
    pub name: String,
    pub max_participants: u32,
    pub empty_timeout: u32,
    pub metadata: String,
}

#[derive(Debug, Clone)]
pub struct RoomCompositeEgressRequest {
    pub room_name: String,
    pub filepath: String,
    pub layout: String,
    pub audio_only: bool,
    pub video_only: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Room {
    pub sid: String,
    pub name: String,
    pub empty_timeout: u32,
    pub max_participants: u32,
    #[serde(deserialize_with = "lenient_i64")]
    pub creation_time: i64,
    pub num_participants: u32,
    pub num_publishers: u32,
    pub metadata: String,
    pub active_recording: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TrackInfo {
    pub sid: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: Value,
    pub source: Value,
    pub muted: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ParticipantInfo {
    pub sid: String,
    pub identity: String,
    pub name: String,
    pub state: Value,
    #[serde(deserialize_with = "lenient_i64")]
    pub joined_at: i64,
    pub metadata: String,
    pub is_publisher: bool,
    pub tracks: Vec<TrackInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EgressInfo {
    pub egress_id: String,
    pub room_name: String,
    pub status: Value,
    #[serde(deserialize_with = "lenient_i64")]
    pub started_at: i64,
    #[serde(deserialize_with = "lenient_i64")]
    pub ended_at: i64,
    pub error: String,
}

#[derive(Debug, Default, Deserialize)]
struct ListRoomsResponse {
    #[serde(default)]
    rooms: Vec<Room>,
}

#[derive(Debug, Default, Deserialize)]
struct ListParticipantsResponse {
    #[serde(default)]
    participants: Vec<ParticipantInfo>,
}

#[derive(Debug, Default, Deserialize)]
struct ListEgressResponse {
    #[serde(default)]
    items: Vec<EgressInfo>,
}

#[derive(Debug, Default, Deserialize)]
struct Empty {}

/// Protobuf JSON renders 64-bit integers as strings.
fn lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(number) => Ok(number.as_i64().unwrap_or_default()),
        Value::String(raw) => raw.trim().parse().map_err(serde::de::Error::custom),
        Value::Null => Ok(0),
        other => Err(serde::de::Error::custom(format!(
            "expected integer, got {other}"
        ))),
    }
}

/// Display label for a protobuf enum that may arrive as a name or a number.
pub fn enum_label(value: &Value) -> String {
    match value {
        Value::String(name) => name.clone(),
        Value::Number(number) => number.to_string(),
        Value::Null => "UNKNOWN".to_string(),
        other => other.to_string(),
    }
}

/// Management API client bound to one configured server.
#[derive(Debug, Clone)]
pub struct LiveKitClient {
    http: Client,
    profile: ServerProfile,
    api_base: String,
}

impl LiveKitClient {
    pub fn new(http: Client, profile: &ServerProfile) -> Result<Self, UpstreamError> {
        let api_base = api_base_url(profile.url())?;
        Ok(Self {
            http,
            profile: profile.clone(),
            api_base,
        })
    }

    pub fn url(&self) -> &str {
        self.profile.url()
    }

    pub fn sip_enabled(&self) -> bool {
        self.profile.sip_enabled()
    }

    pub fn profile(&self) -> &ServerProfile {
        &self.profile
    }

    pub async fn list_rooms(&self, names: &[String]) -> Result<(Vec<Room>, Duration), UpstreamError> {
        let started = Instant::now();
        let response: ListRoomsResponse = self
            .twirp(
                ROOM_SERVICE,
                "ListRooms",
                VideoGrant {
                    room_list: true,
                    ..VideoGrant::default()
                },
                &json!({ "names": names }),
            )
            .await?;
        Ok((response.rooms, started.elapsed()))
    }

    pub async fn create_room(&self, request: &CreateRoomRequest) -> Result<Room, UpstreamError> {
        self.twirp(
            ROOM_SERVICE,
            "CreateRoom",
            VideoGrant {
                room_create: true,
                ..VideoGrant::default()
            },
            request,
        )
        .await
    }

    pub async fn delete_room(&self, room: &str) -> Result<(), UpstreamError> {
        let _: Empty = self
            .twirp(
                ROOM_SERVICE,
                "DeleteRoom",
                VideoGrant {
                    room_create: true,
                    ..VideoGrant::default()
                },
                &json!({ "room": room }),
            )
            .await?;
        Ok(())
    }

    pub async fn list_participants(&self, room: &str) -> Result<Vec<ParticipantInfo>, UpstreamError> {
        let response: ListParticipantsResponse = self
            .twirp(
                ROOM_SERVICE,
                "ListParticipants",
                room_admin_grant(room),
                &json!({ "room": room }),
            )
            .await?;
        Ok(response.participants)
    }

    pub async fn remove_participant(&self, room: &str, identity: &str) -> Result<(), UpstreamError> {
        let _: Empty = self
            .twirp(
                ROOM_SERVICE,
                "RemoveParticipant",
                room_admin_grant(room),
                &json!({ "room": room, "identity": identity }),
            )
            .await?;
        Ok(())
    }

    pub async fn mute_published_track(
        &self,
        room: &str,
        identity: &str,
        track_sid: &str,
        muted: bool,
    ) -> Result<(), UpstreamError> {
        let _: Value = self
            .twirp(
                ROOM_SERVICE,
                "MutePublishedTrack",
                room_admin_grant(room),
                &json!({
                    "room": room,
                    "identity": identity,
                    "track_sid": track_sid,
                    "muted": muted,
                }),
            )
            .await?;
        Ok(())
    }

    pub async fn list_egress(&self, active: bool) -> Result<Vec<EgressInfo>, UpstreamError> {
        let response: ListEgressResponse = self
            .twirp(
                EGRESS_SERVICE,
                "ListEgress",
                record_grant(),
                &json!({ "active": active }),
            )
            .await?;
        Ok(response.items)
    }

    pub async fn start_room_composite_egress(
        &self,
        request: &RoomCompositeEgressRequest,
    ) -> Result<EgressInfo, UpstreamError> {
        self.twirp(
            EGRESS_SERVICE,
            "StartRoomCompositeEgress",
            record_grant(),
            &json!({
                "room_name": request.room_name,
                "layout": request.layout,
                "audio_only": request.audio_only,
                "video_only": request.video_only,
                "file_outputs": [{ "filepath": request.filepath }],
            }),
        )
        .await
    }

    pub async fn stop_egress(&self, egress_id: &str) -> Result<EgressInfo, UpstreamError> {
        self.twirp(
            EGRESS_SERVICE,
            "StopEgress",
            record_grant(),
            &json!({ "egress_id": egress_id }),
        )
        .await
    }

    /// Participant join token signed with this server's API secret.
    pub fn generate_token(&self, request: &TokenRequest) -> Result<String, UpstreamError> {
        let grant = VideoGrant {
            room: Some(request.room.clone()),
            room_join: true,
            can_publish: Some(request.can_publish),
            can_subscribe: Some(request.can_subscribe),
            can_publish_data: Some(request.can_publish_data),
            ..VideoGrant::default()
        };
        self.sign(
            Some(&request.identity),
            request.name.as_deref(),
            request.metadata.as_deref(),
            &grant,
            request.ttl,
        )
    }

    fn sign(
        &self,
        identity: Option<&str>,
        name: Option<&str>,
        metadata: Option<&str>,
        grant: &VideoGrant,
        ttl: Duration,
    ) -> Result<String, UpstreamError> {
        let now = now_epoch_seconds();
        let claims = Claims {
            iss: self.profile.api_key(),
            sub: identity,
            jti: identity,
            nbf: now,
            exp: now.saturating_add(ttl.as_secs()),
            name: name.filter(|value| !value.is_empty()),
            metadata: metadata.filter(|value| !value.is_empty()),
            video: grant,
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.profile.api_secret().as_bytes()),
        )?;
        Ok(token)
    }

    async fn twirp<B, T>(
        &self,
        service: &'static str,
        method: &'static str,
        grant: VideoGrant,
        body: &B,
    ) -> Result<T, UpstreamError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let token = self.sign(None, None, None, &grant, ADMIN_TOKEN_TTL)?;
        let endpoint = format!("{}/twirp/{service}/{method}", self.api_base);
        debug!(server = self.profile.id(), method, "calling LiveKit API");

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|source| UpstreamError::Request { method, source })?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|source| UpstreamError::Request { method, source })?;

        if !status.is_success() {
            return Err(UpstreamError::Status {
                method,
                status,
                body: text.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        let text = if text.trim().is_empty() { "{}" } else { text.as_str() };
        serde_json::from_str(text).map_err(|source| UpstreamError::Decode { method, source })
    }
}

fn room_admin_grant(room: &str) -> VideoGrant {
    VideoGrant {
        room: Some(room.to_string()),
        room_admin: true,
        ..VideoGrant::default()
    }
}

fn record_grant() -> VideoGrant {
    VideoGrant {
        room_record: true,
        ..VideoGrant::default()
    }
}

/// Maps the configured signalling url to the HTTP base of the management API.
pub fn api_base_url(raw: &str) -> Result<String, UpstreamError> {
    let mut url = Url::parse(raw.trim()).map_err(|_| UpstreamError::InvalidUrl(raw.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        _ => return Err(UpstreamError::InvalidUrl(raw.to_string())),
    };
    if url.host_str().is_none() || url.set_scheme(scheme).is_err() {
        return Err(UpstreamError::InvalidUrl(raw.to_string()));
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.as_str().trim_end_matches('/').to_string())
}

fn now_epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use axum::{
        Json, Router,
        extract::Path,
        http::{HeaderMap, StatusCode},
        routing::post,
    };
    use jsonwebtoken::{Algorithm, DecodingKey, Validation};
    use serde_json::{Value, json};

    use super::{
        CreateRoomRequest, LiveKitClient, TokenRequest, UpstreamError, api_base_url, enum_label,
    };
    use crate::config::test_profile;
    use crate::config::{ServerProfile, ServerProfileFields};

    #[test]
    fn api_base_maps_websocket_schemes() {
        assert_eq!(
            api_base_url("wss://lk.example.com").expect("wss"),
            "https://lk.example.com"
        );
        assert_eq!(
            api_base_url("ws://127.0.0.1:7880/").expect("ws"),
            "http://127.0.0.1:7880"
        );
        assert_eq!(
            api_base_url("https://lk.example.com/prefix/").expect("https"),
            "https://lk.example.com/prefix"
        );
        assert!(matches!(
            api_base_url("ftp://lk.example.com"),
            Err(UpstreamError::InvalidUrl(_))
        ));
        assert!(api_base_url("not a url").is_err());
    }

    #[test]
    fn generated_token_carries_join_grant() {
        let profile = test_profile("eu", false);
        let client = LiveKitClient::new(reqwest::Client::new(), &profile).expect("client");
        let token = client
            .generate_token(&TokenRequest {
                room: "standup".to_string(),
                identity: "alice".to_string(),
                name: Some("Alice".to_string()),
                ttl: Duration::from_secs(3600),
                metadata: None,
                can_publish: true,
                can_subscribe: false,
                can_publish_data: true,
            })
            .expect("token");

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::from(["exp".to_string()]);
        let decoded = jsonwebtoken::decode::<Value>(
            &token,
            &DecodingKey::from_secret(profile.api_secret().as_bytes()),
            &validation,
        )
        .expect("token should verify with the api secret");

        let claims = decoded.claims;
        assert_eq!(claims["iss"], "key");
        assert_eq!(claims["sub"], "alice");
        assert_eq!(claims["name"], "Alice");
        assert!(claims.get("metadata").is_none());
        assert_eq!(claims["video"]["room"], "standup");
        assert_eq!(claims["video"]["roomJoin"], true);
        assert_eq!(claims["video"]["canPublish"], true);
        assert_eq!(claims["video"]["canSubscribe"], false);
        assert_eq!(claims["video"]["canPublishData"], true);
        assert!(claims["video"].get("roomAdmin").is_none());
        let lifetime = claims["exp"].as_u64().unwrap_or_default()
            - claims["nbf"].as_u64().unwrap_or_default();
        assert_eq!(lifetime, 3600);
    }

    #[test]
    fn enum_labels_accept_names_and_numbers() {
        assert_eq!(enum_label(&json!("EGRESS_ACTIVE")), "EGRESS_ACTIVE");
        assert_eq!(enum_label(&json!(1)), "1");
        assert_eq!(enum_label(&Value::Null), "UNKNOWN");
    }

    #[tokio::test]
    async fn twirp_calls_are_authorized_and_decoded() {
        let base = spawn_room_service().await;
        let profile = ServerProfile::new(ServerProfileFields {
            id: "local".to_string(),
            name: "Local".to_string(),
            url: base.replace("http://", "ws://"),
            api_key: "devkey".to_string(),
            api_secret: "devsecret-devsecret-devsecret-00".to_string(),
            sip_enabled: false,
            description: None,
        })
        .expect("profile");
        let client = LiveKitClient::new(reqwest::Client::new(), &profile).expect("client");

        let (rooms, _latency) = client.list_rooms(&[]).await.expect("list rooms");
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].name, "standup");
        assert_eq!(rooms[0].creation_time, 1_700_000_000);
        assert_eq!(rooms[0].num_participants, 2);

        let created = client
            .create_room(&CreateRoomRequest {
                name: "new-room".to_string(),
                max_participants: 10,
                empty_timeout: 300,
                metadata: String::new(),
            })
            .await
            .expect("create room");
        assert_eq!(created.name, "new-room");
        assert_eq!(created.max_participants, 10);

        client.delete_room("standup").await.expect("delete room");

        let err = client
            .remove_participant("standup", "ghost")
            .await
            .expect_err("unknown participant should fail");
        assert!(matches!(
            err,
            UpstreamError::Status {
                status: StatusCode::NOT_FOUND,
                ..
            }
        ));
    }

    async fn spawn_room_service() -> String {
        let app = Router::new().route(
            "/twirp/livekit.RoomService/{method}",
            post(
                |Path(method): Path<String>, headers: HeaderMap, Json(body): Json<Value>| async move {
                    let authorized = headers
                        .get("authorization")
                        .and_then(|value| value.to_str().ok())
                        .is_some_and(|value| value.starts_with("Bearer "));
                    if !authorized {
                        return (StatusCode::UNAUTHORIZED, Json(json!({"code": "unauthenticated"})));
                    }
                    match method.as_str() {
                        "ListRooms" => (
                            StatusCode::OK,
                            Json(json!({"rooms": [{
                                "sid": "RM_1",
                                "name": "standup",
                                "creation_time": "1700000000",
                                "num_participants": 2
                            }]})),
                        ),
                        "CreateRoom" => (
                            StatusCode::OK,
                            Json(json!({
                                "sid": "RM_2",
                                "name": body["name"],
                                "max_participants": body["max_participants"],
                                "empty_timeout": body["empty_timeout"]
                            })),
                        ),
                        "DeleteRoom" => (StatusCode::OK, Json(json!({}))),
                        _ => (
                            StatusCode::NOT_FOUND,
                            Json(json!({"code": "not_found", "msg": "participant not found"})),
                        ),
                    }
                },
            ),
        );

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
            .await
            .expect("bind room service listener");
        let addr = listener.local_addr().expect("room service addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }
}
