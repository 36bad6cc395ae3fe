// Request and response payloads for the client-server API endpoints we use.
// Anything the client layer does not interpret stays `serde_json::Value`.

use std::collections::BTreeMap;

use matrix_sdk::ruma::OwnedUserId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── Server discovery / auth ───────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Versions {
    pub versions: Vec<String>,
    #[serde(default)]
    pub unstable_features: BTreeMap<String, bool>,
}

#[derive(Debug, Serialize)]
pub(crate) struct LoginRequest<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub identifier: UserIdentifier<'a>,
    pub password: &'a str,
    pub initial_device_display_name: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct UserIdentifier<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub user: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LoginResponse {
    pub user_id: OwnedUserId,
    pub access_token: String,
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct RegisterRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<RegisterAuth<'a>>,
}

#[derive(Debug, Serialize)]
pub(crate) struct RegisterAuth<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub session: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RegisterResponse {
    pub user_id: OwnedUserId,
    pub access_token: String,
    #[serde(default)]
    pub device_id: Option<String>,
}

/// User-interactive auth challenge returned by `/register`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegistrationFlows {
    pub session: String,
    #[serde(default)]
    pub flows: Vec<AuthFlow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthFlow {
    #[serde(default)]
    pub stages: Vec<String>,
}

// ── Sync ──────────────────────────────────────────────────────────────────────

/// Query parameters of one `/sync` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncQuery {
    pub filter: String,
    pub timeout_ms: u64,
    pub since: Option<String>,
    pub set_presence: Option<&'static str>,
}

impl SyncQuery {
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::with_capacity(4);
        if let Some(presence) = self.set_presence {
            pairs.push(("set_presence", presence.to_owned()));
        }
        pairs.push(("filter", self.filter.clone()));
        pairs.push(("timeout", self.timeout_ms.to_string()));
        if let Some(since) = &self.since {
            pairs.push(("since", since.clone()));
        }
        pairs
    }
}

/// One parsed `/sync` response. Room contents stay opaque JSON.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SyncBatch {
    pub next_batch: String,
    #[serde(default)]
    pub rooms: Rooms,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Rooms {
    #[serde(default)]
    pub join: BTreeMap<String, Value>,
    #[serde(default)]
    pub invite: BTreeMap<String, Value>,
    #[serde(default)]
    pub leave: BTreeMap<String, Value>,
}

/// A plain `m.room.message` pulled out of a joined room's timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineMessage {
    pub room_id: String,
    pub sender: String,
    pub event_id: String,
    pub body: String,
}

impl SyncBatch {
    /// Every `m.room.message` with a non-empty body in joined rooms, in
    /// timeline order per room.
    pub fn text_messages(&self) -> Vec<TimelineMessage> {
        let mut out = Vec::new();
        for (room_id, room) in &self.rooms.join {
            let Some(events) = room.pointer("/timeline/events").and_then(Value::as_array) else {
                continue;
            };

            for event in events {
                if event.get("type").and_then(Value::as_str) != Some("m.room.message") {
                    continue;
                }
                let body = event
                    .pointer("/content/body")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if body.trim().is_empty() {
                    continue;
                }

                out.push(TimelineMessage {
                    room_id: room_id.clone(),
                    sender: str_field(event, "sender"),
                    event_id: str_field(event, "event_id"),
                    body: body.to_owned(),
                });
            }
        }
        out
    }

    /// Pagination token for history before this batch, per joined room.
    pub fn prev_batch(&self, room_id: &str) -> Option<&str> {
        self.rooms
            .join
            .get(room_id)?
            .pointer("/timeline/prev_batch")
            .and_then(Value::as_str)
    }
}

fn str_field(event: &Value, key: &str) -> String {
    event
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}

#[derive(Debug, Deserialize)]
pub(crate) struct FilterIdResponse {
    pub filter_id: String,
}

// ── Rooms & messages ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Messages {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub chunk: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    File,
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub size: u64,
    pub mimetype: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaContent {
    pub body: String,
    pub url: String,
    pub info: MediaInfo,
}

/// Content of an outgoing `m.room.message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msgtype")]
pub enum MessageContent {
    #[serde(rename = "m.text")]
    Text { body: String },
    #[serde(rename = "m.emote")]
    Emote { body: String },
    #[serde(rename = "m.image")]
    Image(MediaContent),
    #[serde(rename = "m.file")]
    File(MediaContent),
    #[serde(rename = "m.audio")]
    Audio(MediaContent),
    #[serde(rename = "m.video")]
    Video(MediaContent),
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text { body: body.into() }
    }

    pub fn emote(body: impl Into<String>) -> Self {
        Self::Emote { body: body.into() }
    }

    /// Message pointing at media that has already been uploaded.
    pub fn media(kind: MediaKind, media: &UploadedMedia) -> Self {
        let content = MediaContent {
            body: media.filename.clone(),
            url: media.content_uri.clone(),
            info: MediaInfo {
                size: media.size,
                mimetype: media.mimetype.clone(),
            },
        };
        match kind {
            MediaKind::Image => Self::Image(content),
            MediaKind::File => Self::File(content),
            MediaKind::Audio => Self::Audio(content),
            MediaKind::Video => Self::Video(content),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventIdResponse {
    pub event_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RoomIdResponse {
    pub room_id: String,
}

/// Result of a successful `send_message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub room_id: String,
    pub event_id: String,
    pub txn_id: u64,
}

/// A completed media upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedMedia {
    pub content_uri: String,
    pub mimetype: String,
    pub size: u64,
    pub filename: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomVisibility {
    Public,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomPreset {
    PrivateChat,
    PublicChat,
    TrustedPrivateChat,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CreateRoomRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_alias_name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub invite: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility: Option<RoomVisibility>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preset: Option<RoomPreset>,
}

impl CreateRoomRequest {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }
}

// ── Profile / notifications ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub displayname: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Notifications {
    #[serde(default)]
    pub notifications: Vec<Value>,
    #[serde(default)]
    pub next_token: Option<String>,
}
