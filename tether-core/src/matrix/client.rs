use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use futures::StreamExt;
use matrix_sdk::ruma::{EventId, MxcUri, RoomId, RoomOrAliasId, UserId};
use reqwest::{header::CONTENT_TYPE, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::matrix::{
    config::ClientConfig,
    error::{classify_failure, decode_response, is_error_status, MatrixError},
    session::{normalize_user_id, Session},
    settings::SettingsStore,
    txn::TransactionIds,
    types::{
        CreateRoomRequest, EventIdResponse, FilterIdResponse, LoginRequest, LoginResponse,
        MessageContent, Messages, Notifications, Profile, RegisterAuth, RegisterRequest,
        RegisterResponse, RegistrationFlows, RoomIdResponse, SentMessage, SyncQuery,
        UploadedMedia, UserIdentifier, Versions,
    },
};

const CLIENT_API: &[&str] = &["_matrix", "client", "v3"];
const MEDIA_API: &[&str] = &["_matrix", "media", "v3"];

/// Status and body of a completed request, before classification.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: Bytes,
}

impl RawResponse {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, MatrixError> {
        decode_response(self.status, &self.body)
    }

    /// For endpoints whose success body carries nothing we need.
    pub fn ensure_success(&self) -> Result<(), MatrixError> {
        if is_error_status(self.status) {
            return Err(classify_failure(self.status, &self.body));
        }
        Ok(())
    }
}

/// Outcome of a registration attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered(Session),
    /// The server wants another user-interactive auth stage first.
    FlowRequired(RegistrationFlows),
}

/// Handle to one homeserver before any account is logged in.
///
/// Shares its HTTP transport with every [`SessionClient`] built from it.
#[derive(Debug, Clone)]
pub struct HomeserverClient {
    http: reqwest::Client,
    config: Arc<ClientConfig>,
}

impl HomeserverClient {
    pub fn new(config: ClientConfig) -> Result<Self, MatrixError> {
        if config.allow_insecure_connections {
            warn!("insecure connections are allowed: TLS errors will be ignored");
        }

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(config.allow_insecure_connections)
            .build()?;

        Ok(Self {
            http,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn homeserver(&self) -> &Url {
        &self.config.homeserver
    }

    /// Check the server speaks the client-server API at all.
    pub async fn versions(&self) -> Result<Versions, MatrixError> {
        let url = endpoint(self.homeserver(), &["_matrix", "client"], &["versions"]);
        let raw = execute(self.http.get(url)).await?;

        if raw.status == 404 {
            return Err(MatrixError::EndpointNotFound("versions"));
        }
        raw.decode()
    }

    /// Password login. `username` may be a full MXID or a bare localpart.
    pub async fn login(&self, username: &str, password: &str) -> Result<Session, MatrixError> {
        let user_id = normalize_user_id(username, self.homeserver())?;
        let display_name = device_display_name();

        let body = LoginRequest {
            kind: "m.login.password",
            identifier: UserIdentifier {
                kind: "m.id.user",
                user: user_id.as_str(),
            },
            password,
            initial_device_display_name: &display_name,
        };

        let url = endpoint(self.homeserver(), CLIENT_API, &["login"]);
        let raw = execute(self.http.post(url).json(&body)).await?;

        match raw.status {
            403 => return Err(MatrixError::WrongCredentials),
            404 => return Err(MatrixError::EndpointNotFound("login")),
            _ => {}
        }

        let resp: LoginResponse = raw.decode()?;
        info!("logged in as {}", resp.user_id);

        Ok(Session::new(
            self.homeserver().clone(),
            resp.user_id,
            resp.access_token,
            resp.device_id,
        ))
    }

    /// Register a new account.
    ///
    /// Pass the session id of a completed recaptcha stage to finish a
    /// user-interactive flow started by an earlier call.
    pub async fn register(
        &self,
        username: &str,
        password: &str,
        recaptcha_session: Option<&str>,
    ) -> Result<RegisterOutcome, MatrixError> {
        let body = RegisterRequest {
            username,
            password,
            auth: recaptcha_session.map(|session| RegisterAuth {
                kind: "m.login.recaptcha",
                session,
            }),
        };

        let url = endpoint(self.homeserver(), CLIENT_API, &["register"]);
        let raw = execute(self.http.post(url).json(&body)).await?;

        if let Ok(resp) = serde_json::from_slice::<RegisterResponse>(&raw.body) {
            info!("registered {}", resp.user_id);
            return Ok(RegisterOutcome::Registered(Session::new(
                self.homeserver().clone(),
                resp.user_id,
                resp.access_token,
                resp.device_id,
            )));
        }

        if let Ok(flows) = serde_json::from_slice::<RegistrationFlows>(&raw.body) {
            debug!("registration needs auth flow, session {}", flows.session);
            return Ok(RegisterOutcome::FlowRequired(flows));
        }

        if is_error_status(raw.status) {
            return Err(classify_failure(raw.status, &raw.body));
        }
        Err(MatrixError::UnexpectedResponse(
            "register response is neither a session nor an auth flow".into(),
        ))
    }

    /// Bind a session to this transport. `settings` backs the transaction
    /// id counter.
    pub fn session(&self, session: Session, settings: Arc<dyn SettingsStore>) -> SessionClient {
        SessionClient {
            http: self.http.clone(),
            session: Arc::new(session),
            txn: Arc::new(TransactionIds::load(settings)),
            cancel: CancellationToken::new(),
        }
    }
}

/// Authenticated handle for one logged-in account.
///
/// Cheap to clone; clones share the session, the transaction counter and
/// the cancellation token. After [`cancel`](Self::cancel) every in-flight
/// and future request resolves to [`MatrixError::Cancelled`].
#[derive(Debug, Clone)]
pub struct SessionClient {
    http: reqwest::Client,
    session: Arc<Session>,
    txn: Arc<TransactionIds>,
    cancel: CancellationToken,
}

impl SessionClient {
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn user_id(&self) -> &UserId {
        &self.session.user_id
    }

    pub fn next_transaction_id(&self) -> u64 {
        self.txn.next()
    }

    pub fn transaction_ids(&self) -> &TransactionIds {
        &self.txn
    }

    /// Drop every outstanding and future response of this session.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called on any clone.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub async fn logout(&self) -> Result<(), MatrixError> {
        let raw = self
            .send(self.http.post(self.client_url(&["logout"])).json(&json!({})))
            .await?;

        if raw.status != 200 {
            warn!("logout failed with HTTP {}", raw.status);
            return Err(classify_failure(raw.status, &raw.body));
        }

        self.txn.reset();
        info!("logged out {}", self.session.user_id);
        Ok(())
    }

    /// One raw `/sync` round. Classification is left to the caller.
    pub async fn sync_request(&self, query: &SyncQuery) -> Result<RawResponse, MatrixError> {
        let req = self
            .http
            .get(self.client_url(&["sync"]))
            .query(&query.to_pairs());
        self.send(req).await
    }

    /// Register a filter definition and return its server id.
    pub async fn upload_filter(
        &self,
        definition: &Map<String, Value>,
    ) -> Result<String, MatrixError> {
        let url = self.client_url(&["user", self.session.user_id.as_str(), "filter"]);

        let resp: FilterIdResponse = self
            .send(self.http.post(url).json(definition))
            .await?
            .decode()?;
        debug!("filter with id {} created", resp.filter_id);
        Ok(resp.filter_id)
    }

    /// Page backwards through a room's history from `from`.
    pub async fn messages(
        &self,
        room_id: &str,
        from: &str,
        limit: u32,
    ) -> Result<Messages, MatrixError> {
        let room_id = parse_room_id(room_id)?;
        let req = self
            .http
            .get(self.client_url(&["rooms", room_id.as_str(), "messages"]))
            .query(&[("from", from), ("dir", "b")])
            .query(&[("limit", limit)]);

        self.send(req).await?.decode()
    }

    pub async fn send_message(
        &self,
        room_id: &str,
        txn_id: u64,
        content: &MessageContent,
    ) -> Result<SentMessage, MatrixError> {
        let room = parse_room_id(room_id)?;
        let txn = txn_id.to_string();
        let url = self.client_url(&["rooms", room.as_str(), "send", "m.room.message", &txn]);

        let resp: EventIdResponse = self.send(self.http.put(url).json(content)).await?.decode()?;
        Ok(SentMessage {
            room_id: room.to_string(),
            event_id: resp.event_id,
            txn_id,
        })
    }

    /// Upload media. The mime type is the caller's responsibility.
    pub async fn upload(
        &self,
        data: impl Into<Bytes>,
        mimetype: &str,
        filename: &str,
    ) -> Result<UploadedMedia, MatrixError> {
        let data: Bytes = data.into();
        let size = data.len() as u64;
        let req = self
            .http
            .post(endpoint(&self.session.homeserver, MEDIA_API, &["upload"]))
            .query(&[("filename", filename)])
            .header(CONTENT_TYPE, mimetype)
            .body(data);

        let raw = self.send(req).await?;
        raw.ensure_success()?;

        if raw.body.is_empty() {
            return Err(MatrixError::UnexpectedResponse(
                "media upload: empty response".into(),
            ));
        }
        let Ok(Value::Object(obj)) = serde_json::from_slice::<Value>(&raw.body) else {
            return Err(MatrixError::UnexpectedResponse(
                "media upload: invalid response".into(),
            ));
        };
        let Some(content_uri) = obj.get("content_uri").and_then(Value::as_str) else {
            return Err(MatrixError::UnexpectedResponse(
                "media upload: missing 'content_uri'".into(),
            ));
        };

        Ok(UploadedMedia {
            content_uri: content_uri.to_owned(),
            mimetype: mimetype.to_owned(),
            size,
            filename: filename.to_owned(),
        })
    }

    /// Upload a file from disk under its own file name.
    pub async fn upload_file(&self, path: &Path, mimetype: &str) -> Result<UploadedMedia, MatrixError> {
        let data = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_owned());
        self.upload(data, mimetype, &filename).await
    }

    pub async fn download(&self, mxc: &str) -> Result<Bytes, MatrixError> {
        let (server, media_id) = media_parts(mxc)?;
        let url = endpoint(
            &self.session.homeserver,
            MEDIA_API,
            &["download", &server, &media_id],
        );

        let raw = self.send(self.http.get(url)).await?;
        raw.ensure_success()?;
        Ok(raw.body)
    }

    /// Stream media to `dest`. Returns the number of bytes written.
    ///
    /// Bytes land in a `.part` file next to `dest`, which is renamed into
    /// place only once the whole body has arrived. On failure or
    /// cancellation the partial file is removed and `dest` is untouched.
    pub async fn download_to(&self, mxc: &str, dest: &Path) -> Result<u64, MatrixError> {
        let (server, media_id) = media_parts(mxc)?;
        let url = endpoint(
            &self.session.homeserver,
            MEDIA_API,
            &["download", &server, &media_id],
        );
        let req = self.authed(self.http.get(url));
        let part = partial_path(dest);

        let result = self
            .cancellable(async {
                let resp = req.send().await?;
                let status = resp.status().as_u16();
                if is_error_status(status) {
                    let body = resp.bytes().await?;
                    return Err(classify_failure(status, &body));
                }

                let mut file = tokio::fs::File::create(&part).await?;
                let mut stream = resp.bytes_stream();
                let mut written = 0u64;
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk?;
                    file.write_all(&chunk).await?;
                    written += chunk.len() as u64;
                }
                file.flush().await?;
                file.sync_all().await?;
                Ok::<u64, MatrixError>(written)
            })
            .await;

        match result {
            Ok(written) => {
                if let Err(e) = tokio::fs::rename(&part, dest).await {
                    discard_partial(&part).await;
                    return Err(e.into());
                }
                debug!("downloaded {written} bytes to {}", dest.display());
                Ok(written)
            }
            Err(e) => {
                discard_partial(&part).await;
                Err(e)
            }
        }
    }

    /// Server-side cropped thumbnail.
    pub async fn thumbnail(&self, mxc: &str, width: u32, height: u32) -> Result<Bytes, MatrixError> {
        let (server, media_id) = media_parts(mxc)?;
        let req = self
            .http
            .get(endpoint(
                &self.session.homeserver,
                MEDIA_API,
                &["thumbnail", &server, &media_id],
            ))
            .query(&[("width", width), ("height", height)])
            .query(&[("method", "crop")]);

        let raw = self.send(req).await?;
        raw.ensure_success()?;
        Ok(raw.body)
    }

    /// Join by room id or alias. Returns the joined room's id.
    pub async fn join_room(&self, room_id_or_alias: &str) -> Result<String, MatrixError> {
        let target = RoomOrAliasId::parse(room_id_or_alias.trim())
            .map_err(|e| MatrixError::InvalidRoomId(format!("{room_id_or_alias}: {e}")))?;

        let resp: RoomIdResponse = self
            .send(
                self.http
                    .post(self.client_url(&["join", target.as_str()]))
                    .json(&json!({})),
            )
            .await?
            .decode()?;

        info!("joined {}", resp.room_id);
        Ok(resp.room_id)
    }

    pub async fn leave_room(&self, room_id: &str) -> Result<(), MatrixError> {
        let room = parse_room_id(room_id)?;
        self.send(
            self.http
                .post(self.client_url(&["rooms", room.as_str(), "leave"]))
                .json(&json!({})),
        )
        .await?
        .ensure_success()
    }

    pub async fn invite_user(&self, room_id: &str, user_id: &str) -> Result<(), MatrixError> {
        let room = parse_room_id(room_id)?;
        let user = UserId::parse(user_id.trim())
            .map_err(|e| MatrixError::InvalidUserId(format!("{user_id}: {e}")))?;

        self.send(
            self.http
                .post(self.client_url(&["rooms", room.as_str(), "invite"]))
                .json(&json!({ "user_id": user.as_str() })),
        )
        .await?
        .ensure_success()
    }

    /// Create a room. Returns its id.
    pub async fn create_room(&self, request: &CreateRoomRequest) -> Result<String, MatrixError> {
        let resp: RoomIdResponse = self
            .send(self.http.post(self.client_url(&["createRoom"])).json(request))
            .await?
            .decode()?;

        info!("created {}", resp.room_id);
        Ok(resp.room_id)
    }

    pub async fn set_typing(&self, room_id: &str, timeout: Duration) -> Result<(), MatrixError> {
        self.typing(
            room_id,
            json!({
                "typing": true,
                "timeout": u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        )
        .await
    }

    pub async fn clear_typing(&self, room_id: &str) -> Result<(), MatrixError> {
        self.typing(room_id, json!({ "typing": false })).await
    }

    async fn typing(&self, room_id: &str, body: Value) -> Result<(), MatrixError> {
        let room = parse_room_id(room_id)?;
        let url = self.client_url(&["rooms", room.as_str(), "typing", self.session.user_id.as_str()]);
        self.send(self.http.put(url).json(&body))
            .await?
            .ensure_success()
    }

    /// Move both the fully-read marker and the read receipt to `event_id`.
    pub async fn read_event(&self, room_id: &str, event_id: &str) -> Result<(), MatrixError> {
        let room = parse_room_id(room_id)?;
        let event = parse_event_id(event_id)?;

        self.send(
            self.http
                .post(self.client_url(&["rooms", room.as_str(), "read_markers"]))
                .json(&json!({ "m.fully_read": event.as_str(), "m.read": event.as_str() })),
        )
        .await?
        .ensure_success()
    }

    /// Redact an event. Returns the id of the redaction event.
    pub async fn redact_event(&self, room_id: &str, event_id: &str) -> Result<String, MatrixError> {
        let room = parse_room_id(room_id)?;
        let event = parse_event_id(event_id)?;
        let txn = self.txn.next().to_string();
        let url = self.client_url(&["rooms", room.as_str(), "redact", event.as_str(), &txn]);

        let resp: EventIdResponse = self
            .send(self.http.put(url).json(&json!({})))
            .await?
            .decode()?;
        Ok(resp.event_id)
    }

    pub async fn notifications(&self, limit: u32) -> Result<Notifications, MatrixError> {
        let req = self
            .http
            .get(self.client_url(&["notifications"]))
            .query(&[("limit", limit)]);
        self.send(req).await?.decode()
    }

    pub async fn own_profile(&self) -> Result<Profile, MatrixError> {
        let url = self.client_url(&["profile", self.session.user_id.as_str()]);
        self.send(self.http.get(url)).await?.decode()
    }

    // ── Plumbing ──────────────────────────────────────────────────────────────

    fn client_url(&self, segments: &[&str]) -> Url {
        endpoint(&self.session.homeserver, CLIENT_API, segments)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.bearer_auth(&self.session.access_token)
    }

    async fn send(&self, req: RequestBuilder) -> Result<RawResponse, MatrixError> {
        let req = self.authed(req);
        self.cancellable(execute(req)).await
    }

    async fn cancellable<T>(
        &self,
        fut: impl Future<Output = Result<T, MatrixError>>,
    ) -> Result<T, MatrixError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(MatrixError::Cancelled),
            result = fut => result,
        }
    }
}

async fn execute(req: RequestBuilder) -> Result<RawResponse, MatrixError> {
    let resp = req.send().await?;
    let status = resp.status().as_u16();
    let body = resp.bytes().await?;
    Ok(RawResponse { status, body })
}

/// `base` + fixed API prefix + percent-encoded path segments.
fn endpoint(base: &Url, prefix: &[&str], segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.clear().extend(prefix).extend(segments);
    }
    url
}

fn parse_room_id(room_id: &str) -> Result<matrix_sdk::ruma::OwnedRoomId, MatrixError> {
    RoomId::parse(room_id.trim()).map_err(|e| MatrixError::InvalidRoomId(format!("{room_id}: {e}")))
}

fn parse_event_id(event_id: &str) -> Result<matrix_sdk::ruma::OwnedEventId, MatrixError> {
    EventId::parse(event_id.trim())
        .map_err(|e| MatrixError::InvalidEventId(format!("{event_id}: {e}")))
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

async fn discard_partial(part: &Path) {
    match tokio::fs::remove_file(part).await {
        Ok(()) => debug!("removed partial download {}", part.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("could not remove partial download {}: {e}", part.display()),
    }
}

fn media_parts(mxc: &str) -> Result<(String, String), MatrixError> {
    let uri: &MxcUri = mxc.trim().into();
    let (server, media_id) = uri
        .parts()
        .map_err(|e| MatrixError::InvalidMxcUri(format!("{mxc}: {e}")))?;
    Ok((server.to_string(), media_id.to_owned()))
}

fn device_display_name() -> String {
    let os = if cfg!(target_os = "macos") {
        "macOS"
    } else if cfg!(target_os = "windows") {
        "Windows"
    } else if cfg!(target_os = "linux") {
        "Linux"
    } else {
        "unknown OS"
    };
    format!("tether on {os}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_encodes_path_segments() {
        let base = Url::parse("https://example.org/").unwrap();
        let url = endpoint(&base, CLIENT_API, &["join", "#lobby:example.org"]);
        assert_eq!(
            url.as_str(),
            "https://example.org/_matrix/client/v3/join/%23lobby:example.org"
        );

        let url = endpoint(&base, CLIENT_API, &["rooms", "!abc:example.org", "send", "m.room.message", "7"]);
        assert_eq!(
            url.path(),
            "/_matrix/client/v3/rooms/!abc:example.org/send/m.room.message/7"
        );
    }

    #[test]
    fn media_parts_split_server_and_id() {
        let (server, id) = media_parts("mxc://example.org/AbCdEf").unwrap();
        assert_eq!(server, "example.org");
        assert_eq!(id, "AbCdEf");

        assert!(matches!(
            media_parts("https://example.org/x"),
            Err(MatrixError::InvalidMxcUri(_))
        ));
    }

    #[test]
    fn identifiers_are_validated_locally() {
        assert!(matches!(parse_room_id("lobby"), Err(MatrixError::InvalidRoomId(_))));
        assert!(matches!(parse_event_id("nope"), Err(MatrixError::InvalidEventId(_))));
        assert!(parse_room_id("!abc:example.org").is_ok());
    }

    #[test]
    fn device_name_mentions_client() {
        assert!(device_display_name().starts_with("tether on "));
    }

    #[test]
    fn raw_response_success_and_failure() {
        let ok = RawResponse {
            status: 200,
            body: Bytes::from_static(b"{}"),
        };
        assert!(ok.ensure_success().is_ok());

        let forbidden = RawResponse {
            status: 403,
            body: Bytes::from_static(br#"{"errcode":"M_FORBIDDEN","error":"no"}"#),
        };
        let err = forbidden.ensure_success().expect_err("must fail");
        assert_eq!(err.errcode(), Some("M_FORBIDDEN"));
    }
}
