/// Async/sync bridge between the Matrix background task and the terminal UI.
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use serde_json::Value;
use tether_core::{
    matrix::{
        event_channel,
        types::{CreateRoomRequest, MediaKind, MessageContent, Messages, SyncBatch},
        ClientEvent, EventReceiver, FileSettings, HomeserverClient, MatrixError, RegisterOutcome,
        SessionClient, SettingsStore, SyncController, SyncOutcome,
    },
    RetryPolicy,
};
use tokio::{sync::mpsc as tokio_mpsc, task::JoinError};
use tracing::{debug, info, warn};

use crate::config::AppConfig;

const HISTORY_PAGE: u32 = 50;
const TYPING_TIMEOUT: Duration = Duration::from_secs(30);
const NOTIFICATION_PAGE: u32 = 20;

// ── Shared types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    Connected { user_id: String },
    RoomsUpdated(Vec<String>),
    Invited { room_id: String },
    Left { room_id: String },
    Joined { room_id: String },
    Message {
        room_id: String,
        sender: String,
        event_id: String,
        body: String,
    },
    Sent { room_id: String, event_id: String },
    Uploaded { room_id: String, content_uri: String },
    Redacted { event_id: String },
    HistoryLoaded {
        room_id: String,
        messages: Vec<(String, String)>,
    },
    Notifications(Vec<String>),
    Profile {
        displayname: Option<String>,
        avatar_url: Option<String>,
    },
    /// A sync round failed; the loop keeps retrying.
    SyncTrouble(String),
    /// The server revoked the access token.
    SessionExpired,
    LoggedOut,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppCommand {
    SendMessage { room_id: String, body: String },
    SendEmote { room_id: String, body: String },
    UploadFile { room_id: String, path: PathBuf },
    InviteUser { room_id: String, mxid: String },
    JoinRoom { target: String },
    CreateRoom { name: String },
    LeaveRoom { room_id: String },
    FetchHistory { room_id: String },
    Typing { room_id: String, typing: bool },
    MarkRead { room_id: String, event_id: String },
    Redact { room_id: String, event_id: String },
    FetchNotifications,
    FetchProfile,
    Logout,
}

/// Delivers [`AppEvent`]s to the UI thread and wakes it up.
#[derive(Clone)]
pub struct EventSink(Arc<dyn Fn(AppEvent) + Send + Sync>);

impl EventSink {
    pub fn new(f: impl Fn(AppEvent) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    fn send(&self, event: AppEvent) {
        (self.0)(event)
    }
}

/// Oldest pagination token seen per room, for `/history`.
type HistoryTokens = Arc<Mutex<HashMap<String, String>>>;

// ── Entry point ───────────────────────────────────────────────────────────────

pub fn spawn_matrix_task(
    config: AppConfig,
    events: EventSink,
    cmd_rx: tokio_mpsc::UnboundedReceiver<AppCommand>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Runtime::new() {
            Ok(rt) => rt,
            Err(e) => {
                events.send(AppEvent::Error(format!("tokio runtime: {e}")));
                return;
            }
        };
        runtime.block_on(matrix_task(config, events, cmd_rx));
    })
}

// ── Matrix task ───────────────────────────────────────────────────────────────

/// How one logged-in session came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Expired,
    LoggedOut,
    Closed,
}

/// Why the command loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandsExit {
    Logout,
    Closed,
    Cancelled,
}

type CommandsResult =
    Result<(tokio_mpsc::UnboundedReceiver<AppCommand>, CommandsExit), JoinError>;

enum Ended {
    Sync(SessionEnd),
    Commands(CommandsResult),
}

async fn matrix_task(
    config: AppConfig,
    events: EventSink,
    mut cmd_rx: tokio_mpsc::UnboundedReceiver<AppCommand>,
) {
    let settings: Arc<dyn SettingsStore> = match FileSettings::open(&config.settings_path) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            events.send(AppEvent::Error(format!(
                "settings {}: {e}",
                config.settings_path.display()
            )));
            return;
        }
    };

    let homeserver = match config.client_config().map_err(|e| e.to_string()).and_then(|c| {
        HomeserverClient::new(c).map_err(|e| e.to_string())
    }) {
        Ok(hs) => hs,
        Err(e) => {
            events.send(AppEvent::Error(e));
            return;
        }
    };

    if config.register {
        register(&homeserver, &config).await;
    }

    let policy = RetryPolicy::default();
    let mut expiries = 0u32;

    loop {
        let session = match homeserver.login(&config.username, &config.password).await {
            Ok(s) => s,
            Err(e) => {
                events.send(AppEvent::Error(format!("login: {e}")));
                return;
            }
        };
        events.send(AppEvent::Connected {
            user_id: session.user_id.to_string(),
        });

        let client = homeserver.session(session, settings.clone());
        let (client_tx, client_rx) = event_channel();
        let mut controller = SyncController::new(client.clone(), settings.clone(), client_tx)
            .with_server_timeout(config.sync_timeout);

        let tokens = HistoryTokens::default();
        let forwarder = tokio::spawn(forward_client_events(
            client_rx,
            events.clone(),
            tokens.clone(),
        ));
        let mut commands = tokio::spawn(handle_commands(
            client.clone(),
            cmd_rx,
            events.clone(),
            tokens,
        ));

        let ended = tokio::select! {
            end = run_sync(&mut controller, policy) => Ended::Sync(end),
            joined = &mut commands => Ended::Commands(joined),
        };

        let (end, joined) = match ended {
            Ended::Sync(end) => {
                client.cancel();
                (end, commands.await)
            }
            Ended::Commands(joined) => {
                let end = match &joined {
                    Ok((_, CommandsExit::Logout)) => {
                        if let Err(e) = client.logout().await {
                            events.send(AppEvent::Error(format!("logout: {e}")));
                        }
                        SessionEnd::LoggedOut
                    }
                    _ => SessionEnd::Closed,
                };
                client.cancel();
                (end, joined)
            }
        };

        cmd_rx = match joined {
            Ok((rx, _)) => rx,
            Err(e) => {
                warn!("command task failed: {e}");
                return;
            }
        };

        // Dropping the controller closes the event channel and ends the forwarder.
        match end {
            SessionEnd::Expired => controller.reset(),
            SessionEnd::LoggedOut => {
                controller.reset();
                drop(controller);
                let _ = forwarder.await;
                events.send(AppEvent::LoggedOut);
                return;
            }
            SessionEnd::Closed => return,
        }
        drop(controller);
        let _ = forwarder.await;

        let delay = policy.delay_for(expiries, None);
        expiries += 1;
        info!("access token revoked, logging in again in {delay:?}");
        tokio::time::sleep(delay).await;
    }
}

async fn register(homeserver: &HomeserverClient, config: &AppConfig) {
    match homeserver
        .register(&config.username, &config.password, None)
        .await
    {
        Ok(RegisterOutcome::Registered(session)) => info!("registered {}", session.user_id),
        Ok(RegisterOutcome::FlowRequired(flows)) => {
            let stages: Vec<&str> = flows
                .flows
                .iter()
                .flat_map(|f| f.stages.iter().map(String::as_str))
                .collect();
            warn!("registration needs interactive auth ({stages:?}), trying login");
        }
        Err(e) if e.errcode() == Some("M_USER_IN_USE") => debug!("already registered"),
        Err(e) => warn!("register: {e}"),
    }
}

/// Initial sync once, then long-poll until the session ends.
async fn run_sync(controller: &mut SyncController, policy: RetryPolicy) -> SessionEnd {
    let mut backoff = policy.backoff();

    loop {
        let outcome = if controller.next_batch().is_empty() {
            controller.initial_sync().await
        } else {
            controller.sync().await
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            // Only a missing cursor ends up here, and the next round re-checks it.
            Err(e) => {
                warn!("sync: {e}");
                continue;
            }
        };

        if let Some(delay) = backoff.after(&outcome) {
            debug!("sync retry {} in {delay:?}", backoff.failures());
            tokio::time::sleep(delay).await;
        }
        match outcome {
            SyncOutcome::Completed { next_batch } => controller.set_next_batch(next_batch),
            SyncOutcome::Retry { .. } => {}
            SyncOutcome::InvalidToken => return SessionEnd::Expired,
            SyncOutcome::Discarded => return SessionEnd::Closed,
        }
    }
}

// ── Client events → app events ────────────────────────────────────────────────

async fn forward_client_events(mut rx: EventReceiver, events: EventSink, tokens: HistoryTokens) {
    while let Some(event) = rx.recv().await {
        match event {
            ClientEvent::InitialSyncCompleted(batch) => {
                remember_history_tokens(&tokens, &batch);
                events.send(AppEvent::RoomsUpdated(batch.rooms.join.keys().cloned().collect()));
                for room_id in batch.rooms.invite.keys() {
                    events.send(AppEvent::Invited {
                        room_id: room_id.clone(),
                    });
                }
            }
            ClientEvent::SyncCompleted(batch) => {
                remember_history_tokens(&tokens, &batch);
                for event in batch_events(&batch) {
                    events.send(event);
                }
            }
            ClientEvent::SyncError(message) => events.send(AppEvent::SyncTrouble(message)),
            ClientEvent::InitialSyncFailed { status, message } => {
                let message = match status {
                    Some(status) => format!("initial sync failed (HTTP {status}): {message}"),
                    None => format!("initial sync failed: {message}"),
                };
                events.send(AppEvent::SyncTrouble(message));
            }
            ClientEvent::InvalidToken => events.send(AppEvent::SessionExpired),
            ClientEvent::FilterUploaded { filter_id } => debug!("sync filter registered as {filter_id}"),
        }
    }
}

/// What an incremental batch means for the UI.
fn batch_events(batch: &SyncBatch) -> Vec<AppEvent> {
    let mut out: Vec<AppEvent> = batch
        .rooms
        .invite
        .keys()
        .map(|room_id| AppEvent::Invited {
            room_id: room_id.clone(),
        })
        .collect();

    out.extend(batch.rooms.leave.keys().map(|room_id| AppEvent::Left {
        room_id: room_id.clone(),
    }));

    out.extend(batch.text_messages().into_iter().map(|m| AppEvent::Message {
        room_id: m.room_id,
        sender: m.sender,
        event_id: m.event_id,
        body: m.body,
    }));
    out
}

fn remember_history_tokens(tokens: &HistoryTokens, batch: &SyncBatch) {
    let mut tokens = tokens.lock().unwrap_or_else(PoisonError::into_inner);
    for room_id in batch.rooms.join.keys() {
        if let Some(prev) = batch.prev_batch(room_id) {
            tokens
                .entry(room_id.clone())
                .or_insert_with(|| prev.to_owned());
        }
    }
}

// ── Command handler ───────────────────────────────────────────────────────────

async fn handle_commands(
    client: SessionClient,
    mut cmd_rx: tokio_mpsc::UnboundedReceiver<AppCommand>,
    events: EventSink,
    tokens: HistoryTokens,
) -> (tokio_mpsc::UnboundedReceiver<AppCommand>, CommandsExit) {
    loop {
        let cmd = tokio::select! {
            _ = client.cancelled() => return (cmd_rx, CommandsExit::Cancelled),
            cmd = cmd_rx.recv() => cmd,
        };

        let Some(cmd) = cmd else {
            return (cmd_rx, CommandsExit::Closed);
        };
        if cmd == AppCommand::Logout {
            return (cmd_rx, CommandsExit::Logout);
        }

        if let Err(e) = run_command(&client, cmd, &events, &tokens).await {
            match e {
                MatrixError::Cancelled => debug!("command dropped, session ended"),
                e => {
                    warn!("command failed: {e}");
                    events.send(AppEvent::Error(e.to_string()));
                }
            }
        }
    }
}

async fn run_command(
    client: &SessionClient,
    cmd: AppCommand,
    events: &EventSink,
    tokens: &HistoryTokens,
) -> Result<(), MatrixError> {
    match cmd {
        AppCommand::SendMessage { room_id, body } => {
            send_content(client, &room_id, MessageContent::text(body), events).await?;
        }

        AppCommand::SendEmote { room_id, body } => {
            send_content(client, &room_id, MessageContent::emote(body), events).await?;
        }

        AppCommand::UploadFile { room_id, path } => {
            let mimetype = guess_mimetype(&path);
            let media = client.upload_file(&path, mimetype).await?;
            events.send(AppEvent::Uploaded {
                room_id: room_id.clone(),
                content_uri: media.content_uri.clone(),
            });
            let content = MessageContent::media(media_kind(mimetype), &media);
            send_content(client, &room_id, content, events).await?;
        }

        AppCommand::InviteUser { room_id, mxid } => {
            client.invite_user(&room_id, &mxid).await?;
        }

        AppCommand::JoinRoom { target } => {
            let room_id = client.join_room(&target).await?;
            events.send(AppEvent::Joined { room_id });
        }

        AppCommand::CreateRoom { name } => {
            let room_id = client.create_room(&CreateRoomRequest::named(name)).await?;
            events.send(AppEvent::Joined { room_id });
        }

        AppCommand::LeaveRoom { room_id } => {
            client.leave_room(&room_id).await?;
            events.send(AppEvent::Left { room_id });
        }

        AppCommand::FetchHistory { room_id } => {
            let from = tokens
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&room_id)
                .cloned();
            let Some(from) = from else {
                events.send(AppEvent::Error(format!(
                    "no history position for {room_id} yet, wait for the next sync"
                )));
                return Ok(());
            };

            let page = client.messages(&room_id, &from, HISTORY_PAGE).await?;
            if let Some(end) = &page.end {
                tokens
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(room_id.clone(), end.clone());
            }
            events.send(AppEvent::HistoryLoaded {
                messages: history_messages(&page),
                room_id,
            });
        }

        AppCommand::Typing { room_id, typing } => {
            if typing {
                client.set_typing(&room_id, TYPING_TIMEOUT).await?;
            } else {
                client.clear_typing(&room_id).await?;
            }
        }

        AppCommand::MarkRead { room_id, event_id } => {
            client.read_event(&room_id, &event_id).await?;
        }

        AppCommand::Redact { room_id, event_id } => {
            client.redact_event(&room_id, &event_id).await?;
            events.send(AppEvent::Redacted { event_id });
        }

        AppCommand::FetchNotifications => {
            let page = client.notifications(NOTIFICATION_PAGE).await?;
            let lines = page.notifications.iter().map(notification_line).collect();
            events.send(AppEvent::Notifications(lines));
        }

        AppCommand::FetchProfile => {
            let profile = client.own_profile().await?;
            events.send(AppEvent::Profile {
                displayname: profile.displayname,
                avatar_url: profile.avatar_url,
            });
        }

        // Handled by the command loop.
        AppCommand::Logout => {}
    }
    Ok(())
}

async fn send_content(
    client: &SessionClient,
    room_id: &str,
    content: MessageContent,
    events: &EventSink,
) -> Result<(), MatrixError> {
    let txn = client.next_transaction_id();
    let sent = client.send_message(room_id, txn, &content).await?;
    events.send(AppEvent::Sent {
        room_id: sent.room_id,
        event_id: sent.event_id,
    });
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// `(sender, body)` of every text message in a page, oldest first.
fn history_messages(page: &Messages) -> Vec<(String, String)> {
    // Backwards pagination returns newest first.
    page.chunk
        .iter()
        .rev()
        .filter(|ev| ev.get("type").and_then(Value::as_str) == Some("m.room.message"))
        .filter_map(|ev| {
            let sender = ev.get("sender").and_then(Value::as_str)?;
            let body = ev.pointer("/content/body").and_then(Value::as_str)?;
            Some((sender.to_owned(), body.to_owned()))
        })
        .collect()
}

fn notification_line(n: &Value) -> String {
    let room = n.get("room_id").and_then(Value::as_str).unwrap_or("?");
    let sender = n.pointer("/event/sender").and_then(Value::as_str).unwrap_or("?");
    let body = n
        .pointer("/event/content/body")
        .and_then(Value::as_str)
        .unwrap_or("");
    let unread = if n.get("read").and_then(Value::as_bool) == Some(false) {
        "* "
    } else {
        ""
    };
    format!("{unread}[{room}] {sender}: {body}")
}

fn guess_mimetype(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp3" => "audio/mpeg",
        "ogg" | "oga" => "audio/ogg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "txt" | "md" => "text/plain",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

fn media_kind(mimetype: &str) -> MediaKind {
    match mimetype.split('/').next() {
        Some("image") => MediaKind::Image,
        Some("audio") => MediaKind::Audio,
        Some("video") => MediaKind::Video,
        _ => MediaKind::File,
    }
}
