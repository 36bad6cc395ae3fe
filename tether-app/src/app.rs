use std::path::PathBuf;

use tokio::sync::mpsc as tokio_mpsc;

use crate::bridge::{AppCommand, AppEvent};

const HELP: &str = "\
commands:
  /room <room id>        switch the current room
  /join <room or alias>  join and switch to a room
  /create <name>         create a room and switch to it
  /leave                 leave the current room
  /invite <user id>      invite someone to the current room
  /history               load older messages of the current room
  /send <text>           send a message (plain lines do the same)
  /me <text>             send an emote
  /upload <path>         upload a file into the current room
  /typing [on|off]       start or stop the typing notice
  /read <event id>       mark the current room read up to an event
  /redact <event id>     redact an event in the current room
  /notifications         list recent notifications
  /profile               show your profile
  /logout                log out and end the session
  /quit                  exit";

/// Everything the terminal loop feeds into the app.
#[derive(Debug)]
pub enum Input {
    Line(String),
    Eof,
    Matrix(AppEvent),
}

/// What the caller should do after an input was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Continue,
    Quit,
}

/// Parsed form of one input line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Parsed {
    Command(AppCommand),
    SwitchRoom(String),
    Help,
    Quit,
    Nothing,
}

pub struct TetherApp {
    cmd_tx: tokio_mpsc::UnboundedSender<AppCommand>,
    user_id: Option<String>,
    current_room: Option<String>,
    rooms: Vec<String>,
    /// Last event seen per room, the default target of `/read`.
    last_event: Vec<(String, String)>,
}

impl TetherApp {
    pub fn new(cmd_tx: tokio_mpsc::UnboundedSender<AppCommand>) -> Self {
        Self {
            cmd_tx,
            user_id: None,
            current_room: None,
            rooms: Vec::new(),
            last_event: Vec::new(),
        }
    }

    pub fn current_room(&self) -> Option<&str> {
        self.current_room.as_deref()
    }

    /// Handle one input and return the lines to print.
    pub fn update(&mut self, input: Input) -> (Action, Vec<String>) {
        match input {
            Input::Eof => (Action::Quit, Vec::new()),
            Input::Matrix(event) => (Action::Continue, self.on_event(event)),
            Input::Line(line) => match self.parse_line(&line) {
                Ok(Parsed::Quit) => (Action::Quit, Vec::new()),
                Ok(Parsed::Help) => (Action::Continue, vec![HELP.to_owned()]),
                Ok(Parsed::Nothing) => (Action::Continue, Vec::new()),
                Ok(Parsed::SwitchRoom(room_id)) => {
                    let line = format!("now in {room_id}");
                    self.current_room = Some(room_id);
                    (Action::Continue, vec![line])
                }
                Ok(Parsed::Command(cmd)) => {
                    if self.cmd_tx.send(cmd).is_err() {
                        return (
                            Action::Continue,
                            vec!["! not connected; /quit to exit".to_owned()],
                        );
                    }
                    (Action::Continue, Vec::new())
                }
                Err(message) => (Action::Continue, vec![format!("! {message}")]),
            },
        }
    }

    fn parse_line(&self, line: &str) -> Result<Parsed, String> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Ok(Parsed::Nothing);
        }

        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Parsed::Command(AppCommand::SendMessage {
                room_id: self.require_room()?,
                body: line.to_owned(),
            }));
        };

        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };

        let cmd = match name {
            "help" => return Ok(Parsed::Help),
            "quit" | "exit" => return Ok(Parsed::Quit),
            "room" => return Ok(Parsed::SwitchRoom(require_arg(arg, "/room <room id>")?)),

            "join" => AppCommand::JoinRoom {
                target: require_arg(arg, "/join <room id or alias>")?,
            },
            "create" => AppCommand::CreateRoom {
                name: require_arg(arg, "/create <name>")?,
            },
            "leave" => AppCommand::LeaveRoom {
                room_id: self.room_or(arg)?,
            },
            "invite" => AppCommand::InviteUser {
                room_id: self.require_room()?,
                mxid: require_arg(arg, "/invite <user id>")?,
            },
            "history" => AppCommand::FetchHistory {
                room_id: self.room_or(arg)?,
            },
            "send" => AppCommand::SendMessage {
                room_id: self.require_room()?,
                body: require_arg(arg, "/send <text>")?,
            },
            "me" => AppCommand::SendEmote {
                room_id: self.require_room()?,
                body: require_arg(arg, "/me <text>")?,
            },
            "upload" => AppCommand::UploadFile {
                room_id: self.require_room()?,
                path: PathBuf::from(require_arg(arg, "/upload <path>")?),
            },
            "typing" => AppCommand::Typing {
                room_id: self.require_room()?,
                typing: match arg {
                    "" | "on" => true,
                    "off" => false,
                    other => return Err(format!("/typing takes on or off, not {other:?}")),
                },
            },
            "read" => {
                let room_id = self.require_room()?;
                let event_id = match arg {
                    "" => self
                        .last_event_in(&room_id)
                        .ok_or("nothing to mark read yet; usage: /read <event id>")?
                        .to_owned(),
                    id => id.to_owned(),
                };
                AppCommand::MarkRead { room_id, event_id }
            }
            "redact" => AppCommand::Redact {
                room_id: self.require_room()?,
                event_id: require_arg(arg, "/redact <event id>")?,
            },
            "notifications" => AppCommand::FetchNotifications,
            "profile" => AppCommand::FetchProfile,
            "logout" => AppCommand::Logout,
            other => return Err(format!("unknown command /{other}; try /help")),
        };
        Ok(Parsed::Command(cmd))
    }

    fn on_event(&mut self, event: AppEvent) -> Vec<String> {
        match event {
            AppEvent::Connected { user_id } => {
                let line = format!("* connected as {user_id}");
                self.user_id = Some(user_id);
                vec![line]
            }
            AppEvent::RoomsUpdated(rooms) => {
                self.rooms = rooms;
                if self.current_room.is_none() {
                    self.current_room = self.rooms.first().cloned();
                }
                let mut lines = vec![format!("* {} joined rooms", self.rooms.len())];
                lines.extend(self.rooms.iter().map(|r| format!("  {r}")));
                if let Some(room) = &self.current_room {
                    lines.push(format!("* now in {room}"));
                }
                lines
            }
            AppEvent::Invited { room_id } => {
                vec![format!("* invited to {room_id} (/join {room_id})")]
            }
            AppEvent::Joined { room_id } => {
                if !self.rooms.contains(&room_id) {
                    self.rooms.push(room_id.clone());
                }
                let line = format!("* joined {room_id}, now in it");
                self.current_room = Some(room_id);
                vec![line]
            }
            AppEvent::Left { room_id } => {
                self.rooms.retain(|r| r != &room_id);
                self.last_event.retain(|(r, _)| r != &room_id);
                if self.current_room.as_deref() == Some(room_id.as_str()) {
                    self.current_room = None;
                }
                vec![format!("* left {room_id}")]
            }
            AppEvent::Message {
                room_id,
                sender,
                event_id,
                body,
            } => {
                let line = format!("[{room_id}] <{sender}> {body}");
                self.note_event(room_id, event_id);
                vec![line]
            }
            AppEvent::Sent { room_id, event_id } => {
                self.note_event(room_id, event_id.clone());
                vec![format!("* sent {event_id}")]
            }
            AppEvent::Uploaded {
                room_id,
                content_uri,
            } => vec![format!("* uploaded {content_uri} to {room_id}")],
            AppEvent::Redacted { event_id } => vec![format!("* redacted {event_id}")],
            AppEvent::HistoryLoaded { room_id, messages } => {
                if messages.is_empty() {
                    return vec![format!("* no older messages in {room_id}")];
                }
                let mut lines = vec![format!("* history of {room_id}")];
                lines.extend(
                    messages
                        .into_iter()
                        .map(|(sender, body)| format!("  <{sender}> {body}")),
                );
                lines
            }
            AppEvent::Notifications(items) => {
                if items.is_empty() {
                    return vec!["* no notifications".to_owned()];
                }
                let mut lines = vec![format!("* {} notifications", items.len())];
                lines.extend(items.into_iter().map(|n| format!("  {n}")));
                lines
            }
            AppEvent::Profile {
                displayname,
                avatar_url,
            } => {
                let who = self.user_id.as_deref().unwrap_or("you");
                vec![format!(
                    "* {who}: name {}, avatar {}",
                    displayname.as_deref().unwrap_or("(none)"),
                    avatar_url.as_deref().unwrap_or("(none)")
                )]
            }
            AppEvent::SyncTrouble(message) => vec![format!("! sync: {message}")],
            AppEvent::SessionExpired => {
                vec!["! session expired, logging in again".to_owned()]
            }
            AppEvent::LoggedOut => {
                self.current_room = None;
                self.rooms.clear();
                self.last_event.clear();
                vec!["* logged out; /quit to exit".to_owned()]
            }
            AppEvent::Error(message) => vec![format!("! {message}")],
        }
    }

    fn note_event(&mut self, room_id: String, event_id: String) {
        if event_id.is_empty() {
            return;
        }
        match self.last_event.iter_mut().find(|(r, _)| *r == room_id) {
            Some(entry) => entry.1 = event_id,
            None => self.last_event.push((room_id, event_id)),
        }
    }

    fn last_event_in(&self, room_id: &str) -> Option<&str> {
        self.last_event
            .iter()
            .find(|(r, _)| r == room_id)
            .map(|(_, e)| e.as_str())
    }

    fn require_room(&self) -> Result<String, String> {
        self.current_room
            .clone()
            .ok_or_else(|| "no current room; /join or /room first".to_owned())
    }

    fn room_or(&self, arg: &str) -> Result<String, String> {
        if arg.is_empty() {
            self.require_room()
        } else {
            Ok(arg.to_owned())
        }
    }
}

fn require_arg(arg: &str, usage: &str) -> Result<String, String> {
    if arg.is_empty() {
        Err(format!("usage: {usage}"))
    } else {
        Ok(arg.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app() -> (TetherApp, tokio_mpsc::UnboundedReceiver<AppCommand>) {
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        (TetherApp::new(tx), rx)
    }

    fn line(app: &mut TetherApp, text: &str) -> (Action, Vec<String>) {
        app.update(Input::Line(text.to_owned()))
    }

    fn in_room(app: &mut TetherApp, room: &str) {
        app.update(Input::Matrix(AppEvent::Joined {
            room_id: room.to_owned(),
        }));
    }

    #[test]
    fn plain_text_needs_a_room() {
        let (mut app, mut rx) = app();

        let (_, out) = line(&mut app, "hello");
        assert!(out[0].starts_with("! no current room"));
        assert!(rx.try_recv().is_err());

        in_room(&mut app, "!a:hs");
        line(&mut app, "hello");
        assert_eq!(
            rx.try_recv().unwrap(),
            AppCommand::SendMessage {
                room_id: "!a:hs".into(),
                body: "hello".into()
            }
        );
    }

    #[test]
    fn room_commands_target_the_current_room() {
        let (mut app, mut rx) = app();
        in_room(&mut app, "!a:hs");

        for text in [
            "/me waves",
            "/invite @bob:hs",
            "/typing off",
            "/redact $e1",
            "/upload /tmp/cat.png",
            "/history",
            "/leave",
        ] {
            line(&mut app, text);
        }

        let sent: Vec<AppCommand> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(
            sent,
            vec![
                AppCommand::SendEmote {
                    room_id: "!a:hs".into(),
                    body: "waves".into()
                },
                AppCommand::InviteUser {
                    room_id: "!a:hs".into(),
                    mxid: "@bob:hs".into()
                },
                AppCommand::Typing {
                    room_id: "!a:hs".into(),
                    typing: false
                },
                AppCommand::Redact {
                    room_id: "!a:hs".into(),
                    event_id: "$e1".into()
                },
                AppCommand::UploadFile {
                    room_id: "!a:hs".into(),
                    path: PathBuf::from("/tmp/cat.png")
                },
                AppCommand::FetchHistory {
                    room_id: "!a:hs".into()
                },
                AppCommand::LeaveRoom {
                    room_id: "!a:hs".into()
                },
            ]
        );
    }

    #[test]
    fn global_commands() {
        let (mut app, mut rx) = app();

        line(&mut app, "/join #lobby:hs");
        line(&mut app, "/create planning");
        line(&mut app, "/notifications");
        line(&mut app, "/profile");
        line(&mut app, "/logout");

        let sent: Vec<AppCommand> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(
            sent,
            vec![
                AppCommand::JoinRoom {
                    target: "#lobby:hs".into()
                },
                AppCommand::CreateRoom {
                    name: "planning".into()
                },
                AppCommand::FetchNotifications,
                AppCommand::FetchProfile,
                AppCommand::Logout,
            ]
        );
    }

    #[test]
    fn usage_errors_are_printed_not_sent() {
        let (mut app, mut rx) = app();
        in_room(&mut app, "!a:hs");

        let (_, out) = line(&mut app, "/invite");
        assert_eq!(out, ["! usage: /invite <user id>"]);
        let (_, out) = line(&mut app, "/typing maybe");
        assert!(out[0].contains("on or off"));
        let (_, out) = line(&mut app, "/frobnicate");
        assert!(out[0].contains("unknown command /frobnicate"));
        let (_, out) = line(&mut app, "/read");
        assert!(out[0].contains("nothing to mark read"));

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn read_defaults_to_the_last_seen_event() {
        let (mut app, mut rx) = app();
        in_room(&mut app, "!a:hs");
        app.update(Input::Matrix(AppEvent::Message {
            room_id: "!a:hs".into(),
            sender: "@bob:hs".into(),
            event_id: "$m1".into(),
            body: "hi".into(),
        }));

        line(&mut app, "/read");
        assert_eq!(
            rx.try_recv().unwrap(),
            AppCommand::MarkRead {
                room_id: "!a:hs".into(),
                event_id: "$m1".into()
            }
        );
    }

    #[test]
    fn quit_and_eof_end_the_loop() {
        let (mut app, _rx) = app();
        assert_eq!(line(&mut app, "/quit").0, Action::Quit);
        assert_eq!(app.update(Input::Eof).0, Action::Quit);
        assert_eq!(line(&mut app, "   ").0, Action::Continue);
    }

    #[test]
    fn room_list_selects_a_default_room() {
        let (mut app, _rx) = app();
        let (_, out) = app.update(Input::Matrix(AppEvent::RoomsUpdated(vec![
            "!a:hs".into(),
            "!b:hs".into(),
        ])));

        assert_eq!(app.current_room(), Some("!a:hs"));
        assert_eq!(out[0], "* 2 joined rooms");

        line(&mut app, "/room !b:hs");
        assert_eq!(app.current_room(), Some("!b:hs"));

        app.update(Input::Matrix(AppEvent::Left {
            room_id: "!b:hs".into(),
        }));
        assert_eq!(app.current_room(), None);
    }

    #[test]
    fn events_render_as_lines() {
        let (mut app, _rx) = app();
        let (_, out) = app.update(Input::Matrix(AppEvent::Message {
            room_id: "!a:hs".into(),
            sender: "@bob:hs".into(),
            event_id: "$1".into(),
            body: "hello there".into(),
        }));
        assert_eq!(out, ["[!a:hs] <@bob:hs> hello there"]);

        let (_, out) = app.update(Input::Matrix(AppEvent::HistoryLoaded {
            room_id: "!a:hs".into(),
            messages: vec![("@a:hs".into(), "first".into())],
        }));
        assert_eq!(out, ["* history of !a:hs", "  <@a:hs> first"]);

        let (_, out) = app.update(Input::Matrix(AppEvent::SyncTrouble("down".into())));
        assert_eq!(out, ["! sync: down"]);
    }

    #[test]
    fn commands_after_disconnect_report_it() {
        let (mut app, rx) = app();
        drop(rx);
        let (_, out) = line(&mut app, "/profile");
        assert!(out[0].contains("not connected"));
    }
}
