// Matrix client-server API layer over reqwest.
// Handles login, the long-poll sync loop, rooms, messages and media.

mod client;
mod config;
mod error;
mod events;
mod filter;
mod session;
mod settings;
mod sync;
mod txn;
pub mod types;

pub use client::{HomeserverClient, RawResponse, RegisterOutcome, SessionClient};
pub use config::{parse_homeserver, ClientConfig, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SYNC_TIMEOUT};
pub use error::{
    classify_failure, decode_response, is_error_status, ErrorClass, MatrixError, ServerError,
    M_LIMIT_EXCEEDED, M_UNKNOWN_TOKEN,
};
pub use events::{event_channel, ClientEvent, EventReceiver, EventSender};
pub use filter::{default_filter, parse_definition, SyncFilter};
pub use session::{normalize_user_id, Session};
pub use settings::{FileSettings, MemorySettings, SettingKey, SettingsError, SettingsStore};
pub use sync::{SyncController, SyncOutcome};
pub use txn::TransactionIds;
