//! Network client layer for a Matrix desktop chat client.
//!
//! `matrix` holds the homeserver request issuers and the long-poll sync
//! controller; `retry` paces a caller's sync loop after failed rounds.

pub mod matrix;
pub mod retry;

pub use retry::{RetryPolicy, SyncBackoff};
