// Notifications the sync controller pushes toward the room-state/timeline
// consumer.

use tokio::sync::mpsc;

use crate::matrix::types::SyncBatch;

/// Events emitted by a [`SyncController`](crate::matrix::SyncController).
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A long-poll returned a batch. The consumer applies `next_batch`.
    SyncCompleted(SyncBatch),
    /// A long-poll failed in a recoverable way.
    SyncError(String),
    /// The homeserver no longer accepts the access token.
    InvalidToken,
    /// The first, non-incremental sync finished.
    InitialSyncCompleted(SyncBatch),
    /// The first sync failed. `status` is absent for transport failures.
    InitialSyncFailed {
        status: Option<u16>,
        message: String,
    },
    /// The filter definition was registered and replaced by its id.
    FilterUploaded { filter_id: String },
}

pub type EventSender = mpsc::UnboundedSender<ClientEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ClientEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Best-effort: a consumer that went away is not an error.
pub(crate) fn emit(tx: &EventSender, event: ClientEvent) {
    let _ = tx.send(event);
}
