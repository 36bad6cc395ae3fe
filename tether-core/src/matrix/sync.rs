use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::matrix::{
    client::{RawResponse, SessionClient},
    config::DEFAULT_SYNC_TIMEOUT,
    error::{decode_response, MatrixError},
    events::{emit, ClientEvent, EventSender},
    filter::SyncFilter,
    settings::{SettingKey, SettingsStore},
    types::{SyncBatch, SyncQuery},
};

/// What a sync round delivered, so the driving loop knows what to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// A batch was emitted. Apply `next_batch` before syncing again.
    Completed { next_batch: String },
    /// A recoverable error was emitted. Back off and sync again.
    Retry { retry_after: Option<Duration> },
    /// `InvalidToken` was emitted. The session is over.
    InvalidToken,
    /// The session was cancelled mid-flight; nothing was emitted.
    Discarded,
}

/// Owns the long-poll cursor and sync filter for one session.
///
/// `sync` takes `&mut self`, so a controller can only ever have one long-poll
/// in flight and batches come out in the order they were received. A filter
/// upload runs as its own task beside the long-poll; at most one exists at a
/// time and its result is picked up by whichever round sees it finish.
pub struct SyncController {
    client: SessionClient,
    settings: Arc<dyn SettingsStore>,
    events: EventSender,
    filter: SyncFilter,
    filter_upload: Option<JoinHandle<Result<String, MatrixError>>>,
    next_batch: String,
    server_timeout: Duration,
}

impl SyncController {
    /// Restores the filter and cursor persisted by an earlier run.
    pub fn new(client: SessionClient, settings: Arc<dyn SettingsStore>, events: EventSender) -> Self {
        let filter = SyncFilter::load(settings.as_ref());
        let next_batch = settings.load(SettingKey::NextBatch).unwrap_or_default();

        Self {
            client,
            settings,
            events,
            filter,
            filter_upload: None,
            next_batch,
            server_timeout: DEFAULT_SYNC_TIMEOUT,
        }
    }

    /// How long the server may hold each long-poll open.
    pub fn with_server_timeout(mut self, timeout: Duration) -> Self {
        self.server_timeout = timeout;
        self
    }

    pub fn next_batch(&self) -> &str {
        &self.next_batch
    }

    pub fn filter(&self) -> &SyncFilter {
        &self.filter
    }

    pub fn client(&self) -> &SessionClient {
        &self.client
    }

    /// Advance the cursor to a batch's `next_batch` and persist it.
    pub fn set_next_batch(&mut self, token: impl Into<String>) {
        self.next_batch = token.into();
        self.persist(SettingKey::NextBatch, &self.next_batch);
    }

    /// Forget the cursor (logout). The next round must be an initial sync.
    pub fn reset(&mut self) {
        self.next_batch.clear();
        self.persist(SettingKey::NextBatch, "");
    }

    /// Full, non-incremental sync that establishes the first cursor.
    ///
    /// The response can be very large, so it is decoded on a blocking
    /// worker rather than on the runtime thread.
    pub async fn initial_sync(&mut self) -> Result<SyncOutcome, MatrixError> {
        let query = SyncQuery {
            filter: self.filter.as_str().to_owned(),
            timeout_ms: 0,
            since: None,
            set_presence: None,
        };

        let decoded = match self.client.sync_request(&query).await {
            Ok(raw) => decode_off_thread(raw).await,
            Err(e) => Err(e),
        };

        Ok(match decoded {
            Ok(batch) => {
                let next_batch = batch.next_batch.clone();
                emit(&self.events, ClientEvent::InitialSyncCompleted(batch));
                SyncOutcome::Completed { next_batch }
            }
            Err(MatrixError::Cancelled) => SyncOutcome::Discarded,
            Err(MatrixError::InvalidToken { message }) => {
                warn!("initial sync rejected the access token: {message}");
                emit(&self.events, ClientEvent::InvalidToken);
                SyncOutcome::InvalidToken
            }
            Err(e) => {
                warn!("initial sync failed: {e}");
                let status = match &e {
                    MatrixError::Server { status, .. } | MatrixError::Http { status } => Some(*status),
                    _ => None,
                };
                let retry_after = e.retry_after_ms().map(Duration::from_millis);
                emit(
                    &self.events,
                    ClientEvent::InitialSyncFailed {
                        status,
                        message: e.to_string(),
                    },
                );
                SyncOutcome::Retry { retry_after }
            }
        })
    }

    /// One incremental long-poll round.
    ///
    /// Returns `Err(MissingSyncToken)` without touching the network when no
    /// cursor is held. Every other result is also emitted as a
    /// [`ClientEvent`]. A literal filter is uploaded in the background and
    /// never delays the long-poll; rounds keep using the literal value until
    /// the upload's id has been adopted.
    pub async fn sync(&mut self) -> Result<SyncOutcome, MatrixError> {
        if self.next_batch.is_empty() {
            debug!("sync requires a valid next_batch token, initial sync should be performed");
            return Err(MatrixError::MissingSyncToken);
        }

        self.collect_filter_upload().await;
        self.start_filter_upload();

        let query = SyncQuery {
            filter: self.filter.as_str().to_owned(),
            timeout_ms: u64::try_from(self.server_timeout.as_millis()).unwrap_or(u64::MAX),
            since: Some(self.next_batch.clone()),
            set_presence: Some("online"),
        };
        let response = self.client.sync_request(&query).await;

        if self.client.is_cancelled() {
            debug!("session cancelled, dropping sync response");
            return Ok(SyncOutcome::Discarded);
        }

        self.collect_filter_upload().await;

        let decoded = response.and_then(|raw| raw.decode::<SyncBatch>());

        Ok(match decoded {
            Ok(batch) => {
                let next_batch = batch.next_batch.clone();
                emit(&self.events, ClientEvent::SyncCompleted(batch));
                SyncOutcome::Completed { next_batch }
            }
            Err(MatrixError::Cancelled) => SyncOutcome::Discarded,
            Err(MatrixError::InvalidToken { message }) => {
                warn!("sync rejected the access token: {message}");
                emit(&self.events, ClientEvent::InvalidToken);
                SyncOutcome::InvalidToken
            }
            Err(e) => {
                warn!("sync error: {e}");
                let retry_after = e.retry_after_ms().map(Duration::from_millis);
                emit(&self.events, ClientEvent::SyncError(sync_error_message(&e)));
                SyncOutcome::Retry { retry_after }
            }
        })
    }

    /// Spawn an upload for a literal filter unless one is already running.
    fn start_filter_upload(&mut self) {
        if self.filter_upload.is_some() {
            return;
        }
        let definition = match self.filter.definition() {
            Ok(Some(definition)) => definition,
            Ok(None) => return,
            Err(e) => {
                debug!("not uploading sync filter: {e}");
                return;
            }
        };

        let client = self.client.clone();
        self.filter_upload = Some(tokio::spawn(async move {
            client.upload_filter(&definition).await
        }));
    }

    /// Apply the result of a finished upload. A running one is left alone.
    async fn collect_filter_upload(&mut self) {
        if !self
            .filter_upload
            .as_ref()
            .is_some_and(JoinHandle::is_finished)
        {
            return;
        }
        let Some(handle) = self.filter_upload.take() else {
            return;
        };

        match handle.await {
            Ok(Ok(filter_id)) => self.adopt_filter_id(filter_id),
            Ok(Err(e)) => warn!("filter upload failed: {e}"),
            Err(e) => warn!("filter upload task failed: {e}"),
        }
    }

    fn adopt_filter_id(&mut self, filter_id: String) {
        self.persist(SettingKey::SyncFilter, &filter_id);
        emit(
            &self.events,
            ClientEvent::FilterUploaded {
                filter_id: filter_id.clone(),
            },
        );
        self.filter = SyncFilter::Id(filter_id);
    }

    fn persist(&self, key: SettingKey, value: &str) {
        if let Err(e) = self.settings.store(key, value) {
            warn!("failed to persist {}: {e}", key.as_str());
        }
    }
}

impl Drop for SyncController {
    fn drop(&mut self) {
        if let Some(upload) = self.filter_upload.take() {
            upload.abort();
        }
    }
}

/// Server errors carry a message worth showing; everything else is generic.
fn sync_error_message(e: &MatrixError) -> String {
    match e {
        MatrixError::Server { message, .. } if !message.is_empty() => message.clone(),
        MatrixError::Decode(_) | MatrixError::UnexpectedResponse(_) => {
            "malformed sync response".to_owned()
        }
        _ => "sync failed: network or server unavailable".to_owned(),
    }
}

async fn decode_off_thread(raw: RawResponse) -> Result<SyncBatch, MatrixError> {
    match tokio::task::spawn_blocking(move || raw.decode::<SyncBatch>()).await {
        Ok(result) => result,
        Err(e) => Err(MatrixError::UnexpectedResponse(format!(
            "sync decode worker failed: {e}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_messages_are_surfaced_verbatim() {
        let e = MatrixError::Server {
            status: 500,
            errcode: "M_UNKNOWN".into(),
            message: "database is on fire".into(),
            retry_after_ms: None,
        };
        assert_eq!(sync_error_message(&e), "database is on fire");
    }

    #[test]
    fn bodiless_failures_get_a_generic_message() {
        let e = MatrixError::Http { status: 502 };
        assert_eq!(
            sync_error_message(&e),
            "sync failed: network or server unavailable"
        );
    }
}
