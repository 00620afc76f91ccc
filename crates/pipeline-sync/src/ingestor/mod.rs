//! Push channel ingestion.
//!
//! The ingestor keeps a push connection open, applying each delta through the
//! reconciler as it arrives. Every (re)connect is followed by a full resync of
//! all kinds before the first delta is read, so nothing missed while
//! disconnected stays missing.

mod channel;
mod events;
mod reconnect;
mod state;
mod ws;

pub use channel::{PushChannel, PushConnection};
pub use events::IngestorEvent;
pub use reconnect::BackoffConfig;
pub use state::{AtomicConnectionState, ConnectionState};
pub use ws::{WsConnection, WsPushChannel};

use std::sync::Arc;

use pipeline_proto::PushMessage;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::error::{SyncError, SyncResult};
use crate::fetcher::{SnapshotFetcher, SnapshotQuery};
use crate::reconciler::Reconciler;

/// Applies push deltas and keeps the push connection alive.
pub struct PushIngestor<C, Q> {
    channel: C,
    fetcher: Arc<SnapshotFetcher<Q>>,
    reconciler: Arc<Reconciler>,
    backoff: BackoffConfig,
    state: Arc<AtomicConnectionState>,
    event_tx: mpsc::Sender<IngestorEvent>,
}

impl<C: PushChannel, Q: SnapshotQuery> PushIngestor<C, Q> {
    /// Create an ingestor. Lifecycle events are sent to `event_tx`.
    #[must_use]
    pub fn new(
        channel: C,
        fetcher: Arc<SnapshotFetcher<Q>>,
        reconciler: Arc<Reconciler>,
        backoff: BackoffConfig,
        event_tx: mpsc::Sender<IngestorEvent>,
    ) -> Self {
        Self {
            channel,
            fetcher,
            reconciler,
            backoff,
            state: Arc::new(AtomicConnectionState::default()),
            event_tx,
        }
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    /// Shared handle to the connection state, readable after `run` consumes the ingestor.
    #[must_use]
    pub fn state_handle(&self) -> Arc<AtomicConnectionState> {
        Arc::clone(&self.state)
    }

    /// Run until `shutdown` flips to true or reconnection gives up.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut attempt = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.state.store(ConnectionState::Connecting);

            let connected = tokio::select! {
                result = self.channel.connect() => result,
                _ = shutdown.changed() => break,
            };

            match connected {
                Ok(mut connection) => {
                    attempt = 0;
                    info!("push channel connected");
                    self.emit(IngestorEvent::Connected);

                    self.state.store(ConnectionState::Resyncing);
                    let report = tokio::select! {
                        report = self.fetcher.poll_all() => report,
                        _ = shutdown.changed() => break,
                    };
                    let failed = report.failed_kinds();
                    let stale = report.stale_kinds();
                    info!(
                        applied = report.applied(),
                        failed = failed.len(),
                        stale = stale.len(),
                        "resync complete"
                    );
                    self.emit(IngestorEvent::Resynced { failed, stale });

                    self.state.store(ConnectionState::Live);
                    let Some(err) = self.read_until_error(&mut connection, &mut shutdown).await else {
                        break;
                    };

                    self.state.store(ConnectionState::Disconnected);
                    warn!(error = %err, "push channel lost");
                    self.emit(IngestorEvent::Disconnected {
                        reason: err.to_string(),
                    });
                }
                Err(err) => {
                    self.state.store(ConnectionState::Disconnected);
                    warn!(error = %err, attempt = attempt + 1, "push channel connect failed");
                }
            }

            attempt += 1;
            if !self.backoff.should_reconnect(attempt) {
                warn!(attempts = attempt, "giving up on push channel");
                break;
            }

            let delay = self.backoff.delay_for_attempt(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
            self.emit(IngestorEvent::Reconnecting { attempt, delay });

            tokio::select! {
                () = sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.state.store(ConnectionState::Stopped);
        info!("push ingestor stopped");
    }

    /// Apply messages until the connection fails. `None` means shutdown.
    async fn read_until_error(
        &self,
        connection: &mut C::Connection,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<SyncError> {
        loop {
            tokio::select! {
                message = connection.next_message() => match message {
                    Some(Ok(text)) => self.handle_text(&text),
                    Some(Err(err)) => return Some(err),
                    None => return Some(SyncError::Channel("connection closed by server".to_string())),
                },
                _ = shutdown.changed() => return None,
            }
        }
    }

    fn handle_text(&self, text: &str) {
        let result: SyncResult<_> = PushMessage::from_json(text)
            .map_err(SyncError::from)
            .and_then(|message| self.reconciler.apply_message(message));

        match result {
            Ok(decision) => trace!(?decision, "push message handled"),
            Err(err) => {
                warn!(error = %err, "dropping push message");
                self.emit(IngestorEvent::MessageDropped {
                    reason: err.to_string(),
                });
            }
        }
    }

    fn emit(&self, event: IngestorEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            debug!(error = %e, "ingestor event not delivered");
        }
    }
}
