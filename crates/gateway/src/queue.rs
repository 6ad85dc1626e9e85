//! Conflated presence delivery.
//!
//! The queue holds at most one pending update; pushing while one is
//! pending replaces it. The worker delivers the pending update with
//! backoff retries, and a retry always picks up the latest push, so a
//! stale update is never delivered after a newer one exists.

use std::sync::Arc;

use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use lyrebird_protocol::presence::Presence;

use crate::connection::GatewayConnection;
use crate::error::GatewayError;
use crate::socket::Connector;
use crate::types::epoch_millis;

/// Single-slot update queue. Depth is one by construction.
#[derive(Default)]
pub struct PresenceQueue {
    slot: std::sync::Mutex<Option<Presence>>,
    notify: Notify,
}

impl PresenceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues an update, replacing any pending one.
    pub fn push(&self, presence: Presence) {
        let replaced = self.slot.lock().unwrap().replace(presence).is_some();
        if replaced {
            debug!("pending presence superseded");
        }
        self.notify.notify_one();
    }

    /// Takes the pending update, if any.
    pub fn take(&self) -> Option<Presence> {
        self.slot.lock().unwrap().take()
    }

    /// Waits for and takes the next pending update.
    pub async fn next(&self) -> Presence {
        loop {
            let notified = self.notify.notified();
            if let Some(presence) = self.take() {
                return presence;
            }
            notified.await;
        }
    }
}

/// Delivery worker: takes pending updates off the queue and sends them,
/// retrying with backoff until delivery succeeds or a newer update
/// supersedes the one in hand.
pub async fn presence_worker<C: Connector>(
    conn: GatewayConnection<C>,
    queue: Arc<PresenceQueue>,
    activity_tx: Arc<watch::Sender<Option<u64>>>,
    cancel: CancellationToken,
) {
    loop {
        let mut pending = tokio::select! {
            _ = cancel.cancelled() => return,
            presence = queue.next() => presence,
        };

        let mut attempt: u32 = 0;
        loop {
            match deliver(&conn, &pending).await {
                Ok(()) => {
                    activity_tx.send_replace(Some(epoch_millis()));
                    debug!("presence delivered");
                    break;
                }
                Err(GatewayError::Closed) => return,
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let delay = conn.config().reconnect.delay_for_attempt(attempt);
                    warn!(attempt, error = %e, "presence delivery failed, retrying");
                    conn.shared.record_error(&e.to_string());

                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    // A newer update supersedes the failed one.
                    if let Some(newer) = queue.take() {
                        pending = newer;
                        attempt = 0;
                    }
                }
            }
        }
    }
}

async fn deliver<C: Connector>(
    conn: &GatewayConnection<C>,
    presence: &Presence,
) -> Result<(), GatewayError> {
    conn.ensure_connected().await?;
    conn.wait_ready(conn.config().ready_timeout).await?;
    conn.send_presence(presence).await
}
