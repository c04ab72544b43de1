//! Outbound message queue.
//!
//! Notifications are enqueued inside the same transaction as the write
//! that caused them and delivered by a background pass. Delivery is
//! at-least-once: a crash between send and the status update re-sends, so
//! channel consumers must be idempotent. Attempts are bounded; exhausted
//! messages park as `failed`.

use chrono::{DateTime, Utc};
use rusqlite::{Transaction, params};
use serde::Serialize;
use uuid::Uuid;

use crate::error::Error;
use crate::store::{Store, fmt_ts};

/// Attempts before a message parks as failed.
pub const MAX_ATTEMPTS: i64 = 5;

/// Delivery states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Failed,
}

/// A queued outbound message.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundMessage {
    /// Message id.
    pub id: String,
    /// Target user, if user-addressed.
    pub user_id: Option<String>,
    /// Delivery channel (`sms`, `ivr`, `push`).
    pub channel: String,
    /// Channel payload.
    pub payload: String,
    /// Attempts so far.
    pub attempts: i64,
}

/// Delivery error from a channel.
#[derive(Debug, thiserror::Error)]
#[error("send failed: {0}")]
pub struct SendError(pub String);

/// A delivery channel. Telephony/SMS media handling is external; this
/// trait is the seam it plugs into.
pub trait MessageSender: Send + Sync {
    /// Delivers one message.
    ///
    /// # Errors
    ///
    /// Returns [`SendError`] when the channel rejects or times out.
    fn send(&self, message: &OutboundMessage) -> Result<(), SendError>;
}

/// Sender that only logs; the pilot default when no gateway is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSender;

impl MessageSender for LogSender {
    fn send(&self, message: &OutboundMessage) -> Result<(), SendError> {
        tracing::info!(
            id = %message.id,
            channel = %message.channel,
            "outbound message (log sink)"
        );
        Ok(())
    }
}

/// Outcome of one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Messages attempted.
    pub attempted: usize,
    /// Messages delivered.
    pub sent: usize,
    /// Messages parked as failed.
    pub failed: usize,
}

/// Enqueues a message inside the caller's transaction.
///
/// # Errors
///
/// Returns `Transient` on database failure.
pub fn enqueue(
    tx: &Transaction<'_>,
    user_id: Option<&str>,
    channel: &str,
    payload: &str,
    now: DateTime<Utc>,
) -> Result<String, Error> {
    let id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO outbound_messages
             (id, user_id, channel, payload, status, attempts, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?5)",
        params![id, user_id, channel, payload, fmt_ts(now)],
    )?;
    Ok(id)
}

/// Drains pending messages through a sender.
#[derive(Clone)]
pub struct OutboxService {
    store: Store,
    sender: std::sync::Arc<dyn MessageSender>,
}

impl OutboxService {
    /// Creates the service.
    #[must_use]
    pub fn new(store: Store, sender: std::sync::Arc<dyn MessageSender>) -> Self {
        Self { store, sender }
    }

    /// Sends every pending message once; failures either retry later or
    /// park as failed after [`MAX_ATTEMPTS`].
    ///
    /// # Errors
    ///
    /// Returns `Transient` on database failure.
    pub fn dispatch_pending(&self, now: DateTime<Utc>) -> Result<DispatchStats, Error> {
        let pending: Vec<OutboundMessage> = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, channel, payload, attempts
                 FROM outbound_messages WHERE status = 'pending'
                 ORDER BY created_at ASC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(OutboundMessage {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        channel: row.get(2)?,
                        payload: row.get(3)?,
                        attempts: row.get(4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        let mut stats = DispatchStats {
            attempted: pending.len(),
            ..DispatchStats::default()
        };
        for message in pending {
            let attempts = message.attempts + 1;
            match self.sender.send(&message) {
                Ok(()) => {
                    stats.sent += 1;
                    self.mark(&message.id, "sent", attempts, now)?;
                },
                Err(err) if attempts >= MAX_ATTEMPTS => {
                    stats.failed += 1;
                    tracing::error!(id = %message.id, error = %err, "message parked as failed");
                    self.mark(&message.id, "failed", attempts, now)?;
                },
                Err(err) => {
                    tracing::warn!(id = %message.id, error = %err, "send failed, will retry");
                    self.mark(&message.id, "pending", attempts, now)?;
                },
            }
        }
        Ok(stats)
    }

    fn mark(
        &self,
        id: &str,
        status: &str,
        attempts: i64,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE outbound_messages SET status = ?1, attempts = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![status, attempts, fmt_ts(now), id],
            )?;
            Ok(())
        })
    }
}

impl std::fmt::Debug for OutboxService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxService").finish_non_exhaustive()
    }
}
