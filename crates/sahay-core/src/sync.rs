//! Offline-first sync gateway.
//!
//! Devices submit ordered batches of envelopes; every item gets its own
//! outcome and the batch as a whole never fails. Idempotency is keyed by the
//! client-generated `event_id`: a replayed event is a no-op on state and
//! reports `duplicate`.
//!
//! Conflict rules:
//! - `vitals`, `mood`, `water` are append-only; UPDATE/DELETE are rejected.
//! - `profile` resolves by last-write-wins on `client_time`, with a stable
//!   tie-break on `event_id` for equal timestamps.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Transaction, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::{self, ActorContext};
use crate::error::Error;
use crate::store::{Store, fmt_ts, parse_ts};

/// Upper bound on items per batch; partial success is the contract below
/// this bound.
pub const MAX_BATCH_ITEMS: usize = 500;

/// Entity types the gateway accepts.
pub const ALLOWED_ENTITY_TYPES: [&str; 4] = ["profile", "vitals", "mood", "water"];

/// One sync envelope as submitted by a device.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncEnvelope {
    /// Client-generated globally unique event id.
    pub event_id: String,
    /// Submitting device.
    pub device_id: String,
    /// Owning user; must match the authenticated caller.
    pub user_id: String,
    /// Target entity type.
    pub entity_type: String,
    /// `CREATE`, `UPDATE`, or `DELETE`.
    pub operation: String,
    /// Client-asserted ISO-8601 UTC timestamp.
    pub client_time: String,
    /// Entity payload.
    pub payload: serde_json::Value,
}

/// Why an item was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// UPDATE/DELETE against an append-only entity.
    AppendOnly,
    /// Profile write older than the current state.
    Stale,
    /// Envelope `user_id` differs from the caller.
    UserMismatch,
    /// Entity type outside the allowed set.
    UnknownEntity,
    /// Operation outside `CREATE`/`UPDATE`/`DELETE`.
    UnknownOperation,
    /// Payload missing required fields or malformed timestamps.
    InvalidPayload,
    /// Database failure while applying; safe to retry.
    Transient,
}

/// Per-item outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Stored and applied.
    Accepted,
    /// `event_id` already known; prior state kept.
    Duplicate,
    /// Not applied, with a reason.
    Rejected(RejectReason),
}

impl SyncOutcome {
    /// Stable wire form (`accepted`, `duplicate`, `rejected:<reason>`).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Duplicate => "duplicate",
            Self::Rejected(RejectReason::AppendOnly) => "rejected:append_only",
            Self::Rejected(RejectReason::Stale) => "rejected:stale",
            Self::Rejected(RejectReason::UserMismatch) => "rejected:user_mismatch",
            Self::Rejected(RejectReason::UnknownEntity) => "rejected:unknown_entity",
            Self::Rejected(RejectReason::UnknownOperation) => "rejected:unknown_operation",
            Self::Rejected(RejectReason::InvalidPayload) => "rejected:invalid_payload",
            Self::Rejected(RejectReason::Transient) => "rejected:transient",
        }
    }
}

impl Serialize for SyncOutcome {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Outcome of one envelope within a batch.
#[derive(Debug, Clone, Serialize)]
pub struct SyncItemResult {
    /// Echoed event id.
    pub event_id: String,
    /// What happened.
    pub outcome: SyncOutcome,
}

/// The sync gateway.
#[derive(Debug, Clone)]
pub struct SyncGateway {
    store: Store,
}

impl SyncGateway {
    /// Creates the gateway over the shared store.
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Processes a batch, item by item, in the submitted order.
    ///
    /// # Errors
    ///
    /// `Validation` only when the batch exceeds [`MAX_BATCH_ITEMS`];
    /// individual failures surface as per-item outcomes.
    pub fn submit_batch(
        &self,
        actor: &ActorContext,
        caller_user_id: &str,
        batch: &[SyncEnvelope],
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncItemResult>, Error> {
        if batch.len() > MAX_BATCH_ITEMS {
            return Err(Error::Validation(format!(
                "batch exceeds {MAX_BATCH_ITEMS} items"
            )));
        }

        let mut results = Vec::with_capacity(batch.len());
        for envelope in batch {
            let outcome = self.process_one(actor, caller_user_id, envelope, now);
            results.push(SyncItemResult {
                event_id: envelope.event_id.clone(),
                outcome,
            });
        }
        Ok(results)
    }

    fn process_one(
        &self,
        actor: &ActorContext,
        caller_user_id: &str,
        envelope: &SyncEnvelope,
        now: DateTime<Utc>,
    ) -> SyncOutcome {
        if envelope.user_id != caller_user_id {
            return SyncOutcome::Rejected(RejectReason::UserMismatch);
        }
        if !ALLOWED_ENTITY_TYPES.contains(&envelope.entity_type.as_str()) {
            return SyncOutcome::Rejected(RejectReason::UnknownEntity);
        }
        if !matches!(envelope.operation.as_str(), "CREATE" | "UPDATE" | "DELETE") {
            return SyncOutcome::Rejected(RejectReason::UnknownOperation);
        }
        let Ok(client_time) = parse_ts(&envelope.client_time) else {
            return SyncOutcome::Rejected(RejectReason::InvalidPayload);
        };
        if !envelope.payload.is_object() {
            return SyncOutcome::Rejected(RejectReason::InvalidPayload);
        }

        let applied = self.store.with_tx(|tx| {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT event_id FROM sync_events WHERE event_id = ?1",
                    params![envelope.event_id],
                    |row| row.get(0),
                )
                .optional()?;
            if existing.is_some() {
                return Ok(SyncOutcome::Duplicate);
            }

            let outcome = apply_event(tx, envelope, client_time)?;
            store_raw_event(tx, envelope, outcome, now)?;

            if outcome == SyncOutcome::Accepted {
                audit::append(
                    tx,
                    actor,
                    "sync.event.accepted",
                    &envelope.entity_type,
                    Some(&envelope.event_id),
                    &serde_json::json!({
                        "operation": envelope.operation,
                        "device_id": envelope.device_id,
                    }),
                    now,
                )?;
            }
            Ok(outcome)
        });

        match applied {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(
                    event_id = %envelope.event_id,
                    error = %err,
                    "sync item failed, marking transient"
                );
                SyncOutcome::Rejected(RejectReason::Transient)
            },
        }
    }
}

fn store_raw_event(
    tx: &Transaction<'_>,
    envelope: &SyncEnvelope,
    outcome: SyncOutcome,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    tx.execute(
        "INSERT INTO sync_events
             (event_id, user_id, device_id, entity_type, operation, client_time,
              server_time, payload_json, outcome)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            envelope.event_id,
            envelope.user_id,
            envelope.device_id,
            envelope.entity_type,
            envelope.operation,
            envelope.client_time,
            fmt_ts(now),
            serde_json::to_string(&envelope.payload)?,
            outcome.as_str(),
        ],
    )?;
    Ok(())
}

fn apply_event(
    tx: &Transaction<'_>,
    envelope: &SyncEnvelope,
    client_time: DateTime<Utc>,
) -> Result<SyncOutcome, Error> {
    match envelope.entity_type.as_str() {
        "profile" => apply_profile(tx, envelope, client_time),
        _ => {
            if envelope.operation != "CREATE" {
                return Ok(SyncOutcome::Rejected(RejectReason::AppendOnly));
            }
            apply_append_only(tx, envelope, client_time)
        },
    }
}

/// Deterministic LWW: strictly newer `client_time` wins; equal timestamps
/// tie-break on `event_id` (lexicographically larger wins).
fn apply_profile(
    tx: &Transaction<'_>,
    envelope: &SyncEnvelope,
    client_time: DateTime<Utc>,
) -> Result<SyncOutcome, Error> {
    let current: Option<(Option<String>, Option<String>)> = tx
        .query_row(
            "SELECT client_time, last_event_id FROM profiles WHERE user_id = ?1",
            params![envelope.user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    if let Some((Some(stored_time), stored_event_id)) = &current {
        let stored = parse_ts(stored_time)?;
        if client_time < stored {
            return Ok(SyncOutcome::Rejected(RejectReason::Stale));
        }
        if client_time == stored {
            let wins = stored_event_id
                .as_deref()
                .map_or(true, |stored_id| envelope.event_id.as_str() > stored_id);
            if !wins {
                return Ok(SyncOutcome::Rejected(RejectReason::Stale));
            }
        }
    }

    let fields = envelope
        .payload
        .as_object()
        .ok_or_else(|| Error::Validation("profile payload must be an object".into()))?;
    let get = |key: &str| fields.get(key).and_then(|v| v.as_str()).map(str::to_string);

    let (name_alias, dob, sex, pincode) = if envelope.operation == "DELETE" {
        (None, None, None, None)
    } else {
        (get("name_alias"), get("dob"), get("sex"), get("pincode"))
    };

    tx.execute(
        "INSERT INTO profiles
             (user_id, name_alias, dob, sex, pincode, client_time, last_event_id, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(user_id) DO UPDATE SET
             name_alias = COALESCE(excluded.name_alias, CASE WHEN ?9 THEN NULL ELSE name_alias END),
             dob        = COALESCE(excluded.dob,        CASE WHEN ?9 THEN NULL ELSE dob        END),
             sex        = COALESCE(excluded.sex,        CASE WHEN ?9 THEN NULL ELSE sex        END),
             pincode    = COALESCE(excluded.pincode,    CASE WHEN ?9 THEN NULL ELSE pincode    END),
             client_time = excluded.client_time,
             last_event_id = excluded.last_event_id,
             updated_at = excluded.updated_at",
        params![
            envelope.user_id,
            name_alias,
            dob,
            sex,
            pincode,
            fmt_ts(client_time),
            envelope.event_id,
            fmt_ts(client_time),
            envelope.operation == "DELETE",
        ],
    )?;

    Ok(SyncOutcome::Accepted)
}

fn apply_append_only(
    tx: &Transaction<'_>,
    envelope: &SyncEnvelope,
    client_time: DateTime<Utc>,
) -> Result<SyncOutcome, Error> {
    let fields = match envelope.payload.as_object() {
        Some(map) => map,
        None => return Ok(SyncOutcome::Rejected(RejectReason::InvalidPayload)),
    };
    let row_id = Uuid::new_v4().to_string();
    let at = fields
        .get("logged_at")
        .or_else(|| fields.get("measured_at"))
        .and_then(|v| v.as_str())
        .and_then(|s| parse_ts(s).ok())
        .unwrap_or(client_time);

    match envelope.entity_type.as_str() {
        "vitals" => {
            let (Some(kind), Some(value)) = (
                fields.get("kind").and_then(|v| v.as_str()),
                fields.get("value"),
            ) else {
                return Ok(SyncOutcome::Rejected(RejectReason::InvalidPayload));
            };
            tx.execute(
                "INSERT INTO vitals_log (id, user_id, kind, value, unit, measured_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    row_id,
                    envelope.user_id,
                    kind,
                    value.to_string(),
                    fields.get("unit").and_then(|v| v.as_str()),
                    fmt_ts(at),
                ],
            )?;
        },
        "mood" => {
            let Some(scale) = fields.get("mood_scale").and_then(serde_json::Value::as_i64)
            else {
                return Ok(SyncOutcome::Rejected(RejectReason::InvalidPayload));
            };
            tx.execute(
                "INSERT INTO mood_log (id, user_id, mood_scale, logged_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![row_id, envelope.user_id, scale, fmt_ts(at)],
            )?;
        },
        "water" => {
            let Some(amount) = fields.get("amount_ml").and_then(serde_json::Value::as_i64)
            else {
                return Ok(SyncOutcome::Rejected(RejectReason::InvalidPayload));
            };
            tx.execute(
                "INSERT INTO water_log (id, user_id, amount_ml, logged_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![row_id, envelope.user_id, amount, fmt_ts(at)],
            )?;
        },
        other => {
            return Err(Error::Validation(format!(
                "unreachable entity type {other}"
            )))
        },
    }

    Ok(SyncOutcome::Accepted)
}
