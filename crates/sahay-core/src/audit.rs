//! Tamper-evident audit log.
//!
//! Every write endpoint appends exactly one entry, inside the same
//! transaction as the domain write. Entries form a hash chain:
//!
//! ```text
//! entry_hash = H(seq ‖ actor ‖ action ‖ entity ‖ ts ‖ prev_hash ‖ payload_digest)
//! entries[i].prev_hash == entries[i-1].entry_hash
//! ```
//!
//! The chain is append-only. Corrections are new entries referencing prior
//! entity ids; past entries are never mutated. [`verify`] walks the chain
//! from seq 1 (or a checkpoint) and reports the first broken sequence
//! number.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::Serialize;
use subtle::ConstantTimeEq;

use crate::canonical::{self, ZERO_DIGEST};
use crate::error::Error;
use crate::store::fmt_ts;

/// Who performed an action, as recorded in the audit log.
///
/// For anonymous complaints the context must be [`ActorContext::scrubbed`]:
/// audit entries for those writes carry no actor, IP, or device.
#[derive(Debug, Clone, Default)]
pub struct ActorContext {
    /// Acting user, if authenticated.
    pub actor_id: Option<String>,
    /// Client IP, if known.
    pub ip: Option<String>,
    /// Client device identifier, if supplied.
    pub device: Option<String>,
}

impl ActorContext {
    /// Context for background jobs and system-initiated writes.
    #[must_use]
    pub fn system() -> Self {
        Self::default()
    }

    /// Context for an authenticated user.
    #[must_use]
    pub fn user(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: Some(actor_id.into()),
            ip: None,
            device: None,
        }
    }

    /// Strips every requester-identifying field.
    #[must_use]
    pub fn scrubbed(&self) -> Self {
        Self::default()
    }
}

/// One row of the audit chain.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Position in the chain (1-based).
    pub seq: u64,
    /// Acting user, absent for system or anonymous writes.
    pub actor_id: Option<String>,
    /// Action name, e.g. `complaint.create`.
    pub action: String,
    /// Entity type the action touched.
    pub entity_type: String,
    /// Entity id, if any.
    pub entity_id: Option<String>,
    /// Client IP (scrubbed for anonymous writes).
    pub ip: Option<String>,
    /// Client device (scrubbed for anonymous writes).
    pub device: Option<String>,
    /// Timestamp, canonical RFC 3339 form.
    pub ts: String,
    /// Digest of the domain payload.
    pub payload_digest: String,
    /// Hash of the previous entry (32 zero bytes for seq 1).
    pub prev_hash: String,
    /// Hash binding this entry to its predecessor.
    pub entry_hash: String,
}

/// Result of walking the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainVerification {
    /// Whether every entry in the walked range checked out.
    pub ok: bool,
    /// First sequence number where the chain broke, if any.
    pub first_broken_seq: Option<u64>,
}

/// Fields bound by the entry hash, in canonical order.
#[derive(Serialize)]
struct EntryPreimage<'a> {
    seq: u64,
    actor: Option<&'a str>,
    action: &'a str,
    entity_type: &'a str,
    entity_id: Option<&'a str>,
    ts: &'a str,
    prev_hash: &'a str,
    payload_digest: &'a str,
}

fn compute_entry_hash(preimage: &EntryPreimage<'_>) -> Result<String, Error> {
    canonical::canonical_hash_hex(preimage)
}

/// Appends an audit entry within the caller's transaction.
///
/// The next `seq` is `MAX(seq) + 1` under the transaction's lock;
/// `prev_hash` is the previous entry's hash or the 32-zero sentinel.
///
/// # Errors
///
/// Returns `InvalidPayload` if the payload is not hashable, `Transient` on
/// database failure.
pub fn append(
    tx: &Transaction<'_>,
    actor: &ActorContext,
    action: &str,
    entity_type: &str,
    entity_id: Option<&str>,
    payload: &serde_json::Value,
    now: DateTime<Utc>,
) -> Result<AuditEntry, Error> {
    canonical::ensure_hashable(payload)?;
    let payload_digest = canonical::canonical_hash_hex(payload)?;

    let seq: u64 = tx.query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM audit_log",
        [],
        |row| row.get::<_, i64>(0),
    )? as u64;

    let prev_hash: String = tx
        .query_row(
            "SELECT entry_hash FROM audit_log ORDER BY seq DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or_else(|| hex::encode(ZERO_DIGEST));

    let ts = fmt_ts(now);
    let entry_hash = compute_entry_hash(&EntryPreimage {
        seq,
        actor: actor.actor_id.as_deref(),
        action,
        entity_type,
        entity_id,
        ts: &ts,
        prev_hash: &prev_hash,
        payload_digest: &payload_digest,
    })?;

    tx.execute(
        "INSERT INTO audit_log
             (seq, actor_id, action, entity_type, entity_id, ip, device, ts,
              payload_digest, prev_hash, entry_hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            seq as i64,
            actor.actor_id,
            action,
            entity_type,
            entity_id,
            actor.ip,
            actor.device,
            ts,
            payload_digest,
            prev_hash,
            entry_hash,
        ],
    )?;

    Ok(AuditEntry {
        seq,
        actor_id: actor.actor_id.clone(),
        action: action.to_string(),
        entity_type: entity_type.to_string(),
        entity_id: entity_id.map(str::to_string),
        ip: actor.ip.clone(),
        device: actor.device.clone(),
        ts,
        payload_digest,
        prev_hash,
        entry_hash,
    })
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    Ok(AuditEntry {
        seq: row.get::<_, i64>(0)? as u64,
        actor_id: row.get(1)?,
        action: row.get(2)?,
        entity_type: row.get(3)?,
        entity_id: row.get(4)?,
        ip: row.get(5)?,
        device: row.get(6)?,
        ts: row.get(7)?,
        payload_digest: row.get(8)?,
        prev_hash: row.get(9)?,
        entry_hash: row.get(10)?,
    })
}

const SELECT_COLUMNS: &str = "seq, actor_id, action, entity_type, entity_id, ip, device, ts, \
                              payload_digest, prev_hash, entry_hash";

/// Lists the most recent entries, newest first.
///
/// # Errors
///
/// Returns `Transient` on database failure.
pub fn list(conn: &Connection, limit: u64) -> Result<Vec<AuditEntry>, Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS} FROM audit_log ORDER BY seq DESC LIMIT ?1"
    ))?;
    let entries = stmt
        .query_map(params![limit as i64], row_to_entry)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

fn hashes_equal(expected_hex: &str, actual_hex: &str) -> bool {
    match (hex::decode(expected_hex), hex::decode(actual_hex)) {
        (Ok(expected), Ok(actual)) => {
            expected.len() == actual.len() && bool::from(expected.ct_eq(&actual))
        },
        _ => false,
    }
}

/// Walks the chain from `from_seq` (clamped to 1) and reports the first
/// break.
///
/// A checkpointed walk (`from_seq > 1`) loads the predecessor's hash first;
/// a missing predecessor counts as a break at `from_seq`.
///
/// # Errors
///
/// Returns `Transient` on database failure.
#[allow(clippy::cast_possible_wrap)]
pub fn verify(conn: &Connection, from_seq: u64) -> Result<ChainVerification, Error> {
    let from = from_seq.max(1);

    let mut prev_hash = if from == 1 {
        hex::encode(ZERO_DIGEST)
    } else {
        match conn
            .query_row(
                "SELECT entry_hash FROM audit_log WHERE seq = ?1",
                params![(from - 1) as i64],
                |row| row.get::<_, String>(0),
            )
            .optional()?
        {
            Some(hash) => hash,
            None => {
                return Ok(ChainVerification {
                    ok: false,
                    first_broken_seq: Some(from),
                })
            },
        }
    };

    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS} FROM audit_log WHERE seq >= ?1 ORDER BY seq ASC"
    ))?;
    let rows = stmt
        .query_map(params![from as i64], row_to_entry)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut expected_seq = from;
    for entry in rows {
        if entry.seq != expected_seq {
            return Ok(ChainVerification {
                ok: false,
                first_broken_seq: Some(expected_seq),
            });
        }

        let recomputed = compute_entry_hash(&EntryPreimage {
            seq: entry.seq,
            actor: entry.actor_id.as_deref(),
            action: &entry.action,
            entity_type: &entry.entity_type,
            entity_id: entry.entity_id.as_deref(),
            ts: &entry.ts,
            prev_hash: &entry.prev_hash,
            payload_digest: &entry.payload_digest,
        })?;

        if !hashes_equal(&entry.prev_hash, &prev_hash)
            || !hashes_equal(&entry.entry_hash, &recomputed)
        {
            return Ok(ChainVerification {
                ok: false,
                first_broken_seq: Some(entry.seq),
            });
        }

        prev_hash = entry.entry_hash;
        expected_seq += 1;
    }

    Ok(ChainVerification {
        ok: true,
        first_broken_seq: None,
    })
}
