//! On-chain anchoring of complaint records.
//!
//! Only 32-byte hashes ever leave the system: the client canonicalizes a
//! PII-free payload, rejects anything carrying a disallowed key, and
//! submits `create`/`update` calls with per-complaint strictly increasing
//! nonces. When the chain reports `InvalidNonce` the client re-reads the
//! on-chain nonce (never a local cache) and retries with `onchain + 1`.
//!
//! The chain is optional infrastructure: on `Unavailable` the job stays
//! queued with exponential backoff and the off-chain workflow proceeds
//! unblocked. At most one submission per complaint is in flight at a time.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{OptionalExtension, Transaction, params};
use serde::Serialize;
use uuid::Uuid;

use crate::canonical::{self, Digest32};
use crate::error::Error;
use crate::store::{Store, fmt_ts};

/// Oldest acceptable `created_at` relative to now (30 days).
const CREATED_AT_MAX_AGE_DAYS: i64 = 30;

/// Maximum clock skew tolerated into the future (1 hour).
const CREATED_AT_MAX_SKEW_HOURS: i64 = 1;

/// Keys that must never appear in an anchor payload.
///
/// Shared with the analytics pipeline: both surfaces publish derived data
/// and enforce the same disallowed set.
pub const DISALLOWED_KEYS: [&str; 17] = [
    "user_id",
    "username",
    "phone",
    "email",
    "complaint_id",
    "full_name",
    "name",
    "address",
    "gps",
    "latitude",
    "longitude",
    "evidence",
    "filename",
    "url",
    "comment",
    "text",
    "description",
];

/// Rejects payloads whose object keys intersect the disallowed set.
///
/// # Errors
///
/// Returns `InvalidPayload` naming the offending key.
pub fn ensure_no_disallowed_keys(value: &serde_json::Value) -> Result<(), Error> {
    match value {
        serde_json::Value::Object(map) => {
            for (key, nested) in map {
                let lower = key.to_lowercase();
                if DISALLOWED_KEYS.contains(&lower.as_str()) {
                    return Err(Error::InvalidPayload(format!(
                        "disallowed key in payload: {key}"
                    )));
                }
                ensure_no_disallowed_keys(nested)?;
            }
            Ok(())
        },
        serde_json::Value::Array(items) => {
            items.iter().try_for_each(ensure_no_disallowed_keys)
        },
        _ => Ok(()),
    }
}

/// The PII-free facts about a complaint that feed anchor hashes.
#[derive(Debug, Clone)]
pub struct AnchorView {
    /// Internal complaint id (opaque UUID, not PII).
    pub complaint_id: String,
    /// Complaint category.
    pub category: String,
    /// Current status.
    pub status: String,
    /// Current escalation level.
    pub escalation_level: String,
    /// Creation time, seconds since epoch.
    pub created_at: i64,
    /// Last update time, seconds since epoch.
    pub updated_at: i64,
    /// SLA deadline, seconds since epoch.
    pub sla_deadline: i64,
}

#[derive(Serialize)]
struct ComplaintHashPayload<'a> {
    complaint: &'a str,
    category: &'a str,
    created_at: i64,
    version: &'a str,
}

#[derive(Serialize)]
struct StatusHashPayload<'a> {
    complaint: &'a str,
    status: &'a str,
    escalation_level: &'a str,
    updated_at: i64,
    version: &'a str,
}

#[derive(Serialize)]
struct SlaHashPayload<'a> {
    complaint: &'a str,
    category: &'a str,
    escalation_level: &'a str,
    sla_deadline: i64,
    created_at: i64,
    version: &'a str,
}

const HASH_SCHEMA_VERSION: &str = "1.0";

fn hash_checked<T: Serialize>(payload: &T) -> Result<Digest32, Error> {
    let value = serde_json::to_value(payload)?;
    ensure_no_disallowed_keys(&value)?;
    canonical::ensure_hashable(&value)?;
    canonical::canonical_hash(&value)
}

/// Hash binding the complaint's immutable identity facts.
///
/// # Errors
///
/// `InvalidPayload` if the payload trips the PII guard.
pub fn complaint_hash(view: &AnchorView) -> Result<Digest32, Error> {
    hash_checked(&ComplaintHashPayload {
        complaint: &view.complaint_id,
        category: &view.category,
        created_at: view.created_at,
        version: HASH_SCHEMA_VERSION,
    })
}

/// Hash of the complaint's current status facts.
///
/// # Errors
///
/// `InvalidPayload` if the payload trips the PII guard.
pub fn status_hash(view: &AnchorView) -> Result<Digest32, Error> {
    hash_checked(&StatusHashPayload {
        complaint: &view.complaint_id,
        status: &view.status,
        escalation_level: &view.escalation_level,
        updated_at: view.updated_at,
        version: HASH_SCHEMA_VERSION,
    })
}

/// Hash of the SLA parameters in force.
///
/// # Errors
///
/// `InvalidPayload` if the payload trips the PII guard.
pub fn sla_hash(view: &AnchorView) -> Result<Digest32, Error> {
    hash_checked(&SlaHashPayload {
        complaint: &view.complaint_id,
        category: &view.category,
        escalation_level: &view.escalation_level,
        sla_deadline: view.sla_deadline,
        created_at: view.created_at,
        version: HASH_SCHEMA_VERSION,
    })
}

/// Validates the anchor timestamp policy.
///
/// # Errors
///
/// `Validation` when `created_at` falls outside `[now-30d, now+1h]` or
/// `updated_at` precedes `created_at`.
pub fn validate_timestamps(
    created_at: i64,
    updated_at: i64,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    let now_s = now.timestamp();
    let oldest = now_s - Duration::days(CREATED_AT_MAX_AGE_DAYS).num_seconds();
    let newest = now_s + Duration::hours(CREATED_AT_MAX_SKEW_HOURS).num_seconds();
    if created_at < oldest || created_at > newest {
        return Err(Error::Validation(format!(
            "created_at {created_at} outside [{oldest}, {newest}]"
        )));
    }
    if updated_at < created_at {
        return Err(Error::Validation(format!(
            "updated_at {updated_at} precedes created_at {created_at}"
        )));
    }
    Ok(())
}

/// A `createComplaintAnchor` call.
#[derive(Debug, Clone)]
pub struct CreateAnchorRequest {
    pub complaint_hash: Digest32,
    pub sla_hash: Digest32,
    pub status_hash: Digest32,
    pub created_at: i64,
    pub nonce: u64,
}

/// An `updateStatusAnchor` call.
#[derive(Debug, Clone)]
pub struct UpdateStatusRequest {
    pub complaint_hash: Digest32,
    pub status_hash: Digest32,
    pub updated_at: i64,
    pub nonce: u64,
}

/// Errors surfaced by a chain backend.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum ChainError {
    /// The submitted nonce is not strictly greater than the on-chain nonce.
    #[error("invalid nonce: on-chain nonce is {onchain}")]
    InvalidNonce {
        /// Current nonce recorded on chain.
        onchain: u64,
    },

    /// The chain cannot be reached right now.
    #[error("chain unavailable: {0}")]
    Unavailable(String),

    /// The contract rejected the call for a non-retryable reason.
    #[error("chain rejected call: {0}")]
    Rejected(String),
}

/// Transaction reference returned by the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRef(pub String);

/// Interface to the external anchor contract.
pub trait ChainBackend: Send + Sync {
    /// Submits `createComplaintAnchor`.
    ///
    /// # Errors
    ///
    /// See [`ChainError`].
    fn create_anchor(&self, req: &CreateAnchorRequest) -> Result<TxRef, ChainError>;

    /// Submits `updateStatusAnchor`.
    ///
    /// # Errors
    ///
    /// See [`ChainError`].
    fn update_status(&self, req: &UpdateStatusRequest) -> Result<TxRef, ChainError>;

    /// Reads the current on-chain nonce for a complaint anchor.
    ///
    /// # Errors
    ///
    /// See [`ChainError`].
    fn current_nonce(&self, complaint_hash: &Digest32) -> Result<u64, ChainError>;
}

#[derive(Debug, Clone)]
struct OnChainAnchor {
    status_hash: Digest32,
    nonce: u64,
}

/// In-process chain double: enforces the contract's nonce rules and can be
/// toggled unavailable. The pilot deployment runs against this; production
/// swaps in an EVM-backed implementation of [`ChainBackend`].
#[derive(Debug, Default)]
pub struct InMemoryChain {
    anchors: Mutex<HashMap<[u8; 32], OnChainAnchor>>,
    unavailable: AtomicBool,
}

impl InMemoryChain {
    /// Creates an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggles availability (tests and failure drills).
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// The status hash currently anchored for a complaint, if any.
    #[must_use]
    pub fn anchored_status(&self, complaint_hash: &Digest32) -> Option<Digest32> {
        self.anchors
            .lock()
            .unwrap()
            .get(&complaint_hash.0)
            .map(|a| a.status_hash)
    }

    fn check_available(&self) -> Result<(), ChainError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(ChainError::Unavailable("chain offline".into()))
        } else {
            Ok(())
        }
    }
}

impl ChainBackend for InMemoryChain {
    fn create_anchor(&self, req: &CreateAnchorRequest) -> Result<TxRef, ChainError> {
        self.check_available()?;
        let mut anchors = self.anchors.lock().unwrap();
        if let Some(existing) = anchors.get(&req.complaint_hash.0) {
            return Err(ChainError::InvalidNonce {
                onchain: existing.nonce,
            });
        }
        anchors.insert(
            req.complaint_hash.0,
            OnChainAnchor {
                status_hash: req.status_hash,
                nonce: req.nonce,
            },
        );
        Ok(TxRef(format!("mem:{}:{}", req.complaint_hash, req.nonce)))
    }

    fn update_status(&self, req: &UpdateStatusRequest) -> Result<TxRef, ChainError> {
        self.check_available()?;
        let mut anchors = self.anchors.lock().unwrap();
        let Some(anchor) = anchors.get_mut(&req.complaint_hash.0) else {
            return Err(ChainError::Rejected("unknown anchor".into()));
        };
        if req.nonce <= anchor.nonce {
            return Err(ChainError::InvalidNonce {
                onchain: anchor.nonce,
            });
        }
        anchor.nonce = req.nonce;
        anchor.status_hash = req.status_hash;
        Ok(TxRef(format!("mem:{}:{}", req.complaint_hash, req.nonce)))
    }

    fn current_nonce(&self, complaint_hash: &Digest32) -> Result<u64, ChainError> {
        self.check_available()?;
        Ok(self
            .anchors
            .lock()
            .unwrap()
            .get(&complaint_hash.0)
            .map_or(0, |a| a.nonce))
    }
}

/// Exponential backoff: `base * 2^attempt`, capped.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// First delay.
    pub base: Duration,
    /// Upper bound on any delay.
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::seconds(30),
            cap: Duration::hours(1),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1i64 << attempt.min(20);
        let scaled = self
            .base
            .num_seconds()
            .saturating_mul(factor)
            .min(self.cap.num_seconds());
        Duration::seconds(scaled)
    }
}

/// Maximum attempts before a job is parked as failed.
const MAX_ATTEMPTS: i64 = 12;

/// Enqueues the initial `create` job for a complaint, inside the caller's
/// transaction. The anchor row starts at nonce 1.
///
/// # Errors
///
/// `InvalidPayload` if the view trips the PII guard, `Transient` on
/// database failure.
pub fn enqueue_create(
    tx: &Transaction<'_>,
    view: &AnchorView,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    let complaint = complaint_hash(view)?;
    let sla = sla_hash(view)?;
    let status = status_hash(view)?;

    tx.execute(
        "INSERT INTO chain_anchors
             (complaint_id, complaint_hash, sla_hash, status_hash,
              created_at, last_updated_at, status_nonce)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)",
        params![
            view.complaint_id,
            complaint.to_hex(),
            sla.to_hex(),
            status.to_hex(),
            view.created_at,
            view.updated_at,
        ],
    )?;
    tx.execute(
        "INSERT INTO anchor_jobs
             (id, complaint_id, kind, status_hash, updated_at, nonce, status, created_at)
         VALUES (?1, ?2, 'create', ?3, ?4, 1, 'queued', ?5)",
        params![
            Uuid::new_v4().to_string(),
            view.complaint_id,
            status.to_hex(),
            view.updated_at,
            fmt_ts(now),
        ],
    )?;
    Ok(())
}

/// Enqueues a status update with the next nonce, inside the caller's
/// transaction. Nonces are issued here, under the row lock that reads the
/// last issued value, so they are strictly increasing per complaint.
///
/// # Errors
///
/// `NotFound` if the complaint was never anchored, `InvalidPayload` on a
/// PII-guard trip, `Transient` on database failure.
pub fn enqueue_status_update(
    tx: &Transaction<'_>,
    view: &AnchorView,
    now: DateTime<Utc>,
) -> Result<u64, Error> {
    let status = status_hash(view)?;
    let last_nonce: Option<i64> = tx
        .query_row(
            "SELECT status_nonce FROM chain_anchors WHERE complaint_id = ?1",
            params![view.complaint_id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(last_nonce) = last_nonce else {
        return Err(Error::NotFound("chain anchor"));
    };
    let nonce = (last_nonce + 1) as u64;

    tx.execute(
        "UPDATE chain_anchors
         SET status_hash = ?1, last_updated_at = ?2, status_nonce = ?3
         WHERE complaint_id = ?4",
        params![status.to_hex(), view.updated_at, nonce as i64, view.complaint_id],
    )?;
    tx.execute(
        "INSERT INTO anchor_jobs
             (id, complaint_id, kind, status_hash, updated_at, nonce, status, created_at)
         VALUES (?1, ?2, 'update', ?3, ?4, ?5, 'queued', ?6)",
        params![
            Uuid::new_v4().to_string(),
            view.complaint_id,
            status.to_hex(),
            view.updated_at,
            nonce as i64,
            fmt_ts(now),
        ],
    )?;
    Ok(nonce)
}

/// Statistics from one submission pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnchorRunStats {
    /// Jobs considered this pass.
    pub picked: usize,
    /// Jobs confirmed on chain.
    pub submitted: usize,
    /// Jobs requeued with backoff.
    pub requeued: usize,
    /// Jobs parked after exhausting attempts or non-retryable rejection.
    pub failed: usize,
}

#[derive(Debug, Clone)]
struct PendingJob {
    id: String,
    complaint_id: String,
    kind: String,
    status_hash: String,
    updated_at: i64,
    nonce: u64,
    attempts: i64,
}

/// Drives queued anchor jobs against a [`ChainBackend`].
pub struct AnchorService {
    store: Store,
    backend: std::sync::Arc<dyn ChainBackend>,
    backoff: BackoffPolicy,
}

impl AnchorService {
    /// Creates the service.
    #[must_use]
    pub fn new(
        store: Store,
        backend: std::sync::Arc<dyn ChainBackend>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            store,
            backend,
            backoff,
        }
    }

    /// Submits due jobs: oldest first, at most one job per complaint per
    /// pass (the in-flight rule), nonce recovery on `InvalidNonce`.
    ///
    /// # Errors
    ///
    /// Returns `Transient` only for store-level failures; chain failures are
    /// absorbed into the stats.
    pub fn run_pending(&self, now: DateTime<Utc>) -> Result<AnchorRunStats, Error> {
        let jobs = self.due_jobs(now)?;
        let mut stats = AnchorRunStats {
            picked: jobs.len(),
            ..AnchorRunStats::default()
        };

        for job in jobs {
            match self.submit_one(&job, now) {
                Ok(()) => {
                    stats.submitted += 1;
                    self.mark(&job.id, "done", job.attempts + 1, None)?;
                },
                Err(ChainError::Unavailable(reason)) => {
                    stats.requeued += 1;
                    tracing::warn!(job = %job.id, %reason, "chain unavailable, requeueing");
                    self.requeue(&job, now)?;
                },
                Err(ChainError::InvalidNonce { onchain }) => {
                    // Recover from the on-chain value, not any local cache.
                    match self.recover_nonce(&job, onchain, now) {
                        Ok(()) => {
                            stats.submitted += 1;
                            self.mark(&job.id, "done", job.attempts + 1, None)?;
                        },
                        Err(err) => {
                            stats.requeued += 1;
                            tracing::warn!(job = %job.id, error = %err, "nonce recovery failed");
                            self.requeue(&job, now)?;
                        },
                    }
                },
                Err(ChainError::Rejected(reason)) => {
                    stats.failed += 1;
                    tracing::error!(job = %job.id, %reason, "anchor job rejected");
                    self.mark(&job.id, "failed", job.attempts + 1, None)?;
                },
            }
        }
        Ok(stats)
    }

    fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<PendingJob>, Error> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT j.id, j.complaint_id, j.kind, j.status_hash, j.updated_at,
                        j.nonce, j.attempts
                 FROM anchor_jobs j
                 WHERE j.status = 'queued'
                   AND (j.not_before IS NULL OR j.not_before <= ?1)
                 ORDER BY j.created_at ASC, j.nonce ASC",
            )?;
            let rows = stmt
                .query_map(params![fmt_ts(now)], |row| {
                    Ok(PendingJob {
                        id: row.get(0)?,
                        complaint_id: row.get(1)?,
                        kind: row.get(2)?,
                        status_hash: row.get(3)?,
                        updated_at: row.get(4)?,
                        nonce: row.get::<_, i64>(5)? as u64,
                        attempts: row.get(6)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            // At most one submission per complaint per pass: keep only the
            // lowest nonce for each. The advisory lock on the submit job
            // keeps passes from overlapping, so this dedup is the whole
            // in-flight guarantee.
            let mut seen = std::collections::HashSet::new();
            Ok(rows
                .into_iter()
                .filter(|job| seen.insert(job.complaint_id.clone()))
                .collect())
        })
    }

    fn anchor_row(&self, complaint_id: &str) -> Result<(Digest32, Digest32, i64), Error> {
        self.store.with_conn(|conn| {
            let row: Option<(String, String, i64)> = conn
                .query_row(
                    "SELECT complaint_hash, sla_hash, created_at
                     FROM chain_anchors WHERE complaint_id = ?1",
                    params![complaint_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            let (complaint, sla, created_at) =
                row.ok_or(Error::NotFound("chain anchor"))?;
            Ok((
                Digest32::from_hex(&complaint)?,
                Digest32::from_hex(&sla)?,
                created_at,
            ))
        })
    }

    fn submit_one(&self, job: &PendingJob, now: DateTime<Utc>) -> Result<(), ChainError> {
        let (complaint, sla, created_at) = self
            .anchor_row(&job.complaint_id)
            .map_err(|e| ChainError::Rejected(e.to_string()))?;
        let status = Digest32::from_hex(&job.status_hash)
            .map_err(|e| ChainError::Rejected(e.to_string()))?;

        if job.kind == "create" {
            validate_timestamps(created_at, job.updated_at, now)
                .map_err(|e| ChainError::Rejected(e.to_string()))?;
            self.backend.create_anchor(&CreateAnchorRequest {
                complaint_hash: complaint,
                sla_hash: sla,
                status_hash: status,
                created_at,
                nonce: job.nonce,
            })?;
        } else {
            if job.updated_at < created_at {
                return Err(ChainError::Rejected(format!(
                    "updated_at {} precedes created_at {created_at}",
                    job.updated_at
                )));
            }
            self.backend.update_status(&UpdateStatusRequest {
                complaint_hash: complaint,
                status_hash: status,
                updated_at: job.updated_at,
                nonce: job.nonce,
            })?;
        }
        Ok(())
    }

    fn recover_nonce(
        &self,
        job: &PendingJob,
        _reported: u64,
        _now: DateTime<Utc>,
    ) -> Result<(), ChainError> {
        let (complaint, _, _) = self
            .anchor_row(&job.complaint_id)
            .map_err(|e| ChainError::Rejected(e.to_string()))?;
        let onchain = self.backend.current_nonce(&complaint)?;
        let next = onchain + 1;

        let status = Digest32::from_hex(&job.status_hash)
            .map_err(|e| ChainError::Rejected(e.to_string()))?;
        self.backend.update_status(&UpdateStatusRequest {
            complaint_hash: complaint,
            status_hash: status,
            updated_at: job.updated_at,
            nonce: next,
        })?;

        // Persist the recovered high-water mark so later updates keep
        // increasing from it.
        self.store
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE chain_anchors SET status_nonce = MAX(status_nonce, ?1)
                     WHERE complaint_id = ?2",
                    params![next as i64, job.complaint_id],
                )?;
                Ok(())
            })
            .map_err(|e| ChainError::Rejected(e.to_string()))?;
        Ok(())
    }

    fn requeue(&self, job: &PendingJob, now: DateTime<Utc>) -> Result<(), Error> {
        let attempts = job.attempts + 1;
        if attempts >= MAX_ATTEMPTS {
            return self.mark(&job.id, "failed", attempts, None);
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let delay = self.backoff.delay(attempts as u32);
        self.mark(&job.id, "queued", attempts, Some(fmt_ts(now + delay)))
    }

    fn mark(
        &self,
        job_id: &str,
        status: &str,
        attempts: i64,
        not_before: Option<String>,
    ) -> Result<(), Error> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE anchor_jobs SET status = ?1, attempts = ?2, not_before = ?3
                 WHERE id = ?4",
                params![status, attempts, not_before, job_id],
            )?;
            Ok(())
        })
    }

    /// Count of jobs still queued (monitoring surface).
    ///
    /// # Errors
    ///
    /// Returns `Transient` on database failure.
    pub fn queued_count(&self) -> Result<u64, Error> {
        self.store.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM anchor_jobs WHERE status = 'queued'",
                [],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }
}

impl std::fmt::Debug for AnchorService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnchorService")
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}
