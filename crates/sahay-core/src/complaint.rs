//! Complaint lifecycle, SLA timers, and auto-escalation.
//!
//! State machine:
//!
//! ```text
//! draft → submitted → under_review → in_progress → resolved → closed
//!                \           \            \
//!                 `-----------`------------`→ escalated → {under_review, in_progress}
//! ```
//!
//! `closed` is terminal and unreachable without non-empty closure feedback.
//! A background pass bumps overdue complaints `district → state → national`,
//! resets the SLA clock, and enqueues an anchor update with the next nonce.
//!
//! Complaint descriptions are sealed at rest with XChaCha20-Poly1305.
//! Anonymous complaints carry no submitter, and their audit entries are
//! scrubbed of IP and device.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::Serialize;
use uuid::Uuid;

use crate::anchor::{self, AnchorView};
use crate::audit::{self, ActorContext};
use crate::canonical;
use crate::error::Error;
use crate::identity::AuthedUser;
use crate::outbox;
use crate::store::{Store, fmt_ts, parse_ts};

/// Complaint categories (closed set, shared with analytics).
pub const CATEGORIES: [&str; 7] = [
    "service_quality",
    "staff_behavior",
    "facility_issues",
    "medication_error",
    "billing_dispute",
    "discrimination",
    "other",
];

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplaintStatus {
    Draft,
    Submitted,
    UnderReview,
    InProgress,
    Resolved,
    Closed,
    Escalated,
}

impl ComplaintStatus {
    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Submitted => "submitted",
            Self::UnderReview => "under_review",
            Self::InProgress => "in_progress",
            Self::Resolved => "resolved",
            Self::Closed => "closed",
            Self::Escalated => "escalated",
        }
    }

    /// Parses the stable string form.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for anything outside the closed set.
    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "draft" => Ok(Self::Draft),
            "submitted" => Ok(Self::Submitted),
            "under_review" => Ok(Self::UnderReview),
            "in_progress" => Ok(Self::InProgress),
            "resolved" => Ok(Self::Resolved),
            "closed" => Ok(Self::Closed),
            "escalated" => Ok(Self::Escalated),
            other => Err(Error::Validation(format!("unknown status: {other}"))),
        }
    }

    /// Whether the SLA clock still runs in this state.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Submitted | Self::UnderReview | Self::InProgress | Self::Escalated
        )
    }
}

/// Whether `from → to` is a legal transition.
///
/// `closed` is reachable only through [`ComplaintService::close`];
/// `escalated` may return to an in-progress state after reassignment.
#[must_use]
pub const fn can_transition(from: ComplaintStatus, to: ComplaintStatus) -> bool {
    use ComplaintStatus as S;
    matches!(
        (from, to),
        (S::Draft, S::Submitted)
            | (S::Submitted, S::UnderReview)
            | (S::UnderReview, S::InProgress)
            | (S::InProgress, S::Resolved)
            | (S::Resolved, S::Closed)
            | (S::Submitted | S::UnderReview | S::InProgress, S::Escalated)
            | (S::Escalated, S::UnderReview | S::InProgress)
    )
}

/// Escalation ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    District,
    State,
    National,
}

impl EscalationLevel {
    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::District => "district",
            Self::State => "state",
            Self::National => "national",
        }
    }

    /// Parses the stable string form.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for anything outside the closed set.
    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "district" => Ok(Self::District),
            "state" => Ok(Self::State),
            "national" => Ok(Self::National),
            other => Err(Error::Validation(format!("unknown level: {other}"))),
        }
    }

    /// Next rung of the ladder, if any.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::District => Some(Self::State),
            Self::State => Some(Self::National),
            Self::National => None,
        }
    }
}

/// Default SLA hours when no rule row exists for a (category, level).
const DEFAULT_SLA_HOURS: [(EscalationLevel, i64); 3] = [
    (EscalationLevel::District, 72),
    (EscalationLevel::State, 120),
    (EscalationLevel::National, 168),
];

/// Seals complaint payloads at rest (XChaCha20-Poly1305, random 24-byte
/// nonce prepended to the ciphertext).
pub struct ComplaintSealer {
    cipher: XChaCha20Poly1305,
}

impl ComplaintSealer {
    /// Creates a sealer from a 32-byte key.
    #[must_use]
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(key.into()),
        }
    }

    /// Creates a sealer from a hex-encoded 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the key is not 32 hex-encoded bytes.
    pub fn from_hex(key_hex: &str) -> Result<Self, Error> {
        let bytes = hex::decode(key_hex)
            .map_err(|e| Error::Validation(format!("bad sealing key: {e}")))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Validation("sealing key must be 32 bytes".into()))?;
        Ok(Self::new(&key))
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let mut nonce = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::Transient("sealing failed".into()))?;
        let mut out = nonce.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, Error> {
        if sealed.len() < 24 {
            return Err(Error::Validation("sealed payload too short".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(24);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Validation("sealed payload unreadable".into()))
    }
}

impl std::fmt::Debug for ComplaintSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComplaintSealer").finish_non_exhaustive()
    }
}

/// A complaint as seen by an authorized reader.
#[derive(Debug, Clone, Serialize)]
pub struct Complaint {
    /// Complaint id.
    pub id: String,
    /// Submitter, absent for anonymous complaints.
    pub submitter_id: Option<String>,
    /// Category (closed set).
    pub category: String,
    /// Unsealed description.
    pub description: Option<String>,
    /// Lifecycle state.
    pub status: ComplaintStatus,
    /// Current escalation level.
    pub escalation_level: EscalationLevel,
    /// Whether the ladder is exhausted.
    pub escalation_exhausted: bool,
    /// Anonymous flag.
    pub anonymous: bool,
    /// Creation timestamp.
    pub created_at: String,
    /// Last update timestamp.
    pub updated_at: String,
    /// Current SLA deadline.
    pub sla_deadline: String,
    /// When the complaint was resolved, if it was.
    pub resolved_at: Option<String>,
    /// Officer's resolution note.
    pub resolution_note: Option<String>,
    /// Closure feedback (non-empty for every closed complaint).
    pub closure_feedback: Option<String>,
    /// Closure hash anchored on chain.
    pub closure_hash: Option<String>,
}

/// One complaint escalated by a pass, for the caller's analytics emission.
#[derive(Debug, Clone)]
pub struct EscalatedComplaint {
    /// Complaint id.
    pub complaint_id: String,
    /// Submitter (absent for anonymous complaints; no analytics for those).
    pub submitter_id: Option<String>,
    /// Category.
    pub category: String,
    /// Level after the bump.
    pub new_level: EscalationLevel,
    /// Nonce of the enqueued anchor update.
    pub anchor_nonce: u64,
}

/// Result of one escalation pass.
#[derive(Debug, Default)]
pub struct EscalationPass {
    /// Active complaints examined.
    pub checked: usize,
    /// Complaints bumped a level.
    pub escalated: Vec<EscalatedComplaint>,
    /// Complaints newly marked exhausted at national level.
    pub exhausted: usize,
}

/// The complaint SLA engine.
pub struct ComplaintService {
    store: Store,
    sealer: ComplaintSealer,
}

impl ComplaintService {
    /// Creates the service.
    #[must_use]
    pub fn new(store: Store, sealer: ComplaintSealer) -> Self {
        Self { store, sealer }
    }

    /// Seeds an SLA rule (upsert). Durations are configuration.
    ///
    /// # Errors
    ///
    /// Returns `Transient` on database failure.
    pub fn set_sla_rule(
        &self,
        category: &str,
        level: EscalationLevel,
        hours: i64,
    ) -> Result<(), Error> {
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sla_rules (category, level, hours) VALUES (?1, ?2, ?3)
                 ON CONFLICT(category, level) DO UPDATE SET hours = excluded.hours",
                params![category, level.as_str(), hours],
            )?;
            Ok(())
        })
    }

    /// SLA duration for a category at a level: rule row if present,
    /// built-in default otherwise.
    ///
    /// # Errors
    ///
    /// Returns `Transient` on database failure.
    pub fn sla_for(&self, category: &str, level: EscalationLevel) -> Result<Duration, Error> {
        self.store
            .with_conn(|conn| sla_for_conn(conn, category, level))
    }

    /// Submits a complaint. Drafts keep the SLA clock stopped until
    /// [`Self::finalize_draft`].
    ///
    /// For anonymous complaints the audit entry is scrubbed: no actor, IP,
    /// or device.
    ///
    /// # Errors
    ///
    /// `Validation` for an unknown category or empty description.
    pub fn submit(
        &self,
        actor: &ActorContext,
        submitter_id: Option<&str>,
        category: &str,
        description: &str,
        anonymous: bool,
        draft: bool,
        now: DateTime<Utc>,
    ) -> Result<Complaint, Error> {
        if !CATEGORIES.contains(&category) {
            return Err(Error::Validation(format!("unknown category: {category}")));
        }
        if description.trim().is_empty() {
            return Err(Error::Validation("description must not be empty".into()));
        }

        let submitter = if anonymous { None } else { submitter_id };
        let status = if draft {
            ComplaintStatus::Draft
        } else {
            ComplaintStatus::Submitted
        };
        let deadline = now + self.sla_for(category, EscalationLevel::District)?;
        let sealed = self.sealer.seal(description.as_bytes())?;
        let id = Uuid::new_v4().to_string();

        let audit_actor = if anonymous { actor.scrubbed() } else { actor.clone() };

        self.store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO complaints
                     (id, submitter_id, category, payload_sealed, status,
                      escalation_level, anonymous, created_at, updated_at, sla_deadline)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    id,
                    submitter,
                    category,
                    sealed,
                    status.as_str(),
                    EscalationLevel::District.as_str(),
                    anonymous,
                    fmt_ts(now),
                    fmt_ts(now),
                    fmt_ts(deadline),
                ],
            )?;

            audit::append(
                tx,
                &audit_actor,
                "complaint.create",
                "complaint",
                Some(&id),
                &serde_json::json!({ "category": category, "status": status.as_str() }),
                now,
            )?;

            if !draft {
                anchor::enqueue_create(
                    tx,
                    &AnchorView {
                        complaint_id: id.clone(),
                        category: category.to_string(),
                        status: status.as_str().to_string(),
                        escalation_level: EscalationLevel::District.as_str().to_string(),
                        created_at: now.timestamp(),
                        updated_at: now.timestamp(),
                        sla_deadline: deadline.timestamp(),
                    },
                    now,
                )?;
            }
            if let Some(submitter) = submitter {
                outbox::enqueue(
                    tx,
                    Some(submitter),
                    "sms",
                    &format!("Your complaint {id} has been received."),
                    now,
                )?;
            }
            Ok(())
        })?;

        self.get_unchecked(&id)
    }

    /// Moves a draft to `submitted`, starting the SLA clock and anchoring.
    ///
    /// # Errors
    ///
    /// `StateInvalid` if the complaint is not a draft, `Forbidden` if the
    /// caller does not own it.
    pub fn finalize_draft(
        &self,
        actor: &ActorContext,
        caller: &AuthedUser,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Complaint, Error> {
        let complaint = self.get_unchecked(id)?;
        if complaint.submitter_id.as_deref() != Some(caller.user_id.as_str()) {
            return Err(Error::Forbidden);
        }
        if complaint.status != ComplaintStatus::Draft {
            return Err(Error::StateInvalid {
                from: complaint.status.as_str().to_string(),
                to: ComplaintStatus::Submitted.as_str().to_string(),
            });
        }

        let deadline = now + self.sla_for(&complaint.category, EscalationLevel::District)?;
        self.store.with_tx(|tx| {
            tx.execute(
                "UPDATE complaints SET status = 'submitted', updated_at = ?1,
                        sla_deadline = ?2
                 WHERE id = ?3",
                params![fmt_ts(now), fmt_ts(deadline), id],
            )?;
            record_history(
                tx,
                id,
                Some(ComplaintStatus::Draft),
                ComplaintStatus::Submitted,
                complaint.escalation_level,
                complaint.escalation_level,
                Some(&caller.user_id),
                None,
                false,
                now,
            )?;
            audit::append(
                tx,
                actor,
                "complaint.submit",
                "complaint",
                Some(id),
                &serde_json::json!({ "status": "submitted" }),
                now,
            )?;
            anchor::enqueue_create(
                tx,
                &AnchorView {
                    complaint_id: id.to_string(),
                    category: complaint.category.clone(),
                    status: ComplaintStatus::Submitted.as_str().to_string(),
                    escalation_level: complaint.escalation_level.as_str().to_string(),
                    created_at: parse_ts(&complaint.created_at)?.timestamp(),
                    updated_at: now.timestamp(),
                    sla_deadline: deadline.timestamp(),
                },
                now,
            )?;
            Ok(())
        })?;
        self.get_unchecked(id)
    }

    /// Loads a complaint for a caller: the submitter or any officer.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids, `Forbidden` otherwise.
    pub fn get(&self, caller: &AuthedUser, id: &str) -> Result<Complaint, Error> {
        let complaint = self.get_unchecked(id)?;
        let is_owner = complaint.submitter_id.as_deref() == Some(caller.user_id.as_str());
        if !is_owner && !caller.is_officer() {
            return Err(Error::Forbidden);
        }
        Ok(complaint)
    }

    /// Lists complaints: officers see everything, others their own.
    ///
    /// # Errors
    ///
    /// Returns `Transient` on database failure.
    pub fn list_for(&self, caller: &AuthedUser, limit: u64) -> Result<Vec<Complaint>, Error> {
        let ids: Vec<String> = self.store.with_conn(|conn| {
            let (sql, owner) = if caller.is_officer() {
                (
                    "SELECT id FROM complaints ORDER BY created_at DESC LIMIT ?1",
                    None,
                )
            } else {
                (
                    "SELECT id FROM complaints WHERE submitter_id = ?2
                     ORDER BY created_at DESC LIMIT ?1",
                    Some(caller.user_id.clone()),
                )
            };
            let mut stmt = conn.prepare(sql)?;
            let rows: Vec<String> = match owner {
                Some(owner) => stmt
                    .query_map(params![limit as i64, owner], |row| row.get(0))?
                    .collect::<Result<_, _>>()?,
                None => stmt
                    .query_map(params![limit as i64], |row| row.get(0))?
                    .collect::<Result<_, _>>()?,
            };
            Ok(rows)
        })?;
        ids.iter().map(|id| self.get_unchecked(id)).collect()
    }

    /// Officer status update. `closed` is rejected here — closure goes
    /// through [`Self::close`] so the feedback invariant cannot be skipped.
    ///
    /// # Errors
    ///
    /// `Forbidden` for non-officers, `StateInvalid` for illegal transitions.
    pub fn update_status(
        &self,
        actor: &ActorContext,
        caller: &AuthedUser,
        id: &str,
        new_status: ComplaintStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Complaint, Error> {
        if !caller.is_officer() {
            return Err(Error::Forbidden);
        }
        let complaint = self.get_unchecked(id)?;
        // Drafts are finalized by their owner, and closure goes through
        // close(); neither is reachable from here.
        if complaint.status == ComplaintStatus::Draft
            || new_status == ComplaintStatus::Closed
            || !can_transition(complaint.status, new_status)
        {
            return Err(Error::StateInvalid {
                from: complaint.status.as_str().to_string(),
                to: new_status.as_str().to_string(),
            });
        }

        self.store.with_tx(|tx| {
            let resolved_at = if new_status == ComplaintStatus::Resolved {
                Some(fmt_ts(now))
            } else {
                None
            };
            tx.execute(
                "UPDATE complaints SET status = ?1, updated_at = ?2,
                        resolved_at = COALESCE(?3, resolved_at),
                        resolution_note = COALESCE(?4, resolution_note)
                 WHERE id = ?5",
                params![new_status.as_str(), fmt_ts(now), resolved_at, reason, id],
            )?;
            record_history(
                tx,
                id,
                Some(complaint.status),
                new_status,
                complaint.escalation_level,
                complaint.escalation_level,
                Some(&caller.user_id),
                reason,
                false,
                now,
            )?;
            audit::append(
                tx,
                actor,
                "complaint.status.update",
                "complaint",
                Some(id),
                &serde_json::json!({
                    "from": complaint.status.as_str(),
                    "to": new_status.as_str(),
                }),
                now,
            )?;
            anchor::enqueue_status_update(
                tx,
                &self.anchor_view(&complaint, new_status, complaint.escalation_level, now)?,
                now,
            )?;
            Ok(())
        })?;
        self.get_unchecked(id)
    }

    /// Closes a resolved complaint. Closure requires non-empty feedback and
    /// computes `closure_hash = H(category ‖ resolution_note ‖ feedback)`.
    ///
    /// # Errors
    ///
    /// `StateInvalid` when closing from any state but `resolved` or with
    /// empty feedback, `Forbidden` for non-officers.
    pub fn close(
        &self,
        actor: &ActorContext,
        caller: &AuthedUser,
        id: &str,
        feedback: &str,
        now: DateTime<Utc>,
    ) -> Result<Complaint, Error> {
        if !caller.is_officer() {
            return Err(Error::Forbidden);
        }
        let complaint = self.get_unchecked(id)?;
        if complaint.status != ComplaintStatus::Resolved {
            return Err(Error::StateInvalid {
                from: complaint.status.as_str().to_string(),
                to: ComplaintStatus::Closed.as_str().to_string(),
            });
        }
        if feedback.trim().is_empty() {
            return Err(Error::StateInvalid {
                from: complaint.status.as_str().to_string(),
                to: "closed without feedback".to_string(),
            });
        }

        let closure_hash = canonical::canonical_hash_hex(&serde_json::json!({
            "category": complaint.category,
            "resolution_note": complaint.resolution_note,
            "feedback": feedback,
        }))?;

        self.store.with_tx(|tx| {
            tx.execute(
                "UPDATE complaints SET status = 'closed', updated_at = ?1,
                        closure_feedback = ?2, closure_hash = ?3
                 WHERE id = ?4",
                params![fmt_ts(now), feedback, closure_hash, id],
            )?;
            record_history(
                tx,
                id,
                Some(complaint.status),
                ComplaintStatus::Closed,
                complaint.escalation_level,
                complaint.escalation_level,
                Some(&caller.user_id),
                None,
                false,
                now,
            )?;
            audit::append(
                tx,
                actor,
                "complaint.close",
                "complaint",
                Some(id),
                &serde_json::json!({ "closure_hash": closure_hash }),
                now,
            )?;
            anchor::enqueue_status_update(
                tx,
                &self.anchor_view(
                    &complaint,
                    ComplaintStatus::Closed,
                    complaint.escalation_level,
                    now,
                )?,
                now,
            )?;
            Ok(())
        })?;
        self.get_unchecked(id)
    }

    /// One SLA tick: escalates every active complaint past its deadline.
    ///
    /// Idempotent — a re-run after a crash sees the reset deadlines and
    /// does nothing until they pass again.
    ///
    /// # Errors
    ///
    /// Returns `Transient` on database failure; per-complaint anchor
    /// enqueueing failures roll back only that complaint's bump.
    pub fn run_escalation_pass(&self, now: DateTime<Utc>) -> Result<EscalationPass, Error> {
        let due: Vec<String> = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM complaints
                 WHERE status IN ('submitted', 'under_review', 'in_progress', 'escalated')
                   AND sla_deadline < ?1
                 ORDER BY sla_deadline ASC",
            )?;
            let ids = stmt
                .query_map(params![fmt_ts(now)], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })?;

        let mut pass = EscalationPass {
            checked: due.len(),
            ..EscalationPass::default()
        };

        for id in due {
            match self.escalate_one(&id, now) {
                Ok(Some(escalated)) => pass.escalated.push(escalated),
                Ok(None) => pass.exhausted += 1,
                Err(err) => {
                    tracing::warn!(complaint = %id, error = %err, "escalation skipped");
                },
            }
        }
        Ok(pass)
    }

    fn escalate_one(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<EscalatedComplaint>, Error> {
        let complaint = self.get_unchecked(id)?;
        if !complaint.status.is_active() {
            return Err(Error::Conflict("no longer active".into()));
        }

        let Some(new_level) = complaint.escalation_level.next() else {
            if !complaint.escalation_exhausted {
                self.store.with_tx(|tx| {
                    tx.execute(
                        "UPDATE complaints SET escalation_exhausted = 1, updated_at = ?1
                         WHERE id = ?2",
                        params![fmt_ts(now), id],
                    )?;
                    audit::append(
                        tx,
                        &ActorContext::system(),
                        "complaint.escalation_exhausted",
                        "complaint",
                        Some(id),
                        &serde_json::json!({ "level": complaint.escalation_level.as_str() }),
                        now,
                    )?;
                    Ok(())
                })?;
            }
            return Ok(None);
        };

        let new_deadline = now + self.sla_for(&complaint.category, new_level)?;
        let nonce = self.store.with_tx(|tx| {
            tx.execute(
                "UPDATE complaints SET status = 'escalated', escalation_level = ?1,
                        sla_deadline = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![new_level.as_str(), fmt_ts(new_deadline), fmt_ts(now), id],
            )?;
            record_history(
                tx,
                id,
                Some(complaint.status),
                ComplaintStatus::Escalated,
                complaint.escalation_level,
                new_level,
                None,
                Some("sla_breach"),
                true,
                now,
            )?;
            audit::append(
                tx,
                &ActorContext::system(),
                "complaint.escalate",
                "complaint",
                Some(id),
                &serde_json::json!({
                    "from_level": complaint.escalation_level.as_str(),
                    "to_level": new_level.as_str(),
                }),
                now,
            )?;
            anchor::enqueue_status_update(
                tx,
                &AnchorView {
                    complaint_id: id.to_string(),
                    category: complaint.category.clone(),
                    status: ComplaintStatus::Escalated.as_str().to_string(),
                    escalation_level: new_level.as_str().to_string(),
                    created_at: parse_ts(&complaint.created_at)?.timestamp(),
                    updated_at: now.timestamp(),
                    sla_deadline: new_deadline.timestamp(),
                },
                now,
            )
        })?;

        Ok(Some(EscalatedComplaint {
            complaint_id: id.to_string(),
            submitter_id: complaint.submitter_id,
            category: complaint.category,
            new_level,
            anchor_nonce: nonce,
        }))
    }

    fn anchor_view(
        &self,
        complaint: &Complaint,
        status: ComplaintStatus,
        level: EscalationLevel,
        now: DateTime<Utc>,
    ) -> Result<AnchorView, Error> {
        Ok(AnchorView {
            complaint_id: complaint.id.clone(),
            category: complaint.category.clone(),
            status: status.as_str().to_string(),
            escalation_level: level.as_str().to_string(),
            created_at: parse_ts(&complaint.created_at)?.timestamp(),
            updated_at: now.timestamp(),
            sla_deadline: parse_ts(&complaint.sla_deadline)?.timestamp(),
        })
    }

    fn get_unchecked(&self, id: &str) -> Result<Complaint, Error> {
        let row = self.store.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, submitter_id, category, payload_sealed, status,
                            escalation_level, escalation_exhausted, anonymous,
                            created_at, updated_at, sla_deadline, resolved_at,
                            resolution_note, closure_feedback, closure_hash
                     FROM complaints WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<Vec<u8>>>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, bool>(6)?,
                            row.get::<_, bool>(7)?,
                            row.get::<_, String>(8)?,
                            row.get::<_, String>(9)?,
                            row.get::<_, String>(10)?,
                            row.get::<_, Option<String>>(11)?,
                            row.get::<_, Option<String>>(12)?,
                            row.get::<_, Option<String>>(13)?,
                            row.get::<_, Option<String>>(14)?,
                        ))
                    },
                )
                .optional()?;
            row.ok_or(Error::NotFound("complaint"))
        })?;

        let description = match &row.3 {
            Some(sealed) => Some(
                String::from_utf8(self.sealer.open(sealed)?)
                    .map_err(|_| Error::Validation("sealed payload not UTF-8".into()))?,
            ),
            None => None,
        };

        Ok(Complaint {
            id: row.0,
            submitter_id: row.1,
            category: row.2,
            description,
            status: ComplaintStatus::parse(&row.4)?,
            escalation_level: EscalationLevel::parse(&row.5)?,
            escalation_exhausted: row.6,
            anonymous: row.7,
            created_at: row.8,
            updated_at: row.9,
            sla_deadline: row.10,
            resolved_at: row.11,
            resolution_note: row.12,
            closure_feedback: row.13,
            closure_hash: row.14,
        })
    }
}

impl std::fmt::Debug for ComplaintService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComplaintService").finish_non_exhaustive()
    }
}

fn sla_for_conn(
    conn: &Connection,
    category: &str,
    level: EscalationLevel,
) -> Result<Duration, Error> {
    let hours: Option<i64> = conn
        .query_row(
            "SELECT hours FROM sla_rules WHERE category = ?1 AND level = ?2",
            params![category, level.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    let hours = hours.unwrap_or_else(|| {
        DEFAULT_SLA_HOURS
            .iter()
            .find(|(l, _)| *l == level)
            .map_or(72, |(_, h)| *h)
    });
    Ok(Duration::hours(hours))
}

#[allow(clippy::too_many_arguments)]
fn record_history(
    tx: &Transaction<'_>,
    complaint_id: &str,
    old_status: Option<ComplaintStatus>,
    new_status: ComplaintStatus,
    old_level: EscalationLevel,
    new_level: EscalationLevel,
    changed_by: Option<&str>,
    reason: Option<&str>,
    auto: bool,
    now: DateTime<Utc>,
) -> Result<(), Error> {
    tx.execute(
        "INSERT INTO complaint_history
             (id, complaint_id, old_status, new_status, old_level, new_level,
              changed_by, reason, auto, ts)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            Uuid::new_v4().to_string(),
            complaint_id,
            old_status.map(ComplaintStatus::as_str),
            new_status.as_str(),
            old_level.as_str(),
            new_level.as_str(),
            changed_by,
            reason,
            auto,
            fmt_ts(now),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Role;

    fn sealer() -> ComplaintSealer {
        ComplaintSealer::new(&[7u8; 32])
    }

    fn officer() -> AuthedUser {
        AuthedUser {
            user_id: "officer-1".into(),
            roles: vec![Role::DistrictOfficer],
        }
    }

    fn citizen(id: &str) -> AuthedUser {
        AuthedUser {
            user_id: id.into(),
            roles: vec![Role::Citizen],
        }
    }

    fn service() -> ComplaintService {
        ComplaintService::new(Store::in_memory().unwrap(), sealer())
    }

    fn submit(service: &ComplaintService, now: DateTime<Utc>) -> Complaint {
        service
            .submit(
                &ActorContext::user("u-1"),
                Some("u-1"),
                "service_quality",
                "no doctor present at the PHC",
                false,
                false,
                now,
            )
            .unwrap()
    }

    #[test]
    fn transition_table() {
        use ComplaintStatus as S;
        assert!(can_transition(S::Draft, S::Submitted));
        assert!(can_transition(S::Submitted, S::UnderReview));
        assert!(can_transition(S::UnderReview, S::InProgress));
        assert!(can_transition(S::InProgress, S::Resolved));
        assert!(can_transition(S::Resolved, S::Closed));
        assert!(can_transition(S::InProgress, S::Escalated));
        assert!(can_transition(S::Escalated, S::InProgress));
        assert!(!can_transition(S::Closed, S::Submitted));
        assert!(!can_transition(S::Submitted, S::Resolved));
        assert!(!can_transition(S::Draft, S::Escalated));
    }

    #[test]
    fn sealer_round_trip_and_tamper_detection() {
        let sealer = sealer();
        let sealed = sealer.seal(b"the nurse was absent").unwrap();
        assert_eq!(sealer.open(&sealed).unwrap(), b"the nurse was absent");

        let mut corrupted = sealed;
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xff;
        assert!(sealer.open(&corrupted).is_err());
    }

    #[test]
    fn submit_sets_sla_deadline_and_anchors() {
        let service = service();
        let now = Utc::now();
        let complaint = submit(&service, now);

        assert_eq!(complaint.status, ComplaintStatus::Submitted);
        assert_eq!(complaint.escalation_level, EscalationLevel::District);
        let deadline = parse_ts(&complaint.sla_deadline).unwrap();
        assert_eq!(deadline - now, Duration::hours(72));

        let jobs: i64 = service
            .store
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM anchor_jobs", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(jobs, 1);
        assert_eq!(
            complaint.description.as_deref(),
            Some("no doctor present at the PHC")
        );
    }

    #[test]
    fn anonymous_submission_scrubs_audit() {
        let service = service();
        let actor = ActorContext {
            actor_id: Some("u-9".into()),
            ip: Some("10.1.2.3".into()),
            device: Some("dev-9".into()),
        };
        let complaint = service
            .submit(&actor, Some("u-9"), "other", "grievance", true, false, Utc::now())
            .unwrap();
        assert!(complaint.submitter_id.is_none());
        assert!(complaint.anonymous);

        let entries = service
            .store
            .with_conn(|conn| crate::audit::list(conn, 10))
            .unwrap();
        let entry = entries
            .iter()
            .find(|e| e.action == "complaint.create")
            .unwrap();
        assert!(entry.actor_id.is_none());
        assert!(entry.ip.is_none());
        assert!(entry.device.is_none());
    }

    #[test]
    fn closure_requires_resolved_state_and_feedback() {
        let service = service();
        let now = Utc::now();
        let complaint = submit(&service, now);
        let officer = officer();
        let actor = ActorContext::user(&officer.user_id);

        // Closing straight from submitted is illegal.
        assert!(matches!(
            service.close(&actor, &officer, &complaint.id, "fine", now),
            Err(Error::StateInvalid { .. })
        ));

        service
            .update_status(&actor, &officer, &complaint.id, ComplaintStatus::UnderReview, None, now)
            .unwrap();
        service
            .update_status(&actor, &officer, &complaint.id, ComplaintStatus::InProgress, None, now)
            .unwrap();
        service
            .update_status(
                &actor,
                &officer,
                &complaint.id,
                ComplaintStatus::Resolved,
                Some("staffed the PHC"),
                now,
            )
            .unwrap();

        // Empty feedback violates the closure invariant.
        assert!(matches!(
            service.close(&actor, &officer, &complaint.id, "  ", now),
            Err(Error::StateInvalid { .. })
        ));

        let closed = service
            .close(&actor, &officer, &complaint.id, "issue addressed, thank you", now)
            .unwrap();
        assert_eq!(closed.status, ComplaintStatus::Closed);
        assert_eq!(
            closed.closure_feedback.as_deref(),
            Some("issue addressed, thank you")
        );
        assert!(closed.closure_hash.is_some());

        // Closed is terminal.
        assert!(matches!(
            service.update_status(
                &actor,
                &officer,
                &complaint.id,
                ComplaintStatus::UnderReview,
                None,
                now
            ),
            Err(Error::StateInvalid { .. })
        ));
    }

    #[test]
    fn update_status_cannot_smuggle_closed() {
        let service = service();
        let now = Utc::now();
        let complaint = submit(&service, now);
        let officer = officer();
        assert!(matches!(
            service.update_status(
                &ActorContext::user(&officer.user_id),
                &officer,
                &complaint.id,
                ComplaintStatus::Closed,
                None,
                now
            ),
            Err(Error::StateInvalid { .. })
        ));
    }

    #[test]
    fn non_officer_cannot_update_status() {
        let service = service();
        let now = Utc::now();
        let complaint = submit(&service, now);
        assert!(matches!(
            service.update_status(
                &ActorContext::user("u-1"),
                &citizen("u-1"),
                &complaint.id,
                ComplaintStatus::UnderReview,
                None,
                now
            ),
            Err(Error::Forbidden)
        ));
    }

    #[test]
    fn ownership_guard_on_reads() {
        let service = service();
        let complaint = submit(&service, Utc::now());
        assert!(service.get(&citizen("u-1"), &complaint.id).is_ok());
        assert!(matches!(
            service.get(&citizen("u-2"), &complaint.id),
            Err(Error::Forbidden)
        ));
        assert!(service.get(&officer(), &complaint.id).is_ok());
    }

    #[test]
    fn escalation_bumps_level_resets_deadline_and_increments_nonce() {
        let service = service();
        service
            .set_sla_rule("service_quality", EscalationLevel::District, 0)
            .unwrap();
        let now = Utc::now();
        let complaint = submit(&service, now);

        // SLA of zero hours: already overdue one tick later.
        let tick = now + Duration::seconds(70);
        let pass = service.run_escalation_pass(tick).unwrap();
        assert_eq!(pass.escalated.len(), 1);
        let escalated = &pass.escalated[0];
        assert_eq!(escalated.new_level, EscalationLevel::State);
        assert_eq!(escalated.anchor_nonce, 2, "create took nonce 1");

        let reloaded = service.get(&officer(), &complaint.id).unwrap();
        assert_eq!(reloaded.status, ComplaintStatus::Escalated);
        assert_eq!(reloaded.escalation_level, EscalationLevel::State);
        assert!(parse_ts(&reloaded.sla_deadline).unwrap() > tick);

        // A second pass before the new deadline is a no-op.
        let pass = service.run_escalation_pass(tick).unwrap();
        assert!(pass.escalated.is_empty());
    }

    #[test]
    fn escalation_exhausts_at_national() {
        let service = service();
        for level in [
            EscalationLevel::District,
            EscalationLevel::State,
            EscalationLevel::National,
        ] {
            service.set_sla_rule("other", level, 0).unwrap();
        }
        let now = Utc::now();
        let complaint = service
            .submit(
                &ActorContext::user("u-1"),
                Some("u-1"),
                "other",
                "unresolved forever",
                false,
                false,
                now,
            )
            .unwrap();

        let mut tick = now;
        for expected in [EscalationLevel::State, EscalationLevel::National] {
            tick += Duration::minutes(1);
            let pass = service.run_escalation_pass(tick).unwrap();
            assert_eq!(pass.escalated[0].new_level, expected);
        }

        tick += Duration::minutes(1);
        let pass = service.run_escalation_pass(tick).unwrap();
        assert!(pass.escalated.is_empty());
        assert_eq!(pass.exhausted, 1);
        let reloaded = service.get(&officer(), &complaint.id).unwrap();
        assert!(reloaded.escalation_exhausted);

        // Exhaustion is recorded once.
        tick += Duration::minutes(1);
        let pass = service.run_escalation_pass(tick).unwrap();
        assert_eq!(pass.exhausted, 1);
    }

    #[test]
    fn draft_keeps_clock_stopped_until_finalized() {
        let service = service();
        let now = Utc::now();
        let draft = service
            .submit(
                &ActorContext::user("u-1"),
                Some("u-1"),
                "other",
                "still typing",
                false,
                true,
                now,
            )
            .unwrap();
        assert_eq!(draft.status, ComplaintStatus::Draft);

        // No anchor job for drafts.
        let jobs: i64 = service
            .store
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM anchor_jobs", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(jobs, 0);

        let finalized = service
            .finalize_draft(
                &ActorContext::user("u-1"),
                &citizen("u-1"),
                &draft.id,
                now + Duration::minutes(5),
            )
            .unwrap();
        assert_eq!(finalized.status, ComplaintStatus::Submitted);
    }

    #[test]
    fn escalated_complaint_can_be_reassigned() {
        let service = service();
        service
            .set_sla_rule("service_quality", EscalationLevel::District, 0)
            .unwrap();
        let now = Utc::now();
        let complaint = submit(&service, now);
        service.run_escalation_pass(now + Duration::minutes(1)).unwrap();

        let officer = officer();
        let back = service
            .update_status(
                &ActorContext::user(&officer.user_id),
                &officer,
                &complaint.id,
                ComplaintStatus::InProgress,
                Some("reassigned to state team"),
                now + Duration::minutes(2),
            )
            .unwrap();
        assert_eq!(back.status, ComplaintStatus::InProgress);
        assert_eq!(back.escalation_level, EscalationLevel::State);
    }
}
