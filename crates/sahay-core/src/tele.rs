//! Tele-consultation requests and prescriptions.
//!
//! A request moves forward-only through
//! `requested → scheduled → in_progress → completed`; status transitions
//! are a clinician operation. Prescriptions hang off a request and carry a
//! patient-facing summary constrained to 160–300 characters.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use uuid::Uuid;

use crate::audit::{self, ActorContext};
use crate::error::Error;
use crate::identity::{AuthedUser, Role};
use crate::store::{Store, fmt_ts};

/// Prescription summary length bounds (characters).
pub const SUMMARY_MIN_CHARS: usize = 160;
pub const SUMMARY_MAX_CHARS: usize = 300;

/// Tele request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TeleStatus {
    Requested,
    Scheduled,
    InProgress,
    Completed,
}

impl TeleStatus {
    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Scheduled => "scheduled",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }

    /// Parses the stable string form.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for anything outside the closed set.
    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "requested" => Ok(Self::Requested),
            "scheduled" => Ok(Self::Scheduled),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            other => Err(Error::Validation(format!("unknown tele status: {other}"))),
        }
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Requested => 0,
            Self::Scheduled => 1,
            Self::InProgress => 2,
            Self::Completed => 3,
        }
    }
}

/// Forward-only, one step at a time.
#[must_use]
pub const fn can_transition(from: TeleStatus, to: TeleStatus) -> bool {
    to.rank() == from.rank() + 1
}

/// A tele-consultation request.
#[derive(Debug, Clone, Serialize)]
pub struct TeleRequest {
    /// Request id.
    pub id: String,
    /// Requesting citizen.
    pub citizen_id: String,
    /// Assigned clinician, once scheduled.
    pub clinician_id: Option<String>,
    /// Lifecycle state.
    pub status: TeleStatus,
    /// Symptom summary from the citizen.
    pub symptom_summary: String,
    /// Preferred slot, free-form.
    pub preferred_time: Option<String>,
    /// Creation timestamp.
    pub created_at: String,
    /// Last update timestamp.
    pub updated_at: String,
}

/// A prescription issued during a consultation.
#[derive(Debug, Clone, Serialize)]
pub struct Prescription {
    /// Prescription id.
    pub id: String,
    /// Consultation it belongs to.
    pub tele_request_id: String,
    /// Issuing clinician.
    pub clinician_id: String,
    /// Structured items.
    pub items: Vec<serde_json::Value>,
    /// Patient-facing summary (160–300 chars).
    pub summary_text: String,
    /// Creation timestamp.
    pub created_at: String,
}

/// Tele-consultation operations.
#[derive(Debug, Clone)]
pub struct TeleService {
    store: Store,
}

impl TeleService {
    /// Creates the service.
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Creates a request for the calling citizen.
    ///
    /// # Errors
    ///
    /// `Validation` for an empty symptom summary.
    pub fn create_request(
        &self,
        actor: &ActorContext,
        citizen_id: &str,
        symptom_summary: &str,
        preferred_time: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TeleRequest, Error> {
        if symptom_summary.trim().is_empty() {
            return Err(Error::Validation("symptom summary must not be empty".into()));
        }
        let request = TeleRequest {
            id: Uuid::new_v4().to_string(),
            citizen_id: citizen_id.to_string(),
            clinician_id: None,
            status: TeleStatus::Requested,
            symptom_summary: symptom_summary.to_string(),
            preferred_time: preferred_time.map(str::to_string),
            created_at: fmt_ts(now),
            updated_at: fmt_ts(now),
        };

        self.store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO tele_requests
                     (id, citizen_id, clinician_id, status, symptom_summary,
                      preferred_time, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    request.id,
                    request.citizen_id,
                    request.clinician_id,
                    request.status.as_str(),
                    request.symptom_summary,
                    request.preferred_time,
                    request.created_at,
                    request.updated_at,
                ],
            )?;
            audit::append(
                tx,
                actor,
                "tele.request.create",
                "tele_request",
                Some(&request.id),
                &serde_json::json!({}),
                now,
            )?;
            Ok(())
        })?;
        Ok(request)
    }

    /// Loads a request for its citizen, its clinician, or any clinician
    /// while unassigned.
    ///
    /// # Errors
    ///
    /// `NotFound` or `Forbidden`.
    pub fn get(&self, caller: &AuthedUser, id: &str) -> Result<TeleRequest, Error> {
        let request = self.get_unchecked(id)?;
        let is_citizen = request.citizen_id == caller.user_id;
        let is_assigned = request.clinician_id.as_deref() == Some(caller.user_id.as_str());
        let is_unassigned_clinician =
            request.clinician_id.is_none() && caller.has_role(Role::Clinician);
        if !(is_citizen || is_assigned || is_unassigned_clinician) {
            return Err(Error::Forbidden);
        }
        Ok(request)
    }

    /// Advances the request one step. Clinician-only; scheduling assigns
    /// the calling clinician.
    ///
    /// # Errors
    ///
    /// `Forbidden` for non-clinicians, `StateInvalid` for skips or
    /// regressions.
    pub fn update_status(
        &self,
        actor: &ActorContext,
        caller: &AuthedUser,
        id: &str,
        new_status: TeleStatus,
        now: DateTime<Utc>,
    ) -> Result<TeleRequest, Error> {
        caller.require_any(&[Role::Clinician])?;
        let request = self.get_unchecked(id)?;
        if !can_transition(request.status, new_status) {
            return Err(Error::StateInvalid {
                from: request.status.as_str().to_string(),
                to: new_status.as_str().to_string(),
            });
        }

        let clinician_id = request
            .clinician_id
            .clone()
            .unwrap_or_else(|| caller.user_id.clone());

        self.store.with_tx(|tx| {
            tx.execute(
                "UPDATE tele_requests SET status = ?1, clinician_id = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![new_status.as_str(), clinician_id, fmt_ts(now), id],
            )?;
            audit::append(
                tx,
                actor,
                "tele.request.status",
                "tele_request",
                Some(id),
                &serde_json::json!({
                    "from": request.status.as_str(),
                    "to": new_status.as_str(),
                }),
                now,
            )?;
            if new_status == TeleStatus::Scheduled {
                crate::outbox::enqueue(
                    tx,
                    Some(&request.citizen_id),
                    "sms",
                    "Your tele-consultation has been scheduled.",
                    now,
                )?;
            }
            Ok(())
        })?;
        self.get_unchecked(id)
    }

    /// Issues a prescription against an in-progress or completed
    /// consultation.
    ///
    /// # Errors
    ///
    /// `Forbidden` for non-clinicians, `Validation` for a summary outside
    /// 160–300 characters, `StateInvalid` before the consultation started.
    pub fn create_prescription(
        &self,
        actor: &ActorContext,
        caller: &AuthedUser,
        tele_request_id: &str,
        items: &[serde_json::Value],
        summary_text: &str,
        now: DateTime<Utc>,
    ) -> Result<Prescription, Error> {
        caller.require_any(&[Role::Clinician])?;

        let chars = summary_text.chars().count();
        if !(SUMMARY_MIN_CHARS..=SUMMARY_MAX_CHARS).contains(&chars) {
            return Err(Error::Validation(format!(
                "summary must be {SUMMARY_MIN_CHARS}-{SUMMARY_MAX_CHARS} characters, got {chars}"
            )));
        }

        let request = self.get_unchecked(tele_request_id)?;
        if !matches!(request.status, TeleStatus::InProgress | TeleStatus::Completed) {
            return Err(Error::StateInvalid {
                from: request.status.as_str().to_string(),
                to: "prescription".to_string(),
            });
        }

        let prescription = Prescription {
            id: Uuid::new_v4().to_string(),
            tele_request_id: tele_request_id.to_string(),
            clinician_id: caller.user_id.clone(),
            items: items.to_vec(),
            summary_text: summary_text.to_string(),
            created_at: fmt_ts(now),
        };

        self.store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO prescriptions
                     (id, tele_request_id, clinician_id, items_json, summary_text, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    prescription.id,
                    prescription.tele_request_id,
                    prescription.clinician_id,
                    serde_json::to_string(&prescription.items)?,
                    prescription.summary_text,
                    prescription.created_at,
                ],
            )?;
            audit::append(
                tx,
                actor,
                "prescription.create",
                "prescription",
                Some(&prescription.id),
                &serde_json::json!({ "item_count": prescription.items.len() }),
                now,
            )?;
            Ok(())
        })?;
        Ok(prescription)
    }

    fn get_unchecked(&self, id: &str) -> Result<TeleRequest, Error> {
        let row = self.store.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, citizen_id, clinician_id, status, symptom_summary,
                            preferred_time, created_at, updated_at
                     FROM tele_requests WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, Option<String>>(5)?,
                            row.get::<_, String>(6)?,
                            row.get::<_, String>(7)?,
                        ))
                    },
                )
                .optional()?;
            row.ok_or(Error::NotFound("tele request"))
        })?;

        Ok(TeleRequest {
            id: row.0,
            citizen_id: row.1,
            clinician_id: row.2,
            status: TeleStatus::parse(&row.3)?,
            symptom_summary: row.4,
            preferred_time: row.5,
            created_at: row.6,
            updated_at: row.7,
        })
    }
}
