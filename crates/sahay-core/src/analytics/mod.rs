//! De-identified analytics pipeline.
//!
//! Emission is consent-gated (`analytics` + `gov_aggregated`, checked at
//! emission time against committed state) and strictly de-identified: a
//! closed event-type allow-list, per-event-type category allow-lists, no
//! disallowed keys anywhere in the payload, 15-minute time buckets, age
//! buckets, and district-level geo cells.
//!
//! Accepted events land in the in-memory aggregation buffer and are flushed
//! as UPSERTs into `aggregated_events` when the buffer holds
//! [`buffer::FLUSH_THRESHOLD`] keys, when the flush timer fires, or on an
//! explicit flush. Query-time k-anonymity lives in [`query`].

pub mod buffer;
pub mod query;

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};
use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use uuid::Uuid;

use crate::anchor::ensure_no_disallowed_keys;
use crate::audit::{self, ActorContext};
use crate::consent::{ConsentCategory, ConsentScope, ConsentService};
use crate::error::Error;
use crate::store::{Store, fmt_ts};

use self::buffer::{AggKey, AggregationBuffer, FLUSH_THRESHOLD};

/// Time bucket width in minutes.
pub const TIME_BUCKET_MINUTES: u32 = 15;

/// Default k-anonymity threshold.
pub const DEFAULT_K_THRESHOLD: i64 = 5;

/// The closed event-type allow-list.
pub const ALLOWED_EVENT_TYPES: [&str; 10] = [
    "triage_completed",
    "triage_emergency",
    "complaint_submitted",
    "complaint_resolved",
    "complaint_escalated",
    "vaccination_recorded",
    "neuroscreen_completed",
    "daily_wellness_logged",
    "tele_request_created",
    "tele_consultation_completed",
];

const TRIAGE_CATEGORIES: [&str; 3] = ["self_care", "phc", "emergency"];
const NEURO_BANDS: [&str; 3] = ["low", "medium", "high"];

/// Categories allowed for an event type. Empty means "no category": only
/// the implicit `unknown` is accepted.
#[must_use]
pub fn allowed_categories(event_type: &str) -> &'static [&'static str] {
    match event_type {
        "triage_completed" | "triage_emergency" => &TRIAGE_CATEGORIES,
        "complaint_submitted" | "complaint_resolved" | "complaint_escalated" => {
            &crate::complaint::CATEGORIES
        },
        "neuroscreen_completed" => &NEURO_BANDS,
        _ => &[],
    }
}

/// Floors a timestamp to its 15-minute bucket.
#[must_use]
pub fn time_bucket(at: DateTime<Utc>) -> DateTime<Utc> {
    let minute = at.time().minute() - (at.time().minute() % TIME_BUCKET_MINUTES);
    Utc.with_ymd_and_hms(at.year(), at.month(), at.day(), at.hour(), minute, 0)
        .single()
        .unwrap_or(at)
}

/// Buckets an age in years.
#[must_use]
pub fn age_bucket(age: Option<u32>) -> &'static str {
    match age {
        None => "unknown",
        Some(a) if a <= 5 => "0-5",
        Some(a) if a <= 12 => "6-12",
        Some(a) if a <= 18 => "13-18",
        Some(a) if a <= 35 => "19-35",
        Some(a) if a <= 60 => "36-60",
        Some(_) => "60+",
    }
}

/// District-level geo cell from a pincode: `pincode_<first3>xxx`.
///
/// The production path may substitute an H3 cell at resolution 7; the
/// district prefix keeps the pilot independent of a geocoder.
#[must_use]
pub fn geo_cell_from_pincode(pincode: Option<&str>) -> String {
    match pincode {
        Some(p) if p.len() >= 3 && p.chars().take(3).all(|c| c.is_ascii_digit()) => {
            format!("pincode_{}xxx", &p[..3])
        },
        _ => "unknown".to_string(),
    }
}

/// A de-identified event as stored in `analytics_events.payload_json`.
#[derive(Debug, Clone, Serialize)]
pub struct DeidentifiedEvent {
    /// Event type from the allow-list.
    pub event_type: String,
    /// Category (or `unknown`).
    pub category: String,
    /// 15-minute bucket.
    pub event_time: String,
    /// Age bucket.
    pub age_bucket: String,
    /// Gender (or `unknown`).
    pub gender: String,
    /// District-level geo cell.
    pub geo_cell: String,
    /// Count folded into aggregation.
    pub count: i64,
    /// PII-free metadata.
    pub metadata: serde_json::Value,
    /// Payload schema version.
    pub schema_version: String,
}

/// The analytics pipeline service.
pub struct AnalyticsService {
    store: Store,
    consents: ConsentService,
    buffer: Arc<Mutex<AggregationBuffer>>,
    k_threshold: i64,
}

impl AnalyticsService {
    /// Creates the pipeline with the default k threshold.
    #[must_use]
    pub fn new(store: Store, consents: ConsentService) -> Self {
        Self::with_k_threshold(store, consents, DEFAULT_K_THRESHOLD)
    }

    /// Creates the pipeline with a configured k threshold.
    #[must_use]
    pub fn with_k_threshold(store: Store, consents: ConsentService, k_threshold: i64) -> Self {
        Self {
            store,
            consents,
            buffer: Arc::new(Mutex::new(AggregationBuffer::new())),
            k_threshold,
        }
    }

    /// The k-anonymity threshold applied by every query.
    #[must_use]
    pub const fn k_threshold(&self) -> i64 {
        self.k_threshold
    }

    /// Distinct keys currently buffered (monitoring surface).
    #[must_use]
    pub fn buffered_keys(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    /// Emits one event. Consent is checked at emission time; revocation
    /// blocks the next call.
    ///
    /// # Errors
    ///
    /// `ConsentMissing` without `analytics`/`gov_aggregated`;
    /// `InvalidPayload` for allow-list or disallowed-key violations.
    pub fn emit(
        &self,
        actor: &ActorContext,
        user_id: &str,
        event_type: &str,
        category: Option<&str>,
        metadata: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<DeidentifiedEvent, Error> {
        self.consents.require(
            user_id,
            ConsentCategory::Analytics,
            ConsentScope::GovAggregated,
            now,
        )?;

        if !ALLOWED_EVENT_TYPES.contains(&event_type) {
            return Err(Error::InvalidPayload(format!(
                "event_type {event_type} is not in the allow-list"
            )));
        }
        if let Some(category) = category {
            if !allowed_categories(event_type).contains(&category) {
                return Err(Error::InvalidPayload(format!(
                    "category {category} is not allowed for {event_type}"
                )));
            }
        }
        let metadata = metadata.unwrap_or_else(|| serde_json::json!({}));
        if !metadata.is_object() {
            return Err(Error::InvalidPayload("metadata must be an object".into()));
        }
        ensure_no_disallowed_keys(&metadata)?;

        let (age, gender, pincode) = self.user_demographics(user_id)?;
        let event = DeidentifiedEvent {
            event_type: event_type.to_string(),
            category: category.unwrap_or("unknown").to_string(),
            event_time: fmt_ts(time_bucket(now)),
            age_bucket: age_bucket(age).to_string(),
            gender,
            geo_cell: geo_cell_from_pincode(pincode.as_deref()),
            count: 1,
            metadata,
            schema_version: crate::REPORT_VERSION.to_string(),
        };

        // The stored payload must satisfy the same guard it promises.
        let payload = serde_json::to_value(&event)?;
        ensure_no_disallowed_keys(&payload)?;

        self.store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO analytics_events (id, user_id, event_type, payload_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    Uuid::new_v4().to_string(),
                    user_id,
                    event.event_type,
                    serde_json::to_string(&payload)?,
                    fmt_ts(now),
                ],
            )?;
            audit::append(
                tx,
                actor,
                "analytics.emit",
                "analytics_event",
                None,
                &serde_json::json!({ "event_type": event.event_type }),
                now,
            )?;
            Ok(())
        })?;

        let buffered = {
            let mut buffer = self.buffer.lock().unwrap();
            buffer.add(
                AggKey {
                    event_type: event.event_type.clone(),
                    category: event.category.clone(),
                    time_bucket: event.event_time.clone(),
                    geo_cell: event.geo_cell.clone(),
                    age_bucket: event.age_bucket.clone(),
                    gender: event.gender.clone(),
                },
                event.count,
                now,
            )
        };
        if buffered >= FLUSH_THRESHOLD {
            self.flush(now)?;
        }

        Ok(event)
    }

    /// Emits if consent allows, silently skipping otherwise. Handlers use
    /// this so analytics never block the main flow.
    ///
    /// # Errors
    ///
    /// Propagates everything except `ConsentMissing`.
    pub fn emit_opportunistic(
        &self,
        actor: &ActorContext,
        user_id: Option<&str>,
        event_type: &str,
        category: Option<&str>,
        metadata: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<Option<DeidentifiedEvent>, Error> {
        // Anonymous actors have no consent subject; nothing to emit.
        let Some(user_id) = user_id else {
            return Ok(None);
        };
        match self.emit(actor, user_id, event_type, category, metadata, now) {
            Ok(event) => Ok(Some(event)),
            Err(Error::ConsentMissing { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Flushes the buffer: drain under the lock, upsert after releasing it.
    /// Returns the number of keys flushed.
    ///
    /// # Errors
    ///
    /// Returns `Transient` on database failure.
    pub fn flush(&self, now: DateTime<Utc>) -> Result<usize, Error> {
        let drained = {
            let mut buffer = self.buffer.lock().unwrap();
            buffer.drain()
        };
        if drained.is_empty() {
            return Ok(0);
        }

        let count = drained.len();
        self.store.with_tx(|tx| {
            for (key, entry) in &drained {
                tx.execute(
                    "INSERT INTO aggregated_events
                         (event_type, category, time_bucket, geo_cell, age_bucket,
                          gender, count, first_seen, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT(event_type, category, time_bucket, geo_cell, age_bucket, gender)
                     DO UPDATE SET count = count + excluded.count,
                                   updated_at = excluded.updated_at",
                    params![
                        key.event_type,
                        key.category,
                        key.time_bucket,
                        key.geo_cell,
                        key.age_bucket,
                        key.gender,
                        entry.count,
                        fmt_ts(entry.first_seen),
                        fmt_ts(now),
                    ],
                )?;
            }
            Ok(())
        })?;

        tracing::debug!(keys = count, "aggregation buffer flushed");
        Ok(count)
    }

    fn user_demographics(
        &self,
        user_id: &str,
    ) -> Result<(Option<u32>, String, Option<String>), Error> {
        let row: Option<(Option<String>, Option<String>, Option<String>)> =
            self.store.with_conn(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT dob, sex, pincode FROM profiles WHERE user_id = ?1",
                        params![user_id],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .optional()?)
            })?;

        let Some((dob, sex, pincode)) = row else {
            return Ok((None, "unknown".to_string(), None));
        };
        let age = dob.as_deref().and_then(age_from_dob);
        let gender = sex.unwrap_or_else(|| "unknown".to_string());
        Ok((age, gender, pincode))
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }
}

impl std::fmt::Debug for AnalyticsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyticsService")
            .field("k_threshold", &self.k_threshold)
            .finish_non_exhaustive()
    }
}

fn age_from_dob(dob: &str) -> Option<u32> {
    let date = NaiveDate::parse_from_str(dob, "%Y-%m-%d").ok()?;
    let today = Utc::now().date_naive();
    let mut age = today.year() - date.year();
    if (today.month(), today.day()) < (date.month(), date.day()) {
        age -= 1;
    }
    u32::try_from(age).ok()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::parse_ts;

    fn setup() -> (AnalyticsService, ConsentService, Store) {
        let store = Store::in_memory().unwrap();
        let consents = ConsentService::new(store.clone());
        let analytics = AnalyticsService::new(store.clone(), consents.clone());
        (analytics, consents, store)
    }

    fn grant(consents: &ConsentService, user: &str, now: DateTime<Utc>) {
        consents
            .grant(
                &ActorContext::system(),
                user,
                ConsentCategory::Analytics,
                ConsentScope::GovAggregated,
                true,
                now,
            )
            .unwrap();
    }

    #[test]
    fn time_bucket_floors_to_quarter_hour() {
        let at = parse_ts("2026-01-28T10:14:59Z").unwrap();
        assert_eq!(time_bucket(at), parse_ts("2026-01-28T10:00:00Z").unwrap());
        let at = parse_ts("2026-01-28T10:15:00Z").unwrap();
        assert_eq!(time_bucket(at), parse_ts("2026-01-28T10:15:00Z").unwrap());
        let at = parse_ts("2026-01-28T10:59:30Z").unwrap();
        assert_eq!(time_bucket(at), parse_ts("2026-01-28T10:45:00Z").unwrap());
    }

    #[test]
    fn age_buckets() {
        assert_eq!(age_bucket(None), "unknown");
        assert_eq!(age_bucket(Some(4)), "0-5");
        assert_eq!(age_bucket(Some(5)), "0-5");
        assert_eq!(age_bucket(Some(12)), "6-12");
        assert_eq!(age_bucket(Some(18)), "13-18");
        assert_eq!(age_bucket(Some(35)), "19-35");
        assert_eq!(age_bucket(Some(60)), "36-60");
        assert_eq!(age_bucket(Some(61)), "60+");
    }

    #[test]
    fn pincode_coarsens_to_district() {
        assert_eq!(
            geo_cell_from_pincode(Some("110023")),
            "pincode_110xxx"
        );
        assert_eq!(geo_cell_from_pincode(Some("9")), "unknown");
        assert_eq!(geo_cell_from_pincode(Some("ab1234")), "unknown");
        assert_eq!(geo_cell_from_pincode(None), "unknown");
    }

    #[test]
    fn consent_gate_blocks_and_unblocks() {
        let (analytics, consents, _) = setup();
        let now = Utc::now();

        // No grant: rejected.
        assert!(matches!(
            analytics.emit(
                &ActorContext::system(),
                "u-1",
                "triage_completed",
                Some("phc"),
                None,
                now
            ),
            Err(Error::ConsentMissing { .. })
        ));

        grant(&consents, "u-1", now);
        assert!(analytics
            .emit(
                &ActorContext::system(),
                "u-1",
                "triage_completed",
                Some("phc"),
                None,
                now
            )
            .is_ok());

        // Revocation blocks the very next emission.
        let later = now + chrono::Duration::seconds(1);
        consents
            .grant(
                &ActorContext::system(),
                "u-1",
                ConsentCategory::Analytics,
                ConsentScope::GovAggregated,
                false,
                later,
            )
            .unwrap();
        assert!(matches!(
            analytics.emit(
                &ActorContext::system(),
                "u-1",
                "triage_completed",
                Some("phc"),
                None,
                later
            ),
            Err(Error::ConsentMissing { .. })
        ));
    }

    #[test]
    fn allow_lists_enforced() {
        let (analytics, consents, _) = setup();
        let now = Utc::now();
        grant(&consents, "u-1", now);

        assert!(matches!(
            analytics.emit(
                &ActorContext::system(),
                "u-1",
                "page_viewed",
                None,
                None,
                now
            ),
            Err(Error::InvalidPayload(_))
        ));
        assert!(matches!(
            analytics.emit(
                &ActorContext::system(),
                "u-1",
                "triage_completed",
                Some("service_quality"),
                None,
                now
            ),
            Err(Error::InvalidPayload(_))
        ));
    }

    #[test]
    fn disallowed_metadata_keys_rejected() {
        let (analytics, consents, _) = setup();
        let now = Utc::now();
        grant(&consents, "u-1", now);

        for key in ["user_id", "phone", "gps", "description"] {
            let metadata = json!({ key: "value" });
            assert!(
                matches!(
                    analytics.emit(
                        &ActorContext::system(),
                        "u-1",
                        "triage_completed",
                        Some("phc"),
                        Some(metadata),
                        now
                    ),
                    Err(Error::InvalidPayload(_))
                ),
                "key {key} must be rejected"
            );
        }
    }

    #[test]
    fn stored_payload_shares_no_disallowed_key() {
        let (analytics, consents, store) = setup();
        let now = Utc::now();
        grant(&consents, "u-1", now);
        analytics
            .emit(
                &ActorContext::system(),
                "u-1",
                "triage_completed",
                Some("phc"),
                Some(json!({"has_red_flags": true})),
                now,
            )
            .unwrap();

        let payload: String = store
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT payload_json FROM analytics_events LIMIT 1",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert!(ensure_no_disallowed_keys(&value).is_ok());
        // The bucketed time never carries seconds past the quarter hour.
        let bucket = value.get("event_time").and_then(|v| v.as_str()).unwrap();
        let parsed = parse_ts(bucket).unwrap();
        assert_eq!(parsed.minute() % 15, 0);
        assert_eq!(parsed.second(), 0);
    }

    #[test]
    fn flush_upserts_counts() {
        let (analytics, consents, store) = setup();
        let now = Utc::now();
        grant(&consents, "u-1", now);

        for _ in 0..4 {
            analytics
                .emit(
                    &ActorContext::system(),
                    "u-1",
                    "daily_wellness_logged",
                    None,
                    None,
                    now,
                )
                .unwrap();
        }
        assert_eq!(analytics.buffered_keys(), 1);
        assert_eq!(analytics.flush(now).unwrap(), 1);
        assert_eq!(analytics.buffered_keys(), 0);

        // Second round increments the same row.
        analytics
            .emit(
                &ActorContext::system(),
                "u-1",
                "daily_wellness_logged",
                None,
                None,
                now,
            )
            .unwrap();
        analytics.flush(now).unwrap();

        let (rows, total): (i64, i64) = store
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*), SUM(count) FROM aggregated_events",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?)
            })
            .unwrap();
        assert_eq!(rows, 1);
        assert_eq!(total, 5);
    }

    #[test]
    fn opportunistic_emission_skips_without_consent() {
        let (analytics, _, _) = setup();
        let now = Utc::now();
        let emitted = analytics
            .emit_opportunistic(
                &ActorContext::system(),
                Some("u-1"),
                "triage_completed",
                Some("phc"),
                None,
                now,
            )
            .unwrap();
        assert!(emitted.is_none());

        let anonymous = analytics
            .emit_opportunistic(
                &ActorContext::system(),
                None,
                "complaint_submitted",
                Some("other"),
                None,
                now,
            )
            .unwrap();
        assert!(anonymous.is_none());
    }
}
