//! Materialized dashboard views.
//!
//! Four pre-aggregated tables are rebuilt from `aggregated_events` on a
//! schedule (and on demand): daily triage counts, complaints by district,
//! the symptom heatmap, and SLA breach counts. Each rebuild applies the
//! k-filter (`HAVING SUM(count) >= k`), so views can never expose an
//! aggregate below the threshold, let alone a row-level event.
//!
//! Freshness is judged from `MAX(updated_at)` in `view_refresh_log`, never
//! from wall-clock equality with the refresh tick.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

use crate::error::Error;
use crate::store::{Store, fmt_ts, parse_ts};

/// The four view tables, in refresh order.
pub const VIEW_NAMES: [&str; 4] = [
    "mv_daily_triage_counts",
    "mv_complaint_categories_district",
    "mv_symptom_heatmap",
    "mv_sla_breach_counts",
];

/// Outcome of one view rebuild.
#[derive(Debug, Clone, Serialize)]
pub struct ViewRefresh {
    /// View table name.
    pub view_name: String,
    /// Rows materialized.
    pub row_count: i64,
}

/// Stats row for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct ViewStat {
    /// View table name.
    pub view_name: String,
    /// Rows materialized at last refresh.
    pub row_count: i64,
    /// When the view was last rebuilt.
    pub updated_at: String,
}

/// One row of `mv_daily_triage_counts`.
#[derive(Debug, Clone, Serialize)]
pub struct DailyTriageRow {
    pub date: String,
    pub event_type: String,
    pub category: String,
    pub geo_cell: String,
    pub total_count: i64,
}

/// One row of `mv_complaint_categories_district`.
#[derive(Debug, Clone, Serialize)]
pub struct ComplaintDistrictRow {
    pub geo_cell: String,
    pub category: String,
    pub event_type: String,
    pub date: String,
    pub total_complaints: i64,
}

/// One row of `mv_symptom_heatmap`.
#[derive(Debug, Clone, Serialize)]
pub struct SymptomHeatmapRow {
    pub geo_cell: String,
    pub category: String,
    pub date: String,
    pub event_count: i64,
}

/// One row of `mv_sla_breach_counts`.
#[derive(Debug, Clone, Serialize)]
pub struct SlaBreachRow {
    pub geo_cell: String,
    pub category: String,
    pub date: String,
    pub escalated_count: i64,
    pub resolved_count: i64,
    pub total_complaints: i64,
}

/// Materialized-view lifecycle and queries.
#[derive(Debug, Clone)]
pub struct ViewService {
    store: Store,
    k_threshold: i64,
}

impl ViewService {
    /// Creates the service with the pipeline's k threshold.
    #[must_use]
    pub fn new(store: Store, k_threshold: i64) -> Self {
        Self { store, k_threshold }
    }

    /// Rebuilds every view and records the refresh.
    ///
    /// # Errors
    ///
    /// Returns `Transient` on database failure.
    pub fn refresh_all(&self, now: DateTime<Utc>) -> Result<Vec<ViewRefresh>, Error> {
        let k = self.k_threshold;
        let mut results = Vec::with_capacity(VIEW_NAMES.len());
        for view_name in VIEW_NAMES {
            let row_count = self.store.with_tx(|tx| {
                tx.execute_batch(&format!("DROP TABLE IF EXISTS {view_name}"))?;
                tx.execute(&build_sql(view_name, k), [])?;
                let rows: i64 = tx.query_row(
                    &format!("SELECT COUNT(*) FROM {view_name}"),
                    [],
                    |row| row.get(0),
                )?;
                tx.execute(
                    "INSERT INTO view_refresh_log (view_name, updated_at, row_count)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(view_name) DO UPDATE SET
                         updated_at = excluded.updated_at,
                         row_count = excluded.row_count",
                    params![view_name, fmt_ts(now), rows],
                )?;
                Ok(rows)
            })?;
            results.push(ViewRefresh {
                view_name: view_name.to_string(),
                row_count,
            });
        }
        tracing::info!(views = results.len(), "materialized views refreshed");
        Ok(results)
    }

    /// Refresh bookkeeping for every view.
    ///
    /// # Errors
    ///
    /// Returns `Transient` on database failure.
    pub fn stats(&self) -> Result<Vec<ViewStat>, Error> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT view_name, row_count, updated_at FROM view_refresh_log
                 ORDER BY view_name",
            )?;
            let stats = stmt
                .query_map([], |row| {
                    Ok(ViewStat {
                        view_name: row.get(0)?,
                        row_count: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(stats)
        })
    }

    /// When the freshest view was rebuilt, read from `MAX(updated_at)`.
    ///
    /// # Errors
    ///
    /// Returns `Transient` on database failure.
    pub fn last_refreshed(&self) -> Result<Option<DateTime<Utc>>, Error> {
        let max: Option<String> = self.store.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT MAX(updated_at) FROM view_refresh_log",
                [],
                |row| row.get(0),
            )?)
        })?;
        max.as_deref().map(parse_ts).transpose()
    }

    /// Daily triage counts.
    ///
    /// # Errors
    ///
    /// Returns `Transient` on database failure (including an un-refreshed
    /// view).
    pub fn daily_triage_counts(&self) -> Result<Vec<DailyTriageRow>, Error> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT date, event_type, category, geo_cell, total_count
                 FROM mv_daily_triage_counts
                 ORDER BY date DESC, total_count DESC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(DailyTriageRow {
                        date: row.get(0)?,
                        event_type: row.get(1)?,
                        category: row.get(2)?,
                        geo_cell: row.get(3)?,
                        total_count: row.get(4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Complaint volume per district.
    ///
    /// # Errors
    ///
    /// Returns `Transient` on database failure.
    pub fn complaint_categories(&self) -> Result<Vec<ComplaintDistrictRow>, Error> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT geo_cell, category, event_type, date, total_complaints
                 FROM mv_complaint_categories_district
                 ORDER BY total_complaints DESC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(ComplaintDistrictRow {
                        geo_cell: row.get(0)?,
                        category: row.get(1)?,
                        event_type: row.get(2)?,
                        date: row.get(3)?,
                        total_complaints: row.get(4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Symptom heatmap clusters.
    ///
    /// # Errors
    ///
    /// Returns `Transient` on database failure.
    pub fn symptom_heatmap(&self) -> Result<Vec<SymptomHeatmapRow>, Error> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT geo_cell, category, date, event_count
                 FROM mv_symptom_heatmap
                 ORDER BY event_count DESC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(SymptomHeatmapRow {
                        geo_cell: row.get(0)?,
                        category: row.get(1)?,
                        date: row.get(2)?,
                        event_count: row.get(3)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// SLA breach counts per district.
    ///
    /// # Errors
    ///
    /// Returns `Transient` on database failure.
    pub fn sla_breaches(&self) -> Result<Vec<SlaBreachRow>, Error> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT geo_cell, category, date, escalated_count, resolved_count,
                        total_complaints
                 FROM mv_sla_breach_counts
                 ORDER BY escalated_count DESC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(SlaBreachRow {
                        geo_cell: row.get(0)?,
                        category: row.get(1)?,
                        date: row.get(2)?,
                        escalated_count: row.get(3)?,
                        resolved_count: row.get(4)?,
                        total_complaints: row.get(5)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn build_sql(view_name: &str, k: i64) -> String {
    match view_name {
        "mv_daily_triage_counts" => format!(
            "CREATE TABLE mv_daily_triage_counts AS
             SELECT substr(time_bucket, 1, 10) AS date,
                    event_type, category, geo_cell, age_bucket, gender,
                    SUM(count) AS total_count
             FROM aggregated_events
             WHERE event_type IN ('triage_completed', 'triage_emergency')
             GROUP BY date, event_type, category, geo_cell, age_bucket, gender
             HAVING SUM(count) >= {k}"
        ),
        "mv_complaint_categories_district" => format!(
            "CREATE TABLE mv_complaint_categories_district AS
             SELECT geo_cell, category, event_type,
                    substr(time_bucket, 1, 10) AS date,
                    SUM(count) AS total_complaints
             FROM aggregated_events
             WHERE event_type IN ('complaint_submitted', 'complaint_resolved',
                                  'complaint_escalated')
             GROUP BY geo_cell, category, event_type, date
             HAVING SUM(count) >= {k}"
        ),
        "mv_symptom_heatmap" => format!(
            "CREATE TABLE mv_symptom_heatmap AS
             SELECT geo_cell, category, substr(time_bucket, 1, 10) AS date,
                    SUM(count) AS event_count
             FROM aggregated_events
             WHERE event_type IN ('triage_completed', 'triage_emergency')
             GROUP BY geo_cell, category, date
             HAVING SUM(count) >= {k}"
        ),
        _ => format!(
            "CREATE TABLE mv_sla_breach_counts AS
             SELECT geo_cell, category, substr(time_bucket, 1, 10) AS date,
                    SUM(CASE WHEN event_type = 'complaint_escalated' THEN count ELSE 0 END)
                        AS escalated_count,
                    SUM(CASE WHEN event_type = 'complaint_resolved' THEN count ELSE 0 END)
                        AS resolved_count,
                    SUM(count) AS total_complaints
             FROM aggregated_events
             WHERE event_type IN ('complaint_submitted', 'complaint_resolved',
                                  'complaint_escalated')
             GROUP BY geo_cell, category, date
             HAVING SUM(count) >= {k}"
        ),
    }
}
