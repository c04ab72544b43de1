//! Query surface over aggregated analytics.
//!
//! Every query filters out aggregated rows with `count < k` before doing
//! anything else, so no published figure reflects fewer than k records.
//! The filter applies uniformly: summary, time series, heatmap, category
//! and demographic breakdowns, and top regions. Reports carry the
//! top-level `report_version` contract field.

use rusqlite::{Connection, params};
use serde::Serialize;

use crate::error::Error;

use super::AnalyticsService;

/// Common report envelope.
#[derive(Debug, Clone, Serialize)]
pub struct Report<T> {
    /// Schema version; major bump = breaking, minor = additive.
    pub report_version: String,
    /// k-anonymity threshold applied to every row.
    pub k_threshold: i64,
    /// Result rows.
    pub rows: Vec<T>,
}

impl<T> Report<T> {
    fn new(k_threshold: i64, rows: Vec<T>) -> Self {
        Self {
            report_version: crate::REPORT_VERSION.to_string(),
            k_threshold,
            rows,
        }
    }
}

/// Filters shared by the query endpoints.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    /// Inclusive lower bound on `time_bucket` (canonical RFC 3339).
    pub from: Option<String>,
    /// Inclusive upper bound on `time_bucket`.
    pub to: Option<String>,
    /// Restrict to one event type.
    pub event_type: Option<String>,
}

impl QueryFilter {
    fn clauses(&self) -> (String, Vec<String>) {
        let mut sql = String::new();
        let mut binds = Vec::new();
        if let Some(from) = &self.from {
            sql.push_str(&format!(" AND time_bucket >= ?{}", binds.len() + 2));
            binds.push(from.clone());
        }
        if let Some(to) = &self.to {
            sql.push_str(&format!(" AND time_bucket <= ?{}", binds.len() + 2));
            binds.push(to.clone());
        }
        if let Some(event_type) = &self.event_type {
            sql.push_str(&format!(" AND event_type = ?{}", binds.len() + 2));
            binds.push(event_type.clone());
        }
        (sql, binds)
    }
}

/// One row of the summary report.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryRow {
    pub event_type: String,
    pub category: String,
    pub count: i64,
    pub unique_geo_cells: i64,
    pub unique_age_buckets: i64,
}

/// One point of a time series.
#[derive(Debug, Clone, Serialize)]
pub struct TimeSeriesRow {
    pub time_bucket: String,
    pub event_type: String,
    pub count: i64,
}

/// One heatmap cell.
#[derive(Debug, Clone, Serialize)]
pub struct HeatmapRow {
    pub geo_cell: String,
    pub event_type: String,
    pub category: String,
    pub count: i64,
}

/// One category slice.
#[derive(Debug, Clone, Serialize)]
pub struct CategoryRow {
    pub category: String,
    pub count: i64,
}

/// One demographic slice.
#[derive(Debug, Clone, Serialize)]
pub struct DemographicRow {
    pub age_bucket: String,
    pub gender: String,
    pub count: i64,
}

/// One region by volume.
#[derive(Debug, Clone, Serialize)]
pub struct RegionRow {
    pub geo_cell: String,
    pub count: i64,
}

fn run_query<T>(
    conn: &Connection,
    sql: &str,
    k: i64,
    binds: &[String],
    map: impl Fn(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
) -> Result<Vec<T>, Error> {
    let mut stmt = conn.prepare(sql)?;
    let mut values: Vec<&dyn rusqlite::ToSql> = vec![&k];
    for bind in binds {
        values.push(bind);
    }
    let rows = stmt
        .query_map(values.as_slice(), map)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

impl AnalyticsService {
    /// Aggregate counts by event type and category.
    ///
    /// # Errors
    ///
    /// Returns `Transient` on database failure.
    pub fn summary(&self, filter: &QueryFilter) -> Result<Report<SummaryRow>, Error> {
        let (clauses, binds) = filter.clauses();
        let k = self.k_threshold();
        let rows = self.store().with_conn(|conn| {
            run_query(
                conn,
                &format!(
                    "SELECT event_type, category, SUM(count),
                            COUNT(DISTINCT geo_cell), COUNT(DISTINCT age_bucket)
                     FROM aggregated_events
                     WHERE count >= ?1{clauses}
                     GROUP BY event_type, category
                     ORDER BY SUM(count) DESC"
                ),
                k,
                &binds,
                |row| {
                    Ok(SummaryRow {
                        event_type: row.get(0)?,
                        category: row.get(1)?,
                        count: row.get(2)?,
                        unique_geo_cells: row.get(3)?,
                        unique_age_buckets: row.get(4)?,
                    })
                },
            )
        })?;
        Ok(Report::new(k, rows))
    }

    /// Counts per 15-minute bucket.
    ///
    /// # Errors
    ///
    /// Returns `Transient` on database failure.
    pub fn time_series(&self, filter: &QueryFilter) -> Result<Report<TimeSeriesRow>, Error> {
        let (clauses, binds) = filter.clauses();
        let k = self.k_threshold();
        let rows = self.store().with_conn(|conn| {
            run_query(
                conn,
                &format!(
                    "SELECT time_bucket, event_type, SUM(count)
                     FROM aggregated_events
                     WHERE count >= ?1{clauses}
                     GROUP BY time_bucket, event_type
                     ORDER BY time_bucket ASC"
                ),
                k,
                &binds,
                |row| {
                    Ok(TimeSeriesRow {
                        time_bucket: row.get(0)?,
                        event_type: row.get(1)?,
                        count: row.get(2)?,
                    })
                },
            )
        })?;
        Ok(Report::new(k, rows))
    }

    /// Counts per geo cell.
    ///
    /// # Errors
    ///
    /// Returns `Transient` on database failure.
    pub fn heatmap(&self, filter: &QueryFilter) -> Result<Report<HeatmapRow>, Error> {
        let (clauses, binds) = filter.clauses();
        let k = self.k_threshold();
        let rows = self.store().with_conn(|conn| {
            run_query(
                conn,
                &format!(
                    "SELECT geo_cell, event_type, category, SUM(count)
                     FROM aggregated_events
                     WHERE count >= ?1{clauses}
                     GROUP BY geo_cell, event_type, category
                     ORDER BY SUM(count) DESC"
                ),
                k,
                &binds,
                |row| {
                    Ok(HeatmapRow {
                        geo_cell: row.get(0)?,
                        event_type: row.get(1)?,
                        category: row.get(2)?,
                        count: row.get(3)?,
                    })
                },
            )
        })?;
        Ok(Report::new(k, rows))
    }

    /// Category breakdown.
    ///
    /// # Errors
    ///
    /// Returns `Transient` on database failure.
    pub fn categories(&self, filter: &QueryFilter) -> Result<Report<CategoryRow>, Error> {
        let (clauses, binds) = filter.clauses();
        let k = self.k_threshold();
        let rows = self.store().with_conn(|conn| {
            run_query(
                conn,
                &format!(
                    "SELECT category, SUM(count)
                     FROM aggregated_events
                     WHERE count >= ?1{clauses}
                     GROUP BY category
                     ORDER BY SUM(count) DESC"
                ),
                k,
                &binds,
                |row| {
                    Ok(CategoryRow {
                        category: row.get(0)?,
                        count: row.get(1)?,
                    })
                },
            )
        })?;
        Ok(Report::new(k, rows))
    }

    /// Age-bucket and gender breakdown.
    ///
    /// # Errors
    ///
    /// Returns `Transient` on database failure.
    pub fn demographics(&self, filter: &QueryFilter) -> Result<Report<DemographicRow>, Error> {
        let (clauses, binds) = filter.clauses();
        let k = self.k_threshold();
        let rows = self.store().with_conn(|conn| {
            run_query(
                conn,
                &format!(
                    "SELECT age_bucket, gender, SUM(count)
                     FROM aggregated_events
                     WHERE count >= ?1{clauses}
                     GROUP BY age_bucket, gender
                     ORDER BY SUM(count) DESC"
                ),
                k,
                &binds,
                |row| {
                    Ok(DemographicRow {
                        age_bucket: row.get(0)?,
                        gender: row.get(1)?,
                        count: row.get(2)?,
                    })
                },
            )
        })?;
        Ok(Report::new(k, rows))
    }

    /// Highest-volume regions.
    ///
    /// # Errors
    ///
    /// Returns `Transient` on database failure.
    pub fn top_regions(
        &self,
        filter: &QueryFilter,
        limit: u64,
    ) -> Result<Report<RegionRow>, Error> {
        let (clauses, binds) = filter.clauses();
        let k = self.k_threshold();
        let rows = self.store().with_conn(|conn| {
            run_query(
                conn,
                &format!(
                    "SELECT geo_cell, SUM(count)
                     FROM aggregated_events
                     WHERE count >= ?1{clauses}
                     GROUP BY geo_cell
                     ORDER BY SUM(count) DESC
                     LIMIT {limit}"
                ),
                k,
                &binds,
                |row| {
                    Ok(RegionRow {
                        geo_cell: row.get(0)?,
                        count: row.get(1)?,
                    })
                },
            )
        })?;
        Ok(Report::new(k, rows))
    }
}
