//! Dashboard endpoints: live k-filtered aggregates and materialized views.
//!
//! Aggregate reads require an officer role; refreshing and view
//! administration require `national_admin`.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use chrono::Utc;
use serde::Deserialize;

use sahay_core::analytics::query::{
    CategoryRow, DemographicRow, HeatmapRow, RegionRow, Report, TimeSeriesRow,
};
use sahay_core::identity::Role;
use sahay_core::views::{
    ComplaintDistrictRow, DailyTriageRow, SlaBreachRow, SymptomHeatmapRow, ViewRefresh,
    ViewStat,
};

use crate::state::AppState;

use super::analytics::{AggregateParams, OFFICER_ROLES};
use super::{authenticate, error::ApiError};

/// Top-regions query parameters.
#[derive(Debug, Deserialize)]
pub struct TopRegionParams {
    pub from: Option<String>,
    pub to: Option<String>,
    pub event_type: Option<String>,
    #[serde(default = "default_region_limit")]
    pub limit: u64,
}

const fn default_region_limit() -> u64 {
    10
}

fn require_officer(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(), ApiError> {
    let user = authenticate(state, headers)?;
    user.require_any(&OFFICER_ROLES)?;
    Ok(())
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let user = authenticate(state, headers)?;
    user.require_any(&[Role::NationalAdmin])?;
    Ok(())
}

/// `GET /dashboard/timeseries`
pub async fn timeseries(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<AggregateParams>,
) -> Result<Json<Report<TimeSeriesRow>>, ApiError> {
    require_officer(&state, &headers)?;
    Ok(Json(state.analytics.time_series(&params.into_filter())?))
}

/// `GET /dashboard/heatmap`
pub async fn heatmap(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<AggregateParams>,
) -> Result<Json<Report<HeatmapRow>>, ApiError> {
    require_officer(&state, &headers)?;
    Ok(Json(state.analytics.heatmap(&params.into_filter())?))
}

/// `GET /dashboard/categories`
pub async fn categories(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<AggregateParams>,
) -> Result<Json<Report<CategoryRow>>, ApiError> {
    require_officer(&state, &headers)?;
    Ok(Json(state.analytics.categories(&params.into_filter())?))
}

/// `GET /dashboard/demographics`
pub async fn demographics(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<AggregateParams>,
) -> Result<Json<Report<DemographicRow>>, ApiError> {
    require_officer(&state, &headers)?;
    Ok(Json(state.analytics.demographics(&params.into_filter())?))
}

/// `GET /dashboard/top-regions`
pub async fn top_regions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<TopRegionParams>,
) -> Result<Json<Report<RegionRow>>, ApiError> {
    require_officer(&state, &headers)?;
    let filter = sahay_core::analytics::query::QueryFilter {
        from: params.from,
        to: params.to,
        event_type: params.event_type,
    };
    Ok(Json(state.analytics.top_regions(&filter, params.limit)?))
}

/// `POST /dashboard/materialized-views/refresh` — admin, on-demand.
pub async fn refresh_views(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ViewRefresh>>, ApiError> {
    require_admin(&state, &headers)?;
    let now = Utc::now();
    state.analytics.flush(now)?;
    Ok(Json(state.views.refresh_all(now)?))
}

/// `GET /dashboard/materialized-views/stats`
pub async fn view_stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ViewStat>>, ApiError> {
    require_officer(&state, &headers)?;
    Ok(Json(state.views.stats()?))
}

/// `GET /dashboard/mv/triage-counts`
pub async fn mv_triage_counts(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<DailyTriageRow>>, ApiError> {
    require_officer(&state, &headers)?;
    Ok(Json(state.views.daily_triage_counts()?))
}

/// `GET /dashboard/mv/complaint-categories`
pub async fn mv_complaint_categories(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ComplaintDistrictRow>>, ApiError> {
    require_officer(&state, &headers)?;
    Ok(Json(state.views.complaint_categories()?))
}

/// `GET /dashboard/mv/symptom-heatmap`
pub async fn mv_symptom_heatmap(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<SymptomHeatmapRow>>, ApiError> {
    require_officer(&state, &headers)?;
    Ok(Json(state.views.symptom_heatmap()?))
}

/// `GET /dashboard/mv/sla-breaches`
pub async fn mv_sla_breaches(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<SlaBreachRow>>, ApiError> {
    require_officer(&state, &headers)?;
    Ok(Json(state.views.sla_breaches()?))
}
