//! Background scheduler.
//!
//! A single-process ticker owns the periodic jobs: SLA escalation, anchor
//! submission, outbox dispatch, aggregation flush, and view refresh. Each
//! tick takes the job's advisory lock before running, so a multi-instance
//! deployment still executes every job on at most one instance; a dead
//! holder's lease expires and another instance takes over.
//!
//! Jobs are idempotent, so a crash between the work and the unlock is
//! recovered by a later tick re-running the job.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::state::AppState;

/// Spawns every periodic job; returned handles are aborted at shutdown.
pub fn spawn_all(state: Arc<AppState>, config: &SchedulerConfig) -> Vec<JoinHandle<()>> {
    let lease = chrono::Duration::seconds(config.lock_lease_secs.min(i64::MAX as u64) as i64);

    vec![
        spawn_job(
            state.clone(),
            "sla_escalation",
            Duration::from_secs(config.sla_tick_secs),
            lease,
            run_sla_escalation,
        ),
        spawn_job(
            state.clone(),
            "anchor_submit",
            Duration::from_secs(config.anchor_tick_secs),
            lease,
            run_anchor_submit,
        ),
        spawn_job(
            state.clone(),
            "outbox_dispatch",
            Duration::from_secs(config.outbox_tick_secs),
            lease,
            run_outbox_dispatch,
        ),
        spawn_job(
            state.clone(),
            "analytics_flush",
            Duration::from_secs(config.flush_tick_secs),
            lease,
            run_analytics_flush,
        ),
        spawn_job(
            state,
            "view_refresh",
            Duration::from_secs(config.view_refresh_secs),
            lease,
            run_view_refresh,
        ),
    ]
}

fn spawn_job(
    state: Arc<AppState>,
    job: &'static str,
    period: Duration,
    lease: chrono::Duration,
    body: fn(&AppState) -> Result<String, sahay_core::Error>,
) -> JoinHandle<()> {
    let holder = format!("{job}:{}", Uuid::new_v4());
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let now = Utc::now();

            let locked = match state.store.try_advisory_lock(job, &holder, lease, now) {
                Ok(locked) => locked,
                Err(err) => {
                    tracing::warn!(%job, error = %err, "advisory lock check failed");
                    continue;
                },
            };
            if !locked {
                tracing::debug!(%job, "another instance holds the lock");
                continue;
            }

            let run = {
                let state = state.clone();
                tokio::task::spawn_blocking(move || body(&state)).await
            };
            match run {
                Ok(Ok(outcome)) => tracing::debug!(%job, %outcome, "job tick complete"),
                Ok(Err(err)) if err.is_transient() => {
                    tracing::warn!(%job, error = %err, "job tick failed, will retry")
                },
                Ok(Err(err)) => tracing::error!(%job, error = %err, "job tick failed"),
                Err(join_err) => tracing::error!(%job, error = %join_err, "job panicked"),
            }

            if let Err(err) = state.store.advisory_unlock(job, &holder) {
                tracing::warn!(%job, error = %err, "advisory unlock failed");
            }
        }
    })
}

fn run_sla_escalation(state: &AppState) -> Result<String, sahay_core::Error> {
    let now = Utc::now();
    let pass = state.complaints.run_escalation_pass(now)?;

    for escalated in &pass.escalated {
        state.metrics.escalations_total.inc();
        // Consent is re-checked inside the emission; anonymous complaints
        // have no subject and are skipped.
        state.analytics.emit_opportunistic(
            &sahay_core::audit::ActorContext::system(),
            escalated.submitter_id.as_deref(),
            "complaint_escalated",
            Some(&escalated.category),
            None,
            now,
        )?;
    }
    Ok(format!(
        "checked={} escalated={} exhausted={}",
        pass.checked,
        pass.escalated.len(),
        pass.exhausted
    ))
}

fn run_anchor_submit(state: &AppState) -> Result<String, sahay_core::Error> {
    let stats = state.anchors.run_pending(Utc::now())?;
    for (result, count) in [
        ("submitted", stats.submitted),
        ("requeued", stats.requeued),
        ("failed", stats.failed),
    ] {
        state
            .metrics
            .anchor_jobs_total
            .with_label_values(&[result])
            .inc_by(count as u64);
    }
    state
        .metrics
        .anchor_queue_depth
        .set(state.anchors.queued_count()? as i64);
    Ok(format!(
        "picked={} submitted={} requeued={}",
        stats.picked, stats.submitted, stats.requeued
    ))
}

fn run_outbox_dispatch(state: &AppState) -> Result<String, sahay_core::Error> {
    let stats = state.outbox.dispatch_pending(Utc::now())?;
    Ok(format!(
        "attempted={} sent={} failed={}",
        stats.attempted, stats.sent, stats.failed
    ))
}

fn run_analytics_flush(state: &AppState) -> Result<String, sahay_core::Error> {
    let flushed = state.analytics.flush(Utc::now())?;
    state
        .metrics
        .aggregation_buffer_keys
        .set(state.analytics.buffered_keys() as i64);
    Ok(format!("flushed_keys={flushed}"))
}

fn run_view_refresh(state: &AppState) -> Result<String, sahay_core::Error> {
    // Flush first so fresh aggregates are visible to the rebuild.
    state.analytics.flush(Utc::now())?;
    let results = state.views.refresh_all(Utc::now())?;
    let rows: i64 = results.iter().map(|r| r.row_count).sum();
    Ok(format!("views={} rows={rows}", results.len()))
}
