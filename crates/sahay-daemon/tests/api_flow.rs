//! Full request flow across the API surface: identity, consent, sync,
//! triage, analytics, dashboard, and audit verification, driven through
//! the handler functions with an in-memory store.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use sahay_core::Store;
use sahay_core::identity::Role;
use sahay_daemon::config::{BlobsConfig, SahayConfig};
use sahay_daemon::http::{analytics, audit, auth, consents, sync, triage};
use sahay_daemon::state::AppState;
use serde_json::json;

fn test_state() -> (Arc<AppState>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = SahayConfig {
        blobs: BlobsConfig {
            root: dir.path().join("blobs"),
        },
        ..SahayConfig::default()
    };
    let state = AppState::build(&config, Store::in_memory().unwrap()).unwrap();
    (state, dir)
}

fn bearer(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        axum::http::header::AUTHORIZATION,
        format!("Bearer {token}").parse().unwrap(),
    );
    headers
}

async fn register(state: &Arc<AppState>, alias: &str) -> (String, HeaderMap) {
    let response = auth::register(
        State(state.clone()),
        HeaderMap::new(),
        Json(auth::CredentialsRequest {
            username: alias.into(),
            password: "password-123".into(),
        }),
    )
    .await
    .unwrap();
    (response.user_id.clone(), bearer(&response.token))
}

#[tokio::test]
async fn citizen_journey_with_audit_verification() {
    let (state, _dir) = test_state();
    let (user_id, headers) = register(&state, "9000011111").await;

    // Consent to cloud sync and analytics aggregation.
    for (category, scope) in [("cloud_sync", "clinician"), ("analytics", "gov_aggregated")] {
        consents::grant(
            State(state.clone()),
            headers.clone(),
            Json(consents::ConsentRequest {
                category: category.into(),
                scope: scope.into(),
                granted: true,
                version: Some(1),
            }),
        )
        .await
        .unwrap();
    }

    // Offline batch: profile plus a wellness log.
    let batch = sync::submit_batch(
        State(state.clone()),
        headers.clone(),
        Json(sync::SyncBatchRequest {
            events: vec![
                sahay_core::sync::SyncEnvelope {
                    event_id: "e-profile".into(),
                    device_id: "dev-1".into(),
                    user_id: user_id.clone(),
                    entity_type: "profile".into(),
                    operation: "CREATE".into(),
                    client_time: "2026-01-28T10:00:00Z".into(),
                    payload: json!({"name_alias": "A", "pincode": "110001", "sex": "F"}),
                },
                sahay_core::sync::SyncEnvelope {
                    event_id: "e-water".into(),
                    device_id: "dev-1".into(),
                    user_id: user_id.clone(),
                    entity_type: "water".into(),
                    operation: "CREATE".into(),
                    client_time: "2026-01-28T10:00:01Z".into(),
                    payload: json!({"amount_ml": 250}),
                },
            ],
        }),
    )
    .await
    .unwrap();
    assert!(batch
        .results
        .iter()
        .all(|r| r.outcome.as_str() == "accepted"));

    // Triage with a red flag: emergency, analytics emitted under consent.
    let session = triage::create_session(
        State(state.clone()),
        headers.clone(),
        Json(triage::TriageRequest {
            symptoms_text: "chest pain and shortness of breath".into(),
            age: Some(45),
            sex: Some("M".into()),
            pregnancy: false,
            language: None,
        }),
    )
    .await
    .unwrap();
    assert_eq!(session.category.as_str(), "emergency");
    assert!(session.guidance_text.contains("guidance, not a diagnosis"));

    // An officer sees the de-identified summary once the bucket clears k.
    for i in 0..4 {
        analytics::emit(
            State(state.clone()),
            headers.clone(),
            Json(analytics::EmitRequest {
                event_type: "triage_emergency".into(),
                category: Some("emergency".into()),
                metadata: Some(json!({"has_red_flags": true, "index": i})),
            }),
        )
        .await
        .unwrap();
    }

    let (officer_id, officer_headers) = register(&state, "9000022222").await;
    state
        .identity
        .grant_role(
            &sahay_core::audit::ActorContext::system(),
            &officer_id,
            Role::DistrictOfficer,
            chrono::Utc::now(),
        )
        .unwrap();

    let report = analytics::summary(
        State(state.clone()),
        officer_headers.clone(),
        Query(analytics::AggregateParams::default()),
    )
    .await
    .unwrap();
    // 1 handler emission + 4 explicit emissions in one bucket = 5 >= k.
    assert_eq!(report.rows.len(), 1);
    assert_eq!(report.rows[0].count, 5);

    // The whole journey is chained and verifiable.
    let verification = audit::verify(
        State(state.clone()),
        officer_headers,
        Query(audit::VerifyParams::default()),
    )
    .await
    .unwrap();
    assert!(verification.ok);
    assert_eq!(verification.first_broken_seq, None);
}

#[tokio::test]
async fn owner_only_reads_hold_across_users() {
    let (state, _dir) = test_state();
    let (_a, headers_a) = register(&state, "9000033333").await;
    let (_b, headers_b) = register(&state, "9000044444").await;

    let session = triage::create_session(
        State(state.clone()),
        headers_a.clone(),
        Json(triage::TriageRequest {
            symptoms_text: "itchy rash".into(),
            age: None,
            sex: None,
            pregnancy: false,
            language: Some("hi".into()),
        }),
    )
    .await
    .unwrap();

    assert!(triage::get_session(
        State(state.clone()),
        headers_a,
        Path(session.id.clone())
    )
    .await
    .is_ok());
    assert!(triage::get_session(State(state), headers_b, Path(session.id.clone()))
        .await
        .is_err());
}
