//! Every write endpoint leaves exactly one audit entry in the same
//! transaction, and the chain stays verifiable across a realistic mix of
//! traffic.

use chrono::Utc;
use sahay_core::audit::{self, ActorContext};
use sahay_core::consent::{ConsentCategory, ConsentScope, ConsentService};
use sahay_core::identity::IdentityService;
use sahay_core::store::Store;
use sahay_core::sync::{SyncEnvelope, SyncGateway};
use sahay_core::triage::{Language, TriageEngine, TriageInput, TriageService};
use serde_json::json;

fn envelope(event_id: &str, user_id: &str, payload: serde_json::Value) -> SyncEnvelope {
    SyncEnvelope {
        event_id: event_id.into(),
        device_id: "dev-1".into(),
        user_id: user_id.into(),
        entity_type: "water".into(),
        operation: "CREATE".into(),
        client_time: "2026-01-28T10:00:00Z".into(),
        payload,
    }
}

#[test]
fn mixed_traffic_keeps_the_chain_verifiable() {
    let store = Store::in_memory().unwrap();
    let identity = IdentityService::new(store.clone());
    let consents = ConsentService::new(store.clone());
    let gateway = SyncGateway::new(store.clone());
    let triage = TriageService::new(store.clone(), TriageEngine::rule_only());
    let now = Utc::now();

    let (user, _token) = identity
        .register(&ActorContext::system(), "9000000001", "password-1", now)
        .unwrap();
    let actor = ActorContext::user(&user.id);

    consents
        .grant(
            &actor,
            &user.id,
            ConsentCategory::CloudSync,
            ConsentScope::Clinician,
            true,
            now,
        )
        .unwrap();

    let batch = vec![
        envelope("e-1", &user.id, json!({"amount_ml": 200})),
        envelope("e-2", &user.id, json!({"amount_ml": 300})),
    ];
    let results = gateway.submit_batch(&actor, &user.id, &batch, now).unwrap();
    assert!(results.iter().all(|r| r.outcome.as_str() == "accepted"));

    triage
        .create_session(
            &actor,
            &user.id,
            &TriageInput {
                symptoms_text: "mild headache".into(),
                age: Some(30),
                sex: None,
                pregnancy: false,
                language: Language::English,
            },
            now,
        )
        .unwrap();

    // register + consent + 2 sync events + triage = 5 chained entries.
    let entries = store.with_conn(|conn| audit::list(conn, 100)).unwrap();
    assert_eq!(entries.len(), 5);

    let verification = store.with_conn(|conn| audit::verify(conn, 1)).unwrap();
    assert!(verification.ok);
    assert_eq!(verification.first_broken_seq, None);
}

#[test]
fn tampering_with_any_entry_is_detected() {
    let store = Store::in_memory().unwrap();
    let identity = IdentityService::new(store.clone());
    let now = Utc::now();
    for i in 0..3 {
        identity
            .register(
                &ActorContext::system(),
                &format!("900000000{i}"),
                "password-1",
                now,
            )
            .unwrap();
    }

    store
        .with_conn(|conn| {
            conn.execute(
                "UPDATE audit_log SET actor_id = 'someone-else' WHERE seq = 2",
                [],
            )?;
            Ok(())
        })
        .unwrap();

    let verification = store.with_conn(|conn| audit::verify(conn, 1)).unwrap();
    assert!(!verification.ok);
    assert_eq!(verification.first_broken_seq, Some(2));
}
