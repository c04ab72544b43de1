//! Shared application state.
//!
//! One `AppState` owns every core service over the shared store; handlers
//! and scheduler jobs receive it as `Arc<AppState>`.

use std::sync::Arc;

use rand::RngCore;
use sahay_core::Store;
use sahay_core::analytics::AnalyticsService;
use sahay_core::anchor::{AnchorService, BackoffPolicy, ChainBackend, InMemoryChain};
use sahay_core::blobs::BlobStore;
use sahay_core::complaint::{ComplaintSealer, ComplaintService, EscalationLevel};
use sahay_core::consent::ConsentService;
use sahay_core::identity::IdentityService;
use sahay_core::outbox::{LogSender, MessageSender, OutboxService};
use sahay_core::sync::SyncGateway;
use sahay_core::tele::TeleService;
use sahay_core::triage::{HeuristicClassifier, TriageEngine, TriageService};
use sahay_core::views::ViewService;

use crate::config::SahayConfig;
use crate::metrics::Metrics;

/// Everything a handler or job needs.
pub struct AppState {
    pub store: Store,
    pub identity: IdentityService,
    pub consents: ConsentService,
    pub sync: SyncGateway,
    pub triage: TriageService,
    pub tele: TeleService,
    pub complaints: ComplaintService,
    pub anchors: AnchorService,
    pub analytics: AnalyticsService,
    pub views: ViewService,
    pub outbox: OutboxService,
    pub blobs: BlobStore,
    pub metrics: Metrics,
}

/// State construction errors surface as the core error type.
pub type BuildError = sahay_core::Error;

impl AppState {
    /// Builds the full service graph over an opened store, seeding SLA
    /// rules and the consent-document version from configuration.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for malformed configuration (sealing key, SLA
    /// levels) and `Transient` for store failures.
    pub fn build(config: &SahayConfig, store: Store) -> Result<Arc<Self>, BuildError> {
        Self::build_with(
            config,
            store,
            Arc::new(InMemoryChain::new()),
            Arc::new(LogSender),
        )
    }

    /// Builds with explicit chain and message-sender backends (tests,
    /// production wiring).
    ///
    /// # Errors
    ///
    /// See [`AppState::build`].
    pub fn build_with(
        config: &SahayConfig,
        store: Store,
        chain: Arc<dyn ChainBackend>,
        sender: Arc<dyn MessageSender>,
    ) -> Result<Arc<Self>, BuildError> {
        let metrics = Metrics::new()
            .map_err(|e| sahay_core::Error::Transient(format!("metrics registry: {e}")))?;

        let sealer = match &config.sealing.key_hex {
            Some(key_hex) => ComplaintSealer::from_hex(key_hex)?,
            None => {
                tracing::warn!(
                    "no sealing key configured; sealed complaint payloads will not \
                     survive a restart"
                );
                let mut key = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut key);
                ComplaintSealer::new(&key)
            },
        };

        let consents = ConsentService::new(store.clone());
        let complaints = ComplaintService::new(store.clone(), sealer);

        // Seed configuration-owned state.
        for rule in &config.sla {
            let level = EscalationLevel::parse(&rule.level)?;
            complaints.set_sla_rule(&rule.category, level, rule.hours)?;
        }
        if config.consent.document_version > consents.active_document_version()? {
            consents.set_document_version(
                &sahay_core::audit::ActorContext::system(),
                config.consent.document_version,
                chrono::Utc::now(),
            )?;
        }

        let analytics = AnalyticsService::with_k_threshold(
            store.clone(),
            consents.clone(),
            config.analytics.k_threshold,
        );

        Ok(Arc::new(Self {
            identity: IdentityService::new(store.clone()),
            consents,
            sync: SyncGateway::new(store.clone()),
            triage: TriageService::new(
                store.clone(),
                TriageEngine::with_classifier(Box::new(HeuristicClassifier)),
            ),
            tele: TeleService::new(store.clone()),
            complaints,
            anchors: AnchorService::new(store.clone(), chain, BackoffPolicy::default()),
            views: ViewService::new(store.clone(), config.analytics.k_threshold),
            outbox: OutboxService::new(store.clone(), sender),
            blobs: BlobStore::open(&config.blobs.root)?,
            analytics,
            metrics,
            store,
        }))
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
