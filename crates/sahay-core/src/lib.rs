//! Core subsystems for the SAHAY public-health backend.
//!
//! This crate implements the privacy-preserving, audit-verifiable service
//! surface: consent-gated access control, an offline-first sync gateway, a
//! tamper-evident audit chain, the triage rule engine, the complaint SLA
//! engine with on-chain anchoring, and the de-identified analytics pipeline.
//!
//! # Architecture
//!
//! Every mutating operation follows the pipeline
//! `Auth → RBAC → Consent → Handler → Audit`: the domain write and its audit
//! entry commit in one SQLite transaction, and handlers may additionally
//! enqueue anchor jobs or emit (consent-re-checked) analytics events.
//!
//! The HTTP surface and the background scheduler live in `sahay-daemon`;
//! this crate owns all domain semantics and the storage layer.

pub mod analytics;
pub mod anchor;
pub mod audit;
pub mod blobs;
pub mod canonical;
pub mod complaint;
pub mod consent;
pub mod error;
pub mod identity;
pub mod outbox;
pub mod store;
pub mod sync;
pub mod tele;
pub mod triage;
pub mod views;

pub use error::Error;
pub use store::Store;

/// Top-level report/export schema version.
///
/// Contract: major bump on breaking schema changes, minor bump for additive
/// changes. Every report envelope carries this at the top level.
pub const REPORT_VERSION: &str = "1.0";
