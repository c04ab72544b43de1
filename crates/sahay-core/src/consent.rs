//! Consent registry: granular, versioned consent receipts.
//!
//! A change of consent is always a new row, never an update; the state at
//! time `T` is the newest row per `(user, category, scope)` with
//! `granted_at <= T`. Rows carry the consent-document version that was
//! active when they were written: bumping the document version makes every
//! older grant count as ungranted until the user re-consents.
//!
//! Enforcement reads committed state on every check — revocation takes
//! effect on the next check, with no caching that could outlive it.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use uuid::Uuid;

use crate::audit::{self, ActorContext};
use crate::error::Error;
use crate::store::{Store, fmt_ts};

/// Settings key holding the active consent-document version.
const DOCUMENT_VERSION_KEY: &str = "consent_document_version";

/// Consent categories (closed set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentCategory {
    Tracking,
    CloudSync,
    Neuro,
    Complaints,
    Analytics,
}

impl ConsentCategory {
    /// Every category.
    pub const ALL: [Self; 5] = [
        Self::Tracking,
        Self::CloudSync,
        Self::Neuro,
        Self::Complaints,
        Self::Analytics,
    ];

    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tracking => "tracking",
            Self::CloudSync => "cloud_sync",
            Self::Neuro => "neuro",
            Self::Complaints => "complaints",
            Self::Analytics => "analytics",
        }
    }

    /// Parses the stable string form.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for anything outside the closed set.
    pub fn parse(s: &str) -> Result<Self, Error> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown consent category: {s}")))
    }
}

/// Consent scopes (closed set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentScope {
    Asha,
    Clinician,
    GovAggregated,
}

impl ConsentScope {
    /// Every scope.
    pub const ALL: [Self; 3] = [Self::Asha, Self::Clinician, Self::GovAggregated];

    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Asha => "asha",
            Self::Clinician => "clinician",
            Self::GovAggregated => "gov_aggregated",
        }
    }

    /// Parses the stable string form.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for anything outside the closed set.
    pub fn parse(s: &str) -> Result<Self, Error> {
        Self::ALL
            .into_iter()
            .find(|s_| s_.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown consent scope: {s}")))
    }
}

/// One consent receipt row.
#[derive(Debug, Clone, Serialize)]
pub struct ConsentReceipt {
    /// Receipt id.
    pub id: String,
    /// Granting user.
    pub user_id: String,
    /// Category granted or revoked.
    pub category: String,
    /// Scope granted or revoked.
    pub scope: String,
    /// Consent-document version active when the receipt was written.
    pub version: u32,
    /// Grant (`true`) or revocation (`false`).
    pub granted: bool,
    /// When the receipt was written (canonical RFC 3339).
    pub granted_at: String,
}

/// The consent registry.
#[derive(Debug, Clone)]
pub struct ConsentService {
    store: Store,
}

impl ConsentService {
    /// Creates the registry over the shared store.
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// The active consent-document version (defaults to 1).
    ///
    /// # Errors
    ///
    /// Returns `Transient` on database failure.
    pub fn active_document_version(&self) -> Result<u32, Error> {
        Ok(self
            .store
            .setting(DOCUMENT_VERSION_KEY)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(1))
    }

    /// Bumps the active document version. Existing grants of older versions
    /// count as ungranted from this point until re-consented.
    ///
    /// # Errors
    ///
    /// `Validation` if the version does not increase.
    pub fn set_document_version(
        &self,
        actor: &ActorContext,
        version: u32,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let current = self.active_document_version()?;
        if version <= current {
            return Err(Error::Validation(format!(
                "document version must increase (current {current}, got {version})"
            )));
        }
        self.store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![DOCUMENT_VERSION_KEY, version.to_string()],
            )?;
            audit::append(
                tx,
                actor,
                "consent.document_version",
                "consent_document",
                None,
                &serde_json::json!({ "version": version }),
                now,
            )?;
            Ok(())
        })
    }

    /// Appends a consent receipt (grant or revocation).
    ///
    /// # Errors
    ///
    /// Returns `Transient` on database failure.
    pub fn grant(
        &self,
        actor: &ActorContext,
        user_id: &str,
        category: ConsentCategory,
        scope: ConsentScope,
        granted: bool,
        now: DateTime<Utc>,
    ) -> Result<ConsentReceipt, Error> {
        let version = self.active_document_version()?;
        let receipt = ConsentReceipt {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            category: category.as_str().to_string(),
            scope: scope.as_str().to_string(),
            version,
            granted,
            granted_at: fmt_ts(now),
        };

        self.store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO consents (id, user_id, category, scope, version, granted, granted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    receipt.id,
                    receipt.user_id,
                    receipt.category,
                    receipt.scope,
                    receipt.version,
                    receipt.granted,
                    receipt.granted_at,
                ],
            )?;
            audit::append(
                tx,
                actor,
                if granted { "consent.grant" } else { "consent.revoke" },
                "consent",
                Some(&receipt.id),
                &serde_json::json!({
                    "category": receipt.category,
                    "scope": receipt.scope,
                    "granted": granted,
                    "version": version,
                }),
                now,
            )?;
            Ok(())
        })?;

        Ok(receipt)
    }

    /// Lists every receipt for a user, newest first.
    ///
    /// # Errors
    ///
    /// Returns `Transient` on database failure.
    pub fn list(&self, user_id: &str) -> Result<Vec<ConsentReceipt>, Error> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, category, scope, version, granted, granted_at
                 FROM consents WHERE user_id = ?1
                 ORDER BY granted_at DESC, rowid DESC",
            )?;
            let receipts = stmt
                .query_map(params![user_id], |row| {
                    Ok(ConsentReceipt {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        category: row.get(2)?,
                        scope: row.get(3)?,
                        version: row.get(4)?,
                        granted: row.get(5)?,
                        granted_at: row.get(6)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(receipts)
        })
    }

    /// Whether consent is granted at time `at`: the newest receipt with
    /// `granted_at <= at` must be a grant carrying the active document
    /// version.
    ///
    /// # Errors
    ///
    /// Returns `Transient` on database failure.
    pub fn is_granted(
        &self,
        user_id: &str,
        category: ConsentCategory,
        scope: ConsentScope,
        at: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let active_version = self.active_document_version()?;
        self.store.with_conn(|conn| {
            let newest: Option<(bool, u32)> = conn
                .query_row(
                    "SELECT granted, version FROM consents
                     WHERE user_id = ?1 AND category = ?2 AND scope = ?3
                       AND granted_at <= ?4
                     ORDER BY granted_at DESC, rowid DESC
                     LIMIT 1",
                    params![user_id, category.as_str(), scope.as_str(), fmt_ts(at)],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            Ok(matches!(newest, Some((true, version)) if version == active_version))
        })
    }

    /// Requires consent now; the error carries the missing category/scope.
    ///
    /// # Errors
    ///
    /// `ConsentMissing` when the grant is absent, revoked, or from an older
    /// document version.
    pub fn require(
        &self,
        user_id: &str,
        category: ConsentCategory,
        scope: ConsentScope,
        at: DateTime<Utc>,
    ) -> Result<(), Error> {
        if self.is_granted(user_id, category, scope, at)? {
            Ok(())
        } else {
            Err(Error::ConsentMissing {
                category: category.as_str().to_string(),
                scope: scope.as_str().to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn service() -> ConsentService {
        ConsentService::new(Store::in_memory().unwrap())
    }

    #[test]
    fn category_and_scope_round_trip() {
        for c in ConsentCategory::ALL {
            assert_eq!(ConsentCategory::parse(c.as_str()).unwrap(), c);
        }
        for s in ConsentScope::ALL {
            assert_eq!(ConsentScope::parse(s.as_str()).unwrap(), s);
        }
        assert!(ConsentCategory::parse("biometrics").is_err());
    }

    #[test]
    fn newest_receipt_wins() {
        let consents = service();
        let actor = ActorContext::system();
        let t0 = Utc::now();

        consents
            .grant(&actor, "u-1", ConsentCategory::Analytics, ConsentScope::GovAggregated, true, t0)
            .unwrap();
        assert!(consents
            .is_granted("u-1", ConsentCategory::Analytics, ConsentScope::GovAggregated, t0)
            .unwrap());

        let t1 = t0 + Duration::seconds(5);
        consents
            .grant(&actor, "u-1", ConsentCategory::Analytics, ConsentScope::GovAggregated, false, t1)
            .unwrap();
        assert!(!consents
            .is_granted("u-1", ConsentCategory::Analytics, ConsentScope::GovAggregated, t1)
            .unwrap());

        // The state *at* t0 is still the grant.
        assert!(consents
            .is_granted("u-1", ConsentCategory::Analytics, ConsentScope::GovAggregated, t0)
            .unwrap());
    }

    #[test]
    fn ungranted_by_default_and_scoped() {
        let consents = service();
        let now = Utc::now();
        assert!(!consents
            .is_granted("u-1", ConsentCategory::Analytics, ConsentScope::GovAggregated, now)
            .unwrap());

        consents
            .grant(
                &ActorContext::system(),
                "u-1",
                ConsentCategory::Analytics,
                ConsentScope::Clinician,
                true,
                now,
            )
            .unwrap();
        // Scope is part of the key.
        assert!(!consents
            .is_granted("u-1", ConsentCategory::Analytics, ConsentScope::GovAggregated, now)
            .unwrap());
    }

    #[test]
    fn document_version_bump_resets_grants() {
        let consents = service();
        let actor = ActorContext::system();
        let now = Utc::now();

        consents
            .grant(&actor, "u-1", ConsentCategory::Tracking, ConsentScope::Asha, true, now)
            .unwrap();
        assert!(consents
            .is_granted("u-1", ConsentCategory::Tracking, ConsentScope::Asha, now)
            .unwrap());

        consents.set_document_version(&actor, 2, now).unwrap();
        assert!(!consents
            .is_granted("u-1", ConsentCategory::Tracking, ConsentScope::Asha, now)
            .unwrap());

        // Re-consent under the new document restores the grant.
        let later = now + Duration::seconds(1);
        consents
            .grant(&actor, "u-1", ConsentCategory::Tracking, ConsentScope::Asha, true, later)
            .unwrap();
        assert!(consents
            .is_granted("u-1", ConsentCategory::Tracking, ConsentScope::Asha, later)
            .unwrap());
    }

    #[test]
    fn document_version_must_increase() {
        let consents = service();
        assert!(matches!(
            consents.set_document_version(&ActorContext::system(), 1, Utc::now()),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn require_reports_missing_pair() {
        let consents = service();
        let err = consents
            .require("u-9", ConsentCategory::Analytics, ConsentScope::GovAggregated, Utc::now())
            .unwrap_err();
        match err {
            Error::ConsentMissing { category, scope } => {
                assert_eq!(category, "analytics");
                assert_eq!(scope, "gov_aggregated");
            },
            other => panic!("expected ConsentMissing, got {other:?}"),
        }
    }
}
