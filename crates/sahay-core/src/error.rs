//! The error taxonomy shared by every subsystem.
//!
//! Errors are surfaced to callers as stable *kinds* (see [`Error::kind`]),
//! not as language types: the daemon maps kinds to HTTP status codes in one
//! place, and background jobs branch on [`Error::is_transient`] to decide
//! whether a retry is worthwhile.

use thiserror::Error;

/// Errors produced by the SAHAY core subsystems.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Missing or invalid credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// Authenticated but not allowed (RBAC or ownership).
    #[error("forbidden")]
    Forbidden,

    /// A required consent grant is absent or revoked.
    #[error("consent missing: {category}/{scope}")]
    ConsentMissing {
        /// Consent category that was required.
        category: String,
        /// Consent scope that was required.
        scope: String,
    },

    /// Schema, allow-list, or constraint violation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A payload violated the de-identification rules.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Conflicting write (duplicate key, stale update).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The chain rejected a nonce that is not strictly greater than the
    /// current on-chain nonce.
    #[error("invalid nonce: on-chain nonce is {onchain}")]
    InvalidNonce {
        /// The nonce currently recorded on chain.
        onchain: u64,
    },

    /// Illegal state-machine transition.
    #[error("invalid state transition: {from} -> {to}")]
    StateInvalid {
        /// State the entity was in.
        from: String,
        /// State the caller asked for.
        to: String,
    },

    /// Entity does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Entity existed but was erased under right-to-erasure.
    #[error("record erased")]
    Gone,

    /// Retryable database or I/O failure.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The anchor chain cannot be reached; off-chain flow continues.
    #[error("anchor chain unavailable")]
    ChainUnavailable,

    /// Audit chain verification failed (operator alert).
    #[error("audit chain broken at seq {first_broken_seq}")]
    ChainBroken {
        /// First sequence number where verification failed.
        first_broken_seq: u64,
    },
}

impl Error {
    /// Stable kind identifier for wire surfaces and logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::ConsentMissing { .. } => "ConsentMissing",
            Self::Validation(_) | Self::InvalidPayload(_) => "Validation",
            Self::Conflict(_) | Self::InvalidNonce { .. } => "Conflict",
            Self::StateInvalid { .. } => "StateInvalid",
            Self::NotFound(_) => "NotFound",
            Self::Gone => "Gone",
            Self::Transient(_) => "Transient",
            Self::ChainUnavailable => "ChainUnavailable",
            Self::ChainBroken { .. } => "ChainBroken",
        }
    }

    /// Whether a background retry can reasonably succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::ChainUnavailable)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Transient(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(err.to_string())
    }
}
