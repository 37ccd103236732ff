//! Error taxonomy for orchestrator operations.
//!
//! Every failure an orchestrator operation can surface is a variant here.
//! Validation and idempotency failures are resolved locally and never touch
//! the network; contract rejections are translated from raw revert data by
//! [`crate::ledger::translate_ledger_error`] so raw revert strings never
//! reach the presentation layer uninterpreted.

use std::fmt;

use thiserror::Error;

use crate::model::{Address, HandleBytes, InstanceId, SessionBinding};

/// Errors surfaced by orchestrator operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum OrchestratorError {
    /// User input failed domain validation. Never reaches the network.
    #[error("validation failed: {reason}")]
    ValidationError {
        /// Why the input is invalid.
        reason: String,
    },

    /// The idempotency guard tripped: a submission for the same subject and
    /// instance is already in flight.
    #[error("submission already in progress for {subject} in {instance}")]
    SubmissionInProgress {
        /// The subject whose submission is in flight.
        subject: Address,
        /// The instance being submitted to.
        instance: InstanceId,
    },

    /// The subject already participated in this period or poll.
    #[error("subject already submitted for this aggregation instance")]
    AlreadySubmitted,

    /// The resubmission cooldown is active. Never retried internally; retry
    /// timing is a caller concern.
    #[error("resubmission cooldown active")]
    RateLimited {
        /// Cooldown window in seconds, when the contract parameter is known.
        cooldown_secs: Option<u64>,
    },

    /// The voting window is closed.
    #[error("poll is not active")]
    PollNotActive,

    /// The chosen option is outside the poll's option range.
    #[error("invalid option: {reason}")]
    InvalidOption {
        /// Detail on the rejected option.
        reason: String,
    },

    /// The grantor lacks the role required to issue a decryption grant.
    #[error("not authorized: {reason}")]
    Unauthorized {
        /// Why the grantor is not allowed to grant.
        reason: String,
    },

    /// A live grant already exists for the (handle, principal) pair.
    #[error("a live decryption grant already exists for this handle and principal")]
    AlreadyGranted,

    /// The decryption backend reports the caller lacks a grant for the
    /// handle.
    #[error("decryption denied for handle {handle}")]
    DecryptionDenied {
        /// The handle the backend refused to decrypt.
        handle: HandleBytes,
    },

    /// The decryption backend could not be reached.
    #[error("decryption backend unavailable: {reason}")]
    DecryptionUnavailable {
        /// Transport-level detail.
        reason: String,
    },

    /// No compatible encryption backend exists for the chain.
    #[error("no encryption backend available for chain {chain_id}")]
    ContextUnavailable {
        /// The unsupported chain id.
        chain_id: u64,
    },

    /// The encryption context was bound for a different chain or signer
    /// than the current session.
    #[error("encryption context is stale: bound to {bound}, session is {current}")]
    ContextStale {
        /// The binding captured when the context was derived.
        bound: SessionBinding,
        /// The session binding at use time.
        current: SessionBinding,
    },

    /// The encryption backend failed to produce a ciphertext.
    #[error("encryption failed: {reason}")]
    EncryptionFailed {
        /// Backend-reported detail.
        reason: String,
    },

    /// Transport-level failure talking to the ledger. Potentially
    /// transient: swallowed per reconciliation pass, surfaced immediately
    /// on submission.
    #[error("network error: {reason}")]
    NetworkError {
        /// Transport-level detail.
        reason: String,
    },

    /// The contract rejected the transaction for a reason outside the
    /// typed taxonomy. The fallback generic message; raw revert data stays
    /// out of the presentation layer.
    #[error("transaction rejected by contract: {reason}")]
    ContractRejected {
        /// A generic, presentation-safe description.
        reason: String,
    },
}

impl OrchestratorError {
    /// Creates a validation error.
    #[must_use]
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::ValidationError {
            reason: reason.into(),
        }
    }

    /// Creates an invalid-option error.
    #[must_use]
    pub fn invalid_option(reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            reason: reason.into(),
        }
    }

    /// Creates an unauthorized error.
    #[must_use]
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized {
            reason: reason.into(),
        }
    }

    /// Creates an encryption-failure error.
    #[must_use]
    pub fn encryption_failed(reason: impl Into<String>) -> Self {
        Self::EncryptionFailed {
            reason: reason.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(reason: impl Into<String>) -> Self {
        Self::NetworkError {
            reason: reason.into(),
        }
    }

    /// Creates a contract-rejection fallback error.
    #[must_use]
    pub fn contract_rejected(reason: impl Into<String>) -> Self {
        Self::ContractRejected {
            reason: reason.into(),
        }
    }

    /// Returns `true` if the failure is plausibly transient and a later
    /// identical attempt may succeed without any state change.
    ///
    /// `RateLimited` is deliberately not transient here: the caller must
    /// wait out an external cooldown, not blindly retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NetworkError { .. } | Self::DecryptionUnavailable { .. }
        )
    }

    /// Returns the classification for this error.
    #[must_use]
    pub const fn error_class(&self) -> ErrorClass {
        match self {
            Self::ValidationError { .. } | Self::InvalidOption { .. } => ErrorClass::Validation,
            Self::SubmissionInProgress { .. } => ErrorClass::Idempotency,
            Self::AlreadySubmitted
            | Self::RateLimited { .. }
            | Self::PollNotActive
            | Self::ContractRejected { .. } => ErrorClass::Contract,
            Self::Unauthorized { .. } | Self::AlreadyGranted => ErrorClass::Acl,
            Self::DecryptionDenied { .. } | Self::DecryptionUnavailable { .. } => {
                ErrorClass::Decryption
            }
            Self::ContextUnavailable { .. }
            | Self::ContextStale { .. }
            | Self::EncryptionFailed { .. } => ErrorClass::Context,
            Self::NetworkError { .. } => ErrorClass::Transport,
        }
    }
}

/// Coarse error classification, used for log fields and presentation
/// styling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad user input, resolved locally.
    Validation,
    /// The in-flight submission guard tripped.
    Idempotency,
    /// Contract-level business-rule rejection.
    Contract,
    /// Grant workflow errors.
    Acl,
    /// Decrypt-path errors.
    Decryption,
    /// Encryption-context errors.
    Context,
    /// Transport-level errors.
    Transport,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Idempotency => write!(f, "idempotency"),
            Self::Contract => write!(f, "contract"),
            Self::Acl => write!(f, "acl"),
            Self::Decryption => write!(f, "decryption"),
            Self::Context => write!(f, "context"),
            Self::Transport => write!(f, "transport"),
        }
    }
}
