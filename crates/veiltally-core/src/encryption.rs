//! Encryption context manager.
//!
//! Owns the lifecycle of the encryption instance bound to the active chain
//! and signer. The cryptography itself lives behind [`EncryptionBackend`];
//! this module contributes the binding discipline: a context captures its
//! `(chain, signer)` pair at bind time and refuses to operate once the
//! session has moved on, so chain or account switches cannot silently use
//! the wrong keys.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use thiserror::Error;

use crate::error::OrchestratorError;
use crate::model::{Address, HandleBytes, SessionBinding};

/// An authenticated ciphertext plus the zero-knowledge input proof binding
/// it to a specific contract call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiphertextWithProof {
    /// The ciphertext bytes.
    pub ciphertext: Vec<u8>,
    /// The input proof bytes.
    pub proof: Vec<u8>,
    /// The contract the ciphertext is bound to.
    pub target_contract: Address,
    /// The contract field or call the ciphertext is bound to.
    pub target_field: String,
}

/// Failures reported by an encryption backend.
///
/// Backends report in their own terms; [`EncryptionContext`] maps these
/// into the orchestrator taxonomy at each call site, since the same
/// transport failure means different things on the encrypt and decrypt
/// paths.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BackendError {
    /// The caller holds no grant for the handle.
    #[error("no decryption grant for handle {handle}")]
    Denied {
        /// The handle the backend refused.
        handle: HandleBytes,
    },
    /// The backend could not be reached.
    #[error("backend transport failure: {0}")]
    Transport(String),
    /// Ciphertext or proof construction failed.
    #[error("ciphertext construction failed: {0}")]
    Encryption(String),
}

/// The external encryption service seam.
///
/// Implementations wrap the FHE client library for a given chain family.
/// The orchestrator consumes, never reimplements, the cryptography.
#[async_trait]
pub trait EncryptionBackend: Send + Sync {
    /// Returns `true` if the backend can serve the given chain.
    fn supports_chain(&self, chain_id: u64) -> bool;

    /// Encrypts `value` for a specific contract call under the session's
    /// keys.
    async fn encrypt_u64(
        &self,
        binding: &SessionBinding,
        target_contract: Address,
        target_field: &str,
        value: u64,
    ) -> Result<CiphertextWithProof, BackendError>;

    /// Requests decryption of the given handles on behalf of the session
    /// signer. Succeeds only for handles the signer holds a grant for.
    async fn request_decrypt(
        &self,
        binding: &SessionBinding,
        handles: &[HandleBytes],
    ) -> Result<HashMap<HandleBytes, u64>, BackendError>;
}

/// An encryption instance bound to one `(chain, signer)` pair.
///
/// Cheap to clone; clones share the backend and carry the same binding.
#[derive(Clone)]
pub struct EncryptionContext {
    backend: Arc<dyn EncryptionBackend>,
    binding: SessionBinding,
}

impl EncryptionContext {
    /// Derives a context for the given chain and signer.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::ContextUnavailable`] when the backend
    /// has no support for the chain.
    pub fn bind(
        backend: Arc<dyn EncryptionBackend>,
        chain_id: u64,
        signer: Address,
    ) -> Result<Self, OrchestratorError> {
        if !backend.supports_chain(chain_id) {
            return Err(OrchestratorError::ContextUnavailable { chain_id });
        }
        Ok(Self {
            backend,
            binding: SessionBinding { chain_id, signer },
        })
    }

    /// The binding captured at bind time.
    #[must_use]
    pub const fn binding(&self) -> SessionBinding {
        self.binding
    }

    /// Fails with [`OrchestratorError::ContextStale`] when the session has
    /// moved to a different chain or signer since this context was bound.
    pub fn ensure_fresh(&self, current: &SessionBinding) -> Result<(), OrchestratorError> {
        if self.binding == *current {
            Ok(())
        } else {
            Err(OrchestratorError::ContextStale {
                bound: self.binding,
                current: *current,
            })
        }
    }

    /// Encrypts `value` bound to a specific contract call.
    ///
    /// # Errors
    ///
    /// `ContextStale` when the session moved since bind time;
    /// `EncryptionFailed` when the backend cannot produce a ciphertext.
    pub async fn encrypt(
        &self,
        current: &SessionBinding,
        target_contract: Address,
        target_field: &str,
        value: u64,
    ) -> Result<CiphertextWithProof, OrchestratorError> {
        self.ensure_fresh(current)?;
        self.backend
            .encrypt_u64(&self.binding, target_contract, target_field, value)
            .await
            .map_err(|err| match err {
                BackendError::Transport(reason) | BackendError::Encryption(reason) => {
                    OrchestratorError::EncryptionFailed { reason }
                }
                BackendError::Denied { handle } => OrchestratorError::encryption_failed(format!(
                    "backend refused encryption (reported denial for {handle})"
                )),
            })
    }

    /// Requests decryption of `handles`.
    ///
    /// # Errors
    ///
    /// `ContextStale` when the session moved since bind time;
    /// `DecryptionDenied` when the signer lacks a grant for one of the
    /// handles; `DecryptionUnavailable` on transport failure.
    pub async fn request_decrypt(
        &self,
        current: &SessionBinding,
        handles: &[HandleBytes],
    ) -> Result<HashMap<HandleBytes, u64>, OrchestratorError> {
        self.ensure_fresh(current)?;
        self.backend
            .request_decrypt(&self.binding, handles)
            .await
            .map_err(|err| match err {
                BackendError::Denied { handle } => OrchestratorError::DecryptionDenied { handle },
                BackendError::Transport(reason) | BackendError::Encryption(reason) => {
                    OrchestratorError::DecryptionUnavailable { reason }
                }
            })
    }
}

/// Shared, rebindable view of the active session.
///
/// An operation captures an [`EncryptionContext`] once when it starts and
/// re-reads the current binding from the watch immediately before each
/// backend call. A rebind between capture and use therefore surfaces as
/// `ContextStale` at the call site instead of a request going out under the
/// previous `(chain, signer)` keys.
#[derive(Clone)]
pub struct SessionWatch {
    inner: Arc<RwLock<EncryptionContext>>,
}

impl SessionWatch {
    /// Wraps a freshly bound context.
    #[must_use]
    pub fn new(ctx: EncryptionContext) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ctx)),
        }
    }

    /// The current context. Operations capture this once at their start.
    #[must_use]
    pub fn context(&self) -> EncryptionContext {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The binding of the current context, re-read on every call.
    #[must_use]
    pub fn binding(&self) -> SessionBinding {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .binding()
    }

    /// Installs a newly bound context, staling every captured one whose
    /// binding differs.
    pub fn replace(&self, ctx: EncryptionContext) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = ctx;
    }
}
