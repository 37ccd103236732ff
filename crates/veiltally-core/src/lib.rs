//! # veiltally-core
//!
//! Client-side protocol engine for confidential on-chain aggregation:
//! anonymous polls and private salary reporting over homomorphic
//! ciphertexts, with threshold decryption gated by on-chain grants.
//!
//! The engine sits between a presentation layer and two external systems
//! it consumes but never reimplements:
//!
//! - an [`encryption::EncryptionBackend`], wrapping the FHE client library
//!   that produces ciphertexts with input proofs and serves decryption
//!   requests, and
//! - a [`ledger::LedgerClient`], wrapping the aggregation contracts that
//!   accumulate ciphertexts homomorphically and record decryption grants.
//!
//! ## Components
//!
//! - [`encryption`]: the encryption context bound to one `(chain, signer)`
//!   pair; refuses to operate once the session has moved on
//!   (`ContextStale`), so account or chain switches cannot silently use
//!   the wrong keys.
//! - [`submission`]: the idempotent submission pipeline. Validation runs
//!   before any network call, and at most one submission per
//!   `(subject, instance)` pair is in flight; a re-entrant submission
//!   fails fast with `SubmissionInProgress`.
//! - [`acl`]: the grant workflow. Each `(handle, principal)` pair moves
//!   through `Unauthorized`, `AuthorizationPending`, and `Authorized`;
//!   decryption is only requested for handles the read path has observed
//!   a grant for.
//! - [`reconcile`]: the decrypt-and-reconcile cycle. Passes are serialized
//!   per instance, invalidated wholesale on reselection or rebind, and
//!   freeze each decrypted value the first time it is observed.
//! - [`read_model`]: immutable snapshots published over a watch channel,
//!   replaced wholesale so observers never see a torn read.
//! - [`orchestrator`]: the command/query facade the presentation layer
//!   talks to.
//!
//! Typical lifecycle: construct an [`Orchestrator`] bound to the active
//! chain and signer, spawn its reconcile loop, select an aggregation
//! instance, then issue commands (`submit_salary`, `cast_vote`, the grant
//! operations, `decrypt`) and read the published snapshots.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod acl;
pub mod config;
pub mod encryption;
pub mod error;
pub mod ledger;
pub mod model;
pub mod orchestrator;
pub mod read_model;
pub mod reconcile;
pub mod submission;
pub mod task;

pub use acl::GrantTracker;
pub use config::OrchestratorConfig;
pub use encryption::{CiphertextWithProof, EncryptionBackend, EncryptionContext, SessionWatch};
pub use error::{ErrorClass, OrchestratorError};
pub use ledger::{LedgerClient, LedgerError};
pub use model::{
    Address, AuthorizationState, CiphertextHandle, DecryptionGrant, HandleBytes, InstanceId,
    PollInfo, Principal, SessionBinding, TxReceipt,
};
pub use orchestrator::Orchestrator;
pub use read_model::{ReadModelCache, ReadModelSnapshot};
pub use reconcile::Reconciler;
pub use submission::{SubmissionPipeline, ValidatedInput};
pub use task::CancelToken;
