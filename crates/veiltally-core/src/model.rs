//! Domain value types shared across the orchestrator.
//!
//! Everything here is a plain value object: addresses, aggregation-instance
//! identifiers, opaque ciphertext handles, grants, and receipts. The types
//! carry no behaviour beyond derivation helpers; the components in the rest
//! of the crate own the state machines that move them around.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Maximum number of options a poll may carry.
pub const MAX_POLL_OPTIONS: usize = 10;

/// Minimum number of options a poll must carry.
pub const MIN_POLL_OPTIONS: usize = 2;

/// A 20-byte on-chain account address.
///
/// Used for subjects (participants), signers, grantors, and contract
/// addresses alike; the orchestrator never interprets the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// Builds an address whose bytes are all `byte`. Convenient for tests
    /// and deterministic fixtures.
    #[must_use]
    pub const fn repeat(byte: u8) -> Self {
        Self([byte; 20])
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Identifies one bounded aggregation instance: a salary-reporting period
/// or a single poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum InstanceId {
    /// The salary aggregation period with the given ordinal.
    SalaryPeriod(u64),
    /// The poll with the given ordinal id.
    Poll(u32),
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SalaryPeriod(p) => write!(f, "salary period {p}"),
            Self::Poll(id) => write!(f, "poll {id}"),
        }
    }
}

/// Opaque 32-byte reference to an encrypted value held on-chain.
///
/// The all-zero handle is a sentinel for "slot never written": the contract
/// reports it for counters that were never incremented, and the
/// reconciliation cycle short-circuits it to plaintext zero instead of
/// requesting decryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct HandleBytes(pub [u8; 32]);

impl HandleBytes {
    /// The never-written sentinel handle.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Returns `true` if this is the never-written sentinel.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for HandleBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Decryption-authorization state of a ciphertext handle.
///
/// `AuthorizationPending` bridges the gap between a confirmed grant
/// transaction and the read path observing the grant on-chain; handles in
/// that state must not be sent to the decryption backend yet.
///
/// The derived ordering is meaningful: a later state strictly dominates an
/// earlier one, which is what grant merging relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum AuthorizationState {
    /// No live grant is known for the handle.
    Unauthorized,
    /// A grant transaction confirmed but the read path has not observed it.
    AuthorizationPending,
    /// The grant is observable on-chain; decryption may be requested.
    Authorized,
}

/// The party a decryption grant names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Principal {
    /// The HR admin role (salary aggregation).
    Hr,
    /// Anyone; public threshold decryption.
    Public,
    /// A specific on-chain account.
    Account(Address),
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hr => write!(f, "hr"),
            Self::Public => write!(f, "public"),
            Self::Account(addr) => write!(f, "{addr}"),
        }
    }
}

/// A ciphertext handle as the read model sees it: where it lives, what it
/// is authorized for, and the frozen plaintext once one exists.
#[derive(Debug, Clone, Serialize)]
pub struct CiphertextHandle {
    /// The aggregation instance that owns the handle.
    pub instance: InstanceId,
    /// Logical slot within the instance (0 for the salary sum, the option
    /// index for poll counters).
    pub slot: u32,
    /// The raw on-chain handle bytes.
    pub bytes: HandleBytes,
    /// Decryption-authorization state at snapshot time.
    pub authorization: AuthorizationState,
    /// The decrypted value, if one has been observed. Write-once: a present
    /// value is never replaced.
    pub decrypted: Option<u64>,
}

/// A record that a principal has been authorized to decrypt a handle.
#[derive(Debug, Clone, Serialize)]
pub struct DecryptionGrant {
    /// The handle the grant covers.
    pub handle: HandleBytes,
    /// The party allowed to decrypt.
    pub principal: Principal,
    /// When the grant transaction confirmed.
    pub granted_at: DateTime<Utc>,
    /// Receipt of the grant transaction.
    pub receipt: TxReceipt,
}

/// Receipt for a confirmed ledger transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxReceipt {
    /// Transaction hash as a hex string, as reported by the ledger client.
    pub tx_hash: String,
    /// When the transaction confirmed.
    pub confirmed_at: DateTime<Utc>,
}

/// Metadata for one poll, as read from the contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollInfo {
    /// Poll title.
    pub title: String,
    /// Free-form description; may be empty.
    pub description: String,
    /// Option labels, in slot order.
    pub options: Vec<String>,
    /// Whether the voting window is open.
    pub active: bool,
    /// Total number of votes cast so far.
    pub total_votes: u64,
    /// When the voting window closes, if the contract exposes it.
    pub ends_at: Option<DateTime<Utc>>,
}

impl PollInfo {
    /// Number of options.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // option count is bounded by MAX_POLL_OPTIONS
    pub fn option_count(&self) -> u32 {
        self.options.len() as u32
    }
}

/// The `(chain, signer)` pair an encryption context is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionBinding {
    /// Chain id the context was derived for.
    pub chain_id: u64,
    /// The signing account the context was derived for.
    pub signer: Address,
}

impl fmt::Display for SessionBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chain {} / {}", self.chain_id, self.signer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_displays_as_hex() {
        let addr = Address::repeat(0xab);
        let s = addr.to_string();
        assert!(s.starts_with("0xabab"));
        assert_eq!(s.len(), 2 + 40);
    }

    #[test]
    fn zero_handle_sentinel() {
        assert!(HandleBytes::ZERO.is_zero());
        assert!(!HandleBytes([1u8; 32]).is_zero());
    }

    #[test]
    fn authorization_states_are_ordered() {
        assert!(AuthorizationState::Unauthorized < AuthorizationState::AuthorizationPending);
        assert!(AuthorizationState::AuthorizationPending < AuthorizationState::Authorized);
    }

    #[test]
    fn instance_display() {
        assert_eq!(InstanceId::Poll(3).to_string(), "poll 3");
        assert_eq!(InstanceId::SalaryPeriod(1).to_string(), "salary period 1");
    }
}
