//! # Escrow Record
//!
//! The data model for a single buyer/seller agreement and the error type
//! shared by every escrow operation.
//!
//! An [`Escrow`] is created once, mutated only through the state machine in
//! [`crate::engine`], and never deleted. The parties, creation time, timeout
//! and description are fixed at construction: the fields are private and
//! only exposed through read accessors, so nothing outside this crate can
//! reassign a buyer after the fact.
//!
//! ```text
//!                      confirm_delivery (buyer)
//!   AwaitingDelivery ─────────────────────────────▶ Complete
//!        │   │                                          ▲
//!        │   │ request_refund, timeout elapsed          │ resolve_dispute
//!        │   └──────────────────────────▶ Refunded      │ (favor seller)
//!        │                                   ▲          │
//!        │ request_refund, early             │          │
//!        └──────────────▶ Disputed ──────────┴──────────┘
//!                                resolve_dispute (favor buyer)
//! ```

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transfer::TransferError;

/// Sequential escrow identifier. The first escrow is `0`.
pub type EscrowId = u64;

/// Held balance in the smallest unit of the single supported asset.
pub type Amount = u64;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during escrow operations.
///
/// Every variant is a rejected operation: the stored record is left exactly
/// as it was before the call.
#[derive(Debug, Error)]
pub enum EscrowError {
    /// No escrow has been allocated under this identifier.
    #[error("escrow {0} not found")]
    NotFound(EscrowId),

    /// The caller is not allowed to perform this operation on the escrow.
    #[error("unauthorized: {caller} may not act on escrow {id}")]
    Unauthorized {
        /// The escrow being operated on.
        id: EscrowId,
        /// The identity that attempted the operation.
        caller: PartyId,
    },

    /// The escrow is not in a state that allows this operation.
    #[error("invalid state transition: escrow {id} is {current}, expected {expected}")]
    InvalidState {
        /// The escrow being operated on.
        id: EscrowId,
        /// The escrow's current state.
        current: EscrowState,
        /// The state required for this operation.
        expected: EscrowState,
    },

    /// A creation argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The transfer collaborator reported a failure; nothing was committed.
    #[error("transfer for escrow {id} failed: {source}")]
    TransferFailed {
        /// The escrow whose disbursement failed.
        id: EscrowId,
        /// The collaborator's error.
        #[source]
        source: TransferError,
    },

    /// The operation is time-gated and the gate has not opened yet.
    #[error("escrow {id} cannot be settled before {not_before}")]
    TimeoutNotElapsed {
        /// The escrow being operated on.
        id: EscrowId,
        /// Earliest instant at which the operation may succeed.
        not_before: DateTime<Utc>,
    },
}

impl EscrowError {
    /// Create an invalid argument error
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Short, stable label for metrics and API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Unauthorized { .. } => "unauthorized",
            Self::InvalidState { .. } => "invalid_state",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::TransferFailed { .. } => "transfer_failed",
            Self::TimeoutNotElapsed { .. } => "timeout_not_elapsed",
        }
    }
}

// ---------------------------------------------------------------------------
// PartyId
// ---------------------------------------------------------------------------

/// Opaque identity of a buyer or seller.
///
/// The escrow core never interprets the value; it only compares identities
/// for equality. The empty (or all-whitespace) string is the null identity
/// and is never accepted as a party.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartyId(String);

impl PartyId {
    /// Wraps a raw identity value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The null identity.
    pub fn null() -> Self {
        Self(String::new())
    }

    /// Returns `true` for the null identity.
    pub fn is_null(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// The raw identity value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartyId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PartyId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// EscrowState
// ---------------------------------------------------------------------------

/// Lifecycle state of an escrow.
///
/// There is no "awaiting payment" state: the deposit is part of creation,
/// so every escrow starts out funded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EscrowState {
    /// Funded and waiting for the buyer to confirm delivery.
    AwaitingDelivery,
    /// Funds released to the seller. Terminal.
    Complete,
    /// Buyer asked for a refund before the timeout; waiting for resolution.
    Disputed,
    /// Funds returned to the buyer. Terminal.
    Refunded,
}

impl EscrowState {
    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Refunded)
    }
}

impl fmt::Display for EscrowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscrowState::AwaitingDelivery => write!(f, "AwaitingDelivery"),
            EscrowState::Complete => write!(f, "Complete"),
            EscrowState::Disputed => write!(f, "Disputed"),
            EscrowState::Refunded => write!(f, "Refunded"),
        }
    }
}

// ---------------------------------------------------------------------------
// Escrow
// ---------------------------------------------------------------------------

/// A single buyer/seller fund-holding agreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escrow {
    id: EscrowId,
    buyer: PartyId,
    seller: PartyId,
    amount: Amount,
    state: EscrowState,
    created_at: DateTime<Utc>,
    timeout_secs: u64,
    description: String,
    buyer_approved: bool,
    seller_approved: bool,
    updated_at: DateTime<Utc>,
}

impl Escrow {
    /// Builds a freshly funded record in `AwaitingDelivery`.
    ///
    /// Argument validation is the engine's job; this constructor only
    /// assembles the record.
    pub(crate) fn new(
        id: EscrowId,
        buyer: PartyId,
        seller: PartyId,
        amount: Amount,
        created_at: DateTime<Utc>,
        timeout_secs: u64,
        description: String,
    ) -> Self {
        Self {
            id,
            buyer,
            seller,
            amount,
            state: EscrowState::AwaitingDelivery,
            created_at,
            timeout_secs,
            description,
            buyer_approved: false,
            seller_approved: false,
            updated_at: created_at,
        }
    }

    /// Identifier assigned by the registry.
    pub fn id(&self) -> EscrowId {
        self.id
    }

    /// Party that funded the escrow.
    pub fn buyer(&self) -> &PartyId {
        &self.buyer
    }

    /// Party that receives the payment on completion.
    pub fn seller(&self) -> &PartyId {
        &self.seller
    }

    /// Balance still held. Zero once the escrow has been disbursed.
    pub fn amount(&self) -> Amount {
        self.amount
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EscrowState {
        self.state
    }

    /// Creation time. Both deadlines are measured from here.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Refund timeout chosen by the buyer at creation, in seconds.
    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    /// Free-text description supplied by the buyer.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Set once the buyer confirms delivery.
    pub fn buyer_approved(&self) -> bool {
        self.buyer_approved
    }

    /// Set alongside `buyer_approved` when the payment is released.
    pub fn seller_approved(&self) -> bool {
        self.seller_approved
    }

    /// Time of the last committed transition.
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Instant from which `request_refund` pays the buyer directly.
    ///
    /// Fails with `InvalidArgument` if the timeout pushes the deadline past
    /// the representable date range.
    pub fn refund_deadline(&self) -> Result<DateTime<Utc>, EscrowError> {
        self.offset_from_creation(self.timeout_secs)
    }

    /// Instant from which a disputed escrow may be resolved.
    pub fn dispute_deadline(&self) -> Result<DateTime<Utc>, EscrowError> {
        self.offset_from_creation(crate::config::DISPUTE_WINDOW.as_secs())
    }

    fn offset_from_creation(&self, secs: u64) -> Result<DateTime<Utc>, EscrowError> {
        Duration::from_std(std::time::Duration::from_secs(secs))
            .ok()
            .and_then(|offset| self.created_at.checked_add_signed(offset))
            .ok_or_else(|| {
                EscrowError::InvalidArgument(format!("escrow {} deadline is out of range", self.id))
            })
    }

    /// Returns `true` if `party` is the buyer or the seller.
    pub fn is_participant(&self, party: &PartyId) -> bool {
        *party == self.buyer || *party == self.seller
    }

    // -- transitions (crate-internal) ---------------------------------------

    pub(crate) fn ensure_buyer(&self, caller: &PartyId) -> Result<(), EscrowError> {
        if *caller != self.buyer {
            return Err(EscrowError::Unauthorized {
                id: self.id,
                caller: caller.clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn ensure_participant(&self, caller: &PartyId) -> Result<(), EscrowError> {
        if !self.is_participant(caller) {
            return Err(EscrowError::Unauthorized {
                id: self.id,
                caller: caller.clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn ensure_state(&self, expected: EscrowState) -> Result<(), EscrowError> {
        if self.state != expected {
            return Err(EscrowError::InvalidState {
                id: self.id,
                current: self.state,
                expected,
            });
        }
        Ok(())
    }

    /// Zeroes the held amount and moves to a terminal state, returning the
    /// amount that must be paid out. Only ever applied to a staged copy.
    pub(crate) fn disburse(&mut self, terminal: EscrowState, now: DateTime<Utc>) -> Amount {
        debug_assert!(terminal.is_terminal());
        let amount = self.amount;
        self.amount = 0;
        self.state = terminal;
        self.updated_at = now;
        amount
    }

    pub(crate) fn raise_dispute(&mut self, now: DateTime<Utc>) {
        self.state = EscrowState::Disputed;
        self.updated_at = now;
    }

    /// Records an explicit confirmation by `party`. Approvals never revert.
    pub(crate) fn approve(&mut self, party: &PartyId) {
        if *party == self.buyer {
            self.buyer_approved = true;
        } else if *party == self.seller {
            self.seller_approved = true;
        }
    }
}
