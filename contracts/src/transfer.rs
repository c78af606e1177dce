//! # Asset Transfer Seam
//!
//! The escrow core never moves value itself. Every disbursing transition
//! calls [`AssetTransfer::transfer`] exactly once and reacts to the outcome:
//! success lets the staged record commit, any error aborts the whole
//! operation.

use std::sync::Arc;

use thiserror::Error;

use crate::escrow::{Amount, PartyId};

/// Failure reported by a transfer collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    /// The collaborator refused the transfer (bad recipient, policy, ...).
    #[error("transfer rejected: {0}")]
    Rejected(String),

    /// The source of funds cannot cover the transfer.
    #[error("insufficient funds: available {available}, requested {requested}")]
    InsufficientFunds {
        /// Balance the collaborator could draw from.
        available: Amount,
        /// Amount that was requested.
        requested: Amount,
    },

    /// The settlement rail is down or did not answer in time.
    #[error("transfer service unavailable: {0}")]
    Unavailable(String),
}

/// Moves value to a party.
///
/// Implementations must be synchronous and bounded in time: the engine holds
/// the escrow's lock for the duration of the call.
pub trait AssetTransfer: Send + Sync {
    /// Pays `amount` to `to`.
    fn transfer(&self, to: &PartyId, amount: Amount) -> Result<(), TransferError>;
}

impl<T: AssetTransfer + ?Sized> AssetTransfer for Arc<T> {
    fn transfer(&self, to: &PartyId, amount: Amount) -> Result<(), TransferError> {
        (**self).transfer(to, amount)
    }
}
