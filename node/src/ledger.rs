//! # Ledger
//!
//! In-memory account balances plus a single vault that holds every escrowed
//! deposit. The node funds an escrow by moving the deposit from the buyer's
//! account into the vault; the escrow engine pays out of the vault through
//! the [`AssetTransfer`] implementation below.
//!
//! Accounts and the vault sit behind one lock so a deposit (account debit +
//! vault credit) is never observed half-applied.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use covenant_contracts::{Amount, AssetTransfer, PartyId, TransferError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during ledger operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// Attempted to debit more than the available balance.
    #[error("insufficient balance for {party}: available {available}, requested {requested}")]
    InsufficientFunds {
        /// Account being debited (`vault` for payouts).
        party: String,
        /// The current balance.
        available: Amount,
        /// The amount that was requested.
        requested: Amount,
    },

    /// Arithmetic overflow during a credit.
    #[error("balance overflow for {party}: current {current}, credit {credit}")]
    Overflow {
        /// Account being credited.
        party: String,
        /// The balance before the failed credit.
        current: Amount,
        /// The amount that caused the overflow.
        credit: Amount,
    },

    /// Zero amounts and null parties are refused.
    #[error("invalid ledger operation: {0}")]
    Invalid(String),

    /// The ledger has been halted and refuses payouts.
    #[error("ledger is halted")]
    Halted,
}

impl From<LedgerError> for TransferError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFunds {
                available,
                requested,
                ..
            } => TransferError::InsufficientFunds {
                available,
                requested,
            },
            LedgerError::Halted => TransferError::Unavailable("ledger is halted".into()),
            other => TransferError::Rejected(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Serializable image of the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub balances: BTreeMap<PartyId, Amount>,
    pub vault: Amount,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Books {
    balances: BTreeMap<PartyId, Amount>,
    vault: Amount,
}

/// Account balances and the escrow vault.
#[derive(Debug, Default)]
pub struct Ledger {
    books: Mutex<Books>,
    halted: AtomicBool,
}

impl Ledger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores a ledger from a snapshot.
    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Self {
        Self {
            books: Mutex::new(Books {
                balances: snapshot.balances,
                vault: snapshot.vault,
            }),
            halted: AtomicBool::new(false),
        }
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let books = self.books.lock();
        LedgerSnapshot {
            balances: books.balances.clone(),
            vault: books.vault,
        }
    }

    /// Adds funds to an account (genesis allocation and the dev faucet).
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Invalid`] for a null party or zero amount and
    /// [`LedgerError::Overflow`] if the balance would exceed `u64::MAX`.
    pub fn credit(&self, party: &PartyId, amount: Amount) -> Result<Amount, LedgerError> {
        check(party, amount)?;
        let mut books = self.books.lock();
        let balance = add_to(&mut books.balances, party, amount)?;
        debug!(party = %party, amount, balance, "account credited");
        Ok(balance)
    }

    /// Current balance of an account. Unknown accounts hold zero.
    pub fn balance(&self, party: &PartyId) -> Amount {
        self.books.lock().balances.get(party).copied().unwrap_or(0)
    }

    /// Total held in the vault.
    pub fn vault_balance(&self) -> Amount {
        self.books.lock().vault
    }

    /// Moves `amount` from `from`'s account into the vault.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InsufficientFunds`] if the account cannot cover
    /// the deposit. Nothing changes on error.
    pub fn deposit(&self, from: &PartyId, amount: Amount) -> Result<(), LedgerError> {
        check(from, amount)?;
        let mut books = self.books.lock();

        let available = books.balances.get(from).copied().unwrap_or(0);
        if available < amount {
            return Err(LedgerError::InsufficientFunds {
                party: from.to_string(),
                available,
                requested: amount,
            });
        }
        let vault = books
            .vault
            .checked_add(amount)
            .ok_or_else(|| LedgerError::Overflow {
                party: "vault".into(),
                current: books.vault,
                credit: amount,
            })?;

        books.balances.insert(from.clone(), available - amount);
        books.vault = vault;
        debug!(party = %from, amount, vault, "deposit moved into vault");
        Ok(())
    }

    /// Reverses a [`deposit`](Self::deposit) whose escrow was never created.
    pub fn return_deposit(&self, to: &PartyId, amount: Amount) -> Result<(), LedgerError> {
        let mut books = self.books.lock();
        debit_vault(&mut books, amount)?;
        add_to(&mut books.balances, to, amount)?;
        debug!(party = %to, amount, "deposit returned");
        Ok(())
    }

    /// Makes every payout fail with [`LedgerError::Halted`] until
    /// [`resume`](Self::resume) is called.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
        warn!("ledger halted, payouts suspended");
    }

    pub fn resume(&self) {
        self.halted.store(false, Ordering::SeqCst);
        info!("ledger resumed");
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Pays `amount` from the vault to `to`.
    pub fn pay_out(&self, to: &PartyId, amount: Amount) -> Result<(), LedgerError> {
        if self.is_halted() {
            return Err(LedgerError::Halted);
        }
        check(to, amount)?;

        let mut books = self.books.lock();
        let before = books.vault;
        debit_vault(&mut books, amount)?;
        if let Err(e) = add_to(&mut books.balances, to, amount) {
            books.vault = before;
            return Err(e);
        }
        info!(recipient = %to, amount, vault = books.vault, "payout settled");
        Ok(())
    }
}

impl AssetTransfer for Ledger {
    fn transfer(&self, to: &PartyId, amount: Amount) -> Result<(), TransferError> {
        self.pay_out(to, amount).map_err(TransferError::from)
    }
}

fn check(party: &PartyId, amount: Amount) -> Result<(), LedgerError> {
    if party.is_null() {
        return Err(LedgerError::Invalid("null party".into()));
    }
    if amount == 0 {
        return Err(LedgerError::Invalid("amount must be greater than 0".into()));
    }
    Ok(())
}

fn add_to(
    balances: &mut BTreeMap<PartyId, Amount>,
    party: &PartyId,
    amount: Amount,
) -> Result<Amount, LedgerError> {
    let entry = balances.entry(party.clone()).or_insert(0);
    let updated = entry
        .checked_add(amount)
        .ok_or_else(|| LedgerError::Overflow {
            party: party.to_string(),
            current: *entry,
            credit: amount,
        })?;
    *entry = updated;
    Ok(updated)
}

fn debit_vault(books: &mut Books, amount: Amount) -> Result<(), LedgerError> {
    if books.vault < amount {
        return Err(LedgerError::InsufficientFunds {
            party: "vault".into(),
            available: books.vault,
            requested: amount,
        });
    }
    books.vault -= amount;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> PartyId {
        "alice".into()
    }

    fn bob() -> PartyId {
        "bob".into()
    }

    #[test]
    fn credit_and_balance() {
        let ledger = Ledger::new();
        assert_eq!(ledger.balance(&alice()), 0);
        assert_eq!(ledger.credit(&alice(), 100).unwrap(), 100);
        assert_eq!(ledger.credit(&alice(), 50).unwrap(), 150);
        assert_eq!(ledger.balance(&alice()), 150);
    }

    #[test]
    fn credit_rejects_zero_and_null() {
        let ledger = Ledger::new();
        assert!(matches!(
            ledger.credit(&alice(), 0),
            Err(LedgerError::Invalid(_))
        ));
        assert!(matches!(
            ledger.credit(&PartyId::null(), 10),
            Err(LedgerError::Invalid(_))
        ));
    }

    #[test]
    fn credit_overflow() {
        let ledger = Ledger::new();
        ledger.credit(&alice(), u64::MAX).unwrap();
        assert!(matches!(
            ledger.credit(&alice(), 1),
            Err(LedgerError::Overflow { .. })
        ));
        assert_eq!(ledger.balance(&alice()), u64::MAX);
    }

    #[test]
    fn deposit_moves_funds_into_vault() {
        let ledger = Ledger::new();
        ledger.credit(&alice(), 100).unwrap();
        ledger.deposit(&alice(), 60).unwrap();

        assert_eq!(ledger.balance(&alice()), 40);
        assert_eq!(ledger.vault_balance(), 60);
    }

    #[test]
    fn deposit_without_funds_changes_nothing() {
        let ledger = Ledger::new();
        ledger.credit(&alice(), 10).unwrap();

        let err = ledger.deposit(&alice(), 11).unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientFunds {
                party: "alice".into(),
                available: 10,
                requested: 11,
            }
        );
        assert_eq!(ledger.balance(&alice()), 10);
        assert_eq!(ledger.vault_balance(), 0);
    }

    #[test]
    fn return_deposit_restores_account() {
        let ledger = Ledger::new();
        ledger.credit(&alice(), 100).unwrap();
        ledger.deposit(&alice(), 100).unwrap();
        ledger.return_deposit(&alice(), 100).unwrap();

        assert_eq!(ledger.balance(&alice()), 100);
        assert_eq!(ledger.vault_balance(), 0);
    }

    #[test]
    fn transfer_pays_out_of_vault() {
        let ledger = Ledger::new();
        ledger.credit(&alice(), 100).unwrap();
        ledger.deposit(&alice(), 100).unwrap();

        ledger.transfer(&bob(), 70).unwrap();

        assert_eq!(ledger.balance(&bob()), 70);
        assert_eq!(ledger.vault_balance(), 30);
    }

    #[test]
    fn transfer_beyond_vault_is_insufficient_funds() {
        let ledger = Ledger::new();
        let err = ledger.transfer(&bob(), 1).unwrap_err();
        assert_eq!(
            err,
            TransferError::InsufficientFunds {
                available: 0,
                requested: 1,
            }
        );
    }

    #[test]
    fn halted_ledger_is_unavailable() {
        let ledger = Ledger::new();
        ledger.credit(&alice(), 10).unwrap();
        ledger.deposit(&alice(), 10).unwrap();

        ledger.halt();
        assert!(matches!(
            ledger.transfer(&bob(), 10),
            Err(TransferError::Unavailable(_))
        ));
        assert_eq!(ledger.vault_balance(), 10);

        ledger.resume();
        ledger.transfer(&bob(), 10).unwrap();
        assert_eq!(ledger.balance(&bob()), 10);
    }

    #[test]
    fn snapshot_restores_books() {
        let ledger = Ledger::new();
        ledger.credit(&alice(), 100).unwrap();
        ledger.deposit(&alice(), 25).unwrap();

        let restored = Ledger::from_snapshot(ledger.snapshot());
        assert_eq!(restored.balance(&alice()), 75);
        assert_eq!(restored.vault_balance(), 25);
        assert!(!restored.is_halted());
    }
}
