// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Covenant Escrow Contracts
//!
//! The escrow core: a buyer deposits funds, the seller is paid once the
//! buyer confirms delivery, and a timeout/dispute path protects both sides
//! when confirmation never comes.
//!
//! - **escrow**: the [`Escrow`] record, [`PartyId`], states and errors.
//! - **registry**: id allocation and record storage with per-escrow locks.
//! - **engine**: the state machine (create, confirm, refund, resolve).
//! - **transfer**: the seam to whatever actually moves the money.
//! - **clock**: the seam to the time source.
//! - **events**: notifications for audit logs and UIs.
//! - **config**: protocol windows and operator limits.
//!
//! ## Design Principles
//!
//! 1. Funds leave an escrow at most once. The balance is zeroed on a staged
//!    copy and the copy is committed only after the transfer succeeds.
//! 2. Every rejected operation leaves the stored record byte-for-byte
//!    unchanged.
//! 3. Operations on one escrow are serialized; different escrows never wait
//!    on each other.
//! 4. Parties, creation time, timeout and description are immutable after
//!    creation, enforced by private fields.

pub mod clock;
pub mod config;
pub mod engine;
pub mod escrow;
pub mod events;
pub mod registry;
pub mod transfer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EscrowConfig;
pub use engine::EscrowEngine;
pub use escrow::{Amount, Escrow, EscrowError, EscrowId, EscrowState, PartyId};
pub use events::{EscrowEvent, EventSink};
pub use registry::EscrowRegistry;
pub use transfer::{AssetTransfer, TransferError};
