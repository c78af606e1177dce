//! # Escrow Registry
//!
//! Owns every [`Escrow`] record and the identifier sequence.
//!
//! Records live in per-id slots (`Arc<Mutex<Escrow>>`) inside a `DashMap`,
//! so the engine can hold one escrow's lock across its whole
//! read → validate → transfer → commit sequence while operations on other
//! escrows proceed in parallel. The sequence is an `AtomicU64` that only
//! [`EscrowRegistry::allocate`] advances; nothing else hands out ids.
//!
//! Slots are never removed. An id that was allocated but not yet populated
//! reads as `NotFound` until its record is `put`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::MAX_TIMEOUT;
use crate::escrow::{Escrow, EscrowError, EscrowId};

/// Lockable storage cell for a single escrow.
pub(crate) type Slot = Arc<Mutex<Escrow>>;

/// In-memory escrow store with an atomic id sequence.
#[derive(Debug, Default)]
pub struct EscrowRegistry {
    next_id: AtomicU64,
    slots: DashMap<EscrowId, Slot>,
}

impl EscrowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a registry from previously stored records.
    ///
    /// The records must carry exactly the ids `0..records.len()` (in any
    /// order); the sequence resumes right after the highest one. A record
    /// whose timeout exceeds [`MAX_TIMEOUT`] or whose deadlines fall outside
    /// the representable date range is rejected.
    pub fn from_records(records: Vec<Escrow>) -> Result<Self, EscrowError> {
        let registry = Self::new();
        let count = records.len() as u64;

        for record in records {
            let id = record.id();
            if record.timeout_secs() > MAX_TIMEOUT.as_secs() {
                return Err(EscrowError::invalid_argument(format!(
                    "snapshot escrow {} has timeout {}s above the maximum of {}s",
                    id,
                    record.timeout_secs(),
                    MAX_TIMEOUT.as_secs()
                )));
            }
            record.refund_deadline()?;
            record.dispute_deadline()?;
            if id >= count {
                return Err(EscrowError::invalid_argument(format!(
                    "snapshot contains escrow {} but only {} records",
                    id, count
                )));
            }
            if registry.slots.insert(id, Arc::new(Mutex::new(record))).is_some() {
                return Err(EscrowError::invalid_argument(format!(
                    "snapshot contains escrow {} twice",
                    id
                )));
            }
        }

        registry.next_id.store(count, Ordering::SeqCst);
        Ok(registry)
    }

    /// Reserves a fresh identifier. Never returns the same id twice.
    pub fn allocate(&self) -> EscrowId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Number of identifiers ever allocated. Includes ids whose record has
    /// not been `put` yet, which still read as `NotFound`.
    pub fn count(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    /// Returns a copy of the record stored under `id`.
    pub fn get(&self, id: EscrowId) -> Result<Escrow, EscrowError> {
        let slot = self.slot(id)?;
        let record = slot.lock().clone();
        Ok(record)
    }

    /// Stores `record` under `id`, replacing any previous record.
    pub fn put(&self, id: EscrowId, record: Escrow) -> Result<(), EscrowError> {
        if id >= self.count() {
            return Err(EscrowError::NotFound(id));
        }
        if record.id() != id {
            return Err(EscrowError::invalid_argument(format!(
                "record for escrow {} stored under id {}",
                record.id(),
                id
            )));
        }

        let slot = self
            .slots
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(record.clone())))
            .value()
            .clone();
        *slot.lock() = record;
        Ok(())
    }

    /// All populated records, ordered by id.
    pub fn records(&self) -> Vec<Escrow> {
        let slots: Vec<Slot> = self.slots.iter().map(|e| e.value().clone()).collect();
        let mut records: Vec<Escrow> = slots.iter().map(|s| s.lock().clone()).collect();
        records.sort_by_key(|r| r.id());
        records
    }

    /// The lockable slot for `id`.
    ///
    /// The `DashMap` shard guard is released before returning, so callers
    /// can hold the escrow lock for as long as they need without blocking
    /// unrelated ids.
    pub(crate) fn slot(&self, id: EscrowId) -> Result<Slot, EscrowError> {
        if id >= self.count() {
            return Err(EscrowError::NotFound(id));
        }
        self.slots
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(EscrowError::NotFound(id))
    }
}
