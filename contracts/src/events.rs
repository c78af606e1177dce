//! # Escrow Notifications
//!
//! Every committed transition emits one or more [`EscrowEvent`]s for
//! external observers (audit log, UI, metrics). Emission is fire-and-forget:
//! [`EventSink::emit`] cannot fail and a slow or absent observer never holds
//! up or rolls back a transition.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::escrow::{Amount, EscrowId, PartyId};

/// A structured notification about a committed escrow transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EscrowEvent {
    /// A new escrow record was stored.
    EscrowCreated {
        id: EscrowId,
        buyer: PartyId,
        seller: PartyId,
        amount: Amount,
        timeout_secs: u64,
    },
    /// The buyer's deposit is held by the escrow. Emitted with creation.
    PaymentDeposited {
        id: EscrowId,
        buyer: PartyId,
        amount: Amount,
    },
    /// The buyer confirmed delivery.
    DeliveryConfirmed { id: EscrowId, buyer: PartyId },
    /// Held funds were paid to the seller.
    PaymentReleased {
        id: EscrowId,
        seller: PartyId,
        amount: Amount,
    },
    /// Held funds were returned to the buyer.
    EscrowRefunded {
        id: EscrowId,
        buyer: PartyId,
        amount: Amount,
    },
    /// The buyer asked for a refund before the timeout.
    DisputeRaised { id: EscrowId, raised_by: PartyId },
}

impl EscrowEvent {
    /// The escrow this event refers to.
    pub fn escrow_id(&self) -> EscrowId {
        match self {
            Self::EscrowCreated { id, .. }
            | Self::PaymentDeposited { id, .. }
            | Self::DeliveryConfirmed { id, .. }
            | Self::PaymentReleased { id, .. }
            | Self::EscrowRefunded { id, .. }
            | Self::DisputeRaised { id, .. } => *id,
        }
    }

    /// Stable snake_case name, identical to the serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EscrowCreated { .. } => "escrow_created",
            Self::PaymentDeposited { .. } => "payment_deposited",
            Self::DeliveryConfirmed { .. } => "delivery_confirmed",
            Self::PaymentReleased { .. } => "payment_released",
            Self::EscrowRefunded { .. } => "escrow_refunded",
            Self::DisputeRaised { .. } => "dispute_raised",
        }
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Receives escrow events.
pub trait EventSink: Send + Sync {
    /// Delivers an event. Must not block for long and must not panic.
    fn emit(&self, event: &EscrowEvent);
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn emit(&self, event: &EscrowEvent) {
        (**self).emit(event)
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: &EscrowEvent) {}
}

/// Writes each event as a structured `info` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &EscrowEvent) {
        match serde_json::to_string(event) {
            Ok(payload) => tracing::info!(
                target: "covenant::events",
                escrow_id = event.escrow_id(),
                kind = event.kind(),
                %payload,
                "escrow event"
            ),
            Err(e) => tracing::warn!(
                target: "covenant::events",
                escrow_id = event.escrow_id(),
                kind = event.kind(),
                "failed to serialize escrow event: {}",
                e
            ),
        }
    }
}

/// Keeps every event in memory, in emission order.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<EscrowEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything emitted so far.
    pub fn events(&self) -> Vec<EscrowEvent> {
        self.events.lock().clone()
    }

    /// Events for a single escrow, in emission order.
    pub fn events_for(&self, id: EscrowId) -> Vec<EscrowEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.escrow_id() == id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &EscrowEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Forwards every event to each inner sink in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sink to the fan-out list.
    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &EscrowEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
