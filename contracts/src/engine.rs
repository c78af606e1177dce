//! # Escrow State Machine
//!
//! [`EscrowEngine`] is the only component that mutates escrow records. Each
//! operation:
//!
//! 1. takes the escrow's slot lock from the [`EscrowRegistry`],
//! 2. checks, in order, caller → state → time gate,
//! 3. applies the transition to a *staged* copy of the record,
//! 4. calls the [`AssetTransfer`] collaborator when funds move,
//! 5. commits the staged copy only if the transfer succeeded,
//! 6. emits events after releasing the lock.
//!
//! The slot lock is held from step 1 to step 5, so two calls on the same
//! escrow can never both observe the pre-transfer balance. A failed transfer
//! drops the staged copy and leaves the stored record untouched.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::EscrowConfig;
use crate::escrow::{Amount, Escrow, EscrowError, EscrowId, EscrowState, PartyId};
use crate::events::{EscrowEvent, EventSink};
use crate::registry::EscrowRegistry;
use crate::transfer::AssetTransfer;

/// The escrow state machine and its collaborators.
pub struct EscrowEngine {
    registry: EscrowRegistry,
    config: EscrowConfig,
    clock: Arc<dyn Clock>,
    transfer: Arc<dyn AssetTransfer>,
    events: Arc<dyn EventSink>,
}

impl EscrowEngine {
    /// Creates an engine over an empty registry.
    pub fn new(
        config: EscrowConfig,
        clock: Arc<dyn Clock>,
        transfer: Arc<dyn AssetTransfer>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self::with_registry(EscrowRegistry::new(), config, clock, transfer, events)
    }

    /// Creates an engine over an existing registry (e.g. restored from a
    /// snapshot).
    pub fn with_registry(
        registry: EscrowRegistry,
        config: EscrowConfig,
        clock: Arc<dyn Clock>,
        transfer: Arc<dyn AssetTransfer>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            registry,
            config,
            clock,
            transfer,
            events,
        }
    }

    pub fn config(&self) -> &EscrowConfig {
        &self.config
    }

    pub fn registry(&self) -> &EscrowRegistry {
        &self.registry
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Opens a new escrow funded with `deposited`, with `caller` as buyer.
    ///
    /// The id is only allocated once every argument has been accepted, so a
    /// rejected creation never consumes an identifier.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::InvalidArgument`] if the caller or seller is
    /// null, the seller is the caller, the deposit is zero, the timeout is
    /// outside the configured range or the description is too long.
    /// Timeouts are kept in whole seconds, so one with a fractional part is
    /// rejected as well. The configured range never extends past
    /// [`MIN_TIMEOUT`](crate::config::MIN_TIMEOUT) and
    /// [`MAX_TIMEOUT`](crate::config::MAX_TIMEOUT).
    pub fn create_escrow(
        &self,
        caller: &PartyId,
        seller: PartyId,
        timeout: Duration,
        description: impl Into<String>,
        deposited: Amount,
    ) -> Result<EscrowId, EscrowError> {
        let description = description.into();
        if let Err(e) = self.validate_creation(caller, &seller, timeout, &description, deposited) {
            debug!(buyer = %caller, seller = %seller, "escrow creation rejected: {}", e);
            return Err(e);
        }

        let now = self.clock.now();
        let id = self.registry.allocate();
        let record = Escrow::new(
            id,
            caller.clone(),
            seller.clone(),
            deposited,
            now,
            timeout.as_secs(),
            description,
        );
        self.registry.put(id, record)?;

        info!(
            escrow_id = id,
            buyer = %caller,
            seller = %seller,
            amount = deposited,
            timeout_secs = timeout.as_secs(),
            "escrow created"
        );

        self.emit(&[
            EscrowEvent::EscrowCreated {
                id,
                buyer: caller.clone(),
                seller: seller.clone(),
                amount: deposited,
                timeout_secs: timeout.as_secs(),
            },
            EscrowEvent::PaymentDeposited {
                id,
                buyer: caller.clone(),
                amount: deposited,
            },
        ]);

        Ok(id)
    }

    /// Buyer confirms delivery; the held amount is paid to the seller.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Unauthorized` (caller is not the buyer), `InvalidState`
    /// (not `AwaitingDelivery`), `TransferFailed` (nothing committed).
    pub fn confirm_delivery(&self, caller: &PartyId, id: EscrowId) -> Result<Escrow, EscrowError> {
        let slot = self.registry.slot(id)?;
        let mut stored = slot.lock();

        stored.ensure_buyer(caller).map_err(Self::rejected)?;
        stored
            .ensure_state(EscrowState::AwaitingDelivery)
            .map_err(Self::rejected)?;

        let mut staged = stored.clone();
        let amount = staged.disburse(EscrowState::Complete, self.clock.now());
        staged.approve(caller);

        self.pay(id, staged.seller(), amount)?;
        *stored = staged.clone();
        drop(stored);

        info!(escrow_id = id, seller = %staged.seller(), amount, "delivery confirmed, payment released");
        self.emit(&[
            EscrowEvent::DeliveryConfirmed {
                id,
                buyer: caller.clone(),
            },
            EscrowEvent::PaymentReleased {
                id,
                seller: staged.seller().clone(),
                amount,
            },
        ]);

        Ok(staged)
    }

    /// Buyer asks for the deposit back.
    ///
    /// At or after `created_at + timeout` the buyer is refunded directly and
    /// the escrow ends `Refunded`. Before that, no funds move and the escrow
    /// becomes `Disputed`.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Unauthorized` (caller is not the buyer), `InvalidState`
    /// (not `AwaitingDelivery`), `InvalidArgument` (deadline out of range),
    /// `TransferFailed` (nothing committed).
    pub fn request_refund(&self, caller: &PartyId, id: EscrowId) -> Result<Escrow, EscrowError> {
        let slot = self.registry.slot(id)?;
        let mut stored = slot.lock();

        stored.ensure_buyer(caller).map_err(Self::rejected)?;
        stored
            .ensure_state(EscrowState::AwaitingDelivery)
            .map_err(Self::rejected)?;

        let now = self.clock.now();
        let deadline = stored.refund_deadline().map_err(Self::rejected)?;
        let mut staged = stored.clone();

        if now < deadline {
            staged.raise_dispute(now);
            *stored = staged.clone();
            drop(stored);

            info!(escrow_id = id, buyer = %caller, "refund requested before timeout, dispute raised");
            self.emit(&[EscrowEvent::DisputeRaised {
                id,
                raised_by: caller.clone(),
            }]);
            return Ok(staged);
        }

        let amount = staged.disburse(EscrowState::Refunded, now);
        self.pay(id, staged.buyer(), amount)?;
        *stored = staged.clone();
        drop(stored);

        info!(escrow_id = id, buyer = %caller, amount, "timeout elapsed, buyer refunded");
        self.emit(&[EscrowEvent::EscrowRefunded {
            id,
            buyer: caller.clone(),
            amount,
        }]);

        Ok(staged)
    }

    /// Settles a disputed escrow once the dispute window has passed.
    ///
    /// Either party may call it. `favor_buyer` refunds the buyer
    /// (`Refunded`); otherwise the seller is paid (`Complete`).
    ///
    /// # Errors
    ///
    /// `NotFound`, `Unauthorized` (caller is neither party), `InvalidState`
    /// (not `Disputed`), `TimeoutNotElapsed` (window still open),
    /// `InvalidArgument` (deadline out of range), `TransferFailed` (nothing
    /// committed).
    pub fn resolve_dispute(
        &self,
        caller: &PartyId,
        id: EscrowId,
        favor_buyer: bool,
    ) -> Result<Escrow, EscrowError> {
        let slot = self.registry.slot(id)?;
        let mut stored = slot.lock();

        stored.ensure_participant(caller).map_err(Self::rejected)?;
        stored
            .ensure_state(EscrowState::Disputed)
            .map_err(Self::rejected)?;

        let now = self.clock.now();
        let not_before = stored.dispute_deadline().map_err(Self::rejected)?;
        if now < not_before {
            return Err(Self::rejected(EscrowError::TimeoutNotElapsed {
                id,
                not_before,
            }));
        }

        let mut staged = stored.clone();
        let (terminal, recipient) = if favor_buyer {
            (EscrowState::Refunded, staged.buyer().clone())
        } else {
            (EscrowState::Complete, staged.seller().clone())
        };
        let amount = staged.disburse(terminal, now);
        staged.approve(caller);

        self.pay(id, &recipient, amount)?;
        *stored = staged.clone();
        drop(stored);

        info!(
            escrow_id = id,
            resolved_by = %caller,
            favor_buyer,
            recipient = %recipient,
            amount,
            "dispute resolved"
        );
        let event = if favor_buyer {
            EscrowEvent::EscrowRefunded {
                id,
                buyer: recipient,
                amount,
            }
        } else {
            EscrowEvent::PaymentReleased {
                id,
                seller: recipient,
                amount,
            }
        };
        self.emit(&[event]);

        Ok(staged)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Full record of a single escrow.
    pub fn escrow(&self, id: EscrowId) -> Result<Escrow, EscrowError> {
        self.registry.get(id)
    }

    /// Current state of a single escrow.
    pub fn state(&self, id: EscrowId) -> Result<EscrowState, EscrowError> {
        self.registry.get(id).map(|e| e.state())
    }

    /// Number of escrow ids handed out so far.
    ///
    /// A creation in flight already counts once its id is allocated, while
    /// [`escrow`](Self::escrow) still reports `NotFound` for that id until
    /// the record is stored.
    pub fn escrow_count(&self) -> u64 {
        self.registry.count()
    }

    /// Every escrow where `party` is buyer or seller, ordered by id.
    pub fn escrows_for(&self, party: &PartyId) -> Vec<Escrow> {
        self.registry
            .records()
            .into_iter()
            .filter(|e| e.is_participant(party))
            .collect()
    }

    /// Total balance still held across all escrows.
    pub fn funds_held(&self) -> Amount {
        self.registry
            .records()
            .iter()
            .fold(0u64, |acc, e| acc.saturating_add(e.amount()))
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn validate_creation(
        &self,
        caller: &PartyId,
        seller: &PartyId,
        timeout: Duration,
        description: &str,
        deposited: Amount,
    ) -> Result<(), EscrowError> {
        if caller.is_null() {
            return Err(EscrowError::invalid_argument("buyer identity is null"));
        }
        if seller.is_null() {
            return Err(EscrowError::invalid_argument("seller identity is null"));
        }
        if seller == caller {
            return Err(EscrowError::invalid_argument(
                "seller must differ from buyer",
            ));
        }
        if deposited == 0 {
            return Err(EscrowError::invalid_argument(
                "deposit must be greater than 0",
            ));
        }
        if timeout.subsec_nanos() != 0 {
            return Err(EscrowError::invalid_argument(
                "timeout must be a whole number of seconds",
            ));
        }
        let (min, max) = (self.config.min_timeout(), self.config.max_timeout());
        if timeout < min {
            return Err(EscrowError::invalid_argument(format!(
                "timeout {}s is below the minimum of {}s",
                timeout.as_secs(),
                min.as_secs()
            )));
        }
        if timeout > max {
            return Err(EscrowError::invalid_argument(format!(
                "timeout {}s exceeds the maximum of {}s",
                timeout.as_secs(),
                max.as_secs()
            )));
        }
        if description.len() > self.config.max_description_len {
            return Err(EscrowError::invalid_argument(format!(
                "description is {} bytes, limit is {}",
                description.len(),
                self.config.max_description_len
            )));
        }
        Ok(())
    }

    /// Calls the transfer collaborator, mapping failure to `TransferFailed`.
    fn pay(&self, id: EscrowId, to: &PartyId, amount: Amount) -> Result<(), EscrowError> {
        self.transfer.transfer(to, amount).map_err(|source| {
            warn!(escrow_id = id, recipient = %to, amount, "transfer failed: {}", source);
            EscrowError::TransferFailed { id, source }
        })
    }

    fn emit(&self, events: &[EscrowEvent]) {
        for event in events {
            self.events.emit(event);
        }
    }

    fn rejected(err: EscrowError) -> EscrowError {
        debug!(kind = err.kind(), "escrow operation rejected: {}", err);
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::MAX_TIMEOUT;
    use crate::events::MemorySink;
    use crate::transfer::TransferError;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingTransfer {
        calls: Mutex<Vec<(PartyId, Amount)>>,
        fail: Mutex<bool>,
    }

    impl AssetTransfer for RecordingTransfer {
        fn transfer(&self, to: &PartyId, amount: Amount) -> Result<(), TransferError> {
            if *self.fail.lock() {
                return Err(TransferError::Unavailable("rail offline".into()));
            }
            self.calls.lock().push((to.clone(), amount));
            Ok(())
        }
    }

    struct Harness {
        engine: EscrowEngine,
        clock: Arc<ManualClock>,
        transfer: Arc<RecordingTransfer>,
        events: Arc<MemorySink>,
    }

    fn harness() -> Harness {
        harness_with(EscrowConfig::default())
    }

    fn harness_with(config: EscrowConfig) -> Harness {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap(),
        ));
        let transfer = Arc::new(RecordingTransfer::default());
        let events = Arc::new(MemorySink::new());
        let engine = EscrowEngine::new(config, clock.clone(), transfer.clone(), events.clone());
        Harness {
            engine,
            clock,
            transfer,
            events,
        }
    }

    const HOUR: Duration = Duration::from_secs(3600);

    fn buyer() -> PartyId {
        "buyer".into()
    }

    fn seller() -> PartyId {
        "seller".into()
    }

    #[test]
    fn create_emits_created_and_deposited() {
        let h = harness();
        let id = h
            .engine
            .create_escrow(&buyer(), seller(), HOUR, "widget", 100)
            .unwrap();

        assert_eq!(id, 0);
        let kinds: Vec<_> = h.events.events().iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["escrow_created", "payment_deposited"]);
        assert!(h.transfer.calls.lock().is_empty());
    }

    #[test]
    fn rejected_creation_does_not_consume_an_id() {
        let h = harness();
        assert!(h
            .engine
            .create_escrow(&buyer(), buyer(), HOUR, "", 100)
            .is_err());
        assert_eq!(h.engine.escrow_count(), 0);

        let id = h
            .engine
            .create_escrow(&buyer(), seller(), HOUR, "", 100)
            .unwrap();
        assert_eq!(id, 0);
    }

    #[test]
    fn creation_argument_checks() {
        let h = harness();
        let cases: Vec<(PartyId, PartyId, Duration, Amount)> = vec![
            (PartyId::null(), seller(), HOUR, 100),
            (buyer(), PartyId::null(), HOUR, 100),
            (buyer(), buyer(), HOUR, 100),
            (buyer(), seller(), HOUR, 0),
            (buyer(), seller(), HOUR - Duration::from_secs(1), 100),
            (buyer(), seller(), Duration::from_secs(366 * 24 * 3600), 100),
        ];

        for (caller, s, timeout, amount) in cases {
            let result = h.engine.create_escrow(&caller, s, timeout, "", amount);
            assert!(
                matches!(result, Err(EscrowError::InvalidArgument(_))),
                "expected InvalidArgument for {:?}",
                (caller, timeout, amount)
            );
        }
        assert_eq!(h.engine.escrow_count(), 0);
    }

    #[test]
    fn oversized_description_rejected() {
        let h = harness();
        let long = "x".repeat(h.engine.config().max_description_len + 1);
        let result = h.engine.create_escrow(&buyer(), seller(), HOUR, long, 100);
        assert!(matches!(result, Err(EscrowError::InvalidArgument(_))));
    }

    #[test]
    fn sub_second_timeout_rejected() {
        let h = harness();
        let result = h.engine.create_escrow(
            &buyer(),
            seller(),
            HOUR + Duration::from_millis(500),
            "",
            100,
        );
        assert!(matches!(result, Err(EscrowError::InvalidArgument(_))));
        assert_eq!(h.engine.escrow_count(), 0);
    }

    #[test]
    fn lowered_floor_still_enforces_one_hour() {
        let h = harness_with(EscrowConfig {
            min_timeout_secs: 60,
            ..EscrowConfig::default()
        });
        let result = h
            .engine
            .create_escrow(&buyer(), seller(), Duration::from_secs(60), "", 100);
        assert!(matches!(result, Err(EscrowError::InvalidArgument(_))));
        assert!(h
            .engine
            .create_escrow(&buyer(), seller(), HOUR, "", 100)
            .is_ok());
    }

    #[test]
    fn raised_ceiling_still_enforces_protocol_maximum() {
        let h = harness_with(EscrowConfig {
            max_timeout_secs: u64::MAX,
            ..EscrowConfig::default()
        });
        for secs in [u64::MAX / 2, MAX_TIMEOUT.as_secs() + 1] {
            let result =
                h.engine
                    .create_escrow(&buyer(), seller(), Duration::from_secs(secs), "", 100);
            assert!(matches!(result, Err(EscrowError::InvalidArgument(_))));
        }

        let id = h
            .engine
            .create_escrow(&buyer(), seller(), MAX_TIMEOUT, "", 100)
            .unwrap();
        let disputed = h.engine.request_refund(&buyer(), id).unwrap();
        assert_eq!(disputed.state(), EscrowState::Disputed);
    }

    #[test]
    fn confirm_pays_seller_and_records_approval() {
        let h = harness();
        let id = h
            .engine
            .create_escrow(&buyer(), seller(), HOUR, "", 100)
            .unwrap();

        let done = h.engine.confirm_delivery(&buyer(), id).unwrap();

        assert_eq!(done.state(), EscrowState::Complete);
        assert_eq!(done.amount(), 0);
        assert!(done.buyer_approved());
        assert!(!done.seller_approved());
        assert_eq!(*h.transfer.calls.lock(), vec![(seller(), 100)]);
        assert_eq!(h.engine.escrow(id).unwrap(), done);
    }

    #[test]
    fn seller_cannot_confirm() {
        let h = harness();
        let id = h
            .engine
            .create_escrow(&buyer(), seller(), HOUR, "", 100)
            .unwrap();
        assert!(matches!(
            h.engine.confirm_delivery(&seller(), id),
            Err(EscrowError::Unauthorized { .. })
        ));
    }

    #[test]
    fn early_refund_raises_dispute_without_transfer() {
        let h = harness();
        let id = h
            .engine
            .create_escrow(&buyer(), seller(), HOUR, "", 100)
            .unwrap();
        h.clock.advance(chrono::Duration::minutes(59));

        let disputed = h.engine.request_refund(&buyer(), id).unwrap();

        assert_eq!(disputed.state(), EscrowState::Disputed);
        assert_eq!(disputed.amount(), 100);
        assert!(h.transfer.calls.lock().is_empty());
    }

    #[test]
    fn refund_exactly_at_timeout_pays_buyer() {
        let h = harness();
        let id = h
            .engine
            .create_escrow(&buyer(), seller(), HOUR, "", 100)
            .unwrap();
        h.clock.advance(chrono::Duration::hours(1));

        let refunded = h.engine.request_refund(&buyer(), id).unwrap();

        assert_eq!(refunded.state(), EscrowState::Refunded);
        assert_eq!(*h.transfer.calls.lock(), vec![(buyer(), 100)]);
    }

    #[test]
    fn failed_refund_transfer_leaves_record_untouched() {
        let h = harness();
        let id = h
            .engine
            .create_escrow(&buyer(), seller(), HOUR, "", 100)
            .unwrap();
        h.clock.advance(chrono::Duration::hours(2));
        *h.transfer.fail.lock() = true;

        let before = h.engine.escrow(id).unwrap();
        let result = h.engine.request_refund(&buyer(), id);

        assert!(matches!(result, Err(EscrowError::TransferFailed { .. })));
        assert_eq!(h.engine.escrow(id).unwrap(), before);
        assert_eq!(h.events.len(), 2);
    }

    #[test]
    fn resolve_before_window_is_too_early() {
        let h = harness();
        let id = h
            .engine
            .create_escrow(&buyer(), seller(), HOUR, "", 100)
            .unwrap();
        h.engine.request_refund(&buyer(), id).unwrap();
        h.clock
            .advance(chrono::Duration::days(7) - chrono::Duration::seconds(1));

        match h.engine.resolve_dispute(&seller(), id, false) {
            Err(EscrowError::TimeoutNotElapsed { not_before, .. }) => {
                assert_eq!(not_before, h.engine.escrow(id).unwrap().dispute_deadline().unwrap());
            }
            other => panic!("expected TimeoutNotElapsed, got {:?}", other),
        }
    }

    #[test]
    fn seller_resolves_in_own_favor() {
        let h = harness();
        let id = h
            .engine
            .create_escrow(&buyer(), seller(), HOUR, "", 100)
            .unwrap();
        h.engine.request_refund(&buyer(), id).unwrap();
        h.clock.advance(chrono::Duration::days(7));

        let done = h.engine.resolve_dispute(&seller(), id, false).unwrap();

        assert_eq!(done.state(), EscrowState::Complete);
        assert!(done.seller_approved());
        assert_eq!(*h.transfer.calls.lock(), vec![(seller(), 100)]);
        assert_eq!(
            h.events.events().last().map(|e| e.kind()),
            Some("payment_released")
        );
    }

    #[test]
    fn outsider_cannot_resolve() {
        let h = harness();
        let id = h
            .engine
            .create_escrow(&buyer(), seller(), HOUR, "", 100)
            .unwrap();
        h.engine.request_refund(&buyer(), id).unwrap();
        h.clock.advance(chrono::Duration::days(8));

        assert!(matches!(
            h.engine.resolve_dispute(&"mallory".into(), id, true),
            Err(EscrowError::Unauthorized { .. })
        ));
    }

    #[test]
    fn queries_and_listing() {
        let h = harness();
        let a = h
            .engine
            .create_escrow(&buyer(), seller(), HOUR, "", 100)
            .unwrap();
        let b = h
            .engine
            .create_escrow(&seller(), "carol".into(), HOUR, "", 40)
            .unwrap();
        h.engine.confirm_delivery(&buyer(), a).unwrap();

        assert_eq!(h.engine.escrow_count(), 2);
        assert_eq!(h.engine.state(a).unwrap(), EscrowState::Complete);
        assert_eq!(h.engine.state(b).unwrap(), EscrowState::AwaitingDelivery);
        assert!(matches!(h.engine.state(2), Err(EscrowError::NotFound(2))));
        assert_eq!(h.engine.escrows_for(&seller()).len(), 2);
        assert_eq!(h.engine.escrows_for(&"carol".into()).len(), 1);
        assert_eq!(h.engine.funds_held(), 40);
    }
}
