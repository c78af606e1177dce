//! Bridges escrow events into the node: Prometheus counters and the
//! broadcast channel behind the `/ws` stream.

use covenant_contracts::{EscrowEvent, EventSink};
use tokio::sync::broadcast;

use crate::metrics::SharedMetrics;

/// Capacity of the event broadcast channel. Slow WebSocket clients that fall
/// further behind than this skip ahead.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub struct NodeEventSink {
    tx: broadcast::Sender<EscrowEvent>,
    metrics: SharedMetrics,
}

impl NodeEventSink {
    pub fn new(tx: broadcast::Sender<EscrowEvent>, metrics: SharedMetrics) -> Self {
        Self { tx, metrics }
    }
}

impl EventSink for NodeEventSink {
    fn emit(&self, event: &EscrowEvent) {
        self.metrics.observe_event(event);
        // No subscribers is not an error.
        let _ = self.tx.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::EscrowMetrics;
    use std::sync::Arc;

    #[test]
    fn forwards_to_subscribers_and_metrics() {
        let metrics = Arc::new(EscrowMetrics::new().unwrap());
        let (tx, mut rx) = broadcast::channel(8);
        let sink = NodeEventSink::new(tx, Arc::clone(&metrics));

        let event = EscrowEvent::DisputeRaised {
            id: 3,
            raised_by: "buyer".into(),
        };
        sink.emit(&event);

        assert_eq!(rx.try_recv().unwrap(), event);
        assert_eq!(metrics.disputes_raised_total.get(), 1);
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let metrics = Arc::new(EscrowMetrics::new().unwrap());
        let (tx, rx) = broadcast::channel(8);
        drop(rx);
        let sink = NodeEventSink::new(tx, metrics);

        sink.emit(&EscrowEvent::DeliveryConfirmed {
            id: 0,
            buyer: "buyer".into(),
        });
    }
}
