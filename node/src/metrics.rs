//! # Prometheus Metrics
//!
//! Escrow counters and latencies, scraped by Prometheus at `/metrics` on the
//! configured metrics address.
//!
//! All metrics are registered in a dedicated [`prometheus::Registry`] with the
//! `covenant` prefix so they do not collide with any default global registry
//! consumers.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use covenant_contracts::{Amount, EscrowEvent};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Holds all Prometheus metric handles for the node.
///
/// Prometheus handles are reference counted internally, so clones share the
/// same underlying series.
#[derive(Clone)]
pub struct EscrowMetrics {
    /// Prometheus registry that owns all metrics below.
    registry: Registry,
    /// Escrows opened.
    pub escrows_created_total: IntCounter,
    /// Escrows that paid the seller, by confirmation or dispute resolution.
    pub escrows_completed_total: IntCounter,
    /// Escrows that returned the deposit to the buyer.
    pub escrows_refunded_total: IntCounter,
    /// Refund requests that turned into disputes.
    pub disputes_raised_total: IntCounter,
    /// Rejected operations, labelled by error kind.
    pub operations_rejected_total: IntCounterVec,
    /// Sum of balances currently held in escrow.
    pub funds_held: IntGauge,
    /// Engine call latency, labelled by operation.
    pub operation_latency_seconds: HistogramVec,
}

impl EscrowMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("covenant".into()), None)?;

        let escrows_created_total =
            IntCounter::new("escrows_created_total", "Total number of escrows created")?;
        registry.register(Box::new(escrows_created_total.clone()))?;

        let escrows_completed_total = IntCounter::new(
            "escrows_completed_total",
            "Total number of escrows settled in favor of the seller",
        )?;
        registry.register(Box::new(escrows_completed_total.clone()))?;

        let escrows_refunded_total = IntCounter::new(
            "escrows_refunded_total",
            "Total number of escrows refunded to the buyer",
        )?;
        registry.register(Box::new(escrows_refunded_total.clone()))?;

        let disputes_raised_total =
            IntCounter::new("disputes_raised_total", "Total number of disputes raised")?;
        registry.register(Box::new(disputes_raised_total.clone()))?;

        let operations_rejected_total = IntCounterVec::new(
            Opts::new(
                "operations_rejected_total",
                "Total number of rejected escrow operations",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(operations_rejected_total.clone()))?;

        let funds_held = IntGauge::new("funds_held", "Balance currently held across all escrows")?;
        registry.register(Box::new(funds_held.clone()))?;

        let operation_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "operation_latency_seconds",
                "Escrow operation latency in seconds",
            )
            .buckets(vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
            ]),
            &["operation"],
        )?;
        registry.register(Box::new(operation_latency_seconds.clone()))?;

        Ok(Self {
            registry,
            escrows_created_total,
            escrows_completed_total,
            escrows_refunded_total,
            disputes_raised_total,
            operations_rejected_total,
            funds_held,
            operation_latency_seconds,
        })
    }

    /// Updates the counters and the held-funds gauge for one event.
    pub fn observe_event(&self, event: &EscrowEvent) {
        match event {
            EscrowEvent::EscrowCreated { amount, .. } => {
                self.escrows_created_total.inc();
                self.funds_held.add(gauge_value(*amount));
            }
            EscrowEvent::PaymentReleased { amount, .. } => {
                self.escrows_completed_total.inc();
                self.funds_held.sub(gauge_value(*amount));
            }
            EscrowEvent::EscrowRefunded { amount, .. } => {
                self.escrows_refunded_total.inc();
                self.funds_held.sub(gauge_value(*amount));
            }
            EscrowEvent::DisputeRaised { .. } => self.disputes_raised_total.inc(),
            EscrowEvent::PaymentDeposited { .. } | EscrowEvent::DeliveryConfirmed { .. } => {}
        }
    }

    pub fn observe_rejection(&self, kind: &str) {
        self.operations_rejected_total
            .with_label_values(&[kind])
            .inc();
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn gauge_value(amount: Amount) -> i64 {
    i64::try_from(amount).unwrap_or(i64::MAX)
}

/// Shared metrics state passed to axum handlers.
pub type SharedMetrics = Arc<EscrowMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
///
/// Returns HTTP 500 if encoding fails.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
