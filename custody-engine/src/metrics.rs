//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `custody_investments_opened_total` / `custody_investments_closed_total`
//! - `custody_yield_settlements_total`
//! - `custody_referral_payouts_total`
//! - `custody_deposits_credited_total`
//! - `custody_fee_forward_failures_total`
//! - `custody_withdrawals_settled_total` / `custody_withdrawals_failed_total`
//! - `custody_degraded_audit_writes_total` - operations lost after money moved
//! - `custody_external_call_duration_seconds` - chain transport latency

use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Investments opened
    pub investments_opened: IntCounter,

    /// Investments closed
    pub investments_closed: IntCounter,

    /// Yield settlements that credited a profit
    pub yield_settlements: IntCounter,

    /// Referral hops credited
    pub referral_payouts: IntCounter,

    /// Deposits confirmed and credited
    pub deposits_credited: IntCounter,

    /// Fee forwards that failed
    pub fee_forward_failures: IntCounter,

    /// Withdrawals settled
    pub withdrawals_settled: IntCounter,

    /// Withdrawals whose transfer failed
    pub withdrawals_failed: IntCounter,

    /// Audit writes dropped after a committed money movement
    pub degraded_audit_writes: IntCounter,

    /// Chain transport call latency
    pub external_call_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let investments_opened =
            counter("custody_investments_opened_total", "Investments opened")?;
        let investments_closed =
            counter("custody_investments_closed_total", "Investments closed")?;
        let yield_settlements = counter(
            "custody_yield_settlements_total",
            "Yield settlements that credited a profit",
        )?;
        let referral_payouts =
            counter("custody_referral_payouts_total", "Referral hops credited")?;
        let deposits_credited =
            counter("custody_deposits_credited_total", "Deposits confirmed and credited")?;
        let fee_forward_failures = counter(
            "custody_fee_forward_failures_total",
            "Platform fee forwards that failed",
        )?;
        let withdrawals_settled =
            counter("custody_withdrawals_settled_total", "Withdrawals settled")?;
        let withdrawals_failed = counter(
            "custody_withdrawals_failed_total",
            "Withdrawals whose transfer failed",
        )?;
        let degraded_audit_writes = counter(
            "custody_degraded_audit_writes_total",
            "Operations not recorded after a committed money movement",
        )?;

        let external_call_duration = Histogram::with_opts(
            HistogramOpts::new(
                "custody_external_call_duration_seconds",
                "Chain transport call latency",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;
        registry.register(Box::new(external_call_duration.clone()))?;

        Ok(Self {
            investments_opened,
            investments_closed,
            yield_settlements,
            referral_payouts,
            deposits_credited,
            fee_forward_failures,
            withdrawals_settled,
            withdrawals_failed,
            degraded_audit_writes,
            external_call_duration,
            registry,
        })
    }

    /// Record chain call latency
    pub fn record_external_call(&self, duration_seconds: f64) {
        self.external_call_duration.observe(duration_seconds);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.investments_opened.get(), 0);
        assert_eq!(metrics.degraded_audit_writes.get(), 0);
    }

    #[test]
    fn test_independent_registries() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.deposits_credited.inc();
        assert_eq!(a.deposits_credited.get(), 1);
        assert_eq!(b.deposits_credited.get(), 0);
        assert!(!a.registry().gather().is_empty());
    }
}
