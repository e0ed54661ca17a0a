use prometheus::{CounterVec, Opts, Registry};
use std::sync::Arc;

/// Global metrics for Spacegate
pub struct Metrics {
    pub registry: Registry,

    /// Sweep items by result: refreshed / skipped / failed
    pub sweep_outcomes_total: CounterVec,

    /// Inbound webhook events by action and final status
    pub webhook_events_total: CounterVec,

    /// Gatekeeper decisions by reason code
    pub gatekeeper_decisions_total: CounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let sweep_outcomes_total = CounterVec::new(
            Opts::new(
                "spacegate_sweep_outcomes_total",
                "Credential refresh sweep items by result",
            ),
            &["result"],
        )?;

        let webhook_events_total = CounterVec::new(
            Opts::new(
                "spacegate_webhook_events_total",
                "Inbound auth email webhook events",
            ),
            &["action", "status"],
        )?;

        let gatekeeper_decisions_total = CounterVec::new(
            Opts::new(
                "spacegate_gatekeeper_decisions_total",
                "Gatekeeper evaluations by reason code",
            ),
            &["reason"],
        )?;

        registry.register(Box::new(sweep_outcomes_total.clone()))?;
        registry.register(Box::new(webhook_events_total.clone()))?;
        registry.register(Box::new(gatekeeper_decisions_total.clone()))?;

        Ok(Self {
            registry,
            sweep_outcomes_total,
            webhook_events_total,
            gatekeeper_decisions_total,
        })
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("metric registration cannot fail with static names")
    }
}

pub static METRICS: once_cell::sync::Lazy<Arc<Metrics>> =
    once_cell::sync::Lazy::new(|| Arc::new(Metrics::default()));
