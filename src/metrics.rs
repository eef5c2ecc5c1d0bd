use anyhow::{anyhow, Result};
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

#[derive(Clone)]
pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder (once per process) and describe the
    /// soundbox series. Later calls reuse the same recorder.
    pub fn init() -> Result<Self> {
        let handle = HANDLE.get_or_try_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| anyhow!("prometheus: install recorder: {e}"))?;
            describe_all();
            Ok::<_, anyhow::Error>(handle)
        })?;
        Ok(Self {
            handle: handle.clone(),
        })
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router<S: Clone + Send + Sync + 'static>(&self) -> Router<S> {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}

fn describe_all() {
    describe_counter!(
        "notifications_received_total",
        "Inbound notifications handed to the pipeline."
    );
    describe_counter!(
        "notifications_matched_total",
        "Notifications that produced an amount."
    );
    describe_counter!("transactions_recorded_total", "New local transaction rows.");
    describe_counter!(
        "transactions_duplicate_total",
        "Repeated deliveries absorbed by the dedup key."
    );
    describe_counter!("trial_consumed_total", "Trial units spent.");
    describe_counter!(
        "speech_suppressed_total",
        "Alerts not spoken because entitlement was exhausted."
    );
    describe_counter!("rules_sync_total", "Rule refresh attempts.");
    describe_counter!("rules_sync_errors_total", "Rule refresh failures.");
    describe_gauge!("rules_last_sync_ts", "Unix ts of the last successful rule refresh.");
    describe_counter!("ledger_push_errors_total", "Failed remote ledger pushes.");
    describe_counter!("locked_swept_total", "Locked transactions removed by retention.");
    describe_counter!("entitlement_expired_total", "Premium periods that ran out.");
}
