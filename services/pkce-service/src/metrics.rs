//! Prometheus metrics exposition
//!
//! - `pkce_registrations_total` (counter): label `outcome`
//! - `pkce_redemptions_total` (counter): label `outcome`
//! - `pkce_redemption_duration_seconds` (histogram): label `outcome`
//! - `pkce_refreshes_total` (counter): label `outcome`
//! - `pkce_stored_challenges` (gauge): records held by the registry, pending
//!   or mid-redemption, including expired ones the sweep has not removed yet
//!
//! `outcome` is `ok` or the error code from the API error body.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Redemption latency buckets, 5ms to 30s. The upper end covers the
/// largest sensible gateway timeout.
const REDEMPTION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("pkce_redemption_duration_seconds".to_string()),
        REDEMPTION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// The redemption histogram gets explicit buckets so it renders `_bucket`
/// lines instead of a summary.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

pub fn record_registration(outcome: &str) {
    metrics::counter!("pkce_registrations_total", "outcome" => outcome.to_string()).increment(1);
}

pub fn record_redemption(outcome: &str, duration_secs: f64) {
    metrics::counter!("pkce_redemptions_total", "outcome" => outcome.to_string()).increment(1);
    metrics::histogram!("pkce_redemption_duration_seconds", "outcome" => outcome.to_string())
        .record(duration_secs);
}

pub fn record_refresh(outcome: &str) {
    metrics::counter!("pkce_refreshes_total", "outcome" => outcome.to_string()).increment(1);
}

pub fn set_stored_challenges(count: usize) {
    metrics::gauge!("pkce_stored_challenges").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    /// Isolated recorder/handle pair; only one global recorder may exist per process.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = builder().unwrap().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_registration("ok");
        record_redemption("ok", 0.01);
        record_refresh("ok");
        set_stored_challenges(3);
    }

    #[test]
    fn redemption_records_counter_and_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_redemption("ok", 0.042);
        record_redemption("verification_failed", 0.003);

        let output = handle.render();
        assert!(output.contains("pkce_redemptions_total"));
        assert!(output.contains("outcome=\"ok\""));
        assert!(output.contains("outcome=\"verification_failed\""));
        assert!(
            output.contains("pkce_redemption_duration_seconds_bucket"),
            "histogram must render _bucket lines"
        );
        assert!(output.contains("le=\"0.005\""));
        assert!(output.contains("le=\"30\""));
    }

    #[test]
    fn registration_refresh_and_gauge_render() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_registration("ok");
        record_registration("invalid_request");
        record_refresh("token_generation_failed");
        set_stored_challenges(7);

        let output = handle.render();
        assert!(output.contains("pkce_registrations_total{outcome=\"invalid_request\"} 1"));
        assert!(output.contains("pkce_refreshes_total{outcome=\"token_generation_failed\"} 1"));
        assert!(output.contains("pkce_stored_challenges 7"));
    }
}
