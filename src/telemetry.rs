//! Prometheus recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Sessions that left `Idle` (counter).
pub const SESSIONS_STARTED_TOTAL: &str = "recon_sessions_started_total";
/// Sessions that reached a terminal state (counter, labels: outcome).
pub const SESSIONS_FINISHED_TOTAL: &str = "recon_sessions_finished_total";
/// Model invocations including retries (counter).
pub const MODEL_CALLS_TOTAL: &str = "recon_model_calls_total";
/// Tool executions (counter, labels: tool, ok).
pub const TOOL_CALLS_TOTAL: &str = "recon_tool_calls_total";
/// Observer connections opened (counter).
pub const CONNECTIONS_TOTAL: &str = "recon_ws_connections_total";

/// Install the process-wide recorder. Call once, before serving.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus recorder installed");
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_are_prefixed_snake_case() {
        for name in [SESSIONS_STARTED_TOTAL, SESSIONS_FINISHED_TOTAL, MODEL_CALLS_TOTAL, TOOL_CALLS_TOTAL, CONNECTIONS_TOTAL] {
            assert!(name.starts_with("recon_"));
            assert!(name.chars().all(|c| c.is_ascii_lowercase() || c == '_'), "{name}");
        }
    }

    #[test]
    fn local_recorder_renders() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!(TOOL_CALLS_TOTAL, "tool" => "crop_image", "ok" => "true").increment(2);
        });
        let out = handle.render();
        assert!(out.contains("recon_tool_calls_total"));
        assert!(out.contains("tool=\"crop_image\""));
    }

    #[test]
    fn installed_recorder_sees_global_counters() {
        let handle = install_recorder().unwrap();
        metrics::counter!(CONNECTIONS_TOTAL).increment(1);
        metrics::counter!(TOOL_CALLS_TOTAL, "tool" => "web_search", "ok" => "false").increment(2);
        let out = handle.render();
        assert!(out.contains("recon_ws_connections_total"), "{out}");
        assert!(out.contains("tool=\"web_search\""), "{out}");
    }
}
