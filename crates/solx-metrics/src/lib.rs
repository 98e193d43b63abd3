use std::env;
use std::sync::OnceLock;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};

static INSTALLED: OnceLock<bool> = OnceLock::new();

/// Installs the process-wide Prometheus recorder and scrape endpoint on
/// `0.0.0.0:<port>`. The port comes from the named environment variable,
/// falling back to `default_port`.
///
/// Batch hosts frequently run several jobs side by side, so a failed bind
/// only logs a warning and the run proceeds without an exporter. Must be
/// called from within a Tokio runtime. Returns whether the exporter is up.
pub fn init_metrics(port_env: &str, default_port: u16) -> bool {
    *INSTALLED.get_or_init(|| {
        let port = env::var(port_env)
            .ok()
            .and_then(|raw| raw.parse::<u16>().ok())
            .unwrap_or(default_port);

        match PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], port))
            .install()
        {
            Ok(()) => {
                info!(metrics_port = port, "prometheus exporter listening");
                true
            }
            Err(err) => {
                warn!(error = %err, metrics_port = port, "failed to start prometheus exporter");
                false
            }
        }
    })
}
