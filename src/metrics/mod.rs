//! Metrics for the ingestion pipeline, one submodule per phase.
//!
//! Counters are always recorded through the `metrics` facade; the Prometheus
//! exporter is only installed when `METRICS_ADDR` is set.

pub mod enrich;
pub mod load;
pub mod scrape;

pub use enrich::EnrichMetrics;
pub use load::LoadMetrics;
pub use scrape::ScrapeMetrics;

use std::net::SocketAddr;
use std::sync::Once;
use tracing::{info, warn};

static INIT: Once = Once::new();

/// Prefix shared by every metric name, e.g. `channel_ingest_scrape_messages_total`.
macro_rules! phase_metric {
    ($phase:literal, $name:literal) => {
        concat!("channel_ingest_", $phase, "_", $name)
    };
}
pub(crate) use phase_metric;

/// Install the Prometheus exporter if `METRICS_ADDR` is configured. Idempotent.
pub fn init_metrics() {
    INIT.call_once(|| {
        let Ok(addr_str) = std::env::var("METRICS_ADDR") else {
            return;
        };
        let addr: SocketAddr = match addr_str.parse() {
            Ok(a) => a,
            Err(e) => {
                warn!("Invalid METRICS_ADDR '{}': {}", addr_str, e);
                return;
            }
        };
        match metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
        {
            Ok(()) => {
                ScrapeMetrics::register();
                LoadMetrics::register();
                EnrichMetrics::register();
                info!("Prometheus exporter listening on http://{}/metrics", addr);
            }
            Err(e) => warn!("Prometheus exporter install failed: {}", e),
        }
    });
}
