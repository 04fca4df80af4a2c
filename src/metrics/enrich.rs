//! Enrichment phase metrics

use crate::metrics::phase_metric;

pub struct EnrichMetrics;

impl EnrichMetrics {
    pub fn record_success(detections: usize, duration_secs: f64) {
        ::metrics::counter!(phase_metric!("enrich", "messages_total")).increment(1);
        ::metrics::counter!(phase_metric!("enrich", "detections_total")).increment(detections as u64);
        ::metrics::histogram!(phase_metric!("enrich", "detect_duration_seconds")).record(duration_secs);
    }

    pub fn record_failure() {
        ::metrics::counter!(phase_metric!("enrich", "failures_total")).increment(1);
    }

    pub(crate) fn register() {
        let _ = ::metrics::counter!(phase_metric!("enrich", "messages_total"));
        let _ = ::metrics::counter!(phase_metric!("enrich", "detections_total"));
        let _ = ::metrics::counter!(phase_metric!("enrich", "failures_total"));
        let _ = ::metrics::histogram!(phase_metric!("enrich", "detect_duration_seconds"));
    }
}
