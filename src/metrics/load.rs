//! Load phase metrics

use crate::metrics::phase_metric;

pub struct LoadMetrics;

impl LoadMetrics {
    pub fn record_partition(inserted: usize, updated: usize, skipped_duplicate: usize, skipped_invalid: usize) {
        ::metrics::counter!(phase_metric!("load", "partitions_total")).increment(1);
        ::metrics::counter!(phase_metric!("load", "rows_inserted_total")).increment(inserted as u64);
        ::metrics::counter!(phase_metric!("load", "rows_updated_total")).increment(updated as u64);
        ::metrics::counter!(phase_metric!("load", "rows_duplicate_total")).increment(skipped_duplicate as u64);
        ::metrics::counter!(phase_metric!("load", "rows_invalid_total")).increment(skipped_invalid as u64);
    }

    pub fn record_partition_failure() {
        ::metrics::counter!(phase_metric!("load", "partition_failures_total")).increment(1);
    }

    pub(crate) fn register() {
        let _ = ::metrics::counter!(phase_metric!("load", "partitions_total"));
        let _ = ::metrics::counter!(phase_metric!("load", "rows_inserted_total"));
        let _ = ::metrics::counter!(phase_metric!("load", "rows_updated_total"));
        let _ = ::metrics::counter!(phase_metric!("load", "rows_duplicate_total"));
        let _ = ::metrics::counter!(phase_metric!("load", "rows_invalid_total"));
        let _ = ::metrics::counter!(phase_metric!("load", "partition_failures_total"));
    }
}
