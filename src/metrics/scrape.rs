//! Scrape phase metrics

use crate::metrics::phase_metric;

pub struct ScrapeMetrics;

impl ScrapeMetrics {
    pub fn record_batch(channel: &str, written: usize, invalid: usize) {
        ::metrics::counter!(phase_metric!("scrape", "messages_total"), "channel" => channel.to_string())
            .increment(written as u64);
        if invalid > 0 {
            ::metrics::counter!(phase_metric!("scrape", "invalid_total"), "channel" => channel.to_string())
                .increment(invalid as u64);
        }
    }

    pub fn record_media_failure(channel: &str) {
        ::metrics::counter!(phase_metric!("scrape", "media_failures_total"), "channel" => channel.to_string())
            .increment(1);
    }

    pub fn record_channel_failure(channel: &str) {
        ::metrics::counter!(phase_metric!("scrape", "channel_failures_total"), "channel" => channel.to_string())
            .increment(1);
    }

    pub fn record_cursor(channel: &str, cursor: i64) {
        ::metrics::gauge!(phase_metric!("scrape", "checkpoint_cursor"), "channel" => channel.to_string())
            .set(cursor as f64);
    }

    pub(crate) fn register() {
        let _ = ::metrics::counter!(phase_metric!("scrape", "messages_total"));
        let _ = ::metrics::counter!(phase_metric!("scrape", "invalid_total"));
        let _ = ::metrics::counter!(phase_metric!("scrape", "media_failures_total"));
        let _ = ::metrics::counter!(phase_metric!("scrape", "channel_failures_total"));
    }
}
