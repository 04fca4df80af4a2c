use crate::types::RawMessageRecord;
use sha2::{Digest, Sha256};

/// Checksum of the fields a re-scrape may legitimately change.
///
/// `scraped_at` is excluded so that re-scraping an unchanged message is a no-op
/// in the warehouse.
pub fn record_checksum(record: &RawMessageRecord) -> String {
    let mut s = String::new();
    s.push_str(&record.channel);
    s.push('|');
    s.push_str(&record.external_id.to_string());
    s.push('|');
    if let Some(t) = &record.text {
        s.push_str(t);
    }
    s.push('|');
    s.push_str(&record.posted_at.to_rfc3339());
    s.push('|');
    if let Some(p) = &record.media_path {
        s.push_str(p);
    }
    s.push('|');
    if let Some(m) = record.media_type {
        s.push_str(m.as_str());
    }
    s.push('|');
    s.push_str(&record.raw_payload.0.to_string());
    sha256_hex(s.as_bytes())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
