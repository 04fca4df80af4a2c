mod common;

use channel_ingest::app::enrich_use_case::EnrichmentWorker;
use channel_ingest::app::load_use_case::LoaderEngine;
use channel_ingest::app::ports::{CheckpointStore, RawStore};
use channel_ingest::app::scrape_use_case::ScraperEngine;
use channel_ingest::error::SourceError;
use channel_ingest::infra::in_memory::{InMemoryCheckpointStore, InMemoryRawStore};
use channel_ingest::types::{Channel, Cursor, RawMessageRecord, RawPayload};
use chrono::{NaiveDate, TimeZone, Utc};
use common::{detection, message, photo_message, FixedDetector, Harness};
use serde_json::json;
use std::fs;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

fn record(id: i64, channel: &str, text: &str) -> RawMessageRecord {
    RawMessageRecord {
        external_id: id,
        channel: channel.into(),
        text: Some(text.into()),
        posted_at: Utc.with_ymd_and_hms(2025, 7, 14, 9, 0, 0).unwrap(),
        media_path: None,
        media_type: None,
        raw_payload: RawPayload(json!({ "id": id })),
        scraped_at: Utc.with_ymd_and_hms(2025, 7, 15, 0, 0, 0).unwrap(),
    }
}

#[tokio::test]
async fn first_scrape_of_a_channel_lands_everything() {
    let h = Harness::new();
    h.source
        .push_messages("clinic_a", vec![message(101), message(102), message(103)]);

    let report = h.scraper().scrape_channel(&Channel::new("clinic_a")).await;
    assert!(report.error.is_none());
    assert_eq!(report.records_written, 3);

    let cp = h.meta.get_checkpoint("clinic_a").await.unwrap().unwrap();
    assert_eq!(cp.cursor, Cursor(103));

    let partitions = h.raw.list_partitions().await.unwrap();
    assert_eq!(partitions.len(), 1);
    let contents = h.raw.read_partition(&partitions[0]).await.unwrap();
    assert_eq!(contents.records.len(), 3);

    let load = h.loader().load_pending(false).await.unwrap();
    assert_eq!(load.partitions[0].inserted, 3);
    assert_eq!(h.warehouse.message_count().unwrap(), 3);
}

#[tokio::test]
async fn rerun_with_nothing_new_changes_nothing() {
    let h = Harness::new();
    h.source
        .push_messages("clinic_a", vec![message(101), message(102), message(103)]);
    h.scraper().scrape_channel(&Channel::new("clinic_a")).await;
    h.loader().load_pending(false).await.unwrap();
    let before = h.warehouse.message_fingerprints().unwrap();

    let report = h.scraper().scrape_channel(&Channel::new("clinic_a")).await;
    assert_eq!(report.records_written, 0);
    assert_eq!(report.checkpoint, Some(Cursor(103)));
    assert_eq!(
        h.meta.get_checkpoint("clinic_a").await.unwrap().unwrap().cursor,
        Cursor(103)
    );

    let load = h.loader().load_pending(false).await.unwrap();
    assert!(load.partitions.is_empty());
    assert_eq!(h.warehouse.message_fingerprints().unwrap(), before);
}

#[tokio::test]
async fn record_without_identifier_is_skipped_not_fatal() {
    let h = Harness::new();
    let key = h
        .raw
        .write_batch(
            NaiveDate::from_ymd_opt(2025, 7, 15).unwrap(),
            "clinic_a",
            &[record(1, "clinic_a", "a"), record(2, "clinic_a", "b")],
        )
        .await
        .unwrap();
    let path = h
        .data_root()
        .join("raw/messages/2025-07-15/clinic_a.ndjson");
    let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
    writeln!(
        f,
        "{}",
        json!({
            "record_version": 1,
            "channel": "clinic_a",
            "posted_at": "2025-07-14T09:00:00Z",
            "scraped_at": "2025-07-15T00:00:00Z",
            "raw_payload": {}
        })
    )
    .unwrap();
    drop(f);

    let report = h.loader().load_partition(&key).await.unwrap();
    assert_eq!(report.skipped_invalid, 1);
    assert_eq!(report.inserted, 2);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("external_id"));
}

#[tokio::test]
async fn missing_media_file_fails_enrichment_but_stays_eligible() {
    let h = Harness::new();
    h.source
        .push_messages("clinic_a", vec![photo_message(201, "media/201.jpg")]);
    h.source.put_media("media/201.jpg", vec![0xff, 0xd8, 0xff, 0xe0]);
    h.scraper().scrape_channel(&Channel::new("clinic_a")).await;
    h.loader().load_pending(false).await.unwrap();

    // the image disappears between load and enrichment
    let pending = h.warehouse.pending_media(10).unwrap();
    assert_eq!(pending.len(), 1);
    fs::remove_file(h.media.resolve(&pending[0].media_path).unwrap()).unwrap();

    let worker = EnrichmentWorker::new(
        h.warehouse.clone(),
        Arc::new(FixedDetector(vec![detection("bottle", 0.8)])),
        h.media.clone(),
    );
    let report = worker.run(10).await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(h.warehouse.detection_count("clinic_a", 201).unwrap(), 0);
    let state = h.warehouse.enrichment_state("clinic_a", 201).unwrap().unwrap();
    assert_eq!(state.attempts, 1);
    assert!(state.enriched_at.is_none());
    assert_eq!(h.warehouse.pending_media(10).unwrap().len(), 1);
}

#[tokio::test]
async fn enrichment_writes_detections_and_marks_message() {
    let h = Harness::new();
    h.source
        .push_messages("clinic_a", vec![photo_message(301, "media/301.jpg"), message(302)]);
    h.source.put_media("media/301.jpg", vec![0xff, 0xd8, 0xff, 0xe0]);
    h.scraper().scrape_channel(&Channel::new("clinic_a")).await;
    h.loader().load_pending(false).await.unwrap();

    let worker = EnrichmentWorker::new(
        h.warehouse.clone(),
        Arc::new(FixedDetector(vec![detection("bottle", 0.92), detection("person", 0.41)])),
        h.media.clone(),
    );
    let report = worker.run(10).await.unwrap();
    assert_eq!(report.enriched, 1);
    assert_eq!(report.detections, 2);
    assert_eq!(h.warehouse.detection_count("clinic_a", 301).unwrap(), 2);
    assert!(h.warehouse.pending_media(10).unwrap().is_empty());

    // a second run has nothing left to do
    assert_eq!(worker.run(10).await.unwrap().processed, 0);
}

#[tokio::test]
async fn loading_twice_is_idempotent() {
    let h = Harness::new();
    h.source
        .push_messages("clinic_a", (1..=5).map(message).collect());
    h.scraper().scrape_channel(&Channel::new("clinic_a")).await;

    h.loader().load_pending(false).await.unwrap();
    let s1 = h.warehouse.message_fingerprints().unwrap();
    let forced = h.loader().load_pending(true).await.unwrap();
    let s2 = h.warehouse.message_fingerprints().unwrap();

    assert_eq!(s1, s2);
    assert!(forced
        .partitions
        .iter()
        .all(|p| p.inserted == 0 && p.updated == 0));
}

#[tokio::test]
async fn overlapping_partitions_yield_one_row_per_message() {
    let h = Harness::new();
    let day1 = NaiveDate::from_ymd_opt(2025, 7, 14).unwrap();
    let day2 = NaiveDate::from_ymd_opt(2025, 7, 15).unwrap();
    h.raw
        .write_batch(day1, "clinic_a", &[record(1, "clinic_a", "a"), record(2, "clinic_a", "b")])
        .await
        .unwrap();
    h.raw
        .write_batch(day2, "clinic_a", &[record(2, "clinic_a", "b"), record(3, "clinic_a", "c")])
        .await
        .unwrap();
    // same id in another channel is a different message
    h.raw
        .write_batch(day2, "clinic_b", &[record(2, "clinic_b", "other")])
        .await
        .unwrap();

    let run = h.loader().load_pending(false).await.unwrap();
    assert!(run.failed.is_empty());
    let rows = h.warehouse.message_fingerprints().unwrap();
    let keys: Vec<(String, i64)> = rows.into_iter().map(|(c, id, _)| (c, id)).collect();
    assert_eq!(
        keys,
        vec![
            ("clinic_a".to_string(), 1),
            ("clinic_a".to_string(), 2),
            ("clinic_a".to_string(), 3),
            ("clinic_b".to_string(), 2),
        ]
    );
}

#[tokio::test]
async fn interrupted_batch_write_leaves_no_partial_records() {
    let h = Harness::new();
    let day = NaiveDate::from_ymd_opt(2025, 7, 15).unwrap();
    h.raw
        .write_batch(day, "clinic_a", &[record(1, "clinic_a", "a")])
        .await
        .unwrap();

    // a writer that died before rename leaves only its temp file behind
    let date_dir = h.data_root().join("raw/messages/2025-07-15");
    let mut partial = channel_ingest::envelope::encode_batch(&[
        record(2, "clinic_a", "b"),
        record(3, "clinic_a", "c"),
    ])
    .unwrap();
    partial.truncate(partial.len() / 2);
    fs::write(date_dir.join(".tmpA1b2C3"), partial).unwrap();

    let run = h.loader().load_pending(false).await.unwrap();
    assert_eq!(run.partitions.len(), 1);
    assert_eq!(h.warehouse.message_count().unwrap(), 1);

    // the retried batch lands whole
    h.raw
        .write_batch(day, "clinic_a", &[record(2, "clinic_a", "b"), record(3, "clinic_a", "c")])
        .await
        .unwrap();
    h.loader().load_pending(false).await.unwrap();
    assert_eq!(h.warehouse.message_count().unwrap(), 3);
}

#[tokio::test]
async fn crash_before_checkpoint_is_absorbed_by_dedup() {
    let source = Arc::new(channel_ingest::infra::in_memory::InMemorySource::new());
    let raw = Arc::new(InMemoryRawStore::new());
    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let warehouse = Arc::new(channel_ingest::infra::warehouse::Warehouse::open_in_memory().unwrap());
    source.push_messages("clinic_a", vec![message(101), message(102), message(103)]);

    let engine = ScraperEngine::new(source.clone(), raw.clone(), checkpoints.clone());
    checkpoints.fail_next_advance();
    let first = engine.scrape_channel(&Channel::new("clinic_a")).await;
    assert!(first.error.is_some());
    assert!(checkpoints.get_checkpoint("clinic_a").await.unwrap().is_none());

    let second = engine.scrape_channel(&Channel::new("clinic_a")).await;
    assert!(second.error.is_none());
    assert_eq!(second.checkpoint, Some(Cursor(103)));
    assert_eq!(raw.record_count().unwrap(), 6);

    let run = LoaderEngine::new(raw.clone(), warehouse.clone())
        .load_pending(false)
        .await
        .unwrap();
    assert_eq!(run.partitions[0].inserted, 3);
    assert_eq!(run.partitions[0].skipped_duplicate, 3);
    assert_eq!(warehouse.message_count().unwrap(), 3);
}

#[tokio::test]
async fn exhausted_retries_fail_only_that_channel() {
    let h = Harness::new();
    h.source
        .push_messages("clinic_a", vec![message(1), message(2)]);
    h.source.fail_always(
        "flaky_ch",
        SourceError::Transient("connection reset by peer".into()),
    );

    let report = h
        .scraper()
        .scrape_all(&[Channel::new("clinic_a"), Channel::new("flaky_ch")])
        .await;

    assert_eq!(report.channels.len(), 2);
    let ok = &report.channels[0];
    let failed = &report.channels[1];
    assert_eq!(ok.channel, "clinic_a");
    assert!(ok.error.is_none());
    assert_eq!(ok.records_written, 2);
    assert!(failed.error.as_deref().unwrap().contains("after 3 attempt(s)"));
    assert!(h.meta.get_checkpoint("flaky_ch").await.unwrap().is_none());

    // backoff was scheduled, not slept
    assert_eq!(
        h.sleeper.sleeps(),
        vec![Duration::from_millis(1_000), Duration::from_millis(2_000)]
    );
}

#[tokio::test]
async fn rate_limited_pages_wait_for_retry_after() {
    let h = Harness::new();
    h.source.push_messages("clinic_a", vec![message(1)]);
    h.source.fail_next(
        "clinic_a",
        vec![SourceError::RateLimited {
            retry_after: Some(Duration::from_secs(42)),
        }],
    );

    let report = h.scraper().scrape_channel(&Channel::new("clinic_a")).await;
    assert!(report.error.is_none());
    assert_eq!(h.sleeper.sleeps(), vec![Duration::from_secs(42)]);
}

#[tokio::test]
async fn disabled_channels_are_not_scraped() {
    let h = Harness::new();
    h.source.push_messages("clinic_a", vec![message(1)]);
    let mut disabled = Channel::new("clinic_a");
    disabled.enabled = false;

    let report = h.scraper().scrape_all(&[disabled]).await;
    assert!(report.channels.is_empty());
    assert_eq!(h.source.page_calls(), 0);
}

#[tokio::test]
async fn legacy_partitions_load_with_aliases() {
    let h = Harness::new();
    let dir = h.data_root().join("raw/messages/2025-07-10");
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("CheMed123.json"),
        include_str!("resources/legacy_partition.json"),
    )
    .unwrap();

    let run = h.loader().load_pending(false).await.unwrap();
    let report = &run.partitions[0];
    assert_eq!(report.inserted, 2);
    assert_eq!(report.skipped_invalid, 1);
    let keys: Vec<i64> = h
        .warehouse
        .message_fingerprints()
        .unwrap()
        .into_iter()
        .map(|(channel, id, _)| {
            assert_eq!(channel, "CheMed123");
            id
        })
        .collect();
    assert_eq!(keys, vec![11, 12]);

    // the old scraper's photo sits under the media root; the remote URL is not a local file
    let pending = h.warehouse.pending_media(10).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].media_path, "CheMed123/2025-07-10/11_1752134400.jpg");
    let photo = h.data_root().join("raw/media/CheMed123/2025-07-10/11_1752134400.jpg");
    fs::create_dir_all(photo.parent().unwrap()).unwrap();
    fs::write(&photo, [0xff, 0xd8, 0xff, 0xe0]).unwrap();

    let worker = EnrichmentWorker::new(
        h.warehouse.clone(),
        Arc::new(FixedDetector(vec![detection("bottle", 0.7)])),
        h.media.clone(),
    );
    let report = worker.run(10).await.unwrap();
    assert_eq!(report.enriched, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(h.warehouse.detection_count("CheMed123", 11).unwrap(), 1);
}
