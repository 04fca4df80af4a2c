use channel_ingest::validation::{check_schema, decode_line};
use serde_json::{json, Value};

fn example() -> Value {
    serde_json::from_str(include_str!("resources/raw_message_v1.json")).unwrap()
}

#[test]
fn example_record_is_valid() {
    assert!(check_schema(&example()).is_ok());
    let record = decode_line(&example().to_string()).unwrap();
    assert_eq!(record.external_id, 101);
    assert_eq!(record.raw_payload.0["views"], json!(250));
}

#[test]
fn non_positive_ids_are_rejected() {
    let mut bad = example();
    bad["external_id"] = json!(0);
    assert!(check_schema(&bad).is_err());
}

#[test]
fn unknown_media_type_is_rejected() {
    let mut bad = example();
    bad["media_type"] = json!("sticker");
    assert!(check_schema(&bad).is_err());
}

#[test]
fn payload_must_be_an_object() {
    let mut bad = example();
    bad["raw_payload"] = json!("views=250");
    assert!(check_schema(&bad).is_err());
    assert!(decode_line(&bad.to_string()).is_err());
}

#[test]
fn future_record_versions_are_refused() {
    let mut newer = example();
    newer["record_version"] = json!(2);
    assert!(check_schema(&newer).is_err());
    assert!(decode_line(&newer.to_string()).is_err());
}
