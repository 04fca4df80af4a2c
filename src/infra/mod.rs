pub mod command_detector;
pub mod fs_raw_store;
pub mod http_source;
pub mod in_memory;
pub mod ingest_meta;
pub mod media_store;
pub mod warehouse;
