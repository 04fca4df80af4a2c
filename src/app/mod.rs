pub mod ports;
pub mod scrape_use_case;
pub mod load_use_case;
pub mod enrich_use_case;
