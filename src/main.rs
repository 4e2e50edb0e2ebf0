use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use clap::{Arg, Command};
use durable_cache::Cache;
use serde_json::Value;

// Demo ingestion collaborator: reads a JSON array of building access events
// ({"timestamp": ..., "person_id": ..., "event": ...}), loads them into the
// persistent cache keyed by timestamp, and prints the cache back. Run it
// twice against the same --dir to see the data survive the restart.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = Command::new("durable_cache")
        .about("Persistent key-value cache demo: load access events, read them back")
        .arg(
            Arg::new("data")
                .long("data")
                .value_name("FILE")
                .default_value("data.json")
                .help("JSON array of access events to ingest"),
        )
        .arg(
            Arg::new("dir")
                .long("dir")
                .value_name("DIR")
                .help("Cache directory (defaults to a fixed path under the temp dir)"),
        )
        .get_matches();

    let cache_dir = match matches.get_one::<String>("dir") {
        Some(dir) => PathBuf::from(dir),
        None => std::env::temp_dir().join("durable_cache_demo"),
    };
    log::info!("Using cache directory: {:?}", cache_dir);

    let cache = Cache::open(&cache_dir)?;
    log::info!("Cache ready with {} entries from previous runs", cache.len());

    let data_path = matches.get_one::<String>("data").expect("has default");
    let events = load_events(Path::new(data_path))?;
    log::info!("Loaded {} events from {}", events.len(), data_path);
    cache.load_from(events)?;

    println!("Data stored in the cache");
    cache.for_each(|key, value| println!("{} -> {}", key, String::from_utf8_lossy(value)));

    Ok(())
}

fn load_events(path: &Path) -> Result<Vec<(String, Vec<u8>)>, Box<dyn std::error::Error>> {
    let reader = BufReader::new(File::open(path)?);
    let events: Vec<serde_json::Map<String, Value>> = serde_json::from_reader(reader)?;

    let mut pairs = Vec::with_capacity(events.len());
    for event in events {
        let timestamp = event
            .get("timestamp")
            .and_then(|v| v.as_str())
            .ok_or("event missing string \"timestamp\"")?;
        let person = event.get("person_id").cloned().unwrap_or(Value::Null);
        let action = event.get("event").and_then(|v| v.as_str()).unwrap_or("");
        let detail = format!("Person {} {}", person, action);
        pairs.push((timestamp.to_string(), detail.into_bytes()));
    }
    Ok(pairs)
}
