use std::fs;
use std::path::Path;
use serde::Deserialize;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteMode {
    Overwrite,
    AppendMerge,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u32,
    pub poll_interval_sec: u32,
    pub cmc_api_url: String,
    pub cmc_api_key: String,
    /// How many listings to request per poll (the API's `limit` parameter).
    pub listing_limit: u32,
    pub database_url: String,
    /// Timezone the poll timestamps are recorded in, either an IANA name
    /// ("Asia/Jakarta") or a fixed offset ("+07:00").
    pub source_timezone: String,
    /// Drop the first `leading_row_drop_count` rows whenever the batch is
    /// larger than this threshold. Legacy filter for manual/test entries at
    /// the head of the historical dataset.
    pub leading_row_drop_threshold: usize,
    pub leading_row_drop_count: usize,
    /// Content-based alternative to the positional filter: discard rows
    /// polled before this UTC instant (RFC 3339).
    pub drop_polled_before: Option<chrono::DateTime<chrono::Utc>>,
    pub write_mode: WriteMode,
    /// When set, every cycle also mirrors the cleaned batch to this CSV file.
    pub csv_export_path: Option<String>,
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let toml_str = fs::read_to_string(path)?;
        let config = toml::from_str(&toml_str)?;

        Ok(config)
    }
}
