use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::retry::RetryPolicy;
use crate::store::RecordStore;
use crate::summarizer::{DEFAULT_BASE_URL, DEFAULT_MODEL};

pub const DEFAULT_CSV_URL: &str =
    "https://raw.githubusercontent.com/jgalazka/SB_publications/main/SB_publication_PMC.csv";
pub const ENV_PREFIX: &str = "PUBDIGEST";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub csv_url: String,
    pub data_dir: PathBuf,
    #[serde(default)]
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_base_url: String,
    /// Spacing between summarizer calls; 31s keeps under a 2 requests/minute quota.
    pub min_request_delay_secs: f64,
    pub initial_retry_delay_secs: f64,
    pub max_retry_delay_secs: f64,
    pub jitter_secs: f64,
    /// Politeness delay between page fetches.
    pub scrape_delay_secs: f64,
    pub batch_size: usize,
    pub retry_count: u32,
    pub listen_addr: String,
}

impl Settings {
    /// Defaults, then the optional TOML file, then `PUBDIGEST_*` variables.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("csv_url", DEFAULT_CSV_URL)?
            .set_default("data_dir", "data")?
            .set_default("gemini_model", DEFAULT_MODEL)?
            .set_default("gemini_base_url", DEFAULT_BASE_URL)?
            .set_default("min_request_delay_secs", 31.0)?
            .set_default("initial_retry_delay_secs", 31.0)?
            .set_default("max_retry_delay_secs", 120.0)?
            .set_default("jitter_secs", 1.0)?
            .set_default("scrape_delay_secs", 1.0)?
            .set_default("batch_size", 10_i64)?
            .set_default("retry_count", 3_i64)?
            .set_default("listen_addr", "127.0.0.1:5000")?;

        if let Some(path) = file {
            builder = builder.add_source(File::from(path));
        }

        builder
            .add_source(Environment::with_prefix(ENV_PREFIX))
            .build()?
            .try_deserialize()
    }

    /// Configured key, falling back to the conventional `GOOGLE_API_KEY`.
    pub fn api_key(&self) -> Option<String> {
        self.gemini_api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var("GOOGLE_API_KEY").ok().filter(|k| !k.trim().is_empty()))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry_count,
            min_delay: secs(self.min_request_delay_secs),
            initial_delay: secs(self.initial_retry_delay_secs),
            max_delay: secs(self.max_retry_delay_secs),
            jitter: secs(self.jitter_secs),
        }
    }

    pub fn scrape_delay(&self) -> Duration {
        secs(self.scrape_delay_secs)
    }

    pub fn store(&self) -> RecordStore {
        RecordStore::new(&self.data_dir)
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::ZERO)
}
