//! JSON-file record store.
//!
//! Every write goes to a temp file in the destination's directory and is then
//! renamed over the destination, so readers see either the old or the new
//! content, never a partial file.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::enrich;
use crate::records::{FailureEntry, ScrapedRecord, Summary, SummaryRecord};

pub const SCRAPED_FILE: &str = "data.json";
pub const PROCESSED_FILE: &str = "processed_data.json";
pub const FAILED_FILE: &str = "failed.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to encode records for {}: {source}", path.display())]
    Encode { path: PathBuf, source: serde_json::Error },
    #[error("{} does not hold a JSON array; refusing to overwrite it", path.display())]
    ShapeMismatch { path: PathBuf },
}

/// Why raw file content could not be served.
#[derive(Debug, Error)]
pub enum RawReadError {
    #[error("{} not found", .0.display())]
    Missing(PathBuf),
    #[error("{} is malformed: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ── Generic file operations ──

/// Load a JSON array from `path`. Missing or malformed files yield an empty list.
pub fn load<T: DeserializeOwned>(path: &Path) -> Vec<T> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!("{} is missing; starting with no records", path.display());
            return Vec::new();
        }
        Err(e) => {
            warn!("Could not read {}: {}; starting with no records", path.display(), e);
            return Vec::new();
        }
    };

    match serde_json::from_str::<Vec<T>>(&text) {
        Ok(items) => items,
        Err(e) => {
            warn!("{} is empty or malformed ({}); starting with no records", path.display(), e);
            Vec::new()
        }
    }
}

/// Atomically replace `path` with `records` as pretty-printed JSON.
///
/// With `backup`, the current file (if any) is first copied to `<path>.bak`.
pub fn save<T: Serialize>(path: &Path, records: &[T], backup: bool) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(records).map_err(|source| StoreError::Encode {
        path: path.to_path_buf(),
        source,
    })?;
    let write_err = |source: io::Error| StoreError::Write { path: path.to_path_buf(), source };

    let dir = parent_dir(path);
    fs::create_dir_all(dir).map_err(write_err)?;

    if backup && path.exists() {
        let bak = backup_path(path);
        fs::copy(path, &bak).map_err(write_err)?;
        info!("Backed up existing file to {}", bak.display());
    }

    let mut tmp = NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(&bytes).map_err(write_err)?;
    tmp.write_all(b"\n").map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;

    debug!("Wrote {} entries to {}", records.len(), path.display());
    Ok(())
}

/// Extend the JSON array at `path` with `items`. Returns the new length.
///
/// An absent file is created. Content that is not a JSON array is an error.
pub fn append<T: Serialize>(path: &Path, items: &[T]) -> Result<usize, StoreError> {
    let mut existing = match read_value(path)? {
        None => Vec::new(),
        Some(Value::Array(values)) => values,
        Some(_) => return Err(StoreError::ShapeMismatch { path: path.to_path_buf() }),
    };

    for item in items {
        let value = serde_json::to_value(item).map_err(|source| StoreError::Encode {
            path: path.to_path_buf(),
            source,
        })?;
        existing.push(value);
    }

    save(path, &existing, false)?;
    Ok(existing.len())
}

pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".bak");
    PathBuf::from(name)
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// `Ok(None)` when the file does not exist; `ShapeMismatch` when it is not JSON.
fn read_value(path: &Path) -> Result<Option<Value>, StoreError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(StoreError::Read { path: path.to_path_buf(), source }),
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|_| StoreError::ShapeMismatch { path: path.to_path_buf() })
}

// ── Legacy shapes ──

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredArticle {
    Record(ScrapedRecord),
    Legacy(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredSummary {
    Record(SummaryRecord),
    Enriched(EnrichedSummary),
    Legacy(String),
}

/// Older processed shape: no id, the summary under `original_summary` and
/// sections as a flat list.
#[derive(Deserialize)]
struct EnrichedSummary {
    #[serde(default)]
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    author: String,
    #[serde(default)]
    sections: Vec<String>,
    original_summary: String,
}

fn unknown_url(index: usize) -> String {
    format!("unknown-{}", index + 1)
}

fn normalize_articles(values: Vec<Value>) -> Vec<ScrapedRecord> {
    values
        .into_iter()
        .enumerate()
        .filter_map(|(i, value)| match serde_json::from_value::<StoredArticle>(value) {
            Ok(StoredArticle::Record(mut record)) => {
                if record.url.is_empty() {
                    record.url = unknown_url(i);
                }
                Some(record)
            }
            Ok(StoredArticle::Legacy(text)) => Some(ScrapedRecord {
                url: unknown_url(i),
                title: None,
                author: None,
                content: String::new(),
                summary: Some(Summary::Text(text)),
            }),
            Err(e) => {
                warn!("Leaving record {} as stored: unrecognized shape ({})", i + 1, e);
                None
            }
        })
        .collect()
}

fn normalize_summaries(values: Vec<Value>) -> Vec<SummaryRecord> {
    values
        .into_iter()
        .enumerate()
        .filter_map(|(i, value)| match serde_json::from_value::<StoredSummary>(value) {
            Ok(StoredSummary::Record(record)) => Some(record),
            Ok(StoredSummary::Legacy(text)) => {
                let legacy = ScrapedRecord {
                    url: unknown_url(i),
                    title: None,
                    author: None,
                    content: String::new(),
                    summary: Some(Summary::Text(text)),
                };
                enrich::enrich_record(i + 1, &legacy)
            }
            Ok(StoredSummary::Enriched(enriched)) => from_enriched(i, enriched),
            Err(e) => {
                warn!("Skipping processed record {}: unrecognized shape ({})", i + 1, e);
                None
            }
        })
        .collect()
}

fn from_enriched(index: usize, stored: EnrichedSummary) -> Option<SummaryRecord> {
    let url = if stored.url.trim().is_empty() { unknown_url(index) } else { stored.url };
    let record = ScrapedRecord {
        url,
        title: Some(stored.title),
        author: Some(stored.author),
        content: String::new(),
        summary: Some(Summary::Text(stored.original_summary)),
    };
    let mut enriched = enrich::enrich_record(index + 1, &record)?;
    if enriched.sections.is_empty() {
        enriched.sections = list_sections(&stored.sections);
    }
    Some(enriched)
}

/// `Heading: body` items keep their heading; anything else is numbered.
fn list_sections(items: &[String]) -> BTreeMap<String, String> {
    items
        .iter()
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .enumerate()
        .map(|(n, item)| {
            let split = item.split_once(':').and_then(|(head, body)| {
                let head = head.trim().trim_matches('*').trim();
                let body = body.trim().trim_start_matches('*').trim();
                (!head.is_empty() && !body.is_empty()).then(|| (head.to_string(), body.to_string()))
            });
            split.unwrap_or_else(|| (format!("Point {}", n + 1), item.to_string()))
        })
        .collect()
}

/// Scraped-file entries that match no known shape. They never become records,
/// but every save carries them over unchanged.
fn unrecognized_articles(path: &Path) -> Vec<Value> {
    match read_value(path) {
        Ok(Some(Value::Array(values))) => values
            .into_iter()
            .filter(|v| serde_json::from_value::<StoredArticle>(v.clone()).is_err())
            .collect(),
        _ => Vec::new(),
    }
}

// ── Record store ──

/// The three files of one data directory.
#[derive(Debug, Clone)]
pub struct RecordStore {
    scraped: PathBuf,
    processed: PathBuf,
    failures: PathBuf,
}

impl RecordStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let dir = data_dir.as_ref();
        RecordStore {
            scraped: dir.join(SCRAPED_FILE),
            processed: dir.join(PROCESSED_FILE),
            failures: dir.join(FAILED_FILE),
        }
    }

    pub fn scraped_path(&self) -> &Path {
        &self.scraped
    }

    pub fn processed_path(&self) -> &Path {
        &self.processed
    }

    pub fn failures_path(&self) -> &Path {
        &self.failures
    }

    /// Scraped records with every legacy shape normalized.
    pub fn load_scraped(&self) -> Vec<ScrapedRecord> {
        normalize_articles(load(&self.scraped))
    }

    /// Replace the scraped records. Unrecognized entries already in the file are kept at the end.
    pub fn save_scraped(&self, records: &[ScrapedRecord]) -> Result<(), StoreError> {
        let kept = unrecognized_articles(&self.scraped);
        if kept.is_empty() {
            return save(&self.scraped, records, true);
        }

        warn!("Keeping {} unrecognized entries in {}", kept.len(), self.scraped.display());
        let mut values = Vec::with_capacity(records.len() + kept.len());
        for record in records {
            let value = serde_json::to_value(record).map_err(|source| StoreError::Encode {
                path: self.scraped.clone(),
                source,
            })?;
            values.push(value);
        }
        values.extend(kept);
        save(&self.scraped, &values, true)
    }

    pub fn load_processed(&self) -> Vec<SummaryRecord> {
        normalize_summaries(load(&self.processed))
    }

    pub fn save_processed(&self, records: &[SummaryRecord]) -> Result<(), StoreError> {
        save(&self.processed, records, false)
    }

    pub fn append_processed(&self, record: &SummaryRecord) -> Result<usize, StoreError> {
        append(&self.processed, std::slice::from_ref(record))
    }

    pub fn load_failures(&self) -> Vec<FailureEntry> {
        load(&self.failures)
    }

    pub fn append_failures(&self, entry: &FailureEntry) -> Result<usize, StoreError> {
        append(&self.failures, std::slice::from_ref(entry))
    }

    /// The processed file as stored, for serving verbatim.
    pub fn read_processed_raw(&self) -> Result<Value, RawReadError> {
        let text = match fs::read_to_string(&self.processed) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RawReadError::Missing(self.processed.clone()))
            }
            Err(source) => {
                return Err(StoreError::Read { path: self.processed.clone(), source }.into())
            }
        };
        serde_json::from_str(&text)
            .map_err(|e| RawReadError::Malformed {
                path: self.processed.clone(),
                reason: e.to_string(),
            })
    }
}
