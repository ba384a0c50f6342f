//! Batch controller.
//!
//! A run scrapes whatever the store is missing, then walks the work list in
//! fixed-size batches, summarizing each unsummarized record under the shared
//! rate limiter. After every batch the full record set is written back, the
//! processed file is regenerated and the batch's failures go to the failure
//! log, so an interrupted run loses at most the batch in flight.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::enrich;
use crate::fetcher::Fetcher;
use crate::records::{FailedItem, FailureEntry, ScrapedRecord, Summary, SummaryRecord};
use crate::retry::{retry_with_backoff, RateLimiter, RetryPolicy};
use crate::store::{RecordStore, StoreError};
use crate::summarizer::{SummarizeError, Summarizer};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub batch_size: usize,
    /// Summarizer attempts per record.
    pub max_retries: u32,
    /// Skip the scrape pre-pass and only summarize what is already stored.
    pub summarize_only: bool,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub total: usize,
    pub summarized: usize,
    pub skipped: usize,
    pub failed: usize,
    pub batches: usize,
    pub elapsed: Duration,
}

impl RunReport {
    /// Records that end the run with a summary.
    pub fn succeeded(&self) -> usize {
        self.summarized + self.skipped
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreStats {
    pub scraped: usize,
    pub summarized: usize,
    pub unsummarized: usize,
    pub processed: usize,
    pub failure_entries: usize,
    pub failed_items: usize,
}

#[derive(Debug, Error)]
pub enum SummarizeUrlError {
    #[error("failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },
    #[error(transparent)]
    Summarize(#[from] SummarizeError),
    #[error("summarizer returned an empty summary for {0}")]
    EmptySummary(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Pipeline {
    store: RecordStore,
    fetcher: Box<dyn Fetcher>,
    summarizer: Box<dyn Summarizer>,
    policy: RetryPolicy,
    limiter: RateLimiter,
    fetch_limiter: RateLimiter,
}

impl Pipeline {
    pub fn new(
        store: RecordStore,
        fetcher: Box<dyn Fetcher>,
        summarizer: Box<dyn Summarizer>,
        policy: RetryPolicy,
        scrape_delay: Duration,
    ) -> Self {
        let limiter = RateLimiter::new(policy.min_delay);
        Pipeline {
            store,
            fetcher,
            summarizer,
            policy,
            limiter,
            fetch_limiter: RateLimiter::new(scrape_delay),
        }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Scrape, summarize in checkpointed batches, log failures.
    pub async fn run(&mut self, locators: &[String], opts: &RunOptions) -> Result<RunReport> {
        if opts.batch_size == 0 {
            bail!("batch size must be at least 1");
        }
        if opts.max_retries == 0 {
            bail!("retry count must be at least 1");
        }
        let started = Instant::now();

        let mut records = self.store.load_scraped();
        info!("Found {} existing records", records.len());

        let locators = match opts.limit {
            Some(n) => &locators[..n.min(locators.len())],
            None => locators,
        };

        if !opts.summarize_only {
            let added = self.ensure_scraped(locators, &mut records).await;
            if added > 0 {
                info!("Saving updated scraped data");
                self.store
                    .save_scraped(&records)
                    .context("failed to save scraped records")?;
            }
        }

        let work = select_work(&records, locators, opts);
        let batches: Vec<&[usize]> = work.chunks(opts.batch_size).collect();
        info!(
            "Processing {} records in {} batches of {}",
            work.len(),
            batches.len(),
            opts.batch_size
        );

        let policy = RetryPolicy { max_retries: opts.max_retries, ..self.policy.clone() };
        let mut report = RunReport { total: work.len(), batches: batches.len(), ..Default::default() };
        let batches_started = Instant::now();

        for (i, batch) in batches.iter().enumerate() {
            info!(
                "Processing batch {}/{} ({}/{} items{})",
                i + 1,
                batches.len(),
                i * opts.batch_size,
                work.len(),
                eta_suffix(batches_started.elapsed(), i, batches.len())
            );

            let mut failed = Vec::new();
            for (j, &idx) in batch.iter().enumerate() {
                let position = i * opts.batch_size + j + 1;
                let record = &records[idx];

                if record.is_summarized() {
                    debug!("Already summarized: {}", record.url);
                    report.skipped += 1;
                    continue;
                }
                if record.content.trim().is_empty() {
                    warn!("No scraped content for {}; skipping", record.url);
                    failed.push(FailedItem {
                        url: record.url.clone(),
                        error: "no scraped content".to_string(),
                    });
                    report.failed += 1;
                    continue;
                }

                info!("Summarizing {}/{}: {}", position, work.len(), record.url);
                let content = record.content.clone();
                match self.summarize_text(&content, &policy).await {
                    Ok(summary) => {
                        records[idx].summary = Some(summary);
                        report.summarized += 1;
                    }
                    Err(e) => {
                        error!("Failed to summarize {}: {}", records[idx].url, e);
                        failed.push(FailedItem { url: records[idx].url.clone(), error: e.to_string() });
                        report.failed += 1;
                    }
                }
            }

            self.checkpoint(&records, i + 1, failed)?;
        }

        report.elapsed = started.elapsed();
        info!(
            "Run finished: {} records, {} summarized, {} already done, {} failed in {:.1}s",
            report.total,
            report.summarized,
            report.skipped,
            report.failed,
            report.elapsed.as_secs_f64()
        );
        if report.failed > 0 {
            info!("Failed items saved to {}", self.store.failures_path().display());
        }
        Ok(report)
    }

    /// Only the scrape pre-pass. Returns how many records were added.
    pub async fn scrape(&mut self, locators: &[String]) -> Result<usize> {
        let mut records = self.store.load_scraped();
        let added = self.ensure_scraped(locators, &mut records).await;
        if added > 0 {
            self.store
                .save_scraped(&records)
                .context("failed to save scraped records")?;
        }
        Ok(added)
    }

    /// Cached enriched record for `url`, or fetch + summarize + append one.
    pub async fn summarize_url(&mut self, url: &str) -> Result<SummaryRecord, SummarizeUrlError> {
        let url = url.trim();
        if let Some(hit) = self.store.load_processed().into_iter().find(|r| r.url == url) {
            debug!("Serving cached summary for {}", url);
            return Ok(hit);
        }

        let mut records = self.store.load_scraped();
        let existing = records.iter().position(|r| r.url == url);
        let mut record = match existing.map(|i| records[i].clone()) {
            Some(r) if r.is_summarized() || !r.content.trim().is_empty() => r,
            _ => {
                self.fetch_limiter.wait().await;
                let fetched = self.fetcher.fetch(url).await;
                self.fetch_limiter.mark();
                let article = fetched.map_err(|e| SummarizeUrlError::Fetch {
                    url: url.to_string(),
                    reason: format!("{:#}", e),
                })?;
                ScrapedRecord::from_content(url, article)
            }
        };

        if !record.is_summarized() {
            let policy = self.policy.clone();
            let summary = self.summarize_text(&record.content, &policy).await?;
            record.summary = Some(summary);
        }

        match existing {
            Some(i) => records[i] = record.clone(),
            None => records.push(record.clone()),
        }
        self.store.save_scraped(&records)?;

        let id = self.store.load_processed().len() + 1;
        let enriched = enrich::enrich_record(id, &record)
            .ok_or_else(|| SummarizeUrlError::EmptySummary(url.to_string()))?;
        self.store.append_processed(&enriched)?;
        info!("Summarized {} (id {})", url, id);
        Ok(enriched)
    }

    /// Regenerate the processed file without calling the summarizer.
    pub fn process(&self) -> Result<usize, StoreError> {
        regenerate_processed(&self.store)
    }

    async fn summarize_text(
        &mut self,
        text: &str,
        policy: &RetryPolicy,
    ) -> Result<Summary, SummarizeError> {
        let summarizer = self.summarizer.as_ref();
        retry_with_backoff(&mut self.limiter, policy, SummarizeError::class, || {
            summarizer.summarize(text)
        })
        .await
    }

    /// Fetch every locator the store does not know yet. Failures are logged and skipped.
    async fn ensure_scraped(&mut self, locators: &[String], records: &mut Vec<ScrapedRecord>) -> usize {
        let mut seen: HashSet<String> = records.iter().map(|r| r.url.clone()).collect();
        let missing: Vec<&String> = locators.iter().filter(|u| seen.insert((*u).clone())).collect();
        if missing.is_empty() {
            info!("All {} URLs already scraped", locators.len());
            return 0;
        }

        info!("Scraping {} new URLs", missing.len());
        let pb = progress_bar(missing.len());
        let mut added = 0;
        for url in &missing {
            self.fetch_limiter.wait().await;
            let result = self.fetcher.fetch(url).await;
            self.fetch_limiter.mark();

            match result {
                Ok(article) if !article.content.trim().is_empty() => {
                    debug!("Collected {} characters from {}", article.content.len(), url);
                    records.push(ScrapedRecord::from_content(url, article));
                    added += 1;
                }
                Ok(_) => warn!("No text extracted from {}", url),
                Err(e) => error!("Failed to scrape {}: {:#}", url, e),
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        info!("Scraped {} of {} new URLs", added, missing.len());
        added
    }

    fn checkpoint(&self, records: &[ScrapedRecord], batch_no: usize, failed: Vec<FailedItem>) -> Result<()> {
        self.store
            .save_scraped(records)
            .context("failed to checkpoint scraped records")?;
        let enriched = enrich::enrich_all(records);
        self.store
            .save_processed(&enriched)
            .context("failed to checkpoint processed records")?;

        if let Some(first) = failed.first() {
            let entry = FailureEntry::now(format!("Failed in batch {}: {}", batch_no, first.error), failed);
            self.store
                .append_failures(&entry)
                .context("failed to append to the failure log")?;
            warn!(
                "Saved {} failed items to {}",
                entry.items.len(),
                self.store.failures_path().display()
            );
        }

        info!("Checkpoint after batch {}: {} summarized records saved", batch_no, enriched.len());
        Ok(())
    }
}

/// Rebuild the processed file from the scraped file.
pub fn regenerate_processed(store: &RecordStore) -> Result<usize, StoreError> {
    let records = store.load_scraped();
    if records.is_empty() {
        warn!("No scraped records in {}; nothing to process", store.scraped_path().display());
        return Ok(0);
    }
    let enriched = enrich::enrich_all(&records);
    store.save_processed(&enriched)?;
    info!("Enriched {} summaries -> {}", enriched.len(), store.processed_path().display());
    Ok(enriched.len())
}

pub fn store_stats(store: &RecordStore) -> StoreStats {
    let records = store.load_scraped();
    let summarized = records.iter().filter(|r| r.is_summarized()).count();
    let failures = store.load_failures();
    StoreStats {
        scraped: records.len(),
        summarized,
        unsummarized: records.len() - summarized,
        processed: store.load_processed().len(),
        failure_entries: failures.len(),
        failed_items: failures.iter().map(|f| f.items.len()).sum(),
    }
}

/// Indices into `records` to work on, in processing order.
fn select_work(records: &[ScrapedRecord], locators: &[String], opts: &RunOptions) -> Vec<usize> {
    if opts.summarize_only {
        let n = opts.limit.unwrap_or(records.len()).min(records.len());
        return (0..n).collect();
    }

    // Reverse so the first record for a url wins.
    let index: HashMap<&str, usize> = records
        .iter()
        .enumerate()
        .rev()
        .map(|(i, r)| (r.url.as_str(), i))
        .collect();
    let mut seen = HashSet::new();
    locators
        .iter()
        .filter_map(|u| index.get(u.as_str()).copied())
        .filter(|i| seen.insert(*i))
        .collect()
}

fn eta_suffix(elapsed: Duration, done: usize, total: usize) -> String {
    if done == 0 {
        return String::new();
    }
    let mean = elapsed.as_secs_f64() / done as f64;
    let remaining = total.saturating_sub(done) as f64 * mean;
    format!(", ETA: {:.1} minutes", remaining / 60.0)
}

fn progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) =
        ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")
    {
        pb.set_style(style.progress_chars("=> "));
    }
    pb
}
