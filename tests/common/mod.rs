#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pubdigest::fetcher::Fetcher;
use pubdigest::pipeline::{Pipeline, RunOptions};
use pubdigest::records::{ArticleContent, Summary};
use pubdigest::retry::RetryPolicy;
use pubdigest::store::RecordStore;
use pubdigest::summarizer::{SummarizeError, Summarizer};

pub fn url(i: usize) -> String {
    format!("https://example.org/article/{}", i)
}

pub fn urls(n: usize) -> Vec<String> {
    (1..=n).map(url).collect()
}

pub fn body_for(url: &str) -> String {
    format!("Body of {}", url)
}

/// Serves a canned page per url; anything else is a 404.
pub struct FakeFetcher {
    pages: HashMap<String, ArticleContent>,
    pub calls: Arc<AtomicUsize>,
}

impl FakeFetcher {
    pub fn new(urls: &[String]) -> Self {
        let pages = urls
            .iter()
            .map(|u| {
                let article = ArticleContent {
                    title: Some(format!("Title of {}", u)),
                    author: Some("Jane Doe".into()),
                    content: body_for(u),
                };
                (u.clone(), article)
            })
            .collect();
        FakeFetcher { pages, calls: Arc::new(AtomicUsize::new(0)) }
    }

    pub fn without(mut self, url: &str) -> Self {
        self.pages.remove(url);
        self
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<ArticleContent> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("HTTP 404 Not Found for {}", url))
    }
}

pub enum Reply {
    Summary(Summary),
    Fail(SummarizeError),
    Hang,
}

/// Answers according to a script of (zero-based call number, input text).
pub struct ScriptedSummarizer {
    script: Box<dyn Fn(usize, &str) -> Reply + Send + Sync>,
    pub calls: Arc<AtomicUsize>,
}

impl ScriptedSummarizer {
    pub fn new(script: impl Fn(usize, &str) -> Reply + Send + Sync + 'static) -> Self {
        ScriptedSummarizer { script: Box::new(script), calls: Arc::new(AtomicUsize::new(0)) }
    }

    pub fn echo() -> Self {
        Self::new(|_, text| Reply::Summary(bullets(text)))
    }
}

#[async_trait]
impl Summarizer for ScriptedSummarizer {
    async fn summarize(&self, text: &str) -> Result<Summary, SummarizeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match (self.script)(call, text) {
            Reply::Summary(summary) => Ok(summary),
            Reply::Fail(err) => Err(err),
            Reply::Hang => std::future::pending().await,
        }
    }
}

pub fn bullets(text: &str) -> Summary {
    Summary::Text(format!(
        "* **Key Findings:** {}\n* **Conclusions:** More work is needed.",
        text
    ))
}

pub fn test_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        min_delay: Duration::from_secs(1),
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(4),
        jitter: Duration::ZERO,
    }
}

pub fn pipeline(store: &RecordStore, fetcher: FakeFetcher, summarizer: ScriptedSummarizer) -> Pipeline {
    Pipeline::new(
        store.clone(),
        Box::new(fetcher),
        Box::new(summarizer),
        test_policy(),
        Duration::ZERO,
    )
}

pub fn opts(batch_size: usize) -> RunOptions {
    RunOptions { batch_size, max_retries: 3, summarize_only: false, limit: None }
}
