use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// What the fetcher pulls out of one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleContent {
    pub title: Option<String>,
    pub author: Option<String>,
    pub content: String,
}

/// One scraped article. `summary` stays empty until a summarizer call succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedRecord {
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
}

impl ScrapedRecord {
    pub fn from_content(url: &str, article: ArticleContent) -> Self {
        ScrapedRecord {
            url: url.to_string(),
            title: article.title,
            author: article.author,
            content: article.content,
            summary: None,
        }
    }

    pub fn is_summarized(&self) -> bool {
        self.summary.as_ref().is_some_and(|s| !s.is_empty())
    }
}

/// Summarizer output. Plain strings are also the legacy on-disk shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Summary {
    Structured(StructuredSummary),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub summary: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sections: BTreeMap<String, String>,
}

impl Summary {
    pub fn text(&self) -> &str {
        match self {
            Summary::Structured(s) => &s.summary,
            Summary::Text(t) => t,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text().trim().is_empty()
    }
}

/// Enriched record served from the processed file.
///
/// `id` is positional within one enrichment pass; `url` is the stable key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub id: usize,
    pub url: String,
    pub title: String,
    pub author: String,
    pub summary: String,
    #[serde(default)]
    pub sections: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedItem {
    pub url: String,
    pub error: String,
}

/// One append-only entry of the failure log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub timestamp: String,
    pub error: String,
    pub items: Vec<FailedItem>,
}

impl FailureEntry {
    pub fn now(error: impl Into<String>, items: Vec<FailedItem>) -> Self {
        FailureEntry {
            timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            error: error.into(),
            items,
        }
    }
}
