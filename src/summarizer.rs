//! Generative-language summarizer.
//!
//! The controller only sees the [`Summarizer`] trait; [`GeminiSummarizer`]
//! talks to the `generateContent` REST endpoint. Failures carry enough text for
//! [`SummarizeError::class`] to tell quota problems from other errors.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::records::{StructuredSummary, Summary};
use crate::retry::{classify_error_text, ErrorClass};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// Input beyond this many characters is cut off before sending.
pub const MAX_INPUT_CHARS: usize = 15_000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const EMPTY_INPUT_SUMMARY: &str = "No content provided.";

#[derive(Debug, Error)]
pub enum SummarizeError {
    #[error("rate limited (429): {0}")]
    RateLimited(String),
    #[error("summarizer returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("summarizer request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("summarizer returned no text")]
    EmptyResponse,
    #[error("summarizer not configured: {0}")]
    Config(String),
}

impl SummarizeError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SummarizeError::RateLimited(_) => ErrorClass::RateLimited,
            SummarizeError::Config(_) => ErrorClass::Permanent,
            SummarizeError::Http { status, body } => match classify_error_text(body) {
                ErrorClass::RateLimited => ErrorClass::RateLimited,
                _ if matches!(*status, 400 | 401 | 403 | 404) => ErrorClass::Permanent,
                _ => ErrorClass::Transient,
            },
            other => classify_error_text(&other.to_string()),
        }
    }
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str) -> Result<Summary, SummarizeError>;
}

// ── Wire types ──

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'a str,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

// ── Client ──

pub struct GeminiSummarizer {
    client: reqwest::Client,
    api_key: Option<String>,
    model: String,
    base_url: String,
}

impl GeminiSummarizer {
    pub fn new(
        api_key: Option<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, SummarizeError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }
}

#[async_trait]
impl Summarizer for GeminiSummarizer {
    async fn summarize(&self, text: &str) -> Result<Summary, SummarizeError> {
        if text.trim().is_empty() {
            return Ok(Summary::Text(EMPTY_INPUT_SUMMARY.to_string()));
        }
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            SummarizeError::Config("set PUBDIGEST_GEMINI_API_KEY or GOOGLE_API_KEY".into())
        })?;

        let prompt = build_prompt(truncate_chars(text, MAX_INPUT_CHARS));
        let request = GenerateRequest {
            contents: vec![Content { role: "user", parts: vec![Part { text: &prompt }] }],
        };

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.as_u16() == 429 {
                return Err(SummarizeError::RateLimited(body));
            }
            return Err(SummarizeError::Http { status: status.as_u16(), body });
        }

        let parsed: GenerateResponse = response.json().await?;
        let output = candidate_text(parsed).ok_or(SummarizeError::EmptyResponse)?;
        debug!("Summarizer returned {} characters", output.len());
        Ok(parse_summary(&output))
    }
}

fn build_prompt(article: &str) -> String {
    format!(
        "Summarize the following scientific article in 5-7 concise bullet points.\n\
         Start each bullet with a bold heading, e.g. `* **Research Purpose:** ...`.\n\
         Cover:\n\
         - Research purpose\n\
         - Key findings\n\
         - Methods used\n\
         - Conclusions\n\
         - Any implications or future work\n\n\
         Article Text:\n{}",
        article
    )
}

fn candidate_text(response: GenerateResponse) -> Option<String> {
    let text: String = response
        .candidates
        .into_iter()
        .next()?
        .content?
        .parts
        .into_iter()
        .filter_map(|p| p.text)
        .collect();
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Cut `text` to at most `max` characters on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Model output that is a JSON object with a `summary` becomes structured;
/// anything else stays plain text.
pub fn parse_summary(output: &str) -> Summary {
    let trimmed = output.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);

    match serde_json::from_str::<StructuredSummary>(unfenced) {
        Ok(s) if !s.summary.trim().is_empty() => Summary::Structured(s),
        _ => Summary::Text(trimmed.to_string()),
    }
}
