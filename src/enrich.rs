use std::collections::BTreeMap;
use std::sync::LazyLock;

use rayon::prelude::*;
use regex::Regex;

use crate::records::{ScrapedRecord, Summary, SummaryRecord};

// `**Heading**:` at the start of a line, optionally behind a bullet or list number.
static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(?:[*+\-]|\d+\.)?[ \t]*\*\*([^*\n]+?)\*\*[ \t]*[:：]?").unwrap()
});
static AUTHOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bby\s+([A-Z][a-zA-Z]+(?:\s+[A-Z][a-zA-Z]+)*)(?:\s+et\s+al\.)?").unwrap()
});
static MARKUP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[*_#`]").unwrap());
static SENTENCE_END_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[.!?]").unwrap());
static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

const TITLE_MAX_CHARS: usize = 120;
pub const UNKNOWN_AUTHOR: &str = "Unknown";
pub const UNTITLED: &str = "Untitled";

/// Split a summary into `**Heading**: body` sections.
pub fn extract_sections(text: &str) -> BTreeMap<String, String> {
    let heads: Vec<_> = HEADING_RE.captures_iter(text).collect();
    let mut sections = BTreeMap::new();

    for (i, caps) in heads.iter().enumerate() {
        let Some(whole) = caps.get(0) else { continue };
        let title = caps[1].trim().trim_end_matches([':', '：']).trim();
        if title.is_empty() {
            continue;
        }
        let end = heads
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(text.len(), |m| m.start());
        let body = WS_RE.replace_all(text[whole.end()..end].trim(), " ");
        let body = body.trim();
        if body.is_empty() {
            continue;
        }
        sections.insert(title.to_string(), body.to_string());
    }

    sections
}

/// First sentence of the first non-empty line, markup removed.
pub fn infer_title(text: &str) -> Option<String> {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty())?;
    let plain = MARKUP_RE.replace_all(line, "");
    let plain = plain.trim_start_matches(['-', '+', ' ']);
    let sentence = SENTENCE_END_RE.split(plain).next().unwrap_or_default().trim();
    if sentence.is_empty() {
        return None;
    }
    Some(sentence.chars().take(TITLE_MAX_CHARS).collect())
}

/// Author named in a "by Firstname Lastname (et al.)" phrase.
pub fn extract_author(text: &str) -> Option<String> {
    AUTHOR_RE
        .captures(text)
        .map(|caps| caps[1].trim().to_string())
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.map(|s| s.trim()).filter(|s| !s.is_empty()).map(str::to_string)
}

/// Turn one summarized record into its served shape. `None` without a summary.
pub fn enrich_record(id: usize, record: &ScrapedRecord) -> Option<SummaryRecord> {
    let summary = record.summary.as_ref().filter(|s| !s.is_empty())?;

    let (text, title, author, sections) = match summary {
        Summary::Structured(s) => (
            s.summary.trim().to_string(),
            non_empty(s.title.as_ref()),
            non_empty(s.author.as_ref()),
            (!s.sections.is_empty()).then(|| s.sections.clone()),
        ),
        Summary::Text(t) => (t.trim().to_string(), None, None, None),
    };

    let title = title
        .or_else(|| non_empty(record.title.as_ref()))
        .or_else(|| infer_title(&text))
        .unwrap_or_else(|| UNTITLED.to_string());
    let author = author
        .or_else(|| non_empty(record.author.as_ref()))
        .or_else(|| extract_author(&text))
        .unwrap_or_else(|| UNKNOWN_AUTHOR.to_string());
    let sections = sections.unwrap_or_else(|| extract_sections(&text));

    Some(SummaryRecord {
        id,
        url: record.url.clone(),
        title,
        author,
        summary: text,
        sections,
    })
}

/// Enrich every summarized record, numbering them 1..n in store order.
pub fn enrich_all(records: &[ScrapedRecord]) -> Vec<SummaryRecord> {
    let summarized: Vec<&ScrapedRecord> = records.iter().filter(|r| r.is_summarized()).collect();
    summarized
        .par_iter()
        .enumerate()
        .filter_map(|(i, r)| enrich_record(i + 1, r))
        .collect()
}
