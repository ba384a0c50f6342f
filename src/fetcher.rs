use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::records::ArticleContent;

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const TIMEOUT: Duration = Duration::from_secs(10);

/// Elements whose paragraphs are never article text.
const SKIPPED_TAGS: &[&str] = &["script", "style", "nav", "header", "footer", "aside"];

static P_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("p").unwrap());
static H1_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h1").unwrap());
static TITLE_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("title").unwrap());
static CITATION_AUTHOR_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"meta[name="citation_author"]"#).unwrap());
static AUTHOR_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"meta[name="author"]"#).unwrap());

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<ArticleContent>;
}

/// Plain HTTP GET + HTML paragraph extraction.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(TIMEOUT)
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<ArticleContent> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("HTTP request failed for {}", url))?;

        let status = response.status();
        if !status.is_success() {
            bail!("HTTP {} for {}", status, url);
        }

        let html = response.text().await.context("Failed to read response body")?;
        let article = extract_article(&html);
        if article.content.is_empty() {
            bail!("no readable text at {}", url);
        }
        debug!("Collected {} characters from {}", article.content.len(), url);
        Ok(article)
    }
}

fn element_text(el: ElementRef) -> String {
    let raw: String = el.text().collect();
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn inside_skipped(el: &ElementRef) -> bool {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .any(|a| SKIPPED_TAGS.contains(&a.value().name()))
}

fn first_text(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .map(element_text)
        .find(|t| !t.is_empty())
}

/// Title, author and visible paragraph text of an HTML page.
pub fn extract_article(html: &str) -> ArticleContent {
    let document = Html::parse_document(html);

    let title = first_text(&document, &H1_SEL).or_else(|| first_text(&document, &TITLE_SEL));

    let citation_authors: Vec<&str> = document
        .select(&CITATION_AUTHOR_SEL)
        .filter_map(|m| m.value().attr("content"))
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .collect();
    let author = if citation_authors.is_empty() {
        document
            .select(&AUTHOR_SEL)
            .filter_map(|m| m.value().attr("content"))
            .map(str::trim)
            .find(|a| !a.is_empty())
            .map(str::to_string)
    } else {
        Some(citation_authors.join(", "))
    };

    let content = document
        .select(&P_SEL)
        .filter(|p| !inside_skipped(p))
        .map(element_text)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    ArticleContent { title, author, content }
}
