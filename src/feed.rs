use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("failed to fetch CSV feed {url}: {source}")]
    Fetch { url: String, source: reqwest::Error },
    #[error("CSV feed {url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("failed to parse CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("no URL column found in CSV; columns: {0:?}")]
    NoLocatorColumn(Vec<String>),
}

/// Download the CSV feed and return its locators in file order.
pub async fn fetch_locators(client: &reqwest::Client, csv_url: &str) -> Result<Vec<String>, FeedError> {
    info!("Reading URLs from CSV: {}", csv_url);
    let fetch_err = |source: reqwest::Error| FeedError::Fetch { url: csv_url.to_string(), source };

    let response = client.get(csv_url).send().await.map_err(fetch_err)?;
    let status = response.status();
    if !status.is_success() {
        return Err(FeedError::Status { url: csv_url.to_string(), status: status.as_u16() });
    }
    let text = response.text().await.map_err(fetch_err)?;
    parse_locators(&text)
}

/// Like [`fetch_locators`], but a feed failure is logged and yields no locators.
pub async fn read_locators(client: &reqwest::Client, csv_url: &str) -> Vec<String> {
    match fetch_locators(client, csv_url).await {
        Ok(urls) => urls,
        Err(e) => {
            error!("Failed to read CSV feed: {}", e);
            Vec::new()
        }
    }
}

/// Pick the first column whose header mentions "url" or "link" and collect
/// its non-empty cells.
pub fn parse_locators(text: &str) -> Result<Vec<String>, FeedError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let column = headers
        .iter()
        .position(|h| {
            let h = h.to_lowercase();
            h.contains("url") || h.contains("link")
        })
        .ok_or_else(|| FeedError::NoLocatorColumn(headers.clone()))?;

    let mut urls = Vec::new();
    for row in reader.records() {
        let row = row?;
        if let Some(cell) = row.get(column).map(str::trim).filter(|c| !c.is_empty()) {
            urls.push(cell.to_string());
        }
    }

    info!("Found {} URLs in column '{}'", urls.len(), headers[column]);
    Ok(urls)
}
