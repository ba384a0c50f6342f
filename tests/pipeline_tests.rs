mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use pubdigest::feed::parse_locators;
use pubdigest::pipeline::{store_stats, RunOptions};
use pubdigest::records::{ArticleContent, ScrapedRecord, SummaryRecord};
use pubdigest::store::RecordStore;
use pubdigest::summarizer::SummarizeError;
use tempfile::TempDir;

fn processed_urls(store: &RecordStore) -> Vec<String> {
    store.load_processed().into_iter().map(|r| r.url).collect()
}

#[tokio::test(start_paused = true)]
async fn csv_rows_become_numbered_summaries_in_order() {
    let dir = TempDir::new().unwrap();
    let store = RecordStore::new(dir.path());
    let csv = format!("Title,Link\nA,{}\nB,{}\nC,{}\n", url(1), url(2), url(3));
    let locators = parse_locators(&csv).unwrap();

    let mut p = pipeline(&store, FakeFetcher::new(&locators), ScriptedSummarizer::echo());
    let report = p.run(&locators, &opts(2)).await.unwrap();

    assert_eq!(report.total, 3);
    assert_eq!(report.summarized, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(report.batches, 2);

    let processed = store.load_processed();
    assert_eq!(processed.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(processed_urls(&store), locators);
    assert_eq!(processed[0].title, format!("Title of {}", url(1)));
    assert_eq!(processed[0].author, "Jane Doe");
    assert!(processed[0].sections.contains_key("Key Findings"));
    assert!(store.load_failures().is_empty());
}

#[tokio::test(start_paused = true)]
async fn one_failing_item_does_not_abort_its_batch() {
    let dir = TempDir::new().unwrap();
    let store = RecordStore::new(dir.path());
    let locators = urls(10);
    let bad = body_for(&url(5));

    let summarizer = ScriptedSummarizer::new(move |_, text| {
        if text == bad {
            Reply::Fail(SummarizeError::Http { status: 500, body: "internal".into() })
        } else {
            Reply::Summary(bullets(text))
        }
    });
    let calls = summarizer.calls.clone();
    let mut p = pipeline(&store, FakeFetcher::new(&locators), summarizer);
    let report = p.run(&locators, &opts(3)).await.unwrap();

    assert_eq!(report.summarized, 9);
    assert_eq!(report.failed, 1);
    // 9 successes plus three attempts at the failing item.
    assert_eq!(calls.load(Ordering::SeqCst), 12);

    let processed = store.load_processed();
    assert_eq!(processed.len(), 9);
    assert!(processed.iter().all(|r| r.url != url(5)));

    let failures = store.load_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].items.len(), 1);
    assert_eq!(failures[0].items[0].url, url(5));
    assert!(failures[0].error.starts_with("Failed in batch 2"));
}

#[tokio::test(start_paused = true)]
async fn rerun_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = RecordStore::new(dir.path());
    let locators = urls(4);

    let first = ScriptedSummarizer::echo();
    let mut p = pipeline(&store, FakeFetcher::new(&locators), first);
    p.run(&locators, &opts(3)).await.unwrap();
    let before: Vec<SummaryRecord> = store.load_processed();

    let second = ScriptedSummarizer::echo();
    let calls = second.calls.clone();
    let fetcher = FakeFetcher::new(&locators);
    let fetches = fetcher.calls.clone();
    let mut p = pipeline(&store, fetcher, second);
    let report = p.run(&locators, &opts(3)).await.unwrap();

    assert_eq!(report.skipped, 4);
    assert_eq!(report.summarized, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(fetches.load(Ordering::SeqCst), 0);
    assert_eq!(store.load_processed(), before);
    assert_eq!(store.load_scraped().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn interrupted_run_keeps_completed_batches() {
    let dir = TempDir::new().unwrap();
    let store = RecordStore::new(dir.path());
    let locators = urls(5);

    // Calls 0 and 1 make up batch 1; the first call of batch 2 never returns.
    let summarizer = ScriptedSummarizer::new(|call, text| {
        if call < 2 {
            Reply::Summary(bullets(text))
        } else {
            Reply::Hang
        }
    });
    let mut p = pipeline(&store, FakeFetcher::new(&locators), summarizer);
    let run = tokio::time::timeout(Duration::from_secs(3600), p.run(&locators, &opts(2))).await;
    assert!(run.is_err(), "run should still be stuck in batch 2");
    drop(p);

    assert_eq!(processed_urls(&store), vec![url(1), url(2)]);
    let scraped = store.load_scraped();
    assert_eq!(scraped.len(), 5);
    assert_eq!(scraped.iter().filter(|r| r.is_summarized()).count(), 2);

    // A fresh run resumes where the checkpoint left off.
    let resumed = ScriptedSummarizer::echo();
    let calls = resumed.calls.clone();
    let mut p = pipeline(&store, FakeFetcher::new(&locators), resumed);
    let report = p.run(&locators, &opts(2)).await.unwrap();
    assert_eq!(report.skipped, 2);
    assert_eq!(report.summarized, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(processed_urls(&store), locators);
}

#[tokio::test(start_paused = true)]
async fn quota_errors_are_retried_until_success() {
    let dir = TempDir::new().unwrap();
    let store = RecordStore::new(dir.path());
    let locators = urls(1);

    let summarizer = ScriptedSummarizer::new(|call, text| {
        if call < 2 {
            Reply::Fail(SummarizeError::RateLimited("RESOURCE_EXHAUSTED".into()))
        } else {
            Reply::Summary(bullets(text))
        }
    });
    let mut p = pipeline(&store, FakeFetcher::new(&locators), summarizer);

    let started = tokio::time::Instant::now();
    let report = p.run(&locators, &opts(1)).await.unwrap();

    assert_eq!(report.summarized, 1);
    assert!(store.load_failures().is_empty());
    // Backoffs of 1s and 2s, each at least the 1s minimum spacing.
    assert!(started.elapsed() >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn permanent_errors_fail_fast() {
    let dir = TempDir::new().unwrap();
    let store = RecordStore::new(dir.path());
    let locators = urls(2);

    let summarizer =
        ScriptedSummarizer::new(|_, _| Reply::Fail(SummarizeError::Config("no API key".into())));
    let calls = summarizer.calls.clone();
    let mut p = pipeline(&store, FakeFetcher::new(&locators), summarizer);
    let report = p.run(&locators, &opts(5)).await.unwrap();

    assert_eq!(report.failed, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let failures = store.load_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].items.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn unreachable_pages_are_skipped() {
    let dir = TempDir::new().unwrap();
    let store = RecordStore::new(dir.path());
    let locators = urls(3);

    let fetcher = FakeFetcher::new(&locators).without(&url(2));
    let mut p = pipeline(&store, fetcher, ScriptedSummarizer::echo());
    let report = p.run(&locators, &opts(10)).await.unwrap();

    assert_eq!(report.total, 2);
    assert_eq!(processed_urls(&store), vec![url(1), url(3)]);
    assert_eq!(store.load_processed().iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn summarize_only_works_from_the_store() {
    let dir = TempDir::new().unwrap();
    let store = RecordStore::new(dir.path());
    let stored: Vec<ScrapedRecord> = urls(3)
        .iter()
        .map(|u| {
            ScrapedRecord::from_content(
                u,
                ArticleContent { title: None, author: None, content: body_for(u) },
            )
        })
        .collect();
    store.save_scraped(&stored).unwrap();

    let fetcher = FakeFetcher::new(&[]);
    let fetches = fetcher.calls.clone();
    let mut p = pipeline(&store, fetcher, ScriptedSummarizer::echo());
    let options = RunOptions { summarize_only: true, limit: Some(2), ..opts(5) };
    let report = p.run(&[], &options).await.unwrap();

    assert_eq!(report.summarized, 2);
    assert_eq!(fetches.load(Ordering::SeqCst), 0);
    assert_eq!(processed_urls(&store), vec![url(1), url(2)]);

    let stats = store_stats(&store);
    assert_eq!(stats.scraped, 3);
    assert_eq!(stats.summarized, 2);
    assert_eq!(stats.unsummarized, 1);
}

#[tokio::test(start_paused = true)]
async fn records_without_content_are_logged_as_failures() {
    let dir = TempDir::new().unwrap();
    let store = RecordStore::new(dir.path());
    let empty = ScrapedRecord::from_content(
        &url(1),
        ArticleContent { title: None, author: None, content: String::new() },
    );
    store.save_scraped(&[empty]).unwrap();

    let summarizer = ScriptedSummarizer::echo();
    let calls = summarizer.calls.clone();
    let mut p = pipeline(&store, FakeFetcher::new(&[]), summarizer);
    let options = RunOptions { summarize_only: true, ..opts(5) };
    let report = p.run(&[], &options).await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.load_failures()[0].items[0].error, "no scraped content");
}

#[tokio::test(start_paused = true)]
async fn zero_batch_size_or_retries_is_rejected() {
    let dir = TempDir::new().unwrap();
    let store = RecordStore::new(dir.path());
    let mut p = pipeline(&store, FakeFetcher::new(&[]), ScriptedSummarizer::echo());

    assert!(p.run(&urls(1), &opts(0)).await.is_err());
    let no_retries = RunOptions { max_retries: 0, ..opts(1) };
    assert!(p.run(&urls(1), &no_retries).await.is_err());
    assert!(!store.scraped_path().exists());
}

#[tokio::test(start_paused = true)]
async fn limit_truncates_the_locator_list() {
    let dir = TempDir::new().unwrap();
    let store = RecordStore::new(dir.path());
    let locators = urls(5);

    let mut p = pipeline(&store, FakeFetcher::new(&locators), ScriptedSummarizer::echo());
    let options = RunOptions { limit: Some(2), ..opts(10) };
    let report = p.run(&locators, &options).await.unwrap();

    assert_eq!(report.total, 2);
    assert_eq!(store.load_scraped().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn summarize_url_caches_results() {
    let dir = TempDir::new().unwrap();
    let store = RecordStore::new(dir.path());
    let locators = urls(1);

    let summarizer = ScriptedSummarizer::echo();
    let calls = summarizer.calls.clone();
    let mut p = pipeline(&store, FakeFetcher::new(&locators), summarizer);

    let first = p.summarize_url(&url(1)).await.unwrap();
    assert_eq!(first.id, 1);
    assert_eq!(first.url, url(1));

    let again = p.summarize_url(&url(1)).await.unwrap();
    assert_eq!(again, first);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.load_processed().len(), 1);
    assert!(store.load_scraped()[0].is_summarized());
}

#[tokio::test(start_paused = true)]
async fn process_rebuilds_without_summarizing() {
    let dir = TempDir::new().unwrap();
    let store = RecordStore::new(dir.path());
    let locators = urls(2);

    let mut p = pipeline(&store, FakeFetcher::new(&locators), ScriptedSummarizer::echo());
    p.run(&locators, &opts(5)).await.unwrap();
    std::fs::remove_file(store.processed_path()).unwrap();

    assert_eq!(p.process().unwrap(), 2);
    assert_eq!(processed_urls(&store), locators);
}

#[tokio::test(start_paused = true)]
async fn checkpoints_keep_entries_of_unknown_shape() {
    let dir = TempDir::new().unwrap();
    let store = RecordStore::new(dir.path());
    let keep = url(1);
    let odd = serde_json::json!({
        "url": url(2),
        "content": "body",
        "summary": {"title": "T", "sections": ["a"]}
    });
    std::fs::write(
        store.scraped_path(),
        serde_json::json!([{"url": keep, "content": body_for(&keep)}, odd]).to_string(),
    )
    .unwrap();

    let mut p = pipeline(&store, FakeFetcher::new(&[]), ScriptedSummarizer::echo());
    let options = RunOptions { summarize_only: true, ..opts(1) };
    p.run(&[], &options).await.unwrap();
    p.run(&[], &options).await.unwrap();

    let raw: Vec<serde_json::Value> =
        serde_json::from_str(&std::fs::read_to_string(store.scraped_path()).unwrap()).unwrap();
    assert_eq!(raw.len(), 2);
    assert!(raw.contains(&odd));
    assert_eq!(processed_urls(&store), vec![keep]);
}
