use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use pubdigest::api::{self, AppState};
use pubdigest::config::Settings;
use pubdigest::feed;
use pubdigest::fetcher::HttpFetcher;
use pubdigest::pipeline::{self, Pipeline, RunOptions};
use pubdigest::summarizer::GeminiSummarizer;

#[derive(Parser)]
#[command(name = "pubdigest", about = "Scrape publications from a CSV feed and summarize them")]
struct Cli {
    /// TOML settings file (PUBDIGEST_* variables still override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape missing URLs, then summarize in checkpointed batches
    Run {
        /// Max URLs to consider (default: all)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Show what would be done without fetching or summarizing
        #[arg(long)]
        dry_run: bool,
        /// Only summarize records already in the store
        #[arg(long)]
        summarize_only: bool,
        /// Records per checkpoint (default from settings)
        #[arg(short, long)]
        batch_size: Option<usize>,
        /// Summarizer attempts per record (default from settings)
        #[arg(short, long)]
        retry_count: Option<u32>,
    },
    /// Scrape URLs from the feed that are not stored yet
    Scrape {
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Rebuild the processed file from stored summaries (no API calls)
    Process,
    /// Serve the HTTP API
    Serve {
        /// Listen address (default from settings)
        #[arg(short, long)]
        addr: Option<String>,
    },
    /// Show store statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;

    let result = match cli.command {
        Commands::Run { limit, dry_run, summarize_only, batch_size, retry_count } => {
            let opts = RunOptions {
                batch_size: batch_size.unwrap_or(settings.batch_size),
                max_retries: retry_count.unwrap_or(settings.retry_count),
                summarize_only,
                limit,
            };
            if dry_run {
                return dry_run_plan(&settings, &opts).await;
            }
            if settings.api_key().is_none() {
                bail!("no summarizer API key; set PUBDIGEST_GEMINI_API_KEY or GOOGLE_API_KEY");
            }

            let fetcher = HttpFetcher::new()?;
            let locators = if summarize_only {
                Vec::new()
            } else {
                let urls = feed::read_locators(fetcher.client(), &settings.csv_url).await;
                if urls.is_empty() {
                    println!("No URLs found in {}. Nothing to do.", settings.csv_url);
                    return Ok(());
                }
                urls
            };

            let mut pipeline = build_pipeline(&settings, fetcher)?;
            let report = pipeline.run(&locators, &opts).await?;
            println!(
                "Done: {}/{} records succeeded ({} summarized, {} already done, {} failed) in {} batches.",
                report.succeeded(),
                report.total,
                report.summarized,
                report.skipped,
                report.failed,
                report.batches
            );
            if report.failed > 0 {
                println!("Failed items logged to {}", pipeline.store().failures_path().display());
            }
            Ok(())
        }
        Commands::Scrape { limit } => {
            let fetcher = HttpFetcher::new()?;
            let mut locators = feed::read_locators(fetcher.client(), &settings.csv_url).await;
            if let Some(n) = limit {
                locators.truncate(n);
            }
            if locators.is_empty() {
                println!("No URLs found in {}.", settings.csv_url);
                return Ok(());
            }
            let mut pipeline = build_pipeline(&settings, fetcher)?;
            let added = pipeline.scrape(&locators).await?;
            println!("Scraped {} new pages ({} URLs in feed).", added, locators.len());
            Ok(())
        }
        Commands::Process => {
            let store = settings.store();
            let processed = pipeline::regenerate_processed(&store)?;
            if processed == 0 {
                println!("No summarized records. Run 'run' first.");
            } else {
                println!("Wrote {} records to {}", processed, store.processed_path().display());
            }
            Ok(())
        }
        Commands::Serve { addr } => {
            let addr = addr.unwrap_or_else(|| settings.listen_addr.clone());
            let pipeline = build_pipeline(&settings, HttpFetcher::new()?)?;
            api::serve(AppState::new(pipeline), &addr).await
        }
        Commands::Stats => {
            let s = pipeline::store_stats(&settings.store());
            println!("Scraped:      {}", s.scraped);
            println!("Summarized:   {}", s.summarized);
            println!("Unsummarized: {}", s.unsummarized);
            println!("Processed:    {}", s.processed);
            println!("Failures:     {} items in {} entries", s.failed_items, s.failure_entries);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn build_pipeline(settings: &Settings, fetcher: HttpFetcher) -> anyhow::Result<Pipeline> {
    let summarizer = GeminiSummarizer::new(
        settings.api_key(),
        settings.gemini_model.as_str(),
        settings.gemini_base_url.as_str(),
    )
    .context("failed to create summarizer client")?;

    Ok(Pipeline::new(
        settings.store(),
        Box::new(fetcher),
        Box::new(summarizer),
        settings.retry_policy(),
        settings.scrape_delay(),
    ))
}

async fn dry_run_plan(settings: &Settings, opts: &RunOptions) -> anyhow::Result<()> {
    let store = settings.store();
    let records = store.load_scraped();
    let summarized: HashSet<&str> = records
        .iter()
        .filter(|r| r.is_summarized())
        .map(|r| r.url.as_str())
        .collect();
    let known: HashSet<&str> = records.iter().map(|r| r.url.as_str()).collect();

    let candidates: Vec<String> = if opts.summarize_only {
        records.iter().map(|r| r.url.clone()).collect()
    } else {
        let fetcher = HttpFetcher::new()?;
        feed::read_locators(fetcher.client(), &settings.csv_url).await
    };
    let limit = opts.limit.unwrap_or(candidates.len()).min(candidates.len());
    let candidates = &candidates[..limit];

    let to_scrape = candidates.iter().filter(|u| !known.contains(u.as_str())).count();
    let to_summarize = candidates.iter().filter(|u| !summarized.contains(u.as_str())).count();

    println!("Dry run against {}", store.scraped_path().display());
    println!("  URLs considered: {}", candidates.len());
    println!("  To scrape:       {}", to_scrape);
    println!("  To summarize:    {}", to_summarize);
    println!(
        "  Batches:         {} of {}",
        to_summarize.div_ceil(opts.batch_size.max(1)),
        opts.batch_size
    );
    for url in candidates.iter().filter(|u| !summarized.contains(u.as_str())).take(10) {
        println!("    {}", truncate(url, 100));
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
