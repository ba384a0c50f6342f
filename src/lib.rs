pub mod api;
pub mod config;
pub mod enrich;
pub mod feed;
pub mod fetcher;
pub mod pipeline;
pub mod records;
pub mod retry;
pub mod store;
pub mod summarizer;
