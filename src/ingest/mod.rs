//! Ingestion of crawl reports into the pool.
//!
//! The crawler itself runs elsewhere and leaves a JSON report on disk. Each
//! item in the report is submitted as a crawler command; duplicates and
//! rejected items are counted, never fatal.

mod report;

pub use report::{CrawlReport, CrawledCommand, CrawledThread, HOMEPAGE_THREADS, SINGLE_THREAD};

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::FeedConfig;
use crate::engine::DistributionEngine;
use crate::error::{PoolError, Result};
use crate::store::{Source, TokenStore};

/// Characters of content shown when an item fails.
const PREVIEW_CHARS: usize = 30;

/// Outcome of ingesting one report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub total: u64,
    pub saved: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub failed: u64,
}

/// Submit every item of `report` as a crawler command.
pub async fn ingest_report<S: TokenStore>(
    engine: &DistributionEngine<S>,
    report: &CrawlReport,
) -> IngestSummary {
    let mut summary = IngestSummary::default();

    for item in report.items() {
        summary.total += 1;
        match engine.submit(&item.content, Source::Crawler, None).await {
            Ok(_) => summary.saved += 1,
            Err(PoolError::Duplicate) => summary.duplicates += 1,
            Err(PoolError::Validation(_)) => summary.rejected += 1,
            Err(err) => {
                summary.failed += 1;
                let preview: String = item.content.chars().take(PREVIEW_CHARS).collect();
                warn!(content = %preview, error = %err, "Failed to ingest command");
            }
        }
    }

    info!(
        source = %report.source,
        crawl_time = %report.crawl_time,
        total = summary.total,
        saved = summary.saved,
        duplicates = summary.duplicates,
        rejected = summary.rejected,
        failed = summary.failed,
        "Ingested crawl report"
    );
    summary
}

/// Read a report from `path` and ingest it.
pub async fn ingest_file<S: TokenStore>(
    engine: &DistributionEngine<S>,
    path: &Path,
) -> Result<IngestSummary> {
    let report = CrawlReport::from_file(path).await?;
    Ok(ingest_report(engine, &report).await)
}

/// Re-ingest the feed's report file on its interval until `cancel` fires.
///
/// A missing or malformed file is logged and retried on the next tick.
pub fn spawn_feed<S: TokenStore>(
    engine: Arc<DistributionEngine<S>>,
    feed: FeedConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            feed = %feed.name,
            path = %feed.path.display(),
            every = ?feed.interval(),
            "Starting ingestion feed"
        );

        let delay = feed.startup_delay();
        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => { return; }
            }
        }

        let mut tick = tokio::time::interval(feed.interval());
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(err) = ingest_file(&engine, &feed.path).await {
                        warn!(feed = %feed.name, error = %err, "Ingestion feed run failed");
                    }
                }
                _ = cancel.cancelled() => {
                    break;
                }
            }
        }

        info!(feed = %feed.name, "Ingestion feed stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::store::MemoryStore;
    use std::io::Write;
    use std::time::Duration;

    fn engine() -> Arc<DistributionEngine<MemoryStore>> {
        Arc::new(DistributionEngine::new(
            Arc::new(MemoryStore::new()),
            EngineConfig::default(),
        ))
    }

    fn write_report(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    const REPORT: &str = r#"{
        "crawl_time": "2026-10-16 12:00:00",
        "source": "homepage_threads",
        "threads": [
            {"title": "a", "url": "u1", "commands": [
                {"content": "crawled command one"},
                {"content": "crawled command one"},
                {"content": "short"}
            ]},
            {"title": "b", "url": "u2", "commands": [
                {"content": "see https://example.com now"},
                {"content": "crawled command two"}
            ]}
        ]
    }"#;

    #[tokio::test]
    async fn test_ingest_counts_every_outcome() {
        let engine = engine();
        let report = CrawlReport::from_json(REPORT).unwrap();

        let summary = ingest_report(&engine, &report).await;
        assert_eq!(
            summary,
            IngestSummary {
                total: 5,
                saved: 2,
                duplicates: 1,
                rejected: 2,
                failed: 0,
            }
        );

        let stored = engine.store().snapshot();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|t| t.source == Source::Crawler && t.origin_tag.is_none()));
    }

    #[tokio::test]
    async fn test_reingesting_same_file_only_counts_duplicates() {
        let engine = engine();
        let file = write_report(REPORT);

        let first = ingest_file(&engine, file.path()).await.unwrap();
        let second = ingest_file(&engine, file.path()).await.unwrap();

        assert_eq!(first.saved, 2);
        assert_eq!(second.saved, 0);
        assert_eq!(second.duplicates, 3);
        assert_eq!(engine.store().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let engine = engine();
        let dir = tempfile::tempdir().unwrap();

        let err = ingest_file(&engine, &dir.path().join("absent.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Io(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_runs_until_cancelled() {
        let engine = engine();
        let file = write_report(
            r#"{"source": "single_thread", "commands": [{"content": "crawled feed command"}]}"#,
        );

        let cancel = CancellationToken::new();
        let handle = spawn_feed(
            engine.clone(),
            FeedConfig {
                name: "single".into(),
                path: file.path().to_path_buf(),
                interval_secs: 1800,
                startup_delay_secs: 10,
            },
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(engine.store().len(), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(engine.store().len(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
