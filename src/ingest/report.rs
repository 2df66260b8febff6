//! Crawl report documents produced by the external crawler.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Report layout with items listed directly under `commands`.
pub const SINGLE_THREAD: &str = "single_thread";

/// Report layout with items grouped under `threads`.
pub const HOMEPAGE_THREADS: &str = "homepage_threads";

/// One crawler run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrawlReport {
    #[serde(default)]
    pub crawl_time: String,

    /// Selects which list holds the items
    pub source: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_url: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<CrawledCommand>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub threads: Vec<CrawledThread>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrawledCommand {
    pub content: String,
    #[serde(default)]
    pub post_time: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrawledThread {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub commands: Vec<CrawledCommand>,
}

impl CrawlReport {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        Self::from_json(&contents)
    }

    /// The items this report contributes, according to its `source`.
    ///
    /// Unknown sources contribute nothing.
    pub fn items(&self) -> Vec<&CrawledCommand> {
        match self.source.as_str() {
            SINGLE_THREAD => self.commands.iter().collect(),
            HOMEPAGE_THREADS => self
                .threads
                .iter()
                .flat_map(|thread| thread.commands.iter())
                .collect(),
            _ => Vec::new(),
        }
    }
}
