//! The distribution engine: admits new commands and hands out existing ones.

mod validate;

pub use validate::validate_content;

use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::{PoolError, Result};
use crate::store::{NewToken, Selection, Source, Token, TokenStore};

/// Hands out each command to at most `max_views` requests.
///
/// Every distribution runs in one store transaction: lock a random eligible
/// row, record the view, commit. Two concurrent distributions can never
/// count the same view because the second one waits on the row lock and
/// re-evaluates the row after the first commits.
pub struct DistributionEngine<S: TokenStore> {
    store: Arc<S>,
    config: EngineConfig,
}

impl<S: TokenStore> DistributionEngine<S> {
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate and store a new command.
    ///
    /// `origin` is kept only for [`Source::User`] submissions.
    #[instrument(skip(self, content, origin), fields(source = %source))]
    pub async fn submit(&self, content: &str, source: Source, origin: Option<&str>) -> Result<Token> {
        let content = validate_content(content, &self.config).map_err(|err| {
            debug!(error = %err, "Rejected submission");
            err
        })?;

        let new = match source {
            Source::User => NewToken::user(content, origin.map(str::to_string)),
            Source::Crawler => NewToken::crawler(content),
        };

        match self.store.insert(new).await {
            Ok(token) => {
                info!(id = %token.id, source = %token.source, "Stored command");
                Ok(token)
            }
            Err(err) => {
                let err = PoolError::from(err);
                match &err {
                    PoolError::Duplicate => debug!("Duplicate submission"),
                    other => error!(error = %other, "Failed to store command"),
                }
                Err(err)
            }
        }
    }

    /// Hand out one available command, preferring other users' submissions.
    ///
    /// Returns `Ok(None)` when nothing is eligible. Contention failures are
    /// retried with doubling backoff up to `contention_retries` times.
    #[instrument(skip(self))]
    pub async fn distribute(&self, origin: Option<&str>) -> Result<Option<Token>> {
        let mut backoff = self.config.retry_backoff();
        let mut retries = 0;

        loop {
            match self.distribute_once(origin).await {
                Err(err) if err.is_retryable() && retries < self.config.contention_retries => {
                    retries += 1;
                    warn!(error = %err, retry = retries, "Distribution contended, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(err) => {
                    error!(error = %err, "Distribution failed");
                    return Err(err);
                }
                Ok(picked) => return Ok(picked),
            }
        }
    }

    async fn distribute_once(&self, origin: Option<&str>) -> Result<Option<Token>> {
        let max_views = self.config.max_views;
        let mut tx = self.store.begin().await?;

        let mut picked = tx
            .lock_random(&Selection::user_excluding(origin, max_views))
            .await?;

        if picked.is_none() {
            picked = tx.lock_random(&Selection::crawler(max_views)).await?;
        }

        if picked.is_none() && self.config.offer_own_as_last_resort {
            if let Some(origin) = origin.filter(|o| !o.is_empty()) {
                picked = tx.lock_random(&Selection::user_from(origin, max_views)).await?;
            }
        }

        let Some(token) = picked else {
            debug!("No command available");
            return Ok(None);
        };

        let viewed = tx.record_view(token.id).await?;
        tx.commit().await?;

        debug!(
            id = %viewed.id,
            source = %viewed.source,
            views = viewed.view_count,
            "Distributed command"
        );
        Ok(Some(viewed))
    }

    /// Remove a command reported as unusable.
    #[instrument(skip(self, content))]
    pub async fn invalidate(&self, content: &str) -> Result<()> {
        let content = content.trim();
        if content.is_empty() {
            return Err(PoolError::Validation("content must not be empty".into()));
        }

        let deleted = self.store.delete_by_content(content).await?;
        if deleted == 0 {
            return Err(PoolError::NotFound);
        }

        info!(deleted = deleted, "Invalidated command");
        Ok(())
    }

    /// Number of commands that can still be handed out.
    pub async fn available_count(&self) -> Result<u64> {
        Ok(self.store.count_available(self.config.max_views).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreError, StoreResult, StoreTransaction, TokenId};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_test::assert_ok;

    fn engine_with(config: EngineConfig) -> DistributionEngine<MemoryStore> {
        DistributionEngine::new(
            Arc::new(MemoryStore::with_lock_timeout(Duration::from_millis(100))),
            config,
        )
    }

    fn engine() -> DistributionEngine<MemoryStore> {
        engine_with(EngineConfig::default())
    }

    #[tokio::test]
    async fn test_submit_trims_and_stores() {
        let engine = engine();
        let token = engine
            .submit("  shared command text  ", Source::User, Some("A"))
            .await
            .unwrap();

        assert_eq!(token.content, "shared command text");
        assert_eq!(token.view_count, 0);
        assert_eq!(token.origin_tag.as_deref(), Some("A"));
        assert_eq!(engine.available_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_submit_validation_errors() {
        let engine = engine();

        let err = engine.submit("too short", Source::User, None).await.unwrap_err();
        assert!(matches!(err, PoolError::Validation(_)));

        let err = engine
            .submit("visit http://example.com now", Source::Crawler, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Validation(_)));

        assert_eq!(engine.store().len(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_submission() {
        let engine = engine();

        assert_ok!(engine.submit("shared command text", Source::User, Some("A")).await);
        let err = engine
            .submit("shared command text ", Source::Crawler, None)
            .await
            .unwrap_err();

        assert!(matches!(err, PoolError::Duplicate));
        assert_eq!(engine.store().len(), 1);
    }

    #[tokio::test]
    async fn test_crawler_submission_drops_origin() {
        let engine = engine();
        let token = engine
            .submit("crawled command text", Source::Crawler, Some("A"))
            .await
            .unwrap();
        assert_eq!(token.origin_tag, None);
    }

    #[tokio::test]
    async fn test_distribute_empty_pool() {
        let engine = engine();
        assert_eq!(engine.distribute(Some("A")).await.unwrap(), None);
        assert_eq!(engine.distribute(None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_distribute_exhausts_after_three_views() {
        let engine = engine();
        engine.submit("shared command text", Source::User, Some("A")).await.unwrap();

        for expected in 1..=3 {
            let token = engine.distribute(Some("B")).await.unwrap().unwrap();
            assert_eq!(token.view_count, expected);
        }

        assert_eq!(engine.distribute(Some("B")).await.unwrap(), None);
        assert_eq!(engine.available_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_distribute_prefers_user_submissions() {
        let engine = engine();
        engine.submit("crawled command text", Source::Crawler, None).await.unwrap();
        engine.submit("user command text", Source::User, Some("A")).await.unwrap();

        for _ in 0..3 {
            let token = engine.distribute(Some("B")).await.unwrap().unwrap();
            assert_eq!(token.source, Source::User);
        }

        let token = engine.distribute(Some("B")).await.unwrap().unwrap();
        assert_eq!(token.source, Source::Crawler);
    }

    #[tokio::test]
    async fn test_distribute_never_returns_own_submission() {
        let engine = engine();
        engine.submit("my own command text", Source::User, Some("A")).await.unwrap();
        engine.submit("another user command", Source::User, Some("B")).await.unwrap();
        engine.submit("crawled command text", Source::Crawler, None).await.unwrap();

        // B's command (3 views) then the crawler command (3 views)
        for _ in 0..6 {
            let token = engine.distribute(Some("A")).await.unwrap().unwrap();
            assert_ne!(token.origin_tag.as_deref(), Some("A"));
        }

        assert_eq!(engine.distribute(Some("A")).await.unwrap(), None);
        assert_eq!(engine.available_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_own_submission_offered_as_last_resort_when_enabled() {
        let engine = engine_with(EngineConfig {
            offer_own_as_last_resort: true,
            ..EngineConfig::default()
        });
        engine.submit("my own command text", Source::User, Some("A")).await.unwrap();

        let token = engine.distribute(Some("A")).await.unwrap().unwrap();
        assert_eq!(token.origin_tag.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_distribution_without_origin_sees_every_user_submission() {
        let engine = engine();
        engine.submit("my own command text", Source::User, Some("A")).await.unwrap();

        assert!(engine.distribute(None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_selection_is_spread_across_candidates() {
        let engine = engine_with(EngineConfig {
            max_views: 1000,
            ..EngineConfig::default()
        });
        for i in 0..4 {
            engine
                .submit(&format!("shared command number {}", i), Source::Crawler, None)
                .await
                .unwrap();
        }

        let mut seen: HashMap<String, u32> = HashMap::new();
        for _ in 0..400 {
            let token = engine.distribute(None).await.unwrap().unwrap();
            *seen.entry(token.content).or_default() += 1;
        }

        assert_eq!(seen.len(), 4);
        assert!(seen.values().all(|&n| n >= 40), "skewed selection: {:?}", seen);
    }

    #[tokio::test]
    async fn test_contention_surfaces_after_retries() {
        let engine = engine_with(EngineConfig {
            contention_retries: 2,
            retry_backoff_ms: 1,
            ..EngineConfig::default()
        });
        engine.submit("crawled command text", Source::Crawler, None).await.unwrap();

        let mut holder = engine.store().begin().await.unwrap();
        holder
            .lock_random(&Selection::crawler(3))
            .await
            .unwrap()
            .unwrap();

        let err = engine.distribute(None).await.unwrap_err();
        assert!(matches!(err, PoolError::Contention(_)));

        drop(holder);
        let token = engine.distribute(None).await.unwrap().unwrap();
        assert_eq!(token.view_count, 1);
    }

    /// A store whose locked row always disappears before the view is recorded.
    #[derive(Default)]
    struct VanishingStore {
        attempts: AtomicUsize,
    }

    struct VanishingTransaction;

    #[async_trait]
    impl TokenStore for VanishingStore {
        async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(VanishingTransaction))
        }

        async fn insert(&self, _token: NewToken) -> StoreResult<Token> {
            Err(StoreError::Backend("read-only".into()))
        }

        async fn delete_by_content(&self, _content: &str) -> StoreResult<u64> {
            Ok(0)
        }

        async fn count_available(&self, _max_views: u32) -> StoreResult<u64> {
            Ok(1)
        }

        async fn delete_created_before(
            &self,
            _source: Source,
            _cutoff: DateTime<Utc>,
        ) -> StoreResult<u64> {
            Ok(0)
        }

        async fn delete_all(&self) -> StoreResult<u64> {
            Ok(0)
        }
    }

    #[async_trait]
    impl StoreTransaction for VanishingTransaction {
        async fn lock_random(&mut self, selection: &Selection) -> StoreResult<Option<Token>> {
            Ok(Some(Token {
                id: TokenId::new(),
                content: "about to be swept away".into(),
                source: selection.source,
                origin_tag: None,
                view_count: 0,
                created_at: Utc::now(),
            }))
        }

        async fn record_view(&mut self, id: TokenId) -> StoreResult<Token> {
            Err(StoreError::Vanished(id))
        }

        async fn commit(&mut self) -> StoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_vanished_row_is_contention_after_retries() {
        let engine = DistributionEngine::new(
            Arc::new(VanishingStore::default()),
            EngineConfig {
                contention_retries: 2,
                retry_backoff_ms: 1,
                ..EngineConfig::default()
            },
        );

        let err = engine.distribute(Some("A")).await.unwrap_err();
        assert!(matches!(err, PoolError::Contention(_)));
        assert!(err.is_retryable());
        assert_eq!(engine.store().attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_invalidate() {
        let engine = engine();
        engine.submit("shared command text", Source::User, Some("A")).await.unwrap();

        assert_ok!(engine.invalidate("  shared command text ").await);
        assert!(matches!(
            engine.invalidate("shared command text").await,
            Err(PoolError::NotFound)
        ));
        assert!(matches!(engine.invalidate("   ").await, Err(PoolError::Validation(_))));
        assert_eq!(engine.store().len(), 0);
    }
}
