//! Rate-limited entry points for a transport layer.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::CommandPoolConfig;
use crate::engine::DistributionEngine;
use crate::error::Result;
use crate::ratelimit::{ActionClass, RateLimits};
use crate::store::{Source, Token, TokenStore};

/// Outcome of a rate-limited call.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission<T> {
    /// The call ran and produced `T`
    Admitted(T),
    /// The origin is over its limit; nothing ran
    Throttled {
        retry_after: Duration,
        message: String,
    },
}

impl<T> Admission<T> {
    pub fn is_throttled(&self) -> bool {
        matches!(self, Admission::Throttled { .. })
    }

    /// The admitted value, if any.
    pub fn admitted(self) -> Option<T> {
        match self {
            Admission::Admitted(value) => Some(value),
            Admission::Throttled { .. } => None,
        }
    }
}

/// The engine plus one limiter per action class.
pub struct CommandPool<S: TokenStore> {
    engine: Arc<DistributionEngine<S>>,
    limits: RateLimits,
}

impl<S: TokenStore> CommandPool<S> {
    pub fn new(engine: Arc<DistributionEngine<S>>, limits: RateLimits) -> Self {
        Self { engine, limits }
    }

    /// Build the engine and limiters for `store` from configuration.
    pub fn from_config(store: Arc<S>, config: &CommandPoolConfig) -> Self {
        info!(
            submit_limit = config.limits.submit.limit,
            distribute_limit = config.limits.distribute.limit,
            max_views = config.engine.max_views,
            "Creating command pool"
        );
        Self::new(
            Arc::new(DistributionEngine::new(store, config.engine.clone())),
            RateLimits::new(&config.limits),
        )
    }

    pub fn engine(&self) -> &Arc<DistributionEngine<S>> {
        &self.engine
    }

    pub fn limits(&self) -> &RateLimits {
        &self.limits
    }

    /// Submit a command on behalf of `origin`.
    pub async fn upload(&self, origin: &str, content: &str) -> Result<Admission<Token>> {
        if let Some(throttled) = self.throttle(origin, ActionClass::Submit) {
            return Ok(throttled);
        }
        let token = self.engine.submit(content, Source::User, Some(origin)).await?;
        Ok(Admission::Admitted(token))
    }

    /// Hand `origin` a random command, if any is available.
    pub async fn random(&self, origin: &str) -> Result<Admission<Option<Token>>> {
        if let Some(throttled) = self.throttle(origin, ActionClass::Distribute) {
            return Ok(throttled);
        }
        let token = self.engine.distribute(Some(origin)).await?;
        Ok(Admission::Admitted(token))
    }

    /// Remove a command reported as unusable.
    pub async fn report(&self, content: &str) -> Result<()> {
        self.engine.invalidate(content).await
    }

    /// Number of commands that can still be handed out.
    pub async fn count(&self) -> Result<u64> {
        self.engine.available_count().await
    }

    fn throttle<T>(&self, origin: &str, action: ActionClass) -> Option<Admission<T>> {
        let limiter = self.limits.limiter(action);
        if limiter.allow(origin) {
            return None;
        }
        Some(Admission::Throttled {
            retry_after: limiter.retry_after(origin).unwrap_or(limiter.window()),
            message: action.throttle_message(limiter.limit(), limiter.window()),
        })
    }
}
