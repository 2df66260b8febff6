//! Token store abstraction and implementations.
//!
//! The engine never touches rows directly: it opens a [`StoreTransaction`],
//! locks one row matching a [`Selection`], records a view and commits. Any
//! store that can hold an exclusive lock on a single row for the duration of
//! a transaction can back the pool.

mod memory;
mod model;
#[cfg(feature = "postgres")]
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use memory::{MemoryStore, MemoryTransaction, DEFAULT_LOCK_TIMEOUT};
pub use model::{NewToken, OriginFilter, Selection, Source, Token, TokenId};
#[cfg(feature = "postgres")]
pub use postgres::{PgStore, PgTransaction};

/// Errors reported by a store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The content uniqueness constraint rejected an insert
    #[error("content already stored")]
    Duplicate,

    /// A row lock was not granted within the lock timeout
    #[error("timed out waiting for a row lock")]
    LockTimeout,

    /// A locked row disappeared before the transaction committed
    #[error("command {0} vanished")]
    Vanished(TokenId),

    /// Anything else the backend reported
    #[error("{0}")]
    Backend(String),
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The durable set of commands.
#[async_trait]
pub trait TokenStore: Send + Sync + 'static {
    /// Open a transaction. Dropping it without committing rolls it back.
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>>;

    /// Insert a command with zero views.
    async fn insert(&self, token: NewToken) -> StoreResult<Token>;

    /// Delete the command with exactly this content; returns rows deleted.
    async fn delete_by_content(&self, content: &str) -> StoreResult<u64>;

    /// Count commands with fewer than `max_views` views.
    async fn count_available(&self, max_views: u32) -> StoreResult<u64>;

    /// Delete commands from `source` created before `cutoff`.
    async fn delete_created_before(
        &self,
        source: Source,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<u64>;

    /// Delete every command.
    async fn delete_all(&self) -> StoreResult<u64>;
}

/// A unit of work holding exclusive row locks until commit or drop.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Lock one row matching `selection`, chosen uniformly at random.
    ///
    /// Waits while the chosen row is locked by another transaction and fails
    /// with [`StoreError::LockTimeout`] when the wait exceeds the store's lock
    /// timeout. Returns `None` when nothing matches.
    async fn lock_random(&mut self, selection: &Selection) -> StoreResult<Option<Token>>;

    /// Increment the view count of a row this transaction has locked.
    async fn record_view(&mut self, id: TokenId) -> StoreResult<Token>;

    /// Make every change of this transaction visible and release its locks.
    async fn commit(&mut self) -> StoreResult<()>;
}
