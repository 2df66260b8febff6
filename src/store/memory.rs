//! In-memory token store with row-level locking.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::seq::IteratorRandom;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use super::{
    NewToken, Selection, Source, StoreError, StoreResult, StoreTransaction, Token, TokenId,
    TokenStore,
};

/// Default time a transaction or delete waits for a row lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

struct Row {
    token: Token,
    /// Transaction currently holding the exclusive lock
    locked_by: Option<u64>,
}

#[derive(Default)]
struct Table {
    rows: HashMap<TokenId, Row>,
    /// Uniqueness index on content
    by_content: HashMap<String, TokenId>,
}

impl Table {
    fn remove(&mut self, id: &TokenId) -> bool {
        match self.rows.remove(id) {
            Some(row) => {
                self.by_content.remove(&row.token.content);
                true
            }
            None => false,
        }
    }

    /// Clear every lock held by `tx`.
    fn release(&mut self, tx: u64, held: &[TokenId]) {
        for id in held {
            if let Some(row) = self.rows.get_mut(id) {
                if row.locked_by == Some(tx) {
                    row.locked_by = None;
                }
            }
        }
    }
}

struct Shared {
    table: Mutex<Table>,
    /// Signalled whenever a transaction releases its locks
    released: Notify,
    next_tx: AtomicU64,
    lock_timeout: Duration,
}

impl Shared {
    /// Retry `attempt` until it yields a value, sleeping until the next lock
    /// release between tries. Gives up with [`StoreError::LockTimeout`] at
    /// `deadline`.
    async fn wait_for_release<T, F>(&self, deadline: Instant, mut attempt: F) -> StoreResult<T>
    where
        F: FnMut(&mut Table) -> Option<T> + Send,
    {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Register before inspecting the table so a release in between is not missed
            notified.as_mut().enable();

            let outcome = {
                let mut table = self.table.lock();
                attempt(&mut table)
            };
            if let Some(value) = outcome {
                return Ok(value);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(StoreError::LockTimeout);
            }
        }
    }
}

/// A [`TokenStore`] kept in process memory.
///
/// Each row records which transaction holds its lock. Transactions buffer
/// their view increments and apply them on commit; deletes wait for locked
/// rows to be released, like row-locking deletes in a relational store.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                table: Mutex::new(Table::default()),
                released: Notify::new(),
                next_tx: AtomicU64::new(1),
                lock_timeout,
            }),
        }
    }

    /// Committed state of one command.
    pub fn get(&self, id: TokenId) -> Option<Token> {
        self.shared.table.lock().rows.get(&id).map(|row| row.token.clone())
    }

    /// Committed state of every command.
    pub fn snapshot(&self) -> Vec<Token> {
        self.shared
            .table
            .lock()
            .rows
            .values()
            .map(|row| row.token.clone())
            .collect()
    }

    /// Number of stored commands.
    pub fn len(&self) -> usize {
        self.shared.table.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delete unlocked rows matching `predicate`, waiting for locked ones.
    async fn delete_where<P>(&self, predicate: P) -> StoreResult<u64>
    where
        P: Fn(&Token) -> bool + Send + Sync,
    {
        let deadline = Instant::now() + self.shared.lock_timeout;
        let mut deleted = 0u64;

        self.shared
            .wait_for_release(deadline, |table| {
                let matching: Vec<(TokenId, bool)> = table
                    .rows
                    .values()
                    .filter(|row| predicate(&row.token))
                    .map(|row| (row.token.id, row.locked_by.is_some()))
                    .collect();

                let mut blocked = false;
                for (id, locked) in matching {
                    if locked {
                        blocked = true;
                    } else if table.remove(&id) {
                        deleted += 1;
                    }
                }

                if blocked {
                    None
                } else {
                    Some(())
                }
            })
            .await?;

        Ok(deleted)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        let id = self.shared.next_tx.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            id,
            held: Vec::new(),
            views: HashMap::new(),
            finished: false,
        }))
    }

    async fn insert(&self, new: NewToken) -> StoreResult<Token> {
        let mut table = self.shared.table.lock();
        if table.by_content.contains_key(&new.content) {
            return Err(StoreError::Duplicate);
        }

        let token = Token {
            id: TokenId::new(),
            content: new.content,
            source: new.source,
            origin_tag: new.origin_tag,
            view_count: 0,
            created_at: new.created_at,
        };

        table.by_content.insert(token.content.clone(), token.id);
        table.rows.insert(
            token.id,
            Row {
                token: token.clone(),
                locked_by: None,
            },
        );

        Ok(token)
    }

    async fn delete_by_content(&self, content: &str) -> StoreResult<u64> {
        self.delete_where(|token| token.content == content).await
    }

    async fn count_available(&self, max_views: u32) -> StoreResult<u64> {
        let table = self.shared.table.lock();
        Ok(table
            .rows
            .values()
            .filter(|row| row.token.is_available(max_views))
            .count() as u64)
    }

    async fn delete_created_before(
        &self,
        source: Source,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<u64> {
        self.delete_where(|token| token.source == source && token.created_at < cutoff)
            .await
    }

    async fn delete_all(&self) -> StoreResult<u64> {
        self.delete_where(|_| true).await
    }
}

/// A transaction against a [`MemoryStore`].
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    id: u64,
    /// Rows locked by this transaction
    held: Vec<TokenId>,
    /// Uncommitted view counts
    views: HashMap<TokenId, u32>,
    finished: bool,
}

impl MemoryTransaction {
    fn finish(&mut self, table: &mut Table) {
        table.release(self.id, &self.held);
        self.held.clear();
        self.views.clear();
        self.finished = true;
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn lock_random(&mut self, selection: &Selection) -> StoreResult<Option<Token>> {
        if self.finished {
            return Err(StoreError::Backend("transaction already finished".into()));
        }

        let tx = self.id;
        let deadline = Instant::now() + self.shared.lock_timeout;

        let picked = self
            .shared
            .wait_for_release(deadline, |table| {
                let candidate = table
                    .rows
                    .values_mut()
                    .filter(|row| selection.matches(&row.token))
                    .choose(&mut rand::thread_rng());

                match candidate {
                    None => Some(None),
                    Some(row) => match row.locked_by {
                        Some(owner) if owner != tx => {
                            trace!(tx = tx, owner = owner, id = %row.token.id, "Waiting for row lock");
                            None
                        }
                        _ => {
                            row.locked_by = Some(tx);
                            Some(Some(row.token.clone()))
                        }
                    },
                }
            })
            .await?;

        if let Some(token) = &picked {
            if !self.held.contains(&token.id) {
                self.held.push(token.id);
            }
        }

        Ok(picked)
    }

    async fn record_view(&mut self, id: TokenId) -> StoreResult<Token> {
        if self.finished {
            return Err(StoreError::Backend("transaction already finished".into()));
        }

        let table = self.shared.table.lock();
        let row = table.rows.get(&id).ok_or(StoreError::Vanished(id))?;
        if row.locked_by != Some(self.id) {
            return Err(StoreError::Backend(format!(
                "command {} is not locked by this transaction",
                id
            )));
        }

        let views = self.views.entry(id).or_insert(row.token.view_count);
        *views += 1;

        let mut token = row.token.clone();
        token.view_count = *views;
        Ok(token)
    }

    async fn commit(&mut self) -> StoreResult<()> {
        if self.finished {
            return Err(StoreError::Backend("transaction already finished".into()));
        }

        let shared = Arc::clone(&self.shared);
        let outcome = {
            let mut table = shared.table.lock();
            let vanished = self
                .views
                .keys()
                .find(|id| !table.rows.contains_key(*id))
                .copied();

            let outcome = match vanished {
                Some(id) => Err(StoreError::Vanished(id)),
                None => {
                    for (id, views) in &self.views {
                        if let Some(row) = table.rows.get_mut(id) {
                            row.token.view_count = *views;
                        }
                    }
                    Ok(())
                }
            };

            self.finish(&mut table);
            outcome
        };

        shared.released.notify_waiters();
        outcome
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        let shared = Arc::clone(&self.shared);
        {
            let mut table = shared.table.lock();
            self.finish(&mut table);
        }
        shared.released.notify_waiters();
    }
}
