//! Transaction boundaries around chunks.

use crate::errors::BatchResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;
use uuid::Uuid;

/// Handle of one open transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Unique id.
    pub id: Uuid,
    /// When the transaction began.
    pub started_at: DateTime<Utc>,
}

impl Transaction {
    /// Creates a new handle.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

/// Begins, commits and rolls back the transaction of each chunk.
#[async_trait]
pub trait TransactionManager: Send + Sync + Debug {
    /// Opens a transaction.
    async fn begin(&self) -> BatchResult<Transaction>;

    /// Commits a transaction.
    async fn commit(&self, tx: Transaction) -> BatchResult<()>;

    /// Rolls a transaction back.
    async fn rollback(&self, tx: Transaction) -> BatchResult<()>;
}

/// A transaction manager with no resource behind it.
///
/// It only counts transactions; writers are responsible for their own
/// all-or-nothing behaviour.
#[derive(Debug, Default)]
pub struct ResourcelessTransactionManager {
    begun: AtomicUsize,
    committed: AtomicUsize,
    rolled_back: AtomicUsize,
}

impl ResourcelessTransactionManager {
    /// Creates the manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Transactions opened.
    #[must_use]
    pub fn begun(&self) -> usize {
        self.begun.load(Ordering::SeqCst)
    }

    /// Transactions committed.
    #[must_use]
    pub fn committed(&self) -> usize {
        self.committed.load(Ordering::SeqCst)
    }

    /// Transactions rolled back.
    #[must_use]
    pub fn rolled_back(&self) -> usize {
        self.rolled_back.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransactionManager for ResourcelessTransactionManager {
    async fn begin(&self) -> BatchResult<Transaction> {
        self.begun.fetch_add(1, Ordering::SeqCst);
        Ok(Transaction::new())
    }

    async fn commit(&self, tx: Transaction) -> BatchResult<()> {
        self.committed.fetch_add(1, Ordering::SeqCst);
        debug!(tx = %tx.id, "Committed transaction");
        Ok(())
    }

    async fn rollback(&self, tx: Transaction) -> BatchResult<()> {
        self.rolled_back.fetch_add(1, Ordering::SeqCst);
        debug!(tx = %tx.id, "Rolled back transaction");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counts() {
        let manager = ResourcelessTransactionManager::new();
        let tx = manager.begin().await.unwrap();
        manager.commit(tx).await.unwrap();
        let tx = manager.begin().await.unwrap();
        manager.rollback(tx).await.unwrap();

        assert_eq!(manager.begun(), 2);
        assert_eq!(manager.committed(), 1);
        assert_eq!(manager.rolled_back(), 1);
    }
}
