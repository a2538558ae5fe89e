//! Storage seam of the ledger.
//!
//! The engine only talks to [`Store`] and [`UnitOfWork`]. All concurrency
//! control is delegated to the store: exclusive row locks taken inside a unit
//! of work, Read-Committed reads outside of one.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{
    Account, AccountBalance, AccountId, BalanceUpdate, LedgerEntry, LockedBalance,
    TransactionHeader, TransactionId,
};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

/// Error raised by a storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("gave up waiting for row locks after {0:?}")]
    LockTimeout(Duration),

    #[error("concurrent update conflict: {0}")]
    Conflict(String),

    #[error("account {0} already exists")]
    DuplicateAccount(AccountId),

    #[error("transaction {0} already exists")]
    DuplicateTransaction(TransactionId),

    #[error("duplicate ledger entry for transaction {transaction_id} on account {account_id}")]
    DuplicateEntry {
        transaction_id: TransactionId,
        account_id: AccountId,
    },

    #[error("{0}")]
    Backend(String),
}

impl StoreError {
    /// Lock waits, serialization failures and lost connections can succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::LockTimeout(_) | StoreError::Conflict(_)
        )
    }
}

/// Durable home of accounts, balances and the ledger journal.
#[async_trait]
pub trait Store: Send + Sync {
    type Tx: UnitOfWork;

    /// Start a unit of work at Read-Committed isolation.
    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    /// Insert an account together with its zero balance row, atomically.
    async fn create_account(&self, account: &Account) -> Result<(), StoreError>;

    async fn get_account(&self, account_id: &str) -> Result<Option<Account>, StoreError>;

    /// Committed balances of the given accounts. Unknown ids are skipped.
    async fn get_balances(
        &self,
        account_ids: &[AccountId],
    ) -> Result<Vec<AccountBalance>, StoreError>;

    async fn get_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Option<TransactionHeader>, StoreError>;

    /// Ledger entries of an account, ordered by timestamp ascending.
    async fn get_entries_by_account(
        &self,
        account_id: &str,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Ledger entries of a transaction, ordered by timestamp ascending.
    async fn get_entries_by_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<LedgerEntry>, StoreError>;
}

/// One atomic unit of work.
///
/// Nothing written through a unit is visible to others before [`commit`](Self::commit).
/// Dropping a unit without committing rolls it back and releases its locks.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Exclusively lock the balance rows of `account_ids` in a single call.
    ///
    /// `account_ids` must be sorted and deduplicated so that every caller acquires
    /// locks in the same order. Unknown ids are skipped.
    async fn lock_balances(
        &mut self,
        account_ids: &[AccountId],
    ) -> Result<Vec<LockedBalance>, StoreError>;

    /// Fails with [`StoreError::DuplicateTransaction`] if the id already exists.
    async fn insert_transaction(&mut self, header: &TransactionHeader) -> Result<(), StoreError>;

    /// Write final balances of locked rows in one batch.
    async fn update_balances(&mut self, updates: &[BalanceUpdate]) -> Result<(), StoreError>;

    async fn insert_entries(&mut self, entries: &[LedgerEntry]) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}
