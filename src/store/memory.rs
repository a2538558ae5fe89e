//! In-process [`Store`] with row-level locking.
//!
//! Every balance row carries its own async mutex, which plays the role of
//! `SELECT ... FOR UPDATE`. Reads outside a unit of work only ever see
//! committed row values. Writes are buffered in the unit and applied under the
//! journal mutex on commit, before the row locks are released.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use super::{Store, StoreError, UnitOfWork};
use crate::model::{
    Account, AccountBalance, AccountId, BalanceUpdate, LedgerEntry, LockedBalance, Timestamp,
    TransactionHeader, TransactionId,
};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Cheap to clone; clones share the same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    accounts: DashMap<AccountId, Account>,
    balances: DashMap<AccountId, Arc<BalanceRow>>,
    journal: Mutex<Journal>,
    lock_timeout: Duration,
}

struct BalanceRow {
    lock: Arc<tokio::sync::Mutex<()>>,
    committed: RwLock<AccountBalance>,
    /// Newest committed entry timestamp of the account.
    last_timestamp: AtomicI64,
}

#[derive(Default)]
struct Journal {
    transactions: HashMap<TransactionId, TransactionHeader>,
    /// Ids inserted by units of work that have not finished yet.
    in_flight: HashSet<TransactionId>,
    entries: Vec<LedgerEntry>,
    entry_keys: HashSet<(TransactionId, AccountId, Timestamp)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    /// Bound how long a unit of work waits for its row locks.
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                accounts: DashMap::new(),
                balances: DashMap::new(),
                journal: Mutex::new(Journal::default()),
                lock_timeout,
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Tx = MemoryUnitOfWork;

    async fn begin(&self) -> Result<MemoryUnitOfWork, StoreError> {
        Ok(MemoryUnitOfWork {
            inner: Arc::clone(&self.inner),
            guards: Vec::new(),
            locked: HashSet::new(),
            header: None,
            updates: Vec::new(),
            entries: Vec::new(),
        })
    }

    async fn create_account(&self, account: &Account) -> Result<(), StoreError> {
        match self.inner.accounts.entry(account.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::DuplicateAccount(account.id.clone())),
            Entry::Vacant(vacant) => {
                let row = BalanceRow {
                    lock: Arc::new(tokio::sync::Mutex::new(())),
                    committed: RwLock::new(AccountBalance::opening(account)),
                    last_timestamp: AtomicI64::new(0),
                };
                self.inner
                    .balances
                    .insert(account.id.clone(), Arc::new(row));
                vacant.insert(account.clone());
                Ok(())
            }
        }
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<Account>, StoreError> {
        Ok(self
            .inner
            .accounts
            .get(account_id)
            .map(|account| account.value().clone()))
    }

    async fn get_balances(
        &self,
        account_ids: &[AccountId],
    ) -> Result<Vec<AccountBalance>, StoreError> {
        Ok(account_ids
            .iter()
            .filter_map(|id| {
                self.inner
                    .balances
                    .get(id)
                    .map(|row| row.committed.read().clone())
            })
            .collect())
    }

    async fn get_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Option<TransactionHeader>, StoreError> {
        Ok(self
            .inner
            .journal
            .lock()
            .transactions
            .get(&transaction_id)
            .cloned())
    }

    async fn get_entries_by_account(
        &self,
        account_id: &str,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let mut entries: Vec<LedgerEntry> = self
            .inner
            .journal
            .lock()
            .entries
            .iter()
            .filter(|entry| entry.account_id == account_id)
            .cloned()
            .collect();
        entries.sort_by_key(|entry| entry.timestamp);
        Ok(entries)
    }

    async fn get_entries_by_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let mut entries: Vec<LedgerEntry> = self
            .inner
            .journal
            .lock()
            .entries
            .iter()
            .filter(|entry| entry.transaction_id == transaction_id)
            .cloned()
            .collect();
        entries.sort_by_key(|entry| entry.timestamp);
        Ok(entries)
    }
}

/// Unit of work over a [`MemoryStore`].
pub struct MemoryUnitOfWork {
    inner: Arc<Inner>,
    guards: Vec<OwnedMutexGuard<()>>,
    locked: HashSet<AccountId>,
    header: Option<TransactionHeader>,
    updates: Vec<BalanceUpdate>,
    entries: Vec<LedgerEntry>,
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn lock_balances(
        &mut self,
        account_ids: &[AccountId],
    ) -> Result<Vec<LockedBalance>, StoreError> {
        let mut ids: Vec<&AccountId> = account_ids
            .iter()
            .filter(|id| !self.locked.contains(*id))
            .collect();
        ids.sort();
        ids.dedup();

        let rows: Vec<(AccountId, Arc<BalanceRow>)> = ids
            .into_iter()
            .filter_map(|id| {
                self.inner
                    .balances
                    .get(id)
                    .map(|row| (id.clone(), Arc::clone(row.value())))
            })
            .collect();

        let timeout = self.inner.lock_timeout;
        let acquire = async {
            let mut guards = Vec::with_capacity(rows.len());
            for (_, row) in &rows {
                guards.push(Arc::clone(&row.lock).lock_owned().await);
            }
            guards
        };
        let guards = tokio::time::timeout(timeout, acquire)
            .await
            .map_err(|_| StoreError::LockTimeout(timeout))?;
        self.guards.extend(guards);

        let locked: Vec<LockedBalance> = rows
            .into_iter()
            .map(|(id, row)| {
                let committed = row.committed.read();
                LockedBalance {
                    account_id: id,
                    balance: committed.balance,
                    allow_negative: committed.allow_negative,
                    last_timestamp: row.last_timestamp.load(Ordering::Acquire),
                }
            })
            .collect();
        self.locked
            .extend(locked.iter().map(|row| row.account_id.clone()));
        debug!(rows = locked.len(), "balance rows locked");
        Ok(locked)
    }

    async fn insert_transaction(&mut self, header: &TransactionHeader) -> Result<(), StoreError> {
        let id = header.transaction_id;
        if self.header.is_some() {
            return Err(StoreError::DuplicateTransaction(id));
        }
        let mut journal = self.inner.journal.lock();
        if journal.transactions.contains_key(&id) || journal.in_flight.contains(&id) {
            return Err(StoreError::DuplicateTransaction(id));
        }
        journal.in_flight.insert(id);
        self.header = Some(header.clone());
        Ok(())
    }

    async fn update_balances(&mut self, updates: &[BalanceUpdate]) -> Result<(), StoreError> {
        if let Some(update) = updates
            .iter()
            .find(|update| !self.locked.contains(&update.account_id))
        {
            return Err(StoreError::Backend(format!(
                "balance row {} is not locked by this unit of work",
                update.account_id
            )));
        }
        self.updates.extend_from_slice(updates);
        Ok(())
    }

    async fn insert_entries(&mut self, entries: &[LedgerEntry]) -> Result<(), StoreError> {
        let journal = self.inner.journal.lock();
        let mut pending: HashSet<(TransactionId, &str, Timestamp)> = self
            .entries
            .iter()
            .map(|e| (e.transaction_id, e.account_id.as_str(), e.timestamp))
            .collect();
        for entry in entries {
            let key = (entry.transaction_id, entry.account_id.clone(), entry.timestamp);
            if journal.entry_keys.contains(&key)
                || !pending.insert((entry.transaction_id, entry.account_id.as_str(), entry.timestamp))
            {
                return Err(StoreError::DuplicateEntry {
                    transaction_id: entry.transaction_id,
                    account_id: entry.account_id.clone(),
                });
            }
        }
        drop(pending);
        drop(journal);
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        let mut journal = self.inner.journal.lock();
        if let Some(header) = self.header.take() {
            journal.in_flight.remove(&header.transaction_id);
            journal.transactions.insert(header.transaction_id, header);
        }
        for update in self.updates.drain(..) {
            if let Some(row) = self.inner.balances.get(&update.account_id) {
                let mut committed = row.committed.write();
                committed.balance = update.balance;
                committed.last_transaction_id = Some(update.last_transaction_id);
                committed.updated_at = update.updated_at;
            }
        }
        for entry in self.entries.drain(..) {
            if let Some(row) = self.inner.balances.get(&entry.account_id) {
                row.last_timestamp.fetch_max(entry.timestamp, Ordering::AcqRel);
            }
            journal.entry_keys.insert((
                entry.transaction_id,
                entry.account_id.clone(),
                entry.timestamp,
            ));
            journal.entries.push(entry);
        }
        drop(journal);
        // row locks are released when `self` drops
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

impl Drop for MemoryUnitOfWork {
    fn drop(&mut self) {
        if let Some(header) = self.header.take() {
            self.inner
                .journal
                .lock()
                .in_flight
                .remove(&header.transaction_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::Amount;
    use crate::model::{AccountType, new_transaction_id};

    fn account(id: &str, account_type: AccountType) -> Account {
        let now = Utc::now();
        Account {
            id: id.to_string(),
            account_type,
            allow_negative_balance: account_type.allows_negative(),
            created_at: now,
            updated_at: now,
        }
    }

    fn header(id: TransactionId) -> TransactionHeader {
        TransactionHeader {
            transaction_id: id,
            amount: Amount::from_i64(10),
            created_at: Utc::now(),
        }
    }

    fn entry(id: TransactionId, account: &str, amount: i64, timestamp: Timestamp) -> LedgerEntry {
        LedgerEntry {
            transaction_id: id,
            account_id: account.to_string(),
            amount: Amount::from_i64(amount),
            previous_balance: Amount::ZERO,
            current_balance: Amount::from_i64(amount),
            created_at: Utc::now(),
            timestamp,
        }
    }

    async fn store_with(ids: &[&str]) -> MemoryStore {
        let store = MemoryStore::with_lock_timeout(Duration::from_millis(50));
        for id in ids {
            store
                .create_account(&account(id, AccountType::User))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn create_account_opens_zero_balance() {
        let store = store_with(&["alice"]).await;
        let balances = store.get_balances(&["alice".to_string()]).await.unwrap();
        assert_eq!(balances.len(), 1);
        assert_eq!(balances[0].balance, Amount::ZERO);
        assert!(store.get_account("alice").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn duplicate_account_fails() {
        let store = store_with(&["alice"]).await;
        let result = store
            .create_account(&account("alice", AccountType::Funding))
            .await;
        assert!(matches!(result, Err(StoreError::DuplicateAccount(id)) if id == "alice"));
    }

    #[tokio::test]
    async fn get_balances_skips_unknown_ids() {
        let store = store_with(&["alice"]).await;
        let balances = store
            .get_balances(&["alice".to_string(), "ghost".to_string()])
            .await
            .unwrap();
        assert_eq!(balances.len(), 1);
    }

    #[tokio::test]
    async fn lock_skips_unknown_rows() {
        let store = store_with(&["b", "a"]).await;
        let mut uow = store.begin().await.unwrap();
        let locked = uow
            .lock_balances(&["b".to_string(), "ghost".to_string(), "a".to_string()])
            .await
            .unwrap();
        let ids: Vec<_> = locked.iter().map(|row| row.account_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn held_lock_times_out_second_unit() {
        let store = store_with(&["a"]).await;
        let mut first = store.begin().await.unwrap();
        first.lock_balances(&["a".to_string()]).await.unwrap();

        let mut second = store.begin().await.unwrap();
        let result = second.lock_balances(&["a".to_string()]).await;
        assert!(matches!(result, Err(StoreError::LockTimeout(_))));

        // dropping the first unit releases the row
        drop(first);
        second.lock_balances(&["a".to_string()]).await.unwrap();
    }

    #[tokio::test]
    async fn uncommitted_writes_are_invisible() {
        let store = store_with(&["a"]).await;
        let id = new_transaction_id();
        let mut uow = store.begin().await.unwrap();
        uow.lock_balances(&["a".to_string()]).await.unwrap();
        uow.insert_transaction(&header(id)).await.unwrap();
        uow.update_balances(&[BalanceUpdate {
            account_id: "a".to_string(),
            balance: Amount::from_i64(10),
            last_transaction_id: id,
            updated_at: Utc::now(),
        }])
        .await
        .unwrap();
        uow.insert_entries(&[entry(id, "a", 10, 1)]).await.unwrap();

        let balances = store.get_balances(&["a".to_string()]).await.unwrap();
        assert_eq!(balances[0].balance, Amount::ZERO);
        assert!(store.get_transaction(id).await.unwrap().is_none());

        uow.commit().await.unwrap();

        let balances = store.get_balances(&["a".to_string()]).await.unwrap();
        assert_eq!(balances[0].balance, Amount::from_i64(10));
        assert_eq!(balances[0].last_transaction_id, Some(id));
        assert!(store.get_transaction(id).await.unwrap().is_some());
        assert_eq!(store.get_entries_by_account("a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn locked_row_reports_newest_committed_timestamp() {
        let store = store_with(&["a", "b"]).await;
        let id = new_transaction_id();
        let mut uow = store.begin().await.unwrap();
        let rows = uow
            .lock_balances(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert!(rows.iter().all(|row| row.last_timestamp == 0));
        uow.insert_transaction(&header(id)).await.unwrap();
        uow.insert_entries(&[
            entry(id, "a", -5, 40),
            entry(id, "b", 5, 41),
            entry(id, "a", 1, 42),
        ])
        .await
        .unwrap();
        uow.commit().await.unwrap();

        let mut uow = store.begin().await.unwrap();
        let rows = uow
            .lock_balances(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(rows[0].last_timestamp, 42);
        assert_eq!(rows[1].last_timestamp, 41);

        // uncommitted entries do not move it
        let other = new_transaction_id();
        uow.insert_transaction(&header(other)).await.unwrap();
        uow.insert_entries(&[entry(other, "b", 1, 99)]).await.unwrap();
        uow.rollback().await.unwrap();
        let mut uow = store.begin().await.unwrap();
        let rows = uow.lock_balances(&["b".to_string()]).await.unwrap();
        assert_eq!(rows[0].last_timestamp, 41);
    }

    #[tokio::test]
    async fn rollback_discards_everything() {
        let store = store_with(&["a"]).await;
        let id = new_transaction_id();
        let mut uow = store.begin().await.unwrap();
        uow.lock_balances(&["a".to_string()]).await.unwrap();
        uow.insert_transaction(&header(id)).await.unwrap();
        uow.insert_entries(&[entry(id, "a", 10, 1)]).await.unwrap();
        uow.rollback().await.unwrap();

        assert!(store.get_transaction(id).await.unwrap().is_none());
        assert!(store.get_entries_by_account("a").await.unwrap().is_empty());

        // the id is free again
        let mut retry = store.begin().await.unwrap();
        retry.insert_transaction(&header(id)).await.unwrap();
    }

    #[tokio::test]
    async fn in_flight_transaction_id_is_reserved() {
        let store = store_with(&[]).await;
        let id = new_transaction_id();
        let mut first = store.begin().await.unwrap();
        first.insert_transaction(&header(id)).await.unwrap();

        let mut second = store.begin().await.unwrap();
        let result = second.insert_transaction(&header(id)).await;
        assert!(matches!(result, Err(StoreError::DuplicateTransaction(got)) if got == id));
    }

    #[tokio::test]
    async fn committed_transaction_id_is_unique() {
        let store = store_with(&[]).await;
        let id = new_transaction_id();
        let mut first = store.begin().await.unwrap();
        first.insert_transaction(&header(id)).await.unwrap();
        first.commit().await.unwrap();

        let mut second = store.begin().await.unwrap();
        let result = second.insert_transaction(&header(id)).await;
        assert!(matches!(result, Err(StoreError::DuplicateTransaction(_))));
    }

    #[tokio::test]
    async fn entry_key_is_transaction_account_timestamp() {
        let store = store_with(&["a"]).await;
        let id = new_transaction_id();
        let mut uow = store.begin().await.unwrap();

        // two legs on one account in one transaction are fine with distinct timestamps
        uow.insert_entries(&[entry(id, "a", -5, 1), entry(id, "a", 5, 2)])
            .await
            .unwrap();

        let result = uow.insert_entries(&[entry(id, "a", 1, 2)]).await;
        assert!(matches!(result, Err(StoreError::DuplicateEntry { .. })));
    }

    #[tokio::test]
    async fn update_requires_row_lock() {
        let store = store_with(&["a"]).await;
        let mut uow = store.begin().await.unwrap();
        let result = uow
            .update_balances(&[BalanceUpdate {
                account_id: "a".to_string(),
                balance: Amount::from_i64(1),
                last_transaction_id: new_transaction_id(),
                updated_at: Utc::now(),
            }])
            .await;
        assert!(matches!(result, Err(StoreError::Backend(_))));
    }

    #[tokio::test]
    async fn entries_are_ordered_by_timestamp() {
        let store = store_with(&["a"]).await;
        let first = new_transaction_id();
        let second = new_transaction_id();

        let mut uow = store.begin().await.unwrap();
        uow.insert_entries(&[entry(second, "a", 2, 20)]).await.unwrap();
        uow.insert_entries(&[entry(first, "a", 1, 10)]).await.unwrap();
        uow.commit().await.unwrap();

        let entries = store.get_entries_by_account("a").await.unwrap();
        let order: Vec<_> = entries.iter().map(|e| e.timestamp).collect();
        assert_eq!(order, vec![10, 20]);
        assert_eq!(store.get_entries_by_transaction(first).await.unwrap().len(), 1);
    }
}
