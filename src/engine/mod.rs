//! Ledger engine.
//!
//! [`Ledger`] is the entry point: it opens accounts, answers balance and
//! history queries, and posts operations through builder → pre-check →
//! locked commit. It holds no state of its own beyond the store handle, so it
//! can be shared freely between tasks.

use chrono::Utc;
use tokio_stream::{Stream, StreamExt};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::builder::{Operation, Transfer, build_transaction};
use crate::check::check_balances;
use crate::model::{
    Account, AccountBalance, AccountId, AccountType, Command, LedgerHistory, MAX_ACCOUNT_ID_LEN,
    TransactionId, TransactionRecord, new_transaction_id,
};
use crate::store::Store;

mod commit;
mod posting;

mod error;
pub use error::{ErrorKind, LedgerError, Rejection, Stage};

/// Double-entry ledger over a [`Store`].
#[derive(Debug, Clone)]
pub struct Ledger<S> {
    store: S,
}

/// Public API
impl<S: Store> Ledger<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Open an account with a zero balance.
    ///
    /// Without `account_id` a UUID is generated. Self-chosen ids are limited
    /// to [`MAX_ACCOUNT_ID_LEN`] characters. Only funding accounts may go negative.
    #[instrument(skip(self))]
    pub async fn create_account(
        &self,
        account_id: Option<&str>,
        account_type: AccountType,
    ) -> Result<Account, LedgerError> {
        let id = match account_id.filter(|id| !id.is_empty()) {
            None => Uuid::new_v4().to_string(),
            Some(id) if id.chars().count() > MAX_ACCOUNT_ID_LEN => {
                return Err(LedgerError::validation(format!(
                    "self-chosen account id cannot be longer than {MAX_ACCOUNT_ID_LEN} characters"
                )));
            }
            Some(id) => id.to_string(),
        };

        let now = Utc::now();
        let account = Account {
            id,
            account_type,
            allow_negative_balance: account_type.allows_negative(),
            created_at: now,
            updated_at: now,
        };
        self.store.create_account(&account).await?;

        info!(account = %account.id, account_type = %account_type, "account created");
        Ok(account)
    }

    #[instrument(skip(self))]
    pub async fn get_account_balance(&self, account_id: &str) -> Result<AccountBalance, LedgerError> {
        self.store
            .get_balances(&[account_id.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| LedgerError::AccountNotFound {
                account: account_id.to_string(),
                stage: Stage::Lookup,
            })
    }

    /// Every ledger entry of an account, oldest first.
    #[instrument(skip(self))]
    pub async fn get_account_ledger_entries(
        &self,
        account_id: &str,
    ) -> Result<LedgerHistory, LedgerError> {
        let entries = self.store.get_entries_by_account(account_id).await?;
        if entries.is_empty() && self.store.get_account(account_id).await?.is_none() {
            return Err(LedgerError::AccountNotFound {
                account: account_id.to_string(),
                stage: Stage::Lookup,
            });
        }
        Ok(LedgerHistory::new(account_id.to_string(), entries))
    }

    /// A committed transaction and its legs.
    #[instrument(skip(self))]
    pub async fn get_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<TransactionRecord, LedgerError> {
        let header = self
            .store
            .get_transaction(transaction_id)
            .await?
            .ok_or(LedgerError::TransactionNotFound(transaction_id))?;
        let entries = self.store.get_entries_by_transaction(transaction_id).await?;
        Ok(TransactionRecord { header, entries })
    }

    /// Move money between two accounts under a fresh transaction id.
    pub async fn transfer(&self, transfer: Transfer) -> Result<TransactionId, Rejection> {
        self.submit(&transfer).await
    }

    /// Post any [`Operation`] under a fresh transaction id.
    pub async fn submit<O>(&self, operation: &O) -> Result<TransactionId, Rejection>
    where
        O: Operation + Sync + ?Sized,
    {
        self.submit_with_id(new_transaction_id(), operation).await
    }

    /// Post an [`Operation`] under a caller-chosen transaction id.
    ///
    /// Retrying a transient failure with the same id can never post twice:
    /// if the first attempt did commit, the retry fails with
    /// [`ErrorKind::DuplicateTransaction`].
    #[instrument(skip(self, operation))]
    pub async fn submit_with_id<O>(
        &self,
        transaction_id: TransactionId,
        operation: &O,
    ) -> Result<TransactionId, Rejection>
    where
        O: Operation + Sync + ?Sized,
    {
        let result = self.process(transaction_id, operation).await;
        Self::log_result(transaction_id, &result);
        result
            .map(|()| transaction_id)
            .map_err(|error| Rejection {
                transaction_id,
                error,
            })
    }

    /// Apply a stream of commands in order.
    ///
    /// Rejected commands are logged and skipped. Returns the ids of the
    /// accounts that were opened, in opening order.
    pub async fn run(&self, mut commands: impl Stream<Item = Command> + Unpin) -> Vec<AccountId> {
        let mut opened = Vec::new();
        while let Some(command) = commands.next().await {
            match command {
                Command::Open {
                    account,
                    account_type,
                } => match self
                    .create_account(account.as_deref(), account_type.unwrap_or_default())
                    .await
                {
                    Ok(account) => opened.push(account.id),
                    Err(e) => warn!(account = ?account, reason = %e, "open skipped"),
                },
                Command::Transfer(transfer) => {
                    // any error should not stop the run, it is already logged
                    let _ = self.transfer(transfer).await;
                }
            }
        }
        opened
    }
}

/// Private API
impl<S: Store> Ledger<S> {
    async fn process<O>(
        &self,
        transaction_id: TransactionId,
        operation: &O,
    ) -> Result<(), LedgerError>
    where
        O: Operation + Sync + ?Sized,
    {
        let prepared = build_transaction(transaction_id, operation)?;
        check_balances(&self.store, &prepared.summaries).await?;
        commit::commit(&self.store, &prepared).await
    }

    fn log_result(transaction_id: TransactionId, result: &Result<(), LedgerError>) {
        match result {
            Ok(()) => {
                info!(tx = %transaction_id, "transaction committed");
            }
            Err(e) => {
                info!(
                    tx = %transaction_id,
                    kind = ?e.kind(),
                    stage = ?e.stage(),
                    reason = %e,
                    "transaction rejected"
                );
            }
        }
    }
}
