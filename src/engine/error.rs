//! Error types for ledger operations.

use std::fmt;

use thiserror::Error;

use crate::Amount;
use crate::model::{AccountId, TransactionId};
use crate::store::StoreError;

/// Where a failure was detected.
///
/// Pre-check and under-lock failures surface with the same [`ErrorKind`], the
/// stage only matters for triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Plain read, no operation involved.
    Lookup,
    /// Advisory balance check, before any lock is taken.
    PreCheck,
    /// Authoritative check, while the balance rows are locked.
    UnderLock,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Lookup => "lookup",
            Stage::PreCheck => "pre-check",
            Stage::UnderLock => "under lock",
        })
    }
}

/// Externally visible error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    InvalidEntryCount,
    LedgerNotBalanced,
    AccountNotFound,
    AllAccountsNotFound,
    InsufficientBalance,
    DuplicateTransaction,
    DuplicateAccount,
    TransactionNotFound,
    StorageUnavailable,
    Internal,
}

/// Error returned by [`Ledger`](super::Ledger) operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("ledger entries must have an even, non-zero length, got {0}")]
    InvalidEntryCount(usize),

    #[error("ledger entries do not balance, sum is {0}")]
    NotBalanced(Amount),

    #[error("account {account} not found ({stage})")]
    AccountNotFound { account: AccountId, stage: Stage },

    #[error("none of the requested accounts exist")]
    AllAccountsNotFound,

    #[error("account {account} has insufficient balance {balance} for change {delta} ({stage})")]
    InsufficientBalance {
        account: AccountId,
        balance: Amount,
        delta: Amount,
        stage: Stage,
    },

    #[error("duplicate transaction id {0}")]
    DuplicateTransaction(TransactionId),

    #[error("account {0} already exists")]
    DuplicateAccount(AccountId),

    #[error("transaction {0} not found")]
    TransactionNotFound(TransactionId),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[source] StoreError),

    #[error("storage failure: {0}")]
    Storage(#[source] StoreError),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::Validation(_) => ErrorKind::Validation,
            LedgerError::InvalidEntryCount(_) => ErrorKind::InvalidEntryCount,
            LedgerError::NotBalanced(_) => ErrorKind::LedgerNotBalanced,
            LedgerError::AccountNotFound { .. } => ErrorKind::AccountNotFound,
            LedgerError::AllAccountsNotFound => ErrorKind::AllAccountsNotFound,
            LedgerError::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,
            LedgerError::DuplicateTransaction(_) => ErrorKind::DuplicateTransaction,
            LedgerError::DuplicateAccount(_) => ErrorKind::DuplicateAccount,
            LedgerError::TransactionNotFound(_) => ErrorKind::TransactionNotFound,
            LedgerError::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            LedgerError::Storage(_) => ErrorKind::Internal,
        }
    }

    /// Stage at which a balance or existence failure was detected.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            LedgerError::AccountNotFound { stage, .. }
            | LedgerError::InsufficientBalance { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Only transient storage failures may be retried, and only with the same transaction id.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::StorageUnavailable
    }

    /// Message safe to hand back to a caller outside the process.
    pub fn public_message(&self) -> String {
        match self.kind() {
            ErrorKind::StorageUnavailable | ErrorKind::Internal => {
                "ledger temporarily unavailable, retry later".to_string()
            }
            _ => self.to_string(),
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        LedgerError::Validation(message.into())
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateTransaction(id) => LedgerError::DuplicateTransaction(id),
            StoreError::DuplicateAccount(id) => LedgerError::DuplicateAccount(id),
            err if err.is_transient() => LedgerError::StorageUnavailable(err),
            err => LedgerError::Storage(err),
        }
    }
}

/// A submitted operation that was not committed.
///
/// Carries the transaction id so the failed attempt can still be correlated
/// and, for transient failures, retried under the same id.
#[derive(Debug, Error)]
#[error("transaction {transaction_id} rejected: {error}")]
pub struct Rejection {
    pub transaction_id: TransactionId,
    #[source]
    pub error: LedgerError,
}

impl Rejection {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}
