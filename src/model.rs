//! Core domain types for the ledger.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_stream::Stream;
use uuid::Uuid;

use crate::Amount;
use crate::builder::Transfer;

/// Account identifier.
pub type AccountId = String;

/// Transaction identifier.
pub type TransactionId = Uuid;

/// Nanosecond ordering key of a ledger entry, strictly increasing per process.
pub type Timestamp = i64;

/// Longest id a caller may choose for its own account. Generated ids are full UUIDs.
pub const MAX_ACCOUNT_ID_LEN: usize = 10;

/// Kind of account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    /// Regular account; its balance can never go below zero.
    #[default]
    User,
    /// Source of value injected into the ledger; may go negative.
    Funding,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::User => "user",
            AccountType::Funding => "funding",
        }
    }

    pub fn allows_negative(&self) -> bool {
        matches!(self, AccountType::Funding)
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "user" => Ok(AccountType::User),
            "funding" => Ok(AccountType::Funding),
            other => Err(format!("unknown account type '{other}'")),
        }
    }
}

/// Account metadata. Immutable once created, never deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: AccountId,
    pub account_type: AccountType,
    pub allow_negative_balance: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Authoritative balance row of an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountBalance {
    pub account_id: AccountId,
    pub balance: Amount,
    pub allow_negative: bool,
    pub last_transaction_id: Option<TransactionId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AccountBalance {
    /// Zero balance row created alongside a new account.
    pub fn opening(account: &Account) -> Self {
        Self {
            account_id: account.id.clone(),
            balance: Amount::ZERO,
            allow_negative: account.allow_negative_balance,
            last_transaction_id: None,
            created_at: account.created_at,
            updated_at: account.created_at,
        }
    }
}

/// Header of a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionHeader {
    pub transaction_id: TransactionId,
    /// Gross value of the operation.
    pub amount: Amount,
    pub created_at: DateTime<Utc>,
}

/// One signed balance change produced by an operation, before it is posted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leg {
    pub transaction_id: TransactionId,
    pub account_id: AccountId,
    pub amount: Amount,
}

/// A posted leg, with the balance snapshots around it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub transaction_id: TransactionId,
    pub account_id: AccountId,
    pub amount: Amount,
    pub previous_balance: Amount,
    pub current_balance: Amount,
    pub created_at: DateTime<Utc>,
    pub timestamp: Timestamp,
}

/// Balance row as read under an exclusive lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedBalance {
    pub account_id: AccountId,
    pub balance: Amount,
    pub allow_negative: bool,
    /// Timestamp of the newest ledger entry of the account, `0` when it has none.
    pub last_timestamp: Timestamp,
}

/// Final state written back to a locked balance row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceUpdate {
    pub account_id: AccountId,
    pub balance: Amount,
    pub last_transaction_id: TransactionId,
    pub updated_at: DateTime<Utc>,
}

/// A committed transaction with its legs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub header: TransactionHeader,
    pub entries: Vec<LedgerEntry>,
}

/// Full ledger history of one account, oldest entry first.
///
/// Finite and restartable: it can be iterated or streamed any number of times.
#[derive(Debug, Clone)]
pub struct LedgerHistory {
    account_id: AccountId,
    entries: Vec<LedgerEntry>,
}

impl LedgerHistory {
    pub fn new(account_id: AccountId, entries: Vec<LedgerEntry>) -> Self {
        Self {
            account_id,
            entries,
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, LedgerEntry> {
        self.entries.iter()
    }

    /// Async view over the same entries.
    pub fn stream(&self) -> impl Stream<Item = LedgerEntry> + '_ {
        tokio_stream::iter(self.entries.iter().cloned())
    }

    pub fn into_entries(self) -> Vec<LedgerEntry> {
        self.entries
    }
}

impl<'a> IntoIterator for &'a LedgerHistory {
    type Item = &'a LedgerEntry;
    type IntoIter = std::slice::Iter<'a, LedgerEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl IntoIterator for LedgerHistory {
    type Item = LedgerEntry;
    type IntoIter = std::vec::IntoIter<LedgerEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Input of the batch driver, see [`Ledger::run`](crate::Ledger::run).
#[derive(Debug, Clone)]
pub enum Command {
    /// Open an account, generating an id when none is given.
    Open {
        account: Option<AccountId>,
        account_type: Option<AccountType>,
    },
    Transfer(Transfer),
}

/// Generate a fresh transaction id.
pub fn new_transaction_id() -> TransactionId {
    Uuid::new_v4()
}
