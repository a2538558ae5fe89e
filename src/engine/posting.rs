use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

use super::{LedgerError, Stage};
use crate::Amount;
use crate::builder::PreparedTransaction;
use crate::model::{BalanceUpdate, LedgerEntry, LockedBalance, Timestamp};

static LAST_TIMESTAMP: AtomicI64 = AtomicI64::new(0);

/// Wall clock in nanoseconds, strictly later than `after` and than every
/// earlier call in this process.
pub(crate) fn next_timestamp(after: Timestamp) -> Timestamp {
    let now = Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default()
        .max(after.saturating_add(1));
    let mut last = LAST_TIMESTAMP.load(Ordering::Acquire);
    loop {
        let next = now.max(last.saturating_add(1));
        match LAST_TIMESTAMP.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// Rows to write for one transaction.
#[derive(Debug)]
pub(crate) struct Posting {
    pub entries: Vec<LedgerEntry>,
    pub updates: Vec<BalanceUpdate>,
}

/// Attach running balances to every leg of `prepared`.
///
/// Legs are walked in construction order starting from the locked balance of
/// their account, so several legs on one account chain into each other:
/// `entries[i].previous_balance == entries[i - 1].current_balance`.
///
/// Each leg is stamped after the newest entry of its account, as read from the
/// locked row, so history order follows commit order even across processes
/// whose clocks disagree.
///
/// Must be called while the rows in `locked` are held.
pub(crate) fn post(
    prepared: &PreparedTransaction,
    locked: &HashMap<&str, &LockedBalance>,
) -> Result<Posting, LedgerError> {
    let mut running: HashMap<&str, (Amount, Timestamp)> = HashMap::with_capacity(locked.len());
    let mut entries = Vec::with_capacity(prepared.legs.len());

    for leg in &prepared.legs {
        let account = leg.account_id.as_str();
        let (previous_balance, last_timestamp) = match running.get(account) {
            Some(state) => *state,
            None => locked
                .get(account)
                .map(|row| (row.balance, row.last_timestamp))
                .ok_or_else(|| LedgerError::AccountNotFound {
                    account: leg.account_id.clone(),
                    stage: Stage::UnderLock,
                })?,
        };
        let current_balance = previous_balance.checked_add(leg.amount).ok_or_else(|| {
            LedgerError::validation(format!("balance of account {account} out of range"))
        })?;
        let timestamp = next_timestamp(last_timestamp);
        running.insert(account, (current_balance, timestamp));

        entries.push(LedgerEntry {
            transaction_id: prepared.transaction_id(),
            account_id: leg.account_id.clone(),
            amount: leg.amount,
            previous_balance,
            current_balance,
            created_at: prepared.header.created_at,
            timestamp,
        });
    }

    let updated_at = Utc::now();
    let updates = prepared
        .summaries
        .keys()
        .filter_map(|account| {
            running.get(account.as_str()).map(|(balance, _)| BalanceUpdate {
                account_id: account.clone(),
                balance: *balance,
                last_transaction_id: prepared.transaction_id(),
                updated_at,
            })
        })
        .collect();

    Ok(Posting { entries, updates })
}
