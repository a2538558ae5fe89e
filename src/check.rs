//! Balance sufficiency checks.
//!
//! The same predicate, [`ensure_sufficient`], runs twice per transaction: once
//! as an advisory pre-check on committed balances and once more by the engine
//! on the locked rows.

use std::collections::HashMap;

use tracing::debug;

use crate::Amount;
use crate::builder::Summaries;
use crate::engine::{LedgerError, Stage};
use crate::model::{AccountBalance, AccountId};
use crate::store::Store;

/// Fail if applying `delta` would take a non-negative-only account below zero.
///
/// A resulting balance outside the decimal range is a validation error for
/// every account type.
pub fn ensure_sufficient(
    account: &str,
    balance: Amount,
    allow_negative: bool,
    delta: Amount,
    stage: Stage,
) -> Result<(), LedgerError> {
    let Some(resulting) = balance.checked_add(delta) else {
        return Err(LedgerError::validation(format!(
            "balance of account {account} out of range"
        )));
    };
    if !allow_negative && resulting.is_negative() {
        return Err(LedgerError::InsufficientBalance {
            account: account.to_string(),
            balance,
            delta,
            stage,
        });
    }
    Ok(())
}

/// Pre-flight check of every account referenced by `summaries`.
///
/// Runs without any lock, so a success here does not guarantee the commit
/// will succeed. It only rejects obviously invalid requests cheaply.
pub async fn check_balances<S: Store>(store: &S, summaries: &Summaries) -> Result<(), LedgerError> {
    let account_ids: Vec<AccountId> = summaries.keys().cloned().collect();
    let balances = store.get_balances(&account_ids).await?;
    if balances.is_empty() {
        return Err(LedgerError::AllAccountsNotFound);
    }

    let by_id: HashMap<&str, &AccountBalance> = balances
        .iter()
        .map(|balance| (balance.account_id.as_str(), balance))
        .collect();

    for (account, delta) in summaries {
        let balance = by_id
            .get(account.as_str())
            .ok_or_else(|| LedgerError::AccountNotFound {
                account: account.clone(),
                stage: Stage::PreCheck,
            })?;
        ensure_sufficient(
            account,
            balance.balance,
            balance.allow_negative,
            *delta,
            Stage::PreCheck,
        )?;
    }

    debug!(accounts = summaries.len(), "pre-check passed");
    Ok(())
}
