//! Authoritative commit of a prepared transaction.

use std::collections::HashMap;

use tracing::{debug, warn};

use super::posting::post;
use super::{LedgerError, Stage};
use crate::builder::PreparedTransaction;
use crate::check::ensure_sufficient;
use crate::model::LockedBalance;
use crate::store::{Store, UnitOfWork};

/// Commit `prepared` in one unit of work.
///
/// 1. Lock every touched balance row, sorted by account id, in one call
/// 2. Re-check sufficiency of every locked row before writing anything
/// 3. Compute running balances for each leg
/// 4. Insert the header, batch update balances, insert the legs
/// 5. Commit
///
/// Any failure rolls the whole unit back.
pub(crate) async fn commit<S: Store>(
    store: &S,
    prepared: &PreparedTransaction,
) -> Result<(), LedgerError> {
    let mut uow = store.begin().await?;
    match apply(&mut uow, prepared).await {
        Ok(()) => {
            uow.commit().await?;
            Ok(())
        }
        Err(err) => {
            if let Err(rollback) = uow.rollback().await {
                warn!(
                    tx = %prepared.transaction_id(),
                    error = %rollback,
                    "rollback failed"
                );
            }
            Err(err)
        }
    }
}

async fn apply<U: UnitOfWork>(
    uow: &mut U,
    prepared: &PreparedTransaction,
) -> Result<(), LedgerError> {
    let account_ids = prepared.account_ids();
    let rows = uow.lock_balances(&account_ids).await?;
    debug!(
        tx = %prepared.transaction_id(),
        accounts = rows.len(),
        "accounts locked"
    );

    let locked: HashMap<&str, &LockedBalance> = rows
        .iter()
        .map(|row| (row.account_id.as_str(), row))
        .collect();

    // the pre-check ran on unlocked rows, balances may have moved since
    for (account, delta) in &prepared.summaries {
        let row = locked
            .get(account.as_str())
            .ok_or_else(|| LedgerError::AccountNotFound {
                account: account.clone(),
                stage: Stage::UnderLock,
            })?;
        ensure_sufficient(
            account,
            row.balance,
            row.allow_negative,
            *delta,
            Stage::UnderLock,
        )?;
    }

    let posting = post(prepared, &locked)?;

    uow.insert_transaction(&prepared.header).await?;
    uow.update_balances(&posting.updates).await?;
    uow.insert_entries(&posting.entries).await?;
    Ok(())
}
