//! Turning business operations into balanced sets of legs.
//!
//! An [`Operation`] only knows its own shape. [`build_transaction`] applies the
//! double-entry rules every operation must satisfy before it reaches the engine.

use std::collections::BTreeMap;

use chrono::Utc;

use crate::Amount;
use crate::engine::LedgerError;
use crate::model::{AccountId, Leg, TransactionHeader, TransactionId};

/// Net signed change per account over a whole transaction.
///
/// Ordered by account id, which is also the order rows get locked in.
pub type Summaries = BTreeMap<AccountId, Amount>;

/// Output of [`Operation::build_legs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    /// Gross value of the operation, recorded on the transaction header.
    pub amount: Amount,
    pub legs: Vec<Leg>,
}

/// Anything that can be posted to the ledger.
pub trait Operation {
    /// Structural checks specific to the operation.
    fn validate(&self) -> Result<(), LedgerError>;

    /// Produce the signed legs of the operation. Never touches storage.
    fn build_legs(&self, transaction_id: TransactionId) -> Draft;
}

/// A validated transaction, ready to be checked and committed.
#[derive(Debug, Clone)]
pub struct PreparedTransaction {
    pub header: TransactionHeader,
    /// Legs in construction order.
    pub legs: Vec<Leg>,
    pub summaries: Summaries,
}

impl PreparedTransaction {
    pub fn transaction_id(&self) -> TransactionId {
        self.header.transaction_id
    }

    /// Accounts touched by the transaction, sorted.
    pub fn account_ids(&self) -> Vec<AccountId> {
        self.summaries.keys().cloned().collect()
    }
}

/// Validate `operation` and turn it into a [`PreparedTransaction`].
///
/// - leg count must be even and non-zero
/// - legs must sum to exactly zero
pub fn build_transaction<O: Operation + ?Sized>(
    transaction_id: TransactionId,
    operation: &O,
) -> Result<PreparedTransaction, LedgerError> {
    operation.validate()?;

    let Draft { amount, legs } = operation.build_legs(transaction_id);
    if legs.is_empty() || legs.len() % 2 != 0 {
        return Err(LedgerError::InvalidEntryCount(legs.len()));
    }

    let mut summaries = Summaries::new();
    let mut sum = Amount::ZERO;
    for leg in &legs {
        sum = sum.checked_add(leg.amount).ok_or_else(out_of_range)?;
        let summary = summaries.entry(leg.account_id.clone()).or_default();
        *summary = summary.checked_add(leg.amount).ok_or_else(out_of_range)?;
    }
    if !sum.is_zero() {
        return Err(LedgerError::NotBalanced(sum));
    }

    Ok(PreparedTransaction {
        header: TransactionHeader {
            transaction_id,
            amount,
            created_at: Utc::now(),
        },
        legs,
        summaries,
    })
}

/// Move `amount` from one account to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub from: AccountId,
    pub to: AccountId,
    pub amount: Amount,
}

impl Transfer {
    pub fn new(from: impl Into<AccountId>, to: impl Into<AccountId>, amount: Amount) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            amount,
        }
    }
}

impl Operation for Transfer {
    fn validate(&self) -> Result<(), LedgerError> {
        if self.from.is_empty() {
            return Err(LedgerError::validation("from account cannot be empty"));
        }
        if self.to.is_empty() {
            return Err(LedgerError::validation("to account cannot be empty"));
        }
        if self.from == self.to {
            return Err(LedgerError::validation(
                "from and to account must be different",
            ));
        }
        validate_amount(self.amount)
    }

    fn build_legs(&self, transaction_id: TransactionId) -> Draft {
        Draft {
            amount: self.amount,
            legs: vec![
                // debit
                Leg {
                    transaction_id,
                    account_id: self.from.clone(),
                    amount: -self.amount,
                },
                // credit
                Leg {
                    transaction_id,
                    account_id: self.to.clone(),
                    amount: self.amount,
                },
            ],
        }
    }
}

/// One payee of a [`Settlement`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payout {
    pub to: AccountId,
    pub amount: Amount,
}

/// Pay several accounts out of one account in a single transaction.
///
/// Each payout becomes its own debit/credit pair, so the payer gets one leg per payout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub from: AccountId,
    pub payouts: Vec<Payout>,
}

impl Settlement {
    pub fn new(from: impl Into<AccountId>) -> Self {
        Self {
            from: from.into(),
            payouts: Vec::new(),
        }
    }

    pub fn pay(mut self, to: impl Into<AccountId>, amount: Amount) -> Self {
        self.payouts.push(Payout {
            to: to.into(),
            amount,
        });
        self
    }
}

impl Operation for Settlement {
    fn validate(&self) -> Result<(), LedgerError> {
        if self.from.is_empty() {
            return Err(LedgerError::validation("from account cannot be empty"));
        }
        if self.payouts.is_empty() {
            return Err(LedgerError::validation(
                "settlement needs at least one payout",
            ));
        }
        for payout in &self.payouts {
            if payout.to.is_empty() {
                return Err(LedgerError::validation("payout account cannot be empty"));
            }
            if payout.to == self.from {
                return Err(LedgerError::validation(format!(
                    "account {} cannot pay itself",
                    self.from
                )));
            }
            validate_amount(payout.amount)?;
        }
        self.payouts
            .iter()
            .try_fold(Amount::ZERO, |total, payout| total.checked_add(payout.amount))
            .ok_or_else(out_of_range)?;
        Ok(())
    }

    fn build_legs(&self, transaction_id: TransactionId) -> Draft {
        let legs = self
            .payouts
            .iter()
            .flat_map(|payout| {
                [
                    Leg {
                        transaction_id,
                        account_id: self.from.clone(),
                        amount: -payout.amount,
                    },
                    Leg {
                        transaction_id,
                        account_id: payout.to.clone(),
                        amount: payout.amount,
                    },
                ]
            })
            .collect();
        Draft {
            amount: self.payouts.iter().map(|payout| payout.amount).sum(),
            legs,
        }
    }
}

fn validate_amount(amount: Amount) -> Result<(), LedgerError> {
    if amount.is_zero() {
        return Err(LedgerError::validation("amount cannot be zero"));
    }
    if amount.is_negative() {
        return Err(LedgerError::validation(format!(
            "amount must be positive, got {amount}"
        )));
    }
    Ok(())
}

fn out_of_range() -> LedgerError {
    LedgerError::validation("amount out of range")
}
