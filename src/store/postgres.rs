//! Postgres-backed [`Store`].
//!
//! Row locks are real `SELECT ... FOR UPDATE` locks taken inside a Read-Committed
//! transaction. Every unit of work sets its own `lock_timeout`, so a stuck
//! writer surfaces as [`StoreError::LockTimeout`] instead of hanging.
//!
//! Several processes may share one database. Entry timestamps come from each
//! process's wall clock, but every locked row also carries the newest
//! timestamp already written for its account (served by
//! `accounts_ledger_account_idx`), and new legs are stamped after it. History
//! order per account is therefore commit order even when clocks drift.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|-----------------------|------------|
//! | Database (unique violation) | `23505` | `DuplicateAccount` / `DuplicateTransaction` / `DuplicateEntry`, per statement |
//! | Database (lock not available) | `55P03` | `LockTimeout` |
//! | Database (serialization failure, deadlock) | `40001`, `40P01` | `Conflict` |
//! | Database (other) | Any other | `Backend` |
//! | PoolTimedOut, PoolClosed, Io, Tls | N/A | `Unavailable` |
//! | Other | N/A | `Backend` |

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};

use super::{Store, StoreError, UnitOfWork};
use crate::Amount;
use crate::model::{
    Account, AccountBalance, AccountId, AccountType, BalanceUpdate, LedgerEntry, LockedBalance,
    TransactionHeader, TransactionId,
};

const SCHEMA: &str = include_str!("../../migrations/0001_ledger.sql");

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PostgresStore {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    /// Open a connection pool to `url`.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        lock_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, lock_timeout))
    }

    /// Create the ledger tables if they do not exist yet.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PostgresStore {
    type Tx = PostgresUnitOfWork;

    async fn begin(&self) -> Result<PostgresUnitOfWork, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_isolation", e))?;
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_timeout.as_millis()))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_lock_timeout", e))?;

        Ok(PostgresUnitOfWork {
            tx,
            lock_timeout: self.lock_timeout,
        })
    }

    #[instrument(skip(self, account), fields(account = %account.id), err)]
    async fn create_account(&self, account: &Account) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        sqlx::query(
            r#"
            INSERT INTO accounts (account_id, account_type, allow_negative_balance, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&account.id)
        .bind(account.account_type.as_str())
        .bind(account.allow_negative_balance)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateAccount(account.id.clone())
            } else {
                map_sqlx_error("insert_account", e)
            }
        })?;

        let opening = AccountBalance::opening(account);
        sqlx::query(
            r#"
            INSERT INTO accounts_balance (account_id, allow_negative, balance, last_transaction_id, created_at, updated_at)
            VALUES ($1, $2, $3, NULL, $4, $5)
            "#,
        )
        .bind(&opening.account_id)
        .bind(opening.allow_negative)
        .bind(opening.balance.as_decimal())
        .bind(opening.created_at)
        .bind(opening.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_account_balance", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    async fn get_account(&self, account_id: &str) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT account_id, account_type, allow_negative_balance, created_at, updated_at
            FROM accounts
            WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_account", e))?;

        row.map(|row| account_from_row(&row)).transpose()
    }

    async fn get_balances(
        &self,
        account_ids: &[AccountId],
    ) -> Result<Vec<AccountBalance>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT account_id, allow_negative, balance, last_transaction_id, created_at, updated_at
            FROM accounts_balance
            WHERE account_id = ANY($1)
            ORDER BY account_id
            "#,
        )
        .bind(account_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_balances", e))?;

        rows.iter()
            .map(|row| {
                Ok(AccountBalance {
                    account_id: row.try_get("account_id")?,
                    allow_negative: row.try_get("allow_negative")?,
                    balance: Amount::new(row.try_get("balance")?),
                    last_transaction_id: row.try_get("last_transaction_id")?,
                    created_at: row.try_get("created_at")?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(|e| map_sqlx_error("decode_balance", e))
    }

    async fn get_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Option<TransactionHeader>, StoreError> {
        let row = sqlx::query(
            "SELECT transaction_id, amount, created_at FROM transactions WHERE transaction_id = $1",
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_transaction", e))?;

        row.map(|row| {
            Ok(TransactionHeader {
                transaction_id: row.try_get("transaction_id")?,
                amount: Amount::new(row.try_get("amount")?),
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
        .map_err(|e| map_sqlx_error("decode_transaction", e))
    }

    async fn get_entries_by_account(
        &self,
        account_id: &str,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT transaction_id, account_id, amount, previous_balance, current_balance, created_at, "timestamp"
            FROM accounts_ledger
            WHERE account_id = $1
            ORDER BY "timestamp" ASC
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_entries_by_account", e))?;

        entries_from_rows(&rows)
    }

    async fn get_entries_by_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT transaction_id, account_id, amount, previous_balance, current_balance, created_at, "timestamp"
            FROM accounts_ledger
            WHERE transaction_id = $1
            ORDER BY "timestamp" ASC
            "#,
        )
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_entries_by_transaction", e))?;

        entries_from_rows(&rows)
    }
}

/// One Postgres transaction. Dropping it without commit rolls back.
pub struct PostgresUnitOfWork {
    tx: Transaction<'static, Postgres>,
    lock_timeout: Duration,
}

#[async_trait]
impl UnitOfWork for PostgresUnitOfWork {
    async fn lock_balances(
        &mut self,
        account_ids: &[AccountId],
    ) -> Result<Vec<LockedBalance>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT ab.account_id, ab.balance, ab.allow_negative,
                COALESCE(
                    (SELECT max(l."timestamp") FROM accounts_ledger l
                     WHERE l.account_id = ab.account_id),
                    0
                ) AS last_timestamp
            FROM accounts_balance ab
            WHERE ab.account_id = ANY($1)
            ORDER BY ab.account_id
            FOR UPDATE OF ab
            "#,
        )
        .bind(account_ids)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| {
            if sqlstate(&e).as_deref() == Some("55P03") {
                StoreError::LockTimeout(self.lock_timeout)
            } else {
                map_sqlx_error("lock_balances", e)
            }
        })?;

        let locked = rows
            .iter()
            .map(|row| {
                Ok(LockedBalance {
                    account_id: row.try_get("account_id")?,
                    balance: Amount::new(row.try_get("balance")?),
                    allow_negative: row.try_get("allow_negative")?,
                    last_timestamp: row.try_get("last_timestamp")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| map_sqlx_error("decode_locked_balance", e))?;
        debug!(rows = locked.len(), "balance rows locked");
        Ok(locked)
    }

    async fn insert_transaction(&mut self, header: &TransactionHeader) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO transactions (transaction_id, amount, created_at) VALUES ($1, $2, $3)")
            .bind(header.transaction_id)
            .bind(header.amount.as_decimal())
            .bind(header.created_at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::DuplicateTransaction(header.transaction_id)
                } else {
                    map_sqlx_error("insert_transaction", e)
                }
            })?;
        Ok(())
    }

    async fn update_balances(&mut self, updates: &[BalanceUpdate]) -> Result<(), StoreError> {
        let account_ids: Vec<&str> = updates.iter().map(|u| u.account_id.as_str()).collect();
        let balances: Vec<Decimal> = updates.iter().map(|u| u.balance.as_decimal()).collect();
        let transaction_ids: Vec<TransactionId> =
            updates.iter().map(|u| u.last_transaction_id).collect();
        let updated_at: Vec<DateTime<Utc>> = updates.iter().map(|u| u.updated_at).collect();

        let result = sqlx::query(
            r#"
            UPDATE accounts_balance AS ab SET
                balance = v.balance,
                last_transaction_id = v.transaction_id,
                updated_at = v.updated_at
            FROM UNNEST($1::text[], $2::numeric[], $3::uuid[], $4::timestamptz[])
                AS v(account_id, balance, transaction_id, updated_at)
            WHERE ab.account_id = v.account_id
            "#,
        )
        .bind(&account_ids)
        .bind(&balances)
        .bind(&transaction_ids)
        .bind(&updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_balances", e))?;

        if result.rows_affected() != updates.len() as u64 {
            return Err(StoreError::Backend(format!(
                "updated {} balance rows, expected {}",
                result.rows_affected(),
                updates.len()
            )));
        }
        Ok(())
    }

    async fn insert_entries(&mut self, entries: &[LedgerEntry]) -> Result<(), StoreError> {
        let Some(first) = entries.first() else {
            return Ok(());
        };

        let transaction_ids: Vec<TransactionId> = entries.iter().map(|e| e.transaction_id).collect();
        let account_ids: Vec<&str> = entries.iter().map(|e| e.account_id.as_str()).collect();
        let amounts: Vec<Decimal> = entries.iter().map(|e| e.amount.as_decimal()).collect();
        let previous: Vec<Decimal> = entries
            .iter()
            .map(|e| e.previous_balance.as_decimal())
            .collect();
        let current: Vec<Decimal> = entries
            .iter()
            .map(|e| e.current_balance.as_decimal())
            .collect();
        let created_at: Vec<DateTime<Utc>> = entries.iter().map(|e| e.created_at).collect();
        let timestamps: Vec<i64> = entries.iter().map(|e| e.timestamp).collect();

        sqlx::query(
            r#"
            INSERT INTO accounts_ledger
                (transaction_id, account_id, amount, previous_balance, current_balance, created_at, "timestamp")
            SELECT * FROM UNNEST(
                $1::uuid[], $2::text[], $3::numeric[], $4::numeric[], $5::numeric[], $6::timestamptz[], $7::int8[]
            )
            "#,
        )
        .bind(&transaction_ids)
        .bind(&account_ids)
        .bind(&amounts)
        .bind(&previous)
        .bind(&current)
        .bind(&created_at)
        .bind(&timestamps)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateEntry {
                    transaction_id: first.transaction_id,
                    account_id: first.account_id.clone(),
                }
            } else {
                map_sqlx_error("insert_entries", e)
            }
        })?;
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

fn account_from_row(row: &PgRow) -> Result<Account, StoreError> {
    let decode = |e| map_sqlx_error("decode_account", e);
    let account_type: String = row.try_get("account_type").map_err(decode)?;
    Ok(Account {
        id: row.try_get("account_id").map_err(decode)?,
        account_type: account_type
            .parse::<AccountType>()
            .map_err(StoreError::Backend)?,
        allow_negative_balance: row.try_get("allow_negative_balance").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

fn entries_from_rows(rows: &[PgRow]) -> Result<Vec<LedgerEntry>, StoreError> {
    rows.iter()
        .map(|row| {
            Ok(LedgerEntry {
                transaction_id: row.try_get("transaction_id")?,
                account_id: row.try_get("account_id")?,
                amount: Amount::new(row.try_get("amount")?),
                previous_balance: Amount::new(row.try_get("previous_balance")?),
                current_balance: Amount::new(row.try_get("current_balance")?),
                created_at: row.try_get("created_at")?,
                timestamp: row.try_get("timestamp")?,
            })
        })
        .collect::<Result<_, sqlx::Error>>()
        .map_err(|e| map_sqlx_error("decode_entry", e))
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code.into_owned())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    sqlstate(err).as_deref() == Some("23505")
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("40001") | Some("40P01") => StoreError::Conflict(msg),
                Some("55P03") => StoreError::Unavailable(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool unavailable in {}", operation))
        }
        sqlx::Error::Io(e) => StoreError::Unavailable(format!("io error in {}: {}", operation, e)),
        sqlx::Error::Tls(e) => StoreError::Unavailable(format!("tls error in {}: {}", operation, e)),
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}
