use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::amount::AmountError;
use crate::builder::Transfer;
use crate::model::{AccountBalance, AccountId, AccountType, Command};

/// Errors that can occur when reading commands or writing balances
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("failed to open {path}: {source}")]
    Open { path: String, source: csv::Error },

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized command type '{command}'")]
    UnrecognizedType { line: usize, command: String },

    #[error("line {line}: {command} missing {field}")]
    MissingField {
        line: usize,
        command: &'static str,
        field: &'static str,
    },

    #[error("line {line}: invalid amount: {source}")]
    InvalidAmount { line: usize, source: AmountError },

    #[error("line {line}: {reason}")]
    InvalidAccountType { line: usize, reason: String },

    #[error("failed to write balances: {0}")]
    Write(#[from] csv::Error),

    #[error("failed to flush balances: {0}")]
    Flush(#[from] io::Error),
}

#[derive(Debug, Deserialize)]
struct InputRow {
    r#type: String,
    account: Option<AccountId>,
    to: Option<AccountId>,
    amount: Option<String>,
    account_type: Option<String>,
}

#[derive(Debug, Serialize)]
struct OutputRow {
    account: AccountId,
    balance: String,
    allow_negative: bool,
    last_transaction: String,
}

/// Read ledger commands from a csv file
pub fn read_commands(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<Command, CsvError>>, CsvError> {
    let path = path.as_ref();
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| CsvError::Open {
            path: path.display().to_string(),
            source,
        })?;

    Ok(reader
        .into_deserialize::<InputRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            parse_row(line, row)
        }))
}

fn parse_row(line: usize, row: InputRow) -> Result<Command, CsvError> {
    match row.r#type.as_str() {
        "open" => {
            let account_type = row
                .account_type
                .map(|raw| raw.parse::<AccountType>())
                .transpose()
                .map_err(|reason| CsvError::InvalidAccountType { line, reason })?;
            Ok(Command::Open {
                account: row.account,
                account_type,
            })
        }
        "transfer" => {
            let missing = |field| CsvError::MissingField {
                line,
                command: "transfer",
                field,
            };
            let from = row.account.ok_or_else(|| missing("account"))?;
            let to = row.to.ok_or_else(|| missing("to"))?;
            let amount = row
                .amount
                .ok_or_else(|| missing("amount"))?
                .parse()
                .map_err(|source| CsvError::InvalidAmount { line, source })?;
            Ok(Command::Transfer(Transfer::new(from, to, amount)))
        }
        other => Err(CsvError::UnrecognizedType {
            line,
            command: other.to_string(),
        }),
    }
}

/// Write account balances in csv format
pub fn write_balances(
    writer: impl io::Write,
    balances: impl IntoIterator<Item = AccountBalance>,
) -> Result<(), CsvError> {
    let mut writer = csv::Writer::from_writer(writer);

    for balance in balances {
        let row = OutputRow {
            account: balance.account_id,
            balance: balance.balance.to_string(),
            allow_negative: balance.allow_negative,
            last_transaction: balance
                .last_transaction_id
                .map(|id| id.to_string())
                .unwrap_or_default(),
        };
        writer.serialize(&row)?;
    }

    writer.flush()?;
    Ok(())
}
