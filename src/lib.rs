pub mod amount;
pub mod builder;
pub mod check;
pub mod config;
pub mod csv;
pub mod engine;
pub mod model;
pub mod store;

pub use amount::Amount;
pub use builder::{Operation, Settlement, Transfer};
pub use config::Config;
pub use engine::{ErrorKind, Ledger, LedgerError, Rejection, Stage};
pub use model::{AccountId, AccountType, TransactionId};
pub use store::{MemoryStore, Store, StoreError};
