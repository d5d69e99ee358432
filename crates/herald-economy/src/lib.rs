//! # herald-economy
//!
//! Economy ledger for the Herald platform, built entirely on the scoped
//! configuration store's public accessors. Balances are non-negative,
//! bounded integers held per (guild, user) or per user depending on the
//! bank's global-mode flag; every read-modify-write sequence runs inside
//! a scoped mutation context so concurrent operations on one account
//! cannot race.

pub mod bank;
pub mod error;

pub use bank::{Account, BANK_OWNER, Bank, MAX_BALANCE};
pub use error::{BankError, BankResult};
