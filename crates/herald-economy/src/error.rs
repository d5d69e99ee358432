//! Error types for the economy ledger.

use herald_config::ConfigError;
use thiserror::Error;

/// Alias for `Result<T, BankError>`.
pub type BankResult<T> = Result<T, BankError>;

/// Errors raised by ledger operations.
#[derive(Debug, Error)]
pub enum BankError {
    /// The account cannot cover the requested amount. Rejected before any
    /// write; the balance is unchanged.
    #[error("insufficient funds: balance is {balance}, tried to spend {amount}")]
    InsufficientFunds { balance: u64, amount: u64 },

    /// The operation would push a balance over the configured maximum.
    /// Rejected before any write.
    #[error("balance {amount} exceeds the maximum of {max}")]
    BalanceTooHigh { amount: u64, max: u64 },

    /// A per-guild-mode operation was attempted without a guild.
    #[error("a guild is required while the bank is in per-guild mode")]
    GuildRequired,

    /// Underlying store failure.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<serde_json::Error> for BankError {
    fn from(err: serde_json::Error) -> Self {
        BankError::Config(ConfigError::from(err))
    }
}
