//! The bank: account balances, transfers, and ledger settings.
//!
//! Balances live in the scoped store under the `Bank` owner, per (guild,
//! user) member scopes or per user scopes depending on the global-mode
//! flag. Every read-modify-write goes through a scoped mutation context,
//! so concurrent deposits and withdrawals on the same account serialize
//! and can never lose an update.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, instrument};

use herald_config::{Category, Config, ConfigError, Scope, StorageDriver};

use crate::error::{BankError, BankResult};

/// Hard ceiling on any balance and on the configurable maximum.
pub const MAX_BALANCE: u64 = i64::MAX as u64;

/// Owner name the ledger registers under.
pub const BANK_OWNER: &str = "Bank";

const DEFAULT_BANK_NAME: &str = "Herald Bank";
const DEFAULT_CURRENCY: &str = "credits";
const DEFAULT_BALANCE: u64 = 100;

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// One account row as persisted per scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Display name recorded on first write.
    pub name: String,
    /// Current balance, always within `0..=max_balance`.
    pub balance: u64,
    /// Unix timestamp of the first write to this account; 0 while unset.
    pub created_at: i64,
}

fn decode_account(value: &Value) -> BankResult<Account> {
    let balance = value
        .get("balance")
        .and_then(Value::as_u64)
        .ok_or_else(|| ConfigError::out_of_range("stored balance is negative or not an integer"))?;
    Ok(Account {
        name: value
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        balance,
        created_at: value.get("created_at").and_then(Value::as_i64).unwrap_or(0),
    })
}

// ---------------------------------------------------------------------------
// Bank
// ---------------------------------------------------------------------------

/// Handle to the economy ledger. Cheap to clone.
#[derive(Clone)]
pub struct Bank {
    config: Config,
}

impl Bank {
    /// Create the ledger over `driver` and register its schemas.
    pub fn new(driver: Arc<dyn StorageDriver>) -> BankResult<Self> {
        let config = Config::new(BANK_OWNER, driver);

        config.register_global(json!({
            "is_global": false,
            "bank_name": DEFAULT_BANK_NAME,
            "currency": DEFAULT_CURRENCY,
            "default_balance": DEFAULT_BALANCE,
            "max_balance": MAX_BALANCE,
        }))?;
        config.register_guild(json!({
            "bank_name": DEFAULT_BANK_NAME,
            "currency": DEFAULT_CURRENCY,
            "default_balance": DEFAULT_BALANCE,
            "max_balance": MAX_BALANCE,
        }))?;
        let account_defaults = json!({"name": "", "balance": 0, "created_at": 0});
        config.register_member(account_defaults.clone())?;
        config.register_user(account_defaults)?;

        Ok(Self { config })
    }

    /// The store handle backing this ledger.
    pub fn config(&self) -> &Config {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Mode
    // -----------------------------------------------------------------------

    /// Whether balances are global (per user) rather than per guild.
    pub async fn is_global(&self) -> BankResult<bool> {
        let value = self.config.global().value("is_global").await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Switch between global and per-guild balances.
    ///
    /// Switching wipes the outgoing mode's accounts so stale balances can
    /// never resurface when switching back. A no-op when the flag already
    /// matches.
    #[instrument(skip(self))]
    pub async fn set_global(&self, global: bool) -> BankResult<bool> {
        let mut ctx = self.config.global().scoped("is_global").await?;
        let current = ctx.value().as_bool().unwrap_or(false);
        if current == global {
            return Ok(global);
        }

        // Wipe the mode being left behind before the flag flips.
        let outgoing = if current {
            Category::User
        } else {
            Category::Member
        };
        self.config.clear_category(&outgoing).await?;

        ctx.replace(json!(global));
        ctx.commit().await?;
        info!(global, "bank mode switched");
        Ok(global)
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    /// Name of the bank, per guild unless the bank is global.
    pub async fn bank_name(&self, guild: Option<&str>) -> BankResult<String> {
        self.setting_str("bank_name", guild).await
    }

    pub async fn set_bank_name(&self, name: &str, guild: Option<&str>) -> BankResult<()> {
        let scope = self.settings_scope(guild).await?;
        Ok(scope.set("bank_name", json!(name)).await?)
    }

    /// Currency name, per guild unless the bank is global.
    pub async fn currency(&self, guild: Option<&str>) -> BankResult<String> {
        self.setting_str("currency", guild).await
    }

    pub async fn set_currency(&self, name: &str, guild: Option<&str>) -> BankResult<()> {
        let scope = self.settings_scope(guild).await?;
        Ok(scope.set("currency", json!(name)).await?)
    }

    /// Balance a materialized fresh account starts with.
    pub async fn default_balance(&self, guild: Option<&str>) -> BankResult<u64> {
        self.setting_u64("default_balance", guild).await
    }

    pub async fn set_default_balance(&self, amount: u64, guild: Option<&str>) -> BankResult<()> {
        let max = self.max_balance(guild).await?;
        if amount > max {
            return Err(BankError::BalanceTooHigh { amount, max });
        }
        let scope = self.settings_scope(guild).await?;
        Ok(scope.set("default_balance", json!(amount)).await?)
    }

    /// Upper bound on any single balance.
    pub async fn max_balance(&self, guild: Option<&str>) -> BankResult<u64> {
        self.setting_u64("max_balance", guild).await
    }

    pub async fn set_max_balance(&self, amount: u64, guild: Option<&str>) -> BankResult<()> {
        if amount == 0 || amount > MAX_BALANCE {
            return Err(BankError::BalanceTooHigh {
                amount,
                max: MAX_BALANCE,
            });
        }
        let scope = self.settings_scope(guild).await?;
        Ok(scope.set("max_balance", json!(amount)).await?)
    }

    /// The scope carrying bank settings: global in global mode, the
    /// guild's own scope otherwise.
    async fn settings_scope(&self, guild: Option<&str>) -> BankResult<Scope> {
        if self.is_global().await? {
            Ok(self.config.global())
        } else {
            let guild = guild.ok_or(BankError::GuildRequired)?;
            Ok(self.config.guild(guild))
        }
    }

    async fn setting_str(&self, field: &str, guild: Option<&str>) -> BankResult<String> {
        let value = self.settings_scope(guild).await?.value(field).await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                BankError::Config(ConfigError::SchemaMismatch {
                    reason: format!("bank setting `{field}` is not a string"),
                })
            })
    }

    async fn setting_u64(&self, field: &str, guild: Option<&str>) -> BankResult<u64> {
        let value = self.settings_scope(guild).await?.value(field).await?;
        value
            .as_u64()
            .ok_or_else(|| ConfigError::out_of_range(format!("bank setting `{field}` is not a non-negative integer")).into())
    }

    // -----------------------------------------------------------------------
    // Accounts
    // -----------------------------------------------------------------------

    /// The scope holding one account under the current mode.
    async fn account_scope(&self, guild: Option<&str>, user: &str) -> BankResult<Scope> {
        if self.is_global().await? {
            Ok(self.config.user(user))
        } else {
            let guild = guild.ok_or(BankError::GuildRequired)?;
            Ok(self.config.member(guild, user))
        }
    }

    /// Current balance. Fresh accounts read 0 until materialized.
    pub async fn balance(&self, guild: Option<&str>, user: &str) -> BankResult<u64> {
        let scope = self.account_scope(guild, user).await?;
        let account = decode_account(&scope.all().await?)?;
        Ok(account.balance)
    }

    /// Whether the account can cover `amount`.
    pub async fn can_spend(&self, guild: Option<&str>, user: &str, amount: u64) -> BankResult<bool> {
        Ok(self.balance(guild, user).await? >= amount)
    }

    /// The account row, materializing the configured default balance for
    /// an account with no stored row. Does not write.
    pub async fn account(&self, guild: Option<&str>, user: &str) -> BankResult<Account> {
        let scope = self.account_scope(guild, user).await?;
        let ctx = scope.scoped_all().await?;
        let mut account = decode_account(ctx.value())?;
        if ctx.is_default() {
            account.balance = self.default_balance(guild).await?;
            account.name = user.to_string();
        }
        ctx.abort();
        Ok(account)
    }

    /// Set the balance outright. Seeds the account's name and creation
    /// time on first write.
    #[instrument(skip(self))]
    pub async fn set_balance(
        &self,
        guild: Option<&str>,
        user: &str,
        amount: u64,
    ) -> BankResult<u64> {
        let max = self.max_balance(guild).await?;
        if amount > max {
            return Err(BankError::BalanceTooHigh { amount, max });
        }

        let scope = self.account_scope(guild, user).await?;
        let mut ctx = scope.scoped_all().await?;
        let mut account = decode_account(ctx.value())?;
        account.balance = amount;
        seed_account(&mut account, user);
        ctx.replace(serde_json::to_value(&account)?);
        ctx.commit().await?;
        Ok(amount)
    }

    /// Add `amount` to the account, rejecting the deposit before any
    /// write if it would exceed the maximum balance.
    #[instrument(skip(self))]
    pub async fn deposit(&self, guild: Option<&str>, user: &str, amount: u64) -> BankResult<u64> {
        let max = self.max_balance(guild).await?;
        let scope = self.account_scope(guild, user).await?;

        let mut ctx = scope.scoped_all().await?;
        let mut account = decode_account(ctx.value())?;
        let new_balance = account
            .balance
            .checked_add(amount)
            .filter(|b| *b <= max)
            .ok_or(BankError::BalanceTooHigh {
                amount: account.balance.saturating_add(amount),
                max,
            })?;
        account.balance = new_balance;
        seed_account(&mut account, user);
        ctx.replace(serde_json::to_value(&account)?);
        ctx.commit().await?;
        Ok(new_balance)
    }

    /// Remove `amount` from the account, rejecting the withdrawal before
    /// any write if funds are insufficient.
    #[instrument(skip(self))]
    pub async fn withdraw(&self, guild: Option<&str>, user: &str, amount: u64) -> BankResult<u64> {
        let scope = self.account_scope(guild, user).await?;

        let mut ctx = scope.scoped_all().await?;
        let mut account = decode_account(ctx.value())?;
        let new_balance =
            account
                .balance
                .checked_sub(amount)
                .ok_or(BankError::InsufficientFunds {
                    balance: account.balance,
                    amount,
                })?;
        account.balance = new_balance;
        seed_account(&mut account, user);
        ctx.replace(serde_json::to_value(&account)?);
        ctx.commit().await?;
        Ok(new_balance)
    }

    /// Move `amount` from one account to another. The receiving side's
    /// cap is checked before the withdrawal so a failed transfer leaves
    /// both balances untouched.
    #[instrument(skip(self))]
    pub async fn transfer(
        &self,
        guild: Option<&str>,
        from: &str,
        to: &str,
        amount: u64,
    ) -> BankResult<u64> {
        let max = self.max_balance(guild).await?;
        let to_balance = self.balance(guild, to).await?;
        if to_balance.saturating_add(amount) > max {
            return Err(BankError::BalanceTooHigh {
                amount: to_balance.saturating_add(amount),
                max,
            });
        }

        self.withdraw(guild, from, amount).await?;
        self.deposit(guild, to, amount).await
    }

    // -----------------------------------------------------------------------
    // Bulk operations
    // -----------------------------------------------------------------------

    /// Accounts ordered by balance, highest first, over stored rows only.
    ///
    /// In per-guild mode a guild is required and the board covers that
    /// guild; in global mode it covers every user.
    pub async fn leaderboard(
        &self,
        guild: Option<&str>,
        top: Option<usize>,
    ) -> BankResult<Vec<(String, Account)>> {
        let rows: Vec<(String, Account)> = if self.is_global().await? {
            self.config
                .all_users()
                .await?
                .into_iter()
                .map(|(user, doc)| Ok((user, decode_account(&doc)?)))
                .collect::<BankResult<_>>()?
        } else {
            let guild = guild.ok_or(BankError::GuildRequired)?;
            self.config
                .all_members()
                .await?
                .remove(guild)
                .unwrap_or_default()
                .into_iter()
                .map(|(user, doc)| Ok((user, decode_account(&doc)?)))
                .collect::<BankResult<_>>()?
        };

        let mut rows = rows;
        rows.sort_by(|a, b| b.1.balance.cmp(&a.1.balance).then_with(|| a.0.cmp(&b.0)));
        if let Some(top) = top {
            rows.truncate(top);
        }
        Ok(rows)
    }

    /// Destroy account data for the current mode: one guild's accounts,
    /// or every account when the bank is global (or no guild is given).
    #[instrument(skip(self))]
    pub async fn wipe(&self, guild: Option<&str>) -> BankResult<()> {
        if self.is_global().await? {
            self.config.clear_category(&Category::User).await?;
        } else {
            match guild {
                Some(guild) => self.config.members_of(guild).clear_scope().await?,
                None => self.config.clear_category(&Category::Member).await?,
            }
        }
        info!("bank wiped");
        Ok(())
    }
}

/// Stamp first-write metadata on an account row.
fn seed_account(account: &mut Account, user: &str) {
    if account.created_at == 0 {
        account.created_at = Utc::now().timestamp();
    }
    if account.name.is_empty() {
        account.name = user.to_string();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use herald_config::JsonDriver;

    async fn bank(dir: &tempfile::TempDir) -> Bank {
        Bank::new(Arc::new(JsonDriver::new(dir.path()))).unwrap()
    }

    #[tokio::test]
    async fn fresh_account_has_zero_stored_balance() {
        let dir = tempfile::TempDir::new().unwrap();
        let bank = bank(&dir).await;
        assert_eq!(bank.balance(Some("g1"), "u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn materialized_account_gets_the_default_balance() {
        let dir = tempfile::TempDir::new().unwrap();
        let bank = bank(&dir).await;

        let account = bank.account(Some("g1"), "u1").await.unwrap();
        assert_eq!(account.balance, DEFAULT_BALANCE);
        assert_eq!(account.name, "u1");

        // account() never writes.
        assert_eq!(bank.balance(Some("g1"), "u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn deposits_cap_at_max_balance() {
        let dir = tempfile::TempDir::new().unwrap();
        let bank = bank(&dir).await;
        bank.set_max_balance(100, Some("g1")).await.unwrap();
        bank.set_balance(Some("g1"), "u1", 90).await.unwrap();

        let err = bank.deposit(Some("g1"), "u1", 20).await.unwrap_err();
        assert!(matches!(err, BankError::BalanceTooHigh { max: 100, .. }));
        // Rejected before any write.
        assert_eq!(bank.balance(Some("g1"), "u1").await.unwrap(), 90);

        bank.deposit(Some("g1"), "u1", 10).await.unwrap();
        assert_eq!(bank.balance(Some("g1"), "u1").await.unwrap(), 100);
    }

    #[tokio::test]
    async fn per_guild_mode_requires_a_guild() {
        let dir = tempfile::TempDir::new().unwrap();
        let bank = bank(&dir).await;
        assert!(matches!(
            bank.balance(None, "u1").await,
            Err(BankError::GuildRequired)
        ));
    }

    #[tokio::test]
    async fn guilds_do_not_share_accounts() {
        let dir = tempfile::TempDir::new().unwrap();
        let bank = bank(&dir).await;
        bank.set_balance(Some("g1"), "u1", 40).await.unwrap();
        assert_eq!(bank.balance(Some("g2"), "u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn leaderboard_orders_by_balance_descending() {
        let dir = tempfile::TempDir::new().unwrap();
        let bank = bank(&dir).await;
        bank.set_balance(Some("g1"), "alice", 30).await.unwrap();
        bank.set_balance(Some("g1"), "bob", 70).await.unwrap();
        bank.set_balance(Some("g1"), "carol", 50).await.unwrap();
        bank.set_balance(Some("g2"), "mallory", 999).await.unwrap();

        let board = bank.leaderboard(Some("g1"), Some(2)).await.unwrap();
        let names: Vec<&str> = board.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, ["bob", "carol"]);
    }

    #[tokio::test]
    async fn wiping_one_guild_spares_the_rest() {
        let dir = tempfile::TempDir::new().unwrap();
        let bank = bank(&dir).await;
        bank.set_balance(Some("g1"), "u1", 10).await.unwrap();
        bank.set_balance(Some("g2"), "u1", 20).await.unwrap();

        bank.wipe(Some("g1")).await.unwrap();
        assert_eq!(bank.balance(Some("g1"), "u1").await.unwrap(), 0);
        assert_eq!(bank.balance(Some("g2"), "u1").await.unwrap(), 20);
    }

    #[tokio::test]
    async fn first_write_seeds_name_and_created_at() {
        let dir = tempfile::TempDir::new().unwrap();
        let bank = bank(&dir).await;
        bank.deposit(Some("g1"), "u1", 5).await.unwrap();

        let account = bank.account(Some("g1"), "u1").await.unwrap();
        assert_eq!(account.name, "u1");
        assert!(account.created_at > 0);
        assert_eq!(account.balance, 5);
    }
}
