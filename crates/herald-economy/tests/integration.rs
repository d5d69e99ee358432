//! Integration tests for the economy ledger over the file driver.

use std::sync::Arc;

use herald_config::JsonDriver;
use herald_economy::{Bank, BankError};

fn bank(dir: &tempfile::TempDir) -> Bank {
    Bank::new(Arc::new(JsonDriver::new(dir.path()))).unwrap()
}

// ═══════════════════════════════════════════════════════════════════════
//  Withdraw / transfer scenario
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn withdraw_and_transfer_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let bank = bank(&dir);
    bank.set_global(true).await.unwrap();

    bank.set_balance(None, "userA", 50).await.unwrap();

    assert_eq!(bank.withdraw(None, "userA", 30).await.unwrap(), 20);

    let err = bank.withdraw(None, "userA", 100).await.unwrap_err();
    assert!(matches!(
        err,
        BankError::InsufficientFunds {
            balance: 20,
            amount: 100
        }
    ));
    assert_eq!(bank.balance(None, "userA").await.unwrap(), 20);

    bank.transfer(None, "userA", "userB", 20).await.unwrap();
    assert_eq!(bank.balance(None, "userA").await.unwrap(), 0);
    assert_eq!(bank.balance(None, "userB").await.unwrap(), 20);
}

#[tokio::test]
async fn failed_transfer_leaves_both_balances_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let bank = bank(&dir);
    bank.set_max_balance(100, Some("g1")).await.unwrap();
    bank.set_balance(Some("g1"), "sender", 80).await.unwrap();
    bank.set_balance(Some("g1"), "receiver", 90).await.unwrap();

    let err = bank
        .transfer(Some("g1"), "sender", "receiver", 50)
        .await
        .unwrap_err();
    assert!(matches!(err, BankError::BalanceTooHigh { .. }));
    assert_eq!(bank.balance(Some("g1"), "sender").await.unwrap(), 80);
    assert_eq!(bank.balance(Some("g1"), "receiver").await.unwrap(), 90);
}

// ═══════════════════════════════════════════════════════════════════════
//  Concurrency
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn concurrent_deposits_on_one_account_all_land() {
    let dir = tempfile::tempdir().unwrap();
    let bank = bank(&dir);
    bank.set_balance(Some("g1"), "u1", 0).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let bank = bank.clone();
        tasks.push(tokio::spawn(async move {
            bank.deposit(Some("g1"), "u1", 1).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(bank.balance(Some("g1"), "u1").await.unwrap(), 10);
}

// ═══════════════════════════════════════════════════════════════════════
//  Mode switching
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn switching_modes_wipes_the_outgoing_mode() {
    let dir = tempfile::tempdir().unwrap();
    let bank = bank(&dir);

    bank.set_balance(Some("g1"), "u1", 42).await.unwrap();

    // per-guild -> global wipes the member rows.
    bank.set_global(true).await.unwrap();
    bank.set_balance(None, "u1", 7).await.unwrap();

    // global -> per-guild wipes the user rows; the old member rows were
    // already gone, so everything reads as default.
    bank.set_global(false).await.unwrap();
    assert_eq!(bank.balance(Some("g1"), "u1").await.unwrap(), 0);

    bank.set_global(true).await.unwrap();
    assert_eq!(bank.balance(None, "u1").await.unwrap(), 0);
}

#[tokio::test]
async fn double_switch_with_no_writes_leaves_all_balances_at_default() {
    let dir = tempfile::tempdir().unwrap();
    let bank = bank(&dir);
    bank.set_balance(Some("g1"), "u1", 42).await.unwrap();

    bank.set_global(true).await.unwrap();
    bank.set_global(false).await.unwrap();
    bank.set_global(true).await.unwrap();
    bank.set_global(false).await.unwrap();

    assert_eq!(bank.balance(Some("g1"), "u1").await.unwrap(), 0);
    assert!(bank.leaderboard(Some("g1"), None).await.unwrap().is_empty());
}

#[tokio::test]
async fn setting_the_same_mode_twice_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let bank = bank(&dir);
    bank.set_balance(Some("g1"), "u1", 42).await.unwrap();

    bank.set_global(false).await.unwrap();
    assert_eq!(bank.balance(Some("g1"), "u1").await.unwrap(), 42);
}

// ═══════════════════════════════════════════════════════════════════════
//  Settings scoping
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn settings_are_per_guild_until_the_bank_goes_global() {
    let dir = tempfile::tempdir().unwrap();
    let bank = bank(&dir);

    bank.set_bank_name("First Bank of g1", Some("g1"))
        .await
        .unwrap();
    assert_eq!(
        bank.bank_name(Some("g1")).await.unwrap(),
        "First Bank of g1"
    );
    assert_eq!(bank.bank_name(Some("g2")).await.unwrap(), "Herald Bank");

    bank.set_global(true).await.unwrap();
    bank.set_bank_name("Herald Reserve", None).await.unwrap();
    assert_eq!(bank.bank_name(None).await.unwrap(), "Herald Reserve");
}

#[tokio::test]
async fn balances_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let bank = bank(&dir);
        bank.set_balance(Some("g1"), "u1", 123).await.unwrap();
    }
    let bank = bank(&dir);
    assert_eq!(bank.balance(Some("g1"), "u1").await.unwrap(), 123);
}
