//! End-to-end flows through the custody engine
//!
//! Deposits, investments, referral cascades and withdrawals against a real
//! RocksDB directory and the mock chain transport.

use chrono::{Duration as ChronoDuration, Utc};
use custody_engine::{
    chain::mock::MockChainTransport, ConfirmOutcome, CustodyEngine, EngineConfig, Error,
    Resolution,
};
use ledger_core::{
    Amount, NewUser, OperationType, Sequence, UserId, WithdrawalRequest, WithdrawalStatus,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    engine: Arc<CustodyEngine>,
    chain: Arc<MockChainTransport>,
    _temp: TempDir,
}

fn harness_with(adjust: impl FnOnce(&mut EngineConfig)) -> Harness {
    let temp = TempDir::new().unwrap();
    let mut config = EngineConfig::default();
    config.ledger.data_dir = temp.path().to_path_buf();
    config.ledger.rocksdb.sync_writes = false;
    adjust(&mut config);

    let chain = Arc::new(MockChainTransport::new("EQplatform"));
    let engine = Arc::new(CustodyEngine::open(config, chain.clone()).unwrap());
    Harness {
        engine,
        chain,
        _temp: temp,
    }
}

fn harness() -> Harness {
    harness_with(|_| {})
}

fn user(h: &Harness, id: UserId, referrer_id: Option<UserId>) -> UserId {
    h.engine
        .create_user(NewUser {
            pub_key: format!("wallet-{}", id),
            referrer_id,
            id: Some(id),
        })
        .unwrap()
        .id
}

async fn deposit(h: &Harness, user_id: UserId, units: i64) {
    let amount = Amount::from_units(units);
    let intent = h.engine.deposits().create_intent(user_id, amount).await.unwrap();
    h.chain.add_incoming_payment(amount, intent.deposit.memo.clone());
    let outcome = h
        .engine
        .deposits()
        .confirm(user_id, intent.deposit.id)
        .await
        .unwrap();
    assert!(matches!(outcome, ConfirmOutcome::Credited { .. }));
}

#[tokio::test]
async fn test_deposit_confirmed_once() {
    let h = harness();
    let alice = user(&h, 1, None);

    let amount = Amount::from_units(25);
    let intent = h.engine.deposits().create_intent(alice, amount).await.unwrap();
    h.chain.add_incoming_payment(amount, intent.deposit.memo.clone());

    h.engine.deposits().confirm(alice, intent.deposit.id).await.unwrap();
    let second = h.engine.deposits().confirm(alice, intent.deposit.id).await;

    assert!(matches!(second, Err(Error::AlreadyProcessed(_))));
    assert_eq!(h.engine.get_user(alice).unwrap().balance, amount);
    assert_eq!(h.chain.fee_forwards(), vec![Amount::from_units(5)]);

    let ops = h.engine.list_operations(alice, 1, 10).unwrap();
    assert_eq!(ops.total, 1);
    assert_eq!(ops.operations[0].op_type, OperationType::Deposit);
}

#[tokio::test]
async fn test_overlapping_confirm_and_cancel_conflict() {
    let h = harness();
    let alice = user(&h, 1, None);

    let amount = Amount::from_units(10);
    let intent = h.engine.deposits().create_intent(alice, amount).await.unwrap();
    h.chain.add_incoming_payment(amount, intent.deposit.memo.clone());
    h.chain.set_latency(Duration::from_millis(300));

    let deposit_id = intent.deposit.id;
    let late = || tokio::time::sleep(Duration::from_millis(100));
    let (first, second, cancelled) = tokio::join!(
        h.engine.deposits().confirm(alice, deposit_id),
        async {
            late().await;
            h.engine.deposits().confirm(alice, deposit_id).await
        },
        async {
            late().await;
            h.engine.deposits().cancel(alice, deposit_id)
        },
    );

    assert!(matches!(first.unwrap(), ConfirmOutcome::Credited { .. }));
    assert!(matches!(second, Err(Error::Conflict(_))));
    assert!(matches!(cancelled, Err(Error::Conflict(_))));
    assert_eq!(h.engine.get_user(alice).unwrap().balance, amount);
    assert_eq!(h.chain.fee_forwards().len(), 1);
}

#[tokio::test]
async fn test_payment_with_wrong_memo_not_matched() {
    let h = harness();
    let alice = user(&h, 1, None);

    let amount = Amount::from_units(10);
    let intent = h.engine.deposits().create_intent(alice, amount).await.unwrap();
    h.chain.add_incoming_payment(amount, "DEP1-999-XXXXXX");
    h.chain.add_incoming_payment(Amount::from_units(9), intent.deposit.memo.clone());

    let outcome = h.engine.deposits().confirm(alice, intent.deposit.id).await.unwrap();
    assert_eq!(outcome, ConfirmOutcome::AwaitingPayment);
    assert_eq!(h.engine.get_user(alice).unwrap().balance, Amount::ZERO);
}

#[tokio::test]
async fn test_withdrawal_ceiling() {
    let h = harness();
    let alice = user(&h, 1, None);
    deposit(&h, alice, 1000).await;

    let withdrawals = h.engine.withdrawals();
    assert_eq!(withdrawals.available(alice).unwrap(), Amount::from_units(800));

    let receipt = withdrawals.withdraw(alice, Amount::from_units(300)).await.unwrap();
    assert_eq!(receipt.withdrawal.status, WithdrawalStatus::Settled);
    assert_eq!(receipt.withdrawal.tx_hash.as_deref(), Some(receipt.tx_hash.as_str()));
    assert_eq!(withdrawals.available(alice).unwrap(), Amount::from_units(500));

    let over = withdrawals.withdraw(alice, Amount::from_units(501)).await;
    assert!(matches!(over, Err(Error::InsufficientFunds { .. })));

    let user = h.engine.get_user(alice).unwrap();
    assert_eq!(user.balance, Amount::from_units(700));
    assert_eq!(user.reserved, Amount::ZERO);

    let sent = h.chain.sent_payments();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].destination, "mock:wallet-1");
    assert_eq!(sent[0].amount, Amount::from_units(300));
}

#[tokio::test]
async fn test_withdrawal_blocked_by_pending_deposit() {
    let h = harness();
    let alice = user(&h, 1, None);
    deposit(&h, alice, 100).await;
    h.engine
        .deposits()
        .create_intent(alice, Amount::from_units(5))
        .await
        .unwrap();

    let result = h.engine.withdrawals().withdraw(alice, Amount::from_units(10)).await;
    assert!(matches!(result, Err(Error::PendingOperationsExist(_))));
}

#[tokio::test]
async fn test_withdrawal_failure_releases_reservation() {
    let h = harness();
    let alice = user(&h, 1, None);
    deposit(&h, alice, 100).await;
    h.chain.fail_sends(true);

    let result = h.engine.withdrawals().withdraw(alice, Amount::from_units(50)).await;
    assert!(matches!(result, Err(Error::ExternalTransportFailure(_))));

    let user = h.engine.get_user(alice).unwrap();
    assert_eq!(user.balance, Amount::from_units(100));
    assert_eq!(user.reserved, Amount::ZERO);

    let records = h.engine.withdrawals().list(alice).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, WithdrawalStatus::TransferFailed);
    assert_eq!(h.engine.metrics().withdrawals_failed.get(), 1);

    // A failed withdrawal does not block the next one
    h.chain.fail_sends(false);
    h.engine
        .withdrawals()
        .withdraw(alice, Amount::from_units(50))
        .await
        .unwrap();
    assert_eq!(h.engine.get_user(alice).unwrap().balance, Amount::from_units(50));
}

#[tokio::test]
async fn test_withdrawal_timeout_treated_as_failure() {
    let h = harness_with(|config| config.transport.timeout_secs = 1);
    let alice = user(&h, 1, None);
    deposit(&h, alice, 100).await;
    h.chain.set_latency(Duration::from_millis(1500));

    let result = h.engine.withdrawals().withdraw(alice, Amount::from_units(10)).await;
    assert!(matches!(result, Err(Error::ExternalTransportFailure(_))));

    let user = h.engine.get_user(alice).unwrap();
    assert_eq!(user.reserved, Amount::ZERO);
    assert_eq!(user.balance, Amount::from_units(100));
}

#[tokio::test]
async fn test_resolve_stuck_requires_transferring() {
    let h = harness();
    let alice = user(&h, 1, None);
    deposit(&h, alice, 100).await;

    let receipt = h
        .engine
        .withdrawals()
        .withdraw(alice, Amount::from_units(10))
        .await
        .unwrap();

    let result = h
        .engine
        .withdrawals()
        .resolve_stuck(receipt.withdrawal.id, Resolution::Failed);
    assert!(matches!(result, Err(Error::AlreadyProcessed(_))));

    assert!(matches!(
        h.engine.withdrawals().resolve_stuck(404, Resolution::Failed),
        Err(Error::NotFound { .. })
    ));
}

/// Reserve `units` and leave the record transferring, as after a crash mid-settlement
fn stuck_withdrawal(h: &Harness, user_id: UserId, units: i64) -> WithdrawalRequest {
    h.engine
        .store()
        .transact(user_id, |unit| {
            let now = Utc::now();
            let withdrawal = WithdrawalRequest {
                id: unit.next_id(Sequence::Withdrawal)?,
                user_id,
                amount: Amount::from_units(units),
                status: WithdrawalStatus::Transferring,
                destination: Some(format!("mock:wallet-{}", user_id)),
                tx_hash: None,
                created_at: now,
                updated_at: now,
            };
            unit.reserve(withdrawal.amount)?;
            unit.put_withdrawal(&withdrawal)?;
            Ok::<_, ledger_core::Error>(withdrawal)
        })
        .unwrap()
}

fn withdrawal_ops(h: &Harness, user_id: UserId) -> usize {
    h.engine
        .list_operations(user_id, 1, 100)
        .unwrap()
        .operations
        .iter()
        .filter(|op| op.op_type == OperationType::Withdrawal)
        .count()
}

#[tokio::test]
async fn test_resolve_stuck_settled_debits_once() {
    let h = harness();
    let alice = user(&h, 1, None);
    deposit(&h, alice, 100).await;

    let stuck = stuck_withdrawal(&h, alice, 40);
    assert_eq!(h.engine.get_user(alice).unwrap().reserved, Amount::from_units(40));

    // An unfinished withdrawal blocks new ones until resolved
    let blocked = h.engine.withdrawals().withdraw(alice, Amount::from_units(1)).await;
    assert!(matches!(blocked, Err(Error::PendingOperationsExist(_))));

    let resolved = h
        .engine
        .withdrawals()
        .resolve_stuck(
            stuck.id,
            Resolution::Settled {
                tx_hash: "tx-operator".to_string(),
            },
        )
        .unwrap();
    assert_eq!(resolved.status, WithdrawalStatus::Settled);
    assert_eq!(resolved.tx_hash.as_deref(), Some("tx-operator"));

    let again = h.engine.withdrawals().resolve_stuck(
        stuck.id,
        Resolution::Settled {
            tx_hash: "tx-operator".to_string(),
        },
    );
    assert!(matches!(again, Err(Error::AlreadyProcessed(_))));

    let user = h.engine.get_user(alice).unwrap();
    assert_eq!(user.balance, Amount::from_units(60));
    assert_eq!(user.reserved, Amount::ZERO);
    assert_eq!(withdrawal_ops(&h, alice), 1);
}

#[tokio::test]
async fn test_resolve_stuck_failed_releases_reservation() {
    let h = harness();
    let alice = user(&h, 1, None);
    deposit(&h, alice, 100).await;

    let stuck = stuck_withdrawal(&h, alice, 40);
    let resolved = h
        .engine
        .withdrawals()
        .resolve_stuck(stuck.id, Resolution::Failed)
        .unwrap();
    assert_eq!(resolved.status, WithdrawalStatus::TransferFailed);

    let user = h.engine.get_user(alice).unwrap();
    assert_eq!(user.balance, Amount::from_units(100));
    assert_eq!(user.reserved, Amount::ZERO);
    assert_eq!(withdrawal_ops(&h, alice), 0);
}

#[tokio::test]
async fn test_settlement_after_operator_resolution_debits_once() {
    let h = harness();
    let alice = user(&h, 1, None);
    deposit(&h, alice, 100).await;
    h.chain.set_latency(Duration::from_millis(300));

    // The operator settles while the transfer is still in flight, so the
    // engine's own settlement finds the record no longer transferring
    let withdrawals = h.engine.withdrawals();
    let (receipt, resolved) = tokio::join!(
        withdrawals.withdraw(alice, Amount::from_units(10)),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let stuck = withdrawals.list(alice).unwrap().remove(0);
            assert_eq!(stuck.status, WithdrawalStatus::Transferring);
            withdrawals.resolve_stuck(
                stuck.id,
                Resolution::Settled {
                    tx_hash: "tx-operator".to_string(),
                },
            )
        },
    );

    let receipt = receipt.unwrap();
    assert_eq!(resolved.unwrap().status, WithdrawalStatus::Settled);
    assert_eq!(receipt.withdrawal.status, WithdrawalStatus::Settled);
    assert_eq!(receipt.withdrawal.tx_hash.as_deref(), Some(receipt.tx_hash.as_str()));

    let user = h.engine.get_user(alice).unwrap();
    assert_eq!(user.balance, Amount::from_units(90));
    assert_eq!(user.reserved, Amount::ZERO);
    assert_eq!(withdrawal_ops(&h, alice), 1);
}

#[tokio::test]
async fn test_referral_cascade_three_levels() {
    let h = harness();
    let a = user(&h, 1, None);
    let b = user(&h, 2, Some(a));
    let c = user(&h, 3, Some(b));
    let d = user(&h, 4, Some(c));
    let e = user(&h, 5, Some(d));

    h.engine.set_balance(e, Amount::from_units(1000)).unwrap();
    let opened = h
        .engine
        .investments()
        .open(e, "low", Amount::from_units(1000))
        .unwrap();

    // Two weeks at 1.5% = 30
    let later = Utc::now() + ChronoDuration::days(15);
    let settlement = h
        .engine
        .investments()
        .settle_yield_at(e, opened.investment.id, later)
        .unwrap();
    assert_eq!(settlement.weeks, 2);
    assert_eq!(settlement.profit, Amount::from_units(30));
    assert_eq!(settlement.referral_earnings.len(), 3);

    let balance = |id| h.engine.get_user(id).unwrap().balance;
    assert_eq!(balance(d), "2.1".parse::<Amount>().unwrap());
    assert_eq!(balance(c), "0.9".parse::<Amount>().unwrap());
    assert_eq!(balance(b), "0.3".parse::<Amount>().unwrap());
    assert_eq!(balance(a), Amount::ZERO);

    let stats = h.engine.referrals().stats(b).unwrap();
    assert_eq!(stats.total_referrals, 3);
    assert_eq!(stats.total_earnings, "0.3".parse::<Amount>().unwrap());

    // One earning row per referrer, tagged with its hop distance
    for (referrer, level) in [(d, 1), (c, 2), (b, 3)] {
        let earnings = h.engine.store().list_earnings(referrer).unwrap();
        assert_eq!(earnings.len(), 1);
        assert_eq!(earnings[0].level, level);
        assert_eq!(earnings[0].referred_id, e);
    }
    assert!(h.engine.store().list_earnings(a).unwrap().is_empty());
}

#[test]
fn test_referral_hop_failure_keeps_earlier_hops() {
    let h = harness();
    let a = user(&h, 1, None);
    let b = user(&h, 2, Some(a));
    let c = user(&h, 3, Some(b));

    let near_max = Amount::from_nanos(i64::MAX - 1);
    h.engine.set_balance(a, near_max).unwrap();

    // b's hop commits, a's credit would overflow
    let result = h.engine.referrals().distribute(c, Amount::from_units(100));
    assert!(matches!(result, Err(Error::InvalidInput(_))));

    assert_eq!(h.engine.get_user(b).unwrap().balance, Amount::from_units(7));
    assert_eq!(h.engine.store().list_earnings(b).unwrap().len(), 1);
    assert_eq!(h.engine.get_user(a).unwrap().balance, near_max);
    assert!(h.engine.store().list_earnings(a).unwrap().is_empty());
    assert_eq!(h.engine.list_operations(a, 1, 10).unwrap().total, 0);
}

#[tokio::test]
async fn test_referral_cascade_single_level() {
    let h = harness();
    let a = user(&h, 1, None);
    let b = user(&h, 2, Some(a));

    h.engine.set_balance(b, Amount::from_units(200)).unwrap();
    let opened = h
        .engine
        .investments()
        .open(b, "high", Amount::from_units(200))
        .unwrap();

    let later = Utc::now() + ChronoDuration::weeks(1) + ChronoDuration::hours(1);
    h.engine
        .investments()
        .settle_yield_at(b, opened.investment.id, later)
        .unwrap();

    // 5% of 200 = 10, 7% of 10 = 0.7
    assert_eq!(h.engine.get_user(a).unwrap().balance, "0.7".parse::<Amount>().unwrap());
    let ops = h.engine.list_operations(a, 1, 10).unwrap();
    assert_eq!(ops.total, 1);
    assert_eq!(ops.operations[0].op_type, OperationType::ReferralEarning);
}

#[test]
fn test_concurrent_opens_single_winner() {
    let h = harness();
    let alice = user(&h, 1, None);
    h.engine.set_balance(alice, Amount::from_units(100)).unwrap();

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let engine = h.engine.clone();
            std::thread::spawn(move || {
                engine
                    .investments()
                    .open(alice, "low", Amount::from_units(100))
                    .is_ok()
            })
        })
        .collect();

    let wins = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .filter(|won| *won)
        .count();

    assert_eq!(wins, 1);
    assert_eq!(h.engine.get_user(alice).unwrap().balance, Amount::ZERO);
    assert_eq!(h.engine.investments().list(alice).unwrap().len(), 1);
}

#[test]
fn test_operations_pagination() {
    let h = harness();
    let alice = user(&h, 1, None);
    h.engine.set_balance(alice, Amount::from_units(1000)).unwrap();

    let mut opened = Vec::new();
    for _ in 0..25 {
        let investment = h
            .engine
            .investments()
            .open(alice, "low", Amount::from_units(1))
            .unwrap();
        opened.push(investment.investment.id);
    }

    let page = h.engine.list_operations(alice, 2, 10).unwrap();
    assert_eq!(page.total, 25);
    assert_eq!(page.operations.len(), 10);

    // Newest first: page 2 holds the 15th..6th opens
    let expected: Vec<_> = opened[5..15].iter().rev().copied().collect();
    let got: Vec<_> = page
        .operations
        .iter()
        .map(|op| op.metadata["investment_id"].as_u64().unwrap())
        .collect();
    assert_eq!(got, expected);

    let last = h.engine.list_operations(alice, 3, 10).unwrap();
    assert_eq!(last.operations.len(), 5);
    assert!(h.engine.list_operations(alice, 4, 10).unwrap().operations.is_empty());
}

#[tokio::test]
async fn test_every_money_movement_is_logged() {
    let h = harness();
    let referrer = user(&h, 1, None);
    let alice = user(&h, 2, Some(referrer));
    deposit(&h, alice, 100).await;

    let opened = h
        .engine
        .investments()
        .open(alice, "low", Amount::from_units(50))
        .unwrap();
    h.engine
        .investments()
        .settle_yield_at(alice, opened.investment.id, Utc::now() + ChronoDuration::weeks(1))
        .unwrap();
    h.engine
        .investments()
        .close(alice, opened.investment.id)
        .unwrap();
    h.engine
        .withdrawals()
        .withdraw(alice, Amount::from_units(20))
        .await
        .unwrap();

    let ops = h.engine.list_operations(alice, 1, 100).unwrap();
    let kinds: HashSet<_> = ops.operations.iter().map(|op| op.op_type).collect();
    for expected in [
        OperationType::Deposit,
        OperationType::InvestmentCreated,
        OperationType::YieldAccrued,
        OperationType::InvestmentClosed,
        OperationType::Withdrawal,
    ] {
        assert!(kinds.contains(&expected), "missing {}", expected);
    }
    assert_eq!(h.engine.metrics().degraded_audit_writes.get(), 0);

    let referrer_ops = h.engine.list_operations(referrer, 1, 10).unwrap();
    assert_eq!(referrer_ops.total, 1);
}

#[test]
fn test_delete_user_with_open_investment() {
    let h = harness();
    let alice = user(&h, 1, None);
    h.engine.set_balance(alice, Amount::from_units(10)).unwrap();
    h.engine
        .investments()
        .open(alice, "low", Amount::from_units(5))
        .unwrap();

    h.engine.delete_user(alice).unwrap();
    assert!(matches!(
        h.engine.investments().list(alice),
        Err(Error::NotFound { .. })
    ));
}
