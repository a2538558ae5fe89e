use std::sync::Arc;
use std::time::Duration;

use ledger_core::{Amount, AccountType, ErrorKind, Ledger, MemoryStore, Settlement, Transfer};

fn amount(s: &str) -> Amount {
    s.parse().unwrap()
}

async fn setup(accounts: &[&str]) -> Arc<Ledger<MemoryStore>> {
    let ledger = Ledger::new(MemoryStore::new());
    ledger
        .create_account(Some("funding"), AccountType::Funding)
        .await
        .unwrap();
    for id in accounts {
        ledger
            .create_account(Some(*id), AccountType::User)
            .await
            .unwrap();
    }
    Arc::new(ledger)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_overdraft_attempts() {
    let ledger = setup(&["one", "two"]).await;
    ledger
        .transfer(Transfer::new("funding", "one", amount("100000")))
        .await
        .unwrap();

    let handles: Vec<_> = (0..40)
        .map(|_| {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(
                async move { ledger.transfer(Transfer::new("one", "two", amount("3000"))).await },
            )
        })
        .collect();

    let mut succeeded = 0;
    let mut insufficient = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(rejection) => {
                assert_eq!(rejection.kind(), ErrorKind::InsufficientBalance);
                insufficient += 1;
            }
        }
    }

    assert_eq!(succeeded, 33);
    assert_eq!(insufficient, 7);
    assert_eq!(
        ledger.get_account_balance("one").await.unwrap().balance,
        amount("1000")
    );
    assert_eq!(
        ledger.get_account_balance("two").await.unwrap().balance,
        amount("99000")
    );

    let history = ledger.get_account_ledger_entries("one").await.unwrap();
    assert_eq!(history.len(), 34);
    let outgoing: Amount = history
        .iter()
        .filter(|entry| entry.amount.is_negative())
        .map(|entry| entry.amount)
        .sum();
    assert_eq!(outgoing, amount("-99000"));
    let total: Amount = history.iter().map(|entry| entry.amount).sum();
    assert_eq!(total, amount("1000"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn history_chains_under_contention() {
    let ledger = setup(&["one", "two"]).await;
    ledger
        .transfer(Transfer::new("funding", "one", amount("1000")))
        .await
        .unwrap();

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(
                async move { ledger.transfer(Transfer::new("one", "two", amount("7.5"))).await },
            )
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    for account in ["one", "two"] {
        let entries = ledger
            .get_account_ledger_entries(account)
            .await
            .unwrap()
            .into_entries();
        assert_eq!(entries[0].previous_balance, Amount::ZERO);
        for pair in entries.windows(2) {
            assert_eq!(pair[1].previous_balance, pair[0].current_balance);
            assert!(pair[0].timestamp < pair[1].timestamp);
        }
        let last = entries.last().unwrap();
        assert_eq!(
            last.current_balance,
            ledger.get_account_balance(account).await.unwrap().balance
        );
    }
    assert_eq!(
        ledger.get_account_balance("two").await.unwrap().balance,
        amount("375")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn opposite_direction_transfers_do_not_deadlock() {
    let ledger = setup(&["a", "b"]).await;
    for id in ["a", "b"] {
        ledger
            .transfer(Transfer::new("funding", id, amount("1000")))
            .await
            .unwrap();
    }

    let handles: Vec<_> = (0..100)
        .map(|i| {
            let ledger = Arc::clone(&ledger);
            let (from, to) = if i % 2 == 0 { ("a", "b") } else { ("b", "a") };
            tokio::spawn(async move { ledger.transfer(Transfer::new(from, to, amount("1"))).await })
        })
        .collect();

    let all = async {
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    };
    tokio::time::timeout(Duration::from_secs(10), all)
        .await
        .expect("transfers deadlocked");

    assert_eq!(
        ledger.get_account_balance("a").await.unwrap().balance,
        amount("1000")
    );
    assert_eq!(
        ledger.get_account_balance("b").await.unwrap().balance,
        amount("1000")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn money_is_conserved_across_mixed_operations() {
    let accounts = ["p", "q", "r", "s"];
    let ledger = setup(&accounts).await;
    for id in accounts {
        ledger
            .transfer(Transfer::new("funding", id, amount("250")))
            .await
            .unwrap();
    }

    let handles: Vec<_> = (0..80usize)
        .map(|i| {
            let ledger = Arc::clone(&ledger);
            let from = accounts[i % accounts.len()];
            let to = accounts[(i + 1) % accounts.len()];
            let other = accounts[(i + 2) % accounts.len()];
            tokio::spawn(async move {
                if i % 3 == 0 {
                    let settlement = Settlement::new(from)
                        .pay(to, amount("12.25"))
                        .pay(other, amount("3.75"));
                    ledger.submit(&settlement).await.map(|_| ())
                } else {
                    ledger
                        .transfer(Transfer::new(from, to, amount("9.99")))
                        .await
                        .map(|_| ())
                }
            })
        })
        .collect();
    for handle in handles {
        if let Err(rejection) = handle.await.unwrap() {
            assert_eq!(rejection.kind(), ErrorKind::InsufficientBalance);
        }
    }

    let mut total = Amount::ZERO;
    for id in accounts.iter().chain(["funding"].iter()) {
        let balance = ledger.get_account_balance(id).await.unwrap();
        if *id != "funding" {
            assert!(!balance.balance.is_negative());
        }
        total += balance.balance;
    }
    assert!(total.is_zero());
}
