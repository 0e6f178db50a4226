mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::{Behaviour, Event, FakeLedger, CHAIN_ID, FEE_PRICE};
use ledger_sequencer::counter::{Counter, CounterCall, DEFAULT_GAS_LIMIT};
use ledger_sequencer::{
    Account, Address, LedgerError, Sequencer, SequencerOptions, SignedTransaction, Stage,
    TxRequest, TxState,
};

fn options() -> SequencerOptions {
    SequencerOptions {
        confirmation_timeout: Duration::from_millis(100),
        rpc_timeout: Duration::from_millis(500),
    }
}

fn recipient(n: u8) -> Address {
    Address::from_bytes([n; 20])
}

#[tokio::test]
async fn three_transfers_take_consecutive_nonces_from_one_query() {
    let ledger = FakeLedger::with_base_nonce(5);
    let account = Account::generate();
    let mut seq = Sequencer::prepare(&ledger, &account, options()).await.unwrap();

    for n in 0..3u8 {
        seq.transact(format!("transfer {}", n), TxRequest::transfer(recipient(n), 1))
            .await
            .unwrap();
    }

    assert_eq!(ledger.submitted_nonces(), vec![5, 6, 7]);
    assert_eq!(ledger.nonce_queries(), 1);
    assert!(seq
        .journal()
        .iter()
        .all(|step| step.state() == Some(TxState::Confirmed)));
}

#[tokio::test]
async fn nonces_do_not_depend_on_confirmation_timing() {
    let mut confirm_delays = HashMap::new();
    confirm_delays.insert(20, Duration::from_millis(40));
    confirm_delays.insert(21, Duration::from_millis(5));
    let ledger = FakeLedger::new(Behaviour {
        base_nonce: 20,
        confirm_delays,
        ..Behaviour::default()
    });
    let account = Account::generate();
    let mut seq = Sequencer::prepare(&ledger, &account, options()).await.unwrap();

    // all four are in flight before the first confirms
    for n in 0..4u8 {
        let prepared = seq
            .build(format!("transfer {}", n), TxRequest::transfer(recipient(n), 1))
            .unwrap();
        seq.submit(prepared).await.unwrap();
    }
    assert_eq!(seq.in_flight().len(), 4);
    let confirmations = seq.settle().await.unwrap();

    assert_eq!(confirmations.len(), 4);
    assert_eq!(ledger.submitted_nonces(), vec![20, 21, 22, 23]);
    assert_eq!(ledger.nonce_queries(), 1);
    let journal: Vec<_> = seq.journal().iter().map(|s| s.nonce()).collect();
    assert_eq!(journal, vec![Some(20), Some(21), Some(22), Some(23)]);
}

#[tokio::test]
async fn rejection_at_second_step_aborts_before_third() {
    let ledger = FakeLedger::new(Behaviour {
        base_nonce: 3,
        reject_submission: Some(1),
        ..Behaviour::default()
    });
    let account = Account::generate();
    let mut seq = Sequencer::prepare(&ledger, &account, options()).await.unwrap();

    seq.transact("first", TxRequest::transfer(recipient(1), 1))
        .await
        .unwrap();
    let err = seq
        .transact("second", TxRequest::transfer(recipient(2), 1))
        .await
        .unwrap_err();
    assert_eq!(err.step_index(), Some(1));
    assert!(matches!(err.source, LedgerError::Submission(_)));
    assert!(err.to_string().contains("step 1 (second)"));

    let third = seq
        .transact("third", TxRequest::transfer(recipient(3), 1))
        .await
        .unwrap_err();
    assert!(matches!(third.source, LedgerError::Aborted { .. }));

    assert_eq!(ledger.submitted_nonces(), vec![3]);
    assert_eq!(seq.journal()[1].state(), Some(TxState::Rejected));
    assert_eq!(seq.journal().len(), 2);
    assert!(matches!(seq.aborted_at(), Some(Stage::Step { index: 1, .. })));
}

#[tokio::test]
async fn confirmation_timeout_stops_dependent_reads() {
    let ledger = FakeLedger::new(Behaviour {
        base_nonce: 0,
        hang_nonce: Some(1),
        ..Behaviour::default()
    });
    let account = Account::generate();
    let mut seq = Sequencer::prepare(&ledger, &account, options()).await.unwrap();

    let (counter, _) = Counter::deploy(&mut seq, DEFAULT_GAS_LIMIT).await.unwrap();
    let err = counter
        .increment(&mut seq, DEFAULT_GAS_LIMIT)
        .await
        .unwrap_err();
    assert!(matches!(err.source, LedgerError::ConfirmationTimeout { .. }));
    assert!(err.source.is_indeterminate());
    assert_eq!(err.step_index(), Some(1));

    let read = counter.get_count_in(&mut seq).await.unwrap_err();
    assert!(matches!(read.source, LedgerError::Aborted { .. }));
    assert_eq!(ledger.calls(), 0);
    assert_eq!(seq.journal()[1].state(), Some(TxState::TimedOut));
}

#[tokio::test]
async fn deploy_read_increment_read_from_base_ten() {
    let ledger = FakeLedger::with_base_nonce(10);
    let account = Account::generate();
    let mut seq = Sequencer::prepare(&ledger, &account, options()).await.unwrap();

    let (counter, deployment) = Counter::deploy(&mut seq, DEFAULT_GAS_LIMIT).await.unwrap();
    assert_eq!(deployment.contract_address, Some(counter.address()));
    assert_eq!(counter.address(), Address::for_contract(&account.address(), 10));
    assert_eq!(counter.get_count_in(&mut seq).await.unwrap(), 0);
    counter.increment(&mut seq, DEFAULT_GAS_LIMIT).await.unwrap();
    assert_eq!(counter.get_count_in(&mut seq).await.unwrap(), 1);

    let nonces: Vec<_> = seq.journal().iter().map(|s| s.nonce()).collect();
    assert_eq!(nonces, vec![Some(10), None, Some(11), None]);
    assert_eq!(
        ledger.events(),
        vec![
            Event::Submit { nonce: 10 },
            Event::Confirm { nonce: 10 },
            Event::Call,
            Event::Submit { nonce: 11 },
            Event::Confirm { nonce: 11 },
            Event::Call,
        ]
    );
}

#[tokio::test]
async fn view_waits_for_in_flight_transactions() {
    let ledger = FakeLedger::with_base_nonce(0);
    let account = Account::generate();
    let mut seq = Sequencer::prepare(&ledger, &account, options()).await.unwrap();

    let (counter, _) = Counter::deploy(&mut seq, DEFAULT_GAS_LIMIT).await.unwrap();
    let prepared = seq
        .build("increment", counter.request(CounterCall::Increment, DEFAULT_GAS_LIMIT))
        .unwrap();
    seq.submit(prepared).await.unwrap();

    assert_eq!(counter.get_count_in(&mut seq).await.unwrap(), 1);
    assert!(seq.in_flight().is_empty());
    let events = ledger.events();
    assert_eq!(events.last(), Some(&Event::Call));
    assert_eq!(events[events.len() - 2], Event::Confirm { nonce: 1 });
}

#[tokio::test]
async fn reverted_transaction_is_a_confirmation_failure() {
    let ledger = FakeLedger::new(Behaviour {
        base_nonce: 4,
        revert_nonce: Some(4),
        ..Behaviour::default()
    });
    let account = Account::generate();
    let mut seq = Sequencer::prepare(&ledger, &account, options()).await.unwrap();

    let err = seq
        .transact("transfer", TxRequest::transfer(recipient(9), 1))
        .await
        .unwrap_err();
    assert!(matches!(
        err.source,
        LedgerError::ConfirmationFailure { block_number: 1, .. }
    ));
    assert_eq!(seq.journal()[0].state(), Some(TxState::Reverted));
}

#[tokio::test]
async fn failed_nonce_query_is_reported_as_prepare() {
    let ledger = FakeLedger::new(Behaviour {
        fail_nonce_query: true,
        ..Behaviour::default()
    });
    let account = Account::generate();
    let err = match Sequencer::prepare(&ledger, &account, options()).await {
        Ok(_) => panic!("prepare should fail"),
        Err(e) => e,
    };
    assert_eq!(err.stage, Stage::Prepare);
    assert_eq!(err.step_index(), None);
    assert!(matches!(err.source, LedgerError::Query { what: "nonce", .. }));
}

#[tokio::test]
async fn out_of_order_submission_is_refused() {
    let ledger = FakeLedger::with_base_nonce(0);
    let account = Account::generate();
    let mut seq = Sequencer::prepare(&ledger, &account, options()).await.unwrap();

    let first = seq.build("a", TxRequest::transfer(recipient(1), 1)).unwrap();
    let second = seq.build("b", TxRequest::transfer(recipient(2), 1)).unwrap();
    assert_eq!((first.nonce(), second.nonce()), (0, 1));

    let err = seq.submit(second).await.unwrap_err();
    assert_eq!(err.step_index(), Some(1));
    assert!(ledger.submitted_nonces().is_empty());
    drop(first);
}

#[tokio::test]
async fn submitted_transfer_decodes_to_recipient_and_amount() {
    let ledger = FakeLedger::with_base_nonce(0);
    let account = Account::generate();
    let mut seq = Sequencer::prepare(&ledger, &account, options()).await.unwrap();
    seq.transact("transfer", TxRequest::transfer(recipient(7), 1_000_000_000_000_000))
        .await
        .unwrap();

    let wire = ledger.submitted()[0].encode().unwrap();
    let decoded = SignedTransaction::decode(&wire).unwrap();
    assert_eq!(decoded.verify().unwrap(), account.address());
    assert_eq!(decoded.chain_id, CHAIN_ID);
    assert_eq!(decoded.tx.fee_price, FEE_PRICE);
    assert_eq!(decoded.tx.request.to, Some(recipient(7)));
    assert_eq!(decoded.tx.request.value, 1_000_000_000_000_000);
}

#[tokio::test]
async fn unanswered_submission_times_out_without_confirming() {
    let ledger = FakeLedger::new(Behaviour {
        base_nonce: 2,
        submit_delay: Some(Duration::from_secs(5)),
        ..Behaviour::default()
    });
    let account = Account::generate();
    let mut seq = Sequencer::prepare(&ledger, &account, options()).await.unwrap();

    let err = seq
        .transact("transfer", TxRequest::transfer(recipient(1), 1))
        .await
        .unwrap_err();
    assert_eq!(err.step_index(), Some(0));
    assert!(matches!(err.source, LedgerError::Submission(_)));
    assert!(err.to_string().contains("may still be included"));
    assert_eq!(seq.journal()[0].state(), Some(TxState::TimedOut));
    assert!(seq.in_flight().is_empty());
    assert!(ledger.events().is_empty());
}

#[tokio::test]
async fn slow_chain_queries_fail_prepare() {
    let ledger = FakeLedger::new(Behaviour {
        query_delay: Some(Duration::from_secs(5)),
        ..Behaviour::default()
    });
    let account = Account::generate();
    let err = match Sequencer::prepare(&ledger, &account, options()).await {
        Ok(_) => panic!("prepare should fail"),
        Err(e) => e,
    };
    assert_eq!(err.stage, Stage::Prepare);
    assert!(matches!(err.source, LedgerError::Query { what: "chain id", .. }));
    assert_eq!(ledger.nonce_queries(), 0);
}

#[tokio::test]
async fn lost_connection_while_waiting_leaves_step_submitted() {
    let ledger = FakeLedger::new(Behaviour {
        base_nonce: 0,
        drop_wait_nonce: Some(0),
        ..Behaviour::default()
    });
    let account = Account::generate();
    let mut seq = Sequencer::prepare(&ledger, &account, options()).await.unwrap();

    let err = seq
        .transact("transfer", TxRequest::transfer(recipient(1), 1))
        .await
        .unwrap_err();
    assert!(matches!(err.source, LedgerError::Connection { .. }));
    assert_eq!(err.step_index(), Some(0));
    assert_eq!(seq.journal()[0].state(), Some(TxState::Submitted));

    let next = seq
        .transact("second", TxRequest::transfer(recipient(2), 1))
        .await
        .unwrap_err();
    assert!(matches!(next.source, LedgerError::Aborted { .. }));
    assert_eq!(ledger.submitted_nonces(), vec![0]);
}

#[tokio::test]
async fn slow_contract_reads_are_bounded() {
    let ledger = FakeLedger::new(Behaviour {
        query_delay: Some(Duration::from_secs(5)),
        ..Behaviour::default()
    });
    let counter = Counter::at(recipient(8), &ledger).with_timeout(Duration::from_millis(50));

    let err = counter.get_count().await.unwrap_err();
    assert!(matches!(err, LedgerError::Query { what: "contract call", .. }));
    let err = match counter.events(0, None).await {
        Ok(_) => panic!("replay should time out"),
        Err(e) => e,
    };
    assert!(matches!(err, LedgerError::Query { what: "logs", .. }));
}

#[tokio::test]
async fn exhausted_nonce_space_aborts_the_build() {
    let ledger = FakeLedger::with_base_nonce(u64::MAX);
    let account = Account::generate();
    let mut seq = Sequencer::prepare(&ledger, &account, options()).await.unwrap();

    let first = seq.build("last", TxRequest::transfer(recipient(1), 1)).unwrap();
    assert_eq!(first.nonce(), u64::MAX);
    let err = seq
        .build("overflow", TxRequest::transfer(recipient(2), 1))
        .unwrap_err();
    assert_eq!(err.step_index(), Some(1));
    assert!(matches!(err.source, LedgerError::Query { what: "nonce", .. }));
    assert!(seq.upcoming_nonce().is_err());
}
