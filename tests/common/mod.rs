#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use ledger_sequencer::blockchain::{Block, BlockHeader, Confirmation, Log, TxStatus};
use ledger_sequencer::client::{LedgerClient, LogFilter, LogSubscription};
use ledger_sequencer::counter::{CounterCall, CounterEvent, COUNTER_CODE};
use ledger_sequencer::tx::{SignedTransaction, TxHash, TxKind};
use ledger_sequencer::{Address, LedgerError, Result};

pub const CHAIN_ID: u64 = 31337;
pub const FEE_PRICE: u128 = 7;

/// What the fake ledger observed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Submit { nonce: u64 },
    Confirm { nonce: u64 },
    Call,
}

#[derive(Debug, Clone, Default)]
pub struct Behaviour {
    pub base_nonce: u64,
    /// 0-indexed submission that is rejected.
    pub reject_submission: Option<usize>,
    /// Never confirm the transaction with this nonce.
    pub hang_nonce: Option<u64>,
    /// Confirm the transaction with this nonce as reverted.
    pub revert_nonce: Option<u64>,
    pub fail_nonce_query: bool,
    /// Extra delay before confirming a given nonce.
    pub confirm_delays: HashMap<u64, Duration>,
    /// Delay before answering a submission.
    pub submit_delay: Option<Duration>,
    /// Delay before answering chain id, nonce, call and log queries.
    pub query_delay: Option<Duration>,
    /// Lose the connection while waiting for this nonce.
    pub drop_wait_nonce: Option<u64>,
}

#[derive(Default)]
struct Recorded {
    submitted: Vec<SignedTransaction>,
    events: Vec<Event>,
    nonce_queries: usize,
    count: u128,
    owner: Address,
    height: u64,
    logs: Vec<Log>,
}

/// A scripted ledger. Transactions are confirmed when waited for, each in
/// its own block, and Counter calls are interpreted just enough to answer
/// `getCount` and `owner`.
pub struct FakeLedger {
    behaviour: Behaviour,
    recorded: Mutex<Recorded>,
}

impl FakeLedger {
    pub fn new(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            recorded: Mutex::new(Recorded::default()),
        }
    }

    pub fn with_base_nonce(base_nonce: u64) -> Self {
        Self::new(Behaviour {
            base_nonce,
            ..Behaviour::default()
        })
    }

    pub fn submitted_nonces(&self) -> Vec<u64> {
        self.recorded
            .lock()
            .unwrap()
            .submitted
            .iter()
            .map(|tx| tx.tx.nonce)
            .collect()
    }

    pub fn submitted(&self) -> Vec<SignedTransaction> {
        self.recorded.lock().unwrap().submitted.clone()
    }

    pub fn events(&self) -> Vec<Event> {
        self.recorded.lock().unwrap().events.clone()
    }

    pub fn nonce_queries(&self) -> usize {
        self.recorded.lock().unwrap().nonce_queries
    }

    pub fn calls(&self) -> usize {
        self.events().iter().filter(|e| **e == Event::Call).count()
    }

    async fn query_delay(&self) {
        if let Some(delay) = self.behaviour.query_delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn find(&self, hash: &TxHash) -> Option<SignedTransaction> {
        self.recorded
            .lock()
            .unwrap()
            .submitted
            .iter()
            .find(|tx| &tx.hash() == hash)
            .cloned()
    }
}

fn block(number: u64) -> Block {
    Block {
        header: BlockHeader {
            number,
            parent_hash: format!("{:064x}", number.saturating_sub(1)),
            merkle_root: String::new(),
            timestamp: 1_700_000_000 + number as i64,
            nonce: 0,
            difficulty: 0,
            miner: Address::ZERO,
        },
        txs: Vec::new(),
        hash: format!("{:064x}", number),
    }
}

#[async_trait]
impl LedgerClient for FakeLedger {
    async fn chain_id(&self) -> Result<u64> {
        self.query_delay().await;
        Ok(CHAIN_ID)
    }

    async fn pending_nonce(&self, _address: &Address) -> Result<u64> {
        self.query_delay().await;
        if self.behaviour.fail_nonce_query {
            return Err(LedgerError::query("nonce", "node unavailable"));
        }
        let mut recorded = self.recorded.lock().unwrap();
        recorded.nonce_queries += 1;
        Ok(self.behaviour.base_nonce + recorded.submitted.len() as u64)
    }

    async fn suggest_fee_price(&self) -> Result<u128> {
        Ok(FEE_PRICE)
    }

    async fn submit(&self, tx: &SignedTransaction) -> Result<TxHash> {
        if let Some(delay) = self.behaviour.submit_delay {
            tokio::time::sleep(delay).await;
        }
        tx.verify()?;
        let mut recorded = self.recorded.lock().unwrap();
        if self.behaviour.reject_submission == Some(recorded.submitted.len()) {
            return Err(LedgerError::Submission("nonce too low".into()));
        }
        recorded.events.push(Event::Submit { nonce: tx.tx.nonce });
        recorded.submitted.push(tx.clone());
        Ok(tx.hash())
    }

    async fn wait_for_inclusion(&self, hash: &TxHash, timeout: Duration) -> Result<Confirmation> {
        let tx = self
            .find(hash)
            .ok_or_else(|| LedgerError::query("receipt", "unknown transaction"))?;
        let nonce = tx.tx.nonce;

        if self.behaviour.drop_wait_nonce == Some(nonce) {
            return Err(LedgerError::Connection {
                endpoint: "fake://".into(),
                reason: "connection reset".into(),
            });
        }
        if self.behaviour.hang_nonce == Some(nonce) {
            tokio::time::sleep(timeout).await;
            return Err(LedgerError::ConfirmationTimeout {
                hash: *hash,
                timeout,
            });
        }
        if let Some(delay) = self.behaviour.confirm_delays.get(&nonce) {
            tokio::time::sleep(*delay).await;
        }

        let mut recorded = self.recorded.lock().unwrap();
        recorded.height += 1;
        let number = recorded.height;
        recorded.events.push(Event::Confirm { nonce });

        let reverted = self.behaviour.revert_nonce == Some(nonce);
        let mut contract_address = None;
        let mut logs = Vec::new();
        if !reverted {
            match tx.tx.request.kind() {
                TxKind::Deploy if tx.tx.request.data == COUNTER_CODE => {
                    recorded.owner = tx.tx.from;
                    contract_address = Some(Address::for_contract(&tx.tx.from, nonce));
                }
                TxKind::Call => {
                    if let Ok(CounterCall::Increment) = CounterCall::decode(&tx.tx.request.data) {
                        recorded.count += 1;
                        let event = CounterEvent::Incremented {
                            new_count: recorded.count,
                        };
                        let log = Log {
                            address: tx.tx.request.to.unwrap_or_default(),
                            topic: event.topic().to_string(),
                            data: event.encode()?,
                            block_number: number,
                            tx_hash: *hash,
                            log_index: 0,
                        };
                        recorded.logs.push(log.clone());
                        logs.push(log);
                    }
                }
                _ => {}
            }
        }

        Ok(Confirmation {
            tx_hash: *hash,
            block_number: number,
            block_hash: format!("{:064x}", number),
            status: if reverted {
                TxStatus::Reverted
            } else {
                TxStatus::Success
            },
            gas_used: 21_000,
            contract_address,
            logs,
        })
    }

    async fn get_block(&self, number: u64) -> Result<Block> {
        Ok(block(number))
    }

    async fn block_number(&self) -> Result<u64> {
        Ok(self.recorded.lock().unwrap().height)
    }

    async fn balance(&self, _address: &Address) -> Result<u128> {
        Ok(0)
    }

    async fn call(&self, _contract: &Address, data: &[u8]) -> Result<Vec<u8>> {
        self.query_delay().await;
        let mut recorded = self.recorded.lock().unwrap();
        recorded.events.push(Event::Call);
        match CounterCall::decode(data)? {
            CounterCall::GetCount => Ok(bincode::serialize(&recorded.count)?),
            CounterCall::Owner => Ok(bincode::serialize(&recorded.owner)?),
            other => Err(LedgerError::query("contract call", format!("{:?}", other))),
        }
    }

    async fn logs(&self, filter: &LogFilter) -> Result<Vec<Log>> {
        self.query_delay().await;
        Ok(self
            .recorded
            .lock()
            .unwrap()
            .logs
            .iter()
            .filter(|log| filter.matches(log))
            .cloned()
            .collect())
    }

    async fn subscribe_logs(&self, _filter: LogFilter) -> Result<LogSubscription> {
        let (_tx, subscription) = LogSubscription::channel(1);
        Ok(subscription)
    }
}
