//! The ledger collaborator consumed by the sequencer and the contract binding.
//!
//! [`LedgerClient`] is the seam between this crate and whatever actually talks
//! to a network. Implementations do not retry and do not sign; they classify
//! their failures into [`LedgerError`] and return.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::mpsc;

use crate::account::Address;
use crate::blockchain::{Block, Confirmation, Log};
use crate::error::{LedgerError, Result};
use crate::tx::{SignedTransaction, TxHash};

#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn chain_id(&self) -> Result<u64>;

    /// Next nonce for `address`, counting transactions still in the pool.
    async fn pending_nonce(&self, address: &Address) -> Result<u64>;

    async fn suggest_fee_price(&self) -> Result<u128>;

    /// Hand a signed transaction to the network. Acceptance is not inclusion.
    async fn submit(&self, tx: &SignedTransaction) -> Result<TxHash>;

    /// Block until `hash` is included or `timeout` elapses, in which case
    /// `LedgerError::ConfirmationTimeout` is returned.
    async fn wait_for_inclusion(&self, hash: &TxHash, timeout: Duration) -> Result<Confirmation>;

    async fn get_block(&self, number: u64) -> Result<Block>;

    async fn block_number(&self) -> Result<u64>;

    async fn balance(&self, address: &Address) -> Result<u128>;

    /// Read-only contract query; `data` is the encoded call.
    async fn call(&self, contract: &Address, data: &[u8]) -> Result<Vec<u8>>;

    /// Historical logs matching `filter`.
    async fn logs(&self, filter: &LogFilter) -> Result<Vec<Log>>;

    /// Live logs matching `filter` from the next sealed block on.
    async fn subscribe_logs(&self, filter: LogFilter) -> Result<LogSubscription>;
}

/// Run `call` with an upper bound of `limit`; running out is a `Query`
/// failure naming `what`.
pub(crate) async fn bounded<T>(
    limit: Duration,
    what: &'static str,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(LedgerError::query(what, format!("no response within {:?}", limit))),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub address: Option<Address>,
    /// Accepted topics; empty accepts all.
    pub topics: Vec<String>,
    pub from_block: u64,
    /// Inclusive upper bound; `None` means the latest block.
    pub to_block: Option<u64>,
}

impl LogFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn address(mut self, address: Address) -> Self {
        self.address = Some(address);
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.push(topic.into());
        self
    }

    pub fn from_block(mut self, from: u64) -> Self {
        self.from_block = from;
        self
    }

    pub fn to_block(mut self, to: u64) -> Self {
        self.to_block = Some(to);
        self
    }

    pub fn matches(&self, log: &Log) -> bool {
        if let Some(address) = &self.address {
            if &log.address != address {
                return false;
            }
        }
        if !self.topics.is_empty() && !self.topics.iter().any(|t| t == &log.topic) {
            return false;
        }
        if log.block_number < self.from_block {
            return false;
        }
        match self.to_block {
            Some(to) => log.block_number <= to,
            None => true,
        }
    }
}

/// Push stream of logs. Dropping it (or calling [`unsubscribe`](Self::unsubscribe))
/// closes the channel, which tells the producer to stop.
#[derive(Debug)]
pub struct LogSubscription {
    rx: mpsc::Receiver<Log>,
}

impl LogSubscription {
    pub fn channel(capacity: usize) -> (mpsc::Sender<Log>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }

    pub async fn next_log(&mut self) -> Option<Log> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {}
}

impl Stream for LogSubscription {
    type Item = Log;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Log>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn log(address: Address, topic: &str, block_number: u64) -> Log {
        Log {
            address,
            topic: topic.to_string(),
            data: Vec::new(),
            block_number,
            tx_hash: TxHash::default(),
            log_index: 0,
        }
    }

    #[test]
    fn filter_matches_address_topic_and_range() {
        let contract = Address::from_bytes([1; 20]);
        let filter = LogFilter::new()
            .address(contract)
            .topic("Incremented")
            .from_block(2)
            .to_block(4);

        assert!(filter.matches(&log(contract, "Incremented", 3)));
        assert!(!filter.matches(&log(contract, "Reset", 3)));
        assert!(!filter.matches(&log(Address::ZERO, "Incremented", 3)));
        assert!(!filter.matches(&log(contract, "Incremented", 1)));
        assert!(!filter.matches(&log(contract, "Incremented", 5)));
        assert!(LogFilter::new().matches(&log(Address::ZERO, "Anything", 0)));
    }

    #[tokio::test]
    async fn bounded_call_gives_up_at_the_limit() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(1u64)
        };
        let err = bounded(Duration::from_millis(10), "block", slow)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Query { what: "block", .. }));

        let fast = bounded(Duration::from_millis(10), "block", async { Ok(2u64) }).await;
        assert_eq!(fast.unwrap(), 2);
    }

    #[tokio::test]
    async fn dropping_subscription_closes_producer() {
        let (tx, mut sub) = LogSubscription::channel(4);
        tx.send(log(Address::ZERO, "Reset", 1)).await.unwrap();
        assert_eq!(sub.next().await.map(|l| l.topic), Some("Reset".to_string()));

        sub.unsubscribe();
        assert!(tx.is_closed());
        assert!(tx.send(log(Address::ZERO, "Reset", 2)).await.is_err());
    }
}
