//! Typed binding for the Counter contract.
//!
//! The contract keeps a single count and the address that deployed it.
//! Calls are encoded as [`CounterCall`] values, events as [`CounterEvent`]
//! values carried in [`Log::data`] under the event name as topic.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::account::Address;
use crate::blockchain::{Confirmation, Log};
use crate::client::{bounded, LedgerClient, LogFilter, LogSubscription};
use crate::error::{LedgerError, Result, SequenceError, Stage};
use crate::sequencer::{Sequencer, SequencerOptions};
use crate::tx::TxRequest;

/// Code a ledger recognises as the Counter contract.
pub const COUNTER_CODE: &[u8] = b"\0ledger-sequencer/counter/v1";

/// Gas limit used by the demos for deployment and calls.
pub const DEFAULT_GAS_LIMIT: u64 = 300_000;

pub const TOPIC_INCREMENTED: &str = "Incremented";
pub const TOPIC_DECREMENTED: &str = "Decremented";
pub const TOPIC_RESET: &str = "Reset";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterCall {
    GetCount,
    Owner,
    Increment,
    Decrement,
    Reset,
}

impl CounterCall {
    pub fn encode(&self) -> Vec<u8> {
        // fieldless enum: bincode writes the u32 variant index
        let index: u32 = match self {
            CounterCall::GetCount => 0,
            CounterCall::Owner => 1,
            CounterCall::Increment => 2,
            CounterCall::Decrement => 3,
            CounterCall::Reset => 4,
        };
        index.to_le_bytes().to_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }

    pub fn is_view(&self) -> bool {
        matches!(self, CounterCall::GetCount | CounterCall::Owner)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterEvent {
    Incremented { new_count: u128 },
    Decremented { new_count: u128 },
    Reset { new_count: u128 },
}

impl CounterEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            CounterEvent::Incremented { .. } => TOPIC_INCREMENTED,
            CounterEvent::Decremented { .. } => TOPIC_DECREMENTED,
            CounterEvent::Reset { .. } => TOPIC_RESET,
        }
    }

    pub fn new_count(&self) -> u128 {
        match self {
            CounterEvent::Incremented { new_count }
            | CounterEvent::Decremented { new_count }
            | CounterEvent::Reset { new_count } => *new_count,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }
}

/// A decoded event together with the log it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    pub event: CounterEvent,
    pub raw: Log,
}

pub fn parse_log(log: &Log) -> Result<CounterEvent> {
    let event: CounterEvent = bincode::deserialize(&log.data)?;
    if event.topic() != log.topic {
        return Err(LedgerError::Codec(format!(
            "log topic {} does not match payload {}",
            log.topic,
            event.topic()
        )));
    }
    Ok(event)
}

fn decode(log: Log) -> Result<DecodedEvent> {
    let event = parse_log(&log)?;
    Ok(DecodedEvent { event, raw: log })
}

/// Historical events, decoded one at a time as they are pulled.
///
/// The iterator is finite. To pick up newer blocks, re-issue the query with
/// [`Counter::replay`] and [`EventIter::filter`].
#[derive(Debug)]
pub struct EventIter {
    filter: LogFilter,
    logs: std::vec::IntoIter<Log>,
}

impl EventIter {
    pub fn filter(&self) -> &LogFilter {
        &self.filter
    }
}

impl Iterator for EventIter {
    type Item = Result<DecodedEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        self.logs.next().map(decode)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.logs.size_hint()
    }
}

/// Live events; the subscription is released when the stream is dropped.
#[derive(Debug)]
pub struct EventStream {
    inner: LogSubscription,
}

impl EventStream {
    pub async fn next_event(&mut self) -> Option<Result<DecodedEvent>> {
        self.inner.next_log().await.map(decode)
    }

    pub fn unsubscribe(self) {
        self.inner.unsubscribe();
    }
}

impl Stream for EventStream {
    type Item = Result<DecodedEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx).map(|log| log.map(decode))
    }
}

/// A deployed Counter contract reached through a [`LedgerClient`].
///
/// Direct queries (`get_count`, `owner`, event replay, `watch`) are each
/// bounded by the binding's timeout.
pub struct Counter<'c, C: ?Sized> {
    address: Address,
    client: &'c C,
    timeout: Duration,
}

impl<'c, C: LedgerClient + ?Sized> Counter<'c, C> {
    pub fn at(address: Address, client: &'c C) -> Self {
        Self {
            address,
            client,
            timeout: SequencerOptions::default().rpc_timeout,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Deploy a new Counter as the next transaction of `seq` and wait for it.
    ///
    /// The contract address follows from the sender and the nonce, so it is
    /// known before the deployment is mined.
    pub async fn deploy<'a>(
        seq: &mut Sequencer<'a, C>,
        gas_limit: u64,
    ) -> std::result::Result<(Counter<'a, C>, Confirmation), SequenceError> {
        let prepared = seq.build("deploy Counter", TxRequest::deploy(COUNTER_CODE, gas_limit))?;
        let address = Address::for_contract(&seq.address(), prepared.nonce());
        let confirmation = seq.submit_and_wait(prepared).await?;
        if let Some(reported) = confirmation.contract_address {
            if reported != address {
                tracing::warn!(%address, %reported, "ledger reported a different contract address");
            }
        }
        let counter = Counter::at(address, seq.client()).with_timeout(seq.options().rpc_timeout);
        Ok((counter, confirmation))
    }

    async fn query(&self, call: CounterCall) -> Result<Vec<u8>> {
        bounded(
            self.timeout,
            "contract call",
            self.client.call(&self.address, &call.encode()),
        )
        .await
    }

    pub async fn get_count(&self) -> Result<u128> {
        let out = self.query(CounterCall::GetCount).await?;
        Ok(bincode::deserialize(&out)?)
    }

    pub async fn owner(&self) -> Result<Address> {
        let out = self.query(CounterCall::Owner).await?;
        Ok(bincode::deserialize(&out)?)
    }

    /// `getCount` as a step of `seq`, after its earlier transactions confirm.
    pub async fn get_count_in(
        &self,
        seq: &mut Sequencer<'_, C>,
    ) -> std::result::Result<u128, SequenceError> {
        let out = seq
            .view("getCount", &self.address, &CounterCall::GetCount.encode())
            .await?;
        decode_view(seq, &out)
    }

    pub async fn owner_in(
        &self,
        seq: &mut Sequencer<'_, C>,
    ) -> std::result::Result<Address, SequenceError> {
        let out = seq
            .view("owner", &self.address, &CounterCall::Owner.encode())
            .await?;
        decode_view(seq, &out)
    }

    pub fn request(&self, call: CounterCall, gas_limit: u64) -> TxRequest {
        TxRequest::call(self.address, call.encode(), gas_limit)
    }

    pub async fn increment(
        &self,
        seq: &mut Sequencer<'_, C>,
        gas_limit: u64,
    ) -> std::result::Result<Confirmation, SequenceError> {
        seq.transact("increment", self.request(CounterCall::Increment, gas_limit))
            .await
    }

    pub async fn decrement(
        &self,
        seq: &mut Sequencer<'_, C>,
        gas_limit: u64,
    ) -> std::result::Result<Confirmation, SequenceError> {
        seq.transact("decrement", self.request(CounterCall::Decrement, gas_limit))
            .await
    }

    pub async fn reset(
        &self,
        seq: &mut Sequencer<'_, C>,
        gas_limit: u64,
    ) -> std::result::Result<Confirmation, SequenceError> {
        seq.transact("reset", self.request(CounterCall::Reset, gas_limit))
            .await
    }

    fn base_filter(&self, from: u64, to: Option<u64>) -> LogFilter {
        let filter = LogFilter::new().address(self.address).from_block(from);
        match to {
            Some(to) => filter.to_block(to),
            None => filter,
        }
    }

    /// Run a log query and decode its results lazily.
    pub async fn replay(&self, filter: LogFilter) -> Result<EventIter> {
        let logs = bounded(self.timeout, "logs", self.client.logs(&filter)).await?;
        Ok(EventIter {
            filter,
            logs: logs.into_iter(),
        })
    }

    /// Every Counter event between `from` and `to` (inclusive, `None` = latest).
    pub async fn events(&self, from: u64, to: Option<u64>) -> Result<EventIter> {
        self.replay(self.base_filter(from, to)).await
    }

    pub async fn filter_incremented(&self, from: u64, to: Option<u64>) -> Result<EventIter> {
        self.replay(self.base_filter(from, to).topic(TOPIC_INCREMENTED))
            .await
    }

    pub async fn filter_decremented(&self, from: u64, to: Option<u64>) -> Result<EventIter> {
        self.replay(self.base_filter(from, to).topic(TOPIC_DECREMENTED))
            .await
    }

    pub async fn filter_reset(&self, from: u64, to: Option<u64>) -> Result<EventIter> {
        self.replay(self.base_filter(from, to).topic(TOPIC_RESET)).await
    }

    /// Subscribe to Counter events with the given topics (empty = all).
    pub async fn watch(&self, topics: &[&str]) -> Result<EventStream> {
        let mut filter = LogFilter::new().address(self.address);
        for topic in topics {
            filter = filter.topic(*topic);
        }
        let inner = bounded(
            self.timeout,
            "log subscription",
            self.client.subscribe_logs(filter),
        )
        .await?;
        Ok(EventStream { inner })
    }
}

fn decode_view<C, T>(seq: &Sequencer<'_, C>, out: &[u8]) -> std::result::Result<T, SequenceError>
where
    C: LedgerClient + ?Sized,
    T: serde::de::DeserializeOwned,
{
    bincode::deserialize(out).map_err(|e| {
        let stage = match seq.journal().last() {
            Some(step) => Stage::Step {
                index: step.index,
                label: step.label.clone(),
            },
            None => Stage::Prepare,
        };
        SequenceError::new(stage, e.into())
    })
}
