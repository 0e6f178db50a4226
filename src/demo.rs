//! The demonstration flows run by the binary.
//!
//! Each flow prints a short human report as it goes and returns the same
//! facts as a value so callers and tests can inspect them.

use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tracing::{debug, info};

use crate::account::{Account, Address};
use crate::blockchain::{Block, Confirmation};
use crate::client::{bounded, LedgerClient};
use crate::counter::{Counter, DecodedEvent, TOPIC_INCREMENTED};
use crate::error::{LedgerError, SequenceError};
use crate::sequencer::{Sequencer, SequencerOptions, StepRecord};
use crate::tx::TxRequest;

#[derive(Error, Debug)]
pub enum DemoError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Sequence(#[from] SequenceError),
}

pub type DemoResult<T> = std::result::Result<T, DemoError>;

#[derive(Debug, Clone)]
pub struct TransferReport {
    pub block: Block,
    pub sender: Address,
    pub recipient: Address,
    pub amount: u128,
    pub confirmation: Confirmation,
    pub sender_balance: u128,
    pub recipient_balance: u128,
}

#[derive(Debug, Clone)]
pub struct CounterReport {
    pub contract: Address,
    pub deployment: Confirmation,
    pub initial_count: u128,
    pub increment: Confirmation,
    pub updated_count: u128,
    pub owner: Address,
    pub incremented: Vec<DecodedEvent>,
    pub journal: Vec<StepRecord>,
}

pub fn print_block(block: &Block) {
    println!("Block #{}", block.number());
    println!("  hash:         {}", block.hash);
    println!("  parent:       {}", block.header.parent_hash);
    println!("  timestamp:    {}", block.header.timestamp);
    println!("  transactions: {}", block.txs.len());
}

/// Fetch and print block `number`.
pub async fn show_block<C>(client: &C, number: u64, options: &SequencerOptions) -> DemoResult<Block>
where
    C: LedgerClient + ?Sized,
{
    let block = bounded(options.rpc_timeout, "block", client.get_block(number)).await?;
    print_block(&block);
    Ok(block)
}

/// Read a block, then send one value transfer and wait for it.
pub async fn run_transfer<C>(
    client: &C,
    account: &Account,
    options: SequencerOptions,
    block_number: u64,
    recipient: Address,
    amount: u128,
) -> DemoResult<TransferReport>
where
    C: LedgerClient + ?Sized,
{
    let block = show_block(client, block_number, &options).await?;

    println!("Sending transfer");
    println!("  from:   {}", account.address());
    println!("  to:     {}", recipient);
    println!("  amount: {}", amount);

    let mut seq = Sequencer::prepare(client, account, options.clone()).await?;
    let confirmation = seq
        .transact("transfer", TxRequest::transfer(recipient, amount))
        .await?;
    println!("  hash:   {}", confirmation.tx_hash);
    println!("  mined in block {}", confirmation.block_number);

    let sender_balance = bounded(options.rpc_timeout, "balance", client.balance(&account.address())).await?;
    let recipient_balance = bounded(options.rpc_timeout, "balance", client.balance(&recipient)).await?;
    println!("Balances");
    println!("  {}: {}", account.address(), sender_balance);
    println!("  {}: {}", recipient, recipient_balance);

    Ok(TransferReport {
        block,
        sender: account.address(),
        recipient,
        amount,
        confirmation,
        sender_balance,
        recipient_balance,
    })
}

/// Deploy a Counter, read it, increment it, read it again and replay the
/// increments, all as one sequence from `account`.
pub async fn run_counter<C>(
    client: &C,
    account: &Account,
    options: SequencerOptions,
    gas_limit: u64,
) -> DemoResult<CounterReport>
where
    C: LedgerClient + ?Sized,
{
    let mut seq = Sequencer::prepare(client, account, options).await?;
    println!("Sender {} (nonce {})", seq.address(), seq.base_nonce());

    let (counter, deployment) = Counter::deploy(&mut seq, gas_limit).await?;
    println!("Counter deployed");
    println!("  address: {}", counter.address());
    println!("  hash:    {}", deployment.tx_hash);
    println!("  block:   {}", deployment.block_number);

    let initial_count = counter.get_count_in(&mut seq).await?;
    println!("Current count: {}", initial_count);

    let increment = counter.increment(&mut seq, gas_limit).await?;
    println!("Incremented in block {} ({})", increment.block_number, increment.tx_hash);

    let updated_count = counter.get_count_in(&mut seq).await?;
    println!("Updated count: {}", updated_count);

    let owner = counter.owner_in(&mut seq).await?;
    println!("Owner: {}", owner);

    let incremented = counter
        .filter_incremented(deployment.block_number, None)
        .await?
        .collect::<crate::error::Result<Vec<_>>>()?;
    for decoded in &incremented {
        println!(
            "  {} -> {} (block {}, tx {})",
            TOPIC_INCREMENTED,
            decoded.event.new_count(),
            decoded.raw.block_number,
            decoded.raw.tx_hash
        );
    }

    for step in seq.journal() {
        debug!(index = step.index, label = %step.label, nonce = ?step.nonce(), state = ?step.state(), "journal");
    }
    info!(contract = %counter.address(), count = %updated_count, "counter demo finished");

    Ok(CounterReport {
        contract: counter.address(),
        deployment,
        initial_count,
        increment,
        updated_count,
        owner,
        incremented,
        journal: seq.journal().to_vec(),
    })
}

/// Print past events of `contract` from `from_block`, then live ones until
/// `live` more have arrived or none arrives for `idle`.
pub async fn watch_counter<C>(
    client: &C,
    contract: Address,
    from_block: u64,
    live: usize,
    idle: Duration,
    options: &SequencerOptions,
) -> DemoResult<Vec<DecodedEvent>>
where
    C: LedgerClient + ?Sized,
{
    let counter = Counter::at(contract, client).with_timeout(options.rpc_timeout);
    // subscribe first so nothing sealed during the replay is lost
    let mut stream = counter.watch(&[]).await?;

    let mut seen = Vec::new();
    for decoded in counter.events(from_block, None).await? {
        let decoded = decoded?;
        print_event("past", &decoded);
        seen.push(decoded);
    }
    let replayed_to = seen.last().map(|d| d.raw.block_number);

    let mut received = 0;
    while received < live {
        let next = match tokio::time::timeout(idle, stream.next()).await {
            Ok(Some(next)) => next?,
            Ok(None) | Err(_) => break,
        };
        if replayed_to.map_or(false, |b| next.raw.block_number <= b) {
            continue;
        }
        print_event("live", &next);
        seen.push(next);
        received += 1;
    }
    Ok(seen)
}

fn print_event(origin: &str, decoded: &DecodedEvent) {
    println!(
        "[{}] block {} #{} {} new count {}",
        origin,
        decoded.raw.block_number,
        decoded.raw.log_index,
        decoded.event.topic(),
        decoded.event.new_count()
    );
}
