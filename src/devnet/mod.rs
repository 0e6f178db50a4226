//! A local development ledger.
//!
//! `DevLedger` implements [`LedgerClient`] in-process so the demos and the
//! integration tests run without a public network. Submitted transactions
//! wait in a mempool until the miner task seals them into a block every
//! `block_time`. Blocks, receipts and state are kept in sled.

mod miner;
mod pool;
mod state;
mod store;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub use miner::SealedBlock;
pub use pool::MAX_NONCE_GAP;
pub use state::{intrinsic_gas, WorldState, CALL_GAS, DEPLOY_GAS};
pub use store::ChainDB;

use crate::account::Address;
use crate::blockchain::{Block, Confirmation, Log};
use crate::client::{LedgerClient, LogFilter, LogSubscription};
use crate::error::{LedgerError, Result};
use crate::tx::{SignedTransaction, TxHash};
use pool::Mempool;

/// Endpoint that opens a throwaway in-memory ledger.
pub const MEMORY_ENDPOINT: &str = "mem://";

/// Highest accepted proof-of-work difficulty, in bits.
pub const MAX_DIFFICULTY: u32 = 24;

const SUBSCRIPTION_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevConfig {
    pub chain_id: u64,
    pub block_time: Duration,
    /// Proof-of-work difficulty in bits.
    pub difficulty: u32,
    pub min_fee_price: u128,
    pub coinbase: Address,
    /// Balances seeded into a fresh ledger.
    pub genesis: Vec<(Address, u128)>,
}

impl Default for DevConfig {
    fn default() -> Self {
        Self {
            chain_id: 1337,
            block_time: Duration::from_millis(500),
            difficulty: 8,
            min_fee_price: 1_000_000_000,
            coinbase: Address::ZERO,
            genesis: Vec::new(),
        }
    }
}

struct Chain {
    head: Block,
    state: WorldState,
    pool: Mempool,
}

struct Shared {
    endpoint: String,
    config: DevConfig,
    db: ChainDB,
    chain: Mutex<Chain>,
    sealed: broadcast::Sender<Arc<SealedBlock>>,
    stop: Arc<AtomicBool>,
}

impl Shared {
    fn chain(&self) -> Result<MutexGuard<'_, Chain>> {
        self.chain
            .lock()
            .map_err(|e| LedgerError::query("ledger state", format!("lock poisoned: {}", e)))
    }

    /// Seal the executable part of the mempool, if there is any.
    ///
    /// The proof-of-work search runs on a blocking thread without the chain
    /// lock. Pool entries are only dropped once the block is committed, so a
    /// failed attempt leaves them in place for the next one.
    async fn produce_block(&self) -> Result<Option<Arc<SealedBlock>>> {
        let (parent, txs, mut next_state) = {
            let chain = self.chain()?;
            let txs = chain.pool.executable(&chain.state);
            if txs.is_empty() {
                return Ok(None);
            }
            (chain.head.clone(), txs, chain.state.clone())
        };

        let difficulty = self.config.difficulty;
        let coinbase = self.config.coinbase;
        let stop = self.stop.clone();
        let (sealed, next_state) = tokio::task::spawn_blocking(move || {
            let sealed = miner::seal(&parent, txs, &mut next_state, difficulty, coinbase, &stop)?;
            Ok::<_, LedgerError>((sealed, next_state))
        })
        .await
        .map_err(|e| LedgerError::query("block production", e))??;

        let mut guard = self.chain()?;
        let chain = &mut *guard;
        if chain.head.hash != sealed.block.header.parent_hash {
            debug!(number = sealed.block.number(), "head moved while mining, block discarded");
            return Ok(None);
        }
        self.db
            .save_block(&sealed.block, &sealed.receipts, &next_state)?;

        chain.state = next_state;
        chain.head = sealed.block.clone();
        let dropped = chain.pool.prune(&chain.state);
        debug!(dropped, remaining = chain.pool.len(), "pool pruned");
        drop(guard);

        info!(
            number = sealed.block.number(),
            hash = %&sealed.block.hash[..12],
            txs = sealed.block.txs.len(),
            "sealed block"
        );

        let sealed = Arc::new(sealed);
        // no receivers is fine
        let _ = self.sealed.send(sealed.clone());
        Ok(Some(sealed))
    }
}

async fn run_miner(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.config.block_time);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = shared.produce_block().await {
            warn!(error = %e, "block production failed");
        }
    }
}

/// In-process ledger with a background miner. Dropping it stops the miner.
pub struct DevLedger {
    shared: Arc<Shared>,
    miner: JoinHandle<()>,
}

impl DevLedger {
    /// Open the ledger at `endpoint`: [`MEMORY_ENDPOINT`] for a temporary
    /// store, otherwise a sled path, optionally prefixed with `sled://`.
    /// Must be called within a tokio runtime.
    pub async fn dial(endpoint: &str, config: DevConfig) -> Result<Self> {
        let connection = |reason: String| LedgerError::Connection {
            endpoint: endpoint.to_string(),
            reason,
        };
        if config.difficulty > MAX_DIFFICULTY {
            return Err(connection(format!(
                "difficulty {} exceeds the maximum of {} bits",
                config.difficulty, MAX_DIFFICULTY
            )));
        }
        let db = if endpoint == MEMORY_ENDPOINT {
            ChainDB::temporary()
        } else {
            ChainDB::open(endpoint.strip_prefix("sled://").unwrap_or(endpoint))
        }
        .map_err(|e| connection(e.to_string()))?;

        let (head, state) = match db.get_latest().map_err(|e| connection(e.to_string()))? {
            Some(head) => {
                let state = db
                    .load_state()
                    .map_err(|e| connection(e.to_string()))?
                    .ok_or_else(|| connection("store has blocks but no state".to_string()))?;
                if !config.genesis.is_empty() {
                    debug!("existing ledger, genesis allocations ignored");
                }
                (head, state)
            }
            None => {
                let genesis = miner::make_genesis(config.difficulty, config.coinbase);
                let state = WorldState::genesis(&config.genesis);
                db.save_block(&genesis, &[], &state)
                    .map_err(|e| connection(e.to_string()))?;
                info!(hash = %&genesis.hash[..12], accounts = config.genesis.len(), "wrote genesis");
                (genesis, state)
            }
        };

        info!(endpoint, chain_id = config.chain_id, height = head.number(), "dev ledger opened");

        let (sealed, _) = broadcast::channel(SUBSCRIPTION_BUFFER);
        let shared = Arc::new(Shared {
            endpoint: endpoint.to_string(),
            config,
            db,
            chain: Mutex::new(Chain {
                head,
                state,
                pool: Mempool::default(),
            }),
            sealed,
            stop: Arc::new(AtomicBool::new(false)),
        });
        let miner = tokio::spawn(run_miner(shared.clone()));
        Ok(Self { shared, miner })
    }

    pub fn config(&self) -> &DevConfig {
        &self.shared.config
    }

    /// Number of admitted transactions not yet included.
    pub fn pool_size(&self) -> Result<usize> {
        Ok(self.shared.chain()?.pool.len())
    }
}

impl Drop for DevLedger {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        self.miner.abort();
    }
}

#[async_trait]
impl LedgerClient for DevLedger {
    async fn chain_id(&self) -> Result<u64> {
        Ok(self.shared.config.chain_id)
    }

    async fn pending_nonce(&self, address: &Address) -> Result<u64> {
        let chain = self.shared.chain()?;
        Ok(chain.pool.pending_nonce(&chain.state, address))
    }

    async fn suggest_fee_price(&self) -> Result<u128> {
        Ok(self.shared.config.min_fee_price)
    }

    async fn submit(&self, tx: &SignedTransaction) -> Result<TxHash> {
        let mut chain = self.shared.chain()?;
        let Chain { state, pool, .. } = &mut *chain;
        let hash = pool.admit(
            tx.clone(),
            state,
            self.shared.config.chain_id,
            self.shared.config.min_fee_price,
        )?;
        debug!(%hash, from = %tx.tx.from, nonce = tx.tx.nonce, "transaction admitted");
        Ok(hash)
    }

    async fn wait_for_inclusion(&self, hash: &TxHash, timeout: Duration) -> Result<Confirmation> {
        // subscribe before looking, so a block sealed in between is not missed
        let mut sealed = self.shared.sealed.subscribe();
        if let Some(receipt) = self.shared.db.get_receipt(hash)? {
            return Ok(receipt);
        }
        let deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, sealed.recv()).await {
                Err(_) => {
                    return Err(LedgerError::ConfirmationTimeout {
                        hash: *hash,
                        timeout,
                    })
                }
                Ok(Ok(block)) => {
                    if let Some(receipt) = block.receipts.iter().find(|r| &r.tx_hash == hash) {
                        return Ok(receipt.clone());
                    }
                }
                Ok(Err(RecvError::Lagged(_))) => {
                    if let Some(receipt) = self.shared.db.get_receipt(hash)? {
                        return Ok(receipt);
                    }
                }
                Ok(Err(RecvError::Closed)) => {
                    return Err(LedgerError::Connection {
                        endpoint: self.shared.endpoint.clone(),
                        reason: "ledger stopped".to_string(),
                    })
                }
            }
        }
    }

    async fn get_block(&self, number: u64) -> Result<Block> {
        self.shared
            .db
            .get_block(number)?
            .ok_or_else(|| LedgerError::query("block", format!("block {} not found", number)))
    }

    async fn block_number(&self) -> Result<u64> {
        Ok(self.shared.chain()?.head.number())
    }

    async fn balance(&self, address: &Address) -> Result<u128> {
        Ok(self.shared.chain()?.state.balance(address))
    }

    async fn call(&self, contract: &Address, data: &[u8]) -> Result<Vec<u8>> {
        self.shared.chain()?.state.call(contract, data)
    }

    async fn logs(&self, filter: &LogFilter) -> Result<Vec<Log>> {
        let latest = self.shared.chain()?.head.number();
        let to = filter.to_block.unwrap_or(latest).min(latest);
        let mut out = Vec::new();
        for number in filter.from_block..=to {
            let block = match self.shared.db.get_block(number)? {
                Some(block) => block,
                None => continue,
            };
            for hash in block.tx_hashes() {
                if let Some(receipt) = self.shared.db.get_receipt(&hash)? {
                    out.extend(receipt.logs.into_iter().filter(|log| filter.matches(log)));
                }
            }
        }
        Ok(out)
    }

    async fn subscribe_logs(&self, filter: LogFilter) -> Result<LogSubscription> {
        let mut sealed = self.shared.sealed.subscribe();
        let (tx, subscription) = LogSubscription::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        debug!("log subscription released");
                        return;
                    }
                    next = sealed.recv() => match next {
                        Ok(block) => {
                            for receipt in &block.receipts {
                                for log in receipt.logs.iter().filter(|log| filter.matches(log)) {
                                    if tx.send(log.clone()).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "log subscription lagging, blocks skipped");
                        }
                        Err(RecvError::Closed) => return,
                    }
                }
            }
        });
        Ok(subscription)
    }
}
