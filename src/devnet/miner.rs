use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use rand::Rng;

use super::state::WorldState;
use crate::account::Address;
use crate::blockchain::{
    hash_block_header, meets_difficulty, merkle_root, Block, BlockHeader, Confirmation, Log,
};
use crate::error::{LedgerError, Result};
use crate::tx::SignedTransaction;

/// A block together with the receipts of its transactions.
#[derive(Debug, Clone)]
pub struct SealedBlock {
    pub block: Block,
    pub receipts: Vec<Confirmation>,
}

pub fn make_genesis(difficulty: u32, miner: Address) -> Block {
    let header = BlockHeader {
        number: 0,
        parent_hash: String::from("0"),
        merkle_root: String::new(),
        timestamp: Utc::now().timestamp(),
        nonce: 0,
        difficulty,
        miner,
    };
    let hash = hash_block_header(&header);
    Block {
        header,
        txs: Vec::new(),
        hash,
    }
}

/// Search random nonces until the header hash meets the difficulty.
/// Returns `None` once `stop` is raised.
pub fn mine_block(
    mut header: BlockHeader,
    txs: Vec<SignedTransaction>,
    stop: &AtomicBool,
) -> Option<Block> {
    let hashes: Vec<_> = txs.iter().map(SignedTransaction::hash).collect();
    header.merkle_root = merkle_root(&hashes);
    let mut rng = rand::thread_rng();
    loop {
        if stop.load(Ordering::Relaxed) {
            return None;
        }
        header.nonce = rng.gen();
        let hash = hash_block_header(&header);
        if meets_difficulty(&hash, header.difficulty) {
            return Some(Block { header, txs, hash });
        }
    }
}

/// Execute `txs` on top of `parent` against `state` and seal the result.
pub fn seal(
    parent: &Block,
    txs: Vec<SignedTransaction>,
    state: &mut WorldState,
    difficulty: u32,
    coinbase: Address,
    stop: &AtomicBool,
) -> Result<SealedBlock> {
    let number = parent.number() + 1;
    let mut outcomes = Vec::with_capacity(txs.len());
    for tx in &txs {
        outcomes.push(state.apply(tx, &coinbase));
    }

    let header = BlockHeader {
        number,
        parent_hash: parent.hash.clone(),
        merkle_root: String::new(),
        timestamp: Utc::now().timestamp(),
        nonce: 0,
        difficulty,
        miner: coinbase,
    };
    let block = mine_block(header, txs, stop)
        .ok_or_else(|| LedgerError::query("block production", "mining stopped"))?;

    let mut log_index = 0u32;
    let mut receipts = Vec::with_capacity(outcomes.len());
    for (tx, outcome) in block.txs.iter().zip(outcomes) {
        let tx_hash = tx.hash();
        let mut logs = Vec::with_capacity(outcome.events.len());
        for (address, event) in outcome.events {
            logs.push(Log {
                address,
                topic: event.topic().to_string(),
                data: event.encode()?,
                block_number: number,
                tx_hash,
                log_index,
            });
            log_index += 1;
        }
        receipts.push(Confirmation {
            tx_hash,
            block_number: number,
            block_hash: block.hash.clone(),
            status: outcome.status,
            gas_used: outcome.gas_used,
            contract_address: outcome.contract_address,
            logs,
        });
    }

    Ok(SealedBlock { block, receipts })
}
