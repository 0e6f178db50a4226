use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::account::Address;
use crate::tx::{SignedTransaction, TxHash};

/// Represents the header of a block.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    /// Height of the block; genesis is 0.
    pub number: u64,
    /// The hash of the parent block.
    pub parent_hash: String,
    /// Merkle root over the hashes of the included transactions.
    pub merkle_root: String,
    /// Unix timestamp (seconds) of when the block was sealed.
    pub timestamp: i64,
    /// Proof-of-work nonce.
    pub nonce: u64,
    pub difficulty: u32,
    /// Account credited with the fees of the block.
    pub miner: Address,
}

/// Represents a block in the ledger.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    /// The transactions included in the block, in execution order.
    pub txs: Vec<SignedTransaction>,
    /// The cached hash of the header.
    pub hash: String,
}

impl Block {
    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn tx_hashes(&self) -> Vec<TxHash> {
        self.txs.iter().map(SignedTransaction::hash).collect()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Success,
    Reverted,
}

impl TxStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TxStatus::Success)
    }
}

/// An event emitted by a contract during execution.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Log {
    /// Contract that emitted the event.
    pub address: Address,
    /// Event name, used for filtering.
    pub topic: String,
    /// Encoded event payload.
    pub data: Vec<u8>,
    pub block_number: u64,
    pub tx_hash: TxHash,
    /// Position of the log within its block.
    pub log_index: u32,
}

/// Inclusion record of a submitted transaction.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub block_hash: String,
    pub status: TxStatus,
    pub gas_used: u64,
    /// Set when the transaction deployed a contract.
    pub contract_address: Option<Address>,
    pub logs: Vec<Log>,
}

pub fn hash_block_header(header: &BlockHeader) -> String {
    // serde_json of a plain struct cannot fail
    let serialized = serde_json::to_vec(header).unwrap_or_default();
    hex::encode(Sha256::digest(&serialized))
}

/// Pairwise SHA-256 reduction of the transaction hashes. An odd node is
/// carried up unchanged. Empty blocks have an empty root.
pub fn merkle_root(hashes: &[TxHash]) -> String {
    if hashes.is_empty() {
        return String::new();
    }
    let mut level: Vec<Vec<u8>> = hashes.iter().map(|h| h.as_bytes().to_vec()).collect();

    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            if pair.len() == 1 {
                next.push(pair[0].clone());
            } else {
                let mut h = Sha256::new();
                h.update(&pair[0]);
                h.update(&pair[1]);
                next.push(h.finalize().to_vec());
            }
        }
        level = next;
    }
    hex::encode(&level[0])
}

/// Leading zero hex digits required for `difficulty` bits (rounded down).
pub fn meets_difficulty(hex_hash: &str, difficulty: u32) -> bool {
    let needed = (difficulty as usize) / 4;
    hex_hash.len() >= needed && hex_hash.as_bytes()[..needed].iter().all(|c| *c == b'0')
}
