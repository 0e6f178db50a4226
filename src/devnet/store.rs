use std::path::Path;

use sled::{Db, Tree};

use super::state::WorldState;
use crate::blockchain::{Block, Confirmation};
use crate::error::{LedgerError, Result};
use crate::tx::TxHash;

const LATEST_KEY: &[u8] = b"latest";
const STATE_KEY: &[u8] = b"state";

fn storage(err: sled::Error) -> LedgerError {
    LedgerError::query("storage", err)
}

/// Sled-backed block, receipt and state store.
pub struct ChainDB {
    db: Db,
    blocks: Tree,
    receipts: Tree,
}

impl ChainDB {
    pub fn open<P: AsRef<Path>>(path: P) -> std::result::Result<Self, sled::Error> {
        Self::from_db(sled::open(path)?)
    }

    /// Store that lives only as long as the process.
    pub fn temporary() -> std::result::Result<Self, sled::Error> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> std::result::Result<Self, sled::Error> {
        let blocks = db.open_tree("blocks")?;
        let receipts = db.open_tree("receipts")?;
        Ok(Self {
            db,
            blocks,
            receipts,
        })
    }

    /// Persist a sealed block with its receipts and the state after it.
    /// The latest pointer is written last.
    pub fn save_block(
        &self,
        block: &Block,
        receipts: &[Confirmation],
        state: &WorldState,
    ) -> Result<()> {
        for receipt in receipts {
            let val = serde_json::to_vec(receipt)?;
            self.receipts
                .insert(receipt.tx_hash.as_bytes(), val)
                .map_err(storage)?;
        }
        let key = block.number().to_be_bytes();
        self.blocks
            .insert(key, serde_json::to_vec(block)?)
            .map_err(storage)?;
        self.db
            .insert(STATE_KEY, serde_json::to_vec(state)?)
            .map_err(storage)?;
        self.db.insert(LATEST_KEY, &key).map_err(storage)?;
        self.db.flush().map_err(storage)?;
        Ok(())
    }

    pub fn get_block(&self, number: u64) -> Result<Option<Block>> {
        match self.blocks.get(number.to_be_bytes()).map_err(storage)? {
            Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
            None => Ok(None),
        }
    }

    pub fn get_latest(&self) -> Result<Option<Block>> {
        if let Some(v) = self.db.get(LATEST_KEY).map_err(storage)? {
            let bytes: [u8; 8] = v
                .as_ref()
                .try_into()
                .map_err(|_| LedgerError::Codec("corrupt latest block pointer".to_string()))?;
            return self.get_block(u64::from_be_bytes(bytes));
        }
        Ok(None)
    }

    pub fn get_receipt(&self, hash: &TxHash) -> Result<Option<Confirmation>> {
        match self.receipts.get(hash.as_bytes()).map_err(storage)? {
            Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
            None => Ok(None),
        }
    }

    pub fn load_state(&self) -> Result<Option<WorldState>> {
        match self.db.get(STATE_KEY).map_err(storage)? {
            Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
            None => Ok(None),
        }
    }
}
