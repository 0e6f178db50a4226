//! Error taxonomy for ledger interaction and transaction sequencing.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::tx::TxHash;

/// Failures reported by a [`LedgerClient`](crate::client::LedgerClient) or by
/// local transaction handling.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("cannot reach ledger endpoint {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },

    #[error("unusable credential: {0}")]
    Key(String),

    #[error("{what} query failed: {reason}")]
    Query { what: &'static str, reason: String },

    #[error("transaction rejected: {0}")]
    Submission(String),

    #[error("transaction {hash} not included within {timeout:?}")]
    ConfirmationTimeout { hash: TxHash, timeout: Duration },

    #[error("transaction {hash} reverted in block {block_number}")]
    ConfirmationFailure { hash: TxHash, block_number: u64 },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("sequence already aborted at step {failed_step}")]
    Aborted { failed_step: String },
}

impl LedgerError {
    pub fn query(what: &'static str, reason: impl fmt::Display) -> Self {
        LedgerError::Query {
            what,
            reason: reason.to_string(),
        }
    }

    /// True for failures after which the transaction may still land on the ledger.
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, LedgerError::ConfirmationTimeout { .. })
    }
}

impl From<bincode::Error> for LedgerError {
    fn from(err: bincode::Error) -> Self {
        LedgerError::Codec(err.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Codec(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Where in a sequence a failure happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    /// The initial chain id / nonce / fee price queries.
    Prepare,
    /// An operation of the sequence, 0-indexed in program order.
    Step { index: usize, label: String },
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Prepare => write!(f, "prepare"),
            Stage::Step { index, label } => write!(f, "step {} ({})", index, label),
        }
    }
}

/// Terminal failure of a sequence, carrying the identity of the failed step.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{stage} failed: {source}")]
pub struct SequenceError {
    pub stage: Stage,
    #[source]
    pub source: LedgerError,
}

impl SequenceError {
    pub fn new(stage: Stage, source: LedgerError) -> Self {
        Self { stage, source }
    }

    pub fn step_index(&self) -> Option<usize> {
        match &self.stage {
            Stage::Prepare => None,
            Stage::Step { index, .. } => Some(*index),
        }
    }
}
