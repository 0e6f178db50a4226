//! Ledger Sequencer
//!
//! Builds, signs, submits and confirms dependent transactions from one
//! account with locally sequenced nonces, plus a typed Counter contract
//! binding and an in-process development ledger to run them against.

pub mod account;
pub mod blockchain;
pub mod client;
pub mod config;
pub mod counter;
pub mod demo;
pub mod devnet;
pub mod error;
pub mod sequencer;
pub mod tx;

pub use account::{Account, Address};
pub use client::{LedgerClient, LogFilter, LogSubscription};
pub use counter::Counter;
pub use devnet::{DevConfig, DevLedger};
pub use error::{LedgerError, Result, SequenceError, Stage};
pub use sequencer::{next_nonce, Sequencer, SequencerOptions, TxState};
pub use tx::{SignedTransaction, Transaction, TxHash, TxRequest};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
