//! Layered settings for the demo binary.
//!
//! Sources, later ones overriding earlier ones: built-in defaults,
//! `config/default`, `config/$SEQ_ENV`, `config/local`, then environment
//! variables such as `SEQ__LEDGER__ENDPOINT`. The signing key never lives in
//! a settings file; it is read from the variable named by `wallet.key_env`.

use std::time::Duration;

use config::{ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::account::{Account, Address};
use crate::devnet::{DevConfig, MAX_DIFFICULTY};
use crate::error::Result as LedgerResult;
use crate::sequencer::SequencerOptions;

pub const ENV_PREFIX: &str = "SEQ";
pub const DEFAULT_KEY_ENV: &str = "SEQ_PRIVATE_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Fallback filter when `RUST_LOG` is unset.
    pub log_level: String,
    pub ledger: LedgerSettings,
    pub wallet: WalletSettings,
    pub sequencer: SequencerSettings,
    pub transfer: TransferSettings,
    pub counter: CounterSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSettings {
    /// `mem://` or a sled path, optionally prefixed `sled://`.
    pub endpoint: String,
    pub chain_id: u64,
    pub block_time_ms: u64,
    pub difficulty: u32,
    pub min_fee_price: u64,
    pub coinbase: Address,
    /// Balance credited to the signing account on a fresh ledger.
    pub genesis_balance: u64,
    /// Further addresses funded with `genesis_balance`.
    pub funded: Vec<Address>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletSettings {
    /// Name of the environment variable holding the hex private key.
    pub key_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencerSettings {
    pub confirmation_timeout_ms: u64,
    pub rpc_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    pub recipient: Option<Address>,
    pub amount: u64,
    pub block_number: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterSettings {
    pub gas_limit: u64,
    /// Existing deployment used by `events`.
    pub contract: Option<Address>,
}

impl Settings {
    /// Load from the standard locations.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load with `extra` as an additional file layered above `config/local`.
    pub fn load_from(extra: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Self::defaults()?
            .add_source(File::with_name("config/default").required(false));

        if let Ok(env) = std::env::var("SEQ_ENV") {
            builder = builder.add_source(File::with_name(&format!("config/{}", env)).required(false));
        }

        builder = builder.add_source(File::with_name("config/local").required(false));
        if let Some(path) = extra {
            builder = builder.add_source(File::with_name(path));
        }

        let settings: Settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        config::Config::builder()
            .set_default("log_level", "info")?
            .set_default("ledger.endpoint", "sled://./chain_db")?
            .set_default("ledger.chain_id", 1337i64)?
            .set_default("ledger.block_time_ms", 500i64)?
            .set_default("ledger.difficulty", 8i64)?
            .set_default("ledger.min_fee_price", 1_000_000_000i64)?
            .set_default("ledger.coinbase", Address::ZERO.to_string())?
            .set_default("ledger.genesis_balance", 1_000_000_000_000_000_000i64)?
            .set_default("ledger.funded", Vec::<String>::new())?
            .set_default("wallet.key_env", DEFAULT_KEY_ENV)?
            .set_default("sequencer.confirmation_timeout_ms", 60_000i64)?
            .set_default("sequencer.rpc_timeout_ms", 10_000i64)?
            .set_default("transfer.amount", 1_000_000_000_000_000i64)?
            .set_default("transfer.block_number", 0i64)?
            .set_default("counter.gas_limit", 300_000i64)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ledger.endpoint.trim().is_empty() {
            return Err(ConfigError::Message(
                "ledger.endpoint must not be empty".to_string(),
            ));
        }
        if self.ledger.block_time_ms == 0 {
            return Err(ConfigError::Message(
                "ledger.block_time_ms must be positive".to_string(),
            ));
        }
        if self.ledger.difficulty > MAX_DIFFICULTY {
            return Err(ConfigError::Message(format!(
                "ledger.difficulty above {} bits makes local mining impractical",
                MAX_DIFFICULTY
            )));
        }
        if self.sequencer.confirmation_timeout_ms == 0 || self.sequencer.rpc_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "sequencer timeouts must be positive".to_string(),
            ));
        }
        if self.wallet.key_env.trim().is_empty() {
            return Err(ConfigError::Message(
                "wallet.key_env must name an environment variable".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sequencer_options(&self) -> SequencerOptions {
        SequencerOptions {
            confirmation_timeout: Duration::from_millis(self.sequencer.confirmation_timeout_ms),
            rpc_timeout: Duration::from_millis(self.sequencer.rpc_timeout_ms),
        }
    }

    /// Dev ledger parameters; `operator` and every `funded` address start
    /// with `genesis_balance`.
    pub fn dev_config(&self, operator: Option<Address>) -> DevConfig {
        let balance = u128::from(self.ledger.genesis_balance);
        let genesis = operator
            .into_iter()
            .chain(self.ledger.funded.iter().copied())
            .map(|address| (address, balance))
            .collect();
        DevConfig {
            chain_id: self.ledger.chain_id,
            block_time: Duration::from_millis(self.ledger.block_time_ms),
            difficulty: self.ledger.difficulty,
            min_fee_price: u128::from(self.ledger.min_fee_price),
            coinbase: self.ledger.coinbase,
            genesis,
        }
    }

    /// The signing account, read from the configured environment variable.
    pub fn account(&self) -> LedgerResult<Account> {
        Account::from_env(&self.wallet.key_env)
    }
}
