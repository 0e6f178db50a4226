use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ledger_sequencer::config::Settings;
use ledger_sequencer::{demo, Account, Address, DevLedger};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[clap(name = "ledger-sequencer", version, about = "Sequenced transactions against a local ledger")]
struct Cli {
    /// Extra settings file layered over config/default and config/local.
    #[clap(long, short)]
    config: Option<String>,

    /// Ledger endpoint, overriding `ledger.endpoint`.
    #[clap(long)]
    endpoint: Option<String>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a key pair and print it as environment assignments.
    Keygen,
    /// Print a block.
    Block {
        /// Defaults to `transfer.block_number`.
        number: Option<u64>,
    },
    /// Read a block, then send a value transfer and wait for it.
    Transfer {
        /// Defaults to `transfer.recipient`.
        #[clap(long)]
        to: Option<Address>,
        /// Defaults to `transfer.amount`.
        #[clap(long)]
        amount: Option<u128>,
    },
    /// Deploy a Counter, increment it and read it back.
    Counter {
        #[clap(long)]
        gas_limit: Option<u64>,
    },
    /// Replay and follow events of a deployed Counter.
    Events {
        /// Defaults to `counter.contract`.
        #[clap(long)]
        contract: Option<Address>,
        #[clap(long, default_value_t = 0)]
        from_block: u64,
        /// Stop after this many live events.
        #[clap(long, default_value_t = 10)]
        live: usize,
        /// Stop when no event arrives for this many seconds.
        #[clap(long, default_value_t = 30)]
        idle_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load_from(cli.config.as_deref()).context("loading settings")?;
    if let Some(endpoint) = cli.endpoint {
        settings.ledger.endpoint = endpoint;
    }
    init_logging(&settings.log_level);

    info!("{} v{}", ledger_sequencer::NAME, ledger_sequencer::VERSION);

    if let Err(e) = run(cli.command, &settings).await {
        error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(command: Command, settings: &Settings) -> Result<()> {
    let options = settings.sequencer_options();
    match command {
        Command::Keygen => {
            let account = Account::generate();
            println!("{}={}", settings.wallet.key_env, account.secret_hex());
            println!("# address {}", account.address());
        }
        Command::Block { number } => {
            let ledger = dial(settings, None).await?;
            let number = number.unwrap_or(settings.transfer.block_number);
            demo::show_block(&ledger, number, &options).await?;
        }
        Command::Transfer { to, amount } => {
            let account = settings.account()?;
            let recipient = match to.or(settings.transfer.recipient) {
                Some(recipient) => recipient,
                None => bail!("no recipient: pass --to or set transfer.recipient"),
            };
            let amount = amount.unwrap_or_else(|| u128::from(settings.transfer.amount));
            let ledger = dial(settings, Some(account.address())).await?;
            demo::run_transfer(
                &ledger,
                &account,
                options,
                settings.transfer.block_number,
                recipient,
                amount,
            )
            .await?;
        }
        Command::Counter { gas_limit } => {
            let account = settings.account()?;
            let ledger = dial(settings, Some(account.address())).await?;
            let gas_limit = gas_limit.unwrap_or(settings.counter.gas_limit);
            let report = demo::run_counter(&ledger, &account, options, gas_limit).await?;
            println!("Counter {} now at {}", report.contract, report.updated_count);
        }
        Command::Events {
            contract,
            from_block,
            live,
            idle_secs,
        } => {
            let contract = match contract.or(settings.counter.contract) {
                Some(contract) => contract,
                None => bail!("no contract: pass --contract or set counter.contract"),
            };
            let ledger = dial(settings, None).await?;
            let events = demo::watch_counter(
                &ledger,
                contract,
                from_block,
                live,
                Duration::from_secs(idle_secs),
                &options,
            )
            .await?;
            info!(count = events.len(), "event watch finished");
        }
    }
    Ok(())
}

async fn dial(settings: &Settings, operator: Option<Address>) -> Result<DevLedger> {
    let ledger = DevLedger::dial(&settings.ledger.endpoint, settings.dev_config(operator))
        .await
        .with_context(|| format!("dialing {}", settings.ledger.endpoint))?;
    info!(endpoint = %settings.ledger.endpoint, "connected");
    Ok(ledger)
}

fn init_logging(default_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
