use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fundme::{
    chain::{ChainError, Devnet},
    config::DevnetConfig,
    ledger::WithdrawStrategy,
    units::{format_eth, format_usd, parse_amount},
};

#[derive(Parser)]
#[command(name = "fundme", version, about = "Crowdfunding ledger on a local devnet")]
struct Cli {
    /// Devnet state file.
    #[arg(long, global = true, default_value = "fundme-devnet.json")]
    state: PathBuf,
    /// Devnet config (JSON); defaults apply when absent.
    #[arg(long, global = true, default_value = "fundme.config.json")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create accounts, deploy the mock feed and the ledger.
    Init {
        #[arg(long)]
        force: bool,
    },
    /// List devnet accounts and wallet balances.
    Accounts,
    /// Contribute to the ledger.
    Fund {
        /// Account index or address.
        #[arg(long)]
        from: String,
        /// Amount, e.g. `0.1eth` or raw wei.
        #[arg(long)]
        amount: String,
    },
    /// Send plain value to the ledger.
    Receive {
        #[arg(long)]
        from: String,
        #[arg(long)]
        amount: String,
    },
    /// Withdraw the whole balance to the owner.
    Withdraw {
        #[arg(long)]
        from: String,
        /// Use the single-pass strategy.
        #[arg(long)]
        cheaper: bool,
    },
    /// Publish a new mock feed answer (8 decimals by default).
    SetPrice {
        #[arg(long, allow_hyphen_values = true)]
        answer: i128,
    },
    /// Take the mock feed offline or bring it back.
    SetFeedOffline {
        #[arg(long, action = clap::ArgAction::Set)]
        offline: bool,
    },
    /// Make an account refuse incoming transfers.
    SetRejecting {
        #[arg(long)]
        account: String,
        #[arg(long, action = clap::ArgAction::Set)]
        enabled: bool,
    },
    /// Funder at position `index`.
    Funder { index: usize },
    /// Cumulative contribution of an account.
    Amount { who: String },
    Owner,
    PriceFeed,
    /// Balance, funders, price and state root.
    Status,
}

//==================== logging ====================//

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

//==================== commands ====================//

fn init_cmd(state: &Path, config: &Path, force: bool) -> Result<(), ChainError> {
    if state.exists() && !force {
        eprintln!(
            "error: {} already exists (use --force to redeploy)",
            state.display()
        );
        std::process::exit(2);
    }
    let config = DevnetConfig::load(config)?;
    let devnet = Devnet::deploy(&config)?;
    devnet.save(state)?;
    println!(
        "Deployed ledger owned by {} (feed {}) → {}",
        devnet.ledger().owner(),
        devnet.ledger().price_feed(),
        state.display()
    );
    Ok(())
}

fn accounts_cmd(devnet: &Devnet) {
    for (idx, account) in devnet.accounts().iter().enumerate() {
        let marker = if account == devnet.ledger().owner() {
            " (owner)"
        } else {
            ""
        };
        println!(
            "{idx:>3}  {account}  {}{marker}",
            format_eth(devnet.wallet(account))
        );
    }
}

fn amount_arg(value: &str) -> u128 {
    match parse_amount(value) {
        Ok(amount) => amount,
        Err(err) => {
            eprintln!("error: invalid --amount: {err}");
            std::process::exit(2);
        }
    }
}

/// Loads the devnet, applies one call and persists the result only on success.
fn mutate(
    state: &Path,
    f: impl FnOnce(&mut Devnet) -> Result<(), ChainError>,
) -> Result<(), ChainError> {
    let mut devnet = Devnet::load(state)?;
    f(&mut devnet)?;
    devnet.save(state)
}

fn status_cmd(devnet: &Devnet) -> Result<(), ChainError> {
    let ledger = devnet.ledger();
    println!("owner:       {}", ledger.owner());
    println!("price feed:  {}", ledger.price_feed());
    match ledger.oracle().price() {
        Ok(price) => println!("price:       {} per ETH", format_usd(price)),
        Err(err) => println!("price:       unavailable ({err})"),
    }
    println!("minimum:     {}", format_usd(ledger.minimum_usd()));
    println!("balance:     {}", format_eth(ledger.balance()));
    println!("funders:     {}", ledger.funders().len());
    for (idx, funder) in ledger.funders().iter().enumerate() {
        println!(
            "  {idx:>3}  {funder}  {}",
            format_eth(ledger.address_to_amount(funder))
        );
    }
    println!("state root:  {}", hex::encode(ledger.state_root()));
    println!("events root: {}", hex::encode(ledger.events_root()));
    Ok(())
}

fn run(cli: Cli) -> Result<(), ChainError> {
    let state = cli.state.as_path();
    match cli.command {
        Command::Init { force } => init_cmd(state, &cli.config, force),
        Command::Accounts => {
            accounts_cmd(&Devnet::load(state)?);
            Ok(())
        }
        Command::Fund { from, amount } => {
            let value = amount_arg(&amount);
            mutate(state, |devnet| {
                let caller = devnet.resolve(&from);
                devnet.fund(&caller, value)?;
                println!("{caller} funded {}", format_eth(value));
                Ok(())
            })
        }
        Command::Receive { from, amount } => {
            let value = amount_arg(&amount);
            mutate(state, |devnet| {
                let caller = devnet.resolve(&from);
                devnet.receive(&caller, value)?;
                println!("{caller} sent {}", format_eth(value));
                Ok(())
            })
        }
        Command::Withdraw { from, cheaper } => {
            let strategy = if cheaper {
                WithdrawStrategy::Cached
            } else {
                WithdrawStrategy::Indexed
            };
            mutate(state, |devnet| {
                let caller = devnet.resolve(&from);
                let amount = devnet.withdraw(&caller, strategy)?;
                println!("Withdrew {} → {caller}", format_eth(amount));
                Ok(())
            })
        }
        Command::SetPrice { answer } => mutate(state, |devnet| {
            devnet.set_price(answer);
            println!("feed answer set to {answer}");
            Ok(())
        }),
        Command::SetFeedOffline { offline } => mutate(state, |devnet| {
            devnet.set_feed_offline(offline);
            Ok(())
        }),
        Command::SetRejecting { account, enabled } => mutate(state, |devnet| {
            let account = devnet.resolve(&account);
            devnet.set_rejecting(&account, enabled);
            Ok(())
        }),
        Command::Funder { index } => {
            let devnet = Devnet::load(state)?;
            println!("{}", devnet.ledger().funder(index)?);
            Ok(())
        }
        Command::Amount { who } => {
            let devnet = Devnet::load(state)?;
            let who = devnet.resolve(&who);
            println!("{}", devnet.ledger().address_to_amount(&who));
            Ok(())
        }
        Command::Owner => {
            println!("{}", Devnet::load(state)?.ledger().owner());
            Ok(())
        }
        Command::PriceFeed => {
            println!("{}", Devnet::load(state)?.ledger().price_feed());
            Ok(())
        }
        Command::Status => status_cmd(&Devnet::load(state)?),
    }
}

//==================== main ====================//

fn main() {
    init_tracing();
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("error: {err}");
        std::process::exit(2);
    }
}
