//! Operator CLI for the custody ledger
//!
//! Works directly on the RocksDB data directory; the engine must not be
//! running against the same directory.

use anyhow::Context;
use clap::{Parser, Subcommand};
use custody_engine::{chain::mock::MockChainTransport, CustodyEngine, EngineConfig, Resolution};
use ledger_core::{Amount, NewUser, UserId, WithdrawalId};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "custody-admin", about = "Custody ledger administration")]
struct Args {
    /// Engine configuration file (TOML)
    #[arg(long, env = "CUSTODY_CONFIG")]
    config: Option<PathBuf>,

    /// Ledger data directory, overrides the configuration
    #[arg(long, env = "LEDGER_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a user
    CreateUser {
        /// Wallet public key
        pub_key: String,
        /// Referring user
        #[arg(long)]
        referrer: Option<UserId>,
        /// Explicit user id
        #[arg(long)]
        id: Option<UserId>,
    },
    /// Show a user by id or public key
    ShowUser {
        /// User id or public key
        user: String,
    },
    /// Overwrite a user's balance
    SetBalance {
        user_id: UserId,
        amount: Amount,
    },
    /// Add a signed delta to a user's balance
    AdjustBalance {
        user_id: UserId,
        #[arg(allow_hyphen_values = true)]
        delta: Amount,
    },
    /// Delete a user and their open investments
    DeleteUser {
        user_id: UserId,
    },
    /// List a user's operations, newest first
    Operations {
        user_id: UserId,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        page_size: u32,
    },
    /// List a user's open investments
    Investments {
        user_id: UserId,
    },
    /// Referral summary for a user
    ReferralStats {
        user_id: UserId,
    },
    /// List a user's withdrawals and remaining allowance
    Withdrawals {
        user_id: UserId,
    },
    /// Resolve a withdrawal stuck in transferring
    ResolveWithdrawal {
        withdrawal_id: WithdrawalId,
        /// Transaction id of the landed transfer; omit to mark it failed
        #[arg(long)]
        tx_hash: Option<String>,
    },
}

fn print<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };
    config.apply_env()?;
    if let Some(dir) = &args.data_dir {
        config.ledger.data_dir = dir.clone();
    }
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    // Offline: no command here reaches the chain
    let chain = Arc::new(MockChainTransport::new("offline"));
    let engine = CustodyEngine::open(config, chain).context("opening ledger")?;

    match args.command {
        Command::CreateUser {
            pub_key,
            referrer,
            id,
        } => print(&engine.create_user(NewUser {
            pub_key,
            referrer_id: referrer,
            id,
        })?),
        Command::ShowUser { user } => {
            let found = match user.parse::<UserId>() {
                Ok(user_id) => engine.get_user(user_id)?,
                Err(_) => engine.get_user_by_key(&user)?,
            };
            print(&found)
        }
        Command::SetBalance { user_id, amount } => print(&engine.set_balance(user_id, amount)?),
        Command::AdjustBalance { user_id, delta } => {
            print(&engine.adjust_balance(user_id, delta)?)
        }
        Command::DeleteUser { user_id } => print(&engine.delete_user(user_id)?),
        Command::Operations {
            user_id,
            page,
            page_size,
        } => print(&engine.list_operations(user_id, page, page_size)?),
        Command::Investments { user_id } => print(&engine.investments().list(user_id)?),
        Command::ReferralStats { user_id } => print(&engine.referrals().stats(user_id)?),
        Command::Withdrawals { user_id } => {
            #[derive(Serialize)]
            struct Summary {
                available: Amount,
                withdrawals: Vec<ledger_core::WithdrawalRequest>,
            }
            print(&Summary {
                available: engine.withdrawals().available(user_id)?,
                withdrawals: engine.withdrawals().list(user_id)?,
            })
        }
        Command::ResolveWithdrawal {
            withdrawal_id,
            tx_hash,
        } => {
            let resolution = match tx_hash {
                Some(tx_hash) => Resolution::Settled { tx_hash },
                None => Resolution::Failed,
            };
            print(&engine.withdrawals().resolve_stuck(withdrawal_id, resolution)?)
        }
    }
}
