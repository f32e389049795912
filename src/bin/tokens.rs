//! Token registry management.
//!
//! Usage:
//!   cargo run --bin tokens -- list
//!   cargo run --bin tokens -- add <address>
//!   cargo run --bin tokens -- remove <address>
//!   cargo run --bin tokens -- toggle <address>
//!
//! The chain is read from the configured node unless `--chain <id>` is given.
//! `add` always needs the node to validate the contract.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::str::FromStr;

use alloy::primitives::Address;
use tokenwatch::config::Config;
use tokenwatch::onchain::{AlloyLedger, TokenInspector, TokenKey};
use tokenwatch::registry::{chain_name, designated_token, TokenRegistry};

#[derive(Debug, PartialEq, Eq)]
enum Command {
    List,
    Add(String),
    Remove(String),
    Toggle(String),
}

fn parse_args(args: &[String]) -> Result<(Command, Option<u64>)> {
    let mut chain = None;
    let mut positional = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--chain" {
            let value = iter.next().context("--chain needs a value")?;
            chain = Some(value.parse::<u64>().context("--chain must be a number")?);
        } else {
            positional.push(arg.as_str());
        }
    }

    let command = match positional.as_slice() {
        [] | ["list"] => Command::List,
        ["add", address] => Command::Add(address.to_string()),
        ["remove", address] => Command::Remove(address.to_string()),
        ["toggle", address] => Command::Toggle(address.to_string()),
        other => bail!(
            "unrecognised arguments {:?}\nusage: tokens [--chain <id>] list | add <address> | remove <address> | toggle <address>",
            other
        ),
    };
    Ok((command, chain))
}

fn key_for(address: &str, chain_id: u64) -> Result<TokenKey> {
    let contract = Address::from_str(address.trim())
        .with_context(|| format!("invalid contract address: {address}"))?;
    Ok(TokenKey { contract, chain_id })
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (command, chain_override) = parse_args(&args)?;

    let config = match Config::load(Path::new("tokenwatch.toml")) {
        Ok(c) => c,
        Err(_) => Config::from_env(),
    };

    let needs_node = matches!(command, Command::Add(_)) || chain_override.is_none();
    let ledger = if needs_node {
        Some(AlloyLedger::connect(config.ws_url()?).await?)
    } else {
        None
    };
    let chain_id = match (chain_override, &ledger) {
        (Some(id), _) => id,
        (None, Some(l)) => l.chain_id().await?,
        (None, None) => bail!("no chain id available"),
    };

    let mut registry = TokenRegistry::load(&config.registry.path, config.registry.include_designated)?;

    match command {
        Command::List => {
            println!("=== Watched tokens on {} ({}) ===", chain_name(chain_id), chain_id);
            if let Some(usdt) = designated_token(chain_id) {
                if config.registry.include_designated {
                    println!("  {:<8} {}  [designated]", usdt.symbol, usdt.contract_address);
                }
            }
            let tokens = registry.chain_tokens(chain_id);
            if tokens.is_empty() {
                println!("  (no custom tokens)");
            }
            for t in tokens {
                println!(
                    "  {:<8} {}  {} decimals  {}",
                    t.symbol,
                    t.contract_address,
                    t.decimals,
                    if t.is_active { "active" } else { "paused" }
                );
            }
        }
        Command::Add(address) => {
            let inspector = ledger.as_ref().context("adding a token needs a node connection")?;
            let token = registry.add_token(inspector, &address, chain_id).await?;
            println!(
                "Added {} ({}) on {}, {} decimals",
                token.symbol,
                token.name,
                chain_name(chain_id),
                token.decimals
            );
        }
        Command::Remove(address) => {
            let key = key_for(&address, chain_id)?;
            if registry.remove_token(&key)? {
                println!("Removed {}", key);
            } else {
                println!("{} is not in the registry", key);
            }
        }
        Command::Toggle(address) => {
            let key = key_for(&address, chain_id)?;
            match registry.toggle_token(&key)? {
                Some(true) => println!("{} is now active", key),
                Some(false) => println!("{} is now paused", key),
                None => println!("{} is not in the registry", key),
            }
        }
    }

    Ok(())
}
