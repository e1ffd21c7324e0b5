#![forbid(unsafe_code)]
//! Command-line front end for a local KVChain log.

use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use kvchain::blockchain::{validate_chain, validate_no_duplicate_requests, Visibility};
use kvchain::config::{load_config, load_config_from, Config};
use kvchain::node::spawn_chain_actor;
use kvchain::{Operation, RequestId};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a config.toml; defaults to ./config.toml then the platform config dir
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Only read decided blocks
    #[arg(long, global = true)]
    committed: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mine, accept and decide a put at the next slot
    Put {
        key: String,
        value: String,
    },
    /// Look up a key in the replayed store
    Get {
        key: String,
    },
    /// List every block in the log
    Show,
    /// Check nonces, hash pointers and the decided prefix
    Verify,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    tracing_subscriber::fmt()
        .with_max_level(config.logging.level()?)
        .with_writer(std::io::stderr)
        .init();

    let visibility = if cli.committed {
        Visibility::Committed
    } else {
        config.replay.visibility
    };

    match &cli.command {
        Commands::Put { key, value } => put(&config, key, value).await?,
        Commands::Get { key } => get(&config, key, visibility)?,
        Commands::Show => show(&config)?,
        Commands::Verify => verify(&config)?,
    }

    Ok(())
}

async fn put(config: &Config, key: &str, value: &str) -> Result<(), Box<dyn std::error::Error>> {
    let persistence = config.storage.open()?;
    let chain = persistence.load_blockchain()?;
    let slot = chain.next_open_slot()?;
    let request_id = RequestId::new(config.node.client_id, slot as u64);

    let (handle, task) = spawn_chain_actor(chain, persistence);
    println!("{}", format!("⛏️  Mining Put({}, {})...", key, value).bright_cyan());
    let (block, index) = handle
        .propose(Operation::put(key, value), request_id, config.miner.timeout()?)
        .await?;
    handle.accept(block.clone(), index).await?;
    handle.decide(block.clone(), index).await?;
    let chain = handle.shutdown().await?;
    task.await?;

    println!("{} {}", "✅ Decided at index".bright_green(), index.to_string().bright_white());
    println!("   nonce:        {}", block.nonce);
    println!(
        "   hash pointer: {}",
        block.hash_pointer.map(|p| p.to_hex()).unwrap_or_else(|| "(genesis)".to_string())
    );
    println!("   depth:        {}", chain.depth());
    Ok(())
}

fn get(config: &Config, key: &str, visibility: Visibility) -> Result<(), Box<dyn std::error::Error>> {
    let chain = config.storage.open()?.load_blockchain()?;
    let store = chain.generate_with(visibility)?;
    match store.get(key) {
        Ok(value) => println!("{}", value),
        Err(e) => {
            eprintln!("{}", e.to_string().yellow());
            std::process::exit(1);
        }
    }
    Ok(())
}

fn show(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let chain = config.storage.open()?.load_blockchain()?;
    println!(
        "{}",
        format!("{} blocks, depth {}", chain.len(), chain.depth()).bright_cyan().bold()
    );
    for (index, block) in chain.blocks().iter().enumerate() {
        let status = if block.is_decided() {
            block.status.to_string().bright_green()
        } else {
            block.status.to_string().yellow()
        };
        let pointer = block
            .hash_pointer
            .map(|p| format!("..{}", p.short()))
            .unwrap_or_else(|| "genesis".to_string());
        println!(
            "#{:<5} {:<10} {:<14} {:<10} req {:<12} {}",
            index,
            status,
            pointer,
            block.nonce,
            block.request_id.to_string(),
            block.operation
        );
    }
    Ok(())
}

fn verify(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let chain = config.storage.open()?.load_blockchain()?;
    validate_chain(&chain)?;
    validate_no_duplicate_requests(&chain)?;
    let digest = chain.generate_with(Visibility::Committed)?.state_digest();
    println!("{}", "✅ Chain is consistent".bright_green());
    println!("   committed state digest: {}", hex::encode(digest));
    Ok(())
}
