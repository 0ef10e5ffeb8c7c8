//! raft-node: run one cluster member from a json config file, or talk to a running one

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use raft_core::Command;
use raft_node::{serve, telemetry, Ledger, MemoryQueue, NodeBuilder, NodeConfig, Service, SubmitReply, TcpClient, TcpTransport};
use raft_storage::FileStorage;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "raft-node", about = "Replicated ledger log node")]
struct Cli {
    #[command(subcommand)]
    command: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Run a cluster member
    Run {
        /// Path to the node's json config
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Send a json-encoded command to a node, which must be the leader
    Submit {
        #[arg(long)]
        addr: String,
        /// e.g. {"kind":"wallet","payload":{"action":"deposit","wallet_id":10,"amount":5}}
        #[arg(long)]
        command: String,
        #[arg(long)]
        correlation_id: Option<String>,
    },
    /// Apply status of the entry carrying a correlation id
    EntryStatus {
        #[arg(long)]
        addr: String,
        correlation_id: String,
    },
    /// Consensus state of a node
    Status {
        #[arg(long)]
        addr: String,
    },
    /// Wallet balance as applied on a node
    Balance {
        #[arg(long)]
        addr: String,
        wallet_id: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Action::Run { config } => run(config).await,
        Action::Submit { addr, command, correlation_id } => {
            let command: Command = serde_json::from_str(&command).context("parsing command json")?;
            let reply = TcpClient::new(addr).submit(command, correlation_id).await?;
            print_json(&reply)?;
            if let SubmitReply::NotLeader { leader_id } = reply {
                match leader_id {
                    Some(leader) => bail!("node is not the leader, try {leader}"),
                    None => bail!("node is not the leader and knows of none"),
                }
            }
            Ok(())
        }
        Action::EntryStatus { addr, correlation_id } => {
            print_json(&TcpClient::new(addr).entry_status(correlation_id).await?)
        }
        Action::Status { addr } => print_json(&TcpClient::new(addr).status().await?),
        Action::Balance { addr, wallet_id } => print_json(&TcpClient::new(addr).balance(wallet_id).await?),
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(path: PathBuf) -> Result<()> {
    telemetry::init_tracing();
    let config = NodeConfig::load(&path).with_context(|| format!("loading {}", path.display()))?;

    let storage = FileStorage::new(&config.data_dir)
        .with_context(|| format!("opening storage in {}", config.data_dir.display()))?;
    let transport = Arc::new(TcpTransport::new(
        config
            .peers
            .iter()
            .filter(|(id, _)| **id != config.id)
            .map(|(id, addr)| (id.clone(), addr.clone())),
    ));
    let queue = Arc::new(MemoryQueue::new());
    let ledger = Ledger::new();

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;

    let handle = NodeBuilder::new(config.id.clone(), config.cluster(), storage, transport)
        .config(config.raft.clone())
        .queue(queue)
        .state_machine(ledger.clone())
        .spawn()
        .context("starting node")?;
    let service = Service::new(handle.clone()).with_ledger(ledger);

    tokio::select! {
        served = serve(listener, service) => served.context("rpc listener failed")?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    let status = handle.status().await.context("reading final status")?;
    info!(
        term = status.term,
        commit_index = status.commit_index,
        last_applied = status.last_applied,
        "final state"
    );
    handle.shutdown().context("stopping node")?;
    Ok(())
}
