//! Demo cluster for the CBDC ledger core.
//!
//! Boots an authority node plus a set of financial-organisation peers, runs a
//! handful of online and offline transfers, exercises authority failover and
//! recovery, and prints the resulting chain state.

use anyhow::{Context, Result};
use cbdc_node::amount::Amount;
use cbdc_node::configuration::{init_logging, load_configuration};
use cbdc_node::node::{Node, TransferRequest};
use cbdc_node::registry::{NodeId, NodeRole};
use cbdc_node::store::{Channel, PeerDirectory};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "cbdc-node", version, about = "CBDC distributed-ledger demo cluster")]
struct Cli {
    /// Path to a YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of financial-organisation peers (overrides configuration).
    #[arg(long)]
    banks: Option<usize>,

    /// Online transfers to run through the happy path.
    #[arg(long, default_value_t = 5)]
    transfers: u32,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config =
        load_configuration(cli.config.as_deref()).context("loading configuration")?;
    if let Some(banks) = cli.banks {
        config.cluster.banks = banks;
    }
    init_logging(&config.logging);

    let runtime = tokio::runtime::Runtime::new().context("starting runtime")?;
    runtime.block_on(run(config, cli.transfers))
}

async fn run(config: cbdc_node::configuration::Configuration, transfers: u32) -> Result<()> {
    let peers = PeerDirectory::new();
    let authority = Node::new(
        NodeId::from(config.node.id.as_str()),
        config.node.name.clone(),
        NodeRole::Authority,
        peers.clone(),
    );
    let mut banks = Vec::new();
    for n in 1..=config.cluster.banks {
        let bank = Node::new(
            NodeId::from(format!("BANK_{n}").as_str()),
            format!("Bank {n}"),
            NodeRole::FinancialOrg,
            peers.clone(),
        );
        authority.introduce(&bank);
        for other in &banks {
            bank.introduce(other);
        }
        banks.push(bank);
    }
    info!(banks = banks.len(), "cluster assembled");

    let heartbeats: Vec<_> = banks.iter().map(|b| b.spawn_heartbeat()).collect();

    // Seed two wallets and run the transfer loop.
    let alice = authority.open_wallet(1);
    let bob = authority.open_wallet(2);
    authority.issue(alice, Amount::from_major(10_000)).await?;
    for n in 0..transfers {
        let tx = authority
            .submit_transaction(&TransferRequest {
                sender: alice,
                receiver: bob,
                amount: Amount::from_major(100 + n as i64),
                channel: Channel::C2C,
                bank_id: None,
                notes: None,
            })
            .await?;
        info!(tx = %tx.id, amount = %tx.amount, "online transfer confirmed");
    }

    // Offline flow: activate the envelope, buffer a payment, reconcile.
    authority.open_offline_wallet(alice)?;
    authority.open_offline_wallet(bob)?;
    authority
        .fund_offline_wallet(alice, Amount::from_major(500))
        .await?;
    let offline = authority
        .create_offline_transaction(&TransferRequest {
            sender: alice,
            receiver: bob,
            amount: Amount::from_major(50),
            channel: Channel::C2C,
            bank_id: None,
            notes: None,
        })
        .await?;
    info!(tx = %offline.id, "offline transfer buffered");
    let report = authority.sync_offline().await;
    info!(
        processed = report.processed,
        conflicts = report.conflicts,
        "offline reconciliation finished"
    );

    // Failover: silence the authority, let a peer take over, then recover.
    authority.simulate_authority_failure().await;
    for bank in &banks {
        bank.simulate_authority_failure().await;
    }
    for bank in &banks {
        if bank.consensus().lock().await.tick() {
            info!(node = %bank.node_id(), "temporary leader elected");
            break;
        }
    }
    let sync = authority.recover_authority().await;
    for bank in &banks {
        bank.simulate_authority_recovery().await;
    }
    info!(
        blocks_recovered = sync.blocks_added,
        "authority recovered and cluster drained"
    );

    let (ok, invalid) = authority.ledger.validate_chain();
    let stats = authority.consensus_stats().await;
    info!(
        chain_length = authority.ledger.chain_length(),
        chain_valid = ok,
        invalid_heights = ?invalid,
        term = stats.current_term,
        role = %stats.role,
        "final state"
    );
    for bank in &banks {
        info!(
            node = %bank.node_id(),
            chain_length = bank.ledger.chain_length(),
            "peer state"
        );
    }

    for handle in heartbeats {
        handle.abort();
    }
    Ok(())
}
