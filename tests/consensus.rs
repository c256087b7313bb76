//! Authority failover and recovery across a live cluster.

use cbdc_node::amount::Amount;
use cbdc_node::consensus::{RaftRole, SimulatedRpc};
use cbdc_node::node::{Node, TransferRequest};
use cbdc_node::registry::{NodeId, NodeRole};
use cbdc_node::store::{Channel, PeerDirectory};
use std::sync::Arc;

async fn cluster(banks: usize) -> (Arc<Node>, Vec<Arc<Node>>) {
    let peers = PeerDirectory::new();
    let authority = Arc::new(Node::new(
        NodeId::from("CBR_0"),
        "Central Bank",
        NodeRole::Authority,
        peers.clone(),
    ));
    authority
        .consensus()
        .lock()
        .await
        .set_rpc(SimulatedRpc::reliable());
    let mut members: Vec<Arc<Node>> = Vec::new();
    for n in 1..=banks {
        let bank = Arc::new(Node::new(
            NodeId::from(format!("BANK_{n}").as_str()),
            format!("Bank {n}"),
            NodeRole::FinancialOrg,
            peers.clone(),
        ));
        bank.consensus().lock().await.set_rpc(SimulatedRpc::reliable());
        authority.introduce(&bank);
        for other in &members {
            bank.introduce(other);
        }
        members.push(bank);
    }
    (authority, members)
}

fn transfer(sender: cbdc_node::store::WalletId, receiver: cbdc_node::store::WalletId, major: i64) -> TransferRequest {
    TransferRequest {
        sender,
        receiver,
        amount: Amount::from_major(major),
        channel: Channel::C2C,
        bank_id: None,
        notes: None,
    }
}

#[tokio::test]
async fn no_follower_leads_while_the_authority_heartbeat_is_fresh() {
    let (_cbr, banks) = cluster(3).await;
    for bank in &banks {
        let mut consensus = bank.consensus().lock().await;
        assert!(!consensus.tick());
        assert_eq!(consensus.role(), RaftRole::Follower);
    }
}

#[tokio::test]
async fn authority_failover_and_recovery_converges_all_chains() {
    let (cbr, banks) = cluster(3).await;

    // Normal operation: two confirmed transfers replicated everywhere.
    let alice = cbr.open_wallet(1);
    let bob = cbr.open_wallet(2);
    cbr.issue(alice, Amount::from_major(1000)).await.unwrap();
    cbr.submit_transaction(&transfer(alice, bob, 100))
        .await
        .unwrap();
    let pre_failure_tip = cbr.ledger.chain_tip().unwrap();

    // BANK_2 carries the longest replicated log, making it the unique
    // election initiator.
    let cbr_id = cbr.node_id().clone();
    banks[1]
        .observe_heartbeat(&cbr_id, 0, &pre_failure_tip.hash)
        .await
        .unwrap();

    // The authority goes silent; every follower notices.
    cbr.simulate_authority_failure().await;
    for bank in &banks {
        bank.simulate_authority_failure().await;
    }

    // Only the best candidate starts an election and wins it.
    assert!(!banks[0].consensus().lock().await.tick());
    assert!(!banks[2].consensus().lock().await.tick());
    assert!(banks[1].consensus().lock().await.tick());
    assert_eq!(banks[1].consensus().lock().await.role(), RaftRole::Leader);
    let fo_term = banks[1].consensus().lock().await.current_term();
    assert_eq!(fo_term, 1);

    // The temporary leader accepts submissions and accumulates blocks
    // without replicating them.
    let fo_wallet = banks[1].open_wallet(2);
    banks[1]
        .issue(fo_wallet, Amount::from_major(500))
        .await
        .unwrap();
    let fo_tip = banks[1].ledger.chain_tip().unwrap();
    assert_eq!(fo_tip.height, pre_failure_tip.height + 1);
    for node in [&cbr, &banks[0], &banks[2]] {
        assert_eq!(
            node.ledger.chain_tip().unwrap().height,
            pre_failure_tip.height,
            "accumulated block must not replicate before recovery"
        );
    }

    // Authority recovery: resume leadership, drain the backlog, replicate.
    let report = cbr.recover_authority().await;
    assert_eq!(report.blocks_added, 1);

    // The first authority heartbeat demotes the temporary leader.
    let recovered_tip = cbr.ledger.chain_tip().unwrap();
    let _ = banks[1]
        .observe_heartbeat(&cbr_id, fo_term, &recovered_tip.hash)
        .await;
    assert_eq!(banks[1].consensus().lock().await.role(), RaftRole::Follower);
    for bank in [&banks[0], &banks[2]] {
        bank.simulate_authority_recovery().await;
    }

    // All four nodes expose identical chains.
    assert_eq!(recovered_tip.height, fo_tip.height);
    assert_eq!(recovered_tip.hash, fo_tip.hash);
    for bank in &banks {
        let tip = bank.ledger.chain_tip().unwrap();
        assert_eq!(tip.height, recovered_tip.height);
        assert_eq!(tip.hash, recovered_tip.hash);
        let (ok, invalid) = bank.ledger.validate_chain();
        assert!(ok, "peer chain invalid at {invalid:?}");
    }
    let (ok, invalid) = cbr.ledger.validate_chain();
    assert!(ok, "authority chain invalid at {invalid:?}");
}
