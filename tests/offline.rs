//! Offline-spend lifecycle: anchors, buffering, reconciliation and the
//! double-spend conflict path.

use cbdc_node::amount::Amount;
use cbdc_node::consensus::SimulatedRpc;
use cbdc_node::error::Error;
use cbdc_node::node::{Node, TransferRequest};
use cbdc_node::registry::{NodeId, NodeRole};
use cbdc_node::store::{Channel, OfflineStatus, PeerDirectory, TxStatus, WalletId};
use cbdc_node::utxo::{UtxoStatus, anchor_amount};

async fn authority() -> Node {
    let peers = PeerDirectory::new();
    let node = Node::new(
        NodeId::from("CBR_0"),
        "Central Bank",
        NodeRole::Authority,
        peers,
    );
    node.consensus().lock().await.set_rpc(SimulatedRpc::reliable());
    node
}

fn transfer(sender: WalletId, receiver: WalletId, major: i64) -> TransferRequest {
    TransferRequest {
        sender,
        receiver,
        amount: Amount::from_major(major),
        channel: Channel::C2C,
        bank_id: None,
        notes: None,
    }
}

async fn offline_pair(node: &Node) -> (WalletId, WalletId) {
    let a = node.open_wallet(1);
    let b = node.open_wallet(1);
    node.open_offline_wallet(a).unwrap();
    node.open_offline_wallet(b).unwrap();
    (a, b)
}

#[tokio::test]
async fn offline_transfer_buffers_and_mints_a_shrinking_anchor() {
    let cbr = authority().await;
    let (alice, bob) = offline_pair(&cbr).await;
    cbr.issue(alice, Amount::from_major(100)).await.unwrap();

    let tx = cbr
        .create_offline_transaction(&transfer(alice, bob, 50))
        .await
        .unwrap();
    assert_eq!(tx.status, TxStatus::OfflineBuffer);
    assert!(tx.offline);

    let queue = cbr.offline_queue();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].status, OfflineStatus::Buffered);
    let anchor_in = queue[0].anchor_utxo.clone().expect("anchor consumed");

    cbr.store().read(|t| {
        // The candidate output was consumed by the buffered transaction.
        let consumed = &t.utxos[&anchor_in];
        assert_eq!(consumed.status, UtxoStatus::Spent);
        assert_eq!(consumed.spent_tx.as_ref(), Some(&tx.id));
        // A fresh anchor below half the spend amount was minted.
        let minted: Vec<_> = t
            .utxos
            .values()
            .filter(|u| u.created_tx == tx.id && u.status == UtxoStatus::Unspent)
            .collect();
        assert_eq!(minted.len(), 1);
        assert_eq!(minted[0].amount, anchor_amount(Amount::from_major(50)));
        assert!(minted[0].amount.minor() * 2 < Amount::from_major(50).minor());
    });
}

#[tokio::test]
async fn sync_confirms_buffered_transfers_into_blocks() {
    let cbr = authority().await;
    let (alice, bob) = offline_pair(&cbr).await;
    cbr.issue(alice, Amount::from_major(100)).await.unwrap();
    let tx = cbr
        .create_offline_transaction(&transfer(alice, bob, 50))
        .await
        .unwrap();
    let height_before = cbr.ledger.chain_tip().unwrap().height;

    let report = cbr.sync_offline().await;
    assert_eq!(report.processed, 1);
    assert_eq!(report.conflicts, 0);

    let confirmed = cbr.transaction(&tx.id).unwrap();
    assert_eq!(confirmed.status, TxStatus::Confirmed);
    assert!(confirmed.authority_sig.is_some());
    assert_eq!(cbr.offline_queue()[0].status, OfflineStatus::Processed);
    assert!(cbr.offline_queue()[0].synced_at.is_some());
    assert_eq!(cbr.ledger.chain_tip().unwrap().height, height_before + 1);

    // Reconciliation is at-most-once: a second pass finds nothing buffered.
    let again = cbr.sync_offline().await;
    assert_eq!(again, Default::default());
}

#[tokio::test]
async fn reused_anchor_is_flagged_as_conflict_on_sync() {
    let cbr = authority().await;
    let (alice, bob) = offline_pair(&cbr).await;
    cbr.issue(alice, Amount::from_major(100)).await.unwrap();

    let tx1 = cbr
        .create_offline_transaction(&transfer(alice, bob, 50))
        .await
        .unwrap();
    let tx2 = cbr
        .create_offline_transaction(&transfer(alice, bob, 30))
        .await
        .unwrap();

    // Replay the divergent-device case: the second buffered transfer claims
    // the same candidate output the first one already consumed.
    let reused = cbr.offline_queue()[0].anchor_utxo.clone().unwrap();
    cbr.store().write(|t| {
        let record = t
            .offline_queue
            .iter_mut()
            .find(|r| r.tx_id == tx2.id)
            .unwrap();
        record.anchor_utxo = Some(reused.clone());
    });

    let report = cbr.sync_offline().await;
    assert_eq!(report.processed, 1);
    assert_eq!(report.conflicts, 1);

    assert_eq!(cbr.transaction(&tx1.id).unwrap().status, TxStatus::Confirmed);
    assert_eq!(cbr.transaction(&tx2.id).unwrap().status, TxStatus::OfflineBuffer);

    let queue = cbr.offline_queue();
    let conflicted = queue.iter().find(|r| r.tx_id == tx2.id).unwrap();
    assert_eq!(conflicted.status, OfflineStatus::Conflict);
    let reason = conflicted.conflict_reason.as_ref().unwrap();
    assert!(
        reason.contains(reused.to_string().as_str()),
        "conflict reason must reference the reused output: {reason}"
    );
    assert!(
        cbr.failed_transactions()
            .iter()
            .any(|f| f.tx_id.as_ref() == Some(&tx2.id))
    );
}

#[tokio::test]
async fn envelope_covers_offline_spend_when_no_outputs_exist() {
    let cbr = authority().await;
    let (alice, bob) = offline_pair(&cbr).await;
    cbr.issue(alice, Amount::from_major(100)).await.unwrap();
    cbr.fund_offline_wallet(alice, Amount::from_major(100))
        .await
        .unwrap();
    assert_eq!(cbr.offline_balance(alice), Amount::from_major(100));
    assert_eq!(cbr.balance(alice), Amount::ZERO);

    let tx = cbr
        .create_offline_transaction(&transfer(alice, bob, 40))
        .await
        .unwrap();
    assert_eq!(cbr.offline_balance(alice), Amount::from_major(60));
    let record = cbr
        .offline_queue()
        .into_iter()
        .find(|r| r.tx_id == tx.id)
        .unwrap();
    assert!(record.anchor_utxo.is_none());
    // The anchor for the next operation is minted even on the envelope path.
    assert_eq!(cbr.balance(alice), anchor_amount(Amount::from_major(40)));
}

#[tokio::test]
async fn offline_gates_are_enforced() {
    let cbr = authority().await;
    let alice = cbr.open_wallet(1);
    let bob = cbr.open_wallet(1);

    // Offline wallet not activated.
    let err = cbr
        .create_offline_transaction(&transfer(alice, bob, 10))
        .await
        .unwrap_err();
    assert_eq!(err, Error::OfflineWalletClosed(alice));

    // Empty envelope and no outputs.
    cbr.open_offline_wallet(alice).unwrap();
    cbr.open_offline_wallet(bob).unwrap();
    let err = cbr
        .create_offline_transaction(&transfer(alice, bob, 10))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientOffline { .. }));
}

#[tokio::test]
async fn sampling_probe_surfaces_simulated_double_spend() {
    let peers = PeerDirectory::new();
    let mut cbr = Node::new(
        NodeId::from("CBR_0"),
        "Central Bank",
        NodeRole::Authority,
        peers,
    );
    cbr.set_offline_conflict_probes(Some(2), None);
    cbr.consensus().lock().await.set_rpc(SimulatedRpc::reliable());
    let (alice, bob) = offline_pair(&cbr).await;
    cbr.issue(alice, Amount::from_major(100)).await.unwrap();

    assert!(
        cbr.create_offline_transaction(&transfer(alice, bob, 10))
            .await
            .is_ok()
    );
    let err = cbr
        .create_offline_transaction(&transfer(alice, bob, 10))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DoubleSpendSuspected(_)));
}
