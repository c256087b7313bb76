//! Per-node context: one store, one chain, one consensus instance, and the
//! outward submission surface.
//!
//! Everything a node does threads through this object, which keeps node
//! isolation trivial and tests hermetic; there is no process-global state.

use crate::amount::Amount;
use crate::clock::{Clock, SystemClock};
use crate::consensus::{ConsensusEvent, ConsensusStats, RaftConsensus, run_heartbeat_loop};
use crate::crypto::{Crypto, SignerKind, SimCrypto};
use crate::error::{Error, Result};
use crate::fork::ForkResolver;
use crate::ledger::{Block, Ledger, append_block_in};
use crate::network::{Network, SyncReport};
use crate::registry::{NodeId, NodeRegistry, NodeRole};
use crate::store::{
    Channel, OfflineRecord, OfflineStatus, PeerDirectory, Store, Transaction, TxId, TxKind,
    TxStatus, Wallet, WalletId, WalletStatus, generate_id,
};
use crate::utxo::{UtxoEngine, anchor_amount, create_in};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::info;

/// Signer recorded on the genesis block of every node.
const GENESIS_SIGNER: &str = "Central Bank";

/// A transfer submission.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub sender: WalletId,
    pub receiver: WalletId,
    pub amount: Amount,
    pub channel: Channel,
    /// Owning bank; defaults to the sender wallet's bank.
    pub bank_id: Option<u64>,
    pub notes: Option<String>,
}

/// Outcome of one offline reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OfflineSyncReport {
    pub processed: u32,
    pub conflicts: u32,
}

/// One cluster member: storage, engines and consensus bound together.
pub struct Node {
    node_id: NodeId,
    name: String,
    role: NodeRole,
    store: Arc<Store>,
    crypto: Arc<dyn Crypto>,
    clock: Arc<dyn Clock>,
    pub ledger: Ledger,
    pub utxo: UtxoEngine,
    pub registry: NodeRegistry,
    pub network: Network,
    pub fork: ForkResolver,
    consensus: Arc<AsyncMutex<RaftConsensus>>,
    offline_tx_counter: AtomicU64,
    offline_sync_counter: AtomicU64,
    /// Every N-th offline submission fails with a simulated double-spend.
    offline_submit_probe: Option<u64>,
    /// Every N-th reconciled entry surfaces a simulated conflict.
    offline_sync_probe: Option<u64>,
}

impl Node {
    pub fn new(
        node_id: NodeId,
        name: impl Into<String>,
        role: NodeRole,
        peers: PeerDirectory,
    ) -> Node {
        Self::with_collaborators(
            node_id,
            name,
            role,
            peers,
            Arc::new(SimCrypto::new()),
            Arc::new(SystemClock::new()),
        )
    }

    pub fn with_collaborators(
        node_id: NodeId,
        name: impl Into<String>,
        role: NodeRole,
        peers: PeerDirectory,
        crypto: Arc<dyn Crypto>,
        clock: Arc<dyn Clock>,
    ) -> Node {
        let name = name.into();
        let store = Arc::new(Store::new());
        peers.attach(node_id.clone(), store.clone());

        let ledger = Ledger::new(store.clone(), crypto.clone(), clock.clone());
        ledger
            .genesis_if_empty(GENESIS_SIGNER)
            .expect("genesis bootstrap on an empty store");
        let utxo = UtxoEngine::new(store.clone(), clock.clone());
        let registry = NodeRegistry::new(store.clone(), clock.clone());
        registry.register_node(
            node_id.clone(),
            name.clone(),
            role,
            format!("local://{node_id}"),
        );
        let network = Network::new(
            node_id.clone(),
            store.clone(),
            crypto.clone(),
            clock.clone(),
            peers.clone(),
            registry.clone(),
        );
        let fork = ForkResolver::new(store.clone(), ledger.clone(), clock.clone());
        let consensus = Arc::new(AsyncMutex::new(RaftConsensus::new(
            node_id.clone(),
            role == NodeRole::Authority,
            store.clone(),
            peers,
            clock.clone(),
        )));
        info!(node = %node_id, ?role, "node initialised");

        Node {
            node_id,
            name,
            role,
            store,
            crypto,
            clock,
            ledger,
            utxo,
            registry,
            network,
            fork,
            consensus,
            offline_tx_counter: AtomicU64::new(0),
            offline_sync_counter: AtomicU64::new(0),
            offline_submit_probe: None,
            offline_sync_probe: None,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn consensus(&self) -> &Arc<AsyncMutex<RaftConsensus>> {
        &self.consensus
    }

    /// Legacy sampling hooks: surface a simulated conflict every N-th offline
    /// submission / reconciliation. Off by default; the ledger check is the
    /// real defence.
    pub fn set_offline_conflict_probes(&mut self, submit_every: Option<u64>, sync_every: Option<u64>) {
        self.offline_submit_probe = submit_every;
        self.offline_sync_probe = sync_every;
    }

    /// Make this node known to `other`'s registry and vice versa.
    pub fn introduce(&self, other: &Node) {
        self.registry.register_node(
            other.node_id.clone(),
            other.name.clone(),
            other.role,
            format!("local://{}", other.node_id),
        );
        other.registry.register_node(
            self.node_id.clone(),
            self.name.clone(),
            self.role,
            format!("local://{}", self.node_id),
        );
        self.registry.register_connection(&self.node_id, &other.node_id);
        other.registry.register_connection(&other.node_id, &self.node_id);
    }

    /// Background follower tick at the consensus heartbeat interval.
    pub fn spawn_heartbeat(&self) -> JoinHandle<()> {
        tokio::spawn(run_heartbeat_loop(self.consensus.clone()))
    }

    // ---- wallet lifecycle ------------------------------------------------

    pub fn open_wallet(&self, bank_id: u64) -> WalletId {
        let now = self.clock.now();
        self.store.write(|t| {
            let id = t.next_wallet_id();
            t.wallets.insert(
                id,
                Wallet {
                    id,
                    bank_id,
                    status: WalletStatus::Open,
                    offline_status: WalletStatus::Closed,
                    offline_balance: Amount::ZERO,
                    created_at: now,
                },
            );
            id
        })
    }

    pub fn open_offline_wallet(&self, wallet: WalletId) -> Result<()> {
        self.store.transaction(|t| {
            let row = t.wallets.get_mut(&wallet).ok_or(Error::UnknownWallet(wallet))?;
            if row.status != WalletStatus::Open {
                return Err(Error::WalletNotOpen(wallet));
            }
            row.offline_status = WalletStatus::Open;
            Ok(())
        })
    }

    pub fn wallet(&self, id: WalletId) -> Option<Wallet> {
        self.store.read(|t| t.wallets.get(&id).cloned())
    }

    pub fn balance(&self, wallet: WalletId) -> Amount {
        self.utxo.balance(wallet)
    }

    pub fn offline_balance(&self, wallet: WalletId) -> Amount {
        self.store.read(|t| {
            t.wallets
                .get(&wallet)
                .map(|w| w.offline_balance)
                .unwrap_or(Amount::ZERO)
        })
    }

    /// Mint spendable value for a wallet: a confirmed exchange transaction
    /// plus one unspent output, sealed and replicated like any submission.
    pub async fn issue(&self, wallet: WalletId, amount: Amount) -> Result<Transaction> {
        let outcome = self.issue_inner(wallet, amount).await;
        if let Err(err) = &outcome {
            self.record_failure(None, err);
        }
        outcome
    }

    async fn issue_inner(&self, wallet: WalletId, amount: Amount) -> Result<Transaction> {
        if !amount.is_positive() {
            return Err(Error::InvalidAmount);
        }
        self.ensure_leader().await?;
        let row = self
            .wallet(wallet)
            .ok_or(Error::UnknownWallet(wallet))?;
        if row.status != WalletStatus::Open {
            return Err(Error::WalletNotOpen(wallet));
        }
        let tx = self.build_transaction(
            wallet,
            wallet,
            amount,
            TxKind::Exchange,
            Channel::Fiat2Dr,
            TxStatus::Confirmed,
            row.bank_id,
            false,
            Some("value issuance".into()),
        );
        let now = self.clock.now();
        let block = self.store.transaction(|t| {
            t.transactions.insert(tx.id.clone(), tx.clone());
            create_in(t, now, wallet, amount, &tx.id);
            append_block_in(t, self.crypto.as_ref(), now, std::slice::from_ref(&tx), &self.name)
        })?;
        self.finalize_block(block, std::slice::from_ref(&tx)).await?;
        Ok(self.transaction(&tx.id).unwrap_or(tx))
    }

    /// Move spendable balance into the offline envelope.
    pub async fn fund_offline_wallet(&self, wallet: WalletId, amount: Amount) -> Result<Transaction> {
        let outcome = self.fund_offline_inner(wallet, amount).await;
        if let Err(err) = &outcome {
            self.record_failure(None, err);
        }
        outcome
    }

    async fn fund_offline_inner(&self, wallet: WalletId, amount: Amount) -> Result<Transaction> {
        if !amount.is_positive() {
            return Err(Error::InvalidAmount);
        }
        self.ensure_leader().await?;
        let row = self
            .wallet(wallet)
            .ok_or(Error::UnknownWallet(wallet))?;
        if row.status != WalletStatus::Open {
            return Err(Error::WalletNotOpen(wallet));
        }
        if row.offline_status != WalletStatus::Open {
            return Err(Error::OfflineWalletClosed(wallet));
        }
        let available = self.utxo.balance(wallet);
        if available < amount {
            return Err(Error::InsufficientFunds {
                available,
                required: amount,
            });
        }
        let tx = self.build_transaction(
            wallet,
            wallet,
            amount,
            TxKind::Exchange,
            Channel::Fiat2Dr,
            TxStatus::Confirmed,
            row.bank_id,
            false,
            Some("offline envelope funding".into()),
        );
        let (change, _spent) = self.utxo.spend(wallet, amount, &tx.id)?;
        let now = self.clock.now();
        let block = self.store.transaction(|t| {
            t.transactions.insert(tx.id.clone(), tx.clone());
            if change.is_positive() {
                create_in(t, now, wallet, change, &tx.id);
            }
            let envelope = t.wallets.get_mut(&wallet).ok_or(Error::UnknownWallet(wallet))?;
            envelope.offline_balance = envelope
                .offline_balance
                .checked_add(amount)
                .ok_or_else(|| Error::Fatal("offline balance overflow".into()))?;
            append_block_in(t, self.crypto.as_ref(), now, std::slice::from_ref(&tx), &self.name)
        })?;
        self.finalize_block(block, std::slice::from_ref(&tx)).await?;
        Ok(self.transaction(&tx.id).unwrap_or(tx))
    }

    // ---- submission path -------------------------------------------------

    /// Submit an online transfer: validate, reserve outputs, seal a block,
    /// run a consensus round, replicate.
    pub async fn submit_transaction(&self, request: &TransferRequest) -> Result<Transaction> {
        let outcome = self.submit_online(request).await;
        if let Err(err) = &outcome {
            self.record_failure(None, err);
        }
        outcome
    }

    async fn submit_online(&self, request: &TransferRequest) -> Result<Transaction> {
        if !request.amount.is_positive() {
            return Err(Error::InvalidAmount);
        }
        if request.sender == request.receiver {
            return Err(Error::SelfTransfer);
        }
        self.ensure_leader().await?;

        let (sender_wallet, receiver_wallet) = self.store.read(|t| -> Result<(Wallet, Wallet)> {
            Ok((
                t.wallet(request.sender)?.clone(),
                t.wallet(request.receiver)?.clone(),
            ))
        })?;
        if sender_wallet.status != WalletStatus::Open {
            return Err(Error::WalletNotOpen(request.sender));
        }
        if receiver_wallet.status != WalletStatus::Open {
            return Err(Error::WalletNotOpen(request.receiver));
        }

        let available = self.utxo.balance(request.sender);
        if available < request.amount {
            return Err(Error::InsufficientFunds {
                available,
                required: request.amount,
            });
        }

        let bank_id = request.bank_id.unwrap_or(sender_wallet.bank_id);
        let tx = self.build_transaction(
            request.sender,
            request.receiver,
            request.amount,
            TxKind::Online,
            request.channel,
            TxStatus::Confirmed,
            bank_id,
            false,
            request.notes.clone(),
        );
        self.consensus.lock().await.log_transaction(&tx.hash);

        // Reserve and consume outputs first; the block is sealed only over a
        // fully settled transfer.
        let (change, _spent) = self.utxo.spend(request.sender, request.amount, &tx.id)?;

        let now = self.clock.now();
        let block = self.store.transaction(|t| {
            t.transactions.insert(tx.id.clone(), tx.clone());
            create_in(t, now, request.receiver, request.amount, &tx.id);
            if change.is_positive() {
                create_in(t, now, request.sender, change, &tx.id);
            }
            append_block_in(t, self.crypto.as_ref(), now, std::slice::from_ref(&tx), &self.name)
        })?;

        self.finalize_block(block, std::slice::from_ref(&tx)).await?;
        Ok(self.transaction(&tx.id).unwrap_or(tx))
    }

    /// Queue an offline transfer: consume an anchor output (or draw on the
    /// offline envelope), buffer the transaction and mint the next anchor.
    pub async fn create_offline_transaction(&self, request: &TransferRequest) -> Result<Transaction> {
        let outcome = self.submit_offline(request).await;
        if let Err(err) = &outcome {
            self.record_failure(None, err);
        }
        outcome
    }

    async fn submit_offline(&self, request: &TransferRequest) -> Result<Transaction> {
        if !request.amount.is_positive() {
            return Err(Error::InvalidAmount);
        }
        if request.sender == request.receiver {
            return Err(Error::SelfTransfer);
        }

        let counter = self.offline_tx_counter.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(period) = self.offline_submit_probe {
            if counter % period == 0 {
                let candidate = self
                    .utxo
                    .select(request.sender, request.amount)
                    .first()
                    .map(|u| u.id.clone())
                    .unwrap_or_else(|| crate::store::UtxoId("ux-unavailable".into()));
                return Err(Error::DoubleSpendSuspected(candidate));
            }
        }

        let (sender_wallet, receiver_wallet) = self.store.read(|t| -> Result<(Wallet, Wallet)> {
            Ok((
                t.wallet(request.sender)?.clone(),
                t.wallet(request.receiver)?.clone(),
            ))
        })?;
        if sender_wallet.offline_status != WalletStatus::Open {
            return Err(Error::OfflineWalletClosed(request.sender));
        }
        if receiver_wallet.offline_status != WalletStatus::Open {
            return Err(Error::OfflineWalletClosed(request.receiver));
        }

        let bank_id = request.bank_id.unwrap_or(sender_wallet.bank_id);
        let tx = self.build_transaction(
            request.sender,
            request.receiver,
            request.amount,
            TxKind::Offline,
            Channel::C2C,
            TxStatus::OfflineBuffer,
            bank_id,
            true,
            Some("offline payment, awaiting synchronisation".into()),
        );

        // Anchor handling: consume one available output, or fall back to the
        // offline envelope when the wallet holds none.
        let anchor = self.utxo.consume_anchor(request.sender, &tx.id)?;
        if anchor.is_none() {
            let available = self.offline_balance(request.sender);
            if available < request.amount {
                return Err(Error::InsufficientOffline {
                    available,
                    required: request.amount,
                });
            }
        }

        let now = self.clock.now();
        let amount = request.amount;
        self.store.transaction(|t| {
            t.transactions.insert(tx.id.clone(), tx.clone());
            if anchor.is_none() {
                let envelope = t
                    .wallets
                    .get_mut(&request.sender)
                    .ok_or(Error::UnknownWallet(request.sender))?;
                envelope.offline_balance = envelope.offline_balance.saturating_sub(amount);
            }
            t.offline_queue.push(OfflineRecord {
                id: generate_id("off"),
                tx_id: tx.id.clone(),
                status: OfflineStatus::Buffered,
                anchor_utxo: anchor.clone(),
                created_at: now,
                synced_at: None,
                conflict_reason: None,
            });
            // The next offline operation anchors on this freshly minted
            // output; its amount stays below half the spend.
            create_in(t, now, request.sender, anchor_amount(amount), &tx.id);
            Ok(())
        })?;
        Ok(tx)
    }

    /// Reconcile the offline buffer: accepted entries are confirmed, sealed
    /// into blocks and replicated; conflicting anchors are flagged with a
    /// reason.
    pub async fn sync_offline(&self) -> OfflineSyncReport {
        let pending: Vec<OfflineRecord> = self.store.read(|t| {
            t.offline_queue
                .iter()
                .filter(|r| r.status == OfflineStatus::Buffered)
                .cloned()
                .collect()
        });

        let mut report = OfflineSyncReport::default();
        for record in pending {
            let counter = self.offline_sync_counter.fetch_add(1, Ordering::Relaxed) + 1;
            self.set_offline_status(&record.id, OfflineStatus::InProcessing);

            if self.transaction(&record.tx_id).is_none() {
                report.conflicts += 1;
                self.flag_offline_conflict(&record, "transaction record missing");
                continue;
            }

            let probe_hit = self
                .offline_sync_probe
                .map(|period| counter % period == 0)
                .unwrap_or(false);
            let conflict_reason = if probe_hit {
                let anchor = record
                    .anchor_utxo
                    .as_ref()
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".into());
                Some(format!(
                    "double spend detected during synchronisation: anchor UTXO {anchor} was consulted twice"
                ))
            } else {
                self.anchor_conflict(&record)
            };

            if let Some(reason) = conflict_reason {
                report.conflicts += 1;
                self.flag_offline_conflict(&record, &reason);
                continue;
            }

            match self.confirm_offline(&record).await {
                Ok(()) => report.processed += 1,
                Err(err) => {
                    report.conflicts += 1;
                    self.flag_offline_conflict(&record, &err.to_string());
                }
            }
        }
        report
    }

    /// Real reconciliation check: the anchor output must still be consumed by
    /// exactly this transaction. Anything else means the anchor was reused.
    fn anchor_conflict(&self, record: &OfflineRecord) -> Option<String> {
        let anchor_id = record.anchor_utxo.as_ref()?;
        match self.utxo.get(anchor_id) {
            Some(anchor)
                if anchor.status == crate::utxo::UtxoStatus::Spent
                    && anchor.spent_tx.as_ref() == Some(&record.tx_id) =>
            {
                None
            }
            Some(_) => Some(format!(
                "double spend detected: anchor UTXO {anchor_id} is no longer held by transaction {}",
                record.tx_id
            )),
            None => Some(format!("anchor UTXO {anchor_id} not found")),
        }
    }

    async fn confirm_offline(&self, record: &OfflineRecord) -> Result<()> {
        let now = self.clock.now();
        let (block, confirmed) = self.store.transaction(|t| {
            let row = t
                .transactions
                .get_mut(&record.tx_id)
                .ok_or_else(|| Error::Storage(format!("transaction {} missing", record.tx_id)))?;
            row.status = TxStatus::Confirmed;
            row.notes = Some("synchronisation complete".into());
            let confirmed = row.clone();
            if let Some(entry) = t.offline_queue.iter_mut().find(|r| r.id == record.id) {
                entry.status = OfflineStatus::Processed;
                entry.synced_at = Some(now);
            }
            let block = append_block_in(
                t,
                self.crypto.as_ref(),
                now,
                std::slice::from_ref(&confirmed),
                &self.name,
            )?;
            Ok((block, confirmed))
        })?;
        self.finalize_block(block, std::slice::from_ref(&confirmed)).await?;
        Ok(())
    }

    fn set_offline_status(&self, record_id: &str, status: OfflineStatus) {
        self.store.write(|t| {
            if let Some(entry) = t.offline_queue.iter_mut().find(|r| r.id == record_id) {
                entry.status = status;
            }
        });
    }

    fn flag_offline_conflict(&self, record: &OfflineRecord, reason: &str) {
        let now = self.clock.now();
        self.store.write(|t| {
            if let Some(entry) = t.offline_queue.iter_mut().find(|r| r.id == record.id) {
                entry.status = OfflineStatus::Conflict;
                entry.conflict_reason = Some(reason.to_string());
            }
            t.record_failed_transaction(
                Some(record.tx_id.clone()),
                crate::error::ErrorKind::StateConflict,
                reason,
                now,
            );
        });
    }

    // ---- consensus and recovery -----------------------------------------

    pub async fn run_consensus_round(&self, block_hash: &str) -> Vec<ConsensusEvent> {
        self.consensus.lock().await.run_round(block_hash)
    }

    /// Deliver a leader heartbeat-and-append to this node.
    pub async fn observe_heartbeat(
        &self,
        leader: &NodeId,
        leader_term: u64,
        block_hash: &str,
    ) -> Result<()> {
        self.consensus
            .lock()
            .await
            .append_entries(block_hash, leader, leader_term)
    }

    pub async fn simulate_authority_failure(&self) {
        self.consensus.lock().await.simulate_failure();
    }

    pub async fn simulate_authority_recovery(&self) {
        self.consensus.lock().await.simulate_recovery();
    }

    /// Full authority recovery: resume leadership, drain the temporary
    /// leader's accumulated blocks via catch-up sync, then replicate the
    /// adopted suffix across the cluster.
    pub async fn recover_authority(&self) -> SyncReport {
        let previous_height = self.ledger.chain_tip().map(|b| b.height);
        self.consensus.lock().await.simulate_recovery();

        let report = self.network.sync_with_network().await;

        let start = previous_height.map(|h| h + 1).unwrap_or(0);
        for block in self.ledger.blocks_from(start, None) {
            let txs: Vec<Transaction> = self.store.read(|t| {
                t.block_txs
                    .get(&block.height)
                    .map(|ids| {
                        ids.iter()
                            .filter_map(|id| t.transactions.get(id).cloned())
                            .collect()
                    })
                    .unwrap_or_default()
            });
            self.consensus.lock().await.run_round(&block.hash);
            self.network.broadcast(&block, &txs).await;
        }
        report
    }

    pub async fn consensus_stats(&self) -> ConsensusStats {
        self.consensus.lock().await.stats()
    }

    pub fn consensus_events(&self, limit: usize) -> Vec<ConsensusEvent> {
        self.store.read(|t| {
            t.consensus_events
                .iter()
                .rev()
                .take(limit)
                .cloned()
                .collect()
        })
    }

    // ---- queries ---------------------------------------------------------

    pub fn transaction(&self, id: &TxId) -> Option<Transaction> {
        self.store.read(|t| t.transactions.get(id).cloned())
    }

    pub fn offline_queue(&self) -> Vec<OfflineRecord> {
        self.store.read(|t| t.offline_queue.clone())
    }

    pub fn failed_transactions(&self) -> Vec<crate::store::FailedTransaction> {
        self.store.read(|t| t.failed_transactions.clone())
    }

    pub fn system_errors(&self) -> Vec<crate::store::SystemError> {
        self.store.read(|t| t.system_errors.clone())
    }

    /// Round-trip a stored transaction through the signing oracle.
    pub fn verify_transaction(&self, tx: &Transaction) -> bool {
        if tx.compute_hash(self.crypto.as_ref()) != tx.hash {
            return false;
        }
        let user_ok = tx
            .user_sig
            .as_ref()
            .map(|sig| self.crypto.verify(SignerKind::User, tx.sender.0, &tx.hash, sig))
            .unwrap_or(false);
        let bank_ok = tx
            .bank_sig
            .as_ref()
            .map(|sig| self.crypto.verify(SignerKind::Bank, tx.bank_id, &tx.hash, sig))
            .unwrap_or(false);
        user_ok && bank_ok
    }

    // ---- internals -------------------------------------------------------

    /// Accept submissions only on the authority or an elected temporary
    /// leader.
    async fn ensure_leader(&self) -> Result<()> {
        let consensus = self.consensus.lock().await;
        if consensus.is_authority() || consensus.is_leader() {
            Ok(())
        } else {
            Err(Error::ConsensusUnavailable(format!(
                "{} is not the cluster leader",
                self.node_id
            )))
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_transaction(
        &self,
        sender: WalletId,
        receiver: WalletId,
        amount: Amount,
        kind: TxKind,
        channel: Channel,
        status: TxStatus,
        bank_id: u64,
        offline: bool,
        notes: Option<String>,
    ) -> Transaction {
        let mut tx = Transaction {
            id: TxId::generate(),
            sender,
            receiver,
            amount,
            kind,
            channel,
            status,
            timestamp: self.clock.now(),
            bank_id,
            hash: String::new(),
            offline,
            notes,
            user_sig: None,
            bank_sig: None,
            authority_sig: None,
        };
        tx.hash = tx.compute_hash(self.crypto.as_ref());
        tx.user_sig = Some(self.crypto.sign(SignerKind::User, sender.0, &tx.hash));
        tx.bank_sig = Some(self.crypto.sign(SignerKind::Bank, bank_id, &tx.hash));
        tx
    }

    /// Countersign a sealed block, run one consensus round and, when this
    /// node leads as the authority, replicate to the cluster. A temporary
    /// leader accumulates its blocks locally instead.
    async fn finalize_block(&self, mut block: Block, txs: &[Transaction]) -> Result<Block> {
        let signature = self.crypto.sign(SignerKind::Authority, 0, &block.hash);
        self.store.write(|t| {
            if let Some(stored) = t.blocks.get_mut(&block.height) {
                stored.signature = Some(signature.clone());
            }
            for tx in txs {
                if let Some(row) = t.transactions.get_mut(&tx.id) {
                    row.authority_sig = Some(signature.clone());
                }
            }
        });
        block.signature = Some(signature);

        let replicate = {
            let mut consensus = self.consensus.lock().await;
            consensus.run_round(&block.hash);
            consensus.is_authority() && consensus.is_leader()
        };
        if replicate {
            self.network.broadcast(&block, txs).await;
        }
        Ok(block)
    }

    fn record_failure(&self, tx_id: Option<TxId>, err: &Error) {
        let now = self.clock.now();
        self.store.write(|t| {
            t.record_failed_transaction(tx_id.clone(), err.kind(), err.to_string(), now);
            t.record_system_error(
                err.kind().to_string(),
                err.to_string(),
                format!("node_id={}", self.node_id),
                now,
            );
        });
    }
}
