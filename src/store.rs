//! Per-node transactional store.
//!
//! Every node owns one [`Store`]: typed tables for blocks, transactions,
//! unspent outputs, the consensus log, the node registry and the error
//! journals. Rows are explicit record types validated at this boundary; the
//! cyclic transaction/UTXO/block relationships are expressed as id references
//! rather than pointer graphs.
//!
//! [`Store::transaction`] groups mutations atomically: the closure either
//! commits as a whole or the tables roll back to their prior state. The store
//! is the only shared mutable state inside a node and must never be held
//! across an await point.

use crate::amount::Amount;
use crate::consensus::{ConsensusEvent, LogEntry};
use crate::crypto::Crypto;
use crate::error::{Error, ErrorKind, Result};
use crate::ledger::Block;
use crate::registry::{NodeId, NodeRecord, PeerLink};
use crate::utxo::Utxo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

/// Short unique id with a table prefix, e.g. `tx-9f31c2ab`.
pub fn generate_id(prefix: &str) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &hex[..8])
}

/// Transaction identifier (`tx-...`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(pub String);

impl TxId {
    pub fn generate() -> TxId {
        TxId(generate_id("tx"))
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unspent-output identifier (`ux-...`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UtxoId(pub String);

impl UtxoId {
    pub fn generate() -> UtxoId {
        UtxoId(generate_id("ux"))
    }
}

impl fmt::Display for UtxoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Wallet identifier; wallets are the core's balance unit, users stay
/// bank-side.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct WalletId(pub u64);

impl fmt::Display for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxKind {
    Online,
    Offline,
    Exchange,
    Contract,
}

/// Payment channel tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Channel {
    #[serde(rename = "C2C")]
    C2C,
    #[serde(rename = "C2B")]
    C2B,
    #[serde(rename = "B2B")]
    B2B,
    #[serde(rename = "FIAT2DR")]
    Fiat2Dr,
}

/// Transaction lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    Pending,
    Confirmed,
    OfflineBuffer,
}

/// A ledger transaction row. Immutable once status reaches `Confirmed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxId,
    pub sender: WalletId,
    pub receiver: WalletId,
    pub amount: Amount,
    pub kind: TxKind,
    pub channel: Channel,
    pub status: TxStatus,
    pub timestamp: DateTime<Utc>,
    pub bank_id: u64,
    pub hash: String,
    pub offline: bool,
    pub notes: Option<String>,
    pub user_sig: Option<String>,
    pub bank_sig: Option<String>,
    pub authority_sig: Option<String>,
}

impl Transaction {
    /// Content hash over the canonical encoding
    /// `id | sender | receiver | amount | timestamp`.
    pub fn compute_hash(&self, crypto: &dyn Crypto) -> String {
        let canonical = format!(
            "{}|{}|{}|{}|{}",
            self.id,
            self.sender,
            self.receiver,
            self.amount,
            self.timestamp.to_rfc3339()
        );
        crypto.hash(canonical.as_bytes())
    }
}

/// Open/closed gate shared by the online and offline wallet envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalletStatus {
    Open,
    Closed,
}

/// Balance unit of the core. Spendable value lives in unspent outputs; the
/// offline envelope carries value reserved for disconnected operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: WalletId,
    pub bank_id: u64,
    pub status: WalletStatus,
    pub offline_status: WalletStatus,
    pub offline_balance: Amount,
    pub created_at: DateTime<Utc>,
}

/// Offline-queue entry status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfflineStatus {
    Buffered,
    InProcessing,
    Processed,
    Conflict,
}

/// A buffered offline payment awaiting reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineRecord {
    pub id: String,
    pub tx_id: TxId,
    pub status: OfflineStatus,
    /// Output consumed as the spend anchor; `None` when the transfer was
    /// covered from the offline envelope.
    pub anchor_utxo: Option<UtxoId>,
    pub created_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
    pub conflict_reason: Option<String>,
}

/// Journal row correlated with a failed submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTransaction {
    pub id: String,
    pub tx_id: Option<TxId>,
    pub kind: ErrorKind,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Journal row for abnormal runtime events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemError {
    pub kind: String,
    pub message: String,
    pub context: String,
    pub created_at: DateTime<Utc>,
}

/// Durable consensus state (term and vote), per node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RaftState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
}

/// All tables of one node. Cloneable so a failed transaction can roll back.
#[derive(Debug, Clone, Default)]
pub struct Tables {
    pub wallets: BTreeMap<WalletId, Wallet>,
    pub wallet_seq: u64,
    pub transactions: HashMap<TxId, Transaction>,
    pub blocks: BTreeMap<u64, Block>,
    /// Ordered transaction ids per block height.
    pub block_txs: BTreeMap<u64, Vec<TxId>>,
    pub utxos: HashMap<UtxoId, Utxo>,
    pub utxo_seq: u64,
    pub raft: RaftState,
    pub raft_log: BTreeMap<u64, LogEntry>,
    /// Granted election votes keyed `(term, candidate, voter)`.
    pub raft_votes: BTreeSet<(u64, NodeId, NodeId)>,
    pub consensus_events: Vec<ConsensusEvent>,
    pub nodes: BTreeMap<NodeId, NodeRecord>,
    pub connections: BTreeMap<(NodeId, NodeId), PeerLink>,
    pub offline_queue: Vec<OfflineRecord>,
    pub failed_transactions: Vec<FailedTransaction>,
    pub system_errors: Vec<SystemError>,
}

impl Tables {
    /// Highest block, if any.
    pub fn tip(&self) -> Option<&Block> {
        self.blocks.values().next_back()
    }

    pub fn chain_length(&self) -> u64 {
        self.tip().map(|b| b.height + 1).unwrap_or(0)
    }

    pub fn block_by_hash(&self, hash: &str) -> Option<&Block> {
        self.blocks.values().find(|b| b.hash == hash)
    }

    /// Lowest block whose `previous_hash` matches, mirroring forward walks.
    pub fn block_by_previous_hash(&self, previous_hash: &str) -> Option<&Block> {
        self.blocks
            .values()
            .find(|b| b.previous_hash == previous_hash)
    }

    /// Stored content hashes of a block's transactions, in block order.
    pub fn tx_hashes_for(&self, height: u64) -> Vec<String> {
        self.block_txs
            .get(&height)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.transactions.get(id))
                    .map(|tx| tx.hash.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn last_log_index(&self) -> u64 {
        self.raft_log.keys().next_back().copied().unwrap_or(0)
    }

    pub fn last_log_term(&self) -> u64 {
        self.raft_log
            .values()
            .next_back()
            .map(|e| e.term)
            .unwrap_or(0)
    }

    pub fn next_wallet_id(&mut self) -> WalletId {
        self.wallet_seq += 1;
        WalletId(self.wallet_seq)
    }

    pub fn next_utxo_seq(&mut self) -> u64 {
        self.utxo_seq += 1;
        self.utxo_seq
    }

    pub fn wallet(&self, id: WalletId) -> Result<&Wallet> {
        self.wallets.get(&id).ok_or(Error::UnknownWallet(id))
    }

    pub fn record_failed_transaction(
        &mut self,
        tx_id: Option<TxId>,
        kind: ErrorKind,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.failed_transactions.push(FailedTransaction {
            id: generate_id("fail"),
            tx_id,
            kind,
            message: message.into(),
            created_at: now,
        });
    }

    pub fn record_system_error(
        &mut self,
        kind: impl Into<String>,
        message: impl Into<String>,
        context: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.system_errors.push(SystemError {
            kind: kind.into(),
            message: message.into(),
            context: context.into(),
            created_at: now,
        });
    }
}

/// Transactional handle over one node's tables.
pub struct Store {
    tables: Mutex<Tables>,
}

impl Store {
    pub fn new() -> Store {
        Store {
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Read-only access under the table lock.
    pub fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        let tables = self.tables.lock().unwrap();
        f(&tables)
    }

    /// Single-step mutation; infallible closures commit unconditionally.
    pub fn write<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> T {
        let mut tables = self.tables.lock().unwrap();
        f(&mut tables)
    }

    /// Grouped atomic mutation. On `Err` every change made by the closure is
    /// rolled back before the error is returned.
    pub fn transaction<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        let mut tables = self.tables.lock().unwrap();
        let snapshot = tables.clone();
        match f(&mut tables) {
            Ok(value) => Ok(value),
            Err(err) => {
                *tables = snapshot;
                Err(err)
            }
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

/// Opens handles to peer stores.
///
/// This is the in-process stand-in for the cluster transport: a replicating
/// leader writes into peer stores directly. A real deployment would route
/// those writes as messages applied by the owning node, behind this same
/// seam.
#[derive(Clone, Default)]
pub struct PeerDirectory {
    inner: Arc<RwLock<BTreeMap<NodeId, Arc<Store>>>>,
}

impl PeerDirectory {
    pub fn new() -> PeerDirectory {
        PeerDirectory::default()
    }

    pub fn attach(&self, node: NodeId, store: Arc<Store>) {
        self.inner.write().unwrap().insert(node, store);
    }

    pub fn open(&self, node: &NodeId) -> Option<Arc<Store>> {
        self.inner.read().unwrap().get(node).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SimCrypto;

    fn sample_tx() -> Transaction {
        Transaction {
            id: TxId::generate(),
            sender: WalletId(1),
            receiver: WalletId(2),
            amount: Amount::from_major(300),
            kind: TxKind::Online,
            channel: Channel::C2C,
            status: TxStatus::Confirmed,
            timestamp: Utc::now(),
            bank_id: 1,
            hash: String::new(),
            offline: false,
            notes: None,
            user_sig: None,
            bank_sig: None,
            authority_sig: None,
        }
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let store = Store::new();
        let tx = sample_tx();
        let id = tx.id.clone();
        let result: Result<()> = store.transaction(|t| {
            t.transactions.insert(tx.id.clone(), tx.clone());
            Err(Error::Storage("forced abort".into()))
        });
        assert!(result.is_err());
        assert!(store.read(|t| t.transactions.get(&id).is_none()));
    }

    #[test]
    fn transaction_commits_on_ok() {
        let store = Store::new();
        let tx = sample_tx();
        let id = tx.id.clone();
        store
            .transaction(|t| {
                t.transactions.insert(tx.id.clone(), tx.clone());
                Ok(())
            })
            .unwrap();
        assert!(store.read(|t| t.transactions.contains_key(&id)));
    }

    #[test]
    fn stored_hash_round_trips_canonical_encoding() {
        let crypto = SimCrypto::new();
        let mut tx = sample_tx();
        tx.hash = tx.compute_hash(&crypto);
        assert_eq!(tx.hash, tx.compute_hash(&crypto));
    }

    #[test]
    fn generated_ids_carry_prefix() {
        let id = generate_id("ux");
        assert!(id.starts_with("ux-"));
        assert_eq!(id.len(), 11);
    }

    #[test]
    fn peer_directory_opens_attached_stores() {
        let dir = PeerDirectory::new();
        let store = Arc::new(Store::new());
        let node = NodeId::from("BANK_1");
        dir.attach(node.clone(), store.clone());
        assert!(dir.open(&node).is_some());
        assert!(dir.open(&NodeId::from("BANK_2")).is_none());
    }
}
