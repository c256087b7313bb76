//! Block engine: genesis bootstrap, sealing, append, Merkle roots and chain
//! validation.
//!
//! Blocks are hash-linked containers over an ordered transaction list. The
//! nonce is a proof-of-authority placeholder derived from the height and the
//! previous hash; the authority may additionally sign the sealed hash.

use crate::clock::Clock;
use crate::crypto::{Crypto, ZERO_HASH};
use crate::error::{Error, Result};
use crate::store::{Store, Tables, Transaction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// An immutable, hash-linked container of an ordered list of transactions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub timestamp: DateTime<Utc>,
    pub signer: String,
    pub nonce: u32,
    pub merkle_root: String,
    pub previous_hash: String,
    pub hash: String,
    /// Authority signature over `hash`, if the block was countersigned.
    pub signature: Option<String>,
    pub tx_count: u32,
}

/// Canonical sealing payload; the field order is the canonical encoding.
#[derive(Serialize)]
struct SealPayload<'a> {
    height: u64,
    timestamp: String,
    previous_hash: &'a str,
    signer: &'a str,
    nonce: u32,
    merkle_root: &'a str,
    tx_hashes: &'a [String],
}

impl Block {
    /// Compute the Merkle root and the content hash over the given ordered
    /// transaction hashes.
    pub fn seal(&mut self, tx_hashes: &[String], crypto: &dyn Crypto) {
        self.merkle_root = merkle_root(tx_hashes, crypto);
        self.hash = self.recompute_hash(tx_hashes, crypto);
    }

    /// Recompute the content hash from the stored fields; equal to `hash` for
    /// an untampered block.
    pub fn recompute_hash(&self, tx_hashes: &[String], crypto: &dyn Crypto) -> String {
        let payload = SealPayload {
            height: self.height,
            timestamp: self.timestamp.to_rfc3339(),
            previous_hash: &self.previous_hash,
            signer: &self.signer,
            nonce: self.nonce,
            merkle_root: &self.merkle_root,
            tx_hashes,
        };
        // Serializing a struct with fixed field order cannot fail.
        let encoded = serde_json::to_vec(&payload).unwrap();
        crypto.hash(&encoded)
    }
}

/// Merkle root over ordered transaction hashes.
///
/// Empty input hashes the fixed token `EMPTY`. Each level pairs adjacent
/// hashes, duplicating the last element of an odd level, and hashes the
/// concatenation until one digest remains.
pub fn merkle_root(hashes: &[String], crypto: &dyn Crypto) -> String {
    if hashes.is_empty() {
        return crypto.hash(b"EMPTY");
    }
    let mut layer: Vec<String> = hashes.to_vec();
    while layer.len() > 1 {
        let mut next = Vec::with_capacity(layer.len().div_ceil(2));
        for pair in layer.chunks(2) {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            next.push(crypto.hash(format!("{left}{right}").as_bytes()));
        }
        layer = next;
    }
    layer.pop().unwrap()
}

/// Proof-of-authority nonce: the first eight hex digits of
/// `H(height || previous_hash)`.
pub fn proof_of_authority_nonce(height: u64, previous_hash: &str, crypto: &dyn Crypto) -> u32 {
    let digest = crypto.hash(format!("{height}{previous_hash}").as_bytes());
    u32::from_str_radix(&digest[..8], 16).unwrap_or(0)
}

/// Append-only chain over a node's store.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<Store>,
    crypto: Arc<dyn Crypto>,
    clock: Arc<dyn Clock>,
}

impl Ledger {
    pub fn new(store: Arc<Store>, crypto: Arc<dyn Crypto>, clock: Arc<dyn Clock>) -> Ledger {
        Ledger {
            store,
            crypto,
            clock,
        }
    }

    /// Seal and append the height-0 block if the chain is empty. Idempotent.
    ///
    /// Genesis carries a fixed timestamp so every node seals the identical
    /// block; replication validates hash linkage strictly and the chains must
    /// share their root.
    pub fn genesis_if_empty(&self, signer: &str) -> Result<()> {
        self.store.transaction(|tables| {
            if !tables.blocks.is_empty() {
                return Ok(());
            }
            let mut genesis = Block {
                height: 0,
                timestamp: DateTime::UNIX_EPOCH,
                signer: signer.to_string(),
                nonce: 0,
                merkle_root: String::new(),
                previous_hash: ZERO_HASH.to_string(),
                hash: String::new(),
                signature: None,
                tx_count: 0,
            };
            genesis.seal(&[], self.crypto.as_ref());
            debug!(hash = %genesis.hash, "sealed genesis block");
            tables.block_txs.insert(0, Vec::new());
            tables.blocks.insert(0, genesis);
            Ok(())
        })
    }

    /// Seal a block over a non-empty ordered transaction list and append it
    /// to the chain. The transactions themselves must already be stored; this
    /// writes the block and its block-to-transaction association atomically.
    pub fn append_block(&self, txs: &[Transaction], signer: &str) -> Result<Block> {
        let now = self.clock.now();
        self.store
            .transaction(|tables| append_block_in(tables, self.crypto.as_ref(), now, txs, signer))
    }

    /// Walk the chain in ascending height order, recomputing every hash and
    /// checking linkage. Returns whether the chain is intact plus the heights
    /// that failed.
    pub fn validate_chain(&self) -> (bool, Vec<u64>) {
        self.store.read(|tables| {
            let mut invalid = Vec::new();
            let mut expected_previous = ZERO_HASH.to_string();
            for block in tables.blocks.values() {
                let tx_hashes = tables.tx_hashes_for(block.height);
                let computed = block.recompute_hash(&tx_hashes, self.crypto.as_ref());
                if block.previous_hash != expected_previous || block.hash != computed {
                    invalid.push(block.height);
                }
                expected_previous = block.hash.clone();
            }
            (invalid.is_empty(), invalid)
        })
    }

    pub fn block_by_hash(&self, hash: &str) -> Option<Block> {
        self.store.read(|t| t.block_by_hash(hash).cloned())
    }

    pub fn block_by_previous_hash(&self, previous_hash: &str) -> Option<Block> {
        self.store
            .read(|t| t.block_by_previous_hash(previous_hash).cloned())
    }

    /// Blocks at `from..=to` (or everything above `from` when `to` is
    /// `None`), ascending.
    pub fn blocks_from(&self, from: u64, to: Option<u64>) -> Vec<Block> {
        self.store.read(|t| match to {
            Some(to) => t.blocks.range(from..=to).map(|(_, b)| b.clone()).collect(),
            None => t.blocks.range(from..).map(|(_, b)| b.clone()).collect(),
        })
    }

    pub fn chain_tip(&self) -> Option<Block> {
        self.store.read(|t| t.tip().cloned())
    }

    pub fn chain_length(&self) -> u64 {
        self.store.read(|t| t.chain_length())
    }

    pub fn has_block(&self, hash: &str) -> bool {
        self.store.read(|t| t.block_by_hash(hash).is_some())
    }

    /// Find the most recent block shared with a foreign chain.
    ///
    /// Our chain is walked tip-backwards into a hash set; the foreign chain
    /// is then walked from `other_tip_hash` via `previous_hash` lookups
    /// (against the supplied foreign blocks and our own store) until a match
    /// or the foreign genesis.
    pub fn find_common_ancestor(
        &self,
        other_tip_hash: &str,
        other_blocks: &[Block],
    ) -> Option<Block> {
        self.store.read(|tables| {
            let tip = tables.tip()?;
            let mut ours: HashMap<String, Block> = HashMap::new();
            let mut current = Some(tip.clone());
            while let Some(block) = current {
                let previous = block.previous_hash.clone();
                ours.insert(block.hash.clone(), block);
                if previous == ZERO_HASH {
                    break;
                }
                current = tables.block_by_hash(&previous).cloned();
            }

            let foreign: HashMap<&str, &Block> =
                other_blocks.iter().map(|b| (b.hash.as_str(), b)).collect();
            let lookup = |hash: &str| -> Option<Block> {
                foreign
                    .get(hash)
                    .map(|b| (*b).clone())
                    .or_else(|| tables.block_by_hash(hash).cloned())
            };

            let mut current = lookup(other_tip_hash);
            while let Some(block) = current {
                if let Some(shared) = ours.get(&block.hash) {
                    return Some(shared.clone());
                }
                if block.previous_hash == ZERO_HASH {
                    break;
                }
                current = lookup(&block.previous_hash);
            }
            None
        })
    }

    /// Walk forward from `start_hash`, repeatedly fetching the block whose
    /// `previous_hash` equals the current hash. Returns the ordered suffix.
    pub fn restore_chain_from(&self, start_hash: &str) -> Vec<Block> {
        self.store.read(|tables| {
            let mut chain = Vec::new();
            let mut current = start_hash.to_string();
            loop {
                match tables.block_by_previous_hash(&current) {
                    Some(block) => {
                        current = block.hash.clone();
                        chain.push(block.clone());
                    }
                    None => {
                        if chain.is_empty() {
                            if let Some(block) = tables.block_by_hash(&current) {
                                chain.push(block.clone());
                            }
                        }
                        break;
                    }
                }
            }
            chain
        })
    }
}

/// Table-level append used by the submission path to compose with other
/// mutations in one storage transaction.
pub(crate) fn append_block_in(
    tables: &mut Tables,
    crypto: &dyn Crypto,
    now: DateTime<Utc>,
    txs: &[Transaction],
    signer: &str,
) -> Result<Block> {
    if txs.is_empty() {
        return Err(Error::EmptyBlock);
    }
    let (height, previous_hash) = match tables.tip() {
        Some(tip) => (tip.height + 1, tip.hash.clone()),
        None => (0, ZERO_HASH.to_string()),
    };
    let tx_hashes: Vec<String> = txs.iter().map(|tx| tx.hash.clone()).collect();
    let mut block = Block {
        height,
        timestamp: now,
        signer: signer.to_string(),
        nonce: proof_of_authority_nonce(height, &previous_hash, crypto),
        merkle_root: String::new(),
        previous_hash,
        hash: String::new(),
        signature: None,
        tx_count: txs.len() as u32,
    };
    block.seal(&tx_hashes, crypto);
    debug!(height, hash = %block.hash, tx_count = block.tx_count, "sealed block");
    tables
        .block_txs
        .insert(height, txs.iter().map(|tx| tx.id.clone()).collect());
    tables.blocks.insert(height, block.clone());
    Ok(block)
}
