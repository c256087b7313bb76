//! Fork detection and resolution.
//!
//! Competing chains are resolved by the chain-selection rule: the longer
//! chain wins, ties break towards the earlier tip timestamp. Switching
//! replaces everything above the divergence point in a single storage
//! transaction.

use crate::clock::Clock;
use crate::error::Result;
use crate::ledger::{Block, Ledger};
use crate::store::{Store, Transaction};
use chrono::TimeDelta;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// A transaction is attributed to a switched-in block only when their
/// timestamps are within this window.
const TX_ATTRIBUTION_WINDOW_SECS: i64 = 3600;

/// Description of a detected fork between our chain and a foreign one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForkInfo {
    pub common_ancestor_height: u64,
    pub common_ancestor_hash: String,
    /// Blocks on our side above the common ancestor.
    pub our_chain_length: u64,
    /// Blocks on the foreign side above the common ancestor.
    pub other_chain_length: u64,
    pub our_tip_hash: String,
    pub other_tip_hash: String,
    /// First height that differs: ancestor height + 1.
    pub divergence_point: u64,
}

/// Fork handling over a node's store and block engine.
#[derive(Clone)]
pub struct ForkResolver {
    store: Arc<Store>,
    ledger: Ledger,
    clock: Arc<dyn Clock>,
}

impl ForkResolver {
    pub fn new(store: Arc<Store>, ledger: Ledger, clock: Arc<dyn Clock>) -> ForkResolver {
        ForkResolver {
            store,
            ledger,
            clock,
        }
    }

    /// Detect a fork against a foreign tip. Returns fork coordinates when the
    /// tips differ and the chains share a common ancestor.
    pub fn detect_fork(&self, other_tip_hash: &str, other_blocks: &[Block]) -> Option<ForkInfo> {
        let our_tip = self.ledger.chain_tip()?;
        if our_tip.hash == other_tip_hash {
            return None;
        }
        let other_tip = other_blocks
            .iter()
            .find(|b| b.hash == other_tip_hash)
            .cloned()
            .or_else(|| self.ledger.block_by_hash(other_tip_hash))?;
        let ancestor = self
            .ledger
            .find_common_ancestor(other_tip_hash, other_blocks)?;

        let our_length = our_tip.height.saturating_sub(ancestor.height);
        let other_length = other_tip.height.saturating_sub(ancestor.height);
        if our_length == 0 && other_length == 0 {
            return None;
        }
        info!(
            ancestor = ancestor.height,
            our_length, other_length, "fork detected"
        );
        Some(ForkInfo {
            common_ancestor_height: ancestor.height,
            common_ancestor_hash: ancestor.hash,
            our_chain_length: our_length,
            other_chain_length: other_length,
            our_tip_hash: our_tip.hash,
            other_tip_hash: other_tip_hash.to_string(),
            divergence_point: ancestor.height + 1,
        })
    }

    /// Chain-selection rule. Returns whether to switch and how many of our
    /// blocks the switch would remove.
    ///
    /// The longer chain wins; equal lengths break towards the earlier foreign
    /// tip timestamp.
    pub fn resolve_fork(&self, fork: &ForkInfo, other_blocks: &[Block]) -> (bool, u64) {
        if fork.other_chain_length > fork.our_chain_length {
            return (true, fork.our_chain_length);
        }
        if fork.other_chain_length < fork.our_chain_length {
            return (false, 0);
        }
        let our_tip = self.ledger.block_by_hash(&fork.our_tip_hash);
        let other_tip = other_blocks.iter().find(|b| b.hash == fork.other_tip_hash);
        match (our_tip, other_tip) {
            (Some(ours), Some(other)) if other.timestamp < ours.timestamp => {
                (true, fork.our_chain_length)
            }
            _ => (false, 0),
        }
    }

    /// Atomically replace our chain above the divergence point with the
    /// foreign blocks. Transactions are attributed to the new block with the
    /// closest timestamp within the attribution window. Returns
    /// `(removed, added)`.
    pub fn switch_to_chain(
        &self,
        fork: &ForkInfo,
        new_blocks: &[Block],
        new_txs: &[Transaction],
    ) -> Result<(u32, u32)> {
        let divergence = fork.divergence_point;
        let outcome = self.store.transaction(|tables| {
            let mut removed = 0u32;
            let mut added = 0u32;

            let stale: Vec<u64> = tables.blocks.range(divergence..).map(|(h, _)| *h).collect();
            for height in stale.into_iter().rev() {
                tables.blocks.remove(&height);
                tables.block_txs.remove(&height);
                removed += 1;
            }

            let mut incoming: Vec<&Block> = new_blocks
                .iter()
                .filter(|b| b.height >= divergence)
                .collect();
            incoming.sort_by_key(|b| b.height);
            incoming.dedup_by_key(|b| b.height);

            for block in incoming {
                if tables.blocks.contains_key(&block.height) {
                    continue;
                }
                let mut block_txs: Vec<&Transaction> = new_txs
                    .iter()
                    .filter(|tx| closest_block_height(tx, new_blocks, divergence) == Some(block.height))
                    .collect();
                block_txs.sort_by_key(|tx| tx.timestamp);

                for tx in &block_txs {
                    tables
                        .transactions
                        .entry(tx.id.clone())
                        .or_insert_with(|| (*tx).clone());
                }
                tables.block_txs.insert(
                    block.height,
                    block_txs.iter().map(|tx| tx.id.clone()).collect(),
                );
                tables.blocks.insert(block.height, block.clone());
                added += 1;
            }

            Ok((removed, added))
        });

        match outcome {
            Ok((removed, added)) => {
                info!(removed, added, divergence, "switched to foreign chain");
                Ok((removed, added))
            }
            Err(err) => {
                warn!(error = %err, "chain switch aborted");
                let now = self.clock.now();
                self.store.write(|t| {
                    t.record_system_error(
                        "FORK_RESOLUTION_ERROR",
                        err.to_string(),
                        format!("divergence_point={divergence}"),
                        now,
                    );
                });
                Err(err)
            }
        }
    }

    /// Verify that a candidate chain links consecutively and that the local
    /// chain validates end-to-end after a switch.
    pub fn validate_chain_switch(&self, new_blocks: &[Block]) -> bool {
        if new_blocks.is_empty() {
            return false;
        }
        for pair in new_blocks.windows(2) {
            if pair[1].previous_hash != pair[0].hash {
                return false;
            }
        }
        self.ledger.validate_chain().0
    }
}

/// The height of the candidate block whose timestamp is closest to the
/// transaction's, within the attribution window.
fn closest_block_height(tx: &Transaction, blocks: &[Block], divergence: u64) -> Option<u64> {
    blocks
        .iter()
        .filter(|b| b.height >= divergence)
        .map(|b| (b.height, (tx.timestamp - b.timestamp).abs()))
        .min_by_key(|(_, delta)| *delta)
        .filter(|(_, delta)| *delta < TimeDelta::seconds(TX_ATTRIBUTION_WINDOW_SECS))
        .map(|(height, _)| height)
}

// Integration-level fork scenarios live in tests/fork.rs; the unit test here
// pins the selection rule determinism.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::crypto::SimCrypto;

    fn resolver_with_chain() -> (ForkResolver, Ledger, Arc<Store>) {
        let store = Arc::new(Store::new());
        let crypto = Arc::new(SimCrypto::new());
        let clock = Arc::new(SystemClock::new());
        let ledger = Ledger::new(store.clone(), crypto, clock.clone());
        ledger.genesis_if_empty("Central Bank").unwrap();
        let resolver = ForkResolver::new(store.clone(), ledger.clone(), clock);
        (resolver, ledger, store)
    }

    #[test]
    fn longer_foreign_chain_wins() {
        let (resolver, ledger, _store) = resolver_with_chain();
        let genesis = ledger.chain_tip().unwrap();
        let fork = ForkInfo {
            common_ancestor_height: 0,
            common_ancestor_hash: genesis.hash.clone(),
            our_chain_length: 1,
            other_chain_length: 2,
            our_tip_hash: genesis.hash.clone(),
            other_tip_hash: "other".into(),
            divergence_point: 1,
        };
        assert_eq!(resolver.resolve_fork(&fork, &[]), (true, 1));

        let shorter = ForkInfo {
            other_chain_length: 0,
            ..fork
        };
        assert_eq!(resolver.resolve_fork(&shorter, &[]), (false, 0));
    }

    #[test]
    fn equal_length_ties_break_on_earlier_tip() {
        let (resolver, ledger, _store) = resolver_with_chain();
        let ours = ledger.chain_tip().unwrap();
        let mut earlier = ours.clone();
        earlier.hash = "foreign-tip".into();
        earlier.timestamp = ours.timestamp - TimeDelta::seconds(10);
        let fork = ForkInfo {
            common_ancestor_height: 0,
            common_ancestor_hash: "shared".into(),
            our_chain_length: 2,
            other_chain_length: 2,
            our_tip_hash: ours.hash.clone(),
            other_tip_hash: earlier.hash.clone(),
            divergence_point: 1,
        };
        assert_eq!(resolver.resolve_fork(&fork, &[earlier.clone()]), (true, 2));

        let mut later = earlier;
        later.timestamp = ours.timestamp + TimeDelta::seconds(10);
        assert_eq!(resolver.resolve_fork(&fork, &[later]), (false, 0));
    }
}
