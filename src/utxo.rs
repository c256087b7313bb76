//! UTXO engine: balances, selection, two-phase locked spending, change and
//! the offline-spend anchor.
//!
//! Double-spend defence rests on the lock phase: an output is claimed with an
//! atomic compare-and-set keyed by the spending transaction, verified by
//! re-reading the row, and only then consumed. Locks older than
//! [`STALE_LOCK_SECS`] belong to crashed spenders and may be broken.

use crate::amount::Amount;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::store::{Store, Tables, TxId, UtxoId, WalletId};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// A lock held longer than this is stale and may be broken.
pub const STALE_LOCK_SECS: i64 = 5 * 60;

/// Unspent-output status; transitions `Unspent -> Spent` at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UtxoStatus {
    Unspent,
    Spent,
}

/// An unspent transaction output owned by a wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utxo {
    pub id: UtxoId,
    pub owner: WalletId,
    pub amount: Amount,
    pub status: UtxoStatus,
    pub created_tx: TxId,
    /// Set exactly when status becomes `Spent`.
    pub spent_tx: Option<TxId>,
    pub locked_by: Option<TxId>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub spent_at: Option<DateTime<Utc>>,
    /// Creation order within the node, for deterministic selection.
    pub seq: u64,
}

impl Utxo {
    /// Whether the current lock, if any, is older than the stale threshold.
    pub fn lock_is_stale(&self, now: DateTime<Utc>) -> bool {
        match self.locked_at {
            Some(at) => now - at > TimeDelta::seconds(STALE_LOCK_SECS),
            None => false,
        }
    }

    /// Selectable: unspent and not held by a live lock.
    pub fn available(&self, now: DateTime<Utc>) -> bool {
        self.status == UtxoStatus::Unspent
            && (self.locked_by.is_none() || self.lock_is_stale(now))
    }
}

/// Anchor minted after every offline spend: `max(0.01, round(0.4 * amount))`,
/// strictly below half the spend so repeated offline operations shrink it.
pub fn anchor_amount(amount: Amount) -> Amount {
    let rounded = Amount::from_minor((amount.minor() * 4 + 5) / 10);
    rounded.max(Amount::MINOR_UNIT)
}

/// Unspent-output operations over a node's store.
#[derive(Clone)]
pub struct UtxoEngine {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
}

impl UtxoEngine {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>) -> UtxoEngine {
        UtxoEngine { store, clock }
    }

    /// Spendable balance: the sum of unspent amounts for the wallet.
    pub fn balance(&self, wallet: WalletId) -> Amount {
        self.store.read(|t| balance_in(t, wallet))
    }

    /// Pick available outputs in ascending creation order until the running
    /// sum covers `amount`. May return fewer when the balance is
    /// insufficient; callers must check the covered sum.
    pub fn select(&self, wallet: WalletId, amount: Amount) -> Vec<Utxo> {
        let now = self.clock.now();
        self.store.read(|t| select_in(t, now, wallet, amount))
    }

    /// Insert a fresh unspent output.
    pub fn create(&self, owner: WalletId, amount: Amount, creating_tx: &TxId) -> UtxoId {
        let now = self.clock.now();
        self.store
            .write(|t| create_in(t, now, owner, amount, creating_tx))
    }

    pub fn get(&self, id: &UtxoId) -> Option<Utxo> {
        self.store.read(|t| t.utxos.get(id).cloned())
    }

    /// Two-phase spend.
    ///
    /// Lock phase: claim each selected output with a compare-and-set; if any
    /// claim is lost, release everything obtained so far and fail with
    /// `UtxoLocked` with no internal retry. Spend phase: consume the locked
    /// outputs; if the last output overshoots the demand the surplus is
    /// returned as change for the caller to mint (outputs are never split in
    /// place).
    pub fn spend(
        &self,
        wallet: WalletId,
        amount: Amount,
        spending_tx: &TxId,
    ) -> Result<(Amount, Vec<UtxoId>)> {
        if !amount.is_positive() {
            return Err(Error::InvalidAmount);
        }
        let selected = self.select(wallet, amount);
        let covered: Amount = selected.iter().map(|u| u.amount).sum();
        if selected.is_empty() || covered < amount {
            return Err(Error::InsufficientUtxo {
                available: covered,
                required: amount,
            });
        }

        let locked = self.lock_outputs(&selected, spending_tx)?;

        // Spend phase: all claims held, consume them in selection order.
        let now = self.clock.now();
        self.store.transaction(|tables| {
            let mut remaining = amount;
            let mut change = Amount::ZERO;
            for id in &locked {
                let utxo = tables
                    .utxos
                    .get_mut(id)
                    .ok_or_else(|| Error::Fatal(format!("locked utxo {id} disappeared")))?;
                if utxo.locked_by.as_ref() != Some(spending_tx) {
                    return Err(Error::UtxoLocked(id.clone()));
                }
                if utxo.amount > remaining {
                    change = utxo.amount.saturating_sub(remaining);
                    remaining = Amount::ZERO;
                } else {
                    remaining = remaining.saturating_sub(utxo.amount);
                }
                utxo.status = UtxoStatus::Spent;
                utxo.spent_tx = Some(spending_tx.clone());
                utxo.spent_at = Some(now);
                utxo.locked_by = None;
                utxo.locked_at = None;
            }
            debug!(%wallet, %amount, %change, outputs = locked.len(), "spent outputs");
            Ok((change, locked.clone()))
        })
    }

    /// Single-output variant used by the offline path: lock and consume one
    /// available output (smallest first). Returns `None` when the wallet has
    /// no candidate, leaving the caller to fall back to the offline envelope.
    pub fn consume_anchor(&self, wallet: WalletId, spending_tx: &TxId) -> Result<Option<UtxoId>> {
        let now = self.clock.now();
        let candidate = self.store.read(|t| {
            let mut candidates: Vec<&Utxo> = t
                .utxos
                .values()
                .filter(|u| u.owner == wallet && u.available(now))
                .collect();
            candidates.sort_by_key(|u| (u.amount, u.seq));
            candidates.first().map(|u| u.id.clone())
        });
        let Some(id) = candidate else {
            return Ok(None);
        };

        self.claim(&id, spending_tx)?;
        self.store.transaction(|tables| {
            let utxo = tables
                .utxos
                .get_mut(&id)
                .ok_or_else(|| Error::Fatal(format!("locked utxo {id} disappeared")))?;
            if utxo.locked_by.as_ref() != Some(spending_tx) {
                return Err(Error::UtxoLocked(id.clone()));
            }
            utxo.status = UtxoStatus::Spent;
            utxo.spent_tx = Some(spending_tx.clone());
            utxo.spent_at = Some(self.clock.now());
            utxo.locked_by = None;
            utxo.locked_at = None;
            Ok(())
        })?;
        Ok(Some(id))
    }

    /// Lock phase over a selection; releases partial claims on failure.
    fn lock_outputs(&self, selected: &[Utxo], spending_tx: &TxId) -> Result<Vec<UtxoId>> {
        let mut locked: Vec<UtxoId> = Vec::with_capacity(selected.len());
        for utxo in selected {
            if let Err(err) = self.claim(&utxo.id, spending_tx) {
                self.store.write(|tables| {
                    for id in &locked {
                        if let Some(u) = tables.utxos.get_mut(id) {
                            if u.locked_by.as_ref() == Some(spending_tx) {
                                u.locked_by = None;
                                u.locked_at = None;
                            }
                        }
                    }
                });
                return Err(err);
            }
            locked.push(utxo.id.clone());
        }
        Ok(locked)
    }

    /// Atomic `locked_by = null or stale => locked_by = spending_tx` update,
    /// then ownership verification by re-reading the row.
    fn claim(&self, id: &UtxoId, spending_tx: &TxId) -> Result<()> {
        let now = self.clock.now();
        self.store.write(|tables| {
            if let Some(utxo) = tables.utxos.get_mut(id) {
                if utxo.status == UtxoStatus::Unspent
                    && (utxo.locked_by.is_none() || utxo.lock_is_stale(now))
                {
                    utxo.locked_by = Some(spending_tx.clone());
                    utxo.locked_at = Some(now);
                }
            }
        });
        let won = self.store.read(|tables| {
            tables
                .utxos
                .get(id)
                .map(|u| u.status == UtxoStatus::Unspent && u.locked_by.as_ref() == Some(spending_tx))
                .unwrap_or(false)
        });
        if won {
            Ok(())
        } else {
            Err(Error::UtxoLocked(id.clone()))
        }
    }
}

pub(crate) fn balance_in(tables: &Tables, wallet: WalletId) -> Amount {
    tables
        .utxos
        .values()
        .filter(|u| u.owner == wallet && u.status == UtxoStatus::Unspent)
        .map(|u| u.amount)
        .sum()
}

pub(crate) fn select_in(
    tables: &Tables,
    now: DateTime<Utc>,
    wallet: WalletId,
    amount: Amount,
) -> Vec<Utxo> {
    let mut candidates: Vec<&Utxo> = tables
        .utxos
        .values()
        .filter(|u| u.owner == wallet && u.available(now))
        .collect();
    candidates.sort_by_key(|u| u.seq);
    let mut selected = Vec::new();
    let mut total = Amount::ZERO;
    for utxo in candidates {
        selected.push(utxo.clone());
        total = total.checked_add(utxo.amount).unwrap_or(total);
        if total >= amount {
            break;
        }
    }
    selected
}

pub(crate) fn create_in(
    tables: &mut Tables,
    now: DateTime<Utc>,
    owner: WalletId,
    amount: Amount,
    creating_tx: &TxId,
) -> UtxoId {
    let id = UtxoId::generate();
    let seq = tables.next_utxo_seq();
    tables.utxos.insert(
        id.clone(),
        Utxo {
            id: id.clone(),
            owner,
            amount,
            status: UtxoStatus::Unspent,
            created_tx: creating_tx.clone(),
            spent_tx: None,
            locked_by: None,
            locked_at: None,
            created_at: now,
            spent_at: None,
            seq,
        },
    );
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn engine() -> (UtxoEngine, Arc<Store>) {
        let store = Arc::new(Store::new());
        let engine = UtxoEngine::new(store.clone(), Arc::new(SystemClock::new()));
        (engine, store)
    }

    fn mint(engine: &UtxoEngine, wallet: WalletId, major: i64) -> UtxoId {
        engine.create(wallet, Amount::from_major(major), &TxId::generate())
    }

    #[test]
    fn anchor_amount_rule() {
        assert_eq!(anchor_amount(Amount::from_major(300)), Amount::from_major(120));
        assert_eq!(anchor_amount(Amount::from_minor(1)), Amount::MINOR_UNIT);
        // 0.4 * 12.34 = 4.936, rounds to 4.94
        assert_eq!(anchor_amount(Amount::from_minor(1234)), Amount::from_minor(494));
        // Shrinks below half for any meaningful amount.
        for minor in [100, 999, 30000] {
            let a = Amount::from_minor(minor);
            assert!(anchor_amount(a).minor() * 2 < a.minor());
        }
    }

    #[test]
    fn balance_sums_unspent_only() {
        let (engine, _store) = engine();
        let wallet = WalletId(1);
        mint(&engine, wallet, 600);
        mint(&engine, wallet, 400);
        assert_eq!(engine.balance(wallet), Amount::from_major(1000));
        engine
            .spend(wallet, Amount::from_major(1000), &TxId::generate())
            .unwrap();
        assert_eq!(engine.balance(wallet), Amount::ZERO);
    }

    #[test]
    fn selection_follows_creation_order() {
        let (engine, _store) = engine();
        let wallet = WalletId(1);
        let first = mint(&engine, wallet, 600);
        mint(&engine, wallet, 400);
        let selected = engine.select(wallet, Amount::from_major(100));
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, first);
    }

    #[test]
    fn spend_returns_change_from_the_last_output() {
        let (engine, store) = engine();
        let wallet = WalletId(1);
        mint(&engine, wallet, 600);
        mint(&engine, wallet, 400);
        let tx = TxId::generate();
        let (change, spent) = engine.spend(wallet, Amount::from_major(700), &tx).unwrap();
        assert_eq!(change, Amount::from_major(300));
        assert_eq!(spent.len(), 2);
        store.read(|t| {
            for id in &spent {
                let utxo = &t.utxos[id];
                assert_eq!(utxo.status, UtxoStatus::Spent);
                assert_eq!(utxo.spent_tx.as_ref(), Some(&tx));
                assert!(utxo.locked_by.is_none());
            }
        });
    }

    #[test]
    fn spend_fails_on_insufficient_outputs_without_mutation() {
        let (engine, store) = engine();
        let wallet = WalletId(1);
        mint(&engine, wallet, 200);
        let err = engine
            .spend(wallet, Amount::from_major(300), &TxId::generate())
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientUtxo { .. }));
        store.read(|t| {
            assert!(t.utxos.values().all(|u| u.status == UtxoStatus::Unspent));
            assert!(t.utxos.values().all(|u| u.locked_by.is_none()));
        });
    }

    #[test]
    fn live_lock_blocks_competing_spender() {
        let (engine, store) = engine();
        let wallet = WalletId(1);
        let id = mint(&engine, wallet, 150);
        let holder = TxId::generate();
        store.write(|t| {
            let u = t.utxos.get_mut(&id).unwrap();
            u.locked_by = Some(holder.clone());
            u.locked_at = Some(Utc::now());
        });
        // A live lock hides the output from selection entirely.
        let err = engine
            .spend(wallet, Amount::from_major(100), &TxId::generate())
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientUtxo { .. }));
        store.read(|t| assert_eq!(t.utxos[&id].locked_by.as_ref(), Some(&holder)));
    }

    #[test]
    fn stale_lock_is_broken() {
        let (engine, store) = engine();
        let wallet = WalletId(1);
        let id = mint(&engine, wallet, 150);
        store.write(|t| {
            let u = t.utxos.get_mut(&id).unwrap();
            u.locked_by = Some(TxId::generate());
            u.locked_at = Some(Utc::now() - TimeDelta::seconds(STALE_LOCK_SECS + 60));
        });
        let tx = TxId::generate();
        let (change, spent) = engine.spend(wallet, Amount::from_major(100), &tx).unwrap();
        assert_eq!(change, Amount::from_major(50));
        assert_eq!(spent, vec![id]);
    }

    #[test]
    fn consume_anchor_prefers_smallest_output() {
        let (engine, store) = engine();
        let wallet = WalletId(1);
        mint(&engine, wallet, 600);
        let small = mint(&engine, wallet, 120);
        let tx = TxId::generate();
        let consumed = engine.consume_anchor(wallet, &tx).unwrap();
        assert_eq!(consumed, Some(small.clone()));
        store.read(|t| {
            assert_eq!(t.utxos[&small].status, UtxoStatus::Spent);
            assert_eq!(t.utxos[&small].spent_tx.as_ref(), Some(&tx));
        });
    }

    #[test]
    fn consume_anchor_without_candidates_returns_none() {
        let (engine, _store) = engine();
        assert_eq!(
            engine.consume_anchor(WalletId(9), &TxId::generate()).unwrap(),
            None
        );
    }
}
