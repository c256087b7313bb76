//! Error taxonomy for the ledger core.
//!
//! Submission-path failures surface to the caller unchanged and are also
//! recorded in the failed-transaction and system-error tables; the
//! [`ErrorKind`] tag is what those records carry.

use crate::amount::Amount;
use crate::store::{UtxoId, WalletId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Core error type. Lower-level failures are mapped into one of these
/// variants before bubbling up to callers.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    #[error("amount must be positive")]
    InvalidAmount,

    #[error("sender and receiver wallets must differ")]
    SelfTransfer,

    #[error("unknown wallet {0}")]
    UnknownWallet(WalletId),

    #[error("wallet {0} is not open")]
    WalletNotOpen(WalletId),

    #[error("offline wallet {0} is not active")]
    OfflineWalletClosed(WalletId),

    #[error("insufficient funds: available {available}, required {required}")]
    InsufficientFunds {
        available: Amount,
        required: Amount,
    },

    #[error("insufficient unspent outputs: available {available}, required {required}")]
    InsufficientUtxo {
        available: Amount,
        required: Amount,
    },

    #[error("insufficient offline balance: available {available}, required {required}")]
    InsufficientOffline {
        available: Amount,
        required: Amount,
    },

    #[error("utxo {0} is locked by another transaction")]
    UtxoLocked(UtxoId),

    #[error("double spend suspected on utxo {0}")]
    DoubleSpendSuspected(UtxoId),

    #[error("cannot seal a block without transactions")]
    EmptyBlock,

    #[error("consensus unavailable: {0}")]
    ConsensusUnavailable(String),

    #[error("stale term {leader_term}, current term is {current_term}")]
    StaleTerm {
        leader_term: u64,
        current_term: u64,
    },

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("storage conflict: {0}")]
    Storage(String),

    #[error("peer {peer} unreachable: {reason}")]
    PeerUnreachable { peer: String, reason: String },

    #[error("unrecoverable invariant violation: {0}")]
    Fatal(String),
}

/// Surface classification recorded alongside every failed submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidInput,
    StateConflict,
    Consensus,
    Integrity,
    Storage,
    Network,
    Fatal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidAmount | Error::SelfTransfer | Error::UnknownWallet(_) => {
                ErrorKind::InvalidInput
            }
            Error::WalletNotOpen(_)
            | Error::OfflineWalletClosed(_)
            | Error::InsufficientFunds { .. }
            | Error::InsufficientUtxo { .. }
            | Error::InsufficientOffline { .. }
            | Error::UtxoLocked(_)
            | Error::DoubleSpendSuspected(_)
            | Error::EmptyBlock => ErrorKind::StateConflict,
            Error::ConsensusUnavailable(_) | Error::StaleTerm { .. } => ErrorKind::Consensus,
            Error::Integrity(_) => ErrorKind::Integrity,
            Error::Storage(_) => ErrorKind::Storage,
            Error::PeerUnreachable { .. } => ErrorKind::Network,
            Error::Fatal(_) => ErrorKind::Fatal,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ErrorKind::InvalidInput => "INVALID_INPUT",
            ErrorKind::StateConflict => "STATE_CONFLICT",
            ErrorKind::Consensus => "CONSENSUS",
            ErrorKind::Integrity => "INTEGRITY",
            ErrorKind::Storage => "STORAGE",
            ErrorKind::Network => "NETWORK",
            ErrorKind::Fatal => "FATAL",
        };
        f.write_str(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_their_surface_kind() {
        assert_eq!(Error::InvalidAmount.kind(), ErrorKind::InvalidInput);
        assert_eq!(
            Error::InsufficientFunds {
                available: Amount::ZERO,
                required: Amount::from_major(1),
            }
            .kind(),
            ErrorKind::StateConflict
        );
        assert_eq!(
            Error::StaleTerm {
                leader_term: 1,
                current_term: 2
            }
            .kind(),
            ErrorKind::Consensus
        );
        assert_eq!(ErrorKind::StateConflict.to_string(), "STATE_CONFLICT");
    }
}
