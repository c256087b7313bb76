//! # cbdc-node
//!
//! Simulation core of a central-bank digital currency platform: a
//! single-leader replicated log with UTXO state, fork-resolvable chain
//! storage and at-most-once offline-spend reconciliation.
//!
//! One designated node (the central authority) is the permanent leader; a
//! bounded set of financial-organisation peers follows it, electing a
//! temporary leader only while the authority is down and surrendering
//! leadership on recovery.
//!
//! ## Modules
//! - [`configuration`]: typed settings, file/env sources, validation.
//! - [`crypto`]: hash and sign/verify oracle.
//! - [`store`]: per-node transactional tables and the peer-store seam.
//! - [`ledger`]: block engine: genesis, sealing, Merkle, chain validation.
//! - [`utxo`]: unspent-output selection, locking, spending, offline anchors.
//! - [`consensus`]: authority-pinned replicated log and leader failover.
//! - [`registry`]: active peer set and per-node status.
//! - [`network`]: block broadcast and peer catch-up sync.
//! - [`fork`]: common-ancestor search, chain selection, atomic switch.
//! - [`node`]: per-node context object and the submission surface.
//!
//! ## Usage
//! ```rust,no_run
//! use cbdc_node::node::{Node, TransferRequest};
//! use cbdc_node::registry::{NodeId, NodeRole};
//! use cbdc_node::store::{Channel, PeerDirectory};
//! use cbdc_node::amount::Amount;
//!
//! # async fn demo() -> cbdc_node::error::Result<()> {
//! let peers = PeerDirectory::new();
//! let cbr = Node::new(NodeId::from("CBR_0"), "Central Bank", NodeRole::Authority, peers.clone());
//! let alice = cbr.open_wallet(1);
//! let bob = cbr.open_wallet(1);
//! cbr.issue(alice, Amount::from_major(1000)).await?;
//! cbr.submit_transaction(&TransferRequest {
//!     sender: alice,
//!     receiver: bob,
//!     amount: Amount::from_major(300),
//!     channel: Channel::C2C,
//!     bank_id: None,
//!     notes: None,
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

pub mod amount;
pub mod clock;
pub mod configuration;
pub mod consensus;
pub mod crypto;
pub mod error;
pub mod fork;
pub mod ledger;
pub mod network;
pub mod node;
pub mod registry;
pub mod store;
pub mod utxo;

pub use crate::amount::Amount;
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::node::{Node, OfflineSyncReport, TransferRequest};
pub use crate::registry::{NodeId, NodeRole};
pub use crate::store::PeerDirectory;
