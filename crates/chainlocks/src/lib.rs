//! # Granite ChainLocks
//!
//! Chain-lock finality for the Granite blockchain.
//!
//! A deterministically selected masternode quorum produces a threshold
//! signature (a CLSIG) over a `(height, block hash)` pair. Once such a
//! signature is accepted, the referenced block and all of its ancestors are
//! final: competing branches are invalidated and the active chain is forced
//! to include the locked block. This defeats 51% reorg attacks as long as
//! the quorum itself is honest.
//!
//! ## Data flow
//!
//! ```text
//! peer ──▶ ingest pipeline ──▶ best-lock registry ──▶ enforcer ──▶ chain engine
//!                                                        │
//!                                                        └──▶ NotifyChainLock
//!
//! tip update ──▶ scheduler ──▶ signer ──▶ quorum ──(async)──▶ recovered sig
//!                                                                   │
//!                                    ingest pipeline ◀──────────────┘
//! ```
//!
//! The handler itself performs no BLS math and persists nothing; all state
//! is in memory and re-discovered from peers after a restart. The quorum
//! signing layer, chain engine, peer transport and feature gate are
//! consumed through the traits in [`interfaces`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use granite_chainlocks::{ChainLocksConfig, ChainLocksHandler};
//!
//! let handler = ChainLocksHandler::new(
//!     ChainLocksConfig::default(),
//!     engine,
//!     signing,
//!     network,
//!     gate,
//!     sync_status,
//!     notifier,
//! );
//! handler.start();
//!
//! // validation signals
//! handler.updated_block_tip();
//! handler.accepted_block_header(&block);
//!
//! // peer message dispatch
//! handler.process_message(peer_id, &payload);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod block_txs;
mod enforcer;
pub mod handler;
pub mod interfaces;
pub mod registry;
mod scheduler;
pub mod seen_cache;

// Re-export main types at crate root for convenience
pub use block_txs::BlockTxTracker;
pub use handler::{
    ChainLocksConfig, ChainLocksHandler, CLEANUP_INTERVAL_MS, CLEANUP_SEEN_TIMEOUT_MS,
    MISBEHAVIOR_SCORE_INVALID_CLSIG, TICK_INTERVAL, TX_CLEANUP_CONFIRMATIONS,
    WAIT_FOR_ISLOCK_TIMEOUT_SECS,
};
pub use interfaces::{
    BlockRef, BlockTx, ChainEngine, ChainEngineError, Clock, DiskBlock, EngineResult, FeatureGate,
    Inv, InvKind, PeerId, PeerNetwork, RecoveredSigListener, SigningBackend, SyncStatus,
    SystemClock, TxStatus, ValidationNotifier,
};
pub use registry::{HandlerState, LockRegistry, SignerState};
pub use seen_cache::SeenCache;
