//! External interface contracts consumed by the chain-lock handler.
//!
//! The handler never owns the block index, the peer transport or the quorum
//! signing machinery; it talks to them through the seams defined here:
//! - [`ChainEngine`] - block index, active chain and chain mutation
//! - [`SigningBackend`] / [`RecoveredSigListener`] - threshold signing layer
//! - [`PeerNetwork`] - inventory relay and misbehavior scoring
//! - [`FeatureGate`] - the network-wide chain-lock kill switch
//! - [`SyncStatus`] - initial-block-download status
//! - [`ValidationNotifier`] - outbound chain-lock notifications
//! - [`Clock`] - adjusted time source
//!
//! # Reentrancy
//!
//! Implementations must not call back into the chain-lock handler from
//! inside these methods. Read-only [`ChainEngine`] queries may be invoked
//! while the handler holds its internal mutex; the mutating calls
//! (`activate_best_chain`, `invalidate_block`) are only ever made from the
//! handler's scheduler worker with no handler locks held.

use granite_types::{BlockHash, BlsSignature, QuorumType, RecoveredSig, Txid, H256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Identifier of a connected peer.
pub type PeerId = u64;

/// Errors surfaced by the chain engine's mutating operations.
#[derive(Debug, Error)]
pub enum ChainEngineError {
    /// The referenced block is not in the index.
    #[error("block not found: {0}")]
    BlockNotFound(BlockHash),

    /// `activate_best_chain` failed validation.
    #[error("chain activation failed: {0}")]
    ActivationFailed(String),

    /// `invalidate_block` failed.
    #[error("block invalidation failed: {0}")]
    InvalidationFailed(String),
}

/// Result type for chain engine operations.
pub type EngineResult<T> = Result<T, ChainEngineError>;

/// Stable handle to a block-index entry owned by the chain engine.
///
/// The engine's index arena lives for the whole process, so handles never
/// dangle. `id` identifies the entry; two refs denote the same entry iff
/// their ids match. The height, hash and parent hash are immutable once the
/// entry exists, so they are carried inline to spare repeated lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    /// Stable index-arena id of this entry.
    pub id: u64,
    /// Height of the block.
    pub height: i32,
    /// Hash of the block header.
    pub hash: BlockHash,
    /// Hash of the parent block; nil for genesis.
    pub prev_hash: BlockHash,
}

impl BlockRef {
    /// Whether both refs point at the same index entry.
    #[inline]
    pub fn same_entry(&self, other: &BlockRef) -> bool {
        self.id == other.id
    }
}

/// Inventory kinds the handler announces and answers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvKind {
    /// A chain-lock signature, payload hash = canonical CLSIG hash.
    ChainLock,
}

/// An inventory item relayed through the peer network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Inv {
    /// Kind of the announced object.
    pub kind: InvKind,
    /// Canonical hash of the announced object.
    pub hash: H256,
}

impl Inv {
    /// Inventory item announcing a chain-lock signature.
    pub fn chain_lock(hash: H256) -> Self {
        Self {
            kind: InvKind::ChainLock,
            hash,
        }
    }
}

/// One transaction of a block as read back from disk.
#[derive(Debug, Clone)]
pub struct BlockTx {
    /// Transaction id.
    pub txid: Txid,
    /// Whether this is the coinbase transaction.
    pub coinbase: bool,
    /// Whether the transaction spends any inputs.
    pub has_inputs: bool,
}

/// Block contents needed by the block-tx tracker.
#[derive(Debug, Clone)]
pub struct DiskBlock {
    /// Block header time (unix seconds).
    pub time: i64,
    /// All transactions of the block, coinbase included.
    pub txs: Vec<BlockTx>,
}

/// Where a transaction currently lives, as far as the node can tell.
#[derive(Debug, Clone)]
pub enum TxStatus {
    /// Not in the mempool and not in any known block.
    NotFound,
    /// Sitting in the mempool.
    InMempool,
    /// Confirmed in the referenced block.
    Mined(BlockRef),
}

/// Block index and active-chain operations consumed from the chain engine.
pub trait ChainEngine: Send + Sync {
    /// Looks up a block-index entry by block hash.
    fn block_by_hash(&self, hash: &BlockHash) -> Option<BlockRef>;

    /// All index entries whose parent is `parent` (the prev-hash multimap).
    fn children_of(&self, parent: &BlockHash) -> Vec<BlockRef>;

    /// The active-chain tip, if the chain has one.
    fn tip(&self) -> Option<BlockRef>;

    /// The ancestor of `block` at `height`, walking the parent links.
    ///
    /// Returns `None` when `height` is above the block or below genesis.
    fn ancestor_at(&self, block: &BlockRef, height: i32) -> Option<BlockRef>;

    /// Whether `block` lies on the active chain.
    fn is_on_active_chain(&self, block: &BlockRef) -> bool;

    /// Whether `block` currently carries a validation-failure marker.
    fn is_marked_invalid(&self, block: &BlockRef) -> bool;

    /// Clears failure markers from `block` and its descendants so they can
    /// be reconsidered by activation. Does not force-validate anything.
    fn reset_failure_flags(&self, block: &BlockRef);

    /// Re-evaluates the best chain and switches the active chain to it.
    fn activate_best_chain(&self) -> EngineResult<()>;

    /// Marks `block` invalid, disconnecting it from the active chain if
    /// needed. Does not re-activate; callers decide when to do that.
    fn invalidate_block(&self, block: &BlockRef) -> EngineResult<()>;

    /// Reads full block contents from disk. `None` on read failure.
    fn read_block_from_disk(&self, hash: &BlockHash) -> Option<DiskBlock>;

    /// Resolves where a transaction currently lives.
    fn tx_status(&self, txid: &Txid) -> TxStatus;
}

/// Listener for recovered threshold signatures.
pub trait RecoveredSigListener: Send + Sync {
    /// Called for every recovered signature the signing layer assembles,
    /// whether or not it belongs to this subsystem.
    fn handle_new_recovered_sig(&self, sig: &RecoveredSig);
}

/// Threshold signing operations consumed from the quorum signing layer.
pub trait SigningBackend: Send + Sync {
    /// Verifies a recovered threshold signature against the quorum active
    /// at `height`. Deterministic and side-effect free.
    fn verify_recovered_sig(
        &self,
        quorum_type: QuorumType,
        height: i32,
        request_id: &H256,
        msg_hash: &H256,
        signature: &BlsSignature,
    ) -> bool;

    /// Contributes a partial signature for `(request_id, msg_hash)` if this
    /// node is a member of the responsible quorum. Fire and forget; the
    /// recovered signature, if any, arrives later via the listener.
    fn sign_if_member(&self, quorum_type: QuorumType, request_id: H256, msg_hash: H256);

    /// Registers a listener for recovered signatures.
    fn register_listener(&self, listener: Arc<dyn RecoveredSigListener>);

    /// Unregisters a previously registered listener.
    fn unregister_listener(&self, listener: &Arc<dyn RecoveredSigListener>);
}

/// Peer-network operations consumed from the transport layer.
pub trait PeerNetwork: Send + Sync {
    /// Announces an inventory item to all connected peers.
    fn relay_inv(&self, inv: Inv);

    /// Reports misbehavior for a peer; enough accumulated score bans it.
    fn report_misbehavior(&self, peer: PeerId, score: u32);
}

/// The network-wide chain-lock feature gate ("spork").
pub trait FeatureGate: Send + Sync {
    /// Whether chain-lock signing and message processing are enabled.
    fn chainlocks_active(&self) -> bool;

    /// Whether accepted chain locks are enforced against the local chain.
    fn chainlocks_enforced(&self) -> bool;
}

/// Node-wide sync status.
pub trait SyncStatus: Send + Sync {
    /// Whether initial blockchain sync has completed.
    fn is_blockchain_synced(&self) -> bool;
}

/// Outbound validation signals emitted by the handler.
pub trait ValidationNotifier: Send + Sync {
    /// A block became chain-locked and is on the active chain. Fired at
    /// most once per block, outside all handler locks.
    fn notify_chain_lock(&self, block: &BlockRef);
}

/// Time source used for first-seen stamps and cache eviction.
///
/// Abstracted so tests can drive the safety and eviction windows without
/// sleeping.
pub trait Clock: Send + Sync {
    /// Adjusted unix time in seconds.
    fn unix_seconds(&self) -> i64;

    /// Adjusted unix time in milliseconds.
    fn millis(&self) -> i64;
}

/// [`Clock`] backed by the system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_seconds(&self) -> i64 {
        self.millis() / 1000
    }

    fn millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}
