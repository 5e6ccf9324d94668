//! Best chain-lock registry and signer state.
//!
//! Plain data guarded by the handler's mutex; no interior locking here.
//! Callers hold the lock, mutate through these types and keep the
//! invariants:
//!
//! 1. `best.height >= best_known_block.height` always.
//! 2. If `best_block` is set, its height and hash equal
//!    `best_known_block`'s.
//! 3. No two chain locks with the same height and differing block hash ever
//!    coexist here; the second is rejected as a conflict before commit.
//! 4. Once a lock for height H is committed, nothing at height <= H is
//!    ever committed again.
//! 5. `best_hash` is the canonical hash of exactly `best`.

use granite_types::{BlockHash, ChainLockSig, H256, NULL_HEIGHT};

use crate::interfaces::{BlockRef, ChainEngine};

/// The best chain lock known to this node and its block-index bindings.
#[derive(Debug, Default)]
pub struct LockRegistry {
    /// Best chain lock seen so far, by height. Null lock initially.
    pub best: ChainLockSig,
    /// Canonical hash of `best`.
    pub best_hash: H256,
    /// Best chain lock whose referenced block is known locally. May lag
    /// `best` while the block or header is still in flight.
    pub best_known_block: ChainLockSig,
    /// Index entry for `best_known_block`'s block; the engine owns the
    /// entry, this is only a handle.
    pub best_block: Option<BlockRef>,
    /// Last block a chain-lock notification was emitted for.
    pub last_notified: Option<BlockRef>,
}

impl LockRegistry {
    /// Restores the initial sentinel state.
    pub fn reset(&mut self) {
        self.best = ChainLockSig::default();
        self.best_hash = H256::NIL;
        self.best_known_block = ChainLockSig::default();
        self.best_block = None;
        self.last_notified = None;
    }

    /// Locks-held predicate: is the block at `(height, hash)` chain-locked,
    /// either directly or as an ancestor of the locked block?
    pub fn has_chain_lock(
        &self,
        enforced: bool,
        height: i32,
        hash: &BlockHash,
        engine: &dyn ChainEngine,
    ) -> bool {
        if !enforced {
            return false;
        }
        let Some(target) = self.best_block else {
            return false;
        };
        if height > target.height {
            return false;
        }
        if height == target.height {
            return *hash == target.hash;
        }
        match engine.ancestor_at(&target, height) {
            Some(ancestor) => ancestor.hash == *hash,
            None => false,
        }
    }

    /// Locks-held predicate: does the block at `(height, hash)` conflict
    /// with the current chain lock?
    ///
    /// Conflict is only meaningful at or below the lock height; above it
    /// this returns false.
    pub fn has_conflicting_chain_lock(
        &self,
        enforced: bool,
        height: i32,
        hash: &BlockHash,
        engine: &dyn ChainEngine,
    ) -> bool {
        if !enforced {
            return false;
        }
        let Some(target) = self.best_block else {
            return false;
        };
        if height > target.height {
            return false;
        }
        if height == target.height {
            return *hash != target.hash;
        }
        match engine.ancestor_at(&target, height) {
            Some(ancestor) => ancestor.hash != *hash,
            None => false,
        }
    }
}

/// The in-flight signing proposal, if any.
#[derive(Debug)]
pub struct SignerState {
    /// Height of the last tip this node proposed for signing.
    pub last_signed_height: i32,
    /// Request id bound to that proposal.
    pub last_signed_request_id: H256,
    /// Message hash (block hash) bound to that proposal.
    pub last_signed_msg_hash: H256,
}

impl Default for SignerState {
    fn default() -> Self {
        Self {
            last_signed_height: NULL_HEIGHT,
            last_signed_request_id: H256::NIL,
            last_signed_msg_hash: H256::NIL,
        }
    }
}

impl SignerState {
    /// Clears the pending proposal.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Everything guarded by the handler's single mutex.
#[derive(Debug, Default)]
pub struct HandlerState {
    /// Best-lock registry.
    pub registry: LockRegistry,
    /// Pending signing proposal.
    pub signer: SignerState,
    /// Collapses redundant tip-update wakeups into one scheduled run.
    pub try_sign_scheduled: bool,
    /// Cached feature-gate state: signing/processing enabled.
    pub spork_active: bool,
    /// Cached feature-gate state: enforcement enabled.
    pub enforced: bool,
    /// Time of the last cleanup pass, in milliseconds.
    pub last_cleanup_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::{
        ChainEngineError, DiskBlock, EngineResult, TxStatus,
    };
    use granite_types::Txid;

    /// Two-deep chain for ancestor queries: parent (h=1) <- child (h=2).
    struct TwoBlocks {
        parent: BlockRef,
        child: BlockRef,
    }

    impl TwoBlocks {
        fn new() -> Self {
            let parent_hash = H256::keccak256(b"parent");
            let child_hash = H256::keccak256(b"child");
            Self {
                parent: BlockRef {
                    id: 1,
                    height: 1,
                    hash: parent_hash,
                    prev_hash: H256::NIL,
                },
                child: BlockRef {
                    id: 2,
                    height: 2,
                    hash: child_hash,
                    prev_hash: parent_hash,
                },
            }
        }
    }

    impl ChainEngine for TwoBlocks {
        fn block_by_hash(&self, hash: &BlockHash) -> Option<BlockRef> {
            [self.parent, self.child].into_iter().find(|b| b.hash == *hash)
        }
        fn children_of(&self, parent: &BlockHash) -> Vec<BlockRef> {
            [self.parent, self.child]
                .into_iter()
                .filter(|b| b.prev_hash == *parent)
                .collect()
        }
        fn tip(&self) -> Option<BlockRef> {
            Some(self.child)
        }
        fn ancestor_at(&self, block: &BlockRef, height: i32) -> Option<BlockRef> {
            if height > block.height || height < 1 {
                return None;
            }
            [self.parent, self.child]
                .into_iter()
                .find(|b| b.height == height)
        }
        fn is_on_active_chain(&self, _block: &BlockRef) -> bool {
            true
        }
        fn is_marked_invalid(&self, _block: &BlockRef) -> bool {
            false
        }
        fn reset_failure_flags(&self, _block: &BlockRef) {}
        fn activate_best_chain(&self) -> EngineResult<()> {
            Ok(())
        }
        fn invalidate_block(&self, block: &BlockRef) -> EngineResult<()> {
            Err(ChainEngineError::BlockNotFound(block.hash))
        }
        fn read_block_from_disk(&self, _hash: &BlockHash) -> Option<DiskBlock> {
            None
        }
        fn tx_status(&self, _txid: &Txid) -> TxStatus {
            TxStatus::NotFound
        }
    }

    fn locked_registry(engine: &TwoBlocks) -> LockRegistry {
        let mut registry = LockRegistry::default();
        let clsig = ChainLockSig::new(2, engine.child.hash, Default::default());
        registry.best_hash = clsig.hash();
        registry.best = clsig.clone();
        registry.best_known_block = clsig;
        registry.best_block = Some(engine.child);
        registry
    }

    #[test]
    fn test_predicates_false_when_unenforced() {
        let engine = TwoBlocks::new();
        let registry = locked_registry(&engine);
        assert!(!registry.has_chain_lock(false, 2, &engine.child.hash, &engine));
        assert!(!registry.has_conflicting_chain_lock(false, 2, &H256::NIL, &engine));
    }

    #[test]
    fn test_predicates_false_without_known_block() {
        let engine = TwoBlocks::new();
        let registry = LockRegistry::default();
        assert!(!registry.has_chain_lock(true, 2, &engine.child.hash, &engine));
        assert!(!registry.has_conflicting_chain_lock(true, 2, &engine.child.hash, &engine));
    }

    #[test]
    fn test_lock_at_target_height() {
        let engine = TwoBlocks::new();
        let registry = locked_registry(&engine);
        let other = H256::keccak256(b"other");

        assert!(registry.has_chain_lock(true, 2, &engine.child.hash, &engine));
        assert!(!registry.has_chain_lock(true, 2, &other, &engine));
        assert!(registry.has_conflicting_chain_lock(true, 2, &other, &engine));
        assert!(!registry.has_conflicting_chain_lock(true, 2, &engine.child.hash, &engine));
    }

    #[test]
    fn test_lock_covers_ancestors() {
        let engine = TwoBlocks::new();
        let registry = locked_registry(&engine);
        let other = H256::keccak256(b"other");

        assert!(registry.has_chain_lock(true, 1, &engine.parent.hash, &engine));
        assert!(registry.has_conflicting_chain_lock(true, 1, &other, &engine));
    }

    #[test]
    fn test_above_lock_height_neither_locked_nor_conflicting() {
        let engine = TwoBlocks::new();
        let registry = locked_registry(&engine);
        let future = H256::keccak256(b"future");

        assert!(!registry.has_chain_lock(true, 3, &future, &engine));
        assert!(!registry.has_conflicting_chain_lock(true, 3, &future, &engine));
    }

    #[test]
    fn test_reset_restores_sentinels() {
        let engine = TwoBlocks::new();
        let mut registry = locked_registry(&engine);
        registry.last_notified = Some(engine.child);

        registry.reset();
        assert!(registry.best.is_null());
        assert!(registry.best_hash.is_nil());
        assert!(registry.best_known_block.is_null());
        assert!(registry.best_block.is_none());
        assert!(registry.last_notified.is_none());
    }
}
