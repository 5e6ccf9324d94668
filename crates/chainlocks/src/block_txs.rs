//! Per-block transaction tracking for the tx-safety signing gate.
//!
//! The signer refuses to propose a tip whose block contains transactions the
//! node has only just learned about; this module keeps the data that gate
//! needs:
//! - `block_txs`: block hash → shared set of that block's non-coinbase
//!   txids. Coinbase-only blocks still get an (empty) entry, so "block seen,
//!   nothing interesting in it" is distinguishable from "block unknown".
//! - `first_seen`: txid → first time the node saw the transaction, in
//!   adjusted unix seconds.
//!
//! Blocks connected before the node started are backfilled from disk on
//! first access, using the block header time as the first-seen stamp.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use granite_types::{BlockHash, Txid};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::interfaces::{BlockTx, ChainEngine};

#[derive(Debug, Default)]
struct TrackerState {
    block_txs: HashMap<BlockHash, Arc<HashSet<Txid>>>,
    first_seen: HashMap<Txid, i64>,
}

/// Tracks per-block txid sets and per-txid first-seen times.
#[derive(Debug, Default)]
pub struct BlockTxTracker {
    state: Mutex<TrackerState>,
}

/// Whether a transaction participates in first-seen tracking.
///
/// Coinbase and input-less transactions cannot conflict with anything, so
/// their age never matters for signing safety.
fn tracked(tx: &BlockTx) -> bool {
    !tx.coinbase && tx.has_inputs
}

impl BlockTxTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a transaction seen in the mempool (`block == None`) or in a
    /// newly connected block.
    ///
    /// The per-block entry is created even for untracked transactions; the
    /// coinbase is what creates the entry for an otherwise empty block.
    pub fn sync_transaction(&self, tx: &BlockTx, block: Option<BlockHash>, now_secs: i64) {
        let mut state = self.state.lock();

        if tracked(tx) {
            state.first_seen.entry(tx.txid).or_insert(now_secs);
        }

        if let Some(block_hash) = block {
            let set = state
                .block_txs
                .entry(block_hash)
                .or_insert_with(|| Arc::new(HashSet::new()));
            if tracked(tx) {
                Arc::make_mut(set).insert(tx.txid);
            }
        }
    }

    /// Returns the tracked txid set for `block_hash`.
    ///
    /// On a miss the block is read from disk, its non-coinbase txids are
    /// cached and their first-seen times backfilled with the block header
    /// time. A disk read failure yields `None` (and caches nothing); the
    /// signing gate treats that as maximally unsafe.
    pub fn block_txs(
        &self,
        block_hash: &BlockHash,
        engine: &dyn ChainEngine,
    ) -> Option<Arc<HashSet<Txid>>> {
        if let Some(set) = self.state.lock().block_txs.get(block_hash) {
            return Some(Arc::clone(set));
        }

        // Only happens for blocks connected before we started listening.
        trace!(block = %block_hash.short_hex(), "block txids not tracked, reading from disk");

        let Some(disk) = engine.read_block_from_disk(block_hash) else {
            debug!(block = %block_hash.short_hex(), "block read failed, txids unknown");
            return None;
        };

        let set: Arc<HashSet<Txid>> = Arc::new(
            disk.txs
                .iter()
                .filter(|tx| tracked(tx))
                .map(|tx| tx.txid)
                .collect(),
        );

        let mut state = self.state.lock();
        for txid in set.iter() {
            state.first_seen.entry(*txid).or_insert(disk.time);
        }
        state
            .block_txs
            .entry(*block_hash)
            .or_insert_with(|| Arc::clone(&set));
        Some(Arc::clone(&set))
    }

    /// First-seen time of `txid`, if known.
    pub fn first_seen(&self, txid: &Txid) -> Option<i64> {
        self.state.lock().first_seen.get(txid).copied()
    }

    /// Whether `txid` has been visible for at least `window_secs`.
    ///
    /// Transactions never seen are unsafe; the window starts at first
    /// sighting.
    pub fn is_tx_safe(&self, txid: &Txid, now_secs: i64, window_secs: i64) -> bool {
        match self.first_seen(txid) {
            Some(first) => now_secs - first >= window_secs,
            None => false,
        }
    }

    /// Snapshot of all tracked blocks and their txid sets.
    pub fn blocks_snapshot(&self) -> Vec<(BlockHash, Arc<HashSet<Txid>>)> {
        self.state
            .lock()
            .block_txs
            .iter()
            .map(|(hash, set)| (*hash, Arc::clone(set)))
            .collect()
    }

    /// Snapshot of all txids with a first-seen time.
    pub fn first_seen_snapshot(&self) -> Vec<Txid> {
        self.state.lock().first_seen.keys().copied().collect()
    }

    /// Drops the entry for `block_hash`. With `forget_txids` the block's
    /// txids are also erased from the first-seen map (the block is locked,
    /// nothing will ever need their age again).
    pub fn remove_block(&self, block_hash: &BlockHash, forget_txids: bool) {
        let mut state = self.state.lock();
        if let Some(set) = state.block_txs.remove(block_hash) {
            if forget_txids {
                for txid in set.iter() {
                    state.first_seen.remove(txid);
                }
            }
        }
    }

    /// Drops the first-seen entry for `txid`.
    pub fn forget_txid(&self, txid: &Txid) {
        self.state.lock().first_seen.remove(txid);
    }

    /// Number of tracked blocks.
    pub fn block_count(&self) -> usize {
        self.state.lock().block_txs.len()
    }

    /// Number of first-seen entries.
    pub fn first_seen_count(&self) -> usize {
        self.state.lock().first_seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::{
        BlockRef, ChainEngineError, DiskBlock, EngineResult, TxStatus,
    };
    use granite_types::H256;

    fn txid(n: u8) -> Txid {
        H256::keccak256(&[n])
    }

    fn plain_tx(n: u8) -> BlockTx {
        BlockTx {
            txid: txid(n),
            coinbase: false,
            has_inputs: true,
        }
    }

    fn coinbase_tx(n: u8) -> BlockTx {
        BlockTx {
            txid: txid(n),
            coinbase: true,
            has_inputs: false,
        }
    }

    /// Engine stub that serves a single block from "disk".
    struct DiskOnly {
        block_hash: BlockHash,
        block: Option<DiskBlock>,
    }

    impl ChainEngine for DiskOnly {
        fn block_by_hash(&self, _hash: &BlockHash) -> Option<BlockRef> {
            None
        }
        fn children_of(&self, _parent: &BlockHash) -> Vec<BlockRef> {
            Vec::new()
        }
        fn tip(&self) -> Option<BlockRef> {
            None
        }
        fn ancestor_at(&self, _block: &BlockRef, _height: i32) -> Option<BlockRef> {
            None
        }
        fn is_on_active_chain(&self, _block: &BlockRef) -> bool {
            false
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
        fn read_block_from_disk(&self, hash: &BlockHash) -> Option<DiskBlock> {
            (*hash == self.block_hash)
                .then(|| self.block.clone())
                .flatten()
        }
        fn tx_status(&self, _txid: &Txid) -> TxStatus {
            TxStatus::NotFound
        }
    }

    #[test]
    fn test_mempool_tx_records_first_seen_only() {
        let tracker = BlockTxTracker::new();
        tracker.sync_transaction(&plain_tx(1), None, 1000);

        assert_eq!(tracker.first_seen(&txid(1)), Some(1000));
        assert_eq!(tracker.block_count(), 0);
    }

    #[test]
    fn test_first_seen_not_overwritten() {
        let tracker = BlockTxTracker::new();
        tracker.sync_transaction(&plain_tx(1), None, 1000);
        tracker.sync_transaction(&plain_tx(1), Some(H256::keccak256(b"b")), 2000);

        assert_eq!(tracker.first_seen(&txid(1)), Some(1000));
    }

    #[test]
    fn test_coinbase_creates_empty_block_entry() {
        let tracker = BlockTxTracker::new();
        let block = H256::keccak256(b"block");
        tracker.sync_transaction(&coinbase_tx(1), Some(block), 1000);

        assert_eq!(tracker.block_count(), 1);
        assert_eq!(tracker.first_seen(&txid(1)), None);

        let engine = DiskOnly {
            block_hash: H256::NIL,
            block: None,
        };
        assert!(tracker.block_txs(&block, &engine).unwrap().is_empty());
    }

    #[test]
    fn test_disk_backfill() {
        let tracker = BlockTxTracker::new();
        let block = H256::keccak256(b"old block");
        let engine = DiskOnly {
            block_hash: block,
            block: Some(DiskBlock {
                time: 777,
                txs: vec![coinbase_tx(0), plain_tx(1), plain_tx(2)],
            }),
        };

        let set = tracker.block_txs(&block, &engine).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&txid(1)));
        assert_eq!(tracker.first_seen(&txid(1)), Some(777));
        assert_eq!(tracker.first_seen(&txid(0)), None);

        // Cached now; a second call must not depend on disk.
        let engine_gone = DiskOnly {
            block_hash: block,
            block: None,
        };
        assert_eq!(tracker.block_txs(&block, &engine_gone).unwrap().len(), 2);
    }

    #[test]
    fn test_disk_failure_yields_none_uncached() {
        let tracker = BlockTxTracker::new();
        let block = H256::keccak256(b"missing");
        let engine = DiskOnly {
            block_hash: H256::NIL,
            block: None,
        };

        assert!(tracker.block_txs(&block, &engine).is_none());
        assert_eq!(tracker.block_count(), 0);
    }

    #[test]
    fn test_tx_safety_window() {
        let tracker = BlockTxTracker::new();
        tracker.sync_transaction(&plain_tx(1), None, 1000);

        assert!(!tracker.is_tx_safe(&txid(1), 1599, 600));
        assert!(tracker.is_tx_safe(&txid(1), 1600, 600));
        // Never seen: unsafe.
        assert!(!tracker.is_tx_safe(&txid(9), 10_000, 600));
    }

    #[test]
    fn test_remove_block_forget_txids() {
        let tracker = BlockTxTracker::new();
        let block = H256::keccak256(b"block");
        tracker.sync_transaction(&plain_tx(1), Some(block), 1000);
        tracker.sync_transaction(&plain_tx(2), None, 1000);

        tracker.remove_block(&block, true);
        assert_eq!(tracker.block_count(), 0);
        assert_eq!(tracker.first_seen(&txid(1)), None);
        // Unrelated mempool tx untouched.
        assert_eq!(tracker.first_seen(&txid(2)), Some(1000));
    }

    #[test]
    fn test_remove_block_keep_txids() {
        let tracker = BlockTxTracker::new();
        let block = H256::keccak256(b"conflicting");
        tracker.sync_transaction(&plain_tx(1), Some(block), 1000);

        tracker.remove_block(&block, false);
        assert_eq!(tracker.block_count(), 0);
        assert_eq!(tracker.first_seen(&txid(1)), Some(1000));
    }
}
