//! The chain-locks handler.
//!
//! [`ChainLocksHandler`] is the state machine at the center of the
//! subsystem. It ingests CLSIG messages from peers, coordinates local
//! signing attempts on masternodes, reconciles chain locks with the block
//! index when headers arrive out of order, and hands enforcement work to
//! the scheduler worker so chain mutation never happens inside validation
//! signals.
//!
//! ## Ingest pipeline
//!
//! ```text
//! peer / local
//!      │
//!      ▼
//! ┌──────────┐   ┌───────────────┐   ┌────────┐   ┌──────────┐   ┌────────┐
//! │  dedup   │──▶│ height filter │──▶│ verify │──▶│ conflict │──▶│ commit │
//! └──────────┘   └───────────────┘   └────────┘   └──────────┘   └───┬────┘
//!                                                                    │ relay,
//!                                                                    ▼ bind index
//!                                                            schedule enforcement
//! ```
//!
//! Verification is the expensive stage, so the cheap filters run first; the
//! conflict check runs after verification because an unverified message
//! must never displace state or produce a reorg accusation.

use std::sync::{Arc, Weak};
use std::time::Duration;

use granite_types::{
    chain_lock_request_id, BlockHash, ChainLockSig, QuorumType, RecoveredSig, Txid, H256,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::block_txs::BlockTxTracker;
use crate::enforcer::Enforcer;
use crate::interfaces::{
    BlockRef, BlockTx, ChainEngine, Clock, FeatureGate, Inv, InvKind, PeerNetwork, PeerId,
    RecoveredSigListener, SigningBackend, SyncStatus, SystemClock, TxStatus, ValidationNotifier,
};
use crate::registry::HandlerState;
use crate::scheduler::{self, Job};
use crate::seen_cache::SeenCache;

/// Interval of the periodic scheduler tick.
pub const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Minimum spacing between cleanup passes, in milliseconds.
pub const CLEANUP_INTERVAL_MS: i64 = 30_000;

/// Age after which seen CLSIG hashes are evicted, in milliseconds.
pub const CLEANUP_SEEN_TIMEOUT_MS: i64 = 3_600_000;

/// How long a transaction must have been visible before a block containing
/// it is safe to sign, in seconds.
pub const WAIT_FOR_ISLOCK_TIMEOUT_SECS: i64 = 600;

/// Misbehavior score for a peer that relays an invalid CLSIG.
pub const MISBEHAVIOR_SCORE_INVALID_CLSIG: u32 = 10;

/// Confirmations after which a first-seen entry stops mattering.
pub const TX_CLEANUP_CONFIRMATIONS: i32 = 6;

/// Configuration for the chain-locks handler.
#[derive(Debug, Clone)]
pub struct ChainLocksConfig {
    /// Quorum family that signs chain locks.
    pub quorum_type: QuorumType,
    /// Whether this node participates in quorum signing.
    pub masternode_mode: bool,
    /// Periodic tick interval.
    pub tick_interval: Duration,
    /// Minimum spacing between cleanup passes.
    pub cleanup_interval_ms: i64,
    /// Seen-cache eviction age.
    pub seen_timeout_ms: i64,
    /// Tx-safety window for the signing gate.
    pub tx_safety_window_secs: i64,
    /// Misbehavior score charged for invalid CLSIGs.
    pub misbehavior_score: u32,
}

impl Default for ChainLocksConfig {
    fn default() -> Self {
        Self {
            quorum_type: QuorumType(0),
            masternode_mode: false,
            tick_interval: TICK_INTERVAL,
            cleanup_interval_ms: CLEANUP_INTERVAL_MS,
            seen_timeout_ms: CLEANUP_SEEN_TIMEOUT_MS,
            tx_safety_window_secs: WAIT_FOR_ISLOCK_TIMEOUT_SECS,
            misbehavior_score: MISBEHAVIOR_SCORE_INVALID_CLSIG,
        }
    }
}

/// The chain-locks state machine.
///
/// All mutable state sits behind a single mutex; the caches keep their own.
/// Engine mutation (invalidation, activation) and signing attempts only run
/// on the scheduler worker, which serializes them and guarantees no handler
/// lock is held across them.
pub struct ChainLocksHandler {
    config: ChainLocksConfig,
    engine: Arc<dyn ChainEngine>,
    signing: Arc<dyn SigningBackend>,
    network: Arc<dyn PeerNetwork>,
    gate: Arc<dyn FeatureGate>,
    sync_status: Arc<dyn SyncStatus>,
    clock: Arc<dyn Clock>,

    state: Arc<Mutex<HandlerState>>,
    seen: SeenCache,
    block_txs: BlockTxTracker,
    enforcer: Enforcer,

    jobs: mpsc::UnboundedSender<Job>,
    job_rx: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    // Back-reference to hand out `Arc<Self>` for listener registration and
    // the worker task.
    me: Weak<Self>,
}

impl ChainLocksHandler {
    /// Creates a handler wired to the given collaborators, using the system
    /// clock.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ChainLocksConfig,
        engine: Arc<dyn ChainEngine>,
        signing: Arc<dyn SigningBackend>,
        network: Arc<dyn PeerNetwork>,
        gate: Arc<dyn FeatureGate>,
        sync_status: Arc<dyn SyncStatus>,
        notifier: Arc<dyn ValidationNotifier>,
    ) -> Arc<Self> {
        Self::with_clock(
            config,
            engine,
            signing,
            network,
            gate,
            sync_status,
            notifier,
            Arc::new(SystemClock),
        )
    }

    /// Creates a handler with an explicit clock (used by tests to drive the
    /// safety and eviction windows).
    #[allow(clippy::too_many_arguments)]
    pub fn with_clock(
        config: ChainLocksConfig,
        engine: Arc<dyn ChainEngine>,
        signing: Arc<dyn SigningBackend>,
        network: Arc<dyn PeerNetwork>,
        gate: Arc<dyn FeatureGate>,
        sync_status: Arc<dyn SyncStatus>,
        notifier: Arc<dyn ValidationNotifier>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let state = Arc::new(Mutex::new(HandlerState::default()));
        let enforcer = Enforcer::new(Arc::clone(&state), Arc::clone(&engine), notifier);
        let (jobs, job_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|me| Self {
            config,
            engine,
            signing,
            network,
            gate,
            sync_status,
            clock,
            state,
            seen: SeenCache::new(),
            block_txs: BlockTxTracker::new(),
            enforcer,
            jobs,
            job_rx: Mutex::new(Some(job_rx)),
            worker: Mutex::new(None),
            me: me.clone(),
        })
    }

    /// Registers the recovered-signature listener and spawns the scheduler
    /// worker. Must be called from within a tokio runtime.
    pub fn start(&self) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let Some(rx) = self.job_rx.lock().take() else {
            return; // already started
        };
        let listener: Arc<dyn RecoveredSigListener> = me.clone() as Arc<dyn RecoveredSigListener>;
        self.signing.register_listener(listener);
        let handle = scheduler::spawn(me, rx, self.config.tick_interval);
        *self.worker.lock() = Some(handle);
    }

    /// Unregisters the listener and stops the scheduler worker. In-flight
    /// scheduled work completes; later enforcement becomes a no-op once the
    /// feature gate reads off.
    pub fn stop(&self) {
        if let Some(me) = self.me.upgrade() {
            let listener: Arc<dyn RecoveredSigListener> = me;
            self.signing.unregister_listener(&listener);
        }
        let _ = self.jobs.send(Job::Shutdown);
        self.worker.lock().take();
    }

    // ------------------------------------------------------------------
    // Ingest (C4)
    // ------------------------------------------------------------------

    /// Handles a raw CLSIG network message from `peer`.
    ///
    /// All CLSIG traffic is dropped while the feature gate is off.
    pub fn process_message(&self, peer: PeerId, payload: &[u8]) {
        if !self.gate.chainlocks_active() {
            trace!(peer, "chain locks disabled, dropping CLSIG message");
            return;
        }
        let clsig = match ChainLockSig::rlp_decode(payload) {
            Ok(clsig) => clsig,
            Err(err) => {
                warn!(peer, %err, "undecodable CLSIG message");
                self.network
                    .report_misbehavior(peer, self.config.misbehavior_score);
                return;
            }
        };
        let hash = clsig.hash();
        self.process_new_chain_lock(Some(peer), clsig, hash);
    }

    /// Runs a CLSIG through the ingest pipeline.
    ///
    /// `from` is `None` for locally assembled chain locks; `hash` must be
    /// the canonical hash of `clsig`.
    pub fn process_new_chain_lock(&self, from: Option<PeerId>, clsig: ChainLockSig, hash: H256) {
        // Stage 1: dedup. Each hash is processed at most once per eviction
        // window, whatever its fate.
        if !self.seen.observe(hash, self.clock.millis()) {
            return;
        }

        // Stage 2: height filter. Strictly older locks are dropped here; a
        // same-height lock for a *different* block falls through so the
        // post-verification conflict check can log the reorg attempt.
        {
            let state = self.state.lock();
            let best = &state.registry.best;
            if !best.is_null()
                && (clsig.height < best.height
                    || (clsig.height == best.height && clsig.block_hash == best.block_hash))
            {
                trace!(clsig = %clsig, "not better than the current chain lock");
                return;
            }
        }

        // Stage 3: threshold verification, the expensive part. No locks
        // held.
        let request_id = chain_lock_request_id(clsig.height);
        let msg_hash = clsig.block_hash;
        if !self.signing.verify_recovered_sig(
            self.config.quorum_type,
            clsig.height,
            &request_id,
            &msg_hash,
            &clsig.signature,
        ) {
            warn!(clsig = %clsig, peer = ?from, "invalid CLSIG");
            if let Some(peer) = from {
                self.network
                    .report_misbehavior(peer, self.config.misbehavior_score);
            }
            return;
        }

        // Stages 4 and 5 under the state mutex.
        {
            let mut state = self.state.lock();
            let enforced = state.enforced;

            // A verified lock still must not rewrite an existing one: not
            // at its own height, and not at any ancestor height below the
            // enforced lock.
            let conflicts = (!state.registry.best.is_null()
                && clsig.height == state.registry.best.height
                && clsig.block_hash != state.registry.best.block_hash)
                || state.registry.has_conflicting_chain_lock(
                    enforced,
                    clsig.height,
                    &clsig.block_hash,
                    self.engine.as_ref(),
                );
            if conflicts {
                // A quorum signing two branches means a large part of the
                // masternode network is compromised; refuse the reorg.
                warn!(
                    new = %clsig,
                    best = %state.registry.best,
                    peer = ?from,
                    "new chain lock tries to reorg previous chain lock"
                );
                return;
            }

            // Stage 5: commit and relay.
            state.registry.best_hash = hash;
            state.registry.best = clsig.clone();
            self.network.relay_inv(Inv::chain_lock(hash));

            match self.engine.block_by_hash(&clsig.block_hash) {
                None => {
                    // Header not here yet; the late-header path binds it.
                    debug!(clsig = %clsig, "block unknown, deferring index binding");
                }
                Some(block) if block.height != clsig.height => {
                    warn!(
                        clsig = %clsig,
                        block_height = block.height,
                        "chain lock height does not match the block's height"
                    );
                    return;
                }
                Some(block) => {
                    state.registry.best_known_block = state.registry.best.clone();
                    state.registry.best_block = Some(block);
                }
            }
        }

        // Stage 6: enforcement runs on the worker, outside this call stack.
        let _ = self.jobs.send(Job::Enforce);
        debug!(clsig = %clsig, peer = ?from, "processed new chain lock");
    }

    /// Binds the best lock to a block-index entry that arrived after the
    /// CLSIG did.
    pub fn accepted_block_header(&self, block: &BlockRef) {
        let mut state = self.state.lock();
        if state.registry.best.is_null() || block.hash != state.registry.best.block_hash {
            return;
        }

        info!(block = %block.hash, "chain-locked block header came in late");

        if state.registry.best.height != block.height {
            warn!(
                clsig = %state.registry.best,
                block_height = block.height,
                "chain lock height does not match the block's height"
            );
            return;
        }

        // Enforcement may still only invalidate competitors for now: the
        // header alone cannot be activated until the block data arrives.
        state.registry.best_known_block = state.registry.best.clone();
        state.registry.best_block = Some(*block);
    }

    /// Signals that the active-chain tip changed.
    ///
    /// The actual signing attempt runs on the worker; redundant signals
    /// while one is pending collapse into that single run.
    pub fn updated_block_tip(&self) {
        {
            let mut state = self.state.lock();
            if state.try_sign_scheduled {
                return;
            }
            state.try_sign_scheduled = true;
        }
        let _ = self.jobs.send(Job::TipUpdated);
    }

    pub(crate) fn clear_tip_signal(&self) {
        self.state.lock().try_sign_scheduled = false;
    }

    // ------------------------------------------------------------------
    // Signer (C5)
    // ------------------------------------------------------------------

    /// Proposes the current tip for quorum signing, if it is safe to do so.
    ///
    /// Runs on the worker. Also drives the periodic cleanup pass so that
    /// non-masternodes evict stale state too.
    pub fn try_sign_chain_tip(&self) {
        self.cleanup();

        if !self.config.masternode_mode {
            return;
        }
        if !self.sync_status.is_blockchain_synced() {
            return;
        }

        let Some(tip) = self.engine.tip() else {
            return;
        };
        if tip.prev_hash.is_nil() {
            return;
        }

        {
            let state = self.state.lock();
            if !state.spork_active {
                return;
            }
            if tip.height == state.signer.last_signed_height {
                // Already proposed this one.
                return;
            }
            if state.registry.best.height >= tip.height {
                // Already got the same lock or a better one.
                return;
            }
            if state.registry.has_conflicting_chain_lock(
                state.enforced,
                tip.height,
                &tip.hash,
                self.engine.as_ref(),
            ) {
                // Enforcement will move us off this tip; don't sign it.
                return;
            }
        }

        // Every transaction in the tip must have been around long enough to
        // have settled against instant-send locks. An unreadable block is
        // treated as maximally unsafe.
        let Some(txs) = self.block_txs.block_txs(&tip.hash, self.engine.as_ref()) else {
            debug!(block = %tip.hash, "tip block txids unavailable, not signing");
            return;
        };
        for txid in txs.iter() {
            if !self.is_tx_safe_for_mining(txid) {
                debug!(block = %tip.hash, tx = %txid.short_hex(), "tip has unsafe tx, not signing");
                return;
            }
        }

        debug!(block = %tip.hash, height = tip.height, "trying to sign chain tip");

        let request_id = chain_lock_request_id(tip.height);
        let msg_hash = tip.hash;
        {
            let mut state = self.state.lock();
            if state.registry.best.height >= tip.height {
                // A better lock arrived while no lock was held above.
                return;
            }
            state.signer.last_signed_height = tip.height;
            state.signer.last_signed_request_id = request_id;
            state.signer.last_signed_msg_hash = msg_hash;
        }
        self.signing
            .sign_if_member(self.config.quorum_type, request_id, msg_hash);
    }

    // ------------------------------------------------------------------
    // Block-tx tracking (C2 surface)
    // ------------------------------------------------------------------

    /// Records a transaction accepted to the mempool (`block == None`) or
    /// connected in a block.
    pub fn sync_transaction(&self, tx: &BlockTx, block: Option<&BlockRef>) {
        if !self.sync_status.is_blockchain_synced() {
            return;
        }
        self.block_txs
            .sync_transaction(tx, block.map(|b| b.hash), self.clock.unix_seconds());
    }

    /// Whether a block containing `txid` is currently safe to propose.
    ///
    /// Always true while the feature gate is off.
    pub fn is_tx_safe_for_mining(&self, txid: &Txid) -> bool {
        if !self.state.lock().spork_active {
            return true;
        }
        self.block_txs.is_tx_safe(
            txid,
            self.clock.unix_seconds(),
            self.config.tx_safety_window_secs,
        )
    }

    // ------------------------------------------------------------------
    // Enforcement and active state (C6, §4.7)
    // ------------------------------------------------------------------

    /// Enforces the best known chain lock against the local chain.
    ///
    /// Must not be called from validation signals or with handler locks
    /// held; the scheduler worker is the intended caller.
    pub fn enforce_best_chain_lock(&self) {
        self.enforcer.enforce();
    }

    /// Re-reads the feature gate and resets the registry when enforcement
    /// flips. Seen hashes and tracked txs are left for cleanup to age out.
    pub fn check_active_state(&self) {
        let active = self.gate.chainlocks_active();
        let enforced = self.gate.chainlocks_enforced();

        let mut state = self.state.lock();
        let old_enforced = state.enforced;
        state.spork_active = active;
        state.enforced = enforced;
        if old_enforced != enforced {
            info!(enforced, "chain-lock enforcement changed, resetting best lock");
            state.registry.reset();
            state.signer.reset();
        }
    }

    // ------------------------------------------------------------------
    // Cleanup (C7)
    // ------------------------------------------------------------------

    fn cleanup(&self) {
        if !self.sync_status.is_blockchain_synced() {
            return;
        }
        {
            let state = self.state.lock();
            if self.clock.millis() - state.last_cleanup_ms < self.config.cleanup_interval_ms {
                return;
            }
        }

        self.seen
            .evict_older_than(self.clock.millis() - self.config.seen_timeout_ms);

        // Locked blocks are final: their txids never need age checks again.
        // Blocks that conflict with the lock are dead, but their txs may
        // reappear elsewhere, so only the block entry goes.
        for (block_hash, _) in self.block_txs.blocks_snapshot() {
            let Some(block) = self.engine.block_by_hash(&block_hash) else {
                continue;
            };
            let (locked, conflicting) = {
                let state = self.state.lock();
                (
                    state.registry.has_chain_lock(
                        state.enforced,
                        block.height,
                        &block.hash,
                        self.engine.as_ref(),
                    ),
                    state.registry.has_conflicting_chain_lock(
                        state.enforced,
                        block.height,
                        &block.hash,
                        self.engine.as_ref(),
                    ),
                )
            };
            if locked {
                self.block_txs.remove_block(&block_hash, true);
            } else if conflicting {
                self.block_txs.remove_block(&block_hash, false);
            }
        }

        // Age out first-seen entries for txs that vanished or got buried.
        let tip = self.engine.tip();
        for txid in self.block_txs.first_seen_snapshot() {
            match self.engine.tx_status(&txid) {
                TxStatus::NotFound => {
                    // Vanished, probably due to conflicts.
                    self.block_txs.forget_txid(&txid);
                }
                TxStatus::Mined(block) => {
                    let buried = tip.as_ref().is_some_and(|tip| {
                        tip.height - block.height >= TX_CLEANUP_CONFIRMATIONS
                            && self
                                .engine
                                .ancestor_at(tip, block.height)
                                .is_some_and(|a| a.same_entry(&block))
                    });
                    if buried {
                        self.block_txs.forget_txid(&txid);
                    }
                }
                TxStatus::InMempool => {}
            }
        }

        self.state.lock().last_cleanup_ms = self.clock.millis();
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Whether the block at `(height, hash)` is chain-locked.
    pub fn has_chain_lock(&self, height: i32, hash: &BlockHash) -> bool {
        let state = self.state.lock();
        state
            .registry
            .has_chain_lock(state.enforced, height, hash, self.engine.as_ref())
    }

    /// Whether the block at `(height, hash)` conflicts with the chain lock.
    pub fn has_conflicting_chain_lock(&self, height: i32, hash: &BlockHash) -> bool {
        let state = self.state.lock();
        state
            .registry
            .has_conflicting_chain_lock(state.enforced, height, hash, self.engine.as_ref())
    }

    /// Returns the best chain lock if `hash` is its canonical hash.
    ///
    /// Only the best lock is propagated; older ones are ditched.
    pub fn chain_lock_by_hash(&self, hash: &H256) -> Option<ChainLockSig> {
        let state = self.state.lock();
        if state.registry.best.is_null() || *hash != state.registry.best_hash {
            return None;
        }
        Some(state.registry.best.clone())
    }

    /// The best chain lock seen so far (the null lock if none).
    pub fn best_chain_lock(&self) -> ChainLockSig {
        self.state.lock().registry.best.clone()
    }

    /// Inventory-level dedup: covers accepted, stale and rejected CLSIGs
    /// alike, so none of them is ever re-fetched.
    pub fn already_have(&self, inv: &Inv) -> bool {
        match inv.kind {
            InvKind::ChainLock => self.seen.contains(&inv.hash),
        }
    }
}

impl RecoveredSigListener for ChainLocksHandler {
    /// Assembles and ingests a CLSIG once the quorum recovers the signature
    /// this node asked for. Signatures for other subsystems fail the
    /// request-id match and are dropped silently.
    fn handle_new_recovered_sig(&self, sig: &RecoveredSig) {
        let clsig = {
            let state = self.state.lock();
            if !state.spork_active {
                return;
            }
            if sig.request_id != state.signer.last_signed_request_id
                || sig.msg_hash != state.signer.last_signed_msg_hash
            {
                // Not what we signed; belongs to someone else.
                return;
            }
            if state.registry.best.height >= state.signer.last_signed_height {
                // The CLSIG message beat the recovery callback.
                return;
            }
            ChainLockSig::new(
                state.signer.last_signed_height,
                state.signer.last_signed_msg_hash,
                sig.signature,
            )
        };
        let hash = clsig.hash();
        self.process_new_chain_lock(None, clsig, hash);
    }
}
