//! Chain-lock enforcement against the local block tree.
//!
//! Enforcement makes the locked block win: every sibling branch competing
//! with the chain referenced by the best known lock is invalidated, the
//! active chain is re-activated onto the locked branch if needed, and a
//! one-shot notification fires once the locked block is actually on the
//! active chain.
//!
//! Enforcement runs only on the scheduler worker, never from validation
//! signals, and never with the handler mutex held across engine mutation.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::interfaces::{BlockRef, ChainEngine, ValidationNotifier};
use crate::registry::HandlerState;

/// Walks the block tree to force the active chain onto the locked branch.
pub(crate) struct Enforcer {
    state: Arc<Mutex<HandlerState>>,
    engine: Arc<dyn ChainEngine>,
    notifier: Arc<dyn ValidationNotifier>,
}

impl Enforcer {
    pub(crate) fn new(
        state: Arc<Mutex<HandlerState>>,
        engine: Arc<dyn ChainEngine>,
        notifier: Arc<dyn ValidationNotifier>,
    ) -> Self {
        Self {
            state,
            engine,
            notifier,
        }
    }

    /// Enforces the best known chain lock.
    ///
    /// No-op while enforcement is gated off or the locked block is not yet
    /// in the local index.
    pub(crate) fn enforce(&self) {
        let (clsig, target) = {
            let state = self.state.lock();
            if !state.enforced {
                return;
            }
            let Some(target) = state.registry.best_block else {
                // Neither header nor block yet; nothing to enforce.
                return;
            };
            (state.registry.best_known_block.clone(), target)
        };

        // Walk backwards from the locked block until we reach the active
        // chain. Every step that is still off-chain has its competing
        // sibling branches invalidated.
        let mut cursor = Some(target);
        while let Some(block) = cursor {
            if self.engine.is_on_active_chain(&block) {
                break;
            }
            for sibling in self.engine.children_of(&block.prev_hash) {
                if sibling.same_entry(&block) {
                    continue;
                }
                info!(
                    clsig = %clsig,
                    block = %sibling.hash,
                    height = sibling.height,
                    "chain lock invalidates competing block"
                );
                self.invalidate_block(&sibling, false);
            }
            cursor = self.engine.block_by_hash(&block.prev_hash);
        }

        // The locked block may sit on a branch that was dismissed earlier;
        // clearing its failure flags causes re-validation, not acceptance.
        if self.engine.is_marked_invalid(&target) {
            debug!(block = %target.hash, "clearing failure flags on locked block");
            self.engine.reset_failure_flags(&target);
        }

        if !self.target_is_active(&target) {
            if let Err(err) = self.engine.activate_best_chain() {
                // Not fatal: the periodic tick will enforce again.
                warn!(%err, "activate_best_chain failed, will retry");
            }
        }

        // Notify exactly once per locked block, and only once the block is
        // really part of the active chain.
        let notify = {
            let mut state = self.state.lock();
            let already = state
                .registry
                .last_notified
                .is_some_and(|b| b.same_entry(&target));
            if !already && self.target_is_active(&target) {
                state.registry.last_notified = Some(target);
                true
            } else {
                false
            }
        };
        if notify {
            self.notifier.notify_chain_lock(&target);
        }
    }

    /// Whether the active chain contains `target` at its height.
    fn target_is_active(&self, target: &BlockRef) -> bool {
        self.engine
            .tip()
            .and_then(|tip| self.engine.ancestor_at(&tip, target.height))
            .is_some_and(|ancestor| ancestor.same_entry(target))
    }

    /// Invalidates a block that competes with a verified chain lock.
    ///
    /// Failure here means the chain state can no longer be made consistent
    /// with a signature the quorum already finalized; continuing would leave
    /// the node following a forbidden branch, so the process terminates.
    fn invalidate_block(&self, block: &BlockRef, activate: bool) {
        if let Err(err) = self.engine.invalidate_block(block) {
            error!(
                block = %block.hash,
                %err,
                "invalidate_block failed, chain state inconsistent with verified chain lock"
            );
            panic!("chain-lock enforcement: invalidate_block failed for {}: {err}", block.hash);
        }
        if activate {
            if let Err(err) = self.engine.activate_best_chain() {
                error!(%err, "activate_best_chain failed after invalidation");
                panic!("chain-lock enforcement: activate_best_chain failed: {err}");
            }
        }
    }
}
