//! Scheduler glue: the serial worker behind the handler.
//!
//! Chain mutation must never run inside validation signals or while the
//! handler holds a lock, so every enforcement and signing body is handed to
//! one worker task that executes jobs strictly one at a time. "Schedule at
//! zero delay" is a channel send; the worker's serial loop is what breaks
//! the caller's stack.
//!
//! The worker also owns the periodic tick: every tick re-checks the feature
//! gate, enforces the best lock and retries signing the current tip (a
//! previous attempt may have bailed on a tx that was still inside the
//! safety window).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::trace;

use crate::handler::ChainLocksHandler;

/// Work items executed by the scheduler worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Job {
    /// Run check-active-state and enforcement (a CLSIG was just accepted).
    Enforce,
    /// Full pass after a tip update, then clear the coalescing flag.
    TipUpdated,
    /// Stop the worker after in-flight work completes.
    Shutdown,
}

/// Spawns the scheduler worker. The handler keeps the sending half; this
/// task owns the receiver and the periodic tick.
pub(crate) fn spawn(
    handler: Arc<ChainLocksHandler>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    tick_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let job = tokio::select! {
                _ = tick.tick() => None,
                job = jobs.recv() => match job {
                    Some(Job::Shutdown) | None => break,
                    Some(job) => Some(job),
                },
            };

            match job {
                None => {
                    handler.check_active_state();
                    handler.enforce_best_chain_lock();
                    handler.try_sign_chain_tip();
                }
                Some(Job::Enforce) => {
                    handler.check_active_state();
                    handler.enforce_best_chain_lock();
                }
                Some(Job::TipUpdated) => {
                    handler.check_active_state();
                    handler.enforce_best_chain_lock();
                    handler.try_sign_chain_tip();
                    handler.clear_tip_signal();
                }
                Some(Job::Shutdown) => unreachable!("handled in the select arm"),
            }
        }

        trace!("chain-lock scheduler worker stopped");
    })
}
