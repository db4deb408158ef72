// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Readiness Latches
//!
//! Every exchange, queue, binding, and the connection itself exposes a
//! one-shot readiness latch: it flips from pending to resolved or rejected
//! exactly once per incarnation, and any number of tasks can await it. All
//! sequencing in the crate happens by chaining work behind these latches;
//! a rebuild replaces them wholesale with fresh pending ones.

use crate::errors::AmqpError;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq)]
enum LatchState {
    Pending,
    Ready,
    Failed(AmqpError),
}

/// A one-shot readiness signal with any number of waiters.
///
/// Cloning a `Latch` yields another handle onto the same signal. The first
/// call to [`Latch::resolve`] or [`Latch::reject`] wins; later calls are
/// no-ops, so an eventual late completion of a superseded attempt cannot
/// flip the outcome.
#[derive(Clone)]
pub struct Latch {
    tx: Arc<watch::Sender<LatchState>>,
}

impl Latch {
    /// Creates a pending latch.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(LatchState::Pending);
        Latch { tx: Arc::new(tx) }
    }

    /// Creates a latch that is already resolved.
    pub fn ready() -> Self {
        let (tx, _rx) = watch::channel(LatchState::Ready);
        Latch { tx: Arc::new(tx) }
    }

    /// Creates a latch that is already rejected with `err`.
    pub fn failed(err: AmqpError) -> Self {
        let (tx, _rx) = watch::channel(LatchState::Failed(err));
        Latch { tx: Arc::new(tx) }
    }

    /// Resolves the latch. No-op if it already settled.
    pub fn resolve(&self) {
        self.tx.send_if_modified(|state| {
            if matches!(state, LatchState::Pending) {
                *state = LatchState::Ready;
                true
            } else {
                false
            }
        });
    }

    /// Rejects the latch with `err`. No-op if it already settled.
    pub fn reject(&self, err: AmqpError) {
        self.tx.send_if_modified(|state| {
            if matches!(state, LatchState::Pending) {
                *state = LatchState::Failed(err);
                true
            } else {
                false
            }
        });
    }

    /// Settles the latch from a result.
    pub fn settle(&self, result: Result<(), AmqpError>) {
        match result {
            Ok(()) => self.resolve(),
            Err(err) => self.reject(err),
        }
    }

    /// True while the latch has neither resolved nor rejected.
    pub fn is_pending(&self) -> bool {
        matches!(*self.tx.borrow(), LatchState::Pending)
    }

    /// The settled outcome, or `None` while pending.
    pub fn result(&self) -> Option<Result<(), AmqpError>> {
        match &*self.tx.borrow() {
            LatchState::Pending => None,
            LatchState::Ready => Some(Ok(())),
            LatchState::Failed(err) => Some(Err(err.clone())),
        }
    }

    /// Waits until the latch settles and returns its outcome.
    pub async fn wait(&self) -> Result<(), AmqpError> {
        let mut rx = self.tx.subscribe();
        loop {
            {
                let state = rx.borrow_and_update();
                match &*state {
                    LatchState::Ready => return Ok(()),
                    LatchState::Failed(err) => return Err(err.clone()),
                    LatchState::Pending => {}
                }
            }
            if rx.changed().await.is_err() {
                return Err(AmqpError::InternalError);
            }
        }
    }

    /// Forwards the outcome of `fresh` into this latch once `fresh` settles.
    ///
    /// Used when a rebuild supersedes a still-pending incarnation: waiters
    /// holding the old latch observe the outcome of the replacement instead
    /// of hanging on an orphaned signal.
    pub(crate) fn follow(&self, fresh: &Latch) {
        if !self.is_pending() {
            return;
        }
        let old = self.clone();
        let fresh = fresh.clone();
        tokio::spawn(async move {
            old.settle(fresh.wait().await);
        });
    }
}

impl Default for Latch {
    fn default() -> Self {
        Latch::new()
    }
}

impl std::fmt::Debug for Latch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Latch").field("state", &*self.tx.borrow()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn resolved_latch_releases_every_waiter() {
        let latch = Latch::new();
        let a = latch.clone();
        let b = latch.clone();

        let waiters = tokio::spawn(async move {
            let (ra, rb) = tokio::join!(a.wait(), b.wait());
            (ra, rb)
        });

        latch.resolve();
        let (ra, rb) = timeout(Duration::from_secs(1), waiters).await.unwrap().unwrap();
        assert!(ra.is_ok());
        assert!(rb.is_ok());
    }

    #[tokio::test]
    async fn rejection_fans_out_the_error() {
        let latch = Latch::new();
        latch.reject(AmqpError::ConnectionExhausted(3));
        assert_eq!(latch.wait().await, Err(AmqpError::ConnectionExhausted(3)));
        assert_eq!(latch.result(), Some(Err(AmqpError::ConnectionExhausted(3))));
    }

    #[tokio::test]
    async fn first_settlement_wins() {
        let latch = Latch::new();
        latch.resolve();
        latch.reject(AmqpError::InternalError);
        assert_eq!(latch.wait().await, Ok(()));

        let latch = Latch::new();
        latch.reject(AmqpError::InternalError);
        latch.resolve();
        assert!(latch.wait().await.is_err());
    }

    #[tokio::test]
    async fn waiting_on_a_settled_latch_returns_immediately() {
        assert!(Latch::ready().wait().await.is_ok());
        assert!(Latch::failed(AmqpError::ConnectionClosing).wait().await.is_err());
    }

    #[tokio::test]
    async fn superseded_latch_follows_its_replacement() {
        let old = Latch::new();
        let fresh = Latch::new();
        old.follow(&fresh);

        let waiter = {
            let old = old.clone();
            tokio::spawn(async move { old.wait().await })
        };

        fresh.resolve();
        let result = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
