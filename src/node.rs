// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Shared Node Skeleton
//!
//! Exchanges and queues share the same lifecycle shape: a name, an
//! exclusively-owned channel, a readiness latch replaced on every rebuild,
//! and one-shot terminal latches for deletion and closure. This module
//! holds that common state record and the [`Node`] trait both entity types
//! implement.

use crate::{broker::BrokerChannel, errors::AmqpError, readiness::Latch};
use async_trait::async_trait;
use std::sync::Arc;

/// Lifecycle surface common to exchanges and queues.
#[async_trait]
pub trait Node: Send + Sync {
    fn name(&self) -> &str;

    /// Readiness of the current incarnation.
    fn initialized(&self) -> Latch;

    /// Deletes the entity from the broker and unregisters it. Idempotent:
    /// repeat calls settle with the first call's outcome.
    async fn delete(&self) -> Result<(), AmqpError>;

    /// Unregisters the entity and closes its channel without deleting it
    /// from the broker. Idempotent.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// Mutable lifecycle state owned by a node.
pub(crate) struct NodeState {
    pub channel: Option<Arc<dyn BrokerChannel>>,
    pub initialized: Latch,
    pub deleting: Option<Latch>,
    pub closing: Option<Latch>,
}

impl NodeState {
    pub fn new() -> Self {
        NodeState {
            channel: None,
            initialized: Latch::new(),
            deleting: None,
            closing: None,
        }
    }

    pub fn channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        self.channel
            .clone()
            .ok_or_else(|| AmqpError::ChannelFailed("no active channel".to_owned()))
    }
}

/// Claims a terminal latch slot. The first caller installs a fresh pending
/// latch and is responsible for settling it; later callers get the stored
/// latch back and just await it.
pub(crate) fn claim_terminal(slot: &mut Option<Latch>) -> (Latch, bool) {
    match slot {
        Some(latch) => (latch.clone(), false),
        None => {
            let latch = Latch::new();
            *slot = Some(latch.clone());
            (latch, true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_latch_is_claimed_once() {
        let mut slot = None;
        let (first, owner) = claim_terminal(&mut slot);
        assert!(owner);

        let (second, owner) = claim_terminal(&mut slot);
        assert!(!owner);

        first.resolve();
        assert_eq!(second.result(), Some(Ok(())));
    }

    #[test]
    fn fresh_state_has_no_channel() {
        let state = NodeState::new();
        assert!(state.channel().is_err());
        assert!(state.initialized.is_pending());
    }
}
