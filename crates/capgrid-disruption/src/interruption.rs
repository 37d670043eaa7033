//! Capacity-reclaim notices.

use std::sync::Arc;
use std::time::Duration;

use capgrid_feed::EventFeed;
use capgrid_state::{DrainReason, EventKind, StateStore};
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::drainer::{DrainStart, Drainer};
use crate::error::{DisruptionError, DisruptionResult};

/// Turns a reclaim notice into a deadline-bounded drain and asks the
/// reconciler for replacement capacity right away.
#[derive(Clone)]
pub struct InterruptionHandler {
    state: StateStore,
    feed: EventFeed,
    drainer: Drainer,
    reconcile: Arc<Notify>,
}

impl InterruptionHandler {
    pub fn new(
        state: StateStore,
        feed: EventFeed,
        drainer: Drainer,
        reconcile: Arc<Notify>,
    ) -> Self {
        Self {
            state,
            feed,
            drainer,
            reconcile,
        }
    }

    /// The provider will reclaim `node_id` in `deadline`.
    ///
    /// The drain grace is the pool's grace capped at the deadline. If the
    /// node is already draining, that drain's deadline is tightened.
    pub async fn on_interruption_notice(
        &self,
        node_id: &str,
        deadline: Duration,
    ) -> DisruptionResult<DrainStart> {
        let node = self
            .state
            .get_node(node_id)?
            .ok_or_else(|| DisruptionError::NodeNotFound(node_id.to_string()))?;

        info!(node = %node_id, deadline_secs = deadline.as_secs(), "interruption notice");
        self.feed.emit(EventKind::InterruptionReceived {
            node: node_id.to_string(),
            deadline_secs: deadline.as_secs(),
        })?;

        let grace = match self.state.get_pool(&node.pool)? {
            Some(pool) => Duration::from_secs(pool.disruption_grace_secs).min(deadline),
            None => deadline,
        };

        let outcome = self
            .drainer
            .start(node_id, DrainReason::Interruption, grace)
            .await?;
        if let DrainStart::NotDrainable(state) = outcome {
            warn!(node = %node_id, %state, "interruption for node that cannot drain");
        } else {
            self.reconcile.notify_one();
        }
        Ok(outcome)
    }
}
