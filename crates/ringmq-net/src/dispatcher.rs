//! Retrying packet dispatcher.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use ringmq_membership::MembershipTable;
use ringmq_types::{NodeId, Packet, PacketKind};
use tracing::{debug, warn};

use crate::error::{DispatchError, NetError};
use crate::{Delivery, Transport};

/// Retry budget for one target.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Create a policy suitable for fast test execution.
    pub fn test_config() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(40),
        }
    }

    /// Delay before retry number `attempt` (1-indexed): doubles each time,
    /// capped at `max_backoff`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(500),
        }
    }
}

/// Per-target results of a broadcast.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// Targets that enqueued the packet.
    pub enqueued: Vec<NodeId>,
    /// Targets that did not, with the reason.
    pub failed: Vec<(NodeId, DispatchError)>,
}

impl BroadcastReport {
    /// Number of targets that enqueued the packet.
    pub fn count(&self) -> usize {
        self.enqueued.len()
    }
}

/// Moves packets to their targets with bounded retries.
///
/// The dispatcher never drops a packet silently: every call either confirms
/// the target's enqueue or returns why it did not happen.
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    membership: Arc<MembershipTable>,
    policy: RetryPolicy,
}

impl Dispatcher {
    /// Create a dispatcher over `transport`, reporting failure evidence to
    /// `membership`.
    pub fn new(
        transport: Arc<dyn Transport>,
        membership: Arc<MembershipTable>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            membership,
            policy,
        }
    }

    /// Return the retry policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Return the underlying transport.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Deliver `packet` to `packet.header.target`.
    ///
    /// Transient failures are retried with exponential backoff. Before each
    /// retry of a routed packet (SEND/BROADCAST) the ring version is
    /// compared with the one the packet was routed on; if it moved the
    /// dispatcher stops with [`DispatchError::RingChanged`] instead of
    /// retrying the stale target. Exhausting the budget marks the target
    /// SUSPECT.
    pub async fn send(&self, packet: Packet) -> Result<Delivery, DispatchError> {
        let target = packet.header.target;
        let routed = matches!(packet.header.kind, PacketKind::Send | PacketKind::Broadcast);
        let mut attempt: u32 = 0;

        loop {
            let error = match self.transport.deliver(packet.clone()).await {
                Ok(Delivery::Dropped) => return Err(DispatchError::Dropped(target)),
                Ok(delivery) => return Ok(delivery),
                Err(e) => e,
            };

            if !error.is_transient() || attempt >= self.policy.max_retries {
                return Err(self.give_up(target, attempt + 1, error));
            }

            attempt += 1;
            let backoff = self.policy.backoff_for_attempt(attempt);
            debug!(%target, attempt, ?backoff, error = %error, "delivery failed, retrying");
            tokio::time::sleep(backoff).await;

            if routed {
                let current = self.membership.version();
                if current != packet.header.ring_version {
                    debug!(%target, used = %packet.header.ring_version, %current, "ring moved during retry");
                    return Err(DispatchError::RingChanged {
                        used: packet.header.ring_version,
                        current,
                    });
                }
            }
        }
    }

    /// Deliver to the first candidate that enqueues the packet.
    ///
    /// Candidates are tried in order; the packet's target is rewritten for
    /// each. A ring change aborts the whole attempt. Returns the node that
    /// took the packet, or the last failure.
    pub async fn send_first(
        &self,
        packet: Packet,
        candidates: &[NodeId],
    ) -> Result<NodeId, DispatchError> {
        let mut last = DispatchError::NoTargets;
        for &candidate in candidates {
            let mut attempt = packet.clone();
            attempt.header.target = candidate;
            match self.send(attempt).await {
                Ok(_) => return Ok(candidate),
                Err(e @ DispatchError::RingChanged { .. }) => return Err(e),
                Err(e) => {
                    debug!(%candidate, error = %e, "candidate failed, trying next");
                    last = e;
                }
            }
        }
        Err(last)
    }

    /// Deliver a copy of `packet` to every target concurrently.
    ///
    /// A failing target never blocks delivery to the others.
    pub async fn broadcast(&self, packet: Packet, targets: &[NodeId]) -> BroadcastReport {
        let sends = targets.iter().map(|&target| {
            let mut copy = packet.clone();
            copy.header.target = target;
            async move { (target, self.send(copy).await) }
        });

        let mut report = BroadcastReport::default();
        for (target, result) in join_all(sends).await {
            match result {
                Ok(_) => report.enqueued.push(target),
                Err(e) => report.failed.push((target, e)),
            }
        }
        report
    }

    fn give_up(&self, target: NodeId, attempts: u32, error: NetError) -> DispatchError {
        warn!(%target, attempts, error = %error, "delivery failed, marking target suspect");
        if let Err(e) = self.membership.mark_suspect(&target) {
            debug!(%target, error = %e, "could not mark target suspect");
        }
        DispatchError::Failed {
            target,
            attempts,
            source: error,
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
