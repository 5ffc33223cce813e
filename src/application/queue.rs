//! Bounded hand-off between a line's sampler and its worker.

use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use tracing::{error, warn};

use crate::core::domain::Tick;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued,
    /// The queue was full; the oldest tick was discarded to make room.
    EvictedOldest,
    /// The tick could not be queued at all.
    Dropped,
}

/// Bounded FIFO of ticks. When full, the oldest tick makes room for the
/// newest so the worker always sees the freshest data.
#[derive(Clone)]
pub struct SampleQueue {
    tx: Sender<Tick>,
    rx: Receiver<Tick>,
    capacity: usize,
}

impl SampleQueue {
    pub fn bounded(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    pub fn push(&self, tick: Tick) -> PushOutcome {
        let tick = match self.tx.try_send(tick) {
            Ok(()) => return PushOutcome::Enqueued,
            Err(TrySendError::Full(tick)) => tick,
            Err(TrySendError::Disconnected(_)) => {
                error!("sample queue disconnected; tick dropped");
                return PushOutcome::Dropped;
            }
        };

        let evicted = self.rx.try_recv().ok();
        self.requeue(tick, evicted)
    }

    /// Second attempt after making room. Another producer may have taken the
    /// freed slot in between.
    fn requeue(&self, tick: Tick, evicted: Option<Tick>) -> PushOutcome {
        match self.tx.try_send(tick) {
            Ok(()) => match evicted {
                Some(oldest) => {
                    warn!(
                        capacity = self.capacity,
                        evicted_at = %oldest.timestamp,
                        "sample queue full; dropped oldest tick"
                    );
                    PushOutcome::EvictedOldest
                }
                None => PushOutcome::Enqueued,
            },
            Err(err) => {
                error!(
                    capacity = self.capacity,
                    tick_at = %err.into_inner().timestamp,
                    "sample queue still full after eviction; tick dropped"
                );
                PushOutcome::Dropped
            }
        }
    }

    /// Wait up to `timeout` for the next tick.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Tick> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
