//! ==============================================================================
//! feed.rs - the shared "latest sample" slot
//! ==============================================================================
//!
//! purpose:
//!     process-wide sample state, written only by the sampler:
//!     - latest sample: a watch channel. publishing is one atomic swap of an
//!       Arc<Sample> and waiters are woken after the swap
//!     - history: a bounded ring of recent samples so a fresh chart is not empty
//!
//!     watch keeps exactly one value, so a slow reader never builds a queue;
//!     it just sees the newest sample next time it looks.
//!
//! ==============================================================================

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::domain::{Sample, SensorRead};

pub type SampleSlot = watch::Receiver<Option<Arc<Sample>>>;

#[derive(Clone)]
pub struct SampleFeed {
    tx: Arc<watch::Sender<Option<Arc<Sample>>>>,
    history: Arc<Mutex<History>>,
}

struct History {
    next_seq: u64,
    capacity: usize,
    ring: VecDeque<Arc<Sample>>,
}

impl SampleFeed {
    pub fn new(history_capacity: usize) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            tx: Arc::new(tx),
            history: Arc::new(Mutex::new(History {
                next_seq: 1,
                capacity: history_capacity,
                ring: VecDeque::with_capacity(history_capacity),
            })),
        }
    }

    /// stamp a read as the next sample and make it current
    pub fn publish(&self, read: SensorRead, timestamp: DateTime<Utc>) -> Arc<Sample> {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);

        let sample = Arc::new(Sample {
            seq: history.next_seq,
            timestamp,
            readings: read.readings,
            errors: read.errors,
        });
        history.next_seq += 1;

        if history.capacity > 0 {
            if history.ring.len() == history.capacity {
                history.ring.pop_front();
            }
            history.ring.push_back(sample.clone());
        }

        // still under the history lock: seq order and slot order can't diverge
        self.tx.send_replace(Some(sample.clone()));
        sample
    }

    pub fn latest(&self) -> Option<Arc<Sample>> {
        self.tx.borrow().clone()
    }

    /// oldest first
    pub fn history(&self) -> Vec<Arc<Sample>> {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.ring.iter().cloned().collect()
    }

    pub fn subscribe(&self) -> SampleSlot {
        self.tx.subscribe()
    }
}
