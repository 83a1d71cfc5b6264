// warden/src/intake.rs
//
// Shared intake between detection loops (many producers) and fusion (single
// consumer). Bounded; under sustained overload the OLDEST observation is
// dropped so producers never wait on fusion.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

use crate::events::AnomalyObservation;

pub struct IntakeQueue {
    queue:    Mutex<VecDeque<AnomalyObservation>>,
    capacity: usize,
    notify:   Notify,
    closed:   AtomicBool,
    pub accepted: AtomicU64,
    pub dropped:  AtomicU64,
}

impl IntakeQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue:    Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            notify:   Notify::new(),
            closed:   AtomicBool::new(false),
            accepted: AtomicU64::new(0),
            dropped:  AtomicU64::new(0),
        }
    }

    /// Never blocks. Returns false once the queue is closed.
    pub fn push(&self, obs: AnomalyObservation) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut q = self.queue.lock();
            if q.len() >= self.capacity {
                if let Some(old) = q.pop_front() {
                    let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if total.is_power_of_two() {
                        warn!(
                            subject = %old.subject_key, dropped_total = total,
                            "intake full, dropped oldest observation"
                        );
                    }
                }
            }
            q.push_back(obs);
        }
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        true
    }

    /// Next observation in arrival order; `None` once closed and drained.
    pub async fn recv(&self) -> Option<AnomalyObservation> {
        loop {
            let notified = self.notify.notified();
            if let Some(obs) = self.queue.lock().pop_front() {
                return Some(obs);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    pub fn try_recv(&self) -> Option<AnomalyObservation> {
        self.queue.lock().pop_front()
    }

    /// Stop accepting new observations and wake the consumer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize { self.queue.lock().len() }

    pub fn is_empty(&self) -> bool { self.queue.lock().is_empty() }
}
