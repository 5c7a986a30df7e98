use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};

/// Default number of interrupt codes retained between `GetInterrupts` polls.
pub const DEFAULT_CAPACITY: usize = 64;

/// FIFO of hardware interrupt codes.
///
/// Pushed from the driver's callback thread, drained by the RPC thread.
/// Pushing never blocks: when the queue is full the oldest code is discarded.
/// Delivery is best-effort, not exactly-once.
pub struct InterruptQueue {
    sender: Sender<i32>,
    receiver: Receiver<i32>,
    dropped: AtomicU64,
}

impl InterruptQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
        Self {
            sender,
            receiver,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue an interrupt code, evicting the oldest one if full.
    pub fn push(&self, code: i32) {
        let mut code = code;
        // Two attempts: a concurrent push can refill the slot we just freed.
        for _ in 0..2 {
            match self.sender.try_send(code) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    if self.receiver.try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        log::trace!("Interrupt queue full, dropped oldest entry");
                    }
                    code = rejected;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
        self.dropped.fetch_add(1, Ordering::Relaxed);
        log::warn!("Interrupt queue contended, dropping interrupt {}", code);
    }

    /// Non-destructive check used for the "interrupt pending" response flag.
    pub fn has_pending(&self) -> bool {
        !self.receiver.is_empty()
    }

    /// Remove and return every queued code in arrival order.
    pub fn drain(&self) -> Vec<i32> {
        self.receiver.try_iter().collect()
    }

    pub fn clear(&self) {
        let discarded = self.receiver.try_iter().count();
        if discarded > 0 {
            log::debug!("Discarded {} pending interrupts", discarded);
        }
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Total codes lost to overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for InterruptQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_drain_preserves_order() {
        let queue = InterruptQueue::new(8);
        queue.push(3);
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.drain(), vec![3, 1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let queue = InterruptQueue::new(2);
        queue.push(10);
        queue.push(11);
        queue.push(12);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.drain(), vec![11, 12]);
    }

    #[test]
    fn test_has_pending_does_not_consume() {
        let queue = InterruptQueue::new(4);
        assert!(!queue.has_pending());
        queue.push(7);
        assert!(queue.has_pending());
        assert!(queue.has_pending());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_concurrent_pushers_stay_bounded() {
        let queue = Arc::new(InterruptQueue::new(16));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let q = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        q.push(t * 1000 + i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(queue.len() <= 16);
        assert_eq!(queue.drain().len() as u64 + queue.dropped(), 400);
    }
}
