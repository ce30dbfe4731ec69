use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// A reusable byte buffer holding one framed batch of readings.
///
/// A payload is owned by exactly one place at a time: the free pool, the
/// writer currently filling it, the pending queue, or the retry queue. All
/// transitions happen on the collector worker, so the fields need no
/// synchronization of their own.
pub struct Payload {
    pub(crate) data: Vec<u8>,
    pub(crate) metrics_count: u32,
    pub(crate) send_attempts: u32,
}

impl Payload {
    fn new(capacity: usize) -> Payload {
        Payload { data: Vec::with_capacity(capacity), metrics_count: 0, send_attempts: 0 }
    }

    /// Bytes written so far.
    pub fn used(&self) -> usize {
        self.data.len()
    }

    /// Number of readings framed into this payload.
    pub fn metrics_count(&self) -> u32 {
        self.metrics_count
    }

    /// Send attempts made for this payload so far.
    pub fn send_attempts(&self) -> u32 {
        self.send_attempts
    }

    fn reset(&mut self) {
        self.data.clear();
        self.metrics_count = 0;
        self.send_attempts = 0;
    }
}

struct Lists {
    free: Vec<Payload>,
    pending: VecDeque<Payload>,
    retry: VecDeque<Payload>,
}

impl Lists {
    fn queued(&self) -> usize {
        self.pending.len() + self.retry.len()
    }
}

/// Per-endpoint pool of payload buffers with pending and retry queues.
///
/// `max_payload_count` bounds the queued lists (pending + retry). Acquiring a
/// buffer never blocks: when the bound is hit, the oldest queued payload is
/// dropped (retry head first, since retries predate anything pending) and its
/// buffer reused. The writer's checked-out payload sits outside the bound, so
/// total allocation per endpoint stays within `max_payload_count + 1`.
pub struct PayloadQueue {
    lists: Mutex<Lists>,
    payload_size: usize,
    max_payload_count: usize,
    dropped: AtomicU64,
}

impl PayloadQueue {
    pub(crate) fn new(payload_size: usize, max_payload_count: usize) -> PayloadQueue {
        PayloadQueue {
            lists: Mutex::new(Lists {
                free: Vec::new(),
                pending: VecDeque::new(),
                retry: VecDeque::new(),
            }),
            payload_size,
            max_payload_count: max_payload_count.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Buffer capacity for payloads drawn from this queue.
    pub(crate) fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Hands out a buffer: reuse, allocate under the bound, or steal the
    /// oldest queued payload.
    pub(crate) fn get_free(&self) -> Payload {
        let mut lists = self.lists.lock();
        if let Some(payload) = lists.free.pop() {
            return payload;
        }

        if lists.queued() < self.max_payload_count {
            return Payload::new(self.payload_size);
        }

        let mut stolen = lists
            .retry
            .pop_front()
            .or_else(|| lists.pending.pop_front())
            .expect("queued() above the bound implies a queued payload");
        drop(lists);

        self.dropped.fetch_add(1, Ordering::Relaxed);
        stolen.reset();
        stolen
    }

    /// Appends a finalized payload to the pending queue.
    pub(crate) fn add_pending(&self, payload: Payload) {
        self.lists.lock().pending.push_back(payload);
    }

    /// Moves every retry payload to the front of pending, oldest first.
    pub(crate) fn merge_retry(&self) {
        let mut lists = self.lists.lock();
        while let Some(payload) = lists.retry.pop_back() {
            lists.pending.push_front(payload);
        }
    }

    /// Takes the whole pending list for a flush pass.
    pub(crate) fn take_for_flush(&self) -> Vec<Payload> {
        self.lists.lock().pending.drain(..).collect()
    }

    /// Requeues a payload after a failed send attempt.
    ///
    /// Returns `false` when the payload has exhausted its attempts and was
    /// dropped instead.
    pub(crate) fn retry(&self, mut payload: Payload, max_retries: u32) -> bool {
        payload.send_attempts += 1;
        if payload.send_attempts >= max_retries {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            self.release(payload);
            return false;
        }

        self.lists.lock().retry.push_back(payload);
        true
    }

    /// Requeues not-yet-attempted payloads after a failed cycle, preserving
    /// their order behind any payload requeued via [`PayloadQueue::retry`].
    pub(crate) fn requeue(&self, payloads: impl IntoIterator<Item = Payload>) {
        let mut lists = self.lists.lock();
        for payload in payloads {
            lists.retry.push_back(payload);
        }
    }

    /// Returns a payload's buffer to the free pool.
    pub(crate) fn release(&self, mut payload: Payload) {
        payload.reset();
        self.lists.lock().free.push(payload);
    }

    /// Drains the dropped-payload count accumulated since the last call.
    pub(crate) fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }

    /// Drops every queued payload, returning how many were abandoned.
    pub(crate) fn abandon_queued(&self) -> u64 {
        let mut lists = self.lists.lock();
        let abandoned = lists.queued() as u64;
        let mut freed: Vec<Payload> = lists.retry.drain(..).collect();
        freed.extend(lists.pending.drain(..));
        for payload in &mut freed {
            payload.reset();
        }
        lists.free.extend(freed);
        abandoned
    }

    #[cfg(test)]
    pub(crate) fn queued_len(&self) -> usize {
        self.lists.lock().queued()
    }
}

#[cfg(test)]
mod tests {
    use super::PayloadQueue;

    fn pending_with(queue: &PayloadQueue, marker: u8) {
        let mut payload = queue.get_free();
        payload.data.push(marker);
        payload.metrics_count = 1;
        queue.add_pending(payload);
    }

    #[test]
    fn bound_steals_oldest_and_counts_drops() {
        let queue = PayloadQueue::new(64, 2);

        // Mimic the writer: it checks out the replacement buffer before the
        // full payload goes pending. Five payloads against a bound of two:
        // the two oldest get stolen, the three newest survive in order.
        let mut current = queue.get_free();
        for marker in 1..=5u8 {
            current.data.push(marker);
            current.metrics_count = 1;
            if marker < 5 {
                let next = queue.get_free();
                queue.add_pending(std::mem::replace(&mut current, next));
            } else {
                queue.add_pending(current);
                break;
            }
        }

        assert_eq!(queue.take_dropped(), 2);
        let pending = queue.take_for_flush();
        let markers: Vec<u8> = pending.iter().map(|p| p.data[0]).collect();
        assert_eq!(markers, vec![3, 4, 5]);
    }

    #[test]
    fn retry_drops_after_max_attempts() {
        let queue = PayloadQueue::new(64, 4);

        let payload = queue.get_free();
        assert!(queue.retry(payload, 3));
        assert_eq!(queue.take_dropped(), 0);

        queue.merge_retry();
        let mut pending = queue.take_for_flush();
        let payload = pending.pop().unwrap();
        assert_eq!(payload.send_attempts(), 1);

        assert!(queue.retry(payload, 3));
        queue.merge_retry();
        let payload = queue.take_for_flush().pop().unwrap();

        // Third failure exhausts the budget.
        assert!(!queue.retry(payload, 3));
        assert_eq!(queue.take_dropped(), 1);
        assert_eq!(queue.queued_len(), 0);
    }

    #[test]
    fn merge_retry_puts_retries_before_pending() {
        let queue = PayloadQueue::new(64, 8);

        let mut old = queue.get_free();
        old.data.push(1);
        assert!(queue.retry(old, 5));

        pending_with(&queue, 2);
        queue.merge_retry();

        let markers: Vec<u8> = queue.take_for_flush().iter().map(|p| p.data[0]).collect();
        assert_eq!(markers, vec![1, 2]);
    }

    #[test]
    fn release_keeps_the_buffer_for_reuse() {
        let queue = PayloadQueue::new(64, 2);

        let mut payload = queue.get_free();
        payload.data.extend_from_slice(b"abc");
        payload.metrics_count = 1;
        payload.send_attempts = 2;
        queue.release(payload);

        let reused = queue.get_free();
        assert_eq!(reused.used(), 0);
        assert_eq!(reused.metrics_count(), 0);
        assert_eq!(reused.send_attempts(), 0);
        assert!(reused.data.capacity() >= 64);
    }

    #[test]
    fn abandon_clears_everything() {
        let queue = PayloadQueue::new(64, 4);
        pending_with(&queue, 1);
        pending_with(&queue, 2);
        let p = queue.get_free();
        assert!(queue.retry(p, 5));

        assert_eq!(queue.abandon_queued(), 3);
        assert_eq!(queue.queued_len(), 0);
    }
}
