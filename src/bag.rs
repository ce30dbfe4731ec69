use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::slice;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_epoch::{pin as epoch_pin, Atomic, Guard, Owned, Shared};

// One slot per bit of the `read` bitmap.
#[cfg(target_pointer_width = "32")]
const SEGMENT_SIZE: usize = 32;
#[cfg(target_pointer_width = "64")]
const SEGMENT_SIZE: usize = 64;

/// One fixed-size chunk of recorded values.
///
/// `write` reserves slots; the `read` bitmap marks slots whose value is fully
/// written, so readers only ever observe initialized data.
struct Segment<T> {
    write: AtomicUsize,
    read: AtomicUsize,
    slots: [UnsafeCell<MaybeUninit<T>>; SEGMENT_SIZE],
    prev: Atomic<Segment<T>>,
}

impl<T: Copy> Segment<T> {
    fn new() -> Self {
        Segment {
            write: AtomicUsize::new(0),
            read: AtomicUsize::new(0),
            slots: std::array::from_fn(|_| UnsafeCell::new(MaybeUninit::uninit())),
            prev: Atomic::null(),
        }
    }

    fn len(&self) -> usize {
        self.read.load(Ordering::Acquire).trailing_ones() as usize
    }

    /// Values written so far, in write order.
    fn data(&self) -> &[T] {
        let len = self.len();
        let head = self.slots[0].get().cast::<T>();
        unsafe { slice::from_raw_parts(head, len) }
    }

    fn link_prev(&self, prev: Shared<'_, Segment<T>>, guard: &Guard) {
        let result =
            self.prev.compare_exchange(Shared::null(), prev, Ordering::AcqRel, Ordering::Acquire, guard);
        debug_assert!(result.is_ok(), "segment already linked");
    }

    /// Writes into the next free slot, or gives the value back when full.
    fn push(&self, value: T) -> Result<(), T> {
        let index = self.write.fetch_add(1, Ordering::AcqRel);
        if index >= SEGMENT_SIZE {
            return Err(value);
        }

        unsafe {
            (*self.slots[index].get()).write(value);
        }

        self.read.fetch_or(1 << index, Ordering::AcqRel);
        Ok(())
    }
}

unsafe impl<T: Copy + Send> Send for Segment<T> {}
unsafe impl<T: Copy + Send> Sync for Segment<T> {}

impl<T> Drop for Segment<T> {
    fn drop(&mut self) {
        let guard = &epoch_pin();
        let prev = self.prev.swap(Shared::null(), Ordering::AcqRel, guard);
        if !prev.is_null() {
            unsafe {
                guard.defer_destroy(prev);
            }
            guard.flush();
        }
    }
}

/// A lock-free, append-only bag of recorded values with swap-based snapshots.
///
/// Writers reserve slots in the newest segment with a fetch-add cursor and
/// CAS-install a fresh segment when it fills, so recording never blocks and
/// never takes a lock. Taking the contents swaps the head pointer, which
/// gives the snapshot thread a consistent window while writers keep going
/// against a new, empty bag. Segment memory is reclaimed through
/// `crossbeam-epoch` once concurrent readers are done with it.
pub(crate) struct AtomicBag<T> {
    head: Atomic<Segment<T>>,
}

impl<T> std::fmt::Debug for AtomicBag<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicBag").finish_non_exhaustive()
    }
}

impl<T: Copy> AtomicBag<T> {
    pub fn new() -> Self {
        AtomicBag { head: Atomic::null() }
    }

    pub fn is_empty(&self) -> bool {
        let guard = &epoch_pin();
        let head = self.head.load(Ordering::Acquire, guard);
        if head.is_null() {
            return true;
        }

        // A non-empty prev chain means earlier segments hold data even if the
        // newest one is still empty.
        let segment = unsafe { head.deref() };
        segment.len() == 0 && segment.prev.load(Ordering::Acquire, guard).is_null()
    }

    /// Appends a value. Lock-free; loops only when racing a segment install.
    pub fn push(&self, value: T) {
        let mut value = value;
        loop {
            let guard = &epoch_pin();
            let mut head = self.head.load(Ordering::Acquire, guard);
            if head.is_null() {
                match self.head.compare_exchange(
                    Shared::null(),
                    Owned::new(Segment::new()),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    guard,
                ) {
                    Ok(installed) => head = installed,
                    Err(e) => head = e.current,
                }
            }

            let segment = unsafe { head.deref() };
            match segment.push(value) {
                Ok(()) => return,
                Err(rejected) => {
                    // Segment is full: try to install a successor linked back
                    // to it. Losing the race just means someone else installed
                    // one, so start over.
                    match self.head.compare_exchange(
                        head,
                        Owned::new(Segment::new()),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        guard,
                    ) {
                        Ok(installed) => {
                            let fresh = unsafe { installed.deref() };
                            fresh.link_prev(head, guard);
                            match fresh.push(rejected) {
                                Ok(()) => return,
                                Err(rejected) => value = rejected,
                            }
                        }
                        Err(_) => value = rejected,
                    }
                }
            }
        }
    }

    /// Atomically takes everything recorded so far, oldest first.
    ///
    /// Writers racing this call land in the replacement (empty) bag and are
    /// picked up by the next snapshot.
    pub fn take(&self) -> Vec<T> {
        let guard = &epoch_pin();
        let head = self.head.load(Ordering::Acquire, guard);
        if head.is_null() {
            return Vec::new();
        }

        if self
            .head
            .compare_exchange(head, Shared::null(), Ordering::SeqCst, Ordering::Acquire, guard)
            .is_err()
        {
            // Another take() won the swap; its caller owns the data.
            return Vec::new();
        }

        // Segments hang newest-first off the head; gather them and reverse so
        // the result runs in arrival order.
        let mut segments: Vec<&[T]> = Vec::new();
        let mut cursor = head;
        while !cursor.is_null() {
            let segment = unsafe { cursor.deref() };
            segments.push(segment.data());
            cursor = segment.prev.load(Ordering::Acquire, guard);
        }

        let total = segments.iter().map(|s| s.len()).sum();
        let mut values = Vec::with_capacity(total);
        for segment in segments.into_iter().rev() {
            values.extend_from_slice(segment);
        }

        unsafe {
            guard.defer_destroy(head);
        }
        guard.flush();

        values
    }
}

impl<T: Copy> Default for AtomicBag<T> {
    fn default() -> Self {
        AtomicBag::new()
    }
}

impl<T> Drop for AtomicBag<T> {
    fn drop(&mut self) {
        let guard = &epoch_pin();
        let head = self.head.swap(Shared::null(), Ordering::AcqRel, guard);
        if !head.is_null() {
            unsafe {
                guard.defer_destroy(head);
            }
            guard.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_utils::thread::scope;

    use super::{AtomicBag, SEGMENT_SIZE};

    #[test]
    fn push_then_take() {
        let bag = AtomicBag::new();
        assert!(bag.is_empty());

        bag.push(42u64);
        assert!(!bag.is_empty());

        let values = bag.take();
        assert_eq!(values, vec![42]);
        assert!(bag.is_empty());
    }

    #[test]
    fn take_preserves_arrival_order_across_segments() {
        let bag = AtomicBag::new();

        let count = SEGMENT_SIZE * 3 + SEGMENT_SIZE / 2;
        for i in 0..count as u64 {
            bag.push(i);
        }

        let values = bag.take();
        assert_eq!(values.len(), count);
        for (i, value) in values.iter().enumerate() {
            assert_eq!(*value, i as u64);
        }
    }

    #[test]
    fn take_leaves_an_empty_bag() {
        let bag = AtomicBag::new();
        for i in 0..10u64 {
            bag.push(i);
        }

        assert_eq!(bag.take().len(), 10);
        assert_eq!(bag.take().len(), 0);

        bag.push(99);
        assert_eq!(bag.take(), vec![99]);
    }

    #[test]
    fn concurrent_pushes_lose_nothing() {
        let bag = AtomicBag::new();

        let per_thread = SEGMENT_SIZE as u64 * 1000;
        let expected: u64 = (0..per_thread).sum::<u64>() * 2;

        scope(|s| {
            for _ in 0..2 {
                s.spawn(|_| {
                    for i in 0..per_thread {
                        bag.push(i);
                    }
                });
            }
        })
        .unwrap();

        let values = bag.take();
        assert_eq!(values.len() as u64, per_thread * 2);
        assert_eq!(values.iter().sum::<u64>(), expected);
    }
}
