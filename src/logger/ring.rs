//! Lock-free MPSC ring, Disruptor discipline (design note in spec section
//! 9): each slot carries a sequence counter; producers CAS-claim a write
//! position and release-publish `seq = pos + 1`; the single consumer
//! acquires a slot once `seq == pos + 1`, moves the payload out, and
//! republishes `seq = pos + ring_size` to free the slot for the next lap.
//! A producer that finds the ring still full for its lap drops the record;
//! logging is never allowed to block a service thread.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Condvar;
use std::sync::Mutex;

use super::record::Record;

struct Slot {
    seq: AtomicUsize,
    data: UnsafeCell<MaybeUninit<Record>>,
}

// SAFETY: access to `data` is gated by `seq`, which establishes
// happens-before via its acquire/release ordering; only the producer that
// wins the CAS on `pos` writes, and only the single consumer reads.
unsafe impl Sync for Slot {}

pub struct Ring {
    slots: Box<[Slot]>,
    mask: usize,
    write_pos: AtomicUsize,
    read_pos: AtomicUsize,
    pending: AtomicUsize,
    dropped: AtomicUsize,
    consumed: AtomicUsize,
    wake_lock: Mutex<()>,
    wake_cv: Condvar,
}

impl Ring {
    /// `capacity` is rounded up to the next power of two.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(2);
        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            slots.push(Slot {
                seq: AtomicUsize::new(i),
                data: UnsafeCell::new(MaybeUninit::uninit()),
            });
        }
        Ring {
            slots: slots.into_boxed_slice(),
            mask: capacity - 1,
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
            consumed: AtomicUsize::new(0),
            wake_lock: Mutex::new(()),
            wake_cv: Condvar::new(),
        }
    }

    /// Enqueues `record`. Returns `false` (and counts a drop) if the slot
    /// for this lap hasn't been vacated by the consumer yet.
    pub fn enqueue(&self, record: Record) -> bool {
        loop {
            let pos = self.write_pos.load(Ordering::Relaxed);
            let slot = &self.slots[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq as isize - pos as isize;

            if diff == 0 {
                if self
                    .write_pos
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    unsafe { (*slot.data.get()).write(record) };
                    slot.seq.store(pos + 1, Ordering::Release);
                    let was_empty = self.pending.fetch_add(1, Ordering::Release) == 0;
                    if was_empty {
                        let _guard = self.wake_lock.lock().unwrap();
                        self.wake_cv.notify_one();
                    }
                    return true;
                }
                // Lost the race for this slot; retry with the new write_pos.
            } else if diff < 0 {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            // diff > 0: another producer already advanced write_pos past
            // what we observed; retry.
        }
    }

    /// Removes and returns the oldest record, or `None` if empty.
    pub fn try_dequeue(&self) -> Option<Record> {
        let pos = self.read_pos.load(Ordering::Relaxed);
        let slot = &self.slots[pos & self.mask];
        let seq = slot.seq.load(Ordering::Acquire);
        if seq != pos + 1 {
            return None;
        }
        let record = unsafe { (*slot.data.get()).assume_init_read() };
        slot.seq
            .store(pos + self.mask + 1, Ordering::Release);
        self.read_pos.store(pos + 1, Ordering::Relaxed);
        self.pending.fetch_sub(1, Ordering::Release);
        self.consumed.fetch_add(1, Ordering::Relaxed);
        Some(record)
    }

    /// Blocks the calling (consumer) thread until at least one record is
    /// pending or `timeout` elapses, whichever first. Wakes immediately if
    /// a record is already pending.
    pub fn wait_for_pending(&self, timeout: std::time::Duration) {
        if self.pending.load(Ordering::Acquire) != 0 {
            return;
        }
        let guard = self.wake_lock.lock().unwrap();
        if self.pending.load(Ordering::Acquire) != 0 {
            return;
        }
        let _ = self.wake_cv.wait_timeout(guard, timeout);
    }

    pub fn wake_all(&self) {
        let _guard = self.wake_lock.lock().unwrap();
        self.wake_cv.notify_all();
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn consumed(&self) -> usize {
        self.consumed.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}
