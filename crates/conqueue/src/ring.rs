use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{fence, AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam_utils::CachePadded;

use crate::invariants::{
    debug_assert_pow2, debug_assert_reservation_window, debug_assert_slot_valid,
};

/// Capacity of the buffer allocated on a thread's first push.
pub(crate) const INITIAL_PRODUCER_CAPACITY: usize = 8;

/// Upper bound on a single buffer's capacity; reserve requests are clamped
/// to the nearest power of two at or below this.
pub(crate) const BUFFER_CAPACITY_MAX: usize = !(usize::MAX >> 3) / 2;

// =============================================================================
// MEMORY ORDERING & SYNCHRONIZATION STRATEGY
// =============================================================================
//
// A producer buffer is a bounded ring written by exactly one thread and read
// by any number of consumers.
//
// ## Counters
//
// All counters are free-running totals; the slot index is `total & mask`.
//
// - `write_slot`: producer-owned cursor, not atomic (single writer, single
//   reader: the owning thread).
// - `written`: published watermark. Consumers may read slot `i` only after
//   observing `written > i`.
// - `pre_read`: consumer reservation counter; admits at most
//   `written - read_slot` concurrent claims, over-claims are undone.
// - `read_slot`: claimed read cursor; each successful reservation takes
//   exactly one total.
//
// ## Producer (push path)
//
// 1. Check `state[write_slot & mask]` with Acquire (pairs with the consumer's
//    Release store of `empty`; the slot's previous occupant must be fully
//    moved out before the producer writes over it).
// 2. Write the item, store `state[slot] = valid` with Release.
// 3. Release fence, then publish `written` with a Relaxed store.
//
// ## Consumer (pop path)
//
// 1. Load `written` Relaxed, then an Acquire fence (pairs with the producer's
//    Release fence; everything written before the watermark is now visible).
// 2. Reserve via `pre_read` (Relaxed; carries no data), undo and fail when
//    the reservation falls outside the published window.
// 3. Claim a read total via `read_slot` (Relaxed), move the item out, store
//    `state[slot] = empty` with Release.
//
// ## Per-slot state machine
//
// `empty -> valid -> empty`, one full cycle per ring generation. `dummy` is
// terminal: it poisons the producer's next write slot after `unsafe_reset` so
// a surviving thread-local handle fails its push and reinitializes.
// =============================================================================

/// Per-slot occupancy. Stored as `u8` in an atomic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum SlotState {
    Empty = 0,
    Valid = 1,
    Dummy = 2,
}

/// Single-producer / many-consumer bounded ring backing one thread's pushes.
///
/// When full, the owning producer chains a larger successor via `push_front`;
/// consumers drain this buffer before following `next`.
pub(crate) struct ProducerBuffer<T> {
    // === CONSUMER HOT ===
    /// Total slots reserved by consumers.
    pre_read: CachePadded<AtomicUsize>,
    /// Total slots actually claimed for consumption.
    read_slot: CachePadded<AtomicUsize>,

    // === PRODUCER HOT ===
    /// Published watermark: slots below this are consumable.
    written: CachePadded<AtomicUsize>,
    /// Producer-owned write cursor.
    write_slot: UnsafeCell<usize>,

    // === COLD STATE ===
    /// Successor buffer of larger capacity, set once by the owning producer.
    next: ArcSwapOption<ProducerBuffer<T>>,
    /// Set by `invalidate`; tells a surviving producer handle to reinitialize.
    invalidated: AtomicBool,

    /// Capacity is a power of two; slot index is `total & mask`.
    mask: usize,

    /// Per-slot occupancy states.
    state: Box<[AtomicU8]>,

    /// Item slots.
    ///
    /// `Box<[_]>` rather than `Vec<_>`: the size is fixed at construction.
    data: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// Safety: the counter protocol above makes concurrent access sound; items
// cross threads, hence T: Send.
unsafe impl<T: Send> Send for ProducerBuffer<T> {}
unsafe impl<T: Send> Sync for ProducerBuffer<T> {}

impl<T> ProducerBuffer<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        debug_assert_pow2!(capacity);

        let mut state = Vec::with_capacity(capacity);
        state.resize_with(capacity, || AtomicU8::new(SlotState::Empty as u8));

        let mut data = Vec::with_capacity(capacity);
        data.resize_with(capacity, || UnsafeCell::new(MaybeUninit::uninit()));

        Self {
            pre_read: CachePadded::new(AtomicUsize::new(0)),
            read_slot: CachePadded::new(AtomicUsize::new(0)),
            written: CachePadded::new(AtomicUsize::new(0)),
            write_slot: UnsafeCell::new(0),
            next: ArcSwapOption::const_empty(),
            invalidated: AtomicBool::new(false),
            mask: capacity - 1,
            state: state.into_boxed_slice(),
            data: data.into_boxed_slice(),
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Items in this buffer and its successor chain. An estimate.
    pub(crate) fn size(&self) -> usize {
        let read = self.read_slot.load(Ordering::Relaxed);
        let mut size = self.written.load(Ordering::Relaxed).wrapping_sub(read);

        if let Some(next) = self.next.load_full() {
            size += next.size();
        }

        size
    }

    /// A buffer is active while consumers should stay on it: it either has no
    /// successor yet, or still holds unconsumed items.
    pub(crate) fn is_active(&self) -> bool {
        self.next.load().is_none()
            || self.read_slot.load(Ordering::Acquire) != self.written.load(Ordering::Acquire)
    }

    /// False once `invalidate` ran; the owning producer must reinitialize.
    pub(crate) fn is_valid(&self) -> bool {
        !self.invalidated.load(Ordering::Relaxed)
    }

    /// Poison the producer's next write slot and every successor. Not
    /// concurrency safe; used by `unsafe_reset`.
    pub(crate) fn invalidate(&self) {
        // SAFETY: caller guarantees the owning producer is not pushing.
        let write_slot = unsafe { *self.write_slot.get() };
        self.state[write_slot & self.mask].store(SlotState::Dummy as u8, Ordering::Relaxed);
        self.invalidated.store(true, Ordering::Relaxed);

        if let Some(next) = self.next.load_full() {
            next.invalidate();
        }
    }

    // ---------------------------------------------------------------------
    // PRODUCER API (owning thread only)
    // ---------------------------------------------------------------------

    /// Push onto the ring. On a full (or poisoned) buffer the value is handed
    /// back untouched so the caller can chain a successor and retry.
    ///
    /// Must only be called from the thread owning this buffer.
    pub(crate) fn try_push(&self, value: T) -> Result<(), T> {
        // SAFETY: write_slot is only accessed by the owning producer thread.
        let slot_total = unsafe { *self.write_slot.get() };
        let slot = slot_total & self.mask;

        // Acquire pairs with the consumer's Release store of `empty`: the
        // previous occupant is fully moved out before we overwrite the slot.
        if self.state[slot].load(Ordering::Acquire) != SlotState::Empty as u8 {
            return Err(value);
        }

        // SAFETY: the slot is empty, so no consumer touches it until
        // `written` is published past it; only this thread writes it.
        unsafe {
            *self.write_slot.get() = slot_total.wrapping_add(1);
            (*self.data[slot].get()).write(value);
        }

        self.state[slot].store(SlotState::Valid as u8, Ordering::Release);

        // Publish: the fence orders the item write before the watermark for
        // consumers that acquire-fence after loading `written`.
        fence(Ordering::Release);
        self.written.store(slot_total.wrapping_add(1), Ordering::Relaxed);

        Ok(())
    }

    /// Chain `new_buffer` at the tail of the successor list.
    ///
    /// Must only be called from the thread owning this buffer.
    pub(crate) fn push_front(&self, new_buffer: Arc<ProducerBuffer<T>>) {
        let mut last = match self.next.load_full() {
            None => {
                self.next.store(Some(new_buffer));
                return;
            }
            Some(next) => next,
        };

        loop {
            match last.next.load_full() {
                Some(next) => last = next,
                None => {
                    last.next.store(Some(new_buffer));
                    return;
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // CONSUMER API
    // ---------------------------------------------------------------------

    /// Pop one item. `None` means the published window is exhausted; the
    /// caller should relocate to another producer or give up.
    pub(crate) fn try_pop(&self) -> Option<T> {
        let last_written = self.written.load(Ordering::Relaxed);

        // Pairs with the producer's Release fence before publishing.
        fence(Ordering::Acquire);

        let reserved = self.pre_read.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let available = last_written.wrapping_sub(reserved);

        // Wrap-aware: a reservation beyond the watermark wraps to a huge
        // value and lands here.
        if self.capacity() < available {
            self.pre_read.fetch_sub(1, Ordering::Relaxed);
            return None;
        }

        let read_total = self.read_slot.fetch_add(1, Ordering::Relaxed);
        let slot = read_total & self.mask;

        debug_assert_reservation_window!(read_total, last_written);
        debug_assert_slot_valid!(self.state[slot].load(Ordering::Relaxed), slot);

        // SAFETY: the reservation establishes read_total < written, so the
        // producer published this slot as valid; exactly one consumer claims
        // each read total.
        let value = unsafe { (*self.data[slot].get()).assume_init_read() };

        self.state[slot].store(SlotState::Empty as u8, Ordering::Release);

        Some(value)
    }

    /// Walk the successor chain for the first buffer holding items. `None`
    /// when this buffer itself still has items, or the chain is drained.
    pub(crate) fn find_back(&self) -> Option<Arc<ProducerBuffer<T>>> {
        if self.read_slot.load(Ordering::Relaxed) != self.written.load(Ordering::Acquire) {
            return None;
        }

        let mut back = self.next.load_full();
        while let Some(buffer) = &back {
            if buffer.read_slot.load(Ordering::Relaxed) != buffer.written.load(Ordering::Acquire) {
                break;
            }
            match buffer.next.load_full() {
                Some(next) => back = Some(next),
                None => return None,
            }
        }

        back
    }

    // ---------------------------------------------------------------------
    // NON-CONCURRENT ADMIN
    // ---------------------------------------------------------------------

    /// Logically remove all entries in this buffer and its successors,
    /// dropping unconsumed items. Not concurrency safe.
    pub(crate) fn unsafe_clear(&self) {
        let written = self.written.load(Ordering::Relaxed);
        let mut read = self.read_slot.load(Ordering::Relaxed);

        while read != written {
            let slot = read & self.mask;
            // SAFETY: caller guarantees exclusivity; slots in [read, written)
            // hold initialized items.
            unsafe { (*self.data[slot].get()).assume_init_drop() };
            self.state[slot].store(SlotState::Empty as u8, Ordering::Relaxed);
            read = read.wrapping_add(1);
        }

        self.pre_read.store(written, Ordering::Relaxed);
        self.read_slot.store(written, Ordering::Relaxed);

        if let Some(next) = self.next.load_full() {
            next.unsafe_clear();
        }
    }
}

impl<T> Drop for ProducerBuffer<T> {
    fn drop(&mut self) {
        // Drop unconsumed items between the read cursor and the watermark
        let written = self.written.load(Ordering::Relaxed);
        let mut read = self.read_slot.load(Ordering::Relaxed);

        while read != written {
            let slot = read & self.mask;
            // SAFETY: exclusive access in drop; [read, written) is initialized.
            unsafe { (*self.data[slot].get()).assume_init_drop() };
            read = read.wrapping_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_roundtrip() {
        let buffer = ProducerBuffer::<u64>::new(8);

        for i in 0..8 {
            assert!(buffer.try_push(i).is_ok());
        }
        assert_eq!(buffer.size(), 8);

        for i in 0..8 {
            assert_eq!(buffer.try_pop(), Some(i));
        }
        assert_eq!(buffer.try_pop(), None);
        assert_eq!(buffer.size(), 0);
    }

    #[test]
    fn test_full_buffer_hands_value_back() {
        let buffer = ProducerBuffer::<u64>::new(4);

        for i in 0..4 {
            assert!(buffer.try_push(i).is_ok());
        }
        assert_eq!(buffer.try_push(99), Err(99));

        // Draining one slot makes room again
        assert_eq!(buffer.try_pop(), Some(0));
        assert!(buffer.try_push(99).is_ok());
    }

    #[test]
    fn test_slot_cycles_through_generations() {
        let buffer = ProducerBuffer::<u64>::new(4);

        // Several full ring generations through the same slots
        for round in 0..5 {
            for i in 0..4 {
                assert!(buffer.try_push(round * 10 + i).is_ok());
            }
            for i in 0..4 {
                assert_eq!(buffer.try_pop(), Some(round * 10 + i));
            }
        }
    }

    #[test]
    fn test_successor_chain() {
        let buffer = Arc::new(ProducerBuffer::<u64>::new(4));
        let successor = Arc::new(ProducerBuffer::<u64>::new(8));
        let tail = Arc::new(ProducerBuffer::<u64>::new(16));

        buffer.push_front(Arc::clone(&successor));
        buffer.push_front(Arc::clone(&tail));

        assert!(successor.try_push(7).is_ok());

        // Drained front with a non-empty successor is no longer active
        assert!(!buffer.is_active());
        let back = buffer.find_back().expect("successor holds an item");
        assert!(Arc::ptr_eq(&back, &successor));

        // A buffer with items is active regardless of successors
        assert!(successor.is_active());
        assert_eq!(buffer.size(), 1);
    }

    #[test]
    fn test_find_back_skips_drained_chain() {
        let buffer = Arc::new(ProducerBuffer::<u64>::new(4));
        let successor = Arc::new(ProducerBuffer::<u64>::new(8));
        buffer.push_front(Arc::clone(&successor));

        // Whole chain empty: nothing to adopt
        assert!(buffer.find_back().is_none());

        // Items in front: stay here
        assert!(buffer.try_push(1).is_ok());
        assert!(buffer.find_back().is_none());
    }

    #[test]
    fn test_invalidate_poisons_push() {
        let buffer = ProducerBuffer::<u64>::new(4);
        assert!(buffer.is_valid());

        buffer.invalidate();
        assert!(!buffer.is_valid());
        assert_eq!(buffer.try_push(1), Err(1));
    }

    #[test]
    fn test_unsafe_clear_drops_items() {
        use std::sync::atomic::AtomicUsize;

        static DROP_COUNT: AtomicUsize = AtomicUsize::new(0);

        struct DropTracker;
        impl Drop for DropTracker {
            fn drop(&mut self) {
                DROP_COUNT.fetch_add(1, Ordering::SeqCst);
            }
        }

        DROP_COUNT.store(0, Ordering::SeqCst);

        let buffer = ProducerBuffer::<DropTracker>::new(8);
        for _ in 0..5 {
            assert!(buffer.try_push(DropTracker).is_ok());
        }
        drop(buffer.try_pop());
        assert_eq!(DROP_COUNT.load(Ordering::SeqCst), 1);

        buffer.unsafe_clear();
        assert_eq!(DROP_COUNT.load(Ordering::SeqCst), 5);
        assert_eq!(buffer.size(), 0);
    }

    #[test]
    fn test_drop_releases_unconsumed_items() {
        use std::sync::atomic::AtomicUsize;

        static DROP_COUNT: AtomicUsize = AtomicUsize::new(0);

        struct DropTracker;
        impl Drop for DropTracker {
            fn drop(&mut self) {
                DROP_COUNT.fetch_add(1, Ordering::SeqCst);
            }
        }

        DROP_COUNT.store(0, Ordering::SeqCst);

        {
            let buffer = ProducerBuffer::<DropTracker>::new(8);
            for _ in 0..3 {
                assert!(buffer.try_push(DropTracker).is_ok());
            }
        }
        assert_eq!(DROP_COUNT.load(Ordering::SeqCst), 3);
    }
}
