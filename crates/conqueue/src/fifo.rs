use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam_utils::CachePadded;

use crate::metrics::{Metrics, MetricsSnapshot};
use crate::ring::{ProducerBuffer, BUFFER_CAPACITY_MAX, INITIAL_PRODUCER_CAPACITY};
use crate::tls::ThreadLocalMember;

/// Pops a consumer performs on one producer before it is forced to relocate,
/// so a busy producer cannot starve the others.
const CONSUMER_FORCE_RELOCATION_POP_COUNT: u16 = 24;

/// Growable array of producer-buffer handles.
///
/// Grown by copy-over to a swap array; entries already claimed keep their
/// index across growth.
struct SlotArray<T> {
    slots: Box<[ArcSwapOption<ProducerBuffer<T>>]>,
}

impl<T> SlotArray<T> {
    fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, ArcSwapOption::const_empty);
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Consumer-side thread-local state: the affinity buffer, a snapshot of the
/// producer array, and the forced-relocation pop counter.
struct ConsumerSlot<T> {
    buffer: Option<Arc<ProducerBuffer<T>>>,
    last_known: Option<Arc<SlotArray<T>>>,
    pop_counter: u16,
}

impl<T> Default for ConsumerSlot<T> {
    fn default() -> Self {
        Self {
            buffer: None,
            last_known: None,
            pop_counter: 0,
        }
    }
}

/// Raw pointer identity of an optional shared handle; the comparison the
/// swap-and-copy protocol CASes on.
fn handle_ptr<T>(handle: &Option<Arc<T>>) -> *const T {
    handle.as_ref().map_or(std::ptr::null(), Arc::as_ptr)
}

/// MPMC unbounded lock-free queue. FIFO is respected within the context of
/// single producers.
///
/// Every producing thread owns a chain of single-producer ring buffers,
/// published through a growable shared array; consumers hold an affinity
/// buffer and relocate across producers when it drains. `size` and
/// `unsafe_size` are estimates, not linearizable.
pub struct FifoQueue<T: 'static> {
    /// Active producer array.
    slots: ArcSwapOption<SlotArray<T>>,
    /// Staging array during growth.
    slots_swap: ArcSwapOption<SlotArray<T>>,

    /// Producers visible to consumers: every index below this holds a fully
    /// published buffer.
    producer_count: CachePadded<AtomicU16>,
    /// Rotation point for consumer relocation.
    relocation_index: CachePadded<AtomicU16>,

    /// Claimed producer indexes.
    slot_reservation: AtomicU16,
    /// Completed publications; promotes `producer_count` when it catches up
    /// with the reservation watermark.
    slot_post_reservation: AtomicU16,

    producer: ThreadLocalMember<Option<Arc<ProducerBuffer<T>>>>,
    consumer: ThreadLocalMember<ConsumerSlot<T>>,

    metrics: Metrics,
    enable_metrics: bool,
}

impl<T: Send + 'static> FifoQueue<T> {
    pub fn new() -> Self {
        Self::with_config(false)
    }

    /// A queue that counts pushes, pops, buffer growths, and consumer
    /// relocations; see [`metrics`](Self::metrics).
    pub fn with_metrics() -> Self {
        Self::with_config(true)
    }

    fn with_config(enable_metrics: bool) -> Self {
        Self {
            slots: ArcSwapOption::const_empty(),
            slots_swap: ArcSwapOption::const_empty(),
            producer_count: CachePadded::new(AtomicU16::new(0)),
            relocation_index: CachePadded::new(AtomicU16::new(0)),
            slot_reservation: AtomicU16::new(0),
            slot_post_reservation: AtomicU16::new(0),
            producer: ThreadLocalMember::new(|| None),
            consumer: ThreadLocalMember::new(ConsumerSlot::default),
            metrics: Metrics::new(),
            enable_metrics,
        }
    }

    // ---------------------------------------------------------------------
    // PRODUCER API
    // ---------------------------------------------------------------------

    /// Enqueue an item. Never blocks: a full buffer chains a successor of
    /// twice the capacity, a first push publishes a new producer.
    pub fn push(&self, value: T) {
        self.producer.with(|slot| self.push_internal(slot, value));
    }

    fn push_internal(&self, slot: &mut Option<Arc<ProducerBuffer<T>>>, value: T) {
        let value = match slot.as_ref() {
            Some(buffer) => match buffer.try_push(value) {
                Ok(()) => {
                    if self.enable_metrics {
                        self.metrics.add_push();
                    }
                    return;
                }
                Err(value) => value,
            },
            None => value,
        };

        match slot.as_ref() {
            Some(buffer) if buffer.is_valid() => self.add_producer_buffer(slot),
            _ => self.init_producer(slot, INITIAL_PRODUCER_CAPACITY),
        }

        let buffer = slot.as_ref().expect("producer was just initialized");
        let pushed = buffer.try_push(value);
        debug_assert!(pushed.is_ok(), "fresh producer buffer rejected a push");

        if self.enable_metrics {
            self.metrics.add_push();
        }
    }

    /// Ensure the calling thread's producer has at least `capacity` slots.
    pub fn reserve(&self, capacity: usize) {
        self.producer.with(|slot| match slot.as_ref() {
            Some(buffer) if buffer.is_valid() => {
                if buffer.capacity() < capacity {
                    let new_buffer = self.create_buffer(capacity);
                    buffer.push_front(Arc::clone(&new_buffer));
                    *slot = Some(new_buffer);
                }
            }
            _ => self.init_producer(slot, capacity),
        });
    }

    /// Chain a successor of twice the current capacity and move the
    /// thread-local handle onto it.
    fn add_producer_buffer(&self, slot: &mut Option<Arc<ProducerBuffer<T>>>) {
        let current = slot.as_ref().expect("grow requires a live producer");
        let next = self.create_buffer(current.capacity() * 2);
        current.push_front(Arc::clone(&next));
        *slot = Some(next);

        if self.enable_metrics {
            self.metrics.add_buffer_growth();
        }
    }

    /// First push on this thread: create a buffer, publish it in the root
    /// array, adopt it as the thread-local producer.
    fn init_producer(&self, slot: &mut Option<Arc<ProducerBuffer<T>>>, capacity: usize) {
        let buffer = self.create_buffer(capacity);
        self.push_producer_buffer(Arc::clone(&buffer));
        *slot = Some(buffer);
    }

    fn create_buffer(&self, capacity: usize) -> Arc<ProducerBuffer<T>> {
        let clamped = capacity.clamp(1, BUFFER_CAPACITY_MAX).next_power_of_two();
        Arc::new(ProducerBuffer::new(clamped))
    }

    // ---------------------------------------------------------------------
    // PRODUCER PUBLICATION PROTOCOL
    // ---------------------------------------------------------------------

    fn push_producer_buffer(&self, buffer: Arc<ProducerBuffer<T>>) {
        // Reserve an index and make sure the array can hold it
        let slot = self.claim_producer_slot();

        // Re-store to both the active and swap arrays until their
        // relationship has stabilized
        self.force_store_to_slot(&buffer, slot);

        // Synchronize with other producers: all indexes up to the watermark
        // are published before the count is promoted
        let post = self
            .slot_post_reservation
            .fetch_add(1, Ordering::AcqRel)
            .wrapping_add(1);
        let reserved = self.slot_reservation.load(Ordering::Relaxed);

        if post == reserved {
            self.try_swap_producer_count(post);
        }
    }

    fn claim_producer_slot(&self) -> u16 {
        let mut desired = self.slot_reservation.load(Ordering::Acquire);
        loop {
            assert!(desired < u16::MAX, "producer slots exhausted");
            self.ensure_slot_capacity(usize::from(desired) + 1);

            match self.slot_reservation.compare_exchange(
                desired,
                desired + 1,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return desired,
                Err(current) => desired = current,
            }
        }
    }

    fn ensure_slot_capacity(&self, min_capacity: usize) {
        let mut swap: Option<Arc<SlotArray<T>>> = None;

        loop {
            let active = self.slots.load_full();
            let active_len = active.as_ref().map_or(0, |a| a.len());
            if active_len >= min_capacity {
                break;
            }

            swap = self.slots_swap.load_full();
            let swap_len = swap.as_ref().map_or(0, |a| a.len());

            if swap_len < min_capacity {
                let grown_capacity = (min_capacity as f32 * 1.4) as usize;
                let grown = Arc::new(SlotArray::new(grown_capacity));
                let _ = self.slots_swap.compare_and_swap(&swap, Some(grown));
                continue;
            }

            // Copy live entries into the swap array; per-slot CAS so a slower
            // copier cannot clobber a newer publication
            if let (Some(active_array), Some(swap_array)) = (&active, &swap) {
                for (index, entry) in active_array.slots.iter().enumerate() {
                    if let Some(buffer) = entry.load_full() {
                        let _ = swap_array.slots[index]
                            .compare_and_swap(&None::<Arc<ProducerBuffer<T>>>, Some(buffer));
                    }
                }
            }

            // Promote swap to active; losers observe the new array and retry
            let previous = self.slots.compare_and_swap(&active, swap.clone());
            if handle_ptr(&previous) == handle_ptr(&active) {
                break;
            }
        }

        debug_assert!(self.slots.load().is_some());

        // Retire the staging array if it is still the one we promoted
        if swap.is_some() {
            let _ = self.slots_swap.compare_and_swap(&swap, None);
        }
    }

    fn force_store_to_slot(&self, buffer: &Arc<ProducerBuffer<T>>, slot: u16) {
        let index = usize::from(slot);
        loop {
            // Active array first: the claim guaranteed it can hold our index.
            // The swap view loaded after it may be newer or already retired.
            let active = self.slots.load_full();
            let swap = self.slots_swap.load_full();

            let active_array = active.as_ref().expect("claim ensured slot capacity");
            if !std::ptr::eq(handle_ptr(&active_array.slots[index].load_full()), Arc::as_ptr(buffer)) {
                active_array.slots[index].store(Some(Arc::clone(buffer)));
            }

            if let Some(swap_array) = &swap {
                if index < swap_array.len()
                    && !std::ptr::eq(
                        handle_ptr(&swap_array.slots[index].load_full()),
                        Arc::as_ptr(buffer),
                    )
                {
                    swap_array.slots[index].store(Some(Arc::clone(buffer)));
                }
            }

            // Repeat until our view of both arrays is up to date
            let stable = handle_ptr(&self.slots.load_full()) == handle_ptr(&active)
                && handle_ptr(&self.slots_swap.load_full()) == handle_ptr(&swap);
            if stable {
                break;
            }
        }
    }

    fn try_swap_producer_count(&self, to_value: u16) {
        let mut expected = self.producer_count.load(Ordering::Acquire);
        while expected < to_value {
            match self.producer_count.compare_exchange(
                expected,
                to_value,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => expected = current,
            }
        }
    }

    // ---------------------------------------------------------------------
    // CONSUMER API
    // ---------------------------------------------------------------------

    /// Dequeue an item from this thread's affinity producer, relocating
    /// across producers when it drains. `None` when no visible producer holds
    /// items.
    pub fn try_pop(&self) -> Option<T> {
        self.consumer.with(|consumer| self.try_pop_internal(consumer))
    }

    fn try_pop_internal(&self, consumer: &mut ConsumerSlot<T>) -> Option<T> {
        let value = loop {
            if let Some(buffer) = &consumer.buffer {
                if let Some(value) = buffer.try_pop() {
                    break value;
                }
            }
            if !self.relocate_consumer(consumer) {
                return None;
            }
        };

        // Forced relocation: do not let one producer monopolize this consumer
        if self.producer_count.load(Ordering::Relaxed) > 1 {
            consumer.pop_counter += 1;
            if consumer.pop_counter >= CONSUMER_FORCE_RELOCATION_POP_COUNT {
                self.relocate_consumer(consumer);
                consumer.pop_counter = 0;
            }
        }

        if self.enable_metrics {
            self.metrics.add_pop();
        }

        Some(value)
    }

    /// Rotate to the next visible producer holding items. Adopting a drained
    /// producer's successor also writes it back into the scanned slot so
    /// other consumers skip the drained chain prefix.
    fn relocate_consumer(&self, consumer: &mut ConsumerSlot<T>) -> bool {
        let producers = self.producer_count.load(Ordering::Acquire);

        if producers < 2 {
            if let Some(buffer) = &consumer.buffer {
                if buffer.is_valid() && buffer.is_active() {
                    return false;
                }
            }
            if producers == 0 {
                return false;
            }
        }

        let relocation = self.relocation_index.fetch_add(1, Ordering::Relaxed);

        // Refresh the array snapshot if the root array moved
        let current = self.slots.load_full();
        if handle_ptr(&consumer.last_known) != handle_ptr(&current) {
            consumer.last_known = current;
        }
        let Some(array) = consumer.last_known.as_ref() else {
            return false;
        };

        for visited in 0..producers {
            let entry = usize::from(relocation.wrapping_add(visited) % producers);

            let Some(mut buffer) = array.slots[entry].load_full() else {
                continue;
            };

            if buffer.size() == 0 {
                continue;
            }

            if !buffer.is_active() {
                if let Some(successor) = buffer.find_back() {
                    array.slots[entry].store(Some(Arc::clone(&successor)));
                    buffer = successor;
                }
            }

            consumer.buffer = Some(buffer);
            consumer.pop_counter = 0;

            if self.enable_metrics {
                self.metrics.add_consumer_relocation();
            }

            return true;
        }

        false
    }

    // ---------------------------------------------------------------------
    // SIZE & OBSERVABILITY
    // ---------------------------------------------------------------------

    /// Size hint: the sum of per-producer windows. Not linearizable.
    pub fn size(&self) -> usize {
        let producers = self.producer_count.load(Ordering::Acquire);
        let Some(array) = self.slots.load_full() else {
            return 0;
        };

        (0..usize::from(producers))
            .filter_map(|index| array.slots[index].load_full())
            .map(|buffer| buffer.size())
            .sum()
    }

    /// Fast size hint using relaxed loads and no array snapshot.
    pub fn unsafe_size(&self) -> usize {
        let producers = self.producer_count.load(Ordering::Relaxed);
        let array = self.slots.load();
        let Some(array) = array.as_ref() else {
            return 0;
        };

        let mut accumulated = 0;
        for entry in array.slots.iter().take(usize::from(producers)) {
            let buffer = entry.load();
            if let Some(buffer) = buffer.as_ref() {
                accumulated += buffer.size();
            }
        }
        accumulated
    }

    /// Operation counters; all zero unless built via
    /// [`with_metrics`](Self::with_metrics).
    pub fn metrics(&self) -> MetricsSnapshot {
        if self.enable_metrics {
            self.metrics.snapshot()
        } else {
            MetricsSnapshot::default()
        }
    }

    // ---------------------------------------------------------------------
    // NON-CONCURRENT ADMIN
    // ---------------------------------------------------------------------

    /// Logically remove all entries. Not concurrency safe.
    pub fn unsafe_clear(&self) {
        let producers = self.producer_count.load(Ordering::Relaxed);
        let Some(array) = self.slots.load_full() else {
            return;
        };

        for entry in array.slots.iter().take(usize::from(producers)) {
            if let Some(buffer) = entry.load_full() {
                buffer.unsafe_clear();
            }
        }
    }

    /// Reset the structure to its initial state. Not concurrency safe;
    /// surviving thread-local producer handles are invalidated and
    /// reinitialize on their next push.
    pub fn unsafe_reset(&self) {
        let producers = self.producer_count.load(Ordering::Relaxed);

        self.relocation_index.store(0, Ordering::Relaxed);
        self.producer_count.store(0, Ordering::Relaxed);
        self.slot_post_reservation.store(0, Ordering::Relaxed);
        self.slot_reservation.store(0, Ordering::Relaxed);

        if let Some(array) = self.slots.load_full() {
            for entry in array.slots.iter().take(usize::from(producers)) {
                if let Some(buffer) = entry.load_full() {
                    buffer.unsafe_clear();
                    buffer.invalidate();
                }
            }
        }

        self.slots.store(None);
        self.slots_swap.store(None);
    }
}

impl<T: Send + 'static> Default for FifoQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
