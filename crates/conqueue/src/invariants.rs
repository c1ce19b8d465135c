//! Debug assertion macros for container invariants.
//!
//! Runtime checks for the invariants the lock-free protocols rely on. They are
//! only active in debug builds (`debug_assert!`), so there is zero overhead in
//! release builds.
//!
//! Used by `ProducerBuffer<T>` and `PriorityQueue<K, V, H>`.

// =============================================================================
// INV-SLOT: Slot state cycle
// =============================================================================

/// Assert that a slot about to be consumed is in the `VALID` state.
///
/// **Invariant**: a slot cycles `empty -> valid -> empty`; a consumer that won
/// a reservation reads a slot that the owning producer published as valid.
///
/// Used in: `ProducerBuffer::try_pop()` before moving the item out
macro_rules! debug_assert_slot_valid {
    ($state:expr, $slot:expr) => {
        debug_assert!(
            $state == crate::ring::SlotState::Valid as u8,
            "slot {} consumed while in state {} (expected valid)",
            $slot,
            $state
        )
    };
}

// =============================================================================
// INV-RESV: Reservation window
// =============================================================================

/// Assert that a claimed read slot lies below the published write watermark.
///
/// **Invariant**: `read_slot < written` for every successful reservation; the
/// pre-read counter admits at most `written - read_slot` consumers.
///
/// Used in: `ProducerBuffer::try_pop()` after claiming a read slot
macro_rules! debug_assert_reservation_window {
    ($read_total:expr, $written:expr) => {
        debug_assert!(
            $written.wrapping_sub($read_total) != 0,
            "read slot {} claimed at or beyond write watermark {}",
            $read_total,
            $written
        )
    };
}

// =============================================================================
// INV-VER: Version values
// =============================================================================

/// Assert that a computed link version is not the distinguished unflagged
/// value.
///
/// **Invariant**: version arithmetic wraps around zero; a flag or generation
/// step never produces version 0.
///
/// Used in: `PriorityQueue::flag_node()` and `PriorityQueue::delink_front()`
macro_rules! debug_assert_nonzero_version {
    ($version:expr) => {
        debug_assert!(
            $version != 0,
            "version arithmetic produced the unflagged value"
        )
    };
}

// =============================================================================
// INV-CAP: Power-of-two capacity
// =============================================================================

/// Assert that a buffer capacity is a nonzero power of two.
///
/// **Invariant**: slot indexes are computed with `& (capacity - 1)`.
///
/// Used in: `ProducerBuffer::new()`
macro_rules! debug_assert_pow2 {
    ($capacity:expr) => {
        debug_assert!(
            $capacity != 0 && ($capacity & ($capacity - 1)) == 0,
            "buffer capacity {} is not a power of two",
            $capacity
        )
    };
}

// =============================================================================
// Re-exports for crate-internal use
// =============================================================================

pub(crate) use debug_assert_nonzero_version;
pub(crate) use debug_assert_pow2;
pub(crate) use debug_assert_reservation_window;
pub(crate) use debug_assert_slot_valid;
