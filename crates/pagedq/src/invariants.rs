//! Debug assertion macros for the slot state machine.
//!
//! Only active in debug builds (`debug_assert!`), zero overhead in release.
//! Used by the tail, the head, and the page manager.

// =============================================================================
// INV-SLOT-01: Busy and Dead are mutually exclusive
// =============================================================================

/// Assert that a `next` word does not carry `BUSY` and `DEAD` together.
macro_rules! debug_assert_busy_dead_exclusive {
    ($word:expr) => {
        debug_assert!(
            ($word) & (crate::layout::BUSY | crate::layout::DEAD)
                != (crate::layout::BUSY | crate::layout::DEAD),
            "INV-SLOT-01 violated: next word {:#x} is both busy and dead",
            $word
        )
    };
}

// =============================================================================
// INV-SLOT-02: Dead is sticky
// =============================================================================

/// Assert that a transition on a `next` word never clears `DEAD`.
macro_rules! debug_assert_dead_sticky {
    ($old:expr, $new:expr) => {
        debug_assert!(
            ($old) & crate::layout::DEAD == 0 || ($new) & crate::layout::DEAD != 0,
            "INV-SLOT-02 violated: transition {:#x} -> {:#x} cleared the dead flag",
            $old,
            $new
        )
    };
}

// =============================================================================
// INV-SLOT-03: Control blocks sit on allocation-granularity boundaries
// =============================================================================

/// Assert that a control-block address is a multiple of the granularity.
macro_rules! debug_assert_granular {
    ($addr:expr, $granularity:expr) => {
        debug_assert!(
            ($addr) % ($granularity) == 0,
            "INV-SLOT-03 violated: control block {:#x} not aligned to {}",
            $addr,
            $granularity
        )
    };
}

// =============================================================================
// INV-PIN-01: Pin counts are balanced
// =============================================================================

/// Assert that an unpin had a matching pin.
macro_rules! debug_assert_pin_balanced {
    ($previous:expr) => {
        debug_assert!(
            $previous > 0,
            "INV-PIN-01 violated: unpinning a page with pin count 0"
        )
    };
}

// =============================================================================
// INV-CLAIM-01: A claimed slot is busy and nothing else terminal
// =============================================================================

/// Assert that the word held by an in-flight consume is busy and not dead.
macro_rules! debug_assert_claim_held {
    ($word:expr) => {
        debug_assert!(
            ($word) & crate::layout::BUSY != 0 && ($word) & crate::layout::DEAD == 0,
            "INV-CLAIM-01 violated: in-flight consume holds word {:#x}",
            $word
        )
    };
}

// =============================================================================
// Re-exports for crate-internal use
// =============================================================================

pub(crate) use debug_assert_busy_dead_exclusive;
pub(crate) use debug_assert_claim_held;
pub(crate) use debug_assert_dead_sticky;
pub(crate) use debug_assert_granular;
pub(crate) use debug_assert_pin_balanced;
