//! Debug assertion macros for pipeline invariants.
//!
//! Only active in debug builds (`debug_assert!`), so release builds pay
//! nothing for them.

// =============================================================================
// Bundling
// =============================================================================

/// Assert that a bundle is closed only when one of its thresholds is met,
/// or on a forced flush.
///
/// Used in: `Bundler::close()`
macro_rules! debug_assert_bundle_closed_on_threshold {
    ($reason:expr, $count:expr, $bytes:expr, $config:expr) => {
        debug_assert!(
            match $reason {
                $crate::bundle::CloseReason::Count => $count >= $config.count_threshold,
                $crate::bundle::CloseReason::Bytes => $bytes >= $config.byte_threshold,
                $crate::bundle::CloseReason::Age | $crate::bundle::CloseReason::Flush => $count > 0,
            },
            "bundle closed as {:?} with {} items / {} bytes",
            $reason,
            $count,
            $bytes
        )
    };
}

/// Assert that bundle sequence numbers strictly increase in close order.
///
/// Used in: `Batcher::seal()`
macro_rules! debug_assert_sequence_monotonic {
    ($previous:expr, $next:expr) => {
        debug_assert!(
            $previous.map_or(true, |p: u64| $next > p),
            "bundle sequence went backwards: {:?} -> {}",
            $previous,
            $next
        )
    };
}

// =============================================================================
// Export
// =============================================================================

/// Assert that a bundle never exceeds its attempt budget.
///
/// Used in: `ExporterClient::export()` retry loop
macro_rules! debug_assert_attempts_bounded {
    ($attempt:expr, $max:expr) => {
        debug_assert!(
            $attempt <= $max,
            "export attempt {} exceeds max_retry_attempts {}",
            $attempt,
            $max
        )
    };
}

/// Assert that an attributed delivery accounts for every item of the bundle.
///
/// Used in: `ExporterClient::export()` on partial acceptance
macro_rules! debug_assert_delivery_attributed {
    ($accepted:expr, $rejected:expr, $len:expr) => {
        debug_assert!(
            $accepted + $rejected == $len,
            "delivery attributes {} + {} items of a {}-item bundle",
            $accepted,
            $rejected,
            $len
        )
    };
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Assert that the scheduler only moves forward through its states.
///
/// Used in: `Scheduler::transition()`
macro_rules! debug_assert_forward_transition {
    ($from:expr, $to:expr) => {
        debug_assert!(
            ($to as u8) > ($from as u8),
            "scheduler moved backwards: {:?} -> {:?}",
            $from,
            $to
        )
    };
}

pub(crate) use debug_assert_attempts_bounded;
pub(crate) use debug_assert_bundle_closed_on_threshold;
pub(crate) use debug_assert_delivery_attributed;
pub(crate) use debug_assert_forward_transition;
pub(crate) use debug_assert_sequence_monotonic;
