/// Progress guarantee selected per call.
///
/// Every queue and page-manager operation comes in flavors that trade
/// completion certainty for boundedness:
///
/// - `Blocking`: always completes (or panics on unrecoverable OOM). May spin
///   on contended slots and may call into the host allocator to grow a
///   memory region.
/// - `LockFree`: never blocks. May fail under contention or when no memory
///   is immediately available, but a failed attempt implies some other
///   thread made progress.
/// - `WaitFree`: a bounded number of atomic operations. Fails rather than
///   retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressGuarantee {
    /// May block and may allocate from the host.
    Blocking,
    /// Never blocks; may report transient failure under contention.
    LockFree,
    /// Bounded retries; reports failure instead of looping.
    WaitFree,
}

impl ProgressGuarantee {
    /// Whether this flavor is allowed to request new memory regions from the
    /// host allocator.
    #[inline]
    pub(crate) fn allows_region_growth(self) -> bool {
        matches!(self, Self::Blocking)
    }

    /// Whether a failed atomic attempt should be retried.
    #[inline]
    pub(crate) fn allows_retry(self) -> bool {
        !matches!(self, Self::WaitFree)
    }
}

/// How many threads may drive one side (producer or consumer) of a queue.
///
/// `Single` replaces the CAS protocol on that side with plain atomic stores.
/// Single-cardinality sides are only reachable through the exclusive
/// [`crate::Producer`] / [`crate::Consumer`] handles, which is what makes the
/// plain-store protocol sound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// Exactly one thread at a time.
    Single,
    /// Any number of threads.
    Multi,
}

/// Visibility order observed by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    /// Consumers observe values in producer-observed push order. A slot being
    /// produced blocks the consume walk until it is committed.
    Sequential,
    /// Per-producer order is preserved, but consumers may claim a committed
    /// value past a slot another producer is still committing. Cross-producer
    /// order is unspecified.
    Relaxed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_growth_only_when_blocking() {
        assert!(ProgressGuarantee::Blocking.allows_region_growth());
        assert!(!ProgressGuarantee::LockFree.allows_region_growth());
        assert!(!ProgressGuarantee::WaitFree.allows_region_growth());
    }

    #[test]
    fn test_wait_free_never_retries() {
        assert!(ProgressGuarantee::Blocking.allows_retry());
        assert!(ProgressGuarantee::LockFree.allows_retry());
        assert!(!ProgressGuarantee::WaitFree.allows_retry());
    }
}
