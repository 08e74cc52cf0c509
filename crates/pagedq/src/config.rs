use crate::progress::{Cardinality, Consistency};

/// Configuration for a heterogeneous queue.
///
/// Cardinality and consistency are selected at construction and resolved at
/// the few protocol points that differ (plain store vs. compare-exchange on
/// the tail, the claim and the head advance).
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// How many threads may push concurrently.
    pub producers: Cardinality,
    /// How many threads may consume concurrently.
    pub consumers: Cardinality,
    /// Visibility order observed by consumers.
    pub consistency: Consistency,
}

impl QueueConfig {
    /// Creates a configuration with explicit settings.
    pub const fn new(
        producers: Cardinality,
        consumers: Cardinality,
        consistency: Consistency,
    ) -> Self {
        Self {
            producers,
            consumers,
            consistency,
        }
    }

    /// Returns the same configuration with relaxed consistency.
    pub const fn relaxed(mut self) -> Self {
        self.consistency = Consistency::Relaxed;
        self
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        MPMC_CONFIG
    }
}

/// Any number of producers and consumers, sequential consistency.
pub const MPMC_CONFIG: QueueConfig = QueueConfig::new(
    Cardinality::Multi,
    Cardinality::Multi,
    Consistency::Sequential,
);

/// One producer, one consumer; both sides use plain stores.
pub const SPSC_CONFIG: QueueConfig = QueueConfig::new(
    Cardinality::Single,
    Cardinality::Single,
    Consistency::Sequential,
);

/// Many producers, one consumer.
pub const MPSC_CONFIG: QueueConfig = QueueConfig::new(
    Cardinality::Multi,
    Cardinality::Single,
    Consistency::Sequential,
);

/// One producer, many consumers.
pub const SPMC_CONFIG: QueueConfig = QueueConfig::new(
    Cardinality::Single,
    Cardinality::Multi,
    Consistency::Sequential,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_mpmc_sequential() {
        let c = QueueConfig::default();
        assert_eq!(c.producers, Cardinality::Multi);
        assert_eq!(c.consumers, Cardinality::Multi);
        assert_eq!(c.consistency, Consistency::Sequential);
    }

    #[test]
    fn test_relaxed_keeps_cardinality() {
        let c = MPSC_CONFIG.relaxed();
        assert_eq!(c.producers, Cardinality::Multi);
        assert_eq!(c.consumers, Cardinality::Single);
        assert_eq!(c.consistency, Consistency::Relaxed);
    }
}
