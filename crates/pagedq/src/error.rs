//! Error types for queue and page-manager operations.

use thiserror::Error;

/// Error returned by the non-blocking push flavors.
///
/// The value that failed to enter the queue is handed back inside the error,
/// like `std::sync::mpsc::TrySendError`.
#[derive(Error)]
pub enum TryPushError<T> {
    /// No page could be obtained under the selected progress guarantee.
    ///
    /// On the lock-free and wait-free flavors this covers both genuine
    /// exhaustion and "a region would have to be allocated, which this flavor
    /// may not do".
    #[error("page allocation failed")]
    OutOfMemory(T),

    /// Contention prevented completion within the bounds of the selected
    /// progress guarantee. Retrying (or falling back to the blocking flavor)
    /// is expected to succeed.
    #[error("transient contention on the queue tail")]
    Contended(T),
}

impl<T> TryPushError<T> {
    /// Recovers the value that was not pushed.
    pub fn into_inner(self) -> T {
        match self {
            Self::OutOfMemory(v) | Self::Contended(v) => v,
        }
    }

    /// Returns `true` if retrying the same call may succeed without falling
    /// back to a stronger progress guarantee.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Contended(_))
    }
}

// Manual Debug so that TryPushError<T> does not require T: Debug.
impl<T> core::fmt::Debug for TryPushError<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfMemory(_) => f.write_str("OutOfMemory(..)"),
            Self::Contended(_) => f.write_str("Contended(..)"),
        }
    }
}

/// Error returned by the two-phase transaction raw-block allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RawAllocError {
    /// No page could be obtained under the selected progress guarantee.
    #[error("page allocation failed")]
    OutOfMemory,

    /// Contention prevented completion within the selected bounds.
    #[error("transient contention on the queue tail")]
    Contended,
}

/// Internal failure of a reservation attempt, before a value is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReserveError {
    OutOfMemory,
    Contended,
}

impl ReserveError {
    pub(crate) fn with_value<T>(self, value: T) -> TryPushError<T> {
        match self {
            Self::OutOfMemory => TryPushError::OutOfMemory(value),
            Self::Contended => TryPushError::Contended(value),
        }
    }
}

impl From<ReserveError> for RawAllocError {
    fn from(e: ReserveError) -> Self {
        match e {
            ReserveError::OutOfMemory => Self::OutOfMemory,
            ReserveError::Contended => Self::Contended,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_inner_returns_value() {
        struct NoDebug(u32);
        let e = TryPushError::Contended(NoDebug(7));
        assert!(e.is_transient());
        assert_eq!(e.into_inner().0, 7);
    }

    #[test]
    fn test_oom_is_not_transient() {
        let e: TryPushError<i32> = TryPushError::OutOfMemory(1);
        assert!(!e.is_transient());
    }
}
