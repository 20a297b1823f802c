//! Cancellation support for long-running session loops.

use std::sync::atomic::{AtomicBool, Ordering};

/// A thread-safe cancellation flag shared between a session and its
/// controller.
///
/// The flag starts non-cancelled; once cancelled it cannot be reset.
/// Session loops poll it at fixed work intervals rather than per byte.
#[derive(Debug, Default)]
pub struct CancellationFlag(AtomicBool);

impl CancellationFlag {
    /// Create a flag in the non-cancelled state.
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// `true` once [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Error out if cancellation was requested.
    pub fn check(&self) -> Result<(), crate::Error> {
        if self.is_cancelled() {
            Err(crate::Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// The raw flag, for the pack parser's interrupt parameter.
    pub fn as_atomic(&self) -> &AtomicBool {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_not_cancelled() {
        let flag = CancellationFlag::new();
        assert!(!flag.is_cancelled());
        assert!(flag.check().is_ok());
    }

    #[test]
    fn cancel_is_sticky_and_checkable() {
        let flag = CancellationFlag::new();
        flag.cancel();
        assert!(flag.is_cancelled());
        assert!(matches!(flag.check(), Err(crate::Error::Cancelled)));
    }
}
