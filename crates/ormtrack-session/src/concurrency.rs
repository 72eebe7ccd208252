//! Overlapping-use detection.
//!
//! A session has a single logical owner. Rather than locking, every public
//! mutating operation passes through an entry/exit counter; finding the
//! counter already raised means the session is being re-entered (from a
//! tracking listener or an entity accessor) or a second asynchronous save was
//! started while the first is suspended on the gateway.

use std::cell::Cell;

use ormtrack_core::{Error, Result};

/// Entry/exit counter around public mutating operations.
#[derive(Debug, Default)]
pub(crate) struct ConcurrencyDetector {
    depth: Cell<usize>,
    detecting: Cell<bool>,
}

impl ConcurrencyDetector {
    /// Enter a mutating operation.
    pub(crate) fn enter(&self, operation: &'static str) -> Result<OperationGuard<'_>> {
        if self.detecting.get() {
            // Anything invoked from inside a detection pass is re-entrant.
            if operation == "detect_changes" {
                return Err(Error::RecursiveDetection);
            }
            return Err(Error::ConcurrentAccess { operation });
        }
        if self.depth.get() > 0 {
            tracing::warn!(operation, "Session re-entered while busy");
            return Err(Error::ConcurrentAccess { operation });
        }
        self.depth.set(self.depth.get() + 1);
        Ok(OperationGuard { detector: self })
    }

    /// Flag a running detection pass for the lifetime of the guard.
    pub(crate) fn detecting(&self) -> DetectionGuard<'_> {
        let previous = self.detecting.replace(true);
        DetectionGuard {
            detector: self,
            previous,
        }
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.depth.get() > 0
    }
}

/// Releases the operation counter on drop.
#[derive(Debug)]
pub(crate) struct OperationGuard<'a> {
    detector: &'a ConcurrencyDetector,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        let depth = self.detector.depth.get();
        self.detector.depth.set(depth.saturating_sub(1));
    }
}

/// Clears the detection flag on drop.
#[derive(Debug)]
pub(crate) struct DetectionGuard<'a> {
    detector: &'a ConcurrencyDetector,
    previous: bool,
}

impl Drop for DetectionGuard<'_> {
    fn drop(&mut self) {
        self.detector.detecting.set(self.previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_enter_is_concurrent_access() {
        let d = ConcurrencyDetector::default();
        let _g = d.enter("add").unwrap();
        assert!(d.is_busy());
        assert_eq!(
            d.enter("attach").unwrap_err(),
            Error::ConcurrentAccess {
                operation: "attach"
            }
        );
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let d = ConcurrencyDetector::default();
        {
            let _g = d.enter("add").unwrap();
        }
        assert!(!d.is_busy());
        assert!(d.enter("add").is_ok());
    }

    #[test]
    fn test_detect_during_detection_is_recursive() {
        let d = ConcurrencyDetector::default();
        let _g = d.enter("detect_changes").unwrap();
        let _det = d.detecting();
        assert_eq!(
            d.enter("detect_changes").unwrap_err(),
            Error::RecursiveDetection
        );
        assert!(matches!(
            d.enter("remove").unwrap_err(),
            Error::ConcurrentAccess { .. }
        ));
    }

    #[test]
    fn test_session_usable_after_recursive_detection() {
        let d = ConcurrencyDetector::default();
        {
            let _g = d.enter("detect_changes").unwrap();
            let _det = d.detecting();
            assert!(d.enter("detect_changes").is_err());
        }
        assert!(d.enter("detect_changes").is_ok());
    }
}
