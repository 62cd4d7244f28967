use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Exclusive region guarding long-running component operations (image
/// writes, connect sequences). Entering an already-held region fails
/// instead of blocking so the HTTP edge can answer 409 right away.
#[derive(Clone)]
pub struct ExclusiveRegion {
    busy: Arc<AtomicBool>,
}

pub struct RegionGuard {
    busy: Arc<AtomicBool>,
}

impl ExclusiveRegion {
    pub fn new() -> Self {
        Self {
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns `None` if the region is already held.
    pub fn try_enter(&self) -> Option<RegionGuard> {
        if self.busy.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(RegionGuard {
                busy: self.busy.clone(),
            })
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl Default for ExclusiveRegion {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RegionGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_entry_fails_until_guard_drops() {
        let region = ExclusiveRegion::new();
        let guard = region.try_enter().unwrap();
        assert!(region.is_busy());
        assert!(region.try_enter().is_none());
        drop(guard);
        assert!(!region.is_busy());
        assert!(region.try_enter().is_some());
    }
}
