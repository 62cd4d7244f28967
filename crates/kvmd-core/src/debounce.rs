use std::time::{Duration, Instant};

/// Stability-window debouncer for GPIO inputs: a new level is accepted
/// only after it has held steady for the whole window. Pure state machine,
/// driven by the reader thread's own clock.
pub struct Debouncer {
    value: bool,
    window: Duration,
    candidate: Option<(bool, Instant)>,
}

impl Debouncer {
    pub fn new(initial: bool, window: Duration) -> Self {
        Self {
            value: initial,
            window,
            candidate: None,
        }
    }

    pub fn get(&self) -> bool {
        self.value
    }

    /// Feed a raw sample. Returns the accepted value change, if any.
    pub fn submit(&mut self, raw: bool, now: Instant) -> Option<bool> {
        if self.window.is_zero() {
            self.candidate = None;
            if raw != self.value {
                self.value = raw;
                return Some(raw);
            }
            return None;
        }
        match self.candidate {
            _ if raw == self.value => {
                // Bounced back before the window elapsed.
                self.candidate = None;
                None
            }
            Some((pending, since)) if pending == raw => {
                if now.duration_since(since) >= self.window {
                    self.candidate = None;
                    self.value = raw;
                    Some(raw)
                } else {
                    None
                }
            }
            _ => {
                self.candidate = Some((raw, now));
                None
            }
        }
    }

    /// Re-check a pending candidate without a fresh sample (timeout tick).
    pub fn tick(&mut self, now: Instant) -> Option<bool> {
        if let Some((pending, since)) = self.candidate {
            if now.duration_since(since) >= self.window {
                self.candidate = None;
                self.value = pending;
                return Some(pending);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_level_is_accepted_after_window() {
        let start = Instant::now();
        let mut deb = Debouncer::new(false, Duration::from_millis(10));
        assert_eq!(deb.submit(true, start), None);
        assert_eq!(deb.submit(true, start + Duration::from_millis(5)), None);
        assert_eq!(deb.submit(true, start + Duration::from_millis(11)), Some(true));
        assert!(deb.get());
    }

    #[test]
    fn bounce_is_suppressed() {
        let start = Instant::now();
        let mut deb = Debouncer::new(false, Duration::from_millis(10));
        assert_eq!(deb.submit(true, start), None);
        assert_eq!(deb.submit(false, start + Duration::from_millis(2)), None);
        assert_eq!(deb.tick(start + Duration::from_millis(20)), None);
        assert!(!deb.get());
    }

    #[test]
    fn tick_promotes_pending_candidate() {
        let start = Instant::now();
        let mut deb = Debouncer::new(false, Duration::from_millis(10));
        assert_eq!(deb.submit(true, start), None);
        assert_eq!(deb.tick(start + Duration::from_millis(15)), Some(true));
    }

    #[test]
    fn zero_window_passes_through() {
        let start = Instant::now();
        let mut deb = Debouncer::new(false, Duration::ZERO);
        assert_eq!(deb.submit(true, start), Some(true));
        assert_eq!(deb.submit(true, start), None);
    }
}
