use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::JigglerState;

/// Anti-idle mouse jiggler bookkeeping. The pattern itself is emitted by
/// the facade's systask; this tracks the activity clock and mode.
pub struct Jiggler {
    inner: Mutex<Inner>,
}

struct Inner {
    enabled: bool,
    active: bool,
    interval: u64,
    absolute: bool,
    last: (i16, i16),
    activity: Instant,
}

pub enum Pattern {
    Absolute { x: i16, y: i16 },
    Relative,
}

impl Jiggler {
    pub fn new(enabled: bool, active: bool, interval: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                enabled,
                active: enabled && active,
                interval,
                absolute: true,
                last: (0, 0),
                activity: Instant::now(),
            }),
        }
    }

    /// Any user-originated event resets the idle clock.
    pub fn bump(&self) {
        self.inner.lock().activity = Instant::now();
    }

    pub fn remember_position(&self, x: i16, y: i16) {
        self.inner.lock().last = (x, y);
    }

    pub fn set_absolute(&self, absolute: bool) {
        self.inner.lock().absolute = absolute;
    }

    /// `enabled=false` hard-disables activation.
    pub fn set_active(&self, active: bool) {
        let mut inner = self.inner.lock();
        if inner.enabled {
            inner.active = active;
        }
    }

    pub fn state(&self) -> JigglerState {
        let inner = self.inner.lock();
        JigglerState {
            enabled: inner.enabled,
            active: inner.active,
            interval: inner.interval,
        }
    }

    /// Returns the pattern to emit when the idle gap exceeded the
    /// interval, `None` otherwise.
    pub fn due_pattern(&self) -> Option<Pattern> {
        let inner = self.inner.lock();
        if !inner.active {
            return None;
        }
        if inner.activity.elapsed() <= Duration::from_secs(inner.interval) {
            return None;
        }
        Some(if inner.absolute {
            Pattern::Absolute {
                x: inner.last.0,
                y: inner.last.1,
            }
        } else {
            Pattern::Relative
        })
    }

    #[cfg(test)]
    fn rewind_activity(&self, by: Duration) {
        let mut inner = self.inner.lock();
        inner.activity -= by;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_never_fires() {
        let jiggler = Jiggler::new(false, true, 1);
        jiggler.rewind_activity(Duration::from_secs(10));
        assert!(jiggler.due_pattern().is_none());
        jiggler.set_active(true);
        assert!(jiggler.due_pattern().is_none());
    }

    #[test]
    fn fires_after_idle_interval_and_bump_resets() {
        let jiggler = Jiggler::new(true, true, 1);
        assert!(jiggler.due_pattern().is_none());
        jiggler.rewind_activity(Duration::from_secs(2));
        assert!(jiggler.due_pattern().is_some());
        jiggler.bump();
        assert!(jiggler.due_pattern().is_none());
    }

    #[test]
    fn pattern_follows_mouse_mode() {
        let jiggler = Jiggler::new(true, true, 1);
        jiggler.remember_position(100, 200);
        jiggler.rewind_activity(Duration::from_secs(2));
        match jiggler.due_pattern() {
            Some(Pattern::Absolute { x: 100, y: 200 }) => {}
            _ => panic!("expected absolute pattern with last position"),
        }
        jiggler.set_absolute(false);
        jiggler.rewind_activity(Duration::from_secs(2));
        assert!(matches!(jiggler.due_pattern(), Some(Pattern::Relative)));
    }
}
