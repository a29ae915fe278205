// crates/matinee-player/src/clock.rs
//
// The shared presentation clock. One record holds the playback base in
// wall-clock seconds; the player and every decoder hold handles onto it.
// Writable handles move the base (play, resume, post-seek re-anchor);
// read-only handles just measure elapsed time against it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::helpers::time::system_time;

struct ClockValue {
    /// f64 seconds stored as bits; a single u64 store keeps cross-thread
    /// reads untorn without a lock.
    base_bits: AtomicU64,
    initialized: AtomicBool,
}

impl ClockValue {
    fn base(&self) -> f64 {
        f64::from_bits(self.base_bits.load(Ordering::Acquire))
    }

    fn set_base(&self, base: f64) {
        self.base_bits.store(base.to_bits(), Ordering::Release);
        self.initialized.store(true, Ordering::Release);
    }
}

pub(crate) struct PlaybackClock {
    value: Arc<ClockValue>,
    writable: bool,
}

impl PlaybackClock {
    /// Create the primary (writable) handle with an uninitialized base.
    pub fn primary() -> Self {
        Self {
            value: Arc::new(ClockValue {
                base_bits: AtomicU64::new(0f64.to_bits()),
                initialized: AtomicBool::new(false),
            }),
            writable: true,
        }
    }

    /// Another handle onto the same base, writable on request.
    pub fn secondary(&self, writable: bool) -> Self {
        Self { value: Arc::clone(&self.value), writable }
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_initialized(&self) -> bool {
        self.value.initialized.load(Ordering::Acquire)
    }

    /// Set the base to "now" unless it is already initialized.
    pub fn init_base(&self) {
        if self.writable && !self.is_initialized() {
            self.value.set_base(system_time());
        }
    }

    /// Force the base to "now": elapsed time restarts from zero.
    pub fn set_base(&self) {
        if self.writable {
            self.value.set_base(system_time());
        }
    }

    /// Re-anchor so that `elapsed()` equals `pts` right now. Decoders call
    /// this with the first decoded timestamp after a seek.
    pub fn adjust_base(&self, pts: f64) {
        if self.writable {
            self.value.set_base(system_time() - pts);
        }
    }

    /// Shift the base forward by `delta` seconds; used on resume to swallow
    /// the time spent paused.
    pub fn add_base(&self, delta: f64) {
        if self.writable {
            self.value.set_base(self.value.base() + delta);
        }
    }

    pub fn reset_base(&self) {
        if self.writable {
            self.value.initialized.store(false, Ordering::Release);
        }
    }

    /// Seconds of playback since the base.
    pub fn elapsed(&self) -> f64 {
        system_time() - self.value.base()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;
    use std::time::Duration;

    #[test]
    fn test_adjust_base_anchors_elapsed() {
        let clock = PlaybackClock::primary();
        clock.adjust_base(42.5);
        let elapsed = clock.elapsed();
        assert!((elapsed - 42.5).abs() < 0.001, "elapsed = {elapsed}");
    }

    #[test]
    fn test_pause_resume_preserves_elapsed() {
        let clock = PlaybackClock::primary();
        clock.set_base();
        std::thread::sleep(Duration::from_millis(30));
        let pause_started = system_time();
        std::thread::sleep(Duration::from_millis(50));
        clock.add_base(system_time() - pause_started);
        let elapsed = clock.elapsed();
        assert!(elapsed >= 0.025 && elapsed < 0.050, "elapsed = {elapsed}");
    }

    #[test]
    fn test_read_only_handle_cannot_move_base() {
        let clock = PlaybackClock::primary();
        clock.adjust_base(10.0);
        let reader = clock.secondary(false);
        reader.adjust_base(99.0);
        reader.set_base();
        assert!((clock.elapsed() - 10.0).abs() < 0.1);
    }

    #[test]
    fn test_secondary_writable_shares_base() {
        let clock = PlaybackClock::primary();
        let writer = clock.secondary(true);
        writer.adjust_base(5.0);
        assert!((clock.elapsed() - 5.0).abs() < 0.001);
    }

    #[test]
    fn test_handles_release_record_exactly_once() {
        let clock = PlaybackClock::primary();
        let weak: Weak<ClockValue> = Arc::downgrade(&clock.value);
        let a = clock.secondary(false);
        let b = clock.secondary(true);
        drop(clock);
        drop(a);
        assert!(weak.upgrade().is_some());
        drop(b);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_init_base_is_idempotent() {
        let clock = PlaybackClock::primary();
        clock.adjust_base(7.0);
        clock.init_base();
        assert!((clock.elapsed() - 7.0).abs() < 0.1);
        clock.reset_base();
        clock.init_base();
        assert!(clock.elapsed() < 0.1);
    }
}
