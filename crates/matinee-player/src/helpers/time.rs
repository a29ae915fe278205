// crates/matinee-player/src/helpers/time.rs

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic wall time in seconds, measured from the first call in this
/// process. All clock bases and sync timestamps share this epoch.
pub(crate) fn system_time() -> f64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_system_time_is_monotonic() {
        let a = system_time();
        std::thread::sleep(Duration::from_millis(5));
        let b = system_time();
        assert!(b > a);
        assert!(b - a < 1.0);
    }
}
