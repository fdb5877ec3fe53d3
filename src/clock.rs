//! Injectable time source.

use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Longest offset [`saturating_add`] will apply.
const MAX_HORIZON: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `time + by`, capped at a century ahead instead of overflowing.
pub fn saturating_add(time: SystemTime, by: Duration) -> SystemTime {
    time.checked_add(by.min(MAX_HORIZON)).unwrap_or(time)
}

/// Source of current UTC time.
pub trait Clock: Send + Sync {
    /// The current time.
    fn now(&self) -> SystemTime;
}

/// Wall clock backed by [`SystemTime::now`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same underlying time, so a test can keep a handle while
/// the service owns another.
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Arc<RwLock<SystemTime>>,
}

impl ManualClock {
    /// Start the clock at `time`.
    pub fn new(time: SystemTime) -> Self {
        Self {
            now: Arc::new(RwLock::new(time)),
        }
    }

    /// Start the clock at `secs` seconds after the unix epoch.
    pub fn at_unix(secs: u64) -> Self {
        Self::new(UNIX_EPOCH + Duration::from_secs(secs))
    }

    /// Jump to `time`.
    pub fn set(&self, time: SystemTime) {
        let mut now = self.now.write().unwrap_or_else(|e| e.into_inner());
        *now = time;
    }

    /// Jump to `secs` seconds after the unix epoch.
    pub fn set_unix(&self, secs: u64) {
        self.set(UNIX_EPOCH + Duration::from_secs(secs));
    }

    /// Move forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.read().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saturating_add_caps_huge_offsets() {
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        assert_eq!(
            saturating_add(now, Duration::from_secs(60)),
            now + Duration::from_secs(60)
        );
        assert_eq!(saturating_add(now, Duration::MAX), now + MAX_HORIZON);
        assert_eq!(
            saturating_add(now, Duration::from_secs(u64::MAX)),
            now + MAX_HORIZON
        );
    }

    #[test]
    fn test_manual_clock_shares_time_between_clones() {
        let clock = ManualClock::at_unix(100);
        let handle = clock.clone();

        handle.advance(Duration::from_secs(30));
        assert_eq!(clock.now(), UNIX_EPOCH + Duration::from_secs(130));

        handle.set_unix(5);
        assert_eq!(clock.now(), UNIX_EPOCH + Duration::from_secs(5));
    }

    #[test]
    fn test_system_clock_is_after_epoch() {
        assert!(SystemClock.now() > UNIX_EPOCH);
    }
}
