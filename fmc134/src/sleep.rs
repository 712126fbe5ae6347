//! Blocking delays used for polling and settle times

use std::time::Duration;

/// A trait for sleep operations.
///
/// Every wait in the bus protocol and in the bring-up sequences goes through this, so a
/// test harness can observe the waits instead of actually blocking.
pub trait Sleep {
    /// Block the caller for `duration`
    fn sleep(&self, duration: Duration);
}

impl Sleep for Box<dyn Sleep + Send> {
    fn sleep(&self, duration: Duration) {
        self.as_ref().sleep(duration);
    }
}

/// A sleeper that uses [`std::thread::sleep`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StdSleeper;

impl Sleep for StdSleeper {
    fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        std::thread::sleep(duration);
    }
}
