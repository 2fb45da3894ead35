use std::sync::atomic::{AtomicBool, Ordering};

/// Holds a single-flight flag for as long as it lives. Dropping the guard
/// releases the flag, so an early return, an error or a cancelled future can
/// never leave the flag set.
pub struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
  /// Returns `None` when another holder already owns the flag.
  pub fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
    flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).ok().map(|_| Self(flag))
  }
}

impl Drop for FlightGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}
