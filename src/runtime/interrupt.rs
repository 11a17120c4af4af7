// src/runtime/interrupt.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-virtual-user interrupt flag.
///
/// Starts clear, can be set at most once and is never reset. Clones share the same flag, so
/// a harness can keep a handle after the owning unit has moved into its task.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag {
  set: Arc<AtomicBool>,
  token: CancellationToken,
}

impl InterruptFlag {
  pub fn new() -> Self {
    Self::default()
  }

  /// Sets the flag. Returns `true` only for the call that actually set it.
  pub fn set(&self) -> bool {
    if self.set.swap(true, Ordering::AcqRel) {
      return false;
    }
    self.token.cancel();
    true
  }

  pub fn is_set(&self) -> bool {
    self.set.load(Ordering::Acquire)
  }

  /// Resolves once the flag is set. Resolves immediately if it already is.
  pub async fn interrupted(&self) {
    self.token.cancelled().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;
  use tokio::time::timeout;

  #[tokio::test]
  async fn set_is_monotonic_and_shared() {
    let flag = InterruptFlag::new();
    let handle = flag.clone();
    assert!(!flag.is_set());

    assert!(handle.set());
    assert!(flag.is_set());
    assert!(!flag.set(), "second set must not report a transition");
    assert!(flag.is_set());
  }

  #[tokio::test]
  async fn waiters_wake_on_set() {
    let flag = InterruptFlag::new();
    let waiter = {
      let flag = flag.clone();
      tokio::spawn(async move { flag.interrupted().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!waiter.is_finished());

    flag.set();
    assert!(timeout(Duration::from_millis(100), waiter).await.is_ok());
    // Already set: resolves without waiting.
    assert!(timeout(Duration::from_millis(10), flag.interrupted()).await.is_ok());
  }
}
