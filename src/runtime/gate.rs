// src/runtime/gate.rs

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use tokio::sync::Notify;

const OPEN: u8 = 0;
const HOLDING: u8 = 1;
const RELEASED: u8 = 2;

/// Observable state of a [`ShutdownHoldGate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
  /// Nobody has claimed the shutdown hold yet.
  Open,
  /// One caller won the claim and is performing the hold.
  Holding,
  /// The hold is over (or was skipped); parked connections may close.
  Released,
}

/// One-shot gate guarding the shared test-shutdown hold.
///
/// Exactly one caller can move it from `Open` to `Holding`. That caller performs the hold and
/// then releases the gate, which wakes everyone parked in [`ShutdownHoldGate::released`].
#[derive(Debug)]
pub struct ShutdownHoldGate {
  state: AtomicU8,
  holds_performed: AtomicUsize,
  notify: Notify,
}

impl Default for ShutdownHoldGate {
  fn default() -> Self {
    Self::new()
  }
}

impl ShutdownHoldGate {
  pub fn new() -> Self {
    Self {
      state: AtomicU8::new(OPEN),
      holds_performed: AtomicUsize::new(0),
      notify: Notify::new(),
    }
  }

  /// Attempts to claim the hold. Only the first caller gets `true`.
  pub fn try_claim(&self) -> bool {
    self
      .state
      .compare_exchange(OPEN, HOLDING, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }

  /// Records that the claimed hold actually ran, for accounting.
  pub(crate) fn record_hold(&self) -> usize {
    self.holds_performed.fetch_add(1, Ordering::AcqRel) + 1
  }

  /// Moves the gate to `Released` and wakes all waiters. Idempotent.
  pub fn release(&self) {
    let previous = self.state.swap(RELEASED, Ordering::AcqRel);
    if previous != RELEASED {
      tracing::debug!(previous = ?decode(previous), "Shutdown-hold gate released");
      self.notify.notify_waiters();
    }
  }

  pub fn state(&self) -> GateState {
    decode(self.state.load(Ordering::Acquire))
  }

  pub fn is_released(&self) -> bool {
    self.state() == GateState::Released
  }

  /// Number of shutdown holds performed through this gate. Never exceeds one.
  pub fn holds_performed(&self) -> usize {
    self.holds_performed.load(Ordering::Acquire)
  }

  /// Waits until the gate is released. Returns immediately if it already is.
  pub async fn released(&self) {
    loop {
      // Register before checking so a release between the check and the await is not lost.
      let notified = self.notify.notified();
      if self.is_released() {
        return;
      }
      notified.await;
    }
  }
}

fn decode(raw: u8) -> GateState {
  match raw {
    OPEN => GateState::Open,
    HOLDING => GateState::Holding,
    _ => GateState::Released,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::time::Duration;
  use tokio::time::timeout;

  #[tokio::test]
  async fn only_one_claim_wins() {
    let gate = Arc::new(ShutdownHoldGate::new());
    let mut handles = Vec::new();
    for _ in 0..32 {
      let gate = gate.clone();
      handles.push(tokio::spawn(async move { gate.try_claim() }));
    }
    let mut winners = 0;
    for handle in handles {
      if handle.await.unwrap() {
        winners += 1;
      }
    }
    assert_eq!(winners, 1);
    assert_eq!(gate.state(), GateState::Holding);
  }

  #[tokio::test]
  async fn release_wakes_waiters_and_is_sticky() {
    let gate = Arc::new(ShutdownHoldGate::new());
    let waiter = {
      let gate = gate.clone();
      tokio::spawn(async move { gate.released().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!waiter.is_finished());

    assert!(gate.try_claim());
    gate.release();
    assert!(timeout(Duration::from_millis(100), waiter).await.is_ok());

    gate.release();
    assert!(gate.is_released());
    assert!(!gate.try_claim(), "a released gate cannot be claimed again");
    assert!(timeout(Duration::from_millis(10), gate.released()).await.is_ok());
  }
}
