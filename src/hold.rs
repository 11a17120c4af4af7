// src/hold.rs

//! Keeps a subscribed connection open, then disconnects it exactly once.

use crate::client::Connection;
use crate::runtime::{InterruptFlag, ShutdownHoldGate};

use std::time::Duration;
use tokio::time::Instant;

/// How a hold ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldOutcome {
  /// No live connection; nothing was held or closed.
  NotConnected,
  /// The full hold elapsed (or the gate was released) before disconnecting.
  Completed { held: Duration, disconnected: bool },
  /// The interrupt flag cut the hold short before disconnecting.
  Interrupted { held: Duration, disconnected: bool },
}

impl HoldOutcome {
  /// Whether a disconnect call was made and succeeded.
  pub fn disconnected(&self) -> bool {
    match self {
      HoldOutcome::NotConnected => false,
      HoldOutcome::Completed { disconnected, .. } | HoldOutcome::Interrupted { disconnected, .. } => *disconnected,
    }
  }

  pub fn was_interrupted(&self) -> bool {
    matches!(self, HoldOutcome::Interrupted { .. })
  }
}

/// Stateless driver for the hold phase of one virtual user.
#[derive(Debug, Clone, Copy, Default)]
pub struct HoldScheduler;

impl HoldScheduler {
  /// Holds `connection` open for `hold` unless `interrupt` fires first, then disconnects.
  pub async fn hold_then_disconnect(
    connection: Option<Box<dyn Connection>>,
    hold: Duration,
    interrupt: &InterruptFlag,
  ) -> HoldOutcome {
    let Some(connection) = live(connection) else {
      return HoldOutcome::NotConnected;
    };

    tracing::info!(connection = %connection.description(), ?hold, "Holding connection");
    let started = Instant::now();
    let interrupted = tokio::select! {
      biased;
      _ = interrupt.interrupted() => true,
      _ = tokio::time::sleep(hold) => false,
    };
    Self::finish(connection, started, interrupted).await
  }

  /// Holds `connection` until the shared shutdown hold is released or `interrupt` fires,
  /// then disconnects.
  pub async fn hold_until_released(
    connection: Option<Box<dyn Connection>>,
    gate: &ShutdownHoldGate,
    interrupt: &InterruptFlag,
  ) -> HoldOutcome {
    let Some(connection) = live(connection) else {
      return HoldOutcome::NotConnected;
    };

    tracing::debug!(connection = %connection.description(), "Parking connection until shutdown hold is released");
    let started = Instant::now();
    let interrupted = tokio::select! {
      biased;
      _ = interrupt.interrupted() => true,
      _ = gate.released() => false,
    };
    Self::finish(connection, started, interrupted).await
  }

  async fn finish(connection: Box<dyn Connection>, started: Instant, interrupted: bool) -> HoldOutcome {
    let held = started.elapsed();
    if interrupted {
      tracing::info!(connection = %connection.description(), ?held, "Interrupt flag set, ending hold early");
    }

    let description = connection.description();
    let disconnected = match connection.disconnect().await {
      Ok(()) => {
        tracing::info!(connection = %description, "Connection disconnected successfully");
        true
      }
      Err(e) => {
        tracing::warn!(connection = %description, error = %e, "Disconnect failed");
        false
      }
    };

    if interrupted {
      HoldOutcome::Interrupted { held, disconnected }
    } else {
      HoldOutcome::Completed { held, disconnected }
    }
  }
}

/// Filters out absent and dead handles. A dead handle is dropped here, which releases its transport.
fn live(connection: Option<Box<dyn Connection>>) -> Option<Box<dyn Connection>> {
  match connection {
    None => {
      tracing::info!("Connection is absent, nothing to hold");
      None
    }
    Some(connection) if !connection.is_connected() => {
      tracing::info!(connection = %connection.description(), "Connection is created, but is not connected");
      None
    }
    Some(connection) => Some(connection),
  }
}
