// src/coordinator.rs

//! Process-wide coordination of the hold phase across every virtual user of a run.

use crate::runtime::ShutdownHoldGate;

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Whether results are watched interactively or the run is unattended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperatingMode {
  /// Results surface incrementally; each connection holds right after its own sample.
  Attended,
  /// Batch run; connections stay parked until one shared hold at test end.
  #[default]
  Unattended,
}

/// Who performs the hold, chosen once per coordinator from the operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldStrategy {
  /// Each virtual user holds its own connection right after a successful sample.
  Immediate,
  /// One shared hold runs at test end; parked connections close when it is over.
  DeferredShutdown,
}

impl From<OperatingMode> for HoldStrategy {
  fn from(mode: OperatingMode) -> Self {
    match mode {
      OperatingMode::Attended => HoldStrategy::Immediate,
      OperatingMode::Unattended => HoldStrategy::DeferredShutdown,
    }
  }
}

/// The hold duration in effect for one run. Fixed before any virtual user samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HoldConfiguration {
  hold_duration: Duration,
}

impl HoldConfiguration {
  pub fn new(hold_duration: Duration) -> Self {
    Self { hold_duration }
  }

  pub fn hold_duration(&self) -> Duration {
    self.hold_duration
  }
}

/// Lifecycle signals the harness delivers to every virtual user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
  TestStarted { run_id: String, hold: HoldConfiguration },
  TestEnded { run_id: String },
  ThreadStarted,
  ThreadFinished,
}

/// What a test-ended delivery did about the shared shutdown hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownHold {
  /// This delivery won the gate and performed the hold.
  Performed,
  /// Another delivery already claimed the gate; returned without sleeping.
  AlreadyClaimed,
  /// This delivery won the gate but the run was aborted mid-hold.
  Aborted,
  /// The strategy holds per connection, so there is nothing to do centrally.
  NotApplicable,
}

/// Immutable per-run state shared by all virtual users of that run.
pub struct RunContext {
  run_id: String,
  hold: HoldConfiguration,
  strategy: HoldStrategy,
  gate: ShutdownHoldGate,
  abort: CancellationToken,
}

impl RunContext {
  fn new(run_id: String, hold: HoldConfiguration, strategy: HoldStrategy) -> Self {
    Self {
      run_id,
      hold,
      strategy,
      gate: ShutdownHoldGate::new(),
      abort: CancellationToken::new(),
    }
  }

  pub fn run_id(&self) -> &str {
    &self.run_id
  }
  pub fn hold(&self) -> HoldConfiguration {
    self.hold
  }
  pub fn strategy(&self) -> HoldStrategy {
    self.strategy
  }
  pub fn gate(&self) -> &ShutdownHoldGate {
    &self.gate
  }

  pub fn is_aborted(&self) -> bool {
    self.abort.is_cancelled()
  }

  /// The shutdown hold already ran (or was aborted); this context cannot host another run.
  pub fn is_finished(&self) -> bool {
    self.gate.is_released() || self.is_aborted()
  }

  /// Cuts a running shutdown hold short and releases parked connections.
  pub fn abort(&self) {
    if !self.abort.is_cancelled() {
      tracing::info!(run_id = %self.run_id, "Run aborted");
    }
    self.abort.cancel();
    self.gate.release();
  }
}

impl fmt::Debug for RunContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RunContext")
      .field("run_id", &self.run_id)
      .field("hold", &self.hold)
      .field("strategy", &self.strategy)
      .field("gate", &self.gate.state())
      .field("aborted", &self.abort.is_cancelled())
      .finish()
  }
}

/// Receives test-started and test-ended signals from every virtual user. It publishes
/// the run's hold configuration and makes sure the shutdown hold runs once per run.
#[derive(Debug)]
pub struct LifecycleCoordinator {
  strategy: HoldStrategy,
  current: RwLock<Option<Arc<RunContext>>>,
}

impl LifecycleCoordinator {
  pub fn new(mode: OperatingMode) -> Self {
    Self::with_strategy(HoldStrategy::from(mode))
  }

  pub fn with_strategy(strategy: HoldStrategy) -> Self {
    Self {
      strategy,
      current: RwLock::new(None),
    }
  }

  pub fn strategy(&self) -> HoldStrategy {
    self.strategy
  }

  /// Publishes the run's configuration. Repeated deliveries for a live run return the
  /// already-published context. A new `run_id`, or a run whose shutdown hold is already
  /// released or aborted, gets a fresh context with a fresh gate.
  pub fn test_started(&self, run_id: &str, hold: HoldConfiguration) -> Arc<RunContext> {
    let mut current = self.current.write();
    if let Some(run) = current.as_ref() {
      if run.run_id == run_id && !run.is_finished() {
        return run.clone();
      }
    }

    let run = Arc::new(RunContext::new(run_id.to_string(), hold, self.strategy));
    tracing::info!(
      run_id,
      hold = ?hold.hold_duration(),
      strategy = ?self.strategy,
      "Test started, hold configuration published"
    );
    *current = Some(run.clone());
    run
  }

  /// The most recently started run, if any.
  pub fn current_run(&self) -> Option<Arc<RunContext>> {
    self.current.read().clone()
  }

  /// Handles one test-ended delivery for `run`.
  ///
  /// Under `DeferredShutdown` the first delivery to claim the gate sleeps for the hold
  /// duration and then releases the gate. Every other delivery returns at once.
  pub async fn test_ended(&self, run: &RunContext) -> ShutdownHold {
    match run.strategy {
      HoldStrategy::Immediate => ShutdownHold::NotApplicable,
      HoldStrategy::DeferredShutdown => {
        if !run.gate.try_claim() {
          tracing::trace!(run_id = %run.run_id, "Shutdown hold already claimed");
          return ShutdownHold::AlreadyClaimed;
        }

        let hold = run.hold.hold_duration();
        let performed = run.gate.record_hold();
        tracing::info!(run_id = %run.run_id, ?hold, performed, "Work done, keeping connections open");
        let aborted = tokio::select! {
          biased;
          _ = run.abort.cancelled() => true,
          _ = tokio::time::sleep(hold) => false,
        };
        run.gate.release();

        if aborted {
          tracing::info!(run_id = %run.run_id, "Shutdown hold aborted");
          ShutdownHold::Aborted
        } else {
          tracing::info!(run_id = %run.run_id, "Shutdown hold complete");
          ShutdownHold::Performed
        }
      }
    }
  }

  /// Aborts the current run, if any.
  pub fn abort(&self) {
    if let Some(run) = self.current_run() {
      run.abort();
    }
  }
}
