// src/harness.rs

//! Drives one run: spawns a task per virtual user, delivers lifecycle signals and
//! collects the sample results.

use crate::client::ProtocolClient;
use crate::config::SamplerConfig;
use crate::coordinator::{HoldConfiguration, HoldStrategy, LifecycleCoordinator, LifecycleEvent, RunContext, ShutdownHold};
use crate::error::SamplerError;
use crate::hold::HoldOutcome;
use crate::sample::SampleResult;
use crate::sampler::{ResultSink, SamplerUnit, UnitHandle};

use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

static NEXT_RUN: AtomicU64 = AtomicU64::new(1);

/// Builder for a run of `users` virtual users sharing one client and coordinator.
pub struct LoadRun {
  config: SamplerConfig,
  users: usize,
  run_id: String,
  client: Arc<dyn ProtocolClient>,
  coordinator: Arc<LifecycleCoordinator>,
}

impl LoadRun {
  pub fn new(config: SamplerConfig, client: Arc<dyn ProtocolClient>, coordinator: Arc<LifecycleCoordinator>) -> Self {
    Self {
      config,
      users: 1,
      run_id: format!("run-{}", NEXT_RUN.fetch_add(1, Ordering::Relaxed)),
      client,
      coordinator,
    }
  }

  pub fn with_users(mut self, users: usize) -> Self {
    self.users = users;
    self
  }

  /// Overrides the generated `run-<n>` id. Each run started on a coordinator should use its own id.
  pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
    self.run_id = run_id.into();
    self
  }

  /// Delivers test-started to every unit, then spawns one task per unit.
  /// Must be called from within a tokio runtime.
  pub fn start(self) -> Result<RunningLoad, SamplerError> {
    self.config.validate()?;
    if self.users == 0 {
      return Err(SamplerError::InvalidOptionValue {
        option: "users",
        value: "0".to_string(),
      });
    }

    let hold = HoldConfiguration::new(self.config.hold_duration);
    let run = self.coordinator.test_started(&self.run_id, hold);
    let (sink, results) = ResultSink::unbounded();

    let mut units = Vec::with_capacity(self.users);
    for id in 1..=self.users {
      let mut unit = SamplerUnit::new(id, self.client.clone(), self.coordinator.clone());
      unit.test_started(&self.run_id, hold);
      units.push(unit);
    }
    let handles: Vec<UnitHandle> = units.iter().map(SamplerUnit::handle).collect();

    tracing::info!(
      run_id = %self.run_id,
      users = self.users,
      endpoint = %format!("{}://{}:{}", self.config.transport.scheme(), self.config.server, self.config.port),
      "Starting run"
    );
    let tasks = units
      .into_iter()
      .map(|mut unit| {
        let params = self.config.connection_parameters();
        let sink = sink.clone();
        tokio::spawn(async move {
          unit.on_event(LifecycleEvent::ThreadStarted).await;
          let outcome = unit.execute(&params, sink).await;
          unit.on_event(LifecycleEvent::ThreadFinished).await;
          outcome
        })
      })
      .collect();

    Ok(RunningLoad {
      run,
      users: self.users,
      started: Instant::now(),
      handles,
      tasks,
      results,
      collected: Vec::with_capacity(self.users),
    })
  }
}

/// A run whose units are executing.
pub struct RunningLoad {
  run: Arc<RunContext>,
  users: usize,
  started: Instant,
  handles: Vec<UnitHandle>,
  tasks: Vec<JoinHandle<HoldOutcome>>,
  results: async_channel::Receiver<SampleResult>,
  collected: Vec<SampleResult>,
}

impl RunningLoad {
  pub fn run(&self) -> &Arc<RunContext> {
    &self.run
  }

  /// Receives the next sample result as units produce them. Results seen here are
  /// still part of the final report.
  pub async fn next_result(&mut self) -> Option<SampleResult> {
    let result = self.results.recv().await.ok()?;
    self.collected.push(result.clone());
    Some(result)
  }

  /// Interrupts every unit; returns the number of acknowledgements.
  pub fn interrupt_all(&self) -> usize {
    self.handles.iter().filter(|h| h.interrupt()).count()
  }

  /// A handle that can stop this run from another task, e.g. on Ctrl-C.
  pub fn stop_handle(&self) -> StopHandle {
    StopHandle {
      run: self.run.clone(),
      handles: self.handles.clone(),
    }
  }

  /// Ends the run gracefully and gathers the report.
  ///
  /// With per-connection holds, units finish on their own and test-ended follows. With the
  /// deferred shutdown hold, test-ended is delivered to all units concurrently once every
  /// unit has reported, and the units close when the single hold is over.
  pub async fn finish(self) -> RunReport {
    let RunningLoad {
      run,
      users,
      started,
      handles,
      tasks,
      results: receiver,
      collected: mut results,
    } = self;

    let (holds, shutdown) = match run.strategy() {
      HoldStrategy::Immediate => {
        let holds = join_units(tasks).await;
        let shutdown = deliver_test_ended(&handles).await;
        (holds, shutdown)
      }
      HoldStrategy::DeferredShutdown => {
        while results.len() < users {
          match receiver.recv().await {
            Ok(result) => results.push(result),
            Err(_) => break,
          }
        }
        let shutdown = deliver_test_ended(&handles).await;
        (join_units(tasks).await, shutdown)
      }
    };
    while let Ok(result) = receiver.try_recv() {
      results.push(result);
    }

    let report = RunReport {
      run_id: run.run_id().to_string(),
      results,
      holds,
      shutdown,
      shutdown_holds: run.gate().holds_performed(),
      elapsed: started.elapsed(),
    };
    tracing::info!(
      run_id = %report.run_id,
      successes = report.successes(),
      failures = report.failures(),
      elapsed = ?report.elapsed,
      "Run finished"
    );
    report
  }
}

async fn join_units(tasks: Vec<JoinHandle<HoldOutcome>>) -> Vec<HoldOutcome> {
  join_all(tasks)
    .await
    .into_iter()
    .map(|joined| match joined {
      Ok(outcome) => outcome,
      Err(e) => {
        tracing::error!(error = %e, "Virtual user task failed");
        HoldOutcome::NotConnected
      }
    })
    .collect()
}

async fn deliver_test_ended(handles: &[UnitHandle]) -> Vec<ShutdownHold> {
  join_all(handles.iter().map(|handle| handle.test_ended())).await
}

/// Stops a running load from another task.
#[derive(Debug, Clone)]
pub struct StopHandle {
  run: Arc<RunContext>,
  handles: Vec<UnitHandle>,
}

impl StopHandle {
  /// Interrupts every unit and aborts the shutdown hold. Returns the acknowledgements.
  pub fn stop(&self) -> usize {
    let acknowledged = self.handles.iter().filter(|h| h.interrupt()).count();
    self.run.abort();
    acknowledged
  }
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct RunReport {
  run_id: String,
  results: Vec<SampleResult>,
  holds: Vec<HoldOutcome>,
  shutdown: Vec<ShutdownHold>,
  shutdown_holds: usize,
  elapsed: Duration,
}

impl RunReport {
  pub fn run_id(&self) -> &str {
    &self.run_id
  }
  pub fn results(&self) -> &[SampleResult] {
    &self.results
  }
  pub fn holds(&self) -> &[HoldOutcome] {
    &self.holds
  }
  pub fn shutdown(&self) -> &[ShutdownHold] {
    &self.shutdown
  }
  /// How many times the shared shutdown hold actually slept. At most 1.
  pub fn shutdown_holds(&self) -> usize {
    self.shutdown_holds
  }
  pub fn elapsed(&self) -> Duration {
    self.elapsed
  }

  pub fn successes(&self) -> usize {
    self.results.iter().filter(|r| r.is_success()).count()
  }

  pub fn failures(&self) -> usize {
    self.results.len() - self.successes()
  }

  pub fn disconnects(&self) -> usize {
    self.holds.iter().filter(|h| h.disconnected()).count()
  }

  pub fn interrupted(&self) -> usize {
    self.holds.iter().filter(|h| h.was_interrupted()).count()
  }

  /// Mean connect+subscribe time across all results.
  pub fn average_elapsed(&self) -> Option<Duration> {
    if self.results.is_empty() {
      return None;
    }
    let total: Duration = self.results.iter().map(SampleResult::elapsed).sum();
    Some(total / self.results.len() as u32)
  }
}
