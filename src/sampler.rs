// src/sampler.rs

//! The per-virtual-user state machine: connect, subscribe, emit one result, hold, disconnect.

use crate::client::{Connection, ProtocolClient, QoS};
use crate::config::ConnectionParameters;
use crate::coordinator::{HoldConfiguration, HoldStrategy, LifecycleCoordinator, LifecycleEvent, RunContext, ShutdownHold};
use crate::error::SamplerError;
use crate::hold::{HoldOutcome, HoldScheduler};
use crate::runtime::InterruptFlag;
use crate::sample::{SampleResult, SampleTiming};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_LABEL: &str = "MQTT Connection Sampler";

/// Lifecycle position of one unit. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitState {
  Init,
  Connecting,
  Connected,
  Subscribing,
  Holding,
  Disconnecting,
  ConnectFailed,
  SubscribeFailed,
  Closed,
}

impl UnitState {
  pub fn can_transition_to(self, next: UnitState) -> bool {
    use UnitState::*;
    matches!(
      (self, next),
      (Init, Connecting)
        | (Init, Closed)
        | (Connecting, Connected)
        | (Connecting, ConnectFailed)
        | (Connected, Subscribing)
        | (Subscribing, Holding)
        | (Subscribing, SubscribeFailed)
        | (Holding, Disconnecting)
        | (Disconnecting, Closed)
        | (ConnectFailed, Closed)
        | (SubscribeFailed, Closed)
    )
  }

  pub fn is_terminal(self) -> bool {
    self == UnitState::Closed
  }
}

/// Where finished sample results go. Results are emitted before the hold starts.
#[derive(Debug, Clone)]
pub struct ResultSink {
  sender: async_channel::Sender<SampleResult>,
}

impl ResultSink {
  pub fn new(sender: async_channel::Sender<SampleResult>) -> Self {
    Self { sender }
  }

  /// Creates a sink together with its receiving end.
  pub fn unbounded() -> (Self, async_channel::Receiver<SampleResult>) {
    let (sender, receiver) = async_channel::unbounded();
    (Self::new(sender), receiver)
  }

  /// Returns false if the collecting side is gone; the result is then dropped.
  pub async fn emit(&self, result: SampleResult) -> bool {
    match self.sender.send(result).await {
      Ok(()) => true,
      Err(async_channel::SendError(result)) => {
        tracing::warn!(label = result.label(), "Result receiver closed, dropping sample result");
        false
      }
    }
  }
}

/// The part of a unit that other tasks can reach while the unit runs.
#[derive(Clone)]
pub struct UnitHandle {
  id: usize,
  interrupt: InterruptFlag,
  coordinator: Arc<LifecycleCoordinator>,
  run: Option<Arc<RunContext>>,
}

impl UnitHandle {
  pub fn id(&self) -> usize {
    self.id
  }

  pub fn interrupt_flag(&self) -> &InterruptFlag {
    &self.interrupt
  }

  /// Sets the unit's interrupt flag. Always acknowledges.
  pub fn interrupt(&self) -> bool {
    if self.interrupt.set() {
      tracing::info!(vu = self.id, "Interrupt requested");
    }
    true
  }

  /// Delivers test-ended for this unit. Under the immediate strategy this interrupts the
  /// unit's own hold; under the deferred strategy it takes part in the shared shutdown hold.
  pub async fn test_ended(&self) -> ShutdownHold {
    let Some(run) = self.run.as_ref() else {
      tracing::debug!(vu = self.id, "Test ended before test started, nothing to do");
      return ShutdownHold::NotApplicable;
    };
    tracing::debug!(vu = self.id, run_id = run.run_id(), "Test ended");

    if run.strategy() == HoldStrategy::Immediate {
      self.interrupt.set();
    }
    self.coordinator.test_ended(run).await
  }
}

impl fmt::Debug for UnitHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("UnitHandle")
      .field("id", &self.id)
      .field("interrupted", &self.interrupt.is_set())
      .field("run_id", &self.run.as_ref().map(|r| r.run_id().to_string()))
      .finish()
  }
}

/// One virtual user. Owns at most one connection at a time.
pub struct SamplerUnit {
  id: usize,
  label: String,
  client: Arc<dyn ProtocolClient>,
  coordinator: Arc<LifecycleCoordinator>,
  run: Option<Arc<RunContext>>,
  interrupt: InterruptFlag,
  connection: Option<Box<dyn Connection>>,
  state: UnitState,
}

impl SamplerUnit {
  pub fn new(id: usize, client: Arc<dyn ProtocolClient>, coordinator: Arc<LifecycleCoordinator>) -> Self {
    Self {
      id,
      label: DEFAULT_LABEL.to_string(),
      client,
      coordinator,
      run: None,
      interrupt: InterruptFlag::new(),
      connection: None,
      state: UnitState::Init,
    }
  }

  pub fn with_label(mut self, label: impl Into<String>) -> Self {
    self.label = label.into();
    self
  }

  pub fn id(&self) -> usize {
    self.id
  }
  pub fn label(&self) -> &str {
    &self.label
  }
  pub fn state(&self) -> UnitState {
    self.state
  }
  pub fn run(&self) -> Option<&Arc<RunContext>> {
    self.run.as_ref()
  }
  pub fn interrupt_flag(&self) -> InterruptFlag {
    self.interrupt.clone()
  }
  pub fn has_connection(&self) -> bool {
    self.connection.is_some()
  }

  /// A cloneable handle for interrupting this unit and delivering test-ended from
  /// another task. Take it after test-started so it carries the run.
  pub fn handle(&self) -> UnitHandle {
    UnitHandle {
      id: self.id,
      interrupt: self.interrupt.clone(),
      coordinator: self.coordinator.clone(),
      run: self.run.clone(),
    }
  }

  fn transition(&mut self, next: UnitState) {
    if self.state.can_transition_to(next) {
      tracing::debug!(vu = self.id, from = ?self.state, to = ?next, "Unit state transition");
      self.state = next;
    } else {
      tracing::error!(vu = self.id, from = ?self.state, to = ?next, "Invalid unit state transition ignored");
    }
  }

  pub async fn on_event(&mut self, event: LifecycleEvent) -> Option<ShutdownHold> {
    match event {
      LifecycleEvent::TestStarted { run_id, hold } => {
        self.test_started(&run_id, hold);
        None
      }
      LifecycleEvent::TestEnded { run_id } => {
        if self.run.as_ref().is_some_and(|run| run.run_id() != run_id) {
          tracing::debug!(vu = self.id, %run_id, "Test ended for a different run, ignoring");
          return None;
        }
        Some(self.test_ended().await)
      }
      LifecycleEvent::ThreadStarted => {
        self.thread_started();
        None
      }
      LifecycleEvent::ThreadFinished => {
        self.thread_finished().await;
        None
      }
    }
  }

  /// Snapshots the run's context. A later run does not affect this unit's snapshot.
  pub fn test_started(&mut self, run_id: &str, hold: HoldConfiguration) {
    let run = self.coordinator.test_started(run_id, hold);
    tracing::debug!(vu = self.id, run_id, hold = ?run.hold().hold_duration(), "Test started");
    self.run = Some(run);
  }

  pub async fn test_ended(&self) -> ShutdownHold {
    self.handle().test_ended().await
  }

  pub fn thread_started(&self) {
    tracing::debug!(vu = self.id, "Thread started");
  }

  /// Closes any connection still owned, with no hold, and finishes the unit.
  pub async fn thread_finished(&mut self) {
    tracing::debug!(vu = self.id, "Thread finished");
    if let Some(connection) = self.connection.take() {
      if self.state == UnitState::Subscribing {
        self.transition(UnitState::Holding);
      }
      HoldScheduler::hold_then_disconnect(Some(connection), Duration::ZERO, &self.interrupt).await;
      self.transition(UnitState::Disconnecting);
    }
    self.close();
  }

  pub fn interrupt(&self) -> bool {
    self.handle().interrupt()
  }

  /// Connects and subscribes, producing exactly one result. On success the connection is
  /// kept for the hold phase.
  pub async fn run_sample(&mut self, params: &ConnectionParameters) -> SampleResult {
    let timing = SampleTiming::start();
    let description = describe(params);

    if self.state != UnitState::Init {
      let e = SamplerError::InvalidState("unit has already sampled");
      tracing::error!(vu = self.id, state = ?self.state, "Sample requested on a used unit");
      return SampleResult::failure(&self.label, timing.end(), &description, &e.to_string());
    }

    self.transition(UnitState::Connecting);
    tracing::debug!(vu = self.id, endpoint = %params.endpoint(), client_id = params.client_id(), "Connecting");
    let connect_timeout = params.connect_timeout();
    let connected = tokio::select! {
      biased;
      _ = self.interrupt.interrupted() => Err(SamplerError::Interrupted),
      result = tokio::time::timeout(connect_timeout, self.client.connect(params)) => {
        result.unwrap_or(Err(SamplerError::Timeout))
      }
    };

    let mut connection = match connected {
      Ok(connection) => connection,
      Err(e) => {
        self.transition(UnitState::ConnectFailed);
        tracing::error!(vu = self.id, connection = %description, error = %e, "Failed to establish connection");
        return SampleResult::failure(&self.label, timing.end(), &description, &e.to_string());
      }
    };

    self.transition(UnitState::Connected);
    let description = connection.description();
    self.transition(UnitState::Subscribing);
    let topic = params.topic();
    let subscribed = tokio::select! {
      biased;
      _ = self.interrupt.interrupted() => Err(SamplerError::Interrupted),
      result = tokio::time::timeout(connect_timeout, connection.subscribe(&topic, QoS::AtLeastOnce)) => {
        result.unwrap_or(Err(SamplerError::Timeout))
      }
    };

    match subscribed {
      Ok(granted) => {
        let result = SampleResult::success(&self.label, timing.end(), &description);
        tracing::debug!(vu = self.id, connection = %description, %topic, ?granted, "Subscribed");
        self.connection = Some(connection);
        result
      }
      Err(e) => {
        let result = SampleResult::failure(&self.label, timing.end(), &description, &e.to_string());
        self.transition(UnitState::SubscribeFailed);
        tracing::error!(vu = self.id, connection = %description, %topic, error = %e, "Subscription failed");
        if let Err(e) = connection.disconnect().await {
          tracing::warn!(vu = self.id, connection = %description, error = %e, "Disconnect after failed subscription failed");
        }
        result
      }
    }
  }

  /// One full iteration: sample, emit the result, then hold per the run's strategy.
  /// The sink is released once the result is emitted, before the hold.
  pub async fn execute(&mut self, params: &ConnectionParameters, sink: ResultSink) -> HoldOutcome {
    let result = self.run_sample(params).await;
    let success = result.is_success();
    sink.emit(result).await;
    drop(sink);

    if !success {
      self.close();
      return HoldOutcome::NotConnected;
    }
    self.hold().await
  }

  /// Holds the owned connection according to the run's strategy, then disconnects once.
  /// Without a test-started the unit holds for zero time.
  pub async fn hold(&mut self) -> HoldOutcome {
    let connection = self.connection.take();
    if connection.is_none() {
      self.close();
      return HoldOutcome::NotConnected;
    }

    self.transition(UnitState::Holding);
    let outcome = match self.run.as_deref() {
      Some(run) if run.strategy() == HoldStrategy::DeferredShutdown => {
        HoldScheduler::hold_until_released(connection, run.gate(), &self.interrupt).await
      }
      Some(run) => HoldScheduler::hold_then_disconnect(connection, run.hold().hold_duration(), &self.interrupt).await,
      None => HoldScheduler::hold_then_disconnect(connection, Duration::ZERO, &self.interrupt).await,
    };
    self.transition(UnitState::Disconnecting);
    self.close();
    outcome
  }

  fn close(&mut self) {
    if !self.state.is_terminal() {
      self.transition(UnitState::Closed);
    }
  }
}

impl fmt::Debug for SamplerUnit {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SamplerUnit")
      .field("id", &self.id)
      .field("label", &self.label)
      .field("state", &self.state)
      .field("run", &self.run)
      .field("interrupted", &self.interrupt.is_set())
      .field("connection", &self.connection)
      .finish()
  }
}

fn describe(params: &ConnectionParameters) -> String {
  format!("{}/{}", params.endpoint(), params.client_id())
}
