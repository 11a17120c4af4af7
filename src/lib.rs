//! connhold - connection-hold load sampling for MQTT brokers.
//!
//! Each virtual user connects, subscribes to its own topic, holds the connection open for a
//! configured time and disconnects exactly once. The [`coordinator`] decides who performs the
//! hold: every unit right after its own sample, or one shared hold at test end.

pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod harness;
pub mod hold;
pub mod runtime;
pub mod sample;
pub mod sampler;

// Re-export core types for user convenience
pub use client::{Connection, MqttClient, ProtocolClient, QoS, SecurityContext};
pub use config::{ConnectionParameters, SamplerConfig, Transport};
pub use coordinator::{
  HoldConfiguration, HoldStrategy, LifecycleCoordinator, LifecycleEvent, OperatingMode, RunContext, ShutdownHold,
};
pub use error::SamplerError;
pub use harness::{LoadRun, RunReport, RunningLoad, StopHandle};
pub use hold::{HoldOutcome, HoldScheduler};
pub use runtime::{GateState, InterruptFlag, ShutdownHoldGate};
pub use sample::{ResponseCode, SampleResult};
pub use sampler::{ResultSink, SamplerUnit, UnitHandle, UnitState};
