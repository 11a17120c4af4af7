// src/sample.rs

//! The measured outcome of one connect+subscribe attempt.

use std::fmt;
use std::time::{Duration, SystemTime};

pub const PAYLOAD_SUCCESS: &str = "Successful.";
pub const PAYLOAD_FAILURE: &str = "Failed.";

/// Coarse response code reported to the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
  Ok,
  Failed,
}

impl ResponseCode {
  pub fn as_str(&self) -> &'static str {
    match self {
      ResponseCode::Ok => "200",
      ResponseCode::Failed => "500",
    }
  }
}

impl fmt::Display for ResponseCode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One sample, immutable once built. Produced exactly once per attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleResult {
  label: String,
  start_time: SystemTime,
  end_time: SystemTime,
  elapsed: Duration,
  success: bool,
  response_code: ResponseCode,
  response_message: String,
  response_data: &'static str,
}

impl SampleResult {
  /// A successful sample for the connection described by `connection`.
  pub fn success(label: impl Into<String>, timing: SampleTiming, connection: &str) -> Self {
    Self {
      label: label.into(),
      start_time: timing.start_time,
      end_time: timing.start_time + timing.elapsed,
      elapsed: timing.elapsed,
      success: true,
      response_code: ResponseCode::Ok,
      response_message: format!("Connection {} connected successfully.", connection),
      response_data: PAYLOAD_SUCCESS,
    }
  }

  /// A failed sample. `detail` is appended to the message so the cause is visible.
  pub fn failure(label: impl Into<String>, timing: SampleTiming, connection: &str, detail: &str) -> Self {
    Self {
      label: label.into(),
      start_time: timing.start_time,
      end_time: timing.start_time + timing.elapsed,
      elapsed: timing.elapsed,
      success: false,
      response_code: ResponseCode::Failed,
      response_message: format!("Connection {} connected failed: {}", connection, detail),
      response_data: PAYLOAD_FAILURE,
    }
  }

  pub fn label(&self) -> &str {
    &self.label
  }
  pub fn start_time(&self) -> SystemTime {
    self.start_time
  }
  pub fn end_time(&self) -> SystemTime {
    self.end_time
  }
  pub fn elapsed(&self) -> Duration {
    self.elapsed
  }
  pub fn is_success(&self) -> bool {
    self.success
  }
  pub fn response_code(&self) -> ResponseCode {
    self.response_code
  }
  pub fn response_message(&self) -> &str {
    &self.response_message
  }
  pub fn response_data(&self) -> &str {
    self.response_data
  }
}

/// Wall-clock start plus a monotonic elapsed time.
///
/// The elapsed part comes from `tokio::time::Instant` so it follows a paused test clock.
#[derive(Debug, Clone, Copy)]
pub struct SampleTiming {
  start_time: SystemTime,
  started: tokio::time::Instant,
  elapsed: Duration,
}

impl SampleTiming {
  pub fn start() -> Self {
    Self {
      start_time: SystemTime::now(),
      started: tokio::time::Instant::now(),
      elapsed: Duration::ZERO,
    }
  }

  pub fn end(mut self) -> Self {
    self.elapsed = self.started.elapsed();
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test(start_paused = true)]
  async fn timing_follows_the_tokio_clock() {
    let timing = SampleTiming::start();
    tokio::time::advance(Duration::from_millis(1500)).await;
    let result = SampleResult::success("MQTT Connection Sampler", timing.end(), "tcp://h:1883#vu1");

    assert_eq!(result.elapsed(), Duration::from_millis(1500));
    assert_eq!(result.end_time(), result.start_time() + Duration::from_millis(1500));
    assert!(result.is_success());
    assert_eq!(result.response_code().as_str(), "200");
    assert_eq!(result.response_data(), PAYLOAD_SUCCESS);
    assert_eq!(
      result.response_message(),
      "Connection tcp://h:1883#vu1 connected successfully."
    );
  }

  #[test]
  fn failure_embeds_detail() {
    let result = SampleResult::failure("s", SampleTiming::start().end(), "<none>", "Operation timed out");
    assert!(!result.is_success());
    assert_eq!(result.response_code(), ResponseCode::Failed);
    assert_eq!(result.response_code().to_string(), "500");
    assert!(result.response_message().contains("Operation timed out"));
    assert_eq!(result.response_data(), PAYLOAD_FAILURE);
  }
}
