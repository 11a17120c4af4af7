// tests/lifecycle.rs

use connhold::{
  HoldOutcome, LifecycleCoordinator, LoadRun, OperatingMode, ProtocolClient, SamplerConfig, ShutdownHold,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
mod common;

use common::{mock_config, MockClient};

fn load(config: SamplerConfig, client: MockClient, mode: OperatingMode, users: usize) -> LoadRun {
  common::setup_tracing();
  let client: Arc<dyn ProtocolClient> = Arc::new(client);
  LoadRun::new(config, client, Arc::new(LifecycleCoordinator::new(mode))).with_users(users)
}

// --- Test: every virtual user produces exactly one result ---
#[tokio::test(start_paused = true)]
async fn test_every_user_produces_one_result() -> anyhow::Result<()> {
  let client = MockClient::new();
  let stats = client.stats();
  let report = load(mock_config(Duration::ZERO), client, OperatingMode::Attended, 25)
    .start()?
    .finish()
    .await;

  assert_eq!(report.results().len(), 25);
  assert_eq!(report.successes(), 25);
  for result in report.results() {
    assert!(!result.response_message().is_empty());
  }
  assert_eq!(stats.connects(), 25);
  assert_eq!(stats.disconnects(), 25);
  assert_eq!(stats.open(), 0);
  Ok(())
}

// --- Test: hold of zero disconnects with no delay ---
#[tokio::test(start_paused = true)]
async fn test_zero_hold_disconnects_immediately() -> anyhow::Result<()> {
  let client = MockClient::new();
  let stats = client.stats();
  let started = Instant::now();
  let report = load(mock_config(Duration::ZERO), client, OperatingMode::Attended, 1)
    .start()?
    .finish()
    .await;

  assert_eq!(started.elapsed(), Duration::ZERO);
  assert_eq!(
    report.holds(),
    &[HoldOutcome::Completed {
      held: Duration::ZERO,
      disconnected: true
    }]
  );
  assert_eq!(stats.disconnects(), 1);
  Ok(())
}

// --- Test: a connect slower than the timeout fails in time ---
#[tokio::test(start_paused = true)]
async fn test_connect_timeout_yields_failed_result() -> anyhow::Result<()> {
  let client = MockClient::new().with_connect_delay(Duration::from_secs(60));
  let stats = client.stats();
  let started = Instant::now();
  let report = load(mock_config(Duration::from_secs(5)), client, OperatingMode::Attended, 3)
    .start()?
    .finish()
    .await;

  let elapsed = started.elapsed();
  assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_millis(2100));
  assert_eq!(report.failures(), 3);
  for result in report.results() {
    assert_eq!(result.response_code().as_str(), "500");
    assert_eq!(result.response_data(), "Failed.");
  }
  assert_eq!(stats.disconnects(), 0);
  assert_eq!(stats.open(), 0);
  Ok(())
}

// --- Test: full attended hold, then one disconnect per connection ---
#[tokio::test(start_paused = true)]
async fn test_attended_hold_runs_full_duration() -> anyhow::Result<()> {
  let client = MockClient::new();
  let stats = client.stats();
  let started = Instant::now();
  let report = load(mock_config(Duration::from_secs(5)), client, OperatingMode::Attended, 4)
    .start()?
    .finish()
    .await;

  let elapsed = started.elapsed();
  assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(6));
  for hold in report.holds() {
    assert_eq!(
      *hold,
      HoldOutcome::Completed {
        held: Duration::from_secs(5),
        disconnected: true
      }
    );
  }
  assert_eq!(stats.disconnects(), 4);
  assert_eq!(report.shutdown_holds(), 0);
  Ok(())
}

// --- Test: interrupting mid-hold ends it promptly ---
#[tokio::test(start_paused = true)]
async fn test_interrupt_cuts_attended_hold() -> anyhow::Result<()> {
  let client = MockClient::new();
  let stats = client.stats();
  let started = Instant::now();
  let running = load(mock_config(Duration::from_secs(30)), client, OperatingMode::Attended, 2).start()?;

  tokio::time::sleep(Duration::from_secs(3)).await;
  assert_eq!(stats.open(), 2);
  assert_eq!(running.interrupt_all(), 2);
  let report = running.finish().await;

  assert!(started.elapsed() < Duration::from_secs(4));
  assert_eq!(report.successes(), 2);
  assert_eq!(report.interrupted(), 2);
  assert_eq!(stats.disconnects(), 2);
  assert_eq!(stats.open(), 0);
  Ok(())
}

// --- Test: unattended runs keep connections parked until test end ---
#[tokio::test(start_paused = true)]
async fn test_unattended_connections_wait_for_test_end() -> anyhow::Result<()> {
  let client = MockClient::new();
  let stats = client.stats();
  let mut running = load(mock_config(Duration::from_secs(5)), client, OperatingMode::Unattended, 8).start()?;

  for _ in 0..8 {
    let result = running.next_result().await.expect("result channel closed early");
    assert!(result.is_success());
  }
  // Well past the hold duration, nothing is closed until test-ended arrives.
  tokio::time::sleep(Duration::from_secs(60)).await;
  assert_eq!(stats.open(), 8);
  assert_eq!(stats.disconnects(), 0);

  let ended = Instant::now();
  let report = running.finish().await;
  assert_eq!(ended.elapsed(), Duration::from_secs(5));
  assert_eq!(report.results().len(), 8);
  assert_eq!(stats.disconnects(), 8);
  assert_eq!(stats.open(), 0);
  Ok(())
}

// --- Test: the shared shutdown hold sleeps once across many users ---
#[tokio::test(start_paused = true)]
async fn test_shutdown_hold_runs_once_for_64_users() -> anyhow::Result<()> {
  let client = MockClient::new();
  let stats = client.stats();
  let started = Instant::now();
  let report = load(mock_config(Duration::from_secs(5)), client, OperatingMode::Unattended, 64)
    .start()?
    .finish()
    .await;

  assert_eq!(report.shutdown_holds(), 1);
  let performed = report.shutdown().iter().filter(|s| **s == ShutdownHold::Performed).count();
  let skipped = report
    .shutdown()
    .iter()
    .filter(|s| **s == ShutdownHold::AlreadyClaimed)
    .count();
  assert_eq!((performed, skipped), (1, 63));
  assert_eq!(started.elapsed(), Duration::from_secs(5));
  assert_eq!(report.successes(), 64);
  assert_eq!(stats.disconnects(), 64);
  assert!(report.holds().iter().all(|h| !h.was_interrupted()));
  Ok(())
}

// --- Test: stopping a run aborts the shutdown hold and closes everything ---
#[tokio::test(start_paused = true)]
async fn test_stop_aborts_shutdown_hold() -> anyhow::Result<()> {
  let client = MockClient::new();
  let stats = client.stats();
  let started = Instant::now();
  let running = load(mock_config(Duration::from_secs(60)), client, OperatingMode::Unattended, 5).start()?;

  let stopper = running.stop_handle();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(stopper.stop(), 5);
  });
  let report = running.finish().await;

  assert_eq!(started.elapsed(), Duration::from_secs(2));
  assert!(report.shutdown().contains(&ShutdownHold::Aborted));
  assert_eq!(report.successes(), 5);
  assert_eq!(stats.disconnects(), 5);
  assert_eq!(stats.open(), 0);
  Ok(())
}

// --- Test: a rejected subscription never leaks its connection ---
#[tokio::test(start_paused = true)]
async fn test_subscribe_failure_closes_connection() -> anyhow::Result<()> {
  let client = MockClient::new().rejecting_subscribe();
  let stats = client.stats();
  let report = load(mock_config(Duration::from_secs(10)), client, OperatingMode::Unattended, 4)
    .start()?
    .finish()
    .await;

  assert_eq!(report.failures(), 4);
  for result in report.results() {
    assert!(result.response_message().contains("connected failed"));
  }
  assert_eq!(stats.subscribes(), 4);
  assert_eq!(stats.disconnects(), 4);
  assert_eq!(stats.open(), 0);
  Ok(())
}

// --- Test: a later run does not change what an earlier run's users hold ---
#[tokio::test(start_paused = true)]
async fn test_new_run_does_not_rewrite_earlier_hold() -> anyhow::Result<()> {
  common::setup_tracing();
  let coordinator = Arc::new(LifecycleCoordinator::new(OperatingMode::Attended));
  let client: Arc<dyn ProtocolClient> = Arc::new(MockClient::new());

  let first = LoadRun::new(mock_config(Duration::from_secs(10)), client.clone(), coordinator.clone())
    .with_users(2)
    .with_run_id("run-1")
    .start()?;
  let second = LoadRun::new(mock_config(Duration::from_secs(3)), client, coordinator.clone())
    .with_users(2)
    .with_run_id("run-2")
    .start()?;

  assert_eq!(first.run().hold().hold_duration(), Duration::from_secs(10));
  assert_eq!(coordinator.current_run().unwrap().run_id(), "run-2");

  let (first, second) = tokio::join!(first.finish(), second.finish());
  for hold in first.holds() {
    assert!(matches!(hold, HoldOutcome::Completed { held, .. } if *held == Duration::from_secs(10)));
  }
  for hold in second.holds() {
    assert!(matches!(hold, HoldOutcome::Completed { held, .. } if *held == Duration::from_secs(3)));
  }
  Ok(())
}

// --- Test: back-to-back runs on one coordinator each get their own shutdown hold ---
#[tokio::test(start_paused = true)]
async fn test_consecutive_runs_each_hold_once() -> anyhow::Result<()> {
  common::setup_tracing();
  let coordinator = Arc::new(LifecycleCoordinator::new(OperatingMode::Unattended));
  let client = MockClient::new();
  let stats = client.stats();
  let client: Arc<dyn ProtocolClient> = Arc::new(client);

  let first = LoadRun::new(mock_config(Duration::from_secs(5)), client.clone(), coordinator.clone())
    .with_users(3)
    .start()?
    .finish()
    .await;
  assert_eq!(first.shutdown_holds(), 1);

  let started = Instant::now();
  let second = LoadRun::new(mock_config(Duration::from_secs(10)), client, coordinator.clone())
    .with_users(3)
    .start()?
    .finish()
    .await;

  assert_ne!(first.run_id(), second.run_id());
  assert_eq!(started.elapsed(), Duration::from_secs(10));
  assert_eq!(second.shutdown_holds(), 1);
  let performed = second.shutdown().iter().filter(|s| **s == ShutdownHold::Performed).count();
  assert_eq!(performed, 1);
  assert_eq!(stats.disconnects(), 6);
  assert_eq!(stats.open(), 0);
  Ok(())
}

// --- Test: reusing one run id after it finished still holds for the new run ---
#[tokio::test(start_paused = true)]
async fn test_reused_run_id_gets_fresh_hold() -> anyhow::Result<()> {
  common::setup_tracing();
  let coordinator = Arc::new(LifecycleCoordinator::new(OperatingMode::Unattended));
  let client: Arc<dyn ProtocolClient> = Arc::new(MockClient::new());

  LoadRun::new(mock_config(Duration::from_secs(5)), client.clone(), coordinator.clone())
    .with_run_id("nightly")
    .start()?
    .finish()
    .await;

  let started = Instant::now();
  let second = LoadRun::new(mock_config(Duration::from_secs(10)), client, coordinator)
    .with_run_id("nightly")
    .with_users(2)
    .start()?;
  assert_eq!(second.run().hold().hold_duration(), Duration::from_secs(10));
  let report = second.finish().await;
  assert_eq!(started.elapsed(), Duration::from_secs(10));
  assert!(report.shutdown().contains(&ShutdownHold::Performed));
  Ok(())
}

#[tokio::test]
async fn test_zero_users_is_rejected() {
  let result = load(SamplerConfig::default(), MockClient::new(), OperatingMode::Attended, 0).start();
  assert!(result.is_err());
}
