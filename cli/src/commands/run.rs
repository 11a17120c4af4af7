use crate::cli::RunArgs;

use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result};
use connhold::config as options;
use connhold::{LifecycleCoordinator, LoadRun, MqttClient, OperatingMode, RunReport, SamplerConfig};

fn sampler_config(args: &RunArgs) -> Result<SamplerConfig> {
  let port = args.port.to_string();
  let keep_alive = args.keep_alive.to_string();
  let timeout = args.timeout.to_string();
  let keep_time = args.keep_time.to_string();
  let attempts = args.attempts.to_string();
  let reconnect_attempts = args.reconnect_attempts.to_string();
  let suffix = (!args.no_suffix).to_string();

  let mut pairs = vec![
    (options::SERVER, args.server.as_str()),
    (options::PORT, port.as_str()),
    (options::CONN_PREFIX, args.prefix.as_str()),
    (options::CONN_CLIENT_ID_SUFFIX, suffix.as_str()),
    (options::CONN_KEEP_ALIVE, keep_alive.as_str()),
    (options::CONN_TIMEOUT, timeout.as_str()),
    (options::CONN_KEEP_TIME, keep_time.as_str()),
    (options::CONN_ATTEMPT_MAX, attempts.as_str()),
    (options::CONN_RECONNECT_ATTEMPT_MAX, reconnect_attempts.as_str()),
  ];
  if let Some(user_name) = args.user_name.as_deref() {
    pairs.push((options::USER_NAME, user_name));
  }
  if let Some(password) = args.password.as_deref() {
    pairs.push((options::PASSWORD, password));
  }

  SamplerConfig::from_options(pairs).context("Invalid sampler options")
}

fn operating_mode(mode: &str) -> OperatingMode {
  match mode {
    "attended" => OperatingMode::Attended,
    _ => OperatingMode::Unattended,
  }
}

pub async fn run_load(args: RunArgs) -> Result<()> {
  let config = sampler_config(&args)?;
  let coordinator = Arc::new(LifecycleCoordinator::new(operating_mode(&args.mode)));
  let client = Arc::new(MqttClient::new());

  let mut load = LoadRun::new(config, client, coordinator).with_users(args.users);
  if let Some(run_id) = &args.run_id {
    load = load.with_run_id(run_id.clone());
  }
  let running = load.start().context("Failed to start run")?;

  let stopper = running.stop_handle();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      let acknowledged = stopper.stop();
      tracing::warn!(acknowledged, "Interrupted, closing connections");
    }
  });

  let report = running.finish().await;
  print_summary(&report);
  Ok(())
}

fn print_summary(report: &RunReport) {
  println!("Run:          {}", report.run_id());
  println!("Samples:      {}", report.results().len());
  println!("Successes:    {}", report.successes());
  println!("Failures:     {}", report.failures());
  println!("Disconnects:  {}", report.disconnects());
  println!("Interrupted:  {}", report.interrupted());
  if let Some(average) = report.average_elapsed() {
    println!("Avg connect:  {:?}", average);
  }
  println!("Total time:   {:?}", report.elapsed());

  if let Some(failure) = report.results().iter().find(|r| !r.is_success()) {
    println!("First failure: {}", failure.response_message());
  }
}
