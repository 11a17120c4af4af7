// tests/common.rs
#![allow(dead_code)] // Not every test file uses every helper

use connhold::client::mqtt::codec::MqttCodec;
use connhold::client::mqtt::packet::{ConnectReturnCode, Packet, SubscribeReturnCode};
use connhold::{Connection, ConnectionParameters, ProtocolClient, QoS, SamplerConfig, SamplerError};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

static TRACING_INIT: Once = Once::new();

pub fn setup_tracing() {
  TRACING_INIT.call_once(|| {
    // Can be overridden by RUST_LOG env variable
    let default_filter = "connhold=debug";
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let subscriber = FmtSubscriber::builder()
      .with_env_filter(env_filter)
      .with_target(true)
      .with_line_number(true)
      .with_test_writer()
      .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set global tracing subscriber");
  });
}

// --- Scripted in-process client ---

#[derive(Debug, Default)]
pub struct MockStats {
  pub connects: AtomicUsize,
  pub subscribes: AtomicUsize,
  pub disconnects: AtomicUsize,
  /// Connections handed out and not yet disconnected or dropped.
  pub open: AtomicUsize,
}

impl MockStats {
  pub fn connects(&self) -> usize {
    self.connects.load(Ordering::SeqCst)
  }
  pub fn subscribes(&self) -> usize {
    self.subscribes.load(Ordering::SeqCst)
  }
  pub fn disconnects(&self) -> usize {
    self.disconnects.load(Ordering::SeqCst)
  }
  pub fn open(&self) -> usize {
    self.open.load(Ordering::SeqCst)
  }
}

/// A `ProtocolClient` whose behaviour is fixed up front.
#[derive(Debug, Default)]
pub struct MockClient {
  pub stats: Arc<MockStats>,
  connect_delay: Duration,
  refuse_connect: bool,
  reject_subscribe: bool,
}

impl MockClient {
  pub fn new() -> Self {
    Self::default()
  }

  /// Connect never completes within `delay`; pair with a shorter connect timeout.
  pub fn with_connect_delay(mut self, delay: Duration) -> Self {
    self.connect_delay = delay;
    self
  }

  pub fn refusing(mut self) -> Self {
    self.refuse_connect = true;
    self
  }

  pub fn rejecting_subscribe(mut self) -> Self {
    self.reject_subscribe = true;
    self
  }

  pub fn stats(&self) -> Arc<MockStats> {
    self.stats.clone()
  }
}

#[async_trait]
impl ProtocolClient for MockClient {
  async fn connect(&self, params: &ConnectionParameters) -> Result<Box<dyn Connection>, SamplerError> {
    let n = self.stats.connects.fetch_add(1, Ordering::SeqCst) + 1;
    if !self.connect_delay.is_zero() {
      tokio::time::sleep(self.connect_delay).await;
    }
    if self.refuse_connect {
      return Err(SamplerError::ConnectionRefused(params.endpoint()));
    }
    self.stats.open.fetch_add(1, Ordering::SeqCst);
    let connection = MockConnection {
      description: format!("mock/{}#{}", params.client_id(), n),
      reject_subscribe: self.reject_subscribe,
      stats: self.stats.clone(),
      released: AtomicBool::new(false),
    };
    Ok(Box::new(connection) as Box<dyn Connection>)
  }
}

#[derive(Debug)]
pub struct MockConnection {
  description: String,
  reject_subscribe: bool,
  stats: Arc<MockStats>,
  released: AtomicBool,
}

impl MockConnection {
  fn release(&self) {
    if !self.released.swap(true, Ordering::SeqCst) {
      self.stats.open.fetch_sub(1, Ordering::SeqCst);
    }
  }
}

#[async_trait]
impl Connection for MockConnection {
  fn description(&self) -> String {
    self.description.clone()
  }

  fn is_connected(&self) -> bool {
    !self.released.load(Ordering::SeqCst)
  }

  async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<QoS, SamplerError> {
    self.stats.subscribes.fetch_add(1, Ordering::SeqCst);
    if self.reject_subscribe {
      Err(SamplerError::SubscribeRejected(topic.to_string()))
    } else {
      Ok(qos)
    }
  }

  async fn disconnect(self: Box<Self>) -> Result<(), SamplerError> {
    self.stats.disconnects.fetch_add(1, Ordering::SeqCst);
    self.release();
    Ok(())
  }
}

impl Drop for MockConnection {
  fn drop(&mut self) {
    self.release();
  }
}

// --- Loopback MQTT broker for the real client ---

/// Lets a dropped session reach its hold before the broker closes it.
const SESSION_DROP_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy)]
pub struct BrokerBehavior {
  pub connack: ConnectReturnCode,
  pub reject_subscribe: bool,
  /// Accept TCP but never answer CONNECT.
  pub silent: bool,
  /// Close the first N sessions on CONNECT without a CONNACK.
  pub refuse_first: usize,
  /// Close the first N sessions shortly after sending their SUBACK.
  pub drop_after_suback: usize,
}

impl Default for BrokerBehavior {
  fn default() -> Self {
    Self {
      connack: ConnectReturnCode::Accepted,
      reject_subscribe: false,
      silent: false,
      refuse_first: 0,
      drop_after_suback: 0,
    }
  }
}

#[derive(Debug, Default)]
pub struct BrokerStats {
  pub connects: AtomicUsize,
  pub subscribes: AtomicUsize,
  pub disconnects: AtomicUsize,
  pub pings: AtomicUsize,
  pub open: AtomicUsize,
  pub dropped_sessions: AtomicUsize,
  pub client_ids: Mutex<Vec<String>>,
  pub topics: Mutex<Vec<String>>,
  pub credentials: Mutex<Vec<(Option<String>, Option<String>)>>,
}

impl BrokerStats {
  pub fn connects(&self) -> usize {
    self.connects.load(Ordering::SeqCst)
  }
  pub fn subscribes(&self) -> usize {
    self.subscribes.load(Ordering::SeqCst)
  }
  pub fn disconnects(&self) -> usize {
    self.disconnects.load(Ordering::SeqCst)
  }
  pub fn pings(&self) -> usize {
    self.pings.load(Ordering::SeqCst)
  }
  pub fn open(&self) -> usize {
    self.open.load(Ordering::SeqCst)
  }
  pub fn dropped_sessions(&self) -> usize {
    self.dropped_sessions.load(Ordering::SeqCst)
  }
}

pub struct MiniBroker {
  addr: SocketAddr,
  pub stats: Arc<BrokerStats>,
  task: JoinHandle<()>,
}

impl MiniBroker {
  pub async fn start(behavior: BrokerBehavior) -> Self {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("Failed to bind mini broker");
    let addr = listener.local_addr().expect("Mini broker has no local address");
    let stats = Arc::new(BrokerStats::default());

    let accept_stats = stats.clone();
    let task = tokio::spawn(async move {
      while let Ok((stream, _)) = listener.accept().await {
        tokio::spawn(serve(stream, behavior, accept_stats.clone()));
      }
    });

    Self { addr, stats, task }
  }

  pub fn port(&self) -> u16 {
    self.addr.port()
  }

  /// A config pointing at this broker with a short connect timeout.
  pub fn config(&self) -> SamplerConfig {
    let mut config = SamplerConfig::default();
    config.server = self.addr.ip().to_string();
    config.port = self.port();
    config.connect_timeout = Duration::from_secs(2);
    config
  }
}

impl Drop for MiniBroker {
  fn drop(&mut self) {
    self.task.abort();
  }
}

async fn serve(stream: TcpStream, behavior: BrokerBehavior, stats: Arc<BrokerStats>) {
  stats.open.fetch_add(1, Ordering::SeqCst);
  let mut framed = Framed::new(stream, MqttCodec::new());

  while let Some(frame) = framed.next().await {
    let reply = match frame {
      Ok(Packet::Connect(connect)) => {
        let n = stats.connects.fetch_add(1, Ordering::SeqCst) + 1;
        stats.client_ids.lock().push(connect.client_id.clone());
        stats.credentials.lock().push((connect.username.clone(), connect.password.clone()));
        if n <= behavior.refuse_first {
          break;
        }
        if behavior.silent {
          continue;
        }
        Packet::ConnAck {
          session_present: false,
          code: behavior.connack,
        }
      }
      Ok(Packet::Subscribe { packet_id, filters }) => {
        stats.subscribes.fetch_add(1, Ordering::SeqCst);
        stats.topics.lock().extend(filters.iter().map(|(topic, _)| topic.clone()));
        let return_codes = filters
          .iter()
          .map(|(_, qos)| {
            if behavior.reject_subscribe {
              SubscribeReturnCode::Failure
            } else {
              SubscribeReturnCode::Granted(*qos)
            }
          })
          .collect();
        Packet::SubAck { packet_id, return_codes }
      }
      Ok(Packet::PingReq) => {
        stats.pings.fetch_add(1, Ordering::SeqCst);
        Packet::PingResp
      }
      Ok(Packet::Disconnect) => {
        stats.disconnects.fetch_add(1, Ordering::SeqCst);
        break;
      }
      Ok(_) => continue,
      Err(_) => break,
    };

    let refused = matches!(&reply, Packet::ConnAck { code, .. } if *code != ConnectReturnCode::Accepted);
    let drop_session = matches!(&reply, Packet::SubAck { .. })
      && stats
        .dropped_sessions
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
          (n < behavior.drop_after_suback).then_some(n + 1)
        })
        .is_ok();
    if framed.send(reply).await.is_err() || refused {
      break;
    }
    if drop_session {
      tokio::time::sleep(SESSION_DROP_DELAY).await;
      break;
    }
  }

  stats.open.fetch_sub(1, Ordering::SeqCst);
}

/// A port on localhost with nothing listening.
pub async fn closed_port() -> u16 {
  let listener = TcpListener::bind("127.0.0.1:0").await.expect("Failed to bind probe listener");
  let port = listener.local_addr().expect("Probe listener has no address").port();
  drop(listener);
  port
}

pub fn mock_config(hold: Duration) -> SamplerConfig {
  let mut config = SamplerConfig::default();
  config.hold_duration = hold;
  config.connect_timeout = Duration::from_secs(2);
  config
}

/// Polls `check` until it holds or `limit` passes. Returns the final verdict.
pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
  let deadline = tokio::time::Instant::now() + limit;
  while tokio::time::Instant::now() < deadline {
    if check() {
      return true;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  check()
}
