// src/client/mqtt/mod.rs

//! A small MQTT 3.1.1 client: enough to connect, subscribe, keep the session alive and
//! disconnect. Each connection is driven by one background task reached through a mailbox.

pub mod codec;
pub mod packet;

use self::codec::MqttCodec;
use self::packet::{Connect, ConnectReturnCode, Packet, SubscribeReturnCode};
use crate::client::{BoxedStream, Connection, ProtocolClient, QoS, SecurityContext};
use crate::config::ConnectionParameters;
use crate::error::SamplerError;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Interval, MissedTickBehavior};
use tokio_util::codec::Framed;

type MqttFramed = Framed<BoxedStream, MqttCodec>;

const DRIVER_MAILBOX_CAPACITY: usize = 16;
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(10);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Opens MQTT sessions over TCP, or over TLS when a `SecurityContext` is configured.
#[derive(Clone, Default)]
pub struct MqttClient {
  security: Option<Arc<dyn SecurityContext>>,
}

impl MqttClient {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_security_context(security: Arc<dyn SecurityContext>) -> Self {
    Self {
      security: Some(security),
    }
  }
}

impl fmt::Debug for MqttClient {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MqttClient")
      .field("security_context", &self.security.is_some())
      .finish()
  }
}

#[async_trait]
impl ProtocolClient for MqttClient {
  async fn connect(&self, params: &ConnectionParameters) -> Result<Box<dyn Connection>, SamplerError> {
    if params.transport().is_secured() && self.security.is_none() {
      return Err(SamplerError::SecurityError(format!(
        "{} transport requested but no security context is configured",
        params.transport()
      )));
    }

    let dialer = Dialer {
      params: params.clone(),
      security: self.security.clone(),
    };
    let framed = dialer.dial_with_retries(params.connect_attempts_max()).await?;

    let description = format!("{}/{}", params.endpoint(), params.client_id());
    let connected = Arc::new(AtomicBool::new(true));
    let (command_tx, command_rx) = async_channel::bounded(DRIVER_MAILBOX_CAPACITY);

    let driver = ConnectionDriver {
      framed,
      commands: command_rx,
      connected: connected.clone(),
      keep_alive: keep_alive_interval(params.keep_alive()),
      awaiting_pong: false,
      next_packet_id: 1,
      pending: HashMap::new(),
      subscriptions: Vec::new(),
      dialer,
      description: description.clone(),
    };
    let driver_handle = tokio::spawn(driver.run());

    Ok(Box::new(MqttConnection {
      description,
      commands: command_tx,
      connected,
      op_timeout: params.connect_timeout(),
      driver: Some(driver_handle),
    }))
  }
}

/// MQTT keep-alive of 0 disables pings.
fn keep_alive_interval(keep_alive: Duration) -> Option<Duration> {
  if keep_alive.is_zero() {
    None
  } else {
    Some(keep_alive)
  }
}

/// Opens the transport and runs the CONNECT/CONNACK exchange.
struct Dialer {
  params: ConnectionParameters,
  security: Option<Arc<dyn SecurityContext>>,
}

impl Dialer {
  async fn dial_with_retries(&self, retries: u32) -> Result<MqttFramed, SamplerError> {
    let mut delay = INITIAL_RETRY_DELAY;
    let mut attempt = 0u32;
    loop {
      attempt += 1;
      match self.dial().await {
        Ok(framed) => return Ok(framed),
        Err(e) if attempt <= retries && e.is_retryable_connect_error() => {
          tracing::debug!(
            endpoint = %self.params.endpoint(),
            client_id = self.params.client_id(),
            attempt,
            error = %e,
            ?delay,
            "Connect attempt failed, retrying"
          );
          tokio::time::sleep(delay).await;
          delay = (delay * 2).min(MAX_RETRY_DELAY);
        }
        Err(e) => return Err(e),
      }
    }
  }

  async fn dial(&self) -> Result<MqttFramed, SamplerError> {
    let endpoint = self.params.endpoint();
    let addr = tokio::net::lookup_host((self.params.host(), self.params.port()))
      .await
      .map_err(|e| SamplerError::EndpointResolutionFailed(format!("{}: {}", endpoint, e)))?
      .next()
      .ok_or_else(|| SamplerError::EndpointResolutionFailed(endpoint.clone()))?;
    let tcp = TcpStream::connect(addr)
      .await
      .map_err(|e| SamplerError::from_io_endpoint(e, &endpoint))?;
    tcp.set_nodelay(true)?;

    let stream: BoxedStream = match (&self.security, self.params.transport().is_secured()) {
      (Some(security), true) => security.secure(tcp, self.params.host()).await?,
      _ => Box::new(tcp),
    };

    let mut framed = Framed::new(stream, MqttCodec::new());
    framed
      .send(Packet::Connect(Connect {
        client_id: self.params.client_id().to_string(),
        keep_alive_secs: self.params.keep_alive().as_secs().min(u16::MAX as u64) as u16,
        clean_session: true,
        username: self.params.username().map(str::to_string),
        password: self.params.password().map(str::to_string),
      }))
      .await?;

    match framed.next().await {
      Some(Ok(Packet::ConnAck { code, .. })) => match code {
        ConnectReturnCode::Accepted => {
          tracing::trace!(endpoint = %endpoint, client_id = self.params.client_id(), "CONNACK accepted");
          Ok(framed)
        }
        ConnectReturnCode::BadUserNameOrPassword | ConnectReturnCode::NotAuthorized => {
          Err(SamplerError::AuthenticationFailure(format!("{:?}", code)))
        }
        other => Err(SamplerError::ProtocolViolation(format!("CONNACK refused: {:?}", other))),
      },
      Some(Ok(other)) => Err(SamplerError::ProtocolViolation(format!(
        "expected CONNACK, received {}",
        other.name()
      ))),
      Some(Err(e)) => Err(e),
      None => Err(SamplerError::ConnectionClosed),
    }
  }
}

enum DriverCommand {
  Subscribe {
    topic: String,
    qos: QoS,
    reply: oneshot::Sender<Result<QoS, SamplerError>>,
  },
  Disconnect {
    reply: oneshot::Sender<Result<(), SamplerError>>,
  },
}

struct PendingSubscribe {
  topic: String,
  qos: QoS,
  /// `None` for re-subscriptions issued after a reconnect.
  reply: Option<oneshot::Sender<Result<QoS, SamplerError>>>,
}

/// Owns the framed transport of one session: answers commands, acknowledges keep-alives and
/// reconnects within the configured attempt budget.
struct ConnectionDriver {
  framed: MqttFramed,
  commands: async_channel::Receiver<DriverCommand>,
  connected: Arc<AtomicBool>,
  keep_alive: Option<Duration>,
  awaiting_pong: bool,
  next_packet_id: u16,
  pending: HashMap<u16, PendingSubscribe>,
  subscriptions: Vec<(String, QoS)>,
  dialer: Dialer,
  description: String,
}

impl ConnectionDriver {
  async fn run(mut self) {
    let mut ping = self.new_ping_interval();

    loop {
      tokio::select! {
        command = self.commands.recv() => match command {
          Ok(DriverCommand::Subscribe { topic, qos, reply }) => {
            self.start_subscribe(topic, qos, Some(reply)).await;
          }
          Ok(DriverCommand::Disconnect { reply }) => {
            let result = self.send_disconnect().await;
            let _ = reply.send(result);
            break;
          }
          Err(_) => {
            // Handle dropped without an explicit disconnect.
            tracing::debug!(connection = %self.description, "Connection handle dropped, closing transport");
            break;
          }
        },

        frame = self.framed.next() => match frame {
          Some(Ok(packet)) => self.on_packet(packet),
          Some(Err(e)) => {
            tracing::warn!(connection = %self.description, error = %e, "Connection read failed");
            if !self.reconnect().await {
              break;
            }
            ping = self.new_ping_interval();
          }
          None => {
            tracing::info!(connection = %self.description, "Connection closed by broker");
            if !self.reconnect().await {
              break;
            }
            ping = self.new_ping_interval();
          }
        },

        _ = next_tick(&mut ping) => {
          if self.awaiting_pong {
            tracing::warn!(connection = %self.description, "No PINGRESP within keep-alive interval");
            if !self.reconnect().await {
              break;
            }
            ping = self.new_ping_interval();
          } else if let Err(e) = self.framed.send(Packet::PingReq).await {
            tracing::warn!(connection = %self.description, error = %e, "Failed to send PINGREQ");
            if !self.reconnect().await {
              break;
            }
            ping = self.new_ping_interval();
          } else {
            self.awaiting_pong = true;
          }
        }
      }
    }

    self.connected.store(false, Ordering::Release);
    for (_, pending) in self.pending.drain() {
      if let Some(reply) = pending.reply {
        let _ = reply.send(Err(SamplerError::ConnectionClosed));
      }
    }
    tracing::trace!(connection = %self.description, "Connection driver stopped");
  }

  fn new_ping_interval(&self) -> Option<Interval> {
    self.keep_alive.map(|period| {
      let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
      interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
      interval
    })
  }

  fn allocate_packet_id(&mut self) -> u16 {
    let id = self.next_packet_id;
    // Packet id 0 is not allowed.
    self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
    id
  }

  async fn start_subscribe(
    &mut self,
    topic: String,
    qos: QoS,
    reply: Option<oneshot::Sender<Result<QoS, SamplerError>>>,
  ) {
    let packet_id = self.allocate_packet_id();
    let packet = Packet::Subscribe {
      packet_id,
      filters: vec![(topic.clone(), qos)],
    };
    match self.framed.send(packet).await {
      Ok(()) => {
        self.pending.insert(packet_id, PendingSubscribe { topic, qos, reply });
      }
      Err(e) => {
        if let Some(reply) = reply {
          let _ = reply.send(Err(e));
        }
      }
    }
  }

  fn on_packet(&mut self, packet: Packet) {
    match packet {
      Packet::SubAck { packet_id, return_codes } => {
        let Some(pending) = self.pending.remove(&packet_id) else {
          tracing::warn!(connection = %self.description, packet_id, "SUBACK for unknown packet id");
          return;
        };
        let result = match return_codes.first() {
          Some(SubscribeReturnCode::Granted(granted)) => {
            if !self.subscriptions.iter().any(|(t, _)| *t == pending.topic) {
              self.subscriptions.push((pending.topic.clone(), pending.qos));
            }
            Ok(*granted)
          }
          Some(SubscribeReturnCode::Failure) => Err(SamplerError::SubscribeRejected(pending.topic.clone())),
          None => Err(SamplerError::ProtocolViolation("SUBACK without return codes".into())),
        };
        match pending.reply {
          Some(reply) => {
            let _ = reply.send(result);
          }
          None => {
            if let Err(e) = result {
              tracing::warn!(connection = %self.description, error = %e, "Re-subscription after reconnect failed");
            }
          }
        }
      }
      Packet::PingResp => self.awaiting_pong = false,
      other => {
        tracing::trace!(connection = %self.description, packet = other.name(), "Ignoring packet");
      }
    }
  }

  async fn send_disconnect(&mut self) -> Result<(), SamplerError> {
    if !self.connected.load(Ordering::Acquire) {
      return Err(SamplerError::ConnectionClosed);
    }
    self.framed.send(Packet::Disconnect).await?;
    // Flush and shut the write half down; the broker closes its side after DISCONNECT.
    self.framed.close().await?;
    Ok(())
  }

  /// Re-establishes the session after a loss. Returns `false` once the budget is spent.
  async fn reconnect(&mut self) -> bool {
    self.connected.store(false, Ordering::Release);
    self.awaiting_pong = false;
    for (_, pending) in self.pending.drain() {
      if let Some(reply) = pending.reply {
        let _ = reply.send(Err(SamplerError::ConnectionClosed));
      }
    }

    let budget = self.dialer.params.reconnect_attempts_max();
    let op_timeout = self.dialer.params.connect_timeout();
    let mut delay = INITIAL_RETRY_DELAY;
    for attempt in 1..=budget {
      if self.commands.is_closed() {
        return false;
      }
      tokio::time::sleep(delay).await;
      delay = (delay * 2).min(MAX_RETRY_DELAY);

      match timeout(op_timeout, self.dialer.dial()).await {
        Ok(Ok(framed)) => {
          tracing::info!(connection = %self.description, attempt, "Reconnected");
          self.framed = framed;
          self.connected.store(true, Ordering::Release);
          for (topic, qos) in self.subscriptions.clone() {
            self.start_subscribe(topic, qos, None).await;
          }
          return true;
        }
        Ok(Err(e)) => {
          tracing::debug!(connection = %self.description, attempt, error = %e, "Reconnect attempt failed");
        }
        Err(_) => {
          tracing::debug!(connection = %self.description, attempt, "Reconnect attempt timed out");
        }
      }
    }
    false
  }
}

async fn next_tick(interval: &mut Option<Interval>) {
  match interval {
    Some(interval) => {
      interval.tick().await;
    }
    None => std::future::pending::<()>().await,
  }
}

/// Handle to a session driven by a background [`ConnectionDriver`] task.
pub struct MqttConnection {
  description: String,
  commands: async_channel::Sender<DriverCommand>,
  connected: Arc<AtomicBool>,
  op_timeout: Duration,
  driver: Option<JoinHandle<()>>,
}

impl fmt::Debug for MqttConnection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MqttConnection")
      .field("description", &self.description)
      .field("connected", &self.connected.load(Ordering::Relaxed))
      .finish()
  }
}

impl MqttConnection {
  async fn request<T>(
    &self,
    command: DriverCommand,
    reply_rx: oneshot::Receiver<Result<T, SamplerError>>,
  ) -> Result<T, SamplerError> {
    self
      .commands
      .send(command)
      .await
      .map_err(|_| SamplerError::ConnectionClosed)?;
    match timeout(self.op_timeout, reply_rx).await {
      Ok(Ok(result)) => result,
      Ok(Err(_)) => Err(SamplerError::ConnectionClosed),
      Err(_) => Err(SamplerError::Timeout),
    }
  }
}

#[async_trait]
impl Connection for MqttConnection {
  fn description(&self) -> String {
    self.description.clone()
  }

  fn is_connected(&self) -> bool {
    self.connected.load(Ordering::Acquire)
  }

  async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<QoS, SamplerError> {
    let (reply, reply_rx) = oneshot::channel();
    self
      .request(
        DriverCommand::Subscribe {
          topic: topic.to_string(),
          qos,
          reply,
        },
        reply_rx,
      )
      .await
  }

  async fn disconnect(mut self: Box<Self>) -> Result<(), SamplerError> {
    let (reply, reply_rx) = oneshot::channel();
    let result = self.request(DriverCommand::Disconnect { reply }, reply_rx).await;
    self.commands.close();
    if let Some(driver) = self.driver.take() {
      if timeout(self.op_timeout, driver).await.is_err() {
        tracing::warn!(connection = %self.description, "Connection driver did not stop in time");
      }
    }
    result
  }
}
