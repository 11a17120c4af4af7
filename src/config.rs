// src/config.rs

//! Sampler options as the harness supplies them, and the per-attempt
//! `ConnectionParameters` derived from them.

use crate::error::SamplerError;

use rand::distr::Alphanumeric;
use rand::Rng;
use std::fmt;
use std::time::Duration;

// Option keys, matching the property names used by MQTT test plans.
pub const SERVER: &str = "server";
pub const PORT: &str = "port";
pub const PROTOCOL: &str = "protocol";
pub const CONN_PREFIX: &str = "conn_prefix";
pub const CONN_CLIENT_ID_SUFFIX: &str = "conn_client_id_suffix";
pub const CONN_KEEP_ALIVE: &str = "conn_keep_alive";
pub const CONN_ATTEMPT_MAX: &str = "conn_attempt_max";
pub const CONN_RECONNECT_ATTEMPT_MAX: &str = "conn_reconnect_attempt_max";
pub const CONN_TIMEOUT: &str = "conn_timeout";
pub const CONN_KEEP_TIME: &str = "conn_keep_time";
pub const USER_NAME: &str = "user_name";
pub const PASSWORD: &str = "password";

pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_CONN_PREFIX: &str = "conn_";
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(300);
pub const DEFAULT_CONN_TIMEOUT: Duration = Duration::from_secs(10);

/// MQTT 3.1.1 servers must accept client ids up to this length.
pub const MAX_PORTABLE_CLIENT_ID_LEN: usize = 23;
const CLIENT_ID_SUFFIX_LEN: usize = 8;

/// Transport security mode for the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
  /// Plaintext TCP, the default.
  #[default]
  Tcp,
  /// TLS over TCP. Requires a `SecurityContext` on the client.
  Ssl,
}

impl Transport {
  pub fn scheme(&self) -> &'static str {
    match self {
      Transport::Tcp => "tcp",
      Transport::Ssl => "ssl",
    }
  }

  pub fn is_secured(&self) -> bool {
    !matches!(self, Transport::Tcp)
  }
}

impl fmt::Display for Transport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Transport::Tcp => "TCP",
      Transport::Ssl => "SSL",
    })
  }
}

/// Everything needed to open one broker connection. Built fresh for every sample attempt.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParameters {
  host: String,
  port: u16,
  transport: Transport,
  client_id: String,
  keep_alive: Duration,
  connect_attempts_max: u32,
  reconnect_attempts_max: u32,
  connect_timeout: Duration,
  username: Option<String>,
  password: Option<String>,
}

impl ConnectionParameters {
  pub fn host(&self) -> &str {
    &self.host
  }
  pub fn port(&self) -> u16 {
    self.port
  }
  pub fn transport(&self) -> Transport {
    self.transport
  }
  pub fn client_id(&self) -> &str {
    &self.client_id
  }
  pub fn keep_alive(&self) -> Duration {
    self.keep_alive
  }
  pub fn connect_attempts_max(&self) -> u32 {
    self.connect_attempts_max
  }
  pub fn reconnect_attempts_max(&self) -> u32 {
    self.reconnect_attempts_max
  }
  pub fn connect_timeout(&self) -> Duration {
    self.connect_timeout
  }
  pub fn username(&self) -> Option<&str> {
    self.username.as_deref()
  }
  pub fn password(&self) -> Option<&str> {
    self.password.as_deref()
  }

  /// `tcp://host:port` style URI used in logs and connection descriptions.
  pub fn endpoint(&self) -> String {
    format!("{}://{}:{}", self.transport.scheme(), self.host, self.port)
  }

  /// The per-client topic every virtual user subscribes to.
  pub fn topic(&self) -> String {
    format!("topic_{}", self.client_id)
  }
}

impl fmt::Debug for ConnectionParameters {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ConnectionParameters")
      .field("endpoint", &self.endpoint())
      .field("client_id", &self.client_id)
      .field("keep_alive", &self.keep_alive)
      .field("connect_attempts_max", &self.connect_attempts_max)
      .field("reconnect_attempts_max", &self.reconnect_attempts_max)
      .field("connect_timeout", &self.connect_timeout)
      .field("username", &self.username)
      .field("password", &self.password.as_ref().map(|_| "<redacted>"))
      .finish()
  }
}

/// Holds parsed and validated sampler options for one test run.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
  pub server: String,
  pub port: u16,
  pub transport: Transport,
  pub conn_prefix: String,
  pub client_id_suffix: bool,
  pub keep_alive: Duration,
  /// 0 means a single attempt.
  pub connect_attempts_max: u32,
  pub reconnect_attempts_max: u32,
  pub connect_timeout: Duration,
  /// How long a successfully subscribed connection is kept open.
  pub hold_duration: Duration,
  pub username: Option<String>,
  pub password: Option<String>,
}

impl Default for SamplerConfig {
  fn default() -> Self {
    Self {
      server: "127.0.0.1".to_string(),
      port: DEFAULT_PORT,
      transport: Transport::Tcp,
      conn_prefix: DEFAULT_CONN_PREFIX.to_string(),
      client_id_suffix: true,
      keep_alive: DEFAULT_KEEP_ALIVE,
      connect_attempts_max: 0,
      reconnect_attempts_max: 0,
      connect_timeout: DEFAULT_CONN_TIMEOUT,
      hold_duration: Duration::ZERO,
      username: None,
      password: None,
    }
  }
}

impl SamplerConfig {
  /// Applies one string-keyed option, as delivered by a test plan.
  pub fn set_option(&mut self, option: &str, value: &str) -> Result<(), SamplerError> {
    match option {
      SERVER => {
        let host = value.trim();
        if host.is_empty() {
          return Err(invalid_value(SERVER, value));
        }
        self.server = host.to_string();
      }
      PORT => self.port = parse_u16_option(PORT, value)?,
      PROTOCOL => self.transport = parse_transport_option(value)?,
      CONN_PREFIX => self.conn_prefix = value.trim().to_string(),
      CONN_CLIENT_ID_SUFFIX => self.client_id_suffix = parse_bool_option(CONN_CLIENT_ID_SUFFIX, value)?,
      CONN_KEEP_ALIVE => self.keep_alive = parse_secs_option(CONN_KEEP_ALIVE, value)?,
      CONN_ATTEMPT_MAX => self.connect_attempts_max = parse_count_option(CONN_ATTEMPT_MAX, value)?,
      CONN_RECONNECT_ATTEMPT_MAX => {
        self.reconnect_attempts_max = parse_count_option(CONN_RECONNECT_ATTEMPT_MAX, value)?
      }
      CONN_TIMEOUT => self.connect_timeout = parse_secs_option(CONN_TIMEOUT, value)?,
      CONN_KEEP_TIME => self.hold_duration = parse_secs_option(CONN_KEEP_TIME, value)?,
      USER_NAME => self.username = parse_optional_string(value),
      PASSWORD => self.password = parse_optional_string(value),
      _ => return Err(SamplerError::InvalidOption(option.to_string())),
    }
    Ok(())
  }

  /// Builds a config from `(key, value)` pairs on top of the defaults.
  pub fn from_options<'a, I>(options: I) -> Result<Self, SamplerError>
  where
    I: IntoIterator<Item = (&'a str, &'a str)>,
  {
    let mut config = Self::default();
    for (key, value) in options {
      config.set_option(key, value)?;
    }
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), SamplerError> {
    if self.server.trim().is_empty() {
      return Err(invalid_value(SERVER, &self.server));
    }
    if self.port == 0 {
      return Err(invalid_value(PORT, "0"));
    }
    if self.conn_prefix.is_empty() {
      return Err(invalid_value(CONN_PREFIX, ""));
    }
    if self.keep_alive.as_secs() > u16::MAX as u64 {
      return Err(invalid_value(CONN_KEEP_ALIVE, &self.keep_alive.as_secs().to_string()));
    }
    Ok(())
  }

  /// Derives the parameters for one sample attempt, generating the client id.
  pub fn connection_parameters(&self) -> ConnectionParameters {
    let client_id = if self.client_id_suffix {
      generate_client_id(&self.conn_prefix)
    } else {
      self.conn_prefix.clone()
    };

    ConnectionParameters {
      host: self.server.clone(),
      port: self.port,
      transport: self.transport,
      client_id,
      keep_alive: self.keep_alive,
      connect_attempts_max: self.connect_attempts_max,
      reconnect_attempts_max: self.reconnect_attempts_max,
      connect_timeout: self.connect_timeout,
      username: self.username.clone(),
      password: self.password.clone(),
    }
  }
}

/// Appends a random alphanumeric suffix to `prefix`. The prefix is shortened when needed
/// so the id fits within `MAX_PORTABLE_CLIENT_ID_LEN`.
pub fn generate_client_id(prefix: &str) -> String {
  let keep = MAX_PORTABLE_CLIENT_ID_LEN - CLIENT_ID_SUFFIX_LEN;
  let mut id: String = prefix.chars().take(keep).collect();
  id.extend(
    rand::rng()
      .sample_iter(&Alphanumeric)
      .take(CLIENT_ID_SUFFIX_LEN)
      .map(char::from),
  );
  id
}

// --- Helper functions for parsing option values ---

fn invalid_value(option: &'static str, value: &str) -> SamplerError {
  SamplerError::InvalidOptionValue {
    option,
    value: value.to_string(),
  }
}

pub(crate) fn parse_u16_option(option: &'static str, value: &str) -> Result<u16, SamplerError> {
  value.trim().parse::<u16>().map_err(|_| invalid_value(option, value))
}

/// Whole, non-negative seconds.
pub(crate) fn parse_secs_option(option: &'static str, value: &str) -> Result<Duration, SamplerError> {
  value
    .trim()
    .parse::<u64>()
    .map(Duration::from_secs)
    .map_err(|_| invalid_value(option, value))
}

pub(crate) fn parse_count_option(option: &'static str, value: &str) -> Result<u32, SamplerError> {
  value.trim().parse::<u32>().map_err(|_| invalid_value(option, value))
}

pub(crate) fn parse_bool_option(option: &'static str, value: &str) -> Result<bool, SamplerError> {
  match value.trim().to_ascii_lowercase().as_str() {
    "true" | "1" | "yes" => Ok(true),
    "false" | "0" | "no" => Ok(false),
    _ => Err(invalid_value(option, value)),
  }
}

pub(crate) fn parse_transport_option(value: &str) -> Result<Transport, SamplerError> {
  match value.trim().to_ascii_uppercase().as_str() {
    "TCP" => Ok(Transport::Tcp),
    "SSL" | "TLS" => Ok(Transport::Ssl),
    _ => Err(invalid_value(PROTOCOL, value)),
  }
}

/// Blank credentials mean "not set".
fn parse_optional_string(value: &str) -> Option<String> {
  if value.trim().is_empty() {
    None
  } else {
    Some(value.to_string())
  }
}
