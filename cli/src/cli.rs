use clap::{builder::TypedValueParser, Parser};

#[derive(Parser, Debug)]
#[clap(name = "connhold", version, about = "MQTT connection-hold load driver")]
pub struct Cli {
  #[clap(subcommand)]
  pub command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
  /// Open, hold and close connections against a broker
  Run(RunArgs),
}

#[derive(Parser, Debug)]
pub struct RunArgs {
  /// Broker host name or address
  #[clap(long, short, default_value = "127.0.0.1")]
  pub server: String,

  /// Broker port
  #[clap(long, short, default_value_t = 1883)]
  pub port: u16,

  /// Number of virtual users, one connection each
  #[clap(long, short, default_value_t = 1)]
  pub users: usize,

  /// Seconds each connection is held open after subscribing
  #[clap(long = "keep-time", short = 'k', default_value_t = 0)]
  pub keep_time: u64,

  /// Who performs the hold: each connection on its own, or one shared hold at test end
  #[clap(long, value_parser = clap::builder::PossibleValuesParser::new(["attended", "unattended"]).map(|s| s.to_lowercase()), default_value = "unattended")]
  pub mode: String,

  /// Client id prefix
  #[clap(long, default_value = "conn_")]
  pub prefix: String,

  /// Use the prefix as the client id without a random suffix
  #[clap(long, action)]
  pub no_suffix: bool,

  /// MQTT keep-alive in seconds
  #[clap(long, default_value_t = 300)]
  pub keep_alive: u64,

  /// Connect timeout in seconds
  #[clap(long, default_value_t = 10)]
  pub timeout: u64,

  /// Extra connect attempts after the first failure
  #[clap(long, default_value_t = 0)]
  pub attempts: u32,

  /// Reconnect attempts after an established connection drops
  #[clap(long, default_value_t = 0)]
  pub reconnect_attempts: u32,

  #[clap(long)]
  pub user_name: Option<String>,

  #[clap(long)]
  pub password: Option<String>,

  /// Identifier for this run, used in logs. Generated when omitted
  #[clap(long)]
  pub run_id: Option<String>,
}
