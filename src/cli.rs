//! Command-line interface definitions

use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Capture MySQL traffic from packet traces and replay it against a
/// target database
#[derive(Debug, Parser)]
#[command(name = "mysql-replay", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Decode pcap files into per-session event logs
    Dump(DumpArgs),
    /// Replay event logs against a target database
    Play(PlayArgs),
    /// Run a remote replay agent
    Agent(AgentArgs),
}

#[derive(Debug, Args)]
pub struct DumpArgs {
    /// pcap files to process, in order
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Output directory for session files
    #[arg(short, long, default_value = ".")]
    pub output: PathBuf,

    /// Accept streams even if no SYN has been seen
    #[arg(long)]
    pub force_start: bool,

    /// How often to report throughput
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    pub report_interval: Duration,

    /// Capture-time interval between idle-stream flushes
    #[arg(long, default_value = "1m", value_parser = humantime::parse_duration)]
    pub flush_interval: Duration,
}

#[derive(Debug, Args)]
pub struct PlayArgs {
    /// Directory of session files to replay
    pub input: PathBuf,

    #[command(flatten)]
    pub options: PlayOptionArgs,

    /// Remote agent base URLs; empty replays in-process
    #[arg(long, value_delimiter = ',')]
    pub agents: Vec<String>,

    /// How often to report progress
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    pub report_interval: Duration,
}

#[derive(Debug, Args)]
pub struct AgentArgs {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:7077")]
    pub listen: SocketAddr,

    /// Directory for uploaded session files
    #[arg(long, default_value = "./agent-data")]
    pub data_dir: PathBuf,

    #[command(flatten)]
    pub options: PlayOptionArgs,
}

/// Replay options shared by `play` and `agent`
#[derive(Debug, Args)]
pub struct PlayOptionArgs {
    /// Target DSN, `user:pass@tcp(host:port)/schema`
    #[arg(long, env = "MYSQL_REPLAY_TARGET_DSN")]
    pub target_dsn: Option<String>,

    /// Speed ratio; 0 disables pacing
    #[arg(long, default_value_t = 1.0)]
    pub speed: f64,

    /// Print events instead of applying them
    #[arg(long)]
    pub dry_run: bool,

    /// Longest accepted event-log line in bytes
    #[arg(long, default_value_t = 16 << 20)]
    pub max_line_size: usize,

    /// Deadline for a single query
    #[arg(long, default_value = "1m", value_parser = humantime::parse_duration)]
    pub query_timeout: Duration,
}

impl PlayOptionArgs {
    pub fn to_options(&self) -> crate::error::Result<crate::replay::PlayOptions> {
        let target_dsn: Option<crate::db::Dsn> = self
            .target_dsn
            .as_deref()
            .map(str::parse)
            .transpose()?;
        Ok(crate::replay::PlayOptions {
            dry_run: self.dry_run,
            speed: self.speed,
            max_line_size: self.max_line_size,
            query_timeout: self.query_timeout,
            target_dsn,
        })
    }
}
