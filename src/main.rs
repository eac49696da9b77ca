//! mysql-replay binary entry point

use clap::Parser;
use mysql_replay::capture::{self, Assembler, PcapFileSource, TextDumpHandler};
use mysql_replay::cli::{AgentArgs, Cli, CliCommand, DumpArgs, PlayArgs};
use mysql_replay::db::MySqlDriver;
use mysql_replay::replay::{self, remote};
use mysql_replay::stats;
use mysql_replay::stream::state::EventHandler;
use mysql_replay::stream::FactoryOptions;
use mysql_replay::Result;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        CliCommand::Dump(args) => run_dump(args).await,
        CliCommand::Play(args) => run_play(args).await,
        CliCommand::Agent(args) => run_agent(args).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "exiting with error");
            ExitCode::FAILURE
        }
    }
}

async fn run_dump(args: DumpArgs) -> Result<()> {
    std::fs::create_dir_all(&args.output)?;
    let output = args.output.clone();
    let options = FactoryOptions {
        synchronized: true,
        force_start: args.force_start,
    };

    let reporter = spawn_throughput_reporter(args.report_interval);
    let started = std::time::Instant::now();

    let flush_ms = args.flush_interval.as_millis() as i64;
    let inputs = args.inputs.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut assembler = Assembler::new(
            options,
            Box::new(move |conn| match TextDumpHandler::create(&output, conn) {
                Ok(handler) => Some(Box::new(handler) as Box<dyn EventHandler>),
                Err(err) => {
                    error!(conn = %conn, error = %err, "failed to create session file");
                    None
                }
            }),
        );
        for input in inputs {
            info!(file = %input.display(), "processing");
            let mut source = PcapFileSource::open(&input)?;
            capture::run_capture(&mut source, &mut assembler, flush_ms)?;
        }
        assembler.flush_all();
        Ok(())
    })
    .await
    .map_err(|e| mysql_replay::ReplayError::Capture(e.to_string()))??;

    reporter.abort();
    let elapsed = started.elapsed().as_secs_f64();
    let data_in = stats::get(stats::DATA_IN);
    info!(
        speed = (data_in as f64 / elapsed.max(f64::EPSILON)) as i64,
        data_in,
        data_out = stats::get(stats::DATA_OUT),
        packets = stats::get(stats::PACKETS),
        "done"
    );
    Ok(())
}

fn spawn_throughput_reporter(interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        let mut prev_data_in = stats::get(stats::DATA_IN);
        loop {
            ticker.tick().await;
            let data_in = stats::get(stats::DATA_IN);
            info!(
                speed = ((data_in - prev_data_in) as f64 / interval.as_secs_f64()) as i64,
                data_in,
                data_out = stats::get(stats::DATA_OUT),
                packets = stats::get(stats::PACKETS),
                "stats"
            );
            prev_data_in = data_in;
        }
    })
}

fn log_replay_stats(label: &'static str) {
    let snapshot = stats::dump();
    let mut message = String::new();
    for name in stats::REPLAY_REPORT_NAMES {
        use std::fmt::Write;
        let _ = write!(
            message,
            "{}{}={}",
            if message.is_empty() { "" } else { " " },
            name,
            snapshot.get(*name).copied().unwrap_or(0)
        );
    }
    let lagging = stats::get_lagging();
    if lagging > Duration::ZERO {
        info!(lagging = ?lagging, "{}: {}", label, message);
    } else {
        info!("{}: {}", label, message);
    }
}

async fn run_play(args: PlayArgs) -> Result<()> {
    let options = args.options.to_options()?;
    let cancel = CancellationToken::new();

    let reporter = {
        let interval = args.report_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                log_replay_stats("stats");
            }
        })
    };

    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, shutting down");
            ctrl_c_cancel.cancel();
        }
    });

    let result = if args.agents.is_empty() {
        replay::play_local(options, Arc::new(MySqlDriver), &args.input, cancel).await
    } else {
        remote::play_remote(options, &args.input, &args.agents, cancel).await
    };

    reporter.abort();
    log_replay_stats("done");
    result
}

async fn run_agent(args: AgentArgs) -> Result<()> {
    let options = args.options.to_options()?;
    let cancel = CancellationToken::new();

    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, shutting down");
            ctrl_c_cancel.cancel();
        }
    });

    remote::run_agent(
        args.listen,
        options,
        Arc::new(MySqlDriver),
        args.data_dir,
        cancel,
    )
    .await
}
