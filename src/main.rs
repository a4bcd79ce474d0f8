use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use lesson_relay::{config::Config, server::run_server};

#[derive(Parser)]
#[command(name = "lesson-relay")]
#[command(about = "Progress-streaming relay for the Visual Learning Assistant")]
struct Args {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(long, default_value = "5000")]
    port: u16,

    /// Interpreter used to run worker scripts
    #[arg(long, default_value = "python3")]
    python_bin: String,

    /// Directory containing the worker scripts
    #[arg(long, default_value = "./workers")]
    workers_dir: PathBuf,

    /// Maximum worker run time in seconds before it is killed
    #[arg(long, default_value = "600")]
    worker_timeout_secs: u64,

    /// Cap in bytes on a buffered partial line of worker stdout
    #[arg(long, default_value = "1048576")]
    stdout_line_limit: usize,

    /// Bytes of worker stderr retained for error reporting
    #[arg(long, default_value = "4096")]
    stderr_tail_bytes: usize,

    /// Outbound WebSocket queue depth per connection
    #[arg(long, default_value = "256")]
    outbound_queue_depth: usize,

    /// Number of generated roadmaps retained in history
    #[arg(long, default_value = "100")]
    roadmap_history_capacity: usize,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing with both console and file logging
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    let logs_dir = std::path::Path::new(".lesson-relay/logs");
    std::fs::create_dir_all(logs_dir)?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, "server.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter.clone()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(env_filter),
        )
        .init();

    info!("Starting Lesson Relay");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Server: {}:{}", args.host, args.port);
    info!(
        "Workers: {} (interpreter: {})",
        args.workers_dir.display(),
        args.python_bin
    );
    info!("Worker timeout: {}s", args.worker_timeout_secs);

    let config = Config {
        host: args.host,
        port: args.port,
        python_bin: args.python_bin,
        workers_dir: args.workers_dir,
        worker_timeout_secs: args.worker_timeout_secs,
        stdout_line_limit: args.stdout_line_limit,
        stderr_tail_bytes: args.stderr_tail_bytes,
        outbound_queue_depth: args.outbound_queue_depth,
        roadmap_history_capacity: args.roadmap_history_capacity,
    };

    run_server(config).await?;

    Ok(())
}
