use clap::{Parser, ValueEnum};
use flairflow::bridge::LoggerBridgeLayer;
use flairflow::config::FlairflowConfig;
use flairflow::interceptor::InterceptingSink;
use flairflow::logging;
use flairflow::metrics::{MetricsSink, TracingSink};
use flairflow::observer::ForwardingObserver;
use flairflow::replay::{self, ErrorPolicy, FollowOptions, ReplayStats};
use flairflow::signals::{self, ShutdownFlag};
use flairflow::tracking::MlflowSink;
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Where parsed metrics go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SinkKind {
    /// Log each metric to an MLflow run
    Mlflow,
    /// Emit each metric as a log event
    Log,
}

/// Read a Flair training log, pick the metrics out of it, and forward them
/// to an experiment tracker.
#[derive(Parser, Debug)]
#[command(name = "flairflow", version, about)]
pub struct Cli {
    /// Training log to read (default: stdin)
    #[arg(value_name = "LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Config file path
    #[arg(short, long, default_value = "flairflow.toml")]
    config: PathBuf,

    /// Logger to attach to (overrides config)
    #[arg(long)]
    logger: Option<String>,

    /// Metric destination
    #[arg(long, value_enum, default_value_t = SinkKind::Mlflow)]
    sink: SinkKind,

    /// MLflow tracking server (overrides config and MLFLOW_TRACKING_URI)
    #[arg(long)]
    tracking_uri: Option<String>,

    /// MLflow run to log into (overrides config and MLFLOW_RUN_ID)
    #[arg(long)]
    run_id: Option<String>,

    /// Keep reading LOG_FILE as it grows, until Ctrl-C
    #[arg(short, long, requires = "log_file")]
    follow: bool,

    /// Echo the intercepted log text to stdout
    #[arg(long)]
    echo: bool,

    /// Keep going when a metric fails to record
    #[arg(long)]
    keep_going: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (every metric sent, attach/detach)
    #[arg(short, long)]
    verbose: bool,

    /// Only errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

/// Everything the blocking pipeline needs, resolved up front.
struct PipelineOptions {
    log_file: Option<PathBuf>,
    logger_name: String,
    level: Level,
    sink: SinkKind,
    follow: Option<FollowOptions>,
    echo: bool,
    policy: ErrorPolicy,
}

fn init_tracing(cli: &Cli) {
    let default_filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .with(LoggerBridgeLayer::new(logging::registry().clone()))
        .init();
}

fn apply_overrides(config: &mut FlairflowConfig, cli: &Cli) {
    if let Some(name) = &cli.logger {
        config.logger.name = name.clone();
    }
    if let Some(uri) = &cli.tracking_uri {
        config.tracking.uri = Some(uri.clone());
    }
    if let Some(run_id) = &cli.run_id {
        config.tracking.run_id = Some(run_id.clone());
    }
}

fn print_settings(cli: &Cli, config: &FlairflowConfig) {
    let input = cli
        .log_file
        .as_ref()
        .map_or_else(|| "<stdin>".to_string(), |p| p.display().to_string());
    println!("flairflow v{}", env!("CARGO_PKG_VERSION"));
    println!("config:        {}", cli.config.display());
    println!("input:         {input}");
    println!("logger:        {} ({})", config.logger.name, config.logger.level);
    println!("sink:          {:?}", cli.sink);
    println!(
        "tracking uri:  {}",
        config.tracking.uri.as_deref().unwrap_or("<from env>")
    );
    println!(
        "run id:        {}",
        config.tracking.run_id.as_deref().unwrap_or("<from env>")
    );
    println!("follow:        {}", cli.follow);
    println!("Dry run: config validated, not running.");
}

/// Attach the interceptor, feed the input through the logger, detach.
///
/// Runs on a blocking thread: the MLflow client and stdin reads both block.
fn run_pipeline(
    options: PipelineOptions,
    config: FlairflowConfig,
    shutdown: ShutdownFlag,
) -> Result<ReplayStats, BoxError> {
    let metrics: Box<dyn MetricsSink> = match options.sink {
        SinkKind::Mlflow => Box::new(MlflowSink::from_config(&config.tracking)?),
        SinkKind::Log => Box::new(TracingSink),
    };
    let passthrough: Box<dyn Write + Send> = if options.echo {
        Box::new(std::io::stdout())
    } else {
        Box::new(std::io::sink())
    };

    let interceptor = Arc::new(InterceptingSink::with_writer(
        ForwardingObserver::new(metrics),
        passthrough,
    ));
    let logger = logging::get_logger(&options.logger_name);
    let _guard = interceptor.attach_to(&logger)?;

    let stats = match (&options.log_file, options.follow) {
        (Some(path), Some(follow)) => replay::follow(
            path,
            &logger,
            options.level,
            options.policy,
            follow,
            &shutdown,
        )?,
        (Some(path), None) => replay::replay(
            BufReader::new(File::open(path)?),
            &logger,
            options.level,
            options.policy,
            &shutdown,
        )?,
        (None, _) => replay::replay(
            std::io::stdin().lock(),
            &logger,
            options.level,
            options.policy,
            &shutdown,
        )?,
    };
    Ok(stats)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match FlairflowConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            return ExitCode::FAILURE;
        }
    };
    apply_overrides(&mut config, &cli);

    let level = match config.logger.level() {
        Ok(level) => level,
        Err(e) => {
            tracing::error!(error = %e, "invalid [logger] level");
            return ExitCode::FAILURE;
        }
    };

    if cli.dry_run {
        print_settings(&cli, &config);
        return ExitCode::SUCCESS;
    }

    let options = PipelineOptions {
        log_file: cli.log_file.clone(),
        logger_name: config.logger.name.clone(),
        level,
        sink: cli.sink,
        follow: cli.follow.then(|| FollowOptions {
            poll_interval: Duration::from_millis(config.follow.poll_interval_ms),
            from_end: config.follow.from_end,
        }),
        echo: cli.echo,
        policy: if cli.keep_going {
            ErrorPolicy::Skip
        } else {
            ErrorPolicy::Abort
        },
    };

    let shutdown = ShutdownFlag::new();
    tokio::spawn(signals::watch_ctrl_c(shutdown.clone()));

    let outcome =
        tokio::task::spawn_blocking(move || run_pipeline(options, config, shutdown)).await;

    match outcome {
        Ok(Ok(stats)) => {
            tracing::info!(
                lines = stats.lines,
                bytes = stats.bytes,
                failed = stats.failed,
                "training log processed"
            );
            if stats.failed > 0 {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "flairflow failed");
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!(error = %e, "pipeline task panicked");
            ExitCode::FAILURE
        }
    }
}
