use clap::{Parser, Subcommand, ValueEnum};
use myretl_lib::{test_connections, EtlApp, EtlConfig, EtlError, RunOutcome, TransformRegistry};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes: 0 success, 1 configuration error, 2 connection failure,
/// 130 interrupted.
const EXIT_CONFIG: i32 = 1;
const EXIT_CONNECTION: i32 = 2;
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(name = "myretl", version, about = "MySQL binlog replication ETL")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level
    #[arg(long, global = true, value_enum, ignore_case = true, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Log output format
    #[arg(long, global = true, value_enum, ignore_case = true, default_value_t = LogFormat::Console)]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Command {
    /// Start the replication pipeline and block until shutdown
    Run {
        /// Path to the JSON configuration file
        config: PathBuf,

        /// Log a periodic pipeline status line
        #[arg(long)]
        monitor: bool,

        /// Seconds between status lines
        #[arg(long, default_value_t = 30)]
        monitor_interval: u64,
    },
    /// Open each configured connection, report OK/FAIL per name, and exit
    Test {
        /// Path to the JSON configuration file
        config: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Console,
}

/// Initialize structured logging.
///
/// `RUST_LOG` overrides the CLI level when set.
fn init_logging(level: LogLevel, format: LogFormat) {
    let directive = level.as_directive();
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("myretl={directive},myretl_lib={directive}")));

    match format {
        LogFormat::Json => {
            let fmt_layer = fmt::layer().json().with_target(true).with_level(true);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .init();
        }
        LogFormat::Console => {
            let fmt_layer = fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true)
                .compact();
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .init();
        }
    }
}

fn load_config(path: &PathBuf) -> EtlConfig {
    match EtlConfig::load_from_file(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(EXIT_CONFIG);
        }
    }
}

/// Built-ins plus any transform modules the mappings reference, loaded from
/// the configuration file's directory first.
fn build_registry(config: &EtlConfig, config_path: &PathBuf) -> Result<TransformRegistry, i32> {
    let mut registry = TransformRegistry::with_builtins();
    if let Err(e) = registry.load_required_modules(config, config_path.parent()) {
        eprintln!("{e}");
        return Err(EXIT_CONFIG);
    }
    Ok(registry)
}

fn exit_code_for(error: &EtlError) -> i32 {
    match error {
        EtlError::Config(_) => EXIT_CONFIG,
        EtlError::Connectivity(_) | EtlError::Database(_) => EXIT_CONNECTION,
        _ => EXIT_CONFIG,
    }
}

async fn run(config_path: &PathBuf, monitor: bool, monitor_interval: u64) -> i32 {
    let config = load_config(config_path);
    let registry = match build_registry(&config, config_path) {
        Ok(registry) => registry,
        Err(code) => return code,
    };

    let mut app = match EtlApp::new(config, registry) {
        Ok(app) => app,
        Err(e) => {
            eprintln!("{e}");
            return exit_code_for(&e);
        }
    };

    tracing::info!(version = VERSION, "starting MySQL replication ETL");
    let monitor_interval = monitor.then(|| Duration::from_secs(monitor_interval.max(1)));

    match app.run(VERSION, monitor_interval).await {
        Ok(RunOutcome::Completed) => {
            tracing::info!("pipeline stopped");
            0
        }
        Ok(RunOutcome::Interrupted) => {
            tracing::info!("pipeline interrupted");
            EXIT_INTERRUPTED
        }
        Err(e) => {
            tracing::error!("pipeline failed: {e}");
            exit_code_for(&e)
        }
    }
}

async fn test(config_path: &PathBuf) -> i32 {
    let config = load_config(config_path);

    // Mapping problems should surface here too, not only on `run`
    let registry = match build_registry(&config, config_path) {
        Ok(registry) => registry,
        Err(code) => return code,
    };
    if let Err(e) = config.resolve_mappings(&registry) {
        eprintln!("{e}");
        return EXIT_CONFIG;
    }

    let results = test_connections(&config).await;
    let mut failures = 0;
    for result in &results {
        match &result.error {
            None => println!("OK    {} ({})", result.name, result.kind),
            Some(error) => {
                failures += 1;
                println!("FAIL  {} ({}): {}", result.name, result.kind, error);
            }
        }
    }

    if failures > 0 {
        eprintln!("{failures} connection(s) failed");
        EXIT_CONNECTION
    } else {
        println!("all {} connection(s) ok", results.len());
        0
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_level, cli.log_format);

    let code = match &cli.command {
        Command::Run {
            config,
            monitor,
            monitor_interval,
        } => run(config, *monitor, *monitor_interval).await,
        Command::Test { config } => test(config).await,
    };

    std::process::exit(code);
}
