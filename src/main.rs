use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::{LogFormat, LoggingConfig, TollgateConfig};
use tollgate::ratelimit::{Algorithm, RateLimiter};
use tollgate::store::RedisStore;

/// Exit status of a `check` that was denied.
const EXIT_DENIED: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "tollgate", version, about = "Distributed rate limiting against a shared Redis")]
struct Cli {
    /// Configuration file (YAML); TOLLGATE__* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check and consume one permit; exits with status 2 when denied
    Check(LimitArgs),
    /// Show usage without consuming
    Status(LimitArgs),
    /// Clear stored state for an identifier
    Reset {
        identifier: String,
        /// Only this algorithm; all algorithms when omitted
        #[arg(short, long)]
        algorithm: Option<Algorithm>,
    },
    /// Ping the store
    Health,
}

#[derive(Args, Debug)]
struct LimitArgs {
    identifier: String,
    #[arg(short, long)]
    algorithm: Option<Algorithm>,
    #[arg(short, long)]
    limit: Option<u64>,
    #[arg(short, long)]
    window: Option<u64>,
}

#[derive(Serialize)]
struct StatusReport<'a> {
    identifier: &'a str,
    algorithm: Algorithm,
    limit: u64,
    window_seconds: u64,
    used: u64,
    remaining: u64,
    reset_in_seconds: f64,
}

#[derive(Serialize)]
struct ResetReport<'a> {
    identifier: &'a str,
    cleared: usize,
}

#[derive(Serialize)]
struct HealthReport {
    status: &'static str,
    store_connected: bool,
    version: &'static str,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = TollgateConfig::load(cli.config.as_deref())?;

    init_tracing(&config.logging);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting Tollgate");

    execute(cli.command, &config).await
}

/// Connect to the store, run `command`, then disconnect.
///
/// `health` reports an unreachable store as unhealthy instead of failing.
async fn execute(command: Command, config: &TollgateConfig) -> anyhow::Result<ExitCode> {
    let store = match RedisStore::connect(&config.store).await {
        Ok(store) => Arc::new(store),
        Err(e) if matches!(command, Command::Health) => {
            warn!(error = %e, "Health check failed: store not reachable");
            return report_health(false);
        }
        Err(e) => return Err(e.into()),
    };
    let limiter = RateLimiter::new(store.clone());

    let exit = run(command, &limiter, config).await;

    drop(limiter);
    if let Ok(store) = Arc::try_unwrap(store) {
        store.disconnect().await;
    }

    exit
}

async fn run(
    command: Command,
    limiter: &RateLimiter,
    config: &TollgateConfig,
) -> anyhow::Result<ExitCode> {
    let defaults = &config.limits;

    match command {
        Command::Check(args) => {
            let algorithm = args.algorithm.unwrap_or(defaults.algorithm);
            let decision = limiter
                .check(
                    &args.identifier,
                    algorithm,
                    args.limit.unwrap_or(defaults.limit),
                    args.window.unwrap_or(defaults.window_seconds),
                )
                .await?;

            println!("{}", serde_json::to_string(&decision)?);
            if decision.allowed {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(EXIT_DENIED))
            }
        }
        Command::Status(args) => {
            let algorithm = args.algorithm.unwrap_or(defaults.algorithm);
            let limit = args.limit.unwrap_or(defaults.limit);
            let window_seconds = args.window.unwrap_or(defaults.window_seconds);
            let usage = limiter
                .status(&args.identifier, algorithm, limit, window_seconds)
                .await?;

            let report = StatusReport {
                identifier: &args.identifier,
                algorithm,
                limit,
                window_seconds,
                used: usage.used,
                remaining: usage.remaining,
                reset_in_seconds: usage.reset_in_seconds,
            };
            println!("{}", serde_json::to_string(&report)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Reset {
            identifier,
            algorithm,
        } => {
            let cleared = limiter.reset(&identifier, algorithm).await?;
            let report = ResetReport {
                identifier: &identifier,
                cleared,
            };
            println!("{}", serde_json::to_string(&report)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Health => report_health(limiter.is_healthy().await),
    }
}

fn report_health(healthy: bool) -> anyhow::Result<ExitCode> {
    let report = HealthReport {
        status: if healthy { "healthy" } else { "unhealthy" },
        store_connected: healthy,
        version: env!("CARGO_PKG_VERSION"),
    };
    println!("{}", serde_json::to_string(&report)?);
    Ok(if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Initialize tracing on stderr; stdout carries command output.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_check() {
        let cli = Cli::try_parse_from([
            "tollgate", "check", "user_1", "--algorithm", "sliding_window", "--limit", "5",
        ])
        .unwrap();

        match cli.command {
            Command::Check(args) => {
                assert_eq!(args.identifier, "user_1");
                assert_eq!(args.algorithm, Some(Algorithm::SlidingWindow));
                assert_eq!(args.limit, Some(5));
                assert_eq!(args.window, None);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_algorithm() {
        let result = Cli::try_parse_from(["tollgate", "reset", "user_1", "-a", "fixed_window"]);
        assert!(result.is_err());
    }

    fn unreachable_store() -> TollgateConfig {
        let mut config = TollgateConfig::default();
        config.store.url = Some("redis://127.0.0.1:1/0".to_string());
        config.store.connect_timeout_ms = 500;
        config
    }

    #[tokio::test]
    async fn test_health_reports_unreachable_store() {
        let exit = execute(Command::Health, &unreachable_store()).await.unwrap();
        assert_eq!(exit, ExitCode::FAILURE);
    }

    #[tokio::test]
    async fn test_check_fails_on_unreachable_store() {
        let args = LimitArgs {
            identifier: "user_1".to_string(),
            algorithm: None,
            limit: None,
            window: None,
        };
        assert!(execute(Command::Check(args), &unreachable_store()).await.is_err());
    }

    #[test]
    fn test_cli_verifies() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
