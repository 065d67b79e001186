use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::{LoggingConfig, TollgateConfig};
use tollgate::ratelimit::{now_ms, RateLimiter, RequestContext, Verdict};
use tollgate::TollgateError;

#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about = "Sliding window rate limiting for mutating API requests")]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the active rule table
    Rules,
    /// Replay synthetic requests through a fresh limiter, one JSON verdict per line
    Simulate(SimulateArgs),
}

#[derive(Debug, clap::Args)]
struct SimulateArgs {
    #[arg(long, default_value = "POST")]
    method: String,

    #[arg(long)]
    path: String,

    /// Authenticated user id
    #[arg(long)]
    user: Option<String>,

    /// Raw x-forwarded-for header value
    #[arg(long)]
    forwarded_for: Option<String>,

    /// Raw x-real-ip header value
    #[arg(long)]
    real_ip: Option<String>,

    /// Number of requests to send
    #[arg(long, default_value_t = 1)]
    count: u32,

    /// Milliseconds between requests
    #[arg(long, default_value_t = 0)]
    interval_ms: u64,

    /// Timestamp of the first request in epoch milliseconds (defaults to now)
    #[arg(long)]
    start_ms: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = TollgateConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging);

    info!("Tollgate version: {}", env!("CARGO_PKG_VERSION"));

    let rules = config.load_rules()?;
    info!(rules = rules.len(), "Rule table loaded");

    match cli.command {
        Command::Rules => {
            for rule in rules.iter() {
                let methods: Vec<&str> = rule.methods.iter().map(|m| m.as_str()).collect();
                println!(
                    "{:<24} {:<40} {:<24} limit={:<6} window={}ms key={}",
                    rule.id,
                    rule.pattern.to_string(),
                    methods.join(","),
                    rule.limit,
                    rule.window_ms,
                    rule.key_type
                );
            }
        }
        Command::Simulate(args) => {
            let limiter = RateLimiter::from_settings(rules, &config.limiter);
            let end = simulate(&limiter, &args)?;

            limiter.sweep_at(end);
            let stats = limiter.stats();
            info!(
                checks = stats.checks,
                allowed = stats.allowed,
                denied = stats.denied,
                "Simulation finished"
            );
        }
    }

    Ok(())
}

/// Returns the timestamp of the last request sent.
fn simulate(limiter: &RateLimiter, args: &SimulateArgs) -> anyhow::Result<u64> {
    let mut ctx = RequestContext::new(args.method.as_str(), args.path.as_str());
    ctx.user_id = args.user.clone();
    ctx.forwarded_for = args.forwarded_for.clone();
    ctx.real_ip = args.real_ip.clone();

    let start = args.start_ms.unwrap_or_else(now_ms);
    let mut at = start;
    for i in 0..u64::from(args.count) {
        at = request_time(start, i, args.interval_ms);
        let verdict = match limiter.check_at(&ctx, at) {
            Ok(verdict) => verdict,
            Err(TollgateError::MissingIdentity { rule }) => {
                anyhow::bail!("rule '{}' needs --user for this request", rule)
            }
            Err(e) => return Err(e.into()),
        };
        print_verdict(at, &verdict)?;
    }
    Ok(at)
}

/// Timestamp of the `index`th request, pinned at `u64::MAX`.
fn request_time(start: u64, index: u64, interval_ms: u64) -> u64 {
    start.saturating_add(index.saturating_mul(interval_ms))
}

fn print_verdict(at: u64, verdict: &Verdict) -> anyhow::Result<()> {
    let line = serde_json::json!({ "at_ms": at, "verdict": verdict });
    println!("{}", serde_json::to_string(&line)?);
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
