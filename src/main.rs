use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::ratelimit::{LimiterFactory, LimiterRules, RateLimitResult};
use tollgate::store::RedisBucketStore;

/// Exit status for a denied consume or check.
const EXIT_DENIED: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about = "Inspect and drive distributed token buckets")]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Extra limiter rules file (YAML), appended to the configured limiters
    #[arg(long, global = true)]
    rules: Option<PathBuf>,

    /// Override the store URL from the configuration
    #[arg(long, global = true)]
    redis_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Take tokens from a bucket
    Consume {
        namespace: String,
        key: String,
        #[arg(long, default_value_t = 1.0)]
        cost: f64,
    },
    /// Preview a consume without taking tokens
    Check {
        namespace: String,
        key: String,
        #[arg(long, default_value_t = 1.0)]
        cost: f64,
    },
    /// Delete a bucket so it starts full again
    Reset { namespace: String, key: String },
    /// List configured limiter namespaces
    Limiters,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    info!("Tollgate {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &cli.config {
        Some(path) => TollgateConfig::load(path)?,
        None => TollgateConfig::default(),
    };
    if let Some(path) = &cli.rules {
        let rules = LimiterRules::from_file(path)
            .with_context(|| format!("loading rules from {}", path.display()))?;
        config.limiters.extend(rules.limiters);
    }
    if let Some(url) = cli.redis_url {
        config.store.url = url;
    }
    info!(
        store = %config.store.url,
        limiters = config.limiters.len(),
        failure_policy = ?config.failure_policy,
        "Configuration loaded"
    );

    let store = Arc::new(RedisBucketStore::new(&config.store)?);
    let factory = LimiterFactory::new(store).with_retry(config.retry.clone());
    let limiters = factory.build_all(&config.limiters)?;

    let (namespace, key, cost, mutate) = match cli.command {
        Command::Limiters => {
            let mut rows: Vec<_> = limiters
                .values()
                .map(|limiter| {
                    let cfg = limiter.config();
                    json!({
                        "namespace": cfg.namespace(),
                        "max": cfg.max(),
                        "refill_interval_secs": cfg.refill_interval().as_secs_f64(),
                    })
                })
                .collect();
            rows.sort_by(|a, b| a["namespace"].as_str().cmp(&b["namespace"].as_str()));
            println!("{}", serde_json::to_string_pretty(&rows)?);
            return Ok(());
        }
        Command::Reset { namespace, key } => {
            let limiter = limiters
                .get(&namespace)
                .ok_or_else(|| anyhow!("no limiter configured for namespace {:?}", namespace))?;
            limiter
                .reset(&key)
                .await
                .with_context(|| format!("resetting {}", limiter.store_key(&key)))?;
            println!("{}", json!({ "namespace": namespace, "key": key, "reset": true }));
            return Ok(());
        }
        Command::Consume { namespace, key, cost } => (namespace, key, cost, true),
        Command::Check { namespace, key, cost } => (namespace, key, cost, false),
    };

    let limiter = limiters
        .get(&namespace)
        .ok_or_else(|| anyhow!("no limiter configured for namespace {:?}", namespace))?;

    let outcome = if mutate {
        limiter.consume_cost(&key, cost).await
    } else {
        limiter.check_cost(&key, cost).await
    };
    let now = Utc::now();
    let result = config
        .failure_policy
        .resolve(outcome, limiter.limit(), now)
        .with_context(|| format!("evaluating {}", limiter.store_key(&key)))?;

    println!("{}", render(&namespace, &key, &result, now));
    if !result.allowed {
        std::process::exit(EXIT_DENIED);
    }
    Ok(())
}

fn render(namespace: &str, key: &str, result: &RateLimitResult, now: chrono::DateTime<Utc>) -> String {
    json!({
        "namespace": namespace,
        "key": key,
        "allowed": result.allowed,
        "remaining": result.remaining,
        "limit": result.limit,
        "resets_at": result.resets_at.to_rfc3339(),
        "reset_after_secs": result.reset_after(now).as_secs_f64().ceil() as u64,
    })
    .to_string()
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
