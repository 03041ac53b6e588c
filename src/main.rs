use anyhow::Context;
use std::io::IsTerminal;
use tracing::{error, info, warn};

use db_query_core::config::{Config, LoggingConfig};
use db_query_core::{ConnectorRegistry, QueryRequest};

fn init_logging(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_new(&logging.level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let ansi = match logging.style.as_str() {
        "always" => true,
        "never" => false,
        _ => std::io::stderr().is_terminal(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;

    // Initialize logging
    init_logging(&config.logging);
    for warning in &config.load_warnings {
        warn!("{}", warning);
    }

    let registry = ConnectorRegistry::new(&config).map_err(|e| {
        error!("Failed to build connector registry: {}", e);
        e
    })?;

    let profile_ids = registry.profile_ids();
    if profile_ids.is_empty() {
        warn!("No database profiles configured; set DATABASE_URL or DB_CORE_CONFIG");
    }

    for (profile_id, test) in registry.test_all().await {
        if test.ok {
            info!("[{}] {} ({} ms)", profile_id, test.message, test.latency_ms);
        } else {
            warn!("[{}] {}", profile_id, test.message);
        }
    }

    // `<profile-id> <sql>` runs one query and prints the result
    let args: Vec<String> = std::env::args().skip(1).collect();
    let outcome = match args.as_slice() {
        [] => Ok(()),
        [profile_id, sql @ ..] if !sql.is_empty() => {
            let request = QueryRequest::new(sql.join(" "));
            match registry.execute(profile_id, request).await {
                Ok(result) => {
                    println!("{}", serde_json::to_string_pretty(&result)?);
                    Ok(())
                }
                Err(e) => {
                    println!("{}", serde_json::to_string_pretty(&e.to_detail())?);
                    Err(anyhow::Error::new(e).context(format!("Query on '{}' failed", profile_id)))
                }
            }
        }
        _ => Err(anyhow::anyhow!("usage: db-query-core [<profile-id> <sql>]")),
    };

    registry.shutdown().await;
    outcome
}
