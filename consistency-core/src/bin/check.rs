//! Ledger consistency check binary
//!
//! Reconciles every account against its entries and reports counter state.
//! Exits with status 1 when any account has drifted.

use anyhow::Context;
use consistency_core::{Config, ConsistencyCore, EntityClass};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;
    let core = ConsistencyCore::open(config)
        .await
        .context("Failed to open consistency core")?;

    let mut counters = serde_json::Map::new();
    for entity_class in EntityClass::ALL {
        let current = core
            .sequence_counter(entity_class)?
            .map(|counter| counter.current_value);
        tracing::info!(entity_class = %entity_class, current = ?current, "Counter state");
        counters.insert(entity_class.as_str().to_string(), serde_json::json!(current));
    }

    let reconciliations = core.reconcile_all().context("Reconciliation failed")?;
    let drifted: Vec<_> = reconciliations.iter().filter(|r| !r.is_balanced()).collect();
    let stats = core.stats()?;

    tracing::info!(
        accounts = reconciliations.len(),
        drifted = drifted.len(),
        suspense_entries = stats.suspense_entries,
        "Reconciliation finished"
    );

    let report = serde_json::json!({
        "service": core.config().service_name,
        "counters": counters,
        "accounts_checked": reconciliations.len(),
        "suspense_entries": stats.suspense_entries,
        "drifted": drifted,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    let healthy = drifted.is_empty();
    core.shutdown().await?;

    if !healthy {
        std::process::exit(1);
    }
    Ok(())
}
