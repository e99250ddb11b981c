mod cache;
mod client;
mod config;
mod error;
mod rarity;
mod scheduler;
mod sink;
mod types;

use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cache::CacheStore;
use crate::client::MarketClient;
use crate::config::Config;
use crate::error::Result;
use crate::scheduler::ScanScheduler;
use crate::sink::LogSink;

#[tokio::main]
async fn main() {
    let Some(symbol) = std::env::args().nth(1) else {
        eprintln!("usage: scanner <collection-symbol>");
        std::process::exit(1);
    };

    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg, symbol).await {
        tracing::error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config, symbol: String) -> Result<()> {
    info!(
        symbol,
        api_url = %cfg.api_url,
        requests_per_sec = cfg.requests_per_sec,
        one_of_one = cfg.one_of_one_enabled,
        percent_threshold = cfg.percent_threshold,
        cache_enabled = cfg.cache_enabled,
        "rarity scanner starting",
    );

    let client = MarketClient::new(&cfg)?;
    let cache = CacheStore::new(
        cfg.cache_dir.clone(),
        cfg.cache_enabled,
        Duration::from_secs(cfg.cache_expiry_hours * 3600),
    );

    let scheduler = ScanScheduler::new(cfg, client, cache, LogSink, symbol);
    scheduler.run().await;

    info!("rarity scanner stopped");
    Ok(())
}
