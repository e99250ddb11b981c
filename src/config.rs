use std::time::Duration;

use crate::error::{AppError, Result};

pub const MARKET_API_URL: &str = "https://api-mainnet.magiceden.dev/v2";

/// Fixed page size for all paginated endpoints (listings, activities).
pub const PAGE_SIZE: usize = 500;

/// Fixed wait after an HTTP 429 before re-issuing the same request.
pub const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(5);

/// Total attempts per logical request when the remote keeps answering 429.
/// Without a cap a persistently rate-limited endpoint would loop forever.
pub const RATE_LIMIT_MAX_ATTEMPTS: u32 = 3;

/// Per-request HTTP timeout (seconds).
pub const HTTP_TIMEOUT_SECS: u64 = 30;

/// Lamports per SOL. Listing prices arrive as SOL floats.
pub const LAMPORTS_PER_SOL: f64 = 1_000_000_000.0;

#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    pub log_level: String,
    /// Outbound request ceiling (REQUESTS_PER_SEC)
    pub requests_per_sec: f64,
    /// Treat count==1 trait values as rare (ONE_OF_ONE_ENABLED)
    pub one_of_one_enabled: bool,
    /// Inclusive percentage cutoff for rarity (RARITY_PERCENT_THRESHOLD)
    pub percent_threshold: f64,
    /// Minutes between scan cycles (SCAN_INTERVAL_MINUTES)
    pub scan_interval_minutes: u64,
    /// Snapshot caching on/off (CACHE_ENABLED)
    pub cache_enabled: bool,
    /// Directory holding per-collection cache files (CACHE_DIR)
    pub cache_dir: String,
    /// Snapshot freshness window in hours (CACHE_EXPIRY_HOURS)
    pub cache_expiry_hours: u64,
    /// Cap on full-collection enumeration (MAX_COLLECTION_ITEMS)
    pub max_collection_items: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let requests_per_sec = std::env::var("REQUESTS_PER_SEC")
            .unwrap_or_else(|_| "2".to_string())
            .parse::<f64>()
            .unwrap_or(2.0);
        if requests_per_sec <= 0.0 {
            return Err(AppError::Config(
                "REQUESTS_PER_SEC must be positive".to_string(),
            ));
        }

        let scan_interval_minutes = std::env::var("SCAN_INTERVAL_MINUTES")
            .unwrap_or_else(|_| "5".to_string())
            .parse::<u64>()
            .unwrap_or(5);
        if scan_interval_minutes == 0 {
            return Err(AppError::Config(
                "SCAN_INTERVAL_MINUTES must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            api_url: std::env::var("MARKET_API_URL")
                .unwrap_or_else(|_| MARKET_API_URL.to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            requests_per_sec,
            one_of_one_enabled: std::env::var("ONE_OF_ONE_ENABLED")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            percent_threshold: std::env::var("RARITY_PERCENT_THRESHOLD")
                .unwrap_or_else(|_| "1".to_string())
                .parse::<f64>()
                .unwrap_or(1.0),
            scan_interval_minutes,
            cache_enabled: std::env::var("CACHE_ENABLED")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            cache_dir: std::env::var("CACHE_DIR").unwrap_or_else(|_| ".cache".to_string()),
            cache_expiry_hours: std::env::var("CACHE_EXPIRY_HOURS")
                .unwrap_or_else(|_| "24".to_string())
                .parse::<u64>()
                .unwrap_or(24),
            max_collection_items: std::env::var("MAX_COLLECTION_ITEMS")
                .unwrap_or_else(|_| "2500".to_string())
                .parse::<usize>()
                .unwrap_or(2500),
        })
    }
}
