use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{
    Config, HTTP_TIMEOUT_SECS, LAMPORTS_PER_SOL, PAGE_SIZE, RATE_LIMIT_BACKOFF,
    RATE_LIMIT_MAX_ATTEMPTS,
};
use crate::error::{AppError, Result};
use crate::types::{Collection, CollectionStats, Item, Listing};

// ---------------------------------------------------------------------------
// MarketData
// ---------------------------------------------------------------------------

/// Read access to the marketplace API for one collection. Every operation
/// degrades on failure instead of erroring: a single-record fetch returns
/// None, a paginated fetch returns whatever pages succeeded. The scan cycle
/// treats both as partial data, never as fatal.
#[async_trait]
pub trait MarketData: Send + Sync {
    async fn collection(&self, symbol: &str) -> Option<Collection>;
    async fn collection_stats(&self, symbol: &str) -> Option<CollectionStats>;
    /// All currently-listed items for the collection.
    async fn listings(&self, symbol: &str) -> Vec<Listing>;
    /// Full-collection enumeration, bounded by `max_items`.
    async fn enumerate_items(&self, symbol: &str, max_items: usize) -> Vec<Item>;
    /// Metadata for a single token.
    async fn token(&self, mint: &str) -> Option<Item>;
}

// ---------------------------------------------------------------------------
// RequestGate
// ---------------------------------------------------------------------------

/// Caps outbound request rate at a configured requests-per-second ceiling.
/// Every request awaits the gate before hitting the wire; the mutex is held
/// across the sleep so concurrent callers line up behind one shared schedule
/// and internal parallelism can never exceed the ceiling.
pub struct RequestGate {
    min_interval: Duration,
    next_slot: tokio::sync::Mutex<Instant>,
}

impl RequestGate {
    pub fn new(requests_per_sec: f64) -> Self {
        Self {
            min_interval: Duration::from_secs_f64(1.0 / requests_per_sec),
            next_slot: tokio::sync::Mutex::new(Instant::now()),
        }
    }

    pub async fn wait(&self) {
        let mut next = self.next_slot.lock().await;
        let now = Instant::now();
        if *next > now {
            tokio::time::sleep_until(*next).await;
            *next += self.min_interval;
        } else {
            *next = now + self.min_interval;
        }
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Re-issues a logical request after a fixed backoff when the remote answers
/// 429, up to `max_attempts` total attempts. Any other error passes straight
/// through. Standalone so it can be exercised without a real HTTP client.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1u32;
        loop {
            match op().await {
                Err(AppError::RateLimited) if attempt < self.max_attempts => {
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        "rate limited (HTTP 429), retrying in {:?}",
                        self.backoff,
                    );
                    tokio::time::sleep(self.backoff).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MarketClient
// ---------------------------------------------------------------------------

pub struct MarketClient {
    http: reqwest::Client,
    base_url: String,
    gate: RequestGate,
    retry: RetryPolicy,
}

impl MarketClient {
    pub fn new(cfg: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            base_url: cfg.api_url.trim_end_matches('/').to_string(),
            gate: RequestGate::new(cfg.requests_per_sec),
            retry: RetryPolicy {
                max_attempts: RATE_LIMIT_MAX_ATTEMPTS,
                backoff: RATE_LIMIT_BACKOFF,
            },
        })
    }

    /// One throttled round trip. 429 maps to `AppError::RateLimited` so the
    /// retry policy can tell it apart from every other failure.
    async fn round_trip(&self, url: &str) -> Result<Value> {
        self.gate.wait().await;
        let resp = self.http.get(url).send().await?;
        let status = resp.status().as_u16();
        if status == 429 {
            return Err(AppError::RateLimited);
        }
        if !resp.status().is_success() {
            return Err(AppError::Status(status));
        }
        Ok(resp.json().await?)
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        self.retry.run(|| self.round_trip(url)).await
    }

    /// Fetch one page of a paginated list endpoint. None means the page
    /// failed and pagination should stop with a partial result.
    async fn fetch_page(&self, url: &str) -> Option<Vec<Value>> {
        match self.get_json(url).await {
            Ok(Value::Array(records)) => Some(records),
            Ok(_) => {
                warn!(url, "expected a JSON array page, stopping pagination");
                None
            }
            Err(e) => {
                warn!(url, "page fetch failed, keeping partial result: {e}");
                None
            }
        }
    }
}

#[async_trait]
impl MarketData for MarketClient {
    async fn collection(&self, symbol: &str) -> Option<Collection> {
        let url = format!("{}/collections/{symbol}", self.base_url);
        match self.get_json(&url).await {
            Ok(v) => parse_collection(&v),
            Err(e) => {
                warn!(symbol, "collection fetch failed: {e}");
                None
            }
        }
    }

    async fn collection_stats(&self, symbol: &str) -> Option<CollectionStats> {
        let url = format!("{}/collections/{symbol}/stats", self.base_url);
        match self.get_json(&url).await {
            Ok(v) => Some(parse_stats(&v)),
            Err(e) => {
                warn!(symbol, "stats fetch failed: {e}");
                None
            }
        }
    }

    async fn listings(&self, symbol: &str) -> Vec<Listing> {
        let mut listings = Vec::new();
        let mut offset = 0usize;
        loop {
            let url = format!(
                "{}/collections/{symbol}/listings?offset={offset}&limit={PAGE_SIZE}",
                self.base_url,
            );
            let Some(records) = self.fetch_page(&url).await else {
                break;
            };
            let page_len = records.len();
            listings.extend(records.iter().filter_map(parse_listing));
            if page_len < PAGE_SIZE {
                break;
            }
            offset += PAGE_SIZE;
        }
        debug!(symbol, listings = listings.len(), "listings fetched");
        listings
    }

    /// Enumerate the collection by walking the recent-activity feed, deduping
    /// token mints and fetching metadata for each unseen one, until the feed
    /// is exhausted or `max_items` is reached.
    ///
    /// Known limitation: tokens with no recent activity never surface here,
    /// so the enumeration is an approximation of the full collection. That is
    /// intentional marketplace policy, not something to compensate for.
    async fn enumerate_items(&self, symbol: &str, max_items: usize) -> Vec<Item> {
        let mut seen_mints: HashSet<String> = HashSet::new();
        let mut items = Vec::new();
        let mut offset = 0usize;

        'feed: loop {
            let url = format!(
                "{}/collections/{symbol}/activities?offset={offset}&limit={PAGE_SIZE}",
                self.base_url,
            );
            let Some(records) = self.fetch_page(&url).await else {
                break;
            };
            let page_len = records.len();

            for record in &records {
                let Some(mint) = record.get("tokenMint").and_then(|m| m.as_str()) else {
                    continue;
                };
                if !seen_mints.insert(mint.to_string()) {
                    continue;
                }
                // Metadata failures skip the token, not the enumeration.
                if let Some(item) = self.token(mint).await {
                    items.push(item);
                    if items.len() >= max_items {
                        debug!(symbol, max_items, "enumeration cap reached");
                        break 'feed;
                    }
                }
            }

            if page_len < PAGE_SIZE {
                break;
            }
            offset += PAGE_SIZE;
        }

        debug!(
            symbol,
            items = items.len(),
            activity_mints = seen_mints.len(),
            "collection enumerated from activity feed",
        );
        items
    }

    async fn token(&self, mint: &str) -> Option<Item> {
        let url = format!("{}/tokens/{mint}", self.base_url);
        match self.get_json(&url).await {
            Ok(v) => parse_token(&v),
            Err(e) => {
                warn!(mint, "token fetch failed: {e}");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// JSON parsers
// ---------------------------------------------------------------------------

pub fn parse_collection(v: &Value) -> Option<Collection> {
    let symbol = v.get("symbol")?.as_str()?.to_string();
    let name = v
        .get("name")
        .and_then(|n| n.as_str())
        .unwrap_or(&symbol)
        .to_string();
    Some(Collection { symbol, name })
}

pub fn parse_stats(v: &Value) -> CollectionStats {
    CollectionStats {
        floor_price: v.get("floorPrice").and_then(|p| p.as_u64()),
        listed_count: v.get("listedCount").and_then(|c| c.as_u64()),
        volume_all: v.get("volumeAll").and_then(|x| x.as_f64()),
    }
}

/// Parse one listing record. Price arrives as a SOL float and is converted
/// to integer lamports. Returns None for structurally unusable records,
/// including non-finite or negative prices; `as u64` would quietly turn
/// those into a zero-price listing.
pub fn parse_listing(v: &Value) -> Option<Listing> {
    let mint = v.get("tokenMint").and_then(|m| m.as_str())?.to_string();
    let price_sol = v.get("price").and_then(|p| p.as_f64())?;
    if !price_sol.is_finite() || price_sol < 0.0 {
        return None;
    }
    let seller = v
        .get("seller")
        .and_then(|s| s.as_str())
        .map(|s| s.to_string());
    Some(Listing {
        mint,
        price: (price_sol * LAMPORTS_PER_SOL).round() as u64,
        seller,
    })
}

/// Normalize a raw token record into an `Item`. Attribute values may arrive
/// as strings or numbers; numbers are stringified so the trait map stays
/// string→string.
pub fn parse_token(v: &Value) -> Option<Item> {
    let mint = v.get("mintAddress").and_then(|m| m.as_str())?.to_string();
    let name = v
        .get("name")
        .and_then(|n| n.as_str())
        .unwrap_or(&mint)
        .to_string();
    let image = v
        .get("image")
        .and_then(|i| i.as_str())
        .unwrap_or("")
        .to_string();

    let mut traits = std::collections::HashMap::new();
    if let Some(attrs) = v.get("attributes").and_then(|a| a.as_array()) {
        for attr in attrs {
            let Some(trait_type) = attr.get("trait_type").and_then(|t| t.as_str()) else {
                continue;
            };
            let value = match attr.get("value") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                Some(Value::Bool(b)) => b.to_string(),
                _ => continue,
            };
            traits.insert(trait_type.to_string(), value);
        }
    }

    Some(Item {
        mint,
        name,
        image,
        price: None,
        seller: None,
        traits,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_max_attempts() {
        let policy = RetryPolicy { max_attempts: 3, backoff: Duration::from_secs(5) };
        let attempts = AtomicU32::new(0);
        let counter = &attempts;

        let result: Result<()> = policy
            .run(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(AppError::RateLimited)
            })
            .await;

        assert!(matches!(result, Err(AppError::RateLimited)));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_after_backoff() {
        let policy = RetryPolicy { max_attempts: 3, backoff: Duration::from_secs(5) };
        let attempts = AtomicU32::new(0);
        let counter = &attempts;
        let start = Instant::now();

        let result = policy
            .run(|| async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(AppError::RateLimited)
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        // One backoff interval elapsed between the attempts.
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_passes_other_errors_through() {
        let policy = RetryPolicy { max_attempts: 3, backoff: Duration::from_secs(5) };
        let attempts = AtomicU32::new(0);
        let counter = &attempts;

        let result: Result<()> = policy
            .run(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(AppError::Status(500))
            })
            .await;

        assert!(matches!(result, Err(AppError::Status(500))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_spaces_requests_at_configured_rate() {
        let gate = RequestGate::new(10.0); // 100ms between requests
        let start = Instant::now();

        gate.wait().await; // first passes immediately
        gate.wait().await;
        gate.wait().await;

        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(start.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn parse_listing_converts_sol_to_lamports() {
        let listing = parse_listing(&json!({
            "tokenMint": "mintA",
            "price": 1.5,
            "seller": "sellerA",
        }))
        .unwrap();
        assert_eq!(listing.mint, "mintA");
        assert_eq!(listing.price, 1_500_000_000);
        assert_eq!(listing.seller.as_deref(), Some("sellerA"));
    }

    #[test]
    fn parse_listing_rejects_missing_price() {
        assert!(parse_listing(&json!({ "tokenMint": "mintA" })).is_none());
    }

    #[test]
    fn parse_listing_rejects_negative_price() {
        assert!(parse_listing(&json!({ "tokenMint": "mintA", "price": -0.5 })).is_none());
    }

    #[test]
    fn parse_token_normalizes_attributes() {
        let item = parse_token(&json!({
            "mintAddress": "mintA",
            "name": "Degen #1",
            "image": "https://img/1.png",
            "attributes": [
                { "trait_type": "Background", "value": "Blue" },
                { "trait_type": "Generation", "value": 2 },
                { "trait_type": "Broken", "novalue": true },
            ],
        }))
        .unwrap();
        assert_eq!(item.mint, "mintA");
        assert_eq!(item.name, "Degen #1");
        assert_eq!(item.traits.get("Background").unwrap(), "Blue");
        assert_eq!(item.traits.get("Generation").unwrap(), "2");
        assert!(!item.traits.contains_key("Broken"));
        assert!(item.price.is_none());
    }

    #[test]
    fn parse_token_requires_mint() {
        assert!(parse_token(&json!({ "name": "no mint" })).is_none());
    }

    #[test]
    fn parse_collection_falls_back_to_symbol_for_name() {
        let c = parse_collection(&json!({ "symbol": "degods" })).unwrap();
        assert_eq!(c.name, "degods");
    }
}
