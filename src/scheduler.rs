use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::cache::CacheStore;
use crate::client::MarketData;
use crate::config::{Config, LAMPORTS_PER_SOL};
use crate::rarity::{classify, compute_trait_stats};
use crate::sink::NotificationSink;
use crate::types::ClassifiedItem;

// ---------------------------------------------------------------------------
// Cycle outcome
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum CycleOutcome {
    /// The cycle stopped early; the reason names the missing input.
    /// Not an error, the next tick simply tries again.
    Aborted(&'static str),
    Completed(CycleReport),
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub collection_items: usize,
    pub listings: usize,
    pub rare: usize,
    pub newly_rare: usize,
    pub already_seen: usize,
}

// ---------------------------------------------------------------------------
// ScanScheduler
// ---------------------------------------------------------------------------

/// Drives one scan cycle per interval for a single collection.
///
/// The seen set and the scanning flag are the only state shared between the
/// timer and a running cycle; both live here rather than as process globals,
/// so tests can run several schedulers side by side without interference.
/// The scanning flag enforces at-most-one cycle in flight: a tick that fires
/// mid-cycle is dropped, never queued.
pub struct ScanScheduler<C, S> {
    cfg: Config,
    client: C,
    cache: CacheStore,
    sink: S,
    symbol: String,
    /// Mints already reported as rare. Loaded from the cache at startup,
    /// grows monotonically, persisted each cycle and on shutdown.
    seen: Mutex<HashSet<String>>,
    scanning: AtomicBool,
}

impl<C: MarketData, S: NotificationSink> ScanScheduler<C, S> {
    pub fn new(cfg: Config, client: C, cache: CacheStore, sink: S, symbol: String) -> Self {
        let seen = cache.read_seen(&symbol);
        if !seen.is_empty() {
            info!(symbol, seen = seen.len(), "restored seen set from cache");
        }
        Self {
            cfg,
            client,
            cache,
            sink,
            symbol,
            seen: Mutex::new(seen),
            scanning: AtomicBool::new(false),
        }
    }

    /// Scan loop. The first tick fires immediately, so startup doubles as the
    /// initial scan. A termination signal wins over whatever is running: an
    /// in-flight cycle is abandoned at its next await point, the seen set is
    /// persisted, and the loop returns.
    pub async fn run(&self) {
        info!(
            symbol = %self.symbol,
            interval_minutes = self.cfg.scan_interval_minutes,
            "scan scheduler started",
        );
        self.run_until(tokio::signal::ctrl_c()).await;
    }

    async fn run_until<F>(&self, shutdown: F)
    where
        F: std::future::Future<Output = std::io::Result<()>>,
    {
        let mut ticker = interval(Duration::from_secs(self.cfg.scan_interval_minutes * 60));
        // A cycle can outlast the interval. Ticks that fired mid-cycle are
        // skipped, not replayed back to back: the next cycle starts at the
        // next period boundary, never as an immediate catch-up run.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = self.trigger() => {}
                        res = &mut shutdown => {
                            warn!(symbol = %self.symbol, "shutdown mid-cycle, abandoning scan");
                            self.shut_down(res);
                            break;
                        }
                    }
                }
                res = &mut shutdown => {
                    self.shut_down(res);
                    break;
                }
            }
        }
    }

    fn shut_down(&self, signal: std::io::Result<()>) {
        if let Err(e) = signal {
            warn!("signal listener failed, shutting down anyway: {e}");
        }
        info!(symbol = %self.symbol, "termination signal received, persisting seen set");
        self.persist_seen();
    }

    /// Run one cycle unless a cycle is already in flight, in which case the
    /// trigger is dropped with a log line. Returns whether the cycle ran.
    pub async fn trigger(&self) -> bool {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(symbol = %self.symbol, "scan already in progress, trigger dropped");
            return false;
        }

        let started = Instant::now();
        let outcome = self.scan_cycle().await;
        let elapsed = started.elapsed();
        match &outcome {
            CycleOutcome::Aborted(reason) => {
                info!(symbol = %self.symbol, ?elapsed, reason, "scan cycle aborted");
            }
            CycleOutcome::Completed(r) => {
                info!(
                    symbol = %self.symbol,
                    ?elapsed,
                    collection_items = r.collection_items,
                    listings = r.listings,
                    rare = r.rare,
                    newly_rare = r.newly_rare,
                    already_seen = r.already_seen,
                    "scan cycle complete",
                );
            }
        }

        self.scanning.store(false, Ordering::SeqCst);
        true
    }

    /// One full pipeline run: metadata, snapshot, stats, listings, per-token
    /// normalize + overlay, classify, dedup, persist, notify.
    async fn scan_cycle(&self) -> CycleOutcome {
        let symbol = self.symbol.as_str();

        let Some(collection) = self.client.collection(symbol).await else {
            return CycleOutcome::Aborted("collection metadata unavailable");
        };

        if let Some(stats) = self.client.collection_stats(symbol).await {
            info!(
                symbol,
                floor_sol = stats.floor_price.map(|p| p as f64 / LAMPORTS_PER_SOL),
                listed = stats.listed_count,
                "collection stats",
            );
        }

        // Reuse the cached snapshot when fresh; otherwise re-enumerate and
        // cache the result. A partial enumeration is still usable.
        let items = match self.cache.read_snapshot(symbol) {
            Some(items) => items,
            None => {
                let items = self
                    .client
                    .enumerate_items(symbol, self.cfg.max_collection_items)
                    .await;
                if !items.is_empty() {
                    self.cache.write_snapshot(symbol, &items);
                }
                items
            }
        };
        if items.is_empty() {
            return CycleOutcome::Aborted("no collection items");
        }

        // Stats are always computed over the full snapshot, never over the
        // listings subset: the training population stays stable while the
        // classified population varies per cycle.
        let trait_stats = compute_trait_stats(&items);

        let listings = self.client.listings(symbol).await;
        if listings.is_empty() {
            return CycleOutcome::Aborted("no active listings");
        }

        let mut listed_items = Vec::with_capacity(listings.len());
        for listing in &listings {
            match self.client.token(&listing.mint).await {
                Some(mut item) => {
                    item.price = Some(listing.price);
                    item.seller = listing.seller.clone();
                    listed_items.push(item);
                }
                None => {
                    warn!(symbol, mint = %listing.mint, "listing metadata unavailable, skipped");
                }
            }
        }

        let classified = classify(
            &listed_items,
            &trait_stats,
            self.cfg.one_of_one_enabled,
            self.cfg.percent_threshold,
        );
        let rare: Vec<ClassifiedItem> = classified.into_iter().filter(|c| c.is_rare()).collect();

        let mut report = CycleReport {
            collection_items: items.len(),
            listings: listings.len(),
            rare: rare.len(),
            ..CycleReport::default()
        };

        let new_rare: Vec<ClassifiedItem> = {
            let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
            rare.into_iter()
                .filter(|c| seen.insert(c.item.mint.clone()))
                .collect()
        };
        report.newly_rare = new_rare.len();
        report.already_seen = report.rare - report.newly_rare;

        // Commit dedup state before notifying: a sink failure must not cause
        // a re-notification next cycle (at-least-once, no retry).
        self.persist_seen();

        if !new_rare.is_empty() {
            let delivered = self.sink.notify(&new_rare, &collection.name).await;
            if delivered {
                info!(symbol, notified = new_rare.len(), "rare items notified");
            } else {
                warn!(
                    symbol,
                    dropped = new_rare.len(),
                    "notification sink reported failure, items will not be retried",
                );
            }
        }

        CycleOutcome::Completed(report)
    }

    fn persist_seen(&self) {
        let seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        if !self.cache.write_seen(&self.symbol, &seen) {
            warn!(symbol = %self.symbol, "seen set not persisted");
        }
    }

    #[cfg(test)]
    fn seen_contains(&self, mint: &str) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(mint)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    use crate::types::{Collection, CollectionStats, Item, Listing, RareReason};

    fn item(mint: &str, traits: &[(&str, &str)]) -> Item {
        Item {
            mint: mint.to_string(),
            name: format!("Item {mint}"),
            image: String::new(),
            price: None,
            seller: None,
            traits: traits
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// 100 items; m0 carries the only "Crown" hat, everyone else wears "Cap".
    fn collection_of_100() -> Vec<Item> {
        (0..100)
            .map(|i| {
                let hat = if i == 0 { "Crown" } else { "Cap" };
                item(&format!("m{i}"), &[("Hat", hat), ("Background", "Blue")])
            })
            .collect()
    }

    struct FakeMarket {
        items: Vec<Item>,
        listings: Vec<Listing>,
        listings_delay: Duration,
        listings_calls: AtomicU32,
        enumerate_calls: AtomicU32,
    }

    impl FakeMarket {
        fn new(items: Vec<Item>, listed: &[&str]) -> Self {
            let listings = listed
                .iter()
                .map(|mint| Listing {
                    mint: mint.to_string(),
                    price: 2_000_000_000,
                    seller: Some("sellerA".to_string()),
                })
                .collect();
            Self {
                items,
                listings,
                listings_delay: Duration::ZERO,
                listings_calls: AtomicU32::new(0),
                enumerate_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl MarketData for Arc<FakeMarket> {
        async fn collection(&self, symbol: &str) -> Option<Collection> {
            Some(Collection {
                symbol: symbol.to_string(),
                name: "Test Collection".to_string(),
            })
        }

        async fn collection_stats(&self, _symbol: &str) -> Option<CollectionStats> {
            None
        }

        async fn listings(&self, _symbol: &str) -> Vec<Listing> {
            self.listings_calls.fetch_add(1, Ordering::SeqCst);
            if self.listings_delay > Duration::ZERO {
                tokio::time::sleep(self.listings_delay).await;
            }
            self.listings.clone()
        }

        async fn enumerate_items(&self, _symbol: &str, max_items: usize) -> Vec<Item> {
            self.enumerate_calls.fetch_add(1, Ordering::SeqCst);
            self.items.iter().take(max_items).cloned().collect()
        }

        async fn token(&self, mint: &str) -> Option<Item> {
            self.items.iter().find(|i| i.mint == mint).cloned()
        }
    }

    #[derive(Clone)]
    struct RecordingSink {
        calls: Arc<Mutex<Vec<Vec<ClassifiedItem>>>>,
        succeed: bool,
    }

    impl RecordingSink {
        fn new(succeed: bool) -> Self {
            Self { calls: Arc::new(Mutex::new(Vec::new())), succeed }
        }

        fn calls(&self) -> Vec<Vec<ClassifiedItem>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn notify(&self, items: &[ClassifiedItem], _collection_name: &str) -> bool {
            self.calls.lock().unwrap().push(items.to_vec());
            self.succeed
        }
    }

    fn test_config(cache_dir: &std::path::Path) -> Config {
        Config {
            api_url: "http://unused.test".to_string(),
            log_level: "info".to_string(),
            requests_per_sec: 1000.0,
            one_of_one_enabled: true,
            percent_threshold: 1.0,
            scan_interval_minutes: 5,
            cache_enabled: true,
            cache_dir: cache_dir.display().to_string(),
            cache_expiry_hours: 24,
            max_collection_items: 2500,
        }
    }

    fn scheduler(
        dir: &std::path::Path,
        market: Arc<FakeMarket>,
        sink: RecordingSink,
    ) -> ScanScheduler<Arc<FakeMarket>, RecordingSink> {
        let cfg = test_config(dir);
        let cache = CacheStore::new(
            cfg.cache_dir.clone(),
            cfg.cache_enabled,
            Duration::from_secs(cfg.cache_expiry_hours * 3600),
        );
        ScanScheduler::new(cfg, market, cache, sink, "testcoll".to_string())
    }

    #[tokio::test]
    async fn one_of_one_listing_notified_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let market = Arc::new(FakeMarket::new(collection_of_100(), &["m0"]));
        let sink = RecordingSink::new(true);
        let sched = scheduler(dir.path(), Arc::clone(&market), sink.clone());

        assert!(sched.trigger().await);

        let calls = sink.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].len(), 1);
        let rare = &calls[0][0];
        assert_eq!(rare.item.mint, "m0");
        // Listing price/seller overlaid during normalization.
        assert_eq!(rare.item.price, Some(2_000_000_000));
        assert_eq!(rare.item.seller.as_deref(), Some("sellerA"));
        // Crown is both count==1 and exactly 1%; one-of-one wins as reason.
        assert_eq!(rare.rarity["Hat"].reason, Some(RareReason::OneOfOne));
        assert!(sched.seen_contains("m0"));
    }

    #[tokio::test]
    async fn unchanged_second_cycle_notifies_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let market = Arc::new(FakeMarket::new(collection_of_100(), &["m0", "m1"]));
        let sink = RecordingSink::new(true);
        let sched = scheduler(dir.path(), Arc::clone(&market), sink.clone());

        assert!(sched.trigger().await);
        assert!(sched.trigger().await);

        // Second cycle re-ran end to end but found nothing unseen.
        assert_eq!(sink.calls().len(), 1);
    }

    #[tokio::test]
    async fn seen_set_survives_scheduler_restart() {
        let dir = tempfile::tempdir().unwrap();
        let market = Arc::new(FakeMarket::new(collection_of_100(), &["m0"]));

        let sink1 = RecordingSink::new(true);
        let sched1 = scheduler(dir.path(), Arc::clone(&market), sink1.clone());
        sched1.trigger().await;
        assert_eq!(sink1.calls().len(), 1);

        // Fresh scheduler, same cache dir: m0 was already reported.
        let sink2 = RecordingSink::new(true);
        let sched2 = scheduler(dir.path(), Arc::clone(&market), sink2.clone());
        sched2.trigger().await;
        assert!(sink2.calls().is_empty());
    }

    #[tokio::test]
    async fn sink_failure_still_commits_dedup_state() {
        let dir = tempfile::tempdir().unwrap();
        let market = Arc::new(FakeMarket::new(collection_of_100(), &["m0"]));
        let sink = RecordingSink::new(false);
        let sched = scheduler(dir.path(), Arc::clone(&market), sink.clone());

        sched.trigger().await;
        assert_eq!(sink.calls().len(), 1);

        // The failed item is not retried next cycle.
        sched.trigger().await;
        assert_eq!(sink.calls().len(), 1);
        assert!(sched.seen_contains("m0"));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_trigger_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut market = FakeMarket::new(collection_of_100(), &["m0"]);
        market.listings_delay = Duration::from_millis(200);
        let market = Arc::new(market);
        let sink = RecordingSink::new(true);
        let sched = Arc::new(scheduler(dir.path(), Arc::clone(&market), sink.clone()));

        let a = Arc::clone(&sched);
        let b = Arc::clone(&sched);
        let (ran_a, ran_b) = tokio::join!(
            async move { a.trigger().await },
            async move { b.trigger().await },
        );

        // Exactly one cycle ran; the other trigger was dropped.
        assert!(ran_a ^ ran_b);
        assert_eq!(market.listings_calls.load(Ordering::SeqCst), 1);
        assert_eq!(sink.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_cycle_skips_missed_ticks_instead_of_replaying_them() {
        let dir = tempfile::tempdir().unwrap();
        // 650 s cycle against a 300 s interval: the ticks at 300 and 600 fire
        // mid-cycle and must be skipped, not run back to back afterwards.
        let mut market = FakeMarket::new(collection_of_100(), &["m0"]);
        market.listings_delay = Duration::from_secs(650);
        let market = Arc::new(market);
        let sink = RecordingSink::new(true);
        let sched = scheduler(dir.path(), Arc::clone(&market), sink.clone());

        sched
            .run_until(async {
                tokio::time::sleep(Duration::from_secs(800)).await;
                Ok::<_, std::io::Error>(())
            })
            .await;

        // The next cycle would start at the 900 s boundary, after shutdown.
        assert_eq!(market.listings_calls.load(Ordering::SeqCst), 1);
        assert_eq!(sink.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_in_flight_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut market = FakeMarket::new(collection_of_100(), &["m0"]);
        market.listings_delay = Duration::from_secs(1000);
        let market = Arc::new(market);
        let sink = RecordingSink::new(true);
        let sched = scheduler(dir.path(), Arc::clone(&market), sink.clone());

        let start = Instant::now();
        sched
            .run_until(async {
                tokio::time::sleep(Duration::from_secs(100)).await;
                Ok::<_, std::io::Error>(())
            })
            .await;

        // Returned at the signal, not after the 1000 s cycle.
        assert!(start.elapsed() < Duration::from_secs(300));
        assert_eq!(market.listings_calls.load(Ordering::SeqCst), 1);
        assert!(sink.calls().is_empty());
        // The seen set was still persisted on the way out.
        assert!(dir.path().join("testcoll.seen.json").exists());
    }

    #[tokio::test]
    async fn fresh_snapshot_skips_re_enumeration() {
        let dir = tempfile::tempdir().unwrap();
        let market = Arc::new(FakeMarket::new(collection_of_100(), &["m0"]));
        let sink = RecordingSink::new(true);
        let sched = scheduler(dir.path(), Arc::clone(&market), sink.clone());

        sched.trigger().await;
        sched.trigger().await;

        // First cycle enumerated and cached; the second reused the snapshot.
        assert_eq!(market.enumerate_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_listings_abort_cycle_without_notifying() {
        let dir = tempfile::tempdir().unwrap();
        let market = Arc::new(FakeMarket::new(collection_of_100(), &[]));
        let sink = RecordingSink::new(true);
        let sched = scheduler(dir.path(), Arc::clone(&market), sink.clone());

        let outcome = sched.scan_cycle().await;
        assert!(matches!(outcome, CycleOutcome::Aborted("no active listings")));
        assert!(sink.calls().is_empty());
    }

    #[tokio::test]
    async fn empty_collection_aborts_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let market = Arc::new(FakeMarket::new(Vec::new(), &["m0"]));
        let sink = RecordingSink::new(true);
        let sched = scheduler(dir.path(), Arc::clone(&market), sink.clone());

        let outcome = sched.scan_cycle().await;
        assert!(matches!(outcome, CycleOutcome::Aborted("no collection items")));
        assert!(sink.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_listing_metadata_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        // "ghost" is listed but has no token metadata.
        let market = Arc::new(FakeMarket::new(collection_of_100(), &["ghost", "m0"]));
        let sink = RecordingSink::new(true);
        let sched = scheduler(dir.path(), Arc::clone(&market), sink.clone());

        let outcome = sched.scan_cycle().await;
        match outcome {
            CycleOutcome::Completed(r) => {
                assert_eq!(r.listings, 2);
                assert_eq!(r.newly_rare, 1);
            }
            other => panic!("expected completed cycle, got {other:?}"),
        }
        let calls = sink.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][0].item.mint, "m0");
    }
}
