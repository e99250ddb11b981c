use async_trait::async_trait;
use tracing::info;

use crate::config::LAMPORTS_PER_SOL;
use crate::types::ClassifiedItem;

/// Downstream channel for newly-discovered rare items. The scanner only
/// consumes this interface; delivery transport and formatting live behind it.
/// Returns true on successful delivery. A false return is logged by the
/// caller and never retried; dedup state is already committed by then.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, items: &[ClassifiedItem], collection_name: &str) -> bool;
}

/// Default sink for the binary: one structured log line per rare item.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, items: &[ClassifiedItem], collection_name: &str) -> bool {
        for item in items {
            let rare: Vec<String> = item
                .rare_traits()
                .map(|(trait_type, t)| {
                    let reason = t
                        .reason
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "rare".to_string());
                    format!("{trait_type}={} ({reason}, {:.2}%)", t.value, t.percentage)
                })
                .collect();
            let price_sol = item
                .item
                .price
                .map(|lamports| lamports as f64 / LAMPORTS_PER_SOL);
            info!(
                collection = collection_name,
                mint = %item.item.mint,
                name = %item.item.name,
                price_sol = ?price_sol,
                "RARE LISTING | {} | {}",
                item.item.name,
                rare.join(", "),
            );
        }
        true
    }
}
