use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// A normalized NFT. Built once from a raw token record; afterwards only
/// `price`/`seller` are overlaid from a live listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    /// Mint address, the unique id within a collection.
    pub mint: String,
    pub name: String,
    pub image: String,
    /// Current listing price in lamports; None if unlisted.
    pub price: Option<u64>,
    pub seller: Option<String>,
    /// trait_type → trait_value. Key set is whatever the metadata carries.
    pub traits: HashMap<String, String>,
}

/// Collection metadata from `GET /collections/{symbol}`.
#[derive(Debug, Clone)]
pub struct Collection {
    pub symbol: String,
    pub name: String,
}

/// Collection statistics from `GET /collections/{symbol}/stats`.
#[derive(Debug, Clone, Default)]
pub struct CollectionStats {
    pub floor_price: Option<u64>,
    pub listed_count: Option<u64>,
    pub volume_all: Option<f64>,
}

/// An active listing. Price is already converted to lamports.
#[derive(Debug, Clone)]
pub struct Listing {
    pub mint: String,
    pub price: u64,
    pub seller: Option<String>,
}

// ---------------------------------------------------------------------------
// Trait statistics
// ---------------------------------------------------------------------------

/// Count and share of one trait value across the full collection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueStat {
    pub count: u32,
    /// Percentage of the full snapshot, in [0, 100].
    pub percentage: f64,
}

/// Trait-frequency statistics over a full collection snapshot.
/// Recomputed wholesale each cycle, never partially updated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraitStats {
    pub total_items: usize,
    /// trait_type → trait_value → stat.
    pub traits: HashMap<String, HashMap<String, ValueStat>>,
}

impl TraitStats {
    pub fn is_empty(&self) -> bool {
        self.traits.is_empty()
    }

    pub fn get(&self, trait_type: &str, value: &str) -> Option<ValueStat> {
        self.traits.get(trait_type)?.get(value).copied()
    }
}

// ---------------------------------------------------------------------------
// Rarity classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RareReason {
    /// Trait value held by exactly one item in the collection.
    #[serde(rename = "one-of-one")]
    OneOfOne,
    /// Trait value's share of the collection is at or below the threshold.
    #[serde(rename = "below-threshold")]
    BelowThreshold,
}

impl std::fmt::Display for RareReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RareReason::OneOfOne => write!(f, "one-of-one"),
            RareReason::BelowThreshold => write!(f, "below-threshold"),
        }
    }
}

/// Per-trait annotation attached during classification. Non-rare traits keep
/// their stat too, so downstream consumers see the full picture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraitRarity {
    pub value: String,
    pub count: u32,
    pub percentage: f64,
    pub rare: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RareReason>,
}

/// An item plus its rarity annotations. BTreeMap keeps trait output stable
/// for logging and serialized notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedItem {
    #[serde(flatten)]
    pub item: Item,
    pub rarity: BTreeMap<String, TraitRarity>,
}

impl ClassifiedItem {
    /// Rare iff at least one trait annotation is rare.
    pub fn is_rare(&self) -> bool {
        self.rarity.values().any(|t| t.rare)
    }

    /// The rare trait annotations, for notification formatting.
    pub fn rare_traits(&self) -> impl Iterator<Item = (&String, &TraitRarity)> {
        self.rarity.iter().filter(|(_, t)| t.rare)
    }
}
