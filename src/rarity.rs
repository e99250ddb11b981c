use std::collections::{BTreeMap, HashMap, HashSet};

use crate::types::{ClassifiedItem, Item, RareReason, TraitRarity, TraitStats, ValueStat};

/// Literal value recorded for a trait type an item does not carry. An absent
/// trait is itself a signal: "no hat" can be rarer than any hat.
pub const MISSING_TRAIT_VALUE: &str = "None";

/// Count every trait value across the full collection and express each as a
/// count and a percentage of the input size. Pure and order-independent;
/// an empty input yields empty stats.
pub fn compute_trait_stats(items: &[Item]) -> TraitStats {
    if items.is_empty() {
        return TraitStats::default();
    }

    let trait_types: HashSet<&str> = items
        .iter()
        .flat_map(|item| item.traits.keys().map(String::as_str))
        .collect();

    let mut counts: HashMap<String, HashMap<String, u32>> = HashMap::new();
    for item in items {
        for &trait_type in &trait_types {
            let value = item
                .traits
                .get(trait_type)
                .map(String::as_str)
                .unwrap_or(MISSING_TRAIT_VALUE);
            *counts
                .entry(trait_type.to_string())
                .or_default()
                .entry(value.to_string())
                .or_insert(0) += 1;
        }
    }

    let total = items.len();
    let traits = counts
        .into_iter()
        .map(|(trait_type, values)| {
            let stats = values
                .into_iter()
                .map(|(value, count)| {
                    let percentage = count as f64 / total as f64 * 100.0;
                    (value, ValueStat { count, percentage })
                })
                .collect();
            (trait_type, stats)
        })
        .collect();

    TraitStats { total_items: total, traits }
}

/// Annotate each item's traits against collection-wide stats.
///
/// A trait is rare if it is a one-of-one (when enabled) or its percentage is
/// at or below the threshold (inclusive). One-of-one wins as the reported
/// reason when both hold. Trait types in the stats but absent on an item are
/// looked up as `"None"`, matching how the stats were computed. A value never
/// observed in the stats population gets no annotation for that type.
pub fn classify(
    items: &[Item],
    stats: &TraitStats,
    one_of_one_enabled: bool,
    percent_threshold: f64,
) -> Vec<ClassifiedItem> {
    items
        .iter()
        .map(|item| {
            let mut rarity = BTreeMap::new();
            for trait_type in stats.traits.keys() {
                let value = item
                    .traits
                    .get(trait_type)
                    .map(String::as_str)
                    .unwrap_or(MISSING_TRAIT_VALUE);
                let Some(stat) = stats.get(trait_type, value) else {
                    continue;
                };

                let reason = if one_of_one_enabled && stat.count == 1 {
                    Some(RareReason::OneOfOne)
                } else if stat.percentage <= percent_threshold {
                    Some(RareReason::BelowThreshold)
                } else {
                    None
                };

                rarity.insert(
                    trait_type.clone(),
                    TraitRarity {
                        value: value.to_string(),
                        count: stat.count,
                        percentage: stat.percentage,
                        rare: reason.is_some(),
                        reason,
                    },
                );
            }
            ClassifiedItem { item: item.clone(), rarity }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
