//! Tiered NAT-traversal resource selection.
//!
//! Every connection attempt for a peer runs against one ordered set of ICE
//! endpoints. Attempt zero uses the primary set; each retry falls back to
//! the next alternate and stays on the last one once the list is exhausted,
//! so the search space is bounded by the number of tiers no matter how many
//! retries are configured.

use serde::{Deserialize, Serialize};

/// Default STUN endpoints used when no configuration could be loaded.
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// One ordered set of NAT-traversal helper endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceResourceSet {
    pub urls: Vec<String>,
}

impl IceResourceSet {
    pub fn new(urls: Vec<String>) -> Self {
        Self { urls }
    }

    /// The hardcoded fallback set.
    pub fn default_stun() -> Self {
        Self {
            urls: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Maps a retry count onto the resource set to use for the next attempt.
#[derive(Debug, Clone)]
pub struct TierSelector {
    tiers: Vec<IceResourceSet>,
}

impl TierSelector {
    /// Build a selector from an ordered tier list. An empty list collapses
    /// to a single default STUN tier so the selector is never empty.
    pub fn new(tiers: Vec<IceResourceSet>) -> Self {
        if tiers.is_empty() {
            Self {
                tiers: vec![IceResourceSet::default_stun()],
            }
        } else {
            Self { tiers }
        }
    }

    /// Tier index for a given retry count: `min(retry_count, len - 1)`.
    pub fn tier_index(&self, retry_count: u32) -> usize {
        (retry_count as usize).min(self.tiers.len() - 1)
    }

    /// Resource set for a given retry count.
    pub fn select(&self, retry_count: u32) -> &IceResourceSet {
        &self.tiers[self.tier_index(retry_count)]
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl Default for TierSelector {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector(n: usize) -> TierSelector {
        TierSelector::new(
            (0..n)
                .map(|i| IceResourceSet::new(vec![format!("stun:tier{}.example.com:3478", i)]))
                .collect(),
        )
    }

    #[test]
    fn test_tier_is_min_of_retry_and_last() {
        let tiers = selector(3);
        for retry in 0u32..10 {
            assert_eq!(tiers.tier_index(retry), (retry as usize).min(2));
        }
    }

    #[test]
    fn test_selection_is_monotonic() {
        let tiers = selector(4);
        let mut last = 0;
        for retry in 0u32..8 {
            let idx = tiers.tier_index(retry);
            assert!(idx >= last);
            last = idx;
        }
    }

    #[test]
    fn test_empty_list_falls_back_to_default_stun() {
        let tiers = TierSelector::new(Vec::new());
        assert_eq!(tiers.len(), 1);
        assert_eq!(tiers.select(0), &IceResourceSet::default_stun());
        assert_eq!(tiers.select(99), &IceResourceSet::default_stun());
    }
}
