//! Strategies for picking the node a link is routed to.

use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use super::Node;

/// Optional information about the link being placed.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SelectionHints {
    /// Region of the voice server, such as `us-east`.
    pub region: Option<String>,
}

impl SelectionHints {
    /// Derives the region from a voice server endpoint such as
    /// `us-east1234.discord.media:443`.
    pub fn from_endpoint(endpoint: &str) -> Self {
        let host = endpoint.split(['.', ':']).next().unwrap_or_default();
        let region = host.trim_end_matches(|c: char| c.is_ascii_digit());

        Self {
            region: Some(region).filter(|region| !region.is_empty()).map(str::to_owned),
        }
    }
}

/// Picks one node out of the candidates.
///
/// The pool only ever passes connected nodes that weren't excluded, in the
/// order they were registered.
pub trait LoadBalancer: Debug + Send + Sync {
    fn select_node(&self, candidates: &[Arc<Node>], hints: &SelectionHints) -> Option<Arc<Node>>;
}

/// Picks the node with the lowest load score. Ties go to the node
/// registered first.
#[derive(Clone, Copy, Debug, Default)]
pub struct LowestLoad;

impl LoadBalancer for LowestLoad {
    fn select_node(&self, candidates: &[Arc<Node>], hints: &SelectionHints) -> Option<Arc<Node>> {
        lowest_load(candidates.iter(), hints)
    }
}

/// Cycles through the candidates regardless of load.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn select_node(&self, candidates: &[Arc<Node>], _: &SelectionHints) -> Option<Arc<Node>> {
        if candidates.is_empty() {
            return None;
        }

        let index = self.next.fetch_add(1, Ordering::Relaxed) % candidates.len();

        Some(Arc::clone(&candidates[index]))
    }
}

/// Prefers nodes in the requested region, falling back to every candidate
/// when none match. Within either group the lowest load wins.
#[derive(Clone, Copy, Debug, Default)]
pub struct RegionAffinity;

impl LoadBalancer for RegionAffinity {
    fn select_node(&self, candidates: &[Arc<Node>], hints: &SelectionHints) -> Option<Arc<Node>> {
        let local = hints.region.as_deref().and_then(|region| {
            lowest_load(
                candidates.iter().filter(|node| node.region() == Some(region)),
                hints,
            )
        });

        local.or_else(|| lowest_load(candidates.iter(), hints))
    }
}

fn lowest_load<'a>(
    candidates: impl Iterator<Item = &'a Arc<Node>>,
    hints: &SelectionHints,
) -> Option<Arc<Node>> {
    let mut record = f64::INFINITY;
    let mut best = None;

    for node in candidates {
        let score = node.load_score(hints);

        if best.is_none() || score < record {
            best = Some(node);
            record = score;
        }
    }

    best.map(Arc::clone)
}
