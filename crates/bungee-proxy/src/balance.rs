//! Weighted + priority upstream selection.
//!
//! Selection considers only the highest-priority group (lowest numeric
//! value) whose total weight is positive, then draws one member at
//! random proportionally to weight. The retry queue covers the remaining
//! candidates for failover, ordered by priority then weight.

use crate::health::RuntimeUpstream;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Pick one upstream, or `None` when every priority group sums to zero
/// weight. The draw is `r` uniform in `[0, total)`; members are walked
/// subtracting their weight until `r` drops to or below zero. Floating
/// point leftovers fall through to the last member of the group.
pub fn select_upstream<R: Rng + ?Sized>(
    candidates: &[Arc<RuntimeUpstream>],
    rng: &mut R,
) -> Option<Arc<RuntimeUpstream>> {
    let mut groups: BTreeMap<u32, Vec<&Arc<RuntimeUpstream>>> = BTreeMap::new();
    for upstream in candidates {
        groups
            .entry(upstream.upstream.priority)
            .or_default()
            .push(upstream);
    }

    for group in groups.values() {
        let total: u64 = group.iter().map(|u| u.upstream.weight as u64).sum();
        if total == 0 {
            continue;
        }

        let mut r = rng.gen_range(0.0..total as f64);
        for upstream in group {
            r -= upstream.upstream.weight as f64;
            if r <= 0.0 {
                return Some(Arc::clone(upstream));
            }
        }
        return group.last().map(|u| Arc::clone(u));
    }

    None
}

/// Remaining candidates after the first-try pick, ordered for failover:
/// ascending priority, then descending weight.
pub fn retry_queue(
    candidates: &[Arc<RuntimeUpstream>],
    first: &Arc<RuntimeUpstream>,
) -> Vec<Arc<RuntimeUpstream>> {
    let mut queue: Vec<Arc<RuntimeUpstream>> = candidates
        .iter()
        .filter(|u| !Arc::ptr_eq(u, first))
        .cloned()
        .collect();
    queue.sort_by(|a, b| {
        a.upstream
            .priority
            .cmp(&b.upstream.priority)
            .then(b.upstream.weight.cmp(&a.upstream.weight))
    });
    queue
}
