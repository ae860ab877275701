//! Next-hop selection.
//!
//! [`next_hop`] is a pure function over a state snapshot and a key. The
//! decision ladder is the classic prefix-routing one: leaf set when the key
//! falls inside the local neighborhood, longest-prefix routing entry
//! otherwise, and a scan for any strictly-closer peer as the rare fallback.
//!
//! Distance is linear `|a - b|` over the 128-bit keyspace. The keyspace is
//! not treated as a true ring; see DESIGN.md for the wraparound decision.

use crate::descriptor::{Descriptor, Health};
use crate::id::{self, Id};
use crate::state::State;

/// Picks the next hop for `key` given the local state. May return the local
/// node when it is the closest. `None` indicates a routing failure (the key
/// does not fit the table geometry, or the state is corrupt) and is
/// surfaced by callers as an internal error.
pub fn next_hop(state: &State, key: Id) -> Option<Descriptor> {
    if in_leaf_range(state, key) {
        // Seed with the local node so it is always a candidate, then let
        // any closer healthy leaf win. Ties go to the lowest id.
        let mut best = state.node().clone();
        let mut best_dist = best.id.distance(key);

        for leaf in state.leaves(true) {
            if state.health_of(&leaf) != Health::Healthy {
                continue;
            }
            let dist = leaf.id.distance(key);
            if (dist, leaf.id) < (best_dist, best.id) {
                best_dist = dist;
                best = leaf;
            }
        }
        return Some(best);
    }

    // Not in leaf range: look for a routing entry sharing one more digit
    // with the key than we do.
    let our_digits = state.node().id.digits(state.size(), state.base())?;
    let key_digits = key.digits(state.size(), state.base())?;
    let prefix_len = id::prefix(&our_digits, &key_digits);

    let row = prefix_len;
    let col = key_digits.at(row) as usize;
    if let Some(entry) = state.routing().get(row, col) {
        if state.health_of(entry) == Health::Healthy {
            return Some(entry.clone());
        }
    }

    // Rare case: any peer at all that shares at least our prefix with the
    // key and sits strictly closer to it.
    let local_distance = state.node().id.distance(key);
    let mut best: Option<Descriptor> = None;
    let mut best_dist = local_distance;

    for p in state.peers(false) {
        let candidate_digits = match p.id.digits(state.size(), state.base()) {
            Some(d) => d,
            None => continue,
        };
        if id::prefix(&candidate_digits, &key_digits) < prefix_len {
            continue;
        }
        let dist = p.id.distance(key);
        if dist < best_dist {
            best_dist = dist;
            best = Some(p);
        }
    }

    Some(best.unwrap_or_else(|| state.node().clone()))
}

/// True when `key` falls within the span the leaf sets cover. While either
/// side is not yet full the cluster is small enough that the leaves span
/// the whole keyspace.
pub fn in_leaf_range(state: &State, key: Id) -> bool {
    if !state.predecessors().is_full() || !state.successors().is_full() {
        return true;
    }

    // Predecessors < node < successors keeps the concatenation sorted, so
    // the span check reduces to its endpoints.
    let low = state
        .predecessors()
        .first()
        .map(|d| d.id)
        .unwrap_or(state.node().id);
    let high = state
        .successors()
        .last()
        .map(|d| d.id)
        .unwrap_or(state.node().id);
    low <= key && key <= high
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Descriptor;
    use crate::state::State;

    fn desc(id: u128) -> Descriptor {
        Descriptor::new(Id(id), "test")
    }

    fn new_state(node: u128) -> State {
        State::new(desc(node), 4, 4, 16, 8)
    }

    fn with_leaves(node: u128, leaves: &[u128]) -> State {
        let mut s = new_state(node);
        for &l in leaves {
            let other = new_state(l);
            assert!(s.mixin_leaves(&other));
        }
        s
    }

    #[test]
    fn exact_match_routes_to_self() {
        let s = new_state(0o1000);
        assert_eq!(next_hop(&s, Id(0o1000)), Some(desc(0o1000)));
    }

    #[test]
    fn empty_table_routes_to_self() {
        let s = new_state(0o1000);
        assert_eq!(next_hop(&s, Id(0o5000)), Some(desc(0o1000)));
    }

    #[test]
    fn incomplete_leaf_set_routes_to_closest_leaf() {
        let s = with_leaves(0o1000, &[0o2000]);
        assert_eq!(next_hop(&s, Id(0o5000)), Some(desc(0o2000)));
    }

    #[test]
    fn full_leaf_set_routes_within_range() {
        let s = with_leaves(0o300, &[0o100, 0o200, 0o400, 0o500]);
        assert!(s.predecessors().is_full());
        assert!(s.successors().is_full());
        assert_eq!(next_hop(&s, Id(0o150)), Some(desc(0o200)));
    }

    #[test]
    fn routing_table_lookup() {
        let mut s = with_leaves(0o1000, &[0o776, 0o777, 0o1001, 0o1002]);
        let peer = new_state(0o3000);
        assert!(s.mixin_routes(&peer));

        assert_eq!(next_hop(&s, Id(0o3123)), Some(desc(0o3000)));
    }

    #[test]
    fn fallback_to_closest_leaf() {
        // No routing entry for the key's prefix: the closest peer among
        // leaves, routes, and neighbors wins.
        let s = with_leaves(0o300, &[0o100, 0o200, 0o400, 0o500]);
        assert_eq!(next_hop(&s, Id(0o1000)), Some(desc(0o500)));
    }

    #[test]
    fn fallback_to_closest_neighbor() {
        let mut s = with_leaves(0o300, &[0o100, 0o200, 0o400, 0o500]);
        s.add_neighbor(desc(0o1050));
        assert_eq!(next_hop(&s, Id(0o1000)), Some(desc(0o1050)));
    }

    #[test]
    fn unhealthy_leaves_are_skipped() {
        let mut s = with_leaves(0o300, &[0o100, 0o200, 0o400, 0o500]);
        s.set_health(desc(0o200), Health::Unhealthy);
        assert_eq!(next_hop(&s, Id(0o150)), Some(desc(0o100)));
    }

    #[test]
    fn oversized_key_is_a_routing_failure() {
        // Force the routing-table path: leaf range checks come first, so
        // both leaf sides must be full.
        let s = with_leaves(0o300, &[0o100, 0o200, 0o400, 0o500]);
        assert_eq!(next_hop(&s, Id(0x1_0000)), None);
    }

    #[test]
    fn self_result_is_closest_among_healthy_leaves() {
        // Property: when routing returns the local node, no healthy leaf
        // is strictly closer to the key.
        let s = with_leaves(0o400, &[0o100, 0o377, 0o401, 0o700]);
        for key in (0..0o700u128).step_by(7) {
            let next = next_hop(&s, Id(key)).expect("routable");
            if next.id == s.node().id {
                let self_dist = s.node().id.distance(Id(key));
                for leaf in s.leaves(false) {
                    assert!(
                        leaf.id.distance(Id(key)) >= self_dist,
                        "leaf {leaf:?} closer than self for key {key:o}"
                    );
                }
            }
        }
    }
}
