//! Peer descriptors, bounded descriptor sets, and health states.

use std::fmt;

use crate::id::Id;

/// Describes a peer in the overlay: its ring identity plus an opaque
/// transport locator.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Descriptor {
    /// Ring identity used for routing.
    pub id: Id,
    /// Address used for connecting. Opaque to the overlay.
    pub addr: String,
}

impl Descriptor {
    /// Creates a descriptor.
    pub fn new(id: Id, addr: impl Into<String>) -> Self {
        Descriptor {
            id,
            addr: addr.into(),
        }
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

/// Health state of a peer.
///
/// A peer missing from a status map counts as [`Health::Healthy`]; the
/// other states are always recorded explicitly. The failure detector
/// enforces the transition rules: Dead never moves to Unhealthy, and
/// Healthy moves straight to Dead only through an explicit declaration
/// such as a goodbye.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Health {
    /// The peer responds to probes. The default state.
    #[default]
    Healthy,
    /// The peer is suspect and is skipped by routing until it recovers.
    Unhealthy,
    /// The peer is gone and should be repaired out of the state tables.
    Dead,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Health::Healthy => f.write_str("Healthy"),
            Health::Unhealthy => f.write_str("Unhealthy"),
            Health::Dead => f.write_str("Dead"),
        }
    }
}

/// A bounded, ordered set of descriptors, ascending by id.
///
/// `keep_biggest` picks which end survives when an insert pushes the set
/// past capacity: `true` trims from the front (keeping the biggest ids),
/// `false` trims from the back. For the set of IDs (0, 1, 2) at capacity 3,
/// inserting 5 with `keep_biggest` yields (1, 2, 5); without it the set
/// stays (0, 1, 2).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorSet {
    descriptors: Vec<Descriptor>,
    size: usize,
    keep_biggest: bool,
}

impl DescriptorSet {
    /// Creates an empty set with the given capacity and trim policy.
    pub fn new(size: usize, keep_biggest: bool) -> Self {
        DescriptorSet {
            descriptors: Vec::with_capacity(size),
            size,
            keep_biggest,
        }
    }

    /// Capacity of the set.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of descriptors currently held.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// True when the set holds nothing.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// True when the set is at capacity.
    pub fn is_full(&self) -> bool {
        self.descriptors.len() >= self.size
    }

    /// The descriptors in ascending id order.
    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    /// Iterates the descriptors in ascending id order.
    pub fn iter(&self) -> std::slice::Iter<'_, Descriptor> {
        self.descriptors.iter()
    }

    /// The smallest-id descriptor, if any.
    pub fn first(&self) -> Option<&Descriptor> {
        self.descriptors.first()
    }

    /// The largest-id descriptor, if any.
    pub fn last(&self) -> Option<&Descriptor> {
        self.descriptors.last()
    }

    /// True if `d` is in the set.
    pub fn contains(&self, d: &Descriptor) -> bool {
        let i = self.search(d);
        self.descriptors.get(i) == Some(d)
    }

    /// Removes `d`. Returns true if the element was removed.
    pub fn remove(&mut self, d: &Descriptor) -> bool {
        let i = self.search(d);
        if self.descriptors.get(i) != Some(d) {
            return false;
        }
        self.descriptors.remove(i);
        true
    }

    /// Inserts `d` unless the set is full or `d` is already present.
    /// Returns true if the set was modified.
    pub fn push(&mut self, d: Descriptor) -> bool {
        self.inject(d, false)
    }

    /// Inserts `d` unless already present, trimming the policy-specified
    /// end when the set goes past capacity. Returns true if the set was
    /// modified.
    pub fn insert(&mut self, d: Descriptor) -> bool {
        self.inject(d, true)
    }

    // All ordering flows through this single comparison; a circular order
    // would slot in here.
    fn search(&self, d: &Descriptor) -> usize {
        self.descriptors.partition_point(|other| other.id < d.id)
    }

    fn inject(&mut self, d: Descriptor, evict: bool) -> bool {
        if !evict && self.is_full() {
            return false;
        }

        let i = self.search(&d);
        if self.descriptors.get(i) == Some(&d) {
            return false;
        }
        self.descriptors.insert(i, d);

        while self.descriptors.len() > self.size {
            if self.keep_biggest {
                self.descriptors.remove(0);
            } else {
                self.descriptors.pop();
            }
        }
        true
    }
}

impl<'a> IntoIterator for &'a DescriptorSet {
    type Item = &'a Descriptor;
    type IntoIter = std::slice::Iter<'a, Descriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.descriptors.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(id: u128) -> Descriptor {
        Descriptor::new(Id(id), "test")
    }

    fn ids(set: &DescriptorSet) -> Vec<u128> {
        set.iter().map(|d| d.id.0).collect()
    }

    #[test]
    fn push_keeps_smallest_without_eviction() {
        let mut set = DescriptorSet::new(4, false);
        for id in [1u128, 10, 2, 5, 3, 6] {
            set.push(desc(id));
        }
        assert_eq!(ids(&set), vec![1, 2, 5, 10]);
    }

    #[test]
    fn insert_trims_policy_end() {
        let mut smallest = DescriptorSet::new(4, false);
        let mut biggest = DescriptorSet::new(4, true);
        for id in [1u128, 10, 2, 5, 3, 6] {
            smallest.insert(desc(id));
            biggest.insert(desc(id));
        }
        assert_eq!(ids(&smallest), vec![1, 2, 3, 5]);
        assert_eq!(ids(&biggest), vec![3, 5, 6, 10]);
    }

    #[test]
    fn push_past_limit_is_noop() {
        let mut smallest = DescriptorSet::new(3, false);
        let mut biggest = DescriptorSet::new(3, true);
        for id in [0u128, 1, 2] {
            assert!(smallest.insert(desc(id)));
            assert!(biggest.insert(desc(id)));
        }
        assert!(!smallest.push(desc(5)));
        assert!(biggest.insert(desc(5)));
        assert_eq!(ids(&smallest), vec![0, 1, 2]);
        assert_eq!(ids(&biggest), vec![1, 2, 5]);
    }

    #[test]
    fn duplicate_insert_is_noop() {
        let mut set = DescriptorSet::new(4, false);
        assert!(set.insert(desc(7)));
        assert!(!set.insert(desc(7)));
        assert!(!set.push(desc(7)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn same_id_different_addr_is_distinct() {
        let mut set = DescriptorSet::new(4, false);
        assert!(set.insert(Descriptor::new(Id(7), "a")));
        assert!(set.insert(Descriptor::new(Id(7), "b")));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn remove_cases() {
        let cases: &[(&[u128], u128, &[u128])] = &[
            (&[1, 2, 3, 5], 3, &[1, 2, 5]),
            (&[1, 2, 3, 5], 1, &[2, 3, 5]),
            (&[1, 2, 3, 5], 5, &[1, 2, 3]),
            (&[1, 2, 3, 5], 9, &[1, 2, 3, 5]),
            (&[1], 0, &[1]),
        ];
        for (input, remove, expect) in cases {
            let mut set = DescriptorSet::new(8, false);
            for &id in *input {
                set.insert(desc(id));
            }
            set.remove(&desc(*remove));
            assert_eq!(ids(&set), expect.to_vec());
        }
    }

    #[test]
    fn never_exceeds_capacity() {
        for keep_biggest in [false, true] {
            let mut set = DescriptorSet::new(5, keep_biggest);
            for id in 0..100u128 {
                // Mix of pushes and inserts in an arbitrary order.
                let id = (id * 37) % 101;
                if id % 3 == 0 {
                    set.push(desc(id));
                } else {
                    set.insert(desc(id));
                }
                assert!(set.len() <= 5);
                let sorted: Vec<u128> = ids(&set);
                let mut expect = sorted.clone();
                expect.sort_unstable();
                assert_eq!(sorted, expect, "set stays ordered");
            }
            assert!(set.is_full());
        }
    }
}
