//! Per-node routing state.
//!
//! [`State`] holds everything a node knows about the overlay: the leaf sets
//! flanking its own identity, the prefix routing table, the neighborhood
//! hint set, and the health it believes each tracked peer to be in. All of
//! it converges by gossip: peers exchange state in hellos and mix what they
//! receive into their own tables.
//!
//! `State` itself is plain data; [`SharedState`] wraps it for concurrent
//! use with one mutex and method-scoped critical sections. No lock is ever
//! held across an RPC — repair paths snapshot with [`State::clone`] and
//! apply their conclusions through the idempotent `replace_*` operations,
//! which tolerate racing repairs.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::descriptor::{Descriptor, DescriptorSet, Health};
use crate::id::{self, Digits, Id};

/// A state-sharing message. During a join the chain of hellos a joiner
/// accumulates (seed first, destination last) is the raw material for its
/// initial state.
#[derive(Clone, Debug)]
pub struct Hello {
    /// The node that initiated the hello.
    pub initiator: Descriptor,
    /// The next node (if any) that will also send a hello to the joiner.
    pub next: Option<Descriptor>,
    /// State of the initiator.
    pub state: State,
    /// When set, asserts the receiver's state version the initiator last
    /// observed. A receiver whose state moved past this refuses with
    /// [`crate::Error::StateChanged`].
    pub ack: Option<u64>,
}

/// The prefix routing table: one row per ID digit, one column per possible
/// digit value. A populated cell (r, c) holds a peer sharing the first `r`
/// digits with the local node whose digit at position `r` is `c`; the local
/// node itself sits on the diagonal of every row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingTable {
    base: usize,
    cells: Vec<Option<Descriptor>>,
}

impl RoutingTable {
    /// Creates an empty `rows x base` table.
    pub fn new(base: usize, rows: usize) -> Self {
        RoutingTable {
            base,
            cells: vec![None; base * rows],
        }
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.cells.len() / self.base
    }

    /// Number of columns.
    pub fn base(&self) -> usize {
        self.base
    }

    /// The entry at (row, col), if populated.
    pub fn get(&self, row: usize, col: usize) -> Option<&Descriptor> {
        self.cells[row * self.base + col].as_ref()
    }

    /// Replaces the entry at (row, col).
    pub fn set(&mut self, row: usize, col: usize, d: Option<Descriptor>) {
        self.cells[row * self.base + col] = d;
    }

    /// Iterates populated cells as (row, col, descriptor).
    pub fn entries(&self) -> impl Iterator<Item = (usize, usize, &Descriptor)> {
        self.cells.iter().enumerate().filter_map(move |(i, cell)| {
            cell.as_ref().map(|d| (i / self.base, i % self.base, d))
        })
    }

    /// Iterates the populated cells of one row.
    pub fn row(&self, row: usize) -> impl Iterator<Item = &Descriptor> {
        self.cells[row * self.base..(row + 1) * self.base]
            .iter()
            .filter_map(|c| c.as_ref())
    }
}

/// Which state groups a mix-in touched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MixinOutcome {
    /// The routing table gained entries.
    pub routes: bool,
    /// The neighborhood gained entries.
    pub neighbors: bool,
    /// The leaf sets gained entries.
    pub leaves: bool,
}

/// The state of a node used for routing messages.
#[derive(Clone, Debug)]
pub struct State {
    /// The node this state is for. Immutable identity.
    node: Descriptor,

    /// The nodes immediately before and after this node on the ring.
    predecessors: DescriptorSet,
    successors: DescriptorSet,

    /// Bit length of IDs and the power-of-two base they are routed in.
    size: u32,
    base: u32,

    routing: RoutingTable,

    /// Proximity-hint peers. Not needed for routing correctness.
    neighbors: DescriptorSet,

    /// Health per tracked peer. A missing entry counts as Healthy.
    statuses: HashMap<Descriptor, Health>,

    /// Nanoseconds since the epoch of the last modification. Monotonic
    /// within a node; an opaque staleness token, never interpreted.
    version: u64,
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

impl State {
    /// Creates the state for `node`. `num_leaves` must be even: half the
    /// budget tracks predecessors, half successors.
    pub fn new(
        node: Descriptor,
        num_leaves: usize,
        num_neighbors: usize,
        size: u32,
        base: u32,
    ) -> Self {
        assert!(num_leaves % 2 == 0, "num_leaves must be a multiple of 2");

        let rows = id::digit_count(size, base);
        let mut state = State {
            node,
            // Predecessors <= node <= successors: the predecessor set keeps
            // the biggest ids so both sets hug the local node.
            predecessors: DescriptorSet::new(num_leaves / 2, true),
            successors: DescriptorSet::new(num_leaves / 2, false),
            size,
            base,
            routing: RoutingTable::new(base as usize, rows),
            neighbors: DescriptorSet::new(num_neighbors, false),
            statuses: HashMap::new(),
            version: now_nanos(),
        };
        state.reset();
        state
    }

    /// Rebuilds a state from parts decoded off the wire. Set capacities
    /// match the decoded lengths; a received state is mixed or inspected,
    /// never grown.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_wire_parts(
        node: Descriptor,
        predecessors: Vec<Descriptor>,
        successors: Vec<Descriptor>,
        size: u32,
        base: u32,
        routing: RoutingTable,
        neighbors: Vec<Descriptor>,
        statuses: HashMap<Descriptor, Health>,
        version: u64,
    ) -> Self {
        let mut pred_set = DescriptorSet::new(predecessors.len(), true);
        for d in predecessors {
            pred_set.insert(d);
        }
        let mut succ_set = DescriptorSet::new(successors.len(), false);
        for d in successors {
            succ_set.insert(d);
        }
        let mut neighbor_set = DescriptorSet::new(neighbors.len(), false);
        for d in neighbors {
            neighbor_set.insert(d);
        }
        State {
            node,
            predecessors: pred_set,
            successors: succ_set,
            size,
            base,
            routing,
            neighbors: neighbor_set,
            statuses,
            version,
        }
    }

    /// The node this state describes.
    pub fn node(&self) -> &Descriptor {
        &self.node
    }

    /// ID bit width used by the routing table.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Routing base used by the routing table.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// The predecessor leaf set.
    pub fn predecessors(&self) -> &DescriptorSet {
        &self.predecessors
    }

    /// The successor leaf set.
    pub fn successors(&self) -> &DescriptorSet {
        &self.successors
    }

    /// The routing table.
    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    /// The neighborhood set.
    pub fn neighbors(&self) -> &DescriptorSet {
        &self.neighbors
    }

    /// Health records for tracked peers.
    pub fn statuses(&self) -> &HashMap<Descriptor, Health> {
        &self.statuses
    }

    /// The last-modified stamp.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// True if the state has been modified past `version`.
    pub fn is_newer(&self, version: u64) -> bool {
        self.version > version
    }

    /// The health this node believes `d` to be in. Unknown peers count as
    /// Healthy.
    pub fn health_of(&self, d: &Descriptor) -> Health {
        self.statuses.get(d).copied().unwrap_or_default()
    }

    fn touch(&mut self) {
        self.version = now_nanos().max(self.version + 1);
    }

    fn digits_of(&self, id: Id) -> Option<Digits> {
        id.digits(self.size, self.base)
    }

    /// Empties every table and re-seeds the routing diagonal with the local
    /// node, one entry per row.
    pub fn reset(&mut self) {
        let rows = id::digit_count(self.size, self.base);
        self.predecessors = DescriptorSet::new(self.predecessors.size(), true);
        self.successors = DescriptorSet::new(self.successors.size(), false);
        self.routing = RoutingTable::new(self.base as usize, rows);
        self.neighbors = DescriptorSet::new(self.neighbors.size(), false);
        self.statuses = HashMap::new();

        let digits = self
            .digits_of(self.node.id)
            .expect("node id exceeds configured id size");
        for row in 0..rows {
            self.routing
                .set(row, digits.at(row) as usize, Some(self.node.clone()));
        }
        self.touch();
    }

    /// Initializes the state from the hellos observed during a join,
    /// ordered seed first, destination last.
    pub fn calculate(&mut self, hellos: &[Hello]) {
        self.reset();

        for (i, h) in hellos.iter().enumerate() {
            // Neighbors come from the seed, the closest node we know of in
            // network terms.
            if i == 0 {
                self.mixin_neighbors(&h.state);
            }

            // The final node owns the joining id's neighborhood on the
            // ring, so its leaves become ours.
            if i == hellos.len() - 1 {
                self.mixin_leaves(&h.state);
            }

            // Every hop along the join shares at least one usable routing
            // row.
            self.mixin_routes(&h.state);
        }
    }

    /// Mixes routes, neighbors, and leaves from `peer` into this state.
    pub fn mixin_state(&mut self, peer: &State) -> MixinOutcome {
        MixinOutcome {
            routes: self.mixin_routes(peer),
            neighbors: self.mixin_neighbors(peer),
            leaves: self.mixin_leaves(peer),
        }
    }

    /// Takes routes from `peer`. Only the row matching the shared id prefix
    /// carries candidates. No-op when the two tables disagree on size or
    /// base. Entries that either side considers non-Healthy are skipped.
    pub fn mixin_routes(&mut self, peer: &State) -> bool {
        if self.base != peer.base || self.size != peer.size {
            return false;
        }

        let (local, other) = match (
            self.digits_of(self.node.id),
            self.digits_of(peer.node.id),
        ) {
            (Some(a), Some(b)) => (a, b),
            _ => return false,
        };
        let overlap = id::prefix(&local, &other);
        if overlap >= self.routing.rows() {
            // Identical ids share every digit; there is no row to take.
            return false;
        }

        let mut updated = false;
        let candidates: Vec<Descriptor> = peer
            .routing
            .row(overlap)
            .filter(|d| {
                self.health_of(d) == Health::Healthy && peer.health_of(d) == Health::Healthy
            })
            .cloned()
            .collect();
        for d in candidates {
            if self.add_route(d) {
                updated = true;
            }
        }
        updated
    }

    /// Places `d` at its prefix position unless a Healthy entry already
    /// occupies the cell.
    pub(crate) fn add_route(&mut self, d: Descriptor) -> bool {
        if self.node.id == d.id {
            return false;
        }

        let (other, local) = match (self.digits_of(d.id), self.digits_of(self.node.id)) {
            (Some(a), Some(b)) => (a, b),
            _ => return false,
        };

        // Rows share a digit prefix; the column is the first digit that
        // differs.
        let row = id::prefix(&other, &local);
        let col = other.at(row) as usize;

        if let Some(existing) = self.routing.get(row, col) {
            if self.health_of(existing) == Health::Healthy {
                return false;
            }
        }

        self.statuses.entry(d.clone()).or_default();
        self.routing.set(row, col, Some(d));
        self.touch();
        true
    }

    /// Takes `peer` itself and its Healthy neighbors as neighborhood
    /// candidates. Strictly bounded: once the set is full further pushes
    /// fail silently.
    pub fn mixin_neighbors(&mut self, peer: &State) -> bool {
        let mut updated = self.add_neighbor(peer.node.clone());

        let candidates: Vec<Descriptor> = peer
            .neighbors
            .iter()
            .filter(|d| peer.health_of(d) == Health::Healthy && **d != self.node)
            .cloned()
            .collect();
        for d in candidates {
            if self.add_neighbor(d) {
                updated = true;
            }
        }
        updated
    }

    pub(crate) fn add_neighbor(&mut self, d: Descriptor) -> bool {
        if d == self.node || self.health_of(&d) != Health::Healthy {
            return false;
        }
        self.statuses.entry(d.clone()).or_default();
        let updated = self.neighbors.push(d);
        if updated {
            self.touch();
        }
        updated
    }

    /// Takes `peer` itself and its Healthy leaves as leaf candidates for
    /// whichever side of the local node they fall on.
    pub fn mixin_leaves(&mut self, peer: &State) -> bool {
        let mut updated = self.add_leaf(peer.node.clone());

        for l in peer.leaves(false) {
            if l == self.node {
                continue;
            }
            if self.add_leaf(l) {
                updated = true;
            }
        }
        updated
    }

    pub(crate) fn add_leaf(&mut self, d: Descriptor) -> bool {
        if self.health_of(&d) != Health::Healthy {
            return false;
        }

        let updated = match d.id.cmp(&self.node.id) {
            std::cmp::Ordering::Less => {
                self.statuses.entry(d.clone()).or_default();
                self.predecessors.insert(d)
            }
            std::cmp::Ordering::Greater => {
                self.statuses.entry(d.clone()).or_default();
                self.successors.insert(d)
            }
            std::cmp::Ordering::Equal => false,
        };
        if updated {
            self.touch();
        }
        updated
    }

    /// True if `d` sits in either leaf set.
    pub fn is_leaf(&self, d: &Descriptor) -> bool {
        self.predecessors.contains(d) || self.successors.contains(d)
    }

    /// The leaf sets as one list, predecessors first. Non-Healthy leaves
    /// are skipped unless `all`.
    pub fn leaves(&self, all: bool) -> Vec<Descriptor> {
        self.predecessors
            .iter()
            .chain(self.successors.iter())
            .filter(|d| all || self.health_of(d) == Health::Healthy)
            .cloned()
            .collect()
    }

    /// The unique set of peers across every table, self excluded. Order is
    /// not guaranteed. Non-Healthy peers are skipped unless `all`.
    pub fn peers(&self, all: bool) -> Vec<Descriptor> {
        let mut seen: HashSet<&Descriptor> = HashSet::new();
        seen.extend(self.predecessors.iter());
        seen.extend(self.successors.iter());
        seen.extend(self.routing.entries().map(|(_, _, d)| d).filter(|d| **d != self.node));
        seen.extend(self.neighbors.iter());

        seen.into_iter()
            .filter(|d| all || self.health_of(d) == Health::Healthy)
            .cloned()
            .collect()
    }

    /// Replaces leaf `dead` with a leaf from `donor` on the same side of
    /// the local node. `dead` must be present and non-Healthy. A `None`
    /// donor force-removes without replacement. Returns true when the leaf
    /// set changed.
    pub fn replace_leaf(&mut self, dead: &Descriptor, donor: Option<&State>) -> bool {
        let is_predecessor = self.predecessors.contains(dead);
        let is_successor = self.successors.contains(dead);

        if self.health_of(dead) == Health::Healthy || (!is_predecessor && !is_successor) {
            return false;
        }

        self.predecessors.remove(dead);
        self.successors.remove(dead);
        self.touch();

        let donor = match donor {
            Some(donor) => donor,
            None => return true,
        };

        for l in donor.leaves(false) {
            if self.health_of(&l) != Health::Healthy {
                continue;
            }
            // Only replace a predecessor with another predecessor, and a
            // successor with another successor.
            let inserted = if is_predecessor {
                l.id < self.node.id && {
                    self.statuses.entry(l.clone()).or_default();
                    self.predecessors.insert(l)
                }
            } else {
                l.id > self.node.id && {
                    self.statuses.entry(l.clone()).or_default();
                    self.successors.insert(l)
                }
            };
            if inserted {
                break;
            }
        }
        true
    }

    /// The routing slot `d` occupies (prefix row, first differing digit).
    /// `None` for the local node or an id outside the table's bit width.
    pub fn route_index(&self, d: &Descriptor) -> Option<(usize, usize)> {
        if self.node == *d {
            return None;
        }
        let (d_digits, s_digits) = match (self.digits_of(d.id), self.digits_of(self.node.id)) {
            (Some(a), Some(b)) => (a, b),
            _ => return None,
        };
        let row = id::prefix(&s_digits, &d_digits);
        if row >= self.routing.rows() {
            return None;
        }
        Some((row, d_digits.at(row) as usize))
    }

    /// Replaces routing entry `dead` with the donor's entry for the same
    /// cell, provided both sides consider the candidate Healthy. `dead`
    /// must still occupy its slot and be non-Healthy (`ok` is false
    /// otherwise). A `None` donor clears the cell.
    pub fn replace_route(&mut self, dead: &Descriptor, donor: Option<&State>) -> (bool, bool) {
        if let Some(donor) = donor {
            if donor.base != self.base || donor.size != self.size {
                return (false, false);
            }
        }

        let (row, col) = match self.route_index(dead) {
            Some(idx) => idx,
            None => return (false, false),
        };

        if self.health_of(dead) == Health::Healthy || self.routing.get(row, col) != Some(dead) {
            return (false, false);
        }
        self.touch();

        let donor = match donor {
            Some(donor) => donor,
            None => {
                self.routing.set(row, col, None);
                return (false, true);
            }
        };

        match donor.routing.get(row, col) {
            Some(candidate)
                if self.health_of(candidate) == Health::Healthy
                    && donor.health_of(candidate) == Health::Healthy =>
            {
                let candidate = candidate.clone();
                self.statuses.entry(candidate.clone()).or_default();
                self.routing.set(row, col, Some(candidate));
                (true, true)
            }
            _ => (false, true),
        }
    }

    /// Replaces neighbor `dead` with any Healthy neighbor of `donor`.
    /// `dead` must be present and non-Healthy (`ok` is false otherwise). A
    /// `None` donor force-removes.
    pub fn replace_neighbor(&mut self, dead: &Descriptor, donor: Option<&State>) -> (bool, bool) {
        if self.health_of(dead) == Health::Healthy || !self.neighbors.contains(dead) {
            return (false, false);
        }

        self.neighbors.remove(dead);
        self.touch();

        let donor = match donor {
            Some(donor) => donor,
            None => return (false, true),
        };

        let candidates: Vec<Descriptor> = donor
            .neighbors
            .iter()
            .filter(|n| {
                donor.health_of(n) == Health::Healthy && self.health_of(n) == Health::Healthy
            })
            .cloned()
            .collect();
        for n in candidates {
            if self.add_neighbor(n) {
                return (true, true);
            }
        }
        (false, true)
    }

    /// Records the health of `p`. Updating health only affects routing
    /// decisions; repair removes non-Healthy peers separately. Returns true
    /// when the recorded view actually changed.
    pub fn set_health(&mut self, p: Descriptor, h: Health) -> bool {
        let old = self.statuses.insert(p, h);
        let changed = match old {
            None => h != Health::Healthy,
            Some(old) => old != h,
        };
        if changed {
            self.touch();
        }
        changed
    }

    /// Drops the health record for `p`, unless `p` still appears in a
    /// table. An in-use peer keeps its record so a non-Healthy entry is
    /// never silently forgotten while routing can still pick it.
    pub fn untrack(&mut self, p: &Descriptor) -> bool {
        if self.peers(true).contains(p) {
            return false;
        }
        self.statuses.remove(p).is_some()
    }
}

/// A [`State`] behind one mutex, shared between the controller, the request
/// forwarder, and repair tasks. Every method is a short critical section;
/// nothing async happens under the lock.
#[derive(Clone)]
pub struct SharedState {
    inner: Arc<Mutex<State>>,
}

impl SharedState {
    /// Wraps `state` for shared use.
    pub fn new(state: State) -> Self {
        SharedState {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.lock().expect("state mutex poisoned")
    }

    /// The local node's descriptor.
    pub fn node(&self) -> Descriptor {
        self.lock().node.clone()
    }

    /// An independent deep copy of the current state.
    pub fn snapshot(&self) -> State {
        self.lock().clone()
    }

    /// See [`State::is_newer`].
    pub fn is_newer(&self, version: u64) -> bool {
        self.lock().is_newer(version)
    }

    /// See [`State::calculate`].
    pub fn calculate(&self, hellos: &[Hello]) {
        self.lock().calculate(hellos)
    }

    /// See [`State::mixin_state`].
    pub fn mixin_state(&self, peer: &State) -> MixinOutcome {
        self.lock().mixin_state(peer)
    }

    /// See [`State::leaves`].
    pub fn leaves(&self, all: bool) -> Vec<Descriptor> {
        self.lock().leaves(all)
    }

    /// See [`State::peers`].
    pub fn peers(&self, all: bool) -> Vec<Descriptor> {
        self.lock().peers(all)
    }

    /// See [`State::set_health`].
    pub fn set_health(&self, p: Descriptor, h: Health) -> bool {
        self.lock().set_health(p, h)
    }

    /// Marks `p` Unhealthy unless it is already Dead, so tainting after a
    /// failed RPC never resurrects a declared-dead peer part way.
    pub fn taint(&self, p: &Descriptor) -> bool {
        let mut state = self.lock();
        if state.health_of(p) == Health::Dead {
            return false;
        }
        state.set_health(p.clone(), Health::Unhealthy)
    }

    /// See [`State::replace_leaf`].
    pub fn replace_leaf(&self, dead: &Descriptor, donor: Option<&State>) -> bool {
        self.lock().replace_leaf(dead, donor)
    }

    /// See [`State::replace_route`].
    pub fn replace_route(&self, dead: &Descriptor, donor: Option<&State>) -> (bool, bool) {
        self.lock().replace_route(dead, donor)
    }

    /// See [`State::replace_neighbor`].
    pub fn replace_neighbor(&self, dead: &Descriptor, donor: Option<&State>) -> (bool, bool) {
        self.lock().replace_neighbor(dead, donor)
    }

    /// See [`State::untrack`].
    pub fn untrack(&self, p: &Descriptor) -> bool {
        self.lock().untrack(p)
    }
}
