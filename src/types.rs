//! Core decoding records and atomic cost encodings
//!
//! The token-passing engine recombines hypotheses with lock-free atomics.
//! Costs are `f32`, but the hardware primitives are integer min/max, so this
//! module defines an order-preserving `f32 -> u32` bit mapping and the 64-bit
//! recombination pack `(negated cost, arc slot)` that a single `fetch_max`
//! can order primarily by cost.
//!
//! Records are 16- or 32-byte aligned so they can be moved with wide bulk
//! stores when the lattice is exported.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Identifier of a state in the search graph
pub type StateId = u32;

/// Path cost in the log semiring (lower is better)
pub type CostType = f32;

/// Arc-slot value used for tokens that no frame-local arc produced
/// (currently only the utterance-initial token).
pub(crate) const NO_ARC_SLOT: u32 = u32::MAX;

/// Map a cost to a `u32` such that `a < b` iff `map(a) < map(b)`.
///
/// Standard IEEE-754 trick: flip all bits of negative floats, set the sign
/// bit of non-negative ones. Total order holds for everything except NaN.
#[inline]
pub(crate) fn cost_to_ordered(c: CostType) -> u32 {
    let b = c.to_bits();
    if b & 0x8000_0000 != 0 {
        !b
    } else {
        b | 0x8000_0000
    }
}

/// Inverse of [`cost_to_ordered`].
#[inline]
pub(crate) fn ordered_to_cost(o: u32) -> CostType {
    if o & 0x8000_0000 != 0 {
        f32::from_bits(o ^ 0x8000_0000)
    } else {
        f32::from_bits(!o)
    }
}

/// Build a recombination pack from a path cost and a frame-local arc slot.
///
/// The upper 32 bits hold the order-mapped *negated* cost, so an atomic
/// maximum over packs selects the lowest cost. Equal costs tie-break on the
/// low-order bits, i.e. the larger arc slot wins; which arc gets the larger
/// slot depends on push order, so the winner among exact ties is
/// observably non-deterministic across runs.
#[inline]
pub(crate) fn pack_cost_slot(cost: CostType, slot: u32) -> u64 {
    (u64::from(cost_to_ordered(-cost)) << 32) | u64::from(slot)
}

/// Recover the path cost from a recombination pack.
#[inline]
pub(crate) fn unpack_cost(pack: u64) -> CostType {
    -ordered_to_cost((pack >> 32) as u32)
}

/// Recover the frame-local arc slot from a recombination pack.
#[inline]
pub(crate) fn unpack_slot(pack: u64) -> u32 {
    pack as u32
}

/// Encode a `(frame, frame-local index)` token endpoint into one word.
#[inline]
pub(crate) fn pack_tok_pair(frame: i32, idx: u32) -> u64 {
    (u64::from(frame as u32) << 32) | u64::from(idx)
}

/// Frame half of a token endpoint.
#[inline]
pub(crate) fn pair_frame(pair: u64) -> i32 {
    (pair >> 32) as u32 as i32
}

/// Index half of a token endpoint.
#[inline]
pub(crate) fn pair_idx(pair: u64) -> u32 {
    pair as u32
}

/// An `f32` cost cell supporting atomic minimum.
///
/// Stores the order-mapped bits of the cost so `AtomicU32::fetch_min` is a
/// cost minimum. Used for the per-frame beam cutoff and for token extra
/// costs during backward pruning.
#[derive(Debug)]
pub struct AtomicCost(AtomicU32);

impl AtomicCost {
    /// Create a cell holding `v`.
    #[must_use]
    pub fn new(v: CostType) -> Self {
        Self(AtomicU32::new(cost_to_ordered(v)))
    }

    /// Read the current cost.
    #[must_use]
    pub fn load(&self) -> CostType {
        ordered_to_cost(self.0.load(Ordering::Acquire))
    }

    /// Overwrite the current cost.
    pub fn store(&self, v: CostType) {
        self.0.store(cost_to_ordered(v), Ordering::Release);
    }

    /// Atomically lower the cell to `min(current, v)`; returns true if the
    /// cell was lowered.
    pub fn fetch_min(&self, v: CostType) -> bool {
        let prev = self.0.fetch_min(cost_to_ordered(v), Ordering::AcqRel);
        prev > cost_to_ordered(v)
    }
}

impl Default for AtomicCost {
    fn default() -> Self {
        Self::new(f32::INFINITY)
    }
}

impl Clone for AtomicCost {
    fn clone(&self) -> Self {
        Self::new(self.load())
    }
}

/// A decoding hypothesis: the best known path into a graph state at a frame.
///
/// Immutable after its frame closes, except for the extra cost which is
/// monotonically lowered by backward pruning.
#[repr(C, align(16))]
#[derive(Debug, Clone)]
pub struct Token {
    /// Accumulated path cost from the start state
    pub cost: CostType,
    /// Frame at which the token was created
    pub frame: i32,
    extra: AtomicCost,
    /// Graph state this token sits at
    pub state: StateId,
}

impl Token {
    /// Create a token; extra cost starts at +inf until backward pruning
    /// proves an arc through it survives.
    #[must_use]
    pub fn new(cost: CostType, frame: i32, state: StateId) -> Self {
        Self {
            cost,
            frame,
            extra: AtomicCost::default(),
            state,
        }
    }

    /// Current extra cost (best total through this token minus best overall).
    #[must_use]
    pub fn extra_cost(&self) -> CostType {
        self.extra.load()
    }

    /// Overwrite the extra cost.
    pub(crate) fn set_extra_cost(&self, v: CostType) {
        self.extra.store(v);
    }

    /// Atomically lower the extra cost; returns true if it decreased.
    pub(crate) fn lower_extra_cost(&self, v: CostType) -> bool {
        self.extra.fetch_min(v)
    }
}

impl Default for Token {
    fn default() -> Self {
        Self::new(0.0, 0, 0)
    }
}

/// Frame-local representative of a graph state in the survivor set.
///
/// Created by the first worker that activates the state in a frame; after
/// that, all competing arcs into the state race on the atomic pack and only
/// the pack ever changes.
#[repr(C, align(16))]
#[derive(Debug)]
pub struct TokenState {
    /// Graph state represented this frame
    pub state: StateId,
    /// Arena index of the best token reaching the state this frame
    pub tok_idx: u32,
    pack: AtomicU64,
}

impl TokenState {
    /// Create a representative with an empty pack (worse than any candidate).
    #[must_use]
    pub fn new(state: StateId, tok_idx: u32) -> Self {
        Self {
            state,
            tok_idx,
            pack: AtomicU64::new(0),
        }
    }

    /// Read the current recombination pack.
    #[must_use]
    pub fn pack(&self) -> u64 {
        self.pack.load(Ordering::Acquire)
    }

    /// Race a candidate pack against the current best; returns true if the
    /// candidate improved the pack (the caller then owns the winning arc
    /// slot's scratch token).
    pub(crate) fn improve(&self, pack: u64) -> bool {
        self.pack.fetch_max(pack, Ordering::AcqRel) < pack
    }

    /// Best path cost into the state so far this frame.
    #[must_use]
    pub fn best_cost(&self) -> CostType {
        let p = self.pack();
        if p == 0 {
            f32::INFINITY
        } else {
            unpack_cost(p)
        }
    }
}

impl Default for TokenState {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl Clone for TokenState {
    fn clone(&self) -> Self {
        Self {
            state: self.state,
            tok_idx: self.tok_idx,
            pack: AtomicU64::new(self.pack()),
        }
    }
}

/// Append-only lattice arc in its compact on-device form.
///
/// Endpoints are `(frame, frame-local index)` pairs; label and graph weight
/// are recovered from the static graph via `arc_id` when the arc is
/// exploded during backward pruning.
#[repr(C, align(32))]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatLinkCompact {
    prev_pair: u64,
    next_pair: u64,
    /// Pre-scaled acoustic cost of traversing the arc
    pub acoustic_cost: CostType,
    /// Index of the producing arc in the static graph
    pub arc_id: u32,
}

impl LatLinkCompact {
    /// Build a compact arc between two token endpoints.
    #[must_use]
    pub fn new(
        prev_frame: i32,
        prev_idx: u32,
        next_frame: i32,
        next_idx: u32,
        acoustic_cost: CostType,
        arc_id: u32,
    ) -> Self {
        Self {
            prev_pair: pack_tok_pair(prev_frame, prev_idx),
            next_pair: pack_tok_pair(next_frame, next_idx),
            acoustic_cost,
            arc_id,
        }
    }

    /// Frame of the source token.
    #[must_use]
    pub fn prev_frame(&self) -> i32 {
        pair_frame(self.prev_pair)
    }

    /// Frame-local index of the source token.
    #[must_use]
    pub fn prev_idx(&self) -> u32 {
        pair_idx(self.prev_pair)
    }

    /// Frame of the destination token.
    #[must_use]
    pub fn next_frame(&self) -> i32 {
        pair_frame(self.next_pair)
    }

    /// Frame-local index of the destination token.
    #[must_use]
    pub fn next_idx(&self) -> u32 {
        pair_idx(self.next_pair)
    }

    /// Whether the arc consumed an acoustic frame.
    #[must_use]
    pub fn is_emitting(&self) -> bool {
        self.prev_frame() != self.next_frame()
    }
}

/// A lattice arc with the graph-derived fields materialized.
///
/// Produced only during backward pruning; this is the form handed to the
/// host for rescoring.
#[repr(C, align(32))]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatLink {
    prev_pair: u64,
    next_pair: u64,
    /// Input label of the producing graph arc
    pub ilabel: i32,
    /// Output label of the producing graph arc
    pub olabel: i32,
    /// Graph weight (LM and transition costs) of the arc
    pub graph_cost: CostType,
    /// Pre-scaled acoustic cost of the arc
    pub acoustic_cost: CostType,
}

impl LatLink {
    /// Materialize a compact arc with its graph-derived fields.
    #[must_use]
    pub fn new(
        compact: &LatLinkCompact,
        ilabel: i32,
        olabel: i32,
        graph_cost: CostType,
    ) -> Self {
        Self {
            prev_pair: compact.prev_pair,
            next_pair: compact.next_pair,
            ilabel,
            olabel,
            graph_cost,
            acoustic_cost: compact.acoustic_cost,
        }
    }

    /// Frame of the source token.
    #[must_use]
    pub fn prev_frame(&self) -> i32 {
        pair_frame(self.prev_pair)
    }

    /// Frame-local index of the source token.
    #[must_use]
    pub fn prev_idx(&self) -> u32 {
        pair_idx(self.prev_pair)
    }

    /// Frame of the destination token.
    #[must_use]
    pub fn next_frame(&self) -> i32 {
        pair_frame(self.next_pair)
    }

    /// Frame-local index of the destination token.
    #[must_use]
    pub fn next_idx(&self) -> u32 {
        pair_idx(self.next_pair)
    }
}
