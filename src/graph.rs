//! Static search graph in CSR form
//!
//! The decoder consumes the WFST as two CSR partitions over one arc table:
//! for state `s`, emitting arcs live in `e_offsets[s]..e_offsets[s+1]` and
//! non-emitting (epsilon-input) arcs in `ne_offsets[s]..ne_offsets[s+1]`.
//! All emitting arcs precede all non-emitting arcs in the parallel arrays,
//! so an arc id is stable and can be used by the lattice to recover labels
//! and graph weight after decoding.
//!
//! Loading a real HCLG graph from disk is out of scope here; use
//! [`SearchGraphBuilder`] to assemble the tables.

use crate::error::{DecodeError, DecodeResult};
use crate::types::{CostType, StateId};
use std::ops::Range;

/// Immutable CSR view of the search graph
#[derive(Debug, Clone)]
pub struct SearchGraph {
    num_states: u32,
    start: StateId,
    e_offsets: Vec<u32>,
    ne_offsets: Vec<u32>,
    ilabels: Vec<i32>,
    olabels: Vec<i32>,
    weights: Vec<CostType>,
    nextstates: Vec<StateId>,
    final_costs: Vec<CostType>,
    max_ilabel: i32,
}

impl SearchGraph {
    /// Number of states.
    #[must_use]
    pub fn num_states(&self) -> u32 {
        self.num_states
    }

    /// Total number of arcs (emitting + non-emitting).
    #[must_use]
    pub fn num_arcs(&self) -> u32 {
        self.ilabels.len() as u32
    }

    /// The start state.
    #[must_use]
    pub fn start_state(&self) -> StateId {
        self.start
    }

    /// Largest input label on any arc.
    #[must_use]
    pub fn max_ilabel(&self) -> i32 {
        self.max_ilabel
    }

    /// Arc-id range of the emitting arcs leaving `state`.
    #[must_use]
    pub fn emitting_arcs(&self, state: StateId) -> Range<u32> {
        let s = state as usize;
        self.e_offsets[s]..self.e_offsets[s + 1]
    }

    /// Arc-id range of the non-emitting arcs leaving `state`.
    #[must_use]
    pub fn nonemitting_arcs(&self, state: StateId) -> Range<u32> {
        let s = state as usize;
        self.ne_offsets[s]..self.ne_offsets[s + 1]
    }

    /// Input label of arc `arc_id`.
    #[must_use]
    pub fn ilabel(&self, arc_id: u32) -> i32 {
        self.ilabels[arc_id as usize]
    }

    /// Output label of arc `arc_id`.
    #[must_use]
    pub fn olabel(&self, arc_id: u32) -> i32 {
        self.olabels[arc_id as usize]
    }

    /// Graph weight of arc `arc_id`.
    #[must_use]
    pub fn weight(&self, arc_id: u32) -> CostType {
        self.weights[arc_id as usize]
    }

    /// Destination state of arc `arc_id`.
    #[must_use]
    pub fn nextstate(&self, arc_id: u32) -> StateId {
        self.nextstates[arc_id as usize]
    }

    /// Final cost of `state`; +inf if the state is not final.
    #[must_use]
    pub fn final_cost(&self, state: StateId) -> CostType {
        self.final_costs[state as usize]
    }
}

/// Arc description fed to the builder
#[derive(Debug, Clone, Copy)]
struct BuildArc {
    from: StateId,
    ilabel: i32,
    olabel: i32,
    weight: CostType,
    to: StateId,
}

/// Assembles a [`SearchGraph`] from individual arcs
///
/// Arcs with input label 0 are non-emitting (epsilon); everything else is
/// emitting. The builder reorders arcs into the emitting/non-emitting CSR
/// split the decoder expects.
#[derive(Debug)]
pub struct SearchGraphBuilder {
    num_states: u32,
    start: StateId,
    arcs: Vec<BuildArc>,
    final_costs: Vec<CostType>,
}

impl SearchGraphBuilder {
    /// Start building a graph with `num_states` states and the given start.
    #[must_use]
    pub fn new(num_states: u32, start: StateId) -> Self {
        Self {
            num_states,
            start,
            arcs: Vec::new(),
            final_costs: vec![f32::INFINITY; num_states as usize],
        }
    }

    /// Add an arc. Input label 0 marks a non-emitting arc.
    pub fn arc(
        &mut self,
        from: StateId,
        to: StateId,
        ilabel: i32,
        olabel: i32,
        weight: CostType,
    ) -> &mut Self {
        self.arcs.push(BuildArc {
            from,
            ilabel,
            olabel,
            weight,
            to,
        });
        self
    }

    /// Mark `state` final with the given final cost.
    pub fn final_state(&mut self, state: StateId, cost: CostType) -> &mut Self {
        self.final_costs[state as usize] = cost;
        self
    }

    /// Build the CSR tables.
    pub fn build(self) -> DecodeResult<SearchGraph> {
        let n = self.num_states as usize;
        if self.num_states == 0 {
            return Err(DecodeError::Graph("graph has no states".into()));
        }
        if self.start >= self.num_states {
            return Err(DecodeError::Graph(format!(
                "start state {} out of range (num_states {})",
                self.start, self.num_states
            )));
        }
        for a in &self.arcs {
            if a.from >= self.num_states || a.to >= self.num_states {
                return Err(DecodeError::Graph(format!(
                    "arc {}->{} references a state out of range",
                    a.from, a.to
                )));
            }
            if a.ilabel < 0 {
                return Err(DecodeError::Graph(format!(
                    "negative input label {} on arc {}->{}",
                    a.ilabel, a.from, a.to
                )));
            }
        }

        // Count per-state arcs for the two partitions.
        let mut e_counts = vec![0u32; n];
        let mut ne_counts = vec![0u32; n];
        for a in &self.arcs {
            if a.ilabel != 0 {
                e_counts[a.from as usize] += 1;
            } else {
                ne_counts[a.from as usize] += 1;
            }
        }

        // Prefix sums; the non-emitting block starts after every emitting arc.
        let mut e_offsets = vec![0u32; n + 1];
        for s in 0..n {
            e_offsets[s + 1] = e_offsets[s] + e_counts[s];
        }
        let e_total = e_offsets[n];
        let mut ne_offsets = vec![0u32; n + 1];
        ne_offsets[0] = e_total;
        for s in 0..n {
            ne_offsets[s + 1] = ne_offsets[s] + ne_counts[s];
        }
        let total = ne_offsets[n] as usize;

        let mut ilabels = vec![0i32; total];
        let mut olabels = vec![0i32; total];
        let mut weights = vec![0.0f32; total];
        let mut nextstates = vec![0u32; total];

        let mut e_fill = e_offsets.clone();
        let mut ne_fill = ne_offsets.clone();
        let mut max_ilabel = 0i32;
        for a in &self.arcs {
            let slot = if a.ilabel != 0 {
                let s = e_fill[a.from as usize];
                e_fill[a.from as usize] += 1;
                s as usize
            } else {
                let s = ne_fill[a.from as usize];
                ne_fill[a.from as usize] += 1;
                s as usize
            };
            ilabels[slot] = a.ilabel;
            olabels[slot] = a.olabel;
            weights[slot] = a.weight;
            nextstates[slot] = a.to;
            max_ilabel = max_ilabel.max(a.ilabel);
        }

        Ok(SearchGraph {
            num_states: self.num_states,
            start: self.start,
            e_offsets,
            ne_offsets,
            ilabels,
            olabels,
            weights,
            nextstates,
            final_costs: self.final_costs,
            max_ilabel,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> SearchGraph {
        let mut b = SearchGraphBuilder::new(4, 0);
        b.arc(0, 1, 0, 0, 0.5);
        b.arc(0, 2, 1, 10, 0.3);
        b.arc(1, 2, 2, 20, 0.1);
        b.arc(2, 3, 1, 30, 0.0);
        b.final_state(3, 0.0);
        b.build().expect("valid graph")
    }

    #[test]
    fn test_csr_partition() {
        let g = diamond();
        assert_eq!(g.num_states(), 4);
        assert_eq!(g.num_arcs(), 4);
        assert_eq!(g.start_state(), 0);
        assert_eq!(g.max_ilabel(), 2);

        // State 0 has one emitting and one non-emitting arc.
        let e0: Vec<u32> = g.emitting_arcs(0).collect();
        assert_eq!(e0.len(), 1);
        assert_eq!(g.ilabel(e0[0]), 1);
        assert_eq!(g.nextstate(e0[0]), 2);

        let ne0: Vec<u32> = g.nonemitting_arcs(0).collect();
        assert_eq!(ne0.len(), 1);
        assert_eq!(g.ilabel(ne0[0]), 0);
        assert_eq!(g.nextstate(ne0[0]), 1);

        // Non-emitting block lives after all emitting arcs.
        assert!(ne0[0] >= 3);
    }

    #[test]
    fn test_final_costs() {
        let g = diamond();
        assert!(g.final_cost(0).is_infinite());
        assert!((g.final_cost(3) - 0.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_build_rejects_bad_start() {
        let b = SearchGraphBuilder::new(2, 5);
        assert!(matches!(b.build(), Err(DecodeError::Graph(_))));
    }

    #[test]
    fn test_build_rejects_out_of_range_arc() {
        let mut b = SearchGraphBuilder::new(2, 0);
        b.arc(0, 7, 1, 1, 0.0);
        assert!(matches!(b.build(), Err(DecodeError::Graph(_))));
    }

    #[test]
    fn test_build_rejects_negative_ilabel() {
        let mut b = SearchGraphBuilder::new(2, 0);
        b.arc(0, 1, -3, 0, 0.0);
        assert!(matches!(b.build(), Err(DecodeError::Graph(_))));
    }

    #[test]
    fn test_states_without_arcs() {
        let mut b = SearchGraphBuilder::new(3, 0);
        b.arc(0, 1, 1, 1, 0.0);
        let g = b.build().expect("valid graph");
        assert!(g.emitting_arcs(2).is_empty());
        assert!(g.nonemitting_arcs(2).is_empty());
    }
}
