//! Per-frame token passing
//!
//! Three phases per non-initial frame, each a dynamically dispatched
//! parallel loop whose join is the phase barrier:
//!
//! 1. **Cutoff search** - walk the previous frame's survivors and their
//!    emitting out-arcs to find the frame's beam cutoff (atomic minimum).
//! 2. **Emit** - re-walk the same arcs; every arc under the cutoff claims
//!    its destination state, appends a compact lattice arc, and races a
//!    `(cost, arc slot)` pack against the destination's best. The racer
//!    that improves the pack writes its candidate token into the arc-slot
//!    scratch; after the barrier a scatter pass copies only the token named
//!    by the final pack into the arena. At most one worker ever writes a
//!    given scratch slot, so no token record is ever written by two racers.
//! 3. **Epsilon closure** - expand non-emitting arcs within the frame until
//!    nothing improves, re-dispatching only survivors whose token changed
//!    in the previous round. Capped at [`MAX_CLOSURE_ITERS`]; hitting the
//!    cap is counted, not an error.

use crate::graph::SearchGraph;
use crate::histogram::HistogramPruner;
use crate::lookup::LookupTable;
use crate::parallel;
use crate::storage::{ArcScratch, ArenaVector, MergeVector, TokenArena};
use crate::types::{
    pack_cost_slot, AtomicCost, CostType, LatLinkCompact, StateId, Token, TokenState, NO_ARC_SLOT,
};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Epsilon-closure and backward-pruning iteration cap.
///
/// Convergence past this point is best-effort; the decoder exposes a
/// diagnostic counter instead of raising an error.
pub const MAX_CLOSURE_ITERS: usize = 10;

/// Diagnostic counters shared by the expansion and pruning passes
#[derive(Debug, Default)]
pub(crate) struct StatsCells {
    pub nan_costs: AtomicU64,
    pub non_converged_closures: AtomicU32,
    pub histogram_engaged: AtomicU32,
    pub source_tokens: AtomicU32,
}

/// Everything a frame's worker loops need, bundled once per frame
///
/// All fields are shared references; the phase functions never take locks,
/// only the atomics inside the referenced structures.
pub(crate) struct ExpandParams<'a> {
    pub graph: &'a SearchGraph,
    pub prev_toks: &'a MergeVector,
    pub cur_toks: &'a MergeVector,
    pub lookup: &'a LookupTable,
    pub arena: &'a TokenArena,
    pub lat_arcs: &'a ArenaVector<LatLinkCompact>,
    pub scratch: &'a ArcScratch,
    pub ne_queue: &'a ArenaVector<u32>,
    pub cutoff: &'a AtomicCost,
    /// Source-token admission mask from histogram pruning, when engaged
    pub admit: Option<&'a [AtomicBool]>,
    /// Dense log-likelihoods for this frame, indexed by input label
    pub scores: &'a [CostType],
    pub beam: CostType,
    pub frame: i32,
    /// Arena watermark at frame start; survivor `i` owns token `base + i`
    pub frame_tok_base: u32,
    /// Lattice-arc count at frame start, for arc-slot normalization
    pub frame_arc_base: u32,
    pub workers: usize,
    pub modified: &'a [AtomicBool; 3],
    pub stats: &'a StatsCells,
}

impl ExpandParams<'_> {
    fn admitted(&self, i: u32) -> bool {
        match self.admit {
            Some(mask) => mask[i as usize].load(Ordering::Acquire),
            None => true,
        }
    }

    fn acoustic(&self, arc_id: u32) -> CostType {
        -self.scores[self.graph.ilabel(arc_id) as usize]
    }
}

/// Histogram-prune the source tokens of an oversubscribed frame.
///
/// Builds the cost histogram over the previous frame's survivors, derives
/// the cutoff that keeps about `max_active` of them, and fills the
/// admission mask. The admission counter enforces the `max_active` target
/// even when ties pile into one bucket; which of the tied tokens are
/// admitted depends on dispatch order.
pub(crate) fn histogram_prune_sources(
    prev_toks: &MergeVector,
    arena: &TokenArena,
    hist: &mut HistogramPruner,
    admit: &[AtomicBool],
    max_active: u32,
    workers: usize,
    stats: &StatsCells,
) {
    let n = prev_toks.size();

    let best = AtomicCost::new(f32::INFINITY);
    parallel::dispatch_limited(workers, n, |i| {
        best.fetch_min(arena.token(prev_toks.get(i).tok_idx).cost);
    });
    hist.reset(best.load());

    let hist_ref: &HistogramPruner = hist;
    parallel::dispatch_limited(workers, n, |i| {
        hist_ref.add(arena.token(prev_toks.get(i).tok_idx).cost);
    });
    let cutoff_prev = hist_ref.cutoff(max_active);

    let admitted = AtomicU32::new(0);
    parallel::dispatch_limited(workers, n, |i| {
        let cost = arena.token(prev_toks.get(i).tok_idx).cost;
        let ok = cost <= cutoff_prev && admitted.fetch_add(1, Ordering::Relaxed) < max_active;
        admit[i as usize].store(ok, Ordering::Release);
    });

    stats.histogram_engaged.fetch_add(1, Ordering::Relaxed);
    stats
        .source_tokens
        .store(admitted.load(Ordering::Relaxed).min(max_active), Ordering::Relaxed);
}

/// Phase 1: derive the emit cutoff for this frame.
pub(crate) fn find_best_cutoff(p: &ExpandParams) {
    p.cutoff.store(f32::INFINITY);
    parallel::dispatch_limited(p.workers, p.prev_toks.size(), |i| {
        if !p.admitted(i) {
            return;
        }
        let ts = p.prev_toks.get(i);
        let tok_cost = p.arena.token(ts.tok_idx).cost;
        let mut local_best = f32::INFINITY;
        for arc in p.graph.emitting_arcs(ts.state) {
            let total = tok_cost + p.graph.weight(arc) + p.acoustic(arc) + p.beam;
            if total.is_nan() {
                p.stats.nan_costs.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            local_best = local_best.min(total);
        }
        if local_best < f32::INFINITY {
            p.cutoff.fetch_min(local_best);
        }
    });
}

/// Phase 2: expand emitting arcs under the cutoff into the current frame.
pub(crate) fn expand_emitting(p: &ExpandParams) {
    let cutoff = p.cutoff.load();
    parallel::dispatch_limited(p.workers, p.prev_toks.size(), |i| {
        if !p.admitted(i) {
            return;
        }
        let ts = p.prev_toks.get(i);
        let tok_cost = p.arena.token(ts.tok_idx).cost;
        for arc in p.graph.emitting_arcs(ts.state) {
            let ac = p.acoustic(arc);
            let total = tok_cost + p.graph.weight(arc) + ac;
            if total.is_nan() {
                p.stats.nan_costs.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if total > cutoff {
                continue;
            }
            pass_token(p, arc, total, ac, p.frame - 1, i);
        }
    });
    p.cur_toks.scatter_by_pack(p.scratch, p.arena, p.workers);
}

/// Phase 3: expand non-emitting arcs to quiescence within the frame.
///
/// Returns the number of rounds run. Uses a rotating set of modified flags
/// so a round never has to wait for the previous round's flag to be
/// cleared before publishing its own.
pub(crate) fn nonemitting_closure(p: &ExpandParams) -> usize {
    let cutoff = p.cutoff.load();
    for flag in p.modified.iter() {
        flag.store(false, Ordering::Relaxed);
    }

    let mut rounds = 0usize;
    loop {
        let this_round = &p.modified[rounds % 3];
        p.modified[(rounds + 1) % 3].store(false, Ordering::Relaxed);

        let count = if rounds == 0 {
            p.cur_toks.size()
        } else {
            // Aggregation: only survivors whose token improved last round
            // can seed further improvements.
            p.ne_queue.clear();
            parallel::dispatch_limited(p.workers, p.cur_toks.size(), |i| {
                if p.cur_toks.is_updated(i) {
                    let _ = p.ne_queue.push(i);
                }
            });
            p.ne_queue.size()
        };
        if rounds > 0 && count == 0 {
            break;
        }

        parallel::dispatch_limited(p.workers, count, |qi| {
            let i = if rounds == 0 { qi } else { *p.ne_queue.get(qi) };
            let ts = p.cur_toks.get(i);
            let cost = ts.best_cost();
            for arc in p.graph.nonemitting_arcs(ts.state) {
                let total = cost + p.graph.weight(arc);
                if total.is_nan() {
                    p.stats.nan_costs.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                if total > cutoff {
                    continue;
                }
                if pass_token(p, arc, total, 0.0, p.frame, i) {
                    this_round.store(true, Ordering::Release);
                }
            }
        });

        p.cur_toks.scatter_by_pack(p.scratch, p.arena, p.workers);
        rounds += 1;

        if !this_round.load(Ordering::Acquire) {
            break;
        }
        if rounds >= MAX_CLOSURE_ITERS {
            p.stats.non_converged_closures.fetch_add(1, Ordering::Relaxed);
            break;
        }
    }
    rounds
}

/// Seed the utterance with the start state at cost zero.
///
/// The initial token is written to the arena directly; its pack names a
/// slot outside the scratch so the scatter pass never rebinds it.
pub(crate) fn add_initial_token(p: &ExpandParams, start_state: StateId) {
    let idx = p.lookup.claim_or_get(start_state, || {
        p.cur_toks
            .push_with(|i| TokenState::new(start_state, p.frame_tok_base + i))
    });
    if let Some(i) = idx {
        let ts = p.cur_toks.get(i);
        ts.improve(pack_cost_slot(0.0, NO_ARC_SLOT));
        p.arena.write(ts.tok_idx, Token::new(0.0, 0, start_state));
    }
}

/// Route one arc's candidate into its destination state.
///
/// First pass of 2-pass recombination: claim-or-find the destination's
/// token-state, append the compact lattice arc, and atomic-max the
/// candidate pack. Returns true when the candidate improved the
/// destination (the caller may need to schedule another closure round).
fn pass_token(
    p: &ExpandParams,
    arc_id: u32,
    total: CostType,
    acoustic: CostType,
    prev_frame: i32,
    prev_idx: u32,
) -> bool {
    let next_state = p.graph.nextstate(arc_id);
    let Some(cur_idx) = p.lookup.claim_or_get(next_state, || {
        p.cur_toks
            .push_with(|i| TokenState::new(next_state, p.frame_tok_base + i))
    }) else {
        return false;
    };

    let compact = LatLinkCompact::new(prev_frame, prev_idx, p.frame, cur_idx, acoustic, arc_id);
    let Some(arc_slot) = p.lat_arcs.push(compact) else {
        return false;
    };
    let local = arc_slot - p.frame_arc_base;
    if local >= p.scratch.capacity() {
        p.scratch.mark_overflow();
        return false;
    }

    let ts = p.cur_toks.get(cur_idx);
    if ts.improve(pack_cost_slot(total, local)) {
        p.scratch.write(local, Token::new(total, p.frame, next_state));
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::SearchGraphBuilder;

    struct Fixture {
        graph: SearchGraph,
        toks: [MergeVector; 2],
        lookup: LookupTable,
        arena: TokenArena,
        lat_arcs: ArenaVector<LatLinkCompact>,
        scratch: ArcScratch,
        ne_queue: ArenaVector<u32>,
        cutoff: AtomicCost,
        modified: [AtomicBool; 3],
        stats: StatsCells,
        scores: Vec<CostType>,
    }

    impl Fixture {
        fn new(graph: SearchGraph) -> Self {
            let scores = vec![0.0; (graph.max_ilabel() + 1) as usize];
            Self {
                lookup: LookupTable::new(graph.num_states()),
                graph,
                toks: [MergeVector::new(64), MergeVector::new(64)],
                arena: TokenArena::new(256),
                lat_arcs: ArenaVector::new(256),
                scratch: ArcScratch::new(64),
                ne_queue: ArenaVector::new(64),
                cutoff: AtomicCost::new(f32::INFINITY),
                modified: Default::default(),
                stats: StatsCells::default(),
                scores,
            }
        }

        /// Buffer rotation as the driver does it: frame f writes buffer
        /// `f % 2` and reads `(f - 1) % 2`.
        fn params(&self, frame: i32, beam: CostType) -> ExpandParams<'_> {
            let cur = (frame % 2) as usize;
            ExpandParams {
                graph: &self.graph,
                prev_toks: &self.toks[cur ^ 1],
                cur_toks: &self.toks[cur],
                lookup: &self.lookup,
                arena: &self.arena,
                lat_arcs: &self.lat_arcs,
                scratch: &self.scratch,
                ne_queue: &self.ne_queue,
                cutoff: &self.cutoff,
                admit: None,
                scores: &self.scores,
                beam,
                frame,
                frame_tok_base: self.arena.used(),
                frame_arc_base: self.lat_arcs.size(),
                workers: 1,
                modified: &self.modified,
                stats: &self.stats,
            }
        }
    }

    fn two_path_graph() -> SearchGraph {
        // 0 --eps/0.0--> 1; 0 --1/0.3--> 2; 1 --1/0.1--> 2
        let mut b = SearchGraphBuilder::new(3, 0);
        b.arc(0, 1, 0, 0, 0.0);
        b.arc(0, 2, 1, 1, 0.3);
        b.arc(1, 2, 1, 2, 0.1);
        b.build().expect("graph")
    }

    #[test]
    fn test_initial_token_and_closure() {
        let fx = Fixture::new(two_path_graph());
        let p = fx.params(0, 2.0);
        add_initial_token(&p, 0);
        let rounds = nonemitting_closure(&p);

        // Start state plus the epsilon successor.
        assert_eq!(fx.toks[0].size(), 2);
        assert!(rounds >= 1);
        let s1 = fx.toks[0].get(1);
        assert_eq!(s1.state, 1);
        assert!((s1.best_cost() - 0.0).abs() < 1e-6);
        // The closure recorded the epsilon arc.
        assert_eq!(fx.lat_arcs.size(), 1);
        assert!(!fx.lat_arcs.get(0).is_emitting());
    }

    #[test]
    fn test_emit_recombines_to_single_state() {
        let fx = Fixture::new(two_path_graph());
        {
            let p0 = fx.params(0, 2.0);
            add_initial_token(&p0, 0);
            nonemitting_closure(&p0);
            fx.arena.advance(fx.toks[0].size());
        }
        fx.scratch.reset_overflow();
        fx.lookup.reset_frame(&fx.toks[0]);

        let p1 = fx.params(1, 2.0);
        find_best_cutoff(&p1);
        assert!((p1.cutoff.load() - 2.1).abs() < 1e-5);

        expand_emitting(&p1);
        nonemitting_closure(&p1);

        // Both arcs into state 2 recombined into one token-state with the
        // cheaper cost.
        let cur = &fx.toks[1];
        assert_eq!(cur.size(), 1);
        let ts = cur.get(0);
        assert_eq!(ts.state, 2);
        assert!((ts.best_cost() - 0.1).abs() < 1e-6);
        let tok = fx.arena.token(ts.tok_idx);
        assert!((tok.cost - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_histogram_admission_caps_sources() {
        let mut b = SearchGraphBuilder::new(1, 0);
        b.arc(0, 0, 1, 0, 0.0);
        let graph = b.build().expect("graph");
        let fx = Fixture::new(graph);

        // 40 equally costed survivors.
        for k in 0..40u32 {
            fx.arena.write(k, Token::new(1.0, 0, 0));
            fx.toks[0].push_with(|i| TokenState::new(0, i));
        }
        fx.arena.advance(40);

        let mut hist = HistogramPruner::new(2.0);
        let admit: Vec<AtomicBool> = (0..64).map(|_| AtomicBool::new(false)).collect();
        let stats = StatsCells::default();
        histogram_prune_sources(&fx.toks[0], &fx.arena, &mut hist, &admit, 10, 1, &stats);

        let admitted = admit
            .iter()
            .take(40)
            .filter(|b| b.load(Ordering::Acquire))
            .count();
        assert_eq!(admitted, 10);
        assert_eq!(stats.source_tokens.load(Ordering::Relaxed), 10);
        assert_eq!(stats.histogram_engaged.load(Ordering::Relaxed), 1);
    }
}
