//! Lattice collection, backward extra-cost propagation, and export
//!
//! During decoding this module only records per-frame start indices: token
//! and arc records themselves are append-only in their arenas and never
//! move, so an arc can name its endpoints as `(frame, local index)` pairs
//! for the whole utterance.
//!
//! Pruning runs backward over the frames. Each token's *extra cost* - how
//! far the best path through it falls short of the best overall path - is
//! propagated from the newest frame toward frame 0 by relaxing every arc of
//! a frame until a fixpoint; an arc whose own extra cost stays within
//! `lattice_beam` is exploded (graph fields materialized) into the output
//! arena. Only arcs are discarded: nodes are implicitly pruned downstream
//! by the absence of surviving arcs.

use crate::error::{DecodeError, DecodeResult};
use crate::expand::MAX_CLOSURE_ITERS;
use crate::graph::SearchGraph;
use crate::parallel;
use crate::storage::{ArenaVector, MergeVector, TokenArena};
use crate::types::{AtomicCost, CostType, LatLink, LatLinkCompact, StateId, Token};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Expected fraction of recorded arcs that survive lattice pruning; sizes
/// the output arena relative to `max_arcs`.
pub const ESTIMATED_PRUNE_RATIO: f64 = 0.25;

/// A survivor of the last decoded frame, for final-cost computation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FinalToken {
    /// Graph state of the survivor
    pub state: StateId,
    /// Accumulated path cost of the survivor
    pub cost: CostType,
}

/// Host-visible pruned lattice
///
/// Tokens are laid out frame-major: frame `f` owns
/// `tokens[token_frame_start[f]..token_frame_start[f + 1]]`. Arcs appear in
/// pruning order (frames descending within each pruning pass); use
/// `arc_frame_size` to regroup them by frame.
#[derive(Debug, Clone)]
pub struct LatticeView {
    /// All surviving tokens, frame-major
    pub tokens: Vec<Token>,
    /// Per-frame start indices into `tokens`; one boundary past the frames
    pub token_frame_start: Vec<u32>,
    /// Pruned arcs with graph fields materialized
    pub arcs: Vec<LatLink>,
    /// Number of surviving arcs per frame
    pub arc_frame_size: Vec<u32>,
    /// Survivors of the last frame, for final-cost scoring
    pub last_frame_tokens: Vec<FinalToken>,
}

impl LatticeView {
    /// Number of acoustic frames decoded (the initial frame is frame 0).
    #[must_use]
    pub fn num_frames(&self) -> usize {
        self.token_frame_start.len().saturating_sub(2)
    }

    /// Borrow the token at a `(frame, local index)` endpoint.
    #[must_use]
    pub fn token(&self, frame: i32, local_idx: u32) -> &Token {
        let base = self.token_frame_start[frame as usize];
        &self.tokens[(base + local_idx) as usize]
    }

    /// Tokens of one frame.
    #[must_use]
    pub fn frame_tokens(&self, frame: usize) -> &[Token] {
        let lo = self.token_frame_start[frame] as usize;
        let hi = self.token_frame_start[frame + 1] as usize;
        &self.tokens[lo..hi]
    }

    /// Walk the single best path backward from the best last-frame token.
    ///
    /// Final costs from `graph` are applied when any last-frame token sits
    /// in a final state; otherwise the plain best cost wins, mirroring the
    /// usual best-path fallback when an utterance is cut off mid-word.
    /// Returns the path arcs in forward order.
    #[must_use]
    pub fn best_path(&self, graph: &SearchGraph) -> Vec<LatLink> {
        let boundaries = self.token_frame_start.len();
        if boundaries < 2 {
            return Vec::new();
        }
        let last = boundaries - 2;
        let lo = self.token_frame_start[last];
        let hi = self.token_frame_start[last + 1];
        if lo == hi {
            return Vec::new();
        }

        let mut best_local = 0u32;
        let mut best_total = f32::INFINITY;
        for i in lo..hi {
            let tok = &self.tokens[i as usize];
            let total = tok.cost + graph.final_cost(tok.state);
            if total < best_total {
                best_total = total;
                best_local = i - lo;
            }
        }
        if best_total.is_infinite() {
            // No final state reached; take the cheapest token instead.
            for i in lo..hi {
                let tok = &self.tokens[i as usize];
                if tok.cost < best_total {
                    best_total = tok.cost;
                    best_local = i - lo;
                }
            }
        }

        let mut incoming: HashMap<(i32, u32), Vec<usize>> = HashMap::new();
        for (a, arc) in self.arcs.iter().enumerate() {
            incoming
                .entry((arc.next_frame(), arc.next_idx()))
                .or_default()
                .push(a);
        }

        let mut path = Vec::new();
        let mut frame = last as i32;
        let mut local = best_local;
        // Bounded walk; the lattice is a DAG but a malformed input must not
        // spin forever.
        for _ in 0..self.arcs.len() + boundaries {
            let Some(cands) = incoming.get(&(frame, local)) else {
                break;
            };
            let cur_cost = self.token(frame, local).cost;
            let mut chosen: Option<(usize, f32)> = None;
            for &a in cands {
                let arc = &self.arcs[a];
                let prev = self.token(arc.prev_frame(), arc.prev_idx());
                let gap = (prev.cost + arc.acoustic_cost + arc.graph_cost - cur_cost).abs();
                if chosen.map_or(true, |(_, g)| gap < g) {
                    chosen = Some((a, gap));
                }
            }
            let Some((a, _)) = chosen else {
                break;
            };
            let arc = self.arcs[a];
            path.push(arc);
            frame = arc.prev_frame();
            local = arc.prev_idx();
        }
        path.reverse();
        path
    }
}

/// Records per-frame indices during decoding and produces the pruned
/// lattice at (or periodically before) utterance end
#[derive(Debug)]
pub(crate) struct LatticeProcessor {
    /// Cumulative token counts; `toks_fr_sidx[f]` starts frame `f`
    toks_fr_sidx: Vec<u32>,
    /// Cumulative arc counts per frame
    arcs_fr_sidx: Vec<u32>,
    out_arcs: ArenaVector<LatLink>,
    out_fr_size: Vec<u32>,
    collected: Vec<bool>,
    lattice_beam: CostType,
    modified: [AtomicBool; 3],
}

impl LatticeProcessor {
    pub(crate) fn new(max_arcs: u32, lattice_beam: CostType) -> Self {
        let out_cap = ((f64::from(max_arcs) * ESTIMATED_PRUNE_RATIO) as u32).max(1);
        Self {
            toks_fr_sidx: vec![0],
            arcs_fr_sidx: vec![0],
            out_arcs: ArenaVector::new(out_cap),
            out_fr_size: Vec::new(),
            collected: Vec::new(),
            lattice_beam,
            modified: Default::default(),
        }
    }

    pub(crate) fn clear(&mut self) {
        self.toks_fr_sidx.clear();
        self.toks_fr_sidx.push(0);
        self.arcs_fr_sidx.clear();
        self.arcs_fr_sidx.push(0);
        self.out_arcs.clear();
        self.out_fr_size.clear();
        self.collected.clear();
    }

    /// Record a closed frame's cumulative token and arc counts.
    pub(crate) fn collect_frame(&mut self, tok_total: u32, arc_total: u32) {
        self.toks_fr_sidx.push(tok_total);
        self.arcs_fr_sidx.push(arc_total);
        self.out_fr_size.push(0);
        self.collected.push(false);
    }

    /// Frames recorded so far (frame 0 included).
    pub(crate) fn num_frames(&self) -> usize {
        self.collected.len()
    }

    /// Capacity of the after-pruning output arena.
    pub(crate) fn output_capacity(&self) -> u32 {
        self.out_arcs.capacity()
    }

    /// Backward extra-cost propagation plus arc collection.
    ///
    /// Propagates extra costs from the newest frame down to frame 0 and
    /// explodes surviving arcs of every not-yet-collected frame up to
    /// `collect_upto` into the output arena. Extra costs are recomputed
    /// from scratch on every call, so a repeated call collects exactly the
    /// same arcs for the frames it still owns.
    pub(crate) fn prune(
        &mut self,
        arena: &TokenArena,
        lat_arcs: &ArenaVector<LatLinkCompact>,
        graph: &SearchGraph,
        collect_upto: usize,
        workers: usize,
        err_frame: i32,
    ) -> DecodeResult<()> {
        let frames = self.collected.len();
        if frames == 0 {
            return Ok(());
        }
        let top = frames - 1;

        let toks_sidx = &self.toks_fr_sidx;
        let arcs_sidx = &self.arcs_fr_sidx;
        let out_arcs = &self.out_arcs;
        let modified = &self.modified;
        let lattice_beam = self.lattice_beam;

        let frame_tokens = |f: usize| toks_sidx[f]..toks_sidx[f + 1];
        let link_extra = |arc: &LatLinkCompact| -> CostType {
            let next = arena.token(toks_sidx[arc.next_frame() as usize] + arc.next_idx());
            let prev = arena.token(toks_sidx[arc.prev_frame() as usize] + arc.prev_idx());
            next.extra_cost()
                + (prev.cost + arc.acoustic_cost + graph.weight(arc.arc_id) - next.cost)
        };

        // Seed the newest frame: extra cost relative to the frame's best.
        {
            let range = frame_tokens(top);
            let n = range.end - range.start;
            let base = range.start;
            let best = AtomicCost::new(f32::INFINITY);
            parallel::dispatch_limited(workers, n, |i| {
                best.fetch_min(arena.token(base + i).cost);
            });
            let best = best.load();
            parallel::dispatch_limited(workers, n, |i| {
                let tok = arena.token(base + i);
                tok.set_extra_cost(tok.cost - best);
            });
        }

        for t in (0..=top).rev() {
            // Tokens of the preceding frame start unreachable; only an arc
            // within the lattice beam may save them.
            if t > 0 {
                let range = frame_tokens(t - 1);
                let n = range.end - range.start;
                let base = range.start;
                parallel::dispatch_limited(workers, n, |i| {
                    arena.token(base + i).set_extra_cost(f32::INFINITY);
                });
            }

            let arc_lo = arcs_sidx[t];
            let arc_hi = arcs_sidx[t + 1];
            let n_arcs = arc_hi - arc_lo;

            // Relax this frame's arcs to a fixpoint; epsilon chains within
            // the frame need the repetition.
            let mut rounds = 0usize;
            loop {
                let this_round = &modified[rounds % 3];
                this_round.store(false, Ordering::Relaxed);
                modified[(rounds + 1) % 3].store(false, Ordering::Relaxed);

                parallel::dispatch_limited(workers, n_arcs, |i| {
                    let arc = lat_arcs.get(arc_lo + i);
                    let extra = link_extra(arc);
                    if extra.is_finite() && extra <= lattice_beam {
                        let prev =
                            arena.token(toks_sidx[arc.prev_frame() as usize] + arc.prev_idx());
                        if prev.lower_extra_cost(extra) {
                            this_round.store(true, Ordering::Release);
                        }
                    }
                });

                rounds += 1;
                if !this_round.load(Ordering::Acquire) || rounds >= MAX_CLOSURE_ITERS {
                    break;
                }
            }

            if t <= collect_upto && !self.collected[t] {
                let survivors = AtomicU32::new(0);
                parallel::dispatch_limited(workers, n_arcs, |i| {
                    let arc = lat_arcs.get(arc_lo + i);
                    let extra = link_extra(arc);
                    if extra.is_finite() && extra <= lattice_beam {
                        debug_assert!(extra >= -1e-3, "negative link extra cost {extra}");
                        let exploded = LatLink::new(
                            arc,
                            graph.ilabel(arc.arc_id),
                            graph.olabel(arc.arc_id),
                            graph.weight(arc.arc_id),
                        );
                        if out_arcs.push(exploded).is_some() {
                            survivors.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
                if out_arcs.overflowed() {
                    return Err(DecodeError::CapacityExceeded {
                        what: "pruned lattice output (raise max_arcs or lattice capacity)",
                        capacity: out_arcs.capacity(),
                        frame: err_frame,
                    });
                }
                self.out_fr_size[t] = survivors.load(Ordering::Relaxed);
                self.collected[t] = true;
            }
        }
        Ok(())
    }

    /// Snapshot the pruned lattice for the host.
    pub(crate) fn export(&self, arena: &TokenArena, last: &MergeVector) -> LatticeView {
        let total_toks = self.toks_fr_sidx.last().copied().unwrap_or(0);
        let last_frame_tokens = (0..last.size())
            .map(|i| {
                let ts = last.get(i);
                FinalToken {
                    state: ts.state,
                    cost: arena.token(ts.tok_idx).cost,
                }
            })
            .collect();
        LatticeView {
            tokens: arena.snapshot(total_toks),
            token_frame_start: self.toks_fr_sidx.clone(),
            arcs: self.out_arcs.snapshot(),
            arc_frame_size: self.out_fr_size.clone(),
            last_frame_tokens,
        }
    }
}
