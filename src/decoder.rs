//! The decoding driver
//!
//! Owns every pool and counter, runs the frame clock, and exposes the
//! public decoding contract:
//!
//! ```rust,ignore
//! let mut dec = LatticeDecoder::new(graph, DecoderConfig::default())?;
//! dec.begin_utterance()?;
//! for frame in scores {
//!     dec.process_frame(&frame)?;
//! }
//! let lattice = dec.end_utterance()?;
//! ```
//!
//! All pools are allocated at construction and sized from configuration;
//! `begin_utterance` is a reset, not a reallocation. Survivor buffers are
//! double-buffered (frame `f` writes buffer `f % 2`), the lattice arc
//! buffer is single because it is append-only for the utterance.

use crate::error::{DecodeError, DecodeResult};
use crate::expand::{self, ExpandParams, StatsCells};
use crate::graph::SearchGraph;
use crate::histogram::HistogramPruner;
use crate::lattice::{LatticeProcessor, LatticeView};
use crate::likelihood::{LogLikelihoodSource, ScoreBuffers};
use crate::lookup::LookupTable;
use crate::parallel;
use crate::storage::{ArcScratch, ArenaVector, MergeVector, TokenArena};
use crate::trace::{frame_span, verbose_event};
use crate::types::{AtomicCost, CostType, LatLink, LatLinkCompact, Token, TokenState};
use crate::DecoderConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Diagnostic counters accumulated over an utterance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    /// Costs that went NaN and were treated as infinite
    pub nan_costs: u64,
    /// Epsilon closures that hit the iteration cap while still improving
    pub non_converged_closures: u32,
    /// Frames whose source tokens were histogram-pruned
    pub histogram_engaged: u32,
    /// Source tokens admitted into the most recent frame
    pub last_source_tokens: u32,
}

/// GPU-style parallel lattice decoder over a static search graph
#[derive(Debug)]
pub struct LatticeDecoder {
    config: DecoderConfig,
    graph: Arc<SearchGraph>,

    arena: TokenArena,
    lat_arcs: ArenaVector<LatLinkCompact>,
    toks_bufs: [MergeVector; 2],
    lookup: LookupTable,
    histogram: HistogramPruner,
    scratch: ArcScratch,
    ne_queue: ArenaVector<u32>,
    admit: Box<[AtomicBool]>,
    cutoff: AtomicCost,
    modified: [AtomicBool; 3],
    stats: StatsCells,
    processor: LatticeProcessor,

    num_frames_decoded: i32,
    decoding: bool,
    expand_workers: usize,
    lat_workers: usize,
}

impl LatticeDecoder {
    /// Allocate a decoder for `graph`, sizing every pool from `config`.
    pub fn new(graph: Arc<SearchGraph>, config: DecoderConfig) -> DecodeResult<Self> {
        config.check()?;
        let workers = parallel::worker_count();
        let expand_workers = ((workers as f32 * config.gpu_fraction).ceil() as usize).max(1);
        let lat_workers = ((expand_workers as f32 * config.lat_fraction).ceil() as usize).max(1);

        Ok(Self {
            arena: TokenArena::new(config.max_tokens),
            lat_arcs: ArenaVector::new(config.max_arcs),
            toks_bufs: [
                MergeVector::new(config.max_tokens_per_frame),
                MergeVector::new(config.max_tokens_per_frame),
            ],
            lookup: LookupTable::new(graph.num_states()),
            histogram: HistogramPruner::new(config.beam),
            scratch: ArcScratch::new(config.max_lat_arc_per_frame),
            ne_queue: ArenaVector::new(config.max_tokens_per_frame),
            admit: (0..config.max_tokens_per_frame)
                .map(|_| AtomicBool::new(false))
                .collect(),
            cutoff: AtomicCost::new(f32::INFINITY),
            modified: Default::default(),
            stats: StatsCells::default(),
            processor: LatticeProcessor::new(config.max_arcs, config.lattice_beam),
            num_frames_decoded: 0,
            decoding: false,
            expand_workers,
            lat_workers,
            graph,
            config,
        })
    }

    /// Reset per-utterance state and seed the start token.
    ///
    /// Frame 0 consists of the start token plus one epsilon closure; the
    /// first acoustic frame is consumed by the first `process_frame` call.
    pub fn begin_utterance(&mut self) -> DecodeResult<()> {
        if self.graph.num_arcs() == 0 {
            return Err(DecodeError::GraphEmpty);
        }

        self.arena.clear();
        self.lat_arcs.clear();
        self.toks_bufs[0].clear();
        self.toks_bufs[1].clear();
        self.lookup.reset_all();
        self.scratch.reset_overflow();
        self.processor.clear();
        self.stats = StatsCells::default();
        self.num_frames_decoded = 0;
        self.decoding = true;
        self.cutoff.store(f32::INFINITY);

        let _frame_span = frame_span!(0);
        {
            let p = self.frame_params(0, &[], false);
            expand::add_initial_token(&p, self.graph.start_state());
            expand::nonemitting_closure(&p);
        }
        self.close_frame(0)
    }

    /// Decode one acoustic frame.
    ///
    /// `log_likelihoods` is the dense score vector for the frame, indexed
    /// by input label (so it must cover `max_ilabel`). Rotates the survivor
    /// buffers, runs the cutoff/emit/closure phases, and records the frame
    /// in the lattice.
    pub fn process_frame(&mut self, log_likelihoods: &[CostType]) -> DecodeResult<()> {
        if !self.decoding {
            return Err(DecodeError::State(
                "no active utterance; call begin_utterance first",
            ));
        }
        if log_likelihoods.len() <= self.graph.max_ilabel() as usize {
            return Err(self.fail(DecodeError::Likelihood(format!(
                "need {} scores per frame, got {}",
                self.graph.max_ilabel() + 1,
                log_likelihoods.len()
            ))));
        }
        if !self.arena.fits_frame(self.config.max_tokens_per_frame) {
            let capacity = self.config.max_tokens;
            let frame = self.num_frames_decoded + 1;
            return Err(self.fail(DecodeError::CapacityExceeded {
                what: "token pool",
                capacity,
                frame,
            }));
        }

        self.num_frames_decoded += 1;
        let frame = self.num_frames_decoded;
        let _frame_span = frame_span!(frame);
        let prev_i = ((frame - 1) % 2) as usize;

        // Histogram pruning engages when the previous frame survived wider
        // than the target active set.
        let prev_size = self.toks_bufs[prev_i].size();
        let engaged = frame > 1 && prev_size > self.config.max_active;
        if engaged {
            expand::histogram_prune_sources(
                &self.toks_bufs[prev_i],
                &self.arena,
                &mut self.histogram,
                &self.admit,
                self.config.max_active,
                self.expand_workers,
                &self.stats,
            );
        } else {
            self.stats.source_tokens.store(prev_size, Ordering::Relaxed);
        }

        self.toks_bufs[(frame % 2) as usize].clear();
        self.scratch.reset_overflow();

        {
            let p = self.frame_params(frame, log_likelihoods, engaged);
            expand::find_best_cutoff(&p);
            expand::expand_emitting(&p);
            expand::nonemitting_closure(&p);
        }
        self.close_frame(frame)
    }

    /// Finish the utterance: run backward pruning over every remaining
    /// frame and export the pruned lattice.
    pub fn end_utterance(&mut self) -> DecodeResult<LatticeView> {
        if !self.decoding {
            return Err(DecodeError::State("no active utterance"));
        }
        let top = self.processor.num_frames().saturating_sub(1);
        if let Err(e) = self.processor.prune(
            &self.arena,
            &self.lat_arcs,
            &self.graph,
            top,
            self.lat_workers,
            self.num_frames_decoded,
        ) {
            return Err(self.fail(e));
        }

        let last = &self.toks_bufs[(self.num_frames_decoded % 2) as usize];
        let view = self.processor.export(&self.arena, last);
        self.decoding = false;
        Ok(view)
    }

    /// Drive a full utterance from a log-likelihood source.
    ///
    /// Scores are staged through a double buffer so that filling frame
    /// `t`+1 is decoupled from expanding frame `t`; the source is called
    /// exactly once per frame, in order.
    pub fn decode<S>(&mut self, source: &mut S, num_frames: usize) -> DecodeResult<LatticeView>
    where
        S: LogLikelihoodSource + ?Sized,
    {
        self.begin_utterance()?;
        let mut scores = ScoreBuffers::new(self.graph.max_ilabel() as usize + 1);
        for f in 0..num_frames {
            if let Err(e) = scores.fill(source, f) {
                return Err(self.fail(e));
            }
            self.process_frame(scores.scores(f))?;
        }
        self.end_utterance()
    }

    /// Number of acoustic frames decoded in the current/last utterance.
    #[must_use]
    pub fn num_frames_decoded(&self) -> i32 {
        self.num_frames_decoded
    }

    /// Whether any last-frame survivor sits in a final state.
    #[must_use]
    pub fn reached_final(&self) -> bool {
        let last = &self.toks_bufs[(self.num_frames_decoded % 2) as usize];
        (0..last.size()).any(|i| self.graph.final_cost(last.get(i).state).is_finite())
    }

    /// Best final-weighted cost minus best cost on the last frame.
    ///
    /// +inf when no final state is active; usually a small non-negative
    /// number when decoding ended cleanly.
    #[must_use]
    pub fn final_relative_cost(&self) -> CostType {
        let last = &self.toks_bufs[(self.num_frames_decoded % 2) as usize];
        let mut best = f32::INFINITY;
        let mut best_final = f32::INFINITY;
        for i in 0..last.size() {
            let ts = last.get(i);
            let cost = self.arena.token(ts.tok_idx).cost;
            best = best.min(cost);
            best_final = best_final.min(cost + self.graph.final_cost(ts.state));
        }
        if best_final.is_finite() {
            best_final - best
        } else {
            f32::INFINITY
        }
    }

    /// Single best path through the pruned lattice.
    ///
    /// Convenience over [`LatticeView::best_path`] for callers that do not
    /// keep the view around.
    #[must_use]
    pub fn best_path(&self, view: &LatticeView) -> Vec<LatLink> {
        view.best_path(&self.graph)
    }

    /// Diagnostic counters for the current/last utterance.
    #[must_use]
    pub fn stats(&self) -> DecodeStats {
        DecodeStats {
            nan_costs: self.stats.nan_costs.load(Ordering::Relaxed),
            non_converged_closures: self.stats.non_converged_closures.load(Ordering::Relaxed),
            histogram_engaged: self.stats.histogram_engaged.load(Ordering::Relaxed),
            last_source_tokens: self.stats.source_tokens.load(Ordering::Relaxed),
        }
    }

    /// The configuration the pools were sized from.
    #[must_use]
    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Approximate bytes held by the decoder's pools.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        use std::mem::size_of;
        let tok = size_of::<Token>();
        let ts = size_of::<TokenState>();
        tok * self.arena.capacity() as usize
            + size_of::<LatLinkCompact>() * self.lat_arcs.capacity() as usize
            + (ts + 1) * 2 * self.config.max_tokens_per_frame as usize
            + (tok + 1) * self.scratch.capacity() as usize
            + size_of::<LatLink>() * self.processor.output_capacity() as usize
            + 8 * self.graph.num_states() as usize
    }

    /// Bundle the per-frame worker-loop inputs.
    fn frame_params<'a>(
        &'a self,
        frame: i32,
        scores: &'a [CostType],
        admit_engaged: bool,
    ) -> ExpandParams<'a> {
        let cur_i = (frame % 2) as usize;
        ExpandParams {
            graph: &self.graph,
            prev_toks: &self.toks_bufs[cur_i ^ 1],
            cur_toks: &self.toks_bufs[cur_i],
            lookup: &self.lookup,
            arena: &self.arena,
            lat_arcs: &self.lat_arcs,
            scratch: &self.scratch,
            ne_queue: &self.ne_queue,
            cutoff: &self.cutoff,
            admit: if admit_engaged {
                Some(&self.admit[..])
            } else {
                None
            },
            scores,
            beam: self.config.beam,
            frame,
            frame_tok_base: self.arena.used(),
            frame_arc_base: self.lat_arcs.size(),
            workers: self.expand_workers,
            modified: &self.modified,
            stats: &self.stats,
        }
    }

    /// Overflow checks, collection, lookup reset, and periodic pruning for
    /// a frame whose phases have all joined.
    fn close_frame(&mut self, frame: i32) -> DecodeResult<()> {
        let cur_i = (frame % 2) as usize;

        if self.scratch.overflowed() {
            let capacity = self.config.max_lat_arc_per_frame;
            return Err(self.fail(DecodeError::CapacityExceeded {
                what: "lattice arcs per frame",
                capacity,
                frame,
            }));
        }
        if self.lat_arcs.overflowed() {
            let capacity = self.config.max_arcs;
            return Err(self.fail(DecodeError::CapacityExceeded {
                what: "lattice arcs",
                capacity,
                frame,
            }));
        }
        if self.toks_bufs[cur_i].overflowed() {
            let capacity = self.config.max_tokens_per_frame;
            return Err(self.fail(DecodeError::CapacityExceeded {
                what: "tokens per frame",
                capacity,
                frame,
            }));
        }

        let survivors = self.toks_bufs[cur_i].size();
        self.arena.advance(survivors);
        self.processor
            .collect_frame(self.arena.used(), self.lat_arcs.size());
        self.lookup.reset_frame(&self.toks_bufs[cur_i]);

        verbose_event!(
            self.config.verbose,
            2,
            "frame {frame}: {survivors} survivors, {} arcs total, {} NaN costs skipped",
            self.lat_arcs.size(),
            self.stats.nan_costs.load(Ordering::Relaxed)
        );

        let interval = self.config.prune_interval as i32;
        if interval > 0 && frame > 0 && frame % interval == 0 {
            let collect_upto = (frame - interval).max(0) as usize;
            if let Err(e) = self.processor.prune(
                &self.arena,
                &self.lat_arcs,
                &self.graph,
                collect_upto,
                self.lat_workers,
                frame,
            ) {
                return Err(self.fail(e));
            }
        }
        Ok(())
    }

    /// Terminate the utterance on a fatal condition.
    fn fail(&mut self, e: DecodeError) -> DecodeError {
        self.decoding = false;
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::SearchGraphBuilder;

    fn small_config() -> DecoderConfig {
        DecoderConfig::default()
            .with_beam(2.0)
            .with_lattice_beam(1.0)
            .with_capacities(64, 64, 1024, 1024)
    }

    fn chain_graph() -> Arc<SearchGraph> {
        // 0 --1/0.5--> 1 --1/0.25--> 2(final)
        let mut b = SearchGraphBuilder::new(3, 0);
        b.arc(0, 1, 1, 1, 0.5);
        b.arc(1, 2, 1, 2, 0.25);
        b.final_state(2, 0.0);
        Arc::new(b.build().expect("graph"))
    }

    #[test]
    fn test_empty_graph_is_fatal_at_begin() {
        let g = Arc::new(SearchGraphBuilder::new(1, 0).build().expect("graph"));
        let mut dec = LatticeDecoder::new(g, small_config()).expect("decoder");
        assert!(matches!(
            dec.begin_utterance(),
            Err(DecodeError::GraphEmpty)
        ));
    }

    #[test]
    fn test_process_frame_requires_begin() {
        let mut dec = LatticeDecoder::new(chain_graph(), small_config()).expect("decoder");
        assert!(matches!(
            dec.process_frame(&[0.0, 0.0]),
            Err(DecodeError::State(_))
        ));
    }

    #[test]
    fn test_short_score_vector_is_fatal() {
        let mut dec = LatticeDecoder::new(chain_graph(), small_config()).expect("decoder");
        dec.begin_utterance().expect("begin");
        assert!(matches!(
            dec.process_frame(&[0.0]),
            Err(DecodeError::Likelihood(_))
        ));
        // The utterance is dead until the next begin.
        assert!(matches!(
            dec.process_frame(&[0.0, 0.0]),
            Err(DecodeError::State(_))
        ));
        dec.begin_utterance().expect("begin again");
    }

    #[test]
    fn test_two_frame_chain_reaches_final() {
        let mut dec = LatticeDecoder::new(chain_graph(), small_config()).expect("decoder");
        dec.begin_utterance().expect("begin");
        dec.process_frame(&[0.0, 0.0]).expect("frame 1");
        assert!(!dec.reached_final());
        dec.process_frame(&[0.0, 0.0]).expect("frame 2");
        assert!(dec.reached_final());
        assert!((dec.final_relative_cost() - 0.0).abs() < 1e-6);
        assert_eq!(dec.num_frames_decoded(), 2);

        let view = dec.end_utterance().expect("end");
        assert_eq!(view.num_frames(), 2);
        // One token per frame along the chain.
        assert_eq!(view.token_frame_start, vec![0, 1, 2, 3]);

        let path = dec.best_path(&view);
        assert_eq!(path.len(), 2);
        assert_eq!(path[0].olabel, 1);
        assert_eq!(path[1].olabel, 2);
    }

    #[test]
    fn test_utterances_are_independent() {
        let mut dec = LatticeDecoder::new(chain_graph(), small_config()).expect("decoder");
        for _ in 0..3 {
            dec.begin_utterance().expect("begin");
            dec.process_frame(&[0.0, 0.0]).expect("frame");
            let view = dec.end_utterance().expect("end");
            assert_eq!(view.num_frames(), 1);
            assert_eq!(view.tokens.len(), 2);
        }
    }

    #[test]
    fn test_allocated_bytes_reflects_config() {
        let dec = LatticeDecoder::new(chain_graph(), small_config()).expect("decoder");
        let bytes = dec.allocated_bytes();
        // At least the token pool and arc buffer.
        assert!(bytes >= 1024 * 16 + 1024 * 32);
    }
}
