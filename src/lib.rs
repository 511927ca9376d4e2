//! # latdec
//!
//! Parallel Viterbi-style lattice decoder for automatic speech recognition.
//!
//! ## Overview
//!
//! Given a weighted finite-state transducer (the static search graph) and a
//! per-frame stream of acoustic log-likelihoods, the decoder expands a
//! lattice of hypotheses frame by frame, recombines competing hypotheses at
//! each graph state, prunes by a relative beam (plus histogram pruning when
//! the active set overshoots), and emits a compact arc-and-token lattice
//! for downstream rescoring.
//!
//! The engine is written in the massively parallel style of GPU decoders:
//! dynamic work distribution from a shared atomic counter, two-pass atomic
//! token recombination with no write conflicts, append-only per-utterance
//! arenas addressed by `(frame, index)` pairs, and a backward extra-cost
//! pass that prunes arcs without ever moving a node. On CPU every phase is
//! a dynamically dispatched worker loop (rayon behind the `parallel`
//! feature); with a single worker the decode is deterministic.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use latdec::{DecoderConfig, LatticeDecoder, MatrixSource};
//!
//! let mut decoder = LatticeDecoder::new(graph, DecoderConfig::default())?;
//! let mut scores = MatrixSource::new(frames);
//! let lattice = decoder.decode(&mut scores, num_frames)?;
//! println!("best path: {} arcs", lattice.best_path(&graph).len());
//! ```
//!
//! ## Features
//!
//! - `parallel` (default): multi-threaded phases via rayon
//! - `tracing`: diagnostic events via the tracing crate
//!
//! Acoustic model evaluation, graph loading, language models, and lattice
//! determinization are external concerns; see [`LogLikelihoodSource`] and
//! [`SearchGraph`] for the seams.

#![warn(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod decoder;
pub mod error;
pub mod graph;
pub mod histogram;
pub mod lattice;
pub mod likelihood;
pub mod lookup;
pub mod parallel;
pub mod storage;
pub mod trace;
pub mod types;

mod expand;

pub use decoder::{DecodeStats, LatticeDecoder};
pub use error::{DecodeError, DecodeResult};
pub use expand::MAX_CLOSURE_ITERS;
pub use graph::{SearchGraph, SearchGraphBuilder};
pub use lattice::{FinalToken, LatticeView, ESTIMATED_PRUNE_RATIO};
pub use likelihood::{LogLikelihoodSource, MatrixSource};
pub use types::{CostType, LatLink, LatLinkCompact, StateId, Token, TokenState};

/// Decoder tuning and capacity configuration
///
/// Capacities size the per-decoder pools once at construction; overflowing
/// any of them is fatal to the utterance, never silently truncated.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// Margin above the per-frame best cost at which hypotheses are
    /// discarded during expansion. Larger is slower and more accurate.
    pub beam: f32,
    /// Extra-cost margin for arc survival in backward pruning. Larger
    /// keeps deeper lattices.
    pub lattice_beam: f32,
    /// Target survivor count; exceeding it triggers histogram pruning of
    /// the next frame's source tokens.
    pub max_active: u32,
    /// Ceiling on survivors per frame
    pub max_tokens_per_frame: u32,
    /// Ceiling on lattice arcs recorded per frame
    pub max_lat_arc_per_frame: u32,
    /// Ceiling on tokens per utterance
    pub max_tokens: u32,
    /// Ceiling on lattice arcs per utterance
    pub max_arcs: u32,
    /// Interval (in frames) at which backward pruning runs mid-utterance
    pub prune_interval: u32,
    /// Fraction of the worker pool used for expansion
    pub gpu_fraction: f32,
    /// Fraction of the expansion workers used for lattice pruning
    pub lat_fraction: f32,
    /// Diagnostic verbosity; levels above 2 emit per-frame trace events
    pub verbose: i32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            beam: 16.0,
            lattice_beam: 10.0,
            max_active: 10_000,
            max_tokens_per_frame: 200_000,
            max_lat_arc_per_frame: 600_000,
            max_tokens: 6_000_000,
            max_arcs: 9_000_000,
            prune_interval: 3000,
            gpu_fraction: 1.0 / 8.0,
            lat_fraction: 1.0 / 2.0,
            verbose: 0,
        }
    }
}

impl DecoderConfig {
    /// Set the decoding beam.
    #[must_use]
    pub fn with_beam(mut self, beam: f32) -> Self {
        self.beam = beam;
        self
    }

    /// Set the lattice beam.
    #[must_use]
    pub fn with_lattice_beam(mut self, lattice_beam: f32) -> Self {
        self.lattice_beam = lattice_beam;
        self
    }

    /// Set the target active-set size for histogram pruning.
    #[must_use]
    pub fn with_max_active(mut self, max_active: u32) -> Self {
        self.max_active = max_active;
        self
    }

    /// Set the mid-utterance pruning interval in frames.
    #[must_use]
    pub fn with_prune_interval(mut self, prune_interval: u32) -> Self {
        self.prune_interval = prune_interval;
        self
    }

    /// Set the per-frame and per-utterance capacity ceilings.
    #[must_use]
    pub fn with_capacities(
        mut self,
        max_tokens_per_frame: u32,
        max_lat_arc_per_frame: u32,
        max_tokens: u32,
        max_arcs: u32,
    ) -> Self {
        self.max_tokens_per_frame = max_tokens_per_frame;
        self.max_lat_arc_per_frame = max_lat_arc_per_frame;
        self.max_tokens = max_tokens;
        self.max_arcs = max_arcs;
        self
    }

    /// Set the worker-pool sizing hints.
    #[must_use]
    pub fn with_fractions(mut self, gpu_fraction: f32, lat_fraction: f32) -> Self {
        self.gpu_fraction = gpu_fraction;
        self.lat_fraction = lat_fraction;
        self
    }

    /// Set the diagnostic verbosity.
    #[must_use]
    pub fn with_verbose(mut self, verbose: i32) -> Self {
        self.verbose = verbose;
        self
    }

    /// Validate the configuration.
    pub fn check(&self) -> DecodeResult<()> {
        if !(self.beam > 0.0) {
            return Err(DecodeError::Config("beam must be positive".into()));
        }
        if !(self.lattice_beam > 0.0) {
            return Err(DecodeError::Config("lattice_beam must be positive".into()));
        }
        if !(self.gpu_fraction > 0.0 && self.gpu_fraction <= 1.0) {
            return Err(DecodeError::Config("gpu_fraction must be in (0, 1]".into()));
        }
        if !(self.lat_fraction > 0.0 && self.lat_fraction <= 1.0) {
            return Err(DecodeError::Config("lat_fraction must be in (0, 1]".into()));
        }
        if self.max_active == 0 {
            return Err(DecodeError::Config("max_active must be positive".into()));
        }
        if self.prune_interval == 0 {
            return Err(DecodeError::Config("prune_interval must be positive".into()));
        }
        if self.max_tokens_per_frame == 0
            || self.max_lat_arc_per_frame == 0
            || self.max_tokens == 0
            || self.max_arcs == 0
        {
            return Err(DecodeError::Config("capacities must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(DecoderConfig::default().check().is_ok());
    }

    #[test]
    fn test_config_builders() {
        let cfg = DecoderConfig::default()
            .with_beam(8.0)
            .with_lattice_beam(4.0)
            .with_max_active(2000)
            .with_prune_interval(25)
            .with_capacities(10, 20, 30, 40)
            .with_fractions(0.5, 0.25)
            .with_verbose(3);
        assert!((cfg.beam - 8.0).abs() < f32::EPSILON);
        assert_eq!(cfg.max_active, 2000);
        assert_eq!(cfg.prune_interval, 25);
        assert_eq!(
            (
                cfg.max_tokens_per_frame,
                cfg.max_lat_arc_per_frame,
                cfg.max_tokens,
                cfg.max_arcs
            ),
            (10, 20, 30, 40)
        );
        assert_eq!(cfg.verbose, 3);
        assert!(cfg.check().is_ok());
    }

    #[test]
    fn test_config_rejects_bad_values() {
        assert!(DecoderConfig::default().with_beam(0.0).check().is_err());
        assert!(DecoderConfig::default()
            .with_lattice_beam(-1.0)
            .check()
            .is_err());
        assert!(DecoderConfig::default()
            .with_fractions(0.0, 0.5)
            .check()
            .is_err());
        assert!(DecoderConfig::default()
            .with_capacities(0, 1, 1, 1)
            .check()
            .is_err());
        assert!(DecoderConfig::default()
            .with_prune_interval(0)
            .check()
            .is_err());
    }
}
