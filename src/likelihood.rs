//! Acoustic log-likelihood interface
//!
//! The decoder never evaluates the acoustic model itself; it consumes a
//! dense per-frame log-likelihood vector indexed by input label. The score
//! store is double-buffered so that filling frame `t`+1 can overlap the
//! expansion of frame `t`.

use crate::error::DecodeResult;
use crate::types::CostType;

/// One-method capability that yields acoustic log-likelihoods per frame.
///
/// `compute` is called at most once per frame, in frame order. `out` is
/// sized to `max_ilabel + 1`; slot 0 (the epsilon label) is ignored by the
/// decoder.
pub trait LogLikelihoodSource {
    /// Fill `out` with log-likelihoods for `frame`.
    fn compute(&mut self, frame: usize, out: &mut [CostType]) -> DecodeResult<()>;
}

/// A [`LogLikelihoodSource`] backed by a pre-computed matrix
///
/// Row `t` holds the scores for frame `t`. Short rows are zero-extended,
/// which is convenient for hand-written test inputs.
#[derive(Debug, Clone)]
pub struct MatrixSource {
    rows: Vec<Vec<CostType>>,
}

impl MatrixSource {
    /// Wrap a score matrix (one row per frame).
    #[must_use]
    pub fn new(rows: Vec<Vec<CostType>>) -> Self {
        Self { rows }
    }

    /// Number of frames available.
    #[must_use]
    pub fn num_frames(&self) -> usize {
        self.rows.len()
    }
}

impl LogLikelihoodSource for MatrixSource {
    fn compute(&mut self, frame: usize, out: &mut [CostType]) -> DecodeResult<()> {
        let row = self.rows.get(frame).ok_or_else(|| {
            crate::error::DecodeError::Likelihood(format!("no scores for frame {frame}"))
        })?;
        let n = row.len().min(out.len());
        out[..n].copy_from_slice(&row[..n]);
        out[n..].fill(0.0);
        Ok(())
    }
}

/// Double-buffered per-frame score store
///
/// `fill` writes the buffer for a frame; `scores` reads it back during
/// expansion. Consecutive frames use alternating buffers, mirroring the
/// device-side double buffering that decouples score transfer from compute.
#[derive(Debug)]
pub(crate) struct ScoreBuffers {
    bufs: [Vec<CostType>; 2],
}

impl ScoreBuffers {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            bufs: [vec![0.0; size], vec![0.0; size]],
        }
    }

    /// Fill the buffer for `frame` from the source.
    pub(crate) fn fill<S: LogLikelihoodSource + ?Sized>(
        &mut self,
        source: &mut S,
        frame: usize,
    ) -> DecodeResult<()> {
        source.compute(frame, &mut self.bufs[frame % 2])
    }

    /// Scores previously filled for `frame`.
    pub(crate) fn scores(&self, frame: usize) -> &[CostType] {
        &self.bufs[frame % 2]
    }
}
