//! Decoder instrumentation hooks
//!
//! Per-frame diagnostics for the token-passing pipeline. With the `tracing`
//! feature the hooks emit through the `tracing` crate; without it they
//! compile to no-ops, so the frame loop pays nothing for them.
//!
//! Emission follows the decoder's `verbose` configuration the same way the
//! rest of the pipeline does: [`verbose_event!`] takes the configured level
//! and the minimum level at which the event fires, so call sites read as
//! "at verbosity above 2, report the frame summary".
//!
//! ```rust,ignore
//! let _frame = frame_span!(frame);
//! verbose_event!(config.verbose, 2, "frame {frame}: {survivors} survivors");
//! ```

/// Guard returned by [`frame_span!`] when the `tracing` feature is off.
///
/// Dropping it does nothing; it only exists so the frame loop can bind a
/// guard unconditionally.
#[cfg(not(feature = "tracing"))]
pub struct SilentFrame;

/// Open a span covering the expansion and collection of one frame.
///
/// Returns an entered guard; the span closes when the guard drops at the
/// end of the frame.
#[macro_export]
#[cfg(feature = "tracing")]
macro_rules! frame_span {
    ($frame:expr) => {
        tracing::debug_span!("decode_frame", frame = $frame).entered()
    };
}

/// Open a span covering one frame (no-op without the `tracing` feature).
#[macro_export]
#[cfg(not(feature = "tracing"))]
macro_rules! frame_span {
    ($frame:expr) => {{
        let _ = $frame;
        $crate::trace::SilentFrame
    }};
}

/// Emit a diagnostic event when `verbose` exceeds `min`.
///
/// The format arguments are not evaluated below the threshold (or without
/// the `tracing` feature), so counters may be read inline in the call.
#[macro_export]
#[cfg(feature = "tracing")]
macro_rules! verbose_event {
    ($verbose:expr, $min:expr, $($arg:tt)*) => {
        if $verbose > $min {
            tracing::debug!($($arg)*);
        }
    };
}

/// Emit a diagnostic event (no-op without the `tracing` feature).
#[macro_export]
#[cfg(not(feature = "tracing"))]
macro_rules! verbose_event {
    ($verbose:expr, $min:expr, $($arg:tt)*) => {{
        let _ = $verbose;
        let _ = $min;
    }};
}

// Re-export macros at module level
pub use frame_span;
pub use verbose_event;

#[cfg(test)]
mod tests {

    #[test]
    fn test_frame_span_scopes_a_frame() {
        // Binds under both feature configurations; entering frame 17 and
        // dropping the guard must be side-effect free here.
        let guard = frame_span!(17);
        drop(guard);
    }

    #[test]
    fn test_verbose_event_respects_threshold() {
        // Below the threshold nothing fires; above it the arguments are
        // formatted. Both must compile against real frame counters.
        let survivors = 4096u32;
        verbose_event!(0, 2, "frame 3: {survivors} survivors");
        verbose_event!(3, 2, "frame 3: {survivors} survivors, {} arcs", 12_288);
    }
}
