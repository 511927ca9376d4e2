//! Fixed-capacity concurrent storage for tokens and lattice arcs
//!
//! Everything here is allocated once per decoder, sized from configuration,
//! and reset (not reallocated) per utterance. Mutation during a frame is
//! append-only through atomic counters, plus single-writer slot stores: a
//! slot index handed out by `push` belongs to exactly one worker until the
//! next phase barrier, which is what makes the `UnsafeCell` stores sound.
//!
//! Capacity overflow never aborts mid-phase. A push past capacity latches an
//! overflow flag and is dropped; the driver checks the flag at the next
//! phase boundary and fails the utterance with a `CapacityExceeded` error
//! naming the ceiling.

use crate::parallel;
use crate::types::{unpack_slot, Token, TokenState};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

fn cell_slab<T: Default>(n: usize) -> Box<[UnsafeCell<T>]> {
    (0..n).map(|_| UnsafeCell::new(T::default())).collect()
}

/// Fixed-capacity append-only vector with atomic push
///
/// `push` is linearizable; the returned index is the slot written. Readers
/// may hold `&T` for any slot below `size()` once the pushing phase has
/// reached a barrier.
#[derive(Debug)]
pub struct ArenaVector<T> {
    mem: Box<[UnsafeCell<T>]>,
    count: AtomicU32,
    overflow: AtomicBool,
}

// Slots are written by at most one worker between barriers; reads of a slot
// only happen after the barrier that follows its write.
unsafe impl<T: Send> Send for ArenaVector<T> {}
unsafe impl<T: Send + Sync> Sync for ArenaVector<T> {}

impl<T: Default> ArenaVector<T> {
    /// Allocate a vector of the given capacity.
    #[must_use]
    pub fn new(max_size: u32) -> Self {
        Self {
            mem: cell_slab(max_size as usize),
            count: AtomicU32::new(0),
            overflow: AtomicBool::new(false),
        }
    }
}

impl<T> ArenaVector<T> {
    /// Capacity in slots.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.mem.len() as u32
    }

    /// Number of live slots.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.count.load(Ordering::Acquire).min(self.capacity())
    }

    /// Whether the vector holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Append a value, returning the slot it landed in.
    ///
    /// Returns `None` and latches the overflow flag if the vector is full;
    /// the value is dropped.
    pub fn push(&self, value: T) -> Option<u32> {
        self.push_with(|_| value)
    }

    /// Append a value built from its own slot index.
    ///
    /// Needed when the element must record where it lives (a token-state
    /// stores the arena index derived from its own position).
    pub fn push_with<F: FnOnce(u32) -> T>(&self, f: F) -> Option<u32> {
        let idx = self.count.fetch_add(1, Ordering::AcqRel);
        if idx >= self.capacity() {
            self.overflow.store(true, Ordering::Release);
            return None;
        }
        unsafe {
            *self.mem[idx as usize].get() = f(idx);
        }
        Some(idx)
    }

    /// Borrow the element at `idx`.
    #[must_use]
    pub fn get(&self, idx: u32) -> &T {
        debug_assert!(idx < self.size());
        unsafe { &*self.mem[idx as usize].get() }
    }

    /// Drop all elements and clear the overflow latch.
    pub fn clear(&self) {
        self.count.store(0, Ordering::Release);
        self.overflow.store(false, Ordering::Release);
    }

    /// Whether any push was dropped since the last `clear`.
    #[must_use]
    pub fn overflowed(&self) -> bool {
        self.overflow.load(Ordering::Acquire)
    }
}

impl<T: Clone> ArenaVector<T> {
    /// Copy the live elements out to observer memory.
    #[must_use]
    pub fn snapshot(&self) -> Vec<T> {
        (0..self.size()).map(|i| self.get(i).clone()).collect()
    }
}

/// Per-frame scratch for the first pass of 2-pass recombination
///
/// One Token slot per lattice arc allocated this frame. The worker that wins
/// the pack race for arc slot `u` writes `tokens[u]` and raises
/// `updated[u]`; nobody else touches slot `u` until the scatter pass
/// consumes it.
#[derive(Debug)]
pub struct ArcScratch {
    tokens: Box<[UnsafeCell<Token>]>,
    updated: Box<[AtomicBool]>,
    overflow: AtomicBool,
}

unsafe impl Send for ArcScratch {}
unsafe impl Sync for ArcScratch {}

impl ArcScratch {
    /// Allocate scratch for at most `max_arcs_per_frame` arcs.
    #[must_use]
    pub fn new(max_arcs_per_frame: u32) -> Self {
        Self {
            tokens: cell_slab(max_arcs_per_frame as usize),
            updated: (0..max_arcs_per_frame)
                .map(|_| AtomicBool::new(false))
                .collect(),
            overflow: AtomicBool::new(false),
        }
    }

    /// Capacity in arc slots.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.tokens.len() as u32
    }

    /// Store the candidate token for arc slot `slot` and publish it.
    pub(crate) fn write(&self, slot: u32, tok: Token) {
        unsafe {
            *self.tokens[slot as usize].get() = tok;
        }
        self.updated[slot as usize].store(true, Ordering::Release);
    }

    /// Consume the published flag for `slot`; true at most once per write.
    pub(crate) fn take_updated(&self, slot: u32) -> bool {
        self.updated[slot as usize].swap(false, Ordering::AcqRel)
    }

    /// Read the candidate token stored at `slot`.
    pub(crate) fn read(&self, slot: u32) -> Token {
        unsafe { (*self.tokens[slot as usize].get()).clone() }
    }

    /// Latch the per-frame arc overflow flag.
    pub(crate) fn mark_overflow(&self) {
        self.overflow.store(true, Ordering::Release);
    }

    /// Whether the frame produced more arcs than the scratch can hold.
    #[must_use]
    pub fn overflowed(&self) -> bool {
        self.overflow.load(Ordering::Acquire)
    }

    /// Clear the overflow latch for a new frame.
    pub(crate) fn reset_overflow(&self) {
        self.overflow.store(false, Ordering::Release);
    }
}

/// Survivor set of one frame: token-states plus per-slot update flags
///
/// Extends [`ArenaVector`] with the scatter pass that completes 2-pass
/// recombination. Without the second pass, two workers racing to write the
/// same token record would interleave field stores and corrupt it; instead
/// every writer owns a private arc slot and the scatter copies only the
/// slot named by the final pack.
#[derive(Debug)]
pub struct MergeVector {
    slots: ArenaVector<TokenState>,
    updated: Box<[AtomicBool]>,
}

impl MergeVector {
    /// Allocate a survivor set of the given capacity.
    #[must_use]
    pub fn new(max_size: u32) -> Self {
        Self {
            slots: ArenaVector::new(max_size),
            updated: (0..max_size).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    /// Capacity in token-states.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.slots.capacity()
    }

    /// Number of survivors so far this frame.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.slots.size()
    }

    /// Whether the frame has no survivors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Append a token-state built from its own slot index.
    pub fn push_with<F: FnOnce(u32) -> TokenState>(&self, f: F) -> Option<u32> {
        self.slots.push_with(f)
    }

    /// Borrow the token-state at `idx`.
    #[must_use]
    pub fn get(&self, idx: u32) -> &TokenState {
        self.slots.get(idx)
    }

    /// Whether slot `idx` received a better token in the last scatter.
    #[must_use]
    pub fn is_updated(&self, idx: u32) -> bool {
        self.updated[idx as usize].load(Ordering::Acquire)
    }

    /// Drop all survivors and clear the overflow latch.
    pub fn clear(&self) {
        self.slots.clear();
    }

    /// Whether any push was dropped since the last `clear`.
    #[must_use]
    pub fn overflowed(&self) -> bool {
        self.slots.overflowed()
    }

    /// Second pass of 2-pass recombination.
    ///
    /// For every survivor, decode the winning arc slot from its pack; if
    /// that scratch slot was written this round, copy the scratch token into
    /// the survivor's arena record and mark the survivor updated. A pack
    /// whose slot lies outside the scratch (the utterance-initial token) or
    /// whose slot was already consumed by an earlier round is left alone.
    pub fn scatter_by_pack(&self, scratch: &ArcScratch, arena: &TokenArena, workers: usize) {
        let n = self.size();
        parallel::dispatch_limited(workers, n, |i| {
            let ts = self.get(i);
            let slot = unpack_slot(ts.pack());
            if slot < scratch.capacity() && scratch.take_updated(slot) {
                arena.write(ts.tok_idx, scratch.read(slot));
                self.updated[i as usize].store(true, Ordering::Release);
            } else {
                self.updated[i as usize].store(false, Ordering::Release);
            }
        });
    }
}

/// Monotonic per-utterance token pool, laid out frame-major
///
/// Tokens for frame `t` occupy the contiguous index range
/// `[used at frame start, used at frame end)`; `advance` closes a frame by
/// bumping the watermark, so a `(frame, local index)` pair resolves to
/// `frame start + local index` for the lifetime of the utterance.
#[derive(Debug)]
pub struct TokenArena {
    pool: Box<[UnsafeCell<Token>]>,
    used: AtomicU32,
}

unsafe impl Send for TokenArena {}
unsafe impl Sync for TokenArena {}

impl TokenArena {
    /// Allocate a pool of `max_tokens` records.
    #[must_use]
    pub fn new(max_tokens: u32) -> Self {
        Self {
            pool: cell_slab(max_tokens as usize),
            used: AtomicU32::new(0),
        }
    }

    /// Pool capacity.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.pool.len() as u32
    }

    /// Tokens allocated so far this utterance.
    #[must_use]
    pub fn used(&self) -> u32 {
        self.used.load(Ordering::Acquire)
    }

    /// Global index of the token `offset` places past the watermark.
    #[must_use]
    pub fn allocate_index(&self, offset: u32) -> u32 {
        self.used() + offset
    }

    /// Whether a frame that allocates up to `frame_budget` tokens fits.
    #[must_use]
    pub fn fits_frame(&self, frame_budget: u32) -> bool {
        self.used() as u64 + u64::from(frame_budget) <= u64::from(self.capacity())
    }

    /// Close a frame that allocated `n` tokens.
    pub fn advance(&self, n: u32) {
        self.used.fetch_add(n, Ordering::AcqRel);
    }

    /// Return every token to the pool.
    pub fn clear(&self) {
        self.used.store(0, Ordering::Release);
    }

    /// Borrow the token at `idx`.
    #[must_use]
    pub fn token(&self, idx: u32) -> &Token {
        debug_assert!((idx as usize) < self.pool.len());
        unsafe { &*self.pool[idx as usize].get() }
    }

    /// Store a token record. Callers must own `idx` (scatter discipline:
    /// one writer per arena slot per round).
    pub(crate) fn write(&self, idx: u32, tok: Token) {
        debug_assert!((idx as usize) < self.pool.len());
        unsafe {
            *self.pool[idx as usize].get() = tok;
        }
    }

    /// Copy the first `upto` tokens out to observer memory.
    #[must_use]
    pub fn snapshot(&self, upto: u32) -> Vec<Token> {
        (0..upto.min(self.capacity()))
            .map(|i| self.token(i).clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::pack_cost_slot;

    // =========================================================================
    // ArenaVector
    // =========================================================================

    #[test]
    fn test_arena_vector_push_and_get() {
        let v: ArenaVector<u32> = ArenaVector::new(4);
        assert_eq!(v.push(10), Some(0));
        assert_eq!(v.push(20), Some(1));
        assert_eq!(v.size(), 2);
        assert_eq!(*v.get(0), 10);
        assert_eq!(*v.get(1), 20);
    }

    #[test]
    fn test_arena_vector_overflow_latches() {
        let v: ArenaVector<u32> = ArenaVector::new(2);
        assert!(v.push(1).is_some());
        assert!(v.push(2).is_some());
        assert!(v.push(3).is_none());
        assert!(v.overflowed());
        assert_eq!(v.size(), 2);

        v.clear();
        assert!(!v.overflowed());
        assert_eq!(v.size(), 0);
    }

    #[test]
    fn test_arena_vector_push_with_sees_own_index() {
        let v: ArenaVector<u32> = ArenaVector::new(3);
        for _ in 0..3 {
            v.push_with(|i| i * 100);
        }
        assert_eq!(*v.get(2), 200);
    }

    #[test]
    fn test_arena_vector_concurrent_push() {
        let v: ArenaVector<u32> = ArenaVector::new(1000);
        parallel::dispatch(1000, |i| {
            v.push(i);
        });
        assert_eq!(v.size(), 1000);
        // Every value lands exactly once, in some slot.
        let mut seen = v.snapshot();
        seen.sort_unstable();
        assert_eq!(seen, (0..1000).collect::<Vec<_>>());
    }

    // =========================================================================
    // MergeVector scatter
    // =========================================================================

    #[test]
    fn test_scatter_copies_winning_slot_only() {
        let arena = TokenArena::new(8);
        let toks = MergeVector::new(8);
        let scratch = ArcScratch::new(8);

        // One state, two competing arcs in slots 0 and 1; slot 1 wins.
        let idx = toks.push_with(|i| TokenState::new(5, i)).expect("push");
        let ts = toks.get(idx);
        assert!(ts.improve(pack_cost_slot(0.3, 0)));
        scratch.write(0, Token::new(0.3, 1, 5));
        assert!(ts.improve(pack_cost_slot(0.1, 1)));
        scratch.write(1, Token::new(0.1, 1, 5));

        toks.scatter_by_pack(&scratch, &arena, 1);
        assert!(toks.is_updated(idx));
        let tok = arena.token(0);
        assert!((tok.cost - 0.1).abs() < 1e-6);
        assert_eq!(tok.state, 5);
        // The winning flag was consumed; the losing slot's flag remains for
        // hygiene checks but is never consulted again.
        assert!(!scratch.take_updated(1));
    }

    #[test]
    fn test_scatter_skips_unwritten_round() {
        let arena = TokenArena::new(8);
        let toks = MergeVector::new(8);
        let scratch = ArcScratch::new(8);

        let idx = toks.push_with(|i| TokenState::new(2, i)).expect("push");
        toks.get(idx).improve(pack_cost_slot(1.0, 0));
        scratch.write(0, Token::new(1.0, 0, 2));

        toks.scatter_by_pack(&scratch, &arena, 1);
        assert!(toks.is_updated(idx));

        // Second round with no new writes: the slot was consumed, so the
        // survivor must not be marked updated again.
        toks.scatter_by_pack(&scratch, &arena, 1);
        assert!(!toks.is_updated(idx));
    }

    #[test]
    fn test_scatter_ignores_out_of_range_slot() {
        let arena = TokenArena::new(8);
        let toks = MergeVector::new(8);
        let scratch = ArcScratch::new(4);

        let idx = toks.push_with(|i| TokenState::new(0, i)).expect("push");
        toks.get(idx)
            .improve(pack_cost_slot(0.0, crate::types::NO_ARC_SLOT));
        toks.scatter_by_pack(&scratch, &arena, 1);
        assert!(!toks.is_updated(idx));
    }

    // =========================================================================
    // TokenArena
    // =========================================================================

    #[test]
    fn test_token_arena_frame_major_layout() {
        let arena = TokenArena::new(10);
        assert_eq!(arena.allocate_index(0), 0);

        arena.write(0, Token::new(0.0, 0, 0));
        arena.advance(1);
        assert_eq!(arena.used(), 1);
        assert_eq!(arena.allocate_index(2), 3);

        arena.write(1, Token::new(0.5, 1, 3));
        arena.advance(1);
        assert_eq!(arena.used(), 2);
        assert_eq!(arena.token(1).state, 3);

        arena.clear();
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn test_token_arena_frame_budget() {
        let arena = TokenArena::new(5);
        assert!(arena.fits_frame(5));
        arena.advance(3);
        assert!(arena.fits_frame(2));
        assert!(!arena.fits_frame(3));
    }

    #[test]
    fn test_token_arena_snapshot() {
        let arena = TokenArena::new(4);
        arena.write(0, Token::new(1.0, 0, 7));
        arena.write(1, Token::new(2.0, 0, 8));
        arena.advance(2);

        let snap = arena.snapshot(arena.used());
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[1].state, 8);
    }
}
