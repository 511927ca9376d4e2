//! Constant-time active-token lookup, one slot per graph state
//!
//! During a frame, the first worker to route an arc into a state must create
//! that state's token-state exactly once while every later worker finds it.
//! Each slot runs the activation protocol
//!
//! ```text
//! INACTIVE --CAS--> CLAIMING --index published--> READY --frame reset--> INACTIVE
//! ```
//!
//! The winner of the CAS pushes the token-state and publishes its survivor
//! index with release ordering before flipping the slot to READY; losers
//! spin with acquire loads until READY, so the index they read is the one
//! the winner wrote.

use crate::storage::MergeVector;
use crate::types::StateId;
use std::sync::atomic::{AtomicU32, Ordering};

const INACTIVE: u32 = 0;
const CLAIMING: u32 = 1;
const READY: u32 = 2;

/// Published index meaning "claim succeeded but the survivor push was
/// dropped by a capacity overflow"; observers treat the state as dead.
const DEAD: u32 = u32::MAX;

#[derive(Debug)]
struct LookupSlot {
    active: AtomicU32,
    ts_idx: AtomicU32,
}

/// Per-state activation table (one slot per search-graph state)
#[derive(Debug)]
pub struct LookupTable {
    slots: Box<[LookupSlot]>,
}

impl LookupTable {
    /// Allocate a table for `num_states` states, all INACTIVE.
    #[must_use]
    pub fn new(num_states: u32) -> Self {
        Self {
            slots: (0..num_states)
                .map(|_| LookupSlot {
                    active: AtomicU32::new(INACTIVE),
                    ts_idx: AtomicU32::new(DEAD),
                })
                .collect(),
        }
    }

    /// Activate `state` or fetch its survivor index for this frame.
    ///
    /// The worker that wins the activation CAS runs `create`, which must
    /// push the state's token-state and return its survivor index (`None`
    /// when the push overflowed). Every caller gets the same answer for the
    /// frame.
    pub fn claim_or_get<F>(&self, state: StateId, create: F) -> Option<u32>
    where
        F: FnOnce() -> Option<u32>,
    {
        let slot = &self.slots[state as usize];
        match slot
            .active
            .compare_exchange(INACTIVE, CLAIMING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                let idx = create();
                slot.ts_idx.store(idx.unwrap_or(DEAD), Ordering::Release);
                slot.active.store(READY, Ordering::Release);
                idx
            }
            Err(_) => {
                while slot.active.load(Ordering::Acquire) != READY {
                    std::hint::spin_loop();
                }
                let idx = slot.ts_idx.load(Ordering::Acquire);
                (idx != DEAD).then_some(idx)
            }
        }
    }

    /// Restore every slot touched this frame to INACTIVE.
    ///
    /// Walks the frame's survivors rather than the whole table, so the cost
    /// scales with the active set, not the graph.
    pub fn reset_frame(&self, survivors: &MergeVector) {
        for i in 0..survivors.size() {
            let state = survivors.get(i).state as usize;
            self.slots[state].active.store(INACTIVE, Ordering::Release);
            self.slots[state].ts_idx.store(DEAD, Ordering::Relaxed);
        }
    }

    /// Restore every slot in the table; used when starting an utterance
    /// after a failed one, where the survivor walk is unavailable.
    pub fn reset_all(&self) {
        for slot in self.slots.iter() {
            slot.active.store(INACTIVE, Ordering::Release);
            slot.ts_idx.store(DEAD, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel;
    use crate::types::TokenState;
    use std::sync::atomic::AtomicU32 as Counter;

    #[test]
    fn test_first_claim_creates() {
        let table = LookupTable::new(4);
        let idx = table.claim_or_get(2, || Some(7));
        assert_eq!(idx, Some(7));

        // Subsequent claims must not re-create.
        let idx = table.claim_or_get(2, || panic!("already claimed"));
        assert_eq!(idx, Some(7));
    }

    #[test]
    fn test_failed_create_marks_state_dead() {
        let table = LookupTable::new(2);
        assert_eq!(table.claim_or_get(0, || None), None);
        assert_eq!(table.claim_or_get(0, || panic!("claimed")), None);
    }

    #[test]
    fn test_reset_frame_reactivates() {
        let table = LookupTable::new(4);
        let toks = MergeVector::new(4);
        let i = toks.push_with(|i| TokenState::new(3, i)).expect("push");
        assert_eq!(table.claim_or_get(3, || Some(i)), Some(i));

        table.reset_frame(&toks);
        let idx = table.claim_or_get(3, || Some(9));
        assert_eq!(idx, Some(9));
    }

    #[test]
    fn test_concurrent_claims_agree() {
        let table = LookupTable::new(1);
        let creations = Counter::new(0);
        let results: Vec<Counter> = (0..64).map(|_| Counter::new(0)).collect();

        parallel::dispatch(64, |i| {
            let idx = table
                .claim_or_get(0, || {
                    creations.fetch_add(1, Ordering::Relaxed);
                    Some(42)
                })
                .expect("claimed");
            results[i as usize].store(idx, Ordering::Relaxed);
        });

        assert_eq!(creations.load(Ordering::Relaxed), 1);
        for r in &results {
            assert_eq!(r.load(Ordering::Relaxed), 42);
        }
    }
}
