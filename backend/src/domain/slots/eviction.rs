//! Deterministic eviction ordering.
//!
//! Candidates reaching this module already satisfy the hard exclusions
//! (warm hold elapsed, slot lock free, no in-flight synthesis). Ordering is
//! a pure function so every reclaim beat ranks identically.

use crate::domain::voices::Voice;

/// An eviction candidate paired with its owner's cached balance.
#[derive(Debug, Clone, PartialEq)]
pub struct EvictionCandidate {
    pub voice: Voice,
    pub owner_balance: i64,
}

/// Rank candidates: owners with zero cached balance first, then oldest
/// `last_used_at`, then smallest voice id.
pub fn order_candidates(mut candidates: Vec<EvictionCandidate>) -> Vec<EvictionCandidate> {
    candidates.sort_by(|a, b| {
        let a_has_credits = a.owner_balance != 0;
        let b_has_credits = b.owner_balance != 0;
        a_has_credits
            .cmp(&b_has_credits)
            .then_with(|| a.voice.last_used_at.cmp(&b.voice.last_used_at))
            .then_with(|| a.voice.id.cmp(&b.voice.id))
    });
    candidates
}
