//! Ring-buffered per-round state.
//!
//! Fixed-size circular arrays indexed by `round % ROUND_SLOTS`, with
//! relative-offset accessors covering the last-last, last, current, and
//! next rounds (-2, -1, 0, +1). Advancing a round zeroes the slot that
//! becomes "next"; nothing is copied.

use bytemuck::{Pod, Zeroable};

pub const ROUND_SLOTS: usize = 4;

/// Intents accumulated during a round, awaiting the crank's netting step.
///
/// Layout (16 bytes):
///   0..8   queue_to_stake (u64)
///   8..16  queue_for_unstake (u64)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CashFlows {
    pub queue_to_stake: u64,
    pub queue_for_unstake: u64,
}

/// Rewards claimed and commission carved out of them, per round.
///
/// Layout (16 bytes):
///   0..8   rewards (u64)
///   8..16  commission (u64)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Revenue {
    pub rewards: u64,
    pub commission: u64,
}

/// Per-round snapshot of amounts in flight to/from the validator layer,
/// seeded once at the start of each global phase so netting never
/// double-counts committed amounts.
///
/// Layout (32 bytes):
///   0..8   pending_staking (u64)
///   8..16  pending_unstaking (u64)
///   16..24 round (u64)
///   24     seeded (u8)
///   25..32 _pad
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PendingSnapshot {
    pub pending_staking: u64,
    pub pending_unstaking: u64,
    pub round: u64,
    pub seeded: u8,
    pub _pad: [u8; 7],
}

#[inline]
pub fn slot_index(round: u64, offset: i64) -> usize {
    debug_assert!((-2..=1).contains(&offset));
    (round as i128 + offset as i128).rem_euclid(ROUND_SLOTS as i128) as usize
}

/// Cash-flow ring (64 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct FlowRing {
    pub slots: [CashFlows; ROUND_SLOTS],
}

impl FlowRing {
    #[inline]
    pub fn at(&self, round: u64, offset: i64) -> CashFlows {
        self.slots[slot_index(round, offset)]
    }

    #[inline]
    pub fn at_mut(&mut self, round: u64, offset: i64) -> &mut CashFlows {
        &mut self.slots[slot_index(round, offset)]
    }

    #[inline]
    pub fn current_mut(&mut self, round: u64) -> &mut CashFlows {
        self.at_mut(round, 0)
    }

    /// Zero the slot that becomes "next" after moving to `new_round`.
    pub fn advance(&mut self, new_round: u64) {
        self.slots[slot_index(new_round, 1)] = CashFlows::default();
    }
}

/// Revenue ring (64 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RevenueRing {
    pub slots: [Revenue; ROUND_SLOTS],
}

impl RevenueRing {
    #[inline]
    pub fn at(&self, round: u64, offset: i64) -> Revenue {
        self.slots[slot_index(round, offset)]
    }

    #[inline]
    pub fn current_mut(&mut self, round: u64) -> &mut Revenue {
        &mut self.slots[slot_index(round, 0)]
    }

    pub fn advance(&mut self, new_round: u64) {
        self.slots[slot_index(new_round, 1)] = Revenue::default();
    }
}
