//! Accounting primitives: pure functions deriving equity, available
//! liquidity, and redemption capacity from the raw ledger fields.
//!
//! Every subtraction here is saturating. A clamped-to-zero intermediate is
//! an accounting fact, not an error, and the crank must never be blocked by
//! one. Invariant coverage lives in the property tests, not in asserts on
//! the hot path.

use bytemuck::{Pod, Zeroable};

/// Principal split between delegated stake and liquidity earmarked for
/// pending liabilities.
///
/// Layout (16 bytes):
///   0..8   staked_amount (u64)
///   8..16  reserved_amount (u64)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct WorkingCapital {
    /// Principal currently delegated to the validator layer.
    pub staked_amount: u64,
    /// Liquid balance earmarked to cover pending liabilities.
    /// Never exceeds the tracked liquid balance.
    pub reserved_amount: u64,
}

/// Instant-withdrawal buffer: a target carve-out plus the portion already
/// paid out of it.
///
/// Layout (16 bytes):
///   0..8   allocated_amount (u64)
///   8..16  distributed_amount (u64)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct AtomicCapital {
    /// Target liquidity carved out for instant withdrawals.
    pub allocated_amount: u64,
    /// Portion of the allocation already paid out. May transiently exceed
    /// `allocated_amount` after a target shrink; net assets saturate at 0.
    pub distributed_amount: u64,
}

/// Amounts owed but not yet paid.
///
/// Layout (24 bytes):
///   0..8   redemptions_payable (u64)
///   8..16  rewards_payable (u64)
///   16..24 zero_yield_payable (u64)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CurrentLiabilities {
    /// Pending delayed-unstake payouts.
    pub redemptions_payable: u64,
    /// Protocol management fee carved from claimed rewards, awaiting payout.
    pub rewards_payable: u64,
    /// Operator commission and donations. Held without yield accrual.
    pub zero_yield_payable: u64,
}

#[inline]
pub fn sat_sub(a: u64, b: u64) -> u64 {
    a.saturating_sub(b)
}

/// redemptions + rewards. Saturating: the sum of two u64 liability lines.
#[inline]
pub fn current_liabilities(l: &CurrentLiabilities) -> u64 {
    l.redemptions_payable.saturating_add(l.rewards_payable)
}

#[inline]
pub fn total_liabilities(l: &CurrentLiabilities) -> u64 {
    current_liabilities(l).saturating_add(l.zero_yield_payable)
}

/// Net atomic assets: allocation minus what was already distributed.
#[inline]
pub fn atomic_assets(a: &AtomicCapital) -> u64 {
    sat_sub(a.allocated_amount, a.distributed_amount)
}

/// Liquid balance that is neither the atomic buffer nor reserved for
/// liabilities.
#[inline]
pub fn current_assets(liquid_balance: u64, a: &AtomicCapital, w: &WorkingCapital) -> u64 {
    sat_sub(sat_sub(liquid_balance, atomic_assets(a)), w.reserved_amount)
}

/// Equity backing the claim shares: total assets minus total liabilities.
#[inline]
pub fn total_equity(w: &WorkingCapital, liquid_balance: u64, l: &CurrentLiabilities) -> u64 {
    sat_sub(
        w.staked_amount.saturating_add(liquid_balance),
        total_liabilities(l),
    )
}

/// Equity net of stake commitments already in flight. Pending delegations
/// are excluded from what is currently redeemable.
#[inline]
pub fn max_new_redemption(equity: u64, pending_staking: u64) -> u64 {
    sat_sub(equity, pending_staking)
}

/// Unpurposed liquidity: current assets not yet claimed by the stake queue.
#[inline]
pub fn goodwill(current_assets: u64, queue_to_stake: u64) -> u64 {
    sat_sub(current_assets, queue_to_stake)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_assets_saturates() {
        let a = AtomicCapital {
            allocated_amount: 100,
            distributed_amount: 250,
        };
        assert_eq!(atomic_assets(&a), 0);
        let a = AtomicCapital {
            allocated_amount: 250,
            distributed_amount: 100,
        };
        assert_eq!(atomic_assets(&a), 150);
    }

    #[test]
    fn current_assets_saturates_through_both_terms() {
        let w = WorkingCapital {
            staked_amount: 0,
            reserved_amount: 80,
        };
        let a = AtomicCapital {
            allocated_amount: 50,
            distributed_amount: 0,
        };
        // 100 - 50 atomic - 80 reserved clamps at zero.
        assert_eq!(current_assets(100, &a, &w), 0);
        assert_eq!(current_assets(200, &a, &w), 70);
    }

    #[test]
    fn equity_never_negative() {
        let w = WorkingCapital {
            staked_amount: 10,
            reserved_amount: 0,
        };
        let l = CurrentLiabilities {
            redemptions_payable: 500,
            rewards_payable: 0,
            zero_yield_payable: 0,
        };
        assert_eq!(total_equity(&w, 20, &l), 0);
        let l = CurrentLiabilities {
            redemptions_payable: 5,
            rewards_payable: 3,
            zero_yield_payable: 2,
        };
        assert_eq!(total_equity(&w, 20, &l), 20);
    }

    #[test]
    fn accounting_identity_holds_when_solvent() {
        let w = WorkingCapital {
            staked_amount: 700,
            reserved_amount: 40,
        };
        let l = CurrentLiabilities {
            redemptions_payable: 40,
            rewards_payable: 10,
            zero_yield_payable: 25,
        };
        let liquid = 300u64;
        let equity = total_equity(&w, liquid, &l);
        assert_eq!(
            w.staked_amount + liquid,
            equity + total_liabilities(&l),
            "staked + liquid must equal equity + liabilities"
        );
    }

    #[test]
    fn redemption_capacity_excludes_pending_stake() {
        assert_eq!(max_new_redemption(1000, 300), 700);
        assert_eq!(max_new_redemption(200, 300), 0);
    }

    #[test]
    fn goodwill_saturates() {
        assert_eq!(goodwill(100, 40), 60);
        assert_eq!(goodwill(40, 100), 0);
    }
}
