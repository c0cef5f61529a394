//! Atomic-liquidity pricing: an affine fee-rate curve over pool
//! utilization, solved in both directions.
//!
//! `rate(u) = intercept + slope * u`, with `u = distributed / allocated`
//! clamped to `[0, 1]`. Rates are fixed-point scaled by [`RAY`]. The fee for
//! a payout is the definite integral of the rate over the interval the net
//! amount traverses; past `u = 1` the remainder is priced flat at
//! `rate(1) = intercept + slope`.
//!
//! Both solve directions preserve the identity `net + fee == gross`
//! exactly, with all rounding against the withdrawer.

use bytemuck::{Pod, Zeroable};

use super::StakeError;

/// Fixed-point denominator for fee rates and the target-liquidity fraction.
pub const RAY: u128 = 1_000_000_000_000;

/// Upper bound accepted for `slope` and `intercept` (100% each).
pub const MAX_RATE: u64 = RAY as u64;

/// Affine fee curve. `slope` and `intercept` are RAY-scaled rates,
/// `min_fee` is a floor in base units.
///
/// Layout (24 bytes):
///   0..8   slope (u64)
///   8..16  intercept (u64)
///   16..24 min_fee (u64)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct FeeCurveParams {
    pub slope: u64,
    pub intercept: u64,
    pub min_fee: u64,
}

impl FeeCurveParams {
    pub fn validate(&self) -> Result<(), StakeError> {
        if self.slope > MAX_RATE || self.intercept > MAX_RATE {
            return Err(StakeError::ParamOutOfRange);
        }
        Ok(())
    }

    /// `rate(1)`, the flat rate past the cap.
    #[inline]
    pub fn rate_max(&self) -> u128 {
        self.slope as u128 + self.intercept as u128
    }
}

/// One priced withdrawal. `net + fee == gross` always.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeeQuote {
    pub gross: u64,
    pub fee: u64,
    pub net: u64,
}

impl FeeQuote {
    pub const ZERO: FeeQuote = FeeQuote {
        gross: 0,
        fee: 0,
        net: 0,
    };
}

#[inline]
fn ceil_div(a: u128, b: u128) -> u128 {
    if b == 0 {
        return 0;
    }
    a.div_ceil(b)
}

/// Exact integral of the rate over a net payout of `net` starting at
/// `drawn` distributed units against a target of `target`. The below-cap
/// segment uses the closed form of the affine integral (the average rate
/// over the interval is `intercept + slope*(2*drawn + net)/(2*target)`);
/// the past-cap tail is flat at `rate(1)`.
pub fn fee_for_net(
    curve: &FeeCurveParams,
    target: u64,
    drawn: u64,
    net: u64,
) -> Result<u64, StakeError> {
    if net == 0 {
        return Ok(0);
    }
    let headroom = target.saturating_sub(drawn);
    let below = net.min(headroom);
    let mut fee: u128 = 0;
    if below > 0 {
        // target > drawn >= 0 here, so the divisor is non-zero
        let traversed = 2u128 * drawn as u128 + below as u128;
        let slope_term = ceil_div(curve.slope as u128 * traversed, 2 * target as u128);
        let avg_rate = curve.intercept as u128 + slope_term;
        fee += ceil_div(below as u128 * avg_rate, RAY);
    }
    let tail = net - below;
    if tail > 0 {
        fee += ceil_div(tail as u128 * curve.rate_max(), RAY);
    }
    u64::try_from(fee).map_err(|_| StakeError::Overflow)
}

#[inline]
fn total_for_net(
    curve: &FeeCurveParams,
    target: u64,
    drawn: u64,
    net: u64,
) -> Result<u128, StakeError> {
    Ok(net as u128 + fee_for_net(curve, target, drawn, net)? as u128)
}

/// Inverse solve: gross draw that delivers exactly `target_net` after fee.
/// Closed form; `gross == target_net + fee` exactly.
pub fn quote_net_to_gross(
    curve: &FeeCurveParams,
    target: u64,
    drawn: u64,
    target_net: u64,
) -> Result<FeeQuote, StakeError> {
    if target_net == 0 {
        return Ok(FeeQuote::ZERO);
    }
    let fee = fee_for_net(curve, target, drawn, target_net)?;
    let gross = target_net.checked_add(fee).ok_or(StakeError::Overflow)?;
    Ok(FeeQuote {
        gross,
        fee,
        net: target_net,
    })
}

/// Forward solve: maximal `net` with `net + fee(net) <= gross`, so the
/// quote never over-delivers and `net + fee == gross` exactly.
///
/// Below the cap the seed comes from a fixed-point refinement of the
/// quadratic `net*(RAY + avg_rate(net)) = gross*RAY`; past the cap the
/// tail seed is `floor(tail_gross*RAY/(RAY + rate_max))`. Either way the
/// seed is then snapped onto the exact integral.
pub fn quote_gross_to_net(
    curve: &FeeCurveParams,
    target: u64,
    drawn: u64,
    gross: u64,
) -> Result<FeeQuote, StakeError> {
    if gross == 0 {
        return Ok(FeeQuote::ZERO);
    }
    let rmax = curve.rate_max();
    let headroom = target.saturating_sub(drawn);
    let fee_at_cap = fee_for_net(curve, target, drawn, headroom)? as u128;
    let gross_at_cap = headroom as u128 + fee_at_cap;

    let seed = if gross as u128 >= gross_at_cap {
        let tail_gross = gross as u128 - gross_at_cap;
        let tail_net = tail_gross * RAY / (RAY + rmax);
        u64::try_from(headroom as u128 + tail_net).map_err(|_| StakeError::Overflow)?
    } else {
        // below the cap; headroom > 0 implies target > 0
        let mut n = gross.min(headroom);
        for _ in 0..4 {
            let traversed = 2u128 * drawn as u128 + n as u128;
            let avg_rate = curve.intercept as u128
                + ceil_div(curve.slope as u128 * traversed, 2 * target as u128);
            let next = gross as u128 * RAY / (RAY + avg_rate);
            n = u64::try_from(next).unwrap_or(u64::MAX).min(headroom);
        }
        n
    };

    let net = snap_to_gross(curve, target, drawn, gross, seed)?;
    Ok(FeeQuote {
        gross,
        fee: gross - net,
        net,
    })
}

/// Snap a seed onto the maximal feasible net for `gross`. Steps are sized
/// from the residual and the worst-case rate so the walk is short, then
/// verified against the exact integral before committing.
fn snap_to_gross(
    curve: &FeeCurveParams,
    target: u64,
    drawn: u64,
    gross: u64,
    seed: u64,
) -> Result<u64, StakeError> {
    let rmax = curve.rate_max();
    let g = gross as u128;
    let mut n = seed.min(gross);
    loop {
        let t = total_for_net(curve, target, drawn, n)?;
        if t <= g {
            break;
        }
        let over = t - g;
        let step = (over * RAY / (RAY + rmax)).max(1);
        n = n.saturating_sub(u64::try_from(step).unwrap_or(u64::MAX));
    }
    loop {
        if n >= gross {
            return Ok(gross.min(n));
        }
        let t = total_for_net(curve, target, drawn, n)?;
        let under = g - t;
        if under == 0 {
            return Ok(n);
        }
        let mut step = u64::try_from(under * RAY / (RAY + rmax)).unwrap_or(u64::MAX).max(1);
        loop {
            let cand = n.saturating_add(step).min(gross);
            if total_for_net(curve, target, drawn, cand)? <= g {
                n = cand;
                break;
            }
            if step == 1 {
                return Ok(n);
            }
            step /= 2;
        }
    }
}

/// Clamp the fee of a quote up to `min_fee`, capped by the gross amount,
/// recomputing net as the residual.
pub fn apply_min_fee(quote: FeeQuote, min_fee: u64) -> FeeQuote {
    if quote.fee >= min_fee {
        return quote;
    }
    let fee = min_fee.min(quote.gross);
    FeeQuote {
        gross: quote.gross,
        fee,
        net: quote.gross - fee,
    }
}
