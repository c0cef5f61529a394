//! Per-holder delayed-withdrawal requests.
//!
//! A fixed table keyed by the holder's 32-byte key. Amounts are stored in
//! base units, converted at request time. Repeat requests from the same
//! holder accumulate additively and the stored completion round only ever
//! moves forward.

use bytemuck::{Pod, Zeroable};

use super::{StakeError, MAX_REQUESTS};

/// One holder's accumulated delayed-withdrawal claim.
///
/// Layout (48 bytes):
///   0..32  owner
///   32..40 amount (u64, base units)
///   40..48 completion_round (u64)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct UnstakeRequest {
    pub owner: [u8; 32],
    pub amount: u64,
    pub completion_round: u64,
}

impl UnstakeRequest {
    #[inline]
    pub fn is_used(&self) -> bool {
        self.amount > 0
    }
}

/// Fixed request table. A zero-amount entry is a free slot.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct RequestTable {
    pub entries: [UnstakeRequest; MAX_REQUESTS],
}

impl RequestTable {
    pub fn get(&self, owner: &[u8; 32]) -> Option<&UnstakeRequest> {
        self.entries
            .iter()
            .find(|r| r.is_used() && r.owner == *owner)
    }

    /// Create or extend a request. Returns the stored completion round,
    /// which is the maximum of the prior one and `completion_round`.
    pub fn book(
        &mut self,
        owner: &[u8; 32],
        amount: u64,
        completion_round: u64,
    ) -> Result<u64, StakeError> {
        if amount == 0 {
            return Err(StakeError::ZeroAmount);
        }
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|r| r.is_used() && r.owner == *owner)
        {
            existing.amount = existing
                .amount
                .checked_add(amount)
                .ok_or(StakeError::Overflow)?;
            existing.completion_round = existing.completion_round.max(completion_round);
            return Ok(existing.completion_round);
        }
        let slot = self
            .entries
            .iter_mut()
            .find(|r| !r.is_used())
            .ok_or(StakeError::RequestTableFull)?;
        *slot = UnstakeRequest {
            owner: *owner,
            amount,
            completion_round,
        };
        Ok(completion_round)
    }

    /// Remove and return a holder's request.
    pub fn take(&mut self, owner: &[u8; 32]) -> Option<UnstakeRequest> {
        let slot = self
            .entries
            .iter_mut()
            .find(|r| r.is_used() && r.owner == *owner)?;
        let out = *slot;
        *slot = UnstakeRequest::zeroed();
        Some(out)
    }

    pub fn count(&self) -> usize {
        self.entries.iter().filter(|r| r.is_used()).count()
    }
}
