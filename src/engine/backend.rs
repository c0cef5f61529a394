//! Seam to the external validator/delegation layer.
//!
//! The engine treats reward amounts and active/inactive flags as inputs it
//! cannot mutate; it can only request reward claims and delegation
//! changes. The program wrapper implements this against on-chain stake
//! state; tests plug in mocks.

use super::StakeError;

/// A validator's externally-owned consensus state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConsensusState {
    pub stake: u64,
    pub active: bool,
}

pub trait ValidatorBackend {
    /// The platform round counter. Observed, never produced, by the engine.
    fn current_epoch(&self) -> u64;

    /// Claim accrued rewards for a validator. Returns the claimed amount
    /// in base units; the backend must not report the same rewards twice.
    fn claim_rewards(&self, vote: &[u8; 32]) -> Result<u64, StakeError>;

    fn consensus_state(&self, vote: &[u8; 32]) -> ConsensusState;

    /// Request a delegation of `amount` to `vote`.
    fn delegate(&self, vote: &[u8; 32], amount: u64) -> Result<(), StakeError>;

    /// Request that `amount` of stake on `vote` begin unstaking.
    fn begin_unstake(&self, vote: &[u8; 32], amount: u64) -> Result<(), StakeError>;
}

/// Backend that never yields rewards and accepts every request. Used when
/// no external layer is wired up and as the test default.
pub struct NoOpBackend {
    pub epoch: u64,
}

impl ValidatorBackend for NoOpBackend {
    fn current_epoch(&self) -> u64 {
        self.epoch
    }

    fn claim_rewards(&self, _vote: &[u8; 32]) -> Result<u64, StakeError> {
        Ok(0)
    }

    fn consensus_state(&self, _vote: &[u8; 32]) -> ConsensusState {
        ConsensusState {
            stake: 0,
            active: true,
        }
    }

    fn delegate(&self, _vote: &[u8; 32], _amount: u64) -> Result<(), StakeError> {
        Ok(())
    }

    fn begin_unstake(&self, _vote: &[u8; 32], _amount: u64) -> Result<(), StakeError> {
        Ok(())
    }
}
