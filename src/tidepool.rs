//! Tidepool: single-slab Solana liquid-staking program with an embedded
//! settlement engine.
//!
//! All pool state lives zero-copy in one program-owned slab account:
//! header, config, then the [`engine::StakeEngine`] ledger. Instructions
//! are thin wrappers that validate accounts, move SPL tokens, and call
//! into the engine; the crank is permissionless and resumable.

#![deny(unsafe_code)]

pub mod engine;

// 1. mod constants
pub mod constants {
    use crate::engine::StakeEngine;
    use crate::state::PoolConfig;
    use core::mem::{align_of, size_of};

    pub const MAGIC: u64 = 0x5449_4445_504f_4f4c; // "TIDEPOOL"
    pub const VERSION: u32 = 1;

    pub const HEADER_LEN: usize = 64;
    pub const CONFIG_LEN: usize = size_of::<PoolConfig>();
    pub const ENGINE_ALIGN: usize = align_of::<StakeEngine>();

    pub const fn align_up(x: usize, a: usize) -> usize {
        (x + (a - 1)) & !(a - 1)
    }

    pub const ENGINE_OFF: usize = align_up(HEADER_LEN + CONFIG_LEN, ENGINE_ALIGN);
    pub const ENGINE_LEN: usize = size_of::<StakeEngine>();
    pub const SLAB_LEN: usize = ENGINE_OFF + ENGINE_LEN;

    /// Magic for external stake-view accounts fed to the crank:
    /// "TIDEVIEW".
    pub const STAKE_VIEW_MAGIC: u64 = 0x5449_4445_5649_4557;

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn engine_offset_is_aligned() {
            assert_eq!(ENGINE_OFF % ENGINE_ALIGN, 0);
            assert!(ENGINE_OFF >= HEADER_LEN + CONFIG_LEN);
            assert_eq!(SLAB_LEN, ENGINE_OFF + ENGINE_LEN);
        }
    }
}

// 2. mod zc (zero-copy unsafe island)
#[allow(unsafe_code)]
pub mod zc {
    use crate::constants::{ENGINE_ALIGN, ENGINE_LEN, ENGINE_OFF};
    use crate::engine::StakeEngine;
    use solana_program::program_error::ProgramError;

    #[inline]
    pub fn engine_ref<'a>(data: &'a [u8]) -> Result<&'a StakeEngine, ProgramError> {
        if data.len() < ENGINE_OFF + ENGINE_LEN {
            return Err(ProgramError::InvalidAccountData);
        }
        let ptr = unsafe { data.as_ptr().add(ENGINE_OFF) };
        if (ptr as usize) % ENGINE_ALIGN != 0 {
            return Err(ProgramError::InvalidAccountData);
        }
        Ok(unsafe { &*(ptr as *const StakeEngine) })
    }

    #[inline]
    pub fn engine_mut<'a>(data: &'a mut [u8]) -> Result<&'a mut StakeEngine, ProgramError> {
        if data.len() < ENGINE_OFF + ENGINE_LEN {
            return Err(ProgramError::InvalidAccountData);
        }
        let ptr = unsafe { data.as_mut_ptr().add(ENGINE_OFF) };
        if (ptr as usize) % ENGINE_ALIGN != 0 {
            return Err(ProgramError::InvalidAccountData);
        }
        Ok(unsafe { &mut *(ptr as *mut StakeEngine) })
    }

    #[inline]
    pub fn engine_write(data: &mut [u8], engine: StakeEngine) -> Result<(), ProgramError> {
        if data.len() < ENGINE_OFF + ENGINE_LEN {
            return Err(ProgramError::InvalidAccountData);
        }
        let ptr = unsafe { data.as_mut_ptr().add(ENGINE_OFF) };
        if (ptr as usize) % ENGINE_ALIGN != 0 {
            return Err(ProgramError::InvalidAccountData);
        }
        unsafe { core::ptr::write(ptr as *mut StakeEngine, engine) };
        Ok(())
    }
}

// 3. mod error
pub mod error {
    use crate::engine::StakeError;
    use num_derive::FromPrimitive;
    use solana_program::{decode_error::DecodeError, msg, program_error::ProgramError};
    use thiserror::Error;

    #[derive(Clone, Copy, Debug, Eq, PartialEq, Error, FromPrimitive)]
    pub enum PoolError {
        #[error("slab is not initialized")]
        NotInitialized,
        #[error("slab is already initialized")]
        AlreadyInitialized,
        #[error("slab version mismatch")]
        InvalidVersion,
        #[error("slab length mismatch")]
        InvalidSlabLen,
        #[error("reserve vault account mismatch")]
        InvalidVaultAta,
        #[error("base mint mismatch")]
        InvalidMint,
        #[error("share mint mismatch")]
        InvalidShareMint,
        #[error("expected a signer")]
        ExpectedSigner,
        #[error("expected a writable account")]
        ExpectedWritable,
        #[error("admin signature required")]
        AdminOnly,
        #[error("net payout below the requested minimum")]
        SlippageExceeded,
        // Engine errors mapped:
        #[error("amount must be non-zero")]
        EngineZeroAmount,
        #[error("funded amount mismatch")]
        EngineFundingMismatch,
        #[error("no pending unstake request")]
        EngineRequestNotFound,
        #[error("unstake request not yet eligible")]
        EngineNotYetEligible,
        #[error("capacity exceeded")]
        EngineCapacityExceeded,
        #[error("parameter out of range")]
        EngineParamOutOfRange,
        #[error("validator table full")]
        EngineValidatorTableFull,
        #[error("request table full")]
        EngineRequestTableFull,
        #[error("arithmetic overflow")]
        EngineOverflow,
    }

    impl From<PoolError> for ProgramError {
        fn from(e: PoolError) -> Self {
            ProgramError::Custom(e as u32)
        }
    }

    impl<T> DecodeError<T> for PoolError {
        fn type_of() -> &'static str {
            "PoolError"
        }
    }

    /// Engine errors that carry timing or capacity data log the numbers
    /// before mapping, so callers can self-schedule a retry.
    pub fn map_stake_error(e: StakeError) -> ProgramError {
        let mapped = match e {
            StakeError::ZeroAmount => PoolError::EngineZeroAmount,
            StakeError::FundingMismatch => PoolError::EngineFundingMismatch,
            StakeError::RequestNotFound => PoolError::EngineRequestNotFound,
            StakeError::NotYetEligible { current, required } => {
                msg!("not eligible: current round {}, required round {}", current, required);
                PoolError::EngineNotYetEligible
            }
            StakeError::CapacityExceeded { requested, available } => {
                msg!("capacity exceeded: requested {}, available {}", requested, available);
                PoolError::EngineCapacityExceeded
            }
            StakeError::ParamOutOfRange => PoolError::EngineParamOutOfRange,
            StakeError::ValidatorTableFull => PoolError::EngineValidatorTableFull,
            StakeError::RequestTableFull => PoolError::EngineRequestTableFull,
            StakeError::Overflow => PoolError::EngineOverflow,
        };
        mapped.into()
    }
}

// 4. mod ix
pub mod ix {
    use arrayref::array_ref;
    use solana_program::{program_error::ProgramError, pubkey::Pubkey};

    #[derive(Debug, PartialEq, Eq)]
    pub enum Instruction {
        InitPool {
            target_liquidity_ray: u64,
            fee_slope: u64,
            fee_intercept: u64,
            min_fee: u64,
            unstake_delay_rounds: u64,
            commission_bps: u16,
            management_fee_bps: u16,
        },
        Deposit { amount: u64 },
        RequestUnstake { share_amount: u64 },
        CompleteUnstake,
        InstantUnstake { share_amount: u64, min_net_out: u64 },
        Crank { max_validator_steps: u16 },
        AddValidator { vote: Pubkey },
        SetTargetLiquidity { target_liquidity_ray: u64 },
        SetFeeCurve { slope: u64, intercept: u64, min_fee: u64 },
        SetCommission { commission_bps: u16, management_fee_bps: u16 },
        Donate { amount: u64 },
        ClaimOperatorFees { amount: u64 },
    }

    impl Instruction {
        pub fn decode(input: &[u8]) -> Result<Self, ProgramError> {
            let (&tag, mut rest) = input
                .split_first()
                .ok_or(ProgramError::InvalidInstructionData)?;

            match tag {
                0 => {
                    let target_liquidity_ray = read_u64(&mut rest)?;
                    let fee_slope = read_u64(&mut rest)?;
                    let fee_intercept = read_u64(&mut rest)?;
                    let min_fee = read_u64(&mut rest)?;
                    let unstake_delay_rounds = read_u64(&mut rest)?;
                    let commission_bps = read_u16(&mut rest)?;
                    let management_fee_bps = read_u16(&mut rest)?;
                    Ok(Instruction::InitPool {
                        target_liquidity_ray,
                        fee_slope,
                        fee_intercept,
                        min_fee,
                        unstake_delay_rounds,
                        commission_bps,
                        management_fee_bps,
                    })
                }
                1 => {
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::Deposit { amount })
                }
                2 => {
                    let share_amount = read_u64(&mut rest)?;
                    Ok(Instruction::RequestUnstake { share_amount })
                }
                3 => Ok(Instruction::CompleteUnstake),
                4 => {
                    let share_amount = read_u64(&mut rest)?;
                    let min_net_out = read_u64(&mut rest)?;
                    Ok(Instruction::InstantUnstake {
                        share_amount,
                        min_net_out,
                    })
                }
                5 => {
                    let max_validator_steps = read_u16(&mut rest)?;
                    Ok(Instruction::Crank { max_validator_steps })
                }
                6 => {
                    let vote = read_pubkey(&mut rest)?;
                    Ok(Instruction::AddValidator { vote })
                }
                7 => {
                    let target_liquidity_ray = read_u64(&mut rest)?;
                    Ok(Instruction::SetTargetLiquidity { target_liquidity_ray })
                }
                8 => {
                    let slope = read_u64(&mut rest)?;
                    let intercept = read_u64(&mut rest)?;
                    let min_fee = read_u64(&mut rest)?;
                    Ok(Instruction::SetFeeCurve {
                        slope,
                        intercept,
                        min_fee,
                    })
                }
                9 => {
                    let commission_bps = read_u16(&mut rest)?;
                    let management_fee_bps = read_u16(&mut rest)?;
                    Ok(Instruction::SetCommission {
                        commission_bps,
                        management_fee_bps,
                    })
                }
                10 => {
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::Donate { amount })
                }
                11 => {
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::ClaimOperatorFees { amount })
                }
                _ => Err(ProgramError::InvalidInstructionData),
            }
        }
    }

    fn read_u16(input: &mut &[u8]) -> Result<u16, ProgramError> {
        if input.len() < 2 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(2);
        *input = rest;
        Ok(u16::from_le_bytes(*array_ref![bytes, 0, 2]))
    }

    fn read_u64(input: &mut &[u8]) -> Result<u64, ProgramError> {
        if input.len() < 8 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(8);
        *input = rest;
        Ok(u64::from_le_bytes(*array_ref![bytes, 0, 8]))
    }

    fn read_pubkey(input: &mut &[u8]) -> Result<Pubkey, ProgramError> {
        if input.len() < 32 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(32);
        *input = rest;
        Ok(Pubkey::new_from_array(*array_ref![bytes, 0, 32]))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn decode_crank() {
            let mut data = vec![5u8];
            data.extend_from_slice(&7u16.to_le_bytes());
            assert_eq!(
                Instruction::decode(&data).unwrap(),
                Instruction::Crank { max_validator_steps: 7 }
            );
        }

        #[test]
        fn decode_rejects_unknown_tag_and_short_data() {
            assert!(Instruction::decode(&[99]).is_err());
            assert!(Instruction::decode(&[1, 0, 0]).is_err());
            assert!(Instruction::decode(&[]).is_err());
        }
    }
}

// 5. mod accounts
pub mod accounts {
    use crate::error::PoolError;
    use solana_program::{account_info::AccountInfo, program_error::ProgramError, pubkey::Pubkey};

    pub fn expect_len(accounts: &[AccountInfo], n: usize) -> Result<(), ProgramError> {
        if accounts.len() < n {
            return Err(ProgramError::NotEnoughAccountKeys);
        }
        Ok(())
    }

    pub fn expect_signer(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_signer {
            return Err(PoolError::ExpectedSigner.into());
        }
        Ok(())
    }

    pub fn expect_writable(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_writable {
            return Err(PoolError::ExpectedWritable.into());
        }
        Ok(())
    }

    pub fn expect_owner(ai: &AccountInfo, owner: &Pubkey) -> Result<(), ProgramError> {
        if ai.owner != owner {
            return Err(ProgramError::IllegalOwner);
        }
        Ok(())
    }

    pub fn expect_key(ai: &AccountInfo, expected: &Pubkey) -> Result<(), ProgramError> {
        if ai.key != expected {
            return Err(ProgramError::InvalidArgument);
        }
        Ok(())
    }

    /// Authority over the reserve vault and the share mint.
    pub fn derive_vault_authority(program_id: &Pubkey, slab_key: &Pubkey) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[b"vault", slab_key.as_ref()], program_id)
    }
}

// 6. mod state
pub mod state {
    use crate::constants::{CONFIG_LEN, HEADER_LEN, STAKE_VIEW_MAGIC};
    use bytemuck::{Pod, Zeroable};
    use core::cell::RefMut;
    use solana_program::account_info::AccountInfo;
    use solana_program::program_error::ProgramError;

    /// Layout (64 bytes):
    ///   0..8   magic
    ///   8..12  version
    ///   12     bump
    ///   13..16 _padding
    ///   16..48 admin
    ///   48..64 _reserved
    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct SlabHeader {
        pub magic: u64,
        pub version: u32,
        pub bump: u8,
        pub _padding: [u8; 3],
        pub admin: [u8; 32],
        pub _reserved: [u8; 16],
    }

    /// Layout (104 bytes):
    ///   0..32   base_mint
    ///   32..64  vault_pubkey
    ///   64..96  share_mint
    ///   96      vault_authority_bump
    ///   97..104 _padding
    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct PoolConfig {
        pub base_mint: [u8; 32],
        pub vault_pubkey: [u8; 32],
        pub share_mint: [u8; 32],
        pub vault_authority_bump: u8,
        pub _padding: [u8; 7],
    }

    /// Externally-maintained view of one validator's stake state, fed to
    /// the crank. The engine treats these fields as inputs it cannot
    /// produce; claiming zeroes `unclaimed_rewards` in place.
    ///
    /// Layout (64 bytes):
    ///   0..8   magic ("TIDEVIEW")
    ///   8..40  vote
    ///   40..48 consensus_stake (u64)
    ///   48..56 unclaimed_rewards (u64)
    ///   56     active (u8)
    ///   57..64 _padding
    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct StakeView {
        pub magic: u64,
        pub vote: [u8; 32],
        pub consensus_stake: u64,
        pub unclaimed_rewards: u64,
        pub active: u8,
        pub _padding: [u8; 7],
    }

    pub const STAKE_VIEW_LEN: usize = core::mem::size_of::<StakeView>();

    pub fn slab_data_mut<'a, 'b>(
        ai: &'b AccountInfo<'a>,
    ) -> Result<RefMut<'b, &'a mut [u8]>, ProgramError> {
        Ok(ai.try_borrow_mut_data()?)
    }

    pub fn read_header(data: &[u8]) -> SlabHeader {
        let mut h = SlabHeader::zeroed();
        let src = &data[..HEADER_LEN];
        let dst = bytemuck::bytes_of_mut(&mut h);
        dst.copy_from_slice(src);
        h
    }

    pub fn write_header(data: &mut [u8], h: &SlabHeader) {
        let src = bytemuck::bytes_of(h);
        let dst = &mut data[..HEADER_LEN];
        dst.copy_from_slice(src);
    }

    pub fn read_config(data: &[u8]) -> PoolConfig {
        let mut c = PoolConfig::zeroed();
        let src = &data[HEADER_LEN..HEADER_LEN + CONFIG_LEN];
        let dst = bytemuck::bytes_of_mut(&mut c);
        dst.copy_from_slice(src);
        c
    }

    pub fn write_config(data: &mut [u8], c: &PoolConfig) {
        let src = bytemuck::bytes_of(c);
        let dst = &mut data[HEADER_LEN..HEADER_LEN + CONFIG_LEN];
        dst.copy_from_slice(src);
    }

    pub fn read_stake_view(data: &[u8]) -> Option<StakeView> {
        if data.len() < STAKE_VIEW_LEN {
            return None;
        }
        let view = *bytemuck::from_bytes::<StakeView>(&data[..STAKE_VIEW_LEN]);
        if view.magic != STAKE_VIEW_MAGIC {
            return None;
        }
        Some(view)
    }

    pub fn write_stake_view(data: &mut [u8], view: &StakeView) {
        data[..STAKE_VIEW_LEN].copy_from_slice(bytemuck::bytes_of(view));
    }
}

// 7. mod token (SPL transfers plus share mint/burn)
pub mod token {
    use solana_program::{account_info::AccountInfo, program_error::ProgramError};

    #[cfg(not(any(test, feature = "test")))]
    use solana_program::program::{invoke, invoke_signed};

    #[cfg(any(test, feature = "test"))]
    use solana_program::program_pack::Pack;
    #[cfg(any(test, feature = "test"))]
    use spl_token::state::{Account as TokenAccount, Mint};

    pub fn transfer_in<'a>(
        _token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
    ) -> Result<(), ProgramError> {
        #[cfg(not(any(test, feature = "test")))]
        {
            let ix = spl_token::instruction::transfer(
                _token_program.key,
                source.key,
                dest.key,
                _authority.key,
                &[],
                amount,
            )?;
            invoke(
                &ix,
                &[
                    source.clone(),
                    dest.clone(),
                    _authority.clone(),
                    _token_program.clone(),
                ],
            )
        }
        #[cfg(any(test, feature = "test"))]
        {
            let mut src_data = source.try_borrow_mut_data()?;
            let mut src_state = TokenAccount::unpack(&src_data)?;
            src_state.amount = src_state
                .amount
                .checked_sub(amount)
                .ok_or(ProgramError::InsufficientFunds)?;
            TokenAccount::pack(src_state, &mut src_data)?;

            let mut dst_data = dest.try_borrow_mut_data()?;
            let mut dst_state = TokenAccount::unpack(&dst_data)?;
            dst_state.amount = dst_state
                .amount
                .checked_add(amount)
                .ok_or(ProgramError::InvalidAccountData)?;
            TokenAccount::pack(dst_state, &mut dst_data)?;
            Ok(())
        }
    }

    pub fn transfer_out<'a>(
        _token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
        _signer_seeds: &[&[&[u8]]],
    ) -> Result<(), ProgramError> {
        #[cfg(not(any(test, feature = "test")))]
        {
            let ix = spl_token::instruction::transfer(
                _token_program.key,
                source.key,
                dest.key,
                _authority.key,
                &[],
                amount,
            )?;
            invoke_signed(
                &ix,
                &[
                    source.clone(),
                    dest.clone(),
                    _authority.clone(),
                    _token_program.clone(),
                ],
                _signer_seeds,
            )
        }
        #[cfg(any(test, feature = "test"))]
        {
            let mut src_data = source.try_borrow_mut_data()?;
            let mut src_state = TokenAccount::unpack(&src_data)?;
            src_state.amount = src_state
                .amount
                .checked_sub(amount)
                .ok_or(ProgramError::InsufficientFunds)?;
            TokenAccount::pack(src_state, &mut src_data)?;

            let mut dst_data = dest.try_borrow_mut_data()?;
            let mut dst_state = TokenAccount::unpack(&dst_data)?;
            dst_state.amount = dst_state
                .amount
                .checked_add(amount)
                .ok_or(ProgramError::InvalidAccountData)?;
            TokenAccount::pack(dst_state, &mut dst_data)?;
            Ok(())
        }
    }

    pub fn mint_shares<'a>(
        _token_program: &AccountInfo<'a>,
        mint: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        _mint_authority: &AccountInfo<'a>,
        amount: u64,
        _signer_seeds: &[&[&[u8]]],
    ) -> Result<(), ProgramError> {
        #[cfg(not(any(test, feature = "test")))]
        {
            let ix = spl_token::instruction::mint_to(
                _token_program.key,
                mint.key,
                dest.key,
                _mint_authority.key,
                &[],
                amount,
            )?;
            invoke_signed(
                &ix,
                &[
                    mint.clone(),
                    dest.clone(),
                    _mint_authority.clone(),
                    _token_program.clone(),
                ],
                _signer_seeds,
            )
        }
        #[cfg(any(test, feature = "test"))]
        {
            let mut mint_data = mint.try_borrow_mut_data()?;
            let mut mint_state = Mint::unpack(&mint_data)?;
            mint_state.supply = mint_state
                .supply
                .checked_add(amount)
                .ok_or(ProgramError::InvalidAccountData)?;
            Mint::pack(mint_state, &mut mint_data)?;

            let mut dst_data = dest.try_borrow_mut_data()?;
            let mut dst_state = TokenAccount::unpack(&dst_data)?;
            dst_state.amount = dst_state
                .amount
                .checked_add(amount)
                .ok_or(ProgramError::InvalidAccountData)?;
            TokenAccount::pack(dst_state, &mut dst_data)?;
            Ok(())
        }
    }

    pub fn burn_shares<'a>(
        _token_program: &AccountInfo<'a>,
        account: &AccountInfo<'a>,
        mint: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
    ) -> Result<(), ProgramError> {
        #[cfg(not(any(test, feature = "test")))]
        {
            let ix = spl_token::instruction::burn(
                _token_program.key,
                account.key,
                mint.key,
                _authority.key,
                &[],
                amount,
            )?;
            invoke(
                &ix,
                &[
                    account.clone(),
                    mint.clone(),
                    _authority.clone(),
                    _token_program.clone(),
                ],
            )
        }
        #[cfg(any(test, feature = "test"))]
        {
            let mut acc_data = account.try_borrow_mut_data()?;
            let mut acc_state = TokenAccount::unpack(&acc_data)?;
            acc_state.amount = acc_state
                .amount
                .checked_sub(amount)
                .ok_or(ProgramError::InsufficientFunds)?;
            TokenAccount::pack(acc_state, &mut acc_data)?;

            let mut mint_data = mint.try_borrow_mut_data()?;
            let mut mint_state = Mint::unpack(&mint_data)?;
            mint_state.supply = mint_state
                .supply
                .checked_sub(amount)
                .ok_or(ProgramError::InsufficientFunds)?;
            Mint::pack(mint_state, &mut mint_data)?;
            Ok(())
        }
    }
}

// 8. mod processor
pub mod processor {
    use crate::{
        accounts,
        constants::{MAGIC, SLAB_LEN, VERSION},
        engine::{
            ConsensusState, FeeCurveParams, PoolParams, StakeEngine, StakeError, ValidatorBackend,
        },
        error::{map_stake_error, PoolError},
        ix::Instruction,
        state::{self, PoolConfig, SlabHeader},
        token, zc,
    };
    use solana_program::{
        account_info::AccountInfo,
        entrypoint::ProgramResult,
        msg,
        program_error::ProgramError,
        program_option::COption,
        program_pack::Pack,
        pubkey::Pubkey,
        sysvar::{clock::Clock, Sysvar},
    };

    /// Backend over externally-maintained stake-view accounts passed to
    /// the crank. The platform epoch comes from the Clock sysvar;
    /// delegation intents are logged for the off-chain stake layer.
    struct AccountBackend<'a, 'b> {
        epoch: u64,
        views: &'b [AccountInfo<'a>],
    }

    impl<'a, 'b> AccountBackend<'a, 'b> {
        fn view_for(&self, vote: &[u8; 32]) -> Option<&'b AccountInfo<'a>> {
            self.views.iter().find(|ai| {
                ai.try_borrow_data()
                    .ok()
                    .and_then(|d| state::read_stake_view(&d))
                    .is_some_and(|v| v.vote == *vote)
            })
        }
    }

    impl ValidatorBackend for AccountBackend<'_, '_> {
        fn current_epoch(&self) -> u64 {
            self.epoch
        }

        fn claim_rewards(&self, vote: &[u8; 32]) -> Result<u64, StakeError> {
            let Some(ai) = self.view_for(vote) else {
                return Ok(0);
            };
            let Ok(mut data) = ai.try_borrow_mut_data() else {
                return Ok(0);
            };
            let Some(mut view) = state::read_stake_view(&data) else {
                return Ok(0);
            };
            let claimed = view.unclaimed_rewards;
            view.unclaimed_rewards = 0;
            state::write_stake_view(&mut data, &view);
            Ok(claimed)
        }

        fn consensus_state(&self, vote: &[u8; 32]) -> ConsensusState {
            match self
                .view_for(vote)
                .and_then(|ai| ai.try_borrow_data().ok().and_then(|d| state::read_stake_view(&d)))
            {
                Some(view) => ConsensusState {
                    stake: view.consensus_stake,
                    active: view.active != 0,
                },
                None => ConsensusState {
                    stake: 0,
                    active: true,
                },
            }
        }

        fn delegate(&self, vote: &[u8; 32], amount: u64) -> Result<(), StakeError> {
            msg!("delegate {} to {}", amount, Pubkey::new_from_array(*vote));
            Ok(())
        }

        fn begin_unstake(&self, vote: &[u8; 32], amount: u64) -> Result<(), StakeError> {
            msg!("unstake {} from {}", amount, Pubkey::new_from_array(*vote));
            Ok(())
        }
    }

    fn slab_guard(program_id: &Pubkey, slab: &AccountInfo, data: &[u8]) -> Result<(), ProgramError> {
        accounts::expect_owner(slab, program_id)?;
        if data.len() != SLAB_LEN {
            return Err(PoolError::InvalidSlabLen.into());
        }
        Ok(())
    }

    fn require_initialized(data: &[u8]) -> Result<(), ProgramError> {
        let h = state::read_header(data);
        if h.magic != MAGIC {
            return Err(PoolError::NotInitialized.into());
        }
        if h.version != VERSION {
            return Err(PoolError::InvalidVersion.into());
        }
        Ok(())
    }

    fn require_admin(data: &[u8], signer: &AccountInfo) -> Result<(), ProgramError> {
        accounts::expect_signer(signer)?;
        let h = state::read_header(data);
        if h.admin != signer.key.to_bytes() {
            return Err(PoolError::AdminOnly.into());
        }
        Ok(())
    }

    fn verify_vault(
        a_vault: &AccountInfo,
        expected_owner: &Pubkey,
        expected_mint: &Pubkey,
        expected_pubkey: &Pubkey,
    ) -> Result<(), ProgramError> {
        if a_vault.key != expected_pubkey {
            return Err(PoolError::InvalidVaultAta.into());
        }
        if a_vault.owner != &spl_token::ID {
            return Err(PoolError::InvalidVaultAta.into());
        }
        if a_vault.data_len() != spl_token::state::Account::LEN {
            return Err(PoolError::InvalidVaultAta.into());
        }
        let data = a_vault.try_borrow_data()?;
        let tok = spl_token::state::Account::unpack(&data)?;
        if tok.mint != *expected_mint {
            return Err(PoolError::InvalidMint.into());
        }
        if tok.owner != *expected_owner {
            return Err(PoolError::InvalidVaultAta.into());
        }
        Ok(())
    }

    fn verify_share_mint(
        a_mint: &AccountInfo,
        expected_key: &Pubkey,
        expected_authority: &Pubkey,
    ) -> Result<(), ProgramError> {
        if a_mint.key != expected_key {
            return Err(PoolError::InvalidShareMint.into());
        }
        if a_mint.owner != &spl_token::ID {
            return Err(PoolError::InvalidShareMint.into());
        }
        if a_mint.data_len() != spl_token::state::Mint::LEN {
            return Err(PoolError::InvalidShareMint.into());
        }
        let data = a_mint.try_borrow_data()?;
        let mint = spl_token::state::Mint::unpack(&data)?;
        match mint.mint_authority {
            COption::Some(auth) if auth == *expected_authority => Ok(()),
            _ => Err(PoolError::InvalidShareMint.into()),
        }
    }

    fn vault_balance(a_vault: &AccountInfo) -> Result<u64, ProgramError> {
        let data = a_vault.try_borrow_data()?;
        Ok(spl_token::state::Account::unpack(&data)?.amount)
    }

    pub fn process_instruction<'a, 'b>(
        program_id: &Pubkey,
        accounts: &'b [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        let instruction = Instruction::decode(instruction_data)?;

        match instruction {
            Instruction::InitPool {
                target_liquidity_ray,
                fee_slope,
                fee_intercept,
                min_fee,
                unstake_delay_rounds,
                commission_bps,
                management_fee_bps,
            } => {
                accounts::expect_len(accounts, 6)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];
                let a_mint = &accounts[2];
                let a_vault = &accounts[3];
                let a_share_mint = &accounts[4];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;

                let _ = zc::engine_mut(&mut data)?;

                let header = state::read_header(&data);
                if header.magic == MAGIC {
                    return Err(PoolError::AlreadyInitialized.into());
                }

                let (auth, bump) = accounts::derive_vault_authority(program_id, a_slab.key);
                verify_vault(a_vault, &auth, a_mint.key, a_vault.key)?;
                verify_share_mint(a_share_mint, a_share_mint.key, &auth)?;
                {
                    let mint_data = a_share_mint.try_borrow_data()?;
                    let mint = spl_token::state::Mint::unpack(&mint_data)?;
                    if mint.supply != 0 {
                        return Err(PoolError::InvalidShareMint.into());
                    }
                }

                let params = PoolParams {
                    target_liquidity_ray,
                    fee: FeeCurveParams {
                        slope: fee_slope,
                        intercept: fee_intercept,
                        min_fee,
                    },
                    unstake_delay_rounds,
                    commission_bps,
                    management_fee_bps,
                    _pad: [0; 4],
                };
                params.validate().map_err(map_stake_error)?;

                for b in data.iter_mut() {
                    *b = 0;
                }

                zc::engine_write(&mut data, StakeEngine::new(params))?;

                let config = PoolConfig {
                    base_mint: a_mint.key.to_bytes(),
                    vault_pubkey: a_vault.key.to_bytes(),
                    share_mint: a_share_mint.key.to_bytes(),
                    vault_authority_bump: bump,
                    _padding: [0; 7],
                };
                state::write_config(&mut data, &config);

                let new_header = SlabHeader {
                    magic: MAGIC,
                    version: VERSION,
                    bump,
                    _padding: [0; 3],
                    admin: a_admin.key.to_bytes(),
                    _reserved: [0; 16],
                };
                state::write_header(&mut data, &new_header);
            }
            Instruction::Deposit { amount } => {
                accounts::expect_len(accounts, 8)?;
                let a_user = &accounts[0];
                let a_slab = &accounts[1];
                let a_user_ata = &accounts[2];
                let a_vault = &accounts[3];
                let a_share_mint = &accounts[4];
                let a_user_shares = &accounts[5];
                let a_vault_pda = &accounts[6];
                let a_token = &accounts[7];

                accounts::expect_signer(a_user)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_vault_pda, &auth)?;
                verify_vault(
                    a_vault,
                    &auth,
                    &Pubkey::new_from_array(config.base_mint),
                    &Pubkey::new_from_array(config.vault_pubkey),
                )?;
                verify_share_mint(
                    a_share_mint,
                    &Pubkey::new_from_array(config.share_mint),
                    &auth,
                )?;

                let before = vault_balance(a_vault)?;
                token::transfer_in(a_token, a_user_ata, a_vault, a_user, amount)?;
                let funded = vault_balance(a_vault)?.saturating_sub(before);

                let engine = zc::engine_mut(&mut data)?;
                let shares = engine.deposit(amount, funded).map_err(map_stake_error)?;

                let bump_arr: [u8; 1] = [config.vault_authority_bump];
                let seeds: [&[u8]; 3] = [b"vault", a_slab.key.as_ref(), &bump_arr];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];
                token::mint_shares(
                    a_token,
                    a_share_mint,
                    a_user_shares,
                    a_vault_pda,
                    shares,
                    &signer_seeds,
                )?;
            }
            Instruction::RequestUnstake { share_amount } => {
                accounts::expect_len(accounts, 5)?;
                let a_user = &accounts[0];
                let a_slab = &accounts[1];
                let a_user_shares = &accounts[2];
                let a_share_mint = &accounts[3];
                let a_token = &accounts[4];

                accounts::expect_signer(a_user)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                verify_share_mint(
                    a_share_mint,
                    &Pubkey::new_from_array(config.share_mint),
                    &auth,
                )?;

                let engine = zc::engine_mut(&mut data)?;
                let completion = engine
                    .request_unstake(&a_user.key.to_bytes(), share_amount)
                    .map_err(map_stake_error)?;

                token::burn_shares(a_token, a_user_shares, a_share_mint, a_user, share_amount)?;
                msg!("unstake booked: completion round {}", completion);
            }
            Instruction::CompleteUnstake => {
                accounts::expect_len(accounts, 6)?;
                let a_user = &accounts[0];
                let a_slab = &accounts[1];
                let a_vault = &accounts[2];
                let a_user_ata = &accounts[3];
                let a_vault_pda = &accounts[4];
                let a_token = &accounts[5];

                accounts::expect_signer(a_user)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_vault_pda, &auth)?;
                verify_vault(
                    a_vault,
                    &auth,
                    &Pubkey::new_from_array(config.base_mint),
                    &Pubkey::new_from_array(config.vault_pubkey),
                )?;

                let engine = zc::engine_mut(&mut data)?;
                let payout = engine
                    .complete_unstake(&a_user.key.to_bytes())
                    .map_err(map_stake_error)?;

                let bump_arr: [u8; 1] = [config.vault_authority_bump];
                let seeds: [&[u8]; 3] = [b"vault", a_slab.key.as_ref(), &bump_arr];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];
                token::transfer_out(
                    a_token,
                    a_vault,
                    a_user_ata,
                    a_vault_pda,
                    payout,
                    &signer_seeds,
                )?;
            }
            Instruction::InstantUnstake {
                share_amount,
                min_net_out,
            } => {
                accounts::expect_len(accounts, 8)?;
                let a_user = &accounts[0];
                let a_slab = &accounts[1];
                let a_user_shares = &accounts[2];
                let a_share_mint = &accounts[3];
                let a_vault = &accounts[4];
                let a_user_ata = &accounts[5];
                let a_vault_pda = &accounts[6];
                let a_token = &accounts[7];

                accounts::expect_signer(a_user)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_vault_pda, &auth)?;
                verify_vault(
                    a_vault,
                    &auth,
                    &Pubkey::new_from_array(config.base_mint),
                    &Pubkey::new_from_array(config.vault_pubkey),
                )?;
                verify_share_mint(
                    a_share_mint,
                    &Pubkey::new_from_array(config.share_mint),
                    &auth,
                )?;

                let engine = zc::engine_mut(&mut data)?;
                let quote = engine
                    .instant_unstake(share_amount)
                    .map_err(map_stake_error)?;
                if quote.net < min_net_out {
                    return Err(PoolError::SlippageExceeded.into());
                }

                token::burn_shares(a_token, a_user_shares, a_share_mint, a_user, share_amount)?;

                let bump_arr: [u8; 1] = [config.vault_authority_bump];
                let seeds: [&[u8]; 3] = [b"vault", a_slab.key.as_ref(), &bump_arr];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];
                token::transfer_out(
                    a_token,
                    a_vault,
                    a_user_ata,
                    a_vault_pda,
                    quote.net,
                    &signer_seeds,
                )?;
                msg!("instant unstake: gross {} fee {} net {}", quote.gross, quote.fee, quote.net);
            }
            Instruction::Crank { max_validator_steps } => {
                accounts::expect_len(accounts, 3)?;
                let a_caller = &accounts[0];
                let a_slab = &accounts[1];
                let a_clock = &accounts[2];

                // permissionless, but a signer so the caller is attributable
                accounts::expect_signer(a_caller)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;

                #[cfg(feature = "cu-audit")]
                solana_program::log::sol_log_compute_units();

                let clock = Clock::from_account_info(a_clock)?;
                let backend = AccountBackend {
                    epoch: clock.epoch,
                    views: &accounts[3..],
                };

                let engine = zc::engine_mut(&mut data)?;
                let settled = engine
                    .crank(&backend, max_validator_steps)
                    .map_err(map_stake_error)?;

                #[cfg(feature = "cu-audit")]
                solana_program::log::sol_log_compute_units();

                msg!("crank: fully_settled={}", settled);
            }
            Instruction::AddValidator { vote } => {
                accounts::expect_len(accounts, 2)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                require_admin(&data, a_admin)?;

                let engine = zc::engine_mut(&mut data)?;
                let idx = engine
                    .add_validator(&vote.to_bytes())
                    .map_err(map_stake_error)?;
                msg!("validator {} registered at index {}", vote, idx);
            }
            Instruction::SetTargetLiquidity { target_liquidity_ray } => {
                accounts::expect_len(accounts, 2)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                require_admin(&data, a_admin)?;

                let engine = zc::engine_mut(&mut data)?;
                let mut params = engine.params;
                params.target_liquidity_ray = target_liquidity_ray;
                params.validate().map_err(map_stake_error)?;
                engine.params = params;
            }
            Instruction::SetFeeCurve {
                slope,
                intercept,
                min_fee,
            } => {
                accounts::expect_len(accounts, 2)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                require_admin(&data, a_admin)?;

                let engine = zc::engine_mut(&mut data)?;
                let mut params = engine.params;
                params.fee = FeeCurveParams {
                    slope,
                    intercept,
                    min_fee,
                };
                params.validate().map_err(map_stake_error)?;
                engine.params = params;
            }
            Instruction::SetCommission {
                commission_bps,
                management_fee_bps,
            } => {
                accounts::expect_len(accounts, 2)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                require_admin(&data, a_admin)?;

                let engine = zc::engine_mut(&mut data)?;
                let mut params = engine.params;
                params.commission_bps = commission_bps;
                params.management_fee_bps = management_fee_bps;
                params.validate().map_err(map_stake_error)?;
                engine.params = params;
            }
            Instruction::Donate { amount } => {
                accounts::expect_len(accounts, 5)?;
                let a_donor = &accounts[0];
                let a_slab = &accounts[1];
                let a_donor_ata = &accounts[2];
                let a_vault = &accounts[3];
                let a_token = &accounts[4];

                accounts::expect_signer(a_donor)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                verify_vault(
                    a_vault,
                    &auth,
                    &Pubkey::new_from_array(config.base_mint),
                    &Pubkey::new_from_array(config.vault_pubkey),
                )?;

                let before = vault_balance(a_vault)?;
                token::transfer_in(a_token, a_donor_ata, a_vault, a_donor, amount)?;
                let funded = vault_balance(a_vault)?.saturating_sub(before);

                let engine = zc::engine_mut(&mut data)?;
                engine.donate(amount, funded).map_err(map_stake_error)?;
            }
            Instruction::ClaimOperatorFees { amount } => {
                accounts::expect_len(accounts, 6)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];
                let a_vault = &accounts[2];
                let a_dest = &accounts[3];
                let a_vault_pda = &accounts[4];
                let a_token = &accounts[5];

                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                require_admin(&data, a_admin)?;
                let config = state::read_config(&data);

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_vault_pda, &auth)?;
                verify_vault(
                    a_vault,
                    &auth,
                    &Pubkey::new_from_array(config.base_mint),
                    &Pubkey::new_from_array(config.vault_pubkey),
                )?;

                let engine = zc::engine_mut(&mut data)?;
                engine.claim_operator_fees(amount).map_err(map_stake_error)?;

                let bump_arr: [u8; 1] = [config.vault_authority_bump];
                let seeds: [&[u8]; 3] = [b"vault", a_slab.key.as_ref(), &bump_arr];
                let signer_seeds: [&[&[u8]]; 1] = [&seeds];
                token::transfer_out(
                    a_token,
                    a_vault,
                    a_dest,
                    a_vault_pda,
                    amount,
                    &signer_seeds,
                )?;
            }
        }
        Ok(())
    }
}

// 9. mod entrypoint
#[cfg(not(feature = "no-entrypoint"))]
pub mod entrypoint {
    use crate::processor;
    use solana_program::{
        account_info::AccountInfo, entrypoint, entrypoint::ProgramResult, pubkey::Pubkey,
    };

    entrypoint!(process_instruction);

    fn process_instruction<'a>(
        program_id: &Pubkey,
        accounts: &'a [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        processor::process_instruction(program_id, accounts, instruction_data)
    }
}

#[cfg(not(feature = "no-entrypoint"))]
solana_security_txt::security_txt! {
    name: "Tidepool",
    project_url: "https://github.com/tidepool-labs/tidepool-prog",
    contacts: "email:security@tidepool.so",
    policy: "https://github.com/tidepool-labs/tidepool-prog/blob/main/SECURITY.md",
    preferred_languages: "en"
}
