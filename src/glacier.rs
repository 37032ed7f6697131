//! Glacier: single-file Solana program with an embedded reserve/pricing engine.
//!
//! A pool of reserve tokens is split into an active and an implicit dormant
//! tranche. Participation tokens are minted against incoming value at a price
//! derived from the split, burned on redemption, and the dormant tranche is
//! released into the active pool only through a time-gated, magnitude-capped
//! thaw that rewards the calling keeper. Holders accrue slot-weighted yield
//! claimable above a protected reserve floor.

#![no_std]
#![deny(unsafe_code)]

pub mod engine;

// 1. mod constants
pub mod constants {
    use crate::engine::ReserveEngine;
    use crate::state::{PoolConfig, SlabHeader};
    use core::mem::{align_of, size_of};

    pub const MAGIC: u64 = 0x474c4143_49455231; // "GLACIER1"
    pub const VERSION: u32 = 1;

    pub const HEADER_LEN: usize = size_of::<SlabHeader>();
    pub const CONFIG_LEN: usize = size_of::<PoolConfig>();
    pub const ENGINE_ALIGN: usize = align_of::<ReserveEngine>();

    pub const fn align_up(x: usize, a: usize) -> usize {
        (x + (a - 1)) & !(a - 1)
    }

    pub const ENGINE_OFF: usize = align_up(HEADER_LEN + CONFIG_LEN, ENGINE_ALIGN);
    pub const ENGINE_LEN: usize = size_of::<ReserveEngine>();
    pub const SLAB_LEN: usize = ENGINE_OFF + ENGINE_LEN;
}

// 2. mod zc (Zero-Copy unsafe island)
#[allow(unsafe_code)]
pub mod zc {
    use crate::constants::{ENGINE_ALIGN, ENGINE_LEN, ENGINE_OFF};
    use crate::engine::ReserveEngine;
    use solana_program::program_error::ProgramError;

    #[inline]
    pub fn engine_ref<'a>(data: &'a [u8]) -> Result<&'a ReserveEngine, ProgramError> {
        if data.len() < ENGINE_OFF + ENGINE_LEN {
            return Err(ProgramError::InvalidAccountData);
        }
        let ptr = unsafe { data.as_ptr().add(ENGINE_OFF) };
        if (ptr as usize) % ENGINE_ALIGN != 0 {
            return Err(ProgramError::InvalidAccountData);
        }
        Ok(unsafe { &*(ptr as *const ReserveEngine) })
    }

    #[inline]
    pub fn engine_mut<'a>(data: &'a mut [u8]) -> Result<&'a mut ReserveEngine, ProgramError> {
        if data.len() < ENGINE_OFF + ENGINE_LEN {
            return Err(ProgramError::InvalidAccountData);
        }
        let ptr = unsafe { data.as_mut_ptr().add(ENGINE_OFF) };
        if (ptr as usize) % ENGINE_ALIGN != 0 {
            return Err(ProgramError::InvalidAccountData);
        }
        Ok(unsafe { &mut *(ptr as *mut ReserveEngine) })
    }
}

// 3. mod error
pub mod error {
    use crate::engine::ReserveError;
    use num_derive::FromPrimitive;
    use solana_program::program_error::ProgramError;

    #[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive)]
    pub enum GlacierError {
        InvalidVersion,
        AlreadyInitialized,
        NotInitialized,
        InvalidSlabLen,
        InvalidVaultAta,
        InvalidMint,
        ExpectedSigner,
        ExpectedWritable,
        Unauthorized,
        Paused,
        ReentrantCall,
        InvalidParamKey,
        // Engine errors mapped:
        EngineZeroAmount,
        EngineOverflow,
        EngineSlabFull,
        EngineHolderNotFound,
        EngineHolderExists,
        EngineInsufficientBalance,
        EngineInsufficientActiveReserve,
        EngineHalted,
        EngineCooldownActive,
        EngineThawTooSoon,
        EngineZeroOutput,
        EngineSlippageExceeded,
        EngineCapExceeded,
        EngineNothingToClaim,
        EngineFloorBreach,
        EngineInvalidParam,
    }

    impl From<GlacierError> for ProgramError {
        fn from(e: GlacierError) -> Self {
            ProgramError::Custom(e as u32)
        }
    }

    pub fn map_reserve_error(e: ReserveError) -> ProgramError {
        let err = match e {
            ReserveError::ZeroAmount => GlacierError::EngineZeroAmount,
            ReserveError::Overflow => GlacierError::EngineOverflow,
            ReserveError::SlabFull => GlacierError::EngineSlabFull,
            ReserveError::HolderNotFound => GlacierError::EngineHolderNotFound,
            ReserveError::HolderExists => GlacierError::EngineHolderExists,
            ReserveError::InsufficientBalance => GlacierError::EngineInsufficientBalance,
            ReserveError::InsufficientActiveReserve => {
                GlacierError::EngineInsufficientActiveReserve
            }
            ReserveError::Halted => GlacierError::EngineHalted,
            ReserveError::CooldownActive => GlacierError::EngineCooldownActive,
            ReserveError::ThawTooSoon => GlacierError::EngineThawTooSoon,
            ReserveError::ZeroOutput => GlacierError::EngineZeroOutput,
            ReserveError::SlippageExceeded => GlacierError::EngineSlippageExceeded,
            ReserveError::CapExceeded => GlacierError::EngineCapExceeded,
            ReserveError::NothingToClaim => GlacierError::EngineNothingToClaim,
            ReserveError::FloorBreach => GlacierError::EngineFloorBreach,
            ReserveError::InvalidParam => GlacierError::EngineInvalidParam,
        };
        ProgramError::Custom(err as u32)
    }
}

// 4. mod ix
pub mod ix {
    use crate::engine::{PoolParams, U128};
    use arrayref::array_ref;
    use solana_program::{program_error::ProgramError, pubkey::Pubkey};

    #[derive(Debug)]
    pub enum Instruction {
        InitPool {
            timelock: Pubkey,
            params: PoolParams,
            initial_total: u64,
            initial_active: u64,
        },
        Deposit {
            amount: u64,
        },
        InitHolder,
        Buy {
            holder_idx: u16,
            amount_in: u64,
            min_tokens_out: u128,
        },
        Sell {
            holder_idx: u16,
            token_amount: u128,
            min_value_out: u64,
        },
        Thaw,
        ClaimYield {
            holder_idx: u16,
        },
        SyncYield {
            holder_idx: u16,
        },
        TransferShares {
            from_idx: u16,
            to_idx: u16,
            amount: u128,
        },
        SetParam {
            key: u8,
            value: u128,
        },
        SetTimelock {
            timelock: Pubkey,
        },
        SetPaused {
            paused: u8,
        },
        EmergencyDrain {
            amount: u64,
        },
    }

    impl Instruction {
        pub fn decode(input: &[u8]) -> Result<Self, ProgramError> {
            let (&tag, mut rest) = input
                .split_first()
                .ok_or(ProgramError::InvalidInstructionData)?;

            match tag {
                0 => {
                    let timelock = read_pubkey(&mut rest)?;
                    let params = read_pool_params(&mut rest)?;
                    let initial_total = read_u64(&mut rest)?;
                    let initial_active = read_u64(&mut rest)?;
                    Ok(Instruction::InitPool {
                        timelock,
                        params,
                        initial_total,
                        initial_active,
                    })
                }
                1 => {
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::Deposit { amount })
                }
                2 => Ok(Instruction::InitHolder),
                3 => {
                    let holder_idx = read_u16(&mut rest)?;
                    let amount_in = read_u64(&mut rest)?;
                    let min_tokens_out = read_u128(&mut rest)?;
                    Ok(Instruction::Buy {
                        holder_idx,
                        amount_in,
                        min_tokens_out,
                    })
                }
                4 => {
                    let holder_idx = read_u16(&mut rest)?;
                    let token_amount = read_u128(&mut rest)?;
                    let min_value_out = read_u64(&mut rest)?;
                    Ok(Instruction::Sell {
                        holder_idx,
                        token_amount,
                        min_value_out,
                    })
                }
                5 => Ok(Instruction::Thaw),
                6 => {
                    let holder_idx = read_u16(&mut rest)?;
                    Ok(Instruction::ClaimYield { holder_idx })
                }
                7 => {
                    let holder_idx = read_u16(&mut rest)?;
                    Ok(Instruction::SyncYield { holder_idx })
                }
                8 => {
                    let from_idx = read_u16(&mut rest)?;
                    let to_idx = read_u16(&mut rest)?;
                    let amount = read_u128(&mut rest)?;
                    Ok(Instruction::TransferShares {
                        from_idx,
                        to_idx,
                        amount,
                    })
                }
                9 => {
                    let key = read_u8(&mut rest)?;
                    let value = read_u128(&mut rest)?;
                    Ok(Instruction::SetParam { key, value })
                }
                10 => {
                    let timelock = read_pubkey(&mut rest)?;
                    Ok(Instruction::SetTimelock { timelock })
                }
                11 => {
                    let paused = read_u8(&mut rest)?;
                    Ok(Instruction::SetPaused { paused })
                }
                12 => {
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::EmergencyDrain { amount })
                }
                _ => Err(ProgramError::InvalidInstructionData),
            }
        }
    }

    fn read_u8(input: &mut &[u8]) -> Result<u8, ProgramError> {
        let (&val, rest) = input
            .split_first()
            .ok_or(ProgramError::InvalidInstructionData)?;
        *input = rest;
        Ok(val)
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

    fn read_u128(input: &mut &[u8]) -> Result<u128, ProgramError> {
        if input.len() < 16 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(16);
        *input = rest;
        Ok(u128::from_le_bytes(*array_ref![bytes, 0, 16]))
    }

    fn read_pubkey(input: &mut &[u8]) -> Result<Pubkey, ProgramError> {
        if input.len() < 32 {
            return Err(ProgramError::InvalidInstructionData);
        }
        let (bytes, rest) = input.split_at(32);
        *input = rest;
        Ok(Pubkey::new_from_array(*array_ref![bytes, 0, 32]))
    }

    fn read_pool_params(input: &mut &[u8]) -> Result<PoolParams, ProgramError> {
        Ok(PoolParams {
            fee_bps: read_u64(input)?,
            caller_reward_bps: read_u64(input)?,
            max_mint_per_tx: U128::new(read_u128(input)?),
            min_active: U128::new(read_u128(input)?),
            halt_below: U128::new(read_u128(input)?),
            thaw_interval_sec: read_u64(input)?,
            lambda_num: read_u64(input)?,
            lambda_den: read_u64(input)?,
            yield_num: read_u64(input)?,
            yield_den: read_u64(input)?,
            min_slots_between_trades: read_u64(input)?,
            protected_floor: U128::new(read_u128(input)?),
        })
    }
}

// 5. mod accounts (validation helpers)
pub mod accounts {
    use crate::error::GlacierError;
    use solana_program::{
        account_info::AccountInfo, program_error::ProgramError, pubkey::Pubkey,
    };

    pub fn expect_len(accounts: &[AccountInfo], n: usize) -> Result<(), ProgramError> {
        if accounts.len() < n {
            return Err(ProgramError::NotEnoughAccountKeys);
        }
        Ok(())
    }

    pub fn expect_signer(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_signer {
            return Err(GlacierError::ExpectedSigner.into());
        }
        Ok(())
    }

    pub fn expect_writable(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_writable {
            return Err(GlacierError::ExpectedWritable.into());
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

    pub fn derive_vault_authority(program_id: &Pubkey, slab_key: &Pubkey) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[b"vault", slab_key.as_ref()], program_id)
    }
}

// 6. mod state
pub mod state {
    use crate::constants::{CONFIG_LEN, HEADER_LEN};
    use bytemuck::{Pod, Zeroable};
    use core::cell::RefMut;
    use solana_program::account_info::AccountInfo;
    use solana_program::program_error::ProgramError;

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct SlabHeader {
        pub magic: u64,
        pub version: u32,
        pub bump: u8,
        /// Pause gate: all non-admin mutating instructions reject while set.
        pub paused: u8,
        /// Reentrancy flag: held across every state-mutating instruction.
        pub locked: u8,
        pub _padding: u8,
        pub admin: [u8; 32],
        pub timelock: [u8; 32],
        pub _reserved: [u8; 16],
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct PoolConfig {
        pub reserve_mint: [u8; 32],
        pub vault_pubkey: [u8; 32],
        pub vault_authority_bump: u8,
        pub _padding: [u8; 7],
    }

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
}

// 7. mod vault (reserve custody via SPL token)
pub mod vault {
    use solana_program::{account_info::AccountInfo, program_error::ProgramError};

    #[cfg(not(test))]
    use solana_program::program::{invoke, invoke_signed};

    #[cfg(test)]
    use solana_program::program_pack::Pack;
    #[cfg(test)]
    use spl_token::state::Account as TokenAccount;

    /// Direct balance shuffle standing in for the transfer CPI on the host,
    /// where `invoke` is a stub.
    #[cfg(test)]
    fn shift(source: &AccountInfo, dest: &AccountInfo, amount: u64) -> Result<(), ProgramError> {
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

    /// Pull `amount` of reserve from a user-signed source into the vault.
    pub fn pull<'a>(
        _token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
    ) -> Result<(), ProgramError> {
        #[cfg(not(test))]
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
        #[cfg(test)]
        shift(source, dest, amount)
    }

    /// Pay `amount` of reserve out of the vault, signed by the vault
    /// authority PDA. Issued only after all slab mutations are complete.
    pub fn payout<'a>(
        _token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
        _signer_seeds: &[&[&[u8]]],
    ) -> Result<(), ProgramError> {
        #[cfg(not(test))]
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
        #[cfg(test)]
        shift(source, dest, amount)
    }
}

// 8. mod events (notifications for off-chain indexing)
pub mod events {
    use solana_program::log::sol_log_data;
    use solana_program::pubkey::Pubkey;

    pub const BOUGHT: u8 = 1;
    pub const SOLD: u8 = 2;
    pub const THAW_RELEASED: u8 = 3;
    pub const YIELD_ACCRUED: u8 = 4;
    pub const YIELD_CLAIMED: u8 = 5;
    pub const EMERGENCY_DRAIN: u8 = 6;
    pub const HOLDER_INITIALIZED: u8 = 7;

    fn put_u128(buf: &mut [u8], off: usize, v: u128) {
        buf[off..off + 16].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u64(buf: &mut [u8], off: usize, v: u64) {
        buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    fn put_key(buf: &mut [u8], off: usize, key: &Pubkey) {
        buf[off..off + 32].copy_from_slice(key.as_ref());
    }

    pub fn bought(
        holder: &Pubkey,
        value_in: u64,
        fee: u128,
        minted: u128,
        total_after: u128,
        active_after: u128,
    ) {
        let mut buf = [0u8; 105];
        buf[0] = BOUGHT;
        put_key(&mut buf, 1, holder);
        put_u64(&mut buf, 33, value_in);
        put_u128(&mut buf, 41, fee);
        put_u128(&mut buf, 57, minted);
        put_u128(&mut buf, 73, total_after);
        put_u128(&mut buf, 89, active_after);
        sol_log_data(&[&buf]);
    }

    pub fn sold(
        holder: &Pubkey,
        tokens_in: u128,
        fee: u128,
        net_out: u128,
        total_after: u128,
        active_after: u128,
    ) {
        let mut buf = [0u8; 113];
        buf[0] = SOLD;
        put_key(&mut buf, 1, holder);
        put_u128(&mut buf, 33, tokens_in);
        put_u128(&mut buf, 49, fee);
        put_u128(&mut buf, 65, net_out);
        put_u128(&mut buf, 81, total_after);
        put_u128(&mut buf, 97, active_after);
        sol_log_data(&[&buf]);
    }

    pub fn thaw_released(caller: &Pubkey, released: u128, reward: u128, active_after: u128) {
        let mut buf = [0u8; 81];
        buf[0] = THAW_RELEASED;
        put_key(&mut buf, 1, caller);
        put_u128(&mut buf, 33, released);
        put_u128(&mut buf, 49, reward);
        put_u128(&mut buf, 65, active_after);
        sol_log_data(&[&buf]);
    }

    pub fn yield_accrued(holder: &Pubkey, amount: u128, accrued_total: u128) {
        let mut buf = [0u8; 65];
        buf[0] = YIELD_ACCRUED;
        put_key(&mut buf, 1, holder);
        put_u128(&mut buf, 33, amount);
        put_u128(&mut buf, 49, accrued_total);
        sol_log_data(&[&buf]);
    }

    pub fn yield_claimed(holder: &Pubkey, paid: u128, total_after: u128) {
        let mut buf = [0u8; 65];
        buf[0] = YIELD_CLAIMED;
        put_key(&mut buf, 1, holder);
        put_u128(&mut buf, 33, paid);
        put_u128(&mut buf, 49, total_after);
        sol_log_data(&[&buf]);
    }

    pub fn emergency_drain(to: &Pubkey, amount: u64, total_after: u128) {
        let mut buf = [0u8; 57];
        buf[0] = EMERGENCY_DRAIN;
        put_key(&mut buf, 1, to);
        put_u64(&mut buf, 33, amount);
        put_u128(&mut buf, 41, total_after);
        sol_log_data(&[&buf]);
    }

    pub fn holder_initialized(owner: &Pubkey, idx: u16) {
        let mut buf = [0u8; 35];
        buf[0] = HOLDER_INITIALIZED;
        put_key(&mut buf, 1, owner);
        buf[33..35].copy_from_slice(&idx.to_le_bytes());
        sol_log_data(&[&buf]);
    }
}

// 9. mod processor
pub mod processor {
    use crate::{
        accounts,
        constants::{MAGIC, SLAB_LEN, VERSION},
        engine::{ParamKey, ReserveEngine},
        error::{map_reserve_error, GlacierError},
        events,
        ix::Instruction,
        state::{self, PoolConfig, SlabHeader},
        vault, zc,
    };
    use num_traits::FromPrimitive;
    use solana_program::{
        account_info::AccountInfo,
        entrypoint::ProgramResult,
        program_error::ProgramError,
        program_pack::Pack,
        pubkey::Pubkey,
        sysvar::{clock::Clock, Sysvar},
    };

    fn slab_guard(program_id: &Pubkey, slab: &AccountInfo, data: &[u8]) -> Result<(), ProgramError> {
        accounts::expect_owner(slab, program_id)?;
        if data.len() != SLAB_LEN {
            return Err(GlacierError::InvalidSlabLen.into());
        }
        Ok(())
    }

    fn require_initialized(data: &[u8]) -> Result<SlabHeader, ProgramError> {
        let h = state::read_header(data);
        if h.magic != MAGIC {
            return Err(GlacierError::NotInitialized.into());
        }
        if h.version != VERSION {
            return Err(GlacierError::InvalidVersion.into());
        }
        Ok(h)
    }

    fn require_not_paused(h: &SlabHeader) -> Result<(), ProgramError> {
        if h.paused != 0 {
            return Err(GlacierError::Paused.into());
        }
        Ok(())
    }

    fn require_admin(h: &SlabHeader, caller: &AccountInfo) -> Result<(), ProgramError> {
        accounts::expect_signer(caller)?;
        if Pubkey::new_from_array(h.admin) != *caller.key {
            return Err(GlacierError::Unauthorized.into());
        }
        Ok(())
    }

    fn check_holder_owner(
        engine: &ReserveEngine,
        idx: u16,
        key: &Pubkey,
    ) -> Result<(), ProgramError> {
        let holder = engine.holder(idx).map_err(map_reserve_error)?;
        if Pubkey::new_from_array(holder.owner) != *key {
            return Err(GlacierError::Unauthorized.into());
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
            return Err(GlacierError::InvalidVaultAta.into());
        }
        if a_vault.owner != &spl_token::ID {
            return Err(GlacierError::InvalidVaultAta.into());
        }
        if a_vault.data_len() != spl_token::state::Account::LEN {
            return Err(GlacierError::InvalidVaultAta.into());
        }

        let data = a_vault.try_borrow_data()?;
        let tok = spl_token::state::Account::unpack(&data)?;
        if tok.mint != *expected_mint {
            return Err(GlacierError::InvalidMint.into());
        }
        if tok.owner != *expected_owner {
            return Err(GlacierError::InvalidVaultAta.into());
        }
        Ok(())
    }

    fn expect_reserve_ata(ata: &AccountInfo, expected_mint: &Pubkey) -> Result<(), ProgramError> {
        if ata.owner != &spl_token::ID {
            return Err(GlacierError::InvalidVaultAta.into());
        }
        let data = ata.try_borrow_data()?;
        let tok = spl_token::state::Account::unpack(&data)?;
        if tok.mint != *expected_mint {
            return Err(GlacierError::InvalidMint.into());
        }
        Ok(())
    }

    /// Hold the reentrancy flag across a state-mutating section. The flag is
    /// written into the slab itself, so a nested entry (e.g. through a CPI
    /// cycle) observes it and is rejected; on failure the transaction revert
    /// clears it together with every other mutation.
    fn with_lock<T>(
        data: &mut [u8],
        f: impl FnOnce(&mut [u8]) -> Result<T, ProgramError>,
    ) -> Result<T, ProgramError> {
        let mut h = state::read_header(data);
        if h.locked != 0 {
            return Err(GlacierError::ReentrantCall.into());
        }
        h.locked = 1;
        state::write_header(data, &h);

        let res = f(data);

        let mut h = state::read_header(data);
        h.locked = 0;
        state::write_header(data, &h);
        res
    }

    fn clock_from(ai: &AccountInfo) -> Result<(u64, u64), ProgramError> {
        let clock = Clock::from_account_info(ai)?;
        let ts = if clock.unix_timestamp > 0 {
            clock.unix_timestamp as u64
        } else {
            0
        };
        Ok((clock.slot, ts))
    }

    pub fn process_instruction<'a, 'b>(
        program_id: &Pubkey,
        accounts: &'b [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        let instruction = Instruction::decode(instruction_data)?;

        match instruction {
            Instruction::InitPool {
                timelock,
                params,
                initial_total,
                initial_active,
            } => {
                accounts::expect_len(accounts, 7)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];
                let a_mint = &accounts[2];
                let a_vault = &accounts[3];
                let a_admin_ata = &accounts[4];
                let a_token = &accounts[5];
                let a_clock = &accounts[6];

                accounts::expect_signer(a_admin)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;

                let header = state::read_header(&data);
                if header.magic == MAGIC {
                    return Err(GlacierError::AlreadyInitialized.into());
                }

                let (auth, bump) = accounts::derive_vault_authority(program_id, a_slab.key);
                verify_vault(a_vault, &auth, a_mint.key, a_vault.key)?;

                let (_, now_ts) = clock_from(a_clock)?;

                for b in data.iter_mut() {
                    *b = 0;
                }

                let engine = zc::engine_mut(&mut data)?;
                engine
                    .init_in_place(
                        params,
                        initial_total as u128,
                        initial_active as u128,
                        now_ts,
                    )
                    .map_err(map_reserve_error)?;

                // Construction funds the pool: the dormant tranche exists
                // from day one or not at all.
                vault::pull(a_token, a_admin_ata, a_vault, a_admin, initial_total)?;

                let config = PoolConfig {
                    reserve_mint: a_mint.key.to_bytes(),
                    vault_pubkey: a_vault.key.to_bytes(),
                    vault_authority_bump: bump,
                    _padding: [0; 7],
                };
                state::write_config(&mut data, &config);

                let new_header = SlabHeader {
                    magic: MAGIC,
                    version: VERSION,
                    bump,
                    paused: 0,
                    locked: 0,
                    _padding: 0,
                    admin: a_admin.key.to_bytes(),
                    timelock: timelock.to_bytes(),
                    _reserved: [0; 16],
                };
                state::write_header(&mut data, &new_header);
            }
            Instruction::Deposit { amount } => {
                accounts::expect_len(accounts, 5)?;
                let a_payer = &accounts[0];
                let a_slab = &accounts[1];
                let a_payer_ata = &accounts[2];
                let a_vault = &accounts[3];
                let a_token = &accounts[4];

                accounts::expect_signer(a_payer)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                let header = require_initialized(&data)?;
                require_not_paused(&header)?;
                let config = state::read_config(&data);

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                verify_vault(
                    a_vault,
                    &auth,
                    &Pubkey::new_from_array(config.reserve_mint),
                    &Pubkey::new_from_array(config.vault_pubkey),
                )?;

                with_lock(&mut data, |d| {
                    vault::pull(a_token, a_payer_ata, a_vault, a_payer, amount)?;
                    let engine = zc::engine_mut(d)?;
                    engine.deposit(amount as u128).map_err(map_reserve_error)
                })?;
            }
            Instruction::InitHolder => {
                accounts::expect_len(accounts, 2)?;
                let a_owner = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_signer(a_owner)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                let header = require_initialized(&data)?;
                require_not_paused(&header)?;

                let engine = zc::engine_mut(&mut data)?;
                let idx = engine
                    .add_holder(a_owner.key.to_bytes())
                    .map_err(map_reserve_error)?;
                events::holder_initialized(a_owner.key, idx);
            }
            Instruction::Buy {
                holder_idx,
                amount_in,
                min_tokens_out,
            } => {
                accounts::expect_len(accounts, 6)?;
                let a_buyer = &accounts[0];
                let a_slab = &accounts[1];
                let a_buyer_ata = &accounts[2];
                let a_vault = &accounts[3];
                let a_token = &accounts[4];
                let a_clock = &accounts[5];

                accounts::expect_signer(a_buyer)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                let header = require_initialized(&data)?;
                require_not_paused(&header)?;
                let config = state::read_config(&data);

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                verify_vault(
                    a_vault,
                    &auth,
                    &Pubkey::new_from_array(config.reserve_mint),
                    &Pubkey::new_from_array(config.vault_pubkey),
                )?;

                let (now_slot, _) = clock_from(a_clock)?;

                let outcome = with_lock(&mut data, |d| {
                    {
                        let engine = zc::engine_ref(d)?;
                        check_holder_owner(engine, holder_idx, a_buyer.key)?;
                    }
                    vault::pull(a_token, a_buyer_ata, a_vault, a_buyer, amount_in)?;
                    let engine = zc::engine_mut(d)?;
                    let outcome = engine
                        .buy(holder_idx, amount_in as u128, min_tokens_out, now_slot)
                        .map_err(map_reserve_error)?;
                    Ok((outcome, engine.total_reserve.get(), engine.active_reserve.get()))
                })?;

                let (out, total_after, active_after) = outcome;
                if out.accrued > 0 {
                    let accrued_total = {
                        let engine = zc::engine_ref(&data)?;
                        engine.accrued_for(holder_idx).map_err(map_reserve_error)?
                    };
                    events::yield_accrued(a_buyer.key, out.accrued, accrued_total);
                }
                events::bought(
                    a_buyer.key,
                    amount_in,
                    out.fee,
                    out.minted,
                    total_after,
                    active_after,
                );
            }
            Instruction::Sell {
                holder_idx,
                token_amount,
                min_value_out,
            } => {
                accounts::expect_len(accounts, 7)?;
                let a_seller = &accounts[0];
                let a_slab = &accounts[1];
                let a_vault = &accounts[2];
                let a_seller_ata = &accounts[3];
                let a_vault_pda = &accounts[4];
                let a_token = &accounts[5];
                let a_clock = &accounts[6];

                accounts::expect_signer(a_seller)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                let header = require_initialized(&data)?;
                require_not_paused(&header)?;
                let config = state::read_config(&data);

                let (derived_pda, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_vault_pda, &derived_pda)?;
                verify_vault(
                    a_vault,
                    &derived_pda,
                    &Pubkey::new_from_array(config.reserve_mint),
                    &Pubkey::new_from_array(config.vault_pubkey),
                )?;

                let (now_slot, _) = clock_from(a_clock)?;

                let (out, total_after, active_after) = with_lock(&mut data, |d| {
                    let engine = zc::engine_mut(d)?;
                    check_holder_owner(engine, holder_idx, a_seller.key)?;
                    let out = engine
                        .sell(holder_idx, token_amount, min_value_out as u128, now_slot)
                        .map_err(map_reserve_error)?;
                    let total = engine.total_reserve.get();
                    let active = engine.active_reserve.get();

                    // State is final; only now does value leave custody.
                    let net: u64 = out
                        .net_out
                        .try_into()
                        .map_err(|_| GlacierError::EngineOverflow)?;
                    let seed1: &[u8] = b"vault";
                    let seed2: &[u8] = a_slab.key.as_ref();
                    let bump_arr: [u8; 1] = [config.vault_authority_bump];
                    let seed3: &[u8] = &bump_arr;
                    let seeds: [&[u8]; 3] = [seed1, seed2, seed3];
                    let signer_seeds: [&[&[u8]]; 1] = [&seeds];
                    vault::payout(a_token, a_vault, a_seller_ata, a_vault_pda, net, &signer_seeds)?;
                    Ok((out, total, active))
                })?;

                if out.accrued > 0 {
                    let accrued_total = {
                        let engine = zc::engine_ref(&data)?;
                        engine.accrued_for(holder_idx).map_err(map_reserve_error)?
                    };
                    events::yield_accrued(a_seller.key, out.accrued, accrued_total);
                }
                events::sold(
                    a_seller.key,
                    token_amount,
                    out.fee,
                    out.net_out,
                    total_after,
                    active_after,
                );
            }
            Instruction::Thaw => {
                accounts::expect_len(accounts, 7)?;
                let a_caller = &accounts[0];
                let a_slab = &accounts[1];
                let a_vault = &accounts[2];
                let a_caller_ata = &accounts[3];
                let a_vault_pda = &accounts[4];
                let a_token = &accounts[5];
                let a_clock = &accounts[6];

                accounts::expect_signer(a_caller)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                let header = require_initialized(&data)?;
                require_not_paused(&header)?;
                let config = state::read_config(&data);

                let (derived_pda, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_vault_pda, &derived_pda)?;
                verify_vault(
                    a_vault,
                    &derived_pda,
                    &Pubkey::new_from_array(config.reserve_mint),
                    &Pubkey::new_from_array(config.vault_pubkey),
                )?;

                let (_, now_ts) = clock_from(a_clock)?;

                let out = with_lock(&mut data, |d| {
                    let engine = zc::engine_mut(d)?;
                    let out = engine.thaw(now_ts).map_err(map_reserve_error)?;

                    if out.reward > 0 {
                        let reward: u64 = out
                            .reward
                            .try_into()
                            .map_err(|_| GlacierError::EngineOverflow)?;
                        let seed1: &[u8] = b"vault";
                        let seed2: &[u8] = a_slab.key.as_ref();
                        let bump_arr: [u8; 1] = [config.vault_authority_bump];
                        let seed3: &[u8] = &bump_arr;
                        let seeds: [&[u8]; 3] = [seed1, seed2, seed3];
                        let signer_seeds: [&[&[u8]]; 1] = [&seeds];
                        vault::payout(
                            a_token,
                            a_vault,
                            a_caller_ata,
                            a_vault_pda,
                            reward,
                            &signer_seeds,
                        )?;
                    }
                    Ok(out)
                })?;

                events::thaw_released(a_caller.key, out.released, out.reward, out.active_after);
            }
            Instruction::ClaimYield { holder_idx } => {
                accounts::expect_len(accounts, 7)?;
                let a_holder = &accounts[0];
                let a_slab = &accounts[1];
                let a_vault = &accounts[2];
                let a_holder_ata = &accounts[3];
                let a_vault_pda = &accounts[4];
                let a_token = &accounts[5];
                let a_clock = &accounts[6];

                accounts::expect_signer(a_holder)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                let header = require_initialized(&data)?;
                require_not_paused(&header)?;
                let config = state::read_config(&data);

                let (derived_pda, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_vault_pda, &derived_pda)?;
                verify_vault(
                    a_vault,
                    &derived_pda,
                    &Pubkey::new_from_array(config.reserve_mint),
                    &Pubkey::new_from_array(config.vault_pubkey),
                )?;

                let (now_slot, _) = clock_from(a_clock)?;

                let (out, total_after) = with_lock(&mut data, |d| {
                    let engine = zc::engine_mut(d)?;
                    check_holder_owner(engine, holder_idx, a_holder.key)?;
                    let out = engine
                        .claim_yield(holder_idx, now_slot)
                        .map_err(map_reserve_error)?;
                    let total = engine.total_reserve.get();

                    if out.paid > 0 {
                        let paid: u64 = out
                            .paid
                            .try_into()
                            .map_err(|_| GlacierError::EngineOverflow)?;
                        let seed1: &[u8] = b"vault";
                        let seed2: &[u8] = a_slab.key.as_ref();
                        let bump_arr: [u8; 1] = [config.vault_authority_bump];
                        let seed3: &[u8] = &bump_arr;
                        let seeds: [&[u8]; 3] = [seed1, seed2, seed3];
                        let signer_seeds: [&[&[u8]]; 1] = [&seeds];
                        vault::payout(
                            a_token,
                            a_vault,
                            a_holder_ata,
                            a_vault_pda,
                            paid,
                            &signer_seeds,
                        )?;
                    }
                    Ok((out, total))
                })?;

                if out.accrued > 0 {
                    let accrued_total = {
                        let engine = zc::engine_ref(&data)?;
                        engine.accrued_for(holder_idx).map_err(map_reserve_error)?
                    };
                    events::yield_accrued(a_holder.key, out.accrued, accrued_total);
                }
                events::yield_claimed(a_holder.key, out.paid, total_after);
            }
            Instruction::SyncYield { holder_idx } => {
                accounts::expect_len(accounts, 3)?;
                let a_holder = &accounts[0];
                let a_slab = &accounts[1];
                let a_clock = &accounts[2];

                accounts::expect_signer(a_holder)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                let header = require_initialized(&data)?;
                require_not_paused(&header)?;

                let (now_slot, _) = clock_from(a_clock)?;

                let engine = zc::engine_mut(&mut data)?;
                check_holder_owner(engine, holder_idx, a_holder.key)?;
                let accrued = engine
                    .sync_holder(holder_idx, now_slot)
                    .map_err(map_reserve_error)?;
                if accrued > 0 {
                    let accrued_total =
                        engine.accrued_for(holder_idx).map_err(map_reserve_error)?;
                    events::yield_accrued(a_holder.key, accrued, accrued_total);
                }
            }
            Instruction::TransferShares {
                from_idx,
                to_idx,
                amount,
            } => {
                accounts::expect_len(accounts, 3)?;
                let a_from = &accounts[0];
                let a_slab = &accounts[1];
                let a_clock = &accounts[2];

                accounts::expect_signer(a_from)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                let header = require_initialized(&data)?;
                require_not_paused(&header)?;

                let (now_slot, _) = clock_from(a_clock)?;

                let (out, from_total, to_total, to_key) = with_lock(&mut data, |d| {
                    let engine = zc::engine_mut(d)?;
                    check_holder_owner(engine, from_idx, a_from.key)?;
                    let out = engine
                        .transfer_shares(from_idx, to_idx, amount, now_slot)
                        .map_err(map_reserve_error)?;
                    let from_total = engine.accrued_for(from_idx).map_err(map_reserve_error)?;
                    let to_total = engine.accrued_for(to_idx).map_err(map_reserve_error)?;
                    let to_key =
                        Pubkey::new_from_array(engine.holder(to_idx).map_err(map_reserve_error)?.owner);
                    Ok((out, from_total, to_total, to_key))
                })?;

                if out.from_accrued > 0 {
                    events::yield_accrued(a_from.key, out.from_accrued, from_total);
                }
                if out.to_accrued > 0 {
                    events::yield_accrued(&to_key, out.to_accrued, to_total);
                }
            }
            Instruction::SetParam { key, value } => {
                accounts::expect_len(accounts, 2)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                let header = require_initialized(&data)?;
                require_admin(&header, a_admin)?;

                let param = ParamKey::from_u8(key).ok_or(GlacierError::InvalidParamKey)?;
                let engine = zc::engine_mut(&mut data)?;
                engine.set_param(param, value).map_err(map_reserve_error)?;
            }
            Instruction::SetTimelock { timelock } => {
                accounts::expect_len(accounts, 2)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                let mut header = require_initialized(&data)?;
                require_admin(&header, a_admin)?;

                header.timelock = timelock.to_bytes();
                state::write_header(&mut data, &header);
            }
            Instruction::SetPaused { paused } => {
                accounts::expect_len(accounts, 2)?;
                let a_admin = &accounts[0];
                let a_slab = &accounts[1];

                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                let mut header = require_initialized(&data)?;
                require_admin(&header, a_admin)?;

                header.paused = if paused != 0 { 1 } else { 0 };
                state::write_header(&mut data, &header);
            }
            Instruction::EmergencyDrain { amount } => {
                accounts::expect_len(accounts, 6)?;
                let a_timelock = &accounts[0];
                let a_slab = &accounts[1];
                let a_vault = &accounts[2];
                let a_dest_ata = &accounts[3];
                let a_vault_pda = &accounts[4];
                let a_token = &accounts[5];

                accounts::expect_signer(a_timelock)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                let header = require_initialized(&data)?;
                // The drain path deliberately ignores the pause gate: it is
                // the emergency exit while the pool is halted.
                if Pubkey::new_from_array(header.timelock) != *a_timelock.key {
                    return Err(GlacierError::Unauthorized.into());
                }
                let config = state::read_config(&data);

                let (derived_pda, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                accounts::expect_key(a_vault_pda, &derived_pda)?;
                verify_vault(
                    a_vault,
                    &derived_pda,
                    &Pubkey::new_from_array(config.reserve_mint),
                    &Pubkey::new_from_array(config.vault_pubkey),
                )?;
                expect_reserve_ata(a_dest_ata, &Pubkey::new_from_array(config.reserve_mint))?;

                let total_after = with_lock(&mut data, |d| {
                    let engine = zc::engine_mut(d)?;
                    engine
                        .emergency_drain(amount as u128)
                        .map_err(map_reserve_error)?;
                    let total = engine.total_reserve.get();

                    let seed1: &[u8] = b"vault";
                    let seed2: &[u8] = a_slab.key.as_ref();
                    let bump_arr: [u8; 1] = [config.vault_authority_bump];
                    let seed3: &[u8] = &bump_arr;
                    let seeds: [&[u8]; 3] = [seed1, seed2, seed3];
                    let signer_seeds: [&[&[u8]]; 1] = [&seeds];
                    vault::payout(a_token, a_vault, a_dest_ata, a_vault_pda, amount, &signer_seeds)?;
                    Ok(total)
                })?;

                events::emergency_drain(a_dest_ata.key, amount, total_after);
            }
        }
        Ok(())
    }
}

// 10. mod entrypoint
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

#[cfg(test)]
mod tests {
    extern crate std;
    use crate::{
        constants::{MAGIC, SLAB_LEN, VERSION},
        engine::{ParamKey, PoolParams, U128, WAD},
        error::GlacierError,
        processor::process_instruction,
        state, zc,
    };
    use num_traits::FromPrimitive;
    use solana_program::{
        account_info::AccountInfo, clock::Clock, program_error::ProgramError, program_pack::Pack,
        pubkey::Pubkey,
    };
    use spl_token::state::{Account as TokenAccount, AccountState};
    use std::vec;
    use std::vec::Vec;

    // --- Harness ---

    struct TestAccount {
        key: Pubkey,
        owner: Pubkey,
        lamports: u64,
        data: Vec<u8>,
        is_signer: bool,
        is_writable: bool,
    }

    impl TestAccount {
        fn new(key: Pubkey, owner: Pubkey, lamports: u64, data: Vec<u8>) -> Self {
            Self {
                key,
                owner,
                lamports,
                data,
                is_signer: false,
                is_writable: false,
            }
        }
        fn signer(mut self) -> Self {
            self.is_signer = true;
            self
        }
        fn writable(mut self) -> Self {
            self.is_writable = true;
            self
        }

        fn to_info<'a>(&'a mut self) -> AccountInfo<'a> {
            AccountInfo::new(
                &self.key,
                self.is_signer,
                self.is_writable,
                &mut self.lamports,
                &mut self.data,
                &self.owner,
                false,
                0,
            )
        }
    }

    // --- Builders ---

    fn make_token_account(mint: Pubkey, owner: Pubkey, amount: u64) -> Vec<u8> {
        let mut data = vec![0u8; TokenAccount::LEN];
        let mut account = TokenAccount::default();
        account.mint = mint;
        account.owner = owner;
        account.amount = amount;
        account.state = AccountState::Initialized;
        TokenAccount::pack(account, &mut data).unwrap();
        data
    }

    fn make_clock(slot: u64, unix_timestamp: i64) -> Vec<u8> {
        let clock = Clock {
            slot,
            unix_timestamp,
            ..Clock::default()
        };
        bincode::serialize(&clock).unwrap()
    }

    fn token_balance(data: &[u8]) -> u64 {
        TokenAccount::unpack(data).unwrap().amount
    }

    // --- Encoders ---

    fn encode_params(params: &PoolParams, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&params.fee_bps.to_le_bytes());
        buf.extend_from_slice(&params.caller_reward_bps.to_le_bytes());
        buf.extend_from_slice(&params.max_mint_per_tx.get().to_le_bytes());
        buf.extend_from_slice(&params.min_active.get().to_le_bytes());
        buf.extend_from_slice(&params.halt_below.get().to_le_bytes());
        buf.extend_from_slice(&params.thaw_interval_sec.to_le_bytes());
        buf.extend_from_slice(&params.lambda_num.to_le_bytes());
        buf.extend_from_slice(&params.lambda_den.to_le_bytes());
        buf.extend_from_slice(&params.yield_num.to_le_bytes());
        buf.extend_from_slice(&params.yield_den.to_le_bytes());
        buf.extend_from_slice(&params.min_slots_between_trades.to_le_bytes());
        buf.extend_from_slice(&params.protected_floor.get().to_le_bytes());
    }

    fn ix_init_pool(
        timelock: &Pubkey,
        params: &PoolParams,
        initial_total: u64,
        initial_active: u64,
    ) -> Vec<u8> {
        let mut buf = vec![0u8];
        buf.extend_from_slice(timelock.as_ref());
        encode_params(params, &mut buf);
        buf.extend_from_slice(&initial_total.to_le_bytes());
        buf.extend_from_slice(&initial_active.to_le_bytes());
        buf
    }

    fn ix_deposit(amount: u64) -> Vec<u8> {
        let mut buf = vec![1u8];
        buf.extend_from_slice(&amount.to_le_bytes());
        buf
    }

    fn ix_buy(holder_idx: u16, amount_in: u64, min_tokens_out: u128) -> Vec<u8> {
        let mut buf = vec![3u8];
        buf.extend_from_slice(&holder_idx.to_le_bytes());
        buf.extend_from_slice(&amount_in.to_le_bytes());
        buf.extend_from_slice(&min_tokens_out.to_le_bytes());
        buf
    }

    fn ix_sell(holder_idx: u16, token_amount: u128, min_value_out: u64) -> Vec<u8> {
        let mut buf = vec![4u8];
        buf.extend_from_slice(&holder_idx.to_le_bytes());
        buf.extend_from_slice(&token_amount.to_le_bytes());
        buf.extend_from_slice(&min_value_out.to_le_bytes());
        buf
    }

    fn ix_claim(holder_idx: u16) -> Vec<u8> {
        let mut buf = vec![6u8];
        buf.extend_from_slice(&holder_idx.to_le_bytes());
        buf
    }

    fn ix_set_param(key: ParamKey, value: u128) -> Vec<u8> {
        let mut buf = vec![9u8, key as u8];
        buf.extend_from_slice(&value.to_le_bytes());
        buf
    }

    fn ix_set_paused(paused: u8) -> Vec<u8> {
        vec![11u8, paused]
    }

    fn ix_drain(amount: u64) -> Vec<u8> {
        let mut buf = vec![12u8];
        buf.extend_from_slice(&amount.to_le_bytes());
        buf
    }

    fn custom_err(e: GlacierError) -> ProgramError {
        ProgramError::Custom(e as u32)
    }

    fn decode_custom(err: ProgramError) -> Option<GlacierError> {
        match err {
            ProgramError::Custom(code) => GlacierError::from_u32(code),
            _ => None,
        }
    }

    // --- Fixture ---

    fn default_params() -> PoolParams {
        PoolParams {
            fee_bps: 30,
            caller_reward_bps: 100,
            max_mint_per_tx: U128::new(u128::MAX),
            min_active: U128::new(1),
            halt_below: U128::new(0),
            thaw_interval_sec: 3600,
            lambda_num: 1,
            lambda_den: 1,
            yield_num: 0,
            yield_den: 1,
            min_slots_between_trades: 1,
            protected_floor: U128::new(1),
        }
    }

    struct PoolFixture {
        program_id: Pubkey,
        admin: TestAccount,
        timelock_key: Pubkey,
        slab: TestAccount,
        mint: TestAccount,
        vault: TestAccount,
        admin_ata: TestAccount,
        token_prog: TestAccount,
        vault_pda_acc: TestAccount,
        clock: TestAccount,
    }

    impl PoolFixture {
        fn new() -> Self {
            let program_id = Pubkey::new_unique();
            let slab_key = Pubkey::new_unique();
            let (vault_pda, _) =
                Pubkey::find_program_address(&[b"vault", slab_key.as_ref()], &program_id);
            let mint_key = Pubkey::new_unique();
            let admin_key = Pubkey::new_unique();

            PoolFixture {
                program_id,
                admin: TestAccount::new(
                    admin_key,
                    solana_program::system_program::id(),
                    0,
                    vec![],
                )
                .signer(),
                timelock_key: Pubkey::new_unique(),
                slab: TestAccount::new(slab_key, program_id, 0, vec![0u8; SLAB_LEN]).writable(),
                mint: TestAccount::new(mint_key, spl_token::ID, 0, vec![]),
                vault: TestAccount::new(
                    Pubkey::new_unique(),
                    spl_token::ID,
                    0,
                    make_token_account(mint_key, vault_pda, 0),
                )
                .writable(),
                admin_ata: TestAccount::new(
                    Pubkey::new_unique(),
                    spl_token::ID,
                    0,
                    make_token_account(mint_key, admin_key, 1_000_000_000),
                )
                .writable(),
                token_prog: TestAccount::new(spl_token::ID, Pubkey::default(), 0, vec![]),
                vault_pda_acc: TestAccount::new(vault_pda, solana_program::system_program::id(), 0, vec![]),
                clock: TestAccount::new(
                    solana_program::sysvar::clock::id(),
                    solana_program::sysvar::id(),
                    0,
                    make_clock(100, 1_000_000),
                ),
            }
        }

        fn set_clock(&mut self, slot: u64, ts: i64) {
            self.clock.data = make_clock(slot, ts);
        }

        fn init(&mut self, params: &PoolParams, total: u64, active: u64) -> Result<(), ProgramError> {
            let timelock = self.timelock_key;
            let data = ix_init_pool(&timelock, params, total, active);
            let infos = [
                self.admin.to_info(),
                self.slab.to_info(),
                self.mint.to_info(),
                self.vault.to_info(),
                self.admin_ata.to_info(),
                self.token_prog.to_info(),
                self.clock.to_info(),
            ];
            process_instruction(&self.program_id, &infos, &data)
        }

        fn init_holder_for(&mut self, owner: &mut TestAccount) -> Result<(), ProgramError> {
            let infos = [owner.to_info(), self.slab.to_info()];
            process_instruction(&self.program_id, &infos, &[2u8])
        }

        fn deposit(&mut self, payer: &mut TestAccount, ata: &mut TestAccount, amount: u64) -> Result<(), ProgramError> {
            let data = ix_deposit(amount);
            let infos = [
                payer.to_info(),
                self.slab.to_info(),
                ata.to_info(),
                self.vault.to_info(),
                self.token_prog.to_info(),
            ];
            process_instruction(&self.program_id, &infos, &data)
        }

        fn buy(
            &mut self,
            buyer: &mut TestAccount,
            ata: &mut TestAccount,
            holder_idx: u16,
            amount_in: u64,
            min_out: u128,
        ) -> Result<(), ProgramError> {
            let data = ix_buy(holder_idx, amount_in, min_out);
            let infos = [
                buyer.to_info(),
                self.slab.to_info(),
                ata.to_info(),
                self.vault.to_info(),
                self.token_prog.to_info(),
                self.clock.to_info(),
            ];
            process_instruction(&self.program_id, &infos, &data)
        }

        fn sell(
            &mut self,
            seller: &mut TestAccount,
            ata: &mut TestAccount,
            holder_idx: u16,
            token_amount: u128,
            min_out: u64,
        ) -> Result<(), ProgramError> {
            let data = ix_sell(holder_idx, token_amount, min_out);
            let infos = [
                seller.to_info(),
                self.slab.to_info(),
                self.vault.to_info(),
                ata.to_info(),
                self.vault_pda_acc.to_info(),
                self.token_prog.to_info(),
                self.clock.to_info(),
            ];
            process_instruction(&self.program_id, &infos, &data)
        }

        fn thaw(&mut self, caller: &mut TestAccount, ata: &mut TestAccount) -> Result<(), ProgramError> {
            let infos = [
                caller.to_info(),
                self.slab.to_info(),
                self.vault.to_info(),
                ata.to_info(),
                self.vault_pda_acc.to_info(),
                self.token_prog.to_info(),
                self.clock.to_info(),
            ];
            process_instruction(&self.program_id, &infos, &[5u8])
        }

        fn claim(
            &mut self,
            holder: &mut TestAccount,
            ata: &mut TestAccount,
            holder_idx: u16,
        ) -> Result<(), ProgramError> {
            let data = ix_claim(holder_idx);
            let infos = [
                holder.to_info(),
                self.slab.to_info(),
                self.vault.to_info(),
                ata.to_info(),
                self.vault_pda_acc.to_info(),
                self.token_prog.to_info(),
                self.clock.to_info(),
            ];
            process_instruction(&self.program_id, &infos, &data)
        }

        fn set_param_as(
            &mut self,
            caller: &mut TestAccount,
            key: ParamKey,
            value: u128,
        ) -> Result<(), ProgramError> {
            let data = ix_set_param(key, value);
            let infos = [caller.to_info(), self.slab.to_info()];
            process_instruction(&self.program_id, &infos, &data)
        }

        fn drain_as(
            &mut self,
            caller: &mut TestAccount,
            dest_ata: &mut TestAccount,
            amount: u64,
        ) -> Result<(), ProgramError> {
            let data = ix_drain(amount);
            let infos = [
                caller.to_info(),
                self.slab.to_info(),
                self.vault.to_info(),
                dest_ata.to_info(),
                self.vault_pda_acc.to_info(),
                self.token_prog.to_info(),
            ];
            process_instruction(&self.program_id, &infos, &data)
        }

        fn user(&self) -> (TestAccount, TestAccount) {
            let key = Pubkey::new_unique();
            let mint = self.mint.key;
            (
                TestAccount::new(key, solana_program::system_program::id(), 0, vec![]).signer(),
                TestAccount::new(
                    Pubkey::new_unique(),
                    spl_token::ID,
                    0,
                    make_token_account(mint, key, 1_000_000_000),
                )
                .writable(),
            )
        }
    }

    // --- Tests ---

    #[test]
    fn init_pool_seeds_engine_and_pulls_funds() {
        let mut fx = PoolFixture::new();
        fx.init(&default_params(), 1_000, 400).unwrap();

        let header = state::read_header(&fx.slab.data);
        assert_eq!(header.magic, MAGIC);
        assert_eq!(header.version, VERSION);
        assert_eq!(Pubkey::new_from_array(header.admin), fx.admin.key);
        assert_eq!(Pubkey::new_from_array(header.timelock), fx.timelock_key);
        assert_eq!(header.paused, 0);
        assert_eq!(header.locked, 0);

        let engine = zc::engine_ref(&fx.slab.data).unwrap();
        assert_eq!(engine.total_reserve.get(), 1_000);
        assert_eq!(engine.active_reserve.get(), 400);
        assert_eq!(engine.dormant(), 600);
        assert!(engine.invariant_holds());

        assert_eq!(token_balance(&fx.vault.data), 1_000);
        assert_eq!(token_balance(&fx.admin_ata.data), 1_000_000_000 - 1_000);
    }

    #[test]
    fn init_pool_twice_fails() {
        let mut fx = PoolFixture::new();
        fx.init(&default_params(), 10, 5).unwrap();
        assert_eq!(
            fx.init(&default_params(), 10, 5),
            Err(custom_err(GlacierError::AlreadyInitialized))
        );
    }

    #[test]
    fn deposit_grows_both_counters() {
        let mut fx = PoolFixture::new();
        fx.init(&default_params(), 1_000, 400).unwrap();
        let (mut payer, mut ata) = fx.user();

        let dormant_before = zc::engine_ref(&fx.slab.data).unwrap().dormant();
        fx.deposit(&mut payer, &mut ata, 250).unwrap();

        let engine = zc::engine_ref(&fx.slab.data).unwrap();
        assert_eq!(engine.total_reserve.get(), 1_250);
        assert_eq!(engine.active_reserve.get(), 650);
        assert_eq!(engine.dormant(), dormant_before);
        assert_eq!(token_balance(&fx.vault.data), 1_250);
    }

    #[test]
    fn buy_round_trip_matches_pricing_identity() {
        // total=10, active=5, minActive=1, floor=1: price is exactly 1 WAD.
        let mut fx = PoolFixture::new();
        fx.init(&default_params(), 10, 5).unwrap();

        {
            let engine = zc::engine_ref(&fx.slab.data).unwrap();
            assert_eq!(engine.price_wad().unwrap(), WAD);
        }

        let (mut buyer, mut ata) = fx.user();
        fx.init_holder_for(&mut buyer).unwrap();
        fx.buy(&mut buyer, &mut ata, 0, 1, 0).unwrap();

        let engine = zc::engine_ref(&fx.slab.data).unwrap();
        // Fee floors to zero at this scale; 1 unit net mints 1*5/5 = 1 token.
        assert_eq!(engine.holder(0).unwrap().balance.get(), 1);
        assert_eq!(engine.total_reserve.get(), 11);
        assert_eq!(engine.dormant(), 5);
        assert!(engine.invariant_holds());
        assert!(engine.check_conservation());
    }

    #[test]
    fn buy_cooldown_enforced_per_holder() {
        let mut fx = PoolFixture::new();
        let mut params = default_params();
        params.min_slots_between_trades = 5;
        fx.init(&params, 1_000_000, 400_000).unwrap();

        let (mut buyer, mut ata) = fx.user();
        fx.init_holder_for(&mut buyer).unwrap();
        fx.buy(&mut buyer, &mut ata, 0, 1_000, 0).unwrap();

        // Same slot: rejected.
        let err = fx.buy(&mut buyer, &mut ata, 0, 1_000, 0).unwrap_err();
        assert_eq!(decode_custom(err), Some(GlacierError::EngineCooldownActive));

        // Past the spacing: allowed again.
        fx.set_clock(105, 1_000_000);
        fx.buy(&mut buyer, &mut ata, 0, 1_000, 0).unwrap();
    }

    #[test]
    fn sell_pays_net_and_recycles_fee() {
        let mut fx = PoolFixture::new();
        fx.init(&default_params(), 1_000_000, 400_000).unwrap();

        let (mut trader, mut ata) = fx.user();
        fx.init_holder_for(&mut trader).unwrap();
        fx.buy(&mut trader, &mut ata, 0, 100_000, 0).unwrap();

        let (minted, total_before, dormant_before) = {
            let engine = zc::engine_ref(&fx.slab.data).unwrap();
            (
                engine.holder(0).unwrap().balance.get(),
                engine.total_reserve.get(),
                engine.dormant(),
            )
        };
        assert!(minted > 0);

        let ata_before = token_balance(&ata.data);
        fx.set_clock(110, 1_000_000);
        fx.sell(&mut trader, &mut ata, 0, minted, 0).unwrap();

        let engine = zc::engine_ref(&fx.slab.data).unwrap();
        assert_eq!(engine.holder(0).unwrap().balance.get(), 0);
        // Fee recycled: dormant untouched by the trade pair.
        assert_eq!(engine.dormant(), dormant_before);
        assert!(engine.invariant_holds());
        let paid = token_balance(&ata.data) - ata_before;
        assert!(paid > 0);
        assert_eq!(engine.total_reserve.get(), total_before - paid as u128);
    }

    #[test]
    fn sell_slippage_guard_rejects() {
        let mut fx = PoolFixture::new();
        fx.init(&default_params(), 1_000_000, 400_000).unwrap();

        let (mut trader, mut ata) = fx.user();
        fx.init_holder_for(&mut trader).unwrap();
        fx.buy(&mut trader, &mut ata, 0, 100_000, 0).unwrap();
        fx.set_clock(110, 1_000_000);

        let minted = zc::engine_ref(&fx.slab.data)
            .unwrap()
            .holder(0)
            .unwrap()
            .balance
            .get();
        let err = fx
            .sell(&mut trader, &mut ata, 0, minted, u64::MAX)
            .unwrap_err();
        assert_eq!(
            decode_custom(err),
            Some(GlacierError::EngineSlippageExceeded)
        );
    }

    #[test]
    fn thaw_pays_caller_and_narrows_gap() {
        let mut fx = PoolFixture::new();
        // dormant 99_000 vs active 1_000: gap is 98_000.
        fx.init(&default_params(), 100_000, 1_000).unwrap();

        let (mut keeper, mut ata) = fx.user();
        let ata_before = token_balance(&ata.data);

        // Inside the interval: hard failure.
        fx.set_clock(200, 1_000_000 + 10);
        let err = fx.thaw(&mut keeper, &mut ata).unwrap_err();
        assert_eq!(decode_custom(err), Some(GlacierError::EngineThawTooSoon));

        // One full interval later. Release caps at gap/10 = 9_800; the 1%
        // caller reward (98) leaves custody, the rest joins the active pool.
        fx.set_clock(200, 1_000_000 + 3_600);
        fx.thaw(&mut keeper, &mut ata).unwrap();

        let engine = zc::engine_ref(&fx.slab.data).unwrap();
        let reward = (token_balance(&ata.data) - ata_before) as u128;
        assert_eq!(reward, 98);
        assert_eq!(engine.active_reserve.get(), 1_000 + 9_800 - 98);
        assert_eq!(engine.total_reserve.get(), 100_000 - 98);
        assert_eq!(token_balance(&fx.vault.data), 100_000 - 98);
        assert!(engine.invariant_holds());
    }

    #[test]
    fn thaw_zero_gap_is_noop_not_error() {
        let mut fx = PoolFixture::new();
        // dormant 400 <= active 600: gap 0.
        fx.init(&default_params(), 1_000, 600).unwrap();

        let (mut keeper, mut ata) = fx.user();
        fx.set_clock(200, 1_000_000 + 3_600);
        fx.thaw(&mut keeper, &mut ata).unwrap();

        let engine = zc::engine_ref(&fx.slab.data).unwrap();
        assert_eq!(engine.active_reserve.get(), 600);
        assert_eq!(engine.total_reserve.get(), 1_000);
        assert_eq!(engine.last_thaw_ts, 1_000_000 + 3_600);
    }

    #[test]
    fn claim_yield_pays_from_dormant_and_resets() {
        let mut fx = PoolFixture::new();
        let mut params = default_params();
        // accrual = balance * slots * yield_num / (yield_den * WAD); with
        // yield_num = WAD/1000 each balance unit accrues 1/1000 per slot.
        params.yield_num = (WAD / 1000) as u64;
        fx.init(&params, 1_000_000, 400_000).unwrap();

        let (mut holder, mut ata) = fx.user();
        fx.init_holder_for(&mut holder).unwrap();
        fx.buy(&mut holder, &mut ata, 0, 100_000, 0).unwrap();

        // 100 slots later the accrual is balance * 100 / 1000 = balance / 10.
        fx.set_clock(200, 1_000_000);
        let minted = zc::engine_ref(&fx.slab.data)
            .unwrap()
            .holder(0)
            .unwrap()
            .balance
            .get();

        let ata_before = token_balance(&ata.data);
        fx.claim(&mut holder, &mut ata, 0).unwrap();

        let engine = zc::engine_ref(&fx.slab.data).unwrap();
        let paid = (token_balance(&ata.data) - ata_before) as u128;
        assert_eq!(paid, minted * 100 / 1000);
        assert_eq!(engine.accrued_for(0).unwrap(), 0);
        assert!(engine.invariant_holds());

        // Nothing left to claim right away.
        let err = fx.claim(&mut holder, &mut ata, 0).unwrap_err();
        assert_eq!(decode_custom(err), Some(GlacierError::EngineNothingToClaim));
    }

    #[test]
    fn pause_gate_blocks_trading_until_unpaused() {
        let mut fx = PoolFixture::new();
        fx.init(&default_params(), 1_000_000, 400_000).unwrap();
        let (mut trader, mut ata) = fx.user();
        fx.init_holder_for(&mut trader).unwrap();

        let mut admin = core::mem::replace(
            &mut fx.admin,
            TestAccount::new(Pubkey::new_unique(), Pubkey::default(), 0, vec![]),
        );
        {
            let data = ix_set_paused(1);
            let infos = [admin.to_info(), fx.slab.to_info()];
            process_instruction(&fx.program_id, &infos, &data).unwrap();
        }

        let err = fx.buy(&mut trader, &mut ata, 0, 1_000, 0).unwrap_err();
        assert_eq!(decode_custom(err), Some(GlacierError::Paused));

        {
            let data = ix_set_paused(0);
            let infos = [admin.to_info(), fx.slab.to_info()];
            process_instruction(&fx.program_id, &infos, &data).unwrap();
        }
        fx.buy(&mut trader, &mut ata, 0, 1_000, 0).unwrap();
    }

    #[test]
    fn set_param_requires_admin_and_bounds() {
        let mut fx = PoolFixture::new();
        fx.init(&default_params(), 1_000, 400).unwrap();

        let (mut stranger, _) = fx.user();
        let err = fx
            .set_param_as(&mut stranger, ParamKey::FeeBps, 50)
            .unwrap_err();
        assert_eq!(decode_custom(err), Some(GlacierError::Unauthorized));

        let mut admin = core::mem::replace(
            &mut fx.admin,
            TestAccount::new(Pubkey::new_unique(), Pubkey::default(), 0, vec![]),
        );
        // Above the 10% bound.
        let err = fx
            .set_param_as(&mut admin, ParamKey::FeeBps, 1_001)
            .unwrap_err();
        assert_eq!(decode_custom(err), Some(GlacierError::EngineInvalidParam));

        fx.set_param_as(&mut admin, ParamKey::FeeBps, 100).unwrap();
        let engine = zc::engine_ref(&fx.slab.data).unwrap();
        assert_eq!(engine.params.fee_bps, 100);
    }

    #[test]
    fn emergency_drain_gated_by_timelock_and_floor() {
        let mut fx = PoolFixture::new();
        let mut params = default_params();
        params.protected_floor = U128::new(500);
        fx.init(&params, 1_000, 600).unwrap();

        let mint_key = fx.mint.key;
        let timelock_key = fx.timelock_key;
        let mut timelock =
            TestAccount::new(timelock_key, solana_program::system_program::id(), 0, vec![]).signer();
        let mut dest = TestAccount::new(
            Pubkey::new_unique(),
            spl_token::ID,
            0,
            make_token_account(mint_key, Pubkey::new_unique(), 0),
        )
        .writable();

        // Admin is not the timelock.
        let mut admin = core::mem::replace(
            &mut fx.admin,
            TestAccount::new(Pubkey::new_unique(), Pubkey::default(), 0, vec![]),
        );
        let err = fx.drain_as(&mut admin, &mut dest, 100).unwrap_err();
        assert_eq!(decode_custom(err), Some(GlacierError::Unauthorized));

        // Amount above total - floor.
        let err = fx.drain_as(&mut timelock, &mut dest, 501).unwrap_err();
        assert_eq!(decode_custom(err), Some(GlacierError::EngineFloorBreach));

        // Draining past the active reserve draws from dormant, clamped at 0.
        fx.drain_as(&mut timelock, &mut dest, 500).unwrap();
        let engine = zc::engine_ref(&fx.slab.data).unwrap();
        assert_eq!(engine.total_reserve.get(), 500);
        assert_eq!(engine.active_reserve.get(), 100);
        assert!(engine.invariant_holds());
        assert_eq!(token_balance(&dest.data), 500);
    }

    #[test]
    fn reentrancy_flag_rejects_nested_entry() {
        let mut fx = PoolFixture::new();
        fx.init(&default_params(), 1_000, 400).unwrap();

        // Simulate a nested call arriving while the flag is held.
        let mut header = state::read_header(&fx.slab.data);
        header.locked = 1;
        state::write_header(&mut fx.slab.data, &header);

        let (mut payer, mut ata) = fx.user();
        let err = fx.deposit(&mut payer, &mut ata, 10).unwrap_err();
        assert_eq!(decode_custom(err), Some(GlacierError::ReentrantCall));
    }

    #[test]
    fn halt_threshold_blocks_trades() {
        let mut fx = PoolFixture::new();
        let mut params = default_params();
        params.halt_below = U128::new(500_000);
        fx.init(&params, 1_000_000, 400_000).unwrap();

        let (mut trader, mut ata) = fx.user();
        fx.init_holder_for(&mut trader).unwrap();
        let err = fx.buy(&mut trader, &mut ata, 0, 1_000, 0).unwrap_err();
        assert_eq!(decode_custom(err), Some(GlacierError::EngineHalted));
    }
}
