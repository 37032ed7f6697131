//! Reserve engine: active/dormant reserve split, bonding-style pricing,
//! time-gated thaw, and per-holder yield accrual.
//!
//! The engine is a pure state machine. It never reads a clock: the current
//! slot (block height) and unix timestamp are injected by the caller on every
//! operation, so deterministic tests and formal harnesses can control time.
//! All data is laid out in a single contiguous memory chunk suitable for a
//! single Solana account.
//!
//! Accounting identity (checked by `invariant_holds`):
//!   total_reserve == active_reserve + dormant, dormant never negative.
//! Conservation: buy, sell and deposit move both counters by the same delta,
//! so trading never changes the dormant tranche. Only thaw, yield claims and
//! emergency drains narrow it.

use num_derive::FromPrimitive;

// ============================================================================
// Constants
// ============================================================================

// MAX_HOLDERS is feature-configured, not target-configured, so x86 and SBF
// builds agree on slab sizes for a given feature set.
#[cfg(kani)]
pub const MAX_HOLDERS: usize = 4; // Small for fast formal verification

#[cfg(all(feature = "test", not(kani)))]
pub const MAX_HOLDERS: usize = 64; // Small for tests

#[cfg(all(not(kani), not(feature = "test")))]
pub const MAX_HOLDERS: usize = 4096; // Production

pub const BITMAP_WORDS: usize = (MAX_HOLDERS + 63) / 64;

/// Fixed-point scale for prices and the yield-rate denominator (1e18).
pub const WAD: u128 = 1_000_000_000_000_000_000;

/// Basis-point denominator.
pub const BPS_DENOM: u128 = 10_000;

/// Admin bound: trade fee may never exceed 10%.
pub const MAX_FEE_BPS: u64 = 1_000;

/// Admin bound: thaw caller reward may never exceed 5%.
pub const MAX_CALLER_REWARD_BPS: u64 = 500;

/// A single thaw call may release at most 1/10 of the pre-call gap.
pub const THAW_GAP_DIVISOR: u128 = 10;

// ============================================================================
// BPF-Safe 128-bit Unsigned (8-byte aligned)
// ============================================================================
//
// Rust 1.78 aligns u128 to 16 bytes on x86_64 while SBF keeps 8-byte
// alignment, which would skew the slab layout between host tests and on-chain
// builds. The wrapper stores two little-endian u64 limbs instead.
//
// Under Kani a transparent newtype is used so the solver reasons about plain
// u128 arithmetic rather than limb shuffling.

#[cfg(kani)]
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct U128(u128);

#[cfg(kani)]
impl U128 {
    pub const ZERO: Self = Self(0);

    #[inline(always)]
    pub const fn new(val: u128) -> Self {
        Self(val)
    }

    #[inline(always)]
    pub const fn get(self) -> u128 {
        self.0
    }

    #[inline(always)]
    pub fn set(&mut self, val: u128) {
        self.0 = val;
    }
}

#[cfg(not(kani))]
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct U128([u64; 2]);

#[cfg(not(kani))]
impl U128 {
    pub const ZERO: Self = Self([0, 0]);

    #[inline]
    pub const fn new(val: u128) -> Self {
        Self([val as u64, (val >> 64) as u64])
    }

    #[inline]
    pub const fn get(self) -> u128 {
        ((self.0[1] as u128) << 64) | (self.0[0] as u128)
    }

    #[inline]
    pub fn set(&mut self, val: u128) {
        self.0[0] = val as u64;
        self.0[1] = (val >> 64) as u64;
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Engine failure reasons. Every operation either fully commits or returns
/// one of these with zero state mutation (callers rely on transaction
/// atomicity for the custody side).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReserveError {
    /// Zero or otherwise meaningless amount.
    ZeroAmount,
    /// Checked arithmetic failed. Never wraps silently.
    Overflow,
    /// Holder table is full.
    SlabFull,
    /// Holder index unused or out of range.
    HolderNotFound,
    /// Holder already registered for this owner.
    HolderExists,
    /// Participation balance below the requested amount.
    InsufficientBalance,
    /// Redemption gross exceeds the active reserve.
    InsufficientActiveReserve,
    /// Circuit breaker: active reserve below the halt threshold.
    Halted,
    /// Minimum slot spacing between trades not yet elapsed.
    CooldownActive,
    /// Thaw interval not yet elapsed.
    ThawTooSoon,
    /// Computed output floored to zero.
    ZeroOutput,
    /// Output below the caller's minimum.
    SlippageExceeded,
    /// Minted amount above the per-transaction cap.
    CapExceeded,
    /// No accrued yield to claim.
    NothingToClaim,
    /// Operation would take total reserve to or below the protected floor.
    FloorBreach,
    /// Parameter outside its admin-time bound.
    InvalidParam,
}

pub type Result<T> = core::result::Result<T, ReserveError>;

// ============================================================================
// Parameters
// ============================================================================

/// Admin-mutable pool configuration. All fields 8-byte aligned.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolParams {
    /// Trade fee in basis points (bounded by MAX_FEE_BPS).
    pub fee_bps: u64,
    /// Thaw caller reward in basis points (bounded by MAX_CALLER_REWARD_BPS).
    pub caller_reward_bps: u64,
    /// Per-transaction mint cap for buys.
    pub max_mint_per_tx: U128,
    /// Pricing floor for the active reserve (avoids singularities).
    pub min_active: U128,
    /// Circuit breaker: trading halts while active reserve is below this.
    pub halt_below: U128,
    /// Minimum seconds between thaw calls.
    pub thaw_interval_sec: u64,
    /// Thaw throttle numerator.
    pub lambda_num: u64,
    /// Thaw throttle denominator (> 0).
    pub lambda_den: u64,
    /// Yield rate numerator.
    pub yield_num: u64,
    /// Yield rate denominator (> 0), applied together with WAD.
    pub yield_den: u64,
    /// Minimum slots between trades per holder (anti-flash spacing).
    pub min_slots_between_trades: u64,
    /// Total reserve may never be drawn to or below this by claims/drains.
    pub protected_floor: U128,
}

impl PoolParams {
    pub fn validate(&self) -> Result<()> {
        if self.fee_bps > MAX_FEE_BPS {
            return Err(ReserveError::InvalidParam);
        }
        if self.caller_reward_bps > MAX_CALLER_REWARD_BPS {
            return Err(ReserveError::InvalidParam);
        }
        if self.lambda_den == 0 || self.yield_den == 0 {
            return Err(ReserveError::InvalidParam);
        }
        Ok(())
    }
}

/// Keys for the bounded single-parameter setter. Encoded as one byte on the
/// wire; decoded with `num_traits::FromPrimitive`.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
pub enum ParamKey {
    FeeBps = 0,
    CallerRewardBps = 1,
    MaxMintPerTx = 2,
    MinActive = 3,
    HaltBelow = 4,
    ThawIntervalSec = 5,
    LambdaNum = 6,
    LambdaDen = 7,
    YieldNum = 8,
    YieldDen = 9,
    MinSlotsBetweenTrades = 10,
    ProtectedFloor = 11,
}

// ============================================================================
// Holder Accounts
// ============================================================================

/// Accrual checkpoint exists (set on first balance-affecting touch).
pub const FLAG_CHECKPOINT_SET: u64 = 1;
/// Holder has traded at least once (last_trade_slot is meaningful).
pub const FLAG_HAS_TRADED: u64 = 1 << 1;

/// Per-holder slot: participation balance, yield accrual checkpoint and the
/// trade throttle. Owner signature checks are done by the wrapper.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Holder {
    /// Owner pubkey bytes (zero until assigned).
    pub owner: [u8; 32],
    /// Participation-token balance.
    pub balance: U128,
    /// Claimable yield, reserve units. Monotone except on claim.
    pub accrued: U128,
    /// Slot of the last accrual checkpoint.
    pub last_accrual_slot: u64,
    /// Slot of the last buy/sell (shared across both directions).
    pub last_trade_slot: u64,
    /// FLAG_* bits.
    pub flags: u64,
}

fn empty_holder() -> Holder {
    Holder {
        owner: [0; 32],
        balance: U128::ZERO,
        accrued: U128::ZERO,
        last_accrual_slot: 0,
        last_trade_slot: 0,
        flags: 0,
    }
}

// ============================================================================
// Operation Outcomes
// ============================================================================
//
// The engine cannot log; outcomes carry everything the wrapper needs to emit
// notifications, including yield accrued by the implicit sync hooks.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BuyOutcome {
    pub minted: u128,
    pub fee: u128,
    /// Yield accrued to the buyer by the mint hook.
    pub accrued: u128,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SellOutcome {
    pub net_out: u128,
    pub fee: u128,
    /// Yield accrued to the seller by the pre-sale sync.
    pub accrued: u128,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThawOutcome {
    /// Amount removed from the dormant tranche (reward included).
    pub released: u128,
    /// Portion paid to the calling keeper, out of custody.
    pub reward: u128,
    pub active_after: u128,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClaimOutcome {
    /// Amount actually paid (capped; remainder forfeited).
    pub paid: u128,
    /// Yield accrued by the claim-time sync.
    pub accrued: u128,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferOutcome {
    pub from_accrued: u128,
    pub to_accrued: u128,
}

// ============================================================================
// Engine
// ============================================================================

/// The reserve engine. One instance per pool, zero-copied out of the slab.
#[repr(C)]
pub struct ReserveEngine {
    /// Admin-mutable configuration.
    pub params: PoolParams,

    /// Total reserve custody, smallest reserve-token denomination.
    pub total_reserve: U128,

    /// Active sub-balance: pricing backing, available for redemption.
    /// Dormant is always derived as total_reserve - active_reserve.
    pub active_reserve: U128,

    /// Participation tokens outstanding (ledger aggregate).
    pub token_supply: U128,

    /// Unix timestamp of the last thaw checkpoint.
    pub last_thaw_ts: u64,

    /// Occupied holder slots (O(1) counter for the bitmap).
    pub num_used_holders: u16,
    pub _padding: [u8; 6],

    /// Occupancy bitmap over `holders`.
    pub used: [u64; BITMAP_WORDS],

    /// Holder table. Slots are never recycled.
    pub holders: [Holder; MAX_HOLDERS],
}

impl ReserveEngine {
    /// Create a new engine. Stack-allocates the full struct; on BPF use
    /// `init_in_place` on a zeroed slab instead.
    pub fn new(
        params: PoolParams,
        initial_total: u128,
        initial_active: u128,
        now_ts: u64,
    ) -> Result<Self> {
        let mut engine = Self {
            params,
            total_reserve: U128::ZERO,
            active_reserve: U128::ZERO,
            token_supply: U128::ZERO,
            last_thaw_ts: 0,
            num_used_holders: 0,
            _padding: [0; 6],
            used: [0; BITMAP_WORDS],
            holders: [empty_holder(); MAX_HOLDERS],
        };
        engine.init_in_place(params, initial_total, initial_active, now_ts)?;
        Ok(engine)
    }

    /// Initialize an engine whose backing memory is already zeroed.
    /// The zeroed holder table and bitmap are already valid.
    pub fn init_in_place(
        &mut self,
        params: PoolParams,
        initial_total: u128,
        initial_active: u128,
        now_ts: u64,
    ) -> Result<()> {
        params.validate()?;
        if initial_active > initial_total {
            return Err(ReserveError::InvalidParam);
        }
        self.params = params;
        self.total_reserve = U128::new(initial_total);
        self.active_reserve = U128::new(initial_active);
        self.token_supply = U128::ZERO;
        self.last_thaw_ts = now_ts;
        self.num_used_holders = 0;
        Ok(())
    }

    // ========================================
    // Bitmap
    // ========================================

    pub fn is_used(&self, idx: usize) -> bool {
        if idx >= MAX_HOLDERS {
            return false;
        }
        let w = idx >> 6;
        let b = idx & 63;
        ((self.used[w] >> b) & 1) == 1
    }

    fn set_used(&mut self, idx: usize) {
        let w = idx >> 6;
        let b = idx & 63;
        self.used[w] |= 1u64 << b;
    }

    fn for_each_used<F: FnMut(usize, &Holder)>(&self, mut f: F) {
        for (block, word) in self.used.iter().copied().enumerate() {
            let mut w = word;
            while w != 0 {
                let bit = w.trailing_zeros() as usize;
                let idx = block * 64 + bit;
                w &= w - 1;
                if idx >= MAX_HOLDERS {
                    continue;
                }
                f(idx, &self.holders[idx]);
            }
        }
    }

    // ========================================
    // Holder Management
    // ========================================

    /// Register a holder slot for `owner`. One slot per owner.
    pub fn add_holder(&mut self, owner: [u8; 32]) -> Result<u16> {
        if self.find_holder(&owner).is_some() {
            return Err(ReserveError::HolderExists);
        }
        let mut slot = None;
        for idx in 0..MAX_HOLDERS {
            if !self.is_used(idx) {
                slot = Some(idx);
                break;
            }
        }
        let idx = slot.ok_or(ReserveError::SlabFull)?;
        self.set_used(idx);
        self.num_used_holders = self.num_used_holders.saturating_add(1);
        self.holders[idx] = Holder {
            owner,
            ..empty_holder()
        };
        Ok(idx as u16)
    }

    /// Look up a holder slot by owner key.
    pub fn find_holder(&self, owner: &[u8; 32]) -> Option<u16> {
        let mut found = None;
        self.for_each_used(|idx, h| {
            if found.is_none() && &h.owner == owner {
                found = Some(idx as u16);
            }
        });
        found
    }

    pub fn holder(&self, idx: u16) -> Result<&Holder> {
        self.require_holder(idx)?;
        Ok(&self.holders[idx as usize])
    }

    fn require_holder(&self, idx: u16) -> Result<()> {
        if (idx as usize) >= MAX_HOLDERS || !self.is_used(idx as usize) {
            return Err(ReserveError::HolderNotFound);
        }
        Ok(())
    }

    // ========================================
    // Pricing (pure views of the current snapshot)
    // ========================================

    /// Dormant tranche, always derived, never stored.
    pub fn dormant(&self) -> u128 {
        self.total_reserve
            .get()
            .saturating_sub(self.active_reserve.get())
    }

    /// Active reserve floored at the configured minimum.
    pub fn effective_active(&self) -> u128 {
        core::cmp::max(self.active_reserve.get(), self.params.min_active.get())
    }

    /// Spot price, WAD fixed-point: dormant * WAD / effective_active.
    /// With no dormant backing the price is undefined; u128::MAX is the
    /// sentinel for that state.
    pub fn price_wad(&self) -> Result<u128> {
        let d = self.dormant();
        if d == 0 {
            return Ok(u128::MAX);
        }
        let ea = self.effective_active();
        if ea == 0 {
            return Ok(u128::MAX);
        }
        Ok(d.checked_mul(WAD).ok_or(ReserveError::Overflow)? / ea)
    }

    /// Tokens minted for `net_in` reserve units, floor division.
    /// Rounds in favor of the reserve. Zero when there is no dormant backing.
    pub fn tokens_for_value(&self, net_in: u128) -> Result<u128> {
        let d = self.dormant();
        if d == 0 {
            return Ok(0);
        }
        Ok(net_in
            .checked_mul(self.effective_active())
            .ok_or(ReserveError::Overflow)?
            / d)
    }

    /// Reserve units for `amount` tokens, floor division.
    pub fn value_for_tokens(&self, amount: u128) -> Result<u128> {
        let ea = self.effective_active();
        if ea == 0 {
            return Ok(0);
        }
        Ok(amount
            .checked_mul(self.dormant())
            .ok_or(ReserveError::Overflow)?
            / ea)
    }

    // ========================================
    // Participation Ledger (mint/burn/transfer with accrual hook)
    // ========================================
    //
    // The accrual sync runs BEFORE each balance change, so accrual is always
    // computed against the pre-touch balance.

    fn mint(&mut self, idx: u16, amount: u128, now_slot: u64) -> Result<u128> {
        let accrued = self.sync_holder(idx, now_slot)?;
        let h = &mut self.holders[idx as usize];
        h.balance = U128::new(
            h.balance
                .get()
                .checked_add(amount)
                .ok_or(ReserveError::Overflow)?,
        );
        self.token_supply = U128::new(
            self.token_supply
                .get()
                .checked_add(amount)
                .ok_or(ReserveError::Overflow)?,
        );
        Ok(accrued)
    }

    fn burn(&mut self, idx: u16, amount: u128, now_slot: u64) -> Result<u128> {
        let accrued = self.sync_holder(idx, now_slot)?;
        let h = &mut self.holders[idx as usize];
        h.balance = U128::new(
            h.balance
                .get()
                .checked_sub(amount)
                .ok_or(ReserveError::InsufficientBalance)?,
        );
        self.token_supply = U128::new(
            self.token_supply
                .get()
                .checked_sub(amount)
                .ok_or(ReserveError::Overflow)?,
        );
        Ok(accrued)
    }

    /// Move participation tokens between holder slots. The accrual hook fires
    /// for both sides against their pre-transfer balances.
    pub fn transfer_shares(
        &mut self,
        from: u16,
        to: u16,
        amount: u128,
        now_slot: u64,
    ) -> Result<TransferOutcome> {
        if amount == 0 {
            return Err(ReserveError::ZeroAmount);
        }
        self.require_holder(from)?;
        self.require_holder(to)?;
        if self.holders[from as usize].balance.get() < amount {
            return Err(ReserveError::InsufficientBalance);
        }
        let from_accrued = self.sync_holder(from, now_slot)?;
        let to_accrued = self.sync_holder(to, now_slot)?;
        let fb = self.holders[from as usize].balance.get();
        self.holders[from as usize].balance = U128::new(fb - amount);
        let tb = self.holders[to as usize]
            .balance
            .get()
            .checked_add(amount)
            .ok_or(ReserveError::Overflow)?;
        self.holders[to as usize].balance = U128::new(tb);
        Ok(TransferOutcome {
            from_accrued,
            to_accrued,
        })
    }

    // ========================================
    // Yield Accrual
    // ========================================

    /// Advance the holder's accrual checkpoint to `now_slot`, crediting
    /// balance * elapsed * yield_num / (yield_den * WAD) computed against the
    /// pre-touch balance. First touch only records the baseline.
    /// Returns the freshly accrued amount.
    pub fn sync_holder(&mut self, idx: u16, now_slot: u64) -> Result<u128> {
        self.require_holder(idx)?;
        let yield_num = self.params.yield_num;
        let yield_den = self.params.yield_den;
        let h = &mut self.holders[idx as usize];

        if h.flags & FLAG_CHECKPOINT_SET == 0 {
            h.last_accrual_slot = now_slot;
            h.flags |= FLAG_CHECKPOINT_SET;
            return Ok(0);
        }
        if now_slot <= h.last_accrual_slot {
            return Ok(0);
        }
        let bal = h.balance.get();
        if bal == 0 {
            h.last_accrual_slot = now_slot;
            return Ok(0);
        }

        let elapsed = now_slot - h.last_accrual_slot;
        let num = bal
            .checked_mul(elapsed as u128)
            .ok_or(ReserveError::Overflow)?
            .checked_mul(yield_num as u128)
            .ok_or(ReserveError::Overflow)?;
        let den = (yield_den as u128)
            .checked_mul(WAD)
            .ok_or(ReserveError::Overflow)?;
        let accrual = num / den;
        if accrual > 0 {
            h.accrued = U128::new(
                h.accrued
                    .get()
                    .checked_add(accrual)
                    .ok_or(ReserveError::Overflow)?,
            );
        }
        h.last_accrual_slot = now_slot;
        Ok(accrual)
    }

    /// Claim accrued yield, capped at min(dormant, total - protected_floor).
    /// The accrued balance is zeroed unconditionally on payout: any excess
    /// above the cap is forfeited, not carried forward.
    pub fn claim_yield(&mut self, idx: u16, now_slot: u64) -> Result<ClaimOutcome> {
        self.require_holder(idx)?;
        let accrued_delta = self.sync_holder(idx, now_slot)?;

        let accrued = self.holders[idx as usize].accrued.get();
        if accrued == 0 {
            return Err(ReserveError::NothingToClaim);
        }
        let total = self.total_reserve.get();
        let floor = self.params.protected_floor.get();
        if total <= floor {
            return Err(ReserveError::FloorBreach);
        }
        let excess = total - floor;
        let max_pay = core::cmp::min(self.dormant(), excess);
        let owed = core::cmp::min(accrued, max_pay);
        if owed == 0 {
            return Ok(ClaimOutcome {
                paid: 0,
                accrued: accrued_delta,
            });
        }

        // Paid out of the dormant tranche: total shrinks, active is untouched.
        self.total_reserve = U128::new(total - owed);
        self.holders[idx as usize].accrued = U128::ZERO;
        Ok(ClaimOutcome {
            paid: owed,
            accrued: accrued_delta,
        })
    }

    pub fn accrued_for(&self, idx: u16) -> Result<u128> {
        Ok(self.holder(idx)?.accrued.get())
    }

    // ========================================
    // Trade Throttle
    // ========================================

    fn check_trade_spacing(&self, idx: u16, now_slot: u64) -> Result<()> {
        let h = &self.holders[idx as usize];
        if h.flags & FLAG_HAS_TRADED != 0 {
            let next_ok = h
                .last_trade_slot
                .checked_add(self.params.min_slots_between_trades)
                .ok_or(ReserveError::Overflow)?;
            if now_slot < next_ok {
                return Err(ReserveError::CooldownActive);
            }
        }
        Ok(())
    }

    fn record_trade(&mut self, idx: u16, now_slot: u64) {
        let h = &mut self.holders[idx as usize];
        h.last_trade_slot = now_slot;
        h.flags |= FLAG_HAS_TRADED;
    }

    fn check_not_halted(&self) -> Result<()> {
        if self.active_reserve.get() < self.params.halt_below.get() {
            return Err(ReserveError::Halted);
        }
        Ok(())
    }

    // ========================================
    // Trading
    // ========================================

    /// Buy participation tokens with `value_in` reserve units. The output is
    /// quoted against the pre-trade snapshot; the entire incoming value
    /// (fee included) lands in the active reserve, so the dormant tranche is
    /// unchanged by construction.
    pub fn buy(
        &mut self,
        idx: u16,
        value_in: u128,
        min_tokens_out: u128,
        now_slot: u64,
    ) -> Result<BuyOutcome> {
        if value_in == 0 {
            return Err(ReserveError::ZeroAmount);
        }
        self.require_holder(idx)?;
        self.check_not_halted()?;
        self.check_trade_spacing(idx, now_slot)?;

        let fee = value_in
            .checked_mul(self.params.fee_bps as u128)
            .ok_or(ReserveError::Overflow)?
            / BPS_DENOM;
        let net = value_in - fee;
        let out = self.tokens_for_value(net)?;
        if out > self.params.max_mint_per_tx.get() {
            return Err(ReserveError::CapExceeded);
        }
        if out == 0 {
            return Err(ReserveError::ZeroOutput);
        }
        if out < min_tokens_out {
            return Err(ReserveError::SlippageExceeded);
        }

        self.total_reserve = U128::new(
            self.total_reserve
                .get()
                .checked_add(value_in)
                .ok_or(ReserveError::Overflow)?,
        );
        self.active_reserve = U128::new(
            self.active_reserve
                .get()
                .checked_add(value_in)
                .ok_or(ReserveError::Overflow)?,
        );
        let accrued = self.mint(idx, out, now_slot)?;
        self.record_trade(idx, now_slot);
        Ok(BuyOutcome {
            minted: out,
            fee,
            accrued,
        })
    }

    /// Redeem `token_amount` participation tokens. The fee portion of the
    /// gross redemption is recycled into the active reserve; only the net
    /// leaves custody, so the dormant tranche is unchanged.
    pub fn sell(
        &mut self,
        idx: u16,
        token_amount: u128,
        min_value_out: u128,
        now_slot: u64,
    ) -> Result<SellOutcome> {
        if token_amount == 0 {
            return Err(ReserveError::ZeroAmount);
        }
        self.require_holder(idx)?;
        if self.holders[idx as usize].balance.get() < token_amount {
            return Err(ReserveError::InsufficientBalance);
        }
        self.check_not_halted()?;
        self.check_trade_spacing(idx, now_slot)?;

        // Accrual must reflect the pre-sale balance.
        let accrued = self.sync_holder(idx, now_slot)?;

        let gross = self.value_for_tokens(token_amount)?;
        if gross == 0 {
            return Err(ReserveError::ZeroOutput);
        }
        let active = self.active_reserve.get();
        if active < gross {
            return Err(ReserveError::InsufficientActiveReserve);
        }
        let fee = gross
            .checked_mul(self.params.fee_bps as u128)
            .ok_or(ReserveError::Overflow)?
            / BPS_DENOM;
        let net = gross - fee;
        if net < min_value_out {
            return Err(ReserveError::SlippageExceeded);
        }

        self.burn(idx, token_amount, now_slot)?;
        self.active_reserve = U128::new(active - gross + fee);
        self.total_reserve = U128::new(
            self.total_reserve
                .get()
                .checked_sub(net)
                .ok_or(ReserveError::Overflow)?,
        );
        self.record_trade(idx, now_slot);
        Ok(SellOutcome {
            net_out: net,
            fee,
            accrued,
        })
    }

    /// Grow both counters by the same delta, leaving dormant unchanged.
    pub fn deposit(&mut self, amount: u128) -> Result<()> {
        if amount == 0 {
            return Err(ReserveError::ZeroAmount);
        }
        self.total_reserve = U128::new(
            self.total_reserve
                .get()
                .checked_add(amount)
                .ok_or(ReserveError::Overflow)?,
        );
        self.active_reserve = U128::new(
            self.active_reserve
                .get()
                .checked_add(amount)
                .ok_or(ReserveError::Overflow)?,
        );
        Ok(())
    }

    // ========================================
    // Thaw
    // ========================================

    /// Release a time- and magnitude-capped slice of the dormant gap into the
    /// active reserve, paying the caller a reward out of custody.
    ///
    /// Hard precondition: once per thaw interval. A zero gap or a candidate
    /// floored to zero is a zero-release no-op that still advances the
    /// checkpoint.
    pub fn thaw(&mut self, now_ts: u64) -> Result<ThawOutcome> {
        let next_ok = self
            .last_thaw_ts
            .checked_add(self.params.thaw_interval_sec)
            .ok_or(ReserveError::Overflow)?;
        if now_ts < next_ok {
            return Err(ReserveError::ThawTooSoon);
        }

        let active = self.active_reserve.get();
        let gap = self.dormant().saturating_sub(active);
        if gap == 0 {
            self.last_thaw_ts = now_ts;
            return Ok(ThawOutcome {
                released: 0,
                reward: 0,
                active_after: active,
            });
        }

        let elapsed = now_ts - self.last_thaw_ts;
        let num = (self.params.lambda_num as u128)
            .checked_mul(elapsed as u128)
            .ok_or(ReserveError::Overflow)?;
        let mut den = (self.params.lambda_den as u128)
            .checked_mul(self.params.thaw_interval_sec as u128)
            .ok_or(ReserveError::Overflow)?;
        if den == 0 {
            den = 1;
        }
        let mut candidate = gap.checked_mul(num).ok_or(ReserveError::Overflow)? / den;
        candidate = core::cmp::min(candidate, gap / THAW_GAP_DIVISOR);
        candidate = core::cmp::min(candidate, gap);
        if candidate == 0 {
            self.last_thaw_ts = now_ts;
            return Ok(ThawOutcome {
                released: 0,
                reward: 0,
                active_after: active,
            });
        }

        let reward = candidate
            .checked_mul(self.params.caller_reward_bps as u128)
            .ok_or(ReserveError::Overflow)?
            / BPS_DENOM;
        let to_active = candidate - reward;
        self.active_reserve = U128::new(
            active.checked_add(to_active).ok_or(ReserveError::Overflow)?,
        );
        // The reward physically leaves custody; dormant shrinks by the full
        // candidate.
        self.total_reserve = U128::new(
            self.total_reserve
                .get()
                .checked_sub(reward)
                .ok_or(ReserveError::Overflow)?,
        );
        self.last_thaw_ts = now_ts;
        Ok(ThawOutcome {
            released: candidate,
            reward,
            active_after: self.active_reserve.get(),
        })
    }

    // ========================================
    // Governance
    // ========================================

    /// Bounded single-parameter setter.
    pub fn set_param(&mut self, key: ParamKey, value: u128) -> Result<()> {
        fn as_u64(value: u128) -> Result<u64> {
            u64::try_from(value).map_err(|_| ReserveError::InvalidParam)
        }
        match key {
            ParamKey::FeeBps => {
                let v = as_u64(value)?;
                if v > MAX_FEE_BPS {
                    return Err(ReserveError::InvalidParam);
                }
                self.params.fee_bps = v;
            }
            ParamKey::CallerRewardBps => {
                let v = as_u64(value)?;
                if v > MAX_CALLER_REWARD_BPS {
                    return Err(ReserveError::InvalidParam);
                }
                self.params.caller_reward_bps = v;
            }
            ParamKey::MaxMintPerTx => self.params.max_mint_per_tx = U128::new(value),
            ParamKey::MinActive => self.params.min_active = U128::new(value),
            ParamKey::HaltBelow => self.params.halt_below = U128::new(value),
            ParamKey::ThawIntervalSec => self.params.thaw_interval_sec = as_u64(value)?,
            ParamKey::LambdaNum => self.params.lambda_num = as_u64(value)?,
            ParamKey::LambdaDen => {
                let v = as_u64(value)?;
                if v == 0 {
                    return Err(ReserveError::InvalidParam);
                }
                self.params.lambda_den = v;
            }
            ParamKey::YieldNum => self.params.yield_num = as_u64(value)?,
            ParamKey::YieldDen => {
                let v = as_u64(value)?;
                if v == 0 {
                    return Err(ReserveError::InvalidParam);
                }
                self.params.yield_den = v;
            }
            ParamKey::MinSlotsBetweenTrades => {
                self.params.min_slots_between_trades = as_u64(value)?
            }
            ParamKey::ProtectedFloor => self.params.protected_floor = U128::new(value),
        }
        Ok(())
    }

    /// Timelock-only emergency withdrawal above the protected floor. The
    /// active deduction clamps at zero, so a large drain draws from dormant
    /// once the active reserve is exhausted.
    pub fn emergency_drain(&mut self, amount: u128) -> Result<()> {
        if amount == 0 {
            return Err(ReserveError::ZeroAmount);
        }
        let total = self.total_reserve.get();
        let floor = self.params.protected_floor.get();
        if total <= floor {
            return Err(ReserveError::FloorBreach);
        }
        if amount > total - floor {
            return Err(ReserveError::FloorBreach);
        }
        let active = self.active_reserve.get();
        self.active_reserve = U128::new(active.saturating_sub(amount));
        self.total_reserve = U128::new(total - amount);
        Ok(())
    }

    // ========================================
    // Invariants
    // ========================================

    /// Accounting identity: total == active + dormant with dormant derived
    /// and non-negative, i.e. the active reserve never exceeds custody.
    pub fn invariant_holds(&self) -> bool {
        self.active_reserve.get() <= self.total_reserve.get()
    }

    /// Full conservation check for tests and fuzzing: the accounting identity
    /// plus ledger consistency (holder balances sum to the supply).
    pub fn check_conservation(&self) -> bool {
        if !self.invariant_holds() {
            return false;
        }
        let mut sum: u128 = 0;
        let mut ok = true;
        self.for_each_used(|_, h| match sum.checked_add(h.balance.get()) {
            Some(s) => sum = s,
            None => ok = false,
        });
        ok && sum == self.token_supply.get()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_params() -> PoolParams {
        PoolParams {
            fee_bps: 30,
            caller_reward_bps: 100,
            max_mint_per_tx: U128::new(u128::MAX),
            min_active: U128::new(1),
            halt_below: U128::ZERO,
            thaw_interval_sec: 3600,
            lambda_num: 1,
            lambda_den: 1,
            yield_num: 1,
            yield_den: 1,
            min_slots_between_trades: 1,
            protected_floor: U128::new(1),
        }
    }

    #[test]
    fn u128_limbs_round_trip() {
        let v = 0x0123_4567_89ab_cdef_fedc_ba98_7654_3210u128;
        let w = U128::new(v);
        assert_eq!(w.get(), v);
        let mut z = U128::ZERO;
        z.set(v);
        assert_eq!(z.get(), v);
    }

    #[test]
    fn params_bounds_enforced() {
        let mut p = test_params();
        p.fee_bps = MAX_FEE_BPS + 1;
        assert_eq!(p.validate(), Err(ReserveError::InvalidParam));
        p = test_params();
        p.caller_reward_bps = MAX_CALLER_REWARD_BPS + 1;
        assert_eq!(p.validate(), Err(ReserveError::InvalidParam));
        p = test_params();
        p.yield_den = 0;
        assert_eq!(p.validate(), Err(ReserveError::InvalidParam));
    }

    #[test]
    fn init_rejects_active_above_total() {
        assert_eq!(
            ReserveEngine::new(test_params(), 5, 6, 0).err(),
            Some(ReserveError::InvalidParam)
        );
    }

    #[test]
    fn duplicate_holder_rejected() {
        let mut e = ReserveEngine::new(test_params(), 10, 5, 0).unwrap();
        let owner = [7u8; 32];
        let idx = e.add_holder(owner).unwrap();
        assert_eq!(e.find_holder(&owner), Some(idx));
        assert_eq!(e.add_holder(owner), Err(ReserveError::HolderExists));
    }
}
