//! Runtime configuration, persisted in a stable cell and admin-updatable.
//!
//! Everything a deployment tunes lives here: phase timings, the multiplier
//! curve, fairness parameters, bet bounds, indexer depths, and the chain
//! collaborators. Values are validated before they are accepted; the curve
//! constants are configurable but fixed for a deployment.

use crate::memory_ids::CONFIG_MEMORY_ID;
use crate::money::BaseUnits;
use crate::types::{is_valid_wallet, GameError};
use crate::Memory;
use candid::{CandidType, Deserialize, Principal};
use ic_stable_structures::memory_manager::MemoryId;
use ic_stable_structures::storable::Bound;
use ic_stable_structures::{StableCell, Storable};
use serde::Serialize;
use std::borrow::Cow;
use std::cell::RefCell;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    pub t_bet_secs: u64,
    pub t_settle_secs: u64,
    pub house_edge_bps: u16,
    pub instant_crash_divisor: u64,
    pub max_multiplier_x100: u64,
    pub multiplier_a: f64,
    pub multiplier_b: f64,
    pub min_bet: BaseUnits,
    pub max_bet: BaseUnits,
    pub confirmations: u64,
    pub reorg_buffer: u64,
    pub polling_interval_ms: u64,
    pub ring_buffer_size: u32,
    pub liability_kill_ratio_bps: u16,
    pub cashout_safety_ms: u64,
    pub tick_interval_ms: u64,
    pub chain_gateway: Principal,
    pub hot_wallet: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            t_bet_secs: 6,
            t_settle_secs: 3,
            house_edge_bps: 300,
            instant_crash_divisor: 33,
            max_multiplier_x100: 100_000,
            multiplier_a: 1.0024,
            multiplier_b: 1.0718,
            // 0.001 token min, 100 tokens max
            min_bet: BaseUnits::from_u128(1_000_000_000_000_000),
            max_bet: BaseUnits::from_u128(100_000_000_000_000_000_000),
            confirmations: 12,
            reorg_buffer: 25,
            polling_interval_ms: 5_000,
            ring_buffer_size: 1_024,
            liability_kill_ratio_bps: 9_500,
            cashout_safety_ms: 50,
            tick_interval_ms: 50,
            chain_gateway: Principal::anonymous(),
            hot_wallet: "0x0000000000000000000000000000000000000000".to_string(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        if self.t_bet_secs == 0 || self.t_bet_secs > 300 {
            return Err("t_bet_secs out of range".to_string());
        }
        if self.t_settle_secs == 0 || self.t_settle_secs > 60 {
            return Err("t_settle_secs out of range".to_string());
        }
        if self.house_edge_bps > 500 {
            return Err("house_edge_bps must be at most 500 (5%)".to_string());
        }
        if self.instant_crash_divisor < 2 {
            return Err("instant_crash_divisor must be at least 2".to_string());
        }
        if self.max_multiplier_x100 < 101 {
            return Err("max_multiplier_x100 must exceed 1.00x".to_string());
        }
        if !self.multiplier_a.is_finite() || self.multiplier_a < 1.0 {
            return Err("multiplier_a must be finite and at least 1.0".to_string());
        }
        if !self.multiplier_b.is_finite() || self.multiplier_b <= 1.0 {
            return Err("multiplier_b must be finite and above 1.0".to_string());
        }
        if self.min_bet.is_zero() || self.min_bet > self.max_bet {
            return Err("bet bounds must satisfy 0 < min_bet <= max_bet".to_string());
        }
        if self.confirmations == 0 {
            return Err("confirmations must be at least 1".to_string());
        }
        // Credits must only happen past the reorg depth, so the scan horizon
        // must sit at or beyond the confirmation threshold.
        if self.reorg_buffer < self.confirmations {
            return Err("reorg_buffer must be at least confirmations".to_string());
        }
        if self.polling_interval_ms < 500 {
            return Err("polling_interval_ms must be at least 500".to_string());
        }
        if self.ring_buffer_size < 16 {
            return Err("ring_buffer_size must be at least 16".to_string());
        }
        if self.liability_kill_ratio_bps == 0 || self.liability_kill_ratio_bps > 10_000 {
            return Err("liability_kill_ratio_bps out of range".to_string());
        }
        if self.cashout_safety_ms > 5_000 {
            return Err("cashout_safety_ms out of range".to_string());
        }
        if self.tick_interval_ms < 10 || self.tick_interval_ms > 1_000 {
            return Err("tick_interval_ms out of range".to_string());
        }
        if !is_valid_wallet(&self.hot_wallet) {
            return Err("hot_wallet must be 0x + 40 hex chars".to_string());
        }
        Ok(())
    }
}

impl Storable for Config {
    fn to_bytes(&self) -> Cow<[u8]> {
        Cow::Owned(serde_json::to_vec(self).unwrap())
    }

    fn into_bytes(self) -> Vec<u8> {
        serde_json::to_vec(&self).unwrap()
    }

    fn from_bytes(bytes: Cow<[u8]>) -> Self {
        serde_json::from_slice(&bytes).unwrap()
    }

    const BOUND: Bound = Bound::Unbounded;
}

thread_local! {
    static CONFIG_CELL: RefCell<StableCell<Config, Memory>> = RefCell::new(
        StableCell::init(
            crate::MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(CONFIG_MEMORY_ID))),
            Config::default()
        )
    );
}

pub fn get() -> Config {
    CONFIG_CELL.with(|cell| cell.borrow().get().clone())
}

pub fn set(config: Config) -> Result<(), GameError> {
    config
        .validate()
        .map_err(|reason| GameError::InvalidRequest { reason })?;
    CONFIG_CELL.with(|cell| {
        cell.borrow_mut().set(config);
    });
    Ok(())
}

// =============================================================================
// WIRE VIEW
// =============================================================================

/// Candid-facing form of the config: amounts as decimal strings.
#[derive(CandidType, Serialize, Deserialize, Clone, Debug)]
pub struct ConfigView {
    pub t_bet_secs: u64,
    pub t_settle_secs: u64,
    pub house_edge_bps: u16,
    pub instant_crash_divisor: u64,
    pub max_multiplier: f64,
    pub multiplier_a: f64,
    pub multiplier_b: f64,
    pub min_bet: String,
    pub max_bet: String,
    pub confirmations: u64,
    pub reorg_buffer: u64,
    pub polling_interval_ms: u64,
    pub ring_buffer_size: u32,
    pub liability_kill_ratio_bps: u16,
    pub cashout_safety_ms: u64,
    pub tick_interval_ms: u64,
    pub chain_gateway: Principal,
    pub hot_wallet: String,
}

impl Config {
    pub fn view(&self) -> ConfigView {
        ConfigView {
            t_bet_secs: self.t_bet_secs,
            t_settle_secs: self.t_settle_secs,
            house_edge_bps: self.house_edge_bps,
            instant_crash_divisor: self.instant_crash_divisor,
            max_multiplier: crate::types::x100_to_f64(self.max_multiplier_x100),
            multiplier_a: self.multiplier_a,
            multiplier_b: self.multiplier_b,
            min_bet: self.min_bet.format_decimal(),
            max_bet: self.max_bet.format_decimal(),
            confirmations: self.confirmations,
            reorg_buffer: self.reorg_buffer,
            polling_interval_ms: self.polling_interval_ms,
            ring_buffer_size: self.ring_buffer_size,
            liability_kill_ratio_bps: self.liability_kill_ratio_bps,
            cashout_safety_ms: self.cashout_safety_ms,
            tick_interval_ms: self.tick_interval_ms,
            chain_gateway: self.chain_gateway,
            hot_wallet: self.hot_wallet.clone(),
        }
    }

    pub fn from_view(view: ConfigView) -> Result<Self, GameError> {
        let min_bet = BaseUnits::parse_decimal(&view.min_bet)
            .map_err(|reason| GameError::InvalidAmount { reason })?;
        let max_bet = BaseUnits::parse_decimal(&view.max_bet)
            .map_err(|reason| GameError::InvalidAmount { reason })?;
        let max_multiplier_x100 = crate::types::multiplier_to_x100(view.max_multiplier)
            .ok_or_else(|| GameError::InvalidRequest {
                reason: "max_multiplier must be finite".to_string(),
            })?;
        Ok(Self {
            t_bet_secs: view.t_bet_secs,
            t_settle_secs: view.t_settle_secs,
            house_edge_bps: view.house_edge_bps,
            instant_crash_divisor: view.instant_crash_divisor,
            max_multiplier_x100,
            multiplier_a: view.multiplier_a,
            multiplier_b: view.multiplier_b,
            min_bet,
            max_bet,
            confirmations: view.confirmations,
            reorg_buffer: view.reorg_buffer,
            polling_interval_ms: view.polling_interval_ms,
            ring_buffer_size: view.ring_buffer_size,
            liability_kill_ratio_bps: view.liability_kill_ratio_bps,
            cashout_safety_ms: view.cashout_safety_ms,
            tick_interval_ms: view.tick_interval_ms,
            chain_gateway: view.chain_gateway,
            hot_wallet: view.hot_wallet,
        })
    }
}
