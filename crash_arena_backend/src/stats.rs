//! Rolling service statistics, persisted across upgrades.

use crate::memory_ids::STATS_MEMORY_ID;
use crate::money::BaseUnits;
use crate::types::x100_to_f64;
use crate::Memory;
use candid::{CandidType, Deserialize};
use ic_stable_structures::memory_manager::MemoryId;
use ic_stable_structures::storable::Bound;
use ic_stable_structures::{StableCell, Storable};
use serde::Serialize;
use std::borrow::Cow;
use std::cell::RefCell;

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct GameStats {
    pub rounds_completed: u64,
    pub instant_crashes: u64,
    pub bets_accepted: u64,
    pub cashouts: u64,
    pub total_wagered: BaseUnits,
    pub total_paid_out: BaseUnits,
    pub total_deposited: BaseUnits,
    pub peak_crash_x100: u64,
}

impl Storable for GameStats {
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
    static STATS_CELL: RefCell<StableCell<GameStats, Memory>> = RefCell::new(
        StableCell::init(
            crate::MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(STATS_MEMORY_ID))),
            GameStats::default()
        )
    );
}

fn with_stats<F: FnOnce(&mut GameStats)>(mutate: F) {
    STATS_CELL.with(|cell| {
        let mut stats = cell.borrow().get().clone();
        mutate(&mut stats);
        cell.borrow_mut().set(stats);
    });
}

pub fn record_round_completed(crash_x100: u64) {
    with_stats(|s| {
        s.rounds_completed += 1;
        if crash_x100 == 100 {
            s.instant_crashes += 1;
        }
        if crash_x100 > s.peak_crash_x100 {
            s.peak_crash_x100 = crash_x100;
        }
    });
}

pub fn record_bet(stake: &BaseUnits) {
    with_stats(|s| {
        s.bets_accepted += 1;
        s.total_wagered = s.total_wagered.add(stake);
    });
}

pub fn record_payout(payout: &BaseUnits) {
    with_stats(|s| {
        s.cashouts += 1;
        s.total_paid_out = s.total_paid_out.add(payout);
    });
}

pub fn record_deposit(amount: &BaseUnits) {
    with_stats(|s| s.total_deposited = s.total_deposited.add(amount));
}

pub fn get() -> GameStats {
    STATS_CELL.with(|cell| cell.borrow().get().clone())
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug)]
pub struct StatsView {
    pub rounds_completed: u64,
    pub instant_crashes: u64,
    pub bets_accepted: u64,
    pub cashouts: u64,
    pub total_wagered: String,
    pub total_paid_out: String,
    pub total_deposited: String,
    pub peak_crash: f64,
}

impl GameStats {
    pub fn view(&self) -> StatsView {
        StatsView {
            rounds_completed: self.rounds_completed,
            instant_crashes: self.instant_crashes,
            bets_accepted: self.bets_accepted,
            cashouts: self.cashouts,
            total_wagered: self.total_wagered.format_decimal(),
            total_paid_out: self.total_paid_out.format_decimal(),
            total_deposited: self.total_deposited.format_decimal(),
            peak_crash: x100_to_f64(self.peak_crash_x100),
        }
    }
}
