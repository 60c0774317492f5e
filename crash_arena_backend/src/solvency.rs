//! Solvency watchdog and kill switch.
//!
//! Every pass reads three numbers: the snapshot account totals, the balance
//! reconstructed from the journal alone, and the hot wallet's on-chain
//! balance (through the gateway, cached between passes). Any disagreement
//! between journal and snapshots, or a liability ratio past the configured
//! threshold, raises the kill switch: no new rounds, no new bet locks, no
//! non-deposit credits. Deposits keep crediting and in-flight cashouts
//! complete. Discrepancies are never "fixed" automatically; they stop the
//! game and wait for an operator.

use crate::accounting::guard::{LoopGuard, LoopKind};
use crate::accounting::store;
use crate::config::{self, Config};
use crate::memory_ids::KILL_SWITCH_MEMORY_ID;
use crate::money::BaseUnits;
use crate::Memory;
use candid::{CandidType, Principal};
use ic_cdk::call::Call;
use ic_stable_structures::memory_manager::MemoryId;
use ic_stable_structures::storable::Bound;
use ic_stable_structures::{StableCell, Storable};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::cell::RefCell;
use std::time::Duration;

const CHECK_INTERVAL_SECS: u64 = 10;

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct KillState {
    pub active: bool,
    pub reason: String,
    pub raised_at: u64,
}

impl Storable for KillState {
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

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, Default)]
pub struct SolvencyReport {
    /// Signed decimal difference between snapshot totals and the journal
    /// reconstruction; "0" when they agree.
    pub ledger_snapshot_drift: String,
    pub drift_detected: bool,
    pub onchain_liability_ratio_bps: u64,
    pub onchain_balance: String,
    pub total_liabilities: String,
    pub checked_at: u64,
}

thread_local! {
    static KILL_SWITCH: RefCell<StableCell<KillState, Memory>> = RefCell::new(
        StableCell::init(
            crate::MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(KILL_SWITCH_MEMORY_ID))),
            KillState::default()
        )
    );

    // Cached hot-wallet balance, refreshed each watchdog pass. Zero means
    // "not fetched yet" and disables the on-chain checks rather than
    // blocking the whole game on a cold cache.
    static CACHED_ONCHAIN: RefCell<BaseUnits> = RefCell::new(BaseUnits::zero());

    static LAST_REPORT: RefCell<SolvencyReport> = RefCell::new(SolvencyReport::default());
}

// =============================================================================
// KILL SWITCH
// =============================================================================

pub fn kill_switch_active() -> bool {
    KILL_SWITCH.with(|cell| cell.borrow().get().active)
}

pub fn kill_reason() -> String {
    KILL_SWITCH.with(|cell| cell.borrow().get().reason.clone())
}

pub fn kill_state() -> KillState {
    KILL_SWITCH.with(|cell| cell.borrow().get().clone())
}

/// Operator override in both directions. Clearing the switch while the
/// underlying condition persists just gets it re-raised on the next pass.
pub fn set_kill_switch(active: bool, reason: String, now: u64) {
    KILL_SWITCH.with(|cell| {
        cell.borrow_mut().set(KillState {
            active,
            reason,
            raised_at: if active { now } else { 0 },
        });
    });
    ic_cdk::println!("Kill switch set to {} by operator", active);
}

fn raise(reason: &str, now: u64) {
    let already = kill_switch_active();
    if already {
        return;
    }
    KILL_SWITCH.with(|cell| {
        cell.borrow_mut().set(KillState {
            active: true,
            reason: reason.to_string(),
            raised_at: now,
        });
    });
    ic_cdk::println!("CRITICAL: kill switch raised: {}", reason);
}

/// Whether paying a profit that brings total liabilities to `projected`
/// stays covered by the hot wallet. A cold cache (zero) never blocks.
pub fn payout_within_limits(projected: &BaseUnits) -> bool {
    CACHED_ONCHAIN.with(|cache| {
        let onchain = cache.borrow();
        onchain.is_zero() || *projected <= *onchain
    })
}

#[cfg(test)]
pub fn set_cached_onchain_for_tests(balance: BaseUnits) {
    CACHED_ONCHAIN.with(|cache| *cache.borrow_mut() = balance);
}

// =============================================================================
// WATCHDOG LOOP
// =============================================================================

pub fn start() {
    schedule_check(Duration::from_secs(CHECK_INTERVAL_SECS));
}

fn schedule_check(delay: Duration) {
    ic_cdk_timers::set_timer(delay, async {
        check_once().await;
    });
}

async fn check_once() {
    let Some(_guard) = LoopGuard::acquire(LoopKind::SolvencyCheck) else {
        schedule_check(Duration::from_secs(CHECK_INTERVAL_SECS));
        return;
    };

    let cfg = config::get();
    refresh_onchain_balance(&cfg).await;
    run_reconciliation(&cfg, ic_cdk::api::time());

    schedule_check(Duration::from_secs(CHECK_INTERVAL_SECS));
}

async fn refresh_onchain_balance(cfg: &Config) {
    if cfg.chain_gateway == Principal::anonymous() {
        return;
    }
    let result = Call::unbounded_wait(cfg.chain_gateway, "native_balance")
        .with_arg(cfg.hot_wallet.clone())
        .await;
    match result {
        Ok(response) => match response.candid::<String>() {
            Ok(raw) => match BaseUnits::parse_decimal(&raw) {
                Ok(balance) => {
                    CACHED_ONCHAIN.with(|cache| *cache.borrow_mut() = balance);
                }
                Err(e) => ic_cdk::println!("Hot-wallet balance unparsable: {}", e),
            },
            Err(e) => ic_cdk::println!("Hot-wallet balance decode failed: {:?}", e),
        },
        // Transient: keep the cached value and try again next pass.
        Err(e) => ic_cdk::println!("Hot-wallet balance refresh failed: {:?}", e),
    }
}

/// The synchronous heart of the watchdog: compare snapshots, journal, and
/// the cached on-chain balance, publish the metrics, raise the switch when
/// an invariant breaks.
pub fn run_reconciliation(cfg: &Config, now: u64) -> SolvencyReport {
    let (available, locked) = store::snapshot_totals();
    let snapshot_total = available.add(&locked);
    let journal_total = store::journal_signed_total();
    let cached_cell = store::liabilities();

    let (drift, drift_detected) = match &journal_total {
        Some(journal) => {
            if *journal == snapshot_total && *journal == cached_cell {
                ("0".to_string(), false)
            } else if let Some(excess) = snapshot_total.checked_sub(journal) {
                (format!("+{}", excess.format_decimal()), true)
            } else {
                let missing = journal
                    .checked_sub(&snapshot_total)
                    .unwrap_or_else(BaseUnits::zero);
                (format!("-{}", missing.format_decimal()), true)
            }
        }
        // Debits exceeding credits means the journal itself is broken.
        None => ("journal-negative".to_string(), true),
    };

    let onchain = CACHED_ONCHAIN.with(|cache| cache.borrow().clone());
    let ratio_bps = snapshot_total.ratio_bps_of(&onchain).unwrap_or(0);

    if drift_detected {
        raise("ledger/snapshot drift detected", now);
    }
    if !onchain.is_zero() && ratio_bps > cfg.liability_kill_ratio_bps as u64 {
        raise("liability ratio exceeds the configured threshold", now);
    }

    let report = SolvencyReport {
        ledger_snapshot_drift: drift,
        drift_detected,
        onchain_liability_ratio_bps: ratio_bps,
        onchain_balance: onchain.format_decimal(),
        total_liabilities: snapshot_total.format_decimal(),
        checked_at: now,
    };
    LAST_REPORT.with(|r| *r.borrow_mut() = report.clone());
    report
}

pub fn last_report() -> SolvencyReport {
    LAST_REPORT.with(|r| r.borrow().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::engine;

    fn user(n: u8) -> Principal {
        Principal::from_slice(&[n, 0x50])
    }

    #[test]
    fn clean_books_report_zero_drift() {
        let cfg = config::get();
        let u = user(1);
        engine::record_deposit("0xs01", 0, u, &BaseUnits::from_u64(1_000), 1).unwrap();
        engine::place_bet(u, &BaseUnits::from_u64(400), 1, "C1", 1, 2).unwrap();

        let report = run_reconciliation(&cfg, 3);
        assert!(!report.drift_detected);
        assert_eq!(report.ledger_snapshot_drift, "0");
        assert!(!kill_switch_active());
    }

    #[test]
    fn tampered_snapshot_raises_the_switch() {
        let cfg = config::get();
        let u = user(2);
        engine::record_deposit("0xs02", 0, u, &BaseUnits::from_u64(1_000), 1).unwrap();

        // Corrupt the snapshot behind the engine's back.
        let mut account = store::get_account(&u);
        account.available = account.available.add(&BaseUnits::from_u64(5));
        store::put_account(u, account);

        let report = run_reconciliation(&cfg, 2);
        assert!(report.drift_detected);
        assert_eq!(report.ledger_snapshot_drift, "+0.000000000000000005");
        assert!(kill_switch_active());

        // Clearing without fixing gets re-raised on the next pass.
        set_kill_switch(false, String::new(), 3);
        run_reconciliation(&cfg, 4);
        assert!(kill_switch_active());
    }

    #[test]
    fn liability_ratio_triggers_past_threshold() {
        let cfg = config::get();
        let u = user(3);
        engine::record_deposit("0xs03", 0, u, &BaseUnits::from_u64(960), 1).unwrap();

        set_cached_onchain_for_tests(BaseUnits::from_u64(1_000));
        let report = run_reconciliation(&cfg, 2);
        // 96% > 95% default threshold
        assert_eq!(report.onchain_liability_ratio_bps, 9_600);
        assert!(kill_switch_active());
    }

    #[test]
    fn payout_limits_respect_cached_balance() {
        assert!(payout_within_limits(&BaseUnits::from_u64(u64::MAX)));
        set_cached_onchain_for_tests(BaseUnits::from_u64(100));
        assert!(payout_within_limits(&BaseUnits::from_u64(100)));
        assert!(!payout_within_limits(&BaseUnits::from_u64(101)));
    }

    #[test]
    fn kill_switch_blocks_new_locks_only() {
        let u = user(4);
        engine::record_deposit("0xs04", 0, u, &BaseUnits::from_u64(1_000), 1).unwrap();
        engine::place_bet(u, &BaseUnits::from_u64(300), 1, "C1", 1, 2).unwrap();

        set_kill_switch(true, "test".to_string(), 3);
        assert_eq!(
            engine::place_bet(u, &BaseUnits::from_u64(100), 1, "C2", 2, 4),
            Err(crate::types::GameError::KillSwitch)
        );
        // The in-flight bet still settles.
        assert!(engine::process_win(
            u,
            &BaseUnits::from_u64(450),
            &BaseUnits::from_u64(300),
            1,
            "C1",
            5
        )
        .is_ok());
        // Deposits keep crediting.
        let (_, credited) =
            engine::record_deposit("0xs04b", 0, u, &BaseUnits::from_u64(10), 6).unwrap();
        assert!(credited);
    }
}
