//! Crash Arena - server-authoritative multiplayer crash wagering backend.
//!
//! **What this canister is:**
//! A continuous sequence of rounds. Each round commits to a hidden crash
//! point (SHA-256 commit-reveal over a VRF seed), opens a fixed betting
//! window, runs the multiplier curve until the crash, and settles every
//! stake through an append-only journal. Players may cash out any time
//! before the crash; auto-cashout targets are honored from the committed
//! crash point itself, never from tick timing.
//!
//! **Money safety:**
//! - Balances live in snapshot accounts with optimistic-concurrency
//!   versions; every write is journaled first and idempotent by client id.
//! - On-chain deposits are credited exactly once per (tx_hash, log_index),
//!   and only after they are buried past the reorg depth.
//! - A solvency watchdog reconciles snapshots against the journal and the
//!   hot wallet on a cadence and raises a kill switch on any disagreement.
//!
//! **Fairness:**
//! `SHA256(server_seed)` is published before betting opens; the seed, the
//! rotated client seed and the round nonce are revealed at round end and
//! every round is re-verifiable through `verify_round`.

use candid::Principal;
use ic_cdk::{init, post_upgrade, pre_upgrade, query, update};
use ic_stable_structures::memory_manager::{MemoryManager, VirtualMemory};
use ic_stable_structures::DefaultMemoryImpl;
use std::cell::RefCell;
use std::time::Duration;

pub mod accounting;
pub mod bet_book;
pub mod config;
pub mod events;
pub mod fairness;
pub mod indexer;
pub mod memory_ids;
pub mod money;
pub mod round;
pub mod session;
pub mod solvency;
pub mod stats;
pub mod types;


use accounting::{engine, store};
use config::ConfigView;
use events::Event;
use indexer::ObservationView;
use money::BaseUnits;
use stats::StatsView;
use types::{
    BalanceSnapshot, BalanceView, BetView, CashOutResult, ChainTransfer, GameError, Health,
    LedgerEntryView, PlaceBetRequest, RoundView, SessionSnapshot,
};

// =============================================================================
// MEMORY MANAGEMENT
// =============================================================================
// The allocation map lives in memory_ids.rs; every stable structure in the
// crate draws its region from this manager.

pub type Memory = VirtualMemory<DefaultMemoryImpl>;

thread_local! {
    pub static MEMORY_MANAGER: RefCell<MemoryManager<DefaultMemoryImpl>> =
        RefCell::new(MemoryManager::init(DefaultMemoryImpl::default()));

    static INSTALLED_AT: RefCell<u64> = const { RefCell::new(0) };
}

const SESSION_SWEEP_SECS: u64 = 10;

// =============================================================================
// LIFECYCLE HOOKS
// =============================================================================

fn start_background_tasks() {
    round::start_loop();
    indexer::start();
    solvency::start();
    schedule_session_sweep(Duration::from_secs(SESSION_SWEEP_SECS));
}

fn schedule_session_sweep(delay: Duration) {
    ic_cdk_timers::set_timer(delay, async {
        session::sweep(ic_cdk::api::time());
        schedule_session_sweep(Duration::from_secs(SESSION_SWEEP_SECS));
    });
}

#[init]
fn canister_init() {
    ic_cdk::println!("Crash Arena initialized");
    INSTALLED_AT.with(|t| *t.borrow_mut() = ic_cdk::api::time());
    events::reset_rings();
    start_background_tasks();
}

#[pre_upgrade]
fn pre_upgrade() {
    // Stable structures persist automatically; sessions and event rings are
    // volatile on purpose (clients resync).
    ic_cdk::println!("Pre-upgrade: stable state persists automatically");
}

#[post_upgrade]
fn post_upgrade() {
    INSTALLED_AT.with(|t| *t.borrow_mut() = ic_cdk::api::time());
    events::reset_rings();
    // A round that died with the old code never resumes: its bets settle as
    // losses and the round is revealed as-is.
    round::settle_orphaned_rounds(ic_cdk::api::time());
    start_background_tasks();
    ic_cdk::println!("Post-upgrade: timers restarted");
}

// =============================================================================
// HELPERS
// =============================================================================

fn require_admin() -> Result<(), GameError> {
    if ic_cdk::api::is_controller(&ic_cdk::api::msg_caller()) {
        Ok(())
    } else {
        Err(GameError::Unauthenticated)
    }
}

/// Mirror a user-visible failure onto the caller's event topic. The session
/// stays open; the error also goes back as the call result.
fn reply<T>(caller: Principal, result: Result<T, GameError>) -> Result<T, GameError> {
    if let Err(e) = &result {
        if session::require(&caller).is_ok() {
            events::publish_error(caller, e);
        }
    }
    result
}

fn build_snapshot(caller: Principal) -> SessionSnapshot {
    let balance = BalanceSnapshot::of(&store::get_account(&caller)).view();
    let round = round::current_round_view();
    let live_bets = round
        .as_ref()
        .map(|r| {
            bet_book::all_bets(r.round_id)
                .iter()
                .map(|b| b.view())
                .collect()
        })
        .unwrap_or_default();
    SessionSnapshot {
        user_id: caller.to_text(),
        balance,
        latest_event_id: events::latest_event_id(),
        round,
        live_bets,
    }
}

// =============================================================================
// SESSION & TRANSPORT ENDPOINTS
// =============================================================================

/// Link a deposit address (0x + 40 hex) to the caller for deposit
/// attribution. Signature verification happens upstream in the wallet auth
/// flow; the IC identity is the authenticated party here.
#[update]
fn register_wallet(wallet: String) -> Result<(), GameError> {
    session::register_wallet(ic_cdk::api::msg_caller(), &wallet, ic_cdk::api::time())
}

/// Open (or re-open) the caller's session: subscribes it to the global,
/// room, and own-user topics and returns a full state snapshot to resync
/// against.
#[update]
fn open_session() -> Result<SessionSnapshot, GameError> {
    let caller = ic_cdk::api::msg_caller();
    session::open(caller, ic_cdk::api::time())?;
    let snapshot = build_snapshot(caller);
    events::publish(
        events::Topic::User(caller),
        events::EventPayload::Authenticated {
            user_id: caller.to_text(),
            balance: snapshot.balance.available.clone(),
        },
    );
    Ok(snapshot)
}

#[update]
fn ping() -> Result<(), GameError> {
    session::touch(&ic_cdk::api::msg_caller(), ic_cdk::api::time())
}

#[update]
fn chat(message: String) -> Result<(), GameError> {
    let caller = ic_cdk::api::msg_caller();
    reply(caller, session::chat(caller, &message, ic_cdk::api::time()).map(|_| ()))
}

/// Ordered replay from `last_event_id` across the caller's topics. A client
/// that fell past the replay ring gets `ResyncRequired` and should call
/// `get_snapshot`.
#[query]
fn poll_events(last_event_id: u64) -> Result<Vec<Event>, GameError> {
    let caller = ic_cdk::api::msg_caller();
    session::require(&caller)?;
    events::poll(caller, last_event_id)
}

/// Same replay, framed as JSON strings for transports that relay verbatim.
#[query]
fn poll_events_json(last_event_id: u64) -> Result<Vec<String>, GameError> {
    let caller = ic_cdk::api::msg_caller();
    session::require(&caller)?;
    Ok(events::poll(caller, last_event_id)?
        .iter()
        .map(Event::to_frame)
        .collect())
}

#[query]
fn get_snapshot() -> Result<SessionSnapshot, GameError> {
    let caller = ic_cdk::api::msg_caller();
    session::require(&caller)?;
    Ok(build_snapshot(caller))
}

// =============================================================================
// GAME ENDPOINTS
// =============================================================================

#[update]
fn place_bet(request: PlaceBetRequest) -> Result<BalanceView, GameError> {
    let caller = ic_cdk::api::msg_caller();
    let result = round::handle_place_bet(caller, request, ic_cdk::api::time());
    reply(caller, result.map(|s| s.view()))
}

/// Cash the caller's bet out at the current multiplier. `client_id`
/// identifies the request on the wire; settlement idempotency rides on the
/// bet's own client id, so a repeated cashout returns the settled result.
#[update]
fn cash_out(client_id: String) -> Result<CashOutResult, GameError> {
    let caller = ic_cdk::api::msg_caller();
    if client_id.is_empty() || client_id.len() > types::CLIENT_ID_MAX_LEN {
        return Err(GameError::InvalidRequest {
            reason: "client_id must be non-empty".to_string(),
        });
    }
    let result = round::handle_cash_out(caller, ic_cdk::api::time());
    reply(caller, result)
}

/// Debit the caller's balance for an on-chain withdrawal; the custody
/// pipeline executes the transfer out of band.
#[update]
fn withdraw(amount: String, client_id: String) -> Result<BalanceView, GameError> {
    let caller = ic_cdk::api::msg_caller();
    let result = (|| {
        session::require(&caller)?;
        if client_id.is_empty() || client_id.len() > types::CLIENT_ID_MAX_LEN {
            return Err(GameError::InvalidRequest {
                reason: "client_id must be non-empty".to_string(),
            });
        }
        let amount = BaseUnits::parse_decimal(&amount)
            .map_err(|reason| GameError::InvalidAmount { reason })?;
        let snapshot =
            engine::process_withdrawal(caller, &amount, &client_id, ic_cdk::api::time())?;
        events::publish_balance(caller, &snapshot);
        Ok(snapshot.view())
    })();
    reply(caller, result)
}

// =============================================================================
// CHAIN GATEWAY INBOUND
// =============================================================================

/// Streaming deposit hint from the gateway's block subscription. Never
/// credits: the polling pass is the sole source of truth.
#[update]
fn notify_transfer(transfer: ChainTransfer) -> Result<(), GameError> {
    indexer::handle_notify_transfer(ic_cdk::api::msg_caller(), transfer, ic_cdk::api::time())
}

// =============================================================================
// PUBLIC QUERIES
// =============================================================================

#[query]
fn get_balance(user: Principal) -> BalanceView {
    BalanceSnapshot::of(&store::get_account(&user)).view()
}

#[query]
fn get_my_balance() -> BalanceView {
    get_balance(ic_cdk::api::msg_caller())
}

#[query]
fn get_current_round() -> Option<RoundView> {
    round::current_round_view()
}

#[query]
fn get_round(round_id: u64) -> Option<RoundView> {
    round::get_round(round_id).map(|r| r.view())
}

#[query]
fn get_recent_rounds(limit: u32) -> Vec<RoundView> {
    round::recent_rounds(limit.min(100) as usize)
}

/// The aggregate bet list for the round in flight.
#[query]
fn get_live_bets() -> Vec<BetView> {
    let live = round::live();
    if live.round_id == 0 {
        return Vec::new();
    }
    bet_book::all_bets(live.round_id)
        .iter()
        .map(|b| b.view())
        .collect()
}

#[query]
fn get_my_bets(limit: u32) -> Vec<BetView> {
    let caller = ic_cdk::api::msg_caller();
    bet_book::bets_for_user(&caller, round::latest_round_id(), 500, limit.min(100) as usize)
        .iter()
        .map(|b| b.view())
        .collect()
}

#[query]
fn get_my_ledger(limit: u32) -> Vec<LedgerEntryView> {
    let caller = ic_cdk::api::msg_caller();
    store::entries_for_user(&caller, limit.min(200) as u64)
        .iter()
        .map(|e| e.view())
        .collect()
}

/// Recompute a revealed round from its seeds and compare with the published
/// crash point. Returns the crash multiplier, or `FairnessViolation`.
#[query]
fn verify_round(round_id: u64) -> Result<f64, GameError> {
    let round = round::get_round(round_id).ok_or(GameError::InvalidRequest {
        reason: format!("unknown round {}", round_id),
    })?;
    fairness::verify_round(&round).map(types::x100_to_f64)
}

/// The published crash derivation, re-verifiable from revealed seeds.
#[query]
fn get_crash_formula() -> String {
    fairness::formula_text()
}

#[query]
fn get_config() -> ConfigView {
    config::get().view()
}

#[query]
fn get_stats() -> StatsView {
    stats::get().view()
}

#[query]
fn health_check() -> Health {
    let live = round::live();
    let indexer_status = indexer::status();
    let solvency_report = solvency::last_report();
    let kill = solvency::kill_state();
    let uptime_secs = ic_cdk::api::time()
        .saturating_sub(INSTALLED_AT.with(|t| *t.borrow()))
        / 1_000_000_000;
    Health {
        phase: live.phase.as_str().to_string(),
        round_id: live.round_id,
        uptime_secs,
        chain_head: indexer_status.head,
        indexer_checkpoint: indexer_status.checkpoint,
        indexer_lag: indexer_status.lag,
        indexer_alert: indexer_status.alert,
        ledger_snapshot_drift: solvency_report.ledger_snapshot_drift,
        drift_detected: solvency_report.drift_detected,
        onchain_liability_ratio_bps: solvency_report.onchain_liability_ratio_bps,
        kill_switch: kill.active,
        kill_reason: kill.reason,
    }
}

// =============================================================================
// ADMIN ENDPOINTS
// =============================================================================

#[update]
fn admin_freeze_user(user: Principal) -> Result<(), GameError> {
    require_admin()?;
    engine::set_frozen(user, true);
    ic_cdk::println!("AUDIT: account {} frozen", user);
    Ok(())
}

#[update]
fn admin_unfreeze_user(user: Principal) -> Result<(), GameError> {
    require_admin()?;
    engine::set_frozen(user, false);
    ic_cdk::println!("AUDIT: account {} unfrozen", user);
    Ok(())
}

#[update]
fn admin_set_kill_switch(active: bool, reason: String) -> Result<(), GameError> {
    require_admin()?;
    solvency::set_kill_switch(active, reason, ic_cdk::api::time());
    Ok(())
}

/// Rotate the global client seed. Takes effect at the next round open; the
/// round record always carries the seed it actually used.
#[update]
fn admin_rotate_client_seed(seed: String) -> Result<(), GameError> {
    require_admin()?;
    fairness::rotate_client_seed(seed)
}

#[update]
fn admin_update_config(view: ConfigView) -> Result<(), GameError> {
    require_admin()?;
    let new_config = config::Config::from_view(view)?;
    config::set(new_config)
}

#[query]
fn admin_get_ledger(start_id: u64, limit: u32) -> Result<Vec<LedgerEntryView>, GameError> {
    require_admin()?;
    Ok(store::entries_page(start_id, limit.min(500) as u64)
        .iter()
        .map(|e| e.view())
        .collect())
}

#[query]
fn admin_get_unattributed_deposits(limit: u32) -> Result<Vec<ObservationView>, GameError> {
    require_admin()?;
    Ok(indexer::unattributed_observations(limit.min(200) as usize))
}

/// Force a reconciliation pass outside the watchdog cadence. An update so
/// a raised kill switch actually persists.
#[update]
fn admin_run_reconciliation() -> Result<solvency::SolvencyReport, GameError> {
    require_admin()?;
    Ok(solvency::run_reconciliation(&config::get(), ic_cdk::api::time()))
}

#[query]
fn greet(name: String) -> String {
    format!(
        "Crash Arena: commit-reveal rounds, exact-integer money. Good luck, {}!",
        name
    )
}
