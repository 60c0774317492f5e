//! The round scheduler: single writer of all round state.
//!
//! One loop, driven by chained one-shot timers:
//!
//! ```text
//!   Idle -> Betting (T_bet) -> Running (until crash) -> Settling (T_settle) -> Betting ...
//! ```
//!
//! The crash instant is fixed once at Running entry: `crash_x100` comes from
//! the committed seed, `t_crash` from the curve, and every later cashout is
//! judged against those two values. Ticks are display traffic: settlement
//! never trusts them. Auto-cashouts fire when the curve passes their target
//! strictly below the crash point; ties ride into the crash and lose.

use crate::accounting::{engine, store};
use crate::bet_book;
use crate::config::{self, Config};
use crate::events::{self, EventPayload, Topic};
use crate::fairness;
use crate::memory_ids::{LIVE_ROUND_MEMORY_ID, NEXT_ROUND_ID_MEMORY_ID, ROUNDS_MEMORY_ID};
use crate::money::BaseUnits;
use crate::session;
use crate::stats;
use crate::types::{
    x100_to_f64, BalanceSnapshot, BetState, CashOutResult, GameError, OpType, PlaceBetRequest,
    Round, RoundPhase, RoundView, StoredBet, CLIENT_ID_MAX_LEN, MIN_AUTO_CASHOUT_X100,
    MULTIPLIER_SCALE,
};
use crate::Memory;
use candid::Principal;
use ic_stable_structures::memory_manager::MemoryId;
use ic_stable_structures::storable::Bound;
use ic_stable_structures::{StableBTreeMap, StableCell, Storable};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::cell::RefCell;
use std::time::Duration;

const NS_PER_MS: u64 = 1_000_000;
const NS_PER_SEC: u64 = 1_000_000_000;

/// Retry cadence when the loop cannot open a round (kill switch, VRF outage).
const REOPEN_RETRY_SECS: u64 = 5;

// =============================================================================
// LIVE ROUND STATE
// =============================================================================

/// The scheduler's working state for the round in flight. `round_id == 0`
/// means no round. The server seed lives here unrevealed; queries only ever
/// see the history record, which gets the seed at reveal time.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LiveRound {
    pub round_id: u64,
    pub phase: RoundPhase,
    pub commit_hash: String,
    pub client_seed: String,
    pub nonce: u64,
    pub server_seed: [u8; 32],
    pub crash_x100: u64,
    pub bet_deadline_ns: u64,
    pub started_at_ns: u64,
    pub t_crash_ns: u64,
}

impl Default for LiveRound {
    fn default() -> Self {
        Self {
            round_id: 0,
            phase: RoundPhase::Idle,
            commit_hash: String::new(),
            client_seed: String::new(),
            nonce: 0,
            server_seed: [0u8; 32],
            crash_x100: 0,
            bet_deadline_ns: 0,
            started_at_ns: 0,
            t_crash_ns: 0,
        }
    }
}

impl Storable for LiveRound {
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
    static LIVE_ROUND: RefCell<StableCell<LiveRound, Memory>> = RefCell::new(
        StableCell::init(
            crate::MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(LIVE_ROUND_MEMORY_ID))),
            LiveRound::default()
        )
    );

    static NEXT_ROUND_ID: RefCell<StableCell<u64, Memory>> = RefCell::new(
        StableCell::init(
            crate::MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(NEXT_ROUND_ID_MEMORY_ID))),
            1u64
        )
    );

    static ROUNDS: RefCell<StableBTreeMap<u64, Round, Memory>> = RefCell::new(
        StableBTreeMap::init(
            crate::MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(ROUNDS_MEMORY_ID))),
        )
    );

    /// Whether the loop already broadcast `paused` for the current outage.
    static PAUSE_ANNOUNCED: RefCell<bool> = const { RefCell::new(false) };
}

pub fn live() -> LiveRound {
    LIVE_ROUND.with(|cell| cell.borrow().get().clone())
}

pub(crate) fn store_live(live: LiveRound) {
    LIVE_ROUND.with(|cell| {
        cell.borrow_mut().set(live);
    });
}

pub(crate) fn clear_live() {
    store_live(LiveRound::default());
}

fn take_next_round_id() -> u64 {
    NEXT_ROUND_ID.with(|cell| {
        let id = *cell.borrow().get();
        cell.borrow_mut().set(id + 1);
        id
    })
}

pub fn latest_round_id() -> u64 {
    NEXT_ROUND_ID.with(|cell| *cell.borrow().get()) - 1
}

pub fn get_round(round_id: u64) -> Option<Round> {
    ROUNDS.with(|r| r.borrow().get(&round_id))
}

pub(crate) fn put_round(round: Round) {
    ROUNDS.with(|r| {
        r.borrow_mut().insert(round.round_id, round);
    });
}

pub fn recent_rounds(limit: usize) -> Vec<RoundView> {
    let mut out = Vec::new();
    let mut id = latest_round_id();
    while id >= 1 && out.len() < limit {
        if let Some(round) = get_round(id) {
            out.push(round.view());
        }
        id -= 1;
    }
    out
}

pub fn current_round_view() -> Option<RoundView> {
    let live = live();
    if live.round_id == 0 {
        return None;
    }
    get_round(live.round_id).map(|r| r.view())
}

// =============================================================================
// TIMER CHAIN
// =============================================================================

fn schedule_open(delay: Duration) {
    ic_cdk_timers::set_timer(delay, async {
        open_betting().await;
    });
}

fn schedule_running(delay: Duration) {
    ic_cdk_timers::set_timer(delay, async {
        begin_running();
    });
}

fn schedule_tick(delay: Duration) {
    ic_cdk_timers::set_timer(delay, async {
        tick_once();
    });
}

fn schedule_settle(delay: Duration) {
    ic_cdk_timers::set_timer(delay, async {
        settle_round();
    });
}

/// Kick the round loop off. Called from init and post_upgrade.
pub fn start_loop() {
    schedule_open(Duration::ZERO);
}

async fn open_betting() {
    if crate::solvency::kill_switch_active() {
        let announced = PAUSE_ANNOUNCED.with(|p| std::mem::replace(&mut *p.borrow_mut(), true));
        if !announced {
            events::publish(
                Topic::Global,
                EventPayload::Paused {
                    reason: crate::solvency::kill_reason(),
                },
            );
            ic_cdk::println!("Scheduler paused: kill switch is raised");
        }
        schedule_open(Duration::from_secs(REOPEN_RETRY_SECS));
        return;
    }

    let server_seed = match fairness::generate_server_seed().await {
        Ok(seed) => seed,
        Err(e) => {
            ic_cdk::println!("Round open failed, retrying: {}", e);
            schedule_open(Duration::from_secs(2));
            return;
        }
    };

    // No await below this point: the whole open is atomic.
    let was_paused = PAUSE_ANNOUNCED.with(|p| std::mem::replace(&mut *p.borrow_mut(), false));
    if was_paused {
        events::publish(Topic::Global, EventPayload::Resumed {});
    }

    let cfg = config::get();
    let now = ic_cdk::api::time();
    let round_id = take_next_round_id();
    let commit_hash = fairness::commit_hash_hex(&server_seed);
    let client_seed = fairness::client_seed();
    let bet_deadline_ns = now + cfg.t_bet_secs * NS_PER_SEC;

    store_live(LiveRound {
        round_id,
        phase: RoundPhase::Betting,
        commit_hash: commit_hash.clone(),
        client_seed: client_seed.clone(),
        nonce: round_id,
        server_seed,
        crash_x100: 0,
        bet_deadline_ns,
        started_at_ns: 0,
        t_crash_ns: 0,
    });

    put_round(Round {
        round_id,
        commit_hash: commit_hash.clone(),
        server_seed: None,
        client_seed,
        nonce: round_id,
        crash_x100: None,
        house_edge_bps: cfg.house_edge_bps,
        instant_crash_divisor: cfg.instant_crash_divisor,
        max_multiplier_x100: cfg.max_multiplier_x100,
        opened_at: now,
        started_at: None,
        crashed_at: None,
        phase: RoundPhase::Betting,
    });

    events::publish(
        Topic::Global,
        EventPayload::RoundOpened {
            round_id,
            commit_hash,
            bet_deadline_ms: bet_deadline_ns / NS_PER_MS,
        },
    );

    schedule_running(Duration::from_secs(cfg.t_bet_secs));
}

fn begin_running() {
    let mut live = live();
    if live.phase != RoundPhase::Betting {
        return;
    }
    let Some(mut record) = get_round(live.round_id) else {
        ic_cdk::println!("CRITICAL: live round {} has no record", live.round_id);
        clear_live();
        schedule_open(Duration::from_secs(REOPEN_RETRY_SECS));
        return;
    };

    let cfg = config::get();
    let now = ic_cdk::api::time();

    // The crash instant is fixed here, from the committed seed and the
    // parameters captured at open. Nothing after this point can move it.
    let crash_x100 = fairness::derive_crash_x100(
        &live.server_seed,
        &live.client_seed,
        live.nonce,
        record.house_edge_bps,
        record.instant_crash_divisor,
        record.max_multiplier_x100,
    );
    let t_crash_ns = fairness::crash_delay_ns(cfg.multiplier_a, cfg.multiplier_b, crash_x100);

    let round_id = live.round_id;
    live.phase = RoundPhase::Running;
    live.crash_x100 = crash_x100;
    live.started_at_ns = now;
    live.t_crash_ns = t_crash_ns;
    store_live(live);

    record.phase = RoundPhase::Running;
    record.started_at = Some(now);
    put_round(record);

    events::publish(
        Topic::Global,
        EventPayload::RoundStarted {
            round_id,
            server_time_ms: now / NS_PER_MS,
        },
    );

    schedule_tick(Duration::from_millis(cfg.tick_interval_ms));
    schedule_settle(Duration::from_nanos(t_crash_ns));
}

fn tick_once() {
    let live = live();
    if live.phase != RoundPhase::Running {
        return;
    }
    let now = ic_cdk::api::time();
    let elapsed = now.saturating_sub(live.started_at_ns);
    if elapsed >= live.t_crash_ns {
        // The settle timer owns the crash; ticking stops here.
        return;
    }

    let cfg = config::get();
    let m_x100 =
        fairness::multiplier_x100_at(cfg.multiplier_a, cfg.multiplier_b, elapsed).min(live.crash_x100);
    events::publish(
        Topic::Global,
        EventPayload::MultiplierTick {
            m: x100_to_f64(m_x100),
        },
    );

    for bet in bet_book::auto_cashouts_due(live.round_id, m_x100, live.crash_x100) {
        fire_cashout(&live, &bet, bet.auto_cashout_x100.unwrap_or(m_x100), now);
    }

    schedule_tick(Duration::from_millis(cfg.tick_interval_ms));
}

/// Settle one bet as a win at `m_x100` and publish the fan-out. Any engine
/// failure leaves the bet placed; it settles as a loss with the round.
fn fire_cashout(live: &LiveRound, bet: &StoredBet, m_x100: u64, now: u64) -> Option<BalanceSnapshot> {
    let payout = bet.stake.mul_by_ratio(m_x100, MULTIPLIER_SCALE)?;
    match engine::process_win(bet.user, &payout, &bet.stake, live.round_id, &bet.client_id, now) {
        Ok(snapshot) => {
            bet_book::update(live.round_id, &bet.user, |b| {
                b.state = BetState::CashedOut;
                b.cashout_x100 = Some(m_x100);
            });
            stats::record_payout(&payout);
            events::publish(
                Topic::Room,
                EventPayload::PlayerCashedOut {
                    user_id: bet.user.to_text(),
                    m: x100_to_f64(m_x100),
                    payout: payout.format_decimal(),
                },
            );
            events::publish_balance(bet.user, &snapshot);
            Some(snapshot)
        }
        Err(e) => {
            ic_cdk::println!(
                "CRITICAL: cashout settlement failed for {} in round {}: {}",
                bet.user,
                live.round_id,
                e
            );
            events::publish_error(bet.user, &e);
            None
        }
    }
}

fn settle_round() {
    let mut live = live();
    if live.phase != RoundPhase::Running {
        return;
    }
    let now = ic_cdk::api::time();
    live.phase = RoundPhase::Settling;
    store_live(live.clone());

    // Auto-cashouts the tick loop did not reach in time still win: the
    // decision depends only on target vs crash point, never on tick timing.
    for bet in bet_book::placed_bets(live.round_id) {
        if let Some(auto) = bet.auto_cashout_x100 {
            if auto < live.crash_x100 {
                fire_cashout(&live, &bet, auto, now);
            }
        }
    }

    // Everything still placed rode into the crash.
    for bet in bet_book::placed_bets(live.round_id) {
        match engine::process_loss(bet.user, &bet.stake, live.round_id, &bet.client_id, now) {
            Ok(snapshot) => {
                bet_book::update(live.round_id, &bet.user, |b| b.state = BetState::Lost);
                events::publish_balance(bet.user, &snapshot);
            }
            Err(e) => {
                ic_cdk::println!(
                    "CRITICAL: loss settlement failed for {} in round {}: {}",
                    bet.user,
                    live.round_id,
                    e
                );
            }
        }
    }

    events::publish(
        Topic::Global,
        EventPayload::RoundCrashed {
            round_id: live.round_id,
            crash_point: x100_to_f64(live.crash_x100),
        },
    );

    // Reveal: the history record gets the seed and the crash point.
    if let Some(mut record) = get_round(live.round_id) {
        record.server_seed = Some(live.server_seed);
        record.crash_x100 = Some(live.crash_x100);
        record.crashed_at = Some(now);
        record.phase = RoundPhase::Revealed;
        put_round(record);
    }
    events::publish(
        Topic::Global,
        EventPayload::RoundRevealed {
            round_id: live.round_id,
            server_seed: hex::encode(live.server_seed),
            client_seed: live.client_seed.clone(),
            nonce: live.nonce,
        },
    );

    stats::record_round_completed(live.crash_x100);
    clear_live();

    let cfg = config::get();
    schedule_open(Duration::from_secs(cfg.t_settle_secs));
}

/// Post-upgrade recovery: a round that died mid-flight never reopens. Its
/// persisted bets settle as losses and the round is revealed as-is.
pub fn settle_orphaned_rounds(now: u64) {
    let live = live();
    if live.round_id == 0 {
        return;
    }

    for round_id in bet_book::rounds_with_placed_bets(live.round_id) {
        for bet in bet_book::placed_bets(round_id) {
            match engine::process_loss(bet.user, &bet.stake, round_id, &bet.client_id, now) {
                Ok(_) => {
                    bet_book::update(round_id, &bet.user, |b| b.state = BetState::Lost);
                }
                Err(e) => {
                    ic_cdk::println!(
                        "CRITICAL: orphan settlement failed for {} in round {}: {}",
                        bet.user,
                        round_id,
                        e
                    );
                }
            }
        }
    }

    if let Some(mut record) = get_round(live.round_id) {
        if record.phase != RoundPhase::Revealed {
            let crash_x100 = if live.crash_x100 != 0 {
                live.crash_x100
            } else {
                fairness::derive_crash_x100(
                    &live.server_seed,
                    &live.client_seed,
                    live.nonce,
                    record.house_edge_bps,
                    record.instant_crash_divisor,
                    record.max_multiplier_x100,
                )
            };
            record.server_seed = Some(live.server_seed);
            record.crash_x100 = Some(crash_x100);
            record.crashed_at = Some(now);
            record.phase = RoundPhase::Revealed;
            put_round(record);
        }
    }
    clear_live();
    ic_cdk::println!("Recovered from mid-round restart: round {} aborted", live.round_id);
}

// =============================================================================
// INBOUND: PLACE BET
// =============================================================================

/// Pure validation of a bet request against the live round and config.
/// Returns the parsed stake and auto-cashout target.
pub(crate) fn evaluate_placement(
    live: &LiveRound,
    cfg: &Config,
    request: &PlaceBetRequest,
    now: u64,
) -> Result<(BaseUnits, Option<u64>), GameError> {
    if live.round_id == 0 || live.phase != RoundPhase::Betting || now > live.bet_deadline_ns {
        return Err(GameError::BettingClosed);
    }
    if request.client_id.is_empty() || request.client_id.len() > CLIENT_ID_MAX_LEN {
        return Err(GameError::InvalidRequest {
            reason: format!("client_id must be 1-{} chars", CLIENT_ID_MAX_LEN),
        });
    }
    let amount = BaseUnits::parse_decimal(&request.amount)
        .map_err(|reason| GameError::InvalidAmount { reason })?;
    if amount < cfg.min_bet || amount > cfg.max_bet {
        return Err(GameError::InvalidAmount {
            reason: format!(
                "stake must be between {} and {}",
                cfg.min_bet.format_decimal(),
                cfg.max_bet.format_decimal()
            ),
        });
    }
    let auto = match request.auto_cashout {
        None => None,
        Some(m) => {
            let x100 = crate::types::multiplier_to_x100(m).ok_or(GameError::InvalidRequest {
                reason: "auto_cashout must be a finite multiplier".to_string(),
            })?;
            if x100 < MIN_AUTO_CASHOUT_X100 || x100 > cfg.max_multiplier_x100 {
                return Err(GameError::InvalidRequest {
                    reason: "auto_cashout must be at least 1.01x and within the multiplier cap"
                        .to_string(),
                });
            }
            Some(x100)
        }
    };
    Ok((amount, auto))
}

pub fn handle_place_bet(
    caller: Principal,
    request: PlaceBetRequest,
    now: u64,
) -> Result<BalanceSnapshot, GameError> {
    session::require(&caller)?;
    let live = live();

    // Retry of an already-accepted bet: a silent no-op returning current
    // state, even if the window has closed in the meantime.
    if live.round_id != 0 {
        if let Some(existing) = bet_book::get(live.round_id, &caller) {
            if existing.client_id == request.client_id {
                return engine::place_bet(
                    caller,
                    &existing.stake,
                    live.round_id,
                    &request.client_id,
                    request.expected_version,
                    now,
                );
            }
            // A different bet on top of a live one: one bet per user per
            // round.
            if live.phase == RoundPhase::Betting {
                return Err(GameError::Duplicate);
            }
        }
    }

    let cfg = config::get();
    let (amount, auto) = evaluate_placement(&live, &cfg, &request, now)?;

    // A client id that already locked a bet in some earlier round is a
    // stale retry, not a new bet: replay it without touching the book.
    if store::find_duplicate(&store::client_key(&caller, OpType::BetLock, &request.client_id))
        .is_some()
    {
        return engine::place_bet(
            caller,
            &amount,
            live.round_id,
            &request.client_id,
            request.expected_version,
            now,
        );
    }

    let snapshot = engine::place_bet(
        caller,
        &amount,
        live.round_id,
        &request.client_id,
        request.expected_version,
        now,
    )?;

    bet_book::insert(StoredBet {
        round_id: live.round_id,
        user: caller,
        stake: amount.clone(),
        auto_cashout_x100: auto,
        state: BetState::Placed,
        cashout_x100: None,
        client_id: request.client_id,
        placed_at: now,
    });
    stats::record_bet(&amount);

    events::publish(
        Topic::Room,
        EventPayload::BetAccepted {
            round_id: live.round_id,
            user_id: caller.to_text(),
            amount: amount.format_decimal(),
            auto_cashout: auto.map(x100_to_f64),
        },
    );
    events::publish_balance(caller, &snapshot);

    Ok(snapshot)
}

// =============================================================================
// INBOUND: CASH OUT
// =============================================================================

/// Pure timing decision for a manual cashout. Returns the multiplier the
/// cashout settles at. The cutoff sits `cashout_safety_ms` before the crash
/// instant; a request at or past it (including at exactly `t_crash`) is
/// `TooLate`. The returned multiplier never exceeds the crash point.
pub(crate) fn evaluate_cashout(
    live: &LiveRound,
    cfg: &Config,
    now: u64,
) -> Result<u64, GameError> {
    if live.phase != RoundPhase::Running {
        return Err(match live.phase {
            RoundPhase::Betting => GameError::InvalidRequest {
                reason: "round has not started".to_string(),
            },
            _ => GameError::TooLate,
        });
    }
    let safety_ns = cfg.cashout_safety_ms * NS_PER_MS;
    let cutoff = live
        .started_at_ns
        .saturating_add(live.t_crash_ns.saturating_sub(safety_ns));
    if live.t_crash_ns <= safety_ns || now >= cutoff {
        return Err(GameError::TooLate);
    }
    let elapsed = now.saturating_sub(live.started_at_ns);
    let m_x100 = fairness::multiplier_x100_at(cfg.multiplier_a, cfg.multiplier_b, elapsed)
        .min(live.crash_x100);
    Ok(m_x100)
}

pub fn handle_cash_out(caller: Principal, now: u64) -> Result<CashOutResult, GameError> {
    session::require(&caller)?;
    let live = live();
    if live.round_id == 0 {
        return Err(GameError::NoActiveBet);
    }
    let bet = bet_book::get(live.round_id, &caller).ok_or(GameError::NoActiveBet)?;

    match bet.state {
        BetState::Placed => {}
        // Repeated cashout request: report the settled result.
        BetState::CashedOut => {
            let m_x100 = bet.cashout_x100.unwrap_or(MULTIPLIER_SCALE);
            let payout = bet
                .stake
                .mul_by_ratio(m_x100, MULTIPLIER_SCALE)
                .unwrap_or_else(BaseUnits::zero);
            let snapshot = BalanceSnapshot::of(&store::get_account(&caller));
            return Ok(CashOutResult {
                round_id: live.round_id,
                multiplier: x100_to_f64(m_x100),
                payout: payout.format_decimal(),
                balance: snapshot.view(),
            });
        }
        BetState::Lost | BetState::Cancelled => return Err(GameError::TooLate),
    }

    let cfg = config::get();
    let m_x100 = evaluate_cashout(&live, &cfg, now)?;
    let payout = bet
        .stake
        .mul_by_ratio(m_x100, MULTIPLIER_SCALE)
        .ok_or(GameError::InvalidAmount {
            reason: "payout computation failed".to_string(),
        })?;

    let snapshot = engine::process_win(
        caller,
        &payout,
        &bet.stake,
        live.round_id,
        &bet.client_id,
        now,
    )?;
    bet_book::update(live.round_id, &caller, |b| {
        b.state = BetState::CashedOut;
        b.cashout_x100 = Some(m_x100);
    });
    stats::record_payout(&payout);

    events::publish(
        Topic::Room,
        EventPayload::PlayerCashedOut {
            user_id: caller.to_text(),
            m: x100_to_f64(m_x100),
            payout: payout.format_decimal(),
        },
    );
    events::publish_balance(caller, &snapshot);

    Ok(CashOutResult {
        round_id: live.round_id,
        multiplier: x100_to_f64(m_x100),
        payout: payout.format_decimal(),
        balance: snapshot.view(),
    })
}
