use crate::money::BaseUnits;
use candid::{CandidType, Deserialize, Principal};
use ic_stable_structures::storable::Bound;
use ic_stable_structures::Storable;
use serde::Serialize;
use std::borrow::Cow;
use std::fmt;

// =============================================================================
// CONSTANTS
// =============================================================================

/// Multipliers are carried as integer hundredths (1.50x == 150) everywhere
/// money is involved; f64 is display and timing only.
pub const MULTIPLIER_SCALE: u64 = 100;
pub const MIN_AUTO_CASHOUT_X100: u64 = 101;
pub const CLIENT_ID_MAX_LEN: usize = 64;
pub const CHAT_MAX_LEN: usize = 200;

/// `0x` + 40 hex characters, the shape of a native-chain address.
pub fn is_valid_wallet(addr: &str) -> bool {
    addr.len() == 42
        && addr.starts_with("0x")
        && addr[2..].bytes().all(|b| b.is_ascii_hexdigit())
}

pub fn x100_to_f64(x: u64) -> f64 {
    x as f64 / MULTIPLIER_SCALE as f64
}

/// Convert a display multiplier into hundredths, rejecting non-finite input.
pub fn multiplier_to_x100(m: f64) -> Option<u64> {
    if !m.is_finite() || m < 1.0 || m > 1_000_000.0 {
        return None;
    }
    Some((m * MULTIPLIER_SCALE as f64).round() as u64)
}

// =============================================================================
// ERROR TAXONOMY
// =============================================================================

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum GameError {
    InsufficientFunds,
    VersionConflict { current: u64 },
    Duplicate,
    BettingClosed,
    TooLate,
    NoActiveBet,
    InvalidAmount { reason: String },
    InvalidRequest { reason: String },
    Frozen,
    KillSwitch,
    SolvencyBlocked,
    NoMatchingLock,
    Unauthenticated,
    ResyncRequired,
    FairnessViolation { round_id: u64 },
    TransientIO { detail: String },
}

impl GameError {
    pub fn code(&self) -> &'static str {
        match self {
            GameError::InsufficientFunds => "INSUFFICIENT_FUNDS",
            GameError::VersionConflict { .. } => "VERSION_CONFLICT",
            GameError::Duplicate => "DUPLICATE",
            GameError::BettingClosed => "BETTING_CLOSED",
            GameError::TooLate => "TOO_LATE",
            GameError::NoActiveBet => "NO_ACTIVE_BET",
            GameError::InvalidAmount { .. } => "INVALID_AMOUNT",
            GameError::InvalidRequest { .. } => "INVALID_REQUEST",
            GameError::Frozen => "FROZEN",
            GameError::KillSwitch => "KILL_SWITCH",
            GameError::SolvencyBlocked => "SOLVENCY_BLOCKED",
            GameError::NoMatchingLock => "NO_MATCHING_LOCK",
            GameError::Unauthenticated => "UNAUTHENTICATED",
            GameError::ResyncRequired => "RESYNC_REQUIRED",
            GameError::FairnessViolation { .. } => "FAIRNESS_VIOLATION",
            GameError::TransientIO { .. } => "TRANSIENT_IO",
        }
    }
}

impl fmt::Display for GameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameError::InsufficientFunds => write!(f, "Insufficient available balance"),
            GameError::VersionConflict { current } => {
                write!(f, "Account version conflict, current version is {}", current)
            }
            GameError::Duplicate => write!(f, "Duplicate operation"),
            GameError::BettingClosed => write!(f, "Betting window is closed"),
            GameError::TooLate => write!(f, "Cashout arrived after the crash cutoff"),
            GameError::NoActiveBet => write!(f, "No active bet in the current round"),
            GameError::InvalidAmount { reason } => write!(f, "Invalid amount: {}", reason),
            GameError::InvalidRequest { reason } => write!(f, "Invalid request: {}", reason),
            GameError::Frozen => write!(f, "Account is frozen"),
            GameError::KillSwitch => write!(f, "Service is paused by the kill switch"),
            GameError::SolvencyBlocked => write!(f, "Payout blocked by solvency limit"),
            GameError::NoMatchingLock => write!(f, "No matching bet lock for settlement"),
            GameError::Unauthenticated => write!(f, "Caller is not authenticated"),
            GameError::ResyncRequired => write!(f, "Replay window evicted, full resync required"),
            GameError::FairnessViolation { round_id } => {
                write!(f, "Round {} does not reproduce its published crash point", round_id)
            }
            GameError::TransientIO { detail } => write!(f, "Transient I/O failure: {}", detail),
        }
    }
}

// =============================================================================
// LEDGER TYPES
// =============================================================================

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpType {
    Deposit,
    Withdraw,
    BetLock,
    BetWin,
    BetLose,
    Adjustment,
}

impl OpType {
    pub fn code(&self) -> &'static str {
        match self {
            OpType::Deposit => "deposit",
            OpType::Withdraw => "withdraw",
            OpType::BetLock => "bet_lock",
            OpType::BetWin => "bet_win",
            OpType::BetLose => "bet_lose",
            OpType::Adjustment => "adjustment",
        }
    }
}

/// Structured reference attached to each journal entry. Which fields are set
/// depends on the operation: client-initiated entries carry `client_id` (and
/// usually `round_id`), chain deposits carry `tx_hash`/`log_index`, and win
/// entries carry the consumed lock in `bet_amount`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct LedgerRef {
    pub client_id: Option<String>,
    pub round_id: Option<u64>,
    pub tx_hash: Option<String>,
    pub log_index: Option<u32>,
    pub bet_amount: Option<BaseUnits>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LedgerEntry {
    pub id: u64,
    pub user: Principal,
    pub op: OpType,
    pub amount: BaseUnits,
    pub entry_ref: LedgerRef,
    pub created_at: u64,
}

impl Storable for LedgerEntry {
    fn to_bytes(&self) -> Cow<[u8]> {
        Cow::Owned(serde_json::to_vec(self).expect(
            "CRITICAL: failed to encode a journal entry. The journal is the \
             source of truth for all balances; this must never happen.",
        ))
    }

    fn into_bytes(self) -> Vec<u8> {
        self.to_bytes().into_owned()
    }

    fn from_bytes(bytes: Cow<[u8]>) -> Self {
        serde_json::from_slice(&bytes).expect(
            "CRITICAL: failed to decode a journal entry from stable storage. \
             This indicates storage corruption or an incompatible upgrade.",
        )
    }

    const BOUND: Bound = Bound::Unbounded;
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug)]
pub struct LedgerEntryView {
    pub id: u64,
    pub user_id: String,
    pub op: String,
    pub amount: String,
    pub round_id: Option<u64>,
    pub client_id: Option<String>,
    pub tx_hash: Option<String>,
    pub log_index: Option<u32>,
    pub created_at: u64,
}

impl LedgerEntry {
    pub fn view(&self) -> LedgerEntryView {
        LedgerEntryView {
            id: self.id,
            user_id: self.user.to_text(),
            op: self.op.code().to_string(),
            amount: self.amount.format_decimal(),
            round_id: self.entry_ref.round_id,
            client_id: self.entry_ref.client_id.clone(),
            tx_hash: self.entry_ref.tx_hash.clone(),
            log_index: self.entry_ref.log_index,
            created_at: self.created_at,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Account {
    pub available: BaseUnits,
    pub locked: BaseUnits,
    pub version: u64,
    pub frozen: bool,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            available: BaseUnits::zero(),
            locked: BaseUnits::zero(),
            version: 0,
            frozen: false,
        }
    }
}

impl Storable for Account {
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

/// What every balance-engine operation returns.
#[derive(Clone, Debug, PartialEq)]
pub struct BalanceSnapshot {
    pub available: BaseUnits,
    pub locked: BaseUnits,
    pub version: u64,
}

impl BalanceSnapshot {
    pub fn of(account: &Account) -> Self {
        Self {
            available: account.available.clone(),
            locked: account.locked.clone(),
            version: account.version,
        }
    }

    pub fn view(&self) -> BalanceView {
        BalanceView {
            available: self.available.format_decimal(),
            locked: self.locked.format_decimal(),
            version: self.version,
        }
    }
}

/// Wire form of a balance: decimal strings, full precision.
#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BalanceView {
    pub available: String,
    pub locked: String,
    pub version: u64,
}

// =============================================================================
// ROUND TYPES
// =============================================================================

#[derive(Serialize, Deserialize, CandidType, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoundPhase {
    Idle,
    Betting,
    Running,
    Settling,
    Revealed,
}

impl RoundPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundPhase::Idle => "idle",
            RoundPhase::Betting => "betting",
            RoundPhase::Running => "running",
            RoundPhase::Settling => "settling",
            RoundPhase::Revealed => "revealed",
        }
    }
}

/// Persisted round record. `server_seed` and `crash_x100` stay `None` until
/// the reveal at round end; the commit hash is public from the start.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Round {
    pub round_id: u64,
    pub commit_hash: String,
    pub server_seed: Option<[u8; 32]>,
    pub client_seed: String,
    pub nonce: u64,
    pub crash_x100: Option<u64>,
    // Derivation parameters captured at open, so old rounds stay verifiable
    // after a config change.
    pub house_edge_bps: u16,
    pub instant_crash_divisor: u64,
    pub max_multiplier_x100: u64,
    pub opened_at: u64,
    pub started_at: Option<u64>,
    pub crashed_at: Option<u64>,
    pub phase: RoundPhase,
}

impl Storable for Round {
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

#[derive(CandidType, Serialize, Deserialize, Clone, Debug)]
pub struct RoundView {
    pub round_id: u64,
    pub phase: String,
    pub commit_hash: String,
    pub client_seed: String,
    pub nonce: u64,
    pub server_seed: Option<String>,
    pub crash_point: Option<f64>,
    pub house_edge_bps: u16,
    pub instant_crash_divisor: u64,
    pub max_multiplier: f64,
    pub opened_at: u64,
    pub started_at: Option<u64>,
    pub crashed_at: Option<u64>,
}

impl Round {
    pub fn view(&self) -> RoundView {
        RoundView {
            round_id: self.round_id,
            phase: self.phase.as_str().to_string(),
            commit_hash: self.commit_hash.clone(),
            client_seed: self.client_seed.clone(),
            nonce: self.nonce,
            server_seed: self.server_seed.map(hex::encode),
            crash_point: self.crash_x100.map(x100_to_f64),
            house_edge_bps: self.house_edge_bps,
            instant_crash_divisor: self.instant_crash_divisor,
            max_multiplier: x100_to_f64(self.max_multiplier_x100),
            opened_at: self.opened_at,
            started_at: self.started_at,
            crashed_at: self.crashed_at,
        }
    }
}

// =============================================================================
// BET TYPES
// =============================================================================

#[derive(Serialize, Deserialize, CandidType, Clone, Copy, Debug, PartialEq, Eq)]
pub enum BetState {
    Placed,
    CashedOut,
    Lost,
    Cancelled,
}

impl BetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BetState::Placed => "placed",
            BetState::CashedOut => "cashed_out",
            BetState::Lost => "lost",
            BetState::Cancelled => "cancelled",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StoredBet {
    pub round_id: u64,
    pub user: Principal,
    pub stake: BaseUnits,
    pub auto_cashout_x100: Option<u64>,
    pub state: BetState,
    pub cashout_x100: Option<u64>,
    pub client_id: String,
    pub placed_at: u64,
}

impl Storable for StoredBet {
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

#[derive(CandidType, Serialize, Deserialize, Clone, Debug)]
pub struct BetView {
    pub round_id: u64,
    pub user_id: String,
    pub stake: String,
    pub auto_cashout: Option<f64>,
    pub state: String,
    pub cashout_multiplier: Option<f64>,
}

impl StoredBet {
    pub fn view(&self) -> BetView {
        BetView {
            round_id: self.round_id,
            user_id: self.user.to_text(),
            stake: self.stake.format_decimal(),
            auto_cashout: self.auto_cashout_x100.map(x100_to_f64),
            state: self.state.as_str().to_string(),
            cashout_multiplier: self.cashout_x100.map(x100_to_f64),
        }
    }
}

// =============================================================================
// DEPOSIT INDEXER TYPES
// =============================================================================

/// A native-token transfer as reported by the chain gateway canister.
/// `amount` is a decimal base-unit string; parsing it is the indexer's job.
#[derive(CandidType, Serialize, Deserialize, Clone, Debug)]
pub struct ChainTransfer {
    pub tx_hash: String,
    pub log_index: u32,
    pub from: String,
    pub to: String,
    pub amount: String,
    pub block_height: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DepositObservation {
    pub tx_hash: String,
    pub log_index: u32,
    pub user: Option<Principal>,
    pub amount: BaseUnits,
    pub block_height: u64,
    pub confirmations: u64,
    pub credited: bool,
    pub stream_hint: bool,
}

impl Storable for DepositObservation {
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

// =============================================================================
// WIRE REQUESTS / RESPONSES
// =============================================================================

#[derive(CandidType, Serialize, Deserialize, Clone, Debug)]
pub struct PlaceBetRequest {
    pub amount: String,
    pub auto_cashout: Option<f64>,
    pub client_id: String,
    pub expected_version: u64,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug)]
pub struct CashOutResult {
    pub round_id: u64,
    pub multiplier: f64,
    pub payout: String,
    pub balance: BalanceView,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug)]
pub struct SessionSnapshot {
    pub user_id: String,
    pub balance: BalanceView,
    pub latest_event_id: u64,
    pub round: Option<RoundView>,
    pub live_bets: Vec<BetView>,
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug)]
pub struct Health {
    pub phase: String,
    pub round_id: u64,
    pub uptime_secs: u64,
    pub chain_head: u64,
    pub indexer_checkpoint: u64,
    pub indexer_lag: u64,
    pub indexer_alert: bool,
    pub ledger_snapshot_drift: String,
    pub drift_detected: bool,
    pub onchain_liability_ratio_bps: u64,
    pub kill_switch: bool,
    pub kill_reason: String,
}
