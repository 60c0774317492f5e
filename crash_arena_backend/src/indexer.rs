//! The deposit indexer: attributes hot-wallet transfers to user balances
//! exactly once, across reorgs, dropped subscriptions, and duplicate
//! notifications.
//!
//! Two inputs, one source of truth:
//! - **Polling** (the truth): every pass scans `[checkpoint+1, head −
//!   reorg_buffer]` through the chain gateway canister and credits confirmed
//!   transfers via the balance engine. The checkpoint only advances after a
//!   whole range has been processed, so a failed pass simply replays: the
//!   `(tx_hash, log_index)` journal index makes the replay harmless.
//! - **Streaming hints** (`notify_transfer` from the gateway): recorded as
//!   observations, never credited. A hinted transfer that later fails to
//!   appear in the canonical range is a reorg alert; no ledger rollback is
//!   ever needed because credits happen only past the reorg depth.
//!
//! Transfers from addresses no one has linked are held for manual review
//! and never credited.

use crate::accounting::guard::{LoopGuard, LoopKind};
use crate::accounting::{engine, store};
use crate::config::{self, Config};
use crate::events;
use crate::memory_ids::OBSERVATIONS_MEMORY_ID;
use crate::money::BaseUnits;
use crate::session;
use crate::stats;
use crate::types::{ChainTransfer, DepositObservation, GameError};
use crate::Memory;
use candid::{CandidType, Principal};
use ic_cdk::call::Call;
use ic_stable_structures::memory_manager::MemoryId;
use ic_stable_structures::StableBTreeMap;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashSet;
use std::time::Duration;

const BACKOFF_BASE_MS: u64 = 1_000;
const BACKOFF_CAP_MS: u64 = 60_000;
const BACKOFF_JITTER_MS: u64 = 250;
/// Continuous failure longer than this raises the indexer alert.
const ALERT_AFTER_NS: u64 = 300_000_000_000;

thread_local! {
    static OBSERVATIONS: RefCell<StableBTreeMap<String, DepositObservation, Memory>> = RefCell::new(
        StableBTreeMap::init(
            crate::MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(OBSERVATIONS_MEMORY_ID))),
        )
    );

    static CONSECUTIVE_FAILURES: RefCell<u32> = const { RefCell::new(0) };
    static LAST_SUCCESS_NS: RefCell<u64> = const { RefCell::new(0) };
    static LAST_HEAD: RefCell<u64> = const { RefCell::new(0) };
    static ALERT_ACTIVE: RefCell<bool> = const { RefCell::new(false) };
}

// =============================================================================
// SCHEDULING
// =============================================================================

pub fn start() {
    LAST_SUCCESS_NS.with(|c| *c.borrow_mut() = ic_cdk::api::time());
    schedule_poll(Duration::from_secs(1));
}

fn schedule_poll(delay: Duration) {
    ic_cdk_timers::set_timer(delay, async {
        poll_once().await;
    });
}

/// Exponential backoff with a time-derived jitter: 1 s base, 60 s cap.
fn backoff_delay_ms(failures: u32, jitter_seed: u64) -> u64 {
    let exp = failures.min(6);
    let base = (BACKOFF_BASE_MS << exp).min(BACKOFF_CAP_MS);
    base + jitter_seed % BACKOFF_JITTER_MS
}

async fn poll_once() {
    let Some(_guard) = LoopGuard::acquire(LoopKind::IndexerPoll) else {
        // A previous pass is still awaiting the gateway.
        schedule_poll(Duration::from_millis(config::get().polling_interval_ms));
        return;
    };

    let cfg = config::get();
    match scan_pass(&cfg).await {
        Ok(()) => {
            CONSECUTIVE_FAILURES.with(|c| *c.borrow_mut() = 0);
            LAST_SUCCESS_NS.with(|c| *c.borrow_mut() = ic_cdk::api::time());
            ALERT_ACTIVE.with(|a| *a.borrow_mut() = false);
            schedule_poll(Duration::from_millis(cfg.polling_interval_ms));
        }
        Err(e) => {
            let now = ic_cdk::api::time();
            let failures = CONSECUTIVE_FAILURES.with(|c| {
                let mut c = c.borrow_mut();
                *c += 1;
                *c
            });
            ic_cdk::println!("Indexer pass failed ({} in a row): {}", failures, e);

            let failing_since = LAST_SUCCESS_NS.with(|c| *c.borrow());
            if now.saturating_sub(failing_since) > ALERT_AFTER_NS {
                let already = ALERT_ACTIVE.with(|a| std::mem::replace(&mut *a.borrow_mut(), true));
                if !already {
                    ic_cdk::println!(
                        "CRITICAL: deposit indexer has been failing for over 5 minutes"
                    );
                }
            }
            schedule_poll(Duration::from_millis(backoff_delay_ms(failures, now)));
        }
    }
}

// =============================================================================
// POLLING PASS
// =============================================================================

async fn scan_pass(cfg: &Config) -> Result<(), GameError> {
    if cfg.chain_gateway == Principal::anonymous() {
        // Gateway not configured yet; nothing to scan.
        return Ok(());
    }

    let head = chain_head(cfg.chain_gateway).await?;
    LAST_HEAD.with(|h| *h.borrow_mut() = head);

    let checkpoint = store::checkpoint_get();
    let target = head.saturating_sub(cfg.reorg_buffer.max(cfg.confirmations));
    if target <= checkpoint {
        return Ok(());
    }

    let transfers =
        get_transfers(cfg.chain_gateway, checkpoint + 1, target, &cfg.hot_wallet).await?;

    // Everything below is synchronous: one atomic section per pass.
    let now = ic_cdk::api::time();
    let hot_wallet = cfg.hot_wallet.to_ascii_lowercase();
    let mut canonical: HashSet<String> = HashSet::new();

    for transfer in &transfers {
        if transfer.to.to_ascii_lowercase() != hot_wallet {
            continue;
        }
        if transfer.block_height < checkpoint + 1 || transfer.block_height > target {
            continue;
        }
        if head.saturating_sub(transfer.block_height) < cfg.confirmations {
            continue;
        }
        let key = store::chain_key(&transfer.tx_hash, transfer.log_index);
        canonical.insert(key.clone());
        credit_transfer(transfer, head, now);
    }

    check_for_reorgs(checkpoint + 1, target, &canonical);

    // The whole range processed: only now does the scan horizon move.
    store::checkpoint_set(target);
    Ok(())
}

fn credit_transfer(transfer: &ChainTransfer, head: u64, now: u64) {
    let key = store::chain_key(&transfer.tx_hash, transfer.log_index);
    let confirmations = head.saturating_sub(transfer.block_height);

    let amount = match BaseUnits::parse_decimal(&transfer.amount) {
        Ok(amount) if !amount.is_zero() => amount,
        _ => {
            ic_cdk::println!(
                "AUDIT: transfer {} has unusable amount {:?}, held for review",
                key,
                transfer.amount
            );
            put_observation(DepositObservation {
                tx_hash: transfer.tx_hash.to_ascii_lowercase(),
                log_index: transfer.log_index,
                user: None,
                amount: BaseUnits::zero(),
                block_height: transfer.block_height,
                confirmations,
                credited: false,
                stream_hint: false,
            });
            return;
        }
    };

    let owner = session::wallet_owner(&transfer.from);
    let mut observation = DepositObservation {
        tx_hash: transfer.tx_hash.to_ascii_lowercase(),
        log_index: transfer.log_index,
        user: owner,
        amount: amount.clone(),
        block_height: transfer.block_height,
        confirmations,
        credited: false,
        stream_hint: false,
    };

    match owner {
        Some(user) => match engine::record_deposit(&transfer.tx_hash, transfer.log_index, user, &amount, now) {
            Ok((snapshot, credited)) => {
                observation.credited = true;
                if credited {
                    stats::record_deposit(&amount);
                    events::publish_balance(user, &snapshot);
                    ic_cdk::println!(
                        "Deposit credited: {} base units to {} ({})",
                        amount,
                        user,
                        key
                    );
                }
            }
            Err(e) => {
                ic_cdk::println!("CRITICAL: deposit credit failed for {}: {}", key, e);
            }
        },
        None => {
            ic_cdk::println!(
                "AUDIT: unattributed transfer {} from {}, held for manual review",
                key,
                transfer.from
            );
        }
    }

    put_observation(observation);
}

/// A streaming hint inside the scanned range that the canonical chain no
/// longer contains was reorged away. Credits cannot be affected: they only
/// happen past the reorg depth, so this is an alert, not a rollback.
fn check_for_reorgs(from_block: u64, to_block: u64, canonical: &HashSet<String>) {
    let keys: Vec<String> = OBSERVATIONS.with(|o| o.borrow().keys().collect());
    for key in keys {
        let Some(obs) = OBSERVATIONS.with(|o| o.borrow().get(&key)) else {
            continue;
        };
        if obs.stream_hint
            && !obs.credited
            && obs.block_height >= from_block
            && obs.block_height <= to_block
            && !canonical.contains(&key)
        {
            ic_cdk::println!(
                "CRITICAL: hinted transfer {} disappeared from the canonical chain (reorg)",
                key
            );
        }
    }
}

fn put_observation(observation: DepositObservation) {
    let key = store::chain_key(&observation.tx_hash, observation.log_index);
    OBSERVATIONS.with(|o| {
        o.borrow_mut().insert(key, observation);
    });
}

// =============================================================================
// STREAMING HINTS
// =============================================================================

/// Inbound push from the gateway's block subscription. Hints are recorded
/// for the reorg cross-check and early visibility; crediting stays with the
/// polling pass alone.
pub fn handle_notify_transfer(
    caller: Principal,
    transfer: ChainTransfer,
    _now: u64,
) -> Result<(), GameError> {
    let cfg = config::get();
    if caller != cfg.chain_gateway || caller == Principal::anonymous() {
        return Err(GameError::Unauthenticated);
    }

    let key = store::chain_key(&transfer.tx_hash, transfer.log_index);
    if OBSERVATIONS.with(|o| o.borrow().get(&key)).is_some() {
        return Ok(());
    }

    let amount = BaseUnits::parse_decimal(&transfer.amount).unwrap_or_else(|_| BaseUnits::zero());
    put_observation(DepositObservation {
        tx_hash: transfer.tx_hash.to_ascii_lowercase(),
        log_index: transfer.log_index,
        user: session::wallet_owner(&transfer.from),
        amount,
        block_height: transfer.block_height,
        confirmations: 0,
        credited: false,
        stream_hint: true,
    });
    Ok(())
}

// =============================================================================
// GATEWAY CALLS
// =============================================================================

async fn chain_head(gateway: Principal) -> Result<u64, GameError> {
    Call::unbounded_wait(gateway, "chain_head")
        .await
        .map_err(|e| GameError::TransientIO {
            detail: format!("chain_head call failed: {:?}", e),
        })?
        .candid::<u64>()
        .map_err(|e| GameError::TransientIO {
            detail: format!("chain_head decode failed: {:?}", e),
        })
}

async fn get_transfers(
    gateway: Principal,
    from_block: u64,
    to_block: u64,
    address: &str,
) -> Result<Vec<ChainTransfer>, GameError> {
    Call::unbounded_wait(gateway, "get_transfers")
        .with_args(&(from_block, to_block, address.to_string()))
        .await
        .map_err(|e| GameError::TransientIO {
            detail: format!("get_transfers call failed: {:?}", e),
        })?
        .candid::<Vec<ChainTransfer>>()
        .map_err(|e| GameError::TransientIO {
            detail: format!("get_transfers decode failed: {:?}", e),
        })
}

// =============================================================================
// STATUS & ADMIN VIEWS
// =============================================================================

pub struct IndexerStatus {
    pub head: u64,
    pub checkpoint: u64,
    pub lag: u64,
    pub alert: bool,
}

pub fn status() -> IndexerStatus {
    let head = LAST_HEAD.with(|h| *h.borrow());
    let checkpoint = store::checkpoint_get();
    IndexerStatus {
        head,
        checkpoint,
        lag: head.saturating_sub(checkpoint),
        alert: ALERT_ACTIVE.with(|a| *a.borrow()),
    }
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug)]
pub struct ObservationView {
    pub tx_hash: String,
    pub log_index: u32,
    pub user_id: Option<String>,
    pub amount: String,
    pub block_height: u64,
    pub confirmations: u64,
    pub credited: bool,
    pub stream_hint: bool,
}

fn observation_view(obs: &DepositObservation) -> ObservationView {
    ObservationView {
        tx_hash: obs.tx_hash.clone(),
        log_index: obs.log_index,
        user_id: obs.user.map(|u| u.to_text()),
        amount: obs.amount.format_decimal(),
        block_height: obs.block_height,
        confirmations: obs.confirmations,
        credited: obs.credited,
        stream_hint: obs.stream_hint,
    }
}

/// Transfers held for manual review: observed, confirmed, but never
/// attributed to a linked wallet.
pub fn unattributed_observations(limit: usize) -> Vec<ObservationView> {
    let keys: Vec<String> = OBSERVATIONS.with(|o| o.borrow().keys().collect());
    let mut out = Vec::new();
    for key in keys {
        if out.len() >= limit {
            break;
        }
        if let Some(obs) = OBSERVATIONS.with(|o| o.borrow().get(&key)) {
            if obs.user.is_none() && !obs.credited && !obs.stream_hint {
                out.push(observation_view(&obs));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        assert!(backoff_delay_ms(0, 0) >= 1_000);
        assert!(backoff_delay_ms(1, 0) >= 2_000);
        assert_eq!(backoff_delay_ms(6, 0), 60_000);
        assert_eq!(backoff_delay_ms(40, 0), 60_000);
        // Jitter stays bounded
        assert!(backoff_delay_ms(0, u64::MAX) < 1_000 + BACKOFF_JITTER_MS);
    }

    #[test]
    fn hints_are_recorded_but_never_credit() {
        let gateway = Principal::anonymous();
        // An unconfigured gateway rejects every hint.
        let transfer = ChainTransfer {
            tx_hash: "0xDEAD".to_string(),
            log_index: 0,
            from: "0x1111111111111111111111111111111111111111".to_string(),
            to: "0x2222222222222222222222222222222222222222".to_string(),
            amount: "1.5".to_string(),
            block_height: 10,
        };
        assert_eq!(
            handle_notify_transfer(gateway, transfer, 0),
            Err(GameError::Unauthenticated)
        );
    }

    #[test]
    fn observation_views_render_decimal_amounts() {
        let obs = DepositObservation {
            tx_hash: "0xabc".to_string(),
            log_index: 2,
            user: None,
            amount: BaseUnits::from_u128(1_250_000_000_000_000_000),
            block_height: 5,
            confirmations: 13,
            credited: false,
            stream_hint: false,
        };
        let view = observation_view(&obs);
        assert_eq!(view.amount, "1.25");
        assert!(view.user_id.is_none());
    }
}
