//! The bet book: per-round stake registry with auto-cashout tracking.
//!
//! One vector of bets per round, persisted in stable memory on every write.
//! The scheduler drains `Placed` bets at settlement; anything still
//! `Placed` after a restart belongs to a round that died mid-flight and is
//! settled as a loss during post-upgrade. Settled rounds are retained as
//! player-visible history.

use crate::memory_ids::BETS_MEMORY_ID;
use crate::types::{BetState, StoredBet};
use crate::Memory;
use candid::Principal;
use ic_stable_structures::memory_manager::MemoryId;
use ic_stable_structures::storable::Bound;
use ic_stable_structures::{StableBTreeMap, Storable};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::cell::RefCell;

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
struct RoundBets(Vec<StoredBet>);

impl Storable for RoundBets {
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
    static BETS: RefCell<StableBTreeMap<u64, RoundBets, Memory>> = RefCell::new(
        StableBTreeMap::init(
            crate::MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(BETS_MEMORY_ID))),
        )
    );
}

fn round_bets(round_id: u64) -> RoundBets {
    BETS.with(|b| b.borrow().get(&round_id)).unwrap_or_default()
}

fn put_round_bets(round_id: u64, bets: RoundBets) {
    BETS.with(|b| {
        b.borrow_mut().insert(round_id, bets);
    });
}

/// Register an accepted bet. The caller has already rejected duplicates.
pub fn insert(bet: StoredBet) {
    let mut bets = round_bets(bet.round_id);
    bets.0.push(bet.clone());
    put_round_bets(bet.round_id, bets);
}

pub fn get(round_id: u64, user: &Principal) -> Option<StoredBet> {
    round_bets(round_id).0.into_iter().find(|b| b.user == *user)
}

/// Mutate one user's bet in place. Returns the updated bet if it existed.
pub fn update<F: FnOnce(&mut StoredBet)>(
    round_id: u64,
    user: &Principal,
    mutate: F,
) -> Option<StoredBet> {
    let mut bets = round_bets(round_id);
    let slot = bets.0.iter_mut().find(|b| b.user == *user)?;
    mutate(slot);
    let updated = slot.clone();
    put_round_bets(round_id, bets);
    Some(updated)
}

pub fn all_bets(round_id: u64) -> Vec<StoredBet> {
    round_bets(round_id).0
}

pub fn placed_bets(round_id: u64) -> Vec<StoredBet> {
    round_bets(round_id)
        .0
        .into_iter()
        .filter(|b| b.state == BetState::Placed)
        .collect()
}

/// Auto-cashouts due at the current multiplier: still placed, target
/// reached, and the target sits strictly below the crash point (ties go to
/// the crash).
pub fn auto_cashouts_due(round_id: u64, m_x100: u64, crash_x100: u64) -> Vec<StoredBet> {
    round_bets(round_id)
        .0
        .into_iter()
        .filter(|b| {
            b.state == BetState::Placed
                && b.auto_cashout_x100
                    .map(|auto| auto <= m_x100 && auto < crash_x100)
                    .unwrap_or(false)
        })
        .collect()
}

/// Rounds at or below `max_round_id` that still hold placed bets. Used after
/// an upgrade to find bets whose round died mid-flight.
pub fn rounds_with_placed_bets(max_round_id: u64) -> Vec<u64> {
    let round_ids: Vec<u64> = BETS.with(|b| b.borrow().keys().collect());
    round_ids
        .into_iter()
        .filter(|id| *id <= max_round_id)
        .filter(|id| {
            round_bets(*id)
                .0
                .iter()
                .any(|b| b.state == BetState::Placed)
        })
        .collect()
}

/// A user's recent bets, newest round first, scanning back from
/// `from_round_id` over at most `scan_rounds` rounds.
pub fn bets_for_user(
    user: &Principal,
    from_round_id: u64,
    scan_rounds: u64,
    limit: usize,
) -> Vec<StoredBet> {
    let mut out = Vec::new();
    let lowest = from_round_id.saturating_sub(scan_rounds);
    let mut round_id = from_round_id;
    while round_id > lowest && out.len() < limit {
        if let Some(bet) = get(round_id, user) {
            out.push(bet);
        }
        round_id -= 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::BaseUnits;

    fn bet(round: u64, user_byte: u8, auto: Option<u64>) -> StoredBet {
        StoredBet {
            round_id: round,
            user: Principal::from_slice(&[user_byte, 0xB0]),
            stake: BaseUnits::from_u64(100),
            auto_cashout_x100: auto,
            state: BetState::Placed,
            cashout_x100: None,
            client_id: format!("c-{}-{}", round, user_byte),
            placed_at: 0,
        }
    }

    #[test]
    fn insert_and_get() {
        insert(bet(1, 1, None));
        insert(bet(1, 2, Some(200)));
        assert!(get(1, &Principal::from_slice(&[1, 0xB0])).is_some());
        assert!(get(1, &Principal::from_slice(&[3, 0xB0])).is_none());
        assert_eq!(all_bets(1).len(), 2);
    }

    #[test]
    fn update_marks_state() {
        insert(bet(2, 1, None));
        let user = Principal::from_slice(&[1, 0xB0]);
        let updated = update(2, &user, |b| {
            b.state = BetState::CashedOut;
            b.cashout_x100 = Some(150);
        })
        .unwrap();
        assert_eq!(updated.state, BetState::CashedOut);
        assert_eq!(get(2, &user).unwrap().cashout_x100, Some(150));
        assert!(placed_bets(2).is_empty());
    }

    #[test]
    fn auto_cashout_selection() {
        insert(bet(3, 1, Some(150))); // due at 1.50
        insert(bet(3, 2, Some(300))); // target above current m
        insert(bet(3, 3, Some(250))); // target at the crash point: rides into it
        insert(bet(3, 4, None)); // manual only

        let due = auto_cashouts_due(3, 200, 250);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].auto_cashout_x100, Some(150));

        // Later tick at the crash multiplier: the 2.50 target still loses.
        let due = auto_cashouts_due(3, 250, 250);
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn leftover_scan_finds_placed_rounds() {
        insert(bet(10, 1, None));
        insert(bet(11, 1, None));
        let user = Principal::from_slice(&[1, 0xB0]);
        update(10, &user, |b| b.state = BetState::Lost);
        assert_eq!(rounds_with_placed_bets(20), vec![11]);
    }

    #[test]
    fn user_history_scans_recent_rounds() {
        for round in 1..=5 {
            insert(bet(round, 7, None));
        }
        let user = Principal::from_slice(&[7, 0xB0]);
        let history = bets_for_user(&user, 5, 10, 3);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].round_id, 5);
    }
}
