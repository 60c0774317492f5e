//! Mirror model of the balance engine and the differential harness.
//!
//! The model stores balances as `u128` and applies the same rules the
//! engine does: OCC on bet placement, idempotency on every key, version
//! bump per successful write. The harness runs an operation sequence
//! against both and asserts they never disagree, and that the journal
//! alone reconstructs every balance after any sequence.

use crate::accounting::{engine, store};
use crate::money::BaseUnits;
use crate::types::GameError;
use candid::Principal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Distinct namespace per harness run, so proptest cases sharing a test
/// thread (and therefore the thread-local stable state) never collide.
static CASE_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn next_case_id() -> u64 {
    CASE_COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone, Debug)]
pub enum Op {
    Deposit { slot: u8, amount: u64 },
    ReplayDeposit { slot: u8 },
    PlaceBet { slot: u8, amount: u64 },
    ReplayBet { slot: u8 },
    /// Settle the slot's open bet as a win at `mult_x100` (>= 100).
    Win { slot: u8, mult_x100: u64 },
    Lose { slot: u8 },
    Withdraw { slot: u8, amount: u64 },
}

#[derive(Default, Clone)]
struct SlotState {
    available: u128,
    locked: u128,
    version: u64,
    /// The open bet's (client_id, stake), if any.
    open_bet: Option<(String, u128)>,
    deposits_made: u64,
    bets_made: u64,
    withdrawals_made: u64,
    last_deposit_tx: Option<String>,
}

pub struct Harness {
    case: u64,
    slots: HashMap<u8, SlotState>,
    round: u64,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            case: next_case_id(),
            slots: HashMap::new(),
            round: 1,
        }
    }

    fn principal(&self, slot: u8) -> Principal {
        let mut bytes = [0u8; 10];
        bytes[0..8].copy_from_slice(&self.case.to_be_bytes());
        bytes[8] = slot;
        bytes[9] = 0x7E;
        Principal::from_slice(&bytes)
    }

    fn slot(&mut self, slot: u8) -> &mut SlotState {
        self.slots.entry(slot).or_default()
    }

    /// Apply one operation to both the engine and the mirror, then compare.
    pub fn apply(&mut self, op: Op) {
        let case = self.case;
        match op {
            Op::Deposit { slot, amount } => {
                let amount = amount.max(1);
                let user = self.principal(slot);
                let state = self.slot(slot);
                let tx = format!("0x{:016x}{:02x}{:04x}", case, slot, state.deposits_made);
                state.deposits_made += 1;
                state.last_deposit_tx = Some(tx.clone());

                let (snap, credited) =
                    engine::record_deposit(&tx, 0, user, &BaseUnits::from_u64(amount), 1).unwrap();
                assert!(credited, "fresh deposit must credit");
                state.available += amount as u128;
                state.version += 1;
                assert_eq!(snap.version, state.version);
            }
            Op::ReplayDeposit { slot } => {
                let user = self.principal(slot);
                let state = self.slot(slot);
                let Some(tx) = state.last_deposit_tx.clone() else {
                    return;
                };
                let (snap, credited) =
                    engine::record_deposit(&tx, 0, user, &BaseUnits::from_u64(1), 2).unwrap();
                assert!(!credited, "replayed deposit must not credit");
                assert_eq!(snap.version, state.version, "replay must not bump version");
            }
            Op::PlaceBet { slot, amount } => {
                let amount = amount.max(1);
                let user = self.principal(slot);
                let round = self.round;
                let state = self.slot(slot);
                let client = format!("bet-{:x}-{}-{}", case, slot, state.bets_made);
                state.bets_made += 1;

                let result = engine::place_bet(
                    user,
                    &BaseUnits::from_u64(amount),
                    round,
                    &client,
                    state.version,
                    3,
                );
                match result {
                    Ok(snap) => {
                        assert!((amount as u128) <= state.available);
                        state.available -= amount as u128;
                        state.locked += amount as u128;
                        state.version += 1;
                        assert_eq!(snap.version, state.version);
                        if state.open_bet.is_none() {
                            state.open_bet = Some((client, amount as u128));
                        } else {
                            // A second lock with a fresh client id is legal
                            // at the engine level. The mirror tracks one bet
                            // per slot, so settle this one as a loss now.
                            engine::process_loss(
                                user,
                                &BaseUnits::from_u64(amount),
                                round,
                                &client,
                                4,
                            )
                            .unwrap();
                            state.locked -= amount as u128;
                            state.version += 1;
                        }
                    }
                    Err(GameError::InsufficientFunds) => {
                        assert!((amount as u128) > state.available);
                    }
                    Err(e) => panic!("unexpected error: {:?}", e),
                }
            }
            Op::ReplayBet { slot } => {
                let user = self.principal(slot);
                let round = self.round;
                let state = self.slot(slot);
                let Some((client, _stake)) = state.open_bet.clone() else {
                    return;
                };
                // Identical client id: silent replay regardless of the stale
                // expected_version.
                let snap =
                    engine::place_bet(user, &BaseUnits::from_u64(1), round, &client, 0, 5).unwrap();
                assert_eq!(snap.version, state.version, "replay must not bump version");
                assert_eq!(snap.available, BaseUnits::from_u128(state.available));
                assert_eq!(snap.locked, BaseUnits::from_u128(state.locked));
            }
            Op::Win { slot, mult_x100 } => {
                let mult = mult_x100.max(100);
                let user = self.principal(slot);
                let round = self.round;
                let state = self.slot(slot);
                let Some((client, stake)) = state.open_bet.take() else {
                    return;
                };
                let payout = stake * mult as u128 / 100;
                let snap = engine::process_win(
                    user,
                    &BaseUnits::from_u128(payout),
                    &BaseUnits::from_u128(stake),
                    round,
                    &client,
                    6,
                )
                .unwrap();
                state.locked -= stake;
                state.available += payout;
                state.version += 1;
                assert_eq!(snap.version, state.version);
                assert_eq!(snap.available, BaseUnits::from_u128(state.available));

                // Settling the same bet twice must not pay twice.
                let replay = engine::process_win(
                    user,
                    &BaseUnits::from_u128(payout),
                    &BaseUnits::from_u128(stake),
                    round,
                    &client,
                    7,
                )
                .unwrap();
                assert_eq!(replay.version, state.version);
            }
            Op::Lose { slot } => {
                let user = self.principal(slot);
                let round = self.round;
                let state = self.slot(slot);
                let Some((client, stake)) = state.open_bet.take() else {
                    return;
                };
                let snap =
                    engine::process_loss(user, &BaseUnits::from_u128(stake), round, &client, 8)
                        .unwrap();
                state.locked -= stake;
                state.version += 1;
                assert_eq!(snap.version, state.version);
                self.round += 1;
            }
            Op::Withdraw { slot, amount } => {
                let amount = amount.max(1);
                let user = self.principal(slot);
                let state = self.slot(slot);
                let client = format!("wd-{:x}-{}-{}", case, slot, state.withdrawals_made);
                state.withdrawals_made += 1;
                let result =
                    engine::process_withdrawal(user, &BaseUnits::from_u64(amount), &client, 9);
                if (amount as u128) <= state.available {
                    let snap = result.unwrap();
                    state.available -= amount as u128;
                    state.version += 1;
                    assert_eq!(snap.version, state.version);
                } else {
                    assert_eq!(result.unwrap_err(), GameError::InsufficientFunds);
                }
            }
        }
        self.check_all();
    }

    /// Compare every slot against the engine and the journal reconstruction.
    pub fn check_all(&self) {
        for (slot, state) in &self.slots {
            let user = self.principal(*slot);
            let account = store::get_account(&user);
            assert_eq!(
                account.available,
                BaseUnits::from_u128(state.available),
                "slot {} available diverged",
                slot
            );
            assert_eq!(
                account.locked,
                BaseUnits::from_u128(state.locked),
                "slot {} locked diverged",
                slot
            );
            assert_eq!(account.version, state.version, "slot {} version diverged", slot);

            // available + locked must equal the signed journal sum.
            let total = account.available.add(&account.locked);
            assert_eq!(
                store::user_signed_total(&user),
                Some(total),
                "slot {} journal does not reconstruct the snapshot",
                slot
            );
        }
    }
}
