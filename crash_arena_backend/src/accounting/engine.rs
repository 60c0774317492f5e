//! The balance engine: the only code that mutates accounts.
//!
//! Four money-moving operations plus withdrawal, each atomic under the
//! canister execution model: there is no `.await` between a check and its
//! write, so a whole operation commits or none of it does. Idempotency comes
//! from the journal's unique keys: the journal lookup happens first, and a
//! replayed operation returns the current snapshot without touching state.
//!
//! The engine never retries. Deterministic failures (`InsufficientFunds`,
//! `VersionConflict`, `Frozen`) go back to the caller unchanged; the caller
//! decides whether to refresh and retry.

use super::store;
use crate::money::BaseUnits;
use crate::solvency;
use crate::types::{BalanceSnapshot, GameError, LedgerRef, OpType};
use candid::Principal;

fn snapshot(user: &Principal) -> BalanceSnapshot {
    BalanceSnapshot::of(&store::get_account(user))
}

/// Lock stake for a bet. OCC: the caller presents the version it last saw;
/// any interleaved write fails the bet with `VersionConflict` and the caller
/// retries with refreshed state.
pub fn place_bet(
    user: Principal,
    amount: &BaseUnits,
    round_id: u64,
    client_id: &str,
    expected_version: u64,
    now: u64,
) -> Result<BalanceSnapshot, GameError> {
    if amount.is_zero() {
        return Err(GameError::InvalidAmount {
            reason: "stake must be positive".to_string(),
        });
    }

    // Idempotent replay: the lock is already journaled, report current state.
    if store::find_duplicate(&store::client_key(&user, OpType::BetLock, client_id)).is_some() {
        return Ok(snapshot(&user));
    }

    if solvency::kill_switch_active() {
        return Err(GameError::KillSwitch);
    }

    let mut account = store::get_account(&user);
    if account.frozen {
        return Err(GameError::Frozen);
    }
    if account.version != expected_version {
        return Err(GameError::VersionConflict {
            current: account.version,
        });
    }
    let remaining = account
        .available
        .checked_sub(amount)
        .ok_or(GameError::InsufficientFunds)?;

    store::append(
        user,
        OpType::BetLock,
        amount.clone(),
        LedgerRef {
            client_id: Some(client_id.to_string()),
            round_id: Some(round_id),
            ..Default::default()
        },
        now,
    );

    account.available = remaining;
    account.locked = account.locked.add(amount);
    account.version += 1;
    store::put_account(user, account.clone());
    // A lock is a pure available -> locked move; total liabilities unchanged.

    Ok(BalanceSnapshot::of(&account))
}

/// Release a lock as a win: `locked -= bet_amount`, `available += win_amount`.
/// Wins on in-flight bets complete even under the kill switch.
pub fn process_win(
    user: Principal,
    win_amount: &BaseUnits,
    bet_amount: &BaseUnits,
    round_id: u64,
    client_id: &str,
    now: u64,
) -> Result<BalanceSnapshot, GameError> {
    if store::find_duplicate(&store::client_key(&user, OpType::BetWin, client_id)).is_some() {
        return Ok(snapshot(&user));
    }

    if store::find_duplicate(&store::client_key(&user, OpType::BetLock, client_id)).is_none() {
        return Err(GameError::NoMatchingLock);
    }

    let mut account = store::get_account(&user);
    let remaining_locked = account
        .locked
        .checked_sub(bet_amount)
        .ok_or(GameError::NoMatchingLock)?;

    // Paying out more than the stake grows total liabilities; refuse if that
    // would push them past what the hot wallet covers.
    if let Some(profit) = win_amount.checked_sub(bet_amount) {
        if !profit.is_zero() {
            let projected = store::liabilities().add(&profit);
            if !solvency::payout_within_limits(&projected) {
                return Err(GameError::SolvencyBlocked);
            }
        }
    }

    store::append(
        user,
        OpType::BetWin,
        win_amount.clone(),
        LedgerRef {
            client_id: Some(client_id.to_string()),
            round_id: Some(round_id),
            bet_amount: Some(bet_amount.clone()),
            ..Default::default()
        },
        now,
    );

    account.locked = remaining_locked;
    account.available = account.available.add(win_amount);
    account.version += 1;
    store::put_account(user, account.clone());
    store::liabilities_add(win_amount);
    store::liabilities_sub(bet_amount);

    Ok(BalanceSnapshot::of(&account))
}

/// Release a lock as a loss: the stake leaves the user entirely.
pub fn process_loss(
    user: Principal,
    bet_amount: &BaseUnits,
    round_id: u64,
    client_id: &str,
    now: u64,
) -> Result<BalanceSnapshot, GameError> {
    if store::find_duplicate(&store::client_key(&user, OpType::BetLose, client_id)).is_some() {
        return Ok(snapshot(&user));
    }

    if store::find_duplicate(&store::client_key(&user, OpType::BetLock, client_id)).is_none() {
        return Err(GameError::NoMatchingLock);
    }

    let mut account = store::get_account(&user);
    let remaining_locked = account
        .locked
        .checked_sub(bet_amount)
        .ok_or(GameError::NoMatchingLock)?;

    store::append(
        user,
        OpType::BetLose,
        bet_amount.clone(),
        LedgerRef {
            client_id: Some(client_id.to_string()),
            round_id: Some(round_id),
            ..Default::default()
        },
        now,
    );

    account.locked = remaining_locked;
    account.version += 1;
    store::put_account(user, account.clone());
    store::liabilities_sub(bet_amount);

    Ok(BalanceSnapshot::of(&account))
}

/// Credit a confirmed on-chain deposit. Exactly-once by `(tx_hash,
/// log_index)`; the second and every later attempt is a silent no-op.
/// Deposits keep crediting under the kill switch and on frozen accounts.
///
/// Returns the snapshot and whether this call actually credited.
pub fn record_deposit(
    tx_hash: &str,
    log_index: u32,
    user: Principal,
    amount: &BaseUnits,
    now: u64,
) -> Result<(BalanceSnapshot, bool), GameError> {
    if amount.is_zero() {
        return Err(GameError::InvalidAmount {
            reason: "deposit must be positive".to_string(),
        });
    }

    if store::find_duplicate(&store::chain_key(tx_hash, log_index)).is_some() {
        return Ok((snapshot(&user), false));
    }

    store::append(
        user,
        OpType::Deposit,
        amount.clone(),
        LedgerRef {
            tx_hash: Some(tx_hash.to_ascii_lowercase()),
            log_index: Some(log_index),
            ..Default::default()
        },
        now,
    );

    let mut account = store::get_account(&user);
    account.available = account.available.add(amount);
    account.version += 1;
    store::put_account(user, account.clone());
    store::liabilities_add(amount);

    Ok((BalanceSnapshot::of(&account), true))
}

/// Debit `available` and journal a withdrawal; the custody pipeline moves
/// the funds on-chain out of band. Idempotent by `client_id`.
pub fn process_withdrawal(
    user: Principal,
    amount: &BaseUnits,
    client_id: &str,
    now: u64,
) -> Result<BalanceSnapshot, GameError> {
    if amount.is_zero() {
        return Err(GameError::InvalidAmount {
            reason: "withdrawal must be positive".to_string(),
        });
    }

    if store::find_duplicate(&store::client_key(&user, OpType::Withdraw, client_id)).is_some() {
        return Ok(snapshot(&user));
    }

    let mut account = store::get_account(&user);
    if account.frozen {
        return Err(GameError::Frozen);
    }
    let remaining = account
        .available
        .checked_sub(amount)
        .ok_or(GameError::InsufficientFunds)?;

    store::append(
        user,
        OpType::Withdraw,
        amount.clone(),
        LedgerRef {
            client_id: Some(client_id.to_string()),
            ..Default::default()
        },
        now,
    );

    account.available = remaining;
    account.version += 1;
    store::put_account(user, account.clone());
    store::liabilities_sub(amount);

    Ok(BalanceSnapshot::of(&account))
}

/// Admin freeze: blocks `place_bet` and withdrawals, never deposits or
/// settlement of in-flight bets.
pub fn set_frozen(user: Principal, frozen: bool) {
    let mut account = store::get_account(&user);
    account.frozen = frozen;
    store::put_account(user, account);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(n: u8) -> Principal {
        Principal::from_slice(&[n; 8])
    }

    fn fund(u: Principal, amount: u128, tx: &str) {
        record_deposit(tx, 0, u, &BaseUnits::from_u128(amount), 1).unwrap();
    }

    #[test]
    fn happy_path_bet_and_win() {
        let u = user(1);
        fund(u, 1_000_000_000_000_000_000, "0xaa01");

        let stake = BaseUnits::from_u128(500_000_000_000_000_000);
        let after_bet = place_bet(u, &stake, 1, "C1", 1, 2).unwrap();
        assert_eq!(after_bet.available, BaseUnits::from_u128(500_000_000_000_000_000));
        assert_eq!(after_bet.locked, stake);
        assert_eq!(after_bet.version, 2);

        // Cash out at 1.50x
        let payout = stake.mul_by_ratio(150, 100).unwrap();
        let after_win = process_win(u, &payout, &stake, 1, "C1", 3).unwrap();
        assert_eq!(after_win.available, BaseUnits::from_u128(1_250_000_000_000_000_000));
        assert!(after_win.locked.is_zero());
        assert_eq!(after_win.version, 3);
    }

    #[test]
    fn replayed_place_bet_is_a_no_op() {
        let u = user(2);
        fund(u, 1_000_000_000_000_000_000, "0xaa02");

        let stake = BaseUnits::from_u128(500_000_000_000_000_000);
        let first = place_bet(u, &stake, 1, "C1", 1, 2).unwrap();
        let second = place_bet(u, &stake, 1, "C1", 1, 2).unwrap();
        assert_eq!(first, second);
        // Exactly one lock in the journal for this client id
        let key = store::client_key(&u, OpType::BetLock, "C1");
        assert!(store::find_duplicate(&key).is_some());
        assert_eq!(store::get_account(&u).version, 2);
    }

    #[test]
    fn version_conflict_rejects_second_writer() {
        let u = user(3);
        fund(u, 1_000_000_000_000_000_000, "0xaa03");

        let stake = BaseUnits::from_u128(100_000_000_000_000_000);
        place_bet(u, &stake, 1, "C1", 1, 2).unwrap();
        let err = place_bet(u, &stake, 1, "C2", 1, 2).unwrap_err();
        assert_eq!(err, GameError::VersionConflict { current: 2 });
    }

    #[test]
    fn insufficient_funds() {
        let u = user(4);
        fund(u, 100, "0xaa04");
        let err = place_bet(u, &BaseUnits::from_u64(101), 1, "C1", 1, 2).unwrap_err();
        assert_eq!(err, GameError::InsufficientFunds);
    }

    #[test]
    fn deposit_is_exactly_once() {
        let u = user(5);
        let amount = BaseUnits::from_u128(2_000_000_000_000_000_000);
        let (snap, credited) = record_deposit("0xABC", 0, u, &amount, 1).unwrap();
        assert!(credited);
        assert_eq!(snap.available, amount);
        assert_eq!(snap.version, 1);

        // Same (tx, log_index) again, case-insensitive: silent no-op.
        let (snap2, credited2) = record_deposit("0xabc", 0, u, &amount, 2).unwrap();
        assert!(!credited2);
        assert_eq!(snap2.available, amount);
        assert_eq!(snap2.version, 1);

        // Different log index on the same tx is a distinct deposit.
        let (snap3, credited3) = record_deposit("0xabc", 1, u, &amount, 3).unwrap();
        assert!(credited3);
        assert_eq!(snap3.version, 2);
    }

    #[test]
    fn loss_consumes_the_lock() {
        let u = user(6);
        fund(u, 1_000, "0xaa06");
        place_bet(u, &BaseUnits::from_u64(400), 1, "C1", 1, 2).unwrap();
        let after = process_loss(u, &BaseUnits::from_u64(400), 1, "C1", 3).unwrap();
        assert_eq!(after.available, BaseUnits::from_u64(600));
        assert!(after.locked.is_zero());
        assert_eq!(after.version, 3);

        // Settling the same bet again changes nothing.
        let replay = process_loss(u, &BaseUnits::from_u64(400), 1, "C1", 4).unwrap();
        assert_eq!(replay.version, 3);
    }

    #[test]
    fn win_without_lock_is_rejected() {
        let u = user(7);
        fund(u, 1_000, "0xaa07");
        let err = process_win(u, &BaseUnits::from_u64(10), &BaseUnits::from_u64(5), 1, "C9", 2)
            .unwrap_err();
        assert_eq!(err, GameError::NoMatchingLock);
    }

    #[test]
    fn frozen_blocks_bets_but_not_deposits() {
        let u = user(8);
        fund(u, 1_000, "0xaa08");
        set_frozen(u, true);
        let err = place_bet(u, &BaseUnits::from_u64(10), 1, "C1", 1, 2).unwrap_err();
        assert_eq!(err, GameError::Frozen);
        let (_, credited) = record_deposit("0xaa08b", 0, u, &BaseUnits::from_u64(5), 3).unwrap();
        assert!(credited);
        set_frozen(u, false);
        assert!(place_bet(u, &BaseUnits::from_u64(10), 1, "C1", 2, 4).is_ok());
    }

    #[test]
    fn withdrawal_debits_and_replays_silently() {
        let u = user(9);
        fund(u, 1_000, "0xaa09");
        let after = process_withdrawal(u, &BaseUnits::from_u64(300), "W1", 2).unwrap();
        assert_eq!(after.available, BaseUnits::from_u64(700));
        assert_eq!(after.version, 2);
        let replay = process_withdrawal(u, &BaseUnits::from_u64(300), "W1", 3).unwrap();
        assert_eq!(replay, after);
    }

    #[test]
    fn journal_reconstructs_balances() {
        let u = user(10);
        fund(u, 1_000, "0xaa10");
        place_bet(u, &BaseUnits::from_u64(400), 1, "C1", 1, 2).unwrap();
        process_win(u, &BaseUnits::from_u64(600), &BaseUnits::from_u64(400), 1, "C1", 3).unwrap();
        place_bet(u, &BaseUnits::from_u64(200), 2, "C2", 3, 4).unwrap();
        process_loss(u, &BaseUnits::from_u64(200), 2, "C2", 5).unwrap();
        process_withdrawal(u, &BaseUnits::from_u64(100), "W1", 6).unwrap();

        let account = store::get_account(&u);
        let total = account.available.add(&account.locked);
        assert_eq!(store::user_signed_total(&u), Some(total));
    }
}
