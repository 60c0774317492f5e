//! The persistence layer: append-only journal, snapshot accounts, and the
//! idempotency indexes that make every money operation safely retryable.
//!
//! The journal is the source of truth. Entries are keyed by a serial id and
//! are never updated or deleted; a duplicate append (same idempotency key)
//! is a silent no-op that reports the existing entry. Snapshot accounts are
//! a cache the journal can always reproduce: the solvency watchdog checks
//! exactly that.

use crate::memory_ids::{
    ACCOUNTS_MEMORY_ID, CHECKPOINT_MEMORY_ID, IDEMPOTENCY_MEMORY_ID, JOURNAL_MEMORY_ID,
    LIABILITIES_MEMORY_ID, NEXT_ENTRY_ID_MEMORY_ID,
};
use crate::money::BaseUnits;
use crate::types::{Account, LedgerEntry, LedgerRef, OpType};
use crate::Memory;
use candid::Principal;
use ic_stable_structures::memory_manager::MemoryId;
use ic_stable_structures::{StableBTreeMap, StableCell};
use std::cell::RefCell;

thread_local! {
    static ACCOUNTS: RefCell<StableBTreeMap<Principal, Account, Memory>> = RefCell::new(
        StableBTreeMap::init(
            crate::MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(ACCOUNTS_MEMORY_ID))),
        )
    );

    static JOURNAL: RefCell<StableBTreeMap<u64, LedgerEntry, Memory>> = RefCell::new(
        StableBTreeMap::init(
            crate::MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(JOURNAL_MEMORY_ID))),
        )
    );

    static IDEMPOTENCY: RefCell<StableBTreeMap<String, u64, Memory>> = RefCell::new(
        StableBTreeMap::init(
            crate::MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(IDEMPOTENCY_MEMORY_ID))),
        )
    );

    static NEXT_ENTRY_ID: RefCell<StableCell<u64, Memory>> = RefCell::new(
        StableCell::init(
            crate::MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(NEXT_ENTRY_ID_MEMORY_ID))),
            1u64
        )
    );

    static CHECKPOINT: RefCell<StableCell<u64, Memory>> = RefCell::new(
        StableCell::init(
            crate::MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(CHECKPOINT_MEMORY_ID))),
            0u64
        )
    );

    // Running total of available + locked across all accounts, maintained by
    // the engine on every write so solvency checks are O(1). The watchdog
    // recomputes the true sum and flags any disagreement.
    static LIABILITIES: RefCell<StableCell<BaseUnits, Memory>> = RefCell::new(
        StableCell::init(
            crate::MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(LIABILITIES_MEMORY_ID))),
            BaseUnits::zero()
        )
    );
}

// =============================================================================
// IDEMPOTENCY KEYS
// =============================================================================

/// Unique key for a client-initiated operation: one `(user, op, client_id)`
/// triple is admitted to the journal exactly once.
pub fn client_key(user: &Principal, op: OpType, client_id: &str) -> String {
    format!("{}:{}:{}", user.to_text(), op.code(), client_id)
}

/// Unique key for a chain-initiated deposit.
pub fn chain_key(tx_hash: &str, log_index: u32) -> String {
    format!("{}:{}", tx_hash.to_ascii_lowercase(), log_index)
}

fn entry_key(user: &Principal, op: OpType, entry_ref: &LedgerRef) -> String {
    match (&entry_ref.tx_hash, &entry_ref.client_id) {
        (Some(tx), _) => chain_key(tx, entry_ref.log_index.unwrap_or(0)),
        (None, Some(client_id)) => client_key(user, op, client_id),
        (None, None) => {
            // Adjustments without a reference still get a unique key so the
            // journal stays append-once per id.
            format!("{}:{}:entry-{}", user.to_text(), op.code(), peek_next_entry_id())
        }
    }
}

// =============================================================================
// JOURNAL
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted(u64),
    Duplicate(u64),
}

fn peek_next_entry_id() -> u64 {
    NEXT_ENTRY_ID.with(|cell| *cell.borrow().get())
}

/// Append an entry to the journal. Duplicate idempotency keys are a silent
/// no-op reporting the id of the original entry.
pub fn append(
    user: Principal,
    op: OpType,
    amount: BaseUnits,
    entry_ref: LedgerRef,
    created_at: u64,
) -> AppendOutcome {
    let key = entry_key(&user, op, &entry_ref);
    if let Some(existing) = IDEMPOTENCY.with(|idx| idx.borrow().get(&key)) {
        return AppendOutcome::Duplicate(existing);
    }

    let id = NEXT_ENTRY_ID.with(|cell| {
        let id = *cell.borrow().get();
        cell.borrow_mut().set(id + 1);
        id
    });

    let entry = LedgerEntry {
        id,
        user,
        op,
        amount,
        entry_ref,
        created_at,
    };
    JOURNAL.with(|j| j.borrow_mut().insert(id, entry));
    IDEMPOTENCY.with(|idx| idx.borrow_mut().insert(key, id));
    AppendOutcome::Inserted(id)
}

pub fn find_duplicate(key: &str) -> Option<u64> {
    IDEMPOTENCY.with(|idx| idx.borrow().get(&key.to_string()))
}

pub fn entry(id: u64) -> Option<LedgerEntry> {
    JOURNAL.with(|j| j.borrow().get(&id))
}

pub fn journal_len() -> u64 {
    peek_next_entry_id().saturating_sub(1)
}

/// A page of journal entries by serial id, ascending from `start_id`.
pub fn entries_page(start_id: u64, limit: u64) -> Vec<LedgerEntry> {
    let last = journal_len();
    let start = start_id.max(1);
    let mut out = Vec::new();
    let mut id = start;
    while id <= last && (out.len() as u64) < limit {
        if let Some(e) = entry(id) {
            out.push(e);
        }
        id += 1;
    }
    out
}

/// Most recent entries for one user, newest first.
pub fn entries_for_user(user: &Principal, limit: u64) -> Vec<LedgerEntry> {
    let mut out = Vec::new();
    let mut id = journal_len();
    while id >= 1 && (out.len() as u64) < limit {
        if let Some(e) = entry(id) {
            if e.user == *user {
                out.push(e);
            }
        }
        id -= 1;
    }
    out
}

// =============================================================================
// ACCOUNTS
// =============================================================================

/// Snapshot account for a user, zeros if none exists yet. Accounts are
/// created lazily on first credit; reading never creates a row.
pub fn get_account(user: &Principal) -> Account {
    ACCOUNTS.with(|a| a.borrow().get(user)).unwrap_or_default()
}

pub fn put_account(user: Principal, account: Account) {
    ACCOUNTS.with(|a| {
        a.borrow_mut().insert(user, account);
    });
}

pub fn account_principals() -> Vec<Principal> {
    ACCOUNTS.with(|a| a.borrow().keys().collect())
}

pub fn account_count() -> u64 {
    ACCOUNTS.with(|a| a.borrow().len())
}

// =============================================================================
// LIABILITIES CACHE
// =============================================================================

pub fn liabilities() -> BaseUnits {
    LIABILITIES.with(|cell| cell.borrow().get().clone())
}

pub fn liabilities_add(delta: &BaseUnits) {
    LIABILITIES.with(|cell| {
        let next = cell.borrow().get().add(delta);
        cell.borrow_mut().set(next);
    });
}

pub fn liabilities_sub(delta: &BaseUnits) {
    LIABILITIES.with(|cell| {
        let current = cell.borrow().get().clone();
        // Saturate instead of trapping: the watchdog reports any drift.
        let next = current.checked_sub(delta).unwrap_or_else(BaseUnits::zero);
        cell.borrow_mut().set(next);
    });
}

// =============================================================================
// INDEXER CHECKPOINT
// =============================================================================

pub fn checkpoint_get() -> u64 {
    CHECKPOINT.with(|cell| *cell.borrow().get())
}

pub fn checkpoint_set(block_height: u64) {
    CHECKPOINT.with(|cell| {
        cell.borrow_mut().set(block_height);
    });
}

// =============================================================================
// RECONCILIATION SUMS
// =============================================================================

/// Sum of `available` and `locked` across all snapshot accounts.
pub fn snapshot_totals() -> (BaseUnits, BaseUnits) {
    let mut available = BaseUnits::zero();
    let mut locked = BaseUnits::zero();
    for user in account_principals() {
        let account = get_account(&user);
        available = available.add(&account.available);
        locked = locked.add(&account.locked);
    }
    (available, locked)
}

/// Signed contribution of one journal entry to `available + locked`:
/// deposits and wins credit, withdrawals and losses debit, a win also
/// consumes its lock (`ref.bet_amount`), and a lock itself is a pure
/// available->locked move worth zero.
fn entry_delta(entry: &LedgerEntry) -> (BaseUnits, BaseUnits) {
    match entry.op {
        OpType::Deposit | OpType::Adjustment => (entry.amount.clone(), BaseUnits::zero()),
        OpType::BetWin => {
            let consumed = entry
                .entry_ref
                .bet_amount
                .clone()
                .unwrap_or_else(BaseUnits::zero);
            (entry.amount.clone(), consumed)
        }
        OpType::Withdraw | OpType::BetLose => (BaseUnits::zero(), entry.amount.clone()),
        OpType::BetLock => (BaseUnits::zero(), BaseUnits::zero()),
    }
}

/// Reconstruct total balances from the journal alone. `None` means the
/// journal itself is inconsistent (debits exceed credits): an invariant
/// violation, never expected.
pub fn journal_signed_total() -> Option<BaseUnits> {
    let mut credit = BaseUnits::zero();
    let mut debit = BaseUnits::zero();
    let last = journal_len();
    for id in 1..=last {
        if let Some(e) = entry(id) {
            let (c, d) = entry_delta(&e);
            credit = credit.add(&c);
            debit = debit.add(&d);
        }
    }
    credit.checked_sub(&debit)
}

/// Reconstruct one user's balance from the journal alone.
pub fn user_signed_total(user: &Principal) -> Option<BaseUnits> {
    let mut credit = BaseUnits::zero();
    let mut debit = BaseUnits::zero();
    let last = journal_len();
    for id in 1..=last {
        if let Some(e) = entry(id) {
            if e.user != *user {
                continue;
            }
            let (c, d) = entry_delta(&e);
            credit = credit.add(&c);
            debit = debit.add(&d);
        }
    }
    credit.checked_sub(&debit)
}
