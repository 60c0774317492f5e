// =============================================================================
// ACCOUNTING MODULE
// =============================================================================
// The money core: an append-only journal with idempotency indexes, snapshot
// accounts with optimistic-concurrency versions, and the balance engine that
// is the only writer of either. Everything here is synchronous; atomicity
// follows from the canister execution model (no await inside a mutating
// section).
//
// INVARIANTS MAINTAINED HERE:
// - available + locked always equals the signed sum of the user's journal
//   entries (see store::journal_signed_total for the signed semantics).
// - No (user, op, client_id) triple and no (tx_hash, log_index) pair is
//   admitted to the journal twice.
// - Every journal insert bumps the account version by exactly one.
// - Journal entries are never mutated after insert.

pub mod engine;
pub mod guard;
pub mod store;

#[cfg(test)]
mod tests;

pub use engine::{
    place_bet, process_loss, process_win, process_withdrawal, record_deposit, set_frozen,
};
pub use guard::{LoopGuard, LoopKind, OperationGuard};
