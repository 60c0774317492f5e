//! Client sessions and wallet links.
//!
//! The IC identity layer authenticates callers; a session is the transport
//! subscription on top of it (global + room + own user topic). Sessions are
//! volatile: a reconnecting client re-opens and resumes from its last event
//! id. Wallet links are persistent: they attribute on-chain deposits to a
//! principal, so a wallet can belong to at most one principal at a time.

use crate::events::{self, EventPayload, Topic};
use crate::memory_ids::{PRINCIPAL_WALLETS_MEMORY_ID, WALLET_INDEX_MEMORY_ID};
use crate::types::{is_valid_wallet, GameError, CHAT_MAX_LEN};
use crate::Memory;
use candid::Principal;
use ic_stable_structures::memory_manager::MemoryId;
use ic_stable_structures::StableBTreeMap;
use std::cell::RefCell;
use std::collections::HashMap;

/// Sessions that miss every heartbeat for this long are swept.
pub const SESSION_TIMEOUT_NS: u64 = 30_000_000_000;

#[derive(Clone, Debug)]
struct Session {
    opened_at: u64,
    last_seen: u64,
}

thread_local! {
    static SESSIONS: RefCell<HashMap<Principal, Session>> = RefCell::new(HashMap::new());

    static WALLET_INDEX: RefCell<StableBTreeMap<String, Principal, Memory>> = RefCell::new(
        StableBTreeMap::init(
            crate::MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(WALLET_INDEX_MEMORY_ID))),
        )
    );

    static PRINCIPAL_WALLETS: RefCell<StableBTreeMap<Principal, String, Memory>> = RefCell::new(
        StableBTreeMap::init(
            crate::MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(PRINCIPAL_WALLETS_MEMORY_ID))),
        )
    );
}

// =============================================================================
// WALLET LINKS
// =============================================================================

/// Link a deposit address to the caller. Unambiguous attribution: a wallet
/// maps to at most one principal; re-registering replaces the caller's old
/// link.
pub fn register_wallet(caller: Principal, wallet: &str, _now: u64) -> Result<(), GameError> {
    if caller == Principal::anonymous() {
        return Err(GameError::Unauthenticated);
    }
    if !is_valid_wallet(wallet) {
        return Err(GameError::InvalidRequest {
            reason: "wallet must be 0x + 40 hex chars".to_string(),
        });
    }
    let wallet = wallet.to_ascii_lowercase();

    let taken_by = WALLET_INDEX.with(|w| w.borrow().get(&wallet));
    if let Some(owner) = taken_by {
        if owner != caller {
            return Err(GameError::InvalidRequest {
                reason: "wallet is already linked to another account".to_string(),
            });
        }
        return Ok(());
    }

    if let Some(old) = PRINCIPAL_WALLETS.with(|p| p.borrow().get(&caller)) {
        WALLET_INDEX.with(|w| {
            w.borrow_mut().remove(&old);
        });
    }
    WALLET_INDEX.with(|w| {
        w.borrow_mut().insert(wallet.clone(), caller);
    });
    PRINCIPAL_WALLETS.with(|p| {
        p.borrow_mut().insert(caller, wallet);
    });
    Ok(())
}

/// Who a deposit from this address belongs to, if anyone.
pub fn wallet_owner(address: &str) -> Option<Principal> {
    let address = address.to_ascii_lowercase();
    WALLET_INDEX.with(|w| w.borrow().get(&address))
}

pub fn wallet_of(user: &Principal) -> Option<String> {
    PRINCIPAL_WALLETS.with(|p| p.borrow().get(user))
}

// =============================================================================
// SESSIONS
// =============================================================================

pub fn open(caller: Principal, now: u64) -> Result<(), GameError> {
    if caller == Principal::anonymous() {
        return Err(GameError::Unauthenticated);
    }
    SESSIONS.with(|s| {
        s.borrow_mut().insert(
            caller,
            Session {
                opened_at: now,
                last_seen: now,
            },
        );
    });
    Ok(())
}

pub fn require(caller: &Principal) -> Result<(), GameError> {
    let active = SESSIONS.with(|s| s.borrow().contains_key(caller));
    if active {
        Ok(())
    } else {
        Err(GameError::Unauthenticated)
    }
}

/// Heartbeat. Missing sessions must re-open rather than silently revive.
pub fn touch(caller: &Principal, now: u64) -> Result<(), GameError> {
    SESSIONS.with(|s| match s.borrow_mut().get_mut(caller) {
        Some(session) => {
            session.last_seen = now;
            Ok(())
        }
        None => Err(GameError::Unauthenticated),
    })
}

/// Drop sessions that stopped responding to heartbeats. In-flight bets are
/// untouched: they live in the bet book, not the session.
pub fn sweep(now: u64) -> usize {
    SESSIONS.with(|s| {
        let mut sessions = s.borrow_mut();
        let before = sessions.len();
        sessions.retain(|_, session| now.saturating_sub(session.last_seen) <= SESSION_TIMEOUT_NS);
        before - sessions.len()
    })
}

pub fn active_count() -> usize {
    SESSIONS.with(|s| s.borrow().len())
}

pub fn opened_at(caller: &Principal) -> Option<u64> {
    SESSIONS.with(|s| s.borrow().get(caller).map(|session| session.opened_at))
}

// =============================================================================
// CHAT
// =============================================================================

pub fn chat(caller: Principal, message: &str, _now: u64) -> Result<u64, GameError> {
    require(&caller)?;
    if message.is_empty() || message.chars().count() > CHAT_MAX_LEN {
        return Err(GameError::InvalidRequest {
            reason: format!("chat message must be 1-{} chars", CHAT_MAX_LEN),
        });
    }
    Ok(events::publish(
        Topic::Room,
        EventPayload::Chat {
            user_id: caller.to_text(),
            message: message.to_string(),
        },
    ))
}
