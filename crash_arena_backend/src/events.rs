//! Ordered event fan-out with bounded replay.
//!
//! Every published event gets a globally monotone 64-bit `event_id` (the
//! counter is in stable memory so ids never regress across upgrades). Each
//! topic group keeps a ring of the most recent events: `global` (round
//! phases, crashes), `room` (chat, aggregate bet traffic), and
//! `user:{principal}` (balances, own results). A session polls with the last id it has seen
//! and receives everything newer from its topics, ascending; if any of its
//! rings has already evicted past that point the poll fails with
//! `ResyncRequired` and the client takes a full snapshot instead.
//!
//! Rings are volatile by design: an upgrade empties them and re-bases the
//! eviction mark at the persisted counter, which forces exactly the clients
//! that missed events into a resync.

use crate::config;
use crate::memory_ids::NEXT_EVENT_ID_MEMORY_ID;
use crate::types::{BalanceSnapshot, GameError};
use crate::Memory;
use candid::{CandidType, Deserialize, Principal};
use ic_stable_structures::memory_manager::MemoryId;
use ic_stable_structures::StableCell;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

// =============================================================================
// EVENT TYPES
// =============================================================================

/// Tagged union of everything the service pushes to clients. Amounts are
/// decimal strings; multipliers are display floats.
#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    Authenticated {
        user_id: String,
        balance: String,
    },
    BalanceUpdate {
        available: String,
        locked: String,
        version: u64,
    },
    RoundOpened {
        round_id: u64,
        commit_hash: String,
        bet_deadline_ms: u64,
    },
    RoundStarted {
        round_id: u64,
        server_time_ms: u64,
    },
    MultiplierTick {
        m: f64,
    },
    BetAccepted {
        round_id: u64,
        user_id: String,
        amount: String,
        auto_cashout: Option<f64>,
    },
    PlayerCashedOut {
        user_id: String,
        m: f64,
        payout: String,
    },
    RoundCrashed {
        round_id: u64,
        crash_point: f64,
    },
    RoundRevealed {
        round_id: u64,
        server_seed: String,
        client_seed: String,
        nonce: u64,
    },
    Chat {
        user_id: String,
        message: String,
    },
    Paused {
        reason: String,
    },
    Resumed {},
    Error {
        code: String,
        message: String,
    },
}

#[derive(CandidType, Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Event {
    pub event_id: u64,
    pub payload: EventPayload,
}

impl Event {
    /// JSON frame for transports that relay events verbatim.
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Topic {
    Global,
    Room,
    User(Principal),
}

// =============================================================================
// RINGS
// =============================================================================

struct Ring {
    buf: VecDeque<Event>,
    /// Highest event id this ring has dropped. A subscriber whose
    /// `last_event_id` is below this mark has missed events.
    last_evicted: u64,
}

impl Ring {
    fn new(baseline: u64) -> Self {
        Self {
            buf: VecDeque::new(),
            last_evicted: baseline,
        }
    }

    fn push(&mut self, event: Event, capacity: usize) {
        while self.buf.len() >= capacity {
            if let Some(evicted) = self.buf.pop_front() {
                self.last_evicted = evicted.event_id;
            }
        }
        self.buf.push_back(event);
    }

    fn collect_after(&self, last_event_id: u64, out: &mut Vec<Event>) {
        for event in &self.buf {
            if event.event_id > last_event_id {
                out.push(event.clone());
            }
        }
    }
}

thread_local! {
    static NEXT_EVENT_ID: RefCell<StableCell<u64, Memory>> = RefCell::new(
        StableCell::init(
            crate::MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(NEXT_EVENT_ID_MEMORY_ID))),
            1u64
        )
    );

    static GLOBAL_RING: RefCell<Ring> = RefCell::new(Ring::new(0));
    static ROOM_RING: RefCell<Ring> = RefCell::new(Ring::new(0));
    static USER_RINGS: RefCell<HashMap<Principal, Ring>> = RefCell::new(HashMap::new());

    /// Latest event id at process start. Rings created after this point
    /// inherit it, so clients holding pre-upgrade ids resync instead of
    /// silently skipping lost events.
    static RING_BASELINE: RefCell<u64> = RefCell::new(0);
}

/// Re-base the (empty, volatile) rings at the persisted counter. Called from
/// init and post_upgrade before any publish.
pub fn reset_rings() {
    let baseline = latest_event_id();
    RING_BASELINE.with(|b| *b.borrow_mut() = baseline);
    GLOBAL_RING.with(|r| *r.borrow_mut() = Ring::new(baseline));
    ROOM_RING.with(|r| *r.borrow_mut() = Ring::new(baseline));
    USER_RINGS.with(|r| r.borrow_mut().clear());
}

pub fn latest_event_id() -> u64 {
    NEXT_EVENT_ID.with(|cell| *cell.borrow().get()) - 1
}

fn next_event_id() -> u64 {
    NEXT_EVENT_ID.with(|cell| {
        let id = *cell.borrow().get();
        cell.borrow_mut().set(id + 1);
        id
    })
}

// =============================================================================
// PUBLISH / POLL
// =============================================================================

pub fn publish(topic: Topic, payload: EventPayload) -> u64 {
    let event_id = next_event_id();
    let event = Event { event_id, payload };
    let capacity = config::get().ring_buffer_size as usize;
    match topic {
        Topic::Global => GLOBAL_RING.with(|r| r.borrow_mut().push(event, capacity)),
        Topic::Room => ROOM_RING.with(|r| r.borrow_mut().push(event, capacity)),
        Topic::User(user) => USER_RINGS.with(|rings| {
            let baseline = RING_BASELINE.with(|b| *b.borrow());
            rings
                .borrow_mut()
                .entry(user)
                .or_insert_with(|| Ring::new(baseline))
                .push(event, capacity);
        }),
    }
    event_id
}

/// Everything newer than `last_event_id` across the caller's three topics,
/// in event-id order. `ResyncRequired` if any ring has evicted past the
/// caller's position.
pub fn poll(user: Principal, last_event_id: u64) -> Result<Vec<Event>, GameError> {
    let baseline = RING_BASELINE.with(|b| *b.borrow());

    let global_evicted = GLOBAL_RING.with(|r| r.borrow().last_evicted);
    let room_evicted = ROOM_RING.with(|r| r.borrow().last_evicted);
    let user_evicted = USER_RINGS.with(|rings| {
        rings
            .borrow()
            .get(&user)
            .map(|r| r.last_evicted)
            .unwrap_or(baseline)
    });
    if last_event_id < global_evicted
        || last_event_id < room_evicted
        || last_event_id < user_evicted
    {
        return Err(GameError::ResyncRequired);
    }

    let mut out = Vec::new();
    GLOBAL_RING.with(|r| r.borrow().collect_after(last_event_id, &mut out));
    ROOM_RING.with(|r| r.borrow().collect_after(last_event_id, &mut out));
    USER_RINGS.with(|rings| {
        if let Some(ring) = rings.borrow().get(&user) {
            ring.collect_after(last_event_id, &mut out);
        }
    });
    out.sort_by_key(|e| e.event_id);
    Ok(out)
}

// =============================================================================
// HELPERS
// =============================================================================

pub fn publish_balance(user: Principal, snapshot: &BalanceSnapshot) -> u64 {
    publish(
        Topic::User(user),
        EventPayload::BalanceUpdate {
            available: snapshot.available.format_decimal(),
            locked: snapshot.locked.format_decimal(),
            version: snapshot.version,
        },
    )
}

/// User-visible failures go out as error events on the user topic; the
/// session stays open.
pub fn publish_error(user: Principal, error: &GameError) -> u64 {
    publish(
        Topic::User(user),
        EventPayload::Error {
            code: error.code().to_string(),
            message: error.to_string(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(n: u8) -> Principal {
        Principal::from_slice(&[n, 0xEE])
    }

    fn tick(m: f64) -> EventPayload {
        EventPayload::MultiplierTick { m }
    }

    #[test]
    fn poll_returns_events_in_order() {
        reset_rings();
        let u = user(1);
        publish(Topic::Global, tick(1.0));
        publish(Topic::User(u), tick(2.0));
        publish(Topic::Room, tick(3.0));
        publish(Topic::Global, tick(4.0));

        let events = poll(u, 0).unwrap();
        assert_eq!(events.len(), 4);
        let ids: Vec<u64> = events.iter().map(|e| e.event_id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn poll_resumes_from_last_seen() {
        reset_rings();
        let u = user(2);
        let first = publish(Topic::Global, tick(1.0));
        publish(Topic::Global, tick(2.0));
        publish(Topic::User(u), tick(3.0));

        let events = poll(u, first).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.event_id > first));
    }

    #[test]
    fn other_users_events_are_invisible() {
        reset_rings();
        let a = user(3);
        let b = user(4);
        publish(Topic::User(a), tick(1.0));
        publish(Topic::User(b), tick(2.0));

        let events = poll(a, 0).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn eviction_forces_resync() {
        reset_rings();
        let u = user(5);
        let capacity = config::get().ring_buffer_size as u64;
        // Overfill the global ring so the earliest events get dropped.
        for i in 0..capacity + 10 {
            publish(Topic::Global, tick(i as f64));
        }
        assert_eq!(poll(u, 0), Err(GameError::ResyncRequired));

        // A caught-up client is unaffected.
        let latest = latest_event_id();
        assert!(poll(u, latest).unwrap().is_empty());
    }

    #[test]
    fn reset_rebases_eviction_mark() {
        reset_rings();
        let u = user(6);
        publish(Topic::Global, tick(1.0));
        let latest = latest_event_id();
        // Simulates an upgrade: rings drop, counter persists.
        reset_rings();
        assert_eq!(poll(u, latest.saturating_sub(1)), Err(GameError::ResyncRequired));
        assert!(poll(u, latest).unwrap().is_empty());
    }

    #[test]
    fn frames_are_tagged_json() {
        let event = Event {
            event_id: 7,
            payload: EventPayload::RoundCrashed {
                round_id: 3,
                crash_point: 2.0,
            },
        };
        let frame = event.to_frame();
        assert!(frame.contains("\"kind\":\"round_crashed\""));
        assert!(frame.contains("\"event_id\":7"));
    }
}
