//! Commit–reveal fairness and the crash-point derivation.
//!
//! **The scheme:**
//! - `server_seed` is 32 bytes derived from the IC VRF, committed as
//!   `SHA256(server_seed)` before betting opens.
//! - The client seed is a globally rotated string, captured into the round
//!   record at open so every round is verifiable against the exact seed used.
//! - `h = SHA256(hex(server_seed) ":" client_seed ":" nonce)` where `nonce`
//!   is the decimal round number.
//! - `H` = first 52 bits of `h`. If `H mod instant_crash_divisor == 0` the
//!   round crashes instantly at 1.00x. Otherwise, with house edge `e` in
//!   basis points:
//!
//!   `crash_x100 = clamp(100, floor(100 * (10000 - e) * 2^52 / (10000 * H)), max)`
//!
//!   which is the integer form of `floor(100 * (1 - e) / r) / 100` for
//!   `r = H / 2^52`.
//!
//! All arithmetic is u128; the formula is published by `formula_text` and
//! re-verifiable from revealed seeds.

use crate::memory_ids::CLIENT_SEED_MEMORY_ID;
use crate::types::{GameError, Round, MULTIPLIER_SCALE};
use crate::Memory;
use ic_cdk::management_canister::raw_rand;
use ic_stable_structures::memory_manager::MemoryId;
use ic_stable_structures::StableCell;
use sha2::{Digest, Sha256};
use std::cell::RefCell;

const CRASH_BITS: u32 = 52;

thread_local! {
    static CLIENT_SEED_CELL: RefCell<StableCell<String, Memory>> = RefCell::new(
        StableCell::init(
            crate::MEMORY_MANAGER.with(|m| m.borrow().get(MemoryId::new(CLIENT_SEED_MEMORY_ID))),
            "genesis".to_string()
        )
    );
}

// =============================================================================
// SEEDS
// =============================================================================

/// Current global client seed. Captured into each round at open.
pub fn client_seed() -> String {
    CLIENT_SEED_CELL.with(|cell| cell.borrow().get().clone())
}

pub fn rotate_client_seed(seed: String) -> Result<(), GameError> {
    if seed.is_empty() || seed.len() > 128 || !seed.is_ascii() {
        return Err(GameError::InvalidRequest {
            reason: "client seed must be 1-128 ascii chars".to_string(),
        });
    }
    CLIENT_SEED_CELL.with(|cell| {
        cell.borrow_mut().set(seed);
    });
    Ok(())
}

/// Guard against catastrophic VRF failure modes.
fn validate_randomness(bytes: &[u8]) -> Result<(), String> {
    if bytes.len() < 32 {
        return Err("Insufficient randomness bytes".to_string());
    }
    let first_8 = &bytes[0..8];
    if first_8.iter().all(|&b| b == 0) {
        return Err("Degenerate randomness detected: all zeros".to_string());
    }
    if first_8.iter().all(|&b| b == 0xFF) {
        return Err("Degenerate randomness detected: all ones".to_string());
    }
    Ok(())
}

/// 32 bytes of server seed from the IC VRF. No fallback: a round is not
/// opened without fresh verifiable randomness.
pub async fn generate_server_seed() -> Result<[u8; 32], String> {
    let random_bytes = raw_rand()
        .await
        .map_err(|e| format!("Randomness unavailable: {:?}", e))?;
    validate_randomness(&random_bytes)?;

    let mut hasher = Sha256::new();
    hasher.update(&random_bytes);
    let seed: [u8; 32] = hasher.finalize()[0..32].try_into().unwrap();
    Ok(seed)
}

pub fn commit_hash_hex(server_seed: &[u8; 32]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(server_seed);
    hex::encode(hasher.finalize())
}

// =============================================================================
// CRASH DERIVATION
// =============================================================================

/// The 52-bit integer `H` for a round.
pub fn crash_bits(server_seed: &[u8; 32], client_seed: &str, nonce: u64) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(hex::encode(server_seed).as_bytes());
    hasher.update(b":");
    hasher.update(client_seed.as_bytes());
    hasher.update(b":");
    hasher.update(nonce.to_string().as_bytes());
    let h = hasher.finalize();

    let mut be = [0u8; 8];
    be[1..8].copy_from_slice(&h[0..7]);
    u64::from_be_bytes(be) >> 4
}

/// Map `H` to a crash multiplier in hundredths.
pub fn crash_point_x100(bits: u64, edge_bps: u16, divisor: u64, max_x100: u64) -> u64 {
    if divisor >= 2 && bits % divisor == 0 {
        return MULTIPLIER_SCALE; // instant crash
    }
    let numerator = (10_000u128 - edge_bps as u128) * MULTIPLIER_SCALE as u128 * (1u128 << CRASH_BITS);
    let denominator = 10_000u128 * bits.max(1) as u128;
    let crash = (numerator / denominator) as u64;
    crash.clamp(MULTIPLIER_SCALE, max_x100)
}

pub fn derive_crash_x100(
    server_seed: &[u8; 32],
    client_seed: &str,
    nonce: u64,
    edge_bps: u16,
    divisor: u64,
    max_x100: u64,
) -> u64 {
    crash_point_x100(crash_bits(server_seed, client_seed, nonce), edge_bps, divisor, max_x100)
}

/// Recompute a revealed round and compare against its published crash point.
pub fn verify_round(round: &Round) -> Result<u64, GameError> {
    let (seed, published) = match (round.server_seed, round.crash_x100) {
        (Some(seed), Some(crash)) => (seed, crash),
        _ => {
            return Err(GameError::InvalidRequest {
                reason: "round is not revealed yet".to_string(),
            })
        }
    };
    if commit_hash_hex(&seed) != round.commit_hash {
        return Err(GameError::FairnessViolation { round_id: round.round_id });
    }
    let recomputed = derive_crash_x100(
        &seed,
        &round.client_seed,
        round.nonce,
        round.house_edge_bps,
        round.instant_crash_divisor,
        round.max_multiplier_x100,
    );
    if recomputed != published {
        return Err(GameError::FairnessViolation { round_id: round.round_id });
    }
    Ok(published)
}

pub fn formula_text() -> String {
    "H = first 52 bits of SHA256(hex(server_seed) ':' client_seed ':' nonce); \
     instant crash (1.00x) when H mod instant_crash_divisor == 0; otherwise \
     crash = clamp(1.00, floor(100 * (1 - house_edge) * 2^52 / H) / 100, max_multiplier). \
     Commitment: SHA256(server_seed) published before betting opens."
        .to_string()
}

// =============================================================================
// MULTIPLIER CURVE
// =============================================================================
// The curve m(t) = a * b^t drives display and timing only. Settlement relies
// on crash_x100 and started_at; the payout ratio is the integer x100 value.

/// Display multiplier after `elapsed_ns` of running time, in hundredths.
pub fn multiplier_x100_at(a: f64, b: f64, elapsed_ns: u64) -> u64 {
    let t = elapsed_ns as f64 / 1e9;
    let m = a * b.powf(t);
    let x100 = (m * MULTIPLIER_SCALE as f64).round();
    if !x100.is_finite() || x100 < MULTIPLIER_SCALE as f64 {
        return MULTIPLIER_SCALE;
    }
    x100 as u64
}

/// Nanoseconds from `started_at` until the curve reaches the crash point.
/// Zero for crash points at or below the curve's starting value: the round
/// has no valid cashout window at all.
pub fn crash_delay_ns(a: f64, b: f64, crash_x100: u64) -> u64 {
    let crash = crash_x100 as f64 / MULTIPLIER_SCALE as f64;
    if crash <= a {
        return 0;
    }
    let secs = (crash / a).ln() / b.ln();
    if !secs.is_finite() || secs <= 0.0 {
        return 0;
    }
    (secs * 1e9) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    const EDGE: u16 = 300;
    const DIVISOR: u64 = 33;
    const MAX: u64 = 100_000;

    #[test]
    fn crash_point_exact_values() {
        // H = 2^50 => r = 0.25 => 100 * 0.97 / 0.25 = 388
        assert_eq!(crash_point_x100(1 << 50, EDGE, DIVISOR, MAX), 388);
        // H = 2^51 => r = 0.5 => 194
        assert_eq!(crash_point_x100(1 << 51, EDGE, DIVISOR, MAX), 194);
        // H near 2^52 => r near 1 => floor lands below 1.00x, clamped up
        assert_eq!(crash_point_x100((1 << 52) - 1, EDGE, DIVISOR, MAX), 100);
        // Tiny H => capped at the configured maximum
        assert_eq!(crash_point_x100(1, EDGE, DIVISOR, MAX), MAX);
    }

    #[test]
    fn instant_crash_set_membership() {
        assert_eq!(crash_point_x100(33, EDGE, DIVISOR, MAX), 100);
        assert_eq!(crash_point_x100(66, EDGE, DIVISOR, MAX), 100);
        assert_eq!(crash_point_x100(0, EDGE, DIVISOR, MAX), 100);
        // 34 is not in the instant set and is tiny, so it caps out instead
        assert_eq!(crash_point_x100(34, EDGE, DIVISOR, MAX), MAX);
    }

    #[test]
    fn zero_edge_keeps_fair_inverse() {
        // With no edge, H = 2^51 gives exactly 2.00x
        assert_eq!(crash_point_x100(1 << 51, 0, DIVISOR, MAX), 200);
    }

    #[test]
    fn derivation_is_deterministic() {
        let seed = [7u8; 32];
        let a = derive_crash_x100(&seed, "client", 42, EDGE, DIVISOR, MAX);
        let b = derive_crash_x100(&seed, "client", 42, EDGE, DIVISOR, MAX);
        assert_eq!(a, b);
        // Different nonce, almost surely different bits
        let c = crash_bits(&seed, "client", 43);
        assert_ne!(crash_bits(&seed, "client", 42), c);
    }

    #[test]
    fn bits_fit_in_52() {
        let seed = [0xA5u8; 32];
        for nonce in 0..64u64 {
            assert!(crash_bits(&seed, "s", nonce) < (1 << 52));
        }
    }

    #[test]
    fn commit_hash_is_hex_sha256() {
        let seed = [1u8; 32];
        let commit = commit_hash_hex(&seed);
        assert_eq!(commit.len(), 64);
        assert!(commit.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn verify_round_detects_tampering() {
        let seed = [9u8; 32];
        let crash = derive_crash_x100(&seed, "cs", 5, EDGE, DIVISOR, MAX);
        let mut round = Round {
            round_id: 5,
            commit_hash: commit_hash_hex(&seed),
            server_seed: Some(seed),
            client_seed: "cs".to_string(),
            nonce: 5,
            crash_x100: Some(crash),
            house_edge_bps: EDGE,
            instant_crash_divisor: DIVISOR,
            max_multiplier_x100: MAX,
            opened_at: 0,
            started_at: Some(1),
            crashed_at: Some(2),
            phase: crate::types::RoundPhase::Revealed,
        };
        assert_eq!(verify_round(&round).unwrap(), crash);

        round.crash_x100 = Some(crash + 1);
        assert_eq!(
            verify_round(&round),
            Err(GameError::FairnessViolation { round_id: 5 })
        );
    }

    #[test]
    fn curve_starts_at_one() {
        assert_eq!(multiplier_x100_at(1.0024, 1.0718, 0), 100);
    }

    #[test]
    fn curve_reaches_crash_at_delay() {
        let (a, b) = (1.0024, 1.0718);
        let delay = crash_delay_ns(a, b, 200);
        // ln(2/1.0024)/ln(1.0718) is just under 10 seconds
        assert!(delay > 9_000_000_000 && delay < 11_000_000_000, "delay {}", delay);
        let m = multiplier_x100_at(a, b, delay);
        assert!((199..=201).contains(&m), "m {}", m);
    }

    #[test]
    fn instant_crash_has_no_window() {
        assert_eq!(crash_delay_ns(1.0024, 1.0718, 100), 0);
    }

    #[test]
    fn curve_is_monotone() {
        let mut last = 0;
        for secs in 0..30 {
            let m = multiplier_x100_at(1.0024, 1.0718, secs * 1_000_000_000);
            assert!(m >= last);
            last = m;
        }
    }
}
