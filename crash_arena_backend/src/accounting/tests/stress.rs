//! Seeded random-sequence stress runs over the differential harness.

use super::model::{Harness, Op};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn random_op(rng: &mut ChaCha8Rng) -> Op {
    let slot = rng.gen_range(0..4u8);
    match rng.gen_range(0..8u8) {
        0 | 1 => Op::Deposit {
            slot,
            amount: rng.gen_range(1..1_000_000u64),
        },
        2 => Op::ReplayDeposit { slot },
        3 | 4 => Op::PlaceBet {
            slot,
            amount: rng.gen_range(1..500_000u64),
        },
        5 => Op::ReplayBet { slot },
        6 => {
            if rng.gen_bool(0.5) {
                Op::Win {
                    slot,
                    mult_x100: rng.gen_range(100..5_000u64),
                }
            } else {
                Op::Lose { slot }
            }
        }
        _ => Op::Withdraw {
            slot,
            amount: rng.gen_range(1..200_000u64),
        },
    }
}

#[test]
fn random_operation_sequences_hold_invariants() {
    let mut rng = ChaCha8Rng::seed_from_u64(0xC4A5);
    let mut harness = Harness::new();
    for _ in 0..1_000 {
        harness.apply(random_op(&mut rng));
    }
    harness.check_all();
}

#[test]
fn heavy_replay_pressure() {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let mut harness = Harness::new();
    for i in 0..400 {
        let slot = (i % 3) as u8;
        match i % 5 {
            0 => harness.apply(Op::Deposit {
                slot,
                amount: rng.gen_range(100..10_000u64),
            }),
            1 => harness.apply(Op::PlaceBet {
                slot,
                amount: rng.gen_range(1..5_000u64),
            }),
            2 => harness.apply(Op::ReplayBet { slot }),
            3 => harness.apply(Op::ReplayDeposit { slot }),
            _ => harness.apply(Op::Win {
                slot,
                mult_x100: rng.gen_range(100..300u64),
            }),
        }
    }
    harness.check_all();
}

#[test]
fn full_cycles_settle_clean() {
    let mut harness = Harness::new();
    for round in 0..50u64 {
        let slot = (round % 2) as u8;
        harness.apply(Op::Deposit { slot, amount: 10_000 });
        harness.apply(Op::PlaceBet { slot, amount: 4_000 });
        if round % 3 == 0 {
            harness.apply(Op::Win { slot, mult_x100: 250 });
        } else {
            harness.apply(Op::Lose { slot });
        }
        harness.apply(Op::Withdraw { slot, amount: 1_000 });
    }
    harness.check_all();
}
