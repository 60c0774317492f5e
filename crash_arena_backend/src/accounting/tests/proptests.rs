//! Property tests over generated operation sequences.
//!
//! The harness asserts after every operation that the snapshot accounts,
//! the mirror model, and the journal reconstruction all agree, and that
//! replays (same client id or same tx/log pair) never change state.

use super::model::{Harness, Op};
use proptest::prelude::*;

fn op_strategy() -> impl Strategy<Value = Op> {
    let slot = 0..3u8;
    prop_oneof![
        (slot.clone(), 1..100_000u64).prop_map(|(slot, amount)| Op::Deposit { slot, amount }),
        slot.clone().prop_map(|slot| Op::ReplayDeposit { slot }),
        (slot.clone(), 1..50_000u64).prop_map(|(slot, amount)| Op::PlaceBet { slot, amount }),
        slot.clone().prop_map(|slot| Op::ReplayBet { slot }),
        (slot.clone(), 100..2_000u64).prop_map(|(slot, mult_x100)| Op::Win { slot, mult_x100 }),
        slot.clone().prop_map(|slot| Op::Lose { slot }),
        (slot, 1..20_000u64).prop_map(|(slot, amount)| Op::Withdraw { slot, amount }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn any_sequence_reconciles(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let mut harness = Harness::new();
        for op in ops {
            harness.apply(op);
        }
        harness.check_all();
    }
}
