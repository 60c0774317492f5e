use candid::Principal;
use std::cell::RefCell;
use std::collections::BTreeSet;

thread_local! {
    static PENDING_CALLERS: RefCell<BTreeSet<Principal>> = RefCell::new(BTreeSet::new());
    static RUNNING_LOOPS: RefCell<BTreeSet<u8>> = RefCell::new(BTreeSet::new());
}

/// Per-caller re-entrancy guard for the async endpoint paths. The balance
/// engine itself is synchronous, but an endpoint that awaits (seed fetch,
/// gateway call) before touching money must not be entered twice by the
/// same caller. RAII: cleanup happens on drop even if the handler errors.
pub struct OperationGuard {
    caller: Principal,
}

impl OperationGuard {
    pub fn new(caller: Principal) -> Result<Self, String> {
        PENDING_CALLERS.with(|ops| {
            let mut ops = ops.borrow_mut();
            if ops.contains(&caller) {
                return Err("Operation already in progress for this caller".to_string());
            }
            ops.insert(caller);
            Ok(Self { caller })
        })
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        PENDING_CALLERS.with(|ops| {
            ops.borrow_mut().remove(&self.caller);
        });
    }
}

/// Which background loop a `LoopGuard` covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoopKind {
    IndexerPoll = 1,
    SolvencyCheck = 2,
}

/// Single-flight guard for the self-rescheduling background loops: a poll
/// pass that is still awaiting the gateway must not overlap with the next
/// scheduled pass.
pub struct LoopGuard {
    kind: u8,
}

impl LoopGuard {
    pub fn acquire(kind: LoopKind) -> Option<Self> {
        RUNNING_LOOPS.with(|loops| {
            let mut loops = loops.borrow_mut();
            if loops.contains(&(kind as u8)) {
                None
            } else {
                loops.insert(kind as u8);
                Some(Self { kind: kind as u8 })
            }
        })
    }
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        RUNNING_LOOPS.with(|loops| {
            loops.borrow_mut().remove(&self.kind);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_guard_blocks_reentry() {
        let caller = Principal::from_slice(&[1; 4]);
        let guard = OperationGuard::new(caller);
        assert!(guard.is_ok());

        let second = OperationGuard::new(caller);
        assert!(second.is_err());

        // A different caller is unaffected.
        let other = OperationGuard::new(Principal::from_slice(&[2; 4]));
        assert!(other.is_ok());
    }

    #[test]
    fn caller_guard_releases_on_drop() {
        let caller = Principal::from_slice(&[3; 4]);
        {
            let _guard = OperationGuard::new(caller).unwrap();
        }
        assert!(OperationGuard::new(caller).is_ok());
    }

    #[test]
    fn loop_guard_is_single_flight() {
        let first = LoopGuard::acquire(LoopKind::IndexerPoll);
        assert!(first.is_some());
        assert!(LoopGuard::acquire(LoopKind::IndexerPoll).is_none());
        // Other loops are independent.
        assert!(LoopGuard::acquire(LoopKind::SolvencyCheck).is_some());
        drop(first);
        assert!(LoopGuard::acquire(LoopKind::IndexerPoll).is_some());
    }
}
