//! Gate that lets a caller stop new work and wait for running work to drain.

use std::collections::HashSet;

use parking_lot::{Condvar, Mutex};

/// Handle returned by a freeze, used to release it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FreezeId(u64);

struct FreezerState {
    next_id: u64,
    freezes: HashSet<FreezeId>,
    /// Entered and not yet left.
    running: usize,
}

pub(crate) struct OperationsFreezer {
    state: Mutex<FreezerState>,
    cond: Condvar,
}

impl OperationsFreezer {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(FreezerState {
                next_id: 1,
                freezes: HashSet::new(),
                running: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Enter, waiting while any freeze is in place.
    pub(crate) fn start_operation(&self) {
        let mut state = self.state.lock();
        while !state.freezes.is_empty() {
            self.cond.wait(&mut state);
        }
        state.running += 1;
    }

    pub(crate) fn end_operation(&self) {
        let mut state = self.state.lock();
        state.running -= 1;
        self.cond.notify_all();
    }

    /// Block new entries and wait until everything entered has left.
    pub(crate) fn freeze(&self) -> FreezeId {
        let mut state = self.state.lock();
        let id = FreezeId(state.next_id);
        state.next_id += 1;
        state.freezes.insert(id);
        while state.running > 0 {
            self.cond.wait(&mut state);
        }
        id
    }

    /// Lift one freeze. Returns false if `id` was not in place.
    pub(crate) fn release(&self, id: FreezeId) -> bool {
        let mut state = self.state.lock();
        let removed = state.freezes.remove(&id);
        self.cond.notify_all();
        removed
    }

    pub(crate) fn is_frozen(&self) -> bool {
        !self.state.lock().freezes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_freeze_waits_for_running_and_blocks_new() {
        let freezer = Arc::new(OperationsFreezer::new());
        freezer.start_operation();

        let frozen = {
            let freezer = Arc::clone(&freezer);
            thread::spawn(move || freezer.freeze())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!frozen.is_finished());
        assert!(freezer.is_frozen());

        freezer.end_operation();
        let id = frozen.join().unwrap();

        let entered = {
            let freezer = Arc::clone(&freezer);
            thread::spawn(move || freezer.start_operation())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!entered.is_finished());

        assert!(freezer.release(id));
        assert!(!freezer.release(id));
        entered.join().unwrap();
        assert!(!freezer.is_frozen());
    }
}
