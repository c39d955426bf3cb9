//! Shared/exclusive latch with explicit release.
//!
//! Unlike a guard-scoped `RwLock`, latch release here is driven by the
//! mini-transaction memo: latches are acquired at arbitrary points of an
//! operation and released together, in reverse order, at commit. The latch
//! therefore exposes plain lock/unlock calls and keeps its own counts.

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct LatchState {
    readers: u32,
    writer: bool,
}

/// A shared/exclusive latch (tree latch, page frame latch).
pub struct Latch {
    state: Mutex<LatchState>,
    cond: Condvar,
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch {
    /// Creates an unlocked latch.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LatchState::default()),
            cond: Condvar::new(),
        }
    }

    /// Acquires the latch in shared mode, blocking while a writer holds it.
    pub fn s_lock(&self) {
        let mut state = self.state.lock();
        while state.writer {
            self.cond.wait(&mut state);
        }
        state.readers += 1;
    }

    /// Acquires the latch in exclusive mode, blocking until all holders
    /// are gone. Not re-entrant: the mini-transaction memo is responsible
    /// for never re-latching a resource it already holds.
    pub fn x_lock(&self) {
        let mut state = self.state.lock();
        while state.writer || state.readers > 0 {
            self.cond.wait(&mut state);
        }
        state.writer = true;
    }

    /// Releases one shared hold.
    pub fn s_unlock(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.readers > 0, "s_unlock without s_lock");
        state.readers -= 1;
        if state.readers == 0 {
            drop(state);
            self.cond.notify_all();
        }
    }

    /// Releases the exclusive hold.
    pub fn x_unlock(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.writer, "x_unlock without x_lock");
        state.writer = false;
        drop(state);
        self.cond.notify_all();
    }

    /// Whether the latch is currently held in exclusive mode.
    pub fn is_x_locked(&self) -> bool {
        self.state.lock().writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn shared_holds_stack() {
        let latch = Latch::new();
        latch.s_lock();
        latch.s_lock();
        latch.s_unlock();
        latch.s_unlock();
        latch.x_lock();
        latch.x_unlock();
    }

    #[test]
    fn exclusive_blocks_until_readers_leave() {
        let latch = Arc::new(Latch::new());
        latch.s_lock();
        let acquired = Arc::new(AtomicBool::new(false));
        let (latch2, flag) = (Arc::clone(&latch), Arc::clone(&acquired));
        let handle = thread::spawn(move || {
            latch2.x_lock();
            flag.store(true, Ordering::SeqCst);
            latch2.x_unlock();
        });
        thread::sleep(Duration::from_millis(30));
        assert!(!acquired.load(Ordering::SeqCst));
        latch.s_unlock();
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }
}
