//! Cross-context operation rendezvous.
//!
//! The replay worker provides the illusion of synchronous execution for
//! operations that must run on the emulator's primary context: it publishes
//! one [`Operation`] into a single shared slot and blocks until the primary
//! context has performed it and deposited a result. The primary context is a
//! cooperative scheduler that cannot await the worker, so this is a bounded
//! mailbox of capacity 1 with strict request/response turn-taking.
//!
//! Cancellation releases a blocked worker without the primary context's
//! cooperation, so the worker thread stays joinable during teardown even if
//! the primary context has already moved on.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    UpdateStall,
    EnqueueList,
    ListSync,
    ReapplyGfxState,
    /// Worker finished (or aborted); the primary context should drain and
    /// join it.
    Done,
}

/// One marshalled operation. `list_id` doubles as the list address for
/// `EnqueueList`; `param` is generally the stall address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Operation {
    pub kind: OpKind,
    pub list_id: u32,
    pub param: u32,
}

#[derive(Default)]
struct SlotState {
    pending: Option<Operation>,
    ret: u32,
    done: bool,
    cancelled: bool,
}

/// The single-slot rendezvous shared by the worker and the primary context.
///
/// Invariant: at most one operation is outstanding; the worker must not
/// publish again until the previous operation was completed.
pub struct OpSlot {
    state: Mutex<SlotState>,
    start: Condvar,
    finish: Condvar,
}

impl OpSlot {
    pub fn new() -> OpSlot {
        OpSlot {
            state: Mutex::new(SlotState {
                done: true,
                ..SlotState::default()
            }),
            start: Condvar::new(),
            finish: Condvar::new(),
        }
    }

    /// Worker side: publishes `op` and blocks until the primary context
    /// completes it. Returns the deposited result, or 0 if the session was
    /// cancelled while waiting.
    pub fn execute_on_main(&self, op: Operation) -> u32 {
        let mut state = self.state.lock().unwrap();
        if state.cancelled {
            return 0;
        }
        debug_assert!(state.pending.is_none(), "operation already in flight");
        state.pending = Some(op);
        state.ret = 0;
        state.done = false;
        self.start.notify_one();

        while !state.done && !state.cancelled {
            state = self.finish.wait(state).unwrap();
        }
        state.ret
    }

    /// Primary side: blocks until an operation is pending. Returns `None` on
    /// cancellation.
    pub fn wait_for_op(&self) -> Option<Operation> {
        let mut state = self.state.lock().unwrap();
        while state.pending.is_none() && !state.cancelled {
            state = self.start.wait(state).unwrap();
        }
        state.pending
    }

    /// Primary side: deposits the result for the pending operation and wakes
    /// the worker. Consumes the slot.
    pub fn complete(&self, ret: u32) {
        let mut state = self.state.lock().unwrap();
        state.pending = None;
        state.ret = ret;
        state.done = true;
        self.finish.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().unwrap().cancelled
    }

    /// Force-releases both sides. The pending operation, if any, is
    /// abandoned unperformed.
    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        state.cancelled = true;
        self.start.notify_all();
        self.finish.notify_all();
    }

    /// Rearms the slot for a fresh session.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        *state = SlotState {
            done: true,
            ..SlotState::default()
        };
    }

    /// Test hook: waits briefly for the worker to publish, without blocking
    /// forever on a misbehaving peer.
    #[doc(hidden)]
    pub fn wait_for_op_timeout(&self, timeout: Duration) -> Option<Operation> {
        let state = self.state.lock().unwrap();
        let (state, _) = self
            .start
            .wait_timeout_while(state, timeout, |s| s.pending.is_none() && !s.cancelled)
            .unwrap();
        state.pending
    }
}

impl Default for OpSlot {
    fn default() -> Self {
        OpSlot::new()
    }
}
