use std::sync::{Condvar, Mutex};
use std::time::Instant;

use tracing::debug;
use uuid::Uuid;

use crate::error::{check_status, ErrorKind};
use crate::Result;

/// The kind of GATT operation occupying the slot. Completion callbacks are
/// matched against it so a stray callback can never complete the wrong
/// operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    WriteCharacteristic,
    ReadCharacteristic,
    WriteDescriptor,
}

#[derive(Debug)]
struct Pending {
    kind: OpKind,
    /// The characteristic the operation targets (descriptor writes target
    /// their parent characteristic; the CCCD UUID is shared by every
    /// characteristic and would not discriminate).
    target: Uuid,
    /// Completion flag. Cleared at admission, set by the matching callback.
    done: bool,
    status: u8,
    /// A detached operation returns to its caller at submission; the slot is
    /// freed by the completion callback (or teardown) instead of the guard.
    detached: bool,
}

#[derive(Debug)]
struct SlotState {
    pending: Option<Pending>,
    /// Bumped on every teardown. Waiters that entered under an older epoch
    /// wake with `Disconnected`.
    epoch: u64,
}

/// The single-slot operation serializer.
///
/// At most one GATT operation is outstanding against the platform at a time.
/// Callers park at [`acquire`][OpSlot::acquire] while the slot is occupied,
/// submit while holding the [`OpGuard`], then either wait for the matching
/// completion callback or detach. Every wait loops on its predicate under
/// the lock, so spurious wakeups fall through harmlessly.
pub(crate) struct OpSlot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

impl OpSlot {
    pub(crate) fn new() -> Self {
        OpSlot {
            state: Mutex::new(SlotState {
                pending: None,
                epoch: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Waits until the slot is free and occupies it.
    ///
    /// Fails with `Disconnected` if the session tears down while waiting and
    /// with `TimedOut` when `deadline` passes first.
    pub(crate) fn acquire(&self, kind: OpKind, target: Uuid, deadline: Option<Instant>) -> Result<OpGuard<'_>> {
        let mut state = self.state.lock().unwrap();
        let entry_epoch = state.epoch;
        loop {
            if state.epoch != entry_epoch {
                return Err(ErrorKind::Disconnected.into());
            }
            if state.pending.is_none() {
                break;
            }
            state = self.wait(state, deadline)?;
        }
        state.pending = Some(Pending {
            kind,
            target,
            done: false,
            status: 0,
            detached: false,
        });
        Ok(OpGuard {
            slot: self,
            entry_epoch,
            armed: true,
        })
    }

    /// Reports a completion callback for `(kind, target)`.
    ///
    /// Unmatched completions are logged and dropped; the platform may emit
    /// callbacks for operations this mediator never issued, or after a
    /// caller already gave up.
    pub(crate) fn complete(&self, kind: OpKind, target: Uuid, status: u8) {
        let mut state = self.state.lock().unwrap();
        match &mut state.pending {
            Some(pending) if pending.kind == kind && pending.target == target => {
                if pending.detached {
                    state.pending = None;
                } else {
                    pending.done = true;
                    pending.status = status;
                }
                self.cond.notify_all();
            }
            _ => debug!(?kind, %target, status, "unmatched completion callback"),
        }
    }

    /// Wakes every admission and completion waiter with `Disconnected` and
    /// frees the slot.
    pub(crate) fn teardown(&self) {
        let mut state = self.state.lock().unwrap();
        state.epoch = state.epoch.wrapping_add(1);
        state.pending = None;
        self.cond.notify_all();
    }

    fn wait<'a>(
        &self,
        state: std::sync::MutexGuard<'a, SlotState>,
        deadline: Option<Instant>,
    ) -> Result<std::sync::MutexGuard<'a, SlotState>> {
        match deadline {
            None => Ok(self.cond.wait(state).unwrap()),
            Some(deadline) => {
                let now = Instant::now();
                let remaining = deadline
                    .checked_duration_since(now)
                    .ok_or(ErrorKind::TimedOut)?;
                let (state, _) = self.cond.wait_timeout(state, remaining).unwrap();
                Ok(state)
            }
        }
    }
}

/// Occupation of the operation slot. Dropping the guard frees the slot, so
/// an error return path can never leave the serializer wedged.
pub(crate) struct OpGuard<'a> {
    slot: &'a OpSlot,
    entry_epoch: u64,
    armed: bool,
}

impl OpGuard<'_> {
    /// Parks until the completion callback sets the done flag, then returns
    /// the reported status byte.
    pub(crate) fn wait_done(&self, deadline: Option<Instant>) -> Result<u8> {
        let mut state = self.slot.state.lock().unwrap();
        loop {
            if state.epoch != self.entry_epoch {
                return Err(ErrorKind::Disconnected.into());
            }
            match &state.pending {
                Some(pending) if pending.done => return Ok(pending.status),
                Some(_) => {}
                None => return Err(ErrorKind::Internal.into()),
            }
            state = self.slot.wait(state, deadline)?;
        }
    }

    /// Parks until `matched` observes the expected platform state.
    ///
    /// Completion callbacks only signal that fresh state may be visible; a
    /// wake that finds `matched` still false keeps waiting. A completion
    /// carrying an error status is surfaced instead, since the expected
    /// state can then never arrive.
    pub(crate) fn wait_value(&self, deadline: Option<Instant>, matched: impl Fn() -> bool) -> Result<()> {
        let mut state = self.slot.state.lock().unwrap();
        loop {
            if state.epoch != self.entry_epoch {
                return Err(ErrorKind::Disconnected.into());
            }
            if matched() {
                return Ok(());
            }
            match &mut state.pending {
                Some(pending) if pending.done => {
                    check_status(pending.status)?;
                    pending.done = false;
                }
                Some(_) => {}
                None => return Err(ErrorKind::Internal.into()),
            }
            state = self.slot.wait(state, deadline)?;
        }
    }

    /// Releases the guard without freeing the slot; the matching completion
    /// callback (or teardown) frees it instead.
    pub(crate) fn detach(mut self) {
        let mut state = self.slot.state.lock().unwrap();
        if state.epoch == self.entry_epoch {
            if let Some(pending) = &mut state.pending {
                pending.detached = true;
            }
        }
        drop(state);
        self.armed = false;
    }
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.slot.state.lock().unwrap();
        // After a teardown the slot already belongs to a newer epoch; it is
        // not this guard's to free.
        if state.epoch == self.entry_epoch {
            state.pending = None;
            self.slot.cond.notify_all();
        }
    }
}
