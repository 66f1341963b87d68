//! An in-process stand-in for the interpreter host, for tests.
//!
//! Interpreter identity is a thread-local: a test enters an interpreter
//! with [`with_interp`], and `call_in` swaps the thread-local for the
//! duration of the callback, which is exactly the "temporarily switch the
//! active interpreter" contract. Interpreter 0 plays the main interpreter
//! and is always alive.

use std::cell::Cell;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::error::{Error, Result};
use crate::interp::{self, Host, InterpId};
use crate::util::plock;

pub(crate) const MAIN_INTERP: InterpId = 0;

pub(crate) struct FakeHost {
    alive: Mutex<HashSet<InterpId>>,
}

thread_local! {
    static CURRENT: Cell<InterpId> = Cell::new(MAIN_INTERP);
    static INTERRUPTED: Cell<bool> = Cell::new(false);
}

impl Host for FakeHost {
    fn current_interp(&self) -> InterpId {
        CURRENT.with(|c| c.get())
    }

    fn is_running(&self, interpid: InterpId) -> bool {
        interpid == MAIN_INTERP || plock(&self.alive).contains(&interpid)
    }

    fn call_in(&self, interpid: InterpId, f: Box<dyn FnOnce() + Send>) -> Result<()> {
        if !self.is_running(interpid) {
            return Err(Error::InterpreterNotRunning(interpid));
        }
        let prev = CURRENT.with(|c| c.replace(interpid));
        f();
        CURRENT.with(|c| c.set(prev));
        Ok(())
    }

    fn interrupted(&self) -> bool {
        INTERRUPTED.with(|c| c.get())
    }
}

/// Flag (or clear) a pending interruption for the calling thread.
pub(crate) fn set_interrupt(pending: bool) {
    INTERRUPTED.with(|c| c.set(pending));
}

static FAKE: Lazy<FakeHost> = Lazy::new(|| FakeHost {
    alive: Mutex::new(HashSet::new()),
});

static NEXT_ID: AtomicI64 = AtomicI64::new(1);

pub(crate) fn ensure_installed() -> &'static FakeHost {
    let host: &'static FakeHost = &FAKE;
    interp::set_host(host);
    host
}

/// Bring up a fresh interpreter and report its id.
pub(crate) fn new_interp() -> InterpId {
    let host = ensure_installed();
    let interpid = NEXT_ID.fetch_add(1, Ordering::SeqCst);
    plock(&host.alive).insert(interpid);
    interpid
}

/// Run `f` with `interpid` active on this thread.
pub(crate) fn with_interp<R>(interpid: InterpId, f: impl FnOnce() -> R) -> R {
    ensure_installed();
    let prev = CURRENT.with(|c| c.replace(interpid));
    let result = f();
    CURRENT.with(|c| c.set(prev));
    result
}

/// Mark the interpreter dead without running any cleanup (for tests that
/// drive the teardown steps themselves).
pub(crate) fn kill(interpid: InterpId) {
    ensure_installed();
    plock(&FAKE.alive).remove(&interpid);
}

/// Orderly teardown: run the cleanup hook with the interpreter still
/// active, then mark it dead.
pub(crate) fn destroy_interp(interpid: InterpId) {
    ensure_installed();
    with_interp(interpid, || interp::clear_interpreter(interpid));
    kill(interpid);
}
