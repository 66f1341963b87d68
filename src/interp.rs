//! The interpreter host boundary.
//!
//! This crate does not manage interpreters itself. The embedding runtime
//! owns their lifecycle and tells us three things through the [`Host`]
//! trait: which interpreter the calling thread is currently running, whether
//! a given interpreter is still alive, and how to run a piece of code with
//! another interpreter active on the calling thread. Everything else in the
//! crate is built on top of those three primitives.
//!
//! The host must also arrange for [`clear_interpreter`] to be called while
//! an interpreter is being torn down (with that interpreter still active),
//! so that in-flight items originating from it can be disposed of in the
//! right context.

use once_cell::sync::OnceCell;

use crate::error::{Error, Result};

/// Identifies one interpreter for the lifetime of the process.
///
/// Ids are assigned by the host, are never reused, and stay meaningful
/// after the interpreter dies. Negative values never identify a live
/// interpreter; [`UNKNOWN_INTERPID`] marks "not bound to any interpreter".
pub type InterpId = i64;

/// The "no interpreter" sentinel.
pub const UNKNOWN_INTERPID: InterpId = -1;

////////////////////////////////////////////////////////////////////////////////
// Host
////////////////////////////////////////////////////////////////////////////////

/// The contract the embedding runtime fulfills for us.
///
/// Implementations must be cheap to call: `current_interp` sits on every
/// send/receive path.
pub trait Host: Send + Sync {
    /// The interpreter active on the calling thread.
    fn current_interp(&self) -> InterpId;

    /// Whether the identified interpreter has not been destroyed yet.
    fn is_running(&self, interpid: InterpId) -> bool;

    /// Run `f` on the calling thread with `interpid` active, restoring the
    /// previous interpreter afterwards.
    ///
    /// Fails with [`Error::InterpreterNotRunning`] if the target is gone.
    fn call_in(&self, interpid: InterpId, f: Box<dyn FnOnce() + Send>) -> Result<()>;

    /// Whether the runtime has asked the calling thread to stop waiting
    /// (signal delivery and the like). Polled by blocking operations.
    fn interrupted(&self) -> bool {
        false
    }
}

/// A host for the degenerate embedding: a single interpreter, id 0, that
/// lives as long as the process. Used when no host has been installed.
struct SoloHost;

impl Host for SoloHost {
    fn current_interp(&self) -> InterpId {
        0
    }

    fn is_running(&self, interpid: InterpId) -> bool {
        interpid == 0
    }

    fn call_in(&self, interpid: InterpId, f: Box<dyn FnOnce() + Send>) -> Result<()> {
        if interpid != 0 {
            return Err(Error::InterpreterNotRunning(interpid));
        }
        f();
        Ok(())
    }
}

static SOLO_HOST: SoloHost = SoloHost;
static HOST: OnceCell<&'static dyn Host> = OnceCell::new();

/// Install the process-wide host. May be called once; returns `false` if a
/// host was already installed (the existing one stays in effect).
pub fn set_host(host: &'static dyn Host) -> bool {
    HOST.set(host).is_ok()
}

#[inline]
pub(crate) fn host() -> &'static dyn Host {
    // Unit tests always run against the fake host, no matter which test
    // touches the crate first.
    #[cfg(test)]
    crate::test_utils::ensure_installed();
    *HOST.get_or_init(|| &SOLO_HOST as &'static dyn Host)
}

/// The interpreter active on the calling thread.
#[inline]
pub fn current_interp() -> InterpId {
    host().current_interp()
}

////////////////////////////////////////////////////////////////////////////////
// interpreter teardown
////////////////////////////////////////////////////////////////////////////////

/// Dispose of everything the identified interpreter still owns across all
/// channels and queues.
///
/// The host must call this during teardown of `interpid`, on a thread where
/// that interpreter is still active: items it sent are either removed or
/// stripped down to their unbound marker (according to each item's unbound
/// policy), its channel ends are closed, and its locally registered packers
/// are dropped.
pub fn clear_interpreter(interpid: InterpId) {
    log::debug!("clearing interpreter {} from channels and queues", interpid);
    crate::channel::clear_interpreter(interpid);
    crate::queue::clear_interpreter(interpid);
    crate::xid::registry::clear_interpreter(interpid);
}
