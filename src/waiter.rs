//! The rendezvous used by synchronous sends.
//!
//! A [`Waiter`] is single-use: the sender arms it while the channel lock is
//! held, parks on [`wait`](Waiter::wait) until the receiver (or whoever
//! removes the item) calls [`release`](Waiter::release), then consults
//! [`received`](Waiter::received) to learn whether the item was actually
//! delivered. The inner lock is used as a binary semaphore: armed means
//! held, released means free.
//!
//! `release` happens in two observable steps (unlock, then record the
//! outcome); [`settle`](Waiter::settle) lets the woken side spin out that
//! window before it reads the outcome or lets the waiter go.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::interp;
use crate::util::plock;

const NO_STATUS: u8 = 0;
const ACQUIRED: u8 = 1;
const RELEASING: u8 = 2;
const RELEASED: u8 = 3;

/// How long a parked sender sleeps between interrupt checks.
const WAIT_SLICE: Duration = Duration::from_millis(50);

pub struct Waiter {
    /// true while armed. Guarded by `lock`/`cond`.
    lock: Mutex<bool>,
    cond: Condvar,
    status: AtomicU8,
    received: AtomicBool,
    /// Identity of the queue item this waiter is attached to, so a
    /// timed-out sender can remove exactly that item.
    itemid: AtomicU64,
}

impl Waiter {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(false),
            cond: Condvar::new(),
            status: AtomicU8::new(NO_STATUS),
            received: AtomicBool::new(false),
            itemid: AtomicU64::new(0),
        }
    }

    /// Take the semaphore. Called exactly once, by the sender, with the
    /// channel lock held (so the item and the waiter become visible
    /// together).
    pub fn arm(&self) {
        assert_eq!(
            self.status.load(Ordering::SeqCst),
            NO_STATUS,
            "waiter armed twice"
        );
        let mut held = plock(&self.lock);
        debug_assert!(!*held);
        *held = true;
        self.status.store(ACQUIRED, Ordering::SeqCst);
    }

    /// Whether [`arm`](Self::arm) has happened and
    /// [`release`](Self::release) has not.
    pub fn is_armed(&self) -> bool {
        self.status.load(Ordering::SeqCst) == ACQUIRED
    }

    /// Free the semaphore and record whether the item was delivered.
    /// Called exactly once per armed waiter, by whoever disposed of the
    /// item.
    pub fn release(&self, received: bool) {
        assert_eq!(
            self.status.load(Ordering::SeqCst),
            ACQUIRED,
            "waiter released without being armed"
        );
        self.status.store(RELEASING, Ordering::SeqCst);
        {
            let mut held = plock(&self.lock);
            *held = false;
            self.cond.notify_all();
        }
        if received {
            self.received.store(true, Ordering::SeqCst);
        }
        self.status.store(RELEASED, Ordering::SeqCst);
    }

    /// Spin until a concurrent [`release`](Self::release) has fully
    /// completed, so that [`received`](Self::received) is stable.
    pub fn settle(&self) {
        while self.status.load(Ordering::SeqCst) == RELEASING {
            thread::yield_now();
        }
    }

    /// Park until released, for at most `timeout` (forever if `None`).
    ///
    /// Returns `Ok` once [`release`](Self::release) has been observed;
    /// [`Error::Timeout`] or [`Error::Interrupted`] otherwise. A zero
    /// timeout only checks the current state.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let host = interp::host();

        let mut held = plock(&self.lock);
        loop {
            if !*held {
                return Ok(());
            }
            if host.interrupted() {
                return Err(Error::Interrupted);
            }
            let slice = match deadline {
                None => WAIT_SLICE,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    WAIT_SLICE.min(deadline - now)
                }
            };
            let (guard, _) = self
                .cond
                .wait_timeout(held, slice)
                .unwrap_or_else(|e| e.into_inner());
            held = guard;
        }
    }

    /// Whether the released item was delivered to a receiver (as opposed
    /// to removed). Only meaningful once the waiter has settled.
    pub fn received(&self) -> bool {
        self.received.load(Ordering::SeqCst)
    }

    pub fn set_itemid(&self, itemid: u64) {
        self.itemid.store(itemid, Ordering::SeqCst);
    }

    pub fn itemid(&self) -> u64 {
        self.itemid.load(Ordering::SeqCst)
    }
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new()
    }
}
