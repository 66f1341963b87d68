//! Cross-interpreter data.
//!
//! A value cannot cross the interpreter boundary alive: whatever one
//! interpreter sends is first materialized as an [`XiData`] record, an
//! interpreter-independent carrier, and later rebuilt as a fresh value in
//! whichever interpreter receives it. The record remembers which
//! interpreter produced it, because disposing of it must happen with that
//! interpreter active.
//!
//! Packers (the per-type conversion callbacks) live in [`registry`].

pub mod registry;

use std::fmt;
use std::mem;

use crate::error::{Error, Result};
use crate::interp::{self, InterpId};
use crate::obj::{DecodeHook, XObj};

////////////////////////////////////////////////////////////////////////////////
// policies
////////////////////////////////////////////////////////////////////////////////

/// What happens to an in-flight item when the interpreter that sent it is
/// destroyed before the item is received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnboundOp {
    /// Drop the item silently.
    Remove = 1,
    /// Keep the item; receiving it reports an error naming the lost sender.
    Error = 2,
    /// Keep the item; receiving it succeeds with an explicit unbound marker.
    Replace = 3,
}

impl UnboundOp {
    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            1 => Some(Self::Remove),
            2 => Some(Self::Error),
            3 => Some(Self::Replace),
            _ => None,
        }
    }

    #[inline]
    pub fn as_raw(self) -> i64 {
        self as i64
    }
}

/// What to try when a value's type has no registered packer (queues only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Fallback {
    /// Fail with `NotShareable`.
    None = 0,
    /// Try the flat msgpack serializer.
    Marshal = 1,
    /// Try the marshal serializer, then the deep one.
    Pickle = 2,
}

impl Fallback {
    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Marshal),
            2 => Some(Self::Pickle),
            _ => None,
        }
    }

    #[inline]
    pub fn as_raw(self) -> i64 {
        self as i64
    }
}

/// The outcome of receiving from a channel or queue.
#[derive(Debug)]
pub enum Received {
    /// A fresh value, rebuilt in the calling interpreter.
    Value(XObj),
    /// The item's sender died in flight and its policy was
    /// [`UnboundOp::Replace`]: the receive succeeds, but there is no value.
    Unbound,
}

impl Received {
    #[inline]
    pub fn value(self) -> Option<XObj> {
        match self {
            Self::Value(obj) => Some(obj),
            Self::Unbound => None,
        }
    }

    #[inline]
    pub fn is_unbound(&self) -> bool {
        matches!(self, Self::Unbound)
    }
}

////////////////////////////////////////////////////////////////////////////////
// payload
////////////////////////////////////////////////////////////////////////////////

/// The interpreter-independent derivation of a value.
///
/// Known shapes get their own variant; `Marshalled` is the catch-all for
/// serialized data and carries its own decoder.
#[derive(Debug)]
pub enum Payload {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Box<str>),
    Bytes(Box<[u8]>),
    /// A channel or queue id; unpacking re-binds in the receiver.
    Id(i64),
    /// A borrowed byte region whose backing object stays pinned in the
    /// sender (see [`crate::buffer`]).
    Buffer(crate::buffer::BufRegion),
    /// Fallback-serialized bytes plus the function that decodes them.
    Marshalled {
        bytes: Box<[u8]>,
        decode: DecodeHook,
    },
}

/// Rebuilds an equivalent value in the calling interpreter. Required.
pub type UnpackFn = fn(&XiData) -> Result<XObj>;

/// Disposes of the payload. Optional; when absent the payload is plain
/// data and is simply dropped. When present it is invoked with the origin
/// interpreter active.
pub type FreeFn = fn(Payload);

////////////////////////////////////////////////////////////////////////////////
// XiData
////////////////////////////////////////////////////////////////////////////////

/// One value, packaged for the trip between interpreters.
///
/// Once built a record is immutable; the only thing that ever happens to it
/// is [`unpack`](Self::unpack) (any number of times, in the receiver) and
/// [`release`](Self::release) (exactly once, under the origin interpreter).
/// Dropping an unreleased record releases it best-effort and logs any
/// failure.
pub struct XiData {
    payload: Payload,
    /// Keeps the source object alive in the origin interpreter for as long
    /// as the packed data needs it. Dropped only with the origin active.
    obj: Option<XObj>,
    origin: InterpId,
    unpack: UnpackFn,
    free: Option<FreeFn>,
}

impl XiData {
    pub fn new(origin: InterpId, payload: Payload, unpack: UnpackFn) -> Self {
        Self {
            payload,
            obj: None,
            origin,
            unpack,
            free: None,
        }
    }

    /// Pin `obj` in the origin interpreter until the record is released.
    pub fn with_obj(mut self, obj: XObj) -> Self {
        self.obj = Some(obj);
        self
    }

    pub fn with_free(mut self, free: FreeFn) -> Self {
        self.free = Some(free);
        self
    }

    #[inline]
    pub fn origin(&self) -> InterpId {
        self.origin
    }

    #[inline]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    #[inline]
    pub fn pinned_obj(&self) -> Option<&XObj> {
        self.obj.as_ref()
    }

    /// Rebuild the value in the calling interpreter.
    #[inline]
    pub fn unpack(&self) -> Result<XObj> {
        (self.unpack)(self)
    }

    /// Dispose of the record under its origin interpreter.
    ///
    /// If the origin is already gone this is best-effort: the payload free
    /// still runs (it only touches raw memory), the pinned source object is
    /// deliberately stranded, and [`Error::InterpreterNotRunning`] reports
    /// the situation.
    pub fn release(mut self) -> Result<()> {
        self.dispose()
    }

    /// Like [`release`](Self::release), but failures only make it into the
    /// log. Used on paths where another result must prevail.
    pub fn release_quietly(self) {
        let origin = self.origin;
        if let Err(e) = self.release() {
            log::warn!(
                "suppressed failure releasing cross-interpreter data from interpreter {}: {}",
                origin,
                e
            );
        }
    }

    fn dispose(&mut self) -> Result<()> {
        let payload = mem::replace(&mut self.payload, Payload::None);
        let obj = self.obj.take();
        let free = self.free.take();

        // Nothing interpreter-bound: plain data can be dropped anywhere.
        if free.is_none() && obj.is_none() {
            drop(payload);
            return Ok(());
        }

        let host = interp::host();
        if host.current_interp() == self.origin {
            run_free(payload, free);
            drop(obj);
            Ok(())
        } else if host.is_running(self.origin) {
            host.call_in(
                self.origin,
                Box::new(move || {
                    run_free(payload, free);
                    drop(obj);
                }),
            )
        } else {
            run_free(payload, free);
            if let Some(obj) = obj {
                // The only safe place to drop the pin died with its
                // interpreter; stranding the reference is the remaining
                // option.
                mem::forget(obj);
            }
            Err(Error::InterpreterNotRunning(self.origin))
        }
    }
}

fn run_free(payload: Payload, free: Option<FreeFn>) {
    match free {
        Some(f) => f(payload),
        None => drop(payload),
    }
}

impl Drop for XiData {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            log::warn!(
                "cross-interpreter data from interpreter {} dropped without release: {}",
                self.origin,
                e
            );
        }
    }
}

impl fmt::Debug for XiData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XiData")
            .field("payload", &self.payload)
            .field("origin", &self.origin)
            .field("pinned", &self.obj.is_some())
            .finish_non_exhaustive()
    }
}

const _: () = {
    const fn if_this_compiles_the_type_implements_send_and_sync<T: Send + Sync>() {}
    if_this_compiles_the_type_implements_send_and_sync::<XiData>();
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obj::obj;
    use crate::test_utils;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    static FREED: AtomicUsize = AtomicUsize::new(0);

    fn counting_free(payload: Payload) {
        FREED.fetch_add(1, Ordering::SeqCst);
        drop(payload);
    }

    fn unpack_int(data: &XiData) -> crate::Result<XObj> {
        match data.payload() {
            Payload::Int(i) => Ok(obj(*i)),
            _ => unreachable!(),
        }
    }

    #[test]
    fn release_runs_inline_under_origin() {
        let a = test_utils::new_interp();
        let before = FREED.load(Ordering::SeqCst);
        test_utils::with_interp(a, || {
            let data = XiData::new(a, Payload::Int(5), unpack_int).with_free(counting_free);
            data.release().unwrap();
        });
        assert_eq!(FREED.load(Ordering::SeqCst), before + 1);
        test_utils::kill(a);
    }

    #[test]
    fn release_switches_to_running_origin() {
        let a = test_utils::new_interp();
        let b = test_utils::new_interp();
        let data =
            test_utils::with_interp(a, || XiData::new(a, Payload::Int(7), unpack_int));
        test_utils::with_interp(b, || {
            // Released from b; the host must run the disposal under a.
            let pin = obj(String::from("pinned"));
            let data = data.with_obj(pin);
            data.release().unwrap();
        });
        test_utils::kill(a);
        test_utils::kill(b);
    }

    #[test]
    fn release_after_origin_death_is_reported() {
        let a = test_utils::new_interp();
        let b = test_utils::new_interp();
        let data = test_utils::with_interp(a, || {
            XiData::new(a, Payload::Int(9), unpack_int)
                .with_obj(obj(42i64))
                .with_free(counting_free)
        });
        test_utils::kill(a);
        let before = FREED.load(Ordering::SeqCst);
        let err = test_utils::with_interp(b, || data.release()).unwrap_err();
        assert!(matches!(err, Error::InterpreterNotRunning(id) if id == a));
        // The raw free still ran even though the origin was gone.
        assert_eq!(FREED.load(Ordering::SeqCst), before + 1);
        test_utils::kill(b);
    }

    #[test]
    fn unpack_rebuilds_a_fresh_value() {
        let a = test_utils::new_interp();
        let data = test_utils::with_interp(a, || XiData::new(a, Payload::Int(11), unpack_int));
        let rebuilt = data.unpack().unwrap();
        assert_eq!(*rebuilt.downcast_ref::<i64>().unwrap(), 11);
        drop(data);
        test_utils::kill(a);
    }

    #[test]
    fn policies_round_trip_through_raw_values() {
        for op in [UnboundOp::Remove, UnboundOp::Error, UnboundOp::Replace] {
            assert_eq!(UnboundOp::from_raw(op.as_raw()), Some(op));
        }
        assert_eq!(UnboundOp::from_raw(0), None);
        for fb in [Fallback::None, Fallback::Marshal, Fallback::Pickle] {
            assert_eq!(Fallback::from_raw(fb.as_raw()), Some(fb));
        }
        assert_eq!(Fallback::from_raw(3), None);
    }

    #[test]
    fn dropping_unreleased_data_does_not_panic() {
        let a = test_utils::new_interp();
        let data = test_utils::with_interp(a, || {
            XiData::new(a, Payload::Str("stray".into()), |_| unreachable!())
                .with_obj(obj(Arc::new(1i64)))
        });
        test_utils::with_interp(a, || drop(data));
        test_utils::kill(a);
    }
}
