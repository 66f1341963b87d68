//! Channels.
//!
//! A channel is a reference-counted FIFO conduit between interpreters:
//! any number of interpreters may bind its send end, any number its
//! receive end, and values travel through it as cross-interpreter data
//! (see [`crate::xid`]). Ends are sticky: an interpreter is bound to an
//! end the first time it uses it and stays listed even after releasing it.
//!
//! Sends are asynchronous by default ([`send`]); [`send_wait`] additionally
//! parks the sender until the value has actually been received, with an
//! optional timeout. Closing comes in two flavors: an immediate close of an
//! empty (or force-cleared) channel, and a drain-close that refuses new
//! sends while letting receivers empty the queue.
//!
//! Channels live in a process-global directory keyed by [`ChannelId`] and
//! can be looked up from any interpreter; a [`ChannelHandle`] pins one in
//! the directory and is itself a shareable value, so access to a channel
//! can be sent through another channel.

mod ends;
mod item;
pub(crate) mod registry;

pub use ends::EndFlags;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::interp::InterpId;
use crate::obj::{obj, XObj};
use crate::util::plock;
use crate::waiter::Waiter;
use crate::xid::{Payload, Received, UnboundOp, XiData};

use ends::ChannelEnds;
use item::{ItemId, ItemQueue, PoppedItem};

/// Identifies one channel for the lifetime of the process. Ids are
/// assigned sequentially and never reused.
pub type ChannelId = i64;

////////////////////////////////////////////////////////////////////////////////
// Channel
////////////////////////////////////////////////////////////////////////////////

struct ChanInner {
    queue: ItemQueue,
    ends: ChannelEnds,
    open: bool,
    /// Set by a drain-close: sends are rejected, receives keep going, and
    /// the receive that empties the queue finishes the close.
    closing: bool,
}

pub(crate) struct Channel {
    inner: Mutex<ChanInner>,
    default_unbound: UnboundOp,
}

/// What [`Channel::next`] found. `finished` reports that a drain-close
/// just completed and the directory entry should be retired.
enum Next {
    Item { popped: PoppedItem, finished: bool },
    Empty { finished: bool },
    Closed,
}

impl Channel {
    fn new(default_unbound: UnboundOp) -> Self {
        Self {
            inner: Mutex::new(ChanInner {
                queue: ItemQueue::new(),
                ends: ChannelEnds::new(),
                open: true,
                closing: false,
            }),
            default_unbound,
        }
    }

    #[inline]
    fn default_unbound(&self) -> UnboundOp {
        self.default_unbound
    }

    fn is_open(&self) -> bool {
        plock(&self.inner).open
    }

    fn is_closing(&self) -> bool {
        plock(&self.inner).closing
    }

    fn count(&self) -> usize {
        plock(&self.inner).queue.len()
    }

    /// Append an item, binding the sender to the send end. The waiter (if
    /// any) is armed under the channel lock, together with the push.
    fn add(
        &self,
        cid: ChannelId,
        origin: InterpId,
        data: XiData,
        waiting: Option<Arc<Waiter>>,
        unbound: UnboundOp,
    ) -> Result<()> {
        let mut inner = plock(&self.inner);
        if !inner.open || !inner.ends.associate(origin, true) {
            drop(inner);
            // The packed data was produced for this send only; nothing
            // else will ever release it.
            data.release_quietly();
            return Err(Error::ChannelClosed(cid));
        }
        inner.queue.push(origin, data, waiting, unbound);
        Ok(())
    }

    /// Pop the next item, binding the receiver to the recv end.
    fn next(&self, interpid: InterpId) -> Next {
        let mut inner = plock(&self.inner);
        if !inner.open || !inner.ends.associate(interpid, false) {
            return Next::Closed;
        }
        match inner.queue.pop() {
            Some(popped) => {
                let finished = inner.closing && inner.queue.is_empty();
                if finished {
                    inner.open = false;
                }
                Next::Item { popped, finished }
            }
            None => {
                let finished = inner.closing;
                if finished {
                    inner.open = false;
                }
                Next::Empty { finished }
            }
        }
    }

    /// Unlink the identified item (a timed-out synchronous send taking its
    /// value back). Returns whether this completed a drain-close.
    fn remove(&self, itemid: ItemId) -> bool {
        let (popped, finished) = {
            let mut inner = plock(&self.inner);
            let popped = inner.queue.remove(itemid);
            let finished = inner.closing && inner.queue.is_empty();
            if finished {
                inner.open = false;
            }
            (popped, finished)
        };
        if let Some(popped) = popped {
            if let Some(data) = popped.data {
                data.release_quietly();
            }
            if let Some(waiting) = popped.waiting {
                waiting.release(false);
            }
        }
        finished
    }

    /// The current interpreter stops using the selected end(s). The
    /// channel closes once every end that ever bound has been released.
    fn release_interpreter(
        &self,
        cid: ChannelId,
        interpid: InterpId,
        which: EndFlags,
    ) -> Result<()> {
        let mut inner = plock(&self.inner);
        if !inner.open {
            return Err(Error::ChannelClosed(cid));
        }
        inner.ends.release_interpreter(interpid, which);
        inner.open = inner.ends.is_open();
        Ok(())
    }

    /// Immediate close: flip to closed and release every end. Refused for
    /// a non-empty queue unless forced.
    fn release_all(&self, cid: ChannelId, force: bool) -> Result<()> {
        let mut inner = plock(&self.inner);
        if !inner.open {
            return Err(Error::ChannelClosed(cid));
        }
        if !force && !inner.queue.is_empty() {
            return Err(Error::ChannelNotEmpty(cid));
        }
        inner.open = false;
        inner.ends.release_all();
        Ok(())
    }

    /// Start a drain-close.
    fn set_closing(&self, cid: ChannelId) -> Result<()> {
        let mut inner = plock(&self.inner);
        if inner.closing {
            return Err(Error::ChannelClosed(cid));
        }
        inner.closing = true;
        Ok(())
    }

    /// The teardown sweep for a dying interpreter: strip or drop its
    /// in-flight items and close its ends. Runs with that interpreter
    /// still active.
    fn clear_interpreter(&self, interpid: InterpId) {
        let mut inner = plock(&self.inner);
        inner.queue.clear_interpreter(interpid);
        inner.ends.clear_interpreter(interpid);
        inner.open = inner.ends.is_open();
    }

    fn is_associated(&self, cid: ChannelId, interpid: InterpId, send: bool) -> Result<bool> {
        let inner = plock(&self.inner);
        if send && inner.closing {
            return Err(Error::ChannelClosed(cid));
        }
        Ok(inner.ends.association(interpid, send).unwrap_or(false))
    }

    fn list_interpreters(&self, send: bool) -> Vec<InterpId> {
        plock(&self.inner).ends.list(send)
    }

    fn info(&self, interpid: InterpId) -> ChannelInfo {
        let inner = plock(&self.inner);
        let mut info = ChannelInfo::default();
        if !inner.open {
            info.closed = true;
            return info;
        }
        if inner.closing {
            info.closing = true;
        } else {
            info.open = true;
        }
        info.count = inner.queue.len();

        let (send, recv) = inner.ends.snapshot();
        for &(id, open) in &send {
            if id == interpid {
                info.send_associated = open;
                info.send_released = !open;
            }
            if open {
                info.num_interp_send += 1;
            } else {
                info.num_interp_send_released += 1;
            }
        }
        for &(id, ropen) in &recv {
            if id == interpid {
                info.recv_associated = ropen;
                info.recv_released = !ropen;
            }
            match send.iter().find(|(sid, _)| *sid == id) {
                None => {
                    if ropen {
                        info.num_interp_recv += 1;
                    } else {
                        info.num_interp_recv_released += 1;
                    }
                }
                Some(&(_, sopen)) => match (sopen, ropen) {
                    (true, true) => {
                        info.num_interp_both += 1;
                        info.num_interp_send -= 1;
                    }
                    (false, true) => {
                        info.num_interp_both_send_released += 1;
                        info.num_interp_send_released -= 1;
                    }
                    (true, false) => {
                        info.num_interp_both_recv_released += 1;
                        info.num_interp_send -= 1;
                    }
                    (false, false) => {
                        info.num_interp_both_released += 1;
                        info.num_interp_send_released -= 1;
                    }
                },
            }
        }
        info
    }
}

////////////////////////////////////////////////////////////////////////////////
// ChannelInfo
////////////////////////////////////////////////////////////////////////////////

/// A snapshot of a channel's state, as seen by the calling interpreter.
///
/// The eight `num_interp_*` counters classify every interpreter that ever
/// bound an end: by which end(s) it bound and whether it released them.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Fully usable.
    pub open: bool,
    /// Draining: sends rejected, queued items still receivable.
    pub closing: bool,
    /// Nothing more will pass through.
    pub closed: bool,
    /// Queued items.
    pub count: usize,

    pub num_interp_send: usize,
    pub num_interp_send_released: usize,
    pub num_interp_recv: usize,
    pub num_interp_recv_released: usize,
    pub num_interp_both: usize,
    pub num_interp_both_released: usize,
    pub num_interp_both_send_released: usize,
    pub num_interp_both_recv_released: usize,

    /// The calling interpreter holds the send end open.
    pub send_associated: bool,
    /// The calling interpreter bound the send end and released it.
    pub send_released: bool,
    pub recv_associated: bool,
    pub recv_released: bool,
}

////////////////////////////////////////////////////////////////////////////////
// ChannelHandle
////////////////////////////////////////////////////////////////////////////////

/// A counted reference to a channel in the directory.
///
/// The directory destroys a channel when its last handle is dropped (an
/// explicit [`destroy`] works regardless). Handles are shareable values:
/// sending one re-binds it in the receiving interpreter.
pub struct ChannelHandle {
    cid: ChannelId,
}

impl ChannelHandle {
    #[inline]
    pub fn id(&self) -> ChannelId {
        self.cid
    }
}

impl Clone for ChannelHandle {
    fn clone(&self) -> Self {
        match registry::global().bind(self.cid) {
            Ok(handle) => handle,
            Err(e) => {
                log::warn!("cloning a handle to dead channel {}: {}", self.cid, e);
                ChannelHandle { cid: self.cid }
            }
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        registry::global().unbind(self.cid);
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChannelHandle({})", self.cid)
    }
}

/// Builtin packer for [`ChannelHandle`].
pub(crate) fn pack_handle(origin: InterpId, value: &XObj) -> Result<XiData> {
    let handle = value
        .downcast_ref::<ChannelHandle>()
        .expect("packer invoked for a value of a different type");
    Ok(XiData::new(origin, Payload::Id(handle.id()), |data| {
        match data.payload() {
            Payload::Id(cid) => Ok(obj(registry::global().bind(*cid)?)),
            _ => unreachable!("channel handle unpacker invoked on a different payload"),
        }
    }))
}

////////////////////////////////////////////////////////////////////////////////
// public operations
////////////////////////////////////////////////////////////////////////////////

/// Create a new channel with the given default unbound-item policy.
pub fn create(unbound: UnboundOp) -> Result<ChannelId> {
    registry::global().create(unbound)
}

/// Remove the channel from the directory and dispose of its contents,
/// regardless of outstanding handles or queued items.
pub fn destroy(cid: ChannelId) -> Result<()> {
    registry::global().destroy(cid)
}

/// Every channel in the directory, with its default unbound policy.
pub fn list_all() -> Vec<(ChannelId, UnboundOp)> {
    registry::global().list_all()
}

/// Interpreters currently holding the chosen end of the channel open.
pub fn list_interpreters(cid: ChannelId, send: bool) -> Result<Vec<InterpId>> {
    registry::global().list_interpreters(cid, send)
}

/// Queue `obj`'s data on the channel and return immediately. The calling
/// interpreter is bound to the send end.
///
/// `unbound` defaults to the channel's policy.
pub fn send(cid: ChannelId, obj: &XObj, unbound: Option<UnboundOp>) -> Result<()> {
    registry::global().send(cid, obj, None, unbound)
}

/// Like [`send`], but wait until the value has been received.
///
/// `timeout` of `None` waits forever; `Some(Duration::ZERO)` only succeeds
/// if the value is received before the first poll. On timeout or interrupt
/// the queued item is removed again, so the channel never delivers a value
/// whose sender already reported failure.
pub fn send_wait(
    cid: ChannelId,
    obj: &XObj,
    unbound: Option<UnboundOp>,
    timeout: Option<Duration>,
) -> Result<()> {
    registry::global().send_wait(cid, obj, unbound, timeout)
}

/// [`send`] specialized to shared byte buffers: the value must be a
/// [`crate::buffer::BufferSource`], and the receiver gets a zero-copy
/// [`crate::buffer::BufferView`] into the sender's memory.
pub fn send_buffer(cid: ChannelId, obj: &XObj, unbound: Option<UnboundOp>) -> Result<()> {
    require_buffer(obj)?;
    registry::global().send(cid, obj, None, unbound)
}

/// [`send_wait`] for shared byte buffers.
pub fn send_buffer_wait(
    cid: ChannelId,
    obj: &XObj,
    unbound: Option<UnboundOp>,
    timeout: Option<Duration>,
) -> Result<()> {
    require_buffer(obj)?;
    registry::global().send_wait(cid, obj, unbound, timeout)
}

fn require_buffer(obj: &XObj) -> Result<()> {
    if obj.downcast_ref::<crate::buffer::BufferSource>().is_none() {
        return Err(Error::NotShareable(String::from(
            "send_buffer requires a BufferSource value",
        )));
    }
    Ok(())
}

/// Pop the next value. The calling interpreter is bound to the recv end.
///
/// Fails with [`Error::ChannelEmpty`] when nothing is queued. An item
/// whose sender died in flight surfaces according to its unbound policy:
/// [`Received::Unbound`] for `Replace`,
/// [`Error::ItemInterpreterDestroyed`] for `Error`.
pub fn recv(cid: ChannelId) -> Result<Received> {
    registry::global().recv(cid)
}

/// Like [`recv`], but an empty channel yields `default` instead of
/// failing, when one is supplied.
pub fn recv_or(cid: ChannelId, default: Option<XObj>) -> Result<Received> {
    match (registry::global().recv(cid), default) {
        (Err(Error::ChannelEmpty(_)), Some(default)) => Ok(Received::Value(default)),
        (other, _) => other,
    }
}

/// Close the channel for every interpreter.
///
/// An empty channel (or `force`) closes immediately. A non-empty channel
/// closed from the send side only enters the draining state instead:
/// further sends fail, receives continue, and the receive that empties the
/// queue completes the close. Closing an already-closed channel fails with
/// [`Error::ChannelClosed`].
pub fn close(cid: ChannelId, which: EndFlags, force: bool) -> Result<()> {
    registry::global().close(cid, which, force)
}

/// The calling interpreter releases its end(s) of the channel. With no
/// end selected, both are released (legacy reading, kept on purpose).
pub fn release(cid: ChannelId, which: EndFlags) -> Result<()> {
    registry::global().release(cid, which)
}

/// Number of queued items.
pub fn count(cid: ChannelId) -> Result<usize> {
    registry::global().count(cid)
}

/// A full state snapshot, as seen by the calling interpreter.
pub fn info(cid: ChannelId) -> Result<ChannelInfo> {
    registry::global().info(cid)
}

/// Whether `interpid` currently holds the chosen end of the channel open.
pub fn is_associated(cid: ChannelId, interpid: InterpId, send: bool) -> Result<bool> {
    registry::global().is_associated(cid, interpid, send)
}

/// Take a counted reference to the channel.
pub fn bind(cid: ChannelId) -> Result<ChannelHandle> {
    registry::global().bind(cid)
}

/// Count one more user of the channel module.
pub fn init() {
    registry::global().init();
}

/// Release one use of the channel module; the last release drops every
/// channel still in the directory.
pub fn fini() {
    registry::global().fini();
}

pub(crate) fn clear_interpreter(interpid: InterpId) {
    registry::global().clear_interpreter(interpid);
}
