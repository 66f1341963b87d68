//! The process-global channel directory.
//!
//! One mutex guards the directory itself (membership, id assignment,
//! per-entry handle counts); each channel's own lock guards its contents.
//! The directory lock is always taken first, and operations keep holding
//! it while they work on a channel so that a concurrent close or destroy
//! cannot pull the channel out from under them. Unpacking received data
//! happens after the directory lock is dropped.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::error::{Error, Result};
use crate::interp::{self, InterpId};
use crate::util::plock;
use crate::waiter::Waiter;
use crate::xid::{self, Received, UnboundOp};

use super::item::PoppedItem;
use super::{Channel, ChannelHandle, ChannelId, ChannelInfo, EndFlags, Next};

struct ChannelRef {
    cid: ChannelId,
    /// None once the channel is closed; the entry itself stays until
    /// destroyed or until the last handle is dropped.
    chan: Option<Arc<Channel>>,
    /// Outstanding [`ChannelHandle`]s.
    objcount: i64,
    /// Remembered for `list_all`, which reports closed channels too.
    default_unbound: UnboundOp,
}

struct ChannelsInner {
    head: Vec<ChannelRef>,
    next_id: ChannelId,
    init_count: usize,
}

pub(crate) struct Channels {
    inner: Mutex<ChannelsInner>,
}

impl Channels {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ChannelsInner {
                head: Vec::new(),
                next_id: 0,
                init_count: 0,
            }),
        }
    }

    fn find_mut<'a>(head: &'a mut Vec<ChannelRef>, cid: ChannelId) -> Option<&'a mut ChannelRef> {
        head.iter_mut().find(|e| e.cid == cid)
    }

    /// The channel behind `cid`, required to be open.
    fn lookup_open(head: &[ChannelRef], cid: ChannelId) -> Result<Arc<Channel>> {
        let entry = head
            .iter()
            .find(|e| e.cid == cid)
            .ok_or(Error::ChannelNotFound(cid))?;
        match &entry.chan {
            Some(chan) if chan.is_open() => Ok(chan.clone()),
            _ => Err(Error::ChannelClosed(cid)),
        }
    }

    pub fn create(&self, unbound: UnboundOp) -> Result<ChannelId> {
        let mut g = plock(&self.inner);
        if g.next_id < 0 {
            return Err(Error::NoMoreIds("channel"));
        }
        let cid = g.next_id;
        g.next_id += 1;
        g.head.push(ChannelRef {
            cid,
            chan: Some(Arc::new(Channel::new(unbound))),
            objcount: 0,
            default_unbound: unbound,
        });
        log::debug!("created channel {}", cid);
        Ok(cid)
    }

    pub fn destroy(&self, cid: ChannelId) -> Result<()> {
        let retired;
        {
            let mut g = plock(&self.inner);
            let pos = g
                .head
                .iter()
                .position(|e| e.cid == cid)
                .ok_or(Error::ChannelNotFound(cid))?;
            retired = g.head.remove(pos);
        }
        // Queued items are disposed of outside the directory lock.
        drop(retired);
        log::debug!("destroyed channel {}", cid);
        Ok(())
    }

    pub fn list_all(&self) -> Vec<(ChannelId, UnboundOp)> {
        plock(&self.inner)
            .head
            .iter()
            .map(|e| (e.cid, e.default_unbound))
            .collect()
    }

    pub fn list_interpreters(&self, cid: ChannelId, send: bool) -> Result<Vec<InterpId>> {
        let g = plock(&self.inner);
        let chan = Self::lookup_open(&g.head, cid)?;
        Ok(chan.list_interpreters(send))
    }

    /// Pack `obj` and queue it; with `waiting`, the caller intends to park
    /// until the item is received.
    pub fn send(
        &self,
        cid: ChannelId,
        obj: &crate::obj::XObj,
        waiting: Option<Arc<Waiter>>,
        unbound: Option<UnboundOp>,
    ) -> Result<()> {
        let interpid = interp::current_interp();
        let g = plock(&self.inner);
        let chan = Self::lookup_open(&g.head, cid)?;
        if chan.is_closing() {
            return Err(Error::ChannelClosed(cid));
        }
        let unbound = unbound.unwrap_or_else(|| chan.default_unbound());
        let data = xid::registry::pack(interpid, obj)?;
        chan.add(cid, interpid, data, waiting, unbound)
    }

    /// Synchronous send: queue the item, then park until it is received.
    /// On timeout or interrupt the item is removed again (unless the
    /// receiver won the race, which counts as success).
    pub fn send_wait(
        &self,
        cid: ChannelId,
        obj: &crate::obj::XObj,
        unbound: Option<UnboundOp>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let waiting = Arc::new(Waiter::new());
        self.send(cid, obj, Some(waiting.clone()), unbound)?;

        match waiting.wait(timeout) {
            Ok(()) => {
                waiting.settle();
                if waiting.received() {
                    Ok(())
                } else {
                    // The receiver side dropped the item: the channel went
                    // away mid-transfer.
                    Err(Error::ChannelClosedWhileWaiting(cid))
                }
            }
            Err(e) => {
                debug_assert!(e.is_wait_failure());
                waiting.settle();
                self.clear_sent(cid, &waiting);
                debug_assert!(!waiting.is_armed());
                if waiting.received() {
                    // Delivered just before we could take it back.
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Un-send: remove the waiter's item if it is still queued.
    fn clear_sent(&self, cid: ChannelId, waiting: &Waiter) {
        let mut g = plock(&self.inner);
        let entry = match Self::find_mut(&mut g.head, cid) {
            Some(entry) => entry,
            // Destroyed in the meantime; the item went with it.
            None => return,
        };
        let chan = match &entry.chan {
            Some(chan) => chan.clone(),
            None => return,
        };
        if chan.remove(waiting.itemid()) {
            entry.chan = None;
        }
    }

    pub fn recv(&self, cid: ChannelId) -> Result<Received> {
        let interpid = interp::current_interp();
        let popped = {
            let mut g = plock(&self.inner);
            let entry =
                Self::find_mut(&mut g.head, cid).ok_or(Error::ChannelNotFound(cid))?;
            let chan = match &entry.chan {
                Some(chan) => chan.clone(),
                None => return Err(Error::ChannelClosed(cid)),
            };
            match chan.next(interpid) {
                Next::Closed => return Err(Error::ChannelClosed(cid)),
                Next::Empty { finished } => {
                    if finished {
                        entry.chan = None;
                    }
                    return Err(Error::ChannelEmpty(cid));
                }
                Next::Item { popped, finished } => {
                    if finished {
                        entry.chan = None;
                    }
                    popped
                }
            }
        };
        receive_popped(popped)
    }

    pub fn close(&self, cid: ChannelId, which: EndFlags, force: bool) -> Result<()> {
        let retired;
        let result;
        {
            let mut g = plock(&self.inner);
            let entry =
                Self::find_mut(&mut g.head, cid).ok_or(Error::ChannelNotFound(cid))?;
            let chan = match &entry.chan {
                Some(chan) => chan.clone(),
                None => return Err(Error::ChannelClosed(cid)),
            };
            if !force && which == EndFlags::SEND && chan.is_closing() {
                return Err(Error::ChannelClosed(cid));
            }
            match chan.release_all(cid, force) {
                Ok(()) => {
                    retired = entry.chan.take();
                    result = Ok(());
                }
                Err(Error::ChannelNotEmpty(_)) if which == EndFlags::SEND => {
                    // Switch to draining; the final receive completes the
                    // close.
                    retired = None;
                    result = chan.set_closing(cid);
                }
                Err(e) => {
                    retired = None;
                    result = Err(e);
                }
            }
        }
        drop(retired);
        result
    }

    pub fn release(&self, cid: ChannelId, which: EndFlags) -> Result<()> {
        let interpid = interp::current_interp();
        let g = plock(&self.inner);
        let chan = Self::lookup_open(&g.head, cid)?;
        chan.release_interpreter(cid, interpid, which)
    }

    pub fn count(&self, cid: ChannelId) -> Result<usize> {
        let g = plock(&self.inner);
        let chan = Self::lookup_open(&g.head, cid)?;
        Ok(chan.count())
    }

    pub fn info(&self, cid: ChannelId) -> Result<ChannelInfo> {
        let interpid = interp::current_interp();
        let g = plock(&self.inner);
        let entry = g
            .head
            .iter()
            .find(|e| e.cid == cid)
            .ok_or(Error::ChannelNotFound(cid))?;
        match &entry.chan {
            None => Ok(ChannelInfo {
                closed: true,
                ..ChannelInfo::default()
            }),
            Some(chan) => Ok(chan.info(interpid)),
        }
    }

    pub fn is_associated(&self, cid: ChannelId, interpid: InterpId, send: bool) -> Result<bool> {
        let g = plock(&self.inner);
        let chan = Self::lookup_open(&g.head, cid)?;
        chan.is_associated(cid, interpid, send)
    }

    pub fn bind(&self, cid: ChannelId) -> Result<ChannelHandle> {
        let mut g = plock(&self.inner);
        let entry = Self::find_mut(&mut g.head, cid).ok_or(Error::ChannelNotFound(cid))?;
        entry.objcount += 1;
        Ok(ChannelHandle { cid })
    }

    /// A handle went away. The last one takes the channel with it.
    pub fn unbind(&self, cid: ChannelId) {
        let retired;
        {
            let mut g = plock(&self.inner);
            let pos = match g.head.iter().position(|e| e.cid == cid) {
                Some(pos) => pos,
                // Explicitly destroyed earlier; nothing left to release.
                None => return,
            };
            let entry = &mut g.head[pos];
            entry.objcount -= 1;
            debug_assert!(entry.objcount >= 0);
            if entry.objcount > 0 {
                return;
            }
            retired = g.head.remove(pos);
        }
        drop(retired);
        log::debug!("released last handle; destroyed channel {}", cid);
    }

    pub fn clear_interpreter(&self, interpid: InterpId) {
        let g = plock(&self.inner);
        for entry in g.head.iter() {
            if let Some(chan) = &entry.chan {
                chan.clear_interpreter(interpid);
            }
        }
    }

    pub fn init(&self) {
        plock(&self.inner).init_count += 1;
    }

    pub fn fini(&self) {
        let leftovers;
        {
            let mut g = plock(&self.inner);
            if g.init_count == 0 {
                log::warn!("channel module finalized more often than initialized");
                return;
            }
            g.init_count -= 1;
            if g.init_count > 0 {
                return;
            }
            leftovers = std::mem::take(&mut g.head);
        }
        for entry in &leftovers {
            log::debug!("channel {} still exists at finalization", entry.cid);
        }
        drop(leftovers);
    }
}

/// Receiver-side completion: rebuild the value, release the packed data
/// under its origin, and wake the sender if it is waiting.
fn receive_popped(popped: PoppedItem) -> Result<Received> {
    let PoppedItem {
        origin,
        data,
        waiting,
        unbound,
    } = popped;

    let data = match data {
        Some(data) => data,
        None => {
            // The sweep for the dead origin already stripped the payload;
            // only the unbound policy is left to act on. A waiter attached
            // to it would belong to the dead interpreter, so there is
            // nobody to wake.
            drop(waiting);
            return match unbound {
                UnboundOp::Error => Err(Error::ItemInterpreterDestroyed(origin)),
                UnboundOp::Replace => Ok(Received::Unbound),
                UnboundOp::Remove => {
                    debug_assert!(false, "removed items never reach a receiver");
                    Ok(Received::Unbound)
                }
            };
        }
    };

    let value = match data.unpack() {
        Ok(value) => value,
        Err(e) => {
            data.release_quietly();
            if let Some(waiting) = waiting {
                waiting.release(false);
            }
            return Err(e);
        }
    };
    if let Err(e) = data.release() {
        // The origin died between the sweep and now; the value itself is
        // fine but the transfer contract was broken.
        drop(value);
        if let Some(waiting) = waiting {
            waiting.release(false);
        }
        return Err(e);
    }
    if let Some(waiting) = waiting {
        waiting.release(true);
    }
    Ok(Received::Value(value))
}

static CHANNELS: Lazy<Channels> = Lazy::new(Channels::new);

pub(crate) fn global() -> &'static Channels {
    &CHANNELS
}
