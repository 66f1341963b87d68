//! In-flight channel items.
//!
//! Items are created by send and normally destroyed by the matching
//! receive. Two other things can happen to one: a timed-out synchronous
//! sender removes it by id, or the cleanup sweep of a dying interpreter
//! strips or drops it. Every path must release the packed data (under its
//! origin) and wake an attached waiter exactly once; the `Drop` impl is the
//! backstop that makes abandoning an item safe.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::interp::InterpId;
use crate::waiter::Waiter;
use crate::xid::{UnboundOp, XiData};

/// Identifies one queued item within its channel, for the lifetime of the
/// channel. Ids are handed out sequentially and never reused.
pub(crate) type ItemId = u64;

pub(crate) struct ChannelItem {
    itemid: ItemId,
    origin: InterpId,
    /// None once the origin interpreter died and the cleanup sweep
    /// stripped the payload (the item then only carries its unbound
    /// policy).
    data: Option<XiData>,
    waiting: Option<Arc<Waiter>>,
    unbound: UnboundOp,
}

/// What `pop`/`remove` hand back: the parts the caller now owns.
pub(crate) struct PoppedItem {
    pub origin: InterpId,
    pub data: Option<XiData>,
    pub waiting: Option<Arc<Waiter>>,
    pub unbound: UnboundOp,
}

impl ChannelItem {
    /// Move the payload and waiter out; the item shell is dropped inert.
    fn into_popped(mut self) -> PoppedItem {
        PoppedItem {
            origin: self.origin,
            data: self.data.take(),
            waiting: self.waiting.take(),
            unbound: self.unbound,
        }
    }

    /// The sweep for a dying `origin`: returns true if the item should be
    /// unlinked entirely (policy `Remove`), false if it stays queued as an
    /// unbound marker.
    fn clear_interpreter(&mut self) -> bool {
        if self.data.is_none() {
            // Already swept (its payload is gone but the marker remains).
            debug_assert!(self.unbound != UnboundOp::Remove);
            return false;
        }
        match self.unbound {
            UnboundOp::Remove => true,
            UnboundOp::Error | UnboundOp::Replace => {
                // The data can be released right here: the sweep runs with
                // the origin interpreter still active. The waiter, if any,
                // stays attached to the marker.
                if let Some(data) = self.data.take() {
                    data.release_quietly();
                }
                false
            }
        }
    }
}

impl Drop for ChannelItem {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            data.release_quietly();
        }
        if let Some(waiting) = self.waiting.take() {
            if waiting.is_armed() {
                waiting.release(false);
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// ItemQueue
////////////////////////////////////////////////////////////////////////////////

/// FIFO of in-flight items. All access happens under the owning channel's
/// lock.
pub(crate) struct ItemQueue {
    items: VecDeque<ChannelItem>,
    next_itemid: ItemId,
}

impl ItemQueue {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
            next_itemid: 1,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Append an item. If a waiter comes along it is bound to the new
    /// item's id and armed here, so that item and armed waiter become
    /// visible atomically (the caller holds the channel lock).
    pub fn push(
        &mut self,
        origin: InterpId,
        data: XiData,
        waiting: Option<Arc<Waiter>>,
        unbound: UnboundOp,
    ) {
        let itemid = self.next_itemid;
        self.next_itemid += 1;
        if let Some(waiting) = &waiting {
            waiting.set_itemid(itemid);
            waiting.arm();
        }
        self.items.push_back(ChannelItem {
            itemid,
            origin,
            data: Some(data),
            waiting,
            unbound,
        });
    }

    pub fn pop(&mut self) -> Option<PoppedItem> {
        self.items.pop_front().map(ChannelItem::into_popped)
    }

    /// Unlink the identified item, if it is still queued.
    pub fn remove(&mut self, itemid: ItemId) -> Option<PoppedItem> {
        let pos = self.items.iter().position(|item| item.itemid == itemid)?;
        self.items.remove(pos).map(ChannelItem::into_popped)
    }

    /// Sweep items originating from a dying interpreter. Runs with that
    /// interpreter still active.
    pub fn clear_interpreter(&mut self, interpid: InterpId) {
        self.items.retain_mut(|item| {
            if item.origin != interpid {
                return true;
            }
            !item.clear_interpreter()
        });
    }
}
