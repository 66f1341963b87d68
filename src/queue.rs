//! Queues.
//!
//! The simpler sibling of [`crate::channel`]: a bounded FIFO with
//! `put`/`get` semantics and no notion of ends or synchronous delivery.
//! What queues add instead is a per-item transfer fallback: when a value's
//! type has no native packer, `put` can serialize it (see
//! [`crate::xid::Fallback`]).
//!
//! Queues are destroyed through an external reference count
//! ([`bind`]/[`release`], or the RAII [`QueueHandle`]) or explicitly with
//! [`destroy`]. Destruction waits out every caller currently touching the
//! queue: the directory hands out the queue only together with a waiter
//! mark, and the destroyer spins on the mark count after flipping the
//! queue dead.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::error::{Error, Result};
use crate::interp::{self, InterpId};
use crate::obj::{obj, XObj};
use crate::util::plock;
use crate::xid::{self, Fallback, Payload, Received, UnboundOp, XiData};

/// Identifies one queue for the lifetime of the process. Ids start at 1,
/// are assigned sequentially and never reused.
pub type QueueId = i64;

/// Per-queue defaults, applied when `put` passes `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDefaults {
    pub unbound: UnboundOp,
    pub fallback: Fallback,
}

////////////////////////////////////////////////////////////////////////////////
// Queue
////////////////////////////////////////////////////////////////////////////////

struct QueueItem {
    origin: InterpId,
    /// None once the origin died and the teardown sweep stripped the
    /// payload.
    data: Option<XiData>,
    unbound: UnboundOp,
}

impl QueueItem {
    /// Sweep for a dying origin; true means unlink the item entirely.
    fn clear_interpreter(&mut self) -> bool {
        if self.data.is_none() {
            debug_assert!(self.unbound != UnboundOp::Remove);
            return false;
        }
        match self.unbound {
            UnboundOp::Remove => true,
            UnboundOp::Error | UnboundOp::Replace => {
                if let Some(data) = self.data.take() {
                    data.release_quietly();
                }
                false
            }
        }
    }
}

impl Drop for QueueItem {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            data.release_quietly();
        }
    }
}

struct QueueInner {
    /// false once destruction has begun; every operation then reports the
    /// queue as gone.
    alive: bool,
    items: VecDeque<QueueItem>,
}

pub(crate) struct Queue {
    /// Callers currently operating on this queue. Mutated only under the
    /// directory lock; read by the destruction spin.
    num_waiters: AtomicIsize,
    inner: Mutex<QueueInner>,
    /// Zero or negative means unbounded.
    maxsize: i64,
    defaults: QueueDefaults,
}

impl Queue {
    fn new(maxsize: i64, defaults: QueueDefaults) -> Self {
        Self {
            num_waiters: AtomicIsize::new(0),
            inner: Mutex::new(QueueInner {
                alive: true,
                items: VecDeque::new(),
            }),
            maxsize,
            defaults,
        }
    }

    /// Flip the queue dead, then wait until every caller that still holds
    /// it has left its critical section. The lock round-trip in the loop
    /// doubles as the memory barrier that makes a leaving waiter visible.
    fn kill_and_wait(&self) {
        {
            let mut inner = plock(&self.inner);
            inner.alive = false;
        }
        while self.num_waiters.load(Ordering::SeqCst) > 0 {
            drop(plock(&self.inner));
        }
    }

    fn add(&self, qid: QueueId, origin: InterpId, data: XiData, unbound: UnboundOp) -> Result<()> {
        let mut inner = plock(&self.inner);
        if !inner.alive {
            drop(inner);
            data.release_quietly();
            return Err(Error::QueueNotFound(qid));
        }
        if self.maxsize > 0 && inner.items.len() as i64 >= self.maxsize {
            drop(inner);
            data.release_quietly();
            return Err(Error::QueueFull(qid));
        }
        inner.items.push_back(QueueItem {
            origin,
            data: Some(data),
            unbound,
        });
        Ok(())
    }

    fn next(&self, qid: QueueId) -> Result<QueueItem> {
        let mut inner = plock(&self.inner);
        if !inner.alive {
            return Err(Error::QueueNotFound(qid));
        }
        inner.items.pop_front().ok_or(Error::QueueEmpty(qid))
    }

    fn count(&self, qid: QueueId) -> Result<usize> {
        let inner = plock(&self.inner);
        if !inner.alive {
            return Err(Error::QueueNotFound(qid));
        }
        Ok(inner.items.len())
    }

    fn is_full(&self, qid: QueueId) -> Result<bool> {
        let inner = plock(&self.inner);
        if !inner.alive {
            return Err(Error::QueueNotFound(qid));
        }
        Ok(self.maxsize > 0 && inner.items.len() as i64 >= self.maxsize)
    }

    fn clear_interpreter(&self, interpid: InterpId) {
        let mut inner = plock(&self.inner);
        if !inner.alive {
            return;
        }
        inner.items.retain_mut(|item| {
            if item.origin != interpid {
                return true;
            }
            !item.clear_interpreter()
        });
    }
}

////////////////////////////////////////////////////////////////////////////////
// the queue directory
////////////////////////////////////////////////////////////////////////////////

struct QueueRef {
    qid: QueueId,
    /// External references ([`bind`]/[`QueueHandle`]). Reaching zero from
    /// above destroys the queue.
    refcount: i64,
    queue: Arc<Queue>,
}

struct QueuesInner {
    head: Vec<QueueRef>,
    next_id: QueueId,
    init_count: usize,
}

pub(crate) struct Queues {
    inner: Mutex<QueuesInner>,
}

/// A queue checked out of the directory, counted as a waiter until
/// dropped.
struct Marked<'a> {
    queues: &'a Queues,
    queue: Arc<Queue>,
}

impl Deref for Marked<'_> {
    type Target = Queue;

    fn deref(&self) -> &Queue {
        &self.queue
    }
}

impl Drop for Marked<'_> {
    fn drop(&mut self) {
        let _g = plock(&self.queues.inner);
        self.queue.num_waiters.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Queues {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueuesInner {
                head: Vec::new(),
                next_id: 1,
                init_count: 0,
            }),
        }
    }

    fn lookup(&self, qid: QueueId) -> Result<Marked<'_>> {
        let g = plock(&self.inner);
        let entry = g
            .head
            .iter()
            .find(|e| e.qid == qid)
            .ok_or(Error::QueueNotFound(qid))?;
        let queue = entry.queue.clone();
        queue.num_waiters.fetch_add(1, Ordering::SeqCst);
        Ok(Marked {
            queues: self,
            queue,
        })
    }

    pub fn create(&self, maxsize: i64, defaults: QueueDefaults) -> Result<QueueId> {
        let mut g = plock(&self.inner);
        if g.next_id < 0 {
            return Err(Error::NoMoreIds("queue"));
        }
        let qid = g.next_id;
        g.next_id += 1;
        g.head.push(QueueRef {
            qid,
            refcount: 0,
            queue: Arc::new(Queue::new(maxsize, defaults)),
        });
        log::debug!("created queue {} (maxsize {})", qid, maxsize);
        Ok(qid)
    }

    pub fn destroy(&self, qid: QueueId) -> Result<()> {
        let queue;
        {
            let mut g = plock(&self.inner);
            let pos = g
                .head
                .iter()
                .position(|e| e.qid == qid)
                .ok_or(Error::QueueNotFound(qid))?;
            queue = g.head.remove(pos).queue;
        }
        queue.kill_and_wait();
        drop(queue);
        log::debug!("destroyed queue {}", qid);
        Ok(())
    }

    pub fn put(
        &self,
        qid: QueueId,
        obj: &XObj,
        unbound: Option<UnboundOp>,
        fallback: Option<Fallback>,
    ) -> Result<()> {
        let interpid = interp::current_interp();
        let marked = self.lookup(qid)?;
        let unbound = unbound.unwrap_or(marked.defaults.unbound);
        let fallback = fallback.unwrap_or(marked.defaults.fallback);
        let data = xid::registry::pack_with_fallback(interpid, obj, fallback)?;
        marked.add(qid, interpid, data, unbound)
    }

    pub fn get(&self, qid: QueueId) -> Result<Received> {
        let item = {
            let marked = self.lookup(qid)?;
            marked.next(qid)?
        };
        receive_item(item)
    }

    pub fn bind(&self, qid: QueueId) -> Result<()> {
        let mut g = plock(&self.inner);
        let entry = g
            .head
            .iter_mut()
            .find(|e| e.qid == qid)
            .ok_or(Error::QueueNotFound(qid))?;
        entry.refcount += 1;
        Ok(())
    }

    /// Drop one external reference; the reference that hits zero destroys
    /// the queue.
    pub fn release(&self, qid: QueueId) -> Result<()> {
        let queue;
        {
            let mut g = plock(&self.inner);
            let pos = g
                .head
                .iter()
                .position(|e| e.qid == qid)
                .ok_or(Error::QueueNotFound(qid))?;
            let entry = &mut g.head[pos];
            if entry.refcount == 0 {
                return Err(Error::QueueNeverBound(qid));
            }
            entry.refcount -= 1;
            if entry.refcount > 0 {
                return Ok(());
            }
            queue = g.head.remove(pos).queue;
        }
        queue.kill_and_wait();
        drop(queue);
        log::debug!("released last reference; destroyed queue {}", qid);
        Ok(())
    }

    pub fn get_maxsize(&self, qid: QueueId) -> Result<i64> {
        let marked = self.lookup(qid)?;
        Ok(marked.maxsize)
    }

    pub fn get_count(&self, qid: QueueId) -> Result<usize> {
        let marked = self.lookup(qid)?;
        marked.count(qid)
    }

    pub fn is_full(&self, qid: QueueId) -> Result<bool> {
        let marked = self.lookup(qid)?;
        marked.is_full(qid)
    }

    pub fn get_defaults(&self, qid: QueueId) -> Result<QueueDefaults> {
        let marked = self.lookup(qid)?;
        Ok(marked.defaults)
    }

    pub fn list_all(&self) -> Vec<(QueueId, QueueDefaults)> {
        plock(&self.inner)
            .head
            .iter()
            .map(|e| (e.qid, e.queue.defaults))
            .collect()
    }

    pub fn clear_interpreter(&self, interpid: InterpId) {
        let g = plock(&self.inner);
        for entry in g.head.iter() {
            entry.queue.clear_interpreter(interpid);
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
                log::warn!("queue module finalized more often than initialized");
                return;
            }
            g.init_count -= 1;
            if g.init_count > 0 {
                return;
            }
            leftovers = std::mem::take(&mut g.head);
        }
        for entry in leftovers {
            log::debug!("queue {} still exists at finalization", entry.qid);
            entry.queue.kill_and_wait();
        }
    }
}

/// Receiver-side completion, sans waiter: rebuild the value and release
/// the packed data under its origin.
fn receive_item(item: QueueItem) -> Result<Received> {
    let mut item = item;
    let data = match item.data.take() {
        Some(data) => data,
        None => {
            return match item.unbound {
                UnboundOp::Error => Err(Error::ItemInterpreterDestroyed(item.origin)),
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
            return Err(e);
        }
    };
    data.release().map(|()| Received::Value(value))
}

static QUEUES: Lazy<Queues> = Lazy::new(Queues::new);

fn global() -> &'static Queues {
    &QUEUES
}

////////////////////////////////////////////////////////////////////////////////
// QueueHandle
////////////////////////////////////////////////////////////////////////////////

/// An RAII wrapper over [`bind`]/[`release`]. Like channel handles, queue
/// handles are shareable values.
pub struct QueueHandle {
    qid: QueueId,
}

impl QueueHandle {
    #[inline]
    pub fn id(&self) -> QueueId {
        self.qid
    }
}

impl Clone for QueueHandle {
    fn clone(&self) -> Self {
        if let Err(e) = global().bind(self.qid) {
            log::warn!("cloning a handle to dead queue {}: {}", self.qid, e);
        }
        QueueHandle { qid: self.qid }
    }
}

impl Drop for QueueHandle {
    fn drop(&mut self) {
        match global().release(self.qid) {
            Ok(()) | Err(Error::QueueNotFound(_)) => {}
            Err(e) => log::warn!("releasing queue handle {}: {}", self.qid, e),
        }
    }
}

impl std::fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "QueueHandle({})", self.qid)
    }
}

/// Builtin packer for [`QueueHandle`].
pub(crate) fn pack_handle(origin: InterpId, value: &XObj) -> Result<XiData> {
    let handle = value
        .downcast_ref::<QueueHandle>()
        .expect("packer invoked for a value of a different type");
    Ok(XiData::new(origin, Payload::Id(handle.id()), |data| {
        match data.payload() {
            Payload::Id(qid) => Ok(obj(handle_for(*qid)?)),
            _ => unreachable!("queue handle unpacker invoked on a different payload"),
        }
    }))
}

////////////////////////////////////////////////////////////////////////////////
// public operations
////////////////////////////////////////////////////////////////////////////////

/// Create a new queue. `maxsize` of zero or less means unbounded.
pub fn create(maxsize: i64, unbound: UnboundOp, fallback: Fallback) -> Result<QueueId> {
    global().create(maxsize, QueueDefaults { unbound, fallback })
}

/// Remove the queue from the directory and dispose of its contents,
/// regardless of its reference count. Waits for concurrent users to
/// finish.
pub fn destroy(qid: QueueId) -> Result<()> {
    global().destroy(qid)
}

/// Every queue in the directory, with its defaults.
pub fn list_all() -> Vec<(QueueId, QueueDefaults)> {
    global().list_all()
}

/// Pack `obj` (applying the fallback policy if its type has no packer) and
/// append it. Fails with [`Error::QueueFull`] at `maxsize`.
///
/// `unbound` and `fallback` default to the queue's own defaults.
pub fn put(
    qid: QueueId,
    obj: &XObj,
    unbound: Option<UnboundOp>,
    fallback: Option<Fallback>,
) -> Result<()> {
    global().put(qid, obj, unbound, fallback)
}

/// Pop the next value. Fails with [`Error::QueueEmpty`] when nothing is
/// queued; unbound items surface according to their policy, as with
/// [`crate::channel::recv`].
pub fn get(qid: QueueId) -> Result<Received> {
    global().get(qid)
}

/// Add one external reference to the queue.
pub fn bind(qid: QueueId) -> Result<()> {
    global().bind(qid)
}

/// Drop one external reference; the last one destroys the queue. Fails
/// with [`Error::QueueNeverBound`] if there is none to drop.
pub fn release(qid: QueueId) -> Result<()> {
    global().release(qid)
}

/// [`bind`] wrapped into RAII.
pub fn handle_for(qid: QueueId) -> Result<QueueHandle> {
    global().bind(qid)?;
    Ok(QueueHandle { qid })
}

pub fn get_maxsize(qid: QueueId) -> Result<i64> {
    global().get_maxsize(qid)
}

pub fn get_count(qid: QueueId) -> Result<usize> {
    global().get_count(qid)
}

pub fn is_full(qid: QueueId) -> Result<bool> {
    global().is_full(qid)
}

pub fn get_defaults(qid: QueueId) -> Result<QueueDefaults> {
    global().get_defaults(qid)
}

/// Count one more user of the queue module.
pub fn init() {
    global().init();
}

/// Release one use of the queue module; the last release kills and drops
/// every queue still in the directory.
pub fn fini() {
    global().fini();
}

pub(crate) fn clear_interpreter(interpid: InterpId) {
    global().clear_interpreter(interpid);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;
    use std::thread;
    use std::time::Duration;

    fn defaults() -> (UnboundOp, Fallback) {
        (UnboundOp::Replace, Fallback::None)
    }

    fn unwrap_str(received: Received) -> String {
        match received {
            Received::Value(v) => v
                .downcast_ref::<String>()
                .expect("expected a string")
                .clone(),
            Received::Unbound => panic!("expected a value, got the unbound marker"),
        }
    }

    #[test]
    fn put_get_round_trip() {
        let a = test_utils::new_interp();
        let b = test_utils::new_interp();
        let (unbound, fallback) = defaults();
        let qid = create(0, unbound, fallback).unwrap();

        test_utils::with_interp(a, || {
            put(qid, &obj(String::from("hello")), None, None).unwrap()
        });
        assert_eq!(get_count(qid).unwrap(), 1);
        let got = test_utils::with_interp(b, || get(qid).unwrap());
        assert_eq!(unwrap_str(got), "hello");
        assert_eq!(get_count(qid).unwrap(), 0);

        destroy(qid).unwrap();
        test_utils::kill(a);
        test_utils::kill(b);
    }

    #[test]
    fn maxsize_is_enforced() {
        let a = test_utils::new_interp();
        let (unbound, fallback) = defaults();
        let qid = create(2, unbound, fallback).unwrap();

        test_utils::with_interp(a, || {
            put(qid, &obj(String::from("a")), None, None).unwrap();
            put(qid, &obj(String::from("b")), None, None).unwrap();
            assert!(matches!(
                put(qid, &obj(String::from("c")), None, None),
                Err(Error::QueueFull(_))
            ));
            assert!(is_full(qid).unwrap());

            assert_eq!(unwrap_str(get(qid).unwrap()), "a");
            put(qid, &obj(String::from("c")), None, None).unwrap();
            assert_eq!(get_count(qid).unwrap(), 2);
        });

        destroy(qid).unwrap();
        test_utils::kill(a);
    }

    #[test]
    fn nonpositive_maxsize_means_unbounded() {
        let a = test_utils::new_interp();
        let (unbound, fallback) = defaults();
        for maxsize in [0, -3] {
            let qid = create(maxsize, unbound, fallback).unwrap();
            test_utils::with_interp(a, || {
                for i in 0..64i64 {
                    put(qid, &obj(i), None, None).unwrap();
                }
            });
            assert!(!is_full(qid).unwrap());
            assert_eq!(get_maxsize(qid).unwrap(), maxsize);
            destroy(qid).unwrap();
        }
        test_utils::kill(a);
    }

    #[test]
    fn get_from_empty_queue_fails() {
        let (unbound, fallback) = defaults();
        let qid = create(0, unbound, fallback).unwrap();
        assert!(matches!(get(qid), Err(Error::QueueEmpty(_))));
        destroy(qid).unwrap();
    }

    #[test]
    fn ids_start_at_one_and_stay_monotonic() {
        let (unbound, fallback) = defaults();
        let id0 = create(0, unbound, fallback).unwrap();
        assert!(id0 >= 1);
        destroy(id0).unwrap();
        let id1 = create(0, unbound, fallback).unwrap();
        assert!(id1 > id0);
        destroy(id1).unwrap();
    }

    #[test]
    fn operations_on_a_destroyed_queue_fail() {
        let (unbound, fallback) = defaults();
        let qid = create(0, unbound, fallback).unwrap();
        destroy(qid).unwrap();
        assert!(matches!(get_count(qid), Err(Error::QueueNotFound(_))));
        assert!(matches!(
            put(qid, &obj(1i64), None, None),
            Err(Error::QueueNotFound(_))
        ));
        assert!(matches!(destroy(qid), Err(Error::QueueNotFound(_))));
    }

    #[test]
    fn refcounting_destroys_on_last_release() {
        let (unbound, fallback) = defaults();
        let qid = create(0, unbound, fallback).unwrap();
        assert!(matches!(release(qid), Err(Error::QueueNeverBound(_))));
        bind(qid).unwrap();
        bind(qid).unwrap();
        release(qid).unwrap();
        assert!(get_count(qid).is_ok());
        release(qid).unwrap();
        assert!(matches!(get_count(qid), Err(Error::QueueNotFound(_))));
    }

    #[test]
    fn fallback_defaults_apply_per_queue() {
        let a = test_utils::new_interp();
        let qid = create(0, UnboundOp::Replace, Fallback::Marshal).unwrap();
        let value = obj(rmpv::Value::from("dynamic"));

        test_utils::with_interp(a, || {
            // The queue's default fallback kicks in.
            put(qid, &value, None, None).unwrap();
            // An explicit override can still forbid serialization.
            assert!(matches!(
                put(qid, &value, None, Some(Fallback::None)),
                Err(Error::NotShareable(_))
            ));
            let got = get(qid).unwrap().value().expect("expected a value");
            assert_eq!(
                got.downcast_ref::<rmpv::Value>().unwrap(),
                &rmpv::Value::from("dynamic")
            );
        });

        assert_eq!(
            get_defaults(qid).unwrap(),
            QueueDefaults {
                unbound: UnboundOp::Replace,
                fallback: Fallback::Marshal
            }
        );
        destroy(qid).unwrap();
        test_utils::kill(a);
    }

    #[test]
    fn unbound_policies_after_sender_death() {
        let b = test_utils::new_interp();
        for (op, expect_err, expect_unbound, expect_empty) in [
            (UnboundOp::Error, true, false, false),
            (UnboundOp::Replace, false, true, false),
            (UnboundOp::Remove, false, false, true),
        ] {
            let a = test_utils::new_interp();
            let qid = create(0, UnboundOp::Replace, Fallback::None).unwrap();
            test_utils::with_interp(a, || {
                put(qid, &obj(5i64), Some(op), None).unwrap()
            });
            test_utils::destroy_interp(a);

            let result = test_utils::with_interp(b, || get(qid));
            match result {
                Err(Error::ItemInterpreterDestroyed(id)) => {
                    assert!(expect_err);
                    assert_eq!(id, a);
                }
                Ok(Received::Unbound) => assert!(expect_unbound),
                Err(Error::QueueEmpty(_)) => assert!(expect_empty),
                other => panic!("unexpected get outcome: {:?}", other),
            }
            assert_eq!(get_count(qid).unwrap(), 0);
            destroy(qid).unwrap();
        }
        test_utils::kill(b);
    }

    #[test]
    fn list_all_reports_ids_and_defaults() {
        let qid = create(5, UnboundOp::Error, Fallback::Pickle).unwrap();
        let listed = list_all();
        let entry = listed.iter().find(|(id, _)| *id == qid).unwrap();
        assert_eq!(
            entry.1,
            QueueDefaults {
                unbound: UnboundOp::Error,
                fallback: Fallback::Pickle
            }
        );
        destroy(qid).unwrap();
    }

    #[test]
    fn handles_travel_through_queues() {
        let a = test_utils::new_interp();
        let b = test_utils::new_interp();
        let (unbound, fallback) = defaults();
        let carrier = create(0, unbound, fallback).unwrap();
        let target = create(0, unbound, fallback).unwrap();
        let handle = handle_for(target).unwrap();

        test_utils::with_interp(a, || {
            put(carrier, &obj(handle.clone()), None, None).unwrap();
            put(target, &obj(17i64), None, None).unwrap();
        });
        test_utils::with_interp(b, || {
            let got = get(carrier).unwrap().value().expect("expected a handle");
            let got = got
                .downcast_ref::<QueueHandle>()
                .expect("expected a queue handle");
            assert_eq!(got.id(), target);
            let value = get(got.id()).unwrap().value().expect("expected a value");
            assert_eq!(*value.downcast_ref::<i64>().unwrap(), 17);
        });

        // The last handle going away destroys the target queue.
        drop(handle);
        assert!(matches!(get_count(target), Err(Error::QueueNotFound(_))));
        destroy(carrier).unwrap();
        test_utils::kill(a);
        test_utils::kill(b);
    }

    #[test]
    fn destroy_waits_out_concurrent_users() {
        let a = test_utils::new_interp();
        let (unbound, fallback) = defaults();
        let qid = create(0, unbound, fallback).unwrap();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                thread::spawn(move || {
                    test_utils::with_interp(a, || loop {
                        match put(qid, &obj(1i64), None, None) {
                            Ok(()) => {
                                let _ = get(qid);
                            }
                            Err(Error::QueueNotFound(_)) => return,
                            Err(e) => panic!("worker failed: {}", e),
                        }
                        thread::sleep(Duration::from_millis(1));
                    })
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        destroy(qid).unwrap();
        for worker in workers {
            worker.join().unwrap();
        }
        test_utils::kill(a);
    }

    #[test]
    fn module_init_counting_drains_on_last_fini() {
        let reg = Queues::new();
        reg.init();
        reg.init();
        let qid = reg
            .create(
                0,
                QueueDefaults {
                    unbound: UnboundOp::Replace,
                    fallback: Fallback::None,
                },
            )
            .unwrap();
        reg.fini();
        assert!(reg.get_count(qid).is_ok());
        reg.fini();
        assert!(matches!(
            reg.get_count(qid),
            Err(Error::QueueNotFound(_))
        ));
    }
}
