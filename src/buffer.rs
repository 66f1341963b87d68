//! Shared byte buffers.
//!
//! Every other value type is deep-copied on its way between interpreters.
//! Byte buffers get a zero-copy path instead: the sender shares a
//! [`BufferSource`], and the receiver unpacks a [`BufferView`] that reads
//! the sender's memory directly. The source object stays pinned in the
//! sending interpreter for as long as any view (or the in-flight data)
//! needs it, and dropping a view schedules the unpin back onto the origin
//! interpreter, where touching the object is legal.
//!
//! Destroying the origin interpreter while foreign views are still alive
//! is a contract violation; it is detected and logged at unpin time, not
//! prevented.

use std::ops::Deref;
use std::slice;

use crate::error::Result;
use crate::interp::{self, InterpId};
use crate::obj::{obj, XObj};
use crate::xid::{Payload, XiData};

////////////////////////////////////////////////////////////////////////////////
// BufferSource
////////////////////////////////////////////////////////////////////////////////

/// A byte region owned by one interpreter and shareable with others.
pub struct BufferSource {
    bytes: Box<[u8]>,
}

impl BufferSource {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: bytes.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// The raw region carried inside cross-interpreter data. Valid only while
/// the packing side keeps the source object pinned.
#[derive(Debug, Clone, Copy)]
pub struct BufRegion {
    ptr: *const u8,
    len: usize,
}

// The region is a borrow of memory owned by the pinned source object;
// whoever holds the region also holds (directly or through XiData) the pin
// that keeps that memory alive.
unsafe impl Send for BufRegion {}
unsafe impl Sync for BufRegion {}

////////////////////////////////////////////////////////////////////////////////
// BufferView
////////////////////////////////////////////////////////////////////////////////

/// A receiver's window into a sender's buffer.
///
/// Dereferences to `[u8]`. Dropping the view releases the pin on the
/// source object under the origin interpreter, which is what makes the
/// zero-copy arrangement safe.
pub struct BufferView {
    origin: InterpId,
    pin: Option<XObj>,
    region: BufRegion,
}

impl BufferView {
    #[inline]
    pub fn origin(&self) -> InterpId {
        self.origin
    }
}

impl Deref for BufferView {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.region.ptr, self.region.len) }
    }
}

impl Drop for BufferView {
    fn drop(&mut self) {
        let pin = match self.pin.take() {
            Some(pin) => pin,
            None => return,
        };
        let host = interp::host();
        if host.current_interp() == self.origin {
            drop(pin);
            return;
        }
        if !host.is_running(self.origin) {
            log::warn!(
                "buffer view outlived its origin interpreter {}; stranding the pinned source",
                self.origin
            );
            std::mem::forget(pin);
            return;
        }
        if let Err(e) = host.call_in(self.origin, Box::new(move || drop(pin))) {
            log::warn!(
                "failed to release buffer pin under interpreter {}: {}",
                self.origin,
                e
            );
        }
    }
}

impl std::fmt::Debug for BufferView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferView")
            .field("origin", &self.origin)
            .field("len", &self.region.len)
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////////////
// packing
////////////////////////////////////////////////////////////////////////////////

/// Builtin packer for [`BufferSource`]: the data pins the source and
/// carries a raw window into it; unpacking clones the pin into the view.
pub(crate) fn pack_buffer(origin: InterpId, value: &XObj) -> Result<XiData> {
    let source = value
        .downcast_ref::<BufferSource>()
        .expect("packer invoked for a value of a different type");
    let region = BufRegion {
        ptr: source.bytes.as_ptr(),
        len: source.bytes.len(),
    };
    Ok(XiData::new(origin, Payload::Buffer(region), unpack_view).with_obj(value.clone()))
}

fn unpack_view(data: &XiData) -> Result<XObj> {
    match data.payload() {
        Payload::Buffer(region) => Ok(obj(BufferView {
            origin: data.origin(),
            pin: data.pinned_obj().cloned(),
            region: *region,
        })),
        _ => unreachable!("buffer unpacker invoked on a different payload"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel;
    use crate::test_utils;
    use crate::xid::UnboundOp;
    use std::sync::Arc;

    #[test]
    fn views_read_the_senders_memory() {
        let a = test_utils::new_interp();
        let b = test_utils::new_interp();
        let cid = channel::create(UnboundOp::Replace).unwrap();

        let source: XObj = Arc::new(BufferSource::new(vec![1, 2, 3, 4]));
        test_utils::with_interp(a, || {
            channel::send_buffer(cid, &source, None).unwrap();
        });

        let view = test_utils::with_interp(b, || {
            channel::recv(cid).unwrap().value().expect("expected a view")
        });
        let view = view.downcast_ref::<BufferView>().expect("expected a view");
        assert_eq!(&**view, &[1, 2, 3, 4]);
        assert_eq!(view.origin(), a);

        channel::destroy(cid).unwrap();
        test_utils::kill(a);
        test_utils::kill(b);
    }

    #[test]
    fn dropping_the_view_unpins_the_source() {
        let a = test_utils::new_interp();
        let b = test_utils::new_interp();
        let cid = channel::create(UnboundOp::Replace).unwrap();

        let source = Arc::new(BufferSource::new(vec![9; 16]));
        let shared: XObj = source.clone();
        let baseline = Arc::strong_count(&source);

        test_utils::with_interp(a, || {
            channel::send_buffer(cid, &shared, None).unwrap();
        });
        assert!(Arc::strong_count(&source) > baseline);

        let view = test_utils::with_interp(b, || {
            channel::recv(cid).unwrap().value().expect("expected a view")
        });
        test_utils::with_interp(b, || drop(view));
        // Every transfer-held pin is gone again.
        assert_eq!(Arc::strong_count(&source), baseline);

        channel::destroy(cid).unwrap();
        test_utils::kill(a);
        test_utils::kill(b);
    }

    #[test]
    fn send_buffer_rejects_other_values() {
        let a = test_utils::new_interp();
        let cid = channel::create(UnboundOp::Replace).unwrap();
        let err = test_utils::with_interp(a, || {
            channel::send_buffer(cid, &obj(1i64), None)
        })
        .unwrap_err();
        assert!(matches!(err, crate::Error::NotShareable(_)));
        channel::destroy(cid).unwrap();
        test_utils::kill(a);
    }

    #[test]
    fn view_outliving_its_origin_is_detected_not_fatal() {
        let a = test_utils::new_interp();
        let b = test_utils::new_interp();
        let cid = channel::create(UnboundOp::Replace).unwrap();

        let source: XObj = Arc::new(BufferSource::new(vec![7, 7, 7]));
        test_utils::with_interp(a, || {
            channel::send_buffer(cid, &source, None).unwrap();
        });
        let view = test_utils::with_interp(b, || {
            channel::recv(cid).unwrap().value().expect("expected a view")
        });

        test_utils::destroy_interp(a);
        {
            let view = view.downcast_ref::<BufferView>().unwrap();
            // The memory is still there (the view holds its own pin); only
            // the place to drop the pin is gone.
            assert_eq!(&**view, &[7, 7, 7]);
        }
        test_utils::with_interp(b, || drop(view));

        channel::destroy(cid).unwrap();
        test_utils::kill(b);
    }
}
