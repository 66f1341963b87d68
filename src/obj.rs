//! Host values.
//!
//! A host value is whatever an interpreter keeps on its own heap. We only
//! ever see it as an [`XObj`]: a reference-counted, dynamically typed
//! handle. The crate never inspects a value except through a registered
//! packer for its runtime type, and never hands a value from one
//! interpreter to code running under another. That isolation is the host's
//! policy; the type system only provides the handle.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;

/// A handle to one interpreter-owned value.
pub type XObj = Arc<dyn Any + Send + Sync>;

/// Wrap a plain Rust value into a host value handle.
#[inline]
pub fn obj<T: Any + Send + Sync>(value: T) -> XObj {
    Arc::new(value)
}

/// Borrow the concrete value behind a handle, if it has that type.
#[inline]
pub fn obj_ref<T: Any>(obj: &XObj) -> Option<&T> {
    obj.downcast_ref::<T>()
}

////////////////////////////////////////////////////////////////////////////////
// TypeTag
////////////////////////////////////////////////////////////////////////////////

/// Serialization hook used by the queue fallback machinery: encode the
/// tagged value into interpreter-independent bytes.
pub type EncodeHook = fn(&Tagged) -> Result<Vec<u8>>;

/// The matching decode hook. It is stored inside the packed data by
/// function pointer, so it stays callable from any interpreter.
pub type DecodeHook = fn(&[u8]) -> Result<XObj>;

/// Describes a type defined by the embedding at runtime.
///
/// Interpreters create their own tags (tags are values too, owned by one
/// interpreter); a packer for the tagged type is then registered with the
/// data registry, optionally holding the tag weakly so that the tag can die
/// with its interpreter.
pub struct TypeTag {
    name: String,
    marshal: Option<(EncodeHook, DecodeHook)>,
    pickle: Option<(EncodeHook, DecodeHook)>,
}

impl TypeTag {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            marshal: None,
            pickle: None,
        }
    }

    /// Attach a marshal codec (the cheap, flat-data serializer).
    pub fn with_marshal(mut self, encode: EncodeHook, decode: DecodeHook) -> Self {
        self.marshal = Some((encode, decode));
        self
    }

    /// Attach a pickle codec (the deep serializer of last resort).
    pub fn with_pickle(mut self, encode: EncodeHook, decode: DecodeHook) -> Self {
        self.pickle = Some((encode, decode));
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub(crate) fn marshal_hooks(&self) -> Option<(EncodeHook, DecodeHook)> {
        self.marshal
    }

    #[inline]
    pub(crate) fn pickle_hooks(&self) -> Option<(EncodeHook, DecodeHook)> {
        self.pickle
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeTag").field("name", &self.name).finish()
    }
}

/// A value of a runtime-defined type: the tag plus a structured body.
///
/// The body is modelled as a msgpack value, which is what dynamically
/// created host types carry around anyway.
#[derive(Debug)]
pub struct Tagged {
    pub tag: Arc<TypeTag>,
    pub body: rmpv::Value,
}

impl Tagged {
    pub fn new(tag: Arc<TypeTag>, body: rmpv::Value) -> Self {
        Self { tag, body }
    }
}
