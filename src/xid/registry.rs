//! The shareable-type registry.
//!
//! Packing is resolved by the runtime type of the value. Builtin types
//! (integers, strings, byte buffers, channel and queue handles) live in a
//! process-wide table that is populated lazily, under its mutex, the first
//! time anything is looked up. Types defined by the embedding at runtime
//! are registered per interpreter; lookup walks the caller's local table
//! first, then the global one.
//!
//! A dynamic registration may hold its [`TypeTag`] weakly. Once the tag is
//! gone (usually because its interpreter died), the entry is skipped and
//! pruned by the next lookup that walks past it.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::interp::InterpId;
use crate::obj::{obj, Tagged, TypeTag, XObj};
use crate::util::plock;
use crate::xid::{Fallback, Payload, XiData};

/// Converts a value into cross-interpreter data. The first argument is the
/// calling interpreter, recorded as the data's origin.
pub type PackFn = fn(InterpId, &XObj) -> Result<XiData>;

////////////////////////////////////////////////////////////////////////////////
// tables
////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum TypeKey {
    /// A compile-time Rust type.
    Static(TypeId),
    /// A runtime [`TypeTag`], keyed by tag identity.
    Dynamic(usize),
}

fn key_of(value: &XObj) -> TypeKey {
    if let Some(tagged) = value.downcast_ref::<Tagged>() {
        TypeKey::Dynamic(Arc::as_ptr(&tagged.tag) as usize)
    } else {
        TypeKey::Static((**value).type_id())
    }
}

enum TagHold {
    /// Builtin or static registration; nothing to keep alive.
    None,
    Strong(#[allow(dead_code)] Arc<TypeTag>),
    Weak(Weak<TypeTag>),
}

struct Entry {
    key: TypeKey,
    pack: PackFn,
    hold: TagHold,
}

#[derive(Default)]
struct Table {
    entries: Vec<Entry>,
}

impl Table {
    /// Find `key`, pruning dangling weak registrations on the way.
    fn lookup(&mut self, key: TypeKey) -> Option<PackFn> {
        let mut i = 0;
        while i < self.entries.len() {
            if let TagHold::Weak(weak) = &self.entries[i].hold {
                if weak.upgrade().is_none() {
                    self.entries.remove(i);
                    continue;
                }
            }
            if self.entries[i].key == key {
                return Some(self.entries[i].pack);
            }
            i += 1;
        }
        None
    }

    fn register(&mut self, key: TypeKey, pack: PackFn, hold: TagHold) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.key == key) {
            entry.pack = pack;
            entry.hold = hold;
        } else {
            self.entries.push(Entry { key, pack, hold });
        }
    }

    fn unregister(&mut self, key: TypeKey) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.key != key);
        self.entries.len() != before
    }
}

struct GlobalTable {
    initialized: bool,
    table: Table,
}

static GLOBAL: Lazy<Mutex<GlobalTable>> = Lazy::new(|| {
    Mutex::new(GlobalTable {
        initialized: false,
        table: Table::default(),
    })
});

static LOCAL: Lazy<Mutex<HashMap<InterpId, Table>>> = Lazy::new(Default::default);

fn install_builtins(table: &mut Table) {
    table.register(TypeKey::Static(TypeId::of::<()>()), pack_unit, TagHold::None);
    table.register(TypeKey::Static(TypeId::of::<bool>()), pack_bool, TagHold::None);
    table.register(TypeKey::Static(TypeId::of::<i64>()), pack_int, TagHold::None);
    table.register(TypeKey::Static(TypeId::of::<f64>()), pack_float, TagHold::None);
    table.register(
        TypeKey::Static(TypeId::of::<String>()),
        pack_str,
        TagHold::None,
    );
    table.register(
        TypeKey::Static(TypeId::of::<Vec<u8>>()),
        pack_bytes,
        TagHold::None,
    );
    table.register(
        TypeKey::Static(TypeId::of::<crate::channel::ChannelHandle>()),
        crate::channel::pack_handle,
        TagHold::None,
    );
    table.register(
        TypeKey::Static(TypeId::of::<crate::queue::QueueHandle>()),
        crate::queue::pack_handle,
        TagHold::None,
    );
    table.register(
        TypeKey::Static(TypeId::of::<crate::buffer::BufferSource>()),
        crate::buffer::pack_buffer,
        TagHold::None,
    );
}

////////////////////////////////////////////////////////////////////////////////
// registration API
////////////////////////////////////////////////////////////////////////////////

/// Register a packer for the Rust type `T` in the calling interpreter's
/// local table, shadowing any builtin for the same type.
pub fn register_type<T: Any>(interpid: InterpId, pack: PackFn) {
    let mut locals = plock(&LOCAL);
    locals.entry(interpid).or_default().register(
        TypeKey::Static(TypeId::of::<T>()),
        pack,
        TagHold::None,
    );
}

/// Remove a local registration for `T`. Returns whether one existed.
pub fn unregister_type<T: Any>(interpid: InterpId) -> bool {
    let mut locals = plock(&LOCAL);
    match locals.get_mut(&interpid) {
        Some(table) => table.unregister(TypeKey::Static(TypeId::of::<T>())),
        None => false,
    }
}

/// Register a packer for values carrying `tag`, in the calling
/// interpreter's local table.
///
/// With `weak` the registry does not keep the tag alive; once the last
/// strong reference is gone the entry silently stops matching and is pruned
/// by a later lookup.
pub fn register_tag(interpid: InterpId, tag: &Arc<TypeTag>, pack: PackFn, weak: bool) {
    let key = TypeKey::Dynamic(Arc::as_ptr(tag) as usize);
    let hold = if weak {
        TagHold::Weak(Arc::downgrade(tag))
    } else {
        TagHold::Strong(tag.clone())
    };
    let mut locals = plock(&LOCAL);
    locals.entry(interpid).or_default().register(key, pack, hold);
}

/// Remove the registration for `tag`. Returns whether one existed.
pub fn unregister_tag(interpid: InterpId, tag: &Arc<TypeTag>) -> bool {
    let key = TypeKey::Dynamic(Arc::as_ptr(tag) as usize);
    let mut locals = plock(&LOCAL);
    match locals.get_mut(&interpid) {
        Some(table) => table.unregister(key),
        None => false,
    }
}

/// Drop the whole local table of a dying interpreter.
pub(crate) fn clear_interpreter(interpid: InterpId) {
    plock(&LOCAL).remove(&interpid);
}

////////////////////////////////////////////////////////////////////////////////
// lookup & packing
////////////////////////////////////////////////////////////////////////////////

/// Resolve the packer for `value`: local table first, then global.
pub fn lookup(interpid: InterpId, value: &XObj) -> Option<PackFn> {
    let key = key_of(value);
    {
        let mut locals = plock(&LOCAL);
        if let Some(table) = locals.get_mut(&interpid) {
            if let Some(pack) = table.lookup(key) {
                return Some(pack);
            }
        }
    }
    let mut global = plock(&GLOBAL);
    if !global.initialized {
        install_builtins(&mut global.table);
        global.initialized = true;
    }
    global.table.lookup(key)
}

/// Whether `value` can be packed at all (no fallback considered).
pub fn check(interpid: InterpId, value: &XObj) -> bool {
    lookup(interpid, value).is_some()
}

/// Pack `value` for the trip out of `interpid`.
pub fn pack(interpid: InterpId, value: &XObj) -> Result<XiData> {
    match lookup(interpid, value) {
        Some(pack) => {
            let data = pack(interpid, value)?;
            debug_assert_eq!(data.origin(), interpid);
            Ok(data)
        }
        None => Err(Error::NotShareable(type_label(value))),
    }
}

/// Pack `value`, trying the serialization fallbacks in order when no
/// packer is registered for its type.
pub fn pack_with_fallback(interpid: InterpId, value: &XObj, fallback: Fallback) -> Result<XiData> {
    match pack(interpid, value) {
        Err(Error::NotShareable(label)) if fallback > Fallback::None => {
            if let Some(data) = try_marshal(interpid, value)? {
                return Ok(data);
            }
            if fallback == Fallback::Pickle {
                if let Some(data) = try_pickle(interpid, value)? {
                    return Ok(data);
                }
            }
            Err(Error::NotShareable(label))
        }
        other => other,
    }
}

fn type_label(value: &XObj) -> String {
    match value.downcast_ref::<Tagged>() {
        Some(tagged) => format!("value of type '{}'", tagged.tag.name()),
        None => String::from("value of unregistered type"),
    }
}

////////////////////////////////////////////////////////////////////////////////
// fallback serialization
////////////////////////////////////////////////////////////////////////////////

/// Encode with the flat serializer (msgpack). Exposed for embeddings that
/// build their own tag hooks on top of it.
pub fn marshal<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(value)?)
}

/// Decode the flat serializer's output.
pub fn unmarshal<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Encode with the deep serializer.
pub fn pickle<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Decode the deep serializer's output.
pub fn unpickle<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn marshalled(interpid: InterpId, bytes: Vec<u8>, decode: crate::obj::DecodeHook) -> XiData {
    XiData::new(
        interpid,
        Payload::Marshalled {
            bytes: bytes.into_boxed_slice(),
            decode,
        },
        unpack_marshalled,
    )
}

fn try_marshal(interpid: InterpId, value: &XObj) -> Result<Option<XiData>> {
    if let Some(v) = value.downcast_ref::<rmpv::Value>() {
        return Ok(Some(marshalled(interpid, marshal(v)?, decode_rmpv)));
    }
    if let Some(tagged) = value.downcast_ref::<Tagged>() {
        if let Some((encode, decode)) = tagged.tag.marshal_hooks() {
            return Ok(Some(marshalled(interpid, encode(tagged)?, decode)));
        }
    }
    Ok(None)
}

fn try_pickle(interpid: InterpId, value: &XObj) -> Result<Option<XiData>> {
    if let Some(v) = value.downcast_ref::<serde_json::Value>() {
        return Ok(Some(marshalled(interpid, pickle(v)?, decode_json)));
    }
    if let Some(tagged) = value.downcast_ref::<Tagged>() {
        if let Some((encode, decode)) = tagged.tag.pickle_hooks() {
            return Ok(Some(marshalled(interpid, encode(tagged)?, decode)));
        }
    }
    Ok(None)
}

fn decode_rmpv(bytes: &[u8]) -> Result<XObj> {
    Ok(obj(unmarshal::<rmpv::Value>(bytes)?))
}

fn decode_json(bytes: &[u8]) -> Result<XObj> {
    Ok(obj(unpickle::<serde_json::Value>(bytes)?))
}

fn unpack_marshalled(data: &XiData) -> Result<XObj> {
    match data.payload() {
        Payload::Marshalled { bytes, decode } => decode(bytes),
        _ => unreachable!("marshalled unpacker invoked on a different payload"),
    }
}

////////////////////////////////////////////////////////////////////////////////
// builtin packers
////////////////////////////////////////////////////////////////////////////////

fn expect_cast<T: Any>(value: &XObj) -> &T {
    value
        .downcast_ref::<T>()
        .expect("packer invoked for a value of a different type")
}

fn pack_unit(origin: InterpId, _value: &XObj) -> Result<XiData> {
    Ok(XiData::new(origin, Payload::None, |_| Ok(obj(()))))
}

fn pack_bool(origin: InterpId, value: &XObj) -> Result<XiData> {
    let b = *expect_cast::<bool>(value);
    Ok(XiData::new(origin, Payload::Bool(b), |data| {
        match data.payload() {
            Payload::Bool(b) => Ok(obj(*b)),
            _ => unreachable!("bool unpacker invoked on a different payload"),
        }
    }))
}

fn pack_int(origin: InterpId, value: &XObj) -> Result<XiData> {
    let i = *expect_cast::<i64>(value);
    Ok(XiData::new(origin, Payload::Int(i), |data| {
        match data.payload() {
            Payload::Int(i) => Ok(obj(*i)),
            _ => unreachable!("int unpacker invoked on a different payload"),
        }
    }))
}

fn pack_float(origin: InterpId, value: &XObj) -> Result<XiData> {
    let f = *expect_cast::<f64>(value);
    Ok(XiData::new(origin, Payload::Float(f), |data| {
        match data.payload() {
            Payload::Float(f) => Ok(obj(*f)),
            _ => unreachable!("float unpacker invoked on a different payload"),
        }
    }))
}

fn pack_str(origin: InterpId, value: &XObj) -> Result<XiData> {
    let s = expect_cast::<String>(value);
    Ok(XiData::new(
        origin,
        Payload::Str(s.clone().into_boxed_str()),
        |data| match data.payload() {
            Payload::Str(s) => Ok(obj(s.to_string())),
            _ => unreachable!("string unpacker invoked on a different payload"),
        },
    ))
}

fn pack_bytes(origin: InterpId, value: &XObj) -> Result<XiData> {
    let b = expect_cast::<Vec<u8>>(value);
    Ok(XiData::new(
        origin,
        Payload::Bytes(b.clone().into_boxed_slice()),
        |data| match data.payload() {
            Payload::Bytes(b) => Ok(obj(b.to_vec())),
            _ => unreachable!("bytes unpacker invoked on a different payload"),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    struct Point {
        x: i64,
    }

    fn pack_point(origin: InterpId, value: &XObj) -> Result<XiData> {
        let p = expect_cast::<Point>(value);
        Ok(XiData::new(origin, Payload::Int(p.x), |data| {
            match data.payload() {
                Payload::Int(x) => Ok(obj(Point { x: *x })),
                _ => unreachable!(),
            }
        }))
    }

    #[test]
    fn builtins_round_trip() {
        let a = test_utils::new_interp();
        test_utils::with_interp(a, || {
            let data = pack(a, &obj(42i64)).unwrap();
            assert_eq!(*data.unpack().unwrap().downcast_ref::<i64>().unwrap(), 42);
            data.release_quietly();

            let data = pack(a, &obj(String::from("hi"))).unwrap();
            assert_eq!(
                data.unpack().unwrap().downcast_ref::<String>().unwrap(),
                "hi"
            );
            data.release_quietly();

            let data = pack(a, &obj(vec![1u8, 2, 3])).unwrap();
            assert_eq!(
                data.unpack().unwrap().downcast_ref::<Vec<u8>>().unwrap(),
                &[1, 2, 3]
            );
            data.release_quietly();
        });
        test_utils::kill(a);
    }

    #[test]
    fn unregistered_type_is_not_shareable() {
        let a = test_utils::new_interp();
        let value = obj(Point { x: 1 });
        assert!(!check(a, &value));
        assert!(matches!(pack(a, &value), Err(Error::NotShareable(_))));
        test_utils::kill(a);
    }

    #[test]
    fn local_registration_wins_and_unregisters() {
        let a = test_utils::new_interp();
        register_type::<Point>(a, pack_point);
        let value = obj(Point { x: 7 });
        let data = pack(a, &value).unwrap();
        let back = data.unpack().unwrap();
        assert_eq!(back.downcast_ref::<Point>().unwrap().x, 7);
        data.release_quietly();

        assert!(unregister_type::<Point>(a));
        assert!(!check(a, &value));
        test_utils::kill(a);
    }

    #[test]
    fn local_tables_are_per_interpreter() {
        let a = test_utils::new_interp();
        let b = test_utils::new_interp();
        register_type::<Point>(a, pack_point);
        let value = obj(Point { x: 1 });
        assert!(check(a, &value));
        assert!(!check(b, &value));
        clear_interpreter(a);
        assert!(!check(a, &value));
        test_utils::kill(a);
        test_utils::kill(b);
    }

    fn pack_tagged_as_msgpack(origin: InterpId, value: &XObj) -> Result<XiData> {
        let tagged = expect_cast::<Tagged>(value);
        Ok(marshalled(origin, marshal(&tagged.body)?, decode_rmpv))
    }

    #[test]
    fn weak_tag_registrations_are_pruned() {
        let a = test_utils::new_interp();
        let tag = Arc::new(TypeTag::new("ephemeral"));
        register_tag(a, &tag, pack_tagged_as_msgpack, true);

        let value = obj(Tagged::new(tag.clone(), rmpv::Value::from(5)));
        assert!(check(a, &value));

        drop(value);
        drop(tag);
        // The tag is gone; a fresh lookup misses and prunes the entry.
        let other = obj(Point { x: 0 });
        assert!(!check(a, &other));
        assert!(plock(&LOCAL).get_mut(&a).map_or(true, |t| t.entries.is_empty()));
        test_utils::kill(a);
    }

    fn pack_int_doubled(origin: InterpId, value: &XObj) -> Result<XiData> {
        let i = expect_cast::<i64>(value);
        Ok(XiData::new(origin, Payload::Int(i * 2), |data| {
            match data.payload() {
                Payload::Int(i) => Ok(obj(*i)),
                _ => unreachable!(),
            }
        }))
    }

    #[test]
    fn local_registrations_shadow_builtins() {
        let a = test_utils::new_interp();
        let b = test_utils::new_interp();
        register_type::<i64>(a, pack_int_doubled);

        let value = obj(21i64);
        let data = pack(a, &value).unwrap();
        assert_eq!(*data.unpack().unwrap().downcast_ref::<i64>().unwrap(), 42);
        data.release_quietly();

        // Other interpreters still get the builtin behavior.
        let data = pack(b, &value).unwrap();
        assert_eq!(*data.unpack().unwrap().downcast_ref::<i64>().unwrap(), 21);
        data.release_quietly();

        assert!(unregister_type::<i64>(a));
        let data = pack(a, &value).unwrap();
        assert_eq!(*data.unpack().unwrap().downcast_ref::<i64>().unwrap(), 21);
        data.release_quietly();
        test_utils::kill(a);
        test_utils::kill(b);
    }

    #[test]
    fn marshal_fallback_handles_msgpack_values() {
        let a = test_utils::new_interp();
        let value = obj(rmpv::Value::from("payload"));
        assert!(matches!(
            pack_with_fallback(a, &value, Fallback::None),
            Err(Error::NotShareable(_))
        ));
        let data = pack_with_fallback(a, &value, Fallback::Marshal).unwrap();
        let back = data.unpack().unwrap();
        assert_eq!(
            back.downcast_ref::<rmpv::Value>().unwrap(),
            &rmpv::Value::from("payload")
        );
        data.release_quietly();
        test_utils::kill(a);
    }

    #[test]
    fn pickle_fallback_handles_json_values() {
        let a = test_utils::new_interp();
        let value = obj(serde_json::json!({"k": [1, 2, 3]}));
        // Marshal alone is not enough for the deep representation.
        assert!(matches!(
            pack_with_fallback(a, &value, Fallback::Marshal),
            Err(Error::NotShareable(_))
        ));
        let data = pack_with_fallback(a, &value, Fallback::Pickle).unwrap();
        let back = data.unpack().unwrap();
        assert_eq!(
            back.downcast_ref::<serde_json::Value>().unwrap(),
            &serde_json::json!({"k": [1, 2, 3]})
        );
        data.release_quietly();
        test_utils::kill(a);
    }

    #[test]
    fn tag_hooks_feed_the_fallback() {
        let a = test_utils::new_interp();
        let tag = Arc::new(TypeTag::new("scripted").with_marshal(
            |tagged| marshal(&tagged.body),
            |bytes| Ok(obj(unmarshal::<rmpv::Value>(bytes)?)),
        ));
        let value = obj(Tagged::new(tag, rmpv::Value::from(9)));
        let data = pack_with_fallback(a, &value, Fallback::Marshal).unwrap();
        let back = data.unpack().unwrap();
        assert_eq!(
            back.downcast_ref::<rmpv::Value>().unwrap(),
            &rmpv::Value::from(9)
        );
        data.release_quietly();
        test_utils::kill(a);
    }
}
