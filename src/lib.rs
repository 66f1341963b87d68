//! Typed, bounded, thread-safe communication between isolated
//! interpreters that share one address space.
//!
//! The embedding runtime owns the interpreters (see [`interp::Host`]);
//! this crate owns what travels between them:
//!
//! - [Channels](channel): multi-producer/multi-consumer FIFO conduits
//!   with per-interpreter end binding, optional synchronous send, and a
//!   graceful drain-and-close mode.
//! - [Queues](queue): bounded `put`/`get` FIFOs with per-item
//!   serialization fallback.
//!
//! Values never cross the boundary alive. A send packs the value into
//! [cross-interpreter data](xid), an interpreter-independent record,
//! and the matching receive rebuilds a fresh, equivalent value in the
//! receiving interpreter. The record remembers its origin interpreter and
//! is always disposed of under it, which is what keeps item ownership
//! sound even when the sender dies while items are still in flight.
//!
//! ```no_run
//! use interlink::{channel, obj, UnboundOp};
//!
//! // In interpreter A:
//! let cid = channel::create(UnboundOp::Replace)?;
//! channel::send(cid, &obj(42i64), None)?;
//!
//! // In interpreter B:
//! let received = channel::recv(cid)?;
//! # Ok::<(), interlink::Error>(())
//! ```

pub mod buffer;
pub mod channel;
pub mod error;
pub mod interp;
pub mod obj;
pub mod queue;
#[cfg(test)]
mod test_utils;
mod util;
pub mod waiter;
pub mod xid;

pub use error::{Error, Result};
pub use interp::{clear_interpreter, current_interp, set_host, Host, InterpId, UNKNOWN_INTERPID};
pub use obj::{obj, XObj};
pub use xid::{Fallback, Received, UnboundOp};
