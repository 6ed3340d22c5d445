//! isoworker structure: the value model shared by both ends of a worker
//! connection.
//!
//! - `Value`: an object graph with shared nodes, cycles and special kinds
//! - `Structure`: the JSON wire document for one message
//! - `serialize` / `deserialize`: the codec between the two
//! - `MessageChannel` / `MessagePort`: entangled port pairs that can be
//!   transferred across a connection
//!
//! # Example
//!
//! ```rust
//! use isoworker_structure::{deserialize, serialize, Value};
//!
//! let list = Value::array([Value::from("x")]);
//! if let Value::Array(items) = &list {
//!     items.lock().push(list.clone());
//! }
//!
//! let structure = serialize(&list).unwrap();
//! let copy = deserialize(&structure).unwrap().data;
//! assert!(copy.at(1).unwrap().ptr_eq(&copy));
//! ```

mod buffer;
mod channel;
mod codec;
mod error;
mod event;
mod value;
mod wire;

pub use buffer::{Buffer, BufferKind, Element};
pub use channel::{
    ChannelFactory, MessageChannel, MessagePort, ReceiveFn, SendFn, Side, Transferable,
};
pub use codec::{deserialize, serialize, Deserialized, MAX_DEPTH};
pub use error::{Error, Result};
pub use event::{EventTarget, Listener, ListenerId, MessageEvent};
pub use value::{ErrorKind, ErrorValue, Object, RegExp, Shared, Value};
pub use wire::{ref_id, ChannelId, Ref, SpecialKind, Structure};
