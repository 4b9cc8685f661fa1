//! Lily core: the tagged value representation shared by the interpreter,
//! the foreign call interface, and the embedding API.
//!
//! This crate is deliberately inert — it defines vocabulary (values, heap
//! object layouts, the GC entry node, the exception taxonomy, the message
//! buffer) and no behavior. The collector, the raiser, the interpreter loop,
//! and the coroutine engine all live in `lily-runtime` and operate on the
//! types defined here.

pub mod error;
pub mod flags;
pub mod heap;
pub mod msgbuf;
pub mod siphash;
pub mod value;

pub use error::{ExceptionClass, RaiseError};
pub use flags::{Base, ValueFlags};
pub use heap::{
    ByteStringObj, ContainerObj, CoroutineStatus, FileObj, ForeignObj, FunctionObj, GcEntry,
    GcStatus, HashEntry, HashObj, StringObj,
};
pub use msgbuf::MsgBuf;
pub use value::{Cell, Value};
