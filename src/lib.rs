//! An embedded, isolated, interruptible JavaScript execution runtime.
//!
//! v8cell sits between a host process (Python, Ruby, anything with a C
//! FFI) and the V8 engine. Each runtime context owns one isolate, one
//! persistent JS context, one message-pump thread, a registry of opaque
//! value handles and a set of cancelable async tasks. All isolate access
//! is funnelled through the pump thread; foreign threads only submit work
//! and observe results through the host callback or returned handles.
//!
//! The host callback runs on the pump thread while the isolate is
//! entered. It must hand its work off to another thread and return
//! promptly. It must never call back into the same runtime context, since
//! doing so would deadlock the pump.

mod breaker;
mod callback;
mod collector;
mod context;
mod eval;
mod exceptions;
pub mod ffi;
mod heap;
mod isolate;
mod manager;
mod memory;
mod object;
mod promise;
mod task;
mod value;

pub use callback::HostCallback;
pub use context::context_count;
pub use context::free_context;
pub use context::get_context;
pub use context::init_context;
pub use context::init_v8;
pub use context::v8_version;
pub use context::JsContext;
pub use value::RawPayload;
pub use value::RawValue;
pub use value::ValueHandle;
pub use value::ValueTag;
