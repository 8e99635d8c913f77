//! The flat C ABI over id-based runtime contexts.
//!
//! Every entry point validates the context id and any value handles it is
//! given; junk resolves to a `value_exception` handle (or a null/zero
//! return where no value can be produced), never to a crash. String inputs
//! cross as `(pointer, length)` utf-8 with no terminator expected.

use crate::callback::HostCallback;
use crate::context;
use crate::context::JsContext;
use crate::value::ValueHandle;
use crate::value::ValueTag;
use lazy_static::lazy_static;
use std::ffi::c_char;
use std::ffi::CStr;
use std::ffi::CString;
use std::sync::Arc;

fn with_context<T>(context_id: u64, default: T, op: impl FnOnce(Arc<JsContext>) -> T) -> T {
    match context::get_context(context_id) {
        Some(ctx) => op(ctx),
        None => default,
    }
}

unsafe fn flags_str<'a>(ptr: *const c_char) -> &'a str {
    if ptr.is_null() {
        return "";
    }
    CStr::from_ptr(ptr).to_str().unwrap_or("")
}

unsafe fn utf8_from_parts<'a>(ptr: *const u8, len: u64) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    let bytes = std::slice::from_raw_parts(ptr, len as usize);
    std::str::from_utf8(bytes).ok()
}

/// Initializes the engine. At most the first call takes effect. The icu
/// and snapshot paths are accepted for ABI compatibility; both data sets
/// are linked into the engine and the paths go unused.
#[no_mangle]
pub extern "C" fn vc_init_v8(
    v8_flags: *const c_char,
    _icu_path: *const c_char,
    _snapshot_path: *const c_char,
) {
    let flags = unsafe { flags_str(v8_flags) };
    context::init_v8(flags);
}

#[no_mangle]
pub extern "C" fn vc_v8_version() -> *const c_char {
    lazy_static! {
        static ref VERSION: CString =
            CString::new(context::v8_version()).unwrap_or_default();
    }
    VERSION.as_ptr()
}

/// Creates a runtime context. The callback is invoked from the pump
/// thread; it must return promptly and must not call back into this
/// context (see the reentrancy contract in the crate docs).
#[no_mangle]
pub extern "C" fn vc_init_context(host_callback: HostCallback) -> u64 {
    context::init_context(host_callback)
}

/// Tears the context down. Blocks until every pending async callback has
/// fired exactly once.
#[no_mangle]
pub extern "C" fn vc_free_context(context_id: u64) {
    context::free_context(context_id);
}

#[no_mangle]
pub extern "C" fn vc_context_count() -> usize {
    context::context_count()
}

#[no_mangle]
pub extern "C" fn vc_set_hard_memory_limit(context_id: u64, limit: usize) {
    with_context(context_id, (), |ctx| ctx.set_hard_memory_limit(limit));
}

#[no_mangle]
pub extern "C" fn vc_set_soft_memory_limit(context_id: u64, limit: usize) {
    with_context(context_id, (), |ctx| ctx.set_soft_memory_limit(limit));
}

#[no_mangle]
pub extern "C" fn vc_hard_memory_limit_reached(context_id: u64) -> bool {
    with_context(context_id, false, |ctx| ctx.hard_memory_limit_reached())
}

#[no_mangle]
pub extern "C" fn vc_soft_memory_limit_reached(context_id: u64) -> bool {
    with_context(context_id, false, |ctx| ctx.soft_memory_limit_reached())
}

#[no_mangle]
pub extern "C" fn vc_low_memory_notification(context_id: u64) {
    with_context(context_id, (), |ctx| ctx.low_memory_notification());
}

#[no_mangle]
pub extern "C" fn vc_alloc_int_val(context_id: u64, value: i64, tag: u8) -> ValueHandle {
    let tag = ValueTag::from_u8(tag).unwrap_or(ValueTag::Invalid);
    with_context(context_id, std::ptr::null_mut(), |ctx| {
        ctx.alloc_int_val(value, tag)
    })
}

#[no_mangle]
pub extern "C" fn vc_alloc_double_val(context_id: u64, value: f64, tag: u8) -> ValueHandle {
    let tag = ValueTag::from_u8(tag).unwrap_or(ValueTag::Invalid);
    with_context(context_id, std::ptr::null_mut(), |ctx| {
        ctx.alloc_double_val(value, tag)
    })
}

#[no_mangle]
pub extern "C" fn vc_alloc_string_val(
    context_id: u64,
    text: *const u8,
    len: u64,
    tag: u8,
) -> ValueHandle {
    let tag = ValueTag::from_u8(tag).unwrap_or(ValueTag::Invalid);
    with_context(context_id, std::ptr::null_mut(), |ctx| {
        match unsafe { utf8_from_parts(text, len) } {
            Some(text) => ctx.alloc_string_val(text, tag),
            None => ctx.alloc_string_val("", ValueTag::Invalid),
        }
    })
}

/// Releases a handle. Each handle may be freed exactly once; unknown
/// handles are ignored.
#[no_mangle]
pub extern "C" fn vc_free_value(context_id: u64, handle: ValueHandle) {
    with_context(context_id, (), |ctx| ctx.free_value(handle));
}

#[no_mangle]
pub extern "C" fn vc_value_count(context_id: u64) -> usize {
    with_context(context_id, 0, |ctx| ctx.value_count())
}

#[no_mangle]
pub extern "C" fn vc_make_js_callback(context_id: u64, callback_id: u64) -> ValueHandle {
    with_context(context_id, std::ptr::null_mut(), |ctx| {
        ctx.make_js_callback(callback_id)
    })
}

#[no_mangle]
pub extern "C" fn vc_get_identity_hash(context_id: u64, obj: ValueHandle) -> ValueHandle {
    with_context(context_id, std::ptr::null_mut(), |ctx| {
        ctx.get_identity_hash(obj)
    })
}

#[no_mangle]
pub extern "C" fn vc_get_own_property_names(context_id: u64, obj: ValueHandle) -> ValueHandle {
    with_context(context_id, std::ptr::null_mut(), |ctx| {
        ctx.get_own_property_names(obj)
    })
}

#[no_mangle]
pub extern "C" fn vc_get_object_item(
    context_id: u64,
    obj: ValueHandle,
    key: ValueHandle,
) -> ValueHandle {
    with_context(context_id, std::ptr::null_mut(), |ctx| {
        ctx.get_object_item(obj, key)
    })
}

#[no_mangle]
pub extern "C" fn vc_set_object_item(
    context_id: u64,
    obj: ValueHandle,
    key: ValueHandle,
    val: ValueHandle,
) -> ValueHandle {
    with_context(context_id, std::ptr::null_mut(), |ctx| {
        ctx.set_object_item(obj, key, val)
    })
}

#[no_mangle]
pub extern "C" fn vc_del_object_item(
    context_id: u64,
    obj: ValueHandle,
    key: ValueHandle,
) -> ValueHandle {
    with_context(context_id, std::ptr::null_mut(), |ctx| {
        ctx.del_object_item(obj, key)
    })
}

/// `Array.prototype.splice` with zero (`new_val == null`) or one
/// replacement value. Returns the array of deleted elements.
#[no_mangle]
pub extern "C" fn vc_splice_array(
    context_id: u64,
    array: ValueHandle,
    start: i32,
    delete_count: i32,
    new_val: ValueHandle,
) -> ValueHandle {
    with_context(context_id, std::ptr::null_mut(), |ctx| {
        let new_val = (!new_val.is_null()).then_some(new_val);
        ctx.splice_array(array, start, delete_count, new_val)
    })
}

/// Attaches settlement handlers to a promise; the host callback receives
/// `(callback_id, value_handle)` when it settles. Returns a boolean value
/// confirming the attachment.
#[no_mangle]
pub extern "C" fn vc_attach_promise_then(
    context_id: u64,
    promise: ValueHandle,
    callback_id: u64,
) -> ValueHandle {
    with_context(context_id, std::ptr::null_mut(), |ctx| {
        ctx.attach_promise_then(promise, callback_id)
    })
}

/// Evaluates a script asynchronously. Returns a task id for
/// `vc_cancel_task`; the host callback fires exactly once with the result.
/// `timeout_ms == 0` disables the wall-clock limit.
#[no_mangle]
pub extern "C" fn vc_eval(
    context_id: u64,
    code: ValueHandle,
    timeout_ms: u64,
    callback_id: u64,
) -> u64 {
    with_context(context_id, 0, |ctx| ctx.eval(code, timeout_ms, callback_id))
}

/// `func.apply(this, argv)` as an asynchronous task.
#[no_mangle]
pub extern "C" fn vc_call_function(
    context_id: u64,
    func: ValueHandle,
    this: ValueHandle,
    argv: ValueHandle,
    callback_id: u64,
) -> u64 {
    with_context(context_id, 0, |ctx| {
        ctx.call_function(func, this, argv, callback_id)
    })
}

#[no_mangle]
pub extern "C" fn vc_heap_stats(context_id: u64, callback_id: u64) -> u64 {
    with_context(context_id, 0, |ctx| ctx.heap_stats(callback_id))
}

#[no_mangle]
pub extern "C" fn vc_heap_snapshot(context_id: u64, callback_id: u64) -> u64 {
    with_context(context_id, 0, |ctx| ctx.heap_snapshot(callback_id))
}

/// Cancels an asynchronous task. Idempotent; unknown ids are ignored.
#[no_mangle]
pub extern "C" fn vc_cancel_task(context_id: u64, task_id: u64) {
    with_context(context_id, (), |ctx| ctx.cancel_task(task_id));
}

#[no_mangle]
pub extern "C" fn vc_full_eval_call_count(context_id: u64) -> u64 {
    with_context(context_id, 0, |ctx| ctx.full_eval_call_count())
}

#[no_mangle]
pub extern "C" fn vc_function_eval_call_count(context_id: u64) -> u64 {
    with_context(context_id, 0, |ctx| ctx.function_eval_call_count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Condvar;
    use std::sync::Mutex;
    use std::time::Duration;
    use std::time::Instant;

    lazy_static! {
        static ref SINK: (Mutex<HashMap<u64, (ValueTag, usize)>>, Condvar) =
            (Mutex::new(HashMap::new()), Condvar::new());
    }

    extern "C" fn abi_callback(callback_id: u64, value: ValueHandle) {
        let tag = unsafe { (*value).tag };
        let (map, signal) = &*SINK;
        map.lock().unwrap().insert(callback_id, (tag, value as usize));
        signal.notify_all();
    }

    fn await_settlement(callback_id: u64) -> (ValueTag, ValueHandle) {
        let (map, signal) = &*SINK;
        let deadline = Instant::now() + Duration::from_secs(20);
        let mut settled = map.lock().unwrap();
        loop {
            if let Some((tag, handle)) = settled.remove(&callback_id) {
                return (tag, handle as ValueHandle);
            }
            let timeout = deadline
                .checked_duration_since(Instant::now())
                .expect("timed out waiting for a host callback");
            let (guard, _) = signal.wait_timeout(settled, timeout).unwrap();
            settled = guard;
        }
    }

    #[test]
    fn abi_eval_round_trip() {
        vc_init_v8(std::ptr::null(), std::ptr::null(), std::ptr::null());
        let context_id = vc_init_context(abi_callback);

        let code = "40+2";
        let handle = vc_alloc_string_val(
            context_id,
            code.as_ptr(),
            code.len() as u64,
            ValueTag::StrUtf8 as u8,
        );
        assert!(!handle.is_null());

        vc_eval(context_id, handle, 0, 7_000_001);
        let (tag, result) = await_settlement(7_000_001);
        assert_eq!(tag, ValueTag::Integer);

        vc_free_value(context_id, handle);
        vc_free_value(context_id, result);
        assert_eq!(vc_value_count(context_id), 0);

        vc_free_context(context_id);
        assert!(context::get_context(context_id).is_none());
    }

    #[test]
    fn abi_tolerates_junk_everywhere() {
        vc_init_v8(std::ptr::null(), std::ptr::null(), std::ptr::null());

        // Unknown context ids.
        assert_eq!(vc_value_count(u64::MAX), 0);
        assert!(vc_get_object_item(u64::MAX, std::ptr::null_mut(), std::ptr::null_mut()).is_null());
        vc_free_context(u64::MAX);
        vc_cancel_task(u64::MAX, 1);

        // Unknown handles inside a real context.
        let context_id = vc_init_context(abi_callback);
        let junk = 0xdead_beef_usize as ValueHandle;
        let result = vc_get_identity_hash(context_id, junk);
        assert_eq!(unsafe { (*result).tag }, ValueTag::ValueException);

        // Unknown tags come back as value exceptions too.
        let handle = vc_alloc_int_val(context_id, 1, 99);
        assert_eq!(unsafe { (*handle).tag }, ValueTag::ValueException);

        vc_free_context(context_id);
    }

    #[test]
    fn abi_version_is_a_c_string() {
        let version = vc_v8_version();
        assert!(!version.is_null());
        let text = unsafe { CStr::from_ptr(version) }.to_str().unwrap();
        assert!(text.contains('.'));
    }
}
