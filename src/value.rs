use crate::collector::Garbage;
use crate::collector::IsolateObjectCollector;
use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

/// Type tag of a value crossing the language boundary.
///
/// The numbering is part of the ABI; foreign bindings switch on it.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueTag {
    Invalid = 0,
    Null = 1,
    Bool = 2,
    Integer = 3,
    Double = 4,
    StrUtf8 = 5,
    Date = 8,
    Symbol = 9,
    Object = 10,
    Function = 100,
    SharedArrayBuffer = 101,
    ArrayBuffer = 102,
    ExecuteException = 200,
    ParseException = 201,
    OomException = 202,
    TimeoutException = 203,
    TerminatedException = 204,
    ValueException = 205,
    KeyException = 206,
}

impl ValueTag {
    /// Decodes a tag coming from the foreign side.
    pub fn from_u8(raw: u8) -> Option<ValueTag> {
        let tag = match raw {
            0 => ValueTag::Invalid,
            1 => ValueTag::Null,
            2 => ValueTag::Bool,
            3 => ValueTag::Integer,
            4 => ValueTag::Double,
            5 => ValueTag::StrUtf8,
            8 => ValueTag::Date,
            9 => ValueTag::Symbol,
            10 => ValueTag::Object,
            100 => ValueTag::Function,
            101 => ValueTag::SharedArrayBuffer,
            102 => ValueTag::ArrayBuffer,
            200 => ValueTag::ExecuteException,
            201 => ValueTag::ParseException,
            202 => ValueTag::OomException,
            203 => ValueTag::TimeoutException,
            204 => ValueTag::TerminatedException,
            205 => ValueTag::ValueException,
            206 => ValueTag::KeyException,
            _ => return None,
        };
        Some(tag)
    }

    pub fn is_exception(self) -> bool {
        self as u8 >= ValueTag::ExecuteException as u8
    }
}

/// Payload of a [`RawValue`]. Which member is live is decided by the tag.
#[repr(C)]
pub union RawPayload {
    pub ptr_val: *mut c_void,
    pub bytes: *mut u8,
    pub int_val: u64,
    pub double_val: f64,
}

/// The C-layout view of a marshalled value. Foreign code receives stable
/// pointers to these and reads the fields directly.
#[repr(C)]
pub struct RawValue {
    pub payload: RawPayload,
    pub tag: ValueTag,
    pub len: usize,
}

/// Opaque handle handed across the ABI. Valid only as a registry key.
pub type ValueHandle = *mut RawValue;

/// A marshalled value together with whatever keeps its payload alive: the
/// utf-8 bytes a string points into, or the persistent handle an object,
/// function or buffer re-enters JavaScript through. Backing stores of
/// array buffers are owned by the factory's map, keyed by our address.
pub struct BinaryValue {
    raw: Box<RawValue>,
    // NUL-terminated so the bytes pointer doubles as a C string.
    text: Option<Box<[u8]>>,
    persistent: Option<v8::Global<v8::Value>>,
    factory: Weak<ValueFactory>,
}

// The raw pointers inside `raw` only ever point at `text`, at a backing
// store owned by the factory map, or carry no ownership at all; all of
// those stay valid wherever the value travels. The persistent handle is
// isolate-owned: it is only dereferenced on the pump thread, and dropping
// routes it back there through the object collector.
unsafe impl Send for BinaryValue {}
unsafe impl Sync for BinaryValue {}

pub type ValuePtr = Arc<BinaryValue>;

impl BinaryValue {
    pub fn tag(&self) -> ValueTag {
        self.raw.tag
    }

    pub fn len(&self) -> usize {
        self.raw.len
    }

    pub fn integer(&self) -> u64 {
        unsafe { self.raw.payload.int_val }
    }

    pub fn double(&self) -> f64 {
        unsafe { self.raw.payload.double_val }
    }

    /// The value's utf-8 bytes, without the trailing NUL.
    pub fn utf8(&self) -> &[u8] {
        match self.text.as_deref() {
            Some(bytes) => &bytes[..bytes.len() - 1],
            None => &[],
        }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(self.utf8()).unwrap_or("")
    }

    /// Stable address used as the registry handle for this value.
    pub fn handle(&self) -> ValueHandle {
        &*self.raw as *const RawValue as ValueHandle
    }

    /// Renders the value back into JavaScript. Values that captured a
    /// persistent handle re-enter as that exact object; scalars and strings
    /// are rebuilt. Symbols and exception variants do not render.
    pub fn to_v8<'s>(&self, scope: &mut v8::HandleScope<'s>) -> Option<v8::Local<'s, v8::Value>> {
        if let Some(global) = self.persistent.as_ref() {
            return Some(v8::Local::new(scope, global));
        }

        match self.tag() {
            ValueTag::Null => Some(v8::null(scope).into()),
            ValueTag::Bool => Some(v8::Boolean::new(scope, self.integer() != 0).into()),
            ValueTag::Integer => Some(v8::Number::new(scope, self.integer() as i64 as f64).into()),
            ValueTag::Double => Some(v8::Number::new(scope, self.double()).into()),
            ValueTag::Date => v8::Date::new(scope, self.double()).map(Into::into),
            ValueTag::StrUtf8 => {
                v8::String::new_from_utf8(scope, self.utf8(), v8::NewStringType::Normal)
                    .map(Into::into)
            }
            _ => None,
        }
    }
}

impl Drop for BinaryValue {
    fn drop(&mut self) {
        if let Some(factory) = self.factory.upgrade() {
            factory.release(self.handle() as usize, self.persistent.take());
        }
    }
}

/// Allocates marshalled values and owns the strong references to the
/// backing stores of buffer values, keyed by the value's address.
pub struct ValueFactory {
    backing_stores: Mutex<HashMap<usize, v8::SharedRef<v8::BackingStore>>>,
    collector: Arc<IsolateObjectCollector>,
}

impl ValueFactory {
    pub fn new(collector: Arc<IsolateObjectCollector>) -> Arc<ValueFactory> {
        Arc::new(ValueFactory {
            backing_stores: Mutex::new(HashMap::new()),
            collector,
        })
    }

    fn alloc(
        self: &Arc<Self>,
        tag: ValueTag,
        payload: RawPayload,
        len: usize,
        text: Option<Box<[u8]>>,
        persistent: Option<v8::Global<v8::Value>>,
    ) -> ValuePtr {
        Arc::new(BinaryValue {
            raw: Box::new(RawValue { payload, tag, len }),
            text,
            persistent,
            factory: Arc::downgrade(self),
        })
    }

    fn scalar(self: &Arc<Self>, tag: ValueTag, int_val: u64) -> ValuePtr {
        self.alloc(tag, RawPayload { int_val }, 0, None, None)
    }

    pub fn null(self: &Arc<Self>) -> ValuePtr {
        self.scalar(ValueTag::Null, 0)
    }

    pub fn boolean(self: &Arc<Self>, value: bool) -> ValuePtr {
        self.scalar(ValueTag::Bool, u64::from(value))
    }

    pub fn integer(self: &Arc<Self>, value: u64) -> ValuePtr {
        self.scalar(ValueTag::Integer, value)
    }

    pub fn double(self: &Arc<Self>, value: f64) -> ValuePtr {
        self.alloc(
            ValueTag::Double,
            RawPayload { double_val: value },
            0,
            None,
            None,
        )
    }

    pub fn date(self: &Arc<Self>, epoch_millis: f64) -> ValuePtr {
        self.alloc(
            ValueTag::Date,
            RawPayload {
                double_val: epoch_millis,
            },
            0,
            None,
            None,
        )
    }

    /// Builds a string-tagged value owning a copy of `text`.
    pub fn string(self: &Arc<Self>, text: &str) -> ValuePtr {
        self.text_value(ValueTag::StrUtf8, text, None)
    }

    /// Builds an exception-variant value carrying a human-readable message.
    pub fn exception(self: &Arc<Self>, tag: ValueTag, message: &str) -> ValuePtr {
        debug_assert!(tag.is_exception());
        self.text_value(tag, message, None)
    }

    fn text_value(
        self: &Arc<Self>,
        tag: ValueTag,
        text: &str,
        persistent: Option<v8::Global<v8::Value>>,
    ) -> ValuePtr {
        let len = text.len();
        let mut bytes = Vec::with_capacity(len + 1);
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(0);
        let mut text = bytes.into_boxed_slice();
        let payload = RawPayload {
            bytes: text.as_mut_ptr(),
        };
        self.alloc(tag, payload, len, Some(text), persistent)
    }

    /// Maps a JavaScript value to a marshalled value by type dispatch.
    /// Returns `None` for value kinds with no marshalled representation.
    pub fn from_v8(
        self: &Arc<Self>,
        scope: &mut v8::HandleScope,
        value: v8::Local<v8::Value>,
    ) -> Option<ValuePtr> {
        if value.is_null_or_undefined() {
            return Some(self.null());
        }

        if value.is_int32() {
            // Narrow through ToUint32 and widen into the 64-bit field; the
            // foreign side reinterprets the bits as it sees fit.
            let narrowed = value.uint32_value(scope).unwrap_or(0);
            return Some(self.integer(u64::from(narrowed)));
        }

        // Everything numeric that is not an Int32 is a double, per
        // ECMA-262 4.3.20.
        if value.is_number() {
            return Some(self.double(value.number_value(scope).unwrap_or(f64::NAN)));
        }

        if value.is_boolean() {
            return Some(self.boolean(value.is_true()));
        }

        if value.is_function() {
            let persistent = v8::Global::new(scope, value);
            return Some(self.alloc(
                ValueTag::Function,
                RawPayload { int_val: 0 },
                0,
                None,
                Some(persistent),
            ));
        }

        if value.is_symbol() {
            return Some(self.scalar(ValueTag::Symbol, 0));
        }

        if let Ok(date) = v8::Local::<v8::Date>::try_from(value) {
            return Some(self.date(date.value_of()));
        }

        if value.is_string() {
            return Some(self.string(&value.to_rust_string_lossy(scope)));
        }

        if value.is_shared_array_buffer() || value.is_array_buffer() || value.is_array_buffer_view()
        {
            return self.from_v8_buffer(scope, value);
        }

        if value.is_object() {
            let object = value.to_object(scope)?;
            let hash = i64::from(object.get_identity_hash().get()) as u64;
            let persistent = v8::Global::new(scope, value);
            return Some(self.alloc(
                ValueTag::Object,
                RawPayload { int_val: hash },
                0,
                None,
                Some(persistent),
            ));
        }

        None
    }

    fn from_v8_buffer(
        self: &Arc<Self>,
        scope: &mut v8::HandleScope,
        value: v8::Local<v8::Value>,
    ) -> Option<ValuePtr> {
        let mut offset = 0;
        let mut length;

        let backing_store = if let Ok(view) = v8::Local::<v8::ArrayBufferView>::try_from(value) {
            offset = view.byte_offset();
            length = view.byte_length();
            view.buffer(scope)?.get_backing_store()
        } else if let Ok(shared) = v8::Local::<v8::SharedArrayBuffer>::try_from(value) {
            let store = shared.get_backing_store();
            length = store.byte_length();
            store
        } else {
            let buffer = v8::Local::<v8::ArrayBuffer>::try_from(value).ok()?;
            let store = buffer.get_backing_store();
            length = store.byte_length();
            store
        };

        let base = backing_store
            .data()
            .map(|ptr| ptr.as_ptr() as *mut u8)
            .unwrap_or(std::ptr::null_mut());
        if base.is_null() {
            length = 0;
        }
        let data = if base.is_null() {
            base
        } else {
            // In-bounds: offset and length come from the view itself.
            unsafe { base.add(offset) }
        };

        let tag = if value.is_shared_array_buffer() {
            ValueTag::SharedArrayBuffer
        } else {
            ValueTag::ArrayBuffer
        };

        let persistent = v8::Global::new(scope, value);
        let result = self.alloc(
            tag,
            RawPayload {
                ptr_val: data as *mut c_void,
            },
            length,
            None,
            Some(persistent),
        );

        self.backing_stores
            .lock()
            .unwrap()
            .insert(result.handle() as usize, backing_store);

        Some(result)
    }

    /// Called from [`BinaryValue::drop`]: erases the backing-store entry and
    /// routes the persistent handle through the object collector, since the
    /// dropping thread usually is not the pump.
    fn release(&self, address: usize, persistent: Option<v8::Global<v8::Value>>) {
        self.backing_stores.lock().unwrap().remove(&address);
        if let Some(global) = persistent {
            self.collector.collect(Garbage::Handle(global));
        }
    }

    pub fn backing_store_count(&self) -> usize {
        self.backing_stores.lock().unwrap().len()
    }
}

/// Keeps values handed to foreign code alive and resolves their handles.
/// Any junk handle resolves to "absent", never to a crash.
#[derive(Default)]
pub struct ValueRegistry {
    values: Mutex<HashMap<usize, ValuePtr>>,
}

impl ValueRegistry {
    /// Registers the value and returns its stable handle.
    pub fn remember(&self, value: ValuePtr) -> ValueHandle {
        let handle = value.handle();
        self.values.lock().unwrap().insert(handle as usize, value);
        handle
    }

    pub fn lookup(&self, handle: ValueHandle) -> Option<ValuePtr> {
        self.values.lock().unwrap().get(&(handle as usize)).cloned()
    }

    /// Unregisters the handle. Idempotent; unknown handles are ignored.
    pub fn forget(&self, handle: ValueHandle) {
        self.values.lock().unwrap().remove(&(handle as usize));
    }

    pub fn count(&self) -> usize {
        self.values.lock().unwrap().len()
    }

    /// Drops every registered value. Used during context teardown.
    pub fn clear(&self) {
        self.values.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::IsolateObjectCollector;
    use crate::manager::TaskSpawner;

    fn test_factory() -> Arc<ValueFactory> {
        ValueFactory::new(Arc::new(IsolateObjectCollector::new(
            TaskSpawner::disconnected(),
        )))
    }

    #[test]
    fn tag_round_trip() {
        for tag in [
            ValueTag::Null,
            ValueTag::Bool,
            ValueTag::Integer,
            ValueTag::Double,
            ValueTag::StrUtf8,
            ValueTag::Date,
            ValueTag::Symbol,
            ValueTag::Object,
            ValueTag::Function,
            ValueTag::SharedArrayBuffer,
            ValueTag::ArrayBuffer,
            ValueTag::ExecuteException,
            ValueTag::ParseException,
            ValueTag::OomException,
            ValueTag::TimeoutException,
            ValueTag::TerminatedException,
            ValueTag::ValueException,
            ValueTag::KeyException,
        ] {
            assert_eq!(ValueTag::from_u8(tag as u8), Some(tag));
        }
        assert_eq!(ValueTag::from_u8(7), None);
        assert_eq!(ValueTag::from_u8(255), None);
    }

    #[test]
    fn scalar_values() {
        let factory = test_factory();
        let value = factory.integer(42);
        assert_eq!(value.tag(), ValueTag::Integer);
        assert_eq!(value.integer(), 42);

        let value = factory.double(1.5);
        assert_eq!(value.tag(), ValueTag::Double);
        assert_eq!(value.double(), 1.5);

        let value = factory.boolean(true);
        assert_eq!(value.integer(), 1);
    }

    #[test]
    fn string_values_are_nul_terminated() {
        let factory = test_factory();
        let value = factory.string("hello");
        assert_eq!(value.tag(), ValueTag::StrUtf8);
        assert_eq!(value.len(), 5);
        assert_eq!(value.as_str(), "hello");

        // The C side expects a trailing NUL after `len` bytes.
        let bytes = unsafe { std::slice::from_raw_parts(value.raw.payload.bytes, 6) };
        assert_eq!(bytes, b"hello\0");
    }

    #[test]
    fn exception_values_carry_message() {
        let factory = test_factory();
        let value = factory.exception(ValueTag::ParseException, "Unexpected token");
        assert!(value.tag().is_exception());
        assert_eq!(value.as_str(), "Unexpected token");
    }

    #[test]
    fn registry_remember_lookup_forget() {
        let factory = test_factory();
        let registry = ValueRegistry::default();

        let value = factory.integer(7);
        let handle = registry.remember(value);
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.lookup(handle).unwrap().integer(), 7);

        registry.forget(handle);
        assert!(registry.lookup(handle).is_none());
        assert_eq!(registry.count(), 0);

        // Forget is idempotent, and junk handles never crash a lookup.
        registry.forget(handle);
        assert!(registry.lookup(0xdead_beef_usize as ValueHandle).is_none());
        assert!(registry.lookup(std::ptr::null_mut()).is_none());
    }

    #[test]
    fn handles_are_distinct_per_live_value() {
        let factory = test_factory();
        let registry = ValueRegistry::default();

        let a = registry.remember(factory.integer(1));
        let b = registry.remember(factory.integer(2));
        assert_ne!(a, b);
        assert_eq!(registry.count(), 2);
    }
}
