use crate::context::ContextHolder;
use crate::value::ValueFactory;
use crate::value::ValueHandle;
use crate::value::ValuePtr;
use crate::value::ValueRegistry;
use crate::value::ValueTag;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

/// The host's single callback entry point. Multiplexing across logical
/// callbacks happens through the `callback_id` argument.
///
/// Invoked on the pump thread: the host must hand the work off to another
/// thread and return promptly, and must not call back into the same
/// runtime context from inside the callback.
pub type HostCallback = extern "C" fn(callback_id: u64, value: ValueHandle);

/// Converts a settlement or argument value, registers it, and fires the
/// host callback with the resulting handle.
pub struct CallbackCaller {
    factory: Arc<ValueFactory>,
    registry: Arc<ValueRegistry>,
    callback: HostCallback,
}

impl CallbackCaller {
    pub fn new(
        factory: Arc<ValueFactory>,
        registry: Arc<ValueRegistry>,
        callback: HostCallback,
    ) -> CallbackCaller {
        CallbackCaller {
            factory,
            registry,
            callback,
        }
    }

    pub fn factory(&self) -> &Arc<ValueFactory> {
        &self.factory
    }

    pub fn convert(&self, scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> ValuePtr {
        self.factory.from_v8(scope, value).unwrap_or_else(|| {
            self.factory
                .exception(ValueTag::ValueException, "unsupported JavaScript value")
        })
    }

    /// Registers the value and fires the host callback exactly once with
    /// its handle. The host owns the handle from here on.
    pub fn invoke(&self, callback_id: u64, value: ValuePtr) {
        let handle = self.registry.remember(value);
        (self.callback)(callback_id, handle);
    }
}

lazy_static! {
    /// Process-wide caller table. JS functions refer to their caller by id,
    /// never by pointer, so a function outliving its runtime context
    /// resolves to nothing here and the invocation is dropped silently.
    static ref CALLBACK_CALLERS: Mutex<HashMap<u64, Arc<CallbackCaller>>> =
        Mutex::new(HashMap::new());
}

static NEXT_CALLER_ID: AtomicU64 = AtomicU64::new(1);

/// Keeps a caller reachable by id; unregisters on drop.
pub struct CallerRegistration {
    id: u64,
}

impl CallerRegistration {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallerRegistration {
    fn drop(&mut self) {
        CALLBACK_CALLERS.lock().unwrap().remove(&self.id);
    }
}

pub fn register_caller(caller: Arc<CallbackCaller>) -> CallerRegistration {
    let id = NEXT_CALLER_ID.fetch_add(1, Ordering::SeqCst);
    CALLBACK_CALLERS.lock().unwrap().insert(id, caller);
    CallerRegistration { id }
}

fn caller_by_id(id: u64) -> Option<Arc<CallbackCaller>> {
    CALLBACK_CALLERS.lock().unwrap().get(&id).cloned()
}

/// Packs `(caller id, callback id)` into a function's data slot as a pair
/// of BigInts. Native pointers never enter the engine.
pub fn pack_caller_data<'s>(
    scope: &mut v8::HandleScope<'s>,
    caller_id: u64,
    callback_id: u64,
) -> v8::Local<'s, v8::Array> {
    let caller = v8::BigInt::new_from_u64(scope, caller_id);
    let callback = v8::BigInt::new_from_u64(scope, callback_id);
    v8::Array::new_with_elements(scope, &[caller.into(), callback.into()])
}

/// Recovers the caller from a function's data slot. Any malformed data or
/// stale caller id resolves to `None`.
pub fn caller_from_data(
    scope: &mut v8::HandleScope,
    data: v8::Local<v8::Value>,
) -> Option<(Arc<CallbackCaller>, u64)> {
    let data = v8::Local::<v8::Array>::try_from(data).ok()?;
    if data.length() != 2 {
        return None;
    }

    let caller_id = bigint_element(scope, data, 0)?;
    let callback_id = bigint_element(scope, data, 1)?;

    let caller = caller_by_id(caller_id)?;
    Some((caller, callback_id))
}

fn bigint_element(
    scope: &mut v8::HandleScope,
    array: v8::Local<v8::Array>,
    index: u32,
) -> Option<u64> {
    let value = array.get_index(scope, index)?;
    let bigint = v8::Local::<v8::BigInt>::try_from(value).ok()?;
    let (value, lossless) = bigint.u64_value();
    lossless.then_some(value)
}

/// Builds JS functions that forward their calls to the host callback.
pub struct JsCallbackMaker {
    context: Arc<ContextHolder>,
    factory: Arc<ValueFactory>,
    caller_id: u64,
}

impl JsCallbackMaker {
    pub fn new(
        context: Arc<ContextHolder>,
        factory: Arc<ValueFactory>,
        caller_id: u64,
    ) -> JsCallbackMaker {
        JsCallbackMaker {
            context,
            factory,
            caller_id,
        }
    }

    /// Creates a JS function which, when called, packs its arguments into
    /// an array and invokes the host callback with
    /// `(callback_id, argv_handle)`.
    pub fn make_js_callback(&self, isolate: &mut v8::Isolate, callback_id: u64) -> ValuePtr {
        let context = self.context.get();
        let scope = &mut v8::HandleScope::with_context(isolate, context);

        let data = pack_caller_data(scope, self.caller_id, callback_id);
        let builder = v8::FunctionBuilder::new(on_host_called).data(data.into());
        let Some(function) = v8::FunctionBuilder::<v8::Function>::build(builder, scope) else {
            return self
                .factory
                .exception(ValueTag::ValueException, "failed to build callback function");
        };

        self.factory
            .from_v8(scope, function.into())
            .unwrap_or_else(|| {
                self.factory
                    .exception(ValueTag::ValueException, "failed to wrap callback function")
            })
    }
}

fn on_host_called(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    let Some((caller, callback_id)) = caller_from_data(scope, args.data()) else {
        return;
    };

    let argv = v8::Array::new(scope, args.length());
    for index in 0..args.length() {
        let value = args.get(index);
        argv.set_index(scope, index as u32, value);
    }

    let value = caller.convert(scope, argv.into());
    caller.invoke(callback_id, value);
}
