use crate::callback::register_caller;
use crate::callback::CallbackCaller;
use crate::callback::CallerRegistration;
use crate::callback::HostCallback;
use crate::callback::JsCallbackMaker;
use crate::collector::Garbage;
use crate::collector::IsolateObjectCollector;
use crate::eval::CodeEvaluator;
use crate::heap::HeapReporter;
use crate::manager::IsolateManager;
use crate::memory::MemoryLimits;
use crate::object::ObjectManipulator;
use crate::promise::PromiseAttacher;
use crate::task::CancelableTaskRunner;
use crate::task::CountDownLatch;
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
use std::sync::Once;

/// Boots the engine. Safe to call more than once; only the first call
/// takes effect. Flags must be set before anything else touches V8.
///
/// ICU data and the startup snapshot are linked into the engine build, so
/// no external data files are involved.
pub fn init_v8(v8_flags: &str) {
    static V8_INIT: Once = Once::new();
    V8_INIT.call_once(|| {
        if !v8_flags.is_empty() {
            v8::V8::set_flags_from_string(v8_flags);
        }
        let platform = v8::new_default_platform(0, false).make_shared();
        v8::V8::initialize_platform(platform);
        v8::V8::initialize();
    });
}

pub fn v8_version() -> &'static str {
    v8::V8::get_version()
}

/// Pins the one persistent JS context of a runtime context.
pub struct ContextHolder {
    context: Mutex<Option<v8::Global<v8::Context>>>,
}

// The stored handle is owned by the isolate. It is created and cloned on
// the pump thread only; teardown moves the cell to the object collector,
// which drops it on the pump as well.
unsafe impl Send for ContextHolder {}
unsafe impl Sync for ContextHolder {}

impl ContextHolder {
    pub fn new(manager: &IsolateManager) -> Arc<ContextHolder> {
        let holder = Arc::new(ContextHolder {
            context: Mutex::new(None),
        });

        let slot = holder.clone();
        manager.run_and_await(move |isolate| {
            let scope = &mut v8::HandleScope::new(isolate);
            let context = v8::Context::new(scope);
            *slot.context.lock().unwrap() = Some(v8::Global::new(scope, context));
        });

        holder
    }

    /// A fresh reference to the persistent context. Only called from pump
    /// tasks, which never outlive the release below.
    pub fn get(&self) -> v8::Global<v8::Context> {
        self.context
            .lock()
            .unwrap()
            .clone()
            .expect("js context already released")
    }

    fn release(&self) -> Option<v8::Global<v8::Context>> {
        self.context.lock().unwrap().take()
    }
}

/// One isolated JavaScript execution environment: an isolate, a JS
/// context, a pump thread, a handle registry and a set of live async
/// tasks, exposed as a unit across the ABI.
///
/// Subsystems are owned here exclusively and reference each other through
/// shared refs, never owning their siblings; teardown is the explicit
/// sequence in `Drop`.
pub struct JsContext {
    manager: Arc<IsolateManager>,
    limits: Arc<MemoryLimits>,
    collector: Arc<IsolateObjectCollector>,
    factory: Arc<ValueFactory>,
    registry: Arc<ValueRegistry>,
    context_holder: Arc<ContextHolder>,
    evaluator: Arc<CodeEvaluator>,
    manipulator: Arc<ObjectManipulator>,
    promise_attacher: Arc<PromiseAttacher>,
    callback_maker: Arc<JsCallbackMaker>,
    heap_reporter: Arc<HeapReporter>,
    runner: Arc<CancelableTaskRunner>,
    pending_tasks: Arc<CountDownLatch>,
    caller: Arc<CallbackCaller>,
    _caller_registration: CallerRegistration,
}

impl JsContext {
    pub fn new(host_callback: HostCallback) -> Arc<JsContext> {
        init_v8("");

        let limits = Arc::new(MemoryLimits::default());
        let manager = Arc::new(IsolateManager::new(limits.clone()));
        let collector = Arc::new(IsolateObjectCollector::new(manager.spawner()));
        let factory = ValueFactory::new(collector.clone());
        let registry = Arc::new(ValueRegistry::default());
        let context_holder = ContextHolder::new(&manager);

        let caller = Arc::new(CallbackCaller::new(
            factory.clone(),
            registry.clone(),
            host_callback,
        ));
        let caller_registration = register_caller(caller.clone());
        let caller_id = caller_registration.id();

        let evaluator = Arc::new(CodeEvaluator::new(
            context_holder.clone(),
            factory.clone(),
            limits.clone(),
        ));
        let manipulator = Arc::new(ObjectManipulator::new(
            context_holder.clone(),
            factory.clone(),
        ));
        let promise_attacher = Arc::new(PromiseAttacher::new(
            context_holder.clone(),
            factory.clone(),
            caller_id,
        ));
        let callback_maker = Arc::new(JsCallbackMaker::new(
            context_holder.clone(),
            factory.clone(),
            caller_id,
        ));
        let heap_reporter = Arc::new(HeapReporter::new(factory.clone()));
        let runner = Arc::new(CancelableTaskRunner::new(manager.clone()));

        Arc::new(JsContext {
            manager,
            limits,
            collector,
            factory,
            registry,
            context_holder,
            evaluator,
            manipulator,
            promise_attacher,
            callback_maker,
            heap_reporter,
            runner,
            pending_tasks: Arc::new(CountDownLatch::default()),
            caller,
            _caller_registration: caller_registration,
        })
    }

    // ------------------------------------------------------------------
    // Memory limits.
    // ------------------------------------------------------------------

    pub fn set_hard_memory_limit(&self, limit: usize) {
        self.limits.set_hard_limit(limit);
    }

    pub fn set_soft_memory_limit(&self, limit: usize) {
        self.limits.set_soft_limit(limit);
    }

    pub fn hard_memory_limit_reached(&self) -> bool {
        self.limits.hard_reached()
    }

    pub fn soft_memory_limit_reached(&self) -> bool {
        self.limits.soft_reached()
    }

    /// Request-only: asks the engine to collect aggressively, without
    /// waiting for the collection to happen.
    pub fn low_memory_notification(&self) {
        self.manager.spawner().spawn(|isolate| {
            isolate.low_memory_notification();
        });
    }

    // ------------------------------------------------------------------
    // Value allocation and the handle registry.
    // ------------------------------------------------------------------

    pub fn alloc_int_val(&self, value: i64, tag: ValueTag) -> ValueHandle {
        let result = match tag {
            ValueTag::Null => self.factory.null(),
            ValueTag::Bool => self.factory.boolean(value != 0),
            ValueTag::Integer => self.factory.integer(value as u64),
            _ => self
                .factory
                .exception(ValueTag::ValueException, "unsupported type for an int value"),
        };
        self.registry.remember(result)
    }

    pub fn alloc_double_val(&self, value: f64, tag: ValueTag) -> ValueHandle {
        let result = match tag {
            ValueTag::Double => self.factory.double(value),
            ValueTag::Date => self.factory.date(value),
            _ => self.factory.exception(
                ValueTag::ValueException,
                "unsupported type for a double value",
            ),
        };
        self.registry.remember(result)
    }

    pub fn alloc_string_val(&self, text: &str, tag: ValueTag) -> ValueHandle {
        let result = match tag {
            ValueTag::StrUtf8 => self.factory.string(text),
            _ => self.factory.exception(
                ValueTag::ValueException,
                "unsupported type for a string value",
            ),
        };
        self.registry.remember(result)
    }

    pub fn free_value(&self, handle: ValueHandle) {
        self.registry.forget(handle);
    }

    pub fn value_count(&self) -> usize {
        self.registry.count()
    }

    // ------------------------------------------------------------------
    // Synchronous object operations.
    // ------------------------------------------------------------------

    pub fn make_js_callback(&self, callback_id: u64) -> ValueHandle {
        let maker = self.callback_maker.clone();
        self.run_sync(move |isolate| maker.make_js_callback(isolate, callback_id))
    }

    pub fn get_identity_hash(&self, obj: ValueHandle) -> ValueHandle {
        let obj = match self.resolve(obj, "Bad handle: obj") {
            Ok(value) => value,
            Err(err) => return self.registry.remember(err),
        };
        let manipulator = self.manipulator.clone();
        self.run_sync(move |isolate| manipulator.identity_hash(isolate, &obj))
    }

    pub fn get_own_property_names(&self, obj: ValueHandle) -> ValueHandle {
        let obj = match self.resolve(obj, "Bad handle: obj") {
            Ok(value) => value,
            Err(err) => return self.registry.remember(err),
        };
        let manipulator = self.manipulator.clone();
        self.run_sync(move |isolate| manipulator.own_property_names(isolate, &obj))
    }

    pub fn get_object_item(&self, obj: ValueHandle, key: ValueHandle) -> ValueHandle {
        let (obj, key) = match self.resolve_pair(obj, key) {
            Ok(pair) => pair,
            Err(err) => return self.registry.remember(err),
        };
        let manipulator = self.manipulator.clone();
        self.run_sync(move |isolate| manipulator.get(isolate, &obj, &key))
    }

    pub fn set_object_item(
        &self,
        obj: ValueHandle,
        key: ValueHandle,
        val: ValueHandle,
    ) -> ValueHandle {
        let (obj, key) = match self.resolve_pair(obj, key) {
            Ok(pair) => pair,
            Err(err) => return self.registry.remember(err),
        };
        let val = match self.resolve(val, "Bad handle: val") {
            Ok(value) => value,
            Err(err) => return self.registry.remember(err),
        };
        let manipulator = self.manipulator.clone();
        self.run_sync(move |isolate| manipulator.set(isolate, &obj, &key, &val))
    }

    pub fn del_object_item(&self, obj: ValueHandle, key: ValueHandle) -> ValueHandle {
        let (obj, key) = match self.resolve_pair(obj, key) {
            Ok(pair) => pair,
            Err(err) => return self.registry.remember(err),
        };
        let manipulator = self.manipulator.clone();
        self.run_sync(move |isolate| manipulator.del(isolate, &obj, &key))
    }

    pub fn splice_array(
        &self,
        array: ValueHandle,
        start: i32,
        delete_count: i32,
        new_val: Option<ValueHandle>,
    ) -> ValueHandle {
        let array = match self.resolve(array, "Bad handle: array") {
            Ok(value) => value,
            Err(err) => return self.registry.remember(err),
        };
        let new_val = match new_val {
            Some(handle) => match self.resolve(handle, "Bad handle: new_val") {
                Ok(value) => Some(value),
                Err(err) => return self.registry.remember(err),
            },
            None => None,
        };
        let manipulator = self.manipulator.clone();
        self.run_sync(move |isolate| {
            manipulator.splice(isolate, &array, start, delete_count, new_val.as_deref())
        })
    }

    pub fn attach_promise_then(&self, promise: ValueHandle, callback_id: u64) -> ValueHandle {
        let promise = match self.resolve(promise, "Bad handle: promise") {
            Ok(value) => value,
            Err(err) => return self.registry.remember(err),
        };
        let attacher = self.promise_attacher.clone();
        self.run_sync(move |isolate| attacher.attach_promise_then(isolate, &promise, callback_id))
    }

    // ------------------------------------------------------------------
    // Asynchronous tasks.
    // ------------------------------------------------------------------

    pub fn eval(&self, code: ValueHandle, timeout_ms: u64, callback_id: u64) -> u64 {
        let code = match self.resolve(code, "Bad handle: code") {
            Ok(value) if value.tag() == ValueTag::StrUtf8 => value,
            Ok(_) => {
                let err = self
                    .factory
                    .exception(ValueTag::ValueException, "code must be a string");
                return self.run_task(move |_| err, callback_id);
            }
            Err(err) => return self.run_task(move |_| err, callback_id),
        };

        let source = code.as_str().to_string();
        let evaluator = self.evaluator.clone();
        self.run_task(
            move |isolate| evaluator.eval(isolate, &source, timeout_ms),
            callback_id,
        )
    }

    pub fn call_function(
        &self,
        func: ValueHandle,
        this: ValueHandle,
        argv: ValueHandle,
        callback_id: u64,
    ) -> u64 {
        let func = match self.resolve(func, "Bad handle: func") {
            Ok(value) => value,
            Err(err) => return self.run_task(move |_| err, callback_id),
        };
        let this = match self.resolve(this, "Bad handle: this") {
            Ok(value) => value,
            Err(err) => return self.run_task(move |_| err, callback_id),
        };
        let argv = match self.resolve(argv, "Bad handle: argv") {
            Ok(value) => value,
            Err(err) => return self.run_task(move |_| err, callback_id),
        };

        let manipulator = self.manipulator.clone();
        self.run_task(
            move |isolate| manipulator.call(isolate, &func, &this, &argv),
            callback_id,
        )
    }

    pub fn heap_stats(&self, callback_id: u64) -> u64 {
        let reporter = self.heap_reporter.clone();
        self.run_task(move |isolate| reporter.heap_stats(isolate), callback_id)
    }

    pub fn heap_snapshot(&self, callback_id: u64) -> u64 {
        let reporter = self.heap_reporter.clone();
        self.run_task(move |isolate| reporter.heap_snapshot(isolate), callback_id)
    }

    pub fn cancel_task(&self, task_id: u64) {
        self.runner.cancel(task_id);
    }

    // ------------------------------------------------------------------
    // Evaluation counters.
    // ------------------------------------------------------------------

    pub fn full_eval_call_count(&self) -> u64 {
        self.evaluator.full_eval_call_count()
    }

    pub fn function_eval_call_count(&self) -> u64 {
        self.evaluator.function_eval_call_count()
    }

    // ------------------------------------------------------------------
    // Internals.
    // ------------------------------------------------------------------

    fn resolve(&self, handle: ValueHandle, err_msg: &str) -> Result<ValuePtr, ValuePtr> {
        self.registry
            .lookup(handle)
            .ok_or_else(|| self.factory.exception(ValueTag::ValueException, err_msg))
    }

    fn resolve_pair(
        &self,
        obj: ValueHandle,
        key: ValueHandle,
    ) -> Result<(ValuePtr, ValuePtr), ValuePtr> {
        let obj = self.resolve(obj, "Bad handle: obj")?;
        let key = self.resolve(key, "Bad handle: key")?;
        Ok((obj, key))
    }

    /// Runs a pump task to completion and registers its result.
    fn run_sync(
        &self,
        runnable: impl FnOnce(&mut v8::Isolate) -> ValuePtr + Send + 'static,
    ) -> ValueHandle {
        let value = self.manager.run_and_await(runnable);
        self.registry.remember(value)
    }

    /// Schedules a cancelable task whose single terminal outcome reaches
    /// the host callback: the result on completion, or
    /// `terminated_exception` on cancellation.
    fn run_task(
        &self,
        runnable: impl FnOnce(&mut v8::Isolate) -> ValuePtr + Send + 'static,
        callback_id: u64,
    ) -> u64 {
        self.pending_tasks.increment();

        let caller = self.caller.clone();
        let pending = self.pending_tasks.clone();
        let on_completed = move |value: ValuePtr| {
            caller.invoke(callback_id, value);
            pending.decrement();
        };

        let caller = self.caller.clone();
        let pending = self.pending_tasks.clone();
        let factory = self.factory.clone();
        let on_canceled = move || {
            let err = factory.exception(ValueTag::TerminatedException, "execution terminated");
            caller.invoke(callback_id, err);
            pending.decrement();
        };

        self.runner.schedule(runnable, on_completed, on_canceled)
    }

    #[cfg(test)]
    fn backing_store_count(&self) -> usize {
        self.factory.backing_store_count()
    }
}

impl Drop for JsContext {
    /// Deterministic teardown: stop JavaScript (unblocking any running
    /// script), let every pending task fire its terminal callback, release
    /// all values and their isolate-owned handles on the pump, then drop
    /// the JS context there too. The pump itself stops and the isolate is
    /// disposed when `manager` drops right after this body.
    fn drop(&mut self) {
        tracing::debug!("tearing down runtime context");
        self.manager.stop_javascript();
        self.pending_tasks.wait();
        self.registry.clear();
        self.collector.wait_until_drained();
        if let Some(context) = self.context_holder.release() {
            self.collector.collect(Garbage::Context(context));
            self.collector.wait_until_drained();
        }
    }
}

// ----------------------------------------------------------------------
// Process-wide context registry: the ABI refers to runtime contexts by id.
// ----------------------------------------------------------------------

lazy_static! {
    static ref CONTEXTS: Mutex<HashMap<u64, Arc<JsContext>>> = Mutex::new(HashMap::new());
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

pub fn init_context(host_callback: HostCallback) -> u64 {
    // Build the context before taking the lock so other threads keep
    // creating and resolving contexts meanwhile.
    let context = JsContext::new(host_callback);
    let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::SeqCst);
    CONTEXTS.lock().unwrap().insert(id, context);
    tracing::debug!(context_id = id, "runtime context created");
    id
}

pub fn get_context(context_id: u64) -> Option<Arc<JsContext>> {
    CONTEXTS.lock().unwrap().get(&context_id).cloned()
}

/// Tears the context down, blocking until every pending host callback has
/// fired. Unknown ids are a no-op.
pub fn free_context(context_id: u64) {
    let context = CONTEXTS.lock().unwrap().remove(&context_id);
    // Destruction happens outside the lock; it can take a while.
    drop(context);
}

pub fn context_count() -> usize {
    CONTEXTS.lock().unwrap().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::RawValue;
    use std::sync::Condvar;
    use std::thread;
    use std::time::Duration;
    use std::time::Instant;

    /// A copy of everything interesting in a callback's value, taken on
    /// the pump thread so tests can assert at leisure.
    #[derive(Clone, Debug)]
    struct Settlement {
        tag: ValueTag,
        int_val: u64,
        double_val: f64,
        text: String,
        bytes: Vec<u8>,
        handle: usize,
    }

    fn snapshot(handle: ValueHandle) -> Settlement {
        let raw: &RawValue = unsafe { &*handle };
        let (int_val, double_val) = unsafe { (raw.payload.int_val, raw.payload.double_val) };

        let text = if raw.tag == ValueTag::StrUtf8 || raw.tag.is_exception() {
            let bytes = unsafe { std::slice::from_raw_parts(raw.payload.bytes, raw.len) };
            String::from_utf8_lossy(bytes).into_owned()
        } else {
            String::new()
        };

        let is_buffer = matches!(raw.tag, ValueTag::ArrayBuffer | ValueTag::SharedArrayBuffer);
        let bytes = if is_buffer && raw.len > 0 {
            unsafe { std::slice::from_raw_parts(raw.payload.ptr_val as *const u8, raw.len) }.to_vec()
        } else {
            Vec::new()
        };

        Settlement {
            tag: raw.tag,
            int_val,
            double_val,
            text,
            bytes,
            handle: handle as usize,
        }
    }

    lazy_static! {
        static ref SINK: (Mutex<HashMap<u64, Settlement>>, Condvar) =
            (Mutex::new(HashMap::new()), Condvar::new());
    }

    static NEXT_CALLBACK_ID: AtomicU64 = AtomicU64::new(1);

    fn next_callback_id() -> u64 {
        NEXT_CALLBACK_ID.fetch_add(1, Ordering::SeqCst)
    }

    extern "C" fn sink_callback(callback_id: u64, value: ValueHandle) {
        let settlement = snapshot(value);
        let (map, signal) = &*SINK;
        map.lock().unwrap().insert(callback_id, settlement);
        signal.notify_all();
    }

    fn await_callback(callback_id: u64) -> Settlement {
        let (map, signal) = &*SINK;
        let deadline = Instant::now() + Duration::from_secs(20);
        let mut settled = map.lock().unwrap();
        loop {
            if let Some(settlement) = settled.remove(&callback_id) {
                return settlement;
            }
            let timeout = deadline
                .checked_duration_since(Instant::now())
                .expect("timed out waiting for a host callback");
            let (guard, _) = signal.wait_timeout(settled, timeout).unwrap();
            settled = guard;
        }
    }

    fn new_context() -> Arc<JsContext> {
        JsContext::new(sink_callback)
    }

    fn eval(ctx: &JsContext, code: &str, timeout_ms: u64) -> Settlement {
        let callback_id = next_callback_id();
        let code = ctx.alloc_string_val(code, ValueTag::StrUtf8);
        ctx.eval(code, timeout_ms, callback_id);
        ctx.free_value(code);
        await_callback(callback_id)
    }

    #[test]
    fn eval_scalar() {
        let ctx = new_context();
        let result = eval(&ctx, "1+2", 0);
        assert_eq!(result.tag, ValueTag::Integer);
        assert_eq!(result.int_val, 3);
    }

    #[test]
    fn eval_double_string_bool_null() {
        let ctx = new_context();

        let result = eval(&ctx, "1.25", 0);
        assert_eq!(result.tag, ValueTag::Double);
        assert_eq!(result.double_val, 1.25);

        let result = eval(&ctx, "'he' + 'llo'", 0);
        assert_eq!(result.tag, ValueTag::StrUtf8);
        assert_eq!(result.text, "hello");

        let result = eval(&ctx, "1 === 1", 0);
        assert_eq!(result.tag, ValueTag::Bool);
        assert_eq!(result.int_val, 1);

        let result = eval(&ctx, "null", 0);
        assert_eq!(result.tag, ValueTag::Null);

        let result = eval(&ctx, "undefined", 0);
        assert_eq!(result.tag, ValueTag::Null);
    }

    #[test]
    fn fast_path_skips_full_compilation() {
        let ctx = new_context();

        let result = eval(&ctx, "function f() { return 42 }", 0);
        assert_eq!(result.tag, ValueTag::Null);
        assert_eq!(ctx.full_eval_call_count(), 1);
        assert_eq!(ctx.function_eval_call_count(), 0);

        let result = eval(&ctx, "f()", 0);
        assert_eq!(result.tag, ValueTag::Integer);
        assert_eq!(result.int_val, 42);
        assert_eq!(ctx.full_eval_call_count(), 1);
        assert_eq!(ctx.function_eval_call_count(), 1);
    }

    #[test]
    fn fast_path_misses_fall_through_silently() {
        let ctx = new_context();

        // No such global; the slow path reports the reference error.
        let result = eval(&ctx, "nope()", 0);
        assert_eq!(result.tag, ValueTag::ExecuteException);
        assert_eq!(ctx.function_eval_call_count(), 0);
    }

    #[test]
    fn parse_error() {
        let ctx = new_context();
        let result = eval(&ctx, "}", 0);
        assert_eq!(result.tag, ValueTag::ParseException);
        assert!(
            result.text.contains("Unexpected token"),
            "message was: {}",
            result.text
        );
    }

    #[test]
    fn execute_error_carries_stack() {
        let ctx = new_context();
        let result = eval(&ctx, "function boom() { throw new Error('kaput') } boom()", 0);
        assert_eq!(result.tag, ValueTag::ExecuteException);
        assert!(result.text.contains("kaput"), "message was: {}", result.text);
        assert!(result.text.contains("boom"), "message was: {}", result.text);
    }

    #[test]
    fn eval_timeout() {
        let ctx = new_context();
        let started = Instant::now();
        let result = eval(&ctx, "while(true){}", 100);
        assert_eq!(result.tag, ValueTag::TimeoutException);
        assert!(started.elapsed() < Duration::from_secs(5));

        // The isolate survives a timeout.
        let result = eval(&ctx, "3*4", 0);
        assert_eq!(result.int_val, 12);
    }

    #[test]
    fn cancel_task_reports_terminated() {
        let ctx = new_context();

        let callback_id = next_callback_id();
        let code = ctx.alloc_string_val("while(true){}", ValueTag::StrUtf8);
        let task_id = ctx.eval(code, 0, callback_id);

        // Give the script a moment to actually start spinning.
        thread::sleep(Duration::from_millis(50));
        ctx.cancel_task(task_id);

        let result = await_callback(callback_id);
        assert_eq!(result.tag, ValueTag::TerminatedException);
        assert_eq!(result.text, "execution terminated");

        // Cancelling again, or cancelling junk, is a no-op.
        ctx.cancel_task(task_id);
        ctx.cancel_task(9_999_999);
    }

    #[test]
    fn object_access() {
        let ctx = new_context();

        let obj = eval(&ctx, "({a: 1, b: 'x'})", 0);
        assert_eq!(obj.tag, ValueTag::Object);
        let obj = obj.handle as ValueHandle;

        let key = ctx.alloc_string_val("b", ValueTag::StrUtf8);
        let item = snapshot(ctx.get_object_item(obj, key));
        assert_eq!(item.tag, ValueTag::StrUtf8);
        assert_eq!(item.text, "x");

        let missing = ctx.alloc_string_val("nope", ValueTag::StrUtf8);
        let item = snapshot(ctx.get_object_item(obj, missing));
        assert_eq!(item.tag, ValueTag::KeyException);
        assert!(item.text.contains("nope"));

        let names = ctx.get_own_property_names(obj);
        let first = ctx.alloc_int_val(0, ValueTag::Integer);
        let second = ctx.alloc_int_val(1, ValueTag::Integer);
        assert_eq!(snapshot(ctx.get_object_item(names, first)).text, "a");
        assert_eq!(snapshot(ctx.get_object_item(names, second)).text, "b");
    }

    #[test]
    fn object_set_and_delete() {
        let ctx = new_context();

        let obj = eval(&ctx, "({})", 0).handle as ValueHandle;
        let key = ctx.alloc_string_val("answer", ValueTag::StrUtf8);
        let val = ctx.alloc_int_val(42, ValueTag::Integer);

        let done = snapshot(ctx.set_object_item(obj, key, val));
        assert_eq!(done.tag, ValueTag::Bool);
        assert_eq!(done.int_val, 1);

        let item = snapshot(ctx.get_object_item(obj, key));
        assert_eq!(item.tag, ValueTag::Integer);
        assert_eq!(item.int_val, 42);

        let done = snapshot(ctx.del_object_item(obj, key));
        assert_eq!(done.tag, ValueTag::Bool);
        assert_eq!(done.int_val, 1);

        let item = snapshot(ctx.get_object_item(obj, key));
        assert_eq!(item.tag, ValueTag::KeyException);
    }

    #[test]
    fn identity_hash_matches_object_value() {
        let ctx = new_context();

        let obj = eval(&ctx, "globalThis.keep = {}; keep", 0);
        assert_eq!(obj.tag, ValueTag::Object);

        let hash = snapshot(ctx.get_identity_hash(obj.handle as ValueHandle));
        assert_eq!(hash.tag, ValueTag::Integer);
        // The object value itself records the identity hash at conversion.
        assert_eq!(hash.int_val, obj.int_val);

        let again = eval(&ctx, "keep", 0);
        assert_eq!(again.int_val, obj.int_val);
    }

    #[test]
    fn splice_array() {
        let ctx = new_context();

        let arr = eval(&ctx, "globalThis.arr = [1, 2, 3]; arr", 0).handle as ValueHandle;

        // Remove the first element.
        let deleted = ctx.splice_array(arr, 0, 1, None);
        let zero = ctx.alloc_int_val(0, ValueTag::Integer);
        let item = snapshot(ctx.get_object_item(deleted, zero));
        assert_eq!(item.tag, ValueTag::Integer);
        assert_eq!(item.int_val, 1);

        // Insert a replacement at the front.
        let replacement = ctx.alloc_string_val("z", ValueTag::StrUtf8);
        ctx.splice_array(arr, 0, 0, Some(replacement));
        let first = snapshot(ctx.get_object_item(arr, zero));
        assert_eq!(first.tag, ValueTag::StrUtf8);
        assert_eq!(first.text, "z");

        let length = eval(&ctx, "arr.length", 0);
        assert_eq!(length.int_val, 3);
    }

    #[test]
    fn call_function_applies_arguments() {
        let ctx = new_context();

        let func = eval(&ctx, "(function (a, b) { return a + b })", 0).handle as ValueHandle;
        let this = ctx.alloc_int_val(0, ValueTag::Null);
        let argv = eval(&ctx, "[19, 23]", 0).handle as ValueHandle;

        let callback_id = next_callback_id();
        ctx.call_function(func, this, argv, callback_id);
        let result = await_callback(callback_id);
        assert_eq!(result.tag, ValueTag::Integer);
        assert_eq!(result.int_val, 42);
    }

    #[test]
    fn promise_then_settles_once() {
        let ctx = new_context();

        let promise = eval(&ctx, "Promise.resolve(7)", 0).handle as ValueHandle;
        let callback_id = next_callback_id();
        let attached = snapshot(ctx.attach_promise_then(promise, callback_id));
        assert_eq!(attached.tag, ValueTag::Bool);
        assert_eq!(attached.int_val, 1);

        let result = await_callback(callback_id);
        assert_eq!(result.tag, ValueTag::Integer);
        assert_eq!(result.int_val, 7);
    }

    #[test]
    fn promise_rejection_becomes_execute_exception() {
        let ctx = new_context();

        let promise = eval(&ctx, "Promise.reject(new Error('denied'))", 0).handle as ValueHandle;
        let callback_id = next_callback_id();
        ctx.attach_promise_then(promise, callback_id);

        let result = await_callback(callback_id);
        assert_eq!(result.tag, ValueTag::ExecuteException);
        assert!(result.text.contains("denied"));
    }

    #[test]
    fn js_callback_round_trip() {
        let ctx = new_context();

        let js_callback_id = next_callback_id();
        let func = ctx.make_js_callback(js_callback_id);
        assert_eq!(snapshot(func).tag, ValueTag::Function);

        let this = ctx.alloc_int_val(0, ValueTag::Null);
        let argv = eval(&ctx, "['ping', 5]", 0).handle as ValueHandle;

        let call_id = next_callback_id();
        ctx.call_function(func, this, argv, call_id);

        // The JS function forwarded its arguments as an array value.
        let forwarded = await_callback(js_callback_id);
        assert_eq!(forwarded.tag, ValueTag::Object);
        await_callback(call_id);
    }

    #[test]
    fn array_buffer_round_trip() {
        let ctx = new_context();

        let buf = eval(&ctx, "new Uint8Array([1, 2, 3]).buffer", 0);
        assert_eq!(buf.tag, ValueTag::ArrayBuffer);
        assert_eq!(buf.bytes, vec![1, 2, 3]);
        assert_eq!(ctx.backing_store_count(), 1);

        ctx.free_value(buf.handle as ValueHandle);
        assert_eq!(ctx.backing_store_count(), 0);
    }

    #[test]
    fn typed_array_view_respects_offset() {
        let ctx = new_context();

        let view = eval(&ctx, "new Uint8Array([9, 8, 7, 6]).subarray(1, 3)", 0);
        assert_eq!(view.tag, ValueTag::ArrayBuffer);
        assert_eq!(view.bytes, vec![8, 7]);
    }

    #[test]
    fn date_round_trip() {
        let ctx = new_context();

        let date = eval(&ctx, "new Date(1700000000000)", 0);
        assert_eq!(date.tag, ValueTag::Date);
        assert_eq!(date.double_val, 1_700_000_000_000.0);

        // Render a native date back into JS.
        let obj = eval(&ctx, "({})", 0).handle as ValueHandle;
        let key = ctx.alloc_string_val("when", ValueTag::StrUtf8);
        let val = ctx.alloc_double_val(1_700_000_000_000.0, ValueTag::Date);
        ctx.set_object_item(obj, key, val);
        let item = snapshot(ctx.get_object_item(obj, key));
        assert_eq!(item.tag, ValueTag::Date);
        assert_eq!(item.double_val, 1_700_000_000_000.0);
    }

    #[test]
    fn freed_handles_resolve_to_value_exceptions() {
        let ctx = new_context();

        let handle = ctx.alloc_int_val(5, ValueTag::Integer);
        ctx.free_value(handle);
        ctx.free_value(handle); // idempotent

        let result = snapshot(ctx.get_identity_hash(handle));
        assert_eq!(result.tag, ValueTag::ValueException);
        assert!(result.text.contains("Bad handle"));

        let junk = 0xbad_c0de_usize as ValueHandle;
        let result = snapshot(ctx.get_object_item(junk, junk));
        assert_eq!(result.tag, ValueTag::ValueException);
    }

    #[test]
    fn async_error_handles_still_fire_the_callback() {
        let ctx = new_context();

        let callback_id = next_callback_id();
        let junk = 0xbad_f00d_usize as ValueHandle;
        ctx.eval(junk, 0, callback_id);

        let result = await_callback(callback_id);
        assert_eq!(result.tag, ValueTag::ValueException);
        assert!(result.text.contains("Bad handle: code"));
    }

    #[test]
    fn value_count_tracks_the_registry() {
        let ctx = new_context();
        assert_eq!(ctx.value_count(), 0);

        let a = ctx.alloc_int_val(1, ValueTag::Integer);
        let b = ctx.alloc_string_val("x", ValueTag::StrUtf8);
        assert_eq!(ctx.value_count(), 2);

        ctx.free_value(a);
        ctx.free_value(b);
        assert_eq!(ctx.value_count(), 0);
    }

    #[test]
    fn heap_stats_report_is_json() {
        let ctx = new_context();

        let callback_id = next_callback_id();
        ctx.heap_stats(callback_id);
        let report = await_callback(callback_id);
        assert_eq!(report.tag, ValueTag::StrUtf8);

        let parsed: serde_json::Value = serde_json::from_str(&report.text).unwrap();
        assert!(parsed["used_heap_size"].as_u64().unwrap() > 0);
        assert!(parsed["total_heap_size"].as_u64().unwrap() > 0);
        assert!(parsed.get("heap_size_limit").is_some());
    }

    #[test]
    fn soft_memory_limit_flags_without_termination() {
        let ctx = new_context();

        // A floor of one byte means any script breaches the soft quota,
        // which must flag but never kill the run.
        ctx.set_soft_memory_limit(1);
        let result = eval(&ctx, "let s = 'x'.repeat(100000); s.length", 0);
        assert_eq!(result.tag, ValueTag::Integer);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !ctx.soft_memory_limit_reached() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(ctx.soft_memory_limit_reached());
        assert!(!ctx.hard_memory_limit_reached());

        // Raising the limit resets the flag.
        ctx.set_soft_memory_limit(usize::MAX);
        assert!(!ctx.soft_memory_limit_reached());
    }

    #[test]
    fn hard_memory_limit_terminates_with_oom() {
        let ctx = new_context();

        ctx.set_hard_memory_limit(1);
        let result = eval(&ctx, "let a = []; while (true) { a.push('block'.repeat(1000)) }", 0);
        assert_eq!(result.tag, ValueTag::OomException);
        assert!(ctx.hard_memory_limit_reached());
    }

    #[test]
    fn teardown_fires_pending_callbacks_first() {
        let ctx = new_context();

        let callback_id = next_callback_id();
        let code = ctx.alloc_string_val("6*7", ValueTag::StrUtf8);
        ctx.eval(code, 0, callback_id);
        drop(ctx);

        // The callback must already be there: teardown waits for it.
        let (map, _) = &*SINK;
        let settled = map.lock().unwrap().remove(&callback_id);
        let result = settled.expect("callback did not fire before teardown finished");
        assert_eq!(result.int_val, 42);
    }

    #[test]
    fn context_registry_round_trip() {
        init_v8("");

        let id = init_context(sink_callback);
        assert!(get_context(id).is_some());
        assert!(context_count() >= 1);

        free_context(id);
        assert!(get_context(id).is_none());

        // Unknown ids are a no-op.
        free_context(id);
    }

    #[test]
    fn v8_version_looks_sane() {
        assert!(v8_version().split('.').count() >= 3);
    }

    #[test]
    fn low_memory_notification_is_fire_and_forget() {
        let ctx = new_context();
        ctx.low_memory_notification();
        // The pump is still healthy afterwards.
        let result = eval(&ctx, "2+2", 0);
        assert_eq!(result.int_val, 4);
    }
}
