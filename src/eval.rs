use crate::breaker::BreakerThread;
use crate::context::ContextHolder;
use crate::exceptions::summarize_try_catch;
use crate::memory::MemoryLimits;
use crate::memory::MemoryWatch;
use crate::value::ValueFactory;
use crate::value::ValuePtr;
use crate::value::ValueTag;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Parses and runs scripts within the isolate, enforcing the wall-clock
/// timeout and classifying failures. Runs entirely on the pump thread;
/// callers wrap it in a cancelable task.
pub struct CodeEvaluator {
    context: Arc<ContextHolder>,
    factory: Arc<ValueFactory>,
    limits: Arc<MemoryLimits>,
    full_eval_calls: AtomicU64,
    function_eval_calls: AtomicU64,
}

/// Accepts only a plain `<identifier>()` call for the fast path; property
/// paths and anything fancier take the full compile.
fn fast_call_identifier(code: &str) -> Option<&str> {
    let name = code.trim().strip_suffix("()")?;
    let mut chars = name.chars();
    let first = chars.next()?;
    if !first.is_ascii_alphabetic() && first != '_' && first != '$' {
        return None;
    }
    chars
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        .then_some(name)
}

impl CodeEvaluator {
    pub fn new(
        context: Arc<ContextHolder>,
        factory: Arc<ValueFactory>,
        limits: Arc<MemoryLimits>,
    ) -> CodeEvaluator {
        CodeEvaluator {
            context,
            factory,
            limits,
            full_eval_calls: AtomicU64::new(0),
            function_eval_calls: AtomicU64::new(0),
        }
    }

    pub fn full_eval_call_count(&self) -> u64 {
        self.full_eval_calls.load(Ordering::Relaxed)
    }

    pub fn function_eval_call_count(&self) -> u64 {
        self.function_eval_calls.load(Ordering::Relaxed)
    }

    pub fn eval(&self, isolate: &mut v8::Isolate, code: &str, timeout_ms: u64) -> ValuePtr {
        self.limits.reset_reached();

        let isolate_handle = isolate.thread_safe_handle();
        let context = self.context.get();
        let scope = &mut v8::HandleScope::with_context(isolate, context);
        let tc_scope = &mut v8::TryCatch::new(scope);

        // Quota checks piggyback on isolate interrupts while this script
        // is on the stack, and the breaker enforces the wall clock. Both
        // disengage when we return.
        let _watch = self
            .limits
            .configured()
            .then(|| MemoryWatch::new(isolate_handle.clone(), self.limits.clone()));
        let breaker = (timeout_ms > 0)
            .then(|| BreakerThread::new(isolate_handle, Duration::from_millis(timeout_ms)));

        if let Some(name) = fast_call_identifier(code) {
            if let Some(result) = self.try_fast_call(tc_scope, name) {
                return result;
            }
            // A failed fast call is not an error; take the slow path.
        }

        self.full_eval_calls.fetch_add(1, Ordering::Relaxed);

        let Some(source) = v8::String::new(tc_scope, code) else {
            return self
                .factory
                .exception(ValueTag::ParseException, "source is not a valid v8 string");
        };

        let Some(script) = v8::Script::compile(tc_scope, source, None) else {
            return summarize_try_catch(tc_scope, &self.factory, ValueTag::ParseException);
        };

        match script.run(tc_scope) {
            Some(value) => self.convert(tc_scope, value),
            None => {
                // Classification priority: OOM > timeout > terminated >
                // generic execution failure.
                let tag = if self.limits.hard_reached() {
                    ValueTag::OomException
                } else if breaker.as_ref().is_some_and(|b| b.timed_out()) {
                    ValueTag::TimeoutException
                } else if tc_scope.has_terminated() {
                    ValueTag::TerminatedException
                } else {
                    ValueTag::ExecuteException
                };
                summarize_try_catch(tc_scope, &self.factory, tag)
            }
        }
    }

    /// Looks the identifier up on the global object and, if it names a
    /// function, calls it with no arguments. `None` sends the evaluation
    /// down the slow path.
    fn try_fast_call(
        &self,
        tc_scope: &mut v8::TryCatch<v8::HandleScope>,
        name: &str,
    ) -> Option<ValuePtr> {
        let context = tc_scope.get_current_context();
        let global = context.global(tc_scope);

        let identifier = v8::String::new(tc_scope, name)?;
        let func_val = global.get(tc_scope, identifier.into())?;
        let func = v8::Local::<v8::Function>::try_from(func_val).ok()?;

        self.function_eval_calls.fetch_add(1, Ordering::Relaxed);

        let recv = v8::undefined(tc_scope);
        let value = func.call(tc_scope, recv.into(), &[])?;
        Some(self.convert(tc_scope, value))
    }

    fn convert(&self, scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> ValuePtr {
        self.factory.from_v8(scope, value).unwrap_or_else(|| {
            self.factory
                .exception(ValueTag::ValueException, "unsupported JavaScript value")
        })
    }
}
