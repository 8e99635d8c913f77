use crate::value::ValueFactory;
use crate::value::ValuePtr;
use crate::value::ValueTag;
use std::sync::Arc;

/// Stringifies a JavaScript value, treating an empty result as absent.
pub fn value_to_string(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> Option<String> {
    let string = value.to_string(scope)?;
    let text = string.to_rust_string_lossy(scope);
    (!text.is_empty()).then_some(text)
}

/// Folds a caught exception into an exception-variant value with the given
/// tag. Prefers the stack trace, which already embeds the exception
/// message; falls back to the bare exception string; falls back to an
/// empty message the recipient can replace based on the tag alone.
pub fn summarize_try_catch(
    tc_scope: &mut v8::TryCatch<v8::HandleScope>,
    factory: &Arc<ValueFactory>,
    tag: ValueTag,
) -> ValuePtr {
    if let Some(trace) = tc_scope.stack_trace() {
        if let Some(text) = value_to_string(tc_scope, trace) {
            return factory.exception(tag, &text);
        }
    }

    if let Some(exception) = tc_scope.exception() {
        if !exception.is_null() {
            if let Some(text) = value_to_string(tc_scope, exception) {
                return factory.exception(tag, &text);
            }
        }
    }

    factory.exception(tag, "")
}
