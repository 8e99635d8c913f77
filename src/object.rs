use crate::context::ContextHolder;
use crate::exceptions::summarize_try_catch;
use crate::value::BinaryValue;
use crate::value::ValueFactory;
use crate::value::ValuePtr;
use crate::value::ValueTag;
use std::sync::Arc;

/// Reads, writes and calls into handle-resident objects.
///
/// Every method runs on the pump thread; the caller resolves the handles
/// and keeps the values alive for the duration of the call. Engine
/// exceptions fold into exception-variant values, never panics.
pub struct ObjectManipulator {
    context: Arc<ContextHolder>,
    factory: Arc<ValueFactory>,
}

impl ObjectManipulator {
    pub fn new(context: Arc<ContextHolder>, factory: Arc<ValueFactory>) -> ObjectManipulator {
        ObjectManipulator { context, factory }
    }

    pub fn identity_hash(&self, isolate: &mut v8::Isolate, obj: &BinaryValue) -> ValuePtr {
        let context = self.context.get();
        let scope = &mut v8::HandleScope::with_context(isolate, context);

        let Some(target) = resolve_object(scope, obj) else {
            return self.bad_target();
        };

        let hash = i64::from(target.get_identity_hash().get()) as u64;
        self.factory.integer(hash)
    }

    pub fn own_property_names(&self, isolate: &mut v8::Isolate, obj: &BinaryValue) -> ValuePtr {
        let context = self.context.get();
        let scope = &mut v8::HandleScope::with_context(isolate, context);
        let tc_scope = &mut v8::TryCatch::new(scope);

        let Some(target) = resolve_object(tc_scope, obj) else {
            return self.bad_target();
        };

        match target.get_own_property_names(tc_scope, Default::default()) {
            Some(names) => self.convert(tc_scope, names.into()),
            None => summarize_try_catch(tc_scope, &self.factory, ValueTag::ExecuteException),
        }
    }

    pub fn get(
        &self,
        isolate: &mut v8::Isolate,
        obj: &BinaryValue,
        key: &BinaryValue,
    ) -> ValuePtr {
        let context = self.context.get();
        let scope = &mut v8::HandleScope::with_context(isolate, context);
        let tc_scope = &mut v8::TryCatch::new(scope);

        let Some(target) = resolve_object(tc_scope, obj) else {
            return self.bad_target();
        };
        let Some(key_val) = key_to_v8(tc_scope, key) else {
            return self.bad_key();
        };

        match target.has(tc_scope, key_val) {
            Some(true) => match target.get(tc_scope, key_val) {
                Some(value) => self.convert(tc_scope, value),
                None => summarize_try_catch(tc_scope, &self.factory, ValueTag::ExecuteException),
            },
            Some(false) => self.factory.exception(
                ValueTag::KeyException,
                &format!("No such key: {}", printable_key(key)),
            ),
            None => summarize_try_catch(tc_scope, &self.factory, ValueTag::ExecuteException),
        }
    }

    pub fn set(
        &self,
        isolate: &mut v8::Isolate,
        obj: &BinaryValue,
        key: &BinaryValue,
        val: &BinaryValue,
    ) -> ValuePtr {
        let context = self.context.get();
        let scope = &mut v8::HandleScope::with_context(isolate, context);
        let tc_scope = &mut v8::TryCatch::new(scope);

        let Some(target) = resolve_object(tc_scope, obj) else {
            return self.bad_target();
        };
        let Some(key_val) = key_to_v8(tc_scope, key) else {
            return self.bad_key();
        };
        let Some(value) = val.to_v8(tc_scope) else {
            return self
                .factory
                .exception(ValueTag::ValueException, "value cannot enter JavaScript");
        };

        match target.set(tc_scope, key_val, value) {
            Some(done) => self.factory.boolean(done),
            None => summarize_try_catch(tc_scope, &self.factory, ValueTag::ExecuteException),
        }
    }

    pub fn del(
        &self,
        isolate: &mut v8::Isolate,
        obj: &BinaryValue,
        key: &BinaryValue,
    ) -> ValuePtr {
        let context = self.context.get();
        let scope = &mut v8::HandleScope::with_context(isolate, context);
        let tc_scope = &mut v8::TryCatch::new(scope);

        let Some(target) = resolve_object(tc_scope, obj) else {
            return self.bad_target();
        };
        let Some(key_val) = key_to_v8(tc_scope, key) else {
            return self.bad_key();
        };

        match target.delete(tc_scope, key_val) {
            Some(done) => self.factory.boolean(done),
            None => summarize_try_catch(tc_scope, &self.factory, ValueTag::ExecuteException),
        }
    }

    /// `Array.prototype.splice` with zero or one replacement value.
    /// Returns the array of deleted elements.
    pub fn splice(
        &self,
        isolate: &mut v8::Isolate,
        array: &BinaryValue,
        start: i32,
        delete_count: i32,
        new_val: Option<&BinaryValue>,
    ) -> ValuePtr {
        let context = self.context.get();
        let scope = &mut v8::HandleScope::with_context(isolate, context);
        let tc_scope = &mut v8::TryCatch::new(scope);

        let Some(target) = resolve_object(tc_scope, array) else {
            return self.bad_target();
        };

        let Some(splice_key) = v8::String::new(tc_scope, "splice") else {
            return self.bad_target();
        };
        let splice_fn = target
            .get(tc_scope, splice_key.into())
            .and_then(|value| v8::Local::<v8::Function>::try_from(value).ok());
        let Some(splice_fn) = splice_fn else {
            return self
                .factory
                .exception(ValueTag::ValueException, "target has no splice method");
        };

        let mut args: Vec<v8::Local<v8::Value>> = vec![
            v8::Integer::new(tc_scope, start).into(),
            v8::Integer::new(tc_scope, delete_count).into(),
        ];
        if let Some(new_val) = new_val {
            let Some(value) = new_val.to_v8(tc_scope) else {
                return self
                    .factory
                    .exception(ValueTag::ValueException, "value cannot enter JavaScript");
            };
            args.push(value);
        }

        match splice_fn.call(tc_scope, target.into(), &args) {
            Some(deleted) => self.convert(tc_scope, deleted),
            None => summarize_try_catch(tc_scope, &self.factory, ValueTag::ExecuteException),
        }
    }

    /// `func.apply(this, argv)`. The caller schedules this as a cancelable
    /// task; a termination mid-call reports as `terminated_exception`.
    pub fn call(
        &self,
        isolate: &mut v8::Isolate,
        func: &BinaryValue,
        this: &BinaryValue,
        argv: &BinaryValue,
    ) -> ValuePtr {
        let context = self.context.get();
        let scope = &mut v8::HandleScope::with_context(isolate, context);
        let tc_scope = &mut v8::TryCatch::new(scope);

        let function = func
            .to_v8(tc_scope)
            .and_then(|value| v8::Local::<v8::Function>::try_from(value).ok());
        let Some(function) = function else {
            return self
                .factory
                .exception(ValueTag::ValueException, "call target is not a function");
        };

        let recv: v8::Local<v8::Value> = if this.tag() == ValueTag::Null {
            v8::undefined(tc_scope).into()
        } else {
            match this.to_v8(tc_scope) {
                Some(value) => value,
                None => {
                    return self
                        .factory
                        .exception(ValueTag::ValueException, "receiver cannot enter JavaScript")
                }
            }
        };

        let argv_arr = argv
            .to_v8(tc_scope)
            .and_then(|value| v8::Local::<v8::Array>::try_from(value).ok());
        let Some(argv_arr) = argv_arr else {
            return self
                .factory
                .exception(ValueTag::ValueException, "argv is not an array");
        };

        let mut args: Vec<v8::Local<v8::Value>> = Vec::with_capacity(argv_arr.length() as usize);
        for index in 0..argv_arr.length() {
            let element = argv_arr
                .get_index(tc_scope, index)
                .unwrap_or_else(|| v8::undefined(tc_scope).into());
            args.push(element);
        }

        match function.call(tc_scope, recv, &args) {
            Some(value) => self.convert(tc_scope, value),
            None => {
                if tc_scope.has_terminated() {
                    self.factory
                        .exception(ValueTag::TerminatedException, "execution terminated")
                } else {
                    summarize_try_catch(tc_scope, &self.factory, ValueTag::ExecuteException)
                }
            }
        }
    }

    fn convert(&self, scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> ValuePtr {
        self.factory.from_v8(scope, value).unwrap_or_else(|| {
            self.factory
                .exception(ValueTag::ValueException, "unsupported JavaScript value")
        })
    }

    fn bad_target(&self) -> ValuePtr {
        self.factory
            .exception(ValueTag::ValueException, "target is not an object")
    }

    fn bad_key(&self) -> ValuePtr {
        self.factory
            .exception(ValueTag::ValueException, "unsupported key type")
    }
}

/// Re-enters the stored object, if the value ever was one.
fn resolve_object<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: &BinaryValue,
) -> Option<v8::Local<'s, v8::Object>> {
    let local = value.to_v8(scope)?;
    v8::Local::<v8::Object>::try_from(local).ok()
}

/// Keys arrive either as strings (named access) or numbers (indexed
/// access); anything else is not a key.
fn key_to_v8<'s>(
    scope: &mut v8::HandleScope<'s>,
    key: &BinaryValue,
) -> Option<v8::Local<'s, v8::Value>> {
    match key.tag() {
        ValueTag::StrUtf8 => {
            v8::String::new(scope, key.as_str()).map(Into::into)
        }
        ValueTag::Integer => Some(v8::Number::new(scope, key.integer() as i64 as f64).into()),
        ValueTag::Double => Some(v8::Number::new(scope, key.double()).into()),
        _ => None,
    }
}

fn printable_key(key: &BinaryValue) -> String {
    match key.tag() {
        ValueTag::StrUtf8 => key.as_str().to_string(),
        ValueTag::Integer => (key.integer() as i64).to_string(),
        ValueTag::Double => key.double().to_string(),
        _ => "<unprintable>".to_string(),
    }
}
