use crate::callback::caller_from_data;
use crate::callback::pack_caller_data;
use crate::context::ContextHolder;
use crate::exceptions::value_to_string;
use crate::value::BinaryValue;
use crate::value::ValueFactory;
use crate::value::ValuePtr;
use crate::value::ValueTag;
use std::sync::Arc;

/// Attaches settlement handlers to a JS promise so the host learns the
/// outcome through its callback.
pub struct PromiseAttacher {
    context: Arc<ContextHolder>,
    factory: Arc<ValueFactory>,
    caller_id: u64,
}

impl PromiseAttacher {
    pub fn new(
        context: Arc<ContextHolder>,
        factory: Arc<ValueFactory>,
        caller_id: u64,
    ) -> PromiseAttacher {
        PromiseAttacher {
            context,
            factory,
            caller_id,
        }
    }

    /// Attaches `then(onFulfilled, onRejected)` to the promise. Whichever
    /// branch settles converts its value (rejections become
    /// `execute_exception`) and fires the host callback with
    /// `(callback_id, handle)` exactly once: a promise settles exactly
    /// once, and its handlers die with it. Must run on the pump.
    pub fn attach_promise_then(
        &self,
        isolate: &mut v8::Isolate,
        promise: &BinaryValue,
        callback_id: u64,
    ) -> ValuePtr {
        let context = self.context.get();
        let scope = &mut v8::HandleScope::with_context(isolate, context);

        let local = promise
            .to_v8(scope)
            .and_then(|value| v8::Local::<v8::Promise>::try_from(value).ok());
        let Some(local_promise) = local else {
            return self
                .factory
                .exception(ValueTag::ValueException, "target is not a promise");
        };

        let data = pack_caller_data(scope, self.caller_id, callback_id);

        let builder = v8::FunctionBuilder::new(on_fulfilled).data(data.into());
        let Some(on_fulfilled) = v8::FunctionBuilder::<v8::Function>::build(builder, scope) else {
            return self
                .factory
                .exception(ValueTag::ValueException, "failed to build settlement handler");
        };
        let builder = v8::FunctionBuilder::new(on_rejected).data(data.into());
        let Some(on_rejected) = v8::FunctionBuilder::<v8::Function>::build(builder, scope) else {
            return self
                .factory
                .exception(ValueTag::ValueException, "failed to build settlement handler");
        };

        if local_promise
            .then2(scope, on_fulfilled, on_rejected)
            .is_none()
        {
            return self
                .factory
                .exception(ValueTag::ExecuteException, "could not attach to the promise");
        }

        self.factory.boolean(true)
    }
}

fn on_fulfilled(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    let Some((caller, callback_id)) = caller_from_data(scope, args.data()) else {
        return;
    };

    let value = args.get(0);
    let result = caller.convert(scope, value);
    caller.invoke(callback_id, result);
}

fn on_rejected(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    let Some((caller, callback_id)) = caller_from_data(scope, args.data()) else {
        return;
    };

    let error = args.get(0);
    let message = value_to_string(scope, error).unwrap_or_default();
    let result = caller
        .factory()
        .exception(ValueTag::ExecuteException, &message);
    caller.invoke(callback_id, result);
}
