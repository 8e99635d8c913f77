/// Owns one isolate together with its array-buffer allocator and applies
/// the runtime-wide isolate configuration.
pub struct IsolateHolder {
    isolate: v8::OwnedIsolate,
}

impl IsolateHolder {
    /// Creates the isolate. Called on the pump thread, which is the only
    /// thread that will ever touch the result.
    pub fn new() -> IsolateHolder {
        let allocator = v8::new_default_allocator().make_shared();
        let params = v8::CreateParams::default().array_buffer_allocator(allocator);
        let mut isolate = v8::Isolate::new(params);

        // Promise reactions run only at our explicit microtask checkpoints.
        isolate.set_microtasks_policy(v8::MicrotasksPolicy::Explicit);
        isolate.set_capture_stack_trace_for_uncaught_exceptions(true, 10);

        IsolateHolder { isolate }
    }

    pub fn isolate_mut(&mut self) -> &mut v8::Isolate {
        &mut self.isolate
    }
}
