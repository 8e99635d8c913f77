use crate::isolate::IsolateHolder;
use crate::memory::MemoryLimits;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

/// A unit of work shipped to the pump thread.
pub type PumpTask = Box<dyn FnOnce(&mut v8::Isolate) + Send + 'static>;

/// Cheap, cloneable entry point to the pump's task queue.
#[derive(Clone)]
pub struct TaskSpawner {
    sender: mpsc::Sender<PumpTask>,
}

impl TaskSpawner {
    /// Posts a task. Tasks posted from the same thread run in submission
    /// order. Posting after the pump has exited is silently dropped.
    pub fn spawn(&self, task: impl FnOnce(&mut v8::Isolate) + Send + 'static) {
        if self.sender.send(Box::new(task)).is_err() {
            tracing::trace!("task posted after the pump exited; dropped");
        }
    }

    #[cfg(test)]
    pub fn disconnected() -> TaskSpawner {
        let (sender, _receiver) = mpsc::channel();
        TaskSpawner { sender }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpState {
    /// JavaScript may run; microtasks settle after every task.
    Run = 0,
    /// The pump keeps serving cleanup work but JS execution is over.
    NoJavaScript = 1,
    /// The pump drains its queue and exits.
    Stop = 2,
}

fn load_state(state: &AtomicU8) -> PumpState {
    match state.load(Ordering::SeqCst) {
        0 => PumpState::Run,
        1 => PumpState::NoJavaScript,
        _ => PumpState::Stop,
    }
}

/// Owns the isolate by hiding it inside a dedicated pump thread.
///
/// Isolates are not thread safe, and the locker dance is fragile once
/// tasks, promises and microtasks are mixed, so nothing else ever sees the
/// isolate pointer. Anything that wants to interact with the isolate gets
/// in line through [`IsolateManager::run`] and runs on the pump.
pub struct IsolateManager {
    spawner: TaskSpawner,
    state: Arc<AtomicU8>,
    isolate_handle: v8::IsolateHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl IsolateManager {
    pub fn new(limits: Arc<MemoryLimits>) -> IsolateManager {
        let (sender, tasks) = mpsc::channel::<PumpTask>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let state = Arc::new(AtomicU8::new(PumpState::Run as u8));

        let pump_state = state.clone();
        let thread = thread::Builder::new()
            .name("isolate-pump".into())
            .spawn(move || pump_messages(tasks, pump_state, limits, ready_tx))
            .expect("failed to spawn the isolate pump thread");

        let isolate_handle = ready_rx.recv().expect("the isolate pump never came up");

        IsolateManager {
            spawner: TaskSpawner { sender },
            state,
            isolate_handle,
            thread: Some(thread),
        }
    }

    pub fn spawner(&self) -> TaskSpawner {
        self.spawner.clone()
    }

    /// A handle usable from any thread to interrupt running JavaScript.
    pub fn isolate_handle(&self) -> v8::IsolateHandle {
        self.isolate_handle.clone()
    }

    /// Posts a task and returns a receiver for its result.
    pub fn run<T, F>(&self, runnable: F) -> mpsc::Receiver<T>
    where
        F: FnOnce(&mut v8::Isolate) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = mpsc::channel();
        self.spawner.spawn(move |isolate| {
            let _ = result_tx.send(runnable(isolate));
        });
        result_rx
    }

    /// Posts a task and blocks for its result. Must not be called from the
    /// pump thread itself.
    pub fn run_and_await<T, F>(&self, runnable: F) -> T
    where
        F: FnOnce(&mut v8::Isolate) -> T + Send + 'static,
        T: Send + 'static,
    {
        self.run(runnable).recv().expect("isolate pump dropped a task")
    }

    /// Interrupts whatever JavaScript is currently executing. Safe from any
    /// thread.
    pub fn terminate_ongoing_task(&self) {
        self.isolate_handle.terminate_execution();
    }

    /// Whether new JavaScript may still enter the engine.
    pub fn javascript_allowed(&self) -> bool {
        load_state(&self.state) == PumpState::Run
    }

    /// Ends JavaScript execution for good while keeping the pump alive for
    /// cleanup tasks.
    pub fn stop_javascript(&self) {
        self.change_state(PumpState::NoJavaScript);
        self.terminate_ongoing_task();
    }

    fn change_state(&self, next: PumpState) {
        tracing::debug!(state = ?next, "pump state change");
        self.state.store(next as u8, Ordering::SeqCst);
        // A no-op task kicks the message loop into noticing the switch.
        self.spawner.spawn(|_| {});
    }
}

impl Drop for IsolateManager {
    fn drop(&mut self) {
        self.change_state(PumpState::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// The pump: creates the isolate, then serves the task queue until told to
/// stop. Blocking on `recv` is the wait-for-work mode; state changes arrive
/// as no-op tasks.
fn pump_messages(
    tasks: mpsc::Receiver<PumpTask>,
    state: Arc<AtomicU8>,
    limits: Arc<MemoryLimits>,
    ready: mpsc::Sender<v8::IsolateHandle>,
) {
    let mut holder = IsolateHolder::new();
    let isolate = holder.isolate_mut();

    if ready.send(isolate.thread_safe_handle()).is_err() {
        return;
    }
    tracing::debug!("isolate pump started");

    while load_state(&state) == PumpState::Run {
        let Ok(task) = tasks.recv() else { return };
        task(isolate);
        pump_platform_tasks(isolate);

        if load_state(&state) == PumpState::Run {
            isolate.perform_microtask_checkpoint();
            limits.check(isolate);
        }
    }

    // JavaScript is over; keep serving handle drops and collector drains.
    while load_state(&state) == PumpState::NoJavaScript {
        let Ok(task) = tasks.recv() else { return };
        task(isolate);
        pump_platform_tasks(isolate);
    }

    // Stop: serve what is already queued, then let the isolate drop.
    while let Ok(task) = tasks.try_recv() {
        task(isolate);
    }
    pump_platform_tasks(isolate);
    tracing::debug!("isolate pump exiting");
}

fn pump_platform_tasks(isolate: &mut v8::Isolate) {
    while v8::Platform::pump_message_loop(&v8::V8::get_current_platform(), isolate, false) {}
}
