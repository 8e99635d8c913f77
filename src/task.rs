use crate::manager::IsolateManager;
use crate::value::ValuePtr;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    NotStarted,
    Running,
    Completed,
    Canceled,
}

/// Status of one cancelable task. `Completed` and `Canceled` are terminal;
/// exactly one of the two terminal callbacks fires per task.
pub struct CancelableTaskState {
    state: Mutex<TaskState>,
    isolate_handle: v8::IsolateHandle,
}

impl CancelableTaskState {
    fn new(isolate_handle: v8::IsolateHandle) -> CancelableTaskState {
        CancelableTaskState {
            state: Mutex::new(TaskState::NotStarted),
            isolate_handle,
        }
    }

    /// Safe and idempotent from any thread. Cancelling a running task
    /// interrupts whatever JavaScript the isolate is executing.
    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        match *state {
            TaskState::Completed | TaskState::Canceled => return,
            TaskState::Running => {
                self.isolate_handle.terminate_execution();
            }
            TaskState::NotStarted => {}
        }
        *state = TaskState::Canceled;
    }

    fn set_running_if_not_canceled(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == TaskState::Canceled {
            return false;
        }
        *state = TaskState::Running;
        true
    }

    fn set_complete_if_not_canceled(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == TaskState::Canceled {
            return false;
        }
        *state = TaskState::Completed;
        true
    }
}

/// Grafts cancelable, id-addressable tasks onto the isolate manager.
///
/// The runnable and the two terminal callbacks are separate functors on
/// purpose: a cancel can race the end of the runnable, so result data must
/// only ever flow through `on_completed`. The runnable may well run to
/// completion and still be reported canceled; the only guarantee is that
/// exactly one of the terminal callbacks fires.
pub struct CancelableTaskRunner {
    manager: Arc<IsolateManager>,
    next_task_id: AtomicU64,
    tasks: Mutex<HashMap<u64, Arc<CancelableTaskState>>>,
}

impl CancelableTaskRunner {
    pub fn new(manager: Arc<IsolateManager>) -> CancelableTaskRunner {
        CancelableTaskRunner {
            manager,
            next_task_id: AtomicU64::new(1),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Schedules `runnable` on the pump and returns the task id to cancel
    /// it by. Tasks arriving after JavaScript has been stopped are
    /// reported canceled instead of entering the engine.
    pub fn schedule<R, C, X>(
        self: &Arc<Self>,
        runnable: R,
        on_completed: C,
        on_canceled: X,
    ) -> u64
    where
        R: FnOnce(&mut v8::Isolate) -> ValuePtr + Send + 'static,
        C: FnOnce(ValuePtr) + Send + 'static,
        X: FnOnce() + Send + 'static,
    {
        let state = Arc::new(CancelableTaskState::new(self.manager.isolate_handle()));
        let task_id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
        self.tasks.lock().unwrap().insert(task_id, state.clone());

        let runner = Arc::clone(self);
        self.manager.spawner().spawn(move |isolate| {
            if !runner.manager.javascript_allowed() || !state.set_running_if_not_canceled() {
                on_canceled();
                runner.erase(task_id);
                return;
            }

            let result = runnable(isolate);

            if !state.set_complete_if_not_canceled() {
                // Canceled while running; the result is discarded.
                on_canceled();
                runner.erase(task_id);
                return;
            }

            on_completed(result);
            runner.erase(task_id);
        });

        task_id
    }

    /// Cancels by id. Unknown or already-finished ids are a no-op.
    pub fn cancel(&self, task_id: u64) {
        let state = self.tasks.lock().unwrap().get(&task_id).cloned();
        if let Some(state) = state {
            tracing::debug!(task_id, "cancel requested");
            state.cancel();
        }
    }

    fn erase(&self, task_id: u64) {
        self.tasks.lock().unwrap().remove(&task_id);
    }
}

/// Counts in-flight tasks so teardown can wait for every terminal callback
/// to have fired.
#[derive(Default)]
pub struct CountDownLatch {
    count: Mutex<i64>,
    zeroed: Condvar,
}

impl CountDownLatch {
    pub fn increment(&self) {
        *self.count.lock().unwrap() += 1;
    }

    pub fn decrement(&self) {
        let mut count = self.count.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            self.zeroed.notify_all();
        }
    }

    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count != 0 {
            count = self.zeroed.wait(count).unwrap();
        }
    }
}
