use std::ffi::c_void;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How often an in-flight script is interrupted for a quota check.
const CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Soft and hard heap quotas with their reached-flags.
///
/// The flags are written only on the isolate thread (from the pump's
/// post-task check or from an interrupt requested by [`MemoryWatch`]), so
/// querying them from foreign threads is a plain scalar read.
#[derive(Default)]
pub struct MemoryLimits {
    soft_limit: AtomicUsize,
    soft_reached: AtomicBool,
    hard_limit: AtomicUsize,
    hard_reached: AtomicBool,
}

impl MemoryLimits {
    /// Sets the soft limit and resets its reached-flag. Zero disables it.
    pub fn set_soft_limit(&self, limit: usize) {
        self.soft_limit.store(limit, Ordering::SeqCst);
        self.soft_reached.store(false, Ordering::SeqCst);
    }

    /// Sets the hard limit and resets its reached-flag. Zero disables it.
    pub fn set_hard_limit(&self, limit: usize) {
        self.hard_limit.store(limit, Ordering::SeqCst);
        self.hard_reached.store(false, Ordering::SeqCst);
    }

    pub fn soft_reached(&self) -> bool {
        self.soft_reached.load(Ordering::SeqCst)
    }

    pub fn hard_reached(&self) -> bool {
        self.hard_reached.load(Ordering::SeqCst)
    }

    /// Clears both reached-flags at the start of an evaluation.
    pub fn reset_reached(&self) {
        self.soft_reached.store(false, Ordering::SeqCst);
        self.hard_reached.store(false, Ordering::SeqCst);
    }

    pub fn configured(&self) -> bool {
        self.soft_limit.load(Ordering::SeqCst) > 0 || self.hard_limit.load(Ordering::SeqCst) > 0
    }

    /// Reads the heap and updates the flags. Runs on the isolate thread
    /// only. A soft breach raises a moderate memory-pressure notification;
    /// a hard breach terminates the running script.
    pub fn check(&self, isolate: &mut v8::Isolate) {
        if !self.configured() {
            return;
        }

        let mut stats = v8::HeapStatistics::default();
        isolate.get_heap_statistics(&mut stats);
        let used = stats.used_heap_size();

        let soft_limit = self.soft_limit.load(Ordering::SeqCst);
        if soft_limit > 0 {
            let soft_hit = used > soft_limit;
            self.soft_reached.store(soft_hit, Ordering::SeqCst);
            isolate.memory_pressure_notification(if soft_hit {
                v8::MemoryPressureLevel::Moderate
            } else {
                v8::MemoryPressureLevel::None
            });
        }

        let hard_limit = self.hard_limit.load(Ordering::SeqCst);
        if hard_limit > 0 && used > hard_limit {
            tracing::debug!(used, hard_limit, "hard memory limit breached");
            self.hard_reached.store(true, Ordering::SeqCst);
            isolate.terminate_execution();
        }
    }
}

/// Enforces the heap quotas inside a single long-running script.
///
/// The engine offers no GC hook here, so while a script is on the stack a
/// watcher thread periodically requests an isolate interrupt; the interrupt
/// callback performs the same check the pump runs between tasks.
/// Disengaged (or dropped) when the evaluation finishes.
pub struct MemoryWatch {
    disengage_tx: Option<mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl MemoryWatch {
    pub fn new(handle: v8::IsolateHandle, limits: Arc<MemoryLimits>) -> MemoryWatch {
        let (disengage_tx, rx) = mpsc::channel();

        let thread = thread::spawn(move || {
            while let Err(mpsc::RecvTimeoutError::Timeout) = rx.recv_timeout(CHECK_INTERVAL) {
                // The pointer handed to the interrupt stays valid until the
                // isolate is gone: the runtime context holds its own strong
                // reference to `limits` and releases it only after the pump
                // thread has joined.
                let data = Arc::as_ptr(&limits) as *mut c_void;
                handle.request_interrupt(memory_interrupt, data);
            }
        });

        MemoryWatch {
            disengage_tx: Some(disengage_tx),
            thread: Some(thread),
        }
    }

    pub fn disengage(&mut self) {
        if let Some(tx) = self.disengage_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MemoryWatch {
    fn drop(&mut self) {
        self.disengage();
    }
}

extern "C" fn memory_interrupt(isolate: &mut v8::Isolate, data: *mut c_void) {
    let limits = unsafe { &*(data as *const MemoryLimits) };
    limits.check(isolate);
}
