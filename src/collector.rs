use crate::manager::TaskSpawner;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;

/// Isolate-owned objects that came due on a thread that must not touch the
/// isolate. Dropped on the pump thread by a drain task.
pub enum Garbage {
    Handle(v8::Global<v8::Value>),
    Context(v8::Global<v8::Context>),
}

// Persistent handles are owned by the isolate, not by the thread carrying
// them; queued garbage is never dereferenced and only dropped on the pump.
unsafe impl Send for Garbage {}

#[derive(Default)]
struct CollectorQueue {
    garbage: Vec<Garbage>,
    collecting: bool,
}

/// Defers destruction of isolate-owned objects to the pump thread.
///
/// Values handed to foreign code are freed from arbitrary threads, but their
/// persistent handles belong to the isolate. Deleters queue up here, and a
/// drain task posted to the isolate manager drops them where the isolate
/// lives. Drains never block the pump; teardown can wait on the condvar for
/// the queue to go quiet.
pub struct IsolateObjectCollector {
    spawner: TaskSpawner,
    queue: Mutex<CollectorQueue>,
    drained: Condvar,
}

impl IsolateObjectCollector {
    pub fn new(spawner: TaskSpawner) -> IsolateObjectCollector {
        IsolateObjectCollector {
            spawner,
            queue: Mutex::new(CollectorQueue::default()),
            drained: Condvar::new(),
        }
    }

    /// Queues garbage and schedules a drain if none is in flight.
    ///
    /// Deliberately does not wait for the drain: frees are often triggered
    /// by host callbacks running on the pump itself, and waiting here would
    /// deadlock the message loop.
    pub fn collect(self: &Arc<Self>, garbage: Garbage) {
        let mut queue = self.queue.lock().unwrap();
        queue.garbage.push(garbage);
        if !queue.collecting {
            queue.collecting = true;
            self.schedule_drain();
        }
    }

    fn schedule_drain(self: &Arc<Self>) {
        let collector = Arc::clone(self);
        self.spawner.spawn(move |_isolate| collector.drain());
    }

    /// Runs on the pump thread. Drops queued garbage in batches until the
    /// queue stays empty.
    fn drain(self: &Arc<Self>) {
        loop {
            let batch = {
                let mut queue = self.queue.lock().unwrap();
                std::mem::take(&mut queue.garbage)
            };

            drop(batch);

            let mut queue = self.queue.lock().unwrap();
            if queue.garbage.is_empty() {
                queue.collecting = false;
                self.drained.notify_all();
                return;
            }
        }
    }

    /// Blocks until every queued deleter has run. Must not be called from
    /// the pump thread.
    pub fn wait_until_drained(&self) {
        let mut queue = self.queue.lock().unwrap();
        while queue.collecting || !queue.garbage.is_empty() {
            queue = self.drained.wait(queue).unwrap();
        }
    }
}
