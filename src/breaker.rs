use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Enforces a wall-clock timeout on a single evaluation.
///
/// A helper thread sleeps on a channel for the timeout; if nobody
/// disengages it in time, it flags the timeout and terminates the running
/// script. The evaluator reads the flag afterwards to classify the failure
/// as a timeout rather than a plain termination.
pub struct BreakerThread {
    disengage_tx: Option<mpsc::Sender<()>>,
    timed_out: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl BreakerThread {
    pub fn new(handle: v8::IsolateHandle, timeout: Duration) -> BreakerThread {
        let (disengage_tx, rx) = mpsc::channel();
        let timed_out = Arc::new(AtomicBool::new(false));

        let flag = timed_out.clone();
        let thread = thread::spawn(move || {
            if let Err(mpsc::RecvTimeoutError::Timeout) = rx.recv_timeout(timeout) {
                flag.store(true, Ordering::SeqCst);
                handle.terminate_execution();
            }
        });

        BreakerThread {
            disengage_tx: Some(disengage_tx),
            timed_out,
            thread: Some(thread),
        }
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
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

impl Drop for BreakerThread {
    fn drop(&mut self) {
        self.disengage();
    }
}
