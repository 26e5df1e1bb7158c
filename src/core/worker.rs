//! Single-flight job worker
//!
//! Controller-internal state (loading or unloading a program image,
//! touching the trace machinery) must only ever be reached from one
//! thread. The worker owns that thread: any other thread submits a job
//! and blocks until the worker executed it, getting back the job's own
//! result or failure. A job running on the worker thread may call back
//! in without deadlocking (the call executes inline).
//!
//! At most one job is pending at a time; additional callers queue on the
//! condition variables. No job is lost or double-executed, and no result
//! is ever delivered to the wrong caller.

use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use thiserror::Error;

use crate::core::control::ControlError;

/// Worker error types
#[derive(Error, Debug)]
pub enum WorkerError {
    /// No run loop is active (not started yet, or stopped)
    #[error("worker is disabled")]
    Disabled,

    /// The worker stopped while the job was pending
    #[error("worker job was interrupted")]
    Interrupted,

    /// The job itself failed; the original error is preserved
    #[error(transparent)]
    Job(#[from] ControlError),
}

type BoxedJob = Box<dyn FnOnce() + Send + 'static>;

type ResultSlot<T> = Arc<Mutex<Option<thread::Result<Result<T, ControlError>>>>>;

struct Shared {
    pending: Option<BoxedJob>,
    enabled: bool,
    finish: bool,
}

/// Single-flight job execution context
///
/// One `run_loop` invocation may be active per instance; `call` is safe
/// from any thread, including the worker thread itself.
pub struct Worker {
    state: Mutex<Shared>,
    // Kept outside `state`: the worker thread holds the state lock while
    // executing a job, and a re-entrant call must still be able to
    // identify itself.
    owner: Mutex<Option<ThreadId>>,
    todo: Condvar,
    done: Condvar,
    free: Condvar,
}

impl Worker {
    /// Create a worker with no active run loop
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Shared {
                pending: None,
                enabled: false,
                finish: false,
            }),
            owner: Mutex::new(None),
            todo: Condvar::new(),
            done: Condvar::new(),
            free: Condvar::new(),
        }
    }

    /// Whether a run loop is currently accepting jobs
    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Run the job loop on the calling thread until [`Worker::stop`]
    ///
    /// Blocks. The calling thread becomes the worker thread.
    ///
    /// # Errors
    ///
    /// Never fails without an initial job; the `Result` mirrors
    /// [`Worker::run_loop_with`].
    pub fn run_loop(&self) -> Result<(), ControlError> {
        self.begin();
        self.loop_body();
        Ok(())
    }

    /// Run one initial job, then the job loop, on the calling thread
    ///
    /// The initial job executes synchronously before any submitted job.
    ///
    /// # Errors
    ///
    /// An initial job failure is fatal: the loop never starts and the
    /// error propagates to the caller.
    pub fn run_loop_with<F>(&self, initial: F) -> Result<(), ControlError>
    where
        F: FnOnce() -> Result<(), ControlError>,
    {
        self.begin();
        if let Err(e) = initial() {
            let mut s = self.state.lock();
            s.enabled = false;
            s.finish = true;
            s.pending = None;
            self.todo.notify_all();
            self.done.notify_all();
            self.free.notify_all();
            return Err(e);
        }
        self.loop_body();
        Ok(())
    }

    fn begin(&self) {
        *self.owner.lock() = Some(thread::current().id());
        let mut s = self.state.lock();
        s.enabled = true;
        s.finish = false;
    }

    fn loop_body(&self) {
        let mut s = self.state.lock();
        self.free.notify_one();
        while !s.finish {
            self.todo
                .wait_while(&mut s, |s| s.pending.is_none() && !s.finish);
            if s.finish {
                break;
            }
            if let Some(job) = s.pending.take() {
                // Executed with the state lock held: nothing can install
                // another job until this one signalled completion.
                job();
                self.done.notify_all();
                self.free.notify_one();
            }
        }
        s.enabled = false;
        self.done.notify_all();
        self.free.notify_all();
    }

    /// Execute a job on the worker thread and return its result
    ///
    /// From the worker thread itself the job executes immediately in
    /// place (re-entrancy). From any other thread the call blocks until
    /// the worker picked up and finished the job.
    ///
    /// # Errors
    ///
    /// - [`WorkerError::Disabled`] if no run loop is active
    /// - [`WorkerError::Interrupted`] if the worker stopped mid-job
    /// - [`WorkerError::Job`] carrying the job's own error
    ///
    /// # Panics
    ///
    /// A panicking job does not kill the worker thread; the panic
    /// resumes in the calling thread with its original payload.
    pub fn call<T, F>(&self, f: F) -> Result<T, WorkerError>
    where
        F: FnOnce() -> Result<T, ControlError> + Send + 'static,
        T: Send + 'static,
    {
        if self.on_worker_thread() {
            return f().map_err(WorkerError::Job);
        }

        let slot: ResultSlot<T> = Arc::new(Mutex::new(None));
        let out = slot.clone();
        let job: BoxedJob = Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(f));
            *out.lock() = Some(result);
        });

        let mut s = self.state.lock();
        if !s.enabled {
            return Err(WorkerError::Disabled);
        }
        self.free
            .wait_while(&mut s, |s| s.pending.is_some() && s.enabled);
        if !s.enabled {
            return Err(WorkerError::Disabled);
        }
        s.pending = Some(job);
        self.todo.notify_one();
        self.done
            .wait_while(&mut s, |s| s.enabled && slot.lock().is_none());
        drop(s);

        let taken = slot.lock().take();
        match taken {
            Some(Ok(result)) => result.map_err(WorkerError::Job),
            Some(Err(panic)) => resume_unwind(panic),
            None => Err(WorkerError::Interrupted),
        }
    }

    /// Mark the loop for termination and wake everything blocked on it
    ///
    /// Safe from any thread. A pending, not-yet-executed job is dropped
    /// and its caller gets [`WorkerError::Interrupted`]; a job already
    /// executing finishes normally.
    pub fn stop(&self) {
        let mut s = self.state.lock();
        s.finish = true;
        s.enabled = false;
        s.pending = None;
        self.todo.notify_all();
        self.done.notify_all();
        self.free.notify_all();
    }

    fn on_worker_thread(&self) -> bool {
        *self.owner.lock() == Some(thread::current().id())
    }
}

impl Default for Worker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn started_worker() -> (Arc<Worker>, thread::JoinHandle<()>) {
        let worker = Arc::new(Worker::new());
        let handle = {
            let worker = worker.clone();
            thread::spawn(move || {
                let _ = worker.run_loop();
            })
        };
        while !worker.is_enabled() {
            thread::sleep(Duration::from_millis(1));
        }
        (worker, handle)
    }

    #[test]
    fn test_call_returns_job_result() {
        let (worker, handle) = started_worker();
        let value = worker.call(|| Ok(41 + 1)).unwrap();
        assert_eq!(value, 42);
        worker.stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_call_before_run_loop_is_disabled() {
        let worker = Worker::new();
        let result = worker.call(|| Ok(()));
        assert!(matches!(result, Err(WorkerError::Disabled)));
    }

    #[test]
    fn test_job_error_is_preserved() {
        let (worker, handle) = started_worker();
        let result: Result<(), _> = worker.call(|| Err(ControlError::NoProgram));
        assert!(matches!(
            result,
            Err(WorkerError::Job(ControlError::NoProgram))
        ));
        worker.stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_reentrant_call_executes_inline() {
        let (worker, handle) = started_worker();
        let inner = worker.clone();
        let value = worker
            .call(move || inner.call(|| Ok(7)).map_err(|_| ControlError::NoProgram))
            .unwrap();
        assert_eq!(value, 7);
        worker.stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_initial_job_failure_is_fatal() {
        let worker = Arc::new(Worker::new());
        let result = worker.run_loop_with(|| Err(ControlError::NoProgram));
        assert!(matches!(result, Err(ControlError::NoProgram)));
        assert!(!worker.is_enabled());
        assert!(matches!(
            worker.call(|| Ok(())),
            Err(WorkerError::Disabled)
        ));
    }

    #[test]
    fn test_panicking_job_resumes_in_caller() {
        let (worker, handle) = started_worker();
        let w = worker.clone();
        let caught = std::panic::catch_unwind(AssertUnwindSafe(move || {
            let _: Result<(), _> = w.call(|| panic!("boom"));
        }));
        assert!(caught.is_err());
        // worker thread survived the panic
        assert_eq!(worker.call(|| Ok(1)).unwrap(), 1);
        worker.stop();
        handle.join().unwrap();
    }
}
