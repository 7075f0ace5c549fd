//! Callback dispatch and in-flight operation accounting.
//!
//! User-supplied listeners run on a dedicated worker thread so they can
//! never stall an engine thread or re-enter engine locks.

use std::sync::{Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};

type Job = Box<dyn FnOnce() + Send>;

pub struct EventDispatcher {
    sender: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded::<Job>();
        let worker = thread::Builder::new()
            .name("sync-dispatch".into())
            .spawn(move || {
                for job in rx {
                    job();
                }
            })
            .ok();
        Self {
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(worker),
        }
    }

    /// Queues a callback. Dropped silently after `close`.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = sender.as_ref() {
            let _ = sender.send(Box::new(job));
        }
    }

    /// Drains the queue and stops the worker.
    pub fn close(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

struct GroupState {
    in_flight: usize,
    blocked: bool,
}

/// Counts in-flight user operations. `block_and_wait` bars new entries and
/// waits for the current ones to drain; used by close and reinitialize.
pub struct DispatchGroup {
    state: Mutex<GroupState>,
    cond: Condvar,
}

impl DispatchGroup {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GroupState {
                in_flight: 0,
                blocked: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Enters the group, waiting out any block in progress. The returned
    /// guard exits on drop.
    pub fn enter(&self) -> OperationGuard<'_> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while state.blocked {
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.in_flight += 1;
        OperationGuard { group: self }
    }

    fn exit(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight == 0 {
            self.cond.notify_all();
        }
    }

    /// Bars new operations and waits until in-flight ones finish.
    pub fn block_and_wait(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.blocked = true;
        while state.in_flight > 0 {
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn unblock(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.blocked = false;
        self.cond.notify_all();
    }
}

impl Default for DispatchGroup {
    fn default() -> Self {
        Self::new()
    }
}

pub struct OperationGuard<'a> {
    group: &'a DispatchGroup,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.group.exit();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn dispatcher_runs_jobs_in_order() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let seen = Arc::clone(&seen);
            dispatcher.dispatch(move || seen.lock().expect("seen").push(i));
        }
        dispatcher.close();
        assert_eq!(*seen.lock().expect("seen"), vec![0, 1, 2, 3]);
    }

    #[test]
    fn block_and_wait_drains_in_flight_operations() {
        let group = Arc::new(DispatchGroup::new());
        let done = Arc::new(AtomicUsize::new(0));
        let worker = {
            let group = Arc::clone(&group);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let _guard = group.enter();
                thread::sleep(Duration::from_millis(50));
                done.store(1, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(10));
        group.block_and_wait();
        assert_eq!(done.load(Ordering::SeqCst), 1);
        group.unblock();
        worker.join().expect("worker");
    }
}
