//! The periodic sync runner: drives `do_sync_pass` with back-off and wakes
//! early on network up-edges.
//!
//! The runner holds only a weak back-reference to the engine; if the engine
//! is dropped, the thread exits on its next iteration, making teardown
//! deterministic.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::error;

use super::engine::Engine;

pub(crate) enum RunnerMessage {
    Wake,
}

pub(crate) fn spawn(engine: &Arc<Engine>) -> (Option<JoinHandle<()>>, Sender<RunnerMessage>) {
    let weak = Arc::downgrade(engine);
    let (tx, rx) = channel::unbounded();
    let short = Duration::from_millis(engine.config.sync_interval_ms);
    let long = Duration::from_millis(engine.config.backoff_interval_ms);
    let handle = thread::Builder::new()
        .name("sync-runner".into())
        .spawn(move || run(weak, rx, short, long))
        .ok();
    (handle, tx)
}

fn run(engine: Weak<Engine>, wake: Receiver<RunnerMessage>, short: Duration, long: Duration) {
    loop {
        let Some(engine) = engine.upgrade() else {
            return;
        };
        let successful = catch_unwind(AssertUnwindSafe(|| engine.do_sync_pass()))
            .unwrap_or_else(|_| {
                error!("sync pass panicked");
                false
            });
        // Re-arm any stream listener whose thread has exited; streams are
        // also reopened this way after network or auth outages.
        engine.ensure_listeners_started();
        drop(engine);

        let sleep = if successful { short } else { long };
        match wake.recv_timeout(sleep) {
            Ok(RunnerMessage::Wake) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}
