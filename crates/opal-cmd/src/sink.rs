//! The asynchronous execution boundary.
//!
//! State mutation happens synchronously on the calling thread; the resulting
//! commands are handed to a [`CommandSink`] and consumed elsewhere. The sink
//! guarantees backend-visible execution order matches submission order but
//! not completion before `emit` returns; [`CommandSink::finish`] is the only
//! blocking point.

use std::sync::mpsc;
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use tracing::warn;

use crate::command::Command;

/// Ordered, fire-and-forget command consumer.
pub trait CommandSink: Send + Sync {
    /// Appends a command. Must not block on backend execution.
    fn emit(&self, command: Command);

    /// Blocks until every previously emitted command has been executed.
    fn finish(&self);
}

/// Backend replay hook, invoked only on the sink's worker thread.
pub trait CommandExecutor: Send {
    fn execute(&mut self, command: Command);
}

enum WorkerMessage {
    Command(Command),
    /// Rendezvous: the worker acknowledges once all prior messages ran.
    Finish(mpsc::SyncSender<()>),
    Shutdown,
}

/// A [`CommandSink`] backed by a dedicated worker thread draining an
/// unbounded FIFO into a [`CommandExecutor`].
pub struct CommandQueue {
    tx: mpsc::Sender<WorkerMessage>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommandQueue {
    pub fn spawn(mut executor: Box<dyn CommandExecutor>) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<WorkerMessage>();
        let worker = thread::Builder::new()
            .name("opal-cs".to_owned())
            .spawn(move || {
                while let Ok(message) = rx.recv() {
                    match message {
                        WorkerMessage::Command(command) => executor.execute(command),
                        WorkerMessage::Finish(done) => {
                            // A dropped receiver means the waiter gave up; nothing to do.
                            let _ = done.send(());
                        }
                        WorkerMessage::Shutdown => break,
                    }
                }
            })?;
        Ok(Self {
            tx,
            worker: Mutex::new(Some(worker)),
        })
    }
}

impl CommandSink for CommandQueue {
    fn emit(&self, command: Command) {
        if self.tx.send(WorkerMessage::Command(command)).is_err() {
            warn!("command stream worker is gone; dropping command");
        }
    }

    fn finish(&self) {
        let (done_tx, done_rx) = mpsc::sync_channel(0);
        if self.tx.send(WorkerMessage::Finish(done_tx)).is_err() {
            warn!("command stream worker is gone; finish is a no-op");
            return;
        }
        if done_rx.recv().is_err() {
            warn!("command stream worker exited before acknowledging finish");
        }
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        let _ = self.tx.send(WorkerMessage::Shutdown);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!("command stream worker panicked");
            }
        }
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use recording::{RecordingSink, SinkEvent};

#[cfg(any(test, feature = "test-utils"))]
mod recording {
    use std::sync::Mutex;

    use crate::command::Command;
    use crate::sink::CommandSink;

    /// Everything a sink can observe, in order.
    #[derive(Clone, Debug, PartialEq)]
    pub enum SinkEvent {
        Command(Command),
        Finish,
    }

    /// Test sink that records emitted commands and finish points.
    #[derive(Debug, Default)]
    pub struct RecordingSink {
        events: Mutex<Vec<SinkEvent>>,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self::default()
        }

        /// Returns and clears the recorded events.
        pub fn take(&self) -> Vec<SinkEvent> {
            std::mem::take(&mut self.events.lock().unwrap())
        }

        pub fn events(&self) -> Vec<SinkEvent> {
            self.events.lock().unwrap().clone()
        }

        /// Number of recorded commands (finish markers excluded).
        pub fn command_count(&self) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| matches!(e, SinkEvent::Command(_)))
                .count()
        }
    }

    impl CommandSink for RecordingSink {
        fn emit(&self, command: Command) {
            self.events.lock().unwrap().push(SinkEvent::Command(command));
        }

        fn finish(&self) {
            self.events.lock().unwrap().push(SinkEvent::Finish);
        }
    }
}
