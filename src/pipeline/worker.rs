//! Single-threaded FIFO task queue

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// One consumer thread draining tasks in submission order.
///
/// Teardown is two-step: [`Worker::shutdown`] first marks the worker
/// inactive so tasks still queued are dropped unrun (their captured state
/// is released by `Drop`), then disconnects the queue and joins the thread.
pub struct Worker {
    name: &'static str,
    tx: Mutex<Option<flume::Sender<Task>>>,
    active: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn spawn(name: &'static str, pin_core: Option<usize>) -> Result<Self> {
        let (tx, rx) = flume::unbounded::<Task>();
        let active = Arc::new(AtomicBool::new(true));

        let thread_active = active.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                if let Some(id) = pin_core {
                    if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
                        warn!(core = id, "Failed to pin worker thread");
                    }
                }

                while let Ok(task) = rx.recv() {
                    if !thread_active.load(Ordering::Acquire) {
                        drop(task);
                        continue;
                    }
                    task();
                }
                debug!("Worker queue drained");
            })
            .map_err(|source| Error::Spawn { name, source })?;

        info!(name, ?pin_core, "Worker started");
        Ok(Self {
            name,
            tx: Mutex::new(Some(tx)),
            active,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue a task. Returns false, dropping the task, if the worker is
    /// shutting down.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> bool {
        if !self.is_active() {
            return false;
        }
        let tx = self.tx.lock().clone();
        match tx {
            Some(tx) => tx.send(Box::new(task)).is_ok(),
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Number of tasks waiting to run
    pub fn backlog(&self) -> usize {
        self.tx.lock().as_ref().map_or(0, |tx| tx.len())
    }

    /// Mark inactive, then disconnect and join. Safe to call repeatedly and
    /// from a task running on the worker itself (the join is skipped).
    pub fn shutdown(&self) {
        self.active.store(false, Ordering::Release);
        drop(self.tx.lock().take());

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                debug!(name = self.name, "Shutdown from worker thread, not joining");
                return;
            }
            if handle.join().is_err() {
                warn!(name = self.name, "Worker thread panicked");
            }
            info!(name = self.name, "Worker stopped");
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
