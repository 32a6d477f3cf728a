//! Periodic background workers.
//!
//! Each worker is a thread that runs a task every `interval` and on demand. Stopping sets a flag
//! and wakes the thread, which exits before its next run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

enum Signal {
    Trigger,
    Stop,
}

pub struct PeriodicWorker {
    name: &'static str,
    signal_tx: Sender<Signal>,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicWorker {
    /// Spawns a thread that runs `task` every `interval` until stopped.
    pub fn spawn<F>(name: &'static str, interval: Duration, task: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        // One pending signal is enough; extra triggers coalesce.
        let (signal_tx, signal_rx) = bounded::<Signal>(1);
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);

        let handle = thread::Builder::new()
            .name(format!("genogate-{}", name))
            .spawn(move || run_worker(name, interval, signal_rx, shutdown_flag, task));

        let handle = match handle {
            Ok(h) => Some(h),
            Err(e) => {
                log::error!("Failed to spawn {} worker: {}", name, e);
                None
            }
        };

        log::info!("Started {} worker (every {:?})", name, interval);

        Self {
            name,
            signal_tx,
            shutdown,
            handle: Mutex::new(handle),
        }
    }

    /// Requests an immediate run.
    pub fn trigger(&self) {
        let _ = self.signal_tx.try_send(Signal::Trigger);
    }

    /// Stops the worker and waits for its thread to exit.
    pub fn stop(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        // The channel may be full of a trigger; the flag is checked after every wakeup anyway.
        let _ = self.signal_tx.try_send(Signal::Stop);

        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.join() {
                log::error!("{} worker panicked: {:?}", self.name, e);
            } else {
                log::debug!("{} worker stopped", self.name);
            }
        }
    }
}

impl Drop for PeriodicWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker<F: Fn()>(
    name: &'static str,
    interval: Duration,
    signal_rx: Receiver<Signal>,
    shutdown: Arc<AtomicBool>,
    task: F,
) {
    log::debug!("{} worker running", name);

    loop {
        match signal_rx.recv_timeout(interval) {
            Ok(Signal::Trigger) | Err(RecvTimeoutError::Timeout) => {}
            Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => break,
        }

        if shutdown.load(Ordering::Acquire) {
            break;
        }

        task();
    }
}
