//! Stall detector for filter accumulations

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::WatchdogConfig;

/// Periodic timer that fires a recovery callback when an armed monitor
/// is not stopped within `tick_ms * threshold_ticks`.
///
/// The callback runs on the watchdog thread, once per stall; the monitor is
/// disarmed before it runs.
pub struct Watchdog {
    monitor: Arc<AtomicBool>,
    counter: Arc<AtomicU32>,
    stop_tx: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    pub fn spawn(config: &WatchdogConfig, on_bark: impl Fn() + Send + 'static) -> Result<Self> {
        let monitor = Arc::new(AtomicBool::new(false));
        let counter = Arc::new(AtomicU32::new(0));
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);

        let tick = Duration::from_millis(config.tick_ms.max(1));
        let threshold = config.threshold_ticks.max(1);
        let thread_monitor = monitor.clone();
        let thread_counter = counter.clone();

        let handle = thread::Builder::new()
            .name("postcapture-watchdog".to_string())
            .spawn(move || {
                let ticker = channel::tick(tick);
                loop {
                    crossbeam::select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            if thread_monitor.load(Ordering::Acquire) {
                                let ticks = thread_counter.fetch_add(1, Ordering::AcqRel) + 1;
                                if ticks >= threshold {
                                    thread_monitor.store(false, Ordering::Release);
                                    thread_counter.store(0, Ordering::Release);
                                    warn!(
                                        elapsed_ms = tick.as_millis() as u64 * ticks as u64,
                                        "Accumulation stalled, resetting filter"
                                    );
                                    on_bark();
                                }
                            }
                        }
                    }
                }
                debug!("Watchdog stopped");
            })
            .map_err(|source| Error::Spawn {
                name: "watchdog",
                source,
            })?;

        Ok(Self {
            monitor,
            counter,
            stop_tx: Mutex::new(Some(stop_tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Arm the monitor and restart the count
    pub fn start_monitor(&self) {
        self.counter.store(0, Ordering::Release);
        self.monitor.store(true, Ordering::Release);
    }

    pub fn stop_monitor(&self) {
        self.monitor.store(false, Ordering::Release);
        self.counter.store(0, Ordering::Release);
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        self.stop_monitor();
        // Disconnecting wakes the select
        drop(self.stop_tx.lock().take());

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("Watchdog thread panicked");
            }
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fast() -> WatchdogConfig {
        WatchdogConfig {
            tick_ms: 5,
            threshold_ticks: 4,
        }
    }

    #[test]
    fn barks_once_when_armed_past_deadline() {
        let barks = Arc::new(AtomicUsize::new(0));
        let b = barks.clone();
        let dog = Watchdog::spawn(&fast(), move || {
            b.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        dog.start_monitor();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(barks.load(Ordering::SeqCst), 1);
        assert!(!dog.is_monitoring());
    }

    #[test]
    fn silent_when_stopped_in_time() {
        let barks = Arc::new(AtomicUsize::new(0));
        let b = barks.clone();
        let dog = Watchdog::spawn(
            &WatchdogConfig {
                tick_ms: 50,
                threshold_ticks: 10,
            },
            move || {
                b.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

        dog.start_monitor();
        thread::sleep(Duration::from_millis(60));
        dog.stop_monitor();
        thread::sleep(Duration::from_millis(600));
        assert_eq!(barks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn silent_when_never_armed() {
        let barks = Arc::new(AtomicUsize::new(0));
        let b = barks.clone();
        let _dog = Watchdog::spawn(&fast(), move || {
            b.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(barks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn shutdown_joins() {
        let dog = Watchdog::spawn(&fast(), || {}).unwrap();
        dog.shutdown();
        dog.shutdown();
        assert!(!dog.is_monitoring());
    }
}
