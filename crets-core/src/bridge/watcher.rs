//! Background watcher for pending batches
//!
//! Polls the store for the pending record so a context that missed every
//! direct announcement (or runs in another process sharing the store) still
//! learns about new batches. It only reports; claiming a batch is left to
//! the work item surface.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::notification::PendingRecord;
use crate::storage::{Payload, Persistence, PENDING_KEY};

/// Status of the pending watcher
#[derive(Debug, Clone, PartialEq)]
pub enum WatcherStatus {
    /// Polling, nothing new seen
    Idle,
    /// A batch is pending and has been reported
    Pending { batch_key: String },
    Paused,
    Stopped,
}

/// Commands that can be sent to the watcher
#[derive(Debug)]
pub enum WatcherCommand {
    Pause,
    Resume,
    Stop,
    /// Poll immediately instead of waiting for the next tick
    CheckNow,
    /// Report the current pending record again even if already seen
    Rearm,
}

/// Polls the store on a background thread and reports each new pending
/// record once
pub struct PendingWatcher {
    thread_handle: Option<JoinHandle<()>>,
    command_tx: mpsc::Sender<WatcherCommand>,
    record_rx: mpsc::Receiver<PendingRecord>,
    status: Arc<Mutex<WatcherStatus>>,
    running: Arc<AtomicBool>,
}

impl PendingWatcher {
    /// Starts polling `persistence` every `interval`
    pub fn start(persistence: Persistence, interval: Duration) -> Self {
        let (command_tx, command_rx) = mpsc::channel();
        let (record_tx, record_rx) = mpsc::channel();
        let status = Arc::new(Mutex::new(WatcherStatus::Idle));
        let running = Arc::new(AtomicBool::new(true));

        let thread_status = Arc::clone(&status);
        let thread_running = Arc::clone(&running);

        let thread_handle = thread::spawn(move || {
            watcher_thread(
                persistence,
                interval,
                command_rx,
                record_tx,
                thread_status,
                thread_running,
            );
        });

        log::debug!("pending watcher started ({:?} interval)", interval);
        Self {
            thread_handle: Some(thread_handle),
            command_tx,
            record_rx,
            status,
            running,
        }
    }

    pub fn status(&self) -> WatcherStatus {
        self.status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn pause(&self) -> Result<(), mpsc::SendError<WatcherCommand>> {
        self.command_tx.send(WatcherCommand::Pause)
    }

    pub fn resume(&self) -> Result<(), mpsc::SendError<WatcherCommand>> {
        self.command_tx.send(WatcherCommand::Resume)
    }

    pub fn stop(&self) -> Result<(), mpsc::SendError<WatcherCommand>> {
        self.command_tx.send(WatcherCommand::Stop)
    }

    pub fn check_now(&self) -> Result<(), mpsc::SendError<WatcherCommand>> {
        self.command_tx.send(WatcherCommand::CheckNow)
    }

    pub fn rearm(&self) -> Result<(), mpsc::SendError<WatcherCommand>> {
        self.command_tx.send(WatcherCommand::Rearm)
    }

    /// Next reported record, if any
    pub fn try_recv(&self) -> Option<PendingRecord> {
        self.record_rx.try_recv().ok()
    }

    /// Waits up to `timeout` for a record
    pub fn recv_timeout(&self, timeout: Duration) -> Option<PendingRecord> {
        self.record_rx.recv_timeout(timeout).ok()
    }
}

impl Drop for PendingWatcher {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.command_tx.send(WatcherCommand::Stop);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

fn set_status(status: &Mutex<WatcherStatus>, value: WatcherStatus) {
    *status.lock().unwrap_or_else(|e| e.into_inner()) = value;
}

fn watcher_thread(
    persistence: Persistence,
    interval: Duration,
    command_rx: mpsc::Receiver<WatcherCommand>,
    record_tx: mpsc::Sender<PendingRecord>,
    status: Arc<Mutex<WatcherStatus>>,
    running: Arc<AtomicBool>,
) {
    let mut paused = false;
    let mut last_seen: Option<String> = None;

    while running.load(Ordering::SeqCst) {
        if !paused {
            match persistence.inspect::<PendingRecord>(PENDING_KEY) {
                Payload::Valid(record) => {
                    if last_seen.as_deref() != Some(record.batch_key.as_str()) {
                        log::debug!("watcher saw pending batch {}", record.batch_key);
                        last_seen = Some(record.batch_key.clone());
                        set_status(
                            &status,
                            WatcherStatus::Pending {
                                batch_key: record.batch_key.clone(),
                            },
                        );
                        if record_tx.send(record).is_err() {
                            // Receiver dropped
                            break;
                        }
                    }
                }
                Payload::Corrupt(reason) => {
                    // Consumers discard it on claim; just report nothing
                    log::debug!("watcher ignoring corrupt pending record: {}", reason);
                }
                Payload::Absent => {
                    if last_seen.take().is_some() {
                        set_status(&status, WatcherStatus::Idle);
                    }
                }
            }
        }

        match command_rx.recv_timeout(interval) {
            Ok(WatcherCommand::Pause) => {
                paused = true;
                set_status(&status, WatcherStatus::Paused);
            }
            Ok(WatcherCommand::Resume) => {
                paused = false;
                set_status(&status, WatcherStatus::Idle);
            }
            Ok(WatcherCommand::Stop) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Ok(WatcherCommand::CheckNow) => {}
            Ok(WatcherCommand::Rearm) => last_seen = None,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
    }

    running.store(false, Ordering::SeqCst);
    set_status(&status, WatcherStatus::Stopped);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::notification::payload_key;

    const WAIT: Duration = Duration::from_secs(5);

    fn publish(persistence: &Persistence, ts: i64) {
        persistence
            .set(PENDING_KEY, &PendingRecord::new(payload_key(ts), 1, ts, "test"))
            .unwrap();
    }

    #[test]
    fn test_reports_each_batch_once() {
        let persistence = Persistence::memory();
        let watcher = PendingWatcher::start(persistence.clone(), Duration::from_millis(10));

        publish(&persistence, 1);
        let record = watcher.recv_timeout(WAIT).expect("first batch reported");
        assert_eq!(record.batch_key, payload_key(1));

        watcher.check_now().unwrap();
        assert!(watcher.recv_timeout(Duration::from_millis(100)).is_none());

        publish(&persistence, 2);
        let record = watcher.recv_timeout(WAIT).expect("second batch reported");
        assert_eq!(record.batch_key, payload_key(2));
    }

    #[test]
    fn test_rearm_reports_again() {
        let persistence = Persistence::memory();
        publish(&persistence, 7);
        let watcher = PendingWatcher::start(persistence, Duration::from_millis(10));

        assert!(watcher.recv_timeout(WAIT).is_some());
        watcher.rearm().unwrap();
        assert!(watcher.recv_timeout(WAIT).is_some());
    }

    #[test]
    fn test_stop_and_drop() {
        let watcher = PendingWatcher::start(Persistence::memory(), Duration::from_millis(10));
        assert!(watcher.is_running());
        watcher.stop().unwrap();

        for _ in 0..100 {
            if !watcher.is_running() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!watcher.is_running());
        assert_eq!(watcher.status(), WatcherStatus::Stopped);
    }

    #[test]
    fn test_pause_suppresses_reports() {
        let persistence = Persistence::memory();
        let watcher = PendingWatcher::start(persistence.clone(), Duration::from_millis(10));
        watcher.pause().unwrap();
        thread::sleep(Duration::from_millis(50));

        publish(&persistence, 3);
        assert!(watcher.recv_timeout(Duration::from_millis(100)).is_none());

        watcher.resume().unwrap();
        assert!(watcher.recv_timeout(WAIT).is_some());
    }
}
