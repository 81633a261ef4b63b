//! Signal coordinator: cooperative shutdown on the first interrupt,
//! forceful worker termination on repeated ones.
//!
//! A dedicated thread receives SIGINT/SIGTERM through `signal-hook` and
//! counts deliveries per signal. Each delivery writes one byte to a wake
//! pipe whose read end sits in the supervisor's poll set, so a blocked
//! readiness wait notices the interrupt immediately. On a repeated
//! delivery of the same signal the thread hard-terminates every pid in
//! the shared roster itself. Handlers are unregistered and the thread
//! joined on drop, at run end.

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::debug;

/// Per-signal delivery counts, shared with the signal thread.
#[derive(Debug, Default)]
pub struct SignalCounts {
    sigint: AtomicUsize,
    sigterm: AtomicUsize,
}

impl SignalCounts {
    fn slot(&self, signal: i32) -> Option<&AtomicUsize> {
        match signal {
            SIGINT => Some(&self.sigint),
            SIGTERM => Some(&self.sigterm),
            _ => None,
        }
    }

    fn increment(&self, signal: i32) -> usize {
        self.slot(signal)
            .map(|slot| slot.fetch_add(1, Ordering::SeqCst) + 1)
            .unwrap_or(0)
    }

    /// Deliveries seen for one signal number.
    pub fn count(&self, signal: i32) -> usize {
        self.slot(signal)
            .map(|slot| slot.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Deliveries seen across all intercepted signals.
    pub fn total(&self) -> usize {
        self.sigint.load(Ordering::SeqCst) + self.sigterm.load(Ordering::SeqCst)
    }
}

/// Installed for the duration of one run.
pub struct SignalCoordinator {
    counts: Arc<SignalCounts>,
    wake_rx: File,
    handle: signal_hook::iterator::Handle,
    thread: Option<JoinHandle<()>>,
}

impl SignalCoordinator {
    /// Register the handlers and start the signal thread.
    ///
    /// `roster` is the shared list of live worker pids to hard-terminate
    /// on escalation; `observer_running` (when present) is cleared on the
    /// first delivery so the stats observer stops sampling.
    pub fn install(
        roster: Arc<Mutex<Vec<u32>>>,
        observer_running: Option<Arc<AtomicBool>>,
    ) -> std::io::Result<Self> {
        let (rx, tx) = nix::unistd::pipe()?;
        let wake_rx = File::from(rx);
        let wake_tx = File::from(tx);

        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        let handle = signals.handle();
        let counts = Arc::new(SignalCounts::default());

        let thread_counts = Arc::clone(&counts);
        let thread = std::thread::spawn(move || {
            for signal in signals.forever() {
                let seen = thread_counts.increment(signal);
                debug!(signal, seen, "received interrupt signal");

                if let Some(flag) = &observer_running {
                    flag.store(false, Ordering::SeqCst);
                }

                if seen > 1 {
                    // Escalation: terminate every live worker right here,
                    // without waiting for the supervisor loop.
                    let pids: Vec<u32> = match roster.lock() {
                        Ok(guard) => guard.clone(),
                        Err(poisoned) => poisoned.into_inner().clone(),
                    };
                    debug!(workers = pids.len(), "repeated signal, terminating workers");
                    for pid in pids {
                        // SAFETY: kill(2) with a valid signal number.
                        unsafe {
                            libc::kill(pid as libc::pid_t, libc::SIGTERM);
                        }
                    }
                }

                // Wake the supervisor's readiness wait.
                let _ = (&wake_tx).write_all(b"s");
            }
        });

        Ok(SignalCoordinator {
            counts,
            wake_rx,
            handle,
            thread: Some(thread),
        })
    }

    /// Has any intercepted signal been delivered?
    pub fn interrupted(&self) -> bool {
        self.counts.total() > 0
    }

    pub fn counts(&self) -> &SignalCounts {
        &self.counts
    }

    /// Shared handle to the counts, outliving the coordinator.
    pub fn counts_handle(&self) -> Arc<SignalCounts> {
        Arc::clone(&self.counts)
    }

    /// Fd to include in the supervisor's poll set.
    pub fn wake_fd(&self) -> RawFd {
        self.wake_rx.as_raw_fd()
    }

    /// Consume pending wake bytes. Called only after the wake fd polled
    /// readable, so the single read does not block.
    pub fn drain_wake(&mut self) {
        let mut buf = [0u8; 64];
        let _ = self.wake_rx.read(&mut buf);
    }
}

impl Drop for SignalCoordinator {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_track_per_signal() {
        let counts = SignalCounts::default();
        assert_eq!(counts.total(), 0);
        counts.increment(SIGINT);
        counts.increment(SIGINT);
        counts.increment(SIGTERM);
        assert_eq!(counts.count(SIGINT), 2);
        assert_eq!(counts.count(SIGTERM), 1);
        assert_eq!(counts.total(), 3);
        // Unknown signals are ignored rather than tracked.
        assert_eq!(counts.increment(libc::SIGHUP), 0);
        assert_eq!(counts.count(libc::SIGHUP), 0);
    }

    #[test]
    fn install_and_teardown_is_clean() {
        let roster = Arc::new(Mutex::new(Vec::new()));
        let coordinator = SignalCoordinator::install(roster, None).unwrap();
        assert!(!coordinator.interrupted());
        assert!(coordinator.wake_fd() >= 0);
        drop(coordinator);
    }
}
