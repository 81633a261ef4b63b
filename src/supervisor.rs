//! The supervisor: owns the worker pool, seeds it with input records,
//! multiplexes result reads, replaces dead workers, and enforces
//! shutdown.
//!
//! One thread drives the main loop and is the sole reader/writer of every
//! worker pipe. The stats observer and the signal thread share only the
//! pid roster and a couple of flags, each behind its own lock; no lock is
//! held across I/O.

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, info, warn};

use crate::protocol::SetupError;
use crate::signals::{SignalCoordinator, SignalCounts};
use crate::sink::ResultSink;
use crate::sizing::{self, ResourceLimits};
use crate::source::RecordSource;
use crate::spec::{JobSpec, Registry};
#[cfg(feature = "stats")]
use crate::stats::{SAMPLE_INTERVAL, StatsCollector, StatsMonitor};
use crate::worker::{Worker, WorkerStatus};

/// Grace period when reaping a terminated worker before escalating to
/// SIGKILL.
const TERMINATE_WAIT: Duration = Duration::from_secs(5);

/// Knobs for one run.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Explicit worker count; `None` sizes the pool from the spec's
    /// estimates against the machine limits.
    pub n_procs: Option<usize>,
    /// Upper bound for a single readiness wait, not for the whole run.
    pub poll_timeout: Option<Duration>,
    /// Run the stats observer thread alongside the loop.
    pub monitor: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            n_procs: None,
            poll_timeout: None,
            monitor: true,
        }
    }
}

/// What a finished run looked like.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub items_processed: u64,
    pub time_elapsed: Duration,
    pub interrupted: bool,
}

enum SeedOutcome {
    Seeded,
    Exhausted,
    /// The write hit a broken pipe; the record went back to the source.
    Broken,
}

pub struct Supervisor<R> {
    spec: JobSpec,
    registry: Registry,
    source: RecordSource<R>,
    limits: ResourceLimits,
    config: SupervisorConfig,
    /// Live workers keyed by the identity of their stdout stream.
    workers: HashMap<RawFd, Worker>,
    /// Pids of live workers, shared with the observer and signal threads.
    roster: Arc<Mutex<Vec<u32>>>,
    /// Resolved at setup; reused to spawn replacements.
    argv: Option<Vec<String>>,
    exec_info_line: Option<String>,
    replace_on_death: bool,
    items_processed: u64,
    time_elapsed: Duration,
    signals_received: Option<Arc<SignalCounts>>,
    #[cfg(feature = "stats")]
    stats: Option<Arc<Mutex<StatsCollector>>>,
}

impl<R: BufRead> Supervisor<R> {
    pub fn new(
        spec: JobSpec,
        registry: Registry,
        source: RecordSource<R>,
        config: SupervisorConfig,
    ) -> Self {
        Self::with_limits(spec, registry, source, config, ResourceLimits::detect())
    }

    /// Like [`Supervisor::new`] with explicit resource limits.
    pub fn with_limits(
        spec: JobSpec,
        registry: Registry,
        source: RecordSource<R>,
        config: SupervisorConfig,
        limits: ResourceLimits,
    ) -> Self {
        Supervisor {
            spec,
            registry,
            source,
            limits,
            config,
            workers: HashMap::new(),
            roster: Arc::new(Mutex::new(Vec::new())),
            argv: None,
            exec_info_line: None,
            replace_on_death: true,
            items_processed: 0,
            time_elapsed: Duration::ZERO,
            signals_received: None,
            #[cfg(feature = "stats")]
            stats: None,
        }
    }

    /// The worker count this run will use.
    pub fn n_procs(&self) -> usize {
        sizing::pool_size(self.config.n_procs, &self.spec, &self.limits)
    }

    pub fn items_processed(&self) -> u64 {
        self.items_processed
    }

    pub fn time_elapsed(&self) -> Duration {
        self.time_elapsed
    }

    /// Per-signal delivery counts from the last run.
    pub fn signals_received(&self) -> Option<&SignalCounts> {
        self.signals_received.as_deref()
    }

    /// Collected resource samples from the last run's observer.
    #[cfg(feature = "stats")]
    pub fn stats(&self) -> Option<Arc<Mutex<StatsCollector>>> {
        self.stats.clone()
    }

    /// Resolve the spec and bring up the full pool.
    ///
    /// A single spawn or handshake failure aborts setup: every worker
    /// spawned so far is hard-terminated and the originating payload is
    /// returned.
    pub fn setup(&mut self) -> std::result::Result<(), SetupError> {
        let exec_type = self.spec.exec_type()?;
        let argv = self.registry.resolve(&exec_type)?;
        let exec_info = self.spec.exec_info()?;
        let exec_info_line = serde_json::to_string(exec_info)
            .map_err(|err| SetupError::new("getting exec_info", err.to_string()))?;

        let n = self.n_procs();
        debug!(n, executable = ?argv, "creating workers");
        for _ in 0..n {
            match Self::spawn_worker(&argv, &exec_info_line) {
                Ok(worker) => self.insert_worker(worker),
                Err(err) => {
                    self.terminate_all(false, Some(TERMINATE_WAIT));
                    return Err(err);
                }
            }
        }

        self.argv = Some(argv);
        self.exec_info_line = Some(exec_info_line);
        Ok(())
    }

    /// Run to completion, writing every result line to `sink`.
    ///
    /// The exit path — terminate and reap all workers, stop the observer,
    /// restore signal handling — runs however the loop ends.
    pub fn run<W: Write>(&mut self, sink: &mut ResultSink<W>) -> Result<RunReport> {
        self.items_processed = 0;
        self.time_elapsed = Duration::ZERO;
        self.replace_on_death = true;

        #[cfg(feature = "stats")]
        let mut monitor = if self.config.monitor {
            let monitor = StatsMonitor::start(Arc::clone(&self.roster), SAMPLE_INTERVAL);
            self.stats = Some(monitor.collector());
            Some(monitor)
        } else {
            None
        };

        #[cfg(feature = "stats")]
        let observer_flag = monitor.as_ref().map(StatsMonitor::running_flag);
        #[cfg(not(feature = "stats"))]
        let observer_flag = None;

        let mut coordinator = SignalCoordinator::install(Arc::clone(&self.roster), observer_flag)
            .context("install signal handlers")?;
        self.signals_received = Some(coordinator.counts_handle());

        let begin = Instant::now();
        let outcome = self
            .seed_initial()
            .and_then(|()| self.drive(&mut coordinator, sink, begin));

        self.terminate_all(false, Some(TERMINATE_WAIT));
        self.time_elapsed = begin.elapsed();

        #[cfg(feature = "stats")]
        if let Some(monitor) = monitor.as_mut() {
            monitor.stop();
        }

        let interrupted = coordinator.interrupted();
        drop(coordinator);

        let interrupted = outcome? || interrupted;
        info!(
            items = self.items_processed,
            elapsed_ms = self.time_elapsed.as_millis() as u64,
            interrupted,
            "run finished"
        );
        Ok(RunReport {
            items_processed: self.items_processed,
            time_elapsed: self.time_elapsed,
            interrupted,
        })
    }

    fn spawn_worker(argv: &[String], exec_info_line: &str) -> std::result::Result<Worker, SetupError> {
        let mut worker = Worker::launch(argv)
            .map_err(|err| SetupError::new("creating worker process", err.to_string()))?;
        if let Err(err) = worker.handshake(exec_info_line) {
            worker.terminate(false);
            let _ = worker.wait(Some(TERMINATE_WAIT));
            return Err(err);
        }
        debug!(pid = worker.pid(), "worker ready");
        Ok(worker)
    }

    fn insert_worker(&mut self, worker: Worker) {
        self.workers.insert(worker.stdout_fd(), worker);
        self.sync_roster();
    }

    fn remove_worker(&mut self, fd: RawFd) -> Option<Worker> {
        let worker = self.workers.remove(&fd);
        self.sync_roster();
        worker
    }

    fn sync_roster(&self) {
        let pids: Vec<u32> = self.workers.values().map(Worker::pid).collect();
        match self.roster.lock() {
            Ok(mut guard) => *guard = pids,
            Err(poisoned) => *poisoned.into_inner() = pids,
        }
    }

    /// Pull one record and hand it to `worker`.
    fn seed(source: &mut RecordSource<R>, worker: &mut Worker) -> Result<SeedOutcome> {
        let Some(record) = source.next_record().context("read input record")? else {
            return Ok(SeedOutcome::Exhausted);
        };
        match worker.seed(&record) {
            Ok(()) => Ok(SeedOutcome::Seeded),
            Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {
                source.push_back(record);
                Ok(SeedOutcome::Broken)
            }
            Err(err) => {
                source.push_back(record);
                Err(err).context("write record to worker")
            }
        }
    }

    /// Give each worker its first record; workers beyond the end of the
    /// input are never needed and are torn down here.
    fn seed_initial(&mut self) -> Result<()> {
        let fds: Vec<RawFd> = self.workers.keys().copied().collect();
        let mut surplus = Vec::new();
        let mut exhausted = false;
        for fd in fds {
            if exhausted {
                surplus.push(fd);
                continue;
            }
            let Some(worker) = self.workers.get_mut(&fd) else {
                continue;
            };
            debug!(pid = worker.pid(), "seeding worker");
            match Self::seed(&mut self.source, worker)? {
                SeedOutcome::Seeded => {}
                SeedOutcome::Exhausted => {
                    exhausted = true;
                    surplus.push(fd);
                }
                SeedOutcome::Broken => {
                    anyhow::bail!("worker died during initial seeding");
                }
            }
        }

        if !surplus.is_empty() {
            debug!(surplus = surplus.len(), "dropping workers beyond input size");
            for fd in surplus {
                if let Some(mut worker) = self.remove_worker(fd) {
                    worker.terminate(false);
                    let _ = worker.wait(Some(TERMINATE_WAIT));
                }
            }
        }
        Ok(())
    }

    /// The main loop. Returns whether an interrupt ended it.
    fn drive<W: Write>(
        &mut self,
        coordinator: &mut SignalCoordinator,
        sink: &mut ResultSink<W>,
        begin: Instant,
    ) -> Result<bool> {
        loop {
            if coordinator.interrupted() {
                return Ok(true);
            }
            if self.workers.is_empty() {
                return Ok(false);
            }

            let fds: Vec<RawFd> = self.workers.keys().copied().collect();
            let wake_fd = coordinator.wake_fd();

            let timeout = match self.config.poll_timeout {
                Some(duration) => {
                    let millis = i32::try_from(duration.as_millis()).unwrap_or(i32::MAX);
                    PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)
                }
                None => PollTimeout::NONE,
            };

            // SAFETY: every fd stays open for the duration of this poll
            // round: worker stdout fds are owned by entries of the map and
            // the wake fd by the coordinator, none of which are dropped
            // until after the readiness flags are copied out below.
            let mut pollfds: Vec<PollFd> = fds
                .iter()
                .chain(std::iter::once(&wake_fd))
                .map(|&fd| {
                    PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, PollFlags::POLLIN)
                })
                .collect();

            match poll(&mut pollfds, timeout) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => return Err(err).context("poll worker streams"),
            }

            let readable: Vec<bool> = pollfds
                .iter()
                .map(|pollfd| {
                    pollfd
                        .revents()
                        .map(|flags| {
                            flags.intersects(
                                PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR,
                            )
                        })
                        .unwrap_or(false)
                })
                .collect();
            drop(pollfds);

            if readable[fds.len()] {
                coordinator.drain_wake();
            }
            if coordinator.interrupted() {
                return Ok(true);
            }

            for (i, &fd) in fds.iter().enumerate() {
                if readable[i] {
                    self.service_worker(fd, sink, begin)?;
                }
            }
        }
    }

    /// One readable worker stream: read a result line, emit it, re-seed.
    fn service_worker<W: Write>(
        &mut self,
        fd: RawFd,
        sink: &mut ResultSink<W>,
        begin: Instant,
    ) -> Result<()> {
        let mut line = String::new();
        let read = match self.workers.get_mut(&fd) {
            Some(worker) => worker.stdout().read_line(&mut line),
            // Removed earlier in this round.
            None => return Ok(()),
        };

        match read {
            Ok(0) => {
                debug!("worker closed its stdout");
                self.handle_broken(fd)?;
            }
            Ok(_) => {
                sink.write_result(&line).context("write result to sink")?;
                self.items_processed += 1;
                self.time_elapsed = begin.elapsed();
                self.reseed(fd)?;
            }
            Err(err) => {
                warn!(error = %err, "error reading worker stream");
                self.handle_broken(fd)?;
            }
        }
        Ok(())
    }

    /// Hand the next record to a worker that just produced a result.
    fn reseed(&mut self, fd: RawFd) -> Result<()> {
        let Some(worker) = self.workers.get_mut(&fd) else {
            return Ok(());
        };
        worker.status = WorkerStatus::Ready;
        match Self::seed(&mut self.source, worker)? {
            SeedOutcome::Seeded => {}
            SeedOutcome::Exhausted => {
                debug!(pid = worker.pid(), "input exhausted, retiring worker");
                worker.close_stdin();
                worker.terminate(false);
                let _ = worker.wait(Some(TERMINATE_WAIT));
                self.remove_worker(fd);
            }
            SeedOutcome::Broken => {
                debug!("worker gone before re-seed, record requeued");
                self.handle_broken(fd)?;
            }
        }
        Ok(())
    }

    /// A worker's stream broke: reap it and, policy permitting, replace
    /// it. The record it carried is not retried.
    fn handle_broken(&mut self, fd: RawFd) -> Result<()> {
        if let Some(mut worker) = self.remove_worker(fd) {
            debug!(pid = worker.pid(), "reaping dead worker");
            worker.terminate(false);
            let _ = worker.wait(Some(TERMINATE_WAIT));
        }

        let interrupted = self
            .signals_received
            .as_ref()
            .is_some_and(|counts| counts.total() > 0);
        if interrupted || !self.replace_on_death {
            return Ok(());
        }

        let (Some(argv), Some(exec_info_line)) =
            (self.argv.clone(), self.exec_info_line.clone())
        else {
            return Ok(());
        };

        debug!("worker died, creating replacement");
        match Self::spawn_worker(&argv, &exec_info_line) {
            Ok(mut worker) => match Self::seed(&mut self.source, &mut worker) {
                Ok(SeedOutcome::Seeded) => self.insert_worker(worker),
                Ok(SeedOutcome::Exhausted) | Ok(SeedOutcome::Broken) => {
                    worker.terminate(false);
                    let _ = worker.wait(Some(TERMINATE_WAIT));
                }
                Err(err) => {
                    worker.terminate(false);
                    let _ = worker.wait(Some(TERMINATE_WAIT));
                    return Err(err);
                }
            },
            Err(err) => {
                warn!(error = %err, "could not replace dead worker, disabling replacement");
                self.replace_on_death = false;
            }
        }
        Ok(())
    }

    /// Signal every live worker, then optionally reap them all.
    fn terminate_all(&mut self, soft: bool, wait: Option<Duration>) {
        for worker in self.workers.values_mut() {
            worker.terminate(soft);
        }
        for (_, mut worker) in self.workers.drain() {
            let _ = worker.wait(wait);
        }
        self.sync_roster();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    /// Supervisor over a stand-in worker: `/bin/sh -c <script>` where the
    /// script is registered as the handler, so the registry's argv-prefix
    /// plus handler-path convention is exercised as-is.
    fn sh_supervisor(script: &str, input: &str, n_procs: usize) -> Supervisor<Cursor<Vec<u8>>> {
        let spec = JobSpec::from_value(json!({"exec_type": "sh", "exec_info": {}}));
        let mut registry = Registry::default();
        registry
            .executables
            .insert("sh".into(), vec!["/bin/sh".into(), "-c".into()]);
        registry.handlers.insert("sh".into(), script.into());
        let source = RecordSource::new(Cursor::new(input.as_bytes().to_vec()));
        Supervisor::new(
            spec,
            registry,
            source,
            SupervisorConfig {
                n_procs: Some(n_procs),
                poll_timeout: None,
                monitor: false,
            },
        )
    }

    const ECHO_WORKER: &str = "read -r spec; echo OK; exec cat";

    #[test]
    fn explicit_n_procs_is_used() {
        let sup = sh_supervisor(ECHO_WORKER, "", 3);
        assert_eq!(sup.n_procs(), 3);
    }

    #[test]
    fn echo_run_forwards_every_record() {
        let mut sup = sh_supervisor(ECHO_WORKER, "{\"v\":1}\n{\"v\":2}\n{\"v\":3}\n", 2);
        sup.setup().unwrap();

        let mut out = Vec::new();
        let report = {
            let mut sink = ResultSink::new(&mut out);
            sup.run(&mut sink).unwrap()
        };
        assert!(!report.interrupted);
        assert_eq!(report.items_processed, 3);

        let mut lines: Vec<&str> = std::str::from_utf8(&out).unwrap().lines().collect();
        lines.sort_unstable();
        assert_eq!(lines, ["{\"v\":1}", "{\"v\":2}", "{\"v\":3}"]);
    }

    #[test]
    fn setup_failure_reports_payload_and_leaves_no_workers() {
        let mut sup = sh_supervisor("read -r spec; echo NOT-READY; echo broken 1>&2", "", 2);
        let err = sup.setup().unwrap_err();
        assert!(!err.when.is_empty());
        assert!(err.stack.contains("broken"));
        assert!(sup.workers.is_empty());
    }

    #[test]
    fn unresolved_exec_type_fails_setup() {
        let spec = JobSpec::from_value(json!({"exec_type": "no-such-runner", "exec_info": {}}));
        let source = RecordSource::new(Cursor::new(Vec::new()));
        let mut sup = Supervisor::new(
            spec,
            Registry::default(),
            source,
            SupervisorConfig::default(),
        );
        let err = sup.setup().unwrap_err();
        assert_eq!(err.when, "resolving executable/handler paths");
    }
}
