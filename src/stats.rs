//! Per-worker resource sampling: CPU fraction and resident memory,
//! accumulated per pid and averaged on demand.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::debug;

/// Default sampling interval.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// Averaged sample for one process (or an aggregate across processes).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessStats {
    /// CPU usage as a fraction of one core (0..1, can exceed 1 with
    /// multiple threads).
    pub cpus: f64,
    /// Resident set size in bytes.
    pub memory: f64,
}

/// Accumulates CPU/RSS samples per pid.
///
/// The first sighting of a pid establishes its CPU baseline and is not
/// recorded; lookup failures (process vanished between roster snapshot
/// and refresh) skip that sample.
pub struct StatsCollector {
    system: System,
    sums: HashMap<u32, ProcessStats>,
    counts: HashMap<u32, u64>,
    seen: HashSet<u32>,
}

impl StatsCollector {
    pub fn new() -> Self {
        StatsCollector {
            system: System::new(),
            sums: HashMap::new(),
            counts: HashMap::new(),
            seen: HashSet::new(),
        }
    }

    /// Take one sample for each of `pids`.
    pub fn update(&mut self, pids: &[u32]) {
        if pids.is_empty() {
            return;
        }
        let targets: Vec<Pid> = pids.iter().map(|&pid| Pid::from_u32(pid)).collect();
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&targets),
            true,
            ProcessRefreshKind::new().with_cpu().with_memory(),
        );

        for &pid in pids {
            if self.seen.insert(pid) {
                // First sighting: no CPU delta to measure yet.
                continue;
            }
            let Some(process) = self.system.process(Pid::from_u32(pid)) else {
                continue;
            };
            let sample = ProcessStats {
                cpus: f64::from(process.cpu_usage()) / 100.0,
                memory: process.memory() as f64,
            };
            self.record(pid, sample);
        }
    }

    /// Fold one sample into the per-pid accumulators.
    pub fn record(&mut self, pid: u32, sample: ProcessStats) {
        let sum = self.sums.entry(pid).or_insert(ProcessStats {
            cpus: 0.0,
            memory: 0.0,
        });
        sum.cpus += sample.cpus;
        sum.memory += sample.memory;
        *self.counts.entry(pid).or_insert(0) += 1;
    }

    /// Average samples per pid.
    pub fn average_per_pid(&self) -> HashMap<u32, ProcessStats> {
        self.sums
            .iter()
            .map(|(&pid, sum)| {
                let count = self.counts.get(&pid).copied().unwrap_or(1) as f64;
                (
                    pid,
                    ProcessStats {
                        cpus: sum.cpus / count,
                        memory: sum.memory / count,
                    },
                )
            })
            .collect()
    }

    /// Mean of the per-pid averages, or `None` when nothing was sampled.
    pub fn average_overall(&self) -> Option<ProcessStats> {
        let per_pid = self.average_per_pid();
        if per_pid.is_empty() {
            return None;
        }
        let n = per_pid.len() as f64;
        let (cpus, memory) = per_pid
            .values()
            .fold((0.0, 0.0), |(c, m), s| (c + s.cpus, m + s.memory));
        Some(ProcessStats {
            cpus: cpus / n,
            memory: memory / n,
        })
    }

    pub fn reset(&mut self) {
        self.sums.clear();
        self.counts.clear();
        self.seen.clear();
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Background sampler over the supervisor's live-worker roster.
pub struct StatsMonitor {
    collector: Arc<Mutex<StatsCollector>>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl StatsMonitor {
    /// Start sampling `roster` every `interval`.
    pub fn start(roster: Arc<Mutex<Vec<u32>>>, interval: Duration) -> Self {
        let collector = Arc::new(Mutex::new(StatsCollector::new()));
        let running = Arc::new(AtomicBool::new(true));

        let thread_collector = Arc::clone(&collector);
        let thread_running = Arc::clone(&running);
        let thread = std::thread::spawn(move || {
            debug!("stats monitor started");
            while thread_running.load(Ordering::SeqCst) {
                let pids: Vec<u32> = match roster.lock() {
                    Ok(guard) => guard.clone(),
                    Err(poisoned) => poisoned.into_inner().clone(),
                };
                if let Ok(mut collector) = thread_collector.lock() {
                    collector.update(&pids);
                }
                std::thread::sleep(interval);
            }
            debug!("stats monitor stopped");
        });

        StatsMonitor {
            collector,
            running,
            thread: Some(thread),
        }
    }

    /// Flag the signal coordinator clears to stop sampling early.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn collector(&self) -> Arc<Mutex<StatsCollector>> {
        Arc::clone(&self.collector)
    }

    /// Stop sampling and join the thread.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for StatsMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
