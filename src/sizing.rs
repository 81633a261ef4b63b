//! Pool sizing: explicit worker count, or an estimate from the job's
//! per-worker memory/CPU footprint against machine limits.

use tracing::debug;

use crate::spec::JobSpec;

/// Machine-level resource budget used when no explicit worker count is
/// given.
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    /// Memory available to the pool, in bytes.
    pub memory_bytes: f64,
    /// Logical CPUs available to the pool.
    pub cpus: f64,
}

impl ResourceLimits {
    /// Detect limits for this machine: 90% of physical memory and the
    /// logical CPU count.
    pub fn detect() -> Self {
        let cpus = num_cpus::get() as f64;
        ResourceLimits {
            memory_bytes: total_physical_memory(cpus) * 0.9,
            cpus,
        }
    }
}

#[cfg(feature = "stats")]
fn total_physical_memory(_cpus: f64) -> f64 {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    system.total_memory() as f64
}

#[cfg(not(feature = "stats"))]
fn total_physical_memory(cpus: f64) -> f64 {
    // SAFETY: sysconf(3) is safe with valid names; it returns -1 when the
    // name is unsupported.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    if page_size > 0 && pages > 0 {
        page_size as f64 * pages as f64
    } else {
        // No way to ask the OS; assume 2 GiB per core.
        cpus * 2.0 * 1024.0 * 1024.0 * 1024.0
    }
}

/// Choose the worker count.
///
/// An explicit count always wins. Otherwise take the smaller of what the
/// memory budget and the CPU budget allow, and never less than one worker.
pub fn pool_size(explicit: Option<usize>, spec: &JobSpec, limits: &ResourceLimits) -> usize {
    if let Some(n) = explicit {
        return n.max(1);
    }

    let by_memory = (limits.memory_bytes / spec.memory_estimate()).round() as isize;
    let by_cpu = (limits.cpus / spec.cpu_estimate()).round() as isize;
    let n = by_memory.min(by_cpu).max(1) as usize;
    debug!(by_memory, by_cpu, n, "sized worker pool");
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(memory_estimate: u64, cpu_estimate: f64) -> JobSpec {
        JobSpec::from_value(serde_json::json!({
            "exec_type": "python3",
            "exec_info": {},
            "memory_estimate": memory_estimate,
            "cpu_estimate": cpu_estimate,
        }))
    }

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn explicit_count_wins() {
        let limits = ResourceLimits {
            memory_bytes: 1024.0 * MIB as f64,
            cpus: 8.0,
        };
        assert_eq!(pool_size(Some(3), &spec(256 * MIB, 1.0), &limits), 3);
    }

    #[test]
    fn memory_bound_pool() {
        // 1 GiB budget / 256 MiB per worker = 4; CPU would allow 8.
        let limits = ResourceLimits {
            memory_bytes: 1024.0 * MIB as f64,
            cpus: 8.0,
        };
        assert_eq!(pool_size(None, &spec(256 * MIB, 1.0), &limits), 4);
    }

    #[test]
    fn cpu_bound_pool() {
        let limits = ResourceLimits {
            memory_bytes: 64.0 * 1024.0 * MIB as f64,
            cpus: 2.0,
        };
        assert_eq!(pool_size(None, &spec(64 * MIB, 1.0), &limits), 2);
    }

    #[test]
    fn never_below_one_worker() {
        let limits = ResourceLimits {
            memory_bytes: 16.0 * MIB as f64,
            cpus: 1.0,
        };
        assert_eq!(pool_size(None, &spec(64 * 1024 * MIB, 4.0), &limits), 1);
        assert_eq!(pool_size(Some(0), &spec(64 * MIB, 1.0), &limits), 1);
    }

    #[test]
    fn defaults_apply_when_spec_omits_estimates() {
        let s = JobSpec::from_value(serde_json::json!({
            "exec_type": "python3",
            "exec_info": {},
        }));
        // Default estimate is 64 MiB / 1 CPU.
        let limits = ResourceLimits {
            memory_bytes: 640.0 * MIB as f64,
            cpus: 4.0,
        };
        assert_eq!(pool_size(None, &s, &limits), 4);
    }

    #[test]
    fn detect_reports_positive_limits() {
        let limits = ResourceLimits::detect();
        assert!(limits.memory_bytes > 0.0);
        assert!(limits.cpus >= 1.0);
    }
}
