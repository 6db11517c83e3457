//! Worker-thread sizing for the tokio runtime.
//!
//! An explicit `--workers` wins. Otherwise the CPU quota of the container is
//! used when one is set, and the host's available parallelism when not.
//! Detection runs before tracing is initialized, so the result carries its
//! source for logging later.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerCount {
    pub threads: usize,
    pub source: &'static str,
}

pub fn resolve_workers(requested: Option<usize>) -> WorkerCount {
    if let Some(n) = requested.filter(|n| *n > 0) {
        return WorkerCount { threads: n, source: "flag" };
    }

    if let Ok(value) = std::env::var("PORTICO_CPU_LIMIT") {
        if let Some(cores) = parse_cpu_value(&value) {
            return WorkerCount { threads: cores.max(1), source: "env" };
        }
    }

    if let Ok(max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        if let Some(cores) = parse_cgroup_v2_cpu(&max) {
            return WorkerCount { threads: cores.max(1), source: "cgroup_v2" };
        }
    }

    if let (Ok(quota), Ok(period)) = (
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us"),
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us"),
    ) {
        if let Some(cores) = parse_cgroup_v1_cpu(&quota, &period) {
            return WorkerCount { threads: cores.max(1), source: "cgroup_v1" };
        }
    }

    let threads = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);
    WorkerCount { threads, source: "available_parallelism" }
}

/// "4" (cores) or "4000m" (millicores).
fn parse_cpu_value(value: &str) -> Option<usize> {
    let value = value.trim();
    match value.strip_suffix('m') {
        Some(milli) => milli.parse::<usize>().ok().map(|m| m / 1000),
        None => value.parse::<usize>().ok(),
    }
}

/// cgroup v2 `cpu.max`: "quota period" or "max period".
fn parse_cgroup_v2_cpu(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period = parts.next()?;
    if quota == "max" {
        return None;
    }
    parse_cgroup_v1_cpu(quota, period)
}

fn parse_cgroup_v1_cpu(quota: &str, period: &str) -> Option<usize> {
    let quota: i64 = quota.trim().parse().ok()?;
    let period: i64 = period.trim().parse().ok()?;
    (quota > 0 && period > 0).then(|| (quota / period) as usize)
}
