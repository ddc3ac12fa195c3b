//! Per-process resource requests and worker-count arithmetic.
//!
//! `scale(cores = c)` and `scale(memory = m)` are resource-denominated
//! scaling requests: they are converted to a worker count using the
//! per-process footprint in the job template, then to a job count
//! using the template's multiplicity. Both conversions round up.

use serde::{Deserialize, Serialize};

use crate::error::ClusterError;

/// Resources requested for a single worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// CPU cores per worker process.
    pub cores: u32,

    /// Memory per worker process, in bytes.
    pub memory_bytes: u64,
}

impl ResourceRequest {
    /// Creates a resource request from explicit values.
    #[must_use]
    pub const fn new(cores: u32, memory_bytes: u64) -> Self {
        Self { cores, memory_bytes }
    }

    /// Creates a resource request with a human-readable memory string,
    /// e.g. `ResourceRequest::with_memory(1, "4 GB")`.
    pub fn with_memory(cores: u32, memory: &str) -> Result<Self, ClusterError> {
        Ok(Self {
            cores,
            memory_bytes: parse_memory(memory)?,
        })
    }
}

impl std::fmt::Display for ResourceRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} cores, {}", self.cores, format_memory(self.memory_bytes))
    }
}

/// Number of worker processes needed to cover `requested_cores`.
#[must_use]
pub fn processes_for_cores(requested_cores: u32, cores_per_process: u32) -> u32 {
    requested_cores.div_ceil(cores_per_process.max(1))
}

/// Number of worker processes needed to cover `requested_bytes`.
/// Saturates at `u32::MAX` rather than wrapping below the request.
#[must_use]
pub fn processes_for_memory(requested_bytes: u64, bytes_per_process: u64) -> u32 {
    let processes = requested_bytes.div_ceil(bytes_per_process.max(1));
    u32::try_from(processes).unwrap_or(u32::MAX)
}

/// Number of jobs needed to produce `workers` worker processes when
/// each job has multiplicity `processes_per_job`.
#[must_use]
pub fn jobs_for_workers(workers: u32, processes_per_job: u32) -> u32 {
    workers.div_ceil(processes_per_job.max(1))
}

/// Parses a human-readable memory quantity into bytes.
///
/// Accepts bare byte counts (`"1048576"`), decimal units (`"4 GB"`,
/// `"100MB"`) and binary units (`"512 MiB"`). Fractional values are
/// allowed (`"1.5 GiB"`); the result is truncated to whole bytes.
/// Unit matching is case-insensitive.
pub fn parse_memory(s: &str) -> Result<u64, ClusterError> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(ClusterError::InvalidMemory(s.to_string()));
    }

    let split = trimmed
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let number = number.trim();
    let unit = unit.trim();

    let value: f64 = number
        .parse()
        .map_err(|_| ClusterError::InvalidMemory(s.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(ClusterError::InvalidMemory(s.to_string()));
    }

    let multiplier: u64 = match unit.to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kb" | "k" => 1000,
        "mb" | "m" => 1000 * 1000,
        "gb" | "g" => 1000 * 1000 * 1000,
        "tb" | "t" => 1000 * 1000 * 1000 * 1000,
        "kib" => 1 << 10,
        "mib" => 1 << 20,
        "gib" => 1 << 30,
        "tib" => 1 << 40,
        _ => return Err(ClusterError::InvalidMemory(s.to_string())),
    };

    Ok((value * multiplier as f64) as u64)
}

/// Formats a byte count using the largest exact-ish binary unit.
#[must_use]
pub fn format_memory(bytes: u64) -> String {
    const UNITS: [(&str, u64); 4] = [
        ("TiB", 1 << 40),
        ("GiB", 1 << 30),
        ("MiB", 1 << 20),
        ("KiB", 1 << 10),
    ];

    for (suffix, size) in UNITS {
        if bytes >= size {
            return format!("{:.2} {}", bytes as f64 / size as f64, suffix);
        }
    }
    format!("{} B", bytes)
}
