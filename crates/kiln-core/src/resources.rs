// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Resource-string parsing and normalization.
//!
//! Manifests accept human-friendly CPU and memory requests. Internally
//! everything is CPU units (1 vCPU = 1024) and megabytes. Fargate targets
//! round both up to the nearest supported combination; Kubernetes targets
//! get quantity strings with unit suffixes attached.

use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResourceError {
    #[error("invalid memory format: {0}")]
    InvalidMemory(String),

    #[error("unknown memory unit: {0}")]
    UnknownMemoryUnit(String),

    #[error("invalid cpu format: {0}")]
    InvalidCpu(String),

    #[error("unsupported fargate cpu tier: {0}")]
    UnsupportedCpu(i64),

    #[error("unsupported fargate cpu/memory combination: cpu={cpu} memory={memory}")]
    UnsupportedCombination { cpu: i64, memory: i64 },
}

/// Supported Fargate CPU tiers, ascending.
const FARGATE_CPU_TIERS: &[i64] = &[256, 512, 1024, 2048, 4096, 8192, 16384];

static MEMORY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9.]+)\s*([A-Za-z]+)$").unwrap_or_else(|e| panic!("memory pattern: {e}"))
});

static SUFFIXED_QUANTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9.]+[A-Za-z]+$").unwrap_or_else(|e| panic!("quantity pattern: {e}"))
});

/// Valid Fargate memory values (MB) for a CPU tier. Empty for CPU values
/// outside the tier table.
fn fargate_memories(cpu: i64) -> &'static [i64] {
    match cpu {
        256 => &[512, 1024, 2048],
        512 => &[1024, 2048, 3072, 4096],
        1024 => &[2048, 3072, 4096, 5120, 6144, 7168, 8192],
        2048 => &[
            4096, 5120, 6144, 7168, 8192, 9216, 10240, 11264, 12288, 13312, 14336, 15360, 16384,
        ],
        4096 => &[
            8192, 9216, 10240, 11264, 12288, 13312, 14336, 15360, 16384, 17408, 18432, 19456,
            20480, 21504, 22528, 23552, 24576, 25600, 26624, 27648, 28672, 29696, 30720,
        ],
        8192 => &[
            16384, 20480, 24576, 28672, 32768, 36864, 40960, 45056, 49152, 53248, 57344, 61440,
        ],
        16384 => &[
            32768, 40960, 49152, 57344, 65536, 73728, 81920, 90112, 98304, 106496, 114688, 122880,
        ],
        _ => &[],
    }
}

/// Parses a memory string to megabytes. Plain integers are taken as MB;
/// decimal values with a unit suffix (`1.5GB`, `2Gi`, `512Mi`, `1Ti`) are
/// converted, unit case folded. Empty input is zero.
pub fn parse_memory_mb(s: &str) -> Result<i64, ResourceError> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(0);
    }

    if let Ok(mb) = s.parse::<i64>() {
        return Ok(mb);
    }

    let captures = MEMORY_PATTERN
        .captures(s)
        .ok_or_else(|| ResourceError::InvalidMemory(s.to_string()))?;
    let value: f64 = captures[1]
        .parse()
        .map_err(|_| ResourceError::InvalidMemory(s.to_string()))?;

    let mb = match captures[2].to_ascii_lowercase().as_str() {
        "b" | "bytes" => value / (1024.0 * 1024.0),
        "k" | "kb" | "ki" | "kib" => value / 1024.0,
        "m" | "mb" | "mi" | "mib" => value,
        "g" | "gb" | "gi" | "gib" => value * 1024.0,
        "t" | "tb" | "ti" | "tib" => value * 1024.0 * 1024.0,
        unit => return Err(ResourceError::UnknownMemoryUnit(unit.to_string())),
    };

    Ok(mb as i64)
}

/// Parses a CPU string to CPU units (1 vCPU = 1024). Accepts decimal vCPU
/// counts (`2`, `0.5`) and millicore notation (`500m` → 512). Empty input
/// is zero.
pub fn parse_cpu_units(s: &str) -> Result<i64, ResourceError> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(0);
    }

    if let Ok(vcpus) = s.parse::<f64>() {
        return Ok((vcpus * 1024.0) as i64);
    }

    if let Some(milli_str) = s.strip_suffix('m') {
        let milli: f64 = milli_str
            .parse()
            .map_err(|_| ResourceError::InvalidCpu(s.to_string()))?;
        return Ok((milli * 1024.0 / 1000.0) as i64);
    }

    Err(ResourceError::InvalidCpu(s.to_string()))
}

/// Rounds CPU units up to the next Fargate tier, clamping at the maximum.
pub fn round_up_fargate_cpu(cpu: i64) -> i64 {
    for &tier in FARGATE_CPU_TIERS {
        if cpu <= tier {
            return tier;
        }
    }
    16384
}

/// Rounds memory up within the tier's table, clamping at the tier maximum.
/// CPU values outside the tier table pass the memory through unchanged.
pub fn round_up_fargate_memory(cpu: i64, memory: i64) -> i64 {
    let valid = fargate_memories(cpu);
    let Some(&max) = valid.last() else {
        return memory;
    };
    for &candidate in valid {
        if memory <= candidate {
            return candidate;
        }
    }
    max
}

/// Checks that `(cpu, memory)` is a supported Fargate combination.
pub fn validate_fargate(cpu: i64, memory: i64) -> Result<(), ResourceError> {
    let valid = fargate_memories(cpu);
    if valid.is_empty() {
        return Err(ResourceError::UnsupportedCpu(cpu));
    }
    if !valid.contains(&memory) {
        return Err(ResourceError::UnsupportedCombination { cpu, memory });
    }
    Ok(())
}

/// Parses and rounds a CPU/memory request pair up to a supported Fargate
/// combination. Idempotent on already-valid pairs.
pub fn normalize_fargate(cpu: &str, memory: &str) -> Result<(i64, i64), ResourceError> {
    let cpu_units = parse_cpu_units(cpu)?;
    let memory_mb = parse_memory_mb(memory)?;

    let cpu_rounded = round_up_fargate_cpu(cpu_units);
    let memory_rounded = round_up_fargate_memory(cpu_rounded, memory_mb);

    Ok((cpu_rounded, memory_rounded))
}

/// Formats a memory request as a Kubernetes quantity. Plain integers are
/// taken as MB and suffixed `Mi`; strings already carrying a unit pass
/// through.
pub fn format_k8s_memory(s: &str) -> String {
    let s = s.trim();
    if s.is_empty() || SUFFIXED_QUANTITY.is_match(s) {
        return s.to_string();
    }
    match s.parse::<i64>() {
        Ok(mb) => format!("{mb}Mi"),
        Err(_) => s.to_string(),
    }
}

/// Formats a CPU request as a Kubernetes quantity. Plain integers are CPU
/// units: values of a whole vCPU or more become vCPU counts (two decimals
/// when not divisible), smaller values become millicores. Strings already
/// carrying a unit pass through.
pub fn format_k8s_cpu(s: &str) -> String {
    let s = s.trim();
    if s.is_empty() || SUFFIXED_QUANTITY.is_match(s) {
        return s.to_string();
    }
    match s.parse::<i64>() {
        Ok(units) if units >= 1024 => {
            if units % 1024 == 0 {
                format!("{}", units / 1024)
            } else {
                format!("{:.2}", units as f64 / 1024.0)
            }
        }
        Ok(units) => format!("{}m", units * 1000 / 1024),
        Err(_) => s.to_string(),
    }
}

#[cfg(test)]
#[path = "resources_tests.rs"]
mod tests;
