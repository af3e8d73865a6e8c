// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Image-reference helpers.
//!
//! Destination encoding: a single colon splits base from tag; a reference
//! without a colon carries the implicit tag `latest`. Per-target pushes
//! suffix the tag with `_<arch>` (or `_<taskid>` when two targets share
//! an arch).

/// OCI platform descriptor for a manifest-list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformDescriptor {
    pub os: &'static str,
    pub architecture: &'static str,
    pub variant: Option<&'static str>,
}

/// Appends `_<arch>` to the tag component of `destination`.
pub fn append_arch_suffix(destination: &str, arch: &str) -> String {
    append_suffix(destination, arch)
}

/// Appends `_<task_id>` to the tag component of `destination`.
pub fn append_task_suffix(destination: &str, task_id: &str) -> String {
    append_suffix(destination, task_id)
}

fn append_suffix(destination: &str, suffix: &str) -> String {
    match destination.rfind(':') {
        Some(idx) => {
            format!("{}:{}_{}", &destination[..idx], &destination[idx + 1..], suffix)
        }
        None => format!("{destination}:latest_{suffix}"),
    }
}

/// Maps an architecture tag to its manifest-list platform descriptor.
/// Returns `None` for architectures outside the supported set.
pub fn platform_for_arch(arch: &str) -> Option<PlatformDescriptor> {
    let descriptor = match arch {
        "amd64" => PlatformDescriptor { os: "linux", architecture: "amd64", variant: None },
        "arm64" => PlatformDescriptor { os: "linux", architecture: "arm64", variant: Some("v8") },
        "arm" => PlatformDescriptor { os: "linux", architecture: "arm", variant: Some("v7") },
        "386" => PlatformDescriptor { os: "linux", architecture: "386", variant: None },
        "ppc64le" => PlatformDescriptor { os: "linux", architecture: "ppc64le", variant: None },
        "s390x" => PlatformDescriptor { os: "linux", architecture: "s390x", variant: None },
        _ => return None,
    };
    Some(descriptor)
}

#[cfg(test)]
#[path = "reference_tests.rs"]
mod tests;
