//! Best-effort health and diagnostics snapshot.
//!
//! Every check is advisory: failures are reported in the snapshot, never
//! returned as errors.

use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::cache::codec::{compression_available, format_for};
use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// == Health Report ==
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    /// Snapshot time in RFC 3339
    pub timestamp: String,
    pub directory_exists: CheckResult,
    pub readable: CheckResult,
    pub writable: CheckResult,
    pub serializer: CheckResult,
    pub compression: CheckResult,
    /// Free bytes on the cache filesystem, if it could be determined
    pub free_space_bytes: Option<u64>,
    pub entries: usize,
    pub total_bytes: u64,
}

/// Probes the cache root and codec support described by `config`.
pub fn check(config: &Config, entries: usize, total_bytes: u64) -> HealthReport {
    let root = config.cache_dir.as_path();
    let directory_exists = if root.is_dir() {
        CheckResult::healthy()
    } else {
        CheckResult::unhealthy(format!("{} is not a directory", root.display()))
    };
    let readable = match fs::read_dir(root) {
        Ok(_) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("read_dir failed: {}", e)),
    };
    let writable = check_writable(root);
    let serializer = match format_for(config.serializer) {
        Ok(format) => CheckResult {
            ok: true,
            detail: Some(format.name().to_string()),
        },
        Err(e) => CheckResult::unhealthy(e.to_string()),
    };
    let compression = if !config.compression || compression_available() {
        CheckResult {
            ok: true,
            detail: Some(if config.compression { "zlib" } else { "disabled" }.to_string()),
        }
    } else {
        CheckResult::unhealthy("compression enabled but not compiled in")
    };
    let free_space_bytes = fs2::available_space(root).ok();

    let mut report = HealthReport {
        status: HealthStatus::Healthy,
        timestamp: chrono::Utc::now().to_rfc3339(),
        directory_exists,
        readable,
        writable,
        serializer,
        compression,
        free_space_bytes,
        entries,
        total_bytes,
    };
    report.status = aggregate_status(&report);
    report
}

fn check_writable(root: &Path) -> CheckResult {
    let marker = root.join(format!(".health_check_{}", std::process::id()));
    match fs::write(&marker, b"ok") {
        Ok(()) => {
            let _ = fs::remove_file(&marker);
            CheckResult::healthy()
        }
        Err(e) => CheckResult::unhealthy(format!("test write failed: {}", e)),
    }
}

fn aggregate_status(report: &HealthReport) -> HealthStatus {
    let storage_ok =
        report.directory_exists.ok && report.readable.ok && report.writable.ok;
    let codec_ok = report.serializer.ok && report.compression.ok;
    if !storage_ok || !codec_ok {
        HealthStatus::Unhealthy
    } else if report.free_space_bytes == Some(0) {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_healthy_directory() {
        let dir = TempDir::new().unwrap();
        let report = check(&Config::new(dir.path()), 3, 300);

        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.directory_exists.ok);
        assert!(report.readable.ok);
        assert!(report.writable.ok);
        assert_eq!(report.serializer.detail.as_deref(), Some("native"));
        assert_eq!(report.entries, 3);
        assert!(report.free_space_bytes.is_some());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0, "check file cleaned up");
    }

    #[test]
    fn test_missing_directory_is_unhealthy() {
        let dir = TempDir::new().unwrap();
        let report = check(&Config::new(dir.path().join("missing")), 0, 0);

        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(!report.directory_exists.ok);
        assert!(!report.writable.ok);
    }

    #[test]
    fn test_report_serializes() {
        let dir = TempDir::new().unwrap();
        let report = check(&Config::new(dir.path()), 0, 0);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "healthy");
        assert!(json["timestamp"].is_string());
        assert!(json["directory_exists"].get("detail").is_none());
    }
}
