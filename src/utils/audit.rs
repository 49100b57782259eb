//! Audit trail of destructive actions

use crate::utils::error::Result;
use serde::Serialize;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Outcome of one journaled command
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditStatus {
    Ok,
    Failed { detail: String },
    DryRun,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Seconds since the Unix epoch
    pub timestamp: u64,
    pub command: String,
    #[serde(flatten)]
    pub status: AuditStatus,
}

/// Ordered record of every command that changed (or would have changed)
/// system state during a run
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditLog {
    entries: Vec<AuditEntry>,
}

impl AuditLog {
    pub fn record(&mut self, command: String, status: AuditStatus) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.entries.push(AuditEntry {
            timestamp,
            command,
            status,
        });
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.entries)?)
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Human-readable summary, one line per action
    pub fn summary(&self) -> String {
        self.entries
            .iter()
            .map(|e| match &e.status {
                AuditStatus::Ok => format!("ok      {}", e.command),
                AuditStatus::DryRun => format!("dry-run {}", e.command),
                AuditStatus::Failed { detail } => format!("FAILED  {} ({})", e.command, detail),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_flattens_status() {
        let mut log = AuditLog::default();
        log.record("parted -s /dev/sda rm 4".to_string(), AuditStatus::Ok);
        log.record(
            "mkfs.btrfs -f /dev/sda5".to_string(),
            AuditStatus::Failed {
                detail: "device busy".to_string(),
            },
        );

        let value: serde_json::Value = serde_json::from_str(&log.to_json().unwrap()).unwrap();
        assert_eq!(value[0]["status"], "ok");
        assert_eq!(value[1]["status"], "failed");
        assert_eq!(value[1]["detail"], "device busy");
    }

    #[test]
    fn summary_marks_failures() {
        let mut log = AuditLog::default();
        log.record(
            "umount /mnt".to_string(),
            AuditStatus::Failed {
                detail: "not mounted".to_string(),
            },
        );
        assert_eq!(log.summary(), "FAILED  umount /mnt (not mounted)");
    }
}
