//! Per-node CPU limiting via cgroup v2
//!
//! Each limited host gets a cgroup under `/sys/fs/cgroup/<group>/<node>`
//! with a `cpu.max` quota derived from its CPU fraction. Spawned node
//! processes are attached best-effort; a missing cgroup2 mount disables the
//! whole module with a warning rather than failing the session.

use std::path::PathBuf;
use thiserror::Error;
use tokio::fs;
use topology::{HostLimits, SchedPolicy};
use tracing::{debug, info, warn};

/// CFS bandwidth period in microseconds, the kernel default.
const PERIOD_US: u64 = 100_000;

#[derive(Error, Debug)]
pub enum CgroupError {
    #[error("Failed to create cgroup: {0}")]
    Create(std::io::Error),

    #[error("Failed to write cgroup attribute {attr}: {source}")]
    Write {
        attr: String,
        source: std::io::Error,
    },

    #[error("Invalid CPU fraction {0} (expected 0.0-1.0)")]
    InvalidFraction(f32),
}

/// Manager for one session's cgroup tree.
pub struct Manager {
    base: PathBuf,
    enabled: bool,
}

impl Manager {
    /// `group` names the session subtree, e.g. `netlab-<sid>`.
    pub fn new(group: &str) -> Self {
        let root = PathBuf::from("/sys/fs/cgroup");
        let enabled = root.join("cgroup.controllers").exists();
        if !enabled {
            warn!("cgroup v2 not mounted; CPU limits will not be enforced");
        }
        Self {
            base: root.join(group),
            enabled,
        }
    }

    /// Create a cgroup for a node and apply its CPU quota.
    pub async fn create(&self, node: &str, limits: &HostLimits) -> Result<(), CgroupError> {
        if !(0.0..=1.0).contains(&limits.cpu) {
            return Err(CgroupError::InvalidFraction(limits.cpu));
        }
        if !self.enabled {
            return Ok(());
        }
        if limits.sched == SchedPolicy::Rt {
            // cgroup v2 has no per-group rt budget; enforce the quota under CFS
            warn!("rt scheduling for {} degraded to cfs quota", node);
        }

        let dir = self.base.join(node);
        fs::create_dir_all(&dir).await.map_err(CgroupError::Create)?;

        let quota = ((limits.cpu as f64) * (PERIOD_US as f64)) as u64;
        let value = format!("{} {}", quota.max(1000), PERIOD_US);
        fs::write(dir.join("cpu.max"), &value)
            .await
            .map_err(|e| CgroupError::Write {
                attr: "cpu.max".to_string(),
                source: e,
            })?;

        info!("Created cgroup for {} (cpu.max = {})", node, value);
        Ok(())
    }

    /// Attach a process to a node's cgroup. Best-effort: a vanished process
    /// or missing cgroup is logged, not raised.
    pub async fn attach(&self, node: &str, pid: u32) {
        if !self.enabled {
            return;
        }
        let procs = self.base.join(node).join("cgroup.procs");
        match fs::write(&procs, pid.to_string()).await {
            Ok(()) => debug!("Attached pid {} to cgroup {}", pid, node),
            Err(e) => debug!("Could not attach pid {} to cgroup {}: {}", pid, node, e),
        }
    }

    /// Remove a node's cgroup; succeeds if it is already gone.
    pub async fn remove(&self, node: &str) -> Result<(), CgroupError> {
        if !self.enabled {
            return Ok(());
        }
        let dir = self.base.join(node);
        if !dir.exists() {
            return Ok(());
        }
        fs::remove_dir(&dir).await.map_err(CgroupError::Create)?;
        debug!("Removed cgroup for {}", node);
        Ok(())
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        if self.enabled && self.base.exists() {
            let _ = std::fs::remove_dir(&self.base);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_fraction_rejected() {
        let manager = Manager::new("netlab-test");
        let limits = HostLimits {
            cpu: 1.5,
            sched: SchedPolicy::Cfs,
        };
        let err = tokio_test::block_on(manager.create("h1", &limits));
        assert!(matches!(err, Err(CgroupError::InvalidFraction(_))));
    }

    #[test]
    fn test_quota_formatting() {
        // 10% of a 100ms period is a 10ms quota
        let quota = ((0.1f64) * (PERIOD_US as f64)) as u64;
        assert_eq!(quota, 10_000);
    }
}
