//! Network namespace management
//!
//! Creates, deletes, and enters Linux network namespaces using the
//! `/var/run/netns/<name>` convention, so namespaces created here are also
//! visible to the `ip netns` tooling.

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{setns, unshare, CloneFlags};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, BorrowedFd, RawFd};
use std::path::PathBuf;
use thiserror::Error;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum NetNsError {
    #[error("Failed to create netns directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Failed to create netns file: {0}")]
    CreateFile(std::io::Error),

    #[error("Failed to mount namespace: {0}")]
    Mount(nix::Error),

    #[error("Failed to enter namespace: {0}")]
    SetNs(nix::Error),

    #[error("Failed to open namespace file: {0}")]
    OpenNs(std::io::Error),

    #[error("Namespace '{0}' not found")]
    NotFound(String),

    #[error("Namespace '{0}' already exists")]
    AlreadyExists(String),

    #[error("Insufficient permissions (CAP_NET_ADMIN required)")]
    Permission,
}

/// Network namespace manager
pub struct Manager {
    /// Map of namespace name to file descriptor
    namespaces: HashMap<String, File>,
    /// Base directory for namespace files
    base_dir: PathBuf,
}

impl Manager {
    pub fn new() -> Result<Self, NetNsError> {
        let base_dir = PathBuf::from("/var/run/netns");

        std::fs::create_dir_all(&base_dir).map_err(NetNsError::CreateDir)?;

        Ok(Self {
            namespaces: HashMap::new(),
            base_dir,
        })
    }

    /// Create a new network namespace.
    pub async fn create(&mut self, name: &str) -> Result<(), NetNsError> {
        if self.namespaces.contains_key(name) {
            return Err(NetNsError::AlreadyExists(name.to_string()));
        }

        let ns_path = self.base_dir.join(name);
        if ns_path.exists() {
            warn!("Cleaning up stale namespace file: {}", name);
            self.force_delete(name).await?;
        }

        debug!("Creating namespace: {}", name);

        // Empty mount point for the bind mount below
        fs::File::create(&ns_path)
            .await
            .map_err(NetNsError::CreateFile)?;

        // Unshare on a blocking thread, bind mount the new namespace, then
        // restore the thread's original namespace so the pool thread is not
        // left inside it.
        let result = tokio::task::spawn_blocking({
            let ns_path = ns_path.clone();
            move || -> Result<(), NetNsError> {
                let original = OpenOptions::new()
                    .read(true)
                    .open("/proc/thread-self/ns/net")
                    .map_err(NetNsError::OpenNs)?;

                unshare(CloneFlags::CLONE_NEWNET).map_err(|_| NetNsError::Permission)?;

                let res = mount(
                    Some("/proc/thread-self/ns/net"),
                    &ns_path,
                    None::<&str>,
                    MsFlags::MS_BIND,
                    None::<&str>,
                )
                .map_err(NetNsError::Mount);

                // Always hop back, even if the mount failed
                setns(&original, CloneFlags::CLONE_NEWNET).map_err(NetNsError::SetNs)?;
                res
            }
        })
        .await
        .map_err(|e| NetNsError::CreateFile(std::io::Error::other(e)))?;

        if let Err(e) = result {
            let _ = fs::remove_file(&ns_path).await;
            return Err(e);
        }

        let file = OpenOptions::new()
            .read(true)
            .open(&ns_path)
            .map_err(NetNsError::OpenNs)?;

        self.namespaces.insert(name.to_string(), file);
        info!("Created namespace: {}", name);
        Ok(())
    }

    /// Delete a network namespace; succeeds if it is already gone.
    pub async fn delete(&mut self, name: &str) -> Result<(), NetNsError> {
        self.namespaces.remove(name);

        let ns_path = self.base_dir.join(name);
        if !ns_path.exists() {
            return Ok(());
        }

        debug!("Deleting namespace: {}", name);

        // Lazy unmount avoids EBUSY while processes are still exiting
        if let Err(e) = umount2(&ns_path, MntFlags::MNT_DETACH) {
            debug!("Unmount of {} failed: {}", name, e);
        }

        match fs::remove_file(&ns_path).await {
            Ok(()) => {
                info!("Deleted namespace: {}", name);
                Ok(())
            }
            Err(e) => {
                // `ip netns del` handles the corner cases we may have missed
                let status = Command::new("ip")
                    .args(["netns", "del", name])
                    .status()
                    .await;
                match status {
                    Ok(s) if s.success() => Ok(()),
                    _ => Err(NetNsError::CreateFile(e)),
                }
            }
        }
    }

    /// Delete a namespace that may not be in our tracking.
    pub async fn force_delete(&mut self, name: &str) -> Result<(), NetNsError> {
        self.delete(name).await
    }

    /// Remove all namespace files with the given prefix, returning how many
    /// were cleaned. Used to sweep leftovers of crashed sessions.
    pub async fn cleanup_stale(&mut self, prefix: &str) -> Result<usize, NetNsError> {
        let mut cleaned = 0;
        if let Ok(mut entries) = fs::read_dir(&self.base_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if let Ok(name) = entry.file_name().into_string() {
                    if name.starts_with(prefix) {
                        debug!("Sweeping stale namespace: {}", name);
                        if self.force_delete(&name).await.is_ok() {
                            cleaned += 1;
                        }
                    }
                }
            }
        }
        Ok(cleaned)
    }

    /// Raw fd of a managed namespace, for rtnetlink `setns_by_fd`.
    pub fn fd(&self, name: &str) -> Result<RawFd, NetNsError> {
        self.namespaces
            .get(name)
            .map(|f| f.as_raw_fd())
            .ok_or_else(|| NetNsError::NotFound(name.to_string()))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.namespaces.contains_key(name)
    }

    /// A command that will execute inside the namespace: the child setns's
    /// itself before exec, so argv stays a plain list with no `ip netns
    /// exec` wrapping.
    pub fn command(&self, name: &str, program: &str) -> Result<Command, NetNsError> {
        let fd = self.fd(name)?;
        let mut cmd = Command::new(program);
        unsafe {
            cmd.pre_exec(move || {
                let borrowed = BorrowedFd::borrow_raw(fd);
                setns(borrowed, CloneFlags::CLONE_NEWNET)
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
            });
        }
        Ok(cmd)
    }

}

impl Drop for Manager {
    fn drop(&mut self) {
        // Best-effort synchronous cleanup without requiring a Tokio runtime
        let names: Vec<String> = self.namespaces.keys().cloned().collect();
        for name in names {
            let ns_path = self.base_dir.join(&name);
            let _ = umount2(&ns_path, MntFlags::MNT_DETACH);
            if std::fs::remove_file(&ns_path).is_err() {
                let _ = std::process::Command::new("ip")
                    .args(["netns", "del", &name])
                    .status();
            }
        }
        self.namespaces.clear();
    }
}
