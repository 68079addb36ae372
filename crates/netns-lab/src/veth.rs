//! Virtual Ethernet (veth) pair management
//!
//! Creates veth pairs in the root namespace via rtnetlink and moves the
//! endpoints into their node namespaces by fd. Configuration of an endpoint
//! after the move happens inside its namespace (see [`crate::backend`]).

use futures::TryStreamExt;
use rtnetlink::{new_connection, Handle};
use std::os::unix::io::RawFd;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum VethError {
    #[error("I/O error: {0}")]
    Io(std::io::Error),

    #[error("Netlink connection failed: {0}")]
    Connection(rtnetlink::Error),

    #[error("Interface '{0}' not found")]
    NotFound(String),

    #[error("Failed to create veth pair: {0}")]
    CreateFailed(rtnetlink::Error),

    #[error("Failed to move interface to namespace: {0}")]
    MoveFailed(rtnetlink::Error),

    #[error("Failed to delete interface: {0}")]
    DeleteFailed(rtnetlink::Error),
}

/// Veth pair manager operating on the root namespace.
pub struct Manager {
    handle: Handle,
}

impl Manager {
    pub async fn new() -> Result<Self, VethError> {
        let (connection, handle, _) = new_connection().map_err(VethError::Io)?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    /// Create a veth pair with the given endpoint names.
    pub async fn create_pair(&self, left: &str, right: &str) -> Result<(), VethError> {
        debug!("Creating veth pair: {} <-> {}", left, right);

        self.handle
            .link()
            .add()
            .veth(left.to_string(), right.to_string())
            .execute()
            .await
            .map_err(VethError::CreateFailed)?;

        info!("Created veth pair: {} <-> {}", left, right);
        Ok(())
    }

    /// Move a root-namespace interface into the namespace behind `ns_fd`.
    pub async fn move_to_ns(&self, ifname: &str, ns_fd: RawFd) -> Result<(), VethError> {
        let index = self.index_of(ifname).await?;
        self.handle
            .link()
            .set(index)
            .setns_by_fd(ns_fd)
            .execute()
            .await
            .map_err(VethError::MoveFailed)?;
        debug!("Moved interface {} into namespace fd {}", ifname, ns_fd);
        Ok(())
    }

    /// Delete a root-namespace interface (deletes the whole pair).
    pub async fn delete(&self, ifname: &str) -> Result<(), VethError> {
        let index = self.index_of(ifname).await?;
        self.handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(VethError::DeleteFailed)?;
        debug!("Deleted interface {}", ifname);
        Ok(())
    }

    /// Kernel interface index of a root-namespace interface.
    pub async fn index_of(&self, ifname: &str) -> Result<u32, VethError> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(ifname.to_string())
            .execute();

        match links.try_next().await {
            Ok(Some(link)) => Ok(link.header.index),
            Ok(None) | Err(_) => Err(VethError::NotFound(ifname.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    #[cfg(feature = "sudo-tests")]
    use super::*;

    #[tokio::test]
    #[cfg(feature = "sudo-tests")]
    async fn test_veth_pair_lifecycle() -> Result<(), VethError> {
        let manager = Manager::new().await?;

        manager.create_pair("nlt-left", "nlt-right").await?;
        assert!(manager.index_of("nlt-left").await.is_ok());
        assert!(manager.index_of("nlt-right").await.is_ok());

        // Deleting one end removes the pair
        manager.delete("nlt-left").await?;
        assert!(manager.index_of("nlt-right").await.is_err());
        Ok(())
    }
}
