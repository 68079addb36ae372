//! Declarative virtual network topology descriptors
//!
//! This crate provides the data model for small emulated networks: hosts,
//! switches, controllers, and the links between them. A [`TopologyBuilder`]
//! validates the declaration (unique ports per node, referenced nodes exist)
//! and resolves implicit port numbers and host addresses, producing an
//! immutable [`Topology`] value that a session controller can instantiate.
//!
//! Validation happens entirely up front, before any OS resource is touched.

pub mod link;
pub mod node;
pub mod presets;
pub mod topo;

pub use link::{LinkDef, LinkParams, ResolvedLink};
pub use node::{HostLimits, NodeKind, NodeSpec, SchedPolicy};
pub use topo::{Topology, TopologyBuilder, TopologyError};

/// Interface name for a given node port, e.g. `h1-eth1` or `s1-eth9`.
///
/// The same convention is used when creating the veth endpoints, so the
/// logical (node, port) pair always maps to exactly one interface name.
pub fn ifname(node: &str, port: u16) -> String {
    format!("{}-eth{}", node, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ifname_convention() {
        assert_eq!(ifname("h1", 1), "h1-eth1");
        assert_eq!(ifname("s1", 9), "s1-eth9");
    }
}
