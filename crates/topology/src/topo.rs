//! Topology validation and resolution
//!
//! [`TopologyBuilder`] collects node and link declarations and `build()`
//! turns them into an immutable [`Topology`]. All validation errors are
//! raised here, before a session allocates any OS resource.

use crate::link::{LinkDef, LinkParams, ResolvedLink};
use crate::node::{HostLimits, NodeKind, NodeSpec};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum TopologyError {
    #[error("Duplicate node name: {0}")]
    DuplicateNode(String),

    #[error("Invalid node name '{0}' (must be short and usable as an interface prefix)")]
    InvalidName(String),

    #[error("Link references undeclared node: {0}")]
    UnknownNode(String),

    #[error("Duplicate port {port} on node {node}")]
    DuplicatePort { node: String, port: u16 },

    #[error("Port 0 is reserved (node {0})")]
    PortZero(String),

    #[error("Interface name '{0}' exceeds the kernel's 15 character limit")]
    IfnameTooLong(String),

    #[error("Invalid address '{addr}' for node {node} (expected e.g. 10.0.0.1/8)")]
    InvalidAddress { node: String, addr: String },

    #[error("Address {addr} assigned to both {a} and {b}")]
    DuplicateAddress { addr: String, a: String, b: String },
}

/// An immutable, validated topology.
///
/// Port numbers and host addresses are fully resolved; building the same
/// declarations twice yields identical values.
#[derive(Clone, Debug, PartialEq)]
pub struct Topology {
    nodes: Vec<NodeSpec>,
    links: Vec<ResolvedLink>,
}

impl Topology {
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::new()
    }

    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    pub fn links(&self) -> &[ResolvedLink] {
        &self.links
    }

    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Hosts in declaration order.
    pub fn hosts(&self) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.iter().filter(|n| n.kind == NodeKind::Host)
    }

    /// Address (with prefix) of a host; always present after `build()`.
    pub fn host_ip(&self, name: &str) -> Option<&str> {
        self.node(name)
            .filter(|n| n.kind == NodeKind::Host)
            .and_then(|n| n.ip.as_deref())
    }

    /// Address of a host without the prefix length, for ping targets.
    pub fn host_addr(&self, name: &str) -> Option<&str> {
        self.host_ip(name)
            .map(|ip| ip.split('/').next().unwrap_or(ip))
    }

    /// Ports of a node in ascending order, with their interface names.
    pub fn ports(&self, node: &str) -> Vec<(u16, String)> {
        let mut ports: Vec<(u16, String)> = self
            .links
            .iter()
            .flat_map(|l| {
                let mut v = Vec::new();
                if l.a == node {
                    v.push((l.port_a, l.ifname_a()));
                }
                if l.b == node {
                    v.push((l.port_b, l.ifname_b()));
                }
                v
            })
            .collect();
        ports.sort_by_key(|(p, _)| *p);
        ports
    }

    /// Interface pairs `(local, peer)` for a node, in link-declaration order.
    pub fn connections(&self, node: &str) -> Vec<(String, String)> {
        self.links
            .iter()
            .filter_map(|l| {
                if l.a == node {
                    Some((l.ifname_a(), l.ifname_b()))
                } else if l.b == node {
                    Some((l.ifname_b(), l.ifname_a()))
                } else {
                    None
                }
            })
            .collect()
    }
}

/// Builder collecting declarations; `build()` validates and resolves.
#[derive(Clone, Debug, Default)]
pub struct TopologyBuilder {
    nodes: Vec<NodeSpec>,
    links: Vec<LinkDef>,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, spec: NodeSpec) -> &mut Self {
        self.nodes.push(spec);
        self
    }

    pub fn add_host(&mut self, name: impl Into<String>) -> &mut Self {
        self.add_node(NodeSpec::host(name))
    }

    pub fn add_host_limited(&mut self, name: impl Into<String>, limits: HostLimits) -> &mut Self {
        self.add_node(NodeSpec::host(name).with_limits(limits))
    }

    pub fn add_switch(&mut self, name: impl Into<String>) -> &mut Self {
        self.add_node(NodeSpec::switch(name))
    }

    pub fn add_controller(&mut self, name: impl Into<String>) -> &mut Self {
        self.add_node(NodeSpec::controller(name))
    }

    /// Add an unshaped link with auto-assigned ports.
    pub fn add_link(&mut self, a: impl Into<String>, b: impl Into<String>) -> &mut Self {
        self.links.push(LinkDef {
            a: a.into(),
            b: b.into(),
            port_a: None,
            port_b: None,
            params: LinkParams::default(),
        });
        self
    }

    /// Add a link with explicit ports and/or quality parameters.
    pub fn add_link_with(
        &mut self,
        a: impl Into<String>,
        b: impl Into<String>,
        port_a: Option<u16>,
        port_b: Option<u16>,
        params: LinkParams,
    ) -> &mut Self {
        self.links.push(LinkDef {
            a: a.into(),
            b: b.into(),
            port_a,
            port_b,
            params,
        });
        self
    }

    pub fn build(&self) -> Result<Topology, TopologyError> {
        let mut names = HashSet::new();
        for node in &self.nodes {
            if !is_valid_node_name(&node.name) {
                return Err(TopologyError::InvalidName(node.name.clone()));
            }
            if !names.insert(node.name.as_str()) {
                return Err(TopologyError::DuplicateNode(node.name.clone()));
            }
            if let Some(ip) = &node.ip {
                if !is_valid_cidr(ip) {
                    return Err(TopologyError::InvalidAddress {
                        node: node.name.clone(),
                        addr: ip.clone(),
                    });
                }
            }
        }

        // First pass: record explicitly pinned ports, catching conflicts.
        let mut used: HashMap<&str, HashSet<u16>> = HashMap::new();
        for link in &self.links {
            for (name, port) in [(&link.a, link.port_a), (&link.b, link.port_b)] {
                if !names.contains(name.as_str()) {
                    return Err(TopologyError::UnknownNode(name.clone()));
                }
                if let Some(port) = port {
                    if port == 0 {
                        return Err(TopologyError::PortZero(name.clone()));
                    }
                    if !used.entry(name).or_default().insert(port) {
                        return Err(TopologyError::DuplicatePort {
                            node: name.clone(),
                            port,
                        });
                    }
                }
            }
        }

        // Second pass: auto-assign the remaining endpoints, monotonically
        // from 1 per node in declaration order, skipping pinned numbers.
        let mut next: HashMap<&str, u16> = HashMap::new();
        let mut resolved = Vec::with_capacity(self.links.len());
        for link in &self.links {
            let port_a = Self::resolve_port(&link.a, link.port_a, &mut used, &mut next);
            let port_b = Self::resolve_port(&link.b, link.port_b, &mut used, &mut next);
            let rl = ResolvedLink {
                a: link.a.clone(),
                b: link.b.clone(),
                port_a,
                port_b,
                params: link.params.clone(),
            };
            for ifname in [rl.ifname_a(), rl.ifname_b()] {
                if ifname.len() > 15 {
                    return Err(TopologyError::IfnameTooLong(ifname));
                }
            }
            resolved.push(rl);
        }

        // Assign default addresses to hosts that lack one.
        let mut nodes = self.nodes.clone();
        let mut host_index = 0u32;
        for node in nodes.iter_mut().filter(|n| n.kind == NodeKind::Host) {
            host_index += 1;
            if node.ip.is_none() {
                node.ip = Some(format!("10.0.0.{}/8", host_index));
            }
        }

        let mut addr_owner: HashMap<&str, &str> = HashMap::new();
        for node in nodes.iter().filter(|n| n.kind == NodeKind::Host) {
            if let Some(ip) = node.ip.as_deref() {
                let addr = ip.split('/').next().unwrap_or(ip);
                if let Some(other) = addr_owner.insert(addr, &node.name) {
                    return Err(TopologyError::DuplicateAddress {
                        addr: addr.to_string(),
                        a: other.to_string(),
                        b: node.name.clone(),
                    });
                }
            }
        }

        Ok(Topology {
            nodes,
            links: resolved,
        })
    }

    fn resolve_port<'a>(
        name: &'a str,
        explicit: Option<u16>,
        used: &mut HashMap<&'a str, HashSet<u16>>,
        next: &mut HashMap<&'a str, u16>,
    ) -> u16 {
        if let Some(port) = explicit {
            return port;
        }
        let used = used.entry(name).or_default();
        let counter = next.entry(name).or_insert(1);
        while used.contains(counter) {
            *counter += 1;
        }
        let port = *counter;
        used.insert(port);
        *counter += 1;
        port
    }
}

fn is_valid_node_name(name: &str) -> bool {
    // The name plus "-eth<port>" must fit the 15 character interface limit;
    // the hard check happens per resolved link, this catches the basics.
    !name.is_empty()
        && name.len() <= 10
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

fn is_valid_cidr(addr: &str) -> bool {
    let mut parts = addr.splitn(2, '/');
    let ip_ok = parts
        .next()
        .map(|ip| ip.parse::<std::net::Ipv4Addr>().is_ok())
        .unwrap_or(false);
    let prefix_ok = parts
        .next()
        .and_then(|p| p.parse::<u8>().ok())
        .map(|p| p <= 32)
        .unwrap_or(false);
    ip_ok && prefix_ok
}
