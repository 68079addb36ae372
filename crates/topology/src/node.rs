//! Node definitions: hosts, switches, and controllers

use serde::{Deserialize, Serialize};

/// What role a node plays in the topology.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    /// End host with an IP address on its first interface
    Host,
    /// L2 switch (backed by a Linux bridge in its namespace)
    Switch,
    /// Controller node; no data-plane role of its own
    Controller,
}

/// Process scheduler class for CPU-limited hosts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedPolicy {
    /// Completely fair scheduler with a bandwidth quota
    #[default]
    Cfs,
    /// Real-time scheduling; backends may degrade this to a warning
    Rt,
}

/// Optional per-host resource limits.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct HostLimits {
    /// Fraction of one CPU the host's processes may use (0.0-1.0)
    pub cpu: f32,
    /// Scheduler class the quota is enforced under
    pub sched: SchedPolicy,
}

impl HostLimits {
    /// Equal CPU share for `n` hosts splitting half the system.
    pub fn fair_share(n: usize) -> Self {
        Self {
            cpu: 0.5 / (n.max(1) as f32),
            sched: SchedPolicy::Cfs,
        }
    }
}

/// A single node declaration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Unique node name, also the interface-name prefix
    pub name: String,
    pub kind: NodeKind,
    /// Resource limits; only meaningful for hosts
    pub limits: Option<HostLimits>,
    /// IP address with prefix length (e.g. "10.0.0.1/8"); hosts without an
    /// explicit address get one assigned at build time
    pub ip: Option<String>,
}

impl NodeSpec {
    pub fn host(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Host,
            limits: None,
            ip: None,
        }
    }

    pub fn switch(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Switch,
            limits: None,
            ip: None,
        }
    }

    pub fn controller(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Controller,
            limits: None,
            ip: None,
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_limits(mut self, limits: HostLimits) -> Self {
        self.limits = Some(limits);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fair_share_splits_half() {
        let limits = HostLimits::fair_share(5);
        assert!((limits.cpu - 0.1).abs() < f32::EPSILON);
        assert_eq!(limits.sched, SchedPolicy::Cfs);
    }

    #[test]
    fn test_fair_share_never_divides_by_zero() {
        let limits = HostLimits::fair_share(0);
        assert!(limits.cpu > 0.0);
    }

    #[test]
    fn test_node_constructors() {
        let h = NodeSpec::host("h1").with_ip("10.0.0.1/8");
        assert_eq!(h.kind, NodeKind::Host);
        assert_eq!(h.ip.as_deref(), Some("10.0.0.1/8"));

        let s = NodeSpec::switch("s1");
        assert_eq!(s.kind, NodeKind::Switch);
        assert!(s.ip.is_none());
    }
}
