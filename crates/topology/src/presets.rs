//! Canned topologies for common lab setups

use crate::link::LinkParams;
use crate::node::HostLimits;
use crate::topo::{Topology, TopologyBuilder, TopologyError};

/// One switch `s1` with `n` hosts `h1..hn`, one unshaped link each.
pub fn single_switch(n: usize) -> Result<Topology, TopologyError> {
    single_switch_with(n, None, LinkParams::default())
}

/// Single-switch topology with per-host limits and per-link shaping.
pub fn single_switch_with(
    n: usize,
    limits: Option<HostLimits>,
    params: LinkParams,
) -> Result<Topology, TopologyError> {
    let mut b = TopologyBuilder::new();
    b.add_switch("s1");
    for i in 1..=n {
        let name = format!("h{}", i);
        match limits {
            Some(l) => b.add_host_limited(name.clone(), l),
            None => b.add_host(name.clone()),
        };
        b.add_link_with(name, "s1", None, None, params.clone());
    }
    b.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_switch_shape() {
        let topo = single_switch(4).unwrap();
        assert_eq!(topo.hosts().count(), 4);
        assert_eq!(topo.links().len(), 4);
        let ports: Vec<u16> = topo.ports("s1").iter().map(|(p, _)| *p).collect();
        assert_eq!(ports, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_single_switch_shaped_links() {
        let params = LinkParams {
            rate_kbps: Some(10_000),
            delay_ms: Some(5),
            loss_pct: Some(10.0),
            use_htb: true,
        };
        let topo = single_switch_with(2, Some(HostLimits::fair_share(2)), params.clone()).unwrap();
        for link in topo.links() {
            assert_eq!(link.params, params);
        }
        for host in topo.hosts() {
            assert!(host.limits.is_some());
        }
    }
}
