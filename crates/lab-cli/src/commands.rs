//! CLI command implementations
//!
//! Topology construction is kept in plain helpers so the shapes each
//! command instantiates are unit-testable without CAP_NET_ADMIN; the
//! command functions themselves drive a live engine.

use anyhow::Result;
use clap::ValueEnum;
use netns_lab::diag::{self, Monitor};
use netns_lab::{NetnsEngine, Session, SessionPolicy};
use topology::{HostLimits, LinkParams, SchedPolicy, Topology, TopologyError};
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SchedArg {
    Cfs,
    Rt,
}

impl From<SchedArg> for SchedPolicy {
    fn from(arg: SchedArg) -> Self {
        match arg {
            SchedArg::Cfs => SchedPolicy::Cfs,
            SchedArg::Rt => SchedPolicy::Rt,
        }
    }
}

/// Five hosts on one switch; links 1-4 auto-numbered, the fifth pinned to
/// switch port 9 to exercise the pin-then-fill assignment path. The
/// controller node is inert under the bridge backend but keeps the
/// topology shape of the workflow this reproduces.
fn ports_topology() -> Result<Topology, TopologyError> {
    let mut b = Topology::builder();
    b.add_controller("c0");
    b.add_switch("s1");
    for i in 1..=5 {
        b.add_host(format!("h{}", i));
    }
    for i in 1..=4 {
        b.add_link(format!("h{}", i), "s1");
    }
    b.add_link_with("h5", "s1", Some(1), Some(9), LinkParams::default());
    b.build()
}

/// Single switch with `hosts` CPU-limited hosts splitting half the system.
fn monitor_topology(hosts: usize, sched: SchedPolicy) -> Result<Topology, TopologyError> {
    let limits = HostLimits {
        sched,
        ..HostLimits::fair_share(hosts)
    };
    topology::presets::single_switch_with(hosts, Some(limits), LinkParams::default())
}

/// Four CPU-limited hosts behind one switch on 10 Mbit / 5 ms HTB links
/// with 10% loss; `testmode` zeroes the loss so automated runs are
/// deterministic.
fn perf_topology(testmode: bool) -> Result<Topology, TopologyError> {
    let params = LinkParams {
        rate_kbps: Some(10_000),
        delay_ms: Some(5),
        loss_pct: if testmode { None } else { Some(10.0) },
        use_htb: true,
    };
    topology::presets::single_switch_with(4, Some(HostLimits::fair_share(4)), params)
}

/// Each host pings the next one around the ring.
fn ring_ping_commands(topo: &Topology, count: u32) -> Vec<(String, Vec<String>)> {
    let hosts: Vec<String> = topo.hosts().map(|h| h.name.clone()).collect();
    let mut commands = Vec::with_capacity(hosts.len());
    for (i, host) in hosts.iter().enumerate() {
        let target = &hosts[(i + 1) % hosts.len()];
        let addr = topo
            .host_addr(target)
            .unwrap_or_default()
            .to_string();
        commands.push((
            host.clone(),
            vec!["ping".to_string(), "-c".to_string(), count.to_string(), addr],
        ));
    }
    commands
}

/// The 'ports' command: print and validate switch ports, then ping sweep.
/// Mismatches are warnings; the exit code stays 0.
pub async fn cmd_ports() -> Result<()> {
    let topo = ports_topology()?;
    let engine = NetnsEngine::new().await?;
    let mut session = Session::start(engine, topo, SessionPolicy::default()).await?;

    println!("{}", diag::dump_connections(session.topology()));

    for check in diag::validate_ports(&session, "s1").await? {
        match check.kernel {
            Some(kernel) if check.ok() => {
                println!("{} -> port {}", check.ifname, kernel);
            }
            Some(kernel) => {
                println!(
                    "{} -> port {} (expected {})",
                    check.ifname, kernel, check.port
                );
            }
            None => println!("{} -> port unknown", check.ifname),
        }
    }

    let report = diag::ping_all(&session).await?;
    println!("{}", report);

    session.stop().await;
    Ok(())
}

/// The 'monitor' command: a ring of pings across CPU-limited hosts with
/// output multiplexed live.
pub async fn cmd_monitor(hosts: usize, sched: SchedArg, count: u32) -> Result<()> {
    anyhow::ensure!(hosts >= 2, "monitor needs at least 2 hosts");

    let topo = monitor_topology(hosts, sched.into())?;
    let engine = NetnsEngine::new().await?;
    let mut session = Session::start(engine, topo, SessionPolicy::default()).await?;

    let commands = ring_ping_commands(session.topology(), count);
    info!("Monitoring {} hosts, {} pings each", hosts, count);
    let mut monitor = Monitor::spawn(&session, &commands).await?;
    while let Some(event) = monitor.next().await {
        println!("<{}>: {}", event.node, event.line);
    }
    drop(monitor);

    session.stop().await;
    Ok(())
}

/// The 'perf' command: UDP bandwidth test between the edge hosts of a
/// shaped single-switch topology.
pub async fn cmd_perf(testmode: bool, duration: u32) -> Result<()> {
    let topo = perf_topology(testmode)?;
    let engine = NetnsEngine::new().await?;
    // Static ARP keeps the bandwidth test from racing resolution on a
    // lossy link
    let policy = SessionPolicy {
        static_arp: true,
        ..Default::default()
    };
    let mut session = Session::start(engine, topo, policy).await?;

    println!("Dumping host connections");
    print!("{}", diag::dump_connections(session.topology()));

    let report = diag::ping_all(&session).await?;
    println!("{}", report);

    println!("Testing bandwidth between h1 and h4");
    let result = diag::iperf_udp(&session, "h1", "h4", 10_000, duration).await?;
    match (&result.client, &result.server) {
        (Some(client), Some(server)) => println!("['{}', '{}']", client, server),
        _ => println!("iperf produced no bandwidth figure: {:?}", result),
    }

    session.stop().await;
    Ok(())
}

/// The 'clean' command: sweep namespaces left behind by crashed sessions.
pub async fn cmd_clean() -> Result<()> {
    let removed = NetnsEngine::sweep_stale().await?;
    println!("Removed {} stale namespace(s)", removed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use topology::NodeKind;

    #[test]
    fn test_ports_topology_pins_switch_port_nine() {
        let topo = ports_topology().unwrap();
        let ports: Vec<u16> = topo.ports("s1").iter().map(|(p, _)| *p).collect();
        assert_eq!(ports, vec![1, 2, 3, 4, 9]);
        assert_eq!(topo.ports("h5"), vec![(1, "h5-eth1".to_string())]);
    }

    #[test]
    fn test_ports_topology_has_unlinked_controller() {
        let topo = ports_topology().unwrap();
        let c0 = topo.node("c0").unwrap();
        assert_eq!(c0.kind, NodeKind::Controller);
        assert!(c0.ip.is_none());
        assert!(topo.ports("c0").is_empty());
        // The controller is not a sweep participant
        assert!(topo.hosts().all(|h| h.name != "c0"));
    }

    #[test]
    fn test_monitor_topology_limits_every_host() {
        let topo = monitor_topology(5, SchedPolicy::Cfs).unwrap();
        for host in topo.hosts() {
            let limits = host.limits.unwrap();
            assert!((limits.cpu - 0.1).abs() < f32::EPSILON);
            assert_eq!(limits.sched, SchedPolicy::Cfs);
        }
    }

    #[test]
    fn test_perf_topology_testmode_zeroes_loss() {
        let lossy = perf_topology(false).unwrap();
        for link in lossy.links() {
            assert_eq!(link.params.loss_pct, Some(10.0));
            assert!(link.params.use_htb);
        }

        let clean = perf_topology(true).unwrap();
        for link in clean.links() {
            assert_eq!(link.params.loss_pct, None);
            assert_eq!(link.params.rate_kbps, Some(10_000));
        }
    }

    #[test]
    fn test_perf_hosts_split_half_the_cpu() {
        let topo = perf_topology(true).unwrap();
        assert_eq!(topo.hosts().count(), 4);
        for host in topo.hosts() {
            let limits = host.limits.unwrap();
            assert!((limits.cpu - 0.125).abs() < f32::EPSILON);
        }
    }

    #[test]
    fn test_ring_ping_commands_wrap_around() {
        let topo = monitor_topology(3, SchedPolicy::Cfs).unwrap();
        let commands = ring_ping_commands(&topo, 10);
        assert_eq!(commands.len(), 3);
        // h3 wraps back to h1's address
        assert_eq!(commands[2].0, "h3");
        assert_eq!(commands[2].1, vec!["ping", "-c", "10", "10.0.0.1"]);
    }

    #[test]
    fn test_sched_arg_conversion() {
        assert_eq!(SchedPolicy::from(SchedArg::Cfs), SchedPolicy::Cfs);
        assert_eq!(SchedPolicy::from(SchedArg::Rt), SchedPolicy::Rt);
    }
}
