//! Netns-backed emulation engine
//!
//! Implements [`Engine`] on real Linux primitives: one network namespace per
//! node, a Linux bridge per switch, rtnetlink-created veth pairs moved into
//! the endpoint namespaces, tc shaping, and cgroup CPU quotas. The logical
//! port number of every endpoint is written to the interface's kernel
//! `ifalias` at creation time, which is what [`Engine::kernel_port`] reads
//! back for validation.

use crate::cgroup;
use crate::engine::{CmdOutput, Engine, EngineError};
use crate::netns;
use crate::qdisc;
use crate::veth;
use ipnetwork::IpNetwork;
use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::process::Child;
use topology::{NodeKind, NodeSpec, ResolvedLink, Topology};
use tracing::{debug, info, warn};

/// Namespace prefix shared by all sessions, used for stale sweeps.
const NS_PREFIX: &str = "nlab";

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Production engine instantiating topologies on network namespaces.
pub struct NetnsEngine {
    sid: String,
    netns: netns::Manager,
    veth: veth::Manager,
    cgroups: cgroup::Manager,
    nodes: HashMap<String, NodeSpec>,
    /// Hosts whose primary interface already carries the node address
    addressed: HashSet<String>,
}

impl NetnsEngine {
    pub async fn new() -> Result<Self, EngineError> {
        let sid = format!(
            "{}{:x}x{}",
            NS_PREFIX,
            std::process::id(),
            SESSION_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        info!("Initializing netns engine (session id: {})", sid);

        let netns = netns::Manager::new()?;
        let veth = veth::Manager::new().await?;
        let cgroups = cgroup::Manager::new(&format!("netlab-{}", sid));

        Ok(Self {
            sid,
            netns,
            veth,
            cgroups,
            nodes: HashMap::new(),
            addressed: HashSet::new(),
        })
    }

    /// Sweep namespaces left behind by crashed sessions of any process.
    pub async fn sweep_stale() -> Result<usize, EngineError> {
        let mut manager = netns::Manager::new()?;
        let cleaned = manager.cleanup_stale(NS_PREFIX).await?;
        if cleaned > 0 {
            info!("Swept {} stale namespaces", cleaned);
        }
        Ok(cleaned)
    }

    fn ns_name(&self, node: &str) -> String {
        format!("{}-{}", self.sid, node)
    }

    fn spec(&self, node: &str) -> Result<&NodeSpec, EngineError> {
        self.nodes
            .get(node)
            .ok_or_else(|| EngineError::UnknownNode(node.to_string()))
    }

    /// Run a configuration command inside a namespace and check its status.
    async fn run_ns(&self, ns: &str, program: &str, args: &[&str]) -> Result<(), EngineError> {
        debug!("[{}] {} {}", ns, program, args.join(" "));
        let output = self.netns.command(ns, program)?.args(args).output().await?;
        if !output.status.success() {
            return Err(EngineError::CommandFailed {
                argv: format!("{} {}", program, args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn place_endpoint(
        &mut self,
        node: &str,
        ifname: &str,
        port: u16,
    ) -> Result<(), EngineError> {
        let ns = self.ns_name(node);
        let fd = self.netns.fd(&ns)?;
        self.veth.move_to_ns(ifname, fd).await?;

        // Record the logical port in the kernel's ifalias; kernel_port()
        // reads this back
        self.run_ns(&ns, "ip", &["link", "set", "dev", ifname, "alias", &port.to_string()])
            .await?;

        let spec = self.spec(node)?.clone();
        match spec.kind {
            NodeKind::Host => {
                if !self.addressed.contains(node) {
                    if let Some(ip) = &spec.ip {
                        let network: IpNetwork = ip
                            .parse()
                            .map_err(|e| EngineError::Parse(format!("address {}: {}", ip, e)))?;
                        self.run_ns(
                            &ns,
                            "ip",
                            &["addr", "add", &network.to_string(), "dev", ifname],
                        )
                        .await?;
                        self.addressed.insert(node.to_string());
                    }
                }
            }
            NodeKind::Switch => {
                self.run_ns(&ns, "ip", &["link", "set", "dev", ifname, "master", &spec.name])
                    .await?;
            }
            NodeKind::Controller => {}
        }
        Ok(())
    }

    async fn shape_endpoint(&self, link: &ResolvedLink, node: &str, ifname: &str) -> Result<(), EngineError> {
        let commands = qdisc::shape_commands(ifname, &link.params)?;
        let ns = self.ns_name(node);
        for cmd in &commands {
            let args: Vec<&str> = cmd.iter().map(String::as_str).collect();
            self.run_ns(&ns, "tc", &args).await?;
        }
        Ok(())
    }
}

impl Engine for NetnsEngine {
    async fn create_node(&mut self, spec: &NodeSpec) -> Result<(), EngineError> {
        let ns = self.ns_name(&spec.name);
        debug!("Creating node {} ({:?})", spec.name, spec.kind);

        self.netns.create(&ns).await?;
        self.run_ns(&ns, "ip", &["link", "set", "dev", "lo", "up"])
            .await?;

        if spec.kind == NodeKind::Switch {
            self.run_ns(&ns, "ip", &["link", "add", "name", &spec.name, "type", "bridge"])
                .await?;
        }

        if spec.kind == NodeKind::Host {
            if let Some(limits) = &spec.limits {
                self.cgroups.create(&spec.name, limits).await?;
            }
        }

        self.nodes.insert(spec.name.clone(), spec.clone());
        info!("Created node: {}", spec.name);
        Ok(())
    }

    async fn create_link(&mut self, link: &ResolvedLink) -> Result<(), EngineError> {
        // Fail before touching the kernel if an endpoint is unknown
        self.spec(&link.a)?;
        self.spec(&link.b)?;

        let ifa = link.ifname_a();
        let ifb = link.ifname_b();
        debug!("Creating link {}:{} <-> {}:{}", link.a, link.port_a, link.b, link.port_b);

        self.veth.create_pair(&ifa, &ifb).await?;

        // If endpoint placement fails the pair is still in the root
        // namespace; delete it so the failed link leaves nothing behind
        let placed = async {
            self.place_endpoint(&link.a, &ifa, link.port_a).await?;
            self.place_endpoint(&link.b, &ifb, link.port_b).await?;
            Ok::<(), EngineError>(())
        }
        .await;
        if let Err(e) = placed {
            if self.veth.delete(&ifa).await.is_err() {
                // First endpoint already moved; drop it via its namespace
                let ns = self.ns_name(&link.a);
                let _ = self.run_ns(&ns, "ip", &["link", "del", "dev", &ifa]).await;
            }
            return Err(e);
        }

        self.shape_endpoint(link, &link.a, &ifa).await?;
        self.shape_endpoint(link, &link.b, &ifb).await?;

        info!("Created link: ({}, {})", link.a, link.b);
        Ok(())
    }

    async fn start(&mut self, topo: &Topology) -> Result<(), EngineError> {
        for node in topo.nodes() {
            if node.kind == NodeKind::Switch {
                let ns = self.ns_name(&node.name);
                self.run_ns(&ns, "ip", &["link", "set", "dev", &node.name, "up"])
                    .await?;
            }
        }
        for link in topo.links() {
            for (node, ifname) in [(&link.a, link.ifname_a()), (&link.b, link.ifname_b())] {
                let ns = self.ns_name(node);
                self.run_ns(&ns, "ip", &["link", "set", "dev", &ifname, "up"])
                    .await?;
            }
        }
        info!("Started network ({} links up)", topo.links().len());
        Ok(())
    }

    async fn destroy_link(&mut self, link: &ResolvedLink) -> Result<(), EngineError> {
        let ns = self.ns_name(&link.a);
        if !self.netns.exists(&ns) {
            // Namespace teardown already reclaimed the veth pair
            return Ok(());
        }
        let ifa = link.ifname_a();
        match self.run_ns(&ns, "ip", &["link", "del", "dev", &ifa]).await {
            Ok(()) => {
                debug!("Destroyed link ({}, {})", link.a, link.b);
                Ok(())
            }
            Err(EngineError::CommandFailed { stderr, .. }) if stderr.contains("Cannot find") => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn destroy_node(&mut self, name: &str) -> Result<(), EngineError> {
        if let Some(spec) = self.nodes.remove(name) {
            if spec.kind == NodeKind::Host && spec.limits.is_some() {
                if let Err(e) = self.cgroups.remove(name).await {
                    warn!("Failed to remove cgroup for {}: {}", name, e);
                }
            }
        }
        self.addressed.remove(name);
        let ns = self.ns_name(name);
        self.netns.delete(&ns).await?;
        debug!("Destroyed node: {}", name);
        Ok(())
    }

    async fn run(&self, node: &str, argv: &[&str]) -> Result<CmdOutput, EngineError> {
        let spec = self.spec(node)?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| EngineError::Parse("empty argv".to_string()))?;

        let ns = self.ns_name(&spec.name);
        let output = self.netns.command(&ns, program)?.args(args).output().await?;
        Ok(CmdOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn spawn(&self, node: &str, argv: &[&str]) -> Result<Child, EngineError> {
        let spec = self.spec(node)?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| EngineError::Parse("empty argv".to_string()))?;

        let ns = self.ns_name(&spec.name);
        let child = self
            .netns
            .command(&ns, program)?
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if spec.kind == NodeKind::Host && spec.limits.is_some() {
            if let Some(pid) = child.id() {
                self.cgroups.attach(node, pid).await;
            }
        }
        Ok(child)
    }

    async fn kernel_port(&self, node: &str, ifname: &str) -> Result<u16, EngineError> {
        let output = self
            .run(node, &["ip", "-j", "link", "show", "dev", ifname])
            .await?;
        if !output.success() {
            return Err(EngineError::CommandFailed {
                argv: format!("ip -j link show dev {}", ifname),
                stderr: output.stderr.trim().to_string(),
            });
        }

        let parsed: serde_json::Value = serde_json::from_str(&output.stdout)
            .map_err(|e| EngineError::Parse(format!("ip -j output: {}", e)))?;
        parsed
            .get(0)
            .and_then(|link| link.get("ifalias"))
            .and_then(|alias| alias.as_str())
            .and_then(|alias| alias.parse::<u16>().ok())
            .ok_or_else(|| {
                EngineError::Parse(format!("no port recorded for {} on {}", ifname, node))
            })
    }
}

#[cfg(test)]
mod tests {
    #[cfg(feature = "sudo-tests")]
    use super::*;
    #[cfg(feature = "sudo-tests")]
    use crate::engine::Engine;

    #[tokio::test]
    #[cfg(feature = "sudo-tests")]
    async fn test_host_link_kernel_port_roundtrip() -> Result<(), EngineError> {
        use topology::{LinkParams, NodeSpec, ResolvedLink};

        let mut engine = NetnsEngine::new().await?;
        engine.create_node(&NodeSpec::host("h1").with_ip("10.99.0.1/24")).await?;
        engine.create_node(&NodeSpec::host("h2").with_ip("10.99.0.2/24")).await?;

        let link = ResolvedLink {
            a: "h1".to_string(),
            b: "h2".to_string(),
            port_a: 1,
            port_b: 9,
            params: LinkParams::default(),
        };
        engine.create_link(&link).await?;

        assert_eq!(engine.kernel_port("h1", "h1-eth1").await?, 1);
        assert_eq!(engine.kernel_port("h2", "h2-eth9").await?, 9);

        engine.destroy_link(&link).await?;
        engine.destroy_node("h1").await?;
        engine.destroy_node("h2").await?;
        Ok(())
    }
}
