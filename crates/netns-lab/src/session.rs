//! Session lifecycle: sequential allocation, rollback, idempotent teardown
//!
//! A [`Session`] owns every resource instantiated for one topology. Nodes
//! and links are allocated one at a time in declaration order so failure
//! attribution is unambiguous; if any step fails, everything allocated so
//! far is released in reverse order before the error propagates. Stopping
//! is idempotent and never aborts early: individual release failures are
//! aggregated into a [`TeardownReport`].

use crate::engine::{CmdOutput, Engine, EngineError};
use serde::Serialize;
use thiserror::Error;
use tokio::process::Child;
use topology::{ifname, HostLimits, NodeKind, NodeSpec, ResolvedLink, Topology};
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Session is stopped")]
    Stopped,

    #[error("Unknown node: {0}")]
    UnknownNode(String),
}

/// Session-wide policy applied at start.
#[derive(Clone, Debug, Default)]
pub struct SessionPolicy {
    /// Limits for hosts that do not declare their own
    pub default_limits: Option<HostLimits>,
    /// Install permanent neighbor entries between all host pairs after
    /// start, so diagnostics never race ARP resolution
    pub static_arp: bool,
}

/// Aggregated outcome of a teardown pass.
#[derive(Debug, Default, Serialize)]
pub struct TeardownReport {
    /// (resource description, error message) for every failed release
    pub failures: Vec<(String, String)>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A running instance of a topology.
pub struct Session<E: Engine> {
    engine: E,
    topo: Topology,
    created_nodes: Vec<String>,
    created_links: Vec<ResolvedLink>,
    stopped: bool,
}

impl<E: Engine> Session<E> {
    /// Instantiate and start a topology.
    ///
    /// Allocation order is deterministic: nodes in declaration order, then
    /// links in declaration order, then start. On failure every resource
    /// allocated so far is released before the error is returned.
    pub async fn start(
        mut engine: E,
        topo: Topology,
        policy: SessionPolicy,
    ) -> Result<Self, SessionError> {
        let mut created_nodes = Vec::new();
        let mut created_links = Vec::new();

        let result =
            Self::provision(&mut engine, &topo, &policy, &mut created_nodes, &mut created_links)
                .await;

        if let Err(e) = result {
            warn!("Startup failed ({}); rolling back partial allocation", e);
            let report = Self::release(&mut engine, &created_nodes, &created_links).await;
            for (resource, err) in &report.failures {
                warn!("Rollback: failed to release {}: {}", resource, err);
            }
            return Err(e.into());
        }

        let session = Self {
            engine,
            topo,
            created_nodes,
            created_links,
            stopped: false,
        };

        if policy.static_arp {
            session.install_static_arp().await;
        }

        info!(
            "Session started: {} nodes, {} links",
            session.created_nodes.len(),
            session.created_links.len()
        );
        Ok(session)
    }

    async fn provision(
        engine: &mut E,
        topo: &Topology,
        policy: &SessionPolicy,
        created_nodes: &mut Vec<String>,
        created_links: &mut Vec<ResolvedLink>,
    ) -> Result<(), EngineError> {
        for node in topo.nodes() {
            let spec = Self::with_policy(node, policy);
            engine.create_node(&spec).await?;
            created_nodes.push(node.name.clone());
        }
        for link in topo.links() {
            engine.create_link(link).await?;
            created_links.push(link.clone());
        }
        engine.start(topo).await
    }

    fn with_policy(node: &NodeSpec, policy: &SessionPolicy) -> NodeSpec {
        let mut spec = node.clone();
        if spec.kind == NodeKind::Host && spec.limits.is_none() {
            spec.limits = policy.default_limits;
        }
        spec
    }

    /// Release links then nodes, most recent first, continuing past
    /// individual failures.
    async fn release(
        engine: &mut E,
        created_nodes: &[String],
        created_links: &[ResolvedLink],
    ) -> TeardownReport {
        let mut report = TeardownReport::default();
        for link in created_links.iter().rev() {
            if let Err(e) = engine.destroy_link(link).await {
                report
                    .failures
                    .push((format!("link ({}, {})", link.a, link.b), e.to_string()));
            }
        }
        for name in created_nodes.iter().rev() {
            if let Err(e) = engine.destroy_node(name).await {
                report.failures.push((format!("node {}", name), e.to_string()));
            }
        }
        report
    }

    /// Stop the session, releasing every owned resource.
    ///
    /// Idempotent: a second call does nothing and reports no failures.
    pub async fn stop(&mut self) -> TeardownReport {
        if self.stopped {
            debug!("Session already stopped");
            return TeardownReport::default();
        }
        self.stopped = true;

        info!(
            "Stopping session: {} links, {} nodes",
            self.created_links.len(),
            self.created_nodes.len()
        );
        let report =
            Self::release(&mut self.engine, &self.created_nodes, &self.created_links).await;
        for (resource, err) in &report.failures {
            warn!("Teardown: failed to release {}: {}", resource, err);
        }
        self.created_links.clear();
        self.created_nodes.clear();
        report
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn topology(&self) -> &Topology {
        &self.topo
    }

    /// Host names in declaration order.
    pub fn hosts(&self) -> Vec<String> {
        self.topo.hosts().map(|h| h.name.clone()).collect()
    }

    /// The node's first interface (its lowest port), if it has any links.
    pub fn primary_ifname(&self, node: &str) -> Option<String> {
        self.topo.ports(node).first().map(|(_, ifname)| ifname.clone())
    }

    fn check_node(&self, node: &str) -> Result<(), SessionError> {
        if self.stopped {
            return Err(SessionError::Stopped);
        }
        if self.topo.node(node).is_none() {
            return Err(SessionError::UnknownNode(node.to_string()));
        }
        Ok(())
    }

    /// Run a blocking command inside a node.
    pub async fn run(&self, node: &str, argv: &[&str]) -> Result<CmdOutput, SessionError> {
        self.check_node(node)?;
        Ok(self.engine.run(node, argv).await?)
    }

    /// Spawn a long-running process inside a node.
    pub async fn spawn(&self, node: &str, argv: &[&str]) -> Result<Child, SessionError> {
        self.check_node(node)?;
        Ok(self.engine.spawn(node, argv).await?)
    }

    /// Kernel-recorded port number for `(node, port)`'s interface.
    pub async fn kernel_port(&self, node: &str, port: u16) -> Result<u16, SessionError> {
        self.check_node(node)?;
        Ok(self.engine.kernel_port(node, &ifname(node, port)).await?)
    }

    /// Install permanent neighbor entries between every host pair. ARP
    /// failures here are diagnostics-grade: logged, never fatal.
    async fn install_static_arp(&self) {
        let hosts = self.hosts();
        for src in &hosts {
            let Some(src_if) = self.primary_ifname(src) else {
                continue;
            };
            for dst in &hosts {
                if src == dst {
                    continue;
                }
                let (Some(addr), Some(dst_if)) =
                    (self.topo.host_addr(dst), self.primary_ifname(dst))
                else {
                    continue;
                };
                match self.mac_of(dst, &dst_if).await {
                    Some(mac) => {
                        let result = self
                            .engine
                            .run(
                                src,
                                &[
                                    "ip", "neigh", "replace", addr, "lladdr", &mac, "dev",
                                    &src_if, "nud", "permanent",
                                ],
                            )
                            .await;
                        if let Err(e) = result {
                            warn!("Static ARP {} -> {} failed: {}", src, dst, e);
                        }
                    }
                    None => warn!("Static ARP: no MAC found for {}", dst),
                }
            }
        }
    }

    /// MAC address of an interface, read through the node itself.
    async fn mac_of(&self, node: &str, ifname: &str) -> Option<String> {
        let output = self
            .engine
            .run(node, &["ip", "-j", "link", "show", "dev", ifname])
            .await
            .ok()?;
        if !output.success() {
            return None;
        }
        let parsed: serde_json::Value = serde_json::from_str(&output.stdout).ok()?;
        parsed
            .get(0)?
            .get("address")?
            .as_str()
            .map(|s| s.to_string())
    }
}

impl<E: Engine> Drop for Session<E> {
    fn drop(&mut self) {
        if self.stopped {
            return;
        }
        // Best-effort teardown for sessions dropped without stop()
        match tokio::runtime::Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| {
                    handle.block_on(async {
                        let _ = Self::release(
                            &mut self.engine,
                            &self.created_nodes,
                            &self.created_links,
                        )
                        .await;
                    })
                });
            }
            _ => warn!("Session dropped without stop(); resources may leak"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockEngine;
    use topology::LinkParams;

    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("netns_lab=debug")
            .try_init();
    }

    fn three_host_topo() -> Topology {
        let mut b = Topology::builder();
        b.add_switch("s1");
        b.add_host("h1").add_host("h2").add_host("h3");
        b.add_link("h1", "s1");
        b.add_link("h2", "s1");
        b.add_link("h3", "s1");
        b.build().unwrap()
    }

    #[tokio::test]
    async fn test_allocation_order_is_declaration_order() {
        init_logging();
        let engine = MockEngine::new();
        let log = engine.log_handle();

        let mut session = Session::start(engine, three_host_topo(), SessionPolicy::default())
            .await
            .unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "create_node s1",
                "create_node h1",
                "create_node h2",
                "create_node h3",
                "create_link h1:s1",
                "create_link h2:s1",
                "create_link h3:s1",
                "start",
            ]
        );
        session.stop().await;
    }

    #[tokio::test]
    async fn test_failed_startup_rolls_back_everything() {
        init_logging();
        let engine = MockEngine::new().fail_on("create_link h3:s1");
        let log = engine.log_handle();

        let result =
            Session::start(engine, three_host_topo(), SessionPolicy::default()).await;
        assert!(result.is_err());

        // Every successful create has a matching destroy, in reverse order,
        // and nothing after the failure point was touched
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "create_node s1",
                "create_node h1",
                "create_node h2",
                "create_node h3",
                "create_link h1:s1",
                "create_link h2:s1",
                "create_link h3:s1",
                "destroy_link h2:s1",
                "destroy_link h1:s1",
                "destroy_node h3",
                "destroy_node h2",
                "destroy_node h1",
                "destroy_node s1",
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        init_logging();
        let engine = MockEngine::new();
        let log = engine.log_handle();

        let mut session = Session::start(engine, three_host_topo(), SessionPolicy::default())
            .await
            .unwrap();
        let first = session.stop().await;
        assert!(first.is_clean());
        let destroys_after_first = log
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.starts_with("destroy"))
            .count();

        let second = session.stop().await;
        assert!(second.is_clean());
        let destroys_after_second = log
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.starts_with("destroy"))
            .count();
        assert_eq!(destroys_after_first, destroys_after_second);
        assert!(session.is_stopped());
    }

    #[tokio::test]
    async fn test_stop_aggregates_release_failures() {
        init_logging();
        let engine = MockEngine::new().fail_on("destroy_node h2");
        let log = engine.log_handle();

        let mut session = Session::start(engine, three_host_topo(), SessionPolicy::default())
            .await
            .unwrap();
        let report = session.stop().await;

        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].0.contains("h2"));
        // Every other resource was still released
        let destroys = log
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.starts_with("destroy"))
            .count();
        assert_eq!(destroys, 7);
    }

    #[tokio::test]
    async fn test_default_limits_apply_to_unlimited_hosts() {
        init_logging();
        let engine = MockEngine::new();
        let log = engine.log_handle();

        let policy = SessionPolicy {
            default_limits: Some(HostLimits {
                cpu: 0.25,
                sched: topology::SchedPolicy::Cfs,
            }),
            static_arp: false,
        };
        let mut session = Session::start(engine, three_host_topo(), policy).await.unwrap();
        let limited = log
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.contains("cpu=0.25"))
            .count();
        assert_eq!(limited, 3); // hosts only, not the switch
        session.stop().await;
    }

    #[tokio::test]
    async fn test_kernel_ports_match_logical_after_start() {
        init_logging();
        let mut b = Topology::builder();
        b.add_switch("s1");
        for i in 1..=5 {
            b.add_host(format!("h{}", i));
        }
        for i in 1..=4 {
            b.add_link(format!("h{}", i), "s1");
        }
        b.add_link_with("h5", "s1", Some(1), Some(9), LinkParams::default());
        let topo = b.build().unwrap();

        let engine = MockEngine::new();
        let mut session = Session::start(engine, topo, SessionPolicy::default()).await.unwrap();

        for (logical, _) in session.topology().ports("s1") {
            assert_eq!(session.kernel_port("s1", logical).await.unwrap(), logical);
        }
        assert_eq!(session.kernel_port("s1", 9).await.unwrap(), 9);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_run_on_stopped_session_fails() {
        init_logging();
        let engine = MockEngine::new();
        let mut session = Session::start(engine, three_host_topo(), SessionPolicy::default())
            .await
            .unwrap();
        session.stop().await;
        assert!(matches!(
            session.run("h1", &["true"]).await,
            Err(SessionError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_unknown_node_rejected() {
        init_logging();
        let engine = MockEngine::new();
        let mut session = Session::start(engine, three_host_topo(), SessionPolicy::default())
            .await
            .unwrap();
        assert!(matches!(
            session.run("h9", &["true"]).await,
            Err(SessionError::UnknownNode(_))
        ));
        session.stop().await;
    }
}
