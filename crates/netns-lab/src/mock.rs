//! Recording engine double for session and diagnostics tests
//!
//! Records every lifecycle call, optionally failing injected operations,
//! and answers kernel-port lookups from what link creation recorded. Spawn
//! runs a plain `sh` script in the test's own namespace so monitor tests
//! exercise real subprocess plumbing without CAP_NET_ADMIN.

use crate::engine::{CmdOutput, Engine, EngineError};
use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::process::{Child, Command};
use topology::{NodeSpec, ResolvedLink, Topology};

pub struct MockEngine {
    log: Arc<Mutex<Vec<String>>>,
    fail_on: HashSet<String>,
    /// (node, ifname) -> port recorded at link creation
    kernel_ports: HashMap<(String, String), u16>,
    /// Test-injected overrides simulating a kernel that disagrees
    port_overrides: HashMap<(String, String), u16>,
    /// Per-node scripts run by `spawn`
    scripts: HashMap<String, String>,
    /// Commands for which `run` should report failure
    failing_runs: HashSet<String>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            fail_on: HashSet::new(),
            kernel_ports: HashMap::new(),
            port_overrides: HashMap::new(),
            scripts: HashMap::new(),
            failing_runs: HashSet::new(),
        }
    }

    /// Shared handle to the operation log; survives the engine moving into
    /// a session and the session failing to start.
    pub fn log_handle(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.log)
    }

    /// Fail the operation with the given key, e.g. `create_link h3:s1`.
    pub fn fail_on(mut self, op: &str) -> Self {
        self.fail_on.insert(op.to_string());
        self
    }

    /// Make the kernel report `port` for `(node, ifname)` regardless of
    /// what link creation recorded.
    pub fn override_kernel_port(mut self, node: &str, ifname: &str, port: u16) -> Self {
        self.port_overrides
            .insert((node.to_string(), ifname.to_string()), port);
        self
    }

    /// Script `spawn` runs for the given node.
    pub fn script(mut self, node: &str, script: &str) -> Self {
        self.scripts.insert(node.to_string(), script.to_string());
        self
    }

    /// Make `run` report a non-zero exit for the given joined argv.
    pub fn fail_run(mut self, argv: &str) -> Self {
        self.failing_runs.insert(argv.to_string());
        self
    }

    fn record(&self, op: String) -> Result<(), EngineError> {
        self.log.lock().unwrap().push(op.clone());
        if self.fail_on.contains(&op) {
            return Err(EngineError::Injected(op));
        }
        Ok(())
    }
}

impl Engine for MockEngine {
    async fn create_node(&mut self, spec: &NodeSpec) -> Result<(), EngineError> {
        let op = match spec.limits {
            Some(limits) => format!("create_node {} cpu={}", spec.name, limits.cpu),
            None => format!("create_node {}", spec.name),
        };
        self.record(op)
    }

    async fn create_link(&mut self, link: &ResolvedLink) -> Result<(), EngineError> {
        self.record(format!("create_link {}:{}", link.a, link.b))?;
        self.kernel_ports
            .insert((link.a.clone(), link.ifname_a()), link.port_a);
        self.kernel_ports
            .insert((link.b.clone(), link.ifname_b()), link.port_b);
        Ok(())
    }

    async fn start(&mut self, _topo: &Topology) -> Result<(), EngineError> {
        self.record("start".to_string())
    }

    async fn destroy_link(&mut self, link: &ResolvedLink) -> Result<(), EngineError> {
        self.record(format!("destroy_link {}:{}", link.a, link.b))?;
        self.kernel_ports
            .remove(&(link.a.clone(), link.ifname_a()));
        self.kernel_ports
            .remove(&(link.b.clone(), link.ifname_b()));
        Ok(())
    }

    async fn destroy_node(&mut self, name: &str) -> Result<(), EngineError> {
        self.record(format!("destroy_node {}", name))
    }

    async fn run(&self, node: &str, argv: &[&str]) -> Result<CmdOutput, EngineError> {
        let joined = argv.join(" ");
        self.log
            .lock()
            .unwrap()
            .push(format!("run {} {}", node, joined));
        if self.failing_runs.contains(&joined) {
            return Ok(CmdOutput {
                code: 1,
                stdout: String::new(),
                stderr: "injected run failure".to_string(),
            });
        }
        Ok(CmdOutput {
            code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn spawn(&self, node: &str, _argv: &[&str]) -> Result<Child, EngineError> {
        let script = self
            .scripts
            .get(node)
            .cloned()
            .unwrap_or_else(|| "exit 0".to_string());
        let child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }

    async fn kernel_port(&self, node: &str, ifname: &str) -> Result<u16, EngineError> {
        let key = (node.to_string(), ifname.to_string());
        if let Some(port) = self.port_overrides.get(&key) {
            return Ok(*port);
        }
        self.kernel_ports.get(&key).copied().ok_or_else(|| {
            EngineError::Parse(format!("no port recorded for {} on {}", ifname, node))
        })
    }
}
