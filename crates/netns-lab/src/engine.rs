//! The boundary between session logic and emulation mechanics
//!
//! [`Engine`] is the narrow interface a session drives: one call per node,
//! one call per link, explicit start, idempotent destroy, plus command
//! execution and the kernel-side port lookup. The production implementation
//! is [`crate::backend::NetnsEngine`]; tests substitute a recording mock.

use thiserror::Error;
use tokio::process::Child;
use topology::{NodeSpec, ResolvedLink, Topology};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Network namespace error: {0}")]
    NetNs(#[from] crate::netns::NetNsError),

    #[error("Veth interface error: {0}")]
    Veth(#[from] crate::veth::VethError),

    #[error("Qdisc configuration error: {0}")]
    Qdisc(#[from] crate::qdisc::QdiscError),

    #[error("Cgroup error: {0}")]
    Cgroup(#[from] crate::cgroup::CgroupError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Command `{argv}` failed: {stderr}")]
    CommandFailed { argv: String, stderr: String },

    #[error("Failed to parse kernel state: {0}")]
    Parse(String),

    #[error("Injected failure: {0}")]
    #[cfg(test)]
    Injected(String),
}

/// Captured output of a blocking command run inside a node.
#[derive(Clone, Debug, Default)]
pub struct CmdOutput {
    /// Exit code; -1 if the process was killed by a signal
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Emulation engine interface.
///
/// Allocation calls (`create_node`, `create_link`) are issued sequentially
/// by the session; destroy calls must be idempotent so rollback and repeated
/// teardown are safe. Commands take argv lists, never interpolated strings.
#[allow(async_fn_in_trait)]
pub trait Engine {
    /// Allocate the node's underlying resources (namespace, bridge, cgroup).
    async fn create_node(&mut self, spec: &NodeSpec) -> Result<(), EngineError>;

    /// Allocate one link: veth pair, endpoint placement, addressing, port
    /// recording, and shaping.
    async fn create_link(&mut self, link: &ResolvedLink) -> Result<(), EngineError>;

    /// Bring every created interface and bridge up.
    async fn start(&mut self, topo: &Topology) -> Result<(), EngineError>;

    /// Release one link; succeeds if the link is already gone.
    async fn destroy_link(&mut self, link: &ResolvedLink) -> Result<(), EngineError>;

    /// Release one node; succeeds if the node is already gone.
    async fn destroy_node(&mut self, name: &str) -> Result<(), EngineError>;

    /// Run a blocking command inside a node and capture its output.
    async fn run(&self, node: &str, argv: &[&str]) -> Result<CmdOutput, EngineError>;

    /// Spawn a long-running process inside a node; the child is killed when
    /// its handle is dropped.
    async fn spawn(&self, node: &str, argv: &[&str]) -> Result<Child, EngineError>;

    /// The port number the kernel has recorded for an interface.
    async fn kernel_port(&self, node: &str, ifname: &str) -> Result<u16, EngineError>;
}
