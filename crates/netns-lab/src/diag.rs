//! Diagnostics against a running session
//!
//! Three kinds of checks: blocking sweeps across node pairs (ping, iperf),
//! port-number validation against the kernel record, and a concurrent
//! monitor that multiplexes the output of one long-running process per
//! node. Diagnostic mismatches are warnings, never errors; the caller
//! decides what to make of them.

use crate::engine::Engine;
use crate::session::{Session, SessionError};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use topology::Topology;
use tracing::{debug, warn};

/// Outcome of one src -> dst connectivity check.
#[derive(Clone, Debug, Serialize)]
pub struct PingCheck {
    pub src: String,
    pub dst: String,
    pub ok: bool,
}

/// Tabulated result of a full connectivity sweep.
#[derive(Clone, Debug, Default, Serialize)]
pub struct PingReport {
    pub checks: Vec<PingCheck>,
}

impl PingReport {
    pub fn sent(&self) -> usize {
        self.checks.len()
    }

    pub fn received(&self) -> usize {
        self.checks.iter().filter(|c| c.ok).count()
    }

    pub fn dropped_pct(&self) -> f64 {
        if self.checks.is_empty() {
            return 0.0;
        }
        100.0 * (self.sent() - self.received()) as f64 / self.sent() as f64
    }

    pub fn all_ok(&self) -> bool {
        self.received() == self.sent()
    }
}

impl fmt::Display for PingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut current: Option<&str> = None;
        for check in &self.checks {
            if current != Some(check.src.as_str()) {
                if current.is_some() {
                    writeln!(f)?;
                }
                write!(f, "{} ->", check.src)?;
                current = Some(check.src.as_str());
            }
            if check.ok {
                write!(f, " {}", check.dst)?;
            } else {
                write!(f, " X")?;
            }
        }
        if current.is_some() {
            writeln!(f)?;
        }
        write!(
            f,
            "*** Results: {:.0}% dropped ({}/{} received)",
            self.dropped_pct(),
            self.received(),
            self.sent()
        )
    }
}

/// Ping every ordered host pair once.
///
/// A topology with N hosts produces N*(N-1) checks; with no lossy links
/// every one of them should succeed.
pub async fn ping_all<E: Engine>(session: &Session<E>) -> Result<PingReport, SessionError> {
    let hosts = session.hosts();
    let mut report = PingReport::default();

    for src in &hosts {
        for dst in &hosts {
            if src == dst {
                continue;
            }
            let addr = session
                .topology()
                .host_addr(dst)
                .ok_or_else(|| SessionError::UnknownNode(dst.clone()))?
                .to_string();
            let output = session.run(src, &["ping", "-c", "1", "-W", "1", &addr]).await?;
            let ok = output.success();
            if !ok {
                debug!("ping {} -> {} failed", src, dst);
            }
            report.checks.push(PingCheck {
                src: src.clone(),
                dst: dst.clone(),
                ok,
            });
        }
    }
    Ok(report)
}

/// Result of a UDP bandwidth test between two hosts.
#[derive(Clone, Debug, Serialize)]
pub struct IperfResult {
    /// Bandwidth the client reports, e.g. "8.10 Mbits/sec"
    pub client: Option<String>,
    /// Bandwidth the server reports
    pub server: Option<String>,
}

/// Run a UDP iperf between two hosts: server on `server`, client on
/// `client` offering `target_kbps` for `secs` seconds.
pub async fn iperf_udp<E: Engine>(
    session: &Session<E>,
    client: &str,
    server: &str,
    target_kbps: u32,
    secs: u32,
) -> Result<IperfResult, SessionError> {
    let addr = session
        .topology()
        .host_addr(server)
        .ok_or_else(|| SessionError::UnknownNode(server.to_string()))?
        .to_string();

    let mut srv = session.spawn(server, &["iperf", "-u", "-s"]).await?;
    // Give the server a moment to bind before offering traffic
    tokio::time::sleep(Duration::from_millis(300)).await;

    let bandwidth = format!("{}K", target_kbps);
    let duration = secs.to_string();
    let output = session
        .run(
            client,
            &["iperf", "-u", "-c", &addr, "-b", &bandwidth, "-t", &duration],
        )
        .await?;
    let client_bw = parse_bandwidth(&output.stdout);

    // The server prints its summary shortly after the client stops
    // offering traffic; drain its stdout until the bandwidth line arrives
    // or the grace period runs out, then kill it.
    let mut server_text = String::new();
    if let Some(stdout) = srv.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        let grace = tokio::time::sleep(Duration::from_secs(5));
        tokio::pin!(grace);
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let done = line.contains("bits/sec");
                        server_text.push_str(&line);
                        server_text.push('\n');
                        if done {
                            break;
                        }
                    }
                    Ok(None) | Err(_) => break,
                },
                _ = &mut grace => {
                    warn!("iperf server on {} produced no summary in time", server);
                    break;
                }
            }
        }
    }
    let _ = srv.start_kill();
    let _ = srv.wait().await;
    let server_bw = parse_bandwidth(&server_text);

    Ok(IperfResult {
        client: client_bw,
        server: server_bw,
    })
}

/// Last `<number> <unit>bits/sec` figure in an iperf transcript.
pub fn parse_bandwidth(output: &str) -> Option<String> {
    let tokens: Vec<&str> = output.split_whitespace().collect();
    tokens
        .windows(2)
        .rev()
        .find(|w| w[1].ends_with("bits/sec") && w[0].parse::<f64>().is_ok())
        .map(|w| format!("{} {}", w[0], w[1]))
}

/// One port's validation outcome.
#[derive(Clone, Debug, Serialize)]
pub struct PortCheck {
    pub port: u16,
    pub ifname: String,
    /// What the kernel reported; None if the lookup itself failed
    pub kernel: Option<u16>,
}

impl PortCheck {
    pub fn ok(&self) -> bool {
        self.kernel == Some(self.port)
    }
}

/// Compare one logical port against the kernel record.
///
/// A mismatch is logged as a warning and returned as `false`; it is up to
/// the caller whether that fails anything.
pub async fn validate_port<E: Engine>(
    session: &Session<E>,
    node: &str,
    port: u16,
) -> Result<bool, SessionError> {
    let kernel = session.kernel_port(node, port).await?;
    if kernel != port {
        warn!(
            "WARNING: kernel port for {} port {} is actually {}",
            node, port, kernel
        );
        return Ok(false);
    }
    Ok(true)
}

/// Validate every port of one node. Lookup failures are reported in the
/// corresponding [`PortCheck`] and do not abort the sweep.
pub async fn validate_ports<E: Engine>(
    session: &Session<E>,
    node: &str,
) -> Result<Vec<PortCheck>, SessionError> {
    let mut checks = Vec::new();
    for (port, ifname) in session.topology().ports(node) {
        let kernel = match session.kernel_port(node, port).await {
            Ok(k) => Some(k),
            Err(e) => {
                warn!("Port lookup failed for {} ({}): {}", ifname, node, e);
                None
            }
        };
        let check = PortCheck {
            port,
            ifname,
            kernel,
        };
        if !check.ok() {
            warn!(
                "WARNING: kernel port for {} is actually {:?}, expected {}",
                check.ifname, check.kernel, check.port
            );
        }
        checks.push(check);
    }
    Ok(checks)
}

/// `host local-if:peer-if ...` listing for every host.
pub fn dump_connections(topo: &Topology) -> String {
    let mut out = String::new();
    for host in topo.hosts() {
        out.push_str(&host.name);
        for (local, peer) in topo.connections(&host.name) {
            out.push_str(&format!(" {}:{}", local, peer));
        }
        out.push('\n');
    }
    out
}

/// One line of output from a monitored node process.
#[derive(Clone, Debug, PartialEq)]
pub struct MonitorEvent {
    pub node: String,
    pub line: String,
}

/// Multiplexed monitor over one subprocess per node.
///
/// Lines arrive interleaved by emission time across nodes; within one node
/// their order is preserved. The stream is finite: [`Monitor::next`]
/// returns `None` once every subprocess has exited and its output has been
/// drained. Dropping the monitor cancels the readers and kills any
/// children still running, so an abandoned pass leaves no orphans.
pub struct Monitor {
    rx: mpsc::Receiver<MonitorEvent>,
    readers: Vec<JoinHandle<()>>,
}

impl Monitor {
    /// Spawn `argv` on each named node and monitor the spawned processes.
    pub async fn spawn<E: Engine>(
        session: &Session<E>,
        commands: &[(String, Vec<String>)],
    ) -> Result<Self, SessionError> {
        let mut children = Vec::with_capacity(commands.len());
        for (node, argv) in commands {
            let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
            let child = session.spawn(node, &argv).await?;
            children.push((node.clone(), child));
        }
        Ok(Self::from_children(children))
    }

    /// Monitor already-spawned children (stdout must be piped).
    pub fn from_children(children: Vec<(String, Child)>) -> Self {
        let (tx, rx) = mpsc::channel(1024);
        let mut readers = Vec::with_capacity(children.len());

        for (node, mut child) in children {
            let tx = tx.clone();
            readers.push(tokio::spawn(async move {
                let Some(stdout) = child.stdout.take() else {
                    warn!("Monitor: no stdout pipe for {}", node);
                    return;
                };
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            let event = MonitorEvent {
                                node: node.clone(),
                                line,
                            };
                            // Receiver gone: the pass was cancelled
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("Monitor: read error on {}: {}", node, e);
                            break;
                        }
                    }
                }
                // Reap the child so no zombie outlives the pass
                let _ = child.wait().await;
            }));
        }

        // Only reader tasks hold senders; the channel closes when the last
        // child's output is drained
        drop(tx);
        Self { rx, readers }
    }

    /// Next (node, line) pair, or `None` when all subprocesses have exited.
    pub async fn next(&mut self) -> Option<MonitorEvent> {
        self.rx.recv().await
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}
