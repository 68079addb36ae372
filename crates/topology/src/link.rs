//! Link definitions and quality parameters

use serde::{Deserialize, Serialize};

/// Link quality parameters applied to both veth endpoints.
///
/// All fields are optional; a link with no parameters is unshaped.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkParams {
    /// Bandwidth cap in kilobits per second
    pub rate_kbps: Option<u32>,
    /// One-way added delay in milliseconds
    pub delay_ms: Option<u32>,
    /// Random packet loss percentage (0.0-100.0)
    pub loss_pct: Option<f32>,
    /// Use a hierarchical token bucket for the rate cap instead of TBF
    pub use_htb: bool,
}

impl LinkParams {
    pub fn is_unshaped(&self) -> bool {
        self.rate_kbps.is_none() && self.delay_ms.is_none() && self.loss_pct.is_none()
    }

    /// True when the link can drop packets.
    pub fn is_lossy(&self) -> bool {
        self.loss_pct.map(|l| l > 0.0).unwrap_or(false)
    }
}

/// A link as declared by the user: ports may be implicit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinkDef {
    pub a: String,
    pub b: String,
    /// Explicit port on `a`, or None to auto-assign
    pub port_a: Option<u16>,
    /// Explicit port on `b`, or None to auto-assign
    pub port_b: Option<u16>,
    pub params: LinkParams,
}

/// A link after validation: every endpoint has a concrete port.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolvedLink {
    pub a: String,
    pub b: String,
    pub port_a: u16,
    pub port_b: u16,
    pub params: LinkParams,
}

impl ResolvedLink {
    /// Interface name of the `a`-side endpoint.
    pub fn ifname_a(&self) -> String {
        crate::ifname(&self.a, self.port_a)
    }

    /// Interface name of the `b`-side endpoint.
    pub fn ifname_b(&self) -> String {
        crate::ifname(&self.b, self.port_b)
    }
}
