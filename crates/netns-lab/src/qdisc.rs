//! Traffic control (qdisc) command construction
//!
//! Builds `tc` argument lists for link shaping: netem for delay and loss,
//! with a TBF or HTB parent when a bandwidth cap is requested. Commands are
//! constructed as argv lists and executed inside the endpoint's namespace by
//! the backend; nothing here shells out or interpolates strings.

use thiserror::Error;
use topology::LinkParams;

#[derive(Error, Debug, PartialEq)]
pub enum QdiscError {
    #[error("Invalid qdisc configuration: {0}")]
    InvalidConfig(String),
}

/// `tc` invocations (program name excluded) that shape one interface.
///
/// An unshaped link yields no commands. With a rate cap the limiter becomes
/// the root qdisc and netem attaches as its child, mirroring how a token
/// bucket must sit above netem for the cap to hold under added delay.
pub fn shape_commands(ifname: &str, params: &LinkParams) -> Result<Vec<Vec<String>>, QdiscError> {
    validate(params)?;

    if params.is_unshaped() {
        return Ok(Vec::new());
    }

    let mut commands = Vec::new();
    let rate_limited = params.rate_kbps.is_some();

    if let Some(rate_kbps) = params.rate_kbps {
        let rate = format!("{}kbit", rate_kbps.max(1));
        if params.use_htb {
            commands.push(argv(&[
                "qdisc", "add", "dev", ifname, "root", "handle", "1:", "htb", "default", "1",
            ]));
            commands.push(argv(&[
                "class", "add", "dev", ifname, "parent", "1:", "classid", "1:1", "htb", "rate",
                &rate, "ceil", &rate, "burst", "15k",
            ]));
        } else {
            commands.push(argv(&[
                "qdisc", "add", "dev", ifname, "root", "handle", "1:", "tbf", "rate", &rate,
                "burst", "32kb", "latency", "50ms",
            ]));
        }
    }

    let mut netem: Vec<String> = Vec::new();
    if let Some(delay_ms) = params.delay_ms {
        netem.push("delay".into());
        netem.push(format!("{}ms", delay_ms));
    }
    if let Some(loss_pct) = params.loss_pct {
        if loss_pct > 0.0 {
            netem.push("loss".into());
            netem.push(format!("{}%", loss_pct));
        }
    }

    if !netem.is_empty() {
        let mut cmd = if rate_limited {
            argv(&[
                "qdisc", "add", "dev", ifname, "parent", "1:1", "handle", "10:", "netem",
            ])
        } else {
            argv(&["qdisc", "add", "dev", ifname, "root", "handle", "10:", "netem"])
        };
        cmd.extend(netem);
        commands.push(cmd);
    }

    Ok(commands)
}

/// `tc` invocation removing any shaping from an interface.
pub fn clear_command(ifname: &str) -> Vec<String> {
    argv(&["qdisc", "del", "dev", ifname, "root"])
}

fn validate(params: &LinkParams) -> Result<(), QdiscError> {
    if let Some(loss) = params.loss_pct {
        if !(0.0..=100.0).contains(&loss) {
            return Err(QdiscError::InvalidConfig(format!(
                "loss percentage {} out of range 0-100",
                loss
            )));
        }
    }
    if params.rate_kbps == Some(0) {
        return Err(QdiscError::InvalidConfig(
            "rate limit of 0 kbps would black-hole the link".to_string(),
        ));
    }
    Ok(())
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unshaped_link_needs_no_commands() {
        let commands = shape_commands("h1-eth1", &LinkParams::default()).unwrap();
        assert!(commands.is_empty());
    }

    #[test]
    fn test_tbf_with_netem_child() {
        let params = LinkParams {
            rate_kbps: Some(10_000),
            delay_ms: Some(5),
            loss_pct: Some(10.0),
            use_htb: false,
        };
        let commands = shape_commands("h1-eth1", &params).unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(
            commands[0],
            argv(&[
                "qdisc", "add", "dev", "h1-eth1", "root", "handle", "1:", "tbf", "rate",
                "10000kbit", "burst", "32kb", "latency", "50ms",
            ])
        );
        assert_eq!(
            commands[1],
            argv(&[
                "qdisc", "add", "dev", "h1-eth1", "parent", "1:1", "handle", "10:", "netem",
                "delay", "5ms", "loss", "10%",
            ])
        );
    }

    #[test]
    fn test_htb_variant() {
        let params = LinkParams {
            rate_kbps: Some(10_000),
            delay_ms: Some(5),
            loss_pct: None,
            use_htb: true,
        };
        let commands = shape_commands("s1-eth1", &params).unwrap();
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0][7], "htb");
        assert_eq!(commands[1][0], "class");
        assert!(commands[2].contains(&"netem".to_string()));
    }

    #[test]
    fn test_netem_only_is_root() {
        let params = LinkParams {
            rate_kbps: None,
            delay_ms: Some(20),
            loss_pct: None,
            use_htb: false,
        };
        let commands = shape_commands("h1-eth1", &params).unwrap();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].contains(&"root".to_string()));
        assert!(commands[0].contains(&"netem".to_string()));
    }

    #[test]
    fn test_zero_loss_omitted() {
        let params = LinkParams {
            rate_kbps: None,
            delay_ms: Some(5),
            loss_pct: Some(0.0),
            use_htb: true,
        };
        let commands = shape_commands("h1-eth1", &params).unwrap();
        assert_eq!(commands.len(), 1);
        assert!(!commands[0].contains(&"loss".to_string()));
    }

    #[test]
    fn test_invalid_loss_rejected() {
        let params = LinkParams {
            loss_pct: Some(150.0),
            ..Default::default()
        };
        assert!(matches!(
            shape_commands("h1-eth1", &params),
            Err(QdiscError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_zero_rate_rejected() {
        let params = LinkParams {
            rate_kbps: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            shape_commands("h1-eth1", &params),
            Err(QdiscError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_clear_command() {
        assert_eq!(
            clear_command("h1-eth1"),
            argv(&["qdisc", "del", "dev", "h1-eth1", "root"])
        );
    }
}
