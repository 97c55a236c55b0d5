//! Line-oriented operator console.

use anyhow::{anyhow, bail, Result};
use peertalk_network::{Endpoint, PeerDescriptor};
use std::net::{IpAddr, SocketAddr};

/// A parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Quit,
    Peers,
    Metrics,
    Ping(Endpoint),
    Boot { to: Endpoint, count: usize },
    Send { to: Endpoint, text: String },
}

pub const DEFAULT_BOOT_COUNT: usize = 16;

pub const HELP: &str = "commands: ping <addr> | boot <addr> [count] | peers | metrics | <addr> <text> | quit";

/// Parse one line of operator input. Blank lines yield `None`.
pub fn parse_line(line: &str, default_port: u16) -> Result<Option<ConsoleCommand>> {
    let mut words = line.split_whitespace();
    let Some(first) = words.next() else {
        return Ok(None);
    };

    let command = match first.to_ascii_lowercase().as_str() {
        "quit" | "exit" => ConsoleCommand::Quit,
        "peers" => ConsoleCommand::Peers,
        "metrics" => ConsoleCommand::Metrics,
        "ping" => {
            let to = words.next().ok_or_else(|| anyhow!("usage: ping <addr>"))?;
            ConsoleCommand::Ping(parse_endpoint(to, default_port)?)
        }
        "boot" => {
            let to = words
                .next()
                .ok_or_else(|| anyhow!("usage: boot <addr> [count]"))?;
            let count = match words.next() {
                Some(raw) => raw
                    .parse()
                    .map_err(|_| anyhow!("invalid peer count {:?}", raw))?,
                None => DEFAULT_BOOT_COUNT,
            };
            ConsoleCommand::Boot {
                to: parse_endpoint(to, default_port)?,
                count,
            }
        }
        _ => {
            let text = words.collect::<Vec<_>>().join(" ");
            if text.is_empty() {
                bail!("{}", HELP);
            }
            ConsoleCommand::Send {
                to: parse_endpoint(first, default_port)?,
                text,
            }
        }
    };
    Ok(Some(command))
}

/// Parse `host`, `host:port`, `ip` or `[ipv6]:port` into an endpoint.
pub fn parse_endpoint(raw: &str, default_port: u16) -> Result<Endpoint> {
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Ok(Endpoint::from(addr));
    }
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Ok(Endpoint::new(ip.to_string(), default_port));
    }

    let descriptor = match raw.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => PeerDescriptor::new(host, port),
        _ => PeerDescriptor::address(raw),
    };
    Endpoint::normalize(&descriptor, default_port).map_err(|err| anyhow!("{}: {}", raw, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint_forms() {
        assert_eq!(
            parse_endpoint("127.0.0.1:9000", 4305).unwrap(),
            Endpoint::new("127.0.0.1", 9000)
        );
        assert_eq!(
            parse_endpoint("2001:db8::1", 4305).unwrap(),
            Endpoint::new("2001:db8::1", 4305)
        );
        assert_eq!(
            parse_endpoint("[2001:db8::1]:7000", 4305).unwrap(),
            Endpoint::new("2001:db8::1", 7000)
        );
        assert_eq!(
            parse_endpoint("seed.example.org", 4305).unwrap(),
            Endpoint::new("seed.example.org", 4305)
        );
        assert_eq!(
            parse_endpoint("seed.example.org:4400", 4305).unwrap(),
            Endpoint::new("seed.example.org", 4400)
        );
        assert!(parse_endpoint(":4400", 4305).is_err());
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_line("   ", 4305).unwrap(), None);
        assert_eq!(parse_line("QUIT now", 4305).unwrap(), Some(ConsoleCommand::Quit));
        assert_eq!(parse_line("peers", 4305).unwrap(), Some(ConsoleCommand::Peers));
        assert_eq!(
            parse_line("ping 10.0.0.1", 4305).unwrap(),
            Some(ConsoleCommand::Ping(Endpoint::new("10.0.0.1", 4305)))
        );
        assert_eq!(
            parse_line("boot 10.0.0.1:5000 4", 4305).unwrap(),
            Some(ConsoleCommand::Boot {
                to: Endpoint::new("10.0.0.1", 5000),
                count: 4
            })
        );
        assert_eq!(
            parse_line("boot 10.0.0.1", 4305).unwrap(),
            Some(ConsoleCommand::Boot {
                to: Endpoint::new("10.0.0.1", 4305),
                count: DEFAULT_BOOT_COUNT
            })
        );
        assert_eq!(
            parse_line("10.0.0.2 hello there", 4305).unwrap(),
            Some(ConsoleCommand::Send {
                to: Endpoint::new("10.0.0.2", 4305),
                text: "hello there".to_string()
            })
        );
    }

    #[test]
    fn test_parse_rejects_incomplete_lines() {
        assert!(parse_line("ping", 4305).is_err());
        assert!(parse_line("boot 10.0.0.1 many", 4305).is_err());
        assert!(parse_line("10.0.0.2", 4305).is_err());
    }
}
