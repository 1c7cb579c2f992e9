//! IP allow masks.
//!
//! A mask is `all`, `localhost`, or four dot-separated parts, each `*` (any
//! octet), `=` (same octet as the local address) or a literal octet.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid allow mask '{mask}': {reason}")]
    InvalidMask { mask: String, reason: String },

    #[error("output directory '{0}' does not exist")]
    MissingOutDir(String),

    #[error("output path '{0}' is not a directory")]
    NotADirectory(String),
}

/// One octet position of a dotted mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Part {
    Any,
    SameAsLocal,
    Exact(u8),
}

/// One parsed `--allow` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpMask {
    All,
    Localhost,
    Dotted([Part; 4]),
}

impl FromStr for IpMask {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidMask {
            mask: s.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        if trimmed.eq_ignore_ascii_case("localhost") {
            return Ok(Self::Localhost);
        }

        let fields: Vec<&str> = trimmed.split('.').collect();
        if fields.len() != 4 {
            return Err(invalid("expected 4 dot-separated parts"));
        }
        let mut parts = [Part::Any; 4];
        for (slot, field) in parts.iter_mut().zip(fields) {
            *slot = match field {
                "*" => Part::Any,
                "=" => Part::SameAsLocal,
                literal => {
                    let not_octet = || invalid(&format!("'{}' is not *, = or 0-255", literal));
                    // u8::from_str also takes a leading '+'
                    if !literal.bytes().all(|b| b.is_ascii_digit()) {
                        return Err(not_octet());
                    }
                    Part::Exact(literal.parse().map_err(|_| not_octet())?)
                }
            };
        }
        Ok(Self::Dotted(parts))
    }
}

impl fmt::Display for IpMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Localhost => write!(f, "localhost"),
            Self::Dotted(parts) => {
                let text: Vec<String> = parts
                    .iter()
                    .map(|p| match p {
                        Part::Any => "*".to_string(),
                        Part::SameAsLocal => "=".to_string(),
                        Part::Exact(v) => v.to_string(),
                    })
                    .collect();
                write!(f, "{}", text.join("."))
            }
        }
    }
}

impl IpMask {
    pub fn matches(&self, local: Option<IpAddr>, remote: Option<IpAddr>) -> bool {
        match self {
            Self::All => true,
            Self::Localhost => remote.is_some_and(is_loopback),
            Self::Dotted(parts) => {
                let Some(remote) = remote.and_then(as_v4) else {
                    return false;
                };
                let local = local.and_then(as_v4);
                parts
                    .iter()
                    .zip(remote.octets())
                    .enumerate()
                    .all(|(i, (part, octet))| match part {
                        Part::Any => true,
                        Part::Exact(v) => *v == octet,
                        Part::SameAsLocal => local.is_some_and(|l| l.octets()[i] == octet),
                    })
            }
        }
    }
}

fn as_v4(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

fn is_loopback(ip: IpAddr) -> bool {
    ip.is_loopback() || as_v4(ip).is_some_and(|v4| v4.is_loopback())
}

/// `a.b.c.d`, `a.b.c.d:port` or `[v6]:port`.
fn parse_addr(text: &str) -> Option<IpAddr> {
    text.parse::<SocketAddr>()
        .map(|sa| sa.ip())
        .or_else(|_| text.parse::<IpAddr>())
        .ok()
}

/// Set of masks; a connection is admitted if any of them matches.
#[derive(Debug, Clone, Default)]
pub struct IpAllow {
    masks: Vec<IpMask>,
}

impl IpAllow {
    /// Parse every mask. Duplicates are dropped; no masks admits everyone.
    pub fn parse<I, S>(masks: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed: Vec<IpMask> = Vec::new();
        for mask in masks {
            let mask: IpMask = mask.as_ref().parse()?;
            if !parsed.contains(&mask) {
                parsed.push(mask);
            }
        }
        Ok(Self { masks: parsed })
    }

    pub fn masks(&self) -> &[IpMask] {
        &self.masks
    }

    /// Check textual addresses, which may carry a port.
    pub fn allows(&self, local: &str, remote: &str) -> bool {
        self.allows_ip(parse_addr(local), parse_addr(remote))
    }

    pub fn allows_ip(&self, local: Option<IpAddr>, remote: Option<IpAddr>) -> bool {
        self.masks.is_empty() || self.masks.iter().any(|m| m.matches(local, remote))
    }
}
