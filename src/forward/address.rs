use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::num::ParseIntError;
use std::ops::RangeInclusive;
use std::str::FromStr;

use thiserror::Error;

use super::Error;

/// Transport protocol of a single listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// The set of protocols a mapping listens on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Protocols {
    #[default]
    Tcp,
    Udp,
    Both,
}

impl Protocols {
    pub fn iter(self) -> impl Iterator<Item = Protocol> {
        let protocols: &'static [Protocol] = match self {
            Self::Tcp => &[Protocol::Tcp],
            Self::Udp => &[Protocol::Udp],
            Self::Both => &[Protocol::Tcp, Protocol::Udp],
        };

        protocols.iter().copied()
    }
}

impl fmt::Display for Protocols {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
            Self::Both => f.write_str("tcp+udp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown protocol '{0}', expected 'tcp', 'udp' or 'both'")]
pub struct ParseProtocolsError(String);

impl FromStr for Protocols {
    type Err = ParseProtocolsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "both" => Ok(Self::Both),
            x => Err(ParseProtocolsError(x.to_owned())),
        }
    }
}

/// A local port or an inclusive range of local ports.
///
/// Never contains port 0 and `start <= end` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalSpec {
    start: u16,
    end: u16,
}

impl LocalSpec {
    pub fn new(start: u16, end: u16) -> Result<Self, ParseLocalSpecError> {
        if start == 0 || end == 0 {
            return Err(ParseLocalSpecError::ZeroPort);
        }

        if start > end {
            return Err(ParseLocalSpecError::Reversed { start, end });
        }

        Ok(Self { start, end })
    }

    pub(crate) fn from_port(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    pub fn is_single(&self) -> bool {
        self.start == self.end
    }

    pub fn ports(&self) -> RangeInclusive<u16> {
        self.start..=self.end
    }

    pub fn contains(&self, port: u16) -> bool {
        self.ports().contains(&port)
    }

    /// Pairs every local port with its target port, in ascending order.
    ///
    /// The target port advances in lockstep with the local port. Fails
    /// instead of wrapping when the last target port would exceed 65535.
    pub fn expand(&self, target: &Target) -> Result<Vec<(u16, u16)>, Error> {
        let last = u32::from(target.port) + u32::from(self.end - self.start);
        if last > u32::from(u16::MAX) {
            return Err(Error::PortRangeOverflow {
                local: *self,
                target: target.clone(),
            });
        }

        Ok(self
            .ports()
            .map(|port| (port, target.port + (port - self.start)))
            .collect())
    }
}

impl fmt::Display for LocalSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single() {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}/{}", self.start, self.end)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseLocalSpecError {
    #[error("expected a port")]
    ExpectedPort,

    #[error("'{0}' is not a port number")]
    NotNumeric(String),

    #[error("invalid port: {0}")]
    InvalidPort(ParseIntError),

    #[error("port 0 cannot be forwarded")]
    ZeroPort,

    #[error("range start {start} is greater than range end {end}")]
    Reversed { start: u16, end: u16 },
}

fn parse_port(s: &str) -> Result<u16, ParseLocalSpecError> {
    use ParseLocalSpecError::*;

    if s.is_empty() {
        return Err(ExpectedPort);
    }

    if !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(NotNumeric(s.to_owned()));
    }

    s.parse().map_err(InvalidPort)
}

impl FromStr for LocalSpec {
    type Err = ParseLocalSpecError;

    // Syntax: <port> | <port>/<port>
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            None => {
                let port = parse_port(s)?;
                Self::new(port, port)
            }

            Some((start, end)) => Self::new(parse_port(start)?, parse_port(end)?),
        }
    }
}

/// A remote endpoint connections are forwarded to.
///
/// The host is kept as text and resolved at dial time, so names follow DNS
/// changes for the lifetime of the mapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    host: String,
    port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn with_port(&self, port: u16) -> Self {
        Self::new(self.host.clone(), port)
    }

    pub async fn resolve(&self) -> io::Result<SocketAddr> {
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} did not resolve to any address", self.host),
                )
            })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseTargetError {
    #[error("missing ':' separator")]
    MissingSeparator,

    #[error("expected a host")]
    ExpectedHost,

    #[error("invalid host '{0}'")]
    InvalidHost(String),

    #[error("IPv6 addresses must be enclosed in '[' and ']'")]
    UnbracketedIpv6,

    #[error("expected a port")]
    ExpectedPort,

    #[error("'{0}' is not a port number")]
    NotNumeric(String),

    #[error("invalid port: {0}")]
    InvalidPort(ParseIntError),

    #[error("port 0 cannot be dialed")]
    ZeroPort,
}

impl FromStr for Target {
    type Err = ParseTargetError;

    // Syntax: <host>:<port> | [<ipv6>]:<port>
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use ParseTargetError::*;

        let (host, port) = s.rsplit_once(':').ok_or(MissingSeparator)?;

        let host = match host.strip_prefix('[') {
            Some(x) => x
                .strip_suffix(']')
                .ok_or_else(|| InvalidHost(host.to_owned()))?,
            None if host.contains(':') => return Err(UnbracketedIpv6),
            None => host,
        };

        if host.is_empty() {
            return Err(ExpectedHost);
        }

        if host.contains(|c: char| c.is_whitespace() || c == '[' || c == ']' || c == '/') {
            return Err(InvalidHost(host.to_owned()));
        }

        if port.is_empty() {
            return Err(ExpectedPort);
        }

        if !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(NotNumeric(port.to_owned()));
        }

        let port: u16 = port.parse().map_err(InvalidPort)?;
        if port == 0 {
            return Err(ZeroPort);
        }

        Ok(Self::new(host, port))
    }
}
