use std::fmt;
use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use super::address::{LocalSpec, ParseLocalSpecError, ParseTargetError, Protocol, Target};

/// Errors reported to whoever adds, updates or queries mappings.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid local port spec: {0}")]
    InvalidSpec(#[from] ParseLocalSpecError),

    #[error("invalid target: {0}")]
    InvalidTarget(#[from] ParseTargetError),

    #[error("forwarding {local} to {target} runs past port 65535")]
    PortRangeOverflow { local: LocalSpec, target: Target },

    #[error("{protocol} port {port} is already mapped")]
    AlreadyMapped { port: u16, protocol: Protocol },

    #[error("failed to bind {protocol} listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        protocol: Protocol,
        source: io::Error,
    },

    #[error("{0} is not mapped")]
    NotFound(LocalSpec),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to target.
    Outbound,
    /// Target to client.
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Outbound => f.write_str("client -> target"),
            Self::Inbound => f.write_str("target -> client"),
        }
    }
}

/// Failure of a single forwarded connection or flow.
///
/// These never leave the task serving the connection; they end up in the log.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("cannot connect to {target}: {source}")]
    Dial { target: Target, source: io::Error },

    #[error("relay error ({direction}): {source}")]
    Relay {
        direction: Direction,
        source: io::Error,
    },
}
