//! The configuration file.
//!
//! One directive per line, `#` starts a comment line:
//!
//! ```text
//! bind 0.0.0.0
//! udp-timeout 60
//! forward 10086 to 127.0.0.1:10010
//! forward 9000/9002 to backend:9100 proto both max-attempts 3
//! ```

use std::collections::HashSet;
use std::fmt;
use std::iter::Peekable;
use std::net::AddrParseError;
use std::num::ParseIntError;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use miniarg::split_args::SplitArgs;
use thiserror::Error;

use crate::forward::{ListenOpts, LocalSpec, Mapping};

mod forward;

pub use self::forward::ParseForwardError;

pub type ParseStream<'a> = Peekable<SplitArgs<'a>>;

pub trait Parse {
    type Output;
    type Error;

    fn parse(stream: &mut ParseStream<'_>) -> Result<Self::Output, Self::Error>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub listen: ListenOpts,
    pub forward: Vec<Mapping>,
}

impl Config {
    pub async fn read<P>(path: P) -> eyre::Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let data = tokio::fs::read_to_string(path).await?;
        let x = data.parse()?;
        Ok(x)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    ExpectedBindAddress,
    InvalidBindAddress(AddrParseError),
    ExpectedUdpTimeout,
    InvalidUdpTimeout(ParseIntError),
    Forward(ParseForwardError),
    DuplicateForward(LocalSpec),
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExpectedBindAddress => f.write_str("expected an address for 'bind'"),
            Self::InvalidBindAddress(x) => write!(f, "invalid bind address: {x}"),
            Self::ExpectedUdpTimeout => f.write_str("expected a timeout for 'udp-timeout'"),
            Self::InvalidUdpTimeout(x) => write!(f, "invalid udp timeout: {x}"),
            Self::Forward(x) => write!(f, "{x}"),
            Self::DuplicateForward(x) => write!(f, "port {x} is forwarded more than once"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {kind}")]
pub struct ParseError {
    line: usize,
    kind: ParseErrorKind,
}

impl ParseError {
    pub fn line(&self) -> usize {
        self.line
    }

    pub fn kind(&self) -> &ParseErrorKind {
        &self.kind
    }
}

impl FromStr for Config {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut listen = ListenOpts::default();
        let mut forward: Vec<Mapping> = Vec::new();
        let mut ports = HashSet::new();

        let lines = s
            .lines()
            .map(str::trim)
            .enumerate()
            .filter(|(_, line)| !line.is_empty())
            .filter(|(_, line)| !line.starts_with('#'));

        for (i, line) in lines {
            let parse_error =
                |kind: ParseErrorKind| -> ParseError { ParseError { line: i + 1, kind } };

            let mut stream = SplitArgs::new(line).peekable();

            let Some(directive) = stream.next() else {
                continue;
            };

            match directive {
                "bind" => {
                    listen.bind = stream
                        .next()
                        .ok_or(ParseErrorKind::ExpectedBindAddress)
                        .map_err(parse_error)?
                        .parse()
                        .map_err(ParseErrorKind::InvalidBindAddress)
                        .map_err(parse_error)?;
                }

                "udp-timeout" => {
                    listen.udp_timeout = stream
                        .next()
                        .ok_or(ParseErrorKind::ExpectedUdpTimeout)
                        .map_err(parse_error)?
                        .parse()
                        .map(Duration::from_secs)
                        .map_err(ParseErrorKind::InvalidUdpTimeout)
                        .map_err(parse_error)?;
                }

                "forward" => {
                    let x = <Mapping as Parse>::parse(&mut stream)
                        .map_err(ParseErrorKind::Forward)
                        .map_err(parse_error)?;

                    // a port belongs to one mapping, whatever its protocols
                    let local = x.local();
                    if !local.ports().all(|port| ports.insert(port)) {
                        return Err(parse_error(ParseErrorKind::DuplicateForward(local)));
                    }

                    forward.push(x);
                }

                x => {
                    warn!("skipping unknown directive '{x}'")
                }
            }
        }

        Ok(Self { listen, forward })
    }
}
