use std::fmt;

use super::Error;
use super::address::{LocalSpec, Protocol, Protocols, Target};
use super::connect::ConnectOpts;

/// A route from a local port, or a range of them, to a target.
#[derive(Debug, Clone, PartialEq)]
///
/// Only [`Mapping::new`] builds one, so the target range always fits in the
/// port space.
pub struct Mapping {
    local: LocalSpec,
    target: Target,
    protocols: Protocols,
    opts: ConnectOpts,
}

impl Mapping {
    /// Creates a TCP mapping with default dial options.
    ///
    /// Ranges whose target ports would run past 65535 are rejected here,
    /// before anything is bound.
    pub fn new(local: LocalSpec, target: Target) -> Result<Self, Error> {
        local.expand(&target)?;

        Ok(Self {
            local,
            target,
            protocols: Protocols::default(),
            opts: ConnectOpts::default(),
        })
    }

    pub fn parse(local: &str, target: &str) -> Result<Self, Error> {
        Self::new(local.parse()?, target.parse()?)
    }

    pub fn local(&self) -> LocalSpec {
        self.local
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn protocols(&self) -> Protocols {
        self.protocols
    }

    pub fn opts(&self) -> &ConnectOpts {
        &self.opts
    }

    pub fn with_protocols(mut self, protocols: Protocols) -> Self {
        self.protocols = protocols;
        self
    }

    pub fn with_opts(mut self, opts: ConnectOpts) -> Self {
        self.opts = opts;
        self
    }

    /// Expands the mapping into one route per local port and protocol.
    pub fn routes(&self) -> Result<Vec<ConcreteRoute>, Error> {
        let pairs = self.local.expand(&self.target)?;

        Ok(pairs
            .into_iter()
            .flat_map(|(port, target_port)| {
                self.protocols.iter().map(move |protocol| ConcreteRoute {
                    port,
                    target: self.target.with_port(target_port),
                    protocol,
                    opts: self.opts.clone(),
                })
            })
            .collect())
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> ", self.protocols, self.local)?;

        if self.local.is_single() {
            write!(f, "{}", self.target)
        } else {
            let span = self.local.end() - self.local.start();
            match self.target.port().checked_add(span) {
                Some(end) => write!(f, "{}-{end}", self.target),
                None => write!(f, "{}-?", self.target),
            }
        }
    }
}

/// One local port bound to one target for one protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcreteRoute {
    pub port: u16,
    pub target: Target,
    pub protocol: Protocol,
    pub opts: ConnectOpts,
}

impl ConcreteRoute {
    pub fn key(&self) -> (u16, Protocol) {
        (self.port, self.protocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_port_yields_one_route() {
        let mapping = Mapping::parse("10086", "127.0.0.1:10010").unwrap();
        let routes = mapping.routes().unwrap();

        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].key(), (10086, Protocol::Tcp));
        assert_eq!(routes[0].target, Target::new("127.0.0.1", 10010));
        assert_eq!(mapping.to_string(), "tcp 10086 -> 127.0.0.1:10010");
    }

    #[test]
    fn range_fans_out_per_protocol() {
        let mapping = Mapping::parse("9000/9002", "backend:9100")
            .unwrap()
            .with_protocols(Protocols::Both);
        let routes = mapping.routes().unwrap();

        let keys: Vec<_> = routes.iter().map(ConcreteRoute::key).collect();
        assert_eq!(
            keys,
            [
                (9000, Protocol::Tcp),
                (9000, Protocol::Udp),
                (9001, Protocol::Tcp),
                (9001, Protocol::Udp),
                (9002, Protocol::Tcp),
                (9002, Protocol::Udp),
            ]
        );

        for route in &routes {
            assert_eq!(route.target.host(), "backend");
            assert_eq!(route.target.port(), route.port + 100);
        }

        assert_eq!(mapping.to_string(), "tcp+udp 9000/9002 -> backend:9100-9102");
    }

    #[test]
    fn range_may_end_on_the_last_port() {
        let mapping = Mapping::parse("1000/1005", "backend:65530").unwrap();

        assert_eq!(mapping.local(), LocalSpec::new(1000, 1005).unwrap());
        assert_eq!(mapping.target(), &Target::new("backend", 65530));
        assert_eq!(mapping.routes().unwrap().last().unwrap().target.port(), 65535);
        assert_eq!(mapping.to_string(), "tcp 1000/1005 -> backend:65530-65535");
    }

    #[test]
    fn rejects_bad_input_before_expanding() {
        assert!(matches!(
            Mapping::parse("9002/9000", "127.0.0.1:1"),
            Err(Error::InvalidSpec(_))
        ));
        assert!(matches!(
            Mapping::parse("9000", "127.0.0.1"),
            Err(Error::InvalidTarget(_))
        ));
        assert!(matches!(
            Mapping::parse("9000/9010", "127.0.0.1:65530"),
            Err(Error::PortRangeOverflow { .. })
        ));
    }
}
