use std::num::{NonZero, ParseFloatError, ParseIntError};
use std::time::Duration;

use thiserror::Error;

use crate::forward::address::{ParseLocalSpecError, ParseProtocolsError, ParseTargetError};
use crate::forward::{ConnectOpts, LocalSpec, Mapping, Protocols, Target};

use super::{Parse, ParseStream};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseForwardError {
    #[error("expected local port")]
    ExpectedLocal,

    #[error("invalid local port: {0}")]
    InvalidLocal(ParseLocalSpecError),

    #[error("expected literal 'to'")]
    ExpectedTo,

    #[error("expected target address")]
    ExpectedTarget,

    #[error("invalid target address: {0}")]
    InvalidTarget(ParseTargetError),

    #[error("target port range runs past 65535")]
    PortRangeOverflow,

    #[error("expected a protocol for 'proto'")]
    ExpectedProto,

    #[error("{0}")]
    InvalidProto(ParseProtocolsError),

    #[error("expected a timeout for 'connect-timeout'")]
    ExpectedConnectTimeout,

    #[error("invalid connect timeout: {0}")]
    InvalidConnectTimeout(ParseIntError),

    #[error("expected a number for 'max-attempts'")]
    ExpectedMaxAttempts,

    #[error("invalid max attempts: {0}")]
    InvalidMaxAttempts(ParseIntError),

    #[error("expected a delay for 'retry-delay'")]
    ExpectedRetryDelay,

    #[error("invalid retry delay: {0}")]
    InvalidRetryDelay(ParseIntError),

    #[error("expected 'retry-factor'")]
    ExpectedRetryFactor,

    #[error("invalid retry factor: {0}")]
    InvalidRetryFactor(ParseFloatError),

    #[error("'retry-factor' must be a finite number of at least 1")]
    RetryFactorOutOfRange,
}

impl Parse for Mapping {
    type Output = Self;
    type Error = ParseForwardError;

    // Syntax: forward <port>[/<port>] to <host>:<port> [proto tcp|udp|both]
    //         [connect-timeout <secs>] [max-attempts <n>] [retry-delay <secs>]
    //         [retry-factor <float>]
    fn parse(stream: &mut ParseStream<'_>) -> Result<Self::Output, Self::Error> {
        use ParseForwardError::*;

        let local: LocalSpec = stream
            .next()
            .ok_or(ExpectedLocal)?
            .parse()
            .map_err(InvalidLocal)?;

        {
            let to = stream.next().ok_or(ExpectedTo)?;
            if to != "to" {
                return Err(ExpectedTo);
            }
        }

        let target: Target = stream
            .next()
            .ok_or(ExpectedTarget)?
            .parse()
            .map_err(InvalidTarget)?;

        let mut protocols = Protocols::default();
        let mut opts = ConnectOpts::default();
        let mut max_attempts = u32::from(opts.max_attempts);

        while let Some(x) = stream.next() {
            match x {
                "proto" => {
                    protocols = stream
                        .next()
                        .ok_or(ExpectedProto)?
                        .parse()
                        .map_err(InvalidProto)?;
                }

                "connect-timeout" => {
                    opts.timeout = stream
                        .next()
                        .ok_or(ExpectedConnectTimeout)?
                        .parse()
                        .map_err(InvalidConnectTimeout)
                        .map(Duration::from_secs)?;
                }

                "max-attempts" => {
                    max_attempts = stream
                        .next()
                        .ok_or(ExpectedMaxAttempts)?
                        .parse()
                        .map_err(InvalidMaxAttempts)?;
                }

                "retry-delay" => {
                    opts.retry_delay = stream
                        .next()
                        .ok_or(ExpectedRetryDelay)?
                        .parse()
                        .map_err(InvalidRetryDelay)
                        .map(Duration::from_secs)?;
                }

                "retry-factor" => {
                    opts.retry_factor = stream
                        .next()
                        .ok_or(ExpectedRetryFactor)?
                        .parse()
                        .map_err(InvalidRetryFactor)?;

                    if !opts.retry_factor.is_finite() || opts.retry_factor < 1.0 {
                        return Err(RetryFactorOutOfRange);
                    }
                }

                _ => {
                    warn!("ignoring unknown property '{x}'");
                }
            }
        }

        opts.max_attempts = match NonZero::new(max_attempts) {
            Some(x) => x,
            None => {
                warn!(
                    "{}: 'max-attempts' cannot be 0, will try to connect at least once",
                    display!(local)
                );
                NonZero::<u32>::MIN
            }
        };

        let mapping = Mapping::new(local, target).map_err(|_| PortRangeOverflow)?;

        Ok(mapping.with_protocols(protocols).with_opts(opts))
    }
}
