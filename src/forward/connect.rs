use std::io;
use std::num::NonZero;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use super::address::Target;

/// How a target is dialed for every accepted connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOpts {
    pub timeout: Duration,
    pub max_attempts: NonZero<u32>,
    pub retry_delay: Duration,
    pub retry_factor: f64,
}

impl Default for ConnectOpts {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_attempts: NonZero::<u32>::MIN,
            retry_delay: Duration::from_secs(1),
            retry_factor: 2.0,
        }
    }
}

async fn try_connect(target: &Target, limit: Duration) -> io::Result<TcpStream> {
    match timeout(limit, TcpStream::connect((target.host(), target.port()))).await {
        Ok(x) => x,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no answer within {limit:?}"),
        )),
    }
}

/// Dials `target`, retrying with a growing delay until the attempts run out.
///
/// The error of the last attempt is returned.
pub async fn connect(target: &Target, opts: &ConnectOpts) -> io::Result<TcpStream> {
    let mut attempts = 0;
    let mut delay = opts.retry_delay;

    loop {
        attempts += 1;

        match try_connect(target, opts.timeout).await {
            Ok(s) => return Ok(s),
            Err(e) if attempts >= opts.max_attempts.get() => return Err(e),
            Err(e) => {
                debug!(
                    "attempt {attempts}/{} failed: {}, retrying in {}",
                    opts.max_attempts,
                    display!(e),
                    display!(delay)
                );

                sleep(delay).await;
                delay = Duration::try_from_secs_f64(delay.as_secs_f64() * opts.retry_factor)
                    .unwrap_or(delay);
            }
        }
    }
}
