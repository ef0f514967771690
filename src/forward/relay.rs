use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use super::error::{ConnectionError, Direction};

/// Largest payload a single UDP datagram can carry.
pub const MAX_DATAGRAM: usize = 65535;

/// Bytes moved by a relay, seen from the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transfer {
    pub sent: u64,
    pub received: u64,
}

enum Pipe {
    Done(u64),
    Aborted,
}

async fn pipe<R, W>(mut reader: R, mut writer: W, abort: CancellationToken) -> io::Result<Pipe>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::select! {
        _ = abort.cancelled() => return Ok(Pipe::Aborted),
        r = tokio::io::copy(&mut reader, &mut writer) => r,
    };

    match copied {
        Ok(n) => {
            // pass the end of stream on to the other side
            let _ = writer.shutdown().await;
            Ok(Pipe::Done(n))
        }
        Err(e) => {
            abort.cancel();
            Err(e)
        }
    }
}

fn finish(
    joined: Result<io::Result<Pipe>, JoinError>,
    direction: Direction,
) -> Result<u64, ConnectionError> {
    let relay_error = |source| ConnectionError::Relay { direction, source };

    match joined {
        Ok(Ok(Pipe::Done(n))) => Ok(n),
        Ok(Ok(Pipe::Aborted)) => Ok(0),
        Ok(Err(e)) => Err(relay_error(e)),
        Err(e) => Err(relay_error(io::Error::other(e))),
    }
}

/// Copies bytes between `client` and `upstream` until both directions end.
///
/// Each direction runs in its own task. A direction reaching end of stream
/// shuts down the write half it feeds, so the close propagates to the peer.
/// A direction failing aborts the other one. Both streams are closed when
/// this returns, whatever the outcome.
pub async fn relay(client: TcpStream, upstream: TcpStream) -> Result<Transfer, ConnectionError> {
    let (client_rx, client_tx) = client.into_split();
    let (upstream_rx, upstream_tx) = upstream.into_split();

    let abort = CancellationToken::new();
    let outbound = tokio::spawn(pipe(client_rx, upstream_tx, abort.clone()));
    let inbound = tokio::spawn(pipe(upstream_rx, client_tx, abort));

    let (outbound, inbound) = tokio::join!(outbound, inbound);

    // an aborted direction reports 0 bytes, the failing one carries the error
    let (sent, received) = (
        finish(outbound, Direction::Outbound),
        finish(inbound, Direction::Inbound),
    );

    Ok(Transfer {
        sent: sent?,
        received: received?,
    })
}

/// Relays one UDP flow: datagrams from `peer` arrive over `datagrams` and go
/// out through `upstream`; replies go back to `peer` from the `listener`
/// socket so they carry the forwarded port as their source.
///
/// The flow ends after `idle` without traffic in either direction, when the
/// listener stops or when the listener drops the sending half.
pub async fn udp_flow(
    listener: Arc<UdpSocket>,
    upstream: UdpSocket,
    peer: SocketAddr,
    mut datagrams: mpsc::Receiver<Vec<u8>>,
    idle: Duration,
    cancel: CancellationToken,
) -> Result<Transfer, ConnectionError> {
    use Direction::*;

    let mut transfer = Transfer::default();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    let expired = sleep(idle);
    tokio::pin!(expired);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = &mut expired => {
                debug!("idle for {}", display!(idle));
                break;
            }

            datagram = datagrams.recv() => {
                let Some(datagram) = datagram else { break };

                upstream
                    .send(&datagram)
                    .await
                    .map_err(|source| ConnectionError::Relay { direction: Outbound, source })?;

                transfer.sent += datagram.len() as u64;
            }

            r = upstream.recv(&mut buf) => {
                let n = r.map_err(|source| ConnectionError::Relay { direction: Inbound, source })?;

                listener
                    .send_to(&buf[..n], peer)
                    .await
                    .map_err(|source| ConnectionError::Relay { direction: Inbound, source })?;

                transfer.received += n as u64;
            }
        }

        expired.as_mut().reset(Instant::now() + idle);
    }

    Ok(transfer)
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    use super::*;

    const LIMIT: Duration = Duration::from_secs(5);

    /// Returns both ends of a loopback TCP connection.
    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (a, b) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (a.unwrap(), b.unwrap().0)
    }

    #[tokio::test]
    async fn relays_both_directions_byte_exact() {
        let (mut client, client_inner) = socket_pair().await;
        let (upstream_inner, mut target) = socket_pair().await;

        let relay = tokio::spawn(relay(client_inner, upstream_inner));

        let request: Vec<u8> = (0..=255u8).cycle().take(256 * 1024).collect();
        let response = b"HTTP/1.1 204 No Content\r\n\r\n".to_vec();

        let writer = {
            let request = request.clone();
            tokio::spawn(async move {
                client.write_all(&request).await.unwrap();
                client.shutdown().await.unwrap();
                client
            })
        };

        let mut received = Vec::new();
        timeout(LIMIT, target.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, request);

        target.write_all(&response).await.unwrap();
        drop(target);

        let mut client = writer.await.unwrap();
        let mut echoed = Vec::new();
        timeout(LIMIT, client.read_to_end(&mut echoed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed, response);

        let transfer = timeout(LIMIT, relay).await.unwrap().unwrap().unwrap();
        assert_eq!(transfer.sent, request.len() as u64);
        assert_eq!(transfer.received, response.len() as u64);
    }

    #[tokio::test]
    async fn client_close_reaches_target() {
        let (client, client_inner) = socket_pair().await;
        let (upstream_inner, mut target) = socket_pair().await;

        let relay = tokio::spawn(relay(client_inner, upstream_inner));
        drop(client);

        let mut buf = [0u8; 16];
        let n = timeout(LIMIT, target.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0);

        drop(target);
        timeout(LIMIT, relay).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn target_close_reaches_client() {
        let (mut client, client_inner) = socket_pair().await;
        let (upstream_inner, target) = socket_pair().await;

        let relay = tokio::spawn(relay(client_inner, upstream_inner));
        drop(target);

        let mut buf = [0u8; 16];
        let n = timeout(LIMIT, client.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0);

        drop(client);
        timeout(LIMIT, relay).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn udp_flow_round_trip() {
        let listener = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        upstream.connect(target.local_addr().unwrap()).await.unwrap();

        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let flow = tokio::spawn(udp_flow(
            Arc::clone(&listener),
            upstream,
            client.local_addr().unwrap(),
            rx,
            LIMIT,
            cancel.clone(),
        ));

        tx.send(b"ping".to_vec()).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = timeout(LIMIT, target.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"ping");

        target.send_to(b"pong", from).await.unwrap();

        let (n, from) = timeout(LIMIT, client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(from, listener.local_addr().unwrap());

        cancel.cancel();
        let transfer = timeout(LIMIT, flow).await.unwrap().unwrap().unwrap();
        assert_eq!(transfer, Transfer { sent: 4, received: 4 });
    }

    #[tokio::test]
    async fn udp_flow_expires_when_idle() {
        let listener = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        upstream.connect("127.0.0.1:9").await.unwrap();

        let (_tx, rx) = mpsc::channel(4);
        let flow = udp_flow(
            listener,
            upstream,
            "127.0.0.1:9".parse().unwrap(),
            rx,
            Duration::from_millis(50),
            CancellationToken::new(),
        );

        let transfer = timeout(LIMIT, flow).await.unwrap().unwrap();
        assert_eq!(transfer, Transfer::default());
    }
}
