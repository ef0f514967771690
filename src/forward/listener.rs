use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use owo_colors::OwoColorize;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::Instrument;

use super::Error;
use super::address::{Protocol, Target};
use super::connect::{ConnectOpts, connect};
use super::error::ConnectionError;
use super::mapping::ConcreteRoute;
use super::relay::{MAX_DATAGRAM, relay, udp_flow};

/// Pause after an unexpected accept error, so a persistent failure such as
/// running out of file descriptors does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Datagrams queued per UDP flow before new ones are dropped.
const FLOW_QUEUE: usize = 64;

/// UDP flows one listener keeps at once. Datagrams from further peers are
/// dropped until a flow expires.
const MAX_FLOWS: usize = 1024;

/// Settings shared by every listener of a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenOpts {
    /// Address the local ports are bound on.
    pub bind: IpAddr,
    /// Inactivity after which a UDP flow is dropped.
    pub udp_timeout: Duration,
}

impl Default for ListenOpts {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            udp_timeout: Duration::from_secs(60),
        }
    }
}

/// A bound local port serving one route.
///
/// Dropping a `Listener` cancels its loop as well, but unlike
/// [`Listener::stop`] does not wait for the socket to close.
#[derive(Debug)]
pub struct Listener {
    addr: SocketAddr,
    route: ConcreteRoute,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    _guard: DropGuard,
}

impl Listener {
    /// Binds the route's port and starts serving it in the background.
    pub async fn start(route: ConcreteRoute, opts: &ListenOpts) -> Result<Self, Error> {
        let addr = SocketAddr::new(opts.bind, route.port);
        let protocol = route.protocol;
        let bind_error = |source| Error::Bind {
            addr,
            protocol,
            source,
        };

        let cancel = CancellationToken::new();

        let task = match protocol {
            Protocol::Tcp => {
                let listener = TcpListener::bind(addr).await.map_err(bind_error)?;

                tokio::spawn(accept_loop(listener, route.clone(), cancel.clone()))
            }

            Protocol::Udp => {
                let socket = UdpSocket::bind(addr).await.map_err(bind_error)?;

                tokio::spawn(recv_loop(
                    Arc::new(socket),
                    route.clone(),
                    opts.udp_timeout,
                    MAX_FLOWS,
                    cancel.clone(),
                ))
            }
        };

        info!(
            "forwarding {protocol} {} to {}",
            display!(addr),
            display!(route.target)
        );

        Ok(Self {
            addr,
            route,
            _guard: cancel.clone().drop_guard(),
            cancel,
            task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn route(&self) -> &ConcreteRoute {
        &self.route
    }

    /// Stops accepting and closes the local socket.
    ///
    /// Returns once the socket is closed. Established TCP connections keep
    /// running until either end closes them; UDP flows end with the listener.
    pub async fn stop(self) {
        self.cancel.cancel();

        if let Err(e) = self.task.await {
            error!(
                "{} listener on {} did not shut down cleanly: {e}",
                self.route.protocol,
                display!(self.addr)
            );
        }

        info!(
            "stopped forwarding {} {}",
            self.route.protocol,
            display!(self.addr)
        );
    }
}

async fn accept_loop(listener: TcpListener, route: ConcreteRoute, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            r = listener.accept() => r,
        };

        let (client, addr) = match accepted {
            Ok(x) => x,
            // the registry let go of us, the error is part of shutting down
            Err(_) if cancel.is_cancelled() => break,
            Err(e) => {
                error!(
                    "failed to accept connection on tcp port {}: {}",
                    route.port,
                    display!(e)
                );
                sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        let span = error_span!(
            "tunnel",
            from = addr.to_string(),
            to = route.target.to_string()
        );

        tokio::spawn(tunnel(client, route.target.clone(), route.opts.clone()).instrument(span));
    }

    debug!("tcp port {} no longer accepting", route.port);
}

async fn tunnel(client: TcpStream, target: Target, opts: ConnectOpts) {
    info!("connected");

    let r: Result<_, ConnectionError> = async move {
        let upstream = connect(&target, &opts)
            .await
            .map_err(|source| ConnectionError::Dial { target, source })?;

        debug!("{} to upstream", "connected".bright_green());
        relay(client, upstream).await
    }
    .await;

    match r {
        Ok(x) => info!("disconnected, sent {} bytes, received {}", x.sent, x.received),
        Err(e) => warn!("{}", display!(e)),
    }
}

struct Flow {
    id: u64,
    tx: mpsc::Sender<Vec<u8>>,
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    route: ConcreteRoute,
    idle: Duration,
    max_flows: usize,
    cancel: CancellationToken,
) {
    let mut flows: HashMap<SocketAddr, Flow> = HashMap::new();
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<(SocketAddr, u64)>();
    let mut next_id = 0;
    let mut saturated = false;
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            Some((peer, id)) = closed_rx.recv() => {
                // the peer may already have a newer flow
                if flows.get(&peer).is_some_and(|x| x.id == id) {
                    flows.remove(&peer);
                    saturated = false;
                }
            }

            r = socket.recv_from(&mut buf) => {
                let (n, peer) = match r {
                    Ok(x) => x,
                    Err(_) if cancel.is_cancelled() => break,
                    Err(e) => {
                        error!(
                            "failed to receive on udp port {}: {}",
                            route.port,
                            display!(e)
                        );
                        sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                };

                let datagram = buf[..n].to_vec();

                let datagram = match flows.get(&peer) {
                    None => datagram,
                    Some(flow) => match flow.tx.try_send(datagram) {
                        Ok(()) => continue,
                        Err(TrySendError::Full(_)) => {
                            trace!("flow from {} is congested, dropping datagram", display!(peer));
                            continue;
                        }
                        // the flow expired between two datagrams
                        Err(TrySendError::Closed(x)) => x,
                    },
                };

                if flows.len() >= max_flows && !flows.contains_key(&peer) {
                    if !saturated {
                        warn!(
                            "udp port {} has {} flows, dropping datagrams from new peers",
                            route.port,
                            flows.len()
                        );
                        saturated = true;
                    }

                    continue;
                }

                next_id += 1;
                let flow = open_flow(
                    &socket,
                    peer,
                    &route.target,
                    next_id,
                    idle,
                    cancel.clone(),
                    closed_tx.clone(),
                );

                let _ = flow.tx.try_send(datagram);
                flows.insert(peer, flow);
            }
        }
    }

    debug!("udp port {} no longer receiving", route.port);
}

/// Spawns the task of a new flow and returns its queue.
///
/// The upstream socket is set up inside the task, so a slow lookup holds up
/// neither the other peers of the listener nor its shutdown.
fn open_flow(
    listener: &Arc<UdpSocket>,
    peer: SocketAddr,
    target: &Target,
    id: u64,
    idle: Duration,
    cancel: CancellationToken,
    closed: mpsc::UnboundedSender<(SocketAddr, u64)>,
) -> Flow {
    let (tx, rx) = mpsc::channel(FLOW_QUEUE);
    let listener = Arc::clone(listener);
    let target = target.clone();
    let span = error_span!("flow", from = peer.to_string(), to = target.to_string());

    tokio::spawn(
        async move {
            info!("new flow");

            let upstream = tokio::select! {
                biased;
                _ = cancel.cancelled() => Ok(None),
                r = dial_flow(&target) => r.map(Some),
            };

            match upstream {
                Ok(Some(upstream)) => {
                    match udp_flow(listener, upstream, peer, rx, idle, cancel).await {
                        Ok(x) => {
                            info!("flow closed, sent {} bytes, received {}", x.sent, x.received)
                        }
                        Err(e) => warn!("{}", display!(e)),
                    }
                }
                Ok(None) => debug!("listener stopped before the flow was set up"),
                Err(e) => warn!("{}", display!(e)),
            }

            let _ = closed.send((peer, id));
        }
        .instrument(span),
    );

    Flow { id, tx }
}

/// Opens a UDP socket connected to `target`.
async fn dial_flow(target: &Target) -> Result<UdpSocket, ConnectionError> {
    let dial_error = |source| ConnectionError::Dial {
        target: target.clone(),
        source,
    };

    let to = target.resolve().await.map_err(dial_error)?;

    let any: IpAddr = match to {
        SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };

    let upstream = UdpSocket::bind((any, 0)).await.map_err(dial_error)?;
    upstream.connect(to).await.map_err(dial_error)?;

    Ok(upstream)
}
