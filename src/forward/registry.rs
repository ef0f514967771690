use std::collections::{BTreeMap, HashSet};

use tokio::sync::RwLock;

use super::Error;
use super::address::{LocalSpec, Protocol, Target};
use super::listener::{ListenOpts, Listener};
use super::mapping::ConcreteRoute;

type Table = BTreeMap<(u16, Protocol), Listener>;

/// Owns every running listener, at most one per port and protocol.
///
/// Mutations hold the write lock for their whole duration, binding included,
/// so a batch of routes is either fully registered or not at all.
#[derive(Debug)]
pub struct Registry {
    opts: ListenOpts,
    listeners: RwLock<Table>,
}

impl Registry {
    pub fn new(opts: ListenOpts) -> Self {
        Self {
            opts,
            listeners: RwLock::new(Table::new()),
        }
    }

    pub fn opts(&self) -> &ListenOpts {
        &self.opts
    }

    /// Starts a listener for every route.
    ///
    /// Fails without starting anything if one of the routes is already
    /// served. If a bind fails, the listeners started so far are stopped
    /// again before the error is returned.
    pub async fn add(&self, routes: Vec<ConcreteRoute>) -> Result<(), Error> {
        let mut listeners = self.listeners.write().await;
        self.add_locked(&mut listeners, routes).await
    }

    /// Stops every listener on the ports of `local` and starts `routes` in
    /// their place.
    ///
    /// If the new routes cannot be started the old ones are brought back, as
    /// far as their ports can still be bound.
    pub async fn replace(&self, local: LocalSpec, routes: Vec<ConcreteRoute>) -> Result<(), Error> {
        let mut listeners = self.listeners.write().await;

        let previous = remove_locked(&mut listeners, local).await;

        if let Err(e) = self.add_locked(&mut listeners, routes).await {
            if !previous.is_empty() {
                warn!("restoring previous routes on {}", display!(local));
                self.restore_locked(&mut listeners, previous).await;
            }

            return Err(e);
        }

        Ok(())
    }

    /// Stops every listener on the ports of `local` and returns how many
    /// there were. Ports without a listener are ignored.
    pub async fn remove(&self, local: LocalSpec) -> usize {
        let mut listeners = self.listeners.write().await;
        remove_locked(&mut listeners, local).await.len()
    }

    /// Target of every mapped port.
    pub async fn list(&self) -> BTreeMap<u16, Target> {
        let listeners = self.listeners.read().await;

        listeners
            .iter()
            .map(|((port, _), x)| (*port, x.route().target.clone()))
            .collect()
    }

    pub async fn get(&self, port: u16) -> Result<Target, Error> {
        let listeners = self.listeners.read().await;

        listeners
            .range((port, Protocol::Tcp)..=(port, Protocol::Udp))
            .map(|(_, x)| x.route().target.clone())
            .next()
            .ok_or(Error::NotFound(LocalSpec::from_port(port)))
    }

    /// Every running listener.
    pub async fn listeners(&self) -> Vec<(u16, Protocol)> {
        self.listeners.read().await.keys().copied().collect()
    }

    /// Stops all listeners.
    pub async fn clear(&self) {
        let mut listeners = self.listeners.write().await;

        while let Some((_, listener)) = listeners.pop_first() {
            listener.stop().await;
        }
    }

    /// Starts each route on its own; a route that cannot be started is
    /// logged and skipped. Returns how many came back.
    async fn restore_locked(&self, listeners: &mut Table, routes: Vec<ConcreteRoute>) -> usize {
        let mut restored = 0;

        for route in routes {
            let key = route.key();
            if listeners.contains_key(&key) {
                continue;
            }

            match Listener::start(route, &self.opts).await {
                Ok(x) => {
                    listeners.insert(key, x);
                    restored += 1;
                }
                Err(e) => error!("cannot restore {} port {}: {}", key.1, key.0, display!(e)),
            }
        }

        restored
    }

    async fn add_locked(&self, listeners: &mut Table, routes: Vec<ConcreteRoute>) -> Result<(), Error> {
        let mut batch = HashSet::with_capacity(routes.len());

        for route in &routes {
            let key = route.key();

            if listeners.contains_key(&key) || !batch.insert(key) {
                return Err(Error::AlreadyMapped {
                    port: route.port,
                    protocol: route.protocol,
                });
            }
        }

        let mut started = Vec::with_capacity(routes.len());

        for route in routes {
            match Listener::start(route, &self.opts).await {
                Ok(x) => started.push(x),
                Err(e) => {
                    for listener in started {
                        listener.stop().await;
                    }

                    return Err(e);
                }
            }
        }

        for listener in started {
            listeners.insert(listener.route().key(), listener);
        }

        Ok(())
    }
}

/// Takes the listeners of `local` out of the table, then stops them.
async fn remove_locked(listeners: &mut Table, local: LocalSpec) -> Vec<ConcreteRoute> {
    let keys: Vec<_> = listeners
        .range((local.start(), Protocol::Tcp)..=(local.end(), Protocol::Udp))
        .map(|(key, _)| *key)
        .collect();

    let mut removed = Vec::with_capacity(keys.len());

    for key in keys {
        if let Some(listener) = listeners.remove(&key) {
            removed.push(listener.route().clone());
            listener.stop().await;
        }
    }

    removed
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::forward::mapping::Mapping;

    fn registry() -> Registry {
        Registry::new(ListenOpts {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            udp_timeout: Duration::from_secs(5),
        })
    }

    /// Finds `n` consecutive free ports on loopback.
    async fn free_ports(n: u16) -> LocalSpec {
        'search: loop {
            let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let start = first.local_addr().unwrap().port();
            let Some(end) = start.checked_add(n - 1) else { continue };

            let mut held = vec![first];
            for port in start + 1..=end {
                match TcpListener::bind(("127.0.0.1", port)).await {
                    Ok(x) => held.push(x),
                    Err(_) => continue 'search,
                }
            }

            return LocalSpec::new(start, end).unwrap();
        }
    }

    fn routes(local: LocalSpec, target: &str) -> Vec<ConcreteRoute> {
        let mapping = Mapping::new(local, target.parse().unwrap()).unwrap();
        mapping.routes().unwrap()
    }

    #[tokio::test]
    async fn add_registers_every_port() {
        let registry = registry();
        let local = free_ports(3).await;

        registry.add(routes(local, "127.0.0.1:9100")).await.unwrap();

        let table = registry.list().await;
        assert_eq!(table.len(), 3);
        for (offset, port) in local.ports().enumerate() {
            assert_eq!(table[&port], Target::new("127.0.0.1", 9100 + offset as u16));
        }

        registry.clear().await;
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn add_rejects_occupied_ports() {
        let registry = registry();
        let local = free_ports(2).await;

        registry.add(routes(local, "127.0.0.1:1000")).await.unwrap();

        let single = LocalSpec::from_port(local.end());
        let err = registry.add(routes(single, "127.0.0.1:2000")).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyMapped { port, .. } if port == local.end()));

        assert_eq!(
            registry.get(local.end()).await.unwrap(),
            Target::new("127.0.0.1", 1001)
        );

        registry.clear().await;
    }

    #[tokio::test]
    async fn failed_bind_rolls_back_the_batch() {
        let registry = registry();
        let local = free_ports(3).await;

        // someone outside the registry holds the last port
        let _squatter = TcpListener::bind(("127.0.0.1", local.end())).await.unwrap();

        let err = registry.add(routes(local, "127.0.0.1:1000")).await.unwrap_err();
        assert!(matches!(err, Error::Bind { addr, .. } if addr.port() == local.end()));

        assert!(registry.list().await.is_empty());

        // the ports bound before the failure were released
        for port in local.start()..local.end() {
            assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
            TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn concurrent_adds_leave_one_listener() {
        let registry = Arc::new(registry());
        let local = free_ports(1).await;

        let tasks: Vec<_> = (0..8u16)
            .map(|i| {
                let registry = Arc::clone(&registry);
                let routes = routes(local, &format!("127.0.0.1:{}", 1000 + i));
                tokio::spawn(async move { registry.add(routes).await })
            })
            .collect();

        let mut won = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(()) => won += 1,
                Err(Error::AlreadyMapped { .. }) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(won, 1);
        assert_eq!(registry.listeners().await, [(local.start(), Protocol::Tcp)]);

        registry.clear().await;
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = registry();
        let local = free_ports(2).await;

        assert_eq!(registry.remove(local).await, 0);

        registry.add(routes(local, "127.0.0.1:1000")).await.unwrap();
        assert_eq!(registry.remove(local).await, 2);
        assert_eq!(registry.remove(local).await, 0);
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn remove_only_touches_covered_ports() {
        let registry = registry();
        let local = free_ports(3).await;

        registry.add(routes(local, "127.0.0.1:1000")).await.unwrap();
        assert_eq!(registry.remove(LocalSpec::from_port(local.start() + 1)).await, 1);

        let ports: Vec<_> = registry.list().await.into_keys().collect();
        assert_eq!(ports, [local.start(), local.end()]);

        registry.clear().await;
    }

    #[tokio::test]
    async fn replace_swaps_the_target() {
        let registry = registry();
        let local = free_ports(1).await;

        registry.add(routes(local, "127.0.0.1:1000")).await.unwrap();
        registry.replace(local, routes(local, "10.0.0.1:2000")).await.unwrap();

        assert_eq!(
            registry.get(local.start()).await.unwrap(),
            Target::new("10.0.0.1", 2000)
        );

        registry.clear().await;
    }

    #[tokio::test]
    async fn replace_of_unmapped_port_adds() {
        let registry = registry();
        let local = free_ports(1).await;

        registry.replace(local, routes(local, "127.0.0.1:1000")).await.unwrap();
        assert_eq!(registry.list().await.len(), 1);

        registry.clear().await;
    }

    #[tokio::test]
    async fn failed_replace_restores_previous_routes() {
        let registry = registry();
        let local = free_ports(1).await;
        let other = free_ports(1).await;

        registry.add(routes(local, "127.0.0.1:1000")).await.unwrap();

        // the new batch also wants a port held outside the registry
        let _squatter = TcpListener::bind(("127.0.0.1", other.start())).await.unwrap();
        let mut new = routes(local, "127.0.0.1:2000");
        new.extend(routes(other, "127.0.0.1:2001"));

        assert!(registry.replace(local, new).await.is_err());
        assert_eq!(
            registry.get(local.start()).await.unwrap(),
            Target::new("127.0.0.1", 1000)
        );

        registry.clear().await;
    }

    #[tokio::test]
    async fn restore_brings_back_what_it_can() {
        let registry = registry();
        let local = free_ports(2).await;

        // the second port was taken while nothing listened on it
        let _squatter = TcpListener::bind(("127.0.0.1", local.end())).await.unwrap();

        let restored = {
            let mut listeners = registry.listeners.write().await;
            registry
                .restore_locked(&mut listeners, routes(local, "127.0.0.1:1000"))
                .await
        };

        assert_eq!(restored, 1);
        assert_eq!(registry.listeners().await, [(local.start(), Protocol::Tcp)]);
        assert_eq!(
            registry.get(local.start()).await.unwrap(),
            Target::new("127.0.0.1", 1000)
        );
        assert!(TcpStream::connect(("127.0.0.1", local.start())).await.is_ok());

        registry.clear().await;
    }

    #[tokio::test]
    async fn get_reports_unmapped_ports() {
        let registry = registry();

        let err = registry.get(4242).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(x) if x.start() == 4242));
    }
}
