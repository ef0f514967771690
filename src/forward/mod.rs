//! The forwarding engine.
//!
//! A [`Forwarder`] owns a [`Registry`] of listeners, one per local port and
//! protocol. Mappings expand into [`ConcreteRoute`]s, each route gets its own
//! [`Listener`] task, and every accepted connection is relayed to the target
//! in its own task until either end closes it.

use std::collections::BTreeMap;
use std::sync::Arc;

pub mod address;
pub mod connect;
mod error;
pub mod listener;
pub mod mapping;
pub mod registry;
pub mod relay;

pub use self::address::{LocalSpec, Protocol, Protocols, Target};
pub use self::connect::ConnectOpts;
pub use self::error::{ConnectionError, Direction, Error};
pub use self::listener::{ListenOpts, Listener};
pub use self::mapping::{ConcreteRoute, Mapping};
pub use self::registry::Registry;

/// Adds, updates and removes mappings while traffic flows.
///
/// Cloning is cheap, clones share the same registry.
#[derive(Debug, Clone)]
pub struct Forwarder {
    registry: Arc<Registry>,
}

impl Forwarder {
    pub fn new(opts: ListenOpts) -> Self {
        Self {
            registry: Arc::new(Registry::new(opts)),
        }
    }

    pub fn opts(&self) -> &ListenOpts {
        self.registry.opts()
    }

    /// Parses and adds a TCP mapping, e.g. `("9000/9002", "10.0.0.2:9100")`.
    pub async fn add_mapping(&self, local: &str, target: &str) -> Result<(), Error> {
        self.add(&Mapping::parse(local, target)?).await
    }

    /// Starts listening on every port of the mapping.
    ///
    /// Returns once all ports are bound. Nothing is left running if any of
    /// them is already mapped or cannot be bound.
    pub async fn add(&self, mapping: &Mapping) -> Result<(), Error> {
        self.registry.add(mapping.routes()?).await?;
        info!("added {mapping}");
        Ok(())
    }

    /// Parses a TCP mapping and puts it in place of whatever serves its ports.
    pub async fn update_mapping(&self, local: &str, target: &str) -> Result<(), Error> {
        self.update(&Mapping::parse(local, target)?).await
    }

    /// Replaces the listeners on the mapping's ports.
    ///
    /// Connections accepted before the update stay with the old target.
    pub async fn update(&self, mapping: &Mapping) -> Result<(), Error> {
        self.registry
            .replace(mapping.local(), mapping.routes()?)
            .await?;
        info!("updated {mapping}");
        Ok(())
    }

    /// Stops forwarding the given ports; returns the number of listeners
    /// stopped.
    pub async fn remove_mapping(&self, local: &str) -> Result<usize, Error> {
        Ok(self.remove(local.parse()?).await)
    }

    pub async fn remove(&self, local: LocalSpec) -> usize {
        let n = self.registry.remove(local).await;

        if n > 0 {
            info!("removed {}", display!(local));
        }

        n
    }

    pub async fn list_mappings(&self) -> BTreeMap<u16, Target> {
        self.registry.list().await
    }

    /// Target of a mapped port.
    ///
    /// For a range, the target of its first port, provided every port of
    /// the range forwards in lockstep to the same host.
    pub async fn get_mapping(&self, local: &str) -> Result<Target, Error> {
        let local: LocalSpec = local.parse()?;

        if local.is_single() {
            return self.registry.get(local.start()).await;
        }

        let table = self.registry.list().await;
        let base = table.get(&local.start()).ok_or(Error::NotFound(local))?;

        let pairs = local.expand(base).map_err(|_| Error::NotFound(local))?;

        for (port, target_port) in pairs {
            match table.get(&port) {
                Some(x) if x.host() == base.host() && x.port() == target_port => {}
                _ => return Err(Error::NotFound(local)),
            }
        }

        Ok(base.clone())
    }

    /// Every running listener.
    pub async fn listeners(&self) -> Vec<(u16, Protocol)> {
        self.registry.listeners().await
    }

    /// Stops every listener.
    pub async fn shutdown(&self) {
        self.registry.clear().await;
    }
}
