use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;

use eyre::{Context, Result};

use crate::config::Config;
use crate::forward::{Forwarder, LocalSpec, Mapping};
use crate::signal::{Event, Signals};

/// One step that brings the running table in line with the config.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Add(Mapping),
    Update(Mapping),
    Remove(LocalSpec),
}

/// Works out how to go from the `applied` mappings to `wanted`.
///
/// Removals come first so their ports are free for whatever follows.
pub fn plan(applied: &BTreeMap<LocalSpec, Mapping>, wanted: &[Mapping]) -> Vec<Change> {
    let mut changes: Vec<_> = applied
        .keys()
        .filter(|local| !wanted.iter().any(|x| x.local() == **local))
        .map(|local| Change::Remove(*local))
        .collect();

    for x in wanted {
        match applied.get(&x.local()) {
            None => changes.push(Change::Add(x.clone())),
            Some(old) if old != x => changes.push(Change::Update(x.clone())),
            Some(_) => {}
        }
    }

    changes
}

#[derive(Debug)]
pub struct App {
    path: PathBuf,
    bind: Option<IpAddr>,
    config: Config,
    forwarder: Forwarder,
    applied: BTreeMap<LocalSpec, Mapping>,
}

impl App {
    /// Reads the config at `path`. `bind` overrides its bind address.
    pub async fn load(path: PathBuf, bind: Option<IpAddr>) -> Result<Self> {
        let mut config = Config::read(&path)
            .await
            .with_context(|| format!("{}", path.display()))?;

        if let Some(x) = bind {
            config.listen.bind = x;
        }

        let forwarder = Forwarder::new(config.listen.clone());

        Ok(Self {
            path,
            bind,
            config,
            forwarder,
            applied: BTreeMap::new(),
        })
    }

    pub fn forwarder(&self) -> &Forwarder {
        &self.forwarder
    }

    pub async fn run(mut self) -> Result<()> {
        info!("starting...");
        let mut signals = Signals::new().context("failed to register signal handlers")?;

        let changes = plan(&self.applied, &self.config.forward);
        self.apply(changes).await;

        loop {
            match signals.wait().await {
                Event::Reload => self.reload().await,
                Event::Terminate => break,
            }
        }

        info!("exiting...");
        self.forwarder.shutdown().await;
        Ok(())
    }

    /// Re-reads the config file and applies the difference. A config that
    /// fails to parse changes nothing.
    pub async fn reload(&mut self) {
        info!("reloading {}", self.path.display());

        let mut config = match Config::read(&self.path).await {
            Ok(x) => x,
            Err(e) => {
                error!("{}: {e:#}", self.path.display());
                return;
            }
        };

        if let Some(x) = self.bind {
            config.listen.bind = x;
        }

        if config.listen != self.config.listen {
            warn!("changes to 'bind' and 'udp-timeout' take effect after a restart");
            config.listen = self.config.listen.clone();
        }

        let changes = plan(&self.applied, &config.forward);
        if changes.is_empty() {
            info!("nothing changed");
        }

        self.apply(changes).await;
        self.config = config;
    }

    async fn apply(&mut self, changes: Vec<Change>) {
        for change in changes {
            match change {
                Change::Remove(local) => {
                    self.forwarder.remove(local).await;
                    self.applied.remove(&local);
                }

                Change::Add(x) => match self.forwarder.add(&x).await {
                    Ok(()) => {
                        self.applied.insert(x.local(), x);
                    }
                    Err(e) => error!("cannot add {x}: {}", display!(e)),
                },

                Change::Update(x) => match self.forwarder.update(&x).await {
                    Ok(()) => {
                        self.applied.insert(x.local(), x);
                    }
                    Err(e) => error!("cannot update {x}: {}", display!(e)),
                },
            }
        }
    }
}
