//! Process-wide registries: the network table, the hook bus and the
//! service-bot registry. Initialised once at startup; rehash mutates the
//! network table under its own synchronisation.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::config::Config;
use crate::hooks::HookBus;
use crate::services::ServiceRegistry;
use crate::state::Network;

pub struct World {
    config: RwLock<Arc<Config>>,
    pub networks: DashMap<String, Arc<Network>>,
    pub hooks: HookBus,
    pub services: ServiceRegistry,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl World {
    pub fn new(config: Arc<Config>) -> Arc<World> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(World {
            config: RwLock::new(config),
            networks: DashMap::new(),
            hooks: HookBus::new(),
            services: ServiceRegistry::new(),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: Arc<Config>) {
        *self.config.write() = config.clone();
        for net in self.networks.iter() {
            net.set_config(config.clone());
        }
    }

    pub fn get_network(&self, name: &str) -> Option<Arc<Network>> {
        self.networks.get(name).map(|n| n.clone())
    }

    /// Snapshot of all networks, safe to iterate while others mutate.
    pub fn all_networks(&self) -> Vec<Arc<Network>> {
        self.networks.iter().map(|n| n.clone()).collect()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn begin_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    #[cfg(test)]
    pub fn new_for_tests() -> Arc<World> {
        World::new(Arc::new(
            toml::from_str("[bot]\nnick = \"slink\"").expect("static config parses"),
        ))
    }
}
