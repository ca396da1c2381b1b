//! Service-bot registry.
//!
//! Service bots are virtual users the daemon owns on every network: the
//! main relay client plus anything plugins register. The registry tracks
//! per-network UIDs, joins extra channels, and respawns bots that get
//! killed or lost to a reconnect.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::hooks::{HookContext, PRIORITY_DEFAULT};
use crate::modes::ModeChange;
use crate::protocols::SpawnOpts;
use crate::state::Network;
use crate::world::World;

/// One registered service bot.
pub struct ServiceBot {
    pub name: String,
    /// Network name -> UID of this bot there.
    pub uids: DashMap<String, String>,
    /// Network name -> channels to join beyond the configured autojoins.
    pub extra_channels: DashMap<String, HashSet<String>>,
    pub manipulatable: bool,
}

impl ServiceBot {
    pub fn new(name: &str, manipulatable: bool) -> Arc<ServiceBot> {
        Arc::new(ServiceBot {
            name: name.to_string(),
            uids: DashMap::new(),
            extra_channels: DashMap::new(),
            manipulatable,
        })
    }

    pub fn uid_on(&self, netname: &str) -> Option<String> {
        self.uids.get(netname).map(|u| u.clone())
    }

    /// Spawn this bot on a network if it isn't there already.
    pub fn spawn(&self, net: &Arc<Network>) -> Option<String> {
        if let Some(uid) = self.uid_on(&net.name)
            && net.users.contains_key(&uid)
        {
            return Some(uid);
        }
        let conf = net.config();
        let nick = if self.name == "main" {
            conf.bot.nick.clone()
        } else {
            self.name.clone()
        };
        let mut opts = SpawnOpts::new(&nick);
        opts.ident = conf.bot.ident.clone();
        opts.host = net.serverdata().hostname.clone();
        opts.realname = conf.bot.realname.clone();
        opts.manipulatable = self.manipulatable;
        // Service bots are opered so they can moderate relay channels.
        opts.modes = vec![ModeChange::plus('o', None), ModeChange::plus('i', None)];
        match net.protocol.spawn_client(net, opts) {
            Ok(uid) => {
                if let Some(mut user) = net.users.get_mut(&uid) {
                    user.service = Some(self.name.clone());
                }
                self.uids.insert(net.name.clone(), uid.clone());
                if self.name == "main" {
                    *net.pseudoclient.write() = Some(uid.clone());
                }
                debug!(net = %net.name, service = %self.name, uid = %uid, "spawned service bot");
                Some(uid)
            }
            Err(e) => {
                warn!(net = %net.name, service = %self.name, error = %e, "failed to spawn service bot");
                None
            }
        }
    }

    /// Join this bot to channels on a network.
    pub fn join(&self, net: &Arc<Network>, channels: &[String]) {
        let Some(uid) = self.uid_on(&net.name) else {
            return;
        };
        for channel in channels {
            self.extra_channels
                .entry(net.name.clone())
                .or_default()
                .insert(net.to_lower(channel));
            if let Err(e) = net.protocol.join(net, &uid, channel) {
                debug!(net = %net.name, service = %self.name, channel = %channel, error = %e, "join failed");
            }
        }
    }

    /// Autojoin list: configured channels plus dynamic extras.
    fn all_channels(&self, net: &Network) -> Vec<String> {
        let mut channels: Vec<String> = net.serverdata().channels.clone();
        if let Some(extra) = self.extra_channels.get(&net.name) {
            channels.extend(extra.iter().cloned());
        }
        channels
    }
}

#[derive(Default)]
pub struct ServiceRegistry {
    bots: DashMap<String, Arc<ServiceBot>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, bot: Arc<ServiceBot>) -> Arc<ServiceBot> {
        self.bots.insert(bot.name.clone(), bot.clone());
        bot
    }

    pub fn get(&self, name: &str) -> Option<Arc<ServiceBot>> {
        self.bots.get(name).map(|b| b.clone())
    }

    pub fn all(&self) -> Vec<Arc<ServiceBot>> {
        self.bots.iter().map(|b| b.clone()).collect()
    }

    /// The service bot owning `uid` on `net`, if any.
    pub fn by_uid(&self, net: &Network, uid: &str) -> Option<Arc<ServiceBot>> {
        let name = net.users.get(uid)?.service.clone()?;
        self.get(&name)
    }

    /// Spawn every registered bot on a freshly bursted network.
    pub fn burst_network(&self, net: &Arc<Network>) {
        for bot in self.all() {
            if bot.spawn(net).is_some() {
                let channels = bot.all_channels(net);
                bot.join(net, &channels);
            }
        }
    }
}

/// Wire the registry into the hook bus: spawn bots after burst, respawn
/// them when they are killed or quit out from under us.
pub fn register_hooks(world: &Arc<World>) {
    world.hooks.add_hook(
        "ENDBURST",
        "services.endburst",
        PRIORITY_DEFAULT + 400,
        move |ctx: &HookContext| {
            if Some(ctx.source.to_string()) == ctx.net.uplink() {
                ctx.world.services.burst_network(ctx.net);
            }
            true
        },
    );

    for event in ["KILL", "QUIT"] {
        world.hooks.add_hook(
            event,
            "services.respawn",
            PRIORITY_DEFAULT + 400,
            move |ctx: &HookContext| {
                use crate::hooks::HookPayload;
                let target = match ctx.payload {
                    HookPayload::Kill { target, .. } => target.clone(),
                    HookPayload::Quit { .. } => ctx.source.to_string(),
                    _ => return true,
                };
                // Was this one of our service bots?
                for bot in ctx.world.services.all() {
                    if bot.uid_on(&ctx.net.name).as_deref() == Some(target.as_str())
                        && !ctx.net.users.contains_key(&target)
                    {
                        debug!(net = %ctx.net.name, service = %bot.name, "service bot lost; respawning");
                        bot.uids.remove(&ctx.net.name);
                        if bot.spawn(ctx.net).is_some() {
                            let channels = bot.all_channels(ctx.net);
                            bot.join(ctx.net, &channels);
                        }
                    }
                }
                true
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::test_net;

    #[test]
    fn test_spawn_and_lookup() {
        let net = test_net("svcnet");
        let registry = ServiceRegistry::new();
        let bot = registry.register(ServiceBot::new("main", true));

        let uid = bot.spawn(&net).unwrap();
        assert!(net.is_internal_client(&uid));
        assert_eq!(net.pseudoclient.read().clone(), Some(uid.clone()));
        assert_eq!(registry.by_uid(&net, &uid).unwrap().name, "main");

        // Spawning again reuses the existing client.
        assert_eq!(bot.spawn(&net).unwrap(), uid);
    }

    #[test]
    fn test_join_tracks_extra_channels() {
        let net = test_net("svcnet");
        let bot = ServiceBot::new("main", true);
        bot.spawn(&net).unwrap();
        bot.join(&net, &["#Relay".to_string()]);
        let uid = bot.uid_on("svcnet").unwrap();
        assert!(net.channel_snapshot("#relay").unwrap().users.contains(&uid));
        assert!(
            bot.extra_channels
                .get("svcnet")
                .unwrap()
                .contains("#relay")
        );
    }
}
