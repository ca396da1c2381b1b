//! The relay manager.
//!
//! Maintains the channel link table, spawns clone users and subservers on
//! remote networks, normalises identities to remote-legal forms, and
//! forwards joins/parts/kicks/modes/messages/topics across networks with
//! CLAIM access control. See `handlers` for the hook subscriptions.

mod db;
mod handlers;
mod normalize;

pub use db::{LinkEntry, RelayDb};
pub use normalize::{normalize_nick, normalize_host};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, ReentrantMutex};
use tracing::{debug, error, info, warn};

use crate::modes::ModeChange;
use crate::protocols::SpawnOpts;
use crate::state::{Channel, Network, now_ts};
use crate::world::World;

/// How long a spawn lock acquisition may block before the operation is
/// abandoned.
const SPAWN_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// TS values below this are bogus (pre-1993) and get replaced.
const MIN_SANE_TS: i64 = 750_000;

/// User modes that are safe to mirror onto clones.
const WHITELISTED_UMODES: &[&str] = &[
    "bot",
    "hidechans",
    "hideoper",
    "invisible",
    "oper",
    "regdeaf",
    "stripcolor",
    "noctcp",
    "wallops",
    "hideidle",
];

/// Channel modes that are safe to relay between networks.
const WHITELISTED_CMODES: &[&str] = &[
    "admin",
    "allowinvite",
    "autoop",
    "ban",
    "banexception",
    "blockcolor",
    "halfop",
    "invex",
    "inviteonly",
    "key",
    "limit",
    "moderated",
    "noctcp",
    "noextmsg",
    "nokick",
    "noknock",
    "nonick",
    "nonotice",
    "op",
    "operonly",
    "opmoderated",
    "owner",
    "private",
    "regonly",
    "regmoderated",
    "secret",
    "sslonly",
    "adminonly",
    "stripcolor",
    "topiclock",
    "voice",
    "flood",
    "flood_unreal",
    "joinflood",
    "freetarget",
    "noforwards",
    "noinvite",
];

/// The reduced whitelist used for clientbot_modesync=half.
const CLIENTBOT_WHITELISTED_CMODES: &[&str] = &[
    "admin", "ban", "banexception", "halfop", "invex", "op", "owner", "voice",
];

pub struct Relay {
    db: Mutex<RelayDb>,
    db_path: PathBuf,
    /// (home network, home UID) -> {remote network: clone UID}.
    pub relayusers: DashMap<(String, String), HashMap<String, String>>,
    /// network -> {origin network: subserver SID there}.
    pub relayservers: DashMap<String, HashMap<String, String>>,
    spawnlocks: DashMap<String, Arc<ReentrantMutex<()>>>,
    spawnlocks_servers: DashMap<String, Arc<ReentrantMutex<()>>>,
}

impl Relay {
    pub fn new(db_path: &str) -> Arc<Relay> {
        let db_path = PathBuf::from(db_path);
        Arc::new(Relay {
            db: Mutex::new(RelayDb::load(&db_path)),
            db_path,
            relayusers: DashMap::new(),
            relayservers: DashMap::new(),
            spawnlocks: DashMap::new(),
            spawnlocks_servers: DashMap::new(),
        })
    }

    /// Register all relay hook handlers and return the manager.
    pub fn start(world: &Arc<World>, db_path: &str) -> Arc<Relay> {
        let relay = Relay::new(db_path);
        handlers::register(world, &relay);
        relay
    }

    pub fn db(&self) -> MutexGuard<'_, RelayDb> {
        self.db.lock()
    }

    pub fn save_db(&self) {
        if let Err(e) = self.db.lock().save(&self.db_path) {
            error!(path = %self.db_path.display(), error = %e, "failed to save relay DB");
        }
    }

    fn spawnlock(&self, netname: &str) -> Arc<ReentrantMutex<()>> {
        self.spawnlocks
            .entry(netname.to_string())
            .or_insert_with(|| Arc::new(ReentrantMutex::new(())))
            .clone()
    }

    fn spawnlock_servers(&self, netname: &str) -> Arc<ReentrantMutex<()>> {
        self.spawnlocks_servers
            .entry(netname.to_string())
            .or_insert_with(|| Arc::new(ReentrantMutex::new(())))
            .clone()
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    pub fn get_relay(&self, pair: &(String, String)) -> Option<(String, String)> {
        self.db.lock().get_relay(pair)
    }

    /// Linked channel name for `channel` (on `net`) over on `remote`.
    pub fn get_remote_channel(
        &self,
        net: &Network,
        remote: &Network,
        channel: &str,
    ) -> Option<String> {
        let query = (net.name.clone(), net.to_lower(channel));
        let home = self.get_relay(&query)?;
        if home.0 == remote.name {
            return Some(home.1);
        }
        let db = self.db.lock();
        let entry = db.get(&home)?;
        entry
            .links
            .iter()
            .find(|(netname, _)| *netname == remote.name)
            .map(|(_, chan)| chan.clone())
    }

    /// Whether `uid` is a relay clone (or gone entirely); clones are never
    /// relayed again, which is what prevents loops.
    pub fn is_relay_client(net: &Network, uid: &str) -> bool {
        match net.users.get(uid) {
            Some(user) => user.remote.is_some(),
            None => true,
        }
    }

    /// Home (network, UID) of a relay clone.
    pub fn get_orig_user(net: &Network, uid: &str) -> Option<(String, String)> {
        net.users.get(uid)?.remote.clone()
    }

    /// Resolve a clone on `net` to the user representing the same person on
    /// `target`: the original itself if that's its home, otherwise the
    /// clone there (without spawning one).
    pub fn get_orig_user_on(
        &self,
        world: &Arc<World>,
        net: &Network,
        uid: &str,
        target: &Arc<Network>,
    ) -> Option<String> {
        let (homenet, home_uid) = Self::get_orig_user(net, uid)?;
        if homenet == target.name {
            return Some(home_uid);
        }
        let home = world.get_network(&homenet)?;
        self.get_remote_user(world, &home, target, &home_uid, false, 0)
    }

    // ------------------------------------------------------------------
    // Subserver lifecycle
    // ------------------------------------------------------------------

    /// Spawn the subserver representing `origin` on `target`.
    fn spawn_relay_server(
        &self,
        target: &Arc<Network>,
        origin: &Arc<Network>,
    ) -> Option<String> {
        if !target.is_connected() {
            debug!(
                net = %target.name,
                origin = %origin.name,
                "skipping subserver spawn; network not ready"
            );
            return None;
        }
        let suffix = target.config().relay.server_suffix.clone();
        let suffix = suffix.trim_matches('.');
        let name = format!("{}.{}", origin.name, suffix);
        let desc = format!("Relay network - {}", origin.full_netname());
        match target.protocol.spawn_server(target, &name, &desc) {
            Ok(sid) => {
                if let Some(mut server) = target.servers.get_mut(&sid) {
                    server.remote = Some(origin.name.clone());
                }
                self.relayservers
                    .entry(target.name.clone())
                    .or_default()
                    .insert(origin.name.clone(), sid.clone());
                Some(sid)
            }
            Err(e) => {
                // Probably a jupe or a name conflict; nothing sane to do.
                error!(
                    net = %target.name,
                    origin = %origin.name,
                    error = %e,
                    "failed to spawn relay subserver"
                );
                None
            }
        }
    }

    /// SID of the subserver representing `origin` on `target`, spawning it
    /// if needed.
    pub fn get_remote_sid(
        &self,
        target: &Arc<Network>,
        origin: &Arc<Network>,
        spawn_if_missing: bool,
    ) -> Option<String> {
        let lock = self.spawnlock_servers(target.name.as_str());
        let Some(_guard) = lock.try_lock_for(SPAWN_LOCK_TIMEOUT) else {
            warn!(net = %target.name, "timed out waiting for server spawn lock; abandoning");
            return None;
        };

        let existing = self
            .relayservers
            .get(&target.name)
            .and_then(|map| map.get(&origin.name).cloned());
        let sid = match existing {
            Some(sid) => {
                // Stale entries are holdovers from a netsplit; refresh them.
                let valid = target
                    .servers
                    .get(&sid)
                    .is_some_and(|s| s.remote.as_deref() == Some(origin.name.as_str()));
                if valid {
                    Some(sid)
                } else {
                    debug!(net = %target.name, sid = %sid, "stale relay subserver; respawning");
                    self.spawn_relay_server(target, origin)
                }
            }
            None if spawn_if_missing => self.spawn_relay_server(target, origin),
            None => None,
        };
        sid
    }

    // ------------------------------------------------------------------
    // Clone lifecycle
    // ------------------------------------------------------------------

    fn spawn_relay_user(
        &self,
        world: &Arc<World>,
        home: &Arc<Network>,
        remote: &Arc<Network>,
        uid: &str,
        times_tagged: u32,
    ) -> Option<String> {
        let Some(user) = home.users.get(uid).map(|u| u.clone()) else {
            // Not a valid user, or the network is still initialising.
            return None;
        };
        let nick = normalize_nick(remote, &home.name, &user.nick, times_tagged, "");
        // TS6 rejects long idents.
        let ident: String = user.ident.chars().take(10).collect();
        let host = normalize_host(remote, &user.host);

        let user_modes: Vec<ModeChange> = user
            .modes
            .iter()
            .map(|(letter, arg)| ModeChange {
                adding: true,
                letter: *letter,
                arg: arg.clone(),
            })
            .collect();
        let mut modes = self.get_supported_umodes(home, remote, &user_modes);

        let mut opertype = String::new();
        if user.is_oper() {
            let base = if user.opertype.is_empty() {
                "IRC Operator"
            } else {
                &user.opertype
            };
            opertype = format!("{} (on {})", base, home.full_netname());
            // Remote opers stay hidden so they don't inflate /lusers.
            if world.config().relay.hideoper
                && let Some(hideoper) = remote.umodes().letter("hideoper")
                && !modes.iter().any(|m| m.letter == hideoper)
            {
                modes.push(ModeChange::plus(hideoper, None));
            }
        }

        let rsid = self.get_remote_sid(remote, home, true);
        let Some(rsid) = rsid else {
            error!(
                net = %home.name,
                uid = %uid,
                remote = %remote.name,
                "aborting clone spawn; no working subserver SID"
            );
            return None;
        };

        let show_ips = world.config().relay.show_ips
            && !home.serverdata().relay_no_ips
            && !remote.serverdata().relay_no_ips;
        let (ip, realhost) = if show_ips {
            (user.ip.clone(), Some(user.realhost.clone()))
        } else {
            ("0.0.0.0".to_string(), None)
        };

        let mut opts = SpawnOpts::new(&nick);
        opts.ident = ident;
        opts.host = host;
        opts.realhost = realhost;
        opts.ip = ip;
        opts.realname = user.realname.clone();
        opts.modes = modes;
        opts.opertype = opertype.clone();
        opts.server = Some(rsid);
        opts.ts = Some(user.ts);

        let clone_uid = match remote.protocol.spawn_client(remote, opts) {
            Ok(clone_uid) => clone_uid,
            Err(e) => {
                error!(
                    net = %remote.name,
                    nick = %nick,
                    error = %e,
                    "failed to spawn relay clone"
                );
                return None;
            }
        };
        if let Some(mut clone) = remote.users.get_mut(&clone_uid) {
            clone.remote = Some((home.name.clone(), uid.to_string()));
            clone.opertype = opertype;
        }
        if !user.away.is_empty()
            && let Err(e) = remote.protocol.away(remote, &clone_uid, &user.away)
        {
            debug!(net = %remote.name, error = %e, "failed to mirror away status");
        }

        self.relayusers
            .entry((home.name.clone(), uid.to_string()))
            .or_default()
            .insert(remote.name.clone(), clone_uid.clone());
        Some(clone_uid)
    }

    /// UID of the clone representing `uid` (from `home`) over on `remote`,
    /// spawning one when asked to.
    pub fn get_remote_user(
        &self,
        world: &Arc<World>,
        home: &Arc<Network>,
        remote: &Arc<Network>,
        uid: &str,
        spawn_if_missing: bool,
        times_tagged: u32,
    ) -> Option<String> {
        if !home.is_connected() {
            debug!(net = %home.name, "skipping clone lookup; network not ready");
            return None;
        }
        // Service bots have their own per-network instances.
        if let Some(bot) = world.services.by_uid(home, uid) {
            return bot.uid_on(&remote.name);
        }

        let lock = self.spawnlock(home.name.as_str());
        let Some(_guard) = lock.try_lock_for(SPAWN_LOCK_TIMEOUT) else {
            warn!(net = %home.name, "timed out waiting for user spawn lock; abandoning");
            return None;
        };

        let key = (home.name.clone(), uid.to_string());
        let mut clone = self
            .relayusers
            .get(&key)
            .and_then(|map| map.get(&remote.name).cloned());
        if clone.is_none() && spawn_if_missing {
            clone = self.spawn_relay_user(world, home, remote, uid, times_tagged);
        }

        // Netsplits and state resets can leave stale mappings behind;
        // replace anything that no longer checks out.
        if let Some(u) = &clone {
            let valid = remote
                .users
                .get(u)
                .is_some_and(|c| c.remote == Some((home.name.clone(), uid.to_string())));
            if !valid {
                clone = self.spawn_relay_user(world, home, remote, uid, times_tagged);
            }
        }
        clone
    }

    // ------------------------------------------------------------------
    // Mode translation
    // ------------------------------------------------------------------

    /// Prefix mode letters (valid on `remote`) held by `uid` in `channel`
    /// on `net`. `mlist` looks at an earlier channel state instead.
    pub fn get_prefix_modes_str(
        net: &Network,
        remote: &Network,
        channel: &str,
        uid: &str,
        mlist: Option<&Channel>,
    ) -> String {
        let snapshot;
        let chan = match mlist {
            Some(chan) => chan,
            None => {
                snapshot = net.channel_snapshot(channel);
                match &snapshot {
                    Some(chan) => chan,
                    None => return String::new(),
                }
            }
        };
        if !chan.users.contains(uid) {
            return String::new();
        }
        let remote_cmodes = remote.cmodes();
        chan.get_prefix_modes(uid)
            .into_iter()
            .filter_map(|level| remote_cmodes.prefix_letter(level))
            .collect()
    }

    /// Filter a user mode list down to what the remote network supports
    /// and what the whitelist allows.
    pub fn get_supported_umodes(
        &self,
        net: &Network,
        remote: &Network,
        changes: &[ModeChange],
    ) -> Vec<ModeChange> {
        let our_umodes = net.umodes();
        let their_umodes = remote.umodes();
        let mut out = Vec::new();
        for change in changes {
            let Some(name) = our_umodes.name_of(change.letter) else {
                continue;
            };
            if !WHITELISTED_UMODES.contains(&name) {
                debug!(mode = %change.letter, name = %name, "skipping non-whitelisted umode");
                continue;
            }
            if let Some(their_letter) = their_umodes.letter(name) {
                out.push(ModeChange {
                    adding: change.adding,
                    letter: their_letter,
                    arg: change.arg.clone(),
                });
            }
        }
        out
    }

    /// Translate a channel mode change for `remote`: named-mode mapping,
    /// whitelisting, prefix-argument coercion to clone UIDs, and no-op
    /// suppression against the remote's current state.
    pub fn get_supported_cmodes(
        &self,
        world: &Arc<World>,
        net: &Arc<Network>,
        remote: &Arc<Network>,
        channel: &str,
        changes: &[ModeChange],
    ) -> Vec<ModeChange> {
        let Some(remotechan) = self.get_remote_channel(net, remote, channel) else {
            return Vec::new();
        };

        // Clientbot links sync modes only as far as configured.
        let mut whitelist: &[&str] = WHITELISTED_CMODES;
        if net.protocol.name() == "clientbot" || remote.protocol.name() == "clientbot" {
            match world.config().relay.clientbot_modesync.as_str() {
                "full" => {}
                "half" => whitelist = CLIENTBOT_WHITELISTED_CMODES,
                _ => return Vec::new(),
            }
        }

        let our_cmodes = net.cmodes();
        let their_cmodes = remote.cmodes();
        let remote_state = remote.channel_snapshot(&remotechan);
        let mut out = Vec::new();

        'next: for change in changes {
            let Some(name) = our_cmodes.name_of(change.letter) else {
                debug!(mode = %change.letter, "remote has no name for mode; skipping");
                continue;
            };
            let name = name.to_string();
            if !whitelist.contains(&name.as_str()) {
                debug!(mode = %change.letter, name = %name, "skipping non-whitelisted cmode");
                continue;
            }
            let Some(their_letter) = their_cmodes.letter(&name) else {
                continue;
            };
            let mut arg = change.arg.clone();

            if our_cmodes.is_prefix_letter(change.letter) {
                // Prefix modes name a user; the target must exist on the
                // remote side as a clone (or as the original).
                let Some(target) = &change.arg else {
                    continue;
                };
                // Never sync prefix changes against the relayer bot itself
                // on clientbot links.
                if !net.protocol.caps().can_spawn_clients
                    && net.pseudoclient.read().as_deref() == Some(target.as_str())
                {
                    continue;
                }
                let coerced = self
                    .get_orig_user_on(world, net, target, remote)
                    .or_else(|| self.get_remote_user(world, net, remote, target, false, 0));
                let Some(coerced) = coerced else {
                    // No clone for the target: drop the mode.
                    continue;
                };
                // Setting a prefix that's already held is a no-op.
                if change.adding
                    && let Some(level) = their_cmodes.prefix_level_of_letter(their_letter)
                    && remote_state
                        .as_ref()
                        .is_some_and(|c| c.has_prefix(level, &coerced))
                {
                    continue;
                }
                arg = Some(coerced);
            } else if ["ban", "banexception", "invex"].contains(&name.as_str()) {
                // Don't relay list entries that aren't hostmask-shaped.
                if !arg
                    .as_deref()
                    .is_some_and(crate::protocols::base::is_hostmask)
                {
                    continue;
                }
            }

            // Don't re-set modes already present remotely; some IRCds will
            // happily echo the same mode forever.
            if change.adding
                && let Some(state) = &remote_state
                && state.modes.contains(&(their_letter, arg.clone()))
            {
                continue 'next;
            }

            out.push(ModeChange {
                adding: change.adding,
                letter: their_letter,
                arg,
            });
        }
        out
    }

    // ------------------------------------------------------------------
    // CLAIM
    // ------------------------------------------------------------------

    /// Whether a kick/mode/topic from `sender` passes CLAIM for `channel`.
    ///
    /// Accepted when any of: no relay exists here; this network is the
    /// home; the claim set is empty; this network is in the claim set; the
    /// sender holds halfop or better; the sender is our own client or
    /// server.
    pub fn check_claim(
        &self,
        net: &Network,
        channel: &str,
        sender: &str,
        chanobj: Option<&Channel>,
    ) -> bool {
        let key = net.to_lower(channel);
        let Some(home) = self.get_relay(&(net.name.clone(), key.clone())) else {
            return true;
        };
        if home.0 == net.name {
            return true;
        }
        {
            let db = self.db.lock();
            if let Some(entry) = db.get(&home) {
                if entry.claim.is_empty() || entry.claim.contains(&net.name) {
                    return true;
                }
            } else {
                return true;
            }
        }

        let snapshot;
        let chan = match chanobj {
            Some(chan) => Some(chan),
            None => {
                snapshot = net.channel_snapshot(&key);
                snapshot.as_ref()
            }
        };
        if let Some(chan) = chan
            && chan
                .get_prefix_modes(sender)
                .first()
                .is_some_and(|level| level.is_halfop_plus())
        {
            return true;
        }

        net.is_internal(sender)
    }

    // ------------------------------------------------------------------
    // Join propagation
    // ------------------------------------------------------------------

    /// Relay joins of `users` in `channel` on `net` to every linked
    /// network. `burst` forces SJOIN (with modes) over plain JOIN.
    pub fn relay_joins(
        &self,
        world: &Arc<World>,
        net: &Arc<Network>,
        channel: &str,
        users: &[String],
        ts: i64,
        burst: bool,
    ) {
        let ts = if ts < MIN_SANE_TS { now_ts() } else { ts };
        let key = net.to_lower(channel);

        for remote in world.all_networks() {
            if remote.name == net.name || !remote.is_connected() {
                continue;
            }
            let Some(remotechan) = self.get_remote_channel(net, &remote, &key) else {
                continue;
            };

            let mut queued: Vec<(String, String)> = Vec::new();
            for uid in users {
                if Self::is_relay_client(net, uid) {
                    // Cloning relay clients loops forever.
                    continue;
                }
                let Some(clone) =
                    self.get_remote_user(world, net, &remote, uid, true, 0)
                else {
                    continue;
                };
                // Only join users that aren't already there; repeated
                // SJOINs for one user cause op floods.
                let already = remote
                    .channel_snapshot(&remotechan)
                    .is_some_and(|c| c.users.contains(&clone));
                if already {
                    continue;
                }
                let prefixes = Self::get_prefix_modes_str(net, &remote, &key, uid, None);
                queued.push((prefixes, clone));
            }
            if queued.is_empty() {
                continue;
            }

            // Without a real TS on the source (clientbot), defer to the
            // remote's TS so its mode state takes precedence.
            let send_ts = if net.protocol.caps().has_ts {
                net.channel_snapshot(&key).map(|c| c.ts).unwrap_or(ts)
            } else {
                remote
                    .channel_snapshot(&remotechan)
                    .map(|c| c.ts)
                    .unwrap_or(ts)
            };

            if burst || queued.len() > 1 || !queued[0].0.is_empty() {
                let chan_modes: Vec<ModeChange> = net
                    .channel_snapshot(&key)
                    .map(|c| {
                        c.modes
                            .iter()
                            .map(|(letter, arg)| ModeChange {
                                adding: true,
                                letter: *letter,
                                arg: arg.clone(),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let modes = self.get_supported_cmodes(world, net, &remote, &key, &chan_modes);
                let Some(rsid) = self.get_remote_sid(&remote, net, true) else {
                    continue;
                };
                if let Err(e) = remote.protocol.sjoin(
                    &remote,
                    &rsid,
                    &remotechan,
                    &queued,
                    Some(send_ts),
                    &modes,
                ) {
                    warn!(net = %remote.name, channel = %remotechan, error = %e, "sjoin failed");
                }
            } else if let Err(e) = remote.protocol.join(&remote, &queued[0].1, &remotechan) {
                warn!(net = %remote.name, channel = %remotechan, error = %e, "join failed");
            }
        }
    }

    /// Relay a part (used on delinks), quitting clones that leave their
    /// last shared channel.
    pub fn relay_part(&self, world: &Arc<World>, net: &Arc<Network>, channel: &str, uid: &str) {
        let key = net.to_lower(channel);
        for remote in world.all_networks() {
            if remote.name == net.name || !remote.is_connected() {
                continue;
            }
            let Some(remotechan) = self.get_remote_channel(net, &remote, &key) else {
                continue;
            };
            let Some(clone) = self.get_remote_user(world, net, &remote, uid, false, 0) else {
                continue;
            };
            if let Err(e) = remote
                .protocol
                .part(&remote, &clone, &remotechan, "Channel delinked.")
            {
                debug!(net = %remote.name, error = %e, "relay part failed");
                continue;
            }
            self.quit_if_idle(&remote, net, uid, &clone);
        }
    }

    /// Quit a clone that no longer shares any channel, keeping /lusers
    /// honest.
    pub fn quit_if_idle(
        &self,
        remote: &Arc<Network>,
        home: &Network,
        home_uid: &str,
        clone: &str,
    ) {
        let idle = remote
            .users
            .get(clone)
            .is_some_and(|u| u.channels.is_empty());
        if idle {
            let _ = remote
                .protocol
                .quit(remote, clone, "Left all shared channels.");
            if let Some(mut map) = self
                .relayusers
                .get_mut(&(home.name.clone(), home_uid.to_string()))
            {
                map.remove(&remote.name);
            }
        }
    }

    // ------------------------------------------------------------------
    // Channel initialisation
    // ------------------------------------------------------------------

    /// Merge the local and remote sides of a relay channel: join their
    /// users here, ours there, and sync the topic.
    pub fn initialize_channel(&self, world: &Arc<World>, net: &Arc<Network>, channel: &str) {
        let key = net.to_lower(channel);
        let Some(home) = self.get_relay(&(net.name.clone(), key.clone())) else {
            return;
        };
        debug!(net = %net.name, channel = %key, "initializing relay channel");

        let mut all_links: Vec<(String, String)> = {
            let db = self.db.lock();
            db.get(&home)
                .map(|entry| entry.links.iter().cloned().collect())
                .unwrap_or_default()
        };
        all_links.push(home);

        for (remotenet, remotechan) in all_links {
            if remotenet == net.name {
                continue;
            }
            let Some(remote) = world.get_network(&remotenet) else {
                // Removed from the config; skip.
                continue;
            };
            if !remote.is_connected()
                || self
                    .get_remote_channel(&remote, net, &remotechan)
                    .is_none()
            {
                continue;
            }
            let Some(chan) = remote.channel_snapshot(&remotechan) else {
                continue;
            };
            let users: Vec<String> = chan.users.iter().cloned().collect();
            self.relay_joins(world, &remote, &remotechan, &users, chan.ts, true);

            // Pull their topic across if ours differs and theirs is set.
            if chan.topicset {
                let ours = net.channel_snapshot(&key);
                if ours.as_ref().map(|c| c.topic.clone()) != Some(chan.topic.clone()) {
                    let sid = net.sid();
                    let _ = net.protocol.topic_burst(net, &sid, &key, &chan.topic);
                }
            }
        }

        // And send our side to everyone else.
        if let Some(chan) = net.channel_snapshot(&key) {
            let users: Vec<String> = chan.users.iter().cloned().collect();
            self.relay_joins(world, net, &key, &users, chan.ts, true);
        }

        if let Some(bot) = world.services.get("main") {
            bot.join(net, &[key]);
        }
    }

    /// Re-initialise every relay channel involving `net` (after its burst
    /// finishes).
    pub fn initialize_all(&self, world: &Arc<World>, net: &Arc<Network>) {
        let channels: Vec<String> = {
            let db = self.db.lock();
            db.iter()
                .flat_map(|(home, entry)| {
                    let mut chans = Vec::new();
                    if home.0 == net.name {
                        chans.push(home.1.clone());
                    }
                    for (leafnet, leafchan) in &entry.links {
                        if *leafnet == net.name {
                            chans.push(leafchan.clone());
                        }
                    }
                    chans
                })
                .collect()
        };
        info!(net = %net.name, channels = channels.len(), "initializing all relay channels");
        for channel in channels {
            self.initialize_channel(world, net, &channel);
        }
    }

    /// Tear down the local half of a relay channel (delink/destroy).
    pub fn remove_channel(&self, world: &Arc<World>, net: &Arc<Network>, channel: &str) {
        let key = net.to_lower(channel);
        let autojoins: Vec<String> = net
            .serverdata()
            .channels
            .iter()
            .map(|c| net.to_lower(c))
            .collect();
        if !autojoins.contains(&key) {
            if let Some(bot) = world.services.get("main") {
                if let Some(mut extra) = bot.extra_channels.get_mut(&net.name) {
                    extra.remove(&key);
                }
                if let Some(uid) = bot.uid_on(&net.name) {
                    let _ = net.protocol.part(net, &uid, &key, "Channel delinked.");
                }
            }
        }
        if self.get_relay(&(net.name.clone(), key.clone())).is_none() {
            return;
        }
        let members: Vec<String> = net
            .channel_snapshot(&key)
            .map(|c| c.users.iter().cloned().collect())
            .unwrap_or_default();
        let pseudoclient = net.pseudoclient.read().clone();
        for uid in members {
            if Some(&uid) == pseudoclient.as_ref() {
                continue;
            }
            if !Self::is_relay_client(net, &uid) {
                self.relay_part(world, net, &key, &uid);
            } else {
                let _ = net.protocol.part(net, &uid, &key, "Channel delinked.");
                if let Some((homenet, home_uid)) = Self::get_orig_user(net, &uid) {
                    let idle = net
                        .users
                        .get(&uid)
                        .is_some_and(|u| u.channels.is_empty());
                    if idle {
                        if let Some(mut map) =
                            self.relayusers.get_mut(&(homenet, home_uid))
                        {
                            map.remove(&net.name);
                        }
                        let _ = net
                            .protocol
                            .quit(net, &uid, "Left all shared channels.");
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Administrative operations (link table mutation)
    // ------------------------------------------------------------------

    /// Open a channel for relaying with this network as its home.
    pub fn create_channel(
        &self,
        world: &Arc<World>,
        net: &Arc<Network>,
        channel: &str,
        creator: &str,
    ) -> Result<(), String> {
        let key = net.to_lower(channel);
        if !self.db.lock().create(&net.name, &key, creator) {
            return Err(format!("channel {key} is already part of a relay"));
        }
        self.save_db();
        self.initialize_channel(world, net, &key);
        Ok(())
    }

    /// Link a local channel to a remote home channel.
    pub fn link_channel(
        &self,
        world: &Arc<World>,
        net: &Arc<Network>,
        local_channel: &str,
        home_net: &str,
        home_channel: &str,
    ) -> Result<(), String> {
        let key = net.to_lower(local_channel);
        let home = (home_net.to_string(), home_channel.to_lowercase());
        self.db.lock().link(&home, &net.name, &key)?;
        self.save_db();
        self.initialize_channel(world, net, &key);
        Ok(())
    }

    /// Unlink a local leaf channel from its relay.
    pub fn delink_channel(
        &self,
        world: &Arc<World>,
        net: &Arc<Network>,
        channel: &str,
    ) -> Result<(), String> {
        let key = net.to_lower(channel);
        let removed = self.db.lock().delink(&(net.name.clone(), key.clone()));
        if removed.is_none() {
            return Err(format!("no relay link exists for {key}"));
        }
        self.remove_channel(world, net, &key);
        self.save_db();
        Ok(())
    }

    /// Destroy a home channel, tearing down every leaf.
    pub fn destroy_channel(
        &self,
        world: &Arc<World>,
        net: &Arc<Network>,
        channel: &str,
    ) -> Result<(), String> {
        let key = net.to_lower(channel);
        let entry = self.db.lock().destroy(&(net.name.clone(), key.clone()));
        let Some(entry) = entry else {
            return Err(format!("no relay exists for {key}"));
        };
        self.remove_channel(world, net, &key);
        for (leafnet, leafchan) in entry.links {
            if let Some(leaf) = world.get_network(&leafnet) {
                self.remove_channel(world, &leaf, &leafchan);
            }
        }
        self.save_db();
        Ok(())
    }

    /// Replace the CLAIM list of a home channel.
    pub fn set_claim(
        &self,
        net: &Network,
        channel: &str,
        nets: &[String],
    ) -> Result<(), String> {
        let key = (net.name.clone(), net.to_lower(channel));
        let mut db = self.db.lock();
        let Some(home) = db.get_relay(&key) else {
            return Err(format!("no relay exists for {}", key.1));
        };
        let Some(entry) = db.get_mut(&home) else {
            return Err(format!("no relay exists for {}", key.1));
        };
        entry.claim = nets.iter().cloned().collect();
        drop(db);
        self.save_db();
        Ok(())
    }
}

#[cfg(test)]
mod tests;
