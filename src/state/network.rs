//! The per-network connection context.
//!
//! A `Network` owns one uplink's view of the world: the user/server/channel
//! indexes, the negotiated mode maps, the send queue handle and the
//! protocol driver. Indexes are only mutated from the owning network's
//! event loop; cross-network code snapshots collections before iterating.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::{Config, NetConfig};
use crate::modes::ModeMap;
use crate::protocols::{self, Protocol};
use crate::state::{Casemapping, Channel, Server, User, now_ts};

pub struct Network {
    pub name: String,
    config: RwLock<Arc<Config>>,
    pub protocol: Box<dyn Protocol>,

    pub users: DashMap<String, User>,
    pub servers: DashMap<String, Server>,
    /// Keyed by casemapped channel name.
    pub channels: DashMap<String, Channel>,

    sid: RwLock<String>,
    uplink: RwLock<Option<String>>,
    cmodes: RwLock<ModeMap>,
    umodes: RwLock<ModeMap>,
    casemapping: RwLock<Casemapping>,

    /// End-of-burst reached on the current connection.
    pub connected: AtomicBool,
    /// Shutdown/teardown requested.
    pub aborted: AtomicBool,
    /// Whether the current/last connection attempt reached end-of-burst.
    pub was_successful: AtomicBool,
    /// Unix time of the last line received from the uplink.
    pub last_in: AtomicI64,
    pub start_ts: AtomicI64,
    pub maxnicklen: AtomicUsize,

    /// UID of the main service client on this network, once spawned.
    pub pseudoclient: RwLock<Option<String>>,

    tx: RwLock<Option<mpsc::UnboundedSender<String>>>,
}

impl Network {
    pub fn new(name: &str, config: Arc<Config>) -> Arc<Network> {
        let netconf = config
            .servers
            .get(name)
            .unwrap_or_else(|| panic!("no server block for network {name}"));
        let protocol = protocols::build(&netconf.protocol);
        let net = Arc::new(Network {
            name: name.to_string(),
            config: RwLock::new(config.clone()),
            protocol,
            users: DashMap::new(),
            servers: DashMap::new(),
            channels: DashMap::new(),
            sid: RwLock::new(netconf.sid.clone()),
            uplink: RwLock::new(None),
            cmodes: RwLock::new(ModeMap::rfc1459_cmodes()),
            umodes: RwLock::new(ModeMap::rfc1459_umodes()),
            casemapping: RwLock::new(Casemapping::Rfc1459),
            connected: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            was_successful: AtomicBool::new(false),
            last_in: AtomicI64::new(now_ts()),
            start_ts: AtomicI64::new(now_ts()),
            maxnicklen: AtomicUsize::new(netconf.maxnicklen),
            pseudoclient: RwLock::new(None),
            tx: RwLock::new(None),
        });
        net.init_vars();
        net
    }

    /// Reset all connection-scoped state. Called before every connection
    /// attempt and at construction.
    pub fn init_vars(&self) {
        let conf = self.serverdata();
        self.connected.store(false, Ordering::SeqCst);
        self.was_successful.store(false, Ordering::SeqCst);
        self.last_in.store(now_ts(), Ordering::SeqCst);
        self.start_ts.store(now_ts(), Ordering::SeqCst);
        self.maxnicklen.store(conf.maxnicklen, Ordering::SeqCst);
        *self.uplink.write() = None;
        *self.pseudoclient.write() = None;
        self.users.clear();
        self.channels.clear();
        self.servers.clear();

        // Our own server entry; the protocol driver replaces the mode maps
        // during negotiation.
        let desc = conf
            .serverdesc
            .clone()
            .unwrap_or_else(|| self.config().bot.serverdesc.clone());
        let sid = self.sid();
        if !sid.is_empty() {
            self.servers
                .insert(sid.clone(), Server::new(None, &conf.hostname, true, &desc));
        }
        *self.cmodes.write() = ModeMap::rfc1459_cmodes();
        *self.umodes.write() = ModeMap::rfc1459_umodes();
        *self.casemapping.write() = Casemapping::Rfc1459;
    }

    // ------------------------------------------------------------------
    // Configuration access
    // ------------------------------------------------------------------

    pub fn config(&self) -> Arc<Config> {
        self.config.read().clone()
    }

    /// Replace the live config (rehash).
    pub fn set_config(&self, config: Arc<Config>) {
        *self.config.write() = config;
    }

    pub fn serverdata(&self) -> NetConfig {
        self.config
            .read()
            .servers
            .get(&self.name)
            .cloned()
            .unwrap_or_else(|| panic!("no server block for network {}", self.name))
    }

    /// Display name of this network.
    pub fn full_netname(&self) -> String {
        self.serverdata().netname.unwrap_or_else(|| self.name.clone())
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    pub fn sid(&self) -> String {
        self.sid.read().clone()
    }

    pub fn set_sid(&self, sid: &str) {
        *self.sid.write() = sid.to_string();
    }

    pub fn uplink(&self) -> Option<String> {
        self.uplink.read().clone()
    }

    pub fn set_uplink(&self, sid: &str) {
        *self.uplink.write() = Some(sid.to_string());
    }

    // ------------------------------------------------------------------
    // Mode maps and casemapping
    // ------------------------------------------------------------------

    pub fn cmodes(&self) -> ModeMap {
        self.cmodes.read().clone()
    }

    pub fn umodes(&self) -> ModeMap {
        self.umodes.read().clone()
    }

    pub fn set_cmodes(&self, map: ModeMap) {
        *self.cmodes.write() = map;
    }

    pub fn set_umodes(&self, map: ModeMap) {
        *self.umodes.write() = map;
    }

    pub fn with_cmodes<R>(&self, f: impl FnOnce(&mut ModeMap) -> R) -> R {
        f(&mut self.cmodes.write())
    }

    pub fn with_umodes<R>(&self, f: impl FnOnce(&mut ModeMap) -> R) -> R {
        f(&mut self.umodes.write())
    }

    pub fn casemapping(&self) -> Casemapping {
        *self.casemapping.read()
    }

    pub fn set_casemapping(&self, cm: Casemapping) {
        *self.casemapping.write() = cm;
    }

    pub fn to_lower(&self, s: &str) -> String {
        self.casemapping().to_lower(s)
    }

    // ------------------------------------------------------------------
    // Index lookups
    // ------------------------------------------------------------------

    pub fn nick_to_uid(&self, nick: &str) -> Option<String> {
        let folded = self.to_lower(nick);
        self.users
            .iter()
            .find(|entry| self.to_lower(&entry.nick) == folded)
            .map(|entry| entry.key().clone())
    }

    /// Get or lazily create a channel, returning its casemapped key.
    pub fn get_or_create_channel(&self, name: &str) -> String {
        let key = self.to_lower(name);
        self.channels
            .entry(key.clone())
            .or_insert_with(|| Channel::new(&key, now_ts()));
        key
    }

    pub fn channel_snapshot(&self, name: &str) -> Option<Channel> {
        self.channels.get(&self.to_lower(name)).map(|c| c.clone())
    }

    pub fn is_internal_server(&self, sid: &str) -> bool {
        self.servers.get(sid).is_some_and(|s| s.internal)
    }

    pub fn is_internal_client(&self, uid: &str) -> bool {
        self.users
            .get(uid)
            .map(|u| u.server.clone())
            .is_some_and(|sid| self.is_internal_server(&sid))
    }

    pub fn is_internal(&self, id: &str) -> bool {
        self.is_internal_client(id) || self.is_internal_server(id)
    }

    /// Nick of a user, name of a server, or the raw ID as a fallback.
    pub fn get_friendly_name(&self, id: &str) -> String {
        if let Some(u) = self.users.get(id) {
            return u.nick.clone();
        }
        if let Some(s) = self.servers.get(id) {
            return s.name.clone();
        }
        id.to_string()
    }

    /// Hostmask "nick!ident@host" of a user, for logging and ban checks.
    pub fn get_hostmask(&self, uid: &str) -> String {
        match self.users.get(uid) {
            Some(u) => format!("{}!{}@{}", u.nick, u.ident, u.host),
            None => format!("<unknown>!<unknown>@{}", self.name),
        }
    }

    // ------------------------------------------------------------------
    // Mutation helpers
    // ------------------------------------------------------------------

    /// Symmetrically add a user to a channel.
    pub fn add_user_to_channel(&self, uid: &str, channel: &str) {
        let key = self.get_or_create_channel(channel);
        if let Some(mut chan) = self.channels.get_mut(&key) {
            chan.users.insert(uid.to_string());
        }
        if let Some(mut user) = self.users.get_mut(uid) {
            user.channels.insert(key);
        }
    }

    /// Symmetrically remove a user from a channel, destroying the channel
    /// when its last non-permanent member leaves.
    pub fn remove_user_from_channel(&self, uid: &str, channel: &str) {
        let key = self.to_lower(channel);
        if let Some(mut chan) = self.channels.get_mut(&key) {
            chan.remove_user(uid);
        }
        if let Some(mut user) = self.users.get_mut(uid) {
            user.channels.remove(&key);
        }
        self.gc_channel(&key);
    }

    fn gc_channel(&self, key: &str) {
        let permanent = self.cmodes().letter("permanent");
        self.channels.remove_if(key, |_, chan| {
            chan.users.is_empty()
                && !permanent.is_some_and(|p| chan.modes.iter().any(|(l, _)| *l == p))
        });
    }

    /// Remove a user from every index. Returns the removed record.
    pub fn remove_client(&self, uid: &str) -> Option<User> {
        let (_, user) = self.users.remove(uid)?;
        for chan_name in &user.channels {
            if let Some(mut chan) = self.channels.get_mut(chan_name) {
                chan.remove_user(uid);
            }
            self.gc_channel(chan_name);
        }
        if let Some(mut server) = self.servers.get_mut(&user.server) {
            server.users.remove(uid);
        }
        debug!(net = %self.name, uid = %uid, nick = %user.nick, "removed client");
        Some(user)
    }

    // ------------------------------------------------------------------
    // Send queue
    // ------------------------------------------------------------------

    pub fn attach_sender(&self, tx: mpsc::UnboundedSender<String>) {
        *self.tx.write() = Some(tx);
    }

    pub fn detach_sender(&self) {
        *self.tx.write() = None;
    }

    /// Queue a line for sending. Embedded newlines are stripped so a hostile
    /// argument cannot smuggle extra commands onto the wire.
    pub fn send(&self, line: &str) {
        let clean: String = line.chars().filter(|c| *c != '\n' && *c != '\r').collect();
        if let Some(tx) = &*self.tx.read() {
            if tx.send(clean).is_err() {
                debug!(net = %self.name, "send queue closed; dropping line");
            }
        } else {
            debug!(net = %self.name, "not connected; dropping line");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send a PRIVMSG/NOTICE to a local target from our main service client
    /// (or, failing that, our server).
    pub fn msg(&self, target: &str, text: &str, notice: bool) {
        let source = self.pseudoclient.read().clone();
        let result = match (&source, notice) {
            (Some(uid), true) => self.protocol.notice(self, uid, target, text),
            (Some(uid), false) => self.protocol.message(self, uid, target, text),
            (None, _) => {
                let sid = self.sid();
                self.protocol.notice(self, &sid, target, text)
            }
        };
        if let Err(e) = result {
            debug!(net = %self.name, to = %target, error = %e, "dropping service message");
        }
    }
}

// ----------------------------------------------------------------------
// Test support
// ----------------------------------------------------------------------

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::atomic::AtomicU64;

    static UID_COUNTER: AtomicU64 = AtomicU64::new(0);

    /// Minimal config carrying one network of the given name per entry;
    /// entries are (name, protocol) pairs.
    pub fn test_config_protocols(entries: &[(&str, &str)]) -> Arc<Config> {
        let mut servers = String::new();
        for (name, protocol) in entries {
            servers.push_str(&format!(
                r#"
                [servers.{name}]
                ip = "127.0.0.1"
                port = 6667
                protocol = "{protocol}"
                sendpass = "linkage"
                recvpass = "linkage"
                hostname = "{name}.relay.example"
                sid = "9ZZ"
                sidrange = "9##"
                netname = "{name}"
                "#
            ));
        }
        let raw = format!("[bot]\nnick = \"slink\"\n{servers}");
        Arc::new(toml::from_str(&raw).expect("test config parses"))
    }

    pub fn test_config(names: &[&str]) -> Arc<Config> {
        let entries: Vec<(&str, &str)> = names.iter().map(|n| (*n, "stub")).collect();
        test_config_protocols(&entries)
    }

    /// A network with our internal server registered and a discarded send
    /// queue attached.
    pub fn test_net_with_protocol(name: &str, protocol: &str) -> Arc<Network> {
        let net = Network::new(name, test_config_protocols(&[(name, protocol)]));
        // Sent lines go nowhere, but sending must not error.
        let (tx, rx) = mpsc::unbounded_channel();
        std::mem::forget(rx);
        net.attach_sender(tx);
        net.connected.store(true, Ordering::SeqCst);
        net
    }

    /// A stub-protocol network.
    pub fn test_net(name: &str) -> Arc<Network> {
        test_net_with_protocol(name, "stub")
    }

    impl Network {
        /// Introduce an external test server.
        pub fn spawn_test_server(&self, sid: &str, internal: bool) {
            if !self.servers.contains_key(sid) {
                self.servers.insert(
                    sid.to_string(),
                    Server::new(None, &format!("{sid}.example"), internal, "test server"),
                );
            }
        }

        /// Introduce a user on the given (auto-created, external) server.
        pub fn spawn_test_user(&self, nick: &str, sid: &str) -> String {
            self.spawn_test_server(sid, false);
            let n = UID_COUNTER.fetch_add(1, Ordering::Relaxed);
            let uid = format!("{sid}TT{n:04}");
            let mut user = User::new(nick, now_ts(), &uid, sid);
            user.ident = nick.to_ascii_lowercase();
            user.host = "user.example".to_string();
            user.realhost = "user.example".to_string();
            self.users.insert(uid.clone(), user);
            if let Some(mut server) = self.servers.get_mut(sid) {
                server.users.insert(uid.clone());
            }
            uid
        }

        /// Create a channel at a fixed TS with the given members.
        pub fn spawn_test_channel(&self, name: &str, ts: i64, users: &[&str]) {
            let key = self.get_or_create_channel(name);
            if let Some(mut chan) = self.channels.get_mut(&key) {
                chan.ts = ts;
            }
            for uid in users {
                self.add_user_to_channel(uid, name);
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_membership_is_symmetric() {
            let net = test_net("testnet");
            let uid = net.spawn_test_user("gl", "001");
            net.spawn_test_channel("#Chan", 100, &[&uid]);
            let chan = net.channel_snapshot("#chan").unwrap();
            assert!(chan.users.contains(&uid));
            assert!(net.users.get(&uid).unwrap().channels.contains("#chan"));

            net.remove_user_from_channel(&uid, "#CHAN");
            assert!(net.channel_snapshot("#chan").is_none(), "empty channel GCed");
            assert!(net.users.get(&uid).unwrap().channels.is_empty());
        }

        #[test]
        fn test_remove_client_cleans_all_indexes() {
            let net = test_net("testnet");
            let uid = net.spawn_test_user("gl", "001");
            let other = net.spawn_test_user("alice", "001");
            net.spawn_test_channel("#chan", 100, &[&uid, &other]);
            net.remove_client(&uid);
            assert!(!net.users.contains_key(&uid));
            assert!(!net.servers.get("001").unwrap().users.contains(&uid));
            let chan = net.channel_snapshot("#chan").unwrap();
            assert!(!chan.users.contains(&uid));
            assert!(chan.users.contains(&other));
        }

        #[test]
        fn test_nick_to_uid_respects_casemapping() {
            let net = test_net("testnet");
            let uid = net.spawn_test_user("GL[away]", "001");
            assert_eq!(net.nick_to_uid("gl{AWAY}"), Some(uid));
            assert_eq!(net.nick_to_uid("someone"), None);
        }

        #[test]
        fn test_internal_flags() {
            let net = test_net("testnet");
            let ours = net.spawn_test_user("svc", "9ZZ");
            let theirs = net.spawn_test_user("gl", "001");
            assert!(net.is_internal_client(&ours));
            assert!(!net.is_internal_client(&theirs));
            assert!(net.is_internal_server("9ZZ"));
            assert!(!net.is_internal_server("001"));
        }
    }
}
