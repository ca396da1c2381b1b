//! Clientbot: a driver that links as a plain IRC client.
//!
//! There is no S2S protocol here, so the driver synthesises pseudo UIDs and
//! SIDs (PUID/PSID) for every nick and server it sees, letting the rest of
//! the daemon treat the connection like any other network. Membership is
//! learned from NAMES, user details are backfilled from WHO, and IRCv3
//! capability negotiation with SASL PLAIN/EXTERNAL is supported.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{OutgoingError, OutgoingResult, ProtocolError};
use crate::hooks::{HookEvent, HookPayload};
use crate::ids::PseudoIdGenerator;
use crate::modes::{self, ModeChange, join_modes};
use crate::protocols::{
    ClientField, Protocol, ProtocolCaps, SpawnOpts, base, require_internal,
    require_internal_client, require_internal_server,
};
use crate::state::{Casemapping, Network, PrefixLevel, Server, now_ts};

/// IRCv3 capabilities we know how to use.
const WANTED_CAPS: &[&str] = &["multi-prefix", "sasl", "away-notify", "account-notify"];

/// Seconds before an unacknowledged kick triggers a NAMES resync.
const KICK_ACK_SECS: i64 = 10;

struct ClientbotState {
    caps_available: HashMap<String, String>,
    caps_enabled: HashSet<String>,
    /// Users collected from WHO replies, flushed as a burst on 315.
    who_received: HashSet<String>,
    /// Channel -> resync deadline for kicks we haven't seen echoed.
    kick_queue: HashMap<String, i64>,
    has_eob: bool,
    /// PSID of the server we're connected to.
    uplink_psid: Option<String>,
    negotiating: bool,
}

impl ClientbotState {
    fn fresh() -> Self {
        Self {
            caps_available: HashMap::new(),
            caps_enabled: HashSet::new(),
            who_received: HashSet::new(),
            kick_queue: HashMap::new(),
            has_eob: false,
            uplink_psid: None,
            negotiating: false,
        }
    }
}

pub struct ClientbotProtocol {
    caps: ProtocolCaps,
    uidgen: PseudoIdGenerator,
    sidgen: PseudoIdGenerator,
    state: Mutex<ClientbotState>,
}

impl ClientbotProtocol {
    pub fn new() -> Self {
        Self {
            caps: ProtocolCaps {
                can_spawn_clients: false,
                has_ts: false,
                can_host_relay: false,
                can_track_servers: false,
                slash_in_nicks: true,
                slash_in_hosts: true,
                underscore_in_hosts: true,
                has_statusmsg: false,
                needs_eob_synth: false,
            },
            uidgen: PseudoIdGenerator::new("PUID"),
            sidgen: PseudoIdGenerator::new("PSID"),
            state: Mutex::new(ClientbotState::fresh()),
        }
    }

    /// The PSID of the uplink, created on first use.
    fn uplink_psid(&self, net: &Network) -> String {
        {
            let state = self.state.lock();
            if let Some(psid) = &state.uplink_psid {
                return psid.clone();
            }
        }
        let psid = self.sidgen.next_id("uplink");
        net.servers
            .insert(psid.clone(), Server::new(None, &net.serverdata().ip, false, ""));
        net.set_uplink(&psid);
        self.state.lock().uplink_psid = Some(psid.clone());
        psid
    }

    /// Map a nick to its PUID, creating the user on first sighting.
    fn get_uid(&self, net: &Network, nick: &str, ident: Option<&str>, host: Option<&str>) -> String {
        if let Some(uid) = net.nick_to_uid(nick) {
            if let (Some(ident), Some(mut user)) = (ident, net.users.get_mut(&uid)) {
                user.ident = ident.to_string();
            }
            if let (Some(host), Some(mut user)) = (host, net.users.get_mut(&uid)) {
                user.host = host.to_string();
            }
            return uid;
        }
        let server = self.uplink_psid(net);
        let uid = self.uidgen.next_id(nick);
        base::register_user(
            net,
            &server,
            &uid,
            nick,
            now_ts(),
            ident.unwrap_or("unknown"),
            host.unwrap_or("unknown.host"),
            host.unwrap_or("unknown.host"),
            "0.0.0.0",
            nick,
        );
        uid
    }

    /// Split an n!u@h prefix into its parts.
    fn split_prefix(prefix: &str) -> (String, Option<String>, Option<String>) {
        match prefix.split_once('!') {
            Some((nick, rest)) => match rest.split_once('@') {
                Some((ident, host)) => (
                    nick.to_string(),
                    Some(ident.to_string()),
                    Some(host.to_string()),
                ),
                None => (nick.to_string(), Some(rest.to_string()), None),
            },
            None => (prefix.to_string(), None, None),
        }
    }

    fn finish_cap_negotiation(&self, net: &Network) {
        let mut state = self.state.lock();
        if state.negotiating {
            state.negotiating = false;
            net.send("CAP END");
        }
    }

    fn start_sasl(&self, net: &Network) -> bool {
        let conf = net.serverdata();
        if conf.sasl_user.is_none() && conf.sasl_mech != "EXTERNAL" {
            return false;
        }
        net.send(&format!("AUTHENTICATE {}", conf.sasl_mech.to_uppercase()));
        true
    }

    /// End-of-MOTD: run autoperform, join configured channels and declare
    /// the network ready.
    fn handle_eob(&self, net: &Network, sender: &str) -> Vec<HookEvent> {
        {
            let mut state = self.state.lock();
            if state.has_eob {
                return Vec::new();
            }
            state.has_eob = true;
        }
        let conf = net.serverdata();
        for line in &conf.autoperform {
            net.send(line);
        }
        for channel in &conf.channels {
            net.send(&format!("JOIN {channel}"));
        }
        net.connected.store(true, Ordering::SeqCst);
        info!(net = %net.name, "clientbot registered with uplink");
        vec![HookEvent::new(sender, HookPayload::Endburst)]
    }

    fn handle_cap(&self, net: &Network, args: &[String]) {
        // <- :server CAP * LS :multi-prefix sasl=PLAIN,EXTERNAL ...
        let Some(subcommand) = args.get(1) else {
            return;
        };
        match subcommand.as_str() {
            "LS" => {
                let offered = base::parse_capabilities(&args.last().cloned().unwrap_or_default());
                let mut state = self.state.lock();
                state.caps_available.extend(offered.clone());
                let wanted: Vec<&str> = WANTED_CAPS
                    .iter()
                    .copied()
                    .filter(|cap| state.caps_available.contains_key(*cap))
                    .collect();
                drop(state);
                if wanted.is_empty() {
                    self.finish_cap_negotiation(net);
                } else {
                    net.send(&format!("CAP REQ :{}", wanted.join(" ")));
                }
            }
            "ACK" => {
                let acked: Vec<String> = args
                    .last()
                    .map(|s| s.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default();
                let has_sasl = acked.iter().any(|c| c == "sasl");
                self.state.lock().caps_enabled.extend(acked);
                if !(has_sasl && self.start_sasl(net)) {
                    self.finish_cap_negotiation(net);
                }
            }
            "NAK" => self.finish_cap_negotiation(net),
            "NEW" => {
                // Late capability advertisement; take sasl if it appears.
                let offered = base::parse_capabilities(&args.last().cloned().unwrap_or_default());
                self.state.lock().caps_available.extend(offered);
            }
            "DEL" => {
                let dropped: Vec<String> = args
                    .last()
                    .map(|s| s.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default();
                let mut state = self.state.lock();
                for cap in dropped {
                    state.caps_available.remove(&cap);
                    state.caps_enabled.remove(&cap);
                }
            }
            _ => {}
        }
    }

    fn handle_authenticate(&self, net: &Network, args: &[String]) {
        if args.first().map(String::as_str) != Some("+") {
            return;
        }
        let conf = net.serverdata();
        match conf.sasl_mech.to_uppercase().as_str() {
            "PLAIN" => {
                let (Some(user), Some(pass)) = (&conf.sasl_user, &conf.sasl_pass) else {
                    warn!(net = %net.name, "sasl PLAIN configured without credentials");
                    net.send("AUTHENTICATE *");
                    return;
                };
                let blob = BASE64.encode(format!("{user}\0{user}\0{pass}"));
                net.send(&format!("AUTHENTICATE {blob}"));
            }
            "EXTERNAL" => net.send("AUTHENTICATE +"),
            other => {
                warn!(net = %net.name, mech = %other, "unsupported SASL mechanism");
                net.send("AUTHENTICATE *");
            }
        }
    }

    fn handle_005(&self, net: &Network, args: &[String]) {
        if args.len() < 2 {
            return;
        }
        let caps = base::parse_capabilities(&args[1..].join(" "));
        if let Some(cm) = caps.get("CASEMAPPING")
            && let Some(parsed) = Casemapping::parse(cm)
        {
            net.set_casemapping(parsed);
        }
        if let Some(len) = caps.get("NICKLEN")
            && let Ok(len) = len.parse::<usize>()
        {
            net.maxnicklen.store(len, Ordering::SeqCst);
        }
        if let Some(chanmodes) = caps.get("CHANMODES") {
            let classes: Vec<&str> = chanmodes.split(',').collect();
            if classes.len() == 4 {
                net.with_cmodes(|map| {
                    map.type_a = classes[0].to_string();
                    map.type_b = classes[1].to_string();
                    map.type_c = classes[2].to_string();
                    map.type_d = classes[3].to_string();
                });
            }
        }
        if let Some(prefix) = caps.get("PREFIX") {
            let pairs = base::parse_prefixes(prefix);
            let prefixes: Vec<(PrefixLevel, char, char)> = pairs
                .into_iter()
                .filter_map(|(letter, symbol)| {
                    let level = match letter {
                        'q' => Some(PrefixLevel::Owner),
                        'a' => Some(PrefixLevel::Admin),
                        'o' => Some(PrefixLevel::Op),
                        'h' => Some(PrefixLevel::Halfop),
                        'v' => Some(PrefixLevel::Voice),
                        _ => None,
                    };
                    level.map(|l| (l, letter, symbol))
                })
                .collect();
            if !prefixes.is_empty() {
                net.with_cmodes(|map| map.set_prefixes(&prefixes));
            }
        }
    }

    fn handle_names_reply(&self, net: &Network, args: &[String]) {
        // <- :server 353 ournick = #chan :@nick1 +nick2 nick3
        let (Some(channel), Some(names)) = (args.get(2), args.last()) else {
            return;
        };
        let key = net.get_or_create_channel(channel);
        let map = net.cmodes();
        for entry in names.split_whitespace() {
            let nick: String = entry
                .chars()
                .skip_while(|c| map.prefix_level_of_symbol(*c).is_some())
                .collect();
            if nick.is_empty() {
                continue;
            }
            let uid = self.get_uid(net, &nick, None, None);
            net.add_user_to_channel(&uid, &key);
            let changes: Vec<ModeChange> = entry
                .chars()
                .take_while(|c| map.prefix_level_of_symbol(*c).is_some())
                .filter_map(|c| {
                    map.prefix_level_of_symbol(c)
                        .and_then(|level| map.prefix_letter(level))
                })
                .map(|letter| ModeChange::plus(letter, Some(uid.as_str())))
                .collect();
            modes::apply_modes(net, &key, &changes);
        }
    }

    fn handle_who_reply(&self, net: &Network, args: &[String]) {
        // <- :server 352 ournick #chan ident host server nick H@ :0 realname
        if args.len() < 7 {
            return;
        }
        let (ident, host, nick, flags) = (&args[2], &args[3], &args[5], &args[6]);
        let uid = self.get_uid(net, nick, Some(ident), Some(host));
        let track_oper = net.serverdata().clientbot_track_oper;
        if let Some(mut user) = net.users.get_mut(&uid) {
            if let Some(realname) = args.last() {
                // "<hopcount> <realname>"
                if let Some((_, realname)) = realname.split_once(' ') {
                    user.realname = realname.to_string();
                }
            }
            user.away = if flags.contains('G') {
                "Away".to_string()
            } else {
                String::new()
            };
            if track_oper {
                if flags.contains('*') {
                    user.opertype = "IRC Operator".to_string();
                    user.modes.insert(('o', None));
                } else {
                    user.opertype.clear();
                    user.modes.retain(|(letter, _)| *letter != 'o');
                }
            }
        }
        self.state.lock().who_received.insert(uid);
    }

    fn handle_end_of_who(&self, net: &Network, args: &[String]) -> Vec<HookEvent> {
        // <- :server 315 ournick #chan :End of /WHO list.
        let Some(channel) = args.get(1) else {
            return Vec::new();
        };
        let key = net.to_lower(channel);
        let users: Vec<String> = {
            let mut state = self.state.lock();
            state.kick_queue.remove(&key);
            state.who_received.drain().collect()
        };
        if users.is_empty() || !key.starts_with('#') {
            return Vec::new();
        }
        let ts = net.channel_snapshot(&key).map(|c| c.ts).unwrap_or_else(now_ts);
        let uplink = self.uplink_psid(net);
        vec![HookEvent::renamed(
            &uplink,
            "JOIN",
            HookPayload::Join {
                channel: key,
                users,
                ts,
                modes: Vec::new(),
                burst: true,
                channeldata: None,
            },
        )]
    }
}

impl Default for ClientbotProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol for ClientbotProtocol {
    fn name(&self) -> &'static str {
        "clientbot"
    }

    fn caps(&self) -> &ProtocolCaps {
        &self.caps
    }

    fn post_connect(&self, net: &Network) -> Result<(), ProtocolError> {
        *self.state.lock() = ClientbotState::fresh();
        net.set_casemapping(Casemapping::Ascii);
        let conf = net.serverdata();
        let bot = net.config().bot.clone();

        // Our own virtual server, hosting the bot and any virtual clients.
        // A previous connection's PSID entry is stale; drop it.
        let old_sid = net.sid();
        if !old_sid.is_empty() {
            net.servers.remove(&old_sid);
        }
        let psid = self.sidgen.next_id("self");
        net.set_sid(&psid);
        net.servers.insert(
            psid.clone(),
            Server::new(None, "slinkd.int", true, &bot.serverdesc),
        );

        self.state.lock().negotiating = true;
        net.send("CAP LS 302");
        net.send(&format!("NICK {}", bot.nick));
        net.send(&format!("USER {} 8 * :{}", bot.ident, bot.realname));
        Ok(())
    }

    fn handle_line(
        &self,
        net: &Network,
        line: &str,
    ) -> Result<Vec<HookEvent>, ProtocolError> {
        let Some((sender, command, args)) = base::split_line(line) else {
            return Ok(Vec::new());
        };
        match command.as_str() {
            "ERROR" => {
                return Err(ProtocolError::UplinkError(
                    args.last().cloned().unwrap_or_default(),
                ));
            }
            "PING" => {
                net.send(&format!(
                    "PONG :{}",
                    args.last().cloned().unwrap_or_default()
                ));
                return Ok(Vec::new());
            }
            "PONG" => return Ok(Vec::new()),
            "CAP" => {
                self.handle_cap(net, &args);
                return Ok(Vec::new());
            }
            "AUTHENTICATE" => {
                self.handle_authenticate(net, &args);
                return Ok(Vec::new());
            }
            "903" => {
                debug!(net = %net.name, "SASL authentication successful");
                self.finish_cap_negotiation(net);
                return Ok(Vec::new());
            }
            "902" | "904" | "905" | "906" | "907" => {
                warn!(net = %net.name, numeric = %command, "SASL authentication failed");
                self.finish_cap_negotiation(net);
                return Ok(Vec::new());
            }
            // Fatal registration errors.
            "463" | "464" | "465" => {
                return Err(ProtocolError::UplinkError(
                    args.last().cloned().unwrap_or_default(),
                ));
            }
            _ => {}
        }

        let uplink = self.uplink_psid(net);

        match command.as_str() {
            "001" => {
                // Our nick is confirmed; materialise the bot user.
                let nick = args.first().cloned().unwrap_or_default();
                if let Some(raw) = &sender
                    && let Some(mut server) = net.servers.get_mut(&uplink)
                {
                    server.name = raw.clone();
                }
                let uid = self.uidgen.next_id(&nick);
                let conf = net.config();
                base::register_user(
                    net,
                    &net.sid(),
                    &uid,
                    &nick,
                    now_ts(),
                    &conf.bot.ident,
                    "unknown.host",
                    "unknown.host",
                    "0.0.0.0",
                    &conf.bot.realname,
                );
                *net.pseudoclient.write() = Some(uid);
                Ok(Vec::new())
            }
            "005" => {
                self.handle_005(net, &args);
                Ok(Vec::new())
            }
            "376" | "422" => Ok(self.handle_eob(net, &uplink)),
            "353" => {
                self.handle_names_reply(net, &args);
                Ok(Vec::new())
            }
            "352" => {
                self.handle_who_reply(net, &args);
                Ok(Vec::new())
            }
            "315" => Ok(self.handle_end_of_who(net, &args)),
            "433" => {
                // Nick in use during registration; mangle and retry.
                if !self.state.lock().has_eob {
                    let taken = args.get(1).cloned().unwrap_or_default();
                    net.send(&format!("NICK {taken}_"));
                }
                Ok(Vec::new())
            }
            "301" => {
                // RPL_AWAY for someone we queried.
                let (Some(nick), Some(text)) = (args.get(1), args.last()) else {
                    return Ok(Vec::new());
                };
                let uid = self.get_uid(net, nick, None, None);
                if let Some(mut user) = net.users.get_mut(&uid) {
                    user.away = text.clone();
                }
                Ok(Vec::new())
            }
            "JOIN" => {
                let Some(raw) = sender else {
                    return Ok(Vec::new());
                };
                let (nick, ident, host) = Self::split_prefix(&raw);
                let uid = self.get_uid(net, &nick, ident.as_deref(), host.as_deref());
                let Some(channel) = args.first() else {
                    return Ok(Vec::new());
                };
                let key = net.get_or_create_channel(channel);
                net.add_user_to_channel(&uid, &key);
                if Some(uid.clone()) == *net.pseudoclient.read() {
                    // Sync membership and details behind us.
                    net.send(&format!("WHO {key}"));
                    Ok(Vec::new())
                } else {
                    let ts = net.channel_snapshot(&key).map(|c| c.ts).unwrap_or_else(now_ts);
                    Ok(vec![HookEvent::new(
                        &uid,
                        HookPayload::Join {
                            channel: key,
                            users: vec![uid.clone()],
                            ts,
                            modes: Vec::new(),
                            burst: false,
                            channeldata: None,
                        },
                    )])
                }
            }
            "PART" => {
                let Some(raw) = sender else {
                    return Ok(Vec::new());
                };
                let (nick, ident, host) = Self::split_prefix(&raw);
                let uid = self.get_uid(net, &nick, ident.as_deref(), host.as_deref());
                let Some(chans) = args.first() else {
                    return Ok(Vec::new());
                };
                let channels: Vec<String> = chans.split(',').map(|c| net.to_lower(c)).collect();
                for chan in &channels {
                    net.remove_user_from_channel(&uid, chan);
                }
                let text = args.get(1).cloned().unwrap_or_default();
                Ok(vec![HookEvent::new(
                    &uid,
                    HookPayload::Part { channels, text },
                )])
            }
            "QUIT" => {
                let Some(raw) = sender else {
                    return Ok(Vec::new());
                };
                let (nick, _, _) = Self::split_prefix(&raw);
                let Some(uid) = net.nick_to_uid(&nick) else {
                    return Ok(Vec::new());
                };
                net.remove_client(&uid);
                Ok(vec![HookEvent::new(
                    &uid,
                    HookPayload::Quit {
                        text: args.first().cloned().unwrap_or_default(),
                    },
                )])
            }
            "KICK" => {
                let Some(raw) = sender else {
                    return Ok(Vec::new());
                };
                let (nick, ident, host) = Self::split_prefix(&raw);
                let kicker = self.get_uid(net, &nick, ident.as_deref(), host.as_deref());
                let (Some(channel), Some(target_nick)) = (args.first(), args.get(1)) else {
                    return Ok(Vec::new());
                };
                let key = net.to_lower(channel);
                let target = self.get_uid(net, target_nick, None, None);
                net.remove_user_from_channel(&target, &key);
                self.state.lock().kick_queue.remove(&key);
                Ok(vec![HookEvent::new(
                    &kicker,
                    HookPayload::Kick {
                        channel: key,
                        target,
                        text: args.get(2).cloned().unwrap_or_default(),
                    },
                )])
            }
            "NICK" => {
                let Some(raw) = sender else {
                    return Ok(Vec::new());
                };
                let (nick, _, _) = Self::split_prefix(&raw);
                let Some(uid) = net.nick_to_uid(&nick) else {
                    return Ok(Vec::new());
                };
                let Some(newnick) = args.first().cloned() else {
                    return Ok(Vec::new());
                };
                let ts = now_ts();
                if let Some(mut user) = net.users.get_mut(&uid) {
                    user.nick = newnick.clone();
                    user.nick_ts = ts;
                }
                Ok(vec![HookEvent::new(
                    &uid,
                    HookPayload::Nick {
                        newnick,
                        oldnick: nick,
                        ts,
                    },
                )])
            }
            "MODE" => {
                let Some(raw) = sender else {
                    return Ok(Vec::new());
                };
                let (nick, ident, host) = Self::split_prefix(&raw);
                let Some(target) = args.first() else {
                    return Ok(Vec::new());
                };
                if !target.starts_with('#') || args.len() < 2 {
                    return Ok(Vec::new());
                }
                let source = if nick.contains('.') {
                    uplink.clone()
                } else {
                    self.get_uid(net, &nick, ident.as_deref(), host.as_deref())
                };
                let key = net.to_lower(target);
                let oldchan = net.channel_snapshot(&key);
                let mode_args: Vec<&str> = args[1..].iter().map(String::as_str).collect();
                let parsed = modes::parse_modes(net, &key, &mode_args);
                modes::apply_modes(net, &key, &parsed);
                Ok(vec![HookEvent::new(
                    &source,
                    HookPayload::Mode {
                        target: key,
                        modes: parsed,
                        channeldata: oldchan,
                    },
                )])
            }
            "TOPIC" => {
                let Some(raw) = sender else {
                    return Ok(Vec::new());
                };
                let (nick, ident, host) = Self::split_prefix(&raw);
                let source = self.get_uid(net, &nick, ident.as_deref(), host.as_deref());
                let Some(channel) = args.first() else {
                    return Ok(Vec::new());
                };
                let key = net.to_lower(channel);
                let topic = args.last().cloned().unwrap_or_default();
                let oldtopic = net.channel_snapshot(&key).map(|c| c.topic);
                if let Some(mut chan) = net.channels.get_mut(&key) {
                    chan.topic = topic.clone();
                    chan.topicset = true;
                }
                Ok(vec![HookEvent::new(
                    &source,
                    HookPayload::Topic {
                        channel: key,
                        text: topic,
                        oldtopic,
                        setter: nick,
                        ts: now_ts(),
                    },
                )])
            }
            "PRIVMSG" | "NOTICE" => {
                let Some(raw) = sender else {
                    return Ok(Vec::new());
                };
                let (nick, ident, host) = Self::split_prefix(&raw);
                let (Some(target), Some(text)) = (args.first(), args.get(1)) else {
                    return Ok(Vec::new());
                };
                let source = if nick.contains('.') && ident.is_none() {
                    uplink.clone()
                } else {
                    self.get_uid(net, &nick, ident.as_deref(), host.as_deref())
                };
                // Private messages land on the bot's PUID.
                let target = if target.starts_with('#') {
                    net.to_lower(target)
                } else {
                    net.pseudoclient
                        .read()
                        .clone()
                        .unwrap_or_else(|| target.clone())
                };
                let payload = if command == "NOTICE" {
                    HookPayload::Notice {
                        target,
                        text: text.clone(),
                    }
                } else {
                    HookPayload::Privmsg {
                        target,
                        text: text.clone(),
                    }
                };
                Ok(vec![HookEvent::new(&source, payload)])
            }
            "AWAY" => {
                // away-notify extension.
                let Some(raw) = sender else {
                    return Ok(Vec::new());
                };
                let (nick, _, _) = Self::split_prefix(&raw);
                let Some(uid) = net.nick_to_uid(&nick) else {
                    return Ok(Vec::new());
                };
                let text = args.first().cloned().unwrap_or_default();
                if let Some(mut user) = net.users.get_mut(&uid) {
                    user.away = text.clone();
                }
                Ok(vec![HookEvent::new(&uid, HookPayload::Away { text })])
            }
            "ACCOUNT" => {
                // account-notify extension: "*" means logout.
                let Some(raw) = sender else {
                    return Ok(Vec::new());
                };
                let (nick, _, _) = Self::split_prefix(&raw);
                let Some(uid) = net.nick_to_uid(&nick) else {
                    return Ok(Vec::new());
                };
                let account = args
                    .first()
                    .filter(|a| a.as_str() != "*")
                    .cloned()
                    .unwrap_or_default();
                if let Some(mut user) = net.users.get_mut(&uid) {
                    user.services_account = account.clone();
                }
                Ok(vec![HookEvent::new(
                    &uid,
                    HookPayload::ServicesLogin { account },
                )])
            }
            "INVITE" => {
                let Some(raw) = sender else {
                    return Ok(Vec::new());
                };
                let (nick, ident, host) = Self::split_prefix(&raw);
                let source = self.get_uid(net, &nick, ident.as_deref(), host.as_deref());
                let (Some(target), Some(channel)) = (args.first(), args.get(1)) else {
                    return Ok(Vec::new());
                };
                let target = self.get_uid(net, target, None, None);
                Ok(vec![HookEvent::new(
                    &source,
                    HookPayload::Invite {
                        target,
                        channel: net.to_lower(channel),
                    },
                )])
            }
            _ => Ok(Vec::new()),
        }
    }

    fn tick(&self, net: &Network) {
        // Kicks that were never echoed back get a NAMES resync so state
        // can't silently desync.
        let now = now_ts();
        let due: Vec<String> = {
            let mut state = self.state.lock();
            let due: Vec<String> = state
                .kick_queue
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(chan, _)| chan.clone())
                .collect();
            for chan in &due {
                state.kick_queue.remove(chan);
            }
            due
        };
        for chan in due {
            debug!(net = %net.name, channel = %chan, "kick unacknowledged; resyncing NAMES");
            net.send(&format!("NAMES {chan}"));
        }
    }

    fn spawn_client(&self, net: &Network, opts: SpawnOpts) -> Result<String, OutgoingError> {
        // Virtual client: state only, nothing on the wire.
        let server = opts.server.clone().unwrap_or_else(|| net.sid());
        if !net.is_internal_server(&server) {
            return Err(OutgoingError::InvalidSource(server));
        }
        let uid = self.uidgen.next_id(&opts.nick);
        base::spawn_state(net, &uid, &opts)?;
        Ok(uid)
    }

    fn spawn_server(
        &self,
        net: &Network,
        name: &str,
        desc: &str,
    ) -> Result<String, OutgoingError> {
        let psid = self.sidgen.next_id(name);
        let uplink = net.sid();
        let mut server = Server::new(Some(&uplink), name, true, desc);
        server.has_eob = true;
        net.servers.insert(psid.clone(), server);
        Ok(psid)
    }

    fn join(&self, net: &Network, client: &str, channel: &str) -> OutgoingResult {
        require_internal_client(net, client)?;
        let key = net.get_or_create_channel(channel);
        if Some(client.to_string()) == *net.pseudoclient.read() {
            net.send(&format!("JOIN {key}"));
        }
        net.add_user_to_channel(client, &key);
        Ok(())
    }

    fn sjoin(
        &self,
        net: &Network,
        server: &str,
        channel: &str,
        users: &[(String, String)],
        _ts: Option<i64>,
        _modes: &[ModeChange],
    ) -> OutgoingResult {
        require_internal_server(net, server)?;
        let key = net.get_or_create_channel(channel);
        for (_, uid) in users {
            if Some(uid.clone()) == *net.pseudoclient.read() {
                net.send(&format!("JOIN {key}"));
            }
            net.add_user_to_channel(uid, &key);
        }
        Ok(())
    }

    fn part(&self, net: &Network, client: &str, channel: &str, reason: &str)
    -> OutgoingResult {
        require_internal_client(net, client)?;
        let key = net.to_lower(channel);
        if Some(client.to_string()) == *net.pseudoclient.read() {
            net.send(&format!("PART {key} :{reason}"));
        }
        net.remove_user_from_channel(client, &key);
        Ok(())
    }

    fn quit(&self, net: &Network, client: &str, reason: &str) -> OutgoingResult {
        require_internal_client(net, client)?;
        if Some(client.to_string()) == *net.pseudoclient.read() {
            net.send(&format!("QUIT :{reason}"));
        }
        net.remove_client(client);
        Ok(())
    }

    fn kick(
        &self,
        net: &Network,
        source: &str,
        channel: &str,
        target: &str,
        reason: &str,
    ) -> OutgoingResult {
        require_internal(net, source)?;
        let key = net.to_lower(channel);
        let nick = net.get_friendly_name(target);
        net.send(&format!("KICK {key} {nick} :{reason}"));
        // The kick may be rejected; schedule a resync in case no echo
        // arrives.
        self.state
            .lock()
            .kick_queue
            .insert(key.clone(), now_ts() + KICK_ACK_SECS);
        net.remove_user_from_channel(target, &key);
        Ok(())
    }

    fn kill(&self, _net: &Network, _source: &str, _target: &str, _reason: &str)
    -> OutgoingResult {
        Err(OutgoingError::NotImplemented("kill"))
    }

    fn nick(&self, net: &Network, client: &str, newnick: &str) -> OutgoingResult {
        require_internal_client(net, client)?;
        if Some(client.to_string()) == *net.pseudoclient.read() {
            net.send(&format!("NICK {newnick}"));
        }
        if let Some(mut user) = net.users.get_mut(client) {
            user.nick = newnick.to_string();
            user.nick_ts = now_ts();
        }
        Ok(())
    }

    fn mode(
        &self,
        net: &Network,
        source: &str,
        target: &str,
        changes: &[ModeChange],
    ) -> OutgoingResult {
        require_internal(net, source)?;
        if target.starts_with('#') {
            // Expand PUID arguments back to nicks for the wire.
            let translated: Vec<ModeChange> = changes
                .iter()
                .map(|change| {
                    let mut change = change.clone();
                    if let Some(arg) = &change.arg
                        && net.users.contains_key(arg)
                    {
                        change.arg = Some(net.get_friendly_name(arg));
                    }
                    change
                })
                .collect();
            net.send(&format!(
                "MODE {} {}",
                net.to_lower(target),
                join_modes(&translated, false)
            ));
        }
        modes::apply_modes(net, target, changes);
        Ok(())
    }

    fn topic(&self, net: &Network, source: &str, channel: &str, text: &str)
    -> OutgoingResult {
        require_internal_client(net, source)?;
        let key = net.to_lower(channel);
        if Some(source.to_string()) == *net.pseudoclient.read() {
            net.send(&format!("TOPIC {key} :{text}"));
        }
        if let Some(mut chan) = net.channels.get_mut(&key) {
            chan.topic = text.to_string();
            chan.topicset = true;
        }
        Ok(())
    }

    fn topic_burst(
        &self,
        net: &Network,
        source: &str,
        channel: &str,
        text: &str,
    ) -> OutgoingResult {
        require_internal_server(net, source)?;
        let key = net.to_lower(channel);
        net.send(&format!("TOPIC {key} :{text}"));
        if let Some(mut chan) = net.channels.get_mut(&key) {
            chan.topic = text.to_string();
            chan.topicset = true;
        }
        Ok(())
    }

    fn message(&self, net: &Network, source: &str, target: &str, text: &str)
    -> OutgoingResult {
        require_internal_client(net, source)?;
        let target = if target.starts_with('#') {
            net.to_lower(target)
        } else {
            net.get_friendly_name(target)
        };
        if Some(source.to_string()) == *net.pseudoclient.read() {
            net.send(&format!("PRIVMSG {target} :{text}"));
        } else {
            // Virtual senders relay through the bot, tagged with their nick.
            let nick = net.get_friendly_name(source);
            net.send(&format!("PRIVMSG {target} :<{nick}> {text}"));
        }
        Ok(())
    }

    fn notice(&self, net: &Network, source: &str, target: &str, text: &str)
    -> OutgoingResult {
        require_internal(net, source)?;
        let target = if target.starts_with('#') {
            net.to_lower(target)
        } else {
            net.get_friendly_name(target)
        };
        if net.users.get(source).is_some_and(|u| {
            Some(u.uid.clone()) != *net.pseudoclient.read()
        }) {
            let nick = net.get_friendly_name(source);
            net.send(&format!("NOTICE {target} :<{nick}> {text}"));
        } else {
            net.send(&format!("NOTICE {target} :{text}"));
        }
        Ok(())
    }

    fn invite(&self, net: &Network, source: &str, target: &str, channel: &str)
    -> OutgoingResult {
        require_internal_client(net, source)?;
        let nick = net.get_friendly_name(target);
        net.send(&format!("INVITE {nick} {}", net.to_lower(channel)));
        Ok(())
    }

    fn knock(&self, _net: &Network, _source: &str, _channel: &str, _text: &str)
    -> OutgoingResult {
        Err(OutgoingError::NotImplemented("knock"))
    }

    fn numeric(
        &self,
        _net: &Network,
        _source: &str,
        _numeric: u16,
        _target: &str,
        _text: &str,
    ) -> OutgoingResult {
        Err(OutgoingError::NotImplemented("numeric"))
    }

    fn update_client(
        &self,
        net: &Network,
        target: &str,
        field: ClientField,
        text: &str,
    ) -> OutgoingResult {
        // Virtual client metadata is freely editable.
        let Some(mut user) = net.users.get_mut(target) else {
            return Err(OutgoingError::UnknownTarget(target.to_string()));
        };
        match field {
            ClientField::Host => user.host = text.to_string(),
            ClientField::Ident => user.ident = text.to_string(),
            ClientField::Gecos => user.realname = text.to_string(),
        }
        Ok(())
    }

    fn away(&self, net: &Network, client: &str, text: &str) -> OutgoingResult {
        require_internal_client(net, client)?;
        if let Some(mut user) = net.users.get_mut(client) {
            user.away = text.to_string();
        }
        Ok(())
    }

    fn ping(&self, net: &Network) {
        net.send(&format!("PING :{}", now_ts()));
    }

    fn squit(&self, net: &Network, source: &str, target: &str, _reason: &str)
    -> OutgoingResult {
        require_internal_server(net, source)?;
        let members: Vec<String> = net
            .servers
            .get(target)
            .map(|s| s.users.iter().cloned().collect())
            .unwrap_or_default();
        for uid in members {
            net.remove_client(&uid);
        }
        net.servers.remove(target);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::state::test_support::test_net_with_protocol;

    fn cb_net() -> Arc<Network> {
        let net = test_net_with_protocol("cbnet", "clientbot");
        net.protocol.post_connect(&net).unwrap();
        net.protocol
            .handle_line(&net, ":irc.example.org 001 slink :Welcome to ExampleNet, slink")
            .unwrap();
        net.protocol
            .handle_line(
                &net,
                ":irc.example.org 005 slink PREFIX=(ov)@+ CHANMODES=beI,k,l,imnpst \
                 CASEMAPPING=rfc1459 NICKLEN=30 :are supported by this server",
            )
            .unwrap();
        net.protocol
            .handle_line(&net, ":irc.example.org 376 slink :End of /MOTD command.")
            .unwrap();
        net
    }

    #[test]
    fn test_registration_flow() {
        let net = cb_net();
        assert!(net.is_connected());
        let bot = net.pseudoclient.read().clone().unwrap();
        assert!(bot.starts_with("PUID-"));
        assert!(net.is_internal_client(&bot));
        assert_eq!(net.casemapping(), Casemapping::Rfc1459);
    }

    #[test]
    fn test_names_reply_populates_channel() {
        let net = cb_net();
        net.protocol
            .handle_line(&net, ":irc.example.org 353 slink = #test :@oper +voiced plain")
            .unwrap();
        let chan = net.channel_snapshot("#test").unwrap();
        assert_eq!(chan.users.len(), 3);
        let oper = net.nick_to_uid("oper").unwrap();
        let voiced = net.nick_to_uid("voiced").unwrap();
        assert!(chan.has_prefix(PrefixLevel::Op, &oper));
        assert!(chan.has_prefix(PrefixLevel::Voice, &voiced));
    }

    #[test]
    fn test_who_backfills_details_and_bursts() {
        let net = cb_net();
        net.protocol
            .handle_line(&net, ":irc.example.org 353 slink = #test :gl")
            .unwrap();
        net.protocol
            .handle_line(
                &net,
                ":irc.example.org 352 slink #test ~gl gl.example.org irc.example.org gl H*@ :0 realname here",
            )
            .unwrap();
        let events = net
            .protocol
            .handle_line(&net, ":irc.example.org 315 slink #test :End of /WHO list.")
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].command, "JOIN");

        let uid = net.nick_to_uid("gl").unwrap();
        let user = net.users.get(&uid).unwrap();
        assert_eq!(user.ident, "~gl");
        assert_eq!(user.host, "gl.example.org");
        assert_eq!(user.realname, "realname here");
        assert_eq!(user.opertype, "IRC Operator");
    }

    #[test]
    fn test_oper_tracking_can_be_disabled() {
        let net = cb_net();
        {
            let mut config = (*net.config()).clone();
            config.servers.get_mut("cbnet").unwrap().clientbot_track_oper = false;
            net.set_config(Arc::new(config));
        }
        net.protocol
            .handle_line(
                &net,
                ":irc.example.org 352 slink #test ~gl gl.example irc.example gl H* :0 r",
            )
            .unwrap();
        let uid = net.nick_to_uid("gl").unwrap();
        assert!(net.users.get(&uid).unwrap().opertype.is_empty());
    }

    #[test]
    fn test_privmsg_from_unseen_nick_synthesises_user() {
        let net = cb_net();
        let events = net
            .protocol
            .handle_line(&net, ":newguy!~ng@example.net PRIVMSG #test :hello")
            .unwrap();
        assert_eq!(events.len(), 1);
        let uid = net.nick_to_uid("newguy").unwrap();
        assert_eq!(events[0].source, uid);
        assert_eq!(net.users.get(&uid).unwrap().ident, "~ng");
    }

    #[test]
    fn test_cap_ls_requests_wanted() {
        let net = test_net_with_protocol("cbnet", "clientbot");
        net.protocol.post_connect(&net).unwrap();
        net.protocol
            .handle_line(
                &net,
                ":irc.example.org CAP * LS :multi-prefix sasl=PLAIN,EXTERNAL server-time",
            )
            .unwrap();
        // ACK without sasl credentials ends negotiation.
        net.protocol
            .handle_line(&net, ":irc.example.org CAP slink ACK :multi-prefix")
            .unwrap();
    }

    #[test]
    fn test_virtual_clone_messages_ride_the_bot() {
        let net = cb_net();
        let mut opts = SpawnOpts::new("remote/elsewhere");
        opts.server = Some(net.sid());
        let clone = net.protocol.spawn_client(&net, opts).unwrap();
        assert!(net.is_internal_client(&clone));
        // The virtual clone exists in state but is not the bot.
        assert_ne!(Some(clone), *net.pseudoclient.read());
    }
}
