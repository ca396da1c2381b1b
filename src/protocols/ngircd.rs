//! ngIRCd server-protocol driver.
//!
//! ngIRCd has no SID/UID space: servers are identified by name and users by
//! nick. Pseudo-UIDs keep the rest of the daemon uniform. Negotiation is
//! PASS/SERVER followed by an 005-style exchange; the first PING from the
//! uplink marks the end of its burst.

use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{OutgoingError, OutgoingResult, ProtocolError};
use crate::hooks::{HookEvent, HookPayload};
use crate::ids::PseudoIdGenerator;
use crate::modes::{self, ModeChange, ModeMap, join_modes};
use crate::protocols::{
    ClientField, Protocol, ProtocolCaps, SpawnOpts, base, require_internal,
    require_internal_client, require_internal_server,
};
use crate::state::{Casemapping, Network, PrefixLevel, Server, now_ts};

pub struct NgircdProtocol {
    caps: ProtocolCaps,
    uidgen: PseudoIdGenerator,
    has_eob: Mutex<bool>,
}

impl NgircdProtocol {
    pub fn new() -> Self {
        Self {
            caps: ProtocolCaps {
                can_spawn_clients: true,
                has_ts: false,
                can_host_relay: true,
                can_track_servers: true,
                slash_in_nicks: false,
                slash_in_hosts: false,
                underscore_in_hosts: true,
                has_statusmsg: false,
                needs_eob_synth: false,
            },
            uidgen: PseudoIdGenerator::new("PUID"),
            has_eob: Mutex::new(false),
        }
    }

    fn setup_modes(&self, net: &Network) {
        let mut cmodes = ModeMap::rfc1459_cmodes();
        for (name, letter) in [
            ("banexception", 'e'),
            ("invex", 'I'),
            ("regmoderated", 'M'),
            ("operonly", 'O'),
            ("permanent", 'P'),
            ("nokick", 'Q'),
            ("regonly", 'R'),
            ("sslonly", 'z'),
            ("noinvite", 'V'),
        ] {
            cmodes.insert(name, letter);
        }
        cmodes.type_a = "beI".to_string();
        cmodes.type_b = "k".to_string();
        cmodes.type_c = "l".to_string();
        cmodes.type_d = "imMnOPQRstVz".to_string();
        cmodes.set_prefixes(&[
            (PrefixLevel::Owner, 'q', '~'),
            (PrefixLevel::Admin, 'a', '&'),
            (PrefixLevel::Op, 'o', '@'),
            (PrefixLevel::Halfop, 'h', '%'),
            (PrefixLevel::Voice, 'v', '+'),
        ]);
        net.set_cmodes(cmodes);

        let mut umodes = ModeMap::rfc1459_umodes();
        for (name, letter) in [
            ("away", 'a'),
            ("blockmsg", 'b'),
            ("bot", 'B'),
            ("cloak", 'x'),
            ("deaf_commonchan", 'C'),
            ("registered", 'R'),
        ] {
            umodes.insert(name, letter);
        }
        umodes.type_d = "abBCiorRswx".to_string();
        net.set_umodes(umodes);
    }

    /// Absorb an 005 RPL_ISUPPORT line from the uplink.
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
            net.with_cmodes(|map| map.set_prefixes(&prefixes));
        }
    }

    /// Send our half of the 005 negotiation, closed off by 376.
    fn send_negotiation(&self, net: &Network) {
        let sid = net.sid();
        let Some(uplink) = net.uplink() else {
            return;
        };
        let cmodes = net.cmodes();
        net.send(&format!(
            ":{sid} 005 {uplink} NETWORK={} :is my network name",
            net.full_netname()
        ));
        net.send(&format!(
            ":{sid} 005 {uplink} RFC2812 IRCD=slinkd CHARSET=UTF-8 CASEMAPPING=ascii \
             PREFIX=({}){} CHANTYPES=# CHANMODES={} :are supported on this server",
            cmodes.prefix_letters(),
            cmodes.prefix_symbols(),
            cmodes.chanmodes_isupport()
        ));
        net.send(&format!(
            ":{sid} 005 {uplink} NICKLEN={} EXCEPTS=e INVEX=I :are supported on this server",
            net.maxnicklen.load(Ordering::SeqCst)
        ));
        net.send(&format!(":{sid} 376 {uplink} :End of server negotiation"));
    }

    fn handle_nick_intro(
        &self,
        net: &Network,
        sender: &str,
        args: &[String],
    ) -> Vec<HookEvent> {
        // <- :ngircd.example NICK GL 1 ~gl localhost 1 +io :realname
        let (Some(nick), Some(ident), Some(host), Some(modestring)) =
            (args.first(), args.get(2), args.get(3), args.get(5))
        else {
            warn!(net = %net.name, "malformed NICK introduction");
            return Vec::new();
        };
        let uid = self.uidgen.next_id(nick);
        let ts = now_ts();
        base::register_user(
            net,
            sender,
            &uid,
            nick,
            ts,
            ident,
            host,
            host,
            "0.0.0.0",
            &args.last().cloned().unwrap_or_default(),
        );
        let parsed = modes::parse_modes(net, &uid, &[modestring.as_str()]);
        modes::apply_modes(net, &uid, &parsed);
        vec![HookEvent::renamed(
            sender,
            "UID",
            HookPayload::Uid {
                uid,
                ts,
                nick: nick.clone(),
                ident: ident.clone(),
                host: host.clone(),
                realhost: Some(host.clone()),
                ip: "0.0.0.0".to_string(),
            },
        )]
    }

    fn handle_chaninfo(&self, net: &Network, args: &[String]) {
        // CHANINFO <channel> +<modes> [<key> <limit>] [<topic>]
        let (Some(channel), Some(modestring)) = (args.first(), args.get(1)) else {
            return;
        };
        let key = net.get_or_create_channel(channel);
        // Key and limit arguments are carried separately.
        let stripped: String = modestring
            .chars()
            .filter(|c| *c != 'l' && *c != 'k')
            .collect();
        let mut parsed = modes::parse_modes(net, &key, &[stripped.as_str()]);
        if args.len() >= 3 {
            let topic = args.last().cloned().unwrap_or_default();
            if !topic.is_empty()
                && let Some(mut chan) = net.channels.get_mut(&key)
            {
                chan.topic = topic;
                chan.topicset = true;
            }
        }
        if args.len() >= 5 {
            if let Some(chankey) = args.get(2).filter(|k| k.as_str() != "*") {
                parsed.push(ModeChange::plus('k', Some(chankey.as_str())));
            }
            if let Some(limit) = args.get(3).filter(|l| l.as_str() != "0") {
                parsed.push(ModeChange::plus('l', Some(limit.as_str())));
            }
        }
        modes::apply_modes(net, &key, &parsed);
    }

    fn handle_njoin(&self, net: &Network, sender: &str, args: &[String]) -> Vec<HookEvent> {
        // <- :ngircd.example NJOIN #test :tester,@%GL
        let (Some(channel), Some(namelist)) = (args.first(), args.get(1)) else {
            return Vec::new();
        };
        let key = net.get_or_create_channel(channel);
        let map = net.cmodes();
        let users: Vec<(String, String)> = namelist
            .split(',')
            .filter(|entry| !entry.is_empty())
            .filter_map(|entry| {
                let nick: String = entry
                    .chars()
                    .skip_while(|c| map.prefix_level_of_symbol(*c).is_some())
                    .collect();
                let prefixes: String = entry
                    .chars()
                    .take_while(|c| map.prefix_level_of_symbol(*c).is_some())
                    .filter_map(|c| {
                        map.prefix_level_of_symbol(c)
                            .and_then(|level| map.prefix_letter(level))
                    })
                    .collect();
                net.nick_to_uid(&nick).map(|uid| (prefixes, uid))
            })
            .collect();

        // ngIRCd carries no TS; merge as an equal-TS union.
        let ts = net.channel_snapshot(&key).map(|c| c.ts).unwrap_or_else(now_ts);
        let merge = base::merge_channel_burst(net, &key, ts, Vec::new(), users);
        vec![HookEvent::new(
            sender,
            HookPayload::Join {
                channel: merge.key,
                users: merge.users,
                ts,
                modes: Vec::new(),
                burst: true,
                channeldata: merge.oldchan,
            },
        )]
    }
}

impl Default for NgircdProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol for NgircdProtocol {
    fn name(&self) -> &'static str {
        "ngircd"
    }

    fn caps(&self) -> &ProtocolCaps {
        &self.caps
    }

    fn post_connect(&self, net: &Network) -> Result<(), ProtocolError> {
        *self.has_eob.lock() = false;
        net.set_casemapping(Casemapping::Ascii);
        self.setup_modes(net);
        let conf = net.serverdata();
        let desc = conf
            .serverdesc
            .clone()
            .unwrap_or_else(|| net.config().bot.serverdesc.clone());

        // Our "SID" is our server name.
        net.set_sid(&conf.hostname);
        net.servers.insert(
            conf.hostname.clone(),
            Server::new(None, &conf.hostname, true, &desc),
        );
        net.send(&format!(
            "PASS {} 0210-IRC+ slinkd|{}:CHLMoX",
            conf.sendpass,
            env!("CARGO_PKG_VERSION")
        ));
        net.send(&format!("SERVER {} 1 :{desc}", conf.hostname));
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
        if command == "ERROR" {
            return Err(ProtocolError::UplinkError(
                args.last().cloned().unwrap_or_default(),
            ));
        }

        if command == "PASS" {
            // <- :ngircd.example PASS xyzpassword 0210-IRC+ ngIRCd|24:CHLMSXZ PZ
            if args.first().map(String::as_str) != Some(net.serverdata().recvpass.as_str()) {
                return Err(ProtocolError::BadPassword);
            }
            if !args.get(1).is_some_and(|v| v.contains("IRC+")) {
                return Err(ProtocolError::MalformedHandshake(
                    "uplink does not speak the IRC+ protocol".to_string(),
                ));
            }
            return Ok(Vec::new());
        }

        if command == "SERVER" && net.uplink().is_none() {
            // <- :ngircd.example SERVER ngircd.example 1 :ngIRCd dev server
            let Some(name) = args.first() else {
                return Err(ProtocolError::MalformedHandshake(line.to_string()));
            };
            let name = name.to_lowercase();
            net.servers.insert(
                name.clone(),
                Server::new(None, &name, false, &args.last().cloned().unwrap_or_default()),
            );
            net.set_uplink(&name);
            return Ok(Vec::new());
        }

        let sender = match sender {
            Some(raw) => match base::resolve_sender(net, &raw) {
                Some(resolved) => resolved,
                None => net.uplink().unwrap_or(raw),
            },
            None => match net.uplink() {
                Some(uplink) => uplink,
                None => return Ok(Vec::new()),
            },
        };

        match command.as_str() {
            "SERVER" => {
                let Some(name) = args.first() else {
                    return Ok(Vec::new());
                };
                let name = name.to_lowercase();
                base::register_server(
                    net,
                    Some(&sender),
                    &name,
                    &name,
                    &args.last().cloned().unwrap_or_default(),
                );
                Ok(Vec::new())
            }
            "005" => {
                self.handle_005(net, &args);
                Ok(Vec::new())
            }
            "376" => {
                self.send_negotiation(net);
                Ok(Vec::new())
            }
            "NICK" => {
                if args.len() >= 6 && net.servers.contains_key(&sender) {
                    Ok(self.handle_nick_intro(net, &sender, &args))
                } else {
                    Ok(base::common_dispatch(net, &sender, "NICK", &args)?.unwrap_or_default())
                }
            }
            "PING" => {
                let sid = net.sid();
                net.send(&format!(
                    ":{sid} PONG {sid} :{}",
                    args.last().cloned().unwrap_or_default()
                ));
                let mut has_eob = self.has_eob.lock();
                if Some(sender.clone()) == net.uplink() && !*has_eob {
                    // First PING from the uplink doubles as end-of-burst.
                    *has_eob = true;
                    net.connected.store(true, Ordering::SeqCst);
                    if let Some(mut server) = net.servers.get_mut(&sender) {
                        server.has_eob = true;
                    }
                    return Ok(vec![HookEvent::new(&sender, HookPayload::Endburst)]);
                }
                Ok(Vec::new())
            }
            "PONG" => Ok(Vec::new()),
            "CHANINFO" => {
                self.handle_chaninfo(net, &args);
                Ok(Vec::new())
            }
            "NJOIN" => Ok(self.handle_njoin(net, &sender, &args)),
            "JOIN" => {
                let Some(chans) = args.first() else {
                    return Ok(Vec::new());
                };
                let mut events = Vec::new();
                for channel in chans.split(',') {
                    let key = net.get_or_create_channel(channel);
                    net.add_user_to_channel(&sender, &key);
                    let ts = net.channel_snapshot(&key).map(|c| c.ts).unwrap_or_else(now_ts);
                    events.push(HookEvent::new(
                        &sender,
                        HookPayload::Join {
                            channel: key,
                            users: vec![sender.clone()],
                            ts,
                            modes: Vec::new(),
                            burst: false,
                            channeldata: None,
                        },
                    ));
                }
                Ok(events)
            }
            "MODE" => {
                let Some(target) = args.first() else {
                    return Ok(Vec::new());
                };
                if args.len() < 2 {
                    return Ok(Vec::new());
                }
                let mode_args: Vec<&str> = args[1..].iter().map(String::as_str).collect();
                if target.starts_with('#') {
                    let key = net.to_lower(target);
                    let oldchan = net.channel_snapshot(&key);
                    let parsed = modes::parse_modes(net, &key, &mode_args);
                    modes::apply_modes(net, &key, &parsed);
                    Ok(vec![HookEvent::new(
                        &sender,
                        HookPayload::Mode {
                            target: key,
                            modes: parsed,
                            channeldata: oldchan,
                        },
                    )])
                } else {
                    let target = net
                        .nick_to_uid(target)
                        .unwrap_or_else(|| target.to_string());
                    let parsed = modes::parse_modes(net, &target, &mode_args);
                    modes::apply_modes(net, &target, &parsed);
                    Ok(vec![HookEvent::new(
                        &sender,
                        HookPayload::Mode {
                            target,
                            modes: parsed,
                            channeldata: None,
                        },
                    )])
                }
            }
            "TOPIC" => {
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
                    &sender,
                    HookPayload::Topic {
                        channel: key,
                        text: topic,
                        oldtopic,
                        setter: net.get_friendly_name(&sender),
                        ts: now_ts(),
                    },
                )])
            }
            _ => match base::common_dispatch(net, &sender, &command, &args)? {
                Some(events) => Ok(events),
                None => {
                    debug!(net = %net.name, command = %command, "unhandled command");
                    Ok(Vec::new())
                }
            },
        }
    }

    fn spawn_client(&self, net: &Network, opts: SpawnOpts) -> Result<String, OutgoingError> {
        let server = opts.server.clone().unwrap_or_else(|| net.sid());
        if !net.is_internal_server(&server) {
            return Err(OutgoingError::InvalidSource(server));
        }
        let uid = self.uidgen.next_id(&opts.nick);
        let user = base::spawn_state(net, &uid, &opts)?;
        let raw_modes = join_modes(&opts.modes, true);
        let modestring = raw_modes.split(' ').next().unwrap_or("+");
        net.send(&format!(
            ":{server} NICK {} 1 {} {} 1 {modestring} :{}",
            user.nick, user.ident, user.host, user.realname
        ));
        Ok(uid)
    }

    fn spawn_server(
        &self,
        net: &Network,
        name: &str,
        desc: &str,
    ) -> Result<String, OutgoingError> {
        let name = name.to_lowercase();
        if !base::is_server_name(&name) {
            return Err(OutgoingError::UnknownTarget(format!(
                "invalid server name {name:?}"
            )));
        }
        if net.servers.contains_key(&name) {
            return Err(OutgoingError::UnknownTarget(format!(
                "server {name} already exists"
            )));
        }
        let uplink = net.sid();
        // Server names double as IDs on ngIRCd.
        let mut server = Server::new(Some(&uplink), &name, true, desc);
        server.has_eob = true;
        net.servers.insert(name.clone(), server);
        net.send(&format!(":{uplink} SERVER {name} 2 :{desc}"));
        Ok(name)
    }

    fn join(&self, net: &Network, client: &str, channel: &str) -> OutgoingResult {
        require_internal_client(net, client)?;
        let key = net.get_or_create_channel(channel);
        let nick = net.get_friendly_name(client);
        net.send(&format!(":{nick} JOIN {key}"));
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
        modes_in: &[ModeChange],
    ) -> OutgoingResult {
        require_internal_server(net, server)?;
        let key = net.get_or_create_channel(channel);
        let map = net.cmodes();
        let simple_modes: Vec<ModeChange> = modes_in
            .iter()
            .filter(|m| !map.is_list_mode(m.letter))
            .cloned()
            .collect();
        modes::apply_modes(net, &key, &simple_modes);

        let mut prefix_changes = Vec::new();
        let mut namelist = Vec::new();
        for (prefixes, uid) in users {
            let symbols: String = prefixes
                .chars()
                .filter_map(|letter| {
                    map.prefix_level_of_letter(letter)
                        .and_then(|level| map.prefix_symbol(level))
                })
                .collect();
            namelist.push(format!("{symbols}{}", net.get_friendly_name(uid)));
            for letter in prefixes.chars() {
                prefix_changes.push(ModeChange::plus(letter, Some(uid.as_str())));
            }
            net.add_user_to_channel(uid, &key);
        }
        net.send(&format!(":{server} NJOIN {key} :{}", namelist.join(",")));
        modes::apply_modes(net, &key, &prefix_changes);
        Ok(())
    }

    fn part(&self, net: &Network, client: &str, channel: &str, reason: &str)
    -> OutgoingResult {
        require_internal_client(net, client)?;
        let key = net.to_lower(channel);
        let nick = net.get_friendly_name(client);
        if reason.is_empty() {
            net.send(&format!(":{nick} PART {key}"));
        } else {
            net.send(&format!(":{nick} PART {key} :{reason}"));
        }
        net.remove_user_from_channel(client, &key);
        Ok(())
    }

    fn quit(&self, net: &Network, client: &str, reason: &str) -> OutgoingResult {
        require_internal_client(net, client)?;
        let nick = net.get_friendly_name(client);
        net.send(&format!(":{nick} QUIT :{reason}"));
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
        let source_name = net.get_friendly_name(source);
        let target_name = net.get_friendly_name(target);
        net.send(&format!(":{source_name} KICK {key} {target_name} :{reason}"));
        net.remove_user_from_channel(target, &key);
        Ok(())
    }

    fn kill(&self, net: &Network, source: &str, target: &str, reason: &str)
    -> OutgoingResult {
        require_internal(net, source)?;
        if !net.users.contains_key(target) {
            return Err(OutgoingError::UnknownTarget(target.to_string()));
        }
        let source_name = net.get_friendly_name(source);
        let target_name = net.get_friendly_name(target);
        net.send(&format!(":{source_name} KILL {target_name} :Killed ({reason})"));
        net.remove_client(target);
        Ok(())
    }

    fn nick(&self, net: &Network, client: &str, newnick: &str) -> OutgoingResult {
        require_internal_client(net, client)?;
        let oldnick = net.get_friendly_name(client);
        net.send(&format!(":{oldnick} NICK :{newnick}"));
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
        modes::apply_modes(net, target, changes);
        let source_name = net.get_friendly_name(source);
        let target_name = if target.starts_with('#') {
            net.to_lower(target)
        } else {
            net.get_friendly_name(target)
        };
        // Prefix-mode arguments go out as nicks.
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
            ":{source_name} MODE {target_name} {}",
            join_modes(&translated, false)
        ));
        Ok(())
    }

    fn topic(&self, net: &Network, source: &str, channel: &str, text: &str)
    -> OutgoingResult {
        require_internal_client(net, source)?;
        let key = net.to_lower(channel);
        let nick = net.get_friendly_name(source);
        net.send(&format!(":{nick} TOPIC {key} :{text}"));
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
        net.send(&format!(":{source} TOPIC {key} :{text}"));
        if let Some(mut chan) = net.channels.get_mut(&key) {
            chan.topic = text.to_string();
            chan.topicset = true;
        }
        Ok(())
    }

    fn message(&self, net: &Network, source: &str, target: &str, text: &str)
    -> OutgoingResult {
        require_internal_client(net, source)?;
        let nick = net.get_friendly_name(source);
        let target = if net.users.contains_key(target) {
            net.get_friendly_name(target)
        } else {
            target.to_string()
        };
        net.send(&format!(":{nick} PRIVMSG {target} :{text}"));
        Ok(())
    }

    fn notice(&self, net: &Network, source: &str, target: &str, text: &str)
    -> OutgoingResult {
        require_internal(net, source)?;
        let source_name = net.get_friendly_name(source);
        let target = if net.users.contains_key(target) {
            net.get_friendly_name(target)
        } else {
            target.to_string()
        };
        net.send(&format!(":{source_name} NOTICE {target} :{text}"));
        Ok(())
    }

    fn invite(&self, net: &Network, source: &str, target: &str, channel: &str)
    -> OutgoingResult {
        require_internal_client(net, source)?;
        let nick = net.get_friendly_name(source);
        let target_name = net.get_friendly_name(target);
        net.send(&format!(":{nick} INVITE {target_name} {}", net.to_lower(channel)));
        Ok(())
    }

    fn knock(&self, _net: &Network, _source: &str, _channel: &str, _text: &str)
    -> OutgoingResult {
        Err(OutgoingError::NotImplemented("knock"))
    }

    fn numeric(
        &self,
        net: &Network,
        source: &str,
        numeric: u16,
        target: &str,
        text: &str,
    ) -> OutgoingResult {
        require_internal_server(net, source)?;
        let nick = net.get_friendly_name(target);
        net.send(&format!(":{source} {numeric:03} {nick} {text}"));
        Ok(())
    }

    fn update_client(
        &self,
        _net: &Network,
        _target: &str,
        _field: ClientField,
        _text: &str,
    ) -> OutgoingResult {
        Err(OutgoingError::NotImplemented("update_client"))
    }

    fn away(&self, net: &Network, client: &str, text: &str) -> OutgoingResult {
        require_internal_client(net, client)?;
        let nick = net.get_friendly_name(client);
        if text.is_empty() {
            net.send(&format!(":{nick} AWAY"));
        } else {
            net.send(&format!(":{nick} AWAY :{text}"));
        }
        if let Some(mut user) = net.users.get_mut(client) {
            user.away = text.to_string();
        }
        Ok(())
    }

    fn ping(&self, net: &Network) {
        let sid = net.sid();
        if let Some(uplink) = net.uplink() {
            net.send(&format!(":{sid} PING {sid} {uplink}"));
        }
    }

    fn squit(&self, net: &Network, source: &str, target: &str, reason: &str)
    -> OutgoingResult {
        require_internal_server(net, source)?;
        net.send(&format!(":{source} SQUIT {target} :{reason}"));
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

    fn ng_net() -> Arc<Network> {
        let net = test_net_with_protocol("ngnet", "ngircd");
        net.protocol.post_connect(&net).unwrap();
        net.protocol
            .handle_line(
                &net,
                ":ngircd.example PASS linkage 0210-IRC+ ngIRCd|24:CHLMSXZ PZ",
            )
            .unwrap();
        net.protocol
            .handle_line(&net, ":ngircd.example SERVER ngircd.example 1 :dev server")
            .unwrap();
        net.protocol
            .handle_line(
                &net,
                ":ngircd.example 005 slink PREFIX=(qaohv)~&@%+ CASEMAPPING=ascii \
                 CHANMODES=beI,k,l,imMnOPQRstVz NICKLEN=21 :are supported on this server",
            )
            .unwrap();
        net
    }

    #[test]
    fn test_uplink_is_name_keyed() {
        let net = ng_net();
        assert_eq!(net.uplink(), Some("ngircd.example".to_string()));
        assert_eq!(
            net.maxnicklen.load(Ordering::SeqCst),
            21
        );
    }

    #[test]
    fn test_nick_intro_synthesises_puid() {
        let net = ng_net();
        let events = net
            .protocol
            .handle_line(&net, ":ngircd.example NICK GL 1 ~gl localhost 1 +io :realname")
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].command, "UID");
        let uid = net.nick_to_uid("GL").unwrap();
        assert!(uid.starts_with("PUID-"));
        assert!(net.users.get(&uid).unwrap().has_mode('o'));
    }

    #[test]
    fn test_njoin_with_stacked_prefixes() {
        let net = ng_net();
        net.protocol
            .handle_line(&net, ":ngircd.example NICK tester 1 ~t localhost 1 +i :t")
            .unwrap();
        net.protocol
            .handle_line(&net, ":ngircd.example NICK GL 1 ~gl localhost 1 +i :gl")
            .unwrap();
        net.protocol
            .handle_line(&net, ":ngircd.example NJOIN #test :tester,@%GL")
            .unwrap();
        let chan = net.channel_snapshot("#test").unwrap();
        let gl = net.nick_to_uid("GL").unwrap();
        assert_eq!(chan.users.len(), 2);
        assert!(chan.has_prefix(PrefixLevel::Op, &gl));
        assert!(chan.has_prefix(PrefixLevel::Halfop, &gl));
    }

    #[test]
    fn test_chaninfo_applies_key_and_limit() {
        let net = ng_net();
        net.protocol
            .handle_line(
                &net,
                ":ngircd.example CHANINFO #opers +Pkl mykey 25 :Secret opers channel",
            )
            .unwrap();
        let chan = net.channel_snapshot("#opers").unwrap();
        assert!(chan.modes.contains(&('P', None)));
        assert!(chan.modes.contains(&('k', Some("mykey".to_string()))));
        assert!(chan.modes.contains(&('l', Some("25".to_string()))));
        assert_eq!(chan.topic, "Secret opers channel");
    }

    #[test]
    fn test_first_ping_is_endburst() {
        let net = ng_net();
        let events = net
            .protocol
            .handle_line(&net, ":ngircd.example PING :ngircd.example")
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].command, "ENDBURST");
        // Subsequent pings are just pings.
        let events = net
            .protocol
            .handle_line(&net, ":ngircd.example PING :ngircd.example")
            .unwrap();
        assert!(events.is_empty());
    }
}
