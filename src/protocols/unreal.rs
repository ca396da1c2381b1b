//! UnrealIRCd 4.x SID-protocol driver.
//!
//! Handshake is PROTOCTL-based: we announce SJ3/NOQUIT/SID/VL/UMODE2 and
//! learn the uplink's SID and CHANMODES classes from its PROTOCTL lines.
//! End of burst is the explicit EOS command. Many commands address users by
//! nick rather than UID; sender resolution papers over the difference.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{OutgoingError, OutgoingResult, ProtocolError};
use crate::hooks::{HookEvent, HookPayload};
use crate::ids::Ts6UidGenerator;
use crate::modes::{self, ModeChange, ModeMap, join_modes, wrap_modes};
use crate::protocols::{
    ClientField, Protocol, ProtocolCaps, SpawnOpts, base, require_internal,
    require_internal_client, require_internal_server,
};
use crate::state::{Casemapping, Network, PrefixLevel, Server, now_ts};

const PROTO_VER: u32 = 3999;

/// Letter -> named mode for the CHANMODES classes Unreal advertises.
const UNREAL_CMODES: &[(char, &str)] = &[
    ('l', "limit"),
    ('c', "blockcolor"),
    ('G', "censor"),
    ('D', "delayjoin"),
    ('n', "noextmsg"),
    ('s', "secret"),
    ('T', "nonotice"),
    ('z', "sslonly"),
    ('b', "ban"),
    ('V', "noinvite"),
    ('Z', "issecure"),
    ('r', "registered"),
    ('N', "nonick"),
    ('e', "banexception"),
    ('R', "regonly"),
    ('M', "regmoderated"),
    ('p', "private"),
    ('Q', "nokick"),
    ('P', "permanent"),
    ('k', "key"),
    ('C', "noctcp"),
    ('O', "operonly"),
    ('S', "stripcolor"),
    ('m', "moderated"),
    ('K', "noknock"),
    ('i', "inviteonly"),
    ('I', "invex"),
    ('t', "topiclock"),
    ('f', "flood_unreal"),
];

struct UnrealState {
    uidgens: HashMap<String, Ts6UidGenerator>,
    /// PROTOCTL tokens seen from the uplink.
    caps_seen: Vec<String>,
    authed: bool,
}

pub struct UnrealProtocol {
    caps: ProtocolCaps,
    state: Mutex<UnrealState>,
}

impl UnrealProtocol {
    pub fn new() -> Self {
        Self {
            caps: ProtocolCaps {
                can_spawn_clients: true,
                has_ts: true,
                can_host_relay: true,
                can_track_servers: true,
                slash_in_nicks: false,
                slash_in_hosts: false,
                underscore_in_hosts: true,
                has_statusmsg: true,
                needs_eob_synth: false,
            },
            state: Mutex::new(UnrealState {
                uidgens: HashMap::new(),
                caps_seen: Vec::new(),
                authed: false,
            }),
        }
    }

    fn setup_modes(&self, net: &Network) {
        let mut cmodes = ModeMap::rfc1459_cmodes();
        for (letter, name) in UNREAL_CMODES {
            cmodes.insert(name, *letter);
        }
        cmodes.type_a = "beI".to_string();
        cmodes.type_b = "kfL".to_string();
        cmodes.type_c = "l".to_string();
        cmodes.type_d = "psmntirzMQNRTOVKDdGPZSCc".to_string();
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
            ("deaf", 'd'),
            ("hidechans", 'p'),
            ("protected", 'q'),
            ("registered", 'r'),
            ("vhost", 't'),
            ("bot", 'B'),
            ("censor", 'G'),
            ("hideoper", 'H'),
            ("hideidle", 'I'),
            ("ssl", 'z'),
            ("noctcp", 'T'),
            ("showwhois", 'W'),
            ("secureonlymsg", 'Z'),
            ("servprotect", 'S'),
            ("netadmin", 'N'),
            ("coadmin", 'C'),
            ("admin", 'A'),
            ("regdeaf", 'R'),
            ("cloak", 'x'),
        ] {
            umodes.insert(name, letter);
        }
        umodes.type_d = "dipqrstBGHIzTWZSNCARxow".to_string();
        net.set_umodes(umodes);
    }

    fn handle_protoctl(&self, net: &Network, args: &[String]) {
        // <- PROTOCTL NOQUIT NICKv2 SJOIN SJOIN2 UMODE2 VL SJ3 NICKIP ESVID
        // <- PROTOCTL CHANMODES=beI,kfL,lj,psmntirzMQNRTOVKDdGPZSCc SID=001 TS=1441314501
        let mut state = self.state.lock();
        for cap in args {
            if let Some(sid) = cap.strip_prefix("SID=") {
                net.servers
                    .insert(sid.to_string(), Server::new(None, "unknown", false, ""));
                net.set_uplink(sid);
                state.caps_seen.push("SID".to_string());
            } else if let Some(classes) = cap.strip_prefix("CHANMODES=") {
                let classes: Vec<&str> = classes.split(',').collect();
                if classes.len() == 4 {
                    net.with_cmodes(|map| {
                        map.type_a = classes[0].to_string();
                        // Unreal omits +f from the always-param class.
                        map.type_b = format!("{}f", classes[1]);
                        map.type_c = classes[2].to_string();
                        map.type_d = classes[3].to_string();
                        for class in &classes {
                            for letter in class.chars() {
                                if let Some((_, name)) =
                                    UNREAL_CMODES.iter().find(|(l, _)| *l == letter)
                                {
                                    map.insert(name, letter);
                                }
                            }
                        }
                    });
                }
                state.caps_seen.push("CHANMODES".to_string());
            } else {
                state.caps_seen.push(cap.clone());
            }
        }
    }

    /// Uplink SERVER line carries the version token when VL was negotiated.
    fn handle_server_auth(&self, net: &Network, args: &[String]) -> Result<(), ProtocolError> {
        // <- SERVER unreal.example.net 1 :U3999-Fhin6OoEM UnrealIRCd test server
        let state = self.state.lock();
        for required in ["VL", "SID", "CHANMODES", "NOQUIT", "SJ3"] {
            if !state.caps_seen.iter().any(|c| c == required) {
                return Err(ProtocolError::MissingCapability(required.to_string()));
            }
        }
        drop(state);

        let desc = args.last().cloned().unwrap_or_default();
        let version: u32 = desc
            .split('-')
            .next()
            .and_then(|v| v.trim_start_matches('U').parse().ok())
            .ok_or_else(|| {
                ProtocolError::MalformedHandshake("no version in SERVER (is VL sent?)".to_string())
            })?;
        if version < PROTO_VER {
            return Err(ProtocolError::MalformedHandshake(format!(
                "protocol version {version} too old (need {PROTO_VER}+)"
            )));
        }
        if let (Some(uplink), Some(name)) = (net.uplink(), args.first())
            && let Some(mut server) = net.servers.get_mut(&uplink)
        {
            server.name = name.to_lowercase();
            server.desc = desc;
        }
        net.connected
            .store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn handle_uid(&self, net: &Network, sender: &str, args: &[String]) -> Vec<HookEvent> {
        // <- :001 UID GL 0 1441306929 gl localhost 0018S7901 0 +iowx * cloaked.host b64ip :realname
        if args.len() < 12 {
            warn!(net = %net.name, "malformed UID introduction");
            return Vec::new();
        }
        let (nick, ts, ident, realhost, uid, modestring, host) = (
            &args[0], &args[2], &args[3], &args[4], &args[5], &args[7], &args[9],
        );
        let realname = args.last().cloned().unwrap_or_default();
        let ts: i64 = ts.parse().unwrap_or_else(|_| now_ts());
        let host = if host == "*" { realhost } else { host };
        base::register_user(
            net, sender, uid, nick, ts, ident, host, realhost, "0.0.0.0", &realname,
        );
        let parsed = modes::parse_modes(net, uid, &[modestring.as_str()]);
        modes::apply_modes(net, uid, &parsed);
        let mut events = vec![HookEvent::new(
            sender,
            HookPayload::Uid {
                uid: uid.clone(),
                ts,
                nick: nick.clone(),
                ident: ident.clone(),
                host: host.clone(),
                realhost: Some(realhost.clone()),
                ip: "0.0.0.0".to_string(),
            },
        )];
        if parsed.iter().any(|m| m.adding && m.letter == 'o') {
            events.push(HookEvent::new(
                uid,
                HookPayload::Opered {
                    opertype: "IRC Operator".to_string(),
                },
            ));
        }
        events
    }

    fn handle_sjoin(&self, net: &Network, sender: &str, args: &[String]) -> Vec<HookEvent> {
        // <- :001 SJOIN 1444361345 #chan [+modes [margs]] :@001AAAAAB +001AAAAAC &ban!mask
        if args.len() < 3 {
            return Vec::new();
        }
        let (ts, channel, userlist) = (&args[0], &args[1], &args[args.len() - 1]);
        let their_ts: i64 = ts.parse().unwrap_or_else(|_| now_ts());
        let key = net.get_or_create_channel(channel);
        let mode_args: Vec<&str> = args[2..args.len() - 1].iter().map(String::as_str).collect();
        let mut parsed = if mode_args.is_empty() {
            Vec::new()
        } else {
            modes::parse_modes(net, &key, &mode_args)
        };

        let map = net.cmodes();
        let mut users = Vec::new();
        for entry in userlist.split_whitespace() {
            // SJ3 inlines bans (&), ban exceptions (") and invexes (').
            match entry.chars().next() {
                Some('&') => {
                    parsed.push(ModeChange::plus('b', Some(&entry[1..])));
                    continue;
                }
                Some('"') => {
                    parsed.push(ModeChange::plus('e', Some(&entry[1..])));
                    continue;
                }
                Some('\'') => {
                    parsed.push(ModeChange::plus('I', Some(&entry[1..])));
                    continue;
                }
                _ => {}
            }
            let uid: String = entry
                .chars()
                .skip_while(|c| *c == '*' || map.prefix_level_of_symbol(*c).is_some())
                .collect();
            let prefixes: String = entry
                .chars()
                .take_while(|c| *c == '*' || map.prefix_level_of_symbol(*c).is_some())
                .filter_map(|c| {
                    let level = if c == '*' {
                        Some(PrefixLevel::Owner)
                    } else {
                        map.prefix_level_of_symbol(c)
                    };
                    level.and_then(|l| map.prefix_letter(l))
                })
                .collect();
            let uid = if net.users.contains_key(&uid) {
                uid
            } else {
                net.nick_to_uid(&uid).unwrap_or(uid)
            };
            users.push((prefixes, uid));
        }

        let merge = base::merge_channel_burst(net, &key, their_ts, parsed, users);
        vec![HookEvent::new(
            sender,
            HookPayload::Join {
                channel: merge.key,
                users: merge.users,
                ts: their_ts,
                modes: merge.modes,
                burst: true,
                channeldata: merge.oldchan,
            },
        )]
    }
}

impl Default for UnrealProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol for UnrealProtocol {
    fn name(&self) -> &'static str {
        "unreal"
    }

    fn caps(&self) -> &ProtocolCaps {
        &self.caps
    }

    fn post_connect(&self, net: &Network) -> Result<(), ProtocolError> {
        *self.state.lock() = UnrealState {
            uidgens: HashMap::new(),
            caps_seen: Vec::new(),
            authed: false,
        };
        net.set_casemapping(Casemapping::Ascii);
        self.setup_modes(net);
        let conf = net.serverdata();
        let desc = conf
            .serverdesc
            .clone()
            .unwrap_or_else(|| net.config().bot.serverdesc.clone());

        net.send(&format!("PASS :{}", conf.sendpass));
        net.send(&format!(
            "PROTOCTL SJ3 NOQUIT NICKv2 VL UMODE2 EAUTH={} SID={}",
            conf.hostname, conf.sid
        ));
        net.send(&format!(
            "SERVER {} 1 U{PROTO_VER}-h6e-{} :{desc}",
            conf.hostname, conf.sid
        ));
        net.send(&format!(
            "NETINFO 1 {} {PROTO_VER} * 0 0 0 :{}",
            now_ts(),
            conf.netname.unwrap_or_else(|| net.name.clone())
        ));
        net.send(&format!(":{} EOS", conf.sid));
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

        if sender.is_none() {
            match command.as_str() {
                "PASS" => {
                    if args.first().map(String::as_str)
                        != Some(net.serverdata().recvpass.as_str())
                    {
                        return Err(ProtocolError::BadPassword);
                    }
                    self.state.lock().authed = true;
                    return Ok(Vec::new());
                }
                "PROTOCTL" => {
                    self.handle_protoctl(net, &args);
                    return Ok(Vec::new());
                }
                "SERVER" => {
                    if !self.state.lock().authed {
                        return Err(ProtocolError::BadPassword);
                    }
                    self.handle_server_auth(net, &args)?;
                    return Ok(Vec::new());
                }
                "PING" => {
                    net.send(&format!(
                        "PONG {} :{}",
                        net.serverdata().hostname,
                        args.last().cloned().unwrap_or_default()
                    ));
                    return Ok(Vec::new());
                }
                "NETINFO" | "EOS" | "TOPIC" => {}
                _ => {}
            }
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
            "PING" => {
                net.send(&format!(
                    "PONG {} :{}",
                    net.serverdata().hostname,
                    args.last().cloned().unwrap_or_default()
                ));
                Ok(Vec::new())
            }
            "PONG" => Ok(Vec::new()),
            "UID" => Ok(self.handle_uid(net, &sender, &args)),
            "SID" => {
                // <- :001 SID services.example.net 2 00A :Services
                let (Some(name), Some(sid)) = (args.first(), args.get(2)) else {
                    return Ok(Vec::new());
                };
                base::register_server(
                    net,
                    Some(&sender),
                    sid,
                    &name.to_lowercase(),
                    &args.last().cloned().unwrap_or_default(),
                );
                Ok(Vec::new())
            }
            "SERVER" => {
                // Legacy (non-SID) introduction; keyed by name.
                let Some(name) = args.first() else {
                    return Ok(Vec::new());
                };
                base::register_server(
                    net,
                    Some(&sender),
                    &name.to_lowercase(),
                    &name.to_lowercase(),
                    &args.last().cloned().unwrap_or_default(),
                );
                Ok(Vec::new())
            }
            "EOS" => {
                if let Some(mut server) = net.servers.get_mut(&sender) {
                    server.has_eob = true;
                }
                if Some(sender.clone()) == net.uplink() {
                    debug!(net = %net.name, "end of sync received");
                    Ok(vec![HookEvent::new(&sender, HookPayload::Endburst)])
                } else {
                    Ok(Vec::new())
                }
            }
            "SJOIN" => Ok(self.handle_sjoin(net, &sender, &args)),
            "JOIN" => {
                // <- :GL JOIN #chan1,#chan2
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
                // <- :unreal.example.net MODE #chan +ntCo GL 1444361345
                let Some(target) = args.first() else {
                    return Ok(Vec::new());
                };
                if !target.starts_with('#') {
                    warn!(net = %net.name, "MODE for non-channel target");
                    return Ok(Vec::new());
                }
                let key = net.to_lower(target);
                let oldchan = net.channel_snapshot(&key);
                // A trailing timestamp sometimes rides along; drop it.
                let mut mode_args: Vec<&str> =
                    args[1..].iter().map(String::as_str).filter(|a| !a.is_empty()).collect();
                if mode_args.len() > 1
                    && mode_args
                        .last()
                        .is_some_and(|a| a.chars().all(|c| c.is_ascii_digit()) && a.len() >= 9)
                {
                    mode_args.pop();
                }
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
            }
            "UMODE2" => {
                // <- :GL UMODE2 +iwx
                let mode_args: Vec<&str> = args.iter().map(String::as_str).collect();
                let was_oper = net.users.get(&sender).is_some_and(|u| u.has_mode('o'));
                let parsed = modes::parse_modes(net, &sender, &mode_args);
                modes::apply_modes(net, &sender, &parsed);
                let mut events = vec![HookEvent::renamed(
                    &sender,
                    "MODE",
                    HookPayload::Mode {
                        target: sender.clone(),
                        modes: parsed,
                        channeldata: None,
                    },
                )];
                if !was_oper && net.users.get(&sender).is_some_and(|u| u.has_mode('o')) {
                    events.push(HookEvent::new(
                        &sender,
                        HookPayload::Opered {
                            opertype: "IRC Operator".to_string(),
                        },
                    ));
                }
                Ok(events)
            }
            "TOPIC" => {
                // <- :GL TOPIC #services GL 1444699395 :weeee
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
                        setter: args.get(1).cloned().unwrap_or_default(),
                        ts: args
                            .get(2)
                            .and_then(|t| t.parse().ok())
                            .unwrap_or_else(now_ts),
                    },
                )])
            }
            "CHGHOST" | "SETHOST" => {
                let (target, newhost) = if command == "SETHOST" {
                    (sender.clone(), args.first().cloned())
                } else {
                    let t = args.first().cloned().unwrap_or_default();
                    let t = if net.users.contains_key(&t) {
                        t
                    } else {
                        net.nick_to_uid(&t).unwrap_or(t)
                    };
                    (t, args.get(1).cloned())
                };
                let Some(newhost) = newhost else {
                    return Ok(Vec::new());
                };
                if let Some(mut user) = net.users.get_mut(&target) {
                    user.host = newhost.clone();
                }
                Ok(vec![HookEvent::new(
                    &sender,
                    HookPayload::ChgHost { target, newhost },
                )])
            }
            "CHGIDENT" => {
                let (Some(target), Some(newident)) = (args.first(), args.get(1)) else {
                    return Ok(Vec::new());
                };
                let target = if net.users.contains_key(target) {
                    target.clone()
                } else {
                    net.nick_to_uid(target).unwrap_or_else(|| target.clone())
                };
                if let Some(mut user) = net.users.get_mut(&target) {
                    user.ident = newident.clone();
                }
                Ok(vec![HookEvent::new(
                    &sender,
                    HookPayload::ChgIdent {
                        target,
                        newident: newident.clone(),
                    },
                )])
            }
            "CHGNAME" => {
                let (Some(target), Some(newgecos)) = (args.first(), args.get(1)) else {
                    return Ok(Vec::new());
                };
                let target = if net.users.contains_key(target) {
                    target.clone()
                } else {
                    net.nick_to_uid(target).unwrap_or_else(|| target.clone())
                };
                if let Some(mut user) = net.users.get_mut(&target) {
                    user.realname = newgecos.clone();
                }
                Ok(vec![HookEvent::new(
                    &sender,
                    HookPayload::ChgName {
                        target,
                        newgecos: newgecos.clone(),
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
        let uid = self
            .state
            .lock()
            .uidgens
            .entry(server.clone())
            .or_insert_with(|| Ts6UidGenerator::new(&server))
            .next_uid()
            .map_err(|_| OutgoingError::UnknownTarget("uid space exhausted".to_string()))?;
        let user = base::spawn_state(net, &uid, &opts)?;
        let raw_modes = join_modes(&opts.modes, true);
        let modestring = raw_modes.split(' ').next().unwrap_or("+");
        net.send(&format!(
            ":{server} UID {} 0 {} {} {} {uid} 0 {} * {} * :{}",
            user.nick, user.ts, user.ident, user.realhost, modestring, user.host, user.realname
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
        // Unreal subserver SIDs are allocated from the same template space
        // as TS6-style ones.
        let range = net.serverdata().sidrange;
        if range.is_empty() {
            return Err(OutgoingError::NotImplemented("spawn_server without sidrange"));
        }
        let generator = crate::ids::Ts6SidGenerator::new(&range)
            .map_err(|_| OutgoingError::UnknownTarget(range))?;
        let sid = loop {
            let candidate = generator
                .next_sid()
                .map_err(|_| OutgoingError::UnknownTarget("sid space exhausted".to_string()))?;
            if !net.servers.contains_key(&candidate) {
                break candidate;
            }
        };
        let uplink = net.sid();
        let mut server = Server::new(Some(&uplink), &name, true, desc);
        server.has_eob = true;
        net.servers.insert(sid.clone(), server);
        net.send(&format!(":{uplink} SID {name} 2 {sid} :{desc}"));
        net.send(&format!(":{sid} EOS"));
        Ok(sid)
    }

    fn join(&self, net: &Network, client: &str, channel: &str) -> OutgoingResult {
        // SJ3 handles single joins too, keeping the TS authoritative.
        let server = net
            .users
            .get(client)
            .map(|u| u.server.clone())
            .ok_or_else(|| OutgoingError::UnknownTarget(client.to_string()))?;
        self.sjoin(
            net,
            &server,
            channel,
            &[(String::new(), client.to_string())],
            None,
            &[],
        )
    }

    fn sjoin(
        &self,
        net: &Network,
        server: &str,
        channel: &str,
        users: &[(String, String)],
        ts: Option<i64>,
        modes_in: &[ModeChange],
    ) -> OutgoingResult {
        require_internal_server(net, server)?;
        let key = net.get_or_create_channel(channel);
        let ts = ts
            .or_else(|| net.channel_snapshot(&key).map(|c| c.ts))
            .unwrap_or_else(now_ts);
        if let Some(mut chan) = net.channels.get_mut(&key)
            && ts < chan.ts
        {
            chan.ts = ts;
        }
        let map = net.cmodes();
        let simple_modes: Vec<ModeChange> = modes_in
            .iter()
            .filter(|m| !map.is_list_mode(m.letter))
            .cloned()
            .collect();
        modes::apply_modes(net, &key, &simple_modes);

        let mut prefix_changes = Vec::new();
        for chunk in users.chunks(10) {
            let mut namelist = Vec::new();
            for (prefixes, uid) in chunk {
                let symbols: String = prefixes
                    .chars()
                    .filter_map(|letter| {
                        map.prefix_level_of_letter(letter)
                            .and_then(|level| map.prefix_symbol(level))
                    })
                    .collect();
                namelist.push(format!("{symbols}{uid}"));
                for letter in prefixes.chars() {
                    prefix_changes.push(ModeChange::plus(letter, Some(uid.as_str())));
                }
                net.add_user_to_channel(uid, &key);
            }
            let modestring = join_modes(&simple_modes, false);
            if modestring == "+" {
                net.send(&format!(
                    ":{server} SJOIN {ts} {key} :{}",
                    namelist.join(" ")
                ));
            } else {
                net.send(&format!(
                    ":{server} SJOIN {ts} {key} {modestring} :{}",
                    namelist.join(" ")
                ));
            }
        }
        modes::apply_modes(net, &key, &prefix_changes);
        Ok(())
    }

    fn part(&self, net: &Network, client: &str, channel: &str, reason: &str)
    -> OutgoingResult {
        require_internal_client(net, client)?;
        let key = net.to_lower(channel);
        if reason.is_empty() {
            net.send(&format!(":{client} PART {key}"));
        } else {
            net.send(&format!(":{client} PART {key} :{reason}"));
        }
        net.remove_user_from_channel(client, &key);
        Ok(())
    }

    fn quit(&self, net: &Network, client: &str, reason: &str) -> OutgoingResult {
        require_internal_client(net, client)?;
        net.send(&format!(":{client} QUIT :{reason}"));
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
        net.send(&format!(":{source} KICK {key} {target} :{reason}"));
        net.remove_user_from_channel(target, &key);
        Ok(())
    }

    fn kill(&self, net: &Network, source: &str, target: &str, reason: &str)
    -> OutgoingResult {
        require_internal(net, source)?;
        if !net.users.contains_key(target) {
            return Err(OutgoingError::UnknownTarget(target.to_string()));
        }
        net.send(&format!(":{source} KILL {target} :Killed ({reason})"));
        net.remove_client(target);
        Ok(())
    }

    fn nick(&self, net: &Network, client: &str, newnick: &str) -> OutgoingResult {
        require_internal_client(net, client)?;
        let ts = now_ts();
        net.send(&format!(":{client} NICK {newnick} {ts}"));
        if let Some(mut user) = net.users.get_mut(client) {
            user.nick = newnick.to_string();
            user.nick_ts = ts;
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
        if target.starts_with('#') {
            let key = net.to_lower(target);
            for line in wrap_modes(changes, 450, 12) {
                net.send(&format!(":{source} MODE {key} {line}"));
            }
        } else if net.is_internal_client(target) {
            // Self-modes use UMODE2.
            net.send(&format!(
                ":{target} UMODE2 {}",
                join_modes(changes, false)
            ));
        } else {
            net.send(&format!(
                ":{source} MODE {target} {}",
                join_modes(changes, false)
            ));
        }
        Ok(())
    }

    fn topic(&self, net: &Network, source: &str, channel: &str, text: &str)
    -> OutgoingResult {
        require_internal_client(net, source)?;
        let key = net.to_lower(channel);
        let setter = net.get_friendly_name(source);
        net.send(&format!(":{source} TOPIC {key} {setter} {} :{text}", now_ts()));
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
        let setter = net
            .servers
            .get(source)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| source.to_string());
        net.send(&format!(":{source} TOPIC {key} {setter} {} :{text}", now_ts()));
        if let Some(mut chan) = net.channels.get_mut(&key) {
            chan.topic = text.to_string();
            chan.topicset = true;
        }
        Ok(())
    }

    fn message(&self, net: &Network, source: &str, target: &str, text: &str)
    -> OutgoingResult {
        require_internal_client(net, source)?;
        net.send(&format!(":{source} PRIVMSG {target} :{text}"));
        Ok(())
    }

    fn notice(&self, net: &Network, source: &str, target: &str, text: &str)
    -> OutgoingResult {
        require_internal(net, source)?;
        net.send(&format!(":{source} NOTICE {target} :{text}"));
        Ok(())
    }

    fn invite(&self, net: &Network, source: &str, target: &str, channel: &str)
    -> OutgoingResult {
        require_internal_client(net, source)?;
        net.send(&format!(":{source} INVITE {target} {}", net.to_lower(channel)));
        Ok(())
    }

    fn knock(&self, net: &Network, source: &str, channel: &str, text: &str)
    -> OutgoingResult {
        require_internal_client(net, source)?;
        net.send(&format!(":{source} KNOCK {} :{text}", net.to_lower(channel)));
        Ok(())
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
        net: &Network,
        target: &str,
        field: ClientField,
        text: &str,
    ) -> OutgoingResult {
        if !net.users.contains_key(target) {
            return Err(OutgoingError::UnknownTarget(target.to_string()));
        }
        let verb = match field {
            ClientField::Host => "CHGHOST",
            ClientField::Ident => "CHGIDENT",
            ClientField::Gecos => "CHGNAME",
        };
        net.send(&format!(":{} {verb} {target} :{text}", net.sid()));
        if let Some(mut user) = net.users.get_mut(target) {
            match field {
                ClientField::Host => user.host = text.to_string(),
                ClientField::Ident => user.ident = text.to_string(),
                ClientField::Gecos => user.realname = text.to_string(),
            }
        }
        Ok(())
    }

    fn away(&self, net: &Network, client: &str, text: &str) -> OutgoingResult {
        require_internal_client(net, client)?;
        if text.is_empty() {
            net.send(&format!(":{client} AWAY"));
        } else {
            net.send(&format!(":{client} AWAY :{text}"));
        }
        if let Some(mut user) = net.users.get_mut(client) {
            user.away = text.to_string();
        }
        Ok(())
    }

    fn ping(&self, net: &Network) {
        let sid = net.sid();
        if let Some(uplink) = net.uplink() {
            let ours = net.serverdata().hostname;
            let theirs = net
                .servers
                .get(&uplink)
                .map(|s| s.name.clone())
                .unwrap_or(uplink);
            net.send(&format!(":{sid} PING {ours} {theirs}"));
        }
    }

    fn squit(&self, net: &Network, source: &str, target: &str, reason: &str)
    -> OutgoingResult {
        require_internal_server(net, source)?;
        let name = net
            .servers
            .get(target)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| target.to_string());
        net.send(&format!(":{source} SQUIT {name} :{reason}"));
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

    fn unreal_net() -> Arc<Network> {
        let net = test_net_with_protocol("unet", "unreal");
        net.protocol.post_connect(&net).unwrap();
        net.protocol.handle_line(&net, "PASS :linkage").unwrap();
        net.protocol
            .handle_line(
                &net,
                "PROTOCTL NOQUIT NICKv2 SJOIN SJOIN2 UMODE2 VL SJ3 NICKIP ESVID",
            )
            .unwrap();
        net.protocol
            .handle_line(
                &net,
                "PROTOCTL CHANMODES=beI,kfL,lj,psmntirzMQNRTOVKDdGPZSCc SID=001 MLOCK TS=1441314501",
            )
            .unwrap();
        net.protocol
            .handle_line(
                &net,
                "SERVER unreal.example.net 1 :U4000-Fhin6OoEM UnrealIRCd test server",
            )
            .unwrap();
        net
    }

    fn intro(net: &Network, nick: &str, uid: &str) {
        net.protocol
            .handle_line(
                net,
                &format!(
                    ":001 UID {nick} 0 1441306929 {nick} localhost {uid} 0 +iwx * cloaked.example fwAAAQ== :real"
                ),
            )
            .unwrap();
    }

    #[test]
    fn test_handshake_requires_protoctl_caps() {
        let net = test_net_with_protocol("unet", "unreal");
        net.protocol.handle_line(&net, "PASS :linkage").unwrap();
        net.protocol
            .handle_line(&net, "PROTOCTL NOQUIT SID=001")
            .unwrap();
        let err = net
            .protocol
            .handle_line(&net, "SERVER unreal.example.net 1 :U4000-x desc")
            .unwrap_err();
        assert!(matches!(err, ProtocolError::MissingCapability(_)));
    }

    #[test]
    fn test_old_version_rejected() {
        let net = test_net_with_protocol("unet", "unreal");
        net.protocol.handle_line(&net, "PASS :linkage").unwrap();
        net.protocol
            .handle_line(
                &net,
                "PROTOCTL NOQUIT NICKv2 SJOIN UMODE2 VL SJ3 CHANMODES=beI,k,l,mnt SID=001",
            )
            .unwrap();
        let err = net
            .protocol
            .handle_line(&net, "SERVER unreal.example.net 1 :U3998-x desc")
            .unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedHandshake(_)));
    }

    #[test]
    fn test_uid_and_sjoin_with_symbols() {
        let net = unreal_net();
        intro(&net, "GL", "001AAAAAB");
        intro(&net, "dan", "001AAAAAC");
        net.protocol
            .handle_line(&net, ":001 SJOIN 1444361345 #test :@001AAAAAB +001AAAAAC &bad!*@*")
            .unwrap();
        let chan = net.channel_snapshot("#test").unwrap();
        assert!(chan.has_prefix(PrefixLevel::Op, "001AAAAAB"));
        assert!(chan.has_prefix(PrefixLevel::Voice, "001AAAAAC"));
        assert!(chan.modes.contains(&('b', Some("bad!*@*".to_string()))));
    }

    #[test]
    fn test_umode2_applies_to_sender() {
        let net = unreal_net();
        intro(&net, "GL", "001AAAAAB");
        let events = net
            .protocol
            .handle_line(&net, ":GL UMODE2 +o")
            .unwrap();
        assert_eq!(events[0].command, "MODE");
        assert_eq!(events[1].command, "CLIENT_OPERED");
        assert!(net.users.get("001AAAAAB").unwrap().has_mode('o'));
    }

    #[test]
    fn test_eos_is_endburst() {
        let net = unreal_net();
        let events = net.protocol.handle_line(&net, ":001 EOS").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].command, "ENDBURST");
    }

    #[test]
    fn test_nick_sender_resolution() {
        let net = unreal_net();
        intro(&net, "GL", "001AAAAAB");
        net.protocol
            .handle_line(&net, ":GL NICK GL|away 1441400000")
            .unwrap();
        assert_eq!(net.users.get("001AAAAAB").unwrap().nick, "GL|away");
    }
}
