//! InspIRCd 2.x (protocol 1202) SPANNINGTREE driver.
//!
//! InspIRCd advertises its full named-mode list during CAPAB negotiation,
//! so the mode maps are populated from the wire instead of static tables.
//! Bursts are delimited by explicit BURST/ENDBURST.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{OutgoingError, OutgoingResult, ProtocolError};
use crate::hooks::{HookEvent, HookPayload};
use crate::ids::{Ts6SidGenerator, Ts6UidGenerator};
use crate::modes::{self, ModeChange, join_modes, wrap_modes};
use crate::protocols::{
    ClientField, Protocol, ProtocolCaps, SpawnOpts, base, require_internal,
    require_internal_client, require_internal_server,
};
use crate::state::{Network, PrefixLevel, Server, now_ts};

struct InspState {
    uidgens: HashMap<String, Ts6UidGenerator>,
    sidgen: Option<Ts6SidGenerator>,
}

pub struct InspircdProtocol {
    caps: ProtocolCaps,
    state: Mutex<InspState>,
}

impl InspircdProtocol {
    pub fn new() -> Self {
        Self {
            caps: ProtocolCaps {
                can_spawn_clients: true,
                has_ts: true,
                can_host_relay: true,
                can_track_servers: true,
                slash_in_nicks: false,
                slash_in_hosts: true,
                underscore_in_hosts: true,
                has_statusmsg: true,
                needs_eob_synth: false,
            },
            state: Mutex::new(InspState {
                uidgens: HashMap::new(),
                sidgen: None,
            }),
        }
    }

    fn level_for_letter(letter: char) -> Option<PrefixLevel> {
        match letter {
            'q' => Some(PrefixLevel::Owner),
            'a' => Some(PrefixLevel::Admin),
            'o' => Some(PrefixLevel::Op),
            'h' => Some(PrefixLevel::Halfop),
            'v' => Some(PrefixLevel::Voice),
            _ => None,
        }
    }

    /// CAPAB CHANMODES/USERMODES carry "name=char" pairs; prefix modes come
    /// as "name=symbol+char" ("op=@o").
    fn absorb_named_modes(&self, net: &Network, args: &[String], user_modes: bool) {
        let pairs = args.last().cloned().unwrap_or_default();
        for pair in pairs.split_whitespace() {
            let Some((name, chars)) = pair.split_once('=') else {
                continue;
            };
            let Some(letter) = chars.chars().last() else {
                continue;
            };
            if user_modes {
                net.with_umodes(|map| map.insert(name, letter));
            } else {
                net.with_cmodes(|map| map.insert(name, letter));
            }
        }
    }

    fn handle_capabilities(&self, net: &Network, args: &[String]) -> Result<(), ProtocolError> {
        // <- CAPAB CAPABILITIES :NICKMAX=21 ... PROTOCOL=1202
        //    PREFIX=(Yqaohv)!~&@%+ CHANMODES=IXbegw,k,FHJLfjl,ACKMNOPQRSTUcimnprstz
        let caps = base::parse_capabilities(&args.last().cloned().unwrap_or_default());
        if let Some(proto) = caps.get("PROTOCOL") {
            let version: u32 = proto.parse().unwrap_or(0);
            if version < 1202 {
                return Err(ProtocolError::MalformedHandshake(format!(
                    "remote protocol version {version} is too old (need 1202+)"
                )));
            }
        }
        if let Some(nickmax) = caps.get("NICKMAX")
            && let Ok(len) = nickmax.parse::<usize>()
        {
            net.maxnicklen
                .store(len, std::sync::atomic::Ordering::SeqCst);
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
        if let Some(usermodes) = caps.get("USERMODES") {
            let classes: Vec<&str> = usermodes.split(',').collect();
            if classes.len() == 4 {
                net.with_umodes(|map| {
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
                    Self::level_for_letter(letter).map(|level| (level, letter, symbol))
                })
                .collect();
            net.with_cmodes(|map| map.set_prefixes(&prefixes));
        }
        Ok(())
    }

    fn handle_fjoin(&self, net: &Network, sender: &str, args: &[String]) -> Vec<HookEvent> {
        // <- :70M FJOIN #chat 1423790411 +nt :o,1SRAABIT4 v,1IOAAF53R ,1SRAAGH34
        if args.len() < 3 {
            return Vec::new();
        }
        let (channel, ts, userlist) = (&args[0], &args[1], &args[args.len() - 1]);
        let their_ts: i64 = ts.parse().unwrap_or_else(|_| now_ts());
        let key = net.get_or_create_channel(channel);
        let mode_args: Vec<&str> = args[2..args.len() - 1].iter().map(String::as_str).collect();
        let parsed = if mode_args.is_empty() {
            Vec::new()
        } else {
            modes::parse_modes(net, &key, &mode_args)
        };
        let users: Vec<(String, String)> = userlist
            .split_whitespace()
            .filter_map(|entry| {
                entry
                    .split_once(',')
                    .map(|(prefixes, uid)| (prefixes.to_string(), uid.to_string()))
            })
            .collect();
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

    fn handle_uid(&self, net: &Network, sender: &str, args: &[String]) -> Vec<HookEvent> {
        // <- :70M UID 70MAAAAAB 1429934638 GL 0::1 hidden.IP gl 0::1 1429934638 +Wiosw +ACGKNOQXacfgklnoqvx :realname
        if args.len() < 10 {
            warn!(net = %net.name, "malformed UID introduction");
            return Vec::new();
        }
        let (uid, ts, nick, realhost, host, ident, ip) = (
            &args[0], &args[1], &args[2], &args[3], &args[4], &args[5], &args[6],
        );
        let realname = args.last().cloned().unwrap_or_default();
        let ts: i64 = ts.parse().unwrap_or_else(|_| now_ts());
        base::register_user(net, sender, uid, nick, ts, ident, host, realhost, ip, &realname);
        let mode_args: Vec<&str> = args[8..args.len() - 1].iter().map(String::as_str).collect();
        let parsed = modes::parse_modes(net, uid, &mode_args);
        modes::apply_modes(net, uid, &parsed);
        vec![HookEvent::new(
            sender,
            HookPayload::Uid {
                uid: uid.clone(),
                ts,
                nick: nick.clone(),
                ident: ident.clone(),
                host: host.clone(),
                realhost: Some(realhost.clone()),
                ip: ip.clone(),
            },
        )]
    }
}

impl Default for InspircdProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol for InspircdProtocol {
    fn name(&self) -> &'static str {
        "inspircd"
    }

    fn caps(&self) -> &ProtocolCaps {
        &self.caps
    }

    fn post_connect(&self, net: &Network) -> Result<(), ProtocolError> {
        *self.state.lock() = InspState {
            uidgens: HashMap::new(),
            sidgen: None,
        };
        let conf = net.serverdata();
        net.send("CAPAB START 1202");
        net.send("CAPAB CAPABILITIES :PROTOCOL=1202");
        net.send("CAPAB END");
        net.send(&format!(
            "SERVER {} {} 0 {} :{}",
            conf.hostname,
            conf.sendpass,
            conf.sid,
            conf.serverdesc
                .unwrap_or_else(|| net.config().bot.serverdesc.clone())
        ));
        net.send(&format!(":{} BURST {}", conf.sid, now_ts()));
        net.send(&format!(":{} ENDBURST", conf.sid));
        Ok(())
    }

    fn handle_line(
        &self,
        net: &Network,
        line: &str,
    ) -> Result<Vec<HookEvent>, ProtocolError> {
        let Some((sender, command, mut args)) = base::split_line(line) else {
            return Ok(Vec::new());
        };
        if command == "ERROR" {
            return Err(ProtocolError::UplinkError(
                args.last().cloned().unwrap_or_default(),
            ));
        }

        if sender.is_none() {
            match command.as_str() {
                "SERVER" => {
                    // <- SERVER inspircd.example.net linkpass 0 70M :desc
                    if args.get(1).map(String::as_str)
                        != Some(net.serverdata().recvpass.as_str())
                    {
                        return Err(ProtocolError::BadPassword);
                    }
                    let (Some(name), Some(sid)) = (args.first(), args.get(3)) else {
                        return Err(ProtocolError::MalformedHandshake(line.to_string()));
                    };
                    net.servers.insert(
                        sid.clone(),
                        Server::new(None, name, false, &args.last().cloned().unwrap_or_default()),
                    );
                    net.set_uplink(sid);
                    return Ok(Vec::new());
                }
                "CAPAB" => {
                    match args.first().map(String::as_str) {
                        Some("CHANMODES") => self.absorb_named_modes(net, &args, false),
                        Some("USERMODES") => self.absorb_named_modes(net, &args, true),
                        Some("CAPABILITIES") => self.handle_capabilities(net, &args)?,
                        Some("END") => {
                            net.connected
                                .store(true, std::sync::atomic::Ordering::SeqCst);
                        }
                        _ => {}
                    }
                    return Ok(Vec::new());
                }
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
                // <- :70M PING 70M 0AL
                let destination = args.get(1).cloned().unwrap_or_else(|| net.sid());
                if net.is_internal_server(&destination) {
                    let origin = args.first().cloned().unwrap_or_default();
                    net.send(&format!(":{destination} PONG {destination} {origin}"));
                }
                Ok(Vec::new())
            }
            "PONG" => Ok(Vec::new()),
            "BURST" => Ok(Vec::new()),
            "ENDBURST" => {
                if let Some(mut server) = net.servers.get_mut(&sender) {
                    server.has_eob = true;
                }
                if Some(sender.clone()) == net.uplink() {
                    Ok(vec![HookEvent::new(&sender, HookPayload::Endburst)])
                } else {
                    Ok(Vec::new())
                }
            }
            "SERVER" => {
                // <- :70M SERVER leaf.example.net * 1 1ML :desc
                let (Some(name), Some(sid)) = (args.first(), args.get(3)) else {
                    return Ok(Vec::new());
                };
                base::register_server(
                    net,
                    Some(&sender),
                    sid,
                    name,
                    &args.last().cloned().unwrap_or_default(),
                );
                Ok(Vec::new())
            }
            "UID" => Ok(self.handle_uid(net, &sender, &args)),
            "FJOIN" => Ok(self.handle_fjoin(net, &sender, &args)),
            "FMODE" => {
                // <- :70MAAAAAA FMODE #chat 1433653462 +ov 70MAAAAAA 70MAAAAAD
                if args.len() < 3 {
                    return Ok(Vec::new());
                }
                let key = net.to_lower(&args[0]);
                let oldchan = net.channel_snapshot(&key);
                let mode_args: Vec<&str> = args[2..].iter().map(String::as_str).collect();
                let parsed = modes::parse_modes(net, &key, &mode_args);
                modes::apply_modes(net, &key, &parsed);
                Ok(vec![HookEvent::renamed(
                    &sender,
                    "MODE",
                    HookPayload::Mode {
                        target: key,
                        modes: parsed,
                        channeldata: oldchan,
                    },
                )])
            }
            "MODE" => {
                // <- :70MAAAAAA MODE 70MAAAAAA -i+xc
                let Some(target) = args.first().cloned() else {
                    return Ok(Vec::new());
                };
                if args.len() < 2 {
                    return Ok(Vec::new());
                }
                let mode_args: Vec<&str> = args[1..].iter().map(String::as_str).collect();
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
            "OPERTYPE" => {
                // <- :70MAAAAAB OPERTYPE Network_Owner
                let opertype = args
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "IRC Operator".to_string())
                    .replace('_', " ");
                let change = vec![ModeChange::plus('o', None)];
                modes::apply_modes(net, &sender, &change);
                if let Some(mut user) = net.users.get_mut(&sender) {
                    user.opertype = opertype.clone();
                }
                Ok(vec![
                    HookEvent::new(
                        &sender,
                        HookPayload::Mode {
                            target: sender.clone(),
                            modes: change,
                            channeldata: None,
                        },
                    ),
                    HookEvent::new(&sender, HookPayload::Opered { opertype }),
                ])
            }
            "METADATA" => {
                // <- :70M METADATA 70MAAAAAB accountname :GL
                let (Some(target), Some(key)) = (args.first(), args.get(1)) else {
                    return Ok(Vec::new());
                };
                if key != "accountname" {
                    return Ok(Vec::new());
                }
                let account = args.last().cloned().unwrap_or_default();
                let target = target.clone();
                if let Some(mut user) = net.users.get_mut(&target) {
                    user.services_account = account.clone();
                }
                Ok(vec![HookEvent::new(
                    &target,
                    HookPayload::ServicesLogin { account },
                )])
            }
            "FTOPIC" => {
                // <- :70M FTOPIC #channel 1434510754 setter :topic
                let (Some(channel), Some(ts)) = (args.first(), args.get(1)) else {
                    return Ok(Vec::new());
                };
                let key = net.to_lower(channel);
                let topic = args.last().cloned().unwrap_or_default();
                let oldtopic = net.channel_snapshot(&key).map(|c| c.topic);
                if let Some(mut chan) = net.channels.get_mut(&key) {
                    chan.topic = topic.clone();
                    chan.topicset = true;
                }
                Ok(vec![HookEvent::renamed(
                    &sender,
                    "TOPIC",
                    HookPayload::Topic {
                        channel: key,
                        text: topic,
                        oldtopic,
                        setter: args.get(2).cloned().unwrap_or_default(),
                        ts: ts.parse().unwrap_or_else(|_| now_ts()),
                    },
                )])
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
            "PART" => {
                let Some(chans) = args.first() else {
                    return Ok(Vec::new());
                };
                let channels: Vec<String> = chans.split(',').map(|c| net.to_lower(c)).collect();
                for chan in &channels {
                    net.remove_user_from_channel(&sender, chan);
                }
                Ok(vec![HookEvent::new(
                    &sender,
                    HookPayload::Part {
                        channels,
                        text: args.get(1).cloned().unwrap_or_default(),
                    },
                )])
            }
            "QUIT" => {
                net.remove_client(&sender);
                Ok(vec![HookEvent::new(
                    &sender,
                    HookPayload::Quit {
                        text: args.first().cloned().unwrap_or_default(),
                    },
                )])
            }
            "KILL" => {
                let Some(target) = args.first().cloned() else {
                    return Ok(Vec::new());
                };
                let text =
                    base::kill_message(net, &sender, &args.last().cloned().unwrap_or_default());
                let userdata = net.remove_client(&target);
                Ok(vec![HookEvent::new(
                    &sender,
                    HookPayload::Kill {
                        target,
                        text,
                        userdata,
                    },
                )])
            }
            "KICK" => {
                let (Some(channel), Some(target)) = (args.first(), args.get(1)) else {
                    return Ok(Vec::new());
                };
                let key = net.to_lower(channel);
                let target = target.clone();
                net.remove_user_from_channel(&target, &key);
                Ok(vec![HookEvent::new(
                    &sender,
                    HookPayload::Kick {
                        channel: key,
                        target,
                        text: args.get(2).cloned().unwrap_or_default(),
                    },
                )])
            }
            "NICK" => {
                let Some(newnick) = args.first().cloned() else {
                    return Ok(Vec::new());
                };
                let ts: i64 = args
                    .get(1)
                    .and_then(|t| t.parse().ok())
                    .unwrap_or_else(now_ts);
                let oldnick = net.get_friendly_name(&sender);
                if let Some(mut user) = net.users.get_mut(&sender) {
                    user.nick = newnick.clone();
                    user.nick_ts = ts;
                }
                Ok(vec![HookEvent::new(
                    &sender,
                    HookPayload::Nick {
                        newnick,
                        oldnick,
                        ts,
                    },
                )])
            }
            "SAVE" => {
                let Some(target) = args.first().cloned() else {
                    return Ok(Vec::new());
                };
                if let Some(mut user) = net.users.get_mut(&target) {
                    user.nick = target.clone();
                }
                Ok(vec![HookEvent::new(&sender, HookPayload::Save { target })])
            }
            "AWAY" => {
                let text = args.last().cloned().unwrap_or_default();
                if let Some(mut user) = net.users.get_mut(&sender) {
                    user.away = text.clone();
                }
                Ok(vec![HookEvent::new(&sender, HookPayload::Away { text })])
            }
            "INVITE" => {
                let (Some(target), Some(channel)) = (args.first(), args.get(1)) else {
                    return Ok(Vec::new());
                };
                Ok(vec![HookEvent::new(
                    &sender,
                    HookPayload::Invite {
                        target: target.clone(),
                        channel: net.to_lower(channel),
                    },
                )])
            }
            "FHOST" => {
                // <- :70MAAAAAB FHOST some.new.host
                let Some(newhost) = args.first().cloned() else {
                    return Ok(Vec::new());
                };
                if let Some(mut user) = net.users.get_mut(&sender) {
                    user.host = newhost.clone();
                }
                Ok(vec![HookEvent::new(
                    &sender,
                    HookPayload::ChgHost {
                        target: sender.clone(),
                        newhost,
                    },
                )])
            }
            "CHGHOST" | "CHGIDENT" | "CHGNAME" => {
                let (Some(target), Some(value)) = (args.first().cloned(), args.get(1).cloned())
                else {
                    return Ok(Vec::new());
                };
                let payload = match command.as_str() {
                    "CHGHOST" => {
                        if let Some(mut user) = net.users.get_mut(&target) {
                            user.host = value.clone();
                        }
                        HookPayload::ChgHost {
                            target,
                            newhost: value,
                        }
                    }
                    "CHGIDENT" => {
                        if let Some(mut user) = net.users.get_mut(&target) {
                            user.ident = value.clone();
                        }
                        HookPayload::ChgIdent {
                            target,
                            newident: value,
                        }
                    }
                    _ => {
                        if let Some(mut user) = net.users.get_mut(&target) {
                            user.realname = value.clone();
                        }
                        HookPayload::ChgName {
                            target,
                            newgecos: value,
                        }
                    }
                };
                Ok(vec![HookEvent::new(&sender, payload)])
            }
            "ENCAP" => {
                // <- :70MAAAAAA ENCAP * KNOCK #blah :reason
                if args.first().map(String::as_str) == Some("*")
                    && args.get(1).map(String::as_str) == Some("KNOCK")
                    && let Some(channel) = args.get(2)
                {
                    return Ok(vec![HookEvent::new(
                        &sender,
                        HookPayload::Knock {
                            channel: net.to_lower(channel),
                            text: args.last().cloned().unwrap_or_default(),
                        },
                    )]);
                }
                Ok(Vec::new())
            }
            "SQUIT" => {
                let Some(target) = args.first() else {
                    return Ok(Vec::new());
                };
                let reason = args.last().cloned().unwrap_or_default();
                let payload = base::squit_common(net, target, &reason)?;
                Ok(vec![HookEvent::new(&sender, payload)])
            }
            "RSQUIT" => {
                // Oper-requested remote squit; without an ACL store we
                // never honour these ourselves.
                debug!(net = %net.name, "ignoring RSQUIT request");
                Ok(Vec::new())
            }
            "PRIVMSG" | "NOTICE" => {
                let (Some(target), Some(text)) = (args.first(), args.get(1)) else {
                    return Ok(Vec::new());
                };
                let target = base::resolve_msg_target(net, target);
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
                Ok(vec![HookEvent::new(&sender, payload)])
            }
            "IDLE" => {
                // Remote WHOIS: reply with a zero idle time.
                let Some(target) = args.first() else {
                    return Ok(Vec::new());
                };
                if let Some(signon) = net.users.get(target).map(|u| u.ts) {
                    net.send(&format!(":{target} IDLE {sender} {signon} 0"));
                }
                Ok(vec![HookEvent::new(
                    &sender,
                    HookPayload::Whois {
                        target: target.clone(),
                        server: net.sid(),
                    },
                )])
            }
            _ => {
                debug!(net = %net.name, command = %command, "unhandled command");
                Ok(Vec::new())
            }
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
        let modestring = join_modes(&opts.modes, true);
        let modestring = modestring.split(' ').next().unwrap_or("+");
        net.send(&format!(
            ":{server} UID {uid} {} {} {} {} {} {} {} {} + :{}",
            user.ts,
            user.nick,
            user.realhost,
            user.host,
            user.ident,
            user.ip,
            user.ts,
            modestring,
            user.realname
        ));
        if !opts.opertype.is_empty() {
            net.send(&format!(":{uid} OPERTYPE {}", opts.opertype.replace(' ', "_")));
        }
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
        let sid = {
            let mut state = self.state.lock();
            if state.sidgen.is_none() {
                let range = net.serverdata().sidrange;
                if range.is_empty() {
                    return Err(OutgoingError::NotImplemented("spawn_server without sidrange"));
                }
                state.sidgen = Some(
                    Ts6SidGenerator::new(&range)
                        .map_err(|_| OutgoingError::UnknownTarget(range))?,
                );
            }
            let generator = state.sidgen.as_ref().expect("just initialised");
            loop {
                let candidate = generator.next_sid().map_err(|_| {
                    OutgoingError::UnknownTarget("sid space exhausted".to_string())
                })?;
                if !net.servers.contains_key(&candidate) {
                    break candidate;
                }
            }
        };
        let uplink = net.sid();
        let mut server = Server::new(Some(&uplink), &name, true, desc);
        server.has_eob = true;
        net.servers.insert(sid.clone(), server);
        net.send(&format!(":{uplink} SERVER {name} * 1 {sid} :{desc}"));
        net.send(&format!(":{sid} ENDBURST"));
        Ok(sid)
    }

    fn join(&self, net: &Network, client: &str, channel: &str) -> OutgoingResult {
        require_internal_client(net, client)?;
        let server = net
            .users
            .get(client)
            .map(|u| u.server.clone())
            .ok_or_else(|| OutgoingError::UnknownTarget(client.to_string()))?;
        let key = net.get_or_create_channel(channel);
        let ts = net.channel_snapshot(&key).map(|c| c.ts).unwrap_or_else(now_ts);
        net.send(&format!(":{server} FJOIN {key} {ts} + :,{client}"));
        net.add_user_to_channel(client, &key);
        Ok(())
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
            let namelist: Vec<String> = chunk
                .iter()
                .map(|(prefixes, uid)| format!("{prefixes},{uid}"))
                .collect();
            net.send(&format!(
                ":{server} FJOIN {key} {ts} {} :{}",
                join_modes(&simple_modes, false),
                namelist.join(" ")
            ));
            for (prefixes, uid) in chunk {
                net.add_user_to_channel(uid, &key);
                for letter in prefixes.chars() {
                    prefix_changes.push(ModeChange::plus(letter, Some(uid.as_str())));
                }
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
        let reason = if reason.is_empty() {
            "No reason given"
        } else {
            reason
        };
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
            let ts = net.channel_snapshot(&key).map(|c| c.ts).unwrap_or_else(now_ts);
            for line in wrap_modes(changes, 450, 20) {
                net.send(&format!(":{source} FMODE {key} {ts} {line}"));
            }
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
        net.send(&format!(":{source} TOPIC {key} :{text}"));
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
        net.send(&format!(
            ":{source} FTOPIC {key} {} {setter} :{text}",
            now_ts()
        ));
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
        net.send(&format!(":{source} INVITE {target} {} 0", net.to_lower(channel)));
        Ok(())
    }

    fn knock(&self, net: &Network, source: &str, channel: &str, text: &str)
    -> OutgoingResult {
        require_internal_client(net, source)?;
        net.send(&format!(
            ":{source} ENCAP * KNOCK {} :{text}",
            net.to_lower(channel)
        ));
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
        // InspIRCd routes numerics to remote users via PUSH.
        let nick = net.get_friendly_name(target);
        let servername = net
            .servers
            .get(source)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| source.to_string());
        net.send(&format!(
            ":{source} PUSH {target} ::{servername} {numeric:03} {nick} {text}"
        ));
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
            net.send(&format!(":{client} AWAY {} :{text}", now_ts()));
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

    fn insp_net() -> Arc<Network> {
        let net = test_net_with_protocol("inspnet", "inspircd");
        net.protocol
            .handle_line(&net, "CAPAB START 1202")
            .unwrap();
        net.protocol
            .handle_line(
                &net,
                "CAPAB CHANMODES :ban=b banexception=e invex=I key=k limit=l moderated=m \
                 noextmsg=n topiclock=t secret=s op=@o voice=+v halfop=%h owner=~q admin=&a",
            )
            .unwrap();
        net.protocol
            .handle_line(&net, "CAPAB USERMODES :invisible=i oper=o wallops=w hideoper=H")
            .unwrap();
        net.protocol
            .handle_line(
                &net,
                "CAPAB CAPABILITIES :NICKMAX=21 MAXMODES=20 PROTOCOL=1202 PREFIX=(qaohv)~&@%+ \
                 CHANMODES=Ibe,k,l,mnst USERMODES=,,s,Hiow",
            )
            .unwrap();
        net.protocol.handle_line(&net, "CAPAB END").unwrap();
        net.protocol
            .handle_line(&net, "SERVER insp.example.net linkage 0 70M :InspIRCd test")
            .unwrap();
        net
    }

    #[test]
    fn test_capab_populates_mode_maps() {
        let net = insp_net();
        let cmodes = net.cmodes();
        assert_eq!(cmodes.letter("banexception"), Some('e'));
        assert_eq!(cmodes.type_a, "Ibe");
        assert_eq!(cmodes.prefix_letter(PrefixLevel::Owner), Some('q'));
        assert_eq!(cmodes.prefix_symbol(PrefixLevel::Halfop), Some('%'));
        assert_eq!(
            net.maxnicklen.load(std::sync::atomic::Ordering::SeqCst),
            21
        );
    }

    #[test]
    fn test_old_protocol_is_fatal() {
        let net = test_net_with_protocol("inspnet", "inspircd");
        let err = net
            .protocol
            .handle_line(&net, "CAPAB CAPABILITIES :PROTOCOL=1201")
            .unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedHandshake(_)));
    }

    #[test]
    fn test_wrong_password_is_fatal() {
        let net = test_net_with_protocol("inspnet", "inspircd");
        let err = net
            .protocol
            .handle_line(&net, "SERVER insp.example.net bad 0 70M :desc")
            .unwrap_err();
        assert!(matches!(err, ProtocolError::BadPassword));
    }

    #[test]
    fn test_fmode_with_prefixes() {
        let net = insp_net();
        net.protocol
            .handle_line(
                &net,
                ":70M UID 70MAAAAAB 1429934638 GL gl.example gl.example gl 10.0.0.1 1429934638 +i + :gl",
            )
            .unwrap();
        net.protocol
            .handle_line(
                &net,
                ":70M UID 70MAAAAAC 1429934638 dan dan.example dan.example dan 10.0.0.2 1429934638 +i + :dan",
            )
            .unwrap();
        net.protocol
            .handle_line(&net, ":70M FJOIN #chan 123 +nt :,70MAAAAAB ,70MAAAAAC")
            .unwrap();

        let events = net
            .protocol
            .handle_line(
                &net,
                ":70M FMODE #chan 123 +ovb 70MAAAAAB 70MAAAAAC *!*@bad",
            )
            .unwrap();
        let HookPayload::Mode { modes, .. } = &events[0].payload else {
            panic!("expected MODE");
        };
        assert_eq!(modes.len(), 3);
        let chan = net.channel_snapshot("#chan").unwrap();
        assert!(chan.has_prefix(PrefixLevel::Op, "70MAAAAAB"));
        assert!(chan.has_prefix(PrefixLevel::Voice, "70MAAAAAC"));
        assert!(chan.modes.contains(&('b', Some("*!*@bad".to_string()))));
    }

    #[test]
    fn test_opertype_emits_opered() {
        let net = insp_net();
        net.protocol
            .handle_line(
                &net,
                ":70M UID 70MAAAAAB 1429934638 GL gl.example gl.example gl 10.0.0.1 1429934638 +i + :gl",
            )
            .unwrap();
        let events = net
            .protocol
            .handle_line(&net, ":70MAAAAAB OPERTYPE Network_Owner")
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].command, "CLIENT_OPERED");
        let user = net.users.get("70MAAAAAB").unwrap();
        assert!(user.has_mode('o'));
        assert_eq!(user.opertype, "Network Owner");
    }

    #[test]
    fn test_endburst_from_uplink() {
        let net = insp_net();
        let events = net.protocol.handle_line(&net, ":70M ENDBURST").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].command, "ENDBURST");
    }
}
