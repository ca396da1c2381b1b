//! P10 protocol driver (ircu, snircd, nefarious2).
//!
//! P10 lines are prefixed by raw base64 numerics instead of ":"-sender
//! fields and use one/two-letter command tokens. IP addresses are encoded
//! in a base64 variant with `[]` as the extra characters; IPv6 addresses
//! are three characters per 16-bit chunk with `_` standing in for `::`.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{OutgoingError, OutgoingResult, ProtocolError};
use crate::hooks::{HookEvent, HookPayload};
use crate::ids::{P10SidGenerator, P10UidGenerator, p10_b64decode, p10_b64encode};
use crate::modes::{self, ModeChange, ModeMap, join_modes, wrap_modes};
use crate::protocols::{
    ClientField, Protocol, ProtocolCaps, SpawnOpts, base, require_internal,
    require_internal_client, require_internal_server,
};
use crate::state::{Casemapping, Network, PrefixLevel, Server, now_ts};

/// Token -> command translation for the commands we handle.
const COMMAND_TOKENS: &[(&str, &str)] = &[
    ("AC", "ACCOUNT"),
    ("A", "AWAY"),
    ("B", "BURST"),
    ("CM", "CLEARMODE"),
    ("C", "CREATE"),
    ("EB", "END_OF_BURST"),
    ("EA", "EOB_ACK"),
    ("Y", "ERROR"),
    ("I", "INVITE"),
    ("J", "JOIN"),
    ("K", "KICK"),
    ("D", "KILL"),
    ("M", "MODE"),
    ("N", "NICK"),
    ("O", "NOTICE"),
    ("OM", "OPMODE"),
    ("L", "PART"),
    ("PA", "PASS"),
    ("G", "PING"),
    ("Z", "PONG"),
    ("P", "PRIVMSG"),
    ("Q", "QUIT"),
    ("S", "SERVER"),
    ("SQ", "SQUIT"),
    ("SH", "SETHOST"),
    ("SN", "SVSNICK"),
    ("T", "TOPIC"),
    ("WC", "WALLCHOPS"),
    ("WH", "WALLHOPS"),
    ("WV", "WALLVOICES"),
    ("W", "WHOIS"),
];

/// Decode a P10-encoded IP address.
pub fn decode_p10_ip(encoded: &str) -> Option<String> {
    if encoded.len() == 6 && !encoded.contains('_') {
        // IPv4: one 32-bit number.
        let n = p10_b64decode(encoded)? as u32;
        let octets = n.to_be_bytes();
        return Some(format!(
            "{}.{}.{}.{}",
            octets[0], octets[1], octets[2], octets[3]
        ));
    }
    // IPv6: 3 chars per 16-bit chunk, "_" for "::".
    let (head, tail) = match encoded.split_once('_') {
        Some((h, t)) => (h, t),
        None => (encoded, ""),
    };
    let decode_chunks = |part: &str| -> Option<Vec<u16>> {
        part.as_bytes()
            .chunks(3)
            .map(|chunk| {
                let s = std::str::from_utf8(chunk).ok()?;
                p10_b64decode(s).map(|n| n as u16)
            })
            .collect()
    };
    let head_chunks = decode_chunks(head)?;
    let tail_chunks = decode_chunks(tail)?;
    let mut chunks = head_chunks;
    while chunks.len() + tail_chunks.len() < 8 {
        chunks.push(0);
    }
    chunks.extend(tail_chunks);
    if chunks.len() != 8 {
        return None;
    }
    let addr = std::net::Ipv6Addr::new(
        chunks[0], chunks[1], chunks[2], chunks[3], chunks[4], chunks[5], chunks[6], chunks[7],
    );
    let mut text = addr.to_string();
    if text.starts_with(':') {
        // Keep a leading :: from being mistaken for a trailing argument.
        text.insert(0, '0');
    }
    Some(text)
}

/// Encode an IP address into P10 form.
pub fn encode_p10_ip(ip: &str) -> String {
    if let Ok(v4) = ip.parse::<std::net::Ipv4Addr>() {
        return p10_b64encode(u32::from_be_bytes(v4.octets()), 6);
    }
    if let Ok(v6) = ip.parse::<std::net::Ipv6Addr>() {
        let segments = v6.segments();
        // Find the longest zero run to compress as "_".
        let mut best = (0usize, 0usize);
        let mut current = (0usize, 0usize);
        for (i, seg) in segments.iter().enumerate() {
            if *seg == 0 {
                if current.1 == 0 {
                    current.0 = i;
                }
                current.1 += 1;
                if current.1 > best.1 {
                    best = current;
                }
            } else {
                current = (0, 0);
            }
        }
        if best.1 == 0 {
            return segments
                .iter()
                .map(|seg| p10_b64encode(*seg as u32, 3))
                .collect();
        }
        let head: String = segments[..best.0]
            .iter()
            .map(|seg| p10_b64encode(*seg as u32, 3))
            .collect();
        let tail: String = segments[best.0 + best.1..]
            .iter()
            .map(|seg| p10_b64encode(*seg as u32, 3))
            .collect();
        let mut out = format!("{head}_{tail}");
        if out.starts_with('_') {
            out = format!("AAA{out}");
        }
        return out;
    }
    "AAAAAA".to_string()
}

struct P10State {
    uidgens: HashMap<String, P10UidGenerator>,
    sidgen: Option<P10SidGenerator>,
    /// Uplink flags from its SERVER line (e.g. '6' for IPv6 support).
    uplink_flags: Vec<char>,
    authed: bool,
}

pub struct P10Protocol {
    caps: ProtocolCaps,
    state: Mutex<P10State>,
}

impl P10Protocol {
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
            state: Mutex::new(P10State {
                uidgens: HashMap::new(),
                sidgen: None,
                uplink_flags: Vec::new(),
                authed: false,
            }),
        }
    }

    fn setup_modes(&self, net: &Network) {
        // Nefarious mode tables.
        let mut cmodes = ModeMap::rfc1459_cmodes();
        for (name, letter) in [
            ("delayjoin", 'D'),
            ("registered", 'R'),
            ("banexception", 'e'),
            ("redirect", 'L'),
            ("adminonly", 'a'),
            ("operonly", 'O'),
            ("regmoderated", 'M'),
            ("nonotice", 'N'),
            ("permanent", 'z'),
            ("hidequits", 'Q'),
            ("noctcp", 'C'),
            ("noamsg", 'T'),
            ("blockcolor", 'c'),
            ("stripcolor", 'S'),
            ("regonly", 'r'),
        ] {
            cmodes.insert(name, letter);
        }
        cmodes.type_a = "be".to_string();
        cmodes.type_b = "k".to_string();
        cmodes.type_c = "Ll".to_string();
        cmodes.type_d = "psmtinrDRaOMNzQCTcS".to_string();
        cmodes.set_prefixes(&[(PrefixLevel::Op, 'o', '@'), (PrefixLevel::Voice, 'v', '+')]);
        net.set_cmodes(cmodes);

        let mut umodes = ModeMap::rfc1459_umodes();
        for (name, letter) in [
            ("servprotect", 'k'),
            ("cloak", 'x'),
            ("hidechans", 'n'),
            ("deaf_commonchan", 'q'),
            ("bot", 'B'),
            ("deaf", 'd'),
            ("hideoper", 'H'),
            ("hideidle", 'I'),
            ("regdeaf", 'R'),
            ("showwhois", 'W'),
            ("admin", 'a'),
            ("ssl", 'z'),
            ("registered", 'r'),
        ] {
            umodes.insert(name, letter);
        }
        umodes.type_c = "r".to_string();
        umodes.type_d = "oOiwskgxnqBdDHIRWaXLz".to_string();
        net.set_umodes(umodes);
    }

    /// User introduction or nick change, both carried by NICK.
    fn handle_nick(&self, net: &Network, sender: &str, args: &[String]) -> Vec<HookEvent> {
        if args.len() <= 2 {
            // <- ABAAA N newnick 1460753763
            let Some(newnick) = args.first().cloned() else {
                return Vec::new();
            };
            let ts: i64 = args
                .get(1)
                .and_then(|t| t.parse().ok())
                .unwrap_or_else(now_ts);
            let oldnick = net.get_friendly_name(sender);
            if let Some(mut user) = net.users.get_mut(sender) {
                user.nick = newnick.clone();
                user.nick_ts = ts;
            }
            return vec![HookEvent::new(
                sender,
                HookPayload::Nick {
                    newnick,
                    oldnick,
                    ts,
                },
            )];
        }

        // <- AB N jlu5 1 1460673049 ~jlu5 host.example +iw B]AAAB ABAAA :realname
        if args.len() < 8 {
            warn!(net = %net.name, "malformed NICK introduction");
            return Vec::new();
        }
        let (nick, ts, ident, host) = (&args[0], &args[2], &args[3], &args[4]);
        let ip = decode_p10_ip(&args[args.len() - 3]).unwrap_or_else(|| "0.0.0.0".to_string());
        let uid = args[args.len() - 2].clone();
        let realname = args.last().cloned().unwrap_or_default();
        let ts: i64 = ts.parse().unwrap_or_else(|_| now_ts());

        base::register_user(net, sender, &uid, nick, ts, ident, host, host, &ip, &realname);

        let mut events = Vec::new();
        let mut account = None;
        if args[5].starts_with('+') {
            let mode_args: Vec<&str> = args[5..args.len() - 3]
                .iter()
                .map(String::as_str)
                .collect();
            let parsed = modes::parse_modes(net, &uid, &mode_args);
            modes::apply_modes(net, &uid, &parsed);
            for change in &parsed {
                // Account stamps ride on "+r accountname:TS".
                if change.adding
                    && change.letter == 'r'
                    && let Some(arg) = &change.arg
                {
                    account = Some(arg.split(':').next().unwrap_or(arg).to_string());
                }
            }
        }

        events.push(HookEvent::new(
            sender,
            HookPayload::Uid {
                uid: uid.clone(),
                ts,
                nick: nick.clone(),
                ident: ident.clone(),
                host: host.clone(),
                realhost: Some(host.clone()),
                ip,
            },
        ));
        if let Some(account) = account {
            if let Some(mut user) = net.users.get_mut(&uid) {
                user.services_account = account.clone();
            }
            events.push(HookEvent::new(&uid, HookPayload::ServicesLogin { account }));
        }
        events
    }

    fn handle_burst(&self, net: &Network, sender: &str, args: &[String]) -> Vec<HookEvent> {
        // <- AB B #test 1460742014 +tnlk 10 testkey ABAAB,ABAAA:o :%*!*@bad.host
        if args.len() < 3 {
            return Vec::new();
        }
        let channel = &args[0];
        let their_ts: i64 = args[1].parse().unwrap_or_else(|_| now_ts());
        let key = net.get_or_create_channel(channel);
        let mut args: Vec<String> = args.to_vec();

        // A trailing "%"-prefixed argument is the ban list; a "~" inside it
        // switches to ban exempts.
        let mut list_modes = Vec::new();
        if let Some(last) = args.last().cloned()
            && let Some(bans) = last.strip_prefix('%')
        {
            let mut exempts = false;
            for host in bans.split_whitespace() {
                if host == "~" {
                    exempts = true;
                } else if exempts {
                    list_modes.push(ModeChange::plus('e', Some(host)));
                } else {
                    list_modes.push(ModeChange::plus('b', Some(host)));
                }
            }
            args.pop();
        }

        // Whatever sits between the TS and the user list is the modestring.
        let userlist = if args.len() > 2 {
            args.last().cloned().unwrap_or_default()
        } else {
            String::new()
        };
        let mode_args: Vec<&str> = if args.len() > 3 {
            args[2..args.len() - 1].iter().map(String::as_str).collect()
        } else {
            Vec::new()
        };
        let mut parsed = if mode_args.is_empty() {
            Vec::new()
        } else {
            modes::parse_modes(net, &key, &mode_args)
        };
        parsed.extend(list_modes);

        // Users come as "UID[:prefixes]"; a prefix set sticks for all
        // following entries until replaced.
        let mut users = Vec::new();
        let mut prefixes = String::new();
        for userpair in userlist.split(',') {
            if userpair.is_empty() {
                continue;
            }
            let user = match userpair.split_once(':') {
                Some((user, p)) => {
                    prefixes = p.to_string();
                    user.to_string()
                }
                None => userpair.to_string(),
            };
            users.push((prefixes.clone(), user));
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

impl Default for P10Protocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol for P10Protocol {
    fn name(&self) -> &'static str {
        "p10"
    }

    fn caps(&self) -> &ProtocolCaps {
        &self.caps
    }

    fn post_connect(&self, net: &Network) -> Result<(), ProtocolError> {
        *self.state.lock() = P10State {
            uidgens: HashMap::new(),
            sidgen: None,
            uplink_flags: Vec::new(),
            authed: false,
        };
        net.set_casemapping(Casemapping::Rfc1459);
        self.setup_modes(net);
        let conf = net.serverdata();

        // Our SID is a numeric encoded as 2 base64 chars.
        let numeric: u32 = conf.sid.parse().map_err(|_| {
            ProtocolError::MalformedHandshake(format!("P10 sid must be numeric, got {:?}", conf.sid))
        })?;
        let sid = p10_b64encode(numeric, 2);
        net.servers.remove(&conf.sid);
        net.set_sid(&sid);
        let desc = conf
            .serverdesc
            .clone()
            .unwrap_or_else(|| net.config().bot.serverdesc.clone());
        net.servers
            .insert(sid.clone(), Server::new(None, &conf.hostname, true, &desc));

        net.send(&format!("PASS :{}", conf.sendpass));
        let ts = now_ts();
        // "]]]" advertises the widest client numeric space.
        net.send(&format!(
            "SERVER {} 1 {ts} {ts} J10 {sid}]]] +s6 :{desc}",
            conf.hostname
        ));
        // End our (empty) burst immediately; clients spawned later are
        // introduced normally.
        net.send(&format!("{sid} EB"));
        Ok(())
    }

    fn handle_line(
        &self,
        net: &Network,
        line: &str,
    ) -> Result<Vec<HookEvent>, ProtocolError> {
        let tokens = base::parse_args(line);
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        // Handshake lines arrive without a numeric prefix.
        match tokens[0].as_str() {
            "PASS" => {
                if tokens.get(1).map(String::as_str)
                    != Some(net.serverdata().recvpass.as_str())
                {
                    return Err(ProtocolError::BadPassword);
                }
                self.state.lock().authed = true;
                return Ok(Vec::new());
            }
            "SERVER" => {
                // <- SERVER nefarious.example.net 1 1460673022 1460673239 J10 ABP]] +h6 :desc
                if !self.state.lock().authed {
                    return Err(ProtocolError::BadPassword);
                }
                let (Some(name), Some(numeric)) = (tokens.get(1), tokens.get(6)) else {
                    return Err(ProtocolError::MalformedHandshake(line.to_string()));
                };
                let sid: String = numeric.chars().take(2).collect();
                let desc = tokens.last().cloned().unwrap_or_default();
                net.servers
                    .insert(sid.clone(), Server::new(None, name, false, &desc));
                net.set_uplink(&sid);
                if let Some(flags) = tokens.get(7) {
                    self.state.lock().uplink_flags = flags.chars().skip(1).collect();
                }
                net.connected
                    .store(true, std::sync::atomic::Ordering::SeqCst);
                return Ok(Vec::new());
            }
            "ERROR" => {
                return Err(ProtocolError::UplinkError(
                    tokens.last().cloned().unwrap_or_default(),
                ));
            }
            _ => {}
        }

        if tokens.len() < 2 {
            return Ok(Vec::new());
        }
        let sender = tokens[0].clone();
        let raw_command = tokens[1].to_ascii_uppercase();
        let args: Vec<String> = tokens[2..].to_vec();
        let command = COMMAND_TOKENS
            .iter()
            .find(|(token, _)| *token == raw_command)
            .map(|(_, name)| (*name).to_string())
            .unwrap_or(raw_command);

        if net.is_internal(&sender) {
            warn!(net = %net.name, command = %command, "command routed the wrong way");
            return Ok(Vec::new());
        }

        match command.as_str() {
            "PING" => {
                // <- IA G !1460745823.89510 our.server.example 1460745823.89510
                let orig = args
                    .first()
                    .map(|a| a.trim_start_matches('!').to_string())
                    .unwrap_or_default();
                let target = args.get(1).cloned().unwrap_or_default();
                net.send(&format!(
                    "{} Z {target} {orig} 0 {}",
                    net.sid(),
                    now_ts()
                ));
                Ok(Vec::new())
            }
            "PONG" => Ok(Vec::new()),
            "SERVER" => {
                // Remote server introduced by the uplink.
                let (Some(name), Some(numeric)) = (args.first(), args.get(5)) else {
                    return Ok(Vec::new());
                };
                let sid: String = numeric.chars().take(2).collect();
                base::register_server(
                    net,
                    Some(&sender),
                    &sid,
                    &name.to_lowercase(),
                    &args.last().cloned().unwrap_or_default(),
                );
                Ok(Vec::new())
            }
            "NICK" => Ok(self.handle_nick(net, &sender, &args)),
            "BURST" => Ok(self.handle_burst(net, &sender, &args)),
            "JOIN" | "CREATE" => {
                let Some(chans) = args.first() else {
                    return Ok(Vec::new());
                };
                if chans == "0" && command == "JOIN" {
                    let channels: Vec<String> = net
                        .users
                        .get(&sender)
                        .map(|u| u.channels.iter().cloned().collect())
                        .unwrap_or_default();
                    for chan in &channels {
                        net.remove_user_from_channel(&sender, chan);
                    }
                    return Ok(vec![HookEvent::renamed(
                        &sender,
                        "PART",
                        HookPayload::Part {
                            channels,
                            text: "Left all channels.".to_string(),
                        },
                    )]);
                }
                let ts: i64 = args
                    .get(1)
                    .and_then(|t| t.parse().ok())
                    .unwrap_or_else(now_ts);
                let mut events = Vec::new();
                for channel in chans.split(',') {
                    let merge = base::merge_channel_burst(
                        net,
                        channel,
                        ts,
                        Vec::new(),
                        vec![(String::new(), sender.clone())],
                    );
                    events.push(HookEvent::new(
                        &sender,
                        HookPayload::Join {
                            channel: merge.key,
                            users: merge.users,
                            ts,
                            modes: Vec::new(),
                            burst: false,
                            channeldata: merge.oldchan,
                        },
                    ));
                }
                Ok(events)
            }
            "END_OF_BURST" => {
                if let Some(mut server) = net.servers.get_mut(&sender) {
                    server.has_eob = true;
                }
                if Some(sender.clone()) == net.uplink() {
                    // Acknowledge the uplink's burst.
                    net.send(&format!("{} EA", net.sid()));
                    Ok(vec![HookEvent::new(&sender, HookPayload::Endburst)])
                } else {
                    Ok(Vec::new())
                }
            }
            "EOB_ACK" => Ok(Vec::new()),
            "MODE" | "OPMODE" => {
                let Some(target) = args.first() else {
                    return Ok(Vec::new());
                };
                if args.len() < 2 {
                    return Ok(Vec::new());
                }
                if target.starts_with('#') {
                    let key = net.to_lower(target);
                    let oldchan = net.channel_snapshot(&key);
                    // A trailing TS may ride along on channel modes.
                    let mut mode_args: Vec<&str> =
                        args[1..].iter().map(String::as_str).collect();
                    if mode_args.len() > 1
                        && mode_args
                            .last()
                            .is_some_and(|a| a.len() >= 9 && a.chars().all(|c| c.is_ascii_digit()))
                    {
                        mode_args.pop();
                    }
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
                } else {
                    let target = net.nick_to_uid(target).unwrap_or_else(|| target.clone());
                    let mode_args: Vec<&str> = args[1..].iter().map(String::as_str).collect();
                    let was_oper = net.users.get(&target).is_some_and(|u| u.has_mode('o'));
                    let parsed = modes::parse_modes(net, &target, &mode_args);
                    modes::apply_modes(net, &target, &parsed);
                    let mut events = vec![HookEvent::renamed(
                        &sender,
                        "MODE",
                        HookPayload::Mode {
                            target: target.clone(),
                            modes: parsed,
                            channeldata: None,
                        },
                    )];
                    if !was_oper && net.users.get(&target).is_some_and(|u| u.has_mode('o')) {
                        events.push(HookEvent::new(
                            &target,
                            HookPayload::Opered {
                                opertype: "IRC Operator".to_string(),
                            },
                        ));
                    }
                    Ok(events)
                }
            }
            "CLEARMODE" => {
                // <- ABAAA CM #test ovpsmikbl
                let (Some(channel), Some(letters)) = (args.first(), args.get(1)) else {
                    return Ok(Vec::new());
                };
                let key = net.to_lower(channel);
                let oldchan = net.channel_snapshot(&key);
                let map = net.cmodes();
                let mut changes = Vec::new();
                if let Some(chan) = oldchan.clone() {
                    for letter in letters.chars() {
                        if let Some(level) = map.prefix_level_of_letter(letter) {
                            for uid in chan
                                .prefixmodes
                                .get(&level)
                                .map(|s| s.iter().cloned().collect::<Vec<_>>())
                                .unwrap_or_default()
                            {
                                changes.push(ModeChange::minus(letter, Some(uid.as_str())));
                            }
                        } else {
                            for (l, arg) in chan.modes.iter().filter(|(l, _)| *l == letter) {
                                changes.push(ModeChange {
                                    adding: false,
                                    letter: *l,
                                    arg: arg.clone(),
                                });
                            }
                        }
                    }
                }
                modes::apply_modes(net, &key, &changes);
                Ok(vec![HookEvent::renamed(
                    &sender,
                    "MODE",
                    HookPayload::Mode {
                        target: key,
                        modes: changes,
                        channeldata: oldchan,
                    },
                )])
            }
            "TOPIC" => {
                // <- ABAAA T #test jlu5!jlu5@host 1460745432 1460745432 :blah
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
            "ACCOUNT" => {
                // <- AB AC ABAAA jlu5 1460687069 / <- AB AC ABAAA R jlu5 1460687069
                let Some(target) = args.first().cloned() else {
                    return Ok(Vec::new());
                };
                let account = match args.get(1).map(String::as_str) {
                    Some("R") | Some("M") => args.get(2).cloned().unwrap_or_default(),
                    Some("U") => String::new(),
                    Some(v) => v.to_string(),
                    None => String::new(),
                };
                let account = account.split(':').next().unwrap_or(&account).to_string();
                if let Some(mut user) = net.users.get_mut(&target) {
                    user.services_account = account.clone();
                }
                Ok(vec![HookEvent::new(
                    &target,
                    HookPayload::ServicesLogin { account },
                )])
            }
            "SETHOST" => {
                // <- ABAAA SH newhost.example or AB SH ABAAA newhost.example
                let (target, newhost) = if args.len() >= 2 {
                    (args[0].clone(), args[1].clone())
                } else {
                    (sender.clone(), args.first().cloned().unwrap_or_default())
                };
                if let Some(mut user) = net.users.get_mut(&target) {
                    user.host = newhost.clone();
                }
                Ok(vec![HookEvent::new(
                    &sender,
                    HookPayload::ChgHost { target, newhost },
                )])
            }
            "WALLCHOPS" | "WALLHOPS" | "WALLVOICES" => {
                let (Some(channel), Some(text)) = (args.first(), args.get(1)) else {
                    return Ok(Vec::new());
                };
                let prefix = match command.as_str() {
                    "WALLCHOPS" => '@',
                    "WALLHOPS" => '%',
                    _ => '+',
                };
                Ok(vec![HookEvent::renamed(
                    &sender,
                    "NOTICE",
                    HookPayload::Notice {
                        target: format!("{prefix}{}", net.to_lower(channel)),
                        text: text.clone(),
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
            .or_insert_with(|| P10UidGenerator::new(&server))
            .next_uid()
            .map_err(|_| OutgoingError::UnknownTarget("uid space exhausted".to_string()))?;
        let user = base::spawn_state(net, &uid, &opts)?;
        let raw_modes = join_modes(&opts.modes, true);
        let modestring = raw_modes.split(' ').next().unwrap_or("+");
        let encoded_ip = if opts.ip.contains(':') && !self.state.lock().uplink_flags.contains(&'6')
        {
            // Uplink can't represent IPv6; send the all-zeroes address.
            "AAAAAA".to_string()
        } else {
            encode_p10_ip(&opts.ip)
        };
        let hopcount = net
            .servers
            .get(&server)
            .map(|s| s.hopcount)
            .unwrap_or(1);
        net.send(&format!(
            "{server} N {} {hopcount} {} {} {} {modestring} {encoded_ip} {uid} :{}",
            user.nick, user.ts, user.ident, user.host, user.realname
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
        let sid = {
            let mut state = self.state.lock();
            if state.sidgen.is_none() {
                let range = net.serverdata().sidrange;
                if range.is_empty() {
                    return Err(OutgoingError::NotImplemented("spawn_server without sidrange"));
                }
                state.sidgen = Some(
                    P10SidGenerator::new(&range)
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
        let ts = now_ts();
        let mut server = Server::new(Some(&uplink), &name, true, desc);
        server.has_eob = true;
        server.hopcount = 2;
        net.servers.insert(sid.clone(), server);
        net.send(&format!(
            "{uplink} S {name} 2 {ts} {ts} P10 {sid}]]] +s6 :{desc}"
        ));
        net.send(&format!("{sid} EB"));
        Ok(sid)
    }

    fn join(&self, net: &Network, client: &str, channel: &str) -> OutgoingResult {
        require_internal_client(net, client)?;
        let key = net.get_or_create_channel(channel);
        let ts = net.channel_snapshot(&key).map(|c| c.ts).unwrap_or_else(now_ts);
        net.send(&format!("{client} J {key} {ts}"));
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

        // P10 bursts carry "UID[:prefixes]" with sticky prefixes; sort so
        // users with the same prefix set are adjacent.
        let mut sorted: Vec<(String, String)> = users.to_vec();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        let mut prefix_changes = Vec::new();
        let mut namelist = Vec::new();
        let mut last_prefixes = String::new();
        for (prefixes, uid) in &sorted {
            if prefixes != &last_prefixes {
                namelist.push(format!("{uid}:{prefixes}"));
                last_prefixes = prefixes.clone();
            } else {
                namelist.push(uid.clone());
            }
            for letter in prefixes.chars() {
                prefix_changes.push(ModeChange::plus(letter, Some(uid.as_str())));
            }
            net.add_user_to_channel(uid, &key);
        }
        let modestring = join_modes(&simple_modes, false);
        if modestring == "+" {
            net.send(&format!("{server} B {key} {ts} {}", namelist.join(",")));
        } else {
            net.send(&format!(
                "{server} B {key} {ts} {modestring} {}",
                namelist.join(",")
            ));
        }
        modes::apply_modes(net, &key, &prefix_changes);
        Ok(())
    }

    fn part(&self, net: &Network, client: &str, channel: &str, reason: &str)
    -> OutgoingResult {
        require_internal_client(net, client)?;
        let key = net.to_lower(channel);
        net.send(&format!("{client} L {key} :{reason}"));
        net.remove_user_from_channel(client, &key);
        Ok(())
    }

    fn quit(&self, net: &Network, client: &str, reason: &str) -> OutgoingResult {
        require_internal_client(net, client)?;
        net.send(&format!("{client} Q :{reason}"));
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
        net.send(&format!("{source} K {key} {target} :{reason}"));
        net.remove_user_from_channel(target, &key);
        Ok(())
    }

    fn kill(&self, net: &Network, source: &str, target: &str, reason: &str)
    -> OutgoingResult {
        require_internal(net, source)?;
        if !net.users.contains_key(target) {
            return Err(OutgoingError::UnknownTarget(target.to_string()));
        }
        net.send(&format!("{source} D {target} :Killed ({reason})"));
        net.remove_client(target);
        Ok(())
    }

    fn nick(&self, net: &Network, client: &str, newnick: &str) -> OutgoingResult {
        require_internal_client(net, client)?;
        let ts = now_ts();
        net.send(&format!("{client} N {newnick} {ts}"));
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
            for line in wrap_modes(changes, 450, 6) {
                net.send(&format!("{source} M {key} {line} {ts}"));
            }
        } else {
            let nick = net.get_friendly_name(target);
            net.send(&format!(
                "{source} M {nick} {}",
                join_modes(changes, false)
            ));
        }
        Ok(())
    }

    fn topic(&self, net: &Network, source: &str, channel: &str, text: &str)
    -> OutgoingResult {
        require_internal_client(net, source)?;
        let key = net.to_lower(channel);
        let ts = net.channel_snapshot(&key).map(|c| c.ts).unwrap_or_else(now_ts);
        net.send(&format!(
            "{source} T {key} {} {ts} :{text}",
            net.get_hostmask(source)
        ));
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
        let ts = net.channel_snapshot(&key).map(|c| c.ts).unwrap_or_else(now_ts);
        let name = net
            .servers
            .get(source)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| source.to_string());
        net.send(&format!("{source} T {key} {name} {ts} :{text}"));
        if let Some(mut chan) = net.channels.get_mut(&key) {
            chan.topic = text.to_string();
            chan.topicset = true;
        }
        Ok(())
    }

    fn message(&self, net: &Network, source: &str, target: &str, text: &str)
    -> OutgoingResult {
        require_internal_client(net, source)?;
        // Status-prefixed channel targets use the wallchops family.
        if let Some(channel) = target.strip_prefix('@') {
            net.send(&format!("{source} WC {channel} :{text}"));
        } else if let Some(channel) = target.strip_prefix('%') {
            net.send(&format!("{source} WH {channel} :{text}"));
        } else if let Some(channel) = target.strip_prefix('+') {
            net.send(&format!("{source} WV {channel} :{text}"));
        } else {
            net.send(&format!("{source} P {target} :{text}"));
        }
        Ok(())
    }

    fn notice(&self, net: &Network, source: &str, target: &str, text: &str)
    -> OutgoingResult {
        require_internal(net, source)?;
        if let Some(channel) = target.strip_prefix('@') {
            net.send(&format!("{source} WC {channel} :{text}"));
        } else {
            net.send(&format!("{source} O {target} :{text}"));
        }
        Ok(())
    }

    fn invite(&self, net: &Network, source: &str, target: &str, channel: &str)
    -> OutgoingResult {
        require_internal_client(net, source)?;
        let nick = net.get_friendly_name(target);
        net.send(&format!("{source} I {nick} {}", net.to_lower(channel)));
        Ok(())
    }

    fn knock(&self, net: &Network, _source: &str, _channel: &str, _text: &str)
    -> OutgoingResult {
        // P10 has no KNOCK equivalent.
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
        net.send(&format!("{source} {numeric:03} {target} {text}"));
        Ok(())
    }

    fn update_client(
        &self,
        net: &Network,
        target: &str,
        field: ClientField,
        text: &str,
    ) -> OutgoingResult {
        if field != ClientField::Host {
            return Err(OutgoingError::NotImplemented("update_client"));
        }
        if !net.users.contains_key(target) {
            return Err(OutgoingError::UnknownTarget(target.to_string()));
        }
        net.send(&format!("{} SH {target} {text}", net.sid()));
        if let Some(mut user) = net.users.get_mut(target) {
            user.host = text.to_string();
        }
        Ok(())
    }

    fn away(&self, net: &Network, client: &str, text: &str) -> OutgoingResult {
        require_internal_client(net, client)?;
        if text.is_empty() {
            net.send(&format!("{client} A"));
        } else {
            net.send(&format!("{client} A :{text}"));
        }
        if let Some(mut user) = net.users.get_mut(client) {
            user.away = text.to_string();
        }
        Ok(())
    }

    fn ping(&self, net: &Network) {
        let sid = net.sid();
        if let Some(uplink) = net.uplink() {
            net.send(&format!("{sid} G {sid} {uplink} {}", now_ts()));
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
        net.send(&format!("{source} SQ {name} 0 :{reason}"));
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

    fn p10_net() -> Arc<Network> {
        let net = test_net_with_protocol("p10net", "p10");
        {
            // P10 SIDs are numeric in config.
            let mut config = (*net.config()).clone();
            config.servers.get_mut("p10net").unwrap().sid = "2".to_string();
            config.servers.get_mut("p10net").unwrap().sidrange = "100-200".to_string();
            net.set_config(Arc::new(config));
        }
        net.protocol.post_connect(&net).unwrap();
        net.protocol.handle_line(&net, "PASS :linkage").unwrap();
        net.protocol
            .handle_line(
                &net,
                "SERVER nefarious.example.net 1 1460673022 1460673239 J10 ABP]] +h6 :test server",
            )
            .unwrap();
        net
    }

    fn intro(net: &Network, nick: &str, uid: &str) {
        net.protocol
            .handle_line(
                net,
                &format!("AB N {nick} 1 1460673049 ~{nick} host.example +iw DAqAoB {uid} :real"),
            )
            .unwrap();
    }

    #[test]
    fn test_ip_codec_roundtrip() {
        assert_eq!(encode_p10_ip("127.0.0.1").len(), 6);
        assert_eq!(
            decode_p10_ip(&encode_p10_ip("127.0.0.1")).unwrap(),
            "127.0.0.1"
        );
        // 1:2::3 -> AABAAC_AAD per the nefarious docs.
        assert_eq!(encode_p10_ip("1:2::3"), "AABAAC_AAD");
        assert_eq!(decode_p10_ip("AABAAC_AAD").unwrap(), "1:2::3");
        assert_eq!(decode_p10_ip(&encode_p10_ip("::1")).unwrap(), "0::1");
    }

    #[test]
    fn test_server_handshake_sets_uplink() {
        let net = p10_net();
        assert_eq!(net.uplink(), Some("AB".to_string()));
        assert_eq!(net.sid(), "AC", "numeric 2 encodes as AC");
        assert!(net.is_connected());
    }

    #[test]
    fn test_nick_introduction_with_account() {
        let net = p10_net();
        net.protocol
            .handle_line(
                &net,
                "AB N jlu5 1 1460673049 ~jlu5 host.example +ir jlu5:1460673049 DAqAoB ABAAA :real",
            )
            .unwrap();
        let user = net.users.get("ABAAA").unwrap();
        assert_eq!(user.nick, "jlu5");
        assert_eq!(user.services_account, "jlu5");
        assert_eq!(user.ip, "192.168.10.1");
    }

    #[test]
    fn test_burst_with_sticky_prefixes_and_bans() {
        let net = p10_net();
        intro(&net, "a", "ABAAA");
        intro(&net, "b", "ABAAB");
        intro(&net, "c", "ABAAC");
        net.protocol
            .handle_line(
                &net,
                "AB B #test 1460742014 +tnl 10 ABAAA,ABAAB:o,ABAAC :%*!*@bad.host",
            )
            .unwrap();
        let chan = net.channel_snapshot("#test").unwrap();
        assert_eq!(chan.users.len(), 3);
        assert!(!chan.has_prefix(PrefixLevel::Op, "ABAAA"));
        // The :o prefix sticks for ABAAB and ABAAC.
        assert!(chan.has_prefix(PrefixLevel::Op, "ABAAB"));
        assert!(chan.has_prefix(PrefixLevel::Op, "ABAAC"));
        assert!(chan.modes.contains(&('b', Some("*!*@bad.host".to_string()))));
        assert!(chan.modes.contains(&('l', Some("10".to_string()))));
    }

    #[test]
    fn test_clearmode_drops_modes_and_ops(){
        let net = p10_net();
        intro(&net, "a", "ABAAA");
        net.protocol
            .handle_line(&net, "AB B #test 1460742014 +tn ABAAA:o")
            .unwrap();
        net.protocol
            .handle_line(&net, "ABAAA CM #test ont")
            .unwrap();
        let chan = net.channel_snapshot("#test").unwrap();
        assert!(chan.modes.is_empty());
        assert!(!chan.has_prefix(PrefixLevel::Op, "ABAAA"));
    }

    #[test]
    fn test_end_of_burst_acks() {
        let net = p10_net();
        let events = net.protocol.handle_line(&net, "AB EB").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].command, "ENDBURST");
    }

    #[test]
    fn test_spawn_client_encodes_ip() {
        let net = p10_net();
        let mut opts = SpawnOpts::new("relay");
        opts.ip = "127.0.0.1".to_string();
        let uid = net.protocol.spawn_client(&net, opts).unwrap();
        assert_eq!(uid.len(), 5);
        assert!(net.is_internal_client(&uid));
    }
}
