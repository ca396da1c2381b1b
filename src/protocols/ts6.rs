//! TS6 protocol driver (Charybdis and Ratbox flavours).
//!
//! Handshake: `PASS <sendpass> TS 6 :<sid>`, `CAPAB`, `SERVER`, then
//! `SVINFO` once the uplink introduces itself. TS6 has no explicit
//! end-of-burst, so the connection loop synthesises an ENDBURST shortly
//! after the capability exchange completes (`needs_eob_synth`).

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{OutgoingError, OutgoingResult, ProtocolError};
use crate::hooks::{HookEvent, HookPayload};
use crate::ids::{Ts6SidGenerator, Ts6UidGenerator};
use crate::modes::{self, ModeChange, ModeMap, join_modes, wrap_modes};
use crate::protocols::{
    ClientField, Protocol, ProtocolCaps, SpawnOpts, base, require_internal,
    require_internal_client, require_internal_server,
};
use crate::state::{Network, PrefixLevel, Server, now_ts};

/// Mode parameters per TMODE line.
const MAX_MODES_PER_MSG: usize = 9;
/// Users per SJOIN line.
const SJOIN_CHUNK: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Charybdis,
    Ratbox,
}

struct Ts6State {
    uidgens: HashMap<String, Ts6UidGenerator>,
    sidgen: Option<Ts6SidGenerator>,
    uplink_caps: Vec<String>,
}

impl Ts6State {
    fn fresh() -> Self {
        Self {
            uidgens: HashMap::new(),
            sidgen: None,
            uplink_caps: Vec::new(),
        }
    }
}

pub struct Ts6Protocol {
    flavor: Flavor,
    caps: ProtocolCaps,
    state: Mutex<Ts6State>,
}

impl Ts6Protocol {
    pub fn new(flavor: Flavor) -> Self {
        Self {
            flavor,
            caps: ProtocolCaps {
                can_spawn_clients: true,
                has_ts: true,
                can_host_relay: true,
                can_track_servers: true,
                slash_in_nicks: false,
                slash_in_hosts: true,
                underscore_in_hosts: false,
                has_statusmsg: true,
                needs_eob_synth: true,
            },
            state: Mutex::new(Ts6State::fresh()),
        }
    }

    fn required_caps(&self) -> &'static [&'static str] {
        match self.flavor {
            Flavor::Charybdis => &["EUID", "SAVE", "TB", "ENCAP", "QS"],
            Flavor::Ratbox => &["TB", "ENCAP", "QS"],
        }
    }

    fn send_from(&self, net: &Network, source: &str, msg: &str) {
        net.send(&format!(":{source} {msg}"));
    }

    /// Install the negotiated uplink capability list (used by the Hybrid
    /// driver, which runs its own CAPAB validation).
    pub(crate) fn set_uplink_caps(&self, caps: Vec<String>) {
        self.state.lock().uplink_caps = caps;
    }

    fn uplink_has_cap(&self, cap: &str) -> bool {
        self.state
            .lock()
            .uplink_caps
            .iter()
            .any(|c| c == cap)
    }

    /// Install the charybdis/ratbox mode tables, honouring negotiated caps.
    fn setup_modes(&self, net: &Network, caps: &[String]) {
        let mut cmodes = ModeMap::rfc1459_cmodes();
        for (name, letter) in [
            ("noknock", 'p'),
            ("quiet", 'q'),
            ("redirect", 'f'),
            ("freetarget", 'F'),
            ("joinflood", 'j'),
            ("largebanlist", 'L'),
            ("permanent", 'P'),
            ("noforwards", 'Q'),
            ("stripcolor", 'c'),
            ("allowinvite", 'g'),
            ("opmoderated", 'z'),
        ] {
            cmodes.insert(name, letter);
        }
        cmodes.type_a = "bq".to_string();
        cmodes.type_b = "k".to_string();
        cmodes.type_c = "lfj".to_string();
        cmodes.type_d = "mnpstcgzFLPQ".to_string();
        if caps.iter().any(|c| c == "EX") {
            cmodes.insert("banexception", 'e');
            cmodes.type_a.push('e');
        }
        if caps.iter().any(|c| c == "IE") {
            cmodes.insert("invex", 'I');
            cmodes.type_a.push('I');
        }
        if caps.iter().any(|c| c == "SERVICES") {
            cmodes.insert("regonly", 'r');
            cmodes.type_d.push('r');
        }
        cmodes.set_prefixes(&[(PrefixLevel::Op, 'o', '@'), (PrefixLevel::Voice, 'v', '+')]);
        net.set_cmodes(cmodes);

        let mut umodes = ModeMap::rfc1459_umodes();
        for (name, letter) in [
            ("deaf", 'D'),
            ("servprotect", 'S'),
            ("admin", 'a'),
            ("noforward", 'Q'),
            ("regdeaf", 'R'),
            ("callerid", 'g'),
            ("operwall", 'z'),
            ("locops", 'l'),
        ] {
            umodes.insert(name, letter);
        }
        umodes.type_d = "DSaQRgzliows".to_string();
        net.set_umodes(umodes);
    }

    /// Handle the sender-less handshake commands; returns true if consumed.
    fn handle_handshake(
        &self,
        net: &Network,
        command: &str,
        args: &[String],
        line: &str,
    ) -> Result<Option<Vec<HookEvent>>, ProtocolError> {
        match command {
            "PASS" => {
                // <- PASS theirpass TS 6 :42X
                if args.first().map(String::as_str) != Some(net.serverdata().recvpass.as_str()) {
                    return Err(ProtocolError::BadPassword);
                }
                if args.get(1).map(String::as_str) != Some("TS")
                    || args.get(2).map(String::as_str) != Some("6")
                {
                    return Err(ProtocolError::MalformedHandshake(format!(
                        "not a TS6 uplink: {line}"
                    )));
                }
                let Some(sid) = args.get(3) else {
                    return Err(ProtocolError::MalformedHandshake(line.to_string()));
                };
                debug!(net = %net.name, uplink = %sid, "found uplink SID");
                net.servers
                    .insert(sid.clone(), Server::new(None, "unknown", false, ""));
                net.set_uplink(sid);
                Ok(Some(Vec::new()))
            }
            "CAPAB" => {
                // <- CAPAB :BAN CHW ENCAP EUID ... TB
                let caps: Vec<String> = args
                    .last()
                    .map(|s| s.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default();
                for required in self.required_caps() {
                    if !caps.iter().any(|c| c == required) {
                        return Err(ProtocolError::MissingCapability(required.to_string()));
                    }
                }
                self.setup_modes(net, &caps);
                self.state.lock().uplink_caps = caps;
                net.connected
                    .store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(Some(Vec::new()))
            }
            "SERVER" => {
                // <- SERVER charybdis.example.net 1 :server description
                let Some(uplink) = net.uplink() else {
                    return Err(ProtocolError::MalformedHandshake(
                        "SERVER before PASS".to_string(),
                    ));
                };
                let name = args.first().cloned().unwrap_or_default().to_lowercase();
                let desc = args.last().cloned().unwrap_or_default();
                if let Some(mut server) = net.servers.get_mut(&uplink) {
                    server.name = name;
                    server.desc = desc;
                }
                self.send_from(
                    net,
                    &net.sid(),
                    &format!("SVINFO 6 6 0 :{}", now_ts()),
                );
                Ok(Some(Vec::new()))
            }
            "SVINFO" | "NOTICE" => Ok(Some(Vec::new())),
            _ => Ok(None),
        }
    }

    fn handle_euid(
        &self,
        net: &Network,
        sender: &str,
        args: &[String],
        extended: bool,
    ) -> Vec<HookEvent> {
        // <- :42X EUID GL 1 1437505322 +ailoswz ~gl 127.0.0.1 127.0.0.1 42XAAAAAB * * :realname
        // <- :42X UID GL 1 1437505322 +iow ~gl 127.0.0.1 127.0.0.1 42XAAAAAB :realname
        let (Some(nick), Some(ts), Some(umodes), Some(ident), Some(host), Some(ip), Some(uid)) = (
            args.first(),
            args.get(2),
            args.get(3),
            args.get(4),
            args.get(5),
            args.get(6),
            args.get(7),
        ) else {
            warn!(net = %net.name, "malformed UID introduction");
            return Vec::new();
        };
        let realname = args.last().cloned().unwrap_or_default();
        let (realhost, account) = if extended {
            (
                args.get(8).filter(|h| h.as_str() != "*").cloned(),
                args.get(9).filter(|a| a.as_str() != "*").cloned(),
            )
        } else {
            (None, None)
        };
        let ts = ts.parse().unwrap_or_else(|_| now_ts());
        base::register_user(
            net,
            sender,
            uid,
            nick,
            ts,
            ident,
            host,
            realhost.as_deref().unwrap_or(host),
            ip,
            &realname,
        );
        let parsed = modes::parse_modes(net, uid, &[umodes.as_str()]);
        modes::apply_modes(net, uid, &parsed);

        let mut events = vec![HookEvent::new(
            sender,
            HookPayload::Uid {
                uid: uid.clone(),
                ts,
                nick: nick.clone(),
                ident: ident.clone(),
                host: host.clone(),
                realhost,
                ip: ip.clone(),
            },
        )];
        if let Some(account) = account {
            if let Some(mut user) = net.users.get_mut(uid) {
                user.services_account = account.clone();
            }
            events.push(HookEvent::new(uid, HookPayload::ServicesLogin { account }));
        }
        events
    }

    fn handle_sjoin(&self, net: &Network, sender: &str, args: &[String]) -> Vec<HookEvent> {
        // <- :42X SJOIN 1437801097 #channel +nt :@42XAAAAAB +42XAAAAAC 42XAAAAAD
        if args.len() < 3 {
            return Vec::new();
        }
        let (ts, channel, userlist) = (&args[0], &args[1], &args[args.len() - 1]);
        let their_ts: i64 = ts.parse().unwrap_or_else(|_| now_ts());
        let mode_args: Vec<&str> = args[2..args.len() - 1].iter().map(String::as_str).collect();
        let key = net.get_or_create_channel(channel);
        let parsed = if mode_args.is_empty() {
            Vec::new()
        } else {
            modes::parse_modes(net, &key, &mode_args)
        };

        let symbols = net.cmodes();
        let users: Vec<(String, String)> = userlist
            .split_whitespace()
            .map(|entry| {
                let uid: String = entry
                    .chars()
                    .skip_while(|c| symbols.prefix_level_of_symbol(*c).is_some())
                    .collect();
                let prefixes: String = entry
                    .chars()
                    .take_while(|c| symbols.prefix_level_of_symbol(*c).is_some())
                    .filter_map(|c| {
                        symbols
                            .prefix_level_of_symbol(c)
                            .and_then(|level| symbols.prefix_letter(level))
                    })
                    .collect();
                (prefixes, uid)
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

    fn handle_join(&self, net: &Network, sender: &str, args: &[String]) -> Vec<HookEvent> {
        // <- :42XAAAAAB JOIN 1437801097 #channel +
        if args.first().map(String::as_str) == Some("0") {
            // /join 0: part all channels.
            let channels: Vec<String> = net
                .users
                .get(sender)
                .map(|u| u.channels.iter().cloned().collect())
                .unwrap_or_default();
            for chan in &channels {
                net.remove_user_from_channel(sender, chan);
            }
            return vec![HookEvent::renamed(
                sender,
                "PART",
                HookPayload::Part {
                    channels,
                    text: "Left all channels.".to_string(),
                },
            )];
        }
        let (Some(ts), Some(channel)) = (args.first(), args.get(1)) else {
            return Vec::new();
        };
        let their_ts: i64 = ts.parse().unwrap_or_else(|_| now_ts());
        let merge = base::merge_channel_burst(
            net,
            channel,
            their_ts,
            Vec::new(),
            vec![(String::new(), sender.to_string())],
        );
        vec![HookEvent::new(
            sender,
            HookPayload::Join {
                channel: merge.key,
                users: merge.users,
                ts: their_ts,
                modes: Vec::new(),
                burst: false,
                channeldata: merge.oldchan,
            },
        )]
    }

    fn handle_tmode(&self, net: &Network, sender: &str, args: &[String]) -> Vec<HookEvent> {
        // <- :42XAAAAAB TMODE 1437450768 #chan -c+lkC 3 agte4
        let Some(channel) = args.get(1) else {
            return Vec::new();
        };
        let key = net.to_lower(channel);
        let mode_args: Vec<&str> = args[2..].iter().map(String::as_str).collect();
        let oldchan = net.channel_snapshot(&key);
        let parsed = modes::parse_modes(net, &key, &mode_args);
        modes::apply_modes(net, &key, &parsed);
        vec![HookEvent::new(
            sender,
            HookPayload::Mode {
                target: key,
                modes: parsed,
                channeldata: oldchan,
            },
        )]
    }

    fn handle_usermode(
        &self,
        net: &Network,
        sender: &str,
        args: &[String],
    ) -> Vec<HookEvent> {
        // <- :42XAAAAAB MODE 42XAAAAAB :+iw
        let Some(target) = args.first() else {
            return Vec::new();
        };
        if args.len() < 2 {
            return Vec::new();
        }
        let mode_args: Vec<&str> = args[1..].iter().map(String::as_str).collect();
        let was_oper = net.users.get(target).is_some_and(|u| u.has_mode('o'));
        let parsed = modes::parse_modes(net, target, &mode_args);
        modes::apply_modes(net, target, &parsed);
        let mut events = vec![HookEvent::new(
            sender,
            HookPayload::Mode {
                target: target.clone(),
                modes: parsed,
                channeldata: None,
            },
        )];
        if !was_oper && net.users.get(target).is_some_and(|u| u.has_mode('o')) {
            if let Some(mut user) = net.users.get_mut(target) {
                user.opertype = "IRC Operator".to_string();
            }
            events.push(HookEvent::new(
                target,
                HookPayload::Opered {
                    opertype: "IRC Operator".to_string(),
                },
            ));
        }
        events
    }

    fn handle_bmask(&self, net: &Network, sender: &str, args: &[String]) -> Vec<HookEvent> {
        // <- :42X BMASK 1424222769 #dev b :*!test@*.isp.net *!badident@*
        let (Some(channel), Some(mode), Some(masks)) = (args.get(1), args.get(2), args.last())
        else {
            return Vec::new();
        };
        let key = net.to_lower(channel);
        let oldchan = net.channel_snapshot(&key);
        let letter = mode.chars().next().unwrap_or('b');
        let changes: Vec<ModeChange> = masks
            .split_whitespace()
            .map(|mask| ModeChange::plus(letter, Some(mask)))
            .collect();
        modes::apply_modes(net, &key, &changes);
        vec![HookEvent::renamed(
            sender,
            "MODE",
            HookPayload::Mode {
                target: key,
                modes: changes,
                channeldata: oldchan,
            },
        )]
    }
}

impl Protocol for Ts6Protocol {
    fn name(&self) -> &'static str {
        match self.flavor {
            Flavor::Charybdis => "ts6",
            Flavor::Ratbox => "ratbox",
        }
    }

    fn caps(&self) -> &ProtocolCaps {
        &self.caps
    }

    fn post_connect(&self, net: &Network) -> Result<(), ProtocolError> {
        *self.state.lock() = Ts6State::fresh();
        let conf = net.serverdata();

        net.send(&format!("PASS {} TS 6 :{}", conf.sendpass, conf.sid));
        let capab = match self.flavor {
            Flavor::Charybdis => "QS ENCAP EX CHW IE KNOCK SAVE SERVICES TB EUID",
            Flavor::Ratbox => "QS ENCAP EX CHW IE KNOCK TB",
        };
        net.send(&format!("CAPAB :{capab}"));
        net.send(&format!(
            "SERVER {} 0 :{}",
            conf.hostname,
            conf.serverdesc
                .unwrap_or_else(|| net.config().bot.serverdesc.clone())
        ));
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
        if sender.is_none()
            && let Some(events) = self.handle_handshake(net, &command, &args, line)?
        {
            return Ok(events);
        }

        // Resolve the sender; sender-less lines come from the uplink.
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
        if net.is_internal(&sender) {
            warn!(net = %net.name, command = %command, "command routed the wrong way");
            return Ok(Vec::new());
        }

        // ENCAP is unwrapped in place: :src ENCAP * SU <uid> <account>
        let mut command = command;
        if command == "ENCAP" && args.len() >= 2 {
            args.remove(0);
            command = args.remove(0).to_ascii_uppercase();
        }

        match command.as_str() {
            "PING" => {
                // Reply from the mentioned destination (or our SID).
                let destination = args.get(1).cloned().unwrap_or_else(|| net.sid());
                if net.is_internal_server(&destination) {
                    let origin = args.first().cloned().unwrap_or_default();
                    self.send_from(net, &destination, &format!("PONG {destination} {origin}"));
                }
                Ok(Vec::new())
            }
            "PONG" => Ok(Vec::new()),
            "EUID" => Ok(self.handle_euid(net, &sender, &args, true)),
            "UID" => Ok(self.handle_euid(net, &sender, &args, false)),
            "SID" => {
                // <- :42X SID services.example.net 2 9XY :Services
                let (Some(name), Some(sid)) = (args.first(), args.get(2)) else {
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
            "SERVER" => {
                // Jupes and legacy server introductions, keyed by name.
                let Some(name) = args.first() else {
                    return Ok(Vec::new());
                };
                base::register_server(
                    net,
                    Some(&sender),
                    name,
                    name,
                    &args.last().cloned().unwrap_or_default(),
                );
                Ok(Vec::new())
            }
            "SJOIN" => Ok(self.handle_sjoin(net, &sender, &args)),
            "JOIN" => Ok(self.handle_join(net, &sender, &args)),
            "TMODE" => Ok(self.handle_tmode(net, &sender, &args)),
            "MODE" => Ok(self.handle_usermode(net, &sender, &args)),
            "BMASK" => Ok(self.handle_bmask(net, &sender, &args)),
            "TB" => {
                // <- :42X TB #channel 1434510754 setter :topic
                let (Some(channel), Some(ts)) = (args.first(), args.get(1)) else {
                    return Ok(Vec::new());
                };
                let key = net.to_lower(channel);
                let topic = args.last().cloned().unwrap_or_default();
                let setter = args.get(2).cloned().unwrap_or_default();
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
                        setter,
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
                let channels: Vec<String> =
                    chans.split(',').map(|c| net.to_lower(c)).collect();
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
                // <- :42X SAVE 42XAAAAAB 1437801097: nick forced to UID.
                let Some(target) = args.first().cloned() else {
                    return Ok(Vec::new());
                };
                if let Some(mut user) = net.users.get_mut(&target) {
                    user.nick = target.clone();
                    user.nick_ts = 100;
                }
                Ok(vec![HookEvent::new(
                    &sender,
                    HookPayload::Save { target },
                )])
            }
            "AWAY" => {
                let text = args.first().cloned().unwrap_or_default();
                if let Some(mut user) = net.users.get_mut(&sender) {
                    user.away = text.clone();
                }
                Ok(vec![HookEvent::new(&sender, HookPayload::Away { text })])
            }
            "INVITE" => {
                // <- :42XAAAAAC INVITE 42XAAAAAA #channel 1437801097
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
            "KNOCK" => {
                let Some(channel) = args.first() else {
                    return Ok(Vec::new());
                };
                Ok(vec![HookEvent::new(
                    &sender,
                    HookPayload::Knock {
                        channel: net.to_lower(channel),
                        text: String::new(),
                    },
                )])
            }
            "CHGHOST" => {
                let (Some(target), Some(newhost)) = (args.first(), args.get(1)) else {
                    return Ok(Vec::new());
                };
                if let Some(mut user) = net.users.get_mut(target) {
                    user.host = newhost.clone();
                }
                Ok(vec![HookEvent::new(
                    &sender,
                    HookPayload::ChgHost {
                        target: target.clone(),
                        newhost: newhost.clone(),
                    },
                )])
            }
            "REALHOST" => {
                // Ratbox ENCAP REALHOST propagation.
                if let (Some(host), Some(mut user)) = (args.first(), net.users.get_mut(&sender)) {
                    user.realhost = host.clone();
                }
                Ok(Vec::new())
            }
            "SU" => {
                // ENCAP SU <uid> [account]: services login/logout.
                let Some(target) = args.first().cloned() else {
                    return Ok(Vec::new());
                };
                let account = args.get(1).cloned().unwrap_or_default();
                if let Some(mut user) = net.users.get_mut(&target) {
                    user.services_account = account.clone();
                }
                Ok(vec![HookEvent::new(
                    &target,
                    HookPayload::ServicesLogin { account },
                )])
            }
            "SQUIT" => {
                let Some(target) = args.first() else {
                    return Ok(Vec::new());
                };
                let reason = args.last().cloned().unwrap_or_default();
                let payload = base::squit_common(net, target, &reason)?;
                Ok(vec![HookEvent::new(&sender, payload)])
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
            "WHOIS" => {
                // <- :42XAAAAAB WHOIS 9ZZAAAAAA :slink
                let Some(target) = args.first().cloned() else {
                    return Ok(Vec::new());
                };
                Ok(vec![HookEvent::new(
                    &sender,
                    HookPayload::Whois {
                        target,
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
        let uid = {
            let mut state = self.state.lock();
            state
                .uidgens
                .entry(server.clone())
                .or_insert_with(|| Ts6UidGenerator::new(&server))
                .next_uid()
                .map_err(|_| OutgoingError::UnknownTarget("uid space exhausted".to_string()))?
        };
        let user = base::spawn_state(net, &uid, &opts)?;
        let raw_modes = join_modes(&opts.modes, true);
        let modestring = raw_modes.split(' ').next().unwrap_or("+").to_string();
        match self.flavor {
            Flavor::Charybdis => {
                // EUID carries the real host and account inline.
                let realhost = opts.realhost.as_deref().unwrap_or("*");
                self.send_from(
                    net,
                    &server,
                    &format!(
                        "EUID {} 1 {} {} {} {} {} {} {} * :{}",
                        user.nick,
                        user.ts,
                        modestring,
                        user.ident,
                        user.host,
                        user.ip,
                        uid,
                        realhost,
                        user.realname
                    ),
                );
            }
            Flavor::Ratbox => {
                self.send_from(
                    net,
                    &server,
                    &format!(
                        "UID {} 1 {} {} {} {} {} {} :{}",
                        user.nick,
                        user.ts,
                        modestring,
                        user.ident,
                        user.host,
                        user.ip,
                        uid,
                        user.realname
                    ),
                );
                if let Some(realhost) = &opts.realhost {
                    self.send_from(net, &uid, &format!("ENCAP * REALHOST {realhost}"));
                }
            }
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
        if net
            .servers
            .iter()
            .any(|s| s.name.eq_ignore_ascii_case(&name))
        {
            return Err(OutgoingError::UnknownTarget(format!(
                "server {name} already exists"
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
        self.send_from(net, &uplink, &format!("SID {name} 1 {sid} :{desc}"));
        Ok(sid)
    }

    fn join(&self, net: &Network, client: &str, channel: &str) -> OutgoingResult {
        require_internal_client(net, client)?;
        let key = net.get_or_create_channel(channel);
        let ts = net.channel_snapshot(&key).map(|c| c.ts).unwrap_or_else(now_ts);
        self.send_from(net, client, &format!("JOIN {ts} {key} +"));
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
        // List modes never ride along in SJOIN.
        let simple_modes: Vec<ModeChange> = modes_in
            .iter()
            .filter(|m| !map.is_list_mode(m.letter))
            .cloned()
            .collect();
        modes::apply_modes(net, &key, &simple_modes);

        let mut prefix_changes = Vec::new();
        for chunk in users.chunks(SJOIN_CHUNK) {
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
            self.send_from(
                net,
                server,
                &format!(
                    "SJOIN {ts} {key} {} :{}",
                    join_modes(&simple_modes, false),
                    namelist.join(" ")
                ),
            );
        }
        modes::apply_modes(net, &key, &prefix_changes);
        Ok(())
    }

    fn part(&self, net: &Network, client: &str, channel: &str, reason: &str)
    -> OutgoingResult {
        require_internal_client(net, client)?;
        let key = net.to_lower(channel);
        if reason.is_empty() {
            self.send_from(net, client, &format!("PART {key}"));
        } else {
            self.send_from(net, client, &format!("PART {key} :{reason}"));
        }
        net.remove_user_from_channel(client, &key);
        Ok(())
    }

    fn quit(&self, net: &Network, client: &str, reason: &str) -> OutgoingResult {
        require_internal_client(net, client)?;
        self.send_from(net, client, &format!("QUIT :{reason}"));
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
        self.send_from(net, source, &format!("KICK {key} {target} :{reason}"));
        net.remove_user_from_channel(target, &key);
        Ok(())
    }

    fn kill(&self, net: &Network, source: &str, target: &str, reason: &str)
    -> OutgoingResult {
        require_internal(net, source)?;
        if !net.users.contains_key(target) {
            return Err(OutgoingError::UnknownTarget(target.to_string()));
        }
        self.send_from(net, source, &format!("KILL {target} :Killed ({reason})"));
        net.remove_client(target);
        Ok(())
    }

    fn nick(&self, net: &Network, client: &str, newnick: &str) -> OutgoingResult {
        require_internal_client(net, client)?;
        let ts = now_ts();
        self.send_from(net, client, &format!("NICK {newnick} {ts}"));
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
            for line in wrap_modes(changes, 450, MAX_MODES_PER_MSG) {
                self.send_from(net, source, &format!("TMODE {ts} {key} {line}"));
            }
        } else {
            self.send_from(
                net,
                source,
                &format!("MODE {target} {}", join_modes(changes, false)),
            );
        }
        Ok(())
    }

    fn topic(&self, net: &Network, source: &str, channel: &str, text: &str)
    -> OutgoingResult {
        require_internal_client(net, source)?;
        let key = net.to_lower(channel);
        self.send_from(net, source, &format!("TOPIC {key} :{text}"));
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
        let setter = net
            .servers
            .get(source)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| source.to_string());
        self.send_from(net, source, &format!("TB {key} {ts} {setter} :{text}"));
        if let Some(mut chan) = net.channels.get_mut(&key) {
            chan.topic = text.to_string();
            chan.topicset = true;
        }
        Ok(())
    }

    fn message(&self, net: &Network, source: &str, target: &str, text: &str)
    -> OutgoingResult {
        require_internal_client(net, source)?;
        self.send_from(net, source, &format!("PRIVMSG {target} :{text}"));
        Ok(())
    }

    fn notice(&self, net: &Network, source: &str, target: &str, text: &str)
    -> OutgoingResult {
        require_internal(net, source)?;
        self.send_from(net, source, &format!("NOTICE {target} :{text}"));
        Ok(())
    }

    fn invite(&self, net: &Network, source: &str, target: &str, channel: &str)
    -> OutgoingResult {
        require_internal_client(net, source)?;
        let key = net.to_lower(channel);
        let ts = net.channel_snapshot(&key).map(|c| c.ts).unwrap_or_else(now_ts);
        self.send_from(net, source, &format!("INVITE {target} {key} {ts}"));
        Ok(())
    }

    fn knock(&self, net: &Network, source: &str, channel: &str, _text: &str)
    -> OutgoingResult {
        if !self.uplink_has_cap("KNOCK") {
            debug!(net = %net.name, "uplink lacks KNOCK; dropping");
            return Ok(());
        }
        require_internal_client(net, source)?;
        // TS6 KNOCK carries no text.
        self.send_from(net, source, &format!("KNOCK {}", net.to_lower(channel)));
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
        self.send_from(net, source, &format!("{numeric:03} {target} {text}"));
        Ok(())
    }

    fn update_client(
        &self,
        net: &Network,
        target: &str,
        field: ClientField,
        text: &str,
    ) -> OutgoingResult {
        if field != ClientField::Host || self.flavor == Flavor::Ratbox {
            return Err(OutgoingError::NotImplemented("update_client"));
        }
        if !net.users.contains_key(target) {
            return Err(OutgoingError::UnknownTarget(target.to_string()));
        }
        self.send_from(net, &net.sid(), &format!("CHGHOST {target} :{text}"));
        if let Some(mut user) = net.users.get_mut(target) {
            user.host = text.to_string();
        }
        Ok(())
    }

    fn away(&self, net: &Network, client: &str, text: &str) -> OutgoingResult {
        require_internal_client(net, client)?;
        if text.is_empty() {
            self.send_from(net, client, "AWAY");
        } else {
            self.send_from(net, client, &format!("AWAY :{text}"));
        }
        if let Some(mut user) = net.users.get_mut(client) {
            user.away = text.to_string();
        }
        Ok(())
    }

    fn ping(&self, net: &Network) {
        let sid = net.sid();
        if !sid.is_empty() {
            self.send_from(net, &sid, &format!("PING {sid}"));
        }
    }

    fn squit(&self, net: &Network, source: &str, target: &str, reason: &str)
    -> OutgoingResult {
        require_internal_server(net, source)?;
        self.send_from(net, source, &format!("SQUIT {target} :{reason}"));
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

    fn ts6_net() -> Arc<Network> {
        let net = test_net_with_protocol("ts6net", "ts6");
        // Run the CAPAB/PASS handshake to install the mode maps.
        net.protocol
            .handle_line(&net, "PASS linkage TS 6 :1SV")
            .unwrap();
        net.protocol
            .handle_line(
                &net,
                "CAPAB :BAN CHW CLUSTER ENCAP EOPMOD EUID EX IE KLN KNOCK MLOCK QS RSFNC SAVE SERVICES TB UNKLN",
            )
            .unwrap();
        net.protocol
            .handle_line(&net, "SERVER charybdis.example.net 1 :test server")
            .unwrap();
        net
    }

    fn intro_user(net: &Network, nick: &str, uid: &str) {
        net.protocol
            .handle_line(
                net,
                &format!(
                    ":1SV EUID {nick} 1 1437505322 +i ~{nick} example.org 10.0.0.1 {uid} * * :real"
                ),
            )
            .unwrap();
    }

    #[test]
    fn test_handshake_wrong_password_is_fatal() {
        let net = test_net_with_protocol("ts6net", "ts6");
        let err = net
            .protocol
            .handle_line(&net, "PASS wrongpass TS 6 :1SV")
            .unwrap_err();
        assert!(matches!(err, ProtocolError::BadPassword));
    }

    #[test]
    fn test_handshake_missing_euid_is_fatal() {
        let net = test_net_with_protocol("ts6net", "ts6");
        net.protocol
            .handle_line(&net, "PASS linkage TS 6 :1SV")
            .unwrap();
        let err = net
            .protocol
            .handle_line(&net, "CAPAB :QS ENCAP TB SAVE")
            .unwrap_err();
        assert!(matches!(err, ProtocolError::MissingCapability(_)));
    }

    #[test]
    fn test_euid_registers_user() {
        let net = ts6_net();
        intro_user(&net, "GL", "1SVAAAAAB");
        let user = net.users.get("1SVAAAAAB").unwrap();
        assert_eq!(user.nick, "GL");
        assert!(user.has_mode('i'));
        assert_eq!(user.server, "1SV");
    }

    #[test]
    fn test_sjoin_lower_ts_wins() {
        let net = ts6_net();
        intro_user(&net, "A", "1SVAAAAAA");
        intro_user(&net, "B", "1SVAAAAAB");
        intro_user(&net, "C", "1SVAAAAAC");
        // Existing local state: ts=1000, +nt, A opped.
        net.protocol
            .handle_line(&net, ":1SV SJOIN 1000 #test +nt :@1SVAAAAAA")
            .unwrap();

        let events = net
            .protocol
            .handle_line(&net, ":1SV SJOIN 500 #test +m :@1SVAAAAAB 1SVAAAAAC")
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].command, "SJOIN");

        let chan = net.channel_snapshot("#test").unwrap();
        assert_eq!(chan.ts, 500);
        assert_eq!(chan.modes, [('m', None)].into_iter().collect());
        assert!(chan.has_prefix(PrefixLevel::Op, "1SVAAAAAB"));
        assert!(!chan.has_prefix(PrefixLevel::Op, "1SVAAAAAA"));
        assert_eq!(chan.users.len(), 3);
    }

    #[test]
    fn test_tmode_emits_mode_hook() {
        let net = ts6_net();
        intro_user(&net, "GL", "1SVAAAAAB");
        net.protocol
            .handle_line(&net, ":1SVAAAAAB JOIN 1437 #chan +")
            .unwrap();
        let events = net
            .protocol
            .handle_line(&net, ":1SVAAAAAB TMODE 1437 #chan +ntk sekrit")
            .unwrap();
        let HookPayload::Mode { target, modes, .. } = &events[0].payload else {
            panic!("expected MODE payload");
        };
        assert_eq!(target, "#chan");
        assert_eq!(modes.len(), 3);
        let chan = net.channel_snapshot("#chan").unwrap();
        assert!(chan.modes.contains(&('k', Some("sekrit".to_string()))));
    }

    #[test]
    fn test_bmask_applies_bans() {
        let net = ts6_net();
        net.protocol
            .handle_line(&net, ":1SV SJOIN 100 #dev +nt :")
            .unwrap();
        net.protocol
            .handle_line(&net, ":1SV BMASK 100 #dev b :*!test@*.isp.net *!bad@*")
            .unwrap();
        let chan = net.channel_snapshot("#dev").unwrap();
        assert!(chan.modes.contains(&('b', Some("*!test@*.isp.net".to_string()))));
        assert!(chan.modes.contains(&('b', Some("*!bad@*".to_string()))));
    }

    #[test]
    fn test_kill_carries_userdata() {
        let net = ts6_net();
        intro_user(&net, "victim", "1SVAAAAAD");
        let events = net
            .protocol
            .handle_line(&net, ":1SV KILL 1SVAAAAAD :charybdis.example.net (bye)")
            .unwrap();
        let HookPayload::Kill {
            target, userdata, ..
        } = &events[0].payload
        else {
            panic!("expected KILL payload");
        };
        assert_eq!(target, "1SVAAAAAD");
        assert!(userdata.is_some());
        assert!(!net.users.contains_key("1SVAAAAAD"));
    }

    #[test]
    fn test_save_resets_nick_to_uid() {
        let net = ts6_net();
        intro_user(&net, "clash", "1SVAAAAAE");
        let events = net
            .protocol
            .handle_line(&net, ":1SV SAVE 1SVAAAAAE 1437")
            .unwrap();
        assert_eq!(events[0].command, "SAVE");
        assert_eq!(net.users.get("1SVAAAAAE").unwrap().nick, "1SVAAAAAE");
    }

    #[test]
    fn test_encap_su_login() {
        let net = ts6_net();
        intro_user(&net, "GL", "1SVAAAAAB");
        let events = net
            .protocol
            .handle_line(&net, ":1SV ENCAP * SU 1SVAAAAAB :gl-account")
            .unwrap();
        assert_eq!(events[0].command, "CLIENT_SERVICES_LOGIN");
        assert_eq!(
            net.users.get("1SVAAAAAB").unwrap().services_account,
            "gl-account"
        );
    }

    #[test]
    fn test_spawn_client_sends_euid() {
        let net = ts6_net();
        let uid = net
            .protocol
            .spawn_client(&net, SpawnOpts::new("relaybot"))
            .unwrap();
        assert!(uid.starts_with("9ZZ"));
        assert!(net.is_internal_client(&uid));
    }

    #[test]
    fn test_spawn_server_uses_sidrange() {
        let net = ts6_net();
        let sid = net
            .protocol
            .spawn_server(&net, "b.relay", "relay for b")
            .unwrap();
        assert_eq!(sid.len(), 3);
        assert!(net.is_internal_server(&sid));
    }

    #[test]
    fn test_error_line_is_fatal() {
        let net = ts6_net();
        let err = net
            .protocol
            .handle_line(&net, "ERROR :Closing Link: (throttled)")
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UplinkError(_)));
    }
}
