//! Shared machinery for RFC1459-framed S2S dialects.
//!
//! Line parsing with ":trailing" arguments, user/server registration,
//! recursive SQUIT handling and the TS arbitration applied on channel
//! bursts. Drivers call into these and keep only their wire formats local.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::{OutgoingError, ProtocolError};
use crate::hooks::HookPayload;
use crate::modes::{self, ModeChange};
use crate::protocols::SpawnOpts;
use crate::state::{Channel, Network, Server, User, now_ts};

/// Parse RFC1459-style arguments: ":" introduces a trailing argument
/// spanning the rest of the line.
pub fn parse_args(line: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = line;
    while !rest.is_empty() {
        if let Some(trailing) = rest.strip_prefix(':')
            && !out.is_empty()
        {
            out.push(trailing.to_string());
            break;
        }
        match rest.split_once(' ') {
            Some((word, tail)) => {
                if !word.is_empty() {
                    out.push(word.to_string());
                }
                rest = tail;
            }
            None => {
                out.push(rest.to_string());
                break;
            }
        }
    }
    out
}

/// Split a prefixed line into (sender, command, args). Lines without a
/// ":sender" prefix return `None` for the sender.
pub fn split_line(line: &str) -> Option<(Option<String>, String, Vec<String>)> {
    let mut args = parse_args(line);
    if args.is_empty() {
        return None;
    }
    let sender = if let Some(first) = args[0].strip_prefix(':') {
        let sender = first.to_string();
        args.remove(0);
        Some(sender)
    } else {
        None
    };
    if args.is_empty() {
        return None;
    }
    let command = args.remove(0).to_ascii_uppercase();
    Some((sender, command, args))
}

/// Parse an 005 / CAPAB-style token list into KEY=VALUE pairs.
pub fn parse_capabilities(args: &str) -> HashMap<String, String> {
    let mut caps = HashMap::new();
    for cap in args.split_whitespace() {
        match cap.split_once('=') {
            Some((key, value)) => caps.insert(key.to_string(), value.to_string()),
            None => caps.insert(cap.to_string(), String::new()),
        };
    }
    caps
}

/// Parse a PREFIX token like "(qaohv)~&@%+" into (letter, symbol) pairs.
pub fn parse_prefixes(token: &str) -> Vec<(char, char)> {
    static PREFIX_RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = PREFIX_RE
        .get_or_init(|| regex::Regex::new(r"\(([A-Za-z]+)\)(.*)").expect("static regex compiles"));
    let Some(caps) = re.captures(token) else {
        return Vec::new();
    };
    caps[1].chars().zip(caps[2].chars()).collect()
}

/// Whether a string is a syntactically valid IRC nick. Slashes are only
/// legal on networks that allow them, which the caller has to know.
pub fn is_valid_nick(nick: &str) -> bool {
    static NICK_RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = NICK_RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z\x5b-\x60\x7b-\x7d][A-Za-z0-9\x5b-\x60\x7b-\x7d/-]*$")
            .expect("static regex compiles")
    });
    !nick.is_empty() && re.is_match(nick)
}

/// Whether a string looks like a nick!user@host mask.
pub fn is_hostmask(text: &str) -> bool {
    let Some((nick, rest)) = text.split_once('!') else {
        return false;
    };
    let Some((user, host)) = rest.split_once('@') else {
        return false;
    };
    !nick.is_empty()
        && !user.is_empty()
        && !host.is_empty()
        && !text.contains(' ')
        && text.matches('!').count() == 1
        && text.matches('@').count() == 1
}

pub fn is_server_name(s: &str) -> bool {
    s.contains('.') && !s.starts_with('.') && s.is_ascii() && !s.contains(' ')
}

/// Register a freshly introduced user in the indexes.
#[allow(clippy::too_many_arguments)]
pub fn register_user(
    net: &Network,
    server: &str,
    uid: &str,
    nick: &str,
    ts: i64,
    ident: &str,
    host: &str,
    realhost: &str,
    ip: &str,
    realname: &str,
) -> User {
    let mut user = User::new(nick, ts, uid, server);
    user.ident = ident.to_string();
    user.host = host.to_string();
    user.realhost = realhost.to_string();
    user.ip = ip.to_string();
    user.realname = realname.to_string();
    net.users.insert(uid.to_string(), user.clone());
    if let Some(mut s) = net.servers.get_mut(server) {
        s.users.insert(uid.to_string());
    }
    user
}

/// Shared state bookkeeping for `spawn_client`: resolve the owning
/// internal server, register the user, apply its modes and metadata.
/// The caller has already allocated `uid` and handles the wire format.
pub fn spawn_state(net: &Network, uid: &str, opts: &SpawnOpts) -> Result<User, OutgoingError> {
    let server = opts.server.clone().unwrap_or_else(|| net.sid());
    if !net.is_internal_server(&server) {
        return Err(OutgoingError::InvalidSource(server));
    }
    if !is_valid_nick(&opts.nick) {
        return Err(OutgoingError::UnknownTarget(format!(
            "invalid nickname {:?}",
            opts.nick
        )));
    }
    let ts = opts.ts.unwrap_or_else(now_ts);
    let realname = if opts.realname.is_empty() {
        net.config().bot.realname.clone()
    } else {
        opts.realname.clone()
    };
    let realhost = opts.realhost.clone().unwrap_or_else(|| opts.host.clone());
    register_user(
        net,
        &server,
        uid,
        &opts.nick,
        ts,
        &opts.ident,
        &opts.host,
        &realhost,
        &opts.ip,
        &realname,
    );
    modes::apply_modes(net, uid, &opts.modes);
    if let Some(mut user) = net.users.get_mut(uid) {
        user.opertype = opts.opertype.clone();
        user.manipulatable = opts.manipulatable;
        Ok(user.clone())
    } else {
        Err(OutgoingError::UnknownTarget(uid.to_string()))
    }
}

/// Register a server introduced by `uplink`.
pub fn register_server(net: &Network, uplink: Option<&str>, sid: &str, name: &str, desc: &str) {
    let mut server = Server::new(uplink, name, false, desc);
    if let Some(up) = uplink
        && let Some(parent) = net.servers.get(up)
    {
        server.hopcount = parent.hopcount + 1;
    }
    net.servers.insert(sid.to_string(), server);
}

/// Resolve a sender field that may be a SID, UID, server name or nick.
pub fn resolve_sender(net: &Network, sender: &str) -> Option<String> {
    if net.servers.contains_key(sender) || net.users.contains_key(sender) {
        return Some(sender.to_string());
    }
    if let Some(entry) = net
        .servers
        .iter()
        .find(|s| s.name.eq_ignore_ascii_case(sender))
    {
        return Some(entry.key().clone());
    }
    net.nick_to_uid(sender)
}

/// Normalise a PRIVMSG/NOTICE target: map Charybdis "=#chan" op-moderation
/// to "@#chan", keep status prefixes, casemap the channel part, and map
/// nicks to UIDs.
pub fn resolve_msg_target(net: &Network, raw: &str) -> String {
    let mut target = raw.to_string();
    if let Some(rest) = target.strip_prefix('=') {
        target = format!("@{rest}");
    }
    if let Some(hash) = target.find('#') {
        let (prefix, chan) = target.split_at(hash);
        return format!("{}{}", prefix, net.to_lower(chan));
    }
    if net.users.contains_key(&target) {
        return target;
    }
    net.nick_to_uid(&target).unwrap_or(target)
}

/// Format the relayed kill reason: "Killed (killer (reason))".
pub fn kill_message(net: &Network, source: &str, path_and_reason: &str) -> String {
    let killer = net.get_friendly_name(source);
    // The path argument is "some.path (reason)"; keep only the reason part.
    let reason = path_and_reason
        .split_once(' ')
        .map(|(_, r)| r)
        .unwrap_or(path_and_reason);
    format!("Killed ({killer} {reason})")
}

// ----------------------------------------------------------------------
// SQUIT handling
// ----------------------------------------------------------------------

/// Recursively split a server, removing it, all servers behind it and all
/// their users. Splitting our own SID or the uplink is a protocol error
/// (the uplink is throwing us out).
pub fn squit_common(
    net: &Network,
    split_server: &str,
    reason: &str,
) -> Result<HookPayload, ProtocolError> {
    if split_server == net.sid() || Some(split_server.to_string()) == net.uplink() {
        return Err(ProtocolError::UplinkError(format!(
            "SQUIT received for ourselves (reason: {reason})"
        )));
    }
    let Some(serverdata) = net.servers.get(split_server).map(|s| s.clone()) else {
        warn!(net = %net.name, sid = %split_server, "SQUIT for unknown server");
        return Ok(HookPayload::Squit {
            target: split_server.to_string(),
            users: Vec::new(),
            name: String::new(),
            uplink: None,
            nicks: HashMap::new(),
            serverdata: None,
        });
    };

    let mut affected_users = Vec::new();
    let mut affected_nicks: HashMap<String, Vec<String>> = HashMap::new();
    debug!(net = %net.name, sid = %split_server, reason = %reason, "splitting server");

    // Leaf servers behind the split one go down with it.
    let leaves: Vec<String> = net
        .servers
        .iter()
        .filter(|s| s.uplink.as_deref() == Some(split_server))
        .map(|s| s.key().clone())
        .collect();
    for leaf in leaves {
        if let HookPayload::Squit { users, nicks, .. } =
            squit_common(net, &leaf, "hub split")?
        {
            affected_users.extend(users);
            for (chan, mut lost) in nicks {
                affected_nicks.entry(chan).or_default().append(&mut lost);
            }
        }
    }

    let members: Vec<String> = net
        .servers
        .get(split_server)
        .map(|s| s.users.iter().cloned().collect())
        .unwrap_or_default();
    for uid in members {
        if let Some(user) = net.users.get(&uid).map(|u| u.clone()) {
            for chan in &user.channels {
                affected_nicks
                    .entry(chan.clone())
                    .or_default()
                    .push(user.nick.clone());
            }
        }
        net.remove_client(&uid);
        affected_users.push(uid);
    }

    net.servers.remove(split_server);

    Ok(HookPayload::Squit {
        target: split_server.to_string(),
        users: affected_users,
        name: serverdata.name.clone(),
        uplink: serverdata.uplink.clone(),
        nicks: affected_nicks,
        serverdata: Some(serverdata),
    })
}

// ----------------------------------------------------------------------
// Generic command dispatch
// ----------------------------------------------------------------------

/// Handle the commands whose semantics are identical across the S2S
/// dialects. Returns `None` when the command is driver-specific.
pub fn common_dispatch(
    net: &Network,
    sender: &str,
    command: &str,
    args: &[String],
) -> Result<Option<Vec<crate::hooks::HookEvent>>, ProtocolError> {
    use crate::hooks::HookEvent;
    let events = match command {
        "PART" => {
            let Some(chans) = args.first() else {
                return Ok(Some(Vec::new()));
            };
            let channels: Vec<String> = chans.split(',').map(|c| net.to_lower(c)).collect();
            for chan in &channels {
                net.remove_user_from_channel(sender, chan);
            }
            vec![HookEvent::new(
                sender,
                HookPayload::Part {
                    channels,
                    text: args.get(1).cloned().unwrap_or_default(),
                },
            )]
        }
        "QUIT" => {
            net.remove_client(sender);
            vec![HookEvent::new(
                sender,
                HookPayload::Quit {
                    text: args.first().cloned().unwrap_or_default(),
                },
            )]
        }
        "KILL" => {
            let Some(target) = args.first() else {
                return Ok(Some(Vec::new()));
            };
            let target = if net.users.contains_key(target) {
                target.clone()
            } else {
                net.nick_to_uid(target).unwrap_or_else(|| target.clone())
            };
            let text = kill_message(net, sender, &args.last().cloned().unwrap_or_default());
            let userdata = net.remove_client(&target);
            vec![HookEvent::new(
                sender,
                HookPayload::Kill {
                    target,
                    text,
                    userdata,
                },
            )]
        }
        "KICK" => {
            let (Some(channel), Some(target)) = (args.first(), args.get(1)) else {
                return Ok(Some(Vec::new()));
            };
            let key = net.to_lower(channel);
            let target = if net.users.contains_key(target) {
                target.clone()
            } else {
                net.nick_to_uid(target).unwrap_or_else(|| target.clone())
            };
            net.remove_user_from_channel(&target, &key);
            vec![HookEvent::new(
                sender,
                HookPayload::Kick {
                    channel: key,
                    target,
                    text: args.get(2).cloned().unwrap_or_default(),
                },
            )]
        }
        "NICK" => {
            let Some(newnick) = args.first().cloned() else {
                return Ok(Some(Vec::new()));
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
            vec![HookEvent::new(
                sender,
                HookPayload::Nick {
                    newnick,
                    oldnick,
                    ts,
                },
            )]
        }
        "AWAY" => {
            let text = args.last().cloned().unwrap_or_default();
            if let Some(mut user) = net.users.get_mut(sender) {
                user.away = text.clone();
            }
            vec![HookEvent::new(sender, HookPayload::Away { text })]
        }
        "INVITE" => {
            let (Some(target), Some(channel)) = (args.first(), args.get(1)) else {
                return Ok(Some(Vec::new()));
            };
            let target = if net.users.contains_key(target) {
                target.clone()
            } else {
                net.nick_to_uid(target).unwrap_or_else(|| target.clone())
            };
            vec![HookEvent::new(
                sender,
                HookPayload::Invite {
                    target,
                    channel: net.to_lower(channel),
                },
            )]
        }
        "PRIVMSG" | "NOTICE" => {
            let (Some(target), Some(text)) = (args.first(), args.get(1)) else {
                return Ok(Some(Vec::new()));
            };
            let target = resolve_msg_target(net, target);
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
            vec![HookEvent::new(sender, payload)]
        }
        "SQUIT" => {
            let Some(target) = args.first() else {
                return Ok(Some(Vec::new()));
            };
            let target = resolve_sender(net, target).unwrap_or_else(|| target.clone());
            let reason = args.last().cloned().unwrap_or_default();
            let payload = squit_common(net, &target, &reason)?;
            vec![HookEvent::new(sender, payload)]
        }
        "SVSNICK" => {
            let (Some(target), Some(newnick)) = (args.first(), args.get(1)) else {
                return Ok(Some(Vec::new()));
            };
            let target = if net.users.contains_key(target) {
                target.clone()
            } else {
                net.nick_to_uid(target).unwrap_or_else(|| target.clone())
            };
            vec![HookEvent::new(
                sender,
                HookPayload::SvsNick {
                    target,
                    newnick: newnick.clone(),
                },
            )]
        }
        "WHOIS" => {
            let Some(target) = args.last().cloned() else {
                return Ok(Some(Vec::new()));
            };
            vec![HookEvent::new(
                sender,
                HookPayload::Whois {
                    target,
                    server: net.sid(),
                },
            )]
        }
        _ => return Ok(None),
    };
    Ok(Some(events))
}

// ----------------------------------------------------------------------
// Channel burst merging (TS arbitration)
// ----------------------------------------------------------------------

/// Result of merging an incoming channel burst.
pub struct BurstMerge {
    /// Casemapped channel key.
    pub key: String,
    /// UIDs that joined in this burst.
    pub users: Vec<String>,
    /// Their modes as parsed (possibly discarded by arbitration).
    pub modes: Vec<ModeChange>,
    /// Pre-merge channel state.
    pub oldchan: Option<Channel>,
}

/// Merge an SJOIN/BURST/NJOIN into channel state under TS rules:
///
/// - their TS lower: drop local non-list and prefix modes, apply theirs,
///   lower the channel TS, merge membership.
/// - their TS higher: ignore their modes and prefix claims, merge
///   membership only.
/// - equal: union of everything.
pub fn merge_channel_burst(
    net: &Network,
    channel: &str,
    their_ts: i64,
    their_modes: Vec<ModeChange>,
    userlist: Vec<(String, String)>,
) -> BurstMerge {
    let key = net.get_or_create_channel(channel);
    let oldchan = net.channel_snapshot(&key);
    let our_ts = oldchan.as_ref().map(|c| c.ts).unwrap_or(their_ts);
    let cmodes = net.cmodes();

    let accept_modes = their_ts <= our_ts;
    if their_ts < our_ts {
        debug!(
            net = %net.name,
            channel = %key,
            our_ts,
            their_ts,
            "burst with lower TS wins; clearing local status modes"
        );
        if let Some(mut chan) = net.channels.get_mut(&key) {
            chan.clear_status_modes(&cmodes.type_a);
            chan.ts = their_ts;
        }
    }

    if accept_modes {
        modes::apply_modes(net, &key, &their_modes);
    }

    let mut joined = Vec::new();
    for (prefixes, uid) in userlist {
        if !net.users.contains_key(&uid) {
            warn!(net = %net.name, uid = %uid, channel = %key, "burst names unknown user");
            continue;
        }
        net.add_user_to_channel(&uid, &key);
        if accept_modes {
            let prefix_changes: Vec<ModeChange> = prefixes
                .chars()
                .map(|letter| ModeChange::plus(letter, Some(uid.as_str())))
                .collect();
            modes::apply_modes(net, &key, &prefix_changes);
        }
        joined.push(uid);
    }

    BurstMerge {
        key,
        users: joined,
        modes: if accept_modes { their_modes } else { Vec::new() },
        oldchan,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PrefixLevel;
    use crate::state::test_support::test_net;

    #[test]
    fn test_parse_args_trailing() {
        assert_eq!(
            parse_args(":42X PRIVMSG #dev :hello there world"),
            vec![":42X", "PRIVMSG", "#dev", "hello there world"]
        );
    }

    #[test]
    fn test_parse_args_no_trailing() {
        assert_eq!(parse_args("PING :one"), vec!["PING", "one"]);
        assert_eq!(parse_args("SVINFO 6 6 0"), vec!["SVINFO", "6", "6", "0"]);
    }

    #[test]
    fn test_split_line() {
        let (sender, command, args) = split_line(":42XAAAAAB TMODE 1437 #chan +nt").unwrap();
        assert_eq!(sender.as_deref(), Some("42XAAAAAB"));
        assert_eq!(command, "TMODE");
        assert_eq!(args, vec!["1437", "#chan", "+nt"]);

        let (sender, command, _) = split_line("PASS foo TS 6 :42X").unwrap();
        assert!(sender.is_none());
        assert_eq!(command, "PASS");
    }

    #[test]
    fn test_parse_prefixes() {
        let prefixes = parse_prefixes("(qaohv)~&@%+");
        assert_eq!(prefixes.len(), 5);
        assert_eq!(prefixes[0], ('q', '~'));
        assert_eq!(prefixes[4], ('v', '+'));
    }

    #[test]
    fn test_is_valid_nick() {
        assert!(is_valid_nick("GLolol"));
        assert!(is_valid_nick("[away]^_`{|}"));
        assert!(is_valid_nick("gl/overdrive"));
        assert!(!is_valid_nick("9starts-with-digit"));
        assert!(!is_valid_nick("-dash"));
        assert!(!is_valid_nick(""));
        assert!(!is_valid_nick("has space"));
    }

    #[test]
    fn test_is_hostmask() {
        assert!(is_hostmask("*!*@bad.host"));
        assert!(is_hostmask("nick!user@host"));
        assert!(!is_hostmask("#channel"));
        assert!(!is_hostmask("nick!user"));
        assert!(!is_hostmask("a!b@c d"));
    }

    #[test]
    fn test_resolve_msg_target_coerces_opmod() {
        let net = test_net("testnet");
        assert_eq!(resolve_msg_target(&net, "=#Chan"), "@#chan");
        assert_eq!(resolve_msg_target(&net, "@#Big"), "@#big");
    }

    #[test]
    fn test_squit_recursion() {
        let net = test_net("testnet");
        net.spawn_test_server("1AA", false);
        // 2BB hangs off 1AA.
        net.servers.insert(
            "2BB".to_string(),
            Server::new(Some("1AA"), "leaf.example", false, "leaf"),
        );
        let top = net.spawn_test_user("top", "1AA");
        let leaf = net.spawn_test_user("leaf", "2BB");
        net.spawn_test_channel("#chan", 100, &[&top, &leaf]);

        let payload = squit_common(&net, "1AA", "going down").unwrap();
        let HookPayload::Squit { users, nicks, .. } = payload else {
            panic!("wrong payload");
        };
        assert_eq!(users.len(), 2);
        assert!(!net.servers.contains_key("1AA"));
        assert!(!net.servers.contains_key("2BB"));
        assert!(!net.users.contains_key(&top));
        assert!(!net.users.contains_key(&leaf));
        let lost = &nicks["#chan"];
        assert!(lost.contains(&"top".to_string()) && lost.contains(&"leaf".to_string()));
    }

    #[test]
    fn test_squit_of_uplink_is_fatal() {
        let net = test_net("testnet");
        net.spawn_test_server("00U", false);
        net.set_uplink("00U");
        assert!(squit_common(&net, "00U", "bye").is_err());
    }

    #[test]
    fn test_burst_lower_ts_wins() {
        let net = test_net("testnet");
        let a = net.spawn_test_user("a", "001");
        let b = net.spawn_test_user("b", "001");
        let c = net.spawn_test_user("c", "001");
        net.spawn_test_channel("#test", 1000, &[&a]);
        modes::apply_modes(
            &net,
            "#test",
            &[
                ModeChange::plus('n', None),
                ModeChange::plus('t', None),
                ModeChange::plus('o', Some(a.as_str())),
            ],
        );

        let merge = merge_channel_burst(
            &net,
            "#test",
            500,
            vec![ModeChange::plus('m', None)],
            vec![("o".to_string(), b.clone()), (String::new(), c.clone())],
        );
        assert_eq!(merge.users.len(), 2);

        let chan = net.channel_snapshot("#test").unwrap();
        assert_eq!(chan.ts, 500);
        assert_eq!(chan.modes, [('m', None)].into_iter().collect());
        assert!(chan.has_prefix(PrefixLevel::Op, &b));
        // A was not in the burst: keeps membership, loses op.
        assert!(chan.users.contains(&a));
        assert!(!chan.has_prefix(PrefixLevel::Op, &a));
        assert_eq!(chan.users.len(), 3);
    }

    #[test]
    fn test_burst_higher_ts_loses() {
        let net = test_net("testnet");
        let a = net.spawn_test_user("a", "001");
        let b = net.spawn_test_user("b", "001");
        net.spawn_test_channel("#test", 500, &[&a]);
        modes::apply_modes(&net, "#test", &[ModeChange::plus('n', None)]);

        merge_channel_burst(
            &net,
            "#test",
            1000,
            vec![ModeChange::plus('m', None)],
            vec![("o".to_string(), b.clone())],
        );

        let chan = net.channel_snapshot("#test").unwrap();
        assert_eq!(chan.ts, 500, "TS is monotone non-increasing");
        assert!(chan.modes.contains(&('n', None)));
        assert!(!chan.modes.contains(&('m', None)));
        assert!(chan.users.contains(&b), "membership still merges");
        assert!(!chan.has_prefix(PrefixLevel::Op, &b), "their op claim ignored");
    }

    #[test]
    fn test_burst_equal_ts_unions() {
        let net = test_net("testnet");
        let a = net.spawn_test_user("a", "001");
        let b = net.spawn_test_user("b", "001");
        net.spawn_test_channel("#test", 750, &[&a]);
        modes::apply_modes(
            &net,
            "#test",
            &[ModeChange::plus('n', None), ModeChange::plus('o', Some(a.as_str()))],
        );

        merge_channel_burst(
            &net,
            "#test",
            750,
            vec![ModeChange::plus('m', None)],
            vec![("o".to_string(), b.clone())],
        );

        let chan = net.channel_snapshot("#test").unwrap();
        assert_eq!(chan.ts, 750);
        assert!(chan.modes.contains(&('n', None)));
        assert!(chan.modes.contains(&('m', None)));
        assert!(chan.has_prefix(PrefixLevel::Op, &a));
        assert!(chan.has_prefix(PrefixLevel::Op, &b));
    }
}
