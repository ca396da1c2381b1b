//! Mode parsing, application and reversal against per-network mode maps.
//!
//! Channel modes are split into the four ISUPPORT CHANMODES classes:
//!
//! - Type A: list modes (bans etc.); argument on set and unset, many values.
//! - Type B: always take an argument; one value per letter.
//! - Type C: argument only when setting; one value per letter.
//! - Type D: never take an argument.
//!
//! Prefix modes (owner/admin/op/halfop/voice) take a nick or UID argument
//! and are stored in the channel's prefix map, never in the mode set.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::state::{Network, PrefixLevel};

/// A single parsed mode change.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModeChange {
    pub adding: bool,
    pub letter: char,
    pub arg: Option<String>,
}

impl ModeChange {
    pub fn plus(letter: char, arg: Option<&str>) -> Self {
        Self {
            adding: true,
            letter,
            arg: arg.map(str::to_string),
        }
    }

    pub fn minus(letter: char, arg: Option<&str>) -> Self {
        Self {
            adding: false,
            letter,
            arg: arg.map(str::to_string),
        }
    }
}

/// Per-network mode map: named modes to letters, the A/B/C/D class split,
/// and the prefix-mode table.
#[derive(Debug, Clone)]
pub struct ModeMap {
    /// Named mode -> letter ("ban" -> 'b', "topiclock" -> 't', ...).
    names: HashMap<String, char>,
    pub type_a: String,
    pub type_b: String,
    pub type_c: String,
    pub type_d: String,
    /// Ordered highest-first: (level, mode letter, status symbol).
    prefixes: Vec<(PrefixLevel, char, char)>,
}

impl ModeMap {
    pub fn empty() -> Self {
        Self {
            names: HashMap::new(),
            type_a: String::new(),
            type_b: String::new(),
            type_c: String::new(),
            type_d: String::new(),
            prefixes: Vec::new(),
        }
    }

    /// The RFC 1459 channel mode baseline every IRCd implies.
    pub fn rfc1459_cmodes() -> Self {
        let mut map = Self::empty();
        for (name, letter) in [
            ("ban", 'b'),
            ("key", 'k'),
            ("limit", 'l'),
            ("moderated", 'm'),
            ("noextmsg", 'n'),
            ("inviteonly", 'i'),
            ("private", 'p'),
            ("secret", 's'),
            ("topiclock", 't'),
        ] {
            map.names.insert(name.to_string(), letter);
        }
        map.type_a = "b".to_string();
        map.type_b = "k".to_string();
        map.type_c = "l".to_string();
        map.type_d = "imnpst".to_string();
        map.prefixes = vec![
            (PrefixLevel::Op, 'o', '@'),
            (PrefixLevel::Voice, 'v', '+'),
        ];
        map
    }

    /// The RFC 1459 user mode baseline.
    pub fn rfc1459_umodes() -> Self {
        let mut map = Self::empty();
        for (name, letter) in [
            ("invisible", 'i'),
            ("oper", 'o'),
            ("snomask", 's'),
            ("wallops", 'w'),
        ] {
            map.names.insert(name.to_string(), letter);
        }
        map.type_c = "s".to_string();
        map.type_d = "iow".to_string();
        map
    }

    pub fn insert(&mut self, name: &str, letter: char) {
        self.names.insert(name.to_string(), letter);
    }

    /// Letter for a named mode, checking prefix modes too.
    pub fn letter(&self, name: &str) -> Option<char> {
        if let Some(level) = PrefixLevel::from_name(name) {
            return self.prefix_letter(level);
        }
        self.names.get(name).copied()
    }

    /// Named mode for a letter, checking prefix modes too.
    pub fn name_of(&self, letter: char) -> Option<&str> {
        if let Some(level) = self.prefix_level_of_letter(letter) {
            return Some(level.name());
        }
        self.names
            .iter()
            .find(|&(_, &l)| l == letter)
            .map(|(name, _)| name.as_str())
    }

    pub fn set_prefixes(&mut self, prefixes: &[(PrefixLevel, char, char)]) {
        let mut prefixes = prefixes.to_vec();
        prefixes.sort_by_key(|(level, _, _)| *level);
        self.prefixes = prefixes;
    }

    pub fn prefix_letter(&self, level: PrefixLevel) -> Option<char> {
        self.prefixes
            .iter()
            .find(|(l, _, _)| *l == level)
            .map(|(_, letter, _)| *letter)
    }

    pub fn prefix_symbol(&self, level: PrefixLevel) -> Option<char> {
        self.prefixes
            .iter()
            .find(|(l, _, _)| *l == level)
            .map(|(_, _, sym)| *sym)
    }

    pub fn prefix_level_of_letter(&self, letter: char) -> Option<PrefixLevel> {
        self.prefixes
            .iter()
            .find(|(_, l, _)| *l == letter)
            .map(|(level, _, _)| *level)
    }

    pub fn prefix_level_of_symbol(&self, symbol: char) -> Option<PrefixLevel> {
        self.prefixes
            .iter()
            .find(|(_, _, s)| *s == symbol)
            .map(|(level, _, _)| *level)
    }

    /// All prefix mode letters, highest level first.
    pub fn prefix_letters(&self) -> String {
        self.prefixes.iter().map(|(_, l, _)| *l).collect()
    }

    /// All prefix status symbols, highest level first.
    pub fn prefix_symbols(&self) -> String {
        self.prefixes.iter().map(|(_, _, s)| *s).collect()
    }

    pub fn is_prefix_letter(&self, letter: char) -> bool {
        self.prefixes.iter().any(|(_, l, _)| *l == letter)
    }

    pub fn is_list_mode(&self, letter: char) -> bool {
        self.type_a.contains(letter)
    }

    /// Serialise the A,B,C,D split the way ISUPPORT advertises it.
    pub fn chanmodes_isupport(&self) -> String {
        format!(
            "{},{},{},{}",
            self.type_a, self.type_b, self.type_c, self.type_d
        )
    }
}

/// Mode parsing target: channels resolve prefix-mode arguments through the
/// user index, users do not.
fn is_channel(target: &str) -> bool {
    target.starts_with('#')
}

/// Parse a modestring plus trailing arguments into ordered mode changes.
///
/// Pairs whose required argument is missing are dropped with a warning, as
/// are prefix-mode arguments that resolve to nobody on the target channel.
pub fn parse_modes(net: &Network, target: &str, args: &[&str]) -> Vec<ModeChange> {
    let Some(modestring) = args.first() else {
        return Vec::new();
    };
    let usermodes = !is_channel(target);
    let map = if usermodes {
        net.umodes()
    } else {
        net.cmodes()
    };
    let oldmodes = if usermodes {
        net.users
            .get(target)
            .map(|u| u.modes.clone())
            .unwrap_or_default()
    } else {
        net.channel_snapshot(target)
            .map(|c| c.modes)
            .unwrap_or_default()
    };

    let mut res = Vec::new();
    let mut rest = args[1..].iter();
    let mut adding = true;
    for mode in modestring.chars() {
        match mode {
            '+' => adding = true,
            '-' => adding = false,
            _ => {
                let needs_arg = map.type_a.contains(mode)
                    || map.type_b.contains(mode)
                    || (!usermodes && map.is_prefix_letter(mode))
                    || (adding && map.type_c.contains(mode));
                let mut arg = if needs_arg {
                    match rest.next() {
                        Some(a) => Some((*a).to_string()),
                        None => {
                            warn!(
                                target_ = %target,
                                mode = %mode,
                                "mode requires an argument but none was left; dropping"
                            );
                            continue;
                        }
                    }
                } else {
                    None
                };

                // Charybdis allows unsetting +k with a faked "*" argument;
                // coerce it to the real key so apply_modes can match it.
                if !adding
                    && map.type_b.contains(mode)
                    && arg.as_deref() == Some("*")
                    && let Some((_, Some(old))) =
                        oldmodes.iter().find(|(l, _)| *l == mode)
                {
                    arg = Some(old.clone());
                }

                // Prefix-mode arguments may arrive as nicks; resolve them to
                // UIDs and require membership on the target channel.
                if !usermodes && map.is_prefix_letter(mode) {
                    let raw = arg.take().unwrap_or_default();
                    let uid = if net.users.contains_key(&raw) {
                        Some(raw)
                    } else {
                        net.nick_to_uid(&raw)
                    };
                    match uid {
                        Some(uid)
                            if net
                                .channel_snapshot(target)
                                .is_some_and(|c| c.users.contains(&uid)) =>
                        {
                            arg = Some(uid);
                        }
                        _ => {
                            debug!(
                                target_ = %target,
                                mode = %mode,
                                "prefix mode target unknown or not on channel; dropping"
                            );
                            continue;
                        }
                    }
                }

                res.push(ModeChange {
                    adding,
                    letter: mode,
                    arg,
                });
            }
        }
    }
    res
}

/// Apply parsed mode changes to a channel or user.
pub fn apply_modes(net: &Network, target: &str, changes: &[ModeChange]) {
    if is_channel(target) {
        apply_channel_modes(net, target, changes);
    } else {
        apply_user_modes(net, target, changes);
    }
}

fn apply_channel_modes(net: &Network, target: &str, changes: &[ModeChange]) {
    let map = net.cmodes();
    let key = net.to_lower(target);
    let Some(mut chan) = net.channels.get_mut(&key) else {
        warn!(channel = %target, "apply_modes on unknown channel");
        return;
    };
    for change in changes {
        // Prefix modes only ever touch the prefix map.
        if let Some(level) = map.prefix_level_of_letter(change.letter) {
            let Some(uid) = change.arg.as_deref() else {
                continue;
            };
            if change.adding {
                chan.grant_prefix(level, uid);
            } else {
                chan.revoke_prefix(level, uid);
            }
            continue;
        }

        if change.adding {
            if map.is_list_mode(change.letter) {
                // List modes: reconcile case-differing duplicates, keeping
                // the original-cased argument.
                let arg = change.arg.clone();
                let duplicate = chan.modes.iter().any(|(l, a)| {
                    *l == change.letter
                        && match (a, &arg) {
                            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                            (None, None) => true,
                            _ => false,
                        }
                });
                if !duplicate {
                    chan.modes.insert((change.letter, arg));
                }
            } else {
                // One value per letter: setting replaces.
                chan.modes.retain(|(l, _)| *l != change.letter);
                chan.modes.insert((change.letter, change.arg.clone()));
            }
        } else if map.is_list_mode(change.letter) {
            // Remove by case-insensitive match of the stored original.
            let arg = change.arg.clone();
            chan.modes.retain(|(l, a)| {
                *l != change.letter
                    || !match (a, &arg) {
                        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                        (None, None) => true,
                        _ => false,
                    }
            });
        } else if map.type_b.contains(change.letter) {
            // Unset only when the argument matches the stored value.
            let matches = chan.modes.iter().any(|(l, a)| {
                *l == change.letter
                    && match (a, &change.arg) {
                        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                        _ => false,
                    }
            });
            if matches {
                chan.modes.retain(|(l, _)| *l != change.letter);
            }
        } else {
            // Type C/D: unset regardless of argument.
            chan.modes.retain(|(l, _)| *l != change.letter);
        }
    }
}

fn apply_user_modes(net: &Network, target: &str, changes: &[ModeChange]) {
    let map = net.umodes();
    let Some(mut user) = net.users.get_mut(target) else {
        warn!(user = %target, "apply_modes on unknown user");
        return;
    };
    for change in changes {
        if change.adding {
            if !map.is_list_mode(change.letter) {
                user.modes.retain(|(l, _)| *l != change.letter);
            }
            user.modes.insert((change.letter, change.arg.clone()));
        } else if change.arg.is_none() {
            user.modes.retain(|(l, _)| *l != change.letter);
        } else {
            user.modes
                .retain(|(l, a)| *l != change.letter || a != &change.arg);
        }
    }
}

/// Compute the mode change that undoes `changes` against the current state
/// of `target` (or, for channels, against `old` when a before-state
/// snapshot was captured).
///
/// Setting something already set and unsetting something not set both
/// reverse to nothing; unsetting a set B/C mode reverses to re-set the
/// previous argument.
pub fn reverse_modes(
    net: &Network,
    target: &str,
    changes: &[ModeChange],
    old: Option<&crate::state::Channel>,
) -> Vec<ModeChange> {
    let usermodes = !is_channel(target);
    let map = if usermodes {
        net.umodes()
    } else {
        net.cmodes()
    };

    let (oldmodes, oldchan) = if usermodes {
        (
            net.users
                .get(target)
                .map(|u| u.modes.clone())
                .unwrap_or_default(),
            None,
        )
    } else {
        let snapshot = old.cloned().or_else(|| net.channel_snapshot(target));
        (
            snapshot.as_ref().map(|c| c.modes.clone()).unwrap_or_default(),
            snapshot,
        )
    };

    let mut out = Vec::new();
    for change in changes {
        // Prefix modes reverse based on the old prefix map.
        if !usermodes && let Some(level) = map.prefix_level_of_letter(change.letter) {
            let Some(uid) = change.arg.as_deref() else {
                continue;
            };
            let was_set = oldchan
                .as_ref()
                .is_some_and(|c| c.has_prefix(level, uid));
            if change.adding != was_set {
                out.push(ModeChange {
                    adding: !change.adding,
                    letter: change.letter,
                    arg: change.arg.clone(),
                });
            }
            continue;
        }

        let current: Vec<&(char, Option<String>)> = oldmodes
            .iter()
            .filter(|(l, _)| *l == change.letter)
            .collect();

        if change.adding {
            let already = current.iter().any(|(_, a)| a == &change.arg);
            if already {
                // Setting a mode that was already set is a no-op.
                continue;
            }
            if map.is_list_mode(change.letter) || map.type_d.contains(change.letter) {
                out.push(ModeChange {
                    adding: false,
                    letter: change.letter,
                    arg: change.arg.clone(),
                });
            } else if let Some((_, prev)) = current.first() {
                // B/C mode replaced an older value: reverse re-sets it.
                out.push(ModeChange {
                    adding: true,
                    letter: change.letter,
                    arg: prev.clone(),
                });
            } else {
                out.push(ModeChange {
                    adding: false,
                    letter: change.letter,
                    arg: if map.type_c.contains(change.letter) {
                        None
                    } else {
                        change.arg.clone()
                    },
                });
            }
        } else {
            // Unsetting: only meaningful if the mode was actually set.
            let Some((_, prev)) = current.first() else {
                continue;
            };
            if map.is_list_mode(change.letter) {
                let matched = current.iter().any(|(_, a)| match (a, &change.arg) {
                    (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                    (None, None) => true,
                    _ => false,
                });
                if matched {
                    out.push(ModeChange {
                        adding: true,
                        letter: change.letter,
                        arg: change.arg.clone(),
                    });
                }
            } else {
                out.push(ModeChange {
                    adding: true,
                    letter: change.letter,
                    arg: prev.clone(),
                });
            }
        }
    }
    out
}

/// Join parsed mode changes into a single "modestring args..." string,
/// coalescing runs of the same sign.
pub fn join_modes(changes: &[ModeChange], sort: bool) -> String {
    let mut changes: Vec<&ModeChange> = changes.iter().collect();
    if sort {
        changes.sort_by_key(|c| (!c.adding, c.letter, c.arg.clone()));
    }

    let mut modestring = String::new();
    let mut args = Vec::new();
    let mut sign: Option<bool> = None;
    for change in changes {
        if sign != Some(change.adding) {
            modestring.push(if change.adding { '+' } else { '-' });
            sign = Some(change.adding);
        }
        modestring.push(change.letter);
        if let Some(arg) = &change.arg {
            args.push(arg.clone());
        }
    }
    if modestring.is_empty() {
        modestring.push('+');
    }
    if args.is_empty() {
        modestring
    } else {
        format!("{} {}", modestring, args.join(" "))
    }
}

/// Split mode changes into wire-sized chunks: at most `max_modes` mode
/// letters per line and at most `bufsize` bytes per joined string.
pub fn wrap_modes(changes: &[ModeChange], bufsize: usize, max_modes: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut chunk: Vec<ModeChange> = Vec::new();
    for change in changes {
        if !chunk.is_empty() {
            let mut candidate = chunk.clone();
            candidate.push(change.clone());
            if candidate.len() > max_modes || join_modes(&candidate, false).len() > bufsize {
                out.push(join_modes(&chunk, false));
                chunk.clear();
            }
        }
        chunk.push(change.clone());
    }
    if !chunk.is_empty() {
        out.push(join_modes(&chunk, false));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::test_net;

    fn changes(pairs: &[(&str, Option<&str>)]) -> Vec<ModeChange> {
        pairs.iter()
            .map(|(m, a)| {
                let mut it = m.chars();
                let sign = it.next().unwrap();
                ModeChange {
                    adding: sign == '+',
                    letter: it.next().unwrap(),
                    arg: a.map(str::to_string),
                }
            })
            .collect()
    }

    #[test]
    fn test_parse_modes_basic() {
        let net = test_net("testnet");
        net.spawn_test_channel("#chan", 1000, &[]);
        let parsed = parse_modes(&net, "#chan", &["+mitl-o", "3", "person"]);
        // -o person drops (person is not on the channel); the rest parse.
        assert_eq!(parsed.len(), 4);
        assert_eq!(parsed[0], ModeChange::plus('m', None));
        assert_eq!(parsed[3], ModeChange::plus('l', Some("3")));
    }

    #[test]
    fn test_parse_modes_default_plus() {
        let net = test_net("testnet");
        net.spawn_test_channel("#chan", 1000, &[]);
        let parsed = parse_modes(&net, "#chan", &["nt"]);
        assert!(parsed.iter().all(|c| c.adding));
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_parse_modes_prefix_resolves_nick() {
        let net = test_net("testnet");
        let uid = net.spawn_test_user("GLolol", "001");
        net.spawn_test_channel("#chan", 1000, &[&uid]);
        let parsed = parse_modes(&net, "#chan", &["+o", "GLolol"]);
        assert_eq!(parsed, vec![ModeChange::plus('o', Some(uid.as_str()))]);
    }

    #[test]
    fn test_parse_modes_missing_arg_dropped() {
        let net = test_net("testnet");
        net.spawn_test_channel("#chan", 1000, &[]);
        let parsed = parse_modes(&net, "#chan", &["+nk"]);
        assert_eq!(parsed, vec![ModeChange::plus('n', None)]);
    }

    #[test]
    fn test_parse_modes_key_star_coercion() {
        let net = test_net("testnet");
        net.spawn_test_channel("#chan", 1000, &[]);
        apply_modes(&net, "#chan", &[ModeChange::plus('k', Some("sekrit"))]);
        let parsed = parse_modes(&net, "#chan", &["-k", "*"]);
        assert_eq!(parsed, vec![ModeChange::minus('k', Some("sekrit"))]);
    }

    #[test]
    fn test_apply_replaces_limit() {
        let net = test_net("testnet");
        net.spawn_test_channel("#chan", 1000, &[]);
        apply_modes(&net, "#chan", &changes(&[("+l", Some("25"))]));
        apply_modes(&net, "#chan", &changes(&[("+l", Some("30"))]));
        let chan = net.channel_snapshot("#chan").unwrap();
        assert_eq!(chan.modes.len(), 1);
        assert!(chan.modes.contains(&('l', Some("30".to_string()))));
    }

    #[test]
    fn test_apply_list_mode_case_insensitive_removal() {
        let net = test_net("testnet");
        net.spawn_test_channel("#chan", 1000, &[]);
        apply_modes(&net, "#chan", &changes(&[("+b", Some("*!*@Bad.Host"))]));
        // Case-differing duplicate is reconciled away.
        apply_modes(&net, "#chan", &changes(&[("+b", Some("*!*@bad.host"))]));
        let chan = net.channel_snapshot("#chan").unwrap();
        assert_eq!(chan.modes.len(), 1);
        assert!(chan.modes.contains(&('b', Some("*!*@Bad.Host".to_string()))));
        apply_modes(&net, "#chan", &changes(&[("-b", Some("*!*@BAD.HOST"))]));
        assert!(net.channel_snapshot("#chan").unwrap().modes.is_empty());
    }

    #[test]
    fn test_apply_prefix_modes_stay_out_of_mode_set() {
        let net = test_net("testnet");
        let uid = net.spawn_test_user("gl", "001");
        net.spawn_test_channel("#chan", 1000, &[&uid]);
        apply_modes(&net, "#chan", &[ModeChange::plus('o', Some(uid.as_str()))]);
        let chan = net.channel_snapshot("#chan").unwrap();
        assert!(chan.modes.is_empty());
        assert!(chan.has_prefix(PrefixLevel::Op, &uid));
    }

    #[test]
    fn test_reverse_unset_limit_restores_value() {
        let net = test_net("testnet");
        net.spawn_test_channel("#chan", 1000, &[]);
        apply_modes(&net, "#chan", &changes(&[("+l", Some("50"))]));
        let reversed = reverse_modes(&net, "#chan", &changes(&[("-l", None)]), None);
        assert_eq!(reversed, vec![ModeChange::plus('l', Some("50"))]);
    }

    #[test]
    fn test_reverse_drops_noops() {
        let net = test_net("testnet");
        net.spawn_test_channel("#chan", 1000, &[]);
        apply_modes(&net, "#chan", &changes(&[("+n", None)]));
        // +n already set, -s never set: both reverse to nothing.
        let reversed = reverse_modes(
            &net,
            "#chan",
            &changes(&[("+n", None), ("-s", None)]),
            None,
        );
        assert!(reversed.is_empty());
    }

    #[test]
    fn test_reverse_replaced_key_resets_previous() {
        let net = test_net("testnet");
        net.spawn_test_channel("#chan", 1000, &[]);
        apply_modes(&net, "#chan", &changes(&[("+k", Some("old"))]));
        let reversed = reverse_modes(&net, "#chan", &changes(&[("+k", Some("new"))]), None);
        assert_eq!(reversed, vec![ModeChange::plus('k', Some("old"))]);
    }

    #[test]
    fn test_reverse_then_apply_restores_state() {
        let net = test_net("testnet");
        net.spawn_test_channel("#chan", 1000, &[]);
        apply_modes(&net, "#chan", &changes(&[("+n", None), ("+l", Some("10"))]));
        let before = net.channel_snapshot("#chan").unwrap();

        let delta = changes(&[("-n", None), ("+l", Some("99")), ("+m", None)]);
        let undo = reverse_modes(&net, "#chan", &delta, Some(&before));
        apply_modes(&net, "#chan", &delta);
        apply_modes(&net, "#chan", &undo);

        let after = net.channel_snapshot("#chan").unwrap();
        assert_eq!(after.modes, before.modes);
    }

    #[test]
    fn test_join_modes_coalesces_signs() {
        let joined = join_modes(
            &changes(&[("+n", None), ("+t", None), ("-l", None), ("-k", Some("x"))]),
            false,
        );
        assert_eq!(joined, "+nt-lk x");
    }

    #[test]
    fn test_join_modes_empty() {
        assert_eq!(join_modes(&[], false), "+");
    }

    #[test]
    fn test_parse_join_roundtrip() {
        let net = test_net("testnet");
        let uid = net.spawn_test_user("gl", "001");
        net.spawn_test_channel("#chan", 1000, &[&uid]);
        let original = vec![
            ModeChange::plus('n', None),
            ModeChange::plus('o', Some(uid.as_str())),
            ModeChange::minus('t', None),
            ModeChange::plus('b', Some("*!*@x")),
        ];
        let joined = join_modes(&original, false);
        let parts: Vec<&str> = joined.split(' ').collect();
        let reparsed = parse_modes(&net, "#chan", &parts);
        assert_eq!(reparsed, original);
    }

    #[test]
    fn test_wrap_modes_respects_limits() {
        let many: Vec<ModeChange> = (0..7)
            .map(|i| {
                let mask = format!("*!*@host{i}");
                ModeChange::plus('b', Some(mask.as_str()))
            })
            .collect();
        let lines = wrap_modes(&many, 512, 3);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "+bbb *!*@host0 *!*@host1 *!*@host2");
        assert_eq!(lines[2], "+b *!*@host6");
    }

    #[test]
    fn test_wrap_modes_respects_bufsize() {
        let many: Vec<ModeChange> = (0..4)
            .map(|i| {
                let mask = format!("*!*@very.long.host.name.example{i}");
                ModeChange::plus('b', Some(mask.as_str()))
            })
            .collect();
        let lines = wrap_modes(&many, 60, 10);
        assert!(lines.len() > 1);
        for line in &lines {
            assert!(line.len() <= 60, "{line:?} exceeds the line size");
        }
    }
}
