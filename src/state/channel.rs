//! Channel records and prefix-mode bookkeeping.

use std::collections::{HashMap, HashSet};

/// The five status levels a channel member can hold, ranked.
///
/// Prefix modes live here and never in the channel's ordinary mode set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PrefixLevel {
    Owner,
    Admin,
    Op,
    Halfop,
    Voice,
}

impl PrefixLevel {
    /// All levels, highest first.
    pub const RANKED: [PrefixLevel; 5] = [
        PrefixLevel::Owner,
        PrefixLevel::Admin,
        PrefixLevel::Op,
        PrefixLevel::Halfop,
        PrefixLevel::Voice,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PrefixLevel::Owner => "owner",
            PrefixLevel::Admin => "admin",
            PrefixLevel::Op => "op",
            PrefixLevel::Halfop => "halfop",
            PrefixLevel::Voice => "voice",
        }
    }

    pub fn from_name(name: &str) -> Option<PrefixLevel> {
        match name {
            "owner" => Some(PrefixLevel::Owner),
            "admin" => Some(PrefixLevel::Admin),
            "op" => Some(PrefixLevel::Op),
            "halfop" => Some(PrefixLevel::Halfop),
            "voice" => Some(PrefixLevel::Voice),
            _ => None,
        }
    }

    /// Whether this level passes the "halfop or above" moderation bar.
    pub fn is_halfop_plus(self) -> bool {
        self <= PrefixLevel::Halfop
    }
}

/// One channel on one network.
///
/// Keyed in the network index by its casemapped name. `Clone` gives the
/// deep before-state snapshots mode processing and CLAIM checks rely on.
#[derive(Debug, Clone)]
pub struct Channel {
    pub name: String,
    /// Creation timestamp; merges only ever lower it.
    pub ts: i64,
    pub users: HashSet<String>,
    /// Non-prefix modes as (letter, optional argument) pairs.
    pub modes: HashSet<(char, Option<String>)>,
    /// Status level -> member UIDs holding it.
    pub prefixmodes: HashMap<PrefixLevel, HashSet<String>>,
    pub topic: String,
    /// Whether a topic burst has happened (distinguishes "no topic yet"
    /// from an explicitly cleared topic).
    pub topicset: bool,
}

impl Channel {
    pub fn new(name: &str, ts: i64) -> Self {
        Self {
            name: name.to_string(),
            ts,
            users: HashSet::new(),
            modes: HashSet::new(),
            prefixmodes: HashMap::new(),
            topic: String::new(),
            topicset: false,
        }
    }

    /// Remove a user from the member set and every prefix level.
    pub fn remove_user(&mut self, uid: &str) {
        self.users.remove(uid);
        for members in self.prefixmodes.values_mut() {
            members.remove(uid);
        }
    }

    /// Status levels held by `uid`, highest first.
    pub fn get_prefix_modes(&self, uid: &str) -> Vec<PrefixLevel> {
        PrefixLevel::RANKED
            .iter()
            .copied()
            .filter(|level| {
                self.prefixmodes
                    .get(level)
                    .is_some_and(|members| members.contains(uid))
            })
            .collect()
    }

    pub fn grant_prefix(&mut self, level: PrefixLevel, uid: &str) {
        self.prefixmodes
            .entry(level)
            .or_default()
            .insert(uid.to_string());
    }

    pub fn revoke_prefix(&mut self, level: PrefixLevel, uid: &str) {
        if let Some(members) = self.prefixmodes.get_mut(&level) {
            members.remove(uid);
        }
    }

    pub fn has_prefix(&self, level: PrefixLevel, uid: &str) -> bool {
        self.prefixmodes
            .get(&level)
            .is_some_and(|members| members.contains(uid))
    }

    /// Whether `uid` holds halfop or above.
    pub fn is_halfop_plus(&self, uid: &str) -> bool {
        self.get_prefix_modes(uid)
            .first()
            .is_some_and(|level| level.is_halfop_plus())
    }

    /// Drop all non-list modes and all prefix modes, keeping membership.
    /// Used when a lower-TS burst wins arbitration.
    pub fn clear_status_modes(&mut self, list_mode_letters: &str) {
        self.modes
            .retain(|(letter, _)| list_mode_letters.contains(*letter));
        self.prefixmodes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_rank_order() {
        let mut c = Channel::new("#test", 100);
        c.users.insert("U1".to_string());
        c.grant_prefix(PrefixLevel::Voice, "U1");
        c.grant_prefix(PrefixLevel::Op, "U1");
        assert_eq!(
            c.get_prefix_modes("U1"),
            vec![PrefixLevel::Op, PrefixLevel::Voice]
        );
    }

    #[test]
    fn test_remove_user_clears_prefixes() {
        let mut c = Channel::new("#test", 100);
        c.users.insert("U1".to_string());
        c.grant_prefix(PrefixLevel::Op, "U1");
        c.remove_user("U1");
        assert!(!c.users.contains("U1"));
        assert!(c.get_prefix_modes("U1").is_empty());
    }

    #[test]
    fn test_halfop_plus() {
        let mut c = Channel::new("#test", 100);
        c.grant_prefix(PrefixLevel::Voice, "V");
        c.grant_prefix(PrefixLevel::Halfop, "H");
        c.grant_prefix(PrefixLevel::Owner, "Q");
        assert!(!c.is_halfop_plus("V"));
        assert!(c.is_halfop_plus("H"));
        assert!(c.is_halfop_plus("Q"));
        assert!(!c.is_halfop_plus("nobody"));
    }

    #[test]
    fn test_clear_status_modes_keeps_lists() {
        let mut c = Channel::new("#test", 100);
        c.modes.insert(('n', None));
        c.modes.insert(('t', None));
        c.modes.insert(('b', Some("*!*@bad".to_string())));
        c.grant_prefix(PrefixLevel::Op, "U1");
        c.clear_status_modes("beI");
        assert_eq!(c.modes.len(), 1);
        assert!(c.modes.contains(&('b', Some("*!*@bad".to_string()))));
        assert!(c.get_prefix_modes("U1").is_empty());
    }
}
