//! The channel link table and its JSON persistence.
//!
//! Each entry is keyed by its home `(network, channel)` pair and lists the
//! leaf channels linked to it, the CLAIM set, and blocked networks. The
//! table is written atomically (temp file + rename) on every mutation.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::state::now_ts;

/// One relayed channel: its home plus everything linked to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkEntry {
    /// Leaf (network, channel) pairs linked here.
    #[serde(default)]
    pub links: BTreeSet<(String, String)>,
    /// Networks allowed to override moderation; empty means everyone.
    #[serde(default)]
    pub claim: BTreeSet<String>,
    /// Networks refused from linking.
    #[serde(default)]
    pub blocked_nets: BTreeSet<String>,
    /// Hostmask of whoever created the relay.
    #[serde(default)]
    pub creator: String,
    pub ts: i64,
}

impl LinkEntry {
    pub fn new(creator: &str) -> Self {
        Self {
            links: BTreeSet::new(),
            claim: BTreeSet::new(),
            blocked_nets: BTreeSet::new(),
            creator: creator.to_string(),
            ts: now_ts(),
        }
    }
}

/// On-disk row shape: the tuple key flattened next to the entry.
#[derive(Serialize, Deserialize)]
struct EntryOnDisk {
    net: String,
    channel: String,
    #[serde(flatten)]
    entry: LinkEntry,
}

#[derive(Debug, Default)]
pub struct RelayDb {
    entries: HashMap<(String, String), LinkEntry>,
}

impl RelayDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a (network, channel) pair to the home pair of its relay:
    /// either the pair itself, or the home whose links contain it.
    pub fn get_relay(&self, pair: &(String, String)) -> Option<(String, String)> {
        if self.entries.contains_key(pair) {
            return Some(pair.clone());
        }
        self.entries
            .iter()
            .find(|(_, entry)| entry.links.contains(pair))
            .map(|(home, _)| home.clone())
    }

    pub fn get(&self, home: &(String, String)) -> Option<&LinkEntry> {
        self.entries.get(home)
    }

    pub fn get_mut(&mut self, home: &(String, String)) -> Option<&mut LinkEntry> {
        self.entries.get_mut(home)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(String, String), &LinkEntry)> {
        self.entries.iter()
    }

    /// Open a channel for relaying, making this pair a home.
    pub fn create(&mut self, net: &str, channel: &str, creator: &str) -> bool {
        let key = (net.to_string(), channel.to_string());
        if self.get_relay(&key).is_some() {
            return false;
        }
        self.entries.insert(key, LinkEntry::new(creator));
        true
    }

    /// Link a leaf channel to an existing home. Refuses links that would
    /// nest relays or hit a blocked network.
    pub fn link(
        &mut self,
        home: &(String, String),
        leaf_net: &str,
        leaf_channel: &str,
    ) -> Result<(), String> {
        let leaf = (leaf_net.to_string(), leaf_channel.to_string());
        if self.get_relay(&leaf).is_some() {
            return Err(format!(
                "channel {} on {} is already part of a relay",
                leaf_channel, leaf_net
            ));
        }
        let Some(entry) = self.entries.get_mut(home) else {
            return Err(format!("no relay exists for {}{}", home.0, home.1));
        };
        if entry.blocked_nets.contains(leaf_net) {
            return Err(format!("network {leaf_net} is blocked from linking"));
        }
        entry.links.insert(leaf);
        Ok(())
    }

    /// Remove a leaf from its relay. Returns the home pair it belonged to.
    pub fn delink(&mut self, leaf: &(String, String)) -> Option<(String, String)> {
        let home = self
            .entries
            .iter()
            .find(|(_, entry)| entry.links.contains(leaf))
            .map(|(home, _)| home.clone())?;
        if let Some(entry) = self.entries.get_mut(&home) {
            entry.links.remove(leaf);
        }
        Some(home)
    }

    /// Tear down a home channel and all its links.
    pub fn destroy(&mut self, home: &(String, String)) -> Option<LinkEntry> {
        self.entries.remove(home)
    }

    /// Drop every entry and link involving a network (used by purge).
    pub fn purge_network(&mut self, netname: &str) -> usize {
        let mut removed = 0;
        let homes: Vec<(String, String)> = self
            .entries
            .keys()
            .filter(|(net, _)| net == netname)
            .cloned()
            .collect();
        for home in homes {
            self.entries.remove(&home);
            removed += 1;
        }
        for entry in self.entries.values_mut() {
            let before = entry.links.len();
            entry.links.retain(|(net, _)| net != netname);
            removed += before - entry.links.len();
        }
        removed
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    pub fn load(path: &Path) -> RelayDb {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no relay DB found; starting empty");
                return RelayDb::new();
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read relay DB; starting empty");
                return RelayDb::new();
            }
        };
        match serde_json::from_str::<Vec<EntryOnDisk>>(&raw) {
            Ok(rows) => {
                let mut db = RelayDb::new();
                for row in rows {
                    db.entries.insert((row.net, row.channel), row.entry);
                }
                info!(path = %path.display(), channels = db.entries.len(), "loaded relay DB");
                db
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot parse relay DB; starting empty");
                RelayDb::new()
            }
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let mut rows: Vec<EntryOnDisk> = self
            .entries
            .iter()
            .map(|(key, entry)| EntryOnDisk {
                net: key.0.clone(),
                channel: key.1.clone(),
                entry: entry.clone(),
            })
            .collect();
        rows.sort_by(|a, b| (&a.net, &a.channel).cmp(&(&b.net, &b.channel)));
        let raw = serde_json::to_string_pretty(&rows)?;
        let tmp: PathBuf = path.with_extension("tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, path)?;
        debug!(path = %path.display(), channels = rows.len(), "saved relay DB");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(net: &str, chan: &str) -> (String, String) {
        (net.to_string(), chan.to_string())
    }

    #[test]
    fn test_create_link_resolve() {
        let mut db = RelayDb::new();
        assert!(db.create("overdrive", "#lounge", "gl!gl@home"));
        assert!(!db.create("overdrive", "#lounge", "gl!gl@home"), "no double create");

        db.link(&pair("overdrive", "#lounge"), "testnet", "#lounge")
            .unwrap();
        assert_eq!(
            db.get_relay(&pair("testnet", "#lounge")),
            Some(pair("overdrive", "#lounge"))
        );
        assert_eq!(
            db.get_relay(&pair("overdrive", "#lounge")),
            Some(pair("overdrive", "#lounge"))
        );
        assert_eq!(db.get_relay(&pair("elsewhere", "#lounge")), None);
    }

    #[test]
    fn test_link_refuses_nesting_and_blocks() {
        let mut db = RelayDb::new();
        db.create("a", "#x", "op!o@host");
        db.create("b", "#y", "op!o@host");
        db.link(&pair("a", "#x"), "c", "#x").unwrap();
        // Already linked elsewhere.
        assert!(db.link(&pair("b", "#y"), "c", "#x").is_err());
        // Blocked network.
        db.get_mut(&pair("b", "#y"))
            .unwrap()
            .blocked_nets
            .insert("evil".to_string());
        assert!(db.link(&pair("b", "#y"), "evil", "#y").is_err());
    }

    #[test]
    fn test_delink_and_destroy() {
        let mut db = RelayDb::new();
        db.create("a", "#x", "op!o@host");
        db.link(&pair("a", "#x"), "b", "#x").unwrap();
        assert_eq!(db.delink(&pair("b", "#x")), Some(pair("a", "#x")));
        assert_eq!(db.get_relay(&pair("b", "#x")), None);
        assert!(db.destroy(&pair("a", "#x")).is_some());
        assert_eq!(db.get_relay(&pair("a", "#x")), None);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relaydb.json");

        let mut db = RelayDb::new();
        db.create("overdrive", "#lounge", "gl!gl@home");
        db.link(&pair("overdrive", "#lounge"), "testnet", "#tl").unwrap();
        db.get_mut(&pair("overdrive", "#lounge"))
            .unwrap()
            .claim
            .insert("overdrive".to_string());
        db.save(&path).unwrap();

        let reloaded = RelayDb::load(&path);
        let entry = reloaded.get(&pair("overdrive", "#lounge")).unwrap();
        assert!(entry.links.contains(&pair("testnet", "#tl")));
        assert!(entry.claim.contains("overdrive"));
        assert_eq!(entry.creator, "gl!gl@home");
    }

    #[test]
    fn test_missing_file_starts_empty() {
        let db = RelayDb::load(Path::new("/nonexistent/relaydb.json"));
        assert_eq!(db.iter().count(), 0);
    }

    #[test]
    fn test_purge_network() {
        let mut db = RelayDb::new();
        db.create("a", "#x", "c");
        db.create("b", "#y", "c");
        db.link(&pair("b", "#y"), "a", "#y").unwrap();
        assert_eq!(db.purge_network("a"), 2);
        assert!(db.get(&pair("a", "#x")).is_none());
        assert!(db.get(&pair("b", "#y")).unwrap().links.is_empty());
    }
}
