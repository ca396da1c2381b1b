//! IRC casemapping.
//!
//! Networks advertise either `rfc1459` (where `[]\~` are the uppercase
//! forms of `{}|^`) or plain `ascii` mapping. Channel keys and nick
//! comparisons must go through the owning network's mapping.

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Casemapping {
    #[default]
    Rfc1459,
    Ascii,
}

impl Casemapping {
    /// Lowercase a string under this mapping.
    pub fn to_lower(self, s: &str) -> String {
        s.chars()
            .map(|c| match (self, c) {
                (Casemapping::Rfc1459, '[') => '{',
                (Casemapping::Rfc1459, ']') => '}',
                (Casemapping::Rfc1459, '\\') => '|',
                (Casemapping::Rfc1459, '~') => '^',
                (_, c) => c.to_ascii_lowercase(),
            })
            .collect()
    }

    /// Case-insensitive equality under this mapping.
    pub fn eq(self, a: &str, b: &str) -> bool {
        self.to_lower(a) == self.to_lower(b)
    }

    pub fn parse(name: &str) -> Option<Casemapping> {
        match name.to_ascii_lowercase().as_str() {
            "rfc1459" => Some(Casemapping::Rfc1459),
            "ascii" => Some(Casemapping::Ascii),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc1459_brackets_fold() {
        assert_eq!(Casemapping::Rfc1459.to_lower("GL[away]"), "gl{away}");
        assert!(Casemapping::Rfc1459.eq("nick\\one", "NICK|ONE"));
    }

    #[test]
    fn test_ascii_leaves_brackets() {
        assert_eq!(Casemapping::Ascii.to_lower("GL[away]"), "gl[away]");
        assert!(!Casemapping::Ascii.eq("a[b", "a{b"));
    }

    #[test]
    fn test_channel_key_stability() {
        // Lookups with any case variant must map to the same entry.
        let cm = Casemapping::Rfc1459;
        assert_eq!(cm.to_lower("#Chan~Test"), cm.to_lower("#chan^test"));
    }
}
