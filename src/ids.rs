//! UID and SID generation.
//!
//! Every ID is a deterministic counter rendered as a fixed-width string over
//! a protocol-specific alphabet. IDs are never reused within a process
//! lifetime; exhaustion is a fatal error.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::ProtocolError;

const TS6_UID_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const P10_B64_CHARS: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789[]";

/// Generates unique user IDs in TS6 format.
///
/// Format: SID (3 chars) + 6-char base36 body = 9 chars total.
/// Example: "001AAAAAB"
pub struct Ts6UidGenerator {
    sid: String,
    counter: AtomicU64,
}

impl Ts6UidGenerator {
    pub fn new(sid: impl Into<String>) -> Self {
        Self {
            sid: sid.into(),
            counter: AtomicU64::new(0),
        }
    }

    /// Generate the next unique UID.
    pub fn next_uid(&self) -> Result<String, ProtocolError> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let body = encode_fixed(n, 6, TS6_UID_CHARS)?;
        Ok(format!("{}{}", self.sid, body))
    }
}

/// Generates unique user IDs in P10 format.
///
/// Format: SID (2 chars) + 3-char base64 body = 5 chars total.
pub struct P10UidGenerator {
    sid: String,
    counter: AtomicU64,
}

impl P10UidGenerator {
    pub fn new(sid: impl Into<String>) -> Self {
        Self {
            sid: sid.into(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_uid(&self) -> Result<String, ProtocolError> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let body = encode_fixed(n, 3, P10_B64_CHARS)?;
        Ok(format!("{}{}", self.sid, body))
    }
}

/// Generates pseudo-IDs for protocols without a real UID space (Clientbot,
/// ngIRCd). The IDs embed the nick so logs stay readable: "PUID-3@somenick".
pub struct PseudoIdGenerator {
    tag: &'static str,
    counter: AtomicU64,
}

impl PseudoIdGenerator {
    pub fn new(tag: &'static str) -> Self {
        Self {
            tag,
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self, name: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}@{}", self.tag, n, name)
    }
}

/// Encode `n` as a fixed-width string over `alphabet`, most significant
/// position first. Fails with `IdsExhausted` once the space wraps.
fn encode_fixed(mut n: u64, width: usize, alphabet: &[u8]) -> Result<String, ProtocolError> {
    let base = alphabet.len() as u64;
    let mut out = vec![alphabet[0]; width];
    for slot in out.iter_mut().rev() {
        *slot = alphabet[(n % base) as usize];
        n /= base;
    }
    if n > 0 {
        return Err(ProtocolError::IdsExhausted);
    }
    Ok(String::from_utf8(out).expect("alphabets are ASCII"))
}

/// Encodes a number as a P10 base64 numeric of the given length.
///
/// Used both for SIDs (2 chars) and for the 16-bit chunks of encoded IPv6
/// addresses (3 chars).
pub fn p10_b64encode(n: u32, length: usize) -> String {
    let mut out = vec![b'A'; length];
    let mut n = n;
    for slot in out.iter_mut().rev() {
        *slot = P10_B64_CHARS[(n % 64) as usize];
        n /= 64;
    }
    String::from_utf8(out).expect("alphabet is ASCII")
}

/// Decodes a P10 base64 numeric back into an integer.
pub fn p10_b64decode(s: &str) -> Option<u64> {
    let mut n: u64 = 0;
    for b in s.bytes() {
        let v = P10_B64_CHARS.iter().position(|&c| c == b)? as u64;
        n = n.checked_mul(64)?.checked_add(v)?;
    }
    Some(n)
}

/// SID generator for TS6-style protocols.
///
/// Takes a template like `"1#A"`, where `#` marks wildcard positions to
/// iterate: digits in the first position (TS6 SIDs must start with a digit),
/// digits and uppercase letters elsewhere. Positions advance rightmost-first
/// with carry.
pub struct Ts6SidGenerator {
    template: Vec<u8>,
    /// Indexes into `template` that are wildcards, leftmost first.
    wildcards: Vec<usize>,
    state: Mutex<SidState>,
}

struct SidState {
    /// Current character index per wildcard position.
    indexes: Vec<usize>,
    exhausted: bool,
}

impl Ts6SidGenerator {
    pub fn new(template: &str) -> Result<Self, ProtocolError> {
        let template: Vec<u8> = template.bytes().collect();
        if template.len() != 3 {
            return Err(ProtocolError::MalformedHandshake(format!(
                "invalid sidrange template (need 3 chars): {:?}",
                String::from_utf8_lossy(&template)
            )));
        }
        let wildcards: Vec<usize> = template
            .iter()
            .enumerate()
            .filter(|&(_, &b)| b == b'#')
            .map(|(i, _)| i)
            .collect();
        let indexes = vec![0; wildcards.len()];
        Ok(Self {
            template,
            wildcards,
            state: Mutex::new(SidState {
                indexes,
                exhausted: false,
            }),
        })
    }

    fn alphabet_for(pos: usize) -> &'static [u8] {
        if pos == 0 {
            b"0123456789"
        } else {
            b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ"
        }
    }

    pub fn next_sid(&self) -> Result<String, ProtocolError> {
        let mut state = self.state.lock();
        if state.exhausted {
            return Err(ProtocolError::IdsExhausted);
        }
        let mut sid = self.template.clone();
        for (w, &pos) in self.wildcards.iter().enumerate() {
            sid[pos] = Self::alphabet_for(pos)[state.indexes[w]];
        }

        // Advance rightmost-first with carry; mark exhaustion on full wrap.
        let mut carry = true;
        for (w, &pos) in self.wildcards.iter().enumerate().rev() {
            if !carry {
                break;
            }
            let alpha = Self::alphabet_for(pos);
            state.indexes[w] += 1;
            if state.indexes[w] >= alpha.len() {
                state.indexes[w] = 0;
            } else {
                carry = false;
            }
        }
        if carry {
            state.exhausted = true;
        }

        Ok(String::from_utf8(sid).expect("template and alphabets are ASCII"))
    }
}

/// SID generator for P10: a numeric `MIN-MAX` range rendered as 2-char
/// base64 numerics.
pub struct P10SidGenerator {
    max: u32,
    current: AtomicU64,
}

impl P10SidGenerator {
    pub fn new(range: &str) -> Result<Self, ProtocolError> {
        let (min, max) = range
            .split_once('-')
            .and_then(|(a, b)| Some((a.trim().parse::<u32>().ok()?, b.trim().parse::<u32>().ok()?)))
            .ok_or_else(|| {
                ProtocolError::MalformedHandshake(format!("invalid sidrange: {range:?}"))
            })?;
        Ok(Self {
            max,
            current: AtomicU64::new(min as u64),
        })
    }

    pub fn next_sid(&self) -> Result<String, ProtocolError> {
        let n = self.current.fetch_add(1, Ordering::Relaxed);
        if n > self.max as u64 {
            return Err(ProtocolError::IdsExhausted);
        }
        Ok(p10_b64encode(n as u32, 2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ts6_uid_generation() {
        let generator = Ts6UidGenerator::new("001");
        assert_eq!(generator.next_uid().unwrap(), "001AAAAAA");
        assert_eq!(generator.next_uid().unwrap(), "001AAAAAB");
        assert_eq!(generator.next_uid().unwrap(), "001AAAAAC");
    }

    #[test]
    fn test_ts6_uid_carry() {
        let generator = Ts6UidGenerator::new("42X");
        for _ in 0..36 {
            generator.next_uid().unwrap();
        }
        assert_eq!(generator.next_uid().unwrap(), "42XAAAABA");
    }

    #[test]
    fn test_ts6_uid_exhaustion() {
        let generator = Ts6UidGenerator::new("001");
        generator.counter.store(36u64.pow(6), Ordering::Relaxed);
        assert!(matches!(
            generator.next_uid(),
            Err(ProtocolError::IdsExhausted)
        ));
    }

    #[test]
    fn test_p10_uid_generation() {
        let generator = P10UidGenerator::new("AB");
        assert_eq!(generator.next_uid().unwrap(), "ABAAA");
        assert_eq!(generator.next_uid().unwrap(), "ABAAB");
    }

    #[test]
    fn test_p10_b64_roundtrip() {
        assert_eq!(p10_b64encode(0, 2), "AA");
        assert_eq!(p10_b64encode(63, 2), "A]");
        assert_eq!(p10_b64decode("A]"), Some(63));
        assert_eq!(p10_b64decode(&p10_b64encode(4095, 2)), Some(4095));
    }

    #[test]
    fn test_sid_template() {
        let generator = Ts6SidGenerator::new("1#A").unwrap();
        assert_eq!(generator.next_sid().unwrap(), "10A");
        assert_eq!(generator.next_sid().unwrap(), "11A");
    }

    #[test]
    fn test_sid_template_exhaustion() {
        let generator = Ts6SidGenerator::new("9#9").unwrap();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..36 {
            assert!(seen.insert(generator.next_sid().unwrap()));
        }
        assert!(matches!(
            generator.next_sid(),
            Err(ProtocolError::IdsExhausted)
        ));
    }

    #[test]
    fn test_p10_sid_range() {
        let generator = P10SidGenerator::new("0-2").unwrap();
        assert_eq!(generator.next_sid().unwrap(), "AA");
        assert_eq!(generator.next_sid().unwrap(), "AB");
        assert_eq!(generator.next_sid().unwrap(), "AC");
        assert!(matches!(
            generator.next_sid(),
            Err(ProtocolError::IdsExhausted)
        ));
    }

    #[test]
    fn test_pseudo_ids_stay_unique_per_nick() {
        let generator = PseudoIdGenerator::new("PUID");
        let a = generator.next_id("gl");
        let b = generator.next_id("gl");
        assert_ne!(a, b);
        assert!(a.ends_with("@gl"));
    }
}
