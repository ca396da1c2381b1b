//! Line framing for IRC links.
//!
//! Splits on `\n`, strips a trailing `\r`, and decodes as UTF-8 with
//! replacement so one bad byte cannot take down the stream.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Longest line we will buffer before declaring the peer broken.
const MAX_LINE: usize = 16384;

#[derive(Debug, Default)]
pub struct LineCodec;

impl Decoder for LineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        let Some(pos) = src.iter().position(|b| *b == b'\n') else {
            if src.len() > MAX_LINE {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "line too long",
                ));
            }
            return Ok(None);
        };
        let mut line = src.split_to(pos + 1);
        line.truncate(pos);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }
}

impl Encoder<String> for LineCodec {
    type Error = std::io::Error;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(line.len() + 2);
        dst.put_slice(line.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

impl LineCodec {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> Vec<String> {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(line) = codec.decode(&mut buf).unwrap() {
            out.push(line);
        }
        out
    }

    #[test]
    fn test_crlf_and_bare_lf() {
        assert_eq!(
            decode_all(b"PING :one\r\nPING :two\npartial"),
            vec!["PING :one", "PING :two"]
        );
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let lines = decode_all(b"PRIVMSG #x :caf\xe9 latte\r\n");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains('\u{FFFD}'));
        assert!(lines[0].starts_with("PRIVMSG #x :caf"));
    }

    #[test]
    fn test_empty_line() {
        assert_eq!(decode_all(b"\r\nPING :x\r\n"), vec!["", "PING :x"]);
    }

    #[test]
    fn test_encoder_appends_crlf() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        codec.encode("QUIT :bye".to_string(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"QUIT :bye\r\n");
    }
}
