//! Human-readable command line for a packet.
//!
//! ```text
//! 发送封包（param1，param2，function code，param3，param4，param5[，text]，）
//! ```
//!
//! Numbers are decimal and separated by full-width commas. Parsing is more
//! forgiving than printing: ASCII parentheses are accepted, missing trailing
//! parameters default to zero, and the text may itself contain commas.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::field::DecodedPacket;
use crate::error::CodecError;

/// Leading word of every command line.
pub const PLAINTEXT_PREFIX: &str = "发送封包";

const SEPARATOR: char = '，';

/// A packet plus its extension text, as one command line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Plaintext {
    pub packet: DecodedPacket,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Plaintext {
    pub fn new(packet: DecodedPacket, text: Option<String>) -> Self {
        Self { packet, text }
    }
}

impl fmt::Display for Plaintext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = &self.packet;
        write!(
            f,
            "{PLAINTEXT_PREFIX}（{}，{}，{}，{}，{}，{}，",
            p.param1, p.param2, p.function_code, p.param3, p.param4, p.param5
        )?;
        if let Some(text) = &self.text {
            write!(f, "{text}，")?;
        }
        f.write_str("）")
    }
}

fn bad(reason: impl Into<String>) -> CodecError {
    CodecError::Plaintext(reason.into())
}

fn number<T: FromStr>(parts: &[&str], index: usize, name: &str) -> Result<T, CodecError>
where
    T: Default,
    T::Err: fmt::Display,
{
    match parts.get(index) {
        Some(part) => part.parse().map_err(|e| bad(format!("{name} {part:?}: {e}"))),
        None => Ok(T::default()),
    }
}

impl FromStr for Plaintext {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, CodecError> {
        let inner = s
            .trim()
            .strip_prefix(PLAINTEXT_PREFIX)
            .ok_or_else(|| bad(format!("missing {PLAINTEXT_PREFIX} prefix")))?
            .trim_start();
        let inner = inner
            .strip_prefix('（')
            .or_else(|| inner.strip_prefix('('))
            .ok_or_else(|| bad("missing opening parenthesis"))?
            .trim_end();
        let inner = inner
            .strip_suffix('）')
            .or_else(|| inner.strip_suffix(')'))
            .ok_or_else(|| bad("missing closing parenthesis"))?;

        let mut parts: Vec<&str> = inner.split(SEPARATOR).map(str::trim).collect();
        if parts.last().is_some_and(|last| last.is_empty()) {
            parts.pop();
        }
        if parts.len() < 3 {
            return Err(bad(format!("need at least 3 values, found {}", parts.len())));
        }

        let packet = DecodedPacket {
            param1: number(&parts, 0, "param1")?,
            param2: number(&parts, 1, "param2")?,
            function_code: number(&parts, 2, "function code")?,
            param3: number(&parts, 3, "param3")?,
            param4: number(&parts, 4, "param4")?,
            param5: number(&parts, 5, "param5")?,
        };
        let text = parts
            .get(6..)
            .map(|rest| rest.join("，"))
            .filter(|text| !text.is_empty());

        Ok(Self { packet, text })
    }
}

impl fmt::Display for DecodedPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Plaintext::new(*self, None), f)
    }
}

impl FromStr for DecodedPacket {
    type Err = CodecError;

    /// Parse a command line without text. Lines with text need [`Plaintext`].
    fn from_str(s: &str) -> Result<Self, CodecError> {
        let plaintext: Plaintext = s.parse()?;
        match plaintext.text {
            None => Ok(plaintext.packet),
            Some(text) => Err(bad(format!("line carries text {text:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy_move() -> DecodedPacket {
        DecodedPacket {
            function_code: 3011,
            param3: 103,
            param4: 3,
            param5: 86,
            ..Default::default()
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(legacy_move().to_string(), "发送封包（0，0，3011，103，3，86，）");

        let line = Plaintext::new(
            DecodedPacket {
                param1: 0x0145_5F69,
                function_code: 1006,
                ..Default::default()
            },
            Some("修复神水".to_string()),
        );
        assert_eq!(line.to_string(), "发送封包（21323625，0，1006，0，0，0，修复神水，）");
    }

    #[test]
    fn test_parse_printed_line() {
        let line: Plaintext = "发送封包（0，0，3011，103，3，86，）".parse().unwrap();
        assert_eq!(line, Plaintext::new(legacy_move(), None));
    }

    #[test]
    fn test_parse_is_forgiving() {
        let packet: DecodedPacket = "  发送封包 (0， 0， 3011， 103， 3， 86)".parse().unwrap();
        assert_eq!(packet, legacy_move());

        let short: DecodedPacket = "发送封包（7，0，1010）".parse().unwrap();
        assert_eq!(
            short,
            DecodedPacket {
                param1: 7,
                function_code: 1010,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_text_keeps_commas_and_parentheses() {
        let text = "@加入骑士团1(0,58,初阶)，二";
        let line = Plaintext::new(
            DecodedPacket {
                function_code: 1011,
                ..Default::default()
            },
            Some(text.to_string()),
        );
        let parsed: Plaintext = line.to_string().parse().unwrap();
        assert_eq!(parsed, line);
    }

    #[test]
    fn test_parse_errors() {
        for line in [
            "封包（0，0，3011）",
            "发送封包 0，0，3011",
            "发送封包（0，0，3011",
            "发送封包（0，0）",
            "发送封包（0，0，70000）",
            "发送封包（x，0，3011）",
        ] {
            let err = line.parse::<Plaintext>().unwrap_err();
            assert!(matches!(err, CodecError::Plaintext(_)), "{line}: {err:?}");
        }

        let err = "发送封包（0，0，1006，0，0，0，回城石，）".parse::<DecodedPacket>().unwrap_err();
        assert!(matches!(err, CodecError::Plaintext(_)));
    }
}
