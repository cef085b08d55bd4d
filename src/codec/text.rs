//! Extension text: GBK bytes XOR'd with the extension key.
//!
//! The extension key is only partly known for most codes. Bytes past the
//! known prefix are XOR'd with the filler byte, and text is only read or
//! written over the known prefix.

use encoding_rs::GBK;

use crate::error::CodecError;
use crate::schedule::FILLER_KEY_BYTE;

/// Shortest extension a crafted frame carries.
pub const MIN_EXTENSION_LEN: usize = 6;

/// GBK-encode `text`, refusing characters GBK cannot represent.
pub fn encode_gbk(text: &str) -> Result<Vec<u8>, CodecError> {
    let (bytes, _, had_errors) = GBK.encode(text);
    if had_errors {
        return Err(CodecError::TextEncoding(format!("{text:?} is not representable in GBK")));
    }
    Ok(bytes.into_owned())
}

/// Extension encryption. Static methods, like [`FieldCodec`](super::FieldCodec).
pub struct ExtensionCodec;

impl ExtensionCodec {
    /// XOR `extension` with `key`, falling back to the filler byte past the
    /// key's end. Self-inverse.
    pub fn apply(extension: &[u8], key: &[u8]) -> Vec<u8> {
        extension
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ key.get(i).copied().unwrap_or(FILLER_KEY_BYTE))
            .collect()
    }

    /// Decrypt the text carried by an extension.
    ///
    /// Only the known key prefix is read. The text stops at the first NUL.
    /// `None` when nothing is known, the text is empty, or the bytes are
    /// not clean GBK.
    pub fn decode_text(extension: &[u8], key: &[u8]) -> Option<String> {
        let covered = extension.len().min(key.len());
        let plain = Self::apply(&extension[..covered], key);
        let end = plain.iter().position(|&b| b == 0).unwrap_or(plain.len());
        if end == 0 {
            return None;
        }
        let text = GBK.decode_without_bom_handling_and_without_replacement(&plain[..end])?;
        if text.chars().any(char::is_control) {
            return None;
        }
        Some(text.into_owned())
    }

    /// Encrypt `text` into a fresh extension.
    ///
    /// The plaintext is zero-padded to [`MIN_EXTENSION_LEN`]. Without text
    /// the extension is all padding.
    pub fn encode_text(text: Option<&str>, key: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut plain = match text {
            Some(text) => encode_gbk(text)?,
            None => Vec::new(),
        };
        if plain.len() > key.len() {
            return Err(CodecError::TextTooLong {
                len: plain.len(),
                known: key.len(),
            });
        }
        if plain.len() < MIN_EXTENSION_LEN {
            plain.resize(MIN_EXTENSION_LEN, 0);
        }
        Ok(Self::apply(&plain, key))
    }
}
