//! XOR field codec for the core body.
//!
//! Decrypted layout (little-endian):
//!
//! ```text
//! ┌─────────┬─────────┬───────────────┬────────┬────────┬────────┐
//! │ param1  │ param2  │ function code │ param3 │ param4 │ param5 │
//! │ 0..4    │ 4..8    │ 8..10         │ 10..12 │ 12..14 │ 14..16 │
//! └─────────┴─────────┴───────────────┴────────┴────────┴────────┘
//! ```

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::protocol::BODY_SIZE;

/// One typed parameter of the decrypted body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    /// 32-bit at offset 0.
    Param1,
    /// 32-bit at offset 4.
    Param2,
    /// 16-bit at offset 8.
    FunctionCode,
    /// 16-bit at offset 10.
    Param3,
    /// 16-bit at offset 12.
    Param4,
    /// 16-bit at offset 14.
    Param5,
}

impl Field {
    /// All fields in body order.
    pub const ALL: [Field; 6] = [
        Field::Param1,
        Field::Param2,
        Field::FunctionCode,
        Field::Param3,
        Field::Param4,
        Field::Param5,
    ];

    /// Byte range within the body.
    pub fn range(self) -> Range<usize> {
        match self {
            Field::Param1 => 0..4,
            Field::Param2 => 4..8,
            Field::FunctionCode => 8..10,
            Field::Param3 => 10..12,
            Field::Param4 => 12..14,
            Field::Param5 => 14..16,
        }
    }

    /// Largest value the field holds.
    pub fn max(self) -> u64 {
        match self {
            Field::Param1 | Field::Param2 => u32::MAX as u64,
            _ => u16::MAX as u64,
        }
    }

    /// Lower-case field name.
    pub fn name(self) -> &'static str {
        match self {
            Field::Param1 => "param1",
            Field::Param2 => "param2",
            Field::FunctionCode => "function_code",
            Field::Param3 => "param3",
            Field::Param4 => "param4",
            Field::Param5 => "param5",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The six parameters of a decrypted core body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DecodedPacket {
    pub param1: u32,
    pub param2: u32,
    pub function_code: u16,
    pub param3: u16,
    pub param4: u16,
    pub param5: u16,
}

impl DecodedPacket {
    /// Read the fields out of a plaintext body.
    pub fn from_plain(plain: &[u8; BODY_SIZE]) -> Self {
        let u32_at = |at: usize| u32::from_le_bytes([plain[at], plain[at + 1], plain[at + 2], plain[at + 3]]);
        let u16_at = |at: usize| u16::from_le_bytes([plain[at], plain[at + 1]]);
        Self {
            param1: u32_at(0),
            param2: u32_at(4),
            function_code: u16_at(8),
            param3: u16_at(10),
            param4: u16_at(12),
            param5: u16_at(14),
        }
    }

    /// Lay the fields out as a plaintext body.
    pub fn to_plain(&self) -> [u8; BODY_SIZE] {
        let mut plain = [0u8; BODY_SIZE];
        plain[0..4].copy_from_slice(&self.param1.to_le_bytes());
        plain[4..8].copy_from_slice(&self.param2.to_le_bytes());
        plain[8..10].copy_from_slice(&self.function_code.to_le_bytes());
        plain[10..12].copy_from_slice(&self.param3.to_le_bytes());
        plain[12..14].copy_from_slice(&self.param4.to_le_bytes());
        plain[14..16].copy_from_slice(&self.param5.to_le_bytes());
        plain
    }

    /// Value of one field, widened to u32.
    pub fn get(&self, field: Field) -> u32 {
        match field {
            Field::Param1 => self.param1,
            Field::Param2 => self.param2,
            Field::FunctionCode => self.function_code as u32,
            Field::Param3 => self.param3 as u32,
            Field::Param4 => self.param4 as u32,
            Field::Param5 => self.param5 as u32,
        }
    }

    /// Copy with one field replaced. Rejects values wider than the field.
    pub fn with_field(mut self, field: Field, value: u32) -> Result<Self, CodecError> {
        if value as u64 > field.max() {
            return Err(CodecError::FieldRange {
                field,
                value: value as u64,
                max: field.max(),
            });
        }
        match field {
            Field::Param1 => self.param1 = value,
            Field::Param2 => self.param2 = value,
            Field::FunctionCode => self.function_code = value as u16,
            Field::Param3 => self.param3 = value as u16,
            Field::Param4 => self.param4 = value as u16,
            Field::Param5 => self.param5 = value as u16,
        }
        Ok(self)
    }

    /// Bytes 10..14 read as one 32-bit value.
    ///
    /// Item messages carry a 32-bit identifier across param3 and param4.
    pub fn wide_param3(&self) -> u32 {
        (self.param3 as u32) | ((self.param4 as u32) << 16)
    }

    /// Fields that differ from `other`.
    pub fn diff(&self, other: &DecodedPacket) -> Vec<Field> {
        Field::ALL
            .into_iter()
            .filter(|&f| self.get(f) != other.get(f))
            .collect()
    }
}

/// XOR `key` into `buf`, byte for byte.
#[inline]
pub fn xor_in_place(buf: &mut [u8; BODY_SIZE], key: &[u8; BODY_SIZE]) {
    for (b, k) in buf.iter_mut().zip(key) {
        *b ^= k;
    }
}

/// Stateless XOR field codec.
pub struct FieldCodec;

impl FieldCodec {
    /// Decrypt a body and read its fields.
    #[inline]
    pub fn decode(body: &[u8; BODY_SIZE], key: &[u8; BODY_SIZE]) -> DecodedPacket {
        DecodedPacket::from_plain(&Self::apply(body, key))
    }

    /// Write the fields and encrypt.
    #[inline]
    pub fn encode(packet: &DecodedPacket, key: &[u8; BODY_SIZE]) -> [u8; BODY_SIZE] {
        Self::apply(&packet.to_plain(), key)
    }

    /// Like [`FieldCodec::decode`] for a body of unchecked length.
    pub fn decode_slice(body: &[u8], key: &[u8; BODY_SIZE]) -> Result<DecodedPacket, CodecError> {
        let body: &[u8; BODY_SIZE] = body.try_into().map_err(|_| CodecError::BodyLength {
            expected: BODY_SIZE,
            actual: body.len(),
        })?;
        Ok(Self::decode(body, key))
    }

    /// XOR a whole body. Self-inverse.
    #[inline]
    pub fn apply(body: &[u8; BODY_SIZE], key: &[u8; BODY_SIZE]) -> [u8; BODY_SIZE] {
        let mut out = *body;
        xor_in_place(&mut out, key);
        out
    }
}
