//! Codec module - field-level view of the 16-byte core body.
//!
//! - [`FieldCodec`] - byte-wise XOR with a derived key, then fixed-offset
//!   little-endian fields
//! - [`DecodedPacket`] - the six typed parameters of a decrypted body
//! - [`Field`] - names one parameter for reads and edits
//! - [`ExtensionCodec`] - GBK text carried in the extension bytes
//! - [`Plaintext`] - the `发送封包（…）` command line form of a packet
//!
//! # Design
//!
//! Like the frame layer, the codec is a marker struct with static methods.
//! Both directions are total over `[u8; 16]`; only [`FieldCodec::decode_slice`]
//! can fail, when handed a body of the wrong length.
//!
//! # Example
//!
//! ```
//! use mirwire::codec::{DecodedPacket, Field, FieldCodec};
//!
//! let key = [0x3C; 16];
//! let packet = DecodedPacket::default().with_field(Field::FunctionCode, 0x0BC5).unwrap();
//!
//! let body = FieldCodec::encode(&packet, &key);
//! assert_eq!(FieldCodec::decode(&body, &key), packet);
//! ```

mod field;
mod plaintext;
mod text;

pub use field::{xor_in_place, DecodedPacket, Field, FieldCodec};
pub use plaintext::{Plaintext, PLAINTEXT_PREFIX};
pub use text::{encode_gbk, ExtensionCodec, MIN_EXTENSION_LEN};
