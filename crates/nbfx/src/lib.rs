//! Compact binary codec for an XML-like document model.
//!
//! A [`BinaryDecoder`] turns a record byte stream into a sequence of
//! structured document events (elements, attributes, text, comments); a
//! [`BinaryEncoder`] performs the inverse. The wire format is the .NET
//! Binary Format: XML ([MC-NBFX]) record stream, so documents interchange
//! 1:1 with textual XML and with existing producers of that format.
//!
//! Decoded payloads stay as raw bytes inside the [`ByteSource`] until a
//! caller materializes them through the node's [`ValueSlot`]; streamed
//! input is consumed through a bounded window so a document can be decoded
//! from a live connection without buffering the whole message.

pub mod constants;

mod decoder;
mod dictionary;
mod encoder;
mod error;
mod node;
mod source;
mod types;
mod value;

pub use decoder::BinaryDecoder;
pub use dictionary::{Dictionaries, StringTable, SESSION_KEY_BIT};
pub use encoder::{ArrayValues, BinaryEncoder};
pub use error::NbfxError;
pub use node::{Attribute, NameRef, Node, NodeKind};
pub use source::{ByteRange, ByteSource};
pub use types::{DateTime, DateTimeKind, Decimal, Guid, TimeSpan, UniqueId};
pub use value::{ConstantId, TextEncoding, ValueSlot};
