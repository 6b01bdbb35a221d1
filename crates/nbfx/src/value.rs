//! Deferred value representation.
//!
//! A decoded node's payload stays in the [`ByteSource`] as raw bytes until a
//! caller asks for a concrete type. [`ValueSlot`] records which variant is
//! active and how to interpret it; materialization is pure and repeatable
//! except for the chunked readers, which consume from the front of the
//! remaining range.

use std::borrow::Cow;
use std::num::IntErrorKind;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use nbfx_buffers::{bytes_equal, compare_bytes};

use crate::error::NbfxError;
use crate::source::{ByteRange, ByteSource};
use crate::types::{DateTime, Decimal, Guid, TimeSpan, UniqueId};

/// Encoding of a raw text range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    /// UTF-16 little-endian code units.
    Utf16,
    /// UTF-8 with XML entity/character references still escaped.
    Utf8Escaped,
}

/// The fixed constant-string values with one-byte records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstantId {
    Zero,
    One,
    True,
    False,
}

impl ConstantId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConstantId::Zero => "0",
            ConstantId::One => "1",
            ConstantId::True => "true",
            ConstantId::False => "false",
        }
    }
}

/// A decoded node's payload. Exactly one variant is active at a time; the
/// semantic content is valid only until the decoder's next read step
/// overwrites the slot or moves the window past its ranges.
#[derive(Debug, Clone, Default)]
pub enum ValueSlot {
    #[default]
    Empty,
    /// Text bytes held in the source.
    Raw {
        range: ByteRange,
        encoding: TextEncoding,
    },
    /// Binary bytes held in the source, presented as base64 text.
    Binary { range: ByteRange },
    /// A dictionary string reference.
    Dictionary { key: u32 },
    Constant(ConstantId),
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    Decimal(Decimal),
    DateTime(DateTime),
    TimeSpan(TimeSpan),
    Guid(Guid),
    UniqueId(UniqueId),
    Char(char),
    /// A qualified name: one-letter prefix index plus a dictionary key.
    QName { prefix: u8, key: u32 },
    /// A list of sub-values.
    List(Vec<ValueSlot>),
}

impl ValueSlot {
    pub fn set_empty(&mut self) {
        *self = ValueSlot::Empty;
    }

    pub fn set_raw(&mut self, range: ByteRange, encoding: TextEncoding) {
        *self = ValueSlot::Raw { range, encoding };
    }

    pub fn set_binary(&mut self, range: ByteRange) {
        *self = ValueSlot::Binary { range };
    }

    pub fn set_dictionary(&mut self, key: u32) {
        *self = ValueSlot::Dictionary { key };
    }

    pub fn set_constant(&mut self, id: ConstantId) {
        *self = ValueSlot::Constant(id);
    }

    pub fn set_list(&mut self, items: Vec<ValueSlot>) {
        *self = ValueSlot::List(items);
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ValueSlot::Empty)
    }

    // ------------------------------------------------------------ text

    /// Materializes the value as text. Succeeds for every variant.
    pub fn to_text<'s>(&'s self, src: &'s ByteSource) -> Result<Cow<'s, str>, NbfxError> {
        match self {
            ValueSlot::Empty => Ok(Cow::Borrowed("")),
            ValueSlot::Raw { range, encoding } => {
                let bytes = src.bytes(*range)?;
                match encoding {
                    TextEncoding::Utf8 => std::str::from_utf8(bytes)
                        .map(Cow::Borrowed)
                        .map_err(|_| NbfxError::InvalidFormat),
                    TextEncoding::Utf16 => utf16_to_string(bytes).map(Cow::Owned),
                    TextEncoding::Utf8Escaped => {
                        let text = std::str::from_utf8(bytes)
                            .map_err(|_| NbfxError::InvalidFormat)?;
                        unescape(text)
                    }
                }
            }
            ValueSlot::Binary { range } => Ok(Cow::Owned(BASE64.encode(src.bytes(*range)?))),
            ValueSlot::Dictionary { key } => {
                src.resolve_dictionary_key(*key).map(Cow::Borrowed)
            }
            ValueSlot::Constant(id) => Ok(Cow::Borrowed(id.as_str())),
            ValueSlot::Bool(b) => Ok(Cow::Borrowed(if *b { "true" } else { "false" })),
            ValueSlot::Int8(v) => Ok(Cow::Owned(v.to_string())),
            ValueSlot::Int16(v) => Ok(Cow::Owned(v.to_string())),
            ValueSlot::Int32(v) => Ok(Cow::Owned(v.to_string())),
            ValueSlot::Int64(v) => Ok(Cow::Owned(v.to_string())),
            ValueSlot::UInt64(v) => Ok(Cow::Owned(v.to_string())),
            ValueSlot::Float(v) => Ok(Cow::Owned(format_float(*v as f64))),
            ValueSlot::Double(v) => Ok(Cow::Owned(format_float(*v))),
            ValueSlot::Decimal(v) => Ok(Cow::Owned(v.to_string())),
            ValueSlot::DateTime(v) => Ok(Cow::Owned(v.to_string())),
            ValueSlot::TimeSpan(v) => Ok(Cow::Owned(v.to_string())),
            ValueSlot::Guid(v) => Ok(Cow::Owned(v.to_string())),
            ValueSlot::UniqueId(v) => Ok(Cow::Owned(v.to_string())),
            ValueSlot::Char(c) => Ok(Cow::Owned(c.to_string())),
            ValueSlot::QName { prefix, key } => {
                let name = src.resolve_dictionary_key(*key)?;
                Ok(Cow::Owned(format!(
                    "{}:{}",
                    (b'a' + prefix) as char,
                    name
                )))
            }
            ValueSlot::List(items) => {
                let mut out = String::new();
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }
                    out.push_str(&item.to_text(src)?);
                }
                Ok(Cow::Owned(out))
            }
        }
    }

    // ------------------------------------------------------------ numbers

    /// Materializes as a signed 64-bit integer.
    pub fn to_int64(&self, src: &ByteSource) -> Result<i64, NbfxError> {
        match self {
            ValueSlot::Constant(ConstantId::Zero) => Ok(0),
            ValueSlot::Constant(ConstantId::One) => Ok(1),
            ValueSlot::Int8(v) => Ok(*v as i64),
            ValueSlot::Int16(v) => Ok(*v as i64),
            ValueSlot::Int32(v) => Ok(*v as i64),
            ValueSlot::Int64(v) => Ok(*v),
            ValueSlot::UInt64(v) => i64::try_from(*v).map_err(|_| NbfxError::Overflow),
            ValueSlot::Float(v) => float_to_int(*v as f64),
            ValueSlot::Double(v) => float_to_int(*v),
            ValueSlot::Decimal(v) => {
                let whole = v.integral_value().ok_or(NbfxError::TypeMismatch)?;
                i64::try_from(whole).map_err(|_| NbfxError::Overflow)
            }
            ValueSlot::Raw { .. } | ValueSlot::Dictionary { .. } => {
                parse_int(self.to_text(src)?.trim())
            }
            _ => Err(NbfxError::TypeMismatch),
        }
    }

    /// Materializes as a signed 32-bit integer; out-of-range is `Overflow`.
    pub fn to_int32(&self, src: &ByteSource) -> Result<i32, NbfxError> {
        i32::try_from(self.to_int64(src)?).map_err(|_| NbfxError::Overflow)
    }

    /// Materializes as an unsigned 64-bit integer.
    pub fn to_uint64(&self, src: &ByteSource) -> Result<u64, NbfxError> {
        match self {
            ValueSlot::UInt64(v) => Ok(*v),
            ValueSlot::Raw { .. } | ValueSlot::Dictionary { .. } => self
                .to_text(src)?
                .trim()
                .parse::<u64>()
                .map_err(|e| match e.kind() {
                    IntErrorKind::PosOverflow | IntErrorKind::NegOverflow => NbfxError::Overflow,
                    _ => NbfxError::TypeMismatch,
                }),
            _ => u64::try_from(self.to_int64(src)?).map_err(|_| NbfxError::Overflow),
        }
    }

    /// Materializes as a 64-bit float.
    pub fn to_double(&self, src: &ByteSource) -> Result<f64, NbfxError> {
        match self {
            ValueSlot::Constant(ConstantId::Zero) => Ok(0.0),
            ValueSlot::Constant(ConstantId::One) => Ok(1.0),
            ValueSlot::Int8(v) => Ok(*v as f64),
            ValueSlot::Int16(v) => Ok(*v as f64),
            ValueSlot::Int32(v) => Ok(*v as f64),
            ValueSlot::Int64(v) => Ok(*v as f64),
            ValueSlot::UInt64(v) => Ok(*v as f64),
            ValueSlot::Float(v) => Ok(*v as f64),
            ValueSlot::Double(v) => Ok(*v),
            ValueSlot::Raw { .. } | ValueSlot::Dictionary { .. } => {
                parse_float(self.to_text(src)?.trim())
            }
            _ => Err(NbfxError::TypeMismatch),
        }
    }

    /// Materializes as a 32-bit float; a double narrows only losslessly.
    pub fn to_float(&self, src: &ByteSource) -> Result<f32, NbfxError> {
        match self {
            ValueSlot::Float(v) => Ok(*v),
            _ => {
                let wide = self.to_double(src)?;
                let narrow = wide as f32;
                if narrow as f64 == wide || wide.is_nan() {
                    Ok(narrow)
                } else {
                    Err(NbfxError::Overflow)
                }
            }
        }
    }

    /// Materializes as a boolean.
    pub fn to_bool(&self, src: &ByteSource) -> Result<bool, NbfxError> {
        match self {
            ValueSlot::Bool(b) => Ok(*b),
            ValueSlot::Constant(ConstantId::True) | ValueSlot::Constant(ConstantId::One) => {
                Ok(true)
            }
            ValueSlot::Constant(ConstantId::False) | ValueSlot::Constant(ConstantId::Zero) => {
                Ok(false)
            }
            ValueSlot::Raw { .. } | ValueSlot::Dictionary { .. } => {
                match self.to_text(src)?.trim() {
                    "true" | "1" => Ok(true),
                    "false" | "0" => Ok(false),
                    _ => Err(NbfxError::TypeMismatch),
                }
            }
            _ => Err(NbfxError::TypeMismatch),
        }
    }

    // ------------------------------------------------------------ typed

    pub fn to_decimal(&self, src: &ByteSource) -> Result<Decimal, NbfxError> {
        match self {
            ValueSlot::Decimal(v) => Ok(*v),
            ValueSlot::Constant(ConstantId::Zero) => Ok(Decimal::from_i64(0)),
            ValueSlot::Constant(ConstantId::One) => Ok(Decimal::from_i64(1)),
            ValueSlot::Int8(_)
            | ValueSlot::Int16(_)
            | ValueSlot::Int32(_)
            | ValueSlot::Int64(_) => Ok(Decimal::from_i64(self.to_int64(src)?)),
            ValueSlot::Raw { .. } | ValueSlot::Dictionary { .. } => self
                .to_text(src)?
                .trim()
                .parse()
                .map_err(|_| NbfxError::TypeMismatch),
            _ => Err(NbfxError::TypeMismatch),
        }
    }

    pub fn to_datetime(&self, src: &ByteSource) -> Result<DateTime, NbfxError> {
        match self {
            ValueSlot::DateTime(v) => Ok(*v),
            ValueSlot::Raw { .. } | ValueSlot::Dictionary { .. } => self
                .to_text(src)?
                .trim()
                .parse()
                .map_err(|_| NbfxError::TypeMismatch),
            _ => Err(NbfxError::TypeMismatch),
        }
    }

    pub fn to_timespan(&self, src: &ByteSource) -> Result<TimeSpan, NbfxError> {
        match self {
            ValueSlot::TimeSpan(v) => Ok(*v),
            ValueSlot::Raw { .. } | ValueSlot::Dictionary { .. } => self
                .to_text(src)?
                .trim()
                .parse()
                .map_err(|_| NbfxError::TypeMismatch),
            _ => Err(NbfxError::TypeMismatch),
        }
    }

    pub fn to_guid(&self, src: &ByteSource) -> Result<Guid, NbfxError> {
        match self {
            ValueSlot::Guid(v) => Ok(*v),
            ValueSlot::UniqueId(v) => Ok(v.0),
            ValueSlot::Raw { .. } | ValueSlot::Dictionary { .. } => self
                .to_text(src)?
                .trim()
                .parse()
                .map_err(|_| NbfxError::TypeMismatch),
            _ => Err(NbfxError::TypeMismatch),
        }
    }

    pub fn to_unique_id(&self, src: &ByteSource) -> Result<UniqueId, NbfxError> {
        match self {
            ValueSlot::UniqueId(v) => Ok(*v),
            ValueSlot::Guid(v) => Ok(UniqueId(*v)),
            ValueSlot::Raw { .. } | ValueSlot::Dictionary { .. } => self
                .to_text(src)?
                .trim()
                .parse()
                .map_err(|_| NbfxError::TypeMismatch),
            _ => Err(NbfxError::TypeMismatch),
        }
    }

    /// Materializes binary content: raw bytes for a binary range, base64
    /// decoding for text variants.
    pub fn to_bytes(&self, src: &ByteSource) -> Result<Vec<u8>, NbfxError> {
        match self {
            ValueSlot::Empty => Ok(Vec::new()),
            ValueSlot::Binary { range } => Ok(src.bytes(*range)?.to_vec()),
            ValueSlot::Raw { .. } | ValueSlot::Dictionary { .. } => BASE64
                .decode(self.to_text(src)?.trim())
                .map_err(|_| NbfxError::TypeMismatch),
            _ => Err(NbfxError::TypeMismatch),
        }
    }

    /// The sub-values of a list.
    pub fn as_list(&self) -> Result<&[ValueSlot], NbfxError> {
        match self {
            ValueSlot::List(items) => Ok(items),
            _ => Err(NbfxError::TypeMismatch),
        }
    }

    /// Materializes as a `(prefix, local name)` qualified-name pair.
    pub fn to_qname(&self, src: &ByteSource) -> Result<(String, String), NbfxError> {
        match self {
            ValueSlot::QName { prefix, key } => {
                let name = src.resolve_dictionary_key(*key)?;
                Ok((((b'a' + prefix) as char).to_string(), name.to_string()))
            }
            ValueSlot::Raw { .. } | ValueSlot::Dictionary { .. } => {
                let text = self.to_text(src)?;
                match text.split_once(':') {
                    Some((prefix, name)) if !name.is_empty() => {
                        Ok((prefix.to_string(), name.to_string()))
                    }
                    None if !text.is_empty() => Ok((String::new(), text.into_owned())),
                    _ => Err(NbfxError::TypeMismatch),
                }
            }
            _ => Err(NbfxError::TypeMismatch),
        }
    }

    // ------------------------------------------------------------ chunked

    /// Copies up to `buf.len()` bytes of binary content, shrinking the
    /// remaining range. Returns the number of bytes produced; zero means
    /// the value is exhausted.
    pub fn read_bytes_chunk(
        &mut self,
        src: &ByteSource,
        buf: &mut [u8],
    ) -> Result<usize, NbfxError> {
        match self {
            ValueSlot::Binary { range } => {
                let take = range.take_front(buf.len());
                let bytes = src.bytes(take)?;
                buf[..bytes.len()].copy_from_slice(bytes);
                Ok(bytes.len())
            }
            ValueSlot::Empty => Ok(0),
            _ => Err(NbfxError::TypeMismatch),
        }
    }

    /// Takes up to `max_bytes` of text from the front of the value, never
    /// splitting a multi-byte character. Non-range variants are returned
    /// whole and leave the slot empty.
    pub fn read_chars_chunk(
        &mut self,
        src: &ByteSource,
        max_bytes: usize,
    ) -> Result<String, NbfxError> {
        match self {
            ValueSlot::Raw { range, encoding } => {
                let available = src.bytes(*range)?;
                let take = match encoding {
                    TextEncoding::Utf8 | TextEncoding::Utf8Escaped => {
                        utf8_boundary_back_off(available, max_bytes.min(available.len()))
                    }
                    TextEncoding::Utf16 => {
                        utf16_boundary_back_off(available, max_bytes.min(available.len()))
                    }
                };
                let encoding = *encoding;
                let chunk = range.take_front(take);
                let piece = ValueSlot::Raw {
                    range: chunk,
                    encoding,
                };
                Ok(piece.to_text(src)?.into_owned())
            }
            ValueSlot::Empty => Ok(String::new()),
            _ => {
                let text = self.to_text(src)?.into_owned();
                *self = ValueSlot::Empty;
                Ok(text)
            }
        }
    }

    // ------------------------------------------------------------ predicates

    /// Whether the value consists only of XML whitespace. O(length) over
    /// raw ranges, O(1) for scalar/constant/empty variants.
    pub fn is_whitespace_only(&self, src: &ByteSource) -> Result<bool, NbfxError> {
        fn is_ws(b: u8) -> bool {
            matches!(b, b' ' | b'\t' | b'\r' | b'\n')
        }
        match self {
            ValueSlot::Empty => Ok(true),
            ValueSlot::Raw { range, encoding } => {
                let bytes = src.bytes(*range)?;
                match encoding {
                    TextEncoding::Utf8 | TextEncoding::Utf8Escaped => {
                        Ok(bytes.iter().all(|&b| is_ws(b)))
                    }
                    TextEncoding::Utf16 => Ok(bytes.chunks_exact(2).all(|pair| {
                        let unit = u16::from_le_bytes([pair[0], pair[1]]);
                        unit < 0x80 && is_ws(unit as u8)
                    })),
                }
            }
            ValueSlot::Binary { range } => Ok(range.is_empty()),
            ValueSlot::Dictionary { key } => {
                let text = src.resolve_dictionary_key(*key)?;
                Ok(text.bytes().all(is_ws))
            }
            ValueSlot::Char(c) => Ok(c.is_ascii() && is_ws(*c as u8)),
            ValueSlot::List(items) => {
                for item in items {
                    if !item.is_whitespace_only(src)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Compares against an external string without forcing both sides into
    /// the same representation.
    pub fn eq_text(&self, src: &ByteSource, text: &str) -> Result<bool, NbfxError> {
        match self {
            ValueSlot::Raw {
                range,
                encoding: TextEncoding::Utf8,
            } => Ok(bytes_equal(src.bytes(*range)?, text.as_bytes())),
            ValueSlot::Dictionary { key } => {
                Ok(src.resolve_dictionary_key(*key)? == text)
            }
            ValueSlot::Constant(id) => Ok(id.as_str() == text),
            _ => Ok(self.to_text(src)?.as_ref() == text),
        }
    }

    /// Orders the value's text image against an external string, bytewise.
    pub fn cmp_text(
        &self,
        src: &ByteSource,
        text: &str,
    ) -> Result<std::cmp::Ordering, NbfxError> {
        match self {
            ValueSlot::Raw {
                range,
                encoding: TextEncoding::Utf8,
            } => Ok(compare_bytes(src.bytes(*range)?, text.as_bytes())),
            _ => Ok(compare_bytes(
                self.to_text(src)?.as_bytes(),
                text.as_bytes(),
            )),
        }
    }

    /// Compares two slots. Same-tag shortcuts avoid materialization; the
    /// fallback compares the text images byte for byte and agrees with
    /// materialize-then-compare.
    pub fn eq_slot(
        &self,
        src: &ByteSource,
        other: &ValueSlot,
        other_src: &ByteSource,
    ) -> Result<bool, NbfxError> {
        match (self, other) {
            (ValueSlot::Dictionary { key: a }, ValueSlot::Dictionary { key: b }) if a == b => {
                return Ok(true)
            }
            (ValueSlot::Constant(a), ValueSlot::Constant(b)) => return Ok(a == b),
            (ValueSlot::Int32(a), ValueSlot::Int32(b)) => return Ok(a == b),
            (ValueSlot::Int64(a), ValueSlot::Int64(b)) => return Ok(a == b),
            (ValueSlot::Guid(a), ValueSlot::Guid(b)) => return Ok(a == b),
            _ => {}
        }
        Ok(self.to_text(src)?.as_ref() == other.to_text(other_src)?.as_ref())
    }
}

// ---------------------------------------------------------------- helpers

fn parse_int(text: &str) -> Result<i64, NbfxError> {
    text.parse::<i64>().map_err(|e| match e.kind() {
        IntErrorKind::PosOverflow | IntErrorKind::NegOverflow => NbfxError::Overflow,
        _ => NbfxError::TypeMismatch,
    })
}

fn parse_float(text: &str) -> Result<f64, NbfxError> {
    match text {
        "INF" => Ok(f64::INFINITY),
        "-INF" => Ok(f64::NEG_INFINITY),
        "NaN" => Ok(f64::NAN),
        _ => text.parse().map_err(|_| NbfxError::TypeMismatch),
    }
}

fn float_to_int(v: f64) -> Result<i64, NbfxError> {
    if v.fract() != 0.0 || v.is_nan() {
        return Err(NbfxError::TypeMismatch);
    }
    if v < i64::MIN as f64 || v > i64::MAX as f64 {
        return Err(NbfxError::Overflow);
    }
    Ok(v as i64)
}

/// Text image of a float: integral values print without an exponent or
/// trailing `.0`, non-finite values use the XML Schema spellings.
pub(crate) fn format_float(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v == f64::INFINITY {
        "INF".to_string()
    } else if v == f64::NEG_INFINITY {
        "-INF".to_string()
    } else {
        let mut s = format!("{v}");
        if let Some(stripped) = s.strip_suffix(".0") {
            s = stripped.to_string();
        }
        s
    }
}

fn utf16_to_string(bytes: &[u8]) -> Result<String, NbfxError> {
    if bytes.len() % 2 != 0 {
        return Err(NbfxError::InvalidFormat);
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| NbfxError::InvalidFormat)
}

/// Largest prefix of `bytes` not exceeding `limit` that ends on a UTF-8
/// character boundary. Returns at least one whole character when the limit
/// is too tight for one.
pub(crate) fn utf8_boundary_back_off(bytes: &[u8], limit: usize) -> usize {
    if limit >= bytes.len() {
        return bytes.len();
    }
    let mut end = limit;
    while end > 0 && bytes[end] & 0xc0 == 0x80 {
        end -= 1;
    }
    if end == 0 {
        // The first character alone is longer than the limit; take it whole.
        end = 1;
        while end < bytes.len() && bytes[end] & 0xc0 == 0x80 {
            end += 1;
        }
    }
    end
}

/// Largest prefix of `bytes` not exceeding `limit` that ends on a UTF-16
/// code unit boundary and does not strand a high surrogate.
pub(crate) fn utf16_boundary_back_off(bytes: &[u8], limit: usize) -> usize {
    if limit >= bytes.len() {
        return bytes.len();
    }
    let mut end = limit & !1;
    if end >= 2 {
        let last = u16::from_le_bytes([bytes[end - 2], bytes[end - 1]]);
        if (0xd800..0xdc00).contains(&last) {
            end -= 2;
        }
    }
    if end == 0 && bytes.len() >= 2 {
        // The window is too tight for even one code unit; take the first
        // character whole.
        let first = u16::from_le_bytes([bytes[0], bytes[1]]);
        end = if (0xd800..0xdc00).contains(&first) {
            4.min(bytes.len())
        } else {
            2
        };
    }
    end
}

/// Decodes XML entity and character references.
fn unescape(text: &str) -> Result<Cow<'_, str>, NbfxError> {
    if !text.contains('&') {
        return Ok(Cow::Borrowed(text));
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let end = after.find(';').ok_or(NbfxError::InvalidFormat)?;
        let entity = &after[..end];
        match entity {
            "lt" => out.push('<'),
            "gt" => out.push('>'),
            "amp" => out.push('&'),
            "quot" => out.push('"'),
            "apos" => out.push('\''),
            _ => {
                let code = if let Some(hex) = entity.strip_prefix("#x") {
                    u32::from_str_radix(hex, 16).map_err(|_| NbfxError::InvalidFormat)?
                } else if let Some(dec) = entity.strip_prefix('#') {
                    dec.parse().map_err(|_| NbfxError::InvalidFormat)?
                } else {
                    return Err(NbfxError::InvalidFormat);
                };
                out.push(char::from_u32(code).ok_or(NbfxError::InvalidFormat)?);
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(Cow::Owned(out))
}
