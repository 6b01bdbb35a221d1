//! Binary infoset encoder.
//!
//! Serializes infoset events into the record byte stream, mirroring the
//! decoder's record set. Attribute values are buffered until the attribute
//! closes so the shortest valid record can be chosen; element content is
//! emitted eagerly, with the last text record's offset retained so a
//! following end element can flip it to the WithEndElement sibling in
//! place.
//!
//! Usage errors (writing content with no open element, unbalanced closes)
//! are reported immediately as [`NbfxError::InvalidOperation`].

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use nbfx_buffers::Writer;

use crate::constants::*;
use crate::dictionary::{Dictionaries, StringTable};
use crate::error::NbfxError;
use crate::types::{DateTime, Decimal, Guid, TimeSpan, UniqueId};
use crate::value::{format_float, ConstantId, ValueSlot};

/// Homogeneous scalar slices accepted by the array fast path.
#[derive(Debug, Clone, Copy)]
pub enum ArrayValues<'v> {
    Bool(&'v [bool]),
    Int16(&'v [i16]),
    Int32(&'v [i32]),
    Int64(&'v [i64]),
    Float(&'v [f32]),
    Double(&'v [f64]),
    Decimal(&'v [Decimal]),
    DateTime(&'v [DateTime]),
    TimeSpan(&'v [TimeSpan]),
    Guid(&'v [Guid]),
}

impl ArrayValues<'_> {
    fn len(&self) -> usize {
        match self {
            ArrayValues::Bool(v) => v.len(),
            ArrayValues::Int16(v) => v.len(),
            ArrayValues::Int32(v) => v.len(),
            ArrayValues::Int64(v) => v.len(),
            ArrayValues::Float(v) => v.len(),
            ArrayValues::Double(v) => v.len(),
            ArrayValues::Decimal(v) => v.len(),
            ArrayValues::DateTime(v) => v.len(),
            ArrayValues::TimeSpan(v) => v.len(),
            ArrayValues::Guid(v) => v.len(),
        }
    }

    /// WithEndElement record id declared for every entry.
    fn value_type(&self) -> u8 {
        let base = match self {
            ArrayValues::Bool(_) => BOOL_TEXT,
            ArrayValues::Int16(_) => INT16_TEXT,
            ArrayValues::Int32(_) => INT32_TEXT,
            ArrayValues::Int64(_) => INT64_TEXT,
            ArrayValues::Float(_) => FLOAT_TEXT,
            ArrayValues::Double(_) => DOUBLE_TEXT,
            ArrayValues::Decimal(_) => DECIMAL_TEXT,
            ArrayValues::DateTime(_) => DATETIME_TEXT,
            ArrayValues::TimeSpan(_) => TIMESPAN_TEXT,
            ArrayValues::Guid(_) => UUID_TEXT,
        };
        base | WITH_END_ELEMENT
    }
}

/// Buffered content of the currently open attribute.
#[derive(Debug, Default)]
enum AttrValue {
    #[default]
    None,
    Text(String),
    Bytes(Vec<u8>),
    /// A single typed write; a second write of any kind degrades it to
    /// accumulated text.
    Typed(ValueSlot),
}

/// Record stream writer.
///
/// One encoder processes exactly one session; the session dictionary it
/// grows can be handed to the matching decoder out of band (self-taught
/// inline strings keep both sides aligned without that).
pub struct BinaryEncoder {
    writer: Writer,
    dicts: Dictionaries,
    depth: usize,
    /// True between a start-element record and its first content; only
    /// then may attribute records be written.
    head_open: bool,
    in_attribute: bool,
    attr_value: AttrValue,
    /// Offset of the last content text record's tag byte, when nothing was
    /// written after it. The end-element coalescing window.
    last_text: Option<usize>,
    closed: bool,
}

impl Default for BinaryEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl BinaryEncoder {
    pub fn new() -> Self {
        Self {
            writer: Writer::new(),
            dicts: Dictionaries::new(),
            depth: 0,
            head_open: false,
            in_attribute: false,
            attr_value: AttrValue::None,
            last_text: None,
            closed: false,
        }
    }

    /// Supplies the static dictionary for this session.
    pub fn with_static_dictionary(mut self, statics: StringTable) -> Self {
        self.dicts.statics = statics;
        self
    }

    pub fn dictionaries(&self) -> &Dictionaries {
        &self.dicts
    }

    /// The session strings assigned so far, in key order.
    pub fn session_strings(&self) -> &StringTable {
        &self.dicts.session
    }

    fn check_open(&self) -> Result<(), NbfxError> {
        if self.closed {
            return Err(NbfxError::UseAfterClose);
        }
        Ok(())
    }

    /// Releases buffers and makes every further operation fail.
    pub fn close(&mut self) {
        self.writer.reset();
        self.closed = true;
    }

    /// Returns the finished record stream and resets for the next document.
    /// The session dictionary carries over.
    pub fn finish(&mut self) -> Result<Vec<u8>, NbfxError> {
        self.check_open()?;
        if self.in_attribute {
            return Err(NbfxError::InvalidOperation("attribute still open"));
        }
        if self.depth != 0 {
            return Err(NbfxError::InvalidOperation("elements still open"));
        }
        self.head_open = false;
        self.last_text = None;
        Ok(self.writer.flush())
    }

    // ------------------------------------------------------------ names

    /// Dictionary key for a name: the static table first, then the session
    /// table. A miss assigns the next session key for later uses and the
    /// name is written inline this once.
    fn name_key(&mut self, name: &str) -> Option<u32> {
        if let Some(index) = self.dicts.statics.lookup(name) {
            return Some(Dictionaries::static_key(index));
        }
        if let Some(index) = self.dicts.session.lookup(name) {
            return Some(Dictionaries::session_key(index));
        }
        self.dicts.session.add(name);
        None
    }

    fn write_multi_byte_uint31(&mut self, mut value: u32) {
        loop {
            let b = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.writer.u8(b);
                return;
            }
            self.writer.u8(b | 0x80);
        }
    }

    fn write_name(&mut self, name: &str) {
        self.write_multi_byte_uint31(name.len() as u32);
        self.writer.utf8(name);
    }

    /// Single-lowercase-letter prefix index for the reserved record ranges.
    fn letter_prefix(prefix: &str) -> Option<u8> {
        let bytes = prefix.as_bytes();
        if bytes.len() == 1 && bytes[0].is_ascii_lowercase() {
            Some(bytes[0] - b'a')
        } else {
            None
        }
    }

    // ------------------------------------------------------------ elements

    pub fn write_start_element(&mut self, prefix: &str, local_name: &str) -> Result<(), NbfxError> {
        self.check_open()?;
        if self.in_attribute {
            return Err(NbfxError::InvalidOperation("attribute still open"));
        }
        if local_name.is_empty() {
            return Err(NbfxError::InvalidOperation("element name is empty"));
        }
        self.last_text = None;
        let key = self.name_key(local_name);
        match (Self::letter_prefix(prefix), key) {
            (_, _) if prefix.is_empty() => match key {
                Some(key) => {
                    self.writer.u8(SHORT_DICTIONARY_ELEMENT);
                    self.write_multi_byte_uint31(key);
                }
                None => {
                    self.writer.u8(SHORT_ELEMENT);
                    self.write_name(local_name);
                }
            },
            (Some(letter), Some(key)) => {
                self.writer.u8(PREFIX_DICTIONARY_ELEMENT_A + letter);
                self.write_multi_byte_uint31(key);
            }
            (Some(letter), None) => {
                self.writer.u8(PREFIX_ELEMENT_A + letter);
                self.write_name(local_name);
            }
            (None, Some(key)) => {
                self.writer.u8(DICTIONARY_ELEMENT);
                self.write_name(prefix);
                self.write_multi_byte_uint31(key);
            }
            (None, None) => {
                self.writer.u8(ELEMENT);
                self.write_name(prefix);
                self.write_name(local_name);
            }
        }
        self.depth += 1;
        self.head_open = true;
        Ok(())
    }

    pub fn write_end_element(&mut self) -> Result<(), NbfxError> {
        self.check_open()?;
        if self.in_attribute {
            return Err(NbfxError::InvalidOperation("attribute still open"));
        }
        if self.depth == 0 {
            return Err(NbfxError::InvalidOperation("no element is open"));
        }
        match self.last_text.take() {
            // Rewrite the preceding text record to its WithEndElement
            // sibling instead of spending a record byte.
            Some(pos) => self.writer.uint8[pos] |= WITH_END_ELEMENT,
            None => self.writer.u8(END_ELEMENT),
        }
        self.depth -= 1;
        self.head_open = false;
        Ok(())
    }

    // ------------------------------------------------------------ attributes

    fn check_attribute_position(&self) -> Result<(), NbfxError> {
        if self.in_attribute {
            return Err(NbfxError::InvalidOperation("attribute still open"));
        }
        if !self.head_open {
            return Err(NbfxError::InvalidOperation(
                "attributes must precede element content",
            ));
        }
        Ok(())
    }

    pub fn write_start_attribute(
        &mut self,
        prefix: &str,
        local_name: &str,
    ) -> Result<(), NbfxError> {
        self.check_open()?;
        self.check_attribute_position()?;
        if local_name.is_empty() {
            return Err(NbfxError::InvalidOperation("attribute name is empty"));
        }
        let key = self.name_key(local_name);
        match (Self::letter_prefix(prefix), key) {
            (_, _) if prefix.is_empty() => match key {
                Some(key) => {
                    self.writer.u8(SHORT_DICTIONARY_ATTRIBUTE);
                    self.write_multi_byte_uint31(key);
                }
                None => {
                    self.writer.u8(SHORT_ATTRIBUTE);
                    self.write_name(local_name);
                }
            },
            (Some(letter), Some(key)) => {
                self.writer.u8(PREFIX_DICTIONARY_ATTRIBUTE_A + letter);
                self.write_multi_byte_uint31(key);
            }
            (Some(letter), None) => {
                self.writer.u8(PREFIX_ATTRIBUTE_A + letter);
                self.write_name(local_name);
            }
            (None, Some(key)) => {
                self.writer.u8(DICTIONARY_ATTRIBUTE);
                self.write_name(prefix);
                self.write_multi_byte_uint31(key);
            }
            (None, None) => {
                self.writer.u8(ATTRIBUTE);
                self.write_name(prefix);
                self.write_name(local_name);
            }
        }
        self.in_attribute = true;
        self.attr_value = AttrValue::None;
        Ok(())
    }

    /// Closes the attribute, emitting its buffered content as the shortest
    /// valid record.
    pub fn write_end_attribute(&mut self) -> Result<(), NbfxError> {
        self.check_open()?;
        if !self.in_attribute {
            return Err(NbfxError::InvalidOperation("no attribute is open"));
        }
        self.in_attribute = false;
        match std::mem::take(&mut self.attr_value) {
            AttrValue::None => self.writer.u8(EMPTY_TEXT),
            AttrValue::Text(text) => self.emit_text_record(&text),
            AttrValue::Bytes(bytes) => self.emit_bytes_record(&bytes),
            AttrValue::Typed(slot) => {
                self.emit_value_record(&slot)?;
            }
        }
        Ok(())
    }

    /// Namespace declaration for the element whose head is open.
    pub fn write_xmlns_attribute(&mut self, prefix: &str, uri: &str) -> Result<(), NbfxError> {
        self.check_open()?;
        self.check_attribute_position()?;
        let key = self.name_key(uri);
        match (prefix.is_empty(), key) {
            (true, Some(key)) => {
                self.writer.u8(SHORT_DICTIONARY_XMLNS_ATTRIBUTE);
                self.write_multi_byte_uint31(key);
            }
            (true, None) => {
                self.writer.u8(SHORT_XMLNS_ATTRIBUTE);
                self.write_name(uri);
            }
            (false, Some(key)) => {
                self.writer.u8(DICTIONARY_XMLNS_ATTRIBUTE);
                self.write_name(prefix);
                self.write_multi_byte_uint31(key);
            }
            (false, None) => {
                self.writer.u8(XMLNS_ATTRIBUTE);
                self.write_name(prefix);
                self.write_name(uri);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------ content

    /// Text content. In an attribute the text accumulates; in element
    /// content one record is emitted per call.
    pub fn write_text(&mut self, text: &str) -> Result<(), NbfxError> {
        self.check_open()?;
        if self.in_attribute {
            self.append_attr_text(text)?;
            return Ok(());
        }
        self.check_content_position()?;
        let pos = self.writer.x;
        self.emit_text_record(text);
        self.note_text_record(pos, true);
        Ok(())
    }

    /// CDATA content; the record stream has no CDATA form, so it is
    /// written as chars.
    pub fn write_cdata(&mut self, text: &str) -> Result<(), NbfxError> {
        self.write_text(text)
    }

    /// Binary content, presented as base64 when read back as text.
    pub fn write_base64(&mut self, bytes: &[u8]) -> Result<(), NbfxError> {
        self.check_open()?;
        if self.in_attribute {
            self.append_attr_bytes(bytes)?;
            return Ok(());
        }
        self.check_content_position()?;
        let pos = self.writer.x;
        self.emit_bytes_record(bytes);
        self.note_text_record(pos, true);
        Ok(())
    }

    pub fn write_bool(&mut self, value: bool) -> Result<(), NbfxError> {
        self.write_value(ValueSlot::Constant(if value {
            ConstantId::True
        } else {
            ConstantId::False
        }))
    }

    pub fn write_int32(&mut self, value: i32) -> Result<(), NbfxError> {
        self.write_int64(value as i64)
    }

    /// Integers shrink to the shortest record that holds the value.
    pub fn write_int64(&mut self, value: i64) -> Result<(), NbfxError> {
        self.write_value(slot_for_int(value))
    }

    pub fn write_uint64(&mut self, value: u64) -> Result<(), NbfxError> {
        let slot = match i64::try_from(value) {
            Ok(v) => slot_for_int(v),
            Err(_) => ValueSlot::UInt64(value),
        };
        self.write_value(slot)
    }

    pub fn write_float(&mut self, value: f32) -> Result<(), NbfxError> {
        self.write_value(ValueSlot::Float(value))
    }

    pub fn write_double(&mut self, value: f64) -> Result<(), NbfxError> {
        self.write_value(ValueSlot::Double(value))
    }

    pub fn write_decimal(&mut self, value: Decimal) -> Result<(), NbfxError> {
        self.write_value(ValueSlot::Decimal(value))
    }

    pub fn write_datetime(&mut self, value: DateTime) -> Result<(), NbfxError> {
        self.write_value(ValueSlot::DateTime(value))
    }

    pub fn write_timespan(&mut self, value: TimeSpan) -> Result<(), NbfxError> {
        self.write_value(ValueSlot::TimeSpan(value))
    }

    pub fn write_guid(&mut self, value: Guid) -> Result<(), NbfxError> {
        self.write_value(ValueSlot::Guid(value))
    }

    pub fn write_unique_id(&mut self, value: UniqueId) -> Result<(), NbfxError> {
        self.write_value(ValueSlot::UniqueId(value))
    }

    /// A value the caller holds a dictionary key for.
    pub fn write_dictionary_text(&mut self, raw_key: u32) -> Result<(), NbfxError> {
        self.check_open()?;
        if self.dicts.resolve(raw_key).is_none() {
            return Err(NbfxError::InvalidOperation(
                "dictionary key is not defined",
            ));
        }
        self.write_value(ValueSlot::Dictionary { key: raw_key })
    }

    /// A qualified name with a one-letter prefix and dictionary-keyed name.
    pub fn write_qname_dictionary_text(
        &mut self,
        prefix: char,
        raw_key: u32,
    ) -> Result<(), NbfxError> {
        self.check_open()?;
        if !prefix.is_ascii_lowercase() {
            return Err(NbfxError::InvalidOperation(
                "qname prefix must be a single lowercase letter",
            ));
        }
        if self.dicts.resolve(raw_key).is_none() {
            return Err(NbfxError::InvalidOperation(
                "dictionary key is not defined",
            ));
        }
        self.write_value(ValueSlot::QName {
            prefix: prefix as u8 - b'a',
            key: raw_key,
        })
    }

    /// A list value: the items are framed by start/end list records.
    pub fn write_list(&mut self, items: Vec<ValueSlot>) -> Result<(), NbfxError> {
        self.write_value(ValueSlot::List(items))
    }

    pub fn write_comment(&mut self, text: &str) -> Result<(), NbfxError> {
        self.check_open()?;
        if self.in_attribute {
            return Err(NbfxError::InvalidOperation("attribute still open"));
        }
        self.last_text = None;
        self.head_open = false;
        self.writer.u8(COMMENT);
        self.write_multi_byte_uint31(text.len() as u32);
        self.writer.utf8(text);
        Ok(())
    }

    /// The XML declaration carries no record; it is only valid before any
    /// output.
    pub fn write_declaration(&mut self) -> Result<(), NbfxError> {
        self.check_open()?;
        if self.writer.size() != 0 || self.depth != 0 {
            return Err(NbfxError::InvalidOperation(
                "declaration must come first",
            ));
        }
        Ok(())
    }

    /// Bulk emission of a homogeneous scalar sequence: one element shape,
    /// the value type, a count, then untagged payloads. An empty slice
    /// writes nothing.
    pub fn write_array(
        &mut self,
        prefix: &str,
        local_name: &str,
        values: ArrayValues<'_>,
    ) -> Result<(), NbfxError> {
        self.check_open()?;
        if self.in_attribute {
            return Err(NbfxError::InvalidOperation("attribute still open"));
        }
        if values.len() == 0 {
            return Ok(());
        }
        if local_name.is_empty() {
            return Err(NbfxError::InvalidOperation("element name is empty"));
        }
        self.writer.u8(ARRAY);
        self.write_start_element(prefix, local_name)?;
        self.write_end_element()?;
        self.writer.u8(values.value_type());
        self.write_multi_byte_uint31(values.len() as u32);
        match values {
            ArrayValues::Bool(v) => {
                for b in v {
                    self.writer.u8(*b as u8);
                }
            }
            ArrayValues::Int16(v) => {
                for x in v {
                    self.writer.i16(*x);
                }
            }
            ArrayValues::Int32(v) => {
                for x in v {
                    self.writer.i32(*x);
                }
            }
            ArrayValues::Int64(v) => {
                for x in v {
                    self.writer.i64(*x);
                }
            }
            ArrayValues::Float(v) => {
                for x in v {
                    self.writer.f32(*x);
                }
            }
            ArrayValues::Double(v) => {
                for x in v {
                    self.writer.f64(*x);
                }
            }
            ArrayValues::Decimal(v) => {
                for x in v {
                    self.writer.buf(&x.to_le_bytes());
                }
            }
            ArrayValues::DateTime(v) => {
                for x in v {
                    self.writer.i64(x.raw());
                }
            }
            ArrayValues::TimeSpan(v) => {
                for x in v {
                    self.writer.i64(x.ticks);
                }
            }
            ArrayValues::Guid(v) => {
                for x in v {
                    self.writer.buf(x.as_bytes());
                }
            }
        }
        self.last_text = None;
        Ok(())
    }

    // ------------------------------------------------------------ internals

    fn check_content_position(&self) -> Result<(), NbfxError> {
        if self.depth == 0 {
            return Err(NbfxError::InvalidOperation("no element is open"));
        }
        Ok(())
    }

    /// A typed write: buffered in an attribute, one record in content.
    fn write_value(&mut self, slot: ValueSlot) -> Result<(), NbfxError> {
        self.check_open()?;
        if self.in_attribute {
            return self.append_attr_typed(slot);
        }
        self.check_content_position()?;
        let (pos, coalescible) = self.emit_value_record(&slot)?;
        self.note_text_record(pos, coalescible);
        Ok(())
    }

    fn note_text_record(&mut self, pos: usize, coalescible: bool) {
        self.head_open = false;
        self.last_text = if coalescible { Some(pos) } else { None };
    }

    /// Emits the record for a value slot, returning the tag offset and
    /// whether the record has a WithEndElement sibling.
    fn emit_value_record(&mut self, slot: &ValueSlot) -> Result<(usize, bool), NbfxError> {
        let pos = self.writer.x;
        match slot {
            ValueSlot::Empty => self.writer.u8(EMPTY_TEXT),
            ValueSlot::Constant(ConstantId::Zero) => self.writer.u8(ZERO_TEXT),
            ValueSlot::Constant(ConstantId::One) => self.writer.u8(ONE_TEXT),
            ValueSlot::Constant(ConstantId::True) => self.writer.u8(TRUE_TEXT),
            ValueSlot::Constant(ConstantId::False) => self.writer.u8(FALSE_TEXT),
            ValueSlot::Bool(b) => {
                self.writer.u8(BOOL_TEXT);
                self.writer.u8(*b as u8);
            }
            ValueSlot::Int8(v) => {
                self.writer.u8(INT8_TEXT);
                self.writer.i8(*v);
            }
            ValueSlot::Int16(v) => {
                self.writer.u8(INT16_TEXT);
                self.writer.i16(*v);
            }
            ValueSlot::Int32(v) => {
                self.writer.u8(INT32_TEXT);
                self.writer.i32(*v);
            }
            ValueSlot::Int64(v) => {
                self.writer.u8(INT64_TEXT);
                self.writer.i64(*v);
            }
            ValueSlot::UInt64(v) => {
                self.writer.u8(UINT64_TEXT);
                self.writer.u64(*v);
            }
            ValueSlot::Float(v) => {
                self.writer.u8(FLOAT_TEXT);
                self.writer.f32(*v);
            }
            ValueSlot::Double(v) => {
                self.writer.u8(DOUBLE_TEXT);
                self.writer.f64(*v);
            }
            ValueSlot::Decimal(v) => {
                self.writer.u8(DECIMAL_TEXT);
                self.writer.buf(&v.to_le_bytes());
            }
            ValueSlot::DateTime(v) => {
                self.writer.u8(DATETIME_TEXT);
                self.writer.i64(v.raw());
            }
            ValueSlot::TimeSpan(v) => {
                self.writer.u8(TIMESPAN_TEXT);
                self.writer.i64(v.ticks);
            }
            ValueSlot::Guid(v) => {
                self.writer.u8(UUID_TEXT);
                self.writer.buf(v.as_bytes());
            }
            ValueSlot::UniqueId(v) => {
                self.writer.u8(UNIQUE_ID_TEXT);
                self.writer.buf(v.as_bytes());
            }
            ValueSlot::Char(c) => {
                let mut buf = [0u8; 4];
                let text = c.encode_utf8(&mut buf);
                self.emit_text_record(text);
            }
            ValueSlot::Dictionary { key } => {
                self.writer.u8(DICTIONARY_TEXT);
                self.write_multi_byte_uint31(*key);
            }
            ValueSlot::QName { prefix, key } => {
                self.writer.u8(QNAME_DICTIONARY_TEXT);
                self.writer.u8(*prefix);
                self.write_multi_byte_uint31(*key);
            }
            ValueSlot::List(items) => {
                self.writer.u8(START_LIST_TEXT);
                for item in items {
                    if matches!(item, ValueSlot::List(_)) {
                        return Err(NbfxError::InvalidOperation("lists do not nest"));
                    }
                    self.emit_value_record(item)?;
                }
                self.writer.u8(END_LIST_TEXT);
                // The list-end record has no WithEndElement sibling.
                return Ok((pos, false));
            }
            ValueSlot::Raw { .. } | ValueSlot::Binary { .. } => {
                return Err(NbfxError::InvalidOperation(
                    "range values cannot be written",
                ));
            }
        }
        Ok((pos, true))
    }

    /// Chars record with the shortest length tier; the well-known strings
    /// collapse to one-byte records.
    fn emit_text_record(&mut self, text: &str) {
        match text {
            "" => self.writer.u8(EMPTY_TEXT),
            "0" => self.writer.u8(ZERO_TEXT),
            "1" => self.writer.u8(ONE_TEXT),
            "true" => self.writer.u8(TRUE_TEXT),
            "false" => self.writer.u8(FALSE_TEXT),
            _ => {
                let len = text.len();
                if len <= 0xff {
                    self.writer.u8(CHARS8_TEXT);
                    self.writer.u8(len as u8);
                } else if len <= 0xffff {
                    self.writer.u8(CHARS16_TEXT);
                    self.writer.u16(len as u16);
                } else {
                    self.writer.u8(CHARS32_TEXT);
                    self.writer.i32(len as i32);
                }
                self.writer.utf8(text);
            }
        }
    }

    fn emit_bytes_record(&mut self, bytes: &[u8]) {
        let len = bytes.len();
        if len <= 0xff {
            self.writer.u8(BYTES8_TEXT);
            self.writer.u8(len as u8);
        } else if len <= 0xffff {
            self.writer.u8(BYTES16_TEXT);
            self.writer.u16(len as u16);
        } else {
            self.writer.u8(BYTES32_TEXT);
            self.writer.i32(len as i32);
        }
        self.writer.buf(bytes);
    }

    // ------------------------------------------------------------ attr value

    /// Text image of a buffered value, for degrading mixed attribute
    /// content to accumulated chars.
    fn slot_text(&self, slot: &ValueSlot) -> Result<String, NbfxError> {
        Ok(match slot {
            ValueSlot::Empty => String::new(),
            ValueSlot::Constant(id) => id.as_str().to_string(),
            ValueSlot::Bool(b) => if *b { "true" } else { "false" }.to_string(),
            ValueSlot::Int8(v) => v.to_string(),
            ValueSlot::Int16(v) => v.to_string(),
            ValueSlot::Int32(v) => v.to_string(),
            ValueSlot::Int64(v) => v.to_string(),
            ValueSlot::UInt64(v) => v.to_string(),
            ValueSlot::Float(v) => format_float(*v as f64),
            ValueSlot::Double(v) => format_float(*v),
            ValueSlot::Decimal(v) => v.to_string(),
            ValueSlot::DateTime(v) => v.to_string(),
            ValueSlot::TimeSpan(v) => v.to_string(),
            ValueSlot::Guid(v) => v.to_string(),
            ValueSlot::UniqueId(v) => v.to_string(),
            ValueSlot::Char(c) => c.to_string(),
            ValueSlot::Dictionary { key } => self
                .dicts
                .resolve(*key)
                .ok_or(NbfxError::UndefinedDictionaryKey(*key))?
                .to_string(),
            ValueSlot::QName { prefix, key } => {
                let name = self
                    .dicts
                    .resolve(*key)
                    .ok_or(NbfxError::UndefinedDictionaryKey(*key))?;
                format!("{}:{}", (b'a' + prefix) as char, name)
            }
            ValueSlot::List(items) => {
                let mut out = String::new();
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }
                    out.push_str(&self.slot_text(item)?);
                }
                out
            }
            ValueSlot::Raw { .. } | ValueSlot::Binary { .. } => {
                return Err(NbfxError::InvalidOperation(
                    "range values cannot be written",
                ))
            }
        })
    }

    fn append_attr_text(&mut self, text: &str) -> Result<(), NbfxError> {
        let current = std::mem::take(&mut self.attr_value);
        self.attr_value = match current {
            AttrValue::None => AttrValue::Text(text.to_string()),
            AttrValue::Text(mut t) => {
                t.push_str(text);
                AttrValue::Text(t)
            }
            AttrValue::Bytes(bytes) => {
                let mut t = BASE64.encode(bytes);
                t.push_str(text);
                AttrValue::Text(t)
            }
            AttrValue::Typed(slot) => {
                let mut t = self.slot_text(&slot)?;
                t.push_str(text);
                AttrValue::Text(t)
            }
        };
        Ok(())
    }

    fn append_attr_bytes(&mut self, bytes: &[u8]) -> Result<(), NbfxError> {
        let current = std::mem::take(&mut self.attr_value);
        self.attr_value = match current {
            AttrValue::None => AttrValue::Bytes(bytes.to_vec()),
            AttrValue::Bytes(mut b) => {
                b.extend_from_slice(bytes);
                AttrValue::Bytes(b)
            }
            AttrValue::Text(mut t) => {
                t.push_str(&BASE64.encode(bytes));
                AttrValue::Text(t)
            }
            AttrValue::Typed(slot) => {
                let mut t = self.slot_text(&slot)?;
                t.push_str(&BASE64.encode(bytes));
                AttrValue::Text(t)
            }
        };
        Ok(())
    }

    fn append_attr_typed(&mut self, slot: ValueSlot) -> Result<(), NbfxError> {
        match &self.attr_value {
            AttrValue::None => {
                self.attr_value = AttrValue::Typed(slot);
                Ok(())
            }
            _ => {
                let text = self.slot_text(&slot)?;
                self.append_attr_text(&text)
            }
        }
    }
}

/// Shortest integer slot that holds the value.
fn slot_for_int(value: i64) -> ValueSlot {
    match value {
        0 => ValueSlot::Constant(ConstantId::Zero),
        1 => ValueSlot::Constant(ConstantId::One),
        v if (i8::MIN as i64..=i8::MAX as i64).contains(&v) => ValueSlot::Int8(v as i8),
        v if (i16::MIN as i64..=i16::MAX as i64).contains(&v) => ValueSlot::Int16(v as i16),
        v if (i32::MIN as i64..=i32::MAX as i64).contains(&v) => ValueSlot::Int32(v as i32),
        v => ValueSlot::Int64(v),
    }
}
