//! Binary infoset decoder.
//!
//! Consumes the record byte stream from a [`ByteSource`] and produces one
//! node per [`read`](BinaryDecoder::read) call. Dictionary references are
//! resolved as they are seen, text runs longer than the streaming window are
//! split at safe character boundaries, and homogeneous scalar arrays are
//! replayed as full StartElement → value → EndElement triples.
//!
//! Any malformed record, truncated payload, unresolved dictionary key,
//! unbalanced end element or array-shape violation is fatal for the
//! session: close and discard the decoder.

use std::borrow::Cow;
use std::io::Read;

use crate::constants::*;
use crate::dictionary::Dictionaries;
use crate::error::NbfxError;
use crate::node::{Attribute, NameRef, Node, NodeKind};
use crate::source::{ByteRange, ByteSource};
use crate::value::{
    utf16_boundary_back_off, utf8_boundary_back_off, ConstantId, TextEncoding, ValueSlot,
};

/// Default bound on how many payload bytes one streamed read step consumes.
const DEFAULT_WINDOW: usize = 4096;

/// One open element; slots are reused across reads, indexed by depth.
#[derive(Debug, Default)]
struct ElementFrame {
    prefix: NameRef,
    local_name: NameRef,
}

/// A namespace declaration seen on a currently open element.
#[derive(Debug)]
struct NsDecl {
    depth: usize,
    prefix: NameRef,
    uri: NsUri,
}

#[derive(Debug)]
enum NsUri {
    Inline(String),
    Dictionary(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArrayPhase {
    /// Synthesize the next StartElement from the recorded shape.
    Start,
    /// Read the next untagged payload value.
    Value,
    /// Emit the element close.
    End,
}

#[derive(Debug)]
struct ArrayRun {
    /// WithEndElement text record id declared for every entry.
    value_type: u8,
    remaining: u32,
    prefix: NameRef,
    local_name: NameRef,
    phase: ArrayPhase,
}

/// Streaming state machine over the record stream.
///
/// One decoder processes exactly one document at a time; no operation may
/// run concurrently with another on the same instance.
pub struct BinaryDecoder<'a> {
    source: ByteSource<'a>,
    depth: usize,
    frames: Vec<ElementFrame>,
    ns_decls: Vec<NsDecl>,
    node: Node,
    attributes: Vec<Attribute>,
    /// An end element owed from a WithEndElement text record; emitted on
    /// the next read without consuming a record byte.
    pending_end_element: bool,
    array: Option<ArrayRun>,
    window_size: usize,
    eof: bool,
    closed: bool,
}

impl<'a> BinaryDecoder<'a> {
    /// Decoder over a fully-buffered document.
    pub fn from_buffer(data: &'a [u8]) -> Self {
        Self::over(ByteSource::from_buffer(data))
    }

    /// Decoder over a pull-based stream with bounded read windows.
    pub fn from_stream(stream: impl Read + 'a) -> Self {
        Self::over(ByteSource::from_stream(stream))
    }

    fn over(source: ByteSource<'a>) -> Self {
        Self {
            source,
            depth: 0,
            frames: Vec::new(),
            ns_decls: Vec::new(),
            node: Node::default(),
            attributes: Vec::new(),
            pending_end_element: false,
            array: None,
            window_size: DEFAULT_WINDOW,
            eof: false,
            closed: false,
        }
    }

    /// Supplies the static dictionary for this session.
    pub fn with_dictionaries(mut self, dicts: Dictionaries) -> Self {
        *self.source.dictionaries_mut() = dicts;
        self
    }

    /// Bounds how many payload bytes one streamed read step may consume.
    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size.max(1);
        self
    }

    /// Teaches the session dictionary a string the producer will reference.
    /// Returns the raw wire key the string answers to.
    pub fn add_session_string(&mut self, s: &str) -> u32 {
        let index = self.source.dictionaries_mut().session.add(s);
        Dictionaries::session_key(index)
    }

    pub fn source(&self) -> &ByteSource<'a> {
        &self.source
    }

    /// The node produced by the last read. Valid until the next read.
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// The current node's value slot.
    pub fn value(&self) -> &ValueSlot {
        &self.node.value
    }

    /// Attributes of the current element node.
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Text of the current node's local name.
    pub fn local_name(&self) -> Result<Cow<'_, str>, NbfxError> {
        self.node.local_name.as_text(&self.source)
    }

    /// Text of the current node's prefix.
    pub fn prefix(&self) -> Result<Cow<'_, str>, NbfxError> {
        self.node.prefix.as_text(&self.source)
    }

    /// Looks a prefix up against the namespace declarations of the
    /// currently open elements. Scope bookkeeping beyond that (redefinition
    /// rules, well-formedness) belongs to the infoset walker.
    pub fn resolve_namespace(&self, prefix: &str) -> Option<Cow<'_, str>> {
        match prefix {
            "xml" => return Some(Cow::Borrowed("http://www.w3.org/XML/1998/namespace")),
            "xmlns" => return Some(Cow::Borrowed("http://www.w3.org/2000/xmlns/")),
            _ => {}
        }
        for decl in self.ns_decls.iter().rev() {
            let matches = match &decl.prefix {
                NameRef::Empty => prefix.is_empty(),
                NameRef::Inline(p) => p == prefix,
                NameRef::Letter(n) => prefix.as_bytes() == [b'a' + n],
                NameRef::Dictionary(key) => {
                    self.source.resolve_dictionary_key(*key).ok() == Some(prefix)
                }
            };
            if matches {
                return match &decl.uri {
                    NsUri::Inline(uri) => Some(Cow::Borrowed(uri.as_str())),
                    NsUri::Dictionary(key) => self
                        .source
                        .resolve_dictionary_key(*key)
                        .ok()
                        .map(Cow::Borrowed),
                };
            }
        }
        None
    }

    /// Chunked binary read from the current node's value; see
    /// [`ValueSlot::read_bytes_chunk`].
    pub fn read_value_bytes(&mut self, buf: &mut [u8]) -> Result<usize, NbfxError> {
        if self.closed {
            return Err(NbfxError::UseAfterClose);
        }
        let Self { source, node, .. } = self;
        node.value.read_bytes_chunk(source, buf)
    }

    /// Chunked text read from the current node's value; see
    /// [`ValueSlot::read_chars_chunk`].
    pub fn read_value_chars(&mut self, max_bytes: usize) -> Result<String, NbfxError> {
        if self.closed {
            return Err(NbfxError::UseAfterClose);
        }
        let Self { source, node, .. } = self;
        node.value.read_chars_chunk(source, max_bytes)
    }

    /// Releases buffers and makes every further operation fail.
    pub fn close(&mut self) {
        self.source.close();
        self.frames.clear();
        self.ns_decls.clear();
        self.attributes.clear();
        self.closed = true;
    }

    /// Advances to the next node and returns its kind.
    pub fn read(&mut self) -> Result<NodeKind, NbfxError> {
        if self.closed {
            return Err(NbfxError::UseAfterClose);
        }
        if self.eof {
            self.node.set(NodeKind::EndOfFile);
            return Ok(NodeKind::EndOfFile);
        }
        self.attributes.clear();
        if self.pending_end_element {
            self.pending_end_element = false;
            return self.emit_end_element();
        }
        if self.array.is_some() {
            return self.read_array_step();
        }
        if !self.source.has_byte()? {
            if self.depth > 0 {
                return Err(NbfxError::UnexpectedEndOfInput);
            }
            self.eof = true;
            self.node.set(NodeKind::EndOfFile);
            return Ok(NodeKind::EndOfFile);
        }
        let tag = self.source.read_byte()?;
        self.dispatch(tag)
    }

    fn dispatch(&mut self, tag: u8) -> Result<NodeKind, NbfxError> {
        if is_element_record(tag) {
            return self.read_element(tag);
        }
        if tag == END_ELEMENT {
            return self.emit_end_element();
        }
        if tag == COMMENT {
            return self.read_comment();
        }
        if tag == ARRAY {
            return self.read_array_header();
        }
        if is_text_record(tag) {
            if self.depth == 0 {
                return Err(NbfxError::InvalidFormat);
            }
            return self.read_text(tag);
        }
        // Attribute records outside an element head, reserved values.
        Err(NbfxError::InvalidFormat)
    }

    // ------------------------------------------------------------ names

    /// Length-prefixed UTF-8 name.
    fn read_name(&mut self) -> Result<NameRef, NbfxError> {
        let len = self.source.read_multi_byte_uint31()? as usize;
        let range = self.source.read_bytes(len)?;
        let text = std::str::from_utf8(self.source.bytes(range)?)
            .map_err(|_| NbfxError::InvalidFormat)?;
        if text.is_empty() {
            Ok(NameRef::Empty)
        } else {
            Ok(NameRef::Inline(text.to_string()))
        }
    }

    /// Length-prefixed local name. First use of a distinct inline name also
    /// assigns the next session key, mirroring the write side, so a later
    /// session reference to the same string resolves without out-of-band
    /// teaching.
    fn read_local_name(&mut self) -> Result<NameRef, NbfxError> {
        let name = self.read_name()?;
        if let NameRef::Inline(s) = &name {
            self.source.dictionaries_mut().session.add(s);
        }
        Ok(name)
    }

    /// Dictionary key, validated against the tables at the point of use.
    fn read_dictionary_name(&mut self) -> Result<NameRef, NbfxError> {
        let key = self.source.read_multi_byte_uint31()?;
        self.source.resolve_dictionary_key(key)?;
        Ok(NameRef::Dictionary(key))
    }

    // ------------------------------------------------------------ elements

    fn read_element(&mut self, tag: u8) -> Result<NodeKind, NbfxError> {
        let (prefix, local_name) = match tag {
            SHORT_ELEMENT => (NameRef::Empty, self.read_local_name()?),
            ELEMENT => (self.read_name()?, self.read_local_name()?),
            SHORT_DICTIONARY_ELEMENT => (NameRef::Empty, self.read_dictionary_name()?),
            DICTIONARY_ELEMENT => (self.read_name()?, self.read_dictionary_name()?),
            PREFIX_DICTIONARY_ELEMENT_A..=PREFIX_DICTIONARY_ELEMENT_Z => (
                NameRef::Letter(tag - PREFIX_DICTIONARY_ELEMENT_A),
                self.read_dictionary_name()?,
            ),
            PREFIX_ELEMENT_A..=PREFIX_ELEMENT_Z => (
                NameRef::Letter(tag - PREFIX_ELEMENT_A),
                self.read_local_name()?,
            ),
            _ => return Err(NbfxError::InvalidFormat),
        };

        self.depth += 1;
        if self.frames.len() < self.depth {
            self.frames.push(ElementFrame::default());
        }
        let frame = &mut self.frames[self.depth - 1];
        frame.prefix = prefix.clone();
        frame.local_name = local_name.clone();

        self.node.set(NodeKind::StartElement);
        self.node.prefix = prefix;
        self.node.local_name = local_name;

        // Attribute records follow until any other record begins.
        loop {
            let b = self.source.peek_byte()?;
            if !is_attribute_record(b) {
                break;
            }
            self.source.skip_byte()?;
            self.read_attribute(b)?;
        }
        Ok(NodeKind::StartElement)
    }

    fn emit_end_element(&mut self) -> Result<NodeKind, NbfxError> {
        if self.depth == 0 {
            return Err(NbfxError::InvalidFormat);
        }
        let frame = &mut self.frames[self.depth - 1];
        let prefix = std::mem::take(&mut frame.prefix);
        let local_name = std::mem::take(&mut frame.local_name);
        self.node.set(NodeKind::EndElement);
        self.node.prefix = prefix;
        self.node.local_name = local_name;
        self.depth -= 1;
        let depth = self.depth;
        self.ns_decls.retain(|d| d.depth <= depth);
        Ok(NodeKind::EndElement)
    }

    // ------------------------------------------------------------ attributes

    fn read_attribute(&mut self, tag: u8) -> Result<(), NbfxError> {
        match tag {
            SHORT_ATTRIBUTE => {
                let local_name = self.read_local_name()?;
                let value = self.read_attribute_value()?;
                self.push_attribute(NameRef::Empty, local_name, value, false);
            }
            ATTRIBUTE => {
                let prefix = self.read_name()?;
                let local_name = self.read_local_name()?;
                let value = self.read_attribute_value()?;
                self.push_attribute(prefix, local_name, value, false);
            }
            SHORT_DICTIONARY_ATTRIBUTE => {
                let local_name = self.read_dictionary_name()?;
                let value = self.read_attribute_value()?;
                self.push_attribute(NameRef::Empty, local_name, value, false);
            }
            DICTIONARY_ATTRIBUTE => {
                let prefix = self.read_name()?;
                let local_name = self.read_dictionary_name()?;
                let value = self.read_attribute_value()?;
                self.push_attribute(prefix, local_name, value, false);
            }
            PREFIX_DICTIONARY_ATTRIBUTE_A..=PREFIX_DICTIONARY_ATTRIBUTE_Z => {
                let prefix = NameRef::Letter(tag - PREFIX_DICTIONARY_ATTRIBUTE_A);
                let local_name = self.read_dictionary_name()?;
                let value = self.read_attribute_value()?;
                self.push_attribute(prefix, local_name, value, false);
            }
            PREFIX_ATTRIBUTE_A..=PREFIX_ATTRIBUTE_Z => {
                let prefix = NameRef::Letter(tag - PREFIX_ATTRIBUTE_A);
                let local_name = self.read_local_name()?;
                let value = self.read_attribute_value()?;
                self.push_attribute(prefix, local_name, value, false);
            }
            SHORT_XMLNS_ATTRIBUTE => {
                // xmlns="uri"
                let (slot, uri) = self.read_xmlns_uri()?;
                self.ns_decls.push(NsDecl {
                    depth: self.depth,
                    prefix: NameRef::Empty,
                    uri,
                });
                self.push_attribute(NameRef::Empty, NameRef::Inline("xmlns".into()), slot, true);
            }
            XMLNS_ATTRIBUTE => {
                // xmlns:prefix="uri"
                let declared = self.read_name()?;
                let (slot, uri) = self.read_xmlns_uri()?;
                self.ns_decls.push(NsDecl {
                    depth: self.depth,
                    prefix: declared.clone(),
                    uri,
                });
                self.push_attribute(NameRef::Inline("xmlns".into()), declared, slot, true);
            }
            SHORT_DICTIONARY_XMLNS_ATTRIBUTE => {
                let key = self.source.read_multi_byte_uint31()?;
                self.source.resolve_dictionary_key(key)?;
                self.ns_decls.push(NsDecl {
                    depth: self.depth,
                    prefix: NameRef::Empty,
                    uri: NsUri::Dictionary(key),
                });
                self.push_attribute(
                    NameRef::Empty,
                    NameRef::Inline("xmlns".into()),
                    ValueSlot::Dictionary { key },
                    true,
                );
            }
            DICTIONARY_XMLNS_ATTRIBUTE => {
                let declared = self.read_name()?;
                let key = self.source.read_multi_byte_uint31()?;
                self.source.resolve_dictionary_key(key)?;
                self.ns_decls.push(NsDecl {
                    depth: self.depth,
                    prefix: declared.clone(),
                    uri: NsUri::Dictionary(key),
                });
                self.push_attribute(
                    NameRef::Inline("xmlns".into()),
                    declared,
                    ValueSlot::Dictionary { key },
                    true,
                );
            }
            _ => return Err(NbfxError::InvalidFormat),
        }
        Ok(())
    }

    fn push_attribute(
        &mut self,
        prefix: NameRef,
        local_name: NameRef,
        value: ValueSlot,
        is_namespace: bool,
    ) {
        self.attributes.push(Attribute {
            prefix,
            local_name,
            value,
            is_namespace,
        });
    }

    fn read_xmlns_uri(&mut self) -> Result<(ValueSlot, NsUri), NbfxError> {
        let len = self.source.read_multi_byte_uint31()? as usize;
        let range = self.source.read_bytes(len)?;
        let text = std::str::from_utf8(self.source.bytes(range)?)
            .map_err(|_| NbfxError::InvalidFormat)?
            .to_string();
        // Inline URIs are interned like inline names; see read_local_name.
        self.source.dictionaries_mut().session.add(&text);
        Ok((
            ValueSlot::Raw {
                range,
                encoding: TextEncoding::Utf8,
            },
            NsUri::Inline(text),
        ))
    }

    /// One value record terminates an attribute; WithEndElement forms are
    /// not valid there.
    fn read_attribute_value(&mut self) -> Result<ValueSlot, NbfxError> {
        let tag = self.source.read_byte()?;
        if !is_text_record(tag) || text_closes_element(tag) {
            return Err(NbfxError::InvalidFormat);
        }
        self.read_value(text_base(tag), false)
    }

    // ------------------------------------------------------------ values

    /// Reads the payload of a text record into a value slot. Used for
    /// attribute values, list items and array entries; payloads here are
    /// atomic (never window-split).
    fn read_value(&mut self, base: u8, in_list: bool) -> Result<ValueSlot, NbfxError> {
        let slot = match base {
            ZERO_TEXT => ValueSlot::Constant(ConstantId::Zero),
            ONE_TEXT => ValueSlot::Constant(ConstantId::One),
            FALSE_TEXT => ValueSlot::Constant(ConstantId::False),
            TRUE_TEXT => ValueSlot::Constant(ConstantId::True),
            BOOL_TEXT => ValueSlot::Bool(self.source.read_byte()? != 0),
            INT8_TEXT => ValueSlot::Int8(self.source.read_int8()?),
            INT16_TEXT => ValueSlot::Int16(self.source.read_int16()?),
            INT32_TEXT => ValueSlot::Int32(self.source.read_int32()?),
            INT64_TEXT => ValueSlot::Int64(self.source.read_int64()?),
            UINT64_TEXT => ValueSlot::UInt64(self.source.read_uint64()?),
            FLOAT_TEXT => ValueSlot::Float(self.source.read_f32()?),
            DOUBLE_TEXT => ValueSlot::Double(self.source.read_f64()?),
            DECIMAL_TEXT => ValueSlot::Decimal(self.source.read_decimal()?),
            DATETIME_TEXT => ValueSlot::DateTime(self.source.read_datetime()?),
            TIMESPAN_TEXT => ValueSlot::TimeSpan(self.source.read_timespan()?),
            UUID_TEXT => ValueSlot::Guid(self.source.read_guid()?),
            UNIQUE_ID_TEXT => ValueSlot::UniqueId(self.source.read_unique_id()?),
            EMPTY_TEXT => ValueSlot::Empty,
            CHARS8_TEXT | CHARS16_TEXT | CHARS32_TEXT => {
                let len = self.read_text_length(base)?;
                ValueSlot::Raw {
                    range: self.source.read_bytes(len)?,
                    encoding: TextEncoding::Utf8,
                }
            }
            UNICODE_CHARS8_TEXT | UNICODE_CHARS16_TEXT | UNICODE_CHARS32_TEXT => {
                let len = self.read_text_length(base)?;
                ValueSlot::Raw {
                    range: self.source.read_bytes(len)?,
                    encoding: TextEncoding::Utf16,
                }
            }
            BYTES8_TEXT | BYTES16_TEXT | BYTES32_TEXT => {
                let len = self.read_text_length(base)?;
                ValueSlot::Binary {
                    range: self.source.read_bytes(len)?,
                }
            }
            DICTIONARY_TEXT => {
                let key = self.source.read_multi_byte_uint31()?;
                self.source.resolve_dictionary_key(key)?;
                ValueSlot::Dictionary { key }
            }
            QNAME_DICTIONARY_TEXT => {
                let prefix = self.source.read_byte()?;
                if prefix >= PREFIX_LETTERS {
                    return Err(NbfxError::InvalidFormat);
                }
                let key = self.source.read_multi_byte_uint31()?;
                self.source.resolve_dictionary_key(key)?;
                ValueSlot::QName { prefix, key }
            }
            START_LIST_TEXT => {
                if in_list {
                    return Err(NbfxError::InvalidFormat);
                }
                let mut items = Vec::new();
                loop {
                    let tag = self.source.read_byte()?;
                    if !is_text_record(tag) || text_closes_element(tag) {
                        return Err(NbfxError::InvalidFormat);
                    }
                    let base = text_base(tag);
                    if base == END_LIST_TEXT {
                        break;
                    }
                    items.push(self.read_value(base, true)?);
                }
                ValueSlot::List(items)
            }
            _ => return Err(NbfxError::InvalidFormat),
        };
        Ok(slot)
    }

    /// Length field for the 8/16/32-bit tiers of a chars/bytes record.
    fn read_text_length(&mut self, base: u8) -> Result<usize, NbfxError> {
        match base {
            CHARS8_TEXT | BYTES8_TEXT | UNICODE_CHARS8_TEXT => {
                Ok(self.source.read_byte()? as usize)
            }
            CHARS16_TEXT | BYTES16_TEXT | UNICODE_CHARS16_TEXT => {
                let range = self.source.read_bytes(2)?;
                let b = self.source.bytes(range)?;
                Ok(u16::from_le_bytes([b[0], b[1]]) as usize)
            }
            CHARS32_TEXT | BYTES32_TEXT | UNICODE_CHARS32_TEXT => {
                let len = self.source.read_int32()?;
                if len < 0 {
                    return Err(NbfxError::InvalidFormat);
                }
                Ok(len as usize)
            }
            _ => Err(NbfxError::InvalidFormat),
        }
    }

    // ------------------------------------------------------------ text

    fn read_text(&mut self, tag: u8) -> Result<NodeKind, NbfxError> {
        let base = text_base(tag);
        let closes = text_closes_element(tag);
        match base {
            CHARS8_TEXT | CHARS16_TEXT | CHARS32_TEXT | UNICODE_CHARS8_TEXT
            | UNICODE_CHARS16_TEXT | UNICODE_CHARS32_TEXT | BYTES8_TEXT | BYTES16_TEXT
            | BYTES32_TEXT => self.read_run_text(base, closes),
            START_LIST_TEXT | END_LIST_TEXT if closes => Err(NbfxError::InvalidFormat),
            END_LIST_TEXT => Err(NbfxError::InvalidFormat),
            _ => {
                let value = self.read_value(base, false)?;
                self.pending_end_element = closes;
                self.emit_text(value)
            }
        }
    }

    fn emit_text(&mut self, value: ValueSlot) -> Result<NodeKind, NbfxError> {
        let whitespace = match &value {
            ValueSlot::Raw { .. } => value.is_whitespace_only(&self.source)?,
            _ => false,
        };
        let kind = if whitespace {
            NodeKind::Whitespace
        } else {
            NodeKind::Text
        };
        self.node.set(kind);
        self.node.value = value;
        Ok(kind)
    }

    /// A chars/bytes run at content level. When only a bounded window of
    /// bytes is available and the run is longer, the safe prefix is emitted
    /// and a shortened record head for the remainder is spliced back into
    /// the stream, so the next read continues the same logical run.
    fn read_run_text(&mut self, base: u8, closes: bool) -> Result<NodeKind, NbfxError> {
        let len = self.read_text_length(base)?;
        if self.source.is_streamed() {
            self.source.set_window(self.source.offset(), self.window_size);
        }
        let window = self.source.window_remaining();
        let encoding = match base {
            CHARS8_TEXT | CHARS16_TEXT | CHARS32_TEXT => Some(TextEncoding::Utf8),
            UNICODE_CHARS8_TEXT | UNICODE_CHARS16_TEXT | UNICODE_CHARS32_TEXT => {
                Some(TextEncoding::Utf16)
            }
            _ => None,
        };

        if len <= window {
            let range = self.source.read_bytes(len)?;
            let value = match encoding {
                Some(encoding) => ValueSlot::Raw { range, encoding },
                None => ValueSlot::Binary { range },
            };
            self.pending_end_element = closes;
            return self.emit_text(value);
        }

        // Split: take as much as fits without breaking a character (or a
        // base64 triplet), then resynthesize the remainder's record head.
        let take = match encoding {
            Some(TextEncoding::Utf16) => {
                let probe = len.min(window.saturating_add(4));
                self.source.ensure_payload(probe)?;
                let start = self.source.offset();
                let bytes = self.source.bytes(ByteRange::new(start, probe))?;
                utf16_boundary_back_off(bytes, window)
            }
            Some(_) => {
                let probe = len.min(window.saturating_add(3));
                self.source.ensure_payload(probe)?;
                let start = self.source.offset();
                let bytes = self.source.bytes(ByteRange::new(start, probe))?;
                utf8_boundary_back_off(bytes, window)
            }
            None => {
                // Binary aligns to a multiple of three so every chunk maps
                // to whole base64 quads.
                (window.div_ceil(3) * 3).max(3)
            }
        };
        let take = take.min(len);
        if take == 0 {
            return Err(NbfxError::InvalidFormat);
        }

        let range = self.source.read_bytes(take)?;
        let remaining = len - take;
        let value = match encoding {
            Some(encoding) => ValueSlot::Raw { range, encoding },
            None => ValueSlot::Binary { range },
        };

        if remaining > 0 {
            let tier8 = match encoding {
                Some(TextEncoding::Utf16) => UNICODE_CHARS8_TEXT,
                Some(_) => CHARS8_TEXT,
                None => BYTES8_TEXT,
            };
            let close_bit = if closes { WITH_END_ELEMENT } else { 0 };
            let mut head = Vec::with_capacity(5);
            if remaining <= 0xff {
                head.push(tier8 | close_bit);
                head.push(remaining as u8);
            } else if remaining <= 0xffff {
                head.push((tier8 + 2) | close_bit);
                head.extend_from_slice(&(remaining as u16).to_le_bytes());
            } else {
                head.push((tier8 + 4) | close_bit);
                head.extend_from_slice(&(remaining as i32).to_le_bytes());
            }
            self.source.insert_bytes(&head)?;
        } else {
            self.pending_end_element = closes;
        }
        self.emit_text(value)
    }

    // ------------------------------------------------------------ comments

    fn read_comment(&mut self) -> Result<NodeKind, NbfxError> {
        let len = self.source.read_multi_byte_uint31()? as usize;
        let range = self.source.read_bytes(len)?;
        self.node.set(NodeKind::Comment);
        self.node.value = ValueSlot::Raw {
            range,
            encoding: TextEncoding::Utf8,
        };
        Ok(NodeKind::Comment)
    }

    // ------------------------------------------------------------ arrays

    /// Array record: one element shape, a value type from the scalar
    /// allow-list, a nonzero count, then the untagged payloads.
    fn read_array_header(&mut self) -> Result<NodeKind, NbfxError> {
        let tag = self.source.read_byte()?;
        if !is_element_record(tag) {
            return Err(NbfxError::InvalidFormat);
        }
        self.read_element(tag)?;
        if self.source.read_byte()? != END_ELEMENT {
            return Err(NbfxError::InvalidFormat);
        }
        let value_type = self.source.read_byte()?;
        if !is_array_value_type(value_type) {
            return Err(NbfxError::InvalidFormat);
        }
        let count = self.source.read_multi_byte_uint31()?;
        if count == 0 {
            return Err(NbfxError::InvalidFormat);
        }
        let frame = &self.frames[self.depth - 1];
        self.array = Some(ArrayRun {
            value_type,
            remaining: count,
            prefix: frame.prefix.clone(),
            local_name: frame.local_name.clone(),
            phase: ArrayPhase::Value,
        });
        // The shape element itself was just emitted as the first entry's
        // StartElement.
        Ok(NodeKind::StartElement)
    }

    fn read_array_step(&mut self) -> Result<NodeKind, NbfxError> {
        let Some(mut run) = self.array.take() else {
            return Err(NbfxError::InvalidFormat);
        };
        let result = match run.phase {
            ArrayPhase::Start => {
                self.depth += 1;
                if self.frames.len() < self.depth {
                    self.frames.push(ElementFrame::default());
                }
                let frame = &mut self.frames[self.depth - 1];
                frame.prefix = run.prefix.clone();
                frame.local_name = run.local_name.clone();
                self.node.set(NodeKind::StartElement);
                self.node.prefix = run.prefix.clone();
                self.node.local_name = run.local_name.clone();
                run.phase = ArrayPhase::Value;
                Ok(NodeKind::StartElement)
            }
            ArrayPhase::Value => {
                let value = self.read_value(text_base(run.value_type), false)?;
                self.node.set(NodeKind::Text);
                self.node.value = value;
                run.phase = ArrayPhase::End;
                Ok(NodeKind::Text)
            }
            ArrayPhase::End => {
                let kind = self.emit_end_element()?;
                run.remaining -= 1;
                run.phase = ArrayPhase::Start;
                if run.remaining == 0 {
                    self.array = None;
                    return Ok(kind);
                }
                Ok(kind)
            }
        };
        if result.is_ok() {
            self.array = Some(run);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::StringTable;

    fn collect(decoder: &mut BinaryDecoder<'_>) -> Vec<NodeKind> {
        let mut kinds = Vec::new();
        loop {
            let kind = decoder.read().unwrap();
            if kind == NodeKind::EndOfFile {
                return kinds;
            }
            kinds.push(kind);
        }
    }

    #[test]
    fn short_element_roundtrip() {
        // <doc/>
        let data = [0x40, 3, b'd', b'o', b'c', 0x01];
        let mut decoder = BinaryDecoder::from_buffer(&data);
        assert_eq!(decoder.read().unwrap(), NodeKind::StartElement);
        assert_eq!(decoder.local_name().unwrap(), "doc");
        assert_eq!(decoder.depth(), 1);
        assert_eq!(decoder.read().unwrap(), NodeKind::EndElement);
        assert_eq!(decoder.local_name().unwrap(), "doc");
        assert_eq!(decoder.read().unwrap(), NodeKind::EndOfFile);
        // EndOfFile is sticky.
        assert_eq!(decoder.read().unwrap(), NodeKind::EndOfFile);
    }

    #[test]
    fn chars8_text_content() {
        let data = [0x40, 1, b'a', CHARS8_TEXT, 5, b'h', b'e', b'l', b'l', b'o', 0x01];
        let mut decoder = BinaryDecoder::from_buffer(&data);
        assert_eq!(decoder.read().unwrap(), NodeKind::StartElement);
        assert_eq!(decoder.read().unwrap(), NodeKind::Text);
        assert_eq!(decoder.value().to_text(decoder.source()).unwrap(), "hello");
        assert_eq!(decoder.read().unwrap(), NodeKind::EndElement);
    }

    #[test]
    fn zero_text_with_end_element_synthesizes_close() {
        let data = [0x40, 1, b'a', ZERO_TEXT | WITH_END_ELEMENT];
        let mut decoder = BinaryDecoder::from_buffer(&data);
        assert_eq!(decoder.read().unwrap(), NodeKind::StartElement);
        assert_eq!(decoder.read().unwrap(), NodeKind::Text);
        assert_eq!(decoder.value().to_text(decoder.source()).unwrap(), "0");
        // No record byte backs this close.
        assert_eq!(decoder.read().unwrap(), NodeKind::EndElement);
        assert_eq!(decoder.read().unwrap(), NodeKind::EndOfFile);
    }

    #[test]
    fn prefixed_element_fast_path() {
        // 0x5e + 1 = prefix 'b'
        let data = [0x5f, 1, b'x', 0x01];
        let mut decoder = BinaryDecoder::from_buffer(&data);
        decoder.read().unwrap();
        assert_eq!(decoder.prefix().unwrap(), "b");
        assert_eq!(decoder.local_name().unwrap(), "x");
    }

    #[test]
    fn dictionary_element_resolution() {
        let statics = StringTable::from_strings(["Envelope"]);
        let data = [SHORT_DICTIONARY_ELEMENT, 0x00, 0x01];
        let mut decoder = BinaryDecoder::from_buffer(&data)
            .with_dictionaries(Dictionaries::with_statics(statics));
        decoder.read().unwrap();
        assert_eq!(decoder.local_name().unwrap(), "Envelope");
    }

    #[test]
    fn undefined_dictionary_key_is_fatal() {
        // Session key 5 (index 2) was never taught.
        let data = [SHORT_DICTIONARY_ELEMENT, 0x05, 0x01];
        let mut decoder = BinaryDecoder::from_buffer(&data);
        assert_eq!(
            decoder.read(),
            Err(NbfxError::UndefinedDictionaryKey(5))
        );
    }

    #[test]
    fn taught_session_key_resolves() {
        let data = [SHORT_DICTIONARY_ELEMENT, 0x01, 0x01];
        let mut decoder = BinaryDecoder::from_buffer(&data);
        let key = decoder.add_session_string("Action");
        assert_eq!(key, 1);
        decoder.read().unwrap();
        assert_eq!(decoder.local_name().unwrap(), "Action");
    }

    #[test]
    fn attributes_and_namespaces() {
        let mut data = vec![0x40, 1, b'a'];
        // id="1"
        data.extend_from_slice(&[SHORT_ATTRIBUTE, 2, b'i', b'd', ONE_TEXT]);
        // xmlns:p="urn:x"
        data.extend_from_slice(&[XMLNS_ATTRIBUTE, 1, b'p']);
        data.push(5);
        data.extend_from_slice(b"urn:x");
        data.push(0x01);
        let mut decoder = BinaryDecoder::from_buffer(&data);
        assert_eq!(decoder.read().unwrap(), NodeKind::StartElement);
        let attrs = decoder.attributes();
        assert_eq!(attrs.len(), 2);
        assert!(attrs[0].local_name.matches(decoder.source(), "id").unwrap());
        assert_eq!(
            attrs[0].value.to_text(decoder.source()).unwrap(),
            "1"
        );
        assert!(attrs[1].is_namespace);
        assert_eq!(decoder.resolve_namespace("p").unwrap(), "urn:x");
        assert_eq!(decoder.resolve_namespace("q"), None);
        // Declarations go out of scope with their element.
        assert_eq!(decoder.read().unwrap(), NodeKind::EndElement);
        assert_eq!(decoder.resolve_namespace("p"), None);
    }

    #[test]
    fn attribute_value_with_end_element_is_invalid() {
        let data = [0x40, 1, b'a', SHORT_ATTRIBUTE, 1, b'b', ZERO_TEXT | WITH_END_ELEMENT];
        let mut decoder = BinaryDecoder::from_buffer(&data);
        assert_eq!(decoder.read(), Err(NbfxError::InvalidFormat));
    }

    #[test]
    fn typed_text_records() {
        let mut data = vec![0x40, 1, b'a', INT32_TEXT];
        data.extend_from_slice(&123456i32.to_le_bytes());
        data.push(0x01);
        let mut decoder = BinaryDecoder::from_buffer(&data);
        decoder.read().unwrap();
        assert_eq!(decoder.read().unwrap(), NodeKind::Text);
        assert_eq!(decoder.value().to_int32(decoder.source()).unwrap(), 123456);
    }

    #[test]
    fn whitespace_classification_of_text() {
        let data = [0x40, 1, b'a', CHARS8_TEXT, 2, b' ', b'\n', 0x01];
        let mut decoder = BinaryDecoder::from_buffer(&data);
        decoder.read().unwrap();
        assert_eq!(decoder.read().unwrap(), NodeKind::Whitespace);
    }

    #[test]
    fn comment_node() {
        let mut data = vec![COMMENT, 4];
        data.extend_from_slice(b"note");
        let mut decoder = BinaryDecoder::from_buffer(&data);
        assert_eq!(decoder.read().unwrap(), NodeKind::Comment);
        assert_eq!(decoder.value().to_text(decoder.source()).unwrap(), "note");
        assert_eq!(decoder.read().unwrap(), NodeKind::EndOfFile);
    }

    #[test]
    fn list_value_in_attribute() {
        let data = [
            0x40, 1, b'a', SHORT_ATTRIBUTE, 1, b'l', START_LIST_TEXT, ONE_TEXT, ZERO_TEXT,
            END_LIST_TEXT, 0x01,
        ];
        let mut decoder = BinaryDecoder::from_buffer(&data);
        decoder.read().unwrap();
        let attrs = decoder.attributes();
        let items = attrs[0].value.as_list().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(attrs[0].value.to_text(decoder.source()).unwrap(), "1 0");
    }

    #[test]
    fn array_fast_path_replays_shape() {
        let mut data = vec![ARRAY, 0x40, 1, b'x', 0x01, INT32_TEXT | WITH_END_ELEMENT, 3];
        for v in [10i32, 20, 30] {
            data.extend_from_slice(&v.to_le_bytes());
        }
        let mut decoder = BinaryDecoder::from_buffer(&data);
        let mut values = Vec::new();
        for _ in 0..3 {
            assert_eq!(decoder.read().unwrap(), NodeKind::StartElement);
            assert_eq!(decoder.local_name().unwrap(), "x");
            assert_eq!(decoder.read().unwrap(), NodeKind::Text);
            values.push(decoder.value().to_int32(decoder.source()).unwrap());
            assert_eq!(decoder.read().unwrap(), NodeKind::EndElement);
            assert_eq!(decoder.local_name().unwrap(), "x");
        }
        assert_eq!(values, vec![10, 20, 30]);
        assert_eq!(decoder.read().unwrap(), NodeKind::EndOfFile);
    }

    #[test]
    fn array_count_zero_is_invalid() {
        let data = [ARRAY, 0x40, 1, b'x', 0x01, INT32_TEXT | WITH_END_ELEMENT, 0];
        let mut decoder = BinaryDecoder::from_buffer(&data);
        assert_eq!(decoder.read(), Err(NbfxError::InvalidFormat));
    }

    #[test]
    fn array_type_must_be_on_allow_list() {
        let data = [ARRAY, 0x40, 1, b'x', 0x01, CHARS8_TEXT | WITH_END_ELEMENT, 1];
        let mut decoder = BinaryDecoder::from_buffer(&data);
        assert_eq!(decoder.read(), Err(NbfxError::InvalidFormat));
    }

    #[test]
    fn unbalanced_end_element_is_invalid() {
        let data = [0x01];
        let mut decoder = BinaryDecoder::from_buffer(&data);
        assert_eq!(decoder.read(), Err(NbfxError::InvalidFormat));
    }

    #[test]
    fn truncated_element_name() {
        let data = [0x40, 3, b'd'];
        let mut decoder = BinaryDecoder::from_buffer(&data);
        assert_eq!(decoder.read(), Err(NbfxError::UnexpectedEndOfInput));
    }

    #[test]
    fn eof_inside_open_element() {
        let data = [0x40, 1, b'a'];
        let mut decoder = BinaryDecoder::from_buffer(&data);
        decoder.read().unwrap();
        assert_eq!(decoder.read(), Err(NbfxError::UnexpectedEndOfInput));
    }

    #[test]
    fn text_at_root_depth_is_invalid() {
        let data = [ZERO_TEXT];
        let mut decoder = BinaryDecoder::from_buffer(&data);
        assert_eq!(decoder.read(), Err(NbfxError::InvalidFormat));
    }

    #[test]
    fn use_after_close() {
        let data = [0x40, 1, b'a', 0x01];
        let mut decoder = BinaryDecoder::from_buffer(&data);
        decoder.read().unwrap();
        decoder.close();
        assert_eq!(decoder.read(), Err(NbfxError::UseAfterClose));
        assert_eq!(
            decoder.read_value_chars(10),
            Err(NbfxError::UseAfterClose)
        );
    }

    #[test]
    fn nested_elements_track_depth() {
        let data = [
            0x40, 1, b'a', 0x40, 1, b'b', 0x01, 0x40, 1, b'c', 0x01, 0x01,
        ];
        let mut decoder = BinaryDecoder::from_buffer(&data);
        let kinds = collect(&mut decoder);
        assert_eq!(
            kinds,
            vec![
                NodeKind::StartElement,
                NodeKind::StartElement,
                NodeKind::EndElement,
                NodeKind::StartElement,
                NodeKind::EndElement,
                NodeKind::EndElement,
            ]
        );
    }
}
