//! The decoder's externally visible unit: one node per read step.

use std::borrow::Cow;

use crate::error::NbfxError;
use crate::source::ByteSource;
use crate::value::ValueSlot;

/// Discriminated kind of a decoded node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeKind {
    /// No node has been read yet.
    #[default]
    None,
    StartElement,
    EndElement,
    Attribute,
    Text,
    /// CDATA sections exist in the shared event model; the binary wire
    /// format writes them as plain text.
    Cdata,
    /// Text consisting only of XML whitespace.
    Whitespace,
    Comment,
    /// The XML declaration; never produced by the binary decoder.
    Declaration,
    EndOfFile,
}

/// A prefix or local name in its cheapest available form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum NameRef {
    #[default]
    Empty,
    /// One-letter lowercase prefix from the reserved record ranges
    /// (0 = 'a' .. 25 = 'z').
    Letter(u8),
    Inline(String),
    /// A raw dictionary key.
    Dictionary(u32),
}

impl NameRef {
    pub fn is_empty(&self) -> bool {
        matches!(self, NameRef::Empty)
    }

    /// Text of the name. Dictionary keys resolve against the source.
    pub fn as_text<'s>(&'s self, src: &'s ByteSource) -> Result<Cow<'s, str>, NbfxError> {
        match self {
            NameRef::Empty => Ok(Cow::Borrowed("")),
            NameRef::Letter(n) => Ok(Cow::Owned(((b'a' + n) as char).to_string())),
            NameRef::Inline(s) => Ok(Cow::Borrowed(s)),
            NameRef::Dictionary(key) => src.resolve_dictionary_key(*key).map(Cow::Borrowed),
        }
    }

    /// Name comparison without materializing dictionary strings the caller
    /// already has.
    pub fn matches(&self, src: &ByteSource, text: &str) -> Result<bool, NbfxError> {
        match self {
            NameRef::Empty => Ok(text.is_empty()),
            NameRef::Letter(n) => Ok(text.as_bytes() == [b'a' + n]),
            NameRef::Inline(s) => Ok(s == text),
            NameRef::Dictionary(key) => Ok(src.resolve_dictionary_key(*key)? == text),
        }
    }
}

/// One attribute of the current element.
#[derive(Debug, Clone, Default)]
pub struct Attribute {
    pub prefix: NameRef,
    pub local_name: NameRef,
    pub value: ValueSlot,
    /// Set for `xmlns` / `xmlns:prefix` declarations.
    pub is_namespace: bool,
}

/// The node produced by one read step. Byte ranges referenced by the value
/// belong to the source; the node is valid only until the next read.
#[derive(Debug, Clone, Default)]
pub struct Node {
    pub kind: NodeKind,
    pub prefix: NameRef,
    pub local_name: NameRef,
    pub value: ValueSlot,
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub(crate) fn set(&mut self, kind: NodeKind) {
        self.kind = kind;
        self.prefix = NameRef::Empty;
        self.local_name = NameRef::Empty;
        self.value = ValueSlot::Empty;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_ref_text_forms() {
        let src = ByteSource::from_buffer(b"");
        assert_eq!(NameRef::Empty.as_text(&src).unwrap(), "");
        assert_eq!(NameRef::Letter(0).as_text(&src).unwrap(), "a");
        assert_eq!(NameRef::Letter(25).as_text(&src).unwrap(), "z");
        assert_eq!(
            NameRef::Inline("Body".to_string()).as_text(&src).unwrap(),
            "Body"
        );
    }

    #[test]
    fn name_ref_dictionary_resolution() {
        let mut src = ByteSource::from_buffer(b"");
        src.dictionaries_mut().statics.add("Envelope");
        let name = NameRef::Dictionary(0);
        assert_eq!(name.as_text(&src).unwrap(), "Envelope");
        assert!(name.matches(&src, "Envelope").unwrap());
        assert!(!name.matches(&src, "Body").unwrap());
        let missing = NameRef::Dictionary(7);
        assert_eq!(
            missing.as_text(&src),
            Err(NbfxError::UndefinedDictionaryKey(7))
        );
    }

    #[test]
    fn node_reset_clears_content() {
        let mut node = Node::default();
        node.local_name = NameRef::Inline("x".into());
        node.value = ValueSlot::Int32(5);
        node.set(NodeKind::Text);
        assert_eq!(node.kind(), NodeKind::Text);
        assert!(node.local_name.is_empty());
        assert!(node.value.is_empty());
    }
}
