//! Byte source servicing both fully-buffered and incrementally-streamed
//! input.
//!
//! A [`ByteSource`] owns either a borrowed byte buffer or a pull-based
//! stream with a growable backing buffer. Reads hand out validated
//! [`ByteRange`]s rather than slices so decoded values can stay as raw bytes
//! until a caller materializes them. In streamed mode a movable window
//! bounds how many payload bytes one decode step may consume before
//! yielding; fixed-width fields are atomic and always refill to completion.

use std::io::Read;

use crate::dictionary::Dictionaries;
use crate::error::NbfxError;
use crate::types::{DateTime, Decimal, Guid, TimeSpan, UniqueId};

/// Stream refill chunk size.
const REFILL_CHUNK: usize = 4096;

/// Consumed-byte threshold past which the stream backing buffer is
/// compacted when the window moves.
const COMPACT_THRESHOLD: usize = 8192;

/// A validated `[offset, offset + length)` range in the source's backing
/// storage. Ranges stay valid until the window moves past them; the decoder
/// guarantees that does not happen before the next read step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ByteRange {
    pub offset: usize,
    pub length: usize,
}

impl ByteRange {
    pub fn new(offset: usize, length: usize) -> Self {
        Self { offset, length }
    }

    pub fn end(&self) -> usize {
        self.offset + self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Splits off the first `n` bytes, leaving the remainder in `self`.
    pub fn take_front(&mut self, n: usize) -> ByteRange {
        let n = n.min(self.length);
        let front = ByteRange::new(self.offset, n);
        self.offset += n;
        self.length -= n;
        front
    }
}

enum Backing<'a> {
    Buffer(&'a [u8]),
    Stream {
        stream: Box<dyn Read + 'a>,
        buf: Vec<u8>,
        exhausted: bool,
    },
}

/// Bounds-checked random/sequential access over a buffer or stream, plus
/// the primitive field decoders of the wire format. All multi-byte fixed
/// fields are little-endian.
pub struct ByteSource<'a> {
    backing: Backing<'a>,
    /// Next unread position.
    offset: usize,
    /// Start of the live window.
    window_start: usize,
    /// How far past `window_start` payload reads may advance before the
    /// decoder must yield. `usize::MAX` in buffered mode.
    window_limit: usize,
    dicts: Dictionaries,
}

impl<'a> ByteSource<'a> {
    /// Creates a source over a fully-buffered document.
    pub fn from_buffer(data: &'a [u8]) -> Self {
        Self {
            backing: Backing::Buffer(data),
            offset: 0,
            window_start: 0,
            window_limit: usize::MAX,
            dicts: Dictionaries::new(),
        }
    }

    /// Creates a source over a pull-based stream. Reads block until the
    /// stream produces data or ends.
    pub fn from_stream(stream: impl Read + 'a) -> Self {
        Self {
            backing: Backing::Stream {
                stream: Box::new(stream),
                buf: Vec::new(),
                exhausted: false,
            },
            offset: 0,
            window_start: 0,
            window_limit: 0,
            dicts: Dictionaries::new(),
        }
    }

    pub fn with_dictionaries(mut self, dicts: Dictionaries) -> Self {
        self.dicts = dicts;
        self
    }

    pub fn dictionaries(&self) -> &Dictionaries {
        &self.dicts
    }

    pub fn dictionaries_mut(&mut self) -> &mut Dictionaries {
        &mut self.dicts
    }

    /// Rebinds a buffered source to a new document, keeping dictionaries.
    pub fn reset_buffer(&mut self, data: &'a [u8]) {
        self.backing = Backing::Buffer(data);
        self.offset = 0;
        self.window_start = 0;
        self.window_limit = usize::MAX;
    }

    pub fn is_streamed(&self) -> bool {
        matches!(self.backing, Backing::Stream { .. })
    }

    fn data(&self) -> &[u8] {
        match &self.backing {
            Backing::Buffer(data) => data,
            Backing::Stream { buf, .. } => buf,
        }
    }

    /// Next unread position.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// End of currently valid data. Only ever increases between resets.
    pub fn offset_max(&self) -> usize {
        self.data().len()
    }

    /// Pulls from the stream until at least `needed` total bytes are valid.
    fn refill(&mut self, needed: usize) -> Result<(), NbfxError> {
        match &mut self.backing {
            Backing::Buffer(_) => Err(NbfxError::UnexpectedEndOfInput),
            Backing::Stream {
                stream,
                buf,
                exhausted,
            } => {
                let mut chunk = [0u8; REFILL_CHUNK];
                while buf.len() < needed && !*exhausted {
                    let n = stream.read(&mut chunk)?;
                    if n == 0 {
                        *exhausted = true;
                    } else {
                        buf.extend_from_slice(&chunk[..n]);
                    }
                }
                if buf.len() < needed {
                    Err(NbfxError::UnexpectedEndOfInput)
                } else {
                    Ok(())
                }
            }
        }
    }

    fn ensure(&mut self, n: usize) -> Result<(), NbfxError> {
        if self.offset + n <= self.data().len() {
            return Ok(());
        }
        self.refill(self.offset + n)
    }

    /// Whether at least one more byte exists, refilling if necessary.
    pub fn has_byte(&mut self) -> Result<bool, NbfxError> {
        match self.ensure(1) {
            Ok(()) => Ok(true),
            Err(NbfxError::UnexpectedEndOfInput) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn peek_byte(&mut self) -> Result<u8, NbfxError> {
        self.ensure(1)?;
        Ok(self.data()[self.offset])
    }

    pub fn skip_byte(&mut self) -> Result<(), NbfxError> {
        self.ensure(1)?;
        self.offset += 1;
        Ok(())
    }

    pub fn read_byte(&mut self) -> Result<u8, NbfxError> {
        self.ensure(1)?;
        let b = self.data()[self.offset];
        self.offset += 1;
        Ok(b)
    }

    /// Returns a validated range of the next `n` bytes and advances past it.
    pub fn read_bytes(&mut self, n: usize) -> Result<ByteRange, NbfxError> {
        self.ensure(n)?;
        let range = ByteRange::new(self.offset, n);
        self.offset += n;
        Ok(range)
    }

    /// Resolves a previously returned range.
    pub fn bytes(&self, range: ByteRange) -> Result<&[u8], NbfxError> {
        let data = self.data();
        if range.end() > data.len() {
            return Err(NbfxError::UnexpectedEndOfInput);
        }
        Ok(&data[range.offset..range.end()])
    }

    /// Relocates the live window. The caller may consume up to `length`
    /// payload bytes from `start` before the next relocation is required.
    /// Stream bytes ahead of the new window start are compacted away once
    /// enough of them accumulate.
    pub fn set_window(&mut self, start: usize, length: usize) {
        self.window_start = start;
        self.window_limit = start.saturating_add(length);
        if let Backing::Stream { buf, .. } = &mut self.backing {
            let consumed = self.window_start.min(self.offset);
            if consumed >= COMPACT_THRESHOLD || (consumed > 0 && consumed * 2 >= buf.len()) {
                buf.drain(..consumed);
                self.offset -= consumed;
                self.window_start -= consumed;
                self.window_limit -= consumed;
            }
        }
    }

    /// Payload bytes still available to the current decode step.
    pub fn window_remaining(&self) -> usize {
        if self.window_limit == usize::MAX {
            return usize::MAX;
        }
        self.window_limit.saturating_sub(self.offset)
    }

    /// Makes sure the next `n` payload bytes are resident, refilling from
    /// the stream as needed. `n` must already respect the window.
    pub fn ensure_payload(&mut self, n: usize) -> Result<(), NbfxError> {
        self.ensure(n)
    }

    /// Splices bytes into the stream directly ahead of the current
    /// position. Used to resynthesize a shortened record head after a
    /// bounded payload read.
    pub fn insert_bytes(&mut self, bytes: &[u8]) -> Result<(), NbfxError> {
        match &mut self.backing {
            Backing::Buffer(_) => Err(NbfxError::InvalidOperation(
                "cannot insert into a buffered source",
            )),
            Backing::Stream { buf, .. } => {
                buf.splice(self.offset..self.offset, bytes.iter().copied());
                if self.window_limit != usize::MAX {
                    self.window_limit += bytes.len();
                }
                Ok(())
            }
        }
    }

    /// Releases oversized buffers. The owning codec rejects further use.
    pub fn close(&mut self) {
        if let Backing::Stream { buf, .. } = &mut self.backing {
            *buf = Vec::new();
        }
        self.offset = 0;
        self.window_start = 0;
        self.window_limit = 0;
    }

    // ------------------------------------------------------------ fields

    pub fn read_int8(&mut self) -> Result<i8, NbfxError> {
        Ok(self.read_byte()? as i8)
    }

    pub fn read_int16(&mut self) -> Result<i16, NbfxError> {
        let range = self.read_bytes(2)?;
        let b = self.bytes(range)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_int32(&mut self) -> Result<i32, NbfxError> {
        let range = self.read_bytes(4)?;
        let b = self.bytes(range)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_int64(&mut self) -> Result<i64, NbfxError> {
        let range = self.read_bytes(8)?;
        let b = self.bytes(range)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(b);
        Ok(i64::from_le_bytes(bytes))
    }

    pub fn read_uint64(&mut self) -> Result<u64, NbfxError> {
        Ok(self.read_int64()? as u64)
    }

    pub fn read_f32(&mut self) -> Result<f32, NbfxError> {
        Ok(f32::from_bits(self.read_int32()? as u32))
    }

    pub fn read_f64(&mut self) -> Result<f64, NbfxError> {
        Ok(f64::from_bits(self.read_int64()? as u64))
    }

    pub fn read_decimal(&mut self) -> Result<Decimal, NbfxError> {
        let range = self.read_bytes(16)?;
        let b = self.bytes(range)?;
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(b);
        Ok(Decimal::from_le_bytes(bytes))
    }

    pub fn read_guid(&mut self) -> Result<Guid, NbfxError> {
        let range = self.read_bytes(16)?;
        let b = self.bytes(range)?;
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(b);
        Ok(Guid::from_bytes(bytes))
    }

    pub fn read_unique_id(&mut self) -> Result<UniqueId, NbfxError> {
        Ok(UniqueId(self.read_guid()?))
    }

    pub fn read_datetime(&mut self) -> Result<DateTime, NbfxError> {
        Ok(DateTime::from_raw(self.read_int64()?))
    }

    pub fn read_timespan(&mut self) -> Result<TimeSpan, NbfxError> {
        Ok(TimeSpan::from_ticks(self.read_int64()?))
    }

    /// Reads a 7-bits-per-byte, high-bit-continuation unsigned integer of
    /// at most 5 bytes. The top nibble of the fifth byte must be zero.
    pub fn read_multi_byte_uint31(&mut self) -> Result<u32, NbfxError> {
        let mut value: u32 = 0;
        let mut shift = 0;
        loop {
            let b = self.read_byte()?;
            if shift == 28 {
                if b & 0xf0 != 0 {
                    return Err(NbfxError::InvalidFormat);
                }
                return Ok(value | ((b as u32) << 28));
            }
            value |= ((b & 0x7f) as u32) << shift;
            if b & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    /// Resolves a raw dictionary key against the static or session table
    /// selected by its low bit.
    pub fn resolve_dictionary_key(&self, raw_key: u32) -> Result<&str, NbfxError> {
        self.dicts
            .resolve(raw_key)
            .ok_or(NbfxError::UndefinedDictionaryKey(raw_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::StringTable;

    #[test]
    fn buffered_sequential_reads() {
        let data = [0x01, 0x02, 0x03, 0x04];
        let mut src = ByteSource::from_buffer(&data);
        assert_eq!(src.peek_byte().unwrap(), 0x01);
        assert_eq!(src.read_byte().unwrap(), 0x01);
        assert_eq!(src.read_int16().unwrap(), 0x0302);
        assert_eq!(src.read_byte().unwrap(), 0x04);
        assert_eq!(src.read_byte(), Err(NbfxError::UnexpectedEndOfInput));
    }

    #[test]
    fn buffered_window_is_unbounded() {
        let data = [0u8; 4];
        let src = ByteSource::from_buffer(&data);
        assert_eq!(src.window_remaining(), usize::MAX);
    }

    #[test]
    fn ranges_resolve_after_the_read() {
        let data = b"abcdef";
        let mut src = ByteSource::from_buffer(data);
        let range = src.read_bytes(3).unwrap();
        assert_eq!(src.bytes(range).unwrap(), b"abc");
        assert_eq!(src.offset(), 3);
    }

    #[test]
    fn streamed_refill_on_demand() {
        let data: Vec<u8> = (0u8..100).collect();
        let mut src = ByteSource::from_stream(&data[..]);
        src.set_window(0, 64);
        assert_eq!(src.read_byte().unwrap(), 0);
        let range = src.read_bytes(9).unwrap();
        assert_eq!(src.bytes(range).unwrap(), &data[1..10]);
    }

    #[test]
    fn streamed_end_of_input() {
        let data = [0x01];
        let mut src = ByteSource::from_stream(&data[..]);
        assert!(src.has_byte().unwrap());
        assert_eq!(src.read_byte().unwrap(), 1);
        assert!(!src.has_byte().unwrap());
        assert_eq!(src.read_byte(), Err(NbfxError::UnexpectedEndOfInput));
    }

    #[test]
    fn fixed_fields_are_little_endian() {
        let mut data = Vec::new();
        data.extend_from_slice(&0x01020304i32.to_le_bytes());
        data.extend_from_slice(&(-5i64).to_le_bytes());
        data.extend_from_slice(&2.5f64.to_le_bytes());
        let mut src = ByteSource::from_buffer(&data);
        assert_eq!(src.read_int32().unwrap(), 0x01020304);
        assert_eq!(src.read_int64().unwrap(), -5);
        assert_eq!(src.read_f64().unwrap(), 2.5);
    }

    #[test]
    fn multi_byte_uint31_small_values() {
        let mut src = ByteSource::from_buffer(&[0x00]);
        assert_eq!(src.read_multi_byte_uint31().unwrap(), 0);
        let mut src = ByteSource::from_buffer(&[0x7f]);
        assert_eq!(src.read_multi_byte_uint31().unwrap(), 127);
        let mut src = ByteSource::from_buffer(&[0x80, 0x01]);
        assert_eq!(src.read_multi_byte_uint31().unwrap(), 128);
        let mut src = ByteSource::from_buffer(&[0xff, 0xff, 0x03]);
        assert_eq!(src.read_multi_byte_uint31().unwrap(), 0xffff);
    }

    #[test]
    fn multi_byte_uint31_five_bytes() {
        // 2^31 - 1
        let mut src = ByteSource::from_buffer(&[0xff, 0xff, 0xff, 0xff, 0x07]);
        assert_eq!(src.read_multi_byte_uint31().unwrap(), 0x7fff_ffff);
    }

    #[test]
    fn multi_byte_uint31_rejects_nonzero_top_nibble() {
        let mut src = ByteSource::from_buffer(&[0xff, 0xff, 0xff, 0xff, 0x10]);
        assert_eq!(src.read_multi_byte_uint31(), Err(NbfxError::InvalidFormat));
    }

    #[test]
    fn multi_byte_uint31_truncated() {
        let mut src = ByteSource::from_buffer(&[0x80]);
        assert_eq!(
            src.read_multi_byte_uint31(),
            Err(NbfxError::UnexpectedEndOfInput)
        );
    }

    #[test]
    fn insert_bytes_splices_ahead_of_offset() {
        let data = [0xaa, 0xbb];
        let mut src = ByteSource::from_stream(&data[..]);
        src.set_window(0, 16);
        assert_eq!(src.read_byte().unwrap(), 0xaa);
        src.insert_bytes(&[0x98, 0x01]).unwrap();
        assert_eq!(src.read_byte().unwrap(), 0x98);
        assert_eq!(src.read_byte().unwrap(), 0x01);
        assert_eq!(src.read_byte().unwrap(), 0xbb);
    }

    #[test]
    fn insert_bytes_rejected_for_buffers() {
        let data = [0u8; 2];
        let mut src = ByteSource::from_buffer(&data);
        assert!(matches!(
            src.insert_bytes(&[1]),
            Err(NbfxError::InvalidOperation(_))
        ));
    }

    #[test]
    fn window_compaction_preserves_unread_bytes() {
        let data: Vec<u8> = (0..200u8).cycle().take(20_000).collect();
        let mut src = ByteSource::from_stream(&data[..]);
        src.set_window(0, 10_000);
        let range = src.read_bytes(10_000).unwrap();
        assert_eq!(src.bytes(range).unwrap().len(), 10_000);
        // Move the window past the consumed region; compaction kicks in.
        src.set_window(src.offset(), 1024);
        assert_eq!(src.offset(), 0);
        assert_eq!(src.read_byte().unwrap(), data[10_000]);
        assert_eq!(src.window_remaining(), 1023);
    }

    #[test]
    fn dictionary_resolution() {
        let data = [0u8; 1];
        let mut src = ByteSource::from_buffer(&data);
        src.dictionaries_mut().statics = StringTable::from_strings(["Envelope"]);
        src.dictionaries_mut().session.add("Action");
        assert_eq!(src.resolve_dictionary_key(0).unwrap(), "Envelope");
        assert_eq!(src.resolve_dictionary_key(1).unwrap(), "Action");
        assert_eq!(
            src.resolve_dictionary_key(5),
            Err(NbfxError::UndefinedDictionaryKey(5))
        );
    }

    #[test]
    fn close_releases_stream_buffer() {
        let data = [1u8, 2, 3];
        let mut src = ByteSource::from_stream(&data[..]);
        src.set_window(0, 16);
        src.read_byte().unwrap();
        src.close();
        assert_eq!(src.offset_max(), 0);
    }
}
