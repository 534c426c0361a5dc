//! Record Framing
//!
//! Records are stored back to back in segment data files. Each record is a
//! self-delimiting frame, all integers big-endian:
//!
//! ```text
//! ┌────────────┬───────────┬───────────┬──────────────┬──────────────┐
//! │ length u32 │ crc32 u32 │ offset i64│ timestamp i64│ key_len i32  │
//! ├────────────┴───────────┴───────────┴──────────────┴──────────────┤
//! │ key bytes (absent when key_len = -1)                             │
//! ├──────────────┬───────────────────────────────────────────────────┤
//! │ value_len u32│ value bytes                                       │
//! ├──────────────┼───────────────────────────────────────────────────┤
//! │ hdr_count u32│ per header: name_len u16, name, value_len u32,    │
//! │              │ value                                             │
//! └──────────────┴───────────────────────────────────────────────────┘
//! ```
//!
//! `length` counts every byte after itself. `crc32` (IEEE) covers every byte
//! after the checksum field. A frame is valid only if its declared length
//! fits in the readable bytes, its checksum matches, and every inner length
//! consumes the frame exactly.

use bytes::{Buf, BufMut, Bytes};
use std::io::{ErrorKind, Read};

use crate::error::{Error, Result};
use crate::record::{Header, Record};

/// Size of the leading length field.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Bytes used by a record with no key, an empty value and no headers.
pub const FRAME_OVERHEAD: usize = 36;

/// Smallest legal value of the length field.
const MIN_BODY_SIZE: usize = FRAME_OVERHEAD - LENGTH_PREFIX_SIZE;

const CRC_SIZE: usize = 4;

/// Number of bytes `record` occupies once framed.
pub fn encoded_len(record: &Record) -> usize {
    record.encoded_size()
}

/// Appends the framed form of `record` to `buf` and returns the frame size.
pub fn encode_record(record: &Record, buf: &mut Vec<u8>) -> Result<usize> {
    let key_len = match &record.key {
        Some(key) => i32::try_from(key.len())
            .map_err(|_| Error::FieldTooLarge(format!("key of {} bytes", key.len())))?,
        None => -1,
    };
    let value_len = u32::try_from(record.value.len())
        .map_err(|_| Error::FieldTooLarge(format!("value of {} bytes", record.value.len())))?;
    let header_count = u32::try_from(record.headers.len())
        .map_err(|_| Error::FieldTooLarge(format!("{} headers", record.headers.len())))?;

    let total = record.encoded_size();
    let body_len = u32::try_from(total - LENGTH_PREFIX_SIZE)
        .map_err(|_| Error::FieldTooLarge(format!("record of {} bytes", total)))?;

    let start = buf.len();
    buf.reserve(total);
    buf.put_u32(body_len);
    buf.put_u32(0); // checksum, patched below
    buf.put_i64(record.offset);
    buf.put_i64(record.timestamp);
    buf.put_i32(key_len);
    if let Some(key) = &record.key {
        buf.put_slice(key);
    }
    buf.put_u32(value_len);
    buf.put_slice(&record.value);
    buf.put_u32(header_count);
    for header in &record.headers {
        let name_len = u16::try_from(header.key.len())
            .map_err(|_| Error::FieldTooLarge(format!("header name of {} bytes", header.key.len())))?;
        let header_value_len = u32::try_from(header.value.len()).map_err(|_| {
            Error::FieldTooLarge(format!("header value of {} bytes", header.value.len()))
        })?;
        buf.put_u16(name_len);
        buf.put_slice(header.key.as_bytes());
        buf.put_u32(header_value_len);
        buf.put_slice(&header.value);
    }

    let crc_start = start + LENGTH_PREFIX_SIZE;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[crc_start + CRC_SIZE..]);
    let crc = hasher.finalize();
    buf[crc_start..crc_start + CRC_SIZE].copy_from_slice(&crc.to_be_bytes());

    debug_assert_eq!(buf.len() - start, total);
    Ok(total)
}

/// Decodes the frame at the start of `data`, returning the record and the
/// number of bytes consumed.
pub fn decode_record(data: &Bytes) -> Result<(Record, usize)> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(Error::IncompleteRecord {
            position: 0,
            needed: LENGTH_PREFIX_SIZE as u64,
            available: data.len() as u64,
        });
    }
    let body_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    check_body_len(body_len, 0)?;
    let available = data.len() - LENGTH_PREFIX_SIZE;
    if body_len > available {
        return Err(Error::IncompleteRecord {
            position: 0,
            needed: body_len as u64,
            available: available as u64,
        });
    }
    let body = data.slice(LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + body_len);
    let record = decode_body(body, 0)?;
    Ok((record, LENGTH_PREFIX_SIZE + body_len))
}

fn check_body_len(body_len: usize, position: u64) -> Result<()> {
    if body_len < MIN_BODY_SIZE {
        return Err(Error::CorruptedRecord {
            position,
            reason: format!("frame length {} below minimum {}", body_len, MIN_BODY_SIZE),
        });
    }
    Ok(())
}

fn decode_body(mut body: Bytes, position: u64) -> Result<Record> {
    let corrupted = |reason: String| Error::CorruptedRecord { position, reason };

    let stored = body.get_u32();
    let computed = crc32fast::hash(&body);
    if stored != computed {
        return Err(Error::CrcMismatch {
            position,
            stored,
            computed,
        });
    }

    let offset = body.get_i64();
    let timestamp = body.get_i64();

    let key_len = body.get_i32();
    let key = match key_len {
        -1 => None,
        n if n < 0 => return Err(corrupted(format!("negative key length {}", n))),
        n => Some(take(&mut body, n as usize, "key", position)?),
    };

    let value_len = read_u32(&mut body, "value length", position)? as usize;
    let value = take(&mut body, value_len, "value", position)?;

    let header_count = read_u32(&mut body, "header count", position)?;
    // Each header needs at least 6 bytes, which bounds the allocation.
    if header_count as usize > body.remaining() / 6 {
        return Err(corrupted(format!(
            "header count {} exceeds frame size",
            header_count
        )));
    }
    let mut headers = Vec::with_capacity(header_count as usize);
    for _ in 0..header_count {
        if body.remaining() < 2 {
            return Err(corrupted("header name length overruns frame".to_string()));
        }
        let name_len = body.get_u16() as usize;
        let name = take(&mut body, name_len, "header name", position)?;
        let name = String::from_utf8(name.to_vec())
            .map_err(|_| corrupted("header name is not valid UTF-8".to_string()))?;
        let header_value_len = read_u32(&mut body, "header value length", position)? as usize;
        let header_value = take(&mut body, header_value_len, "header value", position)?;
        headers.push(Header {
            key: name,
            value: header_value,
        });
    }

    if body.has_remaining() {
        return Err(corrupted(format!(
            "{} unconsumed bytes at end of frame",
            body.remaining()
        )));
    }

    Ok(Record {
        offset,
        timestamp,
        key,
        value,
        headers,
    })
}

fn read_u32(body: &mut Bytes, field: &str, position: u64) -> Result<u32> {
    if body.remaining() < 4 {
        return Err(Error::CorruptedRecord {
            position,
            reason: format!("{} overruns frame", field),
        });
    }
    Ok(body.get_u32())
}

fn take(body: &mut Bytes, len: usize, field: &str, position: u64) -> Result<Bytes> {
    if body.remaining() < len {
        return Err(Error::CorruptedRecord {
            position,
            reason: format!(
                "{} of {} bytes overruns frame ({} remaining)",
                field,
                len,
                body.remaining()
            ),
        });
    }
    Ok(body.split_to(len))
}

/// A decoded frame and where it sits in the file.
#[derive(Debug, Clone)]
pub struct Frame {
    pub record: Record,
    /// Byte position of the frame's length prefix.
    pub position: u64,
    /// Total frame size including the length prefix.
    pub size: u64,
}

/// Sequential frame reader over a byte source with a known end position.
///
/// The end position is the number of bytes the caller considers readable
/// (usually the file length). Frames that claim more bytes than remain are
/// reported as `IncompleteRecord` without reading past the end.
pub struct FrameReader<R> {
    inner: R,
    position: u64,
    end: u64,
}

impl<R: Read> FrameReader<R> {
    /// `inner` must already be positioned at `start`.
    pub fn new(inner: R, start: u64, end: u64) -> Self {
        Self {
            inner,
            position: start,
            end,
        }
    }

    /// Position of the next frame to be read.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Reads the next frame. Returns `Ok(None)` at a clean end of data.
    ///
    /// On error the reader position is left at the start of the bad frame.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let remaining = self.end.saturating_sub(self.position);
        if remaining == 0 {
            return Ok(None);
        }
        if remaining < LENGTH_PREFIX_SIZE as u64 {
            return Err(Error::IncompleteRecord {
                position: self.position,
                needed: LENGTH_PREFIX_SIZE as u64,
                available: remaining,
            });
        }

        let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
        self.read_exact(&mut len_buf, LENGTH_PREFIX_SIZE as u64)?;
        let body_len = u32::from_be_bytes(len_buf) as usize;
        check_body_len(body_len, self.position)?;

        let available = remaining - LENGTH_PREFIX_SIZE as u64;
        if body_len as u64 > available {
            return Err(Error::IncompleteRecord {
                position: self.position,
                needed: body_len as u64,
                available,
            });
        }

        let mut body = vec![0u8; body_len];
        self.read_exact(&mut body, remaining)?;
        let record = decode_body(Bytes::from(body), self.position)?;

        let frame = Frame {
            record,
            position: self.position,
            size: (LENGTH_PREFIX_SIZE + body_len) as u64,
        };
        self.position += frame.size;
        Ok(Some(frame))
    }

    fn read_exact(&mut self, buf: &mut [u8], available: u64) -> Result<()> {
        match self.inner.read_exact(buf) {
            Ok(()) => Ok(()),
            // The file shrank underneath us; treat it like a torn write.
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(Error::IncompleteRecord {
                position: self.position,
                needed: buf.len() as u64,
                available,
            }),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample() -> Record {
        Record {
            offset: 7,
            timestamp: 1_700_000_000_000,
            key: Some(Bytes::from("user-1")),
            value: Bytes::from("hello"),
            headers: vec![Header::new("trace", Bytes::from("abc"))],
        }
    }

    fn encode(record: &Record) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_record(record, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_encode_decode() {
        let record = sample();
        let buf = encode(&record);
        assert_eq!(buf.len(), record.encoded_size());

        let (decoded, consumed) = decode_record(&Bytes::from(buf)).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(consumed, record.encoded_size());
    }

    #[test]
    fn test_null_key_differs_from_empty_key() {
        let null_key = Record {
            key: None,
            ..sample()
        };
        let empty_key = Record {
            key: Some(Bytes::new()),
            ..sample()
        };

        let (a, _) = decode_record(&Bytes::from(encode(&null_key))).unwrap();
        let (b, _) = decode_record(&Bytes::from(encode(&empty_key))).unwrap();
        assert_eq!(a.key, None);
        assert_eq!(b.key, Some(Bytes::new()));
    }

    #[test]
    fn test_crc_mismatch_detected() {
        let mut buf = encode(&sample());
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;

        let err = decode_record(&Bytes::from(buf)).unwrap_err();
        assert!(matches!(err, Error::CrcMismatch { position: 0, .. }));
    }

    #[test]
    fn test_truncated_frame_is_incomplete() {
        let buf = encode(&sample());
        let cut = Bytes::from(buf[..buf.len() - 3].to_vec());

        let err = decode_record(&cut).unwrap_err();
        assert!(matches!(err, Error::IncompleteRecord { .. }));
    }

    #[test]
    fn test_length_below_minimum_is_corrupted() {
        let mut buf = encode(&sample());
        buf[..4].copy_from_slice(&4u32.to_be_bytes());

        let err = decode_record(&Bytes::from(buf)).unwrap_err();
        assert!(matches!(err, Error::CorruptedRecord { .. }));
    }

    #[test]
    fn test_frame_reader_sequence_and_tail() {
        let mut buf = Vec::new();
        for i in 0..3 {
            let record = Record {
                offset: i,
                ..sample()
            };
            encode_record(&record, &mut buf).unwrap();
        }
        let frame_size = sample().encoded_size() as u64;
        // Torn write: half of a fourth frame.
        let mut partial = Vec::new();
        encode_record(&sample(), &mut partial).unwrap();
        buf.extend_from_slice(&partial[..partial.len() / 2]);

        let end = buf.len() as u64;
        let mut reader = FrameReader::new(Cursor::new(buf), 0, end);
        for i in 0..3 {
            let frame = reader.next_frame().unwrap().unwrap();
            assert_eq!(frame.record.offset, i);
            assert_eq!(frame.position, i as u64 * frame_size);
        }

        let err = reader.next_frame().unwrap_err();
        assert_eq!(err.position(), Some(3 * frame_size));
        assert!(err.is_data_error());
        assert_eq!(reader.position(), 3 * frame_size);
    }

    #[test]
    fn test_frame_reader_clean_end() {
        let buf = encode(&sample());
        let end = buf.len() as u64;
        let mut reader = FrameReader::new(Cursor::new(buf), 0, end);
        assert!(reader.next_frame().unwrap().is_some());
        assert!(reader.next_frame().unwrap().is_none());
    }
}
