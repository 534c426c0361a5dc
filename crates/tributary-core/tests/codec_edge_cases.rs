//! Edge-case tests for record framing.

use bytes::Bytes;
use std::io::Cursor;
use tributary_core::codec::decode_record;
use tributary_core::{encode_record, Error, FrameReader, Header, Record, FRAME_OVERHEAD};

fn record(offset: i64, value: &[u8]) -> Record {
    Record {
        offset,
        timestamp: 1_000 + offset,
        key: None,
        value: Bytes::copy_from_slice(value),
        headers: Vec::new(),
    }
}

// ---------------------------------------------------------------
// Sizes
// ---------------------------------------------------------------

#[test]
fn empty_record_is_exactly_the_overhead() {
    let mut buf = Vec::new();
    let size = encode_record(&record(0, b""), &mut buf).unwrap();
    assert_eq!(size, FRAME_OVERHEAD);
    assert_eq!(buf.len(), FRAME_OVERHEAD);
}

#[test]
fn length_prefix_counts_bytes_after_itself() {
    let mut buf = Vec::new();
    encode_record(&record(0, b"abcdef"), &mut buf).unwrap();
    let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    assert_eq!(declared, buf.len() - 4);
}

// ---------------------------------------------------------------
// Field preservation
// ---------------------------------------------------------------

#[test]
fn header_order_and_duplicates_preserved() {
    let original = Record {
        headers: vec![
            Header::new("b", Bytes::from("1")),
            Header::new("a", Bytes::from("2")),
            Header::new("b", Bytes::from("3")),
        ],
        ..record(3, b"v")
    };
    let mut buf = Vec::new();
    encode_record(&original, &mut buf).unwrap();
    let (decoded, _) = decode_record(&Bytes::from(buf)).unwrap();
    assert_eq!(decoded.headers, original.headers);
}

#[test]
fn negative_timestamp_and_empty_header_value_survive() {
    let original = Record {
        timestamp: -5,
        headers: vec![Header::new("", Bytes::new())],
        ..record(9, b"")
    };
    let mut buf = Vec::new();
    encode_record(&original, &mut buf).unwrap();
    let (decoded, _) = decode_record(&Bytes::from(buf)).unwrap();
    assert_eq!(decoded, original);
}

// ---------------------------------------------------------------
// Corruption
// ---------------------------------------------------------------

#[test]
fn every_single_byte_flip_is_rejected() {
    let mut clean = Vec::new();
    encode_record(&record(1, b"payload"), &mut clean).unwrap();

    for i in 0..clean.len() {
        let mut buf = clean.clone();
        buf[i] ^= 0x01;
        let result = decode_record(&Bytes::from(buf));
        assert!(result.is_err(), "flip at byte {i} was accepted");
    }
}

#[test]
fn oversized_length_reports_incomplete_not_panic() {
    let mut buf = Vec::new();
    encode_record(&record(0, b"x"), &mut buf).unwrap();
    buf[..4].copy_from_slice(&u32::MAX.to_be_bytes());

    let end = buf.len() as u64;
    let mut reader = FrameReader::new(Cursor::new(buf), 0, end);
    let err = reader.next_frame().unwrap_err();
    assert!(matches!(err, Error::IncompleteRecord { position: 0, .. }));
}

#[test]
fn reader_respects_end_bound() {
    let mut buf = Vec::new();
    encode_record(&record(0, b"a"), &mut buf).unwrap();
    let first = buf.len() as u64;
    encode_record(&record(1, b"b"), &mut buf).unwrap();

    // Only the first frame is inside the readable range.
    let mut reader = FrameReader::new(Cursor::new(buf), 0, first);
    assert_eq!(reader.next_frame().unwrap().unwrap().record.offset, 0);
    assert!(reader.next_frame().unwrap().is_none());
}
