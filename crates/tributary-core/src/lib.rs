//! Core types for the Tributary log engine.
//!
//! This crate holds the pieces every other Tributary crate agrees on:
//! the `Record` model and the byte-level framing used to persist records
//! inside segment data files.

pub mod codec;
pub mod error;
pub mod record;

pub use codec::{encode_record, encoded_len, Frame, FrameReader, FRAME_OVERHEAD, LENGTH_PREFIX_SIZE};
pub use error::{Error, Result};
pub use record::{Header, Record};
