//! Channel request payload codecs.
//!
//! Payloads use the SSH wire encoding: integers are `u32` big-endian and
//! strings are a `u32` length followed by that many bytes.
//!
//! - `pty-req`: `[string term][u32 width][u32 height][u32 px width][u32 px height][string modes]`
//! - `window-change`: `[u32 width][u32 height][u32 px width][u32 px height]`
//! - `subsystem`: `[string name]`
//!
//! Only the fields the multiplexer acts on are decoded; trailing fields are
//! ignored.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload truncated: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("payload string is not valid UTF-8")]
    InvalidUtf8,
}

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// A decoded `pty-req` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub dimensions: Dimensions,
}

fn ensure(buf: &[u8], needed: usize) -> Result<(), PayloadError> {
    if buf.len() < needed {
        return Err(PayloadError::Truncated {
            needed,
            got: buf.len(),
        });
    }
    Ok(())
}

fn read_string<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], PayloadError> {
    ensure(buf, 4)?;
    let len = buf.get_u32() as usize;
    ensure(buf, len)?;
    let rest: &'a [u8] = *buf;
    let (head, tail) = rest.split_at(len);
    *buf = tail;
    Ok(head)
}

fn read_dimensions(buf: &mut &[u8]) -> Result<Dimensions, PayloadError> {
    ensure(buf, 8)?;
    let width = buf.get_u32();
    let height = buf.get_u32();
    Ok(Dimensions { width, height })
}

/// Decode a `pty-req` payload.
pub fn parse_pty_request(mut payload: &[u8]) -> Result<PtyRequest, PayloadError> {
    let term = read_string(&mut payload)?;
    let term = std::str::from_utf8(term)
        .map_err(|_| PayloadError::InvalidUtf8)?
        .to_string();
    let dimensions = read_dimensions(&mut payload)?;
    Ok(PtyRequest { term, dimensions })
}

/// Decode a `window-change` payload.
pub fn parse_window_change(mut payload: &[u8]) -> Result<Dimensions, PayloadError> {
    read_dimensions(&mut payload)
}

/// Decode the subsystem name from a `subsystem` payload.
pub fn parse_subsystem(mut payload: &[u8]) -> Result<String, PayloadError> {
    let name = read_string(&mut payload)?;
    std::str::from_utf8(name)
        .map(str::to_string)
        .map_err(|_| PayloadError::InvalidUtf8)
}

fn put_string(buf: &mut BytesMut, s: &[u8]) {
    buf.put_u32(s.len() as u32);
    buf.put(s);
}

/// Encode a `pty-req` payload with zero pixel sizes.
pub fn encode_pty_request(term: &str, dimensions: Dimensions, modes: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + term.len() + 16 + 4 + modes.len());
    put_string(&mut buf, term.as_bytes());
    buf.put_u32(dimensions.width);
    buf.put_u32(dimensions.height);
    buf.put_u32(0);
    buf.put_u32(0);
    put_string(&mut buf, modes);
    buf.freeze()
}

/// Encode a `window-change` payload with zero pixel sizes.
pub fn encode_window_change(dimensions: Dimensions) -> Bytes {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_u32(dimensions.width);
    buf.put_u32(dimensions.height);
    buf.put_u32(0);
    buf.put_u32(0);
    buf.freeze()
}

/// Encode a `subsystem` payload.
pub fn encode_subsystem(name: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + name.len());
    put_string(&mut buf, name.as_bytes());
    buf.freeze()
}
