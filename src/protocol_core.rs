//! Wire framing codec shared by the client stream and the daemon read channel
//!
//! Two formats live here:
//! - the 16-byte request/reply records of the per-file socket protocol
//!   (network byte order), plus the variable-length error trailer
//! - the 11-byte control frame header used once per open on the daemon's
//!   control socket

use crate::error::RemoteError;
use crate::protocol::{reply, REPLY_SIZE, REQUEST_SIZE};
use anyhow::{bail, Result};

/// A decoded request record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub command: u32,
    pub seq_nr: u32,
    pub arg1: u32,
    pub arg2: u32,
}

/// A decoded reply header. `reply_type` is kept raw so unknown values can be
/// reported instead of silently mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub reply_type: u32,
    pub seq_nr: u32,
    pub arg1: u32,
    pub arg2: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Data,
    Error,
    SeekPos,
    Closed,
}

impl Reply {
    pub fn kind(&self) -> Option<ReplyKind> {
        match self.reply_type {
            reply::DATA => Some(ReplyKind::Data),
            reply::ERROR => Some(ReplyKind::Error),
            reply::SEEK_POS => Some(ReplyKind::SeekPos),
            reply::CLOSED => Some(ReplyKind::Closed),
            _ => None,
        }
    }

    /// SEEK_POS replies carry a 64-bit offset split low/high across the args
    pub fn offset(&self) -> u64 {
        join_offset(self.arg1, self.arg2)
    }
}

/// Split a 64-bit offset into (low, high) argument words
pub fn split_offset(offset: i64) -> (u32, u32) {
    let bits = offset as u64;
    ((bits & 0xffff_ffff) as u32, (bits >> 32) as u32)
}

pub fn join_offset(low: u32, high: u32) -> u64 {
    (u64::from(high) << 32) | u64::from(low)
}

fn put_words(words: [u32; 4]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for (i, w) in words.iter().enumerate() {
        out[i * 4..i * 4 + 4].copy_from_slice(&w.to_be_bytes());
    }
    out
}

fn get_words(buf: &[u8]) -> [u32; 4] {
    let mut words = [0u32; 4];
    for (i, w) in words.iter_mut().enumerate() {
        *w = u32::from_be_bytes([buf[i * 4], buf[i * 4 + 1], buf[i * 4 + 2], buf[i * 4 + 3]]);
    }
    words
}

/// Build a request record. Sequence number allocation belongs to the
/// connection; see `Connection::append_request`.
pub fn encode_request(command: u32, seq_nr: u32, arg1: u32, arg2: u32) -> [u8; REQUEST_SIZE] {
    put_words([command, seq_nr, arg1, arg2])
}

/// Parse a request record (daemon side)
pub fn decode_request(buf: &[u8; REQUEST_SIZE]) -> Request {
    let [command, seq_nr, arg1, arg2] = get_words(buf);
    Request {
        command,
        seq_nr,
        arg1,
        arg2,
    }
}

/// Build a reply header (daemon side)
pub fn encode_reply(reply_type: u32, seq_nr: u32, arg1: u32, arg2: u32) -> [u8; REPLY_SIZE] {
    put_words([reply_type, seq_nr, arg1, arg2])
}

/// Build a complete ERROR reply: header followed by `domain\0message\0`
pub fn encode_error_reply(seq_nr: u32, err: &RemoteError) -> Vec<u8> {
    let payload = encode_error_payload(err);
    let mut out = Vec::with_capacity(REPLY_SIZE + payload.len());
    out.extend_from_slice(&encode_reply(reply::ERROR, seq_nr, err.code, payload.len() as u32));
    out.extend_from_slice(&payload);
    out
}

pub fn encode_error_payload(err: &RemoteError) -> Vec<u8> {
    let mut payload = Vec::with_capacity(err.domain.len() + err.message.len() + 2);
    payload.extend_from_slice(err.domain.as_bytes());
    payload.push(0);
    payload.extend_from_slice(err.message.as_bytes());
    payload.push(0);
    payload
}

/// How many more bytes are needed before `buffer` holds a complete reply
/// header, including the error trailer for ERROR replies. Returns 0 when
/// complete.
///
/// Called again after every partial read: until 16 bytes are present the
/// type word cannot be trusted, so only the fixed header is requested.
pub fn header_missing_bytes(buffer: &[u8]) -> usize {
    if buffer.len() < REPLY_SIZE {
        return REPLY_SIZE - buffer.len();
    }
    let [reply_type, _, _, arg2] = get_words(&buffer[..REPLY_SIZE]);
    if reply_type == reply::ERROR {
        return (REPLY_SIZE + arg2 as usize).saturating_sub(buffer.len());
    }
    0
}

/// Decode a complete reply header, returning the bytes that follow it (the
/// error trailer, if any).
pub fn decode_reply(buffer: &[u8]) -> (Reply, &[u8]) {
    let [reply_type, seq_nr, arg1, arg2] = get_words(&buffer[..REPLY_SIZE]);
    (
        Reply {
            reply_type,
            seq_nr,
            arg1,
            arg2,
        },
        &buffer[REPLY_SIZE..],
    )
}

/// Rebuild the peer's error from an ERROR header and its trailer.
///
/// A missing terminator ends the string at the end of the payload instead of
/// reading past it.
pub fn decode_error(reply: &Reply, payload: &[u8]) -> RemoteError {
    let (domain, message) = split_error_payload(payload);
    RemoteError::new(domain, reply.arg1, message)
}

fn split_error_payload(payload: &[u8]) -> (String, String) {
    let mut parts = payload.splitn(2, |b| *b == 0);
    let domain = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or_default();
    let message = rest.split(|b| *b == 0).next().unwrap_or_default();
    (
        String::from_utf8_lossy(domain).into_owned(),
        String::from_utf8_lossy(message).into_owned(),
    )
}

/// Frame validation constants
pub const CONTROL_HEADER_SIZE: usize = 11;

/// Validate control frame payload size using protocol::MAX_FRAME_SIZE directly
pub fn validate_frame_size(size: usize) -> Result<()> {
    if size > crate::protocol::MAX_FRAME_SIZE {
        bail!("frame payload too large: {} bytes (max: {})", size, crate::protocol::MAX_FRAME_SIZE);
    }
    Ok(())
}

/// Build control frame header (11 bytes)
/// Format: MAGIC (4) | VERSION (2) | TYPE (1) | LENGTH (4)
pub fn build_frame_header(frame_type: u8, payload_len: u32) -> [u8; CONTROL_HEADER_SIZE] {
    use crate::protocol::{MAGIC, VERSION};

    let mut header = [0u8; CONTROL_HEADER_SIZE];
    header[0..4].copy_from_slice(MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_le_bytes());
    header[6] = frame_type;
    header[7..11].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Build a whole control frame: header followed by payload
pub fn build_frame(frame_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(CONTROL_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&build_frame_header(frame_type, payload.len() as u32));
    buf.extend_from_slice(payload);
    buf
}

/// Parse control frame header
/// Returns: (frame_type, payload_length)
pub fn parse_frame_header(header: &[u8; CONTROL_HEADER_SIZE]) -> Result<(u8, u32)> {
    use crate::protocol::{MAGIC, VERSION};

    // Verify magic
    if &header[0..4] != MAGIC {
        bail!("invalid magic in frame header");
    }

    // Check version
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != VERSION {
        bail!("protocol version mismatch: got {}, expected {}", version, VERSION);
    }

    let frame_type = header[6];
    let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]);
    validate_frame_size(payload_len as usize)?;

    Ok((frame_type, payload_len))
}

/// Control ERROR frame payload: code u32 LE | domain\0 | message\0
pub fn encode_control_error(err: &RemoteError) -> Vec<u8> {
    let mut out = err.code.to_le_bytes().to_vec();
    out.extend_from_slice(&encode_error_payload(err));
    out
}

pub fn decode_control_error(payload: &[u8]) -> Result<RemoteError> {
    if payload.len() < 4 {
        bail!("short control error payload");
    }
    let code = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let (domain, message) = split_error_payload(&payload[4..]);
    Ok(RemoteError::new(domain, code, message))
}
