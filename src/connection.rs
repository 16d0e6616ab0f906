//! Per-file connection: the duplex transport plus the bookkeeping every
//! operation on it shares.
//!
//! One logical operation runs at a time. The sequence counter, the seek
//! generation and the input-buffering state are connection-global and only
//! ever touched by the operation currently being driven.

use crate::cancel::Cancellable;
use crate::close_op::CloseOperation;
use crate::engine::{run_sync_state_machine, StateMachine};
use crate::error::{RemoteError, StreamError};
use crate::logger::Logger;
use crate::protocol::{request, MAX_ERROR_SIZE, MAX_READ_SIZE, REPLY_SIZE, REQUEST_SIZE};
use crate::protocol_core::{decode_error, decode_reply, encode_request, header_missing_bytes, Reply, ReplyKind};
use crate::read_op::ReadOperation;
use crate::seek_op::{SeekOperation, SeekType};
use crate::transport::Transport;
use std::io;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InputState {
    /// Next inbound bytes belong to a reply header
    InReplyHeader,
    /// Next `input_block_size` inbound bytes are payload of a DATA block
    InBlock,
}

/// What a complete reply header turned out to be.
pub(crate) enum Incoming {
    /// Header (or error trailer) still incomplete; read this many more bytes
    NeedBytes(usize),
    /// A DATA header; the connection is now `InBlock`
    Data(Reply),
    Error(Reply, RemoteError),
    SeekPos(Reply),
    Closed(Reply),
    /// Connection-fatal: the peer's framing cannot be trusted any more
    Violation(String),
}

pub(crate) struct ConnState {
    /// Next sequence number to hand out
    pub seq_nr: u32,
    /// Bumped when the first byte of a seek request is confirmed sent
    pub seek_generation: u32,
    pub input_state: InputState,
    pub input_block_size: usize,
    pub input_block_seek_generation: u32,
    /// Partially assembled reply header (+ error trailer)
    pub input_buffer: Vec<u8>,
    /// Encoded requests not yet fully written
    pub output_buffer: Vec<u8>,
    pub logger: Arc<dyn Logger>,
}

impl ConnState {
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        Self {
            seq_nr: 0,
            seek_generation: 0,
            input_state: InputState::InReplyHeader,
            input_block_size: 0,
            input_block_seek_generation: 0,
            input_buffer: Vec::with_capacity(REPLY_SIZE),
            output_buffer: Vec::with_capacity(REQUEST_SIZE * 2),
            logger,
        }
    }

    /// Encode a request into the output buffer and assign it the next
    /// sequence number, which is returned.
    pub fn append_request(&mut self, command: u32, arg1: u32, arg2: u32) -> u32 {
        let seq_nr = self.seq_nr;
        self.seq_nr = self.seq_nr.wrapping_add(1);
        self.output_buffer
            .extend_from_slice(&encode_request(command, seq_nr, arg1, arg2));
        if command == request::CANCEL {
            self.logger.cancel_sent(arg1);
        } else {
            self.logger.request(command, seq_nr, arg1, arg2);
        }
        seq_nr
    }

    /// Take back the last appended request before any of it was written.
    pub fn unappend_request(&mut self) {
        debug_assert!(self.output_buffer.len() >= REQUEST_SIZE);
        self.seq_nr = self.seq_nr.wrapping_sub(1);
        let keep = self.output_buffer.len().saturating_sub(REQUEST_SIZE);
        self.output_buffer.truncate(keep);
    }

    /// Drop `written` bytes from the front of the output buffer. Returns
    /// true while bytes remain to be written.
    pub fn consume_output(&mut self, written: usize) -> bool {
        let written = written.min(self.output_buffer.len());
        self.output_buffer.drain(..written);
        !self.output_buffer.is_empty()
    }

    /// Account for `n` payload bytes read or skipped from the current block.
    pub fn consume_block(&mut self, n: usize) {
        debug_assert!(n <= self.input_block_size);
        self.input_block_size = self.input_block_size.saturating_sub(n);
        if self.input_block_size == 0 {
            self.input_state = InputState::InReplyHeader;
        }
    }

    /// Whether the buffered block answers a read issued at the current offset
    pub fn block_is_current(&self) -> bool {
        self.input_block_seek_generation == self.seek_generation
    }

    /// Inspect the reply-header buffer. Once a full reply is present it is
    /// consumed, logged, and classified; DATA switches the connection into
    /// block mode.
    pub fn take_reply(&mut self) -> Incoming {
        let missing = header_missing_bytes(&self.input_buffer);
        if missing > 0 {
            let have = self.input_buffer.len();
            if have >= REPLY_SIZE {
                let trailer = have + missing - REPLY_SIZE;
                if trailer > MAX_ERROR_SIZE {
                    return Incoming::Violation(format!("error reply trailer of {trailer} bytes is too large"));
                }
            }
            return Incoming::NeedBytes(missing);
        }

        let (reply, payload) = decode_reply(&self.input_buffer);
        self.logger
            .reply(reply.reply_type, reply.seq_nr, reply.arg1, reply.arg2);
        let incoming = match reply.kind() {
            Some(ReplyKind::Data) => {
                self.input_state = InputState::InBlock;
                self.input_block_size = reply.arg1 as usize;
                self.input_block_seek_generation = reply.arg2;
                Incoming::Data(reply)
            }
            Some(ReplyKind::Error) => Incoming::Error(reply, decode_error(&reply, payload)),
            Some(ReplyKind::SeekPos) => Incoming::SeekPos(reply),
            Some(ReplyKind::Closed) => Incoming::Closed(reply),
            None => Incoming::Violation(format!("unknown reply type {}", reply.reply_type)),
        };
        self.input_buffer.clear();
        incoming
    }
}

/// A connection to one opened file on the daemon.
pub struct Connection<T: Transport> {
    transport: T,
    state: ConnState,
    /// Client-side file position: reads advance it, seeks replace it
    current_offset: u64,
    broken: bool,
}

impl<T: Transport> Connection<T> {
    pub fn new(transport: T, logger: Arc<dyn Logger>) -> Self {
        Self {
            transport,
            state: ConnState::new(logger),
            current_offset: 0,
            broken: false,
        }
    }

    fn ensure_usable(&self) -> Result<(), StreamError> {
        if self.broken {
            return Err(StreamError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection is unusable after an earlier protocol failure",
            )));
        }
        Ok(())
    }

    fn drive<M: StateMachine>(&mut self, op: &mut M, cancellable: Option<&Cancellable>) -> Result<(), StreamError> {
        run_sync_state_machine(&mut self.transport, &mut self.state, op, cancellable)
    }

    fn settle<R>(&mut self, context: &str, res: Result<R, StreamError>) -> Result<R, StreamError> {
        if let Err(e) = &res {
            if e.is_fatal() {
                self.broken = true;
            }
            if !e.is_cancelled() {
                self.state.logger.error(context, &e.to_string());
            }
        }
        res
    }

    /// Read up to `buf.len()` bytes (clamped to `MAX_READ_SIZE`).
    ///
    /// Reuses the rest of a block buffered by an earlier read when no seek
    /// happened since; otherwise sends a READ request.
    pub fn read(&mut self, buf: &mut [u8], cancellable: Option<&Cancellable>) -> Result<usize, StreamError> {
        self.ensure_usable()?;
        if let Some(c) = cancellable {
            c.check()?;
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let count = buf.len().min(MAX_READ_SIZE);
        let mut op = ReadOperation::new(&mut buf[..count]);
        let res = self.drive(&mut op, cancellable).and_then(|_| op.into_result());
        let n = self.settle("read", res)?;
        self.current_offset += n as u64;
        Ok(n)
    }

    /// Seek and return the new absolute offset reported by the peer.
    pub fn seek(&mut self, offset: i64, seek_type: SeekType, cancellable: Option<&Cancellable>) -> Result<u64, StreamError> {
        self.ensure_usable()?;
        if let Some(c) = cancellable {
            c.check()?;
        }
        let mut op = SeekOperation::new(offset, seek_type, self.current_offset);
        let res = self.drive(&mut op, cancellable).and_then(|_| op.into_result());
        let pos = self.settle("seek", res)?;
        self.current_offset = pos;
        Ok(pos)
    }

    /// Round-trip a CLOSE request so the peer has released the file.
    pub fn close_request(&mut self, cancellable: Option<&Cancellable>) -> Result<(), StreamError> {
        self.ensure_usable()?;
        if let Some(c) = cancellable {
            c.check()?;
        }
        let mut op = CloseOperation::new();
        let res = self.drive(&mut op, cancellable).and_then(|_| op.into_result());
        self.settle("close", res)
    }

    /// Close both streams, command stream first.
    pub fn shutdown(&mut self) -> Result<(), StreamError> {
        self.transport.close().map_err(StreamError::Io)
    }

    pub fn tell(&self) -> u64 {
        self.current_offset
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn seek_generation(&self) -> u32 {
        self.state.seek_generation
    }

    /// Sequence number the next request will get
    pub fn next_seq_nr(&self) -> u32 {
        self.state.seq_nr
    }

    /// Payload bytes of a DATA block still waiting on the wire, if any
    pub fn buffered_block(&self) -> Option<(usize, u32)> {
        match self.state.input_state {
            InputState::InBlock => Some((self.state.input_block_size, self.state.input_block_seek_generation)),
            InputState::InReplyHeader => None,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoopLogger;
    use crate::protocol::reply;
    use crate::protocol_core::{encode_error_reply, encode_reply};

    fn state() -> ConnState {
        ConnState::new(Arc::new(NoopLogger))
    }

    #[test]
    fn test_append_and_unappend_keep_sequence_dense() {
        let mut s = state();
        assert_eq!(s.append_request(request::READ, 10, 0), 0);
        assert_eq!(s.output_buffer.len(), REQUEST_SIZE);
        s.unappend_request();
        assert!(s.output_buffer.is_empty());
        assert_eq!(s.seq_nr, 0);
        assert_eq!(s.append_request(request::READ, 10, 0), 0);
        assert_eq!(s.append_request(request::CANCEL, 0, 0), 1);
        assert_eq!(s.seq_nr, 2);
    }

    #[test]
    fn test_sequence_counter_wraps() {
        let mut s = state();
        s.seq_nr = u32::MAX;
        assert_eq!(s.append_request(request::READ, 1, 0), u32::MAX);
        assert_eq!(s.seq_nr, 0);
    }

    #[test]
    fn test_consume_output_partial() {
        let mut s = state();
        s.output_buffer.extend_from_slice(b"abcdef");
        assert!(s.consume_output(4));
        assert_eq!(s.output_buffer, b"ef");
        assert!(!s.consume_output(2));
    }

    #[test]
    fn test_take_reply_data_enters_block_mode() {
        let mut s = state();
        s.input_buffer.extend_from_slice(&encode_reply(reply::DATA, 0, 600, 3));
        match s.take_reply() {
            Incoming::Data(r) => assert_eq!(r.arg1, 600),
            _ => panic!("expected data"),
        }
        assert_eq!(s.input_state, InputState::InBlock);
        assert_eq!(s.input_block_size, 600);
        assert_eq!(s.input_block_seek_generation, 3);
        assert!(s.input_buffer.is_empty());
        assert!(!s.block_is_current());

        s.consume_block(600);
        assert_eq!(s.input_state, InputState::InReplyHeader);
    }

    #[test]
    fn test_take_reply_needs_error_trailer() {
        let mut s = state();
        let full = encode_error_reply(4, &RemoteError::io(1, "gone"));
        s.input_buffer.extend_from_slice(&full[..REPLY_SIZE]);
        match s.take_reply() {
            Incoming::NeedBytes(n) => assert_eq!(n, full.len() - REPLY_SIZE),
            _ => panic!("expected more bytes"),
        }
        s.input_buffer.extend_from_slice(&full[REPLY_SIZE..]);
        match s.take_reply() {
            Incoming::Error(r, e) => {
                assert_eq!(r.seq_nr, 4);
                assert_eq!(e.message, "gone");
            }
            _ => panic!("expected error"),
        }
    }

    #[test]
    fn test_take_reply_rejects_huge_trailer_and_unknown_type() {
        let mut s = state();
        s.input_buffer
            .extend_from_slice(&encode_reply(reply::ERROR, 0, 0, (MAX_ERROR_SIZE + 1) as u32));
        assert!(matches!(s.take_reply(), Incoming::Violation(_)));

        let mut s = state();
        s.input_buffer.extend_from_slice(&encode_reply(77, 0, 0, 0));
        assert!(matches!(s.take_reply(), Incoming::Violation(_)));
    }
}
