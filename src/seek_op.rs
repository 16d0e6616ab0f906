//! SEEK state machine

use crate::connection::{ConnState, Incoming, InputState};
use crate::engine::{IoOperation, PendingRequest, StateMachine, StateOp};
use crate::error::StreamError;
use crate::protocol::request;
use crate::protocol_core::split_offset;
use std::io::SeekFrom;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekType {
    Set,
    Cur,
    End,
}

/// Split a `std::io::SeekFrom` into an offset and a seek type.
pub fn split_seek_from(pos: SeekFrom) -> (i64, SeekType) {
    match pos {
        SeekFrom::Start(n) => (n as i64, SeekType::Set),
        SeekFrom::Current(n) => (n, SeekType::Cur),
        SeekFrom::End(n) => (n, SeekType::End),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SeekState {
    Init,
    WroteRequest,
    HandleInput,
    HandleInputBlock,
    SkipBlock,
    HandleHeader,
}

pub(crate) struct SeekOperation {
    offset: i64,
    seek_type: SeekType,
    current_offset: u64,
    state: SeekState,
    pending: PendingRequest,
    sent_seek: bool,
    result: Option<Result<u64, StreamError>>,
}

impl SeekOperation {
    /// `current_offset` resolves relative seeks on this side, so the peer
    /// only ever sees absolute SET or END requests.
    pub fn new(offset: i64, seek_type: SeekType, current_offset: u64) -> Self {
        Self {
            offset,
            seek_type,
            current_offset,
            state: SeekState::Init,
            pending: PendingRequest::default(),
            sent_seek: false,
            result: None,
        }
    }

    pub fn into_result(self) -> Result<u64, StreamError> {
        self.result
            .unwrap_or_else(|| Err(StreamError::Framing("seek ended without a result".into())))
    }

    fn finish(&mut self, res: Result<u64, StreamError>) -> StateOp {
        self.result = Some(res);
        StateOp::Done
    }

    fn wire_request(&self) -> (u32, i64) {
        match self.seek_type {
            SeekType::Set => (request::SEEK_SET, self.offset),
            SeekType::Cur => (
                request::SEEK_SET,
                (self.current_offset as i64).saturating_add(self.offset),
            ),
            SeekType::End => (request::SEEK_END, self.offset),
        }
    }
}

impl StateMachine for SeekOperation {
    fn iterate(&mut self, conn: &mut ConnState, io: &mut IoOperation) -> StateOp {
        loop {
            match self.state {
                SeekState::Init => {
                    let (command, offset) = self.wire_request();
                    let (low, high) = split_offset(offset);
                    self.state = SeekState::WroteRequest;
                    return self.pending.start(conn, command, low, high);
                }

                SeekState::WroteRequest => {
                    // First byte is out: buffered and in-flight blocks are stale from here on
                    if !io.io_cancelled && !self.sent_seek {
                        conn.seek_generation = conn.seek_generation.wrapping_add(1);
                        self.sent_seek = true;
                    }
                    match self.pending.wrote(conn, io) {
                        Err(e) => return self.finish(Err(e)),
                        Ok(Some(op)) => return op,
                        Ok(None) => self.state = SeekState::HandleInput,
                    }
                }

                SeekState::HandleInput => {
                    if let Some(op) = self.pending.cancel_if_requested(conn, io) {
                        self.state = SeekState::WroteRequest;
                        return op;
                    }
                    self.state = match conn.input_state {
                        InputState::InBlock => SeekState::HandleInputBlock,
                        InputState::InReplyHeader => SeekState::HandleHeader,
                    };
                }

                SeekState::HandleInputBlock => {
                    self.state = SeekState::SkipBlock;
                    return self.pending.skip_block(conn);
                }

                SeekState::SkipBlock => {
                    if !io.io_cancelled {
                        conn.consume_block(io.io_res);
                    }
                    self.state = SeekState::HandleInput;
                }

                SeekState::HandleHeader => {
                    if io.io_cancelled {
                        self.state = SeekState::HandleInput;
                    } else {
                        match conn.take_reply() {
                            Incoming::NeedBytes(n) => return self.pending.read_header(conn, n),
                            Incoming::Data(reply) => {
                                conn.logger.reply_discarded("data during seek", reply.seq_nr);
                                self.state = SeekState::HandleInputBlock;
                            }
                            Incoming::SeekPos(reply) if self.pending.answers(&reply) => {
                                return self.finish(Ok(reply.offset()));
                            }
                            Incoming::Error(reply, err) if self.pending.answers(&reply) => {
                                return self.finish(Err(StreamError::from_remote(err)));
                            }
                            Incoming::SeekPos(reply) => conn.logger.reply_discarded("stale seek position", reply.seq_nr),
                            Incoming::Error(reply, _) => conn.logger.reply_discarded("stale error", reply.seq_nr),
                            Incoming::Closed(reply) => conn.logger.reply_discarded("closed during seek", reply.seq_nr),
                            Incoming::Violation(msg) => return self.finish(Err(StreamError::Framing(msg))),
                        }
                    }
                }
            }
            io.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::Cancellable;
    use crate::connection::Connection;
    use crate::engine::run_sync_state_machine;
    use crate::error::RemoteError;
    use crate::logger::NoopLogger;
    use crate::protocol::{code, reply};
    use crate::protocol_core::{decode_request, encode_error_reply, encode_reply};
    use crate::transport::mock::MockTransport;
    use std::sync::Arc;

    fn connection(t: MockTransport) -> Connection<MockTransport> {
        Connection::new(t, Arc::new(NoopLogger))
    }

    fn seek_pos(seq: u32, pos: u64) -> [u8; 16] {
        encode_reply(reply::SEEK_POS, seq, pos as u32, (pos >> 32) as u32)
    }

    fn first_request(written: &[u8]) -> (u32, u32, u32, u32) {
        let mut rec = [0u8; 16];
        rec.copy_from_slice(&written[..16]);
        let r = decode_request(&rec);
        (r.command, r.seq_nr, r.arg1, r.arg2)
    }

    #[test]
    fn test_split_seek_from() {
        assert_eq!(split_seek_from(SeekFrom::Start(9)), (9, SeekType::Set));
        assert_eq!(split_seek_from(SeekFrom::Current(-3)), (-3, SeekType::Cur));
        assert_eq!(split_seek_from(SeekFrom::End(0)), (0, SeekType::End));
    }

    #[test]
    fn test_seek_set_large_offset() {
        let target = 0x1_2345_6789u64;
        let mut t = MockTransport::new();
        t.push_inbound(&seek_pos(0, target));
        let mut conn = connection(t);

        assert_eq!(conn.seek(target as i64, SeekType::Set, None).unwrap(), target);
        assert_eq!(conn.tell(), target);
        assert_eq!(conn.seek_generation(), 1);
        assert_eq!(
            first_request(&conn.transport().written),
            (request::SEEK_SET, 0, 0x2345_6789, 1)
        );
    }

    #[test]
    fn test_seek_cur_resolved_against_tell() {
        let mut t = MockTransport::new();
        t.push_inbound(&seek_pos(0, 40));
        t.push_inbound(&seek_pos(1, 30));
        let mut conn = connection(t);

        conn.seek(40, SeekType::Set, None).unwrap();
        assert_eq!(conn.seek(-10, SeekType::Cur, None).unwrap(), 30);
        let written = &conn.transport().written;
        assert_eq!(first_request(&written[16..]), (request::SEEK_SET, 1, 30, 0));
    }

    #[test]
    fn test_seek_end_negative_offset_travels_as_twos_complement() {
        let mut t = MockTransport::new();
        t.push_inbound(&seek_pos(0, 90));
        let mut conn = connection(t);

        assert_eq!(conn.seek(-10, SeekType::End, None).unwrap(), 90);
        assert_eq!(
            first_request(&conn.transport().written),
            (request::SEEK_END, 0, 0xffff_fff6, 0xffff_ffff)
        );
    }

    #[test]
    fn test_seek_skips_pending_blocks() {
        let mut t = MockTransport::with_chunks(vec![3]);
        let mut block = encode_reply(reply::DATA, 0, 10, 0).to_vec();
        block.extend_from_slice(&[1u8; 10]);
        t.push_inbound(&block);
        t.push_inbound(&encode_error_reply(7, &RemoteError::io(code::FAILED, "stale")));
        t.push_inbound(&seek_pos(5, 1234));
        t.push_inbound(&seek_pos(0, 0));
        let mut conn = connection(t);

        assert_eq!(conn.seek(0, SeekType::Set, None).unwrap(), 0);
        assert_eq!(conn.transport().skipped, 10);
        assert!(conn.buffered_block().is_none());
    }

    #[test]
    fn test_seek_error_reply() {
        let mut t = MockTransport::new();
        t.push_inbound(&encode_error_reply(0, &RemoteError::io(code::INVALID_ARGUMENT, "negative offset")));
        let mut conn = connection(t);

        match conn.seek(-5, SeekType::Set, None) {
            Err(StreamError::Remote(e)) => assert_eq!(e.code, code::INVALID_ARGUMENT),
            other => panic!("unexpected {other:?}"),
        }
        // Committed on the wire even though it failed
        assert_eq!(conn.seek_generation(), 1);
        assert_eq!(conn.tell(), 0);
    }

    #[test]
    fn test_generation_bumped_once_for_partial_writes() {
        let mut t = MockTransport::with_chunks(vec![1]);
        t.push_inbound(&seek_pos(0, 7));
        let mut conn = connection(t);
        conn.seek(7, SeekType::Set, None).unwrap();
        assert_eq!(conn.transport().write_calls, 16);
        assert_eq!(conn.seek_generation(), 1);
    }

    #[test]
    fn test_cancel_before_send_does_not_commit() {
        let mut t = MockTransport::new();
        let mut state = ConnState::new(Arc::new(NoopLogger));
        let c = Cancellable::new().unwrap();
        c.cancel();

        let mut op = SeekOperation::new(100, SeekType::Set, 0);
        run_sync_state_machine(&mut t, &mut state, &mut op, Some(&c)).unwrap();
        assert!(matches!(op.into_result(), Err(StreamError::Cancelled)));
        assert_eq!(state.seek_generation, 0);
        assert_eq!(state.seq_nr, 0);
        assert!(t.written.is_empty());
    }

    #[test]
    fn test_cancel_after_send_commits_and_cancels_once() {
        let c = Cancellable::new().unwrap();
        let mut t = MockTransport::with_chunks(vec![2]);
        t.cancel_after_write = Some((1, c.clone()));
        t.push_inbound(&encode_error_reply(0, &RemoteError::cancelled()));
        let mut conn = connection(t);

        assert!(matches!(conn.seek(50, SeekType::Set, Some(&c)), Err(StreamError::Cancelled)));
        assert_eq!(conn.seek_generation(), 1);
        let written = &conn.transport().written;
        assert_eq!(written.len(), 32);
        assert_eq!(first_request(&written[16..]), (request::CANCEL, 1, 0, 0));
    }
}
