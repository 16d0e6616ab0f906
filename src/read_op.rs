//! READ state machine

use crate::connection::{ConnState, InputState, Incoming};
use crate::engine::{IoOperation, PendingRequest, ReadTarget, StateMachine, StateOp};
use crate::error::StreamError;
use crate::protocol::request;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Init,
    WroteCommand,
    HandleInput,
    HandleInputBlock,
    SkipBlock,
    HandleHeader,
    ReadBlock,
}

pub(crate) struct ReadOperation<'a> {
    buffer: &'a mut [u8],
    state: ReadState,
    pending: PendingRequest,
    result: Option<Result<usize, StreamError>>,
}

impl<'a> ReadOperation<'a> {
    /// `buffer` must already be clamped to `MAX_READ_SIZE`.
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            buffer,
            state: ReadState::Init,
            pending: PendingRequest::default(),
            result: None,
        }
    }

    pub fn into_result(self) -> Result<usize, StreamError> {
        self.result
            .unwrap_or_else(|| Err(StreamError::Framing("read ended without a result".into())))
    }

    fn finish(&mut self, res: Result<usize, StreamError>) -> StateOp {
        self.result = Some(res);
        StateOp::Done
    }

    fn read_block(&self, conn: &ConnState, allow_cancel: bool) -> StateOp {
        StateOp::Read {
            target: ReadTarget::Block,
            len: self.buffer.len().min(conn.input_block_size),
            allow_cancel,
        }
    }
}

impl StateMachine for ReadOperation<'_> {
    fn iterate(&mut self, conn: &mut ConnState, io: &mut IoOperation) -> StateOp {
        loop {
            match self.state {
                ReadState::Init => {
                    // Rest of a block from an earlier read at this offset: no request needed
                    if conn.input_state == InputState::InBlock && conn.block_is_current() {
                        self.state = ReadState::ReadBlock;
                        return self.read_block(conn, true);
                    }
                    self.state = ReadState::WroteCommand;
                    return self
                        .pending
                        .start(conn, request::READ, self.buffer.len() as u32, 0);
                }

                ReadState::WroteCommand => match self.pending.wrote(conn, io) {
                    Err(e) => return self.finish(Err(e)),
                    Ok(Some(op)) => return op,
                    Ok(None) => self.state = ReadState::HandleInput,
                },

                ReadState::HandleInput => {
                    if let Some(op) = self.pending.cancel_if_requested(conn, io) {
                        self.state = ReadState::WroteCommand;
                        return op;
                    }
                    self.state = match conn.input_state {
                        InputState::InBlock => ReadState::HandleInputBlock,
                        InputState::InReplyHeader => ReadState::HandleHeader,
                    };
                }

                ReadState::HandleInputBlock => {
                    if conn.block_is_current() {
                        self.state = ReadState::ReadBlock;
                        return self.read_block(conn, false);
                    }
                    // Answers a read issued before the last seek
                    self.state = ReadState::SkipBlock;
                    return self.pending.skip_block(conn);
                }

                ReadState::SkipBlock => {
                    if !io.io_cancelled {
                        conn.consume_block(io.io_res);
                    }
                    self.state = ReadState::HandleInput;
                }

                ReadState::HandleHeader => {
                    if io.io_cancelled {
                        self.state = ReadState::HandleInput;
                    } else {
                        match conn.take_reply() {
                            Incoming::NeedBytes(n) => return self.pending.read_header(conn, n),
                            Incoming::Data(reply) => {
                                if !conn.block_is_current() {
                                    conn.logger.reply_discarded("stale data block", reply.seq_nr);
                                }
                                self.state = ReadState::HandleInputBlock;
                            }
                            Incoming::Error(reply, err) if self.pending.answers(&reply) => {
                                return self.finish(Err(StreamError::from_remote(err)));
                            }
                            Incoming::Error(reply, _) => conn.logger.reply_discarded("stale error", reply.seq_nr),
                            Incoming::SeekPos(reply) => conn.logger.reply_discarded("seek position during read", reply.seq_nr),
                            Incoming::Closed(reply) => conn.logger.reply_discarded("closed during read", reply.seq_nr),
                            Incoming::Violation(msg) => return self.finish(Err(StreamError::Framing(msg))),
                        }
                    }
                }

                ReadState::ReadBlock => {
                    if io.io_cancelled {
                        return self.finish(Err(StreamError::Cancelled));
                    }
                    conn.consume_block(io.io_res);
                    return self.finish(Ok(io.io_res));
                }
            }
            io.clear();
        }
    }

    fn block_buffer(&mut self) -> &mut [u8] {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::Cancellable;
    use crate::connection::Connection;
    use crate::engine::run_sync_state_machine;
    use crate::error::RemoteError;
    use crate::logger::{Logger, NoopLogger};
    use crate::protocol::{code, reply};
    use crate::protocol_core::{decode_request, encode_error_reply, encode_reply, encode_request};
    use crate::seek_op::SeekType;
    use crate::transport::mock::MockTransport;
    use std::sync::Arc;

    fn connection(t: MockTransport) -> Connection<MockTransport> {
        Connection::new(t, Arc::new(NoopLogger))
    }

    fn data(seq: u32, gen: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = encode_reply(reply::DATA, seq, payload.len() as u32, gen).to_vec();
        out.extend_from_slice(payload);
        out
    }

    fn requests(written: &[u8]) -> Vec<(u32, u32, u32, u32)> {
        written
            .chunks(16)
            .map(|c| {
                let mut rec = [0u8; 16];
                rec.copy_from_slice(c);
                let r = decode_request(&rec);
                (r.command, r.seq_nr, r.arg1, r.arg2)
            })
            .collect()
    }

    fn pattern(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_read_sends_request_and_copies_block() {
        let mut t = MockTransport::new();
        t.push_inbound(&data(0, 0, b"hello"));
        let mut conn = connection(t);

        let mut buf = [0u8; 1024];
        let n = conn.read(&mut buf, None).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(conn.tell(), 5);
        assert_eq!(requests(&conn.transport().written), vec![(request::READ, 0, 1024, 0)]);
        assert!(conn.buffered_block().is_none());
    }

    #[test]
    fn test_zero_length_read_does_no_io() {
        let mut conn = connection(MockTransport::new());
        assert_eq!(conn.read(&mut [], None).unwrap(), 0);
        assert!(conn.transport().written.is_empty());
        assert_eq!(conn.next_seq_nr(), 0);
    }

    #[test]
    fn test_zero_length_block_is_eof() {
        let mut t = MockTransport::new();
        t.push_inbound(&data(0, 0, b""));
        let mut conn = connection(t);
        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf, None).unwrap(), 0);
        assert!(conn.buffered_block().is_none());
        assert!(!conn.is_broken());
    }

    #[test]
    fn test_partial_block_is_reused_without_new_request() {
        let body = pattern(600);
        let mut t = MockTransport::new();
        t.push_inbound(&data(0, 0, &body));
        let mut conn = connection(t);

        let mut first = [0u8; 100];
        assert_eq!(conn.read(&mut first, None).unwrap(), 100);
        assert_eq!(conn.buffered_block(), Some((500, 0)));

        let mut rest = [0u8; 1024];
        assert_eq!(conn.read(&mut rest, None).unwrap(), 500);
        assert_eq!(&first[..], &body[..100]);
        assert_eq!(&rest[..500], &body[100..]);
        // The second read never hit the wire
        assert_eq!(requests(&conn.transport().written).len(), 1);
        assert_eq!(conn.tell(), 600);
    }

    #[test]
    fn test_seek_between_reads_skips_buffered_block() {
        let body = pattern(600);
        let mut t = MockTransport::new();
        t.push_inbound(&data(0, 0, &body));
        t.push_inbound(&encode_reply(reply::SEEK_POS, 1, 0, 0));
        t.push_inbound(&data(2, 1, b"fresh"));
        let mut conn = connection(t);

        let mut buf = [0u8; 100];
        assert_eq!(conn.read(&mut buf, None).unwrap(), 100);
        assert_eq!(conn.seek(0, SeekType::Set, None).unwrap(), 0);
        assert_eq!(conn.transport().skipped, 500);

        let mut buf = [0u8; 1024];
        let n = conn.read(&mut buf, None).unwrap();
        assert_eq!(&buf[..n], b"fresh");
        assert_eq!(
            requests(&conn.transport().written),
            vec![
                (request::READ, 0, 100, 0),
                (request::SEEK_SET, 1, 0, 0),
                (request::READ, 2, 1024, 0),
            ]
        );
    }

    #[test]
    fn test_stale_generation_block_is_discarded() {
        let mut t = MockTransport::new();
        t.push_inbound(&encode_reply(reply::SEEK_POS, 0, 10, 0));
        // Pre-seek data still in flight, then the answer to the new read
        t.push_inbound(&data(0, 0, &pattern(50)));
        t.push_inbound(&data(1, 1, b"after"));
        let mut conn = connection(t);

        assert_eq!(conn.seek(10, SeekType::Set, None).unwrap(), 10);
        assert_eq!(conn.seek_generation(), 1);
        let mut buf = [0u8; 64];
        let n = conn.read(&mut buf, None).unwrap();
        assert_eq!(&buf[..n], b"after");
        assert_eq!(conn.transport().skipped, 50);
        assert_eq!(conn.tell(), 15);
    }

    #[derive(Default)]
    struct Discards(parking_lot::Mutex<Vec<(String, u32)>>);

    impl Logger for Discards {
        fn reply_discarded(&self, reason: &str, seq_nr: u32) {
            self.0.lock().push((reason.to_string(), seq_nr));
        }
    }

    #[test]
    fn test_stale_block_discard_is_logged_with_its_seq_nr() {
        let mut t = MockTransport::new();
        t.push_inbound(&encode_reply(reply::SEEK_POS, 0, 10, 0));
        t.push_inbound(&data(0, 0, &pattern(50)));
        t.push_inbound(&data(1, 1, b"after"));
        let logger = Arc::new(Discards::default());
        let mut conn = Connection::new(t, logger.clone());

        conn.seek(10, SeekType::Set, None).unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(conn.read(&mut buf, None).unwrap(), 5);
        assert_eq!(*logger.0.lock(), vec![("stale data block".to_string(), 0)]);
    }

    #[test]
    fn test_error_reply_for_request_is_returned() {
        let mut t = MockTransport::new();
        t.push_inbound(&encode_error_reply(0, &RemoteError::io(code::PERMISSION_DENIED, "denied")));
        t.push_inbound(&data(1, 0, b"ok"));
        let mut conn = connection(t);

        let mut buf = [0u8; 16];
        match conn.read(&mut buf, None) {
            Err(StreamError::Remote(e)) => {
                assert_eq!(e.domain, "vfs-io-error");
                assert_eq!(e.code, code::PERMISSION_DENIED);
                assert_eq!(e.message, "denied");
            }
            other => panic!("unexpected {other:?}"),
        }
        // Not fatal: the next read goes through
        assert_eq!(conn.read(&mut buf, None).unwrap(), 2);
        assert_eq!(conn.tell(), 2);
    }

    #[test]
    fn test_unrelated_replies_are_skipped_over() {
        let mut t = MockTransport::new();
        t.push_inbound(&encode_error_reply(41, &RemoteError::io(code::FAILED, "old")));
        t.push_inbound(&encode_reply(reply::SEEK_POS, 0, 99, 0));
        t.push_inbound(&encode_reply(reply::CLOSED, 40, 0, 0));
        t.push_inbound(&data(0, 0, b"data"));
        let mut conn = connection(t);

        let mut buf = [0u8; 16];
        assert_eq!(conn.read(&mut buf, None).unwrap(), 4);
        assert_eq!(&buf[..4], b"data");
    }

    #[test]
    fn test_unknown_reply_type_breaks_connection() {
        let mut t = MockTransport::new();
        t.push_inbound(&encode_reply(9, 0, 0, 0));
        let mut conn = connection(t);

        let mut buf = [0u8; 16];
        assert!(matches!(conn.read(&mut buf, None), Err(StreamError::Framing(_))));
        assert!(conn.is_broken());
        let before = conn.transport().written.len();
        assert!(matches!(conn.read(&mut buf, None), Err(StreamError::Io(_))));
        assert_eq!(conn.transport().written.len(), before);
    }

    #[test]
    fn test_peer_hangup_is_fatal() {
        let mut t = MockTransport::new();
        t.push_inbound(&encode_reply(reply::DATA, 0, 10, 0)[..9]);
        let mut conn = connection(t);
        let mut buf = [0u8; 16];
        match conn.read(&mut buf, None) {
            Err(StreamError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected {other:?}"),
        }
        assert!(conn.is_broken());
    }

    #[test]
    fn test_cancel_before_send_leaves_no_gap() {
        let mut t = MockTransport::new();
        let mut state = ConnState::new(Arc::new(NoopLogger));
        let c = Cancellable::new().unwrap();
        c.cancel();

        let mut buf = [0u8; 32];
        let mut op = ReadOperation::new(&mut buf);
        run_sync_state_machine(&mut t, &mut state, &mut op, Some(&c)).unwrap();
        assert!(matches!(op.into_result(), Err(StreamError::Cancelled)));
        assert!(t.written.is_empty());
        assert_eq!(state.seq_nr, 0);
        assert!(state.output_buffer.is_empty());

        // Next request reuses sequence number 0
        c.reset();
        t.push_inbound(&data(0, 0, b"x"));
        let mut buf = [0u8; 32];
        let mut op = ReadOperation::new(&mut buf);
        run_sync_state_machine(&mut t, &mut state, &mut op, Some(&c)).unwrap();
        assert_eq!(op.into_result().unwrap(), 1);
        assert_eq!(requests(&t.written), vec![(request::READ, 0, 32, 0)]);
    }

    #[test]
    fn test_connection_read_rejects_already_cancelled() {
        let mut conn = connection(MockTransport::new());
        let c = Cancellable::new().unwrap();
        c.cancel();
        let mut buf = [0u8; 8];
        assert!(matches!(conn.read(&mut buf, Some(&c)), Err(StreamError::Cancelled)));
        assert!(conn.transport().written.is_empty());
        assert!(!conn.is_broken());
    }

    #[test]
    fn test_cancel_after_send_writes_one_cancel() {
        let c = Cancellable::new().unwrap();
        let mut t = MockTransport::with_chunks(vec![1]);
        t.cancel_after_write = Some((1, c.clone()));
        t.push_inbound(&encode_error_reply(0, &RemoteError::cancelled()));
        let mut conn = connection(t);

        let mut buf = [0u8; 64];
        assert!(matches!(conn.read(&mut buf, Some(&c)), Err(StreamError::Cancelled)));
        let reqs = requests(&conn.transport().written);
        assert_eq!(reqs, vec![(request::READ, 0, 64, 0), (request::CANCEL, 1, 0, 0)]);
        assert_eq!(conn.next_seq_nr(), 2);
        assert!(!conn.is_broken());
    }

    #[test]
    fn test_cancel_losing_the_race_still_returns_data() {
        let c = Cancellable::new().unwrap();
        let mut t = MockTransport::new();
        t.cancel_after_write = Some((1, c.clone()));
        t.push_inbound(&data(0, 0, b"late"));
        let mut conn = connection(t);

        let mut buf = [0u8; 64];
        assert_eq!(conn.read(&mut buf, Some(&c)).unwrap(), 4);
        let cancels = requests(&conn.transport().written)
            .iter()
            .filter(|r| r.0 == request::CANCEL)
            .count();
        assert_eq!(cancels, 1);
    }

    #[test]
    fn test_cancel_while_skipping_stale_block() {
        let c = Cancellable::new().unwrap();
        let mut t = MockTransport::with_chunks(vec![4]);
        t.push_inbound(&encode_reply(reply::SEEK_POS, 0, 0, 0));
        t.push_inbound(&data(0, 0, &pattern(40)));
        t.push_inbound(&encode_error_reply(1, &RemoteError::cancelled()));
        let mut conn = connection(t);
        assert_eq!(conn.seek(0, SeekType::Set, None).unwrap(), 0);

        // Fire on the first header read of the stale block (read call #5 after
        // the SEEK_POS header took four)
        conn.transport_mut().cancel_after_read = Some((5, c.clone()));
        let mut buf = [0u8; 64];
        assert!(matches!(conn.read(&mut buf, Some(&c)), Err(StreamError::Cancelled)));
        assert_eq!(conn.transport().skipped, 40);
        let cancels: Vec<_> = requests(&conn.transport().written)
            .into_iter()
            .filter(|r| r.0 == request::CANCEL)
            .collect();
        assert_eq!(cancels, vec![(request::CANCEL, 2, 1, 0)]);
    }

    /// Replays one fixed session and records everything observable.
    fn replay(chunks: Vec<usize>) -> (Vec<u8>, u64, String, Vec<u8>) {
        let mut t = MockTransport::with_chunks(chunks);
        t.push_inbound(&data(0, 0, &pattern(600)));
        t.push_inbound(&encode_reply(reply::SEEK_POS, 1, 100, 0));
        t.push_inbound(&data(2, 1, &pattern(20)));
        t.push_inbound(&encode_error_reply(3, &RemoteError::new("afc-error", 8, "device locked")));
        let mut conn = connection(t);

        let mut collected = Vec::new();
        let mut buf = [0u8; 1024];
        while collected.len() < 600 {
            let n = conn.read(&mut buf, None).unwrap();
            collected.extend_from_slice(&buf[..n]);
        }
        let pos = conn.seek(100, SeekType::Set, None).unwrap();
        let mut second = 0;
        while second < 20 {
            let n = conn.read(&mut buf, None).unwrap();
            collected.extend_from_slice(&buf[..n]);
            second += n;
        }
        let err = match conn.read(&mut buf, None) {
            Err(StreamError::Remote(e)) => format!("{}:{}:{}", e.domain, e.code, e.message),
            other => format!("{other:?}"),
        };
        (collected, pos, err, conn.transport().written.clone())
    }

    #[test]
    fn test_partial_io_converges() {
        let whole = replay(Vec::new());
        assert_eq!(whole.1, 100);
        assert_eq!(whole.2, "afc-error:8:device locked");
        let mut expected = pattern(600);
        expected.extend_from_slice(&pattern(20));
        assert_eq!(whole.0, expected);

        for chunks in [vec![1], vec![2, 3], vec![7], vec![16, 1], vec![5, 11, 1, 600]] {
            assert_eq!(replay(chunks.clone()), whole, "chunk pattern {chunks:?}");
        }
    }

    #[test]
    fn test_read_request_is_clamped() {
        let mut t = MockTransport::new();
        t.push_inbound(&data(0, 0, b"z"));
        let mut conn = connection(t);
        let mut big = vec![0u8; crate::protocol::MAX_READ_SIZE + 10];
        assert_eq!(conn.read(&mut big, None).unwrap(), 1);
        let written = &conn.transport().written;
        assert_eq!(
            &written[..],
            &encode_request(request::READ, 0, crate::protocol::MAX_READ_SIZE as u32, 0)
        );
    }
}
