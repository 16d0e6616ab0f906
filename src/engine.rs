//! Generic driver for the per-operation state machines.
//!
//! Each iteration samples the cancellable, asks the operation what single
//! I/O call should happen next, performs exactly that call, and records the
//! outcome for the next iteration. Only a transport failure or the
//! operation's own `Done` ends the loop; a cancelled I/O call is just another
//! outcome the operation reacts to.

use crate::cancel::Cancellable;
use crate::connection::ConnState;
use crate::error::StreamError;
use crate::protocol::request;
use crate::protocol_core::Reply;
use crate::transport::{Transport, TransportError};
use std::io;

/// Where a read lands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadTarget {
    /// Appended to the connection's reply-header buffer
    Header,
    /// The operation's own buffer (`StateMachine::block_buffer`)
    Block,
}

/// The next step an operation wants the driver to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StateOp {
    /// Result is recorded on the operation
    Done,
    Read {
        target: ReadTarget,
        len: usize,
        allow_cancel: bool,
    },
    /// Write whatever is pending in the connection's output buffer
    Write { allow_cancel: bool },
    Skip { len: usize, allow_cancel: bool },
}

/// What the driver observed, handed back to the operation on the next call.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct IoOperation {
    /// Cancellation requested (sampled at the top of this iteration)
    pub cancelled: bool,
    /// Bytes moved by the last I/O call
    pub io_res: usize,
    /// The last I/O call was cancelled before moving any byte
    pub io_cancelled: bool,
}

impl IoOperation {
    /// Forget the last I/O outcome. Operations call this between internal
    /// state switches that performed no I/O.
    pub fn clear(&mut self) {
        self.io_res = 0;
        self.io_cancelled = false;
    }
}

pub(crate) trait StateMachine {
    /// Advance until an I/O call is needed or the operation is done.
    fn iterate(&mut self, conn: &mut ConnState, io: &mut IoOperation) -> StateOp;

    /// Destination for `ReadTarget::Block` reads
    fn block_buffer(&mut self) -> &mut [u8] {
        &mut []
    }
}

/// The request an operation is waiting on, and whether it was already
/// asked to be cancelled. Holds the steps read, seek and close share.
#[derive(Debug, Default)]
pub(crate) struct PendingRequest {
    pub seq_nr: u32,
    pub sent_cancel: bool,
}

impl PendingRequest {
    /// Queue the request. Cancellation is honored until its first byte is out.
    pub fn start(&mut self, conn: &mut ConnState, command: u32, arg1: u32, arg2: u32) -> StateOp {
        self.seq_nr = conn.append_request(command, arg1, arg2);
        StateOp::Write { allow_cancel: true }
    }

    /// Account for a write. `Ok(Some(_))` keeps writing, `Ok(None)` means the
    /// output buffer is flushed.
    pub fn wrote(&self, conn: &mut ConnState, io: &IoOperation) -> Result<Option<StateOp>, StreamError> {
        if io.io_cancelled {
            if !self.sent_cancel {
                conn.unappend_request();
            }
            return Err(StreamError::Cancelled);
        }
        if conn.consume_output(io.io_res) {
            return Ok(Some(StateOp::Write { allow_cancel: false }));
        }
        Ok(None)
    }

    /// Queue a CANCEL for this request the first time cancellation is seen.
    pub fn cancel_if_requested(&mut self, conn: &mut ConnState, io: &IoOperation) -> Option<StateOp> {
        if !io.cancelled || self.sent_cancel {
            return None;
        }
        self.sent_cancel = true;
        conn.append_request(request::CANCEL, self.seq_nr, 0);
        Some(StateOp::Write { allow_cancel: false })
    }

    /// Header reads may only be cancelled before any header byte arrived.
    pub fn read_header(&self, conn: &ConnState, missing: usize) -> StateOp {
        StateOp::Read {
            target: ReadTarget::Header,
            len: missing,
            allow_cancel: conn.input_buffer.is_empty() && !self.sent_cancel,
        }
    }

    pub fn skip_block(&self, conn: &ConnState) -> StateOp {
        StateOp::Skip {
            len: conn.input_block_size,
            allow_cancel: !self.sent_cancel,
        }
    }

    pub fn answers(&self, reply: &Reply) -> bool {
        reply.seq_nr == self.seq_nr
    }
}

fn peer_closed(want_write: bool) -> StreamError {
    if want_write {
        StreamError::Io(io::Error::new(io::ErrorKind::WriteZero, "peer stopped accepting requests"))
    } else {
        StreamError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer"))
    }
}

/// Run `op` to completion over `transport`.
///
/// `Err` means the transport failed and the connection's framing state is
/// unknown; the operation's own success or failure is recorded on `op`.
pub(crate) fn run_sync_state_machine<T: Transport, M: StateMachine>(
    transport: &mut T,
    conn: &mut ConnState,
    op: &mut M,
    cancellable: Option<&Cancellable>,
) -> Result<(), StreamError> {
    let mut io_op = IoOperation::default();
    let allowed = |allow: bool| if allow { cancellable } else { None };

    loop {
        io_op.cancelled = cancellable.is_some_and(|c| c.is_cancelled());

        let step = op.iterate(conn, &mut io_op);
        let (res, want, is_write) = match step {
            StateOp::Done => return Ok(()),
            StateOp::Read { len: 0, .. } | StateOp::Skip { len: 0, .. } => (Ok(0), 0, false),
            StateOp::Write { allow_cancel } => {
                let want = conn.output_buffer.len();
                (transport.write(&conn.output_buffer, allowed(allow_cancel)), want, true)
            }
            StateOp::Read {
                target: ReadTarget::Header,
                len,
                allow_cancel,
            } => {
                let start = conn.input_buffer.len();
                conn.input_buffer.resize(start + len, 0);
                let res = transport.read(&mut conn.input_buffer[start..], allowed(allow_cancel));
                let got = *res.as_ref().unwrap_or(&0);
                conn.input_buffer.truncate(start + got);
                (res, len, false)
            }
            StateOp::Read {
                target: ReadTarget::Block,
                len,
                allow_cancel,
            } => {
                let buf = op.block_buffer();
                let len = len.min(buf.len());
                (transport.read(&mut buf[..len], allowed(allow_cancel)), len, false)
            }
            StateOp::Skip { len, allow_cancel } => (transport.skip(len, allowed(allow_cancel)), len, false),
        };

        match res {
            Ok(0) if want > 0 => return Err(peer_closed(is_write)),
            Ok(n) => {
                io_op.io_res = n;
                io_op.io_cancelled = false;
            }
            Err(TransportError::Cancelled) => {
                io_op.io_res = 0;
                io_op.io_cancelled = true;
            }
            Err(TransportError::Io(e)) => return Err(StreamError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoopLogger;
    use crate::transport::mock::MockTransport;
    use std::sync::Arc;

    /// Writes the pending output, then reads `want` bytes into its buffer.
    struct Echo {
        state: u8,
        buf: Vec<u8>,
        seen: Vec<IoOperation>,
    }

    impl StateMachine for Echo {
        fn iterate(&mut self, conn: &mut ConnState, io: &mut IoOperation) -> StateOp {
            self.seen.push(*io);
            match self.state {
                0 => {
                    self.state = 1;
                    StateOp::Write { allow_cancel: true }
                }
                1 => {
                    if conn.consume_output(io.io_res) {
                        return StateOp::Write { allow_cancel: false };
                    }
                    self.state = 2;
                    StateOp::Read {
                        target: ReadTarget::Block,
                        len: self.buf.len(),
                        allow_cancel: false,
                    }
                }
                _ => StateOp::Done,
            }
        }

        fn block_buffer(&mut self) -> &mut [u8] {
            &mut self.buf
        }
    }

    fn conn() -> ConnState {
        ConnState::new(Arc::new(NoopLogger))
    }

    #[test]
    fn test_driver_loops_over_short_writes() {
        let mut t = MockTransport::with_chunks(vec![3]);
        t.push_inbound(b"zz");
        let mut c = conn();
        c.output_buffer.extend_from_slice(b"0123456789");
        let mut op = Echo {
            state: 0,
            buf: vec![0; 2],
            seen: Vec::new(),
        };
        run_sync_state_machine(&mut t, &mut c, &mut op, None).unwrap();
        assert_eq!(t.written, b"0123456789");
        assert_eq!(t.write_calls, 4);
        assert_eq!(op.buf, b"zz");
    }

    #[test]
    fn test_driver_reports_cancelled_io_without_failing() {
        let mut t = MockTransport::new();
        let c = Cancellable::new().unwrap();
        c.cancel();
        let mut cs = conn();
        cs.output_buffer.extend_from_slice(b"abc");

        struct CancelProbe {
            first: bool,
            saw: Option<IoOperation>,
        }
        impl StateMachine for CancelProbe {
            fn iterate(&mut self, _conn: &mut ConnState, io: &mut IoOperation) -> StateOp {
                if self.first {
                    self.first = false;
                    return StateOp::Write { allow_cancel: true };
                }
                self.saw = Some(*io);
                StateOp::Done
            }
        }

        let mut op = CancelProbe { first: true, saw: None };
        run_sync_state_machine(&mut t, &mut cs, &mut op, Some(&c)).unwrap();
        let saw = op.saw.unwrap();
        assert!(saw.cancelled);
        assert!(saw.io_cancelled);
        assert_eq!(saw.io_res, 0);
        assert!(t.written.is_empty());
    }

    #[test]
    fn test_driver_treats_eof_as_fatal() {
        let mut t = MockTransport::new();
        let mut cs = conn();

        struct WantsHeader;
        impl StateMachine for WantsHeader {
            fn iterate(&mut self, _conn: &mut ConnState, _io: &mut IoOperation) -> StateOp {
                StateOp::Read {
                    target: ReadTarget::Header,
                    len: 16,
                    allow_cancel: false,
                }
            }
        }

        let err = run_sync_state_machine(&mut t, &mut cs, &mut WantsHeader, None).unwrap_err();
        assert!(err.is_fatal());
        assert!(cs.input_buffer.is_empty());
    }

    #[test]
    fn test_header_reads_accumulate_in_connection_buffer() {
        let mut t = MockTransport::with_chunks(vec![5]);
        t.push_inbound(&[7u8; 16]);
        let mut cs = conn();

        struct FillHeader;
        impl StateMachine for FillHeader {
            fn iterate(&mut self, conn: &mut ConnState, _io: &mut IoOperation) -> StateOp {
                let missing = 16 - conn.input_buffer.len();
                if missing == 0 {
                    return StateOp::Done;
                }
                StateOp::Read {
                    target: ReadTarget::Header,
                    len: missing,
                    allow_cancel: false,
                }
            }
        }

        run_sync_state_machine(&mut t, &mut cs, &mut FillHeader, None).unwrap();
        assert_eq!(cs.input_buffer, vec![7u8; 16]);
        assert_eq!(t.read_calls, 4);
    }
}
