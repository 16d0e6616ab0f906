//! CLOSE state machine: tells the peer to release the file before the
//! streams go away.

use crate::connection::{ConnState, Incoming, InputState};
use crate::engine::{IoOperation, PendingRequest, StateMachine, StateOp};
use crate::error::StreamError;
use crate::protocol::request;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseState {
    Init,
    WroteRequest,
    HandleInput,
    SkipBlock,
    HandleHeader,
}

pub(crate) struct CloseOperation {
    state: CloseState,
    pending: PendingRequest,
    result: Option<Result<(), StreamError>>,
}

impl CloseOperation {
    pub fn new() -> Self {
        Self {
            state: CloseState::Init,
            pending: PendingRequest::default(),
            result: None,
        }
    }

    pub fn into_result(self) -> Result<(), StreamError> {
        self.result
            .unwrap_or_else(|| Err(StreamError::Framing("close ended without a result".into())))
    }

    fn finish(&mut self, res: Result<(), StreamError>) -> StateOp {
        self.result = Some(res);
        StateOp::Done
    }
}

impl StateMachine for CloseOperation {
    fn iterate(&mut self, conn: &mut ConnState, io: &mut IoOperation) -> StateOp {
        loop {
            match self.state {
                CloseState::Init => {
                    self.state = CloseState::WroteRequest;
                    return self.pending.start(conn, request::CLOSE, 0, 0);
                }

                CloseState::WroteRequest => match self.pending.wrote(conn, io) {
                    Err(e) => return self.finish(Err(e)),
                    Ok(Some(op)) => return op,
                    Ok(None) => self.state = CloseState::HandleInput,
                },

                CloseState::HandleInput => {
                    if let Some(op) = self.pending.cancel_if_requested(conn, io) {
                        self.state = CloseState::WroteRequest;
                        return op;
                    }
                    match conn.input_state {
                        InputState::InBlock => {
                            self.state = CloseState::SkipBlock;
                            return self.pending.skip_block(conn);
                        }
                        InputState::InReplyHeader => self.state = CloseState::HandleHeader,
                    }
                }

                CloseState::SkipBlock => {
                    if !io.io_cancelled {
                        conn.consume_block(io.io_res);
                    }
                    self.state = CloseState::HandleInput;
                }

                CloseState::HandleHeader => {
                    if io.io_cancelled {
                        self.state = CloseState::HandleInput;
                    } else {
                        match conn.take_reply() {
                            Incoming::NeedBytes(n) => return self.pending.read_header(conn, n),
                            Incoming::Data(reply) => {
                                conn.logger.reply_discarded("data during close", reply.seq_nr);
                                self.state = CloseState::HandleInput;
                            }
                            Incoming::Closed(reply) if self.pending.answers(&reply) => {
                                return self.finish(Ok(()));
                            }
                            Incoming::Error(reply, err) if self.pending.answers(&reply) => {
                                return self.finish(Err(StreamError::from_remote(err)));
                            }
                            Incoming::Closed(reply) => conn.logger.reply_discarded("stale close", reply.seq_nr),
                            Incoming::Error(reply, _) => conn.logger.reply_discarded("stale error", reply.seq_nr),
                            Incoming::SeekPos(reply) => conn.logger.reply_discarded("seek position during close", reply.seq_nr),
                            Incoming::Violation(msg) => return self.finish(Err(StreamError::Framing(msg))),
                        }
                    }
                }
            }
            io.clear();
        }
    }
}
