//! Tokio daemon: control socket accept loop and the per-handle read channel.
//!
//! Each accepted control connection performs one OPEN_FOR_READ handshake on a
//! blocking thread (descriptor passing is a plain `sendmsg`). On success the
//! daemon keeps one end of a fresh socket pair and runs a read channel on
//! it: a reader task feeds decoded requests through an mpsc channel, and the
//! channel loop runs at most one backend job at a time on `spawn_blocking`,
//! with later requests waiting in arrival order.

use crate::backend::{Backend, JobContext};
use crate::bootstrap::{read_control_frame, write_control_frame};
use crate::error::RemoteError;
use crate::log::{AccessLog, HandleLogEntry, HandleStatus};
use crate::logger::{Logger, NoopLogger};
use crate::protocol::{code, frame, reply, request, timeouts, MAX_READ_SIZE, REQUEST_SIZE};
use crate::protocol_core::{decode_request, encode_control_error, encode_error_reply, encode_reply, join_offset, split_offset, Request};
use crate::seek_op::SeekType;
use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use uuid::Uuid;

pub struct Daemon<B: Backend> {
    backend: Arc<B>,
    logger: Arc<dyn Logger>,
    access_log: Option<Arc<AccessLog>>,
}

impl<B: Backend> Clone for Daemon<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            logger: self.logger.clone(),
            access_log: self.access_log.clone(),
        }
    }
}

/// Bind the control socket, replacing a stale socket file left by an
/// earlier run.
pub fn bind(socket_path: &Path) -> Result<UnixListener> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    if socket_path.exists() {
        std::fs::remove_file(socket_path)
            .with_context(|| format!("remove stale socket {}", socket_path.display()))?;
    }
    UnixListener::bind(socket_path).with_context(|| format!("bind {}", socket_path.display()))
}

struct OpenedChannel<H> {
    handle_id: Uuid,
    path: String,
    handle: H,
    stream: std::os::unix::net::UnixStream,
}

impl<B: Backend> Daemon<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            logger: Arc::new(NoopLogger),
            access_log: None,
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_access_log(mut self, log: Arc<AccessLog>) -> Self {
        self.access_log = Some(log);
        self
    }

    fn log_access(&self, entry: HandleLogEntry) {
        if let Some(log) = &self.access_log {
            if let Err(e) = log.add_entry(&entry) {
                self.logger.error("access log", &format!("{e:#}"));
            }
        }
    }

    /// Accept control connections until the listener fails.
    pub async fn serve(self, listener: UnixListener) -> Result<()> {
        loop {
            let (stream, _) = listener.accept().await.context("accept control connection")?;
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_control(stream).await {
                    this.logger.error("control", &format!("{e:#}"));
                }
            });
        }
    }

    async fn handle_control(&self, stream: UnixStream) -> Result<()> {
        let std_stream = stream.into_std()?;
        std_stream.set_nonblocking(false)?;
        std_stream.set_read_timeout(Some(Duration::from_millis(timeouts::CONTROL_REQUEST_MS)))?;

        let this = self.clone();
        let opened = tokio::task::spawn_blocking(move || this.open_handshake(std_stream))
            .await
            .context("open handshake task")??;

        let Some(opened) = opened else {
            return Ok(());
        };
        opened.stream.set_nonblocking(true)?;
        let stream = UnixStream::from_std(opened.stream)?;

        let channel = ReadChannel::new(self.backend.clone(), opened.handle, self.logger.clone());
        let stats = channel.run(stream).await;

        self.logger.closed(&opened.path);
        let mut entry = HandleLogEntry::new(opened.handle_id, &opened.path, HandleStatus::Closed);
        entry.bytes_served = stats.bytes_served;
        entry.seeks = stats.seeks;
        entry.error = stats.error;
        self.log_access(entry);
        Ok(())
    }

    /// Blocking half of the handshake: read OPEN_FOR_READ, open through the
    /// backend, and answer with OPENED (+ descriptor) or ERROR.
    fn open_handshake(&self, control: std::os::unix::net::UnixStream) -> Result<Option<OpenedChannel<B::Handle>>> {
        let req = read_control_frame(&control).context("read open request")?;
        let handle_id = Uuid::new_v4();

        let path = match (req.frame_type, String::from_utf8(req.payload)) {
            (frame::OPEN_FOR_READ, Ok(path)) => path,
            _ => {
                let err = RemoteError::io(code::INVALID_ARGUMENT, "Invalid open request");
                write_control_frame(&control, frame::ERROR, &encode_control_error(&err), None)?;
                return Ok(None);
            }
        };

        let job = JobContext::new();
        match self.backend.open_for_read(&path, &job).into_result() {
            Ok(opened) => {
                let (ours, theirs) = std::os::unix::net::UnixStream::pair()?;
                write_control_frame(
                    &control,
                    frame::OPENED,
                    &[u8::from(opened.can_seek)],
                    Some(theirs.as_raw_fd()),
                )?;
                self.logger.opened(&path, opened.can_seek);
                self.log_access(HandleLogEntry::new(handle_id, &path, HandleStatus::Opened));
                Ok(Some(OpenedChannel {
                    handle_id,
                    path,
                    handle: opened.handle,
                    stream: ours,
                }))
            }
            Err(err) => {
                self.logger.error("open", &format!("{path}: {err}"));
                let mut entry = HandleLogEntry::new(handle_id, &path, HandleStatus::Failed);
                entry.error = Some(err.to_string());
                self.log_access(entry);
                write_control_frame(&control, frame::ERROR, &encode_control_error(&err), None)?;
                Ok(None)
            }
        }
    }
}

/// What a finished job hands back to the channel loop. The handle travels
/// with the job and returns with its result.
enum JobDone<H> {
    Read {
        seq_nr: u32,
        generation: u32,
        handle: H,
        result: Result<Vec<u8>, RemoteError>,
    },
    Seek {
        seq_nr: u32,
        handle: H,
        result: Result<u64, RemoteError>,
    },
    Close {
        seq_nr: u32,
        result: Result<(), RemoteError>,
    },
}

#[derive(Debug, Default)]
pub struct ChannelStats {
    pub bytes_served: u64,
    pub seeks: u64,
    pub error: Option<String>,
}

struct RunningJob {
    seq_nr: u32,
    job: JobContext,
}

/// A request waiting for the running job to finish
struct QueuedRequest {
    req: Request,
    /// Seek generation in force when the request arrived
    generation: u32,
    cancelled: bool,
}

pub struct ReadChannel<B: Backend> {
    backend: Arc<B>,
    handle: Option<B::Handle>,
    seek_generation: u32,
    running: Option<RunningJob>,
    queued: VecDeque<QueuedRequest>,
    stats: ChannelStats,
    logger: Arc<dyn Logger>,
}

impl<B: Backend> ReadChannel<B> {
    pub fn new(backend: Arc<B>, handle: B::Handle, logger: Arc<dyn Logger>) -> Self {
        Self {
            backend,
            handle: Some(handle),
            seek_generation: 0,
            running: None,
            queued: VecDeque::new(),
            stats: ChannelStats::default(),
            logger,
        }
    }

    /// Serve requests until the peer goes away, then release the handle.
    pub async fn run(mut self, stream: UnixStream) -> ChannelStats {
        let (mut rd, mut wr) = stream.into_split();
        let (req_tx, mut req_rx) = mpsc::channel::<Request>(32);
        let reader = tokio::spawn(async move {
            let mut rec = [0u8; REQUEST_SIZE];
            while rd.read_exact(&mut rec).await.is_ok() {
                if req_tx.send(decode_request(&rec)).await.is_err() {
                    break;
                }
            }
        });
        let (done_tx, mut done_rx) = mpsc::channel::<JobDone<B::Handle>>(1);

        loop {
            let out = tokio::select! {
                req = req_rx.recv() => {
                    let Some(req) = req else { break };
                    self.receive(req);
                    self.start_queued(&done_tx)
                }
                Some(done) = done_rx.recv() => {
                    self.running = None;
                    let mut out = self.complete(done);
                    out.extend(self.start_queued(&done_tx));
                    out
                }
            };
            if out.is_empty() {
                continue;
            }
            if let Err(e) = wr.write_all(&out).await {
                self.stats.error = Some(e.to_string());
                break;
            }
        }
        reader.abort();
        if !self.queued.is_empty() {
            self.logger.error(
                "read channel",
                &format!("{} queued requests dropped on disconnect", self.queued.len()),
            );
            self.queued.clear();
        }

        // A job still owns the handle; stop it and take the handle back
        if let Some(running) = self.running.take() {
            running.job.cancel();
            if let Some(done) = done_rx.recv().await {
                self.complete(done);
            }
        }
        if let Some(handle) = self.handle.take() {
            let backend = self.backend.clone();
            let res = tokio::task::spawn_blocking(move || backend.close_read(handle, &JobContext::new()).into_result()).await;
            if let Ok(Err(e)) = res {
                self.logger.error("close on disconnect", &e.to_string());
            }
        }
        self.stats
    }

    /// Route a CANCEL, or queue the request behind any running job.
    fn receive(&mut self, req: Request) {
        self.logger.request(req.command, req.seq_nr, req.arg1, req.arg2);

        if req.command == request::CANCEL {
            if let Some(running) = self.running.as_ref().filter(|r| r.seq_nr == req.arg1) {
                running.job.cancel();
            } else if let Some(queued) = self.queued.iter_mut().find(|q| q.req.seq_nr == req.arg1) {
                queued.cancelled = true;
            } else {
                self.logger.reply_discarded("cancel for idle request", req.arg1);
            }
            return;
        }

        if matches!(req.command, request::SEEK_SET | request::SEEK_CUR | request::SEEK_END) {
            // Requests sent after this seek see the new generation
            self.seek_generation = self.seek_generation.wrapping_add(1);
            self.stats.seeks += 1;
        }
        self.queued.push_back(QueuedRequest {
            req,
            generation: self.seek_generation,
            cancelled: false,
        });
    }

    /// Start queued requests in arrival order until one becomes a running
    /// job. Returns replies for requests answered without a job.
    fn start_queued(&mut self, done_tx: &mpsc::Sender<JobDone<B::Handle>>) -> Vec<u8> {
        let mut out = Vec::new();
        while self.running.is_none() {
            let Some(queued) = self.queued.pop_front() else { break };
            if queued.cancelled {
                out.extend(self.error_reply(queued.req.seq_nr, &RemoteError::cancelled()));
                continue;
            }
            if let Some(reply) = self.start(queued.req, queued.generation, done_tx) {
                out.extend(reply);
            }
        }
        out
    }

    /// Start a job for `req`, or answer it directly.
    fn start(&mut self, req: Request, generation: u32, done_tx: &mpsc::Sender<JobDone<B::Handle>>) -> Option<Vec<u8>> {
        let seek_type = match req.command {
            request::READ | request::CLOSE => None,
            request::SEEK_SET => Some(SeekType::Set),
            request::SEEK_CUR => Some(SeekType::Cur),
            request::SEEK_END => Some(SeekType::End),
            other => {
                let err = RemoteError::io(code::INVALID_ARGUMENT, format!("Unknown request {other}"));
                return Some(self.error_reply(req.seq_nr, &err));
            }
        };

        let Some(mut handle) = self.handle.take() else {
            let err = RemoteError::io(code::CLOSED, "Stream is already closed");
            return Some(self.error_reply(req.seq_nr, &err));
        };

        let job = JobContext::new();
        self.running = Some(RunningJob {
            seq_nr: req.seq_nr,
            job: job.clone(),
        });
        let backend = self.backend.clone();
        let done_tx = done_tx.clone();
        let seq_nr = req.seq_nr;

        match (req.command, seek_type) {
            (_, Some(seek_type)) => {
                let offset = join_offset(req.arg1, req.arg2) as i64;
                tokio::task::spawn_blocking(move || {
                    let result = backend.seek_on_read(&mut handle, offset, seek_type, &job).into_result();
                    let _ = done_tx.blocking_send(JobDone::Seek { seq_nr, handle, result });
                });
            }
            (request::READ, None) => {
                let count = (req.arg1 as usize).min(MAX_READ_SIZE);
                tokio::task::spawn_blocking(move || {
                    let result = backend.read(&mut handle, count, &job).into_result();
                    let _ = done_tx.blocking_send(JobDone::Read {
                        seq_nr,
                        generation,
                        handle,
                        result,
                    });
                });
            }
            _ => {
                tokio::task::spawn_blocking(move || {
                    let result = backend.close_read(handle, &job).into_result();
                    let _ = done_tx.blocking_send(JobDone::Close { seq_nr, result });
                });
            }
        }
        None
    }

    /// Turn a finished job into reply bytes.
    fn complete(&mut self, done: JobDone<B::Handle>) -> Vec<u8> {
        match done {
            JobDone::Read {
                seq_nr,
                generation,
                handle,
                result,
            } => {
                self.handle = Some(handle);
                match result {
                    Ok(data) => {
                        self.stats.bytes_served += data.len() as u64;
                        self.logger.reply(reply::DATA, seq_nr, data.len() as u32, generation);
                        let mut out = encode_reply(reply::DATA, seq_nr, data.len() as u32, generation).to_vec();
                        out.extend_from_slice(&data);
                        out
                    }
                    Err(e) => self.error_reply(seq_nr, &e),
                }
            }
            JobDone::Seek { seq_nr, handle, result } => {
                self.handle = Some(handle);
                match result {
                    Ok(pos) => {
                        let (low, high) = split_offset(pos as i64);
                        self.logger.reply(reply::SEEK_POS, seq_nr, low, high);
                        encode_reply(reply::SEEK_POS, seq_nr, low, high).to_vec()
                    }
                    Err(e) => self.error_reply(seq_nr, &e),
                }
            }
            JobDone::Close { seq_nr, result } => match result {
                Ok(()) => {
                    self.logger.reply(reply::CLOSED, seq_nr, 0, 0);
                    encode_reply(reply::CLOSED, seq_nr, 0, 0).to_vec()
                }
                Err(e) => self.error_reply(seq_nr, &e),
            },
        }
    }

    fn error_reply(&self, seq_nr: u32, err: &RemoteError) -> Vec<u8> {
        let out = encode_error_reply(seq_nr, err);
        self.logger
            .reply(reply::ERROR, seq_nr, err.code, (out.len() - crate::protocol::REPLY_SIZE) as u32);
        out
    }
}
