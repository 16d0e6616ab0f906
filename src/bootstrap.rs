//! Connection bootstrap: ask the daemon to open a path and receive the
//! per-file transport descriptor over the control socket.

use crate::error::{RemoteError, StreamError};
use crate::fdpass::{recv_with_fd, send_with_fd};
use crate::logger::{Logger, NoopLogger};
use crate::protocol::{code, frame};
use crate::protocol_core::{build_frame, decode_control_error, parse_frame_header, CONTROL_HEADER_SIZE};
use anyhow::Result;
use std::io::{self, Write};
use std::os::fd::{OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What a successful open hands back
#[derive(Debug)]
pub struct OpenedFile {
    /// One end of the per-file duplex socket
    pub fd: OwnedFd,
    pub can_seek: bool,
}

/// "Open logical path for read" collaborator.
pub trait OpenForRead: Send + Sync {
    fn open_for_read(&self, path: &str) -> Result<OpenedFile, StreamError>;
}

/// One decoded control frame, plus a descriptor if one arrived with it
#[derive(Debug)]
pub struct ControlFrame {
    pub frame_type: u8,
    pub payload: Vec<u8>,
    pub fd: Option<OwnedFd>,
}

/// Write one control frame, attaching `fd` to its first byte.
pub fn write_control_frame(sock: &UnixStream, frame_type: u8, payload: &[u8], fd: Option<RawFd>) -> io::Result<()> {
    let buf = build_frame(frame_type, payload);
    let sent = send_with_fd(sock, &buf, fd)?;
    if sent == 0 {
        return Err(io::Error::new(io::ErrorKind::WriteZero, "control socket closed"));
    }
    let mut rest = sock;
    rest.write_all(&buf[sent..])
}

fn fill(sock: &UnixStream, buf: &mut [u8], fd: &mut Option<OwnedFd>) -> io::Result<()> {
    let mut got = 0;
    while got < buf.len() {
        let (n, received) = recv_with_fd(sock, &mut buf[got..])?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "control socket closed"));
        }
        if fd.is_none() {
            *fd = received;
        }
        got += n;
    }
    Ok(())
}

/// Read one control frame (header, payload, and any descriptor).
pub fn read_control_frame(sock: &UnixStream) -> Result<ControlFrame> {
    let mut fd = None;
    let mut header = [0u8; CONTROL_HEADER_SIZE];
    fill(sock, &mut header, &mut fd)?;
    let (frame_type, len) = parse_frame_header(&header)?;
    let mut payload = vec![0u8; len as usize];
    fill(sock, &mut payload, &mut fd)?;
    Ok(ControlFrame {
        frame_type,
        payload,
        fd,
    })
}

fn invalid_reply() -> StreamError {
    StreamError::Framing("Invalid return value from open".into())
}

/// Decode the daemon's answer to OPEN_FOR_READ.
pub fn parse_open_reply(reply: ControlFrame) -> Result<OpenedFile, StreamError> {
    match reply.frame_type {
        frame::OPENED => {
            let (Some(fd), [flag]) = (reply.fd, reply.payload.as_slice()) else {
                return Err(invalid_reply());
            };
            Ok(OpenedFile {
                fd,
                can_seek: *flag != 0,
            })
        }
        frame::ERROR => {
            let err: RemoteError = decode_control_error(&reply.payload).map_err(|_| invalid_reply())?;
            Err(StreamError::from_remote(err))
        }
        _ => Err(invalid_reply()),
    }
}

/// Opens files through a running `vfsd` control socket.
pub struct DaemonOpener {
    socket_path: PathBuf,
    logger: Arc<dyn Logger>,
}

impl DaemonOpener {
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            logger: Arc::new(NoopLogger),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    fn request(&self, path: &str) -> Result<OpenedFile, StreamError> {
        if path.as_bytes().contains(&0) {
            return Err(StreamError::Remote(RemoteError::io(
                code::INVALID_ARGUMENT,
                "Path contains a NUL byte",
            )));
        }
        let sock = UnixStream::connect(&self.socket_path)?;
        write_control_frame(&sock, frame::OPEN_FOR_READ, path.as_bytes(), None)?;
        let reply = read_control_frame(&sock).map_err(|e| match e.downcast::<io::Error>() {
            Ok(io_err) => StreamError::Io(io_err),
            Err(_) => invalid_reply(),
        })?;
        parse_open_reply(reply)
    }
}

impl OpenForRead for DaemonOpener {
    fn open_for_read(&self, path: &str) -> Result<OpenedFile, StreamError> {
        match self.request(path) {
            Ok(opened) => {
                self.logger.opened(path, opened.can_seek);
                Ok(opened)
            }
            Err(e) => {
                self.logger.error("open", &e.to_string());
                Err(e)
            }
        }
    }
}
