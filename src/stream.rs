//! Client-facing input stream for one remote file.
//!
//! The handle opens lazily on first use, runs every call as one blocking
//! operation on its private connection, and refuses all I/O once closed.

use crate::bootstrap::OpenForRead;
use crate::cancel::Cancellable;
use crate::connection::Connection;
use crate::error::StreamError;
use crate::logger::{Logger, NoopLogger};
use crate::seek_op::{split_seek_from, SeekType};
use crate::transport::SocketTransport;
use std::io;
use std::sync::Arc;

const SKIP_SCRATCH: usize = 8192;

pub struct DaemonFileInputStream {
    path: String,
    opener: Arc<dyn OpenForRead>,
    logger: Arc<dyn Logger>,
    conn: Option<Connection<SocketTransport>>,
    can_seek: bool,
    closed: bool,
}

impl DaemonFileInputStream {
    pub fn new(path: impl Into<String>, opener: Arc<dyn OpenForRead>) -> Self {
        Self {
            path: path.into(),
            opener,
            logger: Arc::new(NoopLogger),
            conn: None,
            can_seek: false,
            closed: false,
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&mut self) -> Result<&mut Connection<SocketTransport>, StreamError> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        if self.conn.is_none() {
            let opened = self.opener.open_for_read(&self.path)?;
            let transport = SocketTransport::from_fd(opened.fd)?;
            self.can_seek = opened.can_seek;
            self.conn = Some(Connection::new(transport, self.logger.clone()));
        }
        self.conn
            .as_mut()
            .ok_or_else(|| StreamError::Framing("connection missing after open".into()))
    }

    /// Read up to `buf.len()` bytes. `Ok(0)` means end of file (or an empty buffer).
    pub fn read(&mut self, buf: &mut [u8], cancellable: Option<&Cancellable>) -> Result<usize, StreamError> {
        self.ensure_open()?.read(buf, cancellable)
    }

    /// Reposition and return the new absolute offset.
    pub fn seek(&mut self, offset: i64, seek_type: SeekType, cancellable: Option<&Cancellable>) -> Result<u64, StreamError> {
        self.ensure_open()?;
        if !self.can_seek {
            return Err(StreamError::NotSupported);
        }
        self.ensure_open()?.seek(offset, seek_type, cancellable)
    }

    /// Skip `count` bytes, seeking when possible and reading otherwise.
    /// Stops early at end of file; returns the number of bytes skipped.
    pub fn skip(&mut self, count: u64, cancellable: Option<&Cancellable>) -> Result<u64, StreamError> {
        let start = self.ensure_open()?.tell();
        if self.can_seek {
            let delta = i64::try_from(count).unwrap_or(i64::MAX);
            let pos = self.seek(delta, SeekType::Cur, cancellable)?;
            return Ok(pos.saturating_sub(start));
        }

        let mut scratch = vec![0u8; SKIP_SCRATCH.min(count as usize).max(1)];
        let mut skipped = 0u64;
        while skipped < count {
            let want = (count - skipped).min(scratch.len() as u64) as usize;
            let n = self.read(&mut scratch[..want], cancellable)?;
            if n == 0 {
                break;
            }
            skipped += n as u64;
        }
        Ok(skipped)
    }

    /// Current offset as tracked by this handle
    pub fn tell(&self) -> u64 {
        self.conn.as_ref().map_or(0, |c| c.tell())
    }

    /// Whether the remote file supports seeking. Opens the handle if needed;
    /// a failed open reports `false`.
    pub fn can_seek(&mut self) -> bool {
        self.ensure_open().is_ok() && self.can_seek
    }

    /// Release the remote file and both streams. The first error wins, but
    /// the streams are always closed. Closing again does nothing.
    pub fn close(&mut self, cancellable: Option<&Cancellable>) -> Result<(), StreamError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };

        let round_trip = if conn.is_broken() {
            Ok(())
        } else {
            conn.close_request(cancellable)
        };
        let shutdown = conn.shutdown();
        self.logger.closed(&self.path);
        round_trip.and(shutdown)
    }
}

impl Drop for DaemonFileInputStream {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            let _ = conn.shutdown();
        }
    }
}

impl io::Read for DaemonFileInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        DaemonFileInputStream::read(self, buf, None).map_err(io::Error::from)
    }
}

impl io::Seek for DaemonFileInputStream {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let (offset, seek_type) = split_seek_from(pos);
        DaemonFileInputStream::seek(self, offset, seek_type, None).map_err(io::Error::from)
    }

    fn stream_position(&mut self) -> io::Result<u64> {
        Ok(self.tell())
    }
}
