//! Duplex transport: a write-only command stream and a read-only data stream
//! over one Unix socket.
//!
//! Every call may transfer fewer bytes than asked; callers loop. A call that
//! is allowed to be cancelled waits on both the socket and the cancellable's
//! wake pipe, so a blocked read returns `Cancelled` as soon as another
//! thread cancels.

use crate::cancel::Cancellable;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// Result of a transport call that did not transfer bytes
#[derive(Debug)]
pub enum TransportError {
    /// The cancellable fired before any byte was transferred
    Cancelled,
    /// Anything else. Fatal for the connection.
    Io(io::Error),
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(e)
    }
}

/// The two byte streams the protocol engine drives.
pub trait Transport {
    /// Write some of `buf` to the command stream
    fn write(&mut self, buf: &[u8], cancellable: Option<&Cancellable>) -> Result<usize, TransportError>;
    /// Read some bytes from the data stream into `buf`
    fn read(&mut self, buf: &mut [u8], cancellable: Option<&Cancellable>) -> Result<usize, TransportError>;
    /// Discard up to `count` bytes from the data stream
    fn skip(&mut self, count: usize, cancellable: Option<&Cancellable>) -> Result<usize, TransportError>;
    /// Close the command stream, then the data stream. Closing twice is fine.
    fn close(&mut self) -> io::Result<()>;
}

const SKIP_CHUNK: usize = 8192;

/// Block until `fd` is ready for `events` or the cancellable fires.
fn wait_ready(fd: RawFd, events: libc::c_short, cancellable: Option<&Cancellable>) -> Result<(), TransportError> {
    loop {
        let mut fds = [
            libc::pollfd {
                fd,
                events,
                revents: 0,
            },
            libc::pollfd {
                fd: cancellable.map_or(-1, |c| c.fd()),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        let nfds = if cancellable.is_some() { 2 } else { 1 };
        let r = unsafe { libc::poll(fds.as_mut_ptr(), nfds as libc::nfds_t, -1) };
        if r < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(TransportError::Io(e));
        }
        if nfds == 2 && fds[1].revents != 0 {
            return Err(TransportError::Cancelled);
        }
        // Readiness, hangup and error all mean "try the call and let it report"
        if fds[0].revents != 0 {
            return Ok(());
        }
    }
}

fn check_cancelled(cancellable: Option<&Cancellable>) -> Result<(), TransportError> {
    match cancellable {
        Some(c) if c.is_cancelled() => Err(TransportError::Cancelled),
        _ => Ok(()),
    }
}

/// Outbound half. Writes go straight to the socket; nothing is buffered here.
pub struct CommandStream {
    socket: Option<UnixStream>,
}

impl CommandStream {
    pub fn new(socket: UnixStream) -> Self {
        Self {
            socket: Some(socket),
        }
    }

    fn socket(&self) -> io::Result<&UnixStream> {
        self.socket
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "command stream is closed"))
    }

    pub fn write(&mut self, buf: &[u8], cancellable: Option<&Cancellable>) -> Result<usize, TransportError> {
        check_cancelled(cancellable)?;
        let mut socket = self.socket()?;
        loop {
            match socket.write(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    wait_ready(socket.as_raw_fd(), libc::POLLOUT, cancellable)?
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Signals end-of-requests to the peer. Already-closed is not an error.
    pub fn close(&mut self) -> io::Result<()> {
        let Some(socket) = self.socket.take() else {
            return Ok(());
        };
        match socket.shutdown(Shutdown::Write) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.socket.is_none()
    }
}

/// Inbound half.
pub struct DataStream {
    socket: Option<UnixStream>,
}

impl DataStream {
    pub fn new(socket: UnixStream) -> Self {
        Self {
            socket: Some(socket),
        }
    }

    fn socket(&self) -> io::Result<&UnixStream> {
        self.socket
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "data stream is closed"))
    }

    pub fn read(&mut self, buf: &mut [u8], cancellable: Option<&Cancellable>) -> Result<usize, TransportError> {
        check_cancelled(cancellable)?;
        let mut socket = self.socket()?;
        loop {
            match socket.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    wait_ready(socket.as_raw_fd(), libc::POLLIN, cancellable)?
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn skip(&mut self, count: usize, cancellable: Option<&Cancellable>) -> Result<usize, TransportError> {
        let mut scratch = [0u8; SKIP_CHUNK];
        let want = count.min(SKIP_CHUNK);
        self.read(&mut scratch[..want], cancellable)
    }

    pub fn close(&mut self) -> io::Result<()> {
        if let Some(socket) = self.socket.take() {
            match socket.shutdown(Shutdown::Read) {
                Err(e) if e.kind() != io::ErrorKind::NotConnected => return Err(e),
                _ => {}
            }
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.socket.is_none()
    }
}

/// Both streams over one connected socket.
pub struct SocketTransport {
    command: CommandStream,
    data: DataStream,
}

impl SocketTransport {
    pub fn new(socket: UnixStream) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        let command = CommandStream::new(socket.try_clone()?);
        let data = DataStream::new(socket);
        Ok(Self { command, data })
    }

    /// Wrap a descriptor received from the daemon
    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        Self::new(UnixStream::from(fd))
    }

    pub fn is_closed(&self) -> bool {
        self.command.is_closed() && self.data.is_closed()
    }
}

impl Transport for SocketTransport {
    fn write(&mut self, buf: &[u8], cancellable: Option<&Cancellable>) -> Result<usize, TransportError> {
        self.command.write(buf, cancellable)
    }

    fn read(&mut self, buf: &mut [u8], cancellable: Option<&Cancellable>) -> Result<usize, TransportError> {
        self.data.read(buf, cancellable)
    }

    fn skip(&mut self, count: usize, cancellable: Option<&Cancellable>) -> Result<usize, TransportError> {
        self.data.skip(count, cancellable)
    }

    fn close(&mut self) -> io::Result<()> {
        // Return the first error, but close both
        let first = self.command.close();
        let second = self.data.close();
        first.and(second)
    }
}
