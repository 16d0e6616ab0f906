//! vfsio library
//!
//! Client side of the vfs read-stream protocol (sequenced 16-byte requests
//! and replies over a per-file socket, with cancellation and seek
//! generations), plus a tokio daemon that serves a directory tree over it.

pub mod bootstrap;
pub mod cancel;
pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod fdpass;
pub mod log;
pub mod logger;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
pub mod seek_op;
pub mod stream;
pub mod transport;

mod close_op;
mod engine;
mod read_op;

#[cfg(feature = "server")]
pub mod backend;
#[cfg(feature = "server")]
pub mod daemon;

pub use bootstrap::{DaemonOpener, OpenForRead, OpenedFile};
pub use cancel::Cancellable;
pub use error::{RemoteError, StreamError};
pub use seek_op::SeekType;
pub use stream::DaemonFileInputStream;
