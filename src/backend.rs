//! Backend dispatch layer for the daemon.
//!
//! A backend implements whichever operations it supports; anything it leaves
//! out answers `Dispatch::NotSupported` and the read channel turns that into
//! a `NOT_SUPPORTED` error reply.

use crate::error::RemoteError;
use crate::protocol::code;
use crate::seek_op::SeekType;
use anyhow::{anyhow, bail, Result};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Outcome of dispatching one job to a backend
#[derive(Debug)]
pub enum Dispatch<T> {
    Handled(Result<T, RemoteError>),
    NotSupported,
}

impl<T> Dispatch<T> {
    pub fn into_result(self) -> Result<T, RemoteError> {
        match self {
            Dispatch::Handled(res) => res,
            Dispatch::NotSupported => Err(RemoteError::io(
                code::NOT_SUPPORTED,
                "Operation not supported by backend",
            )),
        }
    }
}

impl<T> From<Result<T, RemoteError>> for Dispatch<T> {
    fn from(res: Result<T, RemoteError>) -> Self {
        Dispatch::Handled(res)
    }
}

/// Per-job state shared between the read channel and the worker thread.
#[derive(Debug, Clone, Default)]
pub struct JobContext {
    cancelled: Arc<AtomicBool>,
}

impl JobContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set by the read channel when a matching CANCEL arrives
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(CANCELLED)` once the job was cancelled
    pub fn check(&self) -> Result<(), RemoteError> {
        if self.is_cancelled() {
            Err(RemoteError::cancelled())
        } else {
            Ok(())
        }
    }
}

/// An opened handle plus whether it can seek
pub struct OpenedHandle<H> {
    pub handle: H,
    pub can_seek: bool,
}

pub trait Backend: Send + Sync + 'static {
    type Handle: Send + 'static;

    fn open_for_read(&self, _path: &str, _job: &JobContext) -> Dispatch<OpenedHandle<Self::Handle>> {
        Dispatch::NotSupported
    }

    /// Return at most `count` bytes; an empty block means end of file.
    fn read(&self, _handle: &mut Self::Handle, _count: usize, _job: &JobContext) -> Dispatch<Vec<u8>> {
        Dispatch::NotSupported
    }

    fn seek_on_read(&self, _handle: &mut Self::Handle, _offset: i64, _seek_type: SeekType, _job: &JobContext) -> Dispatch<u64> {
        Dispatch::NotSupported
    }

    fn close_read(&self, _handle: Self::Handle, _job: &JobContext) -> Dispatch<()> {
        Dispatch::Handled(Ok(()))
    }
}

/// Map a local I/O error into the wire's I/O error domain.
pub fn remote_from_io(e: &io::Error) -> RemoteError {
    let code = match e.kind() {
        io::ErrorKind::NotFound => code::NOT_FOUND,
        io::ErrorKind::PermissionDenied => code::PERMISSION_DENIED,
        io::ErrorKind::InvalidInput => code::INVALID_ARGUMENT,
        _ if e.raw_os_error() == Some(libc::EISDIR) => code::IS_DIRECTORY,
        _ => code::FAILED,
    };
    RemoteError::io(code, e.to_string())
}

/// Resolve `p` under `root`, rejecting anything that could escape it.
///
/// `root` must already be canonical.
pub fn normalize_under_root(root: &Path, p: &Path) -> Result<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    if p.to_string_lossy().contains('\0') {
        bail!("path contains NUL byte");
    }

    let mut safe = PathBuf::new();
    for component in p.components() {
        match component {
            CurDir => {}
            Normal(s) => safe.push(s),
            ParentDir | RootDir | Prefix(_) => {
                bail!("path contains disallowed component: {:?}", component);
            }
        }
    }

    let joined = root.join(&safe);
    // Existing paths are canonicalized so symlinks cannot point outside
    let final_path = if joined.exists() {
        joined
            .canonicalize()
            .map_err(|e| anyhow!("failed to canonicalize {:?}: {}", joined, e))?
    } else {
        joined
    };

    if !final_path.starts_with(root) {
        bail!("path {:?} escapes root {:?}", p, root);
    }
    Ok(final_path)
}

const READ_SLICE: usize = 64 * 1024;

/// Serves regular files below a root directory.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root
            .as_ref()
            .canonicalize()
            .map_err(|e| anyhow!("failed to canonicalize root {:?}: {}", root.as_ref(), e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, RemoteError> {
        // Logical paths are rooted at the served directory
        let relative = path.trim_start_matches('/');
        normalize_under_root(&self.root, Path::new(relative))
            .map_err(|e| RemoteError::io(code::INVALID_ARGUMENT, e.to_string()))
    }

    fn open(&self, path: &str) -> Result<File, RemoteError> {
        let full = self.resolve(path)?;
        let meta = std::fs::metadata(&full).map_err(|e| remote_from_io(&e))?;
        if meta.is_dir() {
            return Err(RemoteError::io(code::IS_DIRECTORY, "Can't open directory"));
        }
        File::open(&full).map_err(|e| remote_from_io(&e))
    }
}

impl Backend for LocalBackend {
    type Handle = File;

    fn open_for_read(&self, path: &str, job: &JobContext) -> Dispatch<OpenedHandle<File>> {
        let res = job.check().and_then(|_| self.open(path)).map(|handle| OpenedHandle {
            handle,
            can_seek: true,
        });
        Dispatch::Handled(res)
    }

    fn read(&self, handle: &mut File, count: usize, job: &JobContext) -> Dispatch<Vec<u8>> {
        let mut out = vec![0u8; count];
        let mut filled = 0;
        while filled < count {
            if let Err(e) = job.check() {
                // Keep what we have; only an empty cancelled read reports the cancel
                if filled == 0 {
                    return Dispatch::Handled(Err(e));
                }
                break;
            }
            let end = (filled + READ_SLICE).min(count);
            match handle.read(&mut out[filled..end]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Dispatch::Handled(Err(remote_from_io(&e))),
            }
        }
        out.truncate(filled);
        Dispatch::Handled(Ok(out))
    }

    fn seek_on_read(&self, handle: &mut File, offset: i64, seek_type: SeekType, job: &JobContext) -> Dispatch<u64> {
        if let Err(e) = job.check() {
            return Dispatch::Handled(Err(e));
        }
        let pos = match seek_type {
            SeekType::Set if offset < 0 => {
                return Dispatch::Handled(Err(RemoteError::io(code::INVALID_ARGUMENT, "Invalid seek offset")));
            }
            SeekType::Set => SeekFrom::Start(offset as u64),
            SeekType::Cur => SeekFrom::Current(offset),
            SeekType::End => SeekFrom::End(offset),
        };
        Dispatch::Handled(handle.seek(pos).map_err(|e| remote_from_io(&e)))
    }
}
