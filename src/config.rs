//! TOML configuration for `vfsd` and `vfs`.

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::Write as _;
use std::path::{Path, PathBuf};

/// Default read size used by the client tools
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Per-user configuration directory (`$HOME/.config/vfsio`).
pub fn config_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("vfsio");
    }
    PathBuf::from(".vfsio")
}

/// Where the daemon listens unless told otherwise.
pub fn default_socket_path() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir).join("vfsd.sock"),
        _ => config_dir().join("vfsd.sock"),
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket: PathBuf,
    pub root: PathBuf,
    pub log_file: Option<PathBuf>,
    pub access_log: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket: default_socket_path(),
            root: PathBuf::from("."),
            log_file: None,
            access_log: None,
        }
    }
}

impl DaemonConfig {
    pub fn default_path() -> PathBuf {
        config_dir().join("vfsd.toml")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub socket: PathBuf,
    pub log_file: Option<PathBuf>,
    pub chunk_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket: default_socket_path(),
            log_file: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn default_path() -> PathBuf {
        config_dir().join("vfs.toml")
    }
}

/// Load `path`, or defaults when the file does not exist.
pub fn load<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match std::fs::read_to_string(path) {
        Ok(data) => toml::from_str(&data).with_context(|| format!("parse {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
    }
}

pub fn save<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir).ok();
    let data = toml::to_string(value)?;
    // atomic write
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(data.as_bytes())?;
    tmp.flush()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600));
    }
    tmp.persist(path)
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
