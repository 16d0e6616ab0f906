//! Clap option structs shared by `vfs` and `vfsd`

use crate::config::DaemonConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Daemon options. Anything left unset falls back to the config file.
#[derive(Clone, Debug, Parser)]
#[command(name = "vfsd", version, about = "Serve a directory tree over the vfs read protocol")]
pub struct DaemonOpts {
    /// Control socket path
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Root directory to serve
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Config file (default: ~/.config/vfsio/vfsd.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Append protocol events to this file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Write JSONL handle records to this file
    #[arg(long = "access-log")]
    pub access_log: Option<PathBuf>,

    /// Write the effective settings to the config file and exit
    #[arg(long = "save-config")]
    pub save_config: bool,
}

impl DaemonOpts {
    /// Flags given on the command line win over `cfg`.
    pub fn apply(&self, cfg: DaemonConfig) -> DaemonConfig {
        DaemonConfig {
            socket: self.socket.clone().unwrap_or(cfg.socket),
            root: self.root.clone().unwrap_or(cfg.root),
            log_file: self.log_file.clone().or(cfg.log_file),
            access_log: self.access_log.clone().or(cfg.access_log),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(DaemonConfig::default_path)
    }
}

#[derive(Clone, Debug, Parser)]
#[command(name = "vfs", version, about = "Read files through a running vfsd")]
pub struct ClientOpts {
    /// Daemon control socket
    #[arg(long, global = true)]
    pub socket: Option<PathBuf>,

    /// Config file (default: ~/.config/vfsio/vfs.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Append protocol events to this file
    #[arg(long = "log-file", global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: ClientCommand,
}

#[derive(Clone, Debug, Subcommand)]
pub enum ClientCommand {
    /// Write a remote file to stdout
    Cat {
        path: String,
        /// Start reading at this byte offset
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Stop after this many bytes
        #[arg(long)]
        length: Option<u64>,
    },
    /// Copy a remote file to a local path
    Copy { path: String, dest: PathBuf },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cat() {
        let opts = ClientOpts::parse_from(["vfs", "cat", "/a.txt", "--offset", "10", "--socket", "/tmp/s"]);
        assert_eq!(opts.socket, Some(PathBuf::from("/tmp/s")));
        match opts.command {
            ClientCommand::Cat { path, offset, length } => {
                assert_eq!(path, "/a.txt");
                assert_eq!(offset, 10);
                assert!(length.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_daemon_opts() {
        let opts = DaemonOpts::parse_from(["vfsd", "--root", "/srv", "--access-log", "a.jsonl"]);
        assert_eq!(opts.root, Some(PathBuf::from("/srv")));
        assert_eq!(opts.access_log, Some(PathBuf::from("a.jsonl")));
        assert!(opts.socket.is_none());
        assert!(!opts.save_config);
    }

    #[test]
    fn test_flags_override_config_file() {
        let opts = DaemonOpts::parse_from(["vfsd", "--root", "/srv", "--save-config"]);
        let file = DaemonConfig {
            socket: PathBuf::from("/run/vfsd.sock"),
            root: PathBuf::from("/old"),
            log_file: Some(PathBuf::from("/var/log/vfsd.log")),
            access_log: None,
        };
        let merged = opts.apply(file);
        assert!(opts.save_config);
        assert_eq!(merged.root, PathBuf::from("/srv"));
        assert_eq!(merged.socket, PathBuf::from("/run/vfsd.sock"));
        assert_eq!(merged.log_file, Some(PathBuf::from("/var/log/vfsd.log")));
        assert!(merged.access_log.is_none());
    }
}
