use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use vfsio::cli::{ClientCommand, ClientOpts};
use vfsio::config::{self, ClientConfig};
use vfsio::logger::{Logger, NoopLogger, TextLogger};
use vfsio::progress::TransferProgress;
use vfsio::{Cancellable, DaemonFileInputStream, DaemonOpener, SeekType, StreamError};

fn main() {
    match run() {
        Ok(()) => {}
        Err(e) if is_cancelled(&e) => {
            eprintln!("\nInterrupted by user (Ctrl-C)");
            std::process::exit(130);
        }
        Err(e) => {
            eprintln!("vfs: {e:#}");
            std::process::exit(1);
        }
    }
}

fn is_cancelled(e: &anyhow::Error) -> bool {
    e.chain()
        .any(|cause| matches!(cause.downcast_ref::<StreamError>(), Some(StreamError::Cancelled)))
}

fn run() -> Result<()> {
    let opts = ClientOpts::parse();

    let config_path = opts.config.clone().unwrap_or_else(ClientConfig::default_path);
    let cfg: ClientConfig = config::load(&config_path)?;
    let socket = opts.socket.clone().unwrap_or(cfg.socket);
    let chunk_size = cfg.chunk_size.max(1);

    // Choose logger once; zero overhead in hot paths with NoopLogger
    let logger: Arc<dyn Logger> = match opts.log_file.as_ref().or(cfg.log_file.as_ref()) {
        Some(p) => match TextLogger::new(p) {
            Ok(l) => Arc::new(l),
            Err(e) => {
                eprintln!("vfs: cannot open log file {}: {e:#}", p.display());
                Arc::new(NoopLogger)
            }
        },
        None => Arc::new(NoopLogger),
    };

    let cancellable = Cancellable::new().context("create cancellation token")?;
    {
        let c = cancellable.clone();
        ctrlc::set_handler(move || c.cancel()).context("install Ctrl-C handler")?;
    }

    let opener = Arc::new(DaemonOpener::new(&socket).with_logger(logger.clone()));
    match opts.command {
        ClientCommand::Cat { path, offset, length } => {
            let mut stream = DaemonFileInputStream::new(path.as_str(), opener).with_logger(logger);
            let res = cat(&mut stream, offset, length, chunk_size, &cancellable);
            finish(&mut stream, res, &path)
        }
        ClientCommand::Copy { path, dest } => {
            let mut stream = DaemonFileInputStream::new(path.as_str(), opener).with_logger(logger);
            let res = copy(&mut stream, &dest, chunk_size, &cancellable);
            finish(&mut stream, res, &path)
        }
    }
}

/// Close the stream, keeping the transfer's error if there was one.
fn finish(stream: &mut DaemonFileInputStream, res: Result<()>, path: &str) -> Result<()> {
    // The token may already be cancelled; the CLOSE must still go out
    let closed = stream.close(None).with_context(|| format!("close {path}"));
    res.and(closed)
}

fn cat(
    stream: &mut DaemonFileInputStream,
    offset: u64,
    length: Option<u64>,
    chunk_size: usize,
    cancellable: &Cancellable,
) -> Result<()> {
    let path = stream.path().to_string();
    if offset > 0 {
        let skipped = stream
            .skip(offset, Some(cancellable))
            .with_context(|| format!("skip to offset {offset} in {path}"))?;
        if skipped < offset {
            return Ok(());
        }
    }

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let mut buf = vec![0u8; chunk_size];
    let mut remaining = length.unwrap_or(u64::MAX);
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = stream
            .read(&mut buf[..want], Some(cancellable))
            .with_context(|| format!("read {path}"))?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).context("write stdout")?;
        remaining -= n as u64;
    }
    out.flush().context("flush stdout")?;
    Ok(())
}

/// Total size, when the handle can seek; the position is restored to 0.
fn remote_size(stream: &mut DaemonFileInputStream, cancellable: &Cancellable) -> Result<Option<u64>> {
    if !stream.can_seek() {
        return Ok(None);
    }
    let size = stream.seek(0, SeekType::End, Some(cancellable))?;
    stream.seek(0, SeekType::Set, Some(cancellable))?;
    Ok(Some(size))
}

fn copy(stream: &mut DaemonFileInputStream, dest: &Path, chunk_size: usize, cancellable: &Cancellable) -> Result<()> {
    let path = stream.path().to_string();
    let total = remote_size(stream, cancellable).with_context(|| format!("open {path}"))?;
    let file = File::create(dest).with_context(|| format!("create {}", dest.display()))?;
    let mut out = BufWriter::new(file);

    let progress = TransferProgress::new(&path, total);
    let mut buf = vec![0u8; chunk_size];
    loop {
        let n = match stream.read(&mut buf, Some(cancellable)) {
            Ok(n) => n,
            Err(e) => {
                progress.abandon("failed");
                return Err(e).with_context(|| format!("read {path}"));
            }
        };
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])
            .with_context(|| format!("write {}", dest.display()))?;
        progress.advance(n as u64);
    }
    out.flush().with_context(|| format!("flush {}", dest.display()))?;
    progress.finish();
    Ok(())
}
