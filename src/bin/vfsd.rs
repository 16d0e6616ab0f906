use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use vfsio::backend::LocalBackend;
use vfsio::cli::DaemonOpts;
use vfsio::config::{self, DaemonConfig};
use vfsio::daemon::{self, Daemon};
use vfsio::log::AccessLog;
use vfsio::logger::{Logger, NoopLogger, TextLogger};

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();

    let config_path = opts.config_path();
    let cfg: DaemonConfig = config::load(&config_path)?;
    let cfg = opts.apply(cfg);
    if opts.save_config {
        config::save(&config_path, &cfg)?;
        println!("Wrote {}", config_path.display());
        return Ok(());
    }
    let DaemonConfig {
        socket,
        root,
        log_file,
        access_log,
    } = cfg;

    // Validate root directory exists and is a directory
    if !root.exists() {
        anyhow::bail!("Root directory does not exist: {}", root.display());
    }
    if !root.is_dir() {
        anyhow::bail!("Root path is not a directory: {}", root.display());
    }
    let backend = LocalBackend::new(&root)
        .with_context(|| format!("Failed to canonicalize root path: {}", root.display()))?;

    println!("Starting vfs daemon:");
    println!("  Root:   {}", backend.root().display());
    println!("  Socket: {}", socket.display());

    let logger: Arc<dyn Logger> = match &log_file {
        Some(p) => Arc::new(TextLogger::new(p).with_context(|| format!("open log file {}", p.display()))?),
        None => Arc::new(NoopLogger),
    };
    let mut server = Daemon::new(Arc::new(backend)).with_logger(logger);
    if let Some(p) = &access_log {
        println!("  Access log: {}", p.display());
        server = server.with_access_log(Arc::new(AccessLog::new(p)));
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let shutdown = Arc::new(tokio::sync::Notify::new());
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.notify_one()).context("Error setting Ctrl-C handler")?;
    }

    let result = rt.block_on(async {
        let listener = daemon::bind(&socket)?;
        tokio::select! {
            res = server.serve(listener) => res,
            _ = shutdown.notified() => {
                eprintln!("\nInterrupted (Ctrl-C). Shutting down...");
                Ok(())
            }
        }
    });

    std::fs::remove_file(&socket).ok();
    result
}
