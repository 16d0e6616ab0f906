use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Protocol event sink. Every method defaults to doing nothing so hot paths
/// stay free with [`NoopLogger`].
pub trait Logger: Send + Sync {
    fn request(&self, _command: u32, _seq_nr: u32, _arg1: u32, _arg2: u32) {}
    fn reply(&self, _reply_type: u32, _seq_nr: u32, _arg1: u32, _arg2: u32) {}
    fn cancel_sent(&self, _target_seq_nr: u32) {}
    fn reply_discarded(&self, _reason: &str, _seq_nr: u32) {}
    fn opened(&self, _path: &str, _can_seek: bool) {}
    fn closed(&self, _path: &str) {}
    fn error(&self, _context: &str, _msg: &str) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl Logger for TextLogger {
    fn request(&self, command: u32, seq_nr: u32, arg1: u32, arg2: u32) {
        self.line(&format!("REQUEST cmd={command} seq={seq_nr} arg1={arg1} arg2={arg2}"));
    }
    fn reply(&self, reply_type: u32, seq_nr: u32, arg1: u32, arg2: u32) {
        self.line(&format!("REPLY type={reply_type} seq={seq_nr} arg1={arg1} arg2={arg2}"));
    }
    fn cancel_sent(&self, target_seq_nr: u32) {
        self.line(&format!("CANCEL target={target_seq_nr}"));
    }
    fn reply_discarded(&self, reason: &str, seq_nr: u32) {
        self.line(&format!("DISCARD seq={seq_nr} reason={reason}"));
    }
    fn opened(&self, path: &str, can_seek: bool) {
        self.line(&format!("OPEN path={path} can_seek={can_seek}"));
    }
    fn closed(&self, path: &str) {
        self.line(&format!("CLOSE path={path}"));
    }
    fn error(&self, context: &str, msg: &str) {
        self.line(&format!("ERROR ctx={context} msg={msg}"));
    }
}
