use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;

/// Structured event sink shared by both session machines.
///
/// Every method has an empty default so `NoopLogger` costs nothing on hot paths.
pub trait Logger: Send + Sync {
    fn state(&self, _machine: &str, _state: &str) {}
    fn connected(&self, _client: &str, _peer: &SocketAddr) {}
    fn frame_sent(&self, _name: &str, _bytes: u64, _chunks: u64) {}
    fn frame_received(&self, _client: &str, _dst: &Path, _bytes: u64, _chunks: u64) {}
    fn disconnected(&self, _client: &str, _frames: u64, _bytes: u64) {}
    fn error(&self, _context: &str, _msg: &str) {}
    fn done(&self, _files: u64, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    out: Mutex<Box<dyn Write + Send>>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::from_writer(f))
    }

    /// Trace lines on standard error.
    pub fn stderr() -> Self {
        Self::from_writer(std::io::stderr())
    }

    pub fn from_writer<W: Write + Send + 'static>(w: W) -> Self {
        Self {
            out: Mutex::new(Box::new(w)),
        }
    }

    fn line(&self, s: &str) {
        let mut out = self.out.lock();
        let _ = writeln!(out, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl Logger for TextLogger {
    fn state(&self, machine: &str, state: &str) {
        self.line(&format!("TRACE machine={} state={}", machine, state));
    }
    fn connected(&self, client: &str, peer: &SocketAddr) {
        self.line(&format!("CONNECT client={} peer={}", client, peer));
    }
    fn frame_sent(&self, name: &str, bytes: u64, chunks: u64) {
        self.line(&format!("SEND name={} bytes={} chunks={}", name, bytes, chunks));
    }
    fn frame_received(&self, client: &str, dst: &Path, bytes: u64, chunks: u64) {
        self.line(&format!(
            "RECV client={} dst={} bytes={} chunks={}",
            client,
            dst.display(),
            bytes,
            chunks
        ));
    }
    fn disconnected(&self, client: &str, frames: u64, bytes: u64) {
        self.line(&format!(
            "DISCONNECT client={} frames={} bytes={}",
            client, frames, bytes
        ));
    }
    fn error(&self, context: &str, msg: &str) {
        self.line(&format!("ERROR ctx={} msg={}", context, msg));
    }
    fn done(&self, files: u64, bytes: u64, seconds: f64) {
        self.line(&format!("DONE files={files} bytes={bytes} seconds={seconds:.3}"));
    }
}
