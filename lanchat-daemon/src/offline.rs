//! Offline message buffer: an append-only file of raw lines, kept while no
//! consumer is attached and drained when one appears.
//!
//! Delivery happens before the file is cleared, so a crash in between can
//! redeliver lines (at-least-once) but never invents them. Duplicate
//! suppression is the consumer's concern.

use std::io;
use std::path::PathBuf;

use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

pub struct OfflineBuffer {
    path: PathBuf,
    /// Serializes all file access; concurrent connections must not interleave
    /// partial writes.
    lock: Mutex<()>,
}

impl OfflineBuffer {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    /// Append one raw line (a trailing newline is added when missing).
    pub async fn append(&self, line: &str) -> io::Result<()> {
        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        if !line.ends_with('\n') {
            file.write_all(b"\n").await?;
        }
        file.flush().await?;
        debug!(len = line.len(), "buffered message");
        Ok(())
    }

    /// Deliver every buffered line in file order, then clear. `deliver`
    /// returns false when the sink rejects a line; that line and everything
    /// after it are kept for the next drain.
    pub async fn drain<F>(&self, mut deliver: F) -> io::Result<usize>
    where
        F: FnMut(&str) -> bool,
    {
        let _guard = self.lock.lock().await;
        let lines = match self.read_lines().await? {
            Some(lines) => lines,
            None => return Ok(0),
        };
        let mut delivered = 0;
        for line in &lines {
            if !deliver(line) {
                break;
            }
            delivered += 1;
        }
        self.settle(&lines, delivered).await?;
        Ok(delivered)
    }

    /// Write every buffered line (with its newline) to `writer`, then clear.
    /// Lines that failed to send are requeued before the error propagates.
    pub async fn drain_to_writer<W>(&self, writer: &mut W) -> io::Result<usize>
    where
        W: AsyncWrite + Unpin,
    {
        let _guard = self.lock.lock().await;
        let lines = match self.read_lines().await? {
            Some(lines) => lines,
            None => return Ok(0),
        };
        let mut delivered = 0;
        let mut failure = None;
        for line in &lines {
            let mut out = line.clone();
            out.push('\n');
            if let Err(e) = writer.write_all(out.as_bytes()).await {
                failure = Some(e);
                break;
            }
            delivered += 1;
        }
        if failure.is_none() {
            if let Err(e) = writer.flush().await {
                failure = Some(e);
            }
        }
        self.settle(&lines, delivered).await?;
        match failure {
            Some(e) => Err(e),
            None => Ok(delivered),
        }
    }

    /// Read all buffered lines, or None when no buffer file exists.
    async fn read_lines(&self) -> io::Result<Option<Vec<String>>> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(Some(
                contents
                    .lines()
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect(),
            )),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Remove the buffer file and requeue `lines[delivered..]`.
    async fn settle(&self, lines: &[String], delivered: usize) -> io::Result<()> {
        fs::remove_file(&self.path).await?;
        let rest = &lines[delivered..];
        if rest.is_empty() {
            debug!(delivered, "buffer drained");
            return Ok(());
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        for line in rest {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        file.flush().await?;
        debug!(delivered, requeued = rest.len(), "buffer partially drained");
        Ok(())
    }
}
