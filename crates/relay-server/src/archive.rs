//! JSON-lines feed archive.
//!
//! Records are queued to a background writer task that appends one JSON object
//! per line. The relay path never waits on the disk: a full queue rejects the
//! record.

use async_trait::async_trait;
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use tenvis_relay_core::{ArchiveError, ArchiveOutcome, FeedArchive, FeedMessage};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Appends archivable feed messages to a JSON-lines file.
#[derive(Debug)]
pub struct JsonlArchive {
    tx: mpsc::Sender<Value>,
    path: PathBuf,
}

impl JsonlArchive {
    /// Open (or create) the archive file and start its writer.
    ///
    /// The writer stops after every `JsonlArchive` handle is dropped and the
    /// queue is drained; the returned task completes at that point.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened for appending.
    pub async fn open(
        path: impl AsRef<Path>,
        queue_capacity: usize,
    ) -> io::Result<(Self, JoinHandle<()>)> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let writer = tokio::spawn(run_writer(file, rx, path.clone()));
        info!(path = %path.display(), "Feed archive open");

        Ok((Self { tx, path }, writer))
    }

    /// Archive file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl FeedArchive for JsonlArchive {
    async fn archive(&self, message: &FeedMessage) -> Result<ArchiveOutcome, ArchiveError> {
        self.tx
            .try_send(message.to_record())
            .map(|()| ArchiveOutcome::Stored)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ArchiveError::Backlogged,
                mpsc::error::TrySendError::Closed(_) => {
                    ArchiveError::Unavailable("archive writer stopped".to_string())
                }
            })
    }

    fn name(&self) -> &'static str {
        "jsonl"
    }
}

async fn run_writer(file: File, mut rx: mpsc::Receiver<Value>, path: PathBuf) {
    let mut out = BufWriter::new(file);
    let mut written = 0u64;

    while let Some(record) = rx.recv().await {
        let mut batch = vec![record];
        while let Ok(record) = rx.try_recv() {
            batch.push(record);
        }

        for record in &batch {
            match write_record(&mut out, record).await {
                Ok(()) => written += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to write archive record"),
            }
        }
        if let Err(e) = out.flush().await {
            warn!(path = %path.display(), error = %e, "Failed to flush archive");
        }
    }

    debug!(path = %path.display(), records = written, "Archive writer stopped");
}

async fn write_record(out: &mut BufWriter<File>, record: &Value) -> io::Result<()> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    out.write_all(&line).await
}
