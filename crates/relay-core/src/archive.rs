//! Persistence seam for archivable feed messages.
//!
//! Archiving is best-effort: links hand messages over with [`archive_detached`]
//! and never wait for the outcome.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{trace, warn};

use crate::message::FeedMessage;

/// Archive errors. Logged, never propagated to the relay path.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The archive is not accepting messages.
    #[error("Archive unavailable: {0}")]
    Unavailable(String),

    /// The archive's backlog is full.
    #[error("Archive backlog full")]
    Backlogged,

    /// Writing the record failed.
    #[error("Archive write failed: {0}")]
    Write(String),
}

/// What the archive did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveOutcome {
    /// The message was accepted for storage.
    Stored,
    /// The archive chose not to keep the message.
    Ignored,
}

/// Stores archivable feed messages.
#[async_trait]
pub trait FeedArchive: Send + Sync {
    /// Archive a message.
    async fn archive(&self, message: &FeedMessage) -> Result<ArchiveOutcome, ArchiveError>;

    /// Get the archive name (e.g., "noop", "jsonl").
    fn name(&self) -> &'static str;
}

/// Archive that keeps nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopArchive;

#[async_trait]
impl FeedArchive for NoopArchive {
    async fn archive(&self, _message: &FeedMessage) -> Result<ArchiveOutcome, ArchiveError> {
        Ok(ArchiveOutcome::Ignored)
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

/// Hand a message to the archive without waiting for the outcome.
pub fn archive_detached(archive: Arc<dyn FeedArchive>, message: Arc<FeedMessage>) {
    tokio::spawn(async move {
        match archive.archive(&message).await {
            Ok(outcome) => {
                trace!(instrument = %message.instrument, ?outcome, archive = archive.name(), "Archived")
            }
            Err(e) => warn!(
                instrument = %message.instrument,
                archive = archive.name(),
                error = %e,
                "Failed to archive feed message"
            ),
        }
    });
}
