//! Download progress for a model pull, one entry per content digest.

use crate::ollama::PullProgress;
use std::collections::VecDeque;

/// Status lines shown under the progress bars.
const MAX_STATUS_LINES: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkProgress {
    pub digest: String,
    pub total: u64,
    pub completed: u64,
    pub finished: bool,
}

impl ChunkProgress {
    /// Twelve hex characters after the `sha256:` prefix.
    pub fn label(&self) -> String {
        short_digest(&self.digest)
    }

    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        (self.completed.min(self.total) as f64 / self.total as f64) as f32
    }
}

pub fn short_digest(digest: &str) -> String {
    digest.chars().skip(7).take(12).collect()
}

/// Folds pull records into per-digest progress.
#[derive(Debug, Default, Clone)]
pub struct PullTracker {
    chunks: Vec<ChunkProgress>,
    current: Option<String>,
    status: VecDeque<String>,
}

impl PullTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, progress: &PullProgress) {
        let digest = progress.digest.as_deref().filter(|d| !d.is_empty());

        if self.current.as_deref() != digest {
            if let Some(previous) = self.current.take() {
                if let Some(chunk) = self.chunk_mut(&previous) {
                    chunk.finished = true;
                }
            }
        }

        let Some(digest) = digest else {
            if !progress.status.is_empty() {
                tracing::info!("pull: {}", progress.status);
                self.push_status(progress.status.clone());
            }
            return;
        };

        if self.chunk_mut(digest).is_none() {
            if let Some(total) = progress.total.filter(|t| *t > 0) {
                tracing::debug!("pulling {} ({} bytes)", short_digest(digest), total);
                self.chunks.push(ChunkProgress {
                    digest: digest.to_string(),
                    total,
                    completed: 0,
                    finished: false,
                });
            }
        }

        if let Some(completed) = progress.completed {
            if let Some(chunk) = self.chunk_mut(digest) {
                chunk.completed = completed;
            }
        }

        self.current = Some(digest.to_string());
    }

    /// Marks every chunk finished once the stream is over.
    pub fn finish(&mut self) {
        for chunk in &mut self.chunks {
            chunk.finished = true;
        }
        self.current = None;
    }

    pub fn chunks(&self) -> &[ChunkProgress] {
        &self.chunks
    }

    /// The most recent status lines, oldest first.
    pub fn status_lines(&self) -> impl Iterator<Item = &str> {
        self.status.iter().map(String::as_str)
    }

    fn chunk_mut(&mut self, digest: &str) -> Option<&mut ChunkProgress> {
        self.chunks.iter_mut().find(|c| c.digest == digest)
    }

    fn push_status(&mut self, line: String) {
        if self.status.len() >= MAX_STATUS_LINES {
            self.status.pop_front();
        }
        self.status.push_back(line);
    }
}
