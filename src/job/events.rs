//! Job event sinks and the log cursor.

use std::io::Write;

use tracing::warn;

use super::store::JobProgress;
use crate::service::{JobStatus, LogChunk};

/// Receives observable events while a job is awaited.
pub trait JobEvents {
    /// New log text, never previously emitted.
    fn log_text(&mut self, text: &str);

    /// Progress update shown while logs are not streamed.
    fn progress(&mut self, progress: &JobProgress);

    /// The job moved to a new lifecycle state.
    fn phase_changed(&mut self, job_id: &str, status: JobStatus);

    /// Log streaming failed and was turned off for the rest of the wait.
    fn streaming_disabled(&mut self, reason: &str);
}

/// Sink that writes events to a terminal-like writer.
#[derive(Debug)]
pub struct ConsoleEvents<W: Write> {
    out: W,
    progress_open: bool,
}

impl<W: Write> ConsoleEvents<W> {
    /// Wraps a writer.
    #[must_use]
    pub const fn new(out: W) -> Self {
        Self {
            out,
            progress_open: false,
        }
    }

    fn emit(&mut self, text: &str) {
        let result = self
            .out
            .write_all(text.as_bytes())
            .and_then(|()| self.out.flush());
        if let Err(err) = result {
            warn!(error = %err, "failed to write job output");
        }
    }

    fn close_progress(&mut self) {
        if self.progress_open {
            self.progress_open = false;
            self.emit("\n");
        }
    }
}

impl<W: Write> JobEvents for ConsoleEvents<W> {
    fn log_text(&mut self, text: &str) {
        self.close_progress();
        self.emit(text);
    }

    fn progress(&mut self, progress: &JobProgress) {
        if let Some(line) = progress.describe() {
            self.progress_open = true;
            self.emit(&format!("\rProgress: {line}"));
        }
    }

    fn phase_changed(&mut self, job_id: &str, status: JobStatus) {
        self.close_progress();
        self.emit(&format!("job {job_id}: {status}\n"));
    }

    fn streaming_disabled(&mut self, reason: &str) {
        self.close_progress();
        self.emit(&format!(
            "Log streaming failed: {reason}\nFalling back to progress display...\n"
        ));
    }
}

/// Monotonic read position in a job's log.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LogCursor {
    offset: u64,
}

impl LogCursor {
    /// Current offset.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Consumes a chunk read at the current offset and returns the text not
    /// yet emitted.
    ///
    /// The cursor only moves forward, and only when the chunk carries text.
    /// When the chunk holds more text than the offset advanced, only the
    /// trailing part covering the advance is returned.
    pub fn advance(&mut self, chunk: &LogChunk) -> Option<String> {
        if chunk.logs.is_empty() || chunk.offset <= self.offset {
            return None;
        }
        let advanced = chunk.offset.saturating_sub(self.offset);
        self.offset = chunk.offset;
        let bytes = chunk.logs.as_bytes();
        let len = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
        let skip = usize::try_from(len.saturating_sub(advanced)).unwrap_or(0);
        bytes
            .get(skip..)
            .map(|tail| String::from_utf8_lossy(tail).into_owned())
    }
}
