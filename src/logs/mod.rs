//! Resumable log streaming over a token-paginated log API.
//!
//! [`LogStreamer::stream`] fetches pages with an opaque pagination token and
//! writes each entry to a [`LogSink`] as one newline-terminated line, in the
//! order the API returned them. When a fetch returns the same token as the
//! one before it, no new data arrived and the streamer waits
//! [`LOG_IDLE_DELAY`] before asking again. The loop only ends on an error.

mod client;

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::debug;

use crate::error::ProviderError;
use crate::machines::ProviderFuture;

pub use client::FlyLogClient;

/// Pause applied after a fetch that returned no new token.
pub const LOG_IDLE_DELAY: Duration = Duration::from_secs(10);

/// One log record as returned by the API.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LogEntry {
    /// Timestamp as reported by the API.
    pub timestamp: String,
    /// Machine instance that emitted the line.
    pub instance: String,
    /// Region of the instance.
    pub region: String,
    /// Log level.
    pub level: String,
    /// Message text.
    pub message: String,
}

impl LogEntry {
    /// Formats the entry as a single newline-terminated line.
    #[must_use]
    pub fn to_line(&self) -> String {
        format!(
            "{} app[{}] {} [{}] {}\n",
            self.timestamp, self.instance, self.region, self.level, self.message
        )
    }
}

/// A page of entries plus the token to resume from.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LogPage {
    /// Entries in API order.
    pub entries: Vec<LogEntry>,
    /// Token marking the position after this page.
    pub next_token: String,
}

/// Identifies whose logs to stream.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LogQuery {
    /// App owning the machine.
    pub app: String,
    /// Region filter; empty for all regions.
    pub region: String,
    /// Machine filter; empty for every machine in the app.
    pub machine_id: String,
}

/// Pagination state for one streaming call.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LogCursor {
    previous: String,
    next: String,
}

impl LogCursor {
    /// Token to send with the next fetch.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.next
    }

    /// Records the token returned by a fetch.
    ///
    /// Returns `true` when the token matches the previous one, meaning the
    /// page carried no new data. An empty token never replaces the resume
    /// position.
    pub fn advance(&mut self, returned: &str) -> bool {
        let idle = returned == self.previous;
        returned.clone_into(&mut self.previous);
        if !returned.is_empty() {
            returned.clone_into(&mut self.next);
        }
        idle
    }
}

/// Source of log pages.
pub trait LogSource: Send + Sync {
    /// Fetches the page following `token`; an empty token starts from the
    /// API's default position.
    fn fetch_page<'a>(&'a self, query: &'a LogQuery, token: &'a str) -> ProviderFuture<'a, LogPage>;
}

/// Shared, cloneable destination for formatted log lines.
#[derive(Clone)]
pub struct LogSink {
    writer: Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink").finish_non_exhaustive()
    }
}

impl LogSink {
    /// Wraps any async byte writer.
    #[must_use]
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Sink writing to the process's standard output.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }

    /// Sink writing to the process's standard error.
    #[must_use]
    pub fn stderr() -> Self {
        Self::new(tokio::io::stderr())
    }

    /// Writes `text` in full and flushes.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Sink`] when the writer fails.
    pub async fn write_line(&self, text: &str) -> Result<(), ProviderError> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(text.as_bytes())
            .await
            .map_err(sink_error)?;
        writer.flush().await.map_err(sink_error)
    }
}

fn sink_error(err: std::io::Error) -> ProviderError {
    ProviderError::Sink {
        message: err.to_string(),
    }
}

/// Polls a [`LogSource`] forever, forwarding entries to a sink.
#[derive(Debug)]
pub struct LogStreamer<S> {
    source: S,
    idle_delay: Duration,
}

impl<S: LogSource> LogStreamer<S> {
    /// Creates a streamer using [`LOG_IDLE_DELAY`].
    #[must_use]
    pub const fn new(source: S) -> Self {
        Self {
            source,
            idle_delay: LOG_IDLE_DELAY,
        }
    }

    /// Overrides the idle delay.
    #[must_use]
    pub const fn with_idle_delay(mut self, delay: Duration) -> Self {
        self.idle_delay = delay;
        self
    }

    /// Streams logs for `query` into `sink` until a fetch or write fails.
    ///
    /// Entries of a page are written before any idle delay is applied.
    ///
    /// # Errors
    ///
    /// Returns the first fetch error, or [`ProviderError::Sink`] when the
    /// sink rejects a write. The function never returns `Ok`.
    pub async fn stream(
        &self,
        query: &LogQuery,
        sink: &LogSink,
    ) -> Result<Infallible, ProviderError> {
        let mut cursor = LogCursor::default();
        loop {
            let page = self.source.fetch_page(query, cursor.token()).await?;
            let idle = cursor.advance(&page.next_token);
            for entry in &page.entries {
                sink.write_line(&entry.to_line()).await?;
            }
            if idle {
                debug!(app = %query.app, delay = ?self.idle_delay, "no new log entries");
                sleep(self.idle_delay).await;
            }
        }
    }
}
