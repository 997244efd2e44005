//! Container log streaming.
//!
//! Every container owns a [`LogStreamer`] that attributes process output
//! and step progress messages to the container's log address (guid,
//! source name, instance index). Where those lines go is behind the
//! [`LogSink`] trait; the default sink forwards to `tracing`, tests use
//! capturing sinks, and the health-check monitor uses a buffer sink so
//! failing checks can be reported without spamming the main stream.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::AsyncWrite;

use crate::container::LogConfig;

/// Which process stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One attributed log line.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub guid: String,
    pub source_name: String,
    pub index: u32,
    pub stream: LogStream,
    pub message: String,
}

/// Destination for attributed log lines.
pub trait LogSink: Send + Sync {
    fn write_line(&self, line: LogLine);
}

/// Default sink: forwards container log lines to `tracing`.
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn write_line(&self, line: LogLine) {
        match line.stream {
            LogStream::Stdout => tracing::info!(
                guid = %line.guid,
                source = %line.source_name,
                index = line.index,
                "{}",
                line.message
            ),
            LogStream::Stderr => tracing::warn!(
                guid = %line.guid,
                source = %line.source_name,
                index = line.index,
                "{}",
                line.message
            ),
        }
    }
}

/// Sink that collects stdout lines into a shared buffer and discards
/// stderr. Used for health-check output that is only surfaced on failure.
pub struct BufferLogSink {
    buffer: Arc<Mutex<String>>,
}

impl BufferLogSink {
    pub fn new(buffer: Arc<Mutex<String>>) -> Self {
        Self { buffer }
    }
}

impl LogSink for BufferLogSink {
    fn write_line(&self, line: LogLine) {
        if line.stream == LogStream::Stdout {
            let mut buffer = self.buffer.lock().expect("log buffer lock poisoned");
            buffer.push_str(&line.message);
            buffer.push('\n');
        }
    }
}

const DEFAULT_SOURCE_NAME: &str = "LOG";

/// Attributes log lines for one container.
#[derive(Clone)]
pub struct LogStreamer {
    config: LogConfig,
    source: String,
    sink: Arc<dyn LogSink>,
}

impl LogStreamer {
    pub fn new(config: LogConfig, sink: Arc<dyn LogSink>) -> Self {
        let source = if config.source_name.is_empty() {
            DEFAULT_SOURCE_NAME.to_string()
        } else {
            config.source_name.clone()
        };

        Self {
            config,
            source,
            sink,
        }
    }

    /// Streamer whose stdout accumulates in `buffer` and whose stderr is
    /// discarded.
    pub fn buffered(buffer: Arc<Mutex<String>>) -> Self {
        Self::new(
            LogConfig::default(),
            Arc::new(BufferLogSink::new(buffer)),
        )
    }

    /// A copy of this streamer attributing lines to a different source
    /// name, e.g. `HEALTH` for monitor output.
    pub fn with_source(&self, source: impl Into<String>) -> Self {
        Self {
            config: self.config.clone(),
            source: source.into(),
            sink: Arc::clone(&self.sink),
        }
    }

    /// Emits one or more stdout lines.
    pub fn stdout(&self, message: impl AsRef<str>) {
        self.emit(LogStream::Stdout, message.as_ref());
    }

    /// Emits one or more stderr lines.
    pub fn stderr(&self, message: impl AsRef<str>) {
        self.emit(LogStream::Stderr, message.as_ref());
    }

    fn emit(&self, stream: LogStream, message: &str) {
        for line in message.split('\n') {
            if line.is_empty() {
                continue;
            }
            self.sink.write_line(LogLine {
                guid: self.config.guid.clone(),
                source_name: self.source.clone(),
                index: self.config.index,
                stream,
                message: line.to_string(),
            });
        }
    }

    /// A line-buffering [`AsyncWrite`] suitable for process stdout.
    pub fn stdout_writer(&self) -> LogWriter {
        LogWriter::new(self.clone(), LogStream::Stdout)
    }

    /// A line-buffering [`AsyncWrite`] suitable for process stderr.
    pub fn stderr_writer(&self) -> LogWriter {
        LogWriter::new(self.clone(), LogStream::Stderr)
    }
}

/// Line-buffering writer that forwards complete lines to the streamer's
/// sink. Flush emits any partial trailing line.
pub struct LogWriter {
    streamer: LogStreamer,
    stream: LogStream,
    partial: Vec<u8>,
}

impl LogWriter {
    fn new(streamer: LogStreamer, stream: LogStream) -> Self {
        Self {
            streamer,
            stream,
            partial: Vec::new(),
        }
    }

    fn consume(&mut self, buf: &[u8]) {
        self.partial.extend_from_slice(buf);

        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            self.streamer.emit(self.stream, &text);
        }
    }

    /// Emits any buffered partial line.
    pub fn flush_partial(&mut self) {
        if !self.partial.is_empty() {
            let text = String::from_utf8_lossy(&self.partial).into_owned();
            self.partial.clear();
            self.streamer.emit(self.stream, &text);
        }
    }
}

impl AsyncWrite for LogWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.consume(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.flush_partial();
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.flush_partial();
        Poll::Ready(Ok(()))
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        self.flush_partial();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    struct CapturingSink(Mutex<Vec<LogLine>>);

    impl LogSink for CapturingSink {
        fn write_line(&self, line: LogLine) {
            self.0.lock().unwrap().push(line);
        }
    }

    fn streamer() -> (LogStreamer, Arc<CapturingSink>) {
        let sink = Arc::new(CapturingSink(Mutex::new(Vec::new())));
        let config = LogConfig {
            guid: "app-guid".to_string(),
            source_name: "APP".to_string(),
            index: 2,
        };
        (LogStreamer::new(config, sink.clone()), sink)
    }

    #[tokio::test]
    async fn writer_splits_on_newlines_and_flushes_remainder() {
        let (streamer, sink) = streamer();
        let mut writer = streamer.stdout_writer();

        writer.write_all(b"first line\nsecond").await.unwrap();
        writer.write_all(b" half\npartial").await.unwrap();
        writer.flush().await.unwrap();

        let lines = sink.0.lock().unwrap();
        let messages: Vec<_> = lines.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["first line", "second half", "partial"]);
        assert!(lines.iter().all(|l| l.source_name == "APP" && l.index == 2));
    }

    #[test]
    fn buffered_streamer_collects_stdout_and_discards_stderr() {
        let buffer = Arc::new(Mutex::new(String::new()));
        let streamer = LogStreamer::buffered(buffer.clone());

        streamer.stdout("check failed: connection refused");
        streamer.stderr("noise");

        assert_eq!(
            buffer.lock().unwrap().as_str(),
            "check failed: connection refused\n"
        );
    }

    #[test]
    fn with_source_overrides_attribution() {
        let (streamer, sink) = streamer();
        streamer.with_source("HEALTH").stderr("unhealthy");

        let lines = sink.0.lock().unwrap();
        assert_eq!(lines[0].source_name, "HEALTH");
    }
}
