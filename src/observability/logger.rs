use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{AccessLogConfig, AccessLogFormat};

const CHANNEL_CAPACITY: usize = 1024;

/// Access log entry
#[derive(Debug, Clone, Serialize)]
pub struct AccessLogEntry {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub client_ip: Option<String>,
    pub method: String,
    pub path: String,
    pub upstream: Option<String>,
    pub upstream_url: Option<String>,
    pub status: u16,
    pub duration_ms: u64,
    pub outcome: String,
}

impl AccessLogEntry {
    fn render(&self, format: AccessLogFormat) -> String {
        match format {
            AccessLogFormat::Common => format!(
                "{} - - [{}] \"{} {} HTTP/1.1\" {} - {} {}ms\n",
                self.client_ip.as_deref().unwrap_or("-"),
                self.timestamp.format("%d/%b/%Y:%H:%M:%S %z"),
                self.method,
                self.path,
                self.status,
                self.upstream.as_deref().unwrap_or("-"),
                self.duration_ms,
            ),
            AccessLogFormat::Json => {
                format!("{}\n", serde_json::to_string(self).unwrap_or_default())
            }
        }
    }
}

pub(crate) const DROPPED_ENTRIES_METRIC: &str = "gateway_access_log_dropped_total";
pub(crate) const WRITE_ERRORS_METRIC: &str = "gateway_access_log_write_errors_total";

/// Non-blocking handle to the access log writer.
///
/// `record` never waits and never fails: entries that do not fit in the
/// queue are dropped and counted in `gateway_access_log_dropped_total`.
#[derive(Clone)]
pub struct AccessLog {
    sender: Option<mpsc::Sender<AccessLogEntry>>,
}

/// Background task draining the queue. Await it after every `AccessLog`
/// clone is gone to flush pending entries.
pub struct AccessLogWriter {
    task: Option<JoinHandle<()>>,
}

impl AccessLog {
    pub async fn start(config: &AccessLogConfig) -> Result<(Self, AccessLogWriter)> {
        if !config.enabled {
            return Ok((Self::disabled(), AccessLogWriter { task: None }));
        }

        let sink: Box<dyn AsyncWrite + Send + Unpin> = if config.output == "stdout" {
            Box::new(tokio::io::stdout())
        } else {
            let path = std::path::Path::new(&config.output);
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create access log directory: {}", parent.display()))?;
            }
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .with_context(|| format!("Failed to open access log: {}", config.output))?;
            Box::new(file)
        };

        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let task = tokio::spawn(write_entries(receiver, sink, config.format));

        Ok((
            Self {
                sender: Some(sender),
            },
            AccessLogWriter { task: Some(task) },
        ))
    }

    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    pub fn record(&self, entry: AccessLogEntry) {
        let Some(sender) = &self.sender else { return };
        if sender.try_send(entry).is_err() {
            counter!(DROPPED_ENTRIES_METRIC).increment(1);
        }
    }
}

impl AccessLogWriter {
    pub async fn finish(self) {
        if let Some(task) = self.task {
            if let Err(e) = task.await {
                warn!("Access log writer terminated abnormally: {}", e);
            }
        }
    }
}

async fn write_entries(
    mut receiver: mpsc::Receiver<AccessLogEntry>,
    mut sink: Box<dyn AsyncWrite + Send + Unpin>,
    format: AccessLogFormat,
) {
    while let Some(entry) = receiver.recv().await {
        let line = entry.render(format);
        if let Err(e) = sink.write_all(line.as_bytes()).await {
            counter!(WRITE_ERRORS_METRIC).increment(1);
            debug!("Access log write failed: {}", e);
            continue;
        }
        if receiver.is_empty() {
            if let Err(e) = sink.flush().await {
                counter!(WRITE_ERRORS_METRIC).increment(1);
                debug!("Access log flush failed: {}", e);
            }
        }
    }

    let _ = sink.flush().await;
}
