//! Application log buffering and batched delivery.
//!
//! Every entry is emitted as a `tracing` event straight away. When a
//! [`LogShipper`] is configured, entries (and security events) are also
//! buffered and shipped in batches by a single background flush loop.

use crate::error::{ApiError, ErrorKind};
use crate::security::SecurityEvent;
use crate::signer::unix_millis;
use crate::task::ScheduledTask;
use crate::{Error, Result};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

/// One item of a shipped batch.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum LogRecord {
    Log(LogEntry),
    Security(SecurityEvent),
}

/// Delivers batches of records somewhere durable.
pub trait LogShipper: Send + Sync {
    fn ship<'a>(&'a self, batch: &'a [LogRecord]) -> BoxFuture<'a, Result<()>>;
}

/// Ships batches as a JSON array `POST`ed to a collector endpoint.
pub struct HttpLogShipper {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpLogShipper {
    pub fn new(client: reqwest::Client, endpoint: &str) -> Result<Self> {
        Ok(Self {
            client,
            endpoint: Url::parse(endpoint)?,
        })
    }
}

impl LogShipper for HttpLogShipper {
    fn ship<'a>(&'a self, batch: &'a [LogRecord]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let response = self
                .client
                .post(self.endpoint.clone())
                .json(batch)
                .send()
                .await
                .map_err(|e| Error::from(ApiError::new(ErrorKind::Network, e.to_string())))?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ApiError::from_status(status, body).into());
            }
            Ok(())
        })
    }
}

/// Pending records awaiting shipment.
pub struct LogBuffer {
    records: Mutex<Vec<LogRecord>>,
    batch_size: usize,
    capacity: usize,
    shipper: Option<Arc<dyn LogShipper>>,
    batch_ready: Notify,
}

impl LogBuffer {
    /// Without a shipper nothing is retained.
    pub fn new(batch_size: usize, shipper: Option<Arc<dyn LogShipper>>) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            records: Mutex::new(Vec::new()),
            batch_size,
            capacity: batch_size.saturating_mul(20),
            shipper,
            batch_ready: Notify::new(),
        }
    }

    pub fn push(&self, record: LogRecord) {
        if self.shipper.is_none() {
            return;
        }
        let len = {
            let mut records = self.lock();
            if records.len() >= self.capacity {
                records.remove(0);
            }
            records.push(record);
            records.len()
        };
        if len >= self.batch_size {
            self.batch_ready.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ships everything buffered, one batch at a time.
    ///
    /// A failed batch and everything behind it go back to the front of the
    /// buffer; the oldest records are dropped if that overflows capacity.
    pub async fn flush(&self) -> Result<()> {
        let Some(shipper) = &self.shipper else {
            return Ok(());
        };
        let mut pending = std::mem::take(&mut *self.lock());
        if pending.is_empty() {
            return Ok(());
        }

        let mut shipped = 0;
        let mut failure = None;
        for batch in pending.chunks(self.batch_size) {
            match shipper.ship(batch).await {
                Ok(()) => shipped += batch.len(),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        match failure {
            None => Ok(()),
            Some(e) => {
                let failed = pending.split_off(shipped);
                tracing::warn!(
                    error = %e,
                    requeued = failed.len(),
                    "Failed to ship log batch"
                );
                let mut records = self.lock();
                let newer = std::mem::replace(&mut *records, failed);
                records.extend(newer);
                let overflow = records.len().saturating_sub(self.capacity);
                records.drain(..overflow);
                Err(e)
            }
        }
    }

    /// Starts the flush loop: every `interval`, whenever a full batch is
    /// waiting, and a final time on cancellation.
    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration) -> ScheduledTask {
        let buffer = Arc::clone(self);
        ScheduledTask::spawn("log-flush", CancellationToken::new(), move |token| async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = buffer.batch_ready.notified() => {}
                    _ = ticker.tick() => {}
                }
                let _ = buffer.flush().await;
            }
            let _ = buffer.flush().await;
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<LogRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Leveled application logger.
pub struct Logger {
    min_level: LogLevel,
    enabled: bool,
    buffer: Arc<LogBuffer>,
}

impl Logger {
    pub fn new(min_level: LogLevel, enabled: bool, buffer: Arc<LogBuffer>) -> Self {
        Self {
            min_level,
            enabled,
            buffer,
        }
    }

    /// Logs `message` if enabled and at or above the minimum level.
    pub fn log(
        &self,
        level: LogLevel,
        message: &str,
        correlation_id: Option<&str>,
        context: Option<Value>,
    ) {
        if !self.enabled || level < self.min_level {
            return;
        }
        let correlation = correlation_id.unwrap_or("-");
        match level {
            LogLevel::Debug => tracing::debug!(correlation_id = correlation, ?context, "{message}"),
            LogLevel::Info => tracing::info!(correlation_id = correlation, ?context, "{message}"),
            LogLevel::Warn => tracing::warn!(correlation_id = correlation, ?context, "{message}"),
            LogLevel::Error => tracing::error!(correlation_id = correlation, ?context, "{message}"),
        }
        self.buffer.push(LogRecord::Log(LogEntry {
            level,
            message: message.to_string(),
            correlation_id: correlation_id.map(str::to_owned),
            timestamp: unix_millis(),
            context,
        }));
    }

    pub fn debug(&self, message: &str, correlation_id: Option<&str>) {
        self.log(LogLevel::Debug, message, correlation_id, None);
    }

    pub fn info(&self, message: &str, correlation_id: Option<&str>) {
        self.log(LogLevel::Info, message, correlation_id, None);
    }

    pub fn warn(&self, message: &str, correlation_id: Option<&str>) {
        self.log(LogLevel::Warn, message, correlation_id, None);
    }

    pub fn error(&self, message: &str, correlation_id: Option<&str>) {
        self.log(LogLevel::Error, message, correlation_id, None);
    }

    pub async fn flush(&self) -> Result<()> {
        self.buffer.flush().await
    }

    /// Number of records waiting to be shipped.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn buffer(&self) -> &Arc<LogBuffer> {
        &self.buffer
    }
}
