//! Security event recording and threshold alerting.
//!
//! Producers on the request path never touch the log directly: they push
//! events into a [`SecurityEventSink`], a bounded channel drained by one
//! consumer task that owns ordering. A full channel drops the event with a
//! warning rather than stalling the request.

use crate::config::MonitoringConfig;
use crate::logging::{LogBuffer, LogRecord};
use crate::signer::unix_millis;
use crate::task::ScheduledTask;
use serde::Serialize;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const HISTORY_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// What happened, with the details relevant to that kind of event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SecurityEventKind {
    SuspiciousPayload { patterns: Vec<String> },
    PayloadTooLarge { size: usize, limit: usize },
    AuthenticationFailure { status: u16 },
    AuthorizationFailure { status: u16 },
    RateLimited { retry_after_ms: Option<u64> },
    ServerError { status: u16 },
    NetworkFailure { message: String },
    CircuitOpened { failures: u32 },
    CsrfTokenUnavailable { reason: String },
    ThresholdExceeded { count: usize, window_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecurityEvent {
    #[serde(flatten)]
    pub kind: SecurityEventKind,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl SecurityEvent {
    pub fn new(kind: SecurityEventKind, severity: Severity) -> Self {
        Self {
            kind,
            severity,
            endpoint: None,
            correlation_id: None,
            timestamp: unix_millis(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Sending half of the security event channel.
#[derive(Debug, Clone)]
pub struct SecurityEventSink {
    tx: Option<mpsc::Sender<SecurityEvent>>,
}

impl SecurityEventSink {
    /// A sink that discards everything.
    pub fn disconnected() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: SecurityEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(severity = ?event.severity, "Security event channel full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Security event consumer stopped");
            }
        }
    }
}

pub type AlertCallback = Arc<dyn Fn(&SecurityEvent) + Send + Sync>;

struct SecurityLog {
    history: VecDeque<SecurityEvent>,
    // High and critical events within the alert window.
    recent: VecDeque<Instant>,
}

/// Keeps the security event history and raises threshold alerts.
pub struct SecurityLogger {
    threshold: usize,
    window: Duration,
    log: Mutex<SecurityLog>,
    callbacks: Mutex<Vec<AlertCallback>>,
    buffer: Option<Arc<LogBuffer>>,
}

impl SecurityLogger {
    pub fn new(threshold: usize, window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            log: Mutex::new(SecurityLog {
                history: VecDeque::new(),
                recent: VecDeque::new(),
            }),
            callbacks: Mutex::new(Vec::new()),
            buffer: None,
        }
    }

    /// Also forward every recorded event to `buffer` for shipping.
    pub fn with_buffer(mut self, buffer: Arc<LogBuffer>) -> Self {
        self.buffer = Some(buffer);
        self
    }

    /// Starts the consumer task and returns the logger, the sink feeding it
    /// and the task handle. Cancelling the task drains what is queued.
    pub fn spawn(
        config: &MonitoringConfig,
        buffer: Arc<LogBuffer>,
    ) -> (Arc<Self>, SecurityEventSink, ScheduledTask) {
        let logger = Arc::new(
            Self::new(config.alert_threshold, config.alert_window).with_buffer(buffer),
        );
        let (tx, mut rx) = mpsc::channel(config.security_event_capacity.max(1));
        let consumer = Arc::clone(&logger);
        let task = ScheduledTask::spawn(
            "security-events",
            CancellationToken::new(),
            move |token| async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        event = rx.recv() => match event {
                            Some(event) => consumer.record(event),
                            None => return,
                        },
                    }
                }
                rx.close();
                while let Ok(event) = rx.try_recv() {
                    consumer.record(event);
                }
            },
        );
        (logger, SecurityEventSink { tx: Some(tx) }, task)
    }

    /// Subscribes to threshold alerts.
    pub fn on_alert(&self, callback: impl Fn(&SecurityEvent) + Send + Sync + 'static) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Appends `event` and checks the alert threshold.
    pub fn record(&self, event: SecurityEvent) {
        match event.severity {
            Severity::Critical | Severity::High => tracing::warn!(
                kind = ?event.kind,
                severity = ?event.severity,
                endpoint = event.endpoint.as_deref().unwrap_or("-"),
                correlation_id = event.correlation_id.as_deref().unwrap_or("-"),
                "Security event"
            ),
            Severity::Medium | Severity::Low => tracing::info!(
                kind = ?event.kind,
                severity = ?event.severity,
                endpoint = event.endpoint.as_deref().unwrap_or("-"),
                "Security event"
            ),
        }

        let alert = {
            let mut log = self.lock();
            let now = Instant::now();
            let escalates = event.severity >= Severity::High;
            self.append(&mut log, event);

            if escalates {
                log.recent.push_back(now);
            }
            while log
                .recent
                .front()
                .is_some_and(|at| now.duration_since(*at) > self.window)
            {
                log.recent.pop_front();
            }

            if log.recent.len() >= self.threshold {
                let alert = SecurityEvent::new(
                    SecurityEventKind::ThresholdExceeded {
                        count: log.recent.len(),
                        window_ms: self.window.as_millis() as u64,
                    },
                    Severity::Critical,
                );
                log.recent.clear();
                self.append(&mut log, alert.clone());
                Some(alert)
            } else {
                None
            }
        };

        if let Some(alert) = alert {
            tracing::error!(kind = ?alert.kind, "Security alert threshold exceeded");
            let callbacks = self
                .callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            for callback in callbacks {
                if catch_unwind(AssertUnwindSafe(|| callback(&alert))).is_err() {
                    tracing::error!("Security alert callback panicked");
                }
            }
        }
    }

    fn append(&self, log: &mut SecurityLog, event: SecurityEvent) {
        if let Some(buffer) = &self.buffer {
            buffer.push(LogRecord::Security(event.clone()));
        }
        if log.history.len() == HISTORY_LIMIT {
            log.history.pop_front();
        }
        log.history.push_back(event);
    }

    /// Recorded events, oldest first, optionally only those of one severity.
    pub fn events(&self, severity: Option<Severity>) -> Vec<SecurityEvent> {
        self.lock()
            .history
            .iter()
            .filter(|e| severity.map_or(true, |s| e.severity == s))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        let mut log = self.lock();
        log.history.clear();
        log.recent.clear();
    }

    fn lock(&self) -> MutexGuard<'_, SecurityLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
