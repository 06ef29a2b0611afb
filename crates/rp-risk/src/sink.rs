//! Outbound violation queue and notification dispatch.
//!
//! [`ViolationSink`] is the only thing the gate and the monitor talk to: a
//! bounded channel whose `emit` never blocks. A [`NotificationDispatcher`]
//! drains the channel on its own thread and hands each violation to a
//! [`Notifier`] (email, webhook, log...) with retry. Dispatch failures are
//! counted and logged, never returned to the order path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError, TrySendError};
use rp_types::{RiskError, RiskResult, SinkDispatchError};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::alerts::{RuleViolation, ViolationSeverity};

/// Delivery target for violations. Implemented by the host (webhook, email).
pub trait Notifier: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    fn notify(&self, violation: &RuleViolation) -> Result<(), SinkDispatchError>;
}

/// Notifier that writes violations to the `tracing` log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn name(&self) -> &str {
        "tracing"
    }

    fn notify(&self, v: &RuleViolation) -> Result<(), SinkDispatchError> {
        match v.severity {
            ViolationSeverity::Critical => error!(
                account_id = %v.account_id,
                rule = %v.rule_name,
                kind = %v.kind,
                message = %v.message,
                "RISK CRITICAL"
            ),
            ViolationSeverity::Warning => warn!(
                account_id = %v.account_id,
                rule = %v.rule_name,
                kind = %v.kind,
                message = %v.message,
                "RISK WARNING"
            ),
            ViolationSeverity::Info => info!(
                account_id = %v.account_id,
                rule = %v.rule_name,
                kind = %v.kind,
                message = %v.message,
                "RISK INFO"
            ),
        }
        Ok(())
    }
}

/// Retry behaviour for the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchPolicy {
    /// Extra attempts after the first failure before the event is dropped.
    pub max_retries: u32,
    /// Base delay between attempts; attempt `n` waits `n * retry_backoff_ms`.
    pub retry_backoff_ms: u64,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_ms: 50,
        }
    }
}

/// Counters for the producer side of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SinkStats {
    pub emitted: u64,
    pub dropped: u64,
}

/// Non-blocking producer handle. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ViolationSink {
    tx: Sender<RuleViolation>,
    capacity: usize,
    emitted: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl ViolationSink {
    /// Create a sink with a bounded queue, returning the consumer end.
    pub fn bounded(capacity: usize) -> (Self, Receiver<RuleViolation>) {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        (Self::from_sender(tx, capacity), rx)
    }

    /// Wrap an existing sender (e.g. an unbounded channel in tests).
    pub fn from_sender(tx: Sender<RuleViolation>, capacity: usize) -> Self {
        Self {
            tx,
            capacity,
            emitted: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue a violation, dropping it if the queue is full or closed.
    pub fn emit(&self, violation: RuleViolation) {
        if let Err(err) = self.try_emit(violation) {
            warn!(error = %err, "violation dropped");
        }
    }

    /// Queue a violation, reporting why it could not be queued.
    pub fn try_emit(&self, violation: RuleViolation) -> Result<(), SinkDispatchError> {
        match self.tx.try_send(violation) {
            Ok(()) => {
                self.emitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(SinkDispatchError::QueueFull {
                    capacity: self.capacity,
                })
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(SinkDispatchError::Disconnected)
            }
        }
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            emitted: self.emitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Counters for the consumer side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DispatchStats {
    pub delivered: u64,
    pub failed: u64,
    pub retries: u64,
}

/// Background worker that forwards queued violations to a [`Notifier`].
pub struct NotificationDispatcher {
    shutdown_tx: Sender<()>,
    handle: Option<JoinHandle<DispatchStats>>,
}

impl NotificationDispatcher {
    /// Start the worker thread.
    pub fn spawn(
        rx: Receiver<RuleViolation>,
        notifier: Arc<dyn Notifier>,
        policy: DispatchPolicy,
    ) -> RiskResult<Self> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("rampart-dispatch".into())
            .spawn(move || run_dispatch(rx, shutdown_rx, notifier, policy))
            .map_err(|e| RiskError::Internal(format!("failed to spawn dispatcher: {e}")))?;

        Ok(Self {
            shutdown_tx,
            handle: Some(handle),
        })
    }

    /// Drain whatever is already queued, stop the worker and return its
    /// counters.
    pub fn shutdown(mut self) -> DispatchStats {
        self.stop()
    }

    fn stop(&mut self) -> DispatchStats {
        let _ = self.shutdown_tx.try_send(());
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                error!("dispatcher thread panicked");
                DispatchStats::default()
            }),
            None => DispatchStats::default(),
        }
    }
}

impl Drop for NotificationDispatcher {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

fn run_dispatch(
    rx: Receiver<RuleViolation>,
    shutdown_rx: Receiver<()>,
    notifier: Arc<dyn Notifier>,
    policy: DispatchPolicy,
) -> DispatchStats {
    let mut stats = DispatchStats::default();
    debug!(notifier = notifier.name(), "dispatcher started");

    loop {
        select! {
            recv(rx) -> msg => match msg {
                Ok(violation) => deliver(&violation, notifier.as_ref(), &policy, &mut stats),
                // Every sink handle dropped.
                Err(_) => break,
            },
            recv(shutdown_rx) -> _ => {
                loop {
                    match rx.try_recv() {
                        Ok(violation) => deliver(&violation, notifier.as_ref(), &policy, &mut stats),
                        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                    }
                }
                break;
            }
        }
    }

    debug!(
        delivered = stats.delivered,
        failed = stats.failed,
        retries = stats.retries,
        "dispatcher stopped"
    );
    stats
}

fn deliver(
    violation: &RuleViolation,
    notifier: &dyn Notifier,
    policy: &DispatchPolicy,
    stats: &mut DispatchStats,
) {
    let mut attempt: u32 = 0;
    loop {
        match notifier.notify(violation) {
            Ok(()) => {
                stats.delivered += 1;
                return;
            }
            Err(err) if attempt < policy.max_retries => {
                attempt += 1;
                stats.retries += 1;
                debug!(
                    notifier = notifier.name(),
                    attempt,
                    error = %err,
                    "notification failed, retrying"
                );
                std::thread::sleep(Duration::from_millis(
                    policy.retry_backoff_ms.saturating_mul(attempt as u64),
                ));
            }
            Err(err) => {
                stats.failed += 1;
                warn!(
                    notifier = notifier.name(),
                    violation_id = %violation.id,
                    rule = %violation.rule_name,
                    error = %err,
                    "notification dropped after retries"
                );
                return;
            }
        }
    }
}
