//! DLQ alerting.
//!
//! Workers and hooks publish [`QueueEvent`]s on a broadcast channel; the
//! alerter turns terminal failures into redacted notifications on the
//! configured alert channel. Task content is always passed through
//! [`crate::text::redact`] before it leaves the process.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::{MAX_ALERT_CHARS, OrchestratorConfig};
use crate::host::MessageSender;
use crate::text;

/// Queue state changes other components subscribe to.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// A launch exhausted its retries (or hit an unrecoverable error).
    LaunchDeadLettered {
        job_id: String,
        target: String,
        task: String,
        error: String,
    },
    /// A job exhausted its agent-level retries.
    JobFailedPermanent {
        job_id: String,
        target: String,
        task: String,
        error: Option<String>,
    },
}

/// Compose the redacted alert line for an event.
pub fn alert_message(event: &QueueEvent) -> String {
    match event {
        QueueEvent::LaunchDeadLettered {
            job_id,
            target,
            task,
            error,
        } => format!(
            "Launch dead-lettered on agent-{target}: job {job_id}: {}\nTask: {}",
            text::redact(error),
            text::truncate_with_ellipsis(&text::redact(task), MAX_ALERT_CHARS),
        ),
        QueueEvent::JobFailedPermanent {
            job_id,
            target,
            task,
            error,
        } => format!(
            "Job permanently failed on agent-{target}: {job_id}: {}\nTask: {}",
            text::redact(error.as_deref().unwrap_or("no error recorded")),
            text::truncate_with_ellipsis(&text::redact(task), MAX_ALERT_CHARS),
        ),
    }
}

/// Consume queue events until cancelled, sending one redacted alert per
/// terminal failure. Send failures are logged and swallowed; alerting must
/// never wedge the queues.
pub async fn run_alerter(
    config: Arc<OrchestratorConfig>,
    sender: Arc<dyn MessageSender>,
    mut events: broadcast::Receiver<QueueEvent>,
    cancel: CancellationToken,
) {
    let channel = match &config.alerts.channel_id {
        Some(c) => c.clone(),
        None => {
            tracing::info!("no alert channel configured, DLQ alerts are log-only");
            String::new()
        }
    };

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            received = events.recv() => match received {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "alerter lagged behind queue events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        let message = alert_message(&event);
        let (job_id, target) = match &event {
            QueueEvent::LaunchDeadLettered { job_id, target, .. }
            | QueueEvent::JobFailedPermanent { job_id, target, .. } => (job_id, target),
        };

        tracing::warn!(job_id = %job_id, target = %target, "dead-letter alert: {message}");

        if channel.is_empty() {
            continue;
        }
        if let Err(err) = sender
            .send(&channel, target, &message, &format!("dlq-{job_id}"))
            .await
        {
            tracing::warn!(job_id = %job_id, error = %err, "failed to send DLQ alert");
        }
    }
}
