//! Platform-reaction handler for approvals.
//!
//! Identical control flow to the commands, triggered by a reaction event:
//! ✅ approves, ❌ rejects. Gated on the configured approval channel,
//! non-bot origin, and the authorized-approver list (empty list means
//! nobody). Unauthorized reactions are silently removed.

use crate::dispatch::ToolStatus;

use super::{ApprovalDeps, approve_record, reject_record};
use steward_db::queries::approvals as approval_db;

pub const APPROVE_EMOJI: &str = "✅";
pub const REJECT_EMOJI: &str = "❌";

/// A reaction observed on the chat platform.
#[derive(Debug, Clone)]
pub struct ReactionEvent {
    pub channel_id: String,
    pub message_id: String,
    pub emoji: String,
    pub reactor_id: String,
    /// Reactions the bot itself placed must be ignored.
    pub from_bot: bool,
}

/// Handle one reaction event. Never errors toward the platform; all
/// failures are logged.
pub async fn on_reaction(deps: &ApprovalDeps<'_>, event: ReactionEvent) {
    let Some(channel) = deps.config.approval.channel_id.as_deref() else {
        return;
    };
    if event.channel_id != channel || event.from_bot {
        return;
    }
    if event.emoji != APPROVE_EMOJI && event.emoji != REJECT_EMOJI {
        return;
    }

    let authorized = deps
        .config
        .approval
        .authorized_approvers
        .iter()
        .any(|a| a == &event.reactor_id);
    if !authorized {
        // Fail-secure: remove the reaction without comment.
        if let Err(err) = deps
            .sender
            .remove_reaction(
                &event.channel_id,
                &event.message_id,
                &event.emoji,
                Some(&event.reactor_id),
            )
            .await
        {
            tracing::debug!(error = %err, "failed to remove unauthorized reaction");
        }
        return;
    }

    // Reverse index: notification message -> approval.
    let record = match approval_db::find_by_notification_message(deps.pool, &event.message_id).await
    {
        Ok(Some(record)) => record,
        Ok(None) => {
            tracing::debug!(message_id = %event.message_id, "reaction on an unknown message");
            return;
        }
        Err(err) => {
            tracing::warn!(error = %err, "approval lookup by message failed");
            return;
        }
    };

    if event.emoji == APPROVE_EMOJI {
        let reply = approve_record(deps, record.id, &event.reactor_id).await;
        match reply.status {
            ToolStatus::Ok => {
                // Approval landed: retire the opposing option.
                remove_bot_reaction(deps, &event, REJECT_EMOJI).await;
            }
            _ if reply.message.contains("spawn failed") => {
                // Remove the approver's checkmark so re-reacting retries.
                if let Err(err) = deps
                    .sender
                    .remove_reaction(
                        &event.channel_id,
                        &event.message_id,
                        APPROVE_EMOJI,
                        Some(&event.reactor_id),
                    )
                    .await
                {
                    tracing::debug!(error = %err, "failed to reset approver reaction");
                }
            }
            _ => {
                tracing::info!(approval_id = %record.id, outcome = %reply.message, "reaction approve ignored");
            }
        }
    } else {
        let reply = reject_record(deps, record.id, &event.reactor_id).await;
        if reply.status == ToolStatus::Ok {
            remove_bot_reaction(deps, &event, APPROVE_EMOJI).await;
        } else {
            tracing::info!(approval_id = %record.id, outcome = %reply.message, "reaction reject ignored");
        }
    }
}

async fn remove_bot_reaction(deps: &ApprovalDeps<'_>, event: &ReactionEvent, emoji: &str) {
    if let Err(err) = deps
        .sender
        .remove_reaction(&event.channel_id, &event.message_id, emoji, None)
        .await
    {
        tracing::debug!(error = %err, "failed to remove bot reaction");
    }
}
