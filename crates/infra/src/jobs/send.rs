//! Message delivery to stored contacts.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use outreach_core::ContactId;
use outreach_protocol::{ProtocolError, ProtocolResult, ProtocolSession};

use super::runner::{per_target, JobAbort, JobContext, JobRunner};
use super::types::{JobKind, JobParams, TargetOutcome};
use crate::contacts::Contact;

pub struct SendRunner;

/// What to do with one requested target, decided before anything is sent.
enum Step {
    Deliver(Contact),
    Duplicate,
    Missing,
}

/// Resolve targets against the contact store, skipping repeats by contact and by remote user.
fn plan(ctx: &JobContext, targets: &[ContactId]) -> Vec<Step> {
    let mut seen_contacts = HashSet::new();
    let mut seen_users = HashSet::new();
    targets
        .iter()
        .map(|id| {
            if !seen_contacts.insert(*id) {
                return Step::Duplicate;
            }
            match ctx.contacts().get(ctx.resource(), *id).filter(|c| c.is_valid) {
                None => Step::Missing,
                Some(contact) if !seen_users.insert(contact.remote_id) => Step::Duplicate,
                Some(contact) => Step::Deliver(contact),
            }
        })
        .collect()
}

#[async_trait]
impl JobRunner for SendRunner {
    async fn run(&self, ctx: &mut JobContext) -> Result<(), JobAbort> {
        let JobParams::SendMessages {
            message,
            delay,
            targets,
        } = ctx.params().clone()
        else {
            return Err(JobAbort::PayloadMismatch(JobKind::SendMessages));
        };

        let steps = plan(ctx, &targets);
        // No pause after the final delivery, even when skipped targets follow it.
        let last_delivery = steps.iter().rposition(|s| matches!(s, Step::Deliver(_)));

        for (i, (id, step)) in targets.iter().zip(steps).enumerate() {
            let target = id.to_string();
            let contact = match step {
                Step::Duplicate => {
                    ctx.record(TargetOutcome::duplicate(target));
                    continue;
                }
                Step::Missing => {
                    ctx.record(TargetOutcome::failed(target, "contact not found"));
                    continue;
                }
                Step::Deliver(contact) => contact,
            };

            let conn = ctx.connection().await?;
            let outcome = match deliver(ctx, &conn, &contact, &message).await {
                Ok(()) => TargetOutcome::succeeded(target),
                Err(e) => {
                    let e = per_target(e)?;
                    debug!(job_id = %ctx.job_id(), contact = %id, error = %e, "send failed");
                    TargetOutcome::failed(target, e.to_string())
                }
            };
            ctx.record(outcome);

            if last_delivery.is_some_and(|last| i < last) && !delay.is_zero() {
                ctx.pause(delay.sample()).await?;
            }
        }
        Ok(())
    }
}

/// Send once; on a stale peer with a known alias, re-resolve and send again.
async fn deliver(
    ctx: &JobContext,
    conn: &Arc<dyn ProtocolSession>,
    contact: &Contact,
    text: &str,
) -> ProtocolResult<()> {
    let user = contact.to_remote_user();
    match ctx
        .call("send_message", || conn.send_message(&user, text))
        .await
    {
        Err(ProtocolError::PeerInvalid) => {
            let Some(alias) = contact
                .alias
                .as_deref()
                .map(|a| a.trim_start_matches('@'))
                .filter(|a| !a.is_empty())
            else {
                return Err(ProtocolError::PeerInvalid);
            };
            info!(job_id = %ctx.job_id(), alias, "peer invalid; re-resolving by alias");
            let fresh = ctx
                .call("resolve_alias", || conn.resolve_alias(alias))
                .await?;
            ctx.call("send_message", || conn.send_message(&fresh, text))
                .await
        }
        other => other,
    }
}
