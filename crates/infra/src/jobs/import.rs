//! Importing peers the account already knows.

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::debug;

use outreach_protocol::{ConversationCursor, ProtocolError, RemoteUser};

use super::runner::{labels_or, per_target, JobAbort, JobContext, JobRunner};
use super::types::{JobKind, JobParams, TargetOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    AddressBook,
    Conversations,
}

/// Imports either the address book or private-conversation peers as contacts.
pub struct ImportRunner {
    source: Source,
}

impl ImportRunner {
    pub fn contacts() -> Self {
        Self {
            source: Source::AddressBook,
        }
    }

    pub fn conversations() -> Self {
        Self {
            source: Source::Conversations,
        }
    }

    fn kind(&self) -> JobKind {
        match self.source {
            Source::AddressBook => JobKind::ImportContacts,
            Source::Conversations => JobKind::ImportConversations,
        }
    }
}

#[async_trait]
impl JobRunner for ImportRunner {
    async fn run(&self, ctx: &mut JobContext) -> Result<(), JobAbort> {
        let labels = match (self.source, ctx.params()) {
            (Source::AddressBook, JobParams::ImportContacts { labels }) => {
                labels_or(labels, "contacts")
            }
            (Source::Conversations, JobParams::ImportConversations { labels }) => {
                labels_or(labels, "chat")
            }
            _ => return Err(JobAbort::PayloadMismatch(self.kind())),
        };

        let conn = ctx.connection().await?;
        let mut seen = HashSet::new();

        match self.source {
            Source::AddressBook => {
                let users = ctx
                    .call("list_existing_relationships", || {
                        conn.list_existing_relationships()
                    })
                    .await
                    .map_err(abort_listing)?;
                import_page(ctx, &mut seen, users, &labels)?;
            }
            Source::Conversations => {
                let mut cursor: Option<ConversationCursor> = None;
                loop {
                    let page = ctx
                        .call("list_conversations", || {
                            conn.list_conversations(cursor.as_ref())
                        })
                        .await
                        .map_err(abort_listing)?;
                    debug!(job_id = %ctx.job_id(), peers = page.users.len(), "conversation page");
                    import_page(ctx, &mut seen, page.users, &labels)?;
                    match page.next {
                        Some(next) => cursor = Some(next),
                        None => break,
                    }
                }
            }
        }
        Ok(())
    }
}

/// Without a listing there is nothing left to import.
fn abort_listing(err: ProtocolError) -> JobAbort {
    match per_target(err) {
        Ok(err) => JobAbort::Protocol(err),
        Err(abort) => abort,
    }
}

fn import_page(
    ctx: &mut JobContext,
    seen: &mut HashSet<i64>,
    users: Vec<RemoteUser>,
    labels: &[String],
) -> Result<(), JobAbort> {
    ctx.discover(users.len());

    let mut outcomes = Vec::with_capacity(users.len());
    let mut fresh = Vec::new();
    for user in users {
        let target = user.remote_id.to_string();
        if !seen.insert(user.remote_id) {
            outcomes.push(TargetOutcome::duplicate(target));
        } else if ctx.contacts().contains_remote(ctx.resource(), user.remote_id) {
            outcomes.push(TargetOutcome::skipped(target, "already imported"));
        } else {
            outcomes.push(TargetOutcome::succeeded(target));
            fresh.push(user);
        }
    }

    ctx.contacts().upsert_many(ctx.resource(), &fresh, labels)?;
    ctx.record_all(outcomes);
    Ok(())
}
