//! Phone and alias verification.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use outreach_protocol::{ProtocolError, ProtocolSession, RemoteUser};

use super::runner::{labels_or, per_target, JobAbort, JobContext, JobRunner};
use super::types::{normalize_alias, JobKind, JobParams, TargetOutcome};

/// Position of one identifier inside a verification batch.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Fresh(String),
    Repeat(String),
}

/// Split identifiers into batches holding at most `size` distinct entries.
///
/// Repeats stay where they were requested so results keep request order.
fn plan_batches(identifiers: &[String], size: usize) -> Vec<Vec<Slot>> {
    let mut seen = HashSet::new();
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut fresh = 0;

    for raw in identifiers {
        let id = raw.trim();
        if id.is_empty() {
            continue;
        }
        if !seen.insert(id.to_string()) {
            current.push(Slot::Repeat(id.to_string()));
            continue;
        }
        if fresh == size {
            batches.push(std::mem::take(&mut current));
            fresh = 0;
        }
        current.push(Slot::Fresh(id.to_string()));
        fresh += 1;
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

pub struct VerifyRunner;

#[async_trait]
impl JobRunner for VerifyRunner {
    async fn run(&self, ctx: &mut JobContext) -> Result<(), JobAbort> {
        let JobParams::VerifyContacts {
            identifiers,
            aliases,
            labels,
        } = ctx.params().clone()
        else {
            return Err(JobAbort::PayloadMismatch(JobKind::VerifyContacts));
        };

        let conn = ctx.connection().await?;

        // Relationships present before the job are never removed.
        let existing: Option<HashSet<i64>> = match ctx
            .call("list_existing_relationships", || {
                conn.list_existing_relationships()
            })
            .await
        {
            Ok(users) => Some(users.into_iter().map(|u| u.remote_id).collect()),
            Err(e) => {
                let e = per_target(e)?;
                warn!(job_id = %ctx.job_id(), error = %e, "could not list relationships; cleanup disabled");
                None
            }
        };

        let phone_labels = labels_or(&labels, "phone");
        let mut added: Vec<RemoteUser> = Vec::new();

        for batch in plan_batches(&identifiers, ctx.batch_size()) {
            let fresh: Vec<String> = batch
                .iter()
                .filter_map(|slot| match slot {
                    Slot::Fresh(id) => Some(id.clone()),
                    Slot::Repeat(_) => None,
                })
                .collect();

            let verdicts: HashMap<String, TargetOutcome> = if fresh.is_empty() {
                HashMap::new()
            } else {
                match ctx.call("bulk_verify", || conn.bulk_verify(&fresh)).await {
                    Ok(result) => {
                        let users: Vec<RemoteUser> =
                            result.resolved.iter().map(|r| r.user.clone()).collect();
                        ctx.contacts()
                            .upsert_many(ctx.resource(), &users, &phone_labels)?;
                        if let Some(existing) = &existing {
                            added.extend(
                                users
                                    .into_iter()
                                    .filter(|u| !existing.contains(&u.remote_id)),
                            );
                        }

                        let mut verdicts: HashMap<String, TargetOutcome> = HashMap::new();
                        for r in &result.resolved {
                            verdicts.insert(
                                r.identifier.clone(),
                                TargetOutcome::succeeded(&r.identifier),
                            );
                        }
                        for id in &result.retry_later {
                            verdicts
                                .entry(id.clone())
                                .or_insert_with(|| TargetOutcome::failed(id, "retry later"));
                        }
                        verdicts
                    }
                    Err(e) => {
                        let e = per_target(e)?;
                        warn!(job_id = %ctx.job_id(), batch = fresh.len(), error = %e, "batch verification failed");
                        let msg = e.to_string();
                        fresh
                            .iter()
                            .map(|id| (id.clone(), TargetOutcome::failed(id, msg.clone())))
                            .collect()
                    }
                }
            };

            let outcomes: Vec<TargetOutcome> = batch
                .into_iter()
                .map(|slot| match slot {
                    Slot::Repeat(id) => TargetOutcome::duplicate(id),
                    Slot::Fresh(id) => verdicts
                        .get(&id)
                        .cloned()
                        .unwrap_or_else(|| TargetOutcome::skipped(id, "not registered")),
                })
                .collect();
            ctx.record_all(outcomes);
        }

        let alias_labels = labels_or(&labels, "username");
        let mut seen_aliases = HashSet::new();
        for alias in aliases.iter().filter_map(|a| normalize_alias(a)) {
            if !seen_aliases.insert(alias.clone()) {
                ctx.record(TargetOutcome::duplicate(alias));
                continue;
            }
            let name = alias.trim_start_matches('@');
            let outcome = match ctx.call("resolve_alias", || conn.resolve_alias(name)).await {
                Ok(user) => {
                    ctx.contacts().upsert_many(
                        ctx.resource(),
                        std::slice::from_ref(&user),
                        &alias_labels,
                    )?;
                    TargetOutcome::succeeded(&alias)
                }
                Err(ProtocolError::NotFound(_)) => TargetOutcome::skipped(&alias, "not registered"),
                Err(e) => {
                    let e = per_target(e)?;
                    TargetOutcome::failed(&alias, e.to_string())
                }
            };
            ctx.record(outcome);
        }

        remove_added(ctx, &conn, added).await;
        Ok(())
    }
}

/// Best-effort removal of relationships the verification created.
async fn remove_added(
    ctx: &JobContext,
    conn: &Arc<dyn ProtocolSession>,
    mut added: Vec<RemoteUser>,
) {
    let mut seen = HashSet::new();
    added.retain(|u| seen.insert(u.remote_id));
    if added.is_empty() {
        return;
    }
    match ctx
        .call("remove_relationships", || conn.remove_relationships(&added))
        .await
    {
        Ok(()) => info!(job_id = %ctx.job_id(), removed = added.len(), "removed relationships added by verification"),
        Err(e) => warn!(job_id = %ctx.job_id(), error = %e, "failed to remove relationships added by verification"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ids(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn batches_count_distinct_identifiers_only() {
        let plan = plan_batches(&ids(&["+1", "+2", "+1", "+3", " ", "+2", "+4"]), 2);
        assert_eq!(
            plan,
            vec![
                vec![
                    Slot::Fresh("+1".into()),
                    Slot::Fresh("+2".into()),
                    Slot::Repeat("+1".into()),
                ],
                vec![
                    Slot::Fresh("+3".into()),
                    Slot::Repeat("+2".into()),
                    Slot::Fresh("+4".into()),
                ],
            ]
        );
    }

    #[test]
    fn empty_input_plans_nothing() {
        assert!(plan_batches(&ids(&["", "  "]), 15).is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: batching never reorders, drops or repeats a fresh identifier,
        /// and no batch holds more than `size` of them.
        #[test]
        fn batches_preserve_request_order(
            raw in prop::collection::vec("[ +]?[1-6]{1,2}", 0..40),
            size in 1usize..6,
        ) {
            let plan = plan_batches(&raw, size);

            let flattened: Vec<String> = plan
                .iter()
                .flatten()
                .map(|slot| match slot {
                    Slot::Fresh(id) | Slot::Repeat(id) => id.clone(),
                })
                .collect();
            let expected: Vec<String> = raw
                .iter()
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect();
            prop_assert_eq!(flattened, expected);

            let mut fresh_seen = HashSet::new();
            for batch in &plan {
                let fresh: Vec<&String> = batch
                    .iter()
                    .filter_map(|s| match s {
                        Slot::Fresh(id) => Some(id),
                        Slot::Repeat(_) => None,
                    })
                    .collect();
                prop_assert!(fresh.len() <= size);
                for id in fresh {
                    prop_assert!(fresh_seen.insert(id.clone()));
                }
            }
        }
    }
}
