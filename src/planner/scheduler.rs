//! Orders a change set into dependency-respecting batches.
//!
//! Precedence edges:
//! - create/update of X waits for the create/update of each changing
//!   dependency of X
//! - delete of X waits for the delete of every recorded dependent of X,
//!   and for the update of every dependent that drops X
//! - in a replacement, delete of X comes before create of X

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::error::PlanError;

use super::changeset::{ChangeKey, ChangeOp, ChangeRecord, ChangeSet};

/// Batches plus the precedence relation they were derived from.
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    /// Batches in execution order; records in a batch are independent.
    pub batches: Vec<Vec<ChangeRecord>>,
    /// Direct predecessors of each scheduled record.
    pub predecessors: BTreeMap<ChangeKey, BTreeSet<ChangeKey>>,
}

/// Builds the precedence edges and layers the records.
///
/// No-op records are left out. Within a batch, records are ordered by
/// name and then by operation (delete, create, update).
///
/// # Errors
///
/// Returns [`PlanError::DependencyResolutionFailed`] if the edges form a
/// cycle.
pub fn schedule(changes: &ChangeSet) -> Result<Schedule, PlanError> {
    let records: BTreeMap<ChangeKey, &ChangeRecord> =
        changes.changes().map(|r| (r.key(), r)).collect();
    let predecessors = precedence(&records);

    let mut successors: BTreeMap<&ChangeKey, Vec<&ChangeKey>> = BTreeMap::new();
    let mut in_degree: BTreeMap<&ChangeKey, usize> = BTreeMap::new();
    for (key, preds) in &predecessors {
        in_degree.insert(key, preds.len());
        for pred in preds {
            successors.entry(pred).or_default().push(key);
        }
    }

    let mut ready: Vec<&ChangeKey> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(k, _)| *k)
        .collect();
    let mut batches = Vec::new();
    let mut scheduled = 0;

    while !ready.is_empty() {
        ready.sort();
        let mut next = Vec::new();
        let mut batch = Vec::with_capacity(ready.len());

        for key in &ready {
            in_degree.remove(*key);
            if let Some(record) = records.get(*key) {
                batch.push((*record).clone());
            }
            for succ in successors.get(*key).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(*succ) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(*succ);
                    }
                }
            }
        }

        scheduled += batch.len();
        debug!(
            "Batch {}: {}",
            batches.len() + 1,
            batch.iter().map(|r| r.key().to_string()).collect::<Vec<_>>().join(", ")
        );
        batches.push(batch);
        ready = next;
    }

    if scheduled != records.len() {
        let stuck: Vec<String> = in_degree.keys().map(ToString::to_string).collect();
        return Err(PlanError::DependencyResolutionFailed {
            message: format!("cycle among changes: {}", stuck.join(", ")),
        });
    }

    Ok(Schedule {
        batches,
        predecessors,
    })
}

/// Computes the direct predecessors of every record.
fn precedence(
    records: &BTreeMap<ChangeKey, &ChangeRecord>,
) -> BTreeMap<ChangeKey, BTreeSet<ChangeKey>> {
    let has = |name: &str, op: ChangeOp| records.contains_key(&ChangeKey::new(name, op));
    let mut predecessors: BTreeMap<ChangeKey, BTreeSet<ChangeKey>> =
        records.keys().map(|k| (k.clone(), BTreeSet::new())).collect();

    for (key, record) in records {
        let preds = predecessors.entry(key.clone()).or_default();

        match record.operation {
            ChangeOp::Create | ChangeOp::Update => {
                for dep in &record.dependencies {
                    if has(dep, ChangeOp::Create) {
                        preds.insert(ChangeKey::new(dep.clone(), ChangeOp::Create));
                    } else if has(dep, ChangeOp::Update) {
                        preds.insert(ChangeKey::new(dep.clone(), ChangeOp::Update));
                    }
                }
                if record.operation == ChangeOp::Create && has(&record.name, ChangeOp::Delete) {
                    preds.insert(ChangeKey::new(record.name.clone(), ChangeOp::Delete));
                }
            }
            ChangeOp::Delete => {
                for other in records.values() {
                    if other.name == record.name {
                        continue;
                    }
                    let depended_on_us = match other.operation {
                        ChangeOp::Delete => other.dependencies.contains(&record.name),
                        ChangeOp::Update => {
                            other.prior_dependencies.contains(&record.name)
                                && !other.dependencies.contains(&record.name)
                        }
                        ChangeOp::Create | ChangeOp::NoOp => false,
                    };
                    if depended_on_us {
                        preds.insert(other.key());
                    }
                }
            }
            ChangeOp::NoOp => {}
        }
    }

    predecessors
}
