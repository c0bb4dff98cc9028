use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::blocked::BlockedRecord;
use crate::model::DiscoveryKind;
use crate::poll::Decision;
use crate::snapshot::Snapshot;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// In-progress task ids shorter than this are too generic to count as a
/// plausible-producer match inside free-text missing entries.
const MIN_PRODUCER_ID_LEN: usize = 4;

/// What to do with a blocked task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum PushbackAction {
    Retry,
    Escalate,
    Proceed,
}

impl std::fmt::Display for PushbackAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retry => write!(f, "retry"),
            Self::Escalate => write!(f, "escalate"),
            Self::Proceed => write!(f, "proceed"),
        }
    }
}

/// Classifies blocks into retry, escalate, or proceed.
#[derive(Debug, Clone)]
pub struct PushbackHandler {
    max_retries: u32,
}

impl Default for PushbackHandler {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl PushbackHandler {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Decide the action for a blocked task.
    ///
    /// NEED_INFO retries until its cap: the base cap, doubled when some
    /// in-progress task looks like the producer of a missing item. CONFLICT
    /// retries only while the counterparty holds a file claim in the
    /// snapshot; an interface-level conflict escalates immediately.
    pub fn handle(
        &self,
        record: &BlockedRecord,
        snapshot: &Snapshot,
        in_progress: &[String],
    ) -> PushbackAction {
        match record.last_result.decision {
            Decision::Proceed => PushbackAction::Proceed,
            Decision::NeedInfo => {
                let cap = self.retry_cap(record, in_progress);
                if record.retry_count < cap {
                    PushbackAction::Retry
                } else {
                    PushbackAction::Escalate
                }
            }
            Decision::Conflict => {
                let claim_backed = record
                    .last_result
                    .conflict_with
                    .as_deref()
                    .is_some_and(|counterparty| {
                        snapshot.claims.values().any(|owner| owner == counterparty)
                    });
                if claim_backed {
                    PushbackAction::Retry
                } else {
                    PushbackAction::Escalate
                }
            }
        }
    }

    /// Retry cap for a record: doubled when a plausible producer is among
    /// the in-progress tasks.
    pub fn retry_cap(&self, record: &BlockedRecord, in_progress: &[String]) -> u32 {
        if record.last_result.decision == Decision::NeedInfo
            && has_plausible_producer(&record.last_result.missing, in_progress)
        {
            2 * self.max_retries
        } else {
            self.max_retries
        }
    }

    /// Map an escalated decision to the discovery kind posted with the hail.
    pub fn discovery_kind_for(&self, decision: Decision) -> DiscoveryKind {
        match decision {
            Decision::NeedInfo => DiscoveryKind::MissingDependency,
            Decision::Conflict => DiscoveryKind::EntanglementDispute,
            Decision::Proceed => DiscoveryKind::RequirementsAmbiguity,
        }
    }

    /// Human-readable escalation report for a hail.
    pub fn escalation_message(&self, record: &BlockedRecord, cap: u32) -> String {
        let result = &record.last_result;
        let mut out = format!(
            "task {} escalated after {} of {} retries\n\
             decision: {}\n\
             reason: {}\n",
            record.task_id, record.retry_count, cap, result.decision, result.reason,
        );
        for item in &result.missing {
            out.push_str(&format!("missing: {item}\n"));
        }
        let suggestion = match result.decision {
            Decision::NeedInfo => {
                "suggestion: add the missing dependency to the task graph, or publish the \
                 expected interface from its producer"
                    .to_string()
            }
            Decision::Conflict => match &result.conflict_with {
                Some(with) => format!(
                    "suggestion: resolve the conflict with {with} (repartition scope or merge \
                     the competing interfaces)"
                ),
                None => "suggestion: resolve the interface conflict between the competing \
                         producers"
                    .to_string(),
            },
            Decision::Proceed => "suggestion: no action required".to_string(),
        };
        out.push_str(&suggestion);
        out
    }
}

/// True when any in-progress task id (of useful length) appears,
/// case-insensitively, inside any missing-info entry.
fn has_plausible_producer(missing: &[String], in_progress: &[String]) -> bool {
    in_progress
        .iter()
        .filter(|id| id.len() >= MIN_PRODUCER_ID_LEN)
        .any(|id| {
            let needle = id.to_ascii_lowercase();
            missing
                .iter()
                .any(|entry| entry.to_ascii_lowercase().contains(&needle))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::Fabric;
    use crate::poll::PollResult;
    use chrono::Utc;

    fn record(decision_result: PollResult, retries: u32) -> BlockedRecord {
        BlockedRecord {
            task_id: "task-c".into(),
            last_result: decision_result,
            retry_count: retries,
            blocked_at: Utc::now(),
        }
    }

    fn empty_snapshot() -> Snapshot {
        let fabric = Fabric::open_memory().unwrap();
        Snapshot::from_fabric(&fabric, Utc::now()).unwrap()
    }

    fn snapshot_with_claim(path: &str, owner: &str) -> Snapshot {
        let fabric = Fabric::open_memory().unwrap();
        fabric.claim(path, owner).unwrap();
        Snapshot::from_fabric(&fabric, Utc::now()).unwrap()
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    // -----------------------------------------------------------------------
    // NEED_INFO
    // -----------------------------------------------------------------------

    #[test]
    fn need_info_retries_below_cap() {
        let handler = PushbackHandler::default();
        let rec = record(PollResult::need_info("waiting", vec!["Store".into()]), 2);
        assert_eq!(
            handler.handle(&rec, &empty_snapshot(), &[]),
            PushbackAction::Retry
        );
    }

    #[test]
    fn need_info_escalates_at_cap() {
        let handler = PushbackHandler::default();
        let rec = record(PollResult::need_info("waiting", vec!["Store".into()]), 3);
        assert_eq!(
            handler.handle(&rec, &empty_snapshot(), &[]),
            PushbackAction::Escalate
        );
    }

    #[test]
    fn plausible_producer_doubles_cap() {
        let handler = PushbackHandler::default();
        let rec = record(
            PollResult::need_info("waiting", vec!["Store entanglements from task-b".into()]),
            4,
        );
        // task-b is in progress and named in the missing entry: cap is 6.
        assert_eq!(
            handler.handle(&rec, &empty_snapshot(), &ids(&["task-b"])),
            PushbackAction::Retry
        );
        let rec = record(
            PollResult::need_info("waiting", vec!["Store entanglements from task-b".into()]),
            6,
        );
        assert_eq!(
            handler.handle(&rec, &empty_snapshot(), &ids(&["task-b"])),
            PushbackAction::Escalate
        );
    }

    #[test]
    fn plausible_producer_match_is_case_insensitive() {
        let handler = PushbackHandler::default();
        let rec = record(
            PollResult::need_info("waiting", vec!["interfaces from TASK-B".into()]),
            4,
        );
        assert_eq!(
            handler.handle(&rec, &empty_snapshot(), &ids(&["task-b"])),
            PushbackAction::Retry
        );
    }

    #[test]
    fn short_ids_do_not_count_as_producers() {
        let handler = PushbackHandler::default();
        // "b" appears in "blocked" but is below the length threshold.
        let rec = record(PollResult::need_info("waiting", vec!["blocked on b".into()]), 4);
        assert_eq!(
            handler.handle(&rec, &empty_snapshot(), &ids(&["b"])),
            PushbackAction::Escalate
        );
    }

    #[test]
    fn unrelated_in_progress_keeps_base_cap() {
        let handler = PushbackHandler::default();
        let rec = record(PollResult::need_info("waiting", vec!["Store".into()]), 3);
        assert_eq!(
            handler.handle(&rec, &empty_snapshot(), &ids(&["task-z"])),
            PushbackAction::Escalate
        );
    }

    // -----------------------------------------------------------------------
    // CONFLICT
    // -----------------------------------------------------------------------

    #[test]
    fn claim_backed_conflict_retries() {
        let handler = PushbackHandler::default();
        let rec = record(PollResult::conflict("x.go claimed", "task-a"), 0);
        let snapshot = snapshot_with_claim("x.go", "task-a");
        assert_eq!(
            handler.handle(&rec, &snapshot, &[]),
            PushbackAction::Retry
        );
    }

    #[test]
    fn claim_backed_conflict_retries_regardless_of_count() {
        let handler = PushbackHandler::default();
        let rec = record(PollResult::conflict("x.go claimed", "task-a"), 99);
        let snapshot = snapshot_with_claim("x.go", "task-a");
        assert_eq!(
            handler.handle(&rec, &snapshot, &[]),
            PushbackAction::Retry
        );
    }

    #[test]
    fn interface_conflict_escalates_immediately() {
        let handler = PushbackHandler::default();
        // Zero retries, no claim held by the counterparty.
        let rec = record(PollResult::conflict("competing Store producers", "task-a"), 0);
        assert_eq!(
            handler.handle(&rec, &empty_snapshot(), &[]),
            PushbackAction::Escalate
        );
    }

    #[test]
    fn conflict_without_counterparty_escalates() {
        let handler = PushbackHandler::default();
        let rec = record(
            PollResult {
                decision: Decision::Conflict,
                reason: "unattributed conflict".into(),
                missing: vec![],
                conflict_with: None,
            },
            0,
        );
        assert_eq!(
            handler.handle(&rec, &empty_snapshot(), &[]),
            PushbackAction::Escalate
        );
    }

    // -----------------------------------------------------------------------
    // Escalation reporting
    // -----------------------------------------------------------------------

    #[test]
    fn escalation_message_carries_context() {
        let handler = PushbackHandler::default();
        let rec = record(
            PollResult::need_info("2 interfaces unpublished", vec!["interface Store".into()]),
            3,
        );
        let message = handler.escalation_message(&rec, 3);
        assert!(message.contains("task task-c"));
        assert!(message.contains("3 of 3 retries"));
        assert!(message.contains("NEED_INFO"));
        assert!(message.contains("2 interfaces unpublished"));
        assert!(message.contains("missing: interface Store"));
        assert!(message.contains("add the missing dependency"));
    }

    #[test]
    fn escalation_message_names_conflict_counterparty() {
        let handler = PushbackHandler::default();
        let rec = record(PollResult::conflict("Store dispute", "task-a"), 0);
        let message = handler.escalation_message(&rec, 3);
        assert!(message.contains("CONFLICT"));
        assert!(message.contains("resolve the conflict with task-a"));
    }

    #[test]
    fn discovery_kinds_follow_decision() {
        let handler = PushbackHandler::default();
        assert_eq!(
            handler.discovery_kind_for(Decision::NeedInfo),
            DiscoveryKind::MissingDependency
        );
        assert_eq!(
            handler.discovery_kind_for(Decision::Conflict),
            DiscoveryKind::EntanglementDispute
        );
    }
}
