//! Aggregate statistics derived from the queue contents.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::operation::{FailedOperation, OperationType, Priority};

/// Per-priority counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityCounts {
    pub critical: usize,
    pub normal: usize,
    pub low: usize,
}

impl PriorityCounts {
    pub fn add(&mut self, priority: Priority) {
        match priority {
            Priority::Critical => self.critical += 1,
            Priority::Normal => self.normal += 1,
            Priority::Low => self.low += 1,
        }
    }

    pub fn get(&self, priority: Priority) -> usize {
        match priority {
            Priority::Critical => self.critical,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
        }
    }

    pub fn total(&self) -> usize {
        self.critical + self.normal + self.low
    }
}

/// Retry statistics. Never stored; recomputed from the queue on demand.
///
/// `total_failed == by_priority.total() == sum(by_type) == sum(by_entity)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStats {
    pub total_failed: usize,
    pub total_retryable: usize,
    pub total_exhausted: usize,
    pub by_type: BTreeMap<OperationType, usize>,
    pub by_entity: BTreeMap<String, usize>,
    pub by_priority: PriorityCounts,
}

impl RetryStats {
    pub fn from_operations<'a>(ops: impl IntoIterator<Item = &'a FailedOperation>) -> Self {
        let mut stats = RetryStats::default();
        for op in ops {
            stats.total_failed += 1;
            if op.is_retryable() {
                stats.total_retryable += 1;
            }
            if op.is_exhausted() {
                stats.total_exhausted += 1;
            }
            *stats.by_type.entry(op.op_type).or_default() += 1;
            *stats.by_entity.entry(op.entity.clone()).or_default() += 1;
            stats.by_priority.add(op.priority);
        }
        stats
    }

    pub fn is_empty(&self) -> bool {
        self.total_failed == 0
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::error::ReplayError;
    use crate::operation::OperationKey;

    fn op(op_type: OperationType, entity: &str, priority: Priority, error: ReplayError) -> FailedOperation {
        FailedOperation::new(op_type, entity, OperationKey::new(entity), &error, priority, 3, Utc::now())
    }

    #[test]
    fn counts_are_consistent() {
        let ops = vec![
            op(OperationType::Mutation, "job", Priority::Critical, ReplayError::transient("503")),
            op(OperationType::Mutation, "job", Priority::Low, ReplayError::permanent("422")),
            op(OperationType::Query, "inventory", Priority::Normal, ReplayError::connectivity("offline")),
        ];

        let stats = RetryStats::from_operations(&ops);

        assert_eq!(stats.total_failed, 3);
        assert_eq!(stats.total_retryable, 2);
        assert_eq!(stats.total_exhausted, 0);
        assert_eq!(stats.by_priority.total(), 3);
        assert_eq!(stats.by_type.values().sum::<usize>(), 3);
        assert_eq!(stats.by_type[&OperationType::Mutation], 2);
        assert_eq!(stats.by_entity["job"], 2);
        assert_eq!(stats.by_entity["inventory"], 1);
    }

    #[test]
    fn empty_queue_has_empty_stats() {
        let stats = RetryStats::from_operations(std::iter::empty());
        assert!(stats.is_empty());
        assert_eq!(stats, RetryStats::default());
    }
}
