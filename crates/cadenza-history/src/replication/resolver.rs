// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Branch resolution for replicated event batches.
//!
//! An incoming batch carries the version history of the branch it was
//! written to on the source. Comparing it with the local branches decides
//! whether the batch is a duplicate, extends a branch, leaves a gap or
//! diverges from every local branch and needs a fork.

use std::cmp::Ordering;

use crate::error::{HistoryError, Result};
use crate::state::{VersionHistories, VersionHistoryItem};

/// Where an incoming batch lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchResolution {
    /// A local branch already contains the batch's last event.
    Duplicate,
    /// Local branch `branch_index` is a prefix of the incoming branch;
    /// events past its last item extend it.
    Append {
        /// Local branch to extend.
        branch_index: usize,
    },
    /// Events between `last` and the batch's first event are missing.
    Gap {
        /// Local branch the missing range hangs off.
        branch_index: usize,
        /// Last event the local side has in common with the incoming branch.
        last: VersionHistoryItem,
    },
    /// The incoming branch diverges from `branch_index` after `lca`.
    Fork {
        /// Local branch to fork.
        branch_index: usize,
        /// Last common event.
        lca: VersionHistoryItem,
    },
}

/// Decide where a batch starting at `first_event_id` and described by
/// `incoming` lands among `local`'s branches.
pub fn resolve_branch(
    local: &VersionHistories,
    incoming: &[VersionHistoryItem],
    first_event_id: i64,
) -> Result<BranchResolution> {
    let last = incoming.last().copied().ok_or_else(|| {
        HistoryError::bad_request("version_history_items", "must not be empty")
    })?;

    if local.find_containing(last).is_some() {
        return Ok(BranchResolution::Duplicate);
    }

    let (branch_index, lca) = local.find_lca(incoming).ok_or_else(|| HistoryError::ReplicationConflict {
        details: format!(
            "incoming history ending at ({}, {}) shares no events with any local branch",
            last.event_id, last.version
        ),
    })?;
    let branch_last = local.histories[branch_index]
        .last_item()
        .ok_or_else(|| HistoryError::invalid_state("local branch has no events"))?;

    let common = if lca == branch_last { branch_last } else { lca };
    if first_event_id > common.event_id + 1 {
        return Ok(BranchResolution::Gap {
            branch_index,
            last: common,
        });
    }
    if lca == branch_last {
        Ok(BranchResolution::Append { branch_index })
    } else {
        Ok(BranchResolution::Fork { branch_index, lca })
    }
}

/// Whether a branch ending at `incoming_last`, written by `source_cluster`,
/// replaces the local current branch ending at `local_last`.
///
/// Higher version wins. Equal versions fall back to the longer branch, then
/// to the lexicographically smaller cluster name, so every cluster reaches
/// the same verdict.
pub fn incoming_wins(
    local_last: VersionHistoryItem,
    incoming_last: VersionHistoryItem,
    source_cluster: &str,
    current_cluster: &str,
) -> bool {
    match incoming_last.version.cmp(&local_last.version) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => match incoming_last.event_id.cmp(&local_last.event_id) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => source_cluster < current_cluster,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::VersionHistory;

    fn items(pairs: &[(i64, i64)]) -> Vec<VersionHistoryItem> {
        pairs
            .iter()
            .map(|(e, v)| VersionHistoryItem::new(*e, *v))
            .collect()
    }

    fn local(pairs: &[(i64, i64)]) -> VersionHistories {
        VersionHistories::new(VersionHistory::new("branch-1", items(pairs)))
    }

    #[test]
    fn test_duplicate() {
        let histories = local(&[(5, 1)]);
        assert_eq!(
            resolve_branch(&histories, &items(&[(4, 1)]), 3).unwrap(),
            BranchResolution::Duplicate
        );
    }

    #[test]
    fn test_append_and_gap() {
        let histories = local(&[(5, 1)]);
        assert_eq!(
            resolve_branch(&histories, &items(&[(7, 1)]), 6).unwrap(),
            BranchResolution::Append { branch_index: 0 }
        );
        assert_eq!(
            resolve_branch(&histories, &items(&[(5, 1), (9, 11)]), 8).unwrap(),
            BranchResolution::Gap {
                branch_index: 0,
                last: VersionHistoryItem::new(5, 1)
            }
        );
    }

    #[test]
    fn test_fork_after_divergence() {
        let histories = local(&[(3, 1), (6, 2)]);
        assert_eq!(
            resolve_branch(&histories, &items(&[(3, 1), (5, 11)]), 4).unwrap(),
            BranchResolution::Fork {
                branch_index: 0,
                lca: VersionHistoryItem::new(3, 1)
            }
        );
        // Diverging batch that does not start right after the fork point.
        assert!(matches!(
            resolve_branch(&histories, &items(&[(3, 1), (8, 11)]), 6).unwrap(),
            BranchResolution::Gap { .. }
        ));
    }

    #[test]
    fn test_unrelated_history_conflicts() {
        let histories = local(&[(3, 1)]);
        let err = resolve_branch(&histories, &items(&[(3, 2)]), 1).unwrap_err();
        assert_eq!(err.error_code(), "REPLICATION_CONFLICT");
    }

    #[test]
    fn test_tie_break() {
        let local = VersionHistoryItem::new(10, 11);
        assert!(incoming_wins(local, VersionHistoryItem::new(4, 21), "b", "a"));
        assert!(!incoming_wins(local, VersionHistoryItem::new(40, 1), "a", "b"));
        assert!(incoming_wins(local, VersionHistoryItem::new(11, 11), "b", "a"));
        assert!(!incoming_wins(local, VersionHistoryItem::new(9, 11), "a", "b"));
        assert!(incoming_wins(local, VersionHistoryItem::new(10, 11), "a", "b"));
        assert!(!incoming_wins(local, VersionHistoryItem::new(10, 11), "b", "a"));
    }
}
