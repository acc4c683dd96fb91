// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Version histories.
//!
//! A branch's version history compresses its events into `(event_id,
//! version)` items: each item is the last event written with that version.
//! Comparing two histories finds their lowest common ancestor, which is how
//! replication decides between append, gap and conflict.

use serde::{Deserialize, Serialize};

use crate::error::{HistoryError, Result};

/// Last event id written with `version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VersionHistoryItem {
    /// Event id.
    pub event_id: i64,
    /// Failover version.
    pub version: i64,
}

impl VersionHistoryItem {
    /// Build an item.
    pub fn new(event_id: i64, version: i64) -> Self {
        Self { event_id, version }
    }
}

/// Items of one history branch.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VersionHistory {
    /// Branch storing the events.
    pub branch_token: String,
    /// Items, strictly increasing in both fields.
    pub items: Vec<VersionHistoryItem>,
}

impl VersionHistory {
    /// Branch with the given items.
    pub fn new(branch_token: impl Into<String>, items: Vec<VersionHistoryItem>) -> Self {
        Self {
            branch_token: branch_token.into(),
            items,
        }
    }

    /// Record that `event_id` was written with `version`.
    pub fn add_or_update(&mut self, event_id: i64, version: i64) -> Result<()> {
        match self.items.last_mut() {
            None => {
                self.items.push(VersionHistoryItem::new(event_id, version));
                Ok(())
            }
            Some(last) if event_id <= last.event_id => Err(HistoryError::invalid_state(format!(
                "event {} does not advance version history past {}",
                event_id, last.event_id
            ))),
            Some(last) if version == last.version => {
                last.event_id = event_id;
                Ok(())
            }
            Some(last) if version > last.version => {
                self.items.push(VersionHistoryItem::new(event_id, version));
                Ok(())
            }
            Some(last) => Err(HistoryError::invalid_state(format!(
                "version {} is lower than last version {}",
                version, last.version
            ))),
        }
    }

    /// Last item.
    pub fn last_item(&self) -> Option<VersionHistoryItem> {
        self.items.last().copied()
    }

    /// Whether the branch contains event `item.event_id` written with
    /// `item.version`.
    pub fn contains(&self, item: VersionHistoryItem) -> bool {
        let mut prev_event_id = 0;
        for current in &self.items {
            if current.version == item.version
                && item.event_id > prev_event_id
                && item.event_id <= current.event_id
            {
                return true;
            }
            prev_event_id = current.event_id;
        }
        false
    }

    /// Version `event_id` was written with.
    pub fn version_at(&self, event_id: i64) -> Option<i64> {
        if event_id <= 0 {
            return None;
        }
        self.items
            .iter()
            .find(|item| event_id <= item.event_id)
            .map(|item| item.version)
    }

    /// Lowest common ancestor with `other`.
    pub fn lca(&self, other: &VersionHistory) -> Option<VersionHistoryItem> {
        lca_items(&self.items, &other.items)
    }

    /// Items of this branch truncated at `item`.
    pub fn truncated_at(&self, item: VersionHistoryItem) -> Result<Vec<VersionHistoryItem>> {
        let mut items = Vec::new();
        for current in &self.items {
            if item.version == current.version {
                if item.event_id > current.event_id {
                    break;
                }
                items.push(item);
                return Ok(items);
            }
            if current.version > item.version {
                break;
            }
            items.push(*current);
        }
        Err(HistoryError::invalid_state(format!(
            "version history does not contain ({}, {})",
            item.event_id, item.version
        )))
    }
}

/// Lowest common ancestor of two item lists.
pub fn lca_items(a: &[VersionHistoryItem], b: &[VersionHistoryItem]) -> Option<VersionHistoryItem> {
    let mut i = a.len();
    let mut j = b.len();
    while i > 0 && j > 0 {
        let left = a[i - 1];
        let right = b[j - 1];
        if left.version == right.version {
            return Some(VersionHistoryItem::new(
                left.event_id.min(right.event_id),
                left.version,
            ));
        } else if left.version > right.version {
            i -= 1;
        } else {
            j -= 1;
        }
    }
    None
}

/// All branches of a run with one marked current.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VersionHistories {
    /// Index of the current branch.
    pub current_index: usize,
    /// Branches.
    pub histories: Vec<VersionHistory>,
}

impl VersionHistories {
    /// Histories with a single current branch.
    pub fn new(history: VersionHistory) -> Self {
        Self {
            current_index: 0,
            histories: vec![history],
        }
    }

    /// The current branch.
    pub fn current(&self) -> Result<&VersionHistory> {
        self.histories
            .get(self.current_index)
            .ok_or_else(|| HistoryError::invalid_state("version histories have no current branch"))
    }

    /// The current branch, mutably.
    pub fn current_mut(&mut self) -> Result<&mut VersionHistory> {
        self.histories
            .get_mut(self.current_index)
            .ok_or_else(|| HistoryError::invalid_state("version histories have no current branch"))
    }

    /// Add a branch and return its index.
    pub fn add(&mut self, history: VersionHistory) -> usize {
        self.histories.push(history);
        self.histories.len() - 1
    }

    /// Make branch `index` current.
    pub fn set_current(&mut self, index: usize) -> Result<()> {
        if index >= self.histories.len() {
            return Err(HistoryError::invalid_state(format!(
                "version history index {} out of range",
                index
            )));
        }
        self.current_index = index;
        Ok(())
    }

    /// Branch index sharing the deepest common ancestor with `incoming`,
    /// together with that ancestor.
    pub fn find_lca(&self, incoming: &[VersionHistoryItem]) -> Option<(usize, VersionHistoryItem)> {
        let mut best: Option<(usize, VersionHistoryItem)> = None;
        for (index, history) in self.histories.iter().enumerate() {
            if let Some(item) = lca_items(&history.items, incoming) {
                let better = match best {
                    Some((_, current)) => item.event_id > current.event_id,
                    None => true,
                };
                if better {
                    best = Some((index, item));
                }
            }
        }
        best
    }

    /// Index of a branch containing `item`.
    pub fn find_containing(&self, item: VersionHistoryItem) -> Option<usize> {
        self.histories.iter().position(|h| h.contains(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(items: &[(i64, i64)]) -> VersionHistory {
        VersionHistory::new(
            "branch",
            items
                .iter()
                .map(|(e, v)| VersionHistoryItem::new(*e, *v))
                .collect(),
        )
    }

    #[test]
    fn test_add_or_update() {
        let mut h = VersionHistory::new("b", Vec::new());
        h.add_or_update(1, 1).unwrap();
        h.add_or_update(2, 1).unwrap();
        h.add_or_update(3, 11).unwrap();
        assert_eq!(
            h.items,
            vec![VersionHistoryItem::new(2, 1), VersionHistoryItem::new(3, 11)]
        );

        assert!(h.add_or_update(3, 11).is_err());
        assert!(h.add_or_update(4, 1).is_err());
    }

    #[test]
    fn test_contains_and_version_at() {
        let h = history(&[(3, 1), (7, 11)]);
        assert!(h.contains(VersionHistoryItem::new(2, 1)));
        assert!(h.contains(VersionHistoryItem::new(7, 11)));
        assert!(!h.contains(VersionHistoryItem::new(4, 1)));
        assert!(!h.contains(VersionHistoryItem::new(8, 11)));

        assert_eq!(h.version_at(3), Some(1));
        assert_eq!(h.version_at(4), Some(11));
        assert_eq!(h.version_at(8), None);
        assert_eq!(h.version_at(0), None);
    }

    #[test]
    fn test_lca() {
        let local = history(&[(3, 1), (7, 11)]);
        let remote = history(&[(3, 1), (5, 2)]);
        assert_eq!(local.lca(&remote), Some(VersionHistoryItem::new(3, 1)));

        let ahead = history(&[(3, 1), (9, 11)]);
        assert_eq!(local.lca(&ahead), Some(VersionHistoryItem::new(7, 11)));

        let unrelated = history(&[(4, 2)]);
        assert_eq!(local.lca(&unrelated), None);
    }

    #[test]
    fn test_truncated_at() {
        let h = history(&[(3, 1), (7, 11)]);
        assert_eq!(
            h.truncated_at(VersionHistoryItem::new(5, 11)).unwrap(),
            vec![VersionHistoryItem::new(3, 1), VersionHistoryItem::new(5, 11)]
        );
        assert_eq!(
            h.truncated_at(VersionHistoryItem::new(2, 1)).unwrap(),
            vec![VersionHistoryItem::new(2, 1)]
        );
        assert!(h.truncated_at(VersionHistoryItem::new(9, 11)).is_err());
    }

    #[test]
    fn test_find_lca_prefers_deepest_branch() {
        let mut histories = VersionHistories::new(history(&[(3, 1)]));
        histories.add(VersionHistory::new("other", vec![VersionHistoryItem::new(6, 1)]));

        let incoming = vec![VersionHistoryItem::new(5, 1), VersionHistoryItem::new(8, 21)];
        let (index, item) = histories.find_lca(&incoming).unwrap();
        assert_eq!(index, 1);
        assert_eq!(item, VersionHistoryItem::new(5, 1));
        assert_eq!(histories.find_containing(VersionHistoryItem::new(6, 1)), Some(1));
    }
}
