//! Checklist State and Reconciliation
//!
//! A checklist is the set of protocol items the operator must cover during a
//! session. The backend owns completion; the client only compares snapshots
//! to find items that have just been completed.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Completion flags keyed by item id.
pub type CompletionMap = BTreeMap<String, bool>;

/// The completion state of a single checklist item.
///
/// Display metadata (label, description, tips) is not carried here; it is
/// resolved from the active `ProtocolTemplate` by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChecklistItemState {
    pub id: String,
    pub completed: bool,
}

impl ChecklistItemState {
    pub fn new(id: impl Into<String>, completed: bool) -> Self {
        Self {
            id: id.into(),
            completed,
        }
    }
}

/// A point-in-time view of every checklist item reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecklistSnapshot {
    items: BTreeMap<String, ChecklistItemState>,
}

impl ChecklistSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a snapshot from `(id, completed)` pairs.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, bool)>,
        S: Into<String>,
    {
        let mut snapshot = Self::new();
        for (id, completed) in pairs {
            snapshot.set(id, completed);
        }
        snapshot
    }

    pub fn set(&mut self, id: impl Into<String>, completed: bool) {
        let id = id.into();
        self.items
            .insert(id.clone(), ChecklistItemState::new(id, completed));
    }

    pub fn get(&self, id: &str) -> Option<&ChecklistItemState> {
        self.items.get(id)
    }

    pub fn is_completed(&self, id: &str) -> bool {
        self.items.get(id).is_some_and(|item| item.completed)
    }

    pub fn items(&self) -> impl Iterator<Item = &ChecklistItemState> {
        self.items.values()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn completed_count(&self) -> usize {
        self.items.values().filter(|item| item.completed).count()
    }

    /// Flattens the snapshot into the shape the reconciler works on.
    pub fn completion(&self) -> CompletionMap {
        self.items
            .values()
            .map(|item| (item.id.clone(), item.completed))
            .collect()
    }

    /// Combines `self` with a newer snapshot of the same session.
    ///
    /// Completion is sticky: an item completed here stays completed, and
    /// items missing from `newer` are kept as they are.
    pub fn merged_with(&self, newer: &ChecklistSnapshot) -> ChecklistSnapshot {
        let mut merged = self.clone();
        for item in newer.items() {
            let completed = item.completed || self.is_completed(&item.id);
            merged.set(item.id.clone(), completed);
        }
        merged
    }
}

/// Returns the ids that transitioned to completed between two snapshots.
///
/// An id is reported when `previous` had it false or absent and `current`
/// has it true. Ids absent from `current` are ignored; there is no
/// "uncompleted" transition. The result is sorted by id.
pub fn diff(previous: Option<&CompletionMap>, current: &CompletionMap) -> Vec<String> {
    current
        .iter()
        .filter(|(_, completed)| **completed)
        .filter(|(id, _)| {
            !previous
                .and_then(|prev| prev.get(id.as_str()))
                .copied()
                .unwrap_or(false)
        })
        .map(|(id, _)| id.clone())
        .collect()
}

/// Checks whether every item of a non-empty checklist is completed.
pub fn is_complete(checklist: &ChecklistSnapshot) -> bool {
    !checklist.is_empty() && checklist.items().all(|item| item.completed)
}

// The backend has shipped both `{"id": {"completed": true}}` and
// `{"id": true}`; either is accepted.
#[derive(Deserialize, Serialize)]
#[serde(untagged)]
enum WireItem {
    Flag(bool),
    Item {
        #[serde(default)]
        completed: bool,
    },
}

impl<'de> Deserialize<'de> for ChecklistSnapshot {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<BTreeMap<String, WireItem>> = Option::deserialize(deserializer)?;
        Ok(ChecklistSnapshot::from_pairs(raw.unwrap_or_default().into_iter().map(
            |(id, item)| {
                let completed = match item {
                    WireItem::Flag(completed) | WireItem::Item { completed } => completed,
                };
                (id, completed)
            },
        )))
    }
}

impl Serialize for ChecklistSnapshot {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let wire: BTreeMap<&str, WireItem> = self
            .items
            .values()
            .map(|item| {
                (
                    item.id.as_str(),
                    WireItem::Item {
                        completed: item.completed,
                    },
                )
            })
            .collect();
        wire.serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, bool)]) -> CompletionMap {
        pairs.iter().map(|(id, c)| (id.to_string(), *c)).collect()
    }

    #[test]
    fn test_diff_reports_newly_completed_items() {
        let previous = map(&[("rapport", false), ("validacion", false)]);
        let current = map(&[("rapport", true), ("validacion", false)]);

        assert_eq!(diff(Some(&previous), &current), vec!["rapport"]);
    }

    #[test]
    fn test_diff_against_nothing_reports_every_completed_item() {
        let current = map(&[("validacion", true), ("rapport", true), ("objetivo", false)]);

        assert_eq!(diff(None, &current), vec!["rapport", "validacion"]);
    }

    #[test]
    fn test_diff_of_identical_maps_is_empty() {
        let samples = [
            map(&[]),
            map(&[("rapport", true)]),
            map(&[("rapport", false), ("validacion", true)]),
        ];
        for sample in &samples {
            assert!(diff(Some(sample), sample).is_empty());
        }
    }

    #[test]
    fn test_diff_is_idempotent_once_previous_catches_up() {
        let mut previous = map(&[("rapport", false)]);
        let current = map(&[("rapport", true)]);

        assert_eq!(diff(Some(&previous), &current).len(), 1);
        previous = current.clone();
        assert!(diff(Some(&previous), &current).is_empty());
    }

    #[test]
    fn test_diff_never_reports_regressions() {
        let previous = map(&[("rapport", true), ("validacion", true)]);
        let current = map(&[("rapport", false)]);

        assert!(diff(Some(&previous), &current).is_empty());
    }

    #[test]
    fn test_merged_with_keeps_completion_sticky() {
        let stored = ChecklistSnapshot::from_pairs([("rapport", true), ("validacion", false)]);
        let incoming = ChecklistSnapshot::from_pairs([("rapport", false), ("validacion", true)]);

        let merged = stored.merged_with(&incoming);
        assert!(merged.is_completed("rapport"));
        assert!(merged.is_completed("validacion"));
    }

    #[test]
    fn test_merged_with_carries_over_missing_items() {
        let stored = ChecklistSnapshot::from_pairs([("rapport", false), ("validacion", false)]);
        let incoming = ChecklistSnapshot::from_pairs([("rapport", true)]);

        let merged = stored.merged_with(&incoming);
        assert_eq!(merged.len(), 2);
        assert!(merged.get("validacion").is_some());
    }

    #[test]
    fn test_is_complete() {
        assert!(!is_complete(&ChecklistSnapshot::new()));
        assert!(!is_complete(&ChecklistSnapshot::from_pairs([
            ("rapport", true),
            ("validacion", false)
        ])));
        assert!(is_complete(&ChecklistSnapshot::from_pairs([
            ("rapport", true),
            ("validacion", true)
        ])));
    }

    #[test]
    fn test_deserialize_accepts_both_wire_shapes() {
        let json = r#"{"rapport": {"completed": true}, "validacion": false, "pregunta_refleja": {}}"#;
        let snapshot: ChecklistSnapshot = serde_json::from_str(json).unwrap();

        assert!(snapshot.is_completed("rapport"));
        assert!(!snapshot.is_completed("validacion"));
        assert!(!snapshot.is_completed("pregunta_refleja"));
        assert_eq!(snapshot.len(), 3);
    }

    #[test]
    fn test_deserialize_null_is_empty() {
        let snapshot: ChecklistSnapshot = serde_json::from_str("null").unwrap();
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_serialize_uses_object_items() {
        let snapshot = ChecklistSnapshot::from_pairs([("rapport", true)]);
        let json = serde_json::to_string(&snapshot).unwrap();
        assert_eq!(json, r#"{"rapport":{"completed":true}}"#);
    }
}
