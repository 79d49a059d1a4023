//! Change detection between two status snapshots

use crate::status::StatusMap;
use std::collections::HashMap;

/// A lift whose status differs from the previous poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEntry {
    pub name: String,
    pub status: String,
}

/// Lifts present in both snapshots whose status changed, in `current` order.
/// Lifts that appear or disappear between polls are not changes.
pub fn diff(current: &StatusMap, previous: &StatusMap) -> Vec<ChangeEntry> {
    let previous: HashMap<&str, &str> = previous.iter().collect();

    current
        .iter()
        .filter(|(name, status)| previous.get(name).is_some_and(|before| before != status))
        .map(|(name, status)| ChangeEntry {
            name: name.to_string(),
            status: status.to_string(),
        })
        .collect()
}

/// One sentence per change, space separated; `None` when nothing changed
pub fn compose_message(changes: &[ChangeEntry]) -> Option<String> {
    if changes.is_empty() {
        return None;
    }

    let sentences: Vec<String> = changes
        .iter()
        .map(|c| format!("Lift status update: {} is now {}.", c.name, c.status))
        .collect();
    Some(sentences.join(" "))
}
