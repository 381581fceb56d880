//! Node name grammar.
//!
//! Managed nodes are named `<cluster-prefix>-<group-name>-<index>`. The
//! trailing decimal is the node index, unique inside its group, and the name
//! is the only link between the infra state, the Kubernetes `Node` and the
//! per-node state secret.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static NODE_INDEX_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-(\d+)$").expect("node index regex is valid"));

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeNameError {
    #[error("Node name '{}' doesn't end with a numeric index!", .0)]
    MissingIndex(String),
    #[error("Nodes '{}' and '{}' share the same index!", .0, .1)]
    DuplicateIndex(String, String),
}

pub fn node_name(cluster_prefix: &str, group_name: &str, index: u32) -> String {
    format!("{cluster_prefix}-{group_name}-{index}")
}

pub fn node_index(name: &str) -> Result<u32, NodeNameError> {
    NODE_INDEX_REGEX
        .captures(name)
        .and_then(|captures| captures.get(1))
        .and_then(|index| index.as_str().parse().ok())
        .ok_or_else(|| NodeNameError::MissingIndex(name.to_owned()))
}

/// Sorts node names by their numeric index, highest first.
///
/// Names without an index are placed last, in lexicographic order.
pub fn sort_by_index_descending<S: AsRef<str>>(names: &mut [S]) {
    names.sort_by(|left, right| {
        let left = left.as_ref();
        let right = right.as_ref();

        match (node_index(left).ok(), node_index(right).ok()) {
            (Some(l), Some(r)) => r.cmp(&l),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => left.cmp(right),
        }
    });
}

/// Makes sure every name carries an index and that indices don't repeat.
pub fn validate_unique_indices<'a>(
    names: impl IntoIterator<Item = &'a str>,
) -> Result<(), NodeNameError> {
    let mut seen = std::collections::BTreeMap::new();

    for name in names {
        let index = node_index(name)?;

        if let Some(previous) = seen.insert(index, name) {
            return Err(NodeNameError::DuplicateIndex(
                previous.to_owned(),
                name.to_owned(),
            ));
        }
    }

    Ok(())
}

/// Lowest `count` indices not present in `existing`.
pub fn missing_indices(existing: &BTreeSet<u32>, count: usize) -> Vec<u32> {
    (0u32..)
        .filter(|index| !existing.contains(index))
        .take(count)
        .collect()
}
