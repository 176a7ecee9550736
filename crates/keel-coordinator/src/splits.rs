use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::CoordinationResult;

/// One partition of a data source, handed out to exactly one subtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSplit {
    pub split_number: usize,
    /// Hosts on which the split data is local, if known.
    pub hosts: Vec<String>,
    /// Opaque source-specific payload.
    pub payload: serde_json::Value,
}

impl InputSplit {
    pub fn new(split_number: usize, payload: serde_json::Value) -> Self {
        Self {
            split_number,
            hosts: vec![],
            payload,
        }
    }

    pub fn with_hosts(mut self, hosts: Vec<String>) -> Self {
        self.hosts = hosts;
        self
    }
}

/// A per-vertex factory for input splits and their assigner.
pub trait InputSplitSource: Send + Sync {
    fn create_splits(&self, min_splits: usize) -> CoordinationResult<Vec<InputSplit>>;
    fn create_assigner(&self, splits: Vec<InputSplit>) -> Box<dyn InputSplitAssigner>;
}

/// Hands out splits to subtasks, optionally using host locality.
/// Each split is handed out at most once.
pub trait InputSplitAssigner: Send {
    fn next_split(&mut self, host: Option<&str>, subtask_index: usize) -> Option<InputSplit>;
    fn remaining(&self) -> usize;
}

/// FIFO assigner that ignores locality.
pub struct DefaultSplitAssigner {
    splits: VecDeque<InputSplit>,
}

impl DefaultSplitAssigner {
    pub fn new(splits: Vec<InputSplit>) -> Self {
        Self {
            splits: splits.into(),
        }
    }
}

impl InputSplitAssigner for DefaultSplitAssigner {
    fn next_split(&mut self, _host: Option<&str>, _subtask_index: usize) -> Option<InputSplit> {
        self.splits.pop_front()
    }

    fn remaining(&self) -> usize {
        self.splits.len()
    }
}

/// Assigner that prefers splits local to the requesting host and falls back
/// to an arbitrary remaining split.
pub struct LocatableSplitAssigner {
    splits: Vec<Option<InputSplit>>,
    by_host: HashMap<String, VecDeque<usize>>,
    unassigned: usize,
}

impl LocatableSplitAssigner {
    pub fn new(splits: Vec<InputSplit>) -> Self {
        let mut by_host: HashMap<String, VecDeque<usize>> = HashMap::new();
        for (index, split) in splits.iter().enumerate() {
            for host in &split.hosts {
                by_host
                    .entry(host.to_lowercase())
                    .or_default()
                    .push_back(index);
            }
        }
        let unassigned = splits.len();
        Self {
            splits: splits.into_iter().map(Some).collect(),
            by_host,
            unassigned,
        }
    }

    fn take(&mut self, index: usize) -> Option<InputSplit> {
        let split = self.splits.get_mut(index).and_then(Option::take);
        if split.is_some() {
            self.unassigned -= 1;
        }
        split
    }
}

impl InputSplitAssigner for LocatableSplitAssigner {
    fn next_split(&mut self, host: Option<&str>, _subtask_index: usize) -> Option<InputSplit> {
        if let Some(host) = host {
            let key = host.to_lowercase();
            while let Some(index) = self.by_host.get_mut(&key).and_then(VecDeque::pop_front) {
                if let Some(split) = self.take(index) {
                    return Some(split);
                }
            }
        }
        // No local split; hand out any remaining one.
        let index = self.splits.iter().position(Option::is_some)?;
        self.take(index)
    }

    fn remaining(&self) -> usize {
        self.unassigned
    }
}

/// A split source over a fixed list of splits, used by sources whose splits
/// are known at graph construction time (and by tests).
pub struct VectorSplitSource {
    splits: Vec<InputSplit>,
    locatable: bool,
}

impl VectorSplitSource {
    pub fn new(splits: Vec<InputSplit>) -> Self {
        Self {
            splits,
            locatable: false,
        }
    }

    pub fn locatable(splits: Vec<InputSplit>) -> Self {
        Self {
            splits,
            locatable: true,
        }
    }
}

impl InputSplitSource for VectorSplitSource {
    fn create_splits(&self, _min_splits: usize) -> CoordinationResult<Vec<InputSplit>> {
        Ok(self.splits.clone())
    }

    fn create_assigner(&self, splits: Vec<InputSplit>) -> Box<dyn InputSplitAssigner> {
        if self.locatable {
            Box::new(LocatableSplitAssigner::new(splits))
        } else {
            Box::new(DefaultSplitAssigner::new(splits))
        }
    }
}

/// Serializes a split for the wire reply. [None] encodes "no more splits"
/// and is a successful reply, not an error.
pub fn serialize_split(split: Option<&InputSplit>) -> CoordinationResult<Option<Vec<u8>>> {
    split.map(|s| Ok(serde_json::to_vec(s)?)).transpose()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn split(n: usize, hosts: &[&str]) -> InputSplit {
        InputSplit::new(n, json!({ "offset": n }))
            .with_hosts(hosts.iter().map(|h| h.to_string()).collect())
    }

    #[test]
    fn test_default_assigner_is_fifo() {
        let mut assigner = DefaultSplitAssigner::new(vec![split(0, &[]), split(1, &[])]);
        assert_eq!(assigner.next_split(None, 0).unwrap().split_number, 0);
        assert_eq!(assigner.next_split(Some("other"), 1).unwrap().split_number, 1);
        assert!(assigner.next_split(None, 0).is_none());
    }

    #[test]
    fn test_locatable_assigner_prefers_local_splits() {
        let mut assigner = LocatableSplitAssigner::new(vec![
            split(0, &["alpha"]),
            split(1, &["beta"]),
            split(2, &["alpha"]),
        ]);
        assert_eq!(assigner.next_split(Some("BETA"), 0).unwrap().split_number, 1);
        assert_eq!(assigner.next_split(Some("alpha"), 0).unwrap().split_number, 0);
        // The local queue for "beta" is exhausted; any remaining split works.
        assert_eq!(assigner.next_split(Some("beta"), 0).unwrap().split_number, 2);
        assert_eq!(assigner.remaining(), 0);
        assert!(assigner.next_split(Some("alpha"), 0).is_none());
    }

    #[test]
    fn test_split_serialization_round_trip() {
        let original = split(3, &["gamma"]);
        let bytes = serialize_split(Some(&original)).unwrap().unwrap();
        let decoded: InputSplit = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, original);
        assert!(serialize_split(None).unwrap().is_none());
    }
}
