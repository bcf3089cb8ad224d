use serde::{Deserialize, Serialize};
use std::fmt;

/// Upstream batch identifier, valid in `[1, total_batches]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub u32);

impl BatchId {
    pub fn get(self) -> u32 {
        self.0
    }

    /// All identifiers in `[1, total]`, ascending.
    pub fn range(total: u32) -> impl Iterator<Item = BatchId> {
        (1..=total).map(BatchId)
    }
}

impl From<u32> for BatchId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-assigned document identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub i64);

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_is_one_based_and_inclusive() {
        let ids: Vec<u32> = BatchId::range(4).map(BatchId::get).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn range_of_zero_is_empty() {
        assert_eq!(BatchId::range(0).count(), 0);
    }

    #[test]
    fn batch_id_serializes_as_bare_integer() {
        let json = serde_json::to_string(&BatchId(42)).unwrap();
        assert_eq!(json, "42");
    }
}
