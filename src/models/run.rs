//! Run history records kept in the structured store.

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::storage::Entity;

/// Partition holding one entity per collection run.
pub const RUN_PARTITION: &str = "run";

/// How a collection run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Completed,
    Failed,
}

/// Diagnostics for one collection run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Epoch milliseconds when the run started
    pub started: i64,

    /// Epoch milliseconds when the run ended
    pub finished: i64,

    /// Number of shows in the persisted feed
    pub shows: usize,

    /// Faults recorded during the run
    pub faults: Vec<String>,

    /// Sources left without any events
    #[serde(rename = "toDo")]
    pub to_do: Vec<String>,

    pub outcome: RunOutcome,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunRecord {
    /// Row key sorting lexicographically in start order.
    pub fn row_key(&self) -> String {
        format!("{:015}", self.started.max(0))
    }

    pub fn to_entity(&self) -> Result<Entity> {
        let properties = match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => map,
            _ => return Err(AppError::validation("run record is not an object")),
        };
        Ok(Entity {
            partition_key: RUN_PARTITION.to_string(),
            row_key: self.row_key(),
            properties,
        })
    }

    pub fn from_entity(entity: &Entity) -> Result<Self> {
        let value = serde_json::Value::Object(entity.properties.clone());
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_keys_sort_by_start() {
        let mut early = RunRecord {
            started: 9_000,
            finished: 9_500,
            shows: 1,
            faults: vec![],
            to_do: vec![],
            outcome: RunOutcome::Completed,
            error: None,
        };
        let late_key = RunRecord {
            started: 10_000,
            ..early.clone()
        }
        .row_key();
        assert!(early.row_key() < late_key);

        early.error = Some("disk full".to_string());
        let entity = early.to_entity().unwrap();
        assert_eq!(entity.partition_key, RUN_PARTITION);
        assert_eq!(RunRecord::from_entity(&entity).unwrap(), early);
    }
}
