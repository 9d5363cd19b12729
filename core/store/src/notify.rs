//! Change notifications emitted after every committed record mutation.

use serde::{Deserialize, Serialize};

use shopsync_common::{Entity, Payload};

/// A record mutation, local or sync-applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataChange {
    pub entity: Entity,
    pub id: String,
    /// New payload, or the last known payload for deletions.
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

/// Consumer of change notifications. At most one is registered at a time.
pub trait ChangeNotifier: Send + Sync {
    fn notify(&self, change: &DataChange);
}

impl<F> ChangeNotifier for F
where
    F: Fn(&DataChange) + Send + Sync,
{
    fn notify(&self, change: &DataChange) {
        self(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deleted_flag_omitted_when_false() {
        let change = DataChange {
            entity: Entity::Orders,
            id: "o1".to_string(),
            payload: Payload::new(),
            deleted: false,
        };
        let json = serde_json::to_value(&change).unwrap();
        assert!(json.get("deleted").is_none());

        let deleted = DataChange {
            deleted: true,
            ..change
        };
        let json = serde_json::to_value(&deleted).unwrap();
        assert_eq!(json["deleted"], true);
    }
}
