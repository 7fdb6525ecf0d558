//! Identifier types shared across the workspace
//!
//! Plain newtypes over integers (or strings for shards) so that collection,
//! index and plan-node ids cannot be mixed up at call sites.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! numeric_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Raw numeric value
            pub fn get(self) -> u64 {
                self.0
            }

            /// Id `0` is never assigned
            pub fn is_set(self) -> bool {
                self.0 != 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(v: u64) -> Self {
                $name(v)
            }
        }
    };
}

numeric_id!(
    /// Collection (data source) id. For shards this is the local id; the
    /// logical collection id is carried separately as the plan id.
    DataSourceId
);
numeric_id!(
    /// Id of an index (a view link or an inverted index) on a collection
    IndexId
);
numeric_id!(
    /// Id of a search view
    ViewId
);
numeric_id!(
    /// Id of a node inside an execution plan
    PlanNodeId
);
numeric_id!(
    /// Id of a query variable
    VariableId
);
numeric_id!(
    /// Primary key of a document inside a collection
    LocalDocumentId
);

/// Segment-local document number
pub type DocId = u32;

/// Monotonic tick handed out by the transaction engine
pub type Tick = u64;

/// Shard identifier, e.g. `s10010`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(pub String);

impl ShardId {
    /// Create from anything string-like
    pub fn new(id: impl Into<String>) -> Self {
        ShardId(id.into())
    }

    /// Borrow the raw name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role of the process executing a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    /// Single node deployment, everything is local
    Single,
    /// Cluster coordinator, never touches index data
    Coordinator,
    /// Cluster data server, owns a subset of shards
    DbServer,
}

impl ServerRole {
    /// True for the cluster roles
    pub fn is_cluster(self) -> bool {
        !matches!(self, ServerRole::Single)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_id_display_and_set() {
        let id = DataSourceId(42);
        assert_eq!(id.to_string(), "42");
        assert!(id.is_set());
        assert!(!DataSourceId::default().is_set());
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let json = serde_json::to_string(&IndexId(7)).unwrap();
        assert_eq!(json, "7");
        let shard: ShardId = serde_json::from_str("\"s100\"").unwrap();
        assert_eq!(shard.as_str(), "s100");
    }

    #[test]
    fn test_server_role_cluster() {
        assert!(!ServerRole::Single.is_cluster());
        assert!(ServerRole::DbServer.is_cluster());
        assert!(ServerRole::Coordinator.is_cluster());
    }
}
