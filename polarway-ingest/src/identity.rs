//! Collection identity: the partition key for staged and extracted data

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Stable key for "this plugin, this connection, this parameter set, this sub-resource".
///
/// Two identities with the same plugin, connection, table and parameters map to the
/// same raw-staging partition, regardless of the order in which parameters were added.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionIdentity {
    /// Plugin name (e.g. "github_graphql")
    pub plugin: String,
    /// Connection the data was pulled through
    pub connection_id: u64,
    /// Logical raw table (e.g. "github_graphql_prs")
    pub table: String,
    /// Scope parameters (workspace id, repository name, ...)
    pub params: BTreeMap<String, Value>,
}

impl CollectionIdentity {
    pub fn new(plugin: impl Into<String>, connection_id: u64, table: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            connection_id,
            table: table.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Canonical string form, used as the storage partition key.
    pub fn key(&self) -> String {
        // BTreeMap keeps parameter order stable, so the encoding is deterministic.
        let params = serde_json::to_string(&self.params).unwrap_or_default();
        format!(
            "{}/{}/{}?{}",
            self.plugin, self.connection_id, self.table, params
        )
    }
}

impl fmt::Display for CollectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}
