//! # Local Resolution
//!
//! Before anything is forwarded, the router asks a [`LocalResolver`]
//! whether this node can answer on its own. [`DataIndex`] is the bundled
//! resolver: a per-network `address -> record` map that operators publish
//! into through the management surface. Remote peers answer proxied
//! requests from the same index, so a forwarded request travels exactly
//! one hop.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transport::message::DataRequest;

/// Answers requests this node can serve without forwarding.
pub trait LocalResolver: Send + Sync {
    fn resolve(&self, request: &DataRequest) -> Option<Value>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub address: String,
    pub value: Value,
    pub updated_at: DateTime<Utc>,
}

/// In-memory discovery index.
#[derive(Debug, Default)]
pub struct DataIndex {
    entries: DashMap<(String, String), IndexEntry>,
}

impl DataIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish or replace the record at `address` in `network_id`.
    pub fn publish(&self, network_id: &str, address: &str, value: Value) -> IndexEntry {
        let entry = IndexEntry {
            address: address.to_string(),
            value,
            updated_at: Utc::now(),
        };
        self.entries.insert(
            (network_id.to_string(), address.to_string()),
            entry.clone(),
        );
        entry
    }

    pub fn remove(&self, network_id: &str, address: &str) -> Option<IndexEntry> {
        self.entries
            .remove(&(network_id.to_string(), address.to_string()))
            .map(|(_, entry)| entry)
    }

    pub fn get(&self, network_id: &str, address: &str) -> Option<IndexEntry> {
        self.entries
            .get(&(network_id.to_string(), address.to_string()))
            .map(|e| e.value().clone())
    }

    /// Entries of one network, sorted by address.
    pub fn list(&self, network_id: &str) -> Vec<IndexEntry> {
        let mut out: Vec<_> = self
            .entries
            .iter()
            .filter(|e| e.key().0 == network_id)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.address.cmp(&b.address));
        out
    }
}

impl LocalResolver for DataIndex {
    fn resolve(&self, request: &DataRequest) -> Option<Value> {
        self.get(&request.network_id, &request.address)
            .map(|entry| entry.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(network: &str, address: &str) -> DataRequest {
        DataRequest {
            network_id: network.into(),
            address: address.into(),
            payload: Value::Null,
        }
    }

    #[test]
    fn resolves_only_within_network() {
        let index = DataIndex::new();
        index.publish("n1", "books/42", json!({"title": "Dune"}));
        assert_eq!(
            index.resolve(&request("n1", "books/42")),
            Some(json!({"title": "Dune"}))
        );
        assert_eq!(index.resolve(&request("n2", "books/42")), None);
        assert_eq!(index.resolve(&request("n1", "books/43")), None);
    }

    #[test]
    fn publish_replaces_and_remove_deletes() {
        let index = DataIndex::new();
        index.publish("n", "a", json!(1));
        index.publish("n", "a", json!(2));
        index.publish("n", "b", json!(3));
        assert_eq!(index.list("n").len(), 2);
        assert_eq!(index.get("n", "a").unwrap().value, json!(2));
        assert!(index.remove("n", "a").is_some());
        assert!(index.remove("n", "a").is_none());
        assert_eq!(index.list("n").len(), 1);
    }
}
