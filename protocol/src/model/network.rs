//! Network overlays.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// This node's standing inside a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkRole {
    Member,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkState {
    /// Joined through an invite whose sender has not been admitted yet.
    Pending,
    Active,
    Revoked,
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Revoked => "revoked",
        };
        f.write_str(s)
    }
}

/// A logical overlay of cooperating nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    pub name: String,
    pub description: String,
    pub role: NetworkRole,
    pub state: NetworkState,
    /// Leading zero bits required from peers joining through this node.
    pub difficulty: u32,
    pub created_at: DateTime<Utc>,
}

impl Network {
    pub fn descriptor(&self) -> NetworkDescriptor {
        NetworkDescriptor {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == NetworkRole::Admin
    }
}

/// The public face of a network, as carried inside invites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
}
