//! Role-gated authorization.
//!
//! Roles are granted per actor id. An actor with no mapping holds only
//! `Advisory`, which unlocks nothing, so unknown callers are denied every
//! gated operation.

use crate::core::error::MarketError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Verifier,
    Treasury,
    Distribution,
    Advisory,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Verifier => "verifier",
            Role::Treasury => "treasury",
            Role::Distribution => "distribution",
            Role::Advisory => "advisory",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = MarketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "verifier" => Ok(Role::Verifier),
            "treasury" => Ok(Role::Treasury),
            "distribution" => Ok(Role::Distribution),
            "advisory" => Ok(Role::Advisory),
            other => Err(MarketError::ValidationError(format!(
                "unknown role '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthorizationPolicy {
    grants: HashMap<String, BTreeSet<Role>>,
}

impl AuthorizationPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, actor_id: &str, role: Role) -> Self {
        self.grants
            .entry(actor_id.to_string())
            .or_default()
            .insert(role);
        self
    }

    pub fn grant_all(mut self, actor_id: &str, roles: impl IntoIterator<Item = Role>) -> Self {
        self.grants
            .entry(actor_id.to_string())
            .or_default()
            .extend(roles);
        self
    }

    pub fn roles_for(&self, actor_id: &str) -> BTreeSet<Role> {
        match self.grants.get(actor_id) {
            Some(roles) if !roles.is_empty() => roles.clone(),
            _ => BTreeSet::from([Role::Advisory]),
        }
    }

    pub fn has_role(&self, actor_id: &str, role: Role) -> bool {
        self.roles_for(actor_id).contains(&role)
    }

    pub fn require(&self, actor_id: &str, role: Role) -> Result<(), MarketError> {
        if self.has_role(actor_id, role) {
            return Ok(());
        }
        tracing::warn!(actor = actor_id, role = %role, "permission denied");
        Err(MarketError::PermissionDenied(format!(
            "{} lacks the {} role",
            actor_id, role
        )))
    }

    pub fn actors(&self) -> impl Iterator<Item = &str> {
        self.grants.keys().map(String::as_str)
    }
}
