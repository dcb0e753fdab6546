//! Remediation policies.
//!
//! A policy scopes a remediation list to a tenant and/or model; `None`
//! scopes are wildcards. For a given violation the highest-priority
//! matching policy wins and only its remediations run.

use serde::{Deserialize, Serialize};

/// Automated mitigation actions.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RemediationAction {
    ScaleUp,
    ScaleDown,
    Throttle,
    Alert,
    Restart,
}

impl RemediationAction {
    /// The action this one tugs against, for loop detection.
    pub fn opposing(self) -> Option<RemediationAction> {
        match self {
            Self::ScaleUp => Some(Self::ScaleDown),
            Self::ScaleDown => Some(Self::ScaleUp),
            Self::Throttle | Self::Alert | Self::Restart => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    pub priority: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    pub remediations: Vec<RemediationAction>,
}

impl Policy {
    fn matches(&self, tenant_id: Option<&str>, model_id: Option<&str>) -> bool {
        let tenant_ok = match &self.tenant_id {
            None => true,
            Some(want) => tenant_id == Some(want.as_str()),
        };
        let model_ok = match &self.model_id {
            None => true,
            Some(want) => model_id == Some(want.as_str()),
        };
        tenant_ok && model_ok
    }
}

/// Ordered policy collection.
#[derive(Debug, Clone, Default)]
pub struct PolicyStore {
    policies: Vec<Policy>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, policy: Policy) -> Self {
        self.add(policy);
        self
    }

    /// Insert or replace by name.
    pub fn add(&mut self, policy: Policy) {
        self.policies.retain(|p| p.name != policy.name);
        self.policies.push(policy);
    }

    pub fn remove(&mut self, name: &str) {
        self.policies.retain(|p| p.name != name);
    }

    /// The highest-priority policy matching the violation scope.
    pub fn select(&self, tenant_id: Option<&str>, model_id: Option<&str>) -> Option<&Policy> {
        self.policies
            .iter()
            .filter(|p| p.matches(tenant_id, model_id))
            .max_by_key(|p| p.priority)
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(name: &str, priority: u32, tenant: Option<&str>) -> Policy {
        Policy {
            name: name.into(),
            priority,
            tenant_id: tenant.map(str::to_owned),
            model_id: None,
            remediations: vec![RemediationAction::Alert],
        }
    }

    #[test]
    fn highest_priority_match_wins() {
        let store = PolicyStore::new()
            .with(policy("default", 1, None))
            .with(policy("acme-special", 10, Some("acme")));

        assert_eq!(store.select(Some("acme"), None).unwrap().name, "acme-special");
        assert_eq!(store.select(Some("globex"), None).unwrap().name, "default");
        assert_eq!(store.select(None, None).unwrap().name, "default");
    }

    #[test]
    fn scoped_policy_never_matches_other_scopes() {
        let store = PolicyStore::new().with(policy("acme-only", 5, Some("acme")));
        assert!(store.select(Some("globex"), None).is_none());
        assert!(store.select(None, None).is_none());
    }

    #[test]
    fn scaling_actions_oppose_each_other() {
        assert_eq!(
            RemediationAction::ScaleUp.opposing(),
            Some(RemediationAction::ScaleDown)
        );
        assert_eq!(RemediationAction::Alert.opposing(), None);
    }
}
