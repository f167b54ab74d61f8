//! Coordinated invalidation: delayed queue, reverse indexes and peer events.

mod coordinator;

pub use self::coordinator::{
    BatchReport, CoordinatorStats, InvalidationCoordinator, InvalidationSettings,
};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::key::KeySpace;

/// Why an invalidation was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    RoleChanged,
    PermissionChanged,
    UserRoleAssigned,
    Manual,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::RoleChanged => "role_changed",
            Reason::PermissionChanged => "permission_changed",
            Reason::UserRoleAssigned => "user_role_assigned",
            Reason::Manual => "manual",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Reason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "role_changed" => Ok(Reason::RoleChanged),
            "permission_changed" => Ok(Reason::PermissionChanged),
            "user_role_assigned" => Ok(Reason::UserRoleAssigned),
            "manual" => Ok(Reason::Manual),
            other => Err(format!("unknown invalidation reason `{other}`")),
        }
    }
}

/// Attribute a reverse index is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexDimension {
    Reason,
    Subject,
    Scope,
}

impl IndexDimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexDimension::Reason => "reason",
            IndexDimension::Subject => "subject",
            IndexDimension::Scope => "scope",
        }
    }
}

/// What an invalidation removes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum InvalidationTarget {
    /// One cache key.
    Key(String),
    /// Every cache key starting with a prefix. The prefix must carry the
    /// hash tag of the keys it covers.
    Prefix(String),
    /// Every cache key registered under a scope id.
    Scope(String),
}

/// A queued invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationTask {
    pub id: String,
    pub target: InvalidationTarget,
    pub reason: Reason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
    pub due_at_ms: u64,
    pub enqueued_at_ms: u64,
    #[serde(default)]
    pub attempts: u32,
}

impl InvalidationTask {
    /// New task with a time-ordered id.
    pub fn new(target: InvalidationTarget, reason: Reason, now_ms: u64, due_at_ms: u64) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            target,
            reason,
            subject_id: None,
            scope_id: None,
            due_at_ms,
            enqueued_at_ms: now_ms,
            attempts: 0,
        }
    }

    pub fn with_subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    pub fn with_scope(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self
    }

    /// Reverse indexes this task is registered in while pending.
    pub fn index_keys(&self, keys: &KeySpace) -> Vec<String> {
        let mut out = vec![keys.index_key(IndexDimension::Reason.as_str(), self.reason.as_str())];
        if let Some(subject) = &self.subject_id {
            out.push(keys.index_key(IndexDimension::Subject.as_str(), subject));
        }
        if let Some(scope) = &self.scope_id {
            out.push(keys.index_key(IndexDimension::Scope.as_str(), scope));
        }
        out
    }
}

/// Batched notification telling peers which targets to drop from L1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    pub id: String,
    /// Node that already applied the event.
    pub origin: String,
    pub reason: Reason,
    pub targets: Vec<InvalidationTarget>,
    pub issued_at_ms: u64,
}

/// Diagnostic published when a task is dead-lettered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterNotice {
    pub task: InvalidationTask,
    pub node: String,
    pub error: String,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_round_trip() {
        for reason in [
            Reason::RoleChanged,
            Reason::PermissionChanged,
            Reason::UserRoleAssigned,
            Reason::Manual,
        ] {
            assert_eq!(reason.as_str().parse::<Reason>().unwrap(), reason);
        }
        assert!("revoked".parse::<Reason>().is_err());
    }

    #[test]
    fn test_index_keys_follow_attributes() {
        let keys = KeySpace::new("t");
        let task = InvalidationTask::new(
            InvalidationTarget::Key("k".into()),
            Reason::RoleChanged,
            0,
            0,
        );
        assert_eq!(task.index_keys(&keys), vec!["t:{inv}:idx:reason:role_changed"]);

        let task = task.with_subject("42").with_scope("7");
        let index_keys = task.index_keys(&keys);
        assert_eq!(index_keys.len(), 3);
        assert!(index_keys.contains(&"t:{inv}:idx:subject:42".to_string()));
        assert!(index_keys.contains(&"t:{inv}:idx:scope:7".to_string()));
    }

    #[test]
    fn test_target_wire_shape() {
        let json = serde_json::to_string(&InvalidationTarget::Prefix("p:".into())).unwrap();
        assert_eq!(json, r#"{"kind":"prefix","value":"p:"}"#);
    }
}
