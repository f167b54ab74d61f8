//! Permission keys and the key layout in the shared store.
//!
//! Every key that takes part in a multi-key script carries a Redis hash tag
//! (`{...}`) so that a clustered deployment places it on the same shard as its
//! peers:
//!
//! - `{u:<subject>}` groups all cached results of one subject, which lets a
//!   subject-wide pattern delete run as one script on one shard.
//! - `{s:<scope>}` groups a scope's tag set.
//! - `{inv}` groups the invalidation queue, its payload hashes and every
//!   reverse index.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PermissionError;

/// Longest accepted key component.
const MAX_COMPONENT_LEN: usize = 256;

/// Characters that would break hash tags, glob patterns or key segments.
const RESERVED_CHARS: &[char] = &['{', '}', '*', '?', '[', ']', ':', '\\'];

/// The level at which a permission is granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeType {
    Global,
    Server,
    Channel,
}

impl ScopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeType::Global => "global",
            ScopeType::Server => "server",
            ScopeType::Channel => "channel",
        }
    }
}

impl fmt::Display for ScopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScopeType {
    type Err = PermissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(ScopeType::Global),
            "server" => Ok(ScopeType::Server),
            "channel" => Ok(ScopeType::Channel),
            other => Err(PermissionError::InvalidKey(format!(
                "unknown scope type `{other}`"
            ))),
        }
    }
}

/// A scope: global, or a specific server or channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope {
    pub scope_type: ScopeType,
    pub scope_id: Option<String>,
}

impl Scope {
    /// Build a validated scope.
    ///
    /// Global scopes carry no id; server and channel scopes require one.
    pub fn new(scope_type: ScopeType, scope_id: Option<&str>) -> Result<Self, PermissionError> {
        match (scope_type, scope_id) {
            (ScopeType::Global, None) => Ok(Self::global()),
            (ScopeType::Global, Some(_)) => Err(PermissionError::InvalidKey(
                "global scope must not carry a scope id".to_string(),
            )),
            (_, None) => Err(PermissionError::InvalidKey(format!(
                "{scope_type} scope requires a scope id"
            ))),
            (_, Some(id)) => {
                validate_component("scope id", id)?;
                Ok(Self {
                    scope_type,
                    scope_id: Some(id.to_string()),
                })
            }
        }
    }

    pub fn global() -> Self {
        Self {
            scope_type: ScopeType::Global,
            scope_id: None,
        }
    }

    pub fn server(id: &str) -> Result<Self, PermissionError> {
        Self::new(ScopeType::Server, Some(id))
    }

    pub fn channel(id: &str) -> Result<Self, PermissionError> {
        Self::new(ScopeType::Channel, Some(id))
    }

    /// The id segment used inside cache keys (`-` for global).
    fn id_segment(&self) -> &str {
        self.scope_id.as_deref().unwrap_or("-")
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope_type, self.id_segment())
    }
}

/// Composite lookup key: subject, scope and permission name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionKey {
    subject_id: String,
    scope: Scope,
    permission: String,
}

impl PermissionKey {
    /// Build a validated key.
    pub fn new(
        subject_id: &str,
        scope_type: ScopeType,
        scope_id: Option<&str>,
        permission: &str,
    ) -> Result<Self, PermissionError> {
        let scope = Scope::new(scope_type, scope_id)?;
        Self::with_scope(subject_id, scope, permission)
    }

    /// Build a key from an already validated scope.
    pub fn with_scope(
        subject_id: &str,
        scope: Scope,
        permission: &str,
    ) -> Result<Self, PermissionError> {
        validate_component("subject id", subject_id)?;
        validate_component("permission", permission)?;
        Ok(Self {
            subject_id: subject_id.to_string(),
            scope,
            permission: permission.to_string(),
        })
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn permission(&self) -> &str {
        &self.permission
    }
}

impl fmt::Display for PermissionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.subject_id, self.scope, self.permission)
    }
}

fn validate_component(what: &str, value: &str) -> Result<(), PermissionError> {
    if value.is_empty() {
        return Err(PermissionError::InvalidKey(format!("{what} is empty")));
    }
    if value.len() > MAX_COMPONENT_LEN {
        return Err(PermissionError::InvalidKey(format!(
            "{what} exceeds {MAX_COMPONENT_LEN} bytes"
        )));
    }
    if let Some(c) = value
        .chars()
        .find(|c| c.is_whitespace() || c.is_control() || RESERVED_CHARS.contains(c))
    {
        return Err(PermissionError::InvalidKey(format!(
            "{what} contains reserved character {c:?}"
        )));
    }
    Ok(())
}

/// Short digest of a permission name used as the final cache-key segment.
fn permission_digest(permission: &str) -> String {
    let digest = Sha256::digest(permission.as_bytes());
    hex::encode(&digest[..8])
}

/// Namespaced key and channel names in the shared store.
#[derive(Debug, Clone)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Cache key for a permission check result.
    pub fn cache_key(&self, key: &PermissionKey) -> String {
        format!(
            "{}{}:{}:{}",
            self.subject_prefix(key.subject_id()),
            key.scope().scope_type,
            key.scope().id_segment(),
            permission_digest(key.permission())
        )
    }

    /// Prefix shared by every cache key of one subject.
    pub fn subject_prefix(&self, subject_id: &str) -> String {
        format!("{}:", self.subject_routing_key(subject_id))
    }

    /// Key that routes a script to the shard owning a subject's entries.
    pub fn subject_routing_key(&self, subject_id: &str) -> String {
        format!("{}:perm:{{u:{subject_id}}}", self.namespace)
    }

    /// Set of cache keys registered under a scope id.
    pub fn scope_tag(&self, scope_id: &str) -> String {
        format!("{}:scope:{{s:{scope_id}}}:keys", self.namespace)
    }

    pub fn queue(&self) -> String {
        format!("{}:{{inv}}:queue", self.namespace)
    }

    pub fn processing(&self) -> String {
        format!("{}:{{inv}}:processing", self.namespace)
    }

    pub fn task_payloads(&self) -> String {
        format!("{}:{{inv}}:tasks", self.namespace)
    }

    pub fn task_refs(&self) -> String {
        format!("{}:{{inv}}:refs", self.namespace)
    }

    pub fn dead_letters(&self) -> String {
        format!("{}:{{inv}}:dead", self.namespace)
    }

    /// Reverse index for one attribute value (`reason`, `subject`, `scope`).
    pub fn index_key(&self, dimension: &str, value: &str) -> String {
        format!("{}:{{inv}}:idx:{dimension}:{value}", self.namespace)
    }

    pub fn breaker_key(&self, dependency: &str) -> String {
        format!("{}:breaker:{dependency}", self.namespace)
    }

    pub fn rate_key(&self, dependency: &str, window_index: u64) -> String {
        format!("{}:rate:{dependency}:{window_index}", self.namespace)
    }

    pub fn maintenance_key(&self) -> String {
        format!("{}:maintenance", self.namespace)
    }

    pub fn invalidation_channel(&self) -> String {
        format!("{}:invalidate", self.namespace)
    }

    pub fn resilience_channel(&self) -> String {
        format!("{}:resilience", self.namespace)
    }

    pub fn diagnostics_channel(&self) -> String {
        format!("{}:diagnostics", self.namespace)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("permgate")
    }
}
