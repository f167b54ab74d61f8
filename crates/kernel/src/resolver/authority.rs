//! Authoritative permission store.

use std::collections::{HashMap, HashSet};

use anyhow::Context;
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;

use crate::error::PermissionError;
use crate::key::{Scope, ScopeType};

/// Dependency name the authority is guarded under.
pub const AUTHORITY: &str = "authority";

/// Source of truth for role and permission assignments.
///
/// Implementations report failures as [`PermissionError::Unavailable`]; the
/// resolver only ever reaches them through the resilience controller.
#[async_trait]
pub trait PermissionAuthority: Send + Sync {
    /// Effective permission names of a subject at one scope.
    async fn fetch_permissions_for_subject(
        &self,
        subject_id: &str,
        scope: &Scope,
    ) -> Result<HashSet<String>, PermissionError>;

    /// Effective permissions at several scopes in one round trip.
    async fn fetch_permissions_bulk(
        &self,
        subject_id: &str,
        scopes: &[Scope],
    ) -> Result<HashMap<Scope, HashSet<String>>, PermissionError> {
        let mut out = HashMap::with_capacity(scopes.len());
        for scope in scopes {
            let permissions = self.fetch_permissions_for_subject(subject_id, scope).await?;
            out.insert(scope.clone(), permissions);
        }
        Ok(out)
    }

    /// Subjects currently holding a role.
    async fn subjects_with_role(&self, role_id: &str) -> Result<Vec<String>, PermissionError>;
}

/// PostgreSQL authority over `user_roles` and `role_permissions`.
///
/// A role assigned at global scope applies at every scope; otherwise the
/// assignment's scope type and id must match the checked scope.
#[derive(Clone)]
pub struct PgAuthority {
    pool: PgPool,
}

impl PgAuthority {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn scoped_grants(
        &self,
        subject_id: &str,
        scope_ids: &[String],
    ) -> anyhow::Result<Vec<(String, Option<String>, String)>> {
        let rows = sqlx::query_as::<_, (String, Option<String>, String)>(
            r#"
            SELECT DISTINCT ur.scope_type, ur.scope_id, rp.permission
            FROM user_roles ur
            JOIN role_permissions rp ON rp.role_id = ur.role_id
            WHERE ur.user_id = $1
              AND (ur.scope_type = 'global' OR ur.scope_id = ANY($2))
            "#,
        )
        .bind(subject_id)
        .bind(scope_ids)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch scoped grants")?;

        Ok(rows)
    }
}

fn unavailable(e: anyhow::Error) -> PermissionError {
    PermissionError::unavailable(AUTHORITY, format!("{e:#}"))
}

/// Fold grant rows into effective permissions per requested scope.
fn effective(
    rows: &[(String, Option<String>, String)],
    scopes: &[Scope],
) -> HashMap<Scope, HashSet<String>> {
    let mut out: HashMap<Scope, HashSet<String>> =
        scopes.iter().map(|s| (s.clone(), HashSet::new())).collect();
    for (scope_type, scope_id, permission) in rows {
        let global = scope_type == ScopeType::Global.as_str();
        for (scope, permissions) in &mut out {
            let matches = global
                || (scope.scope_type.as_str() == scope_type
                    && scope.scope_id.as_deref() == scope_id.as_deref());
            if matches {
                permissions.insert(permission.clone());
            }
        }
    }
    out
}

#[async_trait]
impl PermissionAuthority for PgAuthority {
    async fn fetch_permissions_for_subject(
        &self,
        subject_id: &str,
        scope: &Scope,
    ) -> Result<HashSet<String>, PermissionError> {
        let mut map = self
            .fetch_permissions_bulk(subject_id, std::slice::from_ref(scope))
            .await?;
        Ok(map.remove(scope).unwrap_or_default())
    }

    async fn fetch_permissions_bulk(
        &self,
        subject_id: &str,
        scopes: &[Scope],
    ) -> Result<HashMap<Scope, HashSet<String>>, PermissionError> {
        let scope_ids: Vec<String> = scopes.iter().filter_map(|s| s.scope_id.clone()).collect();
        let rows = self
            .scoped_grants(subject_id, &scope_ids)
            .await
            .map_err(unavailable)?;
        debug!(subject_id = %subject_id, scopes = scopes.len(), rows = rows.len(), "authority query");
        Ok(effective(&rows, scopes))
    }

    async fn subjects_with_role(&self, role_id: &str) -> Result<Vec<String>, PermissionError> {
        let subjects =
            sqlx::query_scalar::<_, String>("SELECT DISTINCT user_id FROM user_roles WHERE role_id = $1")
                .bind(role_id)
                .fetch_all(&self.pool)
                .await
                .context("failed to fetch role members")
                .map_err(unavailable)?;

        Ok(subjects)
    }
}

impl std::fmt::Debug for PgAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgAuthority").finish()
    }
}
