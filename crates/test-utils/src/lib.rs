//! permgate test utilities.
//!
//! Helpers for integration testing: an in-memory grant table standing in for
//! the authoritative store, call counters, failure switches and a gate for
//! holding calls in flight.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;

/// One role assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub subject_id: String,
    pub role_id: String,
    /// `global`, `server` or `channel`.
    pub scope_type: String,
    pub scope_id: Option<String>,
}

/// Role and permission assignments with the same semantics as the SQL
/// authority: a role assigned at global scope applies at every scope.
#[derive(Debug, Clone, Default)]
pub struct GrantTable {
    inner: Arc<RwLock<Grants>>,
}

#[derive(Debug, Default)]
struct Grants {
    assignments: Vec<Assignment>,
    role_permissions: HashMap<String, HashSet<String>>,
}

impl GrantTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give `role_id` a set of permissions, replacing any previous set.
    pub fn define_role(&self, role_id: &str, permissions: &[&str]) -> &Self {
        self.inner.write().role_permissions.insert(
            role_id.to_string(),
            permissions.iter().map(|p| p.to_string()).collect(),
        );
        self
    }

    /// Assign a role to a subject at a scope.
    pub fn assign(
        &self,
        subject_id: &str,
        role_id: &str,
        scope_type: &str,
        scope_id: Option<&str>,
    ) -> &Self {
        self.inner.write().assignments.push(Assignment {
            subject_id: subject_id.to_string(),
            role_id: role_id.to_string(),
            scope_type: scope_type.to_string(),
            scope_id: scope_id.map(str::to_string),
        });
        self
    }

    /// Remove every assignment of `role_id` to `subject_id`.
    pub fn revoke(&self, subject_id: &str, role_id: &str) -> &Self {
        self.inner
            .write()
            .assignments
            .retain(|a| !(a.subject_id == subject_id && a.role_id == role_id));
        self
    }

    /// Effective permissions of a subject at one scope.
    pub fn permissions(
        &self,
        subject_id: &str,
        scope_type: &str,
        scope_id: Option<&str>,
    ) -> HashSet<String> {
        let grants = self.inner.read();
        grants
            .assignments
            .iter()
            .filter(|a| a.subject_id == subject_id)
            .filter(|a| {
                a.scope_type == "global"
                    || (a.scope_type == scope_type && a.scope_id.as_deref() == scope_id)
            })
            .filter_map(|a| grants.role_permissions.get(&a.role_id))
            .flatten()
            .cloned()
            .collect()
    }

    /// Distinct subjects holding `role_id` at any scope.
    pub fn subjects_with_role(&self, role_id: &str) -> Vec<String> {
        let mut subjects: Vec<String> = self
            .inner
            .read()
            .assignments
            .iter()
            .filter(|a| a.role_id == role_id)
            .map(|a| a.subject_id.clone())
            .collect();
        subjects.sort();
        subjects.dedup();
        subjects
    }
}

/// Counts calls across clones.
#[derive(Debug, Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one call and return the new total.
    pub fn hit(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }
}

/// Makes a fake dependency fail on demand.
#[derive(Debug, Clone, Default)]
pub struct FailureSwitch {
    always: Arc<AtomicBool>,
    next: Arc<AtomicUsize>,
}

impl FailureSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call until [`heal`](Self::heal).
    pub fn fail_always(&self) {
        self.always.store(true, Ordering::SeqCst);
    }

    /// Fail the next `n` calls.
    pub fn fail_next(&self, n: usize) {
        self.next.store(n, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.always.store(false, Ordering::SeqCst);
        self.next.store(0, Ordering::SeqCst);
    }

    /// Whether the current call should fail. Consumes one queued failure.
    pub fn should_fail(&self) -> bool {
        if self.always.load(Ordering::SeqCst) {
            return true;
        }
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Holds callers until opened.
#[derive(Debug, Clone)]
pub struct Gate {
    tx: Arc<watch::Sender<bool>>,
}

impl Gate {
    pub fn closed() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    /// Wait until the gate is open.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this only errors if it was dropped.
        let _ = rx.wait_for(|open| *open).await;
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_table_scoping() {
        let grants = GrantTable::new();
        grants
            .define_role("member", &["read"])
            .define_role("mod", &["delete"])
            .assign("alice", "member", "global", None)
            .assign("alice", "mod", "server", Some("7"));

        let at_7 = grants.permissions("alice", "server", Some("7"));
        assert!(at_7.contains("read"));
        assert!(at_7.contains("delete"));

        let at_8 = grants.permissions("alice", "server", Some("8"));
        assert!(at_8.contains("read"));
        assert!(!at_8.contains("delete"));

        grants.revoke("alice", "member");
        assert!(grants.permissions("alice", "global", None).is_empty());
        assert_eq!(grants.subjects_with_role("mod"), vec!["alice".to_string()]);
    }

    #[test]
    fn test_failure_switch() {
        let switch = FailureSwitch::new();
        assert!(!switch.should_fail());
        switch.fail_next(2);
        assert!(switch.should_fail());
        assert!(switch.should_fail());
        assert!(!switch.should_fail());
        switch.fail_always();
        assert!(switch.should_fail());
        switch.heal();
        assert!(!switch.should_fail());
    }

    #[test]
    fn test_call_counter_is_shared() {
        let counter = CallCounter::new();
        let clone = counter.clone();
        clone.hit();
        assert_eq!(counter.hit(), 2);
        counter.reset();
        assert_eq!(clone.get(), 0);
    }

    #[tokio::test]
    async fn test_gate_releases_waiters() {
        let gate = Gate::closed();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait().await })
        };
        gate.open();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_else(|| panic!("gate did not open"));
    }
}
