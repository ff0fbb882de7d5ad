//! # Service Registry
//!
//! Shared name → state table. Supervisors register services on `add` and drop them on
//! `remove`; dependency gates look their dependencies up here and await the state watch.
//!
//! Registration enforces the dependency invariants: a service may not depend on itself,
//! names are unique, and no registration may close a cycle. A dependency on a name that
//! is not registered yet is allowed; it simply never reports `Normal` until it is.

use crate::error::FrameworkError;
use crate::service::ServiceState;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

struct Entry {
    dependencies: Vec<String>,
    state: watch::Receiver<ServiceState>,
}

/// Cheap to clone; all clones share one table.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        name: &str,
        dependencies: &[String],
        state: watch::Receiver<ServiceState>,
    ) -> Result<(), FrameworkError> {
        if dependencies.iter().any(|dep| dep == name) {
            return Err(FrameworkError::SelfDependency(name.to_string()));
        }

        let mut entries = self.entries.write();
        if entries.contains_key(name) {
            return Err(FrameworkError::DuplicateService(name.to_string()));
        }
        for dep in dependencies {
            let mut path = vec![name.to_string()];
            let mut visited = HashSet::new();
            if reaches(&entries, dep, name, &mut path, &mut visited) {
                return Err(FrameworkError::DependencyCycle(path));
            }
        }

        entries.insert(
            name.to_string(),
            Entry {
                dependencies: dependencies.to_vec(),
                state,
            },
        );
        debug!(service = %name, ?dependencies, "Registered");
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.entries.write().remove(name).is_some();
        if removed {
            debug!(service = %name, "Unregistered");
        }
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// A fresh receiver for `name`'s state, if registered.
    pub fn watch(&self, name: &str) -> Option<watch::Receiver<ServiceState>> {
        self.entries.read().get(name).map(|entry| entry.state.clone())
    }

    /// Current state of `name`; unregistered services read as `NotRunning`.
    pub fn state(&self, name: &str) -> ServiceState {
        self.entries
            .read()
            .get(name)
            .map(|entry| *entry.state.borrow())
            .unwrap_or_default()
    }

    pub fn dependencies(&self, name: &str) -> Option<Vec<String>> {
        self.entries
            .read()
            .get(name)
            .map(|entry| entry.dependencies.clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Depth-first walk from `from` along registered dependencies, looking for `target`.
/// On success `path` holds the cycle, starting and ending at `target`.
fn reaches(
    entries: &HashMap<String, Entry>,
    from: &str,
    target: &str,
    path: &mut Vec<String>,
    visited: &mut HashSet<String>,
) -> bool {
    path.push(from.to_string());
    if from == target {
        return true;
    }
    if visited.insert(from.to_string()) {
        if let Some(entry) = entries.get(from) {
            for next in &entry.dependencies {
                if reaches(entries, next, target, path, visited) {
                    return true;
                }
            }
        }
    }
    path.pop();
    false
}
