use std::sync::{Arc, Weak};

use hashbrown::HashMap;

use super::{Step, System};

/// Build steps with no unbuilt dependencies. Weak references only and no
/// intrinsic ordering: the dispatcher snapshots the set and does a full
/// priority sort on every pass.
pub struct Runnable {
    inner: parking_lot::Mutex<Vec<Weak<Step>>>,
}

impl Default for Runnable {
    fn default() -> Self {
        Self::new()
    }
}

impl Runnable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: parking_lot::Mutex::new(Vec::with_capacity(1000)),
        }
    }

    pub fn insert(&self, step: &Arc<Step>) {
        let mut inner = self.inner.lock();
        if inner
            .iter()
            .filter_map(Weak::upgrade)
            .any(|s| s.get_drv_path() == step.get_drv_path())
        {
            return;
        }
        inner.push(Arc::downgrade(step));
    }

    pub fn remove(&self, drv_path: &store_utils::StorePath) {
        let mut inner = self.inner.lock();
        inner.retain(|w| {
            w.upgrade()
                .is_some_and(|s| s.get_drv_path() != drv_path)
        });
    }

    /// Upgrade all live entries, dropping dead weak refs along the way.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Step>> {
        let mut inner = self.inner.lock();
        let mut steps = Vec::with_capacity(inner.len());
        inner.retain(|w| {
            let Some(step) = w.upgrade() else {
                return false;
            };
            steps.push(step);
            true
        });
        steps
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.retain(|w| w.upgrade().is_some());
        inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-system-type scheduling statistics, refreshed by every dispatcher
/// pass. An external autoscaler reads these; the dispatcher itself takes
/// no scaling action.
#[derive(Debug, Default, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemTypeInfo {
    pub runnable: u64,
    pub running: u64,
    pub wait_time_ms: u64,
    pub last_active: Option<jiff::Timestamp>,
}

#[derive(Default)]
pub struct SystemTypes {
    inner: parking_lot::RwLock<HashMap<System, SystemTypeInfo>>,
}

impl SystemTypes {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: parking_lot::RwLock::new(HashMap::with_capacity(4)),
        }
    }

    pub fn replace(&self, stats: HashMap<System, SystemTypeInfo>) {
        *self.inner.write() = stats;
    }

    #[must_use]
    pub fn snapshot(&self) -> HashMap<System, SystemTypeInfo> {
        self.inner.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created_step(tag: &str) -> Arc<Step> {
        let step = Step::new(store_utils::StorePath::new(&format!("{tag:e<32.32}-{tag}.drv")));
        step.atomic_state.set_created(true);
        step
    }

    #[test]
    fn test_insert_is_idempotent() {
        let runnable = Runnable::new();
        let step = created_step("pkg");

        runnable.insert(&step);
        runnable.insert(&step);

        assert_eq!(runnable.len(), 1);
    }

    #[test]
    fn test_snapshot_scrubs_dead_refs() {
        let runnable = Runnable::new();
        let keep = created_step("keep");
        runnable.insert(&keep);
        {
            let transient = created_step("transient");
            runnable.insert(&transient);
            assert_eq!(runnable.len(), 2);
        }

        let snapshot = runnable.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].get_drv_path(), keep.get_drv_path());
    }

    #[test]
    fn test_remove_by_path() {
        let runnable = Runnable::new();
        let step = created_step("pkg");
        runnable.insert(&step);

        runnable.remove(step.get_drv_path());
        assert!(runnable.is_empty());
    }
}
