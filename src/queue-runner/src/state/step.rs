use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use hashbrown::{HashMap, HashSet};

use super::{Build, Jobset};
use db::models::BuildID;

#[derive(Debug)]
pub struct StepAtomicState {
    created: AtomicBool,  // Whether the step has finished initialisation.
    pub tries: AtomicU32, // Number of times we've tried this step.
    pub highest_global_priority: AtomicI32, // The highest global priority of any build depending on this step.
    pub highest_local_priority: AtomicI32, // The highest local priority of any build depending on this step.

    pub lowest_build_id: AtomicI32, // The lowest ID of any build depending on this step.

    pub after: super::AtomicDateTime, // Point in time after which the step can be retried.
    pub runnable_since: super::AtomicDateTime, // The time at which this step became runnable.

    pub deps_len: AtomicU64,
}

impl StepAtomicState {
    pub fn new(after: jiff::Timestamp, runnable_since: jiff::Timestamp) -> Self {
        Self {
            created: false.into(),
            tries: 0.into(),
            highest_global_priority: 0.into(),
            highest_local_priority: 0.into(),
            lowest_build_id: BuildID::MAX.into(),
            after: super::AtomicDateTime::new(after),
            runnable_since: super::AtomicDateTime::new(runnable_since),
            deps_len: 0.into(),
        }
    }

    #[inline]
    pub fn get_created(&self) -> bool {
        self.created.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn set_created(&self, v: bool) {
        self.created.store(v, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct StepState {
    deps: HashSet<Arc<Step>>,      // The build steps on which this step depends.
    rdeps: Vec<Weak<Step>>,        // The build steps that depend on this step.
    builds: Vec<Weak<Build>>,      // Builds that have this step as the top-level derivation.
    jobsets: HashSet<Arc<Jobset>>, // Jobsets this step belongs to, for scheduling priority.
}

impl Default for StepState {
    fn default() -> Self {
        Self::new()
    }
}

impl StepState {
    pub fn new() -> Self {
        Self {
            deps: HashSet::new(),
            rdeps: Vec::new(),
            builds: Vec::new(),
            jobsets: HashSet::new(),
        }
    }
}

#[derive(Debug)]
pub struct Step {
    drv_path: store_utils::StorePath,
    drv: arc_swap::ArcSwapOption<store_utils::Derivation>,

    runnable: AtomicBool,
    finished: AtomicBool,
    previous_failure: AtomicBool,
    pub atomic_state: StepAtomicState,
    state: parking_lot::RwLock<StepState>,
}

impl PartialEq for Step {
    fn eq(&self, other: &Self) -> bool {
        self.drv_path == other.drv_path
    }
}

impl Eq for Step {}

impl std::hash::Hash for Step {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        // drv_path is the step identity and never mutates
        self.drv_path.hash(state);
    }
}

impl Step {
    #[must_use]
    pub fn new(drv_path: store_utils::StorePath) -> Arc<Self> {
        Arc::new(Self {
            drv_path,
            drv: arc_swap::ArcSwapOption::from(None),
            runnable: false.into(),
            finished: false.into(),
            previous_failure: false.into(),
            atomic_state: StepAtomicState::new(
                jiff::Timestamp::UNIX_EPOCH,
                jiff::Timestamp::UNIX_EPOCH,
            ),
            state: parking_lot::RwLock::new(StepState::new()),
        })
    }

    #[inline]
    pub const fn get_drv_path(&self) -> &store_utils::StorePath {
        &self.drv_path
    }

    #[inline]
    pub fn get_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn set_finished(&self, v: bool) {
        self.finished.store(v, Ordering::SeqCst);
    }

    #[inline]
    pub fn get_previous_failure(&self) -> bool {
        self.previous_failure.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn set_previous_failure(&self, v: bool) {
        self.previous_failure.store(v, Ordering::SeqCst);
    }

    #[inline]
    pub fn get_runnable(&self) -> bool {
        self.runnable.load(Ordering::SeqCst)
    }

    pub fn set_drv(&self, drv: store_utils::Derivation) {
        self.drv.store(Some(Arc::new(drv)));
    }

    pub fn get_platform(&self) -> Option<String> {
        let drv = self.drv.load_full();
        drv.as_ref().map(|drv| drv.platform.clone())
    }

    /// The capability key: platform plus sorted required features.
    pub fn get_system_type(&self) -> Option<String> {
        let drv = self.drv.load_full();
        drv.as_ref().map(|drv| drv.system_type())
    }

    pub fn get_required_features(&self) -> Vec<String> {
        let drv = self.drv.load_full();
        drv.as_ref()
            .map(|drv| drv.required_features.to_vec())
            .unwrap_or_default()
    }

    pub fn get_prefer_local(&self) -> bool {
        let drv = self.drv.load_full();
        drv.as_ref().is_some_and(|drv| drv.prefer_local)
    }

    pub fn get_input_drvs(&self) -> Option<Vec<String>> {
        let drv = self.drv.load_full();
        drv.as_ref().map(|drv| drv.input_drvs.to_vec())
    }

    pub fn get_outputs(&self) -> Option<Vec<store_utils::Output>> {
        let drv = self.drv.load_full();
        drv.as_ref().map(|drv| drv.outputs.to_vec())
    }

    pub fn get_after(&self) -> jiff::Timestamp {
        self.atomic_state.after.load()
    }

    pub fn set_after(&self, v: jiff::Timestamp) {
        self.atomic_state.after.store(v);
    }

    pub fn get_runnable_since(&self) -> jiff::Timestamp {
        self.atomic_state.runnable_since.load()
    }

    /// Walk the transitive dependents of this step, collecting the steps
    /// visited and every live build reachable along the way.
    #[tracing::instrument(skip(self, builds, steps))]
    pub fn get_dependents(
        self: &Arc<Self>,
        builds: &mut HashSet<Arc<Build>>,
        steps: &mut HashSet<Arc<Self>>,
    ) {
        if steps.contains(self) {
            return;
        }
        steps.insert(self.clone());

        let rdeps = {
            let state = self.state.read();
            for b in &state.builds {
                let Some(b) = b.upgrade() else { continue };

                if !b.get_finished_in_db() {
                    builds.insert(b);
                }
            }
            state.rdeps.clone()
        };

        for rdep in rdeps {
            let Some(rdep) = rdep.upgrade() else { continue };
            rdep.get_dependents(builds, steps);
        }
    }

    pub fn get_deps_size(&self) -> u64 {
        self.atomic_state.deps_len.load(Ordering::Relaxed)
    }

    /// After this step finished, drop it from its dependents' dep sets.
    /// Returns the dependents that became dep-free and can now run.
    pub fn make_rdeps_runnable(&self) -> Vec<Arc<Self>> {
        if !self.get_finished() {
            return Vec::new();
        }

        let mut new_runnable = Vec::new();
        let mut state = self.state.write();
        state.rdeps.retain(|rdep| {
            let Some(rdep) = rdep.upgrade() else {
                return false;
            };

            {
                let mut rdep_state = rdep.state.write();
                rdep_state
                    .deps
                    .retain(|s| s.get_drv_path() != self.get_drv_path());
                rdep.atomic_state
                    .deps_len
                    .store(rdep_state.deps.len() as u64, Ordering::Relaxed);
                if rdep_state.deps.is_empty() && rdep.atomic_state.get_created() {
                    new_runnable.push(rdep.clone());
                }
            }
            true
        });
        new_runnable
    }

    #[tracing::instrument(skip(self))]
    pub fn make_runnable(&self) {
        debug_assert!(self.atomic_state.get_created());
        debug_assert!(!self.get_finished());

        #[cfg(debug_assertions)]
        {
            let state = self.state.read();
            debug_assert!(state.deps.is_empty());
        }

        // only ever mark as runnable once
        if !self.runnable.load(Ordering::SeqCst) {
            tracing::info!("step '{}' is now runnable", self.get_drv_path());

            self.runnable.store(true, Ordering::SeqCst);
            self.atomic_state.runnable_since.store(jiff::Timestamp::now());
        }
    }

    pub fn get_lowest_share_used(&self) -> f64 {
        let state = self.state.read();

        state
            .jobsets
            .iter()
            .map(|v| v.share_used())
            .min_by(f64::total_cmp)
            .unwrap_or(1e9)
    }

    pub fn get_jobsets(&self) -> Vec<Arc<Jobset>> {
        let state = self.state.read();
        state.jobsets.iter().cloned().collect()
    }

    pub fn add_jobset(&self, jobset: Arc<Jobset>) {
        let mut state = self.state.write();
        state.jobsets.insert(jobset);
    }

    pub fn add_dep(&self, dep: Arc<Self>) {
        let mut state = self.state.write();
        state.deps.insert(dep);
        self.atomic_state
            .deps_len
            .store(state.deps.len() as u64, Ordering::Relaxed);
    }

    pub fn add_referring_data(
        &self,
        referring_build: Option<&Arc<Build>>,
        referring_step: Option<&Arc<Self>>,
    ) {
        if referring_build.is_none() && referring_step.is_none() {
            return;
        }

        let mut state = self.state.write();
        if let Some(referring_build) = referring_build {
            state.builds.push(Arc::downgrade(referring_build));
        }
        if let Some(referring_step) = referring_step {
            state.rdeps.push(Arc::downgrade(referring_step));
        }
    }

    /// Builds that have this step as their top level and are still live.
    pub fn get_direct_builds(&self) -> Vec<Arc<Build>> {
        let mut direct = Vec::new();
        let state = self.state.read();
        for b in &state.builds {
            let Some(b) = b.upgrade() else {
                continue;
            };
            if !b.get_finished_in_db() {
                direct.push(b);
            }
        }

        direct
    }

    pub fn get_all_deps_not_queued(&self, queued: &HashSet<Arc<Self>>) -> Vec<Arc<Self>> {
        let state = self.state.read();
        state
            .deps
            .iter()
            .filter(|dep| !queued.contains(*dep))
            .map(Clone::clone)
            .collect()
    }
}

/// The global step map. Holds weak references only: a step stays alive
/// exactly while a build reaches it or a reservation executes it.
#[derive(Clone)]
pub struct Steps {
    inner: Arc<parking_lot::RwLock<HashMap<store_utils::StorePath, Weak<Step>>>>,
}

impl Default for Steps {
    fn default() -> Self {
        Self::new()
    }
}

impl Steps {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(parking_lot::RwLock::new(HashMap::with_capacity(10000))),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let mut steps = self.inner.write();
        steps.retain(|_, s| s.upgrade().is_some());
        steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn clone_as_io(&self) -> Vec<crate::io::Step> {
        let steps = self.inner.read();
        steps
            .values()
            .filter_map(std::sync::Weak::upgrade)
            .map(Into::into)
            .collect()
    }

    /// Sweep finished steps and free their dependents. Returns the steps
    /// that became runnable. Needed because step creation is concurrent
    /// with completion: a dep edge can be added to a step that is just
    /// finishing.
    pub fn make_rdeps_runnable(&self) -> Vec<Arc<Step>> {
        let mut new_runnable = Vec::new();
        let steps = self.inner.read();
        for (_, s) in steps.iter() {
            let Some(s) = s.upgrade() else {
                continue;
            };
            if s.get_finished() && !s.get_previous_failure() {
                new_runnable.extend(s.make_rdeps_runnable());
            }
        }
        new_runnable
    }

    /// Insert-or-lookup by derivation path. The bool is true when the
    /// step was newly created and still needs its derivation loaded.
    #[must_use]
    pub fn create(
        &self,
        drv_path: &store_utils::StorePath,
        referring_build: Option<&Arc<Build>>,
        referring_step: Option<&Arc<Step>>,
    ) -> (Arc<Step>, bool) {
        let mut is_new = false;
        let mut steps = self.inner.write();
        let step = if let Some(step) = steps.get(drv_path) {
            step.upgrade().map_or_else(
                || {
                    steps.remove(drv_path);
                    is_new = true;
                    Step::new(drv_path.to_owned())
                },
                |step| step,
            )
        } else {
            is_new = true;
            Step::new(drv_path.to_owned())
        };

        step.add_referring_data(referring_build, referring_step);
        steps.insert(drv_path.to_owned(), Arc::downgrade(&step));
        (step, is_new)
    }

    pub fn remove(&self, drv_path: &store_utils::StorePath) {
        let mut steps = self.inner.write();
        steps.remove(drv_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipe_path(tag: &str) -> store_utils::StorePath {
        store_utils::StorePath::new(&format!("{tag:a<32.32}-{tag}.drv"))
    }

    fn created_step(tag: &str) -> Arc<Step> {
        let step = Step::new(recipe_path(tag));
        step.atomic_state.set_created(true);
        step
    }

    #[test]
    fn test_deps_and_rdeps_are_symmetric() {
        let root = created_step("root");
        let leaf = created_step("leaf");

        root.add_dep(leaf.clone());
        leaf.add_referring_data(None, Some(&root));

        assert_eq!(root.get_deps_size(), 1);
        let mut builds = HashSet::new();
        let mut steps = HashSet::new();
        leaf.get_dependents(&mut builds, &mut steps);
        assert!(steps.contains(&root));
    }

    #[test]
    fn test_make_rdeps_runnable_frees_dependents() {
        let root = created_step("root");
        let leaf = created_step("leaf");
        root.add_dep(leaf.clone());
        leaf.add_referring_data(None, Some(&root));

        // not finished yet, nothing to free
        assert!(leaf.make_rdeps_runnable().is_empty());

        leaf.set_finished(true);
        let runnable = leaf.make_rdeps_runnable();
        assert_eq!(runnable.len(), 1);
        assert_eq!(runnable[0].get_drv_path(), root.get_drv_path());
        assert_eq!(root.get_deps_size(), 0);
    }

    #[test]
    fn test_make_rdeps_runnable_waits_for_all_deps() {
        let root = created_step("root");
        let leaf_a = created_step("leafa");
        let leaf_b = created_step("leafb");
        root.add_dep(leaf_a.clone());
        root.add_dep(leaf_b.clone());
        leaf_a.add_referring_data(None, Some(&root));
        leaf_b.add_referring_data(None, Some(&root));

        leaf_a.set_finished(true);
        assert!(leaf_a.make_rdeps_runnable().is_empty());
        assert_eq!(root.get_deps_size(), 1);

        leaf_b.set_finished(true);
        let runnable = leaf_b.make_rdeps_runnable();
        assert_eq!(runnable.len(), 1);
    }

    #[test]
    fn test_steps_create_is_idempotent_per_path() {
        let steps = Steps::new();
        let path = recipe_path("pkg");

        let (step1, is_new1) = steps.create(&path, None, None);
        let (step2, is_new2) = steps.create(&path, None, None);

        assert!(is_new1);
        assert!(!is_new2);
        assert!(Arc::ptr_eq(&step1, &step2));
    }

    #[test]
    fn test_steps_map_holds_weak_refs() {
        let steps = Steps::new();
        let path = recipe_path("pkg");

        {
            let (_step, is_new) = steps.create(&path, None, None);
            assert!(is_new);
            assert_eq!(steps.len(), 1);
        }
        // the only strong ref is gone, the map entry must be collectable
        assert_eq!(steps.len(), 0);

        let (_step, is_new) = steps.create(&path, None, None);
        assert!(is_new);
    }
}
