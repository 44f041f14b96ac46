use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use hashbrown::{HashMap, HashSet};

use super::{Jobset, JobsetID, Step};
use db::models::{BuildID, BuildStatus};

#[derive(Debug)]
pub struct Build {
    pub id: BuildID,
    pub drv_path: store_utils::StorePath,
    pub jobset_id: JobsetID,
    pub name: String,
    pub timestamp: jiff::Timestamp,
    pub max_silent_time: i32,
    pub timeout: i32,
    pub local_priority: i32,
    pub global_priority: AtomicI32,

    toplevel: arc_swap::ArcSwapOption<Step>,
    pub jobset: Arc<Jobset>,

    finished_in_db: AtomicBool,
}

impl PartialEq for Build {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Build {}

impl std::hash::Hash for Build {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Build {
    #[tracing::instrument(skip(v, jobset), err)]
    pub fn new(v: db::models::Build, jobset: Arc<Jobset>) -> anyhow::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            id: v.id,
            drv_path: store_utils::StorePath::new(&v.drvpath),
            jobset_id: v.jobset_id,
            name: v.job,
            timestamp: jiff::Timestamp::from_second(v.timestamp)?,
            max_silent_time: v.maxsilent.unwrap_or(3600),
            timeout: v.timeout.unwrap_or(36000),
            local_priority: v.priority,
            global_priority: v.globalpriority.into(),
            toplevel: arc_swap::ArcSwapOption::from(None),
            jobset,
            finished_in_db: false.into(),
        }))
    }

    #[inline]
    pub fn full_job_name(&self) -> String {
        format!(
            "{}:{}:{}",
            self.jobset.project_name, self.jobset.name, self.name
        )
    }

    #[inline]
    pub fn get_finished_in_db(&self) -> bool {
        self.finished_in_db.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn set_finished_in_db(&self, v: bool) {
        self.finished_in_db.store(v, Ordering::SeqCst);
    }

    #[inline]
    pub fn set_toplevel_step(&self, step: Arc<Step>) {
        self.toplevel.store(Some(step));
    }

    /// Push this build's priorities, id and jobset down into every step
    /// it transitively depends on, keeping the cached min/max fields the
    /// dispatcher reads up to date.
    pub fn propagate_priorities(&self) {
        let mut queued = HashSet::new();
        let mut todo = std::collections::VecDeque::new();
        {
            let toplevel = self.toplevel.load();
            if let Some(toplevel) = toplevel.as_ref() {
                todo.push_back(toplevel.clone());
            }
        }

        while let Some(step) = todo.pop_front() {
            step.atomic_state.highest_global_priority.store(
                std::cmp::max(
                    step.atomic_state
                        .highest_global_priority
                        .load(Ordering::Relaxed),
                    self.global_priority.load(Ordering::Relaxed),
                ),
                Ordering::Relaxed,
            );
            step.atomic_state.highest_local_priority.store(
                std::cmp::max(
                    step.atomic_state
                        .highest_local_priority
                        .load(Ordering::Relaxed),
                    self.local_priority,
                ),
                Ordering::Relaxed,
            );
            step.atomic_state.lowest_build_id.store(
                std::cmp::min(
                    step.atomic_state.lowest_build_id.load(Ordering::Relaxed),
                    self.id,
                ),
                Ordering::Relaxed,
            );
            step.add_jobset(self.jobset.clone());
            for dep in step.get_all_deps_not_queued(&queued) {
                queued.insert(dep.clone());
                todo.push_back(dep);
            }
        }
    }
}

/// Result record of one remote execution of a step, as written to the
/// `buildsteps` row.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone)]
pub struct RemoteBuild {
    pub step_status: BuildStatus,
    pub can_retry: bool,           // transient and misc failures only
    pub is_cached: bool,           // outputs were already realised
    pub can_cache: bool,           // remember failed outputs in the db
    pub error_msg: Option<String>,

    start_time: Option<jiff::Timestamp>,
    stop_time: Option<jiff::Timestamp>,

    overhead: i32,
    pub log_file: String,
}

impl Default for RemoteBuild {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteBuild {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            step_status: BuildStatus::Cancelled,
            can_retry: false,
            is_cached: false,
            can_cache: false,
            error_msg: None,
            start_time: None,
            stop_time: None,
            overhead: 0,
            log_file: String::new(),
        }
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn get_total_step_time_ms(&self) -> u64 {
        if let (Some(start_time), Some(stop_time)) = (self.start_time, self.stop_time) {
            (stop_time - start_time)
                .total(jiff::Unit::Millisecond)
                .unwrap_or_default()
                .abs() as u64
        } else {
            0
        }
    }

    pub const fn set_start_and_stop(&mut self, v: jiff::Timestamp) {
        self.start_time = Some(v);
        self.stop_time = Some(v);
    }

    pub fn set_start_time_now(&mut self) {
        self.start_time = Some(jiff::Timestamp::now());
    }

    pub fn set_stop_time_now(&mut self) {
        self.stop_time = Some(jiff::Timestamp::now());
    }

    pub const fn set_times(&mut self, start: jiff::Timestamp, stop: jiff::Timestamp) {
        self.start_time = Some(start);
        self.stop_time = Some(stop);
    }

    #[must_use]
    pub const fn has_start_time(&self) -> bool {
        self.start_time.is_some()
    }

    pub fn get_start_time_as_i32(&self) -> Result<i32, std::num::TryFromIntError> {
        i32::try_from(
            self.start_time
                .map(jiff::Timestamp::as_second)
                .unwrap_or_default(),
        )
    }

    #[must_use]
    pub const fn has_stop_time(&self) -> bool {
        self.stop_time.is_some()
    }

    pub fn get_stop_time_as_i32(&self) -> Result<i32, std::num::TryFromIntError> {
        i32::try_from(
            self.stop_time
                .map(jiff::Timestamp::as_second)
                .unwrap_or_default(),
        )
    }

    pub fn get_start_time(&self) -> Option<jiff::Timestamp> {
        self.start_time
    }

    pub fn get_stop_time(&self) -> Option<jiff::Timestamp> {
        self.stop_time
    }

    #[must_use]
    pub const fn get_overhead(&self) -> Option<i32> {
        if self.overhead != 0 {
            Some(self.overhead)
        } else {
            None
        }
    }

    pub const fn set_overhead(&mut self, v: i32) {
        self.overhead = v;
    }
}

#[derive(Clone)]
pub struct Builds {
    inner: Arc<parking_lot::RwLock<HashMap<BuildID, Arc<Build>>>>,
}

impl Default for Builds {
    fn default() -> Self {
        Self::new()
    }
}

impl Builds {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(parking_lot::RwLock::new(HashMap::with_capacity(1000))),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    #[must_use]
    pub fn clone_as_io(&self) -> Vec<crate::io::Build> {
        let builds = self.inner.read();
        builds.values().map(|v| v.clone().into()).collect()
    }

    /// Reconcile with the current queue contents: builds no longer queued
    /// were cancelled or deleted out of band, bumped priorities are
    /// re-propagated. Returns the builds that disappeared.
    pub fn update_priorities(&self, curr_ids: &HashMap<BuildID, i32>) -> Vec<Arc<Build>> {
        let mut removed = Vec::new();
        let mut builds = self.inner.write();
        builds.retain(|id, build| {
            if curr_ids.contains_key(id) {
                true
            } else {
                removed.push(build.clone());
                false
            }
        });
        for (id, build) in builds.iter() {
            let Some(new_priority) = curr_ids.get(id) else {
                continue;
            };

            if build.global_priority.load(Ordering::Relaxed) < *new_priority {
                tracing::info!("priority of build {id} increased");
                build
                    .global_priority
                    .store(*new_priority, Ordering::Relaxed);
                build.propagate_priorities();
            }
        }
        removed
    }

    pub fn insert_new_build(&self, build: Arc<Build>) {
        let mut builds = self.inner.write();
        builds.insert(build.id, build);
    }

    pub fn remove_by_id(&self, id: BuildID) {
        let mut builds = self.inner.write();
        builds.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_build(id: BuildID, local_priority: i32, global_priority: i32) -> Arc<Build> {
        Arc::new(Build {
            id,
            drv_path: store_utils::StorePath::new(&format!("{id:b<32}-top.drv")),
            jobset_id: 1,
            name: "job".into(),
            timestamp: jiff::Timestamp::UNIX_EPOCH,
            max_silent_time: 3600,
            timeout: 36000,
            local_priority,
            global_priority: global_priority.into(),
            toplevel: arc_swap::ArcSwapOption::from(None),
            jobset: Arc::new(Jobset::new(1, "proj", "set")),
            finished_in_db: false.into(),
        })
    }

    #[test]
    fn test_propagate_priorities_updates_step_caches() {
        let toplevel = Step::new(store_utils::StorePath::new(
            "cccccccccccccccccccccccccccccccc-top.drv",
        ));
        let dep = Step::new(store_utils::StorePath::new(
            "dddddddddddddddddddddddddddddddd-dep.drv",
        ));
        toplevel.add_dep(dep.clone());

        let build = test_build(42, 7, 100);
        build.set_toplevel_step(toplevel.clone());
        build.propagate_priorities();

        for step in [&toplevel, &dep] {
            assert_eq!(
                step.atomic_state
                    .highest_global_priority
                    .load(Ordering::Relaxed),
                100
            );
            assert_eq!(
                step.atomic_state
                    .highest_local_priority
                    .load(Ordering::Relaxed),
                7
            );
            assert_eq!(step.atomic_state.lowest_build_id.load(Ordering::Relaxed), 42);
            assert_eq!(step.get_jobsets().len(), 1);
        }
    }

    #[test]
    fn test_propagate_priorities_keeps_maxima() {
        let toplevel = Step::new(store_utils::StorePath::new(
            "cccccccccccccccccccccccccccccccc-top.drv",
        ));

        let high = test_build(10, 50, 200);
        high.set_toplevel_step(toplevel.clone());
        high.propagate_priorities();

        let low = test_build(5, 1, 0);
        low.set_toplevel_step(toplevel.clone());
        low.propagate_priorities();

        assert_eq!(
            toplevel
                .atomic_state
                .highest_global_priority
                .load(Ordering::Relaxed),
            200
        );
        assert_eq!(
            toplevel
                .atomic_state
                .highest_local_priority
                .load(Ordering::Relaxed),
            50
        );
        // the lower id wins the FIFO tie-break cache
        assert_eq!(
            toplevel.atomic_state.lowest_build_id.load(Ordering::Relaxed),
            5
        );
    }

    #[test]
    fn test_update_priorities_reports_cancelled_builds() {
        let builds = Builds::new();
        builds.insert_new_build(test_build(1, 0, 0));
        builds.insert_new_build(test_build(2, 0, 0));

        let curr: HashMap<BuildID, i32> = [(1, 0)].into_iter().collect();
        let removed = builds.update_priorities(&curr);

        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, 2);
        assert_eq!(builds.len(), 1);
    }

    #[test]
    fn test_update_priorities_bumps_global_priority() {
        let builds = Builds::new();
        let build = test_build(1, 0, 0);
        builds.insert_new_build(build.clone());

        let curr: HashMap<BuildID, i32> = [(1, 50)].into_iter().collect();
        builds.update_priorities(&curr);

        assert_eq!(build.global_priority.load(Ordering::Relaxed), 50);
    }
}
