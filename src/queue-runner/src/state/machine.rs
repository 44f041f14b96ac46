use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use hashbrown::HashMap;
use smallvec::SmallVec;

use db::models::BuildID;

use super::{Step, System};

/// Connection health of a machine. Repeated transient failures disable
/// the machine for a growing interval; a success resets the streak.
#[derive(Debug, Default)]
pub struct ConnectInfo {
    pub last_failure: super::AtomicDateTime,
    pub disabled_until: super::AtomicDateTime,
    pub consecutive_failures: AtomicU32,
}

impl ConnectInfo {
    fn new() -> Self {
        let epoch = jiff::Timestamp::UNIX_EPOCH;
        Self {
            last_failure: super::AtomicDateTime::new(epoch),
            disabled_until: super::AtomicDateTime::new(epoch),
            consecutive_failures: 0.into(),
        }
    }
}

#[derive(Debug)]
pub struct Stats {
    current_jobs: AtomicU64,
    nr_steps_done: AtomicU64,
    failed_steps: AtomicU64,
    succeeded_steps: AtomicU64,
    total_step_time_ms: AtomicU64,
    idle_since: std::sync::atomic::AtomicI64,

    pub connect_info: ConnectInfo,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            current_jobs: 0.into(),
            nr_steps_done: 0.into(),
            failed_steps: 0.into(),
            succeeded_steps: 0.into(),
            total_step_time_ms: 0.into(),
            idle_since: (jiff::Timestamp::now().as_second()).into(),
            connect_info: ConnectInfo::new(),
        }
    }

    fn store_current_jobs(&self, c: u64) {
        if c == 0 {
            self.idle_since
                .store(jiff::Timestamp::now().as_second(), Ordering::Relaxed);
        } else {
            self.idle_since.store(0, Ordering::Relaxed);
        }

        self.current_jobs.store(c, Ordering::Relaxed);
    }

    pub fn get_current_jobs(&self) -> u64 {
        self.current_jobs.load(Ordering::Relaxed)
    }

    pub fn get_nr_steps_done(&self) -> u64 {
        self.nr_steps_done.load(Ordering::Relaxed)
    }

    pub fn get_failed_steps(&self) -> u64 {
        self.failed_steps.load(Ordering::Relaxed)
    }

    pub fn get_succeeded_steps(&self) -> u64 {
        self.succeeded_steps.load(Ordering::Relaxed)
    }

    pub fn get_total_step_time_ms(&self) -> u64 {
        self.total_step_time_ms.load(Ordering::Relaxed)
    }

    pub fn get_idle_since(&self) -> i64 {
        self.idle_since.load(Ordering::Relaxed)
    }

    pub fn track_step_success(&self, total_step_time: u64) {
        self.succeeded_steps.fetch_add(1, Ordering::Relaxed);
        self.nr_steps_done.fetch_add(1, Ordering::Relaxed);
        self.total_step_time_ms
            .fetch_add(total_step_time, Ordering::Relaxed);
        self.connect_info
            .consecutive_failures
            .store(0, Ordering::Relaxed);
    }

    pub fn track_step_failure(&self, total_step_time: u64) {
        self.failed_steps.fetch_add(1, Ordering::Relaxed);
        self.nr_steps_done.fetch_add(1, Ordering::Relaxed);
        self.total_step_time_ms
            .fetch_add(total_step_time, Ordering::Relaxed);
    }

    /// Penalise the machine after a transient failure: back off with the
    /// given base/factor, capped.
    pub fn penalise(&self, interval: f32, backoff: f32, cap: jiff::SignedDuration) {
        let now = jiff::Timestamp::now();
        self.connect_info.last_failure.store(now);
        let failures = self
            .connect_info
            .consecutive_failures
            .fetch_add(1, Ordering::Relaxed)
            + 1;

        #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
        let delta = (interval * backoff.powi(i32::try_from(failures.saturating_sub(1)).unwrap_or(i32::MAX))) as i64;
        let delta = jiff::SignedDuration::from_secs(delta).min(cap);
        self.connect_info.disabled_until.store(now + delta);
    }
}

/// A job currently executing on a machine, kept for the status dump.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningJob {
    pub drv_path: store_utils::StorePath,
    pub build_id: BuildID,
    pub step_nr: i32,
    pub since: jiff::Timestamp,
}

#[derive(Debug)]
pub struct Machine {
    pub ssh_name: String,
    pub ssh_key: Option<String>,
    pub systems: SmallVec<[System; 4]>,
    pub supported_features: SmallVec<[String; 8]>,
    pub mandatory_features: SmallVec<[String; 4]>,
    pub max_jobs: u32,
    pub speed_factor: f32,
    pub public_host_key: Option<String>,
    pub enabled: bool,

    pub stats: Arc<Stats>,
    pub jobs: parking_lot::RwLock<Vec<RunningJob>>,
    // One outbound closure transfer at a time per machine.
    send_lock: Arc<tokio::sync::Mutex<()>>,
}

impl std::fmt::Display for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Machine: [ssh_name={} systems={:?} max_jobs={} speed_factor={:.2} supported_features={:?} mandatory_features={:?}]",
            self.ssh_name,
            self.systems,
            self.max_jobs,
            self.speed_factor,
            self.supported_features,
            self.mandatory_features,
        )
    }
}

impl Machine {
    #[must_use]
    pub fn new(
        ssh_name: String,
        ssh_key: Option<String>,
        systems: SmallVec<[System; 4]>,
        supported_features: SmallVec<[String; 8]>,
        mandatory_features: SmallVec<[String; 4]>,
        max_jobs: u32,
        speed_factor: f32,
        public_host_key: Option<String>,
    ) -> Self {
        Self {
            ssh_name,
            ssh_key,
            systems,
            supported_features,
            mandatory_features,
            max_jobs,
            speed_factor,
            public_host_key,
            enabled: true,
            stats: Arc::new(Stats::new()),
            jobs: parking_lot::RwLock::new(Vec::new()),
            send_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn send_lock(&self) -> Arc<tokio::sync::Mutex<()>> {
        self.send_lock.clone()
    }

    /// Capability check, independent of the machine's current load or
    /// health:
    /// - the step's platform must be among the declared systems;
    /// - every mandatory feature must be required by the step, or be
    ///   "local" while the step prefers local builds;
    /// - every required feature must be supported.
    #[must_use]
    pub fn supports(
        &self,
        platform: &str,
        required_features: &[String],
        prefer_local: bool,
    ) -> bool {
        if !self.systems.iter().any(|s| s == platform) {
            return false;
        }
        for f in &self.mandatory_features {
            if !required_features.contains(f) && !(prefer_local && f == "local") {
                return false;
            }
        }
        required_features
            .iter()
            .all(|f| self.supported_features.contains(f))
    }

    #[must_use]
    pub fn supports_step(&self, step: &Arc<Step>) -> bool {
        let Some(platform) = step.get_platform() else {
            return false;
        };
        self.supports(
            &platform,
            &step.get_required_features(),
            step.get_prefer_local(),
        )
    }

    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.stats.get_current_jobs() < u64::from(self.max_jobs)
    }

    #[must_use]
    pub fn is_available(&self, now: jiff::Timestamp) -> bool {
        self.enabled && self.stats.connect_info.disabled_until.load() <= now
    }

    pub fn insert_job(&self, job: RunningJob) {
        let mut jobs = self.jobs.write();
        jobs.push(job);
    }

    pub fn remove_job(&self, drv: &store_utils::StorePath) {
        let mut jobs = self.jobs.write();
        jobs.retain(|j| &j.drv_path != drv);
    }

    pub fn clone_jobs(&self) -> Vec<RunningJob> {
        self.jobs.read().clone()
    }
}

/// The machine registry. The map is read-mostly and replaced wholesale
/// when the machines file changes; reservations keep removed machines
/// alive until drained.
pub struct Machines {
    inner: arc_swap::ArcSwap<HashMap<String, Arc<Machine>>>,
}

impl Default for Machines {
    fn default() -> Self {
        Self::new()
    }
}

impl Machines {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: arc_swap::ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Swap in a freshly parsed machines list. Stats (including the
    /// connect-info backoff) carry over for machines that are still
    /// present under the same name.
    #[tracing::instrument(skip(self, machines))]
    pub fn replace(&self, machines: Vec<Machine>) {
        let old = self.inner.load();
        let mut new_map = HashMap::with_capacity(machines.len());
        for mut m in machines {
            if let Some(prev) = old.get(&m.ssh_name) {
                m.stats = prev.stats.clone();
                m.send_lock = prev.send_lock.clone();
                *m.jobs.write() = prev.clone_jobs();
            }
            new_map.insert(m.ssh_name.clone(), Arc::new(m));
        }
        self.inner.store(Arc::new(new_map));
    }

    #[must_use]
    pub fn get_machine(&self, ssh_name: &str) -> Option<Arc<Machine>> {
        self.inner.load().get(ssh_name).cloned()
    }

    #[must_use]
    pub fn get_all_machines(&self) -> Vec<Arc<Machine>> {
        self.inner.load().values().cloned().collect()
    }

    #[must_use]
    pub fn get_machine_count(&self) -> usize {
        self.inner.load().len()
    }

    #[must_use]
    pub fn get_machine_count_in_use(&self) -> usize {
        self.inner
            .load()
            .values()
            .filter(|m| m.stats.get_current_jobs() > 0)
            .count()
    }

    #[must_use]
    pub fn get_supported_features(&self) -> Vec<String> {
        let mut features: Vec<String> = self
            .inner
            .load()
            .values()
            .flat_map(|m| m.supported_features.iter().cloned())
            .collect();
        features.sort_unstable();
        features.dedup();
        features
    }

    /// Whether any registered machine is declared capable of the step.
    /// Disabled or busy machines still count: support is about declared
    /// capabilities, not momentary health.
    #[must_use]
    pub fn support_step(&self, step: &Arc<Step>) -> bool {
        self.inner
            .load()
            .values()
            .any(|m| m.supports_step(step))
    }

    /// Pick the best machine able to run the step right now: declared
    /// capable, enabled, not in a disabled-until window, below its job
    /// cap. Preference: highest speed factor, then lowest current load,
    /// then lexicographic name.
    #[must_use]
    pub fn select_machine(&self, step: &Arc<Step>, now: jiff::Timestamp) -> Option<Arc<Machine>> {
        let map = self.inner.load();
        let mut best: Option<&Arc<Machine>> = None;
        for m in map.values() {
            if !m.is_available(now) || !m.has_capacity() || !m.supports_step(step) {
                continue;
            }
            best = match best {
                None => Some(m),
                Some(b) => {
                    let ord = m
                        .speed_factor
                        .total_cmp(&b.speed_factor)
                        .then_with(|| {
                            b.stats
                                .get_current_jobs()
                                .cmp(&m.stats.get_current_jobs())
                        })
                        .then_with(|| b.ssh_name.cmp(&m.ssh_name));
                    if ord == std::cmp::Ordering::Greater {
                        Some(m)
                    } else {
                        Some(b)
                    }
                }
            };
        }
        best.cloned()
    }

    /// The earliest point at which a currently disabled machine becomes
    /// available again, for the dispatcher's wake computation.
    #[must_use]
    pub fn earliest_disabled_until(&self, now: jiff::Timestamp) -> Option<jiff::Timestamp> {
        self.inner
            .load()
            .values()
            .map(|m| m.stats.connect_info.disabled_until.load())
            .filter(|t| *t > now)
            .min()
    }
}

/// Resource-acquisition token tying a step to a machine for the duration
/// of a remote build. Creating it takes one slot on the machine; dropping
/// it releases the slot. The strong step reference is what keeps a step
/// alive while it executes.
pub struct MachineReservation {
    pub id: uuid::Uuid,
    pub step: Arc<Step>,
    pub machine: Arc<Machine>,
}

impl MachineReservation {
    #[must_use]
    pub fn new(step: Arc<Step>, machine: Arc<Machine>) -> Self {
        let jobs = machine.stats.get_current_jobs() + 1;
        machine.stats.store_current_jobs(jobs);
        Self {
            id: uuid::Uuid::new_v4(),
            step,
            machine,
        }
    }
}

impl Drop for MachineReservation {
    fn drop(&mut self) {
        let jobs = self.machine.stats.get_current_jobs().saturating_sub(1);
        self.machine.stats.store_current_jobs(jobs);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    pub(super) fn test_machine(ssh_name: &str, systems: &[&str], max_jobs: u32) -> Machine {
        Machine::new(
            ssh_name.into(),
            None,
            systems.iter().map(|s| (*s).to_string()).collect(),
            SmallVec::new(),
            SmallVec::new(),
            max_jobs,
            1.0,
            None,
        )
    }

    fn test_step(platform: &str, features: &[&str]) -> Arc<Step> {
        let step = Step::new(store_utils::StorePath::new(
            "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-pkg.drv",
        ));
        step.set_drv(store_utils::Derivation {
            name: step.get_drv_path().clone(),
            platform: platform.into(),
            required_features: features.iter().map(|s| (*s).to_string()).collect(),
            prefer_local: false,
            input_drvs: smallvec::SmallVec::new(),
            outputs: smallvec::SmallVec::new(),
        });
        step
    }

    #[test]
    fn test_supports_platform() {
        let m = test_machine("m1", &["x86_64-linux"], 1);
        assert!(m.supports("x86_64-linux", &[], false));
        assert!(!m.supports("aarch64-linux", &[], false));
    }

    #[test]
    fn test_supports_required_features() {
        let mut m = test_machine("m1", &["x86_64-linux"], 1);
        m.supported_features = ["kvm".to_string()].into_iter().collect();

        assert!(m.supports("x86_64-linux", &["kvm".into()], false));
        assert!(!m.supports("x86_64-linux", &["big-parallel".into()], false));
    }

    #[test]
    fn test_mandatory_features_restrict_machine() {
        let mut m = test_machine("m1", &["x86_64-linux"], 1);
        m.supported_features = ["benchmark".to_string()].into_iter().collect();
        m.mandatory_features = ["benchmark".to_string()].into_iter().collect();

        // mandatory feature must be required by the step
        assert!(!m.supports("x86_64-linux", &[], false));
        assert!(m.supports("x86_64-linux", &["benchmark".into()], false));
    }

    #[test]
    fn test_mandatory_local_feature_allows_prefer_local_steps() {
        let mut m = test_machine("localhost", &["builtin"], 1);
        m.mandatory_features = ["local".to_string()].into_iter().collect();

        assert!(!m.supports("builtin", &[], false));
        assert!(m.supports("builtin", &[], true));
    }

    #[test]
    fn test_select_machine_prefers_speed_factor() {
        let machines = Machines::new();
        let slow = test_machine("slow", &["x86_64-linux"], 2);
        let mut fast = test_machine("fast", &["x86_64-linux"], 2);
        fast.speed_factor = 2.0;
        machines.replace(vec![slow, fast]);

        let step = test_step("x86_64-linux", &[]);
        let selected = machines.select_machine(&step, jiff::Timestamp::now());
        assert_eq!(
            selected.map(|m| m.ssh_name.clone()),
            Some("fast".to_string())
        );
    }

    #[test]
    fn test_select_machine_ties_on_load_then_name() {
        let machines = Machines::new();
        machines.replace(vec![
            test_machine("beta", &["x86_64-linux"], 2),
            test_machine("alpha", &["x86_64-linux"], 2),
        ]);

        let step = test_step("x86_64-linux", &[]);
        let selected = machines.select_machine(&step, jiff::Timestamp::now());
        assert_eq!(
            selected.map(|m| m.ssh_name.clone()),
            Some("alpha".to_string())
        );

        // load the preferred machine, the other takes over
        let alpha = machines.get_machine("alpha").unwrap();
        let _res = MachineReservation::new(step.clone(), alpha);
        let selected = machines.select_machine(&step, jiff::Timestamp::now());
        assert_eq!(
            selected.map(|m| m.ssh_name.clone()),
            Some("beta".to_string())
        );
    }

    #[test]
    fn test_select_machine_honors_max_jobs() {
        let machines = Machines::new();
        machines.replace(vec![test_machine("m1", &["x86_64-linux"], 1)]);

        let step = test_step("x86_64-linux", &[]);
        let m1 = machines.get_machine("m1").unwrap();

        let reservation = MachineReservation::new(step.clone(), m1.clone());
        assert_eq!(m1.stats.get_current_jobs(), 1);
        assert!(machines.select_machine(&step, jiff::Timestamp::now()).is_none());

        drop(reservation);
        assert_eq!(m1.stats.get_current_jobs(), 0);
        assert!(machines.select_machine(&step, jiff::Timestamp::now()).is_some());
    }

    #[test]
    fn test_support_step_requires_declared_platform() {
        let machines = Machines::new();
        machines.replace(vec![test_machine("m1", &["x86_64-linux"], 1)]);

        assert!(machines.support_step(&test_step("x86_64-linux", &[])));
        assert!(!machines.support_step(&test_step("riscv64-linux", &[])));
        assert!(!machines.support_step(&test_step("x86_64-linux", &["kvm"])));
    }

    #[test]
    fn test_select_machine_skips_disabled_until() {
        let machines = Machines::new();
        machines.replace(vec![test_machine("m1", &["x86_64-linux"], 1)]);
        let step = test_step("x86_64-linux", &[]);
        let now = jiff::Timestamp::now();

        let m1 = machines.get_machine("m1").unwrap();
        m1.stats
            .connect_info
            .disabled_until
            .store(now + jiff::SignedDuration::from_secs(60));

        assert!(machines.select_machine(&step, now).is_none());
        // declared support is unaffected by the disable window
        assert!(machines.support_step(&step));
        // once the window has passed the machine is eligible again
        let later = now + jiff::SignedDuration::from_secs(61);
        assert!(machines.select_machine(&step, later).is_some());
    }

    #[test]
    fn test_penalise_backs_off_and_caps() {
        let stats = Stats::new();
        let cap = jiff::SignedDuration::from_secs(600);

        stats.penalise(60.0, 3.0, cap);
        let first = stats.connect_info.disabled_until.load();
        assert_eq!(
            stats.connect_info.consecutive_failures.load(Ordering::Relaxed),
            1
        );

        stats.penalise(60.0, 3.0, cap);
        let second = stats.connect_info.disabled_until.load();
        assert!(second > first);

        for _ in 0..10 {
            stats.penalise(60.0, 3.0, cap);
        }
        let capped = stats.connect_info.disabled_until.load();
        let now = jiff::Timestamp::now();
        assert!(now.duration_until(capped) <= jiff::SignedDuration::from_secs(601));

        // success clears the streak
        stats.track_step_success(0);
        assert_eq!(
            stats.connect_info.consecutive_failures.load(Ordering::Relaxed),
            0
        );
    }

    #[test]
    fn test_replace_carries_over_stats() {
        let machines = Machines::new();
        machines.replace(vec![test_machine("m1", &["x86_64-linux"], 1)]);
        let m1 = machines.get_machine("m1").unwrap();
        m1.stats.track_step_failure(100);

        machines.replace(vec![
            test_machine("m1", &["x86_64-linux", "i686-linux"], 4),
            test_machine("m2", &["aarch64-linux"], 1),
        ]);

        let m1_after = machines.get_machine("m1").unwrap();
        assert_eq!(m1_after.stats.get_failed_steps(), 1);
        assert_eq!(m1_after.max_jobs, 4);
        assert!(machines.get_machine("m2").is_some());
    }

    #[test]
    fn test_removed_machine_stays_alive_through_reservation() {
        let machines = Machines::new();
        machines.replace(vec![test_machine("m1", &["x86_64-linux"], 1)]);
        let step = test_step("x86_64-linux", &[]);
        let m1 = machines.get_machine("m1").unwrap();
        let reservation = MachineReservation::new(step, m1);

        machines.replace(vec![]);
        assert!(machines.get_machine("m1").is_none());

        // the reservation still holds the machine and its slot
        assert_eq!(reservation.machine.stats.get_current_jobs(), 1);
    }
}
