use std::sync::Arc;
use std::sync::atomic::Ordering;

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub systems: Vec<String>,
    pub supported_features: Vec<String>,
    pub mandatory_features: Vec<String>,
    pub max_jobs: u32,
    pub speed_factor: f32,
    pub enabled: bool,

    pub current_jobs: u64,
    pub nr_steps_done: u64,
    pub succeeded_steps: u64,
    pub failed_steps: u64,
    pub total_step_time_ms: u64,
    pub idle_since: i64,

    pub last_failure: jiff::Timestamp,
    pub disabled_until: jiff::Timestamp,
    pub consecutive_failures: u32,

    pub jobs: Vec<crate::state::RunningJob>,
}

impl From<&Arc<crate::state::Machine>> for Machine {
    fn from(m: &Arc<crate::state::Machine>) -> Self {
        Self {
            systems: m.systems.to_vec(),
            supported_features: m.supported_features.to_vec(),
            mandatory_features: m.mandatory_features.to_vec(),
            max_jobs: m.max_jobs,
            speed_factor: m.speed_factor,
            enabled: m.enabled,
            current_jobs: m.stats.get_current_jobs(),
            nr_steps_done: m.stats.get_nr_steps_done(),
            succeeded_steps: m.stats.get_succeeded_steps(),
            failed_steps: m.stats.get_failed_steps(),
            total_step_time_ms: m.stats.get_total_step_time_ms(),
            idle_since: m.stats.get_idle_since(),
            last_failure: m.stats.connect_info.last_failure.load(),
            disabled_until: m.stats.connect_info.disabled_until.load(),
            consecutive_failures: m
                .stats
                .connect_info
                .consecutive_failures
                .load(Ordering::Relaxed),
            jobs: m.clone_jobs(),
        }
    }
}
