use std::sync::Arc;

use hashbrown::HashMap;

use crate::state::SystemTypeInfo;

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueRunnerStats {
    status: &'static str,
    time: jiff::Timestamp,
    uptime: f64,
    supported_features: Vec<String>,

    build_count: usize,
    jobset_count: usize,
    step_count: usize,
    runnable_count: usize,
    system_types: HashMap<crate::state::System, SystemTypeInfo>,

    queue_checks_started: u64,
    queue_build_loads: u64,
    queue_steps_created: u64,
    queue_checks_early_exits: u64,
    queue_checks_finished: u64,

    dispatcher_time_spent_running: u64,
    dispatcher_time_spent_waiting: u64,

    queue_monitor_time_spent_running: u64,
    queue_monitor_time_spent_waiting: u64,

    nr_builds_read: u64,
    nr_builds_done: u64,
    nr_steps_started: u64,
    nr_steps_done: u64,
    nr_steps_building: i64,
    nr_steps_waiting: i64,
    nr_steps_disabled: i64,
    nr_unsupported_steps: i64,
    nr_unsupported_steps_aborted: u64,
    nr_retries: u64,
    max_nr_retries: i64,
    nr_queue_wakeups: u64,
    nr_dispatcher_wakeups: u64,
    dispatch_time_ms: u64,
    nr_logs_compressed: u64,
    nr_notifications_sent: u64,
    machines_total: i64,
    machines_in_use: i64,
}

impl QueueRunnerStats {
    pub fn new(state: &Arc<crate::state::State>) -> Self {
        let build_count = state.builds.len();
        let jobset_count = state.jobsets.len();
        let step_count = state.steps.len();
        let runnable_count = state.runnable.len();

        state.metrics.refresh_dynamic_metrics(state);

        let time = jiff::Timestamp::now();
        Self {
            status: "up",
            time,
            uptime: time
                .duration_since(state.started_at)
                .as_secs_f64(),
            supported_features: state.machines.get_supported_features(),
            build_count,
            jobset_count,
            step_count,
            runnable_count,
            system_types: state.system_types.snapshot(),
            queue_checks_started: state.metrics.queue_checks_started.get(),
            queue_build_loads: state.metrics.queue_build_loads.get(),
            queue_steps_created: state.metrics.queue_steps_created.get(),
            queue_checks_early_exits: state.metrics.queue_checks_early_exits.get(),
            queue_checks_finished: state.metrics.queue_checks_finished.get(),

            dispatcher_time_spent_running: state.metrics.dispatcher_time_spent_running.get(),
            dispatcher_time_spent_waiting: state.metrics.dispatcher_time_spent_waiting.get(),

            queue_monitor_time_spent_running: state.metrics.queue_monitor_time_spent_running.get(),
            queue_monitor_time_spent_waiting: state.metrics.queue_monitor_time_spent_waiting.get(),

            nr_builds_read: state.metrics.nr_builds_read.get(),
            nr_builds_done: state.metrics.nr_builds_done.get(),
            nr_steps_started: state.metrics.nr_steps_started.get(),
            nr_steps_done: state.metrics.nr_steps_done.get(),
            nr_steps_building: state.metrics.nr_steps_building.get(),
            nr_steps_waiting: state.metrics.nr_steps_waiting.get(),
            nr_steps_disabled: state.metrics.nr_steps_disabled.get(),
            nr_unsupported_steps: state.metrics.nr_unsupported_steps.get(),
            nr_unsupported_steps_aborted: state.metrics.nr_unsupported_steps_aborted.get(),
            nr_retries: state.metrics.nr_retries.get(),
            max_nr_retries: state.metrics.max_nr_retries.get(),
            nr_queue_wakeups: state.metrics.nr_queue_wakeups.get(),
            nr_dispatcher_wakeups: state.metrics.nr_dispatcher_wakeups.get(),
            dispatch_time_ms: state.metrics.dispatch_time_ms.get(),
            nr_logs_compressed: state.metrics.nr_logs_compressed.get(),
            nr_notifications_sent: state.metrics.nr_notifications_sent.get(),
            machines_total: state.metrics.machines_total.get(),
            machines_in_use: state.metrics.machines_in_use.get(),
        }
    }
}
