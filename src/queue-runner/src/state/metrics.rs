use std::sync::Arc;

use prometheus::Encoder as _;

pub struct PromMetrics {
    registry: prometheus::Registry,

    pub queue_checks_started: prometheus::IntCounter,
    pub queue_build_loads: prometheus::IntCounter,
    pub queue_steps_created: prometheus::IntCounter,
    pub queue_checks_early_exits: prometheus::IntCounter,
    pub queue_checks_finished: prometheus::IntCounter,

    pub dispatcher_time_spent_running: prometheus::IntCounter,
    pub dispatcher_time_spent_waiting: prometheus::IntCounter,

    pub queue_monitor_time_spent_running: prometheus::IntCounter,
    pub queue_monitor_time_spent_waiting: prometheus::IntCounter,

    pub nr_builds_read: prometheus::IntCounter,
    pub nr_builds_done: prometheus::IntCounter,
    pub nr_steps_started: prometheus::IntCounter,
    pub nr_steps_done: prometheus::IntCounter,
    pub nr_steps_building: prometheus::IntGauge,
    pub nr_steps_runnable: prometheus::IntGauge,
    pub nr_steps_waiting: prometheus::IntGauge,
    pub nr_steps_disabled: prometheus::IntGauge,
    pub nr_unsupported_steps: prometheus::IntGauge,
    pub nr_unsupported_steps_aborted: prometheus::IntCounter,
    pub nr_retries: prometheus::IntCounter,
    pub max_nr_retries: prometheus::IntGauge,
    pub nr_queue_wakeups: prometheus::IntCounter,
    pub nr_dispatcher_wakeups: prometheus::IntCounter,
    pub dispatch_time_ms: prometheus::IntCounter,
    pub nr_logs_compressed: prometheus::IntCounter,
    pub nr_notifications_sent: prometheus::IntCounter,
    pub machines_total: prometheus::IntGauge,
    pub machines_in_use: prometheus::IntGauge,

    // The per-system-type gauges are the signal an external autoscaler
    // consumes; the dispatcher itself never scales anything.
    pub runnable_per_system_type: prometheus::IntGaugeVec,
    pub running_per_system_type: prometheus::IntGaugeVec,
    pub wait_time_per_system_type: prometheus::IntGaugeVec,
}

macro_rules! int_counter {
    ($name:expr, $help:expr) => {
        prometheus::IntCounter::with_opts(prometheus::Opts::new($name, $help))
    };
}

macro_rules! int_gauge {
    ($name:expr, $help:expr) => {
        prometheus::IntGauge::with_opts(prometheus::Opts::new($name, $help))
    };
}

impl PromMetrics {
    #[allow(clippy::too_many_lines)]
    #[tracing::instrument(err)]
    pub fn new() -> anyhow::Result<Self> {
        let queue_checks_started = int_counter!(
            "forgequeuerunner_queue_checks_started_total",
            "Number of times the queue monitor started reading new builds"
        )?;
        let queue_build_loads = int_counter!(
            "forgequeuerunner_queue_build_loads_total",
            "Number of builds loaded"
        )?;
        let queue_steps_created = int_counter!(
            "forgequeuerunner_queue_steps_created_total",
            "Number of steps created"
        )?;
        let queue_checks_early_exits = int_counter!(
            "forgequeuerunner_queue_checks_early_exits_total",
            "Number of times a queue check yielded early to potential bumps"
        )?;
        let queue_checks_finished = int_counter!(
            "forgequeuerunner_queue_checks_finished_total",
            "Number of times a queue check ran to completion"
        )?;
        let dispatcher_time_spent_running = int_counter!(
            "forgequeuerunner_dispatcher_time_spent_running_total",
            "Time (in micros) spent running the dispatcher"
        )?;
        let dispatcher_time_spent_waiting = int_counter!(
            "forgequeuerunner_dispatcher_time_spent_waiting_total",
            "Time (in micros) spent waiting for dispatcher work"
        )?;
        let queue_monitor_time_spent_running = int_counter!(
            "forgequeuerunner_monitor_time_spent_running_total",
            "Time (in micros) spent running the queue monitor"
        )?;
        let queue_monitor_time_spent_waiting = int_counter!(
            "forgequeuerunner_monitor_time_spent_waiting_total",
            "Time (in micros) spent waiting for queue events"
        )?;
        let nr_builds_read = int_counter!(
            "forgequeuerunner_builds_read_total",
            "Number of builds read from the queue"
        )?;
        let nr_builds_done = int_counter!(
            "forgequeuerunner_builds_finished_total",
            "Number of builds finalised"
        )?;
        let nr_steps_started = int_counter!(
            "forgequeuerunner_steps_started_total",
            "Number of steps dispatched to a machine"
        )?;
        let nr_steps_done = int_counter!(
            "forgequeuerunner_steps_finished_total",
            "Number of steps that reached a terminal state"
        )?;
        let nr_steps_building =
            int_gauge!("forgequeuerunner_steps_building", "Steps currently building")?;
        let nr_steps_runnable =
            int_gauge!("forgequeuerunner_steps_runnable", "Steps in the runnable set")?;
        let nr_steps_waiting = int_gauge!(
            "forgequeuerunner_steps_waiting",
            "Runnable steps with no machine available"
        )?;
        let nr_steps_disabled = int_gauge!(
            "forgequeuerunner_steps_disabled",
            "Runnable steps waiting out their retry delay"
        )?;
        let nr_unsupported_steps = int_gauge!(
            "forgequeuerunner_steps_unsupported",
            "Runnable steps no registered machine can build"
        )?;
        let nr_unsupported_steps_aborted = int_counter!(
            "forgequeuerunner_steps_unsupported_aborted_total",
            "Steps failed at expansion because no registered machine supports them"
        )?;
        let nr_retries =
            int_counter!("forgequeuerunner_steps_retries_total", "Step retries scheduled")?;
        let max_nr_retries = int_gauge!(
            "forgequeuerunner_steps_max_retries",
            "Largest retry count of any step"
        )?;
        let nr_queue_wakeups = int_counter!(
            "forgequeuerunner_monitor_wakeups_total",
            "Queue monitor wakeups"
        )?;
        let nr_dispatcher_wakeups = int_counter!(
            "forgequeuerunner_dispatch_wakeups_total",
            "Dispatcher wakeups"
        )?;
        let dispatch_time_ms = int_counter!(
            "forgequeuerunner_dispatch_time_ms_total",
            "Total time (ms) spent in dispatch passes"
        )?;
        let nr_logs_compressed = int_counter!(
            "forgequeuerunner_logs_compressed_total",
            "Step logs compressed"
        )?;
        let nr_notifications_sent = int_counter!(
            "forgequeuerunner_notifications_sent_total",
            "Build-finished notifications sent"
        )?;
        let machines_total =
            int_gauge!("forgequeuerunner_machines_total", "Registered machines")?;
        let machines_in_use = int_gauge!(
            "forgequeuerunner_machines_in_use",
            "Machines with at least one running job"
        )?;

        let runnable_per_system_type = prometheus::IntGaugeVec::new(
            prometheus::Opts::new(
                "forgequeuerunner_system_type_runnable",
                "Runnable steps per system type",
            ),
            &["system_type"],
        )?;
        let running_per_system_type = prometheus::IntGaugeVec::new(
            prometheus::Opts::new(
                "forgequeuerunner_system_type_running",
                "Running steps per system type",
            ),
            &["system_type"],
        )?;
        let wait_time_per_system_type = prometheus::IntGaugeVec::new(
            prometheus::Opts::new(
                "forgequeuerunner_system_type_wait_time_ms",
                "Aggregate wait time (ms) of runnable steps per system type",
            ),
            &["system_type"],
        )?;

        let registry = prometheus::Registry::new();
        registry.register(Box::new(queue_checks_started.clone()))?;
        registry.register(Box::new(queue_build_loads.clone()))?;
        registry.register(Box::new(queue_steps_created.clone()))?;
        registry.register(Box::new(queue_checks_early_exits.clone()))?;
        registry.register(Box::new(queue_checks_finished.clone()))?;
        registry.register(Box::new(dispatcher_time_spent_running.clone()))?;
        registry.register(Box::new(dispatcher_time_spent_waiting.clone()))?;
        registry.register(Box::new(queue_monitor_time_spent_running.clone()))?;
        registry.register(Box::new(queue_monitor_time_spent_waiting.clone()))?;
        registry.register(Box::new(nr_builds_read.clone()))?;
        registry.register(Box::new(nr_builds_done.clone()))?;
        registry.register(Box::new(nr_steps_started.clone()))?;
        registry.register(Box::new(nr_steps_done.clone()))?;
        registry.register(Box::new(nr_steps_building.clone()))?;
        registry.register(Box::new(nr_steps_runnable.clone()))?;
        registry.register(Box::new(nr_steps_waiting.clone()))?;
        registry.register(Box::new(nr_steps_disabled.clone()))?;
        registry.register(Box::new(nr_unsupported_steps.clone()))?;
        registry.register(Box::new(nr_unsupported_steps_aborted.clone()))?;
        registry.register(Box::new(nr_retries.clone()))?;
        registry.register(Box::new(max_nr_retries.clone()))?;
        registry.register(Box::new(nr_queue_wakeups.clone()))?;
        registry.register(Box::new(nr_dispatcher_wakeups.clone()))?;
        registry.register(Box::new(dispatch_time_ms.clone()))?;
        registry.register(Box::new(nr_logs_compressed.clone()))?;
        registry.register(Box::new(nr_notifications_sent.clone()))?;
        registry.register(Box::new(machines_total.clone()))?;
        registry.register(Box::new(machines_in_use.clone()))?;
        registry.register(Box::new(runnable_per_system_type.clone()))?;
        registry.register(Box::new(running_per_system_type.clone()))?;
        registry.register(Box::new(wait_time_per_system_type.clone()))?;

        Ok(Self {
            registry,
            queue_checks_started,
            queue_build_loads,
            queue_steps_created,
            queue_checks_early_exits,
            queue_checks_finished,
            dispatcher_time_spent_running,
            dispatcher_time_spent_waiting,
            queue_monitor_time_spent_running,
            queue_monitor_time_spent_waiting,
            nr_builds_read,
            nr_builds_done,
            nr_steps_started,
            nr_steps_done,
            nr_steps_building,
            nr_steps_runnable,
            nr_steps_waiting,
            nr_steps_disabled,
            nr_unsupported_steps,
            nr_unsupported_steps_aborted,
            nr_retries,
            max_nr_retries,
            nr_queue_wakeups,
            nr_dispatcher_wakeups,
            dispatch_time_ms,
            nr_logs_compressed,
            nr_notifications_sent,
            machines_total,
            machines_in_use,
            runnable_per_system_type,
            running_per_system_type,
            wait_time_per_system_type,
        })
    }

    /// Refresh the gauges that are derived from shared state rather than
    /// incremented along the way.
    pub fn refresh_dynamic_metrics(&self, state: &Arc<super::State>) {
        #[allow(clippy::cast_possible_wrap)]
        self.nr_steps_runnable.set(state.runnable.len() as i64);
        #[allow(clippy::cast_possible_wrap)]
        self.machines_total
            .set(state.machines.get_machine_count() as i64);
        #[allow(clippy::cast_possible_wrap)]
        self.machines_in_use
            .set(state.machines.get_machine_count_in_use() as i64);

        for (system_type, info) in state.system_types.snapshot() {
            #[allow(clippy::cast_possible_wrap)]
            self.runnable_per_system_type
                .with_label_values(&[&system_type])
                .set(info.runnable as i64);
            #[allow(clippy::cast_possible_wrap)]
            self.running_per_system_type
                .with_label_values(&[&system_type])
                .set(info.running as i64);
            #[allow(clippy::cast_possible_wrap)]
            self.wait_time_per_system_type
                .with_label_values(&[&system_type])
                .set(info.wait_time_ms as i64);
        }
    }

    #[tracing::instrument(skip(self, state), err)]
    pub fn gather_metrics(&self, state: &Arc<super::State>) -> anyhow::Result<String> {
        self.refresh_dynamic_metrics(state);

        let mut buffer = vec![];
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
