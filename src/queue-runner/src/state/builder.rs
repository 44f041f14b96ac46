use std::sync::Arc;
use std::sync::atomic::Ordering;

use hashbrown::HashSet;

use db::models::{BuildID, BuildStatus};
use store_utils::BaseStore as _;

use super::machine::{MachineReservation, RunningJob};
use super::{RemoteBuild, State, Step};
use crate::remote::BuildOptions;

/// One remote execution of a step, as tracked between the busy row insert
/// and the outcome reduction.
#[derive(Debug, Clone)]
pub struct Job {
    pub build_id: BuildID,
    pub step_nr: i32,
    pub result: RemoteBuild,
}

impl Job {
    #[must_use]
    pub fn new(build_id: BuildID) -> Self {
        Self {
            build_id,
            step_nr: 0,
            result: RemoteBuild::new(),
        }
    }
}

/// Run one reservation to completion. The reservation is owned for the
/// whole lifetime of the task; dropping it releases the machine slot and,
/// if nothing else references the step, the step itself.
#[tracing::instrument(
    skip(state, reservation),
    fields(
        drv = %reservation.step.get_drv_path(),
        machine = %reservation.machine.ssh_name,
        reservation = %reservation.id,
    ),
)]
pub(super) async fn run_builder(state: Arc<State>, reservation: MachineReservation) {
    let step = reservation.step.clone();
    let machine = reservation.machine.clone();
    let drv_path = step.get_drv_path().clone();

    let build_options = {
        let mut dependents = HashSet::new();
        let mut steps = HashSet::new();
        step.get_dependents(&mut dependents, &mut steps);

        if dependents.is_empty() {
            // All builds that depend on this step are gone, most likely
            // cancelled. A new build may just have created a reference,
            // so requeue the step; if there really are no strong
            // pointers left it dies with this reservation.
            tracing::info!("maybe cancelling build step {drv_path}");
            state.runnable.insert(&step);
            drop(reservation);
            state.trigger_dispatch();
            return;
        }

        let Some(build) = dependents
            .iter()
            .find(|b| b.drv_path == drv_path)
            .or_else(|| dependents.iter().next())
            .cloned()
        else {
            return;
        };

        // Use the largest limits of any dependent build, otherwise a
        // shared step could inherit a much too small timeout from an
        // unrelated quick build.
        let max_silent_time = dependents
            .iter()
            .map(|x| x.max_silent_time)
            .max()
            .unwrap_or(build.max_silent_time);
        let build_timeout = dependents
            .iter()
            .map(|x| x.timeout)
            .max()
            .unwrap_or(build.timeout);

        (
            build.id,
            BuildOptions {
                max_silent_time,
                build_timeout,
                max_log_size: state.config.get_max_log_size(),
            },
        )
    };
    let (build_id, opts) = build_options;

    let mut job = Job::new(build_id);
    job.result.set_start_time_now();

    if state.check_cached_failure(&step).await {
        job.result.step_status = BuildStatus::CachedFailure;
        job.result.set_stop_time_now();
        if let Err(e) = state
            .fail_job_and_dependents(&drv_path, None, job, step.clone())
            .await
        {
            tracing::error!("Failed to fail cached-failure step drv={drv_path} e={e}");
        }
        drop(reservation);
        state.trigger_dispatch();
        return;
    }

    let log_file = match state.construct_log_file_path(&drv_path).await {
        Ok(v) => v,
        Err(e) => {
            tracing::error!("Failed to construct log file path for {drv_path}: {e}");
            state.runnable.insert(&step);
            drop(reservation);
            state.trigger_dispatch();
            return;
        }
    };
    log_file
        .to_string_lossy()
        .to_string()
        .clone_into(&mut job.result.log_file);

    // Phase 1: record the start as a busy build-step row.
    job.step_nr = {
        let step_nr = async {
            let mut db = state.db.get().await?;
            let mut tx = db.begin_transaction().await?;
            let step_nr = tx
                .create_build_step(
                    Some(job.result.get_start_time_as_i32()?),
                    build_id,
                    &state.store.print_store_path(&drv_path),
                    step.get_system_type().as_deref(),
                    machine.ssh_name.clone(),
                    BuildStatus::Busy,
                    None,
                    None,
                    step.get_outputs()
                        .unwrap_or_default()
                        .into_iter()
                        .map(|o| (o.name, o.path.map(|p| state.store.print_store_path(&p))))
                        .collect(),
                )
                .await?;
            tx.commit().await?;
            Ok::<_, anyhow::Error>(step_nr)
        }
        .await;
        match step_nr {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("Failed to create build step row for {drv_path}: {e}");
                state.runnable.insert(&step);
                drop(reservation);
                state.trigger_dispatch();
                return;
            }
        }
    };

    tracing::info!(
        "Submitting build drv={drv_path} machine={} build_id={build_id} step_nr={}",
        machine.ssh_name,
        job.step_nr
    );
    machine.insert_job(RunningJob {
        drv_path: drv_path.clone(),
        build_id,
        step_nr: job.step_nr,
        since: jiff::Timestamp::now(),
    });
    if let Ok(mut conn) = state.db.get().await {
        let _ = conn
            .update_build_step(db::models::UpdateBuildStep {
                build_id,
                step_nr: job.step_nr,
                status: db::models::StepStatus::Building,
            })
            .await;
    }
    state.metrics.nr_steps_started.inc();
    state.metrics.nr_steps_building.add(1);

    // Phase 2: the remote build itself; the protocol is behind the
    // RemoteBuilder interface.
    let build_result = state
        .remote_builder
        .build(&machine, &step, &log_file, &opts)
        .await;
    state.metrics.nr_steps_building.sub(1);
    machine.remove_job(&drv_path);

    // Phase 3: classify the result.
    let finished = match build_result {
        Ok(res) => {
            job.result.set_times(res.start_time, res.stop_time);
            job.result.set_overhead(res.overhead);
            job.result.step_status = res.outcome.step_status();
            job.result.can_retry = res.outcome.is_retryable();
            job.result.can_cache = matches!(
                res.outcome,
                crate::remote::RemoteBuildOutcome::PermanentFailure
                    | crate::remote::RemoteBuildOutcome::OutputRejected
            );
            job.result.error_msg = res.error_msg;
            if res.outcome.is_retryable() {
                FinishKind::Retryable
            } else if res.outcome == crate::remote::RemoteBuildOutcome::Success {
                FinishKind::Success {
                    failed_with_output: res.failed_with_output,
                }
            } else {
                FinishKind::Terminal
            }
        }
        Err(e) => {
            // Could not even drive the protocol; infrastructural, retry.
            tracing::warn!("Remote build of {drv_path} on {} failed: {e}", machine.ssh_name);
            job.result.step_status = BuildStatus::Cancelled;
            job.result.can_retry = true;
            job.result.error_msg = Some(e.to_string());
            job.result.set_stop_time_now();
            FinishKind::Retryable
        }
    };

    let total_step_time = job.result.get_total_step_time_ms();
    match finished {
        FinishKind::Success { failed_with_output } => {
            machine.stats.track_step_success(total_step_time);
            if let Err(e) = state
                .succeed_step(&machine, &step, job, failed_with_output)
                .await
            {
                tracing::error!("Failed to apply step success drv={drv_path} e={e}");
            }
        }
        FinishKind::Retryable => {
            machine.stats.track_step_failure(total_step_time);
            state
                .retry_or_fail_step(&machine, &step, job)
                .await;
        }
        FinishKind::Terminal => {
            machine.stats.track_step_failure(total_step_time);
            if let Err(e) = state
                .fail_job_and_dependents(&drv_path, Some(machine.clone()), job, step.clone())
                .await
            {
                tracing::error!("Failed to apply step failure drv={drv_path} e={e}");
            }
        }
    }

    // Phase 4: release. The reservation drop frees the machine slot; the
    // dispatcher may have work for it right away.
    drop(reservation);
    state.trigger_dispatch();
}

enum FinishKind {
    Success { failed_with_output: bool },
    Retryable,
    Terminal,
}

impl State {
    /// Retry bookkeeping for a transiently failed step: bump `tries`,
    /// compute the next attempt time with exponential backoff and requeue,
    /// or convert to a terminal failure once the budget is exhausted.
    /// The machine is penalised either way.
    #[tracing::instrument(skip(self, machine, step, job), fields(drv = %step.get_drv_path()))]
    pub(super) async fn retry_or_fail_step(
        &self,
        machine: &Arc<super::Machine>,
        step: &Arc<Step>,
        mut job: Job,
    ) {
        let drv_path = step.get_drv_path().clone();
        let (max_retries, retry_interval, retry_backoff) = self.config.get_retry();

        machine
            .stats
            .penalise(retry_interval, retry_backoff, self.config.get_max_machine_disable());

        let tries = step.atomic_state.tries.fetch_add(1, Ordering::Relaxed) + 1;
        if tries < max_retries {
            self.metrics.nr_retries.inc();
            if i64::from(tries) > self.metrics.max_nr_retries.get() {
                self.metrics.max_nr_retries.set(i64::from(tries));
            }

            let delta = retry_delay_seconds(tries, retry_interval, retry_backoff);
            tracing::info!("will retry '{drv_path}' after {delta}s");
            step.set_after(jiff::Timestamp::now() + jiff::SignedDuration::from_secs(delta));

            if let Err(e) = crate::utils::finish_build_step(
                &self.db,
                job.build_id,
                job.step_nr,
                &job.result,
                Some(machine.ssh_name.clone()),
            )
            .await
            {
                tracing::error!("Failed to record retried build step drv={drv_path} e={e}");
            }

            self.runnable.insert(step);
            self.trigger_dispatch();
            return;
        }

        // Retry budget exhausted: this is now a permanent failure.
        tracing::warn!("step '{drv_path}' failed after {tries} tries, giving up");
        job.result.can_retry = false;
        job.result.step_status = BuildStatus::Failed;
        if let Err(e) = self
            .fail_job_and_dependents(&drv_path, Some(machine.clone()), job, step.clone())
            .await
        {
            tracing::error!("Failed to apply step failure drv={drv_path} e={e}");
        }
    }
}

/// Delay before the n-th retry (1-based): interval·backoff^(n−1).
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn retry_delay_seconds(tries: u32, interval: f32, backoff: f32) -> i64 {
    (interval * backoff.powi(i32::try_from(tries.saturating_sub(1)).unwrap_or(i32::MAX))) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_backs_off_exponentially() {
        assert_eq!(retry_delay_seconds(1, 60.0, 3.0), 60);
        assert_eq!(retry_delay_seconds(2, 60.0, 3.0), 180);
        assert_eq!(retry_delay_seconds(3, 60.0, 3.0), 540);
        assert_eq!(retry_delay_seconds(4, 60.0, 3.0), 1620);
    }
}
