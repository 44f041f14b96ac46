mod atomic;
mod build;
mod builder;
mod jobset;
mod log_compressor;
mod machine;
mod machines_file;
mod metrics;
mod notifier;
mod runnable;
mod step;
mod step_info;

pub use atomic::AtomicDateTime;
pub use build::{Build, Builds, RemoteBuild};
pub use builder::Job;
pub use jobset::{Jobset, JobsetID, Jobsets, SCHEDULING_WINDOW};
pub use machine::{Machine, MachineReservation, Machines, RunningJob, Stats as MachineStats};
pub use machines_file::{parse_machines, read_machines_file};
pub use runnable::{Runnable, SystemTypeInfo, SystemTypes};
pub use step::{Step, Steps};
pub use step_info::StepInfo;

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Instant;

use backon::Retryable as _;
use futures::TryStreamExt as _;
use hashbrown::{HashMap, HashSet};
use secrecy::ExposeSecret as _;

use db::models::{BuildID, BuildStatus};
use store_utils::BaseStore as _;

use crate::config::{App, Cli};
use crate::remote::RemoteBuilder;

pub type System = String;

enum CreateStepResult {
    /// All outputs are already realised, no step needed.
    None,
    Valid(Arc<Step>),
    /// The derivation's outputs failed before; short-circuit the build.
    PreviousFailure(Arc<Step>),
    /// No registered machine can build the step's system type.
    Unsupported(Arc<Step>),
    /// The derivation cannot be used at all (unreadable, malformed).
    Invalid(String),
}

pub struct State {
    pub store: store_utils::LocalStore,
    pub config: App,
    pub cli: Cli,
    pub db: db::Database,

    pub machines: Machines,

    pub log_dir: std::path::PathBuf,

    pub builds: Builds,
    pub jobsets: Jobsets,
    pub steps: Steps,
    pub runnable: Runnable,
    pub system_types: SystemTypes,

    pub remote_builder: Arc<dyn RemoteBuilder>,

    pub started_at: jiff::Timestamp,

    pub metrics: metrics::PromMetrics,
    pub notify_dispatch: tokio::sync::Notify,
    pub build_one_done: tokio::sync::Notify,

    pub log_compressor: log_compressor::LogCompressor,
    pub notifier: notifier::NotificationSender,

    last_seen_build_id: AtomicI32,
}

impl State {
    #[tracing::instrument(skip(tracing_guard), err)]
    pub async fn new(tracing_guard: &forge_tracing::TracingGuard) -> anyhow::Result<Arc<Self>> {
        let cli = Cli::new();
        if cli.status {
            tracing_guard.change_log_level(forge_tracing::EnvFilter::new("error"));
        }

        let config = App::init(&cli.config_path)?;
        let log_dir = config.get_log_dir();
        let store = store_utils::LocalStore::new(config.get_store_dir());
        let db = db::Database::new(
            config.get_db_url().expose_secret(),
            config.get_max_db_connections(),
        )
        .await?;

        let _ = fs_err::tokio::create_dir_all(&log_dir).await;

        Ok(Arc::new(Self {
            store,
            cli,
            db,
            machines: Machines::new(),
            log_dir,
            builds: Builds::new(),
            jobsets: Jobsets::new(),
            steps: Steps::new(),
            runnable: Runnable::new(),
            system_types: SystemTypes::new(),
            remote_builder: Arc::new(crate::remote::SshBuilder::new()),
            started_at: jiff::Timestamp::now(),
            metrics: metrics::PromMetrics::new()?,
            notify_dispatch: tokio::sync::Notify::new(),
            build_one_done: tokio::sync::Notify::new(),
            log_compressor: log_compressor::LogCompressor::new(),
            notifier: notifier::NotificationSender::new(),
            last_seen_build_id: 0.into(),
            config,
        }))
    }

    #[tracing::instrument(skip(self, new_config), err)]
    pub fn reload_config_callback(
        &self,
        new_config: &crate::config::PreparedApp,
    ) -> anyhow::Result<()> {
        let curr_db_url = self.config.get_db_url();
        if curr_db_url.expose_secret() != new_config.db_url.expose_secret() {
            self.db
                .reconfigure_pool(new_config.db_url.expose_secret())?;
        }
        // the machines-file watcher and all duration knobs read the
        // swapped config on their next tick
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn clear_busy(&self) -> anyhow::Result<()> {
        let mut db = self.db.get().await?;
        db.clear_busy(0).await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub fn trigger_dispatch(&self) {
        self.notify_dispatch.notify_one();
    }

    #[tracing::instrument(skip(self))]
    pub(super) fn make_runnable(&self, step: &Arc<Step>) {
        step.make_runnable();
        self.runnable.insert(step);
    }

    fn maybe_finish_build_one(&self, build_id: BuildID) {
        if self.cli.build_one == Some(build_id) {
            self.build_one_done.notify_one();
        }
    }

    #[tracing::instrument(skip(self), fields(%drv), err)]
    pub(super) async fn construct_log_file_path(
        &self,
        drv: &store_utils::StorePath,
    ) -> anyhow::Result<std::path::PathBuf> {
        let mut log_file = self.log_dir.clone();
        let (dir, file) = drv.base_name().split_at(2);
        log_file.push(format!("{dir}/"));
        let _ = fs_err::tokio::create_dir_all(&log_file).await;
        log_file.push(file);
        Ok(log_file)
    }

    // ------------------------------------------------------------------
    // Queue monitor (C3)
    // ------------------------------------------------------------------

    #[tracing::instrument(skip(self))]
    pub fn start_queue_monitor_loop(self: Arc<Self>) -> tokio::task::AbortHandle {
        let task = tokio::task::spawn({
            async move {
                if let Err(e) = Box::pin(self.queue_monitor_loop()).await {
                    tracing::error!("Failed to spawn queue monitor loop. e={e}");
                }
            }
        });
        task.abort_handle()
    }

    #[tracing::instrument(skip(self), err)]
    async fn queue_monitor_loop(&self) -> anyhow::Result<()> {
        let mut listener = self
            .db
            .listener(vec![
                "builds_added",
                "builds_restarted",
                "builds_cancelled",
                "builds_deleted",
                "builds_bumped",
                "jobset_shares_changed",
            ])
            .await?;

        loop {
            let before_work = Instant::now();
            // Transient DB trouble must never kill the monitor; back off
            // and try again.
            let fetch = || async { self.get_queued_builds().await };
            if let Err(e) = fetch
                .retry(
                    backon::ExponentialBuilder::default()
                        .with_max_delay(std::time::Duration::from_secs(60))
                        .with_max_times(5),
                )
                .await
            {
                tracing::error!("get_queued_builds failed inside queue monitor loop: {e}");
                continue;
            }

            #[allow(clippy::cast_possible_truncation)]
            self.metrics
                .queue_monitor_time_spent_running
                .inc_by(before_work.elapsed().as_micros() as u64);

            let before_sleep = Instant::now();
            let queue_trigger_timer = self.config.get_queue_trigger_timer();
            let notification = if let Some(timer) = queue_trigger_timer {
                tokio::select! {
                    () = tokio::time::sleep(timer) => {"timer_reached".into()},
                    v = listener.try_next() => match v {
                        Ok(Some(v)) => v.channel().to_owned(),
                        Ok(None) => continue,
                        Err(e) => {
                            tracing::warn!("PgListener failed with e={e}");
                            continue;
                        }
                    },
                }
            } else {
                match listener.try_next().await {
                    Ok(Some(v)) => v.channel().to_owned(),
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!("PgListener failed with e={e}");
                        continue;
                    }
                }
            };
            self.metrics.nr_queue_wakeups.inc();
            tracing::trace!("New notification from PgListener. notification={notification:?}");

            match notification.as_ref() {
                "builds_added" => {
                    tracing::debug!("got notification: new builds added to the queue");
                }
                "builds_restarted" => {
                    tracing::debug!("got notification: builds restarted");
                    // restarted builds reuse their old ids
                    self.last_seen_build_id.store(0, Ordering::Relaxed);
                }
                "builds_cancelled" | "builds_deleted" | "builds_bumped" => {
                    tracing::info!("got notification: builds cancelled or bumped");
                    if let Err(e) = self.process_queue_change().await {
                        tracing::error!("Failed to process queue change. e={e}");
                    }
                }
                "jobset_shares_changed" => {
                    tracing::info!("got notification: jobset shares changed");
                    match self.db.get().await {
                        Ok(mut conn) => {
                            if let Err(e) = self.jobsets.handle_change(&mut conn).await {
                                tracing::error!("Failed to handle jobset change. e={e}");
                            }
                        }
                        Err(e) => {
                            tracing::error!(
                                "Failed to get db connection for event 'jobset_shares_changed'. e={e}"
                            );
                        }
                    }
                }
                _ => (),
            }

            #[allow(clippy::cast_possible_truncation)]
            self.metrics
                .queue_monitor_time_spent_waiting
                .inc_by(before_sleep.elapsed().as_micros() as u64);
        }
    }

    #[tracing::instrument(skip(self), err)]
    async fn get_queued_builds(&self) -> anyhow::Result<()> {
        self.metrics.queue_checks_started.inc();

        let last_seen = self.last_seen_build_id.load(Ordering::Relaxed);
        let mut new_ids = Vec::<BuildID>::with_capacity(1000);
        let mut new_builds_by_id = HashMap::<BuildID, Arc<Build>>::with_capacity(1000);
        let mut new_builds_by_path =
            HashMap::<store_utils::StorePath, HashSet<BuildID>>::with_capacity(1000);

        {
            let mut conn = self.db.get().await?;
            for b in conn.get_queued_builds(last_seen).await? {
                if let Some(build_one) = self.cli.build_one
                    && b.id != build_one
                {
                    continue;
                }

                let jobset = self
                    .jobsets
                    .create(&mut conn, b.jobset_id, &b.project, &b.jobset)
                    .await?;
                let build = Build::new(b, jobset)?;
                self.last_seen_build_id
                    .fetch_max(build.id, Ordering::Relaxed);
                new_ids.push(build.id);
                new_builds_by_id.insert(build.id, build.clone());
                new_builds_by_path
                    .entry(build.drv_path.clone())
                    .or_insert_with(HashSet::new)
                    .insert(build.id);
            }
        }
        tracing::debug!("new_ids: {new_ids:?}");

        let new_builds_by_id = Arc::new(parking_lot::RwLock::new(new_builds_by_id));
        Box::pin(self.process_new_builds(new_ids, new_builds_by_id, new_builds_by_path)).await;
        Ok(())
    }

    #[tracing::instrument(skip(self, new_ids, new_builds_by_id, new_builds_by_path))]
    async fn process_new_builds(
        &self,
        new_ids: Vec<BuildID>,
        new_builds_by_id: Arc<parking_lot::RwLock<HashMap<BuildID, Arc<Build>>>>,
        new_builds_by_path: HashMap<store_utils::StorePath, HashSet<BuildID>>,
    ) {
        let finished_drvs = Arc::new(parking_lot::RwLock::new(
            HashSet::<store_utils::StorePath>::new(),
        ));

        let starttime = jiff::Timestamp::now();
        for id in new_ids {
            let Some(build) = new_builds_by_id.read().get(&id).cloned() else {
                continue;
            };

            let new_runnable = Arc::new(parking_lot::RwLock::new(HashSet::<Arc<Step>>::new()));

            Box::pin(self.create_build(
                build,
                new_builds_by_id.clone(),
                &new_builds_by_path,
                finished_drvs.clone(),
                new_runnable.clone(),
            ))
            .await;

            {
                let new_runnable = new_runnable.read();
                tracing::info!("got {} new runnable steps", new_runnable.len());
                for r in new_runnable.iter() {
                    self.make_runnable(r);
                }
            }
            self.metrics.nr_builds_read.inc();

            let stop_queue_run_after = self.config.get_stop_queue_run_after();
            if let Some(stop_queue_run_after) = stop_queue_run_after
                && jiff::Timestamp::now() > (starttime + stop_queue_run_after)
            {
                // yield so cancellations and bumps are not starved by a
                // huge queue read
                self.metrics.queue_checks_early_exits.inc();
                break;
            }
        }

        // Step creation is concurrent with step completion, so a freshly
        // added dep edge may point at a step that just finished. Sweep
        // once to not miss those.
        for s in self.steps.make_rdeps_runnable() {
            self.make_runnable(&s);
        }

        self.metrics.queue_checks_finished.inc();
        self.trigger_dispatch();
    }

    #[tracing::instrument(
        skip(self, build, new_builds_by_id, new_builds_by_path, finished_drvs, new_runnable),
        fields(build_id = build.id)
    )]
    async fn create_build(
        &self,
        build: Arc<Build>,
        new_builds_by_id: Arc<parking_lot::RwLock<HashMap<BuildID, Arc<Build>>>>,
        new_builds_by_path: &HashMap<store_utils::StorePath, HashSet<BuildID>>,
        finished_drvs: Arc<parking_lot::RwLock<HashSet<store_utils::StorePath>>>,
        new_runnable: Arc<parking_lot::RwLock<HashSet<Arc<Step>>>>,
    ) {
        self.metrics.queue_build_loads.inc();
        tracing::info!("loading build {} ({})", build.id, build.full_job_name());
        {
            let mut new_builds_by_id = new_builds_by_id.write();
            new_builds_by_id.remove(&build.id);
        }

        if !self.store.is_valid_path(&build.drv_path).await {
            tracing::error!("aborting GC'ed build {}", build.id);
            if let Err(e) = self
                .abort_build_with_error(
                    &build,
                    &format!("derivation '{}' is no longer in the store", build.drv_path),
                )
                .await
            {
                tracing::error!("Failed to abort the build={} e={}", build.id, e);
            }
            return;
        }

        // Create steps for this derivation and its dependencies.
        let new_steps = Arc::new(parking_lot::RwLock::new(HashSet::<Arc<Step>>::new()));
        let step = match self
            .create_step(
                build.clone(),
                build.drv_path.clone(),
                Some(build.clone()),
                None,
                finished_drvs.clone(),
                new_steps.clone(),
                new_runnable.clone(),
            )
            .await
        {
            CreateStepResult::None => None,
            CreateStepResult::Valid(dep) => Some(dep),
            CreateStepResult::PreviousFailure(step) => {
                if let Err(e) = self.handle_previous_failure(build, step).await {
                    tracing::error!("Failed to handle previous failure: {e}");
                }
                return;
            }
            CreateStepResult::Unsupported(step) => {
                if let Err(e) = self.handle_unsupported_step(&build, step).await {
                    tracing::error!("Failed to handle unsupported step: {e}");
                }
                return;
            }
            CreateStepResult::Invalid(msg) => {
                tracing::warn!("aborting build {}: {msg}", build.id);
                if let Err(e) = self.abort_build_with_error(&build, &msg).await {
                    tracing::error!("Failed to abort the build={} e={}", build.id, e);
                }
                return;
            }
        };

        {
            use futures::stream::StreamExt as _;

            // Expand sibling builds whose top level appeared among the
            // new steps, so attach order does not depend on queue order.
            let builds = {
                let new_steps = new_steps.read();
                new_steps
                    .iter()
                    .filter_map(|r| Some(new_builds_by_path.get(r.get_drv_path())?.clone()))
                    .flatten()
                    .collect::<Vec<_>>()
            };
            let mut stream = futures::StreamExt::map(tokio_stream::iter(builds), |b| {
                let new_builds_by_id = new_builds_by_id.clone();
                let finished_drvs = finished_drvs.clone();
                let new_runnable = new_runnable.clone();
                async move {
                    let j = {
                        if let Some(j) = new_builds_by_id.read().get(&b) {
                            j.clone()
                        } else {
                            return;
                        }
                    };

                    Box::pin(self.create_build(
                        j,
                        new_builds_by_id,
                        new_builds_by_path,
                        finished_drvs,
                        new_runnable,
                    ))
                    .await;
                }
            })
            .buffered(10);
            while tokio_stream::StreamExt::next(&mut stream).await.is_some() {}
        }

        if let Some(step) = step {
            if !build.get_finished_in_db() {
                self.builds.insert_new_build(build.clone());
            }

            build.set_toplevel_step(step.clone());
            build.propagate_priorities();

            tracing::info!(
                "added build {} (top-level step {}, {} new steps)",
                build.id,
                step.get_drv_path(),
                new_steps.read().len()
            );
        } else {
            // No step means every output is already realised: a
            // finished, cached build.
            if let Err(e) = self.handle_cached_build(build).await {
                tracing::error!("failed to handle cached build: {e}");
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(
        skip(self, build, referring_build, referring_step, finished_drvs, new_steps, new_runnable),
        fields(build_id = build.id, %drv_path)
    )]
    async fn create_step(
        &self,
        build: Arc<Build>,
        drv_path: store_utils::StorePath,
        referring_build: Option<Arc<Build>>,
        referring_step: Option<Arc<Step>>,
        finished_drvs: Arc<parking_lot::RwLock<HashSet<store_utils::StorePath>>>,
        new_steps: Arc<parking_lot::RwLock<HashSet<Arc<Step>>>>,
        new_runnable: Arc<parking_lot::RwLock<HashSet<Arc<Step>>>>,
    ) -> CreateStepResult {
        use futures::stream::StreamExt as _;

        {
            let finished_drvs = finished_drvs.read();
            if finished_drvs.contains(&drv_path) {
                return CreateStepResult::None;
            }
        }

        let (step, is_new) =
            self.steps
                .create(&drv_path, referring_build.as_ref(), referring_step.as_ref());
        if !is_new {
            return CreateStepResult::Valid(step);
        }
        self.metrics.queue_steps_created.inc();
        tracing::debug!("considering derivation '{drv_path}'");

        let drv = match store_utils::query_drv(&self.store, &drv_path).await {
            Ok(Some(drv)) => drv,
            Ok(None) => {
                return CreateStepResult::Invalid(format!(
                    "cannot read derivation '{drv_path}'"
                ));
            }
            Err(e) => {
                return CreateStepResult::Invalid(format!(
                    "cannot parse derivation '{drv_path}': {e}"
                ));
            }
        };

        let missing_outputs = self.store.query_missing_outputs(drv.outputs.to_vec()).await;
        step.set_drv(drv);

        if self.check_cached_failure(&step).await {
            step.set_previous_failure(true);
            return CreateStepResult::PreviousFailure(step);
        }

        tracing::debug!("missing outputs: {missing_outputs:?}");
        if missing_outputs.is_empty() {
            finished_drvs.write().insert(drv_path.clone());
            step.set_finished(true);
            return CreateStepResult::None;
        }

        // The step actually has to build somewhere. Support is judged on
        // declared systems and features only; a disabled machine still
        // counts.
        if !self.machines.support_step(&step) {
            return CreateStepResult::Unsupported(step);
        }

        tracing::debug!("creating build step '{drv_path}'");
        let Some(input_drvs) = step.get_input_drvs() else {
            // the derivation was just stored above
            return CreateStepResult::None;
        };

        let step2 = step.clone();
        let mut stream = futures::StreamExt::map(tokio_stream::iter(input_drvs), |i| {
            let build = build.clone();
            let step = step2.clone();
            let finished_drvs = finished_drvs.clone();
            let new_steps = new_steps.clone();
            let new_runnable = new_runnable.clone();
            async move {
                let path = store_utils::StorePath::new(&i);
                Box::pin(self.create_step(
                    build,
                    path,
                    None,
                    Some(step),
                    finished_drvs,
                    new_steps,
                    new_runnable,
                ))
                .await
            }
        })
        .buffered(25);
        while let Some(v) = tokio_stream::StreamExt::next(&mut stream).await {
            match v {
                CreateStepResult::None => (),
                CreateStepResult::Valid(dep) => {
                    if !dep.get_finished() && !dep.get_previous_failure() {
                        // finished can be true when the dep already
                        // exists and is being completed concurrently
                        step.add_dep(dep);
                    }
                }
                CreateStepResult::PreviousFailure(step) => {
                    return CreateStepResult::PreviousFailure(step);
                }
                CreateStepResult::Unsupported(step) => {
                    return CreateStepResult::Unsupported(step);
                }
                CreateStepResult::Invalid(msg) => {
                    return CreateStepResult::Invalid(msg);
                }
            }
        }

        {
            step.atomic_state.set_created(true);
            if step.get_deps_size() == 0 {
                let mut new_runnable = new_runnable.write();
                new_runnable.insert(step.clone());
            }
        }

        {
            let mut new_steps = new_steps.write();
            new_steps.insert(step.clone());
        }
        CreateStepResult::Valid(step)
    }

    /// Consult the persistent failed-path cache before a step enters the
    /// graph or a machine.
    #[tracing::instrument(skip(self, step), ret, level = "debug")]
    pub(super) async fn check_cached_failure(&self, step: &Arc<Step>) -> bool {
        let Some(drv_outputs) = step.get_outputs() else {
            return false;
        };

        let Ok(mut conn) = self.db.get().await else {
            return false;
        };

        conn.check_if_paths_failed(
            &drv_outputs
                .iter()
                .filter_map(|o| o.path.as_ref().map(|p| self.store.print_store_path(p)))
                .collect::<Vec<_>>(),
        )
        .await
        .unwrap_or_default()
    }

    #[tracing::instrument(skip(self, build, step), err)]
    async fn handle_previous_failure(
        &self,
        build: Arc<Build>,
        step: Arc<Step>,
    ) -> anyhow::Result<()> {
        tracing::warn!(
            "marking build {} as cached failure due to '{}'",
            build.id,
            step.get_drv_path()
        );
        if build.get_finished_in_db() {
            return Ok(());
        }

        let mut conn = self.db.get().await?;
        let mut tx = conn.begin_transaction().await?;

        // Find the build step the failure propagates from, first by
        // derivation path, then by output path.
        let mut propagated_from = tx
            .get_last_build_step_id(&self.store.print_store_path(step.get_drv_path()))
            .await?
            .unwrap_or_default();

        if propagated_from == 0 {
            for o in step.get_outputs().unwrap_or_default() {
                let Some(path) = &o.path else { continue };
                if let Ok(Some(res)) = tx
                    .get_last_build_step_id_for_output_path(&self.store.print_store_path(path))
                    .await
                {
                    propagated_from = res;
                    break;
                }
            }
        }

        tx.create_build_step(
            None,
            build.id,
            &self.store.print_store_path(step.get_drv_path()),
            step.get_system_type().as_deref(),
            String::new(),
            BuildStatus::CachedFailure,
            None,
            Some(propagated_from),
            step.get_outputs()
                .unwrap_or_default()
                .into_iter()
                .map(|o| (o.name, o.path.map(|p| self.store.print_store_path(&p))))
                .collect(),
        )
        .await?;
        tx.update_build_after_previous_failure(
            build.id,
            if step.get_drv_path() == &build.drv_path {
                BuildStatus::Failed
            } else {
                BuildStatus::DepFailed
            },
        )
        .await?;
        tx.commit().await?;

        build.set_finished_in_db(true);
        self.metrics.nr_builds_done.inc();
        if let Err(e) = self.notifier.schedule(build.id, vec![]) {
            tracing::error!("Failed to schedule notification for build {}: {e}", build.id);
        }
        self.maybe_finish_build_one(build.id);
        Ok(())
    }

    /// No registered machine declares the step's platform and features:
    /// fail the owning build, and every other build reaching the step,
    /// right away.
    #[tracing::instrument(skip(self, build, step), fields(build_id = build.id), err)]
    async fn handle_unsupported_step(
        &self,
        build: &Arc<Build>,
        step: Arc<Step>,
    ) -> anyhow::Result<()> {
        let drv = step.get_drv_path().clone();
        let system_type = step.get_system_type();
        tracing::error!(
            "marking build {} as unsupported: no machine can build '{drv}' (type '{system_type:?}')",
            build.id
        );

        let mut job = Job::new(build.id);
        job.result.set_start_and_stop(jiff::Timestamp::now());
        job.result.step_status = BuildStatus::Unsupported;
        job.result.error_msg = Some(format!(
            "unsupported system type '{}'",
            system_type.unwrap_or_default()
        ));
        self.fail_job_and_dependents(&drv, None, job, step).await?;
        self.metrics.nr_unsupported_steps_aborted.inc();
        Ok(())
    }

    /// Every output of the build's top-level derivation is already
    /// realised: finalise it as a cached success without a step.
    #[tracing::instrument(skip(self, build), fields(build_id = build.id), err)]
    async fn handle_cached_build(&self, build: Arc<Build>) -> anyhow::Result<()> {
        let drv = store_utils::query_drv(&self.store, &build.drv_path)
            .await?
            .ok_or_else(|| anyhow::anyhow!("derivation not found"))?;

        {
            let mut db = self.db.get().await?;
            let mut tx = db.begin_transaction().await?;

            tracing::info!("marking build {} as succeeded (cached)", build.id);
            let now = i32::try_from(jiff::Timestamp::now().as_second())?;
            tx.mark_succeeded_build(
                build.id,
                false,
                &drv.outputs
                    .iter()
                    .filter_map(|o| {
                        Some((o.name.clone(), self.store.print_store_path(o.path.as_ref()?)))
                    })
                    .collect::<Vec<_>>(),
                true,
                now,
                now,
            )
            .await?;
            self.metrics.nr_builds_done.inc();
            tx.commit().await?;
        }
        build.set_finished_in_db(true);
        if let Err(e) = self.notifier.schedule(build.id, vec![]) {
            tracing::error!("Failed to schedule notification for build {}: {e}", build.id);
        }
        self.maybe_finish_build_one(build.id);

        Ok(())
    }

    #[tracing::instrument(skip(self, build), fields(build_id = build.id), err)]
    async fn abort_build_with_error(&self, build: &Arc<Build>, msg: &str) -> anyhow::Result<()> {
        if !build.get_finished_in_db() {
            let mut conn = self.db.get().await?;
            {
                let mut tx = conn.begin_transaction().await?;
                tx.create_build_step(
                    None,
                    build.id,
                    &self.store.print_store_path(&build.drv_path),
                    None,
                    String::new(),
                    BuildStatus::Aborted,
                    Some(msg.to_string()),
                    None,
                    vec![],
                )
                .await?;
                tx.commit().await?;
            }
            conn.abort_build(build.id).await?;
        }

        build.set_finished_in_db(true);
        self.metrics.nr_builds_done.inc();
        if let Err(e) = self.notifier.schedule(build.id, vec![]) {
            tracing::error!("Failed to schedule notification for build {}: {e}", build.id);
        }
        self.maybe_finish_build_one(build.id);
        Ok(())
    }

    /// Handle out-of-band cancellations, deletions and priority bumps.
    /// A cancelled build's in-flight step is allowed to finish; only the
    /// build itself is finalised, and steps that become unreachable are
    /// dropped through their weak references.
    #[tracing::instrument(skip(self), err)]
    async fn process_queue_change(&self) -> anyhow::Result<()> {
        let mut db = self.db.get().await?;
        let curr_ids: HashMap<_, _> = db
            .get_not_finished_builds_fast()
            .await?
            .into_iter()
            .map(|b| (b.id, b.globalpriority))
            .collect();

        for build in self.builds.update_priorities(&curr_ids) {
            tracing::info!("build {} is no longer queued, dropping it", build.id);
            build.set_finished_in_db(true);
            self.metrics.nr_builds_done.inc();
            self.maybe_finish_build_one(build.id);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dispatcher (C5)
    // ------------------------------------------------------------------

    #[tracing::instrument(skip(self))]
    pub fn start_dispatch_loop(self: Arc<Self>) -> tokio::task::AbortHandle {
        let task = tokio::task::spawn({
            async move {
                let mut next_wake: Option<jiff::Timestamp> = None;
                loop {
                    let before_sleep = Instant::now();
                    let sleep_for = wake_timeout(next_wake, self.config.get_dispatch_trigger_timer());
                    if let Some(timer) = sleep_for {
                        tokio::select! {
                            () = self.notify_dispatch.notified() => {},
                            () = tokio::time::sleep(timer) => {},
                        };
                    } else {
                        self.notify_dispatch.notified().await;
                    }
                    tracing::debug!("starting dispatch");

                    #[allow(clippy::cast_possible_truncation)]
                    self.metrics
                        .dispatcher_time_spent_waiting
                        .inc_by(before_sleep.elapsed().as_micros() as u64);

                    self.metrics.nr_dispatcher_wakeups.inc();
                    let before_work = Instant::now();
                    next_wake = self.clone().do_dispatch_once().await;

                    let elapsed = before_work.elapsed();

                    #[allow(clippy::cast_possible_truncation)]
                    self.metrics
                        .dispatcher_time_spent_running
                        .inc_by(elapsed.as_micros() as u64);

                    #[allow(clippy::cast_possible_truncation)]
                    self.metrics
                        .dispatch_time_ms
                        .inc_by(elapsed.as_millis() as u64);
                }
            }
        });
        task.abort_handle()
    }

    /// One dispatch pass: snapshot, sort, match, reserve, spawn. Returns
    /// the earliest point in time at which something changes on its own
    /// (a step's retry delay or a machine's disable window expiring).
    #[tracing::instrument(skip(self))]
    async fn do_dispatch_once(self: Arc<Self>) -> Option<jiff::Timestamp> {
        // Prune old history so share_used reflects the current window.
        self.jobsets.prune();

        let now = jiff::Timestamp::now();
        let mut next_wake: Option<jiff::Timestamp> = None;
        let mut merge_wake = |candidate: jiff::Timestamp| {
            next_wake = Some(next_wake.map_or(candidate, |curr| curr.min(candidate)));
        };

        let mut infos: Vec<StepInfo> = self
            .runnable
            .snapshot()
            .into_iter()
            .filter(|s| !s.get_finished())
            .map(StepInfo::new)
            .collect();
        infos.sort_by(StepInfo::dispatch_compare);

        let mut stats = HashMap::<System, SystemTypeInfo>::with_capacity(4);
        let mut nr_unsupported = 0i64;
        let mut nr_disabled = 0i64;
        let mut nr_waiting = 0i64;

        for info in &infos {
            let step = &info.step;
            let system_type = info.system_type.clone().unwrap_or_default();
            let entry = stats.entry(system_type).or_default();
            entry.runnable += 1;

            if !self.machines.support_step(step) {
                // The machines file lost the only capable machine after
                // this step was created; it stays runnable until one
                // appears again.
                nr_unsupported += 1;
                continue;
            }

            if info.after > now {
                nr_disabled += 1;
                merge_wake(info.after);
                continue;
            }

            let Some(machine) = self.machines.select_machine(step, now) else {
                nr_waiting += 1;
                entry.wait_time_ms += u64::try_from(
                    now.duration_since(info.runnable_since).as_millis(),
                )
                .unwrap_or_default();
                continue;
            };

            tracing::info!(
                "dispatching step {} to machine {}",
                step.get_drv_path(),
                machine.ssh_name
            );
            self.runnable.remove(step.get_drv_path());
            let reservation = MachineReservation::new(step.clone(), machine);
            tokio::spawn(builder::run_builder(self.clone(), reservation));
        }

        // Aggregate running counts from the machines' live job lists.
        let steps_io = self.steps.clone_as_io();
        for machine in self.machines.get_all_machines() {
            for job in machine.clone_jobs() {
                let system_type = steps_io
                    .iter()
                    .find(|s| s.drv_path == job.drv_path)
                    .and_then(|s| s.system_type.clone())
                    .unwrap_or_default();
                let entry = stats.entry(system_type).or_default();
                entry.running += 1;
                entry.last_active = Some(now);
            }
        }

        self.metrics.nr_unsupported_steps.set(nr_unsupported);
        self.metrics.nr_steps_waiting.set(nr_waiting);
        self.metrics.nr_steps_disabled.set(nr_disabled);
        self.system_types.replace(stats);

        if let Some(disabled_until) = self.machines.earliest_disabled_until(now) {
            merge_wake(disabled_until);
        }
        next_wake
    }

    // ------------------------------------------------------------------
    // Outcome reducer (C7)
    // ------------------------------------------------------------------

    /// Success path: record the step result, free dependents, finalise
    /// builds whose top level this step was, account the step time to
    /// every covering jobset.
    #[tracing::instrument(skip(self, machine, step, job), fields(drv = %step.get_drv_path()), err)]
    pub(super) async fn succeed_step(
        &self,
        machine: &Arc<Machine>,
        step: &Arc<Step>,
        mut job: Job,
        failed_with_output: bool,
    ) -> anyhow::Result<()> {
        let drv_path = step.get_drv_path().clone();
        tracing::info!("marking step as done: drv_path={drv_path}");

        step.set_finished(true);
        job.result.step_status = BuildStatus::Success;

        crate::utils::finish_build_step(
            &self.db,
            job.build_id,
            job.step_nr,
            &job.result,
            Some(machine.ssh_name.clone()),
        )
        .await?;

        // Account the step's build time to every jobset that needed it.
        let start_time = job.result.get_start_time().unwrap_or_default();
        let stop_time = job.result.get_stop_time().unwrap_or_default();
        let duration = stop_time.duration_since(start_time).as_secs().max(0);
        for jobset in step.get_jobsets() {
            jobset.add_step(start_time.as_second(), duration);
        }

        let outputs = step
            .get_outputs()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|o| Some((o.name, self.store.print_store_path(&o.path?))))
            .collect::<Vec<_>>();

        let direct = step.get_direct_builds();
        if direct.is_empty() {
            self.steps.remove(&drv_path);
        }

        {
            let mut db = self.db.get().await?;
            let mut tx = db.begin_transaction().await?;
            let start_time = job.result.get_start_time_as_i32()?;
            let stop_time = job.result.get_stop_time_as_i32()?;
            for b in &direct {
                let is_cached = job.build_id != b.id;
                tx.mark_succeeded_build(
                    b.id,
                    failed_with_output,
                    &outputs,
                    is_cached,
                    start_time,
                    stop_time,
                )
                .await?;
                self.metrics.nr_builds_done.inc();
            }

            tx.commit().await?;
        }

        // Removing the direct dependents from `builds` lets them be
        // destroyed once nothing else references them.
        for b in &direct {
            b.set_finished_in_db(true);
            self.builds.remove_by_id(b.id);
            if let Err(e) = self.notifier.schedule(b.id, vec![]) {
                tracing::error!("Failed to schedule notification for build {}: {e}", b.id);
            }
            self.maybe_finish_build_one(b.id);
        }

        for s in step.make_rdeps_runnable() {
            self.make_runnable(&s);
        }

        if !job.result.log_file.is_empty() {
            if let Err(e) = self
                .log_compressor
                .schedule(std::path::PathBuf::from(&job.result.log_file))
            {
                tracing::error!("Failed to schedule log compression: {e}");
            }
        }

        self.metrics.nr_steps_done.inc();
        self.trigger_dispatch();

        Ok(())
    }

    /// Failure path: record the step result, finalise every transitively
    /// dependent build as dep-failed (with a propagated-from reference),
    /// cache the failed outputs, and drop the now-unreachable part of
    /// the graph.
    #[tracing::instrument(skip(self, machine, job, step), fields(%drv_path), err)]
    pub(super) async fn fail_job_and_dependents(
        &self,
        drv_path: &store_utils::StorePath,
        machine: Option<Arc<Machine>>,
        mut job: Job,
        step: Arc<Step>,
    ) -> anyhow::Result<()> {
        if !job.result.has_stop_time() {
            job.result.set_stop_time_now();
        }

        if job.step_nr != 0 {
            crate::utils::finish_build_step(
                &self.db,
                job.build_id,
                job.step_nr,
                &job.result,
                machine.as_ref().map(|m| m.ssh_name.clone()),
            )
            .await?;

            if !job.result.log_file.is_empty() {
                if let Err(e) = self
                    .log_compressor
                    .schedule(std::path::PathBuf::from(&job.result.log_file))
                {
                    tracing::error!("Failed to schedule log compression: {e}");
                }
            }
        }

        let mut dependent_ids = Vec::new();
        let mut step_finished = false;
        loop {
            let indirect = self.get_all_indirect_builds(&step);
            if indirect.is_empty() && step_finished {
                break;
            }

            {
                let mut db = self.db.get().await?;
                let mut tx = db.begin_transaction().await?;

                // Record a failed build step for every dependent build,
                // except where it would be redundant with the build's own
                // cached-failure marker.
                for b in &indirect {
                    if (job.result.step_status == BuildStatus::CachedFailure
                        && b.drv_path == *step.get_drv_path())
                        || ((job.result.step_status != BuildStatus::CachedFailure
                            && job.result.step_status != BuildStatus::Unsupported)
                            && job.build_id == b.id)
                        || b.get_finished_in_db()
                    {
                        continue;
                    }

                    tx.create_build_step(
                        None,
                        b.id,
                        &self.store.print_store_path(step.get_drv_path()),
                        step.get_system_type().as_deref(),
                        machine
                            .as_deref()
                            .map(|m| m.ssh_name.clone())
                            .unwrap_or_default(),
                        job.result.step_status,
                        job.result.error_msg.clone(),
                        if job.build_id == b.id {
                            None
                        } else {
                            Some(job.build_id)
                        },
                        step.get_outputs()
                            .unwrap_or_default()
                            .into_iter()
                            .map(|o| (o.name, o.path.map(|p| self.store.print_store_path(&p))))
                            .collect(),
                    )
                    .await?;
                }

                // Mark all builds that depend on this step as failed, in
                // the same transaction, so no observer sees a build
                // pending while its deps already failed.
                for b in &indirect {
                    if b.get_finished_in_db() {
                        continue;
                    }

                    tracing::info!("marking build {} as failed", b.id);
                    let start_time = job.result.get_start_time_as_i32()?;
                    let stop_time = job.result.get_stop_time_as_i32()?;
                    tx.update_build_after_failure(
                        b.id,
                        if b.drv_path != *step.get_drv_path()
                            && job.result.step_status == BuildStatus::Failed
                        {
                            BuildStatus::DepFailed
                        } else {
                            job.result.step_status
                        },
                        start_time,
                        stop_time,
                        job.result.step_status == BuildStatus::CachedFailure,
                    )
                    .await?;
                    self.metrics.nr_builds_done.inc();
                }

                // Remember failed output paths so future builds requiring
                // them short-circuit without a step.
                if job.result.step_status != BuildStatus::CachedFailure && job.result.can_cache {
                    for o in step.get_outputs().unwrap_or_default() {
                        let Some(p) = o.path else { continue };
                        tx.insert_failed_paths(&self.store.print_store_path(&p))
                            .await?;
                    }
                }

                tx.commit().await?;
            }

            step_finished = true;

            for b in indirect {
                b.set_finished_in_db(true);
                self.builds.remove_by_id(b.id);
                self.maybe_finish_build_one(b.id);
                dependent_ids.push(b.id);
            }
        }

        if let Err(e) = self.notifier.schedule(job.build_id, dependent_ids) {
            tracing::error!(
                "Failed to schedule notification for build {}: {e}",
                job.build_id
            );
        }

        self.metrics.nr_steps_done.inc();
        self.trigger_dispatch();

        Ok(())
    }

    #[tracing::instrument(skip(self, step))]
    fn get_all_indirect_builds(&self, step: &Arc<Step>) -> HashSet<Arc<Build>> {
        let mut indirect = HashSet::new();
        let mut steps = HashSet::new();
        step.get_dependents(&mut indirect, &mut steps);

        // No builds left: delete all referring steps from the global
        // map. No new referrers can appear at this point.
        if indirect.is_empty() {
            for s in steps {
                let drv = s.get_drv_path();
                tracing::debug!("finishing build step '{drv}'");
                self.runnable.remove(drv);
                self.steps.remove(drv);
            }
        }

        indirect
    }

    // ------------------------------------------------------------------
    // Aux workers and auxiliary loops
    // ------------------------------------------------------------------

    /// Read and swap in the machines file. Called once at startup before
    /// the queue monitor runs, so expansion never judges support against
    /// an empty registry, and from the watcher on every mtime change.
    #[tracing::instrument(skip(self))]
    pub async fn load_machines_file(&self) {
        let path = self.config.get_machines_file();
        match read_machines_file(&path).await {
            Ok(content) => {
                let machines = parse_machines(&content);
                tracing::info!(
                    "loaded {} machine(s) from {}",
                    machines.len(),
                    path.display()
                );
                self.machines.replace(machines);
            }
            Err(e) => {
                tracing::warn!("Failed to read machines file {}: {e}", path.display());
            }
        }
    }

    #[tracing::instrument(skip(self))]
    pub fn start_machines_file_monitor(self: Arc<Self>) -> tokio::task::AbortHandle {
        let task = tokio::task::spawn(async move {
            let mut last_mtime: Option<std::time::SystemTime> = None;
            loop {
                let path = self.config.get_machines_file();
                let mtime = fs_err::tokio::metadata(&path)
                    .await
                    .ok()
                    .and_then(|m| m.modified().ok());

                if mtime.is_some() && mtime != last_mtime {
                    last_mtime = mtime;
                    self.load_machines_file().await;
                    self.trigger_dispatch();
                } else if mtime.is_none() {
                    tracing::warn!("machines file {} does not exist", path.display());
                }

                tokio::time::sleep(self.config.get_machines_poll_interval()).await;
            }
        });
        task.abort_handle()
    }

    #[tracing::instrument(skip(self))]
    pub fn start_log_compressor_queue(self: Arc<Self>) -> tokio::task::AbortHandle {
        let task = tokio::task::spawn(async move {
            while self.log_compressor.compress_once().await {
                self.metrics.nr_logs_compressed.inc();
            }
        });
        task.abort_handle()
    }

    #[tracing::instrument(skip(self))]
    pub fn start_notification_sender_queue(self: Arc<Self>) -> tokio::task::AbortHandle {
        let task = tokio::task::spawn(async move {
            while self.notifier.send_once(&self.db).await {
                self.metrics.nr_notifications_sent.inc();
            }
        });
        task.abort_handle()
    }

    #[tracing::instrument(skip(self), err)]
    async fn dump_status_loop(self: Arc<Self>) -> anyhow::Result<()> {
        let mut listener = self.db.listener(vec!["dump_status"]).await?;

        loop {
            let _ = match listener.try_next().await {
                Ok(Some(v)) => v,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("PgListener failed with e={e}");
                    continue;
                }
            };

            let dump_status = crate::io::DumpResponse::new(&self);
            {
                let Ok(mut db) = self.db.get().await else {
                    continue;
                };
                let Ok(mut tx) = db.begin_transaction().await else {
                    continue;
                };
                let dump_status = match serde_json::to_value(dump_status) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::error!("Failed to update status in database: {e}");
                        continue;
                    }
                };
                if let Err(e) = tx.upsert_status(&dump_status).await {
                    tracing::error!("Failed to update status in database: {e}");
                    continue;
                }
                if let Err(e) = tx.notify_status_dumped().await {
                    tracing::error!("Failed to update status in database: {e}");
                    continue;
                }
                if let Err(e) = tx.commit().await {
                    tracing::error!("Failed to update status in database: {e}");
                }
            }
        }
    }

    #[tracing::instrument(skip(self))]
    pub fn start_dump_status_loop(self: Arc<Self>) -> tokio::task::AbortHandle {
        let task = tokio::task::spawn({
            async move {
                if let Err(e) = self.dump_status_loop().await {
                    tracing::error!("Failed to spawn dump status loop. e={e}");
                }
            }
        });
        task.abort_handle()
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_status_from_main_process(self: Arc<Self>) -> anyhow::Result<()> {
        let mut db = self.db.get().await?;

        let mut listener = self.db.listener(vec!["status_dumped"]).await?;
        {
            let mut tx = db.begin_transaction().await?;
            tx.notify_dump_status().await?;
            tx.commit().await?;
        }

        let _ = match listener.try_next().await {
            Ok(Some(v)) => v,
            Ok(None) => return Ok(()),
            Err(e) => {
                tracing::warn!("PgListener failed with e={e}");
                return Ok(());
            }
        };
        if let Some(status) = db.get_status().await? {
            // println! so the output can be consumed by other tools
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Ok(())
    }
}

/// The dispatcher's timed wait: the earlier of the configured fallback
/// timer and the next known state change.
fn wake_timeout(
    next_wake: Option<jiff::Timestamp>,
    fallback: Option<tokio::time::Duration>,
) -> Option<tokio::time::Duration> {
    let until_next = next_wake.map(|t| {
        let now = jiff::Timestamp::now();
        if t <= now {
            tokio::time::Duration::ZERO
        } else {
            t.duration_since(now).unsigned_abs()
        }
    });

    match (until_next, fallback) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wake_timeout_prefers_earlier_deadline() {
        let soon = jiff::Timestamp::now() + jiff::SignedDuration::from_secs(5);
        let fallback = tokio::time::Duration::from_secs(120);

        let timeout = wake_timeout(Some(soon), Some(fallback));
        assert!(timeout.is_some_and(|t| t <= tokio::time::Duration::from_secs(5)));

        let timeout = wake_timeout(None, Some(fallback));
        assert_eq!(timeout, Some(fallback));

        assert!(wake_timeout(None, None).is_none());
    }

    #[test]
    fn test_wake_timeout_clamps_past_deadlines() {
        let past = jiff::Timestamp::now() - jiff::SignedDuration::from_secs(5);
        let timeout = wake_timeout(Some(past), None);
        assert_eq!(timeout, Some(tokio::time::Duration::ZERO));
    }
}
