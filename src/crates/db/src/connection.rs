use sqlx::{Acquire, Row as _};

use super::models::{
    Build, BuildID, BuildSmall, BuildStatus, BuildStepWindow, InsertBuildStep,
    InsertBuildStepOutput, Jobset, UpdateBuild, UpdateBuildStep, UpdateBuildStepInFinish,
};

pub struct Connection {
    conn: sqlx::pool::PoolConnection<sqlx::Postgres>,
}

pub struct Transaction<'a> {
    tx: sqlx::PgTransaction<'a>,
}

impl Connection {
    #[must_use]
    pub const fn new(conn: sqlx::pool::PoolConnection<sqlx::Postgres>) -> Self {
        Self { conn }
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn begin_transaction(&mut self) -> sqlx::Result<Transaction<'_>> {
        let tx = self.conn.begin().await?;
        Ok(Transaction { tx })
    }

    /// New or re-queued builds, oldest first within a priority class so
    /// expansion observes them in FIFO order.
    #[tracing::instrument(skip(self), err)]
    pub async fn get_queued_builds(&mut self, last_seen_id: BuildID) -> sqlx::Result<Vec<Build>> {
        sqlx::query_as::<_, Build>(
            r"
            SELECT
              builds.id,
              builds.jobset_id,
              jobsets.project AS project,
              jobsets.name AS jobset,
              job,
              drvpath,
              maxsilent,
              timeout,
              timestamp,
              globalpriority,
              priority
            FROM builds
            INNER JOIN jobsets ON builds.jobset_id = jobsets.id
            WHERE finished = 0 AND builds.id > $1
            ORDER BY globalpriority DESC, builds.id",
        )
        .bind(last_seen_id)
        .fetch_all(&mut *self.conn)
        .await
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn get_not_finished_builds_fast(&mut self) -> sqlx::Result<Vec<BuildSmall>> {
        sqlx::query_as::<_, BuildSmall>(
            "SELECT id, globalpriority FROM builds WHERE finished = 0",
        )
        .fetch_all(&mut *self.conn)
        .await
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn get_jobsets(&mut self) -> sqlx::Result<Vec<Jobset>> {
        sqlx::query_as::<_, Jobset>("SELECT project, name, schedulingshares FROM jobsets")
            .fetch_all(&mut *self.conn)
            .await
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn get_jobset_scheduling_shares(
        &mut self,
        jobset_id: i32,
    ) -> sqlx::Result<Option<i32>> {
        Ok(
            sqlx::query("SELECT schedulingshares FROM jobsets WHERE id = $1")
                .bind(jobset_id)
                .fetch_optional(&mut *self.conn)
                .await?
                .map(|row| row.try_get("schedulingshares"))
                .transpose()?,
        )
    }

    /// Recent build-step history of a jobset, used to seed its fairness
    /// window after a restart.
    #[tracing::instrument(skip(self), err)]
    pub async fn get_jobset_build_steps(
        &mut self,
        jobset_id: i32,
        scheduling_window: i64,
    ) -> sqlx::Result<Vec<BuildStepWindow>> {
        sqlx::query_as::<_, BuildStepWindow>(
            r"
            SELECT s.starttime, s.stoptime FROM buildsteps s JOIN builds b ON s.build = b.id
            WHERE
              s.starttime IS NOT NULL AND
              to_timestamp(s.stoptime) > (NOW() - (interval '1 second' * $1)) AND
              b.jobset_id = $2",
        )
        .bind(scheduling_window)
        .bind(jobset_id)
        .fetch_all(&mut *self.conn)
        .await
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn abort_build(&mut self, build_id: BuildID) -> sqlx::Result<()> {
        #[allow(clippy::cast_possible_truncation)]
        sqlx::query(
            "UPDATE builds SET finished = 1, buildstatus = $2, starttime = $3, stoptime = $3
             WHERE id = $1 AND finished = 0",
        )
        .bind(build_id)
        .bind(BuildStatus::Aborted as i32)
        .bind(jiff::Timestamp::now().as_second() as i32)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, paths), err)]
    pub async fn check_if_paths_failed(&mut self, paths: &[String]) -> sqlx::Result<bool> {
        Ok(
            !sqlx::query("SELECT path FROM failedpaths WHERE path = ANY($1)")
                .bind(paths)
                .fetch_all(&mut *self.conn)
                .await?
                .is_empty(),
        )
    }

    /// Reset build steps left busy by a previous run of this process.
    #[tracing::instrument(skip(self), err)]
    pub async fn clear_busy(&mut self, stop_time: i32) -> sqlx::Result<()> {
        sqlx::query("UPDATE buildsteps SET busy = 0, status = $1, stoptime = $2 WHERE busy != 0")
            .bind(BuildStatus::Aborted as i32)
            .bind(stop_time)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, step), err)]
    pub async fn update_build_step(&mut self, step: UpdateBuildStep) -> sqlx::Result<()> {
        sqlx::query(
            "UPDATE buildsteps SET busy = $1
             WHERE build = $2 AND stepnr = $3 AND busy != 0 AND status IS NULL",
        )
        .bind(step.status as i32)
        .bind(step.build_id)
        .bind(step.step_nr)
        .execute(&mut *self.conn)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn get_status(&mut self) -> sqlx::Result<Option<serde_json::Value>> {
        Ok(
            sqlx::query("SELECT status FROM systemstatus WHERE what = 'queue-runner'")
                .fetch_optional(&mut *self.conn)
                .await?
                .map(|row| row.try_get("status"))
                .transpose()?,
        )
    }
}

impl Transaction<'_> {
    #[tracing::instrument(skip(self), err)]
    pub async fn commit(self) -> sqlx::Result<()> {
        self.tx.commit().await
    }

    #[tracing::instrument(skip(self, v), err)]
    pub async fn update_build(&mut self, build_id: BuildID, v: UpdateBuild) -> sqlx::Result<()> {
        sqlx::query(
            r"
            UPDATE builds SET
              finished = 1,
              buildstatus = $2,
              starttime = $3,
              stoptime = $4,
              iscachedbuild = $5,
              notificationpendingsince = $4
            WHERE
              id = $1",
        )
        .bind(build_id)
        .bind(v.status as i32)
        .bind(v.start_time)
        .bind(v.stop_time)
        .bind(i32::from(v.is_cached_build))
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, status, start_time, stop_time, is_cached_build), err)]
    pub async fn update_build_after_failure(
        &mut self,
        build_id: BuildID,
        status: BuildStatus,
        start_time: i32,
        stop_time: i32,
        is_cached_build: bool,
    ) -> sqlx::Result<()> {
        sqlx::query(
            r"
            UPDATE builds SET
              finished = 1,
              buildstatus = $2,
              starttime = $3,
              stoptime = $4,
              iscachedbuild = $5,
              notificationpendingsince = $4
            WHERE
              id = $1 AND finished = 0",
        )
        .bind(build_id)
        .bind(status as i32)
        .bind(start_time)
        .bind(stop_time)
        .bind(i32::from(is_cached_build))
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, status), err)]
    pub async fn update_build_after_previous_failure(
        &mut self,
        build_id: BuildID,
        status: BuildStatus,
    ) -> sqlx::Result<()> {
        #[allow(clippy::cast_possible_truncation)]
        sqlx::query(
            r"
            UPDATE builds SET
              finished = 1,
              buildstatus = $2,
              starttime = $3,
              stoptime = $3,
              iscachedbuild = 1,
              notificationpendingsince = $3
            WHERE
              id = $1 AND finished = 0",
        )
        .bind(build_id)
        .bind(status as i32)
        .bind(jiff::Timestamp::now().as_second() as i32)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    /// The most recent failed build step for a derivation path. Used to
    /// fill `propagatedFrom` for cached failures.
    #[tracing::instrument(skip(self), err)]
    pub async fn get_last_build_step_id(&mut self, path: &str) -> sqlx::Result<Option<i32>> {
        Ok(sqlx::query(
            "SELECT MAX(build) AS max FROM buildsteps
             WHERE drvpath = $1 AND starttime != 0 AND stoptime != 0 AND status = 1",
        )
        .bind(path)
        .fetch_optional(&mut *self.tx)
        .await?
        .and_then(|row| row.try_get("max").ok()))
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn get_last_build_step_id_for_output_path(
        &mut self,
        path: &str,
    ) -> sqlx::Result<Option<i32>> {
        Ok(sqlx::query(
            r"
            SELECT MAX(s.build) AS max FROM buildsteps s
            JOIN buildstepoutputs o ON s.build = o.build
            WHERE s.starttime != 0
              AND s.stoptime != 0
              AND s.status = 1
              AND o.path = $1",
        )
        .bind(path)
        .fetch_optional(&mut *self.tx)
        .await?
        .and_then(|row| row.try_get("max").ok()))
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn alloc_build_step(&mut self, build_id: BuildID) -> sqlx::Result<i32> {
        Ok(
            sqlx::query("SELECT MAX(stepnr) AS max FROM buildsteps WHERE build = $1")
                .bind(build_id)
                .fetch_optional(&mut *self.tx)
                .await?
                .and_then(|row| row.try_get::<Option<i32>, _>("max").ok().flatten())
                .map_or(1, |v| v + 1),
        )
    }

    #[tracing::instrument(skip(self, step), err)]
    pub async fn insert_build_step(&mut self, step: InsertBuildStep<'_>) -> sqlx::Result<bool> {
        let success = sqlx::query(
            r"
            INSERT INTO buildsteps (
              build,
              stepnr,
              type,
              drvpath,
              busy,
              starttime,
              stoptime,
              system,
              status,
              propagatedfrom,
              errormsg,
              machine
            ) VALUES (
              $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12
            )
            ON CONFLICT DO NOTHING",
        )
        .bind(step.build_id)
        .bind(step.step_nr)
        .bind(step.r#type as i32)
        .bind(step.drv_path)
        .bind(i32::from(step.busy))
        .bind(step.start_time)
        .bind(step.stop_time)
        .bind(step.system)
        .bind(if step.status == BuildStatus::Busy {
            None
        } else {
            Some(step.status as i32)
        })
        .bind(step.propagated_from)
        .bind(step.error_msg)
        .bind(step.machine)
        .execute(&mut *self.tx)
        .await?
        .rows_affected()
            != 0;
        Ok(success)
    }

    #[tracing::instrument(skip(self, outputs), err)]
    pub async fn insert_build_step_outputs(
        &mut self,
        outputs: &[InsertBuildStepOutput],
    ) -> sqlx::Result<()> {
        if outputs.is_empty() {
            return Ok(());
        }

        let mut query_builder =
            sqlx::QueryBuilder::new("INSERT INTO buildstepoutputs (build, stepnr, name, path) ");

        query_builder.push_values(outputs, |mut b, output| {
            b.push_bind(output.build_id)
                .push_bind(output.step_nr)
                .push_bind(&output.name)
                .push_bind(&output.path);
        });
        let query = query_builder.build();
        query.execute(&mut *self.tx).await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, name, path), err)]
    pub async fn update_build_step_output(
        &mut self,
        build_id: BuildID,
        step_nr: i32,
        name: &str,
        path: &str,
    ) -> sqlx::Result<()> {
        sqlx::query(
            "UPDATE buildstepoutputs SET path = $4 WHERE build = $1 AND stepnr = $2 AND name = $3",
        )
        .bind(build_id)
        .bind(step_nr)
        .bind(name)
        .bind(path)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, name, path), err)]
    pub async fn update_build_output(
        &mut self,
        build_id: BuildID,
        name: &str,
        path: &str,
    ) -> sqlx::Result<()> {
        sqlx::query("UPDATE buildoutputs SET path = $3 WHERE build = $1 AND name = $2")
            .bind(build_id)
            .bind(name)
            .bind(path)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, res), err)]
    pub async fn update_build_step_in_finish(
        &mut self,
        res: UpdateBuildStepInFinish<'_>,
    ) -> sqlx::Result<()> {
        sqlx::query(
            r"
            UPDATE buildsteps SET
              busy = 0,
              status = $1,
              errormsg = $4,
              starttime = $5,
              stoptime = $6,
              machine = $7,
              overhead = $8
            WHERE
              build = $2 AND stepnr = $3",
        )
        .bind(res.status as i32)
        .bind(res.build_id)
        .bind(res.step_nr)
        .bind(res.error_msg)
        .bind(res.start_time)
        .bind(res.stop_time)
        .bind(res.machine)
        .bind(res.overhead)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, build_id), err)]
    pub async fn check_if_build_is_not_finished(
        &mut self,
        build_id: BuildID,
    ) -> sqlx::Result<bool> {
        Ok(
            sqlx::query("SELECT id FROM builds WHERE id = $1 AND finished = 0")
                .bind(build_id)
                .fetch_optional(&mut *self.tx)
                .await?
                .is_some(),
        )
    }

    /// Remember failed output paths so future builds requiring them can
    /// short-circuit without a step.
    #[tracing::instrument(skip(self, path), err)]
    pub async fn insert_failed_paths(&mut self, path: &str) -> sqlx::Result<()> {
        sqlx::query("INSERT INTO failedpaths (path) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(path)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(
        skip(self, start_time, build_id, system, machine, status, error_msg, propagated_from),
        err
    )]
    pub async fn create_build_step(
        &mut self,
        start_time: Option<i32>,
        build_id: BuildID,
        drv_path: &str,
        system: Option<&str>,
        machine: String,
        status: BuildStatus,
        error_msg: Option<String>,
        propagated_from: Option<BuildID>,
        outputs: Vec<(String, Option<String>)>,
    ) -> sqlx::Result<i32> {
        let step_nr = loop {
            let step_nr = self.alloc_build_step(build_id).await?;
            if self
                .insert_build_step(InsertBuildStep {
                    build_id,
                    step_nr,
                    r#type: super::models::BuildType::Build,
                    drv_path,
                    status,
                    busy: status == BuildStatus::Busy,
                    start_time,
                    stop_time: if status == BuildStatus::Busy {
                        None
                    } else {
                        start_time
                    },
                    system,
                    propagated_from,
                    error_msg: error_msg.as_deref(),
                    machine: &machine,
                })
                .await?
            {
                break step_nr;
            }
        };

        self.insert_build_step_outputs(
            &outputs
                .into_iter()
                .map(|(name, path)| InsertBuildStepOutput {
                    build_id,
                    step_nr,
                    name,
                    path,
                })
                .collect::<Vec<_>>(),
        )
        .await?;

        if status == BuildStatus::Busy {
            self.notify_step_started(build_id, step_nr).await?;
        }

        Ok(step_nr)
    }

    #[tracing::instrument(skip(self, outputs, is_cached_build, start_time, stop_time), err)]
    pub async fn mark_succeeded_build(
        &mut self,
        build_id: BuildID,
        failed: bool,
        outputs: &[(String, String)],
        is_cached_build: bool,
        start_time: i32,
        stop_time: i32,
    ) -> sqlx::Result<()> {
        if !self.check_if_build_is_not_finished(build_id).await? {
            return Ok(());
        }

        self.update_build(
            build_id,
            UpdateBuild {
                status: if failed {
                    BuildStatus::FailedWithOutput
                } else {
                    BuildStatus::Success
                },
                start_time,
                stop_time,
                is_cached_build,
            },
        )
        .await?;

        for (name, path) in outputs {
            self.update_build_output(build_id, name, path).await?;
        }

        Ok(())
    }

    #[tracing::instrument(skip(self, status), err)]
    pub async fn upsert_status(&mut self, status: &serde_json::Value) -> sqlx::Result<()> {
        sqlx::query(
            r"INSERT INTO systemstatus (
              what, status
            ) VALUES (
              'queue-runner', $1
            ) ON CONFLICT (what) DO UPDATE SET status = EXCLUDED.status",
        )
        .bind(status)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }
}

impl Transaction<'_> {
    #[tracing::instrument(skip(self), err)]
    async fn notify_any(&mut self, channel: &str, msg: &str) -> sqlx::Result<()> {
        sqlx::query(
            r"SELECT pg_notify(chan, payload) from (values ($1, $2)) notifies(chan, payload)",
        )
        .bind(channel)
        .bind(msg)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn notify_builds_added(&mut self) -> sqlx::Result<()> {
        self.notify_any("builds_added", "?").await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, build_id, dependent_ids), err)]
    pub async fn notify_build_finished(
        &mut self,
        build_id: BuildID,
        dependent_ids: &[BuildID],
    ) -> sqlx::Result<()> {
        let mut q = vec![build_id.to_string()];
        q.extend(dependent_ids.iter().map(ToString::to_string));

        self.notify_any("build_finished", &q.join("\t")).await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, build_id, step_nr), err)]
    pub async fn notify_step_started(&mut self, build_id: BuildID, step_nr: i32) -> sqlx::Result<()> {
        self.notify_any("step_started", &format!("{build_id}\t{step_nr}"))
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, build_id, step_nr, log_file), err)]
    pub async fn notify_step_finished(
        &mut self,
        build_id: BuildID,
        step_nr: i32,
        log_file: &str,
    ) -> sqlx::Result<()> {
        self.notify_any("step_finished", &format!("{build_id}\t{step_nr}\t{log_file}"))
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn notify_dump_status(&mut self) -> sqlx::Result<()> {
        self.notify_any("dump_status", "").await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn notify_status_dumped(&mut self) -> sqlx::Result<()> {
        self.notify_any("status_dumped", "").await?;
        Ok(())
    }
}
