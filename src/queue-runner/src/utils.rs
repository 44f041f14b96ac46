use db::models::BuildID;

use crate::state::RemoteBuild;

/// Write the final state of a build-step row and announce it on the
/// `step_finished` channel.
#[tracing::instrument(skip(db, res), err)]
pub async fn finish_build_step(
    db: &db::Database,
    build_id: BuildID,
    step_nr: i32,
    res: &RemoteBuild,
    machine: Option<String>,
) -> anyhow::Result<()> {
    let mut conn = db.get().await?;
    let mut tx = conn.begin_transaction().await?;

    debug_assert!(res.has_start_time());
    debug_assert!(res.has_stop_time());
    tracing::info!(
        "Writing buildstep result in db. step_status={:?} start_time={:?} stop_time={:?}",
        res.step_status,
        res.get_start_time_as_i32(),
        res.get_stop_time_as_i32(),
    );
    tx.update_build_step_in_finish(db::models::UpdateBuildStepInFinish {
        build_id,
        step_nr,
        status: res.step_status,
        error_msg: res.error_msg.as_deref(),
        start_time: res.get_start_time_as_i32()?,
        stop_time: res.get_stop_time_as_i32()?,
        machine: machine.as_deref(),
        overhead: res.get_overhead(),
    })
    .await?;

    debug_assert!(!res.log_file.is_empty());
    debug_assert!(!res.log_file.contains('\t'));
    tx.notify_step_finished(build_id, step_nr, &res.log_file)
        .await?;

    tx.commit().await?;
    Ok(())
}
