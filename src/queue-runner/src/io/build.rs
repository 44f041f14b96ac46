use std::sync::Arc;
use std::sync::atomic::Ordering;

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    pub id: db::models::BuildID,
    pub drv_path: store_utils::StorePath,
    pub jobset_id: crate::state::JobsetID,
    pub full_job_name: String,
    pub timestamp: jiff::Timestamp,
    pub max_silent_time: i32,
    pub timeout: i32,
    pub local_priority: i32,
    pub global_priority: i32,
    pub finished_in_db: bool,
}

impl From<Arc<crate::state::Build>> for Build {
    fn from(v: Arc<crate::state::Build>) -> Self {
        Self {
            id: v.id,
            drv_path: v.drv_path.clone(),
            jobset_id: v.jobset_id,
            full_job_name: v.full_job_name(),
            timestamp: v.timestamp,
            max_silent_time: v.max_silent_time,
            timeout: v.timeout,
            local_priority: v.local_priority,
            global_priority: v.global_priority.load(Ordering::Relaxed),
            finished_in_db: v.get_finished_in_db(),
        }
    }
}
