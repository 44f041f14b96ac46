use std::sync::Arc;
use std::sync::atomic::Ordering;

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub drv_path: store_utils::StorePath,
    pub system_type: Option<String>,
    pub runnable: bool,
    pub finished: bool,
    pub tries: u32,
    pub deps: u64,
    pub highest_global_priority: i32,
    pub highest_local_priority: i32,
    pub lowest_build_id: db::models::BuildID,
    pub after: jiff::Timestamp,
    pub runnable_since: jiff::Timestamp,
}

impl From<Arc<crate::state::Step>> for Step {
    fn from(v: Arc<crate::state::Step>) -> Self {
        Self {
            drv_path: v.get_drv_path().clone(),
            system_type: v.get_system_type(),
            runnable: v.get_runnable(),
            finished: v.get_finished(),
            tries: v.atomic_state.tries.load(Ordering::Relaxed),
            deps: v.get_deps_size(),
            highest_global_priority: v
                .atomic_state
                .highest_global_priority
                .load(Ordering::Relaxed),
            highest_local_priority: v.atomic_state.highest_local_priority.load(Ordering::Relaxed),
            lowest_build_id: v.atomic_state.lowest_build_id.load(Ordering::Relaxed),
            after: v.get_after(),
            runnable_since: v.get_runnable_since(),
        }
    }
}
