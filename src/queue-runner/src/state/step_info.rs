use std::sync::Arc;
use std::sync::atomic::Ordering;

use db::models::BuildID;

use super::Step;

/// Per-pass snapshot of the fields the dispatcher sorts on. Shared state
/// is sampled once when the snapshot is taken so one pass sees a
/// consistent ordering.
pub struct StepInfo {
    pub step: Arc<Step>,
    pub system_type: Option<String>,
    pub runnable_since: jiff::Timestamp,
    pub after: jiff::Timestamp,
    lowest_share_used: f64,
}

impl StepInfo {
    #[must_use]
    pub fn new(step: Arc<Step>) -> Self {
        Self {
            system_type: step.get_system_type(),
            runnable_since: step.get_runnable_since(),
            after: step.get_after(),
            lowest_share_used: step.get_lowest_share_used(),
            step,
        }
    }

    #[must_use]
    pub fn get_lowest_share_used(&self) -> f64 {
        self.lowest_share_used
    }

    #[must_use]
    pub fn get_highest_global_priority(&self) -> i32 {
        self.step
            .atomic_state
            .highest_global_priority
            .load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn get_highest_local_priority(&self) -> i32 {
        self.step
            .atomic_state
            .highest_local_priority
            .load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn get_lowest_build_id(&self) -> BuildID {
        self.step
            .atomic_state
            .lowest_build_id
            .load(Ordering::Relaxed)
    }

    /// The dispatch order. `Less` means this step is dispatched first:
    /// higher global priority, then the least-served jobset (fairness),
    /// then higher local priority, then FIFO by build id, then age, then
    /// the derivation path as a deterministic final tie-break.
    #[must_use]
    pub fn dispatch_compare(&self, other: &Self) -> std::cmp::Ordering {
        self.get_highest_global_priority()
            .cmp(&other.get_highest_global_priority())
            .reverse()
            .then_with(|| {
                self.get_lowest_share_used()
                    .total_cmp(&other.get_lowest_share_used())
            })
            .then_with(|| {
                self.get_highest_local_priority()
                    .cmp(&other.get_highest_local_priority())
                    .reverse()
            })
            .then_with(|| self.get_lowest_build_id().cmp(&other.get_lowest_build_id()))
            .then_with(|| self.runnable_since.cmp(&other.runnable_since))
            .then_with(|| self.step.get_drv_path().cmp(other.step.get_drv_path()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(clippy::cast_sign_loss)]
    fn create_test_step(
        drv: &str,
        highest_global_priority: i32,
        highest_local_priority: i32,
        lowest_build_id: BuildID,
        lowest_share_used: f64,
        runnable_since_offset_s: i64,
    ) -> StepInfo {
        let step = Step::new(store_utils::StorePath::new(drv));

        step.atomic_state
            .highest_global_priority
            .store(highest_global_priority, Ordering::Relaxed);
        step.atomic_state
            .highest_local_priority
            .store(highest_local_priority, Ordering::Relaxed);
        step.atomic_state
            .lowest_build_id
            .store(lowest_build_id, Ordering::Relaxed);

        StepInfo {
            step,
            system_type: None,
            runnable_since: jiff::Timestamp::UNIX_EPOCH
                + jiff::SignedDuration::from_secs(runnable_since_offset_s),
            after: jiff::Timestamp::UNIX_EPOCH,
            lowest_share_used,
        }
    }

    const DRV_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-a.drv";
    const DRV_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-b.drv";

    #[test]
    fn test_compare_global_priority_beats_lower_id() {
        // build 101 with global priority 100 goes before build 100
        let bumped = create_test_step(DRV_A, 100, 0, 101, 1.0, 0);
        let older = create_test_step(DRV_B, 0, 0, 100, 1.0, 0);

        assert_eq!(bumped.dispatch_compare(&older), std::cmp::Ordering::Less);
        assert_eq!(older.dispatch_compare(&bumped), std::cmp::Ordering::Greater);
    }

    #[test]
    fn test_compare_underserved_jobset_first() {
        // jobset with no history beats one with 3600 used seconds
        let served = create_test_step(DRV_A, 0, 0, 1, 3600.0, 0);
        let starved = create_test_step(DRV_B, 0, 0, 2, 0.0, 0);

        assert_eq!(starved.dispatch_compare(&served), std::cmp::Ordering::Less);
        assert_eq!(served.dispatch_compare(&starved), std::cmp::Ordering::Greater);
    }

    #[test]
    fn test_compare_local_priority() {
        let high = create_test_step(DRV_A, 0, 10, 2, 1.0, 0);
        let low = create_test_step(DRV_B, 0, 5, 1, 1.0, 0);

        assert_eq!(high.dispatch_compare(&low), std::cmp::Ordering::Less);
    }

    #[test]
    fn test_compare_fifo_by_build_id() {
        let first = create_test_step(DRV_A, 0, 0, 1, 1.0, 0);
        let second = create_test_step(DRV_B, 0, 0, 2, 1.0, 0);

        assert_eq!(first.dispatch_compare(&second), std::cmp::Ordering::Less);
        assert_eq!(second.dispatch_compare(&first), std::cmp::Ordering::Greater);
    }

    #[test]
    fn test_compare_age_tie_break() {
        let old = create_test_step(DRV_B, 0, 0, 1, 1.0, 10);
        let older = create_test_step(DRV_A, 0, 0, 1, 1.0, 5);

        assert_eq!(older.dispatch_compare(&old), std::cmp::Ordering::Less);
    }

    #[test]
    fn test_compare_path_tie_break_is_deterministic() {
        let a = create_test_step(DRV_A, 0, 0, 1, 1.0, 0);
        let b = create_test_step(DRV_B, 0, 0, 1, 1.0, 0);

        assert_eq!(a.dispatch_compare(&b), std::cmp::Ordering::Less);
        assert_eq!(b.dispatch_compare(&a), std::cmp::Ordering::Greater);
    }

    #[test]
    fn test_compare_same_step_is_equal() {
        let a = create_test_step(DRV_A, 5, 1, 1, 1.0, 0);
        let b = create_test_step(DRV_A, 5, 1, 1, 1.0, 0);

        assert_eq!(a.dispatch_compare(&b), std::cmp::Ordering::Equal);
    }

    #[test]
    fn test_sort_orders_full_queue() {
        let mut steps = vec![
            create_test_step(DRV_B, 0, 0, 7, 1.0, 0),
            create_test_step(DRV_A, 0, 0, 3, 1.0, 0),
            create_test_step("cccccccccccccccccccccccccccccccc-c.drv", 50, 0, 9, 1.0, 0),
        ];
        steps.sort_by(StepInfo::dispatch_compare);

        let ids: Vec<BuildID> = steps.iter().map(StepInfo::get_lowest_build_id).collect();
        assert_eq!(ids, vec![9, 3, 7]);
    }
}
