pub type BuildID = i32;

/// Persisted build and build-step status codes. The numeric values are
/// stable; external consumers depend on them.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Success = 0,
    Failed = 1,
    DepFailed = 2, // builds only
    Aborted = 3,
    Cancelled = 4,        // steps only
    FailedWithOutput = 6, // builds only
    TimedOut = 7,
    CachedFailure = 8, // steps only
    Unsupported = 9,
    LogLimitExceeded = 10,
    Busy = 100, // not stored
}

impl BuildStatus {
    #[must_use]
    pub const fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::Success),
            1 => Some(Self::Failed),
            2 => Some(Self::DepFailed),
            3 => Some(Self::Aborted),
            4 => Some(Self::Cancelled),
            6 => Some(Self::FailedWithOutput),
            7 => Some(Self::TimedOut),
            8 => Some(Self::CachedFailure),
            9 => Some(Self::Unsupported),
            10 => Some(Self::LogLimitExceeded),
            100 => Some(Self::Busy),
            _ => None,
        }
    }
}

/// In-flight phases of a busy build step, written to the `busy` column so
/// the web frontend can show progress.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Preparing = 1,
    Connecting = 10,
    Building = 30,
    ReceivingOutputs = 40,
}

#[derive(Debug, sqlx::FromRow)]
pub struct Jobset {
    pub project: String,
    pub name: String,
    pub schedulingshares: i32,
}

#[derive(Debug, sqlx::FromRow)]
pub struct BuildSmall {
    pub id: BuildID,
    pub globalpriority: i32,
}

#[derive(Debug, sqlx::FromRow)]
pub struct Build {
    pub id: BuildID,
    pub jobset_id: i32,
    pub project: String,
    pub jobset: String,
    pub job: String,
    pub drvpath: String,
    pub maxsilent: Option<i32>,
    pub timeout: Option<i32>,
    pub timestamp: i64,
    pub globalpriority: i32,
    pub priority: i32,
}

#[derive(Debug, sqlx::FromRow)]
pub struct BuildStepWindow {
    pub starttime: Option<i32>,
    pub stoptime: Option<i32>,
}

#[repr(i32)]
pub enum BuildType {
    Build = 0,
}

pub struct UpdateBuild {
    pub status: BuildStatus,
    pub start_time: i32,
    pub stop_time: i32,
    pub is_cached_build: bool,
}

pub struct InsertBuildStep<'a> {
    pub build_id: BuildID,
    pub step_nr: i32,
    pub r#type: BuildType,
    pub drv_path: &'a str,
    pub status: BuildStatus,
    pub busy: bool,
    pub start_time: Option<i32>,
    pub stop_time: Option<i32>,
    pub system: Option<&'a str>,
    pub propagated_from: Option<BuildID>,
    pub error_msg: Option<&'a str>,
    pub machine: &'a str,
}

pub struct InsertBuildStepOutput {
    pub build_id: BuildID,
    pub step_nr: i32,
    pub name: String,
    pub path: Option<String>,
}

pub struct UpdateBuildStep {
    pub build_id: BuildID,
    pub step_nr: i32,
    pub status: StepStatus,
}

pub struct UpdateBuildStepInFinish<'a> {
    pub build_id: BuildID,
    pub step_nr: i32,
    pub status: BuildStatus,
    pub error_msg: Option<&'a str>,
    pub start_time: i32,
    pub stop_time: i32,
    pub machine: Option<&'a str>,
    pub overhead: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_status_codes_are_stable() {
        assert_eq!(BuildStatus::Success as i32, 0);
        assert_eq!(BuildStatus::Failed as i32, 1);
        assert_eq!(BuildStatus::DepFailed as i32, 2);
        assert_eq!(BuildStatus::Aborted as i32, 3);
        assert_eq!(BuildStatus::FailedWithOutput as i32, 6);
        assert_eq!(BuildStatus::TimedOut as i32, 7);
        assert_eq!(BuildStatus::Unsupported as i32, 9);
        assert_eq!(BuildStatus::LogLimitExceeded as i32, 10);
    }

    #[test]
    fn test_build_status_from_i32_round_trip() {
        for v in [0, 1, 2, 3, 4, 6, 7, 8, 9, 10, 100] {
            let status = BuildStatus::from_i32(v);
            assert_eq!(status.map(|s| s as i32), Some(v));
        }
        assert!(BuildStatus::from_i32(5).is_none());
        assert!(BuildStatus::from_i32(42).is_none());
    }
}
