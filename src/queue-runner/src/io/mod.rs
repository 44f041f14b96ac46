pub mod build;
pub mod jobset;
pub mod machine;
pub mod queue_runner;
pub mod response_types;
pub mod step;

pub use build::Build;
pub use jobset::Jobset;
pub use machine::Machine;
pub use queue_runner::QueueRunnerStats;
pub use response_types::{
    BuildsResponse, DumpResponse, JobsetsResponse, MachinesResponse, StepsResponse,
};
pub use step::Step;

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Empty {}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Error {
    pub error: String,
}
