use std::sync::Arc;

use hashbrown::HashMap;

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DumpResponse {
    #[serde(flatten)]
    queue_runner: super::QueueRunnerStats,
    machines: HashMap<String, super::Machine>,
    jobsets: HashMap<String, super::Jobset>,
}

impl DumpResponse {
    #[must_use]
    pub fn new(state: &Arc<crate::state::State>) -> Self {
        let machines = state
            .machines
            .get_all_machines()
            .into_iter()
            .map(|m| (m.ssh_name.clone(), super::Machine::from(&m)))
            .collect();
        Self {
            queue_runner: super::QueueRunnerStats::new(state),
            machines,
            jobsets: state.jobsets.clone_as_io(),
        }
    }
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachinesResponse {
    machines: HashMap<String, super::Machine>,
}

impl MachinesResponse {
    #[must_use]
    pub fn new(machines: HashMap<String, super::Machine>) -> Self {
        Self { machines }
    }
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobsetsResponse {
    jobsets: HashMap<String, super::Jobset>,
}

impl JobsetsResponse {
    #[must_use]
    pub fn new(jobsets: HashMap<String, super::Jobset>) -> Self {
        Self { jobsets }
    }
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildsResponse {
    builds: Vec<super::Build>,
}

impl BuildsResponse {
    #[must_use]
    pub fn new(builds: Vec<super::Build>) -> Self {
        Self { builds }
    }
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepsResponse {
    steps: Vec<super::Step>,
}

impl StepsResponse {
    #[must_use]
    pub fn new(steps: Vec<super::Step>) -> Self {
        Self { steps }
    }
}
