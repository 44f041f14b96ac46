//! The interface to the remote build protocol. Opening the connection,
//! copying the closure, running the builder and fetching outputs all live
//! behind [`RemoteBuilder`]; the scheduler only consumes the result.

use std::sync::Arc;

use crate::state::{Machine, Step};

#[derive(Debug, Clone, Copy)]
pub struct BuildOptions {
    pub max_silent_time: i32,
    pub build_timeout: i32,
    pub max_log_size: u64,
}

/// Terminal classification of one remote execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteBuildOutcome {
    Success,
    /// Infrastructure hiccup (connect failure, closure copy interrupted).
    TransientFailure,
    /// Failure of unknown provenance; treated like transient for retries.
    MiscFailure,
    /// The builder itself failed; retrying cannot help.
    PermanentFailure,
    TimedOut,
    LogLimitExceeded,
    /// The machine produced outputs the store refused to accept.
    OutputRejected,
}

impl RemoteBuildOutcome {
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::TransientFailure | Self::MiscFailure)
    }

    /// The build-step status persisted for this outcome. Retryable
    /// failures are recorded as aborted steps, terminal ones with their
    /// specific status.
    #[must_use]
    pub const fn step_status(self) -> db::models::BuildStatus {
        match self {
            Self::Success => db::models::BuildStatus::Success,
            Self::TransientFailure | Self::MiscFailure => db::models::BuildStatus::Cancelled,
            Self::PermanentFailure | Self::OutputRejected => db::models::BuildStatus::Failed,
            Self::TimedOut => db::models::BuildStatus::TimedOut,
            Self::LogLimitExceeded => db::models::BuildStatus::LogLimitExceeded,
        }
    }
}

#[derive(Debug)]
pub struct RemoteBuildResult {
    pub outcome: RemoteBuildOutcome,
    pub error_msg: Option<String>,
    pub start_time: jiff::Timestamp,
    pub stop_time: jiff::Timestamp,
    /// Seconds spent on closure transfer rather than building.
    pub overhead: i32,
    /// Whether the outputs carry a failure marker (failed-with-output).
    pub failed_with_output: bool,
}

#[async_trait::async_trait]
pub trait RemoteBuilder: Send + Sync {
    async fn build(
        &self,
        machine: &Arc<Machine>,
        step: &Arc<Step>,
        log_file: &std::path::Path,
        opts: &BuildOptions,
    ) -> anyhow::Result<RemoteBuildResult>;
}

/// Exit codes of the remote build helper, stable contract with
/// `forge-remote-build`.
const EXIT_PERMANENT: i32 = 100;
const EXIT_TIMEOUT: i32 = 101;
const EXIT_LOG_LIMIT: i32 = 102;
const EXIT_OUTPUT_REJECTED: i32 = 103;
const EXIT_FAILED_WITH_OUTPUT: i32 = 104;

/// Drives a build over ssh by invoking the remote build helper on the
/// target machine. The closure transfer at the start of the session is
/// serialised per machine by the machine's send lock.
pub struct SshBuilder {
    ssh_program: String,
}

impl Default for SshBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SshBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
        }
    }

    fn command(
        &self,
        machine: &Machine,
        step: &Step,
        opts: &BuildOptions,
        known_hosts: Option<&std::path::Path>,
    ) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.ssh_program);
        cmd.arg("-x").arg("-a");
        if let Some(key) = &machine.ssh_key {
            cmd.arg("-i").arg(key);
        }
        if let Some(known_hosts) = known_hosts {
            cmd.arg("-o")
                .arg(format!("UserKnownHostsFile={}", known_hosts.display()))
                .arg("-o")
                .arg("StrictHostKeyChecking=yes");
        }
        cmd.arg(&machine.ssh_name)
            .arg("--")
            .arg("forge-remote-build")
            .arg(step.get_drv_path().base_name())
            .arg("--max-silent-time")
            .arg(opts.max_silent_time.to_string())
            .arg("--timeout")
            .arg(opts.build_timeout.to_string())
            .arg("--max-log-size")
            .arg(opts.max_log_size.to_string());
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        cmd
    }
}

#[async_trait::async_trait]
impl RemoteBuilder for SshBuilder {
    #[tracing::instrument(skip(self, machine, step, log_file, opts), fields(machine = %machine.ssh_name, drv = %step.get_drv_path()), err)]
    async fn build(
        &self,
        machine: &Arc<Machine>,
        step: &Arc<Step>,
        log_file: &std::path::Path,
        opts: &BuildOptions,
    ) -> anyhow::Result<RemoteBuildResult> {
        use tokio::io::AsyncWriteExt as _;

        let start_time = jiff::Timestamp::now();

        // The declared host key is pinned through a per-session
        // known-hosts file.
        let known_hosts = machine
            .public_host_key
            .as_ref()
            .map(|host_key| {
                let file = tempfile::NamedTempFile::new()?;
                std::fs::write(file.path(), format!("{} {host_key}\n", machine.ssh_name))?;
                Ok::<_, std::io::Error>(file)
            })
            .transpose()?;

        let mut child = self
            .command(machine, step, opts, known_hosts.as_ref().map(|f| f.path()))
            .spawn()?;

        // Feed the input closure manifest while holding the machine's
        // send lock: one outbound transfer at a time per machine.
        let send_start = std::time::Instant::now();
        {
            let send_lock = machine.send_lock();
            let _guard = send_lock.lock().await;
            if let Some(mut stdin) = child.stdin.take() {
                let inputs = step.get_input_drvs().unwrap_or_default();
                for input in inputs {
                    stdin.write_all(input.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                }
                stdin.shutdown().await?;
            }
        }
        #[allow(clippy::cast_possible_truncation)]
        let overhead = send_start.elapsed().as_secs() as i32;

        // Stream the build log to the step's log file.
        if let Some(stdout) = child.stdout.take() {
            let mut reader = tokio::io::BufReader::new(stdout);
            let mut file = fs_err::tokio::File::create(log_file).await?;
            tokio::io::copy_buf(&mut reader, &mut file).await?;
        }

        let output = child.wait_with_output().await?;
        let stop_time = jiff::Timestamp::now();

        let (outcome, failed_with_output) = match output.status.code() {
            Some(0) => (RemoteBuildOutcome::Success, false),
            Some(EXIT_FAILED_WITH_OUTPUT) => (RemoteBuildOutcome::Success, true),
            Some(EXIT_PERMANENT) => (RemoteBuildOutcome::PermanentFailure, false),
            Some(EXIT_TIMEOUT) => (RemoteBuildOutcome::TimedOut, false),
            Some(EXIT_LOG_LIMIT) => (RemoteBuildOutcome::LogLimitExceeded, false),
            Some(EXIT_OUTPUT_REJECTED) => (RemoteBuildOutcome::OutputRejected, false),
            // ssh connect failures and killed helpers are transient
            Some(255) | None => (RemoteBuildOutcome::TransientFailure, false),
            Some(_) => (RemoteBuildOutcome::MiscFailure, false),
        };

        let error_msg = if outcome == RemoteBuildOutcome::Success {
            None
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let msg = stderr.trim();
            if msg.is_empty() {
                Some(format!("remote build failed with {:?}", output.status))
            } else {
                Some(msg.to_string())
            }
        };

        Ok(RemoteBuildResult {
            outcome,
            error_msg,
            start_time,
            stop_time,
            overhead,
            failed_with_output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RemoteBuildOutcome::TransientFailure.is_retryable());
        assert!(RemoteBuildOutcome::MiscFailure.is_retryable());

        assert!(!RemoteBuildOutcome::Success.is_retryable());
        assert!(!RemoteBuildOutcome::PermanentFailure.is_retryable());
        assert!(!RemoteBuildOutcome::TimedOut.is_retryable());
        assert!(!RemoteBuildOutcome::LogLimitExceeded.is_retryable());
        assert!(!RemoteBuildOutcome::OutputRejected.is_retryable());
    }

    #[test]
    fn test_step_status_mapping() {
        use db::models::BuildStatus;

        assert_eq!(
            RemoteBuildOutcome::Success.step_status(),
            BuildStatus::Success
        );
        assert_eq!(
            RemoteBuildOutcome::PermanentFailure.step_status(),
            BuildStatus::Failed
        );
        assert_eq!(
            RemoteBuildOutcome::TimedOut.step_status(),
            BuildStatus::TimedOut
        );
        assert_eq!(
            RemoteBuildOutcome::LogLimitExceeded.step_status(),
            BuildStatus::LogLimitExceeded
        );
        assert_eq!(
            RemoteBuildOutcome::TransientFailure.step_status(),
            BuildStatus::Cancelled
        );
    }
}
