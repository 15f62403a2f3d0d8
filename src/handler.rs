//! Job handlers run by a [`Worker`](crate::worker::Worker).

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::model::{JobRecord, Outcome};

/// Executes one job and reports how it went. Handlers never fail the
/// worker: every problem becomes a `Failed` outcome.
pub trait JobHandler: Send + Sync + 'static {
    fn handle(&self, record: &JobRecord) -> impl Future<Output = Outcome> + Send;
}

/// Sleeps for a fixed time, then succeeds.
#[derive(Debug, Clone)]
pub struct SimulatedHandler {
    duration: Duration,
}

impl SimulatedHandler {
    pub const DEFAULT_DURATION: Duration = Duration::from_millis(2000);

    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

impl Default for SimulatedHandler {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DURATION)
    }
}

impl JobHandler for SimulatedHandler {
    async fn handle(&self, record: &JobRecord) -> Outcome {
        debug!(job_id = %record.id, duration_ms = self.duration.as_millis() as u64, "simulating job");
        tokio::time::sleep(self.duration).await;
        Outcome::success("Job success")
    }
}

/// Runs an external executable per job.
///
/// The job is exposed through `JOBQ_JOB_ID`, `JOBQ_JOB_TYPE` and one
/// `JOBQ_FIELD_<KEY>` variable per payload field. Exit status 0 is success.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    command: PathBuf,
}

impl CommandHandler {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn command(&self) -> &Path {
        &self.command
    }

    async fn run(&self, record: &JobRecord) -> std::io::Result<std::process::ExitStatus> {
        // Resolve relative paths against the process CWD up front.
        let command = if self.command.is_relative() {
            std::env::current_dir()?.join(&self.command)
        } else {
            self.command.clone()
        };
        debug!(job_id = %record.id, command = %command.display(), "running job command");

        let mut cmd = Command::new(&command);
        cmd.env("JOBQ_JOB_ID", record.id.to_string())
            .env("JOBQ_JOB_TYPE", &record.job_type)
            .kill_on_drop(true);
        for (key, value) in &record.payload {
            cmd.env(field_env_name(key), value);
        }
        cmd.status().await
    }
}

impl JobHandler for CommandHandler {
    async fn handle(&self, record: &JobRecord) -> Outcome {
        match self.run(record).await {
            Ok(status) if status.success() => Outcome::success("Job success"),
            Ok(status) => Outcome::failed(match status.code() {
                Some(code) => format!("command exited with status {code}"),
                None => "command terminated by signal".to_string(),
            }),
            Err(e) => Outcome::failed(format!("failed to run {}: {e}", self.command.display())),
        }
    }
}

/// `commitHash` -> `JOBQ_FIELD_COMMITHASH`.
fn field_env_name(key: &str) -> String {
    let mut name = String::with_capacity("JOBQ_FIELD_".len() + key.len());
    name.push_str("JOBQ_FIELD_");
    name.extend(key.chars().map(|c| {
        if c.is_ascii_alphanumeric() {
            c.to_ascii_uppercase()
        } else {
            '_'
        }
    }));
    name
}
