//! The pipeline executor boundary.
//!
//! A pipeline is blocking, long-running work: it gets a decoded payload and
//! returns the two result locators or fails with a message. The dispatcher
//! always runs it on tokio's blocking pool, so implementations are free to
//! block the calling thread for as long as they need.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, Stdio};
use std::thread;

use tracing::{debug, warn};

use super::status::StatusReporter;
use crate::job::{JobPayload, ResultLocators};
use crate::utils::error::PipelineError;

/// Everything a pipeline run gets to see.
#[derive(Debug, Clone)]
pub struct JobContext {
    correlation_id: String,
    payload: JobPayload,
    status: StatusReporter,
}

impl JobContext {
    pub fn new(
        correlation_id: impl Into<String>,
        payload: JobPayload,
        status: StatusReporter,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            payload,
            status,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn payload(&self) -> &JobPayload {
        &self.payload
    }

    /// Publishes a keep-alive/progress line tagged with this job.
    pub fn report_status(&self, text: impl Into<String>) {
        self.status.report(&self.correlation_id, text);
    }
}

pub trait PipelineExecutor: Send + Sync + 'static {
    fn execute(&self, job: &JobContext) -> Result<ResultLocators, PipelineError>;
}

impl<F> PipelineExecutor for F
where
    F: Fn(&JobContext) -> Result<ResultLocators, PipelineError> + Send + Sync + 'static,
{
    fn execute(&self, job: &JobContext) -> Result<ResultLocators, PipelineError> {
        self(job)
    }
}

/// Runs an external program per job.
///
/// The payload JSON goes to the program's stdin and the correlation id is
/// exported as `JOB_ID`. Stdout lines of the form `status: <text>` are
/// forwarded as status records; the last other stdout line must hold
/// `{"resultImageURL": ..., "resultShapefileURL": ...}`. A non-zero exit fails
/// the job with the last line the program wrote to stderr.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

const STATUS_PREFIX: &str = "status:";

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl PipelineExecutor for CommandExecutor {
    fn execute(&self, job: &JobContext) -> Result<ResultLocators, PipelineError> {
        let input = job.payload().as_bytes().to_vec();

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("JOB_ID", job.correlation_id())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| PipelineError::new(format!("failed to start '{}': {e}", self.program)))?;
        debug!(program = %self.program, pid = child.id(), "pipeline started");

        let (Some(mut stdin), Some(stdout), Some(mut stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            reap(&mut child);
            return Err(PipelineError::new("pipeline stdio was not captured"));
        };

        // Feed stdin and drain stderr on their own threads so neither pipe
        // can fill up while stdout is being read.
        let writer = thread::spawn(move || stdin.write_all(&input));
        let errors = thread::spawn(move || {
            let mut text = String::new();
            stderr.read_to_string(&mut text).map(|_| text)
        });

        let mut last_line = None;
        for line in BufReader::new(stdout).lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    warn!(program = %self.program, error = %err, "killing unreadable pipeline");
                    reap(&mut child);
                    return Err(PipelineError::new(format!(
                        "failed to read pipeline output: {err}"
                    )));
                }
            };
            if let Some(text) = line.strip_prefix(STATUS_PREFIX) {
                job.report_status(text.trim());
            } else if !line.trim().is_empty() {
                last_line = Some(line);
            }
        }

        let status = child
            .wait()
            .map_err(|e| PipelineError::new(format!("failed to wait for pipeline: {e}")))?;
        if let Ok(Err(err)) = writer.join() {
            // The program may legitimately exit without reading its input.
            debug!(error = %err, "pipeline did not consume its payload");
        }
        let stderr_text = match errors.join() {
            Ok(Ok(text)) => text,
            _ => String::new(),
        };

        if !status.success() {
            let message = stderr_text
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .map(|line| line.trim().to_string())
                .unwrap_or_else(|| format!("pipeline exited with {status}"));
            warn!(program = %self.program, %status, "pipeline failed");
            return Err(PipelineError::new(message));
        }

        let last_line =
            last_line.ok_or_else(|| PipelineError::new("pipeline produced no result"))?;
        serde_json::from_str(&last_line)
            .map_err(|e| PipelineError::new(format!("pipeline result is not valid: {e}")))
    }
}

/// Kills a pipeline that is being given up on and collects its exit status.
fn reap(child: &mut Child) {
    if let Err(err) = child.kill() {
        debug!(error = %err, "pipeline already exited");
    }
    let _ = child.wait();
}
