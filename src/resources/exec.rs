//! Command execution in pods via the Kubernetes exec API
//!
//! Used to drive `patronictl` and `pg_ctl` inside instance containers. The
//! tools report failures on stderr, so callers treat any stderr output as a
//! failed command regardless of the exit status. A failed exit status with
//! nothing on stderr is a failure too.

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use crate::controller::error::{Error, Result};

/// Captured output of a command run in a pod
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// Message of a non-successful exit status
    pub failure: Option<String>,
}

impl ExecOutput {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            failure: None,
        }
    }

    /// Output of a command that exited unsuccessfully
    pub fn failed(
        stdout: impl Into<String>,
        stderr: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::new(stdout, stderr)
        }
    }

    /// Stdout if the command succeeded and wrote nothing to stderr
    pub fn into_result(self) -> Result<String> {
        if !self.stderr.is_empty() {
            return Err(Error::CommandError(self.stderr));
        }
        match self.failure {
            Some(message) => Err(Error::CommandError(message)),
            None => Ok(self.stdout),
        }
    }
}

/// Execute a command in a pod and collect stdout and stderr
///
/// When `container` is `None` the pod's default container is used.
pub async fn exec_in_pod(
    pods: &Api<Pod>,
    pod_name: &str,
    container: Option<&str>,
    command: Vec<String>,
) -> Result<ExecOutput> {
    debug!(pod = pod_name, ?container, command = ?command, "exec in pod");

    let attach_params = AttachParams {
        container: container.map(str::to_string),
        stdin: true,
        stdout: true,
        stderr: true,
        tty: false,
        ..Default::default()
    };

    let mut attached = pods.exec(pod_name, command, &attach_params).await?;

    // Close stdin to signal end of input
    if let Some(mut stdin) = attached.stdin() {
        stdin.shutdown().await?;
    }

    let stdout = attached
        .stdout()
        .ok_or_else(|| Error::ExecError("Failed to get stdout from exec".to_string()))?;
    let stderr = attached
        .stderr()
        .ok_or_else(|| Error::ExecError("Failed to get stderr from exec".to_string()))?;

    // Drain both streams together so a chatty stderr cannot stall stdout
    let (stdout, stderr) = tokio::try_join!(read_stream(stdout), read_stream(stderr))?;

    let mut output = ExecOutput::new(stdout, stderr);
    if let Some(status) = attached.take_status()
        && let Some(status) = status.await
    {
        trace!(pod = pod_name, status = ?status.status, "exec finished");
        output.failure = exit_failure(&status);
    }

    Ok(output)
}

/// Failure message of an exec status, `None` when the command succeeded
fn exit_failure(status: &Status) -> Option<String> {
    if status.status.as_deref() != Some("Failure") {
        return None;
    }
    let message = status.message.as_deref().filter(|m| !m.is_empty());
    Some(
        message
            .or(status.reason.as_deref())
            .unwrap_or("command exited with a non-zero status")
            .to_string(),
    )
}

/// Read all data from an async read stream
async fn read_stream<R: AsyncRead + Unpin>(mut reader: R) -> Result<String> {
    let mut buffer = Vec::new();
    reader.read_to_end(&mut buffer).await?;
    Ok(String::from_utf8_lossy(&buffer).to_string())
}
