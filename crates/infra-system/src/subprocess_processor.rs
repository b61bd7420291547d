// Subprocess activity processor
// Runs the external emissions calculator once per activity and reads its
// result as JSON from stdout.
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use carbonbatch_core::domain::ActivityRecord;
use carbonbatch_core::port::{ActivityContext, ActivityProcessor, ProcessingError, TimeProvider};

/// Calculator invocation settings
#[derive(Debug, Clone)]
pub struct SubprocessConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Parent environment variables passed through to the child
    pub env_allowlist: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Time between SIGTERM and SIGKILL when the call is abandoned
    pub grace_period: Duration,
}

impl SubprocessConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env_allowlist: vec!["PATH".to_string(), "HOME".to_string(), "USER".to_string()],
            working_dir: None,
            grace_period: Duration::from_secs(2),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// What the calculator prints on success
#[derive(Debug, Deserialize)]
struct CalculatorOutput {
    emissions: f64,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

enum Exit {
    Finished(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Activity processor backed by a child process
///
/// The child sees only allow-listed parent variables plus
/// `CARBONBATCH_BATCH_ID`, `CARBONBATCH_ACTIVITY_ID`, `CARBONBATCH_ORG_ID`
/// and `CARBONBATCH_WORKSPACE_ID`. It must exit 0 and print
/// `{"emissions": <number>, "metadata": <any, optional>}`.
pub struct SubprocessActivityProcessor {
    config: SubprocessConfig,
    time_provider: Arc<dyn TimeProvider>,
}

impl SubprocessActivityProcessor {
    pub fn new(config: SubprocessConfig, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            config,
            time_provider,
        }
    }

    /// Keep allow-listed variables only
    fn filter_env<I>(&self, vars: I) -> HashMap<String, String>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        vars.into_iter()
            .filter(|(k, _)| self.config.env_allowlist.contains(k))
            .collect()
    }

    fn build_command(&self, ctx: &ActivityContext) -> Command {
        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .env_clear()
            .envs(self.filter_env(std::env::vars()))
            .env("CARBONBATCH_BATCH_ID", &ctx.batch_id)
            .env("CARBONBATCH_ACTIVITY_ID", &ctx.activity_id)
            .env("CARBONBATCH_ORG_ID", &ctx.org_id)
            .env("CARBONBATCH_WORKSPACE_ID", &ctx.workspace_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }
        command
    }

    /// SIGTERM, then SIGKILL once the grace period runs out
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(raw) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
                if kill(Pid::from_raw(raw), Signal::SIGTERM).is_ok()
                    && tokio::time::timeout(self.config.grace_period, child.wait())
                        .await
                        .is_ok()
                {
                    debug!(pid = raw, "Calculator exited after SIGTERM");
                    return;
                }
                warn!(pid = raw, "Calculator did not exit after SIGTERM, sending SIGKILL");
            }
        }

        if let Err(e) = child.kill().await {
            warn!(error = %e, "Failed to kill calculator process");
        }
    }

    async fn abandon(
        &self,
        child: &mut Child,
        ctx: &ActivityContext,
        reason: ProcessingError,
    ) -> ProcessingError {
        self.terminate(child).await;
        warn!(
            batch_id = %ctx.batch_id,
            activity_id = %ctx.activity_id,
            reason = %reason,
            "Calculator abandoned"
        );
        reason
    }

    fn parse_output(stdout: &str) -> Result<ActivityRecord, ProcessingError> {
        let output: CalculatorOutput = serde_json::from_str(stdout.trim()).map_err(|e| {
            ProcessingError::Failed(format!("malformed calculator output: {}", e))
        })?;

        let mut record = ActivityRecord::new(output.emissions);
        if let Some(metadata) = output.metadata {
            record = record.with_metadata(metadata);
        }
        record
            .validate()
            .map_err(|e| ProcessingError::Failed(e.to_string()))?;
        Ok(record)
    }
}

async fn read_pipe<R>(pipe: Option<R>) -> String
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            debug!(error = %e, "Failed to read calculator pipe");
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[async_trait]
impl ActivityProcessor for SubprocessActivityProcessor {
    async fn process(&self, ctx: &ActivityContext) -> Result<ActivityRecord, ProcessingError> {
        let remaining_ms = ctx.remaining_millis(self.time_provider.now_millis());
        if remaining_ms == 0 {
            return Err(ProcessingError::Timeout(0));
        }

        debug!(
            batch_id = %ctx.batch_id,
            activity_id = %ctx.activity_id,
            command = %self.config.command,
            timeout_ms = remaining_ms,
            "Starting calculator"
        );

        let mut child = self.build_command(ctx).spawn().map_err(|e| {
            ProcessingError::Io(format!("failed to spawn {}: {}", self.config.command, e))
        })?;

        let stdout = tokio::spawn(read_pipe(child.stdout.take()));
        let stderr = tokio::spawn(read_pipe(child.stderr.take()));

        let mut shutdown = ctx.shutdown.clone();
        let exit = tokio::select! {
            status = child.wait() => Exit::Finished(status),
            _ = tokio::time::sleep(Duration::from_millis(remaining_ms as u64)) => Exit::TimedOut,
            _ = shutdown.wait() => Exit::Cancelled,
        };

        let status = match exit {
            Exit::Finished(status) => status.map_err(|e| ProcessingError::Io(e.to_string()))?,
            Exit::TimedOut => {
                stdout.abort();
                stderr.abort();
                return Err(self
                    .abandon(&mut child, ctx, ProcessingError::Timeout(remaining_ms))
                    .await);
            }
            Exit::Cancelled => {
                stdout.abort();
                stderr.abort();
                return Err(self
                    .abandon(&mut child, ctx, ProcessingError::Cancelled)
                    .await);
            }
        };

        let stdout = stdout.await.unwrap_or_default();
        let stderr = stderr.await.unwrap_or_default();

        if !status.success() {
            let detail = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
            return Err(ProcessingError::Failed(match status.code() {
                Some(code) => format!("calculator exited with code {}: {}", code, detail.trim()),
                None => format!("calculator terminated by signal: {}", detail.trim()),
            }));
        }

        Self::parse_output(&stdout)
    }
}
