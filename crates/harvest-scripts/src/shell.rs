use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command as AsyncCommand;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use harvest_core::config::ScriptConfig;

use crate::error::{Result, ScriptError};
use crate::script::{Script, ScriptOutcome};

/// A script backed by a shell command line.
///
/// The command runs via `sh -c` with the task's parameters exported as
/// environment variables: each key of the parameter object becomes
/// `HARVEST_PARAM_<KEY>`, and the whole object is available as
/// `HARVEST_PARAMS_JSON`. Row counts are picked up from stdout — any
/// `rows_before=N` / `rows_after=M` tokens the command prints (the last
/// occurrence of each wins).
#[derive(Debug)]
pub struct ShellScript {
    id: String,
    command: String,
    workdir: Option<String>,
    default_timeout: Option<Duration>,
}

impl ShellScript {
    pub fn from_config(config: &ScriptConfig) -> Self {
        Self {
            id: config.id.clone(),
            command: config.command.clone(),
            workdir: config.workdir.clone(),
            default_timeout: config.default_timeout_secs.map(Duration::from_secs),
        }
    }
}

#[async_trait]
impl Script for ShellScript {
    fn id(&self) -> &str {
        &self.id
    }

    fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    async fn execute(
        &self,
        parameters: &serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<ScriptOutcome> {
        debug!(script_id = %self.id, "exec: {}", self.command);

        let mut cmd = AsyncCommand::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // SIGKILL the child if the wait future is dropped (cancellation
            // or the scheduler's hard deadline).
            .kill_on_drop(true);

        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        cmd.env("HARVEST_PARAMS_JSON", parameters.to_string());
        if let Some(object) = parameters.as_object() {
            for (key, value) in object {
                cmd.env(format!("HARVEST_PARAM_{}", env_key(key)), env_value(value));
            }
        }

        let child = cmd.spawn()?;

        let output = tokio::select! {
            result = child.wait_with_output() => result?,
            _ = cancel.cancelled() => {
                debug!(script_id = %self.id, "cancelled; child killed");
                return Err(ScriptError::Cancelled);
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            return Err(ScriptError::Failed {
                message: format!("exit status {exit_code}"),
                trace: if stderr.trim().is_empty() {
                    None
                } else {
                    Some(stderr.into_owned())
                },
            });
        }

        let (rows_before, rows_after) = parse_row_counts(&stdout);
        Ok(ScriptOutcome {
            rows_before,
            rows_after,
        })
    }
}

/// Uppercase a parameter key into an environment-variable-safe suffix.
fn env_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Strings are exported raw; everything else as JSON.
fn env_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_row_counts(stdout: &str) -> (Option<i64>, Option<i64>) {
    let mut before = None;
    let mut after = None;
    for token in stdout.split_whitespace() {
        if let Some(raw) = token.strip_prefix("rows_before=") {
            before = raw.parse().ok().or(before);
        } else if let Some(raw) = token.strip_prefix("rows_after=") {
            after = raw.parse().ok().or(after);
        }
    }
    (before, after)
}
