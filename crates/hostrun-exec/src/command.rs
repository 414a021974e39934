//! Command execution through the local ssh client
//!
//! Spawns the configured client binary with piped stdio and owns the
//! whole child lifecycle: write, read, reap. The reap step runs exactly
//! once per execution, on every path out — a leaked child process is a
//! defect, not a tolerated edge.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hostrun_core::{ExitStatus, Outcome, RequestSpec, SpecError, SshDefaults};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::error::ExecError;
use crate::sanitize;
use crate::traits::WorkExecutor;

/// How the command text reaches the spawned client
///
/// Both are configurations of the same executor; the only difference is
/// whether the command rides the argument vector or the input stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CommandTransport {
    /// Command as the final positional argument
    #[default]
    Argv,
    /// Command written to the child's standard input, then end-of-input
    Stdin,
}

/// Executes one remote command by spawning the local ssh client
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    defaults: SshDefaults,
    transport: CommandTransport,
}

impl CommandExecutor {
    /// Create an executor around the injected process-wide defaults.
    #[must_use]
    pub fn new(defaults: SshDefaults) -> Self {
        Self {
            defaults,
            transport: CommandTransport::Argv,
        }
    }

    /// Select how the command text is delivered to the client.
    #[must_use]
    pub fn with_transport(mut self, transport: CommandTransport) -> Self {
        self.transport = transport;
        self
    }

    /// Validate `payload` and execute it as one unit of work.
    ///
    /// # Errors
    /// Validation failures surface before anything is spawned; execution
    /// failures as in [`WorkExecutor::execute`].
    pub async fn execute_payload(&self, payload: &Value) -> Result<Outcome, ExecError> {
        let spec = RequestSpec::from_payload(
            hostrun_core::ExecutorKind::Command,
            payload,
            &self.defaults,
        )?;
        self.run(&spec, None).await
    }

    /// Argument vector for one request: configured options, then port,
    /// key and user, then the host and (in argv mode) the command.
    fn build_argv(&self, spec: &RequestSpec, command: &str) -> Vec<String> {
        let mut argv = Vec::with_capacity(spec.opts.len() + 8);
        argv.extend(spec.opts.iter().cloned());
        argv.push("-p".to_string());
        argv.push(spec.port.to_string());
        if let Some(key) = &spec.key {
            argv.push("-i".to_string());
            argv.push(key.display().to_string());
        }
        argv.push("-l".to_string());
        argv.push(spec.user.clone());
        argv.push(spec.host.clone());
        if self.transport == CommandTransport::Argv {
            argv.push(command.to_string());
        }
        argv
    }

    #[instrument(skip(self, spec, deadline), fields(host = %spec.host))]
    async fn run(
        &self,
        spec: &RequestSpec,
        deadline: Option<Duration>,
    ) -> Result<Outcome, ExecError> {
        let command = spec
            .command
            .as_deref()
            .ok_or(SpecError::MissingField("command"))?;

        let argv = self.build_argv(spec, command);
        debug!(binary = %self.defaults.path, args = ?argv, "spawning client");

        let start = Instant::now();

        let mut child = Command::new(&self.defaults.path)
            .args(&argv)
            .envs(&spec.env)
            .stdin(match self.transport {
                CommandTransport::Stdin => Stdio::piped(),
                CommandTransport::Argv => Stdio::null(),
            })
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| ExecError::Spawn {
                binary: self.defaults.path.clone(),
                message: err.to_string(),
            })?;

        if self.transport == CommandTransport::Stdin {
            // Dropping the handle closes the pipe and signals
            // end-of-input to the child.
            if let Some(mut stdin) = child.stdin.take() {
                let mut text = command.as_bytes().to_vec();
                text.push(b'\n');
                if let Err(err) = stdin.write_all(&text).await {
                    warn!(error = %err, "writing command to child failed");
                }
            }
        }

        // Reading to end-of-stream is the one suspension point here. A
        // read error yields no additional output but the child is still
        // reaped and its real exit status returned.
        let mut stdout = child.stdout.take();
        let read_output = async {
            let mut captured = String::new();
            if let Some(stdout) = stdout.as_mut()
                && let Err(err) = stdout.read_to_string(&mut captured).await
            {
                warn!(error = %err, "reading child output failed");
            }
            captured
        };

        let (captured, expired) = match deadline {
            None => (read_output.await, None),
            Some(limit) => match timeout(limit, read_output).await {
                Ok(captured) => (captured, None),
                Err(_) => (String::new(), Some(limit)),
            },
        };

        let status = reap(&mut child).await;
        let duration = start.elapsed();

        if let Some(limit) = expired {
            warn!(timeout = ?limit, elapsed = ?duration, "command timed out");
            return Err(ExecError::Timeout { timeout: limit });
        }

        let output = sanitize::clean_output(&captured);
        debug!(status = %status, duration = ?duration, "client exited");

        Ok(Outcome {
            status,
            output,
            duration,
        })
    }
}

/// Reclaim the child: liveness check, best-effort termination signal if
/// it is still running, then a blocking wait for the real exit status.
async fn reap(child: &mut Child) -> ExitStatus {
    match child.try_wait() {
        Ok(Some(status)) => return ExitStatus::from_unix(status),
        Ok(None) => terminate(child),
        Err(err) => {
            debug!(error = %err, "liveness check failed");
        }
    }

    match child.wait().await {
        Ok(status) => ExitStatus::from_unix(status),
        Err(err) => {
            warn!(error = %err, "could not collect child exit status");
            ExitStatus::Code(-1)
        }
    }
}

/// Send SIGTERM; the child may exit in between the liveness check and
/// the signal, so ESRCH is not worth reporting.
fn terminate(child: &Child) {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    #[allow(clippy::cast_possible_wrap)]
    let pid = Pid::from_raw(pid as i32);

    if let Err(err) = signal::kill(pid, Signal::SIGTERM)
        && err != Errno::ESRCH
    {
        debug!(%pid, error = %err, "failed to signal child");
    }
}

#[async_trait]
impl WorkExecutor for CommandExecutor {
    async fn execute(&self, spec: &RequestSpec) -> Result<Outcome, ExecError> {
        self.run(spec, None).await
    }

    async fn execute_with_timeout(
        &self,
        spec: &RequestSpec,
        timeout: Duration,
    ) -> Result<Outcome, ExecError> {
        self.run(spec, Some(timeout)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostrun_core::{DEFAULT_SSH_OPTS, ExecutorKind};
    use serde_json::json;

    fn defaults_with(path: &str) -> SshDefaults {
        SshDefaults {
            path: path.to_string(),
            user: "ops".to_string(),
            opts: Vec::new(),
            key: None,
        }
    }

    fn spec_for(payload: serde_json::Value, defaults: &SshDefaults) -> RequestSpec {
        RequestSpec::from_payload(ExecutorKind::Command, &payload, defaults).unwrap()
    }

    #[test]
    fn test_argv_layout() {
        let defaults = SshDefaults {
            path: "/usr/bin/ssh".to_string(),
            user: "ops".to_string(),
            opts: DEFAULT_SSH_OPTS.iter().map(ToString::to_string).collect(),
            key: Some("/tmp/sekrit.rsa".into()),
        };
        let spec = spec_for(json!({ "host": "example.com", "command": "woohoo" }), &defaults);
        let executor = CommandExecutor::new(defaults.clone());

        let mut expected: Vec<String> =
            DEFAULT_SSH_OPTS.iter().map(ToString::to_string).collect();
        expected.extend(
            [
                "-p",
                "22",
                "-i",
                "/tmp/sekrit.rsa",
                "-l",
                "ops",
                "example.com",
                "woohoo",
            ]
            .map(String::from),
        );

        assert_eq!(executor.build_argv(&spec, "woohoo"), expected);
    }

    #[test]
    fn test_stdin_transport_omits_command_from_argv() {
        let defaults = defaults_with("/usr/bin/ssh");
        let spec = spec_for(json!({ "host": "example.com", "command": "woohoo" }), &defaults);
        let executor =
            CommandExecutor::new(defaults).with_transport(CommandTransport::Stdin);

        let argv = executor.build_argv(&spec, "woohoo");
        assert_eq!(argv.last().unwrap(), "example.com");
    }

    #[test]
    fn test_port_rendered_only_in_argv() {
        let defaults = defaults_with("/usr/bin/ssh");
        let spec = spec_for(
            json!({ "host": "example.com", "command": "woohoo", "port": 2222 }),
            &defaults,
        );
        assert_eq!(spec.port, 2222u16);

        let argv = CommandExecutor::new(defaults).build_argv(&spec, "woohoo");
        let p = argv.iter().position(|a| a == "-p").unwrap();
        assert_eq!(argv[p + 1], "2222");
    }

    // /bin/echo prints its argument vector, which is close enough to a
    // remote shell for driving the real spawn/read/reap path.
    #[tokio::test]
    async fn test_execute_captures_output() {
        let defaults = defaults_with("/bin/echo");
        let spec = spec_for(json!({ "host": "example.com", "command": "woohoo" }), &defaults);

        let outcome = CommandExecutor::new(defaults).execute(&spec).await.unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.output, "-p 22 -l ops example.com woohoo");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_data_not_error() {
        let defaults = defaults_with("/bin/sh");
        let spec = spec_for(
            json!({ "host": "example.com", "command": "woohoo", "opts": ["-c", "exit 3"] }),
            &defaults,
        );

        let outcome = CommandExecutor::new(defaults).execute(&spec).await.unwrap();
        assert_eq!(outcome.status, ExitStatus::Code(3));
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn test_diagnostics_cleaned_from_output() {
        let defaults = defaults_with("/bin/sh");
        let spec = spec_for(
            json!({
                "host": "example.com",
                "command": "woohoo",
                "opts": ["-c", "printf 'Warning: no access to tty\\nHi there!\\n'"],
            }),
            &defaults,
        );

        let outcome = CommandExecutor::new(defaults).execute(&spec).await.unwrap();
        assert_eq!(outcome.output, "Hi there!");
    }

    #[tokio::test]
    async fn test_stdin_transport_delivers_command() {
        // `sh -c cat` ignores the trailing ssh-style arguments and
        // copies stdin through, echoing the delivered command back.
        let defaults = defaults_with("/bin/sh");
        let spec = spec_for(
            json!({ "host": "example.com", "command": "woohoo", "opts": ["-c", "cat"] }),
            &defaults,
        );
        let executor =
            CommandExecutor::new(defaults).with_transport(CommandTransport::Stdin);

        let outcome = executor.execute(&spec).await.unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.output, "woohoo");
    }

    #[tokio::test]
    async fn test_timeout_reaps_child() {
        let defaults = defaults_with("/bin/sh");
        let spec = spec_for(
            json!({ "host": "example.com", "command": "woohoo", "opts": ["-c", "sleep 30"] }),
            &defaults,
        );
        let executor = CommandExecutor::new(defaults);

        let started = Instant::now();
        let result = executor
            .execute_with_timeout(&spec, Duration::from_millis(100))
            .await;

        assert!(matches!(result, Err(ExecError::Timeout { .. })));
        // The child answered SIGTERM, so this returns promptly instead
        // of waiting out the sleep.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_spawn_failure_surfaces() {
        let defaults = defaults_with("/nonexistent/ssh");
        let spec = spec_for(json!({ "host": "example.com", "command": "woohoo" }), &defaults);

        let err = CommandExecutor::new(defaults).execute(&spec).await.unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_execute_payload_validates_first() {
        let executor = CommandExecutor::new(defaults_with("/bin/echo"));

        let err = executor.execute_payload(&json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            ExecError::Spec(SpecError::MissingField("host"))
        ));
    }

    #[tokio::test]
    async fn test_environment_merged_into_child() {
        let defaults = defaults_with("/bin/sh");
        let spec = spec_for(
            json!({
                "host": "example.com",
                "command": "woohoo",
                "opts": ["-c", "printf '%s' \"$GREETING\""],
                "env": { "GREETING": "Hi there!" },
            }),
            &defaults,
        );

        let outcome = CommandExecutor::new(defaults).execute(&spec).await.unwrap();
        assert_eq!(outcome.output, "Hi there!");
    }
}
