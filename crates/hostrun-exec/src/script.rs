//! Script execution over a secure channel
//!
//! Renders a templated script, uploads it over an SFTP sub-channel of
//! one authenticated connection, runs it there and removes it again.
//! The connection is scoped to the execution: it is never reused, and
//! every path out of the run releases it.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hostrun_core::{ExitStatus, Outcome, RequestSpec, SpecError, SshDefaults};
use rand::Rng;
use russh::keys::ssh_key;
use russh::keys::{PrivateKeyWithHashAlg, load_secret_key};
use russh::{ChannelMsg, Disconnect, Sig, client};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::error::ExecError;
use crate::keys;
use crate::template::{self, TaskContext};
use crate::traits::WorkExecutor;

/// Secure channel client handler
#[derive(Debug)]
struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Accept all server keys (StrictHostKeyChecking=no equivalent);
        // no known-hosts store is consulted or written.
        Ok(true)
    }
}

/// Per-session settings, layered in order: safe defaults, allow-listed
/// request overrides, always-enforced per-call values.
#[derive(Debug, Clone, Default)]
struct SessionSettings {
    keepalive_interval: Option<Duration>,
    inactivity_timeout: Option<Duration>,
}

/// Names recognized as session overrides among the free-form payload
/// fields. Anything else riding along there is ignored.
const SESSION_OVERRIDES: &[&str] = &["keepalive_interval", "inactivity_timeout"];

fn session_settings(spec: &RequestSpec) -> SessionSettings {
    let mut settings = SessionSettings::default();

    for name in SESSION_OVERRIDES {
        let Some(value) = spec.extra.get(*name) else {
            continue;
        };
        let Some(secs) = value.as_u64() else {
            warn!(field = *name, "ignoring non-numeric session override");
            continue;
        };
        let duration = Some(Duration::from_secs(secs));
        match *name {
            "keepalive_interval" => settings.keepalive_interval = duration,
            "inactivity_timeout" => settings.inactivity_timeout = duration,
            _ => {}
        }
    }

    settings
}

/// Unique remote path for an uploaded script: template basename plus a
/// random hex suffix, under the requested temp directory.
fn remote_filename(tempdir: &Path, template: &Path) -> String {
    let basename = template
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("script");
    let suffix: u32 = rand::thread_rng().gen_range(0..0x0100_0000);

    tempdir
        .join(format!("{basename}-{suffix:06x}"))
        .display()
        .to_string()
}

/// Remote invocation for the uploaded script, with the interpreter
/// prefix when one is configured.
fn invocation(run_binary: Option<&str>, remote_path: &str) -> String {
    match run_binary {
        Some(binary) => format!("{binary} {remote_path}"),
        None => remote_path.to_string(),
    }
}

/// Conventional numbers for the signal names the remote side reports.
fn sig_number(signal: &Sig) -> i32 {
    match signal {
        Sig::HUP => 1,
        Sig::INT => 2,
        Sig::QUIT => 3,
        Sig::ILL => 4,
        Sig::ABRT => 6,
        Sig::FPE => 8,
        Sig::KILL => 9,
        Sig::USR1 => 10,
        Sig::SEGV => 11,
        Sig::PIPE => 13,
        Sig::ALRM => 14,
        Sig::TERM => 15,
        _ => -1,
    }
}

/// Executes one templated script over a secure channel session
pub struct ScriptExecutor {
    defaults: SshDefaults,
}

impl ScriptExecutor {
    /// Create an executor around the injected process-wide defaults.
    #[must_use]
    pub fn new(defaults: SshDefaults) -> Self {
        Self { defaults }
    }

    /// Validate `payload` and execute it as one unit of work.
    ///
    /// # Errors
    /// Validation failures surface before anything is rendered or
    /// connected; execution failures as in [`WorkExecutor::execute`].
    pub async fn execute_payload(&self, payload: &Value) -> Result<Outcome, ExecError> {
        let spec = RequestSpec::from_payload(
            hostrun_core::ExecutorKind::Script,
            payload,
            &self.defaults,
        )?;
        self.run(&spec, None).await
    }

    #[instrument(skip(self, spec, deadline), fields(host = %spec.host))]
    async fn run(
        &self,
        spec: &RequestSpec,
        deadline: Option<Duration>,
    ) -> Result<Outcome, ExecError> {
        let template_path = spec
            .template
            .clone()
            .ok_or(SpecError::MissingField("template"))?;

        // Render before anything is allocated; a bad template never
        // opens a connection.
        let task = TaskContext::new(spec);
        let source = template::render_script(&template_path, &spec.attributes, &task)?;
        if spec.debug {
            debug!(script = %source, "rendered script");
        }

        let remote_path = remote_filename(&spec.tempdir, &template_path);
        let settings = session_settings(spec);

        // The connection is established outside any deadline; the
        // deadline bounds upload and remote execution.
        let session = self.connect(spec, &settings).await?;

        let start = Instant::now();
        let work = run_on_session(&session, spec, &source, &remote_path);
        let result = match deadline {
            None => work.await,
            Some(limit) => match timeout(limit, work).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(timeout = ?limit, "remote execution timed out");
                    Err(ExecError::Timeout { timeout: limit })
                }
            },
        };

        if let Err(err) = session
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!(error = %err, "disconnect failed");
        }

        result.map(|(status, output)| Outcome {
            status,
            output,
            duration: start.elapsed(),
        })
    }

    #[instrument(skip(self, spec, settings), fields(host = %spec.host, port = spec.port))]
    async fn connect(
        &self,
        spec: &RequestSpec,
        settings: &SessionSettings,
    ) -> Result<client::Handle<ClientHandler>, ExecError> {
        let Some(key_path) = &spec.key else {
            return Err(ExecError::AuthenticationFailed(
                "no private key configured".to_string(),
            ));
        };
        keys::validate_key_permissions(key_path)
            .map_err(|err| ExecError::KeyError(err.to_string()))?;

        info!(user = %spec.user, "connecting");

        let config = client::Config {
            keepalive_interval: settings.keepalive_interval,
            inactivity_timeout: settings.inactivity_timeout,
            ..client::Config::default()
        };

        let mut session = client::connect(
            Arc::new(config),
            (spec.host.as_str(), spec.port),
            ClientHandler,
        )
        .await
        .map_err(|err| ExecError::ConnectionFailed(err.to_string()))?;

        let key_pair = load_secret_key(key_path, None)
            .map_err(|err| ExecError::KeyError(err.to_string()))?;
        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        let auth = session
            .authenticate_publickey(
                &spec.user,
                PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg),
            )
            .await
            .map_err(|err| ExecError::AuthenticationFailed(err.to_string()))?;

        if !auth.success() {
            return Err(ExecError::AuthenticationFailed(
                "public key authentication failed".to_string(),
            ));
        }

        debug!("connected and authenticated");
        Ok(session)
    }
}

/// Upload, execute, clean up. Failures surface to the caller, which
/// still disconnects the session they rode on.
async fn run_on_session(
    session: &client::Handle<ClientHandler>,
    spec: &RequestSpec,
    source: &str,
    remote_path: &str,
) -> Result<(ExitStatus, String), ExecError> {
    debug!(bytes = source.len(), path = %remote_path, "uploading script");
    upload(session, source, remote_path).await?;

    let command = invocation(spec.run_binary.as_deref(), remote_path);
    let (status, output) = exec_channel(session, &command).await?;
    debug!(%status, "script finished");

    if spec.cleanup {
        let delete = format!("{} {}", spec.delete_cmd, remote_path);
        match exec_channel(session, &delete).await {
            Ok((status, _)) if !status.success() => {
                warn!(path = %remote_path, %status, "remote cleanup failed");
            }
            Err(err) => {
                warn!(path = %remote_path, error = %err, "remote cleanup failed");
            }
            Ok(_) => {}
        }
    }

    Ok((status, output))
}

/// Write the rendered script to `remote_path` over an SFTP sub-channel
/// and make it owner-executable.
async fn upload(
    session: &client::Handle<ClientHandler>,
    source: &str,
    remote_path: &str,
) -> Result<(), ExecError> {
    let mut channel = session
        .channel_open_session()
        .await
        .map_err(|err| ExecError::UploadFailed(err.to_string()))?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|err| ExecError::UploadFailed(err.to_string()))?;

    let sftp = SftpSession::new(channel.into_stream())
        .await
        .map_err(|err| ExecError::UploadFailed(err.to_string()))?;

    let mut file = sftp
        .open_with_flags(
            remote_path,
            OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
        )
        .await
        .map_err(|err| ExecError::UploadFailed(err.to_string()))?;
    file.write_all(source.as_bytes())
        .await
        .map_err(|err| ExecError::UploadFailed(err.to_string()))?;
    file.shutdown()
        .await
        .map_err(|err| ExecError::UploadFailed(err.to_string()))?;

    let mut attrs = FileAttributes::default();
    attrs.permissions = Some(0o755);
    sftp.set_metadata(remote_path, attrs)
        .await
        .map_err(|err| ExecError::UploadFailed(err.to_string()))?;

    if let Err(err) = sftp.close().await {
        debug!(error = %err, "closing sftp sub-channel failed");
    }

    Ok(())
}

/// Run one command over a fresh sub-channel of `session`, capturing its
/// combined output verbatim, in arrival order.
async fn exec_channel(
    session: &client::Handle<ClientHandler>,
    command: &str,
) -> Result<(ExitStatus, String), ExecError> {
    debug!(command = %command, "executing remote command");

    let mut channel = session
        .channel_open_session()
        .await
        .map_err(|err| ExecError::IoError(err.to_string()))?;
    channel
        .exec(true, command)
        .await
        .map_err(|err| ExecError::IoError(err.to_string()))?;

    let mut code = None;
    let mut signal = None;
    let mut output = Vec::new();

    loop {
        let Some(msg) = channel.wait().await else {
            break;
        };
        match msg {
            ChannelMsg::Data { data } => {
                output.extend_from_slice(&data);
            }
            ChannelMsg::ExtendedData { data, ext } => {
                if ext == 1 {
                    // stderr
                    output.extend_from_slice(&data);
                }
            }
            ChannelMsg::ExitStatus { exit_status } => {
                code = Some(exit_status.cast_signed());
            }
            ChannelMsg::ExitSignal { signal_name, .. } => {
                signal = Some(sig_number(&signal_name));
            }
            _ => {}
        }
    }

    let status = match (code, signal) {
        (_, Some(signal)) => ExitStatus::Signal(signal),
        (Some(code), None) => ExitStatus::Code(code),
        (None, None) => ExitStatus::Code(-1),
    };

    Ok((status, String::from_utf8_lossy(&output).to_string()))
}

#[async_trait]
impl WorkExecutor for ScriptExecutor {
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
    use hostrun_core::ExecutorKind;
    use serde_json::json;

    fn defaults() -> SshDefaults {
        SshDefaults {
            path: "/usr/bin/ssh".to_string(),
            user: "ops".to_string(),
            opts: Vec::new(),
            key: None,
        }
    }

    fn spec_for(payload: serde_json::Value) -> RequestSpec {
        RequestSpec::from_payload(ExecutorKind::Script, &payload, &defaults()).unwrap()
    }

    #[test]
    fn test_remote_filename_shape() {
        let name = remote_filename(Path::new("/tmp"), Path::new("fancy-script.tmpl"));

        let suffix = name.strip_prefix("/tmp/fancy-script-").unwrap();
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_remote_filename_honors_tempdir() {
        let name = remote_filename(Path::new("/var/tmp/"), Path::new("fancy-script.tmpl"));
        assert!(name.starts_with("/var/tmp/fancy-script-"));

        let name = remote_filename(Path::new(""), Path::new("fancy-script.tmpl"));
        assert!(name.starts_with("fancy-script-"));
    }

    #[test]
    fn test_remote_filenames_are_unique() {
        let template = Path::new("fancy-script.tmpl");
        let first = remote_filename(Path::new("/tmp"), template);
        let second = remote_filename(Path::new("/tmp"), template);

        assert_ne!(first, second);
    }

    #[test]
    fn test_invocation_with_interpreter() {
        assert_eq!(
            invocation(Some("ruby"), "/tmp/script-ab12cd"),
            "ruby /tmp/script-ab12cd"
        );
        assert_eq!(invocation(None, "/tmp/script-ab12cd"), "/tmp/script-ab12cd");
    }

    #[test]
    fn test_session_settings_allow_list() {
        let spec = spec_for(json!({
            "host": "example.com",
            "template": "provision.sh.j2",
            "keepalive_interval": 15,
            "unrecognized_knob": "ignored",
        }));

        let settings = session_settings(&spec);
        assert_eq!(settings.keepalive_interval, Some(Duration::from_secs(15)));
        assert_eq!(settings.inactivity_timeout, None);
    }

    #[test]
    fn test_session_settings_ignore_bad_types() {
        let spec = spec_for(json!({
            "host": "example.com",
            "template": "provision.sh.j2",
            "inactivity_timeout": "soon",
        }));

        let settings = session_settings(&spec);
        assert_eq!(settings.inactivity_timeout, None);
    }

    #[test]
    fn test_sig_number_mapping() {
        assert_eq!(sig_number(&Sig::TERM), 15);
        assert_eq!(sig_number(&Sig::KILL), 9);
        assert_eq!(sig_number(&Sig::HUP), 1);
    }

    #[tokio::test]
    async fn test_command_spec_rejected_before_connecting() {
        // A spec built for the command executor has no template; the
        // guard fires before any render or connection attempt.
        let payload = json!({ "host": "255.255.255.255", "command": "uptime" });
        let spec = RequestSpec::from_payload(ExecutorKind::Command, &payload, &defaults())
            .unwrap();

        let err = ScriptExecutor::new(defaults())
            .execute(&spec)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecError::Spec(SpecError::MissingField("template"))
        ));
    }

    #[tokio::test]
    async fn test_missing_key_fails_before_connecting() {
        let body = std::env::temp_dir().join(format!(
            "hostrun_script_nokey_{}.j2",
            std::process::id()
        ));
        std::fs::write(&body, "#!/bin/sh\necho hi\n").unwrap();

        // Unroutable host: reaching the auth guard proves no connection
        // was attempted.
        let spec = spec_for(json!({
            "host": "255.255.255.255",
            "template": body.display().to_string(),
        }));
        let err = ScriptExecutor::new(defaults())
            .execute(&spec)
            .await
            .unwrap_err();

        assert!(matches!(err, ExecError::AuthenticationFailed(_)));
        std::fs::remove_file(&body).unwrap();
    }

    #[tokio::test]
    async fn test_render_failure_never_connects() {
        let body = std::env::temp_dir().join(format!(
            "hostrun_script_broken_{}.j2",
            std::process::id()
        ));
        std::fs::write(&body, "{% endfor %}").unwrap();

        let spec = spec_for(json!({
            "host": "255.255.255.255",
            "template": body.display().to_string(),
            "key": "/tmp/sekrit.rsa",
        }));
        let err = ScriptExecutor::new(defaults())
            .execute(&spec)
            .await
            .unwrap_err();

        assert!(matches!(err, ExecError::RenderFailed(_)));
        std::fs::remove_file(&body).unwrap();
    }

    #[test]
    fn test_nocleanup_skips_delete() {
        let spec = spec_for(json!({
            "host": "example.com",
            "template": "provision.sh.j2",
            "nocleanup": true,
        }));
        assert!(!spec.cleanup);

        let spec = spec_for(json!({
            "host": "example.com",
            "template": "provision.sh.j2",
            "delete_cmd": "del",
        }));
        assert!(spec.cleanup);
        assert_eq!(
            format!("{} {}", spec.delete_cmd, "/tmp/script-ab12cd"),
            "del /tmp/script-ab12cd"
        );
    }
}
