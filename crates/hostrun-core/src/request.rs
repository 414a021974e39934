//! Request payload validation and normalization

use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::{Map, Value};

use crate::config::SshDefaults;
use crate::error::SpecError;

/// Which kind of work unit a payload describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    /// A single remote command, run through the local ssh client
    Command,
    /// A templated script, uploaded and run over a secure channel
    Script,
}

/// Validated, normalized description of one execution request
///
/// Built once per execution with [`RequestSpec::from_payload`]. Every
/// "is the field present, what is its default" decision happens there,
/// so the executors only ever see resolved values. Defaulting order is
/// explicit payload value, then the configured [`SshDefaults`], then the
/// hardcoded fallback.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    /// Hostname to connect to
    pub host: String,
    /// Command to run on the remote host (command executions)
    pub command: Option<String>,
    /// Path to the script template (script executions)
    pub template: Option<PathBuf>,
    /// Remote port
    pub port: u16,
    /// User to connect as
    pub user: String,
    /// Path to the private key, if one is configured
    pub key: Option<PathBuf>,
    /// Client options for the spawned ssh process
    pub opts: Vec<String>,
    /// Environment merged into the child process environment
    pub env: HashMap<String, String>,
    /// Data attached to the template render context (script executions)
    pub attributes: Map<String, Value>,
    /// Remote directory the uploaded script lands in
    pub tempdir: PathBuf,
    /// Remove the uploaded script after it ran
    pub cleanup: bool,
    /// Command used to remove the uploaded script
    pub delete_cmd: String,
    /// Interpreter to prefix the remote invocation with
    pub run_binary: Option<String>,
    /// Turn on verbose session logging
    pub debug: bool,
    /// Payload fields not consumed above, retained for session-level
    /// overrides. Unrecognized names are ignored there, never rejected.
    pub extra: Map<String, Value>,
}

impl RequestSpec {
    /// Validate a job payload and resolve it against `defaults`.
    ///
    /// # Errors
    /// Returns [`SpecError::MissingField`] when `host` or the
    /// kind-appropriate `command`/`template` field is absent or empty,
    /// and [`SpecError::InvalidField`] when a field has the wrong shape.
    /// Nothing has been spawned or connected when this fails.
    pub fn from_payload(
        kind: ExecutorKind,
        payload: &Value,
        defaults: &SshDefaults,
    ) -> Result<Self, SpecError> {
        let mut fields = payload.as_object().ok_or(SpecError::Payload)?.clone();

        let host = match take_string(&mut fields, "host")? {
            Some(host) if !host.is_empty() => host,
            _ => return Err(SpecError::MissingField("host")),
        };

        let command = take_string(&mut fields, "command")?;
        let template = take_string(&mut fields, "template")?.map(PathBuf::from);
        match kind {
            ExecutorKind::Command if command.is_none() => {
                return Err(SpecError::MissingField("command"));
            }
            ExecutorKind::Script if template.is_none() => {
                return Err(SpecError::MissingField("template"));
            }
            _ => {}
        }

        // The port stays numeric here; it becomes a string only when the
        // argument vector is built.
        let port = match fields.remove("port") {
            None | Some(Value::Null) => 22,
            Some(value) => value
                .as_u64()
                .and_then(|port| u16::try_from(port).ok())
                .ok_or(SpecError::InvalidField {
                    field: "port",
                    expected: "an integer between 0 and 65535",
                })?,
        };

        let user = take_string(&mut fields, "user")?.unwrap_or_else(|| defaults.user.clone());
        let key = take_string(&mut fields, "key")?
            .map(PathBuf::from)
            .or_else(|| defaults.key.clone());
        let opts =
            take_string_list(&mut fields, "opts")?.unwrap_or_else(|| defaults.opts.clone());

        let env = take_string_map(&mut fields, "env")?.unwrap_or_default();
        let attributes = take_object(&mut fields, "attributes")?.unwrap_or_default();

        let cleanup = !take_bool(&mut fields, "nocleanup")?.unwrap_or(false);
        let delete_cmd =
            take_string(&mut fields, "delete_cmd")?.unwrap_or_else(|| "rm".to_string());
        let run_binary = take_string(&mut fields, "run_binary")?;
        let tempdir = take_string(&mut fields, "tempdir")?
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp"));
        let debug = take_bool(&mut fields, "debug")?.unwrap_or(false);

        Ok(Self {
            host,
            command,
            template,
            port,
            user,
            key,
            opts,
            env,
            attributes,
            tempdir,
            cleanup,
            delete_cmd,
            run_binary,
            debug,
            extra: fields,
        })
    }
}

fn take_string(
    fields: &mut Map<String, Value>,
    key: &'static str,
) -> Result<Option<String>, SpecError> {
    match fields.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value)),
        Some(_) => Err(SpecError::InvalidField {
            field: key,
            expected: "a string",
        }),
    }
}

fn take_bool(
    fields: &mut Map<String, Value>,
    key: &'static str,
) -> Result<Option<bool>, SpecError> {
    match fields.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(value)) => Ok(Some(value)),
        Some(_) => Err(SpecError::InvalidField {
            field: key,
            expected: "a boolean",
        }),
    }
}

/// List fields accept a lone string as shorthand for a one-element list.
fn take_string_list(
    fields: &mut Map<String, Value>,
    key: &'static str,
) -> Result<Option<Vec<String>>, SpecError> {
    let invalid = SpecError::InvalidField {
        field: key,
        expected: "a string or a list of strings",
    };

    match fields.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(vec![value])),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(value) => Ok(value),
                _ => Err(invalid.clone()),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        Some(_) => Err(invalid),
    }
}

fn take_string_map(
    fields: &mut Map<String, Value>,
    key: &'static str,
) -> Result<Option<HashMap<String, String>>, SpecError> {
    let invalid = SpecError::InvalidField {
        field: key,
        expected: "a mapping of string values",
    };

    match fields.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(entries)) => entries
            .into_iter()
            .map(|(name, value)| match value {
                Value::String(value) => Ok((name, value)),
                _ => Err(invalid.clone()),
            })
            .collect::<Result<HashMap<_, _>, _>>()
            .map(Some),
        Some(_) => Err(invalid),
    }
}

fn take_object(
    fields: &mut Map<String, Value>,
    key: &'static str,
) -> Result<Option<Map<String, Value>>, SpecError> {
    match fields.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(entries)) => Ok(Some(entries)),
        Some(_) => Err(SpecError::InvalidField {
            field: key,
            expected: "a mapping",
        }),
    }
}
