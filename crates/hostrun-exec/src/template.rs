//! Script rendering

use std::path::Path;

use hostrun_core::RequestSpec;
use minijinja::Environment;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::ExecError;

/// Back-reference to the requesting execution, visible to the template
/// body as `task`
#[derive(Debug, Clone, Serialize)]
pub struct TaskContext {
    /// Host the script will run on
    pub host: String,
    /// User the session connects as
    pub user: String,
    /// Remote port
    pub port: u16,
}

impl TaskContext {
    /// Capture the introspectable parts of `spec`.
    #[must_use]
    pub fn new(spec: &RequestSpec) -> Self {
        Self {
            host: spec.host.clone(),
            user: spec.user.clone(),
            port: spec.port,
        }
    }
}

/// Load the template at `path` and render it with `attributes` at the
/// top level of the context, alongside the `task` back-reference.
///
/// Load and render failures propagate — there is no partial render.
/// Attributes the template names but the request does not supply render
/// as empty text.
///
/// # Errors
/// Returns [`ExecError::RenderFailed`] when the file cannot be read or
/// the template fails to parse or render.
pub fn render_script(
    path: &Path,
    attributes: &Map<String, Value>,
    task: &TaskContext,
) -> Result<String, ExecError> {
    let source = std::fs::read_to_string(path)
        .map_err(|err| ExecError::RenderFailed(format!("{}: {err}", path.display())))?;

    let mut env = Environment::new();
    env.add_template("script", &source)
        .map_err(|err| ExecError::RenderFailed(err.to_string()))?;
    let template = env
        .get_template("script")
        .map_err(|err| ExecError::RenderFailed(err.to_string()))?;

    let mut context = attributes.clone();
    let task = serde_json::to_value(task)
        .map_err(|err| ExecError::RenderFailed(err.to_string()))?;
    context.insert("task".to_string(), task);

    let rendered = template
        .render(&context)
        .map_err(|err| ExecError::RenderFailed(err.to_string()))?;

    debug!(template = %path.display(), bytes = rendered.len(), "rendered script");
    Ok(rendered)
}
