//! The step model and the interfaces consumed from the build orchestrator.
//!
//! The engine never executes anything itself. The orchestrator supplies an
//! ordered list of [`Step`]s per module, a [`StepRunner`] that executes one
//! step and receives restored artifacts, and an introspection handle for
//! reading configured step parameters.

use crate::{error::Result, model::ArtifactDescriptor, restore::RestoredFile};
use std::{fmt, path::PathBuf};

/// Plugin coordinates, `groupId:artifactId:version`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PluginCoords {
    pub group_id: String,
    pub artifact_id: String,
    pub version: String,
}

impl PluginCoords {
    pub fn new(
        group_id: impl Into<String>,
        artifact_id: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self { group_id: group_id.into(), artifact_id: artifact_id.into(), version: version.into() }
    }
}

impl fmt::Display for PluginCoords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.group_id, self.artifact_id, self.version)
    }
}

/// Where a step came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepSource {
    /// Requested directly on the command line; such runs are never cached.
    Cli,
    /// Bound to a lifecycle phase.
    Lifecycle,
}

/// One goal invocation in the orchestrator's ordered list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Step {
    pub execution_id: String,
    pub goal: String,
    pub plugin: PluginCoords,
    /// Lifecycle phase; absent for forked steps.
    pub phase: Option<String>,
    pub source: StepSource,
}

impl Step {
    /// The identity used to correlate a step with its cached record:
    /// `executionId:goal:phase:plugin.artifactId:plugin.groupId`.
    pub fn execution_key(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.execution_id,
            self.goal,
            self.phase.as_deref().unwrap_or(""),
            self.plugin.artifact_id,
            self.plugin.group_id
        )
    }

    /// `plugin.groupId:plugin.artifactId:goal`, the selector used by
    /// always-run and tracked-property configuration.
    pub fn goal_key(&self) -> String {
        format!("{}:{}:{}", self.plugin.group_id, self.plugin.artifact_id, self.goal)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.plugin.artifact_id, self.goal, self.execution_id)
    }
}

/// A step parameter value as read through introspection, before
/// normalization (see [`crate::reconcile::normalize`]).
#[derive(Clone, Debug, PartialEq)]
pub enum ParamValue {
    Null,
    Text(String),
    Path(PathBuf),
    List(Vec<ParamValue>),
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

impl From<PathBuf> for ParamValue {
    fn from(value: PathBuf) -> Self {
        ParamValue::Path(value)
    }
}

/// Read access to a configured step object's parameter values by name.
///
/// The step-plugin framework backs this with whatever introspection it
/// has.
pub trait ParameterIntrospection {
    fn value_of(&self, name: &str) -> Option<ParamValue>;

    /// All parameter names the step object exposes. Consulted when a full
    /// parameter snapshot is recorded on save; verification only reads
    /// named values.
    fn parameter_names(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Instantiates the configured object for a step and exposes its
/// parameters. Returns `None` when the step cannot be introspected.
pub trait StepIntrospector {
    fn parameters(&self, step: &Step) -> Option<Box<dyn ParameterIntrospection + '_>>;
}

/// A regular artifact the build attached to the module.
#[derive(Clone, Debug)]
pub struct AttachedOutput {
    pub classifier: Option<String>,
    pub kind: String,
    pub path: PathBuf,
}

/// The files a finished build produced, reported by the orchestrator and
/// consulted on save.
#[derive(Clone, Debug, Default)]
pub struct ModuleOutputs {
    /// The primary artifact, if the packaging produces one.
    pub primary: Option<PathBuf>,
    /// Packaging type of the primary artifact.
    pub primary_kind: Option<String>,
    pub attached: Vec<AttachedOutput>,
}

/// The orchestrator-side executor the engine drives.
///
/// `run` executes one step on the caller's thread. `attach_artifact` makes
/// a restored artifact visible to the orchestrator as if it had just been
/// built; with lazy restore enabled the file handle materializes on first
/// access. `outputs` reports what a completed build produced.
pub trait StepRunner {
    fn run(&mut self, step: &Step) -> Result<()>;

    fn attach_artifact(&mut self, descriptor: &ArtifactDescriptor, file: RestoredFile);

    fn outputs(&mut self) -> ModuleOutputs {
        ModuleOutputs::default()
    }
}
