//! Core data model: module coordinates, fingerprints, build records and
//! cache results.
//!
//! Everything persisted to the repository is XML with UTF-8 encoding; the
//! serde shapes below are the on-disk schema.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Version stamped into every build record. Records written by a
/// different implementation version never match on lookup paths.
pub const CACHE_IMPLEMENTATION_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Classifier prefix for packed generated-source directories.
pub const GENERATED_SOURCES_KIND: &str = "generated-sources";
/// Classifier prefix for packed extra output directories.
pub const EXTRA_OUTPUT_KIND: &str = "extra-output";

/// Coordinate-addressed unit executed by the orchestrator as one build
/// scope.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ModuleId {
    pub group_id: String,
    pub artifact_id: String,
    pub version: String,
}

impl ModuleId {
    pub fn new(
        group_id: impl Into<String>,
        artifact_id: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self { group_id: group_id.into(), artifact_id: artifact_id.into(), version: version.into() }
    }

    /// Full coordinate key, `groupId:artifactId:version`.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.group_id, self.artifact_id, self.version)
    }

    /// Version-independent key used for reports and inter-run correlation.
    pub fn versionless_key(&self) -> String {
        format!("{}:{}", self.group_id, self.artifact_id)
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.group_id, self.artifact_id, self.version)
    }
}

/// One fingerprint contribution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "item")]
pub struct DigestItem {
    #[serde(rename = "@type")]
    pub kind: String,
    #[serde(rename = "@key")]
    pub key: String,
    #[serde(rename = "@hash")]
    pub hash: String,
    #[serde(rename = "@fileChecksum", skip_serializing_if = "Option::is_none", default)]
    pub file_checksum: Option<String>,
}

impl DigestItem {
    pub fn new(kind: impl Into<String>, key: impl Into<String>, hash: impl Into<String>) -> Self {
        Self { kind: kind.into(), key: key.into(), hash: hash.into(), file_checksum: None }
    }
}

/// The canonical, ordered fingerprint of a module's inputs and its
/// aggregate checksum.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "projectsInputInfo")]
pub struct InputFingerprint {
    pub checksum: String,
    #[serde(rename = "item", default)]
    pub items: Vec<DigestItem>,
}

impl InputFingerprint {
    /// Looks up an item by type and key.
    pub fn item(&self, kind: &str, key: &str) -> Option<&DigestItem> {
        self.items.iter().find(|item| item.kind == kind && item.key == key)
    }
}

/// Descriptor of one produced artifact blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "artifact")]
pub struct ArtifactDescriptor {
    #[serde(rename = "@groupId")]
    pub group_id: String,
    #[serde(rename = "@artifactId")]
    pub artifact_id: String,
    #[serde(rename = "@version")]
    pub version: String,
    #[serde(rename = "@classifier", skip_serializing_if = "Option::is_none", default)]
    pub classifier: Option<String>,
    #[serde(rename = "@type")]
    pub kind: String,
    #[serde(rename = "@fileName")]
    pub file_name: String,
    #[serde(rename = "@fileHash")]
    pub file_hash: String,
    #[serde(rename = "@fileSize")]
    pub file_size: u64,
    /// Project-relative path with unix separators.
    #[serde(rename = "@filePath")]
    pub file_path: String,
}

impl ArtifactDescriptor {
    /// Ordering key for dependency fingerprinting:
    /// `groupId:artifactId:version[:classifier]:type`.
    pub fn coords_key(&self) -> String {
        match &self.classifier {
            Some(classifier) => format!(
                "{}:{}:{}:{}:{}",
                self.group_id, self.artifact_id, self.version, classifier, self.kind
            ),
            None => {
                format!("{}:{}:{}:{}", self.group_id, self.artifact_id, self.version, self.kind)
            }
        }
    }

    /// If the artifact is a packed directory attachment, returns its kind
    /// (the classifier prefix before the counter).
    pub fn directory_kind(&self) -> Option<&str> {
        let classifier = self.classifier.as_deref()?;
        let (kind, counter) = classifier.rsplit_once('_')?;
        if counter.chars().all(|c| c.is_ascii_digit())
            && (kind == GENERATED_SOURCES_KIND || kind == EXTRA_OUTPUT_KIND)
        {
            Some(kind)
        } else {
            None
        }
    }
}

/// A step parameter snapshot in normalized string form.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "property")]
pub struct PropertyValue {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@value")]
    pub value: String,
    #[serde(rename = "@tracked")]
    pub tracked: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Properties {
    #[serde(rename = "property", default)]
    pub items: Vec<PropertyValue>,
}

/// The recorded parameter state of one completed step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "execution")]
pub struct CompletedExecution {
    #[serde(rename = "@executionKey")]
    pub execution_key: String,
    #[serde(rename = "@stepClass", skip_serializing_if = "Option::is_none", default)]
    pub step_class: Option<String>,
    #[serde(default)]
    pub properties: Properties,
}

impl CompletedExecution {
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.items.iter().find(|p| p.name == name)
    }
}

/// Version control state captured once per run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "scm", rename_all = "camelCase")]
pub struct ScmInfo {
    #[serde(default)]
    pub source_branch: String,
    #[serde(default)]
    pub revision: String,
}

/// Where a loaded build record came from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BuildSource {
    #[default]
    Local,
    Remote,
    /// Assembled by the current run's save.
    Build,
}

impl BuildSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "LOCAL",
            Self::Remote => "REMOTE",
            Self::Build => "BUILD",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedArtifacts {
    #[serde(rename = "artifact", default)]
    pub artifacts: Vec<ArtifactDescriptor>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Executions {
    #[serde(rename = "execution", default)]
    pub executions: Vec<CompletedExecution>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goals {
    #[serde(rename = "goal", default)]
    pub goals: Vec<String>,
}

/// The on-disk manifest describing one cached build (`buildinfo.xml`,
/// root element `<build>`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename = "build", rename_all = "camelCase")]
pub struct BuildRecord {
    #[serde(rename = "@cacheImplementationVersion")]
    pub cache_implementation_version: String,
    #[serde(rename = "@hashAlgorithm")]
    pub hash_algorithm: String,
    /// A final record forbids remote override and local overwrite.
    #[serde(rename = "@final")]
    pub final_record: bool,
    #[serde(rename = "@highestCompletedPhase")]
    pub highest_completed_phase: String,
    pub scm: ScmInfo,
    pub projects_input_info: InputFingerprint,
    #[serde(rename = "artifact", skip_serializing_if = "Option::is_none", default)]
    pub artifact: Option<ArtifactDescriptor>,
    #[serde(default)]
    pub attached_artifacts: AttachedArtifacts,
    #[serde(default)]
    pub executions: Executions,
    #[serde(default)]
    pub goals: Goals,
    #[serde(skip)]
    pub source: BuildSource,
}

impl BuildRecord {
    /// The aggregate input checksum this record was stored under.
    pub fn checksum(&self) -> &str {
        &self.projects_input_info.checksum
    }

    pub fn execution(&self, execution_key: &str) -> Option<&CompletedExecution> {
        self.executions.executions.iter().find(|e| e.execution_key == execution_key)
    }

    /// Primary artifact followed by every attached artifact.
    pub fn all_artifacts(&self) -> impl Iterator<Item = &ArtifactDescriptor> {
        self.artifact.iter().chain(self.attached_artifacts.artifacts.iter())
    }

    /// Attached artifacts that are regular files, not packed directories.
    pub fn attached_regular(&self) -> impl Iterator<Item = &ArtifactDescriptor> {
        self.attached_artifacts.artifacts.iter().filter(|a| a.directory_kind().is_none())
    }

    /// Attached artifacts that are packed directory trees.
    pub fn attached_directories(&self) -> impl Iterator<Item = &ArtifactDescriptor> {
        self.attached_artifacts.artifacts.iter().filter(|a| a.directory_kind().is_some())
    }
}

/// Per-module lookup context threaded through repositories and the
/// restore/save pipeline.
#[derive(Clone, Debug)]
pub struct CacheContext {
    pub module: ModuleId,
    /// Absolute module base directory; nothing is ever written outside it.
    pub base_dir: std::path::PathBuf,
    pub fingerprint: InputFingerprint,
}

impl CacheContext {
    pub fn checksum(&self) -> &str {
        &self.fingerprint.checksum
    }
}

/// Outcome of a cache lookup for one module.
#[derive(Debug)]
pub enum CacheResult {
    /// Nothing cached under the fingerprint.
    Empty,
    /// A record exists but cannot be used (reconciliation, corruption).
    Failure,
    /// The record covers a phase prefix of the requested run.
    Partial(Box<BuildRecord>),
    Success(Box<BuildRecord>),
}

impl CacheResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, Self::Partial(_))
    }

    /// Restoration is attempted iff the lookup succeeded (fully or
    /// partially) and a record is present.
    pub fn is_restorable(&self) -> bool {
        matches!(self, Self::Success(_) | Self::Partial(_))
    }

    pub fn build(&self) -> Option<&BuildRecord> {
        match self {
            Self::Success(build) | Self::Partial(build) => Some(build),
            _ => None,
        }
    }
}

/// Result of a restoration attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestorationStatus {
    Success,
    /// Nothing was written into the project tree; a plain rebuild is safe.
    Failure,
    /// The project tree was partially written into; the clean segment must
    /// run again before rebuilding.
    FailureNeedsClean,
}
