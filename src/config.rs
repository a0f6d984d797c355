//! Cache configuration: the XML document tree, runtime defaults and the
//! CLI-overridable property table.

use crate::{
    error::{CacheError, Result},
    exec::Step,
    hasher::{HashAlgorithm, HashFactory},
    utils,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use url::Url;

/// Default location of the configuration document, relative to the
/// session root.
pub const DEFAULT_CONFIG_PATH: &str = ".build-cache/config.xml";

/// Directory name of the local repository under the user home when no
/// explicit location is configured.
const DEFAULT_CACHE_DIR: &str = "build-cache";

/// Property keys recognized as command-line overrides.
pub mod keys {
    pub const ENABLED: &str = "cache.enabled";
    pub const CONFIG_PATH: &str = "cache.configPath";
    pub const LOCATION: &str = "cache.location";
    pub const REMOTE_ENABLED: &str = "cache.remote.enabled";
    pub const REMOTE_URL: &str = "cache.remote.url";
    pub const REMOTE_SAVE_ENABLED: &str = "cache.remote.save.enabled";
    pub const REMOTE_SAVE_FINAL: &str = "cache.remote.save.final";
    pub const SKIP_CACHE: &str = "cache.skipCache";
    pub const SKIP_SAVE: &str = "cache.skipSave";
    pub const FAIL_FAST: &str = "cache.failFast";
    pub const LAZY_RESTORE: &str = "cache.lazyRestore";
    pub const RESTORE_GENERATED_SOURCES: &str = "cache.restoreGeneratedSources";
    pub const RESTORE_ON_DISK_ARTIFACTS: &str = "cache.restoreOnDiskArtifacts";
    pub const ALWAYS_RUN_PLUGINS: &str = "cache.alwaysRunPlugins";
    pub const MANDATORY_CLEAN: &str = "cache.mandatoryClean";
    pub const BASELINE_URL: &str = "cache.baselineUrl";
}

/// Command-line property overrides, applied on top of the document.
#[derive(Clone, Debug, Default)]
pub struct PropertyOverrides {
    values: HashMap<String, String>,
}

impl PropertyOverrides {
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.get(key) {
            None => Ok(None),
            Some("true") => Ok(Some(true)),
            Some("false") => Ok(Some(false)),
            Some(other) => {
                Err(CacheError::config(format!("property {key} expects true/false, got \"{other}\"")))
            }
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PropertyOverrides {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self { values: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect() }
    }
}

/// One source tree scan: files under `root` matching `glob` and none of
/// the `excludes`, all globs applied to unix-slash relative paths.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceScan {
    pub root: PathBuf,
    pub glob: String,
    pub excludes: Vec<String>,
}

impl SourceScan {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), glob: "**/*".to_string(), excludes: Vec::new() }
    }
}

/// Selected plugin parameters whose file or directory values contribute
/// to the fingerprint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PluginScan {
    pub plugin_artifact_id: String,
    pub parameters: Vec<String>,
}

/// Input selection for fingerprinting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputConfig {
    pub source_scans: Vec<SourceScan>,
    /// Effective-descriptor property names dropped before hashing (regex).
    pub exclude_properties: Vec<String>,
    /// Directory names pruned from every scan.
    pub blacklist: Vec<String>,
    pub plugin_scans: Vec<PluginScan>,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            source_scans: vec![SourceScan::new("src")],
            exclude_properties: Vec::new(),
            blacklist: vec![".git".to_string(), "target".to_string()],
            plugin_scans: Vec::new(),
        }
    }
}

/// Module output layout, relative to the module base directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputConfig {
    /// Build output roots subject to staging on rebuild.
    pub dirs: Vec<PathBuf>,
    pub generated_sources_dirs: Vec<PathBuf>,
    pub extra_output_dirs: Vec<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dirs: vec![PathBuf::from("target")],
            generated_sources_dirs: vec![PathBuf::from("target/generated-sources")],
            extra_output_dirs: Vec::new(),
        }
    }
}

/// Steps configured to always run, bypassing reconciliation and cache.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunAlways {
    /// Plugin artifact-id patterns (`*` wildcard).
    pub plugins: Vec<String>,
    pub execution_ids: Vec<String>,
    /// `plugin:goal` selectors.
    pub goals: Vec<String>,
}

/// Tracked property of a plugin goal, verified against the cached record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackedProperty {
    pub name: String,
    /// Current value that disables the step, making the comparison moot.
    pub skip_value: Option<String>,
}

/// Per-goal reconciliation rules.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GoalReconcile {
    pub plugin_artifact_id: String,
    pub goal: String,
    pub tracked: Vec<TrackedProperty>,
    /// Property names redacted from saved records.
    pub no_log: Vec<String>,
    /// Property names logged even when matched by `no_log`.
    pub force_log: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionControl {
    pub run_always: RunAlways,
    pub goal_reconciles: Vec<GoalReconcile>,
    /// Log every property value verbatim, ignoring `no_log`.
    pub log_all: bool,
}

/// Fully resolved engine configuration for one orchestrator invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheConfig {
    pub enabled: bool,
    pub hash_algorithm: String,
    /// Local repository root; user-home relative when absent.
    pub location: Option<PathBuf>,
    pub max_local_builds_cached: usize,
    pub skip_cache: bool,
    pub skip_save: bool,
    pub fail_fast: bool,
    pub lazy_restore: bool,
    pub restore_generated_sources: bool,
    pub restore_on_disk_artifacts: bool,
    pub mandatory_clean: bool,
    pub project_version_checksum: bool,
    pub baseline_url: Option<String>,
    /// `plugin[:goal]` patterns from the command line, never cached.
    pub always_run_plugins: Vec<String>,
    pub remote: RemoteConfig,
    pub input: InputConfig,
    pub output: OutputConfig,
    pub execution_control: ExecutionControl,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteConfig {
    pub enabled: bool,
    pub url: Option<String>,
    /// Server id whose credentials apply when the environment provides none.
    pub server_id: String,
    pub save_enabled: bool,
    pub save_final: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            server_id: "cache".to_string(),
            save_enabled: false,
            save_final: false,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hash_algorithm: "XX".to_string(),
            location: None,
            max_local_builds_cached: 3,
            skip_cache: false,
            skip_save: false,
            fail_fast: false,
            lazy_restore: false,
            restore_generated_sources: true,
            restore_on_disk_artifacts: true,
            mandatory_clean: false,
            project_version_checksum: false,
            baseline_url: None,
            always_run_plugins: Vec::new(),
            remote: RemoteConfig::default(),
            input: InputConfig::default(),
            output: OutputConfig::default(),
            execution_control: ExecutionControl::default(),
        }
    }
}

impl CacheConfig {
    /// Reads the configuration document and applies overrides on top.
    pub fn load(path: &Path, overrides: &PropertyOverrides) -> Result<Self> {
        let document: ConfigDocument = utils::read_xml_file(path)?;
        let mut config: CacheConfig = document.into();
        config.apply_overrides(overrides)?;
        Ok(config)
    }

    /// Applies the command-line property table.
    pub fn apply_overrides(&mut self, overrides: &PropertyOverrides) -> Result<()> {
        if let Some(v) = overrides.get_bool(keys::ENABLED)? {
            self.enabled = v;
        }
        if let Some(v) = overrides.get(keys::LOCATION) {
            self.location = Some(PathBuf::from(v));
        }
        if let Some(v) = overrides.get_bool(keys::REMOTE_ENABLED)? {
            self.remote.enabled = v;
        }
        if let Some(v) = overrides.get(keys::REMOTE_URL) {
            self.remote.url = Some(v.to_string());
        }
        if let Some(v) = overrides.get_bool(keys::REMOTE_SAVE_ENABLED)? {
            self.remote.save_enabled = v;
        }
        if let Some(v) = overrides.get_bool(keys::REMOTE_SAVE_FINAL)? {
            self.remote.save_final = v;
        }
        if let Some(v) = overrides.get_bool(keys::SKIP_CACHE)? {
            self.skip_cache = v;
        }
        if let Some(v) = overrides.get_bool(keys::SKIP_SAVE)? {
            self.skip_save = v;
        }
        if let Some(v) = overrides.get_bool(keys::FAIL_FAST)? {
            self.fail_fast = v;
        }
        if let Some(v) = overrides.get_bool(keys::LAZY_RESTORE)? {
            self.lazy_restore = v;
        }
        if let Some(v) = overrides.get_bool(keys::RESTORE_GENERATED_SOURCES)? {
            self.restore_generated_sources = v;
        }
        if let Some(v) = overrides.get_bool(keys::RESTORE_ON_DISK_ARTIFACTS)? {
            self.restore_on_disk_artifacts = v;
        }
        if let Some(v) = overrides.get_bool(keys::MANDATORY_CLEAN)? {
            self.mandatory_clean = v;
        }
        if let Some(v) = overrides.get(keys::BASELINE_URL) {
            self.baseline_url = Some(v.to_string());
        }
        if let Some(v) = overrides.get(keys::ALWAYS_RUN_PLUGINS) {
            self.always_run_plugins =
                v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect();
        }
        Ok(())
    }

    /// Resolves the configured hash algorithm, failing initialization on
    /// an unknown name.
    pub fn resolve_hash_algorithm(&self) -> Result<HashAlgorithm> {
        HashFactory::of(&self.hash_algorithm)
    }

    /// Validates the remote endpoint when remote lookup is enabled.
    pub fn validated_remote_url(&self) -> Result<Option<Url>> {
        if !self.remote.enabled {
            return Ok(None);
        }
        match &self.remote.url {
            None => Err(CacheError::config("remote cache enabled without a url")),
            Some(raw) => Url::parse(raw)
                .map(Some)
                .map_err(|err| CacheError::config(format!("invalid remote url \"{raw}\": {err}"))),
        }
    }

    /// The local repository root directory.
    pub fn local_root(&self) -> PathBuf {
        self.location.clone().unwrap_or_else(|| {
            dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(DEFAULT_CACHE_DIR)
        })
    }

    /// Whether the step is configured to run on every build, bypassing
    /// reconciliation and cache restoration.
    pub fn is_forced(&self, step: &Step) -> bool {
        let run_always = &self.execution_control.run_always;
        if run_always.execution_ids.iter().any(|id| *id == step.execution_id) {
            return true;
        }
        if run_always.plugins.iter().any(|p| wildcard_match(p, &step.plugin.artifact_id)) {
            return true;
        }
        if run_always
            .goals
            .iter()
            .any(|g| *g == format!("{}:{}", step.plugin.artifact_id, step.goal))
        {
            return true;
        }
        self.always_run_plugins.iter().any(|selector| {
            match selector.split_once(':') {
                Some((plugin, goal)) => {
                    wildcard_match(plugin, &step.plugin.artifact_id) && goal == step.goal
                }
                None => wildcard_match(selector, &step.plugin.artifact_id),
            }
        })
    }

    /// Reconciliation rules configured for the step's goal, if any.
    pub fn goal_reconcile(&self, step: &Step) -> Option<&GoalReconcile> {
        self.execution_control
            .goal_reconciles
            .iter()
            .find(|r| r.plugin_artifact_id == step.plugin.artifact_id && r.goal == step.goal)
    }
}

fn wildcard_match(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == value;
    }
    let escaped = regex::escape(pattern).replace("\\*", ".*");
    regex::Regex::new(&format!("^{escaped}$")).map(|re| re.is_match(value)).unwrap_or(false)
}

// --- document model -------------------------------------------------------

/// The `<cache>` configuration document.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename = "cache", rename_all = "camelCase", default)]
pub struct ConfigDocument {
    configuration: ConfigurationSection,
    input: InputSection,
    output: OutputSection,
    execution_control: Option<ExecutionControlSection>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ConfigurationSection {
    enabled: bool,
    hash_algorithm: String,
    project_version_checksum: bool,
    local: LocalSection,
    remote: Option<RemoteSection>,
}

impl Default for ConfigurationSection {
    fn default() -> Self {
        Self {
            enabled: true,
            hash_algorithm: "XX".to_string(),
            project_version_checksum: false,
            local: LocalSection::default(),
            remote: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LocalSection {
    location: Option<PathBuf>,
    max_builds_cached: usize,
}

impl Default for LocalSection {
    fn default() -> Self {
        Self { location: None, max_builds_cached: 3 }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RemoteSection {
    #[serde(rename = "@enabled")]
    enabled: bool,
    #[serde(rename = "@id")]
    id: String,
    url: Option<String>,
    save_enabled: bool,
    save_final: bool,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            enabled: false,
            id: "cache".to_string(),
            url: None,
            save_enabled: false,
            save_final: false,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct InputSection {
    global: Option<GlobalInputSection>,
    plugins: PluginScanList,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct GlobalInputSection {
    #[serde(rename = "@glob")]
    glob: String,
    includes: IncludeList,
    excludes: PatternList,
    exclude_properties: PropertyNameList,
    blacklist: DirNameList,
}

impl Default for GlobalInputSection {
    fn default() -> Self {
        Self {
            glob: "**/*".to_string(),
            includes: IncludeList::default(),
            excludes: PatternList::default(),
            exclude_properties: PropertyNameList::default(),
            blacklist: DirNameList::default(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IncludeList {
    #[serde(rename = "include", default)]
    includes: Vec<PathBuf>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PatternList {
    #[serde(rename = "exclude", default)]
    excludes: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PropertyNameList {
    #[serde(rename = "excludeProperty", default)]
    names: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DirNameList {
    #[serde(rename = "dir", default)]
    dirs: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PluginScanList {
    #[serde(rename = "plugin", default)]
    plugins: Vec<PluginScanSection>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PluginScanSection {
    #[serde(rename = "@artifactId")]
    artifact_id: String,
    #[serde(default)]
    scan_parameters: ParameterList,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ParameterList {
    #[serde(rename = "parameter", default)]
    parameters: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct OutputSection {
    dirs: DirList,
    generated_sources: DirList,
    extra_outputs: DirList,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DirList {
    #[serde(rename = "dir", default)]
    dirs: Vec<PathBuf>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ExecutionControlSection {
    run_always: RunAlwaysSection,
    reconcile: ReconcileSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RunAlwaysSection {
    plugins: NameList,
    executions: NameList,
    goals: NameList,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NameList {
    #[serde(rename = "name", default)]
    names: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ReconcileSection {
    #[serde(rename = "@logAll")]
    log_all: bool,
    plugins: ReconcilePluginList,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ReconcilePluginList {
    #[serde(rename = "plugin", default)]
    plugins: Vec<ReconcilePluginSection>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReconcilePluginSection {
    #[serde(rename = "@artifactId")]
    artifact_id: String,
    #[serde(rename = "@goal")]
    goal: String,
    #[serde(default)]
    reconciles: ReconcileList,
    #[serde(default)]
    nologs: NologList,
    #[serde(rename = "forceLogs", default)]
    force_logs: ForceLogList,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ReconcileList {
    #[serde(rename = "reconcile", default)]
    properties: Vec<ReconcileProperty>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReconcileProperty {
    #[serde(rename = "@propertyName")]
    property_name: String,
    #[serde(rename = "@skipValue", skip_serializing_if = "Option::is_none", default)]
    skip_value: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NologList {
    #[serde(rename = "nolog", default)]
    properties: Vec<NamedProperty>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ForceLogList {
    #[serde(rename = "forceLog", default)]
    properties: Vec<NamedProperty>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NamedProperty {
    #[serde(rename = "@propertyName")]
    property_name: String,
}

impl From<ConfigDocument> for CacheConfig {
    fn from(doc: ConfigDocument) -> Self {
        let defaults = CacheConfig::default();
        let configuration = doc.configuration;

        let remote = configuration.remote.map_or_else(RemoteConfig::default, |section| {
            RemoteConfig {
                enabled: section.enabled,
                url: section.url,
                server_id: section.id,
                save_enabled: section.save_enabled,
                save_final: section.save_final,
            }
        });

        let input = match doc.input.global {
            None => {
                let mut input = InputConfig::default();
                input.plugin_scans = plugin_scans(doc.input.plugins);
                input
            }
            Some(global) => {
                let roots = if global.includes.includes.is_empty() {
                    vec![PathBuf::from("src")]
                } else {
                    global.includes.includes
                };
                let blacklist = if global.blacklist.dirs.is_empty() {
                    InputConfig::default().blacklist
                } else {
                    global.blacklist.dirs
                };
                InputConfig {
                    source_scans: roots
                        .into_iter()
                        .map(|root| SourceScan {
                            root,
                            glob: global.glob.clone(),
                            excludes: global.excludes.excludes.clone(),
                        })
                        .collect(),
                    exclude_properties: global.exclude_properties.names,
                    blacklist,
                    plugin_scans: plugin_scans(doc.input.plugins),
                }
            }
        };

        let output = OutputConfig {
            dirs: non_empty_or(doc.output.dirs.dirs, defaults.output.dirs.clone()),
            generated_sources_dirs: non_empty_or(
                doc.output.generated_sources.dirs,
                defaults.output.generated_sources_dirs.clone(),
            ),
            extra_output_dirs: doc.output.extra_outputs.dirs,
        };

        let execution_control = doc.execution_control.map_or_else(Default::default, |section| {
            ExecutionControl {
                run_always: RunAlways {
                    plugins: section.run_always.plugins.names,
                    execution_ids: section.run_always.executions.names,
                    goals: section.run_always.goals.names,
                },
                goal_reconciles: section
                    .reconcile
                    .plugins
                    .plugins
                    .into_iter()
                    .map(|p| GoalReconcile {
                        plugin_artifact_id: p.artifact_id,
                        goal: p.goal,
                        tracked: p
                            .reconciles
                            .properties
                            .into_iter()
                            .map(|r| TrackedProperty {
                                name: r.property_name,
                                skip_value: r.skip_value,
                            })
                            .collect(),
                        no_log: p.nologs.properties.into_iter().map(|n| n.property_name).collect(),
                        force_log: p
                            .force_logs
                            .properties
                            .into_iter()
                            .map(|n| n.property_name)
                            .collect(),
                    })
                    .collect(),
                log_all: section.reconcile.log_all,
            }
        });

        CacheConfig {
            enabled: configuration.enabled,
            hash_algorithm: configuration.hash_algorithm,
            location: configuration.local.location,
            max_local_builds_cached: configuration.local.max_builds_cached,
            project_version_checksum: configuration.project_version_checksum,
            remote,
            input,
            output,
            execution_control,
            ..defaults
        }
    }
}

fn plugin_scans(list: PluginScanList) -> Vec<PluginScan> {
    list.plugins
        .into_iter()
        .map(|p| PluginScan {
            plugin_artifact_id: p.artifact_id,
            parameters: p.scan_parameters.parameters,
        })
        .collect()
}

fn non_empty_or<T>(value: Vec<T>, fallback: Vec<T>) -> Vec<T> {
    if value.is_empty() {
        fallback
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{PluginCoords, StepSource};

    const DOCUMENT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<cache>
  <configuration>
    <enabled>true</enabled>
    <hashAlgorithm>SHA-256</hashAlgorithm>
    <local>
      <maxBuildsCached>5</maxBuildsCached>
    </local>
    <remote enabled="true" id="shared">
      <url>https://cache.example.org/repo</url>
      <saveEnabled>true</saveEnabled>
      <saveFinal>false</saveFinal>
    </remote>
  </configuration>
  <input>
    <global glob="**/*.rs">
      <includes>
        <include>src</include>
        <include>build</include>
      </includes>
      <excludes>
        <exclude>**/tmp/**</exclude>
      </excludes>
      <excludeProperties>
        <excludeProperty>timestamp.*</excludeProperty>
      </excludeProperties>
    </global>
  </input>
  <executionControl>
    <runAlways>
      <plugins>
        <name>deploy-*</name>
      </plugins>
    </runAlways>
    <reconcile logAll="false">
      <plugins>
        <plugin artifactId="compiler-plugin" goal="compile">
          <reconciles>
            <reconcile propertyName="source"/>
            <reconcile propertyName="skipMain" skipValue="true"/>
          </reconciles>
          <nologs>
            <nolog propertyName="proxyPassword"/>
          </nologs>
        </plugin>
      </plugins>
    </reconcile>
  </executionControl>
</cache>
"#;

    fn step(artifact_id: &str, goal: &str, execution_id: &str) -> Step {
        Step {
            execution_id: execution_id.to_string(),
            goal: goal.to_string(),
            plugin: PluginCoords::new("org.example", artifact_id, "1.0"),
            phase: Some("compile".to_string()),
            source: StepSource::Lifecycle,
        }
    }

    #[test]
    fn document_maps_to_runtime_config() {
        let doc: ConfigDocument = utils::from_xml_str(DOCUMENT).unwrap();
        let config: CacheConfig = doc.into();
        assert_eq!(config.hash_algorithm, "SHA-256");
        assert_eq!(config.max_local_builds_cached, 5);
        assert!(config.remote.enabled);
        assert!(config.remote.save_enabled);
        assert_eq!(config.remote.server_id, "shared");
        assert_eq!(config.input.source_scans.len(), 2);
        assert_eq!(config.input.source_scans[0].glob, "**/*.rs");
        assert_eq!(config.input.exclude_properties, ["timestamp.*"]);
        let reconcile = config.goal_reconcile(&step("compiler-plugin", "compile", "any")).unwrap();
        assert_eq!(reconcile.tracked.len(), 2);
        assert_eq!(reconcile.tracked[1].skip_value.as_deref(), Some("true"));
        assert_eq!(reconcile.no_log, ["proxyPassword"]);
    }

    #[test]
    fn overrides_take_precedence() {
        let mut config = CacheConfig::default();
        let overrides: PropertyOverrides = [
            (keys::ENABLED, "false"),
            (keys::SKIP_CACHE, "true"),
            (keys::REMOTE_URL, "https://other.example.org"),
            (keys::ALWAYS_RUN_PLUGINS, "surefire-plugin, deploy-plugin:deploy"),
        ]
        .into_iter()
        .collect();
        config.apply_overrides(&overrides).unwrap();
        assert!(!config.enabled);
        assert!(config.skip_cache);
        assert_eq!(config.remote.url.as_deref(), Some("https://other.example.org"));
        assert_eq!(config.always_run_plugins.len(), 2);
    }

    #[test]
    fn invalid_boolean_override_fails() {
        let mut config = CacheConfig::default();
        let overrides: PropertyOverrides = [(keys::ENABLED, "yes")].into_iter().collect();
        assert!(matches!(config.apply_overrides(&overrides), Err(CacheError::Config(_))));
    }

    #[test]
    fn forced_step_matching() {
        let doc: ConfigDocument = utils::from_xml_str(DOCUMENT).unwrap();
        let mut config: CacheConfig = doc.into();
        assert!(config.is_forced(&step("deploy-plugin", "deploy", "default-deploy")));
        assert!(!config.is_forced(&step("compiler-plugin", "compile", "default-compile")));

        config.always_run_plugins = vec!["compiler-plugin:testCompile".to_string()];
        assert!(config.is_forced(&step("compiler-plugin", "testCompile", "default-test-compile")));
        assert!(!config.is_forced(&step("compiler-plugin", "compile", "default-compile")));
    }

    #[test]
    fn remote_url_validation() {
        let mut config = CacheConfig::default();
        assert!(config.validated_remote_url().unwrap().is_none());

        config.remote.enabled = true;
        assert!(matches!(config.validated_remote_url(), Err(CacheError::Config(_))));

        config.remote.url = Some("not a url".to_string());
        assert!(matches!(config.validated_remote_url(), Err(CacheError::Config(_))));

        config.remote.url = Some("https://cache.example.org/repo".to_string());
        assert!(config.validated_remote_url().unwrap().is_some());
    }

    #[test]
    fn unknown_hash_algorithm_fails_initialization() {
        let config = CacheConfig { hash_algorithm: "BLAKE-404".to_string(), ..Default::default() };
        assert!(matches!(config.resolve_hash_algorithm(), Err(CacheError::Config(_))));
    }
}
