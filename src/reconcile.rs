//! Verification of tracked step parameters against the cached record.
//!
//! A cache hit is only usable when every tracked parameter of every
//! cached step still has the value the record was built with. Values are
//! normalized identically at save and at verify, so comparison is plain
//! string equality.

use crate::{
    config::{CacheConfig, TrackedProperty},
    exec::{ParamValue, Step, StepIntrospector},
    model::BuildRecord,
    utils,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One reconciliation mismatch, as persisted into diff reports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "mismatch")]
pub struct Mismatch {
    /// The property (or digest item) that differs.
    #[serde(rename = "@item")]
    pub item: String,
    #[serde(rename = "@current")]
    pub current: String,
    #[serde(rename = "@baseline")]
    pub baseline: String,
    #[serde(rename = "@reason")]
    pub reason: String,
    #[serde(rename = "@resolution")]
    pub resolution: String,
    /// Where the mismatch was found (execution key, item type).
    #[serde(rename = "@context")]
    pub context: String,
}

/// Normalizes a parameter value to its persisted string form.
///
/// - absolute paths under the module base directory are relativized with
///   `.`/`..` collapsed; other paths are left unchanged
/// - arrays stringify as `[a, b, c]`
/// - `null` is the literal string `"null"`
pub fn normalize(value: &ParamValue, base_dir: &Path) -> String {
    match value {
        ParamValue::Null => "null".to_string(),
        ParamValue::Text(text) => text.clone(),
        ParamValue::Path(path) => {
            if path.is_absolute() && utils::is_within(base_dir, path) {
                utils::to_unix_string(&utils::relativize(base_dir, path))
            } else {
                utils::to_unix_string(path)
            }
        }
        ParamValue::List(items) => {
            let rendered: Vec<String> = items.iter().map(|v| normalize(v, base_dir)).collect();
            format!("[{}]", rendered.join(", "))
        }
    }
}

/// Built-in parameter definitions for well-known plugin goals, used when
/// a step has no explicit tracked-property configuration.
fn registry_parameters(step: &Step) -> &'static [&'static str] {
    match (step.plugin.artifact_id.as_str(), step.goal.as_str()) {
        ("compiler-plugin", "compile") | ("compiler-plugin", "testCompile") => {
            &["source", "target", "release", "debug", "parameters", "skipMain"]
        }
        ("surefire-plugin", "test") => &["skipTests", "test", "includes", "excludes", "argLine"],
        ("resources-plugin", "resources") | ("resources-plugin", "testResources") => {
            &["encoding", "overwrite"]
        }
        ("jar-plugin", "jar") => &["classifier", "forceCreation"],
        _ => &[],
    }
}

/// Verifies tracked step parameters against a cached record.
pub struct ReconciliationEngine<'a> {
    config: &'a CacheConfig,
    base_dir: &'a Path,
}

impl<'a> ReconciliationEngine<'a> {
    pub fn new(config: &'a CacheConfig, base_dir: &'a Path) -> Self {
        Self { config, base_dir }
    }

    /// The tracked properties of a step: explicit configuration wins,
    /// otherwise the parameter-definition registry applies.
    pub fn tracked_properties(&self, step: &Step) -> Vec<TrackedProperty> {
        if let Some(rule) = self.config.goal_reconcile(step) {
            return rule.tracked.clone();
        }
        registry_parameters(step)
            .iter()
            .map(|name| TrackedProperty { name: (*name).to_string(), skip_value: None })
            .collect()
    }

    /// Compares the step's current tracked parameters to the cached
    /// record. An empty result means the step is consistent.
    pub fn verify_step(
        &self,
        step: &Step,
        record: &BuildRecord,
        introspector: &dyn StepIntrospector,
    ) -> Vec<Mismatch> {
        let tracked = self.tracked_properties(step);
        if tracked.is_empty() {
            return Vec::new();
        }

        let execution_key = step.execution_key();
        let Some(parameters) = introspector.parameters(step) else {
            warn!(step = %step, "step cannot be introspected, treating as inconsistent");
            return vec![Mismatch {
                item: "*".to_string(),
                current: "<unavailable>".to_string(),
                baseline: "<recorded>".to_string(),
                reason: "step parameters cannot be introspected".to_string(),
                resolution: "rebuild".to_string(),
                context: execution_key,
            }];
        };
        let baseline_execution = record.execution(&execution_key);

        let mut mismatches = Vec::new();
        for property in tracked {
            let current_value = parameters.value_of(&property.name).unwrap_or(ParamValue::Null);
            let current = normalize(&current_value, self.base_dir);

            if property.skip_value.as_deref() == Some(current.as_str()) {
                warn!(
                    step = %step,
                    property = %property.name,
                    "step is skipped by its parameters, cache may be incomplete"
                );
                continue;
            }

            let baseline = baseline_execution.and_then(|e| e.property(&property.name));
            match baseline {
                None => {
                    info!(
                        step = %step,
                        property = %property.name,
                        %current,
                        "rebuilding, reason: tracked property missing from cached build"
                    );
                    mismatches.push(Mismatch {
                        item: property.name.clone(),
                        current,
                        baseline: "<absent>".to_string(),
                        reason: "property not recorded in cached build".to_string(),
                        resolution: "rebuild".to_string(),
                        context: execution_key.clone(),
                    });
                }
                Some(recorded) if recorded.value != current => {
                    info!(
                        step = %step,
                        property = %property.name,
                        %current,
                        baseline = %recorded.value,
                        "rebuilding, reason: tracked property changed"
                    );
                    mismatches.push(Mismatch {
                        item: property.name.clone(),
                        current,
                        baseline: recorded.value.clone(),
                        reason: "property value changed".to_string(),
                        resolution: "rebuild".to_string(),
                        context: execution_key.clone(),
                    });
                }
                Some(_) => {}
            }
        }
        mismatches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        exec::{ParameterIntrospection, PluginCoords, StepSource},
        model::{
            BuildSource, CompletedExecution, Executions, InputFingerprint, Properties,
            PropertyValue, ScmInfo, CACHE_IMPLEMENTATION_VERSION,
        },
    };
    use std::{collections::HashMap, path::PathBuf};

    struct MapIntrospection(HashMap<String, ParamValue>);

    impl ParameterIntrospection for MapIntrospection {
        fn value_of(&self, name: &str) -> Option<ParamValue> {
            self.0.get(name).cloned()
        }
    }

    struct MapIntrospector(HashMap<String, ParamValue>);

    impl StepIntrospector for MapIntrospector {
        fn parameters(&self, _step: &Step) -> Option<Box<dyn ParameterIntrospection + '_>> {
            Some(Box::new(MapIntrospection(self.0.clone())))
        }
    }

    fn step() -> Step {
        Step {
            execution_id: "default-compile".to_string(),
            goal: "compile".to_string(),
            plugin: PluginCoords::new("org.example", "compiler-plugin", "3.1"),
            phase: Some("compile".to_string()),
            source: StepSource::Lifecycle,
        }
    }

    fn record_with(properties: Vec<PropertyValue>) -> BuildRecord {
        BuildRecord {
            cache_implementation_version: CACHE_IMPLEMENTATION_VERSION.to_string(),
            hash_algorithm: "XX".to_string(),
            final_record: false,
            highest_completed_phase: "package".to_string(),
            scm: ScmInfo::default(),
            projects_input_info: InputFingerprint {
                checksum: "abc".to_string(),
                items: Vec::new(),
            },
            artifact: None,
            attached_artifacts: Default::default(),
            executions: Executions {
                executions: vec![CompletedExecution {
                    execution_key: step().execution_key(),
                    step_class: None,
                    properties: Properties { items: properties },
                }],
            },
            goals: Default::default(),
            source: BuildSource::Local,
        }
    }

    fn tracked_config() -> CacheConfig {
        let mut config = CacheConfig::default();
        config.execution_control.goal_reconciles = vec![crate::config::GoalReconcile {
            plugin_artifact_id: "compiler-plugin".to_string(),
            goal: "compile".to_string(),
            tracked: vec![
                TrackedProperty { name: "source".to_string(), skip_value: None },
                TrackedProperty { name: "skipMain".to_string(), skip_value: Some("true".to_string()) },
            ],
            no_log: Vec::new(),
            force_log: Vec::new(),
        }];
        config
    }

    fn recorded(name: &str, value: &str) -> PropertyValue {
        PropertyValue { name: name.to_string(), value: value.to_string(), tracked: true }
    }

    #[test]
    fn normalization_rules() {
        let base = Path::new("/work/app");
        assert_eq!(normalize(&ParamValue::Null, base), "null");
        assert_eq!(normalize(&"11".into(), base), "11");
        assert_eq!(
            normalize(&ParamValue::Path(PathBuf::from("/work/app/target/./classes")), base),
            "target/classes"
        );
        assert_eq!(
            normalize(&ParamValue::Path(PathBuf::from("/elsewhere/lib")), base),
            "/elsewhere/lib"
        );
        let list = ParamValue::List(vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(normalize(&list, base), "[a, b, c]");
    }

    #[test]
    fn normalize_round_trips_through_record() {
        // normalize -> save -> load -> normalize compares equal
        let base = Path::new("/work/app");
        let value = ParamValue::Path(PathBuf::from("/work/app/src/../target/out"));
        let saved = normalize(&value, base);
        let reloaded = ParamValue::Text(saved.clone());
        assert_eq!(normalize(&reloaded, base), saved);
    }

    #[test]
    fn matching_parameters_are_consistent() {
        let config = tracked_config();
        let base = PathBuf::from("/work/app");
        let engine = ReconciliationEngine::new(&config, &base);
        let introspector = MapIntrospector(
            [("source".to_string(), ParamValue::Text("11".to_string()))].into_iter().collect(),
        );
        let record = record_with(vec![recorded("source", "11")]);
        assert!(engine.verify_step(&step(), &record, &introspector).is_empty());
    }

    #[test]
    fn changed_parameter_reports_current_and_baseline() {
        let config = tracked_config();
        let base = PathBuf::from("/work/app");
        let engine = ReconciliationEngine::new(&config, &base);
        let introspector = MapIntrospector(
            [("source".to_string(), ParamValue::Text("17".to_string()))].into_iter().collect(),
        );
        let record = record_with(vec![recorded("source", "11")]);

        let mismatches = engine.verify_step(&step(), &record, &introspector);
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].current, "17");
        assert_eq!(mismatches[0].baseline, "11");
    }

    #[test]
    fn absent_baseline_property_is_inconsistent() {
        let config = tracked_config();
        let base = PathBuf::from("/work/app");
        let engine = ReconciliationEngine::new(&config, &base);
        let introspector = MapIntrospector(
            [("source".to_string(), ParamValue::Text("11".to_string()))].into_iter().collect(),
        );
        let record = record_with(Vec::new());

        let mismatches = engine.verify_step(&step(), &record, &introspector);
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].baseline, "<absent>");
    }

    #[test]
    fn skip_value_passes_with_warning() {
        let config = tracked_config();
        let base = PathBuf::from("/work/app");
        let engine = ReconciliationEngine::new(&config, &base);
        let introspector = MapIntrospector(
            [
                ("source".to_string(), ParamValue::Text("11".to_string())),
                ("skipMain".to_string(), ParamValue::Text("true".to_string())),
            ]
            .into_iter()
            .collect(),
        );
        // skipMain was recorded with a different value, but the current
        // value equals the configured skip value.
        let record = record_with(vec![recorded("source", "11"), recorded("skipMain", "false")]);
        assert!(engine.verify_step(&step(), &record, &introspector).is_empty());
    }

    #[test]
    fn registry_supplies_tracked_parameters() {
        let config = CacheConfig::default();
        let base = PathBuf::from("/work/app");
        let engine = ReconciliationEngine::new(&config, &base);
        let names: Vec<_> =
            engine.tracked_properties(&step()).into_iter().map(|p| p.name).collect();
        assert!(names.contains(&"source".to_string()));
        assert!(names.contains(&"target".to_string()));
    }
}
