//! Persisting fresh build outputs into the cache after a miss.

use crate::{
    archive,
    config::CacheConfig,
    error::{CacheError, Result},
    exec::{ModuleOutputs, Step, StepIntrospector},
    hasher::HashAlgorithm,
    model::{
        ArtifactDescriptor, BuildRecord, BuildSource, CacheContext, CompletedExecution,
        Executions, Goals, Properties, PropertyValue, ScmInfo, AttachedArtifacts,
        CACHE_IMPLEMENTATION_VERSION, EXTRA_OUTPUT_KIND, GENERATED_SOURCES_KIND,
    },
    reconcile::{normalize, ReconciliationEngine},
    report::DiffReport,
    repository::{
        local::LocalRepository,
        remote::{HttpTransport, RemoteRepository},
    },
    restore::MODULE_WORK_DIR,
    utils,
};
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use url::Url;

/// Value stored for properties redacted from the record.
const REDACTED: &str = "***";

/// What a save attempt accomplished.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SaveResult {
    pub saved: bool,
    pub shared_to_remote: bool,
}

/// Collects a finished build's outputs and publishes them to the cache.
pub struct Saver<'a> {
    config: &'a CacheConfig,
    local: Arc<LocalRepository>,
    remote: Option<Arc<RemoteRepository>>,
    algo: HashAlgorithm,
}

impl<'a> Saver<'a> {
    pub fn new(
        config: &'a CacheConfig,
        local: Arc<LocalRepository>,
        remote: Option<Arc<RemoteRepository>>,
        algo: HashAlgorithm,
    ) -> Self {
        Self { config, local, remote, algo }
    }

    /// Saves the build. Failures evict the half-written record and are
    /// never rethrown; the build result stands regardless.
    pub fn save(
        &self,
        ctx: &CacheContext,
        steps: &[Step],
        outputs: &ModuleOutputs,
        highest_completed_phase: &str,
        scm: &ScmInfo,
        introspector: &dyn StepIntrospector,
    ) -> SaveResult {
        match self.try_save(ctx, steps, outputs, highest_completed_phase, scm, introspector) {
            Ok(result) => result,
            Err(err) => {
                warn!(module = %ctx.module, %err, "save failed, evicting partial record");
                self.local.clear_cache(ctx);
                SaveResult::default()
            }
        }
    }

    fn try_save(
        &self,
        ctx: &CacheContext,
        steps: &[Step],
        outputs: &ModuleOutputs,
        highest_completed_phase: &str,
        scm: &ScmInfo,
        introspector: &dyn StepIntrospector,
    ) -> Result<SaveResult> {
        if let Some(existing) = self.local.find_local(ctx) {
            if existing.final_record {
                info!(module = %ctx.module, "final record present, save skipped");
                return Ok(SaveResult::default());
            }
        }

        // Blobs to publish: (descriptor, file currently on disk).
        let mut blobs: Vec<(ArtifactDescriptor, PathBuf)> = Vec::new();

        let primary = match &outputs.primary {
            Some(path) => {
                let kind = outputs.primary_kind.clone().unwrap_or_else(|| "jar".to_string());
                let descriptor = self.describe(ctx, path, &kind, None)?;
                blobs.push((descriptor.clone(), path.clone()));
                Some(descriptor)
            }
            None => None,
        };

        let mut attached = Vec::new();
        for output in &outputs.attached {
            let descriptor =
                self.describe(ctx, &output.path, &output.kind, output.classifier.clone())?;
            blobs.push((descriptor.clone(), output.path.clone()));
            attached.push(descriptor);
        }
        attached.extend(self.pack_directories(ctx, &mut blobs)?);

        let record = BuildRecord {
            cache_implementation_version: CACHE_IMPLEMENTATION_VERSION.to_string(),
            hash_algorithm: self.algo.name().to_string(),
            final_record: self.config.remote.save_final,
            highest_completed_phase: highest_completed_phase.to_string(),
            scm: scm.clone(),
            projects_input_info: ctx.fingerprint.clone(),
            artifact: primary,
            attached_artifacts: AttachedArtifacts { artifacts: attached },
            executions: self.snapshot_executions(ctx, steps, introspector),
            goals: Goals { goals: steps.iter().map(|s| s.goal.clone()).collect() },
            source: BuildSource::Build,
        };

        // Evict, publish blobs, manifest last: a record only becomes
        // visible once everything it references is in place.
        self.local.before_save(ctx);
        for (descriptor, src) in &blobs {
            self.local.save_artifact(ctx, &descriptor.file_name, src)?;
        }
        self.local.save_build(ctx, &record)?;
        info!(module = %ctx.module, checksum = ctx.checksum(), "saved");

        let shared_to_remote = self.push_remote(ctx, &record, &blobs);
        self.write_baseline_diff(ctx);

        Ok(SaveResult { saved: true, shared_to_remote })
    }

    fn describe(
        &self,
        ctx: &CacheContext,
        path: &Path,
        kind: &str,
        classifier: Option<String>,
    ) -> Result<ArtifactDescriptor> {
        // Outputs are reported by the orchestrator and may not be in
        // canonical form, unlike the context base directory.
        let path = &utils::canonicalized(path);
        let meta = fs::metadata(path).map_err(|err| CacheError::io(err, path))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| CacheError::msg(format!("artifact without file name: {}", path.display())))?;
        Ok(ArtifactDescriptor {
            group_id: ctx.module.group_id.clone(),
            artifact_id: ctx.module.artifact_id.clone(),
            version: ctx.module.version.clone(),
            classifier,
            kind: kind.to_string(),
            file_name,
            file_hash: self.algo.hash_file(path)?,
            file_size: meta.len(),
            file_path: utils::to_unix_string(&utils::relativize(&ctx.base_dir, path)),
        })
    }

    /// Packs the configured generated-source and extra output directories
    /// into archives attached under a stable `<kind>_<counter>` classifier.
    fn pack_directories(
        &self,
        ctx: &CacheContext,
        blobs: &mut Vec<(ArtifactDescriptor, PathBuf)>,
    ) -> Result<Vec<ArtifactDescriptor>> {
        let work_dir = ctx.base_dir.join(MODULE_WORK_DIR);
        let mut attached = Vec::new();

        let dirs = self
            .config
            .output
            .generated_sources_dirs
            .iter()
            .map(|d| (GENERATED_SOURCES_KIND, d))
            .chain(self.config.output.extra_output_dirs.iter().map(|d| (EXTRA_OUTPUT_KIND, d)));

        let mut counters = std::collections::HashMap::new();
        for (kind, dir) in dirs {
            let src = ctx.base_dir.join(dir);
            if !src.is_dir() {
                continue;
            }
            let counter = counters.entry(kind).or_insert(0u32);
            *counter += 1;
            let classifier = format!("{kind}_{counter}");
            let file_name = format!(
                "{}-{}-{classifier}.tar",
                ctx.module.artifact_id, ctx.module.version
            );
            let archive_path = work_dir.join(&file_name);
            if !archive::pack(&src, &archive_path, None, true, false)? {
                *counter -= 1;
                continue;
            }
            let meta =
                fs::metadata(&archive_path).map_err(|err| CacheError::io(err, &archive_path))?;
            let descriptor = ArtifactDescriptor {
                group_id: ctx.module.group_id.clone(),
                artifact_id: ctx.module.artifact_id.clone(),
                version: ctx.module.version.clone(),
                classifier: Some(classifier),
                kind: "tar".to_string(),
                file_name,
                file_hash: self.algo.hash_file(&archive_path)?,
                file_size: meta.len(),
                file_path: utils::to_unix_string(dir),
            };
            blobs.push((descriptor.clone(), archive_path));
            attached.push(descriptor);
        }
        Ok(attached)
    }

    /// Records every step's parameter values under normalization, marking
    /// tracked ones and redacting sensitive ones.
    fn snapshot_executions(
        &self,
        ctx: &CacheContext,
        steps: &[Step],
        introspector: &dyn StepIntrospector,
    ) -> Executions {
        let engine = ReconciliationEngine::new(self.config, &ctx.base_dir);
        let mut executions = Vec::new();
        for step in steps {
            let Some(parameters) = introspector.parameters(step) else {
                continue;
            };
            let tracked: BTreeSet<String> =
                engine.tracked_properties(step).into_iter().map(|p| p.name).collect();
            let rule = self.config.goal_reconcile(step);
            let log_all = self.config.execution_control.log_all;

            let mut names: BTreeSet<String> = parameters.parameter_names().into_iter().collect();
            names.extend(tracked.iter().cloned());

            let mut properties = Vec::new();
            for name in names {
                let value = parameters.value_of(&name).unwrap_or(crate::exec::ParamValue::Null);
                let mut rendered = normalize(&value, &ctx.base_dir);
                let no_log = rule.is_some_and(|r| r.no_log.iter().any(|n| *n == name));
                let force_log = rule.is_some_and(|r| r.force_log.iter().any(|n| *n == name));
                if no_log && !log_all && !force_log {
                    rendered = REDACTED.to_string();
                }
                properties.push(PropertyValue {
                    tracked: tracked.contains(&name),
                    name,
                    value: rendered,
                });
            }
            executions.push(CompletedExecution {
                execution_key: step.execution_key(),
                step_class: None,
                properties: Properties { items: properties },
            });
        }
        Executions { executions }
    }

    fn push_remote(
        &self,
        ctx: &CacheContext,
        record: &BuildRecord,
        blobs: &[(ArtifactDescriptor, PathBuf)],
    ) -> bool {
        let Some(remote) = self.remote.as_deref().filter(|r| r.save_enabled()) else {
            return false;
        };
        let mut shared = true;
        for (descriptor, _) in blobs {
            let blob = self.local.artifact_file(
                ctx,
                BuildSource::Local,
                remote.server_id(),
                &descriptor.file_name,
            );
            shared &= remote.put_artifact(ctx, &descriptor.file_name, &blob);
        }
        shared &= remote.put_build(ctx, record);
        if shared {
            info!(module = %ctx.module, checksum = ctx.checksum(), "shared to remote cache");
        }
        shared
    }

    /// Diffs the fresh fingerprint against the configured baseline and
    /// persists the result next to the local record.
    fn write_baseline_diff(&self, ctx: &CacheContext) {
        let Some(raw_url) = &self.config.baseline_url else { return };
        let baseline_repo = match Url::parse(raw_url)
            .map_err(|err| CacheError::config(format!("invalid baseline url: {err}")))
            .and_then(|url| HttpTransport::new(url, None))
        {
            Ok(transport) => RemoteRepository::new(Box::new(transport), "baseline", false),
            Err(err) => {
                warn!(%err, "baseline diff skipped");
                return;
            }
        };
        let Some(baseline) = baseline_repo.find_baseline(&ctx.module) else {
            debug!(module = %ctx.module, "no baseline record");
            return;
        };
        let diff = DiffReport::between(&ctx.fingerprint, &baseline.projects_input_info);
        match utils::to_xml_string(&diff) {
            Ok(xml) => {
                let name = DiffReport::file_name(ctx.checksum());
                if let Err(err) = self.local.save_report(ctx, &name, xml.as_bytes()) {
                    warn!(%err, "failed to persist baseline diff");
                }
            }
            Err(err) => warn!(%err, "failed to serialize baseline diff"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        exec::{ParamValue, ParameterIntrospection, PluginCoords, StepSource},
        model::{InputFingerprint, ModuleId},
        utils::tempdir,
    };
    use std::collections::HashMap;

    struct SnapshotIntrospection(HashMap<String, ParamValue>);

    impl ParameterIntrospection for SnapshotIntrospection {
        fn value_of(&self, name: &str) -> Option<ParamValue> {
            self.0.get(name).cloned()
        }

        fn parameter_names(&self) -> Vec<String> {
            self.0.keys().cloned().collect()
        }
    }

    struct SnapshotIntrospector(HashMap<String, ParamValue>);

    impl StepIntrospector for SnapshotIntrospector {
        fn parameters(&self, _step: &Step) -> Option<Box<dyn ParameterIntrospection + '_>> {
            Some(Box::new(SnapshotIntrospection(self.0.clone())))
        }
    }

    fn context(base_dir: &Path) -> CacheContext {
        CacheContext {
            module: ModuleId::new("org.example", "app", "1.0"),
            base_dir: base_dir.to_path_buf(),
            fingerprint: InputFingerprint { checksum: "abc".to_string(), items: Vec::new() },
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

    fn saver_config() -> CacheConfig {
        let mut config = CacheConfig::default();
        config.execution_control.goal_reconciles = vec![crate::config::GoalReconcile {
            plugin_artifact_id: "compiler-plugin".to_string(),
            goal: "compile".to_string(),
            tracked: vec![crate::config::TrackedProperty {
                name: "source".to_string(),
                skip_value: None,
            }],
            no_log: vec!["proxyPassword".to_string()],
            force_log: Vec::new(),
        }];
        config
    }

    #[test]
    fn snapshot_marks_tracked_and_redacts_secrets() {
        let tmp = tempdir("save").unwrap();
        let config = saver_config();
        let local = Arc::new(LocalRepository::new(&CacheConfig {
            location: Some(tmp.path().to_path_buf()),
            ..Default::default()
        }));
        let saver = Saver::new(&config, local, None, HashAlgorithm::Xx);

        let introspector = SnapshotIntrospector(
            [
                ("source".to_string(), ParamValue::Text("11".to_string())),
                ("proxyPassword".to_string(), ParamValue::Text("hunter2".to_string())),
            ]
            .into_iter()
            .collect(),
        );
        let ctx = context(tmp.path());
        let executions = saver.snapshot_executions(&ctx, &[step()], &introspector);

        let execution = &executions.executions[0];
        let source = execution.property("source").unwrap();
        assert!(source.tracked);
        assert_eq!(source.value, "11");
        let secret = execution.property("proxyPassword").unwrap();
        assert!(!secret.tracked);
        assert_eq!(secret.value, REDACTED);
    }

    #[test]
    fn save_publishes_record_and_blobs() {
        let tmp = tempdir("save").unwrap();
        let module_dir = tmp.path().join("module");
        fs::create_dir_all(module_dir.join("target/generated-sources/api")).unwrap();
        fs::write(module_dir.join("target/app-1.0.jar"), b"jar-bytes").unwrap();
        fs::write(module_dir.join("target/generated-sources/api/Gen.java"), b"gen").unwrap();

        let cache_root = tmp.path().join("cache");
        let config = saver_config();
        let local = Arc::new(LocalRepository::new(&CacheConfig {
            location: Some(cache_root),
            ..Default::default()
        }));
        let saver = Saver::new(&config, local.clone(), None, HashAlgorithm::Xx);

        let ctx = context(&module_dir);
        let outputs = ModuleOutputs {
            primary: Some(module_dir.join("target/app-1.0.jar")),
            primary_kind: Some("jar".to_string()),
            attached: Vec::new(),
        };
        let introspector = SnapshotIntrospector(HashMap::new());
        let result =
            saver.save(&ctx, &[step()], &outputs, "package", &ScmInfo::default(), &introspector);
        assert!(result.saved);
        assert!(!result.shared_to_remote);

        let record = local.find_local(&ctx).unwrap();
        assert_eq!(record.checksum(), "abc");
        assert_eq!(record.highest_completed_phase, "package");
        let primary = record.artifact.as_ref().unwrap();
        assert_eq!(primary.file_name, "app-1.0.jar");
        assert_eq!(primary.file_path, "target/app-1.0.jar");
        assert!(local.local_dir(&ctx).join("app-1.0.jar").is_file());

        // The generated-sources dir was packed and attached.
        assert_eq!(record.attached_directories().count(), 1);
        let generated = record.attached_directories().next().unwrap();
        assert_eq!(generated.file_path, "target/generated-sources");
        assert!(local.local_dir(&ctx).join(&generated.file_name).is_file());
    }

    #[test]
    fn final_local_record_is_not_overwritten() {
        let tmp = tempdir("save").unwrap();
        let module_dir = tmp.path().join("module");
        fs::create_dir_all(module_dir.join("target")).unwrap();
        fs::write(module_dir.join("target/app-1.0.jar"), b"jar").unwrap();

        let config = saver_config();
        let local = Arc::new(LocalRepository::new(&CacheConfig {
            location: Some(tmp.path().join("cache")),
            ..Default::default()
        }));
        let ctx = context(&module_dir);
        let saver = Saver::new(&config, local.clone(), None, HashAlgorithm::Xx);

        let outputs = ModuleOutputs {
            primary: Some(module_dir.join("target/app-1.0.jar")),
            primary_kind: Some("jar".to_string()),
            attached: Vec::new(),
        };
        let introspector = SnapshotIntrospector(HashMap::new());
        assert!(saver
            .save(&ctx, &[step()], &outputs, "package", &ScmInfo::default(), &introspector)
            .saved);

        // Mark the saved record final, then try to overwrite it.
        let mut record = local.find_local(&ctx).unwrap();
        record.final_record = true;
        local.save_build(&ctx, &record).unwrap();

        let second =
            saver.save(&ctx, &[step()], &outputs, "install", &ScmInfo::default(), &introspector);
        assert!(!second.saved);
        assert_eq!(local.find_local(&ctx).unwrap().highest_completed_phase, "package");
    }
}
