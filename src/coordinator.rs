//! The per-module decision state machine and run-scoped session state.
//!
//! The orchestrator hands every module's ordered step list to
//! [`CacheCoordinator::execute_module`]. The coordinator runs the clean
//! prefix, fingerprints the inputs, consults the two-tier repository,
//! restores or rebuilds, and saves fresh outputs for future runs. All
//! session state lives in [`RunContext`]; there are no globals.

use crate::{
    config::CacheConfig,
    error::{CacheError, Result},
    exec::{Step, StepIntrospector, StepRunner, StepSource},
    fingerprint::{InputFingerprinter, InputProvider, ModuleInputs},
    hasher::HashAlgorithm,
    lifecycle::{ForkTracker, LifecycleSegmenter, Lifecycles, StandardLifecycles},
    model::{BuildSource, CacheContext, CacheResult, ModuleId, RestorationStatus, ScmInfo},
    report::{CacheReport, ProjectReportLine},
    repository::{
        local::LocalRepository,
        remote::{HttpTransport, RemoteRepository},
    },
    restore::{Restorer, StagingArea},
    save::Saver,
    utils,
};
use once_cell::sync::OnceCell;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

/// Per-module engine lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CacheState {
    Disabled,
    Initialized,
}

/// Session-scoped state for one orchestrator invocation.
pub struct RunContext {
    config: Arc<CacheConfig>,
    state: CacheState,
    algo: HashAlgorithm,
    local: Arc<LocalRepository>,
    remote: Option<Arc<RemoteRepository>>,
    lifecycles: Box<dyn Lifecycles + Send + Sync>,
    fingerprinter: OnceCell<InputFingerprinter>,
    fork_tracker: ForkTracker,
    scm: OnceCell<ScmInfo>,
    session_root: PathBuf,
    session_id: String,
    report_lines: Mutex<Vec<ProjectReportLine>>,
}

impl RunContext {
    /// Initializes session state with the conventional lifecycle phases.
    ///
    /// Fails fast on configuration errors: an unknown hash algorithm or
    /// an invalid remote endpoint is fatal for the run.
    pub fn new(
        config: CacheConfig,
        session_root: impl Into<PathBuf>,
        session_id: impl Into<String>,
    ) -> Result<Self> {
        Self::with_lifecycles(config, session_root, session_id, Box::<StandardLifecycles>::default())
    }

    /// Initializes session state with orchestrator-provided lifecycles.
    pub fn with_lifecycles(
        config: CacheConfig,
        session_root: impl Into<PathBuf>,
        session_id: impl Into<String>,
        lifecycles: Box<dyn Lifecycles + Send + Sync>,
    ) -> Result<Self> {
        let state = if config.enabled { CacheState::Initialized } else { CacheState::Disabled };
        let algo = match state {
            CacheState::Initialized => config.resolve_hash_algorithm()?,
            CacheState::Disabled => HashAlgorithm::Xx,
        };
        let remote = match state {
            CacheState::Initialized => config
                .validated_remote_url()?
                .map(|url| {
                    HttpTransport::new(url, None).map(|transport| {
                        Arc::new(RemoteRepository::new(
                            Box::new(transport),
                            config.remote.server_id.clone(),
                            config.remote.save_enabled,
                        ))
                    })
                })
                .transpose()?,
            CacheState::Disabled => None,
        };
        let local = Arc::new(LocalRepository::new(&config));
        Ok(Self {
            config: Arc::new(config),
            state,
            algo,
            local,
            remote,
            lifecycles,
            fingerprinter: OnceCell::new(),
            fork_tracker: ForkTracker::default(),
            scm: OnceCell::new(),
            session_root: session_root.into(),
            session_id: session_id.into(),
            report_lines: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The fork tracker fed by the orchestrator's lifecycle callbacks.
    pub fn fork_tracker(&self) -> &ForkTracker {
        &self.fork_tracker
    }

    /// Version control state, read once per run.
    pub fn scm(&self) -> &ScmInfo {
        self.scm.get_or_init(|| read_scm_info(&self.session_root))
    }

    fn fingerprinter(&self) -> &InputFingerprinter {
        self.fingerprinter.get_or_init(|| {
            InputFingerprinter::new(
                self.config.clone(),
                self.algo,
                Some(self.local.clone()),
                Some(self.scm().source_branch.clone()).filter(|b| !b.is_empty()),
            )
        })
    }
}

/// One module's work order: raw fingerprint inputs plus the ordered step
/// list the orchestrator intends to run.
#[derive(Clone, Debug)]
pub struct ModuleRequest {
    pub inputs: ModuleInputs,
    pub steps: Vec<Step>,
}

/// What happened to one module.
#[derive(Clone, Debug, Default)]
pub struct ModuleOutcome {
    pub checksum: Option<String>,
    /// The full requested phase range was restored from cache.
    pub restored: bool,
    /// A phase prefix was restored; the suffix was built.
    pub partial: bool,
    pub rebuilt: bool,
    pub saved: bool,
    pub shared_to_remote: bool,
}

/// Drives the cache decision for each module of a run.
pub struct CacheCoordinator {
    ctx: Arc<RunContext>,
}

impl CacheCoordinator {
    pub fn new(ctx: Arc<RunContext>) -> Self {
        Self { ctx }
    }

    /// Executes one module under cache control.
    ///
    /// The returned outcome reports what was restored, rebuilt and saved.
    /// Fatal errors (configuration, fingerprinting, cycles, path escapes)
    /// surface as `Err`; everything else degrades to a rebuild.
    pub fn execute_module(
        &self,
        request: &ModuleRequest,
        runner: &mut dyn StepRunner,
        introspector: &dyn StepIntrospector,
        provider: &dyn InputProvider,
    ) -> Result<ModuleOutcome> {
        let module = request.inputs.module.clone();
        let steps = &request.steps;
        let config = self.ctx.config();

        if steps.iter().any(|s| s.source == StepSource::Cli) {
            info!(module = %module, "direct invocation, caching disabled");
            run_steps(steps.iter(), runner)?;
            return Ok(ModuleOutcome { rebuilt: true, ..Default::default() });
        }
        if self.ctx.fork_tracker.is_forked(&module) {
            info!(module = %module, "forked execution, caching disabled");
            run_steps(steps.iter(), runner)?;
            return Ok(ModuleOutcome { rebuilt: true, ..Default::default() });
        }

        let segmenter = LifecycleSegmenter::new(self.ctx.lifecycles.as_ref());
        let clean_segment = segmenter.clean_segment(steps);
        run_steps(clean_segment.iter().copied(), runner)?;
        let had_clean = !clean_segment.is_empty();

        if self.ctx.state == CacheState::Disabled {
            debug!(module = %module, "cache disabled, running remaining steps");
            run_steps(segmenter.non_clean_segment(steps).into_iter(), runner)?;
            return Ok(ModuleOutcome { rebuilt: true, ..Default::default() });
        }

        let fingerprint = self.ctx.fingerprinter().fingerprint(&request.inputs, provider)?;
        let cache_ctx = CacheContext {
            module: module.clone(),
            base_dir: utils::canonicalized(&request.inputs.base_dir),
            fingerprint: (*fingerprint).clone(),
        };

        let result = if config.skip_cache {
            info!(module = %module, "cache lookup disabled, forced miss");
            CacheResult::Empty
        } else {
            self.lookup(&cache_ctx, steps, &segmenter)?
        };

        let mut outcome = ModuleOutcome {
            checksum: Some(cache_ctx.checksum().to_string()),
            ..Default::default()
        };
        let mut plugins_matched = true;
        let mut needs_rebuild = !result.is_restorable();

        if let Some(record) = result.build() {
            info!(
                module = %module,
                checksum = cache_ctx.checksum(),
                source = record.source.as_str(),
                partial = result.is_partial(),
                "restoring from cache"
            );
            let restorer = Restorer::new(
                config,
                self.ctx.local.clone(),
                self.ctx.remote.clone(),
                self.ctx.lifecycles.as_ref(),
            );
            let restore =
                restorer.restore(&cache_ctx, record, steps, runner, introspector)?;
            match restore.status {
                RestorationStatus::Success => {
                    outcome.restored = result.is_success();
                    outcome.partial = result.is_partial();
                }
                RestorationStatus::Failure => {
                    plugins_matched &= restore.mismatches.is_empty();
                    needs_rebuild = true;
                }
                RestorationStatus::FailureNeedsClean => {
                    info!(module = %module, "partially restored tree, re-running clean");
                    run_steps(clean_segment.iter().copied(), runner)?;
                    plugins_matched &= restore.mismatches.is_empty();
                    needs_rebuild = true;
                }
            }
        }

        // A save happens unless the full requested range came from cache.
        let fully_restored = outcome.restored;
        let save_needed = !config.skip_save
            && !fully_restored
            && (!config.mandatory_clean || had_clean);

        let mut staging = None;
        if needs_rebuild {
            if result.build().is_some() {
                info!(module = %module, "rebuilding, reason: cached build not usable");
            } else {
                info!(module = %module, checksum = cache_ctx.checksum(), "rebuilding, reason: no cached build");
            }
            if save_needed && !had_clean {
                staging = Some(StagingArea::stage(&cache_ctx.base_dir, &config.output.dirs)?);
            }
            run_steps(segmenter.non_clean_segment(steps).into_iter(), runner)?;
            outcome.rebuilt = true;
        }

        if save_needed {
            let saver = Saver::new(
                config,
                self.ctx.local.clone(),
                self.ctx.remote.clone(),
                self.ctx.algo,
            );
            let highest = segmenter.highest_phase(steps)?.unwrap_or_default().to_string();
            let outputs = runner.outputs();
            let saved = saver.save(
                &cache_ctx,
                steps,
                &outputs,
                &highest,
                self.ctx.scm(),
                introspector,
            );
            outcome.saved = saved.saved;
            outcome.shared_to_remote = saved.shared_to_remote;
        } else if config.mandatory_clean && !had_clean && !fully_restored {
            info!(module = %module, "save skipped, clean segment did not run");
        }
        if let Some(staging) = staging {
            staging.finish()?;
        }

        self.record_report_line(&module, &cache_ctx, &result, &outcome, plugins_matched);

        if config.fail_fast && !outcome.restored && !outcome.partial && !config.skip_cache {
            return Err(CacheError::msg(format!(
                "cache miss for {module} and failFast is enabled"
            )));
        }
        Ok(outcome)
    }

    /// Looks the fingerprint up across both tiers and classifies the hit
    /// against the requested phase range.
    fn lookup(
        &self,
        cache_ctx: &CacheContext,
        steps: &[Step],
        segmenter: &LifecycleSegmenter<'_>,
    ) -> Result<CacheResult> {
        let Some(record) = self.ctx.local.find_build(cache_ctx, self.ctx.remote.as_deref()) else {
            return Ok(CacheResult::Empty);
        };
        if record.cache_implementation_version != crate::model::CACHE_IMPLEMENTATION_VERSION {
            warn!(
                module = %cache_ctx.module,
                recorded = %record.cache_implementation_version,
                "record written by a different implementation version, ignoring"
            );
            return Ok(CacheResult::Empty);
        }
        let Some(requested) = segmenter.highest_phase(steps)? else {
            return Ok(CacheResult::Empty);
        };
        if segmenter.is_later_phase(requested, &record.highest_completed_phase)? {
            Ok(CacheResult::Partial(Box::new(record)))
        } else {
            Ok(CacheResult::Success(Box::new(record)))
        }
    }

    fn record_report_line(
        &self,
        module: &ModuleId,
        cache_ctx: &CacheContext,
        result: &CacheResult,
        outcome: &ModuleOutcome,
        plugins_matched: bool,
    ) {
        let source = result
            .build()
            .map(|record| record.source)
            .unwrap_or(BuildSource::Build)
            .as_str()
            .to_string();
        let url = self
            .ctx
            .config()
            .remote
            .url
            .clone()
            .filter(|_| matches!(result.build().map(|r| r.source), Some(BuildSource::Remote)));
        let line = ProjectReportLine {
            group_id: module.group_id.clone(),
            artifact_id: module.artifact_id.clone(),
            checksum: cache_ctx.checksum().to_string(),
            checksum_matched: result.is_restorable(),
            lifecycle_matched: result.is_success(),
            plugins_matched,
            source,
            shared_to_remote: outcome.shared_to_remote,
            url,
        };
        self.ctx.report_lines.lock().expect("report lines poisoned").push(line);
    }

    /// Writes the aggregate run report and pushes it to the remote tier
    /// when sharing is enabled. Returns the report path, if one was
    /// written.
    pub fn finish_run(&self) -> Result<Option<PathBuf>> {
        let lines = {
            let mut guard = self.ctx.report_lines.lock().expect("report lines poisoned");
            std::mem::take(&mut *guard)
        };
        if lines.is_empty() {
            return Ok(None);
        }
        let report = CacheReport { projects: lines };
        let path = report.save(&self.ctx.session_root, &self.ctx.session_id)?;
        info!(report = %path.display(), "cache report written");

        if let Some(remote) = self.ctx.remote.as_deref().filter(|r| r.save_enabled()) {
            if let Ok(bytes) = fs::read(&path) {
                remote.put_report(&CacheReport::file_name(&self.ctx.session_id), &bytes);
            }
        }
        Ok(Some(path))
    }
}

fn run_steps<'a>(
    steps: impl Iterator<Item = &'a Step>,
    runner: &mut dyn StepRunner,
) -> Result<()> {
    for step in steps {
        runner.run(step)?;
    }
    Ok(())
}

/// Reads branch and revision from the version control directory marker.
/// Unreadable state degrades to empty strings, never to a failure.
pub fn read_scm_info(session_root: &Path) -> ScmInfo {
    let git_dir = session_root.join(".git");
    let Ok(head) = fs::read_to_string(git_dir.join("HEAD")) else {
        return ScmInfo::default();
    };
    let head = head.trim();
    if let Some(reference) = head.strip_prefix("ref: ") {
        let source_branch =
            reference.rsplit('/').next().unwrap_or(reference).to_string();
        let revision = fs::read_to_string(git_dir.join(reference))
            .map(|r| r.trim().to_string())
            .unwrap_or_default();
        ScmInfo { source_branch, revision }
    } else {
        // Detached head: the marker itself is the revision.
        ScmInfo { source_branch: String::new(), revision: head.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::tempdir;

    #[test]
    fn scm_info_from_git_marker() {
        let tmp = tempdir("scm").unwrap();
        let git = tmp.path().join(".git");
        fs::create_dir_all(git.join("refs/heads")).unwrap();
        fs::write(git.join("HEAD"), "ref: refs/heads/main\n").unwrap();
        fs::write(git.join("refs/heads/main"), "abc123\n").unwrap();

        let scm = read_scm_info(tmp.path());
        assert_eq!(scm.source_branch, "main");
        assert_eq!(scm.revision, "abc123");
    }

    #[test]
    fn detached_head_records_revision_only() {
        let tmp = tempdir("scm").unwrap();
        let git = tmp.path().join(".git");
        fs::create_dir_all(&git).unwrap();
        fs::write(git.join("HEAD"), "deadbeef\n").unwrap();

        let scm = read_scm_info(tmp.path());
        assert_eq!(scm.source_branch, "");
        assert_eq!(scm.revision, "deadbeef");
    }

    #[test]
    fn missing_scm_degrades_to_empty() {
        let tmp = tempdir("scm").unwrap();
        assert_eq!(read_scm_info(tmp.path()), ScmInfo::default());
    }

    #[test]
    fn disabled_config_produces_disabled_state() {
        let config = CacheConfig { enabled: false, ..Default::default() };
        let ctx = RunContext::new(config, "/tmp/session", "b1").unwrap();
        assert_eq!(ctx.state, CacheState::Disabled);
    }

    #[test]
    fn unknown_algorithm_fails_initialization() {
        let config = CacheConfig { hash_algorithm: "NOPE".to_string(), ..Default::default() };
        assert!(matches!(
            RunContext::new(config, "/tmp/session", "b1"),
            Err(CacheError::Config(_))
        ));
    }
}
