//! Restoration of cached outputs into the project tree.
//!
//! Restore is reconcile-first: no file is touched until every non-forced
//! cached step verified against the record. Artifact blobs come from the
//! tier the record was loaded from; directory attachments are unpacked
//! only after a containment check against the module base. Once a
//! directory landed in the project tree, later failures escalate to
//! [`RestorationStatus::FailureNeedsClean`].

use crate::{
    archive,
    config::CacheConfig,
    error::{CacheError, Result},
    exec::{Step, StepIntrospector, StepRunner},
    lifecycle::{LifecycleSegmenter, Lifecycles},
    model::{
        ArtifactDescriptor, BuildRecord, BuildSource, CacheContext, RestorationStatus,
        GENERATED_SOURCES_KIND,
    },
    reconcile::{Mismatch, ReconciliationEngine},
    repository::{local::LocalRepository, remote::RemoteRepository},
    utils,
};
use once_cell::sync::OnceCell;
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use walkdir::WalkDir;

/// The engine's work directory inside a module's build output.
pub const MODULE_WORK_DIR: &str = "target/build-cache";
const STAGING_SUBDIR: &str = "staging";

type Thunk = Box<dyn FnOnce() -> Result<PathBuf> + Send>;

/// A restored artifact file handle.
///
/// With lazy restore the underlying blob is only downloaded and placed on
/// first access; handles that are never observed cause no traffic.
pub struct RestoredFile {
    cell: OnceCell<PathBuf>,
    thunk: Mutex<Option<Thunk>>,
}

impl RestoredFile {
    /// A handle over an already materialized file.
    pub fn ready(path: PathBuf) -> Self {
        let cell = OnceCell::new();
        cell.set(path).expect("fresh cell");
        Self { cell, thunk: Mutex::new(None) }
    }

    pub fn lazy(thunk: impl FnOnce() -> Result<PathBuf> + Send + 'static) -> Self {
        Self { cell: OnceCell::new(), thunk: Mutex::new(Some(Box::new(thunk))) }
    }

    /// The on-disk location, materializing the file on first access.
    pub fn path(&self) -> Result<&Path> {
        self.cell
            .get_or_try_init(|| {
                let thunk = self
                    .thunk
                    .lock()
                    .expect("restored file poisoned")
                    .take()
                    .ok_or_else(|| CacheError::msg("restored file failed to materialize"))?;
                thunk()
            })
            .map(PathBuf::as_path)
    }

    pub fn is_materialized(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl fmt::Debug for RestoredFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestoredFile").field("path", &self.cell.get()).finish()
    }
}

/// Outcome of a restoration attempt, with the reconciliation mismatches
/// that stopped it, if any.
#[derive(Debug)]
pub struct RestoreOutcome {
    pub status: RestorationStatus,
    pub mismatches: Vec<Mismatch>,
}

/// Materializes a cached build into the module.
pub struct Restorer<'a> {
    config: &'a CacheConfig,
    local: Arc<LocalRepository>,
    remote: Option<Arc<RemoteRepository>>,
    segmenter: LifecycleSegmenter<'a>,
}

impl<'a> Restorer<'a> {
    pub fn new(
        config: &'a CacheConfig,
        local: Arc<LocalRepository>,
        remote: Option<Arc<RemoteRepository>>,
        lifecycles: &'a dyn Lifecycles,
    ) -> Self {
        Self { config, local, remote, segmenter: LifecycleSegmenter::new(lifecycles) }
    }

    /// Restores the record and runs whatever still must run (forced steps
    /// and the post-cached suffix).
    ///
    /// Only security violations and unknown phases surface as errors;
    /// every other failure demotes to a [`RestorationStatus`] so the
    /// surrounding build can rebuild.
    pub fn restore(
        &self,
        ctx: &CacheContext,
        record: &BuildRecord,
        steps: &[Step],
        runner: &mut dyn StepRunner,
        introspector: &dyn StepIntrospector,
    ) -> Result<RestoreOutcome> {
        let cached = self.segmenter.cached_segment(steps, &record.highest_completed_phase)?;
        let engine = ReconciliationEngine::new(self.config, &ctx.base_dir);

        let mut forced: Vec<&Step> = Vec::new();
        for &step in &cached {
            if self.config.is_forced(step) {
                debug!(step = %step, "forced step, will re-run");
                forced.push(step);
                continue;
            }
            let mismatches = engine.verify_step(step, record, introspector);
            if !mismatches.is_empty() {
                // Nothing has been written yet.
                return Ok(RestoreOutcome { status: RestorationStatus::Failure, mismatches });
            }
        }
        for &step in &cached {
            if !forced.iter().any(|f| std::ptr::eq(*f, step)) {
                info!("skipping {step} (cached)");
            }
        }

        // Primary and regular attached artifacts: attach in memory so the
        // orchestrator sees them as built, forcing the handle immediately
        // unless lazy restore is on.
        for descriptor in record.artifact.iter().chain(record.attached_regular()) {
            let file = self.restored_file(ctx, record.source, descriptor);
            if !self.config.lazy_restore {
                if let Err(err) = file.path() {
                    warn!(artifact = %descriptor.file_name, %err, "artifact restore failed");
                    return Ok(RestoreOutcome {
                        status: RestorationStatus::Failure,
                        mismatches: Vec::new(),
                    });
                }
            }
            runner.attach_artifact(descriptor, file);
        }

        // Directory attachments write into the project tree; from the
        // first one on, failures require a clean before rebuilding.
        let mut project_written = false;
        for descriptor in record.attached_directories() {
            if descriptor.directory_kind() == Some(GENERATED_SOURCES_KIND)
                && !self.config.restore_generated_sources
            {
                debug!(artifact = %descriptor.file_name, "generated sources restore disabled");
                continue;
            }
            let dest = ctx.base_dir.join(utils::normalize_path(Path::new(&descriptor.file_path)));
            if !utils::is_within(&ctx.base_dir, &dest) {
                return Err(CacheError::security(dest));
            }
            let blob = match self.ensure_blob(ctx, record.source, descriptor) {
                Ok(blob) => blob,
                Err(err) => {
                    warn!(artifact = %descriptor.file_name, %err, "directory blob unavailable");
                    return Ok(RestoreOutcome {
                        status: fail_status(project_written),
                        mismatches: Vec::new(),
                    });
                }
            };
            if let Err(err) = fs::create_dir_all(&dest) {
                warn!(dest = %dest.display(), %err, "cannot create restore destination");
                return Ok(RestoreOutcome {
                    status: fail_status(project_written),
                    mismatches: Vec::new(),
                });
            }
            match archive::unpack(&blob, &dest, true, false) {
                Ok(()) => project_written = true,
                Err(err @ CacheError::Security { .. }) => return Err(err),
                Err(err) => {
                    warn!(artifact = %descriptor.file_name, %err, "unpack failed");
                    return Ok(RestoreOutcome {
                        status: fail_status(project_written),
                        mismatches: Vec::new(),
                    });
                }
            }
        }

        // Forced steps, then everything past the record's phase coverage.
        let post = self.segmenter.post_cached_segment(steps, &record.highest_completed_phase)?;
        for step in forced.into_iter().chain(post) {
            if let Err(err) = runner.run(step) {
                warn!(step = %step, %err, "step failed after restore");
                return Ok(RestoreOutcome {
                    status: fail_status(project_written),
                    mismatches: Vec::new(),
                });
            }
        }

        Ok(RestoreOutcome { status: RestorationStatus::Success, mismatches: Vec::new() })
    }

    /// Ensures the blob backing a descriptor is present in the local
    /// tier, fetching it from the remote tier if necessary.
    fn ensure_blob(
        &self,
        ctx: &CacheContext,
        source: BuildSource,
        descriptor: &ArtifactDescriptor,
    ) -> Result<PathBuf> {
        ensure_blob(&self.local, self.remote.as_deref(), ctx, source, descriptor)
    }

    fn restored_file(
        &self,
        ctx: &CacheContext,
        source: BuildSource,
        descriptor: &ArtifactDescriptor,
    ) -> RestoredFile {
        let local = self.local.clone();
        let remote = self.remote.clone();
        let ctx = ctx.clone();
        let descriptor = descriptor.clone();
        let restore_on_disk = self.config.restore_on_disk_artifacts;
        RestoredFile::lazy(move || {
            let blob = ensure_blob(&local, remote.as_deref(), &ctx, source, &descriptor)?;
            if !restore_on_disk {
                return Ok(blob);
            }
            let rel = utils::normalize_path(Path::new(&descriptor.file_path));
            let dest = ctx.base_dir.join(&rel);
            if !utils::is_within(&ctx.base_dir, &dest) {
                return Err(CacheError::security(dest));
            }
            utils::copy_file_atomic(&blob, &dest)?;
            trace!(artifact = %descriptor.file_name, dest = %dest.display(), "artifact restored");
            Ok(dest)
        })
    }
}

fn fail_status(project_written: bool) -> RestorationStatus {
    if project_written {
        RestorationStatus::FailureNeedsClean
    } else {
        RestorationStatus::Failure
    }
}

fn ensure_blob(
    local: &LocalRepository,
    remote: Option<&RemoteRepository>,
    ctx: &CacheContext,
    source: BuildSource,
    descriptor: &ArtifactDescriptor,
) -> Result<PathBuf> {
    let server_id = remote.map(RemoteRepository::server_id).unwrap_or("remote");
    let path = local.artifact_file(ctx, source, server_id, &descriptor.file_name);
    if path.is_file() {
        return Ok(path);
    }
    if source == BuildSource::Remote {
        if let Some(remote) = remote {
            if remote.fetch_artifact(ctx, descriptor, &path) {
                return Ok(path);
            }
        }
    }
    Err(CacheError::msg(format!("blob {} is not available", descriptor.file_name)))
}

/// Moves pre-existing files under the module's output directories aside
/// before a rebuild, so stale outputs can never be mistaken for fresh
/// ones at save time.
///
/// After the save, staged files whose outputs were rebuilt are discarded
/// and the rest are moved back. The restore pass also runs on drop, so a
/// module aborted between staging and save still gets its tree back.
#[derive(Debug)]
pub struct StagingArea {
    base_dir: PathBuf,
    staging_dir: PathBuf,
    staged: Vec<PathBuf>,
    finished: bool,
}

impl StagingArea {
    /// Stages every file currently under the configured output dirs,
    /// preserving the module-relative path structure.
    pub fn stage(base_dir: &Path, output_dirs: &[PathBuf]) -> Result<Self> {
        let staging_dir = base_dir.join(MODULE_WORK_DIR).join(STAGING_SUBDIR);
        fs::create_dir_all(&staging_dir).map_err(|err| CacheError::io(err, &staging_dir))?;
        let work_dir = base_dir.join(MODULE_WORK_DIR);

        let mut staged = Vec::new();
        for dir in output_dirs {
            let root = base_dir.join(dir);
            if !root.is_dir() {
                continue;
            }
            let walker = WalkDir::new(&root)
                .follow_links(false)
                .into_iter()
                .filter_entry(|e| !e.path().starts_with(&work_dir));
            for entry in walker {
                let entry = entry.map_err(|err| {
                    CacheError::fingerprint(format!("staging walk failed: {err}"))
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(base_dir)
                    .unwrap_or(entry.path())
                    .to_path_buf();
                let staged_path = staging_dir.join(&rel);
                utils::create_parent_dir_all(&staged_path)?;
                fs::rename(entry.path(), &staged_path)
                    .map_err(|err| CacheError::io(err, entry.path()))?;
                staged.push(rel);
            }
        }
        debug!(files = staged.len(), "staged pre-existing outputs");
        Ok(Self { base_dir: base_dir.to_path_buf(), staging_dir, staged, finished: false })
    }

    /// Discards staged files that were rebuilt, restores the rest and
    /// removes the staging directory.
    pub fn finish(mut self) -> Result<()> {
        self.finish_inner()
    }

    fn finish_inner(&mut self) -> Result<()> {
        for rel in std::mem::take(&mut self.staged) {
            let original = self.base_dir.join(&rel);
            let staged = self.staging_dir.join(&rel);
            if original.exists() {
                // Rebuilt during the run; the staged copy is stale.
                let _ = fs::remove_file(&staged);
            } else {
                utils::create_parent_dir_all(&original)?;
                fs::rename(&staged, &original).map_err(|err| CacheError::io(err, &staged))?;
            }
        }
        let _ = fs::remove_dir_all(&self.staging_dir);
        self.finished = true;
        Ok(())
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(err) = self.finish_inner() {
                warn!(%err, "staging restore during teardown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::tempdir;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn lazy_handle_materializes_once() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let file = RestoredFile::lazy(|| {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Ok(PathBuf::from("/tmp/blob"))
        });
        assert!(!file.is_materialized());
        assert_eq!(file.path().unwrap(), Path::new("/tmp/blob"));
        assert_eq!(file.path().unwrap(), Path::new("/tmp/blob"));
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unobserved_lazy_handle_stays_cold() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        {
            let _file = RestoredFile::lazy(|| {
                CALLS.fetch_add(1, Ordering::SeqCst);
                Ok(PathBuf::from("/tmp/blob"))
            });
        }
        assert_eq!(CALLS.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn staging_discards_rebuilt_and_restores_untouched() {
        let tmp = tempdir("staging").unwrap();
        let base = tmp.path();
        fs::create_dir_all(base.join("target/classes")).unwrap();
        fs::write(base.join("target/app.jar"), b"stale-jar").unwrap();
        fs::write(base.join("target/classes/Keep.class"), b"keep").unwrap();

        let staging =
            StagingArea::stage(base, &[PathBuf::from("target")]).unwrap();
        assert!(!base.join("target/app.jar").exists());
        assert!(!base.join("target/classes/Keep.class").exists());

        // The rebuild reproduces the jar but not the class file.
        fs::write(base.join("target/app.jar"), b"fresh-jar").unwrap();

        staging.finish().unwrap();
        assert_eq!(fs::read(base.join("target/app.jar")).unwrap(), b"fresh-jar");
        assert_eq!(fs::read(base.join("target/classes/Keep.class")).unwrap(), b"keep");
        assert!(!base.join(MODULE_WORK_DIR).join(STAGING_SUBDIR).exists());
    }

    #[test]
    fn dropped_staging_restores_during_teardown() {
        let tmp = tempdir("staging").unwrap();
        let base = tmp.path();
        fs::create_dir_all(base.join("target")).unwrap();
        fs::write(base.join("target/app.jar"), b"original").unwrap();

        {
            let _staging = StagingArea::stage(base, &[PathBuf::from("target")]).unwrap();
            assert!(!base.join("target/app.jar").exists());
            // Aborted before save: no finish call.
        }
        assert_eq!(fs::read(base.join("target/app.jar")).unwrap(), b"original");
    }
}
