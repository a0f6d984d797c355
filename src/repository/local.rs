//! Content-addressed local repository.
//!
//! Layout, rooted at the configured cache location:
//!
//! ```text
//! <root>/v1/<groupId>/<artifactId>/<checksum>/
//!    local/              buildinfo.xml + artifact blobs
//!    <remoteServerId>/   buildinfo.xml, lookupinfo.xml, artifacts
//! ```

use crate::{
    config::CacheConfig,
    error::Result,
    fingerprint::DependencyInput,
    model::{BuildRecord, BuildSource, CacheContext, ModuleId},
    repository::remote::RemoteRepository,
    utils,
};
use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// On-disk layout version, bumped on incompatible layout changes.
const LAYOUT_VERSION: &str = "v1";
/// File name of the build record manifest.
pub const BUILDINFO_XML: &str = "buildinfo.xml";
/// Zero-byte marker recording failed remote lookups.
const LOOKUPINFO_XML: &str = "lookupinfo.xml";
/// Subdirectory holding records produced by local builds.
const LOCAL_DIR: &str = "local";

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// The local cache tier.
#[derive(Debug)]
pub struct LocalRepository {
    root: PathBuf,
    max_builds: usize,
}

impl LocalRepository {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            root: config.local_root().join(LAYOUT_VERSION),
            max_builds: config.max_local_builds_cached.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn module_dir(&self, module: &ModuleId) -> PathBuf {
        self.root.join(&module.group_id).join(&module.artifact_id)
    }

    fn checksum_dir(&self, ctx: &CacheContext) -> PathBuf {
        self.module_dir(&ctx.module).join(ctx.checksum())
    }

    /// Directory of the record produced by local builds.
    pub fn local_dir(&self, ctx: &CacheContext) -> PathBuf {
        self.checksum_dir(ctx).join(LOCAL_DIR)
    }

    /// Directory holding the downloaded copy of a remote record.
    pub fn remote_dir(&self, ctx: &CacheContext, server_id: &str) -> PathBuf {
        self.checksum_dir(ctx).join(server_id)
    }

    /// Location of an artifact blob next to its record.
    pub fn artifact_file(&self, ctx: &CacheContext, source: BuildSource, server_id: &str, file_name: &str) -> PathBuf {
        match source {
            BuildSource::Remote => self.remote_dir(ctx, server_id).join(file_name),
            _ => self.local_dir(ctx).join(file_name),
        }
    }

    /// Reads the locally produced record for the fingerprint, if any.
    ///
    /// A record that fails to parse is deleted. A record referencing a
    /// blob that is not present next to it is corrupt and removed whole.
    pub fn find_local(&self, ctx: &CacheContext) -> Option<BuildRecord> {
        self.load_record(&self.local_dir(ctx), BuildSource::Local, true)
    }

    /// Two-tier lookup: a final local record wins outright; otherwise a
    /// previously downloaded or freshly fetched remote record may
    /// override; otherwise the local record (if any) stands.
    pub fn find_build(
        &self,
        ctx: &CacheContext,
        remote: Option<&RemoteRepository>,
    ) -> Option<BuildRecord> {
        let local = self.find_local(ctx);
        if local.as_ref().is_some_and(|record| record.final_record) {
            debug!(module = %ctx.module, "final local record, remote lookup suppressed");
            return local;
        }

        if let Some(remote) = remote {
            let remote_dir = self.remote_dir(ctx, remote.server_id());
            if let Some(record) = self.load_record(&remote_dir, BuildSource::Remote, false) {
                return Some(record);
            }
            if self.should_call_remote(ctx, remote.server_id()) {
                match remote.find_build(ctx) {
                    Some(record) => {
                        if let Err(err) =
                            utils::write_xml_file(&record, &remote_dir.join(BUILDINFO_XML))
                        {
                            warn!(module = %ctx.module, %err, "failed to persist downloaded record");
                        }
                        return Some(record);
                    }
                    None => self.record_remote_miss(ctx, remote.server_id()),
                }
            } else {
                debug!(module = %ctx.module, "remote lookup throttled");
            }
        }
        local
    }

    fn load_record(&self, dir: &Path, source: BuildSource, verify_blobs: bool) -> Option<BuildRecord> {
        let path = dir.join(BUILDINFO_XML);
        if !path.is_file() {
            return None;
        }
        let mut record = match utils::read_xml_file::<BuildRecord>(&path) {
            Ok(record) => record,
            Err(err) => {
                warn!(path = %path.display(), %err, "corrupt build record, deleting");
                let _ = fs::remove_file(&path);
                return None;
            }
        };
        if verify_blobs {
            if let Some(missing) =
                record.all_artifacts().find(|a| !dir.join(&a.file_name).is_file())
            {
                warn!(
                    path = %path.display(),
                    blob = %missing.file_name,
                    "record references missing blob, removing record"
                );
                let _ = fs::remove_dir_all(dir);
                return None;
            }
        }
        record.source = source;
        Some(record)
    }

    /// Picks the cached build of a dependency that matches the current
    /// run best: exact `(version, branch)`, then same version, then same
    /// branch, then the newest record overall.
    pub fn find_best_matching_build(
        &self,
        dependency: &DependencyInput,
        branch: Option<&str>,
    ) -> Option<BuildRecord> {
        let module_dir = self
            .root
            .join(&dependency.group_id)
            .join(&dependency.artifact_id);
        let mut candidates: Vec<(BuildRecord, SystemTime)> = Vec::new();
        for checksum_entry in read_dirs(&module_dir) {
            for record_entry in read_dirs(&checksum_entry) {
                let path = record_entry.join(BUILDINFO_XML);
                if !path.is_file() {
                    continue;
                }
                if let Ok(record) = utils::read_xml_file::<BuildRecord>(&path) {
                    let mtime =
                        fs::metadata(&path).and_then(|m| m.modified()).unwrap_or(UNIX_EPOCH);
                    candidates.push((record, mtime));
                }
            }
        }
        if candidates.is_empty() {
            return None;
        }

        let branch = branch.unwrap_or("");
        let version_of = |record: &BuildRecord| {
            record.artifact.as_ref().map(|a| a.version.clone()).unwrap_or_default()
        };
        let pick = |matches: &dyn Fn(&BuildRecord) -> bool| {
            candidates
                .iter()
                .filter(|(record, _)| matches(record))
                .max_by_key(|(_, mtime)| *mtime)
                .map(|(record, _)| record.clone())
        };

        pick(&|r| version_of(r) == dependency.version && r.scm.source_branch == branch)
            .or_else(|| pick(&|r| version_of(r) == dependency.version))
            .or_else(|| pick(&|r| r.scm.source_branch == branch))
            .or_else(|| pick(&|_| true))
    }

    /// Evicts any older record under the fingerprint before a save.
    pub fn before_save(&self, ctx: &CacheContext) {
        self.clear_cache(ctx);
    }

    /// Deletes the current record tree and trims the module's checksum
    /// directories down to the configured retention.
    pub fn clear_cache(&self, ctx: &CacheContext) {
        let local_dir = self.local_dir(ctx);
        if local_dir.exists() {
            if let Err(err) = fs::remove_dir_all(&local_dir) {
                warn!(dir = %local_dir.display(), %err, "failed to evict record");
            }
        }
        self.trim_module(&ctx.module, ctx.checksum());
    }

    /// Best-effort LRU trim of sibling checksum directories.
    fn trim_module(&self, module: &ModuleId, current_checksum: &str) {
        let module_dir = self.module_dir(module);
        let mut siblings: Vec<(PathBuf, SystemTime)> = read_dirs(&module_dir)
            .into_iter()
            .filter(|dir| {
                dir.file_name().and_then(|n| n.to_str()).is_some_and(|n| n != current_checksum)
            })
            .map(|dir| {
                let mtime = fs::metadata(&dir).and_then(|m| m.modified()).unwrap_or(UNIX_EPOCH);
                (dir, mtime)
            })
            .collect();
        // The slot for the current checksum is reserved out of the budget.
        let keep = self.max_builds.saturating_sub(1);
        if siblings.len() <= keep {
            return;
        }
        siblings.sort_by_key(|(_, mtime)| *mtime);
        let excess = siblings.len() - keep;
        for (dir, _) in siblings.into_iter().take(excess) {
            debug!(dir = %dir.display(), "trimming cached build");
            if let Err(err) = fs::remove_dir_all(&dir) {
                warn!(dir = %dir.display(), %err, "failed to trim cached build");
            }
        }
    }

    /// Publishes the build record manifest.
    pub fn save_build(&self, ctx: &CacheContext, record: &BuildRecord) -> Result<()> {
        utils::write_xml_file(record, &self.local_dir(ctx).join(BUILDINFO_XML))
    }

    /// Copies an artifact blob next to the record.
    pub fn save_artifact(&self, ctx: &CacheContext, file_name: &str, src: &Path) -> Result<PathBuf> {
        let dst = self.local_dir(ctx).join(file_name);
        utils::copy_file_atomic(src, &dst)?;
        Ok(dst)
    }

    /// Persists a report document next to the record.
    pub fn save_report(&self, ctx: &CacheContext, file_name: &str, content: &[u8]) -> Result<()> {
        utils::write_file_atomic(content, &self.local_dir(ctx).join(file_name))
    }

    /// Whether the negative-lookup throttle permits a remote call now.
    pub fn should_call_remote(&self, ctx: &CacheContext, server_id: &str) -> bool {
        let marker = self.remote_dir(ctx, server_id).join(LOOKUPINFO_XML);
        match utils::file_times(&marker) {
            Err(_) => true,
            Ok((created, modified)) => should_call_remote_at(created, modified, SystemTime::now()),
        }
    }

    /// Records a failed remote lookup by touching the marker; the
    /// creation time of an existing marker is preserved.
    pub fn record_remote_miss(&self, ctx: &CacheContext, server_id: &str) {
        let marker = self.remote_dir(ctx, server_id).join(LOOKUPINFO_XML);
        let result = utils::create_parent_dir_all(&marker).and_then(|()| utils::touch(&marker));
        if let Err(err) = result {
            warn!(marker = %marker.display(), %err, "failed to record negative lookup");
        }
    }
}

/// Negative-lookup gate. The bands widen with the marker's age, giving
/// geometric backoff without timers:
///
/// | marker age        | last touch | remote call |
/// |-------------------|------------|-------------|
/// | `< 1h`            | `< 1m`     | no          |
/// | `< 1d`            | `< 1h`     | no          |
/// | `>= 1d`           | `< 1d`     | no          |
/// | otherwise         |            | yes         |
fn should_call_remote_at(created: SystemTime, modified: SystemTime, now: SystemTime) -> bool {
    let marker_age = now.duration_since(created).unwrap_or_default();
    let touch_age = now.duration_since(modified).unwrap_or_default();
    if marker_age < HOUR && touch_age < MINUTE {
        false
    } else if marker_age < DAY && touch_age < HOUR {
        false
    } else {
        !(marker_age >= DAY && touch_age < DAY)
    }
}

fn read_dirs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else { return Vec::new() };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.path())
        .collect();
    dirs.sort();
    dirs
}
