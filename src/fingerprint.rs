//! Canonical fingerprinting of a module's inputs.
//!
//! The fingerprint is an ordered list of digest items (effective
//! descriptor, source files, selected plugin parameter paths, resolved
//! dependencies) and the aggregate checksum hashed over their
//! concatenated item hashes. The same logical inputs yield byte-identical
//! fingerprints in any process: no wall clock, randomness or iteration
//! order leaks in.

use crate::{
    config::CacheConfig,
    error::{CacheError, Result},
    hasher::HashAlgorithm,
    model::{DigestItem, InputFingerprint, ModuleId},
    repository::local::LocalRepository,
    utils,
};
use quick_xml::events::Event;
use rayon::prelude::*;
use std::{
    collections::HashMap,
    fmt,
    path::PathBuf,
    sync::{Arc, Mutex},
};
use walkdir::WalkDir;

/// Digest item types.
pub const ITEM_DESCRIPTOR: &str = "pom";
pub const ITEM_FILE: &str = "file";
pub const ITEM_PLUGIN: &str = "plugin";
pub const ITEM_MODULE: &str = "module";
pub const ITEM_DEPENDENCY: &str = "dependency";
pub const ITEM_UNRESOLVED: &str = "unresolved";
pub const ITEM_VERSION: &str = "version";

/// Hash recorded for dependencies that could not be resolved at all.
const UNRESOLVED_MARKER: &str = "unresolved";

/// One resolved dependency edge of the module under fingerprinting.
#[derive(Clone, Debug)]
pub struct DependencyInput {
    pub group_id: String,
    pub artifact_id: String,
    pub version: String,
    pub classifier: Option<String>,
    pub kind: String,
    /// Set when the dependency is another module of the same session; its
    /// fingerprint is then computed recursively instead of looked up.
    pub module: Option<ModuleId>,
    /// The resolved artifact file, when resolution succeeded.
    pub file: Option<PathBuf>,
}

impl DependencyInput {
    /// Canonical dependency ordering key,
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
}

impl fmt::Display for DependencyInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.coords_key())
    }
}

/// Raw inputs of one module, assembled by the coordinator.
#[derive(Clone, Debug)]
pub struct ModuleInputs {
    pub module: ModuleId,
    pub base_dir: PathBuf,
    /// The effective module descriptor document.
    pub descriptor_xml: String,
    /// Plugin parameter paths selected by the configured scan specs,
    /// keyed `plugin:parameter`.
    pub plugin_scan_paths: Vec<(String, PathBuf)>,
    pub dependencies: Vec<DependencyInput>,
}

/// Supplies raw inputs for session modules so dependency fingerprints can
/// be computed on demand.
pub trait InputProvider {
    fn inputs(&self, module: &ModuleId) -> Option<ModuleInputs>;
}

/// A provider for runs without intra-session dependency edges.
pub struct NoSessionModules;

impl InputProvider for NoSessionModules {
    fn inputs(&self, _module: &ModuleId) -> Option<ModuleInputs> {
        None
    }
}

/// Computes and memoizes module fingerprints for one orchestrator run.
pub struct InputFingerprinter {
    config: Arc<CacheConfig>,
    algo: HashAlgorithm,
    local: Option<Arc<LocalRepository>>,
    /// Current version control branch, used for dependency best-match.
    branch: Option<String>,
    memo: Mutex<HashMap<String, Arc<InputFingerprint>>>,
}

impl InputFingerprinter {
    pub fn new(
        config: Arc<CacheConfig>,
        algo: HashAlgorithm,
        local: Option<Arc<LocalRepository>>,
        branch: Option<String>,
    ) -> Self {
        Self { config, algo, local, branch, memo: Mutex::new(HashMap::new()) }
    }

    /// Computes the module fingerprint, reusing the memoized value when
    /// another dependency edge already requested it this run.
    pub fn fingerprint(
        &self,
        inputs: &ModuleInputs,
        provider: &dyn InputProvider,
    ) -> Result<Arc<InputFingerprint>> {
        let mut chain = Vec::new();
        self.fingerprint_guarded(inputs, provider, &mut chain)
    }

    fn fingerprint_guarded(
        &self,
        inputs: &ModuleInputs,
        provider: &dyn InputProvider,
        chain: &mut Vec<String>,
    ) -> Result<Arc<InputFingerprint>> {
        let key = inputs.module.key();
        if let Some(hit) = self.memo.lock().expect("fingerprint memo poisoned").get(&key) {
            return Ok(hit.clone());
        }
        if chain.contains(&key) {
            chain.push(key);
            return Err(CacheError::Cycle { chain: std::mem::take(chain) });
        }
        chain.push(key.clone());

        let computed = Arc::new(self.compute(inputs, provider, chain)?);
        chain.pop();

        let mut memo = self.memo.lock().expect("fingerprint memo poisoned");
        // Another thread may have finished first; the first write wins and
        // stays immutable.
        Ok(memo.entry(key).or_insert(computed).clone())
    }

    fn compute(
        &self,
        inputs: &ModuleInputs,
        provider: &dyn InputProvider,
        chain: &mut Vec<String>,
    ) -> Result<InputFingerprint> {
        let mut items = Vec::new();

        let descriptor =
            canonical_descriptor(&inputs.descriptor_xml, &self.config.input.exclude_properties)?;
        items.push(DigestItem::new(
            ITEM_DESCRIPTOR,
            inputs.module.key(),
            self.algo.hash_bytes(descriptor.as_bytes()),
        ));

        items.extend(self.source_items(inputs)?);
        items.extend(self.plugin_items(inputs)?);
        items.extend(self.dependency_items(inputs, provider, chain)?);

        if self.config.project_version_checksum {
            items.push(DigestItem::new(
                ITEM_VERSION,
                inputs.module.key(),
                self.algo.hash_bytes(inputs.module.version.as_bytes()),
            ));
        }

        let mut aggregate = self.algo.hasher();
        for item in &items {
            aggregate.update(item.hash.as_bytes());
        }
        let checksum = aggregate.finalize();
        debug!(module = %inputs.module, %checksum, items = items.len(), "fingerprint computed");
        Ok(InputFingerprint { checksum, items })
    }

    /// Walks every configured source scan, pruning blacklisted subtrees,
    /// and hashes matching files in parallel.
    fn source_items(&self, inputs: &ModuleInputs) -> Result<Vec<DigestItem>> {
        let mut selected: Vec<(String, PathBuf)> = Vec::new();
        for scan in &self.config.input.source_scans {
            let root = inputs.base_dir.join(&scan.root);
            if !root.exists() {
                continue;
            }
            let glob = glob::Pattern::new(&scan.glob)
                .map_err(|err| CacheError::config(format!("invalid source glob: {err}")))?;
            let excludes = scan
                .excludes
                .iter()
                .map(|e| glob::Pattern::new(e))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| CacheError::config(format!("invalid source exclude: {err}")))?;

            let blacklist = &self.config.input.blacklist;
            let walker = WalkDir::new(&root).follow_links(false).into_iter().filter_entry(|e| {
                let pruned = e.file_type().is_dir()
                    && e.file_name().to_str().is_some_and(|name| {
                        blacklist.iter().any(|b| b == name)
                    });
                if pruned {
                    debug!(dir = %e.path().display(), "pruning blacklisted subtree");
                }
                !pruned
            });
            for entry in walker {
                let entry = entry.map_err(|err| CacheError::fingerprint(err))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = match entry.path().strip_prefix(&inputs.base_dir) {
                    Ok(rel) => utils::to_unix_string(rel),
                    Err(_) => utils::to_unix_string(entry.path()),
                };
                let scan_rel = entry
                    .path()
                    .strip_prefix(&root)
                    .map(utils::to_unix_string)
                    .unwrap_or_else(|_| rel.clone());
                if !glob.matches(&scan_rel) {
                    continue;
                }
                if excludes.iter().any(|p| p.matches(&scan_rel)) {
                    continue;
                }
                selected.push((rel, entry.path().to_path_buf()));
            }
        }

        // Canonical order is the relative path, not the walk order.
        selected.sort_by(|a, b| a.0.cmp(&b.0));
        selected.dedup_by(|a, b| a.0 == b.0);

        selected
            .par_iter()
            .map(|(rel, path)| {
                let hash = self
                    .algo
                    .hash_file(path)
                    .map_err(|err| CacheError::fingerprint(format!("{rel}: {err}")))?;
                Ok(DigestItem {
                    kind: ITEM_FILE.to_string(),
                    key: rel.clone(),
                    hash: hash.clone(),
                    file_checksum: Some(hash),
                })
            })
            .collect()
    }

    /// Fingerprints the configured plugin parameter paths by the same
    /// means as source files.
    fn plugin_items(&self, inputs: &ModuleInputs) -> Result<Vec<DigestItem>> {
        let mut paths = inputs.plugin_scan_paths.clone();
        paths.sort_by(|a, b| a.0.cmp(&b.0));

        let mut items = Vec::new();
        for (key, path) in paths {
            let resolved =
                if path.is_absolute() { path.clone() } else { inputs.base_dir.join(&path) };
            if resolved.is_dir() {
                let mut files: Vec<PathBuf> = WalkDir::new(&resolved)
                    .follow_links(false)
                    .into_iter()
                    .filter_map(std::result::Result::ok)
                    .filter(|e| e.file_type().is_file())
                    .map(|e| e.path().to_path_buf())
                    .collect();
                files.sort();
                let mut aggregate = self.algo.hasher();
                for file in &files {
                    aggregate.update(self.algo.hash_file(file)?.as_bytes());
                }
                items.push(DigestItem::new(ITEM_PLUGIN, key, aggregate.finalize()));
            } else if resolved.is_file() {
                items.push(DigestItem::new(ITEM_PLUGIN, key, self.algo.hash_file(&resolved)?));
            }
        }
        Ok(items)
    }

    fn dependency_items(
        &self,
        inputs: &ModuleInputs,
        provider: &dyn InputProvider,
        chain: &mut Vec<String>,
    ) -> Result<Vec<DigestItem>> {
        let mut dependencies: Vec<&DependencyInput> = inputs.dependencies.iter().collect();
        dependencies.sort_by_key(|d| d.coords_key());

        let mut items = Vec::new();
        for dependency in dependencies {
            let key = dependency.coords_key();
            if let Some(module) = &dependency.module {
                let Some(module_inputs) = provider.inputs(module) else {
                    return Err(CacheError::fingerprint(format!(
                        "no inputs available for session module {module}"
                    )));
                };
                let fingerprint = self.fingerprint_guarded(&module_inputs, provider, chain)?;
                items.push(DigestItem::new(ITEM_MODULE, key, fingerprint.checksum.clone()));
                continue;
            }
            if let Some(best) = self
                .local
                .as_deref()
                .and_then(|local| local.find_best_matching_build(dependency, self.branch.as_deref()))
            {
                items.push(DigestItem::new(ITEM_DEPENDENCY, key, best.checksum().to_string()));
                continue;
            }
            if let Some(file) = &dependency.file {
                let hash = self.algo.hash_file(file)?;
                items.push(DigestItem {
                    kind: ITEM_DEPENDENCY.to_string(),
                    key,
                    hash: hash.clone(),
                    file_checksum: Some(hash),
                });
                continue;
            }
            trace!(dependency = %dependency, "dependency unresolved, recording marker");
            items.push(DigestItem::new(ITEM_UNRESOLVED, key, UNRESOLVED_MARKER));
        }
        Ok(items)
    }
}

/// Serializes the effective descriptor canonically, dropping properties
/// whose names match the exclude list.
///
/// The output is a compact event stream: comments, processing
/// instructions and insignificant whitespace never reach the hash.
pub fn canonical_descriptor(xml: &str, exclude_properties: &[String]) -> Result<String> {
    let excludes = exclude_properties
        .iter()
        .map(|e| regex::Regex::new(&format!("^(?:{e})$")))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| CacheError::config(format!("invalid property exclude: {err}")))?;

    let mut reader = quick_xml::Reader::from_str(xml);
    let mut writer = quick_xml::Writer::new(Vec::new());
    let mut skip_depth = 0usize;

    let rewrite_err = |err: &dyn fmt::Display| {
        CacheError::fingerprint(format!("malformed effective descriptor: {err}"))
    };

    loop {
        match reader.read_event().map_err(|err| rewrite_err(&err))? {
            Event::Eof => break,
            Event::Start(start) => {
                let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
                if skip_depth > 0 || excludes.iter().any(|re| re.is_match(&name)) {
                    skip_depth += 1;
                    continue;
                }
                writer.write_event(Event::Start(start)).map_err(|err| rewrite_err(&err))?;
            }
            Event::End(end) => {
                if skip_depth > 0 {
                    skip_depth -= 1;
                    continue;
                }
                writer.write_event(Event::End(end)).map_err(|err| rewrite_err(&err))?;
            }
            Event::Empty(empty) => {
                let name = String::from_utf8_lossy(empty.local_name().as_ref()).into_owned();
                if skip_depth > 0 || excludes.iter().any(|re| re.is_match(&name)) {
                    continue;
                }
                writer.write_event(Event::Empty(empty)).map_err(|err| rewrite_err(&err))?;
            }
            Event::Text(text) => {
                // Indentation between elements is not content.
                let significant = text.as_ref().iter().any(|b| !b.is_ascii_whitespace());
                if skip_depth == 0 && significant {
                    writer.write_event(Event::Text(text)).map_err(|err| rewrite_err(&err))?;
                }
            }
            Event::CData(data) => {
                if skip_depth == 0 {
                    writer.write_event(Event::CData(data)).map_err(|err| rewrite_err(&err))?;
                }
            }
            // Declarations, comments, doctypes and processing instructions
            // are not content.
            Event::Decl(_) | Event::Comment(_) | Event::DocType(_) | Event::PI(_) => {}
        }
    }

    String::from_utf8(writer.into_inner())
        .map_err(|err| CacheError::fingerprint(format!("descriptor not UTF-8: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::tempdir;
    use std::fs;

    const DESCRIPTOR: &str = r#"<?xml version="1.0"?>
<project>
  <groupId>org.example</groupId>
  <artifactId>app</artifactId>
  <properties>
    <build.meta.timestamp>2024-01-01</build.meta.timestamp>
    <encoding>UTF-8</encoding>
  </properties>
</project>"#;

    fn config() -> Arc<CacheConfig> {
        let mut config = CacheConfig::default();
        config.input.exclude_properties = vec!["build\\.meta\\..*".to_string()];
        Arc::new(config)
    }

    fn inputs(module: &str, base_dir: PathBuf, dependencies: Vec<DependencyInput>) -> ModuleInputs {
        ModuleInputs {
            module: ModuleId::new("org.example", module, "1.0"),
            base_dir,
            descriptor_xml: DESCRIPTOR.to_string(),
            plugin_scan_paths: Vec::new(),
            dependencies,
        }
    }

    fn file_dependency(artifact_id: &str, file: Option<PathBuf>) -> DependencyInput {
        DependencyInput {
            group_id: "org.example".to_string(),
            artifact_id: artifact_id.to_string(),
            version: "2.0".to_string(),
            classifier: None,
            kind: "jar".to_string(),
            module: None,
            file,
        }
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let tmp = tempdir("fp").unwrap();
        fs::create_dir_all(tmp.path().join("src/a")).unwrap();
        fs::write(tmp.path().join("src/a/one.rs"), b"one").unwrap();
        fs::write(tmp.path().join("src/two.rs"), b"two").unwrap();

        let config = config();
        let first = {
            let fp = InputFingerprinter::new(config.clone(), HashAlgorithm::Sha256, None, None);
            fp.fingerprint(&inputs("app", tmp.path().to_path_buf(), vec![]), &NoSessionModules)
                .unwrap()
                .checksum
                .clone()
        };
        let second = {
            let fp = InputFingerprinter::new(config.clone(), HashAlgorithm::Sha256, None, None);
            fp.fingerprint(&inputs("app", tmp.path().to_path_buf(), vec![]), &NoSessionModules)
                .unwrap()
                .checksum
                .clone()
        };
        assert_eq!(first, second);
    }

    #[test]
    fn source_items_are_path_ordered() {
        let tmp = tempdir("fp").unwrap();
        fs::create_dir_all(tmp.path().join("src/z")).unwrap();
        fs::create_dir_all(tmp.path().join("src/a")).unwrap();
        fs::write(tmp.path().join("src/z/late.rs"), b"z").unwrap();
        fs::write(tmp.path().join("src/a/early.rs"), b"a").unwrap();
        fs::write(tmp.path().join("src/middle.rs"), b"m").unwrap();

        let config = config();
        let fp = InputFingerprinter::new(config.clone(), HashAlgorithm::Sha256, None, None);
        let result =
            fp.fingerprint(&inputs("app", tmp.path().to_path_buf(), vec![]), &NoSessionModules).unwrap();
        let files: Vec<_> =
            result.items.iter().filter(|i| i.kind == ITEM_FILE).map(|i| i.key.as_str()).collect();
        assert_eq!(files, ["src/a/early.rs", "src/middle.rs", "src/z/late.rs"]);
    }

    #[test]
    fn excluded_properties_do_not_contribute() {
        let changed = DESCRIPTOR.replace("2024-01-01", "2031-12-31");
        let excludes = vec!["build\\.meta\\..*".to_string()];
        assert_eq!(
            canonical_descriptor(DESCRIPTOR, &excludes).unwrap(),
            canonical_descriptor(&changed, &excludes).unwrap()
        );
        // Without the exclusion the change is visible.
        assert_ne!(
            canonical_descriptor(DESCRIPTOR, &[]).unwrap(),
            canonical_descriptor(&changed, &[]).unwrap()
        );
    }

    #[test]
    fn blacklisted_subtrees_are_pruned() {
        let tmp = tempdir("fp").unwrap();
        fs::create_dir_all(tmp.path().join("src/target")).unwrap();
        fs::write(tmp.path().join("src/keep.rs"), b"keep").unwrap();
        fs::write(tmp.path().join("src/target/stale.rs"), b"stale").unwrap();

        let config = config();
        let fp = InputFingerprinter::new(config.clone(), HashAlgorithm::Sha256, None, None);
        let result =
            fp.fingerprint(&inputs("app", tmp.path().to_path_buf(), vec![]), &NoSessionModules).unwrap();
        assert!(result.items.iter().any(|i| i.key == "src/keep.rs"));
        assert!(!result.items.iter().any(|i| i.key.contains("stale")));
    }

    #[test]
    fn dependency_falls_back_to_file_hash_then_marker() {
        let tmp = tempdir("fp").unwrap();
        fs::create_dir_all(tmp.path().join("src")).unwrap();
        let jar = tmp.path().join("dep.jar");
        fs::write(&jar, b"bytes").unwrap();

        let config = config();
        let fp = InputFingerprinter::new(config.clone(), HashAlgorithm::Sha256, None, None);
        let result = fp
            .fingerprint(
                &inputs(
                    "app",
                    tmp.path().to_path_buf(),
                    vec![
                        file_dependency("resolved", Some(jar.clone())),
                        file_dependency("missing", None),
                    ],
                ),
                &NoSessionModules,
            )
            .unwrap();

        let resolved = result.item(ITEM_DEPENDENCY, "org.example:resolved:2.0:jar").unwrap();
        assert_eq!(resolved.hash, HashAlgorithm::Sha256.hash_file(&jar).unwrap());
        let missing = result.item(ITEM_UNRESOLVED, "org.example:missing:2.0:jar").unwrap();
        assert_eq!(missing.hash, UNRESOLVED_MARKER);
    }

    struct TwoModuleCycle {
        base: PathBuf,
    }

    impl TwoModuleCycle {
        fn module_inputs(&self, name: &str, depends_on: &str) -> ModuleInputs {
            let mut inputs = inputs(name, self.base.clone(), vec![]);
            inputs.dependencies.push(DependencyInput {
                group_id: "org.example".to_string(),
                artifact_id: depends_on.to_string(),
                version: "1.0".to_string(),
                classifier: None,
                kind: "jar".to_string(),
                module: Some(ModuleId::new("org.example", depends_on, "1.0")),
                file: None,
            });
            inputs
        }
    }

    impl InputProvider for TwoModuleCycle {
        fn inputs(&self, module: &ModuleId) -> Option<ModuleInputs> {
            match module.artifact_id.as_str() {
                "left" => Some(self.module_inputs("left", "right")),
                "right" => Some(self.module_inputs("right", "left")),
                _ => None,
            }
        }
    }

    #[test]
    fn cycles_fail_fast_with_chain() {
        let tmp = tempdir("fp").unwrap();
        fs::create_dir_all(tmp.path().join("src")).unwrap();
        let provider = TwoModuleCycle { base: tmp.path().to_path_buf() };

        let config = config();
        let fp = InputFingerprinter::new(config.clone(), HashAlgorithm::Sha256, None, None);
        let err = fp
            .fingerprint(&provider.module_inputs("left", "right"), &provider)
            .unwrap_err();
        match err {
            CacheError::Cycle { chain } => {
                assert_eq!(chain.first().map(String::as_str), Some("org.example:left:1.0"));
                assert_eq!(chain.last().map(String::as_str), Some("org.example:left:1.0"));
            }
            other => panic!("expected cycle error, got {other}"),
        }
    }

    #[test]
    fn memoized_fingerprints_are_shared() {
        let tmp = tempdir("fp").unwrap();
        fs::create_dir_all(tmp.path().join("src")).unwrap();

        let config = config();
        let fp = InputFingerprinter::new(config.clone(), HashAlgorithm::Sha256, None, None);
        let module_inputs = inputs("app", tmp.path().to_path_buf(), vec![]);
        let first = fp.fingerprint(&module_inputs, &NoSessionModules).unwrap();
        let second = fp.fingerprint(&module_inputs, &NoSessionModules).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
