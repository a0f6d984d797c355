//! Aggregate cache report and baseline diff documents.

use crate::{error::Result, model::InputFingerprint, reconcile::Mismatch, utils};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory under the multimodule session root receiving run reports.
pub const REPORT_DIR: &str = "target/incremental";

/// One row per module of the run (`cache-report.<buildId>.xml`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "cacheReport")]
pub struct CacheReport {
    #[serde(rename = "project", default)]
    pub projects: Vec<ProjectReportLine>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "project")]
pub struct ProjectReportLine {
    #[serde(rename = "@groupId")]
    pub group_id: String,
    #[serde(rename = "@artifactId")]
    pub artifact_id: String,
    #[serde(rename = "@checksum")]
    pub checksum: String,
    #[serde(rename = "@checksumMatched")]
    pub checksum_matched: bool,
    #[serde(rename = "@lifecycleMatched")]
    pub lifecycle_matched: bool,
    #[serde(rename = "@pluginsMatched")]
    pub plugins_matched: bool,
    /// Where the matched record came from (`LOCAL`, `REMOTE`, `BUILD`).
    #[serde(rename = "@source")]
    pub source: String,
    #[serde(rename = "@sharedToRemote")]
    pub shared_to_remote: bool,
    #[serde(rename = "@url", skip_serializing_if = "Option::is_none", default)]
    pub url: Option<String>,
}

impl CacheReport {
    pub fn file_name(build_id: &str) -> String {
        format!("cache-report.{build_id}.xml")
    }

    /// Writes the report under the session's report directory and returns
    /// its path.
    pub fn save(&self, session_root: &Path, build_id: &str) -> Result<PathBuf> {
        let path = session_root.join(REPORT_DIR).join(Self::file_name(build_id));
        utils::write_xml_file(self, &path)?;
        Ok(path)
    }
}

/// Differences between a fresh fingerprint and a baseline
/// (`diff-<checksum>.xml`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "diff")]
pub struct DiffReport {
    #[serde(rename = "mismatch", default)]
    pub mismatches: Vec<Mismatch>,
}

impl DiffReport {
    pub fn file_name(checksum: &str) -> String {
        format!("diff-{checksum}.xml")
    }

    pub fn is_empty(&self) -> bool {
        self.mismatches.is_empty()
    }

    /// Compares two fingerprints item by item, in both directions.
    pub fn between(current: &InputFingerprint, baseline: &InputFingerprint) -> Self {
        let mut mismatches = Vec::new();
        for item in &current.items {
            match baseline.item(&item.kind, &item.key) {
                None => mismatches.push(Mismatch {
                    item: item.key.clone(),
                    current: item.hash.clone(),
                    baseline: "<absent>".to_string(),
                    reason: "input not present in baseline".to_string(),
                    resolution: "inspect new input".to_string(),
                    context: item.kind.clone(),
                }),
                Some(other) if other.hash != item.hash => mismatches.push(Mismatch {
                    item: item.key.clone(),
                    current: item.hash.clone(),
                    baseline: other.hash.clone(),
                    reason: "input content differs from baseline".to_string(),
                    resolution: "inspect changed input".to_string(),
                    context: item.kind.clone(),
                }),
                Some(_) => {}
            }
        }
        for item in &baseline.items {
            if current.item(&item.kind, &item.key).is_none() {
                mismatches.push(Mismatch {
                    item: item.key.clone(),
                    current: "<absent>".to_string(),
                    baseline: item.hash.clone(),
                    reason: "baseline input disappeared".to_string(),
                    resolution: "inspect removed input".to_string(),
                    context: item.kind.clone(),
                });
            }
        }
        Self { mismatches }
    }
}
