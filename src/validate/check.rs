//! Dataset check pass
//!
//! Walks `<root>/<domain>/<type>/<n>_round.json`, validates every stored
//! record against the round count in its file name and optionally rewrites
//! files that lost records. Each file produces a [`FileReport`]; the caller
//! folds reports into a [`CheckSummary`].

use super::{Validator, MAX_REASONS};
use crate::store::{round_from_file_name, RecordStore, StoreError, StoreResult};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Error details kept in a summary
pub const MAX_ERROR_DETAILS: usize = 20;

/// Outcome of checking one store file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReport {
    pub path: PathBuf,
    pub domain: String,
    pub ambiguity: String,
    pub round_count: u32,
    pub before: usize,
    pub after: usize,
    /// Up to five problems, in file order
    pub errors: Vec<String>,
    pub rewritten: bool,
}

impl FileReport {
    pub fn removed(&self) -> usize {
        self.before - self.after
    }
}

/// Per-group counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub files: usize,
    pub data_before: usize,
    pub data_after: usize,
    pub removed: usize,
}

impl Tally {
    fn add(&mut self, report: &FileReport) {
        self.files += 1;
        self.data_before += report.before;
        self.data_after += report.after;
        self.removed += report.removed();
    }

    /// Removed records as a percentage of records checked
    pub fn removal_rate(&self) -> f64 {
        if self.data_before == 0 {
            0.0
        } else {
            self.removed as f64 / self.data_before as f64 * 100.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorDetail {
    pub file: String,
    pub removed: usize,
    pub errors: Vec<String>,
}

/// Totals across a check pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CheckSummary {
    pub total: Tally,
    pub files_with_removals: usize,
    pub by_domain: BTreeMap<String, Tally>,
    pub by_round: BTreeMap<u32, Tally>,
    pub by_ambiguity_type: BTreeMap<String, Tally>,
    pub error_details: Vec<ErrorDetail>,
}

impl CheckSummary {
    /// Fold one file's report in
    pub fn absorb(mut self, report: &FileReport) -> Self {
        self.total.add(report);
        self.by_domain
            .entry(report.domain.clone())
            .or_default()
            .add(report);
        self.by_round.entry(report.round_count).or_default().add(report);
        self.by_ambiguity_type
            .entry(report.ambiguity.clone())
            .or_default()
            .add(report);

        if report.removed() > 0 {
            self.files_with_removals += 1;
        }
        if !report.errors.is_empty() && self.error_details.len() < MAX_ERROR_DETAILS {
            self.error_details.push(ErrorDetail {
                file: report.path.display().to_string(),
                removed: report.removed(),
                errors: report.errors.clone(),
            });
        }
        self
    }

    /// Write as pretty JSON
    pub fn write_json(&self, path: &Path) -> StoreResult<()> {
        let text = serde_json::to_string_pretty(self).map_err(|source| StoreError::Serialize {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, text).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Check one store file. With `rewrite`, a file that lost records is
/// rewritten with only the valid ones.
pub fn check_file(
    path: &Path,
    domain: &str,
    ambiguity: &str,
    validator: &Validator,
    rewrite: bool,
) -> FileReport {
    let mut report = FileReport {
        path: path.to_path_buf(),
        domain: domain.to_string(),
        ambiguity: ambiguity.to_string(),
        round_count: 0,
        before: 0,
        after: 0,
        errors: Vec::new(),
        rewritten: false,
    };

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let Some(round_count) = round_from_file_name(&name) else {
        report.errors.push(format!("cannot read round count from file name: {}", name));
        return report;
    };
    report.round_count = round_count;

    let items = match fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|text| serde_json::from_str::<Value>(&text).map_err(|e| e.to_string()))
    {
        Ok(Value::Array(items)) => items,
        Ok(_) => {
            report.errors.push("file content is not a JSON array".to_string());
            return report;
        }
        Err(e) => {
            report.errors.push(format!("failed to read file: {}", e));
            return report;
        }
    };

    report.before = items.len();
    let mut valid = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        match validator.validate_value(&item, round_count) {
            Ok(()) => valid.push(item),
            Err(reason) => {
                if report.errors.len() < MAX_REASONS {
                    report.errors.push(format!("record #{}: {}", index + 1, reason));
                }
            }
        }
    }
    report.after = valid.len();

    if rewrite && report.after != report.before {
        match RecordStore::new(path).write_all(&valid) {
            Ok(()) => report.rewritten = true,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to rewrite store");
                if report.errors.len() < MAX_REASONS {
                    report.errors.push(format!("failed to save file: {}", e));
                }
            }
        }
    }
    report
}

fn sorted_entries(dir: &Path) -> StoreResult<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    paths.sort();
    Ok(paths)
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Check every `*_round.json` under `root`, two directory levels down.
pub fn check_tree(root: &Path, validator: &Validator, rewrite: bool) -> StoreResult<CheckSummary> {
    let mut summary = CheckSummary::default();

    for domain_dir in sorted_entries(root)?.into_iter().filter(|p| p.is_dir()) {
        let domain = dir_name(&domain_dir);
        tracing::info!(domain = %domain, "checking domain");

        for type_dir in sorted_entries(&domain_dir)?.into_iter().filter(|p| p.is_dir()) {
            let ambiguity = dir_name(&type_dir);

            for file in sorted_entries(&type_dir)? {
                if !file.is_file() || !dir_name(&file).ends_with("_round.json") {
                    continue;
                }
                let report = check_file(&file, &domain, &ambiguity, validator, rewrite);
                if report.removed() > 0 {
                    tracing::warn!(
                        file = %file.display(),
                        removed = report.removed(),
                        kept = report.after,
                        "removed invalid records"
                    );
                } else {
                    tracing::debug!(file = %file.display(), kept = report.after, "file passed");
                }
                summary = summary.absorb(&report);
            }
        }
    }
    Ok(summary)
}
