//! Generation plan reader
//!
//! The plan is a markdown-ish text file with three lists under `##` headers:
//! domains, ambiguity types and round counts. Parsing stops at the
//! generation-instruction section. Headers are recognised in Chinese or
//! English:
//!
//! ```text
//! ## 领域列表            (or "## Domains")
//! 美容美发 (Beauty_Hairdressing)
//! ## 模糊类型列表        (or "## Ambiguity types")
//! condition_missing（条件缺失）
//! ## 对话轮次列表        (or "## Rounds")
//! 1轮：直接给出完整信息
//! ## 生成指令            (or "## Instructions"), ignored from here on
//! ```

use crate::bucket::Descriptor;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Plan errors
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("failed to read plan {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("plan has no {0} entries")]
    MissingSection(&'static str),

    #[error("round line does not start with a positive number: {0}")]
    RoundCount(String),

    #[error("{section} code `{code}` appears more than once")]
    DuplicateCode { section: &'static str, code: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Domains,
    Types,
    Rounds,
}

/// A round line and the count it starts with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundDescriptor {
    pub line: String,
    pub count: u32,
}

/// Parsed plan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationPlan {
    pub domains: Vec<Descriptor>,
    pub ambiguity_types: Vec<Descriptor>,
    pub rounds: Vec<RoundDescriptor>,
}

fn classify(header: &str) -> Option<Option<Section>> {
    let lower = header.to_lowercase();
    if header.contains("生成指令") || lower.contains("instruction") {
        None
    } else if header.contains("领域") || lower.contains("domain") {
        Some(Some(Section::Domains))
    } else if header.contains("模糊类型") || lower.contains("ambiguity") || lower.contains("type") {
        Some(Some(Section::Types))
    } else if header.contains("轮次") || lower.contains("round") {
        Some(Some(Section::Rounds))
    } else {
        Some(None)
    }
}

impl GenerationPlan {
    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let text = fs::read_to_string(path).map_err(|source| PlanError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, PlanError> {
        let mut plan = Self::default();
        let mut section = None;

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(header) = line.strip_prefix("##") {
                match classify(header) {
                    Some(next) => section = next,
                    None => break,
                }
                continue;
            }
            if line.starts_with('#') {
                continue;
            }
            match section {
                Some(Section::Domains) => plan
                    .domains
                    .push(Descriptor::new(line, domain_code(line))),
                Some(Section::Types) => plan
                    .ambiguity_types
                    .push(Descriptor::new(line, type_code(line))),
                Some(Section::Rounds) => {
                    let count =
                        round_count(line).ok_or_else(|| PlanError::RoundCount(line.to_string()))?;
                    plan.rounds.push(RoundDescriptor {
                        line: line.to_string(),
                        count,
                    });
                }
                None => {}
            }
        }

        if plan.domains.is_empty() {
            return Err(PlanError::MissingSection("domain"));
        }
        if plan.ambiguity_types.is_empty() {
            return Err(PlanError::MissingSection("ambiguity type"));
        }
        if plan.rounds.is_empty() {
            return Err(PlanError::MissingSection("round"));
        }

        // each code becomes a store path segment, so codes must be unique
        unique("domain", plan.domains.iter().map(|d| d.code.clone()))?;
        unique("ambiguity type", plan.ambiguity_types.iter().map(|t| t.code.clone()))?;
        unique("round", plan.rounds.iter().map(|r| r.count.to_string()))?;
        Ok(plan)
    }

    /// Number of buckets in the cross-product
    pub fn bucket_count(&self) -> usize {
        self.domains.len() * self.ambiguity_types.len() * self.rounds.len()
    }
}

fn unique(section: &'static str, codes: impl Iterator<Item = String>) -> Result<(), PlanError> {
    let mut seen = HashSet::new();
    for code in codes {
        if !seen.insert(code.clone()) {
            return Err(PlanError::DuplicateCode { section, code });
        }
    }
    Ok(())
}

/// Text inside the last `(...)`; the whole line when there is none
pub fn domain_code(line: &str) -> String {
    if let (Some(start), Some(end)) = (line.rfind('('), line.rfind(')')) {
        if start < end {
            let code = line[start + 1..end].trim();
            if !code.is_empty() {
                return code.to_string();
            }
        }
    }
    line.trim().to_string()
}

/// Text before the first full-width or ASCII `(`
pub fn type_code(line: &str) -> String {
    let cut = line.find('（').or_else(|| line.find('('));
    let code = match cut {
        Some(i) => line[..i].trim(),
        None => line.trim(),
    };
    if code.is_empty() {
        line.trim().to_string()
    } else {
        code.to_string()
    }
}

/// Leading decimal digits of a round line
pub fn round_count(line: &str) -> Option<u32> {
    let digits: String = line.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok().filter(|n| *n > 0)
}
