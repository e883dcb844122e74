//! Buckets
//!
//! A bucket is one (domain, ambiguity type, round count) combination with a
//! target record count and its own store file. [`machine`] drives a bucket to
//! its target; this module holds the descriptors and the messages sent for it.

pub mod machine;

pub use machine::{BucketContext, BucketOutcome, BucketState, BucketStatus, LoopSettings};

use crate::store::RecordStore;
use std::fmt;
use std::path::Path;

/// A plan line together with the short code derived from it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Full line as written in the plan, quoted verbatim in instructions
    pub line: String,
    /// Short code used for directory names
    pub code: String,
}

impl Descriptor {
    pub fn new(line: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            code: code.into(),
        }
    }
}

/// One unit of generation work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub domain: Descriptor,
    pub ambiguity: Descriptor,
    /// Round line as written in the plan
    pub round_line: String,
    pub round_count: u32,
    pub target: usize,
}

impl Bucket {
    /// This bucket's store under `output_dir`
    pub fn store(&self, output_dir: &Path) -> RecordStore {
        RecordStore::for_bucket(
            output_dir,
            &self.domain.code,
            &self.ambiguity.code,
            self.round_count,
        )
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}_round",
            self.domain.code, self.ambiguity.code, self.round_count
        )
    }
}

/// Builds the user messages sent for a bucket
#[derive(Debug, Clone)]
pub struct InstructionBuilder {
    summary_marker: String,
}

impl InstructionBuilder {
    pub fn new(summary_marker: impl Into<String>) -> Self {
        Self {
            summary_marker: summary_marker.into(),
        }
    }

    /// Self-contained request for `count` records. Valid in a fresh session.
    pub fn generation(&self, bucket: &Bucket, count: usize) -> String {
        format!(
            "请生成{count}条数据，要求：\n\
             1. 领域：{domain}\n\
             2. 模糊类型：{ambiguity}\n\
             3. 对话轮次：{rounds}\n\
             4. 数据格式：必须输出为有效的JSON数组格式，每条数据为sharegpt格式（包含system和conversations字段）\n\
             5. 每条数据必须是完整的对话，以{marker}结束\n\
             6. 助手在信息不足时必须追问，在信息完整后必须总结\n",
            count = count,
            domain = bucket.domain.line,
            ambiguity = bucket.ambiguity.line,
            rounds = bucket.round_line,
            marker = self.summary_marker,
        )
    }

    /// Short follow-up that relies on the session's earlier turns
    pub fn continuation(&self, have: usize, needed: usize) -> String {
        format!(
            "现在已经生成了{}条数据，帮我把剩下的{}条数据补齐",
            have, needed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket() -> Bucket {
        Bucket {
            domain: Descriptor::new("美容美发 (Beauty_Hairdressing)", "Beauty_Hairdressing"),
            ambiguity: Descriptor::new("condition_missing（条件缺失）", "condition_missing"),
            round_line: "3轮：三次追问".to_string(),
            round_count: 3,
            target: 50,
        }
    }

    #[test]
    fn test_display_and_store() {
        let b = bucket();
        assert_eq!(b.to_string(), "Beauty_Hairdressing/condition_missing/3_round");
        assert_eq!(
            b.store(Path::new("out")).path(),
            Path::new("out/Beauty_Hairdressing/condition_missing/3_round.json")
        );
    }

    #[test]
    fn test_generation_names_everything() {
        let text = InstructionBuilder::new("【完整请求总结】").generation(&bucket(), 12);
        assert!(text.starts_with("请生成12条数据"));
        assert!(text.contains("美容美发 (Beauty_Hairdressing)"));
        assert!(text.contains("condition_missing（条件缺失）"));
        assert!(text.contains("3轮：三次追问"));
        assert!(text.contains("以【完整请求总结】结束"));
    }

    #[test]
    fn test_continuation() {
        let text = InstructionBuilder::new("x").continuation(40, 10);
        assert!(text.contains("40"));
        assert!(text.contains("10"));
    }
}
