use chrono::{DateTime, Local};
use serde::Serialize;

use super::question::{QuestionId, QuestionKind};

/// 单题结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason")]
pub enum AttemptOutcome {
    Submitted,
    Skipped,
    Failed(String),
}

/// 单题处理记录，只追加不修改
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub question_id: QuestionId,
    pub kind: Option<QuestionKind>,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
    pub retry_count: u32,
    /// 平台给出的分数（口语题）
    pub score: Option<u32>,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Local>,
}

impl AttemptRecord {
    fn new(question_id: QuestionId, outcome: AttemptOutcome) -> Self {
        Self {
            question_id,
            kind: None,
            outcome,
            retry_count: 0,
            score: None,
            detail: None,
            recorded_at: Local::now(),
        }
    }

    pub fn submitted(question_id: QuestionId, kind: QuestionKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::new(question_id, AttemptOutcome::Submitted)
        }
    }

    pub fn skipped(question_id: QuestionId, detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
            ..Self::new(question_id, AttemptOutcome::Skipped)
        }
    }

    pub fn failed(question_id: QuestionId, reason: impl Into<String>) -> Self {
        Self::new(question_id, AttemptOutcome::Failed(reason.into()))
    }

    pub fn with_kind(mut self, kind: Option<QuestionKind>) -> Self {
        if kind.is_some() {
            self.kind = kind;
        }
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_score(mut self, score: Option<u32>) -> Self {
        self.score = score;
        self
    }

    pub fn is_submitted(&self) -> bool {
        self.outcome == AttemptOutcome::Submitted
    }
}

/// 运行结束原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RunTermination {
    /// 所有可到达的题目都处理完了
    Completed,
    Cancelled,
    /// 重新登录后会话再次失效
    AuthExhausted(String),
    /// 导航图不可恢复
    NavigationLost(String),
}

/// 运行报告：按处理顺序排列的记录
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    records: Vec<AttemptRecord>,
    termination: RunTermination,
    reauth_count: u32,
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}

impl RunReport {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            termination: RunTermination::Completed,
            reauth_count: 0,
        }
    }

    pub fn push(&mut self, record: AttemptRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[AttemptRecord] {
        &self.records
    }

    pub fn termination(&self) -> &RunTermination {
        &self.termination
    }

    pub fn reauth_count(&self) -> u32 {
        self.reauth_count
    }

    pub(crate) fn note_reauth(&mut self) {
        self.reauth_count += 1;
    }

    pub fn finish(&mut self, termination: RunTermination) {
        self.termination = termination;
    }

    /// 某题是否已经提交过
    pub fn was_submitted(&self, id: &QuestionId) -> bool {
        self.records
            .iter()
            .any(|r| &r.question_id == id && r.is_submitted())
    }

    /// (提交, 跳过, 失败)
    pub fn counts(&self) -> (usize, usize, usize) {
        self.records
            .iter()
            .fold((0, 0, 0), |(s, k, f), r| match r.outcome {
                AttemptOutcome::Submitted => (s + 1, k, f),
                AttemptOutcome::Skipped => (s, k + 1, f),
                AttemptOutcome::Failed(_) => (s, k, f + 1),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_and_serialization() {
        let mut report = RunReport::new();
        report.push(AttemptRecord::submitted(
            QuestionId::new("a"),
            QuestionKind::FillBlank,
        ));
        report.push(AttemptRecord::failed(QuestionId::new("b"), "model: 超时").with_retry_count(2));
        report.push(AttemptRecord::skipped(QuestionId::new("c"), "无作答区域"));
        assert_eq!(report.counts(), (1, 1, 1));
        assert!(report.was_submitted(&QuestionId::new("a")));
        assert!(!report.was_submitted(&QuestionId::new("b")));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["records"][1]["outcome"], "Failed");
        assert_eq!(json["records"][1]["reason"], "model: 超时");
        assert_eq!(json["termination"], "Completed");
    }
}
