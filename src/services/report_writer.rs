//! 运行报告写入服务 - 业务能力层
//!
//! 只负责"写运行报告"能力，不关心流程

use std::fs::OpenOptions;
use std::io::Write;

use anyhow::{Context, Result};
use tracing::debug;

use crate::models::{AttemptOutcome, RunReport};

/// 运行报告写入服务
///
/// 职责：
/// - 把完整的记录序列写成 JSON
/// - 把跳过和失败的题目追加到日志文件，便于人工补做
pub struct ReportWriter {
    report_path: String,
    log_path: String,
}

impl ReportWriter {
    pub fn new(report_path: impl Into<String>, log_path: impl Into<String>) -> Self {
        Self {
            report_path: report_path.into(),
            log_path: log_path.into(),
        }
    }

    /// 写入运行报告
    ///
    /// # 参数
    /// - `report`: 本次运行的报告
    pub fn write(&self, report: &RunReport) -> Result<()> {
        let json = serde_json::to_string_pretty(report)?;
        std::fs::write(&self.report_path, json)
            .with_context(|| format!("写入运行报告失败: {}", self.report_path))?;
        debug!("运行报告已写入: {}", self.report_path);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .with_context(|| format!("打开日志文件失败: {}", self.log_path))?;

        for record in report.records() {
            let line = match &record.outcome {
                AttemptOutcome::Submitted => continue,
                AttemptOutcome::Skipped => format!(
                    "跳过 | {} | {}\n",
                    record.question_id,
                    record.detail.as_deref().unwrap_or("-")
                ),
                AttemptOutcome::Failed(reason) => format!(
                    "失败 | {} | 重试 {} 次 | {}\n",
                    record.question_id, record.retry_count, reason
                ),
            };
            file.write_all(line.as_bytes())?;
        }

        let (submitted, skipped, failed) = report.counts();
        let summary = format!(
            "结束: {:?} | 提交 {} | 跳过 {} | 失败 {} | 重新登录 {} 次\n",
            report.termination(),
            submitted,
            skipped,
            failed,
            report.reauth_count()
        );
        file.write_all(summary.as_bytes())?;
        Ok(())
    }
}
