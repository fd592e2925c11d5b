//! 重试与退避
//!
//! 每道题的重试状态是 `QuestionAttempt` 上的显式字段，跨重新登录保留。

use std::time::Duration;

use crate::config::Config;
use crate::models::{QuestionId, QuestionKind};

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 每道题最多尝试次数（含第一次）
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.backoff_base_ms),
            max_delay: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// 第 `failures` 次失败后的等待时间：base * 2^(failures-1)，不超过上限
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// 一道题的尝试记录
#[derive(Debug, Clone)]
pub struct QuestionAttempt {
    pub question_id: QuestionId,
    /// 已开始的尝试次数
    pub attempts: u32,
    /// 识别出的题型（取题成功后才有）
    pub kind: Option<QuestionKind>,
    /// 之前某次尝试已经点过提交按钮，之后不再写入答案
    pub submit_dispatched: bool,
}

impl QuestionAttempt {
    pub fn new(question_id: QuestionId) -> Self {
        Self {
            question_id,
            attempts: 0,
            kind: None,
            submit_dispatched: false,
        }
    }

    /// 开始新的一次尝试，返回尝试序号（从 1 开始）
    pub fn begin(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// 本次尝试失败后，还能重试时返回等待时间
    pub fn fail(&self, policy: &RetryPolicy) -> Option<Duration> {
        (self.attempts < policy.max_attempts).then(|| policy.delay_for(self.attempts))
    }

    pub fn retry_count(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}
