//! 答题编排引擎
//!
//! 循环：advance → QuestionFlow → 追加记录 → advance ...
//!
//! - 取消信号只在每轮开始时检查，不会打断正在进行的提交
//! - 登录失效：重新登录一次后从原位置继续；没有任何进展又失效则结束运行
//! - 导航失败按退避重试，超过次数或课程结构不可恢复时结束运行
//! - 无论怎样结束，已经产生的记录都保留在报告中

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::NavigationError;
use crate::models::{AttemptRecord, Location, RunReport, RunTermination, Session};
use crate::services::{Navigator, NextLocation};
use crate::workflow::{QuestionAttempt, QuestionFlow};

/// 答题编排引擎
pub struct AnswerOrchestrationEngine {
    navigator: Arc<dyn Navigator>,
    flow: QuestionFlow,
}

/// 重新登录的额度：成功处理一道题后恢复
struct ReauthBudget {
    spent: bool,
}

impl AnswerOrchestrationEngine {
    pub fn new(navigator: Arc<dyn Navigator>, flow: QuestionFlow) -> Self {
        Self { navigator, flow }
    }

    /// 处理课程中所有可到达的题目
    ///
    /// # 参数
    /// - `session`: 已登录的会话
    /// - `cancel`: 运行级取消信号
    ///
    /// # 返回
    /// 按处理顺序排列的完整记录和结束原因
    pub async fn run(&self, session: &mut Session, cancel: &CancellationToken) -> RunReport {
        let mut report = RunReport::new();
        let mut budget = ReauthBudget { spent: false };
        let mut nav_failures = 0u32;
        let mut resume: Option<(Location, QuestionAttempt)> = None;

        loop {
            if cancel.is_cancelled() {
                info!("🛑 收到取消信号，停止处理");
                report.finish(RunTermination::Cancelled);
                break;
            }

            let (location, mut attempt) = match resume.take() {
                Some(pending) => pending,
                None => match self.navigator.advance(session).await {
                    Ok(NextLocation::Complete) => {
                        report.finish(RunTermination::Completed);
                        break;
                    }
                    Ok(NextLocation::Question(location)) => {
                        nav_failures = 0;
                        let id = location.question_id();
                        (location, QuestionAttempt::new(id))
                    }
                    Err(NavigationError::SessionExpired) => {
                        if !self.reauthenticate(session, &mut report, &mut budget).await {
                            break;
                        }
                        continue;
                    }
                    Err(e @ NavigationError::GraphExhausted(_)) => {
                        error!("❌ 课程结构不可恢复: {}", e);
                        report.finish(RunTermination::NavigationLost(e.to_string()));
                        break;
                    }
                    Err(e) => {
                        nav_failures += 1;
                        let policy = self.flow.policy();
                        if nav_failures >= policy.max_attempts {
                            error!("❌ 导航连续失败 {} 次: {}", nav_failures, e);
                            report.finish(RunTermination::NavigationLost(e.to_string()));
                            break;
                        }
                        let delay = policy.delay_for(nav_failures);
                        warn!("⚠️ 查找下一题失败 ({}), {:?} 后重试", e, delay);
                        self.navigator.recover(session).await;
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                },
            };

            if report.was_submitted(&attempt.question_id) {
                warn!("[{}] ⚠️ 已提交过，跳过", location);
                report.push(AttemptRecord::skipped(attempt.question_id.clone(), "已提交过"));
                continue;
            }

            info!("[{}] ▶️ {}", location, location.task_name);
            match self.flow.run(session, &location, &mut attempt).await {
                Ok(record) => {
                    report.push(record);
                    budget.spent = false;
                }
                Err(e) => {
                    warn!("[{}] 🔒 {}", location, e);
                    if !self.reauthenticate(session, &mut report, &mut budget).await {
                        break;
                    }
                    resume = Some((location, attempt));
                }
            }
        }

        let (submitted, skipped, failed) = report.counts();
        info!(
            "🏁 运行结束: {:?} | 提交 {} | 跳过 {} | 失败 {}",
            report.termination(),
            submitted,
            skipped,
            failed
        );
        report
    }

    /// 重新登录；返回 false 表示运行应当结束
    async fn reauthenticate(
        &self,
        session: &mut Session,
        report: &mut RunReport,
        budget: &mut ReauthBudget,
    ) -> bool {
        if budget.spent {
            error!("❌ 重新登录后会话再次失效，结束运行");
            report.finish(RunTermination::AuthExhausted(
                "重新登录后会话再次失效".to_string(),
            ));
            return false;
        }
        budget.spent = true;
        report.note_reauth();
        match self.navigator.reauthenticate(session).await {
            Ok(()) => {
                match session.last_location() {
                    Some(loc) => info!("✓ 重新登录成功，从 {} 继续", loc),
                    None => info!("✓ 重新登录成功"),
                }
                true
            }
            Err(e) => {
                error!("❌ 重新登录失败: {}", e);
                report.finish(RunTermination::AuthExhausted(e.to_string()));
                false
            }
        }
    }
}
