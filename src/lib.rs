//! # Auto Answer
//!
//! 自动完成网课平台课程作业的 Rust 应用程序
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有稀缺资源（Page），只暴露能力
//! - `PageDriver` - 页面能力抽象（定位、读写、点击、等待）
//! - `JsExecutor` - 唯一的 page owner，基于 chromiumoxide 实现 `PageDriver`
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，只处理单个题目
//! - `NavigationController` - 登录、进入课程和任务页（显式状态机）
//! - `QuestionExtractor` - 识别题型、提取题目
//! - `AnswerSynthesizer` / `LlmService` - 生成并严格解析答案
//! - `PiperAudioBridge` - 语音合成与转写
//! - `SubmissionEngine` - 写回答案并确认提交
//! - `AnswerCache` / `ReportWriter` - 答案缓存与运行报告
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一道题"的完整处理流程
//! - `QuestionCtx` - 上下文封装（位置 + 尝试序号）
//! - `QuestionFlow` - 流程编排（enter → extract → answer → submit，带重试）
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/engine` - 遍历课程、重新登录、取消
//! - `orchestrator/app` - 装配组件、持有浏览器、写报告
//!
//! ## 模块结构

pub mod browser;
pub mod config;
pub mod error;
pub mod infrastructure;

pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;

// 重新导出常用类型
pub use config::Config;
pub use error::{AppResult, StepError};
pub use infrastructure::{JsExecutor, PageDriver};
pub use models::{AttemptRecord, Credentials, Question, RunReport};
pub use orchestrator::{AnswerOrchestrationEngine, App};
pub use workflow::{QuestionCtx, QuestionFlow};
