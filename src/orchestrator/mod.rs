//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责整次运行的调度，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `app` - 应用
//! - 管理应用生命周期（初始化、运行）
//! - 持有浏览器资源，装配各个服务
//! - 写运行报告，输出全局统计信息
//!
//! ### `engine` - 答题编排引擎
//! - 按课程顺序逐题调用 QuestionFlow
//! - 处理登录失效（重新登录一次）和导航失败
//! - 观察取消信号
//!
//! ## 层次关系
//!
//! ```text
//! app (装配 + 报告)
//!     ↓
//! engine (遍历课程中的题目)
//!     ↓
//! workflow::QuestionFlow (处理单个题目)
//!     ↓
//! services (能力层：导航 / 取题 / LLM / 语音 / 提交 / 缓存)
//!     ↓
//! infrastructure (基础设施：PageDriver)
//! ```

pub mod app;
pub mod engine;

pub use app::App;
pub use engine::AnswerOrchestrationEngine;
