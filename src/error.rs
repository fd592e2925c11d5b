//! 错误类型
//!
//! 按层划分：
//! - `DriverError` - 浏览器驱动层
//! - `AuthError` / `NavigationError` - 导航与会话
//! - `ExtractionError` / `ModelError` / `ParseError` - 取题与作答
//! - `SynthesisError` / `RecognitionError` - 语音桥接
//! - `SubmissionError` - 写回页面
//!
//! 单题流程内所有错误统一收敛为 `StepError`，由它区分登录失效和可重试的失败。

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::models::QuestionKind;

/// 浏览器驱动错误
#[derive(Debug, Error)]
pub enum DriverError {
    /// 元素不存在
    #[error("元素不存在: {0}")]
    ElementNotFound(String),
    /// 等待条件超时
    #[error("等待 {condition} 超时 ({timeout:?})")]
    Timeout { condition: String, timeout: Duration },
    /// 导航失败
    #[error("导航到 {url} 失败: {message}")]
    Navigation { url: String, message: String },
    /// 执行脚本失败
    #[error("执行脚本失败: {0}")]
    Script(String),
}

impl From<chromiumoxide::error::CdpError> for DriverError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        DriverError::Script(err.to_string())
    }
}

impl From<serde_json::Error> for DriverError {
    fn from(err: serde_json::Error) -> Self {
        DriverError::Script(format!("脚本返回值解析失败: {}", err))
    }
}

/// 登录 / 会话错误
#[derive(Debug, Error)]
pub enum AuthError {
    /// 登录页没有出现预期的输入框
    #[error("登录页面未就绪: {0}")]
    LoginPageUnavailable(String),
    /// 提交凭据后没有进入课程列表
    #[error("登录被拒绝: {0}")]
    Rejected(String),
    /// 会话过期
    #[error("会话已过期")]
    SessionExpired,
    #[error("登录过程中浏览器操作失败: {0}")]
    Driver(#[from] DriverError),
}

/// 导航错误
#[derive(Debug, Error)]
pub enum NavigationError {
    /// 等待页面标记超时（可由控制器重试一次）
    #[error("等待页面标记 {marker} 超时 ({budget:?})")]
    Timeout { marker: String, budget: Duration },
    /// 重试后仍等不到页面标记
    #[error("页面标记 {marker} 在重试后仍未出现")]
    Unreachable { marker: String },
    /// 题目页打开了，但没有就绪标记
    #[error("题目页面未就绪")]
    NotReady,
    /// 状态机收到了当前状态不接受的事件
    #[error("非法的导航状态转换: {from} -> {event}")]
    IllegalTransition { from: String, event: String },
    /// 导航图中已没有可到达的题目，也没有完成标记
    #[error("导航图中没有可到达的题目: {0}")]
    GraphExhausted(String),
    /// 会话过期（需要重新登录）
    #[error("会话已过期")]
    SessionExpired,
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// 取题错误
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// 页面上没有任何可识别的题型标记
    #[error("无法识别的题目结构: {0}")]
    Unrecognized(String),
    /// 标记存在但结构自相矛盾
    #[error("题目结构不明确: {0}")]
    Ambiguous(String),
    /// 媒体文件读取失败
    #[error("媒体文件读取失败 ({url}): {message}")]
    Media { url: String, message: String },
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// 语言模型调用错误
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("LLM API 调用失败 (模型: {model}): {message}")]
    Transport { model: String, message: String },
    #[error("LLM 返回内容为空 (模型: {model})")]
    EmptyContent { model: String },
    #[error("LLM 调用超时 ({0:?})")]
    Timeout(Duration),
}

/// 模型回复无法映射到题目的答案形状
#[derive(Debug, Error)]
#[error("无法解析 {kind} 的模型回复 '{response}': {reason}")]
pub struct ParseError {
    pub kind: QuestionKind,
    pub response: String,
    pub reason: String,
}

/// 语音合成错误
#[derive(Debug, Error)]
pub enum SynthesisError {
    /// 文本净化后为空
    #[error("待合成文本净化后为空: '{0}'")]
    EmptyText(String),
    #[error("语音引擎文件不存在: {0}")]
    EngineMissing(PathBuf),
    #[error("语音引擎执行失败: {0}")]
    EngineFailed(String),
    #[error("语音合成超时 ({0:?})")]
    Timeout(Duration),
    #[error("语音合成 IO 失败: {0}")]
    Io(#[from] std::io::Error),
}

/// 语音识别错误
#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error("语音识别请求失败: {0}")]
    Request(String),
    #[error("语音识别结果为空")]
    Empty,
    #[error("语音识别超时 ({0:?})")]
    Timeout(Duration),
}

impl From<reqwest::Error> for RecognitionError {
    fn from(err: reqwest::Error) -> Self {
        RecognitionError::Request(err.to_string())
    }
}

/// 答案与当前渲染的题目形状不一致
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("答案形状不匹配: 期望 {expected}, 实际 {found}")]
pub struct ShapeMismatch {
    pub expected: String,
    pub found: String,
}

/// 写回页面错误
#[derive(Debug, Error)]
pub enum SubmissionError {
    /// 页面在取题后发生了变化（例如定时重绘）
    #[error(transparent)]
    ShapeMismatch(#[from] ShapeMismatch),
    /// 读取当前题目形状失败
    #[error("读取当前题目形状失败: {0}")]
    Probe(#[from] ExtractionError),
    /// 写入答案时浏览器操作失败
    #[error("写入答案失败: {0}")]
    Write(#[from] DriverError),
    /// 没有等到提交完成标记
    ///
    /// `clicked` 为 true 表示提交按钮已经点过，平台可能已经收到答案。
    #[error("提交后未出现完成标记: {reason}")]
    NotConfirmed { reason: String, clicked: bool },
}

impl SubmissionError {
    /// 提交按钮是否已经点过
    pub fn submit_dispatched(&self) -> bool {
        matches!(self, SubmissionError::NotConfirmed { clicked: true, .. })
    }
}

/// 单题流程中的任意一步失败
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Navigation(#[from] NavigationError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),
    #[error(transparent)]
    Recognition(#[from] RecognitionError),
    #[error(transparent)]
    Submission(#[from] SubmissionError),
}

impl StepError {
    /// 是否需要挂起并重新登录
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            StepError::Auth(_) | StepError::Navigation(NavigationError::SessionExpired)
        )
    }

    /// 提交按钮已经点过但没有确认结果
    pub fn submit_dispatched(&self) -> bool {
        matches!(self, StepError::Submission(e) if e.submit_dispatched())
    }

    /// 写入 AttemptRecord 的失败原因
    pub fn reason(&self) -> String {
        let category = match self {
            StepError::Auth(_) => "auth",
            StepError::Navigation(_) => "navigation",
            StepError::Extraction(_) => "extraction",
            StepError::Model(_) => "model",
            StepError::Parse(_) => "parse",
            StepError::Synthesis(_) => "synthesis",
            StepError::Recognition(_) => "recognition",
            StepError::Submission(_) => "submission",
        };
        format!("{}: {}", category, self)
    }
}

/// 合成答案时的失败：传输失败或回复不符合语法
#[derive(Debug, Error)]
pub enum SynthesizeError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl From<SynthesizeError> for StepError {
    fn from(err: SynthesizeError) -> Self {
        match err {
            SynthesizeError::Model(e) => StepError::Model(e),
            SynthesizeError::Parse(e) => StepError::Parse(e),
        }
    }
}

/// 应用程序结果类型
pub type AppResult<T> = anyhow::Result<T>;
