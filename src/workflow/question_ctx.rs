//! 题目处理上下文
//!
//! 封装"我正在处理哪个单元的哪个任务、第几次尝试"这一信息

use std::fmt::Display;

use crate::models::Location;

/// 题目处理上下文
#[derive(Debug, Clone)]
pub struct QuestionCtx {
    pub location: Location,

    /// 当前尝试序号（从 1 开始）
    pub attempt: u32,
}

impl QuestionCtx {
    pub fn new(location: Location, attempt: u32) -> Self {
        Self { location, attempt }
    }
}

impl Display for QuestionCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{} 第{}次]", self.location, self.attempt)
    }
}
