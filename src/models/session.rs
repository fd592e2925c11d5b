use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::credentials::Credentials;
use super::question::QuestionId;

/// 登录状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated,
    Expired,
}

/// 课程中的一个任务页
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub unit_index: usize,
    pub unit_name: String,
    pub task_index: usize,
    pub task_name: String,
}

impl Location {
    /// 同一位置始终得到同一个题目标识
    pub fn question_id(&self) -> QuestionId {
        QuestionId::new(format!(
            "u{}-t{}:{}/{}",
            self.unit_index, self.task_index, self.unit_name, self.task_name
        ))
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "单元 {} 任务 {}", self.unit_index + 1, self.task_index + 1)
    }
}

/// 导航状态机
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavState {
    Unauthenticated,
    Authenticated,
    AtUnit { unit_index: usize },
    AtQuestion(Location),
    Submitted(Location),
    Complete,
}

impl NavState {
    pub fn name(&self) -> &'static str {
        match self {
            NavState::Unauthenticated => "Unauthenticated",
            NavState::Authenticated => "Authenticated",
            NavState::AtUnit { .. } => "AtUnit",
            NavState::AtQuestion(_) => "AtQuestion",
            NavState::Submitted(_) => "Submitted",
            NavState::Complete => "Complete",
        }
    }
}

/// 一次运行的会话
///
/// 只有导航控制器能修改状态，其余组件只读。
#[derive(Debug, Clone)]
pub struct Session {
    credentials: Arc<Credentials>,
    auth: AuthState,
    state: NavState,
    last_location: Option<Location>,
}

impl Session {
    pub fn new(credentials: Arc<Credentials>) -> Self {
        Self {
            credentials,
            auth: AuthState::Unauthenticated,
            state: NavState::Unauthenticated,
            last_location: None,
        }
    }

    pub fn credentials(&self) -> &Arc<Credentials> {
        &self.credentials
    }

    pub fn auth(&self) -> AuthState {
        self.auth
    }

    pub fn state(&self) -> &NavState {
        &self.state
    }

    /// 最后一次进入的题目位置，重新登录后从这里继续
    pub fn last_location(&self) -> Option<&Location> {
        self.last_location.as_ref()
    }

    pub(crate) fn set_auth(&mut self, auth: AuthState) {
        self.auth = auth;
    }

    pub(crate) fn set_state(&mut self, state: NavState) {
        if let NavState::AtQuestion(loc) = &state {
            self.last_location = Some(loc.clone());
        }
        self.state = state;
    }
}
