//! 导航服务 - 业务能力层
//!
//! 登录、进入课程、打开单元、进入任务页。
//!
//! 导航状态是显式的枚举（`NavState`），只能通过 [`transition`] 按页面标记事件变化：
//!
//! ```text
//! Unauthenticated → Authenticated → AtUnit → AtQuestion → Submitted → (AtQuestion | AtUnit) → Complete
//! ```
//!
//! 每个页面标记都有等待预算，超时后由控制器重试一次，仍失败则升级为 `NavigationError::Unreachable`。

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{Config, Selectors};
use crate::error::{AuthError, DriverError, NavigationError};
use crate::infrastructure::{click_if_present, exists, locate_by_text, wait_for, PageDriver, WaitCondition};
use crate::models::{AuthState, Credentials, Location, NavState, Session};

/// 触发导航状态变化的页面事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavEvent {
    /// 出现了登录后的标记
    LoginConfirmed,
    UnitOpened(usize),
    QuestionOpened(Location),
    AnswerSubmitted,
    /// 所有单元都没有待完成任务
    CourseExhausted,
}

impl NavEvent {
    fn name(&self) -> &'static str {
        match self {
            NavEvent::LoginConfirmed => "LoginConfirmed",
            NavEvent::UnitOpened(_) => "UnitOpened",
            NavEvent::QuestionOpened(_) => "QuestionOpened",
            NavEvent::AnswerSubmitted => "AnswerSubmitted",
            NavEvent::CourseExhausted => "CourseExhausted",
        }
    }
}

/// 导航状态转换函数
///
/// 登录确认在任何状态下都合法（会话过期后重新登录）；
/// 未登录和已完成状态下不接受其他事件。
pub fn transition(state: &NavState, event: &NavEvent) -> Result<NavState, NavigationError> {
    use NavState::*;
    let next = match (state, event) {
        (_, NavEvent::LoginConfirmed) => Some(Authenticated),
        (Unauthenticated | Complete, _) => None,
        (_, NavEvent::UnitOpened(unit_index)) => Some(AtUnit {
            unit_index: *unit_index,
        }),
        (_, NavEvent::QuestionOpened(loc)) => Some(AtQuestion(loc.clone())),
        (AtQuestion(loc), NavEvent::AnswerSubmitted) => Some(Submitted(loc.clone())),
        (_, NavEvent::AnswerSubmitted) => None,
        (_, NavEvent::CourseExhausted) => Some(Complete),
    };
    next.ok_or_else(|| NavigationError::IllegalTransition {
        from: state.name().to_string(),
        event: event.name().to_string(),
    })
}

/// `advance` 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextLocation {
    Question(Location),
    Complete,
}

/// 导航能力
///
/// 会话状态只由实现者修改，其余组件只读。
#[async_trait]
pub trait Navigator: Send + Sync {
    /// 登录并创建会话
    async fn authenticate(&self, credentials: Arc<Credentials>) -> Result<Session, AuthError>;

    /// 会话过期后重新登录
    async fn reauthenticate(&self, session: &mut Session) -> Result<(), AuthError>;

    /// 找到下一道待完成的题目（不进入）
    async fn advance(&self, session: &mut Session) -> Result<NextLocation, NavigationError>;

    /// 进入题目页面
    async fn enter(&self, session: &mut Session, location: &Location) -> Result<(), NavigationError>;

    /// 当前题目页面是否可以取题
    async fn current_question_ready(&self, session: &Session) -> bool;

    /// 提交完成
    async fn mark_submitted(&self, session: &mut Session) -> Result<(), NavigationError>;

    /// 失败退出时把浏览器带回可恢复的位置，不返回错误
    async fn recover(&self, session: &mut Session);
}

#[derive(Debug, Clone)]
struct UnitInfo {
    index: usize,
    name: String,
}

/// 课程遍历进度
#[derive(Debug, Default)]
struct Cursor {
    course_url: Option<String>,
    units: Option<Vec<UnitInfo>>,
    next_unit: usize,
    pending: VecDeque<Location>,
    handed_out: HashSet<Location>,
}

/// 基于页面选择器的导航控制器
pub struct NavigationController {
    driver: Arc<dyn PageDriver>,
    selectors: Selectors,
    login_url: String,
    course_index: usize,
    budget: Duration,
    poll: Duration,
    cursor: Mutex<Cursor>,
}

impl NavigationController {
    pub fn new(driver: Arc<dyn PageDriver>, config: &Config) -> Self {
        Self {
            driver,
            selectors: config.selectors.clone(),
            login_url: config.login_url.clone(),
            course_index: config.course_index,
            budget: config.page_timeout(),
            poll: config.poll_interval(),
            cursor: Mutex::new(Cursor::default()),
        }
    }

    /// 调整等待预算
    pub fn with_budget(mut self, budget: Duration, poll: Duration) -> Self {
        self.budget = budget;
        self.poll = poll;
        self
    }

    fn driver(&self) -> &dyn PageDriver {
        self.driver.as_ref()
    }

    /// 等待页面标记，超时返回 `NavigationError::Timeout`
    async fn wait_marker(&self, selector: &str) -> Result<(), NavigationError> {
        let cond = WaitCondition::Present(selector.to_string());
        match wait_for(self.driver(), &cond, self.budget, self.poll).await {
            Ok(()) => Ok(()),
            Err(DriverError::Timeout { .. }) => Err(NavigationError::Timeout {
                marker: selector.to_string(),
                budget: self.budget,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// 超时后关闭弹窗重试一次，第二次超时升级为 `Unreachable`
    async fn with_one_retry<T, F, Fut>(&self, session: &mut Session, op: F) -> Result<T, NavigationError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, NavigationError>>,
    {
        match op().await {
            Err(NavigationError::Timeout { marker, .. }) => {
                self.check_expired(session).await?;
                warn!("⚠️ 等待 {} 超时，重试一次", marker);
                self.dismiss_popups().await;
                match op().await {
                    Err(NavigationError::Timeout { marker, .. }) => {
                        self.check_expired(session).await?;
                        Err(NavigationError::Unreachable { marker })
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    /// 出现登录框说明会话已过期
    async fn check_expired(&self, session: &mut Session) -> Result<(), NavigationError> {
        if session.auth() != AuthState::Authenticated {
            return Err(NavigationError::SessionExpired);
        }
        if exists(self.driver(), &self.selectors.username_input).await? {
            warn!("⚠️ 检测到登录页面，会话已过期");
            session.set_auth(AuthState::Expired);
            return Err(NavigationError::SessionExpired);
        }
        Ok(())
    }

    fn apply(&self, session: &mut Session, event: NavEvent) -> Result<(), NavigationError> {
        let next = transition(session.state(), &event)?;
        debug!("导航状态: {} -> {}", session.state().name(), next.name());
        session.set_state(next);
        Ok(())
    }

    /// 关闭常见弹窗（"我知道了"、取词提示等），失败忽略
    async fn dismiss_popups(&self) {
        for selector in &self.selectors.popup_buttons {
            if let Ok(true) = click_if_present(self.driver(), selector).await {
                debug!("已关闭弹窗: {}", selector);
            }
        }
        for text in &self.selectors.popup_texts {
            if let Ok(Some(button)) = locate_by_text(self.driver(), "button", text).await {
                if self.driver().click(&button).await.is_ok() {
                    debug!("已关闭弹窗: {}", text);
                }
            }
        }
    }

    async fn login(&self, session: &mut Session) -> Result<(), AuthError> {
        let s = &self.selectors;
        let d = self.driver();
        info!("🔐 正在登录: {}", self.login_url);
        d.navigate(&self.login_url).await?;

        let input_ready = WaitCondition::Present(s.username_input.clone());
        if wait_for(d, &input_ready, self.budget, self.poll).await.is_err() {
            return Err(AuthError::LoginPageUnavailable(s.username_input.clone()));
        }

        click_if_present(d, &s.agreement_checkbox).await?;
        let credentials = session.credentials().clone();
        let username = d
            .locate(&s.username_input)
            .await?
            .ok_or_else(|| AuthError::LoginPageUnavailable(s.username_input.clone()))?;
        let password = d
            .locate(&s.password_input)
            .await?
            .ok_or_else(|| AuthError::LoginPageUnavailable(s.password_input.clone()))?;
        d.set_value(&username, credentials.account()).await?;
        d.set_value(&password, credentials.secret()).await?;

        if !click_if_present(d, &s.login_button).await? {
            return Err(AuthError::LoginPageUnavailable(s.login_button.clone()));
        }

        let logged_in = WaitCondition::Present(s.logged_in_marker.clone());
        if wait_for(d, &logged_in, self.poll, self.poll).await.is_err() {
            click_if_present(d, &s.login_popup_button).await?;
            self.dismiss_popups().await;
            if wait_for(d, &logged_in, self.budget, self.poll).await.is_err() {
                return Err(AuthError::Rejected("登录后未出现课程列表".to_string()));
            }
        }

        session.set_auth(AuthState::Authenticated);
        let next = transition(session.state(), &NavEvent::LoginConfirmed)
            .map_err(|e| AuthError::Rejected(e.to_string()))?;
        session.set_state(next);
        info!("✓ 登录成功");
        Ok(())
    }

    /// 从课程列表进入课程，记录课程主页地址
    async fn open_course(&self) -> Result<String, NavigationError> {
        let s = &self.selectors;
        self.wait_marker(&s.course_card).await?;
        let cards = self.driver().locate_all(None, &s.course_card).await?;
        let card = cards.get(self.course_index).ok_or_else(|| {
            NavigationError::GraphExhausted(format!(
                "课程列表只有 {} 门课程，找不到第 {} 门",
                cards.len(),
                self.course_index + 1
            ))
        })?;
        if let Ok(names) = self.driver().locate_all(Some(card), &s.course_name).await {
            if let Some(name) = names.first() {
                if let Ok(name) = self.driver().read_text(name).await {
                    info!("📚 进入课程: {}", name);
                }
            }
        }
        self.driver().click(card).await?;
        self.dismiss_popups().await;
        self.wait_marker(&s.unit_tab).await?;
        Ok(self.driver().current_url().await?)
    }

    async fn course_url(&self, session: &mut Session) -> Result<String, NavigationError> {
        if let Some(url) = self.cursor.lock().await.course_url.clone() {
            return Ok(url);
        }
        let url = self.with_one_retry(session, || self.open_course()).await?;
        self.cursor.lock().await.course_url = Some(url.clone());
        Ok(url)
    }

    /// 回到课程主页并切换到指定单元
    async fn open_unit_once(&self, course_url: &str, unit_index: usize) -> Result<(), NavigationError> {
        let s = &self.selectors;
        let d = self.driver();
        if !d.current_url().await?.starts_with(course_url) || !exists(d, &s.unit_tab).await? {
            d.navigate(course_url).await?;
        }
        self.wait_marker(&s.unit_tab).await?;
        let tabs = d.locate_all(None, &s.unit_tab).await?;
        let tab = tabs
            .get(unit_index)
            .ok_or_else(|| NavigationError::GraphExhausted(format!("单元 {} 不存在", unit_index + 1)))?;
        d.click(tab).await?;
        self.wait_marker(&s.active_unit).await
    }

    async fn load_units(&self, session: &mut Session) -> Result<Vec<UnitInfo>, NavigationError> {
        let course_url = self.course_url(session).await?;
        let d = self.driver();
        if !exists(d, &self.selectors.unit_tab).await? {
            d.navigate(&course_url).await?;
        }
        self.with_one_retry(session, || self.wait_marker(&self.selectors.unit_tab))
            .await?;

        let mut units = Vec::new();
        for (index, tab) in d.locate_all(None, &self.selectors.unit_tab).await?.iter().enumerate() {
            let text = d.read_text(tab).await?;
            let name = text.lines().next().unwrap_or_default().trim().to_string();
            if !self.selectors.skip_unit_keyword.is_empty()
                && name.contains(&self.selectors.skip_unit_keyword)
            {
                info!("⏭️ 跳过测试单元: {}", name);
                continue;
            }
            units.push(UnitInfo { index, name });
        }
        info!("✓ 找到 {} 个单元", units.len());
        Ok(units)
    }

    /// 读取当前单元里的待完成任务
    async fn collect_tasks(&self, unit: &UnitInfo) -> Result<Vec<Location>, NavigationError> {
        let s = &self.selectors;
        let d = self.driver();
        let Some(area) = d.locate(&s.active_unit).await? else {
            return Ok(Vec::new());
        };
        let mut tasks = Vec::new();
        for (task_index, item) in d.locate_all(Some(&area), &s.task_item).await?.iter().enumerate() {
            let text = d.read_text(item).await?;
            if !text.contains(&s.required_task_text) || text.contains(&s.done_task_text) {
                continue;
            }
            let task_name = match d.locate_all(Some(item), &s.task_name).await?.first() {
                Some(el) => d.read_text(el).await?,
                None => text.lines().next().unwrap_or_default().to_string(),
            };
            tasks.push(Location {
                unit_index: unit.index,
                unit_name: unit.name.clone(),
                task_index,
                task_name: task_name.trim().to_string(),
            });
        }
        Ok(tasks)
    }

    async fn enter_once(&self, course_url: &str, location: &Location) -> Result<(), NavigationError> {
        let s = &self.selectors;
        let d = self.driver();
        self.open_unit_once(course_url, location.unit_index).await?;
        let area = d
            .locate(&s.active_unit)
            .await?
            .ok_or_else(|| NavigationError::Unreachable {
                marker: s.active_unit.clone(),
            })?;
        let items = d.locate_all(Some(&area), &s.task_item).await?;
        let item = items.get(location.task_index).ok_or_else(|| {
            NavigationError::GraphExhausted(format!("{} 已不在任务列表中", location))
        })?;
        d.click(item).await?;
        self.dismiss_popups().await;
        self.wait_marker(&s.question_ready).await?;
        self.dismiss_popups().await;
        Ok(())
    }
}

#[async_trait]
impl Navigator for NavigationController {
    async fn authenticate(&self, credentials: Arc<Credentials>) -> Result<Session, AuthError> {
        let mut session = Session::new(credentials);
        self.login(&mut session).await?;
        Ok(session)
    }

    async fn reauthenticate(&self, session: &mut Session) -> Result<(), AuthError> {
        session.set_auth(AuthState::Expired);
        info!("🔄 重新登录");
        self.login(session).await
    }

    async fn advance(&self, session: &mut Session) -> Result<NextLocation, NavigationError> {
        self.check_expired(session).await?;
        loop {
            {
                let mut cursor = self.cursor.lock().await;
                while let Some(loc) = cursor.pending.pop_front() {
                    if cursor.handed_out.insert(loc.clone()) {
                        debug!("下一题: {} ({})", loc, loc.task_name);
                        return Ok(NextLocation::Question(loc));
                    }
                }
            }

            if self.cursor.lock().await.units.is_none() {
                let units = self.load_units(session).await?;
                if units.is_empty() {
                    return Err(NavigationError::GraphExhausted("课程中没有可处理的单元".to_string()));
                }
                self.cursor.lock().await.units = Some(units);
            }

            let next_unit = {
                let cursor = self.cursor.lock().await;
                cursor
                    .units
                    .as_ref()
                    .and_then(|units| units.get(cursor.next_unit).cloned())
            };
            let Some(unit) = next_unit else {
                self.apply(session, NavEvent::CourseExhausted)?;
                info!("🏁 所有单元处理完毕");
                return Ok(NextLocation::Complete);
            };

            let course_url = self.course_url(session).await?;
            self.with_one_retry(session, || self.open_unit_once(&course_url, unit.index))
                .await?;
            self.apply(session, NavEvent::UnitOpened(unit.index))?;

            let tasks = self.collect_tasks(&unit).await?;
            info!("📂 单元 {}: {} 个待完成任务", unit.name, tasks.len());
            let mut cursor = self.cursor.lock().await;
            cursor.next_unit += 1;
            cursor.pending.extend(tasks);
        }
    }

    async fn enter(&self, session: &mut Session, location: &Location) -> Result<(), NavigationError> {
        self.check_expired(session).await?;
        let course_url = self.course_url(session).await?;
        self.with_one_retry(session, || self.enter_once(&course_url, location))
            .await?;
        self.check_expired(session).await?;
        self.apply(session, NavEvent::QuestionOpened(location.clone()))?;
        debug!("[{}] 已进入任务页: {}", location, location.task_name);
        Ok(())
    }

    async fn current_question_ready(&self, session: &Session) -> bool {
        if session.auth() != AuthState::Authenticated
            || !matches!(session.state(), NavState::AtQuestion(_))
        {
            return false;
        }
        let d = self.driver();
        matches!(exists(d, &self.selectors.question_ready).await, Ok(true))
            && matches!(exists(d, &self.selectors.username_input).await, Ok(false))
    }

    async fn mark_submitted(&self, session: &mut Session) -> Result<(), NavigationError> {
        self.apply(session, NavEvent::AnswerSubmitted)
    }

    async fn recover(&self, session: &mut Session) {
        self.dismiss_popups().await;
        let course_url = self.cursor.lock().await.course_url.clone();
        if let Some(url) = course_url {
            if let Err(e) = self.driver().navigate(&url).await {
                warn!("⚠️ 返回课程主页失败: {}", e);
                return;
            }
            if let NavState::AtQuestion(loc) | NavState::Submitted(loc) = session.state().clone() {
                if let Err(e) = self.apply(session, NavEvent::UnitOpened(loc.unit_index)) {
                    debug!("恢复时导航状态未更新: {}", e);
                }
            }
            debug!("已返回课程主页");
        }
    }
}
