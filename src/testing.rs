//! 单元测试用的内存替身

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::{
    AuthError, DriverError, ExtractionError, ModelError, NavigationError, RecognitionError,
    SubmissionError, SynthesisError,
};
use crate::infrastructure::{ElementRef, PageDriver};
use crate::models::{
    Answer, AnswerSlot, AttemptRecord, AudioClip, AuthState, Credentials, Location, MediaRef,
    NavState, Question, QuestionKind, QuestionShape, Session,
};
use crate::services::audio_bridge::{AudioBridge, VoiceParams};
use crate::services::llm_service::LanguageModel;
use crate::services::navigation::{Navigator, NextLocation};
use crate::services::question_extractor::{Extraction, Extractor};
use crate::services::submission::Submitter;

#[derive(Debug, Clone, Default)]
pub struct FakeNode {
    pub text: String,
    pub html: String,
    pub attrs: HashMap<String, String>,
}

impl FakeNode {
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            html: text.to_string(),
            attrs: HashMap::new(),
        }
    }

    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_html(mut self, html: &str) -> Self {
        self.html = html.to_string();
        self
    }
}

/// 点击某个元素后页面发生的变化
#[derive(Debug, Clone)]
pub enum DomChange {
    Add(String, FakeNode),
    Remove(String),
    RemoveFirst(String),
}

#[derive(Default)]
struct FakeDom {
    /// key: "父元素|选择器"
    nodes: HashMap<String, Vec<FakeNode>>,
    on_click: HashMap<String, Vec<DomChange>>,
    /// 每次点击都会生效的变化
    on_every_click: HashMap<String, Vec<DomChange>>,
    clicks: Vec<String>,
    values: HashMap<String, String>,
    navigations: Vec<String>,
    url: String,
    scripts: Vec<String>,
    eval_results: VecDeque<JsonValue>,
}

fn scope_key(parent: Option<&ElementRef>, selector: &str) -> String {
    format!(
        "{}|{}",
        parent.map(|p| p.to_string()).unwrap_or_default(),
        selector
    )
}

fn element_key(element: &ElementRef) -> String {
    scope_key(element.parent.as_deref(), &element.selector)
}

/// 用选择器字符串直接索引的假页面
#[derive(Default)]
pub struct FakePage {
    dom: Mutex<FakeDom>,
}

impl FakePage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, selector: &str, text: &str) -> &Self {
        self.add_node(selector, FakeNode::text(text))
    }

    pub fn add_node(&self, selector: &str, node: FakeNode) -> &Self {
        let mut dom = self.dom.lock().unwrap();
        apply(&mut dom, DomChange::Add(scope_key(None, selector), node));
        self
    }

    pub fn add_within(&self, parent: &ElementRef, selector: &str, text: &str) -> &Self {
        let mut dom = self.dom.lock().unwrap();
        apply(
            &mut dom,
            DomChange::Add(scope_key(Some(parent), selector), FakeNode::text(text)),
        );
        self
    }

    /// 点击 `element`（形如 ".btn[0]"）时新增顶层元素
    pub fn on_click_add(&self, element: &str, selector: &str, text: &str) -> &Self {
        self.on_click(element, DomChange::Add(scope_key(None, selector), FakeNode::text(text)))
    }

    pub fn on_click_remove(&self, element: &str, selector: &str) -> &Self {
        self.on_click(element, DomChange::Remove(scope_key(None, selector)))
    }

    /// 每次点击 `element` 都移除 `selector` 的第一个元素（勾选框这类逐个消失的元素）
    pub fn on_each_click_remove_first(&self, element: &str, selector: &str) -> &Self {
        let mut dom = self.dom.lock().unwrap();
        dom.on_every_click
            .entry(element.to_string())
            .or_default()
            .push(DomChange::RemoveFirst(scope_key(None, selector)));
        self
    }

    fn on_click(&self, element: &str, change: DomChange) -> &Self {
        let mut dom = self.dom.lock().unwrap();
        dom.on_click
            .entry(element.to_string())
            .or_default()
            .push(change);
        self
    }

    pub fn push_eval_result(&self, value: JsonValue) {
        self.dom.lock().unwrap().eval_results.push_back(value);
    }

    pub fn clicks(&self) -> Vec<String> {
        self.dom.lock().unwrap().clicks.clone()
    }

    pub fn value_of(&self, element: &str) -> Option<String> {
        self.dom.lock().unwrap().values.get(element).cloned()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.dom.lock().unwrap().navigations.clone()
    }

    pub fn scripts(&self) -> Vec<String> {
        self.dom.lock().unwrap().scripts.clone()
    }

    fn node(&self, element: &ElementRef) -> Result<FakeNode, DriverError> {
        let dom = self.dom.lock().unwrap();
        dom.nodes
            .get(&element_key(element))
            .and_then(|v| v.get(element.index))
            .cloned()
            .ok_or_else(|| DriverError::ElementNotFound(element.to_string()))
    }
}

fn apply(dom: &mut FakeDom, change: DomChange) {
    match change {
        DomChange::Add(key, node) => dom.nodes.entry(key).or_default().push(node),
        DomChange::Remove(key) => {
            dom.nodes.remove(&key);
        }
        DomChange::RemoveFirst(key) => {
            let emptied = match dom.nodes.get_mut(&key) {
                Some(nodes) if !nodes.is_empty() => {
                    nodes.remove(0);
                    nodes.is_empty()
                }
                _ => false,
            };
            if emptied {
                dom.nodes.remove(&key);
            }
        }
    }
}

#[async_trait]
impl PageDriver for FakePage {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        let mut dom = self.dom.lock().unwrap();
        dom.navigations.push(url.to_string());
        dom.url = url.to_string();
        Ok(())
    }

    async fn count_within(
        &self,
        parent: Option<&ElementRef>,
        selector: &str,
    ) -> Result<usize, DriverError> {
        let dom = self.dom.lock().unwrap();
        Ok(dom
            .nodes
            .get(&scope_key(parent, selector))
            .map(|v| v.len())
            .unwrap_or(0))
    }

    async fn read_text(&self, element: &ElementRef) -> Result<String, DriverError> {
        Ok(self.node(element)?.text)
    }

    async fn read_attribute(
        &self,
        element: &ElementRef,
        name: &str,
    ) -> Result<Option<String>, DriverError> {
        Ok(self.node(element)?.attrs.get(name).cloned())
    }

    async fn inner_html(&self, element: &ElementRef) -> Result<String, DriverError> {
        Ok(self.node(element)?.html)
    }

    async fn set_value(&self, element: &ElementRef, value: &str) -> Result<(), DriverError> {
        self.node(element)?;
        let mut dom = self.dom.lock().unwrap();
        dom.values.insert(element.to_string(), value.to_string());
        Ok(())
    }

    async fn click(&self, element: &ElementRef) -> Result<(), DriverError> {
        self.node(element)?;
        let mut dom = self.dom.lock().unwrap();
        let key = element.to_string();
        dom.clicks.push(key.clone());
        if let Some(changes) = dom.on_click.remove(&key) {
            for change in changes {
                apply(&mut dom, change);
            }
        }
        if let Some(changes) = dom.on_every_click.get(&key).cloned() {
            for change in changes {
                apply(&mut dom, change);
            }
        }
        Ok(())
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        Ok(self.dom.lock().unwrap().url.clone())
    }

    async fn eval(&self, script: &str) -> Result<JsonValue, DriverError> {
        let mut dom = self.dom.lock().unwrap();
        dom.scripts.push(script.to_string());
        Ok(dom.eval_results.pop_front().unwrap_or(JsonValue::Null))
    }
}

/// 按顺序返回预设回复的语言模型
#[derive(Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, ModelError>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Result<String, ModelError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(replies: &[&str]) -> Self {
        Self::new(replies.iter().map(|r| Ok(r.to_string())).collect())
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, prompt: &str) -> Result<String, ModelError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ModelError::EmptyContent {
                model: "scripted".to_string(),
            }))
    }
}

/// 文本直接当作音频字节的语音桥
#[derive(Default)]
pub struct FakeAudio {
    pub transcript: Option<String>,
    pub spoken: Mutex<Vec<(String, VoiceParams)>>,
}

#[async_trait]
impl AudioBridge for FakeAudio {
    async fn speak_with(&self, text: &str, params: VoiceParams) -> Result<AudioClip, SynthesisError> {
        if text.trim().is_empty() {
            return Err(SynthesisError::EmptyText(text.to_string()));
        }
        self.spoken.lock().unwrap().push((text.to_string(), params));
        Ok(AudioClip {
            bytes: text.as_bytes().to_vec(),
            duration: Duration::from_millis(10),
            spoken_text: text.to_string(),
        })
    }

    async fn transcribe(&self, _audio: &[u8]) -> Result<String, RecognitionError> {
        self.transcript.clone().ok_or(RecognitionError::Empty)
    }
}

/// 按脚本返回结果的导航器
///
/// `enter` / `advance` / `reauthenticate` 依次弹出预设结果，用完后一律成功。
#[derive(Default)]
pub struct ScriptedNavigator {
    locations: Mutex<VecDeque<Location>>,
    enter_results: Mutex<VecDeque<Result<(), NavigationError>>>,
    advance_results: Mutex<VecDeque<Result<(), NavigationError>>>,
    reauth_results: Mutex<VecDeque<Result<(), AuthError>>>,
    pub enters: Mutex<Vec<Location>>,
    pub reauths: Mutex<u32>,
    pub recovers: Mutex<u32>,
}

impl ScriptedNavigator {
    pub fn with_locations(locations: Vec<Location>) -> Self {
        Self {
            locations: Mutex::new(locations.into()),
            ..Default::default()
        }
    }

    pub fn script_enter(self, results: Vec<Result<(), NavigationError>>) -> Self {
        *self.enter_results.lock().unwrap() = results.into();
        self
    }

    pub fn script_advance(self, results: Vec<Result<(), NavigationError>>) -> Self {
        *self.advance_results.lock().unwrap() = results.into();
        self
    }

    pub fn script_reauth(self, results: Vec<Result<(), AuthError>>) -> Self {
        *self.reauth_results.lock().unwrap() = results.into();
        self
    }

    pub fn enter_count(&self) -> usize {
        self.enters.lock().unwrap().len()
    }

    pub fn reauth_count(&self) -> u32 {
        *self.reauths.lock().unwrap()
    }
}

pub fn location(task_index: usize) -> Location {
    Location {
        unit_index: 0,
        unit_name: "Unit 1".to_string(),
        task_index,
        task_name: format!("Task {}", task_index + 1),
    }
}

pub fn authenticated_session() -> Session {
    let credentials = Arc::new(Credentials::new("student01", "hunter2").unwrap());
    let mut session = Session::new(credentials);
    session.set_auth(AuthState::Authenticated);
    session.set_state(NavState::Authenticated);
    session
}

#[async_trait]
impl Navigator for ScriptedNavigator {
    async fn authenticate(&self, credentials: Arc<Credentials>) -> Result<Session, AuthError> {
        let mut session = Session::new(credentials);
        session.set_auth(AuthState::Authenticated);
        session.set_state(NavState::Authenticated);
        Ok(session)
    }

    async fn reauthenticate(&self, session: &mut Session) -> Result<(), AuthError> {
        *self.reauths.lock().unwrap() += 1;
        let result = self.reauth_results.lock().unwrap().pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            session.set_auth(AuthState::Authenticated);
            session.set_state(NavState::Authenticated);
        }
        result
    }

    async fn advance(&self, _session: &mut Session) -> Result<NextLocation, NavigationError> {
        if let Some(result) = self.advance_results.lock().unwrap().pop_front() {
            result?;
        }
        Ok(match self.locations.lock().unwrap().pop_front() {
            Some(loc) => NextLocation::Question(loc),
            None => NextLocation::Complete,
        })
    }

    async fn enter(&self, session: &mut Session, location: &Location) -> Result<(), NavigationError> {
        self.enters.lock().unwrap().push(location.clone());
        let result = self.enter_results.lock().unwrap().pop_front().unwrap_or(Ok(()));
        match result {
            Ok(()) => {
                session.set_state(NavState::AtQuestion(location.clone()));
                Ok(())
            }
            Err(NavigationError::SessionExpired) => {
                session.set_auth(AuthState::Expired);
                Err(NavigationError::SessionExpired)
            }
            Err(e) => Err(e),
        }
    }

    async fn current_question_ready(&self, session: &Session) -> bool {
        matches!(session.state(), NavState::AtQuestion(_))
    }

    async fn mark_submitted(&self, session: &mut Session) -> Result<(), NavigationError> {
        if let NavState::AtQuestion(loc) = session.state().clone() {
            session.set_state(NavState::Submitted(loc));
        }
        Ok(())
    }

    async fn recover(&self, _session: &mut Session) {
        *self.recovers.lock().unwrap() += 1;
    }
}

/// 每个位置都返回同一道三选一题目的取题器
#[derive(Default)]
pub struct StaticExtractor {
    /// 这些任务序号返回"无需作答"
    pub nothing_for: Vec<usize>,
    pub kind: Option<QuestionKind>,
    /// 答案解析页给出的正确答案
    pub correct: Option<Vec<String>>,
    pub extracts: Mutex<u32>,
}

impl StaticExtractor {
    pub fn of_kind(kind: QuestionKind) -> Self {
        Self {
            kind: Some(kind),
            ..Default::default()
        }
    }

    pub fn question(&self, location: &Location) -> Question {
        let kind = self.kind.unwrap_or(QuestionKind::MultipleChoice);
        let slot = match kind {
            QuestionKind::MultipleChoice => AnswerSlot {
                prompt: "What is the capital of France?".to_string(),
                options: vec!["Paris".to_string(), "Lyon".to_string(), "Nice".to_string()],
                ..Default::default()
            },
            QuestionKind::Speaking => AnswerSlot {
                reference_text: Some("Good morning, everyone.".to_string()),
                ..Default::default()
            },
            QuestionKind::Ordering => AnswerSlot {
                options: vec!["Then".to_string(), "First".to_string(), "Finally".to_string()],
                ..Default::default()
            },
            QuestionKind::SelfCheck => AnswerSlot {
                options: vec![String::new(); 3],
                multi: true,
                ..Default::default()
            },
            _ => AnswerSlot {
                prompt: "Summarize the passage.".to_string(),
                ..Default::default()
            },
        };
        Question {
            id: location.question_id(),
            kind,
            prompt: slot.prompt.clone(),
            direction: String::new(),
            context: String::new(),
            media: (kind == QuestionKind::Listening).then(|| MediaRef {
                url: "https://example.com/a.mp3".to_string(),
                tag: "audio".to_string(),
            }),
            slots: vec![slot],
            breadcrumb: vec![location.unit_name.clone(), location.task_name.clone()],
        }
    }

    pub fn extract_count(&self) -> u32 {
        *self.extracts.lock().unwrap()
    }
}

#[async_trait]
impl Extractor for StaticExtractor {
    async fn extract(&self, location: &Location) -> Result<Extraction, ExtractionError> {
        *self.extracts.lock().unwrap() += 1;
        if self.nothing_for.contains(&location.task_index) {
            return Ok(Extraction::NothingToAnswer("页面没有作答区域".to_string()));
        }
        Ok(Extraction::Question(self.question(location)))
    }

    async fn probe_shape(&self) -> Result<QuestionShape, ExtractionError> {
        Ok(self.question(&location(0)).shape())
    }

    async fn load_media(&self, _media: &MediaRef) -> Result<Vec<u8>, ExtractionError> {
        Ok(b"ID3".to_vec())
    }

    async fn correct_answers(&self, _question: &Question) -> Result<Option<Vec<String>>, ExtractionError> {
        Ok(self.correct.clone())
    }
}

/// 记录提交内容的提交器，依次弹出预设结果
#[derive(Default)]
pub struct FakeSubmitter {
    results: Mutex<VecDeque<Result<(), SubmissionError>>>,
    pub submitted: Mutex<Vec<Answer>>,
    calls: Mutex<u32>,
    /// 页面上是否已经出现提交完成标记
    pub already: bool,
}

impl FakeSubmitter {
    pub fn failing_with(results: Vec<Result<(), SubmissionError>>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            ..Default::default()
        }
    }

    pub fn with_already_submitted(mut self) -> Self {
        self.already = true;
        self
    }

    pub fn answers(&self) -> Vec<Answer> {
        self.submitted.lock().unwrap().clone()
    }

    /// submit 被调用的次数，包括失败的
    pub fn call_count(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl Submitter for FakeSubmitter {
    async fn submit(&self, _location: &Location, answer: Answer) -> Result<AttemptRecord, SubmissionError> {
        *self.calls.lock().unwrap() += 1;
        self.results.lock().unwrap().pop_front().unwrap_or(Ok(()))?;
        let record = AttemptRecord::submitted(answer.question_id().clone(), answer.kind());
        self.submitted.lock().unwrap().push(answer);
        Ok(record)
    }

    async fn already_submitted(&self) -> Result<bool, SubmissionError> {
        Ok(self.already)
    }
}
