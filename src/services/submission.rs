//! 提交服务 - 业务能力层
//!
//! 把 `Answer` 写回页面并确认提交成功。
//!
//! 写入前重新读取页面上当前渲染的题目形状，与答案比对；
//! 不一致说明页面在取题后变化了，返回 `ShapeMismatch`，由上层重新取题。
//!
//! 提交按钮点过之后的任何失败都报告为 `NotConfirmed { clicked: true }`，
//! 上层据此避免重复提交。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use regex::Regex;
use tracing::{debug, info, warn};

use super::question_extractor::Extractor;
use crate::config::{Config, Selectors};
use crate::error::{DriverError, SubmissionError};
use crate::infrastructure::{click_if_present, exists, wait_for, ElementRef, PageDriver, WaitCondition};
use crate::models::{Answer, AnswerPayload, AttemptRecord, AudioClip, Location, QuestionKind};

/// 录音结束前多留的时间
const RECORD_TAIL: Duration = Duration::from_millis(500);

/// 提交能力
#[async_trait]
pub trait Submitter: Send + Sync {
    /// 写入答案并提交，答案按值传入，只会被消费一次
    async fn submit(&self, location: &Location, answer: Answer) -> Result<AttemptRecord, SubmissionError>;

    /// 当前页面是否已经出现提交完成标记
    async fn already_submitted(&self) -> Result<bool, SubmissionError> {
        Ok(false)
    }
}

/// 基于页面选择器的提交实现
pub struct SubmissionEngine {
    driver: Arc<dyn PageDriver>,
    extractor: Arc<dyn Extractor>,
    selectors: Selectors,
    budget: Duration,
    poll: Duration,
}

impl SubmissionEngine {
    pub fn new(driver: Arc<dyn PageDriver>, extractor: Arc<dyn Extractor>, config: &Config) -> Self {
        Self {
            driver,
            extractor,
            selectors: config.selectors.clone(),
            budget: config.page_timeout(),
            poll: config.poll_interval(),
        }
    }

    pub fn with_budget(mut self, budget: Duration, poll: Duration) -> Self {
        self.budget = budget;
        self.poll = poll;
        self
    }

    fn driver(&self) -> &dyn PageDriver {
        self.driver.as_ref()
    }

    async fn select_options(&self, selected: &[Vec<usize>]) -> Result<(), DriverError> {
        let groups = self.driver().locate_all(None, &self.selectors.choice_group).await?;
        for (slot, indices) in selected.iter().enumerate() {
            let group = groups
                .get(slot)
                .ok_or_else(|| DriverError::ElementNotFound(format!("{}[{}]", self.selectors.choice_group, slot)))?;
            for &index in indices {
                let option = ElementRef::within(group, &self.selectors.choice_option, index);
                self.driver().click(&option).await?;
                debug!("已选择: {}", option);
            }
        }
        Ok(())
    }

    /// 排序组件不响应模拟拖拽，直接改写 React 组件状态并派发取值事件
    fn reorder_script(&self, order: &[usize]) -> String {
        let values: Vec<String> = order
            .iter()
            .map(|&i| char::from(b'A' + (i % 26) as u8).to_string())
            .collect();
        format!(
            r#"(() => {{
    const order = {order};
    const dom = document.querySelector({list});
    if (!dom) return false;
    const key = Object.keys(dom).find(k => k.startsWith('__reactFiber$'));
    if (!key) return false;
    let fiber = dom[key];
    let target = null;
    for (let depth = 0; fiber && depth < 15; depth++) {{
        const inst = fiber.stateNode;
        if (inst && inst.state && Array.isArray(inst.state.options)) {{ target = inst; break; }}
        fiber = fiber.return;
    }}
    if (!target) return false;
    const current = target.state.options;
    const next = order.map(v => current.find(o => o.value === v)).filter(Boolean);
    if (next.length !== current.length) return false;
    const datas = order.map(v => ({{ value: [v] }}));
    target.setState({{ options: next }}, () => {{
        if (target.props.dispatch) {{
            target.props.dispatch({{
                type: 'componentValuesChangeEvent',
                datas,
                toType: () => 'ComponentEvent',
            }});
        }}
    }});
    return true;
}})()"#,
            order = serde_json::Value::from(values),
            list = serde_json::Value::String(self.selectors.ordering_list.clone()),
        )
    }

    async fn reorder_items(&self, order: &[usize]) -> Result<(), DriverError> {
        let done = self.driver().eval(&self.reorder_script(order)).await?;
        if done.as_bool() != Some(true) {
            return Err(DriverError::Script("排序组件未找到".to_string()));
        }
        debug!("已排序: {:?}", order);
        Ok(())
    }

    /// 逐个点击未勾选的框，直到全部勾选
    async fn check_all(&self) -> Result<(), DriverError> {
        let selector = &self.selectors.self_check_unchecked;
        let initial = self.driver().count_within(None, selector).await?;
        let mut clicked = 0;
        // 每次点击后列表会重新渲染，总是点第一个
        while clicked < initial + 2 {
            let Some(first) = self.driver().locate(selector).await? else {
                break;
            };
            self.driver().click(&first).await?;
            clicked += 1;
            tokio::time::sleep(self.poll).await;
        }
        wait_for(
            self.driver(),
            &WaitCondition::Absent(selector.clone()),
            self.budget,
            self.poll,
        )
        .await?;
        debug!("已勾选 {} 项", clicked);
        Ok(())
    }

    async fn fill_texts(&self, kind: QuestionKind, values: &[String]) -> Result<(), DriverError> {
        let s = &self.selectors;
        let selector = if kind != QuestionKind::FreeText && exists(self.driver(), &s.fill_blank_input).await? {
            &s.fill_blank_input
        } else {
            &s.free_text_input
        };
        let inputs = self.driver().locate_all(None, selector).await?;
        for (i, value) in values.iter().enumerate() {
            let input = inputs
                .get(i)
                .ok_or_else(|| DriverError::ElementNotFound(format!("{}[{}]", selector, i)))?;
            self.driver().set_value(input, value).await?;
        }
        debug!("已填写 {} 处", values.len());
        Ok(())
    }

    /// 劫持评测 WebSocket，用合成的语音替换第一块麦克风数据
    fn speech_hook_script(&self, clip: &AudioClip) -> String {
        let audio = base64::engine::general_purpose::STANDARD.encode(&clip.bytes);
        format!(
            r#"(() => {{
    if (window.__originalWebSocket) {{ window.WebSocket = window.__originalWebSocket; }}
    const audio = {audio};
    const host = {host};
    let sent = false;
    window.__originalWebSocket = window.WebSocket;
    window.WebSocket = function(url, protocols) {{
        const ws = new window.__originalWebSocket(url, protocols);
        if (String(url).includes(host)) {{
            const send = ws.send;
            ws.send = function(data) {{
                if (data && data.buffer instanceof ArrayBuffer) {{
                    if (sent) return;
                    sent = true;
                    const raw = atob(audio);
                    const bytes = new Uint8Array(raw.length);
                    for (let i = 0; i < raw.length; i++) bytes[i] = raw.charCodeAt(i);
                    return send.call(this, bytes.buffer);
                }}
                return send.call(this, data);
            }};
        }}
        return ws;
    }};
    return true;
}})()"#,
            audio = serde_json::Value::String(audio),
            host = serde_json::Value::String(self.selectors.speech_socket_host.clone()),
        )
    }

    async fn remove_speech_hook(&self) {
        let script = "(() => { if (window.__originalWebSocket) { window.WebSocket = window.__originalWebSocket; delete window.__originalWebSocket; } return true; })()";
        if let Err(e) = self.driver().eval(script).await {
            warn!("⚠️ 清理录音劫持脚本失败: {}", e);
        }
    }

    async fn record_clips(&self, clips: &[AudioClip]) -> Result<(), DriverError> {
        let buttons = self.driver().locate_all(None, &self.selectors.record_button).await?;
        for (i, clip) in clips.iter().enumerate() {
            let button = buttons
                .get(i)
                .ok_or_else(|| DriverError::ElementNotFound(format!("{}[{}]", self.selectors.record_button, i)))?;
            self.driver().eval(&self.speech_hook_script(clip)).await?;
            self.driver().click(button).await?;
            debug!("🎙️ 录音中 ({:.1}s): {}", clip.duration.as_secs_f32(), clip.spoken_text);
            tokio::time::sleep(clip.duration + RECORD_TAIL).await;
            self.driver().click(button).await?;
        }
        Ok(())
    }

    async fn write_answer(&self, answer: &Answer) -> Result<(), DriverError> {
        match answer.payload() {
            AnswerPayload::Choice(selected) => self.select_options(selected).await,
            AnswerPayload::Order(order) => self.reorder_items(order).await,
            AnswerPayload::CheckAll => self.check_all().await,
            AnswerPayload::Text(values) => self.fill_texts(answer.kind(), values).await,
            AnswerPayload::Audio(clips) => {
                let result = self.record_clips(clips).await;
                self.remove_speech_hook().await;
                result
            }
        }
    }

    /// 点击提交并处理确认弹窗
    ///
    /// 自查清单勾完即完成，没有提交按钮；口语题的提交按钮可能不存在。
    async fn confirm(&self, answer: &Answer) -> Result<(), SubmissionError> {
        if matches!(answer.payload(), AnswerPayload::CheckAll) {
            return Ok(());
        }
        let s = &self.selectors;
        let clicked = click_if_present(self.driver(), &s.submit_button).await?;
        if !clicked && !matches!(answer.payload(), AnswerPayload::Audio(_)) {
            return Err(DriverError::ElementNotFound(s.submit_button.clone()).into());
        }
        let unconfirmed = |reason: String| SubmissionError::NotConfirmed { reason, clicked };
        match click_if_present(self.driver(), &s.submit_confirm_button).await {
            Ok(true) => debug!("已确认提交弹窗"),
            Ok(false) => {}
            Err(e) => return Err(unconfirmed(e.to_string())),
        }
        let done = WaitCondition::Present(s.submitted_marker.clone());
        wait_for(self.driver(), &done, self.budget, self.poll)
            .await
            .map_err(|e| unconfirmed(e.to_string()))
    }

    /// 读取平台给出的分数（口语题）
    async fn read_score(&self) -> Option<u32> {
        let el = self.driver().locate(&self.selectors.score).await.ok()??;
        let text = self.driver().read_text(&el).await.ok()?;
        let digits = Regex::new(r"\d+").ok()?;
        digits.find(&text)?.as_str().parse().ok()
    }
}

#[async_trait]
impl Submitter for SubmissionEngine {
    async fn submit(&self, location: &Location, answer: Answer) -> Result<AttemptRecord, SubmissionError> {
        let live = self.extractor.probe_shape().await?;
        if let Err(mismatch) = answer.fits(&live) {
            warn!("[{}] ⚠️ 页面已变化: {}", location, mismatch);
            return Err(mismatch.into());
        }

        self.write_answer(&answer).await?;
        self.confirm(&answer).await?;

        let score = self.read_score().await;
        match score {
            Some(score) => info!("[{}] ✓ 提交成功，得分 {}", location, score),
            None => info!("[{}] ✓ 提交成功", location),
        }
        Ok(AttemptRecord::submitted(answer.question_id().clone(), answer.kind()).with_score(score))
    }

    async fn already_submitted(&self) -> Result<bool, SubmissionError> {
        Ok(exists(self.driver(), &self.selectors.submitted_marker).await?)
    }
}
