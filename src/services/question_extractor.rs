//! 取题服务 - 业务能力层
//!
//! 当前页面 → 结构化的 `Question`
//!
//! 题型按页面标记识别，同时出现多种标记时按优先级取：
//! 自查清单 > 排序 > 口语（录音按钮） > 听力（audio / video） > 选择（选项组） > 填空（空内输入框） > 简答（文本框）
//!
//! 讨论区、角色扮演页面需要人工参与，识别后直接跳过。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::config::Selectors;
use crate::error::ExtractionError;
use crate::infrastructure::{click_if_present, exists, wait_for, PageDriver, WaitCondition};
use crate::models::{AnswerSlot, Location, MediaRef, Question, QuestionKind, QuestionShape};

/// 页面上观察到的题型标记
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageMarkers {
    pub self_check: usize,
    pub ordering: usize,
    pub record_controls: usize,
    pub media: usize,
    pub choice_groups: usize,
    pub blank_inputs: usize,
    pub text_inputs: usize,
}

impl PageMarkers {
    fn has_answer_area(&self) -> bool {
        self.choice_groups > 0 || self.blank_inputs > 0 || self.text_inputs > 0
    }
}

/// 按优先级识别题型
///
/// 听力题必须同时有作答区域，单独的媒体不构成题目。
pub fn classify(markers: &PageMarkers) -> Option<QuestionKind> {
    QuestionKind::PRIORITY.into_iter().find(|kind| match kind {
        QuestionKind::SelfCheck => markers.self_check > 0,
        QuestionKind::Ordering => markers.ordering > 0,
        QuestionKind::Speaking => markers.record_controls > 0,
        QuestionKind::Listening => markers.media > 0 && markers.has_answer_area(),
        QuestionKind::MultipleChoice => markers.choice_groups > 0,
        QuestionKind::FillBlank => markers.blank_inputs > 0,
        QuestionKind::FreeText => markers.text_inputs > 0,
    })
}

/// 把填空题的 HTML 转成带 `___` 的纯文本
pub fn normalize_blank_html(html: &str) -> String {
    let blank = Regex::new(r#"(?s)<span class="fe-scoop".*?</span>"#);
    let tags = Regex::new(r"(?s)<[^>]*>");
    let (Ok(blank), Ok(tags)) = (blank, tags) else {
        return html.to_string();
    };
    let text = blank.replace_all(html, " ___ ");
    let text = tags.replace_all(&text, "");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 取题结果
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Question(Question),
    /// 页面不需要或无法作答（图片选项、无作答区域、讨论区等）
    NothingToAnswer(String),
}

/// 取题能力
#[async_trait]
pub trait Extractor: Send + Sync {
    /// 提取当前页面的题目
    async fn extract(&self, location: &Location) -> Result<Extraction, ExtractionError>;

    /// 只读取当前渲染的题目形状（提交前比对用）
    async fn probe_shape(&self) -> Result<QuestionShape, ExtractionError>;

    /// 读取媒体文件
    async fn load_media(&self, media: &MediaRef) -> Result<Vec<u8>, ExtractionError>;

    /// 提交后从答案解析中读取正确答案，每个作答位置一项
    ///
    /// 读不到或与题目对不上时返回 None。
    async fn correct_answers(&self, _question: &Question) -> Result<Option<Vec<String>>, ExtractionError> {
        Ok(None)
    }
}

#[derive(Debug, Deserialize)]
struct FetchResult {
    ok: bool,
    value: Option<String>,
}

/// 基于页面选择器的取题实现
pub struct QuestionExtractor {
    driver: Arc<dyn PageDriver>,
    selectors: Selectors,
    budget: Duration,
    poll: Duration,
}

impl QuestionExtractor {
    pub fn new(driver: Arc<dyn PageDriver>, selectors: Selectors) -> Self {
        Self {
            driver,
            selectors,
            budget: Duration::from_secs(15),
            poll: Duration::from_millis(250),
        }
    }

    /// 等待答案解析页的预算
    pub fn with_budget(mut self, budget: Duration, poll: Duration) -> Self {
        self.budget = budget;
        self.poll = poll;
        self
    }

    async fn read_markers(&self) -> Result<PageMarkers, ExtractionError> {
        let s = &self.selectors;
        let d = self.driver.as_ref();
        Ok(PageMarkers {
            self_check: d.count_within(None, &s.self_check_view).await?,
            ordering: d.count_within(None, &s.ordering_list).await?,
            record_controls: d.count_within(None, &s.record_button).await?,
            media: d.count_within(None, &s.media).await?,
            choice_groups: d.count_within(None, &s.choice_group).await?,
            blank_inputs: d.count_within(None, &s.fill_blank_input).await?,
            text_inputs: d.count_within(None, &s.free_text_input).await?,
        })
    }

    async fn first_text(&self, selector: &str) -> Result<String, ExtractionError> {
        match self.driver.locate(selector).await? {
            Some(el) => Ok(self.driver.read_text(&el).await?),
            None => Ok(String::new()),
        }
    }

    async fn all_texts(&self, selector: &str) -> Result<Vec<String>, ExtractionError> {
        let mut texts = Vec::new();
        for el in self.driver.locate_all(None, selector).await? {
            texts.push(self.driver.read_text(&el).await?);
        }
        Ok(texts)
    }

    async fn choice_slots(&self, with_text: bool) -> Result<Vec<AnswerSlot>, ExtractionError> {
        let mut slots = Vec::new();
        for group in self.driver.locate_all(None, &self.selectors.choice_group).await? {
            let options = self
                .driver
                .locate_all(Some(&group), &self.selectors.choice_option)
                .await?;
            if options.is_empty() {
                return Err(ExtractionError::Ambiguous(format!("选项组 {} 没有选项", group)));
            }
            let class = self.driver.read_attribute(&group, "class").await?.unwrap_or_default();
            let mut slot = AnswerSlot {
                multi: class
                    .split_whitespace()
                    .any(|c| c == self.selectors.multi_choice_class),
                ..Default::default()
            };
            if with_text {
                let group_text = self.driver.read_text(&group).await?;
                slot.prompt = group_text.lines().next().unwrap_or_default().trim().to_string();
                for option in &options {
                    slot.options.push(self.driver.read_text(option).await?);
                }
            } else {
                slot.options = vec![String::new(); options.len()];
            }
            slots.push(slot);
        }
        Ok(slots)
    }

    async fn text_slots(&self, with_text: bool) -> Result<Vec<AnswerSlot>, ExtractionError> {
        let inputs = self.driver.count_within(None, &self.selectors.free_text_input).await?;
        let prompts = if with_text {
            self.all_texts(&self.selectors.free_text_prompt).await?
        } else {
            Vec::new()
        };
        Ok((0..inputs)
            .map(|i| AnswerSlot {
                prompt: prompts.get(i).cloned().unwrap_or_default(),
                ..Default::default()
            })
            .collect())
    }

    async fn speaking_slots(&self, markers: &PageMarkers, with_text: bool) -> Result<Vec<AnswerSlot>, ExtractionError> {
        let references = if with_text {
            self.all_texts(&self.selectors.reference_sentence).await?
        } else {
            Vec::new()
        };
        let prompts = if with_text {
            self.all_texts(&self.selectors.free_text_prompt).await?
        } else {
            Vec::new()
        };
        let n = markers.record_controls;
        let references: Vec<Option<String>> = if references.len() == n {
            references.into_iter().map(Some).collect()
        } else if n == 1 && !references.is_empty() {
            vec![Some(references.join(" "))]
        } else {
            vec![None; n]
        };
        Ok(references
            .into_iter()
            .enumerate()
            .map(|(i, reference_text)| AnswerSlot {
                prompt: prompts.get(i).cloned().unwrap_or_default(),
                reference_text,
                ..Default::default()
            })
            .collect())
    }

    /// 排序题：一个作答位置，选项是待排序的条目
    async fn ordering_slots(&self, with_text: bool) -> Result<Vec<AnswerSlot>, ExtractionError> {
        let items = if with_text {
            self.all_texts(&self.selectors.ordering_item)
                .await?
                .into_iter()
                .map(|t| t.trim().to_string())
                .collect()
        } else {
            vec![String::new(); self.driver.count_within(None, &self.selectors.ordering_item).await?]
        };
        if items.is_empty() {
            return Err(ExtractionError::Ambiguous("排序列表没有条目".to_string()));
        }
        Ok(vec![AnswerSlot {
            options: items,
            ..Default::default()
        }])
    }

    /// 自查清单：一个作答位置，每个未勾选的框算一个选项
    async fn self_check_slots(&self) -> Result<Vec<AnswerSlot>, ExtractionError> {
        let unchecked = self
            .driver
            .count_within(None, &self.selectors.self_check_unchecked)
            .await?;
        Ok(vec![AnswerSlot {
            options: vec![String::new(); unchecked],
            multi: true,
            ..Default::default()
        }])
    }

    /// 按题型读取作答位置；`with_text` 为 false 时只关心结构
    async fn read_slots(
        &self,
        kind: QuestionKind,
        markers: &PageMarkers,
        with_text: bool,
    ) -> Result<Vec<AnswerSlot>, ExtractionError> {
        let blanks = || vec![AnswerSlot::default(); markers.blank_inputs];
        let slots = match kind {
            QuestionKind::SelfCheck => self.self_check_slots().await?,
            QuestionKind::Ordering => self.ordering_slots(with_text).await?,
            QuestionKind::Speaking => self.speaking_slots(markers, with_text).await?,
            QuestionKind::MultipleChoice => self.choice_slots(with_text).await?,
            QuestionKind::FillBlank => blanks(),
            QuestionKind::FreeText => self.text_slots(with_text).await?,
            QuestionKind::Listening if markers.choice_groups > 0 => {
                self.choice_slots(with_text).await?
            }
            QuestionKind::Listening if markers.blank_inputs > 0 => blanks(),
            QuestionKind::Listening => self.text_slots(with_text).await?,
        };
        if slots.is_empty() {
            return Err(ExtractionError::Ambiguous(format!("{} 没有作答位置", kind)));
        }
        Ok(slots)
    }

    async fn read_media(&self) -> Result<Option<MediaRef>, ExtractionError> {
        let Some(el) = self.driver.locate(&self.selectors.media).await? else {
            return Ok(None);
        };
        let mut url = self.driver.read_attribute(&el, "src").await?;
        if url.as_deref().map_or(true, str::is_empty) {
            if let Some(source) = self.driver.locate_all(Some(&el), "source").await?.first() {
                url = self.driver.read_attribute(source, "src").await?;
            }
        }
        let tag = self
            .driver
            .eval(&format!(
                "(() => {{ const el = document.querySelector({}); return el ? el.tagName.toLowerCase() : 'audio'; }})()",
                serde_json::to_string(&self.selectors.media).unwrap_or_default()
            ))
            .await
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "audio".to_string());
        Ok(url.filter(|u| !u.is_empty()).map(|url| MediaRef { url, tag }))
    }

    async fn read_prompt(&self, kind: QuestionKind, slots: &[AnswerSlot]) -> Result<String, ExtractionError> {
        if kind == QuestionKind::FillBlank
            || (kind == QuestionKind::Listening && slots.iter().all(|s| s.prompt.is_empty()))
        {
            if let Some(el) = self.driver.locate(&self.selectors.fill_blank_html).await? {
                return Ok(normalize_blank_html(&self.driver.inner_html(&el).await?));
            }
        }
        Ok(slots
            .iter()
            .map(|s| s.prompt.trim())
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

#[async_trait]
impl Extractor for QuestionExtractor {
    async fn extract(&self, location: &Location) -> Result<Extraction, ExtractionError> {
        let s = &self.selectors;
        let d = self.driver.as_ref();
        let skipped = [
            (&s.image_options, "选项为图片，无法作答"),
            (&s.discussion_marker, "讨论区需要人工发布评论"),
            (&s.role_play_marker, "角色扮演需要人工对话"),
        ];
        for (selector, reason) in skipped {
            if exists(d, selector).await? {
                return Ok(Extraction::NothingToAnswer(reason.to_string()));
            }
        }

        let markers = self.read_markers().await?;
        let special = markers.self_check > 0 || markers.ordering > 0;
        if !special && exists(d, &s.no_reply_area).await? {
            return Ok(Extraction::NothingToAnswer("页面没有作答区域".to_string()));
        }
        let kind = classify(&markers)
            .ok_or_else(|| ExtractionError::Unrecognized(format!("{} {:?}", location, markers)))?;
        debug!("[{}] 识别为{} ({:?})", location, kind, markers);

        let slots = self.read_slots(kind, &markers, true).await?;
        if kind == QuestionKind::SelfCheck && slots.iter().all(|slot| slot.options.is_empty()) {
            return Ok(Extraction::NothingToAnswer("自查清单已全部勾选".to_string()));
        }
        let media = match kind {
            QuestionKind::Listening => {
                let media = self.read_media().await?;
                if media.is_none() {
                    return Err(ExtractionError::Ambiguous("听力题没有可读取的媒体地址".to_string()));
                }
                media
            }
            // 排序题的音视频是可选的参考材料
            QuestionKind::Ordering if markers.media > 0 => self.read_media().await?,
            _ => None,
        };

        Ok(Extraction::Question(Question {
            id: location.question_id(),
            kind,
            prompt: self.read_prompt(kind, &slots).await?,
            direction: self.first_text(&self.selectors.direction).await?,
            context: self.first_text(&self.selectors.article).await?,
            media,
            slots,
            breadcrumb: self
                .all_texts(&self.selectors.breadcrumb)
                .await?
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
        }))
    }

    async fn probe_shape(&self) -> Result<QuestionShape, ExtractionError> {
        let markers = self.read_markers().await?;
        let kind = classify(&markers)
            .ok_or_else(|| ExtractionError::Unrecognized(format!("{:?}", markers)))?;
        let slots = self.read_slots(kind, &markers, false).await?;
        Ok(QuestionShape::from_slots(kind, &slots))
    }

    async fn load_media(&self, media: &MediaRef) -> Result<Vec<u8>, ExtractionError> {
        let media_err = |message: String| ExtractionError::Media {
            url: media.url.clone(),
            message,
        };
        // 在页面内请求，带上平台的登录 cookie
        let script = format!(
            r#"(async () => {{
                const r = await fetch({}, {{ credentials: 'include' }});
                if (!r.ok) return {{ ok: false, value: 'HTTP ' + r.status }};
                const buf = new Uint8Array(await r.arrayBuffer());
                let s = '';
                for (let i = 0; i < buf.length; i += 0x8000) {{
                    s += String.fromCharCode.apply(null, buf.subarray(i, i + 0x8000));
                }}
                return {{ ok: true, value: btoa(s) }};
            }})()"#,
            serde_json::to_string(&media.url).unwrap_or_default()
        );
        let value = self.driver.eval(&script).await?;
        let result: FetchResult =
            serde_json::from_value(value).map_err(|e| media_err(e.to_string()))?;
        let encoded = result.value.unwrap_or_default();
        if !result.ok {
            return Err(media_err(encoded));
        }
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| media_err(e.to_string()))?;
        if bytes.is_empty() {
            return Err(media_err("媒体文件为空".to_string()));
        }
        debug!("已读取 {} 媒体: {} 字节", media.tag, bytes.len());
        Ok(bytes)
    }

    async fn correct_answers(&self, question: &Question) -> Result<Option<Vec<String>>, ExtractionError> {
        let s = &self.selectors;
        let d = self.driver.as_ref();
        if !exists(d, &s.analysis_item).await? {
            if !click_if_present(d, &s.analysis_entry).await? {
                debug!("没有找到答案解析入口: {}", s.analysis_entry);
                return Ok(None);
            }
            let shown = WaitCondition::Present(s.analysis_item.clone());
            if let Err(e) = wait_for(d, &shown, self.budget, self.poll).await {
                debug!("答案解析页未出现: {}", e);
                return Ok(None);
            }
        }

        let mut answers = Vec::new();
        for item in d.locate_all(None, &s.analysis_item).await? {
            let Some(value) = d.locate_all(Some(&item), &s.analysis_answer).await?.into_iter().next() else {
                continue;
            };
            let text = d.read_text(&value).await?;
            let text = text.trim();
            if !text.is_empty() {
                answers.push(text.to_string());
            }
        }
        if question.kind == QuestionKind::Ordering && !answers.is_empty() {
            answers = vec![answers.join(",")];
        }
        if answers.len() != question.slot_count() {
            debug!(
                "解析页答案数 {} 与作答位置数 {} 不一致",
                answers.len(),
                question.slot_count()
            );
            return Ok(None);
        }
        Ok(Some(answers))
    }
}
