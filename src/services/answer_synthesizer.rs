//! 答案合成服务 - 业务能力层
//!
//! 题目 → 提示词 → 语言模型 → 严格解析 → 答案
//!
//! 每种题型有固定的提示词模板和回复语法：
//! - 选择题：逗号分隔的选项编号，每个编号在 `[0, 选项数)` 内；
//!   多选小题用 `+` 连接多个编号，只有一道多选小题时逗号也视为连接
//! - 排序题：逗号分隔的条目编号，恰好是全部条目的一个排列
//! - 多空 / 多小题文本：长度等于作答位置数的 JSON 字符串数组
//! - 单个开放题、口语回答：去除首尾空白后的非空文本
//!
//! 回复不符合语法时追加格式说明重问一次，仍失败返回 `ParseError`。
//! 模型本身的错误直接返回，不重试。

use std::sync::Arc;

use regex::Regex;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use super::llm_service::LanguageModel;
use super::prompts::{
    CHOICE_FORMAT, LIST_FORMAT, ORDER_FORMAT, SPEECH_FORMAT, STRICT_REMINDER, TEXT_FORMAT,
};
use crate::error::{ParseError, SynthesizeError};
use crate::models::{Answer, AnswerPayload, AnswerSlot, Question, QuestionKind, QuestionShape};
use crate::utils::logging::truncate_text;

/// 答案合成服务
pub struct AnswerSynthesizer {
    model: Arc<dyn LanguageModel>,
}

impl AnswerSynthesizer {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// 为选择 / 填空 / 简答 / 听力题生成答案
    pub async fn synthesize(&self, question: &Question) -> Result<Answer, SynthesizeError> {
        self.synthesize_with_context(question, None).await
    }

    /// 带听力原文生成答案
    ///
    /// # 参数
    /// - `transcript`: 听力材料的转写文本（没有时按纯文本作答）
    pub async fn synthesize_with_context(
        &self,
        question: &Question,
        transcript: Option<&str>,
    ) -> Result<Answer, SynthesizeError> {
        let shape = question.shape();
        let unsupported = match shape.kind {
            QuestionKind::Speaking => Some("口语题的答案需要经过语音合成"),
            QuestionKind::SelfCheck => Some("自查清单不需要模型作答"),
            _ => None,
        };
        if let Some(reason) = unsupported {
            return Err(ParseError {
                kind: question.kind,
                response: String::new(),
                reason: reason.to_string(),
            }
            .into());
        }

        let payload = self
            .ask(
                question.kind,
                |strict| build_prompt(question, transcript, strict),
                |response| parse_response(&shape, response),
            )
            .await?;

        Answer::new(question, payload).map_err(|e| {
            ParseError {
                kind: question.kind,
                response: String::new(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// 口语题：每个作答位置要朗读的文本
    ///
    /// 有参考句子的（跟读）直接使用参考句子，不调用模型。
    pub async fn compose_speech(
        &self,
        question: &Question,
        transcript: Option<&str>,
    ) -> Result<Vec<String>, SynthesizeError> {
        let mut texts = Vec::with_capacity(question.slot_count());
        for (i, slot) in question.slots.iter().enumerate() {
            if let Some(reference) = slot.reference_text.as_deref().filter(|r| !r.trim().is_empty()) {
                debug!("第 {} 段使用参考句子: {}", i + 1, truncate_text(reference, 40));
                texts.push(reference.trim().to_string());
                continue;
            }
            let text = self
                .ask(
                    question.kind,
                    |strict| build_speech_prompt(question, slot, transcript, strict),
                    parse_plain_text,
                )
                .await?;
            texts.push(text);
        }
        Ok(texts)
    }

    async fn ask<T>(
        &self,
        kind: QuestionKind,
        prompt: impl Fn(bool) -> String,
        parse: impl Fn(&str) -> Result<T, String>,
    ) -> Result<T, SynthesizeError> {
        let first = self.model.complete(&prompt(false)).await?;
        match parse(&first) {
            Ok(value) => return Ok(value),
            Err(reason) => warn!(
                "⚠️ {} 回复格式不正确 ({}): '{}'，追加格式说明重试一次",
                kind,
                reason,
                truncate_text(&first, 60)
            ),
        }

        let second = self.model.complete(&prompt(true)).await?;
        parse(&second).map_err(|reason| {
            ParseError {
                kind,
                response: second.clone(),
                reason,
            }
            .into()
        })
    }
}

fn push_section(out: &mut String, title: &str, body: &str) {
    if !body.trim().is_empty() {
        out.push_str(&format!("【{}】\n{}\n\n", title, body.trim()));
    }
}

/// 生成题目的提示词
///
/// 同一道题、同一个 `strict` 总是得到同样的提示词。
pub fn build_prompt(question: &Question, transcript: Option<&str>, strict: bool) -> String {
    let shape = question.shape();
    let mut out = format!("请解答以下英语{}。\n\n", question.kind);
    push_section(&mut out, "题目说明", &question.direction);
    push_section(&mut out, "文章或材料", &question.context);
    push_section(&mut out, "听力原文", transcript.unwrap_or_default());
    push_section(&mut out, "题目", &question.prompt);

    let format = if shape.expects_choice() {
        out.push_str(&format!("【共 {} 道小题】\n", question.slot_count()));
        for (i, slot) in question.slots.iter().enumerate() {
            let mark = if slot.multi { "（多选）" } else { "" };
            out.push_str(&format!("第 {} 题{}: {}\n", i + 1, mark, slot.prompt.trim()));
            push_options(&mut out, &slot.options);
        }
        CHOICE_FORMAT
    } else if shape.kind == QuestionKind::Ordering {
        out.push_str("【待排序条目】\n");
        if let Some(slot) = question.slots.first() {
            push_options(&mut out, &slot.options);
        }
        ORDER_FORMAT
    } else if uses_plain_text(&shape) {
        if let Some(slot) = question.slots.first() {
            push_section(&mut out, "问题", &slot.prompt);
        }
        TEXT_FORMAT
    } else {
        out.push_str(&format!("【共 {} 个空】\n", question.slot_count()));
        for (i, slot) in question.slots.iter().enumerate() {
            if !slot.prompt.trim().is_empty() {
                out.push_str(&format!("第 {} 空: {}\n", i + 1, slot.prompt.trim()));
            }
        }
        LIST_FORMAT
    };

    out.push_str(&format!("\n{}\n", format));
    if strict {
        out.push_str(&format!("\n{}\n", STRICT_REMINDER));
    }
    out
}

fn push_options(out: &mut String, options: &[String]) {
    for (j, option) in options.iter().enumerate() {
        out.push_str(&format!("  {}) {}\n", j, option.trim()));
    }
}

fn build_speech_prompt(
    question: &Question,
    slot: &AnswerSlot,
    transcript: Option<&str>,
    strict: bool,
) -> String {
    let mut out = String::from("请回答以下英语口语题。\n\n");
    push_section(&mut out, "题目说明", &question.direction);
    push_section(&mut out, "文章或材料", &question.context);
    push_section(&mut out, "听力原文", transcript.unwrap_or_default());
    let asked = if slot.prompt.trim().is_empty() {
        &question.prompt
    } else {
        &slot.prompt
    };
    push_section(&mut out, "问题", asked);
    out.push_str(&format!("{}\n", SPEECH_FORMAT));
    if strict {
        out.push_str(&format!("\n{}\n", STRICT_REMINDER));
    }
    out
}

/// 单个开放题按纯文本作答，其余文本题按 JSON 数组
fn uses_plain_text(shape: &QuestionShape) -> bool {
    shape.slot_count() == 1
        && matches!(
            shape.kind,
            QuestionKind::FreeText | QuestionKind::Speaking | QuestionKind::Listening
        )
}

fn strip_code_fence(response: &str) -> &str {
    let trimmed = response.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn parse_plain_text(response: &str) -> Result<String, String> {
    let text = strip_code_fence(response);
    if let Ok(JsonValue::Array(items)) = serde_json::from_str::<JsonValue>(text) {
        if let [JsonValue::String(only)] = items.as_slice() {
            return parse_plain_text(only);
        }
        return Err("期望一段文本，得到 JSON 数组".to_string());
    }
    if text.is_empty() {
        return Err("回复为空".to_string());
    }
    Ok(text.to_string())
}

/// 把模型回复解析为符合题目形状的答案内容
pub fn parse_response(shape: &QuestionShape, response: &str) -> Result<AnswerPayload, String> {
    if shape.expects_choice() {
        return parse_choice(shape, response).map(AnswerPayload::Choice);
    }
    if shape.kind == QuestionKind::Ordering {
        let count = shape.option_counts.first().copied().unwrap_or(0);
        return parse_order(count, response).map(AnswerPayload::Order);
    }
    if uses_plain_text(shape) {
        return parse_plain_text(response).map(|t| AnswerPayload::Text(vec![t]));
    }
    parse_text_list(shape.slot_count(), response).map(AnswerPayload::Text)
}

fn parse_choice(shape: &QuestionShape, response: &str) -> Result<Vec<Vec<usize>>, String> {
    let text = strip_code_fence(response);
    let grammar = Regex::new(r"^\d+(\s*[,+]\s*\d+)*$").map_err(|e| e.to_string())?;
    if !grammar.is_match(text) {
        return Err("不是逗号分隔的选项编号".to_string());
    }
    let parse_group = |group: &str| {
        group
            .split('+')
            .map(|s| s.trim().parse::<usize>().map_err(|e| e.to_string()))
            .collect::<Result<Vec<_>, _>>()
    };
    let mut groups = text.split(',').map(parse_group).collect::<Result<Vec<_>, _>>()?;
    // 只有一道多选小题时 "0,2" 也表示同时选 0 和 2
    if shape.slot_count() == 1 && shape.is_multi(0) {
        groups = vec![groups.concat()];
    }
    if groups.len() != shape.slot_count() {
        return Err(format!(
            "需要 {} 个编号，得到 {} 个",
            shape.slot_count(),
            groups.len()
        ));
    }
    for (i, (group, &count)) in groups.iter().zip(&shape.option_counts).enumerate() {
        if group.len() > 1 && !shape.is_multi(i) {
            return Err(format!("第 {} 题是单选，只能给一个编号", i + 1));
        }
        if let Some(&index) = group.iter().find(|&&index| index >= count) {
            return Err(format!("第 {} 题编号 {} 不在 [0, {}) 内", i + 1, index, count));
        }
        let mut unique = group.clone();
        unique.sort_unstable();
        unique.dedup();
        if unique.len() != group.len() {
            return Err(format!("第 {} 题有重复编号", i + 1));
        }
    }
    Ok(groups)
}

fn parse_order(count: usize, response: &str) -> Result<Vec<usize>, String> {
    let text = strip_code_fence(response);
    let grammar = Regex::new(r"^\d+(\s*,\s*\d+)*$").map_err(|e| e.to_string())?;
    if !grammar.is_match(text) {
        return Err("不是逗号分隔的条目编号".to_string());
    }
    let order = text
        .split(',')
        .map(|s| s.trim().parse::<usize>().map_err(|e| e.to_string()))
        .collect::<Result<Vec<_>, _>>()?;
    let mut sorted = order.clone();
    sorted.sort_unstable();
    if sorted != (0..count).collect::<Vec<_>>() {
        return Err(format!("{:?} 不是 0..{} 的一个排列", order, count));
    }
    Ok(order)
}

fn parse_text_list(expected: usize, response: &str) -> Result<Vec<String>, String> {
    let text = strip_code_fence(response);
    let items: Vec<JsonValue> = serde_json::from_str(text).map_err(|_| "不是 JSON 数组".to_string())?;
    if items.len() != expected {
        return Err(format!("需要 {} 个答案，得到 {} 个", expected, items.len()));
    }
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            JsonValue::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
            JsonValue::Number(n) => Ok(n.to_string()),
            _ => Err(format!("第 {} 个答案为空或不是字符串", i + 1)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use crate::models::QuestionId;
    use crate::testing::ScriptedModel;

    fn question(kind: QuestionKind, slots: Vec<AnswerSlot>) -> Question {
        Question {
            id: QuestionId::new("u1-t1"),
            kind,
            prompt: "Answer the questions.".to_string(),
            direction: "Read and choose.".to_string(),
            context: String::new(),
            media: None,
            slots,
            breadcrumb: vec![],
        }
    }

    fn capital_question() -> Question {
        question(
            QuestionKind::MultipleChoice,
            vec![AnswerSlot {
                prompt: "What is the capital of France?".to_string(),
                options: vec!["Paris".into(), "Lyon".into(), "Nice".into()],
                ..Default::default()
            }],
        )
    }

    fn cities_question() -> Question {
        question(
            QuestionKind::MultipleChoice,
            vec![AnswerSlot {
                prompt: "Which cities are in France?".to_string(),
                options: vec!["Paris".into(), "Berlin".into(), "Lyon".into(), "Rome".into()],
                multi: true,
                ..Default::default()
            }],
        )
    }

    fn shape(option_counts: Vec<usize>, multi: Vec<bool>) -> QuestionShape {
        QuestionShape {
            kind: QuestionKind::MultipleChoice,
            option_counts,
            multi,
        }
    }

    fn blanks(n: usize) -> Vec<AnswerSlot> {
        (0..n).map(|_| AnswerSlot::default()).collect()
    }

    #[tokio::test]
    async fn test_index_reply_maps_to_selected_option() {
        let model = Arc::new(ScriptedModel::replying(&["0"]));
        let synth = AnswerSynthesizer::new(model.clone());
        let answer = synth.synthesize(&capital_question()).await.unwrap();
        assert_eq!(answer.selected(), Some(&[vec![0usize]][..]));
        assert_eq!(model.prompts().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_reply_reprompts_once_then_succeeds() {
        let model = Arc::new(ScriptedModel::replying(&["maybe B", "1"]));
        let synth = AnswerSynthesizer::new(model.clone());
        let answer = synth.synthesize(&capital_question()).await.unwrap();
        assert_eq!(answer.selected(), Some(&[vec![1usize]][..]));

        let prompts = model.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(!prompts[0].contains(STRICT_REMINDER));
        assert!(prompts[1].contains(STRICT_REMINDER));
    }

    #[tokio::test]
    async fn test_malformed_reply_twice_is_parse_error() {
        let model = Arc::new(ScriptedModel::replying(&["maybe B", "maybe B", "0"]));
        let synth = AnswerSynthesizer::new(model.clone());
        let err = synth.synthesize(&capital_question()).await.unwrap_err();
        assert!(matches!(err, SynthesizeError::Parse(_)));
        assert_eq!(model.prompts().len(), 2);
    }

    #[tokio::test]
    async fn test_out_of_range_index_is_rejected() {
        let model = Arc::new(ScriptedModel::replying(&["3", "7"]));
        let synth = AnswerSynthesizer::new(model);
        assert!(synth.synthesize(&capital_question()).await.is_err());
    }

    #[tokio::test]
    async fn test_model_error_is_not_retried() {
        let model = Arc::new(ScriptedModel::new(vec![
            Err(ModelError::Timeout(std::time::Duration::from_secs(1))),
            Ok("0".to_string()),
        ]));
        let synth = AnswerSynthesizer::new(model.clone());
        let err = synth.synthesize(&capital_question()).await.unwrap_err();
        assert!(matches!(err, SynthesizeError::Model(_)));
        assert_eq!(model.prompts().len(), 1);
    }

    #[tokio::test]
    async fn test_fill_blank_list() {
        let model = Arc::new(ScriptedModel::replying(&["```json\n[\"on\", \"beside\"]\n```"]));
        let synth = AnswerSynthesizer::new(model);
        let q = question(QuestionKind::FillBlank, blanks(2));
        let answer = synth.synthesize(&q).await.unwrap();
        assert_eq!(
            answer.payload(),
            &AnswerPayload::Text(vec!["on".to_string(), "beside".to_string()])
        );
    }

    #[tokio::test]
    async fn test_fill_blank_wrong_length_reprompts() {
        let model = Arc::new(ScriptedModel::replying(&["[\"on\"]", "[\"on\", \"at\"]"]));
        let synth = AnswerSynthesizer::new(model.clone());
        let q = question(QuestionKind::FillBlank, blanks(2));
        assert!(synth.synthesize(&q).await.is_ok());
        assert_eq!(model.prompts().len(), 2);
    }

    #[tokio::test]
    async fn test_free_text_is_trimmed() {
        let model = Arc::new(ScriptedModel::replying(&["  I think so.  \n"]));
        let synth = AnswerSynthesizer::new(model);
        let q = question(QuestionKind::FreeText, blanks(1));
        let answer = synth.synthesize(&q).await.unwrap();
        assert_eq!(answer.payload(), &AnswerPayload::Text(vec!["I think so.".to_string()]));
    }

    #[tokio::test]
    async fn test_read_aloud_skips_model() {
        let model = Arc::new(ScriptedModel::replying(&["Because it is fun."]));
        let synth = AnswerSynthesizer::new(model.clone());
        let q = question(
            QuestionKind::Speaking,
            vec![
                AnswerSlot {
                    reference_text: Some("Practice makes perfect.".to_string()),
                    ..Default::default()
                },
                AnswerSlot {
                    prompt: "Why do you like English?".to_string(),
                    ..Default::default()
                },
            ],
        );
        let texts = synth.compose_speech(&q, None).await.unwrap();
        assert_eq!(texts, vec!["Practice makes perfect.", "Because it is fun."]);
        assert_eq!(model.prompts().len(), 1);
    }

    #[test]
    fn test_prompt_is_deterministic_and_lists_options() {
        let q = capital_question();
        let a = build_prompt(&q, None, false);
        assert_eq!(a, build_prompt(&q, None, false));
        assert!(a.contains("0) Paris"));
        assert!(a.contains("2) Nice"));
        assert!(build_prompt(&q, Some("Paris is lovely."), false).contains("【听力原文】"));
    }

    #[tokio::test]
    async fn test_multi_choice_reply_selects_every_index() {
        let model = Arc::new(ScriptedModel::replying(&["0,2"]));
        let synth = AnswerSynthesizer::new(model.clone());
        let q = cities_question();
        let answer = synth.synthesize(&q).await.unwrap();
        assert_eq!(answer.selected(), Some(&[vec![0usize, 2]][..]));
        assert_eq!(model.prompts().len(), 1);
        assert!(model.prompts()[0].contains("第 1 题（多选）"));
    }

    #[tokio::test]
    async fn test_single_choice_rejects_two_indices() {
        let model = Arc::new(ScriptedModel::replying(&["0,2", "0,2"]));
        let synth = AnswerSynthesizer::new(model.clone());
        let err = synth.synthesize(&capital_question()).await.unwrap_err();
        match err {
            SynthesizeError::Parse(e) => assert!(e.reason.contains("需要 1 个编号")),
            other => panic!("应当是解析错误: {:?}", other),
        }
        assert_eq!(model.prompts().len(), 2);
    }

    #[tokio::test]
    async fn test_ordering_reply_is_permutation() {
        let model = Arc::new(ScriptedModel::replying(&["2,0", "2, 0, 1"]));
        let synth = AnswerSynthesizer::new(model.clone());
        let q = question(
            QuestionKind::Ordering,
            vec![AnswerSlot {
                options: vec!["Then he left.".into(), "Finally he slept.".into(), "First he woke up.".into()],
                ..Default::default()
            }],
        );
        let answer = synth.synthesize(&q).await.unwrap();
        assert_eq!(answer.payload(), &AnswerPayload::Order(vec![2, 0, 1]));
        let prompts = model.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0].contains("【待排序条目】"));
        assert!(prompts[0].contains("2) First he woke up."));
    }

    #[tokio::test]
    async fn test_self_check_is_not_sent_to_model() {
        let model = Arc::new(ScriptedModel::replying(&["0"]));
        let synth = AnswerSynthesizer::new(model.clone());
        let q = question(QuestionKind::SelfCheck, blanks(1));
        assert!(synth.synthesize(&q).await.is_err());
        assert!(model.prompts().is_empty());
    }

    #[test]
    fn test_choice_grammar() {
        let two = shape(vec![4, 3], vec![false, false]);
        assert_eq!(parse_choice(&two, "1, 2").unwrap(), vec![vec![1], vec![2]]);
        assert!(parse_choice(&two, "1").is_err());
        assert!(parse_choice(&two, "1,3").is_err());
        assert!(parse_choice(&two, "1+2,0").is_err());
        assert!(parse_choice(&two, "A,B").is_err());
        assert!(parse_choice(&two, "answer: 1,2").is_err());

        let mixed = shape(vec![4, 3], vec![true, false]);
        assert_eq!(parse_choice(&mixed, "0+3, 1").unwrap(), vec![vec![0, 3], vec![1]]);
        assert!(parse_choice(&mixed, "0+0,1").is_err());

        let one_multi = shape(vec![4], vec![true]);
        assert_eq!(parse_choice(&one_multi, "0,2").unwrap(), vec![vec![0, 2]]);
        assert_eq!(parse_choice(&one_multi, "1+3").unwrap(), vec![vec![1, 3]]);
        assert!(parse_choice(&one_multi, "0,4").is_err());
    }

    #[test]
    fn test_order_grammar() {
        assert_eq!(parse_order(3, "1,2,0").unwrap(), vec![1, 2, 0]);
        assert!(parse_order(3, "1,1,0").is_err());
        assert!(parse_order(3, "0,1").is_err());
        assert!(parse_order(3, "B,A,C").is_err());
    }
}
