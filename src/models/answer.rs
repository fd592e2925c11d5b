use std::time::Duration;

use super::question::{Question, QuestionId, QuestionKind, QuestionShape};
use crate::error::ShapeMismatch;

/// 合成后的语音
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    /// WAV 字节
    pub bytes: Vec<u8>,
    pub duration: Duration,
    /// 语音对应的文本
    pub spoken_text: String,
}

/// 与题型匹配的答案内容，每个作答位置一项
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerPayload {
    /// 每个作答位置选中的选项下标（单选恰好一个，多选至少一个）
    Choice(Vec<Vec<usize>>),
    Text(Vec<String>),
    Audio(Vec<AudioClip>),
    /// 排序题：按正确顺序排列的条目下标
    Order(Vec<usize>),
    /// 自查清单：勾选全部条目
    CheckAll,
}

impl AnswerPayload {
    fn describe(&self) -> String {
        match self {
            AnswerPayload::Choice(v) => format!("选项 x{}", v.len()),
            AnswerPayload::Text(v) => format!("文本 x{}", v.len()),
            AnswerPayload::Audio(v) => format!("语音 x{}", v.len()),
            AnswerPayload::Order(v) => format!("排序 {:?}", v),
            AnswerPayload::CheckAll => "全部勾选".to_string(),
        }
    }

    fn len(&self) -> usize {
        match self {
            AnswerPayload::Choice(v) => v.len(),
            AnswerPayload::Text(v) => v.len(),
            AnswerPayload::Audio(v) => v.len(),
            AnswerPayload::Order(_) | AnswerPayload::CheckAll => 1,
        }
    }
}

/// 一道题的答案
///
/// 只能通过 [`Answer::new`] 构造，构造时保证与题目形状一致；
/// 提交时按值交给提交引擎，只会被消费一次。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    question_id: QuestionId,
    kind: QuestionKind,
    payload: AnswerPayload,
}

impl Answer {
    pub fn new(question: &Question, payload: AnswerPayload) -> Result<Self, ShapeMismatch> {
        check_payload(&question.shape(), &payload)?;
        Ok(Self {
            question_id: question.id.clone(),
            kind: question.kind,
            payload,
        })
    }

    pub fn question_id(&self) -> &QuestionId {
        &self.question_id
    }

    pub fn kind(&self) -> QuestionKind {
        self.kind
    }

    pub fn payload(&self) -> &AnswerPayload {
        &self.payload
    }

    pub fn into_payload(self) -> AnswerPayload {
        self.payload
    }

    /// 选择类答案每个作答位置的下标
    pub fn selected(&self) -> Option<&[Vec<usize>]> {
        match &self.payload {
            AnswerPayload::Choice(v) => Some(v),
            _ => None,
        }
    }

    /// 检查答案能否写入当前渲染的题目
    pub fn fits(&self, live: &QuestionShape) -> Result<(), ShapeMismatch> {
        if live.kind != self.kind {
            return Err(ShapeMismatch {
                expected: self.kind.to_string(),
                found: live.to_string(),
            });
        }
        check_payload(live, &self.payload)
    }

    /// 答案的文本形式，多选的多个下标用 `+` 连接（语音答案写朗读文本）
    pub fn to_strings(&self) -> Vec<String> {
        match &self.payload {
            AnswerPayload::Choice(v) => v.iter().map(|s| join_indices(s, "+")).collect(),
            AnswerPayload::Text(v) => v.clone(),
            AnswerPayload::Audio(v) => v.iter().map(|c| c.spoken_text.clone()).collect(),
            AnswerPayload::Order(v) => vec![join_indices(v, ",")],
            AnswerPayload::CheckAll => vec!["全部勾选".to_string()],
        }
    }
}

fn check_payload(shape: &QuestionShape, payload: &AnswerPayload) -> Result<(), ShapeMismatch> {
    let mismatch = |found: String| ShapeMismatch {
        expected: shape.to_string(),
        found,
    };

    let kind_ok = match payload {
        AnswerPayload::Choice(_) => shape.expects_choice(),
        AnswerPayload::Text(_) => {
            !shape.expects_choice()
                && !matches!(
                    shape.kind,
                    QuestionKind::Speaking | QuestionKind::Ordering | QuestionKind::SelfCheck
                )
        }
        AnswerPayload::Audio(_) => shape.kind == QuestionKind::Speaking,
        AnswerPayload::Order(_) => shape.kind == QuestionKind::Ordering,
        AnswerPayload::CheckAll => shape.kind == QuestionKind::SelfCheck,
    };
    if !kind_ok {
        return Err(mismatch(payload.describe()));
    }
    if payload.len() != shape.slot_count() || payload.len() == 0 {
        return Err(mismatch(payload.describe()));
    }

    match payload {
        AnswerPayload::Choice(selected) => {
            for (slot, (indices, &count)) in selected.iter().zip(&shape.option_counts).enumerate() {
                if indices.is_empty() {
                    return Err(mismatch(format!("第 {} 题没有选择选项", slot + 1)));
                }
                if indices.len() > 1 && !shape.is_multi(slot) {
                    return Err(mismatch(format!("第 {} 题是单选，选了 {} 个", slot + 1, indices.len())));
                }
                if has_duplicates(indices) {
                    return Err(mismatch(format!("第 {} 题有重复的选项", slot + 1)));
                }
                if let Some(&index) = indices.iter().find(|&&i| i >= count) {
                    return Err(mismatch(format!("第 {} 题选项 {} 超出范围", slot + 1, index)));
                }
            }
        }
        AnswerPayload::Text(texts) => {
            if let Some(pos) = texts.iter().position(|t| t.trim().is_empty()) {
                return Err(mismatch(format!("第 {} 空为空文本", pos + 1)));
            }
        }
        AnswerPayload::Audio(clips) => {
            if let Some(pos) = clips.iter().position(|c| c.bytes.is_empty()) {
                return Err(mismatch(format!("第 {} 段语音为空", pos + 1)));
            }
        }
        AnswerPayload::Order(order) => {
            let count = shape.option_counts.first().copied().unwrap_or(0);
            if order.len() != count || has_duplicates(order) || order.iter().any(|&i| i >= count) {
                return Err(mismatch(format!("{:?} 不是 {} 个条目的排列", order, count)));
            }
        }
        AnswerPayload::CheckAll => {}
    }
    Ok(())
}

fn join_indices(indices: &[usize], sep: &str) -> String {
    indices.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(sep)
}

fn has_duplicates(indices: &[usize]) -> bool {
    let mut seen = indices.to_vec();
    seen.sort_unstable();
    seen.windows(2).any(|w| w[0] == w[1])
}
