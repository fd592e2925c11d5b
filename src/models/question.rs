use std::fmt;

use serde::{Deserialize, Serialize};

/// 题目唯一标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuestionId(String);

impl QuestionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QuestionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 题型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuestionKind {
    MultipleChoice,
    FillBlank,
    Listening,
    Speaking,
    FreeText,
    /// 拖拽排序
    Ordering,
    /// Exit Ticket 自查清单
    SelfCheck,
}

impl QuestionKind {
    /// 识别优先级：页面同时出现多种标记时取靠前的
    pub const PRIORITY: [QuestionKind; 7] = [
        QuestionKind::SelfCheck,
        QuestionKind::Ordering,
        QuestionKind::Speaking,
        QuestionKind::Listening,
        QuestionKind::MultipleChoice,
        QuestionKind::FillBlank,
        QuestionKind::FreeText,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            QuestionKind::MultipleChoice => "选择题",
            QuestionKind::FillBlank => "填空题",
            QuestionKind::Listening => "听力题",
            QuestionKind::Speaking => "口语题",
            QuestionKind::FreeText => "简答题",
            QuestionKind::Ordering => "排序题",
            QuestionKind::SelfCheck => "自查清单",
        }
    }

    /// 缓存文件里使用的类型代码
    pub fn code(&self) -> &'static str {
        match self {
            QuestionKind::MultipleChoice => "multiple_choice",
            QuestionKind::FillBlank => "fill_in_the_blank",
            QuestionKind::Listening => "listening",
            QuestionKind::Speaking => "speaking",
            QuestionKind::FreeText => "short_answer",
            QuestionKind::Ordering => "drag_and_drop",
            QuestionKind::SelfCheck => "checkbox_self_check",
        }
    }
}

impl fmt::Display for QuestionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 媒体引用（听力材料）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub url: String,
    /// `audio` 或 `video`
    pub tag: String,
}

/// 一个作答位置：一道小题、一个空、一次录音
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerSlot {
    pub prompt: String,
    /// 选项（非选择类为空）
    pub options: Vec<String>,
    /// 跟读题的参考句子
    pub reference_text: Option<String>,
    /// 多选：可以选中多个选项
    #[serde(default)]
    pub multi: bool,
}

/// 从页面提取出的题目，提取后不再修改
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: QuestionId,
    pub kind: QuestionKind,
    pub prompt: String,
    /// 题目说明
    pub direction: String,
    /// 文章 / 材料
    pub context: String,
    pub media: Option<MediaRef>,
    pub slots: Vec<AnswerSlot>,
    /// 页面面包屑，作为答案缓存的键
    pub breadcrumb: Vec<String>,
}

impl Question {
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn shape(&self) -> QuestionShape {
        QuestionShape::from_slots(self.kind, &self.slots)
    }
}

/// 题目结构的摘要，用于提交前与页面实际渲染的结构比对
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionShape {
    pub kind: QuestionKind,
    /// 每个作答位置的选项数
    pub option_counts: Vec<usize>,
    /// 每个作答位置是否多选
    pub multi: Vec<bool>,
}

impl QuestionShape {
    pub fn from_slots(kind: QuestionKind, slots: &[AnswerSlot]) -> Self {
        Self {
            kind,
            option_counts: slots.iter().map(|s| s.options.len()).collect(),
            multi: slots.iter().map(|s| s.multi).collect(),
        }
    }

    pub fn is_multi(&self, slot: usize) -> bool {
        self.multi.get(slot).copied().unwrap_or(false)
    }

    pub fn slot_count(&self) -> usize {
        self.option_counts.len()
    }

    /// 是否以选项下标作答
    ///
    /// 听力题下面挂的是选择题时也按下标作答。
    pub fn expects_choice(&self) -> bool {
        match self.kind {
            QuestionKind::MultipleChoice => true,
            QuestionKind::Listening => {
                !self.option_counts.is_empty() && self.option_counts.iter().all(|&n| n > 0)
            }
            _ => false,
        }
    }
}

impl fmt::Display for QuestionShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} x{} {:?}", self.kind, self.slot_count(), self.option_counts)
    }
}
