//! 答案缓存服务 - 业务能力层
//!
//! 只负责"按面包屑路径读写正确答案"能力，不关心流程
//!
//! 写入的是提交后答案解析里给出的正确答案，而不是本次提交的内容。
//! 缓存文件是可以手工编辑的 JSON：
//!
//! ```json
//! {
//!   "Unit 1 -> Reading -> Practice 1": { "type": "multiple_choice", "answers": ["A", "BD"] }
//! }
//! ```
//!
//! 选项既可以写字母（`A`、`BD`、`B,D`），也可以写从 0 开始的编号（`0`、`1+3`）。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::models::{AnswerPayload, Question, QuestionKind};

/// 一个任务页的缓存答案
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedAnswer {
    #[serde(rename = "type")]
    pub kind: String,
    pub answers: Vec<String>,
}

/// 答案缓存
pub struct AnswerCache {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, CachedAnswer>>,
}

fn cache_key(question: &Question) -> Option<String> {
    (!question.breadcrumb.is_empty()).then(|| question.breadcrumb.join(" -> "))
}

impl AnswerCache {
    /// 读取缓存文件；文件不存在或损坏时从空缓存开始
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!("⚠️ 缓存文件 {} 解析失败: {}，使用空缓存", path.display(), e);
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        info!("✓ 答案缓存: {} ({} 条)", path.display(), entries.len());
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 查找与题目类型和作答位置数一致的缓存答案
    pub fn lookup(&self, question: &Question) -> Option<Vec<String>> {
        let key = cache_key(question)?;
        let entries = self.entries.lock().ok()?;
        let cached = entries.get(&key)?;
        if cached.kind != question.kind.code() || cached.answers.len() != question.slot_count() {
            debug!("缓存 {} 与当前题目不一致，忽略", key);
            return None;
        }
        debug!("命中缓存: {}", key);
        Some(cached.answers.clone())
    }

    /// 保存正确答案并写回文件
    ///
    /// # 参数
    /// - `answers`: 每个作答位置一项，能被 [`cached_payload`] 还原
    pub async fn store(&self, question: &Question, answers: Vec<String>) -> Result<()> {
        let Some(key) = cache_key(question) else {
            return Ok(());
        };
        let text = {
            let mut entries = self
                .entries
                .lock()
                .map_err(|_| anyhow::anyhow!("答案缓存锁已损坏"))?;
            entries.insert(
                key.clone(),
                CachedAnswer {
                    kind: question.kind.code().to_string(),
                    answers,
                },
            );
            serde_json::to_string_pretty(&*entries)?
        };
        tokio::fs::write(&self.path, text)
            .await
            .with_context(|| format!("写入缓存文件失败: {}", self.path.display()))?;
        debug!("答案已写入缓存: {}", key);
        Ok(())
    }
}

/// 解析一个作答位置的选项：字母（`BD`、`B, D`）或编号（`1+3`）
pub fn parse_option_indices(text: &str) -> Option<Vec<usize>> {
    let mut indices = Vec::new();
    for token in text
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        if token.chars().all(|c| c.is_ascii_digit()) {
            indices.push(token.parse().ok()?);
        } else if token.chars().all(|c| c.is_ascii_alphabetic()) {
            indices.extend(
                token
                    .chars()
                    .map(|c| (c.to_ascii_uppercase() as u8 - b'A') as usize),
            );
        } else {
            return None;
        }
    }
    (!indices.is_empty()).then_some(indices)
}

/// 把缓存字符串还原成答案内容
///
/// 口语题和自查清单不走缓存，返回 None。
pub fn cached_payload(question: &Question, answers: &[String]) -> Option<AnswerPayload> {
    let shape = question.shape();
    if shape.expects_choice() {
        return answers
            .iter()
            .map(|a| parse_option_indices(a))
            .collect::<Option<Vec<_>>>()
            .map(AnswerPayload::Choice);
    }
    match question.kind {
        QuestionKind::Speaking | QuestionKind::SelfCheck => None,
        QuestionKind::Ordering => parse_option_indices(&answers.join(",")).map(AnswerPayload::Order),
        _ => Some(AnswerPayload::Text(answers.to_vec())),
    }
}
