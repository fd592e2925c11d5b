//! 题目处理流程 - 流程层
//!
//! 核心职责：定义"一道题"的完整处理流程
//!
//! 流程顺序：
//! 1. 进入任务页 → 确认可取题
//! 2. 取题（无需作答的页面记为跳过）
//! 3. 缓存命中则直接使用，否则调用 LLM / 语音合成生成答案
//! 4. 提交；页面已变化时重新取题一次
//! 5. 从答案解析读取正确答案写入缓存，读不到就不写
//!
//! 可恢复的失败按退避重试，超过次数记为失败；登录失效交给引擎处理。
//! 提交按钮点过却没有确认结果时，重试只检查完成标记，不会再次写入。

use std::sync::Arc;

use futures::future::try_join_all;
use tracing::{debug, error, info, warn};

use crate::error::{NavigationError, StepError, SubmissionError};
use crate::models::{Answer, AnswerPayload, AttemptRecord, Location, Question, QuestionKind, Session};
use crate::services::answer_cache::cached_payload;
use crate::services::{
    AnswerCache, AnswerSynthesizer, AudioBridge, Extraction, Extractor, LanguageModel, Navigator,
    Submitter, VoiceParams,
};
use crate::utils::logging::truncate_text;
use crate::workflow::question_ctx::QuestionCtx;
use crate::workflow::retry::{QuestionAttempt, RetryPolicy};

/// 题目处理流程
///
/// - 编排一道题的完整处理流程
/// - 决定何时用缓存、何时调用模型、何时退回纯文本
/// - 不持有浏览器，只依赖业务能力（services）
pub struct QuestionFlow {
    navigator: Arc<dyn Navigator>,
    extractor: Arc<dyn Extractor>,
    synthesizer: AnswerSynthesizer,
    audio: Arc<dyn AudioBridge>,
    submitter: Arc<dyn Submitter>,
    cache: Option<Arc<AnswerCache>>,
    force_ai: bool,
    policy: RetryPolicy,
}

impl QuestionFlow {
    pub fn new(
        navigator: Arc<dyn Navigator>,
        extractor: Arc<dyn Extractor>,
        model: Arc<dyn LanguageModel>,
        audio: Arc<dyn AudioBridge>,
        submitter: Arc<dyn Submitter>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            navigator,
            extractor,
            synthesizer: AnswerSynthesizer::new(model),
            audio,
            submitter,
            cache: None,
            force_ai: false,
            policy,
        }
    }

    /// 启用答案缓存；`force_ai` 为 true 时只写不读
    pub fn with_cache(mut self, cache: Arc<AnswerCache>, force_ai: bool) -> Self {
        self.cache = Some(cache);
        self.force_ai = force_ai;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 处理一道题直到提交、跳过或重试耗尽
    ///
    /// # 参数
    /// - `attempt`: 本题的尝试记录，重新登录后继续使用同一个
    ///
    /// # 返回
    /// 返回本题的记录；只有登录失效时返回 `Err`
    pub async fn run(
        &self,
        session: &mut Session,
        location: &Location,
        attempt: &mut QuestionAttempt,
    ) -> Result<AttemptRecord, StepError> {
        loop {
            let ctx = QuestionCtx::new(location.clone(), attempt.begin());
            match self.attempt_once(session, &ctx, attempt).await {
                Ok(record) => {
                    return Ok(record
                        .with_kind(attempt.kind)
                        .with_retry_count(attempt.retry_count()))
                }
                Err(e) if e.is_auth() => {
                    warn!("{} 🔒 登录失效: {}", ctx, e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("{} ❌ {}", ctx, e);
                    if e.submit_dispatched() {
                        attempt.submit_dispatched = true;
                    }
                    self.navigator.recover(session).await;
                    match attempt.fail(&self.policy) {
                        Some(delay) => {
                            info!("{} ⏳ {:?} 后重试", ctx, delay);
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            error!("{} ❌ 已尝试 {} 次，放弃本题", ctx, attempt.attempts);
                            return Ok(AttemptRecord::failed(attempt.question_id.clone(), e.reason())
                                .with_kind(attempt.kind)
                                .with_retry_count(attempt.retry_count()));
                        }
                    }
                }
            }
        }
    }

    async fn extract(
        &self,
        ctx: &QuestionCtx,
        attempt: &mut QuestionAttempt,
    ) -> Result<Result<Question, AttemptRecord>, StepError> {
        match self.extractor.extract(&ctx.location).await? {
            Extraction::Question(question) => {
                attempt.kind = Some(question.kind);
                info!(
                    "{} 📝 {}: {}",
                    ctx,
                    question.kind,
                    truncate_text(&question.prompt, 50)
                );
                Ok(Ok(question))
            }
            Extraction::NothingToAnswer(reason) => {
                info!("{} ⏭️ {}", ctx, reason);
                Ok(Err(AttemptRecord::skipped(ctx.location.question_id(), reason)))
            }
        }
    }

    async fn attempt_once(
        &self,
        session: &mut Session,
        ctx: &QuestionCtx,
        attempt: &mut QuestionAttempt,
    ) -> Result<AttemptRecord, StepError> {
        let location = &ctx.location;
        self.navigator.enter(session, location).await?;
        if !self.navigator.current_question_ready(session).await {
            return Err(NavigationError::NotReady.into());
        }

        if attempt.submit_dispatched {
            return self.settle_dispatched(session, ctx, attempt).await;
        }

        let mut question = match self.extract(ctx, attempt).await? {
            Ok(question) => question,
            Err(skipped) => return Ok(skipped),
        };

        let mut refreshed = false;
        loop {
            let answer = self.produce_answer(&question, ctx).await?;
            match self.submitter.submit(location, answer).await {
                Ok(record) => {
                    self.navigator.mark_submitted(session).await?;
                    if let Some(cache) = &self.cache {
                        self.store_correct(cache, &question, ctx).await;
                    }
                    return Ok(record);
                }
                Err(SubmissionError::ShapeMismatch(mismatch)) if !refreshed => {
                    warn!("{} 🔄 {}，重新取题", ctx, mismatch);
                    refreshed = true;
                    question = match self.extract(ctx, attempt).await? {
                        Ok(question) => question,
                        Err(skipped) => return Ok(skipped),
                    };
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// 上一次已经点过提交：只看页面是否已有完成标记，不再写入
    async fn settle_dispatched(
        &self,
        session: &mut Session,
        ctx: &QuestionCtx,
        attempt: &QuestionAttempt,
    ) -> Result<AttemptRecord, StepError> {
        let id = attempt.question_id.clone();
        let (Some(kind), true) = (attempt.kind, self.submitter.already_submitted().await?) else {
            warn!("{} ⚠️ 提交状态未知，不再重复提交", ctx);
            return Ok(AttemptRecord::failed(id, "submission: 提交状态未知，不再重复提交"));
        };
        self.navigator.mark_submitted(session).await?;
        info!("{} ✓ 页面已有完成标记，按已提交记录", ctx);
        Ok(AttemptRecord::submitted(id, kind))
    }

    /// 缓存答案解析中的正确答案；解析页读不到或无法还原成答案时不写入
    async fn store_correct(&self, cache: &AnswerCache, question: &Question, ctx: &QuestionCtx) {
        if matches!(question.kind, QuestionKind::Speaking | QuestionKind::SelfCheck) {
            return;
        }
        let answers = match self.extractor.correct_answers(question).await {
            Ok(Some(answers)) => answers,
            Ok(None) => {
                warn!("{} ⚠️ 未读取到正确答案，不写入缓存", ctx);
                return;
            }
            Err(e) => {
                warn!("{} ⚠️ 读取答案解析失败，不写入缓存: {}", ctx, e);
                return;
            }
        };
        let usable = cached_payload(question, &answers)
            .map(|payload| Answer::new(question, payload).is_ok())
            .unwrap_or(false);
        if !usable {
            warn!("{} ⚠️ 正确答案 {:?} 与题目不符，不写入缓存", ctx, answers);
            return;
        }
        match cache.store(question, answers).await {
            Ok(()) => info!("{} 💾 已缓存正确答案", ctx),
            Err(e) => warn!("{} ⚠️ 写入缓存失败: {}", ctx, e),
        }
    }

    fn cached(&self, question: &Question) -> Option<Vec<String>> {
        if self.force_ai || matches!(question.kind, QuestionKind::Speaking | QuestionKind::SelfCheck) {
            return None;
        }
        self.cache.as_ref()?.lookup(question)
    }

    async fn produce_answer(&self, question: &Question, ctx: &QuestionCtx) -> Result<Answer, StepError> {
        match question.kind {
            QuestionKind::SelfCheck => {
                return Answer::new(question, AnswerPayload::CheckAll)
                    .map_err(|e| StepError::Submission(e.into()));
            }
            QuestionKind::Speaking => return self.speak_answer(question, ctx).await,
            _ => {}
        }

        if let Some(payload) = self.cached(question).and_then(|answers| cached_payload(question, &answers)) {
            match Answer::new(question, payload) {
                Ok(answer) => {
                    info!("{} 💾 使用缓存答案", ctx);
                    return Ok(answer);
                }
                Err(e) => warn!("{} ⚠️ 缓存答案不可用: {}", ctx, e),
            }
        }

        let transcript = if question.media.is_some() {
            self.transcript(question, ctx).await
        } else {
            None
        };
        let answer = self
            .synthesizer
            .synthesize_with_context(question, transcript.as_deref())
            .await?;
        debug!("{} 🤖 LLM 答案: {:?}", ctx, answer.to_strings());
        Ok(answer)
    }

    /// 听力原文；下载或转写失败时返回 None，按纯文本作答
    async fn transcript(&self, question: &Question, ctx: &QuestionCtx) -> Option<String> {
        let media = question.media.as_ref()?;
        let bytes = match self.extractor.load_media(media).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("{} ⚠️ 读取听力材料失败，按纯文本作答: {}", ctx, e);
                return None;
            }
        };
        match self.audio.transcribe(&bytes).await {
            Ok(text) => {
                info!("{} 🎧 听力原文: {}", ctx, truncate_text(&text, 60));
                Some(text)
            }
            Err(e) => {
                warn!("{} ⚠️ 听力转写失败，按纯文本作答: {}", ctx, e);
                None
            }
        }
    }

    /// 口语题：生成朗读文本与检查语音引擎并行，再合成每段语音
    async fn speak_answer(&self, question: &Question, ctx: &QuestionCtx) -> Result<Answer, StepError> {
        let (texts, ready) = tokio::join!(
            self.synthesizer.compose_speech(question, None),
            self.audio.warm_up()
        );
        ready?;
        let texts = texts?;

        let params = VoiceParams::for_attempt(ctx.attempt);
        debug!("{} 🔊 语音参数: {:?}", ctx, params);
        let clips = try_join_all(texts.iter().map(|text| self.audio.speak_with(text, params))).await?;
        Answer::new(question, AnswerPayload::Audio(clips))
            .map_err(|e| StepError::Submission(e.into()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::{ModelError, ShapeMismatch};
    use crate::models::AttemptOutcome;
    use crate::testing::{
        authenticated_session, location, FakeAudio, FakeSubmitter, ScriptedModel,
        ScriptedNavigator, StaticExtractor,
    };

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    struct Parts {
        navigator: Arc<ScriptedNavigator>,
        extractor: Arc<StaticExtractor>,
        model: Arc<ScriptedModel>,
        audio: Arc<FakeAudio>,
        submitter: Arc<FakeSubmitter>,
    }

    impl Parts {
        fn new(extractor: StaticExtractor, replies: &[&str]) -> Self {
            Self {
                navigator: Arc::new(ScriptedNavigator::default()),
                extractor: Arc::new(extractor),
                model: Arc::new(ScriptedModel::replying(replies)),
                audio: Arc::new(FakeAudio::default()),
                submitter: Arc::new(FakeSubmitter::default()),
            }
        }

        fn flow(&self, max_attempts: u32) -> QuestionFlow {
            QuestionFlow::new(
                self.navigator.clone(),
                self.extractor.clone(),
                self.model.clone(),
                self.audio.clone(),
                self.submitter.clone(),
                policy(max_attempts),
            )
        }
    }

    async fn run(flow: &QuestionFlow) -> Result<AttemptRecord, StepError> {
        let mut session = authenticated_session();
        let loc = location(0);
        let mut attempt = QuestionAttempt::new(loc.question_id());
        flow.run(&mut session, &loc, &mut attempt).await
    }

    #[tokio::test]
    async fn test_choice_question_is_submitted() {
        let parts = Parts::new(StaticExtractor::default(), &["0"]);
        let record = run(&parts.flow(3)).await.unwrap();
        assert_eq!(record.outcome, AttemptOutcome::Submitted);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.kind, Some(QuestionKind::MultipleChoice));
        assert_eq!(parts.submitter.answers()[0].selected(), Some(&[vec![0usize]][..]));
    }

    #[tokio::test]
    async fn test_nothing_to_answer_is_skipped() {
        let extractor = StaticExtractor {
            nothing_for: vec![0],
            ..Default::default()
        };
        let parts = Parts::new(extractor, &[]);
        let record = run(&parts.flow(3)).await.unwrap();
        assert_eq!(record.outcome, AttemptOutcome::Skipped);
        assert!(parts.model.prompts().is_empty());
        assert!(parts.submitter.answers().is_empty());
    }

    #[tokio::test]
    async fn test_model_failure_exhausts_retries() {
        let parts = Parts {
            model: Arc::new(ScriptedModel::new(vec![
                Err(ModelError::Timeout(Duration::from_secs(60))),
                Err(ModelError::Timeout(Duration::from_secs(60))),
            ])),
            ..Parts::new(StaticExtractor::default(), &[])
        };
        let record = run(&parts.flow(2)).await.unwrap();
        match &record.outcome {
            AttemptOutcome::Failed(reason) => assert!(reason.starts_with("model:")),
            other => panic!("应当失败: {:?}", other),
        }
        assert_eq!(record.retry_count, 1);
        assert_eq!(parts.navigator.enter_count(), 2);
        assert_eq!(*parts.navigator.recovers.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stale_page_is_reextracted_once() {
        let extractor = StaticExtractor::default();
        let parts = Parts {
            submitter: Arc::new(FakeSubmitter::failing_with(vec![Err(ShapeMismatch {
                expected: "2".to_string(),
                found: "1".to_string(),
            }
            .into())])),
            ..Parts::new(extractor, &["1", "2"])
        };
        let record = run(&parts.flow(3)).await.unwrap();
        assert!(record.is_submitted());
        assert_eq!(record.retry_count, 0);
        assert_eq!(parts.extractor.extract_count(), 2);
        assert_eq!(parts.submitter.answers()[0].selected(), Some(&[vec![2usize]][..]));
    }

    #[tokio::test]
    async fn test_session_expiry_is_returned() {
        let parts = Parts::new(StaticExtractor::default(), &["0"]);
        let navigator = ScriptedNavigator::default().script_enter(vec![Err(NavigationError::SessionExpired)]);
        let parts = Parts {
            navigator: Arc::new(navigator),
            ..parts
        };
        let err = run(&parts.flow(3)).await.unwrap_err();
        assert!(err.is_auth());
        assert_eq!(*parts.navigator.recovers.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_listening_falls_back_to_text_only() {
        let parts = Parts::new(StaticExtractor::of_kind(QuestionKind::Listening), &["The speaker is late."]);
        let record = run(&parts.flow(3)).await.unwrap();
        assert!(record.is_submitted());
        let prompts = parts.model.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(!prompts[0].contains("听力原文"));
    }

    #[tokio::test]
    async fn test_listening_uses_transcript() {
        let parts = Parts {
            audio: Arc::new(FakeAudio {
                transcript: Some("Tom missed the bus this morning.".to_string()),
                ..Default::default()
            }),
            ..Parts::new(StaticExtractor::of_kind(QuestionKind::Listening), &["Tom missed the bus."])
        };
        run(&parts.flow(3)).await.unwrap();
        assert!(parts.model.prompts()[0].contains("Tom missed the bus this morning."));
    }

    #[tokio::test]
    async fn test_read_aloud_speaks_reference_without_model() {
        let parts = Parts::new(StaticExtractor::of_kind(QuestionKind::Speaking), &[]);
        let record = run(&parts.flow(3)).await.unwrap();
        assert!(record.is_submitted());
        assert!(parts.model.prompts().is_empty());
        let spoken = parts.audio.spoken.lock().unwrap().clone();
        assert_eq!(spoken[0].0, "Good morning, everyone.");
        assert_eq!(spoken[0].1, VoiceParams::for_attempt(1));
        match parts.submitter.answers()[0].payload() {
            AnswerPayload::Audio(clips) => assert!(!clips[0].bytes.is_empty()),
            other => panic!("应当是语音答案: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cache_hit_bypasses_model() {
        let path = std::env::temp_dir().join(format!("auto_answer_flow_cache_{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{"Unit 1 -> Task 1": {"type": "multiple_choice", "answers": ["C"]}}"#,
        )
        .unwrap();
        let parts = Parts::new(StaticExtractor::default(), &[]);
        let flow = parts.flow(3).with_cache(Arc::new(AnswerCache::load(&path)), false);
        let record = run(&flow).await.unwrap();
        assert!(record.is_submitted());
        assert!(parts.model.prompts().is_empty());
        assert_eq!(parts.submitter.answers()[0].selected(), Some(&[vec![2usize]][..]));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_force_ai_ignores_cache_and_updates_it() {
        let path = std::env::temp_dir().join(format!("auto_answer_flow_force_{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{"Unit 1 -> Task 1": {"type": "multiple_choice", "answers": ["2"]}}"#,
        )
        .unwrap();
        let extractor = StaticExtractor {
            correct: Some(vec!["A".to_string()]),
            ..Default::default()
        };
        let parts = Parts::new(extractor, &["1"]);
        let cache = Arc::new(AnswerCache::load(&path));
        let flow = parts.flow(3).with_cache(cache.clone(), true);
        run(&flow).await.unwrap();
        assert_eq!(parts.model.prompts().len(), 1);
        assert_eq!(parts.submitter.answers()[0].selected(), Some(&[vec![1usize]][..]));
        // 缓存的是解析页的正确答案，不是模型给出的 1
        let q = parts.extractor.question(&location(0));
        assert_eq!(cache.lookup(&q), Some(vec!["A".to_string()]));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_unreadable_analysis_is_not_cached() {
        let path = std::env::temp_dir().join(format!("auto_answer_flow_noanalysis_{}.json", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let parts = Parts::new(StaticExtractor::default(), &["1"]);
        let cache = Arc::new(AnswerCache::load(&path));
        let record = run(&parts.flow(3).with_cache(cache.clone(), false)).await.unwrap();
        assert!(record.is_submitted());
        assert!(cache.is_empty());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_wrong_shaped_analysis_is_not_cached() {
        let path = std::env::temp_dir().join(format!("auto_answer_flow_badanalysis_{}.json", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let extractor = StaticExtractor {
            correct: Some(vec!["F".to_string()]),
            ..Default::default()
        };
        let parts = Parts::new(extractor, &["0"]);
        let cache = Arc::new(AnswerCache::load(&path));
        run(&parts.flow(3).with_cache(cache.clone(), false)).await.unwrap();
        assert!(cache.is_empty());
    }

    fn unconfirmed(clicked: bool) -> SubmissionError {
        SubmissionError::NotConfirmed {
            reason: "等待 .question-common-abs-analysis 超时".to_string(),
            clicked,
        }
    }

    #[tokio::test]
    async fn test_unconfirmed_click_is_never_resubmitted() {
        let parts = Parts {
            submitter: Arc::new(FakeSubmitter::failing_with(vec![Err(unconfirmed(true))])),
            ..Parts::new(StaticExtractor::default(), &["0", "0"])
        };
        let record = run(&parts.flow(3)).await.unwrap();
        assert_eq!(parts.submitter.call_count(), 1);
        match &record.outcome {
            AttemptOutcome::Failed(reason) => assert!(reason.contains("不再重复提交")),
            other => panic!("应当失败: {:?}", other),
        }
        assert_eq!(record.retry_count, 1);
        assert_eq!(parts.navigator.enter_count(), 2);
    }

    #[tokio::test]
    async fn test_unconfirmed_click_with_marker_counts_as_submitted() {
        let submitter = FakeSubmitter::failing_with(vec![Err(unconfirmed(true))]).with_already_submitted();
        let parts = Parts {
            submitter: Arc::new(submitter),
            ..Parts::new(StaticExtractor::default(), &["0"])
        };
        let record = run(&parts.flow(3)).await.unwrap();
        assert!(record.is_submitted());
        assert_eq!(record.kind, Some(QuestionKind::MultipleChoice));
        assert_eq!(parts.submitter.call_count(), 1);
        assert_eq!(parts.model.prompts().len(), 1);
    }

    #[tokio::test]
    async fn test_unconfirmed_without_click_is_retried() {
        let parts = Parts {
            submitter: Arc::new(FakeSubmitter::failing_with(vec![Err(unconfirmed(false))])),
            ..Parts::new(StaticExtractor::default(), &["0", "0"])
        };
        let record = run(&parts.flow(3)).await.unwrap();
        assert!(record.is_submitted());
        assert_eq!(parts.submitter.call_count(), 2);
        assert_eq!(parts.submitter.answers().len(), 1);
    }

    #[tokio::test]
    async fn test_self_check_ticks_without_model() {
        let parts = Parts::new(StaticExtractor::of_kind(QuestionKind::SelfCheck), &[]);
        let record = run(&parts.flow(3)).await.unwrap();
        assert!(record.is_submitted());
        assert!(parts.model.prompts().is_empty());
        assert_eq!(parts.submitter.answers()[0].payload(), &AnswerPayload::CheckAll);
    }

    #[tokio::test]
    async fn test_ordering_is_answered_by_model() {
        let parts = Parts::new(StaticExtractor::of_kind(QuestionKind::Ordering), &["1,0,2"]);
        let record = run(&parts.flow(3)).await.unwrap();
        assert!(record.is_submitted());
        assert_eq!(parts.submitter.answers()[0].payload(), &AnswerPayload::Order(vec![1, 0, 2]));
    }
}
