use std::sync::Arc;

use anyhow::{Context, Result};
use chromiumoxide::Browser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::browser;
use crate::config::Config;
use crate::infrastructure::{JsExecutor, PageDriver};
use crate::models::{Credentials, RunReport};
use crate::orchestrator::engine::AnswerOrchestrationEngine;
use crate::services::{
    AnswerCache, AudioBridge, LlmService, NavigationController, Navigator, PiperAudioBridge,
    QuestionExtractor, ReportWriter, SubmissionEngine,
};
use crate::utils::logging::{init_log_file, log_startup, print_final_stats};
use crate::workflow::{QuestionFlow, RetryPolicy};

/// 应用主结构
///
/// 唯一持有浏览器的地方，其余组件只拿到 `PageDriver`。
pub struct App {
    config: Config,
    credentials: Arc<Credentials>,
    _browser: Browser,
    navigator: Arc<dyn Navigator>,
    engine: AnswerOrchestrationEngine,
}

impl App {
    /// 初始化应用
    pub async fn initialize(config: Config, credentials: Credentials) -> Result<Self> {
        init_log_file(&config.output_log_file)
            .with_context(|| format!("初始化日志文件失败: {}", config.output_log_file))?;
        log_startup(&config);

        if config.llm_api_key.is_empty() {
            warn!("⚠️ 未设置 LLM_API_KEY，只能使用缓存答案和跟读题");
        }

        let (browser, page) = browser::open_browser(&config).await?;
        let driver: Arc<dyn PageDriver> = Arc::new(JsExecutor::new(page));

        let navigator: Arc<dyn Navigator> = Arc::new(NavigationController::new(driver.clone(), &config));
        let extractor = Arc::new(
            QuestionExtractor::new(driver.clone(), config.selectors.clone())
                .with_budget(config.page_timeout(), config.poll_interval()),
        );
        let submitter = Arc::new(SubmissionEngine::new(driver, extractor.clone(), &config));
        let audio = Arc::new(PiperAudioBridge::new(&config));
        if let Err(e) = audio.warm_up().await {
            warn!("⚠️ 语音引擎不可用，口语题将失败: {}", e);
        }
        let cache = Arc::new(AnswerCache::load(&config.answer_cache_file));

        let flow = QuestionFlow::new(
            navigator.clone(),
            extractor,
            Arc::new(LlmService::new(&config)),
            audio,
            submitter,
            RetryPolicy::from_config(&config),
        )
        .with_cache(cache, config.force_ai);

        Ok(Self {
            engine: AnswerOrchestrationEngine::new(navigator.clone(), flow),
            credentials: Arc::new(credentials),
            navigator,
            config,
            _browser: browser,
        })
    }

    /// 登录并处理所有题目，结束后写运行报告
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunReport> {
        let mut session = self
            .navigator
            .authenticate(self.credentials.clone())
            .await
            .context("登录失败")?;

        let report = self.engine.run(&mut session, cancel).await;

        ReportWriter::new(&self.config.report_file, &self.config.output_log_file)
            .write(&report)
            .context("写入运行报告失败")?;
        info!("📄 运行报告: {}", self.config.report_file);
        print_final_stats(&report, &self.config.output_log_file);

        Ok(report)
    }
}
