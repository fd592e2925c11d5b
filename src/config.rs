use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// 程序配置文件
///
/// 优先级：环境变量 > TOML 文件 > 默认值
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 浏览器调试端口（0 表示自行启动无头浏览器）
    pub browser_debug_port: u16,
    /// 无头模式下使用的浏览器路径
    pub chrome_executable: Option<String>,
    /// 登录页
    pub login_url: String,
    /// 要处理的课程序号（我的课程列表中的位置）
    pub course_index: usize,
    /// 是否显示详细日志
    pub verbose_logging: bool,
    /// 输出日志文件
    pub output_log_file: String,
    /// 运行报告（JSON）
    pub report_file: String,
    /// 答案缓存
    pub answer_cache_file: String,
    /// 忽略缓存，始终调用 LLM
    pub force_ai: bool,
    // --- LLM 配置 ---
    pub llm_api_key: String,
    pub llm_api_base_url: String,
    pub llm_model_name: String,
    // --- 语音配置 ---
    pub stt_api_key: String,
    pub stt_api_base_url: String,
    pub stt_model_name: String,
    pub piper_executable: String,
    pub piper_model: String,
    // --- 超时与重试 ---
    /// 等待页面标记的预算（秒）
    pub page_timeout_secs: u64,
    /// 轮询页面标记的间隔（毫秒）
    pub poll_interval_ms: u64,
    /// LLM 调用超时（秒）
    pub model_timeout_secs: u64,
    /// 语音合成 / 识别超时（秒）
    pub audio_timeout_secs: u64,
    /// 每道题最多尝试次数（含第一次）
    pub max_attempts: u32,
    /// 退避基数（毫秒）
    pub backoff_base_ms: u64,
    /// 退避上限（毫秒）
    pub backoff_max_ms: u64,
    /// 页面选择器
    pub selectors: Selectors,
    /// 实际读取的配置文件（日志初始化后再输出）
    #[serde(skip)]
    pub loaded_from: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            browser_debug_port: 0,
            chrome_executable: None,
            login_url: "https://ucloud.unipus.cn/home".to_string(),
            course_index: 0,
            verbose_logging: false,
            output_log_file: "output.txt".to_string(),
            report_file: "run_report.json".to_string(),
            answer_cache_file: "answer_cache.json".to_string(),
            force_ai: false,
            llm_api_key: String::new(),
            llm_api_base_url: "https://api.deepseek.com/v1".to_string(),
            llm_model_name: "deepseek-chat".to_string(),
            stt_api_key: String::new(),
            stt_api_base_url: "https://api.openai.com/v1".to_string(),
            stt_model_name: "whisper-1".to_string(),
            piper_executable: "piper/piper".to_string(),
            piper_model: "piper/en_US-lessac-medium.onnx".to_string(),
            page_timeout_secs: 15,
            poll_interval_ms: 250,
            model_timeout_secs: 60,
            audio_timeout_secs: 60,
            max_attempts: 3,
            backoff_base_ms: 1000,
            backoff_max_ms: 15_000,
            selectors: Selectors::default(),
            loaded_from: None,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// 读取 TOML 配置文件（不存在时使用默认值），再叠加环境变量
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let base = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
            let config: Config = toml::from_str(&text)
                .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
            Self {
                loaded_from: Some(path.to_path_buf()),
                ..config
            }
        } else {
            Self::default()
        };
        Ok(base.with_env())
    }

    fn with_env(self) -> Self {
        Self {
            browser_debug_port: env_or("BROWSER_DEBUG_PORT", self.browser_debug_port),
            chrome_executable: std::env::var("CHROME_EXECUTABLE")
                .ok()
                .or(self.chrome_executable),
            login_url: env_or("LOGIN_URL", self.login_url),
            course_index: env_or("COURSE_INDEX", self.course_index),
            verbose_logging: env_or("VERBOSE_LOGGING", self.verbose_logging),
            output_log_file: env_or("OUTPUT_LOG_FILE", self.output_log_file),
            report_file: env_or("REPORT_FILE", self.report_file),
            answer_cache_file: env_or("ANSWER_CACHE_FILE", self.answer_cache_file),
            force_ai: env_or("FORCE_AI", self.force_ai),
            llm_api_key: env_or("LLM_API_KEY", self.llm_api_key),
            llm_api_base_url: env_or("LLM_API_BASE_URL", self.llm_api_base_url),
            llm_model_name: env_or("LLM_MODEL_NAME", self.llm_model_name),
            stt_api_key: env_or("STT_API_KEY", self.stt_api_key),
            stt_api_base_url: env_or("STT_API_BASE_URL", self.stt_api_base_url),
            stt_model_name: env_or("STT_MODEL_NAME", self.stt_model_name),
            piper_executable: env_or("PIPER_EXECUTABLE", self.piper_executable),
            piper_model: env_or("PIPER_MODEL", self.piper_model),
            page_timeout_secs: env_or("PAGE_TIMEOUT_SECS", self.page_timeout_secs),
            poll_interval_ms: env_or("POLL_INTERVAL_MS", self.poll_interval_ms),
            model_timeout_secs: env_or("MODEL_TIMEOUT_SECS", self.model_timeout_secs),
            audio_timeout_secs: env_or("AUDIO_TIMEOUT_SECS", self.audio_timeout_secs),
            max_attempts: env_or("MAX_ATTEMPTS", self.max_attempts),
            backoff_base_ms: env_or("BACKOFF_BASE_MS", self.backoff_base_ms),
            backoff_max_ms: env_or("BACKOFF_MAX_MS", self.backoff_max_ms),
            selectors: self.selectors,
            loaded_from: self.loaded_from,
        }
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }

    pub fn audio_timeout(&self) -> Duration {
        Duration::from_secs(self.audio_timeout_secs)
    }
}

/// 平台页面结构到操作的映射
///
/// 平台改版时只需修改配置文件。
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Selectors {
    // --- 登录 ---
    pub username_input: String,
    pub password_input: String,
    pub agreement_checkbox: String,
    pub login_button: String,
    pub login_popup_button: String,
    /// 登录成功后出现的标记
    pub logged_in_marker: String,
    pub course_card: String,
    pub course_name: String,
    // --- 单元与任务 ---
    pub unit_tab: String,
    pub active_unit: String,
    pub task_item: String,
    pub task_name: String,
    /// 待完成任务必须包含的文字
    pub required_task_text: String,
    /// 已完成任务包含的文字
    pub done_task_text: String,
    /// 名称包含该关键字的单元跳过
    pub skip_unit_keyword: String,
    // --- 弹窗 ---
    pub popup_buttons: Vec<String>,
    pub popup_texts: Vec<String>,
    // --- 题目页 ---
    pub question_ready: String,
    pub direction: String,
    pub article: String,
    pub breadcrumb: String,
    pub no_reply_area: String,
    pub image_options: String,
    pub choice_group: String,
    /// 选项组带有该 class 时为多选
    pub multi_choice_class: String,
    pub choice_option: String,
    pub fill_blank_input: String,
    pub fill_blank_html: String,
    pub free_text_input: String,
    pub free_text_prompt: String,
    pub media: String,
    pub record_button: String,
    pub reference_sentence: String,
    pub score: String,
    /// 口语评测 WebSocket 地址中的关键字
    pub speech_socket_host: String,
    /// 拖拽排序列表
    pub ordering_list: String,
    pub ordering_item: String,
    /// Exit Ticket 自查页面
    pub self_check_view: String,
    pub self_check_unchecked: String,
    /// 需要人工参与、直接跳过的页面
    pub discussion_marker: String,
    pub role_play_marker: String,
    // --- 提交 ---
    pub submit_button: String,
    pub submit_confirm_button: String,
    pub submitted_marker: String,
    // --- 答案解析 ---
    /// 答题小结里进入解析的题号
    pub analysis_entry: String,
    /// 解析页上的每道小题
    pub analysis_item: String,
    /// 小题内的正确答案
    pub analysis_answer: String,
}

impl Default for Selectors {
    fn default() -> Self {
        Self {
            username_input: "input[name='username']".to_string(),
            password_input: "input[name='password']".to_string(),
            agreement_checkbox: "input[type='checkbox']".to_string(),
            login_button: "button#login".to_string(),
            login_popup_button: ".layui-layer-btn0".to_string(),
            logged_in_marker: ".course-card-stu".to_string(),
            course_card: ".course-card-stu".to_string(),
            course_name: ".course-name p".to_string(),
            unit_tab: "[data-index]".to_string(),
            active_unit: ".unipus-tabs_itemActive__x0WVI".to_string(),
            task_item: ".courses-unit_taskItemContainer__gkVix".to_string(),
            task_name: ".courses-unit_taskTypeName__99BXj".to_string(),
            required_task_text: "必修".to_string(),
            done_task_text: "已完成".to_string(),
            skip_unit_keyword: "Test".to_string(),
            popup_buttons: vec![
                ".iKnow".to_string(),
                ".pop-up_pop-up-modal-cheat-notice-content-botton__iS8oJ".to_string(),
            ],
            popup_texts: vec!["我知道了".to_string(), "知道了".to_string()],
            question_ready: ".abs-direction".to_string(),
            direction: ".abs-direction".to_string(),
            article: ".comp-common-article-content".to_string(),
            breadcrumb: ".pc-break-crumb-text".to_string(),
            no_reply_area: ".layoutBody-container:not(.has-reply)".to_string(),
            image_options: "div.html_image_list[data-type='options_images_tmls']".to_string(),
            choice_group: "div.question-common-abs-choice".to_string(),
            multi_choice_class: "multipleChoice".to_string(),
            choice_option: ".option".to_string(),
            fill_blank_input: ".fe-scoop .comp-abs-input input".to_string(),
            fill_blank_html: ".question-common-abs-reply".to_string(),
            free_text_input: "textarea.question-inputbox-input".to_string(),
            free_text_prompt: ".question-inputbox-header .component-htmlview".to_string(),
            media: "audio, video".to_string(),
            record_button: ".button-record".to_string(),
            reference_sentence: ".sentence-html-container".to_string(),
            score: "span.score_layout".to_string(),
            speech_socket_host: "speech.unipus.cn".to_string(),
            ordering_list: "div#sortableListWrapper".to_string(),
            ordering_item: "div.sequence-reply-view-item-text".to_string(),
            self_check_view: ".ticket-view".to_string(),
            self_check_unchecked: ".anticon [data-icon='border']".to_string(),
            discussion_marker: ".discussion-cloud-reply".to_string(),
            role_play_marker: ".question-role-play".to_string(),
            submit_button: ".btn".to_string(),
            submit_confirm_button: ".ant-btn-primary".to_string(),
            submitted_marker: ".question-common-abs-analysis, span.score_layout".to_string(),
            analysis_entry: ".question-common-abs-summary .question-number".to_string(),
            analysis_item: ".question-common-abs-analysis".to_string(),
            analysis_answer: ".analysis-answer-value".to_string(),
        }
    }
}
