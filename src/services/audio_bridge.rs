//! 语音桥接服务 - 业务能力层
//!
//! 文本 → 语音（本地 Piper 引擎），语音 → 文本（兼容 OpenAI 的转写接口）
//!
//! 不保存任何状态，失败可以重试，或在题型允许时退回纯文本作答。

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use phf::phf_map;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{RecognitionError, SynthesisError};
use crate::models::AudioClip;
use crate::utils::logging::truncate_text;

/// Piper 的语速与发音参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceParams {
    pub length_scale: f32,
    pub noise_scale: f32,
    pub noise_w: f32,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            length_scale: 1.0,
            noise_scale: 0.667,
            noise_w: 0.8,
        }
    }
}

/// 口语题重试时依次使用的参数
pub const VOICE_PRESETS: [VoiceParams; 3] = [
    VoiceParams {
        length_scale: 1.0,
        noise_scale: 0.2,
        noise_w: 0.2,
    },
    VoiceParams {
        length_scale: 0.9,
        noise_scale: 0.33,
        noise_w: 0.4,
    },
    VoiceParams {
        length_scale: 1.1,
        noise_scale: 0.1,
        noise_w: 0.1,
    },
];

impl VoiceParams {
    /// 第 `attempt` 次尝试（从 1 开始）使用的参数
    pub fn for_attempt(attempt: u32) -> Self {
        match attempt {
            0 | 1 => Self::default(),
            n => VOICE_PRESETS[(n as usize - 2) % VOICE_PRESETS.len()],
        }
    }
}

/// 语音能力
#[async_trait]
pub trait AudioBridge: Send + Sync {
    async fn speak_with(&self, text: &str, params: VoiceParams) -> Result<AudioClip, SynthesisError>;

    async fn transcribe(&self, audio: &[u8]) -> Result<String, RecognitionError>;

    async fn speak(&self, text: &str) -> Result<AudioClip, SynthesisError> {
        self.speak_with(text, VoiceParams::default()).await
    }

    /// 检查引擎是否可用
    async fn warm_up(&self) -> Result<(), SynthesisError> {
        Ok(())
    }
}

static TTS_REPLACEMENTS: phf::Map<char, &'static str> = phf_map! {
    '—' => "-",
    '–' => "-",
    '…' => "...",
    '「' => "\"",
    '」' => "\"",
    '『' => "\"",
    '』' => "\"",
    '《' => "\"",
    '》' => "\"",
    '〈' => "'",
    '〉' => "'",
    '“' => "\"",
    '”' => "\"",
    '‘' => "'",
    '’' => "'",
    '`' => "'",
    '´' => "'",
    '′' => "'",
    '″' => "\"",
};

/// 把全角 ASCII 折叠成半角
fn fold_fullwidth(c: char) -> char {
    match c as u32 {
        0x3000 => ' ',
        code @ 0xFF01..=0xFF5E => char::from_u32(code - 0xFEE0).unwrap_or(c),
        _ => c,
    }
}

/// 净化送入 TTS 的文本，只保留英文字母、数字和常用标点
pub fn clean_text_for_tts(text: &str) -> String {
    let mut normalized = String::with_capacity(text.len());
    for c in text.chars().map(fold_fullwidth) {
        match TTS_REPLACEMENTS.get(&c) {
            Some(rep) => normalized.push_str(rep),
            None => normalized.push(c),
        }
    }
    let filtered: String = normalized
        .chars()
        .filter(|c| {
            c.is_ascii_alphanumeric()
                || c.is_whitespace()
                || ".,?!'\"():;-".contains(*c)
        })
        .collect();
    filtered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 从 WAV 头计算时长
pub fn wav_duration(bytes: &[u8]) -> Option<Duration> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return None;
    }
    let read_u32 = |at: usize| -> Option<u32> {
        bytes
            .get(at..at + 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    };

    let mut pos = 12;
    let mut byte_rate = None;
    while pos + 8 <= bytes.len() {
        let id = &bytes[pos..pos + 4];
        let size = read_u32(pos + 4)? as usize;
        let body = pos + 8;
        match id {
            b"fmt " => byte_rate = read_u32(body + 8),
            b"data" => {
                let rate = byte_rate.filter(|&r| r > 0)?;
                // 流式写出的 WAV 里 data 长度可能是占位值
                let len = size.min(bytes.len() - body);
                return Some(Duration::from_secs_f64(len as f64 / rate as f64));
            }
            _ => {}
        }
        pos = body + size + (size & 1);
    }
    None
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

static WAV_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Piper + 远程转写 的语音桥
pub struct PiperAudioBridge {
    executable: PathBuf,
    model: PathBuf,
    http: reqwest::Client,
    stt_base_url: String,
    stt_api_key: String,
    stt_model: String,
    timeout: Duration,
}

impl PiperAudioBridge {
    pub fn new(config: &Config) -> Self {
        Self {
            executable: PathBuf::from(&config.piper_executable),
            model: PathBuf::from(&config.piper_model),
            http: reqwest::Client::new(),
            stt_base_url: config.stt_api_base_url.trim_end_matches('/').to_string(),
            stt_api_key: config.stt_api_key.clone(),
            stt_model: config.stt_model_name.clone(),
            timeout: config.audio_timeout(),
        }
    }

    async fn run_piper(&self, text: &str, params: VoiceParams, output: &PathBuf) -> Result<(), SynthesisError> {
        let mut child = Command::new(&self.executable)
            .arg("--model")
            .arg(&self.model)
            .arg("--output_file")
            .arg(output)
            .arg("--length_scale")
            .arg(params.length_scale.to_string())
            .arg("--noise_scale")
            .arg(params.noise_scale.to_string())
            .arg("--noise_w")
            .arg(params.noise_w.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(text.as_bytes()).await?;
        }

        let result = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| SynthesisError::Timeout(self.timeout))??;
        if !result.status.success() {
            return Err(SynthesisError::EngineFailed(
                String::from_utf8_lossy(&result.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl AudioBridge for PiperAudioBridge {
    async fn speak_with(&self, text: &str, params: VoiceParams) -> Result<AudioClip, SynthesisError> {
        let clean = clean_text_for_tts(text);
        if clean.is_empty() {
            warn!("⚠️ 文本 '{}' 净化后为空，跳过语音合成", truncate_text(text, 30));
            return Err(SynthesisError::EmptyText(text.to_string()));
        }
        if !self.executable.exists() {
            return Err(SynthesisError::EngineMissing(self.executable.clone()));
        }

        debug!(
            "Piper 合成语音 (语速: {}, noise_scale: {}, noise_w: {}): '{}'",
            params.length_scale,
            params.noise_scale,
            params.noise_w,
            truncate_text(&clean, 30)
        );

        let output = std::env::temp_dir().join(format!(
            "piper_output_{}_{}.wav",
            std::process::id(),
            WAV_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let result = self.run_piper(&clean, params, &output).await;
        let bytes = match result {
            Ok(()) => tokio::fs::read(&output).await.map_err(SynthesisError::from),
            Err(e) => Err(e),
        };
        let _ = tokio::fs::remove_file(&output).await;
        let bytes = bytes?;

        if bytes.is_empty() {
            return Err(SynthesisError::EngineFailed("输出的 WAV 为空".to_string()));
        }
        let duration = wav_duration(&bytes).unwrap_or_else(|| Duration::from_secs(3));
        debug!("语音合成成功: {} 字节, 时长 {:?}", bytes.len(), duration);

        Ok(AudioClip {
            bytes,
            duration,
            spoken_text: clean,
        })
    }

    async fn transcribe(&self, audio: &[u8]) -> Result<String, RecognitionError> {
        if audio.is_empty() {
            return Err(RecognitionError::Empty);
        }
        let part = reqwest::multipart::Part::bytes(audio.to_vec()).file_name("media.mp3");
        let form = reqwest::multipart::Form::new()
            .text("model", self.stt_model.clone())
            .part("file", part);

        let url = format!("{}/audio/transcriptions", self.stt_base_url);
        debug!("转写媒体: {} 字节 -> {}", audio.len(), url);

        let request = self
            .http
            .post(&url)
            .bearer_auth(&self.stt_api_key)
            .multipart(form)
            .send();
        let response = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| RecognitionError::Timeout(self.timeout))??
            .error_for_status()?;
        let body: TranscriptionResponse = response.json().await?;

        let text = body.text.trim().to_string();
        if text.is_empty() {
            return Err(RecognitionError::Empty);
        }
        Ok(text)
    }

    async fn warm_up(&self) -> Result<(), SynthesisError> {
        for path in [&self.executable, &self.model] {
            if !path.exists() {
                return Err(SynthesisError::EngineMissing(path.clone()));
            }
        }
        Ok(())
    }
}
