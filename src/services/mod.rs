pub mod answer_cache;
pub mod answer_synthesizer;
pub mod audio_bridge;
pub mod llm_service;
pub mod navigation;
pub mod prompts;
pub mod question_extractor;
pub mod report_writer;
pub mod submission;

pub use answer_cache::AnswerCache;
pub use answer_synthesizer::AnswerSynthesizer;
pub use audio_bridge::{AudioBridge, PiperAudioBridge, VoiceParams};
pub use llm_service::{LanguageModel, LlmService};
pub use navigation::{NavigationController, Navigator, NextLocation};
pub use question_extractor::{Extraction, Extractor, QuestionExtractor};
pub use report_writer::ReportWriter;
pub use submission::{SubmissionEngine, Submitter};
