pub mod answer;
pub mod attempt;
pub mod credentials;
pub mod question;
pub mod session;

pub use answer::{Answer, AnswerPayload, AudioClip};
pub use attempt::{AttemptOutcome, AttemptRecord, RunReport, RunTermination};
pub use credentials::Credentials;
pub use question::{AnswerSlot, MediaRef, Question, QuestionId, QuestionKind, QuestionShape};
pub use session::{AuthState, Location, NavState, Session};
