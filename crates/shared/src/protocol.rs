use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{EventId, EventKind, PromptId, PyramidId, StepType, UserId, WordId};

// ---------------------------------------------------------------------------
// Auth

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountProfile {
    pub user_id: UserId,
    pub email: String,
    pub display_name: String,
    pub xp_total: i64,
}

// ---------------------------------------------------------------------------
// Pyramid exercise

/// One candidate transformation offered within a pyramid step. The concrete
/// shape depends on the step type, so the wire format is a tagged union keyed
/// by `step_type`; each variant carries what a renderer needs to display the
/// choice and re-derive the resulting sentence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step_type", rename_all = "snake_case")]
pub enum StepOption {
    Expand {
        sentence: String,
        meaning: String,
        expand_word: String,
    },
    Shrink {
        sentence: String,
        meaning: String,
        removed_word: String,
    },
    Replace {
        sentence: String,
        meaning: String,
        replaced_word: String,
        changed_word: String,
    },
    Paraphrase {
        sentence: String,
        meaning: String,
    },
}

impl StepOption {
    pub fn step_type(&self) -> StepType {
        match self {
            StepOption::Expand { .. } => StepType::Expand,
            StepOption::Shrink { .. } => StepType::Shrink,
            StepOption::Replace { .. } => StepType::Replace,
            StepOption::Paraphrase { .. } => StepType::Paraphrase,
        }
    }

    pub fn resulting_sentence(&self) -> &str {
        match self {
            StepOption::Expand { sentence, .. }
            | StepOption::Shrink { sentence, .. }
            | StepOption::Replace { sentence, .. }
            | StepOption::Paraphrase { sentence, .. } => sentence,
        }
    }

    pub fn meaning(&self) -> &str {
        match self {
            StepOption::Expand { meaning, .. }
            | StepOption::Shrink { meaning, .. }
            | StepOption::Replace { meaning, .. }
            | StepOption::Paraphrase { meaning, .. } => meaning,
        }
    }

    /// The words a renderer highlights and speech playback pronounces
    /// individually. Paraphrase options rework the whole sentence, so there
    /// is no single focus word.
    pub fn focus_words(&self) -> Vec<&str> {
        match self {
            StepOption::Expand { expand_word, .. } => vec![expand_word],
            StepOption::Shrink { removed_word, .. } => vec![removed_word],
            StepOption::Replace {
                replaced_word,
                changed_word,
                ..
            } => vec![replaced_word, changed_word],
            StepOption::Paraphrase { .. } => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PyramidStep {
    pub step_type: StepType,
    pub initial_sentence: String,
    pub initial_sentence_meaning: String,
    pub options: Vec<StepOption>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pyramid {
    pub pyramid_id: PyramidId,
    pub step_types: Vec<StepType>,
    pub steps: Vec<PyramidStep>,
    pub total_steps: u32,
    pub last_step: u32,
    pub completed: bool,
}

impl Pyramid {
    pub fn current_step(&self) -> Option<&PyramidStep> {
        self.steps.get(self.last_step as usize)
    }

    /// True when `last_step` points at the final step, i.e. a successful
    /// submit of the current selection finishes the pyramid.
    pub fn on_final_step(&self) -> bool {
        self.last_step + 1 >= self.total_steps
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePyramidRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_sentence: Option<String>,
    pub language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewRequest {
    pub pyramid_id: PyramidId,
    pub current_step: u32,
}

/// Server-computed lookahead of the options for the step after
/// `current_step`. Valid only while `(pyramid_id, current_step)` still
/// matches the live pyramid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewData {
    pub pyramid_id: PyramidId,
    pub next_step_type: StepType,
    pub current_step: u32,
    pub preview_steps: Vec<PyramidStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSelectionRequest {
    pub pyramid_id: PyramidId,
    pub step: u32,
    pub selected_option: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendStepRequest {
    pub pyramid_id: PyramidId,
    pub step: PyramidStep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletePyramidRequest {
    pub pyramid_id: PyramidId,
}

/// Completion result shown on the results screen. All figures are
/// server-computed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PyramidSummary {
    pub xp_awarded: i64,
    pub duration_seconds: u32,
    pub accuracy: f32,
}

// ---------------------------------------------------------------------------
// Session events (telemetry + XP bookkeeping)

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEventRequest {
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEventResponse {
    pub event_id: EventId,
    pub session_start: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddEventStepRequest {
    pub step_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_option: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateEventRequest {
    pub duration_seconds: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteEventRequest {
    pub duration_seconds: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteEventResponse {
    pub xp_awarded: i64,
}

// ---------------------------------------------------------------------------
// Vocabulary quiz

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordItem {
    pub word_id: WordId,
    pub word: String,
    pub meaning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example_sentence: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example_sentence_meaning: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HintRequest {
    pub word_id: WordId,
    pub revealed_letters: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteQuizRequest {
    pub correct: u32,
    pub total: u32,
    pub duration_seconds: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizSummary {
    pub xp_awarded: i64,
    pub correct: u32,
    pub total: u32,
    pub duration_seconds: u32,
}

// ---------------------------------------------------------------------------
// Writing evaluation

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateWritingRequest {
    pub prompt_id: PromptId,
    pub text: String,
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WritingEvaluation {
    pub score: f32,
    pub feedback: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrected_text: Option<String>,
    pub xp_awarded: i64,
}
