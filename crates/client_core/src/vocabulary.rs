use std::sync::Arc;

use shared::{
    domain::EventKind,
    protocol::{CompleteQuizRequest, HintRequest, QuizSummary, WordItem},
};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::{
    http::{ApiClient, ApiClientError},
    session_events::EventTracker,
    ClientEvent,
};

#[derive(Debug, Error)]
pub enum QuizError {
    #[error("quiz not started")]
    NotStarted,
    #[error("a word list request is already in flight")]
    LoadInFlight,
    #[error("quiz already finished")]
    AlreadyFinished,
    #[error("word list load did not fail; nothing to retry")]
    NothingToRetry,
    #[error("all remaining letters are already revealed")]
    RevealExhausted,
    #[error(transparent)]
    Api(#[from] ApiClientError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnswerOutcome {
    Correct { quiz_finished: bool },
    Incorrect,
}

#[derive(Debug, Clone, Default)]
pub struct QuizSnapshot {
    pub words_total: usize,
    pub current_index: usize,
    pub revealed_letters: u32,
    pub wrong_answer: bool,
    pub correct: u32,
    pub loading: bool,
    pub load_failed: bool,
    pub finished: bool,
    pub summary: Option<QuizSummary>,
    pub error: Option<String>,
}

#[derive(Default)]
struct QuizState {
    language: String,
    requested_count: u32,
    words: Vec<WordItem>,
    current_index: usize,
    revealed_letters: u32,
    wrong_answer: bool,
    correct: u32,
    loading: bool,
    load_failed: bool,
    finished: bool,
    summary: Option<QuizSummary>,
    error: Option<String>,
}

/// Advances through a flat word list: the user types the meaning of each
/// word, optionally revealing leading letters as hints. Judging happens
/// locally against the server-provided meaning; XP and scheduling stay
/// server-side.
pub struct VocabularyQuizCoordinator {
    api: Arc<ApiClient>,
    events: broadcast::Sender<ClientEvent>,
    tracker: EventTracker,
    inner: Mutex<QuizState>,
}

impl VocabularyQuizCoordinator {
    pub(crate) fn new(api: Arc<ApiClient>, events: broadcast::Sender<ClientEvent>) -> Arc<Self> {
        Arc::new(Self {
            tracker: EventTracker::new(Arc::clone(&api), EventKind::Vocabulary),
            api,
            events,
            inner: Mutex::new(QuizState::default()),
        })
    }

    pub async fn start(&self, language: impl Into<String>, count: u32) -> Result<(), QuizError> {
        let language = language.into();
        {
            let mut state = self.inner.lock().await;
            if state.loading {
                return Err(QuizError::LoadInFlight);
            }
            *state = QuizState {
                language: language.clone(),
                requested_count: count,
                loading: true,
                ..QuizState::default()
            };
        }
        self.finish_word_load(language, count).await
    }

    /// Manual retry of a failed word-list load; everything else about the
    /// quiz is untouched.
    pub async fn retry_load(&self) -> Result<(), QuizError> {
        let (language, count) = {
            let mut state = self.inner.lock().await;
            if !state.load_failed {
                return Err(QuizError::NothingToRetry);
            }
            state.load_failed = false;
            state.loading = true;
            state.error = None;
            (state.language.clone(), state.requested_count)
        };
        self.finish_word_load(language, count).await
    }

    async fn finish_word_load(&self, language: String, count: u32) -> Result<(), QuizError> {
        let result: Result<Vec<WordItem>, ApiClientError> = self
            .api
            .get_json(
                "/vocabulary/words",
                &[("language", language.clone()), ("count", count.to_string())],
            )
            .await;
        match result {
            Ok(words) => {
                {
                    let mut state = self.inner.lock().await;
                    state.loading = false;
                    state.words = words;
                }
                if let Err(err) = self.tracker.start().await {
                    warn!("failed to start vocabulary event: {err}");
                }
                info!(language = language.as_str(), "vocabulary quiz started");
                Ok(())
            }
            Err(err) => {
                let mut state = self.inner.lock().await;
                state.loading = false;
                state.load_failed = true;
                state.error = Some(err.to_string());
                Err(QuizError::Api(err))
            }
        }
    }

    pub async fn current_word(&self) -> Option<WordItem> {
        let state = self.inner.lock().await;
        state.words.get(state.current_index).cloned()
    }

    /// The already-revealed leading letters of the current word's meaning,
    /// for display. Whitespace never counts as a letter.
    pub async fn revealed_hint(&self) -> Option<String> {
        let state = self.inner.lock().await;
        let word = state.words.get(state.current_index)?;
        Some(
            word.meaning
                .chars()
                .filter(|c| !c.is_whitespace())
                .take(state.revealed_letters as usize)
                .collect(),
        )
    }

    /// Reveals the next letter of the meaning and reports the hint to the
    /// backend fire-and-forget; hint bookkeeping must never block typing.
    pub async fn reveal_letter(&self) -> Result<u32, QuizError> {
        let (word_id, revealed) = {
            let mut state = self.inner.lock().await;
            if state.finished {
                return Err(QuizError::AlreadyFinished);
            }
            let language = state.language.clone();
            let Some(word) = state.words.get(state.current_index) else {
                return Err(QuizError::NotStarted);
            };
            let word_id = word.word_id;
            let target_len = normalize_answer(&language, &word.meaning).chars().count();
            if target_len == 0 || state.revealed_letters as usize >= target_len - 1 {
                return Err(QuizError::RevealExhausted);
            }
            state.revealed_letters += 1;
            (word_id, state.revealed_letters)
        };

        let api = Arc::clone(&self.api);
        tokio::spawn(async move {
            if let Err(err) = api
                .post_unit(
                    "/vocabulary/hint",
                    &HintRequest {
                        word_id,
                        revealed_letters: revealed,
                    },
                )
                .await
            {
                warn!(word_id = word_id.0, "hint report failed: {err}");
            }
        });
        Ok(revealed)
    }

    /// Judges the typed answer against the unrevealed remainder of the
    /// meaning. A wrong answer flags the state without advancing; a correct
    /// one advances, and finishing the list completes the backend event.
    pub async fn check_answer(&self, input: &str) -> Result<AnswerOutcome, QuizError> {
        let all_answered = {
            let mut state = self.inner.lock().await;
            if state.finished {
                return Err(QuizError::AlreadyFinished);
            }
            let language = state.language.clone();
            let Some(word) = state.words.get(state.current_index) else {
                return Err(QuizError::NotStarted);
            };

            let expected = normalize_answer(&language, &word.meaning);
            let revealed = (state.revealed_letters as usize).min(expected.chars().count());
            let remainder: String = expected.chars().skip(revealed).collect();
            if normalize_answer(&language, input) != remainder {
                state.wrong_answer = true;
                return Ok(AnswerOutcome::Incorrect);
            }

            state.wrong_answer = false;
            state.revealed_letters = 0;
            state.correct += 1;
            state.current_index += 1;
            state.current_index >= state.words.len()
        };

        if !all_answered {
            return Ok(AnswerOutcome::Correct {
                quiz_finished: false,
            });
        }
        self.finish_quiz().await?;
        Ok(AnswerOutcome::Correct {
            quiz_finished: true,
        })
    }

    async fn finish_quiz(&self) -> Result<(), QuizError> {
        let (correct, total) = {
            let state = self.inner.lock().await;
            (state.correct, state.words.len() as u32)
        };
        let duration_seconds = self.tracker.duration_seconds().await;

        let summary: QuizSummary = match self
            .api
            .post_json(
                "/vocabulary/complete",
                &CompleteQuizRequest {
                    correct,
                    total,
                    duration_seconds,
                },
            )
            .await
        {
            Ok(summary) => summary,
            Err(err) => {
                let mut state = self.inner.lock().await;
                state.error = Some(err.to_string());
                return Err(QuizError::Api(err));
            }
        };

        if let Err(err) = self.tracker.complete().await {
            warn!("failed to complete vocabulary event: {err}");
            let _ = self.events.send(ClientEvent::Error(format!(
                "failed to complete learning event: {err}"
            )));
        }

        {
            let mut state = self.inner.lock().await;
            state.finished = true;
            state.summary = Some(summary.clone());
        }
        info!(
            correct,
            total,
            xp_awarded = summary.xp_awarded,
            "vocabulary quiz finished"
        );
        let _ = self.events.send(ClientEvent::QuizCompleted { summary });
        Ok(())
    }

    pub async fn snapshot(&self) -> QuizSnapshot {
        let state = self.inner.lock().await;
        QuizSnapshot {
            words_total: state.words.len(),
            current_index: state.current_index,
            revealed_letters: state.revealed_letters,
            wrong_answer: state.wrong_answer,
            correct: state.correct,
            loading: state.loading,
            load_failed: state.load_failed,
            finished: state.finished,
            summary: state.summary.clone(),
            error: state.error.clone(),
        }
    }

    /// Abandons the quiz; the backend event is left open.
    pub async fn reset(&self) {
        self.tracker.abort().await;
        let mut state = self.inner.lock().await;
        *state = QuizState::default();
    }
}

/// Locale-aware fold used for answer judging: whitespace is dropped,
/// lowercasing respects the Turkish dotted/dotless i, and common Latin
/// diacritics collapse to their base letter so `"café"` matches `"cafe"`.
pub fn normalize_answer(language: &str, raw: &str) -> String {
    let mut folded = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_whitespace() {
            continue;
        }
        let c = match (language, c) {
            ("tr", 'I') => 'ı',
            ("tr", 'İ') => 'i',
            _ => c,
        };
        for lower in c.to_lowercase() {
            folded.push(fold_diacritic(lower));
        }
    }
    folded
}

fn fold_diacritic(c: char) -> char {
    match c {
        'á' | 'à' | 'â' | 'ä' | 'ã' | 'å' | 'ā' | 'ă' => 'a',
        'é' | 'è' | 'ê' | 'ë' | 'ē' | 'ė' => 'e',
        'í' | 'ì' | 'î' | 'ï' | 'ī' | 'ı' => 'i',
        'ó' | 'ò' | 'ô' | 'ö' | 'õ' | 'ō' => 'o',
        'ú' | 'ù' | 'û' | 'ü' | 'ū' => 'u',
        'ç' | 'ć' | 'č' => 'c',
        'ñ' | 'ń' => 'n',
        'ş' | 'ś' | 'š' => 's',
        'ğ' => 'g',
        'ý' => 'y',
        'ž' | 'ż' | 'ź' => 'z',
        _ => c,
    }
}

#[cfg(test)]
#[path = "tests/vocabulary_tests.rs"]
mod tests;
