use std::sync::Arc;

use shared::{
    domain::{EventKind, PromptId},
    protocol::{EvaluateWritingRequest, WritingEvaluation},
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
pub enum WritingError {
    #[error("nothing to evaluate: the text is empty")]
    EmptyText,
    #[error("an evaluation is already in flight")]
    EvaluationInFlight,
    #[error("{message}")]
    ContentRejected { message: String },
    #[error(transparent)]
    Api(#[from] ApiClientError),
}

#[derive(Debug, Clone, Default)]
pub struct WritingSnapshot {
    pub submitting: bool,
    pub evaluation: Option<WritingEvaluation>,
    pub error: Option<String>,
}

#[derive(Default)]
struct WritingState {
    submitting: bool,
    evaluation: Option<WritingEvaluation>,
    error: Option<String>,
}

/// Submits a piece of writing for server-side evaluation. Scoring, feedback
/// generation, and XP all happen on the backend; this coordinator only
/// carries the request and classifies moderation rejections.
pub struct WritingCoordinator {
    api: Arc<ApiClient>,
    events: broadcast::Sender<ClientEvent>,
    tracker: EventTracker,
    language: String,
    inner: Mutex<WritingState>,
}

impl WritingCoordinator {
    pub(crate) fn new(
        api: Arc<ApiClient>,
        events: broadcast::Sender<ClientEvent>,
        language: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            tracker: EventTracker::new(Arc::clone(&api), EventKind::Writing),
            api,
            events,
            language,
            inner: Mutex::new(WritingState::default()),
        })
    }

    pub async fn submit(
        &self,
        prompt_id: PromptId,
        text: &str,
    ) -> Result<WritingEvaluation, WritingError> {
        if text.trim().is_empty() {
            let mut state = self.inner.lock().await;
            let err = WritingError::EmptyText;
            state.error = Some(err.to_string());
            return Err(err);
        }
        {
            let mut state = self.inner.lock().await;
            if state.submitting {
                return Err(WritingError::EvaluationInFlight);
            }
            state.submitting = true;
            state.error = None;
        }

        if let Err(err) = self.tracker.start().await {
            warn!("failed to start writing event: {err}");
        }

        let result: Result<WritingEvaluation, ApiClientError> = self
            .api
            .post_json(
                "/writing/evaluate",
                &EvaluateWritingRequest {
                    prompt_id,
                    text: text.to_string(),
                    language: self.language.clone(),
                },
            )
            .await;

        let evaluation = match result {
            Ok(evaluation) => evaluation,
            Err(ApiClientError::ContentPolicy { message }) => {
                let _ = self.events.send(ClientEvent::ContentPolicyRejected {
                    message: message.clone(),
                });
                let mut state = self.inner.lock().await;
                state.submitting = false;
                state.error = Some(message.clone());
                return Err(WritingError::ContentRejected { message });
            }
            Err(err) => {
                let mut state = self.inner.lock().await;
                state.submitting = false;
                state.error = Some(err.to_string());
                return Err(WritingError::Api(err));
            }
        };

        if let Err(err) = self.tracker.complete().await {
            warn!("failed to complete writing event: {err}");
            let _ = self.events.send(ClientEvent::Error(format!(
                "failed to complete learning event: {err}"
            )));
        }

        {
            let mut state = self.inner.lock().await;
            state.submitting = false;
            state.evaluation = Some(evaluation.clone());
        }
        info!(
            prompt_id = prompt_id.0,
            score = f64::from(evaluation.score),
            xp_awarded = evaluation.xp_awarded,
            "writing evaluated"
        );
        let _ = self.events.send(ClientEvent::WritingEvaluated {
            evaluation: evaluation.clone(),
        });
        Ok(evaluation)
    }

    pub async fn snapshot(&self) -> WritingSnapshot {
        let state = self.inner.lock().await;
        WritingSnapshot {
            submitting: state.submitting,
            evaluation: state.evaluation.clone(),
            error: state.error.clone(),
        }
    }

    pub async fn reset(&self) {
        self.tracker.abort().await;
        let mut state = self.inner.lock().await;
        *state = WritingState::default();
    }
}

#[cfg(test)]
#[path = "tests/writing_tests.rs"]
mod tests;
