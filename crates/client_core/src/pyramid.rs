use std::sync::Arc;

use shared::{
    domain::{EventKind, PyramidId, StepType},
    protocol::{
        AppendStepRequest, CompletePyramidRequest, CreatePyramidRequest, PreviewData,
        PreviewRequest, Pyramid, PyramidStep, PyramidSummary, StepOption,
        UpdateSelectionRequest,
    },
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    http::{ApiClient, ApiClientError},
    session_events::EventTracker,
    ClientEvent, SpeechSynthesizer,
};

#[derive(Debug, Error)]
pub enum PyramidFlowError {
    #[error("no pyramid loaded")]
    NoPyramid,
    #[error("a pyramid request is already in flight")]
    LoadInFlight,
    #[error("no option selected")]
    NoOptionSelected,
    #[error("option {index} is out of range for the current step")]
    InvalidOption { index: usize },
    #[error("pyramid {pyramid_id} is already completed")]
    AlreadyCompleted { pyramid_id: i64 },
    #[error("preview data not found for pyramid {pyramid_id} step {step}")]
    PreviewNotFound { pyramid_id: i64, step: u32 },
    #[error("pyramid has no step at index {step}")]
    MissingStep { step: u32 },
    #[error("a submission is already in flight")]
    SubmissionInFlight,
    #[error("waiting for the pending step transition to be confirmed")]
    TransitionPending,
    #[error("no step transition is pending")]
    NoTransitionPending,
    #[error("speech playback failed: {0}")]
    Speech(String),
    #[error(transparent)]
    Api(#[from] ApiClientError),
}

/// Result of a successful `submit_selection`.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Next step has the same type; the snapshot already shows it.
    Advanced,
    /// Next step has a different type. The fresh pyramid stays parked until
    /// the caller's navigation commits and it calls `confirm_transition`.
    TransitionPending { from: StepType, to: StepType },
    Completed(PyramidSummary),
}

/// Pure data projection of the current step for whatever renders it; the
/// renderer contributes no business rules, correctness of a selection is
/// decided server-side.
#[derive(Debug, Clone, PartialEq)]
pub struct StepView {
    pub step_index: u32,
    pub step_type: StepType,
    pub initial_sentence: String,
    pub initial_sentence_meaning: String,
    pub options: Vec<StepOption>,
    pub selected_option: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct PyramidSnapshot {
    pub pyramid: Option<Pyramid>,
    pub selected_option: Option<usize>,
    pub preview_ready: bool,
    pub loading: bool,
    pub submitting: bool,
    pub transitioning: bool,
    pub error: Option<String>,
}

#[derive(Default)]
struct PyramidState {
    pyramid: Option<Pyramid>,
    selected_option: Option<usize>,
    preview: Option<PreviewData>,
    pending_transition: Option<Pyramid>,
    loading: bool,
    submitting: bool,
    transitioning: bool,
    error: Option<String>,
}

fn fail(state: &mut PyramidState, err: PyramidFlowError) -> PyramidFlowError {
    state.error = Some(err.to_string());
    err
}

/// Sequences the remote calls that drive one pyramid exercise session and
/// keeps a consistent local snapshot. All content and scoring is
/// server-owned; this coordinator only orchestrates requests, selection
/// state, the next-step preview cache, and session telemetry.
pub struct PyramidCoordinator {
    api: Arc<ApiClient>,
    speech: Arc<dyn SpeechSynthesizer>,
    events: broadcast::Sender<ClientEvent>,
    tracker: EventTracker,
    language: String,
    inner: Mutex<PyramidState>,
    preview_task: Mutex<Option<JoinHandle<()>>>,
}

impl PyramidCoordinator {
    pub(crate) fn new(
        api: Arc<ApiClient>,
        speech: Arc<dyn SpeechSynthesizer>,
        events: broadcast::Sender<ClientEvent>,
        language: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            tracker: EventTracker::new(Arc::clone(&api), EventKind::Pyramid),
            api,
            speech,
            events,
            language,
            inner: Mutex::new(PyramidState::default()),
            preview_task: Mutex::new(None),
        })
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub async fn create_pyramid(
        self: &Arc<Self>,
        seed_sentence: Option<String>,
    ) -> Result<(), PyramidFlowError> {
        self.begin_load().await?;
        let result = self
            .api
            .post_json(
                "/pyramid/create",
                &CreatePyramidRequest {
                    seed_sentence,
                    language: self.language.clone(),
                },
            )
            .await;
        self.finish_load(result).await
    }

    pub async fn load_pyramid(
        self: &Arc<Self>,
        pyramid_id: PyramidId,
    ) -> Result<(), PyramidFlowError> {
        self.begin_load().await?;
        let result = self
            .api
            .get_json(&format!("/pyramid/get/{}", pyramid_id.0), &[])
            .await;
        self.finish_load(result).await
    }

    async fn begin_load(&self) -> Result<(), PyramidFlowError> {
        let mut state = self.inner.lock().await;
        if state.loading {
            return Err(fail(&mut state, PyramidFlowError::LoadInFlight));
        }
        state.loading = true;
        state.error = None;
        Ok(())
    }

    async fn finish_load(
        self: &Arc<Self>,
        result: Result<Pyramid, ApiClientError>,
    ) -> Result<(), PyramidFlowError> {
        let pyramid = match result {
            Ok(pyramid) => pyramid,
            Err(err) => {
                if let ApiClientError::ContentPolicy { message } = &err {
                    let _ = self.events.send(ClientEvent::ContentPolicyRejected {
                        message: message.clone(),
                    });
                }
                let mut state = self.inner.lock().await;
                state.loading = false;
                state.error = Some(err.to_string());
                return Err(PyramidFlowError::Api(err));
            }
        };

        let pyramid_id = pyramid.pyramid_id;
        let wants_preview = !pyramid.completed && !pyramid.on_final_step();
        {
            let mut state = self.inner.lock().await;
            state.pyramid = Some(pyramid);
            state.selected_option = None;
            state.preview = None;
            state.pending_transition = None;
            state.transitioning = false;
            state.loading = false;
        }
        if let Err(err) = self.tracker.start().await {
            warn!(
                pyramid_id = pyramid_id.0,
                "failed to start learning event: {err}"
            );
        }
        info!(pyramid_id = pyramid_id.0, "pyramid loaded");
        let _ = self.events.send(ClientEvent::PyramidLoaded { pyramid_id });
        if wants_preview {
            self.spawn_preview_fetch().await;
        }
        Ok(())
    }

    /// Purely local; the choice is sent to the server on submit.
    pub async fn select_option(&self, index: usize) -> Result<(), PyramidFlowError> {
        let mut state = self.inner.lock().await;
        let Some(pyramid) = state.pyramid.as_ref() else {
            return Err(fail(&mut state, PyramidFlowError::NoPyramid));
        };
        if pyramid.completed {
            let pyramid_id = pyramid.pyramid_id.0;
            return Err(fail(
                &mut state,
                PyramidFlowError::AlreadyCompleted { pyramid_id },
            ));
        }
        if state.transitioning {
            return Err(fail(&mut state, PyramidFlowError::TransitionPending));
        }
        if state.submitting {
            return Err(fail(&mut state, PyramidFlowError::SubmissionInFlight));
        }
        let step = pyramid.last_step;
        let Some(current) = pyramid.current_step() else {
            return Err(fail(&mut state, PyramidFlowError::MissingStep { step }));
        };
        if index >= current.options.len() {
            return Err(fail(&mut state, PyramidFlowError::InvalidOption { index }));
        }
        state.selected_option = Some(index);
        state.error = None;
        Ok(())
    }

    /// Sends the current selection to the server. Non-final steps consume the
    /// cached preview to append the chosen step; the final step completes the
    /// pyramid. Every precondition failure is a local no-op with an error and
    /// no network traffic.
    pub async fn submit_selection(self: &Arc<Self>) -> Result<SubmitOutcome, PyramidFlowError> {
        let (pyramid, selected, chosen_step) = {
            let mut state = self.inner.lock().await;
            if state.submitting {
                return Err(fail(&mut state, PyramidFlowError::SubmissionInFlight));
            }
            if state.transitioning {
                return Err(fail(&mut state, PyramidFlowError::TransitionPending));
            }
            let Some(pyramid) = state.pyramid.clone() else {
                return Err(fail(&mut state, PyramidFlowError::NoPyramid));
            };
            if pyramid.completed {
                return Err(fail(
                    &mut state,
                    PyramidFlowError::AlreadyCompleted {
                        pyramid_id: pyramid.pyramid_id.0,
                    },
                ));
            }
            let Some(selected) = state.selected_option else {
                return Err(fail(&mut state, PyramidFlowError::NoOptionSelected));
            };

            let preview_step = state
                .preview
                .as_ref()
                .filter(|preview| {
                    preview.pyramid_id == pyramid.pyramid_id
                        && preview.current_step == pyramid.last_step
                })
                .and_then(|preview| preview.preview_steps.get(selected).cloned());
            let chosen_step = if pyramid.on_final_step() {
                None
            } else {
                match preview_step {
                    Some(step) => Some(step),
                    // Never call the server with stale lookahead data.
                    None => {
                        return Err(fail(
                            &mut state,
                            PyramidFlowError::PreviewNotFound {
                                pyramid_id: pyramid.pyramid_id.0,
                                step: pyramid.last_step,
                            },
                        ));
                    }
                }
            };
            state.submitting = true;
            state.error = None;
            (pyramid, selected, chosen_step)
        };

        if let Err(err) = self
            .api
            .post_unit(
                "/pyramid/update-step-selection",
                &UpdateSelectionRequest {
                    pyramid_id: pyramid.pyramid_id,
                    step: pyramid.last_step,
                    selected_option: selected as u32,
                },
            )
            .await
        {
            return self.fail_submit(err).await;
        }

        // Telemetry is best-effort; a failed add-step never blocks the flow.
        if let Err(err) = self
            .tracker
            .add_step(pyramid.last_step, Some(selected as u32))
            .await
        {
            warn!(
                pyramid_id = pyramid.pyramid_id.0,
                step = pyramid.last_step,
                "event add-step failed: {err}"
            );
        }

        match chosen_step {
            Some(step) => self.append_step(pyramid, step).await,
            None => self.complete_pyramid(pyramid).await,
        }
    }

    async fn fail_submit(&self, err: ApiClientError) -> Result<SubmitOutcome, PyramidFlowError> {
        if let ApiClientError::ContentPolicy { message } = &err {
            let _ = self.events.send(ClientEvent::ContentPolicyRejected {
                message: message.clone(),
            });
        }
        let mut state = self.inner.lock().await;
        state.submitting = false;
        state.error = Some(err.to_string());
        Err(PyramidFlowError::Api(err))
    }

    async fn complete_pyramid(
        &self,
        pyramid: Pyramid,
    ) -> Result<SubmitOutcome, PyramidFlowError> {
        let summary: PyramidSummary = match self
            .api
            .post_json(
                "/pyramid/complete",
                &CompletePyramidRequest {
                    pyramid_id: pyramid.pyramid_id,
                },
            )
            .await
        {
            Ok(summary) => summary,
            Err(err) => return self.fail_submit(err).await,
        };

        if let Err(err) = self.tracker.complete().await {
            warn!(
                pyramid_id = pyramid.pyramid_id.0,
                "failed to complete learning event: {err}"
            );
            let _ = self.events.send(ClientEvent::Error(format!(
                "failed to complete learning event: {err}"
            )));
        }

        {
            let mut state = self.inner.lock().await;
            if let Some(current) = state.pyramid.as_mut() {
                current.completed = true;
            }
            state.selected_option = None;
            state.preview = None;
            state.submitting = false;
        }
        info!(
            pyramid_id = pyramid.pyramid_id.0,
            xp_awarded = summary.xp_awarded,
            "pyramid completed"
        );
        let _ = self.events.send(ClientEvent::PyramidCompleted {
            summary: summary.clone(),
        });
        Ok(SubmitOutcome::Completed(summary))
    }

    async fn append_step(
        self: &Arc<Self>,
        pyramid: Pyramid,
        step: PyramidStep,
    ) -> Result<SubmitOutcome, PyramidFlowError> {
        let updated: Pyramid = match self
            .api
            .post_json(
                "/pyramid/append-step",
                &AppendStepRequest {
                    pyramid_id: pyramid.pyramid_id,
                    step,
                },
            )
            .await
        {
            Ok(updated) => updated,
            Err(err) => return self.fail_submit(err).await,
        };

        let current_type = pyramid.current_step().map(|s| s.step_type);
        let next_type = updated.current_step().map(|s| s.step_type);
        let outcome = {
            let mut state = self.inner.lock().await;
            state.submitting = false;
            state.selected_option = None;
            state.preview = None;
            match (current_type, next_type) {
                (Some(from), Some(to)) if from != to => {
                    // Park the fresh pyramid until the caller's navigation
                    // commits; the mounted renderer must never observe a step
                    // whose type mismatches its screen.
                    state.pending_transition = Some(updated);
                    state.transitioning = true;
                    SubmitOutcome::TransitionPending { from, to }
                }
                _ => {
                    state.pyramid = Some(updated);
                    SubmitOutcome::Advanced
                }
            }
        };

        match &outcome {
            SubmitOutcome::TransitionPending { from, to } => {
                info!(
                    pyramid_id = pyramid.pyramid_id.0,
                    from = from.as_str(),
                    to = to.as_str(),
                    "step type transition pending confirmation"
                );
                let _ = self.events.send(ClientEvent::StepTypeChanged {
                    from: *from,
                    to: *to,
                });
            }
            SubmitOutcome::Advanced => {
                self.spawn_preview_fetch().await;
            }
            SubmitOutcome::Completed(_) => {}
        }
        Ok(outcome)
    }

    /// Applies the pyramid parked by a step-type transition. The UI calls
    /// this once its navigation to the new step screen has committed.
    pub async fn confirm_transition(self: &Arc<Self>) -> Result<(), PyramidFlowError> {
        {
            let mut state = self.inner.lock().await;
            let Some(updated) = state.pending_transition.take() else {
                return Err(fail(&mut state, PyramidFlowError::NoTransitionPending));
            };
            state.pyramid = Some(updated);
            state.transitioning = false;
        }
        self.spawn_preview_fetch().await;
        Ok(())
    }

    async fn spawn_preview_fetch(self: &Arc<Self>) {
        let target = {
            let state = self.inner.lock().await;
            match state.pyramid.as_ref() {
                Some(pyramid) if !pyramid.completed && !pyramid.on_final_step() => {
                    Some((pyramid.pyramid_id, pyramid.last_step))
                }
                _ => None,
            }
        };
        let Some((pyramid_id, current_step)) = target else {
            return;
        };

        let coordinator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let result: Result<PreviewData, ApiClientError> = coordinator
                .api
                .post_json(
                    "/pyramid/preview/next-step-options",
                    &PreviewRequest {
                        pyramid_id,
                        current_step,
                    },
                )
                .await;
            match result {
                Ok(preview) => {
                    let mut state = coordinator.inner.lock().await;
                    let still_current = state.pyramid.as_ref().is_some_and(|pyramid| {
                        pyramid.pyramid_id == preview.pyramid_id
                            && pyramid.last_step == preview.current_step
                    });
                    if still_current {
                        state.preview = Some(preview);
                        drop(state);
                        let _ = coordinator.events.send(ClientEvent::PreviewReady {
                            pyramid_id,
                            for_step: current_step,
                        });
                    } else {
                        debug!(
                            pyramid_id = pyramid_id.0,
                            step = current_step,
                            "discarding stale preview response"
                        );
                    }
                }
                Err(err) => {
                    warn!(
                        pyramid_id = pyramid_id.0,
                        step = current_step,
                        "preview fetch failed: {err}"
                    );
                    let _ = coordinator.events.send(ClientEvent::Error(format!(
                        "failed to fetch next-step preview: {err}"
                    )));
                }
            }
        });
        let mut task = self.preview_task.lock().await;
        if let Some(previous) = task.replace(handle) {
            previous.abort();
        }
    }

    pub async fn current_step(&self) -> Option<PyramidStep> {
        let state = self.inner.lock().await;
        state
            .pyramid
            .as_ref()
            .and_then(|pyramid| pyramid.current_step().cloned())
    }

    pub async fn step_view(&self) -> Option<StepView> {
        let state = self.inner.lock().await;
        let pyramid = state.pyramid.as_ref()?;
        let step = pyramid.current_step()?;
        Some(StepView {
            step_index: pyramid.last_step,
            step_type: step.step_type,
            initial_sentence: step.initial_sentence.clone(),
            initial_sentence_meaning: step.initial_sentence_meaning.clone(),
            options: step.options.clone(),
            selected_option: state.selected_option,
        })
    }

    pub async fn snapshot(&self) -> PyramidSnapshot {
        let state = self.inner.lock().await;
        let preview_ready = match (state.pyramid.as_ref(), state.preview.as_ref()) {
            (Some(pyramid), Some(preview)) => {
                preview.pyramid_id == pyramid.pyramid_id
                    && preview.current_step == pyramid.last_step
            }
            _ => false,
        };
        PyramidSnapshot {
            pyramid: state.pyramid.clone(),
            selected_option: state.selected_option,
            preview_ready,
            loading: state.loading,
            submitting: state.submitting,
            transitioning: state.transitioning,
            error: state.error.clone(),
        }
    }

    /// Feeds the current step to the speech capability: the selected option's
    /// focus words and resulting sentence, or the step's initial sentence
    /// when nothing is selected yet.
    pub async fn speak_current_step(&self) -> Result<(), PyramidFlowError> {
        let phrases = {
            let mut state = self.inner.lock().await;
            let Some(pyramid) = state.pyramid.as_ref() else {
                return Err(fail(&mut state, PyramidFlowError::NoPyramid));
            };
            let step_index = pyramid.last_step;
            let Some(step) = pyramid.current_step() else {
                return Err(fail(
                    &mut state,
                    PyramidFlowError::MissingStep { step: step_index },
                ));
            };
            let mut phrases = Vec::new();
            match state
                .selected_option
                .and_then(|index| step.options.get(index))
            {
                Some(option) => {
                    phrases.extend(option.focus_words().iter().map(|word| word.to_string()));
                    phrases.push(option.resulting_sentence().to_string());
                }
                None => phrases.push(step.initial_sentence.clone()),
            }
            phrases
        };
        self.speech
            .speak(&self.language, &phrases)
            .await
            .map_err(|err| PyramidFlowError::Speech(err.to_string()))
    }

    pub async fn error_message(&self) -> Option<String> {
        self.inner.lock().await.error.clone()
    }

    /// Abandons the session: aborts background work and clears all local
    /// state. The backend event is left open (never completed on abandon).
    pub async fn reset(&self) {
        if let Some(task) = self.preview_task.lock().await.take() {
            task.abort();
        }
        self.tracker.abort().await;
        let mut state = self.inner.lock().await;
        *state = PyramidState::default();
    }
}

#[cfg(test)]
#[path = "tests/pyramid_tests.rs"]
mod tests;
