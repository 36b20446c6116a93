use super::*;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use shared::{
    domain::EventId,
    error::{ApiError, ErrorCode},
    protocol::{CompleteEventResponse, CreateEventResponse, TokenPair},
};
use tokio::{net::TcpListener, sync::Mutex as AsyncMutex};

use crate::{EphemeralTokenStore, MissingSpeechSynthesizer, SpeechSynthesizer};

fn step_of(step_type: StepType, tag: &str) -> PyramidStep {
    let options = match step_type {
        StepType::Expand => vec![
            StepOption::Expand {
                sentence: format!("sentence {tag} option 0"),
                meaning: format!("meaning {tag} option 0"),
                expand_word: "softly".to_string(),
            },
            StepOption::Expand {
                sentence: format!("sentence {tag} option 1"),
                meaning: format!("meaning {tag} option 1"),
                expand_word: "slowly".to_string(),
            },
        ],
        StepType::Shrink => vec![
            StepOption::Shrink {
                sentence: format!("sentence {tag} option 0"),
                meaning: format!("meaning {tag} option 0"),
                removed_word: "softly".to_string(),
            },
            StepOption::Shrink {
                sentence: format!("sentence {tag} option 1"),
                meaning: format!("meaning {tag} option 1"),
                removed_word: "slowly".to_string(),
            },
        ],
        StepType::Replace => vec![
            StepOption::Replace {
                sentence: format!("sentence {tag} option 0"),
                meaning: format!("meaning {tag} option 0"),
                replaced_word: "cat".to_string(),
                changed_word: "dog".to_string(),
            },
            StepOption::Replace {
                sentence: format!("sentence {tag} option 1"),
                meaning: format!("meaning {tag} option 1"),
                replaced_word: "cat".to_string(),
                changed_word: "fox".to_string(),
            },
        ],
        StepType::Paraphrase => vec![
            StepOption::Paraphrase {
                sentence: format!("sentence {tag} option 0"),
                meaning: format!("meaning {tag} option 0"),
            },
            StepOption::Paraphrase {
                sentence: format!("sentence {tag} option 1"),
                meaning: format!("meaning {tag} option 1"),
            },
        ],
    };
    PyramidStep {
        step_type,
        initial_sentence: format!("base sentence {tag}"),
        initial_sentence_meaning: format!("base meaning {tag}"),
        options,
    }
}

fn sample_pyramid(step_types: Vec<StepType>) -> Pyramid {
    let total_steps = step_types.len() as u32;
    Pyramid {
        pyramid_id: PyramidId(41),
        steps: vec![step_of(step_types[0], "step0")],
        step_types,
        total_steps,
        last_step: 0,
        completed: false,
    }
}

#[derive(Clone)]
struct PyramidServerState {
    pyramid: Arc<AsyncMutex<Pyramid>>,
    served_previews: Arc<AsyncMutex<Vec<PreviewData>>>,
    selection_posts: Arc<AsyncMutex<Vec<UpdateSelectionRequest>>>,
    append_posts: Arc<AsyncMutex<u32>>,
    complete_calls: Arc<AsyncMutex<u32>>,
    event_completes: Arc<AsyncMutex<u32>>,
    preview_delay: Arc<AsyncMutex<Option<Duration>>>,
    reject_create_message: Arc<AsyncMutex<Option<String>>>,
}

async fn handle_create(
    State(state): State<PyramidServerState>,
) -> Result<Json<Pyramid>, (StatusCode, Json<ApiError>)> {
    if let Some(message) = state.reject_create_message.lock().await.clone() {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ApiError::new(ErrorCode::ContentPolicy, message)),
        ));
    }
    Ok(Json(state.pyramid.lock().await.clone()))
}

async fn handle_get(
    State(state): State<PyramidServerState>,
    Path(_id): Path<i64>,
) -> Json<Pyramid> {
    Json(state.pyramid.lock().await.clone())
}

async fn handle_preview(
    State(state): State<PyramidServerState>,
    Json(request): Json<PreviewRequest>,
) -> Result<Json<PreviewData>, StatusCode> {
    if let Some(delay) = *state.preview_delay.lock().await {
        tokio::time::sleep(delay).await;
    }
    let pyramid = state.pyramid.lock().await.clone();
    let next_index = (request.current_step + 1) as usize;
    let Some(next_step_type) = pyramid.step_types.get(next_index).copied() else {
        return Err(StatusCode::NOT_FOUND);
    };
    let tag = format!("step{next_index}");
    let preview = PreviewData {
        pyramid_id: request.pyramid_id,
        next_step_type,
        current_step: request.current_step,
        preview_steps: vec![
            step_of(next_step_type, &format!("{tag} candidate 0")),
            step_of(next_step_type, &format!("{tag} candidate 1")),
        ],
    };
    state.served_previews.lock().await.push(preview.clone());
    Ok(Json(preview))
}

async fn handle_update_selection(
    State(state): State<PyramidServerState>,
    Json(request): Json<UpdateSelectionRequest>,
) -> StatusCode {
    state.selection_posts.lock().await.push(request);
    StatusCode::NO_CONTENT
}

async fn handle_append_step(
    State(state): State<PyramidServerState>,
    Json(request): Json<AppendStepRequest>,
) -> Json<Pyramid> {
    *state.append_posts.lock().await += 1;
    let mut pyramid = state.pyramid.lock().await;
    pyramid.steps.push(request.step);
    pyramid.last_step += 1;
    Json(pyramid.clone())
}

async fn handle_complete(
    State(state): State<PyramidServerState>,
    Json(_request): Json<CompletePyramidRequest>,
) -> Json<PyramidSummary> {
    *state.complete_calls.lock().await += 1;
    state.pyramid.lock().await.completed = true;
    Json(PyramidSummary {
        xp_awarded: 120,
        duration_seconds: 95,
        accuracy: 0.75,
    })
}

async fn handle_event_create() -> Json<CreateEventResponse> {
    Json(CreateEventResponse {
        event_id: EventId(900),
        session_start: Utc::now(),
    })
}

async fn handle_event_touch(Path(_id): Path<i64>) -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn handle_event_complete(
    State(state): State<PyramidServerState>,
    Path(_id): Path<i64>,
) -> Json<CompleteEventResponse> {
    *state.event_completes.lock().await += 1;
    Json(CompleteEventResponse { xp_awarded: 120 })
}

async fn spawn_pyramid_server(
    pyramid: Pyramid,
) -> anyhow::Result<(String, PyramidServerState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = PyramidServerState {
        pyramid: Arc::new(AsyncMutex::new(pyramid)),
        served_previews: Arc::new(AsyncMutex::new(Vec::new())),
        selection_posts: Arc::new(AsyncMutex::new(Vec::new())),
        append_posts: Arc::new(AsyncMutex::new(0)),
        complete_calls: Arc::new(AsyncMutex::new(0)),
        event_completes: Arc::new(AsyncMutex::new(0)),
        preview_delay: Arc::new(AsyncMutex::new(None)),
        reject_create_message: Arc::new(AsyncMutex::new(None)),
    };
    let app = Router::new()
        .route("/pyramid/create", post(handle_create))
        .route("/pyramid/get/:id", get(handle_get))
        .route("/pyramid/preview/next-step-options", post(handle_preview))
        .route("/pyramid/update-step-selection", post(handle_update_selection))
        .route("/pyramid/append-step", post(handle_append_step))
        .route("/pyramid/complete", post(handle_complete))
        .route("/pyramid/event/create", post(handle_event_create))
        .route("/event/:id/add-step", put(handle_event_touch))
        .route("/event/:id/update", put(handle_event_touch))
        .route("/event/:id/complete", post(handle_event_complete))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), state))
}

async fn coordinator_for(
    server_url: &str,
) -> (
    Arc<PyramidCoordinator>,
    tokio::sync::broadcast::Receiver<ClientEvent>,
) {
    let (events, rx) = tokio::sync::broadcast::channel(64);
    let api = Arc::new(ApiClient::new(
        server_url,
        Arc::new(EphemeralTokenStore),
        events.clone(),
    ));
    api.set_session(
        TokenPair {
            access_token: "test-access".into(),
            refresh_token: "test-refresh".into(),
        },
        false,
    )
    .await;
    let coordinator = PyramidCoordinator::new(
        api,
        Arc::new(MissingSpeechSynthesizer),
        events,
        "es".to_string(),
    );
    (coordinator, rx)
}

async fn wait_for_preview(coordinator: &Arc<PyramidCoordinator>) {
    for _ in 0..100 {
        if coordinator.snapshot().await.preview_ready {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("preview never became ready");
}

#[tokio::test]
async fn load_pyramid_exposes_the_step_at_last_step() {
    let pyramid = sample_pyramid(vec![StepType::Expand, StepType::Expand, StepType::Shrink]);
    let expected_step = pyramid.steps[0].clone();
    let (server_url, _state) = spawn_pyramid_server(pyramid).await.expect("spawn server");
    let (coordinator, _rx) = coordinator_for(&server_url).await;

    coordinator
        .load_pyramid(PyramidId(41))
        .await
        .expect("load");

    let current = coordinator.current_step().await.expect("current step");
    assert_eq!(current, expected_step);

    let view = coordinator.step_view().await.expect("view");
    assert_eq!(view.step_index, 0);
    assert_eq!(view.step_type, StepType::Expand);
    assert_eq!(view.selected_option, None);
}

#[tokio::test]
async fn submit_without_a_selection_is_a_local_error() {
    let pyramid = sample_pyramid(vec![StepType::Expand, StepType::Expand]);
    let (server_url, state) = spawn_pyramid_server(pyramid).await.expect("spawn server");
    let (coordinator, _rx) = coordinator_for(&server_url).await;

    coordinator
        .load_pyramid(PyramidId(41))
        .await
        .expect("load");
    wait_for_preview(&coordinator).await;

    let err = coordinator
        .submit_selection()
        .await
        .expect_err("must fail");
    assert!(matches!(err, PyramidFlowError::NoOptionSelected));

    let snapshot = coordinator.snapshot().await;
    assert!(snapshot
        .error
        .as_deref()
        .is_some_and(|message| !message.is_empty()));
    assert!(state.selection_posts.lock().await.is_empty());
    assert_eq!(*state.append_posts.lock().await, 0);
    assert_eq!(*state.complete_calls.lock().await, 0);
}

#[tokio::test]
async fn non_final_submit_consumes_the_preview_and_advances() {
    let pyramid = sample_pyramid(vec![StepType::Expand, StepType::Expand, StepType::Shrink]);
    let (server_url, state) = spawn_pyramid_server(pyramid).await.expect("spawn server");
    let (coordinator, _rx) = coordinator_for(&server_url).await;

    coordinator.create_pyramid(None).await.expect("create");
    wait_for_preview(&coordinator).await;

    coordinator.select_option(1).await.expect("select");
    let outcome = coordinator.submit_selection().await.expect("submit");
    assert_eq!(outcome, SubmitOutcome::Advanced);

    let snapshot = coordinator.snapshot().await;
    let current = snapshot.pyramid.expect("pyramid");
    assert_eq!(current.last_step, 1);
    assert!(!current.completed);

    // The appended step is exactly the chosen preview candidate.
    let served = state.served_previews.lock().await.clone();
    assert_eq!(current.steps[1], served[0].preview_steps[1]);

    // Selection and preview reset after a successful submit.
    assert_eq!(snapshot.selected_option, None);

    let selections = state.selection_posts.lock().await.clone();
    assert_eq!(selections.len(), 1);
    assert_eq!(selections[0].step, 0);
    assert_eq!(selections[0].selected_option, 1);
}

#[tokio::test]
async fn submit_without_matching_preview_never_calls_the_server() {
    let pyramid = sample_pyramid(vec![StepType::Expand, StepType::Expand]);
    let (server_url, state) = spawn_pyramid_server(pyramid.clone())
        .await
        .expect("spawn server");
    let (coordinator, _rx) = coordinator_for(&server_url).await;

    // Seed the coordinator directly: a loaded pyramid with a selection but no
    // usable preview for the current step.
    {
        let mut inner = coordinator.inner.lock().await;
        inner.pyramid = Some(pyramid);
        inner.selected_option = Some(0);
        inner.preview = None;
    }

    let err = coordinator
        .submit_selection()
        .await
        .expect_err("must fail");
    assert!(matches!(
        err,
        PyramidFlowError::PreviewNotFound {
            pyramid_id: 41,
            step: 0
        }
    ));
    assert_eq!(
        coordinator.snapshot().await.error.as_deref(),
        Some("preview data not found for pyramid 41 step 0")
    );
    assert!(state.selection_posts.lock().await.is_empty());
    assert_eq!(*state.append_posts.lock().await, 0);
}

#[tokio::test]
async fn a_preview_for_a_mismatched_step_is_rejected_as_stale() {
    let pyramid = sample_pyramid(vec![StepType::Expand, StepType::Expand]);
    let stale_preview = PreviewData {
        pyramid_id: PyramidId(41),
        next_step_type: StepType::Expand,
        current_step: 7,
        preview_steps: vec![step_of(StepType::Expand, "stale")],
    };
    let (server_url, state) = spawn_pyramid_server(pyramid.clone())
        .await
        .expect("spawn server");
    let (coordinator, _rx) = coordinator_for(&server_url).await;

    {
        let mut inner = coordinator.inner.lock().await;
        inner.pyramid = Some(pyramid);
        inner.selected_option = Some(0);
        inner.preview = Some(stale_preview);
    }

    let err = coordinator
        .submit_selection()
        .await
        .expect_err("must fail");
    assert!(matches!(err, PyramidFlowError::PreviewNotFound { .. }));
    assert!(state.selection_posts.lock().await.is_empty());
}

#[tokio::test]
async fn final_submit_completes_and_rejects_further_submissions() {
    let mut pyramid = sample_pyramid(vec![StepType::Expand, StepType::Expand, StepType::Shrink]);
    pyramid.steps = vec![
        step_of(StepType::Expand, "step0"),
        step_of(StepType::Expand, "step1"),
        step_of(StepType::Shrink, "step2"),
    ];
    pyramid.last_step = 2;
    let (server_url, state) = spawn_pyramid_server(pyramid).await.expect("spawn server");
    let (coordinator, mut rx) = coordinator_for(&server_url).await;

    coordinator
        .load_pyramid(PyramidId(41))
        .await
        .expect("load");
    coordinator.select_option(0).await.expect("select");

    let outcome = coordinator.submit_selection().await.expect("submit");
    let SubmitOutcome::Completed(summary) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(summary.xp_awarded, 120);

    let snapshot = coordinator.snapshot().await;
    assert!(snapshot.pyramid.expect("pyramid").completed);
    assert_eq!(snapshot.selected_option, None);
    assert_eq!(*state.complete_calls.lock().await, 1);
    assert_eq!(*state.event_completes.lock().await, 1);

    let completed_event = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let ClientEvent::PyramidCompleted { summary } = rx.recv().await.expect("event") {
                break summary;
            }
        }
    })
    .await
    .expect("completion event timeout");
    assert_eq!(completed_event.xp_awarded, 120);

    // Completed pyramids are a terminal state for the coordinator.
    let err = coordinator
        .submit_selection()
        .await
        .expect_err("must fail");
    assert!(matches!(
        err,
        PyramidFlowError::AlreadyCompleted { pyramid_id: 41 }
    ));
    assert_eq!(*state.complete_calls.lock().await, 1);
}

#[tokio::test]
async fn step_type_change_parks_the_pyramid_until_confirmed() {
    // Step 1 is a shrink step while step 0 is expand, so submitting step 0
    // must hold the new pyramid back until the navigation commits.
    let pyramid = sample_pyramid(vec![StepType::Expand, StepType::Shrink, StepType::Shrink]);
    let (server_url, _state) = spawn_pyramid_server(pyramid).await.expect("spawn server");
    let (coordinator, mut rx) = coordinator_for(&server_url).await;

    coordinator.create_pyramid(None).await.expect("create");
    wait_for_preview(&coordinator).await;
    coordinator.select_option(0).await.expect("select");

    let outcome = coordinator.submit_selection().await.expect("submit");
    assert_eq!(
        outcome,
        SubmitOutcome::TransitionPending {
            from: StepType::Expand,
            to: StepType::Shrink
        }
    );

    // Between submit and confirm the renderer still sees the old step.
    let snapshot = coordinator.snapshot().await;
    assert!(snapshot.transitioning);
    let parked = snapshot.pyramid.expect("pyramid");
    assert_eq!(parked.last_step, 0);
    assert_eq!(
        coordinator.step_view().await.expect("view").step_type,
        StepType::Expand
    );

    // Further submissions are refused while the transition is pending.
    let err = coordinator
        .submit_selection()
        .await
        .expect_err("must fail");
    assert!(matches!(err, PyramidFlowError::TransitionPending));

    let event = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let ClientEvent::StepTypeChanged { from, to } = rx.recv().await.expect("event") {
                break (from, to);
            }
        }
    })
    .await
    .expect("transition event timeout");
    assert_eq!(event, (StepType::Expand, StepType::Shrink));

    coordinator.confirm_transition().await.expect("confirm");
    let snapshot = coordinator.snapshot().await;
    assert!(!snapshot.transitioning);
    let applied = snapshot.pyramid.expect("pyramid");
    assert_eq!(applied.last_step, 1);
    assert_eq!(
        coordinator.step_view().await.expect("view").step_type,
        StepType::Shrink
    );

    // Confirming twice is an error.
    let err = coordinator
        .confirm_transition()
        .await
        .expect_err("must fail");
    assert!(matches!(err, PyramidFlowError::NoTransitionPending));
}

#[tokio::test]
async fn preview_responses_for_an_advanced_pyramid_are_discarded() {
    let pyramid = sample_pyramid(vec![StepType::Expand, StepType::Expand, StepType::Expand]);
    let (server_url, state) = spawn_pyramid_server(pyramid).await.expect("spawn server");
    *state.preview_delay.lock().await = Some(Duration::from_millis(150));
    let (coordinator, _rx) = coordinator_for(&server_url).await;

    coordinator
        .load_pyramid(PyramidId(41))
        .await
        .expect("load");

    // Advance the local pyramid past step 0 while the step-0 preview fetch is
    // still in flight; its late response must not be applied.
    {
        let mut inner = coordinator.inner.lock().await;
        let pyramid = inner.pyramid.as_mut().expect("pyramid");
        pyramid.steps.push(step_of(StepType::Expand, "step1"));
        pyramid.last_step = 1;
    }

    tokio::time::sleep(Duration::from_millis(400)).await;
    let snapshot = coordinator.snapshot().await;
    assert!(!snapshot.preview_ready);
    assert!(coordinator.inner.lock().await.preview.is_none());
}

#[tokio::test]
async fn select_option_validates_bounds_locally() {
    let pyramid = sample_pyramid(vec![StepType::Expand, StepType::Expand]);
    let (server_url, _state) = spawn_pyramid_server(pyramid).await.expect("spawn server");
    let (coordinator, _rx) = coordinator_for(&server_url).await;

    let err = coordinator.select_option(0).await.expect_err("no pyramid");
    assert!(matches!(err, PyramidFlowError::NoPyramid));

    coordinator
        .load_pyramid(PyramidId(41))
        .await
        .expect("load");

    let err = coordinator.select_option(5).await.expect_err("out of range");
    assert!(matches!(err, PyramidFlowError::InvalidOption { index: 5 }));

    coordinator.select_option(1).await.expect("select");
    assert_eq!(coordinator.snapshot().await.selected_option, Some(1));
}

#[tokio::test]
async fn content_policy_rejections_surface_as_a_warning_event() {
    let pyramid = sample_pyramid(vec![StepType::Expand, StepType::Expand]);
    let (server_url, state) = spawn_pyramid_server(pyramid).await.expect("spawn server");
    *state.reject_create_message.lock().await =
        Some("seed sentence rejected by content policy".to_string());
    let (coordinator, mut rx) = coordinator_for(&server_url).await;

    let err = coordinator
        .create_pyramid(Some("something objectionable".to_string()))
        .await
        .expect_err("must fail");
    let PyramidFlowError::Api(api_err) = err else {
        panic!("expected api error");
    };
    assert!(api_err.is_content_policy());

    let message = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let ClientEvent::ContentPolicyRejected { message } =
                rx.recv().await.expect("event")
            {
                break message;
            }
        }
    })
    .await
    .expect("policy event timeout");
    assert_eq!(message, "seed sentence rejected by content policy");

    let snapshot = coordinator.snapshot().await;
    assert!(!snapshot.loading);
    assert!(snapshot.error.is_some());
    assert!(snapshot.pyramid.is_none());
}

struct RecordingSpeech {
    spoken: AsyncMutex<Vec<(String, Vec<String>)>>,
}

#[async_trait::async_trait]
impl SpeechSynthesizer for RecordingSpeech {
    async fn speak(&self, language: &str, phrases: &[String]) -> anyhow::Result<()> {
        self.spoken
            .lock()
            .await
            .push((language.to_string(), phrases.to_vec()));
        Ok(())
    }
}

#[tokio::test]
async fn speaking_the_current_step_uses_the_selected_option() {
    let pyramid = sample_pyramid(vec![StepType::Expand, StepType::Expand]);
    let (server_url, _state) = spawn_pyramid_server(pyramid).await.expect("spawn server");

    let (events, _rx) = tokio::sync::broadcast::channel(64);
    let api = Arc::new(ApiClient::new(
        server_url.as_str(),
        Arc::new(EphemeralTokenStore),
        events.clone(),
    ));
    api.set_session(
        TokenPair {
            access_token: "test-access".into(),
            refresh_token: "test-refresh".into(),
        },
        false,
    )
    .await;
    let speech = Arc::new(RecordingSpeech {
        spoken: AsyncMutex::new(Vec::new()),
    });
    let coordinator =
        PyramidCoordinator::new(api, speech.clone(), events, "es".to_string());

    coordinator
        .load_pyramid(PyramidId(41))
        .await
        .expect("load");

    coordinator.speak_current_step().await.expect("speak");
    coordinator.select_option(0).await.expect("select");
    coordinator.speak_current_step().await.expect("speak again");

    let spoken = speech.spoken.lock().await.clone();
    assert_eq!(spoken.len(), 2);
    assert_eq!(spoken[0].0, "es");
    assert_eq!(spoken[0].1, vec!["base sentence step0".to_string()]);
    assert_eq!(
        spoken[1].1,
        vec![
            "softly".to_string(),
            "sentence step0 option 0".to_string()
        ]
    );
}
