use std::{sync::Arc, time::Duration};

use shared::{
    domain::{EventId, EventKind},
    protocol::{
        AddEventStepRequest, CompleteEventRequest, CompleteEventResponse, CreateEventRequest,
        CreateEventResponse, UpdateEventRequest,
    },
};
use tokio::{sync::Mutex, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

use crate::http::{ApiClient, ApiClientError};

const DURATION_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

/// Client-side handle for one backend learning-session event. The backend
/// owns the record; this tracker only carries the id through the
/// add-step/update/complete calls, streams duration updates every 10 s, and
/// guarantees a completed event is never re-submitted.
pub struct EventTracker {
    api: Arc<ApiClient>,
    kind: EventKind,
    inner: Mutex<TrackerState>,
}

#[derive(Default)]
struct TrackerState {
    event_id: Option<EventId>,
    started_at: Option<Instant>,
    completed: bool,
    updater: Option<JoinHandle<()>>,
}

impl EventTracker {
    pub fn new(api: Arc<ApiClient>, kind: EventKind) -> Self {
        Self {
            api,
            kind,
            inner: Mutex::new(TrackerState::default()),
        }
    }

    fn create_path(kind: EventKind) -> &'static str {
        match kind {
            EventKind::Pyramid => "/pyramid/event/create",
            EventKind::Vocabulary => "/vocabulary/event/create",
            EventKind::Writing => "/writing/event/create",
        }
    }

    /// Creates the backend event and spawns the periodic duration updater.
    /// Calling `start` on an already-started tracker returns the existing id.
    pub async fn start(&self) -> Result<EventId, ApiClientError> {
        {
            let guard = self.inner.lock().await;
            if let Some(event_id) = guard.event_id {
                return Ok(event_id);
            }
        }

        let created: CreateEventResponse = self
            .api
            .post_json(
                Self::create_path(self.kind),
                &CreateEventRequest { kind: self.kind },
            )
            .await?;
        let event_id = created.event_id;
        let started_at = Instant::now();

        let api = Arc::clone(&self.api);
        let updater = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DURATION_UPDATE_INTERVAL);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let duration_seconds = started_at.elapsed().as_secs() as u32;
                if let Err(err) = api
                    .put_unit(
                        &format!("/event/{}/update", event_id.0),
                        &UpdateEventRequest { duration_seconds },
                    )
                    .await
                {
                    warn!(event_id = event_id.0, "event duration update failed: {err}");
                }
            }
        });

        let mut guard = self.inner.lock().await;
        guard.event_id = Some(event_id);
        guard.started_at = Some(started_at);
        guard.completed = false;
        if let Some(previous) = guard.updater.replace(updater) {
            previous.abort();
        }
        info!(event_id = event_id.0, kind = ?self.kind, "learning event started");
        Ok(event_id)
    }

    /// Records one exercise step against the event. A tracker without a live
    /// event (creation failed or never started) skips the call.
    pub async fn add_step(
        &self,
        step_index: u32,
        selected_option: Option<u32>,
    ) -> Result<(), ApiClientError> {
        let event_id = {
            let guard = self.inner.lock().await;
            if guard.completed {
                return Ok(());
            }
            match guard.event_id {
                Some(event_id) => event_id,
                None => {
                    debug!("add_step skipped: no live event");
                    return Ok(());
                }
            }
        };
        self.api
            .put_unit(
                &format!("/event/{}/add-step", event_id.0),
                &AddEventStepRequest {
                    step_index,
                    selected_option,
                },
            )
            .await
    }

    /// Completes the event and stops the duration updater. Idempotent: a
    /// second call (or a call on a tracker that never started) returns
    /// `Ok(None)` without touching the network.
    pub async fn complete(&self) -> Result<Option<i64>, ApiClientError> {
        let (event_id, duration_seconds, updater) = {
            let mut guard = self.inner.lock().await;
            if guard.completed {
                return Ok(None);
            }
            let Some(event_id) = guard.event_id else {
                return Ok(None);
            };
            let duration_seconds = guard
                .started_at
                .map(|started| started.elapsed().as_secs() as u32)
                .unwrap_or(0);
            (event_id, duration_seconds, guard.updater.take())
        };
        if let Some(updater) = updater {
            updater.abort();
        }

        let response: CompleteEventResponse = self
            .api
            .post_json(
                &format!("/event/{}/complete", event_id.0),
                &CompleteEventRequest { duration_seconds },
            )
            .await?;
        self.inner.lock().await.completed = true;
        info!(
            event_id = event_id.0,
            duration_seconds,
            xp_awarded = response.xp_awarded,
            "learning event completed"
        );
        Ok(Some(response.xp_awarded))
    }

    pub async fn duration_seconds(&self) -> u32 {
        self.inner
            .lock()
            .await
            .started_at
            .map(|started| started.elapsed().as_secs() as u32)
            .unwrap_or(0)
    }

    pub async fn event_id(&self) -> Option<EventId> {
        self.inner.lock().await.event_id
    }

    pub async fn is_completed(&self) -> bool {
        self.inner.lock().await.completed
    }

    /// Stops the duration updater without completing the event; used when an
    /// exercise session is abandoned.
    pub async fn abort(&self) {
        if let Some(updater) = self.inner.lock().await.updater.take() {
            updater.abort();
        }
    }
}

impl Drop for EventTracker {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.inner.try_lock() {
            if let Some(updater) = guard.updater.take() {
                updater.abort();
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/session_events_tests.rs"]
mod tests;
