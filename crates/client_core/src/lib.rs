use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{PyramidId, StepType},
    protocol::{
        LoginRequest, PyramidSummary, QuizSummary, RegisterRequest, TokenPair, WritingEvaluation,
    },
};
use tokio::sync::broadcast;
use tracing::{info, warn};

pub mod http;
pub mod pyramid;
pub mod session_events;
pub mod vocabulary;
pub mod writing;

pub use http::{ApiClient, ApiClientError};
pub use pyramid::{PyramidCoordinator, PyramidFlowError, PyramidSnapshot, StepView, SubmitOutcome};
pub use session_events::EventTracker;
pub use vocabulary::{AnswerOutcome, QuizError, QuizSnapshot, VocabularyQuizCoordinator};
pub use writing::{WritingCoordinator, WritingError, WritingSnapshot};

/// Everything the UI layer can observe from the client core. Coordinators
/// also return results directly; the broadcast stream exists for screens that
/// react to activity they did not initiate.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    SessionStarted,
    SessionExpired,
    LoggedOut,
    PyramidLoaded { pyramid_id: PyramidId },
    PreviewReady { pyramid_id: PyramidId, for_step: u32 },
    StepTypeChanged { from: StepType, to: StepType },
    PyramidCompleted { summary: PyramidSummary },
    QuizCompleted { summary: QuizSummary },
    WritingEvaluated { evaluation: WritingEvaluation },
    ContentPolicyRejected { message: String },
    Error(String),
}

/// Device-level persistence for the session token pair. Real apps back this
/// with the platform keychain; the desktop build uses the sqlite preference
/// store.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load(&self) -> Result<Option<TokenPair>>;
    async fn save(&self, tokens: &TokenPair) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

/// Keeps tokens in memory only; a fresh login is required on every launch.
pub struct EphemeralTokenStore;

#[async_trait]
impl TokenStore for EphemeralTokenStore {
    async fn load(&self) -> Result<Option<TokenPair>> {
        Ok(None)
    }

    async fn save(&self, _tokens: &TokenPair) -> Result<()> {
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl TokenStore for storage::Preferences {
    async fn load(&self) -> Result<Option<TokenPair>> {
        Ok(self.stored_tokens().await?.map(|stored| TokenPair {
            access_token: stored.access_token,
            refresh_token: stored.refresh_token,
        }))
    }

    async fn save(&self, tokens: &TokenPair) -> Result<()> {
        self.save_tokens(&tokens.access_token, &tokens.refresh_token)
            .await
    }

    async fn clear(&self) -> Result<()> {
        self.clear_tokens().await
    }
}

/// Text-to-speech capability provider. The client core never talks to audio
/// hardware; it hands phrases to whatever the platform supplies.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn speak(&self, language: &str, phrases: &[String]) -> Result<()>;
}

pub struct MissingSpeechSynthesizer;

#[async_trait]
impl SpeechSynthesizer for MissingSpeechSynthesizer {
    async fn speak(&self, _language: &str, _phrases: &[String]) -> Result<()> {
        Err(anyhow!("speech synthesis is unavailable on this device"))
    }
}

/// Process-wide client facade: owns the authenticated transport and the event
/// stream, and spawns per-exercise coordinators that share both.
pub struct LearningClient {
    api: Arc<ApiClient>,
    speech: Arc<dyn SpeechSynthesizer>,
    events: broadcast::Sender<ClientEvent>,
}

impl LearningClient {
    pub fn new(base_url: impl Into<String>) -> Arc<Self> {
        Self::new_with_dependencies(
            base_url,
            Arc::new(EphemeralTokenStore),
            Arc::new(MissingSpeechSynthesizer),
        )
    }

    pub fn new_with_dependencies(
        base_url: impl Into<String>,
        token_store: Arc<dyn TokenStore>,
        speech: Arc<dyn SpeechSynthesizer>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let api = Arc::new(ApiClient::new(base_url, token_store, events.clone()));
        Arc::new(Self {
            api,
            speech,
            events,
        })
    }

    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn register(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> Result<(), ApiClientError> {
        let tokens: TokenPair = self
            .api
            .post_public(
                "/auth/register",
                &RegisterRequest {
                    email: email.to_string(),
                    password: password.to_string(),
                    display_name: display_name.to_string(),
                },
            )
            .await?;
        self.begin_session(tokens).await;
        Ok(())
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<(), ApiClientError> {
        let tokens: TokenPair = self
            .api
            .post_public(
                "/auth/login",
                &LoginRequest {
                    email: email.to_string(),
                    password: password.to_string(),
                },
            )
            .await?;
        self.begin_session(tokens).await;
        Ok(())
    }

    /// Loads a persisted session, if the token store has one. Returns whether
    /// a session is now active; the tokens may still be stale, in which case
    /// the first authenticated call runs the refresh path.
    pub async fn restore_session(&self) -> Result<bool> {
        let restored = self.api.restore_from_store().await?;
        if restored {
            info!("restored persisted session");
            let _ = self.events.send(ClientEvent::SessionStarted);
        }
        Ok(restored)
    }

    async fn begin_session(&self, tokens: TokenPair) {
        self.api.set_session(tokens, true).await;
        info!("session started");
        let _ = self.events.send(ClientEvent::SessionStarted);
    }

    /// Ends the session. The server-side revocation is best-effort; local
    /// teardown happens regardless.
    pub async fn logout(&self) {
        if self.api.has_session().await {
            if let Err(err) = self.api.post_empty("/auth/logout").await {
                warn!("logout call failed: {err}");
            }
        }
        self.api.clear_session().await;
        let _ = self.events.send(ClientEvent::LoggedOut);
    }

    pub async fn has_session(&self) -> bool {
        self.api.has_session().await
    }

    pub fn start_pyramid(&self, language: impl Into<String>) -> Arc<PyramidCoordinator> {
        PyramidCoordinator::new(
            Arc::clone(&self.api),
            Arc::clone(&self.speech),
            self.events.clone(),
            language.into(),
        )
    }

    pub fn start_vocabulary_quiz(&self) -> Arc<VocabularyQuizCoordinator> {
        VocabularyQuizCoordinator::new(Arc::clone(&self.api), self.events.clone())
    }

    pub fn start_writing(&self, language: impl Into<String>) -> Arc<WritingCoordinator> {
        WritingCoordinator::new(Arc::clone(&self.api), self.events.clone(), language.into())
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
