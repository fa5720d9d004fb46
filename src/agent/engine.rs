use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::prompt::{self, INITIAL_PROMPT, NUDGE};
use crate::agent::tools::{ToolContext, ToolRegistry};
use crate::image_store::{ImageReference, ImageStore};
use crate::models::{LanguageModel, ModelError, ModelReply, ModelRequest, ToolDeclaration};
use crate::report::FinalReport;
use crate::search::SearchProvider;
use crate::session::{Role, Session, SessionState, ToolCallRequest, TurnContent};
use crate::settings::EffectiveSettings;
use crate::telemetry;
use crate::transcript::{EventKind, TranscriptEvent, TranscriptSink};

/// Longest tool output shown to the observer; history keeps the full text.
const RESULT_PREVIEW_CHARS: usize = 200;

/// Collaborators shared by every session in the process.
#[derive(Clone)]
pub struct Services {
    pub model: Arc<dyn LanguageModel>,
    pub search: Arc<dyn SearchProvider>,
    pub tools: Arc<ToolRegistry>,
    pub images: ImageStore,
    pub settings: Arc<EffectiveSettings>,
}

/// Drives one session through its states. Each `step` performs exactly one
/// transition; `run` steps until a terminal state or cancellation.
pub struct SessionEngine {
    session: Session,
    services: Services,
    sink: TranscriptSink,
    cancel: CancellationToken,
    source: Option<ImageReference>,
    system_instruction: String,
    declarations: Vec<ToolDeclaration>,
    turns: u32,
    pending: Option<ToolCallRequest>,
}

impl SessionEngine {
    pub fn new(services: Services, image_ref: impl Into<String>, sink: TranscriptSink, cancel: CancellationToken) -> Self {
        let system_instruction = prompt::system_instruction(services.settings.shown_dimensions);
        let declarations = services.tools.declarations();
        Self {
            session: Session::new(image_ref),
            services,
            sink,
            cancel,
            source: None,
            system_instruction,
            declarations,
            turns: 0,
            pending: None,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn run(mut self) -> Session {
        let cancel = self.cancel.clone();
        while !self.session.state.is_terminal() {
            if self.sink.is_closed() {
                self.abort();
                break;
            }
            let cancelled = tokio::select! {
                biased;
                _ = cancel.cancelled() => true,
                _ = self.step() => false,
            };
            if cancelled {
                self.abort();
            }
        }
        self.session
    }

    pub async fn step(&mut self) -> SessionState {
        match self.session.state {
            SessionState::Idle => self.start(),
            SessionState::AwaitingModel => self.await_model().await,
            SessionState::DispatchingTool => self.dispatch_tool().await,
            SessionState::Complete | SessionState::Failed(_) | SessionState::Aborted => {}
        }
        self.session.state.clone()
    }

    fn start(&mut self) {
        metrics::counter!(telemetry::SESSIONS_STARTED_TOTAL).increment(1);
        info!(
            session_id = %self.session.id,
            image = %self.session.image_ref,
            model = self.services.model.name(),
            "session started"
        );
        self.sink
            .emit_text(EventKind::System, format!("--- Recon (Powered by {}) ---", self.services.settings.model));
        self.sink.emit_text(EventKind::System, "Loading image...");

        match self.services.images.open(&self.session.image_ref) {
            Ok(image) => {
                self.sink
                    .emit_text(EventKind::System, format!("Image loaded: {} ({})", image.id, image.dimensions));
                self.session.append(Role::User, TurnContent::ImagePrompt {
                    image: image.clone(),
                    text: INITIAL_PROMPT.into(),
                });
                self.sink.emit_text(EventKind::User, INITIAL_PROMPT);
                self.source = Some(image);
                self.session.state = SessionState::AwaitingModel;
            }
            Err(e) => self.fail(format!("could not load image `{}`: {e}", self.session.image_ref)),
        }
    }

    async fn await_model(&mut self) {
        let limit = self.services.settings.max_turns;
        if self.turns >= limit {
            self.fail(format!("turn limit exceeded ({limit} turns)"));
            return;
        }
        self.turns += 1;
        self.sink.emit_text(EventKind::TurnStart, format!("--- Turn {} ---", self.turns));
        debug!(session_id = %self.session.id, turn = self.turns, history = self.session.history().len(), "calling model");

        match self.call_model().await {
            Ok(reply) => self.apply_reply(reply),
            Err(e) => self.fail(format!("model call failed: {e}")),
        }
    }

    async fn call_model(&self) -> Result<ModelReply, ModelError> {
        let settings = &self.services.settings;
        let request = ModelRequest {
            model: &settings.model,
            system_instruction: &self.system_instruction,
            tools: &self.declarations,
            params: &settings.model_params,
            history: self.session.history(),
        };
        let mut attempt = 0;
        loop {
            metrics::counter!(telemetry::MODEL_CALLS_TOTAL).increment(1);
            let outcome = tokio::time::timeout(settings.model_timeout, self.services.model.generate(&request))
                .await
                .unwrap_or_else(|_| Err(ModelError::Timeout(settings.model_timeout)));
            match outcome {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_retryable() && attempt < settings.model_retries => {
                    attempt += 1;
                    warn!(session_id = %self.session.id, turn = self.turns, attempt, error = %e, "model call failed, retrying");
                    tokio::time::sleep(settings.model_retry_backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn apply_reply(&mut self, reply: ModelReply) {
        match reply {
            ModelReply::Thought { text } => {
                self.session.append(Role::Model, TurnContent::Text { text: text.clone() });
                self.sink.emit_text(EventKind::AgentThought, text);
                self.session.append(Role::User, TurnContent::Text { text: NUDGE.into() });
                self.sink.emit_text(EventKind::User, NUDGE);
            }
            ModelReply::ToolCall { request, reasoning } => {
                info!(session_id = %self.session.id, turn = self.turns, tool = %request.name, "tool requested");
                if let Some(r) = &reasoning {
                    self.sink.emit_text(EventKind::AgentThought, r.clone());
                }
                let rendered = request.render();
                self.session.append(Role::Model, TurnContent::ToolCall { reasoning, request: request.clone() });
                self.sink.emit_text(EventKind::ToolCall, rendered);
                self.pending = Some(request);
                self.session.state = SessionState::DispatchingTool;
            }
            ModelReply::Final { text, report } => {
                self.session.append(Role::Model, TurnContent::Text { text: text.clone() });
                self.sink.emit_text(EventKind::AgentThought, text);
                self.complete(&report);
            }
        }
    }

    async fn dispatch_tool(&mut self) {
        let (Some(request), Some(source)) = (self.pending.take(), self.source.as_ref()) else {
            self.session.state = SessionState::AwaitingModel;
            return;
        };
        let ctx = ToolContext {
            images: &self.services.images,
            search: self.services.search.as_ref(),
            source,
            settings: &self.services.settings,
        };
        let result = self.services.tools.execute(ctx, &request.name, request.args).await;
        debug!(session_id = %self.session.id, tool = %result.tool, ok = result.ok, "tool finished");

        let shown = preview(result.payload.text());
        let image_url = result.image().map(ImageReference::url);
        self.session.append(Role::Tool, TurnContent::ToolResult { result });
        self.sink.emit_text(EventKind::ToolResult, shown);
        if let Some(url) = image_url {
            self.sink.emit(TranscriptEvent::new_image(url));
        }
        self.session.state = SessionState::AwaitingModel;
    }

    fn complete(&mut self, report: &FinalReport) {
        metrics::counter!(telemetry::SESSIONS_FINISHED_TOTAL, "outcome" => "complete").increment(1);
        info!(session_id = %self.session.id, turns = self.turns, located = report.has_location(), "session complete");
        let banner = if report.has_location() {
            "[Process Completed - Final Answer Found]"
        } else {
            "[Process Completed - Unable to Geolocate]"
        };
        self.session.state = SessionState::Complete;
        self.sink.emit_text(EventKind::System, banner);
        self.sink.emit_text(EventKind::SessionEnd, report.summary());
    }

    fn fail(&mut self, reason: String) {
        metrics::counter!(telemetry::SESSIONS_FINISHED_TOTAL, "outcome" => "failed").increment(1);
        error!(session_id = %self.session.id, turns = self.turns, %reason, "session failed");
        self.sink.emit_text(EventKind::Error, reason.clone());
        self.sink.emit_text(EventKind::SessionEnd, format!("Session failed: {reason}"));
        self.session.state = SessionState::Failed(reason);
    }

    fn abort(&mut self) {
        metrics::counter!(telemetry::SESSIONS_FINISHED_TOTAL, "outcome" => "aborted").increment(1);
        info!(session_id = %self.session.id, turns = self.turns, "session aborted");
        self.pending = None;
        self.session.state = SessionState::Aborted;
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() <= RESULT_PREVIEW_CHARS {
        return text.to_string();
    }
    let head: String = text.chars().take(RESULT_PREVIEW_CHARS).collect();
    format!("{head}...")
}
