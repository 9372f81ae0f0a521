use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use uuid::Uuid;

use duet_actions::{ActionDispatcher, ActionLimits, Workspace};
use duet_observability::{emit_event, ObservabilityEvent, ProcessKind};
use duet_providers::{ChatError, ChatProvider, ProviderRegistry, StreamEvent};
use duet_types::{ChatMessage, EngineEvent, ProviderInfo};

use crate::{
    limit_context, sanitize_for_local, trim_history, AppConfig, CancellationRegistry,
    ContextBuilder, EventBus, HistoryStore,
};

const SNIPPET_MAX_CHARS: usize = 140;
const HISTORY_SEARCH_MAX_HITS: usize = 20;

/// Engine knobs resolved from configuration at construction time.
#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub max_history: usize,
    pub max_action_rounds: u32,
    pub list_depth: u32,
    pub list_limit: u32,
}

impl From<&AppConfig> for ChatSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_history: config.effective_max_history(),
            max_action_rounds: config.chat.max_action_rounds,
            list_depth: config.actions.max_depth.clamp(1, 10),
            list_limit: config.actions.max_limit.clamp(10, 1000),
        }
    }
}

struct ActiveChain {
    id: String,
    cancel: CancellationToken,
}

struct EngineState {
    history: Vec<ChatMessage>,
    provider: Arc<dyn ChatProvider>,
    chain: Option<ActiveChain>,
    models_generation: u64,
}

enum SendOutcome {
    Skipped,
    Failed,
    Superseded,
    Shorthand(String),
    Completed {
        reply: String,
        followup: Option<String>,
    },
}

/// Streaming chat session over one active provider. A send turns into a chain
/// of provider calls: the model's reply may carry one `[ACTION:...]` directive,
/// whose result is fed back as a follow-up round, up to the configured bound.
#[derive(Clone)]
pub struct ChatEngine {
    providers: ProviderRegistry,
    workspace: Arc<dyn Workspace>,
    dispatcher: Arc<ActionDispatcher>,
    history_store: HistoryStore,
    context: ContextBuilder,
    event_bus: EventBus,
    settings: ChatSettings,
    project: String,
    state: Arc<RwLock<EngineState>>,
    cancellations: CancellationRegistry,
}

impl ChatEngine {
    pub async fn new(
        config: &AppConfig,
        providers: ProviderRegistry,
        workspace: Arc<dyn Workspace>,
        history_store: HistoryStore,
        event_bus: EventBus,
        project: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let settings = ChatSettings::from(config);
        let dispatcher = Arc::new(ActionDispatcher::new(
            workspace.clone(),
            ActionLimits::from(config),
        )?);
        let provider = providers.select(None).await?;
        let project = project.into();
        let history = history_store.load(&project, settings.max_history).await;

        Ok(Self {
            providers,
            workspace: workspace.clone(),
            dispatcher,
            history_store,
            context: ContextBuilder::new(workspace),
            event_bus,
            settings,
            project,
            state: Arc::new(RwLock::new(EngineState {
                history,
                provider,
                chain: None,
                models_generation: 0,
            })),
            cancellations: CancellationRegistry::new(),
        })
    }

    /// Sends a user message and drives the full action chain to completion.
    /// The whole chain, follow-up rounds included, runs under one chain token
    /// and one cancellation token. Returns the final assistant reply, or an
    /// empty string when the send was a no-op, failed in-band, or was
    /// superseded by a newer send.
    pub async fn send(&self, text: &str) -> anyhow::Result<String> {
        let chain_id = Uuid::new_v4().to_string();
        let cancel = self.cancellations.create(&chain_id).await;
        {
            // A new user-initiated send supersedes the prior chain's
            // bookkeeping without cancelling its network operation.
            let mut state = self.state.write().await;
            state.chain = Some(ActiveChain {
                id: chain_id.clone(),
                cancel: cancel.clone(),
            });
        }

        let result = self.run_chain(text, &chain_id, &cancel).await;

        {
            let mut state = self.state.write().await;
            if state.chain.as_ref().map(|c| c.id.as_str()) == Some(chain_id.as_str()) {
                state.chain = None;
            }
        }
        self.cancellations.remove(&chain_id).await;
        result
    }

    async fn run_chain(
        &self,
        text: &str,
        chain_id: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        let mut current = text.to_string();
        let mut echo = true;
        let mut rounds_left = self.settings.max_action_rounds;
        let mut last_reply = String::new();

        loop {
            if cancel.is_cancelled() {
                return Ok(last_reply);
            }
            match self.send_once(&current, echo, chain_id, cancel).await? {
                SendOutcome::Skipped | SendOutcome::Failed | SendOutcome::Superseded => {
                    return Ok(last_reply);
                }
                SendOutcome::Shorthand(output) => return Ok(output),
                SendOutcome::Completed { reply, followup } => {
                    last_reply = reply;
                    match followup {
                        Some(next) if rounds_left > 0 => {
                            rounds_left -= 1;
                            current = next;
                            echo = false;
                        }
                        Some(_) => {
                            self.notice(&format!(
                                "action limit reached after {} rounds",
                                self.settings.max_action_rounds
                            ));
                            return Ok(last_reply);
                        }
                        None => return Ok(last_reply),
                    }
                }
            }
        }
    }

    async fn send_once(
        &self,
        text: &str,
        echo: bool,
        chain_id: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<SendOutcome> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(SendOutcome::Skipped);
        }

        if echo && trimmed.starts_with('/') {
            if let Some(output) = self.handle_shorthand(trimmed).await {
                return Ok(SendOutcome::Shorthand(output));
            }
        }

        let provider = { self.state.read().await.provider.clone() };
        let info = provider.info();
        let model = provider.current_model().await;

        let prompt = if info.ascii_only {
            let sanitized = sanitize_for_local(trimmed);
            if sanitized.is_empty() {
                self.event_bus.publish(EngineEvent::new(
                    "session.status",
                    json!({"status": "error", "notice": "message dropped: unsupported characters"}),
                ));
                return Ok(SendOutcome::Failed);
            }
            sanitized
        } else {
            trimmed.to_string()
        };

        let history_snapshot = {
            let mut state = self.state.write().await;
            state.history.push(ChatMessage::user(trimmed));
            trim_history(&mut state.history, self.settings.max_history);
            state.history.clone()
        };
        self.history_store
            .save(&self.project, &history_snapshot, self.settings.max_history)
            .await?;

        let mut context = self.context.build(&history_snapshot).await;
        if info.ascii_only {
            context = sanitize_for_local(&context);
        }
        let context = limit_context(&context);
        let estimated_tokens = (context.len() + prompt.len()) / 4;

        self.event_bus.publish(EngineEvent::new(
            "stream.started",
            json!({
                "chainID": chain_id,
                "provider": info.id,
                "model": model,
            }),
        ));
        self.event_bus.publish(EngineEvent::new(
            "session.status",
            json!({"status": "running", "estimatedTokens": estimated_tokens}),
        ));
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "provider.call.start",
                component: "core.engine",
                correlation_id: None,
                session_id: Some(&self.project),
                chain_id: Some(chain_id),
                provider_id: Some(&info.id),
                model_id: Some(&model),
                status: Some("start"),
                error_code: None,
                detail: Some("chat send dispatch"),
            },
        );

        let mut stream = provider.stream(&prompt, &context, cancel.clone()).await;
        let mut buffer = String::new();
        let mut failed = false;
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Chunk(delta) => {
                    let active = {
                        let state = self.state.read().await;
                        state.chain.as_ref().map(|c| c.id.clone())
                    };
                    if active.as_deref() != Some(chain_id) {
                        return Ok(SendOutcome::Superseded);
                    }
                    if buffer.is_empty() {
                        emit_event(
                            Level::INFO,
                            ProcessKind::Engine,
                            ObservabilityEvent {
                                event: "provider.call.first_byte",
                                component: "core.engine",
                                correlation_id: None,
                                session_id: Some(&self.project),
                                chain_id: Some(chain_id),
                                provider_id: Some(&info.id),
                                model_id: Some(&model),
                                status: Some("streaming"),
                                error_code: None,
                                detail: Some("first chunk"),
                            },
                        );
                    }
                    buffer.push_str(&delta);
                    self.event_bus.publish(EngineEvent::new(
                        "message.delta",
                        json!({
                            "chainID": chain_id,
                            "delta": delta,
                            "progress": buffer.len() / 4,
                        }),
                    ));
                }
                StreamEvent::Error(error) => {
                    let error_text = error.to_string();
                    self.event_bus.publish(EngineEvent::new(
                        "stream.error",
                        json!({"chainID": chain_id, "error": error_text}),
                    ));
                    self.event_bus.publish(EngineEvent::new(
                        "session.status",
                        json!({"status": "error", "notice": error_text}),
                    ));
                    emit_event(
                        Level::ERROR,
                        ProcessKind::Engine,
                        ObservabilityEvent {
                            event: "provider.call.error",
                            component: "core.engine",
                            correlation_id: None,
                            session_id: Some(&self.project),
                            chain_id: Some(chain_id),
                            provider_id: Some(&info.id),
                            model_id: Some(&model),
                            status: Some("failed"),
                            error_code: Some(provider_error_code(&error)),
                            detail: Some(&error_text),
                        },
                    );
                    failed = true;
                }
                StreamEvent::Done => break,
            }
        }

        if failed {
            return Ok(SendOutcome::Failed);
        }

        let snapshot = {
            let mut state = self.state.write().await;
            if state.chain.as_ref().map(|c| c.id.as_str()) != Some(chain_id) {
                None
            } else {
                state.history.push(ChatMessage::assistant(buffer.clone()));
                trim_history(&mut state.history, self.settings.max_history);
                Some(state.history.clone())
            }
        };
        let Some(snapshot) = snapshot else {
            return Ok(SendOutcome::Superseded);
        };
        self.history_store
            .save(&self.project, &snapshot, self.settings.max_history)
            .await?;

        let followup = self.dispatcher.run(&buffer).await;
        self.event_bus.publish(EngineEvent::new(
            "stream.finished",
            json!({"chainID": chain_id, "chars": buffer.len()}),
        ));
        if let Some(result) = followup.as_ref() {
            self.event_bus.publish(EngineEvent::new(
                "action.dispatched",
                json!({"chainID": chain_id, "resultChars": result.len()}),
            ));
        }
        self.event_bus.publish(EngineEvent::new(
            "session.status",
            json!({"status": "idle"}),
        ));
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "provider.call.finish",
                component: "core.engine",
                correlation_id: None,
                session_id: Some(&self.project),
                chain_id: Some(chain_id),
                provider_id: Some(&info.id),
                model_id: Some(&model),
                status: Some("ok"),
                error_code: None,
                detail: Some("provider stream complete"),
            },
        );

        Ok(SendOutcome::Completed {
            reply: buffer,
            followup,
        })
    }

    /// Cancels the in-flight chain, if any. Safe to call repeatedly.
    pub async fn cancel(&self) {
        let chain = { self.state.write().await.chain.take() };
        if let Some(chain) = chain {
            chain.cancel.cancel();
            self.cancellations.remove(&chain.id).await;
            self.event_bus.publish(EngineEvent::new(
                "session.status",
                json!({"status": "cancelled"}),
            ));
        }
    }

    pub async fn switch_provider(&self, provider_id: &str) -> anyhow::Result<ProviderInfo> {
        let provider = self.providers.select(Some(provider_id)).await?;
        let info = provider.info();
        let generation = {
            let mut state = self.state.write().await;
            state.provider = provider;
            state.models_generation += 1;
            state.models_generation
        };
        self.notice(&format!("provider switched to {}", info.id));
        let engine = self.clone();
        tokio::spawn(async move {
            engine.refresh_models(generation).await;
        });
        Ok(info)
    }

    /// Publishes the active provider's model catalog, unless a newer provider
    /// switch has happened since `generation` was taken.
    pub async fn refresh_models(&self, generation: u64) {
        let provider = { self.state.read().await.provider.clone() };
        let info = provider.info();
        let models = provider.list_models().await;
        {
            let state = self.state.read().await;
            if state.models_generation != generation {
                return;
            }
        }
        self.event_bus.publish(EngineEvent::new(
            "models.updated",
            json!({"provider": info.id, "models": models}),
        ));
    }

    pub async fn set_model(&self, model: &str) {
        let provider = { self.state.read().await.provider.clone() };
        provider.set_model(model).await;
        let effective = provider.current_model().await;
        self.notice(&format!("model set to {effective}"));
    }

    pub async fn list_models(&self) -> Vec<String> {
        let provider = { self.state.read().await.provider.clone() };
        provider.list_models().await
    }

    pub async fn current_provider(&self) -> ProviderInfo {
        self.state.read().await.provider.info()
    }

    pub async fn history(&self) -> Vec<ChatMessage> {
        self.state.read().await.history.clone()
    }

    pub async fn clear_history(&self) -> anyhow::Result<()> {
        self.state.write().await.history.clear();
        self.history_store.clear(&self.project).await?;
        self.notice(&format!("history cleared for project {}", self.project));
        Ok(())
    }

    fn notice(&self, text: &str) -> String {
        self.event_bus.publish(EngineEvent::new(
            "session.status",
            json!({"status": "notice", "notice": text}),
        ));
        text.to_string()
    }

    async fn commit_assistant(&self, content: &str) {
        let snapshot = {
            let mut state = self.state.write().await;
            state.history.push(ChatMessage::assistant(content));
            trim_history(&mut state.history, self.settings.max_history);
            state.history.clone()
        };
        let _ = self
            .history_store
            .save(&self.project, &snapshot, self.settings.max_history)
            .await;
    }

    /// Services `/`-prefixed shorthands locally. Returns `None` for unknown
    /// commands, which then go to the provider as ordinary text.
    async fn handle_shorthand(&self, message: &str) -> Option<String> {
        let parts: Vec<&str> = message.split_whitespace().collect();
        let cmd = parts.first()?.to_lowercase();
        let project = self.workspace.active_project_name().await;

        {
            let mut state = self.state.write().await;
            state.history.push(ChatMessage::user(message));
            trim_history(&mut state.history, self.settings.max_history);
        }

        let output = match cmd.as_str() {
            "/read" => {
                if parts.len() < 2 {
                    self.notice("Usage: /read <relative-path>")
                } else if project.is_empty() {
                    self.notice("No active project in the editor")
                } else {
                    let path = parts[1..].join(" ");
                    let content = self.workspace.read_file(&project, &path).await;
                    if content.trim().is_empty() {
                        self.notice(&format!("Could not read {path}"))
                    } else {
                        content
                    }
                }
            }
            "/list" => {
                if project.is_empty() {
                    self.notice("No active project in the editor")
                } else {
                    let depth =
                        parse_or_default(&parts, 1, self.settings.list_depth).clamp(1, 10);
                    let limit =
                        parse_or_default(&parts, 2, self.settings.list_limit).clamp(10, 1000);
                    self.workspace
                        .list_project_tree(&project, depth, limit)
                        .await
                }
            }
            "/ctx" => self.workspace.read_workspace_snapshot().await,
            "/doc" => {
                let path = parts.get(1).copied().unwrap_or("README.md");
                if project.is_empty() {
                    self.notice("No active project in the editor")
                } else {
                    let content = self.workspace.read_file(&project, path).await;
                    if content.trim().is_empty() {
                        self.notice(&format!("Could not read {path}"))
                    } else {
                        content
                    }
                }
            }
            "/recent" => {
                let n = parse_or_default(&parts, 1, 5).clamp(1, 20) as usize;
                let tail = {
                    let state = self.state.read().await;
                    let start = state.history.len().saturating_sub(n);
                    state.history[start..].to_vec()
                };
                let mut out = String::new();
                for msg in &tail {
                    out.push_str(msg.role.as_str());
                    out.push_str(": ");
                    out.push_str(&snippet(&msg.content));
                    out.push('\n');
                }
                out
            }
            "/history" => {
                if parts.len() < 2 {
                    self.notice("Usage: /history <term>")
                } else {
                    let term = parts[1..].join(" ").to_lowercase();
                    let hits = {
                        let state = self.state.read().await;
                        let mut out = String::new();
                        let mut count = 0usize;
                        for msg in &state.history {
                            if msg.content.to_lowercase().contains(&term) {
                                out.push_str(msg.role.as_str());
                                out.push_str(": ");
                                out.push_str(&snippet(&msg.content));
                                out.push('\n');
                                count += 1;
                                if count >= HISTORY_SEARCH_MAX_HITS {
                                    break;
                                }
                            }
                        }
                        (out, count)
                    };
                    if hits.1 == 0 {
                        self.notice(&format!("No matches for '{term}'"))
                    } else {
                        hits.0
                    }
                }
            }
            "/clearhistory" => {
                self.state.write().await.history.clear();
                let _ = self.history_store.clear(&self.project).await;
                let label = if project.is_empty() { "global" } else { &project };
                self.notice(&format!("History cleared for project {label}"))
            }
            _ => {
                let mut state = self.state.write().await;
                state.history.pop();
                return None;
            }
        };

        // Every serviced shorthand leaves both turns in the persisted history;
        // /clearhistory already wrote the cleared state.
        if cmd != "/clearhistory" {
            self.commit_assistant(&output).await;
        }

        Some(output)
    }
}

fn parse_or_default(parts: &[&str], index: usize, default: u32) -> u32 {
    parts
        .get(index)
        .and_then(|raw| raw.parse::<u32>().ok())
        .unwrap_or(default)
}

fn snippet(text: &str) -> String {
    let clean = text.replace('\n', " ");
    if clean.chars().count() <= SNIPPET_MAX_CHARS {
        return clean;
    }
    let mut out: String = clean.chars().take(SNIPPET_MAX_CHARS).collect();
    out.push('…');
    out
}

fn provider_error_code(error: &ChatError) -> &'static str {
    match error {
        ChatError::ConfigurationMissing(_) => "CONFIGURATION_MISSING",
        ChatError::Transport(_) => "TRANSPORT_FAILURE",
        ChatError::ProviderStatus { status, .. } => match status {
            401 | 403 => "AUTHENTICATION_ERROR",
            429 => "RATE_LIMIT_EXCEEDED",
            500..=599 => "PROVIDER_SERVER_ERROR",
            _ => "PROVIDER_STATUS",
        },
        ChatError::UnsupportedContent(_) => "UNSUPPORTED_CONTENT",
    }
}
