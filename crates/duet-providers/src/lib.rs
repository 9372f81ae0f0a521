use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::{pin::Pin, str};

use async_stream::stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use duet_types::ProviderInfo;
use duet_wire::{escape, extract_all_scalars, extract_array_field, extract_scalar};

const OLLAMA_DEFAULT_BASE_URL: &str = "http://localhost:11434";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    ConfigurationMissing(String),
    Transport(String),
    ProviderStatus { status: u16, body: String },
    UnsupportedContent(String),
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatError::ConfigurationMissing(item) => {
                write!(f, "missing configuration: {item}")
            }
            ChatError::Transport(detail) => write!(f, "transport failure: {detail}"),
            ChatError::ProviderStatus { status, body } => {
                if body.is_empty() {
                    write!(f, "provider responded with status {status}")
                } else {
                    write!(f, "provider responded with status {status}: {body}")
                }
            }
            ChatError::UnsupportedContent(detail) => {
                write!(f, "unsupported content: {detail}")
            }
        }
    }
}

impl std::error::Error for ChatError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Chunk(String),
    Error(ChatError),
    Done,
}

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn info(&self) -> ProviderInfo;

    /// Yields `Chunk` zero or more times, then at most one `Error`, then a
    /// terminal `Done`. Missing configuration is reported in-band without
    /// touching the network.
    async fn stream(&self, prompt: &str, context: &str, cancel: CancellationToken) -> EventStream;

    async fn send_blocking(&self, prompt: &str, context: &str) -> String {
        let mut events = self.stream(prompt, context, CancellationToken::new()).await;
        let mut out = String::new();
        while let Some(event) = events.next().await {
            match event {
                StreamEvent::Chunk(chunk) => out.push_str(&chunk),
                StreamEvent::Error(error) => {
                    out.push_str("\nERROR: ");
                    out.push_str(&error.to_string());
                }
                StreamEvent::Done => break,
            }
        }
        out
    }

    async fn set_model(&self, model: &str);

    async fn current_model(&self) -> String;

    async fn list_models(&self) -> Vec<String>;
}

#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Arc<RwLock<Vec<Arc<dyn ChatProvider>>>>,
    default_provider: Arc<RwLock<Option<String>>>,
}

impl ProviderRegistry {
    pub fn new(config: AppConfig) -> Self {
        let providers = build_providers(&config);
        Self {
            providers: Arc::new(RwLock::new(providers)),
            default_provider: Arc::new(RwLock::new(config.default_provider)),
        }
    }

    /// Builds a registry over an explicit provider set. The first provider is
    /// the fallback when no default is configured.
    pub fn from_providers(
        providers: Vec<Arc<dyn ChatProvider>>,
        default_provider: Option<String>,
    ) -> Self {
        Self {
            providers: Arc::new(RwLock::new(providers)),
            default_provider: Arc::new(RwLock::new(default_provider)),
        }
    }

    pub async fn reload(&self, config: AppConfig) {
        let rebuilt = build_providers(&config);
        *self.providers.write().await = rebuilt;
        *self.default_provider.write().await = config.default_provider;
    }

    pub async fn list(&self) -> Vec<ProviderInfo> {
        self.providers
            .read()
            .await
            .iter()
            .map(|p| p.info())
            .collect()
    }

    pub async fn select(&self, provider_id: Option<&str>) -> anyhow::Result<Arc<dyn ChatProvider>> {
        let providers = self.providers.read().await;
        let available = providers.iter().map(|p| p.info().id).collect::<Vec<_>>();

        if let Some(id) = provider_id {
            if let Some(provider) = providers.iter().find(|p| p.info().id == id) {
                return Ok(provider.clone());
            }
            anyhow::bail!(
                "provider `{}` is not configured. configured providers: {}",
                id,
                available.join(", ")
            );
        };

        let configured_default = self.default_provider.read().await.clone();
        if let Some(default_id) = configured_default {
            if let Some(provider) = providers.iter().find(|p| p.info().id == default_id) {
                return Ok(provider.clone());
            }
        };

        let Some(provider) = providers.first() else {
            anyhow::bail!("No provider configured.");
        };
        Ok(provider.clone())
    }
}

pub fn build_providers(config: &AppConfig) -> Vec<Arc<dyn ChatProvider>> {
    let mut providers: Vec<Arc<dyn ChatProvider>> = Vec::new();

    providers.push(Arc::new(OllamaProvider::new(
        config.providers.get("ollama").cloned().unwrap_or_default(),
    )));
    add_openai_compatible(
        config,
        &mut providers,
        "openai",
        "OpenAI",
        "https://api.openai.com/v1",
        "gpt-4o-mini",
        &["gpt-4o-mini", "gpt-4.1-mini", "gpt-4o"],
    );
    providers.push(Arc::new(GeminiProvider::new(
        config.providers.get("gemini").cloned().unwrap_or_default(),
    )));
    add_openai_compatible(
        config,
        &mut providers,
        "qwen",
        "Qwen",
        "https://dashscope.aliyuncs.com/compatible-mode/v1",
        "qwen-plus",
        &["qwen-plus", "qwen-max"],
    );
    add_openai_compatible(
        config,
        &mut providers,
        "deepseek",
        "DeepSeek",
        "https://api.deepseek.com/beta/v1",
        "deepseek-chat",
        &["deepseek-chat", "deepseek-coder"],
    );

    providers
}

fn add_openai_compatible(
    config: &AppConfig,
    providers: &mut Vec<Arc<dyn ChatProvider>>,
    id: &str,
    name: &str,
    default_url: &str,
    default_model: &str,
    catalog: &[&str],
) {
    let entry = config.providers.get(id).cloned().unwrap_or_default();
    let default_model = entry
        .default_model
        .unwrap_or_else(|| default_model.to_string());
    providers.push(Arc::new(OpenAiCompatibleProvider {
        id: id.to_string(),
        name: name.to_string(),
        base_url: entry.base_url.unwrap_or_else(|| default_url.to_string()),
        api_key: env_api_key_for_provider(id).or_else(|| {
            entry
                .api_key
                .as_deref()
                .filter(|key| !is_placeholder_api_key(key))
                .map(|key| key.to_string())
        }),
        catalog: catalog.iter().map(|m| m.to_string()).collect(),
        model: RwLock::new(default_model.clone()),
        default_model,
        client: Client::new(),
    }));
}

struct OpenAiCompatibleProvider {
    id: String,
    name: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    catalog: Vec<String>,
    model: RwLock<String>,
    client: Client,
}

#[async_trait]
impl ChatProvider for OpenAiCompatibleProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            ascii_only: false,
            requires_api_key: true,
        }
    }

    async fn stream(&self, prompt: &str, context: &str, cancel: CancellationToken) -> EventStream {
        let Some(api_key) = effective_key(self.api_key.as_deref()) else {
            return fail_fast(ChatError::ConfigurationMissing(format!(
                "{} API key",
                self.name
            )));
        };
        let Some(endpoint) = build_endpoint(&self.base_url, "/chat/completions") else {
            return fail_fast(ChatError::ConfigurationMissing(format!(
                "{} base URL",
                self.name
            )));
        };
        let Some(model) = effective_model(&self.model).await else {
            return fail_fast(ChatError::ConfigurationMissing(format!(
                "{} default model",
                self.name
            )));
        };

        let payload = openai_chat_payload(&model, context, prompt);
        let request = self
            .client
            .post(&endpoint)
            .header("Authorization", format!("Bearer {api_key}"))
            .header("Content-Type", "application/json")
            .body(payload);

        let sent = tokio::select! {
            _ = cancel.cancelled() => return already_done(),
            sent = request.send() => sent,
        };
        let response = match sent {
            Ok(response) => response,
            Err(err) => return fail_fast(ChatError::Transport(err.to_string())),
        };
        let status = response.status().as_u16();
        if status >= 400 {
            let body = response.text().await.unwrap_or_default();
            return fail_fast(provider_status_error(status, &body));
        }

        line_stream(response, cancel, sse_content_chunks)
    }

    async fn set_model(&self, model: &str) {
        let mut slot = self.model.write().await;
        *slot = resolved_model(model, &self.default_model);
    }

    async fn current_model(&self) -> String {
        self.model.read().await.clone()
    }

    async fn list_models(&self) -> Vec<String> {
        let mut candidates = vec![self.default_model.clone()];
        candidates.extend(self.catalog.iter().cloned());
        candidates.push(self.current_model().await);
        dedup_preserving_order(candidates)
    }
}

struct OllamaProvider {
    base_url: String,
    default_model: String,
    model: RwLock<String>,
    client: Client,
}

impl OllamaProvider {
    fn new(entry: ProviderConfig) -> Self {
        let default_model = entry
            .default_model
            .unwrap_or_else(|| "llama3.1:8b".to_string());
        Self {
            base_url: entry.base_url.unwrap_or_default(),
            model: RwLock::new(default_model.clone()),
            default_model,
            client: Client::new(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        let trimmed = self.base_url.trim();
        let base = if trimmed.is_empty() {
            OLLAMA_DEFAULT_BASE_URL
        } else {
            trimmed
        };
        build_endpoint(base, path)
            .unwrap_or_else(|| format!("{OLLAMA_DEFAULT_BASE_URL}{path}"))
    }
}

#[async_trait]
impl ChatProvider for OllamaProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "ollama".to_string(),
            name: "Ollama".to_string(),
            ascii_only: true,
            requires_api_key: false,
        }
    }

    async fn stream(&self, prompt: &str, context: &str, cancel: CancellationToken) -> EventStream {
        let endpoint = self.endpoint("/api/generate");
        let model = self.model.read().await.trim().to_string();
        let payload = ollama_generate_payload(&model, context, prompt);
        let request = self
            .client
            .post(&endpoint)
            .header("Content-Type", "application/json; charset=UTF-8")
            .body(payload);

        let sent = tokio::select! {
            _ = cancel.cancelled() => return already_done(),
            sent = request.send() => sent,
        };
        let response = match sent {
            Ok(response) => response,
            Err(err) => return fail_fast(ChatError::Transport(err.to_string())),
        };
        let status = response.status().as_u16();
        if status >= 400 {
            let body = response.text().await.unwrap_or_default();
            return fail_fast(provider_status_error(status, &body));
        }

        line_stream(response, cancel, ollama_response_chunks)
    }

    async fn set_model(&self, model: &str) {
        let mut slot = self.model.write().await;
        *slot = resolved_model(model, &self.default_model);
    }

    async fn current_model(&self) -> String {
        self.model.read().await.clone()
    }

    async fn list_models(&self) -> Vec<String> {
        let current = self.current_model().await;
        let endpoint = self.endpoint("/api/tags");
        let response = match self.client.get(&endpoint).send().await {
            Ok(response) => response,
            Err(_) => return dedup_preserving_order(vec![current]),
        };
        if !response.status().is_success() {
            return dedup_preserving_order(vec![current]);
        }
        let body = response.text().await.unwrap_or_default();
        let mut candidates = extract_array_field(&body, "name");
        candidates.push(current);
        dedup_preserving_order(candidates)
    }
}

struct GeminiProvider {
    api_key: Option<String>,
    base_url: String,
    default_model: String,
    catalog: Vec<String>,
    model: RwLock<String>,
    client: Client,
}

impl GeminiProvider {
    fn new(entry: ProviderConfig) -> Self {
        let default_model = entry
            .default_model
            .unwrap_or_else(|| "gemini-1.5-flash".to_string());
        Self {
            api_key: env_api_key_for_provider("gemini").or_else(|| {
                entry
                    .api_key
                    .as_deref()
                    .filter(|key| !is_placeholder_api_key(key))
                    .map(|key| key.to_string())
            }),
            base_url: entry
                .base_url
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            catalog: vec!["gemini-1.5-flash".to_string(), "gemini-1.5-pro".to_string()],
            model: RwLock::new(default_model.clone()),
            default_model,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl ChatProvider for GeminiProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "gemini".to_string(),
            name: "Gemini".to_string(),
            ascii_only: false,
            requires_api_key: true,
        }
    }

    // Gemini replies in one shot: the whole body is fetched, every "text"
    // value is decoded, and the joined result is delivered as a single chunk.
    async fn stream(&self, prompt: &str, context: &str, cancel: CancellationToken) -> EventStream {
        let Some(api_key) = effective_key(self.api_key.as_deref()) else {
            return fail_fast(ChatError::ConfigurationMissing("Gemini API key".to_string()));
        };
        if self.base_url.trim().is_empty() {
            return fail_fast(ChatError::ConfigurationMissing("Gemini base URL".to_string()));
        }
        let Some(model) = effective_model(&self.model).await else {
            return fail_fast(ChatError::ConfigurationMissing(
                "Gemini default model".to_string(),
            ));
        };
        let path = format!("/models/{model}:generateContent");
        let Some(endpoint) = build_endpoint(&self.base_url, &path) else {
            return fail_fast(ChatError::ConfigurationMissing("Gemini base URL".to_string()));
        };

        let url = format!("{endpoint}?key={api_key}");
        let payload = gemini_generate_payload(context, prompt);
        let request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .body(payload);

        let sent = tokio::select! {
            _ = cancel.cancelled() => return already_done(),
            sent = request.send() => sent,
        };
        let response = match sent {
            Ok(response) => response,
            Err(err) => return fail_fast(ChatError::Transport(err.to_string())),
        };
        let status = response.status().as_u16();
        if status >= 400 {
            let body = response.text().await.unwrap_or_default();
            return fail_fast(provider_status_error(status, &body));
        }

        let body = tokio::select! {
            _ = cancel.cancelled() => return already_done(),
            body = response.text() => body,
        };
        let body = match body {
            Ok(body) => body,
            Err(err) => return fail_fast(ChatError::Transport(err.to_string())),
        };
        let text = extract_gemini_text(&body);
        if text.trim().is_empty() {
            return already_done();
        }
        Box::pin(futures::stream::iter(vec![
            StreamEvent::Chunk(text),
            StreamEvent::Done,
        ]))
    }

    async fn set_model(&self, model: &str) {
        let mut slot = self.model.write().await;
        *slot = resolved_model(model, &self.default_model);
    }

    async fn current_model(&self) -> String {
        self.model.read().await.clone()
    }

    async fn list_models(&self) -> Vec<String> {
        let mut candidates = vec![self.default_model.clone()];
        candidates.extend(self.catalog.iter().cloned());
        candidates.push(self.current_model().await);
        dedup_preserving_order(candidates)
    }
}

fn line_stream(
    response: reqwest::Response,
    cancel: CancellationToken,
    extract: fn(&str) -> Vec<String>,
) -> EventStream {
    let mut bytes = response.bytes_stream();
    let stream = stream! {
        let mut buffer = String::new();
        let mut flush_tail = true;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    flush_tail = false;
                    break;
                }
                next = bytes.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    yield StreamEvent::Error(ChatError::Transport(err.to_string()));
                    flush_tail = false;
                    break;
                }
            };
            buffer.push_str(str::from_utf8(&chunk).unwrap_or_default());
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim_end_matches('\r').to_string();
                buffer = buffer[pos + 1..].to_string();
                for piece in extract(&line) {
                    yield StreamEvent::Chunk(piece);
                }
            }
        }
        if flush_tail {
            let tail = buffer.trim_end_matches('\r').to_string();
            if !tail.is_empty() {
                for piece in extract(&tail) {
                    yield StreamEvent::Chunk(piece);
                }
            }
        }
        yield StreamEvent::Done;
    };
    Box::pin(stream)
}

fn sse_content_chunks(line: &str) -> Vec<String> {
    if !line.starts_with("data: ") || line.contains("[DONE]") {
        return Vec::new();
    }
    extract_all_scalars(line, "content")
        .into_iter()
        .filter(|piece| !piece.is_empty())
        .collect()
}

fn ollama_response_chunks(line: &str) -> Vec<String> {
    if !line.contains("\"response\"") {
        return Vec::new();
    }
    extract_scalar(line, "response").into_iter().collect()
}

pub fn openai_chat_payload(model: &str, context: &str, prompt: &str) -> String {
    format!(
        "{{\"model\":\"{}\",\"stream\":true,\"messages\":[{{\"role\":\"system\",\"content\":\"{}\"}},{{\"role\":\"user\",\"content\":\"{}\"}}]}}",
        model,
        escape(context),
        escape(prompt)
    )
}

pub fn ollama_generate_payload(model: &str, context: &str, prompt: &str) -> String {
    format!(
        "{{\"model\":\"{}\",\"prompt\":\"{}\\n\\n{}\",\"stream\":true}}",
        model,
        escape(context),
        escape(prompt)
    )
}

pub fn gemini_generate_payload(context: &str, prompt: &str) -> String {
    format!(
        "{{\"contents\":[{{\"role\":\"user\",\"parts\":[{{\"text\":\"{}\\n\\n{}\"}}]}}]}}",
        escape(context),
        escape(prompt)
    )
}

fn extract_gemini_text(body: &str) -> String {
    let marker = "\"text\"";
    let mut full = String::new();
    let mut index = 0;

    while let Some(found) = body[index..].find(marker) {
        let after_marker = index + found + marker.len();
        let Some(open) = body[after_marker..].find('"') else {
            break;
        };
        let value_start = after_marker + open + 1;

        let mut chunk = String::new();
        let mut escaping = false;
        let mut next_index = body.len();
        for (offset, c) in body[value_start..].char_indices() {
            if escaping {
                match c {
                    'n' => chunk.push('\n'),
                    't' => chunk.push('\t'),
                    'r' => {}
                    '"' => chunk.push('"'),
                    '\\' => chunk.push('\\'),
                    other => chunk.push(other),
                }
                escaping = false;
                continue;
            }
            if c == '\\' {
                escaping = true;
                continue;
            }
            if c == '"' {
                next_index = value_start + offset + 1;
                break;
            }
            chunk.push(c);
        }
        index = next_index;

        if !chunk.is_empty() {
            if !full.is_empty() {
                full.push('\n');
            }
            full.push_str(&chunk);
        }
    }

    full
}

fn fail_fast(error: ChatError) -> EventStream {
    Box::pin(futures::stream::iter(vec![
        StreamEvent::Error(error),
        StreamEvent::Done,
    ]))
}

fn already_done() -> EventStream {
    Box::pin(futures::stream::iter(vec![StreamEvent::Done]))
}

fn provider_status_error(status: u16, body: &str) -> ChatError {
    ChatError::ProviderStatus {
        status,
        body: truncate_for_error(body.trim(), 500),
    }
}

// Trim, collapse trailing slashes, and append the path unless the base
// already ends with it.
fn build_endpoint(base: &str, path: &str) -> Option<String> {
    let trimmed = base.trim();
    if trimmed.is_empty() {
        return None;
    }
    let normalized = trimmed.trim_end_matches('/');
    if normalized.is_empty() {
        return None;
    }
    if normalized.ends_with(path) {
        return Some(normalized.to_string());
    }
    Some(format!("{normalized}{path}"))
}

async fn effective_model(slot: &RwLock<String>) -> Option<String> {
    let current = slot.read().await.trim().to_string();
    if current.is_empty() {
        None
    } else {
        Some(current)
    }
}

fn resolved_model(input: &str, default_model: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        default_model.to_string()
    } else {
        trimmed.to_string()
    }
}

fn effective_key(key: Option<&str>) -> Option<String> {
    key.map(str::trim)
        .filter(|k| !k.is_empty())
        .map(|k| k.to_string())
}

fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}

fn env_api_key_for_provider(id: &str) -> Option<String> {
    let env_name = match id {
        "openai" => Some("OPENAI_API_KEY"),
        "qwen" => Some("QWEN_API_KEY"),
        "deepseek" => Some("DEEPSEEK_API_KEY"),
        "gemini" => Some("GEMINI_API_KEY"),
        _ => None,
    }?;
    std::env::var(env_name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn dedup_preserving_order(candidates: Vec<String>) -> Vec<String> {
    let mut ordered: Vec<String> = Vec::new();
    for candidate in candidates {
        let trimmed = candidate.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !ordered.iter().any(|existing| existing == trimmed) {
            ordered.push(trimmed.to_string());
        }
    }
    ordered
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    // Walk back to a char boundary so multibyte bodies cannot panic the slice.
    let mut cut = max_len;
    while !input.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &input[..cut])
}
