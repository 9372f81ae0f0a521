use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

pub const DEFAULT_MAX_HISTORY: u32 = 50;
pub const DEFAULT_MAX_ACTION_ROUNDS: u32 = 5;
pub const DEFAULT_ACTION_MAX_DEPTH: u32 = 10;
pub const DEFAULT_ACTION_MAX_LIMIT: u32 = 1000;
pub const DEFAULT_LOG_RETENTION_DAYS: u64 = 14;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_max_history")]
    pub max_history: u32,
    #[serde(default = "default_max_action_rounds")]
    pub max_action_rounds: u32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_history: DEFAULT_MAX_HISTORY,
            max_action_rounds: DEFAULT_MAX_ACTION_ROUNDS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionsConfig {
    #[serde(default = "default_action_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_action_max_limit")]
    pub max_limit: u32,
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_ACTION_MAX_DEPTH,
            max_limit: DEFAULT_ACTION_MAX_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsConfig {
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u64,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            retention_days: DEFAULT_LOG_RETENTION_DAYS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub actions: ActionsConfig,
    #[serde(default)]
    pub logs: LogsConfig,
}

impl AppConfig {
    /// History bound, clamped to the administrative range.
    pub fn effective_max_history(&self) -> usize {
        self.chat.max_history.clamp(1, 500) as usize
    }
}

fn default_max_history() -> u32 {
    DEFAULT_MAX_HISTORY
}

fn default_max_action_rounds() -> u32 {
    DEFAULT_MAX_ACTION_ROUNDS
}

fn default_action_max_depth() -> u32 {
    DEFAULT_ACTION_MAX_DEPTH
}

fn default_action_max_limit() -> u32 {
    DEFAULT_ACTION_MAX_LIMIT
}

fn default_log_retention_days() -> u64 {
    DEFAULT_LOG_RETENTION_DAYS
}

impl From<ProviderConfig> for duet_providers::ProviderConfig {
    fn from(value: ProviderConfig) -> Self {
        Self {
            api_key: value.api_key,
            base_url: value.base_url,
            default_model: value.default_model,
        }
    }
}

impl From<AppConfig> for duet_providers::AppConfig {
    fn from(value: AppConfig) -> Self {
        Self {
            providers: value
                .providers
                .into_iter()
                .map(|(k, v)| (k, v.into()))
                .collect(),
            default_provider: value.default_provider,
        }
    }
}

impl From<&AppConfig> for duet_actions::ActionLimits {
    fn from(value: &AppConfig) -> Self {
        Self {
            max_depth: value.actions.max_depth,
            max_limit: value.actions.max_limit,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    runtime: Value,
    cli: Value,
}

/// Layered JSON configuration. Later layers win: global file, project file,
/// environment, runtime patches, CLI overrides.
#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    global_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let project_path = path.as_ref().to_path_buf();
        if let Some(parent) = project_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let global_path = resolve_global_config_path().await?;

        let global = read_json_file(&global_path)
            .await
            .unwrap_or_else(|_| empty_object());
        let project = read_json_file(&project_path)
            .await
            .unwrap_or_else(|_| empty_object());

        let layers = ConfigLayers {
            global,
            project,
            env: env_layer(),
            runtime: empty_object(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };

        let store = Self {
            project_path,
            global_path,
            layers: Arc::new(RwLock::new(layers)),
        };
        store.save_project().await?;
        Ok(store)
    }

    pub async fn get(&self) -> AppConfig {
        let merged = self.get_effective_value().await;
        serde_json::from_value(merged).unwrap_or_default()
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.runtime);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        json!({
            "global": layers.global,
            "project": layers.project,
            "env": layers.env,
            "runtime": layers.runtime,
            "cli": layers.cli
        })
    }

    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
        }
        self.save_project().await?;
        Ok(self.get_effective_value().await)
    }

    pub async fn patch_global(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.global, &patch);
        }
        self.save_global().await?;
        Ok(self.get_effective_value().await)
    }

    pub async fn patch_runtime(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.runtime, &patch);
        }
        Ok(self.get_effective_value().await)
    }

    async fn save_project(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.project.clone();
        write_json_file(&self.project_path, &snapshot).await
    }

    async fn save_global(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.global.clone();
        write_json_file(&self.global_path, &snapshot).await
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| empty_object()))
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).await?;
    Ok(())
}

async fn resolve_global_config_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("DUET_GLOBAL_CONFIG") {
        let path = PathBuf::from(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        return Ok(path);
    }
    if let Some(config_dir) = dirs::config_dir() {
        let path = config_dir.join("duet").join("config.json");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        return Ok(path);
    }
    Ok(PathBuf::from(".duet/global_config.json"))
}

/// Environment overrides: provider API keys plus the Ollama endpoint.
fn env_layer() -> Value {
    let mut root = empty_object();

    for (provider, env_name) in [
        ("openai", "OPENAI_API_KEY"),
        ("qwen", "QWEN_API_KEY"),
        ("deepseek", "DEEPSEEK_API_KEY"),
        ("gemini", "GEMINI_API_KEY"),
    ] {
        if let Ok(api_key) = std::env::var(env_name) {
            if !api_key.trim().is_empty() {
                deep_merge(
                    &mut root,
                    &json!({
                        "providers": {
                            provider: { "api_key": api_key.trim() }
                        }
                    }),
                );
            }
        }
    }

    if let Ok(url) = std::env::var("OLLAMA_URL") {
        if !url.trim().is_empty() {
            deep_merge(
                &mut root,
                &json!({
                    "providers": {
                        "ollama": { "base_url": url.trim() }
                    }
                }),
            );
        }
    }

    root
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::{SystemTime, UNIX_EPOCH};

    // Tests below mutate process environment variables; serialize them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn unique_temp_file(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        path.push(format!("duet-core-config-{name}-{ts}.json"));
        path
    }

    #[test]
    fn deep_merge_overlays_nested_objects_and_skips_nulls() {
        let mut base = json!({
            "providers": {
                "openai": { "api_key": "file-key", "base_url": "https://a" }
            }
        });
        deep_merge(
            &mut base,
            &json!({
                "providers": {
                    "openai": { "api_key": "env-key", "base_url": null },
                    "ollama": { "base_url": "http://localhost:11434" }
                }
            }),
        );
        assert_eq!(base["providers"]["openai"]["api_key"], "env-key");
        assert_eq!(base["providers"]["openai"]["base_url"], "https://a");
        assert_eq!(
            base["providers"]["ollama"]["base_url"],
            "http://localhost:11434"
        );
    }

    #[test]
    fn app_config_defaults_are_populated() {
        let config: AppConfig = serde_json::from_value(json!({})).expect("parse");
        assert_eq!(config.chat.max_history, 50);
        assert_eq!(config.chat.max_action_rounds, 5);
        assert_eq!(config.actions.max_depth, 10);
        assert_eq!(config.actions.max_limit, 1000);
        assert_eq!(config.logs.retention_days, 14);
    }

    #[test]
    fn effective_max_history_is_clamped() {
        let mut config = AppConfig::default();
        config.chat.max_history = 0;
        assert_eq!(config.effective_max_history(), 1);
        config.chat.max_history = 9999;
        assert_eq!(config.effective_max_history(), 500);
        config.chat.max_history = 50;
        assert_eq!(config.effective_max_history(), 50);
    }

    #[tokio::test]
    async fn cli_layer_wins_over_project_file() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let global = unique_temp_file("global-cli");
        std::env::set_var("DUET_GLOBAL_CONFIG", &global);
        let path = unique_temp_file("cli");
        fs::write(
            &path,
            serde_json::to_string_pretty(&json!({
                "default_provider": "ollama",
                "providers": { "openai": { "default_model": "from-file" } }
            }))
            .expect("serialize"),
        )
        .await
        .expect("seed project file");

        let store = ConfigStore::new(
            &path,
            Some(json!({
                "default_provider": "openai",
                "providers": { "openai": { "default_model": "from-cli" } }
            })),
        )
        .await
        .expect("store");

        let config = store.get().await;
        assert_eq!(config.default_provider.as_deref(), Some("openai"));
        assert_eq!(
            config.providers["openai"].default_model.as_deref(),
            Some("from-cli")
        );

        std::env::remove_var("DUET_GLOBAL_CONFIG");
        let _ = fs::remove_file(&path).await;
        let _ = fs::remove_file(&global).await;
    }

    #[tokio::test]
    async fn env_api_key_wins_over_global_file() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let global = unique_temp_file("global-env");
        fs::write(
            &global,
            serde_json::to_string_pretty(&json!({
                "providers": { "qwen": { "api_key": "file-key" } }
            }))
            .expect("serialize"),
        )
        .await
        .expect("seed global file");
        std::env::set_var("DUET_GLOBAL_CONFIG", &global);
        std::env::set_var("QWEN_API_KEY", "env-key");

        let path = unique_temp_file("env");
        let store = ConfigStore::new(&path, None).await.expect("store");
        let config = store.get().await;
        assert_eq!(config.providers["qwen"].api_key.as_deref(), Some("env-key"));

        std::env::remove_var("QWEN_API_KEY");
        std::env::remove_var("DUET_GLOBAL_CONFIG");
        let _ = fs::remove_file(&path).await;
        let _ = fs::remove_file(&global).await;
    }

    #[tokio::test]
    async fn runtime_patch_applies_without_persisting() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let global = unique_temp_file("global-runtime");
        std::env::set_var("DUET_GLOBAL_CONFIG", &global);
        let path = unique_temp_file("runtime");
        let store = ConfigStore::new(&path, None).await.expect("store");

        store
            .patch_runtime(json!({ "chat": { "max_history": 7 } }))
            .await
            .expect("patch");
        assert_eq!(store.get().await.chat.max_history, 7);

        let on_disk = fs::read_to_string(&path).await.expect("read project file");
        assert!(!on_disk.contains("max_history"));

        std::env::remove_var("DUET_GLOBAL_CONFIG");
        let _ = fs::remove_file(&path).await;
        let _ = fs::remove_file(&global).await;
    }

    #[tokio::test]
    async fn patch_project_persists_to_disk() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let global = unique_temp_file("global-patch");
        std::env::set_var("DUET_GLOBAL_CONFIG", &global);
        let path = unique_temp_file("patch");
        let store = ConfigStore::new(&path, None).await.expect("store");

        store
            .patch_project(json!({ "providers": { "deepseek": { "default_model": "deepseek-coder" } } }))
            .await
            .expect("patch");

        let on_disk = fs::read_to_string(&path).await.expect("read project file");
        assert!(on_disk.contains("deepseek-coder"));

        std::env::remove_var("DUET_GLOBAL_CONFIG");
        let _ = fs::remove_file(&path).await;
        let _ = fs::remove_file(&global).await;
    }
}
